//! Unlock options: the entitlement entries gating tunnel access.
//!
//! Each entry couples an unlock condition (active subscription, running
//! companion app, installed partner app) with a lazily evaluated checker
//! supplied by the service side, plus the display metadata the dialog side
//! needs. Entries are replaced wholesale whenever the entitlement sources
//! change.
//!
//! Display-side entries (no checker) persist to a JSON file so the unlock
//! dialog can render before the service reports fresh entries:
//!
//! ```text
//! {
//!   "Subscription":        {"display": true, "priority": 50},
//!   "Companion":           {"display": true, "priority": 10, "referrer": "…"},
//!   "AppInstall.com.some": {"display": true, "priority": 80,
//!                           "appId": "com.some", "appName": "…", "storeUrl": "…"}
//! }
//! ```

use serde_json::{Map, Value, json};
use std::collections::{BTreeSet, HashMap};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, warn};

/// Key of the subscription entry.
pub const ENTRY_SUBSCRIPTION: &str = "Subscription";
/// Key of the companion app entry.
pub const ENTRY_COMPANION: &str = "Companion";
/// Key prefix of app-install entries; the rest of the key is the package id.
pub const APP_INSTALL_PREFIX: &str = "AppInstall.";

// Default priorities when not specified in the persisted JSON (the lower
// the number, the higher the display priority).
pub const DEFAULT_COMPANION_PRIORITY: i32 = 10;
pub const DEFAULT_SUBSCRIPTION_PRIORITY: i32 = 50;
pub const DEFAULT_APP_INSTALL_PRIORITY: i32 = 80;

/// Lazily evaluated entitlement predicate. Must not block; it is invoked
/// synchronously on whatever thread asks.
pub type Checker = Arc<dyn Fn() -> bool + Send + Sync>;

/// What a given unlock entry unlocks with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnlockKind {
    Subscription,
    CompanionApp {
        /// Install referrer forwarded to the store page, if any.
        referrer: Option<String>,
    },
    AppInstall {
        package_id: String,
        app_name: String,
        store_url: String,
    },
}

impl UnlockKind {
    /// The mapping key this kind is stored under.
    pub fn key(&self) -> String {
        match self {
            UnlockKind::Subscription => ENTRY_SUBSCRIPTION.to_string(),
            UnlockKind::CompanionApp { .. } => ENTRY_COMPANION.to_string(),
            UnlockKind::AppInstall { package_id, .. } => {
                format!("{APP_INSTALL_PREFIX}{package_id}")
            }
        }
    }

    pub fn default_priority(&self) -> i32 {
        match self {
            UnlockKind::CompanionApp { .. } => DEFAULT_COMPANION_PRIORITY,
            UnlockKind::Subscription => DEFAULT_SUBSCRIPTION_PRIORITY,
            UnlockKind::AppInstall { .. } => DEFAULT_APP_INSTALL_PRIORITY,
        }
    }
}

/// One unlock option.
#[derive(Clone)]
pub struct UnlockEntry {
    pub kind: UnlockKind,
    /// Whether the dialog should show this entry. Hidden entries still
    /// participate in the unlock check.
    pub display: bool,
    /// Display order; lower sorts first.
    pub priority: i32,
    checker: Option<Checker>,
}

impl UnlockEntry {
    /// Service-side constructor.
    pub fn with_checker(kind: UnlockKind, display: bool, priority: i32, checker: Checker) -> Self {
        Self {
            kind,
            display,
            priority,
            checker: Some(checker),
        }
    }

    /// Display-side constructor, used when rendering from persisted state.
    pub fn display_only(kind: UnlockKind, display: bool, priority: i32) -> Self {
        Self {
            kind,
            display,
            priority,
            checker: None,
        }
    }

    pub fn is_displayable(&self) -> bool {
        self.display
    }

    /// Evaluate the checker. Display-only entries are never satisfied.
    pub fn is_satisfied(&self) -> bool {
        self.checker.as_ref().map(|checker| checker()).unwrap_or(false)
    }
}

/// Errors persisting unlock options.
#[derive(Debug, Error)]
pub enum UnlockStoreError {
    #[error("failed to write unlock options: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode unlock options: {0}")]
    Encode(#[from] serde_json::Error),
}

/// The current set of unlock options.
#[derive(Default)]
pub struct UnlockOptions {
    entries: HashMap<String, UnlockEntry>,
}

impl UnlockOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace all entries wholesale.
    pub fn set_entries(&mut self, entries: HashMap<String, UnlockEntry>) {
        self.entries = entries;
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Whether the unlock dialog must be shown: false when there is nothing
    /// to unlock against or any checker passes; true only when every
    /// checker fails.
    pub fn unlock_required(&self) -> bool {
        if self.entries.is_empty() {
            return false;
        }
        !self.entries.values().any(UnlockEntry::is_satisfied)
    }

    /// Snapshot of the current keys.
    pub fn active_keys(&self) -> BTreeSet<String> {
        self.entries.keys().cloned().collect()
    }

    pub fn has_subscription_entry(&self) -> bool {
        self.entries.contains_key(ENTRY_SUBSCRIPTION)
    }

    pub fn has_companion_entry(&self) -> bool {
        self.entries.contains_key(ENTRY_COMPANION)
    }

    pub fn has_app_install_entries(&self) -> bool {
        self.entries
            .keys()
            .any(|key| key.starts_with(APP_INSTALL_PREFIX))
    }

    pub fn is_entry_displayable(&self, key: &str) -> bool {
        self.entries
            .get(key)
            .is_some_and(UnlockEntry::is_displayable)
    }

    pub fn has_displayable_entries(&self) -> bool {
        self.entries.values().any(UnlockEntry::is_displayable)
    }

    /// Entries sorted by display priority, highest priority (lowest
    /// number) first.
    pub fn entries_by_priority(&self) -> Vec<(String, UnlockEntry)> {
        let mut entries: Vec<_> = self
            .entries
            .iter()
            .map(|(key, entry)| (key.clone(), entry.clone()))
            .collect();
        entries.sort_by_key(|(_, entry)| entry.priority);
        entries
    }

    /// Encode the display side of the current entries as JSON.
    pub fn to_json_string(&self) -> Result<String, UnlockStoreError> {
        let mut object = Map::new();
        for (key, entry) in &self.entries {
            let mut encoded = Map::new();
            encoded.insert("display".to_string(), json!(entry.display));
            encoded.insert("priority".to_string(), json!(entry.priority));
            match &entry.kind {
                UnlockKind::Subscription => {}
                UnlockKind::CompanionApp { referrer } => {
                    if let Some(referrer) = referrer {
                        encoded.insert("referrer".to_string(), json!(referrer));
                    }
                }
                UnlockKind::AppInstall {
                    package_id,
                    app_name,
                    store_url,
                } => {
                    encoded.insert("appId".to_string(), json!(package_id));
                    encoded.insert("appName".to_string(), json!(app_name));
                    encoded.insert("storeUrl".to_string(), json!(store_url));
                }
            }
            object.insert(key.clone(), Value::Object(encoded));
        }
        Ok(serde_json::to_string(&Value::Object(object))?)
    }

    /// Decode display-side entries from JSON. Unknown keys and app-install
    /// entries with missing fields are skipped with a warning.
    pub fn from_json_str(raw: &str) -> Result<Self, UnlockStoreError> {
        let parsed: Value = serde_json::from_str(raw)?;
        let mut entries = HashMap::new();

        let Some(object) = parsed.as_object() else {
            warn!("unlock options JSON is not an object, ignoring");
            return Ok(Self { entries });
        };

        for (key, encoded) in object {
            let display = encoded
                .get("display")
                .and_then(Value::as_bool)
                .unwrap_or(true);
            let explicit_priority = encoded
                .get("priority")
                .and_then(Value::as_i64)
                .map(|p| p as i32);
            let field = |name: &str| {
                encoded
                    .get(name)
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string()
            };

            let kind = if key == ENTRY_SUBSCRIPTION {
                UnlockKind::Subscription
            } else if key == ENTRY_COMPANION {
                let referrer = field("referrer");
                UnlockKind::CompanionApp {
                    referrer: (!referrer.is_empty()).then_some(referrer),
                }
            } else if key.starts_with(APP_INSTALL_PREFIX) {
                let (package_id, app_name, store_url) =
                    (field("appId"), field("appName"), field("storeUrl"));
                if package_id.is_empty() || app_name.is_empty() || store_url.is_empty() {
                    warn!("skipping app install unlock entry with empty fields: {key}");
                    continue;
                }
                UnlockKind::AppInstall {
                    package_id,
                    app_name,
                    store_url,
                }
            } else {
                warn!("skipping unlock entry of unknown kind: {key}");
                continue;
            };

            let priority = explicit_priority.unwrap_or_else(|| kind.default_priority());
            entries.insert(key.clone(), UnlockEntry::display_only(kind, display, priority));
        }

        Ok(Self { entries })
    }

    /// Persist the display side of the current entries, atomically.
    pub fn save_to_file(&self, path: &Path) -> Result<(), UnlockStoreError> {
        let encoded = self.to_json_string()?;
        let temp = path.with_extension("tmp");
        fs::write(&temp, encoded)?;
        if let Err(e) = fs::rename(&temp, path) {
            let _ = fs::remove_file(&temp);
            return Err(e.into());
        }
        Ok(())
    }

    /// Load persisted entries. Returns empty options when the file is
    /// missing or corrupt, logging the error.
    pub fn load_from_file(path: &Path) -> Self {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::new(),
            Err(e) => {
                error!("failed to read unlock options: {e}");
                return Self::new();
            }
        };
        match Self::from_json_str(&raw) {
            Ok(options) => options,
            Err(e) => {
                error!("failed to parse unlock options: {e}");
                Self::new()
            }
        }
    }

    /// Delete persisted entries, tolerating a missing file.
    pub fn clear_file(path: &Path) {
        if let Err(e) = fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("failed to delete unlock options file: {e}");
            }
        }
    }
}
