//! Trusted package records.
//!
//! Maps package identifiers to the SHA-256 digests of their expected signing
//! certificates. Digests are formatted as colon-separated uppercase hex
//! pairs, the same format [`crate::format_certificate_digest`] produces.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;
use tracing::info;

/// Package identifier of the privileged companion app.
pub const COMPANION_PACKAGE: &str = "org.veilvpn.relay";

/// Release signing digest of the companion app.
const COMPANION_DIGEST: &str = "4E:2A:61:0C:8F:33:97:D1:5B:C0:74:E8:12:AF:69:DD:\
3B:05:C8:26:7F:94:E1:48:0A:B3:5D:C2:71:8E:46:F9";

/// A package → expected-digest-set mapping.
pub type SignatureMap = BTreeMap<String, BTreeSet<String>>;

/// The two-layer trusted package table.
///
/// Lookups merge the builtin layer (loaded at process start, never mutated)
/// with the runtime layer (replaced wholesale via
/// [`configure_runtime_signatures`](Self::configure_runtime_signatures)).
pub struct TrustedPackages {
    builtin: SignatureMap,
    runtime: Mutex<SignatureMap>,
}

impl TrustedPackages {
    /// The table shipped with the client.
    pub fn builtin() -> Self {
        let mut map = SignatureMap::new();
        map.insert(
            COMPANION_PACKAGE.to_string(),
            BTreeSet::from([COMPANION_DIGEST.to_string()]),
        );
        Self::with_entries(map)
    }

    /// Build a table from an explicit builtin layer.
    pub fn with_entries(builtin: SignatureMap) -> Self {
        Self {
            builtin,
            runtime: Mutex::new(SignatureMap::new()),
        }
    }

    /// All digests currently accepted for `package_id`, merging both layers.
    /// Empty when the package is not trusted at all.
    pub fn expected_digests(&self, package_id: &str) -> BTreeSet<String> {
        let mut digests = self
            .builtin
            .get(package_id)
            .cloned()
            .unwrap_or_default();
        if let Some(runtime) = self.runtime.lock().unwrap().get(package_id) {
            digests.extend(runtime.iter().cloned());
        }
        digests
    }

    /// Whether any layer has an entry for `package_id`.
    pub fn is_trusted_package(&self, package_id: &str) -> bool {
        self.builtin.contains_key(package_id)
            || self.runtime.lock().unwrap().contains_key(package_id)
    }

    /// Replace the runtime layer wholesale.
    pub fn configure_runtime_signatures(&self, signatures: SignatureMap) {
        info!(
            "loaded runtime signatures for {} packages",
            signatures.len()
        );
        *self.runtime.lock().unwrap() = signatures;
    }
}
