//! Persistence of the runtime trust layer.
//!
//! The signature map is stored as JSON (`{"<package>": ["<digest>", …]}`).
//! Writes go to a temporary file in the same directory followed by an
//! atomic rename, so a concurrent reader never observes a partial file.

use crate::records::SignatureMap;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use thiserror::Error;
use tracing::{error, warn};

/// Errors from persisting the signature map.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to write signatures file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode signatures: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Save a signature map to `path`, atomically.
pub fn save_signatures(path: &Path, signatures: &SignatureMap) -> Result<(), StoreError> {
    let mut object = Map::new();
    for (package, digests) in signatures {
        object.insert(
            package.clone(),
            json!(digests.iter().collect::<Vec<_>>()),
        );
    }
    let encoded = serde_json::to_string(&Value::Object(object))?;

    let temp = path.with_extension("tmp");
    fs::write(&temp, encoded)?;
    if let Err(e) = fs::rename(&temp, path) {
        let _ = fs::remove_file(&temp);
        return Err(e.into());
    }
    Ok(())
}

/// Load a signature map from `path`.
///
/// Returns an empty map when the file is missing or unreadable; a corrupt
/// file is logged and also yields an empty map, so callers never fail on a
/// bad persisted state.
pub fn load_signatures(path: &Path) -> SignatureMap {
    let raw = match fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return BTreeMap::new(),
        Err(e) => {
            error!("failed to read signatures file: {e}");
            return BTreeMap::new();
        }
    };

    let parsed: Value = match serde_json::from_str(&raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("failed to parse signatures file: {e}");
            return BTreeMap::new();
        }
    };

    let Some(object) = parsed.as_object() else {
        warn!("signatures file is not a JSON object, ignoring");
        return BTreeMap::new();
    };

    let mut signatures = SignatureMap::new();
    for (package, digests) in object {
        let Some(entries) = digests.as_array() else {
            warn!("signatures entry for {package} is not an array, skipping");
            continue;
        };
        let digests: BTreeSet<String> = entries
            .iter()
            .filter_map(|d| d.as_str().map(str::to_string))
            .collect();
        signatures.insert(package.clone(), digests);
    }
    signatures
}
