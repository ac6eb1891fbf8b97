//! Companion service state and payload decoding.
//!
//! The companion service pushes opaque serialized records versioned by a
//! schema number:
//!
//! ```text
//! {
//!   "schema": 1,        // data schema version
//!   "data": { ... }     // schema-specific payload
//! }
//! ```
//!
//! Schema 1's `data` is `{"appVersion": <int>, "running": <bool>}` with
//! `running` omitted when the companion does not know its proxy status.

use serde::Deserialize;
use thiserror::Error;

/// Highest payload schema version this client understands.
pub const STATE_SCHEMA_VERSION: i64 = 1;

/// Decoded schema-1 state pushed by the companion service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateReport {
    /// Companion app version code.
    pub app_version: i64,
    /// Proxy running status; `None` when the companion reported unknown.
    pub running: Option<bool>,
}

/// An element of the companion link's state stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    /// No bind has been attempted yet.
    Idle,
    /// A bind request is in flight.
    Connecting,
    /// Bound to the companion state service.
    Connected,
    /// The companion process went away unexpectedly; a reconnect is pending.
    Disconnected,
    /// State pushed by the companion over the live binding.
    Report(StateReport),
    /// A pushed payload could not be decoded. The binding itself is still
    /// healthy, so this does not end the stream.
    DataError(String),
    /// The companion package is not installed.
    NotInstalled,
    /// The companion is installed but does not advertise the state service
    /// endpoint; it is too old (or too new) for this client.
    UpgradeRequired,
    /// The installed companion package failed signature verification.
    TrustFailed(String),
    /// Bind attempts failed too many times in a row.
    RetriesExhausted,
}

impl ServiceState {
    /// Terminal states end the state stream; a fresh link is required to
    /// try again once the external condition changes.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ServiceState::NotInstalled
                | ServiceState::UpgradeRequired
                | ServiceState::TrustFailed(_)
                | ServiceState::RetriesExhausted
        )
    }

    /// Whether the companion reported its proxy as running.
    pub fn is_companion_running(&self) -> bool {
        matches!(
            self,
            ServiceState::Report(StateReport {
                running: Some(true),
                ..
            })
        )
    }
}

/// Errors decoding a pushed state payload.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("failed to parse state payload: {0}")]
    Json(#[from] serde_json::Error),

    #[error("unsupported schema version: {0}")]
    UnsupportedSchema(i64),
}

#[derive(Deserialize)]
struct Envelope {
    schema: i64,
    data: serde_json::Value,
}

#[derive(Deserialize)]
struct ReportV1 {
    #[serde(rename = "appVersion")]
    app_version: i64,
    #[serde(default)]
    running: Option<bool>,
}

impl StateReport {
    /// Decode a pushed payload, selecting the decoder for its declared
    /// schema version.
    pub fn parse(payload: &str) -> Result<Self, ParseError> {
        let envelope: Envelope = serde_json::from_str(payload)?;
        match envelope.schema {
            1 => {
                let report: ReportV1 = serde_json::from_value(envelope.data)?;
                Ok(StateReport {
                    app_version: report.app_version,
                    running: report.running,
                })
            }
            other => Err(ParseError::UnsupportedSchema(other)),
        }
    }
}
