//! Companion Service Link
//!
//! Maintains a live binding to the privileged companion app's state service
//! and exposes what it learns as a state stream.
//!
//! # State machine
//!
//! ```text
//!                 ┌──────────────────────────────────────┐
//!                 ▼                                      │
//! Idle ──▶ Connecting ──▶ Connected ──▶ Disconnected ────┘ (retry, ≤3)
//!            │                                │
//!            │ pre-bind checks                │ attempts exhausted
//!            ▼                                ▼
//!   NotInstalled / TrustFailed /       RetriesExhausted
//!   UpgradeRequired
//! ```
//!
//! Terminal states end the stream; transient binding failures are retried
//! with a fixed delay. Trust and installation failures are never retried —
//! they cannot heal without the user reinstalling or upgrading the
//! companion app.
//!
//! # Usage
//!
//! ```rust,ignore
//! let link = CompanionLink::new(binder, verifier, COMPANION_PACKAGE);
//!
//! // Subscribing cold-starts the bind; dropping the last stream stops it.
//! let mut states = link.state_stream();
//! while let Some(state) = states.next().await {
//!     println!("companion: {state:?}");
//! }
//! ```

mod ipc;
mod link;
mod state;

pub use ipc::{
    BindRequestError, BindingEvents, CompanionBinder, CompanionService, RemoteError,
    StateCallback, UnbindError,
};
pub use link::CompanionLink;
pub use state::{ParseError, STATE_SCHEMA_VERSION, ServiceState, StateReport};
