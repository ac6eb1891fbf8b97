//! Platform IPC seams for the companion service binding.
//!
//! The platform side implements these traits; the link only drives them.
//! Bind completion is asynchronous: the platform reports it through
//! [`BindingEvents`] on whatever thread it dispatches callbacks on.

use std::sync::Arc;
use thiserror::Error;

/// A remote call to the companion process failed.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// The remote process died before or during the call. Expected during
    /// teardown and tolerated silently.
    #[error("remote object is dead")]
    DeadObject,

    #[error("remote call failed: {0}")]
    Failed(String),
}

/// A bind request was rejected synchronously.
#[derive(Debug, Error)]
pub enum BindRequestError {
    #[error("bind request rejected")]
    Rejected,

    #[error("security exception requesting bind: {0}")]
    Security(String),
}

/// Unbinding failed.
#[derive(Debug, Error)]
pub enum UnbindError {
    /// There was no active binding to release.
    #[error("not currently bound")]
    NotBound,
}

/// Callback registered with the companion service; the service pushes
/// serialized state records through it.
pub trait StateCallback: Send + Sync {
    fn on_state_update(&self, payload: &str);
}

/// Live handle to the companion state service, valid while bound.
pub trait CompanionService: Send + Sync {
    fn register_client(&self, client: Arc<dyn StateCallback>) -> Result<(), RemoteError>;
    fn unregister_client(&self, client: Arc<dyn StateCallback>) -> Result<(), RemoteError>;
}

/// Binding lifecycle events, delivered by the platform.
pub trait BindingEvents: Send + Sync {
    /// The bind completed; `service` is live until `on_disconnected`.
    fn on_connected(&self, service: Arc<dyn CompanionService>);

    /// The companion process died without an explicit unbind.
    fn on_disconnected(&self);
}

/// Platform binding seam for the companion state service.
pub trait CompanionBinder: Send + Sync {
    /// Whether the companion advertises the state service endpoint. An
    /// installed companion without the endpoint is a version mismatch.
    fn endpoint_available(&self) -> bool;

    /// Request a bind with auto-create semantics. Completion is reported
    /// asynchronously through `events`.
    fn request_bind(&self, events: Arc<dyn BindingEvents>) -> Result<(), BindRequestError>;

    /// Release the active binding.
    fn unbind(&self) -> Result<(), UnbindError>;
}
