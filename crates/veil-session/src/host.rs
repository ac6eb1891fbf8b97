//! Host binding and platform TUN seams.
//!
//! The host is whatever platform component is privileged to create VPN
//! interfaces (on Android, the foreground VPN service). The manager holds
//! only a weak reference to it so the session core never keeps a dead host
//! alive; a host that has gone away is a silent no-op for diagnostics and a
//! hard error for interface establishment.

use std::io;
use std::net::Ipv4Addr;
use thiserror::Error;

/// The platform refused to create the interface.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The app is no longer prepared to run a VPN or was revoked, e.g.
    /// another VPN app superseded it.
    #[error("application is no longer prepared or was revoked")]
    Revoked,
}

/// An open TUN descriptor.
///
/// Dropping the handle closes the descriptor; close errors are ignored.
/// Duplicates share the underlying interface but close independently,
/// which is what lets the router's stop close its copy while the session
/// keeps the original.
pub trait TunHandle: Send {
    /// Duplicate the descriptor.
    fn duplicate(&self) -> io::Result<Box<dyn TunHandle>>;

    /// Raw descriptor value handed across the native boundary.
    fn raw_fd(&self) -> i32;
}

/// Platform VPN interface construction primitive.
pub trait TunInterfaceBuilder: Send {
    fn set_mtu(&mut self, mtu: u16);
    fn add_address(&mut self, address: Ipv4Addr, prefix_length: u8);
    fn add_route(&mut self, destination: Ipv4Addr, prefix_length: u8);
    fn add_dns_server(&mut self, server: Ipv4Addr);

    /// Create the interface, consuming the builder.
    fn establish(self: Box<Self>) -> Result<Box<dyn TunHandle>, BuildError>;
}

/// The host service the manager is bound to.
pub trait VpnHost: Send + Sync {
    /// A fresh builder for the platform VPN interface.
    fn interface_builder(&self) -> Box<dyn TunInterfaceBuilder>;

    /// Display name for the session, used in logs and platform UI.
    fn session_name(&self) -> String;

    /// Sink for user-facing diagnostic messages.
    fn report_diagnostic(&self, message: &str);
}
