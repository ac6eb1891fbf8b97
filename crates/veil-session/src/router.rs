//! Native packet router seam and log bridging.
//!
//! The router is a native library (tun2socks-style) that reads IP packets
//! from a TUN descriptor and forwards them through a local SOCKS proxy and
//! UDP gateway. It has process-global state: `run` blocks the calling
//! thread until `terminate` is invoked from elsewhere.

use crate::host::TunHandle;
use std::net::{Ipv4Addr, SocketAddr};
use tracing::{error, info, trace, warn};

/// Parameters for one router run.
pub struct RouterParams {
    /// Duplicated TUN descriptor. The router owns it and closes it when the
    /// run loop exits.
    pub tun: Box<dyn TunHandle>,
    pub mtu: u16,
    /// In-tunnel router address.
    pub router_address: Ipv4Addr,
    pub netmask: Ipv4Addr,
    /// Local SOCKS endpoint to forward TCP flows to.
    pub socks_server: SocketAddr,
    /// Local UDP gateway endpoint.
    pub udpgw_server: SocketAddr,
    /// Intercept DNS and route it through the UDP gateway.
    pub transparent_dns: bool,
}

/// The native packet routing engine.
pub trait PacketRouter: Send + Sync {
    /// Run the router until [`terminate`](Self::terminate) is called.
    /// Blocks the calling thread for the whole run.
    fn run(&self, params: RouterParams);

    /// Signal the run loop to exit.
    fn terminate(&self);
}

// Level names as defined in the native code:
// { NULL, "ERROR", "WARNING", "NOTICE", "INFO", "DEBUG" }
/// Map a native router log level onto a tracing level.
pub fn router_log_level(level: &str) -> tracing::Level {
    match level {
        "ERROR" => tracing::Level::ERROR,
        "WARNING" => tracing::Level::WARN,
        "NOTICE" | "INFO" => tracing::Level::INFO,
        "DEBUG" => tracing::Level::TRACE,
        _ => tracing::Level::INFO,
    }
}

/// Upward logging callback for the native router.
pub fn forward_router_log(level: &str, channel: &str, message: &str) {
    let line = format!("packet router: {level}({channel}): {message}");
    match router_log_level(level) {
        tracing::Level::ERROR => error!("{line}"),
        tracing::Level::WARN => warn!("{line}"),
        tracing::Level::TRACE => trace!("{line}"),
        _ => info!("{line}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_router_log_level_mapping() {
        assert_eq!(router_log_level("ERROR"), tracing::Level::ERROR);
        assert_eq!(router_log_level("WARNING"), tracing::Level::WARN);
        assert_eq!(router_log_level("NOTICE"), tracing::Level::INFO);
        assert_eq!(router_log_level("INFO"), tracing::Level::INFO);
        assert_eq!(router_log_level("DEBUG"), tracing::Level::TRACE);
        assert_eq!(router_log_level("whatever"), tracing::Level::INFO);
    }
}
