//! VPN Session Management
//!
//! Owns the TUN interface lifecycle and the native packet router lifecycle.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                    Client Process                        │
//! │                                                          │
//! │  ┌──────────┐ builds ┌─────────────┐  dup  ┌──────────┐ │
//! │  │ VpnHost  │───────▶│  TUN iface  │──────▶│  Packet  │ │
//! │  │ (weak)   │        │ (one open   │  fd   │  Router  │ │
//! │  └──────────┘        │  descriptor)│       │ (native, │ │
//! │                      └─────────────┘       │  global) │ │
//! │                                            └────┬─────┘ │
//! └─────────────────────────────────────────────────│───────┘
//!                                                   ▼
//!                                     127.0.0.1:<socks> / :7300 (udpgw)
//! ```
//!
//! The router library carries process-global state, so the manager is a
//! process-wide singleton: only one instance ever calls into it. The
//! manager keeps the original TUN descriptor for the whole session and
//! hands the router a duplicate on every start, because the router closes
//! whatever descriptor it was given when it stops.

mod address;
mod host;
mod manager;
mod router;

pub use address::{AddressError, InterfaceScanner, PrivateAddressBlock, select_private_address};
pub use host::{BuildError, TunInterfaceBuilder, TunHandle, VpnHost};
pub use manager::{EstablishError, TUN_MTU, TunStatus, UDPGW_PORT, VpnSessionManager};
pub use router::{PacketRouter, RouterParams, forward_router_log, router_log_level};
