//! The VPN session manager.
//!
//! Creates the VPN interface, starts the packet router to route traffic
//! through it, and stops the router again. The manager is a process-wide
//! singleton accessed via [`VpnSessionManager::initialize`]; a host must be
//! registered with [`register_host`](VpnSessionManager::register_host)
//! before the interface can be established.

use crate::address::{AddressError, InterfaceScanner, PrivateAddressBlock, select_private_address};
use crate::host::{TunHandle, VpnHost};
use crate::router::{PacketRouter, RouterParams};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// MTU configured on the VPN interface.
pub const TUN_MTU: u16 = 1500;

/// Local UDP gateway port.
pub const UDPGW_PORT: u16 = 7300;

const TUN_NETMASK: Ipv4Addr = Ipv4Addr::new(255, 255, 255, 0);

/// Lifecycle of the TUN interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunStatus {
    /// No interface has been established yet.
    Uninitialized,
    /// The interface is open but traffic is not being routed.
    Established,
    /// The packet router is forwarding traffic from the interface.
    RoutingActive,
    /// The interface was closed.
    TornDown,
}

impl TunStatus {
    pub fn is_established(&self) -> bool {
        matches!(self, TunStatus::Established | TunStatus::RoutingActive)
    }
}

/// Errors establishing the VPN interface. Fatal to the attempt; retry
/// policy belongs to the caller.
#[derive(Debug, Error)]
pub enum EstablishError {
    #[error("no private address block available")]
    NoAddressAvailable,

    #[error("error scanning network interfaces: {0}")]
    Scan(String),

    /// Host-level VPN permission revoked or superseded by another VPN app.
    #[error("VPN interface creation refused: {0}")]
    Refused(String),

    #[error("no live host registered")]
    HostGone,
}

impl From<AddressError> for EstablishError {
    fn from(e: AddressError) -> Self {
        match e {
            AddressError::NoBlockAvailable => EstablishError::NoAddressAvailable,
            AddressError::Scan(message) => EstablishError::Scan(message),
        }
    }
}

struct EstablishedSession {
    tun: Box<dyn TunHandle>,
    address: PrivateAddressBlock,
}

struct SessionState {
    status: TunStatus,
    session: Option<EstablishedSession>,
    router_thread: Option<thread::JoinHandle<()>>,
}

static INSTANCE: OnceLock<VpnSessionManager> = OnceLock::new();

/// Owns the TUN interface and the packet router for the process.
pub struct VpnSessionManager {
    router: Arc<dyn PacketRouter>,
    scanner: Arc<dyn InterfaceScanner>,
    host: Mutex<Option<Weak<dyn VpnHost>>>,
    // Routing-active guard; flips exactly once per router start/stop pair.
    routing: AtomicBool,
    state: Mutex<SessionState>,
    // Serializes establish/teardown/route start/stop against each other so
    // a route start can never race a teardown's descriptor close.
    op: Mutex<()>,
}

impl VpnSessionManager {
    fn new(router: Arc<dyn PacketRouter>, scanner: Arc<dyn InterfaceScanner>) -> Self {
        Self {
            router,
            scanner,
            host: Mutex::new(None),
            routing: AtomicBool::new(false),
            state: Mutex::new(SessionState {
                status: TunStatus::Uninitialized,
                session: None,
                router_thread: None,
            }),
            op: Mutex::new(()),
        }
    }

    /// The process-wide manager instance, created on first call. The router
    /// library has global state, so later calls return the same instance
    /// and ignore their arguments.
    pub fn initialize(
        router: Arc<dyn PacketRouter>,
        scanner: Arc<dyn InterfaceScanner>,
    ) -> &'static VpnSessionManager {
        INSTANCE.get_or_init(|| {
            info!("creating VPN session manager");
            Self::new(router, scanner)
        })
    }

    /// The manager instance, if [`initialize`](Self::initialize) has run.
    pub fn instance() -> Option<&'static VpnSessionManager> {
        INSTANCE.get()
    }

    /// Register the host service. Only a weak reference is kept, so the
    /// manager never prevents host teardown.
    pub fn register_host(&self, host: &Arc<dyn VpnHost>) {
        *self.host.lock().unwrap() = Some(Arc::downgrade(host));
    }

    /// Clear the host reference.
    pub fn unregister_host(&self) {
        *self.host.lock().unwrap() = None;
    }

    fn host(&self) -> Option<Arc<dyn VpnHost>> {
        self.host.lock().unwrap().as_ref().and_then(Weak::upgrade)
    }

    /// Forward a message to the host's diagnostic sink. A host that has
    /// gone away is a silent no-op.
    fn diagnostic(&self, message: &str) {
        if let Some(host) = self.host() {
            host.report_diagnostic(message);
        }
    }

    /// Current interface status.
    pub fn status(&self) -> TunStatus {
        self.state.lock().unwrap().status
    }

    /// Whether the packet router is active.
    pub fn is_routing(&self) -> bool {
        self.routing.load(Ordering::SeqCst)
    }

    /// Pick a private address block and create the VPN interface.
    ///
    /// Establishing over a live session stops routing and closes the
    /// previous descriptor first, keeping at most one descriptor open.
    pub fn establish(&self) -> Result<PrivateAddressBlock, EstablishError> {
        let _op = self.op.lock().unwrap();
        self.stop_route_locked();

        let local = self.scanner.local_ipv4_addresses()?;
        let block = select_private_address(&local)?;

        let host = self.host().ok_or(EstablishError::HostGone)?;
        info!(
            "establishing VPN interface for session {}",
            host.session_name()
        );

        let mut builder = host.interface_builder();
        builder.set_mtu(TUN_MTU);
        builder.add_address(block.ip_address, block.prefix_length);
        builder.add_route(Ipv4Addr::UNSPECIFIED, 0);
        builder.add_route(block.subnet_base, block.prefix_length);
        builder.add_dns_server(block.router_address);

        let tun = builder
            .establish()
            .map_err(|e| EstablishError::Refused(e.to_string()))?;

        let mut state = self.state.lock().unwrap();
        if state.session.take().is_some() {
            debug!("replacing previous TUN descriptor");
        }
        state.session = Some(EstablishedSession {
            tun,
            address: block,
        });
        state.status = TunStatus::Established;
        drop(state);
        self.routing.store(false, Ordering::SeqCst);

        info!(
            "VPN interface established at {}/{}",
            block.ip_address, block.prefix_length
        );
        Ok(block)
    }

    /// Stop the router if running and close the TUN descriptor. Idempotent.
    pub fn teardown(&self) {
        let _op = self.op.lock().unwrap();
        self.stop_route_locked();

        let mut state = self.state.lock().unwrap();
        if state.session.take().is_some() {
            // Dropping the session closes the descriptor; close errors are
            // ignored by the handle.
            info!("VPN interface torn down");
        }
        if state.status != TunStatus::Uninitialized {
            state.status = TunStatus::TornDown;
        }
        drop(state);
        self.routing.store(false, Ordering::SeqCst);
    }

    /// Start routing traffic through the tunnel by starting the packet
    /// router, if it is not running already.
    ///
    /// A failure to start leaves the session established but not routed,
    /// from which routing can be retried.
    pub fn route_through_tunnel(&self, proxy_port: u16) {
        let _op = self.op.lock().unwrap();
        if self
            .routing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("route through tunnel: already routing");
            return;
        }

        let mut state = self.state.lock().unwrap();
        let Some(session) = state.session.as_ref() else {
            drop(state);
            self.routing.store(false, Ordering::SeqCst);
            warn!("route through tunnel: no interface established");
            return;
        };

        if proxy_port == 0 {
            drop(state);
            self.routing.store(false, Ordering::SeqCst);
            warn!("route through tunnel: socks proxy port is not set");
            self.diagnostic("route through tunnel: socks proxy port is not set");
            return;
        }

        // The router's stop closes whatever descriptor it was given, and
        // routing may start and stop several times within one session, so
        // each run gets a duplicate and the original survives until
        // teardown.
        let tun = match session.tun.duplicate() {
            Ok(dup) => dup,
            Err(e) => {
                drop(state);
                self.routing.store(false, Ordering::SeqCst);
                warn!("route through tunnel: error duplicating tun descriptor: {e}");
                self.diagnostic(&format!(
                    "route through tunnel: error duplicating tun descriptor: {e}"
                ));
                return;
            }
        };

        let params = RouterParams {
            tun,
            mtu: TUN_MTU,
            router_address: session.address.router_address,
            netmask: TUN_NETMASK,
            socks_server: SocketAddr::from(([127, 0, 0, 1], proxy_port)),
            udpgw_server: SocketAddr::from(([127, 0, 0, 1], UDPGW_PORT)),
            transparent_dns: true,
        };
        let router = Arc::clone(&self.router);
        let spawned = thread::Builder::new()
            .name("packet-router".to_string())
            .spawn(move || router.run(params));

        match spawned {
            Ok(handle) => {
                state.router_thread = Some(handle);
                state.status = TunStatus::RoutingActive;
                drop(state);
                info!("packet router started");
                self.diagnostic("Routing through tunnel");
            }
            Err(e) => {
                drop(state);
                self.routing.store(false, Ordering::SeqCst);
                error!("route through tunnel: failed to start packet router: {e}");
                self.diagnostic(&format!(
                    "route through tunnel: failed to start packet router: {e}"
                ));
            }
        }
    }

    /// Stop routing traffic through the tunnel if currently routing.
    pub fn stop_route_through_tunnel(&self) {
        let _op = self.op.lock().unwrap();
        self.stop_route_locked();
    }

    fn stop_route_locked(&self) {
        if self
            .routing
            .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let handle = {
            let mut state = self.state.lock().unwrap();
            if state.status == TunStatus::RoutingActive {
                state.status = TunStatus::Established;
            }
            state.router_thread.take()
        };
        if let Some(handle) = handle {
            self.router.terminate();
            // Blocks until the run loop has fully exited. The state lock is
            // not held here, so status reads stay responsive during the
            // wait.
            if handle.join().is_err() {
                error!("packet router thread panicked");
            }
            info!("packet router stopped");
        }
    }
}
