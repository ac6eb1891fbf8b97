//! Tunnel engine connection state.
//!
//! Produced by the tunnel engine and consumed read-only; this crate never
//! parses tunnel wire traffic, it only aggregates what the engine reports.

/// Where the tunnel is in its connection lifecycle while running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkState {
    /// Establishing a connection to the network.
    Connecting,
    /// No usable underlying network; waiting for one to appear.
    WaitingForNetwork,
    /// Tunnel connected and passing traffic.
    Connected,
}

/// Connection details reported by a running tunnel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionData {
    pub network_state: NetworkState,
    /// Egress region the tunnel landed in.
    pub region: String,
    pub client_version: String,
    pub propagation_channel_id: String,
    pub sponsor_id: String,
    /// Local SOCKS proxy port, 0 until the proxy is listening.
    pub local_proxy_port: u16,
    /// Sponsor home pages to open on connect, in order.
    pub home_pages: Option<Vec<String>>,
}

impl Default for ConnectionData {
    fn default() -> Self {
        Self {
            network_state: NetworkState::Connecting,
            region: String::new(),
            client_version: String::new(),
            propagation_channel_id: String::new(),
            sponsor_id: String::new(),
            local_proxy_port: 0,
            home_pages: None,
        }
    }
}

/// The tunnel engine's reported state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TunnelState {
    /// The engine has not reported yet.
    #[default]
    Unknown,
    /// The tunnel service is not running.
    Stopped,
    /// The tunnel service is running with the given connection details.
    Running(ConnectionData),
}

impl TunnelState {
    pub fn unknown() -> Self {
        TunnelState::Unknown
    }

    pub fn stopped() -> Self {
        TunnelState::Stopped
    }

    pub fn running(data: ConnectionData) -> Self {
        TunnelState::Running(data)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, TunnelState::Running(_))
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, TunnelState::Stopped)
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, TunnelState::Unknown)
    }

    /// Connection details, present only while running.
    pub fn connection_data(&self) -> Option<&ConnectionData> {
        match self {
            TunnelState::Running(data) => Some(data),
            _ => None,
        }
    }

    /// Whether the tunnel is running and fully connected.
    pub fn is_connected(&self) -> bool {
        self.connection_data()
            .is_some_and(|data| data.network_state == NetworkState::Connected)
    }
}
