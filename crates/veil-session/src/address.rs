//! Private address block selection for the TUN interface.
//!
//! One of 10.0.0.1, 172.16.0.1, 192.168.0.1 or 169.254.1.1 is picked
//! depending on which private range is not already in use by a local
//! network interface, so the tunnel addresses never collide with the LAN.

use std::net::Ipv4Addr;
use thiserror::Error;

/// Errors selecting a private address block.
#[derive(Debug, Error)]
pub enum AddressError {
    /// Every candidate range is already in local use.
    #[error("no private address block available")]
    NoBlockAvailable,

    /// The platform could not enumerate network interfaces.
    #[error("error listing network interfaces: {0}")]
    Scan(String),
}

/// Platform seam for enumerating the IPv4 addresses of active network
/// interfaces.
pub trait InterfaceScanner: Send + Sync {
    fn local_ipv4_addresses(&self) -> Result<Vec<Ipv4Addr>, AddressError>;
}

/// The address plan for one VPN session. Immutable after selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrivateAddressBlock {
    /// Address assigned to the TUN interface.
    pub ip_address: Ipv4Addr,
    /// Base of the covered subnet.
    pub subnet_base: Ipv4Addr,
    /// Prefix length of the covered subnet.
    pub prefix_length: u8,
    /// In-tunnel router address, also used as the DNS resolver.
    pub router_address: Ipv4Addr,
}

const CANDIDATES: [PrivateAddressBlock; 4] = [
    PrivateAddressBlock {
        ip_address: Ipv4Addr::new(10, 0, 0, 1),
        subnet_base: Ipv4Addr::new(10, 0, 0, 0),
        prefix_length: 8,
        router_address: Ipv4Addr::new(10, 0, 0, 2),
    },
    PrivateAddressBlock {
        ip_address: Ipv4Addr::new(172, 16, 0, 1),
        subnet_base: Ipv4Addr::new(172, 16, 0, 0),
        prefix_length: 12,
        router_address: Ipv4Addr::new(172, 16, 0, 2),
    },
    PrivateAddressBlock {
        ip_address: Ipv4Addr::new(192, 168, 0, 1),
        subnet_base: Ipv4Addr::new(192, 168, 0, 0),
        prefix_length: 16,
        router_address: Ipv4Addr::new(192, 168, 0, 2),
    },
    PrivateAddressBlock {
        ip_address: Ipv4Addr::new(169, 254, 1, 1),
        subnet_base: Ipv4Addr::new(169, 254, 1, 0),
        prefix_length: 24,
        router_address: Ipv4Addr::new(169, 254, 1, 2),
    },
];

/// Whether `addr` falls inside the candidate's range for exclusion
/// purposes.
fn occupies(candidate: &PrivateAddressBlock, addr: Ipv4Addr) -> bool {
    let [a, b, _, _] = addr.octets();
    match candidate.subnet_base.octets()[0] {
        10 => a == 10,
        172 => a == 172 && (16..=31).contains(&b),
        192 => a == 192 && b == 168,
        169 => {
            let [ca, cb, cc, _] = candidate.subnet_base.octets();
            let [_, _, c, _] = addr.octets();
            a == ca && b == cb && c == cc
        }
        _ => false,
    }
}

/// Pick the first candidate block whose range no local interface address
/// occupies.
pub fn select_private_address(
    local_addresses: &[Ipv4Addr],
) -> Result<PrivateAddressBlock, AddressError> {
    CANDIDATES
        .iter()
        .find(|candidate| {
            !local_addresses
                .iter()
                .any(|addr| occupies(candidate, *addr))
        })
        .copied()
        .ok_or(AddressError::NoBlockAvailable)
}
