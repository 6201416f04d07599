//! Network address values used as conversation key elements.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use pnet::datalink::MacAddr;

/// A comparable, hashable network address.
///
/// Two addresses are equal only if they share a family and the same bytes. Address-less
/// conversations use [Address::None] as a placeholder.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub enum Address {
    /// No address.
    #[default]
    None,
    /// Link-layer (Ethernet) address.
    Ether(MacAddr),
    /// IPv4 address.
    Ipv4(Ipv4Addr),
    /// IPv6 address.
    Ipv6(Ipv6Addr),
    /// Fibre Channel 24-bit port identifier.
    FibreChannel([u8; 3]),
    /// Any other address family, identified by a caller-defined `kind`.
    Other { kind: u16, data: Vec<u8> },
}

impl Address {
    /// Returns `true` for the address-less placeholder.
    #[inline]
    pub fn is_none(&self) -> bool {
        matches!(self, Address::None)
    }

    /// Returns `true` if the address is a Fibre Channel identifier.
    ///
    /// Fibre Channel exchange identifiers are not swapped between directions the way TCP/UDP
    /// ports are, which changes how reply packets are matched.
    #[inline]
    pub fn is_fibre_channel(&self) -> bool {
        matches!(self, Address::FibreChannel(_))
    }

    /// Number of address bytes.
    pub fn len(&self) -> usize {
        match self {
            Address::None => 0,
            Address::Ether(_) => 6,
            Address::Ipv4(_) => 4,
            Address::Ipv6(_) => 16,
            Address::FibreChannel(_) => 3,
            Address::Other { data, .. } => data.len(),
        }
    }

    /// Returns `true` if the address carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Calls `f` with the raw comparable bytes of the address.
    pub(crate) fn with_bytes<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        match self {
            Address::None => f(&[]),
            Address::Ether(mac) => {
                let MacAddr(a, b, c, d, e, g) = *mac;
                f(&[a, b, c, d, e, g])
            }
            Address::Ipv4(addr) => f(&addr.octets()),
            Address::Ipv6(addr) => f(&addr.octets()),
            Address::FibreChannel(id) => f(id),
            Address::Other { data, .. } => f(data),
        }
    }
}

impl From<Ipv4Addr> for Address {
    fn from(addr: Ipv4Addr) -> Self {
        Address::Ipv4(addr)
    }
}

impl From<Ipv6Addr> for Address {
    fn from(addr: Ipv6Addr) -> Self {
        Address::Ipv6(addr)
    }
}

impl From<IpAddr> for Address {
    fn from(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(v4) => Address::Ipv4(v4),
            IpAddr::V6(v6) => Address::Ipv6(v6),
        }
    }
}

impl From<MacAddr> for Address {
    fn from(mac: MacAddr) -> Self {
        Address::Ether(mac)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::None => write!(f, "<none>"),
            Address::Ether(mac) => write!(f, "{}", mac),
            Address::Ipv4(addr) => write!(f, "{}", addr),
            Address::Ipv6(addr) => write!(f, "{}", addr),
            Address::FibreChannel(id) => write!(f, "{:02x}.{:02x}.{:02x}", id[0], id[1], id[2]),
            Address::Other { kind, data } => {
                write!(f, "{}:", kind)?;
                for b in data {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
        }
    }
}
