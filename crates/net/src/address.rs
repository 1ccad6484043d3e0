use std::fmt;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

/// IPv4 endpoint used as the connection-table key. Ordering is
/// lexicographic: host first, then port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NetAddress {
    pub host: u32,
    pub port: u16,
}

impl NetAddress {
    pub const UNSPECIFIED: NetAddress = NetAddress { host: 0, port: 0 };

    pub const fn new(host: u32, port: u16) -> Self {
        Self { host, port }
    }

    pub const fn broadcast(port: u16) -> Self {
        Self {
            host: 0xFFFF_FFFF,
            port,
        }
    }

    /// Extracts an IPv4 endpoint; IPv6 sources are not part of this protocol.
    pub fn from_socket(addr: SocketAddr) -> Option<Self> {
        match addr {
            SocketAddr::V4(v4) => Some(Self {
                host: u32::from(*v4.ip()),
                port: v4.port(),
            }),
            SocketAddr::V6(_) => None,
        }
    }

    pub fn to_socket_addr(self) -> SocketAddr {
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::from(self.host), self.port))
    }
}

impl From<SocketAddrV4> for NetAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self {
            host: u32::from(*addr.ip()),
            port: addr.port(),
        }
    }
}

impl fmt::Display for NetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", Ipv4Addr::from(self.host), self.port)
    }
}

impl From<NetAddress> for SocketAddr {
    fn from(addr: NetAddress) -> Self {
        addr.to_socket_addr()
    }
}
