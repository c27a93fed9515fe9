//! Peer address - the key of the session table

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};

/// Length of a native `sockaddr_in`
const SOCKADDR_V4_LEN: usize = 16;

/// Length of a native `sockaddr_in6`
const SOCKADDR_V6_LEN: usize = 28;

/// Remote UDP endpoint of a session.
///
/// Equality is exact: family, IP bytes and port must all match. An
/// IPv4-mapped IPv6 address is a different peer than the plain IPv4 one,
/// because replies must go out through the same family the datagram came in on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PeerAddress {
    addr: SocketAddr,
}

impl PeerAddress {
    pub fn new(addr: SocketAddr) -> Self {
        Self { addr }
    }

    /// Create from IP and port
    pub fn ip_port(ip: IpAddr, port: u16) -> Self {
        Self::new(SocketAddr::new(ip, port))
    }

    /// Create an unspecified IPv4 address (0.0.0.0:0)
    pub fn unspecified() -> Self {
        Self::ip_port(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }

    pub fn socket_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn ip(&self) -> IpAddr {
        self.addr.ip()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }

    pub fn is_ipv6(&self) -> bool {
        self.addr.is_ipv6()
    }

    /// Byte length of the native socket address structure for this family
    pub fn sockaddr_len(&self) -> usize {
        match self.addr {
            SocketAddr::V4(_) => SOCKADDR_V4_LEN,
            SocketAddr::V6(_) => SOCKADDR_V6_LEN,
        }
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.addr)
    }
}

impl From<SocketAddr> for PeerAddress {
    fn from(addr: SocketAddr) -> Self {
        Self::new(addr)
    }
}

impl From<SocketAddrV4> for PeerAddress {
    fn from(addr: SocketAddrV4) -> Self {
        Self::new(SocketAddr::V4(addr))
    }
}

impl From<SocketAddrV6> for PeerAddress {
    fn from(addr: SocketAddrV6) -> Self {
        Self::new(SocketAddr::V6(addr))
    }
}

impl From<PeerAddress> for SocketAddr {
    fn from(peer: PeerAddress) -> Self {
        peer.addr
    }
}

impl From<(Ipv6Addr, u16)> for PeerAddress {
    fn from((ip, port): (Ipv6Addr, u16)) -> Self {
        Self::ip_port(IpAddr::V6(ip), port)
    }
}

impl From<(Ipv4Addr, u16)> for PeerAddress {
    fn from((ip, port): (Ipv4Addr, u16)) -> Self {
        Self::ip_port(IpAddr::V4(ip), port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_requires_port() {
        let a = PeerAddress::from((Ipv4Addr::LOCALHOST, 5684));
        let b = PeerAddress::from((Ipv4Addr::LOCALHOST, 5685));
        assert_ne!(a, b);
        assert_eq!(a, PeerAddress::from((Ipv4Addr::LOCALHOST, 5684)));
    }

    #[test]
    fn test_mapped_ipv6_is_distinct_peer() {
        let v4 = PeerAddress::from((Ipv4Addr::new(10, 0, 0, 1), 4000));
        let mapped = PeerAddress::from((Ipv4Addr::new(10, 0, 0, 1).to_ipv6_mapped(), 4000));
        assert_ne!(v4, mapped);

        let mut set = HashSet::new();
        set.insert(v4);
        set.insert(mapped);
        assert_eq!(set.len(), 2);
    }

    #[test]
    fn test_len_by_family() {
        let v4: PeerAddress = "127.0.0.1:1".parse::<SocketAddr>().unwrap().into();
        let v6: PeerAddress = "[::1]:1".parse::<SocketAddr>().unwrap().into();
        assert_eq!(v4.sockaddr_len(), 16);
        assert_eq!(v6.sockaddr_len(), 28);
        assert!(v4.is_ipv4());
        assert!(v6.is_ipv6());
    }
}
