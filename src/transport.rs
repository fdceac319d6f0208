//! `TransportTuple`: a (local-socket, remote-address) identity, per
//! `spec.md` §3.

use std::net::SocketAddr;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Protocol {
    Udp,
    Tcp,
}

/// Equality and hashing are by 4-tuple (local address, remote address,
/// protocol) only; a real socket handle is looked up elsewhere by whatever
/// owns the transport (`spec.md` §5 "shared resources").
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TransportTuple {
    pub local: SocketAddr,
    pub remote: SocketAddr,
    pub protocol: TupleProtocol,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TupleProtocol {
    Udp,
    Tcp,
}

impl From<Protocol> for TupleProtocol {
    fn from(p: Protocol) -> Self {
        match p {
            Protocol::Udp => Self::Udp,
            Protocol::Tcp => Self::Tcp,
        }
    }
}

impl TransportTuple {
    #[must_use]
    pub fn new(local: SocketAddr, remote: SocketAddr, protocol: Protocol) -> Self {
        Self {
            local,
            remote,
            protocol: protocol.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn equality_is_by_four_tuple() {
        let local: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let remote: SocketAddr = "127.0.0.1:10".parse().unwrap();
        let a = TransportTuple::new(local, remote, Protocol::Udp);
        let b = TransportTuple::new(local, remote, Protocol::Udp);
        assert_eq!(a, b);
        let c = TransportTuple::new(local, remote, Protocol::Tcp);
        assert_ne!(a, c);
    }
}
