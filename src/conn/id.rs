//! Connection identity and vocabulary types.

use std::fmt;
use std::hash::Hash;

use serde::{Deserialize, Serialize};

/// Bounds required of a peer address.
///
/// The manager is parametric over the address type; anything hashable and
/// cheaply clonable works. Blanket-implemented, never implemented by hand.
pub trait PeerAddr: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

impl<T> PeerAddr for T where T: Clone + Eq + Hash + fmt::Debug + Send + Sync + 'static {}

/// Whether a connection was accepted or dialed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provenance {
    /// The remote end initiated the connection.
    Inbound,
    /// We dialed the remote end.
    Outbound,
}

impl fmt::Display for Provenance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Provenance::Inbound => write!(f, "inbound"),
            Provenance::Outbound => write!(f, "outbound"),
        }
    }
}

/// Direction discipline agreed during version negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataFlow {
    /// The connection may only be used in its original direction.
    Unidirectional,
    /// Either side may promote the connection for its own use.
    Duplex,
}

impl fmt::Display for DataFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataFlow::Unidirectional => write!(f, "unidirectional"),
            DataFlow::Duplex => write!(f, "duplex"),
        }
    }
}

/// Whether the reuse window of a demoted outbound-duplex connection is still
/// open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TimeoutExpired {
    /// The window is still open; the connection can be folded back cheaply.
    Ticking,
    /// The window has closed; the next demotion terminates the connection.
    Expired,
}

impl fmt::Display for TimeoutExpired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TimeoutExpired::Ticking => write!(f, "ticking"),
            TimeoutExpired::Expired => write!(f, "expired"),
        }
    }
}

/// Address family of a peer address, used to pick a local bind address for
/// outbound sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AddrType {
    Ipv4,
    Ipv6,
    Other,
}

/// Identity of an established connection: the remote address plus the local
/// address discovered once the socket is bound or connected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConnectionId<A> {
    /// Address of the remote end.
    pub remote: A,
    /// Local address of the socket.
    pub local: A,
}

impl<A: fmt::Debug> fmt::Display for ConnectionId<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}<->{:?}", self.local, self.remote)
    }
}

/// Classification of a live connection, handed to the prune policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionType {
    /// Version negotiation still running.
    Unnegotiated(Provenance),
    /// Negotiated and used in its original direction.
    Negotiated(Provenance, DataFlow),
    /// Negotiated inbound, remote currently silent.
    InboundIdle(DataFlow),
    /// In use in both directions.
    Duplex,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionType::Unnegotiated(p) => write!(f, "unnegotiated-{p}"),
            ConnectionType::Negotiated(p, d) => write!(f, "negotiated-{p}-{d}"),
            ConnectionType::InboundIdle(d) => write!(f, "inbound-idle-{d}"),
            ConnectionType::Duplex => write!(f, "duplex"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provenance_display() {
        assert_eq!(format!("{}", Provenance::Inbound), "inbound");
        assert_eq!(format!("{}", Provenance::Outbound), "outbound");
    }

    #[test]
    fn test_connection_id_display() {
        let id = ConnectionId { remote: "peer", local: "here" };
        assert_eq!(format!("{id}"), "\"here\"<->\"peer\"");
    }

    #[test]
    fn test_connection_type_display() {
        let ct = ConnectionType::Negotiated(Provenance::Outbound, DataFlow::Duplex);
        assert_eq!(format!("{ct}"), "negotiated-outbound-duplex");
        assert_eq!(format!("{}", ConnectionType::Duplex), "duplex");
    }
}
