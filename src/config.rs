//! Connection manager configuration.

use std::net::SocketAddr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conn::{AddrType, DataFlow};
use crate::handler::Version;
use crate::socket::classify_socket_addr;

/// Default TIME_WAIT delay before a terminated peer entry is forgotten.
pub const DEFAULT_TIME_WAIT_TIMEOUT: Duration = Duration::from_secs(60);

/// Default idle timeout applied by the inbound protocol governor.
pub const DEFAULT_PROTOCOL_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Default accepted-connections hard limit.
pub const DEFAULT_HARD_LIMIT: usize = 512;

/// Default accepted-connections soft limit.
pub const DEFAULT_SOFT_LIMIT: usize = 384;

/// Bounds on concurrently accepted connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptedConnectionsLimit {
    /// Above this count the prune path evicts connections.
    pub hard_limit: usize,
    /// Advisory bound for the accepting server's pacing; not enforced here.
    pub soft_limit: usize,
}

impl Default for AcceptedConnectionsLimit {
    fn default() -> Self {
        Self {
            hard_limit: DEFAULT_HARD_LIMIT,
            soft_limit: DEFAULT_SOFT_LIMIT,
        }
    }
}

/// Configuration for the connection manager.
#[derive(Clone)]
pub struct ManagerConfig<A> {
    /// Local address to bind outbound IPv4 sockets to.
    pub local_ipv4: Option<A>,
    /// Local address to bind outbound IPv6 sockets to.
    pub local_ipv6: Option<A>,
    /// Classifies a peer address for local-bind selection.
    pub classifier: fn(&A) -> AddrType,
    /// Derives the data flow from the negotiated version.
    pub data_flow: fn(Version) -> DataFlow,
    /// How long a terminating peer entry outlives its socket.
    pub time_wait_timeout: Duration,
    /// Idle timeout the inbound governor applies before demoting a remote.
    /// Recorded here so operators see the full picture; the manager itself
    /// does not enforce it.
    pub protocol_idle_timeout: Duration,
    /// Admission bounds driving the prune path.
    pub accepted_connections_limit: AcceptedConnectionsLimit,
}

impl<A> ManagerConfig<A> {
    /// Create a configuration with default timeouts and limits.
    pub fn new(classifier: fn(&A) -> AddrType, data_flow: fn(Version) -> DataFlow) -> Self {
        Self {
            local_ipv4: None,
            local_ipv6: None,
            classifier,
            data_flow,
            time_wait_timeout: DEFAULT_TIME_WAIT_TIMEOUT,
            protocol_idle_timeout: DEFAULT_PROTOCOL_IDLE_TIMEOUT,
            accepted_connections_limit: AcceptedConnectionsLimit::default(),
        }
    }

    /// Set the local bind address for outbound IPv4 sockets.
    pub fn with_local_ipv4(mut self, addr: A) -> Self {
        self.local_ipv4 = Some(addr);
        self
    }

    /// Set the local bind address for outbound IPv6 sockets.
    pub fn with_local_ipv6(mut self, addr: A) -> Self {
        self.local_ipv6 = Some(addr);
        self
    }

    /// Set the TIME_WAIT delay.
    pub fn with_time_wait_timeout(mut self, timeout: Duration) -> Self {
        self.time_wait_timeout = timeout;
        self
    }

    /// Set the governor's idle timeout.
    pub fn with_protocol_idle_timeout(mut self, timeout: Duration) -> Self {
        self.protocol_idle_timeout = timeout;
        self
    }

    /// Set the admission bounds.
    pub fn with_accepted_connections_limit(mut self, limit: AcceptedConnectionsLimit) -> Self {
        self.accepted_connections_limit = limit;
        self
    }

    /// Local bind address for the given address family, if configured.
    pub fn local_bind_addr(&self, addr_type: AddrType) -> Option<A>
    where
        A: Clone,
    {
        match addr_type {
            AddrType::Ipv4 => self.local_ipv4.clone(),
            AddrType::Ipv6 => self.local_ipv6.clone(),
            AddrType::Other => None,
        }
    }
}

impl ManagerConfig<SocketAddr> {
    /// Configuration wired for socket addresses.
    pub fn for_socket_addrs(data_flow: fn(Version) -> DataFlow) -> Self {
        Self::new(classify_socket_addr, data_flow)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn always_duplex(_version: Version) -> DataFlow {
        DataFlow::Duplex
    }

    #[test]
    fn test_default_config() {
        let config = ManagerConfig::for_socket_addrs(always_duplex);
        assert_eq!(config.time_wait_timeout, DEFAULT_TIME_WAIT_TIMEOUT);
        assert_eq!(config.protocol_idle_timeout, DEFAULT_PROTOCOL_IDLE_TIMEOUT);
        assert_eq!(config.accepted_connections_limit.hard_limit, DEFAULT_HARD_LIMIT);
        assert!(config.local_ipv4.is_none());
        assert!(config.local_ipv6.is_none());
    }

    #[test]
    fn test_config_builder() {
        let v4: SocketAddr = "10.1.2.3:0".parse().unwrap();
        let config = ManagerConfig::for_socket_addrs(always_duplex)
            .with_local_ipv4(v4)
            .with_time_wait_timeout(Duration::from_millis(50))
            .with_accepted_connections_limit(AcceptedConnectionsLimit {
                hard_limit: 2,
                soft_limit: 1,
            });

        assert_eq!(config.time_wait_timeout, Duration::from_millis(50));
        assert_eq!(config.accepted_connections_limit.hard_limit, 2);
        assert_eq!(config.local_bind_addr(AddrType::Ipv4), Some(v4));
        assert_eq!(config.local_bind_addr(AddrType::Ipv6), None);
        assert_eq!(config.local_bind_addr(AddrType::Other), None);
    }
}
