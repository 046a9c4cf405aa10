//! Connection lifecycle management for bidirectional peer-to-peer transports.
//!
//! This crate provides the connection manager of a peer-to-peer node: a
//! concurrent registry that owns every transport-level peer connection and
//! guarantees:
//!
//! - At most one live connection per peer address
//! - Reuse of inbound connections for outbound purposes (and vice versa)
//!   when both sides negotiated a duplex data flow
//! - Disciplined teardown through a per-peer state machine, honouring the
//!   transport's TIME_WAIT delay before a peer is forgotten
//! - Bounded admission via a pluggable prune policy
//! - Bounded shutdown: no connection task outlives the manager's scope by
//!   more than the cancellation propagation time
//!
//! # Architecture
//!
//! Each connection runs in its own tokio task, which owns the socket and
//! always executes a cleanup step, even when cancelled. Public operations
//! mutate per-peer state cells in short critical sections and wait for state
//! changes through a notify-on-write pattern.
//!
//! ```text
//! Caller tasks (accept loop, outbound governor, inbound governor)
//! ├── ConnectionManager (state table: peer -> state cell)
//! │     ├── Connection Task 1 (handshake, mux, cleanup, TIME_WAIT)
//! │     ├── Connection Task 2
//! │     └── ...
//! └── PrunePolicy (pure victim selection above the hard limit)
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use causeway::{
//!     with_connection_manager, DataFlow, ManagerConfig, RandomPrunePolicy, TcpConn,
//!     TcpSocketOps,
//! };
//!
//! let config = ManagerConfig::for_socket_addrs(|version| {
//!     if version >= 12 { DataFlow::Duplex } else { DataFlow::Unidirectional }
//! });
//!
//! with_connection_manager(config, TcpSocketOps, handler, RandomPrunePolicy, |cm| async move {
//!     // accept loop
//!     loop {
//!         let (stream, peer) = listener.accept().await?;
//!         let cm = cm.clone();
//!         tokio::spawn(async move {
//!             let _ = cm.include_inbound(TcpConn::from_stream(stream), peer).await;
//!         });
//!     }
//! })
//! .await?;
//! ```

pub mod config;
pub mod conn;
pub mod error;
pub mod handler;
pub mod manager;
pub mod prune;
pub mod socket;

// Re-export main types
pub use config::{
    AcceptedConnectionsLimit, ManagerConfig, DEFAULT_HARD_LIMIT, DEFAULT_PROTOCOL_IDLE_TIMEOUT,
    DEFAULT_SOFT_LIMIT, DEFAULT_TIME_WAIT_TIMEOUT,
};
pub use conn::{
    AbstractState, AddrType, ConnectionId, ConnectionType, DataFlow, PeerAddr, Provenance,
    TimeoutExpired,
};
pub use error::{ConnectionError, ConnectionResult};
pub use handler::{ConnectionHandler, HandleError, HandleErrorKind, Version};
pub use manager::{
    with_connection_manager, ConnectResult, ConnectionManager, Demotion, OperationResult,
};
pub use prune::{PrunePolicy, RandomPrunePolicy};
pub use socket::{classify_socket_addr, SocketOps, TcpConn, TcpSocketOps};
