//! Connection identity, per-peer state machine and the connection task.

pub mod id;
pub(crate) mod state;
pub(crate) mod worker;

pub use id::{
    AddrType, ConnectionId, ConnectionType, DataFlow, PeerAddr, Provenance, TimeoutExpired,
};
pub use state::AbstractState;
