//! Connection manager error taxonomy.

use std::fmt;
use std::io;

use thiserror::Error;

use crate::conn::{AbstractState, ConnectionId, Provenance};

/// Errors surfaced by the public operations.
///
/// Ordinary lifecycle conditions (unknown peer, redundant demotion) are not
/// errors; those are reported through
/// [`OperationResult`](crate::manager::OperationResult). `ImpossibleState`
/// is the exception: it signals an invariant violation, i.e. a bug.
#[derive(Debug, Error)]
pub enum ConnectionError<A: fmt::Debug> {
    /// An outbound request found a connection already in place.
    #[error("connection to peer {peer:?} already exists ({provenance})")]
    ConnectionExists {
        /// Direction blocking the request.
        provenance: Provenance,
        /// The peer the request targeted.
        peer: A,
    },

    /// The negotiated data flow does not allow the requested direction.
    #[error("data flow forbids reuse of connection {conn_id}")]
    ForbiddenConnection {
        /// Identity of the connection that cannot be reused.
        conn_id: ConnectionId<A>,
    },

    /// The operation is not legal in the connection's current state.
    #[error("operation forbidden for peer {peer:?} in state {state}")]
    ForbiddenOperation {
        /// The peer the operation targeted.
        peer: A,
        /// State the connection was found in.
        state: AbstractState,
    },

    /// Invariant violation: the state machine reached a combination the
    /// design rules out. Fatal to the operation and a bug signal.
    #[error("impossible connection state for peer {peer:?}")]
    ImpossibleState {
        /// The peer whose entry is corrupt.
        peer: A,
    },

    /// The manager has been shut down.
    #[error("connection manager is shut down")]
    Shutdown,

    /// I/O failure while opening, binding or connecting a socket.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Result alias for manager operations.
pub type ConnectionResult<T, A> = Result<T, ConnectionError<A>>;
