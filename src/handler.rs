//! Handler seam: version negotiation and post-negotiation multiplexing.
//!
//! The manager never speaks the application protocol itself. It opens and
//! owns sockets, and hands each one to a [`ConnectionHandler`] that first
//! negotiates a protocol version and then runs the application-level
//! multiplexer. The manager only observes the negotiation outcome.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::conn::ConnectionId;

/// Protocol version agreed during negotiation.
///
/// The manager does not interpret versions beyond mapping them to a
/// [`DataFlow`](crate::conn::DataFlow) via the configured
/// [`data_flow`](crate::config::ManagerConfig::data_flow) function.
pub type Version = u32;

/// Classification of a handler failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HandleErrorKind {
    /// The handshake failed but the transport behaved; the TIME_WAIT delay
    /// applies before the peer entry is forgotten.
    HandshakeFailure,
    /// The remote end violated the handshake protocol; the entry is torn
    /// down without a TIME_WAIT window.
    HandshakeProtocolViolation,
}

impl fmt::Display for HandleErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandleErrorKind::HandshakeFailure => write!(f, "handshake failure"),
            HandleErrorKind::HandshakeProtocolViolation => {
                write!(f, "handshake protocol violation")
            }
        }
    }
}

/// Error reported by a connection handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct HandleError {
    /// How the failure is classified for TIME_WAIT purposes.
    pub kind: HandleErrorKind,
    /// Human-readable description.
    pub message: String,
}

impl HandleError {
    /// A soft handshake failure; the peer entry honours TIME_WAIT.
    pub fn handshake_failure(message: impl Into<String>) -> Self {
        Self {
            kind: HandleErrorKind::HandshakeFailure,
            message: message.into(),
        }
    }

    /// A hard protocol violation; the peer entry skips TIME_WAIT.
    pub fn protocol_violation(message: impl Into<String>) -> Self {
        Self {
            kind: HandleErrorKind::HandshakeProtocolViolation,
            message: message.into(),
        }
    }
}

/// Negotiates a version on a fresh socket, then drives the application-level
/// multiplexer.
///
/// Both methods run inside the connection task and are cancelled when the
/// manager tears the connection down; cleanup of the socket and the state
/// table is the manager's job, never the handler's.
#[async_trait]
pub trait ConnectionHandler<A, S>: Send + Sync + 'static
where
    A: Send + Sync,
    S: Send,
{
    /// Opaque multiplexer handle returned by a successful negotiation.
    ///
    /// The manager stores it in the connection's state and hands clones back
    /// to callers; it never looks inside.
    type Handle: Clone + Send + Sync + 'static;

    /// Run the version handshake on a freshly opened socket.
    async fn negotiate(
        &self,
        socket: &mut S,
        conn_id: &ConnectionId<A>,
    ) -> Result<(Self::Handle, Version), HandleError>;

    /// Drive the multiplexer until the connection ends.
    ///
    /// Returning (with or without an error) means the connection is over;
    /// the manager then runs its cleanup path.
    async fn run(
        &self,
        socket: &mut S,
        conn_id: &ConnectionId<A>,
        handle: Self::Handle,
    ) -> Result<(), HandleError>;
}
