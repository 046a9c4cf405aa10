//! Per-connection state machine data.
//!
//! Each peer's entry holds exactly one [`ConnectionState`]. The payloads are
//! disjoint on purpose: the multiplexer handle exists if and only if the tag
//! permits it, and every state except `ReservedOutbound` and `Terminated`
//! owns the connection task.

use std::fmt;

use serde::Serialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::conn::{ConnectionId, ConnectionType, DataFlow, Provenance, TimeoutExpired};
use crate::handler::HandleError;

/// Owning handle to a connection task.
///
/// The state cell is the sole owner; cancellation always goes through the
/// token stored here, never through aborting the join handle.
#[derive(Debug)]
pub(crate) struct ConnThread {
    /// Join handle of the task; awaited (with a bound) only during shutdown.
    pub join: JoinHandle<()>,
    /// Cooperative cancellation signal for the task.
    pub cancel: CancellationToken,
}

impl ConnThread {
    /// Ask the task to stop. Its cleanup step still runs.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// State of one peer's connection.
pub(crate) enum ConnectionState<A, H> {
    /// Outbound dial reserved; no socket yet.
    ReservedOutbound,
    /// Socket exists, version handshake running.
    Unnegotiated {
        provenance: Provenance,
        conn_id: ConnectionId<A>,
        thread: ConnThread,
    },
    /// Negotiated outbound, unidirectional use only.
    OutboundUni {
        conn_id: ConnectionId<A>,
        thread: ConnThread,
        handle: H,
    },
    /// Outbound-only use of a duplex connection.
    OutboundDup {
        conn_id: ConnectionId<A>,
        thread: ConnThread,
        handle: H,
        expiry: TimeoutExpired,
    },
    /// Negotiated inbound, remote currently silent.
    InboundIdle {
        conn_id: ConnectionId<A>,
        thread: ConnThread,
        handle: H,
        data_flow: DataFlow,
    },
    /// Actively used by the remote end.
    Inbound {
        conn_id: ConnectionId<A>,
        thread: ConnThread,
        handle: H,
        data_flow: DataFlow,
    },
    /// In use in both directions.
    Duplex {
        conn_id: ConnectionId<A>,
        thread: ConnThread,
        handle: H,
    },
    /// Closing; the socket may still be in TIME_WAIT.
    Terminating {
        conn_id: ConnectionId<A>,
        thread: ConnThread,
        error: Option<HandleError>,
    },
    /// Fully dead; the entry awaits removal.
    Terminated { error: Option<HandleError> },
}

impl<A, H> ConnectionState<A, H> {
    /// Fieldless mirror of the state, for replies and traces.
    pub fn abstract_state(&self) -> AbstractState {
        match self {
            ConnectionState::ReservedOutbound => AbstractState::ReservedOutbound,
            ConnectionState::Unnegotiated { provenance, .. } => {
                AbstractState::Unnegotiated(*provenance)
            }
            ConnectionState::OutboundUni { .. } => AbstractState::OutboundUni,
            ConnectionState::OutboundDup { expiry, .. } => AbstractState::OutboundDup(*expiry),
            ConnectionState::InboundIdle { data_flow, .. } => {
                AbstractState::InboundIdle(*data_flow)
            }
            ConnectionState::Inbound { data_flow, .. } => AbstractState::Inbound(*data_flow),
            ConnectionState::Duplex { .. } => AbstractState::Duplex,
            ConnectionState::Terminating { .. } => AbstractState::Terminating,
            ConnectionState::Terminated { .. } => AbstractState::Terminated,
        }
    }

    /// Classification handed to the prune policy; live states only.
    pub fn connection_type(&self) -> Option<ConnectionType> {
        match self {
            ConnectionState::Unnegotiated { provenance, .. } => {
                Some(ConnectionType::Unnegotiated(*provenance))
            }
            ConnectionState::OutboundUni { .. } => Some(ConnectionType::Negotiated(
                Provenance::Outbound,
                DataFlow::Unidirectional,
            )),
            ConnectionState::OutboundDup { .. } => Some(ConnectionType::Negotiated(
                Provenance::Outbound,
                DataFlow::Duplex,
            )),
            ConnectionState::InboundIdle { data_flow, .. } => {
                Some(ConnectionType::InboundIdle(*data_flow))
            }
            ConnectionState::Inbound { data_flow, .. } => {
                Some(ConnectionType::Negotiated(Provenance::Inbound, *data_flow))
            }
            ConnectionState::Duplex { .. } => Some(ConnectionType::Duplex),
            ConnectionState::ReservedOutbound
            | ConnectionState::Terminating { .. }
            | ConnectionState::Terminated { .. } => None,
        }
    }

    /// Whether this state counts toward the accepted-connections hard limit.
    pub fn counts_toward_limit(&self) -> bool {
        matches!(
            self,
            ConnectionState::Unnegotiated {
                provenance: Provenance::Inbound,
                ..
            } | ConnectionState::InboundIdle { .. }
                | ConnectionState::Inbound { .. }
                | ConnectionState::OutboundDup { .. }
                | ConnectionState::Duplex { .. }
        )
    }

    /// The connection task owned by this state, if any.
    pub fn thread(&self) -> Option<&ConnThread> {
        match self {
            ConnectionState::Unnegotiated { thread, .. }
            | ConnectionState::OutboundUni { thread, .. }
            | ConnectionState::OutboundDup { thread, .. }
            | ConnectionState::InboundIdle { thread, .. }
            | ConnectionState::Inbound { thread, .. }
            | ConnectionState::Duplex { thread, .. }
            | ConnectionState::Terminating { thread, .. } => Some(thread),
            ConnectionState::ReservedOutbound | ConnectionState::Terminated { .. } => None,
        }
    }

    /// The connection identity, for states where the socket exists.
    pub fn conn_id(&self) -> Option<&ConnectionId<A>> {
        match self {
            ConnectionState::Unnegotiated { conn_id, .. }
            | ConnectionState::OutboundUni { conn_id, .. }
            | ConnectionState::OutboundDup { conn_id, .. }
            | ConnectionState::InboundIdle { conn_id, .. }
            | ConnectionState::Inbound { conn_id, .. }
            | ConnectionState::Duplex { conn_id, .. }
            | ConnectionState::Terminating { conn_id, .. } => Some(conn_id),
            ConnectionState::ReservedOutbound | ConnectionState::Terminated { .. } => None,
        }
    }

    /// The handler error recorded in a terminal state, if any.
    pub fn error(&self) -> Option<&HandleError> {
        match self {
            ConnectionState::Terminating { error, .. }
            | ConnectionState::Terminated { error } => error.as_ref(),
            _ => None,
        }
    }

    /// Replace `self` with `Terminated` (no error), handing back the thread
    /// this state owned.
    pub fn take_terminated(&mut self) -> Option<ConnThread> {
        std::mem::replace(self, ConnectionState::Terminated { error: None }).into_thread()
    }

    fn into_thread(self) -> Option<ConnThread> {
        match self {
            ConnectionState::Unnegotiated { thread, .. }
            | ConnectionState::OutboundUni { thread, .. }
            | ConnectionState::OutboundDup { thread, .. }
            | ConnectionState::InboundIdle { thread, .. }
            | ConnectionState::Inbound { thread, .. }
            | ConnectionState::Duplex { thread, .. }
            | ConnectionState::Terminating { thread, .. } => Some(thread),
            ConnectionState::ReservedOutbound | ConnectionState::Terminated { .. } => None,
        }
    }
}

/// Fieldless view of a connection state, used in replies, errors and traces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum AbstractState {
    ReservedOutbound,
    Unnegotiated(Provenance),
    OutboundUni,
    OutboundDup(TimeoutExpired),
    InboundIdle(DataFlow),
    Inbound(DataFlow),
    Duplex,
    Terminating,
    Terminated,
    /// The peer has no entry in the table.
    Unknown,
}

impl fmt::Display for AbstractState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbstractState::ReservedOutbound => write!(f, "reserved-outbound"),
            AbstractState::Unnegotiated(p) => write!(f, "unnegotiated-{p}"),
            AbstractState::OutboundUni => write!(f, "outbound-unidirectional"),
            AbstractState::OutboundDup(t) => write!(f, "outbound-duplex-{t}"),
            AbstractState::InboundIdle(d) => write!(f, "inbound-idle-{d}"),
            AbstractState::Inbound(d) => write!(f, "inbound-{d}"),
            AbstractState::Duplex => write!(f, "duplex"),
            AbstractState::Terminating => write!(f, "terminating"),
            AbstractState::Terminated => write!(f, "terminated"),
            AbstractState::Unknown => write!(f, "unknown"),
        }
    }
}
