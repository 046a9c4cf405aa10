//! Connection manager: a concurrent registry owning the lifecycle of every
//! transport-level peer connection.
//!
//! The manager guarantees at most one live connection per peer, reuses
//! inbound connections for outbound purposes (and vice versa) when both
//! sides negotiated a duplex data flow, tears connections down through a
//! disciplined state machine, enforces admission limits via a prune policy,
//! and honours the transport's TIME_WAIT delay before forgetting a peer.

pub(crate) mod table;

mod inbound;
mod outbound;

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::config::ManagerConfig;
use crate::conn::state::ConnectionState;
use crate::conn::worker::WorkerEnv;
use crate::conn::{AbstractState, ConnectionId, DataFlow, PeerAddr};
use crate::error::ConnectionError;
use crate::handler::{ConnectionHandler, HandleError};
use crate::prune::PrunePolicy;
use crate::socket::SocketOps;
use table::StateTable;

/// Bound on joining a single connection task during shutdown.
const SHUTDOWN_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Outcome of [`ConnectionManager::include_inbound`] and
/// [`ConnectionManager::request_outbound`].
#[derive(Debug)]
pub enum ConnectResult<A, H> {
    /// The connection is live and may be used in the requested direction.
    Connected {
        /// Identity of the connection.
        conn_id: ConnectionId<A>,
        /// Data flow agreed during negotiation.
        data_flow: DataFlow,
        /// The handler's multiplexer handle.
        handle: H,
    },
    /// The handshake failed, or the connection died before it finished.
    Disconnected {
        /// Identity of the connection, when one was established.
        conn_id: Option<ConnectionId<A>>,
        /// The handler's error, when it reported one.
        error: Option<HandleError>,
    },
}

impl<A, H> ConnectResult<A, H> {
    /// Whether the operation yielded a usable connection.
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectResult::Connected { .. })
    }
}

/// Reply of the governor-driven operations.
///
/// Unsupported transitions are ordinary lifecycle conditions, reported to
/// the caller rather than raised as errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum OperationResult<T> {
    /// The transition was performed, or was already in effect.
    Done(T),
    /// The operation is not supported in the connection's current state.
    UnsupportedState(AbstractState),
}

impl<T> OperationResult<T> {
    /// Whether the transition took (or already held).
    pub fn is_done(&self) -> bool {
        matches!(self, OperationResult::Done(_))
    }
}

/// Verdict of [`ConnectionManager::unregister_inbound`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Demotion {
    /// The transport is kept alive for (future) outbound use.
    Keep,
    /// The connection is committed to termination.
    Commit,
}

pub(crate) struct Inner<A, S, H>
where
    A: PeerAddr,
    S: SocketOps<A>,
    H: ConnectionHandler<A, S::Socket>,
{
    pub(crate) config: ManagerConfig<A>,
    pub(crate) sockets: Arc<S>,
    pub(crate) handler: Arc<H>,
    pub(crate) prune_policy: Arc<dyn PrunePolicy<A>>,
    pub(crate) table: Arc<StateTable<A, H::Handle>>,
    /// Manager-wide token cancelled on shutdown; interrupts TIME_WAIT sleeps.
    pub(crate) shutdown: CancellationToken,
    pub(crate) closed: AtomicBool,
}

/// The connection manager. Cheap to clone; all clones share one state table.
pub struct ConnectionManager<A, S, H>
where
    A: PeerAddr,
    S: SocketOps<A>,
    H: ConnectionHandler<A, S::Socket>,
{
    pub(crate) inner: Arc<Inner<A, S, H>>,
}

impl<A, S, H> Clone for ConnectionManager<A, S, H>
where
    A: PeerAddr,
    S: SocketOps<A>,
    H: ConnectionHandler<A, S::Socket>,
{
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<A, S, H> ConnectionManager<A, S, H>
where
    A: PeerAddr,
    S: SocketOps<A>,
    H: ConnectionHandler<A, S::Socket>,
{
    /// Create a new manager.
    ///
    /// Prefer [`with_connection_manager`] unless the surrounding scope
    /// already guarantees [`shutdown`](Self::shutdown) on every exit path.
    pub fn new(
        config: ManagerConfig<A>,
        sockets: S,
        handler: H,
        prune_policy: impl PrunePolicy<A>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                sockets: Arc::new(sockets),
                handler: Arc::new(handler),
                prune_policy: Arc::new(prune_policy),
                table: StateTable::new(),
                shutdown: CancellationToken::new(),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn worker_env(&self) -> WorkerEnv<A, S, H> {
        WorkerEnv {
            table: self.inner.table.clone(),
            sockets: self.inner.sockets.clone(),
            handler: self.inner.handler.clone(),
            time_wait_timeout: self.inner.config.time_wait_timeout,
            shutdown: self.inner.shutdown.clone(),
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ensure_open(&self) -> Result<(), ConnectionError<A>> {
        if self.is_closed() {
            Err(ConnectionError::Shutdown)
        } else {
            Ok(())
        }
    }

    /// Number of connections counting toward the accepted-connections limit.
    pub fn number_of_connections(&self) -> usize {
        self.inner
            .table
            .snapshot()
            .iter()
            .filter(|(_, cell)| cell.peek(|st| st.counts_toward_limit()))
            .count()
    }

    /// The peer's current state, if it has an entry.
    pub fn abstract_state(&self, peer: &A) -> Option<AbstractState> {
        self.inner
            .table
            .get(peer)
            .map(|cell| cell.peek(|st| st.abstract_state()))
    }

    /// Snapshot of every peer entry and its state.
    pub fn snapshot(&self) -> Vec<(A, AbstractState)> {
        self.inner
            .table
            .snapshot()
            .into_iter()
            .map(|(peer, cell)| {
                let state = cell.peek(|st| st.abstract_state());
                (peer, state)
            })
            .collect()
    }

    /// The remote end started using the connection.
    ///
    /// Invoked by the inbound protocol governor on a warm promotion. Never
    /// cancels or re-owns the connection task; only the state tag moves.
    pub fn promoted_to_warm_remote(&self, peer: &A) -> OperationResult<()> {
        self.inner.table.with_state(peer, |st| {
            let Some(st) = st else {
                return OperationResult::UnsupportedState(AbstractState::Unknown);
            };
            let prior = st.abstract_state();
            let current = std::mem::replace(st, ConnectionState::Terminated { error: None });
            let (next, result) = match current {
                ConnectionState::OutboundDup {
                    conn_id,
                    thread,
                    handle,
                    ..
                } => (
                    ConnectionState::Duplex {
                        conn_id,
                        thread,
                        handle,
                    },
                    OperationResult::Done(()),
                ),
                ConnectionState::InboundIdle {
                    conn_id,
                    thread,
                    handle,
                    data_flow,
                } => (
                    ConnectionState::Inbound {
                        conn_id,
                        thread,
                        handle,
                        data_flow,
                    },
                    OperationResult::Done(()),
                ),
                other @ (ConnectionState::Inbound { .. } | ConnectionState::Duplex { .. }) => {
                    (other, OperationResult::Done(()))
                }
                other => (other, OperationResult::UnsupportedState(prior)),
            };
            *st = next;
            if result.is_done() {
                tracing::debug!(peer = ?peer, from = %prior, to = %st.abstract_state(),
                    "remote promoted to warm");
            }
            result
        })
    }

    /// The remote end went quiet again.
    ///
    /// Invoked by the inbound protocol governor on a cold demotion. The
    /// duplex reuse window restarts `Ticking`.
    pub fn demoted_to_cold_remote(&self, peer: &A) -> OperationResult<()> {
        self.inner.table.with_state(peer, |st| {
            let Some(st) = st else {
                return OperationResult::UnsupportedState(AbstractState::Unknown);
            };
            let prior = st.abstract_state();
            let current = std::mem::replace(st, ConnectionState::Terminated { error: None });
            let (next, result) = match current {
                ConnectionState::Inbound {
                    conn_id,
                    thread,
                    handle,
                    data_flow,
                } => (
                    ConnectionState::InboundIdle {
                        conn_id,
                        thread,
                        handle,
                        data_flow,
                    },
                    OperationResult::Done(()),
                ),
                ConnectionState::Duplex {
                    conn_id,
                    thread,
                    handle,
                } => (
                    ConnectionState::OutboundDup {
                        conn_id,
                        thread,
                        handle,
                        expiry: crate::conn::TimeoutExpired::Ticking,
                    },
                    OperationResult::Done(()),
                ),
                other => (other, OperationResult::UnsupportedState(prior)),
            };
            *st = next;
            if result.is_done() {
                tracing::debug!(peer = ?peer, from = %prior, to = %st.abstract_state(),
                    "remote demoted to cold");
            }
            result
        })
    }

    /// Tear the manager down.
    ///
    /// Every entry is rewritten to `Terminated` before its task is
    /// cancelled, which keeps cancelled tasks out of the TIME_WAIT path;
    /// tasks already sleeping there are woken through the manager-wide
    /// token. Shutdown therefore completes within the cancellation
    /// propagation bound, independent of the TIME_WAIT delay.
    pub async fn shutdown(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::info!("connection manager shutting down");

        self.inner.shutdown.cancel();

        let entries = self.inner.table.drain();
        let mut threads = Vec::with_capacity(entries.len());
        for (peer, cell) in entries {
            let thread = cell.lock().take_terminated();
            if let Some(thread) = thread {
                tracing::debug!(peer = ?peer, "cancelling connection task");
                thread.cancel();
                threads.push(thread);
            }
        }

        for thread in threads {
            let _ = tokio::time::timeout(SHUTDOWN_JOIN_TIMEOUT, thread.join).await;
        }
    }
}

/// Build a manager, hand it to `scope`, and shut it down when the scope
/// future finishes, successfully or not.
pub async fn with_connection_manager<A, S, H, P, F, Fut, R>(
    config: ManagerConfig<A>,
    sockets: S,
    handler: H,
    prune_policy: P,
    scope: F,
) -> R
where
    A: PeerAddr,
    S: SocketOps<A>,
    H: ConnectionHandler<A, S::Socket>,
    P: PrunePolicy<A>,
    F: FnOnce(ConnectionManager<A, S, H>) -> Fut,
    Fut: Future<Output = R>,
{
    let manager = ConnectionManager::new(config, sockets, handler, prune_policy);
    let result = scope(manager.clone()).await;
    manager.shutdown().await;
    result
}
