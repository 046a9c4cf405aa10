//! Per-connection task: drives the handler and cleans up the state row.
//!
//! Exactly one task exists per connection. It owns the socket for its whole
//! life and always runs its cleanup step, even when cancelled mid-handshake
//! or mid-multiplex: cancellation only interrupts the handler region, never
//! the cleanup that follows it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::conn::state::{ConnThread, ConnectionState};
use crate::conn::{ConnectionId, PeerAddr};
use crate::handler::{ConnectionHandler, HandleError, HandleErrorKind, Version};
use crate::manager::table::{PeerCell, StateTable};
use crate::socket::SocketOps;

/// Result delivered on the handshake promise.
pub(crate) type Negotiated<H> = Result<(H, Version), HandleError>;

/// Handles returned by [`spawn_connection`].
pub(crate) struct SpawnedConn<H> {
    /// Thread ownership to store in the peer's state row.
    pub thread: ConnThread,
    /// Resolves once the handler reports negotiation success or failure.
    /// A dropped sender means the task was stopped before negotiating.
    pub promise: oneshot::Receiver<Negotiated<H>>,
    /// Fire after the state row is written. Dropping it instead makes the
    /// task close its socket and exit without ever touching the table.
    pub registered: oneshot::Sender<()>,
}

/// Everything a connection task needs besides its socket.
///
/// The task deliberately holds the table and the peer key rather than an
/// owning reference into the table: every cleanup step re-looks its entry up
/// under the table lock and only acts when the entry is still its own cell.
pub(crate) struct WorkerEnv<A, S, H>
where
    A: PeerAddr,
    S: SocketOps<A>,
    H: ConnectionHandler<A, S::Socket>,
{
    pub table: Arc<StateTable<A, H::Handle>>,
    pub sockets: Arc<S>,
    pub handler: Arc<H>,
    pub time_wait_timeout: Duration,
    /// Manager-wide token; interrupts TIME_WAIT sleeps on shutdown.
    pub shutdown: CancellationToken,
}

impl<A, S, H> Clone for WorkerEnv<A, S, H>
where
    A: PeerAddr,
    S: SocketOps<A>,
    H: ConnectionHandler<A, S::Socket>,
{
    fn clone(&self) -> Self {
        Self {
            table: self.table.clone(),
            sockets: self.sockets.clone(),
            handler: self.handler.clone(),
            time_wait_timeout: self.time_wait_timeout,
            shutdown: self.shutdown.clone(),
        }
    }
}

/// Spawn the task owning `socket`.
///
/// The task first waits for the `registered` gate so that its cleanup can
/// never observe a table in which its own row does not exist yet.
pub(crate) fn spawn_connection<A, S, H>(
    env: WorkerEnv<A, S, H>,
    peer: A,
    conn_id: ConnectionId<A>,
    socket: S::Socket,
    cell: Weak<PeerCell<A, H::Handle>>,
) -> SpawnedConn<H::Handle>
where
    A: PeerAddr,
    S: SocketOps<A>,
    H: ConnectionHandler<A, S::Socket>,
{
    let cancel = CancellationToken::new();
    let task_cancel = cancel.clone();
    let (promise_tx, promise_rx) = oneshot::channel();
    let (registered_tx, registered_rx) = oneshot::channel::<()>();

    let join = tokio::spawn(async move {
        let mut socket = socket;

        if registered_rx.await.is_err() {
            // never registered: close the socket and vanish
            env.sockets.close(socket).await;
            return;
        }

        tokio::select! {
            _ = task_cancel.cancelled() => {
                tracing::debug!(peer = ?peer, "connection task cancelled");
            }
            _ = drive(&env, &peer, &conn_id, &mut socket, &cell, promise_tx) => {}
        }

        cleanup(&env, &peer, &cell, socket).await;
    });

    SpawnedConn {
        thread: ConnThread { join, cancel },
        promise: promise_rx,
        registered: registered_tx,
    }
}

/// Negotiate, report on the promise, then run the multiplexer.
async fn drive<A, S, H>(
    env: &WorkerEnv<A, S, H>,
    peer: &A,
    conn_id: &ConnectionId<A>,
    socket: &mut S::Socket,
    cell: &Weak<PeerCell<A, H::Handle>>,
    promise: oneshot::Sender<Negotiated<H::Handle>>,
) where
    A: PeerAddr,
    S: SocketOps<A>,
    H: ConnectionHandler<A, S::Socket>,
{
    match env.handler.negotiate(socket, conn_id).await {
        Ok((handle, version)) => {
            let _ = promise.send(Ok((handle.clone(), version)));
            if let Err(error) = env.handler.run(socket, conn_id, handle).await {
                tracing::debug!(peer = ?peer, %error, "connection handler exited with error");
            }
        }
        Err(error) => {
            // Write the classified terminal state before resolving the
            // promise, so the operation waiting on it observes a settled row.
            classify_failure(&env.table, peer, cell, &error);
            let _ = promise.send(Err(error));
        }
    }
}

/// Rewrite the peer's row according to the handshake failure class:
/// soft failures keep a `Terminating` row (TIME_WAIT applies), protocol
/// violations go straight to `Terminated`.
fn classify_failure<A, H>(
    table: &StateTable<A, H>,
    peer: &A,
    cell: &Weak<PeerCell<A, H>>,
    error: &HandleError,
) where
    A: PeerAddr,
{
    let Some(cell) = cell.upgrade() else {
        return;
    };
    let entries = table.entries();
    let Some(current) = entries.get(peer) else {
        return;
    };
    if !Arc::ptr_eq(current, &cell) {
        return;
    }

    let mut st = cell.lock();
    let prior = std::mem::replace(
        &mut *st,
        ConnectionState::Terminated {
            error: Some(error.clone()),
        },
    );
    if error.kind == HandleErrorKind::HandshakeFailure {
        if let ConnectionState::Unnegotiated {
            conn_id, thread, ..
        } = prior
        {
            *st = ConnectionState::Terminating {
                conn_id,
                thread,
                error: Some(error.clone()),
            };
        }
    }
    tracing::debug!(peer = ?peer, kind = %error.kind, state = %st.abstract_state(),
        "handshake failure classified");
}

/// The cleanup step. Runs exactly once per task, cancelled or not.
async fn cleanup<A, S, H>(
    env: &WorkerEnv<A, S, H>,
    peer: &A,
    cell: &Weak<PeerCell<A, H::Handle>>,
    socket: S::Socket,
) where
    A: PeerAddr,
    S: SocketOps<A>,
    H: ConnectionHandler<A, S::Socket>,
{
    let Some(cell) = cell.upgrade() else {
        env.sockets.close(socket).await;
        return;
    };

    enum Next {
        /// Keep the row for the TIME_WAIT window, then remove it.
        TimeWait,
        /// The connection died in active use; drop the row right away.
        Reset,
        /// The row is gone, foreign, or already settled; just close.
        CloseOnly,
    }

    let next = {
        let mut entries = env.table.entries();
        let ours = entries
            .get(peer)
            .map_or(false, |current| Arc::ptr_eq(current, &cell));
        if !ours {
            // a fresh connection re-registered this peer; its cell is not
            // ours to touch
            Next::CloseOnly
        } else {
            let decision = {
                let mut st = cell.lock();
                match &*st {
                    ConnectionState::InboundIdle { .. } => {
                        // remote went away while idle; keep the entry for
                        // the TIME_WAIT window
                        st.take_terminated();
                        Next::TimeWait
                    }
                    ConnectionState::Terminating { .. } => Next::TimeWait,
                    // a settled row stays until it is reused or shut down
                    ConnectionState::Terminated { .. } => Next::CloseOnly,
                    _ => {
                        tracing::debug!(peer = ?peer, state = %st.abstract_state(),
                            "connection reset");
                        st.take_terminated();
                        Next::Reset
                    }
                }
            };
            if matches!(decision, Next::Reset) {
                entries.remove(peer);
            }
            decision
        }
    };

    env.sockets.close(socket).await;

    if matches!(next, Next::TimeWait) {
        tokio::select! {
            _ = tokio::time::sleep(env.time_wait_timeout) => {}
            _ = env.shutdown.cancelled() => {}
        }
        if env.table.finalize_remove(peer, &cell) {
            tracing::debug!(peer = ?peer, "peer entry removed after TIME_WAIT");
        }
    }
}
