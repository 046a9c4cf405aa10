//! Inbound admission and governor-driven demotion.

use std::sync::Arc;

use crate::conn::state::ConnectionState;
use crate::conn::worker::spawn_connection;
use crate::conn::{AbstractState, ConnectionId, DataFlow, PeerAddr, Provenance, TimeoutExpired};
use crate::error::ConnectionError;
use crate::handler::ConnectionHandler;
use crate::manager::table::PeerCell;
use crate::manager::{ConnectResult, ConnectionManager, Demotion, OperationResult};
use crate::socket::SocketOps;

impl<A, S, H> ConnectionManager<A, S, H>
where
    A: PeerAddr,
    S: SocketOps<A>,
    H: ConnectionHandler<A, S::Socket>,
{
    /// Admit an accepted socket for `peer` and wait for its negotiation.
    ///
    /// A fresh entry is registered unconditionally: during a
    /// near-simultaneous open the peer may have left behind a stillborn
    /// outbound reservation, which is displaced (nothing blocks on it). The
    /// call suspends until the handler reports the negotiation outcome.
    ///
    /// No idle timeout is armed here; the inbound protocol governor demotes
    /// idle remotes out-of-band via
    /// [`unregister_inbound`](Self::unregister_inbound).
    pub async fn include_inbound(
        &self,
        socket: S::Socket,
        peer: A,
    ) -> Result<ConnectResult<A, H::Handle>, ConnectionError<A>> {
        self.ensure_open()?;

        let local = self.inner.sockets.local_addr(&socket)?;
        let conn_id = ConnectionId {
            remote: peer.clone(),
            local,
        };
        tracing::debug!(peer = ?peer, conn = %conn_id, "including inbound connection");

        let cell = PeerCell::new(ConnectionState::Terminated { error: None });
        let spawned = spawn_connection(
            self.worker_env(),
            peer.clone(),
            conn_id.clone(),
            socket,
            Arc::downgrade(&cell),
        );

        {
            let mut entries = self.inner.table.entries();
            if self.is_closed() {
                // shutdown won the race; the dropped gate makes the task
                // close its socket and exit
                drop(spawned.registered);
                return Err(ConnectionError::Shutdown);
            }
            *cell.lock() = ConnectionState::Unnegotiated {
                provenance: Provenance::Inbound,
                conn_id: conn_id.clone(),
                thread: spawned.thread,
            };
            if let Some(displaced) = entries.insert(peer.clone(), cell.clone()) {
                displace(&peer, &displaced);
            }
        }

        if spawned.registered.send(()).is_err() {
            // the task died before registration; report an aborted handshake
            return Ok(ConnectResult::Disconnected {
                conn_id: Some(conn_id),
                error: None,
            });
        }

        match spawned.promise.await {
            Ok(Ok((handle, version))) => {
                let data_flow = (self.inner.config.data_flow)(version);
                self.finish_inbound_negotiation(&peer, &cell, conn_id, data_flow, handle)
            }
            Ok(Err(error)) => {
                // the task has already classified the failure into the row
                tracing::debug!(peer = ?peer, %error, "inbound handshake failed");
                Ok(ConnectResult::Disconnected {
                    conn_id: Some(conn_id),
                    error: Some(error),
                })
            }
            Err(_) => Ok(ConnectResult::Disconnected {
                conn_id: Some(conn_id),
                error: None,
            }),
        }
    }

    fn finish_inbound_negotiation(
        &self,
        peer: &A,
        cell: &Arc<PeerCell<A, H::Handle>>,
        conn_id: ConnectionId<A>,
        data_flow: DataFlow,
        handle: H::Handle,
    ) -> Result<ConnectResult<A, H::Handle>, ConnectionError<A>> {
        let entries = self.inner.table.entries();
        let ours = entries
            .get(peer)
            .map_or(false, |current| Arc::ptr_eq(current, cell));
        if !ours {
            // displaced while negotiating; the newer connection wins
            return Ok(ConnectResult::Disconnected {
                conn_id: Some(conn_id),
                error: None,
            });
        }

        let mut st = cell.lock();
        let current = std::mem::replace(&mut *st, ConnectionState::Terminated { error: None });
        match current {
            ConnectionState::Unnegotiated { thread, .. } => {
                *st = ConnectionState::InboundIdle {
                    conn_id: conn_id.clone(),
                    thread,
                    handle: handle.clone(),
                    data_flow,
                };
                tracing::debug!(peer = ?peer, flow = %data_flow, "inbound connection negotiated");
                Ok(ConnectResult::Connected {
                    conn_id,
                    data_flow,
                    handle,
                })
            }
            other @ (ConnectionState::Terminating { .. } | ConnectionState::Terminated { .. }) => {
                let error = other.error().cloned();
                *st = other;
                Ok(ConnectResult::Disconnected {
                    conn_id: Some(conn_id),
                    error,
                })
            }
            other => {
                let state = other.abstract_state();
                *st = other;
                tracing::error!(peer = ?peer, %state,
                    "invariant violation: inbound negotiation finished in unexpected state");
                Err(ConnectionError::ImpossibleState { peer: peer.clone() })
            }
        }
    }

    /// Demote the inbound side of `peer`'s connection.
    ///
    /// Invoked by the inbound protocol governor once the remote has been
    /// idle past its idle timeout. The reply tells the governor whether the
    /// transport is kept for outbound use ([`Demotion::Keep`]) or committed
    /// to termination ([`Demotion::Commit`]).
    pub fn unregister_inbound(&self, peer: &A) -> OperationResult<Demotion> {
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
                    expiry: TimeoutExpired::Ticking,
                } => (
                    ConnectionState::OutboundDup {
                        conn_id,
                        thread,
                        handle,
                        expiry: TimeoutExpired::Expired,
                    },
                    OperationResult::Done(Demotion::Keep),
                ),
                other @ ConnectionState::OutboundDup {
                    expiry: TimeoutExpired::Expired,
                    ..
                } => (other, OperationResult::Done(Demotion::Keep)),
                ConnectionState::InboundIdle {
                    conn_id, thread, ..
                } => {
                    thread.cancel();
                    (
                        ConnectionState::Terminating {
                            conn_id,
                            thread,
                            error: None,
                        },
                        OperationResult::Done(Demotion::Commit),
                    )
                }
                other @ ConnectionState::Terminating { .. } => {
                    (other, OperationResult::Done(Demotion::Commit))
                }
                // The two arms below are unreachable unless the governor
                // skipped a cold demotion; keep the system safe, report the
                // violation, and still answer `UnsupportedState`.
                ConnectionState::Inbound {
                    conn_id, thread, ..
                } => {
                    tracing::error!(peer = ?peer, state = %prior,
                        "invariant violation: inbound unregister while remote is warm");
                    thread.cancel();
                    (
                        ConnectionState::Terminating {
                            conn_id,
                            thread,
                            error: None,
                        },
                        OperationResult::UnsupportedState(prior),
                    )
                }
                ConnectionState::Duplex {
                    conn_id,
                    thread,
                    handle,
                } => {
                    tracing::error!(peer = ?peer, state = %prior,
                        "invariant violation: inbound unregister while in duplex use");
                    (
                        ConnectionState::OutboundDup {
                            conn_id,
                            thread,
                            handle,
                            expiry: TimeoutExpired::Ticking,
                        },
                        OperationResult::UnsupportedState(prior),
                    )
                }
                other => (other, OperationResult::UnsupportedState(prior)),
            };
            *st = next;
            if result.is_done() {
                tracing::debug!(peer = ?peer, from = %prior, to = %st.abstract_state(),
                    "inbound side unregistered");
            }
            result
        })
    }
}

/// Rewrite a displaced cell to `Terminated` and cancel any task it owned.
///
/// The fresh entry has already taken the key; the old cell must not remain
/// referenced by the table, and anyone still waiting on it has to observe a
/// terminal state.
fn displace<A: PeerAddr, H>(peer: &A, cell: &Arc<PeerCell<A, H>>) {
    let mut st = cell.lock();
    let prior = st.abstract_state();
    match prior {
        AbstractState::ReservedOutbound
        | AbstractState::Terminating
        | AbstractState::Terminated => {
            tracing::debug!(peer = ?peer, state = %prior,
                "displaced previous entry for inbound connection");
        }
        _ => {
            tracing::error!(peer = ?peer, state = %prior,
                "invariant violation: displaced live entry for inbound connection");
        }
    }
    if let Some(thread) = st.take_terminated() {
        thread.cancel();
    }
}
