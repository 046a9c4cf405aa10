//! Outbound dial path, local demotion and the prune pass.

use std::collections::HashMap;
use std::sync::Arc;

use crate::conn::state::ConnectionState;
use crate::conn::worker::{spawn_connection, SpawnedConn};
use crate::conn::{ConnectionId, DataFlow, PeerAddr, Provenance, TimeoutExpired};
use crate::error::ConnectionError;
use crate::handler::ConnectionHandler;
use crate::manager::table::PeerCell;
use crate::manager::{ConnectResult, ConnectionManager};
use crate::socket::SocketOps;

/// Phase-A verdict: what the table says about an outbound request.
enum OutboundDecision<A, H> {
    /// No usable connection; dial a fresh socket against this reservation.
    Dial(Arc<PeerCell<A, H>>),
    /// An inbound duplex connection was folded into outbound use.
    Reused(ConnectResult<A, H>),
    /// The previous connection is still terminating; wait and re-inspect.
    AwaitTermination(Arc<PeerCell<A, H>>),
    /// An inbound connection is mid-handshake; wait for its negotiation.
    AwaitNegotiation(Arc<PeerCell<A, H>>),
}

/// Phase-B verdict of a dial attempt.
enum DialOutcome<A, H> {
    Done(ConnectResult<A, H>),
    /// An accept displaced our reservation while we were connecting.
    Replaced,
}

impl<A, S, H> ConnectionManager<A, S, H>
where
    A: PeerAddr,
    S: SocketOps<A>,
    H: ConnectionHandler<A, S::Socket>,
{
    /// Request an outbound connection to `peer`.
    ///
    /// Reuses an existing inbound connection when its negotiated data flow
    /// is duplex, waits out a terminating predecessor or an inbound
    /// handshake in flight, and only dials a fresh socket when the table
    /// holds nothing usable.
    pub async fn request_outbound(
        &self,
        peer: A,
    ) -> Result<ConnectResult<A, H::Handle>, ConnectionError<A>> {
        loop {
            self.ensure_open()?;
            match self.inspect_for_outbound(&peer)? {
                OutboundDecision::Dial(cell) => match self.dial(&peer, cell).await? {
                    DialOutcome::Done(result) => return Ok(result),
                    // near-simultaneous open: retry against the new entry
                    DialOutcome::Replaced => continue,
                },
                OutboundDecision::Reused(result) => return Ok(result),
                OutboundDecision::AwaitTermination(cell) => {
                    cell.wait_while(|st| matches!(st, ConnectionState::Terminating { .. }))
                        .await;
                }
                OutboundDecision::AwaitNegotiation(cell) => {
                    return self.reuse_after_negotiation(&peer, cell).await;
                }
            }
        }
    }

    /// Phase A: inspect (and possibly claim) the peer's entry under the
    /// table lock.
    fn inspect_for_outbound(
        &self,
        peer: &A,
    ) -> Result<OutboundDecision<A, H::Handle>, ConnectionError<A>> {
        let mut entries = self.inner.table.entries();
        if self.is_closed() {
            return Err(ConnectionError::Shutdown);
        }

        let Some(cell) = entries.get(peer).cloned() else {
            let cell = PeerCell::new(ConnectionState::ReservedOutbound);
            entries.insert(peer.clone(), cell.clone());
            tracing::debug!(peer = ?peer, "outbound dial reserved");
            return Ok(OutboundDecision::Dial(cell));
        };

        let mut st = cell.lock();
        let current = std::mem::replace(&mut *st, ConnectionState::Terminated { error: None });
        let (next, decision) = match current {
            ConnectionState::Terminated { .. } => {
                tracing::debug!(peer = ?peer, "outbound dial re-reserved terminated entry");
                (
                    ConnectionState::ReservedOutbound,
                    Ok(OutboundDecision::Dial(cell.clone())),
                )
            }
            other @ ConnectionState::Terminating { .. } => (
                other,
                Ok(OutboundDecision::AwaitTermination(cell.clone())),
            ),
            other @ ConnectionState::Unnegotiated {
                provenance: Provenance::Inbound,
                ..
            } => (
                other,
                Ok(OutboundDecision::AwaitNegotiation(cell.clone())),
            ),
            ConnectionState::InboundIdle {
                conn_id,
                thread,
                handle,
                data_flow: DataFlow::Duplex,
            } => {
                let result = ConnectResult::Connected {
                    conn_id: conn_id.clone(),
                    data_flow: DataFlow::Duplex,
                    handle: handle.clone(),
                };
                tracing::debug!(peer = ?peer, conn = %conn_id,
                    "reusing idle inbound duplex connection for outbound");
                (
                    ConnectionState::OutboundDup {
                        conn_id,
                        thread,
                        handle,
                        expiry: TimeoutExpired::Ticking,
                    },
                    Ok(OutboundDecision::Reused(result)),
                )
            }
            ConnectionState::Inbound {
                conn_id,
                thread,
                handle,
                data_flow: DataFlow::Duplex,
            } => {
                let result = ConnectResult::Connected {
                    conn_id: conn_id.clone(),
                    data_flow: DataFlow::Duplex,
                    handle: handle.clone(),
                };
                tracing::debug!(peer = ?peer, conn = %conn_id,
                    "reusing active inbound duplex connection for outbound");
                (
                    ConnectionState::Duplex {
                        conn_id,
                        thread,
                        handle,
                    },
                    Ok(OutboundDecision::Reused(result)),
                )
            }
            ConnectionState::InboundIdle {
                conn_id,
                thread,
                handle,
                data_flow: DataFlow::Unidirectional,
            } => {
                let err = ConnectionError::ForbiddenConnection {
                    conn_id: conn_id.clone(),
                };
                (
                    ConnectionState::InboundIdle {
                        conn_id,
                        thread,
                        handle,
                        data_flow: DataFlow::Unidirectional,
                    },
                    Err(err),
                )
            }
            ConnectionState::Inbound {
                conn_id,
                thread,
                handle,
                data_flow: DataFlow::Unidirectional,
            } => {
                let err = ConnectionError::ForbiddenConnection {
                    conn_id: conn_id.clone(),
                };
                (
                    ConnectionState::Inbound {
                        conn_id,
                        thread,
                        handle,
                        data_flow: DataFlow::Unidirectional,
                    },
                    Err(err),
                )
            }
            other @ (ConnectionState::ReservedOutbound
            | ConnectionState::Unnegotiated {
                provenance: Provenance::Outbound,
                ..
            }
            | ConnectionState::OutboundUni { .. }
            | ConnectionState::OutboundDup { .. }
            | ConnectionState::Duplex { .. }) => (
                other,
                Err(ConnectionError::ConnectionExists {
                    provenance: Provenance::Outbound,
                    peer: peer.clone(),
                }),
            ),
        };
        *st = next;
        decision
    }

    /// Phase B, fresh dial: open, bind, connect, then negotiate.
    ///
    /// Any failure after the socket is opened closes it and clears the
    /// reservation before the error propagates.
    async fn dial(
        &self,
        peer: &A,
        cell: Arc<PeerCell<A, H::Handle>>,
    ) -> Result<DialOutcome<A, H::Handle>, ConnectionError<A>> {
        let inner = &self.inner;
        let addr_type = (inner.config.classifier)(peer);

        let mut socket = match inner.sockets.open_to_connect(addr_type).await {
            Ok(socket) => socket,
            Err(e) => {
                self.abandon_dial(peer, &cell);
                return Err(e.into());
            }
        };

        if let Some(local) = inner.config.local_bind_addr(addr_type) {
            if let Err(e) = inner.sockets.bind(&mut socket, local).await {
                inner.sockets.close(socket).await;
                self.abandon_dial(peer, &cell);
                return Err(e.into());
            }
        }

        if let Err(e) = inner.sockets.connect(&mut socket, peer.clone()).await {
            tracing::debug!(peer = ?peer, error = %e, "outbound connect failed");
            inner.sockets.close(socket).await;
            self.abandon_dial(peer, &cell);
            return Err(e.into());
        }

        let local = match inner.sockets.local_addr(&socket) {
            Ok(local) => local,
            Err(e) => {
                inner.sockets.close(socket).await;
                self.abandon_dial(peer, &cell);
                return Err(e.into());
            }
        };
        let conn_id = ConnectionId {
            remote: peer.clone(),
            local,
        };
        tracing::debug!(peer = ?peer, conn = %conn_id, "outbound socket connected");

        let SpawnedConn {
            thread,
            promise,
            registered,
        } = spawn_connection(
            self.worker_env(),
            peer.clone(),
            conn_id.clone(),
            socket,
            Arc::downgrade(&cell),
        );

        // Claim the reservation. An accept may have displaced it while we
        // were connecting.
        let claimed = {
            let entries = inner.table.entries();
            let ours = entries
                .get(peer)
                .map_or(false, |current| Arc::ptr_eq(current, &cell));
            if ours {
                let mut st = cell.lock();
                if matches!(&*st, ConnectionState::ReservedOutbound) {
                    *st = ConnectionState::Unnegotiated {
                        provenance: Provenance::Outbound,
                        conn_id: conn_id.clone(),
                        thread,
                    };
                    true
                } else {
                    false
                }
            } else {
                false
            }
        };
        if !claimed {
            // the task owns the socket; the dropped gate makes it close
            // the socket and exit without touching the table
            drop(registered);
            tracing::debug!(peer = ?peer,
                "outbound reservation displaced by inbound connection");
            return Ok(DialOutcome::Replaced);
        }
        if registered.send(()).is_err() {
            return Ok(DialOutcome::Done(ConnectResult::Disconnected {
                conn_id: Some(conn_id),
                error: None,
            }));
        }

        match promise.await {
            Ok(Ok((handle, version))) => {
                let data_flow = (inner.config.data_flow)(version);
                let result =
                    self.finish_outbound_negotiation(peer, &cell, conn_id, data_flow, handle)?;
                Ok(DialOutcome::Done(result))
            }
            Ok(Err(error)) => {
                // the task classified the failure; outbound contracts drop
                // the entry right away
                self.inner.table.finalize_remove(peer, &cell);
                tracing::debug!(peer = ?peer, %error, "outbound handshake failed");
                Ok(DialOutcome::Done(ConnectResult::Disconnected {
                    conn_id: Some(conn_id),
                    error: Some(error),
                }))
            }
            Err(_) => Ok(DialOutcome::Done(ConnectResult::Disconnected {
                conn_id: Some(conn_id),
                error: None,
            })),
        }
    }

    /// Drop a reservation that never became a connection.
    fn abandon_dial(&self, peer: &A, cell: &Arc<PeerCell<A, H::Handle>>) {
        let mut entries = self.inner.table.entries();
        let ours = entries
            .get(peer)
            .map_or(false, |current| Arc::ptr_eq(current, cell));
        if !ours {
            return;
        }
        {
            let mut st = cell.lock();
            if !matches!(
                &*st,
                ConnectionState::ReservedOutbound | ConnectionState::Terminated { .. }
            ) {
                return;
            }
            *st = ConnectionState::Terminated { error: None };
        }
        entries.remove(peer);
    }

    fn finish_outbound_negotiation(
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
            return Ok(ConnectResult::Disconnected {
                conn_id: Some(conn_id),
                error: None,
            });
        }

        let mut st = cell.lock();
        let current = std::mem::replace(&mut *st, ConnectionState::Terminated { error: None });
        match current {
            ConnectionState::Unnegotiated { thread, .. } => {
                *st = match data_flow {
                    DataFlow::Unidirectional => ConnectionState::OutboundUni {
                        conn_id: conn_id.clone(),
                        thread,
                        handle: handle.clone(),
                    },
                    DataFlow::Duplex => ConnectionState::OutboundDup {
                        conn_id: conn_id.clone(),
                        thread,
                        handle: handle.clone(),
                        expiry: TimeoutExpired::Ticking,
                    },
                };
                tracing::debug!(peer = ?peer, flow = %data_flow, "outbound connection negotiated");
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
                    "invariant violation: outbound negotiation finished in unexpected state");
                Err(ConnectionError::ImpossibleState { peer: peer.clone() })
            }
        }
    }

    /// Phase B, reuse: wait for the inbound handshake to finish, then fold
    /// the connection into outbound use.
    async fn reuse_after_negotiation(
        &self,
        peer: &A,
        cell: Arc<PeerCell<A, H::Handle>>,
    ) -> Result<ConnectResult<A, H::Handle>, ConnectionError<A>> {
        tracing::debug!(peer = ?peer, "awaiting inbound negotiation for outbound reuse");
        loop {
            cell.wait_while(|st| matches!(st, ConnectionState::Unnegotiated { .. }))
                .await;

            let outcome = {
                let mut st = cell.lock();
                let current =
                    std::mem::replace(&mut *st, ConnectionState::Terminated { error: None });
                let (next, outcome) = match current {
                    ConnectionState::InboundIdle {
                        conn_id,
                        thread,
                        handle,
                        data_flow: DataFlow::Duplex,
                    } => {
                        let result = ConnectResult::Connected {
                            conn_id: conn_id.clone(),
                            data_flow: DataFlow::Duplex,
                            handle: handle.clone(),
                        };
                        (
                            ConnectionState::OutboundDup {
                                conn_id,
                                thread,
                                handle,
                                expiry: TimeoutExpired::Ticking,
                            },
                            Some(Ok(result)),
                        )
                    }
                    ConnectionState::Inbound {
                        conn_id,
                        thread,
                        handle,
                        data_flow: DataFlow::Duplex,
                    } => {
                        let result = ConnectResult::Connected {
                            conn_id: conn_id.clone(),
                            data_flow: DataFlow::Duplex,
                            handle: handle.clone(),
                        };
                        (
                            ConnectionState::Duplex {
                                conn_id,
                                thread,
                                handle,
                            },
                            Some(Ok(result)),
                        )
                    }
                    other @ (ConnectionState::InboundIdle {
                        data_flow: DataFlow::Unidirectional,
                        ..
                    }
                    | ConnectionState::Inbound {
                        data_flow: DataFlow::Unidirectional,
                        ..
                    }) => {
                        let err = match other.conn_id() {
                            Some(conn_id) => ConnectionError::ForbiddenConnection {
                                conn_id: conn_id.clone(),
                            },
                            None => ConnectionError::ImpossibleState { peer: peer.clone() },
                        };
                        (other, Some(Err(err)))
                    }
                    other @ (ConnectionState::Terminating { .. }
                    | ConnectionState::Terminated { .. }) => {
                        let error = other.error().cloned();
                        let conn_id = other.conn_id().cloned();
                        (
                            other,
                            Some(Ok(ConnectResult::Disconnected { conn_id, error })),
                        )
                    }
                    // spurious wakeup; the handshake is still running
                    other @ ConnectionState::Unnegotiated { .. } => (other, None),
                    other @ (ConnectionState::OutboundUni { .. }
                    | ConnectionState::OutboundDup { .. }
                    | ConnectionState::Duplex { .. }) => {
                        // a concurrent outbound request claimed it first
                        let err = ConnectionError::ConnectionExists {
                            provenance: Provenance::Outbound,
                            peer: peer.clone(),
                        };
                        (other, Some(Err(err)))
                    }
                    ConnectionState::ReservedOutbound => (
                        ConnectionState::ReservedOutbound,
                        Some(Err(ConnectionError::ImpossibleState { peer: peer.clone() })),
                    ),
                };
                *st = next;
                outcome
            };

            if let Some(outcome) = outcome {
                if let Ok(ConnectResult::Connected { conn_id, .. }) = &outcome {
                    tracing::debug!(peer = ?peer, conn = %conn_id,
                        "inbound connection reused for outbound");
                }
                return outcome;
            }
        }
    }

    /// Demote or tear down the outbound side of `peer`'s connection.
    ///
    /// Unknown peers and already-terminating connections are no-op
    /// successes. Demoting a duplex connection runs the prune pass
    /// afterwards, since the connection starts counting toward the
    /// accepted-connections limit.
    pub fn unregister_outbound(&self, peer: &A) -> Result<(), ConnectionError<A>> {
        let run_prune = self.inner.table.with_state(peer, |st| {
            let Some(st) = st else {
                return Ok(false);
            };
            let prior = st.abstract_state();
            let current = std::mem::replace(st, ConnectionState::Terminated { error: None });
            let (next, result) = match current {
                ConnectionState::OutboundUni {
                    conn_id, thread, ..
                } => {
                    thread.cancel();
                    (
                        ConnectionState::Terminating {
                            conn_id,
                            thread,
                            error: None,
                        },
                        Ok(false),
                    )
                }
                ConnectionState::OutboundDup {
                    conn_id,
                    thread,
                    expiry: TimeoutExpired::Expired,
                    ..
                } => {
                    thread.cancel();
                    (
                        ConnectionState::Terminating {
                            conn_id,
                            thread,
                            error: None,
                        },
                        Ok(false),
                    )
                }
                ConnectionState::OutboundDup {
                    conn_id,
                    thread,
                    handle,
                    expiry: TimeoutExpired::Ticking,
                } => (
                    // reuse window still open: fall back to an idle inbound
                    // duplex connection, keep the task running
                    ConnectionState::InboundIdle {
                        conn_id,
                        thread,
                        handle,
                        data_flow: DataFlow::Duplex,
                    },
                    Ok(false),
                ),
                other @ ConnectionState::InboundIdle {
                    data_flow: DataFlow::Duplex,
                    ..
                } => (other, Ok(false)),
                ConnectionState::Duplex {
                    conn_id,
                    thread,
                    handle,
                } => {
                    tracing::debug!(peer = ?peer, conn = %conn_id,
                        "outbound side demoted, connection stays inbound");
                    (
                        ConnectionState::Inbound {
                            conn_id,
                            thread,
                            handle,
                            data_flow: DataFlow::Duplex,
                        },
                        Ok(true),
                    )
                }
                other @ (ConnectionState::InboundIdle {
                    data_flow: DataFlow::Unidirectional,
                    ..
                }
                | ConnectionState::Inbound { .. }
                | ConnectionState::ReservedOutbound
                | ConnectionState::Unnegotiated { .. }) => {
                    let err = ConnectionError::ForbiddenOperation {
                        peer: peer.clone(),
                        state: prior,
                    };
                    (other, Err(err))
                }
                other @ (ConnectionState::Terminating { .. }
                | ConnectionState::Terminated { .. }) => (other, Ok(false)),
            };
            *st = next;
            if result.is_ok() {
                tracing::debug!(peer = ?peer, from = %prior, to = %st.abstract_state(),
                    "outbound side unregistered");
            }
            result
        })?;

        if run_prune {
            self.prune_to_limit();
        }
        Ok(())
    }

    /// Cancel enough connections to get back under the hard limit.
    ///
    /// Victim rows are never rewritten here; the victims' cleanup handlers
    /// settle them.
    fn prune_to_limit(&self) {
        let hard_limit = self.inner.config.accepted_connections_limit.hard_limit;

        let (count, candidates) = {
            let entries = self.inner.table.entries();
            let mut count = 0;
            let mut candidates = HashMap::new();
            for (peer, cell) in entries.iter() {
                cell.peek(|st| {
                    if st.counts_toward_limit() {
                        count += 1;
                    }
                    if let (Some(conn_type), Some(_)) = (st.connection_type(), st.thread()) {
                        candidates.insert(peer.clone(), conn_type);
                    }
                });
            }
            (count, candidates)
        };

        if count <= hard_limit {
            return;
        }
        let excess = count - hard_limit;
        let victims = self.inner.prune_policy.select(&candidates, excess);

        let entries = self.inner.table.entries();
        let mut pruned = 0;
        for victim in &victims {
            if let Some(cell) = entries.get(victim) {
                cell.peek(|st| {
                    if let Some(thread) = st.thread() {
                        thread.cancel();
                        pruned += 1;
                    }
                });
            }
        }
        tracing::info!(connections = count, hard_limit, pruned,
            "pruned connections above the hard limit");
    }
}
