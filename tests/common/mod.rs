//! Shared test harness: an in-memory transport and a scripted handler.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::sleep;

use causeway::{
    AddrType, ConnectResult, ConnectionHandler, ConnectionId, ConnectionManager, DataFlow,
    HandleError, ManagerConfig, PrunePolicy, RandomPrunePolicy, SocketOps, Version,
};

/// Version that negotiates a unidirectional data flow.
pub const UNI_VERSION: Version = 1;

/// Version that negotiates a duplex data flow.
pub const DUPLEX_VERSION: Version = 2;

/// Data-flow mapping used by every test configuration.
pub fn flow_from_version(version: Version) -> DataFlow {
    if version >= DUPLEX_VERSION {
        DataFlow::Duplex
    } else {
        DataFlow::Unidirectional
    }
}

/// Address the fixture pretends to listen on.
pub fn listen_addr() -> SocketAddr {
    "127.0.0.1:7000".parse().unwrap()
}

/// A distinct peer address per test participant.
pub fn peer_addr(n: u8) -> SocketAddr {
    SocketAddr::from(([10, 0, 0, n], 9000))
}

// ============================================================================
// In-memory transport
// ============================================================================

#[derive(Debug)]
pub struct SocketRecord {
    pub closed: bool,
    pub remote: Option<SocketAddr>,
}

#[derive(Default)]
struct MemNet {
    next_socket: u64,
    next_port: u16,
    sockets: HashMap<u64, SocketRecord>,
    connect_delay: Duration,
    refused: HashSet<SocketAddr>,
}

/// In-memory [`SocketOps`] recording every socket, so tests can assert that
/// none leak.
#[derive(Clone, Default)]
pub struct MemSocketOps {
    net: Arc<Mutex<MemNet>>,
}

pub struct MemSocket {
    id: u64,
    local: SocketAddr,
}

impl MemSocketOps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fabricate a socket as if accepted by a listener bound to `local`.
    pub fn accepted(&self, local: SocketAddr) -> MemSocket {
        let mut net = self.net.lock();
        net.next_socket += 1;
        let id = net.next_socket;
        net.sockets.insert(
            id,
            SocketRecord {
                closed: false,
                remote: None,
            },
        );
        MemSocket { id, local }
    }

    /// Delay every `connect` call, to widen race windows deterministically.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.net.lock().connect_delay = delay;
    }

    /// Make `connect` to this address fail.
    pub fn refuse(&self, addr: SocketAddr) {
        self.net.lock().refused.insert(addr);
    }

    /// Total sockets ever created.
    pub fn total_opened(&self) -> usize {
        self.net.lock().sockets.len()
    }

    /// Sockets created and not yet closed.
    pub fn open_count(&self) -> usize {
        self.net.lock().sockets.values().filter(|r| !r.closed).count()
    }
}

#[async_trait]
impl SocketOps<SocketAddr> for MemSocketOps {
    type Socket = MemSocket;

    async fn open_to_connect(&self, _addr_type: AddrType) -> io::Result<MemSocket> {
        let mut net = self.net.lock();
        net.next_socket += 1;
        net.next_port += 1;
        let id = net.next_socket;
        let port = 40000 + net.next_port;
        net.sockets.insert(
            id,
            SocketRecord {
                closed: false,
                remote: None,
            },
        );
        Ok(MemSocket {
            id,
            local: SocketAddr::from(([127, 0, 0, 1], port)),
        })
    }

    async fn bind(&self, socket: &mut MemSocket, local: SocketAddr) -> io::Result<()> {
        socket.local = local;
        Ok(())
    }

    async fn connect(&self, socket: &mut MemSocket, remote: SocketAddr) -> io::Result<()> {
        let delay = self.net.lock().connect_delay;
        if !delay.is_zero() {
            sleep(delay).await;
        }
        let mut net = self.net.lock();
        if net.refused.contains(&remote) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "connection refused",
            ));
        }
        if let Some(record) = net.sockets.get_mut(&socket.id) {
            record.remote = Some(remote);
        }
        Ok(())
    }

    async fn close(&self, socket: MemSocket) {
        if let Some(record) = self.net.lock().sockets.get_mut(&socket.id) {
            record.closed = true;
        }
    }

    fn local_addr(&self, socket: &MemSocket) -> io::Result<SocketAddr> {
        Ok(socket.local)
    }
}

// ============================================================================
// Scripted handler
// ============================================================================

/// Handle the scripted handler returns on successful negotiation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxHandle {
    pub conn_id: ConnectionId<SocketAddr>,
}

/// Per-peer handshake behaviour.
#[derive(Clone)]
pub enum Script {
    /// Negotiate this version, after the gate fires if one is given.
    Succeed {
        version: Version,
        gate: Option<Arc<Notify>>,
    },
    /// Fail negotiation with this error.
    Fail(HandleError),
    /// Never finish negotiating.
    Hang,
}

/// [`ConnectionHandler`] driven by per-peer scripts. Without a script a peer
/// negotiates the default version immediately; `run` then blocks until the
/// test "closes" the remote end.
#[derive(Clone)]
pub struct ScriptedHandler {
    default_version: Version,
    scripts: Arc<Mutex<HashMap<SocketAddr, Script>>>,
    closers: Arc<Mutex<HashMap<SocketAddr, Arc<Notify>>>>,
}

impl ScriptedHandler {
    pub fn new(default_version: Version) -> Self {
        Self {
            default_version,
            scripts: Arc::new(Mutex::new(HashMap::new())),
            closers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn script(&self, remote: SocketAddr, script: Script) {
        self.scripts.lock().insert(remote, script);
    }

    /// Gate negotiation for `remote`; returns the notifier that releases it.
    pub fn gate(&self, remote: SocketAddr, version: Version) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        self.script(
            remote,
            Script::Succeed {
                version,
                gate: Some(gate.clone()),
            },
        );
        gate
    }

    /// Make `run` return for this remote, as if the peer closed the
    /// connection.
    pub fn close_remote(&self, remote: SocketAddr) {
        self.closers
            .lock()
            .entry(remote)
            .or_insert_with(|| Arc::new(Notify::new()))
            .notify_one();
    }
}

#[async_trait]
impl ConnectionHandler<SocketAddr, MemSocket> for ScriptedHandler {
    type Handle = MuxHandle;

    async fn negotiate(
        &self,
        _socket: &mut MemSocket,
        conn_id: &ConnectionId<SocketAddr>,
    ) -> Result<(MuxHandle, Version), HandleError> {
        let handle = MuxHandle { conn_id: *conn_id };
        let script = self.scripts.lock().get(&conn_id.remote).cloned();
        match script {
            None => Ok((handle, self.default_version)),
            Some(Script::Succeed { version, gate }) => {
                if let Some(gate) = gate {
                    gate.notified().await;
                }
                Ok((handle, version))
            }
            Some(Script::Fail(error)) => Err(error),
            Some(Script::Hang) => std::future::pending().await,
        }
    }

    async fn run(
        &self,
        _socket: &mut MemSocket,
        conn_id: &ConnectionId<SocketAddr>,
        _handle: MuxHandle,
    ) -> Result<(), HandleError> {
        let closer = self
            .closers
            .lock()
            .entry(conn_id.remote)
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone();
        closer.notified().await;
        Ok(())
    }
}

// ============================================================================
// Fixture
// ============================================================================

pub type TestManager = ConnectionManager<SocketAddr, MemSocketOps, ScriptedHandler>;

pub struct Fixture {
    pub sockets: MemSocketOps,
    pub handler: ScriptedHandler,
    pub cm: TestManager,
}

/// Fixture with a short TIME_WAIT so teardown-dependent tests finish fast.
pub fn fixture() -> Fixture {
    fixture_with(|config| config)
}

pub fn fixture_with(
    adjust: impl FnOnce(ManagerConfig<SocketAddr>) -> ManagerConfig<SocketAddr>,
) -> Fixture {
    fixture_full(adjust, RandomPrunePolicy)
}

pub fn fixture_full(
    adjust: impl FnOnce(ManagerConfig<SocketAddr>) -> ManagerConfig<SocketAddr>,
    policy: impl PrunePolicy<SocketAddr>,
) -> Fixture {
    init_tracing();
    let config = adjust(
        ManagerConfig::for_socket_addrs(flow_from_version)
            .with_time_wait_timeout(Duration::from_millis(50)),
    );
    let sockets = MemSocketOps::new();
    let handler = ScriptedHandler::new(DUPLEX_VERSION);
    let cm = ConnectionManager::new(config, sockets.clone(), handler.clone(), policy);
    Fixture {
        sockets,
        handler,
        cm,
    }
}

/// Admit an inbound connection for `peer` and expect it to come up.
pub async fn admit_inbound(f: &Fixture, peer: SocketAddr) -> MuxHandle {
    let socket = f.sockets.accepted(listen_addr());
    match f
        .cm
        .include_inbound(socket, peer)
        .await
        .expect("include_inbound failed")
    {
        ConnectResult::Connected { handle, .. } => handle,
        other => panic!("expected inbound connection, got {other:?}"),
    }
}

/// Prune policy with a fixed victim preference, for deterministic tests.
pub struct FixedPrunePolicy(pub Vec<SocketAddr>);

impl PrunePolicy<SocketAddr> for FixedPrunePolicy {
    fn select(
        &self,
        candidates: &HashMap<SocketAddr, causeway::ConnectionType>,
        count: usize,
    ) -> HashSet<SocketAddr> {
        self.0
            .iter()
            .filter(|addr| candidates.contains_key(addr))
            .take(count)
            .copied()
            .collect()
    }
}

/// Wait for a condition with timeout, polling periodically.
pub async fn wait_for<F, Fut>(timeout_ms: u64, poll_ms: u64, mut condition: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let start = std::time::Instant::now();
    let timeout = Duration::from_millis(timeout_ms);
    let poll = Duration::from_millis(poll_ms);

    loop {
        if condition().await {
            return true;
        }
        if start.elapsed() > timeout {
            return false;
        }
        sleep(poll).await;
    }
}

pub fn init_tracing() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
