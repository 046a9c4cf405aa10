//! Socket abstraction consumed by the manager.
//!
//! The manager drives sockets only through [`SocketOps`], so tests can swap
//! in an in-memory transport. [`TcpSocketOps`] is the production
//! implementation over tokio TCP.

use std::io;
use std::net::SocketAddr;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpSocket, TcpStream};

use crate::conn::AddrType;

/// Transport primitives the manager needs.
///
/// Every socket is owned either by a connection task (closed in its cleanup)
/// or by the dial path while it is still connecting (closed on failure). No
/// other component closes sockets.
#[async_trait]
pub trait SocketOps<A>: Send + Sync + 'static
where
    A: Send + Sync,
{
    /// The socket handle this implementation produces.
    type Socket: Send + 'static;

    /// Open a fresh socket suitable for dialing an address of the given
    /// family.
    async fn open_to_connect(&self, addr_type: AddrType) -> io::Result<Self::Socket>;

    /// Bind the unconnected socket to a local address.
    async fn bind(&self, socket: &mut Self::Socket, local: A) -> io::Result<()>;

    /// Connect the socket to the remote address.
    async fn connect(&self, socket: &mut Self::Socket, remote: A) -> io::Result<()>;

    /// Close the socket.
    async fn close(&self, socket: Self::Socket);

    /// The local address the socket is bound or connected on.
    fn local_addr(&self, socket: &Self::Socket) -> io::Result<A>;
}

/// Classify a socket address into the family used for local-bind selection.
pub fn classify_socket_addr(addr: &SocketAddr) -> AddrType {
    match addr {
        SocketAddr::V4(_) => AddrType::Ipv4,
        SocketAddr::V6(_) => AddrType::Ipv6,
    }
}

/// A TCP connection in either its pre-connect or established phase.
#[derive(Debug)]
pub struct TcpConn {
    inner: TcpConnInner,
}

#[derive(Debug)]
enum TcpConnInner {
    Unconnected(TcpSocket),
    Connected(TcpStream),
    Closed,
}

impl TcpConn {
    /// Wrap a stream accepted by a listener.
    pub fn from_stream(stream: TcpStream) -> Self {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::warn!(error = %e, "Failed to set TCP_NODELAY");
        }
        Self {
            inner: TcpConnInner::Connected(stream),
        }
    }

    /// Access the established stream, if the connection phase is over.
    pub fn stream_mut(&mut self) -> Option<&mut TcpStream> {
        match &mut self.inner {
            TcpConnInner::Connected(stream) => Some(stream),
            _ => None,
        }
    }

    fn local(&self) -> io::Result<SocketAddr> {
        match &self.inner {
            TcpConnInner::Unconnected(socket) => socket.local_addr(),
            TcpConnInner::Connected(stream) => stream.local_addr(),
            TcpConnInner::Closed => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "socket already closed",
            )),
        }
    }
}

/// [`SocketOps`] over tokio TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpSocketOps;

#[async_trait]
impl SocketOps<SocketAddr> for TcpSocketOps {
    type Socket = TcpConn;

    async fn open_to_connect(&self, addr_type: AddrType) -> io::Result<TcpConn> {
        let socket = match addr_type {
            AddrType::Ipv6 => TcpSocket::new_v6()?,
            AddrType::Ipv4 | AddrType::Other => TcpSocket::new_v4()?,
        };
        Ok(TcpConn {
            inner: TcpConnInner::Unconnected(socket),
        })
    }

    async fn bind(&self, socket: &mut TcpConn, local: SocketAddr) -> io::Result<()> {
        match &socket.inner {
            TcpConnInner::Unconnected(s) => s.bind(local),
            _ => Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "socket is not in its pre-connect phase",
            )),
        }
    }

    async fn connect(&self, socket: &mut TcpConn, remote: SocketAddr) -> io::Result<()> {
        match std::mem::replace(&mut socket.inner, TcpConnInner::Closed) {
            TcpConnInner::Unconnected(s) => {
                let stream = s.connect(remote).await?;
                if let Err(e) = stream.set_nodelay(true) {
                    tracing::warn!(addr = %remote, error = %e, "Failed to set TCP_NODELAY");
                }
                socket.inner = TcpConnInner::Connected(stream);
                Ok(())
            }
            other => {
                socket.inner = other;
                Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "socket is not in its pre-connect phase",
                ))
            }
        }
    }

    async fn close(&self, socket: TcpConn) {
        if let TcpConnInner::Connected(mut stream) = socket.inner {
            // best-effort half close; the kernel side closes on drop
            let _ = stream.shutdown().await;
        }
    }

    fn local_addr(&self, socket: &TcpConn) -> io::Result<SocketAddr> {
        socket.local()
    }
}
