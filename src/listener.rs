//! Bound TCP listener that produces accepted connections.

use crate::connection::Connection;
use std::future::Future;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};

/// How the accept loop should react to a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcceptErrorKind {
    /// Only the pending connection failed, or the call was interrupted. Retry.
    Transient,
    /// Out of file descriptors or memory. Back off, then retry.
    ResourceExhausted,
    /// The listening socket is unusable. Stop accepting.
    Fatal,
}

/// Classify an error returned by `accept`.
///
/// Linux reports network errors of a pending connection (`EPROTO`, `EPERM`,
/// `ENETUNREACH`, ...) through `accept` itself, so only errors that describe
/// the listening descriptor are fatal.
pub fn classify(e: &io::Error) -> AcceptErrorKind {
    if let Some(code) = e.raw_os_error() {
        return match code {
            libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM => {
                AcceptErrorKind::ResourceExhausted
            }
            libc::EBADF | libc::ENOTSOCK | libc::EINVAL | libc::EFAULT => AcceptErrorKind::Fatal,
            _ => AcceptErrorKind::Transient,
        };
    }

    match e.kind() {
        io::ErrorKind::NotConnected | io::ErrorKind::InvalidInput => AcceptErrorKind::Fatal,
        _ => AcceptErrorKind::Transient,
    }
}

/// A source of accepted connections for the accept loop.
pub trait Accept {
    type Stream: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Address the source is bound to.
    fn local_addr(&self) -> io::Result<SocketAddr>;

    /// Wait for the next connection. Must be cancel safe.
    fn accept(&mut self) -> impl Future<Output = io::Result<Connection<Self::Stream>>> + Send;
}

/// The listening socket. Owned by the accept loop only.
#[derive(Debug)]
pub struct Listener {
    inner: TcpListener,
    next_id: u64,
}

impl Listener {
    /// Bind `addr` with `SO_REUSEADDR` and the given listen backlog.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn bind(addr: &str, backlog: i32) -> io::Result<Self> {
        let addr = resolve(addr)?;
        let std_listener = create_listener(addr, backlog)?;
        Ok(Self {
            inner: TcpListener::from_std(std_listener)?,
            next_id: 0,
        })
    }
}

impl Accept for Listener {
    type Stream = TcpStream;

    /// Bound address, useful after binding port 0.
    fn local_addr(&self) -> io::Result<SocketAddr> {
        self.inner.local_addr()
    }

    /// Wait for the next connection. Cancel safe.
    async fn accept(&mut self) -> io::Result<Connection<TcpStream>> {
        let (stream, peer) = self.inner.accept().await?;
        self.next_id += 1;
        Ok(Connection::new(self.next_id, peer, stream))
    }
}

fn resolve(addr: &str) -> io::Result<SocketAddr> {
    addr.to_socket_addrs()?.next().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("address '{}' did not resolve", addr),
        )
    })
}

/// Create a non-blocking listening socket.
///
/// `SO_REUSEPORT` is left off so a second bind on a busy port fails with
/// `AddrInUse` instead of silently sharing it.
fn create_listener(addr: SocketAddr, backlog: i32) -> io::Result<std::net::TcpListener> {
    let socket = socket2::Socket::new(
        match addr {
            SocketAddr::V4(_) => socket2::Domain::IPV4,
            SocketAddr::V6(_) => socket2::Domain::IPV6,
        },
        socket2::Type::STREAM,
        Some(socket2::Protocol::TCP),
    )?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog)?;

    Ok(socket.into())
}
