//! Accepted connection and its lifecycle state.
//!
//! A `Connection` is owned by exactly one handler task. Closing consumes
//! it, so a connection can only be released once.

use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::trace;

/// Current state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    /// Handed over by the listener, nothing done yet.
    Accepted,
    /// Waiting for the single bounded read.
    Reading,
    /// Writing the canned response.
    Writing,
    /// Released. Terminal.
    Closed,
}

/// A single accepted client connection.
#[derive(Debug)]
pub struct Connection<S = TcpStream> {
    id: u64,
    peer: SocketAddr,
    stream: S,
    state: ConnState,
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap a freshly accepted stream.
    pub fn new(id: u64, peer: SocketAddr, stream: S) -> Self {
        Self {
            id,
            peer,
            stream,
            state: ConnState::Accepted,
        }
    }

    /// Process-unique id assigned at accept time.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Remote endpoint of the connection.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnState {
        self.state
    }

    pub(crate) fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub(crate) fn transition(&mut self, next: ConnState) {
        trace!(conn_id = self.id, from = ?self.state(), to = ?next, "Connection state change");
        self.state = next;
    }

    /// Shut down the write half and drop the stream.
    ///
    /// Shutdown failures are ignored: the peer may already be gone, and the
    /// socket is closed on drop either way.
    pub async fn close(mut self) {
        self.transition(ConnState::Closed);
        if let Err(e) = self.stream.shutdown().await {
            trace!(conn_id = self.id, error = %e, "Shutdown on close failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    #[test]
    fn test_new_connection_is_accepted() {
        let (_client, server) = tokio::io::duplex(64);
        let conn = Connection::new(7, peer(), server);
        assert_eq!(conn.id(), 7);
        assert_eq!(conn.peer(), peer());
        assert_eq!(conn.state(), ConnState::Accepted);
    }

    #[test]
    fn test_transitions() {
        let (_client, server) = tokio::io::duplex(64);
        let mut conn = Connection::new(1, peer(), server);
        conn.transition(ConnState::Reading);
        assert_eq!(conn.state(), ConnState::Reading);
        conn.transition(ConnState::Writing);
        assert_eq!(conn.state(), ConnState::Writing);
    }

    #[tokio::test]
    async fn test_close_signals_eof_to_peer() {
        let (mut client, server) = tokio::io::duplex(64);
        let conn = Connection::new(1, peer(), server);
        conn.close().await;

        let mut buf = Vec::new();
        let n = client.read_to_end(&mut buf).await.unwrap();
        assert_eq!(n, 0);
    }

    #[tokio::test]
    async fn test_close_after_peer_dropped() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let conn = Connection::new(1, peer(), server);
        // Must not panic even though nobody is listening anymore.
        conn.close().await;
    }
}
