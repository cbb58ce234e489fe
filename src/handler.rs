//! Per-connection handler.
//!
//! One pass per connection: a single bounded read, one write of the canned
//! response, then release. Failures stay inside the pass; they are logged
//! and recorded in the returned [`Outcome`], never propagated.
//!
//! Behavior on partial or slow sends is "whatever arrived within one read
//! call". Nothing is parsed, so nothing more is waited for.

use crate::connection::{ConnState, Connection};
use crate::shutdown::Shutdown;
use std::future::Future;
use std::io;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// The response written to every connection.
pub const RESPONSE: &[u8] = b"HTTP/1.1 200 OK\r\n\r\nHello, World\r\n";

/// Capacity of the single read.
pub const READ_BUFFER_SIZE: usize = 1024;

/// Deadlines applied to each connection. `None` waits forever.
#[derive(Debug, Clone, Default)]
pub struct HandlerConfig {
    pub read_timeout: Option<Duration>,
    pub write_timeout: Option<Duration>,
}

/// Result of the read step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Read this many bytes (never more than `READ_BUFFER_SIZE`).
    Data(usize),
    /// Nothing arrived before the read deadline.
    TimedOut,
    /// The peer closed its write side without sending anything.
    Eof,
    Failed(io::ErrorKind),
    /// Shutdown was signalled while waiting.
    Cancelled,
}

impl ReadOutcome {
    /// Bytes read, as logged.
    pub fn bytes_read(&self) -> usize {
        match self {
            ReadOutcome::Data(n) => *n,
            _ => 0,
        }
    }

    fn should_respond(&self) -> bool {
        matches!(self, ReadOutcome::Data(_) | ReadOutcome::TimedOut)
    }
}

/// Result of the write step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    Written,
    /// The read step ended the pass early.
    Skipped,
    TimedOut,
    Failed(io::ErrorKind),
}

/// What one handler pass did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Outcome {
    pub read: ReadOutcome,
    pub write: WriteOutcome,
}

/// Handle a single connection to completion and release it.
pub async fn handle_connection<S>(
    mut conn: Connection<S>,
    config: &HandlerConfig,
    shutdown: &Shutdown,
) -> Outcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    conn.transition(ConnState::Reading);
    let read = read_once(&mut conn, config.read_timeout, shutdown).await;

    let write = if read.should_respond() {
        conn.transition(ConnState::Writing);
        write_response(&mut conn, config.write_timeout).await
    } else {
        WriteOutcome::Skipped
    };

    let conn_id = conn.id();
    conn.close().await;

    let outcome = Outcome { read, write };
    debug!(conn_id, bytes_read = read.bytes_read(), ?write, "Connection closed");
    outcome
}

async fn read_once<S>(
    conn: &mut Connection<S>,
    timeout: Option<Duration>,
    shutdown: &Shutdown,
) -> ReadOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let conn_id = conn.id();
    let peer = conn.peer();
    let mut buf = [0u8; READ_BUFFER_SIZE];

    let result = tokio::select! {
        res = with_deadline(timeout, conn.stream_mut().read(&mut buf)) => res,
        _ = shutdown.triggered() => {
            debug!(conn_id, %peer, "Read cancelled by shutdown");
            return ReadOutcome::Cancelled;
        }
    };

    match result {
        Some(Ok(0)) => {
            info!(conn_id, %peer, bytes_read = 0, "Peer closed without sending");
            ReadOutcome::Eof
        }
        Some(Ok(n)) => {
            info!(conn_id, %peer, bytes_read = n, "Read from connection");
            ReadOutcome::Data(n)
        }
        Some(Err(e)) => {
            debug!(conn_id, %peer, error = %e, "Read failed");
            ReadOutcome::Failed(e.kind())
        }
        None => {
            info!(conn_id, %peer, bytes_read = 0, "Read deadline elapsed");
            ReadOutcome::TimedOut
        }
    }
}

async fn write_response<S>(conn: &mut Connection<S>, timeout: Option<Duration>) -> WriteOutcome
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let conn_id = conn.id();

    match with_deadline(timeout, conn.stream_mut().write_all(RESPONSE)).await {
        Some(Ok(())) => WriteOutcome::Written,
        Some(Err(e)) => {
            debug!(conn_id, error = %e, "Write failed");
            WriteOutcome::Failed(e.kind())
        }
        None => {
            warn!(conn_id, "Write deadline elapsed");
            WriteOutcome::TimedOut
        }
    }
}

/// Run `fut`, giving up after `deadline` if one is set.
async fn with_deadline<F: Future>(deadline: Option<Duration>, fut: F) -> Option<F::Output> {
    match deadline {
        Some(d) => tokio::time::timeout(d, fut).await.ok(),
        None => Some(fut.await),
    }
}
