//! TCP server: the accept loop.
//!
//! Accepts connections and hands each one to its own task running
//! [`handle_connection`]. The loop never waits for a handler. Accept errors
//! are classified: transient ones are logged and retried, fatal ones stop
//! the loop and are returned to the caller.

use crate::config::Config;
use crate::handler::{handle_connection, HandlerConfig, Outcome};
use crate::listener::{classify, Accept, AcceptErrorKind, Listener};
use crate::shutdown::Shutdown;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, trace, warn};

/// Pause after running out of file descriptors or memory.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Server instance
pub struct Server {
    config: Config,
    handler: Arc<HandlerConfig>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Create a new server instance
    pub fn new(config: Config) -> Self {
        let handler = HandlerConfig {
            read_timeout: config.read_timeout,
            write_timeout: config.write_timeout,
        };
        let connection_limit = Arc::new(Semaphore::new(config.max_connections));

        Server {
            config,
            handler: Arc::new(handler),
            connection_limit,
        }
    }

    /// Bind the configured address.
    pub fn bind(&self) -> Result<Listener, ServerError> {
        Listener::bind(&self.config.listen, self.config.backlog)
            .map_err(|e| ServerError::Bind(self.config.listen.clone(), e))
    }

    /// Bind, then serve until shutdown or a fatal accept error.
    pub async fn run(&self, shutdown: Shutdown) -> Result<(), ServerError> {
        let listener = self.bind()?;
        self.serve(listener, shutdown).await
    }

    /// Accept connections on `listener` until `shutdown` is triggered or
    /// accepting fails fatally. The listener is dropped before in-flight
    /// handlers are drained.
    pub async fn serve<L: Accept>(
        &self,
        mut listener: L,
        shutdown: Shutdown,
    ) -> Result<(), ServerError> {
        if let Ok(addr) = listener.local_addr() {
            info!(address = %addr, "Server listening");
        }

        let mut tasks: JoinSet<Outcome> = JoinSet::new();

        let result = loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                biased;
                _ = shutdown.triggered() => break Ok(()),
                permit = Arc::clone(&self.connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let accepted = tokio::select! {
                biased;
                _ = shutdown.triggered() => break Ok(()),
                Some(joined) = tasks.join_next() => {
                    reap(joined);
                    continue;
                }
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok(conn) => {
                    info!(conn_id = conn.id(), peer = %conn.peer(), "Connection accepted");

                    let handler = Arc::clone(&self.handler);
                    let shutdown = shutdown.clone();
                    tasks.spawn(async move {
                        let outcome = handle_connection(conn, &handler, &shutdown).await;
                        drop(permit);
                        outcome
                    });
                }
                Err(e) => match classify(&e) {
                    AcceptErrorKind::Transient => {
                        warn!(error = %e, "Failed to accept connection, continuing");
                    }
                    AcceptErrorKind::ResourceExhausted => {
                        warn!(error = %e, backoff = ?ACCEPT_BACKOFF, "Out of resources while accepting");
                        tokio::select! {
                            _ = shutdown.triggered() => break Ok(()),
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                    AcceptErrorKind::Fatal => {
                        error!(error = %e, "Fatal accept error, stopping accept loop");
                        break Err(ServerError::Accept(e));
                    }
                },
            }
        };

        drop(listener);
        info!(shutdown = shutdown.is_triggered(), "Listener closed");

        drain(&mut tasks, self.config.shutdown_grace).await;
        result
    }
}

/// Wait up to `grace` for in-flight handlers, then abort what is left.
async fn drain(tasks: &mut JoinSet<Outcome>, grace: Duration) {
    if tasks.is_empty() {
        return;
    }
    info!(in_flight = tasks.len(), "Waiting for in-flight connections");

    let drained = tokio::time::timeout(grace, async {
        while let Some(joined) = tasks.join_next().await {
            reap(joined);
        }
    })
    .await;

    if drained.is_err() {
        warn!(remaining = tasks.len(), "Grace period elapsed, aborting remaining connections");
        tasks.shutdown().await;
    }
}

fn reap(joined: Result<Outcome, JoinError>) {
    match joined {
        Ok(outcome) => trace!(
            bytes_read = outcome.read.bytes_read(),
            write = ?outcome.write,
            "Connection task finished"
        ),
        Err(e) if e.is_panic() => error!(error = %e, "Connection task panicked"),
        Err(e) => debug!(error = %e, "Connection task cancelled"),
    }
}

/// Errors that stop the server
#[derive(Debug)]
pub enum ServerError {
    /// Could not bind the listening address.
    Bind(String, io::Error),
    /// `accept` failed in a way the listener cannot recover from.
    Accept(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::Bind(addr, e) => write!(f, "Failed to bind '{}': {}", addr, e),
            ServerError::Accept(e) => write!(f, "Failed to accept connection: {}", e),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Bind(_, e) | ServerError::Accept(e) => Some(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::RESPONSE;
    use crate::connection::Connection;
    use std::net::SocketAddr;
    use std::time::Instant;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt, DuplexStream};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;

    const WAIT: Duration = Duration::from_secs(5);

    fn test_config() -> Config {
        Config {
            listen: "127.0.0.1:0".to_string(),
            read_timeout: None,
            write_timeout: Some(Duration::from_secs(5)),
            shutdown_grace: Duration::from_secs(1),
            ..Config::default()
        }
    }

    fn start(config: Config) -> (SocketAddr, Shutdown, JoinHandle<Result<(), ServerError>>) {
        let server = Server::new(config);
        let listener = server.bind().unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = Shutdown::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.serve(listener, shutdown).await })
        };
        (addr, shutdown, handle)
    }

    async fn read_all<S: AsyncRead + Unpin>(stream: &mut S) -> Vec<u8> {
        let mut received = Vec::new();
        tokio::time::timeout(WAIT, stream.read_to_end(&mut received))
            .await
            .expect("server did not close the connection")
            .unwrap();
        received
    }

    #[tokio::test]
    async fn test_ping_gets_exact_response_then_close() {
        let (addr, shutdown, handle) = start(test_config());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"PING").await.unwrap();
        assert_eq!(read_all(&mut client).await, RESPONSE);

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_silent_client_does_not_block_others() {
        let (addr, shutdown, handle) = start(test_config());

        // Connects and sends nothing; its handler blocks on read forever.
        let _silent = TcpStream::connect(addr).await.unwrap();

        for _ in 0..3 {
            let mut client = TcpStream::connect(addr).await.unwrap();
            client.write_all(b"hello").await.unwrap();
            assert_eq!(read_all(&mut client).await, RESPONSE);
        }

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_silent_client_answered_at_read_deadline() {
        let config = Config {
            read_timeout: Some(Duration::from_millis(100)),
            ..test_config()
        };
        let (addr, shutdown, handle) = start(config);

        let mut client = TcpStream::connect(addr).await.unwrap();
        assert_eq!(read_all(&mut client).await, RESPONSE);

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_server_survives_failed_connections() {
        let (addr, shutdown, handle) = start(test_config());

        // Closes without sending: the handler reads EOF and skips the write.
        let quitter = TcpStream::connect(addr).await.unwrap();
        drop(quitter);

        // Sends garbage and disappears before the response is read.
        let mut rude = TcpStream::connect(addr).await.unwrap();
        rude.write_all(b"\x00\x01\x02").await.unwrap();
        drop(rude);

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(b"PING").await.unwrap();
        assert_eq!(read_all(&mut client).await, RESPONSE);

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_half_closed_client_gets_no_response() {
        let (addr, shutdown, handle) = start(test_config());

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.shutdown().await.unwrap();
        assert!(read_all(&mut client).await.is_empty());

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_clients_all_answered() {
        let (addr, shutdown, handle) = start(test_config());

        let mut clients = JoinSet::new();
        for i in 0..16u8 {
            clients.spawn(async move {
                let mut client = TcpStream::connect(addr).await.unwrap();
                client.write_all(&[b'a' + i; 8]).await.unwrap();
                read_all(&mut client).await
            });
        }
        while let Some(received) = clients.join_next().await {
            assert_eq!(received.unwrap(), RESPONSE);
        }

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connection_limit_queues_instead_of_failing() {
        let config = Config {
            max_connections: 1,
            read_timeout: Some(Duration::from_millis(200)),
            ..test_config()
        };
        let (addr, shutdown, handle) = start(config);

        // Holds the only slot until its read deadline.
        let mut first = TcpStream::connect(addr).await.unwrap();
        let mut second = TcpStream::connect(addr).await.unwrap();
        second.write_all(b"PING").await.unwrap();

        assert_eq!(read_all(&mut first).await, RESPONSE);
        assert_eq!(read_all(&mut second).await, RESPONSE);

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_bind_failure_is_reported() {
        let (addr, shutdown, handle) = start(test_config());

        let config = Config {
            listen: addr.to_string(),
            ..test_config()
        };
        let err = Server::new(config).run(Shutdown::new()).await.unwrap_err();
        match err {
            ServerError::Bind(listen, e) => {
                assert_eq!(listen, addr.to_string());
                assert_eq!(e.kind(), io::ErrorKind::AddrInUse);
            }
            other => panic!("unexpected: {:?}", other),
        }

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_releases_socket() {
        let (addr, shutdown, handle) = start(test_config());

        shutdown.trigger();
        tokio::time::timeout(WAIT, handle)
            .await
            .expect("serve did not return")
            .unwrap()
            .unwrap();

        // The port is free again.
        std::net::TcpListener::bind(addr).unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_cancels_idle_connections() {
        let (addr, shutdown, handle) = start(test_config());

        let mut idle = TcpStream::connect(addr).await.unwrap();
        // Let the accept loop pick it up.
        tokio::time::sleep(Duration::from_millis(50)).await;

        shutdown.trigger();
        tokio::time::timeout(WAIT, handle)
            .await
            .expect("serve did not return")
            .unwrap()
            .unwrap();

        let mut received = Vec::new();
        let _ = tokio::time::timeout(WAIT, idle.read_to_end(&mut received)).await;
        assert!(received.is_empty());
    }

    #[test]
    fn test_error_display() {
        let err = ServerError::Bind(
            "0.0.0.0:8080".to_string(),
            io::Error::from(io::ErrorKind::AddrInUse),
        );
        assert!(err.to_string().starts_with("Failed to bind '0.0.0.0:8080'"));

        let err = ServerError::Accept(io::Error::new(io::ErrorKind::Other, "boom"));
        assert_eq!(err.to_string(), "Failed to accept connection: boom");
    }

    /// Accept source that replays results pushed through a channel.
    struct ScriptedListener {
        script: mpsc::UnboundedReceiver<io::Result<DuplexStream>>,
        next_id: u64,
    }

    impl Accept for ScriptedListener {
        type Stream = DuplexStream;

        fn local_addr(&self) -> io::Result<SocketAddr> {
            Ok("127.0.0.1:8080".parse().unwrap())
        }

        async fn accept(&mut self) -> io::Result<Connection<DuplexStream>> {
            match self.script.recv().await {
                Some(Ok(stream)) => {
                    self.next_id += 1;
                    let peer = "127.0.0.1:50000".parse().unwrap();
                    Ok(Connection::new(self.next_id, peer, stream))
                }
                Some(Err(e)) => Err(e),
                None => std::future::pending().await,
            }
        }
    }

    type Script = mpsc::UnboundedSender<io::Result<DuplexStream>>;

    fn start_scripted(config: Config) -> (Script, Shutdown, JoinHandle<Result<(), ServerError>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let listener = ScriptedListener {
            script: rx,
            next_id: 0,
        };
        let server = Server::new(config);
        let shutdown = Shutdown::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { server.serve(listener, shutdown).await })
        };
        (tx, shutdown, handle)
    }

    /// Queue a connection whose client already sent `request`.
    async fn connect_scripted(script: &Script, request: &[u8]) -> DuplexStream {
        let (mut client, server) = tokio::io::duplex(1024);
        client.write_all(request).await.unwrap();
        script.send(Ok(server)).unwrap();
        client
    }

    #[tokio::test]
    async fn test_transient_accept_errors_keep_serving() {
        let (script, shutdown, handle) = start_scripted(test_config());

        script
            .send(Err(io::Error::from_raw_os_error(libc::EPROTO)))
            .unwrap();
        script
            .send(Err(io::Error::from_raw_os_error(libc::EPERM)))
            .unwrap();
        script
            .send(Err(io::Error::from(io::ErrorKind::ConnectionAborted)))
            .unwrap();

        let mut client = connect_scripted(&script, b"PING").await;
        assert_eq!(read_all(&mut client).await, RESPONSE);
        assert!(!handle.is_finished());

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_resource_exhaustion_backs_off_then_serves() {
        let (script, shutdown, handle) = start_scripted(test_config());
        let started = Instant::now();

        script
            .send(Err(io::Error::from_raw_os_error(libc::EMFILE)))
            .unwrap();
        let mut client = connect_scripted(&script, b"PING").await;

        assert_eq!(read_all(&mut client).await, RESPONSE);
        assert!(started.elapsed() >= ACCEPT_BACKOFF);
        assert!(!handle.is_finished());

        shutdown.trigger();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_fatal_accept_error_stops_and_drains() {
        let (script, _shutdown, handle) = start_scripted(test_config());

        let mut in_flight = connect_scripted(&script, b"PING").await;
        script
            .send(Err(io::Error::from_raw_os_error(libc::EBADF)))
            .unwrap();

        let result = tokio::time::timeout(WAIT, handle)
            .await
            .expect("serve did not return")
            .unwrap();
        match result {
            Err(ServerError::Accept(e)) => assert_eq!(e.raw_os_error(), Some(libc::EBADF)),
            other => panic!("unexpected: {:?}", other),
        }

        // The accept source was dropped with the loop.
        assert!(script.is_closed());
        // The connection accepted before the failure was still answered.
        assert_eq!(read_all(&mut in_flight).await, RESPONSE);
    }
}
