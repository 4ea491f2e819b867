//! HTTP server for the asset root.
//!
//! Owns the listening socket and the handler chain, accepts connections,
//! and drains in-flight requests on shutdown.

use crate::config::Config;
use crate::files::FileHandler;
use crate::handler::{with_cors, CorsHandler, Handler};
use crate::http::{Method, ParseResult, Parser, Response};
use crate::port::{bind_listener, find_available_port, PortError};
use bytes::{Buf, BytesMut};
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::sync::{watch, Semaphore};
use tracing::{debug, error, info, trace, warn};

/// Maximum number of concurrent connections
const MAX_CONNECTIONS: usize = 1024;

/// Read buffer size
const BUFFER_SIZE: usize = 16 * 1024;

/// Pause after `accept` fails for lack of descriptors or memory
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on waiting for open connections at shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Server instance
pub struct Server {
    root: PathBuf,
    local_addr: SocketAddr,
    listener: TcpListener,
    handler: Arc<dyn Handler>,
    connection_limit: Arc<Semaphore>,
}

impl Server {
    /// Check the asset root, pick a port and bind to it.
    ///
    /// Nothing is bound if the root is missing or the scan finds no
    /// free port.
    pub async fn bind(config: &Config) -> Result<Self, ServerError> {
        let files = FileHandler::new(&config.root).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => ServerError::MissingRoot(config.root.clone()),
            _ => ServerError::NotADirectory(config.root.clone()),
        })?;

        let port = find_available_port(config.host, config.port, config.scan_width)?;
        if port != config.port {
            info!(requested = config.port, port, "Requested port is busy, using next free port");
        }

        let addr = SocketAddr::new(config.host, port);
        let listener = bind_listener(addr)
            .and_then(TcpListener::from_std)
            .map_err(|e| ServerError::Bind(addr, e))?;
        let local_addr = listener.local_addr().map_err(|e| ServerError::Bind(addr, e))?;

        let handler = CorsHandler::new(files, config.script_extensions.clone());

        Ok(Server {
            root: config.root.clone(),
            local_addr,
            listener,
            handler: Arc::new(handler),
            connection_limit: Arc::new(Semaphore::new(MAX_CONNECTIONS)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// URL a browser should open.
    pub fn url(&self) -> String {
        let host = if self.local_addr.ip().is_loopback() {
            "localhost".to_string()
        } else {
            self.local_addr.ip().to_string()
        };
        format!("http://{}:{}", host, self.local_addr.port())
    }

    /// Serve until Ctrl+C.
    pub async fn run(self) -> Result<(), ServerError> {
        self.run_until(shutdown_signal()).await
    }

    /// Serve until `shutdown` resolves, then drain open connections.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()>,
    {
        let Server {
            listener,
            handler,
            connection_limit,
            ..
        } = self;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        tokio::pin!(shutdown);

        let result = loop {
            // Wait for a connection slot
            let permit = tokio::select! {
                _ = &mut shutdown => break Ok(()),
                permit = Arc::clone(&connection_limit).acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let accepted = tokio::select! {
                _ = &mut shutdown => break Ok(()),
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => {
                    debug!(peer = %peer, "New connection");

                    let handler = Arc::clone(&handler);
                    let shutdown_rx = shutdown_rx.clone();

                    tokio::spawn(async move {
                        if let Err(e) = handle_connection(stream, handler, shutdown_rx).await {
                            debug!(peer = %peer, error = %e, "Connection error");
                        }
                        drop(permit);
                    });
                }
                Err(e) => match classify_accept_error(&e) {
                    AcceptError::Transient => {
                        debug!(error = %e, "Failed to accept connection");
                    }
                    AcceptError::Exhausted => {
                        warn!(error = %e, "Out of resources accepting connections, backing off");
                        drop(permit);
                        tokio::select! {
                            _ = &mut shutdown => break Ok(()),
                            _ = tokio::time::sleep(ACCEPT_BACKOFF) => {}
                        }
                    }
                    AcceptError::Fatal => {
                        error!(error = %e, "Fatal accept error");
                        break Err(ServerError::Accept(e));
                    }
                },
            }
        };

        info!("Shutting down, waiting for open connections");
        drop(listener);
        let _ = shutdown_tx.send(true);

        // Every permit back means every connection task has finished
        let drain = connection_limit.acquire_many(MAX_CONNECTIONS as u32);
        match tokio::time::timeout(DRAIN_TIMEOUT, drain).await {
            Ok(_) => info!("Server shutdown complete"),
            Err(_) => warn!(
                open = MAX_CONNECTIONS - connection_limit.available_permits(),
                "Connections still open after drain timeout, exiting anyway"
            ),
        }

        result
    }
}

/// Resolves on Ctrl+C. If the signal handler cannot be installed the
/// server runs until killed.
async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Server stopped by user"),
        Err(e) => {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    }
}

/// How the accept loop reacts to a failed `accept`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AcceptError {
    /// Only the pending connection is affected
    Transient,
    /// Out of descriptors or memory; clears as connections close
    Exhausted,
    /// The listener itself is unusable
    Fatal,
}

fn classify_accept_error(e: &io::Error) -> AcceptError {
    match e.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock
        | io::ErrorKind::TimedOut => return AcceptError::Transient,
        io::ErrorKind::OutOfMemory => return AcceptError::Exhausted,
        _ => {}
    }

    match e.raw_os_error() {
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM) => AcceptError::Exhausted,
        // Network errors accept(2) passes through from the new socket
        Some(
            libc::EPROTO
            | libc::ENOPROTOOPT
            | libc::ENETDOWN
            | libc::ENETUNREACH
            | libc::EHOSTDOWN
            | libc::EHOSTUNREACH
            | libc::EOPNOTSUPP
            | libc::EPERM,
        ) => AcceptError::Transient,
        _ => AcceptError::Fatal,
    }
}

/// Handle a single client connection.
///
/// Requests are answered in order until the client closes or asks for
/// `Connection: close`. Shutdown lets a response in progress finish and
/// closes the connection at its next read, dropping any partial request.
pub async fn handle_connection<S>(
    mut stream: S,
    handler: Arc<dyn Handler>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buffer = BytesMut::with_capacity(BUFFER_SIZE);

    loop {
        match Parser::parse(&buffer) {
            ParseResult::Complete(request, consumed) => {
                buffer.advance(consumed);

                let keep_alive = request.keep_alive() && !*shutdown.borrow();
                let head_only = request.method == Method::Head;
                let method = request.method.clone();
                let target = request.target.clone();

                // File reads block, keep them off the reactor
                let handler = Arc::clone(&handler);
                let response = match tokio::task::spawn_blocking(move || handler.handle(&request))
                    .await
                {
                    Ok(response) => response,
                    Err(e) => {
                        error!(error = %e, "Request handler failed");
                        with_cors(Response::error(500, "Internal server error"))
                    }
                };

                info!(
                    method = %method,
                    path = %target,
                    status = response.status(),
                    bytes = response.body().len(),
                    "Request"
                );

                write_response(&mut stream, &response, head_only, keep_alive).await?;

                if !keep_alive {
                    return Ok(());
                }
            }

            ParseResult::Incomplete => {
                if *shutdown.borrow() {
                    return Ok(());
                }
                let n = tokio::select! {
                    _ = shutdown.changed() => {
                        if !buffer.is_empty() {
                            debug!(buffered = buffer.len(), "Dropping partial request on shutdown");
                        }
                        return Ok(());
                    }
                    n = stream.read_buf(&mut buffer) => n?,
                };

                if n == 0 {
                    trace!("Connection closed by client");
                    return Ok(());
                }
            }

            ParseResult::Error(e) => {
                warn!(error = %e, "Malformed request");
                let response = with_cors(Response::error(e.status(), &e.to_string()));
                write_response(&mut stream, &response, false, false).await?;
                return Ok(());
            }
        }
    }
}

/// Write the head, then the body straight from its `Bytes`.
async fn write_response<S>(
    stream: &mut S,
    response: &Response,
    head_only: bool,
    keep_alive: bool,
) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream.write_all(&response.encode_head(keep_alive)).await?;
    if let Some(body) = response.payload(head_only) {
        stream.write_all(body).await?;
    }
    stream.flush().await
}

/// Server startup and serving errors
#[derive(Debug)]
pub enum ServerError {
    MissingRoot(PathBuf),
    NotADirectory(PathBuf),
    Port(PortError),
    Bind(SocketAddr, io::Error),
    Accept(io::Error),
}

impl std::fmt::Display for ServerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerError::MissingRoot(path) => {
                write!(f, "Web files directory not found: {}", path.display())
            }
            ServerError::NotADirectory(path) => {
                write!(f, "Web files path is not a directory: {}", path.display())
            }
            ServerError::Port(e) => write!(f, "{}", e),
            ServerError::Bind(addr, e) => write!(f, "Error starting server on {}: {}", addr, e),
            ServerError::Accept(e) => write!(f, "Server error: {}", e),
        }
    }
}

impl std::error::Error for ServerError {}

impl From<PortError> for ServerError {
    fn from(e: PortError) -> Self {
        ServerError::Port(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::SCRIPT_MIME_TYPE;
    use crate::http::date::parse_http_date;
    use crate::http::response::SERVER_NAME;
    use std::fs;
    use std::net::{IpAddr, Ipv4Addr};
    use tempfile::TempDir;
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    const CORS: &str = "Access-Control-Allow-Origin: *\r\n\
                        Access-Control-Allow-Methods: GET, POST, OPTIONS\r\n\
                        Access-Control-Allow-Headers: *\r\n";

    fn assets() -> TempDir {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("index.html"), "<h1>Image Desk</h1>").unwrap();
        fs::write(temp_dir.path().join("script.js"), "let zoom = 1;\n").unwrap();
        temp_dir
    }

    fn config(root: &Path, port: u16) -> Config {
        Config {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port,
            scan_width: 100,
            root: root.to_path_buf(),
            script_extensions: vec!["js".to_string()],
            log_level: "info".to_string(),
            notices: Vec::new(),
        }
    }

    fn free_port() -> u16 {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    }

    fn file_handler(root: &Path) -> Arc<dyn Handler> {
        Arc::new(CorsHandler::new(
            FileHandler::new(root).unwrap(),
            vec!["js".to_string()],
        ))
    }

    /// Send `request` over an in-memory stream, close the write side and
    /// collect everything the connection handler writes back.
    async fn exchange(root: &Path, request: &[u8]) -> String {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let (_tx, rx) = watch::channel(false);
        let connection = tokio::spawn(handle_connection(server, file_handler(root), rx));

        client.write_all(request).await.unwrap();
        client.shutdown().await.unwrap();
        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();

        connection.await.unwrap().unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    /// Drop `Date` lines so wire bytes can be compared exactly.
    fn without_date(wire: &str) -> String {
        wire.split_inclusive("\r\n")
            .filter(|line| !line.starts_with("Date: "))
            .collect()
    }

    fn rendered(response: &Response, keep_alive: bool) -> String {
        let mut wire = String::from_utf8_lossy(&response.encode_head(keep_alive)).into_owned();
        wire.push_str(&String::from_utf8_lossy(response.body()));
        without_date(&wire)
    }

    async fn roundtrip(addr: SocketAddr, request: &str) -> String {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = Vec::new();
        stream.read_to_end(&mut response).await.unwrap();
        String::from_utf8_lossy(&response).into_owned()
    }

    #[tokio::test]
    async fn test_options_wire_format() {
        let dir = assets();
        let wire = exchange(
            dir.path(),
            b"OPTIONS /anything HTTP/1.1\r\nConnection: close\r\n\r\n",
        )
        .await;

        let expected = format!(
            "HTTP/1.1 200 OK\r\nServer: {}\r\n{}Content-Length: 0\r\nConnection: close\r\n\r\n",
            SERVER_NAME, CORS
        );
        assert_eq!(without_date(&wire), expected);
    }

    #[tokio::test]
    async fn test_script_wire_format() {
        let dir = assets();
        let wire = exchange(dir.path(), b"GET /script.js HTTP/1.0\r\n\r\n").await;

        let expected = format!(
            "HTTP/1.1 200 OK\r\nServer: {}\r\nContent-Type: {}\r\n{}\
             Content-Length: 14\r\nConnection: close\r\n\r\nlet zoom = 1;\n",
            SERVER_NAME, SCRIPT_MIME_TYPE, CORS
        );
        assert_eq!(without_date(&wire), expected);
    }

    #[tokio::test]
    async fn test_every_response_has_date() {
        let dir = assets();
        let wire = exchange(
            dir.path(),
            b"GET /script.js HTTP/1.1\r\n\r\nOPTIONS / HTTP/1.1\r\n\r\nGET /gone.png HTTP/1.1\r\n\r\n",
        )
        .await;

        let dates: Vec<_> = wire
            .split("\r\n")
            .filter_map(|line| line.strip_prefix("Date: "))
            .collect();
        assert_eq!(dates.len(), 3);
        for date in dates {
            assert!(parse_http_date(date).is_some(), "bad Date: {}", date);
        }
    }

    #[tokio::test]
    async fn test_large_file_body_follows_head() {
        let dir = assets();
        let photo: Vec<u8> = (0..600 * 1024).map(|i| (i % 251) as u8).collect();
        fs::write(dir.path().join("photo.png"), &photo).unwrap();

        let (mut client, server) = tokio::io::duplex(16 * 1024);
        let (_tx, rx) = watch::channel(false);
        let connection = tokio::spawn(handle_connection(server, file_handler(dir.path()), rx));

        client
            .write_all(b"GET /photo.png HTTP/1.1\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut wire = Vec::new();
        client.read_to_end(&mut wire).await.unwrap();
        connection.await.unwrap().unwrap();

        let split = wire.windows(4).position(|w| w == b"\r\n\r\n").unwrap() + 4;
        let head = std::str::from_utf8(&wire[..split]).unwrap();
        assert!(head.contains(&format!("Content-Length: {}\r\n", photo.len())));
        assert!(head.contains("Content-Type: image/png\r\n"));
        assert_eq!(&wire[split..], &photo[..]);
    }

    #[tokio::test]
    async fn test_head_sends_no_body() {
        let dir = assets();
        let wire = exchange(dir.path(), b"HEAD /script.js HTTP/1.1\r\nConnection: close\r\n\r\n").await;

        assert!(wire.contains("Content-Length: 14\r\n"));
        assert!(wire.ends_with("Connection: close\r\n\r\n"));
    }

    #[tokio::test]
    async fn test_keep_alive_serves_several_requests() {
        let dir = assets();
        let wire = exchange(
            dir.path(),
            b"GET /missing.png HTTP/1.1\r\n\r\nOPTIONS / HTTP/1.1\r\n\r\n",
        )
        .await;

        let mut expected = rendered(&with_cors(Response::error(404, "File not found")), true);
        expected.push_str(&format!(
            "HTTP/1.1 200 OK\r\nServer: {}\r\n{}Content-Length: 0\r\nConnection: keep-alive\r\n\r\n",
            SERVER_NAME, CORS
        ));
        assert_eq!(without_date(&wire), expected);
    }

    #[tokio::test]
    async fn test_malformed_request_gets_400() {
        let dir = assets();

        let parse_error = match Parser::parse(b"NONSENSE\r\n\r\n") {
            ParseResult::Error(e) => e,
            other => panic!("unexpected: {:?}", other),
        };
        let expected = rendered(&with_cors(Response::error(400, &parse_error.to_string())), false);

        let wire = exchange(dir.path(), b"NONSENSE\r\n\r\n").await;
        assert_eq!(without_date(&wire), expected);
    }

    #[tokio::test]
    async fn test_partial_request_closes_on_shutdown() {
        let dir = assets();
        let (tx, rx) = watch::channel(false);

        // Half a request head, then the client stalls
        let stream = tokio_test::io::Builder::new()
            .read(b"GET /index.html HTTP/1.1\r\nHost: x\r\n")
            .wait(Duration::from_secs(60))
            .build();

        let connection = handle_connection(stream, file_handler(dir.path()), rx);
        let stop = async {
            tokio::task::yield_now().await;
            let _ = tx.send(true);
        };

        let (result, ()) = tokio::time::timeout(Duration::from_secs(5), async {
            tokio::join!(connection, stop)
        })
        .await
        .expect("connection kept running after shutdown");
        result.unwrap();
    }

    #[test]
    fn test_accept_error_classification() {
        let os = io::Error::from_raw_os_error;

        for errno in [libc::EMFILE, libc::ENFILE, libc::ENOBUFS, libc::ENOMEM] {
            assert_eq!(classify_accept_error(&os(errno)), AcceptError::Exhausted, "errno {}", errno);
        }
        assert_eq!(
            classify_accept_error(&io::Error::from(io::ErrorKind::OutOfMemory)),
            AcceptError::Exhausted
        );

        for errno in [libc::ECONNABORTED, libc::EINTR, libc::EAGAIN, libc::EPROTO, libc::EPERM] {
            assert_eq!(classify_accept_error(&os(errno)), AcceptError::Transient, "errno {}", errno);
        }

        for errno in [libc::EBADF, libc::EINVAL, libc::ENOTSOCK] {
            assert_eq!(classify_accept_error(&os(errno)), AcceptError::Fatal, "errno {}", errno);
        }
    }

    #[tokio::test]
    async fn test_missing_root_binds_nothing() {
        let dir = TempDir::new().unwrap();
        let missing = dir.path().join("imagedesk");

        match Server::bind(&config(&missing, free_port())).await {
            Err(ServerError::MissingRoot(path)) => assert_eq!(path, missing),
            Err(e) => panic!("unexpected error: {}", e),
            Ok(_) => panic!("bind should fail"),
        }
    }

    #[tokio::test]
    async fn test_busy_start_port_moves_up() {
        let dir = assets();
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let busy = held.local_addr().unwrap().port();
        if busy > u16::MAX - 100 {
            return;
        }

        let server = Server::bind(&config(dir.path(), busy)).await.unwrap();
        assert!(server.local_addr().port() > busy);
        assert!(server.url().starts_with("http://localhost:"));
        assert_eq!(server.root(), dir.path());
    }

    #[tokio::test]
    async fn test_serves_until_shutdown() {
        let dir = assets();
        let server = Server::bind(&config(dir.path(), free_port())).await.unwrap();
        let addr = server.local_addr();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serving = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        let response = roundtrip(addr, "GET /missing.html HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404 Not Found\r\n"));
        assert!(response.contains("Access-Control-Allow-Origin: *\r\n"));

        // Still serving after the 404
        let response = roundtrip(addr, "GET / HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(response.ends_with("<h1>Image Desk</h1>"));

        let response = roundtrip(addr, "GET /script.js HTTP/1.1\r\nConnection: close\r\n\r\n").await;
        assert!(response.contains("Content-Type: application/javascript\r\n"));
        assert!(response.ends_with("let zoom = 1;\n"));

        // An idle keep-alive connection must not hold up shutdown
        let _idle = TcpStream::connect(addr).await.unwrap();

        stop_tx.send(()).unwrap();
        serving.await.unwrap().unwrap();

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_shutdown_with_stalled_request_head() {
        let dir = assets();
        let server = Server::bind(&config(dir.path(), free_port())).await.unwrap();
        let addr = server.local_addr();

        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let serving = tokio::spawn(server.run_until(async {
            let _ = stop_rx.await;
        }));

        // No blank line, so the request never completes
        let mut stalled = TcpStream::connect(addr).await.unwrap();
        stalled
            .write_all(b"GET /index.html HTTP/1.1\r\nHost: x\r\n")
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        stop_tx.send(()).unwrap();
        let finished = tokio::time::timeout(Duration::from_secs(5), serving)
            .await
            .expect("shutdown waited on a partial request");
        finished.unwrap().unwrap();

        // Closed without a response
        let mut rest = Vec::new();
        let _ = stalled.read_to_end(&mut rest).await;
        assert!(rest.is_empty());
    }
}
