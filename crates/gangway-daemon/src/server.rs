//! Socket server and endpoint routing
//!
//! Owns the listening socket and everything shared across sessions: the
//! registry, the transfer tables, the subscriber hub, and the shutdown
//! signal. Each accepted connection is routed by the first request line;
//! WebSocket endpoints then reserve a registry slot and run their handler,
//! while download requests are served as plain HTTP without taking a slot.
//!
//! Routing reads from the socket before the WebSocket handshake does, so
//! the consumed bytes are replayed through [`Rewind`].

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, ReadBuf};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use gangway_core::{GatewayConfig, PathAccess};

use crate::channel;
use crate::download::{self, write_simple_response};
use crate::filemanager::FileManager;
use crate::notification::{self, SubscriberHub};
use crate::registry::{Registry, SessionKind};
use crate::terminal::Terminal;
use crate::transfers::TransferTable;
use crate::SHUTDOWN_GRACE;

/// Upper bound on what routing will buffer while looking for the request line
const ROUTE_PREFIX_MAX: usize = 2048;

/// One gateway process: configuration plus all cross-session state
pub struct Gateway {
    config: GatewayConfig,
    registry: Registry,
    transfers: Arc<TransferTable>,
    filemanager: FileManager,
    terminal: Terminal,
    hub: Arc<SubscriberHub>,
    shutdown: CancellationToken,
}

impl Gateway {
    pub fn new(config: GatewayConfig) -> Self {
        let access = Arc::new(PathAccess::new(
            config.allowed_paths.clone(),
            config.denied_paths.clone(),
        ));
        let transfers = Arc::new(TransferTable::new());
        let filemanager = FileManager::new(access, Arc::clone(&transfers));
        let terminal = Terminal::new(config.terminal.clone());
        Self {
            registry: Registry::new(),
            transfers,
            filemanager,
            terminal,
            hub: Arc::new(SubscriberHub::new()),
            shutdown: CancellationToken::new(),
            config,
        }
    }

    /// Token that stops the accept loop and every session when cancelled.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Accept connections until shutdown, then drain. After the grace
    /// period stragglers are abandoned rather than keeping the process
    /// alive; their sockets die with it.
    pub async fn serve(self: Arc<Self>, listener: UnixListener) -> anyhow::Result<()> {
        // The bus connection must outlive the accept loop or the name is
        // dropped. Registration failure costs the relay, not the endpoint.
        let _bus = if self.config.enable_notification {
            match notification::start(Arc::clone(&self.hub)).await {
                Ok(connection) => Some(connection),
                Err(e) => {
                    warn!("notification bus unavailable, continuing without it: {}", e);
                    None
                }
            }
        } else {
            None
        };

        let reaper = self.transfers.spawn_reaper(self.shutdown.clone());
        info!("listening on {:?}", self.config.socket_path);

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => {
                        let gateway = Arc::clone(&self);
                        tokio::spawn(async move {
                            gateway.handle_connection(stream).await;
                        });
                    }
                    Err(e) => warn!("accept failed: {}", e),
                }
            }
        }

        drop(listener);
        if tokio::time::timeout(SHUTDOWN_GRACE, self.registry.drain())
            .await
            .is_err()
        {
            warn!(
                "grace period expired with {} sessions still open",
                self.registry.active()
            );
        }
        let _ = reaper.await;
        Ok(())
    }

    async fn handle_connection(&self, stream: UnixStream) {
        let (line, stream) = match read_route_prefix(stream).await {
            Ok(routed) => routed,
            Err(e) => {
                debug!("dropping connection before routing: {}", e);
                return;
            }
        };

        match route(&line) {
            Endpoint::Download(token) => {
                if let Err(e) = download::handle(stream, &token, &self.transfers).await {
                    debug!("download failed: {}", e);
                }
            }
            Endpoint::FileManager => {
                self.run_ws_session(stream, SessionKind::FileManager).await;
            }
            Endpoint::Terminal => {
                self.run_ws_session(stream, SessionKind::Terminal).await;
            }
            Endpoint::Notification => {
                self.run_ws_session(stream, SessionKind::Notification).await;
            }
            Endpoint::Unknown => {
                debug!("no endpoint for {:?}", line);
                let mut stream = stream;
                let _ = write_simple_response(&mut stream, "404 Not Found", "Not Found").await;
            }
        }
    }

    async fn run_ws_session(&self, stream: Rewind<UnixStream>, kind: SessionKind) {
        let enabled = match kind {
            SessionKind::FileManager => self.config.enable_file_manager,
            SessionKind::Terminal => self.config.enable_terminal,
            SessionKind::Notification => self.config.enable_notification,
        };
        if !enabled {
            debug!("{} endpoint disabled", kind);
            let mut stream = stream;
            let _ = write_simple_response(&mut stream, "404 Not Found", "Not Found").await;
            return;
        }

        let guard = match self.registry.reserve(kind) {
            Ok(guard) => guard,
            Err(e) => {
                warn!("refusing {} session: {}", kind, e);
                let mut stream = stream;
                let _ = write_simple_response(
                    &mut stream,
                    "503 Service Unavailable",
                    "Service Unavailable",
                )
                .await;
                return;
            }
        };

        let ws = match channel::upgrade(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(conn = guard.id(), "upgrade failed: {}", e);
                return;
            }
        };

        let shutdown = self.shutdown.clone();
        match kind {
            SessionKind::FileManager => self.filemanager.run(ws, guard.id(), shutdown).await,
            SessionKind::Terminal => self.terminal.run(ws, guard.id(), shutdown).await,
            SessionKind::Notification => self.hub.run_session(ws, guard.id(), shutdown).await,
        }
    }
}

/// Bind the listening socket, clearing a leftover socket file from an
/// earlier run first.
pub fn bind_socket(path: &std::path::Path) -> std::io::Result<UnixListener> {
    if path.exists() {
        std::fs::remove_file(path)?;
        debug!("removed stale socket {:?}", path);
    }
    UnixListener::bind(path)
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Endpoint {
    FileManager,
    Terminal,
    Notification,
    Download(String),
    Unknown,
}

/// Pick the endpoint from an HTTP request line (`GET /ws-terminal HTTP/1.1`).
fn route(request_line: &str) -> Endpoint {
    let mut parts = request_line.split_whitespace();
    let _method = parts.next();
    let target = match parts.next() {
        Some(target) => target,
        None => return Endpoint::Unknown,
    };
    let path = target.split('?').next().unwrap_or(target);

    match path {
        "/ws-filemanager" => Endpoint::FileManager,
        "/ws-terminal" => Endpoint::Terminal,
        "/ws-notification" => Endpoint::Notification,
        _ => match path.strip_prefix("/download/") {
            Some(token) if !token.is_empty() && !token.contains('/') => {
                Endpoint::Download(token.to_string())
            }
            _ => Endpoint::Unknown,
        },
    }
}

/// Read just enough of the stream to see the request line, returning the
/// line and a stream that replays everything consumed.
async fn read_route_prefix<S>(mut stream: S) -> std::io::Result<(String, Rewind<S>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(256);
    let mut chunk = [0u8; 256];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.windows(2).any(|w| w == b"\r\n") || buf.len() >= ROUTE_PREFIX_MAX {
            break;
        }
    }
    let line_end = buf
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(buf.len());
    let line = String::from_utf8_lossy(&buf[..line_end]).into_owned();
    Ok((line, Rewind::new(buf, stream)))
}

/// Stream adapter that yields a buffered prefix before the inner stream.
/// Writes pass straight through.
pub(crate) struct Rewind<S> {
    prefix: Vec<u8>,
    offset: usize,
    inner: S,
}

impl<S> Rewind<S> {
    fn new(prefix: Vec<u8>, inner: S) -> Self {
        Self {
            prefix,
            offset: 0,
            inner,
        }
    }
}

impl<S: AsyncRead + Unpin> AsyncRead for Rewind<S> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        let this = self.get_mut();
        if this.offset < this.prefix.len() {
            let n = (this.prefix.len() - this.offset).min(buf.remaining());
            buf.put_slice(&this.prefix[this.offset..this.offset + n]);
            this.offset += n;
            if this.offset == this.prefix.len() {
                this.prefix = Vec::new();
                this.offset = 0;
            }
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl<S: AsyncWrite + Unpin> AsyncWrite for Rewind<S> {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().inner).poll_shutdown(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::{SinkExt, StreamExt};
    use gangway_core::{from_msgpack, to_msgpack, Message, Reply};
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio_tungstenite::tungstenite::Message as WsMessage;

    #[test]
    fn test_route_endpoints() {
        assert_eq!(route("GET /ws-filemanager HTTP/1.1"), Endpoint::FileManager);
        assert_eq!(route("GET /ws-terminal HTTP/1.1"), Endpoint::Terminal);
        assert_eq!(
            route("GET /ws-notification HTTP/1.1"),
            Endpoint::Notification
        );
        assert_eq!(
            route("GET /download/ab-12 HTTP/1.1"),
            Endpoint::Download("ab-12".into())
        );
        assert_eq!(
            route("GET /ws-terminal?session=2 HTTP/1.1"),
            Endpoint::Terminal
        );
    }

    #[test]
    fn test_route_rejects_everything_else() {
        assert_eq!(route("GET / HTTP/1.1"), Endpoint::Unknown);
        assert_eq!(route("GET /files HTTP/1.1"), Endpoint::Unknown);
        assert_eq!(route("GET /download/ HTTP/1.1"), Endpoint::Unknown);
        assert_eq!(route("GET /download/a/b HTTP/1.1"), Endpoint::Unknown);
        assert_eq!(route(""), Endpoint::Unknown);
        assert_eq!(route("GET"), Endpoint::Unknown);
    }

    #[tokio::test]
    async fn test_route_prefix_is_replayed() {
        let (mut client, server) = tokio::io::duplex(4096);
        let request = b"GET /ws-terminal HTTP/1.1\r\nHost: gateway\r\n\r\n";
        client.write_all(request).await.unwrap();
        drop(client);

        let (line, mut stream) = read_route_prefix(server).await.unwrap();
        assert_eq!(line, "GET /ws-terminal HTTP/1.1");

        // The handshake sees every byte routing consumed.
        let mut replayed = Vec::new();
        stream.read_to_end(&mut replayed).await.unwrap();
        assert_eq!(replayed, request);
    }

    #[tokio::test]
    async fn test_gateway_routes_sessions_and_refusals() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("gateway.sock");
        let config = GatewayConfig {
            socket_path: socket_path.clone(),
            enable_file_manager: true,
            ..Default::default()
        };

        let gateway = Arc::new(Gateway::new(config));
        let shutdown = gateway.shutdown_token();
        let listener = UnixListener::bind(&socket_path).unwrap();
        let server = tokio::spawn(Arc::clone(&gateway).serve(listener));

        // A file-manager session works end to end.
        let stream = UnixStream::connect(&socket_path).await.unwrap();
        let (mut ws, _) = tokio_tungstenite::client_async("ws://gateway/ws-filemanager", stream)
            .await
            .unwrap();
        let request = Message {
            kind: "listDir".into(),
            path: dir.path().to_string_lossy().into_owned(),
            ..Default::default()
        };
        ws.send(WsMessage::Binary(to_msgpack(&request).unwrap()))
            .await
            .unwrap();
        match ws.next().await.unwrap().unwrap() {
            WsMessage::Binary(payload) => {
                let reply: Reply = from_msgpack(&payload).unwrap();
                assert_eq!(reply.kind, "success");
                assert!(reply.files.is_some());
            }
            other => panic!("unexpected frame: {:?}", other),
        }
        ws.close(None).await.unwrap();

        // The terminal endpoint is disabled in this configuration.
        let mut raw = UnixStream::connect(&socket_path).await.unwrap();
        raw.write_all(b"GET /ws-terminal HTTP/1.1\r\nHost: gateway\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        raw.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 404"));

        // Unknown paths are refused outright.
        let mut raw = UnixStream::connect(&socket_path).await.unwrap();
        raw.write_all(b"GET /elsewhere HTTP/1.1\r\nHost: gateway\r\n\r\n")
            .await
            .unwrap();
        let mut response = Vec::new();
        raw.read_to_end(&mut response).await.unwrap();
        assert!(response.starts_with(b"HTTP/1.1 404"));

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
