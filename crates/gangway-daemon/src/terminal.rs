//! Terminal endpoint
//!
//! Each session runs a shell under a pseudo-terminal and pumps raw bytes
//! both ways: pty output becomes binary frames, binary frames become pty
//! input, and text frames carry the one control command (`resize:<cols>,<rows>`).
//!
//! The pty reader and writer are blocking, so each gets a plain thread
//! bridged to the async pumps over bounded channels. Teardown can start from
//! any side (shell exit, socket close, daemon shutdown) and funnels through
//! one idempotent close that kills the shell, which in turn unblocks the
//! reader thread via the pty returning an error.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::stream::{SplitSink, SplitStream};
use futures_util::StreamExt;
use parking_lot::Mutex;
use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use gangway_core::TerminalConfig;

use crate::channel;

/// Geometry the shell starts with until the client says otherwise
const INITIAL_COLS: u16 = 80;
const INITIAL_ROWS: u16 = 24;

/// Accepted resize bounds
const MIN_COLS: u16 = 1;
const MAX_COLS: u16 = 1000;
const MIN_ROWS: u16 = 1;
const MAX_ROWS: u16 = 500;

/// Pty read buffer; shell output is bursty but small
const READ_BUFFER: usize = 4096;

/// Pause after the courtesy close frame when the shell exits, so the client
/// sees the goodbye before the transport drops
const CLOSE_GRACE: Duration = Duration::from_secs(2);

/// Bridging channel depth between the pty threads and the async pumps
const PUMP_QUEUE: usize = 64;

enum PtyEvent {
    Data(Vec<u8>),
    Eof,
}

/// Handles every terminal session with one spawn configuration
pub struct Terminal {
    config: TerminalConfig,
}

impl Terminal {
    pub fn new(config: TerminalConfig) -> Self {
        Self { config }
    }

    /// Drive one session to completion: spawn the shell, pump both
    /// directions, and tear everything down once any side gives up.
    pub async fn run<S>(&self, ws: WebSocketStream<S>, session: u64, shutdown: CancellationToken)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let (proc, reader, writer) = match SessionProc::spawn(&self.config) {
            Ok(spawned) => spawned,
            Err(e) => {
                error!(conn = session, "failed to start shell: {}", e);
                return;
            }
        };
        let proc = Arc::new(proc);
        debug!(conn = session, "shell started: {}", self.config.shell);

        let (out_tx, out_rx) = mpsc::channel::<PtyEvent>(PUMP_QUEUE);
        std::thread::spawn(move || read_pty(reader, out_tx));

        let (in_tx, in_rx) = mpsc::channel::<Vec<u8>>(PUMP_QUEUE);
        std::thread::spawn(move || write_pty(writer, in_rx));

        let token = shutdown.child_token();
        let (sink, stream) = ws.split();
        let mut out_task = tokio::spawn(pump_out(
            sink,
            out_rx,
            session,
            Arc::clone(&proc),
            token.clone(),
        ));
        let mut in_task = tokio::spawn(pump_in(
            stream,
            in_tx,
            session,
            Arc::clone(&proc),
            token.clone(),
        ));

        // Whichever pump stops first pulls the other one down with it.
        tokio::select! {
            _ = &mut out_task => {
                token.cancel();
                proc.close();
                let _ = in_task.await;
            }
            _ = &mut in_task => {
                token.cancel();
                proc.close();
                let _ = out_task.await;
            }
        }
        debug!(conn = session, "terminal session closed");
    }
}

/// The shell process and its pty, closable exactly once from any task
struct SessionProc {
    master: Mutex<Option<Box<dyn MasterPty + Send>>>,
    child: Mutex<Box<dyn Child + Send + Sync>>,
    closing: AtomicBool,
}

impl SessionProc {
    fn spawn(
        config: &TerminalConfig,
    ) -> anyhow::Result<(Self, Box<dyn Read + Send>, Box<dyn Write + Send>)> {
        let pty = native_pty_system();
        let pair = pty.openpty(PtySize {
            rows: INITIAL_ROWS,
            cols: INITIAL_COLS,
            pixel_width: 0,
            pixel_height: 0,
        })?;

        let mut cmd = CommandBuilder::new(&config.shell);
        cmd.cwd(&config.workdir);
        let child = pair.slave.spawn_command(cmd)?;
        // The slave side lives on inside the child; holding it here would
        // keep the pty open after the shell exits.
        drop(pair.slave);

        let reader = pair.master.try_clone_reader()?;
        let writer = pair.master.take_writer()?;
        Ok((
            Self {
                master: Mutex::new(Some(pair.master)),
                child: Mutex::new(child),
                closing: AtomicBool::new(false),
            },
            reader,
            writer,
        ))
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }

    /// Kill and reap the shell and drop the pty. Safe to call from both
    /// pumps and the session task; only the first call acts. Killing the
    /// shell is what unblocks a reader stuck in a pty read.
    fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        {
            let mut child = self.child.lock();
            if let Err(e) = child.kill() {
                debug!("shell kill: {}", e);
            }
            let _ = child.wait();
        }
        self.master.lock().take();
    }

    fn resize(&self, cols: u16, rows: u16) {
        if let Some(master) = self.master.lock().as_ref() {
            if let Err(e) = master.resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            }) {
                warn!("pty resize failed: {}", e);
            }
        }
    }
}

/// Blocking pty reader thread. Read errors are how a pty reports the far
/// end closing, so they mark end-of-output just like a clean zero read.
fn read_pty(mut reader: Box<dyn Read + Send>, out_tx: mpsc::Sender<PtyEvent>) {
    let mut buf = [0u8; READ_BUFFER];
    loop {
        match reader.read(&mut buf) {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if out_tx.blocking_send(PtyEvent::Data(buf[..n].to_vec())).is_err() {
                    return;
                }
            }
        }
    }
    let _ = out_tx.blocking_send(PtyEvent::Eof);
}

/// Blocking pty writer thread; exits when the session drops its sender.
fn write_pty(mut writer: Box<dyn Write + Send>, mut in_rx: mpsc::Receiver<Vec<u8>>) {
    while let Some(data) = in_rx.blocking_recv() {
        if writer.write_all(&data).is_err() {
            break;
        }
    }
}

async fn pump_out<S>(
    mut sink: SplitSink<WebSocketStream<S>, WsMessage>,
    mut out_rx: mpsc::Receiver<PtyEvent>,
    session: u64,
    proc: Arc<SessionProc>,
    token: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            event = out_rx.recv() => match event {
                Some(PtyEvent::Data(bytes)) => {
                    if let Err(e) = channel::send_binary(&mut sink, bytes).await {
                        debug!(conn = session, "socket write failed: {}", e);
                        break;
                    }
                }
                Some(PtyEvent::Eof) | None => {
                    if !proc.is_closing() {
                        // The shell exited on its own; give the client a
                        // civil goodbye before the transport drops.
                        debug!(conn = session, "shell exited");
                        let _ = channel::send_close(&mut sink, "Connection closing").await;
                        tokio::time::sleep(CLOSE_GRACE).await;
                    }
                    break;
                }
            }
        }
    }
}

async fn pump_in<S>(
    mut stream: SplitStream<WebSocketStream<S>>,
    in_tx: mpsc::Sender<Vec<u8>>,
    session: u64,
    proc: Arc<SessionProc>,
    token: CancellationToken,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            frame = stream.next() => {
                let frame = match frame {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => {
                        if !channel::is_benign_ws_error(&e) {
                            warn!(conn = session, "socket read failed: {}", e);
                        }
                        break;
                    }
                    None => break,
                };
                match frame {
                    WsMessage::Binary(data) => {
                        if in_tx.send(data).await.is_err() {
                            break;
                        }
                    }
                    WsMessage::Text(command) => match parse_resize(&command) {
                        Some((cols, rows)) => proc.resize(cols, rows),
                        // Bad control commands never kill the session.
                        None => warn!(conn = session, "ignoring control command {:?}", command),
                    },
                    WsMessage::Close(_) => break,
                    _ => {}
                }
            }
        }
    }
}

/// Parse `resize:<cols>,<rows>`, enforcing the geometry bounds.
fn parse_resize(command: &str) -> Option<(u16, u16)> {
    let spec = command.strip_prefix("resize:")?;
    let (cols_s, rows_s) = spec.split_once(',')?;
    let cols = cols_s.trim().parse::<u16>().ok()?;
    let rows = rows_s.trim().parse::<u16>().ok()?;
    if !(MIN_COLS..=MAX_COLS).contains(&cols) || !(MIN_ROWS..=MAX_ROWS).contains(&rows) {
        return None;
    }
    Some((cols, rows))
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::SinkExt;

    #[test]
    fn test_parse_resize_accepts_bounds() {
        assert_eq!(parse_resize("resize:80,24"), Some((80, 24)));
        assert_eq!(parse_resize("resize:1,1"), Some((1, 1)));
        assert_eq!(parse_resize("resize:1000,500"), Some((1000, 500)));
        assert_eq!(parse_resize("resize: 120 , 40 "), Some((120, 40)));
    }

    #[test]
    fn test_parse_resize_rejects_out_of_range() {
        assert_eq!(parse_resize("resize:0,24"), None);
        assert_eq!(parse_resize("resize:1001,24"), None);
        assert_eq!(parse_resize("resize:80,0"), None);
        assert_eq!(parse_resize("resize:80,501"), None);
    }

    #[test]
    fn test_parse_resize_rejects_malformed() {
        assert_eq!(parse_resize("resize:80"), None);
        assert_eq!(parse_resize("resize:a,b"), None);
        assert_eq!(parse_resize("reset:80,24"), None);
        assert_eq!(parse_resize("80,24"), None);
        assert_eq!(parse_resize(""), None);
    }

    fn sh_config() -> TerminalConfig {
        TerminalConfig {
            shell: "/bin/sh".into(),
            workdir: "/tmp".into(),
        }
    }

    #[test]
    fn test_close_is_idempotent() {
        let (proc, _reader, _writer) = SessionProc::spawn(&sh_config()).unwrap();
        proc.close();
        proc.close();
        assert!(proc.is_closing());
        // Resize after close is a no-op, not a panic.
        proc.resize(100, 40);
    }

    #[tokio::test]
    async fn test_shell_round_trip() {
        let (client_io, server_io) = tokio::io::duplex(256 * 1024);
        let (server, client) = tokio::join!(
            channel::upgrade(server_io),
            tokio_tungstenite::client_async("ws://gateway/ws-terminal", client_io)
        );
        let (mut client, _) = client.unwrap();
        let ws = server.unwrap();

        let shutdown = CancellationToken::new();
        let terminal = Terminal::new(sh_config());
        let session = tokio::spawn(async move {
            terminal.run(ws, 1, shutdown).await;
        });

        client
            .send(WsMessage::Binary(b"echo polo; exit\n".to_vec()))
            .await
            .unwrap();

        let seen = tokio::time::timeout(Duration::from_secs(10), async {
            while let Some(Ok(frame)) = client.next().await {
                if let WsMessage::Binary(data) = frame {
                    if data.windows(4).any(|w| w == b"polo") {
                        return true;
                    }
                }
            }
            false
        })
        .await
        .unwrap_or(false);
        assert!(seen, "shell output never arrived");

        drop(client);
        tokio::time::timeout(Duration::from_secs(10), session)
            .await
            .expect("session did not shut down")
            .unwrap();
    }
}
