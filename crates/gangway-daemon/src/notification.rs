//! Notification endpoint
//!
//! Registers as the session bus's `org.freedesktop.Notifications` provider
//! and relays every `Notify` call to all subscribed WebSocket sessions.
//! Delivery is deliberately lossy: a subscriber that cannot keep up misses
//! notifications rather than slowing the notifier or other subscribers.
//!
//! Bus registration failing (no session bus, name taken) disables the relay
//! but not the endpoint; subscribers can still connect and simply hear
//! nothing.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use zbus::zvariant::Value;

use crate::channel::{self, PING_PERIOD, PONG_DEADLINE};

/// Outbound queue depth per subscriber; overflow drops the notification
const SUBSCRIBER_QUEUE: usize = 16;

/// What subscribers receive for each notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub summary: String,
    pub body: String,
}

/// Subscriber set plus the notification id counter
pub struct SubscriberHub {
    subscribers: Mutex<HashMap<u64, mpsc::Sender<NotificationMessage>>>,
    next_note_id: AtomicU32,
}

impl SubscriberHub {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(HashMap::new()),
            next_note_id: AtomicU32::new(0),
        }
    }

    fn subscribe(&self, session: u64) -> mpsc::Receiver<NotificationMessage> {
        let (tx, rx) = mpsc::channel(SUBSCRIBER_QUEUE);
        self.subscribers.lock().insert(session, tx);
        rx
    }

    fn unsubscribe(&self, session: u64) {
        self.subscribers.lock().remove(&session);
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }

    /// Hand one notification to every subscriber that has queue room.
    pub fn broadcast(&self, note: NotificationMessage) {
        let subscribers = self.subscribers.lock();
        for (session, tx) in subscribers.iter() {
            if tx.try_send(note.clone()).is_err() {
                debug!(conn = session, "subscriber queue full, dropping notification");
            }
        }
    }

    /// Fresh id unless the caller is replacing one, per the desktop
    /// notification contract.
    fn next_notification_id(&self, replaces_id: u32) -> u32 {
        if replaces_id != 0 {
            replaces_id
        } else {
            self.next_note_id.fetch_add(1, Ordering::Relaxed) + 1
        }
    }

    /// Drive one subscriber session: push queued notifications, ping on a
    /// fixed period, and drop peers that stop answering.
    pub async fn run_session<S>(
        &self,
        ws: WebSocketStream<S>,
        session: u64,
        shutdown: CancellationToken,
    ) where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut rx = self.subscribe(session);
        let (mut sink, mut stream) = ws.split();
        let mut ping =
            tokio::time::interval_at(tokio::time::Instant::now() + PING_PERIOD, PING_PERIOD);
        let mut last_activity = tokio::time::Instant::now();

        loop {
            let idle = last_activity + PONG_DEADLINE;
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = channel::send_close(&mut sink, "Connection closing").await;
                    break;
                }
                _ = tokio::time::sleep_until(idle) => {
                    warn!(conn = session, "subscriber unresponsive, dropping session");
                    break;
                }
                _ = ping.tick() => {
                    if channel::send_ping(&mut sink).await.is_err() {
                        break;
                    }
                }
                note = rx.recv() => match note {
                    Some(note) => {
                        if let Err(e) = channel::send_frame(&mut sink, &note).await {
                            debug!(conn = session, "push failed: {}", e);
                            break;
                        }
                    }
                    None => break,
                },
                frame = stream.next() => match frame {
                    Some(Ok(WsMessage::Close(_))) | None => break,
                    Some(Ok(_)) => last_activity = tokio::time::Instant::now(),
                    Some(Err(e)) => {
                        if !channel::is_benign_ws_error(&e) {
                            warn!(conn = session, "subscriber read failed: {}", e);
                        }
                        break;
                    }
                },
            }
        }

        self.unsubscribe(session);
    }
}

impl Default for SubscriberHub {
    fn default() -> Self {
        Self::new()
    }
}

/// The `org.freedesktop.Notifications` service implementation
struct Notifications {
    hub: Arc<SubscriberHub>,
}

#[zbus::interface(name = "org.freedesktop.Notifications")]
impl Notifications {
    #[allow(clippy::too_many_arguments)]
    async fn notify(
        &self,
        app_name: &str,
        replaces_id: u32,
        _app_icon: &str,
        summary: &str,
        body: &str,
        _actions: Vec<&str>,
        _hints: HashMap<&str, Value<'_>>,
        _expire_timeout: i32,
    ) -> u32 {
        let id = self.hub.next_notification_id(replaces_id);
        debug!(id, app = app_name, "relaying notification");
        self.hub.broadcast(NotificationMessage {
            summary: summary.to_string(),
            body: body.to_string(),
        });
        id
    }

    /// Accepted but deliberately not implemented; subscribers only ever see
    /// new notifications.
    fn close_notification(&self, _id: u32) {}

    fn get_capabilities(&self) -> Vec<String> {
        vec!["summary".into(), "body".into(), "actions".into()]
    }

    fn get_server_information(&self) -> (String, String, String, String) {
        (
            "Gangway".into(),
            "gangway".into(),
            env!("CARGO_PKG_VERSION").into(),
            "1.2".into(),
        )
    }
}

/// Claim the well-known notification name on the session bus. The returned
/// connection must stay alive for as long as the service should exist.
pub async fn start(hub: Arc<SubscriberHub>) -> zbus::Result<zbus::Connection> {
    let connection = zbus::connection::Builder::session()?
        .name("org.freedesktop.Notifications")?
        .serve_at("/org/freedesktop/Notifications", Notifications { hub })?
        .build()
        .await?;
    info!("notification service registered on the session bus");
    Ok(connection)
}
