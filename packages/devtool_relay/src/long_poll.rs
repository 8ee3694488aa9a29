//! HTTP long-poll / SSE bridge
//!
//! Pages that cannot keep a WebSocket open talk to the relay over plain HTTP.
//! For each such page the relay dials its own `/target/{id}` socket, so the
//! channel layer sees an ordinary target, and shuttles frames between that
//! internal socket and the page's requests:
//! - POST bodies go out over the socket; the response carries whatever the
//!   socket received since the previous poll
//! - an attached event stream gets frames pushed as soon as they arrive
//!
//! Idle sessions are reclaimed by a sweeper that runs only while sessions
//! exist.

use axum::response::sse::Event;
use futures::{SinkExt, Stream, StreamExt};
use std::collections::HashMap;
use std::convert::Infallible;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{Mutex, mpsc};
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::LongPollConfig;
use crate::error::{RelayError, Result};
use crate::metrics::ServerMetrics;

/// First body element that asks for a fresh session.
pub const CONNECT: &str = "connect";

/// First frame written to every attached event stream.
pub const STREAM_CONNECTED: &str = "connected";

enum SocketCommand {
    Send(String),
    Terminate,
}

/// Handle to the relay's own socket standing in for one page.
#[derive(Clone)]
struct InternalSocket {
    commands: mpsc::UnboundedSender<SocketCommand>,
    closed: CancellationToken,
}

impl InternalSocket {
    fn send(&self, text: String) -> bool {
        self.commands.send(SocketCommand::Send(text)).is_ok()
    }

    /// Drop the connection without a close handshake.
    fn terminate(&self) {
        let _ = self.commands.send(SocketCommand::Terminate);
    }

    async fn closed(&self) {
        self.closed.cancelled().await
    }
}

struct PushHandle {
    id: u64,
    events: mpsc::UnboundedSender<Event>,
}

struct Session {
    socket: InternalSocket,
    stream: Option<PushHandle>,
    expires_at: Instant,
    buffer: Vec<String>,
}

impl Session {
    fn has_stream(&self) -> bool {
        self.stream.as_ref().is_some_and(|s| !s.events.is_closed())
    }

    /// Buffer a frame from the internal socket and flush the whole buffer
    /// to the attached stream, if any.
    fn receive(&mut self, text: String, push_expiry: Duration) {
        self.buffer.push(text);
        let Some(stream) = &self.stream else {
            return;
        };
        let batch = match serde_json::to_string(&self.buffer) {
            Ok(batch) => batch,
            Err(e) => {
                warn!("Failed to encode long-poll batch: {}", e);
                return;
            }
        };
        if stream.events.send(Event::default().data(batch)).is_ok() {
            self.buffer.clear();
            self.expires_at = Instant::now() + push_expiry;
        } else {
            self.stream = None;
        }
    }
}

#[derive(Default)]
struct SessionTable {
    sessions: HashMap<String, Arc<Mutex<Session>>>,
    /// Per-id gate held for a whole (re)connect, so supersessions of one id
    /// run one after another.
    connecting: HashMap<String, Arc<Mutex<()>>>,
    sweeping: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SweepOutcome {
    pub removed: usize,
    pub remaining: usize,
}

pub struct LongPollSessions {
    table: Mutex<SessionTable>,
    /// `ws://host:port[/base]` of this relay.
    relay_url: String,
    config: LongPollConfig,
    metrics: Arc<ServerMetrics>,
    next_stream_id: AtomicU64,
}

impl LongPollSessions {
    pub fn new(relay_url: String, config: LongPollConfig, metrics: Arc<ServerMetrics>) -> Arc<Self> {
        Arc::new(Self {
            table: Mutex::new(SessionTable::default()),
            relay_url,
            config,
            metrics,
            next_stream_id: AtomicU64::new(0),
        })
    }

    pub async fn len(&self) -> usize {
        self.table.lock().await.sessions.len()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.table.lock().await.sessions.contains_key(id)
    }

    async fn session(&self, id: &str) -> Option<Arc<Mutex<Session>>> {
        self.table.lock().await.sessions.get(id).cloned()
    }

    /// Handle one poll: (re)connect if asked to, forward every message over
    /// the internal socket, then hand back what the socket buffered.
    ///
    /// The returned batch is taken under the session lock, so a frame lands
    /// either in this response or in a later one, never both.
    pub async fn post(
        self: &Arc<Self>,
        id: &str,
        query: Option<&str>,
        messages: Vec<String>,
    ) -> Result<Vec<String>> {
        let session = if messages.first().map(String::as_str) == Some(CONNECT) {
            self.connect(id, query).await?
        } else {
            self.session(id)
                .await
                .ok_or_else(|| RelayError::UnknownSession(id.to_string()))?
        };
        let mut session = session.lock().await;
        for message in messages {
            if !session.socket.send(message) {
                debug!(channel = %id, "Internal socket gone; dropping frame");
            }
        }
        session.expires_at = Instant::now() + self.config.poll_expiry;
        Ok(std::mem::take(&mut session.buffer))
    }

    /// Replace the session for `id` with a fresh one and return it.
    async fn connect(self: &Arc<Self>, id: &str, query: Option<&str>) -> Result<Arc<Mutex<Session>>> {
        let gate = {
            let mut table = self.table.lock().await;
            table.connecting.entry(id.to_string()).or_default().clone()
        };
        let _connecting = gate.lock().await;

        let previous = self.table.lock().await.sessions.remove(id);
        if let Some(previous) = previous {
            let socket = previous.lock().await.socket.clone();
            socket.terminate();
            socket.closed().await;
            self.metrics.long_poll_closed();
            info!(channel = %id, "Superseded long-poll session");
            // Let frames addressed to the old page drain before the new one joins.
            tokio::time::sleep(self.config.reconnect_delay).await;
        }

        let url = self.target_url(id, query);
        let (ws, _) = tokio_tungstenite::connect_async(url.as_str()).await?;

        let (commands, command_rx) = mpsc::unbounded_channel();
        let socket = InternalSocket {
            commands,
            closed: CancellationToken::new(),
        };
        let session = Arc::new(Mutex::new(Session {
            socket: socket.clone(),
            stream: None,
            expires_at: Instant::now(),
            buffer: Vec::new(),
        }));
        tokio::spawn(run_internal_socket(
            ws,
            command_rx,
            socket.closed.clone(),
            Arc::downgrade(&session),
            self.config.push_expiry,
        ));

        let mut table = self.table.lock().await;
        table.sessions.insert(id.to_string(), session.clone());
        self.metrics.long_poll_opened();
        if !table.sweeping {
            table.sweeping = true;
            tokio::spawn(run_sweeper(Arc::downgrade(self), self.config.sweep_interval));
        }

        info!(channel = %id, "Long-poll session opened");
        Ok(session)
    }

    fn target_url(&self, id: &str, query: Option<&str>) -> String {
        let mut url = format!("{}/target/{}", self.relay_url, urlencoding::encode(id));
        if let Some(query) = query.filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    /// Attach a push stream to an existing session, replacing any previous
    /// one. Returns None if there is no session for `id`.
    pub async fn attach(&self, id: &str) -> Option<PushStream> {
        let session = self.session(id).await?;
        let (events, rx) = mpsc::unbounded_channel();
        let _ = events.send(Event::default().data(STREAM_CONNECTED));

        let stream_id = self.next_stream_id.fetch_add(1, Ordering::Relaxed);
        session.lock().await.stream = Some(PushHandle {
            id: stream_id,
            events,
        });
        debug!(channel = %id, stream_id, "Push stream attached");

        Some(PushStream {
            rx,
            _detach: DetachGuard {
                session: Arc::downgrade(&session),
                stream_id,
            },
        })
    }

    /// Close and drop every session that is past its expiry and has no live
    /// push stream.
    pub async fn sweep(&self, now: Instant) -> SweepOutcome {
        let mut table = self.table.lock().await;

        let mut expired = Vec::new();
        for (id, session) in &table.sessions {
            let session = session.lock().await;
            if !session.has_stream() && session.expires_at <= now {
                expired.push(id.clone());
            }
        }

        for id in &expired {
            if let Some(session) = table.sessions.remove(id) {
                session.lock().await.socket.terminate();
                self.metrics.long_poll_closed();
                self.metrics.long_poll_swept();
                debug!(channel = %id, "Swept idle long-poll session");
            }
        }

        let SessionTable {
            sessions,
            connecting,
            ..
        } = &mut *table;
        connecting.retain(|id, gate| sessions.contains_key(id) || Arc::strong_count(gate) > 1);

        let remaining = table.sessions.len();
        if remaining == 0 {
            table.sweeping = false;
        }
        SweepOutcome {
            removed: expired.len(),
            remaining,
        }
    }

    #[cfg(test)]
    pub async fn buffered(&self, id: &str) -> Option<usize> {
        let session = self.session(id).await?;
        let len = session.lock().await.buffer.len();
        Some(len)
    }

    #[cfg(test)]
    pub async fn is_sweeping(&self) -> bool {
        self.table.lock().await.sweeping
    }

    #[cfg(test)]
    pub async fn has_stream(&self, id: &str) -> bool {
        match self.session(id).await {
            Some(session) => session.lock().await.has_stream(),
            None => false,
        }
    }
}

async fn run_internal_socket(
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
    mut commands: mpsc::UnboundedReceiver<SocketCommand>,
    closed: CancellationToken,
    session: Weak<Mutex<Session>>,
    push_expiry: Duration,
) {
    let (mut sink, mut stream) = ws.split();
    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(SocketCommand::Send(text)) => {
                    if let Err(e) = sink.send(Message::Text(text.into())).await {
                        debug!("Internal socket send failed: {}", e);
                        break;
                    }
                }
                Some(SocketCommand::Terminate) | None => break,
            },
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let Some(session) = session.upgrade() else {
                        break;
                    };
                    session.lock().await.receive(text.to_string(), push_expiry);
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Internal socket read failed: {}", e);
                    break;
                }
            },
        }
    }
    closed.cancel();
}

async fn run_sweeper(sessions: Weak<LongPollSessions>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately.
    interval.tick().await;
    loop {
        interval.tick().await;
        let Some(sessions) = sessions.upgrade() else {
            break;
        };
        let outcome = sessions.sweep(Instant::now()).await;
        if outcome.remaining == 0 {
            debug!("No long-poll sessions left; sweeper stopping");
            break;
        }
    }
}

/// Server-sent events for one attached client. Detaches itself from the
/// session when the response body is dropped.
pub struct PushStream {
    rx: mpsc::UnboundedReceiver<Event>,
    _detach: DetachGuard,
}

impl Stream for PushStream {
    type Item = std::result::Result<Event, Infallible>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx).map(|event| event.map(Ok))
    }
}

struct DetachGuard {
    session: Weak<Mutex<Session>>,
    stream_id: u64,
}

impl Drop for DetachGuard {
    fn drop(&mut self) {
        let session = self.session.clone();
        let stream_id = self.stream_id;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            return;
        };
        runtime.spawn(async move {
            let Some(session) = session.upgrade() else {
                return;
            };
            let mut session = session.lock().await;
            if session.stream.as_ref().is_some_and(|s| s.id == stream_id) {
                session.stream = None;
                debug!(stream_id, "Push stream detached");
            }
        });
    }
}
