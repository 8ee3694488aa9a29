use futures::StreamExt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use crate::AppState;
use crate::channel::{
    ChannelEvent, ChannelService, Connection, DevtoolInfo, TargetInfo, TargetQuery, Transport,
};
use crate::config::{FileConfig, RelayConfig};
use crate::error::{RelayError, Result};
use crate::long_poll::LongPollSessions;
use crate::metrics::ServerMetrics;

/// Upper bound for any single wait in tests.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(5);

/// In-memory transport: frames sent by the relay land in the peer's outbox.
struct MemoryTransport {
    outbox: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
}

impl Transport for MemoryTransport {
    fn send(&self, text: &str) -> Result<()> {
        if self.closed.is_cancelled() {
            return Err(RelayError::PeerClosed);
        }
        self.outbox
            .send(text.to_owned())
            .map_err(|_| RelayError::PeerClosed)
    }

    fn close(&self) {
        self.closed.cancel();
    }
}

/// Test side of an in-memory connection.
pub struct TestPeer {
    inbound: Option<mpsc::UnboundedSender<String>>,
    outbox: mpsc::UnboundedReceiver<String>,
    closed: CancellationToken,
}

impl TestPeer {
    /// Emit a frame as if the remote peer sent it.
    pub fn send(&self, text: &str) {
        if let Some(tx) = &self.inbound {
            let _ = tx.send(text.to_owned());
        }
    }

    /// Next frame the relay sent to this peer, or None after `TEST_TIMEOUT`.
    pub async fn recv(&mut self) -> Option<String> {
        tokio::time::timeout(TEST_TIMEOUT, self.outbox.recv())
            .await
            .ok()
            .flatten()
    }

    pub fn try_recv(&mut self) -> Option<String> {
        self.outbox.try_recv().ok()
    }

    /// Simulate the remote peer going away.
    pub fn disconnect(&mut self) {
        self.inbound.take();
    }

    /// Whether the relay closed this peer.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn wait_closed(&self) {
        tokio::time::timeout(TEST_TIMEOUT, self.closed.cancelled())
            .await
            .expect("peer was not closed in time");
    }
}

pub fn memory_connection() -> (Connection, TestPeer) {
    let (inbound_tx, inbound_rx) = mpsc::unbounded_channel::<String>();
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel::<String>();
    let closed = CancellationToken::new();

    let inbound = futures::stream::unfold(inbound_rx, |mut rx| async move {
        rx.recv().await.map(|msg| (msg, rx))
    })
    .take_until(closed.clone().cancelled_owned())
    .boxed();

    let transport = Arc::new(MemoryTransport {
        outbox: outbox_tx,
        closed: closed.clone(),
    });

    (
        Connection::new(transport, inbound),
        TestPeer {
            inbound: Some(inbound_tx),
            outbox: outbox_rx,
            closed,
        },
    )
}

struct FailingTransport;

impl Transport for FailingTransport {
    fn send(&self, _text: &str) -> Result<()> {
        Err(RelayError::PeerClosed)
    }

    fn close(&self) {}
}

/// A connection whose every send fails. Keep the returned sender alive to
/// keep the connection joined.
pub fn failing_connection() -> (Connection, mpsc::UnboundedSender<String>) {
    let (tx, rx) = mpsc::unbounded_channel::<String>();
    let inbound = futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|msg| (msg, rx))
    })
    .boxed();
    (Connection::new(Arc::new(FailingTransport), inbound), tx)
}

pub fn test_target_info(id: &str) -> TargetInfo {
    TargetInfo::from_query(
        id.to_string(),
        TargetQuery {
            url: Some("https://example.com/".into()),
            ua: Some("test-agent".into()),
            title: Some("Example".into()),
            ..Default::default()
        },
    )
}

pub fn test_devtool_info(target_id: &str) -> DevtoolInfo {
    DevtoolInfo {
        id: "devtool".into(),
        mode: None,
        target_id: target_id.to_string(),
    }
}

pub async fn next_event(rx: &mut broadcast::Receiver<ChannelEvent>) -> ChannelEvent {
    tokio::time::timeout(TEST_TIMEOUT, rx.recv())
        .await
        .expect("timed out waiting for channel event")
        .expect("lifecycle bus closed")
}

/// Poll `check` until it returns true, panicking after `TEST_TIMEOUT`.
pub async fn eventually<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    while !check().await {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not met within {:?}",
            TEST_TIMEOUT
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Config with short long-poll timings so tests run quickly.
pub fn test_config() -> RelayConfig {
    let mut fc = FileConfig::default();
    fc.long_poll.reconnect_delay_ms = 50;
    RelayConfig::from_file(&fc)
}

/// Build an `AppState` whose long-poll bridge dials `relay_url`.
pub fn test_app_state(config: RelayConfig, relay_url: String) -> AppState {
    let metrics = Arc::new(ServerMetrics::new());
    let channels = ChannelService::start(metrics.clone());
    let long_poll = LongPollSessions::new(relay_url, config.long_poll.clone(), metrics.clone());
    AppState {
        channels,
        long_poll,
        metrics,
        config: Arc::new(config),
    }
}
