//! Channel lifecycle events
//!
//! Channels publish every membership change on a broadcast bus owned by the
//! registry. Subscribers either hold a raw receiver or register a callback
//! through [`ChannelSubscription`], which removes itself when dropped.

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::status::ChannelStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelEventKind {
    /// First devtool paired with a channel that already has a target.
    ChannelBuilt,
    /// No targets and no devtools remain.
    ChannelEmpty,
    TargetAdd,
    TargetRemove,
    DevtoolAdd,
    DevtoolRemove,
}

#[cfg(test)]
impl ChannelEventKind {
    pub const ALL: [ChannelEventKind; 6] = [
        ChannelEventKind::ChannelBuilt,
        ChannelEventKind::ChannelEmpty,
        ChannelEventKind::TargetAdd,
        ChannelEventKind::TargetRemove,
        ChannelEventKind::DevtoolAdd,
        ChannelEventKind::DevtoolRemove,
    ];
}

/// A lifecycle transition, with the member counts right after it happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelEvent {
    pub kind: ChannelEventKind,
    pub channel_id: String,
    pub targets: usize,
    pub devtools: usize,
}

impl ChannelEvent {
    pub fn status(&self) -> ChannelStatus {
        ChannelStatus::from_counts(self.targets, self.devtools)
    }
}

/// Broadcast channel for channel lifecycle events
pub type LifecycleBroadcast = broadcast::Sender<ChannelEvent>;

/// Create a new lifecycle broadcast channel
pub fn create_lifecycle_broadcast() -> LifecycleBroadcast {
    let (tx, _) = broadcast::channel(256);
    tx
}

/// Publish an event to every current subscriber. With none attached the
/// event is dropped.
pub fn fire_channel_change(bus: &LifecycleBroadcast, event: ChannelEvent) {
    let _ = bus.send(event);
}

/// Handle for a callback registered against every lifecycle event kind.
///
/// The callback runs on its own task, in publish order. Dropping the handle
/// detaches it from all kinds at once.
pub struct ChannelSubscription {
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl ChannelSubscription {
    pub(crate) fn spawn<F>(mut rx: broadcast::Receiver<ChannelEvent>, callback: F) -> Self
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => break,
                    recv = rx.recv() => match recv {
                        Ok(event) => callback(&event),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(skipped = n, "Lifecycle subscriber lagged");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
        Self { cancel, task }
    }

    pub fn unsubscribe(self) {
        drop(self);
    }

    #[cfg(test)]
    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for ChannelSubscription {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
