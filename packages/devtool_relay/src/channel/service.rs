//! Channel registry
//!
//! Directory of live channels keyed by channel id, plus the lifecycle bus
//! every channel publishes on. The registry owns removal: a reaper task
//! listens for `ChannelEmpty` and drops the channel if it is still empty.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Weak};
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, info, warn};

use crate::metrics::ServerMetrics;

use super::events::{
    ChannelEvent, ChannelEventKind, ChannelSubscription, LifecycleBroadcast,
    create_lifecycle_broadcast,
};
use super::status::ChannelStatus;
use super::{Channel, Connection, DevtoolInfo, TargetInfo};

/// One row of the `/get_targets` listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSummary {
    #[serde(flatten)]
    pub target: TargetInfo,
    pub devtool_num: usize,
}

pub struct ChannelService {
    channels: RwLock<HashMap<String, Arc<Channel>>>,
    events: LifecycleBroadcast,
    metrics: Arc<ServerMetrics>,
}

impl ChannelService {
    /// Build an empty registry and start its reaper.
    pub fn start(metrics: Arc<ServerMetrics>) -> Arc<Self> {
        let service = Arc::new(Self {
            channels: RwLock::new(HashMap::new()),
            events: create_lifecycle_broadcast(),
            metrics,
        });
        // Subscribe before any channel exists so no ChannelEmpty is missed.
        let rx = service.subscribe();
        tokio::spawn(reap_empty_channels(Arc::downgrade(&service), rx));
        service
    }

    /// Join a target, creating its channel on first sight of the id.
    pub async fn handle_target_connection(&self, info: TargetInfo, conn: Connection) {
        let mut channels = self.channels.write().await;
        let channel = channels
            .entry(info.id.clone())
            .or_insert_with(|| {
                self.metrics.channel_created();
                info!(channel = %info.id, "Channel created");
                Arc::new(Channel::new(
                    info.id.clone(),
                    self.events.clone(),
                    self.metrics.clone(),
                ))
            })
            .clone();
        // Held across the add so the reaper cannot drop the channel under us.
        channel.add_target(info, conn).await;
    }

    /// Join a devtool to an existing channel. Returns false (and closes the
    /// transport) if no channel with a live target has that id.
    pub async fn handle_devtool_connection(&self, info: DevtoolInfo, conn: Connection) -> bool {
        let channels = self.channels.read().await;
        let channel = channels.get(&info.target_id).cloned();
        let live = match &channel {
            Some(channel) => channel.counts().await.0 > 0,
            None => false,
        };
        match channel {
            Some(channel) if live => {
                channel.add_devtool(info, conn).await;
                true
            }
            _ => {
                debug!(channel = %info.target_id, "Devtool rejected: no such channel");
                self.metrics.devtool_rejected();
                conn.transport.close();
                false
            }
        }
    }

    pub async fn channel(&self, id: &str) -> Option<Arc<Channel>> {
        self.channels.read().await.get(id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.channels.read().await.len()
    }

    /// Drop a channel from the directory. Idempotent.
    pub async fn remove_channel(&self, id: &str) -> bool {
        let removed = self.channels.write().await.remove(id).is_some();
        if removed {
            self.metrics.channel_removed();
            info!(channel = %id, "Channel removed");
        }
        removed
    }

    async fn remove_channel_if_empty(&self, id: &str) -> bool {
        let mut channels = self.channels.write().await;
        let empty = match channels.get(id) {
            Some(channel) => channel.status().await == ChannelStatus::Disable,
            None => false,
        };
        if empty {
            channels.remove(id);
            self.metrics.channel_removed();
            info!(channel = %id, "Channel removed");
        }
        empty
    }

    async fn prune_empty(&self) -> usize {
        let mut channels = self.channels.write().await;
        let mut empty = Vec::new();
        for (id, channel) in channels.iter() {
            if channel.status().await == ChannelStatus::Disable {
                empty.push(id.clone());
            }
        }
        for id in &empty {
            channels.remove(id);
            self.metrics.channel_removed();
        }
        empty.len()
    }

    /// Raw receiver on the lifecycle bus.
    pub fn subscribe(&self) -> broadcast::Receiver<ChannelEvent> {
        self.events.subscribe()
    }

    /// Register one callback for every lifecycle event kind. Drop the
    /// returned handle (or call `unsubscribe`) to detach it.
    pub fn subscribe_channel_change<F>(&self, callback: F) -> ChannelSubscription
    where
        F: Fn(&ChannelEvent) + Send + Sync + 'static,
    {
        ChannelSubscription::spawn(self.events.subscribe(), callback)
    }

    #[cfg(test)]
    pub fn receiver_count(&self) -> usize {
        self.events.receiver_count()
    }

    /// Snapshot of every channel with a target: its first target plus the
    /// number of devtools attached.
    pub async fn get_targets(&self) -> BTreeMap<String, TargetSummary> {
        let channels = self.channels.read().await;
        let mut targets = BTreeMap::new();
        for channel in channels.values() {
            let Some(target) = channel.first_target().await else {
                continue;
            };
            let (_, devtool_num) = channel.counts().await;
            targets.insert(
                channel.id().to_string(),
                TargetSummary {
                    target,
                    devtool_num,
                },
            );
        }
        targets
    }
}

async fn reap_empty_channels(
    service: Weak<ChannelService>,
    mut rx: broadcast::Receiver<ChannelEvent>,
) {
    loop {
        let recv = rx.recv().await;
        let Some(service) = service.upgrade() else {
            break;
        };
        match recv {
            Ok(event) if event.kind == ChannelEventKind::ChannelEmpty => {
                service.remove_channel_if_empty(&event.channel_id).await;
            }
            Ok(_) => {}
            Err(broadcast::error::RecvError::Lagged(n)) => {
                let pruned = service.prune_empty().await;
                warn!(skipped = n, pruned, "Channel reaper lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
