//! Channels
//!
//! A channel pairs the target connections and devtool connections that share
//! one channel id and relays frames between the two roles:
//! - every frame from a target goes to every devtool
//! - every frame from a devtool goes to every target
//!
//! Frames are opaque strings. Membership changes are published on the
//! registry's lifecycle bus.

mod connection;
mod events;
mod service;
mod status;

use futures::StreamExt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::metrics::ServerMetrics;

pub use connection::{
    Connection, Devtool, DevtoolInfo, Inbound, Target, TargetInfo, TargetQuery, Transport,
};
pub use events::{
    ChannelEvent, ChannelEventKind, ChannelSubscription, LifecycleBroadcast,
    create_lifecycle_broadcast, fire_channel_change,
};
pub use service::ChannelService;
pub use status::ChannelStatus;

/// Acknowledgement sent to a target right after it joins.
pub const CONNECTED_ACK: &str = "connected";

/// Sent to every target when a devtool leaves, so an abandoned session does
/// not stay paused on a breakpoint.
pub const DEBUGGER_DISABLE: &str = r#"{"id":-1,"method":"Debugger.disable"}"#;

#[derive(Default)]
struct Members {
    targets: Vec<Target>,
    devtools: Vec<Devtool>,
}

impl Members {
    fn status(&self) -> ChannelStatus {
        ChannelStatus::from_counts(self.targets.len(), self.devtools.len())
    }
}

pub struct Channel {
    id: String,
    members: RwLock<Members>,
    events: LifecycleBroadcast,
    metrics: Arc<ServerMetrics>,
}

impl Channel {
    pub fn new(id: String, events: LifecycleBroadcast, metrics: Arc<ServerMetrics>) -> Self {
        Self {
            id,
            members: RwLock::new(Members::default()),
            events,
            metrics,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn status(&self) -> ChannelStatus {
        self.members.read().await.status()
    }

    /// (targets, devtools)
    pub async fn counts(&self) -> (usize, usize) {
        let members = self.members.read().await;
        (members.targets.len(), members.devtools.len())
    }

    pub async fn first_target(&self) -> Option<TargetInfo> {
        let members = self.members.read().await;
        members.targets.first().map(|t| t.info.clone())
    }

    /// Join a target and start relaying its frames to the devtools.
    pub async fn add_target(self: &Arc<Self>, info: TargetInfo, conn: Connection) {
        let Connection { transport, inbound } = conn;
        let target = Target::new(info, transport);
        let conn_id = target.conn_id;

        {
            let mut members = self.members.write().await;
            members.targets.push(target.clone());
            if let Err(e) = target.transport().send(CONNECTED_ACK) {
                warn!(channel = %self.id, "Failed to acknowledge target: {}", e);
            }
            self.metrics.target_joined();
            self.publish(ChannelEventKind::TargetAdd, &members);
        }

        info!(channel = %self.id, url = %target.info.url, "Target joined");

        let channel = Arc::clone(self);
        tokio::spawn(async move { channel.pump_target(conn_id, inbound).await });
    }

    /// Join a devtool and start relaying its frames to the targets.
    pub async fn add_devtool(self: &Arc<Self>, info: DevtoolInfo, conn: Connection) {
        let Connection { transport, inbound } = conn;
        let devtool = Devtool::new(info, transport);
        let conn_id = devtool.conn_id;
        let label = devtool.info.id.clone();
        let mode = devtool.info.mode.clone();

        {
            let mut members = self.members.write().await;
            members.devtools.push(devtool);
            self.metrics.devtool_joined();
            self.publish(ChannelEventKind::DevtoolAdd, &members);
            if members.devtools.len() == 1 && !members.targets.is_empty() {
                self.publish(ChannelEventKind::ChannelBuilt, &members);
            }
        }

        info!(channel = %self.id, devtool = %label, mode = ?mode, "Devtool joined");

        let channel = Arc::clone(self);
        tokio::spawn(async move { channel.pump_devtool(conn_id, inbound).await });
    }

    async fn pump_target(self: Arc<Self>, conn_id: Uuid, mut inbound: Inbound) {
        while let Some(message) = inbound.next().await {
            self.metrics.target_message();
            let members = self.members.read().await;
            self.broadcast(members.devtools.iter().map(Devtool::transport), &message);
        }
        self.remove_target(conn_id).await;
    }

    async fn pump_devtool(self: Arc<Self>, conn_id: Uuid, mut inbound: Inbound) {
        while let Some(message) = inbound.next().await {
            self.metrics.devtool_message();
            let members = self.members.read().await;
            self.broadcast(members.targets.iter().map(Target::transport), &message);
        }
        self.remove_devtool(conn_id).await;
    }

    /// Send one frame to each peer. A failing peer never stops the rest.
    fn broadcast<'a>(&self, peers: impl Iterator<Item = &'a Arc<dyn Transport>>, message: &str) {
        for peer in peers {
            if let Err(e) = peer.send(message) {
                self.metrics.send_failed();
                debug!(channel = %self.id, "Dropped frame for closed peer: {}", e);
            }
        }
    }

    /// Returns false if the target had already been removed.
    pub async fn remove_target(&self, conn_id: Uuid) -> bool {
        let mut members = self.members.write().await;
        let Some(pos) = members.targets.iter().position(|t| t.conn_id == conn_id) else {
            return false;
        };
        members.targets.remove(pos);
        self.metrics.target_left();
        self.publish(ChannelEventKind::TargetRemove, &members);

        if members.targets.is_empty() {
            // Each devtool's pump sees its stream end and removes it.
            for devtool in &members.devtools {
                devtool.transport().close();
            }
            if members.devtools.is_empty() {
                self.publish(ChannelEventKind::ChannelEmpty, &members);
            }
        }

        info!(channel = %self.id, "Target left");
        true
    }

    /// Returns false if the devtool had already been removed.
    pub async fn remove_devtool(&self, conn_id: Uuid) -> bool {
        let mut members = self.members.write().await;
        let Some(pos) = members.devtools.iter().position(|d| d.conn_id == conn_id) else {
            return false;
        };
        members.devtools.remove(pos);
        self.metrics.devtool_left();
        self.broadcast(
            members.targets.iter().map(Target::transport),
            DEBUGGER_DISABLE,
        );
        self.publish(ChannelEventKind::DevtoolRemove, &members);

        if members.status() == ChannelStatus::Disable {
            self.publish(ChannelEventKind::ChannelEmpty, &members);
        }

        info!(channel = %self.id, "Devtool left");
        true
    }

    fn publish(&self, kind: ChannelEventKind, members: &Members) {
        let event = ChannelEvent {
            kind,
            channel_id: self.id.clone(),
            targets: members.targets.len(),
            devtools: members.devtools.len(),
        };
        debug!(channel = %self.id, ?kind, "Channel event");
        fire_channel_change(&self.events, event);
    }
}
