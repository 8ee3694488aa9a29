//! Relay metrics for observability
//!
//! Provides runtime counters for monitoring relay health and traffic.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Relay-wide metrics
#[derive(Debug, Default)]
pub struct ServerMetrics {
    // Connection metrics
    /// Currently joined target connections
    pub active_targets: AtomicU64,
    /// Total target connections since server start
    pub total_targets: AtomicU64,
    /// Currently joined devtool connections
    pub active_devtools: AtomicU64,
    /// Total devtool connections since server start
    pub total_devtools: AtomicU64,
    /// Devtools closed because no channel existed for them
    pub devtools_rejected: AtomicU64,

    // Channel metrics
    pub channels_created: AtomicU64,
    pub channels_removed: AtomicU64,

    // Message metrics
    /// Frames received from targets
    pub target_messages: AtomicU64,
    /// Frames received from devtools
    pub devtool_messages: AtomicU64,
    /// Per-peer sends that failed during fan-out
    pub failed_sends: AtomicU64,

    // Long-poll metrics
    pub long_poll_sessions: AtomicU64,
    pub long_poll_sessions_swept: AtomicU64,

    /// Server start time (for uptime calculation)
    start_time: Option<Instant>,
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            start_time: Some(Instant::now()),
            ..Default::default()
        }
    }

    pub fn target_joined(&self) {
        self.active_targets.fetch_add(1, Ordering::Relaxed);
        self.total_targets.fetch_add(1, Ordering::Relaxed);
    }

    pub fn target_left(&self) {
        self.active_targets.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn devtool_joined(&self) {
        self.active_devtools.fetch_add(1, Ordering::Relaxed);
        self.total_devtools.fetch_add(1, Ordering::Relaxed);
    }

    pub fn devtool_left(&self) {
        self.active_devtools.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn devtool_rejected(&self) {
        self.devtools_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_created(&self) {
        self.channels_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn channel_removed(&self) {
        self.channels_removed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn target_message(&self) {
        self.target_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn devtool_message(&self) {
        self.devtool_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn send_failed(&self) {
        self.failed_sends.fetch_add(1, Ordering::Relaxed);
    }

    pub fn long_poll_opened(&self) {
        self.long_poll_sessions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn long_poll_closed(&self) {
        self.long_poll_sessions.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn long_poll_swept(&self) {
        self.long_poll_sessions_swept.fetch_add(1, Ordering::Relaxed);
    }

    /// Get uptime in seconds
    pub fn uptime_secs(&self) -> u64 {
        self.start_time.map(|t| t.elapsed().as_secs()).unwrap_or(0)
    }

    /// Create a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            uptime_secs: self.uptime_secs(),
            connections: ConnectionMetrics {
                active_targets: self.active_targets.load(Ordering::Relaxed),
                total_targets: self.total_targets.load(Ordering::Relaxed),
                active_devtools: self.active_devtools.load(Ordering::Relaxed),
                total_devtools: self.total_devtools.load(Ordering::Relaxed),
                rejected_devtools: self.devtools_rejected.load(Ordering::Relaxed),
            },
            channels: ChannelMetrics {
                created: self.channels_created.load(Ordering::Relaxed),
                removed: self.channels_removed.load(Ordering::Relaxed),
            },
            messages: MessageMetrics {
                from_targets: self.target_messages.load(Ordering::Relaxed),
                from_devtools: self.devtool_messages.load(Ordering::Relaxed),
                failed_sends: self.failed_sends.load(Ordering::Relaxed),
            },
            long_poll: LongPollMetrics {
                active: self.long_poll_sessions.load(Ordering::Relaxed),
                swept: self.long_poll_sessions_swept.load(Ordering::Relaxed),
            },
        }
    }
}

/// Serializable snapshot of metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub uptime_secs: u64,
    pub connections: ConnectionMetrics,
    pub channels: ChannelMetrics,
    pub messages: MessageMetrics,
    pub long_poll: LongPollMetrics,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionMetrics {
    pub active_targets: u64,
    pub total_targets: u64,
    pub active_devtools: u64,
    pub total_devtools: u64,
    pub rejected_devtools: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelMetrics {
    pub created: u64,
    pub removed: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageMetrics {
    pub from_targets: u64,
    pub from_devtools: u64,
    pub failed_sends: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LongPollMetrics {
    pub active: u64,
    pub swept: u64,
}

/// Health status
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub channels: usize,
    pub targets: u64,
    pub devtools: u64,
    pub uptime_secs: u64,
}
