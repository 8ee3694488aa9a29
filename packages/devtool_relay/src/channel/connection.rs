//! Connection wrappers
//!
//! A [`Connection`] is whatever a transport adapter hands to the registry: a
//! send/close capability plus the stream of text frames the peer emits. The
//! stream ending is the close event. [`Target`] and [`Devtool`] pair one
//! connection's transport with the metadata it announced when joining.

use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::Result;

/// Capability a Channel needs from the transport behind a peer.
///
/// Implementations must not block: `send` only enqueues the frame.
pub trait Transport: Send + Sync + 'static {
    fn send(&self, text: &str) -> Result<()>;
    fn close(&self);
}

/// Inbound frames from a peer. Ends when the peer disconnects or is closed.
pub type Inbound = BoxStream<'static, String>;

pub struct Connection {
    pub transport: Arc<dyn Transport>,
    pub inbound: Inbound,
}

impl Connection {
    pub fn new(transport: Arc<dyn Transport>, inbound: Inbound) -> Self {
        Self { transport, inbound }
    }
}

/// Metadata a target page announces on the upgrade query string.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
    /// Channel id taken from the upgrade path.
    pub id: String,
    pub url: String,
    pub ua: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub uin: Option<String>,
    /// Connection time in milliseconds since the Unix epoch.
    pub time: i64,
    pub title: String,
    pub favicon: String,
}

/// Query parameters accepted on `/target/{id}`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TargetQuery {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub ua: Option<String>,
    #[serde(default)]
    pub uin: Option<String>,
    /// Raw value; anything unparseable falls back to the join time.
    #[serde(default)]
    pub time: Option<String>,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub favicon: Option<String>,
}

impl TargetInfo {
    pub fn from_query(id: String, query: TargetQuery) -> Self {
        Self {
            id,
            url: query.url.unwrap_or_default(),
            ua: query.ua.unwrap_or_default(),
            uin: query.uin.filter(|u| !u.is_empty()),
            time: query
                .time
                .as_deref()
                .and_then(parse_time)
                .unwrap_or_else(|| chrono::Utc::now().timestamp_millis()),
            title: query.title.unwrap_or_default(),
            favicon: query.favicon.unwrap_or_default(),
        }
    }
}

/// Milliseconds since the epoch, as an integer or a plain float.
fn parse_time(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    if let Ok(ms) = raw.parse::<i64>() {
        return Some(ms);
    }
    raw.parse::<f64>()
        .ok()
        .filter(|ms| ms.is_finite() && (i64::MIN as f64..=i64::MAX as f64).contains(ms))
        .map(|ms| ms as i64)
}

/// Metadata a devtool announces when it asks to join a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevtoolInfo {
    /// Path segment of the upgrade URL. Not used for routing.
    pub id: String,
    pub mode: Option<String>,
    /// Channel the devtool wants to join.
    pub target_id: String,
}

#[derive(Clone)]
pub struct Target {
    pub conn_id: Uuid,
    pub info: TargetInfo,
    transport: Arc<dyn Transport>,
}

impl Target {
    pub fn new(info: TargetInfo, transport: Arc<dyn Transport>) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            info,
            transport,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

#[derive(Clone)]
pub struct Devtool {
    pub conn_id: Uuid,
    pub info: DevtoolInfo,
    transport: Arc<dyn Transport>,
}

impl Devtool {
    pub fn new(info: DevtoolInfo, transport: Arc<dyn Transport>) -> Self {
        Self {
            conn_id: Uuid::new_v4(),
            info,
            transport,
        }
    }

    pub fn transport(&self) -> &Arc<dyn Transport> {
        &self.transport
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn target_info_from_full_query() {
        let query = TargetQuery {
            url: Some("https://example.com/".into()),
            ua: Some("Mozilla/5.0".into()),
            uin: Some("42".into()),
            time: Some("1700000000000".into()),
            title: Some("Example".into()),
            favicon: Some("https://example.com/favicon.ico".into()),
        };
        let info = TargetInfo::from_query("abc".into(), query);
        assert_eq!(info.id, "abc");
        assert_eq!(info.url, "https://example.com/");
        assert_eq!(info.uin.as_deref(), Some("42"));
        assert_eq!(info.time, 1_700_000_000_000);
    }

    #[test]
    fn target_info_defaults_time_to_now() {
        let before = chrono::Utc::now().timestamp_millis();
        let info = TargetInfo::from_query("abc".into(), TargetQuery::default());
        let after = chrono::Utc::now().timestamp_millis();
        assert!(info.time >= before && info.time <= after);
        assert!(info.url.is_empty());
        assert!(info.uin.is_none());
    }

    #[test]
    fn malformed_time_falls_back_to_now() {
        for raw in ["", "abc", "now", "NaN", "inf"] {
            let before = chrono::Utc::now().timestamp_millis();
            let info = TargetInfo::from_query(
                "abc".into(),
                TargetQuery {
                    time: Some(raw.into()),
                    ..Default::default()
                },
            );
            let after = chrono::Utc::now().timestamp_millis();
            assert!(info.time >= before && info.time <= after, "time={raw:?}");
        }
    }

    #[test]
    fn float_time_is_truncated() {
        assert_eq!(parse_time("1.7e12"), Some(1_700_000_000_000));
        assert_eq!(parse_time(" 42 "), Some(42));
    }

    #[test]
    fn target_info_serialization_skips_missing_uin() {
        let info = TargetInfo::from_query("abc".into(), TargetQuery::default());
        let json = serde_json::to_value(&info).unwrap();
        assert!(json.get("uin").is_none());
        assert_eq!(json["id"], "abc");
    }

    #[test]
    fn devtool_info_uses_camel_case() {
        let info = DevtoolInfo {
            id: "d1".into(),
            mode: Some("mirror".into()),
            target_id: "abc".into(),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["targetId"], "abc");
        assert_eq!(json["mode"], "mirror");
    }
}
