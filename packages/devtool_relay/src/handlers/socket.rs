//! WebSocket adapter
//!
//! Turns an upgraded axum socket into a channel `Connection`: a writer task
//! owns the sink and drains an unbounded queue, so `Transport::send` never
//! blocks the relay loop of another peer.

use axum::{
    extract::{
        FromRequestParts, Path, Query, Request, State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt, future};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::AppState;
use crate::channel::{
    ChannelEvent, ChannelEventKind, ChannelService, ChannelSubscription, Connection, DevtoolInfo,
    TargetInfo, TargetQuery, Transport,
};
use crate::error::{RelayError, Result};

enum Outgoing {
    Text(String),
    Close,
}

struct SocketTransport {
    tx: mpsc::UnboundedSender<Outgoing>,
}

impl Transport for SocketTransport {
    fn send(&self, text: &str) -> Result<()> {
        self.tx
            .send(Outgoing::Text(text.to_owned()))
            .map_err(|_| RelayError::PeerClosed)
    }

    fn close(&self) {
        let _ = self.tx.send(Outgoing::Close);
    }
}

pub(crate) fn socket_connection(socket: WebSocket) -> Connection {
    let (mut sender, receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outgoing>();
    let closed = CancellationToken::new();

    let writer_closed = closed.clone();
    tokio::spawn(async move {
        while let Some(outgoing) = rx.recv().await {
            match outgoing {
                Outgoing::Text(text) => {
                    if let Err(e) = sender.send(Message::Text(text.into())).await {
                        debug!("WebSocket send failed: {}", e);
                        break;
                    }
                }
                Outgoing::Close => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
        writer_closed.cancel();
    });

    // Ends on a close frame, a read error, or once the writer has closed us.
    let inbound = receiver
        .take_until(closed.cancelled_owned())
        .take_while(|frame| future::ready(matches!(frame, Ok(msg) if !matches!(msg, Message::Close(_)))))
        .filter_map(|frame| {
            future::ready(match frame {
                Ok(Message::Text(text)) => Some(text.as_str().to_owned()),
                _ => None,
            })
        })
        .boxed();

    Connection::new(Arc::new(SocketTransport { tx }), inbound)
}

/// `GET /target/{id}`: a WebSocket upgrade joins the channel as a target;
/// a plain GET attaches a long-poll event stream.
pub async fn target_get(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<TargetQuery>,
    request: Request,
) -> Response {
    let (mut parts, _body) = request.into_parts();
    match WebSocketUpgrade::from_request_parts(&mut parts, &state).await {
        Ok(ws) => {
            let info = TargetInfo::from_query(id, query);
            ws.on_upgrade(move |socket| async move {
                state
                    .channels
                    .handle_target_connection(info, socket_connection(socket))
                    .await;
            })
        }
        Err(_) => super::long_poll::attach_stream(&state, &id).await,
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DevtoolQuery {
    #[serde(default)]
    pub mode: Option<String>,
    #[serde(default)]
    pub target_id: Option<String>,
}

/// `GET /devtool/{id}?targetId=...`
pub async fn devtool_socket(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DevtoolQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(target_id) = query.target_id.filter(|t| !t.is_empty()) else {
        return RelayError::MissingTargetId.into_response();
    };
    let info = DevtoolInfo {
        id,
        mode: query.mode,
        target_id,
    };
    ws.on_upgrade(move |socket| async move {
        state
            .channels
            .handle_devtool_connection(info, socket_connection(socket))
            .await;
    })
}

fn log_channel_event(event: &ChannelEvent) {
    let channel = event.channel_id.as_str();
    match event.kind {
        ChannelEventKind::ChannelBuilt => info!(channel, "Channel built"),
        ChannelEventKind::ChannelEmpty => info!(channel, "Channel empty"),
        kind => debug!(
            channel,
            ?kind,
            targets = event.targets,
            devtools = event.devtools,
            status = ?event.status(),
            "Channel membership changed"
        ),
    }
}

/// Log every lifecycle transition for as long as the handle lives.
pub fn log_lifecycle(channels: &ChannelService) -> ChannelSubscription {
    channels.subscribe_channel_change(log_channel_event)
}
