//! WebSocket upgrade entrypoint and the per-connection socket loop.

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::{IntoResponse, Response},
};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Duration, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::registry::ConnectionId;
use super::session::ConnectionSession;
use super::WebSocketState;
use crate::error::{ErrorSeverity, ParleyError, Result};
use crate::{ChatId, UserId};

/// How long the writer may spend flushing once the connection is closing.
const CLOSE_GRACE: Duration = Duration::from_secs(5);

/// Query parameters for the upgrade request.
#[derive(Debug, Default, Deserialize)]
pub struct WsConnectParams {
    pub user_id: Option<String>,
    pub chat_id: Option<String>,
}

impl WsConnectParams {
    pub fn user_id(&self) -> UserId {
        parse_id(self.user_id.as_deref())
    }

    pub fn chat_id(&self) -> ChatId {
        parse_id(self.chat_id.as_deref())
    }
}

/// Lenient id parsing: missing or unparseable values become 0.
pub fn parse_id(raw: Option<&str>) -> i64 {
    raw.and_then(|v| v.trim().parse().ok()).unwrap_or(0)
}

/// Handle WebSocket upgrade request.
///
/// Requests that are not valid upgrades get an `UPGRADE_FAILED` error body.
pub async fn ws_upgrade_handler(
    ws: std::result::Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Query(params): Query<WsConnectParams>,
    State(state): State<Arc<WebSocketState>>,
) -> Result<Response> {
    let ws = ws?;
    let user_id = params.user_id();
    let chat_id = params.chat_id();
    let max_bytes = state.config.max_frame_bytes;

    Ok(ws
        .max_message_size(max_bytes)
        .max_frame_size(max_bytes)
        .on_upgrade(move |socket| handle_websocket(socket, user_id, chat_id, state))
        .into_response())
}

/// Handle an individual WebSocket connection.
async fn handle_websocket(
    socket: WebSocket,
    user_id: UserId,
    chat_id: ChatId,
    state: Arc<WebSocketState>,
) {
    let (ws_sender, mut ws_receiver) = socket.split();

    let (session, rx) = ConnectionSession::open(state.clone(), user_id, chat_id);
    let conn_id = session.id();
    let shutdown = session.shutdown_token();

    let writer = tokio::spawn(write_loop(ws_sender, rx, shutdown.clone()));

    let heartbeat_period = state.config.heartbeat_interval();
    let idle_timeout = state.config.connection_timeout();
    let mut heartbeat = interval_at(Instant::now() + heartbeat_period, heartbeat_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut last_seen = Instant::now();

    // Main read loop. One frame is fully handled before the next is read.
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                debug!(connection_id = %conn_id, "Connection closed by server");
                break;
            }

            msg = ws_receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        if let Err(e) = session.handle_frame(&text).await {
                            log_frame_error(&e, conn_id);
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        last_seen = Instant::now();
                        debug!(connection_id = %conn_id, "Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => {
                        debug!(connection_id = %conn_id, "Client requested close");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(connection_id = %conn_id, error = %e, "WebSocket read error");
                        break;
                    }
                    None => {
                        debug!(connection_id = %conn_id, "WebSocket stream ended");
                        break;
                    }
                }
            }

            _ = heartbeat.tick() => {
                if last_seen.elapsed() > idle_timeout {
                    info!(connection_id = %conn_id, "Connection idle, closing");
                    break;
                }
                if session.ping().is_err() {
                    break;
                }
            }
        }
    }

    session.close();

    match timeout(CLOSE_GRACE, writer).await {
        Ok(Err(e)) => warn!(connection_id = %conn_id, error = %e, "Writer task failed"),
        Err(_) => warn!(connection_id = %conn_id, "Writer did not finish in time"),
        Ok(Ok(())) => {}
    }
}

/// Sole owner of the socket's write half. Drains the outbound queue until
/// the connection shuts down, then flushes what is left and closes.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            msg = rx.recv() => match msg {
                Some(msg) => {
                    if let Err(e) = sink.send(msg).await {
                        debug!(error = %e, "WebSocket write failed");
                        shutdown.cancel();
                        return;
                    }
                }
                None => break,
            },
        }
    }

    while let Ok(msg) = rx.try_recv() {
        if sink.send(msg).await.is_err() {
            return;
        }
    }
    let _ = sink.send(Message::Close(None)).await;
}

fn log_frame_error(error: &ParleyError, conn_id: ConnectionId) {
    match error.severity() {
        ErrorSeverity::Low | ErrorSeverity::Medium => {
            debug!(connection_id = %conn_id, error = %error, "Frame dropped");
        }
        ErrorSeverity::High | ErrorSeverity::Critical => {
            error.log();
        }
    }
}
