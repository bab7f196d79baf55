//! WebSocket endpoint and the per-participant I/O pumps.
//!
//! The read pump decodes client operations and submits them to the
//! document's controller; the write pump drains the bounded outbound
//! queue and keeps the connection alive with pings. Both sides are
//! bounded by deadlines so a dead peer cannot pin resources.

use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Extension;
use collab::hub::{HubHandle, ParticipantId};
use collab::operation::Operation;
use collab::protocol::ServerFrame;
use collab::registry::{Attached, ConnectError};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::auth::AuthUser;
use crate::AppState;

const WRITE_WAIT: Duration = Duration::from_secs(10);
const PONG_WAIT: Duration = Duration::from_secs(60);
const PING_PERIOD: Duration = Duration::from_secs(54);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(document_id): Path<String>,
    Extension(user): Extension<AuthUser>,
    State(state): State<AppState>,
) -> Response {
    // Validate and hydrate before upgrading so failures still surface
    // as HTTP statuses.
    if let Err(err) = state.registry.connect(&document_id, &user.id).await {
        let status = match err {
            ConnectError::Unauthorized => StatusCode::UNAUTHORIZED,
            ConnectError::BadRequest => StatusCode::BAD_REQUEST,
            ConnectError::Forbidden => StatusCode::FORBIDDEN,
            ConnectError::NotFound => StatusCode::NOT_FOUND,
            ConnectError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        };
        return (status, err.to_string()).into_response();
    }

    ws.on_upgrade(move |socket| handle_socket(socket, state, document_id, user))
}

async fn handle_socket(socket: WebSocket, state: AppState, document_id: String, user: AuthUser) {
    let Attached {
        participant_id,
        frames,
        hub,
    } = match state.registry.join(&document_id, &user.id).await {
        Ok(attached) => attached,
        Err(err) => {
            warn!(document_id, %err, "join failed after upgrade");
            let mut socket = socket;
            let _ = socket.send(Message::Close(None)).await;
            return;
        }
    };

    info!(
        document_id,
        user_id = %user.id,
        participant = %participant_id,
        "participant connected"
    );

    let (ws_tx, ws_rx) = socket.split();
    let send_task = tokio::spawn(write_pump(ws_tx, frames));

    read_pump(ws_rx, &hub, participant_id).await;

    let _ = hub.detach(participant_id).await;
    send_task.abort();

    info!(
        document_id,
        user_id = %user.id,
        participant = %participant_id,
        "participant disconnected"
    );
}

/// Reads frames until the socket errors, closes, or goes quiet past the
/// read deadline. Malformed operations are skipped, not fatal.
async fn read_pump(mut ws_rx: SplitStream<WebSocket>, hub: &HubHandle, participant_id: ParticipantId) {
    loop {
        let msg = match timeout(PONG_WAIT, ws_rx.next()).await {
            Err(_) => {
                debug!(participant = %participant_id, "read deadline expired");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(err))) => {
                debug!(participant = %participant_id, %err, "websocket read error");
                break;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match msg {
            Message::Text(text) => {
                let op: Operation = match serde_json::from_str(&text) {
                    Ok(op) => op,
                    Err(err) => {
                        warn!(participant = %participant_id, %err, "malformed operation frame");
                        continue;
                    }
                };
                if hub.submit(participant_id, op).await.is_err() {
                    break;
                }
            }
            Message::Binary(data) => {
                debug!(participant = %participant_id, len = data.len(), "ignoring binary frame")
            }
            // Any traffic, pongs included, counts as liveness; the
            // timeout above is re-armed on every message.
            Message::Ping(_) | Message::Pong(_) => {}
            Message::Close(_) => break,
        }
    }
}

/// Serializes outbound frames onto the socket and pings on an interval.
/// A closed outbound queue means the controller dropped this
/// participant: send a close frame and stop.
async fn write_pump(
    mut ws_tx: SplitSink<WebSocket, Message>,
    mut frames: mpsc::Receiver<ServerFrame>,
) {
    let mut ticker = tokio::time::interval(PING_PERIOD);
    loop {
        tokio::select! {
            frame = frames.recv() => {
                let Some(frame) = frame else {
                    let _ = timeout(WRITE_WAIT, ws_tx.send(Message::Close(None))).await;
                    break;
                };
                let json = match serde_json::to_string(&frame) {
                    Ok(json) => json,
                    Err(err) => {
                        error!(%err, "failed to serialize frame");
                        continue;
                    }
                };
                match timeout(WRITE_WAIT, ws_tx.send(Message::Text(json))).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(%err, "websocket write error");
                        break;
                    }
                    Err(_) => {
                        debug!("write deadline expired");
                        break;
                    }
                }
            }
            _ = ticker.tick() => {
                match timeout(WRITE_WAIT, ws_tx.send(Message::Ping(Vec::new()))).await {
                    Ok(Ok(())) => {}
                    _ => break,
                }
            }
        }
    }
}
