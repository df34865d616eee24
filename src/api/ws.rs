// =============================================================================
// WebSocket Handler — broadcast-channel subscriber
// =============================================================================
//
// Clients connect to `/ws?token=<token>` and receive every `BroadcastMessage`
// the coordinator publishes from that point on, pushed as soon as it's sent —
// no polling, no version diffing. A lagging subscriber that misses messages
// (broadcast channel overflow) is told so via a synthetic status line and
// keeps receiving new messages rather than disconnecting.
// =============================================================================

use axum::extract::{
    ws::{Message, WebSocket},
    Query, State, WebSocketUpgrade,
};
use axum::response::IntoResponse;
use serde::Deserialize;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use super::auth::validate_token;
use super::ApiState;
use crate::broadcast::BroadcastSink;

#[derive(Deserialize)]
pub struct WsQuery {
    token: Option<String>,
}

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Query(query): Query<WsQuery>,
) -> impl IntoResponse {
    let token = query.token.unwrap_or_default();
    if !validate_token(&token) {
        warn!("websocket connection rejected: invalid token");
        return (axum::http::StatusCode::FORBIDDEN, "invalid or missing token").into_response();
    }

    info!("websocket connection accepted — upgrading");
    ws.on_upgrade(move |socket| handle_connection(socket, state)).into_response()
}

async fn handle_connection(socket: WebSocket, state: ApiState) {
    use futures_util::{SinkExt, StreamExt};

    let (mut sender, mut receiver) = socket.split();
    let mut messages = state.broadcast.subscribe();

    loop {
        tokio::select! {
            received = messages.recv() => {
                match received {
                    Ok(message) => {
                        let Ok(json) = serde_json::to_string(&message) else { continue };
                        if sender.send(Message::Text(json.into())).await.is_err() {
                            debug!("websocket send failed — disconnecting");
                            break;
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "websocket subscriber lagged, dropped messages");
                    }
                    Err(RecvError::Closed) => {
                        info!("broadcast channel closed — disconnecting");
                        break;
                    }
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("websocket connection closed by client");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "websocket receive error — disconnecting");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }
}
