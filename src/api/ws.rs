// =============================================================================
// WebSocket transport
// =============================================================================
//
// Thin bridge between a socket and the hub. On upgrade the connection
// registers a hub session and then runs a select loop: frames queued by the
// hub drain to the socket, inbound text goes to the hub's protocol handler,
// and transport-level pings are answered in place. Dropping either direction
// tears the session down.
//
// Authentication happens inside the protocol (an `auth` frame), so the
// upgrade itself is open; unauthenticated sessions receive no market data.
// =============================================================================

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info};

use crate::app_state::AppState;

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn handle_connection(socket: WebSocket, state: Arc<AppState>) {
    let (session_id, mut outbound) = state.hub.register();
    info!(session_id, "websocket connected");

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            // Hub -> socket. A closed receiver means the hub dropped the
            // session (overflow or heartbeat) and the socket should follow.
            queued = outbound.recv() => {
                match queued {
                    Some(frame) => {
                        if sink.send(Message::Text(frame)).await.is_err() {
                            debug!(session_id, "websocket send failed");
                            break;
                        }
                    }
                    None => {
                        debug!(session_id, "hub closed the session");
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }

            // Socket -> hub.
            incoming = stream.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        state.hub.handle_inbound(session_id, &text);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if sink.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        // Liveness already tracked on inbound frames.
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(session_id, "websocket closed by peer");
                        break;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(session_id, "binary frame ignored");
                    }
                    Some(Err(e)) => {
                        debug!(session_id, error = %e, "websocket receive error");
                        break;
                    }
                }
            }
        }
    }

    state.hub.unregister(session_id);
    info!(session_id, "websocket disconnected");
}
