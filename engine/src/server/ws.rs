//! WebSocket connections
//!
//! Each connection gets a `connected` greeting, then its frames are handled
//! strictly in order: the next frame is not read until the reply to the
//! current one has been sent.

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use sdk::protocol::{Connected, Features, Message};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::AppState;
use crate::channel::{inbound, Inbound, PROCESS_FAILURE};
use crate::conversation::Session;

const GREETING: &str = "Connected to AIRI Backend";

pub(super) async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_websocket(socket, state))
}

/// Keeps the connection count accurate however the handler exits
struct ConnectionGuard(Arc<AtomicUsize>);

impl ConnectionGuard {
    fn register(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(Arc::clone(counter))
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

async fn handle_websocket(mut socket: WebSocket, state: AppState) {
    let _guard = ConnectionGuard::register(&state.connections);
    info!(
        "New WebSocket connection ({} active)",
        state.connections.load(Ordering::SeqCst)
    );

    let greeting = Message::Connected(Connected {
        message: GREETING.to_string(),
        timestamp: sdk::protocol::now_millis(),
        features: Features {
            voice: true,
            memory: true,
            openai: state.providers.openai,
            gemini: state.providers.gemini,
        },
    });
    if !send(&mut socket, &greeting).await {
        return;
    }

    let session = match state.exchange.open_session(&state.default_user).await {
        Ok(session) => session,
        Err(e) => {
            // Replies still flow; persistence steps will report failures
            warn!("Could not open session for {}: {}", state.default_user, e);
            Session {
                user_id: state.default_user.clone(),
                conversation_id: String::new(),
            }
        }
    };

    while let Some(frame) = socket.recv().await {
        let text = match frame {
            Ok(WsMessage::Text(text)) => text,
            Ok(WsMessage::Binary(bytes)) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!("Received non UTF-8 binary frame");
                    if !send(&mut socket, &Message::error(PROCESS_FAILURE)).await {
                        break;
                    }
                    continue;
                }
            },
            Ok(WsMessage::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                warn!("WebSocket error: {}", e);
                break;
            }
        };

        debug!("Received WebSocket message: {}", text);

        let reply = match inbound(&text) {
            Some(Inbound::Message(msg)) => state.exchange.handle(&session, msg).await,
            Some(Inbound::Rejected(error)) => Some(error),
            None => None,
        };

        if let Some(reply) = reply {
            if !send(&mut socket, &reply).await {
                break;
            }
        }
    }

    info!("WebSocket connection closed");
}

/// Returns false once the socket can no longer be written
async fn send(socket: &mut WebSocket, msg: &Message) -> bool {
    let text = match msg.encode() {
        Ok(text) => text,
        Err(e) => {
            warn!("Failed to encode {}: {}", msg.kind(), e);
            return true;
        }
    };
    match socket.send(WsMessage::Text(text)).await {
        Ok(()) => true,
        Err(e) => {
            debug!("WebSocket send failed: {}", e);
            false
        }
    }
}
