//! `GET /api/v1/live` — the live-subscriber WebSocket upgrade (§6
//! "Live-subscriber channel").

use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, State};
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;

use crate::api::middleware::AuthContext;
use crate::api::state::AppState;
use crate::events::broadcaster::ServerMessage;

pub fn routes() -> Router<AppState> {
    Router::new().route("/", get(upgrade))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Subscribe {
        #[serde(default)]
        characteristic_ids: Vec<i64>,
        #[serde(default)]
        characteristic_id: Option<i64>,
    },
    Unsubscribe {
        #[serde(default)]
        characteristic_ids: Vec<i64>,
        #[serde(default)]
        characteristic_id: Option<i64>,
    },
    Ping,
}

fn merge_ids(mut characteristic_ids: Vec<i64>, characteristic_id: Option<i64>) -> Vec<i64> {
    characteristic_ids.extend(characteristic_id);
    characteristic_ids
}

async fn upgrade(ws: WebSocketUpgrade, State(state): State<AppState>, Extension(auth): Extension<AuthContext>) -> Response {
    let authenticated = auth.grant.is_some();
    ws.on_upgrade(move |socket| handle_socket(socket, state, authenticated))
}

/// §6: "Unauthenticated connects: close with code 4001" — the handshake
/// still completes (axum performs it before this runs); the connection is
/// then closed immediately rather than rejected at the HTTP layer.
async fn handle_socket(mut socket: WebSocket, state: AppState, authenticated: bool) {
    if !authenticated {
        let _ = socket
            .send(Message::Close(Some(CloseFrame {
                code: 4001,
                reason: "unauthenticated".into(),
            })))
            .await;
        return;
    }

    let (connection_id, mut outbound) = state.broadcaster.register();
    state.metrics.live_connections.inc();

    loop {
        tokio::select! {
            message = outbound.recv() => {
                let Some(message) = message else { break };
                let Ok(text) = serde_json::to_string(&message) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => handle_client_message(&state, connection_id, &mut socket, &text).await,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }

    state.broadcaster.remove(connection_id);
    state.metrics.live_connections.dec();
}

async fn handle_client_message(state: &AppState, connection_id: u64, socket: &mut WebSocket, text: &str) {
    match serde_json::from_str::<ClientMessage>(text) {
        Ok(ClientMessage::Subscribe {
            characteristic_ids,
            characteristic_id,
        }) => {
            state.broadcaster.subscribe(connection_id, &merge_ids(characteristic_ids, characteristic_id));
        }
        Ok(ClientMessage::Unsubscribe {
            characteristic_ids,
            characteristic_id,
        }) => {
            state.broadcaster.unsubscribe(connection_id, &merge_ids(characteristic_ids, characteristic_id));
        }
        Ok(ClientMessage::Ping) => {
            state.broadcaster.touch_ping(connection_id);
        }
        Err(error) => {
            let message = ServerMessage::Error {
                message: format!("invalid message: {error}"),
            };
            if let Ok(text) = serde_json::to_string(&message) {
                let _ = socket.send(Message::Text(text)).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn merge_ids_combines_array_and_singular_forms() {
        assert_eq!(merge_ids(vec![1, 2], Some(3)), vec![1, 2, 3]);
        assert_eq!(merge_ids(vec![], Some(1)), vec![1]);
        assert_eq!(merge_ids(vec![1], None), vec![1]);
    }

    #[test]
    fn subscribe_message_parses_both_id_forms() {
        let array_form: ClientMessage = serde_json::from_str(r#"{"type":"subscribe","characteristic_ids":[1,2]}"#).unwrap();
        assert!(matches!(array_form, ClientMessage::Subscribe { characteristic_ids, .. } if characteristic_ids == vec![1, 2]));

        let singular_form: ClientMessage = serde_json::from_str(r#"{"type":"subscribe","characteristic_id":5}"#).unwrap();
        assert!(matches!(singular_form, ClientMessage::Subscribe { characteristic_id: Some(5), .. }));
    }
}
