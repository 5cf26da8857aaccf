//! WebSocket debug channel.
//!
//! The client must open with a `connect` event carrying `session_type`
//! and a user token. Handshake and protocol violations close the socket
//! with 1008; server-initiated stale closes use 1000 (see
//! [`ws_pool`](crate::ws_pool)).

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use uuid::Uuid;

use relaybot_types::event::LauncherType;
use relaybot_types::message::MessageChain;

use crate::ws_pool::{WsConnection, WsOutbound, CLOSE_POLICY_VIOLATION};
use crate::ApiState;

/// How long the server waits for the `connect` handshake.
const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Path(pipeline_uuid): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state, pipeline_uuid))
}

fn event_frame(event_type: &str, data: serde_json::Value) -> Message {
    Message::Text(
        serde_json::json!({"type": event_type, "data": data})
            .to_string()
            .into(),
    )
}

fn error_frame(error_code: &str, message: &str) -> Message {
    event_frame(
        "error",
        serde_json::json!({"error_code": error_code, "message": message}),
    )
}

async fn reject(mut socket: WebSocket, error_code: &str, message: &str) {
    let _ = socket.send(error_frame(error_code, message)).await;
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: CLOSE_POLICY_VIOLATION,
            reason: error_code.to_string().into(),
        })))
        .await;
}

/// Parse and validate the `connect` handshake; `Err` carries
/// `(error_code, message)`.
fn parse_handshake(text: &str) -> Result<(String, String), (&'static str, String)> {
    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| ("INVALID_HANDSHAKE", format!("malformed handshake: {e}")))?;
    if value.get("type").and_then(|v| v.as_str()) != Some("connect") {
        return Err((
            "INVALID_HANDSHAKE",
            "first event must be connect".to_string(),
        ));
    }
    let session_type = value
        .pointer("/data/session_type")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    if !matches!(session_type.as_str(), "person" | "group") {
        return Err((
            "INVALID_SESSION_TYPE",
            "session_type must be person or group".to_string(),
        ));
    }
    let token = value
        .pointer("/data/token")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string();
    if token.is_empty() {
        return Err(("MISSING_TOKEN", "token is required".to_string()));
    }
    Ok((session_type, token))
}

async fn handle_socket(mut socket: WebSocket, state: ApiState, pipeline_uuid: String) {
    // Handshake first.
    let first = tokio::time::timeout(HANDSHAKE_TIMEOUT, socket.recv()).await;
    let text = match first {
        Ok(Some(Ok(Message::Text(text)))) => text.to_string(),
        _ => {
            reject(socket, "INVALID_HANDSHAKE", "expected a connect event").await;
            return;
        }
    };

    let (session_type, token) = match parse_handshake(&text) {
        Ok(parsed) => parsed,
        Err((code, message)) => {
            reject(socket, code, &message).await;
            return;
        }
    };

    match state.auth.validate(&token).await {
        Ok(true) => {}
        Ok(false) => {
            reject(socket, "UNAUTHORIZED", "token rejected").await;
            return;
        }
        Err(e) => {
            warn!(error = %e, "token validation backend failed");
            reject(socket, "AUTH_ERROR", "token validation failed").await;
            return;
        }
    }

    // Register in the pool.
    let connection_id = Uuid::new_v4().to_string();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<WsOutbound>(32);
    let connection = Arc::new(WsConnection::new(
        connection_id.clone(),
        pipeline_uuid.clone(),
        session_type.clone(),
        outbound_tx,
    ));
    let session_key = connection.session_key();
    state.ws_pool.add_connection(connection.clone());

    let _ = socket
        .send(event_frame(
            "connected",
            serde_json::json!({
                "connection_id": connection_id,
                "session_type": session_type,
                "pipeline_uuid": pipeline_uuid,
            }),
        ))
        .await;

    loop {
        tokio::select! {
            outbound = outbound_rx.recv() => match outbound {
                Some(WsOutbound::Event(text)) => {
                    if socket.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Some(WsOutbound::Close(code)) => {
                    let _ = socket
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: "stale".into(),
                        })))
                        .await;
                    break;
                }
                None => break,
            },
            inbound = socket.recv() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    handle_client_event(&state, &connection, &pipeline_uuid, &session_type, &text)
                        .await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!(error = %e, "websocket receive error");
                    break;
                }
            },
        }
    }

    state
        .ws_pool
        .remove_connection(&connection_id, &session_key)
        .await;
}

async fn handle_client_event(
    state: &ApiState,
    connection: &Arc<WsConnection>,
    pipeline_uuid: &str,
    session_type: &str,
    text: &str,
) {
    let Ok(value) = serde_json::from_str::<serde_json::Value>(text) else {
        let _ = connection
            .send(
                "error",
                serde_json::json!({"error_code": "INVALID_REQUEST", "message": "malformed event"}),
            )
            .await;
        return;
    };

    match value.get("type").and_then(|v| v.as_str()).unwrap_or("") {
        "send_message" => {
            let chain: MessageChain = value
                .pointer("/data/message")
                .cloned()
                .and_then(|v| serde_json::from_value(v).ok())
                .unwrap_or_default();
            if chain.is_empty() {
                let _ = connection
                    .send(
                        "error",
                        serde_json::json!({
                            "error_code": "INVALID_REQUEST",
                            "message": "message is required",
                        }),
                    )
                    .await;
                return;
            }

            // The sync bridge blocks until the pipeline answers; run it
            // off the socket loop and broadcast to every tab on arrival.
            let adapter = state.platform.webchat_adapter();
            let pool = state.ws_pool.clone();
            let connection = connection.clone();
            let pipeline_uuid = pipeline_uuid.to_string();
            let session_type = session_type.to_string();
            tokio::spawn(async move {
                match adapter
                    .send_debug_message(&pipeline_uuid, &session_type, chain)
                    .await
                {
                    Ok(reply) => {
                        pool.broadcast(
                            &pipeline_uuid,
                            &session_type,
                            "message_sent",
                            serde_json::json!({"message": reply}),
                        )
                        .await;
                    }
                    Err(e) => {
                        let _ = connection
                            .send(
                                "error",
                                serde_json::json!({
                                    "error_code": "INTERNAL_ERROR",
                                    "message": e.to_string(),
                                }),
                            )
                            .await;
                    }
                }
            });
        }
        "load_history" => {
            let adapter = state.platform.webchat_adapter();
            let messages = adapter
                .get_debug_messages(session_type)
                .unwrap_or_default();
            let _ = connection
                .send("history", serde_json::json!({"messages": messages}))
                .await;
        }
        "interrupt" => {
            let (launcher_type, launcher_id) = if session_type == "group" {
                (LauncherType::Group, "webchatgroup")
            } else {
                (LauncherType::Person, "webchatperson")
            };
            let interrupted = state
                .pipelines
                .context()
                .pool
                .interrupt_session(launcher_type, launcher_id);
            let _ = connection
                .send(
                    "interrupted",
                    serde_json::json!({"count": interrupted.len()}),
                )
                .await;
        }
        "ping" => {
            connection.touch_ping();
            let _ = connection.send("pong", serde_json::json!({})).await;
        }
        other => {
            let _ = connection
                .send(
                    "error",
                    serde_json::json!({
                        "error_code": "UNKNOWN_EVENT",
                        "message": format!("unknown event type {other:?}"),
                    }),
                )
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_requires_connect_type() {
        let err = parse_handshake(r#"{"type": "ping"}"#).unwrap_err();
        assert_eq!(err.0, "INVALID_HANDSHAKE");
    }

    #[test]
    fn handshake_validates_session_type() {
        let err = parse_handshake(
            r#"{"type": "connect", "data": {"session_type": "channel", "token": "t"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.0, "INVALID_SESSION_TYPE");
    }

    #[test]
    fn handshake_requires_token() {
        let err = parse_handshake(
            r#"{"type": "connect", "data": {"session_type": "person"}}"#,
        )
        .unwrap_err();
        assert_eq!(err.0, "MISSING_TOKEN");
    }

    #[test]
    fn valid_handshake_parses() {
        let (session_type, token) = parse_handshake(
            r#"{"type": "connect", "data": {"session_type": "group", "token": "tok"}}"#,
        )
        .unwrap();
        assert_eq!(session_type, "group");
        assert_eq!(token, "tok");
    }

    #[test]
    fn malformed_json_is_invalid_handshake() {
        let err = parse_handshake("not json").unwrap_err();
        assert_eq!(err.0, "INVALID_HANDSHAKE");
    }
}
