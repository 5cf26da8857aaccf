//! WebChat debug HTTP routes.
//!
//! The send route returns the bot reply synchronously: the WebChat
//! adapter's waiter bridge blocks the request until the pipeline answers
//! or errors.

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use tracing::error;

use relaybot_types::message::MessageChain;

use crate::ApiState;

#[derive(Debug, Deserialize)]
pub struct SendMessageBody {
    #[serde(default = "default_session_type")]
    pub session_type: String,
    #[serde(default)]
    pub message: MessageChain,
}

fn default_session_type() -> String {
    "person".into()
}

fn failure(status: StatusCode, message: impl Into<String>) -> Response {
    (
        status,
        Json(serde_json::json!({"success": false, "error": message.into()})),
    )
        .into_response()
}

fn success(data: serde_json::Value) -> Response {
    (
        StatusCode::OK,
        Json(serde_json::json!({"success": true, "data": data})),
    )
        .into_response()
}

fn validate_session_type(session_type: &str) -> Result<(), Response> {
    if matches!(session_type, "person" | "group") {
        Ok(())
    } else {
        Err(failure(
            StatusCode::BAD_REQUEST,
            "session_type must be person or group",
        ))
    }
}

/// `POST /api/v1/pipelines/{uuid}/chat/send`
pub async fn send_message(
    State(state): State<ApiState>,
    Path(pipeline_uuid): Path<String>,
    Json(body): Json<SendMessageBody>,
) -> Response {
    if let Err(response) = validate_session_type(&body.session_type) {
        return response;
    }
    if body.message.is_empty() {
        return failure(StatusCode::BAD_REQUEST, "message is required");
    }

    let adapter = state.platform.webchat_adapter();
    match adapter
        .send_debug_message(&pipeline_uuid, &body.session_type, body.message)
        .await
    {
        Ok(reply) => success(serde_json::json!({"message": reply})),
        Err(e) => {
            error!(pipeline = %pipeline_uuid, error = %e, "debug send failed");
            failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// `GET /api/v1/pipelines/{uuid}/chat/messages/{session_type}`
pub async fn get_messages(
    State(state): State<ApiState>,
    Path((_pipeline_uuid, session_type)): Path<(String, String)>,
) -> Response {
    if let Err(response) = validate_session_type(&session_type) {
        return response;
    }
    let adapter = state.platform.webchat_adapter();
    match adapter.get_debug_messages(&session_type) {
        Ok(messages) => success(serde_json::json!({"messages": messages})),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}

/// `POST /api/v1/pipelines/{uuid}/chat/reset/{session_type}`
pub async fn reset_session(
    State(state): State<ApiState>,
    Path((_pipeline_uuid, session_type)): Path<(String, String)>,
) -> Response {
    if let Err(response) = validate_session_type(&session_type) {
        return response;
    }
    let adapter = state.platform.webchat_adapter();
    match adapter.reset_debug_session(&session_type) {
        Ok(()) => success(serde_json::json!({"message": "Session reset successfully"})),
        Err(e) => failure(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()),
    }
}
