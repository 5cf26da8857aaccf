//! The unified webhook dispatcher.
//!
//! One route, `/bots/{uuid}[/{path}]`, fans every platform callback into
//! the matching bot's adapter. There is no platform auth at this layer;
//! platforms embed their own signatures in the body and the adapter
//! verifies them.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use tracing::error;

use relaybot_platform::{MessagePlatformAdapter as _, WebhookRequest, WebhookResponse};

use crate::ApiState;

pub async fn handle_webhook(
    State(state): State<ApiState>,
    Path(bot_uuid): Path<String>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    dispatch(state, bot_uuid, String::new(), method, headers, query, body).await
}

pub async fn handle_webhook_with_path(
    State(state): State<ApiState>,
    Path((bot_uuid, path)): Path<(String, String)>,
    method: Method,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    body: Bytes,
) -> Response {
    dispatch(state, bot_uuid, path, method, headers, query, body).await
}

fn error_body(status: StatusCode, message: &str) -> Response {
    (
        status,
        axum::Json(serde_json::json!({"error": message})),
    )
        .into_response()
}

async fn dispatch(
    state: ApiState,
    bot_uuid: String,
    path: String,
    method: Method,
    headers: HeaderMap,
    query: HashMap<String, String>,
    body: Bytes,
) -> Response {
    let Some(bot) = state.platform.get_bot_by_uuid(&bot_uuid) else {
        return error_body(StatusCode::NOT_FOUND, "Bot not found");
    };
    if !bot.enable {
        return error_body(StatusCode::FORBIDDEN, "Bot is disabled");
    }
    if !bot.adapter.supports_unified_webhook() {
        return error_body(
            StatusCode::NOT_IMPLEMENTED,
            "Adapter does not support unified webhook",
        );
    }

    let request = WebhookRequest {
        method: method.to_string(),
        path,
        headers: headers
            .iter()
            .filter_map(|(k, v)| Some((k.to_string(), v.to_str().ok()?.to_string())))
            .collect(),
        query,
        body: body.to_vec(),
    };

    let subpath = request.path.clone();
    match bot
        .adapter
        .handle_unified_webhook(&bot_uuid, &subpath, request)
        .await
    {
        Ok(WebhookResponse {
            status,
            content_type,
            body,
        }) => {
            // The adapter's response is returned verbatim.
            let status =
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            (
                status,
                [(axum::http::header::CONTENT_TYPE, content_type)],
                body,
            )
                .into_response()
        }
        Err(e) => {
            error!(bot = %bot_uuid, error = %e, "webhook dispatch error");
            error_body(StatusCode::INTERNAL_SERVER_ERROR, &e.to_string())
        }
    }
}
