//! HTTP surface of the gateway.
//!
//! One axum router carries the unified webhook dispatcher
//! (`/bots/{uuid}`), the WebChat debug HTTP routes, and the WebSocket
//! debug channel. Platforms authenticate inside their own payloads, so
//! the webhook route itself is unauthenticated; the debug channel
//! validates a user token at its `connect` handshake.

pub mod auth;
pub mod webchat;
pub mod webhooks;
pub mod ws;
pub mod ws_pool;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use relaybot_core::PipelineManager;
use relaybot_platform::PlatformManager;

pub use auth::{StaticTokenValidator, TokenValidator};
pub use ws_pool::WsConnectionPool;

/// Shared state accessible by all handlers.
#[derive(Clone)]
pub struct ApiState {
    pub platform: Arc<PlatformManager>,
    pub pipelines: Arc<PipelineManager>,
    pub ws_pool: Arc<WsConnectionPool>,
    pub auth: Arc<dyn TokenValidator>,
}

/// Build the full router.
pub fn build_router(state: ApiState) -> Router {
    Router::new()
        .route("/bots/{bot_uuid}", get(webhooks::handle_webhook).post(webhooks::handle_webhook))
        .route(
            "/bots/{bot_uuid}/{*path}",
            get(webhooks::handle_webhook_with_path).post(webhooks::handle_webhook_with_path),
        )
        .route(
            "/api/v1/pipelines/{pipeline_uuid}/chat/send",
            post(webchat::send_message),
        )
        .route(
            "/api/v1/pipelines/{pipeline_uuid}/chat/messages/{session_type}",
            get(webchat::get_messages),
        )
        .route(
            "/api/v1/pipelines/{pipeline_uuid}/chat/reset/{session_type}",
            post(webchat::reset_session),
        )
        .route(
            "/api/v1/pipelines/{pipeline_uuid}/chat/ws",
            get(ws::ws_handler),
        )
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
