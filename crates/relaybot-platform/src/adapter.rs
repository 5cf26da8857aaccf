//! The adapter contract.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;

use relaybot_types::error::{RelayError, Result};
use relaybot_types::event::{Event, LauncherType};
use relaybot_types::message::MessageChain;

/// Which canonical event a listener subscribes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    FriendMessage,
    GroupMessage,
}

impl EventKind {
    pub fn of(event: &Event) -> Self {
        match event {
            Event::FriendMessage { .. } => Self::FriendMessage,
            Event::GroupMessage { .. } => Self::GroupMessage,
        }
    }
}

/// Callback installed by the pipeline registry, invoked per inbound event.
pub type ListenerCallback =
    Arc<dyn Fn(Event, Arc<dyn MessagePlatformAdapter>) -> BoxFuture<'static, ()> + Send + Sync>;

/// HTTP request shape handed to adapters by the webhook dispatcher.
///
/// Deliberately independent of the HTTP framework so adapters stay
/// testable without a server.
#[derive(Debug, Clone, Default)]
pub struct WebhookRequest {
    pub method: String,
    pub path: String,
    pub headers: HashMap<String, String>,
    pub query: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl WebhookRequest {
    pub fn post_json(value: &serde_json::Value) -> Self {
        Self {
            method: "POST".into(),
            body: value.to_string().into_bytes(),
            ..Default::default()
        }
    }

    pub fn json_body(&self) -> Result<serde_json::Value> {
        serde_json::from_slice(&self.body).map_err(RelayError::Json)
    }
}

/// HTTP response an adapter returns to the platform, verbatim.
#[derive(Debug, Clone)]
pub struct WebhookResponse {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

impl WebhookResponse {
    pub fn json(status: u16, value: serde_json::Value) -> Self {
        Self {
            status,
            content_type: "application/json".into(),
            body: value.to_string(),
        }
    }

    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            content_type: "text/plain".into(),
            body: body.into(),
        }
    }
}

/// The contract every platform adapter implements.
#[async_trait]
pub trait MessagePlatformAdapter: Send + Sync {
    /// Adapter type name, e.g. `"qqofficial"`, `"webchat"`.
    fn adapter_name(&self) -> &'static str;

    /// Outbound initiation toward a person or group.
    async fn send_message(
        &self,
        target_type: LauncherType,
        target_id: &str,
        chain: MessageChain,
    ) -> Result<()>;

    /// Outbound reply preserving the context of `source_event`.
    async fn reply_message(
        &self,
        source_event: &Event,
        chain: MessageChain,
        quote_origin: bool,
    ) -> Result<()>;

    /// Install the pipeline's callback for one event kind.
    fn register_listener(&self, kind: EventKind, callback: ListenerCallback);

    /// Remove the callback for one event kind.
    fn unregister_listener(&self, kind: EventKind);

    /// Whether this adapter participates in the unified webhook route.
    fn supports_unified_webhook(&self) -> bool {
        false
    }

    /// Single entrypoint called by the dispatcher. The adapter parses,
    /// verifies, and fans into its internal handler, returning the HTTP
    /// response the platform expects.
    async fn handle_unified_webhook(
        &self,
        bot_uuid: &str,
        path: &str,
        request: WebhookRequest,
    ) -> Result<WebhookResponse> {
        let _ = (bot_uuid, path, request);
        Err(RelayError::Other(
            "adapter does not support unified webhook".into(),
        ))
    }

    /// Long-running start. Webhook-mode adapters just wait for
    /// cancellation.
    async fn run_async(&self, cancel: CancellationToken) -> Result<()>;

    /// Record the bot uuid (used when generating webhook URLs).
    fn set_bot_uuid(&self, uuid: String);

    async fn kill(&self) -> Result<()>;

    /// Whether outbound replies may be streamed frame by frame.
    fn is_stream_output_supported(&self) -> bool {
        false
    }
}

/// Listener storage shared by adapter implementations.
#[derive(Default)]
pub struct ListenerSet {
    listeners: RwLock<HashMap<EventKind, ListenerCallback>>,
}

impl ListenerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, kind: EventKind, callback: ListenerCallback) {
        self.listeners.write().insert(kind, callback);
    }

    pub fn unregister(&self, kind: EventKind) {
        self.listeners.write().remove(&kind);
    }

    pub fn get(&self, kind: EventKind) -> Option<ListenerCallback> {
        self.listeners.read().get(&kind).cloned()
    }

    /// Invoke the listener matching `event`, if any.
    pub async fn dispatch(&self, event: Event, adapter: Arc<dyn MessagePlatformAdapter>) {
        if let Some(callback) = self.get(EventKind::of(&event)) {
            callback(event, adapter).await;
        }
    }
}
