//! WebChat debug adapter.
//!
//! Backs the in-app debug console. Unlike real platforms, the HTTP caller
//! wants the bot's reply in the same request, so `send_debug_message`
//! bridges the asynchronous pipeline with a single-shot waiter keyed by
//! the ingress message id: `reply_message` resolves the waiter, and the
//! waiter entry is removed on resolution or timeout -- every send produces
//! exactly one reply or one error, and the waiter map never leaks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use relaybot_types::error::{RelayError, Result};
use relaybot_types::event::{Event, Friend, Group, GroupMember, LauncherType};
use relaybot_types::message::MessageChain;

use crate::adapter::{
    EventKind, ListenerCallback, ListenerSet, MessagePlatformAdapter, WebhookRequest,
    WebhookResponse,
};

/// How long a debug send waits for the pipeline before giving up.
const REPLY_TIMEOUT: Duration = Duration::from_secs(120);

/// Session key for the private debug session.
pub const PERSON_SESSION: &str = "webchatperson";
/// Session key for the group debug session.
pub const GROUP_SESSION: &str = "webchatgroup";

/// One message in a debug session history.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DebugMessage {
    pub id: i64,
    /// `"user"` or `"bot"`.
    pub kind: String,
    pub content: String,
    pub timestamp: String,
    pub message_chain: MessageChain,
}

/// The WebChat debug adapter.
pub struct WebChatAdapter {
    bot_uuid: RwLock<String>,
    histories: Mutex<HashMap<String, Vec<DebugMessage>>>,
    resp_waiters: Mutex<HashMap<i64, oneshot::Sender<DebugMessage>>>,
    next_message_id: AtomicI64,
    listeners: ListenerSet,
    /// Pipeline selected by the most recent debug send.
    current_pipeline: RwLock<Option<String>>,
}

impl Default for WebChatAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl WebChatAdapter {
    pub fn new() -> Self {
        let histories = HashMap::from([
            (PERSON_SESSION.to_string(), Vec::new()),
            (GROUP_SESSION.to_string(), Vec::new()),
        ]);
        Self {
            bot_uuid: RwLock::new(String::new()),
            histories: Mutex::new(histories),
            resp_waiters: Mutex::new(HashMap::new()),
            next_message_id: AtomicI64::new(1),
            listeners: ListenerSet::new(),
            current_pipeline: RwLock::new(None),
        }
    }

    fn session_key(session_type: &str) -> Result<&'static str> {
        match session_type {
            "person" => Ok(PERSON_SESSION),
            "group" => Ok(GROUP_SESSION),
            other => Err(RelayError::Other(format!(
                "session_type must be person or group, got {other:?}"
            ))),
        }
    }

    fn push_history(&self, session_key: &str, message: DebugMessage) {
        self.histories
            .lock()
            .entry(session_key.to_string())
            .or_default()
            .push(message);
    }

    /// The pipeline chosen by the most recent debug send.
    pub fn current_pipeline_uuid(&self) -> Option<String> {
        self.current_pipeline.read().clone()
    }

    /// Number of unresolved reply waiters (diagnostic / test hook).
    pub fn pending_waiters(&self) -> usize {
        self.resp_waiters.lock().len()
    }

    /// Send a user message into the pipeline and wait for the bot reply.
    pub async fn send_debug_message(
        self: &Arc<Self>,
        pipeline_uuid: &str,
        session_type: &str,
        chain: MessageChain,
    ) -> Result<DebugMessage> {
        let session_key = Self::session_key(session_type)?;
        let message_id = self.next_message_id.fetch_add(1, Ordering::Relaxed);
        let now = chrono::Utc::now();
        let chain = chain.with_source(message_id, now.timestamp());

        self.push_history(
            session_key,
            DebugMessage {
                id: message_id,
                kind: "user".into(),
                content: chain.plain_text(),
                timestamp: now.to_rfc3339(),
                message_chain: chain.clone(),
            },
        );

        *self.current_pipeline.write() = Some(pipeline_uuid.to_string());

        let (event, kind) = if session_type == "person" {
            (
                Event::FriendMessage {
                    sender: Friend {
                        id: PERSON_SESSION.into(),
                        nickname: "调试用户".into(),
                        remark: None,
                    },
                    message_chain: chain,
                    time: now.timestamp(),
                    source_payload: serde_json::Value::Null,
                },
                EventKind::FriendMessage,
            )
        } else {
            (
                Event::GroupMessage {
                    sender: GroupMember {
                        id: PERSON_SESSION.into(),
                        nickname: "调试用户".into(),
                        group: Group {
                            id: GROUP_SESSION.into(),
                            name: "调试群聊".into(),
                        },
                    },
                    message_chain: chain,
                    time: now.timestamp(),
                    source_payload: serde_json::Value::Null,
                },
                EventKind::GroupMessage,
            )
        };

        let Some(listener) = self.listeners.get(kind) else {
            return Err(RelayError::Other("no listener registered for webchat".into()));
        };

        let (tx, rx) = oneshot::channel();
        self.resp_waiters.lock().insert(message_id, tx);

        listener(event, self.clone() as Arc<dyn MessagePlatformAdapter>).await;

        match tokio::time::timeout(REPLY_TIMEOUT, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => {
                self.resp_waiters.lock().remove(&message_id);
                Err(RelayError::Other("pipeline dropped the reply".into()))
            }
            Err(_) => {
                self.resp_waiters.lock().remove(&message_id);
                Err(RelayError::Timeout {
                    operation: format!("webchat reply for message {message_id}"),
                })
            }
        }
    }

    pub fn get_debug_messages(&self, session_type: &str) -> Result<Vec<DebugMessage>> {
        let session_key = Self::session_key(session_type)?;
        Ok(self
            .histories
            .lock()
            .get(session_key)
            .cloned()
            .unwrap_or_default())
    }

    pub fn reset_debug_session(&self, session_type: &str) -> Result<()> {
        let session_key = Self::session_key(session_type)?;
        self.histories.lock().insert(session_key.to_string(), Vec::new());
        info!(session = session_key, "debug session reset");
        Ok(())
    }
}

#[async_trait]
impl MessagePlatformAdapter for WebChatAdapter {
    fn adapter_name(&self) -> &'static str {
        "webchat"
    }

    async fn send_message(
        &self,
        _target_type: LauncherType,
        target_id: &str,
        chain: MessageChain,
    ) -> Result<()> {
        let message = DebugMessage {
            id: self.next_message_id.fetch_add(1, Ordering::Relaxed),
            kind: "bot".into(),
            content: chain.plain_text(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            message_chain: chain,
        };
        self.push_history(target_id, message);
        Ok(())
    }

    async fn reply_message(
        &self,
        source_event: &Event,
        chain: MessageChain,
        _quote_origin: bool,
    ) -> Result<()> {
        let Some((message_id, _)) = source_event.message_chain().source() else {
            return Err(RelayError::Other(
                "webchat reply without source id".into(),
            ));
        };
        let (_, launcher_id) = source_event.launcher();

        let reply = DebugMessage {
            // The reply carries the id allocated at ingress so the HTTP
            // caller can correlate it with its send.
            id: message_id,
            kind: "bot".into(),
            content: chain.plain_text(),
            timestamp: chrono::Utc::now().to_rfc3339(),
            message_chain: chain,
        };
        self.push_history(launcher_id, reply.clone());

        if let Some(waiter) = self.resp_waiters.lock().remove(&message_id) {
            let _ = waiter.send(reply);
        } else {
            debug!(message_id, "webchat reply had no waiter (already resolved)");
        }
        Ok(())
    }

    fn register_listener(&self, kind: EventKind, callback: ListenerCallback) {
        self.listeners.register(kind, callback);
    }

    fn unregister_listener(&self, kind: EventKind) {
        self.listeners.unregister(kind);
    }

    async fn handle_unified_webhook(
        &self,
        _bot_uuid: &str,
        _path: &str,
        _request: WebhookRequest,
    ) -> Result<WebhookResponse> {
        // The debug console talks to the adapter through its own HTTP
        // routes, not the platform webhook.
        Err(RelayError::Other(
            "adapter does not support unified webhook".into(),
        ))
    }

    async fn run_async(&self, cancel: CancellationToken) -> Result<()> {
        info!("webchat debug adapter started");
        cancel.cancelled().await;
        info!("webchat debug adapter stopped");
        Ok(())
    }

    fn set_bot_uuid(&self, uuid: String) {
        *self.bot_uuid.write() = uuid;
    }

    async fn kill(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaybot_types::message::MessageComponent;

    fn echo_listener() -> ListenerCallback {
        Arc::new(|event, adapter| {
            Box::pin(async move {
                let text = format!("{} back", event.message_chain().plain_text());
                let reply = MessageChain::from_text(text);
                // Simulate the pipeline replying asynchronously.
                tokio::spawn(async move {
                    adapter.reply_message(&event, reply, false).await.unwrap();
                });
            })
        })
    }

    #[tokio::test]
    async fn sync_reply_bridge_returns_bot_message() {
        let adapter = Arc::new(WebChatAdapter::new());
        adapter.register_listener(EventKind::FriendMessage, echo_listener());

        let reply = adapter
            .send_debug_message("p1", "person", MessageChain::from_text("hi"))
            .await
            .unwrap();

        assert_eq!(reply.content, "hi back");
        assert_eq!(reply.kind, "bot");
        // The reply id matches the id allocated at ingress.
        let history = adapter.get_debug_messages("person").unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, reply.id);
        // No leaked waiters after resolution.
        assert_eq!(adapter.pending_waiters(), 0);
        assert_eq!(adapter.current_pipeline_uuid().as_deref(), Some("p1"));
    }

    #[tokio::test]
    async fn group_send_builds_group_event() {
        let adapter = Arc::new(WebChatAdapter::new());
        adapter.register_listener(
            EventKind::GroupMessage,
            Arc::new(|event, adapter| {
                Box::pin(async move {
                    let (ty, id) = event.launcher();
                    assert_eq!(ty, LauncherType::Group);
                    assert_eq!(id, GROUP_SESSION);
                    tokio::spawn(async move {
                        adapter
                            .reply_message(&event, MessageChain::from_text("ok"), false)
                            .await
                            .unwrap();
                    });
                })
            }),
        );

        let reply = adapter
            .send_debug_message("p1", "group", MessageChain::from_text("all hands"))
            .await
            .unwrap();
        assert_eq!(reply.content, "ok");
    }

    #[tokio::test]
    async fn user_chain_gets_source_prepended() {
        let adapter = Arc::new(WebChatAdapter::new());
        adapter.register_listener(
            EventKind::FriendMessage,
            Arc::new(|event, adapter| {
                Box::pin(async move {
                    assert!(matches!(
                        event.message_chain().0.first(),
                        Some(MessageComponent::Source { .. })
                    ));
                    tokio::spawn(async move {
                        adapter
                            .reply_message(&event, MessageChain::from_text("seen"), false)
                            .await
                            .unwrap();
                    });
                })
            }),
        );
        adapter
            .send_debug_message("p1", "person", MessageChain::from_text("x"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn invalid_session_type_rejected() {
        let adapter = Arc::new(WebChatAdapter::new());
        let err = adapter
            .send_debug_message("p1", "channel", MessageChain::from_text("x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("person or group"));
    }

    #[tokio::test]
    async fn no_listener_is_an_error_without_leaking_waiters() {
        let adapter = Arc::new(WebChatAdapter::new());
        let err = adapter
            .send_debug_message("p1", "person", MessageChain::from_text("x"))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("no listener"));
        assert_eq!(adapter.pending_waiters(), 0);
    }

    #[tokio::test]
    async fn reset_clears_history() {
        let adapter = Arc::new(WebChatAdapter::new());
        adapter.register_listener(EventKind::FriendMessage, echo_listener());
        adapter
            .send_debug_message("p1", "person", MessageChain::from_text("hi"))
            .await
            .unwrap();
        assert!(!adapter.get_debug_messages("person").unwrap().is_empty());
        adapter.reset_debug_session("person").unwrap();
        assert!(adapter.get_debug_messages("person").unwrap().is_empty());
    }
}
