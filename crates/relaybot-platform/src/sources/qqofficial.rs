//! QQ official bot adapter (webhook mode).
//!
//! The platform calls back over the unified webhook route. An `op: 13`
//! frame is the callback-validation handshake: the bot secret (repeated
//! to 32 bytes) seeds an Ed25519 keypair which signs
//! `event_ts || plain_token`; the platform expects the hex signature
//! back. `op: 0` frames carry message events which are converted to the
//! canonical model and dispatched to the registered listener.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use base64::Engine as _;
use ed25519_dalek::{Signer, SigningKey};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relaybot_types::error::{RelayError, Result};
use relaybot_types::event::{Event, Friend, Group, GroupMember, LauncherType};
use relaybot_types::message::{MessageChain, MessageComponent};

use crate::adapter::{
    EventKind, ListenerCallback, ListenerSet, MessagePlatformAdapter, WebhookRequest,
    WebhookResponse,
};

/// Private (C2C) message event type.
const EVENT_C2C: &str = "C2C_MESSAGE_CREATE";
/// Group at-message event type.
const EVENT_GROUP_AT: &str = "GROUP_AT_MESSAGE_CREATE";

#[derive(Debug, Clone, Deserialize)]
struct AdapterConfig {
    appid: String,
    secret: String,
    #[allow(dead_code)]
    token: String,
}

/// A parsed platform message event (the `d` payload of an `op: 0` frame).
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QqOfficialEvent {
    #[serde(default)]
    pub event_type: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: String,
    #[serde(default)]
    pub user_openid: String,
    #[serde(default)]
    pub group_openid: String,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Attachment {
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub content_type: String,
}

impl QqOfficialEvent {
    fn from_payload(payload: &serde_json::Value) -> Result<Self> {
        let d = payload
            .get("d")
            .cloned()
            .ok_or_else(|| RelayError::Converter("payload missing 'd'".into()))?;
        let mut event: Self = serde_json::from_value(d.clone())
            .map_err(|e| RelayError::Converter(format!("bad event payload: {e}")))?;
        event.event_type = payload
            .get("t")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        if let Some(id) = d.get("id").and_then(|v| v.as_str()) {
            event.message_id = id.to_string();
        }
        if let Some(openid) = d
            .pointer("/author/user_openid")
            .or_else(|| d.pointer("/author/member_openid"))
            .and_then(|v| v.as_str())
        {
            event.user_openid = openid.to_string();
        }
        Ok(event)
    }

    fn unix_time(&self) -> i64 {
        chrono::DateTime::parse_from_str(&self.timestamp, "%Y-%m-%dT%H:%M:%S%z")
            .map(|t| t.timestamp())
            .unwrap_or_else(|_| chrono::Utc::now().timestamp())
    }
}

/// Build the callback-validation response for an `op: 13` frame.
///
/// The bot secret is repeated until it reaches the Ed25519 seed size and
/// truncated to exactly 32 bytes.
pub fn handle_validation(payload: &serde_json::Value, secret: &str) -> Result<serde_json::Value> {
    let d = payload.get("d").cloned().unwrap_or_default();
    let event_ts = d
        .get("event_ts")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RelayError::Converter("validation missing event_ts".into()))?;
    let plain_token = d
        .get("plain_token")
        .and_then(|v| v.as_str())
        .ok_or_else(|| RelayError::Converter("validation missing plain_token".into()))?;

    let mut seed = secret.as_bytes().to_vec();
    while seed.len() < 32 {
        seed.extend_from_slice(secret.as_bytes());
    }
    seed.truncate(32);
    let seed: [u8; 32] = seed
        .try_into()
        .map_err(|_| RelayError::Converter("bot secret produced no seed bytes".into()))?;

    let key = SigningKey::from_bytes(&seed);
    let message = format!("{event_ts}{plain_token}");
    let signature = key.sign(message.as_bytes());

    Ok(serde_json::json!({
        "plain_token": plain_token,
        "signature": hex_encode(&signature.to_bytes()),
    }))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// HTTP client for the platform's message APIs.
pub struct QqOfficialClient {
    appid: String,
    secret: String,
    http: reqwest::Client,
    auth_base: String,
    api_base: String,
    access_token: Mutex<Option<(String, Instant)>>,
}

impl QqOfficialClient {
    fn new(appid: String, secret: String) -> Self {
        Self {
            appid,
            secret,
            http: reqwest::Client::new(),
            auth_base: "https://bots.qq.com".into(),
            api_base: "https://api.sgroup.qq.com".into(),
            access_token: Mutex::new(None),
        }
    }

    #[cfg(test)]
    fn with_bases(mut self, auth_base: String, api_base: String) -> Self {
        self.auth_base = auth_base;
        self.api_base = api_base;
        self
    }

    async fn access_token(&self) -> Result<String> {
        if let Some((token, expiry)) = self.access_token.lock().clone() {
            if Instant::now() < expiry {
                return Ok(token);
            }
        }

        let response = self
            .http
            .post(format!("{}/app/getAppAccessToken", self.auth_base))
            .json(&serde_json::json!({"appId": self.appid, "clientSecret": self.secret}))
            .send()
            .await
            .map_err(|e| RelayError::Other(format!("access token request: {e}")))?;
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RelayError::Other(format!("access token response: {e}")))?;
        let token = body
            .get("access_token")
            .and_then(|v| v.as_str())
            .ok_or_else(|| RelayError::Other("access token missing in response".into()))?
            .to_string();
        let expires_in = body
            .get("expires_in")
            .and_then(|v| v.as_u64())
            .unwrap_or(7200);
        // Refresh one minute early.
        let expiry = Instant::now() + Duration::from_secs(expires_in.saturating_sub(60));
        *self.access_token.lock() = Some((token.clone(), expiry));
        Ok(token)
    }

    async fn post_message(&self, path: &str, body: serde_json::Value) -> Result<()> {
        let token = self.access_token().await?;
        let response = self
            .http
            .post(format!("{}{path}", self.api_base))
            .header("Authorization", format!("QQBot {token}"))
            .json(&body)
            .send()
            .await
            .map_err(|e| RelayError::Other(format!("send message: {e}")))?;
        if !response.status().is_success() {
            let status = response.status();
            let text = response.text().await.unwrap_or_default();
            return Err(RelayError::Other(format!("send message {status}: {text}")));
        }
        Ok(())
    }

    async fn send_private_text(&self, user_openid: &str, text: &str, reply_msg_id: &str) -> Result<()> {
        self.post_message(
            &format!("/v2/users/{user_openid}/messages"),
            serde_json::json!({"content": text, "msg_type": 0, "msg_id": reply_msg_id}),
        )
        .await
    }

    async fn send_group_text(&self, group_openid: &str, text: &str, reply_msg_id: &str) -> Result<()> {
        self.post_message(
            &format!("/v2/groups/{group_openid}/messages"),
            serde_json::json!({"content": text, "msg_type": 0, "msg_id": reply_msg_id}),
        )
        .await
    }

    /// Fetch an attachment and return it base64-encoded.
    async fn fetch_image_base64(&self, url: &str) -> Result<String> {
        let full = if url.starts_with("http") {
            url.to_string()
        } else {
            format!("https://{url}")
        };
        let bytes = self
            .http
            .get(&full)
            .send()
            .await
            .map_err(|e| RelayError::Converter(format!("fetch image: {e}")))?
            .bytes()
            .await
            .map_err(|e| RelayError::Converter(format!("read image: {e}")))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(bytes))
    }
}

/// Converter pair for the platform.
pub struct QqOfficialConverter;

impl QqOfficialConverter {
    /// Canonical chain -> platform content list. Only text is expressible;
    /// other components are dropped with a warning.
    pub fn yiri2target(chain: &MessageChain) -> Vec<serde_json::Value> {
        let mut content = Vec::new();
        for component in chain {
            match component {
                MessageComponent::Plain { text } => {
                    content.push(serde_json::json!({"type": "text", "content": text}));
                }
                MessageComponent::Source { .. } | MessageComponent::At { .. } => {}
                other => {
                    warn!(component = ?other, "dropping component unsupported by qqofficial");
                }
            }
        }
        content
    }

    /// Platform event -> canonical chain.
    async fn target2yiri(
        event: &QqOfficialEvent,
        client: &QqOfficialClient,
        local_id: i64,
    ) -> MessageChain {
        let mut components = vec![MessageComponent::Source {
            id: local_id,
            time: event.unix_time(),
        }];

        // Group at-messages always mention the bot; surface that as an At
        // head so trigger rules can match it.
        if event.event_type == EVENT_GROUP_AT {
            components.push(MessageComponent::at("bot"));
        }

        for attachment in &event.attachments {
            if !attachment.content_type.starts_with("image/") {
                continue;
            }
            match client.fetch_image_base64(&attachment.url).await {
                Ok(encoded) => components.push(MessageComponent::image_base64(encoded)),
                Err(e) => warn!(url = %attachment.url, error = %e, "image fetch failed"),
            }
        }

        components.push(MessageComponent::plain(event.content.trim()));
        MessageChain(components)
    }
}

/// The adapter.
pub struct QqOfficialAdapter {
    config: AdapterConfig,
    client: Arc<QqOfficialClient>,
    listeners: Arc<ListenerSet>,
    bot_uuid: RwLock<String>,
    local_message_id: AtomicI64,
    self_ref: RwLock<Option<std::sync::Weak<QqOfficialAdapter>>>,
}

impl QqOfficialAdapter {
    pub fn from_config(config: &serde_json::Value) -> Result<Arc<Self>> {
        let config: AdapterConfig = serde_json::from_value(config.clone()).map_err(|e| {
            RelayError::ConfigInvalid {
                reason: format!("qqofficial adapter config: {e}"),
            }
        })?;
        let client = Arc::new(QqOfficialClient::new(
            config.appid.clone(),
            config.secret.clone(),
        ));
        let adapter = Arc::new(Self {
            config,
            client,
            listeners: Arc::new(ListenerSet::new()),
            bot_uuid: RwLock::new(String::new()),
            local_message_id: AtomicI64::new(1),
            self_ref: RwLock::new(None),
        });
        *adapter.self_ref.write() = Some(Arc::downgrade(&adapter));
        Ok(adapter)
    }

    fn arc_self(&self) -> Option<Arc<Self>> {
        self.self_ref.read().as_ref().and_then(std::sync::Weak::upgrade)
    }

    /// Convert an `op: 0` event and hand it to the listener.
    async fn dispatch_event(&self, platform_event: QqOfficialEvent) -> Result<()> {
        let local_id = self.local_message_id.fetch_add(1, Ordering::Relaxed);
        let chain =
            QqOfficialConverter::target2yiri(&platform_event, &self.client, local_id).await;
        let source_payload = serde_json::to_value(serde_json::json!({
            "t": platform_event.event_type,
            "id": platform_event.message_id,
            "user_openid": platform_event.user_openid,
            "group_openid": platform_event.group_openid,
        }))?;

        let event = match platform_event.event_type.as_str() {
            EVENT_C2C => Event::FriendMessage {
                sender: Friend {
                    id: platform_event.user_openid.clone(),
                    nickname: platform_event.user_openid.clone(),
                    remark: None,
                },
                message_chain: chain,
                time: platform_event.unix_time(),
                source_payload,
            },
            EVENT_GROUP_AT => Event::GroupMessage {
                sender: GroupMember {
                    id: platform_event.user_openid.clone(),
                    nickname: platform_event.user_openid.clone(),
                    group: Group {
                        id: platform_event.group_openid.clone(),
                        name: platform_event.group_openid.clone(),
                    },
                },
                message_chain: chain,
                time: platform_event.unix_time(),
                source_payload,
            },
            other => {
                warn!(event_type = %other, "ignoring unhandled event type");
                return Ok(());
            }
        };

        let Some(adapter) = self.arc_self() else {
            return Ok(());
        };
        self.listeners
            .dispatch(event, adapter as Arc<dyn MessagePlatformAdapter>)
            .await;
        Ok(())
    }
}

#[async_trait]
impl MessagePlatformAdapter for QqOfficialAdapter {
    fn adapter_name(&self) -> &'static str {
        "qqofficial"
    }

    async fn send_message(
        &self,
        _target_type: LauncherType,
        _target_id: &str,
        _chain: MessageChain,
    ) -> Result<()> {
        // The platform only accepts replies referencing an inbound msg_id.
        Err(RelayError::Other(
            "qqofficial does not support unsolicited messages".into(),
        ))
    }

    async fn reply_message(
        &self,
        source_event: &Event,
        chain: MessageChain,
        _quote_origin: bool,
    ) -> Result<()> {
        let payload = source_event.source_payload();
        let event_type = payload.get("t").and_then(|v| v.as_str()).unwrap_or_default();
        let msg_id = payload.get("id").and_then(|v| v.as_str()).unwrap_or_default();

        for content in QqOfficialConverter::yiri2target(&chain) {
            let text = content["content"].as_str().unwrap_or_default();
            match event_type {
                EVENT_C2C => {
                    let user = payload
                        .get("user_openid")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    self.client.send_private_text(user, text, msg_id).await?;
                }
                EVENT_GROUP_AT => {
                    let group = payload
                        .get("group_openid")
                        .and_then(|v| v.as_str())
                        .unwrap_or_default();
                    self.client.send_group_text(group, text, msg_id).await?;
                }
                other => {
                    return Err(RelayError::Other(format!(
                        "cannot reply to event type {other:?}"
                    )))
                }
            }
        }
        Ok(())
    }

    fn register_listener(&self, kind: EventKind, callback: ListenerCallback) {
        self.listeners.register(kind, callback);
    }

    fn unregister_listener(&self, kind: EventKind) {
        self.listeners.unregister(kind);
    }

    fn supports_unified_webhook(&self) -> bool {
        true
    }

    async fn handle_unified_webhook(
        &self,
        _bot_uuid: &str,
        _path: &str,
        request: WebhookRequest,
    ) -> Result<WebhookResponse> {
        let payload = match request.json_body() {
            Ok(payload) => payload,
            Err(e) => {
                return Ok(WebhookResponse::json(
                    400,
                    serde_json::json!({"error": e.to_string()}),
                ))
            }
        };

        match payload.get("op").and_then(|v| v.as_i64()) {
            Some(13) => {
                info!("qqofficial callback validation requested");
                match handle_validation(&payload, &self.config.secret) {
                    Ok(response) => Ok(WebhookResponse::json(200, response)),
                    Err(e) => Ok(WebhookResponse::json(
                        400,
                        serde_json::json!({"error": e.to_string()}),
                    )),
                }
            }
            Some(0) => {
                let event = QqOfficialEvent::from_payload(&payload)?;
                self.dispatch_event(event).await?;
                Ok(WebhookResponse::json(
                    200,
                    serde_json::json!({"code": 0, "message": "success"}),
                ))
            }
            _ => Ok(WebhookResponse::json(
                200,
                serde_json::json!({"code": 0, "message": "ignored"}),
            )),
        }
    }

    async fn run_async(&self, cancel: CancellationToken) -> Result<()> {
        // Webhook mode: nothing to poll, just wait for shutdown.
        cancel.cancelled().await;
        Ok(())
    }

    fn set_bot_uuid(&self, uuid: String) {
        *self.bot_uuid.write() = uuid;
    }

    async fn kill(&self) -> Result<()> {
        Ok(())
    }
}
