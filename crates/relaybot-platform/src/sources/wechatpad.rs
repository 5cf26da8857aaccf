//! WeChat pad-protocol adapter.
//!
//! The pad service pushes every account event over the unified webhook,
//! so the converter carries most of the weight: dropping the bot's own
//! messages and platform system accounts, splitting the group sender
//! prefix out of the body, resolving mentions, fetching CDN images, and
//! wrapping structured subtypes the core does not interpret
//! (mini-programs, transfers, red envelopes, video-channel clips) as
//! `Unknown` so they survive the pipeline untouched.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use regex::Regex;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use relaybot_types::error::{RelayError, Result};
use relaybot_types::event::{Event, Friend, Group, GroupMember, LauncherType};
use relaybot_types::message::{MessageChain, MessageComponent};

use crate::adapter::{
    EventKind, ListenerCallback, ListenerSet, MessagePlatformAdapter, WebhookRequest,
    WebhookResponse,
};

#[derive(Debug, Clone, Deserialize)]
struct AdapterConfig {
    /// Pad service endpoint.
    api_base: String,
    #[serde(default)]
    token: String,
    #[serde(default)]
    app_id: String,
    /// The bot account's wxid.
    wxid: String,
    /// The bot's display name, used for textual mention matching.
    #[serde(default)]
    bot_name: String,
}

/// One pushed platform event, minimally typed; the full payload rides
/// along as `raw` for `source_payload` and `Unknown` wrapping.
#[derive(Debug, Clone)]
pub struct PadEvent {
    bot_wxid: String,
    from_user: String,
    msg_type: i64,
    content: String,
    create_time: i64,
    new_msg_id: i64,
    push_content: String,
    raw: serde_json::Value,
}

impl PadEvent {
    fn parse(value: &serde_json::Value) -> Result<Self> {
        let data = value
            .get("Data")
            .ok_or_else(|| RelayError::Converter("event missing Data".into()))?;
        let string_at = |path: &str| {
            data.pointer(path)
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string()
        };
        Ok(Self {
            bot_wxid: value
                .get("Wxid")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            from_user: string_at("/FromUserName/string"),
            msg_type: data.get("MsgType").and_then(|v| v.as_i64()).unwrap_or(0),
            content: string_at("/Content/string"),
            create_time: data
                .get("CreateTime")
                .and_then(|v| v.as_i64())
                .unwrap_or_default(),
            new_msg_id: data.get("NewMsgId").and_then(|v| v.as_i64()).unwrap_or(0),
            push_content: data
                .get("PushContent")
                .and_then(|v| v.as_str())
                .unwrap_or_default()
                .to_string(),
            raw: value.clone(),
        })
    }

    fn is_group(&self) -> bool {
        self.from_user.ends_with("@chatroom")
    }

    /// Messages from the bot itself and platform system accounts are
    /// dropped before conversion.
    fn should_drop(&self) -> bool {
        self.bot_wxid == self.from_user
            || self.from_user.starts_with("gh_")
            || self.from_user.starts_with("weixin")
    }
}

/// Message converter for the pad protocol.
pub struct WeChatPadConverter {
    config: AdapterConfig,
    http: reqwest::Client,
    sender_prefix: Regex,
    mention_pattern: Regex,
    subtype_pattern: Regex,
}

impl WeChatPadConverter {
    fn new(config: AdapterConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            // Group bodies open with `wxid:` or `user_name:` on line one.
            sender_prefix: Regex::new(r"^[a-zA-Z0-9_\-]{5,20}:").expect("static regex"),
            mention_pattern: Regex::new(r"@\S+").expect("static regex"),
            subtype_pattern: Regex::new(r"<type>(\d+)</type>").expect("static regex"),
        }
    }

    /// Strip the group sender prefix, returning `(body, sender_id_in_prefix)`.
    fn split_sender_prefix(&self, raw_content: &str) -> (String, Option<String>) {
        let mut lines = raw_content.splitn(2, '\n');
        let first = lines.next().unwrap_or_default();
        if let Some(found) = self.sender_prefix.find(first) {
            if found.start() == 0 {
                let sender = first[..found.end()].trim_end_matches(':').to_string();
                let rest = lines.next().unwrap_or("").to_string();
                return (rest, Some(sender));
            }
        }
        (raw_content.to_string(), None)
    }

    /// Text message -> chain, resolving mentions of the bot.
    fn convert_text(&self, event: &PadEvent, body: &str) -> Vec<MessageComponent> {
        let at_string = format!("@{}", self.config.bot_name);
        if !self.config.bot_name.is_empty() && body.contains(&at_string) {
            return vec![
                MessageComponent::at(&self.config.wxid),
                MessageComponent::plain(body.replacen(&at_string, "", 1)),
            ];
        }
        // Renamed bots still get a push notice when mentioned directly.
        if event.push_content.contains("在群聊中@了你") {
            let head = if body.contains("@所有人") {
                MessageComponent::AtAll
            } else {
                MessageComponent::at(&self.config.wxid)
            };
            let stripped = self.mention_pattern.replace_all(body, "").into_owned();
            return vec![head, MessageComponent::plain(stripped)];
        }
        vec![MessageComponent::plain(body)]
    }

    /// Image message -> chain, fetching bytes through the pad CDN API.
    async fn convert_image(&self, image_xml: &str) -> Vec<MessageComponent> {
        if image_xml.is_empty() {
            return vec![MessageComponent::plain("[图片内容为空]")];
        }
        match self.fetch_image_base64(image_xml).await {
            Ok(encoded) => vec![MessageComponent::image_base64(encoded)],
            Err(e) => {
                warn!(error = %e, "image download failed");
                vec![MessageComponent::plain("[图片处理失败]")]
            }
        }
    }

    async fn fetch_image_base64(&self, image_xml: &str) -> Result<String> {
        let response = self
            .http
            .post(format!("{}/message/download_image", self.config.api_base))
            .json(&serde_json::json!({
                "app_id": self.config.app_id,
                "token": self.config.token,
                "xml": image_xml,
            }))
            .send()
            .await
            .map_err(|e| RelayError::Converter(format!("cdn request: {e}")))?;
        if !response.status().is_success() {
            return Err(RelayError::Converter(format!(
                "cdn returned {}",
                response.status()
            )));
        }
        let body: serde_json::Value = response
            .json()
            .await
            .map_err(|e| RelayError::Converter(format!("cdn response: {e}")))?;
        body.pointer("/data/base64")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .ok_or_else(|| RelayError::Converter("cdn response missing image data".into()))
    }

    /// Structured app message (type 49) -> chain.
    ///
    /// Quote subtype 57 becomes a `Quote` + reply text; everything else is
    /// preserved as `Unknown`.
    fn convert_app_message(
        &self,
        event: &PadEvent,
        body: &str,
        sender_id_in_prefix: Option<String>,
    ) -> Vec<MessageComponent> {
        let subtype = self
            .subtype_pattern
            .captures(body)
            .and_then(|c| c.get(1))
            .and_then(|m| m.as_str().parse::<i64>().ok())
            .unwrap_or(0);

        if subtype == 57 {
            let reply_text = extract_tag(body, "title").unwrap_or_default();
            let quoted_text = extract_tag(body, "content").unwrap_or_default();
            let quoted_sender = extract_tag(body, "chatusr").unwrap_or_default();
            return vec![
                MessageComponent::Quote {
                    id: event.new_msg_id,
                    sender_id: quoted_sender,
                    origin: MessageChain::from_text(quoted_text),
                },
                MessageComponent::plain(reply_text),
            ];
        }

        debug!(subtype, "wrapping uninterpreted app message");
        vec![MessageComponent::Unknown {
            raw: event.raw.clone(),
            sender_id_in_prefix,
        }]
    }

    /// Platform event -> canonical chain. Always leads with `Source`.
    pub async fn target2yiri(&self, event: &PadEvent) -> (MessageChain, Option<String>) {
        let (body, sender_id_in_prefix) = if event.is_group() {
            self.split_sender_prefix(&event.content)
        } else {
            (event.content.clone(), None)
        };

        let mut components = vec![MessageComponent::Source {
            id: event.new_msg_id,
            time: event.create_time,
        }];
        components.extend(match event.msg_type {
            1 => self.convert_text(event, &body),
            3 => self.convert_image(&body).await,
            34 => vec![MessageComponent::Voice {
                url: String::new(),
                length: 0,
            }],
            49 => self.convert_app_message(event, &body, sender_id_in_prefix.clone()),
            _ => vec![MessageComponent::Unknown {
                raw: event.raw.clone(),
                sender_id_in_prefix: sender_id_in_prefix.clone(),
            }],
        });

        (MessageChain(components), sender_id_in_prefix)
    }

    /// Canonical chain -> outbound text + image payloads.
    pub fn yiri2target(chain: &MessageChain) -> Vec<serde_json::Value> {
        let mut out = Vec::new();
        for component in chain {
            match component {
                MessageComponent::Plain { text } => {
                    out.push(serde_json::json!({"type": "text", "content": text}));
                }
                MessageComponent::At { target } => {
                    out.push(serde_json::json!({"type": "at", "target": target}));
                }
                MessageComponent::Image { base64: Some(data), .. } => {
                    out.push(serde_json::json!({"type": "image", "base64": data}));
                }
                MessageComponent::Forward { node_list } => {
                    for node in node_list {
                        out.extend(Self::yiri2target(&node.message_chain));
                    }
                }
                MessageComponent::Source { .. } | MessageComponent::Quote { .. } => {}
                other => {
                    warn!(component = ?other, "dropping component unsupported by wechatpad");
                }
            }
        }
        out
    }
}

fn extract_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let start = xml.find(&open)? + open.len();
    let end = xml[start..].find(&close)? + start;
    Some(
        xml[start..end]
            .trim()
            .trim_start_matches("<![CDATA[")
            .trim_end_matches("]]>")
            .to_string(),
    )
}

/// The adapter.
pub struct WeChatPadAdapter {
    config: AdapterConfig,
    converter: WeChatPadConverter,
    http: reqwest::Client,
    listeners: Arc<ListenerSet>,
    bot_uuid: RwLock<String>,
    self_ref: RwLock<Option<std::sync::Weak<WeChatPadAdapter>>>,
}

impl WeChatPadAdapter {
    pub fn from_config(config: &serde_json::Value) -> Result<Arc<Self>> {
        let config: AdapterConfig = serde_json::from_value(config.clone()).map_err(|e| {
            RelayError::ConfigInvalid {
                reason: format!("wechatpad adapter config: {e}"),
            }
        })?;
        let adapter = Arc::new(Self {
            converter: WeChatPadConverter::new(config.clone()),
            config,
            http: reqwest::Client::new(),
            listeners: Arc::new(ListenerSet::new()),
            bot_uuid: RwLock::new(String::new()),
            self_ref: RwLock::new(None),
        });
        *adapter.self_ref.write() = Some(Arc::downgrade(&adapter));
        Ok(adapter)
    }

    async fn dispatch_event(&self, pad_event: PadEvent) -> Result<()> {
        if pad_event.should_drop() {
            debug!(from = %pad_event.from_user, "dropping self/system message");
            return Ok(());
        }

        let (chain, sender_id_in_prefix) = self.converter.target2yiri(&pad_event).await;
        let time = pad_event.create_time;
        let source_payload = pad_event.raw.clone();

        let event = if pad_event.is_group() {
            // The utterance is attributed to the prefix wxid, not the room.
            let sender_id = sender_id_in_prefix.unwrap_or_else(|| pad_event.from_user.clone());
            Event::GroupMessage {
                sender: GroupMember {
                    id: sender_id.clone(),
                    nickname: sender_id,
                    group: Group {
                        id: pad_event.from_user.clone(),
                        name: pad_event.from_user.clone(),
                    },
                },
                message_chain: chain,
                time,
                source_payload,
            }
        } else {
            Event::FriendMessage {
                sender: Friend {
                    id: pad_event.from_user.clone(),
                    nickname: pad_event.from_user.clone(),
                    remark: None,
                },
                message_chain: chain,
                time,
                source_payload,
            }
        };

        let Some(adapter) = self.self_ref.read().as_ref().and_then(std::sync::Weak::upgrade)
        else {
            return Ok(());
        };
        self.listeners
            .dispatch(event, adapter as Arc<dyn MessagePlatformAdapter>)
            .await;
        Ok(())
    }

    async fn post_send(&self, to: &str, payload: &serde_json::Value) -> Result<()> {
        let response = self
            .http
            .post(format!("{}/message/send", self.config.api_base))
            .json(&serde_json::json!({
                "app_id": self.config.app_id,
                "token": self.config.token,
                "to_wxid": to,
                "message": payload,
            }))
            .send()
            .await
            .map_err(|e| RelayError::Other(format!("pad send: {e}")))?;
        if !response.status().is_success() {
            return Err(RelayError::Other(format!(
                "pad send returned {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl MessagePlatformAdapter for WeChatPadAdapter {
    fn adapter_name(&self) -> &'static str {
        "wechatpad"
    }

    async fn send_message(
        &self,
        _target_type: LauncherType,
        target_id: &str,
        chain: MessageChain,
    ) -> Result<()> {
        for payload in WeChatPadConverter::yiri2target(&chain) {
            self.post_send(target_id, &payload).await?;
        }
        Ok(())
    }

    async fn reply_message(
        &self,
        source_event: &Event,
        chain: MessageChain,
        _quote_origin: bool,
    ) -> Result<()> {
        // Replies go to the originating room or contact.
        let target = source_event
            .source_payload()
            .pointer("/Data/FromUserName/string")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .unwrap_or_else(|| {
                let (_, launcher_id) = source_event.launcher();
                launcher_id.to_string()
            });
        self.send_message(LauncherType::Person, &target, chain).await
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
        let event = PadEvent::parse(&payload)?;
        self.dispatch_event(event).await?;
        Ok(WebhookResponse::json(200, serde_json::json!({"ret": 200})))
    }

    async fn run_async(&self, cancel: CancellationToken) -> Result<()> {
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
