//! Shared fixtures for stage tests.

use std::sync::Arc;

use async_trait::async_trait;

use relaybot_llm::Requester;
use relaybot_platform::sources::webchat::WebChatAdapter;
use relaybot_types::error::RequesterError;
use relaybot_types::event::{Event, Friend, Group, GroupMember};
use relaybot_types::message::MessageChain;
use relaybot_types::provider::{LlmModel, ProviderMessage, ToolSpec};

use crate::context::CoreContext;
use crate::query::{Query, QueryPool};

/// Requester that echoes the last user message back, prefixed.
pub struct EchoRequester {
    pub prefix: String,
}

#[async_trait]
impl Requester for EchoRequester {
    async fn invoke_llm(
        &self,
        _model: &LlmModel,
        messages: &[ProviderMessage],
        _funcs: &[ToolSpec],
        _extra_args: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ProviderMessage, RequesterError> {
        let last_user = messages
            .iter()
            .rev()
            .find(|m| m.role == relaybot_types::provider::MessageRole::User)
            .map(|m| m.plain_text())
            .unwrap_or_default();
        Ok(ProviderMessage::assistant(format!(
            "{}{last_user}",
            self.prefix
        )))
    }
}

pub fn test_context() -> CoreContext {
    CoreContext::minimal(
        Arc::new(EchoRequester {
            prefix: String::new(),
        }),
        Arc::new(QueryPool::new(4, 4)),
    )
}

pub fn person_event(sender_id: &str, text: &str) -> Event {
    Event::FriendMessage {
        sender: Friend {
            id: sender_id.into(),
            nickname: format!("user-{sender_id}"),
            remark: None,
        },
        message_chain: MessageChain::from_text(text).with_source(1, 1_700_000_000),
        time: 1_700_000_000,
        source_payload: serde_json::Value::Null,
    }
}

pub fn person_query(sender_id: &str, text: &str) -> Query {
    Query::from_event(
        person_event(sender_id, text),
        Arc::new(WebChatAdapter::new()),
        "bot-test",
        "pipe-test",
        serde_json::json!({}),
    )
}

pub fn group_query(group_id: &str, sender_id: &str, text: &str) -> Query {
    let event = Event::GroupMessage {
        sender: GroupMember {
            id: sender_id.into(),
            nickname: format!("user-{sender_id}"),
            group: Group {
                id: group_id.into(),
                name: format!("group-{group_id}"),
            },
        },
        message_chain: MessageChain::from_text(text).with_source(1, 1_700_000_000),
        time: 1_700_000_000,
        source_payload: serde_json::Value::Null,
    };
    Query::from_event(
        event,
        Arc::new(WebChatAdapter::new()),
        "bot-test",
        "pipe-test",
        serde_json::json!({}),
    )
}
