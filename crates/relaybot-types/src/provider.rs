//! Wire types for remote model providers.
//!
//! Messages exchanged with LLM services use [`ProviderMessage`], whose
//! content is a list of [`ContentElement`]s so multimodal models receive
//! text and images in one turn. Model records ([`LlmModel`],
//! [`EmbeddingModel`]) are materialized config snapshots handed out by the
//! model manager.

use serde::{Deserialize, Serialize};

/// Role of a provider message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    System,
    User,
    Assistant,
    Tool,
}

/// One piece of message content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentElement {
    Text { text: String },
    ImageUrl { url: String },
    ImageBase64 { base64: String },
}

impl ContentElement {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    /// The text of a `Text` element, empty otherwise.
    pub fn text(&self) -> &str {
        match self {
            Self::Text { text } => text,
            _ => "",
        }
    }
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    /// JSON-encoded arguments exactly as the model produced them.
    pub arguments: serde_json::Value,
}

/// A callable tool advertised to the model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    /// JSON schema of the parameters object.
    pub parameters: serde_json::Value,
}

/// A single message in a provider conversation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderMessage {
    pub role: MessageRole,
    pub content: Vec<ContentElement>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    /// Set on `Tool` role messages to reference the originating call.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl ProviderMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::System,
            content: vec![ContentElement::from_text(text)],
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::User,
            content: vec![ContentElement::from_text(text)],
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Assistant,
            content: vec![ContentElement::from_text(text)],
            tool_calls: Vec::new(),
            tool_call_id: None,
        }
    }

    /// A tool-role message carrying the result of `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: MessageRole::Tool,
            content: vec![ContentElement::from_text(text)],
            tool_calls: Vec::new(),
            tool_call_id: Some(tool_call_id.into()),
        }
    }

    /// Concatenated text content.
    pub fn plain_text(&self) -> String {
        self.content.iter().map(ContentElement::text).collect()
    }
}

/// A configured chat model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlmModel {
    pub uuid: String,
    pub name: String,
    /// Advertised abilities, e.g. `"vision"`, `"func_call"`.
    #[serde(default)]
    pub abilities: Vec<String>,
    pub api_base: String,
    #[serde(default)]
    pub api_key: String,
}

impl LlmModel {
    pub fn has_ability(&self, ability: &str) -> bool {
        self.abilities.iter().any(|a| a == ability)
    }
}

/// A configured embedding model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingModel {
    pub uuid: String,
    pub name: String,
    pub api_base: String,
    #[serde(default)]
    pub api_key: String,
    pub dimension: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_text_joins_text_elements() {
        let msg = ProviderMessage {
            role: MessageRole::User,
            content: vec![
                ContentElement::from_text("look at "),
                ContentElement::ImageUrl {
                    url: "https://example.com/x.png".into(),
                },
                ContentElement::from_text("this"),
            ],
            tool_calls: Vec::new(),
            tool_call_id: None,
        };
        assert_eq!(msg.plain_text(), "look at this");
    }

    #[test]
    fn tool_result_references_call() {
        let msg = ProviderMessage::tool_result("call_1", "42");
        assert_eq!(msg.role, MessageRole::Tool);
        assert_eq!(msg.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(msg.plain_text(), "42");
    }

    #[test]
    fn model_abilities() {
        let model = LlmModel {
            uuid: "m1".into(),
            name: "gpt-test".into(),
            abilities: vec!["func_call".into()],
            api_base: "https://api.example.com/v1".into(),
            api_key: String::new(),
        };
        assert!(model.has_ability("func_call"));
        assert!(!model.has_ability("vision"));
    }

    #[test]
    fn role_serializes_lowercase() {
        let json = serde_json::to_string(&MessageRole::Assistant).unwrap();
        assert_eq!(json, "\"assistant\"");
    }
}
