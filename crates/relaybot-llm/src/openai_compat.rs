//! OpenAI-compatible requester implementation.
//!
//! Works with any endpoint speaking the chat-completions / embeddings wire
//! format. The model record carries its own `api_base` and `api_key`, so a
//! single requester instance serves every configured model.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use relaybot_types::error::RequesterError;
use relaybot_types::provider::{
    ContentElement, EmbeddingModel, LlmModel, MessageRole, ProviderMessage, ToolCall, ToolSpec,
};

use crate::requester::{EmbeddingRequester, Requester};
use crate::retry::{self, RetryConfig};

/// Default per-request deadline.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Requester speaking the OpenAI chat-completions wire format.
pub struct OpenAiCompatRequester {
    http: reqwest::Client,
    retry: RetryConfig,
}

impl Default for OpenAiCompatRequester {
    fn default() -> Self {
        Self::new(RetryConfig::default())
    }
}

impl OpenAiCompatRequester {
    pub fn new(retry: RetryConfig) -> Self {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { http, retry }
    }

    fn chat_url(api_base: &str) -> String {
        format!("{}/chat/completions", api_base.trim_end_matches('/'))
    }

    fn embeddings_url(api_base: &str) -> String {
        format!("{}/embeddings", api_base.trim_end_matches('/'))
    }

    /// Map a message to the provider's content shape.
    ///
    /// Text-only messages send a plain string (the widest-supported shape);
    /// multimodal messages send the part-array form.
    fn encode_content(message: &ProviderMessage) -> serde_json::Value {
        let multimodal = message
            .content
            .iter()
            .any(|c| !matches!(c, ContentElement::Text { .. }));
        if !multimodal {
            return serde_json::Value::String(message.plain_text());
        }
        let parts: Vec<serde_json::Value> = message
            .content
            .iter()
            .map(|c| match c {
                ContentElement::Text { text } => {
                    serde_json::json!({"type": "text", "text": text})
                }
                ContentElement::ImageUrl { url } => {
                    serde_json::json!({"type": "image_url", "image_url": {"url": url}})
                }
                ContentElement::ImageBase64 { base64 } => serde_json::json!({
                    "type": "image_url",
                    "image_url": {"url": format!("data:image/jpeg;base64,{base64}")}
                }),
            })
            .collect();
        serde_json::Value::Array(parts)
    }

    fn encode_message(message: &ProviderMessage) -> serde_json::Value {
        let role = match message.role {
            MessageRole::System => "system",
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::Tool => "tool",
        };
        let mut obj = serde_json::json!({
            "role": role,
            "content": Self::encode_content(message),
        });
        if !message.tool_calls.is_empty() {
            obj["tool_calls"] = serde_json::Value::Array(
                message
                    .tool_calls
                    .iter()
                    .map(|tc| {
                        serde_json::json!({
                            "id": tc.id,
                            "type": "function",
                            "function": {
                                "name": tc.name,
                                "arguments": tc.arguments.to_string(),
                            }
                        })
                    })
                    .collect(),
            );
        }
        if let Some(ref id) = message.tool_call_id {
            obj["tool_call_id"] = serde_json::Value::String(id.clone());
        }
        obj
    }

    fn encode_tools(funcs: &[ToolSpec]) -> serde_json::Value {
        serde_json::Value::Array(
            funcs
                .iter()
                .map(|f| {
                    serde_json::json!({
                        "type": "function",
                        "function": {
                            "name": f.name,
                            "description": f.description,
                            "parameters": f.parameters,
                        }
                    })
                })
                .collect(),
        )
    }

    async fn post_json(
        &self,
        url: &str,
        api_key: &str,
        body: &serde_json::Value,
    ) -> Result<serde_json::Value, RequesterError> {
        let mut request = self.http.post(url).json(body);
        if !api_key.is_empty() {
            request = request.bearer_auth(api_key);
        }
        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                RequesterError::Timeout
            } else {
                RequesterError::Network(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            return response
                .json()
                .await
                .map_err(|e| RequesterError::MalformedResponse(e.to_string()));
        }

        let retry_after_ms = response
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
            .map(|secs| secs * 1000);
        let body_text = response.text().await.unwrap_or_default();
        warn!(%status, body = %body_text, "provider request failed");

        Err(match status.as_u16() {
            401 | 403 => RequesterError::Auth(body_text),
            400 | 422 => RequesterError::BadRequest(body_text),
            404 => RequesterError::NotFound(body_text),
            429 => RequesterError::RateLimited { retry_after_ms },
            s => RequesterError::Server {
                status: s,
                message: body_text,
            },
        })
    }
}

#[derive(Deserialize)]
struct ChatCompletionResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: WireMessage,
}

#[derive(Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Vec<WireToolCall>,
}

#[derive(Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Deserialize)]
struct WireFunction {
    name: String,
    arguments: String,
}

#[derive(Deserialize)]
struct EmbeddingsResponse {
    data: Vec<EmbeddingRow>,
}

#[derive(Deserialize)]
struct EmbeddingRow {
    index: usize,
    embedding: Vec<f32>,
}

#[async_trait]
impl Requester for OpenAiCompatRequester {
    async fn invoke_llm(
        &self,
        model: &LlmModel,
        messages: &[ProviderMessage],
        funcs: &[ToolSpec],
        extra_args: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ProviderMessage, RequesterError> {
        let mut body = serde_json::json!({
            "model": model.name,
            "messages": messages.iter().map(Self::encode_message).collect::<Vec<_>>(),
        });
        if !funcs.is_empty() {
            body["tools"] = Self::encode_tools(funcs);
        }
        for (key, value) in extra_args {
            body[key.as_str()] = value.clone();
        }

        let url = Self::chat_url(&model.api_base);
        debug!(model = %model.name, tools = funcs.len(), "invoking llm");

        let raw = retry::with_retry(&self.retry, || {
            self.post_json(&url, &model.api_key, &body)
        })
        .await?;

        let parsed: ChatCompletionResponse = serde_json::from_value(raw)
            .map_err(|e| RequesterError::MalformedResponse(e.to_string()))?;
        let choice = parsed
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| RequesterError::MalformedResponse("empty choices".into()))?;

        let tool_calls = choice
            .message
            .tool_calls
            .into_iter()
            .map(|tc| {
                let arguments = serde_json::from_str(&tc.function.arguments)
                    .unwrap_or(serde_json::Value::String(tc.function.arguments));
                ToolCall {
                    id: tc.id,
                    name: tc.function.name,
                    arguments,
                }
            })
            .collect();

        Ok(ProviderMessage {
            role: MessageRole::Assistant,
            content: vec![ContentElement::from_text(
                choice.message.content.unwrap_or_default(),
            )],
            tool_calls,
            tool_call_id: None,
        })
    }
}

#[async_trait]
impl EmbeddingRequester for OpenAiCompatRequester {
    async fn embed(
        &self,
        model: &EmbeddingModel,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, RequesterError> {
        let body = serde_json::json!({
            "model": model.name,
            "input": texts,
        });
        let url = Self::embeddings_url(&model.api_base);

        let raw = retry::with_retry(&self.retry, || {
            self.post_json(&url, &model.api_key, &body)
        })
        .await?;

        let parsed: EmbeddingsResponse = serde_json::from_value(raw)
            .map_err(|e| RequesterError::MalformedResponse(e.to_string()))?;

        let mut rows = parsed.data;
        rows.sort_by_key(|r| r.index);
        if rows.len() != texts.len() {
            return Err(RequesterError::MalformedResponse(format!(
                "expected {} embeddings, got {}",
                texts.len(),
                rows.len()
            )));
        }
        Ok(rows.into_iter().map(|r| r.embedding).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn model(api_base: &str) -> LlmModel {
        LlmModel {
            uuid: "m1".into(),
            name: "test-model".into(),
            abilities: vec![],
            api_base: api_base.into(),
            api_key: "sk-test".into(),
        }
    }

    #[test]
    fn text_only_content_is_plain_string() {
        let msg = ProviderMessage::user("hello");
        let encoded = OpenAiCompatRequester::encode_content(&msg);
        assert_eq!(encoded, serde_json::json!("hello"));
    }

    #[test]
    fn multimodal_content_is_part_array() {
        let msg = ProviderMessage {
            role: MessageRole::User,
            content: vec![
                ContentElement::from_text("describe"),
                ContentElement::ImageBase64 {
                    base64: "aGk=".into(),
                },
            ],
            tool_calls: Vec::new(),
            tool_call_id: None,
        };
        let encoded = OpenAiCompatRequester::encode_content(&msg);
        let parts = encoded.as_array().unwrap();
        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(parts[1]["type"], "image_url");
    }

    #[tokio::test]
    async fn invoke_llm_parses_assistant_message() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "choices": [{"message": {"role": "assistant", "content": "hi back"}}]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let requester = OpenAiCompatRequester::default();
        let reply = requester
            .invoke_llm(
                &model(&format!("{}/v1", server.url())),
                &[ProviderMessage::user("hi")],
                &[],
                &serde_json::Map::new(),
            )
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(reply.plain_text(), "hi back");
        assert!(reply.tool_calls.is_empty());
    }

    #[tokio::test]
    async fn invoke_llm_parses_tool_calls() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "choices": [{"message": {
                        "role": "assistant",
                        "content": null,
                        "tool_calls": [{
                            "id": "call_1",
                            "type": "function",
                            "function": {"name": "lookup", "arguments": "{\"q\": \"rust\"}"}
                        }]
                    }}]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let requester = OpenAiCompatRequester::default();
        let reply = requester
            .invoke_llm(
                &model(&format!("{}/v1", server.url())),
                &[ProviderMessage::user("search rust")],
                &[],
                &serde_json::Map::new(),
            )
            .await
            .unwrap();

        assert_eq!(reply.tool_calls.len(), 1);
        assert_eq!(reply.tool_calls[0].name, "lookup");
        assert_eq!(reply.tool_calls[0].arguments["q"], "rust");
    }

    #[tokio::test]
    async fn auth_failure_maps_to_auth_error() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/chat/completions")
            .with_status(401)
            .with_body("bad key")
            .create_async()
            .await;

        let requester = OpenAiCompatRequester::default();
        let err = requester
            .invoke_llm(
                &model(&format!("{}/v1", server.url())),
                &[ProviderMessage::user("hi")],
                &[],
                &serde_json::Map::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RequesterError::Auth(_)));
    }

    #[tokio::test]
    async fn embeddings_preserve_input_order() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/v1/embeddings")
            .with_status(200)
            .with_body(
                serde_json::json!({
                    "data": [
                        {"index": 1, "embedding": [0.0, 1.0]},
                        {"index": 0, "embedding": [1.0, 0.0]}
                    ]
                })
                .to_string(),
            )
            .create_async()
            .await;

        let requester = OpenAiCompatRequester::default();
        let embedding_model = EmbeddingModel {
            uuid: "e1".into(),
            name: "embed-test".into(),
            api_base: format!("{}/v1", server.url()),
            api_key: String::new(),
            dimension: 2,
        };
        let vectors = requester
            .embed(&embedding_model, &["a".into(), "b".into()])
            .await
            .unwrap();
        assert_eq!(vectors[0], vec![1.0, 0.0]);
        assert_eq!(vectors[1], vec![0.0, 1.0]);
    }
}
