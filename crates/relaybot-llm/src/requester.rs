//! The [`Requester`] and [`EmbeddingRequester`] traits.

use async_trait::async_trait;
use tokio::sync::mpsc;

use relaybot_types::error::RequesterError;
use relaybot_types::provider::{EmbeddingModel, LlmModel, ProviderMessage, ToolSpec};

/// One streamed increment of an assistant message.
#[derive(Debug, Clone)]
pub struct StreamDelta {
    /// Text appended by this chunk (may be empty on tool-call chunks).
    pub text: String,
    /// Set on the final chunk, carrying the complete assembled message.
    pub finished: Option<ProviderMessage>,
}

/// A client for a remote chat-completion service.
#[async_trait]
pub trait Requester: Send + Sync {
    /// Execute a chat completion and return the assistant message.
    ///
    /// `funcs` advertises callable tools; `extra_args` is passed through to
    /// the provider request body untouched.
    async fn invoke_llm(
        &self,
        model: &LlmModel,
        messages: &[ProviderMessage],
        funcs: &[ToolSpec],
        extra_args: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<ProviderMessage, RequesterError>;

    /// Execute a chat completion, streaming deltas through a channel.
    ///
    /// The default implementation performs a non-streaming call and emits a
    /// single final delta; providers with native streaming override this.
    async fn invoke_llm_stream(
        &self,
        model: &LlmModel,
        messages: &[ProviderMessage],
        funcs: &[ToolSpec],
        extra_args: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<mpsc::Receiver<Result<StreamDelta, RequesterError>>, RequesterError> {
        let message = self.invoke_llm(model, messages, funcs, extra_args).await?;
        let (tx, rx) = mpsc::channel(1);
        let _ = tx
            .send(Ok(StreamDelta {
                text: message.plain_text(),
                finished: Some(message),
            }))
            .await;
        Ok(rx)
    }
}

/// A client for a remote embedding service.
#[async_trait]
pub trait EmbeddingRequester: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    async fn embed(
        &self,
        model: &EmbeddingModel,
        texts: &[String],
    ) -> Result<Vec<Vec<f32>>, RequesterError>;
}
