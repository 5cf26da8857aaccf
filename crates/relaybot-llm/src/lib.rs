//! Requester layer for remote model services.
//!
//! LLM and embedding models are remote HTTP services; this crate wraps
//! them behind the [`Requester`] and [`EmbeddingRequester`] traits so the
//! pipeline never sees provider wire formats. The shipped implementation
//! is [`OpenAiCompatRequester`], which speaks the OpenAI chat-completions
//! and embeddings formats used by most hosted and self-hosted gateways.

pub mod models;
pub mod openai_compat;
pub mod requester;
pub mod retry;

pub use models::ModelManager;
pub use openai_compat::OpenAiCompatRequester;
pub use requester::{EmbeddingRequester, Requester, StreamDelta};
pub use retry::RetryConfig;
