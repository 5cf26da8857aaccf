//! Shared types for the relaybot gateway.
//!
//! This crate holds everything that crosses crate boundaries: the canonical
//! [`MessageChain`](message::MessageChain) model, platform [`Event`](event::Event)s,
//! the application [`config`], the error taxonomy, and the wire types used
//! when talking to LLM providers and RAG engines.

pub mod config;
pub mod env_override;
pub mod error;
pub mod event;
pub mod message;
pub mod provider;
pub mod rag;

pub use error::{RelayError, RequesterError, Result};
