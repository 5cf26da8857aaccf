//! Platform abstraction layer.
//!
//! Every chat platform is reached through a [`MessagePlatformAdapter`]:
//! the adapter owns the bidirectional conversion between the platform's
//! native payloads and the canonical `MessageChain` / `Event` model, and
//! the outbound send/reply path. Platform types never leak past the
//! converter boundary.
//!
//! The [`PlatformManager`] registers running bots by uuid for the unified
//! webhook dispatcher.

pub mod adapter;
pub mod manager;
pub mod sources;

pub use adapter::{
    EventKind, ListenerCallback, ListenerSet, MessagePlatformAdapter, WebhookRequest,
    WebhookResponse,
};
pub use manager::{PlatformManager, RuntimeBot};
