//! Per-platform adapter implementations.

pub mod qqofficial;
pub mod webchat;
pub mod wechatpad;
