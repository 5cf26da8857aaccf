//! Token validation for the debug WebSocket channel.

use async_trait::async_trait;

/// Validates user tokens presented at the WebSocket `connect` handshake.
#[async_trait]
pub trait TokenValidator: Send + Sync {
    /// `Ok(true)` valid, `Ok(false)` rejected, `Err` validation backend
    /// failure.
    async fn validate(&self, token: &str) -> Result<bool, String>;
}

/// Accepts a single configured token; with none configured, accepts any
/// non-empty token (development mode).
pub struct StaticTokenValidator {
    expected: Option<String>,
}

impl StaticTokenValidator {
    pub fn new(expected: Option<String>) -> Self {
        Self { expected }
    }
}

#[async_trait]
impl TokenValidator for StaticTokenValidator {
    async fn validate(&self, token: &str) -> Result<bool, String> {
        match &self.expected {
            Some(expected) => Ok(token == expected),
            None => Ok(!token.is_empty()),
        }
    }
}
