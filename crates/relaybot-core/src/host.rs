//! Host-side handler for plugin -> platform verbs.
//!
//! The plugin runtime calls back into the platform over the same RPC
//! transport; this handler serves those verbs against the query pool,
//! session manager, and model registry.

use std::sync::Arc;

use async_trait::async_trait;

use relaybot_platform::MessagePlatformAdapter as _;
use relaybot_plugin::HostHandler;
use relaybot_types::error::{RelayError, Result};
use relaybot_types::message::MessageChain;

use relaybot_llm::ModelManager;

use crate::query::{QueryHandle, QueryPool};
use crate::session::SessionManager;

/// Version string reported to plugins.
pub const PLATFORM_VERSION: &str = env!("CARGO_PKG_VERSION");

/// The core-backed host handler.
pub struct CoreHostHandler {
    pool: Arc<QueryPool>,
    sessions: Arc<SessionManager>,
    models: Arc<ModelManager>,
}

impl CoreHostHandler {
    pub fn new(
        pool: Arc<QueryPool>,
        sessions: Arc<SessionManager>,
        models: Arc<ModelManager>,
    ) -> Self {
        Self {
            pool,
            sessions,
            models,
        }
    }

    fn query_handle(&self, params: &serde_json::Value) -> Result<Arc<QueryHandle>> {
        let query_id = params
            .get("query_id")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| RelayError::Plugin("query_id is required".into()))?;
        self.pool
            .get(query_id)
            .ok_or_else(|| RelayError::NotFound(format!("query {query_id}")))
    }
}

#[async_trait]
impl HostHandler for CoreHostHandler {
    async fn handle(&self, verb: &str, params: serde_json::Value) -> Result<serde_json::Value> {
        match verb {
            "get_version" => Ok(serde_json::json!({"version": PLATFORM_VERSION})),

            "get_query_var" => {
                let handle = self.query_handle(&params)?;
                let key = params
                    .get("key")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| RelayError::Plugin("key is required".into()))?;
                let value = handle.variables.lock().get(key).cloned();
                Ok(serde_json::json!({"value": value}))
            }

            "set_query_var" => {
                let handle = self.query_handle(&params)?;
                let key = params
                    .get("key")
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| RelayError::Plugin("key is required".into()))?;
                let value = params.get("value").cloned().unwrap_or(serde_json::Value::Null);
                handle.variables.lock().insert(key.to_string(), value);
                Ok(serde_json::json!({"ok": true}))
            }

            "get_query_vars" => {
                let handle = self.query_handle(&params)?;
                let snapshot = handle.variables.lock().clone();
                Ok(serde_json::json!({"variables": snapshot}))
            }

            "reply_message" => {
                let handle = self.query_handle(&params)?;
                let chain: MessageChain = params
                    .get("message")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()?
                    .ok_or_else(|| RelayError::Plugin("message is required".into()))?;
                let quote_origin = params
                    .get("quote_origin")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                handle
                    .adapter
                    .reply_message(&handle.message_event, chain, quote_origin)
                    .await?;
                Ok(serde_json::json!({"ok": true}))
            }

            "create_new_conversation" => {
                let handle = self.query_handle(&params)?;
                let session = self
                    .sessions
                    .get_session(handle.launcher_type, &handle.launcher_id);
                session.new_conversation().await;
                Ok(serde_json::json!({"ok": true}))
            }

            "get_llm_models" => {
                let models: Vec<serde_json::Value> = self
                    .models
                    .llm_models()
                    .map(|m| {
                        serde_json::json!({
                            "uuid": m.uuid,
                            "name": m.name,
                            "abilities": m.abilities,
                        })
                    })
                    .collect();
                Ok(serde_json::json!({"models": models}))
            }

            other => Err(RelayError::Plugin(format!("unknown host verb {other:?}"))),
        }
    }
}
