//! Pipeline lifecycle events emitted to the plugin runtime.
//!
//! Between stages the pipeline runtime emits an event; a plugin that
//! "prevents default" causes the remainder of the pipeline to be skipped
//! except the response stage.

use serde::{Deserialize, Serialize};

use relaybot_types::error::Result;

use crate::actions::Action;
use crate::connector::PluginConnector;

/// Outcome of an emitted event after every subscribed plugin ran.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EventResponse {
    /// A plugin suppressed the default behavior for this event.
    #[serde(default)]
    pub prevented_default: bool,
    /// Event-specific data plugins may have attached (e.g. a replacement
    /// prompt from a pre-processing hook).
    #[serde(default)]
    pub data: serde_json::Value,
}

impl PluginConnector {
    /// Emit a named lifecycle event with a payload.
    ///
    /// `include_plugins`, when set, restricts delivery to those plugins.
    pub async fn emit_event(
        &self,
        event_name: &str,
        payload: serde_json::Value,
        include_plugins: Option<Vec<String>>,
    ) -> Result<EventResponse> {
        let mut params = serde_json::json!({
            "event": event_name,
            "payload": payload,
        });
        if let Some(include) = include_plugins {
            params["include_plugins"] = serde_json::json!(include);
        }
        let data = self.call_action(Action::EmitEvent, params).await?;
        Ok(serde_json::from_value(data).unwrap_or_default())
    }
}
