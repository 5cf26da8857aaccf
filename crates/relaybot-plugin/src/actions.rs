//! Verbs exchanged with the plugin runtime.
//!
//! The wire format is newline-free JSON frames:
//!
//! - request: `{"seq": 7, "action": "call_tool", "params": {...}}`
//! - response: `{"seq": 7, "data": {...}}` or `{"seq": 7, "error": "..."}`
//! - stream chunk: `{"seq": 7, "chunk": {...}}`, terminated by
//!   `{"seq": 7, "done": true}`

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Platform -> plugin-runtime verbs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Ping,
    InstallPlugin,
    UpgradePlugin,
    DeletePlugin,
    ListPlugins,
    GetPluginInfo,
    EmitEvent,
    ListTools,
    CallTool,
    ListCommands,
    ExecuteCommand,
    RetrieveKnowledge,
    RagIngestDocument,
    RagRetrieve,
    RagDeleteDocument,
    RagOnKbCreate,
    RagOnKbDelete,
    ListRagEngines,
    GetRagCreationSchema,
    GetRagRetrievalSchema,
    SyncPolymorphicComponentInstances,
}

impl Action {
    /// Wire name of the verb.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ping => "ping",
            Self::InstallPlugin => "install_plugin",
            Self::UpgradePlugin => "upgrade_plugin",
            Self::DeletePlugin => "delete_plugin",
            Self::ListPlugins => "list_plugins",
            Self::GetPluginInfo => "get_plugin_info",
            Self::EmitEvent => "emit_event",
            Self::ListTools => "list_tools",
            Self::CallTool => "call_tool",
            Self::ListCommands => "list_commands",
            Self::ExecuteCommand => "execute_command",
            Self::RetrieveKnowledge => "retrieve_knowledge",
            Self::RagIngestDocument => "rag_ingest_document",
            Self::RagRetrieve => "rag_retrieve",
            Self::RagDeleteDocument => "rag_delete_document",
            Self::RagOnKbCreate => "rag_on_kb_create",
            Self::RagOnKbDelete => "rag_on_kb_delete",
            Self::ListRagEngines => "list_rag_engines",
            Self::GetRagCreationSchema => "get_rag_creation_schema",
            Self::GetRagRetrievalSchema => "get_rag_retrieval_schema",
            Self::SyncPolymorphicComponentInstances => "sync_polymorphic_component_instances",
        }
    }

    /// Per-verb deadline.
    ///
    /// Quick health checks are tight; schema fetches moderate; LLM and
    /// tool calls long; document ingestion longest.
    pub fn timeout(&self) -> Duration {
        match self {
            Self::Ping => Duration::from_secs(10),
            Self::GetRagCreationSchema | Self::GetRagRetrievalSchema => Duration::from_secs(30),
            Self::CallTool | Self::EmitEvent | Self::ExecuteCommand => Duration::from_secs(180),
            Self::RagIngestDocument => Duration::from_secs(300),
            _ => Duration::from_secs(60),
        }
    }
}

/// One frame on the wire, request or response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionFrame {
    pub seq: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub done: Option<bool>,
}

impl ActionFrame {
    pub fn request(seq: u64, action: Action, params: serde_json::Value) -> Self {
        Self {
            seq,
            action: Some(action.as_str().to_string()),
            params: Some(params),
            data: None,
            error: None,
            chunk: None,
            done: None,
        }
    }

    pub fn response(seq: u64, data: serde_json::Value) -> Self {
        Self {
            seq,
            action: None,
            params: None,
            data: Some(data),
            error: None,
            chunk: None,
            done: None,
        }
    }

    pub fn error(seq: u64, message: impl Into<String>) -> Self {
        Self {
            seq,
            action: None,
            params: None,
            data: None,
            error: Some(message.into()),
            chunk: None,
            done: None,
        }
    }
}
