//! Application configuration.
//!
//! Config is loaded from a TOML file into a JSON tree, overlaid with
//! environment-variable overrides (see [`crate::env_override`]), and then
//! deserialized into [`AppConfig`]. Keeping the overlay on the tree rather
//! than the structs means overrides follow the file's key layout exactly.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::error::{RelayError, Result};
use crate::provider::{EmbeddingModel, LlmModel};

/// HTTP API listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    5300
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

/// Pipeline concurrency limits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConcurrencyConfig {
    /// Maximum number of pipelines running at once.
    #[serde(default = "default_pipeline_concurrency")]
    pub pipeline: usize,
    /// Queries allowed to wait at the semaphore before ingress sheds load.
    #[serde(default = "default_queue_depth")]
    pub queue_depth: usize,
}

fn default_pipeline_concurrency() -> usize {
    20
}

fn default_queue_depth() -> usize {
    50
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            pipeline: default_pipeline_concurrency(),
            queue_depth: default_queue_depth(),
        }
    }
}

/// Plugin runtime connection settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginConfig {
    #[serde(default)]
    pub enable: bool,
    #[serde(default = "default_runtime_ws_url")]
    pub runtime_ws_url: String,
}

fn default_runtime_ws_url() -> String {
    "ws://localhost:5400/control/ws".into()
}

impl Default for PluginConfig {
    fn default() -> Self {
        Self {
            enable: false,
            runtime_ws_url: default_runtime_ws_url(),
        }
    }
}

/// Object storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_storage_dir")]
    pub base_dir: String,
}

fn default_storage_dir() -> String {
    "data/storage".into()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            base_dir: default_storage_dir(),
        }
    }
}

/// One named vector-database entry in the map-shaped config.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VdbEntry {
    #[serde(rename = "type")]
    pub backend_type: String,
    /// Backend-specific settings, passed through untouched.
    #[serde(flatten)]
    pub settings: serde_json::Map<String, serde_json::Value>,
}

/// The `vdb.databases` key accepts either a list of backend types or a
/// map of named entries.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum VdbDatabases {
    Types(Vec<String>),
    Named(BTreeMap<String, VdbEntry>),
}

/// Vector-database layer configuration.
///
/// Three shapes are accepted:
/// - `vdb.use = "memory"` -- a single default backend;
/// - `vdb.databases = ["memory", "remote"]` -- instantiated by type,
///   instances of the same type shared;
/// - `[vdb.databases.<name>]` tables -- named entries with settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VdbConfig {
    #[serde(rename = "use", default, skip_serializing_if = "Option::is_none")]
    pub use_backend: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub databases: Option<VdbDatabases>,
}

/// A configured bot instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BotConfig {
    pub uuid: String,
    pub name: String,
    #[serde(default = "default_true")]
    pub enable: bool,
    /// Adapter type name, e.g. `"qqofficial"`, `"wechatpad"`, `"webchat"`.
    pub adapter: String,
    /// Adapter-specific settings.
    #[serde(default)]
    pub adapter_config: serde_json::Value,
    /// Pipeline bound to this bot.
    #[serde(default)]
    pub use_pipeline_uuid: Option<String>,
}

fn default_true() -> bool {
    true
}

/// A configured pipeline: a stage order plus its config snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    pub uuid: String,
    pub name: String,
    #[serde(default)]
    pub is_default: bool,
    /// Ordered stage instance names.
    pub stages: Vec<String>,
    /// The materialized config snapshot handed to stages.
    #[serde(default)]
    pub config: serde_json::Value,
}

/// Root application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub concurrency: ConcurrencyConfig,
    #[serde(default)]
    pub plugin: PluginConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub vdb: VdbConfig,
    #[serde(default)]
    pub llm_models: Vec<LlmModel>,
    #[serde(default)]
    pub embedding_models: Vec<EmbeddingModel>,
    #[serde(default)]
    pub bots: Vec<BotConfig>,
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

impl AppConfig {
    /// Parse config from TOML text, applying env overrides on the tree.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let toml_value: toml::Value = toml::from_str(text).map_err(|e| {
            RelayError::ConfigInvalid {
                reason: format!("toml parse error: {e}"),
            }
        })?;
        let mut tree = serde_json::to_value(toml_value)?;
        crate::env_override::apply_env_overrides(&mut tree, std::env::vars());
        serde_json::from_value(tree).map_err(|e| RelayError::ConfigInvalid {
            reason: e.to_string(),
        })
    }

    /// Load config from a TOML file.
    pub fn load(path: &std::path::Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }
}
