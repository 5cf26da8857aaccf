//! Bot registry.
//!
//! Running bots are registered by uuid; the unified webhook dispatcher
//! resolves `/bots/<uuid>` through [`PlatformManager::get_bot_by_uuid`].
//! A WebChat proxy bot is always present for the debug console.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use relaybot_types::config::BotConfig;
use relaybot_types::error::{RelayError, Result};

use crate::adapter::MessagePlatformAdapter;
use crate::sources::webchat::WebChatAdapter;

/// A configured bot bound to its running adapter.
pub struct RuntimeBot {
    pub uuid: String,
    pub name: String,
    pub enable: bool,
    pub adapter: Arc<dyn MessagePlatformAdapter>,
    /// Pipeline bound to this bot; the WebChat bot swaps it per debug send.
    pub use_pipeline_uuid: RwLock<Option<String>>,
}

impl RuntimeBot {
    pub fn pipeline_uuid(&self) -> Option<String> {
        self.use_pipeline_uuid.read().clone()
    }
}

impl std::fmt::Debug for RuntimeBot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeBot")
            .field("uuid", &self.uuid)
            .field("name", &self.name)
            .field("enable", &self.enable)
            .field("use_pipeline_uuid", &self.use_pipeline_uuid)
            .finish_non_exhaustive()
    }
}

/// Factory signature for adapter construction from config.
pub type AdapterFactory =
    Box<dyn Fn(&serde_json::Value) -> Result<Arc<dyn MessagePlatformAdapter>> + Send + Sync>;

/// Registry of running bots.
pub struct PlatformManager {
    bots: DashMap<String, Arc<RuntimeBot>>,
    webchat: Arc<WebChatAdapter>,
    factories: DashMap<String, AdapterFactory>,
}

/// Uuid of the implicit WebChat proxy bot.
pub const WEBCHAT_BOT_UUID: &str = "webchat-debug";

impl Default for PlatformManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformManager {
    pub fn new() -> Self {
        let webchat = Arc::new(WebChatAdapter::new());
        webchat.set_bot_uuid(WEBCHAT_BOT_UUID.to_string());
        let manager = Self {
            bots: DashMap::new(),
            webchat: webchat.clone(),
            factories: DashMap::new(),
        };
        manager.bots.insert(
            WEBCHAT_BOT_UUID.to_string(),
            Arc::new(RuntimeBot {
                uuid: WEBCHAT_BOT_UUID.to_string(),
                name: "webchat".into(),
                enable: true,
                adapter: webchat,
                use_pipeline_uuid: RwLock::new(None),
            }),
        );
        manager.register_builtin_factories();
        manager
    }

    fn register_builtin_factories(&self) {
        self.factories.insert(
            "qqofficial".into(),
            Box::new(|config| {
                let adapter = crate::sources::qqofficial::QqOfficialAdapter::from_config(config)?;
                Ok(adapter as Arc<dyn MessagePlatformAdapter>)
            }),
        );
        self.factories.insert(
            "wechatpad".into(),
            Box::new(|config| {
                let adapter = crate::sources::wechatpad::WeChatPadAdapter::from_config(config)?;
                Ok(adapter as Arc<dyn MessagePlatformAdapter>)
            }),
        );
    }

    /// The always-present WebChat debug adapter.
    pub fn webchat_adapter(&self) -> Arc<WebChatAdapter> {
        self.webchat.clone()
    }

    /// Build and register a bot from config; spawns its run loop.
    pub fn load_bot(&self, config: &BotConfig, cancel: CancellationToken) -> Result<Arc<RuntimeBot>> {
        let factory = self
            .factories
            .get(&config.adapter)
            .ok_or_else(|| RelayError::ConfigInvalid {
                reason: format!("unknown adapter type {:?}", config.adapter),
            })?;
        let adapter = factory(&config.adapter_config)?;
        adapter.set_bot_uuid(config.uuid.clone());

        let bot = Arc::new(RuntimeBot {
            uuid: config.uuid.clone(),
            name: config.name.clone(),
            enable: config.enable,
            adapter: adapter.clone(),
            use_pipeline_uuid: RwLock::new(config.use_pipeline_uuid.clone()),
        });
        self.bots.insert(config.uuid.clone(), bot.clone());
        info!(bot = %config.uuid, adapter = %config.adapter, "bot registered");

        let run_adapter = adapter;
        let bot_uuid = config.uuid.clone();
        tokio::spawn(async move {
            if let Err(e) = run_adapter.run_async(cancel).await {
                warn!(bot = %bot_uuid, error = %e, "adapter run loop exited with error");
            }
        });

        Ok(bot)
    }

    pub fn get_bot_by_uuid(&self, uuid: &str) -> Option<Arc<RuntimeBot>> {
        self.bots.get(uuid).map(|b| b.clone())
    }

    pub fn bots(&self) -> Vec<Arc<RuntimeBot>> {
        self.bots.iter().map(|b| b.clone()).collect()
    }

    /// Remove a bot and stop its adapter.
    pub async fn remove_bot(&self, uuid: &str) -> Result<()> {
        let Some((_, bot)) = self.bots.remove(uuid) else {
            return Err(RelayError::NotFound(format!("bot {uuid}")));
        };
        bot.adapter.kill().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn webchat_bot_always_present() {
        let manager = PlatformManager::new();
        let bot = manager.get_bot_by_uuid(WEBCHAT_BOT_UUID).unwrap();
        assert!(bot.enable);
        assert_eq!(bot.adapter.adapter_name(), "webchat");
    }

    #[test]
    fn unknown_adapter_type_is_config_error() {
        let manager = PlatformManager::new();
        let config = BotConfig {
            uuid: "b1".into(),
            name: "x".into(),
            enable: true,
            adapter: "carrier-pigeon".into(),
            adapter_config: serde_json::Value::Null,
            use_pipeline_uuid: None,
        };
        let err = manager
            .load_bot(&config, CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, RelayError::ConfigInvalid { .. }));
    }

    #[tokio::test]
    async fn load_and_remove_bot() {
        let manager = PlatformManager::new();
        let config = BotConfig {
            uuid: "b1".into(),
            name: "official".into(),
            enable: true,
            adapter: "qqofficial".into(),
            adapter_config: serde_json::json!({
                "appid": "123", "secret": "s", "token": "t"
            }),
            use_pipeline_uuid: Some("p1".into()),
        };
        let bot = manager.load_bot(&config, CancellationToken::new()).unwrap();
        assert_eq!(bot.pipeline_uuid().as_deref(), Some("p1"));
        assert!(manager.get_bot_by_uuid("b1").is_some());

        manager.remove_bot("b1").await.unwrap();
        assert!(manager.get_bot_by_uuid("b1").is_none());
        assert!(manager.remove_bot("b1").await.is_err());
    }
}
