//! Stage contract and registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use relaybot_types::error::{RelayError, Result};

use crate::context::CoreContext;
use crate::pipeline::entities::StageProcessResult;
use crate::query::Query;

/// A unit of pipeline work.
///
/// The same instance may serve several instance names (`inst_name`);
/// the rate limiter uses this to pair its require/release operations on
/// shared state.
#[async_trait]
pub trait PipelineStage: Send + Sync {
    async fn process(
        &self,
        ctx: &CoreContext,
        query: &mut Query,
        inst_name: &str,
    ) -> Result<StageProcessResult>;
}

/// One entry of a pipeline's ordered stage list.
pub struct StageContainer {
    pub inst_name: String,
    pub stage: Arc<dyn PipelineStage>,
}

impl std::fmt::Debug for StageContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StageContainer")
            .field("inst_name", &self.inst_name)
            .finish_non_exhaustive()
    }
}

/// Stage class constructor: builds an instance for one pipeline from its
/// config snapshot.
pub type StageConstructor =
    Box<dyn Fn(&serde_json::Value) -> Result<Arc<dyn PipelineStage>> + Send + Sync>;

/// Discovers stage classes by instance name.
///
/// Several instance names may map to the same class (the rate limiter's
/// require/release pair); within one pipeline build the class instance is
/// shared so those operations see the same state.
pub struct StageRegistry {
    /// inst_name -> class name.
    names: HashMap<String, String>,
    /// class name -> constructor.
    constructors: HashMap<String, StageConstructor>,
}

impl StageRegistry {
    pub fn empty() -> Self {
        Self {
            names: HashMap::new(),
            constructors: HashMap::new(),
        }
    }

    /// The built-in stage set.
    pub fn with_builtin_stages() -> Self {
        use crate::pipeline::stages;

        let mut registry = Self::empty();
        registry.register(
            "BanSessionCheckStage",
            &["BanSessionCheckStage"],
            Box::new(|config| Ok(Arc::new(stages::bansess::BanSessionCheckStage::new(config)?))),
        );
        registry.register(
            "RateLimit",
            &["RequireRateLimitOccupancy", "ReleaseRateLimitOccupancy"],
            Box::new(|config| Ok(Arc::new(stages::ratelimit::RateLimit::new(config)?))),
        );
        registry.register(
            "GroupRespondRuleCheckStage",
            &["GroupRespondRuleCheckStage"],
            Box::new(|config| {
                Ok(Arc::new(stages::resprule::GroupRespondRuleCheckStage::new(config)?))
            }),
        );
        registry.register(
            "PreProcessor",
            &["PreProcessor"],
            Box::new(|config| Ok(Arc::new(stages::preproc::PreProcessor::new(config)?))),
        );
        registry.register(
            "Process",
            &["Process", "MessageProcessor"],
            Box::new(|config| Ok(Arc::new(stages::process::Process::new(config)?))),
        );
        registry.register(
            "LongTextProcessStage",
            &["LongTextProcessStage"],
            Box::new(|config| Ok(Arc::new(stages::longtext::LongTextProcessStage::new(config)?))),
        );
        registry.register(
            "SendResponseBackStage",
            &["SendResponseBackStage"],
            Box::new(|config| {
                Ok(Arc::new(stages::respback::SendResponseBackStage::new(config)?))
            }),
        );
        registry
    }

    /// Register a stage class under its instance names.
    pub fn register(
        &mut self,
        class_name: impl Into<String>,
        inst_names: &[&str],
        constructor: StageConstructor,
    ) {
        let class_name = class_name.into();
        for inst_name in inst_names {
            self.names.insert((*inst_name).to_string(), class_name.clone());
        }
        self.constructors.insert(class_name, constructor);
    }

    /// Build the ordered containers for one pipeline.
    pub fn build_containers(
        &self,
        stage_order: &[String],
        pipeline_config: &serde_json::Value,
    ) -> Result<Vec<StageContainer>> {
        let mut instances: HashMap<String, Arc<dyn PipelineStage>> = HashMap::new();
        let mut containers = Vec::with_capacity(stage_order.len());
        for inst_name in stage_order {
            let class_name = self.names.get(inst_name).ok_or_else(|| {
                RelayError::ConfigInvalid {
                    reason: format!("unknown pipeline stage {inst_name:?}"),
                }
            })?;
            let stage = match instances.get(class_name) {
                Some(existing) => existing.clone(),
                None => {
                    let constructor = self
                        .constructors
                        .get(class_name)
                        .ok_or_else(|| RelayError::ConfigInvalid {
                            reason: format!("stage class {class_name:?} has no constructor"),
                        })?;
                    let stage = constructor(pipeline_config)?;
                    instances.insert(class_name.clone(), stage.clone());
                    stage
                }
            };
            containers.push(StageContainer {
                inst_name: inst_name.clone(),
                stage,
            });
        }
        Ok(containers)
    }
}
