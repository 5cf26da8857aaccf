//! Pipeline runtime: ordered stage execution with `ResultType` control
//! flow, error accounting, lifecycle events, and the bounded-concurrency
//! scheduler.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{error, info, warn};

use relaybot_types::config::PipelineConfig;
use relaybot_types::error::{RelayError, Result};
use relaybot_types::message::MessageChain;

use crate::context::CoreContext;
use crate::pipeline::entities::ResultType;
use crate::pipeline::stage::{PipelineStage as _, StageContainer, StageRegistry};
use crate::query::Query;

/// One loaded pipeline: entity snapshot plus its ordered stage list.
/// Immutable after load; swapping a pipeline is remove-then-reload.
pub struct RuntimePipeline {
    pub entity: PipelineConfig,
    containers: Vec<StageContainer>,
}

impl RuntimePipeline {
    pub fn load(registry: &StageRegistry, entity: PipelineConfig) -> Result<Self> {
        let containers = registry.build_containers(&entity.stages, &entity.config)?;
        Ok(Self { entity, containers })
    }

    /// Whether the pipeline surfaces stage errors to the user.
    fn errors_visible(&self) -> bool {
        !self
            .entity
            .config
            .pointer("/output/misc/hide-exception")
            .and_then(|v| v.as_bool())
            .unwrap_or(false)
    }

    fn container_named<'a>(&'a self, inst_name: &str) -> Option<&'a StageContainer> {
        self.containers.iter().find(|c| c.inst_name == inst_name)
    }

    /// Run the closing stages after an interrupt or error: the paired
    /// rate-limit release (when a grant happened) and, when a notice is
    /// queued, the response stage.
    async fn finish_after_interrupt(
        &self,
        ctx: &CoreContext,
        query: &mut Query,
        require_granted: bool,
        deliver: bool,
    ) {
        if require_granted {
            if let Some(container) = self.container_named("ReleaseRateLimitOccupancy") {
                if let Err(e) = container
                    .stage
                    .process(ctx, query, &container.inst_name)
                    .await
                {
                    warn!(query_id = query.query_id, error = %e, "rate limit release failed");
                }
            }
        }
        if deliver && !query.resp_message_chain.is_empty() {
            if let Some(container) = self.container_named("SendResponseBackStage") {
                if let Err(e) = container
                    .stage
                    .process(ctx, query, &container.inst_name)
                    .await
                {
                    warn!(query_id = query.query_id, error = %e, "notice delivery failed");
                }
            }
        }
    }

    /// Execute the stage list over `query`.
    pub async fn run(&self, ctx: &CoreContext, query: &mut Query) {
        let mut require_granted = false;

        for (index, container) in self.containers.iter().enumerate() {
            // Cooperative cancellation between stages.
            if ctx.pool.is_interrupted(query.query_id) {
                info!(query_id = query.query_id, "query interrupted; dropping without reply");
                self.finish_after_interrupt(ctx, query, require_granted, false)
                    .await;
                return;
            }

            // Lifecycle event: a plugin may take over the remainder.
            if let Some(ref plugin) = ctx.plugin {
                let payload = serde_json::json!({
                    "stage": container.inst_name,
                    "query_id": query.query_id,
                    "pipeline_uuid": self.entity.uuid,
                });
                match plugin.emit_event("pipeline.stage-will-run", payload, None).await {
                    Ok(response) if response.prevented_default => {
                        info!(
                            query_id = query.query_id,
                            stage = %container.inst_name,
                            "plugin prevented default; skipping to response stage"
                        );
                        self.finish_after_interrupt(ctx, query, require_granted, true)
                            .await;
                        return;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(error = %e, "lifecycle event failed; continuing pipeline")
                    }
                }
            }

            let outcome = container
                .stage
                .process(ctx, query, &container.inst_name)
                .await;
            if container.inst_name == "RequireRateLimitOccupancy"
                && matches!(outcome, Ok(ref r) if r.result_type == ResultType::Continue)
            {
                require_granted = true;
            }
            if container.inst_name == "ReleaseRateLimitOccupancy" {
                require_granted = false;
            }

            match outcome {
                Ok(result) => {
                    if let Some(notice) = result.console_notice {
                        info!(query_id = query.query_id, stage = %container.inst_name, %notice);
                    }
                    match result.result_type {
                        ResultType::Continue => {}
                        ResultType::Interrupt => {
                            let deliver = match result.user_notice {
                                Some(notice) => {
                                    query.resp_message_chain = vec![notice];
                                    true
                                }
                                None => false,
                            };
                            self.finish_after_interrupt(ctx, query, require_granted, deliver)
                                .await;
                            return;
                        }
                    }
                }
                Err(RelayError::Cancelled) => {
                    info!(query_id = query.query_id, "query cancelled mid-stage");
                    self.finish_after_interrupt(ctx, query, require_granted, false)
                        .await;
                    return;
                }
                Err(e) => {
                    error!(
                        query_id = query.query_id,
                        stage = %container.inst_name,
                        index,
                        error = %e,
                        "stage raised; terminating pipeline"
                    );
                    let deliver = self.errors_visible();
                    if deliver {
                        query.resp_message_chain =
                            vec![MessageChain::from_text(format!("请求处理失败: {e}"))];
                    } else {
                        query.resp_message_chain.clear();
                    }
                    self.finish_after_interrupt(ctx, query, require_granted, deliver)
                        .await;
                    return;
                }
            }
        }
    }
}

/// Loads pipelines, owns the registry, and schedules query runs.
pub struct PipelineManager {
    pipelines: DashMap<String, Arc<RuntimePipeline>>,
    registry: StageRegistry,
    ctx: Arc<CoreContext>,
}

impl PipelineManager {
    pub fn new(ctx: Arc<CoreContext>) -> Self {
        Self {
            pipelines: DashMap::new(),
            registry: StageRegistry::with_builtin_stages(),
            ctx,
        }
    }

    /// Load (or atomically replace) a pipeline.
    pub fn load_pipeline(&self, entity: PipelineConfig) -> Result<()> {
        let uuid = entity.uuid.clone();
        let pipeline = Arc::new(RuntimePipeline::load(&self.registry, entity)?);
        self.pipelines.insert(uuid.clone(), pipeline);
        info!(pipeline = %uuid, "pipeline loaded");
        Ok(())
    }

    pub fn remove_pipeline(&self, uuid: &str) {
        self.pipelines.remove(uuid);
    }

    pub fn get_pipeline(&self, uuid: &str) -> Option<Arc<RuntimePipeline>> {
        self.pipelines.get(uuid).map(|p| p.clone())
    }

    pub fn default_pipeline(&self) -> Option<Arc<RuntimePipeline>> {
        self.pipelines
            .iter()
            .find(|p| p.entity.is_default)
            .map(|p| p.clone())
            .or_else(|| self.pipelines.iter().next().map(|p| p.clone()))
    }

    pub fn list_pipelines(&self) -> Vec<PipelineConfig> {
        self.pipelines.iter().map(|p| p.entity.clone()).collect()
    }

    pub fn context(&self) -> &Arc<CoreContext> {
        &self.ctx
    }

    /// Register a query and run its pipeline behind the concurrency gate.
    ///
    /// Applies ingress backpressure: when the wait queue is at depth the
    /// call fails with `RateLimited` before the query is registered.
    pub async fn submit(&self, mut query: Query) -> Result<i64> {
        let pipeline = self
            .get_pipeline(&query.pipeline_uuid)
            .ok_or_else(|| RelayError::NotFound(format!("pipeline {}", query.pipeline_uuid)))?;

        let slot = self.ctx.pool.acquire_slot().await?;
        let query_id = self.ctx.pool.add_query(&mut query);
        let ctx = self.ctx.clone();

        tokio::spawn(async move {
            pipeline.run(&ctx, &mut query).await;
            ctx.pool.remove(query_id);
            drop(slot);
        });
        Ok(query_id)
    }
}
