//! Per-session rate limiting.
//!
//! One stage class serves two instance names: `RequireRateLimitOccupancy`
//! before processing and `ReleaseRateLimitOccupancy` after. Both names
//! resolve to the same instance so they operate on shared window state.
//! Release is idempotent: it continues even when no slot was held.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::debug;

use relaybot_types::error::Result;
use relaybot_types::message::MessageChain;

use crate::context::CoreContext;
use crate::pipeline::entities::StageProcessResult;
use crate::pipeline::stage::PipelineStage;
use crate::query::Query;

/// Fixed notice sent when a request is dropped.
pub const RATE_LIMIT_NOTICE: &str = "请求数超过限速器设定值,已丢弃本消息。";

/// Sliding-window occupancy limiter keyed by session.
pub struct SlidingWindowLimiter {
    window: Duration,
    limit: usize,
    /// Per-session request timestamps, oldest first.
    windows: Mutex<HashMap<String, Vec<Instant>>>,
}

impl SlidingWindowLimiter {
    pub fn new(window_seconds: u64, limit: usize) -> Self {
        Self {
            window: Duration::from_secs(window_seconds),
            limit,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Try to occupy a slot for `session_key`.
    pub fn require_access(&self, session_key: &str) -> bool {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        let timestamps = windows.entry(session_key.to_string()).or_default();
        timestamps.retain(|t| now.duration_since(*t) < self.window);
        if timestamps.len() >= self.limit {
            return false;
        }
        timestamps.push(now);
        true
    }

    /// Release hook, always idempotent.
    ///
    /// Window accounting is kept: a request consumed its slot for the
    /// whole window even when its pipeline finished early. The hook
    /// exists for occupancy-style algorithms and for pruning sessions
    /// whose window has fully expired.
    pub fn release_access(&self, session_key: &str) {
        let now = Instant::now();
        let mut windows = self.windows.lock();
        if let Some(timestamps) = windows.get(session_key) {
            if timestamps.iter().all(|t| now.duration_since(*t) >= self.window) {
                windows.remove(session_key);
            }
        }
    }
}

/// The rate-limit stage.
pub struct RateLimit {
    algo: SlidingWindowLimiter,
}

impl RateLimit {
    pub fn new(pipeline_config: &serde_json::Value) -> Result<Self> {
        let window_seconds = pipeline_config
            .pointer("/trigger/ratelimit/window-length")
            .and_then(|v| v.as_u64())
            .unwrap_or(60);
        let limit = pipeline_config
            .pointer("/trigger/ratelimit/limitation")
            .and_then(|v| v.as_u64())
            .unwrap_or(60) as usize;
        Ok(Self {
            algo: SlidingWindowLimiter::new(window_seconds, limit),
        })
    }

    #[cfg(test)]
    pub fn with_limiter(algo: SlidingWindowLimiter) -> Self {
        Self { algo }
    }
}

#[async_trait]
impl PipelineStage for RateLimit {
    async fn process(
        &self,
        _ctx: &CoreContext,
        query: &mut Query,
        inst_name: &str,
    ) -> Result<StageProcessResult> {
        let session_key = query.session_key();
        match inst_name {
            "RequireRateLimitOccupancy" => {
                if self.algo.require_access(&session_key) {
                    Ok(StageProcessResult::cont())
                } else {
                    debug!(session = %session_key, "rate limit exceeded");
                    Ok(StageProcessResult::interrupt_with_notice(
                        MessageChain::from_text(RATE_LIMIT_NOTICE),
                    ))
                }
            }
            "ReleaseRateLimitOccupancy" => {
                self.algo.release_access(&session_key);
                Ok(StageProcessResult::cont())
            }
            other => {
                debug!(inst_name = other, "rate limit stage ignoring unknown operation");
                Ok(StageProcessResult::cont())
            }
        }
    }
}
