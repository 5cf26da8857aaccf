//! The [`Query`] envelope and the process-wide [`QueryPool`].

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use relaybot_platform::MessagePlatformAdapter;
use relaybot_types::error::{RelayError, Result};
use relaybot_types::event::{Event, LauncherType};
use relaybot_types::message::MessageChain;
use relaybot_types::provider::ProviderMessage;

use crate::session::Session;

/// Shared string-keyed variable bag.
///
/// The bag is the integration surface for plugins: the RPC host verbs
/// read and write it by `query_id` while the pipeline is running, so it
/// lives behind its own lock rather than inside the run-owned query.
pub type VariableBag = Arc<Mutex<serde_json::Map<String, serde_json::Value>>>;

/// The mutable per-request envelope threaded through the pipeline.
pub struct Query {
    /// Process-wide monotonic id; assigned at pool registration.
    pub query_id: i64,
    pub launcher_type: LauncherType,
    pub launcher_id: String,
    pub sender_id: String,
    /// The originating platform adapter, for replies.
    pub adapter: Arc<dyn MessagePlatformAdapter>,
    pub bot_uuid: String,
    pub message_event: Event,
    /// The user input; may be replaced during preprocessing.
    pub message_chain: MessageChain,
    pub pipeline_uuid: String,
    /// Materialized config snapshot of the pipeline.
    pub pipeline_config: serde_json::Value,
    /// Bound by the preprocessor.
    pub session: Option<Arc<Session>>,
    pub use_llm_model_uuid: Option<String>,
    /// Shared with the pool entry for plugin access.
    pub variables: VariableBag,
    /// Assembled system/context messages.
    pub prompt: Vec<ProviderMessage>,
    /// Conversation messages handed to the model.
    pub messages: Vec<ProviderMessage>,
    /// Assistant messages produced by the run.
    pub resp_messages: Vec<ProviderMessage>,
    /// Reply frames to deliver, one chain each.
    pub resp_message_chain: Vec<MessageChain>,
}

impl Query {
    /// Build a query from an inbound event. The id is assigned by the
    /// pool at registration.
    pub fn from_event(
        event: Event,
        adapter: Arc<dyn MessagePlatformAdapter>,
        bot_uuid: impl Into<String>,
        pipeline_uuid: impl Into<String>,
        pipeline_config: serde_json::Value,
    ) -> Self {
        let (launcher_type, launcher_id) = event.launcher();
        let launcher_id = launcher_id.to_string();
        let sender_id = event.sender_id().to_string();
        let message_chain = event.message_chain().clone();
        Self {
            query_id: 0,
            launcher_type,
            launcher_id,
            sender_id,
            adapter,
            bot_uuid: bot_uuid.into(),
            message_event: event,
            message_chain,
            pipeline_uuid: pipeline_uuid.into(),
            pipeline_config,
            session: None,
            use_llm_model_uuid: None,
            variables: Arc::new(Mutex::new(serde_json::Map::new())),
            prompt: Vec::new(),
            messages: Vec::new(),
            resp_messages: Vec::new(),
            resp_message_chain: Vec::new(),
        }
    }

    /// Session key used by rate limiting and access control:
    /// `"{type}_{id}"`.
    pub fn session_key(&self) -> String {
        format!("{}_{}", self.launcher_type, self.launcher_id)
    }

    pub fn set_variable(&self, key: impl Into<String>, value: serde_json::Value) {
        self.variables.lock().insert(key.into(), value);
    }

    pub fn variable(&self, key: &str) -> Option<serde_json::Value> {
        self.variables.lock().get(key).cloned()
    }

    pub fn variables_snapshot(&self) -> serde_json::Map<String, serde_json::Value> {
        self.variables.lock().clone()
    }
}

/// Pool-side view of a registered query, read by plugin host verbs.
pub struct QueryHandle {
    pub query_id: i64,
    pub launcher_type: LauncherType,
    pub launcher_id: String,
    pub sender_id: String,
    pub variables: VariableBag,
    /// For plugin-initiated replies into the originating chat.
    pub adapter: Arc<dyn MessagePlatformAdapter>,
    pub message_event: Event,
}

/// Permit guard for one running pipeline; dropping releases the slot.
#[derive(Debug)]
pub struct PipelineSlot {
    _permit: OwnedSemaphorePermit,
}

/// Process-wide registry of in-flight queries.
///
/// Single writer at ingress (id assignment + insertion), many readers
/// (plugin verbs). Cancellation is cooperative: `interrupt` marks the id
/// and stages poll `is_interrupted` at natural yield points.
pub struct QueryPool {
    next_id: AtomicI64,
    queries: DashMap<i64, Arc<QueryHandle>>,
    interrupts: DashSet<i64>,
    semaphore: Arc<Semaphore>,
    max_waiting: usize,
    waiting: AtomicUsize,
}

impl QueryPool {
    /// `pipeline_concurrency` caps simultaneously running pipelines;
    /// `queue_depth` bounds how many queries may wait for a slot before
    /// ingress sheds load.
    pub fn new(pipeline_concurrency: usize, queue_depth: usize) -> Self {
        Self {
            next_id: AtomicI64::new(1),
            queries: DashMap::new(),
            interrupts: DashSet::new(),
            semaphore: Arc::new(Semaphore::new(pipeline_concurrency.max(1))),
            max_waiting: queue_depth,
            waiting: AtomicUsize::new(0),
        }
    }

    /// Assign an id and register the query's pool-side handle.
    pub fn add_query(&self, query: &mut Query) -> i64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        query.query_id = id;
        self.queries.insert(
            id,
            Arc::new(QueryHandle {
                query_id: id,
                launcher_type: query.launcher_type,
                launcher_id: query.launcher_id.clone(),
                sender_id: query.sender_id.clone(),
                variables: query.variables.clone(),
                adapter: query.adapter.clone(),
                message_event: query.message_event.clone(),
            }),
        );
        id
    }

    pub fn get(&self, query_id: i64) -> Option<Arc<QueryHandle>> {
        self.queries.get(&query_id).map(|q| q.clone())
    }

    /// Remove a finished query and clear its interrupt flag.
    pub fn remove(&self, query_id: i64) {
        self.queries.remove(&query_id);
        self.interrupts.remove(&query_id);
    }

    pub fn len(&self) -> usize {
        self.queries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
    }

    /// Mark a query for cooperative cancellation.
    pub fn interrupt(&self, query_id: i64) {
        self.interrupts.insert(query_id);
    }

    pub fn is_interrupted(&self, query_id: i64) -> bool {
        self.interrupts.contains(&query_id)
    }

    /// Interrupt every in-flight query of one session. Returns the ids
    /// marked.
    pub fn interrupt_session(
        &self,
        launcher_type: LauncherType,
        launcher_id: &str,
    ) -> Vec<i64> {
        let ids: Vec<i64> = self
            .queries
            .iter()
            .filter(|q| q.launcher_type == launcher_type && q.launcher_id == launcher_id)
            .map(|q| q.query_id)
            .collect();
        for id in &ids {
            self.interrupts.insert(*id);
        }
        ids
    }

    /// Acquire a pipeline slot, waiting if saturated.
    ///
    /// Fails with `RateLimited` (the dispatcher's 429-equivalent) once the
    /// wait queue is at depth.
    pub async fn acquire_slot(&self) -> Result<PipelineSlot> {
        if self.semaphore.available_permits() == 0
            && self.waiting.load(Ordering::SeqCst) >= self.max_waiting
        {
            return Err(RelayError::RateLimited);
        }
        self.waiting.fetch_add(1, Ordering::SeqCst);
        let permit = self.semaphore.clone().acquire_owned().await;
        self.waiting.fetch_sub(1, Ordering::SeqCst);
        let permit = permit.map_err(|_| RelayError::Other("pipeline scheduler closed".into()))?;
        Ok(PipelineSlot { _permit: permit })
    }
}
