//! Query lifecycle, sessions, and the pipeline engine.
//!
//! An inbound [`Event`](relaybot_types::event::Event) becomes a
//! [`Query`](query::Query): the mutable per-request envelope registered in
//! the process-wide [`QueryPool`](query::QueryPool). A
//! [`RuntimePipeline`](pipeline::runtime::RuntimePipeline) walks its
//! ordered stage list over the query, honouring the
//! [`ResultType`](pipeline::entities::ResultType) control flow, the
//! bounded-concurrency scheduler, and cooperative cancellation.

pub mod context;
pub mod host;
pub mod pipeline;
pub mod query;
pub mod session;

pub use context::CoreContext;
pub use host::CoreHostHandler;
pub use pipeline::entities::{ResultType, StageProcessResult};
pub use pipeline::runtime::{PipelineManager, RuntimePipeline};
pub use query::{Query, QueryPool};
pub use session::{Conversation, Session, SessionManager};
