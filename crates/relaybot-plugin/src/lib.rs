//! RPC connector to the external plugin runtime.
//!
//! All plugin logic runs in a separate process; the core exchanges typed
//! verbs with it over one persistent WebSocket. Every call carries a
//! per-verb deadline and cancellation, and incoming requests from the
//! runtime (plugin -> platform verbs) are dispatched to a host handler
//! the application wires in.

pub mod actions;
pub mod connector;
pub mod events;

pub use actions::{Action, ActionFrame};
pub use connector::{HostHandler, NullHostHandler, PluginConnector};
pub use events::EventResponse;
