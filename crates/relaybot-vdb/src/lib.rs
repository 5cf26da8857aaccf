//! Vector database layer.
//!
//! A uniform async contract ([`VectorDatabase`]) over heterogeneous vector
//! stores, with capability discovery so retrieval providers can pick the
//! strongest search mode a backend offers. The [`VdbManager`] builds
//! backends from config and exposes normalized high-level operations.

pub mod database;
pub mod manager;
pub mod memory;
pub mod remote;
mod sanitize;

pub use database::{Capability, VdbSearchResults, VectorDatabase};
pub use manager::{NormalizedHit, VdbManager};
pub use memory::MemoryVectorDatabase;
pub use remote::RemoteVectorDatabase;
