//! In-memory cloud service and a reference two-way sync engine.
//!
//! [`ReferenceEngine`] implements [`twoway_core::SyncEngine`] against a
//! [`MemoryCloud`] shared by every engine in a test, so several agents can
//! sync the same account from different local folders.

mod cloud;
mod engine;
mod planner;
mod replica;
mod scan;

pub use cloud::{AccountTree, CloudNode, MemoryCloud};
pub use engine::{EngineSettings, ReferenceEngine};
pub use replica::{CacheError, EngineCache, ReplicaNode};
