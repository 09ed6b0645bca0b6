//! Multi-agent verification harness for two-way file sync engines.
//!
//! A [`TestAgent`] owns one engine instance on a dedicated worker thread and
//! exposes blocking commands to the test thread. Engine results are routed
//! back to the command that issued them by request tag (see [`Dispatcher`]).
//! Tests describe the tree they expect with a [`Model`] and check it against
//! the local filesystem, the engine's replica tree and the remote tree.

pub mod agent;
pub mod bridge;
pub mod context;
pub mod dispatch;
pub mod error;
pub mod fixtures;
pub mod model;
pub mod quiesce;
pub mod reconcile;
pub mod symmetry;

pub use agent::{Confirm, TestAgent, TransferCounts};
pub use bridge::{CommandFuture, Promise};
pub use context::{EngineFactory, HarnessContext, ReferenceEngineFactory, TagCounter};
pub use dispatch::{Continuation, Dispatcher};
pub use error::HarnessError;
pub use model::{Model, ModelNode};
pub use quiesce::{catchup_agents, wait_on_syncs, wait_on_syncs_with, QuiescenceOptions};
pub use reconcile::{match_tree, MatchPolicy, MatchReport, Mismatch, Observed, Source};
pub use symmetry::{run_symmetry_cases, CaseParams, SymmetryAgents, SymmetrySummary};
