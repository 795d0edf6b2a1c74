//! Agents module - recursive planning and execution over a node tree.
//!
//! # Roles
//! - **Planner**: decides whether a node executes directly or splits into bands
//! - **Executor**: completes a leaf, optionally through one batch of tool calls
//! - **Aggregator**: merges child results, may request one replan
//!
//! # Design Principles
//! - All durable state lives in the [`Store`](crate::store::Store); a crashed
//!   run can be claimed again and completed nodes are not redone
//! - Tool errors are data for the LLM; only LLM, store, budget and
//!   cancellation errors abort a node
//! - Children of one band run concurrently, bands run strictly in order

mod artifacts;
mod context;
pub mod orchestrator;
pub mod roles;
mod scratchpad;
mod types;

pub use artifacts::{ArtifactDraft, ParentHintDraft, PersistedArtifacts, ResultDraft};
pub use context::RunContext;
pub use orchestrator::{NodeOrchestrator, RunController};
pub use types::{JobBudgets, JobOutcome, JobPayload, OrchestratorError};
