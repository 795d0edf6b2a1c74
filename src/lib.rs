//! # Arbor
//!
//! Recursive agent orchestration over a relational store.
//!
//! A run starts from one objective. Its root node is planned by an LLM and
//! either executed directly or split into bands of steps; every step becomes
//! a child node handled the same way. Results flow back up as structured
//! envelopes with persisted artifacts.
//!
//! ## Architecture
//!
//! ```text
//!        ┌──────────────────────────────────┐
//!        │          RunController           │
//!        │   (claim, drive, finalize run)   │
//!        └────────────────┬─────────────────┘
//!                         │
//!                         ▼
//!        ┌──────────────────────────────────┐
//!        │         NodeOrchestrator         │
//!        │ planner → bands → aggregator     │
//!        │        └→ executor (+ tools)     │
//!        └───────┬──────────────────┬───────┘
//!                │                  │
//!                ▼                  ▼
//!        ┌──────────────┐   ┌──────────────┐
//!        │ StructuredLlm│   │    Store     │
//!        │ (OpenRouter) │   │ (SQLite/mem) │
//!        └──────────────┘   └──────────────┘
//! ```
//!
//! ## Modules
//! - `agents`: run controller, node orchestrator and the three LLM roles
//! - `store`: runs, nodes, plans, artifacts, documents and events
//! - `tools`: closed tool catalog executed against the domain store
//! - `events`: typed event stream for each run
//! - `budget`: wall-clock budget and run metrics
//! - `llm`: structured-output LLM capability

pub mod agents;
pub mod budget;
pub mod config;
pub mod cost;
pub mod events;
pub mod llm;
pub mod store;
pub mod tools;
pub mod util;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::Config;
