//! Run budgets and run-wide accounting.
//!
//! # Key Concepts
//! - WallClockBudget: run-wide deadline checked at node entry and band boundaries
//! - MetricsRecorder: append-only token/cost accumulator flushed after every LLM call

mod deadline;
mod metrics;

pub use deadline::{DeadlineExceeded, WallClockBudget};
pub use metrics::MetricsRecorder;
