//! Orchestration of the node tree: the recursive node driver and the run
//! controller that claims and finalizes runs.

mod node;
mod root;

pub use node::NodeOrchestrator;
pub use root::RunController;
