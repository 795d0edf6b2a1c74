//! Run storage with pluggable backends.
//!
//! Supports:
//! - `memory`: In-memory storage (non-persistent, for tests and dry runs)
//! - `sqlite`: SQLite database, also backing the domain tool store
//!
//! Every call is "insert then select": the returned row is what the backend
//! now holds. There are no cross-call transactions, so callers must tolerate a
//! multi-step sequence being cut short by a crash.

mod memory;
mod sqlite;
mod types;

pub use memory::InMemoryStore;
pub use sqlite::SqliteStore;
pub use types::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Errors from store backends.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: Uuid },

    #[error("node {node_id} cannot move from {from} to {to}")]
    InvalidTransition {
        node_id: Uuid,
        from: NodeStatus,
        to: NodeStatus,
    },

    #[error("store backend error: {0}")]
    Backend(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Backend(e.to_string())
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<tokio::task::JoinError> for StoreError {
    fn from(e: tokio::task::JoinError) -> Self {
        StoreError::Backend(format!("task join error: {}", e))
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

/// One row of a run's event stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredEvent {
    pub run_id: Uuid,
    /// Strictly increasing within a run, starting at 1
    pub seq: i64,
    pub node_id: Option<Uuid>,
    pub event_type: String,
    pub payload: Value,
    pub created_at: DateTime<Utc>,
}

/// Orchestration store: runs, nodes, plans, artifacts, documents and events.
#[async_trait]
pub trait Store: Send + Sync {
    /// Whether this store persists data across restarts.
    fn is_persistent(&self) -> bool;

    // Runs

    async fn create_run(&self, run: NewRun) -> StoreResult<Run>;

    async fn get_run(&self, id: Uuid) -> StoreResult<Option<Run>>;

    /// Set run status; `message` is kept as the terminal message when given.
    async fn update_run_status(
        &self,
        id: Uuid,
        status: RunStatus,
        message: Option<&str>,
    ) -> StoreResult<Run>;

    async fn set_run_root(&self, id: Uuid, root_node_id: Uuid) -> StoreResult<()>;

    async fn update_run_scope(&self, id: Uuid, scope: RunScope) -> StoreResult<()>;

    async fn update_run_metrics(&self, id: Uuid, metrics: &RunMetrics) -> StoreResult<()>;

    // Nodes

    async fn create_node(&self, node: NewNode) -> StoreResult<Node>;

    async fn get_node(&self, id: Uuid) -> StoreResult<Option<Node>>;

    /// Move a node to `status` under `role`.
    ///
    /// Fails with [`StoreError::InvalidTransition`] when the node is terminal.
    /// Stamps `started_at` on the first update and `ended_at` on terminal ones.
    async fn update_node_status(
        &self,
        id: Uuid,
        status: NodeStatus,
        role: RoleState,
    ) -> StoreResult<Node>;

    async fn set_node_scratchpad(&self, id: Uuid, document_id: Uuid) -> StoreResult<()>;

    async fn set_node_result(&self, id: Uuid, result: &ResultEnvelope) -> StoreResult<()>;

    /// Children of `parent_id` ordered by (band_index, step_index).
    async fn list_children(&self, parent_id: Uuid) -> StoreResult<Vec<Node>>;

    /// Every node of a run, oldest first.
    async fn list_nodes(&self, run_id: Uuid) -> StoreResult<Vec<Node>>;

    // Plans

    async fn latest_plan(&self, node_id: Uuid) -> StoreResult<Option<Plan>>;

    /// Persist a new plan version (previous version + 1, starting at 1).
    async fn insert_plan(&self, node_id: Uuid, bands: Vec<PlanBand>) -> StoreResult<Plan>;

    // Artifacts

    async fn insert_artifact(&self, artifact: NewArtifact) -> StoreResult<Artifact>;

    async fn list_artifacts(&self, node_id: Uuid) -> StoreResult<Vec<Artifact>>;

    // Documents

    async fn create_document(
        &self,
        project_id: Uuid,
        title: &str,
        content: &str,
    ) -> StoreResult<Document>;

    async fn get_document(&self, id: Uuid) -> StoreResult<Option<Document>>;

    async fn update_document_content(&self, id: Uuid, content: &str) -> StoreResult<Document>;

    // Events

    /// Append one event, assigning the next `seq` for the run.
    async fn append_event(
        &self,
        run_id: Uuid,
        node_id: Option<Uuid>,
        event_type: &str,
        payload: Value,
    ) -> StoreResult<StoredEvent>;

    /// Events of a run in `seq` order.
    async fn list_events(&self, run_id: Uuid) -> StoreResult<Vec<StoredEvent>>;
}

/// Enqueue a run with its root node in one go.
///
/// The run starts `queued`; the root sits at depth 0 in `planning`.
pub async fn enqueue_run(store: &dyn Store, run: NewRun) -> StoreResult<(Run, Node)> {
    let title = crate::util::truncate_chars(&run.objective, 120);
    let objective = run.objective.clone();
    let run = store.create_run(run).await?;
    let root = store
        .create_node(NewNode {
            run_id: run.id,
            parent_node_id: None,
            title,
            reason: objective,
            success_criteria: Vec::new(),
            depth: 0,
            band_index: None,
            step_index: None,
            context: Value::Object(Default::default()),
        })
        .await?;
    store.set_run_root(run.id, root.id).await?;
    let run = store
        .get_run(run.id)
        .await?
        .ok_or(StoreError::NotFound {
            entity: "run",
            id: run.id,
        })?;
    Ok((run, root))
}
