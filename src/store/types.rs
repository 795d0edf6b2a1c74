//! Typed rows persisted by every [`Store`](super::Store) backend.
//!
//! # Invariants
//! - Exactly one node per run has `parent_node_id == None` (the root)
//! - `node.depth == parent.depth + 1`
//! - Node status never leaves a terminal state
//! - Plan versions per node are 1, 2, ... and never reused

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Lifecycle of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Queued,
    Running,
    WaitingOnUser,
    Completed,
    Stopped,
    Canceled,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::WaitingOnUser => "waiting_on_user",
            Self::Completed => "completed",
            Self::Stopped => "stopped",
            Self::Canceled => "canceled",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "queued" => Self::Queued,
            "running" => Self::Running,
            "waiting_on_user" => Self::WaitingOnUser,
            "completed" => Self::Completed,
            "stopped" => Self::Stopped,
            "canceled" => Self::Canceled,
            "failed" => Self::Failed,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Stopped | Self::Canceled | Self::Failed
        )
    }

    /// Whether a worker may claim a run in this status.
    pub fn is_claimable(&self) -> bool {
        matches!(self, Self::Queued | Self::Running)
    }
}

impl std::fmt::Display for RunStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which projects a run may touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunScope {
    Global,
    Project,
    MultiProject,
}

impl RunScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Project => "project",
            Self::MultiProject => "multi_project",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "global" => Self::Global,
            "project" => Self::Project,
            "multi_project" => Self::MultiProject,
            _ => return None,
        })
    }
}

/// Append-only accumulators for one run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub llm_calls: u64,
    pub calls_by_role: BTreeMap<String, u64>,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
    pub tool_calls: u64,
    pub last_model: Option<String>,
    #[serde(default)]
    pub tool_manifest: Vec<String>,
}

/// One end-to-end execution of an objective.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Run {
    pub id: Uuid,
    pub actor_id: Uuid,
    pub objective: String,
    pub status: RunStatus,
    pub root_node_id: Option<Uuid>,
    /// Project that owns the documents a run creates
    pub workspace_id: Uuid,
    pub scope: RunScope,
    pub metrics: RunMetrics,
    /// Error message recorded when the run stops or fails
    pub terminal_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Input for [`Store::create_run`](super::Store::create_run).
#[derive(Debug, Clone)]
pub struct NewRun {
    pub actor_id: Uuid,
    pub objective: String,
    pub workspace_id: Uuid,
    pub scope: RunScope,
}

/// State of a node in the orchestration tree.
///
/// # State Machine
/// ```text
/// planning ─┬─> executing ──────────────┬─> completed
///           └─> delegating ─> aggregating ┤
///                     ^           │       └─> failed
///                     └─ planning <┘ (one replan)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Planning,
    Delegating,
    Executing,
    Waiting,
    Aggregating,
    Completed,
    Failed,
    Blocked,
}

impl NodeStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planning => "planning",
            Self::Delegating => "delegating",
            Self::Executing => "executing",
            Self::Waiting => "waiting",
            Self::Aggregating => "aggregating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "planning" => Self::Planning,
            "delegating" => Self::Delegating,
            "executing" => Self::Executing,
            "waiting" => Self::Waiting,
            "aggregating" => Self::Aggregating,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "blocked" => Self::Blocked,
            _ => return None,
        })
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Transitions a store must accept.
    ///
    /// Re-asserting the current status is allowed; leaving a terminal state is not.
    pub fn can_transition_to(&self, next: NodeStatus) -> bool {
        if *self == next {
            return true;
        }
        !self.is_terminal()
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which role currently drives a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoleState {
    Planner,
    Executor,
}

impl RoleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Executor => "executor",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "planner" => Some(Self::Planner),
            "executor" => Some(Self::Executor),
            _ => None,
        }
    }
}

/// One unit of planning, execution or aggregation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: Uuid,
    pub run_id: Uuid,
    pub parent_node_id: Option<Uuid>,
    pub title: String,
    pub reason: String,
    pub success_criteria: Vec<String>,
    pub depth: u32,
    pub band_index: Option<u32>,
    pub step_index: Option<u32>,
    pub status: NodeStatus,
    pub role_state: RoleState,
    pub scratchpad_doc_id: Option<Uuid>,
    pub result: Option<ResultEnvelope>,
    pub context: Value,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: Option<DateTime<Utc>>,
}

/// Input for [`Store::create_node`](super::Store::create_node).
#[derive(Debug, Clone)]
pub struct NewNode {
    pub run_id: Uuid,
    pub parent_node_id: Option<Uuid>,
    pub title: String,
    pub reason: String,
    pub success_criteria: Vec<String>,
    pub depth: u32,
    pub band_index: Option<u32>,
    pub step_index: Option<u32>,
    pub context: Value,
}

/// A step of a plan band. Becomes one child node when the band runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanStep {
    /// Stable across replans when the step is unchanged
    pub id: String,
    pub title: String,
    pub reason: String,
    pub success_criteria: Vec<String>,
    pub band_index: u32,
    pub step_index: u32,
}

/// A sequential phase of a plan; its steps run in parallel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanBand {
    pub index: u32,
    pub steps: Vec<PlanStep>,
}

/// Versioned plan snapshot attached to a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plan {
    pub id: Uuid,
    pub node_id: Uuid,
    pub version: u32,
    pub bands: Vec<PlanBand>,
    pub created_at: DateTime<Utc>,
}

impl Plan {
    pub fn steps(&self) -> impl Iterator<Item = &PlanStep> {
        self.bands.iter().flat_map(|b| b.steps.iter())
    }
}

/// Kind of a durable output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Document,
    Json,
    Summary,
    Other,
}

impl ArtifactKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Document => "document",
            Self::Json => "json",
            Self::Summary => "summary",
            Self::Other => "other",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Some(match s {
            "document" => Self::Document,
            "json" => Self::Json,
            "summary" => Self::Summary,
            "other" => Self::Other,
            _ => return None,
        })
    }
}

/// A durable output produced by an executor or aggregator.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Artifact {
    pub id: Uuid,
    pub run_id: Uuid,
    pub node_id: Uuid,
    pub kind: ArtifactKind,
    pub label: String,
    pub title: Option<String>,
    /// Set for document artifacts
    pub document_id: Option<Uuid>,
    /// Set for every other kind
    pub payload: Option<Value>,
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
}

/// Input for [`Store::insert_artifact`](super::Store::insert_artifact).
#[derive(Debug, Clone)]
pub struct NewArtifact {
    pub run_id: Uuid,
    pub node_id: Uuid,
    pub kind: ArtifactKind,
    pub label: String,
    pub title: Option<String>,
    pub document_id: Option<Uuid>,
    pub payload: Option<Value>,
    pub is_primary: bool,
}

/// A markdown document owned by a project.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Document {
    pub id: Uuid,
    pub project_id: Uuid,
    pub title: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Whether a node met its success criteria, in the LLM's own words.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuccessAssessment {
    pub met: bool,
    #[serde(default)]
    pub notes: String,
}

/// Structured result of a completed node, consumed by its parent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultEnvelope {
    pub kind: ArtifactKind,
    pub summary: String,
    pub success_assessment: SuccessAssessment,
    pub primary_artifact_id: Option<Uuid>,
    pub artifact_ids: Vec<Uuid>,
    pub document_ids: Vec<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub json_payload: Option<Value>,
    pub scratchpad_doc_id: Option<Uuid>,
    pub scratchpad_tail: String,
}
