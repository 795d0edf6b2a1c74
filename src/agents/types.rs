//! Core types for the orchestration layer.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::budget::DeadlineExceeded;
use crate::events::FailureReason;
use crate::llm::LlmRole;
use crate::store::{ResultEnvelope, RunStatus, StoreError};
use crate::tools::{ContextType, ExecutionContext};

/// Errors that abort a node (and with it the run).
///
/// Tool errors never show up here: they are returned to the LLM as data.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("wall-clock budget exceeded: {elapsed_ms}ms elapsed of {limit_ms}ms")]
    BudgetExceeded { limit_ms: u64, elapsed_ms: u64 },

    #[error("run canceled")]
    Canceled,

    #[error("malformed {role} output: {message}")]
    MalformedOutput { role: LlmRole, message: String },

    #[error("LLM call failed: {0:#}")]
    Llm(anyhow::Error),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("node not found: {0}")]
    NodeNotFound(Uuid),

    #[error("run {run_id} cannot be claimed while {status}")]
    NotClaimable { run_id: Uuid, status: RunStatus },

    #[error("invalid job: {0}")]
    InvalidJob(String),
}

impl OrchestratorError {
    pub fn malformed(role: LlmRole, message: impl Into<String>) -> Self {
        Self::MalformedOutput {
            role,
            message: message.into(),
        }
    }

    /// Terminal run status for a run aborted by this error.
    pub fn run_status(&self) -> RunStatus {
        match self {
            Self::BudgetExceeded { .. } => RunStatus::Stopped,
            Self::Canceled => RunStatus::Canceled,
            _ => RunStatus::Failed,
        }
    }

    pub fn failure_reason(&self) -> FailureReason {
        match self {
            Self::BudgetExceeded { .. } => FailureReason::BudgetExceeded,
            Self::Canceled => FailureReason::Canceled,
            _ => FailureReason::Error,
        }
    }
}

impl From<DeadlineExceeded> for OrchestratorError {
    fn from(e: DeadlineExceeded) -> Self {
        Self::BudgetExceeded {
            limit_ms: e.limit_ms,
            elapsed_ms: e.elapsed_ms,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobBudgets {
    #[serde(default)]
    pub max_wall_clock_ms: Option<u64>,
}

/// Queue payload for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    pub run_id: Uuid,
    pub root_node_id: Uuid,
    pub workspace_project_id: Uuid,
    #[serde(default)]
    pub budgets: JobBudgets,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_type: Option<ContextType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_project_id: Option<Uuid>,
}

impl JobPayload {
    /// Requested context; `project` requires `context_project_id`.
    pub fn execution_context(&self) -> Result<ExecutionContext, OrchestratorError> {
        match (self.context_type, self.context_project_id) {
            (None | Some(ContextType::Global), _) => Ok(ExecutionContext::Global),
            (Some(ContextType::Project), Some(id)) => Ok(ExecutionContext::Project(id)),
            (Some(ContextType::Project), None) => Err(OrchestratorError::InvalidJob(
                "context_type=project requires context_project_id".to_string(),
            )),
        }
    }
}

/// What `process_job` reports back to the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOutcome {
    pub success: bool,
    pub run_id: Uuid,
    /// Terminal status written to the run, if the run was claimed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root_result: Option<ResultEnvelope>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl JobOutcome {
    pub fn success(run_id: Uuid, root_result: ResultEnvelope) -> Self {
        Self {
            success: true,
            run_id,
            status: Some(RunStatus::Completed),
            root_result: Some(root_result),
            message: None,
        }
    }

    pub fn failure(run_id: Uuid, status: Option<RunStatus>, message: impl Into<String>) -> Self {
        Self {
            success: false,
            run_id,
            status,
            root_result: None,
            message: Some(message.into()),
        }
    }
}
