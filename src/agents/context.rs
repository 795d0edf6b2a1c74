//! Run context - shared state across the node tree of one run.

use std::sync::Arc;

use serde_json::Value;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::types::OrchestratorError;
use crate::budget::{MetricsRecorder, WallClockBudget};
use crate::config::OrchestratorConfig;
use crate::events::{EventKind, EventLog};
use crate::llm::{LlmRequest, StructuredLlm};
use crate::store::{Node, NodeStatus, RoleState, Run, Store};
use crate::tools::ToolExecutionContext;

/// Shared context passed to every node of a run.
///
/// # Thread Safety
/// Borrowed by every in-flight child of a band. Components that mutate
/// (metrics, allowed projects) use interior locking.
pub struct RunContext {
    /// Run snapshot taken when the run was claimed
    pub run: Run,

    /// Project that receives scratchpads and document artifacts
    pub workspace_id: Uuid,

    pub store: Arc<dyn Store>,

    pub llm: Arc<dyn StructuredLlm>,

    pub tools: Arc<ToolExecutionContext>,

    pub events: EventLog,

    pub metrics: Arc<MetricsRecorder>,

    pub budget: WallClockBudget,

    /// Cooperative cancellation, checked where the budget is checked
    pub cancel_token: CancellationToken,

    pub config: OrchestratorConfig,
}

impl RunContext {
    pub fn run_id(&self) -> Uuid {
        self.run.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel_token.is_cancelled()
    }

    /// Fail when the run was canceled or ran out of wall-clock time.
    pub fn check_budget(&self) -> Result<(), OrchestratorError> {
        if self.is_cancelled() {
            return Err(OrchestratorError::Canceled);
        }
        self.budget.check()?;
        Ok(())
    }

    /// One structured call; usage is folded into run metrics before returning.
    pub async fn call_llm(&self, request: &LlmRequest) -> Result<Value, OrchestratorError> {
        tracing::debug!(
            run_id = %self.run.id,
            role = %request.role,
            schema = request.schema_name,
            "LLM call"
        );
        let response = self
            .llm
            .call(request)
            .await
            .map_err(OrchestratorError::Llm)?;
        self.metrics
            .record_llm_call(request.role, response.usage.as_ref())
            .await?;
        Ok(response.output)
    }

    /// Persist a node status change and log it.
    pub async fn set_status(
        &self,
        node_id: Uuid,
        status: NodeStatus,
        role_state: RoleState,
    ) -> Result<Node, OrchestratorError> {
        let node = self
            .store
            .update_node_status(node_id, status, role_state)
            .await?;
        self.events
            .emit(EventKind::NodeStatus {
                node_id,
                status,
                role_state,
            })
            .await;
        Ok(node)
    }
}
