//! Run event stream.
//!
//! Every state transition, tool call, scratchpad write and terminal outcome is
//! appended to the run's stream as one [`EventKind`]. The stream is the only
//! record observers need to replay a run.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::{ArtifactKind, NodeStatus, RoleState, Store, StoredEvent};

/// How a parent should consume a child's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HintMode {
    ReadDocuments,
    ReadJson,
}

/// Why a node failed, as recorded on `node_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureReason {
    BudgetExceeded,
    Canceled,
    Error,
}

/// A structured event in a run's stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    NodeCreated {
        node_id: Uuid,
        parent_node_id: Option<Uuid>,
        title: String,
        depth: u32,
        band_index: Option<u32>,
        step_index: Option<u32>,
    },
    NodeStatus {
        node_id: Uuid,
        status: NodeStatus,
        role_state: RoleState,
    },
    NodeDelegated {
        node_id: Uuid,
        child_node_id: Uuid,
        step_id: String,
    },
    StepCreated {
        node_id: Uuid,
        plan_version: u32,
        step_id: String,
        title: String,
        band_index: u32,
        step_index: u32,
    },
    ToolCallRequested {
        node_id: Uuid,
        index: usize,
        tool: String,
        args: Value,
    },
    ToolCallResult {
        node_id: Uuid,
        index: usize,
        tool: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
        artifacts: BTreeMap<String, Vec<Uuid>>,
    },
    ScratchpadUpdated {
        node_id: Uuid,
        document_id: Uuid,
        /// Last non-blank line of the document after the append
        tail: String,
    },
    ScratchpadLinked {
        node_id: Uuid,
        document_id: Uuid,
    },
    PlanCreated {
        node_id: Uuid,
        plan_id: Uuid,
        version: u32,
        band_count: usize,
        step_count: usize,
    },
    PlanBandCreated {
        node_id: Uuid,
        plan_version: u32,
        band_index: u32,
        step_ids: Vec<String>,
    },
    ArtifactCreated {
        node_id: Uuid,
        artifact_id: Uuid,
        kind: ArtifactKind,
        label: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        document_id: Option<Uuid>,
        is_primary: bool,
    },
    ParentHint {
        node_id: Uuid,
        parent_node_id: Option<Uuid>,
        mode: HintMode,
        artifact_ids: Vec<Uuid>,
    },
    NodeResult {
        node_id: Uuid,
        kind: ArtifactKind,
        summary: String,
        met: bool,
    },
    NodeCompleted {
        node_id: Uuid,
        depth: u32,
    },
    NodeFailed {
        node_id: Uuid,
        reason: FailureReason,
        error: String,
    },
    ReplanRequested {
        node_id: Uuid,
        reason: String,
        pass: u32,
    },
    ToolsManifest {
        context_type: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        project_id: Option<Uuid>,
        tools: Vec<String>,
    },
    ContextWarning {
        #[serde(skip_serializing_if = "Option::is_none")]
        node_id: Option<Uuid>,
        message: String,
    },
}

impl EventKind {
    pub fn event_type(&self) -> &'static str {
        match self {
            EventKind::NodeCreated { .. } => "node_created",
            EventKind::NodeStatus { .. } => "node_status",
            EventKind::NodeDelegated { .. } => "node_delegated",
            EventKind::StepCreated { .. } => "step_created",
            EventKind::ToolCallRequested { .. } => "tool_call_requested",
            EventKind::ToolCallResult { .. } => "tool_call_result",
            EventKind::ScratchpadUpdated { .. } => "scratchpad_updated",
            EventKind::ScratchpadLinked { .. } => "scratchpad_linked",
            EventKind::PlanCreated { .. } => "plan_created",
            EventKind::PlanBandCreated { .. } => "plan_band_created",
            EventKind::ArtifactCreated { .. } => "artifact_created",
            EventKind::ParentHint { .. } => "parent_hint",
            EventKind::NodeResult { .. } => "node_result",
            EventKind::NodeCompleted { .. } => "node_completed",
            EventKind::NodeFailed { .. } => "node_failed",
            EventKind::ReplanRequested { .. } => "replan_requested",
            EventKind::ToolsManifest { .. } => "tools_manifest",
            EventKind::ContextWarning { .. } => "context_warning",
        }
    }

    /// Node the event is about, if any.
    pub fn node_id(&self) -> Option<Uuid> {
        match self {
            EventKind::NodeCreated { node_id, .. }
            | EventKind::NodeStatus { node_id, .. }
            | EventKind::NodeDelegated { node_id, .. }
            | EventKind::StepCreated { node_id, .. }
            | EventKind::ToolCallRequested { node_id, .. }
            | EventKind::ToolCallResult { node_id, .. }
            | EventKind::ScratchpadUpdated { node_id, .. }
            | EventKind::ScratchpadLinked { node_id, .. }
            | EventKind::PlanCreated { node_id, .. }
            | EventKind::PlanBandCreated { node_id, .. }
            | EventKind::ArtifactCreated { node_id, .. }
            | EventKind::ParentHint { node_id, .. }
            | EventKind::NodeResult { node_id, .. }
            | EventKind::NodeCompleted { node_id, .. }
            | EventKind::NodeFailed { node_id, .. }
            | EventKind::ReplanRequested { node_id, .. } => Some(*node_id),
            EventKind::ContextWarning { node_id, .. } => *node_id,
            EventKind::ToolsManifest { .. } => None,
        }
    }

    /// Decode a stored row back into its typed form.
    pub fn from_stored(event: &StoredEvent) -> Option<Self> {
        serde_json::from_value(event.payload.clone()).ok()
    }
}

/// Append-only writer for one run's stream.
///
/// Writes are fire-and-forget relative to control flow: a failed append is
/// logged and swallowed so orchestration carries on.
#[derive(Clone)]
pub struct EventLog {
    store: Arc<dyn Store>,
    run_id: Uuid,
}

impl EventLog {
    pub fn new(store: Arc<dyn Store>, run_id: Uuid) -> Self {
        Self { store, run_id }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Append `event`; returns its `seq` when the write succeeded.
    pub async fn emit(&self, event: EventKind) -> Option<i64> {
        let event_type = event.event_type();
        let payload = match serde_json::to_value(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, event_type, "Failed to encode event: {}", e);
                return None;
            }
        };
        match self
            .store
            .append_event(self.run_id, event.node_id(), event_type, payload)
            .await
        {
            Ok(stored) => Some(stored.seq),
            Err(e) => {
                tracing::warn!(run_id = %self.run_id, event_type, "Failed to append event: {}", e);
                None
            }
        }
    }
}
