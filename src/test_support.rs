//! Fakes and fixtures shared by unit tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::agents::orchestrator::RunController;
use crate::agents::{JobBudgets, JobPayload};
use crate::config::OrchestratorConfig;
use crate::llm::{LlmRequest, LlmResponse, LlmRole, LlmUsage, StructuredLlm};
use crate::store::{enqueue_run, InMemoryStore, NewRun, Node, Run, RunScope, Store, StoredEvent};
use crate::tools::DomainStore;

type Responder = Box<dyn Fn(&LlmRequest) -> anyhow::Result<Value> + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RecordedCall {
    pub role: LlmRole,
    pub schema_name: &'static str,
    pub system_prompt: String,
    pub user_prompt: String,
}

/// A `StructuredLlm` answering from a closure and recording every call.
pub struct ScriptedLlm {
    responder: Responder,
    calls: Mutex<Vec<RecordedCall>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
    delay: Option<Duration>,
}

impl ScriptedLlm {
    pub fn new<F>(responder: F) -> Self
    where
        F: Fn(&LlmRequest) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        Self {
            responder: Box::new(responder),
            calls: Mutex::new(Vec::new()),
            in_flight: AtomicUsize::new(0),
            max_in_flight: AtomicUsize::new(0),
            delay: None,
        }
    }

    /// Hold every call open for `delay` so concurrency becomes observable.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, role: LlmRole) -> Vec<RecordedCall> {
        self.calls().into_iter().filter(|c| c.role == role).collect()
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl StructuredLlm for ScriptedLlm {
    async fn call(&self, request: &LlmRequest) -> anyhow::Result<LlmResponse> {
        self.calls.lock().unwrap().push(RecordedCall {
            role: request.role,
            schema_name: request.schema_name,
            system_prompt: request.system_prompt.clone(),
            user_prompt: request.user_prompt.clone(),
        });

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        let output = (self.responder)(request);
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        Ok(LlmResponse {
            output: output?,
            usage: Some(LlmUsage::new("test/model", 10, 5)),
        })
    }
}

/// Node depth as rendered in the user prompt.
pub fn prompt_depth(request: &LlmRequest) -> u32 {
    request
        .user_prompt
        .lines()
        .find_map(|line| line.strip_prefix("Depth: "))
        .and_then(|d| d.trim().parse().ok())
        .unwrap_or(0)
}

pub fn prompt_title(request: &LlmRequest) -> String {
    request
        .user_prompt
        .lines()
        .find_map(|line| line.strip_prefix("Node title: "))
        .unwrap_or_default()
        .to_string()
}

pub fn planner_execute() -> Value {
    json!({
        "mode": "execute",
        "leafDecision": {"reason": "small enough"},
        "scratchpad": {"appendMarkdown": "Executing directly."}
    })
}

/// A plan whose bands hold the given step titles.
pub fn planner_plan(bands: &[&[&str]]) -> Value {
    let bands: Vec<Value> = bands
        .iter()
        .map(|steps| {
            let steps: Vec<Value> = steps
                .iter()
                .map(|title| {
                    json!({
                        "title": title,
                        "reason": format!("needed for {}", title),
                        "successCriteria": [format!("{} done", title)]
                    })
                })
                .collect();
            json!({ "steps": steps })
        })
        .collect();
    json!({
        "mode": "plan",
        "plan": { "bands": bands },
        "scratchpad": {"appendMarkdown": "Splitting the work."}
    })
}

fn result_body(summary: &str) -> Value {
    json!({
        "kind": "document",
        "summary": summary,
        "successAssessment": {"met": true, "notes": ""},
        "artifacts": [
            {"type": "document", "label": "report", "title": "Report", "documentMarkdown": format!("# {}", summary), "isPrimary": true},
            {"type": "json", "label": "data", "jsonPayload": {"summary": summary}}
        ],
        "primaryArtifactLabel": "report",
        "jsonPayload": {"summary": summary}
    })
}

pub fn executor_result(summary: &str) -> Value {
    json!({
        "result": result_body(summary),
        "parentHint": {"mode": "read_documents", "artifactLabels": ["report"]},
        "scratchpad": {"appendMarkdown": format!("Finished: {}", summary)}
    })
}

pub fn executor_with_actions(actions: Value) -> Value {
    json!({
        "actions": actions,
        "result": result_body("draft"),
        "scratchpad": {"appendMarkdown": "Calling tools."}
    })
}

pub fn aggregator_result(summary: &str, should_replan: bool) -> Value {
    let mut body = result_body(summary);
    body["shouldReplan"] = json!(should_replan);
    if should_replan {
        body["replanReason"] = json!("children missed the goal");
    }
    body["scratchpad"] = json!({"appendMarkdown": format!("Aggregated: {}", summary)});
    body
}

/// A workspace, an actor who belongs to it, and one enqueued run.
pub struct Harness {
    pub store: Arc<InMemoryStore>,
    pub actor: Uuid,
    pub workspace: Uuid,
    pub run: Run,
    pub root: Node,
}

impl Harness {
    pub async fn new(objective: &str) -> Self {
        let store = Arc::new(InMemoryStore::new());
        let actor = Uuid::new_v4();
        let workspace = store
            .create_project(actor, "Workspace", None)
            .await
            .unwrap()
            .id;
        let (run, root) = enqueue_run(
            store.as_ref(),
            NewRun {
                actor_id: actor,
                objective: objective.to_string(),
                workspace_id: workspace,
                scope: RunScope::Global,
            },
        )
        .await
        .unwrap();
        Self {
            store,
            actor,
            workspace,
            run,
            root,
        }
    }

    pub fn job(&self) -> JobPayload {
        JobPayload {
            run_id: self.run.id,
            root_node_id: self.root.id,
            workspace_project_id: self.workspace,
            budgets: JobBudgets::default(),
            context_type: None,
            context_project_id: None,
        }
    }

    pub fn controller(&self, llm: Arc<ScriptedLlm>, config: OrchestratorConfig) -> RunController {
        RunController::new(self.store.clone(), self.store.clone(), llm, config)
    }

    pub async fn run(&self) -> Run {
        self.store.get_run(self.run.id).await.unwrap().unwrap()
    }

    pub async fn nodes(&self) -> Vec<Node> {
        self.store.list_nodes(self.run.id).await.unwrap()
    }

    pub async fn events(&self) -> Vec<StoredEvent> {
        self.store.list_events(self.run.id).await.unwrap()
    }

    pub async fn event_types(&self) -> Vec<String> {
        self.events()
            .await
            .into_iter()
            .map(|e| e.event_type)
            .collect()
    }
}
