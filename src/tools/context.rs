//! Authorization boundary for tool calls.
//!
//! The accessible project set is computed once per run and can only grow
//! (creating a project adds it). Every call returns a [`ToolOutcome`]; nothing
//! here ever fails the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::RwLock;
use uuid::Uuid;

use super::domain::{DomainStore, EntityPatch, NewEntity};
use super::invocation::{ToolError, ToolInvocation};
use super::{ContextType, ExecutionContext, ToolRegistry};
use crate::store::{RunScope, Store, StoreResult};

const DEFAULT_SEARCH_LIMIT: usize = 20;
const MAX_SEARCH_LIMIT: usize = 50;

/// A tool call requested by the LLM.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
}

/// Result of one tool call, success or failure, as data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolOutcome {
    pub tool: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Created or linked ids keyed by kind (`project`, `entity`, `edge`, `document`)
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, Vec<Uuid>>,
}

impl ToolOutcome {
    fn success(tool: &str, result: Value, artifacts: BTreeMap<String, Vec<Uuid>>) -> Self {
        Self {
            tool: tool.to_string(),
            ok: true,
            result: Some(result),
            error: None,
            artifacts,
        }
    }

    fn failure(tool: &str, error: &ToolError) -> Self {
        Self {
            tool: tool.to_string(),
            ok: false,
            result: None,
            error: Some(error.to_string()),
            artifacts: BTreeMap::new(),
        }
    }
}

type Dispatched = Result<(Value, BTreeMap<String, Vec<Uuid>>), ToolError>;

fn created(kind: &str, id: Uuid) -> BTreeMap<String, Vec<Uuid>> {
    BTreeMap::from([(kind.to_string(), vec![id])])
}

fn to_value<T: Serialize>(value: &T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError::Store(e.into()))
}

pub struct ToolExecutionContext {
    actor_id: Uuid,
    run_id: Uuid,
    workspace_project_id: Uuid,
    context: ExecutionContext,
    degraded: bool,
    allowed: RwLock<BTreeSet<Uuid>>,
    store: Arc<dyn Store>,
    domain: Arc<dyn DomainStore>,
    max_batch: usize,
}

impl ToolExecutionContext {
    /// Compute the accessible project set for `actor_id`.
    ///
    /// The set is the workspace project plus active memberships. A requested
    /// project context outside that set degrades to global.
    pub async fn resolve(
        actor_id: Uuid,
        run_id: Uuid,
        workspace_project_id: Uuid,
        requested: ExecutionContext,
        store: Arc<dyn Store>,
        domain: Arc<dyn DomainStore>,
    ) -> StoreResult<Self> {
        let memberships = domain.active_memberships(actor_id).await?;
        let mut allowed: BTreeSet<Uuid> = memberships.iter().copied().collect();
        allowed.insert(workspace_project_id);

        let (context, degraded) = match requested {
            ExecutionContext::Project(project_id) if allowed.contains(&project_id) => {
                (requested, false)
            }
            ExecutionContext::Project(project_id) => {
                tracing::warn!(
                    run_id = %run_id,
                    project_id = %project_id,
                    "Actor is not a member of the requested project; using global context"
                );
                (ExecutionContext::Global, true)
            }
            ExecutionContext::Global => (ExecutionContext::Global, false),
        };

        Ok(Self {
            actor_id,
            run_id,
            workspace_project_id,
            context,
            degraded,
            allowed: RwLock::new(allowed),
            store,
            domain,
            max_batch: 8,
        })
    }

    /// Override the per-batch cap (defaults to 8).
    pub fn with_max_batch(mut self, max_batch: usize) -> Self {
        self.max_batch = max_batch;
        self
    }

    pub fn context(&self) -> ExecutionContext {
        self.context
    }

    pub fn context_type(&self) -> ContextType {
        self.context.context_type()
    }

    /// Whether a requested project context was downgraded to global.
    pub fn was_degraded(&self) -> bool {
        self.degraded
    }

    pub fn workspace_project_id(&self) -> Uuid {
        self.workspace_project_id
    }

    pub async fn allowed_projects(&self) -> Vec<Uuid> {
        self.allowed.read().await.iter().copied().collect()
    }

    /// Scope recorded on the run.
    pub async fn run_scope(&self) -> RunScope {
        match self.context {
            ExecutionContext::Project(_) => RunScope::Project,
            ExecutionContext::Global if self.allowed.read().await.len() > 1 => {
                RunScope::MultiProject
            }
            ExecutionContext::Global => RunScope::Global,
        }
    }

    pub fn allowed_tools(&self) -> Vec<&'static str> {
        ToolRegistry::allowed_tools(self.context_type())
    }

    pub fn tools_guide(&self) -> String {
        ToolRegistry::tools_guide(self.context_type())
    }

    /// Execute one tool call. Never fails; errors come back as `ok: false`.
    pub async fn execute(&self, call: &ToolCall) -> ToolOutcome {
        let result = match ToolInvocation::parse(&call.tool, &call.args) {
            Ok(ToolInvocation::Unregistered { .. }) => Err(ToolError::NotAllowed),
            _ if !ToolRegistry::is_allowed(&call.tool, self.context_type()) => {
                Err(ToolError::NotAllowed)
            }
            Ok(invocation) => self.dispatch(invocation).await,
            Err(e) => Err(e),
        };

        match result {
            Ok((value, artifacts)) => {
                tracing::debug!(run_id = %self.run_id, tool = %call.tool, "Tool call succeeded");
                ToolOutcome::success(&call.tool, value, artifacts)
            }
            Err(e) => {
                tracing::debug!(run_id = %self.run_id, tool = %call.tool, "Tool call rejected: {}", e);
                ToolOutcome::failure(&call.tool, &e)
            }
        }
    }

    /// Execute a capped batch strictly in order.
    pub async fn execute_tool_calls(&self, calls: &[ToolCall]) -> Vec<ToolOutcome> {
        if calls.len() > self.max_batch {
            tracing::warn!(
                run_id = %self.run_id,
                requested = calls.len(),
                cap = self.max_batch,
                "Tool batch truncated"
            );
        }
        let mut outcomes = Vec::with_capacity(calls.len().min(self.max_batch));
        for call in calls.iter().take(self.max_batch) {
            outcomes.push(self.execute(call).await);
        }
        outcomes
    }

    /// Resolve an optional `project_id` argument against the allowed set.
    async fn scoped_project(&self, requested: Option<Uuid>) -> Result<Uuid, ToolError> {
        let project_id = match (requested, self.context) {
            (Some(id), _) => id,
            (None, ExecutionContext::Project(id)) => id,
            (None, ExecutionContext::Global) => return Err(ToolError::MissingProject),
        };
        self.ensure_allowed(project_id).await?;
        Ok(project_id)
    }

    /// Projects a read may span: one scoped project, or the whole allowed set in global context.
    async fn read_scope(&self, requested: Option<Uuid>) -> Result<Vec<Uuid>, ToolError> {
        match (requested, self.context) {
            (None, ExecutionContext::Global) => Ok(self.allowed_projects().await),
            _ => Ok(vec![self.scoped_project(requested).await?]),
        }
    }

    async fn ensure_allowed(&self, project_id: Uuid) -> Result<(), ToolError> {
        if self.allowed.read().await.contains(&project_id) {
            Ok(())
        } else {
            Err(ToolError::UnauthorizedProject)
        }
    }

    async fn dispatch(&self, invocation: ToolInvocation) -> Dispatched {
        match invocation {
            ToolInvocation::ListProjects(_) => {
                let ids = self.allowed_projects().await;
                let projects = self.domain.list_projects(&ids).await?;
                Ok((json!({ "projects": to_value(&projects)? }), BTreeMap::new()))
            }
            ToolInvocation::CreateProject(args) => {
                let project = self
                    .domain
                    .create_project(self.actor_id, &args.name, args.description.as_deref())
                    .await?;
                self.allowed.write().await.insert(project.id);
                Ok((to_value(&project)?, created("project", project.id)))
            }
            ToolInvocation::GetProject(args) => {
                let project_id = self.scoped_project(args.project_id).await?;
                let project = self
                    .domain
                    .get_project(project_id)
                    .await?
                    .ok_or(ToolError::NotFound("project"))?;
                Ok((to_value(&project)?, BTreeMap::new()))
            }
            ToolInvocation::ListEntities(args) => {
                let scope = self.read_scope(args.project_id).await?;
                let entities = self
                    .domain
                    .list_entities(&scope, args.kind.as_deref())
                    .await?;
                Ok((json!({ "entities": to_value(&entities)? }), BTreeMap::new()))
            }
            ToolInvocation::CreateEntity(args) => {
                let project_id = self.scoped_project(args.project_id).await?;
                let entity = self
                    .domain
                    .create_entity(NewEntity {
                        project_id,
                        kind: args.kind,
                        title: args.title,
                        body: args.body,
                        properties: args.properties.unwrap_or_else(|| json!({})),
                    })
                    .await?;
                Ok((to_value(&entity)?, created("entity", entity.id)))
            }
            ToolInvocation::UpdateEntity(args) => {
                let entity = self
                    .domain
                    .get_entity(args.entity_id)
                    .await?
                    .ok_or(ToolError::NotFound("entity"))?;
                self.ensure_allowed(entity.project_id).await?;
                let entity = self
                    .domain
                    .update_entity(
                        entity.id,
                        EntityPatch {
                            title: args.title,
                            body: args.body,
                            properties: args.properties,
                        },
                    )
                    .await?;
                Ok((to_value(&entity)?, created("entity", entity.id)))
            }
            ToolInvocation::SearchEntities(args) => {
                let scope = self.read_scope(args.project_id).await?;
                let limit = args
                    .limit
                    .unwrap_or(DEFAULT_SEARCH_LIMIT)
                    .clamp(1, MAX_SEARCH_LIMIT);
                let entities = self
                    .domain
                    .search_entities(&scope, &args.query, limit)
                    .await?;
                Ok((json!({ "entities": to_value(&entities)? }), BTreeMap::new()))
            }
            ToolInvocation::LinkEntities(args) => {
                let source = self
                    .domain
                    .get_entity(args.source_id)
                    .await?
                    .ok_or(ToolError::NotFound("source entity"))?;
                let target = self
                    .domain
                    .get_entity(args.target_id)
                    .await?
                    .ok_or(ToolError::NotFound("target entity"))?;
                self.ensure_allowed(source.project_id).await?;
                self.ensure_allowed(target.project_id).await?;
                if source.project_id != target.project_id {
                    return Err(ToolError::CrossProjectLink);
                }
                let edge = self
                    .domain
                    .link_entities(source.project_id, source.id, target.id, &args.relation)
                    .await?;
                Ok((to_value(&edge)?, created("edge", edge.id)))
            }
            ToolInvocation::CreateDocument(args) => {
                let project_id = self.scoped_project(args.project_id).await?;
                let document = self
                    .store
                    .create_document(project_id, &args.title, &args.content)
                    .await?;
                let result = json!({
                    "id": document.id,
                    "project_id": document.project_id,
                    "title": document.title,
                });
                Ok((result, created("document", document.id)))
            }
            ToolInvocation::GetDocument(args) => {
                let document = self
                    .store
                    .get_document(args.document_id)
                    .await?
                    .ok_or(ToolError::NotFound("document"))?;
                self.ensure_allowed(document.project_id).await?;
                Ok((to_value(&document)?, BTreeMap::new()))
            }
            ToolInvocation::Unregistered { .. } => Err(ToolError::NotAllowed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryStore;
    use crate::tools::domain::Project;
    use chrono::Utc;

    struct Fixture {
        store: Arc<InMemoryStore>,
        actor: Uuid,
        workspace: Uuid,
        member_of: Uuid,
        stranger: Uuid,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(InMemoryStore::new());
        let actor = Uuid::new_v4();
        let workspace = Uuid::new_v4();
        let member_of = store.create_project(actor, "Garden", None).await.unwrap().id;
        let stranger = Uuid::new_v4();
        store
            .insert_project(Project {
                id: stranger,
                name: "Someone else".to_string(),
                description: None,
                owner_id: Uuid::new_v4(),
                created_at: Utc::now(),
            })
            .await;
        Fixture {
            store,
            actor,
            workspace,
            member_of,
            stranger,
        }
    }

    async fn context_for(f: &Fixture, requested: ExecutionContext) -> ToolExecutionContext {
        ToolExecutionContext::resolve(
            f.actor,
            Uuid::new_v4(),
            f.workspace,
            requested,
            f.store.clone(),
            f.store.clone(),
        )
        .await
        .unwrap()
    }

    fn call(tool: &str, args: Value) -> ToolCall {
        ToolCall {
            tool: tool.to_string(),
            args,
        }
    }

    #[tokio::test]
    async fn test_non_member_project_context_degrades_to_global() {
        let f = fixture().await;
        let ctx = context_for(&f, ExecutionContext::Project(f.stranger)).await;
        assert!(ctx.was_degraded());
        assert_eq!(ctx.context(), ExecutionContext::Global);
        assert_eq!(ctx.run_scope().await, RunScope::MultiProject);

        let ctx = context_for(&f, ExecutionContext::Project(f.member_of)).await;
        assert!(!ctx.was_degraded());
        assert_eq!(ctx.run_scope().await, RunScope::Project);
    }

    #[tokio::test]
    async fn test_workspace_project_context_is_accepted() {
        let f = fixture().await;
        let ctx = context_for(&f, ExecutionContext::Project(f.workspace)).await;
        assert!(!ctx.was_degraded());
        assert_eq!(ctx.context(), ExecutionContext::Project(f.workspace));
        assert_eq!(ctx.run_scope().await, RunScope::Project);
    }

    #[tokio::test]
    async fn test_out_of_scope_project_is_soft_error() {
        let f = fixture().await;
        let ctx = context_for(&f, ExecutionContext::Global).await;
        let outcome = ctx
            .execute(&call(
                "create_entity",
                json!({"project_id": f.stranger, "kind": "task", "title": "sneaky"}),
            ))
            .await;
        assert!(!outcome.ok);
        assert_eq!(outcome.error.as_deref(), Some("unauthorized project_id"));
        assert!(f.store.list_entities(&[f.stranger], None).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_disallowed_and_unknown_tools_rejected() {
        let f = fixture().await;
        let ctx = context_for(&f, ExecutionContext::Project(f.member_of)).await;
        for name in ["list_projects", "format_disk"] {
            let outcome = ctx.execute(&call(name, json!({}))).await;
            assert!(!outcome.ok);
            assert_eq!(outcome.error.as_deref(), Some("tool not allowed in this context"));
        }
    }

    #[tokio::test]
    async fn test_create_entity_defaults_to_context_project() {
        let f = fixture().await;
        let ctx = context_for(&f, ExecutionContext::Project(f.member_of)).await;
        let outcome = ctx
            .execute(&call("create_entity", json!({"kind": "task", "title": "Water"})))
            .await;
        assert!(outcome.ok, "{:?}", outcome.error);
        let ids = &outcome.artifacts["entity"];
        let entity = f.store.get_entity(ids[0]).await.unwrap().unwrap();
        assert_eq!(entity.project_id, f.member_of);
    }

    #[tokio::test]
    async fn test_missing_project_in_global_write_is_soft_error() {
        let f = fixture().await;
        let ctx = context_for(&f, ExecutionContext::Global).await;
        let outcome = ctx
            .execute(&call("create_document", json!({"title": "t", "content": "c"})))
            .await;
        assert!(!outcome.ok);
        assert!(outcome.error.unwrap().contains("project_id is required"));
    }

    #[tokio::test]
    async fn test_created_project_grows_allowed_set() {
        let f = fixture().await;
        let ctx = context_for(&f, ExecutionContext::Global).await;
        let before = ctx.allowed_projects().await.len();
        let outcome = ctx
            .execute(&call("create_project", json!({"name": "Kitchen"})))
            .await;
        assert!(outcome.ok);
        let project_id = outcome.artifacts["project"][0];
        assert_eq!(ctx.allowed_projects().await.len(), before + 1);

        let doc = ctx
            .execute(&call(
                "create_document",
                json!({"project_id": project_id, "title": "Menu", "content": "soup"}),
            ))
            .await;
        assert!(doc.ok);
        assert_eq!(doc.artifacts["document"].len(), 1);
    }

    #[tokio::test]
    async fn test_link_requires_same_project() {
        let f = fixture().await;
        let ctx = context_for(&f, ExecutionContext::Global).await;
        let mut ids = Vec::new();
        for project in [f.member_of, f.workspace] {
            let outcome = ctx
                .execute(&call(
                    "create_entity",
                    json!({"project_id": project, "kind": "goal", "title": "g"}),
                ))
                .await;
            ids.push(outcome.artifacts["entity"][0]);
        }
        let outcome = ctx
            .execute(&call(
                "link_entities",
                json!({"source_id": ids[0], "target_id": ids[1], "relation": "blocks"}),
            ))
            .await;
        assert!(!outcome.ok);
        assert_eq!(
            outcome.error.as_deref(),
            Some("link endpoints must belong to the same project")
        );
    }

    #[tokio::test]
    async fn test_batch_is_capped_and_ordered() {
        let f = fixture().await;
        let ctx = context_for(&f, ExecutionContext::Project(f.member_of))
            .await
            .with_max_batch(3);
        let calls: Vec<ToolCall> = (0..5)
            .map(|i| call("create_entity", json!({"kind": "note", "title": format!("n{}", i)})))
            .collect();
        let outcomes = ctx.execute_tool_calls(&calls).await;
        assert_eq!(outcomes.len(), 3);
        let titles: Vec<String> = f
            .store
            .list_entities(&[f.member_of], Some("note"))
            .await
            .unwrap()
            .into_iter()
            .map(|e| e.title)
            .collect();
        assert_eq!(titles, vec!["n0", "n1", "n2"]);
    }
}
