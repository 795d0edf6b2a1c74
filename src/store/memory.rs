//! In-memory store (non-persistent).

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;
use tokio::sync::RwLock;
use uuid::Uuid;

use super::{
    Artifact, Document, NewArtifact, NewNode, NewRun, Node, NodeStatus, Plan, PlanBand,
    ResultEnvelope, RoleState, Run, RunMetrics, RunScope, RunStatus, Store, StoreError,
    StoreResult, StoredEvent,
};
use crate::tools::domain::{
    entity_matches, DomainStore, Edge, Entity, EntityPatch, NewEntity, Project,
};

#[derive(Clone, Default)]
pub struct InMemoryStore {
    runs: Arc<RwLock<HashMap<Uuid, Run>>>,
    nodes: Arc<RwLock<HashMap<Uuid, Node>>>,
    plans: Arc<RwLock<HashMap<Uuid, Vec<Plan>>>>,
    artifacts: Arc<RwLock<Vec<Artifact>>>,
    documents: Arc<RwLock<HashMap<Uuid, Document>>>,
    events: Arc<RwLock<HashMap<Uuid, Vec<StoredEvent>>>>,
    projects: Arc<RwLock<BTreeMap<Uuid, Project>>>,
    memberships: Arc<RwLock<HashMap<Uuid, Vec<Uuid>>>>,
    entities: Arc<RwLock<Vec<Entity>>>,
    edges: Arc<RwLock<Vec<Edge>>>,
    fail_events: Arc<AtomicBool>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `append_event` fail (exercises the fire-and-forget log).
    #[cfg(test)]
    pub fn fail_event_writes(&self, fail: bool) {
        self.fail_events.store(fail, Ordering::SeqCst);
    }

    /// Insert a project without touching memberships (seeding only).
    pub async fn insert_project(&self, project: Project) {
        self.projects.write().await.insert(project.id, project);
    }
}

fn not_found(entity: &'static str, id: Uuid) -> StoreError {
    StoreError::NotFound { entity, id }
}

#[async_trait]
impl Store for InMemoryStore {
    fn is_persistent(&self) -> bool {
        false
    }

    async fn create_run(&self, run: NewRun) -> StoreResult<Run> {
        let now = Utc::now();
        let run = Run {
            id: Uuid::new_v4(),
            actor_id: run.actor_id,
            objective: run.objective,
            status: RunStatus::Queued,
            root_node_id: None,
            workspace_id: run.workspace_id,
            scope: run.scope,
            metrics: RunMetrics::default(),
            terminal_message: None,
            created_at: now,
            updated_at: now,
            started_at: None,
            ended_at: None,
        };
        self.runs.write().await.insert(run.id, run.clone());
        Ok(run)
    }

    async fn get_run(&self, id: Uuid) -> StoreResult<Option<Run>> {
        Ok(self.runs.read().await.get(&id).cloned())
    }

    async fn update_run_status(
        &self,
        id: Uuid,
        status: RunStatus,
        message: Option<&str>,
    ) -> StoreResult<Run> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or_else(|| not_found("run", id))?;
        let now = Utc::now();
        run.status = status;
        run.updated_at = now;
        if status == RunStatus::Running && run.started_at.is_none() {
            run.started_at = Some(now);
        }
        if status.is_terminal() {
            run.ended_at = Some(now);
        }
        if let Some(message) = message {
            run.terminal_message = Some(message.to_string());
        }
        Ok(run.clone())
    }

    async fn set_run_root(&self, id: Uuid, root_node_id: Uuid) -> StoreResult<()> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or_else(|| not_found("run", id))?;
        run.root_node_id = Some(root_node_id);
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn update_run_scope(&self, id: Uuid, scope: RunScope) -> StoreResult<()> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or_else(|| not_found("run", id))?;
        run.scope = scope;
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn update_run_metrics(&self, id: Uuid, metrics: &RunMetrics) -> StoreResult<()> {
        let mut runs = self.runs.write().await;
        let run = runs.get_mut(&id).ok_or_else(|| not_found("run", id))?;
        run.metrics = metrics.clone();
        run.updated_at = Utc::now();
        Ok(())
    }

    async fn create_node(&self, node: NewNode) -> StoreResult<Node> {
        let node = Node {
            id: Uuid::new_v4(),
            run_id: node.run_id,
            parent_node_id: node.parent_node_id,
            title: node.title,
            reason: node.reason,
            success_criteria: node.success_criteria,
            depth: node.depth,
            band_index: node.band_index,
            step_index: node.step_index,
            status: NodeStatus::Planning,
            role_state: RoleState::Planner,
            scratchpad_doc_id: None,
            result: None,
            context: node.context,
            created_at: Utc::now(),
            started_at: None,
            ended_at: None,
        };
        self.nodes.write().await.insert(node.id, node.clone());
        Ok(node)
    }

    async fn get_node(&self, id: Uuid) -> StoreResult<Option<Node>> {
        Ok(self.nodes.read().await.get(&id).cloned())
    }

    async fn update_node_status(
        &self,
        id: Uuid,
        status: NodeStatus,
        role: RoleState,
    ) -> StoreResult<Node> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.get_mut(&id).ok_or_else(|| not_found("node", id))?;
        if !node.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                node_id: id,
                from: node.status,
                to: status,
            });
        }
        let now = Utc::now();
        node.status = status;
        node.role_state = role;
        if node.started_at.is_none() {
            node.started_at = Some(now);
        }
        if status.is_terminal() {
            node.ended_at = Some(now);
        }
        Ok(node.clone())
    }

    async fn set_node_scratchpad(&self, id: Uuid, document_id: Uuid) -> StoreResult<()> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.get_mut(&id).ok_or_else(|| not_found("node", id))?;
        node.scratchpad_doc_id = Some(document_id);
        Ok(())
    }

    async fn set_node_result(&self, id: Uuid, result: &ResultEnvelope) -> StoreResult<()> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.get_mut(&id).ok_or_else(|| not_found("node", id))?;
        node.result = Some(result.clone());
        Ok(())
    }

    async fn list_children(&self, parent_id: Uuid) -> StoreResult<Vec<Node>> {
        let mut children: Vec<Node> = self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| n.parent_node_id == Some(parent_id))
            .cloned()
            .collect();
        children.sort_by_key(|n| (n.band_index, n.step_index, n.created_at));
        Ok(children)
    }

    async fn list_nodes(&self, run_id: Uuid) -> StoreResult<Vec<Node>> {
        let mut nodes: Vec<Node> = self
            .nodes
            .read()
            .await
            .values()
            .filter(|n| n.run_id == run_id)
            .cloned()
            .collect();
        nodes.sort_by_key(|n| (n.created_at, n.depth));
        Ok(nodes)
    }

    async fn latest_plan(&self, node_id: Uuid) -> StoreResult<Option<Plan>> {
        Ok(self
            .plans
            .read()
            .await
            .get(&node_id)
            .and_then(|plans| plans.last().cloned()))
    }

    async fn insert_plan(&self, node_id: Uuid, bands: Vec<PlanBand>) -> StoreResult<Plan> {
        let mut plans = self.plans.write().await;
        let versions = plans.entry(node_id).or_default();
        let version = versions.last().map(|p| p.version + 1).unwrap_or(1);
        let plan = Plan {
            id: Uuid::new_v4(),
            node_id,
            version,
            bands,
            created_at: Utc::now(),
        };
        versions.push(plan.clone());
        Ok(plan)
    }

    async fn insert_artifact(&self, artifact: NewArtifact) -> StoreResult<Artifact> {
        let artifact = Artifact {
            id: Uuid::new_v4(),
            run_id: artifact.run_id,
            node_id: artifact.node_id,
            kind: artifact.kind,
            label: artifact.label,
            title: artifact.title,
            document_id: artifact.document_id,
            payload: artifact.payload,
            is_primary: artifact.is_primary,
            created_at: Utc::now(),
        };
        self.artifacts.write().await.push(artifact.clone());
        Ok(artifact)
    }

    async fn list_artifacts(&self, node_id: Uuid) -> StoreResult<Vec<Artifact>> {
        Ok(self
            .artifacts
            .read()
            .await
            .iter()
            .filter(|a| a.node_id == node_id)
            .cloned()
            .collect())
    }

    async fn create_document(
        &self,
        project_id: Uuid,
        title: &str,
        content: &str,
    ) -> StoreResult<Document> {
        let now = Utc::now();
        let document = Document {
            id: Uuid::new_v4(),
            project_id,
            title: title.to_string(),
            content: content.to_string(),
            created_at: now,
            updated_at: now,
        };
        self.documents
            .write()
            .await
            .insert(document.id, document.clone());
        Ok(document)
    }

    async fn get_document(&self, id: Uuid) -> StoreResult<Option<Document>> {
        Ok(self.documents.read().await.get(&id).cloned())
    }

    async fn update_document_content(&self, id: Uuid, content: &str) -> StoreResult<Document> {
        let mut documents = self.documents.write().await;
        let document = documents
            .get_mut(&id)
            .ok_or_else(|| not_found("document", id))?;
        document.content = content.to_string();
        document.updated_at = Utc::now();
        Ok(document.clone())
    }

    async fn append_event(
        &self,
        run_id: Uuid,
        node_id: Option<Uuid>,
        event_type: &str,
        payload: Value,
    ) -> StoreResult<StoredEvent> {
        if self.fail_events.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("event table unavailable".to_string()));
        }
        let mut events = self.events.write().await;
        let stream = events.entry(run_id).or_default();
        let event = StoredEvent {
            run_id,
            seq: stream.last().map(|e| e.seq + 1).unwrap_or(1),
            node_id,
            event_type: event_type.to_string(),
            payload,
            created_at: Utc::now(),
        };
        stream.push(event.clone());
        Ok(event)
    }

    async fn list_events(&self, run_id: Uuid) -> StoreResult<Vec<StoredEvent>> {
        Ok(self
            .events
            .read()
            .await
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl DomainStore for InMemoryStore {
    async fn active_memberships(&self, actor_id: Uuid) -> StoreResult<Vec<Uuid>> {
        Ok(self
            .memberships
            .read()
            .await
            .get(&actor_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn add_membership(&self, actor_id: Uuid, project_id: Uuid) -> StoreResult<()> {
        let mut memberships = self.memberships.write().await;
        let projects = memberships.entry(actor_id).or_default();
        if !projects.contains(&project_id) {
            projects.push(project_id);
        }
        Ok(())
    }

    async fn list_projects(&self, ids: &[Uuid]) -> StoreResult<Vec<Project>> {
        let mut projects: Vec<Project> = self
            .projects
            .read()
            .await
            .values()
            .filter(|p| ids.contains(&p.id))
            .cloned()
            .collect();
        projects.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(projects)
    }

    async fn get_project(&self, id: Uuid) -> StoreResult<Option<Project>> {
        Ok(self.projects.read().await.get(&id).cloned())
    }

    async fn create_project(
        &self,
        owner_id: Uuid,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<Project> {
        let project = Project {
            id: Uuid::new_v4(),
            name: name.to_string(),
            description: description.map(str::to_string),
            owner_id,
            created_at: Utc::now(),
        };
        self.projects
            .write()
            .await
            .insert(project.id, project.clone());
        self.add_membership(owner_id, project.id).await?;
        Ok(project)
    }

    async fn create_entity(&self, entity: NewEntity) -> StoreResult<Entity> {
        let now = Utc::now();
        let entity = Entity {
            id: Uuid::new_v4(),
            project_id: entity.project_id,
            kind: entity.kind,
            title: entity.title,
            body: entity.body,
            properties: entity.properties,
            created_at: now,
            updated_at: now,
        };
        self.entities.write().await.push(entity.clone());
        Ok(entity)
    }

    async fn get_entity(&self, id: Uuid) -> StoreResult<Option<Entity>> {
        Ok(self
            .entities
            .read()
            .await
            .iter()
            .find(|e| e.id == id)
            .cloned())
    }

    async fn update_entity(&self, id: Uuid, patch: EntityPatch) -> StoreResult<Entity> {
        let mut entities = self.entities.write().await;
        let entity = entities
            .iter_mut()
            .find(|e| e.id == id)
            .ok_or_else(|| not_found("entity", id))?;
        if let Some(title) = patch.title {
            entity.title = title;
        }
        if let Some(body) = patch.body {
            entity.body = Some(body);
        }
        if let Some(properties) = patch.properties {
            entity.properties = properties;
        }
        entity.updated_at = Utc::now();
        Ok(entity.clone())
    }

    async fn list_entities(
        &self,
        project_ids: &[Uuid],
        kind: Option<&str>,
    ) -> StoreResult<Vec<Entity>> {
        Ok(self
            .entities
            .read()
            .await
            .iter()
            .filter(|e| project_ids.contains(&e.project_id))
            .filter(|e| kind.map(|k| e.kind == k).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn search_entities(
        &self,
        project_ids: &[Uuid],
        query: &str,
        limit: usize,
    ) -> StoreResult<Vec<Entity>> {
        let needle = query.to_lowercase();
        Ok(self
            .entities
            .read()
            .await
            .iter()
            .filter(|e| project_ids.contains(&e.project_id))
            .filter(|e| entity_matches(e, &needle))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn link_entities(
        &self,
        project_id: Uuid,
        source_id: Uuid,
        target_id: Uuid,
        relation: &str,
    ) -> StoreResult<Edge> {
        let edge = Edge {
            id: Uuid::new_v4(),
            project_id,
            source_id,
            target_id,
            relation: relation.to_string(),
            created_at: Utc::now(),
        };
        self.edges.write().await.push(edge.clone());
        Ok(edge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_run() -> NewRun {
        NewRun {
            actor_id: Uuid::new_v4(),
            objective: "Draft a launch plan".to_string(),
            workspace_id: Uuid::new_v4(),
            scope: RunScope::Global,
        }
    }

    #[tokio::test]
    async fn test_enqueue_creates_single_root() {
        let store = InMemoryStore::new();
        let (run, root) = super::super::enqueue_run(&store, new_run()).await.unwrap();
        assert_eq!(run.status, RunStatus::Queued);
        assert_eq!(run.root_node_id, Some(root.id));
        assert_eq!(root.depth, 0);
        assert!(root.parent_node_id.is_none());
        assert_eq!(store.list_nodes(run.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_terminal_node_rejects_transition() {
        let store = InMemoryStore::new();
        let (_, root) = super::super::enqueue_run(&store, new_run()).await.unwrap();
        store
            .update_node_status(root.id, NodeStatus::Completed, RoleState::Executor)
            .await
            .unwrap();
        let err = store
            .update_node_status(root.id, NodeStatus::Planning, RoleState::Planner)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_plan_versions_increment() {
        let store = InMemoryStore::new();
        let node_id = Uuid::new_v4();
        let first = store.insert_plan(node_id, vec![]).await.unwrap();
        let second = store.insert_plan(node_id, vec![]).await.unwrap();
        assert_eq!(first.version, 1);
        assert_eq!(second.version, 2);
        assert_eq!(store.latest_plan(node_id).await.unwrap().unwrap().version, 2);
    }

    #[tokio::test]
    async fn test_event_seq_is_per_run() {
        let store = InMemoryStore::new();
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());
        for _ in 0..3 {
            store.append_event(a, None, "node_status", Value::Null).await.unwrap();
        }
        let first_b = store.append_event(b, None, "node_status", Value::Null).await.unwrap();
        assert_eq!(first_b.seq, 1);
        let seqs: Vec<i64> = store.list_events(a).await.unwrap().iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_create_project_adds_membership() {
        let store = InMemoryStore::new();
        let actor = Uuid::new_v4();
        let project = store.create_project(actor, "Garden", None).await.unwrap();
        assert_eq!(store.active_memberships(actor).await.unwrap(), vec![project.id]);
    }
}
