//! Domain tool store contract.
//!
//! Projects, memberships, generic entities and the edges between them. The
//! orchestrator never touches this directly; it is reachable only through
//! [`ToolExecutionContext`](super::ToolExecutionContext).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::StoreResult;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub owner_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// A typed record inside one project (task, goal, note, ...).
///
/// `kind` is free text: the ontology belongs to the caller, not to this crate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub project_id: Uuid,
    pub kind: String,
    pub title: String,
    pub body: Option<String>,
    pub properties: Value,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewEntity {
    pub project_id: Uuid,
    pub kind: String,
    pub title: String,
    pub body: Option<String>,
    pub properties: Value,
}

/// Partial update; `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct EntityPatch {
    pub title: Option<String>,
    pub body: Option<String>,
    pub properties: Option<Value>,
}

/// Directed relation between two entities of the same project.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: Uuid,
    pub project_id: Uuid,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub relation: String,
    pub created_at: DateTime<Utc>,
}

#[async_trait]
pub trait DomainStore: Send + Sync {
    /// Projects the actor is an active member of.
    async fn active_memberships(&self, actor_id: Uuid) -> StoreResult<Vec<Uuid>>;

    async fn add_membership(&self, actor_id: Uuid, project_id: Uuid) -> StoreResult<()>;

    /// Projects among `ids`, ordered by name.
    async fn list_projects(&self, ids: &[Uuid]) -> StoreResult<Vec<Project>>;

    async fn get_project(&self, id: Uuid) -> StoreResult<Option<Project>>;

    /// Create a project owned by `owner_id` and make the owner a member.
    async fn create_project(
        &self,
        owner_id: Uuid,
        name: &str,
        description: Option<&str>,
    ) -> StoreResult<Project>;

    async fn create_entity(&self, entity: NewEntity) -> StoreResult<Entity>;

    async fn get_entity(&self, id: Uuid) -> StoreResult<Option<Entity>>;

    async fn update_entity(&self, id: Uuid, patch: EntityPatch) -> StoreResult<Entity>;

    /// Entities in any of `project_ids`, optionally filtered by kind, oldest first.
    async fn list_entities(
        &self,
        project_ids: &[Uuid],
        kind: Option<&str>,
    ) -> StoreResult<Vec<Entity>>;

    /// Case-insensitive substring match over title and body.
    async fn search_entities(
        &self,
        project_ids: &[Uuid],
        query: &str,
        limit: usize,
    ) -> StoreResult<Vec<Entity>>;

    async fn link_entities(
        &self,
        project_id: Uuid,
        source_id: Uuid,
        target_id: Uuid,
        relation: &str,
    ) -> StoreResult<Edge>;
}

/// Shared matcher for backends that filter in process.
pub(crate) fn entity_matches(entity: &Entity, needle_lower: &str) -> bool {
    entity.title.to_lowercase().contains(needle_lower)
        || entity
            .body
            .as_deref()
            .map(|b| b.to_lowercase().contains(needle_lower))
            .unwrap_or(false)
}
