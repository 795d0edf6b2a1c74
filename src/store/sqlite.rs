//! SQLite-backed store with full event logging.
//!
//! One connection behind an async mutex; every call runs on the blocking pool.
//! Ids and timestamps are stored as text, structured fields as JSON text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{
    Artifact, ArtifactKind, Document, NewArtifact, NewNode, NewRun, Node, NodeStatus, Plan,
    PlanBand, ResultEnvelope, RoleState, Run, RunMetrics, RunScope, RunStatus, Store, StoreError,
    StoreResult, StoredEvent,
};
use crate::tools::domain::{DomainStore, Edge, Entity, EntityPatch, NewEntity, Project};

const SCHEMA: &str = r#"
PRAGMA journal_mode = WAL;
PRAGMA foreign_keys = ON;

CREATE TABLE IF NOT EXISTS runs (
    id TEXT PRIMARY KEY NOT NULL,
    actor_id TEXT NOT NULL,
    objective TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'queued',
    root_node_id TEXT,
    workspace_id TEXT NOT NULL,
    scope TEXT NOT NULL DEFAULT 'global',
    metrics TEXT NOT NULL DEFAULT '{}',
    terminal_message TEXT,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    started_at TEXT,
    ended_at TEXT
);

CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);

CREATE TABLE IF NOT EXISTS nodes (
    id TEXT PRIMARY KEY NOT NULL,
    run_id TEXT NOT NULL,
    parent_node_id TEXT,
    title TEXT NOT NULL,
    reason TEXT NOT NULL,
    success_criteria TEXT NOT NULL DEFAULT '[]',
    depth INTEGER NOT NULL,
    band_index INTEGER,
    step_index INTEGER,
    status TEXT NOT NULL DEFAULT 'planning',
    role_state TEXT NOT NULL DEFAULT 'planner',
    scratchpad_doc_id TEXT,
    result TEXT,
    context TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    started_at TEXT,
    ended_at TEXT,
    FOREIGN KEY (run_id) REFERENCES runs(id) ON DELETE CASCADE
);

CREATE INDEX IF NOT EXISTS idx_nodes_run ON nodes(run_id);
CREATE INDEX IF NOT EXISTS idx_nodes_parent ON nodes(parent_node_id, band_index, step_index);

CREATE TABLE IF NOT EXISTS plans (
    id TEXT PRIMARY KEY NOT NULL,
    node_id TEXT NOT NULL,
    version INTEGER NOT NULL,
    bands TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (node_id, version)
);

CREATE TABLE IF NOT EXISTS artifacts (
    id TEXT PRIMARY KEY NOT NULL,
    run_id TEXT NOT NULL,
    node_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    label TEXT NOT NULL,
    title TEXT,
    document_id TEXT,
    payload TEXT,
    is_primary INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_artifacts_node ON artifacts(node_id);

CREATE TABLE IF NOT EXISTS documents (
    id TEXT PRIMARY KEY NOT NULL,
    project_id TEXT NOT NULL,
    title TEXT NOT NULL,
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS events (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    node_id TEXT,
    event_type TEXT NOT NULL,
    payload TEXT NOT NULL,
    created_at TEXT NOT NULL,
    UNIQUE (run_id, seq)
);

CREATE INDEX IF NOT EXISTS idx_events_type ON events(run_id, event_type);

CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY NOT NULL,
    name TEXT NOT NULL,
    description TEXT,
    owner_id TEXT NOT NULL,
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS memberships (
    actor_id TEXT NOT NULL,
    project_id TEXT NOT NULL,
    active INTEGER NOT NULL DEFAULT 1,
    created_at TEXT NOT NULL,
    PRIMARY KEY (actor_id, project_id)
);

CREATE TABLE IF NOT EXISTS entities (
    id TEXT PRIMARY KEY NOT NULL,
    project_id TEXT NOT NULL,
    kind TEXT NOT NULL,
    title TEXT NOT NULL,
    body TEXT,
    properties TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_entities_project ON entities(project_id, kind);

CREATE TABLE IF NOT EXISTS edges (
    id TEXT PRIMARY KEY NOT NULL,
    project_id TEXT NOT NULL,
    source_id TEXT NOT NULL,
    target_id TEXT NOT NULL,
    relation TEXT NOT NULL,
    created_at TEXT NOT NULL
);
"#;

const RUN_COLUMNS: &str = "id, actor_id, objective, status, root_node_id, workspace_id, scope, metrics,
     terminal_message, created_at, updated_at, started_at, ended_at";

const NODE_COLUMNS: &str = "id, run_id, parent_node_id, title, reason, success_criteria, depth,
     band_index, step_index, status, role_state, scratchpad_doc_id, result, context,
     created_at, started_at, ended_at";

const ARTIFACT_COLUMNS: &str =
    "id, run_id, node_id, kind, label, title, document_id, payload, is_primary, created_at";

const ENTITY_COLUMNS: &str =
    "id, project_id, kind, title, body, properties, created_at, updated_at";

#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database file, creating parent directories.
    pub async fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| StoreError::Backend(format!("Failed to create store dir: {}", e)))?;
        }
        let path = path.to_path_buf();
        let conn = tokio::task::spawn_blocking(move || {
            let conn = Connection::open(&path)?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, StoreError>(conn)
        })
        .await??;

        tracing::debug!("SQLite store ready");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Private in-memory database with the full schema.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let conn = tokio::task::spawn_blocking(|| {
            let conn = Connection::open_in_memory()?;
            conn.execute_batch(SCHEMA)?;
            Ok::<_, StoreError>(conn)
        })
        .await??;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `f` against the connection on the blocking pool.
    async fn with_conn<T, F>(&self, f: F) -> StoreResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
    {
        let conn = self.conn.clone();
        tokio::task::spawn_blocking(move || {
            let conn = conn.blocking_lock();
            f(&conn)
        })
        .await?
    }
}

fn now_string() -> String {
    Utc::now().to_rfc3339()
}

fn conversion_error(
    idx: usize,
    err: impl std::error::Error + Send + Sync + 'static,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Uuid> {
    let s: String = row.get(idx)?;
    Uuid::parse_str(&s).map_err(|e| conversion_error(idx, e))
}

fn opt_uuid_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<Uuid>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| Uuid::parse_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

fn time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn opt_time_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| {
        DateTime::parse_from_rfc3339(&s)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|e| conversion_error(idx, e))
    })
    .transpose()
}

fn json_at<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    serde_json::from_str(&s).map_err(|e| conversion_error(idx, e))
}

fn opt_json_at<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>> {
    let s: Option<String> = row.get(idx)?;
    s.map(|s| serde_json::from_str(&s).map_err(|e| conversion_error(idx, e)))
        .transpose()
}

#[derive(Debug, thiserror::Error)]
#[error("unknown {0} value: {1}")]
struct UnknownValue(&'static str, String);

fn enum_at<T>(
    row: &Row<'_>,
    idx: usize,
    what: &'static str,
    parse: fn(&str) -> Option<T>,
) -> rusqlite::Result<T> {
    let s: String = row.get(idx)?;
    parse(&s).ok_or_else(|| conversion_error(idx, UnknownValue(what, s)))
}

fn row_to_run(row: &Row<'_>) -> rusqlite::Result<Run> {
    Ok(Run {
        id: uuid_at(row, 0)?,
        actor_id: uuid_at(row, 1)?,
        objective: row.get(2)?,
        status: enum_at(row, 3, "run status", RunStatus::parse)?,
        root_node_id: opt_uuid_at(row, 4)?,
        workspace_id: uuid_at(row, 5)?,
        scope: enum_at(row, 6, "run scope", RunScope::parse)?,
        metrics: json_at(row, 7)?,
        terminal_message: row.get(8)?,
        created_at: time_at(row, 9)?,
        updated_at: time_at(row, 10)?,
        started_at: opt_time_at(row, 11)?,
        ended_at: opt_time_at(row, 12)?,
    })
}

fn row_to_node(row: &Row<'_>) -> rusqlite::Result<Node> {
    Ok(Node {
        id: uuid_at(row, 0)?,
        run_id: uuid_at(row, 1)?,
        parent_node_id: opt_uuid_at(row, 2)?,
        title: row.get(3)?,
        reason: row.get(4)?,
        success_criteria: json_at(row, 5)?,
        depth: row.get(6)?,
        band_index: row.get(7)?,
        step_index: row.get(8)?,
        status: enum_at(row, 9, "node status", NodeStatus::parse)?,
        role_state: enum_at(row, 10, "role state", RoleState::parse)?,
        scratchpad_doc_id: opt_uuid_at(row, 11)?,
        result: opt_json_at(row, 12)?,
        context: json_at(row, 13)?,
        created_at: time_at(row, 14)?,
        started_at: opt_time_at(row, 15)?,
        ended_at: opt_time_at(row, 16)?,
    })
}

fn row_to_artifact(row: &Row<'_>) -> rusqlite::Result<Artifact> {
    Ok(Artifact {
        id: uuid_at(row, 0)?,
        run_id: uuid_at(row, 1)?,
        node_id: uuid_at(row, 2)?,
        kind: enum_at(row, 3, "artifact kind", ArtifactKind::parse)?,
        label: row.get(4)?,
        title: row.get(5)?,
        document_id: opt_uuid_at(row, 6)?,
        payload: opt_json_at(row, 7)?,
        is_primary: row.get::<_, i32>(8)? != 0,
        created_at: time_at(row, 9)?,
    })
}

fn row_to_document(row: &Row<'_>) -> rusqlite::Result<Document> {
    Ok(Document {
        id: uuid_at(row, 0)?,
        project_id: uuid_at(row, 1)?,
        title: row.get(2)?,
        content: row.get(3)?,
        created_at: time_at(row, 4)?,
        updated_at: time_at(row, 5)?,
    })
}

fn row_to_event(row: &Row<'_>) -> rusqlite::Result<StoredEvent> {
    Ok(StoredEvent {
        run_id: uuid_at(row, 0)?,
        seq: row.get(1)?,
        node_id: opt_uuid_at(row, 2)?,
        event_type: row.get(3)?,
        payload: json_at(row, 4)?,
        created_at: time_at(row, 5)?,
    })
}

fn row_to_project(row: &Row<'_>) -> rusqlite::Result<Project> {
    Ok(Project {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        description: row.get(2)?,
        owner_id: uuid_at(row, 3)?,
        created_at: time_at(row, 4)?,
    })
}

fn row_to_entity(row: &Row<'_>) -> rusqlite::Result<Entity> {
    Ok(Entity {
        id: uuid_at(row, 0)?,
        project_id: uuid_at(row, 1)?,
        kind: row.get(2)?,
        title: row.get(3)?,
        body: row.get(4)?,
        properties: json_at(row, 5)?,
        created_at: time_at(row, 6)?,
        updated_at: time_at(row, 7)?,
    })
}

fn load_run(conn: &Connection, id: Uuid) -> StoreResult<Option<Run>> {
    let sql = format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id.to_string()], row_to_run)
        .optional()?)
}

fn load_node(conn: &Connection, id: Uuid) -> StoreResult<Option<Node>> {
    let sql = format!("SELECT {} FROM nodes WHERE id = ?1", NODE_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id.to_string()], row_to_node)
        .optional()?)
}

fn load_document(conn: &Connection, id: Uuid) -> StoreResult<Option<Document>> {
    Ok(conn
        .query_row(
            "SELECT id, project_id, title, content, created_at, updated_at
             FROM documents WHERE id = ?1",
            params![id.to_string()],
            row_to_document,
        )
        .optional()?)
}

fn load_entity(conn: &Connection, id: Uuid) -> StoreResult<Option<Entity>> {
    let sql = format!("SELECT {} FROM entities WHERE id = ?1", ENTITY_COLUMNS);
    Ok(conn
        .query_row(&sql, params![id.to_string()], row_to_entity)
        .optional()?)
}

fn load_plan(conn: &Connection, node_id: Uuid) -> StoreResult<Option<Plan>> {
    let row = conn
        .query_row(
            "SELECT id, version, bands, created_at FROM plans
             WHERE node_id = ?1 ORDER BY version DESC LIMIT 1",
            params![node_id.to_string()],
            |row| {
                Ok(Plan {
                    id: uuid_at(row, 0)?,
                    node_id,
                    version: row.get(1)?,
                    bands: json_at(row, 2)?,
                    created_at: time_at(row, 3)?,
                })
            },
        )
        .optional()?;
    Ok(row)
}

/// Require that an UPDATE touched a row.
fn touched(changed: usize, entity: &'static str, id: Uuid) -> StoreResult<()> {
    if changed == 0 {
        Err(StoreError::NotFound { entity, id })
    } else {
        Ok(())
    }
}

fn id_list(ids: &[Uuid]) -> String {
    serde_json::to_string(&ids.iter().map(Uuid::to_string).collect::<Vec<_>>())
        .unwrap_or_else(|_| "[]".to_string())
}

#[async_trait]
impl Store for SqliteStore {
    fn is_persistent(&self) -> bool {
        true
    }

    async fn create_run(&self, run: NewRun) -> StoreResult<Run> {
        let id = Uuid::new_v4();
        self.with_conn(move |conn| {
            let now = now_string();
            conn.execute(
                "INSERT INTO runs (id, actor_id, objective, status, workspace_id, scope, metrics, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)",
                params![
                    id.to_string(),
                    run.actor_id.to_string(),
                    run.objective,
                    RunStatus::Queued.as_str(),
                    run.workspace_id.to_string(),
                    run.scope.as_str(),
                    serde_json::to_string(&RunMetrics::default())?,
                    now,
                ],
            )?;
            load_run(conn, id)?.ok_or(StoreError::NotFound { entity: "run", id })
        })
        .await
    }

    async fn get_run(&self, id: Uuid) -> StoreResult<Option<Run>> {
        self.with_conn(move |conn| load_run(conn, id)).await
    }

    async fn update_run_status(
        &self,
        id: Uuid,
        status: RunStatus,
        message: Option<&str>,
    ) -> StoreResult<Run> {
        let message = message.map(str::to_string);
        self.with_conn(move |conn| {
            let now = now_string();
            let started = (status == RunStatus::Running).then(|| now.clone());
            let ended = status.is_terminal().then(|| now.clone());
            let changed = conn.execute(
                "UPDATE runs SET status = ?1, updated_at = ?2,
                     started_at = COALESCE(started_at, ?3),
                     ended_at = COALESCE(?4, ended_at),
                     terminal_message = COALESCE(?5, terminal_message)
                 WHERE id = ?6",
                params![status.as_str(), now, started, ended, message, id.to_string()],
            )?;
            touched(changed, "run", id)?;
            load_run(conn, id)?.ok_or(StoreError::NotFound { entity: "run", id })
        })
        .await
    }

    async fn set_run_root(&self, id: Uuid, root_node_id: Uuid) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE runs SET root_node_id = ?1, updated_at = ?2 WHERE id = ?3",
                params![root_node_id.to_string(), now_string(), id.to_string()],
            )?;
            touched(changed, "run", id)
        })
        .await
    }

    async fn update_run_scope(&self, id: Uuid, scope: RunScope) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE runs SET scope = ?1, updated_at = ?2 WHERE id = ?3",
                params![scope.as_str(), now_string(), id.to_string()],
            )?;
            touched(changed, "run", id)
        })
        .await
    }

    async fn update_run_metrics(&self, id: Uuid, metrics: &RunMetrics) -> StoreResult<()> {
        let metrics = serde_json::to_string(metrics)?;
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE runs SET metrics = ?1, updated_at = ?2 WHERE id = ?3",
                params![metrics, now_string(), id.to_string()],
            )?;
            touched(changed, "run", id)
        })
        .await
    }

    async fn create_node(&self, node: NewNode) -> StoreResult<Node> {
        let id = Uuid::new_v4();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO nodes (id, run_id, parent_node_id, title, reason, success_criteria, depth,
                                    band_index, step_index, status, role_state, context, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    id.to_string(),
                    node.run_id.to_string(),
                    node.parent_node_id.map(|p| p.to_string()),
                    node.title,
                    node.reason,
                    serde_json::to_string(&node.success_criteria)?,
                    node.depth,
                    node.band_index,
                    node.step_index,
                    NodeStatus::Planning.as_str(),
                    RoleState::Planner.as_str(),
                    serde_json::to_string(&node.context)?,
                    now_string(),
                ],
            )?;
            load_node(conn, id)?.ok_or(StoreError::NotFound { entity: "node", id })
        })
        .await
    }

    async fn get_node(&self, id: Uuid) -> StoreResult<Option<Node>> {
        self.with_conn(move |conn| load_node(conn, id)).await
    }

    async fn update_node_status(
        &self,
        id: Uuid,
        status: NodeStatus,
        role: RoleState,
    ) -> StoreResult<Node> {
        self.with_conn(move |conn| {
            let current =
                load_node(conn, id)?.ok_or(StoreError::NotFound { entity: "node", id })?;
            if !current.status.can_transition_to(status) {
                return Err(StoreError::InvalidTransition {
                    node_id: id,
                    from: current.status,
                    to: status,
                });
            }
            let now = now_string();
            let ended = status.is_terminal().then(|| now.clone());
            conn.execute(
                "UPDATE nodes SET status = ?1, role_state = ?2,
                     started_at = COALESCE(started_at, ?3),
                     ended_at = COALESCE(?4, ended_at)
                 WHERE id = ?5",
                params![status.as_str(), role.as_str(), now, ended, id.to_string()],
            )?;
            load_node(conn, id)?.ok_or(StoreError::NotFound { entity: "node", id })
        })
        .await
    }

    async fn set_node_scratchpad(&self, id: Uuid, document_id: Uuid) -> StoreResult<()> {
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE nodes SET scratchpad_doc_id = ?1 WHERE id = ?2",
                params![document_id.to_string(), id.to_string()],
            )?;
            touched(changed, "node", id)
        })
        .await
    }

    async fn set_node_result(&self, id: Uuid, result: &ResultEnvelope) -> StoreResult<()> {
        let result = serde_json::to_string(result)?;
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE nodes SET result = ?1 WHERE id = ?2",
                params![result, id.to_string()],
            )?;
            touched(changed, "node", id)
        })
        .await
    }

    async fn list_children(&self, parent_id: Uuid) -> StoreResult<Vec<Node>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM nodes WHERE parent_node_id = ?1
                 ORDER BY band_index, step_index, created_at",
                NODE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let nodes = stmt
                .query_map(params![parent_id.to_string()], row_to_node)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(nodes)
        })
        .await
    }

    async fn list_nodes(&self, run_id: Uuid) -> StoreResult<Vec<Node>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM nodes WHERE run_id = ?1 ORDER BY created_at, depth",
                NODE_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let nodes = stmt
                .query_map(params![run_id.to_string()], row_to_node)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(nodes)
        })
        .await
    }

    async fn latest_plan(&self, node_id: Uuid) -> StoreResult<Option<Plan>> {
        self.with_conn(move |conn| load_plan(conn, node_id)).await
    }

    async fn insert_plan(&self, node_id: Uuid, bands: Vec<PlanBand>) -> StoreResult<Plan> {
        let bands_json = serde_json::to_string(&bands)?;
        self.with_conn(move |conn| {
            let version: u32 = conn.query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM plans WHERE node_id = ?1",
                params![node_id.to_string()],
                |row| row.get(0),
            )?;
            conn.execute(
                "INSERT INTO plans (id, node_id, version, bands, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    Uuid::new_v4().to_string(),
                    node_id.to_string(),
                    version,
                    bands_json,
                    now_string(),
                ],
            )?;
            load_plan(conn, node_id)?.ok_or(StoreError::NotFound {
                entity: "plan",
                id: node_id,
            })
        })
        .await
    }

    async fn insert_artifact(&self, artifact: NewArtifact) -> StoreResult<Artifact> {
        let id = Uuid::new_v4();
        let payload = artifact
            .payload
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO artifacts (id, run_id, node_id, kind, label, title, document_id, payload, is_primary, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    id.to_string(),
                    artifact.run_id.to_string(),
                    artifact.node_id.to_string(),
                    artifact.kind.as_str(),
                    artifact.label,
                    artifact.title,
                    artifact.document_id.map(|d| d.to_string()),
                    payload,
                    artifact.is_primary as i32,
                    now_string(),
                ],
            )?;
            let sql = format!("SELECT {} FROM artifacts WHERE id = ?1", ARTIFACT_COLUMNS);
            Ok(conn.query_row(&sql, params![id.to_string()], row_to_artifact)?)
        })
        .await
    }

    async fn list_artifacts(&self, node_id: Uuid) -> StoreResult<Vec<Artifact>> {
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM artifacts WHERE node_id = ?1 ORDER BY created_at",
                ARTIFACT_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let artifacts = stmt
                .query_map(params![node_id.to_string()], row_to_artifact)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(artifacts)
        })
        .await
    }

    async fn create_document(
        &self,
        project_id: Uuid,
        title: &str,
        content: &str,
    ) -> StoreResult<Document> {
        let id = Uuid::new_v4();
        let (title, content) = (title.to_string(), content.to_string());
        self.with_conn(move |conn| {
            let now = now_string();
            conn.execute(
                "INSERT INTO documents (id, project_id, title, content, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?5)",
                params![id.to_string(), project_id.to_string(), title, content, now],
            )?;
            load_document(conn, id)?.ok_or(StoreError::NotFound {
                entity: "document",
                id,
            })
        })
        .await
    }

    async fn get_document(&self, id: Uuid) -> StoreResult<Option<Document>> {
        self.with_conn(move |conn| load_document(conn, id)).await
    }

    async fn update_document_content(&self, id: Uuid, content: &str) -> StoreResult<Document> {
        let content = content.to_string();
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE documents SET content = ?1, updated_at = ?2 WHERE id = ?3",
                params![content, now_string(), id.to_string()],
            )?;
            touched(changed, "document", id)?;
            load_document(conn, id)?.ok_or(StoreError::NotFound {
                entity: "document",
                id,
            })
        })
        .await
    }

    async fn append_event(
        &self,
        run_id: Uuid,
        node_id: Option<Uuid>,
        event_type: &str,
        payload: Value,
    ) -> StoreResult<StoredEvent> {
        let event_type = event_type.to_string();
        let payload_json = serde_json::to_string(&payload)?;
        self.with_conn(move |conn| {
            // The connection lock serialises writers, so MAX(seq)+1 cannot race.
            let seq: i64 = conn.query_row(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM events WHERE run_id = ?1",
                params![run_id.to_string()],
                |row| row.get(0),
            )?;
            let created_at = Utc::now();
            conn.execute(
                "INSERT INTO events (run_id, seq, node_id, event_type, payload, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    run_id.to_string(),
                    seq,
                    node_id.map(|n| n.to_string()),
                    event_type,
                    payload_json,
                    created_at.to_rfc3339(),
                ],
            )?;
            Ok(StoredEvent {
                run_id,
                seq,
                node_id,
                event_type,
                payload,
                created_at,
            })
        })
        .await
    }

    async fn list_events(&self, run_id: Uuid) -> StoreResult<Vec<StoredEvent>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT run_id, seq, node_id, event_type, payload, created_at
                 FROM events WHERE run_id = ?1 ORDER BY seq ASC",
            )?;
            let events = stmt
                .query_map(params![run_id.to_string()], row_to_event)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(events)
        })
        .await
    }
}

#[async_trait]
impl DomainStore for SqliteStore {
    async fn active_memberships(&self, actor_id: Uuid) -> StoreResult<Vec<Uuid>> {
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT project_id FROM memberships
                 WHERE actor_id = ?1 AND active = 1 ORDER BY created_at",
            )?;
            let ids = stmt
                .query_map(params![actor_id.to_string()], |row| uuid_at(row, 0))?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(ids)
        })
        .await
    }

    async fn add_membership(&self, actor_id: Uuid, project_id: Uuid) -> StoreResult<()> {
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO memberships (actor_id, project_id, active, created_at)
                 VALUES (?1, ?2, 1, ?3)
                 ON CONFLICT(actor_id, project_id) DO UPDATE SET active = 1",
                params![actor_id.to_string(), project_id.to_string(), now_string()],
            )?;
            Ok(())
        })
        .await
    }

    async fn list_projects(&self, ids: &[Uuid]) -> StoreResult<Vec<Project>> {
        let ids = id_list(ids);
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, description, owner_id, created_at FROM projects
                 WHERE id IN (SELECT value FROM json_each(?1)) ORDER BY name",
            )?;
            let projects = stmt
                .query_map(params![ids], row_to_project)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(projects)
        })
        .await
    }

    async fn get_project(&self, id: Uuid) -> StoreResult<Option<Project>> {
        self.with_conn(move |conn| {
            Ok(conn
                .query_row(
                    "SELECT id, name, description, owner_id, created_at FROM projects WHERE id = ?1",
                    params![id.to_string()],
                    row_to_project,
                )
                .optional()?)
        })
        .await
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
        let row = project.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO projects (id, name, description, owner_id, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    row.id.to_string(),
                    row.name,
                    row.description,
                    row.owner_id.to_string(),
                    row.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
        self.add_membership(owner_id, project.id).await?;
        Ok(project)
    }

    async fn create_entity(&self, entity: NewEntity) -> StoreResult<Entity> {
        let id = Uuid::new_v4();
        let properties = serde_json::to_string(&entity.properties)?;
        self.with_conn(move |conn| {
            let now = now_string();
            conn.execute(
                "INSERT INTO entities (id, project_id, kind, title, body, properties, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
                params![
                    id.to_string(),
                    entity.project_id.to_string(),
                    entity.kind,
                    entity.title,
                    entity.body,
                    properties,
                    now,
                ],
            )?;
            load_entity(conn, id)?.ok_or(StoreError::NotFound {
                entity: "entity",
                id,
            })
        })
        .await
    }

    async fn get_entity(&self, id: Uuid) -> StoreResult<Option<Entity>> {
        self.with_conn(move |conn| load_entity(conn, id)).await
    }

    async fn update_entity(&self, id: Uuid, patch: EntityPatch) -> StoreResult<Entity> {
        let properties = patch
            .properties
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.with_conn(move |conn| {
            let changed = conn.execute(
                "UPDATE entities SET title = COALESCE(?1, title), body = COALESCE(?2, body),
                     properties = COALESCE(?3, properties), updated_at = ?4
                 WHERE id = ?5",
                params![patch.title, patch.body, properties, now_string(), id.to_string()],
            )?;
            touched(changed, "entity", id)?;
            load_entity(conn, id)?.ok_or(StoreError::NotFound {
                entity: "entity",
                id,
            })
        })
        .await
    }

    async fn list_entities(
        &self,
        project_ids: &[Uuid],
        kind: Option<&str>,
    ) -> StoreResult<Vec<Entity>> {
        let ids = id_list(project_ids);
        let kind = kind.map(str::to_string);
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM entities
                 WHERE project_id IN (SELECT value FROM json_each(?1))
                   AND (?2 IS NULL OR kind = ?2)
                 ORDER BY created_at",
                ENTITY_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let entities = stmt
                .query_map(params![ids, kind], row_to_entity)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entities)
        })
        .await
    }

    async fn search_entities(
        &self,
        project_ids: &[Uuid],
        query: &str,
        limit: usize,
    ) -> StoreResult<Vec<Entity>> {
        let ids = id_list(project_ids);
        let pattern = format!("%{}%", query.to_lowercase());
        self.with_conn(move |conn| {
            let sql = format!(
                "SELECT {} FROM entities
                 WHERE project_id IN (SELECT value FROM json_each(?1))
                   AND (lower(title) LIKE ?2 OR lower(COALESCE(body, '')) LIKE ?2)
                 ORDER BY created_at LIMIT ?3",
                ENTITY_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let entities = stmt
                .query_map(params![ids, pattern, limit as i64], row_to_entity)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entities)
        })
        .await
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
        let row = edge.clone();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT INTO edges (id, project_id, source_id, target_id, relation, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    row.id.to_string(),
                    row.project_id.to_string(),
                    row.source_id.to_string(),
                    row.target_id.to_string(),
                    row.relation,
                    row.created_at.to_rfc3339(),
                ],
            )?;
            Ok(())
        })
        .await?;
        Ok(edge)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{enqueue_run, SuccessAssessment};
    use serde_json::json;

    async fn temp_store() -> (tempfile::TempDir, SqliteStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteStore::open(&dir.path().join("nested").join("arbor.db"))
            .await
            .unwrap();
        (dir, store)
    }

    fn new_run() -> NewRun {
        NewRun {
            actor_id: Uuid::new_v4(),
            objective: "Plan the spring garden".to_string(),
            workspace_id: Uuid::new_v4(),
            scope: RunScope::Global,
        }
    }

    #[tokio::test]
    async fn test_run_and_root_round_trip() {
        let (_dir, store) = temp_store().await;
        let (run, root) = enqueue_run(&store, new_run()).await.unwrap();

        let loaded = store.get_run(run.id).await.unwrap().unwrap();
        assert_eq!(loaded.status, RunStatus::Queued);
        assert_eq!(loaded.root_node_id, Some(root.id));
        assert_eq!(loaded.scope, RunScope::Global);

        let running = store
            .update_run_status(run.id, RunStatus::Running, None)
            .await
            .unwrap();
        assert!(running.started_at.is_some());
        let stopped = store
            .update_run_status(run.id, RunStatus::Stopped, Some("budget exceeded"))
            .await
            .unwrap();
        assert_eq!(stopped.terminal_message.as_deref(), Some("budget exceeded"));
        assert!(stopped.ended_at.is_some());
    }

    #[tokio::test]
    async fn test_node_status_and_result_persist() {
        let (_dir, store) = temp_store().await;
        let (_, root) = enqueue_run(&store, new_run()).await.unwrap();

        let executing = store
            .update_node_status(root.id, NodeStatus::Executing, RoleState::Executor)
            .await
            .unwrap();
        assert_eq!(executing.role_state, RoleState::Executor);
        assert!(executing.started_at.is_some());

        let envelope = ResultEnvelope {
            kind: ArtifactKind::Json,
            summary: "ok".to_string(),
            success_assessment: SuccessAssessment {
                met: true,
                notes: "fine".to_string(),
            },
            primary_artifact_id: None,
            artifact_ids: vec![],
            document_ids: vec![],
            json_payload: Some(json!({"a": 1})),
            scratchpad_doc_id: None,
            scratchpad_tail: String::new(),
        };
        store.set_node_result(root.id, &envelope).await.unwrap();
        store
            .update_node_status(root.id, NodeStatus::Completed, RoleState::Executor)
            .await
            .unwrap();

        let loaded = store.get_node(root.id).await.unwrap().unwrap();
        assert_eq!(loaded.result, Some(envelope));
        assert!(loaded.ended_at.is_some());

        let err = store
            .update_node_status(root.id, NodeStatus::Failed, RoleState::Executor)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_children_ordered_by_position() {
        let (_dir, store) = temp_store().await;
        let (run, root) = enqueue_run(&store, new_run()).await.unwrap();
        for (band, step) in [(1, 0), (0, 1), (0, 0)] {
            store
                .create_node(NewNode {
                    run_id: run.id,
                    parent_node_id: Some(root.id),
                    title: format!("{}-{}", band, step),
                    reason: String::new(),
                    success_criteria: vec!["done".to_string()],
                    depth: 1,
                    band_index: Some(band),
                    step_index: Some(step),
                    context: json!({}),
                })
                .await
                .unwrap();
        }
        let titles: Vec<String> = store
            .list_children(root.id)
            .await
            .unwrap()
            .into_iter()
            .map(|n| n.title)
            .collect();
        assert_eq!(titles, vec!["0-0", "0-1", "1-0"]);
    }

    #[tokio::test]
    async fn test_plan_versions_and_event_seq() {
        let (_dir, store) = temp_store().await;
        let (run, root) = enqueue_run(&store, new_run()).await.unwrap();

        assert_eq!(store.insert_plan(root.id, vec![]).await.unwrap().version, 1);
        assert_eq!(store.insert_plan(root.id, vec![]).await.unwrap().version, 2);

        for i in 0..4 {
            store
                .append_event(run.id, Some(root.id), "node_status", json!({"i": i}))
                .await
                .unwrap();
        }
        let seqs: Vec<i64> = store
            .list_events(run.id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_domain_entities_scoped_by_project() {
        let (_dir, store) = temp_store().await;
        let actor = Uuid::new_v4();
        let garden = store.create_project(actor, "Garden", None).await.unwrap();
        let other = store.create_project(Uuid::new_v4(), "Other", None).await.unwrap();

        assert_eq!(store.active_memberships(actor).await.unwrap(), vec![garden.id]);

        for (project, title) in [(garden.id, "Plant tomatoes"), (other.id, "Tomato sauce")] {
            store
                .create_entity(NewEntity {
                    project_id: project,
                    kind: "task".to_string(),
                    title: title.to_string(),
                    body: None,
                    properties: json!({}),
                })
                .await
                .unwrap();
        }

        let hits = store
            .search_entities(&[garden.id], "TOMATO", 10)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Plant tomatoes");

        let updated = store
            .update_entity(
                hits[0].id,
                EntityPatch {
                    body: Some("south bed".to_string()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.title, "Plant tomatoes");
        assert_eq!(updated.body.as_deref(), Some("south bed"));

        let tasks = store.list_entities(&[garden.id, other.id], Some("task")).await.unwrap();
        assert_eq!(tasks.len(), 2);
        let projects = store.list_projects(&[garden.id, other.id]).await.unwrap();
        assert_eq!(projects[0].name, "Garden");
    }
}
