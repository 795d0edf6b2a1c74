//! Typed tool invocations.
//!
//! An LLM tool call arrives as `{tool, args}`. It is decoded into exactly one
//! variant of [`ToolInvocation`] before anything is dispatched; names outside
//! the catalog become [`ToolInvocation::Unregistered`].

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::store::StoreError;

/// Errors at the tool boundary. Always reported back to the LLM as data.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("tool not allowed in this context")]
    NotAllowed,

    #[error("unauthorized project_id")]
    UnauthorizedProject,

    #[error("project_id is required in a global context")]
    MissingProject,

    #[error("invalid arguments for {tool}: {message}")]
    InvalidArguments { tool: String, message: String },

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("link endpoints must belong to the same project")]
    CrossProjectLink,

    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListProjectsArgs {}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateProjectArgs {
    pub name: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetProjectArgs {
    #[serde(default)]
    pub project_id: Option<Uuid>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ListEntitiesArgs {
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub kind: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateEntityArgs {
    #[serde(default)]
    pub project_id: Option<Uuid>,
    pub kind: String,
    pub title: String,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub properties: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct UpdateEntityArgs {
    pub entity_id: Uuid,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub body: Option<String>,
    #[serde(default)]
    pub properties: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SearchEntitiesArgs {
    pub query: String,
    #[serde(default)]
    pub project_id: Option<Uuid>,
    #[serde(default)]
    pub limit: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LinkEntitiesArgs {
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub relation: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CreateDocumentArgs {
    #[serde(default)]
    pub project_id: Option<Uuid>,
    pub title: String,
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GetDocumentArgs {
    pub document_id: Uuid,
}

/// One decoded tool call.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolInvocation {
    ListProjects(ListProjectsArgs),
    CreateProject(CreateProjectArgs),
    GetProject(GetProjectArgs),
    ListEntities(ListEntitiesArgs),
    CreateEntity(CreateEntityArgs),
    UpdateEntity(UpdateEntityArgs),
    SearchEntities(SearchEntitiesArgs),
    LinkEntities(LinkEntitiesArgs),
    CreateDocument(CreateDocumentArgs),
    GetDocument(GetDocumentArgs),
    Unregistered { name: String },
}

fn decode<T: DeserializeOwned>(tool: &str, args: &Value) -> Result<T, ToolError> {
    // Models often send `null` for "no arguments".
    let args = if args.is_null() {
        Value::Object(Default::default())
    } else {
        args.clone()
    };
    serde_json::from_value(args).map_err(|e| ToolError::InvalidArguments {
        tool: tool.to_string(),
        message: e.to_string(),
    })
}

impl ToolInvocation {
    /// Decode `args` against the argument struct registered for `name`.
    pub fn parse(name: &str, args: &Value) -> Result<Self, ToolError> {
        Ok(match name {
            "list_projects" => Self::ListProjects(decode(name, args)?),
            "create_project" => Self::CreateProject(decode(name, args)?),
            "get_project" => Self::GetProject(decode(name, args)?),
            "list_entities" => Self::ListEntities(decode(name, args)?),
            "create_entity" => Self::CreateEntity(decode(name, args)?),
            "update_entity" => Self::UpdateEntity(decode(name, args)?),
            "search_entities" => Self::SearchEntities(decode(name, args)?),
            "link_entities" => Self::LinkEntities(decode(name, args)?),
            "create_document" => Self::CreateDocument(decode(name, args)?),
            "get_document" => Self::GetDocument(decode(name, args)?),
            other => Self::Unregistered {
                name: other.to_string(),
            },
        })
    }

    pub fn name(&self) -> &str {
        match self {
            Self::ListProjects(_) => "list_projects",
            Self::CreateProject(_) => "create_project",
            Self::GetProject(_) => "get_project",
            Self::ListEntities(_) => "list_entities",
            Self::CreateEntity(_) => "create_entity",
            Self::UpdateEntity(_) => "update_entity",
            Self::SearchEntities(_) => "search_entities",
            Self::LinkEntities(_) => "link_entities",
            Self::CreateDocument(_) => "create_document",
            Self::GetDocument(_) => "get_document",
            Self::Unregistered { name } => name,
        }
    }
}
