//! Tool system for the executor role.
//!
//! Tools are the only way an LLM touches domain data. The catalog is closed and
//! static: each tool declares the contexts it may run in, and everything that
//! talks to the LLM about tools (manifest, prompt guide) goes through the same
//! [`ToolRegistry::is_allowed`] predicate the executor enforces.

mod context;
pub mod domain;
mod invocation;

pub use context::{ToolCall, ToolExecutionContext, ToolOutcome};
pub use domain::DomainStore;
pub use invocation::*;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Kind of execution context a run operates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextType {
    Global,
    Project,
}

impl ContextType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Project => "project",
        }
    }
}

/// A resolved execution context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionContext {
    Global,
    Project(Uuid),
}

impl ExecutionContext {
    pub fn context_type(&self) -> ContextType {
        match self {
            Self::Global => ContextType::Global,
            Self::Project(_) => ContextType::Project,
        }
    }

    pub fn project_id(&self) -> Option<Uuid> {
        match self {
            Self::Global => None,
            Self::Project(id) => Some(*id),
        }
    }
}

/// Contexts a tool is offered in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolScope {
    /// Universal scope
    Any,
    Global,
    Project,
}

impl ToolScope {
    fn admits(&self, context: ContextType) -> bool {
        match self {
            ToolScope::Any => true,
            ToolScope::Global => context == ContextType::Global,
            ToolScope::Project => context == ContextType::Project,
        }
    }
}

/// Static description of one tool.
#[derive(Debug, Clone, Copy)]
pub struct ToolSpec {
    pub name: &'static str,
    pub contexts: &'static [ToolScope],
    pub description: &'static str,
    /// Argument shape shown to the LLM
    pub args: &'static str,
}

const CATALOG: &[ToolSpec] = &[
    ToolSpec {
        name: "list_projects",
        contexts: &[ToolScope::Global],
        description: "List every project you can access.",
        args: "{}",
    },
    ToolSpec {
        name: "create_project",
        contexts: &[ToolScope::Global],
        description: "Create a new project owned by the user.",
        args: r#"{"name": string, "description"?: string}"#,
    },
    ToolSpec {
        name: "get_project",
        contexts: &[ToolScope::Any],
        description: "Fetch one project.",
        args: r#"{"project_id"?: uuid}"#,
    },
    ToolSpec {
        name: "list_entities",
        contexts: &[ToolScope::Any],
        description: "List entities (tasks, goals, notes, ...), optionally filtered by kind.",
        args: r#"{"project_id"?: uuid, "kind"?: string}"#,
    },
    ToolSpec {
        name: "create_entity",
        contexts: &[ToolScope::Any],
        description: "Create an entity inside a project.",
        args: r#"{"project_id"?: uuid, "kind": string, "title": string, "body"?: string, "properties"?: object}"#,
    },
    ToolSpec {
        name: "update_entity",
        contexts: &[ToolScope::Any],
        description: "Update the title, body or properties of an entity.",
        args: r#"{"entity_id": uuid, "title"?: string, "body"?: string, "properties"?: object}"#,
    },
    ToolSpec {
        name: "search_entities",
        contexts: &[ToolScope::Any],
        description: "Case-insensitive text search over entity titles and bodies.",
        args: r#"{"query": string, "project_id"?: uuid, "limit"?: integer}"#,
    },
    ToolSpec {
        name: "link_entities",
        contexts: &[ToolScope::Any],
        description: "Link two entities of the same project with a named relation.",
        args: r#"{"source_id": uuid, "target_id": uuid, "relation": string}"#,
    },
    ToolSpec {
        name: "create_document",
        contexts: &[ToolScope::Any],
        description: "Create a markdown document in a project.",
        args: r#"{"project_id"?: uuid, "title": string, "content": string}"#,
    },
    ToolSpec {
        name: "get_document",
        contexts: &[ToolScope::Any],
        description: "Read a document.",
        args: r#"{"document_id": uuid}"#,
    },
];

/// The closed tool catalog.
pub struct ToolRegistry;

impl ToolRegistry {
    pub fn specs() -> &'static [ToolSpec] {
        CATALOG
    }

    pub fn get(name: &str) -> Option<&'static ToolSpec> {
        CATALOG.iter().find(|spec| spec.name == name)
    }

    /// True iff `name` is registered and one of its scopes admits `context`.
    pub fn is_allowed(name: &str, context: ContextType) -> bool {
        Self::get(name)
            .map(|spec| spec.contexts.iter().any(|scope| scope.admits(context)))
            .unwrap_or(false)
    }

    /// Names of the tools callable in `context`, in catalog order.
    pub fn allowed_tools(context: ContextType) -> Vec<&'static str> {
        CATALOG
            .iter()
            .filter(|spec| Self::is_allowed(spec.name, context))
            .map(|spec| spec.name)
            .collect()
    }

    /// Prompt-facing tool list for `context`.
    pub fn tools_guide(context: ContextType) -> String {
        let mut guide = String::new();
        for spec in CATALOG
            .iter()
            .filter(|spec| Self::is_allowed(spec.name, context))
        {
            guide.push_str(&format!(
                "- `{}`: {} Args: `{}`\n",
                spec.name, spec.description, spec.args
            ));
        }
        if guide.is_empty() {
            guide.push_str("(no tools available)\n");
        }
        guide
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_global_only_tools_hidden_in_project_context() {
        assert!(ToolRegistry::is_allowed("list_projects", ContextType::Global));
        assert!(!ToolRegistry::is_allowed("list_projects", ContextType::Project));
        assert!(ToolRegistry::is_allowed("create_entity", ContextType::Project));
        assert!(!ToolRegistry::is_allowed("delete_everything", ContextType::Global));
    }

    #[test]
    fn test_guide_lists_exactly_the_allowed_tools() {
        for context in [ContextType::Global, ContextType::Project] {
            let guide = ToolRegistry::tools_guide(context);
            for spec in ToolRegistry::specs() {
                let listed = guide.contains(&format!("`{}`", spec.name));
                assert_eq!(listed, ToolRegistry::is_allowed(spec.name, context), "{}", spec.name);
            }
        }
    }

    #[test]
    fn test_allowed_tools_in_project_context() {
        let tools = ToolRegistry::allowed_tools(ContextType::Project);
        assert!(!tools.contains(&"create_project"));
        assert_eq!(tools.len(), ToolRegistry::specs().len() - 2);
    }
}
