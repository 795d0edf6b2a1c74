//! The three structured LLM roles.
//!
//! Each role owns a fixed response schema, a prompt builder, and a
//! normalization step that turns raw JSON into typed output or a
//! [`OrchestratorError::MalformedOutput`]. Normalization errors are not
//! recovered locally.

pub mod aggregator;
pub mod executor;
pub mod planner;

use std::collections::HashSet;

use serde::Deserialize;
use serde_json::{json, Value};

use super::artifacts::{ArtifactDraft, ResultDraft};
use super::context::RunContext;
use super::types::OrchestratorError;
use crate::llm::LlmRole;
use crate::store::{ArtifactKind, Node, SuccessAssessment};

/// Everything a role needs to know about the node it is called for.
#[derive(Debug, Clone)]
pub struct NodeBrief {
    pub objective: String,
    pub title: String,
    pub reason: String,
    pub success_criteria: Vec<String>,
    pub depth: u32,
    pub context: Value,
    pub context_label: String,
    pub scratchpad_tail: String,
}

impl NodeBrief {
    pub fn new(ctx: &RunContext, node: &Node, scratchpad_tail: String) -> Self {
        let context_label = match ctx.tools.context().project_id() {
            Some(project_id) => format!("project {}", project_id),
            None => "global".to_string(),
        };
        Self {
            objective: ctx.run.objective.clone(),
            title: node.title.clone(),
            reason: node.reason.clone(),
            success_criteria: node.success_criteria.clone(),
            depth: node.depth,
            context: node.context.clone(),
            context_label,
            scratchpad_tail,
        }
    }

    /// Common header for every role's user prompt.
    pub fn render(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("Run objective: {}\n", self.objective));
        out.push_str(&format!("Node title: {}\n", self.title));
        if !self.reason.is_empty() {
            out.push_str(&format!("Why this node exists: {}\n", self.reason));
        }
        out.push_str(&format!("Depth: {}\n", self.depth));
        out.push_str(&format!("Context: {}\n", self.context_label));
        if !self.success_criteria.is_empty() {
            out.push_str("Success criteria:\n");
            for criterion in &self.success_criteria {
                out.push_str(&format!("- {}\n", criterion));
            }
        }
        if self.context.as_object().map(|o| !o.is_empty()).unwrap_or(false) {
            out.push_str(&format!("Node context: {}\n", self.context));
        }
        if !self.scratchpad_tail.trim().is_empty() {
            out.push_str("\nScratchpad (most recent):\n");
            out.push_str(&self.scratchpad_tail);
            out.push('\n');
        }
        out
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawScratchpad {
    #[serde(default)]
    pub append_markdown: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawAssessment {
    pub met: bool,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawArtifact {
    #[serde(rename = "type")]
    pub kind: String,
    pub label: String,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub document_markdown: Option<String>,
    #[serde(default)]
    pub json_payload: Option<Value>,
    #[serde(default)]
    pub is_primary: bool,
}

/// Fields shared by the executor result and the aggregator output.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct RawResult {
    pub kind: String,
    pub summary: String,
    pub success_assessment: RawAssessment,
    #[serde(default)]
    pub artifacts: Vec<RawArtifact>,
    #[serde(default)]
    pub primary_artifact_label: Option<String>,
    #[serde(default)]
    pub json_payload: Option<Value>,
}

fn parse_kind(role: LlmRole, kind: &str) -> Result<ArtifactKind, OrchestratorError> {
    ArtifactKind::parse(kind)
        .ok_or_else(|| OrchestratorError::malformed(role, format!("unknown kind '{}'", kind)))
}

/// Decode `value` into `T`, mapping serde errors to malformed output.
pub(crate) fn decode<T: serde::de::DeserializeOwned>(
    role: LlmRole,
    value: &Value,
) -> Result<T, OrchestratorError> {
    serde_json::from_value(value.clone())
        .map_err(|e| OrchestratorError::malformed(role, e.to_string()))
}

pub(crate) fn normalize_result(
    role: LlmRole,
    raw: RawResult,
) -> Result<ResultDraft, OrchestratorError> {
    let kind = parse_kind(role, &raw.kind)?;
    let summary = raw.summary.trim().to_string();
    if summary.is_empty() {
        return Err(OrchestratorError::malformed(role, "empty summary"));
    }

    let mut labels = HashSet::new();
    let mut artifacts = Vec::with_capacity(raw.artifacts.len());
    for artifact in raw.artifacts {
        let artifact_kind = parse_kind(role, &artifact.kind)?;
        let label = artifact.label.trim().to_string();
        if label.is_empty() {
            return Err(OrchestratorError::malformed(role, "artifact without a label"));
        }
        if !labels.insert(label.clone()) {
            return Err(OrchestratorError::malformed(
                role,
                format!("duplicate artifact label '{}'", label),
            ));
        }
        match artifact_kind {
            ArtifactKind::Document if artifact.document_markdown.is_none() => {
                return Err(OrchestratorError::malformed(
                    role,
                    format!("document artifact '{}' has no documentMarkdown", label),
                ));
            }
            ArtifactKind::Json if artifact.json_payload.is_none() => {
                return Err(OrchestratorError::malformed(
                    role,
                    format!("json artifact '{}' has no jsonPayload", label),
                ));
            }
            _ => {}
        }
        artifacts.push(ArtifactDraft {
            kind: artifact_kind,
            label,
            title: artifact.title,
            document_markdown: artifact.document_markdown,
            json_payload: artifact.json_payload,
            is_primary: artifact.is_primary,
        });
    }

    Ok(ResultDraft {
        kind,
        summary,
        success_assessment: SuccessAssessment {
            met: raw.success_assessment.met,
            notes: raw.success_assessment.notes,
        },
        artifacts,
        primary_artifact_label: raw.primary_artifact_label,
        json_payload: raw.json_payload,
    })
}

pub(crate) fn scratchpad_schema() -> Value {
    json!({
        "type": "object",
        "properties": { "appendMarkdown": { "type": "string" } },
        "required": ["appendMarkdown"]
    })
}

/// Result shape shared by executor and aggregator schemas.
pub(crate) fn result_properties() -> serde_json::Map<String, Value> {
    let kinds = json!(["document", "json", "summary", "other"]);
    let mut props = serde_json::Map::new();
    props.insert("kind".into(), json!({ "type": "string", "enum": kinds }));
    props.insert("summary".into(), json!({ "type": "string" }));
    props.insert(
        "successAssessment".into(),
        json!({
            "type": "object",
            "properties": {
                "met": { "type": "boolean" },
                "notes": { "type": "string" }
            },
            "required": ["met", "notes"]
        }),
    );
    props.insert(
        "artifacts".into(),
        json!({
            "type": "array",
            "items": {
                "type": "object",
                "properties": {
                    "type": { "type": "string", "enum": kinds },
                    "label": { "type": "string" },
                    "title": { "type": "string" },
                    "documentMarkdown": { "type": "string" },
                    "jsonPayload": {},
                    "isPrimary": { "type": "boolean" }
                },
                "required": ["type", "label"]
            }
        }),
    );
    props.insert("primaryArtifactLabel".into(), json!({ "type": "string" }));
    props.insert("jsonPayload".into(), json!({}));
    props
}

pub(crate) const RESULT_REQUIRED: [&str; 4] = ["kind", "summary", "successAssessment", "artifacts"];

pub(crate) const ARTIFACT_RULES: &str = "\
Artifacts: `document` artifacts must carry `documentMarkdown`; `json` artifacts must carry \
`jsonPayload`. Labels must be unique within one answer. Name the main output with \
`primaryArtifactLabel`.";

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(value: Value) -> RawResult {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_rejects_empty_summary() {
        let err = normalize_result(
            LlmRole::Executor,
            raw(json!({"kind": "summary", "summary": "  ", "successAssessment": {"met": true}})),
        )
        .unwrap_err();
        assert!(err.to_string().contains("empty summary"));
    }

    #[test]
    fn test_rejects_duplicate_labels() {
        let err = normalize_result(
            LlmRole::Aggregator,
            raw(json!({
                "kind": "json",
                "summary": "s",
                "successAssessment": {"met": true, "notes": ""},
                "artifacts": [
                    {"type": "summary", "label": "a"},
                    {"type": "other", "label": "a"}
                ]
            })),
        )
        .unwrap_err();
        assert!(err.to_string().contains("duplicate artifact label"));
    }

    #[test]
    fn test_rejects_document_without_markdown() {
        let err = normalize_result(
            LlmRole::Executor,
            raw(json!({
                "kind": "document",
                "summary": "s",
                "successAssessment": {"met": false},
                "artifacts": [{"type": "document", "label": "report"}]
            })),
        )
        .unwrap_err();
        assert!(matches!(err, OrchestratorError::MalformedOutput { .. }));
    }

    #[test]
    fn test_rejects_unknown_kind() {
        let err = normalize_result(
            LlmRole::Executor,
            raw(json!({"kind": "poem", "summary": "s", "successAssessment": {"met": true}})),
        )
        .unwrap_err();
        assert!(err.to_string().contains("unknown kind"));
    }

    #[test]
    fn test_accepts_well_formed_result() {
        let draft = normalize_result(
            LlmRole::Executor,
            raw(json!({
                "kind": "json",
                "summary": " counted ",
                "successAssessment": {"met": true, "notes": "ok"},
                "artifacts": [{"type": "json", "label": "counts", "jsonPayload": {"n": 3}, "isPrimary": true}],
                "jsonPayload": {"n": 3}
            })),
        )
        .unwrap();
        assert_eq!(draft.kind, ArtifactKind::Json);
        assert_eq!(draft.summary, "counted");
        assert_eq!(draft.artifacts.len(), 1);
        assert!(draft.artifacts[0].is_primary);
    }
}
