//! Aggregator role: merge child results into the parent's result, or ask
//! for one replan.

use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    decode, normalize_result, result_properties, scratchpad_schema, NodeBrief, RawResult,
    RawScratchpad, ARTIFACT_RULES, RESULT_REQUIRED,
};
use crate::agents::artifacts::ResultDraft;
use crate::agents::context::RunContext;
use crate::agents::types::OrchestratorError;
use crate::llm::{LlmRequest, LlmRole};
use crate::store::{Document, ResultEnvelope};
use crate::util::truncate_chars;

pub const SCHEMA_NAME: &str = "aggregator_result";

/// One completed child as presented to the aggregator.
#[derive(Debug, Clone)]
pub struct ChildReport {
    pub step_id: String,
    pub title: String,
    pub result: ResultEnvelope,
    pub documents: Vec<Document>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct AggregatorDecision {
    pub result: ResultDraft,
    pub should_replan: bool,
    pub replan_reason: Option<String>,
    pub scratchpad_append: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDecision {
    #[serde(flatten)]
    result: RawResult,
    #[serde(default)]
    should_replan: bool,
    #[serde(default)]
    replan_reason: Option<String>,
    #[serde(default)]
    scratchpad: RawScratchpad,
}

pub fn schema() -> Value {
    let mut properties = result_properties();
    properties.insert("shouldReplan".into(), json!({ "type": "boolean" }));
    properties.insert("replanReason".into(), json!({ "type": "string" }));
    properties.insert("scratchpad".into(), scratchpad_schema());

    let mut required: Vec<&str> = RESULT_REQUIRED.to_vec();
    required.extend(["shouldReplan", "scratchpad"]);

    json!({
        "type": "object",
        "properties": properties,
        "required": required
    })
}

pub fn system_prompt(can_replan: bool) -> String {
    let mut prompt = String::from(
        "You are the aggregator of a node in a recursive task tree. Every child step has finished. \
Combine their results into this node's result: a `kind`, a `summary`, an honest \
`successAssessment` against this node's success criteria, and the artifacts the parent needs. \
Do not copy child documents wholesale; synthesize.\n\n",
    );
    prompt.push_str(ARTIFACT_RULES);
    if can_replan {
        prompt.push_str(
            "\n\nIf the children clearly missed the goal and a different plan would fix it, set \
`shouldReplan: true` with a `replanReason`. This is allowed once.",
        );
    } else {
        prompt.push_str("\n\nReplanning is no longer possible; set `shouldReplan: false`.");
    }
    prompt
}

fn render_children(children: &[ChildReport], document_chars: usize) -> String {
    let mut out = String::from("\nChild results:\n");
    for (index, child) in children.iter().enumerate() {
        let result = &child.result;
        out.push_str(&format!(
            "\n## {}. {} (step `{}`)\nKind: {}\nCriteria met: {}\nSummary: {}\n",
            index + 1,
            child.title,
            child.step_id,
            result.kind.as_str(),
            result.success_assessment.met,
            result.summary
        ));
        if !result.success_assessment.notes.is_empty() {
            out.push_str(&format!("Notes: {}\n", result.success_assessment.notes));
        }
        if let Some(payload) = &result.json_payload {
            out.push_str(&format!(
                "JSON: {}\n",
                truncate_chars(&payload.to_string(), document_chars)
            ));
        }
        for document in &child.documents {
            out.push_str(&format!(
                "\n### Document: {}\n{}\n",
                document.title,
                truncate_chars(&document.content, document_chars)
            ));
        }
    }
    out
}

pub fn user_prompt(brief: &NodeBrief, children: &[ChildReport], document_chars: usize) -> String {
    format!(
        "{}{}\nAggregate the child results.",
        brief.render(),
        render_children(children, document_chars)
    )
}

pub fn normalize(value: &Value) -> Result<AggregatorDecision, OrchestratorError> {
    let raw: RawDecision = decode(LlmRole::Aggregator, value)?;
    Ok(AggregatorDecision {
        result: normalize_result(LlmRole::Aggregator, raw.result)?,
        should_replan: raw.should_replan,
        replan_reason: raw.replan_reason.filter(|r| !r.trim().is_empty()),
        scratchpad_append: raw.scratchpad.append_markdown,
    })
}

pub async fn aggregate(
    ctx: &RunContext,
    brief: &NodeBrief,
    children: &[ChildReport],
    can_replan: bool,
) -> Result<AggregatorDecision, OrchestratorError> {
    let request = LlmRequest {
        role: LlmRole::Aggregator,
        system_prompt: system_prompt(can_replan),
        user_prompt: user_prompt(brief, children, ctx.config.child_document_chars),
        schema_name: SCHEMA_NAME,
        schema: schema(),
    };
    let output = ctx.call_llm(&request).await?;
    normalize(&output)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{ArtifactKind, SuccessAssessment};
    use chrono::Utc;
    use uuid::Uuid;

    #[test]
    fn test_flattened_result_fields() {
        let decision = normalize(&json!({
            "kind": "document",
            "summary": "merged",
            "successAssessment": {"met": false, "notes": "thin"},
            "artifacts": [{"type": "document", "label": "report", "documentMarkdown": "# R"}],
            "primaryArtifactLabel": "report",
            "shouldReplan": true,
            "replanReason": "missing data",
            "scratchpad": {"appendMarkdown": "retry"}
        }))
        .unwrap();
        assert_eq!(decision.result.kind, ArtifactKind::Document);
        assert!(decision.should_replan);
        assert_eq!(decision.replan_reason.as_deref(), Some("missing data"));
        assert_eq!(decision.result.artifacts[0].label, "report");
    }

    #[test]
    fn test_should_replan_defaults_false() {
        let decision = normalize(&json!({
            "kind": "summary",
            "summary": "ok",
            "successAssessment": {"met": true},
            "artifacts": []
        }))
        .unwrap();
        assert!(!decision.should_replan);
    }

    #[test]
    fn test_child_documents_truncated() {
        let child = ChildReport {
            step_id: "s1".to_string(),
            title: "Research".to_string(),
            result: ResultEnvelope {
                kind: ArtifactKind::Document,
                summary: "found things".to_string(),
                success_assessment: SuccessAssessment {
                    met: true,
                    notes: String::new(),
                },
                primary_artifact_id: None,
                artifact_ids: vec![],
                document_ids: vec![],
                json_payload: None,
                scratchpad_doc_id: None,
                scratchpad_tail: String::new(),
            },
            documents: vec![Document {
                id: Uuid::new_v4(),
                project_id: Uuid::new_v4(),
                title: "Notes".to_string(),
                content: "x".repeat(50),
                created_at: Utc::now(),
                updated_at: Utc::now(),
            }],
        };
        let rendered = render_children(&[child], 10);
        assert!(rendered.contains("Research (step `s1`)"));
        assert!(!rendered.contains(&"x".repeat(11)));
    }

    #[test]
    fn test_replan_prompt_toggle() {
        assert!(system_prompt(true).contains("allowed once"));
        assert!(system_prompt(false).contains("no longer possible"));
    }
}
