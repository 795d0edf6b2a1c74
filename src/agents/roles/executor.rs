//! Executor role: complete a leaf node, optionally through one batch of
//! tool calls followed by a final answer.

use serde::Deserialize;
use serde_json::{json, Value};

use super::{
    decode, normalize_result, result_properties, scratchpad_schema, NodeBrief, RawResult,
    RawScratchpad, ARTIFACT_RULES, RESULT_REQUIRED,
};
use crate::agents::artifacts::{ParentHintDraft, ResultDraft};
use crate::agents::context::RunContext;
use crate::agents::types::OrchestratorError;
use crate::llm::{LlmRequest, LlmRole};
use crate::tools::{ToolCall, ToolOutcome};
use crate::util::truncate_chars;

/// First call: actions allowed.
pub const STEP_SCHEMA_NAME: &str = "executor_step";
/// Second call, after tool results: no actions.
pub const FINAL_SCHEMA_NAME: &str = "executor_final";

const TOOL_RESULT_CHARS: usize = 4000;

#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorDecision {
    pub actions: Vec<ToolCall>,
    pub result: ResultDraft,
    pub parent_hint: Option<ParentHintDraft>,
    pub scratchpad_append: String,
}

#[derive(Debug, Deserialize)]
struct RawAction {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    tool: String,
    #[serde(default)]
    args: Value,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDecision {
    #[serde(default)]
    actions: Vec<RawAction>,
    result: RawResult,
    #[serde(default)]
    parent_hint: Option<ParentHintDraft>,
    #[serde(default)]
    scratchpad: RawScratchpad,
}

pub fn schema(allow_actions: bool) -> Value {
    let mut result = serde_json::Map::new();
    result.insert("type".into(), json!("object"));
    result.insert("properties".into(), Value::Object(result_properties()));
    result.insert("required".into(), json!(RESULT_REQUIRED));

    let mut properties = serde_json::Map::new();
    if allow_actions {
        properties.insert(
            "actions".into(),
            json!({
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "type": { "type": "string", "enum": ["tool_call"] },
                        "tool": { "type": "string" },
                        "args": { "type": "object" }
                    },
                    "required": ["type", "tool", "args"]
                }
            }),
        );
    }
    properties.insert("result".into(), Value::Object(result));
    properties.insert(
        "parentHint".into(),
        json!({
            "type": "object",
            "properties": {
                "mode": { "type": "string", "enum": ["read_documents", "read_json"] },
                "artifactLabels": { "type": "array", "items": { "type": "string" } }
            },
            "required": ["mode", "artifactLabels"]
        }),
    );
    properties.insert("scratchpad".into(), scratchpad_schema());

    json!({
        "type": "object",
        "properties": properties,
        "required": ["result", "scratchpad"]
    })
}

pub fn system_prompt(tools_guide: &str, allow_actions: bool, max_actions: usize) -> String {
    let mut prompt = String::from(
        "You are the executor of one leaf node in a recursive task tree. Produce the node's result: \
a `kind`, a one-paragraph `summary`, an honest `successAssessment` against the success criteria, \
and any artifacts worth keeping.\n\n",
    );
    prompt.push_str(ARTIFACT_RULES);
    prompt.push_str(
        "\nUse `parentHint` to tell the parent whether to read your documents or your JSON.\n\n",
    );
    if allow_actions {
        prompt.push_str(&format!(
            "You may request up to {} tool calls in `actions`. They run in order and you will be \
called once more with their results; the `result` you give now is a draft. Leave `actions` empty \
when no tool is needed.\n\nAvailable tools:\n{}\n",
            max_actions, tools_guide
        ));
    } else {
        prompt.push_str(
            "Tool results are below. No further tool calls are possible; give the final result.\n",
        );
    }
    prompt
}

fn render_tool_results(outcomes: &[ToolOutcome]) -> String {
    let mut out = String::from("\nTool results:\n");
    for (index, outcome) in outcomes.iter().enumerate() {
        let body = match (&outcome.result, &outcome.error) {
            (_, Some(error)) => format!("error: {}", error),
            (Some(result), None) => truncate_chars(&result.to_string(), TOOL_RESULT_CHARS),
            (None, None) => "ok".to_string(),
        };
        out.push_str(&format!(
            "{}. `{}` ({}): {}\n",
            index + 1,
            outcome.tool,
            if outcome.ok { "ok" } else { "failed" },
            body
        ));
    }
    out
}

pub fn user_prompt(brief: &NodeBrief, tool_results: Option<&[ToolOutcome]>) -> String {
    let mut prompt = brief.render();
    if let Some(outcomes) = tool_results {
        prompt.push_str(&render_tool_results(outcomes));
    }
    prompt.push_str("\nComplete this node.");
    prompt
}

/// Validate a raw executor answer. With `allow_actions == false` any actions are dropped.
pub fn normalize(value: &Value, allow_actions: bool) -> Result<ExecutorDecision, OrchestratorError> {
    let raw: RawDecision = decode(LlmRole::Executor, value)?;

    let mut actions = Vec::with_capacity(raw.actions.len());
    for action in raw.actions {
        if action.kind != "tool_call" {
            return Err(OrchestratorError::malformed(
                LlmRole::Executor,
                format!("unsupported action type '{}'", action.kind),
            ));
        }
        actions.push(ToolCall {
            tool: action.tool,
            args: action.args,
        });
    }
    if !allow_actions && !actions.is_empty() {
        tracing::warn!(
            count = actions.len(),
            "Executor requested actions after tool results, ignoring"
        );
        actions.clear();
    }

    Ok(ExecutorDecision {
        actions,
        result: normalize_result(LlmRole::Executor, raw.result)?,
        parent_hint: raw.parent_hint,
        scratchpad_append: raw.scratchpad.append_markdown,
    })
}

/// Call the executor. `tool_results` switches to the final, action-free call.
pub async fn execute(
    ctx: &RunContext,
    brief: &NodeBrief,
    tool_results: Option<&[ToolOutcome]>,
) -> Result<ExecutorDecision, OrchestratorError> {
    let allow_actions = tool_results.is_none();
    let request = LlmRequest {
        role: LlmRole::Executor,
        system_prompt: system_prompt(
            &ctx.tools.tools_guide(),
            allow_actions,
            ctx.config.max_executor_tool_calls,
        ),
        user_prompt: user_prompt(brief, tool_results),
        schema_name: if allow_actions {
            STEP_SCHEMA_NAME
        } else {
            FINAL_SCHEMA_NAME
        },
        schema: schema(allow_actions),
    };
    let output = ctx.call_llm(&request).await?;
    normalize(&output, allow_actions)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::HintMode;
    use std::collections::BTreeMap;

    fn result() -> Value {
        json!({
            "kind": "summary",
            "summary": "done",
            "successAssessment": {"met": true, "notes": ""},
            "artifacts": []
        })
    }

    #[test]
    fn test_actions_become_tool_calls() {
        let decision = normalize(
            &json!({
                "actions": [{"type": "tool_call", "tool": "list_projects", "args": {}}],
                "result": result(),
                "parentHint": {"mode": "read_json", "artifactLabels": []},
                "scratchpad": {"appendMarkdown": "listing"}
            }),
            true,
        )
        .unwrap();
        assert_eq!(decision.actions.len(), 1);
        assert_eq!(decision.actions[0].tool, "list_projects");
        assert_eq!(decision.parent_hint.unwrap().mode, HintMode::ReadJson);
    }

    #[test]
    fn test_unknown_action_type_is_malformed() {
        let err = normalize(
            &json!({"actions": [{"type": "shell", "tool": "ls"}], "result": result()}),
            true,
        )
        .unwrap_err();
        assert!(err.to_string().contains("unsupported action type"));
    }

    #[test]
    fn test_final_call_drops_actions() {
        let decision = normalize(
            &json!({
                "actions": [{"type": "tool_call", "tool": "list_projects", "args": {}}],
                "result": result()
            }),
            false,
        )
        .unwrap();
        assert!(decision.actions.is_empty());
    }

    #[test]
    fn test_missing_result_is_malformed() {
        let err = normalize(&json!({"scratchpad": {"appendMarkdown": ""}}), true).unwrap_err();
        assert!(matches!(err, OrchestratorError::MalformedOutput { .. }));
    }

    #[test]
    fn test_final_schema_has_no_actions() {
        assert!(schema(true)["properties"].get("actions").is_some());
        assert!(schema(false)["properties"].get("actions").is_none());
    }

    #[test]
    fn test_tool_results_rendered_in_prompt() {
        let brief = NodeBrief {
            objective: "obj".to_string(),
            title: "leaf".to_string(),
            reason: String::new(),
            success_criteria: vec![],
            depth: 1,
            context: json!({}),
            context_label: "global".to_string(),
            scratchpad_tail: String::new(),
        };
        let outcomes = vec![ToolOutcome {
            tool: "get_project".to_string(),
            ok: false,
            result: None,
            error: Some("unauthorized project_id".to_string()),
            artifacts: BTreeMap::new(),
        }];
        let prompt = user_prompt(&brief, Some(&outcomes));
        assert!(prompt.contains("`get_project` (failed): error: unauthorized project_id"));
    }
}
