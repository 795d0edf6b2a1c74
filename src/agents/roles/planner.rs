//! Planner role: decide between executing a node directly and splitting it
//! into banded steps.

use serde::Deserialize;
use serde_json::{json, Value};

use super::{decode, scratchpad_schema, NodeBrief, RawScratchpad};
use crate::agents::context::RunContext;
use crate::agents::types::OrchestratorError;
use crate::llm::{LlmRequest, LlmRole};

pub const SCHEMA_NAME: &str = "planner_decision";

/// A step proposed by the planner, before ids are assigned.
#[derive(Debug, Clone, PartialEq)]
pub struct ProposedStep {
    pub id: Option<String>,
    pub title: String,
    pub reason: String,
    pub success_criteria: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum PlannerMode {
    /// Run the node as a leaf.
    Execute { reason: Option<String> },
    /// Delegate to children; bands run in order, steps in a band concurrently.
    Plan { bands: Vec<Vec<ProposedStep>> },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlannerDecision {
    pub mode: PlannerMode,
    pub scratchpad_append: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawLeafDecision {
    #[serde(default)]
    reason: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawStep {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    title: Option<String>,
    #[serde(default)]
    reason: String,
    #[serde(default)]
    success_criteria: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RawBand {
    #[serde(default)]
    steps: Vec<RawStep>,
}

#[derive(Debug, Deserialize)]
struct RawPlan {
    #[serde(default)]
    bands: Vec<RawBand>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawDecision {
    mode: String,
    #[serde(default)]
    leaf_decision: Option<RawLeafDecision>,
    #[serde(default)]
    plan: Option<RawPlan>,
    #[serde(default)]
    scratchpad: RawScratchpad,
}

pub fn schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "mode": { "type": "string", "enum": ["execute", "plan"] },
            "leafDecision": {
                "type": "object",
                "properties": { "reason": { "type": "string" } }
            },
            "plan": {
                "type": "object",
                "properties": {
                    "bands": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "properties": {
                                "steps": {
                                    "type": "array",
                                    "items": {
                                        "type": "object",
                                        "properties": {
                                            "id": { "type": "string" },
                                            "title": { "type": "string" },
                                            "reason": { "type": "string" },
                                            "successCriteria": {
                                                "type": "array",
                                                "items": { "type": "string" }
                                            }
                                        },
                                        "required": ["title", "reason", "successCriteria"]
                                    }
                                }
                            },
                            "required": ["steps"]
                        }
                    }
                },
                "required": ["bands"]
            },
            "scratchpad": scratchpad_schema()
        },
        "required": ["mode", "scratchpad"]
    })
}

pub fn system_prompt(force_leaf: bool) -> String {
    let mut prompt = String::from(
        "You are the planner of a recursive task tree. For the node below, decide whether it can be \
completed directly with a handful of tool calls (`mode: \"execute\"`) or must be split into smaller \
steps (`mode: \"plan\"`).\n\n\
A plan is a list of bands. Bands run one after another; the steps inside one band run at the same \
time and must not depend on each other. Give every step a short title, the reason it exists and \
concrete success criteria. Prefer few steps; never restate the parent node as its own child.\n\n\
Record your reasoning for later passes in `scratchpad.appendMarkdown`.",
    );
    if force_leaf {
        prompt.push_str(
            "\n\nThis node is at the maximum depth. You must answer with `mode: \"execute\"`.",
        );
    }
    prompt
}

pub fn user_prompt(brief: &NodeBrief) -> String {
    format!("{}\nDecide how to handle this node.", brief.render())
}

/// Validate a raw planner answer.
pub fn normalize(value: &Value) -> Result<PlannerDecision, OrchestratorError> {
    let raw: RawDecision = decode(LlmRole::Planner, value)?;
    let mode = match raw.mode.as_str() {
        "execute" => PlannerMode::Execute {
            reason: raw.leaf_decision.and_then(|d| d.reason),
        },
        "plan" => {
            let plan = raw.plan.ok_or_else(|| {
                OrchestratorError::malformed(LlmRole::Planner, "mode=plan without a plan")
            })?;
            let mut bands = Vec::with_capacity(plan.bands.len());
            for band in plan.bands {
                let mut steps = Vec::with_capacity(band.steps.len());
                for step in band.steps {
                    let title = step
                        .title
                        .map(|t| t.trim().to_string())
                        .filter(|t| !t.is_empty())
                        .ok_or_else(|| {
                            OrchestratorError::malformed(LlmRole::Planner, "plan step without a title")
                        })?;
                    steps.push(ProposedStep {
                        id: step.id.map(|id| id.trim().to_string()).filter(|id| !id.is_empty()),
                        title,
                        reason: step.reason,
                        success_criteria: step.success_criteria,
                    });
                }
                if !steps.is_empty() {
                    bands.push(steps);
                }
            }
            if bands.is_empty() {
                tracing::warn!("Planner returned an empty plan, executing as leaf");
                PlannerMode::Execute { reason: None }
            } else {
                PlannerMode::Plan { bands }
            }
        }
        other => {
            return Err(OrchestratorError::malformed(
                LlmRole::Planner,
                format!("unknown mode '{}'", other),
            ))
        }
    };
    Ok(PlannerDecision {
        mode,
        scratchpad_append: raw.scratchpad.append_markdown,
    })
}

pub async fn plan(
    ctx: &RunContext,
    brief: &NodeBrief,
    force_leaf: bool,
) -> Result<PlannerDecision, OrchestratorError> {
    let request = LlmRequest {
        role: LlmRole::Planner,
        system_prompt: system_prompt(force_leaf),
        user_prompt: user_prompt(brief),
        schema_name: SCHEMA_NAME,
        schema: schema(),
    };
    let output = ctx.call_llm(&request).await?;
    normalize(&output)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execute_mode() {
        let decision = normalize(&json!({
            "mode": "execute",
            "leafDecision": {"reason": "small"},
            "scratchpad": {"appendMarkdown": "going direct"}
        }))
        .unwrap();
        assert_eq!(
            decision.mode,
            PlannerMode::Execute {
                reason: Some("small".to_string())
            }
        );
        assert_eq!(decision.scratchpad_append, "going direct");
    }

    #[test]
    fn test_plan_mode_drops_empty_bands() {
        let decision = normalize(&json!({
            "mode": "plan",
            "plan": {"bands": [
                {"steps": [{"id": "a", "title": "A", "reason": "r", "successCriteria": ["x"]}]},
                {"steps": []}
            ]},
            "scratchpad": {"appendMarkdown": ""}
        }))
        .unwrap();
        match decision.mode {
            PlannerMode::Plan { bands } => {
                assert_eq!(bands.len(), 1);
                assert_eq!(bands[0][0].id.as_deref(), Some("a"));
                assert_eq!(bands[0][0].success_criteria, vec!["x".to_string()]);
            }
            other => panic!("expected plan, got {:?}", other),
        }
    }

    #[test]
    fn test_plan_without_plan_is_malformed() {
        let err = normalize(&json!({"mode": "plan", "scratchpad": {"appendMarkdown": ""}}))
            .unwrap_err();
        assert!(err.to_string().contains("without a plan"));
    }

    #[test]
    fn test_unknown_mode_is_malformed() {
        let err = normalize(&json!({"mode": "think", "scratchpad": {"appendMarkdown": ""}}))
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::MalformedOutput { .. }));
    }

    #[test]
    fn test_step_without_title_is_malformed() {
        let err = normalize(&json!({
            "mode": "plan",
            "plan": {"bands": [{"steps": [{"reason": "r"}]}]}
        }))
        .unwrap_err();
        assert!(err.to_string().contains("without a title"));
    }

    #[test]
    fn test_empty_plan_becomes_leaf() {
        let decision = normalize(&json!({"mode": "plan", "plan": {"bands": []}})).unwrap();
        assert_eq!(decision.mode, PlannerMode::Execute { reason: None });
    }

    #[test]
    fn test_force_leaf_prompt() {
        assert!(system_prompt(true).contains("maximum depth"));
        assert!(!system_prompt(false).contains("maximum depth"));
    }
}
