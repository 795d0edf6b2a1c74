//! LLM capability used by the orchestrator.
//!
//! The orchestrator only ever asks for one thing: "given a role, a system prompt,
//! a user prompt and a JSON schema, return a JSON value matching the schema".
//! Retries and provider quirks stay behind [`StructuredLlm`]; OpenRouter is the
//! shipped implementation.

mod error;
mod openrouter;

pub use error::{classify_http_status, LlmError, LlmErrorKind, RetryConfig};
pub use openrouter::OpenRouterClient;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Which of the three structured roles a call is made for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LlmRole {
    Planner,
    Executor,
    Aggregator,
}

impl LlmRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Planner => "planner",
            Self::Executor => "executor",
            Self::Aggregator => "aggregator",
        }
    }
}

impl std::fmt::Display for LlmRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One structured-output call.
#[derive(Debug, Clone)]
pub struct LlmRequest {
    pub role: LlmRole,
    pub system_prompt: String,
    pub user_prompt: String,
    /// Name sent alongside the schema (providers require one)
    pub schema_name: &'static str,
    /// JSON schema the output must satisfy
    pub schema: Value,
}

/// Usage report for a single call.
///
/// # Invariants
/// - `total_tokens == prompt_tokens + completion_tokens` when built via [`LlmUsage::new`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LlmUsage {
    pub model: String,
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

impl LlmUsage {
    /// Build a usage record, deriving cost from the pricing table when known.
    pub fn new(model: impl Into<String>, prompt_tokens: u64, completion_tokens: u64) -> Self {
        let model = model.into();
        let cost = crate::cost::usage_cost(&model, prompt_tokens, completion_tokens)
            .unwrap_or_default();
        Self {
            model,
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            input_cost: cost.input_cost,
            output_cost: cost.output_cost,
            total_cost: cost.total_cost,
        }
    }
}

/// Result of a structured-output call.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// Parsed JSON output (not yet validated against role semantics)
    pub output: Value,
    /// Usage, if the provider reported it
    pub usage: Option<LlmUsage>,
}

/// The opaque LLM capability.
#[async_trait]
pub trait StructuredLlm: Send + Sync {
    /// Run one structured-output call.
    ///
    /// Implementations own retry and failover; an `Err` here is final for the
    /// orchestration layer.
    async fn call(&self, request: &LlmRequest) -> anyhow::Result<LlmResponse>;
}
