//! Configuration management for the arbor worker.
//!
//! Configuration can be set via environment variables:
//! - `OPENROUTER_API_KEY` - Required for `process`. Your OpenRouter API key.
//! - `DEFAULT_MODEL` - Optional. Model used for every role. Defaults to `anthropic/claude-sonnet-4.5`.
//! - `PLANNER_MODEL`, `EXECUTOR_MODEL`, `AGGREGATOR_MODEL` - Optional per-role overrides.
//! - `ARBOR_DATABASE_PATH` - Optional. SQLite file. Defaults to `./data/arbor.db`.
//! - `ARBOR_BAND_PARALLELISM` - Optional. Children in flight per band. Defaults to `3`.
//! - `ARBOR_MAX_DEPTH` - Optional. Depth at which nodes must execute directly. Defaults to `4`.
//! - `ARBOR_DEFAULT_WALL_CLOCK_MS` - Optional. Budget for jobs that carry none. Defaults to 15 minutes.

use std::path::PathBuf;
use thiserror::Error;

use crate::llm::LlmRole;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Knobs of the node state machine.
///
/// Defaults match the production worker; tests construct this directly.
#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Children of one plan band that may run at the same time
    pub band_parallelism: usize,

    /// Nodes at or below this depth are forced to execute as leaves
    pub max_depth: u32,

    /// Hard cap for one `execute_tool_calls` batch
    pub max_batch_tool_calls: usize,

    /// Cap applied to the tool calls of a single executor pass
    pub max_executor_tool_calls: usize,

    /// Characters of scratchpad history handed to each role call
    pub scratchpad_tail_chars: usize,

    /// Characters of each child document included in the aggregation prompt
    pub child_document_chars: usize,

    /// Extra planner passes a node may take after an aggregator asks for it
    pub max_replans: u32,

    /// Wall-clock budget for jobs that do not carry one
    pub default_wall_clock_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            band_parallelism: 3,
            max_depth: 4,
            max_batch_tool_calls: 8,
            max_executor_tool_calls: 6,
            scratchpad_tail_chars: 2_000,
            child_document_chars: 4_000,
            max_replans: 1,
            default_wall_clock_ms: 15 * 60 * 1000,
        }
    }
}

/// Model selection per LLM role.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    pub default_model: String,
    pub planner_model: Option<String>,
    pub executor_model: Option<String>,
    pub aggregator_model: Option<String>,
}

impl ModelConfig {
    pub fn for_role(&self, role: LlmRole) -> &str {
        let specific = match role {
            LlmRole::Planner => self.planner_model.as_deref(),
            LlmRole::Executor => self.executor_model.as_deref(),
            LlmRole::Aggregator => self.aggregator_model.as_deref(),
        };
        specific.unwrap_or(&self.default_model)
    }
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            default_model: "anthropic/claude-sonnet-4.5".to_string(),
            planner_model: None,
            executor_model: None,
            aggregator_model: None,
        }
    }
}

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// OpenRouter API key (only needed when an LLM is actually called)
    pub api_key: Option<String>,

    /// Models per role
    pub models: ModelConfig,

    /// SQLite database file
    pub database_path: PathBuf,

    /// State machine settings
    pub orchestrator: OrchestratorConfig,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::InvalidValue` if a numeric variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_key = std::env::var("OPENROUTER_API_KEY")
            .ok()
            .filter(|k| !k.trim().is_empty());

        let default_model = std::env::var("DEFAULT_MODEL")
            .unwrap_or_else(|_| "anthropic/claude-sonnet-4.5".to_string());

        let models = ModelConfig {
            default_model,
            planner_model: std::env::var("PLANNER_MODEL").ok(),
            executor_model: std::env::var("EXECUTOR_MODEL").ok(),
            aggregator_model: std::env::var("AGGREGATOR_MODEL").ok(),
        };

        let database_path = std::env::var("ARBOR_DATABASE_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data/arbor.db"));

        let defaults = OrchestratorConfig::default();
        let orchestrator = OrchestratorConfig {
            band_parallelism: parse_env("ARBOR_BAND_PARALLELISM", defaults.band_parallelism)?.max(1),
            max_depth: parse_env("ARBOR_MAX_DEPTH", defaults.max_depth)?,
            default_wall_clock_ms: parse_env(
                "ARBOR_DEFAULT_WALL_CLOCK_MS",
                defaults.default_wall_clock_ms,
            )?,
            ..defaults
        };

        Ok(Self {
            api_key,
            models,
            database_path,
            orchestrator,
        })
    }

    /// Require the API key, for commands that talk to the LLM.
    pub fn require_api_key(&self) -> Result<&str, ConfigError> {
        self.api_key
            .as_deref()
            .ok_or_else(|| ConfigError::MissingEnvVar("OPENROUTER_API_KEY".to_string()))
    }
}

fn parse_env<T>(name: &str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::InvalidValue(name.to_string(), e.to_string())),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_role_model_falls_back_to_default() {
        let models = ModelConfig {
            executor_model: Some("openai/gpt-4o-mini".to_string()),
            ..ModelConfig::default()
        };
        assert_eq!(models.for_role(LlmRole::Executor), "openai/gpt-4o-mini");
        assert_eq!(
            models.for_role(LlmRole::Planner),
            "anthropic/claude-sonnet-4.5"
        );
    }

    #[test]
    fn test_orchestrator_defaults() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.band_parallelism, 3);
        assert_eq!(cfg.max_batch_tool_calls, 8);
        assert_eq!(cfg.max_executor_tool_calls, 6);
        assert_eq!(cfg.max_replans, 1);
    }
}
