//! OpenRouter structured-output client with automatic retry for transient errors.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::{Duration, Instant};

use super::error::{LlmError, RetryConfig};
use super::{LlmRequest, LlmResponse, LlmUsage, StructuredLlm};
use crate::config::ModelConfig;

const OPENROUTER_API_URL: &str = "https://openrouter.ai/api/v1/chat/completions";

/// OpenRouter API client.
///
/// Every call asks for a `json_schema` response format so the reply can be
/// parsed directly into the role's output value.
pub struct OpenRouterClient {
    client: Client,
    api_key: String,
    models: ModelConfig,
    retry_config: RetryConfig,
}

impl OpenRouterClient {
    /// Create a new client with default retry configuration.
    pub fn new(api_key: String, models: ModelConfig) -> Self {
        Self::with_retry_config(api_key, models, RetryConfig::default())
    }

    /// Create a new client with custom retry configuration.
    pub fn with_retry_config(api_key: String, models: ModelConfig, retry_config: RetryConfig) -> Self {
        Self {
            client: Client::new(),
            api_key,
            models,
            retry_config,
        }
    }

    /// Parse Retry-After header if present (seconds form only).
    fn parse_retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
        headers
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(|s| s.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Execute a single request without retry.
    async fn execute_request(&self, request: &OpenRouterRequest) -> Result<LlmResponse, LlmError> {
        let response = self
            .client
            .post(OPENROUTER_API_URL)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .header("X-Title", "arbor")
            .json(request)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    LlmError::network_error(format!("Request timeout: {}", e))
                } else if e.is_connect() {
                    LlmError::network_error(format!("Connection failed: {}", e))
                } else {
                    LlmError::network_error(format!("Request failed: {}", e))
                }
            })?;

        let status = response.status();
        let retry_after = Self::parse_retry_after(response.headers());
        let body = response
            .text()
            .await
            .map_err(|e| LlmError::network_error(format!("Failed to read response body: {}", e)))?;

        if !status.is_success() {
            return Err(LlmError::from_status(status.as_u16(), body, retry_after));
        }

        let parsed: OpenRouterResponse = serde_json::from_str(&body).map_err(|e| {
            LlmError::parse_error(format!("Failed to parse response: {}, body: {}", e, body))
        })?;

        let content = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| LlmError::parse_error("No content in response".to_string()))?;

        let output: Value = serde_json::from_str(strip_code_fence(&content)).map_err(|e| {
            LlmError::parse_error(format!("Structured output is not JSON: {}", e))
        })?;

        let model = parsed.model.unwrap_or_else(|| request.model.clone());
        let usage = parsed.usage.map(|u| u.into_usage(model));

        Ok(LlmResponse { output, usage })
    }

    /// Execute a request with automatic retry for transient errors.
    async fn execute_with_retry(&self, request: &OpenRouterRequest) -> anyhow::Result<LlmResponse> {
        let start = Instant::now();
        let mut attempt = 0;

        loop {
            let error = match self.execute_request(request).await {
                Ok(response) => {
                    if attempt > 0 {
                        tracing::info!(
                            "Request succeeded after {} retries (total time: {:?})",
                            attempt,
                            start.elapsed()
                        );
                    }
                    return Ok(response);
                }
                Err(error) => error,
            };

            if !self.retry_config.should_retry(&error, attempt) {
                tracing::error!(attempt, "LLM request failed: {}", error);
                return Err(anyhow::anyhow!("{}", error));
            }

            let remaining = self
                .retry_config
                .max_retry_duration
                .saturating_sub(start.elapsed());
            let delay = error.suggested_delay(attempt).min(remaining);
            if delay.is_zero() {
                tracing::warn!("Retry attempt {} failed, no time remaining: {}", attempt + 1, error);
                return Err(anyhow::anyhow!("{}", error));
            }

            tracing::warn!(
                "Retry attempt {} failed with {}, retrying in {:?}",
                attempt + 1,
                error.kind,
                delay
            );
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }
}

/// Some models wrap JSON in a markdown fence even in structured mode.
fn strip_code_fence(content: &str) -> &str {
    let trimmed = content.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim()
}

#[async_trait]
impl StructuredLlm for OpenRouterClient {
    async fn call(&self, request: &LlmRequest) -> anyhow::Result<LlmResponse> {
        let model = self.models.for_role(request.role).to_string();
        let body = OpenRouterRequest {
            model: model.clone(),
            messages: vec![
                Message {
                    role: "system",
                    content: request.system_prompt.clone(),
                },
                Message {
                    role: "user",
                    content: request.user_prompt.clone(),
                },
            ],
            response_format: ResponseFormat {
                format_type: "json_schema",
                json_schema: JsonSchemaFormat {
                    name: request.schema_name,
                    strict: false,
                    schema: request.schema.clone(),
                },
            },
            usage: UsageRequest { include: true },
        };

        tracing::debug!(role = %request.role, model = %model, "Sending structured request to OpenRouter");
        self.execute_with_retry(&body).await
    }
}

/// OpenRouter API request format.
#[derive(Debug, Serialize)]
struct OpenRouterRequest {
    model: String,
    messages: Vec<Message>,
    response_format: ResponseFormat,
    usage: UsageRequest,
}

#[derive(Debug, Serialize)]
struct Message {
    role: &'static str,
    content: String,
}

#[derive(Debug, Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    format_type: &'static str,
    json_schema: JsonSchemaFormat,
}

#[derive(Debug, Serialize)]
struct JsonSchemaFormat {
    name: &'static str,
    strict: bool,
    schema: Value,
}

#[derive(Debug, Serialize)]
struct UsageRequest {
    include: bool,
}

/// OpenRouter API response format.
#[derive(Debug, Deserialize)]
struct OpenRouterResponse {
    choices: Vec<OpenRouterChoice>,
    #[serde(default)]
    usage: Option<OpenRouterUsage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OpenRouterChoice {
    message: OpenRouterMessage,
}

#[derive(Debug, Deserialize)]
struct OpenRouterMessage {
    content: Option<String>,
}

/// Usage data (OpenAI-compatible, plus OpenRouter's `cost`).
#[derive(Debug, Deserialize)]
struct OpenRouterUsage {
    prompt_tokens: u64,
    completion_tokens: u64,
    #[serde(default)]
    cost: Option<f64>,
}

impl OpenRouterUsage {
    /// Priced from the local table when the model is known. Otherwise the
    /// provider-reported cost is split across input and output by token share.
    fn into_usage(self, model: String) -> LlmUsage {
        let mut usage = LlmUsage::new(model, self.prompt_tokens, self.completion_tokens);
        if usage.total_cost > 0.0 {
            return usage;
        }
        if let Some(reported) = self.cost {
            let input_share = if usage.total_tokens == 0 {
                0.0
            } else {
                usage.prompt_tokens as f64 / usage.total_tokens as f64
            };
            usage.input_cost = reported * input_share;
            usage.output_cost = reported - usage.input_cost;
            usage.total_cost = reported;
        }
        usage
    }
}
