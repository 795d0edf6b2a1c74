//! Cost calculation from token usage and model pricing.
//!
//! Providers do not always report per-call cost. When they only report tokens,
//! the dollar amounts recorded in run metrics come from this table.

/// Model pricing in nanodollars per token (1 USD = 1_000_000_000 nanodollars).
/// Using nanodollars avoids floating-point rounding while accumulating.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelPricing {
    /// Cost per input token in nanodollars
    pub input_nano_per_token: u64,
    /// Cost per output token in nanodollars
    pub output_nano_per_token: u64,
}

/// Dollar cost of one LLM call.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct UsageCost {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

/// Normalize model names to canonical form for pricing lookup.
///
/// Accepts provider-prefixed ids such as `anthropic/claude-sonnet-4.5`.
fn normalize_model(model: &str) -> &str {
    let trimmed = model.trim();
    let bare = trimmed.rsplit('/').next().unwrap_or(trimmed);

    match bare {
        s if s.contains("claude-3-5-sonnet") || s.contains("claude-3.5-sonnet") => {
            "claude-3-5-sonnet"
        }
        s if s.contains("claude-sonnet-4") || s.contains("claude-4-sonnet") => "claude-sonnet-4",
        s if s.contains("claude-3-5-haiku") || s.contains("claude-3.5-haiku") => "claude-3-5-haiku",
        s if s.contains("claude-haiku-4") => "claude-haiku-4",
        s if s.contains("claude-opus-4") || s.contains("claude-4-opus") => "claude-opus-4",

        s if s.contains("gpt-4o-mini") => "gpt-4o-mini",
        s if s.contains("gpt-4o") => "gpt-4o",
        s if s.contains("gpt-5-mini") => "gpt-5-mini",
        s if s.contains("gpt-5") => "gpt-5",

        s if s.contains("gemini-2.5-pro") || s.contains("gemini-2-5-pro") => "gemini-2.5-pro",
        s if s.contains("gemini-2.5-flash") || s.contains("gemini-2-5-flash") => "gemini-2.5-flash",

        other => other,
    }
}

/// Get pricing for a model. Returns None if model is unknown.
///
/// Prices are per 1M tokens converted to nanodollars per token:
/// $3/1M input = 3_000 nanodollars per token.
pub fn pricing_for_model(model: &str) -> Option<ModelPricing> {
    let (input, output) = match normalize_model(model) {
        "claude-3-5-sonnet" | "claude-sonnet-4" => (3_000, 15_000),
        "claude-3-5-haiku" => (800, 4_000),
        "claude-haiku-4" => (1_000, 5_000),
        "claude-opus-4" => (15_000, 75_000),
        "gpt-4o-mini" => (150, 600),
        "gpt-4o" => (2_500, 10_000),
        "gpt-5-mini" => (250, 2_000),
        "gpt-5" => (1_250, 10_000),
        "gemini-2.5-pro" => (1_250, 10_000),
        "gemini-2.5-flash" => (300, 2_500),
        _ => return None,
    };
    Some(ModelPricing {
        input_nano_per_token: input,
        output_nano_per_token: output,
    })
}

/// Dollar cost of `prompt_tokens` in and `completion_tokens` out on `model`.
///
/// Returns `None` for unknown models so callers can record zero cost explicitly.
pub fn usage_cost(model: &str, prompt_tokens: u64, completion_tokens: u64) -> Option<UsageCost> {
    let Some(pricing) = pricing_for_model(model) else {
        tracing::warn!(model = %model, "Unknown model for cost calculation");
        return None;
    };

    let input_nano = prompt_tokens.saturating_mul(pricing.input_nano_per_token);
    let output_nano = completion_tokens.saturating_mul(pricing.output_nano_per_token);

    let input_cost = input_nano as f64 / 1e9;
    let output_cost = output_nano as f64 / 1e9;
    Some(UsageCost {
        input_cost,
        output_cost,
        total_cost: input_nano.saturating_add(output_nano) as f64 / 1e9,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_model() {
        assert_eq!(normalize_model("anthropic/claude-sonnet-4.5"), "claude-sonnet-4");
        assert_eq!(normalize_model("claude-3.5-sonnet-latest"), "claude-3-5-sonnet");
        assert_eq!(normalize_model("openai/gpt-4o-2024-08-06"), "gpt-4o");
        assert_eq!(normalize_model("google/gemini-2.5-pro-preview"), "gemini-2.5-pro");
    }

    #[test]
    fn test_pricing_for_unknown_model() {
        assert!(pricing_for_model("unknown-model-xyz").is_none());
        assert!(usage_cost("unknown-model-xyz", 10, 10).is_none());
    }

    #[test]
    fn test_usage_cost_sonnet() {
        // $3/1M input, $15/1M output: 1M in + 100k out = $3 + $1.5
        let cost = usage_cost("anthropic/claude-sonnet-4.5", 1_000_000, 100_000).unwrap();
        assert!((cost.input_cost - 3.0).abs() < 1e-9);
        assert!((cost.output_cost - 1.5).abs() < 1e-9);
        assert!((cost.total_cost - 4.5).abs() < 1e-9);
    }
}
