//! Model and tool pricing registry (C1).
//!
//! Translates `(model_name, token counts)` and `(tool_name, I/O byte sizes)`
//! into a monetary cost. Never fails: unknown models resolve to a
//! configurable fallback rate, unknown tools resolve to zero cost.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::PolicyLoadError;

/// Pricing for a single model, in the table's currency per 1,000 tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelPricing {
    pub input_per_1k: f64,
    pub output_per_1k: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cached_input_per_1k: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reasoning_per_1k: Option<f64>,
}

impl Default for ModelPricing {
    fn default() -> Self {
        Self {
            input_per_1k: 0.0,
            output_per_1k: 0.0,
            cached_input_per_1k: None,
            reasoning_per_1k: None,
        }
    }
}

/// Pricing for a single tool.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ToolPricing {
    pub cost_per_call: f64,
    pub cost_per_input_byte: f64,
    pub cost_per_output_byte: f64,
}

/// Token and byte counts for a single priced event.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelUsage {
    pub prompt_tokens: u64,
    pub cached_tokens: u64,
    pub completion_tokens: u64,
    pub reasoning_tokens: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ToolUsage {
    pub input_bytes: u64,
    pub output_bytes: u64,
}

/// Deserialized shape of the `pricing:` configuration dictionary.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PricingDict {
    pub currency: String,
    pub fallback_input_per_1k: f64,
    pub fallback_output_per_1k: f64,
    pub models: HashMap<String, ModelPricing>,
    pub tools: HashMap<String, ToolPricing>,
}

/// C1 — Pricing Table.
///
/// Resolution order for a model: exact name match, then longest known-model
/// prefix match, then the fallback rate. Tool pricing defaults to zero when
/// unknown.
#[derive(Debug, Clone)]
pub struct PricingTable {
    currency: String,
    models: HashMap<String, ModelPricing>,
    tools: HashMap<String, ToolPricing>,
    fallback: ModelPricing,
}

impl PricingTable {
    /// Build a pricing table from a parsed configuration dictionary.
    ///
    /// Rejects ambiguous prefixes: if two configured model names are such
    /// that one is a proper prefix of the other, a query could match either
    /// depending only on which the implementation happens to visit first,
    /// so ambiguous prefixes are rejected at load time instead.
    pub fn from_dict(dict: PricingDict) -> Result<Self, PolicyLoadError> {
        let names: Vec<&String> = dict.models.keys().collect();
        for (i, a) in names.iter().enumerate() {
            for b in names.iter().skip(i + 1) {
                let (shorter, longer) = if a.len() <= b.len() { (a, b) } else { (b, a) };
                if longer.to_lowercase().starts_with(shorter.to_lowercase().as_str()) {
                    return Err(PolicyLoadError::AmbiguousPricingPrefix((*shorter).clone()));
                }
            }
        }

        Ok(Self {
            currency: dict.currency,
            models: dict.models,
            tools: dict.tools,
            fallback: ModelPricing {
                input_per_1k: dict.fallback_input_per_1k,
                output_per_1k: dict.fallback_output_per_1k,
                cached_input_per_1k: None,
                reasoning_per_1k: None,
            },
        })
    }

    /// An empty table with a zero fallback rate, useful for tests.
    pub fn empty() -> Self {
        Self {
            currency: "USD".to_string(),
            models: HashMap::new(),
            tools: HashMap::new(),
            fallback: ModelPricing::default(),
        }
    }
}

impl Default for PricingTable {
    fn default() -> Self {
        Self::empty()
    }
}

impl PricingTable {
    pub fn currency(&self) -> &str {
        &self.currency
    }

    /// Resolve pricing for `model_name`: exact match, else longest prefix
    /// match, else the fallback rate. Never fails.
    pub fn resolve_model(&self, model_name: &str) -> ModelPricing {
        let lower = model_name.to_lowercase();

        if let Some(p) = self.models.get(&lower) {
            return *p;
        }

        let mut best: Option<(&String, &ModelPricing)> = None;
        for (name, pricing) in &self.models {
            if lower.starts_with(name.to_lowercase().as_str()) {
                match best {
                    Some((best_name, _)) if best_name.len() >= name.len() => {}
                    _ => best = Some((name, pricing)),
                }
            }
        }

        best.map(|(_, p)| *p).unwrap_or(self.fallback)
    }

    /// Tool pricing, defaulting to all-zero when the tool is unknown.
    pub fn resolve_tool(&self, tool_name: &str) -> ToolPricing {
        self.tools.get(tool_name).copied().unwrap_or_default()
    }

    /// Cost of a model call.
    pub fn cost_of_model_call(&self, model_name: &str, usage: ModelUsage) -> f64 {
        let pricing = self.resolve_model(model_name);
        Self::apply_model_pricing(&pricing, usage)
    }

    /// Estimate-only variant: same formula, but callers must not record the
    /// result against any budget.
    pub fn estimate_model_call(&self, model_name: &str, usage: ModelUsage) -> f64 {
        self.cost_of_model_call(model_name, usage)
    }

    fn apply_model_pricing(pricing: &ModelPricing, usage: ModelUsage) -> f64 {
        let billable_input = usage.prompt_tokens.saturating_sub(usage.cached_tokens);
        let cached_rate = pricing.cached_input_per_1k.unwrap_or(pricing.input_per_1k);
        let reasoning_rate = pricing.reasoning_per_1k.unwrap_or(0.0);

        (billable_input as f64 / 1000.0) * pricing.input_per_1k
            + (usage.cached_tokens as f64 / 1000.0) * cached_rate
            + (usage.completion_tokens as f64 / 1000.0) * pricing.output_per_1k
            + (usage.reasoning_tokens as f64 / 1000.0) * reasoning_rate
    }

    /// Cost of a tool call.
    pub fn cost_of_tool_call(&self, tool_name: &str, usage: ToolUsage) -> f64 {
        let pricing = self.resolve_tool(tool_name);
        pricing.cost_per_call
            + usage.input_bytes as f64 * pricing.cost_per_input_byte
            + usage.output_bytes as f64 * pricing.cost_per_output_byte
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_dict() -> PricingDict {
        let mut models = HashMap::new();
        models.insert(
            "gpt-4o".to_string(),
            ModelPricing {
                input_per_1k: 2.5,
                output_per_1k: 10.0,
                cached_input_per_1k: None,
                reasoning_per_1k: None,
            },
        );
        models.insert(
            "claude-3-haiku".to_string(),
            ModelPricing {
                input_per_1k: 0.25,
                output_per_1k: 1.25,
                cached_input_per_1k: None,
                reasoning_per_1k: None,
            },
        );
        let mut tools = HashMap::new();
        tools.insert(
            "web_search".to_string(),
            ToolPricing {
                cost_per_call: 0.01,
                cost_per_input_byte: 0.0,
                cost_per_output_byte: 0.000001,
            },
        );
        PricingDict {
            currency: "USD".to_string(),
            fallback_input_per_1k: 30.0,
            fallback_output_per_1k: 60.0,
            models,
            tools,
        }
    }

    #[test]
    fn test_exact_match() {
        let table = PricingTable::from_dict(sample_dict()).unwrap();
        let p = table.resolve_model("claude-3-haiku");
        assert_eq!(p.input_per_1k, 0.25);
        assert_eq!(p.output_per_1k, 1.25);
    }

    #[test]
    fn test_longest_prefix_match_for_versioned_name() {
        let table = PricingTable::from_dict(sample_dict()).unwrap();
        let p = table.resolve_model("gpt-4o-2024-05-13");
        assert_eq!(p.input_per_1k, 2.5);
        assert_eq!(p.output_per_1k, 10.0);
    }

    #[test]
    fn test_s1_model_call_cost() {
        // spec.md S1: pricing (2.5, 10.0), prompt=1000, completion=500 -> 7.50
        let table = PricingTable::from_dict(sample_dict()).unwrap();
        let cost = table.cost_of_model_call(
            "gpt-4o",
            ModelUsage {
                prompt_tokens: 1000,
                cached_tokens: 0,
                completion_tokens: 500,
                reasoning_tokens: 0,
            },
        );
        assert!((cost - 7.5).abs() < 1e-9);
    }

    #[test]
    fn test_fallback_for_unknown_model() {
        let table = PricingTable::from_dict(sample_dict()).unwrap();
        let p = table.resolve_model("some-unreleased-model");
        assert_eq!(p.input_per_1k, 30.0);
        assert_eq!(p.output_per_1k, 60.0);
    }

    #[test]
    fn test_zero_tokens_is_exactly_zero() {
        let table = PricingTable::from_dict(sample_dict()).unwrap();
        let cost = table.cost_of_model_call("gpt-4o", ModelUsage::default());
        assert_eq!(cost, 0.0);
    }

    #[test]
    fn test_cached_tokens_use_cached_rate_when_set() {
        let mut models = HashMap::new();
        models.insert(
            "claude".to_string(),
            ModelPricing {
                input_per_1k: 3.0,
                output_per_1k: 15.0,
                cached_input_per_1k: Some(0.3),
                reasoning_per_1k: None,
            },
        );
        let table = PricingTable::from_dict(PricingDict {
            currency: "USD".to_string(),
            fallback_input_per_1k: 0.0,
            fallback_output_per_1k: 0.0,
            models,
            tools: HashMap::new(),
        })
        .unwrap();

        let cost = table.cost_of_model_call(
            "claude",
            ModelUsage {
                prompt_tokens: 1000,
                cached_tokens: 1000,
                completion_tokens: 0,
                reasoning_tokens: 0,
            },
        );
        // all tokens cached: 1000/1000 * 0.3 = 0.3
        assert!((cost - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_ambiguous_prefix_rejected_at_load_time() {
        let mut models = HashMap::new();
        models.insert("gpt-4".to_string(), ModelPricing::default());
        models.insert("gpt-4o".to_string(), ModelPricing::default());
        let dict = PricingDict {
            currency: "USD".to_string(),
            fallback_input_per_1k: 0.0,
            fallback_output_per_1k: 0.0,
            models,
            tools: HashMap::new(),
        };
        assert!(matches!(
            PricingTable::from_dict(dict),
            Err(PolicyLoadError::AmbiguousPricingPrefix(_))
        ));
    }

    #[test]
    fn test_tool_cost_formula() {
        let table = PricingTable::from_dict(sample_dict()).unwrap();
        let cost = table.cost_of_tool_call(
            "web_search",
            ToolUsage {
                input_bytes: 100,
                output_bytes: 2_000_000,
            },
        );
        // 0.01 + 0 + 2_000_000 * 0.000001 = 2.01
        assert!((cost - 2.01).abs() < 1e-9);
    }

    #[test]
    fn test_unknown_tool_defaults_to_zero() {
        let table = PricingTable::from_dict(sample_dict()).unwrap();
        let cost = table.cost_of_tool_call(
            "mystery_tool",
            ToolUsage {
                input_bytes: 1000,
                output_bytes: 1000,
            },
        );
        assert_eq!(cost, 0.0);
    }
}
