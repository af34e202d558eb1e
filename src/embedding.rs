//! Token-budget-aware batching for embedding providers.
//!
//! Providers bound both the token count and the item count per request;
//! the planner groups inputs into batches that respect both while
//! preserving input order, so concatenating the batches reproduces the
//! input list exactly.

use serde::{Deserialize, Serialize};

use crate::config::EMBEDDING_DEFAULT_MAX_TOKENS_ENV;

/// Rough character-to-token ratio used for budgeting.
pub const CHARS_PER_TOKEN: usize = 4;

/// Headroom subtracted from each model's max tokens, since the ratio is
/// an estimate.
pub const TOKEN_BUFFER: usize = 200;

/// Token cap for models absent from the built-in table (after the env
/// override).
pub const FALLBACK_MAX_TOKENS: usize = 8191;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum EmbeddingProvider {
    OpenAi,
    Google,
}

impl EmbeddingProvider {
    /// Provider-specific cap on items per request: 100 for the OpenAI
    /// family, 2048 for the Google family.
    pub fn max_batch_size(self) -> usize {
        match self {
            EmbeddingProvider::OpenAi => 100,
            EmbeddingProvider::Google => 2048,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmbeddingModelConfig {
    pub provider: EmbeddingProvider,
    pub model: String,
}

impl EmbeddingModelConfig {
    /// The model's max-tokens budget. Unknown models consult
    /// `SIDE_EMBEDDING_DEFAULT_MAX_TOKENS`, then the built-in default.
    pub fn max_tokens(&self) -> usize {
        match self.model.as_str() {
            "text-embedding-3-small" | "text-embedding-3-large" | "text-embedding-ada-002" => 8191,
            "text-embedding-004" | "text-embedding-005" => 2048,
            "gemini-embedding-001" => 8192,
            _ => std::env::var(EMBEDDING_DEFAULT_MAX_TOKENS_ENV)
                .ok()
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(FALLBACK_MAX_TOKENS),
        }
    }
}

fn estimate_tokens(input: &str) -> usize {
    input.chars().count().div_ceil(CHARS_PER_TOKEN)
}

/// Group `inputs` into provider-acceptable batches.
///
/// Each batch keeps its estimated token total under the model budget
/// (minus [`TOKEN_BUFFER`]) and its length under the provider's item
/// cap. Order is preserved; an input that alone exceeds the budget still
/// gets a singleton batch (the provider will reject it with a precise
/// error, which beats silently dropping it).
pub fn plan_batches(config: &EmbeddingModelConfig, inputs: &[String]) -> Vec<Vec<String>> {
    let token_budget = config.max_tokens().saturating_sub(TOKEN_BUFFER).max(1);
    let max_items = config.provider.max_batch_size();

    let mut batches: Vec<Vec<String>> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_tokens = 0usize;

    for input in inputs {
        let tokens = estimate_tokens(input);
        let over_budget = !current.is_empty() && current_tokens + tokens > token_budget;
        let over_count = current.len() >= max_items;
        if over_budget || over_count {
            batches.push(std::mem::take(&mut current));
            current_tokens = 0;
        }
        current_tokens += tokens;
        current.push(input.clone());
    }
    if !current.is_empty() {
        batches.push(current);
    }
    batches
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(provider: EmbeddingProvider, model: &str) -> EmbeddingModelConfig {
        EmbeddingModelConfig {
            provider,
            model: model.to_string(),
        }
    }

    fn inputs(n: usize, len: usize) -> Vec<String> {
        (0..n).map(|i| format!("{i:!<len$}")).collect()
    }

    #[test]
    fn concatenation_reproduces_the_input_list() {
        let cfg = config(EmbeddingProvider::Google, "text-embedding-004");
        let items = inputs(257, 120);
        let batches = plan_batches(&cfg, &items);
        let flattened: Vec<String> = batches.into_iter().flatten().collect();
        assert_eq!(flattened, items);
    }

    #[test]
    fn provider_item_caps_match_documented_limits() {
        assert_eq!(EmbeddingProvider::OpenAi.max_batch_size(), 100);
        assert_eq!(EmbeddingProvider::Google.max_batch_size(), 2048);
    }

    #[test]
    fn item_count_cap_is_respected() {
        let cfg = config(EmbeddingProvider::OpenAi, "text-embedding-3-small");
        // Tiny inputs: only the 100-item cap binds.
        let items = inputs(250, 4);
        let batches = plan_batches(&cfg, &items);
        assert_eq!(batches.len(), 3);
        assert!(batches.iter().all(|b| b.len() <= 100));
        assert_eq!(batches[0].len(), 100);
        assert_eq!(batches[2].len(), 50);
    }

    #[test]
    fn token_budget_binds_before_item_count() {
        let cfg = config(EmbeddingProvider::OpenAi, "text-embedding-3-small");
        // 8191 - 200 buffer ≈ 7991 tokens; each input is ~2000 tokens, so
        // batches hold 3 inputs.
        let items = inputs(7, 8000);
        let batches = plan_batches(&cfg, &items);
        assert_eq!(
            batches.iter().map(Vec::len).collect::<Vec<_>>(),
            vec![3, 3, 1]
        );
    }

    #[test]
    fn oversized_single_input_gets_its_own_batch() {
        let cfg = config(EmbeddingProvider::OpenAi, "text-embedding-3-small");
        let items = vec!["x".repeat(100_000), "small".to_string()];
        let batches = plan_batches(&cfg, &items);
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].len(), 1);
    }

    #[test]
    fn empty_input_yields_no_batches() {
        let cfg = config(EmbeddingProvider::OpenAi, "text-embedding-3-small");
        assert!(plan_batches(&cfg, &[]).is_empty());
    }

    #[test]
    fn unknown_model_falls_back_to_default_cap() {
        let cfg = config(EmbeddingProvider::OpenAi, "some-new-model");
        // Not asserting the env override here to keep the test hermetic;
        // the built-in fallback applies when the variable is unset.
        assert!(cfg.max_tokens() >= 2048);
    }
}
