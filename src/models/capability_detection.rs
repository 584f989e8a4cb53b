//! Per-model parameter quirks.
//!
//! Some models reject parameters their siblings accept. Lookup consults the
//! configured override table first and falls back to name-prefix heuristics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenLimitParam {
    MaxTokens,
    MaxCompletionTokens,
}

impl TokenLimitParam {
    pub fn field(&self) -> &'static str {
        match self {
            TokenLimitParam::MaxTokens => "max_tokens",
            TokenLimitParam::MaxCompletionTokens => "max_completion_tokens",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelQuirks {
    pub supports_temperature: bool,
    pub token_limit_param: TokenLimitParam,
    pub supports_reasoning: bool,
}

impl Default for ModelQuirks {
    fn default() -> Self {
        Self {
            supports_temperature: true,
            token_limit_param: TokenLimitParam::MaxTokens,
            supports_reasoning: false,
        }
    }
}

impl ModelQuirks {
    /// The temperature to forward, if the model accepts one.
    pub fn temperature(&self, requested: Option<f32>) -> Option<f32> {
        match requested {
            Some(value) if self.supports_temperature => Some(value),
            Some(value) => {
                debug!("Dropping temperature {} for a model that does not accept it", value);
                None
            }
            None => None,
        }
    }
}

/// Override table keyed by `provider:model`, bare `model`, or a prefix ending in `*`.
#[derive(Debug, Clone, Default)]
pub struct QuirkTable {
    overrides: BTreeMap<String, ModelQuirks>,
}

impl QuirkTable {
    pub fn new(overrides: impl IntoIterator<Item = (String, ModelQuirks)>) -> Self {
        Self {
            overrides: overrides.into_iter().collect(),
        }
    }

    pub fn lookup(&self, provider: &str, model: &str) -> ModelQuirks {
        self.configured(provider, model)
            .unwrap_or_else(|| heuristic(provider, model))
    }

    fn configured(&self, provider: &str, model: &str) -> Option<ModelQuirks> {
        let qualified = format!("{}:{}", provider, model);
        if let Some(quirks) = self.overrides.get(&qualified).or_else(|| self.overrides.get(model)) {
            return Some(*quirks);
        }

        // Longest matching prefix wins
        self.overrides
            .iter()
            .filter_map(|(key, quirks)| {
                let prefix = key.strip_suffix('*')?;
                let matches = qualified.starts_with(prefix) || model.starts_with(prefix);
                matches.then_some((prefix.len(), *quirks))
            })
            .max_by_key(|(len, _)| *len)
            .map(|(_, quirks)| quirks)
    }
}

fn heuristic(provider: &str, model: &str) -> ModelQuirks {
    let name = model.rsplit('/').next().unwrap_or(model).to_ascii_lowercase();

    match provider {
        "openai" => {
            let reasoning_family = ["o1", "o3", "o4", "gpt-5"]
                .iter()
                .any(|family| name == *family || name.starts_with(&format!("{}-", family)));
            if reasoning_family {
                ModelQuirks {
                    supports_temperature: false,
                    token_limit_param: TokenLimitParam::MaxCompletionTokens,
                    supports_reasoning: true,
                }
            } else {
                ModelQuirks::default()
            }
        }
        "anthropic" => ModelQuirks {
            supports_reasoning: !name.starts_with("claude-3-") || name.starts_with("claude-3-7"),
            ..ModelQuirks::default()
        },
        "gemini" => ModelQuirks {
            supports_reasoning: name.contains("2.5") || name.starts_with("gemini-3"),
            ..ModelQuirks::default()
        },
        "ollama" => ModelQuirks {
            supports_reasoning: ["deepseek-r1", "qwq", "qwen3", "gpt-oss", "magistral"]
                .iter()
                .any(|family| name.starts_with(family)),
            ..ModelQuirks::default()
        },
        _ => ModelQuirks::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_openai_reasoning_models() {
        let table = QuirkTable::default();

        let quirks = table.lookup("openai", "o3-mini");
        assert!(!quirks.supports_temperature);
        assert_eq!(quirks.token_limit_param.field(), "max_completion_tokens");
        assert_eq!(quirks.temperature(Some(0.7)), None);

        assert!(!table.lookup("openai", "gpt-5").supports_temperature);
        assert!(!table.lookup("openai", "o1").supports_temperature);

        let quirks = table.lookup("openai", "gpt-4o");
        assert!(quirks.supports_temperature);
        assert_eq!(quirks.token_limit_param, TokenLimitParam::MaxTokens);
        assert_eq!(quirks.temperature(Some(0.7)), Some(0.7));
        // Not a family match
        assert!(table.lookup("openai", "o1x").supports_temperature);
    }

    #[test]
    fn test_overrides_take_precedence() {
        let table = QuirkTable::new([
            (
                "gpt-5-chat*".to_string(),
                ModelQuirks::default(),
            ),
            (
                "openai:custom-model".to_string(),
                ModelQuirks {
                    supports_temperature: false,
                    ..ModelQuirks::default()
                },
            ),
        ]);

        assert!(table.lookup("openai", "gpt-5-chat-latest").supports_temperature);
        assert!(!table.lookup("openai", "gpt-5-mini").supports_temperature);
        assert!(!table.lookup("openai", "custom-model").supports_temperature);
        assert!(table.lookup("ollama", "custom-model").supports_temperature);
    }

    #[test]
    fn test_reasoning_support_by_family() {
        let table = QuirkTable::default();
        assert!(table.lookup("anthropic", "claude-sonnet-4-20250514").supports_reasoning);
        assert!(table.lookup("anthropic", "claude-3-7-sonnet-latest").supports_reasoning);
        assert!(!table.lookup("anthropic", "claude-3-5-haiku-latest").supports_reasoning);
        assert!(table.lookup("gemini", "gemini-2.5-flash").supports_reasoning);
        assert!(table.lookup("ollama", "deepseek-r1:8b").supports_reasoning);
        assert!(!table.lookup("ollama", "llama3.2").supports_reasoning);
    }
}
