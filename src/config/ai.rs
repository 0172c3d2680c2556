// src/config/ai.rs
use serde::{Deserialize, Serialize};
use std::env;

use crate::generate::{DEFAULT_MAX_TOKENS, DEFAULT_TEMPERATURE};

fn default_provider() -> String {
    "openai".into()
}
fn default_api_key() -> String {
    "ENV".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_temperature() -> f32 {
    DEFAULT_TEMPERATURE
}
fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}
fn default_timeout_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AiConfig {
    /// Only "openai" (any OpenAI-compatible endpoint) is supported.
    #[serde(default = "default_provider")]
    pub provider: String,
    /// "ENV" means: read from OPENAI_API_KEY
    #[serde(default = "default_api_key")]
    pub api_key: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Outbound proxy for the generation endpoint, e.g. `socks5://127.0.0.1:1080`.
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    /// Replaces the built-in editor persona.
    #[serde(default)]
    pub system_prompt: Option<String>,
}

impl Default for AiConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: default_api_key(),
            model: default_model(),
            base_url: default_base_url(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
            proxy: None,
            timeout_secs: default_timeout_secs(),
            system_prompt: None,
        }
    }
}

impl AiConfig {
    /// Normalize provider and clamp sampling settings into valid ranges.
    pub fn sanitize(&mut self) {
        self.provider = self.provider.trim().to_lowercase();
        if !(0.0..=2.0).contains(&self.temperature) {
            self.temperature = default_temperature();
        }
        if self.max_tokens == 0 {
            self.max_tokens = default_max_tokens();
        }
        if self.timeout_secs == 0 {
            self.timeout_secs = default_timeout_secs();
        }
    }

    /// The literal key, or OPENAI_API_KEY when configured as "ENV".
    pub fn resolve_api_key(&self) -> anyhow::Result<String> {
        if self.provider != "openai" {
            anyhow::bail!("Unsupported provider in config: {}", self.provider);
        }
        let key = if self.api_key.trim().eq_ignore_ascii_case("env") {
            env::var("OPENAI_API_KEY").map_err(|_| anyhow::anyhow!("Missing OPENAI_API_KEY env var"))?
        } else {
            self.api_key.trim().to_string()
        };
        if key.is_empty() {
            anyhow::bail!("OpenAI API key is empty");
        }
        Ok(key)
    }
}
