// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Configuration management for the regression analyser

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::str::FromStr;

use crate::prompt::{DEFAULT_API_TEMPLATE, DEFAULT_UI_TEMPLATE};

/// Main application configuration
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct AppConfig {
    /// Language model settings
    #[serde(default)]
    pub llm: LlmConfig,

    /// Batching and pacing of LLM requests
    #[serde(default)]
    pub batching: BatchingConfig,

    /// Prompt templates
    #[serde(default)]
    pub prompts: PromptConfig,

    /// Failure deduplication
    #[serde(default)]
    pub dedup: DedupConfig,

    /// Web UI settings
    #[serde(default)]
    pub web: WebConfig,

    /// Database settings
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Supported model providers
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Ollama,
    Gemini,
    Claude,
    OpenAi,
}

impl Provider {
    /// Base URL used when the config does not override it
    pub fn default_url(self) -> &'static str {
        match self {
            Provider::Ollama => "http://localhost:11434",
            Provider::Gemini => "https://generativelanguage.googleapis.com/v1beta/models/",
            Provider::Claude => "https://api.anthropic.com/v1/messages",
            Provider::OpenAi => "https://api.openai.com/v1/",
        }
    }

    /// Model used when only the provider is chosen
    pub fn default_model(self) -> &'static str {
        match self {
            Provider::Ollama => "llama3.2-vision",
            Provider::Gemini => "gemini-2.0-flash",
            Provider::Claude => "claude-3-5-sonnet-latest",
            Provider::OpenAi => "gpt-4o",
        }
    }

    /// Environment variable conventionally holding the provider's key
    pub fn default_key_env(self) -> &'static str {
        match self {
            Provider::Ollama => "",
            Provider::Gemini => "GEMINI_API_KEY",
            Provider::Claude => "CLAUDE_API_KEY",
            Provider::OpenAi => "OPENAI_API_KEY",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Provider::Ollama => "ollama",
            Provider::Gemini => "gemini",
            Provider::Claude => "claude",
            Provider::OpenAi => "openai",
        };
        f.write_str(name)
    }
}

impl FromStr for Provider {
    type Err = crate::AnalyserError;

    fn from_str(s: &str) -> crate::Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ollama" => Ok(Provider::Ollama),
            "gemini" => Ok(Provider::Gemini),
            "claude" | "anthropic" => Ok(Provider::Claude),
            "openai" => Ok(Provider::OpenAi),
            other => Err(crate::AnalyserError::Config(format!("Unknown LLM provider: {}", other))),
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: Provider,
    /// Overrides the provider's default endpoint
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    /// Name of the environment variable holding the API key
    #[serde(default)]
    pub api_key_env: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Upper bound for a single rate-limit backoff
    #[serde(default = "default_max_backoff")]
    pub max_backoff_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct BatchingConfig {
    /// Requests dispatched in parallel per group
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    /// Failures packed into one API-mode request
    #[serde(default = "default_max_items")]
    pub max_items_per_request: usize,
    /// Character budget for one API-mode request
    #[serde(default = "default_max_chars")]
    pub max_chars: usize,
    #[serde(default = "default_delay")]
    pub delay_between_batches_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct PromptConfig {
    #[serde(default = "default_api_prompt")]
    pub api: String,
    #[serde(default = "default_ui_prompt")]
    pub ui: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DedupConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Reuse analyses stored for failures seen in earlier runs
    #[serde(default = "default_true")]
    pub reuse_previous_analyses: bool,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WebConfig {
    #[serde(default = "default_web_host")]
    pub host: String,
    #[serde(default = "default_web_port")]
    pub port: u16,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

// Default value functions
fn default_provider() -> Provider { Provider::Gemini }
fn default_model() -> String { default_provider().default_model().to_string() }
fn default_timeout() -> u64 { 60 }
fn default_retries() -> u32 { 3 }
fn default_max_backoff() -> u64 { 900 }
fn default_temperature() -> f32 { 0.2 }
fn default_batch_size() -> usize { 25 }
fn default_max_items() -> usize { 5 }
fn default_max_chars() -> usize { 200_000 }
fn default_delay() -> u64 { 60 }
fn default_true() -> bool { true }
fn default_web_host() -> String { "127.0.0.1".to_string() }
fn default_web_port() -> u16 { 8080 }
fn default_db_path() -> String { "regression.db".to_string() }
fn default_api_prompt() -> String { DEFAULT_API_TEMPLATE.to_string() }
fn default_ui_prompt() -> String { DEFAULT_UI_TEMPLATE.to_string() }

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            url: None,
            model: default_model(),
            api_key_env: None,
            timeout_secs: default_timeout(),
            retries: default_retries(),
            max_backoff_secs: default_max_backoff(),
            temperature: default_temperature(),
        }
    }
}

impl LlmConfig {
    /// Endpoint to talk to, falling back to the provider default
    pub fn base_url(&self) -> String {
        self.url.clone().unwrap_or_else(|| self.provider.default_url().to_string())
    }

    /// Resolve the API key from the environment
    pub fn api_key(&self) -> crate::Result<String> {
        if self.provider == Provider::Ollama {
            return Ok(String::new());
        }
        let var = self.api_key_env.as_deref().unwrap_or(self.provider.default_key_env());
        std::env::var(var).map_err(|_| {
            crate::AnalyserError::Config(format!(
                "{} not found in environment; {} requests need an API key",
                var, self.provider
            ))
        })
    }
}

impl Default for BatchingConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_items_per_request: default_max_items(),
            max_chars: default_max_chars(),
            delay_between_batches_secs: default_delay(),
        }
    }
}

impl Default for PromptConfig {
    fn default() -> Self {
        Self {
            api: default_api_prompt(),
            ui: default_ui_prompt(),
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reuse_previous_analyses: true,
        }
    }
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            host: default_web_host(),
            port: default_web_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl AppConfig {
    /// Load configuration from a JSON file
    pub fn load(path: &Path) -> crate::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = serde_json::from_str(&content)
                .map_err(|e| crate::AnalyserError::Config(format!("Failed to parse config: {}", e)))?;
            config.validate()?;
            Ok(config)
        } else {
            tracing::info!("Config file not found at {:?}, using defaults", path);
            Ok(Self::default())
        }
    }

    /// Save configuration to a JSON file
    pub fn save(&self, path: &Path) -> crate::Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject values the batching loop cannot work with
    pub fn validate(&self) -> crate::Result<()> {
        if self.batching.batch_size == 0 {
            return Err(crate::AnalyserError::Config("batching.batch_size must be at least 1".to_string()));
        }
        if self.batching.max_items_per_request == 0 {
            return Err(crate::AnalyserError::Config(
                "batching.max_items_per_request must be at least 1".to_string(),
            ));
        }
        if self.batching.max_chars == 0 {
            return Err(crate::AnalyserError::Config("batching.max_chars must be positive".to_string()));
        }
        if self.llm.model.trim().is_empty() {
            return Err(crate::AnalyserError::Config("llm.model must not be empty".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_batching_constants() {
        let config = AppConfig::default();
        assert_eq!(config.batching.batch_size, 25);
        assert_eq!(config.batching.max_items_per_request, 5);
        assert_eq!(config.batching.max_chars, 200_000);
        assert_eq!(config.batching.delay_between_batches_secs, 60);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_fills_in_defaults() {
        let config: AppConfig = serde_json::from_str(
            r#"{"llm": {"provider": "claude", "model": "claude-sonnet"}, "batching": {"batch_size": 4}}"#,
        ).unwrap();
        assert_eq!(config.llm.provider, Provider::Claude);
        assert_eq!(config.llm.retries, 3);
        assert_eq!(config.batching.batch_size, 4);
        assert_eq!(config.batching.max_items_per_request, 5);
        assert_eq!(config.web.port, 8080);
        assert!(config.prompts.api.contains("failure_details"));
    }

    #[test]
    fn zero_batch_size_is_rejected() {
        let mut config = AppConfig::default();
        config.batching.batch_size = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn provider_parses_aliases() {
        assert_eq!("OpenAI".parse::<Provider>().unwrap(), Provider::OpenAi);
        assert_eq!("anthropic".parse::<Provider>().unwrap(), Provider::Claude);
        assert!("bard".parse::<Provider>().is_err());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::load(&dir.path().join("absent.json")).unwrap();
        assert_eq!(config.database.path, "regression.db");
    }
}
