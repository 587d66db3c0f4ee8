// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Language model clients
//!
//! Every provider sits behind [`LlmClient`]; the HTTP plumbing and retry
//! policy they share lives in [`HttpTransport`].

pub mod claude;
pub mod gemini;
pub mod ollama;
pub mod openai;

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use reqwest::{Client, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

use crate::config::{LlmConfig, Provider};
use crate::{AnalyserError, Result};

pub use claude::ClaudeClient;
pub use gemini::GeminiClient;
pub use ollama::OllamaClient;
pub use openai::OpenAiClient;

/// A single user turn: prompt text plus optional base64 PNG screenshots
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LlmMessage {
    pub text: String,
    pub images: Vec<String>,
}

impl LlmMessage {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            images: Vec::new(),
        }
    }

    pub fn with_image(mut self, image_base64: impl Into<String>) -> Self {
        self.images.push(image_base64.into());
        self
    }
}

/// Trait for language model backends
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Provider name for logs
    fn name(&self) -> &str;

    /// Model identifier sent with each request
    fn model(&self) -> &str;

    /// Send one message and return the generated text
    async fn generate(&self, message: &LlmMessage) -> Result<String>;

    /// Check the backend is reachable
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }
}

/// Remove line breaks and padding whitespace from a base64 payload
pub fn clean_base64(data: &str) -> String {
    data.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Clean every image and drop the ones that are not valid base64
pub fn prepare_images(images: &[String]) -> Vec<String> {
    images
        .iter()
        .map(|i| clean_base64(i))
        .filter(|i| {
            if i.is_empty() {
                return false;
            }
            match general_purpose::STANDARD.decode(i) {
                Ok(_) => true,
                Err(e) => {
                    warn!("Skipping screenshot that is not valid base64: {}", e);
                    false
                }
            }
        })
        .collect()
}

/// Retry behaviour shared by every HTTP backend
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Total attempts per request (at least one is always made)
    pub attempts: u32,
    /// Rate-limit waits grow as `base^attempt` seconds
    pub rate_limit_base: u64,
    pub max_backoff: Duration,
    /// Pause before retrying a connection failure or timeout
    pub transient_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            rate_limit_base: 30,
            max_backoff: Duration::from_secs(900),
            transient_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &LlmConfig) -> Self {
        Self {
            attempts: config.retries.max(1),
            max_backoff: Duration::from_secs(config.max_backoff_secs),
            ..Self::default()
        }
    }

    /// Wait before retrying after a 429 on the given zero-based attempt
    pub fn rate_limit_delay(&self, attempt: u32) -> Duration {
        let secs = self.rate_limit_base.saturating_pow(attempt);
        Duration::from_secs(secs).min(self.max_backoff)
    }
}

/// HTTP client plus retry loop
pub struct HttpTransport {
    client: Client,
    policy: RetryPolicy,
}

impl HttpTransport {
    pub fn new(timeout: Duration, policy: RetryPolicy) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, policy })
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    /// POST a JSON body and decode the JSON reply, retrying per the policy
    pub async fn post_json<B, T>(&self, url: &str, headers: &[(&str, String)], body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let attempts = self.policy.attempts.max(1);

        for attempt in 0..attempts {
            let is_last = attempt + 1 == attempts;

            match self.post_once(url, headers, body).await {
                Ok(value) => return Ok(value),
                Err(AnalyserError::RateLimited(msg)) if !is_last => {
                    let wait = self.policy.rate_limit_delay(attempt);
                    warn!("Rate limit exceeded ({}). Retrying in {:?}...", msg, wait);
                    tokio::time::sleep(wait).await;
                }
                Err(AnalyserError::Api(e)) if !is_last && is_transient(&e) => {
                    error!("Request failed on attempt {}: {}", attempt + 1, e);
                    tokio::time::sleep(self.policy.transient_delay).await;
                }
                Err(e) => {
                    error!("Request failed on attempt {}: {}", attempt + 1, e);
                    return Err(e);
                }
            }
        }

        Err(AnalyserError::LlmUnavailable(format!(
            "Failed to get a response after {} attempts",
            attempts
        )))
    }

    async fn post_once<B, T>(&self, url: &str, headers: &[(&str, String)], body: &B) -> Result<T>
    where
        B: Serialize + Sync,
        T: DeserializeOwned,
    {
        let mut request = self.client.post(url).json(body);
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        debug!("POST {}", url);
        let response = request.send().await?;
        let status = response.status();

        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(AnalyserError::RateLimited(format!("{} returned {}", url, status)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AnalyserError::LlmUnavailable(format!(
                "{} returned status {}: {}",
                url,
                status,
                truncate(&body, 500)
            )));
        }

        Ok(response.json().await?)
    }

    /// GET used by health checks; no retries
    pub async fn get_ok(&self, url: &str, headers: &[(&str, String)], timeout: Duration) -> Result<()> {
        let mut request = self.client.get(url).timeout(timeout);
        for (name, value) in headers {
            request = request.header(*name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| AnalyserError::LlmUnavailable(format!("Cannot connect to {}: {}", url, e)))?;

        if !response.status().is_success() {
            return Err(AnalyserError::LlmUnavailable(format!(
                "{} returned status {}",
                url,
                response.status()
            )));
        }
        Ok(())
    }
}

fn is_transient(e: &reqwest::Error) -> bool {
    e.is_connect() || e.is_timeout() || e.is_request()
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}

/// Build the client configured in `[llm]`
pub fn client_from_config(config: &LlmConfig) -> Result<Arc<dyn LlmClient>> {
    let timeout = Duration::from_secs(config.timeout_secs);
    let transport = HttpTransport::new(timeout, RetryPolicy::from_config(config))?;
    let base_url = config.base_url();

    let client: Arc<dyn LlmClient> = match config.provider {
        Provider::Ollama => Arc::new(OllamaClient::with_transport(
            &base_url,
            &config.model,
            config.temperature,
            transport,
        )),
        Provider::Gemini => Arc::new(GeminiClient::new(
            &base_url,
            &config.model,
            config.api_key()?,
            config.temperature,
            transport,
        )),
        Provider::Claude => Arc::new(ClaudeClient::new(&base_url, &config.model, config.api_key()?, transport)),
        Provider::OpenAi => Arc::new(OpenAiClient::new(
            &base_url,
            &config.model,
            config.api_key()?,
            config.temperature,
            transport,
        )),
    };

    Ok(client)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limit_delay_grows_and_caps() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.rate_limit_delay(0), Duration::from_secs(1));
        assert_eq!(policy.rate_limit_delay(1), Duration::from_secs(30));
        assert_eq!(policy.rate_limit_delay(2), Duration::from_secs(900));
        assert_eq!(policy.rate_limit_delay(3), Duration::from_secs(900));
    }

    #[test]
    fn zero_retries_still_makes_one_attempt() {
        let config = LlmConfig {
            retries: 0,
            ..LlmConfig::default()
        };
        assert_eq!(RetryPolicy::from_config(&config).attempts, 1);
    }

    #[test]
    fn clean_base64_strips_line_breaks() {
        assert_eq!(clean_base64(" aGVs\nbG8=\r\n"), "aGVsbG8=");
    }

    #[test]
    fn invalid_images_are_dropped() {
        let images = vec!["aGVs\nbG8=".to_string(), "***".to_string(), "  ".to_string()];
        assert_eq!(prepare_images(&images), vec!["aGVsbG8=".to_string()]);
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("héllo", 2), "hé");
        assert_eq!(truncate("hi", 10), "hi");
    }

    #[test]
    fn ollama_needs_no_key() {
        let config = LlmConfig {
            provider: Provider::Ollama,
            model: "llama3.2:3b".to_string(),
            ..LlmConfig::default()
        };
        let client = client_from_config(&config).unwrap();
        assert_eq!(client.name(), "ollama");
        assert_eq!(client.model(), "llama3.2:3b");
    }
}
