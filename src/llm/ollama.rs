// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Ollama API client for local inference

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use super::{prepare_images, HttpTransport, LlmClient, LlmMessage, RetryPolicy};
use crate::{AnalyserError, Result};

/// Ollama API client
pub struct OllamaClient {
    transport: HttpTransport,
    base_url: String,
    model: String,
    temperature: f32,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    images: Option<Vec<String>>,
    options: GenerateOptions,
}

#[derive(Serialize)]
struct GenerateOptions {
    temperature: f32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    response: String,
}

#[derive(Deserialize)]
struct TagsResponse {
    models: Vec<ModelInfo>,
}

#[derive(Deserialize)]
struct ModelInfo {
    name: String,
}

/// Strip endpoint suffixes so either the root or a full endpoint URL works
fn normalize_url(base_url: &str) -> String {
    base_url
        .trim_end_matches('/')
        .replace("/api/generate", "")
        .replace("/api/chat", "")
}

impl OllamaClient {
    /// Create a new Ollama client with default timeout and retries
    pub fn new(base_url: &str, model: &str) -> Result<Self> {
        let transport = HttpTransport::new(Duration::from_secs(120), RetryPolicy::default())?;
        Ok(Self::with_transport(base_url, model, 0.2, transport))
    }

    pub fn with_transport(base_url: &str, model: &str, temperature: f32, transport: HttpTransport) -> Self {
        Self {
            transport,
            base_url: normalize_url(base_url),
            model: model.to_string(),
            temperature,
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// List available models
    pub async fn list_models(&self) -> Result<Vec<String>> {
        let url = format!("{}/api/tags", self.base_url);

        let response = self.transport
            .client()
            .get(&url)
            .timeout(Duration::from_secs(10))
            .send()
            .await?;

        let tags: TagsResponse = response.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Check if a specific model is available
    pub async fn model_available(&self, model: &str) -> Result<bool> {
        let models = self.list_models().await?;
        Ok(models.iter().any(|m| {
            m.starts_with(model) || m == &format!("{}:latest", model)
        }))
    }
}

#[async_trait]
impl LlmClient for OllamaClient {
    fn name(&self) -> &str {
        "ollama"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, message: &LlmMessage) -> Result<String> {
        let url = format!("{}/api/generate", self.base_url);
        let images = prepare_images(&message.images);

        let request = GenerateRequest {
            model: &self.model,
            prompt: &message.text,
            stream: false,
            images: if images.is_empty() { None } else { Some(images) },
            options: GenerateOptions {
                temperature: self.temperature,
            },
        };

        debug!("Sending request to Ollama: model={}", self.model);

        let result: GenerateResponse = self.transport.post_json(&url, &[], &request).await?;
        Ok(result.response)
    }

    async fn health_check(&self) -> Result<()> {
        let url = format!("{}/api/tags", self.base_url);
        self.transport
            .get_ok(&url, &[], Duration::from_secs(10))
            .await
            .map_err(|e| {
                AnalyserError::LlmUnavailable(format!("Cannot reach Ollama at {}: {}", self.base_url, e))
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_suffixes_are_normalized() {
        assert_eq!(normalize_url("http://localhost:11434/api/generate"), "http://localhost:11434");
        assert_eq!(normalize_url("http://localhost:11434/"), "http://localhost:11434");
    }

    #[test]
    fn images_are_omitted_when_absent() {
        let request = GenerateRequest {
            model: "llama3.2",
            prompt: "hi",
            stream: false,
            images: None,
            options: GenerateOptions { temperature: 0.2 },
        };
        let json = serde_json::to_value(&request).unwrap();
        assert!(json.get("images").is_none());
        assert_eq!(json["stream"], false);
    }
}
