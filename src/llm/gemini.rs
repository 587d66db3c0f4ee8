// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Google Gemini `generateContent` client

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::{prepare_images, HttpTransport, LlmClient, LlmMessage};
use crate::Result;

pub struct GeminiClient {
    transport: HttpTransport,
    base_url: String,
    model: String,
    api_key: String,
    temperature: f32,
}

#[derive(Deserialize, Default)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Value>,
}

impl GeminiClient {
    pub fn new(base_url: &str, model: &str, api_key: String, temperature: f32, transport: HttpTransport) -> Self {
        let mut base_url = base_url.to_string();
        if !base_url.ends_with('/') {
            base_url.push('/');
        }
        Self {
            transport,
            base_url,
            model: model.to_string(),
            api_key,
            temperature,
        }
    }

    fn headers(&self) -> [(&'static str, String); 1] {
        [("X-goog-api-key", self.api_key.clone())]
    }

    fn build_body(&self, message: &LlmMessage) -> Value {
        let mut parts: Vec<Value> = prepare_images(&message.images)
            .into_iter()
            .map(|data| json!({"inlineData": {"mimeType": "image/png", "data": data}}))
            .collect();
        if !message.text.is_empty() {
            parts.push(json!({"text": message.text}));
        }

        json!({
            "contents": [{"role": "user", "parts": parts}],
            "safety_settings": [{
                "category": "HARM_CATEGORY_DANGEROUS_CONTENT",
                "threshold": "BLOCK_LOW_AND_ABOVE"
            }],
            "generation_config": {
                "temperature": self.temperature,
                "topP": 0.95,
                "topK": 40
            }
        })
    }
}

/// Join the text of every candidate part, skipping malformed entries
fn extract_text(response: &GenerateContentResponse) -> String {
    let mut texts = Vec::new();

    for candidate in &response.candidates {
        let Some(parts) = candidate.get("content").and_then(|c| c.get("parts")).and_then(Value::as_array) else {
            warn!("Missing or invalid 'content.parts' in candidate: {}", candidate);
            continue;
        };
        for part in parts {
            match part.get("text").and_then(Value::as_str) {
                Some(text) => texts.push(text),
                None => warn!("Unexpected part structure: {}", part),
            }
        }
    }

    texts.join("\n")
}

#[async_trait]
impl LlmClient for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, message: &LlmMessage) -> Result<String> {
        let url = format!("{}{}:generateContent", self.base_url, self.model);
        debug!("Sending request to Gemini: model={}", self.model);

        let body = self.build_body(message);
        let response: GenerateContentResponse = self.transport.post_json(&url, &self.headers(), &body).await?;
        Ok(extract_text(&response))
    }

    async fn health_check(&self) -> Result<()> {
        let url = format!("{}{}", self.base_url, self.model);
        self.transport.get_ok(&url, &self.headers(), Duration::from_secs(10)).await
    }
}
