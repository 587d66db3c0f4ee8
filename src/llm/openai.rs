// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! OpenAI Chat Completions client

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use super::{prepare_images, HttpTransport, LlmClient, LlmMessage};
use crate::Result;

pub struct OpenAiClient {
    transport: HttpTransport,
    base_url: String,
    model: String,
    api_key: String,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    #[serde(default)]
    message: ChatMessage,
}

#[derive(Deserialize, Default)]
struct ChatMessage {
    #[serde(default)]
    content: Value,
}

impl OpenAiClient {
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
        [("Authorization", format!("Bearer {}", self.api_key))]
    }

    fn build_body(&self, message: &LlmMessage) -> Value {
        let mut content = Vec::new();
        if !message.text.is_empty() {
            content.push(json!({"type": "text", "text": message.text}));
        }
        for data in prepare_images(&message.images) {
            content.push(json!({
                "type": "image_url",
                "image_url": {"url": format!("data:image/png;base64,{}", data)}
            }));
        }

        json!({
            "model": self.model,
            "messages": [{"role": "user", "content": content}],
            "temperature": self.temperature,
            "top_p": 0.95
        })
    }
}

/// Text of the first choice; content may be a string or a list of parts
fn extract_text(response: ChatResponse) -> String {
    let Some(choice) = response.choices.into_iter().next() else {
        warn!("No choices in OpenAI response");
        return String::new();
    };

    match choice.message.content {
        Value::String(text) => text,
        Value::Array(parts) => parts
            .iter()
            .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    fn name(&self) -> &str {
        "openai"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, message: &LlmMessage) -> Result<String> {
        let url = format!("{}chat/completions", self.base_url);
        debug!("Sending request to OpenAI: model={}", self.model);

        let response: ChatResponse = self
            .transport
            .post_json(&url, &self.headers(), &self.build_body(message))
            .await?;
        Ok(extract_text(response))
    }

    async fn health_check(&self) -> Result<()> {
        let url = format!("{}models", self.base_url);
        self.transport.get_ok(&url, &self.headers(), Duration::from_secs(10)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn string_content_is_returned_verbatim() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {"role": "assistant", "content": "[]"}}]
        })).unwrap();
        assert_eq!(extract_text(response), "[]");
    }

    #[test]
    fn text_parts_are_joined() {
        let response: ChatResponse = serde_json::from_value(json!({
            "choices": [{"message": {"content": [
                {"type": "text", "text": "a"},
                {"type": "refusal", "refusal": "no"},
                {"type": "text", "text": "b"}
            ]}}]
        })).unwrap();
        assert_eq!(extract_text(response), "a\nb");
    }

    #[test]
    fn empty_choices_give_empty_text() {
        let response: ChatResponse = serde_json::from_value(json!({"choices": []})).unwrap();
        assert_eq!(extract_text(response), "");
    }
}
