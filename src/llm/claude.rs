// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025 Jonathan D. A. Jewell <hyperpolymath>

//! Anthropic Messages API client

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, error};

use super::{prepare_images, HttpTransport, LlmClient, LlmMessage};
use crate::Result;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const MAX_TOKENS: u32 = 4096;

pub struct ClaudeClient {
    transport: HttpTransport,
    url: String,
    model: String,
    api_key: String,
}

#[derive(Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ContentBlock>,
}

#[derive(Deserialize)]
struct ContentBlock {
    #[serde(default)]
    text: Option<String>,
}

impl ClaudeClient {
    pub fn new(url: &str, model: &str, api_key: String, transport: HttpTransport) -> Self {
        Self {
            transport,
            url: url.to_string(),
            model: model.to_string(),
            api_key,
        }
    }

    fn build_body(&self, message: &LlmMessage) -> Value {
        let mut content = vec![json!({"type": "text", "text": message.text.trim()})];
        content.extend(prepare_images(&message.images).into_iter().map(|data| {
            json!({
                "type": "image",
                "source": {"type": "base64", "media_type": "image/png", "data": data}
            })
        }));

        json!({
            "model": self.model,
            "max_tokens": MAX_TOKENS,
            "messages": [{"role": "user", "content": content}]
        })
    }
}

#[async_trait]
impl LlmClient for ClaudeClient {
    fn name(&self) -> &str {
        "claude"
    }

    fn model(&self) -> &str {
        &self.model
    }

    async fn generate(&self, message: &LlmMessage) -> Result<String> {
        debug!("Sending request to Claude: model={}", self.model);

        let headers = [
            ("anthropic-version", ANTHROPIC_VERSION.to_string()),
            ("x-api-key", self.api_key.clone()),
        ];
        let response: MessagesResponse = self
            .transport
            .post_json(&self.url, &headers, &self.build_body(message))
            .await?;

        match response.content.into_iter().next().and_then(|b| b.text) {
            Some(text) => Ok(text),
            None => {
                error!("Claude response had no text content");
                Ok(String::new())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::RetryPolicy;
    use std::time::Duration;

    #[test]
    fn body_carries_text_then_images() {
        let transport = HttpTransport::new(Duration::from_secs(5), RetryPolicy::default()).unwrap();
        let client = ClaudeClient::new("https://example.test/v1/messages", "claude-x", "k".to_string(), transport);
        let body = client.build_body(&LlmMessage::text("  explain  ").with_image("aGVsbG8="));

        assert_eq!(body["max_tokens"], 4096);
        let content = body["messages"][0]["content"].as_array().unwrap();
        assert_eq!(content[0]["text"], "explain");
        assert_eq!(content[1]["source"]["media_type"], "image/png");
    }

    #[test]
    fn first_text_block_is_used() {
        let response: MessagesResponse = serde_json::from_value(json!({
            "content": [{"type": "text", "text": "[]"}, {"type": "text", "text": "ignored"}]
        })).unwrap();
        assert_eq!(response.content[0].text.as_deref(), Some("[]"));
    }
}
