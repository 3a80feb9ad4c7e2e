use serde_json::{json, Value};
use thiserror::Error;

use crate::config::LlmConfig;

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("OPENAI_API_KEY not configured")]
    NotConfigured,
    #[error("llm request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("llm returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("llm response had empty content")]
    Empty,
}

/// Client for an OpenAI-compatible `/chat/completions` endpoint.
pub struct LlmClient {
    http: reqwest::Client,
    config: LlmConfig,
}

impl LlmClient {
    pub fn new(http: reqwest::Client, config: LlmConfig) -> Self {
        Self { http, config }
    }

    pub async fn chat_completion_text(
        &self,
        system: &str,
        user: &str,
        temperature: f32,
    ) -> Result<String, LlmError> {
        let api_key = self.config.api_key.as_deref().ok_or(LlmError::NotConfigured)?;
        let response = self
            .http
            .post(format!("{}/chat/completions", self.config.base_url))
            .bearer_auth(api_key)
            .json(&json!({
                "model": self.config.model,
                "messages": [
                    { "role": "system", "content": system },
                    { "role": "user", "content": user }
                ],
                "temperature": temperature
            }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(LlmError::Status { status, body });
        }
        let payload = response.json::<Value>().await?;
        completion_text(&payload).ok_or(LlmError::Empty)
    }
}

fn completion_text(payload: &Value) -> Option<String> {
    let text = payload
        .get("choices")
        .and_then(Value::as_array)
        .and_then(|choices| choices.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|msg| msg.get("content"))
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completion_text_reads_first_choice() {
        let payload = json!({
            "choices": [
                { "message": { "role": "assistant", "content": "  Hello there \n" } },
                { "message": { "role": "assistant", "content": "ignored" } }
            ]
        });
        assert_eq!(completion_text(&payload).as_deref(), Some("Hello there"));
        assert_eq!(completion_text(&json!({ "choices": [] })), None);
        assert_eq!(
            completion_text(&json!({ "choices": [{ "message": { "content": "   " } }] })),
            None
        );
    }

    #[tokio::test]
    async fn missing_key_fails_before_any_request() {
        let client = LlmClient::new(
            reqwest::Client::new(),
            LlmConfig {
                api_key: None,
                model: "gpt-4o-mini".into(),
                base_url: "http://127.0.0.1:9".into(),
            },
        );
        let err = client.chat_completion_text("sys", "user", 0.2).await.unwrap_err();
        assert!(matches!(err, LlmError::NotConfigured));
    }
}
