//! OpenAI-compatible chat client.
//!
//! The supervisor talks to any `/v1/chat/completions` endpoint (LM Studio,
//! vLLM, llama.cpp, hosted gateways). Tool calls are parsed out of plain
//! message content, so the wire surface is just role/content messages.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: &str, content: impl Into<String>) -> Self {
        Self { role: role.to_string(), content: content.into() }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::new("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::new("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new("assistant", content)
    }
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub total_tokens: u64,
}

/// One completed chat call, with the telemetry the trace wants.
#[derive(Debug, Clone)]
pub struct ChatOutcome {
    pub content: String,
    pub finish_reason: Option<String>,
    pub usage: Usage,
    pub model: Option<String>,
    pub latency_s: f64,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    messages: &'a [ChatMessage],
    temperature: f64,
    max_tokens: u32,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Usage>,
    #[serde(default)]
    model: Option<String>,
}

#[derive(Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: ChatResponseMessage,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Default, Deserialize)]
struct ChatResponseMessage {
    #[serde(default)]
    content: Option<String>,
}

pub struct ChatClient {
    client: reqwest::Client,
    base_url: String,
    model: Option<String>,
    api_key: String,
}

impl ChatClient {
    pub fn new(base_url: &str, model: Option<&str>, timeout_s: u64) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_s))
            .build()
            .context("Failed to build HTTP client")?;
        let model = model.map(|m| m.trim().to_string()).filter(|m| !m.is_empty());
        Ok(Self {
            client,
            base_url: Self::normalize_base_url(base_url),
            model,
            api_key: std::env::var("OPENAI_API_KEY").unwrap_or_default(),
        })
    }

    /// Accept either `http://host:port/v1` or a bare `http://host:port`
    /// (LM Studio default) and normalize to the `/v1` base.
    pub fn normalize_base_url(base_url: &str) -> String {
        let base = base_url.trim().trim_end_matches('/');
        if base.is_empty() || base.ends_with("/v1") {
            return base.to_string();
        }
        format!("{base}/v1")
    }

    pub fn model_name(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u32,
    ) -> Result<ChatOutcome> {
        let request = ChatRequest {
            model: self.model.as_deref(),
            messages,
            temperature,
            max_tokens,
        };
        let url = format!("{}/chat/completions", self.base_url);

        let t_start = Instant::now();
        // Transient upstream errors (429, 502, 503, 504) retry with backoff.
        let max_retries = 3;
        let mut last_error: Option<anyhow::Error> = None;

        for attempt in 0..=max_retries {
            if attempt > 0 {
                let delay_ms = 1000u64 * (1 << (attempt - 1));
                tracing::warn!(
                    "Retrying chat request (attempt {}/{}) after {}ms",
                    attempt + 1,
                    max_retries + 1,
                    delay_ms
                );
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            }

            let mut req = self
                .client
                .post(&url)
                .header("Content-Type", "application/json")
                .json(&request);
            if !self.api_key.is_empty() {
                req = req.header("Authorization", format!("Bearer {}", self.api_key));
            }

            let response = match req.send().await {
                Ok(r) => r,
                Err(e) => {
                    last_error = Some(anyhow::anyhow!("Failed to send chat request: {e}"));
                    continue;
                }
            };

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                let transient = matches!(status.as_u16(), 429 | 502 | 503 | 504);
                if transient && attempt < max_retries {
                    last_error = Some(anyhow::anyhow!("Chat API returned {status}: {body}"));
                    continue;
                }
                anyhow::bail!("Chat API returned {status}: {body}");
            }

            let parsed: ChatResponse = response
                .json()
                .await
                .context("Failed to parse chat response")?;
            let latency_s = t_start.elapsed().as_secs_f64();

            let usage = parsed.usage.unwrap_or_default();
            let model = parsed.model;
            let choice = parsed
                .choices
                .into_iter()
                .next()
                .context("Chat API returned no choices")?;

            return Ok(ChatOutcome {
                content: choice.message.content.unwrap_or_default(),
                finish_reason: choice.finish_reason,
                usage,
                model,
                latency_s,
            });
        }

        Err(last_error.unwrap_or_else(|| anyhow::anyhow!("Chat request failed after retries")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_base_url() {
        assert_eq!(
            ChatClient::normalize_base_url("http://127.0.0.1:1234"),
            "http://127.0.0.1:1234/v1"
        );
        assert_eq!(
            ChatClient::normalize_base_url("http://127.0.0.1:1234/v1"),
            "http://127.0.0.1:1234/v1"
        );
        assert_eq!(
            ChatClient::normalize_base_url("http://127.0.0.1:1234/v1/"),
            "http://127.0.0.1:1234/v1"
        );
        assert_eq!(ChatClient::normalize_base_url(""), "");
    }

    #[test]
    fn test_response_decode_is_permissive() {
        let parsed: ChatResponse = serde_json::from_str(
            r#"{"choices":[{"message":{"content":"hi"},"finish_reason":"stop"}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.choices.len(), 1);
        assert!(parsed.usage.is_none());

        let empty: ChatResponse = serde_json::from_str("{}").unwrap();
        assert!(empty.choices.is_empty());
    }

    #[test]
    fn test_message_constructors() {
        let m = ChatMessage::system("prompt");
        assert_eq!(m.role, "system");
        let m = ChatMessage::new("user", "x");
        assert_eq!(m.role, "user");
        assert_eq!(m.content, "x");
    }
}
