//! LLM client for agent deliberation.
//!
//! One trait, two implementations: an OpenAI-compatible HTTP client
//! (chat-completions, optionally streamed token by token) and a scripted
//! double for tests. Streaming hands tokens over an mpsc channel so the
//! orchestrator can abandon a generation at any token boundary by dropping
//! the receiver.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::{PlatformError, Result};

#[async_trait]
pub trait LlmClient: Send + Sync {
    /// Whole-response completion.
    async fn complete(&self, system: &str, user: &str) -> Result<String>;

    /// Token stream; the sender side stops when the receiver is dropped.
    async fn stream_chat(&self, system: &str, user: &str) -> Result<mpsc::Receiver<String>>;
}

#[derive(Debug, Clone, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    temperature: f64,
    max_tokens: u32,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    stream: bool,
}

#[derive(Debug, Clone, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: Option<ChatMessageOut>,
}

#[derive(Debug, Deserialize)]
struct ChatMessageOut {
    content: String,
}

#[derive(Debug, Deserialize)]
struct StreamChunk {
    choices: Vec<StreamChoice>,
}

#[derive(Debug, Deserialize)]
struct StreamChoice {
    delta: Option<StreamDelta>,
}

#[derive(Debug, Deserialize)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

pub struct OpenAiCompatClient {
    http: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl OpenAiCompatClient {
    pub fn new(base_url: String, api_key: Option<String>, model: String) -> Self {
        let http = reqwest::Client::builder()
            .user_agent("stockdata-backend/0.1")
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            http,
            base_url,
            api_key,
            model,
            timeout: Duration::from_secs(120),
        }
    }

    fn request(&self, system: &str, user: &str, stream: bool) -> reqwest::RequestBuilder {
        let req = ChatRequest {
            model: self.model.clone(),
            messages: vec![
                ChatMessage {
                    role: "system".to_string(),
                    content: system.to_string(),
                },
                ChatMessage {
                    role: "user".to_string(),
                    content: user.to_string(),
                },
            ],
            temperature: 0.7,
            max_tokens: 1024,
            stream,
        };
        let mut builder = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .timeout(self.timeout)
            .json(&req);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
    }
}

#[async_trait]
impl LlmClient for OpenAiCompatClient {
    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let resp = self
            .request(system, user, false)
            .send()
            .await
            .map_err(|e| PlatformError::Llm(format!("llm request: {e}")))?;
        let status = resp.status();
        let body = resp.text().await.unwrap_or_default();
        if !status.is_success() {
            let snippet: String = body.chars().take(500).collect();
            return Err(PlatformError::Llm(format!("llm {}: {snippet}", status.as_u16())));
        }
        let parsed: ChatResponse = serde_json::from_str(&body)
            .map_err(|e| PlatformError::Llm(format!("llm body parse: {e}")))?;
        Ok(parsed
            .choices
            .first()
            .and_then(|c| c.message.as_ref())
            .map(|m| m.content.clone())
            .unwrap_or_default())
    }

    async fn stream_chat(&self, system: &str, user: &str) -> Result<mpsc::Receiver<String>> {
        let resp = self
            .request(system, user, true)
            .send()
            .await
            .map_err(|e| PlatformError::Llm(format!("llm request: {e}")))?;
        if !resp.status().is_success() {
            return Err(PlatformError::Llm(format!(
                "llm stream {}",
                resp.status().as_u16()
            )));
        }

        let (tx, rx) = mpsc::channel::<String>(64);
        tokio::spawn(async move {
            let mut bytes = resp.bytes_stream();
            let mut buffer = String::new();
            while let Some(chunk) = bytes.next().await {
                let Ok(chunk) = chunk else { break };
                buffer.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);
                    let Some(data) = line.strip_prefix("data:") else {
                        continue;
                    };
                    let data = data.trim();
                    if data == "[DONE]" {
                        return;
                    }
                    let Ok(parsed) = serde_json::from_str::<StreamChunk>(data) else {
                        continue;
                    };
                    let token = parsed
                        .choices
                        .first()
                        .and_then(|c| c.delta.as_ref())
                        .and_then(|d| d.content.clone());
                    if let Some(token) = token {
                        if tx.send(token).await.is_err() {
                            // Receiver gone: generation abandoned.
                            debug!("llm stream consumer dropped");
                            return;
                        }
                    }
                }
            }
        });
        Ok(rx)
    }
}

/// Deterministic test double: pops canned responses in order, falling back
/// to a fixed line once the script runs dry.
pub struct ScriptedLlm {
    responses: Mutex<std::collections::VecDeque<String>>,
    fallback: String,
}

impl ScriptedLlm {
    pub fn new(responses: Vec<&str>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().map(String::from).collect()),
            fallback: "hold current allocation".to_string(),
        }
    }

    fn next_response(&self) -> String {
        self.responses
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone())
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
        Ok(self.next_response())
    }

    async fn stream_chat(&self, _system: &str, _user: &str) -> Result<mpsc::Receiver<String>> {
        let response = self.next_response();
        let (tx, rx) = mpsc::channel(64);
        tokio::spawn(async move {
            for word in response.split_inclusive(' ') {
                if tx.send(word.to_string()).await.is_err() {
                    return;
                }
                tokio::task::yield_now().await;
            }
        });
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn scripted_llm_streams_then_falls_back() {
        let llm = ScriptedLlm::new(vec!["buy low sell high"]);

        let mut rx = llm.stream_chat("s", "u").await.unwrap();
        let mut text = String::new();
        while let Some(token) = rx.recv().await {
            text.push_str(&token);
        }
        assert_eq!(text, "buy low sell high");

        assert_eq!(llm.complete("s", "u").await.unwrap(), "hold current allocation");
    }

    #[test]
    fn stream_chunk_parses_openai_shape() {
        let raw = r#"{"choices":[{"delta":{"content":"mo"}}]}"#;
        let parsed: StreamChunk = serde_json::from_str(raw).unwrap();
        assert_eq!(
            parsed.choices[0].delta.as_ref().unwrap().content.as_deref(),
            Some("mo")
        );
    }
}
