//! LLM Client (C2): a single connection-pooled HTTP client shared per
//! process, with bounded retry, timeout and cancellation (spec §4.2).

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::LlmError;
use crate::prompt::SYSTEM_PROMPT;

const TIMEOUT_PER_REQUEST: Duration = Duration::from_secs(30);

#[derive(Debug, Deserialize)]
struct ChatEnvelope {
    message: ChatMessageEnvelope,
}

#[derive(Debug, Deserialize)]
struct ChatMessageEnvelope {
    content: String,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 2],
    stream: bool,
    options: ChatOptions,
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatOptions {
    temperature: f32,
    num_predict: u32,
    num_ctx: u32,
    num_thread: u32,
}

impl Default for ChatOptions {
    fn default() -> Self {
        ChatOptions {
            temperature: 0.1,
            num_predict: 4000,
            num_ctx: 2048,
            num_thread: 4,
        }
    }
}

/// A single connection-pooled, serialised client. Workers share one
/// instance; the internal mutex ensures at most one in-flight request,
/// since the LLM backend is treated as a scarce local resource (§4.2).
pub struct LlmClient {
    base_url: String,
    max_retries: u32,
    inner: Mutex<Option<reqwest::Client>>,
}

impl LlmClient {
    pub fn new(base_url: impl Into<String>, max_retries: u32) -> Self {
        LlmClient {
            base_url: base_url.into(),
            max_retries,
            inner: Mutex::new(None),
        }
    }

    /// Opens the underlying connection pool. Safe to call again after `close`.
    pub async fn connect(&self) {
        let mut guard = self.inner.lock().await;
        if guard.is_none() {
            *guard = Some(
                reqwest::Client::builder()
                    .timeout(TIMEOUT_PER_REQUEST)
                    .pool_max_idle_per_host(5)
                    .build()
                    .expect("reqwest client builds with static config"),
            );
        }
    }

    /// Drains the connection pool. The client reconnects lazily on the next `generate`.
    pub async fn close(&self) {
        *self.inner.lock().await = None;
    }

    /// Sends one chat-completion request, retrying per the policy in
    /// spec §4.2. Serialises with any other in-flight call on this client.
    pub async fn generate(
        &self,
        prompt: &str,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        self.connect().await;
        let guard = self.inner.lock().await;
        let client = guard.as_ref().expect("connect() populated the client").clone();
        drop(guard);

        self.call_with_retry(&client, prompt, model, cancel).await
    }

    async fn call_with_retry(
        &self,
        client: &reqwest::Client,
        prompt: &str,
        model: &str,
        cancel: &CancellationToken,
    ) -> Result<String, LlmError> {
        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model,
            messages: [
                ChatMessage {
                    role: "system",
                    content: SYSTEM_PROMPT,
                },
                ChatMessage {
                    role: "user",
                    content: prompt,
                },
            ],
            stream: false,
            options: ChatOptions::default(),
        };

        let attempts = self.max_retries + 1;
        for attempt in 1..=attempts {
            if cancel.is_cancelled() {
                return Err(LlmError::Cancelled);
            }

            let send = client.post(&url).json(&body).send();
            let response = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(LlmError::Cancelled),
                result = send => result,
            };

            match response {
                Ok(resp) if resp.status().is_success() => {
                    let status = resp.status();
                    let text = resp.text().await.map_err(LlmError::from)?;
                    match parse_envelope(&text) {
                        Ok(content) => {
                            info!(attempt, %status, "llm call succeeded");
                            return Ok(content);
                        }
                        Err(e) => return Err(e),
                    }
                }
                Ok(resp) => {
                    let status = resp.status().as_u16();
                    let retryable = status == 404 || (500..600).contains(&status);
                    let body_text = resp.text().await.unwrap_or_default();
                    if retryable && attempt < attempts {
                        warn!(attempt, status, "llm call failed, retrying");
                        sleep_cancellable(Duration::from_secs(10 * attempt as u64), cancel).await?;
                        continue;
                    }
                    return Err(LlmError::Provider {
                        status,
                        body: body_text,
                    });
                }
                Err(err) => {
                    let err = LlmError::from(err);
                    let timeout = matches!(err, LlmError::Timeout);
                    if timeout && attempt < attempts {
                        warn!(attempt, "llm call timed out, retrying");
                        sleep_cancellable(Duration::from_secs(attempt as u64), cancel).await?;
                        continue;
                    }
                    return Err(err);
                }
            }
        }

        Err(LlmError::RetriesExhausted(self.max_retries as usize))
    }
}

async fn sleep_cancellable(d: Duration, cancel: &CancellationToken) -> Result<(), LlmError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LlmError::Cancelled),
        _ = tokio::time::sleep(d) => Ok(()),
    }
}

fn parse_envelope(text: &str) -> Result<String, LlmError> {
    let envelope: ChatEnvelope =
        serde_json::from_str(text).map_err(|_| LlmError::EmptyContent)?;
    if envelope.message.content.is_empty() {
        return Err(LlmError::EmptyContent);
    }
    Ok(envelope.message.content)
}

/// Serializes the wire request for tests / documentation purposes without
/// needing a live connection.
#[cfg(test)]
fn debug_request_json(prompt: &str, model: &str) -> serde_json::Value {
    json!({
        "model": model,
        "messages": [
            {"role": "system", "content": SYSTEM_PROMPT},
            {"role": "user", "content": prompt},
        ],
        "stream": false,
        "options": ChatOptions::default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_envelope_content() {
        let text = r#"{"message":{"content":"{\"a1\":{}}"}}"#;
        let content = parse_envelope(text).unwrap();
        assert_eq!(content, "{\"a1\":{}}");
    }

    #[test]
    fn rejects_empty_content() {
        let text = r#"{"message":{"content":""}}"#;
        assert!(matches!(parse_envelope(text), Err(LlmError::EmptyContent)));
    }

    #[test]
    fn rejects_missing_message_field() {
        let text = r#"{"not_message": {}}"#;
        assert!(matches!(parse_envelope(text), Err(LlmError::EmptyContent)));
    }

    #[test]
    fn wire_request_matches_ollama_chat_contract() {
        let v = debug_request_json("hello", "llama3");
        assert_eq!(v["model"], "llama3");
        assert_eq!(v["stream"], false);
        assert_eq!(v["options"]["temperature"], 0.1);
    }
}
