//! OpenAI-compatible chat completions backend.
//!
//! Requests structured output through a strict JSON-schema
//! `response_format` so the model returns `{"claims": [...]}` directly.
//! A populated `refusal` field is reported as [`BackendError::Refused`],
//! content that does not match the schema as [`BackendError::Unparsable`].

use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{
    parse_generation, retry_backoff, BackendError, Generation, GenerationBackend,
    GenerationRequest,
};
use crate::config::GenerationConfig;

/// Backend using an OpenAI-compatible `/chat/completions` endpoint.
///
/// Requires the `OPENAI_API_KEY` environment variable.
pub struct OpenAiBackend {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
    max_retries: u32,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    response_format: Value,
    stream: bool,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: Option<String>,
    refusal: Option<String>,
}

#[derive(Deserialize)]
struct StreamResponse {
    choices: Vec<StreamChoice>,
}

#[derive(Deserialize)]
struct StreamChoice {
    delta: StreamDelta,
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct StreamDelta {
    content: Option<String>,
    refusal: Option<String>,
}

/// The `{"claims": [{"text", "citations": [{"document_id", "segment_id"}]}]}`
/// schema, in strict mode.
fn claims_response_format() -> Value {
    serde_json::json!({
        "type": "json_schema",
        "json_schema": {
            "name": "grounded_claims",
            "strict": true,
            "schema": {
                "type": "object",
                "additionalProperties": false,
                "required": ["claims"],
                "properties": {
                    "claims": {
                        "type": "array",
                        "items": {
                            "type": "object",
                            "additionalProperties": false,
                            "required": ["text", "citations"],
                            "properties": {
                                "text": { "type": "string" },
                                "citations": {
                                    "type": "array",
                                    "items": {
                                        "type": "object",
                                        "additionalProperties": false,
                                        "required": ["document_id", "segment_id"],
                                        "properties": {
                                            "document_id": { "type": "string" },
                                            "segment_id": { "type": "string" }
                                        }
                                    }
                                }
                            }
                        }
                    }
                }
            }
        }
    })
}

impl OpenAiBackend {
    /// Create a backend from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if `OPENAI_API_KEY` is not in the environment or
    /// the HTTP client cannot be built.
    pub fn new(config: &GenerationConfig) -> Result<Self> {
        let api_key = match std::env::var("OPENAI_API_KEY") {
            Ok(key) if !key.is_empty() => key,
            _ => bail!("OPENAI_API_KEY environment variable not set"),
        };

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            api_key,
            model: config.model.clone(),
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_retries: config.max_retries,
        })
    }

    fn body<'a>(
        &'a self,
        request: &'a GenerationRequest,
        user: &'a str,
        stream: bool,
    ) -> ChatRequest<'a> {
        ChatRequest {
            model: &self.model,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: user,
                },
            ],
            response_format: claims_response_format(),
            stream,
        }
    }

    async fn send(&self, body: &ChatRequest<'_>) -> Result<reqwest::Response, BackendError> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
            .json(body)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let text = response.text().await.unwrap_or_default();
        Err(BackendError::Api {
            status: status.as_u16(),
            body: text,
        })
    }
}

/// Byte buffer for a server-sent event stream.
///
/// Network chunks can end inside a multi-byte character, so bytes are
/// only decoded once the whole line has arrived.
#[derive(Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn extend(&mut self, chunk: &[u8]) {
        self.pending.extend_from_slice(chunk);
    }

    /// Next complete line, trimmed. `None` until a newline is buffered.
    fn next_line(&mut self) -> Option<Result<String, BackendError>> {
        let end = self.pending.iter().position(|b| *b == b'\n')?;
        let raw: Vec<u8> = self.pending.drain(..=end).collect();
        let line = String::from_utf8(raw).map_err(|e| {
            BackendError::Unparsable(format!("stream line is not UTF-8: {}", e))
        });
        Some(line.map(|l| l.trim().to_string()))
    }
}

fn interpret(message: ChatResponseMessage) -> Result<Generation, BackendError> {
    if let Some(refusal) = message.refusal.filter(|r| !r.is_empty()) {
        return Err(BackendError::Refused(refusal));
    }
    match message.content {
        Some(content) => parse_generation(&content),
        None => Err(BackendError::Unparsable("response has no content".to_string())),
    }
}

#[async_trait]
impl GenerationBackend for OpenAiBackend {
    fn name(&self) -> &str {
        "openai"
    }

    async fn generate_claims(
        &self,
        request: &GenerationRequest,
    ) -> Result<Generation, BackendError> {
        let user = request.user_message();
        let body = self.body(request, &user, false);

        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                tokio::time::sleep(retry_backoff(attempt)).await;
            }

            match self.send(&body).await {
                Ok(response) => {
                    let parsed: ChatResponse = response.json().await?;
                    let message = parsed
                        .choices
                        .into_iter()
                        .next()
                        .ok_or_else(|| {
                            BackendError::Unparsable("response has no choices".to_string())
                        })?
                        .message;
                    return interpret(message);
                }
                Err(e) if e.is_retryable() => {
                    warn!(attempt, error = %e, "generation call failed, retrying");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| {
            BackendError::Config("generation failed after retries".to_string())
        }))
    }

    async fn stream_claims(
        &self,
        request: &GenerationRequest,
        deltas: mpsc::Sender<String>,
    ) -> Result<Generation, BackendError> {
        let user = request.user_message();
        let body = self.body(request, &user, true);
        let response = self.send(&body).await?;

        let mut content = String::new();
        let mut refusal = String::new();
        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::default();

        'read: while let Some(chunk) = stream.next().await {
            lines.extend(&chunk?);

            while let Some(line) = lines.next_line() {
                let line = line?;
                let Some(data) = line.strip_prefix("data: ") else {
                    continue;
                };
                if data == "[DONE]" {
                    break 'read;
                }

                let parsed: StreamResponse = match serde_json::from_str(data) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        debug!(error = %e, "skipping unparsable stream event");
                        continue;
                    }
                };
                if let Some(choice) = parsed.choices.into_iter().next() {
                    if let Some(piece) = choice.delta.content {
                        content.push_str(&piece);
                        // A closed receiver only means nobody is watching.
                        let _ = deltas.send(piece).await;
                    }
                    if let Some(piece) = choice.delta.refusal {
                        refusal.push_str(&piece);
                    }
                    if choice.finish_reason.is_some() {
                        break 'read;
                    }
                }
            }
        }

        interpret(ChatResponseMessage {
            content: Some(content),
            refusal: Some(refusal),
        })
    }
}
