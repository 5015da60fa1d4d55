//! Language-model seam and the Ollama `/api/chat` streaming client.
//!
//! Ollama streams newline-delimited JSON objects; each carries one message
//! fragment and the last one has `"done": true`. A body that ends before the
//! `done` line is reported as a malformed stream rather than a short answer.

use crate::error::GenerationError;
use crate::models::ChatRole;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tracing::debug;
use url::Url;

pub const DEFAULT_OLLAMA_URL: &str = "http://127.0.0.1:11434";

pub const DEFAULT_LLM_MODEL: &str = "mistral";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: ChatRole, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Ordered text fragments; the stream ends after the model signals completion.
pub type FragmentStream = BoxStream<'static, Result<String, GenerationError>>;

#[async_trait]
pub trait LanguageModel: Send + Sync {
    async fn stream_chat(&self, messages: Vec<ChatMessage>)
        -> Result<FragmentStream, GenerationError>;
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Debug, Deserialize)]
struct ChatStreamLine {
    #[serde(default)]
    message: Option<ChatStreamMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    error: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatStreamMessage {
    #[serde(default)]
    content: String,
}

#[derive(Debug, Default)]
struct NdjsonDecoder {
    buffer: Vec<u8>,
}

impl NdjsonDecoder {
    fn push(&mut self, bytes: &[u8]) -> Result<Vec<ChatStreamLine>, GenerationError> {
        self.buffer.extend_from_slice(bytes);
        let mut lines = Vec::new();
        while let Some(position) = self.buffer.iter().position(|byte| *byte == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=position).collect();
            if let Some(parsed) = parse_line(&line)? {
                lines.push(parsed);
            }
        }
        Ok(lines)
    }

    fn finish(&mut self) -> Result<Option<ChatStreamLine>, GenerationError> {
        let rest = std::mem::take(&mut self.buffer);
        parse_line(&rest)
    }
}

fn parse_line(line: &[u8]) -> Result<Option<ChatStreamLine>, GenerationError> {
    let text = String::from_utf8_lossy(line);
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(trimmed)
        .map(Some)
        .map_err(|error| GenerationError::MalformedStream(format!("{error}: {trimmed}")))
}

struct StreamState {
    bytes: BoxStream<'static, reqwest::Result<Bytes>>,
    decoder: NdjsonDecoder,
    pending: VecDeque<Result<String, GenerationError>>,
    finished: bool,
}

impl StreamState {
    /// Queues fragments from decoded lines. Returns true once the stream is over.
    fn absorb(&mut self, lines: Vec<ChatStreamLine>) -> bool {
        for line in lines {
            if let Some(error) = line.error {
                self.pending.push_back(Err(GenerationError::BackendResponse {
                    backend: "ollama".to_string(),
                    details: error,
                }));
                return true;
            }
            if let Some(message) = line.message {
                if !message.content.is_empty() {
                    self.pending.push_back(Ok(message.content));
                }
            }
            if line.done {
                return true;
            }
        }
        false
    }

    fn fail(&mut self, error: GenerationError) {
        self.pending.push_back(Err(error));
        self.finished = true;
    }
}

fn fragments(bytes: BoxStream<'static, reqwest::Result<Bytes>>) -> FragmentStream {
    let state = StreamState {
        bytes,
        decoder: NdjsonDecoder::default(),
        pending: VecDeque::new(),
        finished: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if let Some(item) = state.pending.pop_front() {
                return Some((item, state));
            }
            if state.finished {
                return None;
            }

            match state.bytes.next().await {
                Some(Ok(chunk)) => match state.decoder.push(&chunk) {
                    Ok(lines) => state.finished = state.absorb(lines),
                    Err(error) => state.fail(error),
                },
                Some(Err(error)) => state.fail(error.into()),
                None => {
                    let completed = match state.decoder.finish() {
                        Ok(Some(line)) => state.absorb(vec![line]),
                        Ok(None) => false,
                        Err(error) => {
                            state.fail(error);
                            continue;
                        }
                    };
                    if completed {
                        state.finished = true;
                    } else {
                        state.fail(GenerationError::MalformedStream(
                            "stream ended before the completion marker".to_string(),
                        ));
                    }
                }
            }
        }
    })
    .boxed()
}

/// Streaming chat client for an Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaChatModel {
    client: Client,
    endpoint: Url,
    model: String,
}

impl OllamaChatModel {
    pub fn new(base_url: &Url, model: impl Into<String>) -> Result<Self, GenerationError> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            client,
            endpoint: base_url.join("api/chat")?,
            model: model.into(),
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl LanguageModel for OllamaChatModel {
    async fn stream_chat(
        &self,
        messages: Vec<ChatMessage>,
    ) -> Result<FragmentStream, GenerationError> {
        debug!(model = %self.model, messages = messages.len(), "sending chat request");

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&ChatRequest {
                model: &self.model,
                messages: &messages,
                stream: true,
            })
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(GenerationError::BackendResponse {
                backend: "ollama".to_string(),
                details: format!("HTTP {status}: {body}"),
            });
        }

        Ok(fragments(response.bytes_stream().boxed()))
    }
}
