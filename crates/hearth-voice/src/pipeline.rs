//! Response pipeline: prior turns in, one assembled reply out.
//!
//! The controller only needs the final text. Fragments are forwarded as they
//! stream in so the UI can render the reply while it is still being written.

use crate::config::PipelineConfig;
use crate::controller::{ControllerEvent, EventSender};
use crate::error::{VoiceError, VoiceResult};
use crate::history::{ChatTurn, Role};
use async_trait::async_trait;
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, info, warn};

const ENV_LLM_API_KEY: &str = "LLM_API_KEY";
const ENV_OPENROUTER_API_KEY: &str = "OPENROUTER_API_KEY";

/// Receives streamed reply fragments for one turn.
#[derive(Debug, Clone)]
pub struct ReplySink {
    turn_id: u64,
    tx: EventSender,
}

impl ReplySink {
    pub(crate) fn new(turn_id: u64, tx: EventSender) -> Self {
        Self { turn_id, tx }
    }

    pub fn delta(&self, text: &str) {
        if text.is_empty() {
            return;
        }
        let _ = self.tx.send(ControllerEvent::ReplyDelta {
            turn_id: self.turn_id,
            text: text.to_string(),
        });
    }
}

#[async_trait]
pub trait ResponsePipeline: Send + Sync {
    /// Produce the assistant's reply to `history`. An empty history asks for
    /// an opening greeting; one ending on an assistant turn asks to carry on.
    async fn respond(&self, history: &[ChatTurn], deltas: ReplySink) -> VoiceResult<String>;
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    stream: bool,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    choices: Vec<StreamChoice>,
    /// Plain `{"text": ...}` fragments, as some relays emit.
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    error: Option<serde_json::Value>,
}

#[derive(Deserialize)]
struct StreamChoice {
    #[serde(default)]
    delta: StreamDelta,
}

#[derive(Deserialize, Default)]
struct StreamDelta {
    #[serde(default)]
    content: Option<String>,
}

/// What one SSE `data:` payload contributed.
#[derive(Debug, PartialEq, Eq)]
enum ChunkContent {
    Text(String),
    Nothing,
    Failed(String),
}

fn parse_chunk(data: &str) -> ChunkContent {
    let chunk: StreamChunk = match serde_json::from_str(data) {
        Ok(c) => c,
        Err(e) => {
            debug!(error = %e, "skipping unparseable stream chunk");
            return ChunkContent::Nothing;
        }
    };
    if let Some(err) = chunk.error {
        let message = match err {
            serde_json::Value::String(s) => s,
            other => other
                .get("message")
                .and_then(|m| m.as_str())
                .map(str::to_string)
                .unwrap_or_else(|| other.to_string()),
        };
        return ChunkContent::Failed(message);
    }
    if let Some(text) = chunk.text {
        return ChunkContent::Text(text);
    }
    match chunk.choices.into_iter().next().and_then(|c| c.delta.content) {
        Some(text) => ChunkContent::Text(text),
        None => ChunkContent::Nothing,
    }
}

/// OpenAI-compatible streaming chat completions (OpenRouter by default).
pub struct ChatCompletionsPipeline {
    client: reqwest::Client,
    api_key: String,
    config: PipelineConfig,
}

impl ChatCompletionsPipeline {
    pub fn new(api_key: impl Into<String>, config: PipelineConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            api_key: api_key.into().trim().to_string(),
            config,
        }
    }

    /// Key from `LLM_API_KEY`, falling back to `OPENROUTER_API_KEY`.
    pub fn from_config(config: PipelineConfig) -> VoiceResult<Self> {
        let key = std::env::var(ENV_LLM_API_KEY)
            .or_else(|_| std::env::var(ENV_OPENROUTER_API_KEY))
            .ok()
            .map(|k| k.trim().to_string())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                VoiceError::Config(format!(
                    "{ENV_LLM_API_KEY} (or {ENV_OPENROUTER_API_KEY}) is not set"
                ))
            })?;
        Ok(Self::new(key, config))
    }

    fn build_messages(&self, history: &[ChatTurn]) -> Vec<ChatMessage> {
        let mut messages = vec![ChatMessage {
            role: "system".to_string(),
            content: self.config.system_prompt.clone(),
        }];
        messages.extend(history.iter().map(|t| ChatMessage {
            role: t.role.as_str().to_string(),
            content: t.content.clone(),
        }));
        // Chat backends expect the last message to be the user's.
        let prompt = match history.last() {
            None => Some(&self.config.greeting_prompt),
            Some(turn) if turn.role == Role::Assistant => Some(&self.config.resume_prompt),
            Some(_) => None,
        };
        if let Some(prompt) = prompt {
            messages.push(ChatMessage {
                role: Role::User.as_str().to_string(),
                content: prompt.clone(),
            });
        }
        messages
    }
}

#[async_trait]
impl ResponsePipeline for ChatCompletionsPipeline {
    async fn respond(&self, history: &[ChatTurn], deltas: ReplySink) -> VoiceResult<String> {
        let url = format!("{}/chat/completions", self.config.base_url.trim_end_matches('/'));
        let body = ChatRequest {
            model: &self.config.model,
            messages: self.build_messages(history),
            max_tokens: self.config.max_tokens,
            stream: true,
        };

        info!(model = %self.config.model, turns = history.len(), "requesting reply");
        let response = self
            .client
            .post(&url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("X-Title", "Hearth")
            .json(&body)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(%status, "reply request rejected");
            return Err(VoiceError::Pipeline(format!("HTTP {status}: {text}")));
        }

        let mut stream = response.bytes_stream();
        let mut decoder = SseDecoder::default();
        let mut reply = String::new();
        let mut events = Vec::new();

        'read: while let Some(bytes) = stream.next().await {
            let bytes = bytes?;
            events.clear();
            decoder.push(&bytes, &mut events);
            for event in events.drain(..) {
                match event {
                    SseEvent::Done => break 'read,
                    SseEvent::Data(data) => match parse_chunk(&data) {
                        ChunkContent::Text(text) => {
                            deltas.delta(&text);
                            reply.push_str(&text);
                        }
                        ChunkContent::Nothing => {}
                        ChunkContent::Failed(message) => {
                            return Err(VoiceError::Pipeline(message));
                        }
                    },
                }
            }
        }
        if let Some(SseEvent::Data(data)) = decoder.finish() {
            if let ChunkContent::Text(text) = parse_chunk(&data) {
                deltas.delta(&text);
                reply.push_str(&text);
            }
        }

        debug!(chars = reply.len(), "reply assembled");
        Ok(reply)
    }
}

/// One server-sent event payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SseEvent {
    Data(String),
    Done,
}

/// Incremental `data:` line decoder. Chunks may split lines, or UTF-8
/// sequences, anywhere.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    /// Feed bytes; complete lines are decoded into `out`.
    pub fn push(&mut self, bytes: &[u8], out: &mut Vec<SseEvent>) {
        self.buf.extend_from_slice(bytes);
        while let Some(pos) = self.buf.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            if let Some(event) = Self::decode_line(&line) {
                out.push(event);
            }
        }
    }

    /// Flush a trailing line that never got its newline.
    pub fn finish(&mut self) -> Option<SseEvent> {
        let line = std::mem::take(&mut self.buf);
        Self::decode_line(&line)
    }

    fn decode_line(line: &[u8]) -> Option<SseEvent> {
        let line = String::from_utf8_lossy(line);
        let line = line.trim();
        let data = line.strip_prefix("data:")?.trim_start();
        if data == "[DONE]" {
            Some(SseEvent::Done)
        } else if data.is_empty() {
            None
        } else {
            Some(SseEvent::Data(data.to_string()))
        }
    }
}
