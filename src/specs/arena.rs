//! Backend wire format: the create-evaluation payload going out, and the prefixed line
//! protocol coming back (`a0:"text"`, `ad:{"finishReason":"stop"}`, ...).

use crate::constants::{CANONICAL_ORIGIN, RECAPTCHA_PAYLOAD_KEY, STREAM_CREATE_EVALUATION_PATH};
use crate::specs::openai::{
    ChatCompletion, ChatCompletionChunk, ChunkDelta, CompletionChoice, CompletionMessage,
};
use serde_json::{json, Map, Value};
use uuid::Uuid;

/// One decoded backend line.
#[derive(Debug, Clone, PartialEq)]
pub enum ArenaEvent {
    Content(String),
    Reasoning(String),
    Error(String),
    Finish(Option<String>),
    /// Blank lines, heartbeats and prefixes the bridge does not use.
    Ignored,
}

pub fn create_evaluation_url() -> String {
    format!("{}{}", CANONICAL_ORIGIN, STREAM_CREATE_EVALUATION_PATH)
}

/// Builds the create-evaluation body for a single-model chat turn.
pub fn create_evaluation_payload(
    model_id: &str,
    prompt: &str,
    recaptcha_token: Option<&str>,
) -> Map<String, Value> {
    let payload = json!({
        "id": Uuid::new_v4().to_string(),
        "mode": "direct",
        "modelAId": model_id,
        "userMessageId": Uuid::new_v4().to_string(),
        "modelAMessageId": Uuid::new_v4().to_string(),
        "userMessage": {
            "content": prompt,
            "experimental_attachments": [],
        },
        "modality": "chat",
    });
    let mut map = match payload {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    if let Some(token) = recaptcha_token {
        map.insert(RECAPTCHA_PAYLOAD_KEY.to_string(), Value::String(token.to_string()));
    }
    map
}

fn decode_string(raw: &str) -> Option<String> {
    match serde_json::from_str::<Value>(raw) {
        Ok(Value::String(s)) => Some(s),
        _ => None,
    }
}

/// Decodes one line. Never fails: undecodable lines are `Ignored`.
pub fn decode_line(line: &str) -> ArenaEvent {
    let line = line.trim_end_matches('\r');
    let Some((prefix, rest)) = line.split_once(':') else {
        return ArenaEvent::Ignored;
    };
    match prefix {
        "a0" => decode_string(rest).map_or(ArenaEvent::Ignored, ArenaEvent::Content),
        "ag" => decode_string(rest).map_or(ArenaEvent::Ignored, ArenaEvent::Reasoning),
        "a3" => ArenaEvent::Error(decode_string(rest).unwrap_or_else(|| rest.to_string())),
        "ad" => {
            let reason = serde_json::from_str::<Value>(rest)
                .ok()
                .and_then(|v| v.get("finishReason").and_then(Value::as_str).map(str::to_string));
            ArenaEvent::Finish(reason)
        }
        _ => ArenaEvent::Ignored,
    }
}

/// What the caller sees for a decoded line or a stream ending.
#[derive(Debug, Clone)]
pub enum CallerFrame {
    Chunk(ChatCompletionChunk),
    /// In-band `{"error": {...}}` object.
    Error(Value),
    Done,
}

/// Turns backend lines into chat-completion frames for one response.
pub struct ChunkTranslator {
    id: String,
    model: String,
    created: i64,
    role_sent: bool,
    finish_sent: bool,
    content: String,
    reasoning: String,
    finish_reason: Option<String>,
    errors: Vec<String>,
}

impl ChunkTranslator {
    pub fn new(model: &str) -> Self {
        Self {
            id: format!("chatcmpl-{}", Uuid::new_v4().simple()),
            model: model.to_string(),
            created: chrono::Utc::now().timestamp(),
            role_sent: false,
            finish_sent: false,
            content: String::new(),
            reasoning: String::new(),
            finish_reason: None,
            errors: Vec::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    fn chunk(&mut self, mut delta: ChunkDelta, finish_reason: Option<String>) -> CallerFrame {
        if !self.role_sent {
            delta.role = Some("assistant".to_string());
            self.role_sent = true;
        }
        CallerFrame::Chunk(ChatCompletionChunk::new(
            &self.id,
            &self.model,
            self.created,
            delta,
            finish_reason,
        ))
    }

    fn error_frame(message: &str) -> CallerFrame {
        CallerFrame::Error(json!({
            "error": {
                "message": message,
                "type": "upstream_error",
                "code": 502,
            }
        }))
    }

    pub fn on_line(&mut self, line: &str) -> Vec<CallerFrame> {
        match decode_line(line) {
            ArenaEvent::Content(text) => {
                self.content.push_str(&text);
                vec![self.chunk(
                    ChunkDelta {
                        content: Some(text),
                        ..ChunkDelta::default()
                    },
                    None,
                )]
            }
            ArenaEvent::Reasoning(text) => {
                self.reasoning.push_str(&text);
                vec![self.chunk(
                    ChunkDelta {
                        reasoning_content: Some(text),
                        ..ChunkDelta::default()
                    },
                    None,
                )]
            }
            ArenaEvent::Error(message) => {
                tracing::warn!("[backend -> bridge] In-band error: {}", message);
                self.errors.push(message.clone());
                vec![Self::error_frame(&message)]
            }
            ArenaEvent::Finish(reason) if !self.finish_sent => {
                self.finish_sent = true;
                let reason = reason.unwrap_or_else(|| "stop".to_string());
                self.finish_reason = Some(reason.clone());
                vec![self.chunk(ChunkDelta::default(), Some(reason))]
            }
            ArenaEvent::Finish(_) | ArenaEvent::Ignored => Vec::new(),
        }
    }

    /// Body ended cleanly: close with a finish chunk if none was seen, then `[DONE]`.
    pub fn on_end(&mut self) -> Vec<CallerFrame> {
        let mut frames = Vec::new();
        if !self.finish_sent {
            self.finish_sent = true;
            self.finish_reason = Some("stop".to_string());
            frames.push(self.chunk(ChunkDelta::default(), Some("stop".to_string())));
        }
        frames.push(CallerFrame::Done);
        frames
    }

    /// Body failed after the status went out: in-band error, then `[DONE]`.
    pub fn on_failure(&mut self, reason: &str) -> Vec<CallerFrame> {
        self.errors.push(reason.to_string());
        vec![Self::error_frame(reason), CallerFrame::Done]
    }

    /// First in-band error seen, if any.
    pub fn first_error(&self) -> Option<&str> {
        self.errors.first().map(String::as_str)
    }

    /// Everything accumulated so far as one non-streaming completion.
    pub fn completion(&self) -> ChatCompletion {
        ChatCompletion {
            id: self.id.clone(),
            object: "chat.completion".to_string(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![CompletionChoice {
                index: 0,
                message: CompletionMessage {
                    role: "assistant".to_string(),
                    content: self.content.clone(),
                    reasoning_content: (!self.reasoning.is_empty()).then(|| self.reasoning.clone()),
                },
                finish_reason: self.finish_reason.clone().or_else(|| Some("stop".to_string())),
            }],
        }
    }
}
