//! Chat API client
//!
//! Responsibilities:
//! - One request per turn against `POST {base}/chat-messages`
//! - Blocking and streaming (`data: {json}` lines) response modes
//! - Normalizing replies to answer, conversation id, message id and latency
//! - Error kinds the retry predicate can tell apart

mod chatflow;
mod stream;

pub use chatflow::{ChatflowClient, ClientInfo, USER_AGENT};
pub use stream::{LineBuffer, StreamAssembler, StreamState, StreamStep};

use crate::config::ResponseMode;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::time::Duration;
use thiserror::Error;
use tracing::warn;

/// Call-level errors
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ChatError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("HTTP {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Malformed response: {0}")]
    MalformedResponse(String),

    #[error("API error: {message}")]
    Api { message: String },
}

impl ChatError {
    /// Retry predicate. Client errors (4xx other than 408/429) are only
    /// retried when `retry_client_errors` is set.
    pub fn is_retryable(&self, retry_client_errors: bool) -> bool {
        match self {
            ChatError::Connection(_) | ChatError::Timeout { .. } | ChatError::Api { .. } => true,
            ChatError::MalformedResponse(_) => false,
            ChatError::HttpStatus { status, .. } => match *status {
                408 | 429 => true,
                400..=499 => retry_client_errors,
                _ => true,
            },
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ChatError::Connection(_) => "connection",
            ChatError::Timeout { .. } => "timeout",
            ChatError::HttpStatus { .. } => "http_status",
            ChatError::MalformedResponse(_) => "malformed_response",
            ChatError::Api { .. } => "api",
        }
    }
}

/// One outgoing turn
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChatRequest {
    pub query: String,
    pub user: String,
    /// External conversation id from an earlier turn
    pub conversation_id: Option<String>,
    pub inputs: Map<String, Value>,
}

impl ChatRequest {
    pub fn new(query: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            query: query.into(),
            user: user.into(),
            conversation_id: None,
            inputs: Map::new(),
        }
    }

    pub fn with_conversation_id(mut self, conversation_id: Option<String>) -> Self {
        self.conversation_id = conversation_id.filter(|id| !id.trim().is_empty());
        self
    }

    pub fn with_inputs(mut self, inputs: Map<String, Value>) -> Self {
        self.inputs = inputs;
        self
    }

    /// Wire body; `conversation_id` is omitted for a new conversation.
    pub fn to_body(&self, mode: ResponseMode) -> Value {
        let mut body = json!({
            "inputs": Value::Object(self.inputs.clone()),
            "query": self.query,
            "response_mode": mode.as_str(),
            "user": self.user,
        });
        if let (Some(id), Some(obj)) = (&self.conversation_id, body.as_object_mut()) {
            obj.insert("conversation_id".to_string(), Value::String(id.clone()));
        }
        body
    }
}

/// Normalized reply of one call
#[derive(Debug, Clone, PartialEq)]
pub struct ChatReply {
    pub answer: String,
    pub conversation_id: Option<String>,
    pub message_id: Option<String>,
    pub elapsed: Duration,
    /// Final JSON payload (blocking body or assembled stream)
    pub payload: Value,
}

impl ChatReply {
    pub fn from_payload(payload: Value, elapsed: Duration) -> Self {
        Self {
            answer: extract_answer(&payload),
            conversation_id: extract_conversation_id(&payload),
            message_id: extract_message_id(&payload),
            elapsed,
            payload,
        }
    }
}

const ANSWER_FALLBACK_FIELDS: [&str; 4] = ["message", "content", "text", "response"];

/// Reply text: `answer`, else the first of `message`/`content`/`text`/`response`.
pub fn extract_answer(payload: &Value) -> String {
    if let Some(answer) = payload.get("answer") {
        return value_text(answer).trim().to_string();
    }
    for field in ANSWER_FALLBACK_FIELDS {
        if let Some(value) = payload.get(field) {
            warn!(field, "Reply has no 'answer' field, using fallback");
            return value_text(value).trim().to_string();
        }
    }
    String::new()
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn non_empty_str(payload: &Value, field: &str) -> Option<String> {
    payload
        .get(field)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

pub fn extract_conversation_id(payload: &Value) -> Option<String> {
    non_empty_str(payload, "conversation_id")
}

/// `message_id`, falling back to `id`.
pub fn extract_message_id(payload: &Value) -> Option<String> {
    non_empty_str(payload, "message_id").or_else(|| non_empty_str(payload, "id"))
}

/// Chat API seam used by the execution controller
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Mode fixed at construction
    fn response_mode(&self) -> ResponseMode;

    /// Send one turn and return the normalized reply.
    async fn send(&self, request: &ChatRequest) -> Result<ChatReply, ChatError>;
}
