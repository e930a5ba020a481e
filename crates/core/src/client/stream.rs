//! Streaming reply assembly
//!
//! The body of a streaming reply is a sequence of lines, each blank or
//! `data: {json}` carrying an `event` field. [`LineBuffer`] turns network
//! chunks into lines and [`StreamAssembler`] folds lines into one reply,
//! independent of any I/O.

use super::{ChatError, extract_message_id};
use serde_json::{Value, json};
use tracing::{debug, warn};

/// Splits a byte stream into lines across chunk boundaries.
#[derive(Debug, Default)]
pub struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Complete lines contained in `chunk` plus any carried-over bytes.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.pending.extend_from_slice(chunk);
        let mut lines = Vec::new();
        while let Some(pos) = self.pending.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            lines.push(decode_line(&line));
        }
        lines
    }

    /// Trailing bytes not terminated by a newline.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(decode_line(&rest))
    }
}

fn decode_line(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes)
        .trim_end_matches(['\n', '\r'])
        .to_string()
}

/// Assembler state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamState {
    /// No `message` event seen yet
    Awaiting,
    Accumulating,
    /// `message_end` received
    Done,
    /// `error` event received
    Errored,
}

/// Whether the caller should keep reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamStep {
    Continue,
    Done,
}

#[derive(Debug)]
pub struct StreamAssembler {
    state: StreamState,
    answer: String,
    conversation_id: Option<String>,
    message_id: Option<String>,
    error: Option<String>,
    skipped_lines: usize,
}

impl Default for StreamAssembler {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamAssembler {
    pub fn new() -> Self {
        Self {
            state: StreamState::Awaiting,
            answer: String::new(),
            conversation_id: None,
            message_id: None,
            error: None,
            skipped_lines: 0,
        }
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// Lines dropped because their payload was not valid JSON
    pub fn skipped_lines(&self) -> usize {
        self.skipped_lines
    }

    pub fn answer(&self) -> &str {
        &self.answer
    }

    /// Apply one line; an `error` event fails with [`ChatError::Api`].
    pub fn feed_line(&mut self, line: &str) -> Result<StreamStep, ChatError> {
        match self.state {
            StreamState::Done => return Ok(StreamStep::Done),
            StreamState::Errored => {
                return Err(ChatError::Api {
                    message: self.error.clone().unwrap_or_default(),
                });
            }
            StreamState::Awaiting | StreamState::Accumulating => {}
        }

        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else {
            return Ok(StreamStep::Continue);
        };
        let data = data.trim_start();
        if data.is_empty() {
            return Ok(StreamStep::Continue);
        }

        let event: Value = match serde_json::from_str(data) {
            Ok(event) => event,
            Err(e) => {
                self.skipped_lines += 1;
                warn!(error = %e, line = data, "Skipping unparsable stream line");
                return Ok(StreamStep::Continue);
            }
        };

        match event.get("event").and_then(Value::as_str).unwrap_or_default() {
            "message" => {
                if let Some(chunk) = event.get("answer").and_then(Value::as_str) {
                    self.answer.push_str(chunk);
                }
                self.capture_ids(&event);
                self.state = StreamState::Accumulating;
                Ok(StreamStep::Continue)
            }
            "message_end" => {
                self.capture_ids(&event);
                self.state = StreamState::Done;
                debug!(
                    answer_len = self.answer.len(),
                    skipped = self.skipped_lines,
                    "Stream finished"
                );
                Ok(StreamStep::Done)
            }
            "error" => {
                let message = event
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown stream error")
                    .to_string();
                self.state = StreamState::Errored;
                self.error = Some(message.clone());
                Err(ChatError::Api { message })
            }
            other => {
                debug!(event = other, "Ignoring stream event");
                Ok(StreamStep::Continue)
            }
        }
    }

    fn capture_ids(&mut self, event: &Value) {
        if self.conversation_id.is_none() {
            self.conversation_id = super::extract_conversation_id(event);
        }
        if self.message_id.is_none() {
            self.message_id = extract_message_id(event);
        }
    }

    /// Final payload. A stream that ended without `message_end` yields the
    /// text accumulated so far.
    pub fn finish(self) -> Value {
        if matches!(self.state, StreamState::Awaiting | StreamState::Accumulating) {
            warn!(
                answer_len = self.answer.len(),
                "Stream ended without message_end, using accumulated answer"
            );
        }
        json!({
            "answer": self.answer,
            "conversation_id": self.conversation_id,
            "message_id": self.message_id,
        })
    }
}
