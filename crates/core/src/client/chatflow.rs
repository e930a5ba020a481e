//! Chatflow HTTP client
//!
//! Supports:
//! - Blocking replies (one JSON body)
//! - Streaming replies (`data: {json}` lines assembled by [`StreamAssembler`])
//! - Connection probe and masked client info for display

use super::{ChatApi, ChatError, ChatReply, ChatRequest, LineBuffer, StreamAssembler, StreamStep};
use crate::config::{ApiConfig, ConfigError, ResponseMode};
use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::{Client, StatusCode, header};
use serde::Serialize;
use serde_json::Value;
use std::time::Instant;
use tracing::{debug, info, warn};

pub const USER_AGENT: &str = concat!("flowtest/", env!("CARGO_PKG_VERSION"));

/// User id used by the connection probe
const PROBE_USER: &str = "test_user";
const PROBE_QUERY: &str = "Hello, this is a connection test.";

/// Longest server body excerpt kept in an error message
const ERROR_BODY_LIMIT: usize = 200;

/// Display-safe client description
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientInfo {
    pub base_url: String,
    pub endpoint: String,
    pub masked_key: String,
    pub user_id: String,
    pub timeout_secs: u64,
    pub response_mode: ResponseMode,
    pub user_agent: String,
}

#[derive(Clone)]
pub struct ChatflowClient {
    config: ApiConfig,
    client: Client,
    endpoint: String,
}

impl std::fmt::Debug for ChatflowClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatflowClient")
            .field("endpoint", &self.endpoint)
            .field("response_mode", &self.config.response_mode)
            .finish_non_exhaustive()
    }
}

impl ChatflowClient {
    /// Validates `config` and builds the HTTP client with its timeout.
    pub fn new(config: ApiConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let client = Client::builder()
            .timeout(config.timeout())
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ConfigError::Invalid(format!("failed to build HTTP client: {}", e)))?;
        let endpoint = config.chat_endpoint();
        debug!(endpoint = %endpoint, mode = %config.response_mode, "Created chat client");
        Ok(Self {
            config,
            client,
            endpoint,
        })
    }

    pub fn config(&self) -> &ApiConfig {
        &self.config
    }

    pub fn info(&self) -> ClientInfo {
        ClientInfo {
            base_url: self.config.base_url.clone(),
            endpoint: self.endpoint.clone(),
            masked_key: self.config.masked_key(),
            user_id: self.config.user_id.clone(),
            timeout_secs: self.config.timeout_secs,
            response_mode: self.config.response_mode,
            user_agent: USER_AGENT.to_string(),
        }
    }

    /// Sends a probe turn as a fresh conversation.
    pub async fn test_connection(&self) -> (bool, String) {
        let request = ChatRequest::new(PROBE_QUERY, PROBE_USER);
        match self.send(&request).await {
            Ok(reply) => {
                let message = format!(
                    "Connection OK ({:.2}s, {} mode)",
                    reply.elapsed.as_secs_f64(),
                    self.config.response_mode
                );
                info!("{}", message);
                (true, message)
            }
            Err(e) => {
                let message = format!("Connection failed: {}", e);
                warn!("{}", message);
                (false, message)
            }
        }
    }

    fn post(&self, request: &ChatRequest) -> reqwest::RequestBuilder {
        let mode = self.config.response_mode;
        let builder = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.config.api_key)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&request.to_body(mode));
        match mode {
            ResponseMode::Streaming => builder.header(header::ACCEPT, "text/event-stream"),
            ResponseMode::Blocking => builder,
        }
    }

    fn map_transport_error(&self, error: reqwest::Error) -> ChatError {
        if error.is_timeout() {
            ChatError::Timeout {
                timeout_secs: self.config.timeout_secs,
            }
        } else {
            ChatError::Connection(error.to_string())
        }
    }

    async fn send_blocking(&self, request: &ChatRequest) -> Result<ChatReply, ChatError> {
        let started = Instant::now();
        let response = self
            .post(request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| self.map_transport_error(e))?;
        if status != StatusCode::OK {
            return Err(status_error(status, &body));
        }

        let payload: Value = serde_json::from_str(&body).map_err(|e| {
            ChatError::MalformedResponse(format!("{}: {}", e, truncate(&body, ERROR_BODY_LIMIT)))
        })?;
        validate_payload(&payload)?;
        Ok(ChatReply::from_payload(payload, started.elapsed()))
    }

    async fn send_streaming(&self, request: &ChatRequest) -> Result<ChatReply, ChatError> {
        let started = Instant::now();
        let response = self
            .post(request)
            .send()
            .await
            .map_err(|e| self.map_transport_error(e))?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(status_error(status, &body));
        }

        let mut stream = response.bytes_stream();
        let mut lines = LineBuffer::new();
        let mut assembler = StreamAssembler::new();

        'read: while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| self.map_transport_error(e))?;
            for line in lines.push(&chunk) {
                if assembler.feed_line(&line)? == StreamStep::Done {
                    break 'read;
                }
            }
        }
        if let Some(rest) = lines.finish() {
            assembler.feed_line(&rest)?;
        }

        let payload = assembler.finish();
        if super::extract_conversation_id(&payload).is_none() {
            warn!("Streaming reply carried no conversation_id");
        }
        Ok(ChatReply::from_payload(payload, started.elapsed()))
    }
}

#[async_trait]
impl ChatApi for ChatflowClient {
    fn response_mode(&self) -> ResponseMode {
        self.config.response_mode
    }

    async fn send(&self, request: &ChatRequest) -> Result<ChatReply, ChatError> {
        debug!(
            mode = %self.config.response_mode,
            has_conversation = request.conversation_id.is_some(),
            "Sending chat request"
        );
        match self.config.response_mode {
            ResponseMode::Blocking => self.send_blocking(request).await,
            ResponseMode::Streaming => self.send_streaming(request).await,
        }
    }
}

/// Non-200 status; prefers the server's JSON `message` field.
fn status_error(status: StatusCode, body: &str) -> ChatError {
    let message = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
        .unwrap_or_else(|| truncate(body, ERROR_BODY_LIMIT));
    ChatError::HttpStatus {
        status: status.as_u16(),
        message,
    }
}

/// A 200 body may still carry an `error` field.
fn validate_payload(payload: &Value) -> Result<(), ChatError> {
    let Some(object) = payload.as_object() else {
        return Err(ChatError::MalformedResponse(format!(
            "expected a JSON object, got {}",
            truncate(&payload.to_string(), ERROR_BODY_LIMIT)
        )));
    };
    if let Some(error) = object.get("error").filter(|e| !e.is_null()) {
        let message = object
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| match error {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            });
        return Err(ChatError::Api { message });
    }
    if !object.contains_key("answer") {
        warn!("Reply has no 'answer' field");
    }
    if !object.contains_key("conversation_id") {
        warn!("Reply has no 'conversation_id' field");
    }
    Ok(())
}

fn truncate(text: &str, limit: usize) -> String {
    text.chars().take(limit).collect()
}
