use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::config::Config;
use crate::tool_registry::verdict_tool;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);
const TRANSIENT_BACKOFF: Duration = Duration::from_secs(5);
const TOOL_RETRY_BASE: Duration = Duration::from_secs(1);
const TOOL_RETRY_CAP: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Selects the tool set offered to the model and whether a tool call is
/// required.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    Retrospective,
    NextTask,
    GenerateAction,
    EvaluateMission,
}

impl CallMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Retrospective => "retrospective",
            Self::NextTask => "next_task",
            Self::GenerateAction => "generate_action",
            Self::EvaluateMission => "evaluate_mission",
        }
    }

    pub fn requires_tool(self) -> bool {
        matches!(self, Self::GenerateAction | Self::EvaluateMission)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolInvocation {
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CompletionReply {
    Text(String),
    Tool(ToolInvocation),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionErrorCode {
    Configuration,
    Transport,
    Service,
    MissingToolCall,
    InvalidResponse,
}

impl CompletionErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Configuration => "configuration",
            Self::Transport => "transport",
            Self::Service => "service_error",
            Self::MissingToolCall => "missing_tool_call",
            Self::InvalidResponse => "invalid_response",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletionError {
    pub code: CompletionErrorCode,
    pub message: String,
}

impl CompletionError {
    fn new(code: CompletionErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for CompletionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code.as_str(), self.message)
    }
}

impl std::error::Error for CompletionError {}

#[async_trait]
pub trait CompletionBackend: Send + Sync {
    async fn complete(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        mode: CallMode,
    ) -> Result<CompletionReply, CompletionError>;
}

/// Receives a snapshot of every request before it is sent.
pub trait RequestLogSink: Send + Sync {
    fn record(&self, mode: CallMode, attempt: u32, payload: &Value);
}

pub struct TracingRequestLog;

impl RequestLogSink for TracingRequestLog {
    fn record(&self, mode: CallMode, attempt: u32, payload: &Value) {
        debug!(mode = mode.as_str(), attempt, request = %payload, "completion request");
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub transient_backoff: Duration,
    pub tool_retry_limit: u32,
    pub tool_retry_base: Duration,
    pub tool_retry_cap: Duration,
}

impl RetryPolicy {
    pub fn with_tool_retry_limit(tool_retry_limit: u32) -> Self {
        Self {
            transient_backoff: TRANSIENT_BACKOFF,
            tool_retry_limit,
            tool_retry_base: TOOL_RETRY_BASE,
            tool_retry_cap: TOOL_RETRY_CAP,
        }
    }

    /// Backoff before the `retry`-th (1-based) re-request after a missing
    /// tool call.
    pub fn tool_backoff(&self, retry: u32) -> Duration {
        let factor = 2_u32.saturating_pow(retry.saturating_sub(1));
        self.tool_retry_base
            .saturating_mul(factor)
            .min(self.tool_retry_cap)
    }
}

/// Anthropic Messages API client.
pub struct AnthropicClient {
    http: Client,
    endpoint: String,
    api_key: String,
    model: String,
    max_tokens: u32,
    action_tools: Vec<Value>,
    retry: RetryPolicy,
    request_log: Option<Arc<dyn RequestLogSink>>,
}

enum Attempt {
    Reply(CompletionReply),
    NoToolCall,
    Transient(String),
}

impl AnthropicClient {
    pub fn new(config: &Config, action_tools: Vec<Value>) -> Result<Self, CompletionError> {
        let api_key = config.api_key().ok_or_else(|| {
            CompletionError::new(
                CompletionErrorCode::Configuration,
                "claudeApiKey is not configured",
            )
        })?;
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| {
                CompletionError::new(
                    CompletionErrorCode::Configuration,
                    format!("failed creating completion client: {err}"),
                )
            })?;
        Ok(Self {
            http,
            endpoint: resolve_messages_endpoint(&config.api_base_url),
            api_key: api_key.to_owned(),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            action_tools,
            retry: RetryPolicy::with_tool_retry_limit(config.tool_call_retry_limit),
            request_log: None,
        })
    }

    pub fn with_request_log(mut self, sink: Arc<dyn RequestLogSink>) -> Self {
        self.request_log = Some(sink);
        self
    }

    #[cfg(test)]
    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    fn build_payload(&self, system_prompt: &str, messages: &[ChatMessage], mode: CallMode) -> Value {
        let messages = messages
            .iter()
            .map(|message| {
                json!({
                    "role": message.role.as_str(),
                    "content": message.content,
                })
            })
            .collect::<Vec<_>>();
        let mut payload = json!({
            "model": self.model,
            "system": system_prompt,
            "messages": messages,
            "max_tokens": self.max_tokens,
        });
        let (tools, tool_choice) = match mode {
            CallMode::Retrospective | CallMode::NextTask => return payload,
            CallMode::GenerateAction => (self.action_tools.clone(), json!({ "type": "any" })),
            CallMode::EvaluateMission => (
                vec![verdict_tool()],
                json!({ "type": "tool", "name": "completion_verdict" }),
            ),
        };
        if let Value::Object(map) = &mut payload {
            map.insert("tools".to_owned(), Value::Array(tools));
            map.insert("tool_choice".to_owned(), tool_choice);
        }
        payload
    }

    async fn attempt(&self, payload: &Value, mode: CallMode) -> Result<Attempt, CompletionError> {
        let response = self
            .http
            .post(&self.endpoint)
            .header("Content-Type", "application/json")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(payload)
            .send()
            .await
            .map_err(|err| {
                CompletionError::new(
                    CompletionErrorCode::Transport,
                    format!("request to {} failed: {err}", self.endpoint),
                )
            })?;
        let status = response.status();
        let body = response.text().await.map_err(|err| {
            CompletionError::new(
                CompletionErrorCode::Transport,
                format!("failed reading response body: {err}"),
            )
        })?;

        if !status.is_success() {
            let message = service_error_message(&body)
                .unwrap_or_else(|| format!("status={} body={}", status.as_u16(), body.trim()));
            if is_transient(status.as_u16(), &message) {
                return Ok(Attempt::Transient(message));
            }
            return Err(CompletionError::new(CompletionErrorCode::Service, message));
        }

        let parsed: Value = serde_json::from_str(&body).map_err(|err| {
            CompletionError::new(
                CompletionErrorCode::InvalidResponse,
                format!("response is not JSON: {err}"),
            )
        })?;
        if parsed.get("type").and_then(Value::as_str) == Some("error") {
            let message = service_error_message(&body).unwrap_or(body);
            if is_transient(status.as_u16(), &message) {
                return Ok(Attempt::Transient(message));
            }
            return Err(CompletionError::new(CompletionErrorCode::Service, message));
        }

        match parse_reply(&parsed)? {
            CompletionReply::Text(_) if mode.requires_tool() => Ok(Attempt::NoToolCall),
            reply => Ok(Attempt::Reply(reply)),
        }
    }
}

#[async_trait]
impl CompletionBackend for AnthropicClient {
    async fn complete(
        &self,
        system_prompt: &str,
        messages: &[ChatMessage],
        mode: CallMode,
    ) -> Result<CompletionReply, CompletionError> {
        let payload = self.build_payload(system_prompt, messages, mode);
        let mut attempt_no = 0_u32;
        let mut tool_retries = 0_u32;
        loop {
            attempt_no += 1;
            if let Some(sink) = &self.request_log {
                sink.record(mode, attempt_no, &payload);
            }
            match self.attempt(&payload, mode).await? {
                Attempt::Reply(reply) => return Ok(reply),
                Attempt::Transient(message) => {
                    warn!(
                        mode = mode.as_str(),
                        "transient service error, retrying in {}s: {message}",
                        self.retry.transient_backoff.as_secs()
                    );
                    tokio::time::sleep(self.retry.transient_backoff).await;
                }
                Attempt::NoToolCall => {
                    if tool_retries >= self.retry.tool_retry_limit {
                        return Err(CompletionError::new(
                            CompletionErrorCode::MissingToolCall,
                            format!(
                                "no tool call in {} response after {} retries",
                                mode.as_str(),
                                tool_retries
                            ),
                        ));
                    }
                    tool_retries += 1;
                    let delay = self.retry.tool_backoff(tool_retries);
                    warn!(
                        mode = mode.as_str(),
                        retry = tool_retries,
                        "response carried no tool call, retrying in {}ms",
                        delay.as_millis()
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

fn resolve_messages_endpoint(base_url: &str) -> String {
    let trimmed = base_url.trim().trim_end_matches('/');
    if trimmed.ends_with("/v1/messages") {
        trimmed.to_owned()
    } else if trimmed.ends_with("/v1") {
        format!("{trimmed}/messages")
    } else {
        format!("{trimmed}/v1/messages")
    }
}

fn service_error_message(body: &str) -> Option<String> {
    let parsed: Value = serde_json::from_str(body).ok()?;
    parsed
        .pointer("/error/message")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

fn is_transient(status: u16, message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    status == 429
        || status == 529
        || lowered.contains("rate limit")
        || lowered.contains("rate_limit")
        || lowered.contains("overloaded")
}

fn parse_reply(parsed: &Value) -> Result<CompletionReply, CompletionError> {
    let blocks = parsed
        .get("content")
        .and_then(Value::as_array)
        .ok_or_else(|| {
            CompletionError::new(
                CompletionErrorCode::InvalidResponse,
                "response has no content array",
            )
        })?;

    let tool_call = blocks
        .iter()
        .find(|block| block.get("type").and_then(Value::as_str) == Some("tool_use"));
    if let Some(block) = tool_call {
        let name = block
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned();
        let input = block.get("input").cloned().unwrap_or_else(|| json!({}));
        return Ok(CompletionReply::Tool(ToolInvocation { name, input }));
    }

    let text = blocks
        .iter()
        .filter(|block| block.get("type").and_then(Value::as_str) == Some("text"))
        .filter_map(|block| block.get("text").and_then(Value::as_str))
        .collect::<Vec<_>>()
        .join("\n");
    Ok(CompletionReply::Text(text))
}
