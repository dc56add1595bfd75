//! Gateway to the local inference server (Ollama-compatible chat API).
//!
//! This is the only module that speaks the inference protocol. Both the chat
//! orchestrator and the document extractor go through it.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::config::AppConfig;

const HEALTH_CHECK_TIMEOUT_SECS: u64 = 5;
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// One event in the orchestration stream. The serde representation is the
/// wire format the SSE transport emits verbatim.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatEvent {
    Content { content: String },
    ToolCall { name: String, arguments: Value },
    ToolResult { name: String, result: String },
    Done,
    Error { error: String },
}

/// One turn in the model-visible conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatTurn {
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallPayload>>,
}

impl ChatTurn {
    pub fn system(content: impl Into<String>) -> Self {
        Self::plain("system", content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::plain("user", content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::plain("assistant", content)
    }

    /// A tool-role turn carrying one tool result back to the model.
    pub fn tool(content: impl Into<String>) -> Self {
        Self::plain("tool", content)
    }

    pub fn assistant_with_tool_calls(
        content: impl Into<String>,
        tool_calls: Vec<ToolCallPayload>,
    ) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
            tool_calls: Some(tool_calls),
        }
    }

    fn plain(role: &str, content: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            content: content.into(),
            tool_calls: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallPayload {
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCallFunction {
    pub name: String,
    pub arguments: Value,
}

/// Result of probing the inference server. Never an error.
#[derive(Debug, Clone, Serialize)]
pub struct LlmStatus {
    pub reachable: bool,
    pub installed_models: Vec<String>,
    pub configured_chat_model: String,
    pub configured_extraction_model: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ChatOptions {
    pub json_format: bool,
    pub timeout: Duration,
}

impl ChatOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            json_format: false,
            timeout,
        }
    }

    pub fn json(timeout: Duration) -> Self {
        Self {
            json_format: true,
            timeout,
        }
    }
}

/// Executes a tool call on behalf of the gateway's tool loop.
#[async_trait]
pub trait ToolExecutor: Send + Sync + 'static {
    async fn execute(&self, name: &str, arguments: &Value) -> String;
}

#[async_trait]
pub trait LlmGateway: Send + Sync + 'static {
    async fn health_check(&self) -> LlmStatus;

    /// Non-streaming completion. Returns the full assistant text.
    async fn chat(
        &self,
        turns: Vec<ChatTurn>,
        model: &str,
        options: ChatOptions,
    ) -> anyhow::Result<String>;

    /// Streaming completion without tools.
    async fn chat_stream(&self, turns: Vec<ChatTurn>) -> mpsc::Receiver<ChatEvent>;

    /// Streaming completion with the tool-calling loop. Events arrive on the
    /// returned channel; dropping the receiver cancels the loop and closes
    /// the upstream connection.
    async fn chat_with_tools(
        &self,
        turns: Vec<ChatTurn>,
        tools: Vec<Value>,
        executor: Arc<dyn ToolExecutor>,
    ) -> mpsc::Receiver<ChatEvent>;
}

#[derive(Clone)]
pub struct OllamaGateway {
    client: Client,
    base_url: String,
    chat_model: String,
    timeout: Duration,
    tool_round_limit: usize,
    configured_extraction_model: String,
}

impl OllamaGateway {
    pub fn from_config(config: &AppConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .expect("failed to create HTTP client");

        Self {
            client,
            base_url: config.inference_host.trim_end_matches('/').to_string(),
            chat_model: config.inference_chat_model.clone(),
            timeout: Duration::from_secs(config.inference_timeout_seconds),
            tool_round_limit: config.tool_round_limit,
            configured_extraction_model: config.inference_extraction_model.clone(),
        }
    }

    /// One streaming round against `/api/chat`. Content deltas are forwarded
    /// onto `tx` as they arrive; tool calls are collected and returned.
    async fn stream_round(
        &self,
        turns: &[ChatTurn],
        tools: Option<&[Value]>,
        tx: &mpsc::Sender<ChatEvent>,
    ) -> Result<RoundOutcome, RoundError> {
        let start = Instant::now();
        let request = ChatRequest {
            model: &self.chat_model,
            messages: turns,
            stream: true,
            format: None,
            tools,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(self.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| RoundError::Upstream(format!("request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(RoundError::Upstream(format!(
                "inference server returned {status}: {body}"
            )));
        }

        let mut outcome = RoundOutcome::default();
        let mut body = response.bytes_stream();
        let mut buffer: Vec<u8> = Vec::new();

        while let Some(chunk) = body.next().await {
            let chunk = chunk.map_err(|e| RoundError::Upstream(format!("stream failed: {e}")))?;
            buffer.extend_from_slice(&chunk);

            while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let Some(parsed) = parse_stream_line(&line) else {
                    continue;
                };

                if let Some(message) = parsed.message {
                    if !message.content.is_empty() {
                        outcome.content.push_str(&message.content);
                        let event = ChatEvent::Content {
                            content: message.content,
                        };
                        if tx.send(event).await.is_err() {
                            // Receiver gone: abort, dropping the response body
                            // closes the upstream connection.
                            return Err(RoundError::Cancelled);
                        }
                    }
                    if let Some(calls) = message.tool_calls {
                        outcome.tool_calls.extend(calls);
                    }
                }

                if parsed.done {
                    debug!(
                        duration_ms = start.elapsed().as_millis() as u64,
                        content_len = outcome.content.len(),
                        tool_calls = outcome.tool_calls.len(),
                        "streaming round complete"
                    );
                    return Ok(outcome);
                }
            }
        }

        // Stream ended without a done marker; treat what we have as the turn.
        Ok(outcome)
    }

    async fn run_tool_loop(
        self,
        mut conversation: Vec<ChatTurn>,
        tools: Vec<Value>,
        executor: Arc<dyn ToolExecutor>,
        tx: mpsc::Sender<ChatEvent>,
    ) {
        for _round in 0..self.tool_round_limit {
            let outcome = match self.stream_round(&conversation, Some(&tools), &tx).await {
                Ok(outcome) => outcome,
                Err(RoundError::Cancelled) => return,
                Err(RoundError::Upstream(reason)) => {
                    warn!(error = %reason, "tool loop aborted on upstream error");
                    let _ = tx.send(ChatEvent::Error { error: reason }).await;
                    return;
                }
            };

            if outcome.tool_calls.is_empty() {
                let _ = tx.send(ChatEvent::Done).await;
                return;
            }

            for call in &outcome.tool_calls {
                let event = ChatEvent::ToolCall {
                    name: call.function.name.clone(),
                    arguments: call.function.arguments.clone(),
                };
                if tx.send(event).await.is_err() {
                    return;
                }
            }

            conversation.push(ChatTurn::assistant_with_tool_calls(
                outcome.content,
                outcome.tool_calls.clone(),
            ));

            for call in outcome.tool_calls {
                let name = call.function.name;
                let result = executor.execute(&name, &call.function.arguments).await;
                let event = ChatEvent::ToolResult {
                    name,
                    result: result.clone(),
                };
                if tx.send(event).await.is_err() {
                    return;
                }
                conversation.push(ChatTurn::tool(result));
            }
        }

        warn!(
            limit = self.tool_round_limit,
            "tool round limit exceeded without a final answer"
        );
        let _ = tx
            .send(ChatEvent::Error {
                error: "tool_loop_exhausted".to_string(),
            })
            .await;
    }
}

#[async_trait]
impl LlmGateway for OllamaGateway {
    async fn health_check(&self) -> LlmStatus {
        let mut status = LlmStatus {
            reachable: false,
            installed_models: Vec::new(),
            configured_chat_model: self.chat_model.clone(),
            configured_extraction_model: self.configured_extraction_model.clone(),
            error: None,
        };

        let response = self
            .client
            .get(format!("{}/api/tags", self.base_url))
            .timeout(Duration::from_secs(HEALTH_CHECK_TIMEOUT_SECS))
            .send()
            .await;

        match response {
            Ok(response) if response.status().is_success() => {
                match response.json::<TagsResponse>().await {
                    Ok(tags) => {
                        status.reachable = true;
                        status.installed_models =
                            tags.models.into_iter().map(|m| m.name).collect();
                    }
                    Err(e) => status.error = Some(format!("failed to parse model list: {e}")),
                }
            }
            Ok(response) => {
                status.error = Some(format!(
                    "inference server returned {}",
                    response.status()
                ));
            }
            Err(e) => status.error = Some(format!("cannot reach inference server: {e}")),
        }

        status
    }

    async fn chat(
        &self,
        turns: Vec<ChatTurn>,
        model: &str,
        options: ChatOptions,
    ) -> anyhow::Result<String> {
        let start = Instant::now();
        let format = options.json_format.then(|| Value::String("json".into()));
        let request = ChatRequest {
            model,
            messages: &turns,
            stream: false,
            format,
            tools: None,
        };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .timeout(options.timeout)
            .json(&request)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("request failed: {e}"))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("inference server returned {status}: {body}");
        }

        let result: ChatResponse = response
            .json()
            .await
            .map_err(|e| anyhow::anyhow!("failed to parse response: {e}"))?;

        let elapsed = start.elapsed().as_millis() as u64;
        debug!(
            model,
            response_len = result.message.content.len(),
            duration_ms = elapsed,
            "chat complete"
        );
        if elapsed > 30_000 {
            warn!(model, duration_ms = elapsed, slow = true, "slow chat completion");
        }

        Ok(result.message.content)
    }

    async fn chat_stream(&self, turns: Vec<ChatTurn>) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let gateway = self.clone();
        tokio::spawn(async move {
            match gateway.stream_round(&turns, None, &tx).await {
                Ok(_) => {
                    let _ = tx.send(ChatEvent::Done).await;
                }
                Err(RoundError::Cancelled) => {}
                Err(RoundError::Upstream(reason)) => {
                    let _ = tx.send(ChatEvent::Error { error: reason }).await;
                }
            }
        });
        rx
    }

    async fn chat_with_tools(
        &self,
        turns: Vec<ChatTurn>,
        tools: Vec<Value>,
        executor: Arc<dyn ToolExecutor>,
    ) -> mpsc::Receiver<ChatEvent> {
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let gateway = self.clone();
        tokio::spawn(gateway.run_tool_loop(turns, tools, executor, tx));
        rx
    }
}

#[derive(Default)]
struct RoundOutcome {
    content: String,
    tool_calls: Vec<ToolCallPayload>,
}

enum RoundError {
    Upstream(String),
    Cancelled,
}

/// Request payload for the `/api/chat` endpoint.
#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatTurn],
    stream: bool,
    /// Set to `"json"` for guaranteed valid JSON output.
    #[serde(skip_serializing_if = "Option::is_none")]
    format: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<&'a [Value]>,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    #[serde(default)]
    content: String,
}

/// One NDJSON line of a streaming `/api/chat` response.
#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    message: Option<StreamMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct StreamMessage {
    #[serde(default)]
    content: String,
    #[serde(default)]
    tool_calls: Option<Vec<ToolCallPayload>>,
}

fn parse_stream_line(line: &[u8]) -> Option<StreamChunk> {
    let text = std::str::from_utf8(line).ok()?.trim();
    if text.is_empty() {
        return None;
    }
    match serde_json::from_str(text) {
        Ok(chunk) => Some(chunk),
        Err(e) => {
            warn!(error = %e, "skipping malformed stream chunk");
            None
        }
    }
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagModel>,
}

#[derive(Deserialize)]
struct TagModel {
    name: String,
}
