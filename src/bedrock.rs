//! Converse driver.
//!
//! Owns the Converse-side domain model (messages, content blocks, tool
//! configuration, stream events), the `ConverseApi` seam over the actual AWS
//! SDK client, and `BedrockService`, which drives blocking and streaming
//! calls and normalizes upstream events into `StreamDelta` frames for the
//! SSE adapters.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use futures_util::stream::{Stream, StreamExt};
use serde_json::Value;

use crate::conversion;
use crate::error::ServiceError;
use crate::models::chat::{
    ChatChunkToolCall, ChatCompletionRequest, ToolCall, ToolCallFunction, ToolCallFunctionDelta,
};

// ============================================================================
// Converse domain model
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConverseRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text(String),
    ToolUse(ToolUseBlock),
    ToolResult(ToolResultBlock),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolUseBlock {
    pub id: String,
    pub name: String,
    pub input: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolResultBlock {
    pub tool_use_id: String,
    pub content: Vec<ToolResultContent>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolResultContent {
    Text(String),
    Json(Value),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ConverseMessage {
    pub role: ConverseRole,
    pub content: Vec<ContentBlock>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolSpec {
    pub name: String,
    pub description: Option<String>,
    pub input_schema: Value,
    pub strict: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ToolChoice {
    Auto,
    Any,
    Tool(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolConfig {
    pub tools: Vec<ToolSpec>,
    pub tool_choice: Option<ToolChoice>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct InferenceConfig {
    pub temperature: Option<f32>,
    pub top_p: Option<f32>,
    pub max_tokens: Option<i32>,
}

#[derive(Debug, Clone)]
pub struct ConverseRequest {
    pub model_id: String,
    pub messages: Vec<ConverseMessage>,
    pub system: Vec<String>,
    pub inference: Option<InferenceConfig>,
    pub tool_config: Option<ToolConfig>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConverseUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    Other(String),
}

#[derive(Debug, Clone)]
pub struct ConverseReply {
    pub content: Vec<ContentBlock>,
    pub stop_reason: StopReason,
    pub usage: Option<ConverseUsage>,
    pub latency_ms: i64,
}

/// One upstream ConverseStream event, already lifted out of SDK types.
#[derive(Debug, Clone)]
pub enum ConverseStreamEvent {
    MessageStart,
    ContentBlockStart {
        block_index: usize,
        tool_use: Option<ToolUseStart>,
    },
    ContentBlockDelta {
        block_index: usize,
        delta: BlockDelta,
    },
    ContentBlockStop {
        block_index: usize,
    },
    MessageStop {
        stop_reason: StopReason,
    },
    Metadata {
        usage: Option<ConverseUsage>,
        latency_ms: Option<i64>,
    },
}

#[derive(Debug, Clone)]
pub struct ToolUseStart {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone)]
pub enum BlockDelta {
    Text(String),
    ToolUseInput(String),
}

pub type ConverseEventStream =
    Pin<Box<dyn Stream<Item = Result<ConverseStreamEvent, ServiceError>> + Send>>;

/// Seam over the upstream Converse protocol. Production uses the AWS SDK
/// implementation in `crate::aws`; tests substitute scripted event streams.
#[async_trait]
pub trait ConverseApi: Send + Sync {
    async fn converse(&self, request: ConverseRequest) -> Result<ConverseReply, ServiceError>;

    async fn converse_stream(
        &self,
        request: ConverseRequest,
    ) -> Result<ConverseEventStream, ServiceError>;
}

// ============================================================================
// Normalized results
// ============================================================================

/// Normalized frame handed to the SSE adapters, one per emitted delta.
/// `tool_calls[].index` is the stable tool-call slot, not the upstream
/// content-block index.
#[derive(Debug, Clone, Default)]
pub struct StreamDelta {
    pub role: Option<String>,
    pub text: Option<String>,
    pub tool_calls: Vec<ChatChunkToolCall>,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ChatResult {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
    pub latency_ms: i64,
    pub finish_reason: String,
}

// ============================================================================
// Service
// ============================================================================

struct ServiceInner {
    client: Option<Arc<dyn ConverseApi>>,
    default_model_id: String,
}

/// Per-process Converse driver. The client handle and default model are
/// hot-swappable; readers copy them out under a short read lock.
pub struct BedrockService {
    inner: RwLock<ServiceInner>,
    default_max_output_tokens: i32,
    min_tool_max_output_tokens: i32,
    force_tool_use: bool,
}

impl BedrockService {
    pub fn new(
        client: Option<Arc<dyn ConverseApi>>,
        default_model_id: &str,
        default_max_output_tokens: i32,
        min_tool_max_output_tokens: i32,
        force_tool_use: bool,
    ) -> Self {
        Self {
            inner: RwLock::new(ServiceInner {
                client,
                default_model_id: default_model_id.trim().to_string(),
            }),
            default_max_output_tokens,
            min_tool_max_output_tokens,
            force_tool_use,
        }
    }

    /// Maps the requested model to `(log_model, backend_model_id)`. An empty
    /// request resolves to the configured default under the name "default".
    pub fn resolve_model(&self, request_model: &str) -> Result<(String, String), ServiceError> {
        let request_model = request_model.trim();
        let inner = self.inner.read().expect("service lock");

        if request_model.is_empty() {
            if inner.default_model_id.is_empty() {
                return Err(ServiceError::ModelRequired);
            }
            return Ok(("default".to_string(), inner.default_model_id.clone()));
        }
        Ok((request_model.to_string(), request_model.to_string()))
    }

    pub fn replace_client(&self, client: Option<Arc<dyn ConverseApi>>) {
        self.inner.write().expect("service lock").client = client;
    }

    pub fn set_default_model_id(&self, default_model_id: &str) {
        self.inner.write().expect("service lock").default_model_id =
            default_model_id.trim().to_string();
    }

    pub fn default_model_id(&self) -> String {
        self.inner
            .read()
            .expect("service lock")
            .default_model_id
            .clone()
    }

    pub fn has_client(&self) -> bool {
        self.inner.read().expect("service lock").client.is_some()
    }

    fn snapshot_client(&self) -> Result<Arc<dyn ConverseApi>, ServiceError> {
        self.inner
            .read()
            .expect("service lock")
            .client
            .clone()
            .ok_or(ServiceError::ClientNotConfigured)
    }

    /// Message hygiene + translation + tool/inference configuration, shared
    /// by the blocking and streaming paths.
    fn prepare(
        &self,
        mut request: ChatCompletionRequest,
        model_id: &str,
    ) -> Result<ConverseRequest, ServiceError> {
        conversion::ensure_tool_call_ids(&mut request.messages);
        request.messages = conversion::fix_missing_tool_responses(request.messages);

        let (messages, system) = conversion::build_converse_messages(&request.messages)?;
        let tool_config = conversion::build_tool_configuration(
            &request.tools,
            request.tool_choice.as_ref(),
            self.force_tool_use,
        )?;

        let inference = build_inference_config(
            &request,
            self.default_max_output_tokens,
            self.min_tool_max_output_tokens,
            tool_config.is_some(),
        );

        Ok(ConverseRequest {
            model_id: model_id.to_string(),
            messages,
            system,
            inference,
            tool_config,
        })
    }

    /// Blocking Converse call.
    pub async fn converse(
        &self,
        request: ChatCompletionRequest,
        model_id: &str,
    ) -> Result<ChatResult, ServiceError> {
        let converse_request = self.prepare(request, model_id)?;
        let client = self.snapshot_client()?;

        let reply = client.converse(converse_request).await?;

        let (text, tool_calls) = extract_output_payload(&reply.content);
        let mut result = ChatResult {
            text,
            tool_calls,
            finish_reason: map_stop_reason(&reply.stop_reason),
            latency_ms: reply.latency_ms,
            ..Default::default()
        };
        if let Some(usage) = reply.usage {
            result.input_tokens = usage.input_tokens;
            result.output_tokens = usage.output_tokens;
            result.total_tokens = usage.total_tokens;
        }
        Ok(result)
    }

    /// Open a ConverseStream. Errors here happen before any SSE bytes have
    /// been written, so the HTTP layer can still answer with a JSON body.
    pub async fn open_stream(
        &self,
        request: ChatCompletionRequest,
        model_id: &str,
    ) -> Result<ConverseStreamSession, ServiceError> {
        let converse_request = self.prepare(request, model_id)?;
        let client = self.snapshot_client()?;
        let events = client.converse_stream(converse_request).await?;
        Ok(ConverseStreamSession { events })
    }
}

/// An opened upstream stream, ready to be driven to completion.
pub struct ConverseStreamSession {
    events: ConverseEventStream,
}

impl ConverseStreamSession {
    /// Consume upstream events in order, invoking `on_delta` for every
    /// normalized frame.
    ///
    /// Ordering contract: the first frame that carries tool calls also
    /// carries `role: "assistant"`; pure-text streams get a dedicated role
    /// frame before the first text. `role` is emitted exactly once.
    pub async fn drive<F>(mut self, mut on_delta: F) -> Result<ChatResult, ServiceError>
    where
        F: FnMut(StreamDelta) -> Result<(), ServiceError>,
    {
        let mut result = ChatResult {
            finish_reason: "stop".to_string(),
            ..Default::default()
        };
        let mut text = String::new();
        let mut role_sent = false;
        let mut tool_calls: Vec<ToolCall> = Vec::with_capacity(2);
        let mut slot_by_block: HashMap<usize, usize> = HashMap::new();

        while let Some(event) = self.events.next().await {
            match event? {
                ConverseStreamEvent::MessageStart => {
                    // Role emission is deferred: the first tool-call frame or
                    // the first text frame carries it.
                }
                ConverseStreamEvent::ContentBlockStart {
                    block_index,
                    tool_use,
                } => {
                    let Some(start) = tool_use else { continue };

                    let slot = tool_calls.len();
                    let mut tool_call_id = start.id.trim().to_string();
                    if tool_call_id.is_empty() {
                        tool_call_id = format!("toolcall_{}", slot + 1);
                    }
                    let mut tool_name = start.name.trim().to_string();
                    if tool_name.is_empty() {
                        tool_name = "unknown_tool".to_string();
                    }

                    tool_calls.push(ToolCall {
                        id: tool_call_id.clone(),
                        call_type: "function".into(),
                        function: ToolCallFunction {
                            name: tool_name.clone(),
                            arguments: String::new(),
                        },
                    });
                    slot_by_block.insert(block_index, slot);

                    let mut delta = StreamDelta {
                        tool_calls: vec![ChatChunkToolCall {
                            index: slot,
                            id: Some(tool_call_id),
                            call_type: Some("function".into()),
                            function: Some(ToolCallFunctionDelta {
                                name: Some(tool_name),
                                arguments: None,
                            }),
                        }],
                        ..Default::default()
                    };
                    // The first tool-call frame must also carry the role.
                    if slot == 0 && !role_sent {
                        delta.role = Some("assistant".into());
                    }
                    role_sent = true;
                    on_delta(delta)?;
                }
                ConverseStreamEvent::ContentBlockDelta {
                    block_index,
                    delta: BlockDelta::Text(fragment),
                } => {
                    let _ = block_index;
                    if !role_sent {
                        role_sent = true;
                        on_delta(StreamDelta {
                            role: Some("assistant".into()),
                            ..Default::default()
                        })?;
                    }
                    if fragment.is_empty() {
                        continue;
                    }
                    text.push_str(&fragment);
                    on_delta(StreamDelta {
                        text: Some(fragment),
                        ..Default::default()
                    })?;
                }
                ConverseStreamEvent::ContentBlockDelta {
                    block_index,
                    delta: BlockDelta::ToolUseInput(fragment),
                } => {
                    let slot = match slot_by_block.get(&block_index) {
                        Some(slot) => *slot,
                        None => {
                            // Input arrived without a ContentBlockStart;
                            // allocate a slot with a synthetic id.
                            let slot = tool_calls.len();
                            tool_calls.push(ToolCall {
                                id: format!("toolcall_{}", slot + 1),
                                call_type: "function".into(),
                                function: ToolCallFunction::default(),
                            });
                            slot_by_block.insert(block_index, slot);
                            slot
                        }
                    };
                    if fragment.is_empty() {
                        continue;
                    }
                    tool_calls[slot].function.arguments.push_str(&fragment);
                    on_delta(StreamDelta {
                        tool_calls: vec![ChatChunkToolCall {
                            index: slot,
                            function: Some(ToolCallFunctionDelta {
                                name: None,
                                arguments: Some(fragment),
                            }),
                            ..Default::default()
                        }],
                        ..Default::default()
                    })?;
                }
                ConverseStreamEvent::ContentBlockStop { .. } => {}
                ConverseStreamEvent::MessageStop { stop_reason } => {
                    result.finish_reason = map_stop_reason(&stop_reason);
                }
                ConverseStreamEvent::Metadata { usage, latency_ms } => {
                    if let Some(usage) = usage {
                        result.input_tokens = usage.input_tokens;
                        result.output_tokens = usage.output_tokens;
                        result.total_tokens = usage.total_tokens;
                    }
                    if let Some(latency_ms) = latency_ms {
                        result.latency_ms = latency_ms;
                    }
                }
            }
        }

        result.text = text;
        result.tool_calls = tool_calls;
        Ok(result)
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn map_stop_reason(reason: &StopReason) -> String {
    match reason {
        StopReason::MaxTokens => "length".to_string(),
        StopReason::ToolUse => "tool_calls".to_string(),
        _ => "stop".to_string(),
    }
}

/// Collect sampling parameters. When tools are present and the effective max
/// sits below the configured floor, raise it so tool-call JSON is not cut
/// off mid-argument. Returns None when no field is set at all.
fn build_inference_config(
    request: &ChatCompletionRequest,
    default_max_output_tokens: i32,
    min_tool_max_output_tokens: i32,
    has_tools: bool,
) -> Option<InferenceConfig> {
    let mut cfg = InferenceConfig::default();
    let mut has_any = false;

    if let Some(temperature) = request.temperature {
        cfg.temperature = Some(temperature as f32);
        has_any = true;
    }
    if let Some(top_p) = request.top_p {
        cfg.top_p = Some(top_p as f32);
        has_any = true;
    }

    let mut max_tokens = match request.max_tokens {
        Some(value) if value > 0 => Some(value as i32),
        _ if default_max_output_tokens > 0 => Some(default_max_output_tokens),
        _ => None,
    };
    if has_tools && min_tool_max_output_tokens > 0 {
        if let Some(current) = max_tokens {
            if current < min_tool_max_output_tokens {
                tracing::debug!(
                    requested = current,
                    effective = min_tool_max_output_tokens,
                    "raising max_tokens to the tool-use floor"
                );
                max_tokens = Some(min_tool_max_output_tokens);
            }
        }
    }
    if let Some(value) = max_tokens {
        cfg.max_tokens = Some(value);
        has_any = true;
    }

    if has_any {
        Some(cfg)
    } else {
        None
    }
}

/// Walk reply content blocks into concatenated text plus OpenAI ToolCalls.
fn extract_output_payload(content: &[ContentBlock]) -> (String, Vec<ToolCall>) {
    let mut text = String::new();
    let mut tool_calls: Vec<ToolCall> = Vec::with_capacity(2);

    for block in content {
        match block {
            ContentBlock::Text(value) => text.push_str(value),
            ContentBlock::ToolUse(tool_use) => {
                let mut tool_call_id = tool_use.id.trim().to_string();
                if tool_call_id.is_empty() {
                    tool_call_id = format!("toolcall_{}", tool_calls.len() + 1);
                }
                let mut tool_name = tool_use.name.trim().to_string();
                if tool_name.is_empty() {
                    tool_name = "unknown_tool".to_string();
                }
                let arguments = if tool_use.input.is_null() {
                    "{}".to_string()
                } else {
                    tool_use.input.to_string()
                };
                tool_calls.push(ToolCall {
                    id: tool_call_id,
                    call_type: "function".into(),
                    function: ToolCallFunction {
                        name: tool_name,
                        arguments,
                    },
                });
            }
            ContentBlock::ToolResult(_) => {}
        }
    }

    (text, tool_calls)
}
