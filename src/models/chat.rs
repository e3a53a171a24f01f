//! OpenAI Chat Completions wire types.
//!
//! Message content is deliberately kept as `serde_json::Value`: clients send
//! null, a plain string, or an array of typed parts, and several fields only
//! need to round-trip. `decode_content_as_text` is the single place that
//! flattens the polymorphic shape into text.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServiceError;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<Tool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    // Fields some clients send that we accept but do not forward upstream.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence_penalty: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub frequency_penalty: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logit_bias: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub logprobs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_logprobs: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_options: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatCompletionChoice>,
    pub usage: Usage,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChoice {
    pub index: u32,
    pub message: ChatMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub model: String,
    pub choices: Vec<ChatChunkChoice>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorPayload>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatChunkChoice {
    pub index: u32,
    pub delta: ChatChunkDelta,
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ChatChunkToolCall>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChatChunkToolCall {
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub call_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<ToolCallFunctionDelta>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallFunctionDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<String>,
}

/// Tool definition. Two encodings are accepted on the wire: the standard
/// nested `function` object, and a flat form with the fields at the top level
/// (sent by Responses-style clients). `resolved_function` normalizes both.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Tool {
    #[serde(rename = "type", default)]
    pub tool_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<ToolFunction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

impl Tool {
    /// Returns the function definition regardless of which encoding was used.
    pub fn resolved_function(&self) -> Option<ToolFunction> {
        if let Some(function) = &self.function {
            return Some(function.clone());
        }
        match &self.name {
            Some(name) if !name.trim().is_empty() => Some(ToolFunction {
                name: name.clone(),
                description: self.description.clone(),
                parameters: self.parameters.clone(),
                strict: self.strict,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolFunction {
    #[serde(default)]
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCall {
    #[serde(default)]
    pub id: String,
    #[serde(rename = "type", default)]
    pub call_type: String,
    #[serde(default)]
    pub function: ToolCallFunction,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolCallFunction {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub arguments: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelsResponse {
    pub object: String,
    pub data: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
    #[serde(rename = "type")]
    pub error_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub code: String,
}

pub fn validate_chat_request(request: &ChatCompletionRequest) -> Result<(), ServiceError> {
    if request.messages.is_empty() {
        return Err(ServiceError::invalid("messages cannot be empty"));
    }
    Ok(())
}

/// Flatten polymorphic message content into plain text.
///
/// Accepts null, a string, an object part, or an array of parts. Parts typed
/// `text`/`input_text`/`output_text` (or untyped) contribute their text;
/// other typed parts such as `tool_use`/`tool_result` are walked over without
/// contributing, since the translator lifts those separately.
pub fn decode_content_as_text(content: &Value) -> Result<String, ServiceError> {
    match content {
        Value::Null => Ok(String::new()),
        Value::String(text) => Ok(text.clone()),
        Value::Array(parts) => {
            let mut out = String::new();
            for part in parts {
                match part {
                    Value::Object(_) => {
                        if let Some(text) = text_part(part) {
                            out.push_str(text);
                        }
                    }
                    _ => {
                        return Err(ServiceError::invalid("unsupported content part"));
                    }
                }
            }
            Ok(out)
        }
        Value::Object(_) => Ok(text_part(content).unwrap_or_default().to_string()),
        _ => Err(ServiceError::invalid("unsupported content format")),
    }
}

fn text_part(part: &Value) -> Option<&str> {
    let part_type = part.get("type").and_then(Value::as_str).unwrap_or("");
    match part_type {
        "" | "text" | "input_text" | "output_text" => {
            Some(part.get("text").and_then(Value::as_str).unwrap_or(""))
        }
        _ => None,
    }
}

/// Render a conversation as `role: text` lines for the call-log preview,
/// annotating tool calls and tool responses, capped at `max_chars`.
pub fn render_messages_for_log(messages: &[ChatMessage], max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }

    let mut out = String::new();
    for message in messages {
        let mut text = decode_content_as_text(&message.content)
            .unwrap_or_else(|_| "<unparseable-content>".to_string());
        if !message.tool_calls.is_empty() {
            if let Ok(blob) = serde_json::to_string(&message.tool_calls) {
                if text.trim().is_empty() {
                    text = format!("tool_calls={blob}");
                } else {
                    text = format!("{text} tool_calls={blob}");
                }
            }
        }
        if message.role.trim().eq_ignore_ascii_case("tool") {
            if let Some(tool_call_id) = message.tool_call_id.as_deref() {
                let tool_call_id = tool_call_id.trim();
                if !tool_call_id.is_empty() {
                    if text.trim().is_empty() {
                        text = format!("tool_call_id={tool_call_id}");
                    } else {
                        text = format!("tool_call_id={tool_call_id} {text}");
                    }
                }
            }
        }

        let line = format!("{}: {}", message.role, text);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(line);
        if out.chars().count() >= max_chars {
            break;
        }
    }

    crate::util::truncate_chars(&out, max_chars)
}

/// Render the full request (tool summary, tool_choice, messages) for the
/// call-log preview.
pub fn render_request_for_log(request: &ChatCompletionRequest, max_chars: usize) -> String {
    if max_chars == 0 {
        return String::new();
    }

    let mut out = String::new();

    if !request.tools.is_empty() {
        out.push_str(&format!("[tools: {}]\n", request.tools.len()));
        for (index, tool) in request.tools.iter().enumerate() {
            if let Some(function) = tool.resolved_function() {
                out.push_str(&format!("  {}. {}", index + 1, function.name));
                if let Some(description) = function.description.as_deref() {
                    if !description.is_empty() {
                        let short = crate::util::truncate_chars(description, 50);
                        out.push_str(&format!(" - {short}"));
                    }
                }
                out.push('\n');
            }
            if out.chars().count() >= max_chars / 3 {
                out.push_str(&format!(
                    "  ... {} more tools\n",
                    request.tools.len().saturating_sub(index + 1)
                ));
                break;
            }
        }
    }

    if let Some(tool_choice) = &request.tool_choice {
        out.push_str(&format!("[tool_choice: {tool_choice}]\n"));
    }

    out.push_str("\n[messages]\n");
    let used = out.chars().count();
    out.push_str(&render_messages_for_log(
        &request.messages,
        max_chars.saturating_sub(used),
    ));

    crate::util::truncate_chars(&out, max_chars)
}
