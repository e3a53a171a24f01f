//! OpenAI → Converse translation.
//!
//! Three stages, run in order by the driver:
//! 1. tool-call id hygiene (`ensure_tool_call_ids`),
//! 2. missing tool-response synthesis (`fix_missing_tool_responses`),
//! 3. role mapping into Converse messages plus system content
//!    (`build_converse_messages`) and tool configuration
//!    (`build_tool_configuration`).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};

use crate::bedrock::{
    ContentBlock, ConverseMessage, ConverseRole, ToolChoice, ToolConfig, ToolResultBlock,
    ToolResultContent, ToolSpec, ToolUseBlock,
};
use crate::error::ServiceError;
use crate::models::chat::{decode_content_as_text, ChatMessage, Tool, ToolCall};

static PLACEHOLDER_ID_SEQ: AtomicU64 = AtomicU64::new(1);

/// Assign deterministic placeholder ids to assistant tool calls that arrived
/// without one, and default the call type to "function".
pub fn ensure_tool_call_ids(messages: &mut [ChatMessage]) {
    for message in messages.iter_mut() {
        if message.role != "assistant" || message.tool_calls.is_empty() {
            continue;
        }
        for (index, tool_call) in message.tool_calls.iter_mut().enumerate() {
            if tool_call.id.is_empty() {
                let seq = PLACEHOLDER_ID_SEQ.fetch_add(1, Ordering::Relaxed);
                tool_call.id = format!("call_{seq}_{index}");
            }
            if tool_call.call_type.is_empty() {
                tool_call.call_type = "function".into();
            }
        }
    }
}

/// Insert empty tool responses for assistant tool calls that are never
/// answered before the next assistant message.
///
/// Answers are recognized in subsequent tool-role messages and in inline
/// `tool_result`/`function_call_output` parts of any non-assistant message.
/// Synthetic responses are appended directly after the assistant message, in
/// the assistant's tool-call order, one per missing id.
pub fn fix_missing_tool_responses(messages: Vec<ChatMessage>) -> Vec<ChatMessage> {
    if messages.is_empty() {
        return messages;
    }

    let mut out: Vec<ChatMessage> = Vec::with_capacity(messages.len());

    for (index, message) in messages.iter().enumerate() {
        out.push(message.clone());

        if message.role != "assistant" || message.tool_calls.is_empty() {
            continue;
        }

        let mut pending: HashSet<String> = message
            .tool_calls
            .iter()
            .filter_map(|tool_call| {
                let id = tool_call.id.trim();
                if id.is_empty() {
                    None
                } else {
                    Some(id.to_string())
                }
            })
            .collect();
        if pending.is_empty() {
            continue;
        }

        for next in messages.iter().skip(index + 1) {
            if pending.is_empty() {
                break;
            }
            if next.role.trim().eq_ignore_ascii_case("assistant") {
                break;
            }
            for answered in extract_tool_response_ids(next) {
                pending.remove(&answered);
            }
        }

        if pending.is_empty() {
            continue;
        }
        for tool_call in &message.tool_calls {
            let id = tool_call.id.trim();
            if id.is_empty() || !pending.remove(id) {
                continue;
            }
            out.push(ChatMessage {
                role: "tool".into(),
                content: Value::String(String::new()),
                tool_call_id: Some(id.to_string()),
                ..Default::default()
            });
        }
    }

    out
}

/// Ids answered by this message: its `tool_call_id` when tool-role, plus any
/// inline tool-result part ids.
fn extract_tool_response_ids(message: &ChatMessage) -> Vec<String> {
    let mut ids: Vec<String> = Vec::with_capacity(2);

    if message.role.trim().eq_ignore_ascii_case("tool") {
        if let Some(tool_call_id) = message.tool_call_id.as_deref() {
            let tool_call_id = tool_call_id.trim();
            if !tool_call_id.is_empty() {
                ids.push(tool_call_id.to_string());
            }
        }
    }

    for id in extract_inline_tool_result_ids(&message.content) {
        if !ids.contains(&id) {
            ids.push(id);
        }
    }
    ids
}

fn extract_inline_tool_result_ids(content: &Value) -> Vec<String> {
    match content {
        Value::Array(entries) => {
            let mut ids = Vec::with_capacity(entries.len());
            for entry in entries {
                for id in extract_inline_tool_result_ids(entry) {
                    if !ids.contains(&id) {
                        ids.push(id);
                    }
                }
            }
            ids
        }
        Value::Object(map) => {
            let item_type = map
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase();
            if item_type != "tool_result"
                && item_type != "function_call_output"
                && item_type != "function_result"
            {
                return Vec::new();
            }
            match inline_tool_result_id(map) {
                Some(id) => vec![id],
                None => Vec::new(),
            }
        }
        _ => Vec::new(),
    }
}

fn inline_tool_result_id(map: &serde_json::Map<String, Value>) -> Option<String> {
    for key in ["tool_use_id", "tool_call_id", "call_id", "id"] {
        if let Some(id) = map.get(key).and_then(Value::as_str) {
            let id = id.trim();
            if !id.is_empty() {
                return Some(id.to_string());
            }
        }
    }
    None
}

/// Role mapping: ChatMessages → Converse messages plus ordered system text.
pub fn build_converse_messages(
    messages: &[ChatMessage],
) -> Result<(Vec<ConverseMessage>, Vec<String>), ServiceError> {
    let mut out_messages: Vec<ConverseMessage> = Vec::with_capacity(messages.len());
    let mut out_system: Vec<String> = Vec::with_capacity(2);

    for (index, message) in messages.iter().enumerate() {
        let role = message.role.trim().to_ascii_lowercase();

        match role.as_str() {
            "system" | "developer" => {
                let text = decode_content_as_text(&message.content).map_err(|err| {
                    ServiceError::invalid(format!(
                        "invalid {role} message content at index {index}: {err}"
                    ))
                })?;
                if text.trim().is_empty() {
                    continue;
                }
                out_system.push(text);
            }

            "assistant" => {
                let blocks = build_assistant_content_blocks(message).map_err(|err| {
                    ServiceError::invalid(format!("invalid assistant message at index {index}: {err}"))
                })?;
                if blocks.is_empty() {
                    continue;
                }
                out_messages.push(ConverseMessage {
                    role: ConverseRole::Assistant,
                    content: blocks,
                });
            }

            "tool" => {
                let block = build_tool_result_content_block(message).map_err(|err| {
                    ServiceError::invalid(format!("invalid tool message at index {index}: {err}"))
                })?;
                out_messages.push(ConverseMessage {
                    role: ConverseRole::User,
                    content: vec![block],
                });
            }

            "" | "user" | "function" => {
                let inline_results = build_inline_tool_result_blocks(&message.content);
                if !inline_results.is_empty() {
                    out_messages.push(ConverseMessage {
                        role: ConverseRole::User,
                        content: inline_results,
                    });
                    continue;
                }

                let text = decode_content_as_text(&message.content).map_err(|err| {
                    ServiceError::invalid(format!(
                        "invalid user message content at index {index}: {err}"
                    ))
                })?;
                if text.trim().is_empty() {
                    continue;
                }
                out_messages.push(ConverseMessage {
                    role: ConverseRole::User,
                    content: vec![ContentBlock::Text(text)],
                });
            }

            // Unknown roles are ignored for compatibility.
            _ => {}
        }
    }

    if out_messages.is_empty() {
        return Err(ServiceError::invalid(
            "at least one non-system message is required",
        ));
    }
    Ok((out_messages, out_system))
}

/// Assistant content: decoded text (if any) followed by one ToolUse block per
/// tool call. When the content array itself carries `tool_use` parts, those
/// are lifted in order, interleaved with the text parts.
fn build_assistant_content_blocks(message: &ChatMessage) -> Result<Vec<ContentBlock>, ServiceError> {
    let mut blocks: Vec<ContentBlock> = Vec::with_capacity(1 + message.tool_calls.len());

    if content_has_tool_use_parts(&message.content) {
        if let Value::Array(parts) = &message.content {
            for part in parts {
                let part_type = part.get("type").and_then(Value::as_str).unwrap_or("");
                match part_type {
                    "tool_use" => {
                        let id = part
                            .get("id")
                            .or_else(|| part.get("tool_use_id"))
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .trim()
                            .to_string();
                        let name = part
                            .get("name")
                            .and_then(Value::as_str)
                            .unwrap_or("")
                            .trim()
                            .to_string();
                        if name.is_empty() {
                            return Err(ServiceError::invalid("tool_use part requires name"));
                        }
                        let input = part.get("input").cloned().unwrap_or_else(|| json!({}));
                        blocks.push(ContentBlock::ToolUse(ToolUseBlock {
                            id: if id.is_empty() {
                                format!("toolcall_{}", blocks.len() + 1)
                            } else {
                                id
                            },
                            name,
                            input,
                        }));
                    }
                    "" | "text" | "input_text" | "output_text" => {
                        let text = part.get("text").and_then(Value::as_str).unwrap_or("");
                        if !text.trim().is_empty() {
                            blocks.push(ContentBlock::Text(text.to_string()));
                        }
                    }
                    _ => {}
                }
            }
        }
    } else {
        let text = decode_content_as_text(&message.content)?;
        if !text.trim().is_empty() {
            blocks.push(ContentBlock::Text(text));
        }
    }

    blocks.extend(build_tool_use_blocks(&message.tool_calls)?);
    Ok(blocks)
}

fn content_has_tool_use_parts(content: &Value) -> bool {
    match content {
        Value::Array(parts) => parts
            .iter()
            .any(|part| part.get("type").and_then(Value::as_str) == Some("tool_use")),
        _ => false,
    }
}

fn build_tool_use_blocks(tool_calls: &[ToolCall]) -> Result<Vec<ContentBlock>, ServiceError> {
    if tool_calls.is_empty() {
        return Ok(Vec::new());
    }

    let mut blocks = Vec::with_capacity(tool_calls.len());
    for (index, tool_call) in tool_calls.iter().enumerate() {
        let tool_type = tool_call.call_type.trim().to_ascii_lowercase();
        if !tool_type.is_empty() && tool_type != "function" {
            return Err(ServiceError::invalid(format!(
                "unsupported tool call type: {tool_type}"
            )));
        }

        let tool_name = tool_call.function.name.trim();
        if tool_name.is_empty() {
            return Err(ServiceError::invalid("tool call function.name is required"));
        }

        let mut tool_call_id = tool_call.id.trim().to_string();
        if tool_call_id.is_empty() {
            tool_call_id = format!("toolcall_{}", index + 1);
        }

        let args_raw = tool_call.function.arguments.trim();
        let input: Value = if args_raw.is_empty() {
            json!({})
        } else {
            serde_json::from_str(args_raw).map_err(|err| {
                ServiceError::invalid(format!(
                    "invalid JSON in tool call arguments for {tool_name:?}: {err}"
                ))
            })?
        };

        blocks.push(ContentBlock::ToolUse(ToolUseBlock {
            id: tool_call_id,
            name: tool_name.to_string(),
            input,
        }));
    }

    Ok(blocks)
}

fn build_tool_result_content_block(message: &ChatMessage) -> Result<ContentBlock, ServiceError> {
    let mut tool_use_id = message
        .tool_call_id
        .as_deref()
        .unwrap_or("")
        .trim()
        .to_string();
    if tool_use_id.is_empty() {
        tool_use_id = message.name.as_deref().unwrap_or("").trim().to_string();
    }
    if tool_use_id.is_empty() {
        return Err(ServiceError::invalid("tool message requires tool_call_id"));
    }

    let mut content = parse_tool_result_content(&message.content);
    if content.is_empty() {
        content = vec![ToolResultContent::Text(String::new())];
    }

    Ok(ContentBlock::ToolResult(ToolResultBlock {
        tool_use_id,
        content,
    }))
}

/// Tool-result content parsing: a string becomes one Text block; an array of
/// text-typed parts becomes a Text block per part; anything else is wrapped
/// as a single Json block; empty yields nothing (caller substitutes one
/// empty Text block).
fn parse_tool_result_content(content: &Value) -> Vec<ToolResultContent> {
    match content {
        Value::Null => Vec::new(),
        Value::String(text) => vec![ToolResultContent::Text(text.clone())],
        Value::Array(parts) => {
            let mut texts = Vec::with_capacity(parts.len());
            for part in parts {
                let Some(map) = part.as_object() else {
                    return vec![ToolResultContent::Json(content.clone())];
                };
                let part_type = map.get("type").and_then(Value::as_str).unwrap_or("");
                if !matches!(part_type, "" | "text" | "output_text") {
                    return vec![ToolResultContent::Json(content.clone())];
                }
                let text = map.get("text").and_then(Value::as_str).unwrap_or("");
                texts.push(ToolResultContent::Text(text.to_string()));
            }
            texts
        }
        other => vec![ToolResultContent::Json(other.clone())],
    }
}

/// User-message inline `tool_result`/`function_call_output` parts, in order.
fn build_inline_tool_result_blocks(content: &Value) -> Vec<ContentBlock> {
    let Value::Array(parts) = content else {
        return Vec::new();
    };

    let mut blocks = Vec::new();
    for part in parts {
        let Some(map) = part.as_object() else { continue };
        let part_type = map
            .get("type")
            .and_then(Value::as_str)
            .unwrap_or("")
            .trim()
            .to_ascii_lowercase();
        if part_type != "tool_result"
            && part_type != "function_call_output"
            && part_type != "function_result"
        {
            continue;
        }
        let Some(tool_use_id) = inline_tool_result_id(map) else {
            continue;
        };
        let payload = map
            .get("content")
            .or_else(|| map.get("output"))
            .cloned()
            .unwrap_or(Value::Null);
        let mut result_content = parse_tool_result_content(&payload);
        if result_content.is_empty() {
            result_content = vec![ToolResultContent::Text(String::new())];
        }
        blocks.push(ContentBlock::ToolResult(ToolResultBlock {
            tool_use_id,
            content: result_content,
        }));
    }
    blocks
}

/// Normalize tool definitions and tool_choice into a Converse ToolConfig.
///
/// Returns None when no valid function tools remain or when tool_choice is
/// "none". With `force_tool_use` set, an Auto/absent choice is overridden to
/// Any so the model must call a tool; an explicit specific tool is respected.
pub fn build_tool_configuration(
    tools: &[Tool],
    raw_tool_choice: Option<&Value>,
    force_tool_use: bool,
) -> Result<Option<ToolConfig>, ServiceError> {
    let mut specs: Vec<ToolSpec> = Vec::with_capacity(tools.len());
    for item in tools {
        let tool_type = item.tool_type.trim().to_ascii_lowercase();
        if !tool_type.is_empty() && tool_type != "function" {
            continue;
        }
        let Some(function) = item.resolved_function() else {
            continue;
        };

        let name = function.name.trim().to_string();
        if name.is_empty() {
            return Err(ServiceError::invalid("tool function name is required"));
        }

        let input_schema = match &function.parameters {
            None | Some(Value::Null) => json!({"type": "object", "properties": {}}),
            Some(schema @ Value::Object(_)) => schema.clone(),
            Some(_) => {
                return Err(ServiceError::invalid(format!(
                    "invalid JSON schema for tool {name:?}"
                )));
            }
        };

        let description = function
            .description
            .as_deref()
            .map(str::trim)
            .filter(|d| !d.is_empty())
            .map(str::to_string);

        specs.push(ToolSpec {
            name,
            description,
            input_schema,
            strict: function.strict,
        });
    }

    if specs.is_empty() {
        return Ok(None);
    }

    let (tool_choice, disable_tools) = parse_tool_choice(raw_tool_choice)?;
    if disable_tools {
        return Ok(None);
    }

    let tool_choice = if force_tool_use {
        match tool_choice {
            None | Some(ToolChoice::Auto) => Some(ToolChoice::Any),
            other => other,
        }
    } else {
        tool_choice
    };

    Ok(Some(ToolConfig {
        tools: specs,
        tool_choice,
    }))
}

/// Parse tool_choice. The boolean is true when tools must be dropped
/// entirely ("none").
fn parse_tool_choice(raw: Option<&Value>) -> Result<(Option<ToolChoice>, bool), ServiceError> {
    let raw = match raw {
        None | Some(Value::Null) => return Ok((None, false)),
        Some(value) => value,
    };

    match raw {
        Value::String(value) => match value.trim().to_ascii_lowercase().as_str() {
            "none" => Ok((None, true)),
            "auto" => Ok((Some(ToolChoice::Auto), false)),
            "required" => Ok((Some(ToolChoice::Any), false)),
            other => Err(ServiceError::invalid(format!(
                "unsupported tool_choice value: {other}"
            ))),
        },
        Value::Object(map) => {
            let choice_type = map
                .get("type")
                .and_then(Value::as_str)
                .unwrap_or("")
                .trim()
                .to_ascii_lowercase();
            match choice_type.as_str() {
                "none" => Ok((None, true)),
                "auto" => Ok((Some(ToolChoice::Auto), false)),
                "required" => Ok((Some(ToolChoice::Any), false)),
                "function" => {
                    let name = map
                        .get("function")
                        .and_then(|f| f.get("name"))
                        .and_then(Value::as_str)
                        .unwrap_or("")
                        .trim()
                        .to_string();
                    if name.is_empty() {
                        return Err(ServiceError::invalid("tool_choice.function.name is required"));
                    }
                    Ok((Some(ToolChoice::Tool(name)), false))
                }
                other => Err(ServiceError::invalid(format!(
                    "unsupported tool_choice object type: {other}"
                ))),
            }
        }
        _ => Err(ServiceError::invalid("invalid tool_choice")),
    }
}
