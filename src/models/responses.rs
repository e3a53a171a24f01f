//! OpenAI Responses API wire types and the adapter that lowers a Responses
//! request onto the Chat Completions shape the translator works with.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ServiceError;
use crate::models::chat::{
    ChatCompletionRequest, ChatMessage, Tool, ToolCall, ToolCallFunction, ToolFunction,
};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsesCreateRequest {
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub input: Value,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ResponsesTool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parallel_tool_calls: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<u32>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instructions: Option<String>,
}

/// Responses-dialect tool definition. Fields may be flat or nested under
/// `function`; both normalize through `normalize_responses_tools`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsesTool {
    #[serde(rename = "type", default)]
    pub tool_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub strict: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<ToolFunction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_label: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponsesCreateResponse {
    pub id: String,
    pub object: String,
    pub created_at: i64,
    pub status: String,
    pub model: String,
    pub output: Vec<ResponsesOutputItem>,
    pub usage: ResponsesUsage,
    pub parallel_tool_calls: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output_text: String,
    pub error: Option<Value>,
    pub incomplete_details: Option<Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsesUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsesOutputItem {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub id: String,
    #[serde(rename = "type")]
    pub item_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub status: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub role: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub content: Vec<ResponsesOutputContent>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub call_id: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arguments: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ResponsesOutputContent {
    #[serde(rename = "type")]
    pub content_type: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub annotations: Vec<Value>,
}

/// Accumulator for one streamed function call (Responses dialect).
#[derive(Debug, Clone, Default)]
pub struct FunctionCallState {
    pub output_index: usize,
    pub item_id: String,
    pub call_id: String,
    pub name: String,
    pub arguments: String,
}

pub fn validate_responses_create_request(
    request: &ResponsesCreateRequest,
) -> Result<(), ServiceError> {
    if request.model.trim().is_empty() {
        return Err(ServiceError::invalid("model is required"));
    }
    if request.input.is_null() {
        return Err(ServiceError::invalid("input is required"));
    }
    Ok(())
}

/// Lower a Responses request onto the Chat request shape; the rest of the
/// pipeline (translator, driver) only ever sees Chat.
pub fn responses_request_to_chat(
    request: &ResponsesCreateRequest,
) -> Result<ChatCompletionRequest, ServiceError> {
    let messages =
        parse_responses_input_messages(&request.input, request.instructions.as_deref())?;
    let tools = normalize_responses_tools(&request.tools)?;

    Ok(ChatCompletionRequest {
        model: request.model.trim().to_string(),
        messages,
        temperature: request.temperature,
        top_p: request.top_p,
        max_tokens: request.max_output_tokens,
        stream: request.stream,
        user: request.user.clone(),
        tools,
        tool_choice: request.tool_choice.clone(),
        parallel_tool_calls: request.parallel_tool_calls,
        ..Default::default()
    })
}

/// Parse the polymorphic `input` field into ChatMessages. `instructions`
/// becomes a leading developer message.
pub fn parse_responses_input_messages(
    input: &Value,
    instructions: Option<&str>,
) -> Result<Vec<ChatMessage>, ServiceError> {
    let mut items: Vec<ChatMessage> = Vec::with_capacity(8);

    if let Some(instructions) = instructions {
        let instructions = instructions.trim();
        if !instructions.is_empty() {
            items.push(ChatMessage {
                role: "developer".into(),
                content: Value::String(instructions.to_string()),
                ..Default::default()
            });
        }
    }

    match input {
        Value::Null => {
            if items.is_empty() {
                return Err(ServiceError::invalid("responses input is empty"));
            }
        }
        Value::String(text) => {
            items.push(ChatMessage {
                role: "user".into(),
                content: Value::String(text.clone()),
                ..Default::default()
            });
        }
        Value::Object(_) => {
            items.extend(parse_single_responses_input_item(input)?);
        }
        Value::Array(entries) => {
            for entry in entries {
                items.extend(parse_single_responses_input_item(entry)?);
            }
        }
        _ => {
            return Err(ServiceError::invalid("unsupported responses input format"));
        }
    }

    if items.is_empty() {
        return Err(ServiceError::invalid(
            "responses input yielded no usable messages",
        ));
    }
    Ok(items)
}

fn parse_single_responses_input_item(item: &Value) -> Result<Vec<ChatMessage>, ServiceError> {
    match item {
        Value::Null => Ok(Vec::new()),
        Value::String(text) => Ok(vec![ChatMessage {
            role: "user".into(),
            content: Value::String(text.clone()),
            ..Default::default()
        }]),
        Value::Object(map) => {
            let item_type = map
                .get("type")
                .and_then(Value::as_str)
                .map(|t| t.trim().to_ascii_lowercase())
                .filter(|t| !t.is_empty())
                .unwrap_or_else(|| "message".to_string());

            match item_type.as_str() {
                "message" => {
                    let role = map
                        .get("role")
                        .and_then(Value::as_str)
                        .map(|r| r.trim().to_ascii_lowercase())
                        .filter(|r| !r.is_empty())
                        .unwrap_or_else(|| "user".to_string());
                    let content =
                        normalize_responses_message_content(map.get("content").unwrap_or(&Value::Null));
                    Ok(vec![ChatMessage {
                        role,
                        content,
                        ..Default::default()
                    }])
                }
                "function_call" => {
                    let name = string_field(map.get("name"));
                    if name.is_empty() {
                        return Err(ServiceError::invalid(
                            "responses function_call item requires name",
                        ));
                    }
                    let mut call_id = string_field(map.get("call_id"));
                    if call_id.is_empty() {
                        call_id = "call_generated".into();
                    }
                    let mut arguments = string_or_raw(map.get("arguments"));
                    if arguments.is_empty() {
                        arguments = "{}".into();
                    }
                    Ok(vec![ChatMessage {
                        role: "assistant".into(),
                        content: Value::Null,
                        tool_calls: vec![ToolCall {
                            id: call_id,
                            call_type: "function".into(),
                            function: ToolCallFunction { name, arguments },
                        }],
                        ..Default::default()
                    }])
                }
                "function_call_output" => {
                    let call_id = string_field(map.get("call_id"));
                    if call_id.is_empty() {
                        return Err(ServiceError::invalid(
                            "responses function_call_output item requires call_id",
                        ));
                    }
                    let output =
                        normalize_responses_tool_output(map.get("output").unwrap_or(&Value::Null));
                    Ok(vec![ChatMessage {
                        role: "tool".into(),
                        content: output,
                        tool_call_id: Some(call_id),
                        ..Default::default()
                    }])
                }
                "input_text" | "output_text" | "text" => {
                    let text = string_field(map.get("text"));
                    Ok(vec![ChatMessage {
                        role: "user".into(),
                        content: Value::String(text),
                        ..Default::default()
                    }])
                }
                _ => {
                    // Unknown item types pass through their text, if any.
                    let text = string_field(map.get("text"));
                    if text.is_empty() {
                        return Ok(Vec::new());
                    }
                    Ok(vec![ChatMessage {
                        role: "user".into(),
                        content: Value::String(text),
                        ..Default::default()
                    }])
                }
            }
        }
        _ => Err(ServiceError::invalid(format!(
            "unsupported responses input item: {item}"
        ))),
    }
}

fn normalize_responses_message_content(raw: &Value) -> Value {
    match raw {
        Value::Null => Value::String(String::new()),
        Value::String(_) => raw.clone(),
        Value::Object(map) => {
            let text = string_field(map.get("text"));
            Value::String(text)
        }
        Value::Array(entries) => {
            let mut parts: Vec<String> = Vec::with_capacity(entries.len());
            for entry in entries {
                let text = extract_response_content_text(entry);
                let text = text.trim();
                if text.is_empty() {
                    continue;
                }
                parts.push(text.to_string());
            }
            Value::String(parts.join("\n"))
        }
        other => Value::String(other.to_string()),
    }
}

fn normalize_responses_tool_output(raw: &Value) -> Value {
    match raw {
        Value::Null => Value::String(String::new()),
        Value::String(_) | Value::Object(_) => raw.clone(),
        Value::Array(entries) => {
            let mut parts: Vec<String> = Vec::with_capacity(entries.len());
            for entry in entries {
                let text = extract_response_content_text(entry);
                let text = text.trim().to_string();
                if text.is_empty() {
                    // Mixed content: keep the raw array so the translator can
                    // wrap it as a JSON tool result.
                    return raw.clone();
                }
                parts.push(text);
            }
            Value::String(parts.join("\n"))
        }
        other => other.clone(),
    }
}

fn extract_response_content_text(raw: &Value) -> String {
    match raw {
        Value::String(text) => text.clone(),
        Value::Object(map) => string_field(map.get("text")),
        _ => String::new(),
    }
}

fn normalize_responses_tools(tools: &[ResponsesTool]) -> Result<Vec<Tool>, ServiceError> {
    if tools.is_empty() {
        return Ok(Vec::new());
    }

    let mut out = Vec::with_capacity(tools.len());
    for item in tools {
        let function = match &item.function {
            Some(function) => function.clone(),
            None => {
                let mut name = item.name.as_deref().unwrap_or("").trim().to_string();
                if name.is_empty() {
                    if let Some(label) = item.server_label.as_deref() {
                        let label = label.trim();
                        if !label.is_empty() {
                            name = format!("{label}.tool");
                        }
                    }
                }
                if name.is_empty() {
                    continue;
                }
                ToolFunction {
                    name,
                    description: item
                        .description
                        .as_deref()
                        .map(|d| d.trim().to_string())
                        .filter(|d| !d.is_empty()),
                    parameters: item.parameters.clone(),
                    strict: item.strict,
                }
            }
        };

        if function.name.trim().is_empty() {
            return Err(ServiceError::invalid("responses tool name is required"));
        }

        out.push(Tool {
            tool_type: "function".into(),
            function: Some(function),
            ..Default::default()
        });
    }

    Ok(out)
}

/// Build the completed output array for a non-streaming Responses reply:
/// one message item when text is present, then one function_call item per
/// tool call.
pub fn build_responses_output_items(
    request_id: &str,
    text: &str,
    tool_calls: &[ToolCall],
) -> Vec<ResponsesOutputItem> {
    let mut items = Vec::with_capacity(1 + tool_calls.len());
    if !text.trim().is_empty() {
        items.push(ResponsesOutputItem {
            id: format!("msg_{request_id}"),
            item_type: "message".into(),
            status: "completed".into(),
            role: "assistant".into(),
            content: vec![ResponsesOutputContent {
                content_type: "output_text".into(),
                text: text.to_string(),
                annotations: Vec::new(),
            }],
            ..Default::default()
        });
    }

    for (index, tool_call) in tool_calls.iter().enumerate() {
        let mut call_id = tool_call.id.trim().to_string();
        if call_id.is_empty() {
            call_id = format!("call_{}", index + 1);
        }
        items.push(ResponsesOutputItem {
            id: format!("fc_{call_id}"),
            item_type: "function_call".into(),
            status: "completed".into(),
            call_id,
            name: tool_call.function.name.trim().to_string(),
            arguments: tool_call.function.arguments.clone(),
            ..Default::default()
        });
    }
    items
}

/// Concatenate all message output_text parts, in output order.
pub fn build_responses_output_text(items: &[ResponsesOutputItem]) -> String {
    let mut ordered: Vec<&ResponsesOutputItem> = items.iter().collect();
    ordered.sort_by_key(|item| item.item_type != "message");

    let mut parts: Vec<&str> = Vec::new();
    for item in ordered {
        if item.item_type != "message" {
            continue;
        }
        for content in &item.content {
            if content.content_type == "output_text" && !content.text.trim().is_empty() {
                parts.push(&content.text);
            }
        }
    }
    parts.join("\n")
}

fn string_field(raw: Option<&Value>) -> String {
    raw.and_then(Value::as_str)
        .map(|s| s.trim().to_string())
        .unwrap_or_default()
}

/// Like `string_field`, but a non-string value contributes its raw JSON text
/// (used for `arguments`, which some clients send as an object).
fn string_or_raw(raw: Option<&Value>) -> String {
    match raw {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(text)) => text.trim().to_string(),
        Some(other) => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn validate_requires_model_and_input() {
        let mut request = ResponsesCreateRequest::default();
        assert!(validate_responses_create_request(&request).is_err());
        request.model = "us.anthropic.claude-3-5-sonnet-20241022-v2:0".into();
        assert!(validate_responses_create_request(&request).is_err());
        request.input = json!("hi");
        assert!(validate_responses_create_request(&request).is_ok());
    }

    #[test]
    fn string_input_becomes_user_message() {
        let messages = parse_responses_input_messages(&json!("hello"), None).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
        assert_eq!(messages[0].content, json!("hello"));
    }

    #[test]
    fn instructions_become_leading_developer_message() {
        let messages =
            parse_responses_input_messages(&json!("hello"), Some("  be terse  ")).unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "developer");
        assert_eq!(messages[0].content, json!("be terse"));
    }

    #[test]
    fn function_call_items_round_trip_into_chat_shape() {
        let input = json!([
            {"type": "message", "role": "user", "content": "run ls"},
            {"type": "function_call", "call_id": "call_9", "name": "exec",
             "arguments": {"cmd": "ls"}},
            {"type": "function_call_output", "call_id": "call_9", "output": "bin src"},
        ]);
        let messages = parse_responses_input_messages(&input, None).unwrap();
        assert_eq!(messages.len(), 3);

        assert_eq!(messages[1].role, "assistant");
        assert_eq!(messages[1].tool_calls.len(), 1);
        assert_eq!(messages[1].tool_calls[0].id, "call_9");
        assert_eq!(
            serde_json::from_str::<Value>(&messages[1].tool_calls[0].function.arguments).unwrap(),
            json!({"cmd": "ls"})
        );

        assert_eq!(messages[2].role, "tool");
        assert_eq!(messages[2].tool_call_id.as_deref(), Some("call_9"));
        assert_eq!(messages[2].content, json!("bin src"));
    }

    #[test]
    fn message_content_arrays_join_text_parts() {
        let input = json!([{
            "type": "message",
            "role": "user",
            "content": [
                {"type": "input_text", "text": "first"},
                {"type": "input_text", "text": "second"},
            ],
        }]);
        let messages = parse_responses_input_messages(&input, None).unwrap();
        assert_eq!(messages[0].content, json!("first\nsecond"));
    }

    #[test]
    fn unknown_items_without_text_are_skipped() {
        let input = json!([
            {"type": "reasoning", "summary": []},
            {"type": "message", "role": "user", "content": "hi"},
        ]);
        let messages = parse_responses_input_messages(&input, None).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].role, "user");
    }

    #[test]
    fn request_adapter_maps_tools_and_sampling() {
        let request: ResponsesCreateRequest = serde_json::from_value(json!({
            "model": "us.anthropic.claude-3-5-sonnet-20241022-v2:0",
            "input": "search the docs",
            "tools": [
                {"type": "function", "name": "search_docs",
                 "description": "Search documentation",
                 "parameters": {"type": "object", "properties": {"q": {"type": "string"}}}}
            ],
            "temperature": 0.2,
            "max_output_tokens": 2048,
            "stream": true
        }))
        .unwrap();

        let chat = responses_request_to_chat(&request).unwrap();
        assert_eq!(chat.messages.len(), 1);
        assert_eq!(chat.temperature, Some(0.2));
        assert_eq!(chat.max_tokens, Some(2048));
        assert!(chat.stream);
        assert_eq!(chat.tools.len(), 1);
        assert_eq!(
            chat.tools[0].resolved_function().unwrap().name,
            "search_docs"
        );
    }

    #[test]
    fn output_items_put_message_first_then_function_calls() {
        let tool_calls = vec![ToolCall {
            id: "call_1".into(),
            call_type: "function".into(),
            function: ToolCallFunction {
                name: "exec".into(),
                arguments: "{\"cmd\":\"ls\"}".into(),
            },
        }];
        let items = build_responses_output_items("req-1", "listing files", &tool_calls);
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].item_type, "message");
        assert_eq!(items[0].id, "msg_req-1");
        assert_eq!(items[1].item_type, "function_call");
        assert_eq!(items[1].id, "fc_call_1");
        assert_eq!(items[1].call_id, "call_1");

        assert_eq!(build_responses_output_text(&items), "listing files");
    }

    #[test]
    fn blank_tool_call_ids_get_positional_call_ids() {
        let tool_calls = vec![ToolCall::default()];
        let items = build_responses_output_items("req-1", "", &tool_calls);
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].call_id, "call_1");
    }
}
