//! Streaming scenarios: scripted upstream events through the driver and the
//! two SSE dialect emitters.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use bedrock_router::bedrock::{
    BedrockService, BlockDelta, ConverseApi, ConverseEventStream, ConverseReply, ConverseRequest,
    ConverseStreamEvent, ConverseUsage, StopReason, StreamDelta, ToolUseStart,
};
use bedrock_router::error::ServiceError;
use bedrock_router::models::chat::ChatCompletionRequest;
use bedrock_router::server::{ChatStreamEmitter, ResponsesStreamEmitter};
use serde_json::{json, Value};

struct ScriptedApi {
    events: Mutex<Option<Vec<Result<ConverseStreamEvent, ServiceError>>>>,
}

impl ScriptedApi {
    fn new(events: Vec<Result<ConverseStreamEvent, ServiceError>>) -> Arc<Self> {
        Arc::new(Self {
            events: Mutex::new(Some(events)),
        })
    }
}

#[async_trait]
impl ConverseApi for ScriptedApi {
    async fn converse(&self, _request: ConverseRequest) -> Result<ConverseReply, ServiceError> {
        Err(ServiceError::upstream("not scripted"))
    }

    async fn converse_stream(
        &self,
        _request: ConverseRequest,
    ) -> Result<ConverseEventStream, ServiceError> {
        let events = self
            .events
            .lock()
            .expect("events lock")
            .take()
            .expect("stream opened once");
        Ok(Box::pin(futures_util::stream::iter(events)))
    }
}

fn service(api: Arc<ScriptedApi>) -> BedrockService {
    let api: Arc<dyn ConverseApi> = api;
    BedrockService::new(Some(api), "default-model", 0, 8192, false)
}

fn user_request() -> ChatCompletionRequest {
    serde_json::from_value(json!({
        "model": "model-x",
        "stream": true,
        "messages": [{"role": "user", "content": "run ls"}]
    }))
    .unwrap()
}

fn tool_call_script() -> Vec<Result<ConverseStreamEvent, ServiceError>> {
    vec![
        Ok(ConverseStreamEvent::MessageStart),
        Ok(ConverseStreamEvent::ContentBlockStart {
            block_index: 0,
            tool_use: Some(ToolUseStart {
                id: "t1".into(),
                name: "exec".into(),
            }),
        }),
        Ok(ConverseStreamEvent::ContentBlockDelta {
            block_index: 0,
            delta: BlockDelta::ToolUseInput("{\"cmd\":".into()),
        }),
        Ok(ConverseStreamEvent::ContentBlockDelta {
            block_index: 0,
            delta: BlockDelta::ToolUseInput("\"ls\"}".into()),
        }),
        Ok(ConverseStreamEvent::MessageStop {
            stop_reason: StopReason::ToolUse,
        }),
        Ok(ConverseStreamEvent::Metadata {
            usage: Some(ConverseUsage {
                input_tokens: 5,
                output_tokens: 7,
                total_tokens: 12,
            }),
            latency_ms: Some(31),
        }),
    ]
}

#[tokio::test]
async fn chat_chunk_ordering_for_streamed_tool_call() {
    let proxy = service(ScriptedApi::new(tool_call_script()));
    let session = proxy
        .open_stream(user_request(), "model-x")
        .await
        .expect("stream opens");

    let emitter = ChatStreamEmitter::new("req-1", "model-x");
    let mut frames: Vec<Value> = Vec::new();
    let result = session
        .drive(|delta| {
            for chunk in emitter.chunks_for_delta(&delta) {
                frames.push(serde_json::to_value(chunk).expect("chunk serializes"));
            }
            Ok(())
        })
        .await
        .expect("stream completes");
    frames.push(serde_json::to_value(emitter.terminator(&result)).unwrap());

    assert_eq!(frames.len(), 4);
    for frame in &frames {
        assert_eq!(frame["object"], json!("chat.completion.chunk"));
        assert_eq!(frame["id"], json!("chatcmpl-req-1"));
    }

    // (a) role + first tool call in one frame.
    assert_eq!(
        frames[0]["choices"][0]["delta"],
        json!({
            "role": "assistant",
            "tool_calls": [
                {"index": 0, "id": "t1", "type": "function", "function": {"name": "exec"}}
            ]
        })
    );
    // (b) + (c) argument fragments in upstream order, no repeated role.
    assert_eq!(
        frames[1]["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
        json!("{\"cmd\":")
    );
    assert!(frames[1]["choices"][0]["delta"].get("role").is_none());
    assert_eq!(
        frames[2]["choices"][0]["delta"]["tool_calls"][0]["function"]["arguments"],
        json!("\"ls\"}")
    );
    // (d) terminator with empty delta, finish_reason and usage.
    assert_eq!(frames[3]["choices"][0]["delta"], json!({}));
    assert_eq!(frames[3]["choices"][0]["finish_reason"], json!("tool_calls"));
    assert_eq!(
        frames[3]["usage"],
        json!({"prompt_tokens": 5, "completion_tokens": 7, "total_tokens": 12})
    );

    // Exactly one frame carried the role.
    let role_frames = frames
        .iter()
        .filter(|frame| frame["choices"][0]["delta"].get("role").is_some())
        .count();
    assert_eq!(role_frames, 1);

    // Reassembled arguments are intact.
    assert_eq!(result.tool_calls[0].function.arguments, "{\"cmd\":\"ls\"}");
    assert_eq!(result.latency_ms, 31);
}

#[tokio::test]
async fn pure_text_stream_emits_role_frame_then_text() {
    let proxy = service(ScriptedApi::new(vec![
        Ok(ConverseStreamEvent::MessageStart),
        Ok(ConverseStreamEvent::ContentBlockDelta {
            block_index: 0,
            delta: BlockDelta::Text("Hello".into()),
        }),
        Ok(ConverseStreamEvent::MessageStop {
            stop_reason: StopReason::EndTurn,
        }),
    ]));
    let session = proxy.open_stream(user_request(), "model-x").await.unwrap();

    let emitter = ChatStreamEmitter::new("req-1", "model-x");
    let mut frames: Vec<Value> = Vec::new();
    let result = session
        .drive(|delta| {
            for chunk in emitter.chunks_for_delta(&delta) {
                frames.push(serde_json::to_value(chunk).unwrap());
            }
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["choices"][0]["delta"], json!({"role": "assistant"}));
    assert_eq!(
        frames[1]["choices"][0]["delta"],
        json!({"content": "Hello"})
    );
    assert_eq!(result.finish_reason, "stop");
}

#[tokio::test]
async fn truncated_tool_arguments_surface_length_finish_reason() {
    // The upstream hits max_tokens mid-argument: the core reports "length"
    // and leaves the partial JSON observable; no retry is attempted.
    let proxy = service(ScriptedApi::new(vec![
        Ok(ConverseStreamEvent::MessageStart),
        Ok(ConverseStreamEvent::ContentBlockStart {
            block_index: 0,
            tool_use: Some(ToolUseStart {
                id: "t1".into(),
                name: "exec".into(),
            }),
        }),
        Ok(ConverseStreamEvent::ContentBlockDelta {
            block_index: 0,
            delta: BlockDelta::ToolUseInput("{\"cmd\": \"ls".into()),
        }),
        Ok(ConverseStreamEvent::MessageStop {
            stop_reason: StopReason::MaxTokens,
        }),
    ]));
    let session = proxy.open_stream(user_request(), "model-x").await.unwrap();
    let result = session.drive(|_| Ok(())).await.unwrap();

    assert_eq!(result.finish_reason, "length");
    let arguments = &result.tool_calls[0].function.arguments;
    assert!(
        serde_json::from_str::<Value>(arguments).is_err(),
        "truncated arguments are not valid JSON: {arguments}"
    );
}

#[tokio::test]
async fn responses_stream_sequence_is_gapless_and_completed_last() {
    let proxy = service(ScriptedApi::new(tool_call_script()));
    let session = proxy.open_stream(user_request(), "model-x").await.unwrap();

    let mut emitter = ResponsesStreamEmitter::new("req-1", "model-x", true, None);
    let mut events: Vec<Value> = emitter.begin();

    let result = session
        .drive(|delta| {
            events.extend(emitter.on_delta(&delta));
            Ok(())
        })
        .await
        .unwrap();
    events.extend(emitter.finish(&result));

    for (expected, event) in events.iter().enumerate() {
        assert_eq!(event["sequence_number"], json!(expected as i64));
    }
    assert_eq!(events.last().unwrap()["type"], json!("response.completed"));

    let types: Vec<&str> = events
        .iter()
        .map(|event| event["type"].as_str().unwrap())
        .collect();
    assert_eq!(
        types,
        vec![
            "response.created",
            "response.in_progress",
            "response.output_item.added",
            "response.function_call_arguments.delta",
            "response.function_call_arguments.delta",
            "response.function_call_arguments.done",
            "response.output_item.done",
            "response.completed",
        ]
    );

    // The function_call item reassembled the full arguments.
    let completed = events.last().unwrap();
    let output = completed["response"]["output"].as_array().unwrap();
    assert_eq!(output.len(), 1);
    assert_eq!(output[0]["type"], json!("function_call"));
    assert_eq!(output[0]["call_id"], json!("t1"));
    assert_eq!(output[0]["arguments"], json!("{\"cmd\":\"ls\"}"));
    assert_eq!(
        completed["response"]["usage"],
        json!({"input_tokens": 5, "output_tokens": 7, "total_tokens": 12})
    );
}

#[tokio::test]
async fn responses_stream_error_event_ends_without_completed() {
    let proxy = service(ScriptedApi::new(vec![
        Ok(ConverseStreamEvent::MessageStart),
        Ok(ConverseStreamEvent::ContentBlockDelta {
            block_index: 0,
            delta: BlockDelta::Text("partial".into()),
        }),
        Err(ServiceError::upstream("connection reset")),
    ]));
    let session = proxy.open_stream(user_request(), "model-x").await.unwrap();

    let mut emitter = ResponsesStreamEmitter::new("req-1", "model-x", true, None);
    let mut events: Vec<Value> = emitter.begin();

    let err = session
        .drive(|delta| {
            events.extend(emitter.on_delta(&delta));
            Ok(())
        })
        .await
        .unwrap_err();
    events.push(emitter.error_event(&format!("bedrock stream failed: {err}")));

    for (expected, event) in events.iter().enumerate() {
        assert_eq!(event["sequence_number"], json!(expected as i64));
    }
    let last = events.last().unwrap();
    assert_eq!(last["type"], json!("error"));
    assert_eq!(last["error"]["code"], json!("stream_error"));
    assert!(
        events.iter().all(|e| e["type"] != json!("response.completed")),
        "no response.completed after an upstream error"
    );
    assert_eq!(emitter.partial_text(), "partial");
}

#[tokio::test]
async fn callback_errors_abort_the_stream() {
    // A failed SSE write surfaces as the driver's error and stops event
    // consumption, mirroring a disconnected client.
    let proxy = service(ScriptedApi::new(tool_call_script()));
    let session = proxy.open_stream(user_request(), "model-x").await.unwrap();

    let mut delivered = 0;
    let err = session
        .drive(|_| {
            delivered += 1;
            if delivered >= 2 {
                Err(ServiceError::StreamClosed)
            } else {
                Ok(())
            }
        })
        .await
        .unwrap_err();
    assert!(matches!(err, ServiceError::StreamClosed));
    assert_eq!(delivered, 2);
}
