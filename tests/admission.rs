//! Admission pipeline and wire-format tests through the real HTTP surface.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{test, web, App};
use async_trait::async_trait;
use bedrock_router::bedrock::{
    BedrockService, BlockDelta, ContentBlock, ConverseApi, ConverseEventStream, ConverseReply,
    ConverseRequest, ConverseStreamEvent, ConverseUsage, StopReason,
};
use bedrock_router::config::{ClientConfig, Config};
use bedrock_router::error::ServiceError;
use bedrock_router::server;
use bedrock_router::state::AppState;
use bedrock_router::store::{BillingConfig, ModelPricingRow, Store, UsageByModelRow};
use serde_json::{json, Value};

struct StubApi;

#[async_trait]
impl ConverseApi for StubApi {
    async fn converse(&self, _request: ConverseRequest) -> Result<ConverseReply, ServiceError> {
        Ok(ConverseReply {
            content: vec![ContentBlock::Text("hello from bedrock".into())],
            stop_reason: StopReason::EndTurn,
            usage: Some(ConverseUsage {
                input_tokens: 11,
                output_tokens: 4,
                total_tokens: 15,
            }),
            latency_ms: 7,
        })
    }

    async fn converse_stream(
        &self,
        _request: ConverseRequest,
    ) -> Result<ConverseEventStream, ServiceError> {
        let events = vec![
            Ok(ConverseStreamEvent::MessageStart),
            Ok(ConverseStreamEvent::ContentBlockDelta {
                block_index: 0,
                delta: BlockDelta::Text("hi".into()),
            }),
            Ok(ConverseStreamEvent::MessageStop {
                stop_reason: StopReason::EndTurn,
            }),
            Ok(ConverseStreamEvent::Metadata {
                usage: Some(ConverseUsage {
                    input_tokens: 3,
                    output_tokens: 1,
                    total_tokens: 4,
                }),
                latency_ms: Some(5),
            }),
        ];
        Ok(Box::pin(futures_util::stream::iter(events)))
    }
}

fn test_config() -> Config {
    Config {
        listen_addr: ":0".into(),
        request_timeout: Duration::from_secs(5),
        max_body_bytes: 0,
        aws_region: String::new(),
        aws_access_key_id: String::new(),
        aws_secret_access_key: String::new(),
        aws_session_token: String::new(),
        default_model_id: "default-model".into(),
        default_max_output_tokens: 0,
        min_tool_max_output_tokens: 8192,
        global_max_concurrent: 8,
        db_path: ":memory:".into(),
        log_queue_size: 64,
        max_content_chars: 2000,
        force_tool_use: false,
    }
}

async fn app_state(with_client: bool) -> web::Data<AppState> {
    let store = Store::new(":memory:", 64).await.expect("store opens");
    let api: Option<Arc<dyn ConverseApi>> = if with_client {
        Some(Arc::new(StubApi))
    } else {
        None
    };
    let proxy = BedrockService::new(api, "default-model", 0, 8192, false);
    let state = AppState::new(test_config(), store, proxy);
    state
        .auth
        .replace_clients(vec![ClientConfig {
            id: "c1".into(),
            api_key: "sk-test".into(),
            ..Default::default()
        }])
        .expect("client registry");
    web::Data::from(Arc::new(state))
}

macro_rules! service {
    ($data:expr) => {
        test::init_service(
            App::new()
                .app_data($data.clone())
                .configure(server::routes),
        )
        .await
    };
}

fn chat_body() -> Value {
    json!({
        "model": "model-x",
        "messages": [{"role": "user", "content": "hello"}]
    })
}

#[actix_web::test]
async fn healthz_reports_backend_readiness() {
    let data = app_state(false).await;
    let app = service!(data);

    let response = test::call_service(&app, test::TestRequest::get().uri("/healthz").to_request()).await;
    assert_eq!(response.status(), 200);
    let body: Value = test::read_body_json(response).await;
    assert_eq!(body, json!({"ok": true, "backend_client_ready": false}));
}

#[actix_web::test]
async fn completions_without_backend_client_is_503() {
    let data = app_state(false).await;
    let app = service!(data);

    let request = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("x-api-key", "sk-test"))
        .set_json(chat_body())
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 503);
}

#[actix_web::test]
async fn missing_and_invalid_keys_are_401() {
    let data = app_state(true).await;
    let app = service!(data);

    let anonymous = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .set_json(chat_body())
        .to_request();
    let response = test::call_service(&app, anonymous).await;
    assert_eq!(response.status(), 401);
    let body: Value = test::read_body_json(response).await;
    assert_eq!(body["error"]["message"], json!("missing api key"));
    assert_eq!(body["error"]["type"], json!("invalid_request_error"));
    assert_eq!(body["error"]["code"], json!("401"));

    let wrong = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("authorization", "Bearer sk-wrong"))
        .set_json(chat_body())
        .to_request();
    let response = test::call_service(&app, wrong).await;
    assert_eq!(response.status(), 401);
}

#[actix_web::test]
async fn cost_limit_gate_rejects_before_upstream() {
    let data = app_state(true).await;
    let pricing = [ModelPricingRow {
        model_id: "m".into(),
        input_price_per_1k: 1.1,
        output_price_per_1k: 1.1,
    }];

    // 9 input tokens at $1.1/1k: total 0.0099 < 0.01, the request passes.
    data.billing.reload(
        BillingConfig {
            global_cost_limit_usd: 0.01,
        },
        &pricing,
        &[UsageByModelRow {
            client_id: "c1".into(),
            model: "m".into(),
            input_tokens: 9,
            output_tokens: 0,
            total_tokens: 9,
            request_count: 1,
        }],
    );
    let app = service!(data);
    let request = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("x-api-key", "sk-test"))
        .set_json(chat_body())
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 200);

    // One more tick pushes the total past the limit (0.0099 + 0.0022):
    // the next request is rejected with 429 before any upstream call.
    data.billing.add_cost_from_usage("m", 1, 1);
    let request = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("x-api-key", "sk-test"))
        .set_json(chat_body())
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 429);
    let body: Value = test::read_body_json(response).await;
    assert!(body["error"]["message"]
        .as_str()
        .unwrap()
        .contains("global cost limit exceeded"));
}

#[actix_web::test]
async fn validation_and_authorization_failures() {
    let data = app_state(true).await;
    let app = service!(data);

    // Empty messages: 400.
    let request = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("x-api-key", "sk-test"))
        .set_json(json!({"model": "model-x", "messages": []}))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 400);

    // Model outside the enabled set: 403.
    data.models.replace(vec!["enabled-model".into()]);
    let request = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("x-api-key", "sk-test"))
        .set_json(chat_body())
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 403);
    data.models.replace(Vec::new());

    // Model outside the client allow-list: 403.
    data.auth
        .replace_clients(vec![ClientConfig {
            id: "c1".into(),
            api_key: "sk-test".into(),
            allowed_models: vec!["some-other-model".into()],
            ..Default::default()
        }])
        .unwrap();
    let request = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("x-api-key", "sk-test"))
        .set_json(chat_body())
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 403);
}

#[actix_web::test]
async fn wrong_method_is_405() {
    let data = app_state(true).await;
    let app = service!(data);

    let request = test::TestRequest::get()
        .uri("/v1/chat/completions")
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 405);
}

#[actix_web::test]
async fn non_streaming_chat_happy_path() {
    let data = app_state(true).await;
    let app = service!(data);

    let request = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("x-api-key", "sk-test"))
        .insert_header(("x-request-id", "fixed-id"))
        .set_json(chat_body())
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 200);
    let body: Value = test::read_body_json(response).await;

    assert_eq!(body["id"], json!("chatcmpl-fixed-id"));
    assert_eq!(body["object"], json!("chat.completion"));
    assert_eq!(body["model"], json!("model-x"));
    assert_eq!(body["choices"][0]["message"]["role"], json!("assistant"));
    assert_eq!(
        body["choices"][0]["message"]["content"],
        json!("hello from bedrock")
    );
    assert_eq!(body["choices"][0]["finish_reason"], json!("stop"));
    assert_eq!(
        body["usage"],
        json!({"prompt_tokens": 11, "completion_tokens": 4, "total_tokens": 15})
    );

    // The call record lands in the store through the async queue.
    let mut logged = 0;
    for _ in 0..50 {
        logged = data.store.count_calls("c1").await.unwrap();
        if logged > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(logged, 1);
}

#[actix_web::test]
async fn empty_model_resolves_to_default() {
    let data = app_state(true).await;
    let app = service!(data);

    let request = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("x-api-key", "sk-test"))
        .set_json(json!({"messages": [{"role": "user", "content": "hello"}]}))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 200);
    let body: Value = test::read_body_json(response).await;
    assert_eq!(body["model"], json!("default-model"));
}

#[actix_web::test]
async fn streaming_chat_emits_sse_frames_and_done() {
    let data = app_state(true).await;
    let app = service!(data);

    let mut body = chat_body();
    body["stream"] = json!(true);
    let request = test::TestRequest::post()
        .uri("/v1/chat/completions")
        .insert_header(("x-api-key", "sk-test"))
        .set_json(body)
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 200);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let raw = test::read_body(response).await;
    let text = String::from_utf8(raw.to_vec()).unwrap();
    let frames: Vec<&str> = text
        .split("\n\n")
        .filter(|frame| !frame.is_empty())
        .collect();

    // role frame, text frame, terminator, [DONE].
    assert_eq!(frames.len(), 4);
    let first: Value = serde_json::from_str(frames[0].trim_start_matches("data: ")).unwrap();
    assert_eq!(first["choices"][0]["delta"], json!({"role": "assistant"}));
    let second: Value = serde_json::from_str(frames[1].trim_start_matches("data: ")).unwrap();
    assert_eq!(second["choices"][0]["delta"], json!({"content": "hi"}));
    let third: Value = serde_json::from_str(frames[2].trim_start_matches("data: ")).unwrap();
    assert_eq!(third["choices"][0]["finish_reason"], json!("stop"));
    assert_eq!(
        third["usage"],
        json!({"prompt_tokens": 3, "completion_tokens": 1, "total_tokens": 4})
    );
    assert_eq!(frames[3], "data: [DONE]");
}

#[actix_web::test]
async fn responses_endpoint_buffers_and_streams() {
    let data = app_state(true).await;
    let app = service!(data);

    // Buffered.
    let request = test::TestRequest::post()
        .uri("/v1/responses")
        .insert_header(("x-api-key", "sk-test"))
        .insert_header(("x-request-id", "fixed-id"))
        .set_json(json!({"model": "model-x", "input": "say hi"}))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 200);
    let body: Value = test::read_body_json(response).await;
    assert_eq!(body["id"], json!("resp-fixed-id"));
    assert_eq!(body["status"], json!("completed"));
    assert_eq!(body["output_text"], json!("hello from bedrock"));
    assert_eq!(body["output"][0]["type"], json!("message"));
    assert_eq!(body["parallel_tool_calls"], json!(true));

    // Streaming: gapless sequence numbers, completed before [DONE].
    let request = test::TestRequest::post()
        .uri("/v1/responses")
        .insert_header(("x-api-key", "sk-test"))
        .set_json(json!({"model": "model-x", "input": "say hi", "stream": true}))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 200);

    let raw = test::read_body(response).await;
    let text = String::from_utf8(raw.to_vec()).unwrap();
    let frames: Vec<&str> = text
        .split("\n\n")
        .filter(|frame| !frame.is_empty())
        .collect();
    assert_eq!(*frames.last().unwrap(), "data: [DONE]");

    let events: Vec<Value> = frames[..frames.len() - 1]
        .iter()
        .map(|frame| serde_json::from_str(frame.trim_start_matches("data: ")).unwrap())
        .collect();
    for (expected, event) in events.iter().enumerate() {
        assert_eq!(event["sequence_number"], json!(expected as i64));
    }
    assert_eq!(events[0]["type"], json!("response.created"));
    assert_eq!(
        events.last().unwrap()["type"],
        json!("response.completed")
    );
}

#[actix_web::test]
async fn models_endpoint_lists_catalog_for_client() {
    let data = app_state(true).await;
    data.models
        .replace(vec!["model-a".into(), "model-b".into()]);
    let app = service!(data);

    let request = test::TestRequest::get()
        .uri("/v1/models")
        .insert_header(("x-api-key", "sk-test"))
        .to_request();
    let response = test::call_service(&app, request).await;
    assert_eq!(response.status(), 200);
    let body: Value = test::read_body_json(response).await;
    assert_eq!(body["object"], json!("list"));
    assert_eq!(body["data"].as_array().unwrap().len(), 2);
    assert_eq!(body["data"][0]["object"], json!("model"));

    let unauthorized = test::TestRequest::get().uri("/v1/models").to_request();
    let response = test::call_service(&app, unauthorized).await;
    assert_eq!(response.status(), 401);
}
