//! Public OpenAI-compatible HTTP surface.
//!
//! Admission order for the completion endpoints: upstream configured,
//! authenticate, rate limit, global cost limit, concurrency, decode,
//! validate, model resolution, model enabled, model allowed. Every failure
//! short-circuits with a JSON error before any SSE bytes are written.
//!
//! Streaming detaches from the client: once the upstream stream is open, a
//! spawned task drives it under the server-side request timeout only, and a
//! dead client is detected by the next SSE channel send failing.

use std::collections::BTreeMap;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::{web, HttpRequest, HttpResponse};
use bytes::Bytes;
use futures_util::StreamExt;
use serde_json::{json, Value};
use time::OffsetDateTime;
use tokio::sync::mpsc;

use crate::bedrock::{ChatResult, ConverseStreamSession, StreamDelta};
use crate::error::ServiceError;
use crate::models::chat::{
    render_request_for_log, validate_chat_request, ChatChunkChoice, ChatChunkDelta,
    ChatCompletionChoice, ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse,
    ChatMessage, ErrorPayload, ErrorResponse, ModelInfo, ModelsResponse, ToolCall, Usage,
};
use crate::models::responses::{
    build_responses_output_items, build_responses_output_text, responses_request_to_chat,
    validate_responses_create_request, FunctionCallState, ResponsesCreateRequest,
    ResponsesCreateResponse, ResponsesUsage,
};
use crate::state::{normalize_model_ids, AppState};
use crate::store::CallRecord;
use crate::util::{new_request_id, now_unix, truncate_chars};

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::resource("/healthz")
            .route(web::get().to(healthz))
            .route(web::route().to(method_not_allowed)),
    )
    .service(
        web::resource("/v1/models")
            .route(web::get().to(list_models))
            .route(web::route().to(method_not_allowed)),
    )
    .service(
        web::resource("/v1/chat/completions")
            .route(web::post().to(chat_completions))
            .route(web::route().to(method_not_allowed)),
    )
    .service(
        web::resource("/v1/responses")
            .route(web::post().to(responses_create))
            .route(web::route().to(method_not_allowed)),
    );
}

// ============================================================================
// Error bodies
// ============================================================================

fn error_body(status: u16, message: &str) -> ErrorResponse {
    ErrorResponse {
        error: ErrorPayload {
            message: message.trim().to_string(),
            error_type: if status >= 500 {
                "server_error".to_string()
            } else {
                "invalid_request_error".to_string()
            },
            code: status.to_string(),
        },
    }
}

pub fn error_response(status: u16, message: &str) -> HttpResponse {
    let status_code = StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    HttpResponse::build(status_code).json(error_body(status, message))
}

fn service_error_status(err: &ServiceError) -> u16 {
    match err {
        ServiceError::InvalidRequest(_) | ServiceError::ModelRequired => 400,
        ServiceError::ClientNotConfigured => 503,
        ServiceError::Upstream(_) | ServiceError::StreamClosed => 502,
    }
}

const TIMEOUT_HINT: &str =
    "request canceled or timed out (check for client disconnects or increase REQUEST_TIMEOUT_SECONDS)";

async fn method_not_allowed() -> HttpResponse {
    error_response(405, "method not allowed")
}

// ============================================================================
// Small handlers
// ============================================================================

async fn healthz(state: web::Data<AppState>) -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "ok": true,
        "backend_client_ready": state.proxy.has_client(),
    }))
}

async fn list_models(state: web::Data<AppState>, req: HttpRequest) -> HttpResponse {
    let client = match state.auth.authenticate(&req) {
        Ok(client) => client,
        Err(err) => return error_response(401, &err.to_string()),
    };
    if !client.allow_request() {
        return error_response(429, "rate limit exceeded");
    }

    let models = models_for_client(state.catalog_models(), &client.allowed_models);
    let now = now_unix();
    let data = models
        .into_iter()
        .map(|model_id| ModelInfo {
            id: model_id,
            object: "model".into(),
            created: now,
            owned_by: "aws-bedrock".into(),
        })
        .collect();

    HttpResponse::Ok().json(ModelsResponse {
        object: "list".into(),
        data,
    })
}

fn models_for_client(
    catalog: Vec<String>,
    allowed_models: &std::collections::BTreeSet<String>,
) -> Vec<String> {
    let catalog = normalize_model_ids(catalog);
    if allowed_models.is_empty() {
        return catalog;
    }
    if catalog.is_empty() {
        return allowed_models.iter().cloned().collect();
    }
    catalog
        .into_iter()
        .filter(|model_id| allowed_models.contains(&model_id.to_ascii_lowercase()))
        .collect()
}

// ============================================================================
// Body & record plumbing
// ============================================================================

async fn read_body(mut payload: web::Payload, cap: usize) -> Result<web::BytesMut, String> {
    let mut body = web::BytesMut::new();
    while let Some(chunk) = payload.next().await {
        let chunk = chunk.map_err(|err| err.to_string())?;
        if cap > 0 && body.len() + chunk.len() > cap {
            return Err("request body too large".into());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

fn request_id_from(req: &HttpRequest) -> String {
    req.headers()
        .get("x-request-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
        .unwrap_or_else(new_request_id)
}

#[derive(Debug, Clone, Default)]
struct CallOutcome {
    status_code: u16,
    error_message: String,
    response_content: String,
    input_tokens: i64,
    output_tokens: i64,
    total_tokens: i64,
    latency_ms: i64,
}

impl CallOutcome {
    fn from_result(result: &ChatResult, response_content: String) -> Self {
        CallOutcome {
            status_code: 200,
            error_message: String::new(),
            response_content,
            input_tokens: result.input_tokens,
            output_tokens: result.output_tokens,
            total_tokens: result.total_tokens,
            latency_ms: result.latency_ms,
        }
    }

    fn failure(status_code: u16, message: String) -> Self {
        CallOutcome {
            status_code,
            error_message: message,
            ..Default::default()
        }
    }
}

/// Complete the log lifecycle: truncate previews, enqueue, and accrue cost
/// for records that made it into the queue.
fn finalize_record(
    state: &AppState,
    mut record: CallRecord,
    outcome: CallOutcome,
    started: std::time::Instant,
) {
    let max_chars = state.cfg.max_content_chars;
    record.status_code = outcome.status_code as i64;
    record.error_message = truncate_chars(&outcome.error_message, max_chars);
    record.response_content = truncate_chars(&outcome.response_content, max_chars);
    record.input_tokens = outcome.input_tokens;
    record.output_tokens = outcome.output_tokens;
    record.total_tokens = outcome.total_tokens;
    record.latency_ms = if outcome.latency_ms > 0 {
        outcome.latency_ms
    } else {
        started.elapsed().as_millis() as i64
    };

    let resolved_model_id = record.resolved_model_id.clone();
    let request_id = record.request_id.clone();
    let client_id = record.client_id.clone();
    let input_tokens = record.input_tokens;
    let output_tokens = record.output_tokens;

    if !state.store.enqueue(record) {
        tracing::warn!(
            request_id = %request_id,
            client_id = %client_id,
            "call-log queue full, dropping record"
        );
        return;
    }
    state
        .billing
        .add_cost_from_usage(&resolved_model_id, input_tokens, output_tokens);
}

fn render_assistant_content_for_log(text: &str, tool_calls: &[ToolCall]) -> String {
    let text = text.trim();
    if tool_calls.is_empty() {
        return text.to_string();
    }
    let Ok(payload) = serde_json::to_string(tool_calls) else {
        return text.to_string();
    };
    if text.is_empty() {
        format!("tool_calls={payload}")
    } else {
        format!("{text}\ntool_calls={payload}")
    }
}

/// `null` content when the reply is tool calls only, per the Chat wire
/// format.
fn build_assistant_message_content(text: &str, has_tool_calls: bool) -> Value {
    if has_tool_calls && text.trim().is_empty() {
        return Value::Null;
    }
    Value::String(text.to_string())
}

// ============================================================================
// SSE plumbing
// ============================================================================

/// Sending side of the SSE channel. Sends fail once the client's response
/// stream has been dropped, which is how disconnects are detected.
#[derive(Clone)]
pub struct SseSender {
    tx: mpsc::UnboundedSender<Bytes>,
}

impl SseSender {
    pub fn send_json<T: serde::Serialize>(&self, payload: &T) -> Result<(), ServiceError> {
        let blob =
            serde_json::to_vec(payload).map_err(|err| ServiceError::upstream(err.to_string()))?;
        let mut frame = Vec::with_capacity(blob.len() + 10);
        frame.extend_from_slice(b"data: ");
        frame.extend_from_slice(&blob);
        frame.extend_from_slice(b"\n\n");
        self.tx
            .send(Bytes::from(frame))
            .map_err(|_| ServiceError::StreamClosed)
    }

    pub fn send_done(&self) -> Result<(), ServiceError> {
        self.tx
            .send(Bytes::from_static(b"data: [DONE]\n\n"))
            .map_err(|_| ServiceError::StreamClosed)
    }
}

struct SseChannelStream {
    rx: mpsc::UnboundedReceiver<Bytes>,
}

impl futures_util::Stream for SseChannelStream {
    type Item = Result<Bytes, std::io::Error>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx).map(|item| item.map(Ok))
    }
}

fn sse_channel() -> (SseSender, HttpResponse) {
    let (tx, rx) = mpsc::unbounded_channel();
    let response = HttpResponse::Ok()
        .insert_header(("content-type", "text/event-stream"))
        .insert_header(("cache-control", "no-cache"))
        .insert_header(("connection", "keep-alive"))
        .insert_header(("x-accel-buffering", "no"))
        .streaming(SseChannelStream { rx });
    (SseSender { tx }, response)
}

// ============================================================================
// Chat Completions
// ============================================================================

async fn chat_completions(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Payload,
) -> HttpResponse {
    if !state.proxy.has_client() {
        return error_response(503, "bedrock client is not configured");
    }

    let client = match state.auth.authenticate(&req) {
        Ok(client) => client,
        Err(err) => return error_response(401, &err.to_string()),
    };
    if !client.allow_request() {
        return error_response(429, "rate limit exceeded");
    }
    if let Err(err) = state.billing.check_global_cost_limit() {
        return error_response(429, &err.to_string());
    }

    let started = std::time::Instant::now();
    let deadline = tokio::time::Instant::now() + state.cfg.request_timeout;

    let permit = match tokio::time::timeout_at(deadline, state.auth.acquire(&client)).await {
        Ok(Ok(permit)) => permit,
        _ => return error_response(429, "concurrency limit exceeded"),
    };

    let body = match read_body(payload, state.cfg.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => return error_response(400, &format!("invalid request body: {err}")),
    };
    let request: ChatCompletionRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return error_response(400, &format!("invalid request body: {err}")),
    };
    if let Err(err) = validate_chat_request(&request) {
        return error_response(400, &err.to_string());
    }

    let (resolved_model, model_id) = match state.proxy.resolve_model(&request.model) {
        Ok(resolved) => resolved,
        Err(err) => return error_response(400, &err.to_string()),
    };
    let model_name = if resolved_model == "default" {
        model_id.clone()
    } else {
        resolved_model.clone()
    };

    let request_id = request_id_from(&req);
    let record = CallRecord {
        request_id: request_id.clone(),
        client_id: client.id.clone(),
        model: model_name.clone(),
        resolved_model_id: model_id.clone(),
        input_tokens: 0,
        output_tokens: 0,
        total_tokens: 0,
        latency_ms: 0,
        status_code: 0,
        error_message: String::new(),
        request_content: render_request_for_log(&request, state.cfg.max_content_chars),
        response_content: String::new(),
        is_stream: request.stream,
        created_at: OffsetDateTime::now_utc(),
    };

    if !state.models.is_enabled(&model_id) {
        let message = "model is not enabled by admin";
        finalize_record(
            &state,
            record,
            CallOutcome::failure(403, message.into()),
            started,
        );
        return error_response(403, message);
    }
    if !client.is_model_allowed(&resolved_model, &model_id) {
        let message = "model is not allowed for this api key";
        finalize_record(
            &state,
            record,
            CallOutcome::failure(403, message.into()),
            started,
        );
        return error_response(403, message);
    }

    if request.stream {
        let session =
            match tokio::time::timeout_at(deadline, state.proxy.open_stream(request, &model_id))
                .await
            {
                Ok(Ok(session)) => session,
                Ok(Err(err)) => {
                    let status = service_error_status(&err);
                    let message = format!("bedrock stream failed: {err}");
                    finalize_record(
                        &state,
                        record,
                        CallOutcome::failure(status, message.clone()),
                        started,
                    );
                    return error_response(status, &message);
                }
                Err(_) => {
                    let message = format!("bedrock stream failed: {TIMEOUT_HINT}");
                    finalize_record(
                        &state,
                        record,
                        CallOutcome::failure(502, message.clone()),
                        started,
                    );
                    return error_response(502, &message);
                }
            };

        let (sse, response) = sse_channel();
        let emitter = ChatStreamEmitter::new(&request_id, &model_name);
        let timeout = state.cfg.request_timeout;
        let state = state.into_inner();
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = run_chat_stream(&sse, session, &emitter, timeout).await;
            finalize_record(&state, record, outcome, started);
        });
        return response;
    }

    let result =
        match tokio::time::timeout_at(deadline, state.proxy.converse(request, &model_id)).await {
            Ok(Ok(result)) => result,
            Ok(Err(err)) => {
                let status = service_error_status(&err);
                let message = format!("bedrock call failed: {err}");
                finalize_record(
                    &state,
                    record,
                    CallOutcome::failure(status, message.clone()),
                    started,
                );
                return error_response(status, &message);
            }
            Err(_) => {
                let message = format!("bedrock call failed: {TIMEOUT_HINT}");
                finalize_record(
                    &state,
                    record,
                    CallOutcome::failure(502, message.clone()),
                    started,
                );
                return error_response(502, &message);
            }
        };
    drop(permit);

    let response = ChatCompletionResponse {
        id: format!("chatcmpl-{request_id}"),
        object: "chat.completion".into(),
        created: now_unix(),
        model: model_name,
        choices: vec![ChatCompletionChoice {
            index: 0,
            message: ChatMessage {
                role: "assistant".into(),
                content: build_assistant_message_content(&result.text, !result.tool_calls.is_empty()),
                tool_calls: result.tool_calls.clone(),
                ..Default::default()
            },
            finish_reason: default_finish_reason(&result.finish_reason),
        }],
        usage: Usage {
            prompt_tokens: result.input_tokens,
            completion_tokens: result.output_tokens,
            total_tokens: result.total_tokens,
        },
    };

    let preview = render_assistant_content_for_log(&result.text, &result.tool_calls);
    finalize_record(
        &state,
        record,
        CallOutcome::from_result(&result, preview),
        started,
    );
    HttpResponse::Ok().json(response)
}

fn default_finish_reason(reason: &str) -> String {
    let reason = reason.trim();
    if reason.is_empty() {
        "stop".to_string()
    } else {
        reason.to_string()
    }
}

async fn run_chat_stream(
    sse: &SseSender,
    session: ConverseStreamSession,
    emitter: &ChatStreamEmitter,
    timeout: Duration,
) -> CallOutcome {
    let mut response_text = String::new();

    let drive = session.drive(|delta| {
        if let Some(text) = &delta.text {
            response_text.push_str(text);
        }
        for chunk in emitter.chunks_for_delta(&delta) {
            sse.send_json(&chunk)?;
        }
        Ok(())
    });

    match tokio::time::timeout(timeout, drive).await {
        Ok(Ok(result)) => {
            if let Err(err) = sse
                .send_json(&emitter.terminator(&result))
                .and_then(|_| sse.send_done())
            {
                return CallOutcome {
                    response_content: render_assistant_content_for_log(
                        &result.text,
                        &result.tool_calls,
                    ),
                    ..CallOutcome::failure(502, format!("stream completion failed: {err}"))
                };
            }
            let preview = render_assistant_content_for_log(&result.text, &result.tool_calls);
            CallOutcome::from_result(&result, preview)
        }
        Ok(Err(err)) => {
            let message = match &err {
                ServiceError::StreamClosed => err.to_string(),
                other => format!("bedrock stream failed: {other}"),
            };
            let _ = sse.send_json(&emitter.error_chunk(&message));
            let _ = sse.send_done();
            CallOutcome {
                response_content: response_text,
                ..CallOutcome::failure(502, message)
            }
        }
        Err(_) => {
            let message = format!("bedrock stream failed: {TIMEOUT_HINT}");
            let _ = sse.send_json(&emitter.error_chunk(&message));
            let _ = sse.send_done();
            CallOutcome {
                response_content: response_text,
                ..CallOutcome::failure(502, message)
            }
        }
    }
}

/// Translates normalized `StreamDelta`s into `chat.completion.chunk` frames.
pub struct ChatStreamEmitter {
    chunk_id: String,
    model: String,
    created: i64,
}

impl ChatStreamEmitter {
    pub fn new(request_id: &str, model: &str) -> Self {
        Self {
            chunk_id: format!("chatcmpl-{request_id}"),
            model: model.to_string(),
            created: now_unix(),
        }
    }

    fn chunk(&self, delta: ChatChunkDelta, finish_reason: Option<String>) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.chunk_id.clone(),
            object: "chat.completion.chunk".into(),
            created: self.created,
            model: self.model.clone(),
            choices: vec![ChatChunkChoice {
                index: 0,
                delta,
                finish_reason,
            }],
            usage: None,
            error: None,
        }
    }

    /// A tool-call delta becomes one chunk carrying role (when set) and the
    /// tool calls together; otherwise role and text are emitted as separate
    /// chunks in that order.
    pub fn chunks_for_delta(&self, delta: &StreamDelta) -> Vec<ChatCompletionChunk> {
        if !delta.tool_calls.is_empty() {
            return vec![self.chunk(
                ChatChunkDelta {
                    role: delta.role.clone(),
                    content: None,
                    tool_calls: delta.tool_calls.clone(),
                },
                None,
            )];
        }

        let mut chunks = Vec::with_capacity(2);
        if let Some(role) = &delta.role {
            chunks.push(self.chunk(
                ChatChunkDelta {
                    role: Some(role.clone()),
                    ..Default::default()
                },
                None,
            ));
        }
        if let Some(text) = &delta.text {
            if !text.is_empty() {
                chunks.push(self.chunk(
                    ChatChunkDelta {
                        content: Some(text.clone()),
                        ..Default::default()
                    },
                    None,
                ));
            }
        }
        chunks
    }

    /// Terminator: empty delta, mapped finish_reason and the usage block.
    pub fn terminator(&self, result: &ChatResult) -> ChatCompletionChunk {
        let mut chunk = self.chunk(
            ChatChunkDelta::default(),
            Some(default_finish_reason(&result.finish_reason)),
        );
        chunk.usage = Some(Usage {
            prompt_tokens: result.input_tokens,
            completion_tokens: result.output_tokens,
            total_tokens: result.total_tokens,
        });
        chunk
    }

    /// In-band error frame, used once the SSE body is already open.
    pub fn error_chunk(&self, message: &str) -> ChatCompletionChunk {
        ChatCompletionChunk {
            id: self.chunk_id.clone(),
            object: "chat.completion.chunk".into(),
            created: self.created,
            model: self.model.clone(),
            choices: Vec::new(),
            usage: None,
            error: Some(ErrorPayload {
                message: message.to_string(),
                error_type: "server_error".into(),
                code: "stream_error".into(),
            }),
        }
    }
}

// ============================================================================
// Responses
// ============================================================================

async fn responses_create(
    state: web::Data<AppState>,
    req: HttpRequest,
    payload: web::Payload,
) -> HttpResponse {
    if !state.proxy.has_client() {
        return error_response(503, "bedrock client is not configured");
    }

    let client = match state.auth.authenticate(&req) {
        Ok(client) => client,
        Err(err) => return error_response(401, &err.to_string()),
    };
    if !client.allow_request() {
        return error_response(429, "rate limit exceeded");
    }
    if let Err(err) = state.billing.check_global_cost_limit() {
        return error_response(429, &err.to_string());
    }

    let started = std::time::Instant::now();
    let deadline = tokio::time::Instant::now() + state.cfg.request_timeout;

    let permit = match tokio::time::timeout_at(deadline, state.auth.acquire(&client)).await {
        Ok(Ok(permit)) => permit,
        _ => return error_response(429, "concurrency limit exceeded"),
    };

    let body = match read_body(payload, state.cfg.max_body_bytes).await {
        Ok(body) => body,
        Err(err) => return error_response(400, &format!("invalid request body: {err}")),
    };
    let request: ResponsesCreateRequest = match serde_json::from_slice(&body) {
        Ok(request) => request,
        Err(err) => return error_response(400, &format!("invalid request body: {err}")),
    };
    if let Err(err) = validate_responses_create_request(&request) {
        return error_response(400, &err.to_string());
    }
    let chat_request = match responses_request_to_chat(&request) {
        Ok(chat_request) => chat_request,
        Err(err) => return error_response(400, &err.to_string()),
    };

    let (resolved_model, model_id) = match state.proxy.resolve_model(&chat_request.model) {
        Ok(resolved) => resolved,
        Err(err) => return error_response(400, &err.to_string()),
    };
    let model_name = if resolved_model == "default" {
        model_id.clone()
    } else {
        resolved_model.clone()
    };

    let request_id = request_id_from(&req);
    let record = CallRecord {
        request_id: request_id.clone(),
        client_id: client.id.clone(),
        model: model_name.clone(),
        resolved_model_id: model_id.clone(),
        input_tokens: 0,
        output_tokens: 0,
        total_tokens: 0,
        latency_ms: 0,
        status_code: 0,
        error_message: String::new(),
        request_content: render_request_for_log(&chat_request, state.cfg.max_content_chars),
        response_content: String::new(),
        is_stream: chat_request.stream,
        created_at: OffsetDateTime::now_utc(),
    };

    if !state.models.is_enabled(&model_id) {
        let message = "model is not enabled by admin";
        finalize_record(
            &state,
            record,
            CallOutcome::failure(403, message.into()),
            started,
        );
        return error_response(403, message);
    }
    if !client.is_model_allowed(&resolved_model, &model_id) {
        let message = "model is not allowed for this api key";
        finalize_record(
            &state,
            record,
            CallOutcome::failure(403, message.into()),
            started,
        );
        return error_response(403, message);
    }

    let parallel_tool_calls = request.parallel_tool_calls.unwrap_or(true);
    let tool_choice = request.tool_choice.clone();

    if chat_request.stream {
        let session = match tokio::time::timeout_at(
            deadline,
            state.proxy.open_stream(chat_request, &model_id),
        )
        .await
        {
            Ok(Ok(session)) => session,
            Ok(Err(err)) => {
                let status = service_error_status(&err);
                let message = format!("bedrock stream failed: {err}");
                finalize_record(
                    &state,
                    record,
                    CallOutcome::failure(status, message.clone()),
                    started,
                );
                return error_response(status, &message);
            }
            Err(_) => {
                let message = format!("bedrock stream failed: {TIMEOUT_HINT}");
                finalize_record(
                    &state,
                    record,
                    CallOutcome::failure(502, message.clone()),
                    started,
                );
                return error_response(502, &message);
            }
        };

        let (sse, response) = sse_channel();
        let emitter = ResponsesStreamEmitter::new(
            &request_id,
            &model_name,
            parallel_tool_calls,
            tool_choice,
        );
        let timeout = state.cfg.request_timeout;
        let state = state.into_inner();
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = run_responses_stream(&sse, session, emitter, timeout, &request_id).await;
            finalize_record(&state, record, outcome, started);
        });
        return response;
    }

    let result = match tokio::time::timeout_at(
        deadline,
        state.proxy.converse(chat_request, &model_id),
    )
    .await
    {
        Ok(Ok(result)) => result,
        Ok(Err(err)) => {
            let status = service_error_status(&err);
            let message = format!("bedrock call failed: {err}");
            finalize_record(
                &state,
                record,
                CallOutcome::failure(status, message.clone()),
                started,
            );
            return error_response(status, &message);
        }
        Err(_) => {
            let message = format!("bedrock call failed: {TIMEOUT_HINT}");
            finalize_record(
                &state,
                record,
                CallOutcome::failure(502, message.clone()),
                started,
            );
            return error_response(502, &message);
        }
    };
    drop(permit);

    let output = build_responses_output_items(&request_id, &result.text, &result.tool_calls);
    let output_text = build_responses_output_text(&output);
    let preview = render_responses_output_for_log(&output);

    let response = ResponsesCreateResponse {
        id: format!("resp-{request_id}"),
        object: "response".into(),
        created_at: now_unix(),
        status: "completed".into(),
        model: model_name,
        output,
        usage: ResponsesUsage {
            input_tokens: result.input_tokens,
            output_tokens: result.output_tokens,
            total_tokens: result.total_tokens,
        },
        parallel_tool_calls,
        tool_choice,
        output_text,
        error: None,
        incomplete_details: None,
    };

    finalize_record(
        &state,
        record,
        CallOutcome::from_result(&result, preview),
        started,
    );
    HttpResponse::Ok().json(response)
}

fn render_responses_output_for_log(
    items: &[crate::models::responses::ResponsesOutputItem],
) -> String {
    if items.is_empty() {
        return String::new();
    }
    serde_json::to_string(items).unwrap_or_default()
}

async fn run_responses_stream(
    sse: &SseSender,
    session: ConverseStreamSession,
    mut emitter: ResponsesStreamEmitter,
    timeout: Duration,
    request_id: &str,
) -> CallOutcome {
    for event in emitter.begin() {
        if sse.send_json(&event).is_err() {
            return CallOutcome::failure(502, "stream write failed: client disconnected".into());
        }
    }

    let drive = session.drive(|delta| {
        for event in emitter.on_delta(&delta) {
            sse.send_json(&event)?;
        }
        Ok(())
    });

    match tokio::time::timeout(timeout, drive).await {
        Ok(Ok(result)) => {
            for event in emitter.finish(&result) {
                if let Err(err) = sse.send_json(&event) {
                    return CallOutcome::failure(502, format!("stream write failed: {err}"));
                }
            }
            if let Err(err) = sse.send_done() {
                return CallOutcome::failure(502, format!("stream completion failed: {err}"));
            }
            let items = build_responses_output_items(request_id, &result.text, &result.tool_calls);
            let preview = render_responses_output_for_log(&items);
            CallOutcome::from_result(&result, preview)
        }
        Ok(Err(err)) => {
            let message = match &err {
                ServiceError::StreamClosed => err.to_string(),
                other => format!("bedrock stream failed: {other}"),
            };
            let _ = sse.send_json(&emitter.error_event(&message));
            let _ = sse.send_done();
            CallOutcome {
                response_content: emitter.partial_text().to_string(),
                ..CallOutcome::failure(502, message)
            }
        }
        Err(_) => {
            let message = format!("bedrock stream failed: {TIMEOUT_HINT}");
            let _ = sse.send_json(&emitter.error_event(&message));
            let _ = sse.send_done();
            CallOutcome {
                response_content: emitter.partial_text().to_string(),
                ..CallOutcome::failure(502, message)
            }
        }
    }
}

/// Translates normalized `StreamDelta`s into the Responses-dialect
/// `response.*` event sequence. Every emitted event carries a monotonically
/// increasing top-level `sequence_number` starting at 0.
pub struct ResponsesStreamEmitter {
    response_id: String,
    model: String,
    created_at: i64,
    parallel_tool_calls: bool,
    tool_choice: Option<Value>,
    sequence: i64,
    message_item_id: String,
    message_output_index: Option<usize>,
    content_part_added: bool,
    next_output_index: usize,
    text: String,
    tool_states: BTreeMap<usize, FunctionCallState>,
}

impl ResponsesStreamEmitter {
    pub fn new(
        request_id: &str,
        model: &str,
        parallel_tool_calls: bool,
        tool_choice: Option<Value>,
    ) -> Self {
        Self {
            response_id: format!("resp_{request_id}"),
            model: model.to_string(),
            created_at: now_unix(),
            parallel_tool_calls,
            tool_choice,
            sequence: 0,
            message_item_id: format!("msg_{request_id}"),
            message_output_index: None,
            content_part_added: false,
            next_output_index: 0,
            text: String::new(),
            tool_states: BTreeMap::new(),
        }
    }

    pub fn partial_text(&self) -> &str {
        &self.text
    }

    fn event(&mut self, mut payload: Value) -> Value {
        payload["sequence_number"] = json!(self.sequence);
        self.sequence += 1;
        payload
    }

    fn base_response(&self) -> Value {
        json!({
            "id": self.response_id,
            "object": "response",
            "created_at": self.created_at,
            "status": "in_progress",
            "model": self.model,
            "output": [],
            "parallel_tool_calls": self.parallel_tool_calls,
            "tool_choice": self.tool_choice,
            "error": null,
            "incomplete_details": null,
            "usage": null,
        })
    }

    /// `response.created` followed by `response.in_progress`.
    pub fn begin(&mut self) -> Vec<Value> {
        let base = self.base_response();
        vec![
            self.event(json!({"type": "response.created", "response": base.clone()})),
            self.event(json!({"type": "response.in_progress", "response": base})),
        ]
    }

    pub fn on_delta(&mut self, delta: &StreamDelta) -> Vec<Value> {
        let mut events = Vec::new();

        if let Some(text) = &delta.text {
            if !text.is_empty() {
                if self.message_output_index.is_none() {
                    let output_index = self.next_output_index;
                    self.next_output_index += 1;
                    self.message_output_index = Some(output_index);
                    let item_id = self.message_item_id.clone();
                    events.push(self.event(json!({
                        "type": "response.output_item.added",
                        "output_index": output_index,
                        "item": {
                            "id": item_id,
                            "type": "message",
                            "status": "in_progress",
                            "role": "assistant",
                            "content": [],
                        },
                    })));
                }
                if !self.content_part_added {
                    self.content_part_added = true;
                    let output_index = self.message_output_index.unwrap_or(0);
                    let item_id = self.message_item_id.clone();
                    events.push(self.event(json!({
                        "type": "response.content_part.added",
                        "item_id": item_id,
                        "output_index": output_index,
                        "content_index": 0,
                        "part": {"type": "output_text", "text": "", "annotations": []},
                    })));
                }

                self.text.push_str(text);
                let output_index = self.message_output_index.unwrap_or(0);
                let item_id = self.message_item_id.clone();
                events.push(self.event(json!({
                    "type": "response.output_text.delta",
                    "output_index": output_index,
                    "item_id": item_id,
                    "content_index": 0,
                    "delta": text,
                })));
            }
        }

        for chunk in &delta.tool_calls {
            if !self.tool_states.contains_key(&chunk.index) {
                let mut call_id = chunk.id.clone().unwrap_or_default().trim().to_string();
                if call_id.is_empty() {
                    call_id = format!("call_{}", chunk.index + 1);
                }
                let name = chunk
                    .function
                    .as_ref()
                    .and_then(|function| function.name.clone())
                    .unwrap_or_default()
                    .trim()
                    .to_string();

                let state = FunctionCallState {
                    output_index: self.next_output_index,
                    item_id: format!("fc_{call_id}"),
                    call_id,
                    name,
                    arguments: String::new(),
                };
                self.next_output_index += 1;

                let added = json!({
                    "type": "response.output_item.added",
                    "output_index": state.output_index,
                    "item": {
                        "id": state.item_id,
                        "type": "function_call",
                        "status": "in_progress",
                        "call_id": state.call_id,
                        "name": state.name,
                        "arguments": "",
                    },
                });
                self.tool_states.insert(chunk.index, state);
                events.push(self.event(added));
            }

            if let Some(function) = &chunk.function {
                let state = self
                    .tool_states
                    .get_mut(&chunk.index)
                    .expect("tool state allocated above");
                if state.name.is_empty() {
                    if let Some(name) = &function.name {
                        state.name = name.trim().to_string();
                    }
                }
                if let Some(arguments) = &function.arguments {
                    if !arguments.is_empty() {
                        state.arguments.push_str(arguments);
                        let payload = json!({
                            "type": "response.function_call_arguments.delta",
                            "output_index": state.output_index,
                            "item_id": state.item_id,
                            "call_id": state.call_id,
                            "delta": arguments,
                        });
                        events.push(self.event(payload));
                    }
                }
            }
        }

        events
    }

    /// Completion events: message done (when text was streamed), then each
    /// function call done, then `response.completed`.
    pub fn finish(&mut self, result: &ChatResult) -> Vec<Value> {
        let mut events = Vec::new();

        if let Some(output_index) = self.message_output_index {
            let item_id = self.message_item_id.clone();
            let text = self.text.clone();
            events.push(self.event(json!({
                "type": "response.output_text.done",
                "output_index": output_index,
                "item_id": item_id,
                "content_index": 0,
                "text": text,
            })));
            events.push(self.event(json!({
                "type": "response.content_part.done",
                "item_id": item_id,
                "output_index": output_index,
                "content_index": 0,
                "part": {"type": "output_text", "text": text, "annotations": []},
            })));
            events.push(self.event(json!({
                "type": "response.output_item.done",
                "output_index": output_index,
                "item": {
                    "id": item_id,
                    "type": "message",
                    "status": "completed",
                    "role": "assistant",
                    "content": [{"type": "output_text", "text": text, "annotations": []}],
                },
            })));
        }

        let tool_states: Vec<FunctionCallState> = self.tool_states.values().cloned().collect();
        for state in &tool_states {
            events.push(self.event(json!({
                "type": "response.function_call_arguments.done",
                "output_index": state.output_index,
                "item_id": state.item_id,
                "call_id": state.call_id,
                "arguments": state.arguments,
            })));
            events.push(self.event(json!({
                "type": "response.output_item.done",
                "output_index": state.output_index,
                "item": {
                    "id": state.item_id,
                    "type": "function_call",
                    "status": "completed",
                    "call_id": state.call_id,
                    "name": state.name,
                    "arguments": state.arguments,
                },
            })));
        }

        let mut completed_output: Vec<Value> = Vec::new();
        if self.message_output_index.is_some() {
            completed_output.push(json!({
                "id": self.message_item_id,
                "type": "message",
                "status": "completed",
                "role": "assistant",
                "content": [{"type": "output_text", "text": self.text, "annotations": []}],
            }));
        }
        for state in &tool_states {
            completed_output.push(json!({
                "id": state.item_id,
                "type": "function_call",
                "status": "completed",
                "call_id": state.call_id,
                "name": state.name,
                "arguments": state.arguments,
            }));
        }

        let completed = json!({
            "type": "response.completed",
            "response": {
                "id": self.response_id,
                "object": "response",
                "created_at": self.created_at,
                "status": "completed",
                "model": self.model,
                "output": completed_output,
                "output_text": self.text,
                "parallel_tool_calls": self.parallel_tool_calls,
                "tool_choice": self.tool_choice,
                "error": null,
                "incomplete_details": null,
                "usage": {
                    "input_tokens": result.input_tokens,
                    "output_tokens": result.output_tokens,
                    "total_tokens": result.total_tokens,
                },
            },
        });
        events.push(self.event(completed));
        events
    }

    /// Single in-band error event; no `response.completed` follows.
    pub fn error_event(&mut self, message: &str) -> Value {
        self.event(json!({
            "type": "error",
            "error": {
                "message": message,
                "type": "server_error",
                "code": "stream_error",
            },
        }))
    }
}
