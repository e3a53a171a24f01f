//! AWS SDK glue: builds the Bedrock runtime/control clients from persisted
//! configuration, implements `ConverseApi` over `aws-sdk-bedrockruntime`, and
//! fetches the foundation-model catalog.
//!
//! SigV4 signing and credential refresh are handled by the SDK; nothing in
//! this module touches raw HTTP.

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_bedrockruntime::config::{Credentials, Region};
use aws_sdk_bedrockruntime::types as brtypes;
use aws_smithy_types::{Document, Number};
use serde_json::Value;

use crate::bedrock::{
    BlockDelta, ContentBlock, ConverseApi, ConverseEventStream, ConverseMessage, ConverseReply,
    ConverseRequest, ConverseRole, ConverseStreamEvent, ConverseUsage, InferenceConfig,
    StopReason, ToolChoice, ToolConfig, ToolResultContent, ToolUseBlock, ToolUseStart,
};
use crate::error::ServiceError;
use crate::store::AwsRuntimeConfig;

/// Build the runtime (Converse) and control-plane (catalog) clients from the
/// persisted AWS configuration. Static credentials are optional; without
/// them the SDK falls back to its default provider chain.
pub async fn build_bedrock_clients(
    cfg: &AwsRuntimeConfig,
) -> Result<(aws_sdk_bedrockruntime::Client, aws_sdk_bedrock::Client), ServiceError> {
    let region = cfg.region.trim().to_string();
    if region.is_empty() {
        return Err(ServiceError::invalid("region is required"));
    }

    let access_key_id = cfg.access_key_id.trim().to_string();
    let secret_access_key = cfg.secret_access_key.trim().to_string();
    if access_key_id.is_empty() != secret_access_key.is_empty() {
        return Err(ServiceError::invalid(
            "access_key_id and secret_access_key must be set together",
        ));
    }

    let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(Region::new(region));
    if !access_key_id.is_empty() {
        let session_token = {
            let token = cfg.session_token.trim();
            if token.is_empty() {
                None
            } else {
                Some(token.to_string())
            }
        };
        loader = loader.credentials_provider(Credentials::new(
            access_key_id,
            secret_access_key,
            session_token,
            None,
            "bedrock-router-static",
        ));
    }
    let sdk_config = loader.load().await;

    Ok((
        aws_sdk_bedrockruntime::Client::new(&sdk_config),
        aws_sdk_bedrock::Client::new(&sdk_config),
    ))
}

/// `ConverseApi` implementation backed by the Bedrock runtime client.
pub struct AwsConverseClient {
    client: aws_sdk_bedrockruntime::Client,
}

impl AwsConverseClient {
    pub fn new(client: aws_sdk_bedrockruntime::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConverseApi for AwsConverseClient {
    async fn converse(&self, request: ConverseRequest) -> Result<ConverseReply, ServiceError> {
        let (messages, system, inference, tool_config) = to_sdk_request(&request)?;

        let mut op = self
            .client
            .converse()
            .model_id(&request.model_id)
            .set_messages(Some(messages));
        if !system.is_empty() {
            op = op.set_system(Some(system));
        }
        if let Some(inference) = inference {
            op = op.inference_config(inference);
        }
        if let Some(tool_config) = tool_config {
            op = op.tool_config(tool_config);
        }

        let output = op.send().await.map_err(|err| {
            ServiceError::upstream(format!(
                "{}",
                aws_sdk_bedrockruntime::error::DisplayErrorContext(&err)
            ))
        })?;

        let mut content: Vec<ContentBlock> = Vec::new();
        if let Some(brtypes::ConverseOutput::Message(message)) = output.output() {
            for block in message.content() {
                match block {
                    brtypes::ContentBlock::Text(text) => {
                        content.push(ContentBlock::Text(text.clone()));
                    }
                    brtypes::ContentBlock::ToolUse(tool_use) => {
                        content.push(ContentBlock::ToolUse(ToolUseBlock {
                            id: tool_use.tool_use_id().to_string(),
                            name: tool_use.name().to_string(),
                            input: document_to_json(tool_use.input()),
                        }));
                    }
                    _ => {}
                }
            }
        }

        let usage = output.usage().map(|usage| ConverseUsage {
            input_tokens: usage.input_tokens() as i64,
            output_tokens: usage.output_tokens() as i64,
            total_tokens: usage.total_tokens() as i64,
        });
        let latency_ms = output.metrics().map(|m| m.latency_ms()).unwrap_or(0);

        Ok(ConverseReply {
            content,
            stop_reason: from_sdk_stop_reason(output.stop_reason()),
            usage,
            latency_ms,
        })
    }

    async fn converse_stream(
        &self,
        request: ConverseRequest,
    ) -> Result<ConverseEventStream, ServiceError> {
        let (messages, system, inference, tool_config) = to_sdk_request(&request)?;

        let mut op = self
            .client
            .converse_stream()
            .model_id(&request.model_id)
            .set_messages(Some(messages));
        if !system.is_empty() {
            op = op.set_system(Some(system));
        }
        if let Some(inference) = inference {
            op = op.inference_config(inference);
        }
        if let Some(tool_config) = tool_config {
            op = op.tool_config(tool_config);
        }

        let output = op.send().await.map_err(|err| {
            ServiceError::upstream(format!(
                "{}",
                aws_sdk_bedrockruntime::error::DisplayErrorContext(&err)
            ))
        })?;

        let mut event_stream = output.stream;
        let stream = async_stream::stream! {
            loop {
                match event_stream.recv().await {
                    Ok(Some(event)) => {
                        if let Some(mapped) = map_stream_event(event) {
                            yield Ok(mapped);
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        yield Err(ServiceError::upstream(format!(
                            "{}",
                            aws_sdk_bedrockruntime::error::DisplayErrorContext(&err)
                        )));
                        break;
                    }
                }
            }
        };
        Ok(Box::pin(stream))
    }
}

type SdkRequestParts = (
    Vec<brtypes::Message>,
    Vec<brtypes::SystemContentBlock>,
    Option<brtypes::InferenceConfiguration>,
    Option<brtypes::ToolConfiguration>,
);

fn to_sdk_request(request: &ConverseRequest) -> Result<SdkRequestParts, ServiceError> {
    let mut messages = Vec::with_capacity(request.messages.len());
    for message in &request.messages {
        messages.push(to_sdk_message(message)?);
    }

    let system = request
        .system
        .iter()
        .map(|text| brtypes::SystemContentBlock::Text(text.clone()))
        .collect();

    let inference = request.inference.as_ref().map(to_sdk_inference_config);
    let tool_config = match &request.tool_config {
        Some(config) => Some(to_sdk_tool_config(config)?),
        None => None,
    };

    Ok((messages, system, inference, tool_config))
}

fn to_sdk_message(message: &ConverseMessage) -> Result<brtypes::Message, ServiceError> {
    let role = match message.role {
        ConverseRole::User => brtypes::ConversationRole::User,
        ConverseRole::Assistant => brtypes::ConversationRole::Assistant,
    };

    let mut blocks = Vec::with_capacity(message.content.len());
    for block in &message.content {
        blocks.push(to_sdk_content_block(block)?);
    }

    brtypes::Message::builder()
        .role(role)
        .set_content(Some(blocks))
        .build()
        .map_err(|err| ServiceError::invalid(format!("invalid converse message: {err}")))
}

fn to_sdk_content_block(block: &ContentBlock) -> Result<brtypes::ContentBlock, ServiceError> {
    match block {
        ContentBlock::Text(text) => Ok(brtypes::ContentBlock::Text(text.clone())),
        ContentBlock::ToolUse(tool_use) => {
            let built = brtypes::ToolUseBlock::builder()
                .tool_use_id(&tool_use.id)
                .name(&tool_use.name)
                .input(json_to_document(&tool_use.input))
                .build()
                .map_err(|err| ServiceError::invalid(format!("invalid tool use block: {err}")))?;
            Ok(brtypes::ContentBlock::ToolUse(built))
        }
        ContentBlock::ToolResult(tool_result) => {
            let content = tool_result
                .content
                .iter()
                .map(|item| match item {
                    ToolResultContent::Text(text) => {
                        brtypes::ToolResultContentBlock::Text(text.clone())
                    }
                    ToolResultContent::Json(value) => {
                        brtypes::ToolResultContentBlock::Json(json_to_document(value))
                    }
                })
                .collect::<Vec<_>>();
            let built = brtypes::ToolResultBlock::builder()
                .tool_use_id(&tool_result.tool_use_id)
                .set_content(Some(content))
                .build()
                .map_err(|err| ServiceError::invalid(format!("invalid tool result block: {err}")))?;
            Ok(brtypes::ContentBlock::ToolResult(built))
        }
    }
}

fn to_sdk_inference_config(cfg: &InferenceConfig) -> brtypes::InferenceConfiguration {
    brtypes::InferenceConfiguration::builder()
        .set_temperature(cfg.temperature)
        .set_top_p(cfg.top_p)
        .set_max_tokens(cfg.max_tokens)
        .build()
}

fn to_sdk_tool_config(
    config: &ToolConfig,
) -> Result<brtypes::ToolConfiguration, ServiceError> {
    let mut tools = Vec::with_capacity(config.tools.len());
    for tool_spec in &config.tools {
        let built = brtypes::ToolSpecification::builder()
            .name(&tool_spec.name)
            .set_description(tool_spec.description.clone())
            .input_schema(brtypes::ToolInputSchema::Json(json_to_document(
                &tool_spec.input_schema,
            )))
            .build()
            .map_err(|err| ServiceError::invalid(format!("invalid tool specification: {err}")))?;
        tools.push(brtypes::Tool::ToolSpec(built));
    }

    let tool_choice = match &config.tool_choice {
        None => None,
        Some(ToolChoice::Auto) => Some(brtypes::ToolChoice::Auto(
            brtypes::AutoToolChoice::builder().build(),
        )),
        Some(ToolChoice::Any) => Some(brtypes::ToolChoice::Any(
            brtypes::AnyToolChoice::builder().build(),
        )),
        Some(ToolChoice::Tool(name)) => {
            let specific = brtypes::SpecificToolChoice::builder()
                .name(name)
                .build()
                .map_err(|err| ServiceError::invalid(format!("invalid tool choice: {err}")))?;
            Some(brtypes::ToolChoice::Tool(specific))
        }
    };

    brtypes::ToolConfiguration::builder()
        .set_tools(Some(tools))
        .set_tool_choice(tool_choice)
        .build()
        .map_err(|err| ServiceError::invalid(format!("invalid tool configuration: {err}")))
}

fn map_stream_event(event: brtypes::ConverseStreamOutput) -> Option<ConverseStreamEvent> {
    match event {
        brtypes::ConverseStreamOutput::MessageStart(_) => Some(ConverseStreamEvent::MessageStart),
        brtypes::ConverseStreamOutput::ContentBlockStart(start) => {
            let block_index = start.content_block_index().max(0) as usize;
            let tool_use = match start.start() {
                Some(brtypes::ContentBlockStart::ToolUse(tool_use)) => Some(ToolUseStart {
                    id: tool_use.tool_use_id().to_string(),
                    name: tool_use.name().to_string(),
                }),
                _ => None,
            };
            Some(ConverseStreamEvent::ContentBlockStart {
                block_index,
                tool_use,
            })
        }
        brtypes::ConverseStreamOutput::ContentBlockDelta(delta_event) => {
            let block_index = delta_event.content_block_index().max(0) as usize;
            match delta_event.delta() {
                Some(brtypes::ContentBlockDelta::Text(text)) => {
                    Some(ConverseStreamEvent::ContentBlockDelta {
                        block_index,
                        delta: BlockDelta::Text(text.clone()),
                    })
                }
                Some(brtypes::ContentBlockDelta::ToolUse(tool_use)) => {
                    Some(ConverseStreamEvent::ContentBlockDelta {
                        block_index,
                        delta: BlockDelta::ToolUseInput(tool_use.input().to_string()),
                    })
                }
                _ => None,
            }
        }
        brtypes::ConverseStreamOutput::ContentBlockStop(stop) => {
            Some(ConverseStreamEvent::ContentBlockStop {
                block_index: stop.content_block_index().max(0) as usize,
            })
        }
        brtypes::ConverseStreamOutput::MessageStop(stop) => Some(ConverseStreamEvent::MessageStop {
            stop_reason: from_sdk_stop_reason(stop.stop_reason()),
        }),
        brtypes::ConverseStreamOutput::Metadata(metadata) => Some(ConverseStreamEvent::Metadata {
            usage: metadata.usage().map(|usage| ConverseUsage {
                input_tokens: usage.input_tokens() as i64,
                output_tokens: usage.output_tokens() as i64,
                total_tokens: usage.total_tokens() as i64,
            }),
            latency_ms: metadata.metrics().map(|metrics| metrics.latency_ms()),
        }),
        _ => None,
    }
}

fn from_sdk_stop_reason(reason: &brtypes::StopReason) -> StopReason {
    match reason {
        brtypes::StopReason::MaxTokens => StopReason::MaxTokens,
        brtypes::StopReason::ToolUse => StopReason::ToolUse,
        brtypes::StopReason::EndTurn => StopReason::EndTurn,
        other => StopReason::Other(other.as_str().to_string()),
    }
}

/// JSON → smithy Document, for tool schemas and tool-use inputs.
pub fn json_to_document(value: &Value) -> Document {
    match value {
        Value::Null => Document::Null,
        Value::Bool(flag) => Document::Bool(*flag),
        Value::Number(number) => {
            if let Some(unsigned) = number.as_u64() {
                Document::Number(Number::PosInt(unsigned))
            } else if let Some(signed) = number.as_i64() {
                Document::Number(Number::NegInt(signed))
            } else {
                Document::Number(Number::Float(number.as_f64().unwrap_or(0.0)))
            }
        }
        Value::String(text) => Document::String(text.clone()),
        Value::Array(items) => Document::Array(items.iter().map(json_to_document).collect()),
        Value::Object(map) => Document::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), json_to_document(item)))
                .collect(),
        ),
    }
}

/// smithy Document → JSON, for tool-use inputs coming back from the model.
pub fn document_to_json(document: &Document) -> Value {
    match document {
        Document::Null => Value::Null,
        Document::Bool(flag) => Value::Bool(*flag),
        Document::Number(Number::PosInt(unsigned)) => Value::from(*unsigned),
        Document::Number(Number::NegInt(signed)) => Value::from(*signed),
        Document::Number(Number::Float(float)) => serde_json::Number::from_f64(*float)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        Document::String(text) => Value::String(text.clone()),
        Document::Array(items) => Value::Array(items.iter().map(document_to_json).collect()),
        Document::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), document_to_json(item)))
                .collect(),
        ),
    }
}

/// List text-capable foundation models. In North-America regions the ids are
/// returned as `us.`-prefixed cross-region inference profiles, which is what
/// Converse expects there.
pub async fn fetch_available_models(
    client: &aws_sdk_bedrock::Client,
    region: &str,
) -> Result<Vec<String>, ServiceError> {
    let output = client
        .list_foundation_models()
        .by_output_modality(aws_sdk_bedrock::types::ModelModality::Text)
        .send()
        .await
        .map_err(|err| {
            ServiceError::upstream(format!(
                "{}",
                aws_sdk_bedrock::error::DisplayErrorContext(&err)
            ))
        })?;

    let mut model_ids: Vec<String> = Vec::new();
    for summary in output.model_summaries() {
        let model_id = summary.model_id().trim();
        if model_id.is_empty() {
            continue;
        }
        if !summary.input_modalities().is_empty()
            && !summary
                .input_modalities()
                .contains(&aws_sdk_bedrock::types::ModelModality::Text)
        {
            continue;
        }
        if !summary.output_modalities().is_empty()
            && !summary
                .output_modalities()
                .contains(&aws_sdk_bedrock::types::ModelModality::Text)
        {
            continue;
        }
        model_ids.push(model_id.to_string());
    }

    let model_ids = crate::state::normalize_model_ids(model_ids);
    if !is_north_america_region(region) {
        return Ok(model_ids);
    }

    let with_us_prefix = model_ids
        .into_iter()
        .map(|model_id| {
            if model_id.starts_with("us.") {
                model_id
            } else {
                format!("us.{model_id}")
            }
        })
        .collect();
    Ok(crate::state::normalize_model_ids(with_us_prefix))
}

fn is_north_america_region(region: &str) -> bool {
    let region = region.trim().to_ascii_lowercase();
    region.starts_with("us-") || region.starts_with("ca-") || region.starts_with("mx-")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_document_round_trip() {
        let value = json!({
            "city": "San Francisco",
            "days": 3,
            "celsius": true,
            "extras": [1.5, "wind", null],
            "nested": {"depth": -2}
        });
        let round_tripped = document_to_json(&json_to_document(&value));
        assert_eq!(round_tripped, value);
    }

    #[test]
    fn north_america_detection() {
        assert!(is_north_america_region("us-east-1"));
        assert!(is_north_america_region("CA-central-1"));
        assert!(is_north_america_region("mx-central-1"));
        assert!(!is_north_america_region("eu-west-1"));
        assert!(!is_north_america_region(""));
    }
}
