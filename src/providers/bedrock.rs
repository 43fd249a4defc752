//! AWS Bedrock Converse API, signed with SigV4. System messages move to
//! the `system` block and tool interactions travel as `toolUse` /
//! `toolResult` content blocks.

use serde_json::{json, Map, Value};

use super::openai::json_number;
use super::{
    arguments_to_value, clamp_temperature, extract_system, max_tokens_or_default,
    message_text_parts, synthesize_response_id, upstream_error, value_to_arguments,
    ProviderAdapter, ProviderRequest, Signing, UpstreamTarget,
};
use crate::config::{ProviderConfig, ProviderSecrets};
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, FinishReason, FunctionCall, MessageContent, Role,
    ToolCall, Usage,
};
use crate::{GatewayError, Result};

const SERVICE: &str = "bedrock";
const DEFAULT_REGION: &str = "us-east-1";

pub struct BedrockAdapter {
    region: String,
}

impl BedrockAdapter {
    pub fn new(config: &ProviderConfig, secrets: &ProviderSecrets) -> Self {
        let region = config
            .region
            .clone()
            .or_else(|| secrets.aws_region.clone())
            .unwrap_or_else(|| DEFAULT_REGION.to_string());
        Self { region }
    }

    fn message_to_wire(message: &ChatMessage) -> Option<Value> {
        match message.role {
            Role::System => None,
            Role::User => {
                let content: Vec<Value> = message_text_parts(message)
                    .into_iter()
                    .map(|text| json!({ "text": text }))
                    .collect();
                (!content.is_empty()).then(|| json!({ "role": "user", "content": content }))
            }
            Role::Assistant => {
                let mut content = Vec::new();
                for text in message_text_parts(message) {
                    content.push(json!({ "text": text }));
                }
                if let Some(tool_calls) = &message.tool_calls {
                    for call in tool_calls {
                        content.push(json!({
                            "toolUse": {
                                "toolUseId": call.id,
                                "name": call.function.name,
                                "input": arguments_to_value(&call.function.arguments),
                            }
                        }));
                    }
                }
                (!content.is_empty()).then(|| json!({ "role": "assistant", "content": content }))
            }
            Role::Tool => {
                let tool_use_id = message.tool_call_id.clone().unwrap_or_default();
                Some(json!({
                    "role": "user",
                    "content": [{
                        "toolResult": {
                            "toolUseId": tool_use_id,
                            "content": [{ "text": message.text() }],
                        }
                    }]
                }))
            }
        }
    }

    fn tool_config(request: &ChatRequest) -> Option<Value> {
        let tools = request.tools.as_ref()?;
        if tools.is_empty() {
            return None;
        }
        let specs: Vec<Value> = tools
            .iter()
            .map(|tool| {
                let mut spec = Map::new();
                spec.insert(
                    "name".to_string(),
                    Value::String(tool.function.name.clone()),
                );
                if let Some(description) = &tool.function.description {
                    spec.insert(
                        "description".to_string(),
                        Value::String(description.clone()),
                    );
                }
                spec.insert(
                    "inputSchema".to_string(),
                    json!({ "json": tool.function.parameters }),
                );
                json!({ "toolSpec": spec })
            })
            .collect();
        Some(json!({ "tools": specs }))
    }

    fn finish_reason(stop_reason: Option<&str>) -> FinishReason {
        match stop_reason {
            Some("max_tokens") => FinishReason::Length,
            Some("tool_use") => FinishReason::ToolCalls,
            Some("content_filtered") => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }
}

impl ProviderAdapter for BedrockAdapter {
    fn name(&self) -> &'static str {
        "bedrock"
    }

    fn signing(&self) -> Signing {
        Signing::SigV4 {
            region: self.region.clone(),
            service: SERVICE.to_string(),
        }
    }

    fn build_request(
        &self,
        request: &ChatRequest,
        target: &UpstreamTarget,
    ) -> Result<ProviderRequest> {
        let (system, rest) = extract_system(&request.messages);

        let messages: Vec<Value> = rest.iter().filter_map(|m| Self::message_to_wire(m)).collect();

        let mut inference = Map::new();
        inference.insert(
            "maxTokens".to_string(),
            Value::from(max_tokens_or_default(request)),
        );
        if let Some(temperature) = request.temperature {
            let clamped = clamp_temperature(self.name(), temperature, 0.0, 1.0);
            inference.insert("temperature".to_string(), json_number(clamped));
        }
        if let Some(top_p) = request.top_p {
            inference.insert("topP".to_string(), json_number(top_p));
        }
        if let Some(stop) = &request.stop {
            if !stop.is_empty() {
                inference.insert("stopSequences".to_string(), json!(stop));
            }
        }

        let mut body = Map::new();
        body.insert("messages".to_string(), Value::Array(messages));
        body.insert("inferenceConfig".to_string(), Value::Object(inference));
        if !system.is_empty() {
            body.insert("system".to_string(), json!([{ "text": system }]));
        }
        if let Some(tool_config) = Self::tool_config(request) {
            body.insert("toolConfig".to_string(), tool_config);
        }

        let body = serde_json::to_vec(&Value::Object(body))
            .map_err(|err| GatewayError::Internal(format!("encode request: {err}")))?;
        Ok(ProviderRequest::post_json(
            format!("/model/{}/converse", target.model),
            body,
            self.signing(),
        ))
    }

    fn parse_response(
        &self,
        request: &ChatRequest,
        status: u16,
        body: &[u8],
    ) -> Result<ChatResponse> {
        if !(200..300).contains(&status) {
            return Err(upstream_error(self.name(), status, body));
        }
        let value: Value = serde_json::from_slice(body).map_err(|err| {
            GatewayError::Internal(format!("bedrock response decode error: {err}"))
        })?;

        let mut text = String::new();
        let mut tool_calls = Vec::<ToolCall>::new();
        if let Some(parts) = value
            .pointer("/output/message/content")
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(chunk) = part.get("text").and_then(Value::as_str) {
                    text.push_str(chunk);
                }
                if let Some(tool_use) = part.get("toolUse") {
                    tool_calls.push(ToolCall {
                        id: tool_use
                            .get("toolUseId")
                            .and_then(Value::as_str)
                            .unwrap_or_default()
                            .to_string(),
                        kind: "function".to_string(),
                        function: FunctionCall {
                            name: tool_use
                                .get("name")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            arguments: value_to_arguments(
                                tool_use.get("input").unwrap_or(&Value::Null),
                            ),
                        },
                    });
                }
            }
        }

        let finish_reason = Self::finish_reason(value.get("stopReason").and_then(Value::as_str));
        let usage = Usage::new(
            value
                .pointer("/usage/inputTokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            value
                .pointer("/usage/outputTokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        );

        let message = ChatMessage {
            role: Role::Assistant,
            content: (!text.is_empty()).then(|| MessageContent::Text(text)),
            name: None,
            tool_calls: (!tool_calls.is_empty()).then_some(tool_calls),
            tool_call_id: None,
        };

        Ok(ChatResponse::assistant(
            synthesize_response_id("chatcmpl-"),
            request.model.clone(),
            message,
            finish_reason,
            usage,
        ))
    }

    fn probe_request(&self) -> ProviderRequest {
        ProviderRequest::get("/foundation-models", self.signing())
    }
}
