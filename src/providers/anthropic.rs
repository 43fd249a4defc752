//! Anthropic Messages API. System messages move to the top-level `system`
//! block, tool results travel as user-role `tool_result` blocks, and
//! `max_tokens` is mandatory on the wire.

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

const API_VERSION: &str = "2023-06-01";

pub struct AnthropicAdapter {
    api_key: String,
}

impl AnthropicAdapter {
    pub fn new(_config: &ProviderConfig, secrets: &ProviderSecrets) -> Self {
        Self {
            api_key: secrets.anthropic_api_key.clone().unwrap_or_default(),
        }
    }

    fn message_blocks(message: &ChatMessage) -> Option<(&'static str, Vec<Value>)> {
        match message.role {
            Role::System => None,
            Role::User => {
                let blocks: Vec<Value> = message_text_parts(message)
                    .into_iter()
                    .map(|text| json!({ "type": "text", "text": text }))
                    .collect();
                (!blocks.is_empty()).then_some(("user", blocks))
            }
            Role::Assistant => {
                let mut blocks = Vec::new();
                for text in message_text_parts(message) {
                    blocks.push(json!({ "type": "text", "text": text }));
                }
                if let Some(tool_calls) = &message.tool_calls {
                    for call in tool_calls {
                        blocks.push(json!({
                            "type": "tool_use",
                            "id": call.id,
                            "name": call.function.name,
                            "input": arguments_to_value(&call.function.arguments),
                        }));
                    }
                }
                (!blocks.is_empty()).then_some(("assistant", blocks))
            }
            Role::Tool => {
                let tool_use_id = message.tool_call_id.clone().unwrap_or_default();
                let blocks = vec![json!({
                    "type": "tool_result",
                    "tool_use_id": tool_use_id,
                    "content": message.text(),
                })];
                Some(("user", blocks))
            }
        }
    }

    fn tools_to_wire(request: &ChatRequest) -> Option<Vec<Value>> {
        let tools = request.tools.as_ref()?;
        if tools.is_empty() {
            return None;
        }
        Some(
            tools
                .iter()
                .map(|tool| {
                    let mut out = Map::new();
                    out.insert("name".to_string(), Value::String(tool.function.name.clone()));
                    if let Some(description) = &tool.function.description {
                        out.insert(
                            "description".to_string(),
                            Value::String(description.clone()),
                        );
                    }
                    out.insert("input_schema".to_string(), tool.function.parameters.clone());
                    Value::Object(out)
                })
                .collect(),
        )
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

impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn signing(&self) -> Signing {
        Signing::ApiKey {
            header: "x-api-key".to_string(),
            token: self.api_key.clone(),
        }
    }

    fn build_request(
        &self,
        request: &ChatRequest,
        target: &UpstreamTarget,
    ) -> Result<ProviderRequest> {
        let (system, rest) = extract_system(&request.messages);

        let mut messages = Vec::new();
        for message in rest {
            if let Some((role, blocks)) = Self::message_blocks(message) {
                messages.push(json!({ "role": role, "content": blocks }));
            }
        }

        let mut body = Map::new();
        body.insert("model".to_string(), Value::String(target.model.clone()));
        body.insert("messages".to_string(), Value::Array(messages));
        body.insert(
            "max_tokens".to_string(),
            Value::from(max_tokens_or_default(request)),
        );
        if !system.is_empty() {
            body.insert("system".to_string(), Value::String(system));
        }
        if let Some(temperature) = request.temperature {
            let clamped = clamp_temperature(self.name(), temperature, 0.0, 1.0);
            body.insert("temperature".to_string(), json_number(clamped));
        }
        if let Some(top_p) = request.top_p {
            body.insert("top_p".to_string(), json_number(top_p));
        }
        if let Some(stop) = &request.stop {
            if !stop.is_empty() {
                body.insert("stop_sequences".to_string(), json!(stop));
            }
        }
        if let Some(tools) = Self::tools_to_wire(request) {
            body.insert("tools".to_string(), Value::Array(tools));
        }

        let body = serde_json::to_vec(&Value::Object(body))
            .map_err(|err| GatewayError::Internal(format!("encode request: {err}")))?;
        let mut out = ProviderRequest::post_json("/v1/messages", body, self.signing());
        out.headers
            .insert("anthropic-version".to_string(), API_VERSION.to_string());
        Ok(out)
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
            GatewayError::Internal(format!("anthropic response decode error: {err}"))
        })?;

        let mut text = String::new();
        let mut tool_calls = Vec::<ToolCall>::new();
        if let Some(parts) = value.get("content").and_then(Value::as_array) {
            for part in parts {
                match part.get("type").and_then(Value::as_str) {
                    Some("text") => {
                        if let Some(chunk) = part.get("text").and_then(Value::as_str) {
                            text.push_str(chunk);
                        }
                    }
                    Some("tool_use") => {
                        tool_calls.push(ToolCall {
                            id: part
                                .get("id")
                                .and_then(Value::as_str)
                                .unwrap_or_default()
                                .to_string(),
                            kind: "function".to_string(),
                            function: FunctionCall {
                                name: part
                                    .get("name")
                                    .and_then(Value::as_str)
                                    .unwrap_or_default()
                                    .to_string(),
                                arguments: value_to_arguments(
                                    part.get("input").unwrap_or(&Value::Null),
                                ),
                            },
                        });
                    }
                    _ => {}
                }
            }
        }

        let finish_reason =
            Self::finish_reason(value.get("stop_reason").and_then(Value::as_str));
        let usage = Usage::new(
            value
                .pointer("/usage/input_tokens")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            value
                .pointer("/usage/output_tokens")
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
        let id = value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| synthesize_response_id("chatcmpl-"));

        Ok(ChatResponse::assistant(
            id,
            request.model.clone(),
            message,
            finish_reason,
            usage,
        ))
    }

    fn probe_request(&self) -> ProviderRequest {
        let mut out = ProviderRequest::get("/v1/models", self.signing());
        out.headers
            .insert("anthropic-version".to_string(), API_VERSION.to_string());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FunctionDef, ToolDef};
    use serde_json::json;

    fn adapter() -> AnthropicAdapter {
        let secrets = ProviderSecrets {
            anthropic_api_key: Some("sk-ant".to_string()),
            ..Default::default()
        };
        AnthropicAdapter::new(&ProviderConfig::default(), &secrets)
    }

    fn target() -> UpstreamTarget {
        UpstreamTarget {
            model: "claude-3-sonnet-20240229".to_string(),
            info: None,
            config: ProviderConfig::default(),
        }
    }

    fn base_request() -> ChatRequest {
        ChatRequest {
            model: "claude-3-sonnet".to_string(),
            messages: vec![ChatMessage::user("hi")],
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            tools: None,
            tool_choice: None,
            response_format: None,
            stream: false,
        }
    }

    #[test]
    fn max_tokens_defaults_to_4096() {
        let built = adapter().build_request(&base_request(), &target()).unwrap();
        let body: Value = serde_json::from_slice(&built.body).unwrap();
        assert_eq!(body["max_tokens"], 4096);
        assert_eq!(built.headers["anthropic-version"], API_VERSION);
    }

    #[test]
    fn system_messages_move_to_top_level_block() {
        let mut request = base_request();
        request.messages.insert(0, ChatMessage::system("be terse"));
        let built = adapter().build_request(&request, &target()).unwrap();
        let body: Value = serde_json::from_slice(&built.body).unwrap();
        assert_eq!(body["system"], "be terse");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], "user");
    }

    #[test]
    fn tools_become_input_schema_declarations() {
        let mut request = base_request();
        request.tools = Some(vec![ToolDef {
            kind: "function".to_string(),
            function: FunctionDef {
                name: "get_weather".to_string(),
                description: Some("weather lookup".to_string()),
                parameters: json!({
                    "type": "object",
                    "properties": { "location": { "type": "string" } },
                    "required": ["location"]
                }),
            },
        }]);
        let built = adapter().build_request(&request, &target()).unwrap();
        let body: Value = serde_json::from_slice(&built.body).unwrap();
        assert_eq!(body["tools"][0]["name"], "get_weather");
        assert_eq!(
            body["tools"][0]["input_schema"]["required"][0],
            "location"
        );
    }

    #[test]
    fn tool_roundtrip_preserves_calls_and_results() {
        let mut request = base_request();
        request.messages = vec![
            ChatMessage::user("weather?"),
            ChatMessage {
                role: Role::Assistant,
                content: None,
                name: None,
                tool_calls: Some(vec![ToolCall {
                    id: "toolu_1".to_string(),
                    kind: "function".to_string(),
                    function: FunctionCall {
                        name: "get_weather".to_string(),
                        arguments: "{\"location\":\"SF\"}".to_string(),
                    },
                }]),
                tool_call_id: None,
            },
            ChatMessage {
                role: Role::Tool,
                content: Some(MessageContent::Text("72F".to_string())),
                name: None,
                tool_calls: None,
                tool_call_id: Some("toolu_1".to_string()),
            },
        ];
        let built = adapter().build_request(&request, &target()).unwrap();
        let body: Value = serde_json::from_slice(&built.body).unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[1]["content"][0]["type"], "tool_use");
        assert_eq!(messages[1]["content"][0]["input"]["location"], "SF");
        assert_eq!(messages[2]["role"], "user");
        assert_eq!(messages[2]["content"][0]["type"], "tool_result");
        assert_eq!(messages[2]["content"][0]["tool_use_id"], "toolu_1");
    }

    #[test]
    fn parses_tool_use_response() {
        let upstream = json!({
            "id": "msg_01",
            "content": [
                { "type": "tool_use", "id": "toolu_9", "name": "get_weather",
                  "input": { "location": "San Francisco" } }
            ],
            "stop_reason": "tool_use",
            "usage": { "input_tokens": 30, "output_tokens": 12 }
        });
        let response = adapter()
            .parse_response(&base_request(), 200, upstream.to_string().as_bytes())
            .unwrap();
        assert_eq!(response.choices[0].finish_reason, FinishReason::ToolCalls);
        let calls = response.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "get_weather");
        let args: Value = serde_json::from_str(&calls[0].function.arguments).unwrap();
        assert_eq!(args["location"], "San Francisco");
        assert_eq!(response.usage.total_tokens, 42);
    }

    #[test]
    fn stop_reason_mapping() {
        assert_eq!(
            AnthropicAdapter::finish_reason(Some("end_turn")),
            FinishReason::Stop
        );
        assert_eq!(
            AnthropicAdapter::finish_reason(Some("max_tokens")),
            FinishReason::Length
        );
        assert_eq!(
            AnthropicAdapter::finish_reason(Some("tool_use")),
            FinishReason::ToolCalls
        );
    }
}
