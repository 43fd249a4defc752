//! Google Vertex `generateContent`. Assistant messages become role
//! `model`, tool messages role `function`, and system messages move to
//! `systemInstruction`.

use serde_json::{json, Map, Value};

use super::openai::json_number;
use super::{
    arguments_to_value, clamp_temperature, extract_system, message_text_parts,
    synthesize_response_id, upstream_error, value_to_arguments, ProviderAdapter, ProviderRequest,
    Signing, UpstreamTarget,
};
use crate::config::{ProviderConfig, ProviderSecrets};
use crate::types::{
    ChatMessage, ChatRequest, ChatResponse, FinishReason, FunctionCall, MessageContent, Role,
    ToolCall, Usage,
};
use crate::{GatewayError, Result};

const DEFAULT_LOCATION: &str = "us-central1";

pub struct VertexAdapter {
    project_id: String,
    location: String,
    access_token: String,
}

impl VertexAdapter {
    pub fn new(config: &ProviderConfig, secrets: &ProviderSecrets) -> Self {
        Self {
            project_id: config
                .project_id
                .clone()
                .or_else(|| secrets.vertex_project_id.clone())
                .unwrap_or_default(),
            location: config
                .location
                .clone()
                .or_else(|| secrets.vertex_location.clone())
                .unwrap_or_else(|| DEFAULT_LOCATION.to_string()),
            access_token: secrets.vertex_access_token.clone().unwrap_or_default(),
        }
    }

    fn location_for(&self, target: &UpstreamTarget) -> String {
        target
            .info
            .as_ref()
            .and_then(|info| info.location.clone())
            .filter(|l| !l.is_empty())
            .unwrap_or_else(|| self.location.clone())
    }

    fn message_to_content(message: &ChatMessage) -> Option<Value> {
        match message.role {
            Role::System => None,
            Role::User => {
                let parts: Vec<Value> = message_text_parts(message)
                    .into_iter()
                    .map(|text| json!({ "text": text }))
                    .collect();
                (!parts.is_empty()).then(|| json!({ "role": "user", "parts": parts }))
            }
            Role::Assistant => {
                let mut parts = Vec::new();
                for text in message_text_parts(message) {
                    parts.push(json!({ "text": text }));
                }
                if let Some(tool_calls) = &message.tool_calls {
                    for call in tool_calls {
                        parts.push(json!({
                            "functionCall": {
                                "name": call.function.name,
                                "args": arguments_to_value(&call.function.arguments),
                            }
                        }));
                    }
                }
                (!parts.is_empty()).then(|| json!({ "role": "model", "parts": parts }))
            }
            Role::Tool => {
                let name = message.name.clone().unwrap_or_default();
                Some(json!({
                    "role": "function",
                    "parts": [{
                        "functionResponse": {
                            "name": name,
                            "response": { "content": message.text() },
                        }
                    }]
                }))
            }
        }
    }

    fn tools_to_wire(request: &ChatRequest) -> Option<Value> {
        let tools = request.tools.as_ref()?;
        if tools.is_empty() {
            return None;
        }
        let declarations: Vec<Value> = tools
            .iter()
            .map(|tool| {
                let mut out = Map::new();
                out.insert(
                    "name".to_string(),
                    Value::String(tool.function.name.clone()),
                );
                if let Some(description) = &tool.function.description {
                    out.insert(
                        "description".to_string(),
                        Value::String(description.clone()),
                    );
                }
                out.insert("parameters".to_string(), tool.function.parameters.clone());
                Value::Object(out)
            })
            .collect();
        Some(json!([{ "functionDeclarations": declarations }]))
    }

    fn finish_reason(raw: Option<&str>) -> FinishReason {
        match raw {
            Some("MAX_TOKENS") => FinishReason::Length,
            Some("SAFETY") => FinishReason::ContentFilter,
            _ => FinishReason::Stop,
        }
    }
}

impl ProviderAdapter for VertexAdapter {
    fn name(&self) -> &'static str {
        "vertex"
    }

    fn signing(&self) -> Signing {
        Signing::Bearer {
            token: self.access_token.clone(),
        }
    }

    fn build_request(
        &self,
        request: &ChatRequest,
        target: &UpstreamTarget,
    ) -> Result<ProviderRequest> {
        let (system, rest) = extract_system(&request.messages);

        let contents: Vec<Value> = rest
            .iter()
            .filter_map(|m| Self::message_to_content(m))
            .collect();

        let mut generation = Map::new();
        if let Some(max_tokens) = request.max_tokens.filter(|v| *v > 0) {
            generation.insert("maxOutputTokens".to_string(), Value::from(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            let clamped = clamp_temperature(self.name(), temperature, 0.0, 2.0);
            generation.insert("temperature".to_string(), json_number(clamped));
        }
        if let Some(top_p) = request.top_p {
            generation.insert("topP".to_string(), json_number(top_p));
        }
        if let Some(stop) = &request.stop {
            if !stop.is_empty() {
                generation.insert("stopSequences".to_string(), json!(stop));
            }
        }

        let mut body = Map::new();
        body.insert("contents".to_string(), Value::Array(contents));
        if !system.is_empty() {
            body.insert(
                "systemInstruction".to_string(),
                json!({ "parts": [{ "text": system }] }),
            );
        }
        if !generation.is_empty() {
            body.insert("generationConfig".to_string(), Value::Object(generation));
        }
        if let Some(tools) = Self::tools_to_wire(request) {
            body.insert("tools".to_string(), tools);
        }

        let body = serde_json::to_vec(&Value::Object(body))
            .map_err(|err| GatewayError::Internal(format!("encode request: {err}")))?;
        let location = self.location_for(target);
        Ok(ProviderRequest::post_json(
            format!(
                "/v1/projects/{}/locations/{}/publishers/google/models/{}:generateContent",
                self.project_id, location, target.model
            ),
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
            GatewayError::Internal(format!("vertex response decode error: {err}"))
        })?;

        let mut text = String::new();
        let mut tool_calls = Vec::<ToolCall>::new();
        if let Some(parts) = value
            .pointer("/candidates/0/content/parts")
            .and_then(Value::as_array)
        {
            for part in parts {
                if let Some(chunk) = part.get("text").and_then(Value::as_str) {
                    text.push_str(chunk);
                }
                if let Some(call) = part.get("functionCall") {
                    let name = call
                        .get("name")
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string();
                    tool_calls.push(ToolCall {
                        id: synthesize_response_id("call_"),
                        kind: "function".to_string(),
                        function: FunctionCall {
                            arguments: value_to_arguments(
                                call.get("args").unwrap_or(&Value::Null),
                            ),
                            name,
                        },
                    });
                }
            }
        }

        let finish_reason = if tool_calls.is_empty() {
            Self::finish_reason(
                value
                    .pointer("/candidates/0/finishReason")
                    .and_then(Value::as_str),
            )
        } else {
            FinishReason::ToolCalls
        };
        let usage = Usage::new(
            value
                .pointer("/usageMetadata/promptTokenCount")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            value
                .pointer("/usageMetadata/candidatesTokenCount")
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
        ProviderRequest::get(
            format!(
                "/v1/projects/{}/locations/{}/publishers/google/models",
                self.project_id, self.location
            ),
            self.signing(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> VertexAdapter {
        let secrets = ProviderSecrets {
            vertex_project_id: Some("proj-1".to_string()),
            vertex_location: Some("us-central1".to_string()),
            vertex_access_token: Some("ya29.token".to_string()),
            ..Default::default()
        };
        VertexAdapter::new(&ProviderConfig::default(), &secrets)
    }

    fn target() -> UpstreamTarget {
        UpstreamTarget {
            model: "gemini-1.5-pro".to_string(),
            info: None,
            config: ProviderConfig::default(),
        }
    }

    #[test]
    fn assistant_role_is_dispatched_as_model() {
        let request = ChatRequest {
            model: "gemini-pro".to_string(),
            messages: vec![
                ChatMessage::user("hi"),
                ChatMessage::assistant("hello"),
                ChatMessage::user("continue"),
            ],
            max_tokens: Some(100),
            temperature: None,
            top_p: None,
            stop: None,
            tools: None,
            tool_choice: None,
            response_format: None,
            stream: false,
        };
        let built = adapter().build_request(&request, &target()).unwrap();
        assert_eq!(
            built.path,
            "/v1/projects/proj-1/locations/us-central1/publishers/google/models/gemini-1.5-pro:generateContent"
        );
        let body: Value = serde_json::from_slice(&built.body).unwrap();
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(body["generationConfig"]["maxOutputTokens"], 100);
    }

    #[test]
    fn tool_message_becomes_function_role() {
        let request = ChatRequest {
            model: "gemini-pro".to_string(),
            messages: vec![
                ChatMessage::user("weather?"),
                ChatMessage {
                    role: Role::Tool,
                    content: Some(MessageContent::Text("72F".to_string())),
                    name: Some("get_weather".to_string()),
                    tool_calls: None,
                    tool_call_id: Some("call_1".to_string()),
                },
            ],
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            tools: None,
            tool_choice: None,
            response_format: None,
            stream: false,
        };
        let built = adapter().build_request(&request, &target()).unwrap();
        let body: Value = serde_json::from_slice(&built.body).unwrap();
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents[1]["role"], "function");
        assert_eq!(
            contents[1]["parts"][0]["functionResponse"]["name"],
            "get_weather"
        );
    }

    #[test]
    fn model_role_maps_back_to_assistant() {
        let request = ChatRequest {
            model: "gemini-pro".to_string(),
            messages: vec![ChatMessage::user("hi")],
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            tools: None,
            tool_choice: None,
            response_format: None,
            stream: false,
        };
        let upstream = json!({
            "candidates": [{
                "content": { "role": "model", "parts": [{ "text": "hello" }] },
                "finishReason": "STOP"
            }],
            "usageMetadata": { "promptTokenCount": 4, "candidatesTokenCount": 2 }
        });
        let response = adapter()
            .parse_response(&request, 200, upstream.to_string().as_bytes())
            .unwrap();
        assert_eq!(response.choices[0].message.role, Role::Assistant);
        assert_eq!(response.choices[0].finish_reason, FinishReason::Stop);
        assert_eq!(response.usage.total_tokens, 6);
    }

    #[test]
    fn safety_maps_to_content_filter() {
        assert_eq!(
            VertexAdapter::finish_reason(Some("SAFETY")),
            FinishReason::ContentFilter
        );
        assert_eq!(
            VertexAdapter::finish_reason(Some("MAX_TOKENS")),
            FinishReason::Length
        );
    }
}
