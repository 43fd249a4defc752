//! IBM watsonx text generation. The conversation is flattened into a
//! single prompt with an assistant cue; tool calling is not supported.

use serde_json::{json, Map, Value};

use super::openai::json_number;
use super::{
    clamp_temperature, flatten_prompt, synthesize_response_id, upstream_error, ProviderAdapter,
    ProviderRequest, Signing, UpstreamTarget,
};
use crate::config::{ProviderConfig, ProviderSecrets};
use crate::types::{ChatMessage, ChatRequest, ChatResponse, FinishReason, Usage};
use crate::{GatewayError, Result};

const DEFAULT_API_VERSION: &str = "2024-05-31";

pub struct WatsonxAdapter {
    api_key: String,
    project_id: String,
    api_version: String,
}

impl WatsonxAdapter {
    pub fn new(config: &ProviderConfig, secrets: &ProviderSecrets) -> Self {
        Self {
            api_key: secrets.watsonx_api_key.clone().unwrap_or_default(),
            project_id: config
                .project_id
                .clone()
                .or_else(|| secrets.watsonx_project_id.clone())
                .unwrap_or_default(),
            api_version: config
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
        }
    }

    fn finish_reason(raw: Option<&str>) -> FinishReason {
        match raw {
            Some("max_tokens") | Some("token_limit") => FinishReason::Length,
            _ => FinishReason::Stop,
        }
    }
}

impl ProviderAdapter for WatsonxAdapter {
    fn name(&self) -> &'static str {
        "watsonx"
    }

    fn supports_tools(&self) -> bool {
        false
    }

    fn signing(&self) -> Signing {
        Signing::Bearer {
            token: self.api_key.clone(),
        }
    }

    fn build_request(
        &self,
        request: &ChatRequest,
        target: &UpstreamTarget,
    ) -> Result<ProviderRequest> {
        if request.has_tools() {
            return Err(GatewayError::ToolsUnsupported {
                provider: self.name().to_string(),
            });
        }

        let mut parameters = Map::new();
        if let Some(max_tokens) = request.max_tokens.filter(|v| *v > 0) {
            parameters.insert("max_new_tokens".to_string(), Value::from(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            let clamped = clamp_temperature(self.name(), temperature, 0.0, 2.0);
            parameters.insert("temperature".to_string(), json_number(clamped));
        }
        if let Some(top_p) = request.top_p {
            parameters.insert("top_p".to_string(), json_number(top_p));
        }
        if let Some(stop) = &request.stop {
            if !stop.is_empty() {
                parameters.insert("stop_sequences".to_string(), json!(stop));
            }
        }

        let mut body = Map::new();
        body.insert("model_id".to_string(), Value::String(target.model.clone()));
        body.insert(
            "input".to_string(),
            Value::String(flatten_prompt(&request.messages)),
        );
        body.insert(
            "project_id".to_string(),
            Value::String(self.project_id.clone()),
        );
        if !parameters.is_empty() {
            body.insert("parameters".to_string(), Value::Object(parameters));
        }

        let body = serde_json::to_vec(&Value::Object(body))
            .map_err(|err| GatewayError::Internal(format!("encode request: {err}")))?;
        let mut out = ProviderRequest::post_json("/ml/v1/text/generation", body, self.signing());
        out.query
            .push(("version".to_string(), self.api_version.clone()));
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
            GatewayError::Internal(format!("watsonx response decode error: {err}"))
        })?;

        let text = value
            .pointer("/results/0/generated_text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let finish_reason = Self::finish_reason(
            value
                .pointer("/results/0/stop_reason")
                .and_then(Value::as_str),
        );
        let usage = Usage::new(
            value
                .pointer("/results/0/input_token_count")
                .and_then(Value::as_u64)
                .unwrap_or(0),
            value
                .pointer("/results/0/generated_token_count")
                .and_then(Value::as_u64)
                .unwrap_or(0),
        );

        Ok(ChatResponse::assistant(
            synthesize_response_id("chatcmpl-"),
            request.model.clone(),
            ChatMessage::assistant(text),
            finish_reason,
            usage,
        ))
    }

    fn probe_request(&self) -> ProviderRequest {
        let mut out = ProviderRequest::get("/ml/v1/foundation_model_specs", self.signing());
        out.query
            .push(("version".to_string(), self.api_version.clone()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{FunctionDef, ToolDef};
    use serde_json::json;

    fn adapter() -> WatsonxAdapter {
        let secrets = ProviderSecrets {
            watsonx_api_key: Some("ibm-key".to_string()),
            watsonx_project_id: Some("proj-9".to_string()),
            ..Default::default()
        };
        WatsonxAdapter::new(&ProviderConfig::default(), &secrets)
    }

    fn target() -> UpstreamTarget {
        UpstreamTarget {
            model: "ibm/granite-13b-chat-v2".to_string(),
            info: None,
            config: ProviderConfig::default(),
        }
    }

    #[test]
    fn conversation_is_flattened_into_prompt() {
        let request = ChatRequest {
            model: "granite-chat".to_string(),
            messages: vec![ChatMessage::system("be brief"), ChatMessage::user("hello")],
            max_tokens: Some(64),
            temperature: None,
            top_p: None,
            stop: None,
            tools: None,
            tool_choice: None,
            response_format: None,
            stream: false,
        };
        let built = adapter().build_request(&request, &target()).unwrap();
        assert_eq!(built.path, "/ml/v1/text/generation");
        assert_eq!(built.query[0].0, "version");

        let body: Value = serde_json::from_slice(&built.body).unwrap();
        assert_eq!(body["model_id"], "ibm/granite-13b-chat-v2");
        assert_eq!(body["project_id"], "proj-9");
        assert_eq!(body["input"], "SYSTEM: be brief\nUSER: hello\nASSISTANT: ");
        assert_eq!(body["parameters"]["max_new_tokens"], 64);
    }

    #[test]
    fn tools_fail_before_dispatch() {
        let request = ChatRequest {
            model: "granite-chat".to_string(),
            messages: vec![ChatMessage::user("x")],
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            tools: Some(vec![ToolDef {
                kind: "function".to_string(),
                function: FunctionDef {
                    name: "f".to_string(),
                    description: None,
                    parameters: json!({}),
                },
            }]),
            tool_choice: None,
            response_format: None,
            stream: false,
        };
        let err = adapter().build_request(&request, &target()).unwrap_err();
        assert!(matches!(err, GatewayError::ToolsUnsupported { .. }));
    }

    #[test]
    fn generated_text_becomes_assistant_content() {
        let request = ChatRequest {
            model: "granite-chat".to_string(),
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
            "results": [{
                "generated_text": "Hello there.",
                "stop_reason": "eos_token",
                "input_token_count": 5,
                "generated_token_count": 3
            }]
        });
        let response = adapter()
            .parse_response(&request, 200, upstream.to_string().as_bytes())
            .unwrap();
        assert_eq!(response.choices[0].message.text(), "Hello there.");
        assert_eq!(response.choices[0].finish_reason, FinishReason::Stop);
        assert_eq!(response.usage.total_tokens, 8);
    }
}
