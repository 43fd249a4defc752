//! Oracle Generative AI chat. Roles go uppercase on the wire and the
//! compartment id travels in the body; tool calling is not supported.

use serde_json::{json, Map, Value};

use super::openai::json_number;
use super::{
    clamp_temperature, synthesize_response_id, upstream_error, ProviderAdapter, ProviderRequest,
    Signing, UpstreamTarget,
};
use crate::config::{ProviderConfig, ProviderSecrets};
use crate::types::{ChatMessage, ChatRequest, ChatResponse, FinishReason, Role, Usage};
use crate::{GatewayError, Result};

pub struct OracleAdapter {
    compartment_id: String,
    auth_token: String,
}

impl OracleAdapter {
    pub fn new(_config: &ProviderConfig, secrets: &ProviderSecrets) -> Self {
        Self {
            compartment_id: secrets.oracle_compartment_id.clone().unwrap_or_default(),
            auth_token: secrets.oracle_auth_token.clone().unwrap_or_default(),
        }
    }

    fn wire_role(role: Role) -> &'static str {
        match role {
            Role::System => "SYSTEM",
            Role::User => "USER",
            Role::Assistant => "ASSISTANT",
            Role::Tool => "USER",
        }
    }
}

impl ProviderAdapter for OracleAdapter {
    fn name(&self) -> &'static str {
        "oracle"
    }

    fn supports_tools(&self) -> bool {
        false
    }

    fn signing(&self) -> Signing {
        Signing::Bearer {
            token: self.auth_token.clone(),
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

        let messages: Vec<Value> = request
            .messages
            .iter()
            .map(|message| {
                json!({
                    "role": Self::wire_role(message.role),
                    "content": [{ "type": "TEXT", "text": message.text() }],
                })
            })
            .collect();

        let mut chat_request = Map::new();
        chat_request.insert("apiFormat".to_string(), Value::String("GENERIC".to_string()));
        chat_request.insert("messages".to_string(), Value::Array(messages));
        if let Some(max_tokens) = request.max_tokens.filter(|v| *v > 0) {
            chat_request.insert("maxTokens".to_string(), Value::from(max_tokens));
        }
        if let Some(temperature) = request.temperature {
            let clamped = clamp_temperature(self.name(), temperature, 0.0, 1.0);
            chat_request.insert("temperature".to_string(), json_number(clamped));
        }
        if let Some(top_p) = request.top_p {
            chat_request.insert("topP".to_string(), json_number(top_p));
        }

        let body = json!({
            "compartmentId": self.compartment_id,
            "servingMode": {
                "servingType": "ON_DEMAND",
                "modelId": target.model,
            },
            "chatRequest": Value::Object(chat_request),
        });
        let body = serde_json::to_vec(&body)
            .map_err(|err| GatewayError::Internal(format!("encode request: {err}")))?;
        Ok(ProviderRequest::post_json(
            "/20231130/actions/chat",
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
            GatewayError::Internal(format!("oracle response decode error: {err}"))
        })?;

        let text = value
            .pointer("/chatResponse/text")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let finish_reason = match value
            .pointer("/chatResponse/finishReason")
            .and_then(Value::as_str)
        {
            Some("LENGTH") | Some("MAX_TOKENS") => FinishReason::Length,
            _ => FinishReason::Stop,
        };

        Ok(ChatResponse::assistant(
            synthesize_response_id("chatcmpl-"),
            request.model.clone(),
            ChatMessage::assistant(text),
            finish_reason,
            Usage::default(),
        ))
    }

    fn probe_request(&self) -> ProviderRequest {
        let mut out = ProviderRequest::get("/20231130/models", self.signing());
        out.query
            .push(("compartmentId".to_string(), self.compartment_id.clone()));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn adapter() -> OracleAdapter {
        let secrets = ProviderSecrets {
            oracle_compartment_id: Some("ocid1.compartment.oc1..x".to_string()),
            oracle_auth_token: Some("oci-token".to_string()),
            ..Default::default()
        };
        OracleAdapter::new(&ProviderConfig::default(), &secrets)
    }

    fn target() -> UpstreamTarget {
        UpstreamTarget {
            model: "cohere.command-r-plus".to_string(),
            info: None,
            config: ProviderConfig::default(),
        }
    }

    #[test]
    fn roles_are_uppercased_and_compartment_travels_in_body() {
        let request = ChatRequest {
            model: "command-r".to_string(),
            messages: vec![
                ChatMessage::system("be brief"),
                ChatMessage::user("hello"),
            ],
            max_tokens: Some(20),
            temperature: None,
            top_p: None,
            stop: None,
            tools: None,
            tool_choice: None,
            response_format: None,
            stream: false,
        };
        let built = adapter().build_request(&request, &target()).unwrap();
        assert_eq!(built.path, "/20231130/actions/chat");

        let body: Value = serde_json::from_slice(&built.body).unwrap();
        assert_eq!(body["compartmentId"], "ocid1.compartment.oc1..x");
        assert_eq!(body["servingMode"]["modelId"], "cohere.command-r-plus");
        let messages = body["chatRequest"]["messages"].as_array().unwrap();
        assert_eq!(messages[0]["role"], "SYSTEM");
        assert_eq!(messages[1]["role"], "USER");
        assert_eq!(body["chatRequest"]["maxTokens"], 20);
    }

    #[test]
    fn tools_are_rejected() {
        let request = ChatRequest {
            model: "command-r".to_string(),
            messages: vec![ChatMessage::user("x")],
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            tools: Some(vec![crate::types::ToolDef {
                kind: "function".to_string(),
                function: crate::types::FunctionDef {
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
    fn chat_response_text_is_parsed() {
        let request = ChatRequest {
            model: "command-r".to_string(),
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
        let upstream = json!({ "chatResponse": { "text": "Hello.", "finishReason": "COMPLETE" } });
        let response = adapter()
            .parse_response(&request, 200, upstream.to_string().as_bytes())
            .unwrap();
        assert_eq!(response.choices[0].message.text(), "Hello.");
        assert_eq!(response.choices[0].finish_reason, FinishReason::Stop);
    }
}
