//! OpenAI chat completions: the canonical schema is this wire format, so
//! translation is a near-identity copy.

use serde_json::{Map, Value};

use super::{
    clamp_temperature, upstream_error, ProviderAdapter, ProviderRequest, Signing, UpstreamTarget,
};
use crate::config::{ProviderConfig, ProviderSecrets};
use crate::types::{ChatRequest, ChatResponse};
use crate::{GatewayError, Result};

pub struct OpenAiAdapter {
    api_key: String,
}

impl OpenAiAdapter {
    pub fn new(_config: &ProviderConfig, secrets: &ProviderSecrets) -> Self {
        Self {
            api_key: secrets.openai_api_key.clone().unwrap_or_default(),
        }
    }

    fn request_body(&self, request: &ChatRequest, upstream_model: &str) -> Result<Vec<u8>> {
        let mut body = match serde_json::to_value(request) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(err) => return Err(GatewayError::Internal(format!("serialize request: {err}"))),
        };
        body.insert(
            "model".to_string(),
            Value::String(upstream_model.to_string()),
        );
        body.remove("stream");
        if let Some(temperature) = request.temperature {
            let clamped = clamp_temperature(self.name(), temperature, 0.0, 2.0);
            body.insert("temperature".to_string(), json_number(clamped));
        }
        serde_json::to_vec(&Value::Object(body))
            .map_err(|err| GatewayError::Internal(format!("encode request: {err}")))
    }
}

pub(super) fn json_number(value: f64) -> Value {
    serde_json::Number::from_f64(value)
        .map(Value::Number)
        .unwrap_or(Value::Null)
}

impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        "openai"
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
        let body = self.request_body(request, &target.model)?;
        Ok(ProviderRequest::post_json(
            "/v1/chat/completions",
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
        let mut response: ChatResponse = serde_json::from_slice(body).map_err(|err| {
            GatewayError::Internal(format!("openai response decode error: {err}"))
        })?;
        response.model = request.model.clone();
        Ok(response)
    }

    fn probe_request(&self) -> ProviderRequest {
        ProviderRequest::get("/v1/models", self.signing())
    }
}
