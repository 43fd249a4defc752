//! Azure OpenAI: the OpenAI wire shape addressed by deployment name, with
//! an `api-key` header and an `api-version` query parameter.

use serde_json::{Map, Value};

use super::openai::json_number;
use super::{
    clamp_temperature, upstream_error, ProviderAdapter, ProviderRequest, Signing, UpstreamTarget,
};
use crate::config::{ProviderConfig, ProviderSecrets};
use crate::types::{ChatRequest, ChatResponse};
use crate::{GatewayError, Result};

const DEFAULT_API_VERSION: &str = "2024-02-01";

pub struct AzureAdapter {
    api_key: String,
    api_version: String,
}

impl AzureAdapter {
    pub fn new(config: &ProviderConfig, secrets: &ProviderSecrets) -> Self {
        Self {
            api_key: secrets.azure_api_key.clone().unwrap_or_default(),
            api_version: config
                .api_version
                .clone()
                .unwrap_or_else(|| DEFAULT_API_VERSION.to_string()),
        }
    }

    fn deployment(target: &UpstreamTarget) -> String {
        target
            .info
            .as_ref()
            .and_then(|info| info.deployment.clone())
            .filter(|d| !d.is_empty())
            .unwrap_or_else(|| target.model.clone())
    }

    fn api_version(&self, target: &UpstreamTarget) -> String {
        target
            .info
            .as_ref()
            .and_then(|info| info.api_version.clone())
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| self.api_version.clone())
    }
}

impl ProviderAdapter for AzureAdapter {
    fn name(&self) -> &'static str {
        "azure"
    }

    fn signing(&self) -> Signing {
        Signing::ApiKey {
            header: "api-key".to_string(),
            token: self.api_key.clone(),
        }
    }

    fn build_request(
        &self,
        request: &ChatRequest,
        target: &UpstreamTarget,
    ) -> Result<ProviderRequest> {
        let mut body = match serde_json::to_value(request) {
            Ok(Value::Object(map)) => map,
            Ok(_) => Map::new(),
            Err(err) => return Err(GatewayError::Internal(format!("serialize request: {err}"))),
        };
        // The deployment in the path names the model; Azure ignores the
        // body field, so drop it rather than leak the canonical name.
        body.remove("model");
        body.remove("stream");
        if let Some(temperature) = request.temperature {
            let clamped = clamp_temperature(self.name(), temperature, 0.0, 2.0);
            body.insert("temperature".to_string(), json_number(clamped));
        }
        let body = serde_json::to_vec(&Value::Object(body))
            .map_err(|err| GatewayError::Internal(format!("encode request: {err}")))?;

        let deployment = Self::deployment(target);
        let mut out = ProviderRequest::post_json(
            format!("/openai/deployments/{deployment}/chat/completions"),
            body,
            self.signing(),
        );
        out.query
            .push(("api-version".to_string(), self.api_version(target)));
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
        let mut response: ChatResponse = serde_json::from_slice(body)
            .map_err(|err| GatewayError::Internal(format!("azure response decode error: {err}")))?;
        response.model = request.model.clone();
        Ok(response)
    }

    fn probe_request(&self) -> ProviderRequest {
        let mut out = ProviderRequest::get("/openai/deployments", self.signing());
        out.query
            .push(("api-version".to_string(), self.api_version.clone()));
        out
    }
}
