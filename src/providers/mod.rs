//! Per-backend protocol adapters. Each adapter is a stateless translator
//! between the canonical chat schema and one upstream wire protocol; the
//! set is closed and dispatched by provider name.

pub mod anthropic;
pub mod azure;
pub mod bedrock;
pub mod openai;
pub mod oracle;
pub mod vertex;
pub mod watsonx;

use std::collections::BTreeMap;
use std::sync::Arc;

use indexmap::IndexMap;
use rand::RngCore;
use serde_json::Value;

use crate::config::{ModelInfo, ProviderConfig, ProviderSecrets, RoutingFile};
use crate::types::{ChatMessage, ChatRequest, ChatResponse, MessageContent, Role};
use crate::{GatewayError, Result};

pub use anthropic::AnthropicAdapter;
pub use azure::AzureAdapter;
pub use bedrock::BedrockAdapter;
pub use openai::OpenAiAdapter;
pub use oracle::OracleAdapter;
pub use vertex::VertexAdapter;
pub use watsonx::WatsonxAdapter;

/// How the transport must authenticate an outgoing request.
#[derive(Clone)]
pub enum Signing {
    SigV4 { region: String, service: String },
    Bearer { token: String },
    ApiKey { header: String, token: String },
    None,
}

impl std::fmt::Debug for Signing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Signing::SigV4 { region, service } => f
                .debug_struct("SigV4")
                .field("region", region)
                .field("service", service)
                .finish(),
            Signing::Bearer { .. } => f.debug_struct("Bearer").finish_non_exhaustive(),
            Signing::ApiKey { header, .. } => f
                .debug_struct("ApiKey")
                .field("header", header)
                .finish_non_exhaustive(),
            Signing::None => write!(f, "None"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderRequest {
    pub method: String,
    /// Relative to the provider's base URL, leading slash included.
    pub path: String,
    pub query: Vec<(String, String)>,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub signing: Signing,
}

impl ProviderRequest {
    pub fn post_json(path: impl Into<String>, body: Vec<u8>, signing: Signing) -> Self {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "application/json".to_string());
        Self {
            method: "POST".to_string(),
            path: path.into(),
            query: Vec::new(),
            headers,
            body,
            signing,
        }
    }

    pub fn get(path: impl Into<String>, signing: Signing) -> Self {
        Self {
            method: "GET".to_string(),
            path: path.into(),
            query: Vec::new(),
            headers: BTreeMap::new(),
            body: Vec::new(),
            signing,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ProviderResponse {
    pub status: u16,
    pub body: bytes::Bytes,
}

/// Per-request routing outcome handed to the adapter: the upstream model
/// id plus the mapping and provider configuration it came from.
#[derive(Debug, Clone)]
pub struct UpstreamTarget {
    pub model: String,
    pub info: Option<ModelInfo>,
    pub config: ProviderConfig,
}

pub trait ProviderAdapter: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports_tools(&self) -> bool {
        true
    }

    /// The signing directive for requests that bypass translation (native
    /// passthrough and health probes).
    fn signing(&self) -> Signing;

    fn build_request(&self, request: &ChatRequest, target: &UpstreamTarget)
        -> Result<ProviderRequest>;

    fn parse_response(
        &self,
        request: &ChatRequest,
        status: u16,
        body: &[u8],
    ) -> Result<ChatResponse>;

    /// Cheap liveness probe, typically a list-models call.
    fn probe_request(&self) -> ProviderRequest;
}

/// Builds the adapter for every enabled provider the configuration names.
pub fn build_adapters(
    file: &RoutingFile,
    secrets: &ProviderSecrets,
) -> IndexMap<String, Arc<dyn ProviderAdapter>> {
    let mut out: IndexMap<String, Arc<dyn ProviderAdapter>> = IndexMap::new();
    for (name, config) in file.enabled_providers() {
        let adapter: Option<Arc<dyn ProviderAdapter>> = match name.as_str() {
            "bedrock" => Some(Arc::new(BedrockAdapter::new(config, secrets))),
            "azure" => Some(Arc::new(AzureAdapter::new(config, secrets))),
            "openai" => Some(Arc::new(OpenAiAdapter::new(config, secrets))),
            "anthropic" => Some(Arc::new(AnthropicAdapter::new(config, secrets))),
            "vertex" => Some(Arc::new(VertexAdapter::new(config, secrets))),
            "watsonx" => Some(Arc::new(WatsonxAdapter::new(config, secrets))),
            "oracle" => Some(Arc::new(OracleAdapter::new(config, secrets))),
            other => {
                tracing::warn!(provider = other, "unknown provider in configuration; skipping");
                None
            }
        };
        if let Some(adapter) = adapter {
            out.insert(name.clone(), adapter);
        }
    }
    out
}

/// Removes system messages and joins their text (newline-separated) into a
/// single block carried alongside the remaining messages.
pub fn extract_system(messages: &[ChatMessage]) -> (String, Vec<&ChatMessage>) {
    let mut system = String::new();
    let mut rest = Vec::new();
    for message in messages {
        if message.role == Role::System {
            let text = message.text();
            if !text.is_empty() {
                if !system.is_empty() {
                    system.push('\n');
                }
                system.push_str(&text);
            }
        } else {
            rest.push(message);
        }
    }
    (system, rest)
}

/// Flattens a conversation into a single prompt string with a trailing
/// assistant cue, for completion-style backends.
pub fn flatten_prompt(messages: &[ChatMessage]) -> String {
    let mut out = String::new();
    for message in messages {
        out.push_str(&message.role.as_str().to_ascii_uppercase());
        out.push_str(": ");
        out.push_str(&message.text());
        out.push('\n');
    }
    out.push_str("ASSISTANT: ");
    out
}

/// Clamps temperature into the backend's accepted range, logging when the
/// caller's value had to move.
pub fn clamp_temperature(provider: &str, value: f64, min: f64, max: f64) -> f64 {
    let clamped = value.clamp(min, max);
    if (clamped - value).abs() > f64::EPSILON {
        tracing::warn!(
            provider,
            requested = value,
            clamped,
            "temperature outside accepted range; clamped"
        );
    }
    clamped
}

pub const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Backends that require an output cap get 4096 when the caller sent none
/// (or zero).
pub fn max_tokens_or_default(request: &ChatRequest) -> u32 {
    match request.max_tokens {
        Some(value) if value > 0 => value,
        _ => DEFAULT_MAX_TOKENS,
    }
}

/// Tool-call arguments are always carried as a JSON-encoded string on the
/// canonical side; upstream payloads frequently want the parsed object.
pub fn arguments_to_value(arguments: &str) -> Value {
    serde_json::from_str(arguments).unwrap_or_else(|_| Value::String(arguments.to_string()))
}

pub fn value_to_arguments(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Normalized view of one message's text, regardless of wire content form.
pub fn message_text_parts(message: &ChatMessage) -> Vec<String> {
    match &message.content {
        None => Vec::new(),
        Some(MessageContent::Text(text)) => {
            if text.is_empty() {
                Vec::new()
            } else {
                vec![text.clone()]
            }
        }
        Some(MessageContent::Parts(parts)) => parts
            .iter()
            .filter_map(|part| match part {
                crate::types::ContentPart::Text { text } if !text.is_empty() => {
                    Some(text.clone())
                }
                _ => None,
            })
            .collect(),
    }
}

pub fn synthesize_response_id(prefix: &str) -> String {
    let mut bytes = [0u8; 12];
    rand::thread_rng().fill_bytes(&mut bytes);
    let mut hex = String::with_capacity(24);
    for byte in bytes {
        hex.push_str(&format!("{byte:02x}"));
    }
    format!("{prefix}{hex}")
}

/// Upstream error body to provider fault, with the upstream's own message
/// extracted when the body is a recognizable error envelope.
pub fn upstream_error(provider: &str, status: u16, body: &[u8]) -> GatewayError {
    let text = String::from_utf8_lossy(body);
    let message = serde_json::from_str::<Value>(&text)
        .ok()
        .and_then(|value| {
            value
                .pointer("/error/message")
                .or_else(|| value.pointer("/message"))
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_else(|| text.trim().to_string());
    GatewayError::Upstream {
        provider: provider.to_string(),
        status,
        body: message,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChatMessage;

    #[test]
    fn extract_system_joins_blocks_and_keeps_order() {
        let messages = vec![
            ChatMessage::system("first"),
            ChatMessage::user("hi"),
            ChatMessage::system("second"),
            ChatMessage::assistant("hello"),
        ];
        let (system, rest) = extract_system(&messages);
        assert_eq!(system, "first\nsecond");
        assert_eq!(rest.len(), 2);
        assert_eq!(rest[0].role, Role::User);
        assert_eq!(rest[1].role, Role::Assistant);
    }

    #[test]
    fn flatten_prompt_appends_assistant_cue() {
        let messages = vec![
            ChatMessage::system("be brief"),
            ChatMessage::user("hello"),
        ];
        let prompt = flatten_prompt(&messages);
        assert_eq!(prompt, "SYSTEM: be brief\nUSER: hello\nASSISTANT: ");
    }

    #[test]
    fn clamp_temperature_hits_boundaries() {
        assert_eq!(clamp_temperature("openai", 3.5, 0.0, 2.0), 2.0);
        assert_eq!(clamp_temperature("openai", -1.0, 0.0, 2.0), 0.0);
        assert_eq!(clamp_temperature("openai", 0.7, 0.0, 2.0), 0.7);
    }

    #[test]
    fn max_tokens_defaults_when_zero_or_absent() {
        let mut request = ChatRequest {
            model: "m".to_string(),
            messages: vec![ChatMessage::user("x")],
            max_tokens: None,
            temperature: None,
            top_p: None,
            stop: None,
            tools: None,
            tool_choice: None,
            response_format: None,
            stream: false,
        };
        assert_eq!(max_tokens_or_default(&request), DEFAULT_MAX_TOKENS);
        request.max_tokens = Some(0);
        assert_eq!(max_tokens_or_default(&request), DEFAULT_MAX_TOKENS);
        request.max_tokens = Some(50);
        assert_eq!(max_tokens_or_default(&request), 50);
    }

    #[test]
    fn upstream_error_prefers_envelope_message() {
        let body = br#"{"error":{"message":"model overloaded","type":"server_error"}}"#;
        let err = upstream_error("openai", 503, body);
        match err {
            GatewayError::Upstream { status, body, .. } => {
                assert_eq!(status, 503);
                assert_eq!(body, "model overloaded");
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }
}
