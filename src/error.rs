use axum::http::StatusCode;
use thiserror::Error;

/// Upstream error bodies are forwarded to clients only below this size.
pub const MAX_UPSTREAM_ERROR_BYTES: usize = 4 * 1024;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("conversation has no messages")]
    EmptyConversation,
    #[error("conversation must not end on an assistant message")]
    TrailingAssistant,
    #[error("provider {provider} does not support tool calling")]
    ToolsUnsupported { provider: String },
    #[error("streaming responses are not implemented")]
    StreamingNotImplemented,
    #[error("unknown model: {model}")]
    UnknownModel { model: String },
    #[error("missing credential")]
    MissingCredential,
    #[error("unknown credential")]
    UnknownCredential,
    #[error("credential expired")]
    CredentialExpired,
    #[error("invalid two-factor code")]
    InvalidTwoFactor,
    #[error("two-factor code required")]
    TwoFactorRequired,
    #[error("two-factor authentication is disabled")]
    TwoFactorDisabled,
    #[error("unknown session token")]
    UnknownSession,
    #[error("session token expired")]
    SessionExpired,
    #[error("rate limit exceeded: {limit}")]
    RateLimited { limit: String },
    #[error("{provider} returned {status}: {body}")]
    Upstream {
        provider: String,
        status: u16,
        body: String,
    },
    #[error("no provider available for {model}: {last}")]
    UpstreamUnavailable { model: String, last: String },
    #[error("{provider} timed out after {seconds}s")]
    TransportTimeout { provider: String, seconds: u64 },
    #[error("transport error ({provider}): {message}")]
    Transport { provider: String, message: String },
    #[error("aws credentials expired or missing")]
    ExpiredCredentials,
    #[error("storage error: {0}")]
    Storage(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Wire-level `error.type` value for the OpenAI-shaped error envelope.
    pub fn kind(&self) -> String {
        match self {
            Self::InvalidRequest(_) => "invalid_request".to_string(),
            Self::EmptyConversation => "empty_conversation".to_string(),
            Self::TrailingAssistant => "trailing_assistant".to_string(),
            Self::ToolsUnsupported { .. } => "tools_unsupported".to_string(),
            Self::StreamingNotImplemented => "streaming_not_implemented".to_string(),
            Self::UnknownModel { .. } => "unknown_model".to_string(),
            Self::MissingCredential => "missing_credential".to_string(),
            Self::UnknownCredential => "unknown_credential".to_string(),
            Self::CredentialExpired => "expired".to_string(),
            Self::InvalidTwoFactor => "invalid_twofactor".to_string(),
            Self::TwoFactorRequired => "twofactor_required".to_string(),
            Self::TwoFactorDisabled => "twofactor_disabled".to_string(),
            Self::UnknownSession => "unknown_session".to_string(),
            Self::SessionExpired => "session_expired".to_string(),
            Self::RateLimited { .. } => "rate_limited".to_string(),
            Self::Upstream { status, .. } => format!("upstream_4xx_{status}"),
            Self::UpstreamUnavailable { .. } => "upstream_unavailable".to_string(),
            Self::TransportTimeout { .. } => "transport_timeout".to_string(),
            Self::Transport { .. } => "upstream_unavailable".to_string(),
            Self::ExpiredCredentials => "expired_credentials".to_string(),
            Self::Storage(_) => "storage_fault".to_string(),
            Self::Config(_) | Self::Internal(_) => "internal_fault".to_string(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidRequest(_)
            | Self::EmptyConversation
            | Self::TrailingAssistant
            | Self::ToolsUnsupported { .. }
            | Self::StreamingNotImplemented => StatusCode::BAD_REQUEST,
            Self::UnknownModel { .. } => StatusCode::NOT_FOUND,
            Self::MissingCredential
            | Self::UnknownCredential
            | Self::CredentialExpired
            | Self::InvalidTwoFactor
            | Self::TwoFactorRequired
            | Self::TwoFactorDisabled
            | Self::UnknownSession
            | Self::SessionExpired => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::UpstreamUnavailable { .. } | Self::Transport { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::TransportTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,
            Self::ExpiredCredentials | Self::Storage(_) | Self::Config(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Auth and request-edge faults are terminal for the request; only
    /// transport-class faults may advance the provider traversal.
    pub fn is_terminal(&self) -> bool {
        !matches!(
            self,
            Self::Transport { .. }
                | Self::TransportTimeout { .. }
                | Self::ExpiredCredentials
                | Self::UpstreamUnavailable { .. }
        )
    }

    /// Client-facing message. Upstream bodies pass through verbatim only
    /// for 4xx, truncated to `MAX_UPSTREAM_ERROR_BYTES`.
    pub fn sanitized_message(&self) -> String {
        match self {
            Self::Upstream {
                provider,
                status,
                body,
            } => {
                if *status < 500 {
                    let body = truncate_utf8(body, MAX_UPSTREAM_ERROR_BYTES);
                    format!("{provider} returned {status}: {body}")
                } else {
                    format!("{provider} returned {status}")
                }
            }
            other => other.to_string(),
        }
    }
}

fn truncate_utf8(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }
    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

pub type Result<T> = std::result::Result<T, GatewayError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_kind_carries_status_code() {
        let err = GatewayError::Upstream {
            provider: "openai".to_string(),
            status: 422,
            body: "bad".to_string(),
        };
        assert_eq!(err.kind(), "upstream_4xx_422");
        assert_eq!(err.status(), StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[test]
    fn upstream_5xx_body_is_not_forwarded() {
        let err = GatewayError::Upstream {
            provider: "bedrock".to_string(),
            status: 503,
            body: "secret internals".to_string(),
        };
        assert!(!err.sanitized_message().contains("secret internals"));
    }

    #[test]
    fn upstream_4xx_body_is_truncated() {
        let err = GatewayError::Upstream {
            provider: "openai".to_string(),
            status: 400,
            body: "x".repeat(MAX_UPSTREAM_ERROR_BYTES * 2),
        };
        assert!(err.sanitized_message().len() < MAX_UPSTREAM_ERROR_BYTES + 64);
    }

    #[test]
    fn transport_faults_advance_traversal() {
        assert!(!GatewayError::TransportTimeout {
            provider: "bedrock".to_string(),
            seconds: 30,
        }
        .is_terminal());
        assert!(GatewayError::UnknownCredential.is_terminal());
        assert!(GatewayError::TrailingAssistant.is_terminal());
    }
}
