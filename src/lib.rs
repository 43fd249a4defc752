//! modelgate: a multi-provider AI inference gateway. One OpenAI-shaped
//! chat-completions wire format in front of AWS Bedrock, Azure OpenAI,
//! OpenAI, Anthropic, Google Vertex, IBM watsonx and Oracle Generative AI,
//! with gateway-terminated credential, TOTP and session authentication.

pub mod auth;
pub mod config;
mod error;
pub mod gateway;
pub mod providers;
pub mod router;
pub mod transport;
pub mod types;

pub use error::{GatewayError, Result, MAX_UPSTREAM_ERROR_BYTES};

pub use auth::{Authenticator, CredentialStore, Principal, Session};
pub use config::{ProviderSecrets, RoutingFile};
pub use gateway::http::AppState;
pub use gateway::{Gateway, HealthGate, RequestContext};
pub use router::Router;
pub use transport::{Transport, Upstream};
pub use types::{
    ChatMessage, ChatRequest, ChatResponse, Choice, ContentPart, FinishReason, MessageContent,
    Role, ToolCall, ToolDef, Usage,
};
