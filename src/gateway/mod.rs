//! Gateway core: authenticate, validate, route, then walk the candidate
//! providers sequentially until one answers.

pub mod health;
pub mod http;
pub mod limits;
pub mod metrics;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use indexmap::IndexMap;
use sha2::{Digest, Sha256};

use crate::providers::{ProviderAdapter, ProviderRequest, ProviderResponse, UpstreamTarget};
use crate::router::Router;
use crate::transport::{retryable_status, Upstream};
use crate::types::{now_epoch_seconds, ChatRequest, ChatResponse, ModelEntry, ModelsResponse};
use crate::{GatewayError, Result};

use limits::RateLimiter;
use metrics::Metrics;

pub use health::{HealthGate, ProviderHealth, DEFAULT_FAILURE_THRESHOLD, DEFAULT_PROBE_INTERVAL};

static REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

/// Request-scoped context: the resolved principal, the audit fingerprint,
/// and the caller's provider pin, alive for exactly one request.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub fingerprint: String,
    pub principal_id: i64,
    pub preferred_provider: Option<String>,
    pub ip_address: String,
    pub user_agent: String,
    pub path: String,
}

impl RequestContext {
    pub fn new(
        principal_id: i64,
        path: impl Into<String>,
        ip_address: impl Into<String>,
        user_agent: impl Into<String>,
    ) -> Self {
        let path = path.into();
        let request_id = generate_request_id();
        let fingerprint = fingerprint(&request_id, &path, principal_id);
        Self {
            request_id,
            fingerprint,
            principal_id,
            preferred_provider: None,
            ip_address: ip_address.into(),
            user_agent: user_agent.into(),
            path,
        }
    }

    pub fn with_preferred_provider(mut self, provider: Option<String>) -> Self {
        self.preferred_provider = provider.filter(|p| !p.trim().is_empty());
        self
    }
}

pub fn generate_request_id() -> String {
    let seq = REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("req-{:x}-{seq:x}", now_epoch_seconds())
}

/// Stable audit handle for one request; deliberately content-free.
fn fingerprint(request_id: &str, path: &str, principal_id: i64) -> String {
    let mut hasher = Sha256::new();
    hasher.update(request_id.as_bytes());
    hasher.update(b"|");
    hasher.update(path.as_bytes());
    hasher.update(b"|");
    hasher.update(principal_id.to_le_bytes());
    let digest = hasher.finalize();
    digest[..16].iter().map(|b| format!("{b:02x}")).collect()
}

pub struct Gateway {
    router: Router,
    adapters: IndexMap<String, Arc<dyn ProviderAdapter>>,
    upstream: Arc<dyn Upstream>,
    limiter: Mutex<RateLimiter>,
    metrics: Arc<Metrics>,
}

impl Gateway {
    pub fn new(
        router: Router,
        adapters: IndexMap<String, Arc<dyn ProviderAdapter>>,
        upstream: Arc<dyn Upstream>,
    ) -> Self {
        Self {
            router,
            adapters,
            upstream,
            limiter: Mutex::new(RateLimiter::new(None)),
            metrics: Arc::new(Metrics::default()),
        }
    }

    pub fn with_rate_limit(self, rpm: u32) -> Self {
        Self {
            limiter: Mutex::new(RateLimiter::new(Some(rpm))),
            ..self
        }
    }

    pub fn router(&self) -> &Router {
        &self.router
    }

    pub fn metrics(&self) -> Arc<Metrics> {
        self.metrics.clone()
    }

    /// The request loop of one chat completion. Traversal is strictly
    /// sequential; a pinned provider never falls back.
    pub async fn handle(
        &self,
        ctx: &RequestContext,
        request: &ChatRequest,
    ) -> Result<ChatResponse> {
        self.metrics.record_request();
        request.validate()?;
        self.check_rate_limit(ctx.principal_id)?;

        let candidates = self
            .router
            .resolve(&request.model, ctx.preferred_provider.as_deref())?;
        let pinned = ctx
            .preferred_provider
            .as_deref()
            .is_some_and(|p| candidates.len() == 1 && candidates[0] == p);
        let max_attempts = if pinned {
            1
        } else {
            self.router.max_attempts().min(candidates.len())
        };

        let mut last: Option<GatewayError> = None;
        for (position, provider) in candidates.iter().take(max_attempts).enumerate() {
            if position > 0 {
                self.metrics.record_fallback_advance();
                tracing::info!(
                    request_id = ctx.request_id.as_str(),
                    provider = provider.as_str(),
                    "advancing traversal to fallback provider"
                );
            }

            let Some(adapter) = self.adapters.get(provider) else {
                tracing::warn!(provider = provider.as_str(), "no adapter built for provider");
                continue;
            };

            if request.has_tools() && !adapter.supports_tools() {
                let err = GatewayError::ToolsUnsupported {
                    provider: provider.clone(),
                };
                if pinned {
                    return Err(err);
                }
                last = Some(err);
                continue;
            }

            let target = UpstreamTarget {
                model: self.router.upstream_model(provider, &request.model),
                info: self.router.model_info(provider, &request.model).cloned(),
                config: self
                    .router
                    .config()
                    .provider(provider)
                    .cloned()
                    .unwrap_or_default(),
            };

            let provider_request = match adapter.build_request(request, &target) {
                Ok(built) => built,
                Err(err) if pinned => return Err(err),
                Err(err) => {
                    last = Some(err);
                    continue;
                }
            };

            self.metrics.record_upstream_attempt();
            let response = match self.upstream.dispatch(provider, &provider_request).await {
                Ok(response) => response,
                Err(err) => {
                    self.metrics.record_upstream_failure();
                    tracing::warn!(
                        request_id = ctx.request_id.as_str(),
                        provider = provider.as_str(),
                        error = %err,
                        "upstream dispatch failed"
                    );
                    last = Some(err);
                    continue;
                }
            };

            if (200..300).contains(&response.status) {
                return adapter.parse_response(request, response.status, &response.body);
            }

            let err = adapter
                .parse_response(request, response.status, &response.body)
                .err()
                .unwrap_or_else(|| {
                    crate::providers::upstream_error(provider, response.status, &response.body)
                });
            self.metrics.record_upstream_failure();

            if retryable_status(response.status) {
                // Retries inside the transport are exhausted; advance.
                last = Some(err);
                continue;
            }

            // Definitive 4xx: terminal when pinned, advance on implicit
            // fallback (the same canonical request may be valid elsewhere).
            if pinned {
                return Err(err);
            }
            last = Some(err);
        }

        // Definitive request-shaped faults surface as themselves; anything
        // transport-shaped collapses into upstream_unavailable.
        match last {
            Some(GatewayError::Upstream {
                provider,
                status,
                body,
            }) if status < 500 && status != 429 => Err(GatewayError::Upstream {
                provider,
                status,
                body,
            }),
            Some(err @ GatewayError::ToolsUnsupported { .. }) => Err(err),
            Some(err) => Err(GatewayError::UpstreamUnavailable {
                model: request.model.clone(),
                last: err.to_string(),
            }),
            None => Err(GatewayError::UpstreamUnavailable {
                model: request.model.clone(),
                last: "no candidate providers".to_string(),
            }),
        }
    }

    /// Forwards a native provider request with transport signing only.
    pub async fn passthrough(
        &self,
        provider: &str,
        method: &str,
        path: &str,
        query: Vec<(String, String)>,
        body: Vec<u8>,
    ) -> Result<ProviderResponse> {
        let adapter = self
            .adapters
            .get(provider)
            .ok_or_else(|| GatewayError::InvalidRequest(format!("unknown provider: {provider}")))?;
        let mut request = ProviderRequest::post_json(
            format!("/{}", path.trim_start_matches('/')),
            body,
            adapter.signing(),
        );
        request.method = method.to_string();
        request.query = query;
        if request.body.is_empty() {
            request.headers.remove("content-type");
        }
        self.upstream.dispatch(provider, &request).await
    }

    pub fn models(&self) -> ModelsResponse {
        let created = now_epoch_seconds();
        ModelsResponse {
            object: "list".to_string(),
            data: self
                .router
                .known_models()
                .into_iter()
                .map(|id| {
                    let owned_by = self
                        .router
                        .config()
                        .model_mappings
                        .get(&id)
                        .map(|mapping| mapping.default_provider.clone())
                        .unwrap_or_else(|| "modelgate".to_string());
                    ModelEntry {
                        id,
                        object: "model".to_string(),
                        created,
                        owned_by,
                    }
                })
                .collect(),
        }
    }

    pub fn model(&self, id: &str) -> Option<ModelEntry> {
        self.models().data.into_iter().find(|entry| entry.id == id)
    }

    fn check_rate_limit(&self, principal_id: i64) -> Result<()> {
        let minute = (now_epoch_seconds() as u64) / 60;
        let mut limiter = self
            .limiter
            .lock()
            .map_err(|_| GatewayError::Internal("rate limiter poisoned".to_string()))?;
        limiter.check_and_consume(principal_id, minute).map_err(|err| {
            self.metrics.record_rate_limited();
            err
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_stable_and_distinct() {
        let a = fingerprint("req-1", "/v1/chat/completions", 7);
        let b = fingerprint("req-1", "/v1/chat/completions", 7);
        let c = fingerprint("req-2", "/v1/chat/completions", 7);
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 32);
    }

    #[test]
    fn request_ids_are_unique() {
        let a = generate_request_id();
        let b = generate_request_id();
        assert_ne!(a, b);
    }
}
