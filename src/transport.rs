//! Upstream HTTP transport: one client per provider, credential injection
//! per signing directive, bounded retries for 429/5xx and wire errors.
//! The raw status and body always flow back to the adapter; the traversal
//! decides what a status means.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Url;

use crate::auth::sigv4::{SigV4Signer, SigV4Timestamp};
use crate::config::{ProviderConfig, ProviderSecrets, RoutingFile};
use crate::providers::{ProviderRequest, ProviderResponse, Signing};
use crate::{GatewayError, Result};

/// Seam between the gateway and the network; tests substitute their own
/// implementation.
#[async_trait]
pub trait Upstream: Send + Sync {
    async fn dispatch(&self, provider: &str, request: &ProviderRequest) -> Result<ProviderResponse>;
}

struct ProviderClient {
    http: reqwest::Client,
    base_url: String,
    timeout_secs: u64,
    max_retries: u32,
    retry_delay: Duration,
}

pub struct Transport {
    clients: HashMap<String, ProviderClient>,
    secrets: ProviderSecrets,
}

impl Transport {
    pub fn new(file: &RoutingFile, secrets: &ProviderSecrets) -> Result<Self> {
        let mut clients = HashMap::new();
        for (name, config) in file.enabled_providers() {
            let base_url = resolve_base_url(name, config, secrets)?;
            let http = reqwest::Client::builder()
                .timeout(config.timeout_duration())
                .redirect(reqwest::redirect::Policy::limited(1))
                .build()
                .map_err(|err| {
                    GatewayError::Config(format!("http client for {name}: {err}"))
                })?;
            clients.insert(
                name.clone(),
                ProviderClient {
                    http,
                    base_url,
                    timeout_secs: config.timeout,
                    max_retries: config.max_retries,
                    retry_delay: config.retry_delay_duration(),
                },
            );
        }
        Ok(Self {
            clients,
            secrets: secrets.clone(),
        })
    }

    fn build_url(client: &ProviderClient, request: &ProviderRequest) -> Result<Url> {
        let base = client.base_url.trim_end_matches('/');
        let mut url = Url::parse(&format!("{base}{}", request.path))
            .map_err(|err| GatewayError::Internal(format!("bad upstream url: {err}")))?;
        if !request.query.is_empty() {
            url.query_pairs_mut().extend_pairs(
                request
                    .query
                    .iter()
                    .map(|(name, value)| (name.as_str(), value.as_str())),
            );
        }
        Ok(url)
    }

    fn apply_signing(
        &self,
        url: &Url,
        request: &ProviderRequest,
        headers: &mut std::collections::BTreeMap<String, String>,
    ) -> Result<()> {
        match &request.signing {
            Signing::SigV4 { region, service } => {
                let signer = SigV4Signer::from_secrets(&self.secrets, region, service)?;
                let signed = signer.sign(
                    &request.method,
                    url.as_str(),
                    headers,
                    &request.body,
                    SigV4Timestamp::now()?,
                )?;
                signed.insert_into(headers);
            }
            Signing::Bearer { token } => {
                headers.insert("authorization".to_string(), format!("Bearer {token}"));
            }
            Signing::ApiKey { header, token } => {
                headers.insert(header.clone(), token.clone());
            }
            Signing::None => {}
        }
        Ok(())
    }

    async fn send_once(
        &self,
        client: &ProviderClient,
        provider: &str,
        request: &ProviderRequest,
    ) -> Result<ProviderResponse> {
        let url = Self::build_url(client, request)?;
        let mut headers = request.headers.clone();
        self.apply_signing(&url, request, &mut headers)?;

        let method = reqwest::Method::from_bytes(request.method.as_bytes())
            .map_err(|err| GatewayError::Internal(format!("bad method: {err}")))?;
        let mut req = client.http.request(method, url);
        for (name, value) in &headers {
            req = req.header(name, value);
        }
        if !request.body.is_empty() {
            req = req.body(request.body.clone());
        }

        let response = req.send().await.map_err(|err| {
            if err.is_timeout() {
                GatewayError::TransportTimeout {
                    provider: provider.to_string(),
                    seconds: client.timeout_secs,
                }
            } else {
                GatewayError::Transport {
                    provider: provider.to_string(),
                    message: err.to_string(),
                }
            }
        })?;

        let status = response.status().as_u16();
        let body = response.bytes().await.map_err(|err| GatewayError::Transport {
            provider: provider.to_string(),
            message: format!("reading body: {err}"),
        })?;
        Ok(ProviderResponse { status, body })
    }
}

#[async_trait]
impl Upstream for Transport {
    async fn dispatch(&self, provider: &str, request: &ProviderRequest) -> Result<ProviderResponse> {
        let client = self.clients.get(provider).ok_or_else(|| {
            GatewayError::Transport {
                provider: provider.to_string(),
                message: "no transport configured".to_string(),
            }
        })?;

        let attempts = client.max_retries.saturating_add(1);
        let mut last_err: Option<GatewayError> = None;
        for attempt in 0..attempts {
            if attempt > 0 && !client.retry_delay.is_zero() {
                tokio::time::sleep(client.retry_delay).await;
            }
            match self.send_once(client, provider, request).await {
                Ok(response) => {
                    if retryable_status(response.status) && attempt + 1 < attempts {
                        tracing::warn!(
                            provider,
                            status = response.status,
                            attempt,
                            "retrying upstream request"
                        );
                        continue;
                    }
                    return Ok(response);
                }
                Err(err) => {
                    tracing::warn!(provider, error = %err, attempt, "upstream dispatch failed");
                    last_err = Some(err);
                }
            }
        }

        Err(last_err.unwrap_or_else(|| GatewayError::Transport {
            provider: provider.to_string(),
            message: "exhausted retries".to_string(),
        }))
    }
}

/// 429 and 5xx retry; every other status is final for this dispatch.
pub fn retryable_status(status: u16) -> bool {
    status == 429 || status >= 500
}

fn resolve_base_url(
    name: &str,
    config: &ProviderConfig,
    secrets: &ProviderSecrets,
) -> Result<String> {
    if let Some(url) = config
        .base_url
        .as_deref()
        .or(config.endpoint.as_deref())
        .filter(|s| !s.trim().is_empty())
    {
        return Ok(url.trim_end_matches('/').to_string());
    }

    let region = config
        .region
        .as_deref()
        .or(secrets.aws_region.as_deref())
        .unwrap_or("us-east-1");

    let url = match name {
        "bedrock" => format!("https://bedrock-runtime.{region}.amazonaws.com"),
        "azure" => secrets
            .azure_endpoint
            .clone()
            .ok_or_else(|| GatewayError::Config("azure endpoint is not set".to_string()))?,
        "openai" => "https://api.openai.com".to_string(),
        "anthropic" => "https://api.anthropic.com".to_string(),
        "vertex" => {
            let location = config
                .location
                .as_deref()
                .or(secrets.vertex_location.as_deref())
                .unwrap_or("us-central1");
            format!("https://{location}-aiplatform.googleapis.com")
        }
        "watsonx" => "https://us-south.ml.cloud.ibm.com".to_string(),
        "oracle" => secrets
            .oracle_endpoint
            .clone()
            .unwrap_or_else(|| {
                format!("https://inference.generativeai.{region}.oci.oraclecloud.com")
            }),
        other => {
            return Err(GatewayError::Config(format!(
                "provider {other:?} has no endpoint configured"
            )))
        }
    };
    Ok(url.trim_end_matches('/').to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryable_statuses() {
        assert!(retryable_status(429));
        assert!(retryable_status(500));
        assert!(retryable_status(503));
        assert!(!retryable_status(200));
        assert!(!retryable_status(400));
        assert!(!retryable_status(404));
    }

    #[test]
    fn base_url_defaults_per_provider() {
        let config = ProviderConfig {
            region: Some("eu-west-1".to_string()),
            ..Default::default()
        };
        let secrets = ProviderSecrets::default();
        assert_eq!(
            resolve_base_url("bedrock", &config, &secrets).unwrap(),
            "https://bedrock-runtime.eu-west-1.amazonaws.com"
        );
        assert_eq!(
            resolve_base_url("openai", &ProviderConfig::default(), &secrets).unwrap(),
            "https://api.openai.com"
        );
        assert!(resolve_base_url("azure", &ProviderConfig::default(), &secrets).is_err());
    }

    #[test]
    fn configured_base_url_wins() {
        let config = ProviderConfig {
            base_url: Some("http://localhost:9999/".to_string()),
            ..Default::default()
        };
        assert_eq!(
            resolve_base_url("openai", &config, &ProviderSecrets::default()).unwrap(),
            "http://localhost:9999"
        );
    }
}
