//! Gateway configuration: the model-mapping file and the environment-sourced
//! provider secrets. Mapping and pattern order is load-bearing (pattern
//! routing and fallback walk the configuration in declaration order), so
//! every mapping-of-mappings is an insertion-ordered map.

use std::collections::BTreeMap;
use std::time::Duration;

use indexmap::IndexMap;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{GatewayError, Result};

pub const DEFAULT_TIMEOUT_SECS: u64 = 30;
pub const DEFAULT_MAX_ATTEMPTS: usize = 2;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingFile {
    #[serde(default)]
    pub model_mappings: IndexMap<String, ModelMapping>,
    #[serde(default)]
    pub routing: RoutingConfig,
    #[serde(default)]
    pub providers: IndexMap<String, ProviderConfig>,
    #[serde(default)]
    pub features: FeatureFlags,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelMapping {
    pub default_provider: String,
    #[serde(default)]
    pub providers: IndexMap<String, ModelInfo>,
}

/// Provider-specific view of one canonical model name.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelInfo {
    #[serde(default)]
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deployment: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingConfig {
    #[serde(default)]
    pub patterns: Vec<RoutingPattern>,
    #[serde(default)]
    pub fallback: FallbackConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RoutingPattern {
    pub pattern: String,
    pub default_provider: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip)]
    compiled: Option<Regex>,
}

impl RoutingPattern {
    pub fn matches(&self, model: &str) -> bool {
        self.compiled
            .as_ref()
            .is_some_and(|regex| regex.is_match(model))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FallbackConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub providers: Vec<String>,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: usize,
}

fn default_max_attempts() -> usize {
    DEFAULT_MAX_ATTEMPTS
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    /// Seconds.
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub max_retries: u32,
    /// Milliseconds between retry attempts.
    #[serde(default)]
    pub retry_delay: u64,
}

fn default_timeout() -> u64 {
    DEFAULT_TIMEOUT_SECS
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            region: None,
            location: None,
            project_id: None,
            endpoint: None,
            base_url: None,
            api_version: None,
            timeout: DEFAULT_TIMEOUT_SECS,
            max_retries: 0,
            retry_delay: 0,
        }
    }
}

impl ProviderConfig {
    pub fn timeout_duration(&self) -> Duration {
        Duration::from_secs(self.timeout.max(1))
    }

    pub fn retry_delay_duration(&self) -> Duration {
        Duration::from_millis(self.retry_delay)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeatureFlags {
    #[serde(default)]
    pub streaming: bool,
    #[serde(default)]
    pub cost_tracking: bool,
    #[serde(default)]
    pub auto_fallback: bool,
    #[serde(default)]
    pub response_caching: bool,
}

impl RoutingFile {
    pub fn load(path: &str) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|err| GatewayError::Config(format!("failed to read {path}: {err}")))?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self> {
        let expanded = expand_env_vars(raw, |name| std::env::var(name).ok());
        let mut file: RoutingFile = serde_yaml::from_str(&expanded)
            .map_err(|err| GatewayError::Config(format!("failed to parse config: {err}")))?;
        if file.routing.fallback.max_attempts == 0 {
            file.routing.fallback.max_attempts = DEFAULT_MAX_ATTEMPTS;
        }
        file.compile_patterns()?;
        Ok(file)
    }

    fn compile_patterns(&mut self) -> Result<()> {
        for pattern in &mut self.routing.patterns {
            let compiled = Regex::new(&pattern.pattern).map_err(|err| {
                GatewayError::Config(format!(
                    "failed to compile pattern {:?}: {err}",
                    pattern.pattern
                ))
            })?;
            pattern.compiled = Some(compiled);
        }
        Ok(())
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    pub fn provider_enabled(&self, name: &str) -> bool {
        self.providers.get(name).is_some_and(|p| p.enabled)
    }

    pub fn enabled_providers(&self) -> impl Iterator<Item = (&String, &ProviderConfig)> {
        self.providers.iter().filter(|(_, config)| config.enabled)
    }

    /// Aggregated validation: every default provider must exist and be
    /// enabled, and every fallback provider must be declared.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::<String>::new();

        for (model, mapping) in &self.model_mappings {
            if mapping.default_provider.is_empty() {
                problems.push(format!("model {model:?} has no default provider"));
                continue;
            }
            match self.providers.get(&mapping.default_provider) {
                None => problems.push(format!(
                    "model {model:?} default provider {:?} is not declared",
                    mapping.default_provider
                )),
                Some(config) if !config.enabled => problems.push(format!(
                    "model {model:?} default provider {:?} is disabled",
                    mapping.default_provider
                )),
                Some(_) => {}
            }
        }

        for pattern in &self.routing.patterns {
            if !self.providers.contains_key(&pattern.default_provider) {
                problems.push(format!(
                    "pattern {:?} default provider {:?} is not declared",
                    pattern.pattern, pattern.default_provider
                ));
            }
        }

        if self.routing.fallback.enabled {
            for name in &self.routing.fallback.providers {
                if !self.providers.contains_key(name) {
                    problems.push(format!("fallback provider {name:?} is not declared"));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(GatewayError::Config(format!(
                "configuration validation failed:\n  - {}",
                problems.join("\n  - ")
            )))
        }
    }
}

/// Expands `${VAR}` references. The unbraced `$VAR` form is deliberately
/// left untouched; unset variables expand to the empty string.
pub fn expand_env_vars(raw: &str, lookup: impl Fn(&str) -> Option<String>) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let name = &after[..end];
                if let Some(value) = lookup(name) {
                    out.push_str(&value);
                }
                rest = &after[end + 1..];
            }
            None => {
                out.push_str(&rest[start..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

/// Provider secrets, read from the environment exactly once at startup.
#[derive(Clone, Default)]
pub struct ProviderSecrets {
    pub aws_region: Option<String>,
    pub aws_access_key_id: Option<String>,
    pub aws_secret_access_key: Option<String>,
    pub aws_session_token: Option<String>,
    pub azure_endpoint: Option<String>,
    pub azure_api_key: Option<String>,
    pub openai_api_key: Option<String>,
    pub anthropic_api_key: Option<String>,
    pub watsonx_api_key: Option<String>,
    pub watsonx_project_id: Option<String>,
    pub vertex_project_id: Option<String>,
    pub vertex_location: Option<String>,
    pub vertex_access_token: Option<String>,
    pub oracle_compartment_id: Option<String>,
    pub oracle_auth_token: Option<String>,
    pub oracle_endpoint: Option<String>,
}

impl std::fmt::Debug for ProviderSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProviderSecrets")
            .field("aws_region", &self.aws_region)
            .field("azure_endpoint", &self.azure_endpoint)
            .field("vertex_project_id", &self.vertex_project_id)
            .field("vertex_location", &self.vertex_location)
            .field("oracle_endpoint", &self.oracle_endpoint)
            .field("keys", &"<redacted>")
            .finish()
    }
}

impl ProviderSecrets {
    pub fn from_env() -> Self {
        fn read(name: &str) -> Option<String> {
            std::env::var(name).ok().filter(|v| !v.trim().is_empty())
        }

        Self {
            aws_region: read("AWS_REGION"),
            aws_access_key_id: read("AWS_ACCESS_KEY_ID"),
            aws_secret_access_key: read("AWS_SECRET_ACCESS_KEY"),
            aws_session_token: read("AWS_SESSION_TOKEN"),
            azure_endpoint: read("AZURE_OPENAI_ENDPOINT"),
            azure_api_key: read("AZURE_OPENAI_API_KEY"),
            openai_api_key: read("OPENAI_API_KEY"),
            anthropic_api_key: read("ANTHROPIC_API_KEY"),
            watsonx_api_key: read("WATSONX_API_KEY"),
            watsonx_project_id: read("WATSONX_PROJECT_ID"),
            vertex_project_id: read("VERTEX_PROJECT_ID"),
            vertex_location: read("VERTEX_LOCATION"),
            vertex_access_token: read("VERTEX_ACCESS_TOKEN"),
            oracle_compartment_id: read("ORACLE_COMPARTMENT_ID"),
            oracle_auth_token: read("ORACLE_AUTH_TOKEN"),
            oracle_endpoint: read("ORACLE_ENDPOINT"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
model_mappings:
  claude-3-sonnet:
    default_provider: bedrock
    providers:
      bedrock:
        model: anthropic.claude-3-sonnet-20240229-v1:0
        region: us-east-1
      anthropic:
        model: claude-3-sonnet-20240229
  gpt-3.5-turbo:
    default_provider: openai
    providers:
      openai:
        model: gpt-3.5-turbo
      azure:
        deployment: gpt-35-turbo
        api_version: 2024-02-01
routing:
  patterns:
    - pattern: "^claude-"
      default_provider: anthropic
    - pattern: "^gpt-"
      default_provider: openai
  fallback:
    enabled: true
    providers: [anthropic, openai]
    max_attempts: 3
providers:
  bedrock:
    enabled: true
    region: us-east-1
    timeout: 60
    max_retries: 2
    retry_delay: 250
  anthropic:
    enabled: true
  openai:
    enabled: true
  azure:
    enabled: false
"#;

    #[test]
    fn parses_and_preserves_declaration_order() {
        let file = RoutingFile::parse(SAMPLE).unwrap();
        let models: Vec<&String> = file.model_mappings.keys().collect();
        assert_eq!(models, vec!["claude-3-sonnet", "gpt-3.5-turbo"]);

        let mapping = &file.model_mappings["claude-3-sonnet"];
        let providers: Vec<&String> = mapping.providers.keys().collect();
        assert_eq!(providers, vec!["bedrock", "anthropic"]);

        assert_eq!(file.routing.patterns.len(), 2);
        assert!(file.routing.patterns[0].matches("claude-2.1"));
        assert_eq!(file.routing.fallback.max_attempts, 3);
        assert!(file.provider_enabled("bedrock"));
        assert!(!file.provider_enabled("azure"));
    }

    #[test]
    fn validation_accepts_sample_and_flags_unknown_fallback() {
        let file = RoutingFile::parse(SAMPLE).unwrap();
        file.validate().unwrap();

        let mut broken = file.clone();
        broken.routing.fallback.providers.push("nope".to_string());
        let err = broken.validate().unwrap_err();
        assert!(err.to_string().contains("fallback provider \"nope\""));
    }

    #[test]
    fn expands_braced_env_refs_only() {
        let lookup = |name: &str| match name {
            "REGION" => Some("us-east-1".to_string()),
            _ => None,
        };
        assert_eq!(
            expand_env_vars("region: ${REGION}", lookup),
            "region: us-east-1"
        );
        assert_eq!(expand_env_vars("region: $REGION", lookup), "region: $REGION");
        assert_eq!(expand_env_vars("region: ${MISSING}", lookup), "region: ");
        assert_eq!(expand_env_vars("tail ${OPEN", lookup), "tail ${OPEN");
    }

    #[test]
    fn provider_defaults_apply() {
        let file = RoutingFile::parse(SAMPLE).unwrap();
        let anthropic = file.provider("anthropic").unwrap();
        assert_eq!(anthropic.timeout, DEFAULT_TIMEOUT_SECS);
        assert_eq!(anthropic.max_retries, 0);
    }
}
