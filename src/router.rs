//! Model routing: canonical model name to an ordered list of candidate
//! providers, plus the per-provider upstream model id. Pure decisions over
//! the loaded configuration; enumeration order is authoritative.

use std::sync::Arc;

use crate::config::{ModelInfo, RoutingFile};
use crate::{GatewayError, Result};

#[derive(Clone)]
pub struct Router {
    file: Arc<RoutingFile>,
}

impl Router {
    pub fn new(file: Arc<RoutingFile>) -> Self {
        Self { file }
    }

    pub fn config(&self) -> &RoutingFile {
        &self.file
    }

    /// Ordered candidate providers for a model. A pinned provider
    /// suppresses fallback entirely; otherwise the exact mapping (default
    /// first, then its other providers in declaration order), then the
    /// first matching pattern, then the global fallback list.
    pub fn resolve(&self, model: &str, preferred: Option<&str>) -> Result<Vec<String>> {
        if let Some(preferred) = preferred.filter(|p| !p.trim().is_empty()) {
            if self.file.provider_enabled(preferred) && self.supports(preferred, model) {
                return Ok(vec![preferred.to_string()]);
            }
        }

        let mut out = Vec::<String>::new();

        if let Some(mapping) = self.file.model_mappings.get(model) {
            if self.file.provider_enabled(&mapping.default_provider) {
                out.push(mapping.default_provider.clone());
            }
            for name in mapping.providers.keys() {
                push_unique(&mut out, name, &self.file);
            }
        } else if let Some(pattern) = self
            .file
            .routing
            .patterns
            .iter()
            .find(|pattern| pattern.matches(model))
        {
            if self.file.provider_enabled(&pattern.default_provider) {
                out.push(pattern.default_provider.clone());
            }
        }

        if out.is_empty() {
            return Err(GatewayError::UnknownModel {
                model: model.to_string(),
            });
        }

        if self.file.routing.fallback.enabled {
            for name in &self.file.routing.fallback.providers {
                push_unique(&mut out, name, &self.file);
            }
        }

        Ok(out)
    }

    /// Upstream model id for one provider; identity when the mapping has
    /// no entry for it.
    pub fn upstream_model(&self, provider: &str, model: &str) -> String {
        self.model_info(provider, model)
            .map(|info| info.model.clone())
            .filter(|m| !m.is_empty())
            .unwrap_or_else(|| model.to_string())
    }

    pub fn model_info(&self, provider: &str, model: &str) -> Option<&ModelInfo> {
        self.file
            .model_mappings
            .get(model)
            .and_then(|mapping| mapping.providers.get(provider))
    }

    /// Whether a provider can serve a model, via exact mapping or a
    /// pattern whose default is that provider.
    pub fn supports(&self, provider: &str, model: &str) -> bool {
        if let Some(mapping) = self.file.model_mappings.get(model) {
            return mapping.default_provider == provider
                || mapping.providers.contains_key(provider);
        }
        self.file
            .routing
            .patterns
            .iter()
            .any(|pattern| pattern.matches(model) && pattern.default_provider == provider)
    }

    /// Union of canonical model names resolvable across enabled providers,
    /// in declaration order.
    pub fn known_models(&self) -> Vec<String> {
        self.file
            .model_mappings
            .iter()
            .filter(|(_, mapping)| {
                self.file.provider_enabled(&mapping.default_provider)
                    || mapping
                        .providers
                        .keys()
                        .any(|name| self.file.provider_enabled(name))
            })
            .map(|(name, _)| name.clone())
            .collect()
    }

    pub fn max_attempts(&self) -> usize {
        self.file.routing.fallback.max_attempts.max(1)
    }
}

fn push_unique(out: &mut Vec<String>, name: &str, file: &RoutingFile) {
    if !file.provider_enabled(name) {
        return;
    }
    if out.iter().any(|existing| existing == name) {
        return;
    }
    out.push(name.to_string());
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Router {
        let file = RoutingFile::parse(
            r#"
model_mappings:
  claude-3-sonnet:
    default_provider: bedrock
    providers:
      bedrock:
        model: anthropic.claude-3-sonnet-20240229-v1:0
      anthropic:
        model: claude-3-sonnet-20240229
      vertex:
        model: claude-3-sonnet@20240229
  gpt-3.5-turbo:
    default_provider: openai
    providers:
      openai:
        model: gpt-3.5-turbo
routing:
  patterns:
    - pattern: "^claude-"
      default_provider: anthropic
    - pattern: "^gemini-"
      default_provider: vertex
  fallback:
    enabled: true
    providers: [anthropic, openai, disabledone]
    max_attempts: 3
providers:
  bedrock:
    enabled: true
  anthropic:
    enabled: true
  openai:
    enabled: true
  vertex:
    enabled: false
  disabledone:
    enabled: false
"#,
        )
        .unwrap();
        Router::new(Arc::new(file))
    }

    #[test]
    fn exact_mapping_orders_default_first() {
        let router = sample();
        let providers = router.resolve("claude-3-sonnet", None).unwrap();
        assert_eq!(providers, vec!["bedrock", "anthropic", "openai"]);
    }

    #[test]
    fn no_duplicates_and_no_disabled_providers() {
        let router = sample();
        let providers = router.resolve("claude-3-sonnet", None).unwrap();
        let mut deduped = providers.clone();
        deduped.dedup();
        assert_eq!(providers, deduped);
        assert!(!providers.iter().any(|p| p == "vertex"));
        assert!(!providers.iter().any(|p| p == "disabledone"));
    }

    #[test]
    fn pinned_provider_suppresses_fallback() {
        let router = sample();
        let providers = router
            .resolve("claude-3-sonnet", Some("anthropic"))
            .unwrap();
        assert_eq!(providers, vec!["anthropic"]);
    }

    #[test]
    fn pinned_disabled_provider_falls_through() {
        let router = sample();
        let providers = router.resolve("claude-3-sonnet", Some("vertex")).unwrap();
        assert_eq!(providers[0], "bedrock");
    }

    #[test]
    fn pattern_matches_in_declaration_order() {
        let router = sample();
        let providers = router.resolve("claude-2.1", None).unwrap();
        assert_eq!(providers[0], "anthropic");
    }

    #[test]
    fn pattern_with_disabled_default_is_unknown() {
        let router = sample();
        let err = router.resolve("gemini-1.5-pro", None).unwrap_err();
        assert!(matches!(err, GatewayError::UnknownModel { .. }));
    }

    #[test]
    fn unmapped_model_is_unknown() {
        let router = sample();
        let err = router.resolve("gpt-oss-harmony", None).unwrap_err();
        assert!(matches!(err, GatewayError::UnknownModel { .. }));
    }

    #[test]
    fn upstream_model_resolution_with_identity_fallback() {
        let router = sample();
        assert_eq!(
            router.upstream_model("bedrock", "claude-3-sonnet"),
            "anthropic.claude-3-sonnet-20240229-v1:0"
        );
        assert_eq!(
            router.upstream_model("anthropic", "claude-2.1"),
            "claude-2.1"
        );
    }

    #[test]
    fn known_models_in_declaration_order() {
        let router = sample();
        assert_eq!(
            router.known_models(),
            vec!["claude-3-sonnet".to_string(), "gpt-3.5-turbo".to_string()]
        );
    }
}
