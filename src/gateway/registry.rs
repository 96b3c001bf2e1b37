//! Map from API name to a ready-to-use chat gateway.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::error::ProviderError;
use super::openai_compat::OpenAiCompatAdapter;
use super::usage::UsageSink;
use super::{ChatGateway, GatewayConfig, ProviderGateway};

/// A known OpenAI-compatible endpoint.
#[derive(Debug, Clone, Copy)]
pub struct Endpoint {
    pub api: &'static str,
    pub base_url: &'static str,
    /// Whether the endpoint needs `<API>_API_KEY`.
    pub keyed: bool,
    /// Self-hosted endpoints report no token usage.
    pub cost_free: bool,
}

pub const BUILTIN_ENDPOINTS: &[Endpoint] = &[
    Endpoint { api: "openai", base_url: "https://api.openai.com/v1", keyed: true, cost_free: false },
    Endpoint { api: "openrouter", base_url: "https://openrouter.ai/api/v1", keyed: true, cost_free: false },
    Endpoint { api: "xai", base_url: "https://api.x.ai/v1", keyed: true, cost_free: false },
    Endpoint { api: "together", base_url: "https://api.together.xyz/v1", keyed: true, cost_free: false },
    Endpoint { api: "mistral", base_url: "https://api.mistral.ai/v1", keyed: true, cost_free: false },
    Endpoint { api: "deepseek", base_url: "https://api.deepseek.com/v1", keyed: true, cost_free: false },
    Endpoint {
        api: "alibaba",
        base_url: "https://dashscope-intl.aliyuncs.com/compatible-mode/v1",
        keyed: true,
        cost_free: false,
    },
    Endpoint {
        api: "google",
        base_url: "https://generativelanguage.googleapis.com/v1beta/openai",
        keyed: true,
        cost_free: false,
    },
    Endpoint { api: "anthropic", base_url: "https://api.anthropic.com/v1", keyed: true, cost_free: false },
    Endpoint { api: "ollama", base_url: "http://localhost:11434/v1", keyed: false, cost_free: true },
];

pub fn builtin_endpoint(api: &str) -> Option<&'static Endpoint> {
    BUILTIN_ENDPOINTS.iter().find(|e| e.api == api)
}

/// Environment variable prefix for an API name, e.g. `xai` -> `XAI`.
fn env_prefix(api: &str) -> String {
    api.to_ascii_uppercase().replace('-', "_")
}

#[derive(Default, Clone)]
pub struct ProviderRegistry {
    gateways: HashMap<String, Arc<dyn ChatGateway>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every built-in endpoint that is usable from the environment:
    /// keyed endpoints need `<API>_API_KEY`, and `<API>_BASE_URL` overrides the
    /// default URL. Adapters use `config.request_timeout`.
    pub fn from_env<U: UsageSink + 'static>(
        usage_sink: Arc<U>,
        config: GatewayConfig,
    ) -> Result<Self, ProviderError> {
        let timeout = config.request_timeout;
        let mut registry = Self::new();
        for endpoint in BUILTIN_ENDPOINTS {
            let prefix = env_prefix(endpoint.api);
            let api_key = std::env::var(format!("{prefix}_API_KEY")).ok();
            if endpoint.keyed && api_key.is_none() {
                debug!(api = endpoint.api, "skipping provider without {prefix}_API_KEY");
                continue;
            }
            let base_url = std::env::var(format!("{prefix}_BASE_URL"))
                .unwrap_or_else(|_| endpoint.base_url.to_string());

            let mut adapter = OpenAiCompatAdapter::with_config(endpoint.api, base_url, api_key, timeout)?;
            if endpoint.cost_free {
                adapter = adapter.cost_free();
            }
            let gateway = ProviderGateway::new(Arc::new(adapter), usage_sink.clone(), config.clone());
            registry.insert(endpoint.api, Arc::new(gateway));
        }
        Ok(registry)
    }

    pub fn list(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.gateways.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn get(&self, api: &str) -> Option<Arc<dyn ChatGateway>> {
        self.gateways.get(api).cloned()
    }

    /// Like [`get`](Self::get), but with an error naming what is missing.
    pub fn resolve(&self, api: &str) -> Result<Arc<dyn ChatGateway>, ProviderError> {
        self.get(api).ok_or_else(|| match builtin_endpoint(api) {
            Some(e) if e.keyed => ProviderError::config(format!(
                "provider `{api}` is not configured: set {}_API_KEY",
                env_prefix(api)
            )),
            _ => ProviderError::UnknownApi(api.to_string()),
        })
    }

    pub fn insert(&mut self, api: impl Into<String>, gateway: Arc<dyn ChatGateway>) {
        self.gateways.insert(api.into(), gateway);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{ChatRequest, ChatResponse};

    struct Dummy;

    #[async_trait::async_trait]
    impl ChatGateway for Dummy {
        async fn chat(&self, _req: ChatRequest) -> Result<ChatResponse, ProviderError> {
            Err(ProviderError::provider("dummy", "unused", false))
        }
    }

    #[test]
    fn insert_list_resolve() {
        let mut registry = ProviderRegistry::new();
        registry.insert("zeta", Arc::new(Dummy));
        registry.insert("alpha", Arc::new(Dummy));
        assert_eq!(registry.list(), vec!["alpha", "zeta"]);
        assert!(registry.resolve("alpha").is_ok());
        assert!(matches!(
            registry.resolve("unknown"),
            Err(ProviderError::UnknownApi(_))
        ));
        assert!(matches!(registry.resolve("xai"), Err(ProviderError::Config(_))));
    }

    #[test]
    fn builtins_cover_keyless_local_endpoint() {
        let ollama = builtin_endpoint("ollama").unwrap();
        assert!(!ollama.keyed);
        assert!(ollama.cost_free);
        assert_eq!(env_prefix("open-router"), "OPEN_ROUTER");
    }
}
