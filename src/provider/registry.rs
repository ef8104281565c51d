//! A small registry of adapter implementations keyed by provider, so the router holds
//! no per-provider knowledge beyond timeouts, per SPEC_FULL §9's design note.

use crate::provider::adapter::ProviderAdapter;
use std::collections::HashMap;
use std::sync::Arc;

/// Endpoint-qualified key for chat-completions circuit breaking and retry bookkeeping.
/// Per §9, this must never collapse to the provider alone — a chat-completions failure
/// must not open the circuit for that provider's model-listing probes.
pub fn chat_completions_key(provider_key: &str) -> String {
    format!("chat_completions:{provider_key}")
}

pub fn model_listing_key(provider_key: &str) -> String {
    format!("model_listing:{provider_key}")
}

#[derive(Default)]
pub struct AdapterRegistry {
    adapters: HashMap<String, Arc<dyn ProviderAdapter>>,
}

impl AdapterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, adapter: Arc<dyn ProviderAdapter>) {
        self.adapters.insert(adapter.provider_key().to_string(), adapter);
    }

    pub fn get(&self, provider_key: &str) -> Option<Arc<dyn ProviderAdapter>> {
        self.adapters.get(provider_key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::adapter::OpenAiCompatibleAdapter;

    #[test]
    fn keys_are_endpoint_qualified() {
        assert_eq!(chat_completions_key("openai"), "chat_completions:openai");
        assert_eq!(model_listing_key("openai"), "model_listing:openai");
        assert_ne!(chat_completions_key("openai"), model_listing_key("openai"));
    }

    #[test]
    fn register_and_get_round_trips() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(OpenAiCompatibleAdapter::new()));
        assert!(registry.get("openai_compatible").is_some());
        assert!(registry.get("missing").is_none());
    }
}
