//! Provider Routing & Resilience Core: adapters over OpenAI-compatible chat-completions
//! backends, circuit breaking, retry/backoff, SSRF guarding for loopback targets, and
//! parallel health probing.

pub mod adapter;
pub mod health_authority;
pub mod health_probe;
pub mod http;
pub mod registry;
pub mod retry;
pub mod router;
pub mod ssrf_guard;

pub use adapter::{
    AdapterConfig, AdapterProgress, AdapterResponse, OpenAiCompatibleAdapter, ProviderAdapter, ProviderAuth,
    ResponseMessage, TokenUsage,
};
pub use health_authority::{Admission, CircuitPhase, CircuitState, ProviderHealthAuthority};
pub use health_probe::{HealthProbe, HealthStatus, ProbeTarget};
pub use registry::{chat_completions_key, model_listing_key, AdapterRegistry};
pub use retry::RetryConfig;
pub use router::ProviderRouter;
