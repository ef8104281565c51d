//! Per-tab façade that applies circuit breaking, retries, timeouts, and response
//! validation on top of a [`ProviderAdapter`], per SPEC_FULL §4.9. Holds no state of its
//! own between calls beyond what it reads from [`ProviderHealthAuthority`].

use crate::errors::{ReverieError, Result};
use crate::functions::FunctionSchema;
use crate::model::ConversationMessage;
use crate::provider::adapter::{AdapterConfig, AdapterProgress, AdapterResponse, ProviderAuth};
use crate::provider::health_authority::{Admission, ProviderHealthAuthority};
use crate::provider::registry::{chat_completions_key, AdapterRegistry};
use crate::provider::retry::RetryConfig;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;

pub struct ProviderRouter {
    registry: Arc<AdapterRegistry>,
    health: Arc<ProviderHealthAuthority>,
    retry: RetryConfig,
}

/// How a failed attempt should be handled by the retry loop.
enum Classification {
    /// HTTP 429 or text match with a `Retry-After` hint; sleeps without consuming the
    /// retry budget.
    RateLimited { retry_after_ms: u64 },
    /// Timeouts, 5xx, network resets; sleeps for jittered exponential backoff.
    Retryable,
    /// Auth, other 4xx, malformed response, circuit open; fails immediately.
    NonRetryable,
}

fn classify(err: &ReverieError) -> Classification {
    match err {
        ReverieError::RateLimit { retry_after_ms } => Classification::RateLimited {
            retry_after_ms: *retry_after_ms,
        },
        ReverieError::Timeout(_) | ReverieError::Connection { .. } => Classification::Retryable,
        _ => Classification::NonRetryable,
    }
}

impl ProviderRouter {
    pub fn new(registry: Arc<AdapterRegistry>, health: Arc<ProviderHealthAuthority>, retry: RetryConfig) -> Self {
        ProviderRouter { registry, health, retry }
    }

    pub async fn call_provider(
        &self,
        auth: &ProviderAuth,
        config: &AdapterConfig,
        messages: &[ConversationMessage],
        tools: &[FunctionSchema],
        on_progress: Option<mpsc::Sender<AdapterProgress>>,
    ) -> Result<AdapterResponse> {
        let adapter = self
            .registry
            .get(&config.provider_key)
            .ok_or_else(|| ReverieError::validation(format!("no adapter registered for provider '{}'", config.provider_key)))?;

        let endpoint_key = chat_completions_key(&config.provider_key);

        if let Admission::Denied { cooldown_remaining } = self.health.can_execute(&endpoint_key).await {
            return Err(ReverieError::CircuitOpen {
                endpoint_key,
                cooldown_remaining_ms: cooldown_remaining.as_millis() as u64,
            });
        }

        let mut last_err: Option<ReverieError> = None;
        let mut attempt = 0u32;

        loop {
            if attempt > self.retry.max_attempts {
                break;
            }

            if let Admission::Denied { cooldown_remaining } = self.health.can_execute(&endpoint_key).await {
                return Err(ReverieError::CircuitOpen {
                    endpoint_key,
                    cooldown_remaining_ms: cooldown_remaining.as_millis() as u64,
                });
            }

            let started = Instant::now();
            let progress = on_progress.clone();
            let outcome = adapter.call(auth, config, messages, tools, progress).await;

            match outcome {
                Ok(response) => {
                    self.health.record_success(&endpoint_key, started.elapsed()).await;
                    validate_response(&response);
                    return Ok(response);
                }
                Err(err) => match classify(&err) {
                    Classification::RateLimited { retry_after_ms } => {
                        log::warn!("rate limited by '{}', sleeping {retry_after_ms}ms", config.provider_key);
                        tokio::time::sleep(std::time::Duration::from_millis(retry_after_ms)).await;
                        last_err = Some(err);
                        // Rate-limit sleeps don't consume the retry budget.
                        continue;
                    }
                    Classification::Retryable if attempt < self.retry.max_attempts => {
                        let delay = self.retry.calculate_delay(attempt);
                        log::debug!(
                            "retryable error calling '{}' (attempt {attempt}): {err}, backing off {delay:?}",
                            config.provider_key
                        );
                        tokio::time::sleep(delay).await;
                        last_err = Some(err);
                        attempt += 1;
                        continue;
                    }
                    Classification::Retryable | Classification::NonRetryable => {
                        self.health.record_failure(&endpoint_key).await;
                        return Err(err);
                    }
                },
            }
        }

        self.health.record_failure(&endpoint_key).await;
        Err(last_err.unwrap_or_else(|| ReverieError::validation("retry budget exhausted with no recorded error")))
    }
}

/// A structurally valid response permits absent content and absent tool calls, but logs
/// it — an assistant turn with neither is unusual even if not technically invalid.
fn validate_response(response: &AdapterResponse) {
    if response.message.content.is_none() && response.message.tool_calls.is_empty() {
        log::warn!("provider response carries neither content nor tool calls");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::adapter::{ProviderAdapter, ResponseMessage};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    struct FlakyAdapter {
        key: &'static str,
        failures_then_success: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ProviderAdapter for FlakyAdapter {
        fn provider_key(&self) -> &str {
            self.key
        }

        async fn call(
            &self,
            _auth: &ProviderAuth,
            _config: &AdapterConfig,
            _messages: &[ConversationMessage],
            _tools: &[FunctionSchema],
            _on_progress: Option<mpsc::Sender<AdapterProgress>>,
        ) -> Result<AdapterResponse> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n < self.failures_then_success {
                return Err(ReverieError::Connection {
                    message: "503 service unavailable".to_string(),
                });
            }
            Ok(AdapterResponse {
                message: ResponseMessage {
                    role: "assistant".to_string(),
                    content: Some("ok".to_string()),
                    tool_calls: vec![],
                },
                finish_reason: Some("stop".to_string()),
                model: None,
                usage: None,
                thinking: None,
            })
        }
    }

    fn config_for(provider_key: &str) -> AdapterConfig {
        AdapterConfig {
            provider_key: provider_key.to_string(),
            base_url: "http://localhost:11434/v1".to_string(),
            model: "test-model".to_string(),
            max_tokens: None,
            temperature: None,
            top_p: None,
            frequency_penalty: None,
            presence_penalty: None,
            tool_choice: None,
            loopback_only: false,
            reasoning_tag: None,
            request_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn retries_transient_failure_and_eventually_succeeds() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(FlakyAdapter {
            key: "flaky",
            failures_then_success: 2,
            calls: AtomicU32::new(0),
        }));
        let health = Arc::new(ProviderHealthAuthority::new(10, Duration::from_millis(10), Duration::from_secs(1), 2.0));
        let router = ProviderRouter::new(Arc::new(registry), health, RetryConfig::default().with_max_attempts(3));

        let response = router
            .call_provider(&ProviderAuth::default(), &config_for("flaky"), &[ConversationMessage::user("hi")], &[], None)
            .await
            .unwrap();
        assert_eq!(response.message.content.as_deref(), Some("ok"));
    }

    #[tokio::test]
    async fn circuit_open_short_circuits_before_calling_adapter() {
        let mut registry = AdapterRegistry::new();
        registry.register(Arc::new(FlakyAdapter {
            key: "always_fails",
            failures_then_success: u32::MAX,
            calls: AtomicU32::new(0),
        }));
        let health = Arc::new(ProviderHealthAuthority::new(1, Duration::from_secs(30), Duration::from_secs(60), 2.0));
        let router = ProviderRouter::new(Arc::new(registry), health.clone(), RetryConfig::default().with_max_attempts(0));

        let _ = router
            .call_provider(&ProviderAuth::default(), &config_for("always_fails"), &[ConversationMessage::user("hi")], &[], None)
            .await;

        let err = router
            .call_provider(&ProviderAuth::default(), &config_for("always_fails"), &[ConversationMessage::user("hi")], &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReverieError::CircuitOpen { .. }));
    }

    #[tokio::test]
    async fn unregistered_provider_is_a_fatal_config_error() {
        let registry = Arc::new(AdapterRegistry::new());
        let health = Arc::new(ProviderHealthAuthority::new(3, Duration::from_secs(5), Duration::from_secs(60), 2.0));
        let router = ProviderRouter::new(registry, health, RetryConfig::default());
        let err = router
            .call_provider(&ProviderAuth::default(), &config_for("missing"), &[ConversationMessage::user("hi")], &[], None)
            .await
            .unwrap_err();
        assert!(matches!(err, ReverieError::Validation { .. }));
    }
}
