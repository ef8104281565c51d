//! Parallel per-provider readiness + model listing with bounded latency, per SPEC_FULL
//! §4.10. Each probe hits that provider's models-listing endpoint independently; a slow
//! or wedged provider cannot delay the others, since `futures_util::future::join_all`
//! awaits every future concurrently rather than sequentially.

use crate::provider::adapter::ProviderAuth;
use crate::provider::http::get_http_client;
use crate::provider::ssrf_guard::validate_loopback_url;
use serde_json::Value;
use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub enum HealthStatus {
    /// Reachable, returns at least one model.
    Ready { latency: Duration, models: Vec<String> },
    /// Reachable, no models available.
    RunningNoModels { latency: Duration },
    /// Auth configured but absent.
    NoKey,
    /// Returned 401/403.
    InvalidKey { latency: Duration },
    /// Connection refused or timed out (local providers).
    NotRunning,
    /// Exceeded the probe timeout (remote providers).
    Timeout,
    /// Body not parseable as JSON.
    ParseError { latency: Duration },
    /// Other non-2xx.
    Error { latency: Duration, message: String },
}

#[derive(Debug, Clone)]
pub struct ProbeTarget {
    pub provider_key: String,
    pub models_url: String,
    pub auth: ProviderAuth,
    /// Whether a missing key means "can't authenticate" (remote) vs. N/A (local, no auth).
    pub requires_key: bool,
    pub loopback_only: bool,
}

/// The maximum number of model identifiers surfaced in a `Ready` status.
const MODEL_LIST_PREVIEW_CAP: usize = 20;

pub struct HealthProbe {
    timeout: Duration,
}

impl HealthProbe {
    pub fn new(timeout: Duration) -> Self {
        HealthProbe { timeout }
    }

    pub fn from_config(config: &crate::config::ReverieConfig) -> Self {
        Self::new(config.health_probe_timeout)
    }

    pub async fn check_health(&self, targets: &[ProbeTarget]) -> Vec<(String, HealthStatus)> {
        let futures = targets.iter().map(|target| self.probe_one(target));
        let statuses = futures_util::future::join_all(futures).await;
        targets
            .iter()
            .map(|t| t.provider_key.clone())
            .zip(statuses)
            .collect()
    }

    async fn probe_one(&self, target: &ProbeTarget) -> HealthStatus {
        if target.requires_key && target.auth.api_key.is_none() {
            return HealthStatus::NoKey;
        }

        let url = if target.loopback_only {
            match validate_loopback_url(&target.models_url, 1024) {
                Ok(url) => url,
                Err(message) => return HealthStatus::Error { latency: Duration::ZERO, message },
            }
        } else {
            match reqwest::Url::parse(&target.models_url) {
                Ok(url) => url,
                Err(e) => {
                    return HealthStatus::Error {
                        latency: Duration::ZERO,
                        message: e.to_string(),
                    }
                }
            }
        };

        let client = get_http_client(&target.models_url);
        let mut request = client.get(url);
        if let Some(key) = &target.auth.api_key {
            request = request.bearer_auth(key);
        }

        let started = Instant::now();
        let response = match tokio::time::timeout(self.timeout, request.send()).await {
            Ok(Ok(response)) => response,
            Ok(Err(_)) => return HealthStatus::NotRunning,
            Err(_) => return HealthStatus::Timeout,
        };
        let latency = started.elapsed();

        let status = response.status();
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return HealthStatus::InvalidKey { latency };
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let preview: String = text.chars().take(300).collect();
            return HealthStatus::Error {
                latency,
                message: format!("HTTP {status}: {preview}"),
            };
        }

        let text = match response.text().await {
            Ok(text) => text,
            Err(_) => return HealthStatus::ParseError { latency },
        };
        let parsed: Value = match serde_json::from_str(&text) {
            Ok(v) => v,
            Err(_) => return HealthStatus::ParseError { latency },
        };

        let models: Vec<String> = parsed
            .get("data")
            .and_then(|v| v.as_array())
            .map(|arr| {
                arr.iter()
                    .filter_map(|m| m.get("id").and_then(|id| id.as_str()).map(str::to_string))
                    .take(MODEL_LIST_PREVIEW_CAP)
                    .collect()
            })
            .unwrap_or_default();

        if models.is_empty() {
            HealthStatus::RunningNoModels { latency }
        } else {
            HealthStatus::Ready { latency, models }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn missing_required_key_short_circuits_to_no_key() {
        let probe = HealthProbe::new(Duration::from_secs(1));
        let targets = vec![ProbeTarget {
            provider_key: "openai".to_string(),
            models_url: "https://api.openai.com/v1/models".to_string(),
            auth: ProviderAuth::default(),
            requires_key: true,
            loopback_only: false,
        }];
        let results = probe.check_health(&targets).await;
        assert_eq!(results.len(), 1);
        assert!(matches!(results[0].1, HealthStatus::NoKey));
    }

    #[tokio::test]
    async fn unreachable_local_target_reports_not_running() {
        let probe = HealthProbe::new(Duration::from_millis(200));
        let targets = vec![ProbeTarget {
            provider_key: "local".to_string(),
            // Port 1 is reserved and will not have a listener in the test sandbox.
            models_url: "http://127.0.0.1:1/v1/models".to_string(),
            auth: ProviderAuth::default(),
            requires_key: false,
            loopback_only: true,
        }];
        let results = probe.check_health(&targets).await;
        assert!(matches!(results[0].1, HealthStatus::NotRunning | HealthStatus::Timeout));
    }

    #[tokio::test]
    async fn loopback_guard_rejects_remote_target_for_local_provider() {
        let probe = HealthProbe::new(Duration::from_secs(1));
        let targets = vec![ProbeTarget {
            provider_key: "local".to_string(),
            models_url: "http://example.com/v1/models".to_string(),
            auth: ProviderAuth::default(),
            requires_key: false,
            loopback_only: true,
        }];
        let results = probe.check_health(&targets).await;
        assert!(matches!(results[0].1, HealthStatus::Error { .. }));
    }

    #[tokio::test]
    async fn probes_run_concurrently_not_sequentially() {
        let probe = HealthProbe::new(Duration::from_millis(300));
        let targets = vec![
            ProbeTarget {
                provider_key: "a".to_string(),
                models_url: "http://127.0.0.1:1/v1/models".to_string(),
                auth: ProviderAuth::default(),
                requires_key: false,
                loopback_only: true,
            },
            ProbeTarget {
                provider_key: "b".to_string(),
                models_url: "http://127.0.0.1:2/v1/models".to_string(),
                auth: ProviderAuth::default(),
                requires_key: false,
                loopback_only: true,
            },
        ];
        let started = Instant::now();
        let results = probe.check_health(&targets).await;
        // Two probes each allowed up to 300ms must not take ~600ms sequentially.
        assert!(started.elapsed() < Duration::from_millis(550));
        assert_eq!(results.len(), 2);
    }
}
