//! Per-endpoint circuit breaker: closed/open/half-open with cooldown and
//! success/failure counters, per SPEC_FULL §4.7. Keys are endpoint-qualified
//! (`chat_completions:<provider>`), never provider-qualified alone, per the design
//! note that a chat-completions failure must not open a circuit for model-listing
//! probes.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CircuitPhase {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug, Clone)]
pub struct CircuitState {
    pub phase: CircuitPhase,
    pub consecutive_failures: u32,
    pub last_failure: Option<DateTime<Utc>>,
    pub cooldown_deadline: Option<DateTime<Utc>>,
    pub cooldown: Duration,
    pub last_success_duration: Option<Duration>,
}

impl CircuitState {
    fn new(base_cooldown: Duration) -> Self {
        CircuitState {
            phase: CircuitPhase::Closed,
            consecutive_failures: 0,
            last_failure: None,
            cooldown_deadline: None,
            cooldown: base_cooldown,
            last_success_duration: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Admission {
    Allowed,
    Denied { cooldown_remaining: Duration },
}

pub struct ProviderHealthAuthority {
    states: RwLock<HashMap<String, CircuitState>>,
    failure_threshold: u32,
    base_cooldown: Duration,
    max_cooldown: Duration,
    backoff_factor: f64,
}

impl ProviderHealthAuthority {
    pub fn new(failure_threshold: u32, base_cooldown: Duration, max_cooldown: Duration, backoff_factor: f64) -> Self {
        ProviderHealthAuthority {
            states: RwLock::new(HashMap::new()),
            failure_threshold,
            base_cooldown,
            max_cooldown,
            backoff_factor,
        }
    }

    pub fn from_config(config: &crate::config::ReverieConfig) -> Self {
        Self::new(
            config.circuit_failure_threshold,
            config.circuit_base_cooldown,
            config.circuit_max_cooldown,
            config.circuit_backoff_factor,
        )
    }

    /// Checks (and, for a just-elapsed cooldown, transitions) admission for `key`.
    pub async fn can_execute(&self, key: &str) -> Admission {
        let mut states = self.states.write().await;
        let state = states.entry(key.to_string()).or_insert_with(|| CircuitState::new(self.base_cooldown));

        match state.phase {
            CircuitPhase::Closed => Admission::Allowed,
            CircuitPhase::HalfOpen => Admission::Allowed,
            CircuitPhase::Open => {
                let now = Utc::now();
                let deadline = state.cooldown_deadline.unwrap_or(now);
                if now >= deadline {
                    state.phase = CircuitPhase::HalfOpen;
                    Admission::Allowed
                } else {
                    let remaining = (deadline - now).to_std().unwrap_or_default();
                    Admission::Denied {
                        cooldown_remaining: remaining,
                    }
                }
            }
        }
    }

    pub async fn record_success(&self, key: &str, duration: Duration) {
        let mut states = self.states.write().await;
        let state = states.entry(key.to_string()).or_insert_with(|| CircuitState::new(self.base_cooldown));
        state.last_success_duration = Some(duration);
        state.consecutive_failures = 0;
        state.phase = CircuitPhase::Closed;
        state.cooldown = self.base_cooldown;
        state.cooldown_deadline = None;
    }

    pub async fn record_failure(&self, key: &str) {
        let mut states = self.states.write().await;
        let state = states.entry(key.to_string()).or_insert_with(|| CircuitState::new(self.base_cooldown));
        state.last_failure = Some(Utc::now());

        match state.phase {
            CircuitPhase::HalfOpen => {
                // A half-open probe failure reopens with an extended, bounded cooldown.
                let extended = Duration::from_secs_f64((state.cooldown.as_secs_f64() * self.backoff_factor).min(self.max_cooldown.as_secs_f64()));
                state.cooldown = extended;
                state.phase = CircuitPhase::Open;
                state.cooldown_deadline = Some(Utc::now() + chrono::Duration::from_std(extended).unwrap_or_default());
            }
            CircuitPhase::Closed => {
                state.consecutive_failures += 1;
                if state.consecutive_failures >= self.failure_threshold {
                    state.phase = CircuitPhase::Open;
                    state.cooldown = self.base_cooldown;
                    state.cooldown_deadline = Some(Utc::now() + chrono::Duration::from_std(self.base_cooldown).unwrap_or_default());
                }
            }
            CircuitPhase::Open => {
                // Already open; a failure here just confirms the state.
            }
        }
    }

    pub async fn snapshot(&self, key: &str) -> Option<CircuitState> {
        self.states.read().await.get(key).cloned()
    }
}
