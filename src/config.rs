//! Crate configuration.
//!
//! A plain struct with a `Default` impl and `with_*` builder methods, no config-file
//! parsing dependency — mirroring how the teacher's client config is constructed.

use std::time::Duration;

#[derive(Debug, Clone)]
pub struct ReverieConfig {
    /// Maximum accepted upload size in bytes (S5: 500 MiB default).
    pub max_upload_bytes: u64,
    /// Default chunk bucket width.
    pub default_bucket_type: crate::model::BucketType,
    /// Default wait when `acquire` is called with `wait_ms: None`.
    pub lock_default_wait: Duration,
    /// Consecutive failures before the circuit breaker opens.
    pub circuit_failure_threshold: u32,
    /// Base cooldown once a circuit opens.
    pub circuit_base_cooldown: Duration,
    /// Cap on cooldown growth through repeated half-open failures.
    pub circuit_max_cooldown: Duration,
    /// Multiplier applied to cooldown on a half-open -> open transition.
    pub circuit_backoff_factor: f64,
    /// Timeout for a single cloud provider call.
    pub cloud_request_timeout: Duration,
    /// Timeout for a single local/loopback provider call.
    pub local_request_timeout: Duration,
    /// Timeout for health probes.
    pub health_probe_timeout: Duration,
    /// Max retry attempts (not counting rate-limit sleeps, which don't consume budget).
    pub max_retries: u32,
    /// Max size of the adapter's streaming line buffer before BackpressureOverflow.
    pub stream_buffer_cap_bytes: usize,
    /// Heartbeat interval for tab liveness records.
    pub tab_heartbeat_interval: Duration,
    /// A liveness record older than this many heartbeats is considered stale.
    pub tab_staleness_multiple: u32,
    /// Memory usage ratio (0.0-1.0) above which the parser pauses and throttles.
    pub memory_high_water_mark: f64,
    /// Memory usage ratio below which throttling is cleared.
    pub memory_low_water_mark: f64,
}

impl Default for ReverieConfig {
    fn default() -> Self {
        ReverieConfig {
            max_upload_bytes: 500 * 1024 * 1024,
            default_bucket_type: crate::model::BucketType::Weekly,
            lock_default_wait: Duration::from_secs(0),
            circuit_failure_threshold: 3,
            circuit_base_cooldown: Duration::from_secs(5),
            circuit_max_cooldown: Duration::from_secs(60),
            circuit_backoff_factor: 2.0,
            cloud_request_timeout: Duration::from_secs(60),
            local_request_timeout: Duration::from_secs(120),
            health_probe_timeout: Duration::from_secs(5),
            max_retries: 3,
            stream_buffer_cap_bytes: 1024 * 1024,
            tab_heartbeat_interval: Duration::from_secs(2),
            tab_staleness_multiple: 3,
            memory_high_water_mark: 0.85,
            memory_low_water_mark: 0.60,
        }
    }
}

impl ReverieConfig {
    pub fn with_max_upload_bytes(mut self, bytes: u64) -> Self {
        self.max_upload_bytes = bytes;
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn with_circuit_failure_threshold(mut self, n: u32) -> Self {
        self.circuit_failure_threshold = n;
        self
    }

    pub fn with_default_bucket_type(mut self, bucket: crate::model::BucketType) -> Self {
        self.default_bucket_type = bucket;
        self
    }
}
