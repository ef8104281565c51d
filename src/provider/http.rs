//! Shared, pooled HTTP clients keyed by base URL, grounded in
//! `cloudllm::clients::http_pool` and `cloudllm::clients::common::get_shared_http_client`.
//! Reusing a client per base URL amortizes TLS/DNS/keep-alive across repeated calls to
//! the same provider.

use lazy_static::lazy_static;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

lazy_static! {
    static ref HTTP_CLIENT_POOL: Mutex<HashMap<String, reqwest::Client>> = Mutex::new(HashMap::new());
}

fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .pool_idle_timeout(Duration::from_secs(90))
        .pool_max_idle_per_host(8)
        .tcp_keepalive(Duration::from_secs(60))
        .connect_timeout(Duration::from_secs(10))
        .build()
        .expect("reqwest client configuration is always valid")
}

/// Returns the pooled client for `base_url`, constructing and caching one on first use.
pub fn get_http_client(base_url: &str) -> reqwest::Client {
    let mut pool = HTTP_CLIENT_POOL.lock().expect("http client pool mutex poisoned");
    pool.entry(base_url.to_string()).or_insert_with(build_client).clone()
}
