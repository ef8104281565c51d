//! Lazy, single-flight async module loader with sync existence probes.

use crate::errors::{ReverieError, Result};
use futures_util::future::Shared;
use futures_util::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::Mutex;

type LoaderFn<T> = Arc<dyn Fn() -> Pin<Box<dyn Future<Output = std::result::Result<T, String>> + Send>> + Send + Sync>;
type SharedLoad<T> = Shared<Pin<Box<dyn Future<Output = std::result::Result<T, String>> + Send>>>;

enum Slot<T> {
    Loaded(T),
    Pending(SharedLoad<T>),
}

/// Registers named zero-argument loaders and memoizes their results, collapsing
/// concurrent callers of the same not-yet-loaded name into a single in-flight load.
pub struct ModuleRegistry<T: Clone + Send + Sync + 'static> {
    loaders: Mutex<HashMap<String, LoaderFn<T>>>,
    slots: Mutex<HashMap<String, Slot<T>>>,
}

impl<T: Clone + Send + Sync + 'static> Default for ModuleRegistry<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> ModuleRegistry<T> {
    pub fn new() -> Self {
        ModuleRegistry {
            loaders: Mutex::new(HashMap::new()),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn register<F, Fut>(&self, name: impl Into<String>, loader: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = std::result::Result<T, String>> + Send + 'static,
    {
        let boxed: LoaderFn<T> = Arc::new(move || Box::pin(loader()));
        self.loaders.lock().await.insert(name.into(), boxed);
    }

    /// Synchronous probe: true only if a value is already cached (not merely in-flight).
    pub async fn is_loaded(&self, name: &str) -> bool {
        matches!(self.slots.lock().await.get(name), Some(Slot::Loaded(_)))
    }

    pub async fn get_module(&self, name: &str) -> Result<T> {
        // Fast path: already cached.
        {
            let slots = self.slots.lock().await;
            if let Some(Slot::Loaded(value)) = slots.get(name) {
                return Ok(value.clone());
            }
        }

        // Single-flight: reuse an in-flight load if one exists.
        let shared = {
            let mut slots = self.slots.lock().await;
            match slots.get(name) {
                Some(Slot::Loaded(value)) => return Ok(value.clone()),
                Some(Slot::Pending(shared)) => shared.clone(),
                None => {
                    let loader = {
                        let loaders = self.loaders.lock().await;
                        loaders
                            .get(name)
                            .cloned()
                            .ok_or_else(|| ReverieError::validation(format!("no loader registered for '{name}'")))?
                    };
                    let fut: Pin<Box<dyn Future<Output = std::result::Result<T, String>> + Send>> = loader();
                    let shared: SharedLoad<T> = fut.shared();
                    slots.insert(name.to_string(), Slot::Pending(shared.clone()));
                    shared
                }
            }
        };

        match shared.await {
            Ok(value) => {
                let mut slots = self.slots.lock().await;
                slots.insert(name.to_string(), Slot::Loaded(value.clone()));
                Ok(value)
            }
            Err(message) => {
                // Evict the pending entry on failure so a future call retries.
                let mut slots = self.slots.lock().await;
                slots.remove(name);
                Err(ReverieError::validation(message))
            }
        }
    }

    /// Best-effort bulk preload: individual failures are swallowed and do not
    /// short-circuit the others.
    pub async fn preload_modules(&self, names: &[String]) {
        let mut handles = Vec::new();
        for name in names {
            let name = name.clone();
            handles.push(async move {
                let _ = self.get_module(&name).await;
            });
        }
        futures_util::future::join_all(handles).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test]
    async fn caches_after_first_load() {
        let registry: ModuleRegistry<u32> = ModuleRegistry::new();
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        registry
            .register("mod_a", move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(42)
                }
            })
            .await;

        assert_eq!(registry.get_module("mod_a").await.unwrap(), 42);
        assert_eq!(registry.get_module("mod_a").await.unwrap(), 42);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(registry.is_loaded("mod_a").await);
    }

    #[tokio::test]
    async fn concurrent_callers_single_flight() {
        let registry = Arc::new(ModuleRegistry::<u32>::new());
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();
        registry
            .register("mod_b", move || {
                let calls = calls_clone.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(7)
                }
            })
            .await;

        let r1 = registry.clone();
        let r2 = registry.clone();
        let (a, b) = tokio::join!(
            tokio::spawn(async move { r1.get_module("mod_b").await }),
            tokio::spawn(async move { r2.get_module("mod_b").await }),
        );
        assert_eq!(a.unwrap().unwrap(), 7);
        assert_eq!(b.unwrap().unwrap(), 7);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn failure_evicts_pending_entry() {
        let registry: ModuleRegistry<u32> = ModuleRegistry::new();
        registry
            .register("mod_c", || async { Err("boom".to_string()) })
            .await;
        assert!(registry.get_module("mod_c").await.is_err());
        assert!(!registry.is_loaded("mod_c").await);
    }

    #[tokio::test]
    async fn preload_does_not_short_circuit_on_failure() {
        let registry: ModuleRegistry<u32> = ModuleRegistry::new();
        registry.register("ok", || async { Ok(1) }).await;
        registry
            .register("bad", || async { Err("nope".to_string()) })
            .await;
        registry
            .preload_modules(&["ok".to_string(), "bad".to_string()])
            .await;
        assert!(registry.is_loaded("ok").await);
        assert!(!registry.is_loaded("bad").await);
    }
}
