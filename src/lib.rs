//! A browser-resident personal music-history analyzer core: ingestion, provider
//! routing/resilience, and cross-tab session coordination, with no I/O surface of its
//! own beyond the traits it programs against ([`storage::Storage`], [`event::EventHandler`]).

pub mod chat;
pub mod config;
pub mod errors;
pub mod event;
pub mod functions;
pub mod ingestion;
pub mod lock;
pub mod model;
pub mod module_registry;
pub mod provider;
pub mod safe_mode;
pub mod storage;
pub mod tab_coordinator;
pub mod url_params;

pub use chat::ChatOrchestrator;
pub use config::ReverieConfig;
pub use errors::{ReverieError, Result};
pub use ingestion::IngestionController;
pub use lock::OperationLock;
pub use module_registry::ModuleRegistry;
pub use provider::ProviderRouter;
pub use tab_coordinator::TabCoordinator;

/// Initializes `env_logger` from the `RUST_LOG` environment variable, defaulting to
/// `info` when unset. Call once at process/session startup; safe to call more than
/// once, subsequent calls are no-ops.
pub fn init_logger() {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .try_init();
}
