//! Application state.

use std::sync::Arc;

use tracing::{info, warn};

use vconv_models::TaskStatus;
use vconv_queue::{Clock, Coordinator, SystemClock};
use vconv_store::{Store, StoreConfig, StoreResult};

use crate::config::ApiConfig;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub store: Arc<dyn Store>,
    pub clock: Arc<dyn Clock>,
    pub core: Coordinator,
}

impl AppState {
    /// Create new application state, opening the configured store.
    pub async fn new(config: ApiConfig, store_config: &StoreConfig) -> StoreResult<Self> {
        let store = vconv_store::open(store_config).await?;
        info!(backend = ?store_config.backend, "Store ready");
        Ok(Self::with_store(config, store, Arc::new(SystemClock)))
    }

    /// Build state around an existing store and clock.
    pub fn with_store(config: ApiConfig, store: Arc<dyn Store>, clock: Arc<dyn Clock>) -> Self {
        let core = Coordinator::new(store.clone(), clock.clone());
        Self {
            config,
            store,
            clock,
            core,
        }
    }

    /// Shutdown hook. Reports the work still in flight; assigned tasks stay
    /// with their machines across restarts.
    pub async fn shutdown(&self) {
        match self.core.fleet.task_stats().await {
            Ok(stats) => info!(
                waiting = stats.get(TaskStatus::Waiting),
                active = stats.active(),
                "Coordinator stopping"
            ),
            Err(e) => warn!("Could not read task stats at shutdown: {}", e),
        }
    }
}
