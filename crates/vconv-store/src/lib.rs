//! Durable store for the vconv coordinator.
//!
//! This crate provides:
//! - The [`Store`] trait, the single synchronization point of the system
//! - [`InMemoryStore`] for tests and single-process development
//! - [`RedisStore`] for production, with every conditional update in a Lua script

pub mod config;
pub mod error;
pub mod memory;
pub mod redis_store;
pub mod store;

pub use config::{StoreBackend, StoreConfig};
pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStore;
pub use redis_store::RedisStore;
pub use store::{ClaimOutcome, DeleteOutcome, OverrideOutcome, Store, TransitionOutcome};

use std::sync::Arc;

/// Open the store selected by `config`.
pub async fn open(config: &StoreConfig) -> StoreResult<Arc<dyn Store>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(InMemoryStore::new())),
        StoreBackend::Redis => {
            let store = RedisStore::new(&config.redis_url, &config.key_prefix)?;
            store.ping().await?;
            Ok(Arc::new(store))
        }
    }
}
