pub mod entry;
pub mod foyer_cache;
pub mod moka_cache;
pub mod sled_store;

pub use entry::StoredEntry;
pub use foyer_cache::FoyerStore;
pub use moka_cache::MokaStore;
pub use sled_store::SledStore;

use hoard::domain::StoreConfig;
use hoard::ports::{CacheStore, StorageFactory};
use shared::Result;
use shared::config::BackendKind;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

/// Directory used for sled stores when the config names none
pub const DEFAULT_DATA_DIR: &str = "./data";

/// Builds whichever backend a [`StoreConfig`] asks for
#[derive(Clone, Copy, Debug, Default)]
pub struct UnifiedStorageFactory;

impl UnifiedStorageFactory {
    pub fn new() -> Self {
        Self
    }

    fn sled_path(config: &StoreConfig) -> PathBuf {
        let dir = config.data_dir.as_deref().unwrap_or(DEFAULT_DATA_DIR);
        PathBuf::from(dir).join(format!("{}.sled", config.name))
    }
}

impl StorageFactory for UnifiedStorageFactory {
    fn create_from_config(&self, config: &StoreConfig) -> Result<Arc<dyn CacheStore>> {
        let store: Arc<dyn CacheStore> = match config.backend {
            BackendKind::Moka => Arc::new(MokaStore::new(config.name.clone(), config.max_entries)),
            BackendKind::Foyer => Arc::new(FoyerStore::new(config.name.clone(), config.mem_bytes)),
            BackendKind::Sled => {
                let path = Self::sled_path(config);
                info!("Opening sled store at {}", path.display());
                Arc::new(SledStore::open(path)?)
            }
        };

        info!("Created '{}' store on {:?} backend", config.name, config.backend);
        Ok(store)
    }
}
