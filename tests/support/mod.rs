use occukey_rs::{KeygenConfig, KeygenTuning, LockingKeyService, MemoryTableStore, TableStore};
use std::sync::Arc;

/// The three in-memory tables shared by every "process" in a test.
#[allow(dead_code)]
pub struct SharedTables {
    pub lookup: Arc<MemoryTableStore>,
    pub counter: Arc<MemoryTableStore>,
    pub occurrence: Arc<MemoryTableStore>,
}

#[allow(dead_code)]
impl SharedTables {
    pub fn new() -> Self {
        Self {
            lookup: Arc::new(MemoryTableStore::new()),
            counter: Arc::new(MemoryTableStore::new()),
            occurrence: Arc::new(MemoryTableStore::new()),
        }
    }

    /// A service instance over these tables; each instance models one
    /// process with its own reserved counter window.
    pub fn service(&self, config: &KeygenConfig) -> LockingKeyService {
        LockingKeyService::with_tables(
            Arc::clone(&self.lookup) as Arc<dyn TableStore>,
            Arc::clone(&self.counter) as Arc<dyn TableStore>,
            Arc::clone(&self.occurrence) as Arc<dyn TableStore>,
            config,
        )
    }
}

/// Default config with retry waits short enough for contention tests.
#[allow(dead_code)]
pub fn fast_config() -> KeygenConfig {
    KeygenConfig {
        tuning: KeygenTuning {
            wait_before_retry_ms: 5,
            wait_skew_ms: 4,
            ..KeygenTuning::default()
        },
        ..KeygenConfig::default()
    }
}

/// Fast config with a default dataset scope configured.
#[allow(dead_code)]
pub fn fast_config_with_dataset(dataset_id: &str) -> KeygenConfig {
    fast_config().with_dataset_id(dataset_id)
}
