//! # Occukey
//!
//! Distributed allocation of stable integer occurrence keys over a
//! wide-column store.
//!
//! An occurrence record is identified by one or more composite natural-key
//! strings (a Darwin Core triplet, an `occurrenceID`, ...). All of them must
//! resolve to the same integer key, and a key never changes once allocated,
//! even when concurrent writers race to allocate overlapping subsets of the
//! same record's keys. The service coordinates those writers with an
//! optimistic per-row lock protocol with stale-lock takeover, and amortizes
//! the backend's throughput-limited counter with batched reservations.

pub mod backend;
pub mod config;
pub mod counter;
pub mod keys;
pub mod lock;
pub mod memory;
pub mod model;
pub mod persistence;

// Re-export main types for convenience
pub use backend::TableStore;
pub use config::{ConfigError, ConfigOverrides, KeygenConfig, KeygenTuning};
pub use lock::ConflictingKeysError;
pub use memory::MemoryTableStore;
pub use model::{KeyLookupResult, KeyStatus, OccurrenceKey};
pub use persistence::PersistentTables;

use crate::backend::{now_millis, DATASET_COLUMN, KEY_COLUMN};
use crate::counter::KeyCounter;
use crate::lock::LockEngine;
use anyhow::{anyhow, bail, Result};
use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;
use tracing::warn;

/// Main API for occurrence key allocation.
///
/// One instance per process; all operations are thread-safe behind `&self`.
/// Separate processes coordinate purely through the shared backend tables.
pub struct LockingKeyService {
    lookup: Arc<dyn TableStore>,
    occurrence: Arc<dyn TableStore>,
    counter: KeyCounter,
    engine: LockEngine,
    tuning: KeygenTuning,
    dataset_id: Option<String>,
}

impl LockingKeyService {
    /// Create a service over explicit backend tables.
    pub fn with_tables(
        lookup: Arc<dyn TableStore>,
        counter_table: Arc<dyn TableStore>,
        occurrence: Arc<dyn TableStore>,
        config: &KeygenConfig,
    ) -> Self {
        Self {
            engine: LockEngine::new(Arc::clone(&lookup), config.tuning.clone()),
            counter: KeyCounter::new(counter_table, config.tuning.batch_size),
            lookup,
            occurrence,
            tuning: config.tuning.clone(),
            dataset_id: config.dataset_id.clone(),
        }
    }

    /// Create a service over fresh in-memory tables.
    pub fn in_memory(config: &KeygenConfig) -> Self {
        Self::with_tables(
            Arc::new(MemoryTableStore::new()),
            Arc::new(MemoryTableStore::new()),
            Arc::new(MemoryTableStore::new()),
            config,
        )
    }

    /// Open a service over RocksDB-backed tables at `path`.
    pub fn open(path: impl AsRef<std::path::Path>, config: &KeygenConfig) -> Result<Self> {
        let tables = PersistentTables::open(path, config)?;
        Ok(Self::with_tables(
            tables.lookup,
            tables.counter,
            tables.occurrence,
            config,
        ))
    }

    /// Allocate, or converge on, the occurrence key for a set of natural-key
    /// strings within a scope. Returns the key and whether this call created
    /// it. Retries internally on lock contention; fails on conflicting
    /// already-allocated keys ([`ConflictingKeysError`]) without mutating
    /// key or status state.
    pub fn generate_key<I, S>(&self, unique_strings: I, scope: &str) -> Result<KeyLookupResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lookup_keys = keys::build_lookup_keys(unique_strings, scope);
        if lookup_keys.is_empty() {
            bail!("unique strings can't be empty");
        }
        self.engine.generate(&lookup_keys, &self.counter)
    }

    /// [`Self::generate_key`] against the configured default scope.
    pub fn generate_key_default<I, S>(&self, unique_strings: I) -> Result<KeyLookupResult>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.generate_key(unique_strings, self.default_scope()?)
    }

    /// Read-only lookup of the key for a set of natural-key strings.
    ///
    /// Returns `None` when no row carries a key yet. When some rows carry the
    /// agreed key and others carry none (a torn finalization), the missing
    /// key cells are filled in on the way out. Two rows carrying different
    /// keys are a fatal inconsistency.
    pub fn find_key<I, S>(&self, unique_strings: I, scope: &str) -> Result<Option<KeyLookupResult>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let lookup_keys = keys::build_lookup_keys(unique_strings, scope);
        if lookup_keys.is_empty() {
            return Ok(None);
        }

        let mut found_keys: BTreeMap<String, OccurrenceKey> = BTreeMap::new();
        let mut got_nulls = false;
        for lookup_key in &lookup_keys {
            match self.lookup.get_cell(lookup_key.as_bytes(), KEY_COLUMN)? {
                Some(raw) => {
                    let key = OccurrenceKey::from_slice(&raw).ok_or_else(|| {
                        anyhow!("lookup row [{lookup_key}] holds a malformed key cell")
                    })?;
                    found_keys.insert(lookup_key.clone(), key);
                }
                None => got_nulls = true,
            }
        }

        let mut result_key: Option<OccurrenceKey> = None;
        for key in found_keys.values() {
            match result_key {
                None => result_key = Some(*key),
                Some(previous) if previous != *key => {
                    return Err(ConflictingKeysError {
                        keys: found_keys.clone(),
                    }
                    .into());
                }
                Some(_) => {}
            }
        }

        let Some(key) = result_key else {
            return Ok(None);
        };
        if got_nulls {
            self.fill_missing_keys(&lookup_keys, &found_keys, key)?;
        }
        Ok(Some(KeyLookupResult::new(key, false)))
    }

    /// [`Self::find_key`] against the configured default scope.
    pub fn find_key_default<I, S>(&self, unique_strings: I) -> Result<Option<KeyLookupResult>>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.find_key(unique_strings, self.default_scope()?)
    }

    /// All occurrence keys reachable from lookup rows in a scope.
    pub fn find_keys_by_scope(&self, scope: &str) -> Result<HashSet<OccurrenceKey>> {
        let prefix = keys::build_key_prefix(scope).into_bytes();
        let mut found = HashSet::new();
        for (_, value) in self.scan_lookup(&prefix)? {
            if let Some(key) = value.as_deref().and_then(OccurrenceKey::from_slice) {
                found.insert(key);
            }
        }
        Ok(found)
    }

    /// [`Self::find_keys_by_scope`] against the configured default scope.
    pub fn find_keys_by_scope_default(&self) -> Result<HashSet<OccurrenceKey>> {
        self.find_keys_by_scope(self.default_scope()?)
    }

    /// Delete every lookup row pointing at `occurrence_key`.
    ///
    /// The scan is scoped to the record's dataset when one is known, falling
    /// back to the occurrence table's `datasetKey` cell. Without either this
    /// degrades to a full lookup-table scan.
    pub fn delete_key(&self, occurrence_key: OccurrenceKey, scope: Option<&str>) -> Result<()> {
        let scope = match scope {
            Some(scope) => Some(scope.to_string()),
            None => self.dataset_for(occurrence_key)?,
        };
        let prefix = match scope {
            Some(scope) => keys::build_key_prefix(&scope).into_bytes(),
            None => {
                warn!(
                    key = %occurrence_key,
                    "about to scan lookup table with no scope prefix"
                );
                Vec::new()
            }
        };

        let target = occurrence_key.to_bytes();
        let rows_to_delete: Vec<Vec<u8>> = self
            .scan_lookup(&prefix)?
            .into_iter()
            .filter(|(_, value)| value.as_deref() == Some(target.as_slice()))
            .map(|(row, _)| row)
            .collect();
        if !rows_to_delete.is_empty() {
            self.lookup.delete_rows(&rows_to_delete)?;
        }
        Ok(())
    }

    /// [`Self::delete_key`] scoped by the configured default scope, if any.
    pub fn delete_key_default(&self, occurrence_key: OccurrenceKey) -> Result<()> {
        self.delete_key(occurrence_key, self.dataset_id.as_deref())
    }

    /// Delete exactly the lookup rows derived from the given natural-key
    /// strings.
    pub fn delete_key_by_uniques<I, S>(&self, unique_strings: I, scope: &str) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let rows: Vec<Vec<u8>> = keys::build_lookup_keys(unique_strings, scope)
            .into_iter()
            .map(String::into_bytes)
            .collect();
        if !rows.is_empty() {
            self.lookup.delete_rows(&rows)?;
        }
        Ok(())
    }

    /// [`Self::delete_key_by_uniques`] against the configured default scope.
    pub fn delete_key_by_uniques_default<I, S>(&self, unique_strings: I) -> Result<()>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.delete_key_by_uniques(unique_strings, self.default_scope()?)
    }

    fn default_scope(&self) -> Result<&str> {
        self.dataset_id
            .as_deref()
            .ok_or_else(|| anyhow!("no default dataset id configured"))
    }

    /// Dataset of an occurrence, read from the occurrence table.
    fn dataset_for(&self, occurrence_key: OccurrenceKey) -> Result<Option<String>> {
        let raw = self
            .occurrence
            .get_cell(&occurrence_key.to_bytes(), DATASET_COLUMN)?;
        raw.map(|bytes| {
            String::from_utf8(bytes)
                .map_err(|_| anyhow!("occurrence [{occurrence_key}] holds a malformed dataset cell"))
        })
        .transpose()
    }

    /// Write the agreed key onto rows that lost theirs in a torn write. Only
    /// the key cell is restored; status stays as the next allocation leaves it.
    fn fill_missing_keys(
        &self,
        lookup_keys: &BTreeSet<String>,
        found_keys: &BTreeMap<String, OccurrenceKey>,
        key: OccurrenceKey,
    ) -> Result<()> {
        let now = now_millis();
        for lookup_key in lookup_keys {
            if !found_keys.contains_key(lookup_key) {
                self.lookup
                    .put_cell(lookup_key.as_bytes(), KEY_COLUMN, &key.to_bytes(), now)?;
            }
        }
        Ok(())
    }

    /// Drain a paged prefix scan of the lookup table's key column.
    fn scan_lookup(&self, prefix: &[u8]) -> Result<Vec<(Vec<u8>, Option<Vec<u8>>)>> {
        let page_size = self.tuning.scan_batch_size.max(1);
        let mut all = Vec::new();
        let mut cursor: Option<Vec<u8>> = None;
        loop {
            let page = self
                .lookup
                .scan_prefix(prefix, KEY_COLUMN, cursor.as_deref(), page_size)?;
            let page_len = page.len();
            if let Some((row, _)) = page.last() {
                cursor = Some(row.clone());
            }
            all.extend(page);
            if page_len < page_size {
                return Ok(all);
            }
        }
    }
}
