//! # RocksDB Backend
//!
//! An embedded, durable `TableStore` implementation. Each logical table maps
//! to a column family; each row is stored as one bincode-encoded cell map
//! under its row key, which keeps read-modify-write operations (CAS,
//! increment, cell delete) simple to serialize behind the write mutex.
//!
//! RocksDB does not assign server-side cell timestamps, so cells carry the
//! caller-supplied clock. Writers sharing a database are assumed to have
//! loosely synchronized clocks; the stale-lock threshold is minutes, far
//! above realistic skew for co-located processes.

use crate::backend::{Cell, Row, TableStore};
use crate::config::KeygenConfig;
use anyhow::{anyhow, bail, Result};
use parking_lot::Mutex;
use rocksdb::{ColumnFamilyDescriptor, Direction, IteratorMode, Options, WriteBatch, DB};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

const CF_METADATA: &str = "metadata";
const KEY_MANIFEST: &[u8] = b"manifest";
const STORAGE_FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct StorageManifest {
    format_version: u32,
    app_version: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct StoredCell {
    value: Vec<u8>,
    timestamp: i64,
}

type StoredRow = HashMap<String, StoredCell>;

/// The three logical tables of one occurrence key store, sharing a database.
pub struct PersistentTables {
    pub lookup: Arc<RocksTableStore>,
    pub counter: Arc<RocksTableStore>,
    pub occurrence: Arc<RocksTableStore>,
}

impl PersistentTables {
    /// Open (or create) the database at `path` with one column family per
    /// configured table name.
    pub fn open(path: impl AsRef<Path>, config: &KeygenConfig) -> Result<Self> {
        let mut options = Options::default();
        options.create_if_missing(true);
        options.create_missing_column_families(true);

        let cfs = vec![
            ColumnFamilyDescriptor::new(&config.lookup_table, Options::default()),
            ColumnFamilyDescriptor::new(&config.counter_table, Options::default()),
            ColumnFamilyDescriptor::new(&config.occurrence_table, Options::default()),
            ColumnFamilyDescriptor::new(CF_METADATA, Options::default()),
        ];
        let db = Arc::new(DB::open_cf_descriptors(&options, path, cfs)?);
        validate_or_init_manifest(&db)?;

        let write_lock = Arc::new(Mutex::new(()));
        Ok(Self {
            lookup: Arc::new(RocksTableStore::new(
                Arc::clone(&db),
                config.lookup_table.clone(),
                Arc::clone(&write_lock),
            )),
            counter: Arc::new(RocksTableStore::new(
                Arc::clone(&db),
                config.counter_table.clone(),
                Arc::clone(&write_lock),
            )),
            occurrence: Arc::new(RocksTableStore::new(
                db,
                config.occurrence_table.clone(),
                write_lock,
            )),
        })
    }
}

/// One wide-column table over a RocksDB column family.
pub struct RocksTableStore {
    db: Arc<DB>,
    cf_name: String,
    /// Serializes read-modify-write operations across all tables of the
    /// database; plain reads go straight to RocksDB.
    write_lock: Arc<Mutex<()>>,
}

impl RocksTableStore {
    fn new(db: Arc<DB>, cf_name: String, write_lock: Arc<Mutex<()>>) -> Self {
        Self {
            db,
            cf_name,
            write_lock,
        }
    }

    fn cf(&self) -> Result<&rocksdb::ColumnFamily> {
        self.db
            .cf_handle(&self.cf_name)
            .ok_or_else(|| anyhow!("missing column family [{}]", self.cf_name))
    }

    fn load_row(&self, row: &[u8]) -> Result<Option<StoredRow>> {
        let cf = self.cf()?;
        match self.db.get_cf(cf, row)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        }
    }

    fn save_row(&self, row: &[u8], cells: &StoredRow) -> Result<()> {
        let cf = self.cf()?;
        if cells.is_empty() {
            self.db.delete_cf(cf, row)?;
        } else {
            self.db.put_cf(cf, row, bincode::serialize(cells)?)?;
        }
        Ok(())
    }
}

impl TableStore for RocksTableStore {
    fn get_row(&self, row: &[u8]) -> Result<Option<Row>> {
        Ok(self.load_row(row)?.map(|cells| {
            cells
                .into_iter()
                .map(|(column, cell)| (column, Cell::new(cell.value, cell.timestamp)))
                .collect()
        }))
    }

    fn get_cell(&self, row: &[u8], column: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .load_row(row)?
            .and_then(|mut cells| cells.remove(column))
            .map(|cell| cell.value))
    }

    fn put_cell(&self, row: &[u8], column: &str, value: &[u8], timestamp: i64) -> Result<()> {
        let _guard = self.write_lock.lock();
        let mut cells = self.load_row(row)?.unwrap_or_default();
        cells.insert(
            column.to_string(),
            StoredCell {
                value: value.to_vec(),
                timestamp,
            },
        );
        self.save_row(row, &cells)
    }

    fn check_and_put(
        &self,
        row: &[u8],
        column: &str,
        value: &[u8],
        expected_column: &str,
        expected: Option<&[u8]>,
        timestamp: i64,
    ) -> Result<bool> {
        let _guard = self.write_lock.lock();
        let mut cells = self.load_row(row)?.unwrap_or_default();
        let current = cells.get(expected_column).map(|cell| cell.value.as_slice());
        if current != expected {
            return Ok(false);
        }
        cells.insert(
            column.to_string(),
            StoredCell {
                value: value.to_vec(),
                timestamp,
            },
        );
        self.save_row(row, &cells)?;
        Ok(true)
    }

    fn increment(&self, row: &[u8], column: &str, delta: i64) -> Result<i64> {
        let _guard = self.write_lock.lock();
        let mut cells = self.load_row(row)?.unwrap_or_default();
        let current = match cells.get(column) {
            Some(cell) => {
                let arr: [u8; 8] = cell
                    .value
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow!("counter cell is not an 8-byte integer"))?;
                i64::from_be_bytes(arr)
            }
            None => 0,
        };
        let Some(next) = current.checked_add(delta) else {
            bail!("counter overflow incrementing by {delta}");
        };
        cells.insert(
            column.to_string(),
            StoredCell {
                value: next.to_be_bytes().to_vec(),
                timestamp: crate::backend::now_millis(),
            },
        );
        self.save_row(row, &cells)?;
        Ok(next)
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        column: &str,
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Option<Vec<u8>>)>> {
        let cf = self.cf()?;
        let start = start_after.unwrap_or(prefix);
        let iter = self
            .db
            .iterator_cf(cf, IteratorMode::From(start, Direction::Forward));

        let mut page = Vec::new();
        for entry in iter {
            let (row, bytes) = entry?;
            if let Some(after) = start_after {
                if row.as_ref() == after {
                    continue;
                }
            }
            if !row.starts_with(prefix) {
                break;
            }
            let cells: StoredRow = bincode::deserialize(&bytes)?;
            page.push((
                row.to_vec(),
                cells.get(column).map(|cell| cell.value.clone()),
            ));
            if page.len() == limit {
                break;
            }
        }
        Ok(page)
    }

    fn delete_rows(&self, rows: &[Vec<u8>]) -> Result<()> {
        let _guard = self.write_lock.lock();
        let cf = self.cf()?;
        let mut batch = WriteBatch::default();
        for row in rows {
            batch.delete_cf(cf, row);
        }
        self.db.write(batch)?;
        Ok(())
    }

    fn delete_cell(&self, row: &[u8], column: &str) -> Result<()> {
        let _guard = self.write_lock.lock();
        if let Some(mut cells) = self.load_row(row)? {
            cells.remove(column);
            self.save_row(row, &cells)?;
        }
        Ok(())
    }
}

fn validate_or_init_manifest(db: &DB) -> Result<()> {
    let metadata_cf = db
        .cf_handle(CF_METADATA)
        .ok_or_else(|| anyhow!("missing metadata column family"))?;
    if let Some(bytes) = db.get_cf(metadata_cf, KEY_MANIFEST)? {
        let manifest: StorageManifest = bincode::deserialize(&bytes)?;
        if manifest.format_version != STORAGE_FORMAT_VERSION {
            return Err(anyhow!(
                "storage format version mismatch: expected {}, found {}",
                STORAGE_FORMAT_VERSION,
                manifest.format_version
            ));
        }
        return Ok(());
    }

    let manifest = StorageManifest {
        format_version: STORAGE_FORMAT_VERSION,
        app_version: env!("CARGO_PKG_VERSION").to_string(),
    };
    db.put_cf(metadata_cf, KEY_MANIFEST, bincode::serialize(&manifest)?)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{counter_row_key, COUNTER_COLUMN};

    fn open_tables(dir: &tempfile::TempDir) -> PersistentTables {
        PersistentTables::open(dir.path(), &KeygenConfig::default()).unwrap()
    }

    #[test]
    fn test_cells_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tables = open_tables(&dir);
            tables.lookup.put_cell(b"ds|a", "k", &7i32.to_be_bytes(), 42).unwrap();
        }
        let tables = open_tables(&dir);
        assert_eq!(
            tables.lookup.get_cell(b"ds|a", "k").unwrap(),
            Some(7i32.to_be_bytes().to_vec())
        );
        let row = tables.lookup.get_row(b"ds|a").unwrap().unwrap();
        assert_eq!(row.get("k").unwrap().timestamp, 42);
    }

    #[test]
    fn test_counter_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        {
            let tables = open_tables(&dir);
            assert_eq!(
                tables.counter.increment(&counter_row_key(), COUNTER_COLUMN, 100).unwrap(),
                100
            );
        }
        let tables = open_tables(&dir);
        assert_eq!(
            tables.counter.increment(&counter_row_key(), COUNTER_COLUMN, 100).unwrap(),
            200
        );
    }

    #[test]
    fn test_check_and_put_against_absent_cell() {
        let dir = tempfile::tempdir().unwrap();
        let tables = open_tables(&dir);
        assert!(tables
            .lookup
            .check_and_put(b"r", "lock", b"tok", "lock", None, 1)
            .unwrap());
        assert!(!tables
            .lookup
            .check_and_put(b"r", "lock", b"tok2", "lock", None, 2)
            .unwrap());
    }

    #[test]
    fn test_scan_prefix_pages() {
        let dir = tempfile::tempdir().unwrap();
        let tables = open_tables(&dir);
        for name in ["ds|a", "ds|b", "ds|c", "zz|x"] {
            tables.lookup.put_cell(name.as_bytes(), "k", b"v", 1).unwrap();
        }
        let first = tables.lookup.scan_prefix(b"ds|", "k", None, 2).unwrap();
        assert_eq!(first.len(), 2);
        let second = tables
            .lookup
            .scan_prefix(b"ds|", "k", Some(&first[1].0), 2)
            .unwrap();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].0, b"ds|c".to_vec());
    }
}
