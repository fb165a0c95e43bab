//! # In-Memory Backend
//!
//! A `TableStore` over a `BTreeMap`, used by the test suites and for
//! embedded single-process deployments. All mutations of a table share one
//! mutex, which makes `check_and_put` and `increment` trivially atomic.

use crate::backend::{now_millis, Cell, Row, TableStore};
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::collections::BTreeMap;

/// In-memory wide-column table. Rows are kept ordered so prefix scans come
/// back in row-key order, matching the contract of the persistent backends.
#[derive(Default)]
pub struct MemoryTableStore {
    rows: Mutex<BTreeMap<Vec<u8>, Row>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of rows currently stored. Test-facing.
    pub fn row_count(&self) -> usize {
        self.rows.lock().len()
    }
}

impl TableStore for MemoryTableStore {
    fn get_row(&self, row: &[u8]) -> Result<Option<Row>> {
        Ok(self.rows.lock().get(row).cloned())
    }

    fn get_cell(&self, row: &[u8], column: &str) -> Result<Option<Vec<u8>>> {
        Ok(self
            .rows
            .lock()
            .get(row)
            .and_then(|cells| cells.get(column))
            .map(|cell| cell.value.clone()))
    }

    fn put_cell(&self, row: &[u8], column: &str, value: &[u8], timestamp: i64) -> Result<()> {
        let mut rows = self.rows.lock();
        rows.entry(row.to_vec())
            .or_default()
            .insert(column.to_string(), Cell::new(value.to_vec(), timestamp));
        Ok(())
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
        let mut rows = self.rows.lock();
        let current = rows
            .get(row)
            .and_then(|cells| cells.get(expected_column))
            .map(|cell| cell.value.as_slice());
        if current != expected {
            return Ok(false);
        }
        rows.entry(row.to_vec())
            .or_default()
            .insert(column.to_string(), Cell::new(value.to_vec(), timestamp));
        Ok(true)
    }

    fn increment(&self, row: &[u8], column: &str, delta: i64) -> Result<i64> {
        let mut rows = self.rows.lock();
        let cells = rows.entry(row.to_vec()).or_default();
        let current = match cells.get(column) {
            Some(cell) => {
                let arr: [u8; 8] = cell
                    .value
                    .as_slice()
                    .try_into()
                    .map_err(|_| anyhow::anyhow!("counter cell is not an 8-byte integer"))?;
                i64::from_be_bytes(arr)
            }
            None => 0,
        };
        let Some(next) = current.checked_add(delta) else {
            bail!("counter overflow incrementing by {delta}");
        };
        cells.insert(
            column.to_string(),
            Cell::new(next.to_be_bytes().to_vec(), now_millis()),
        );
        Ok(next)
    }

    fn scan_prefix(
        &self,
        prefix: &[u8],
        column: &str,
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Option<Vec<u8>>)>> {
        use std::ops::Bound;

        let rows = self.rows.lock();
        let start = match start_after {
            Some(after) if after >= prefix => Bound::Excluded(after.to_vec()),
            _ => Bound::Included(prefix.to_vec()),
        };
        let mut page = Vec::new();
        for (row, cells) in rows.range((start, Bound::Unbounded)) {
            if !row.starts_with(prefix) {
                break;
            }
            page.push((row.clone(), cells.get(column).map(|c| c.value.clone())));
            if page.len() == limit {
                break;
            }
        }
        Ok(page)
    }

    fn delete_rows(&self, rows: &[Vec<u8>]) -> Result<()> {
        let mut table = self.rows.lock();
        for row in rows {
            table.remove(row);
        }
        Ok(())
    }

    fn delete_cell(&self, row: &[u8], column: &str) -> Result<()> {
        let mut table = self.rows.lock();
        if let Some(cells) = table.get_mut(row) {
            cells.remove(column);
            if cells.is_empty() {
                table.remove(row);
            }
        }
        Ok(())
    }
}
