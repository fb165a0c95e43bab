//! # Wide-Column Backend
//!
//! The `TableStore` trait abstracts one wide-column table: rows addressed by
//! byte keys, each holding named cells with backend timestamps. Everything
//! above this trait is store-agnostic; backend specifics (HBase, RocksDB,
//! memory) live entirely in the implementations.

use anyhow::Result;
use std::collections::HashMap;
use std::time::{SystemTime, UNIX_EPOCH};

/// Name of the lock-token column on lookup rows.
pub const LOCK_COLUMN: &str = "lock";

/// Name of the occurrence-key column on lookup rows. The cell value is the
/// big-endian 4-byte signed integer key; existing deployments depend on both
/// the name and the encoding.
pub const KEY_COLUMN: &str = "k";

/// Name of the status column on lookup rows (`"ALLOCATED"` when final).
pub const STATUS_COLUMN: &str = "status";

/// Name of the counter column on the counter row.
pub const COUNTER_COLUMN: &str = "id";

/// Name of the dataset column on occurrence rows, consulted when deleting a
/// key without a known scope.
pub const DATASET_COLUMN: &str = "datasetKey";

/// Row key of the single counter row, as a big-endian integer.
pub const COUNTER_ROW: i32 = 1;

/// The counter row key in wire form.
pub fn counter_row_key() -> [u8; 4] {
    COUNTER_ROW.to_be_bytes()
}

/// Wall-clock milliseconds since the epoch, the timestamp domain for cells.
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// A stored cell: opaque value plus the timestamp assigned when it was
/// written, in milliseconds since the epoch. Lock staleness is judged against
/// this timestamp rather than a value embedded in the cell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub value: Vec<u8>,
    pub timestamp: i64,
}

impl Cell {
    pub fn new(value: Vec<u8>, timestamp: i64) -> Self {
        Self { value, timestamp }
    }
}

/// A full row read: column name to cell.
pub type Row = HashMap<String, Cell>;

/// One wide-column table.
///
/// Implementations must make `check_and_put` and `increment` atomic with
/// respect to every other mutation of the same row; `check_and_put` is the
/// linearization point for lock acquisition.
pub trait TableStore: Send + Sync {
    /// Read a full row. `None` if the row has no cells.
    fn get_row(&self, row: &[u8]) -> Result<Option<Row>>;

    /// Read a single cell value.
    fn get_cell(&self, row: &[u8], column: &str) -> Result<Option<Vec<u8>>>;

    /// Unconditional cell write with a caller-supplied timestamp.
    fn put_cell(&self, row: &[u8], column: &str, value: &[u8], timestamp: i64) -> Result<()>;

    /// Atomic compare-and-set: write `(column, value)` iff the current value
    /// of `expected_column` equals `expected` (`None` = the cell must be
    /// absent). Returns whether the write happened.
    fn check_and_put(
        &self,
        row: &[u8],
        column: &str,
        value: &[u8],
        expected_column: &str,
        expected: Option<&[u8]>,
        timestamp: i64,
    ) -> Result<bool>;

    /// Atomically add `delta` to an integer cell, creating it at zero if
    /// absent. Returns the post-increment value.
    fn increment(&self, row: &[u8], column: &str, delta: i64) -> Result<i64>;

    /// Ordered scan of rows whose key starts with `prefix`, yielding the row
    /// key and the value of `column` (if present) for each. Paged: returns at
    /// most `limit` rows strictly after `start_after`; callers loop until a
    /// short page comes back.
    fn scan_prefix(
        &self,
        prefix: &[u8],
        column: &str,
        start_after: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Vec<u8>, Option<Vec<u8>>)>>;

    /// Delete whole rows in one batch.
    fn delete_rows(&self, rows: &[Vec<u8>]) -> Result<()>;

    /// Delete a single cell, leaving the rest of the row intact.
    fn delete_cell(&self, row: &[u8], column: &str) -> Result<()>;
}
