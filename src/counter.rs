//! # Batched Counter Allocator
//!
//! The backend's atomic increment is globally ordered but limited to a few
//! thousand calls per second, so keys are reserved in batches and handed out
//! singly within the process. Keys left unused when a process dies are lost;
//! that is an accepted cost of the batching.

use crate::backend::{counter_row_key, TableStore, COUNTER_COLUMN};
use crate::model::OccurrenceKey;
use anyhow::{bail, Result};
use parking_lot::Mutex;
use std::sync::Arc;

#[derive(Debug, Default, Clone, Copy)]
struct ReservedWindow {
    /// Last key handed out
    current: i32,
    /// Upper end (inclusive) of the batch reserved for this process
    max_reserved: i32,
}

/// Hands out monotonically increasing occurrence keys, reserving them from
/// the shared counter row in batches. Thread-safe; one instance per process.
pub struct KeyCounter {
    table: Arc<dyn TableStore>,
    batch_size: i64,
    window: Mutex<ReservedWindow>,
}

impl KeyCounter {
    pub fn new(table: Arc<dyn TableStore>, batch_size: i64) -> Self {
        Self {
            table,
            batch_size,
            window: Mutex::new(ReservedWindow::default()),
        }
    }

    /// The next available key.
    ///
    /// Reserves a fresh batch when the current window is exhausted. Fails if
    /// the counter has grown past what an occurrence key can represent.
    pub fn next_key(&self) -> Result<OccurrenceKey> {
        let mut window = self.window.lock();
        if window.current == window.max_reserved {
            let new_max = self
                .table
                .increment(&counter_row_key(), COUNTER_COLUMN, self.batch_size)?;
            if new_max > i32::MAX as i64 {
                bail!("counter issued keys larger than a 32-bit occurrence key can hold: {new_max}");
            }
            window.max_reserved = new_max as i32;
            // lower bound comes from the reservation, not the previous window
            window.current = window.max_reserved - self.batch_size as i32;
        }
        window.current += 1;
        Ok(OccurrenceKey(window.current))
    }
}
