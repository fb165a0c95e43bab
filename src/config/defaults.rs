//! Default constants for occurrence key allocation.
//!
//! All magic numbers are centralized here with documentation.

// =============================================================================
// Table Layout Defaults
// =============================================================================

/// Default lookup table name
pub const DEFAULT_LOOKUP_TABLE: &str = "occurrence_lookup";

/// Default counter table name
pub const DEFAULT_COUNTER_TABLE: &str = "occurrence_counter";

/// Default occurrence table name
pub const DEFAULT_OCCURRENCE_TABLE: &str = "occurrence";

/// Default column family shared by all three tables
pub const DEFAULT_COLUMN_FAMILY: &str = "o";

// =============================================================================
// Counter Defaults
// =============================================================================

/// Number of keys to reserve per counter increment.
/// The backend's atomic increment is throughput-limited; batching amortizes
/// the cost across this many allocations.
pub const DEFAULT_BATCH_SIZE: i64 = 100;

// =============================================================================
// Lock Protocol Defaults
// =============================================================================

/// Base wait between allocation attempts after a lock conflict (milliseconds)
pub const DEFAULT_WAIT_BEFORE_RETRY_MS: u64 = 5000;

/// Jitter window applied on top of the base wait (milliseconds, plus/minus).
/// Breaks retry synchronization between racing clients.
pub const DEFAULT_WAIT_SKEW_MS: u64 = 4000;

/// Age at which a held lock is considered abandoned and may be taken over
/// (milliseconds). Must exceed the worst-case duration of one allocation.
pub const DEFAULT_STALE_LOCK_MS: i64 = 5 * 60 * 1000;

// =============================================================================
// Scan Defaults
// =============================================================================

/// Rows fetched per scan page for scoped lookups and deletions
pub const DEFAULT_SCAN_BATCH_SIZE: usize = 200;
