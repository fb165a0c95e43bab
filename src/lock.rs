//! # Lock Protocol Engine
//!
//! Drives the per-row allocation state machine over the lookup table.
//!
//! Each row moves FREE → HELD → ALLOCATED. A row is HELD while its `lock`
//! cell carries a token; a lock older than the stale threshold belongs to a
//! dead writer and may be taken over with a compare-and-set against the old
//! token bytes. Only `"ALLOCATED"` is ever written as a status; a held row
//! without it is implicitly ALLOCATING.
//!
//! An attempt walks the lookup keys in their canonical sorted order, so two
//! writers racing for overlapping sets collide on the same first key and
//! exactly one of them advances per round. The loser releases everything it
//! grabbed and retries after a jittered backoff.

use crate::backend::{TableStore, KEY_COLUMN, LOCK_COLUMN, STATUS_COLUMN};
use crate::config::KeygenTuning;
use crate::counter::KeyCounter;
use crate::model::{KeyLookupResult, KeyStatus, OccurrenceKey};
use anyhow::{anyhow, Result};
use rand::Rng;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

/// Conflicting occurrence keys were found across the lookup rows of one
/// natural-key set. Non-retriable; carries the full row-to-key map so the
/// inconsistency can be reported and repaired out of band.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictingKeysError {
    /// Lookup row key to the occurrence key stored on it
    pub keys: BTreeMap<String, OccurrenceKey>,
}

impl fmt::Display for ConflictingKeysError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "found inconsistent occurrence keys in looking up unique identifiers:"
        )?;
        for (lookup_key, key) in &self.keys {
            write!(f, " [{}]=[{}]", lookup_key, key)?;
        }
        Ok(())
    }
}

impl std::error::Error for ConflictingKeysError {}

/// Outcome of one acquisition pass.
enum Acquisition {
    /// Every lookup row is either ALLOCATED or locked by us.
    Acquired {
        status_map: BTreeMap<String, KeyStatus>,
        found_key: Option<OccurrenceKey>,
    },
    /// Someone else holds a live lock; locks taken this pass were released.
    Conflict,
}

/// The allocation engine over the lookup table.
pub(crate) struct LockEngine {
    lookup: Arc<dyn TableStore>,
    tuning: KeygenTuning,
}

impl LockEngine {
    pub fn new(lookup: Arc<dyn TableStore>, tuning: KeygenTuning) -> Self {
        Self { lookup, tuning }
    }

    /// Allocate (or converge on) the occurrence key for a canonical set of
    /// lookup keys. Loops until a round wins; only protocol conflicts retry,
    /// everything else surfaces after a best-effort lock release.
    pub fn generate(
        &self,
        lookup_keys: &BTreeSet<String>,
        counter: &KeyCounter,
    ) -> Result<KeyLookupResult> {
        loop {
            let (status_map, found_key) = match self.try_acquire(lookup_keys)? {
                Acquisition::Conflict => {
                    debug!("failed to get locks, backing off before next attempt");
                    self.backoff();
                    continue;
                }
                Acquisition::Acquired {
                    status_map,
                    found_key,
                } => (status_map, found_key),
            };

            let result = match found_key {
                Some(key) => {
                    debug!(key = %key, "using found key");
                    KeyLookupResult::new(key, false)
                }
                None => match counter.next_key() {
                    Ok(key) => {
                        debug!(key = %key, "assigning new key");
                        KeyLookupResult::new(key, true)
                    }
                    Err(err) => {
                        self.release_locks(&status_map);
                        return Err(err);
                    }
                },
            };

            if let Err(err) = self.finalize(&status_map, result.key) {
                self.release_locks(&status_map);
                return Err(err);
            }
            self.release_locks(&status_map);
            return Ok(result);
        }
    }

    /// One pass over the lookup keys: read each row, collect ALLOCATED keys,
    /// and try to lock everything else. Any held live lock fails the whole
    /// pass. Locks acquired by a failing or erroring pass are released before
    /// this returns.
    fn try_acquire(&self, lookup_keys: &BTreeSet<String>) -> Result<Acquisition> {
        let lock_id = Uuid::new_v4().into_bytes();
        // one timestamp for every lock taken in this attempt
        let now = crate::backend::now_millis();

        let mut status_map: BTreeMap<String, KeyStatus> = BTreeMap::new();
        let mut existing_keys: BTreeMap<String, OccurrenceKey> = BTreeMap::new();
        let mut found_key: Option<OccurrenceKey> = None;

        for lookup_key in lookup_keys {
            let row = match self.lookup.get_row(lookup_key.as_bytes()) {
                Ok(row) => row,
                Err(err) => {
                    self.release_locks(&status_map);
                    return Err(err);
                }
            };

            let status = row
                .as_ref()
                .and_then(|cells| cells.get(STATUS_COLUMN))
                .and_then(|cell| KeyStatus::parse(&cell.value));
            let existing_lock = row.as_ref().and_then(|cells| cells.get(LOCK_COLUMN));
            let existing_key = row
                .as_ref()
                .and_then(|cells| cells.get(KEY_COLUMN))
                .and_then(|cell| OccurrenceKey::from_slice(&cell.value));

            if status == Some(KeyStatus::Allocated) {
                // The key is final regardless of any leftover lock cell.
                let Some(key) = existing_key else {
                    self.release_locks(&status_map);
                    return Err(anyhow!(
                        "lookup row [{lookup_key}] is ALLOCATED but has no key"
                    ));
                };
                existing_keys.insert(lookup_key.clone(), key);
                match found_key {
                    None => found_key = Some(key),
                    Some(previous) if previous != key => {
                        self.release_locks(&status_map);
                        return Err(ConflictingKeysError {
                            keys: existing_keys,
                        }
                        .into());
                    }
                    Some(_) => {}
                }
                status_map.insert(lookup_key.clone(), KeyStatus::Allocated);
                debug!(lookup_key = %lookup_key, key = %key, "row already allocated");
            } else if existing_lock.is_none() {
                // Lock is ours for the taking, expecting the cell to be absent.
                let got_lock = match self.lookup.check_and_put(
                    lookup_key.as_bytes(),
                    LOCK_COLUMN,
                    &lock_id,
                    LOCK_COLUMN,
                    None,
                    now,
                ) {
                    Ok(got) => got,
                    Err(err) => {
                        self.release_locks(&status_map);
                        return Err(err);
                    }
                };
                if got_lock {
                    status_map.insert(lookup_key.clone(), KeyStatus::Allocating);
                    debug!(lookup_key = %lookup_key, "grabbed free lock, now allocating");
                } else {
                    debug!(lookup_key = %lookup_key, "failed to grab free lock, breaking");
                    self.release_locks(&status_map);
                    return Ok(Acquisition::Conflict);
                }
            } else if let Some(lock_cell) = existing_lock {
                // Someone wrote their token but has not finished. The row may
                // even carry a key already if they died between the key write
                // and the lock release.
                if now - lock_cell.timestamp > self.tuning.stale_lock_ms {
                    debug!(lookup_key = %lookup_key, "found stale lock");
                    let got_lock = match self.lookup.check_and_put(
                        lookup_key.as_bytes(),
                        LOCK_COLUMN,
                        &lock_id,
                        LOCK_COLUMN,
                        Some(&lock_cell.value),
                        now,
                    ) {
                        Ok(got) => got,
                        Err(err) => {
                            self.release_locks(&status_map);
                            return Err(err);
                        }
                    };
                    if got_lock {
                        status_map.insert(lookup_key.clone(), KeyStatus::Allocating);
                        debug!(lookup_key = %lookup_key, "reset stale lock, now allocating");
                    } else {
                        // Beaten to the takeover: either they finished and the
                        // row is ALLOCATED now, or a fresh token sits there.
                        debug!(lookup_key = %lookup_key, "failed to reset stale lock, breaking");
                        self.release_locks(&status_map);
                        return Ok(Acquisition::Conflict);
                    }
                } else {
                    debug!(lookup_key = %lookup_key, "hit live lock, breaking");
                    self.release_locks(&status_map);
                    return Ok(Acquisition::Conflict);
                }
            }
        }

        Ok(Acquisition::Acquired {
            status_map,
            found_key,
        })
    }

    /// Write the final key to every row this attempt locked. The key cell
    /// must land before the status cell: no observer may ever see ALLOCATED
    /// without a key.
    fn finalize(
        &self,
        status_map: &BTreeMap<String, KeyStatus>,
        key: OccurrenceKey,
    ) -> Result<()> {
        let now = crate::backend::now_millis();
        for (lookup_key, status) in status_map {
            if *status == KeyStatus::Allocating {
                self.lookup
                    .put_cell(lookup_key.as_bytes(), KEY_COLUMN, &key.to_bytes(), now)?;
                self.lookup.put_cell(
                    lookup_key.as_bytes(),
                    STATUS_COLUMN,
                    KeyStatus::Allocated.as_str().as_bytes(),
                    now,
                )?;
            }
        }
        Ok(())
    }

    /// Best-effort release of every lock this attempt holds. Failures are
    /// logged and swallowed; an unreleased lock ages into takeover.
    fn release_locks(&self, status_map: &BTreeMap<String, KeyStatus>) {
        for (lookup_key, status) in status_map {
            if *status == KeyStatus::Allocating {
                if let Err(err) = self.lookup.delete_cell(lookup_key.as_bytes(), LOCK_COLUMN) {
                    warn!(lookup_key = %lookup_key, error = %err, "failed to release lock");
                }
            }
        }
    }

    /// Sleep the base retry wait, skewed by a symmetric random jitter.
    fn backoff(&self) {
        let base = self.tuning.wait_before_retry_ms as i64;
        let skew = self.tuning.wait_skew_ms as i64;
        let jitter = if skew > 0 {
            let mut rng = rand::rng();
            rng.random_range(0..skew) - rng.random_range(0..skew)
        } else {
            0
        };
        thread::sleep(Duration::from_millis((base + jitter).max(0) as u64));
    }
}
