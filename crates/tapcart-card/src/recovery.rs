//! Brute-force key recovery.
//!
//! Walks an ordered candidate list against every sector still missing a
//! key: owned keys first (most likely to be right and cheapest to
//! confirm), then the standard "most likely" set, then the remaining
//! vendor dictionaries. Sectors that already have both keys are skipped,
//! and the whole search stops early once every sector is complete.
//!
//! Card presence is re-confirmed before every attempt; a removed card
//! invalidates every further guess, so the search aborts instead of
//! scanning a card that is no longer there.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::access::{KeyMap, SectorKeys, TagAccess};
use crate::hal::{HalError, Key, KeySlot, SECTOR_COUNT};
use crate::keys::{parse_key, KEY_GROUPS, STANDARD_SET};

/// Which candidate groups are tried beyond the caller's own keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RecoveryMode {
    /// Owned keys only.
    None,
    /// Owned keys, then the standard set.
    MostLikely,
    /// Owned keys, then every dictionary group.
    Full,
}

#[derive(Debug, Clone)]
pub struct RecoveryOptions {
    /// Number of sectors to search, from sector 0.
    pub sectors: u8,
    /// Time allowed for each detection + authentication attempt.
    pub attempt_timeout: Duration,
    /// Keys the caller already owns, tried first.
    pub owned_keys: Vec<Key>,
    pub mode: RecoveryMode,
}

impl Default for RecoveryOptions {
    fn default() -> Self {
        Self {
            sectors: SECTOR_COUNT,
            attempt_timeout: Duration::from_millis(500),
            owned_keys: Vec::new(),
            mode: RecoveryMode::MostLikely,
        }
    }
}

/// Outcome of a recovery run.
#[derive(Debug, Clone)]
pub struct RecoveryReport {
    /// Discovered keys, indexed by sector.
    pub keys: Vec<SectorKeys>,
    pub total_attempts: u32,
    /// Sectors with both keys.
    pub complete_sectors: usize,
    /// Sectors with exactly one key.
    pub partial_sectors: usize,
    /// Sectors with neither key.
    pub empty_sectors: usize,
    /// True when the search stopped because the card disappeared or an
    /// abort was requested.
    pub aborted: bool,
}

impl RecoveryReport {
    pub fn key_map(&self) -> KeyMap {
        KeyMap::from_sectors(self.keys.clone())
    }

    pub fn all_complete(&self) -> bool {
        self.complete_sectors == self.keys.len()
    }
}

/// Brute-force search over a [`TagAccess`].
pub struct KeyRecovery {
    access: Arc<TagAccess>,
    abort: AtomicBool,
}

impl KeyRecovery {
    pub fn new(access: Arc<TagAccess>) -> Self {
        Self {
            access,
            abort: AtomicBool::new(false),
        }
    }

    /// Stop the running search at the next attempt boundary.
    /// Idempotent; harmless when no search is running.
    pub fn request_abort(&self) {
        self.abort.store(true, Ordering::SeqCst);
    }

    /// Candidate list in priority order, duplicates removed.
    fn candidates(options: &RecoveryOptions) -> Vec<Key> {
        let mut list: Vec<Key> = Vec::new();
        let mut push = |key: Key| {
            if !list.contains(&key) {
                list.push(key);
            }
        };

        for key in &options.owned_keys {
            push(*key);
        }
        match options.mode {
            RecoveryMode::None => {}
            RecoveryMode::MostLikely => {
                for key in STANDARD_SET.iter().filter_map(|s| parse_key(s)) {
                    push(key);
                }
            }
            RecoveryMode::Full => {
                for (_, group) in KEY_GROUPS {
                    for key in group.iter().filter_map(|s| parse_key(s)) {
                        push(key);
                    }
                }
            }
        }
        list
    }

    /// Run the search. Hardware faults propagate; a vanished card is
    /// reported through the `aborted` flag instead.
    pub async fn run(&self, options: &RecoveryOptions) -> Result<RecoveryReport, HalError> {
        self.abort.store(false, Ordering::SeqCst);

        let sectors = options.sectors.min(SECTOR_COUNT) as usize;
        let mut found = vec![SectorKeys::default(); sectors];
        let candidates = Self::candidates(options);
        let mut attempts: u32 = 0;
        let mut aborted = false;

        info!(
            sectors,
            candidates = candidates.len(),
            mode = ?options.mode,
            "starting key recovery"
        );

        'search: for key in &candidates {
            for sector in 0..sectors {
                for slot in [KeySlot::A, KeySlot::B] {
                    if found[sector].slot(slot).is_some() {
                        continue;
                    }
                    if self.abort.load(Ordering::SeqCst) {
                        warn!("key recovery abort requested");
                        aborted = true;
                        break 'search;
                    }

                    // The card must still be in the field before we spend
                    // an authentication on it.
                    if self
                        .access
                        .detect_tag(options.attempt_timeout)
                        .await?
                        .is_none()
                    {
                        warn!("card no longer present, aborting key recovery");
                        aborted = true;
                        break 'search;
                    }

                    attempts += 1;
                    if self
                        .access
                        .authenticate(sector as u8, slot, key)
                        .await?
                    {
                        found[sector].set_slot(slot, *key);
                        debug!(
                            sector,
                            %slot,
                            key = %hex::encode_upper(key),
                            "sector key found"
                        );
                    }
                }
            }

            if found.iter().all(SectorKeys::is_complete) {
                info!(attempts, "every sector complete, stopping early");
                break;
            }
        }

        let complete = found.iter().filter(|k| k.is_complete()).count();
        let partial = found
            .iter()
            .filter(|k| k.has_any() && !k.is_complete())
            .count();
        let empty = found.iter().filter(|k| !k.has_any()).count();

        info!(
            complete,
            partial, empty, attempts, aborted, "key recovery finished"
        );

        Ok(RecoveryReport {
            keys: found,
            total_attempts: attempts,
            complete_sectors: complete,
            partial_sectors: partial,
            empty_sectors: empty,
            aborted,
        })
    }
}
