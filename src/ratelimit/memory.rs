//! In-process counter store.
//!
//! Only coordinates callers inside one process. Used for single-node
//! deployments and as the store behind the engine tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace};

use super::ban::{BanRecord, Transition};
use super::clock::{to_chrono, until, Clock, SystemClock};
use super::store::{BanUpdate, CounterStore, WindowCount};
use crate::error::Result;

#[derive(Debug, Clone, Copy)]
struct WindowEntry {
    count: u64,
    expires_at: DateTime<Utc>,
}

/// Counter store backed by concurrent hash maps.
///
/// DashMap's per-shard write lock is held for the whole read-modify-write,
/// which gives `increment` the same atomicity the Redis script provides.
pub struct MemoryStore {
    counters: DashMap<String, WindowEntry>,
    bans: DashMap<String, BanRecord>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    /// Create a store using the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    /// Create a store that expires windows according to `clock`.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            counters: DashMap::new(),
            bans: DashMap::new(),
            clock,
        }
    }

    /// Current value of a live counter.
    pub fn count(&self, key: &str) -> Option<u64> {
        let now = self.clock.now();
        self.counters
            .get(key)
            .filter(|entry| entry.expires_at > now)
            .map(|entry| entry.count)
    }

    /// Number of counters held, expired or not.
    pub fn counter_count(&self) -> usize {
        self.counters.len()
    }

    /// Drop expired counters.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.counters.len();
        self.counters.retain(|_, entry| entry.expires_at > now);
        let purged = before.saturating_sub(self.counters.len());
        if purged > 0 {
            debug!(purged, "Purged expired window counters");
        }
        purged
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CounterStore for MemoryStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let now = self.clock.now();
        let expiry = now
            .checked_add_signed(to_chrono(window))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);

        let mut entry = self
            .counters
            .entry(key.to_string())
            .or_insert(WindowEntry {
                count: 0,
                expires_at: expiry,
            });

        if entry.expires_at <= now {
            trace!(key = %key, "Window expired, starting a new one");
            entry.count = 0;
            entry.expires_at = expiry;
        }

        entry.count += 1;

        Ok(WindowCount {
            count: entry.count,
            resets_in: until(now, entry.expires_at),
        })
    }

    async fn get_ban(&self, key: &str) -> Result<Option<BanRecord>> {
        Ok(self.bans.get(key).map(|record| record.clone()))
    }

    async fn put_ban(&self, key: &str, record: &BanRecord) -> Result<()> {
        self.bans.insert(key.to_string(), record.clone());
        Ok(())
    }

    async fn update_ban(
        &self,
        key: &str,
        identity: &str,
        apply: BanUpdate<'_>,
    ) -> Result<(BanRecord, Transition)> {
        // The entry guard serializes writers for this key.
        match self.bans.entry(key.to_string()) {
            Entry::Occupied(mut entry) => {
                let transition = apply(entry.get_mut());
                Ok((entry.get().clone(), transition))
            }
            Entry::Vacant(entry) => {
                let mut record = BanRecord::new(identity);
                let transition = apply(&mut record);
                if transition != Transition::Unchanged {
                    entry.insert(record.clone());
                }
                Ok((record, transition))
            }
        }
    }
}
