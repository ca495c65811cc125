//! Ban escalation state machine.
//!
//! Overflow events accumulate on a per-identity [`BanRecord`]. Enough of
//! them produce a temporary ban; enough temporary bans produce a permanent
//! one. Temporary bans expire lazily: the record keeps its fields after the
//! deadline passes and is simply no longer considered active.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use super::clock::to_chrono;
use super::store::{ban_key, CounterStore};
use crate::error::Result;

/// Persisted escalation state for one identity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BanRecord {
    /// The identity this record belongs to
    pub identity: String,
    /// Overflow events since the last temporary ban
    pub overflow_count: u32,
    /// Temporary bans served so far
    pub temp_ban_count: u32,
    /// End of the most recent temporary ban
    #[serde(default)]
    pub temp_ban_until: Option<DateTime<Utc>>,
    /// Terminal state; nothing else changes once set
    #[serde(default)]
    pub permanently_banned: bool,
}

/// Escalation thresholds taken from the ratelimiter options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BanPolicy {
    /// Overflow events before a temporary ban
    pub temp_ban_after: u32,
    /// Temporary bans before a permanent ban
    pub perm_ban_after: u32,
    /// How long a temporary ban lasts
    pub temp_ban_length: Duration,
}

/// An active ban.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ban {
    /// Denied until the given instant
    Temporary { until: DateTime<Utc> },
    /// Denied forever
    Permanent,
}

/// Admission-relevant view of a ban record at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BanStatus {
    Clear,
    Banned(Ban),
}

/// What a recorded overflow did to the record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// Already banned; the record was left alone
    Unchanged,
    /// Overflow counted, below the temporary ban threshold
    Warned { overflow_count: u32 },
    /// A temporary ban started
    TempBanned { until: DateTime<Utc>, temp_ban_count: u32 },
    /// The identity is now permanently banned
    PermBanned,
}

impl BanRecord {
    /// Create an empty record for `identity`.
    pub fn new(identity: &str) -> Self {
        Self {
            identity: identity.to_string(),
            ..Self::default()
        }
    }

    /// Evaluate the record at `now`.
    pub fn status(&self, now: DateTime<Utc>) -> BanStatus {
        if self.permanently_banned {
            return BanStatus::Banned(Ban::Permanent);
        }
        match self.temp_ban_until {
            Some(until) if now < until => BanStatus::Banned(Ban::Temporary { until }),
            _ => BanStatus::Clear,
        }
    }

    /// Apply one overflow event.
    pub fn register_overflow(&mut self, policy: &BanPolicy, now: DateTime<Utc>) -> Transition {
        if self.status(now) != BanStatus::Clear {
            return Transition::Unchanged;
        }

        self.overflow_count = self.overflow_count.saturating_add(1);
        if self.overflow_count < policy.temp_ban_after {
            return Transition::Warned {
                overflow_count: self.overflow_count,
            };
        }

        self.overflow_count = 0;
        self.temp_ban_count = self.temp_ban_count.saturating_add(1);

        if self.temp_ban_count >= policy.perm_ban_after {
            self.permanently_banned = true;
            self.temp_ban_until = None;
            return Transition::PermBanned;
        }

        let until = now
            .checked_add_signed(to_chrono(policy.temp_ban_length))
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        self.temp_ban_until = Some(until);
        Transition::TempBanned {
            until,
            temp_ban_count: self.temp_ban_count,
        }
    }
}

/// Persists ban records for one ratelimiter namespace.
pub struct BanTracker {
    store: Arc<dyn CounterStore>,
    prefix: String,
    policy: BanPolicy,
}

impl BanTracker {
    /// Create a tracker writing under `prefix`.
    pub fn new(store: Arc<dyn CounterStore>, prefix: &str, policy: BanPolicy) -> Self {
        Self {
            store,
            prefix: prefix.to_string(),
            policy,
        }
    }

    /// Load the record for `identity`, or a fresh one if none exists.
    pub async fn load(&self, identity: &str) -> Result<BanRecord> {
        let key = ban_key(&self.prefix, identity);
        Ok(self
            .store
            .get_ban(&key)
            .await?
            .unwrap_or_else(|| BanRecord::new(identity)))
    }

    /// Current ban status of `identity`.
    pub async fn check_status(&self, identity: &str, now: DateTime<Utc>) -> Result<BanStatus> {
        Ok(self.load(identity).await?.status(now))
    }

    /// Record one overflow event for `identity`.
    ///
    /// The transition is applied to the record as currently stored, so
    /// concurrent overflows each count and never overwrite a newer ban.
    pub async fn record_overflow(&self, identity: &str, now: DateTime<Utc>) -> Result<Transition> {
        let key = ban_key(&self.prefix, identity);
        let policy = self.policy;
        let apply = move |record: &mut BanRecord| record.register_overflow(&policy, now);

        let (record, transition) = self.store.update_ban(&key, identity, &apply).await?;

        match transition {
            Transition::Unchanged => {}
            Transition::Warned { overflow_count } => {
                info!(
                    prefix = %self.prefix,
                    identity = %identity,
                    overflow_count,
                    "Overflow recorded"
                );
            }
            Transition::TempBanned { until, temp_ban_count } => {
                warn!(
                    prefix = %self.prefix,
                    identity = %identity,
                    until = %until,
                    temp_ban_count,
                    "Identity temporarily banned"
                );
            }
            Transition::PermBanned => {
                warn!(
                    prefix = %self.prefix,
                    identity = %identity,
                    temp_ban_count = record.temp_ban_count,
                    "Identity permanently banned"
                );
            }
        }

        Ok(transition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::memory::MemoryStore;
    use chrono::TimeZone;

    fn policy() -> BanPolicy {
        BanPolicy {
            temp_ban_after: 2,
            perm_ban_after: 2,
            temp_ban_length: Duration::from_secs(24 * 3600),
        }
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
    }

    #[test]
    fn test_fresh_record_is_clear() {
        let record = BanRecord::new("1234");
        assert_eq!(record.status(t0()), BanStatus::Clear);
    }

    #[test]
    fn test_first_overflow_warns() {
        let mut record = BanRecord::new("1234");
        let transition = record.register_overflow(&policy(), t0());

        assert_eq!(transition, Transition::Warned { overflow_count: 1 });
        assert_eq!(record.overflow_count, 1);
        assert_eq!(record.status(t0()), BanStatus::Clear);
    }

    #[test]
    fn test_second_overflow_temp_bans() {
        let mut record = BanRecord::new("1234");
        record.register_overflow(&policy(), t0());
        let transition = record.register_overflow(&policy(), t0());

        let until = t0() + chrono::Duration::hours(24);
        assert_eq!(
            transition,
            Transition::TempBanned {
                until,
                temp_ban_count: 1
            }
        );
        assert_eq!(record.overflow_count, 0);
        assert_eq!(record.temp_ban_count, 1);
        assert_eq!(record.status(t0()), BanStatus::Banned(Ban::Temporary { until }));
    }

    #[test]
    fn test_overflow_during_temp_ban_is_ignored() {
        let mut record = BanRecord::new("1234");
        record.register_overflow(&policy(), t0());
        record.register_overflow(&policy(), t0());
        let snapshot = record.clone();

        let later = t0() + chrono::Duration::hours(1);
        assert_eq!(record.register_overflow(&policy(), later), Transition::Unchanged);
        assert_eq!(record, snapshot);
    }

    #[test]
    fn test_temp_ban_expires_lazily() {
        let mut record = BanRecord::new("1234");
        record.register_overflow(&policy(), t0());
        record.register_overflow(&policy(), t0());

        let after = t0() + chrono::Duration::hours(24);
        assert_eq!(record.status(after), BanStatus::Clear);
        // The stale deadline stays on the record.
        assert!(record.temp_ban_until.is_some());
        assert_eq!(record.temp_ban_count, 1);
    }

    #[test]
    fn test_overflow_count_survives_ban_expiry() {
        let policy = BanPolicy {
            temp_ban_after: 3,
            perm_ban_after: 5,
            temp_ban_length: Duration::from_secs(60),
        };
        let mut record = BanRecord::new("1234");
        record.temp_ban_count = 1;
        record.temp_ban_until = Some(t0());
        record.overflow_count = 2;

        let transition = record.register_overflow(&policy, t0() + chrono::Duration::seconds(1));
        assert!(matches!(
            transition,
            Transition::TempBanned { temp_ban_count: 2, .. }
        ));
    }

    #[test]
    fn test_second_temp_ban_becomes_permanent() {
        let mut record = BanRecord::new("1234");
        record.register_overflow(&policy(), t0());
        record.register_overflow(&policy(), t0());

        let after = t0() + chrono::Duration::hours(25);
        record.register_overflow(&policy(), after);
        let transition = record.register_overflow(&policy(), after);

        assert_eq!(transition, Transition::PermBanned);
        assert!(record.permanently_banned);
        assert_eq!(record.temp_ban_until, None);
        assert_eq!(record.temp_ban_count, 2);
        assert_eq!(record.status(after), BanStatus::Banned(Ban::Permanent));
    }

    #[test]
    fn test_permanent_ban_is_frozen() {
        let mut record = BanRecord::new("1234");
        record.permanently_banned = true;
        record.temp_ban_count = 2;
        let snapshot = record.clone();

        let far_future = t0() + chrono::Duration::days(3650);
        assert_eq!(record.register_overflow(&policy(), far_future), Transition::Unchanged);
        assert_eq!(record, snapshot);
        assert_eq!(record.status(far_future), BanStatus::Banned(Ban::Permanent));
    }

    #[test]
    fn test_perm_ban_after_one_skips_temp_ban() {
        let policy = BanPolicy {
            temp_ban_after: 1,
            perm_ban_after: 1,
            temp_ban_length: Duration::from_secs(60),
        };
        let mut record = BanRecord::new("1234");
        assert_eq!(record.register_overflow(&policy, t0()), Transition::PermBanned);
    }

    #[tokio::test]
    async fn test_tracker_persists_transitions() {
        let store = Arc::new(MemoryStore::new());
        let tracker = BanTracker::new(store.clone(), "rl_bots", policy());

        assert_eq!(tracker.check_status("1234", t0()).await.unwrap(), BanStatus::Clear);

        let transition = tracker.record_overflow("1234", t0()).await.unwrap();
        assert_eq!(transition, Transition::Warned { overflow_count: 1 });
        tracker.record_overflow("1234", t0()).await.unwrap();

        let until = t0() + chrono::Duration::hours(24);
        assert_eq!(
            tracker.check_status("1234", t0()).await.unwrap(),
            BanStatus::Banned(Ban::Temporary { until })
        );
        let stored = store.get_ban("rl_bots:ban:1234").await.unwrap().unwrap();
        assert_eq!(stored.temp_ban_count, 1);
        assert_eq!(stored.identity, "1234");
    }

    #[tokio::test]
    async fn test_tracker_leaves_permanent_ban_alone() {
        let store = Arc::new(MemoryStore::new());
        let tracker = BanTracker::new(store.clone(), "rl_bots", policy());

        let mut record = BanRecord::new("1234");
        record.permanently_banned = true;
        record.temp_ban_count = 2;
        store.put_ban("rl_bots:ban:1234", &record).await.unwrap();

        let transition = tracker.record_overflow("1234", t0()).await.unwrap();

        assert_eq!(transition, Transition::Unchanged);
        assert_eq!(store.get_ban("rl_bots:ban:1234").await.unwrap(), Some(record));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_overflows_all_count() {
        let store = Arc::new(MemoryStore::new());
        let tracker = Arc::new(BanTracker::new(
            store.clone(),
            "rl_bots",
            BanPolicy {
                temp_ban_after: 100,
                ..policy()
            },
        ));

        let handles: Vec<_> = (0..24)
            .map(|_| {
                let tracker = tracker.clone();
                tokio::spawn(async move {
                    tokio::task::yield_now().await;
                    tracker.record_overflow("1234", t0()).await.unwrap()
                })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        let stored = store.get_ban("rl_bots:ban:1234").await.unwrap().unwrap();
        assert_eq!(stored.overflow_count, 24);
    }

    #[test]
    fn test_record_json_shape() {
        let record = BanRecord {
            identity: "1234".to_string(),
            overflow_count: 1,
            temp_ban_count: 0,
            temp_ban_until: None,
            permanently_banned: false,
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["identity"], "1234");
        assert_eq!(json["overflow_count"], 1);
        assert_eq!(json["permanently_banned"], false);
    }
}
