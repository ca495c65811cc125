//! Counter store trait for abstracting the shared and in-process backends.

use async_trait::async_trait;
use std::time::Duration;

use super::ban::{BanRecord, Transition};
use crate::error::Result;

/// Mutation applied by [`CounterStore::update_ban`]. May run more than once
/// if another writer gets in first.
pub type BanUpdate<'a> = &'a (dyn Fn(&mut BanRecord) -> Transition + Send + Sync);

/// Result of a window increment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCount {
    /// Post-increment value of the counter
    pub count: u64,
    /// Time left before the counter expires
    pub resets_in: Duration,
}

/// Trait for counter store implementations.
///
/// Every API instance talks to the same store, so `increment` must be
/// atomic across processes: no lost updates, and the expiry is attached
/// only when the key is created.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increment the counter at `key`, creating it with a TTL of `window`
    /// if absent, and return the new value.
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount>;

    /// Read the ban record stored at `key`.
    async fn get_ban(&self, key: &str) -> Result<Option<BanRecord>>;

    /// Overwrite the ban record stored at `key`. Last writer wins.
    async fn put_ban(&self, key: &str, record: &BanRecord) -> Result<()>;

    /// Atomically apply `apply` to the record at `key`, starting from a
    /// fresh record for `identity` if none exists. The result is written
    /// only when the transition is not [`Transition::Unchanged`].
    async fn update_ban(
        &self,
        key: &str,
        identity: &str,
        apply: BanUpdate<'_>,
    ) -> Result<(BanRecord, Transition)>;
}

/// Counter key for an identity: `<prefix>:<identity>`.
pub fn counter_key(prefix: &str, identity: &str) -> String {
    format!("{}:{}", prefix, identity)
}

/// Ban key for an identity: `<prefix>:ban:<identity>`.
pub fn ban_key(prefix: &str, identity: &str) -> String {
    format!("{}:ban:{}", prefix, identity)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        assert_eq!(counter_key("rl_bots", "1234"), "rl_bots:1234");
        assert_eq!(ban_key("rl_bots", "1234"), "rl_bots:ban:1234");
    }

    #[test]
    fn test_keys_do_not_overlap_across_prefixes() {
        assert_ne!(
            counter_key("rl_bots", "1234"),
            counter_key("rl_premium_bots", "1234")
        );
        assert_ne!(ban_key("rl_bots", "1234"), ban_key("rl_premium_bots", "1234"));
    }
}
