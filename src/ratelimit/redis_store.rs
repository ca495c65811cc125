//! Redis-backed counter store shared by every API instance.

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, RedisResult, Script};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use super::ban::{BanRecord, Transition};
use super::store::{BanUpdate, CounterStore, WindowCount};
use crate::error::{GatekeeperError, Result};

/// Atomic increment-with-expiry. The expiry is attached only when the key
/// is created, or repaired if the key somehow lost its TTL.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
local ttl = redis.call('PTTL', KEYS[1])
if count == 1 or ttl < 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
    ttl = tonumber(ARGV[1])
end
return {count, ttl}
"#;

/// Compare-and-swap of a ban record. ARGV[1] is the JSON last read, or the
/// empty string if the key was absent.
const SWAP_BAN_SCRIPT: &str = r#"
local current = redis.call('GET', KEYS[1])
if ARGV[1] == '' then
    if current then
        return 0
    end
elseif current ~= ARGV[1] then
    return 0
end
redis.call('SET', KEYS[1], ARGV[2])
return 1
"#;

/// Attempts at a ban update before giving up under contention.
const MAX_SWAP_ATTEMPTS: u32 = 16;

/// Counter store talking to a single Redis deployment.
#[derive(Clone)]
pub struct RedisStore {
    conn: ConnectionManager,
    increment_script: Script,
    swap_ban_script: Script,
    timeout: Duration,
}

impl RedisStore {
    /// Connect to Redis at `url`. Every later call is bounded by `timeout`.
    pub async fn connect(url: &str, timeout: Duration) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = tokio::time::timeout(timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| {
                GatekeeperError::StoreUnavailable(format!("timed out connecting to {}", url))
            })??;

        info!(url = %url, "Connected to Redis");

        Ok(Self {
            conn,
            increment_script: Script::new(INCREMENT_SCRIPT),
            swap_ban_script: Script::new(SWAP_BAN_SCRIPT),
            timeout,
        })
    }

    /// Run a Redis call under the configured timeout.
    async fn bounded<T, F>(&self, op: &'static str, key: &str, fut: F) -> Result<T>
    where
        F: Future<Output = RedisResult<T>>,
    {
        match tokio::time::timeout(self.timeout, fut).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                error!(op, key = %key, error = %e, "Redis call failed");
                Err(e.into())
            }
            Err(_) => {
                error!(op, key = %key, timeout_ms = self.timeout.as_millis() as u64, "Redis call timed out");
                Err(GatekeeperError::StoreUnavailable(format!(
                    "{} on {} timed out",
                    op, key
                )))
            }
        }
    }
}

#[async_trait]
impl CounterStore for RedisStore {
    async fn increment(&self, key: &str, window: Duration) -> Result<WindowCount> {
        let mut conn = self.conn.clone();
        let window_ms = window.as_millis().max(1) as u64;

        let mut invocation = self.increment_script.prepare_invoke();
        invocation.key(key).arg(window_ms);

        let (count, ttl_ms): (u64, i64) = self
            .bounded("increment", key, invocation.invoke_async(&mut conn))
            .await?;

        debug!(key = %key, count, ttl_ms, "Window counter incremented");

        Ok(WindowCount {
            count,
            resets_in: Duration::from_millis(ttl_ms.max(0) as u64),
        })
    }

    async fn get_ban(&self, key: &str) -> Result<Option<BanRecord>> {
        let mut conn = self.conn.clone();
        let raw: Option<String> = self.bounded("get_ban", key, conn.get(key)).await?;

        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put_ban(&self, key: &str, record: &BanRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record)?;
        self.bounded("put_ban", key, conn.set::<_, _, ()>(key, json))
            .await
    }

    async fn update_ban(
        &self,
        key: &str,
        identity: &str,
        apply: BanUpdate<'_>,
    ) -> Result<(BanRecord, Transition)> {
        let mut conn = self.conn.clone();

        for attempt in 1..=MAX_SWAP_ATTEMPTS {
            let raw: Option<String> = self.bounded("update_ban", key, conn.get(key)).await?;
            let mut record = match raw.as_deref() {
                Some(json) => serde_json::from_str(json)?,
                None => BanRecord::new(identity),
            };

            let transition = apply(&mut record);
            if transition == Transition::Unchanged {
                return Ok((record, transition));
            }

            let json = serde_json::to_string(&record)?;
            let mut invocation = self.swap_ban_script.prepare_invoke();
            invocation
                .key(key)
                .arg(raw.as_deref().unwrap_or(""))
                .arg(json);

            let swapped: i64 = self
                .bounded("update_ban", key, invocation.invoke_async(&mut conn))
                .await?;
            if swapped == 1 {
                return Ok((record, transition));
            }

            debug!(key = %key, attempt, "Ban record changed underneath us, retrying");
        }

        warn!(key = %key, attempts = MAX_SWAP_ATTEMPTS, "Ban update kept losing the race");
        Err(GatekeeperError::StoreUnavailable(format!(
            "ban record {} under contention",
            key
        )))
    }
}
