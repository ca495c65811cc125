//! Core ratelimiter engine.

use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, trace};

use super::ban::{Ban, BanPolicy, BanStatus, BanTracker};
use super::clock::{Clock, SystemClock};
use super::store::{counter_key, CounterStore};
use crate::error::{GatekeeperError, Result};

/// Longest identity accepted, in bytes.
const MAX_IDENTITY_LEN: usize = 256;

/// Immutable settings for one ratelimiter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RatelimiterOptions {
    /// Maximum admitted requests per window
    pub limit: u64,
    /// Window length
    pub reset: Duration,
    /// Key namespace for counters and ban records
    pub redis_prefix: String,
    /// Overflow events before a temporary ban
    pub temp_ban_after: u32,
    /// Temporary bans before a permanent ban
    pub perm_ban_after: u32,
    /// Length of a temporary ban
    pub temp_ban_length: Duration,
}

impl RatelimiterOptions {
    /// Reject settings that cannot describe a working limiter.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| {
            Err(GatekeeperError::ConfigInvalid(format!(
                "{} ({})",
                msg, self.redis_prefix
            )))
        };

        if self.limit == 0 {
            return invalid("limit must be greater than zero");
        }
        if self.reset.is_zero() {
            return invalid("reset must be greater than zero");
        }
        if self.redis_prefix.trim().is_empty() {
            return invalid("redis_prefix must not be empty");
        }
        if self.temp_ban_after == 0 {
            return invalid("temp_ban_after must be greater than zero");
        }
        if self.perm_ban_after == 0 {
            return invalid("perm_ban_after must be greater than zero");
        }
        if self.temp_ban_length.is_zero() {
            return invalid("temp_ban_length must be greater than zero");
        }
        Ok(())
    }

    fn ban_policy(&self) -> BanPolicy {
        BanPolicy {
            temp_ban_after: self.temp_ban_after,
            perm_ban_after: self.perm_ban_after,
            temp_ban_length: self.temp_ban_length,
        }
    }
}

/// Window usage reported with a counted request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u64,
    pub remaining: u64,
    pub resets_in: Duration,
}

/// Outcome of an admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Within the window limit
    Allow(Quota),
    /// Counted against the window, but over the limit
    RejectOverLimit(Quota),
    /// Banned; the window counter was not touched
    RejectBanned(Ban),
}

impl Decision {
    /// Whether the request may proceed.
    pub fn is_allowed(&self) -> bool {
        matches!(self, Decision::Allow(_))
    }
}

/// Check that an identity can be used as a key suffix.
pub fn validate_identity(identity: &str) -> Result<()> {
    if identity.is_empty() {
        return Err(GatekeeperError::InvalidIdentity("identity is empty".to_string()));
    }
    if identity.len() > MAX_IDENTITY_LEN {
        return Err(GatekeeperError::InvalidIdentity(format!(
            "identity exceeds {} bytes",
            MAX_IDENTITY_LEN
        )));
    }
    if identity.chars().any(|c| c.is_whitespace() || c.is_control()) {
        return Err(GatekeeperError::InvalidIdentity(
            "identity contains whitespace or control characters".to_string(),
        ));
    }
    // Would alias the ban key namespace.
    if identity.starts_with("ban:") {
        return Err(GatekeeperError::InvalidIdentity(
            "identity uses the reserved ban: segment".to_string(),
        ));
    }
    Ok(())
}

/// Combines window counting and ban escalation for one traffic class.
///
/// Holds no mutable state of its own; everything shared lives in the
/// counter store, so one instance can serve any number of tasks.
pub struct Ratelimiter {
    options: RatelimiterOptions,
    store: Arc<dyn CounterStore>,
    bans: BanTracker,
    clock: Arc<dyn Clock>,
}

impl Ratelimiter {
    /// Create a ratelimiter using the system clock.
    pub fn new(options: RatelimiterOptions, store: Arc<dyn CounterStore>) -> Result<Self> {
        Self::with_clock(options, store, Arc::new(SystemClock))
    }

    /// Create a ratelimiter with an explicit clock.
    pub fn with_clock(
        options: RatelimiterOptions,
        store: Arc<dyn CounterStore>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        options.validate()?;

        debug!(
            prefix = %options.redis_prefix,
            limit = options.limit,
            reset_ms = options.reset.as_millis() as u64,
            temp_ban_after = options.temp_ban_after,
            perm_ban_after = options.perm_ban_after,
            "Creating ratelimiter"
        );

        let bans = BanTracker::new(store.clone(), &options.redis_prefix, options.ban_policy());
        Ok(Self {
            options,
            store,
            bans,
            clock,
        })
    }

    /// The options this limiter was built with.
    pub fn options(&self) -> &RatelimiterOptions {
        &self.options
    }

    /// Key namespace of this limiter.
    pub fn prefix(&self) -> &str {
        &self.options.redis_prefix
    }

    /// Decide whether `identity` may make another request.
    ///
    /// Banned identities are rejected before the window counter is read,
    /// so they neither consume nor reset quota. Every other call counts
    /// once against the window, and each request past the limit is one
    /// overflow event for the ban tracker.
    #[instrument(skip(self), fields(prefix = %self.options.redis_prefix))]
    pub async fn admit(&self, identity: &str) -> Result<Decision> {
        validate_identity(identity)?;

        let status = self.bans.check_status(identity, self.clock.now()).await?;
        if let BanStatus::Banned(ban) = status {
            debug!(identity = %identity, ban = ?ban, "Rejecting banned identity");
            return Ok(Decision::RejectBanned(ban));
        }

        let key = counter_key(&self.options.redis_prefix, identity);
        let window = self.store.increment(&key, self.options.reset).await?;

        trace!(key = %key, count = window.count, limit = self.options.limit, "Window counted");

        let quota = Quota {
            limit: self.options.limit,
            remaining: self.options.limit.saturating_sub(window.count),
            resets_in: window.resets_in,
        };

        if window.count <= self.options.limit {
            return Ok(Decision::Allow(quota));
        }

        debug!(
            key = %key,
            count = window.count,
            limit = self.options.limit,
            "Rate limit exceeded"
        );

        self.bans.record_overflow(identity, self.clock.now()).await?;
        Ok(Decision::RejectOverLimit(quota))
    }
}
