//! Caller resolution for the admission layer.

use async_trait::async_trait;
use axum::extract::ConnectInfo;
use axum::http::request::Parts;
use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::Caller;

/// Header carrying the client address when running behind a proxy.
pub const FORWARDED_FOR: &str = "x-forwarded-for";

/// Longest snowflake ID we accept.
const MAX_SNOWFLAKE_DIGITS: usize = 20;

/// Maps a request to the caller it belongs to.
///
/// Returning `None` means the caller could not be classified; the request
/// is then limited by the fallback class, keyed on the client address.
/// Implementations must only return callers that are known to exist,
/// otherwise rotating made-up IDs buys a fresh quota each time.
#[async_trait]
pub trait CallerResolver: Send + Sync {
    async fn resolve(&self, parts: &Parts) -> Option<Caller>;
}

/// Resolves callers from the `{id}` segment of `/bot/{id}/...` routes.
///
/// Any well-formed ID is accepted without a lookup, so this only suits
/// deployments where the bot routes themselves reject unknown IDs.
#[derive(Debug, Clone, Default)]
pub struct BotPathResolver {
    premium: HashSet<String>,
}

impl BotPathResolver {
    /// Create a resolver treating the given bot IDs as premium.
    pub fn new(premium: HashSet<String>) -> Self {
        Self { premium }
    }
}

#[async_trait]
impl CallerResolver for BotPathResolver {
    async fn resolve(&self, parts: &Parts) -> Option<Caller> {
        let id = bot_id(parts.uri.path())?;
        Some(Caller {
            premium: self.premium.contains(id),
            id: id.to_string(),
        })
    }
}

/// The bot ID in a `/bot/{id}` path, if it looks like a snowflake.
fn bot_id(path: &str) -> Option<&str> {
    let mut segments = path.trim_start_matches('/').split('/');
    if segments.next()? != "bot" {
        return None;
    }
    let id = segments.next()?;
    let valid = !id.is_empty()
        && id.len() <= MAX_SNOWFLAKE_DIGITS
        && id.bytes().all(|b| b.is_ascii_digit());
    valid.then_some(id)
}

/// Client address of a request: the first `X-Forwarded-For` hop when
/// trusted, otherwise the peer socket address.
///
/// A trusted header whose first hop is not an IP address is rejected
/// rather than used as an identity.
pub fn client_ip(parts: &Parts, trust_forwarded_for: bool) -> Result<Option<IpAddr>> {
    if trust_forwarded_for {
        let forwarded = parts
            .headers
            .get(FORWARDED_FOR)
            .map(|v| {
                v.to_str().map_err(|_| {
                    GatekeeperError::InvalidIdentity("non-ASCII X-Forwarded-For".to_string())
                })
            })
            .transpose()?
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty());

        if let Some(hop) = forwarded {
            return hop.parse::<IpAddr>().map(Some).map_err(|_| {
                GatekeeperError::InvalidIdentity(format!(
                    "X-Forwarded-For hop {:?} is not an IP address",
                    hop
                ))
            });
        }
    }

    Ok(parts
        .extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip()))
}
