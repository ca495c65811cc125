//! Per-traffic-class ratelimiter selection.

use std::fmt;
use std::sync::Arc;

use super::limiter::{Ratelimiter, RatelimiterOptions};
use super::store::CounterStore;
use crate::error::Result;

/// A resolved caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    /// Stable identifier, used as the ratelimit identity
    pub id: String,
    /// Whether the caller is entitled to the premium limits
    pub premium: bool,
}

/// The closed set of traffic classes, each with its own ratelimiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TrafficClass {
    Standard,
    Premium,
    /// Callers that could not be resolved
    Fallback,
}

impl TrafficClass {
    /// All classes, in configuration order.
    pub const ALL: [TrafficClass; 3] = [
        TrafficClass::Standard,
        TrafficClass::Premium,
        TrafficClass::Fallback,
    ];

    /// Classify a caller.
    pub fn of(caller: Option<&Caller>) -> Self {
        match caller {
            None => TrafficClass::Fallback,
            Some(c) if c.premium => TrafficClass::Premium,
            Some(_) => TrafficClass::Standard,
        }
    }

    /// Name used in logs and configuration.
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficClass::Standard => "standard",
            TrafficClass::Premium => "premium",
            TrafficClass::Fallback => "fallback",
        }
    }
}

impl fmt::Display for TrafficClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for every traffic class.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryOptions {
    pub standard: RatelimiterOptions,
    pub premium: RatelimiterOptions,
    pub fallback: RatelimiterOptions,
}

/// Holds one ratelimiter per traffic class.
pub struct RatelimiterRegistry {
    standard: Arc<Ratelimiter>,
    premium: Arc<Ratelimiter>,
    fallback: Arc<Ratelimiter>,
}

impl RatelimiterRegistry {
    /// Build every class's limiter on a shared store. Fails on the first
    /// invalid configuration.
    pub fn new(options: RegistryOptions, store: Arc<dyn CounterStore>) -> Result<Self> {
        Ok(Self {
            standard: Arc::new(Ratelimiter::new(options.standard, store.clone())?),
            premium: Arc::new(Ratelimiter::new(options.premium, store.clone())?),
            fallback: Arc::new(Ratelimiter::new(options.fallback, store)?),
        })
    }

    /// Assemble a registry from prebuilt limiters.
    pub fn from_limiters(
        standard: Arc<Ratelimiter>,
        premium: Arc<Ratelimiter>,
        fallback: Arc<Ratelimiter>,
    ) -> Self {
        Self {
            standard,
            premium,
            fallback,
        }
    }

    /// The limiter for `class`.
    pub fn select(&self, class: TrafficClass) -> &Arc<Ratelimiter> {
        match class {
            TrafficClass::Standard => &self.standard,
            TrafficClass::Premium => &self.premium,
            TrafficClass::Fallback => &self.fallback,
        }
    }

    /// Classify `caller` and return its class and limiter.
    pub fn for_caller(&self, caller: Option<&Caller>) -> (TrafficClass, &Arc<Ratelimiter>) {
        let class = TrafficClass::of(caller);
        (class, self.select(class))
    }
}
