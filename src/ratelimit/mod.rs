//! Admission control: window counting, ban escalation and per-class limiters.

mod ban;
mod clock;
mod limiter;
mod memory;
mod redis_store;
mod registry;
mod store;

pub use ban::{Ban, BanPolicy, BanRecord, BanStatus, BanTracker, Transition};
pub use clock::{Clock, ManualClock, SystemClock};
pub use limiter::{validate_identity, Decision, Quota, Ratelimiter, RatelimiterOptions};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use registry::{Caller, RatelimiterRegistry, RegistryOptions, TrafficClass};
pub use store::{ban_key, counter_key, BanUpdate, CounterStore, WindowCount};
