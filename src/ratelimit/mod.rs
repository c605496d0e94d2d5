//! Rate limiting logic and state management.

mod backend;
mod counter;
pub mod descriptor;
mod limiter;
mod memory;
mod policy;
pub mod presets;
mod redis;
mod response;

pub use backend::{admit_all, Admission};
pub use counter::{CounterStore, RateWindow};
pub use descriptor::{KeyDerivation, LimitKey, RequestContext, WILDCARD_IDENTITY};
pub use limiter::{Decision, KeyState, RateLimitInfo, RateLimiter, DEFAULT_OPERATION_TIMEOUT};
pub use memory::MemoryCounterStore;
pub use policy::{LimitEvent, LimitHook, PolicyBuilder, PolicyConfig};
pub use presets::{LimiterFactory, PolicySet, TieredLimiter};
pub use self::redis::RedisCounterStore;
pub use response::{
    RateLimitHeaders, RateLimitRejection, RejectionBody, RejectionError, HEADER_LIMIT,
    HEADER_REMAINING, HEADER_RESET, HEADER_RETRY_AFTER, RATE_LIMIT_ERROR,
    STATUS_TOO_MANY_REQUESTS,
};
