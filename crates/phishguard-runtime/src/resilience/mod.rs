//! Resilience patterns for provider calls.

mod rate_limit;

pub use rate_limit::{RequestRateLimiter, DEFAULT_REQUESTS_PER_MINUTE};
