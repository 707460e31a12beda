pub mod rate_limiting;

pub use rate_limiting::{RateLimitDecision, RateLimitRequest, RateLimitStatus, RateLimiter};
