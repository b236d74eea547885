//! HTTP middleware: request logging and per-IP rate limiting.

pub mod logging;
pub mod rate_limit;

pub use rate_limit::{IpRateLimiter, RateLimitConfig, RateLimitResult};
