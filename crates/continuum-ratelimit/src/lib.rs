//! # continuum-ratelimit
//!
//! Progressive rate limiting for authentication endpoints.
//!
//! Failed attempts are recorded per (identity, subnet, action). Each new
//! attempt is delayed by `first_delay * 2^failures`, capped at `max_delay`,
//! counting only failures inside a rolling `expire` window. With fast exit
//! enabled, callers can reject a request outright while the delay from the
//! most recent failure has not yet elapsed.

pub mod error;
pub mod limiter;
pub mod log;
#[cfg(test)]
mod proptests;

pub use error::RateLimitError;
pub use limiter::{backoff_delay, Action, ProgressiveRateLimiter, RateLimitConfig};
pub use log::{FailureLog, FailureRecord, MemoryFailureLog};
