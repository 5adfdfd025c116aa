//! Progressive rate limiting.
//!
//! Provides:
//! - Exponential delay per identity and subnet
//! - Rolling expiry window for failures
//! - Optional fast exit while the current delay has not elapsed

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::RateLimitError;
use crate::log::{FailureLog, FailureRecord};

/// Failures beyond this count always receive the maximum delay.
const MAX_EXPONENT: u64 = 63;

/// Authentication action being rate limited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Login,
    Recovery,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Login => "login",
            Action::Recovery => "recovery",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rate limiter configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    /// Reject immediately while the current delay is in effect
    #[serde(default)]
    pub fast_exit: bool,
    /// Delay after the first failure, in seconds
    #[serde(default = "default_first_delay")]
    pub first_delay: f64,
    /// Upper bound on the delay, in seconds
    #[serde(default = "default_max_delay")]
    pub max_delay: f64,
    /// How long a failure counts, in seconds
    #[serde(default = "default_expire")]
    pub expire: u64,
    #[serde(default = "default_ipv4_prefix")]
    pub ipv4_prefix: u8,
    #[serde(default = "default_ipv6_prefix")]
    pub ipv6_prefix: u8,
}

fn default_first_delay() -> f64 {
    0.25
}

fn default_max_delay() -> f64 {
    30.0
}

fn default_expire() -> u64 {
    43_200 // 12 hours
}

fn default_ipv4_prefix() -> u8 {
    32
}

fn default_ipv6_prefix() -> u8 {
    128
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            fast_exit: false,
            first_delay: default_first_delay(),
            max_delay: default_max_delay(),
            expire: default_expire(),
            ipv4_prefix: default_ipv4_prefix(),
            ipv6_prefix: default_ipv6_prefix(),
        }
    }
}

/// Delay owed after `attempts` recent failures, rounded up to the millisecond.
pub fn backoff_delay(config: &RateLimitConfig, attempts: u64) -> Duration {
    if attempts == 0 {
        return Duration::ZERO;
    }
    let seconds = if attempts > MAX_EXPONENT {
        config.max_delay
    } else {
        (config.first_delay * 2f64.powi(attempts as i32)).min(config.max_delay)
    };
    Duration::from_millis((seconds.max(0.0) * 1000.0).ceil() as u64)
}

/// Rate limiter that slows repeated failures down exponentially.
pub struct ProgressiveRateLimiter {
    config: RateLimitConfig,
    log: Arc<dyn FailureLog>,
}

impl ProgressiveRateLimiter {
    pub fn new(config: RateLimitConfig, log: Arc<dyn FailureLog>) -> Self {
        Self { config, log }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Network of `ip` under the configured prefix, as `addr/prefix`.
    pub fn subnet(&self, ip: IpAddr) -> String {
        match ip {
            IpAddr::V4(v4) => {
                let prefix = self.config.ipv4_prefix.min(32);
                let mask = if prefix == 0 {
                    0
                } else {
                    u32::MAX << (32 - u32::from(prefix))
                };
                format!("{}/{}", Ipv4Addr::from(u32::from(v4) & mask), prefix)
            }
            IpAddr::V6(v6) => {
                let prefix = self.config.ipv6_prefix.min(128);
                let mask = if prefix == 0 {
                    0
                } else {
                    u128::MAX << (128 - u32::from(prefix))
                };
                format!("{}/{}", Ipv6Addr::from(u128::from(v6) & mask), prefix)
            }
        }
    }

    /// Failures for this identity or subnet within the expiry window.
    pub async fn failed_attempts(
        &self,
        identity: &str,
        ip: IpAddr,
        action: Action,
    ) -> Result<u64, RateLimitError> {
        let since = window_start(self.config.expire);
        self.log
            .count_since(action, identity, &self.subnet(ip), since)
            .await
    }

    /// How long the caller should wait before processing this attempt.
    pub async fn delay(
        &self,
        identity: &str,
        ip: IpAddr,
        action: Action,
    ) -> Result<Duration, RateLimitError> {
        let attempts = self.failed_attempts(identity, ip, action).await?;
        let delay = backoff_delay(&self.config, attempts);
        if !delay.is_zero() {
            debug!(action = %action, attempts, delay_ms = delay.as_millis() as u64, "Throttling attempt");
        }
        Ok(delay)
    }

    /// Whether this attempt should be rejected without processing.
    ///
    /// Only when fast exit is enabled: true if a failure for the identity or
    /// subnet happened within the current delay (in whole seconds).
    pub async fn fail_fast(
        &self,
        identity: &str,
        ip: IpAddr,
        action: Action,
    ) -> Result<bool, RateLimitError> {
        if !self.config.fast_exit {
            return Ok(false);
        }
        let delay = self.delay(identity, ip, action).await?;
        if delay.is_zero() {
            return Ok(false);
        }

        let recent = self
            .log
            .count_since(action, identity, &self.subnet(ip), window_start(delay.as_secs()))
            .await?;
        Ok(recent > 0)
    }

    /// Record a failed attempt and drop failures too old to count.
    pub async fn register_failure(
        &self,
        identity: &str,
        ip: IpAddr,
        action: Action,
    ) -> Result<(), RateLimitError> {
        let subnet = self.subnet(ip);
        warn!(action = %action, subnet = %subnet, "Failed attempt");
        self.log
            .record(FailureRecord {
                action,
                identity: identity.to_string(),
                ip,
                subnet,
                occurred: Utc::now(),
            })
            .await?;

        let pruned = self.log.prune(window_start(self.retention_secs())).await?;
        if pruned > 0 {
            debug!(pruned, "Dropped expired failures");
        }
        Ok(())
    }

    /// Longest lookback of any query: the expiry window, or the largest
    /// fast-exit window if that is longer.
    fn retention_secs(&self) -> u64 {
        let max_delay = self.config.max_delay.max(0.0).ceil() as u64;
        self.config.expire.max(max_delay)
    }
}

/// Start of a window reaching `secs` seconds back from now.
fn window_start(secs: u64) -> DateTime<Utc> {
    let secs = i64::try_from(secs).unwrap_or(i64::MAX).min(i64::MAX / 1000);
    Utc::now()
        .checked_sub_signed(chrono::Duration::seconds(secs))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
