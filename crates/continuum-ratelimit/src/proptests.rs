//! Property-based tests for continuum-ratelimit.
//!
//! # Properties Tested
//!
//! - Delay never decreases as failures accumulate and never exceeds the cap
//! - Subnet masking clears every bit below the prefix

#![cfg(test)]

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::sync::Arc;
use std::time::Duration;

use proptest::prelude::*;

use crate::limiter::{backoff_delay, ProgressiveRateLimiter, RateLimitConfig};
use crate::log::MemoryFailureLog;

fn limiter(ipv4_prefix: u8, ipv6_prefix: u8) -> ProgressiveRateLimiter {
    ProgressiveRateLimiter::new(
        RateLimitConfig {
            ipv4_prefix,
            ipv6_prefix,
            ..RateLimitConfig::default()
        },
        Arc::new(MemoryFailureLog::new()),
    )
}

// =============================================================================
// Backoff
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    /// The delay is monotonic in the failure count and bounded by max_delay.
    #[test]
    fn prop_backoff_monotonic_and_capped(
        attempts in 0u64..200,
        first_delay in 0.001f64..5.0,
        max_delay in 1.0f64..120.0,
    ) {
        let config = RateLimitConfig {
            first_delay,
            max_delay,
            ..RateLimitConfig::default()
        };
        let cap = Duration::from_millis((max_delay * 1000.0).ceil() as u64);

        let current = backoff_delay(&config, attempts);
        let next = backoff_delay(&config, attempts + 1);
        prop_assert!(next >= current);
        prop_assert!(current <= cap);
        prop_assert_eq!(current.is_zero(), attempts == 0);
    }
}

// =============================================================================
// Subnets
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    /// Masked IPv4 networks keep only the prefix bits.
    #[test]
    fn prop_ipv4_subnet_masks_host_bits(raw in any::<u32>(), prefix in 0u8..=32) {
        let subnet = limiter(prefix, 128).subnet(IpAddr::V4(Ipv4Addr::from(raw)));
        let (addr, len) = subnet.split_once('/').unwrap();
        prop_assert_eq!(len.parse::<u8>().unwrap(), prefix);

        let network = u32::from(addr.parse::<Ipv4Addr>().unwrap());
        let host_bits = 32 - u32::from(prefix);
        if host_bits < 32 {
            prop_assert_eq!(network >> host_bits, raw >> host_bits);
            prop_assert_eq!(network & ((1u64 << host_bits) - 1) as u32, 0);
        } else {
            prop_assert_eq!(network, 0);
        }
    }

    /// Masked IPv6 networks keep only the prefix bits.
    #[test]
    fn prop_ipv6_subnet_masks_host_bits(raw in any::<u128>(), prefix in 0u8..=128) {
        let subnet = limiter(32, prefix).subnet(IpAddr::V6(Ipv6Addr::from(raw)));
        let (addr, len) = subnet.split_once('/').unwrap();
        prop_assert_eq!(len.parse::<u8>().unwrap(), prefix);

        let network = u128::from(addr.parse::<Ipv6Addr>().unwrap());
        let host_bits = 128 - u32::from(prefix);
        if host_bits < 128 {
            prop_assert_eq!(network >> host_bits, raw >> host_bits);
        } else {
            prop_assert_eq!(network, 0);
        }
    }

    /// Two addresses share a subnet exactly when their prefix bits agree.
    #[test]
    fn prop_same_subnet_iff_prefix_bits_agree(a in any::<u32>(), b in any::<u32>(), prefix in 1u8..=32) {
        let limiter = limiter(prefix, 128);
        let shift = 32 - u32::from(prefix);
        let same_prefix = (u64::from(a) >> shift) == (u64::from(b) >> shift);
        prop_assert_eq!(
            limiter.subnet(IpAddr::V4(Ipv4Addr::from(a))) == limiter.subnet(IpAddr::V4(Ipv4Addr::from(b))),
            same_prefix
        );
    }
}
