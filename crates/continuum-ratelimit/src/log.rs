//! Failed attempt storage.

use std::net::IpAddr;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use subtle::ConstantTimeEq;
use tokio::sync::RwLock;

use crate::error::RateLimitError;
use crate::limiter::Action;

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FailureRecord {
    pub action: Action,
    pub identity: String,
    pub ip: IpAddr,
    /// Masked network of `ip`, e.g. `192.168.1.0/24`
    pub subnet: String,
    pub occurred: DateTime<Utc>,
}

/// Storage for failed attempts.
#[async_trait]
pub trait FailureLog: Send + Sync {
    /// Append a failed attempt.
    async fn record(&self, record: FailureRecord) -> Result<(), RateLimitError>;

    /// Count failures for `action` that match `identity` or `subnet` and
    /// occurred strictly after `since`.
    async fn count_since(
        &self,
        action: Action,
        identity: &str,
        subnet: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, RateLimitError>;

    /// Drop failures that occurred at or before `cutoff`. Returns how many
    /// were removed.
    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64, RateLimitError>;
}

/// In-process failure log.
#[derive(Debug, Default)]
pub struct MemoryFailureLog {
    records: RwLock<Vec<FailureRecord>>,
}

impl MemoryFailureLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }
}

#[async_trait]
impl FailureLog for MemoryFailureLog {
    async fn record(&self, record: FailureRecord) -> Result<(), RateLimitError> {
        self.records.write().await.push(record);
        Ok(())
    }

    async fn count_since(
        &self,
        action: Action,
        identity: &str,
        subnet: &str,
        since: DateTime<Utc>,
    ) -> Result<u64, RateLimitError> {
        let records = self.records.read().await;
        let count = records
            .iter()
            .filter(|r| r.action == action && r.occurred > since)
            .filter(|r| {
                // Both comparisons always run.
                let same_identity = r.identity.as_bytes().ct_eq(identity.as_bytes());
                let same_subnet = r.subnet.as_bytes().ct_eq(subnet.as_bytes());
                bool::from(same_identity | same_subnet)
            })
            .count();
        Ok(count as u64)
    }

    async fn prune(&self, cutoff: DateTime<Utc>) -> Result<u64, RateLimitError> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|r| r.occurred > cutoff);
        Ok((before - records.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn record(identity: &str, subnet: &str, action: Action, age_secs: i64) -> FailureRecord {
        FailureRecord {
            action,
            identity: identity.to_string(),
            ip: "10.0.0.1".parse().unwrap(),
            subnet: subnet.to_string(),
            occurred: Utc::now() - Duration::seconds(age_secs),
        }
    }

    #[tokio::test]
    async fn test_count_matches_identity_or_subnet() {
        let log = MemoryFailureLog::new();
        log.record(record("alice", "10.0.0.0/24", Action::Login, 10)).await.unwrap();
        log.record(record("bob", "10.0.0.0/24", Action::Login, 10)).await.unwrap();
        log.record(record("alice", "10.9.9.0/24", Action::Login, 10)).await.unwrap();
        log.record(record("carol", "10.8.8.0/24", Action::Login, 10)).await.unwrap();

        let since = Utc::now() - Duration::seconds(60);
        assert_eq!(
            log.count_since(Action::Login, "alice", "10.0.0.0/24", since).await.unwrap(),
            3
        );
        assert_eq!(
            log.count_since(Action::Login, "dave", "10.7.7.0/24", since).await.unwrap(),
            0
        );
    }

    #[tokio::test]
    async fn test_count_filters_action_and_window() {
        let log = MemoryFailureLog::new();
        log.record(record("alice", "s", Action::Recovery, 10)).await.unwrap();
        log.record(record("alice", "s", Action::Login, 120)).await.unwrap();

        let since = Utc::now() - Duration::seconds(60);
        assert_eq!(log.count_since(Action::Login, "alice", "s", since).await.unwrap(), 0);
        assert_eq!(log.count_since(Action::Recovery, "alice", "s", since).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_prune() {
        let log = MemoryFailureLog::new();
        log.record(record("a", "s", Action::Login, 10)).await.unwrap();
        log.record(record("a", "s", Action::Login, 1000)).await.unwrap();

        assert_eq!(log.prune(Utc::now() - Duration::seconds(60)).await.unwrap(), 1);
        assert_eq!(log.len().await, 1);
        assert!(!log.is_empty().await);
    }
}
