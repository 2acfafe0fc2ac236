//! Sync engine configuration.
//!
//! Every field has a default, so a config file only needs the values it
//! overrides. Unknown keys are rejected to catch typos early.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::conflict::PolicyRegistry;
use crate::error::{Error, Result};

const DEFAULT_BATCH_SIZE: usize = 50;
const DEFAULT_PAGE_SIZE: usize = 200;
const DEFAULT_TRANSPORT_TIMEOUT_MS: u64 = 15_000;
const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;
const DEFAULT_DEBOUNCE_MS: u64 = 2_000;
const DEFAULT_BACKOFF_BASE_MS: u64 = 2_000;
const DEFAULT_BACKOFF_CAP_MS: u64 = 5 * 60 * 1_000;
const DEFAULT_MAX_RETRY_COUNT: u32 = 10;
const DEFAULT_MAX_CONSECUTIVE_FAILURES: u32 = 5;
const DEFAULT_MAX_PUSH_ROUNDS: usize = 20;
const DEFAULT_TOMBSTONE_RETENTION_DAYS: u32 = 30;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SyncConfig {
    /// Operations per push request
    pub batch_size: usize,
    /// Records per pull page
    pub page_size: usize,
    /// Per-request transport timeout
    pub transport_timeout_ms: u64,
    /// Periodic sync interval while online
    pub sync_interval_secs: u64,
    /// Quiet period before a local enqueue triggers a cycle
    pub debounce_ms: u64,
    pub backoff_base_ms: u64,
    pub backoff_cap_ms: u64,
    /// Retries after which an operation is surfaced to the user and becomes discardable
    pub max_retry_count: u32,
    /// Failed cycles in a row before the scheduler reports an error
    pub max_consecutive_failures: u32,
    /// Upper bound on push rounds per cycle
    pub max_push_rounds: usize,
    pub tombstone_retention_days: u32,
    /// Field policies per entity type
    pub policies: PolicyRegistry,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            batch_size: DEFAULT_BATCH_SIZE,
            page_size: DEFAULT_PAGE_SIZE,
            transport_timeout_ms: DEFAULT_TRANSPORT_TIMEOUT_MS,
            sync_interval_secs: DEFAULT_SYNC_INTERVAL_SECS,
            debounce_ms: DEFAULT_DEBOUNCE_MS,
            backoff_base_ms: DEFAULT_BACKOFF_BASE_MS,
            backoff_cap_ms: DEFAULT_BACKOFF_CAP_MS,
            max_retry_count: DEFAULT_MAX_RETRY_COUNT,
            max_consecutive_failures: DEFAULT_MAX_CONSECUTIVE_FAILURES,
            max_push_rounds: DEFAULT_MAX_PUSH_ROUNDS,
            tombstone_retention_days: DEFAULT_TOMBSTONE_RETENTION_DAYS,
            policies: PolicyRegistry::restaurant_defaults(),
        }
    }
}

impl SyncConfig {
    /// Parse a JSON config, filling in defaults for missing fields.
    pub fn from_json_str(payload: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(payload)?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON config file
    pub fn load(path: &Path) -> Result<Self> {
        let payload = std::fs::read_to_string(path)?;
        Self::from_json_str(&payload)
    }

    pub fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(Error::InvalidInput("batch_size must be at least 1".to_string()));
        }
        if self.page_size == 0 {
            return Err(Error::InvalidInput("page_size must be at least 1".to_string()));
        }
        if self.sync_interval_secs == 0 {
            return Err(Error::InvalidInput(
                "sync_interval_secs must be at least 1".to_string(),
            ));
        }
        if self.max_push_rounds == 0 {
            return Err(Error::InvalidInput(
                "max_push_rounds must be at least 1".to_string(),
            ));
        }
        if self.backoff_base_ms == 0 || self.backoff_cap_ms < self.backoff_base_ms {
            return Err(Error::InvalidInput(format!(
                "backoff must satisfy 0 < base ({}) <= cap ({})",
                self.backoff_base_ms, self.backoff_cap_ms
            )));
        }
        Ok(())
    }

    #[must_use]
    pub const fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    #[must_use]
    pub const fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size;
        self
    }

    #[must_use]
    pub fn with_transport_timeout(mut self, timeout: Duration) -> Self {
        self.transport_timeout_ms = duration_ms(timeout);
        self
    }

    #[must_use]
    pub fn with_sync_interval(mut self, interval: Duration) -> Self {
        self.sync_interval_secs = interval.as_secs();
        self
    }

    #[must_use]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce_ms = duration_ms(debounce);
        self
    }

    #[must_use]
    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base_ms = duration_ms(base);
        self.backoff_cap_ms = duration_ms(cap);
        self
    }

    #[must_use]
    pub const fn with_max_retry_count(mut self, max_retry_count: u32) -> Self {
        self.max_retry_count = max_retry_count;
        self
    }

    #[must_use]
    pub const fn with_max_consecutive_failures(mut self, failures: u32) -> Self {
        self.max_consecutive_failures = failures;
        self
    }

    #[must_use]
    pub const fn with_tombstone_retention_days(mut self, days: u32) -> Self {
        self.tombstone_retention_days = days;
        self
    }

    #[must_use]
    pub fn with_policies(mut self, policies: PolicyRegistry) -> Self {
        self.policies = policies;
        self
    }

    pub const fn transport_timeout(&self) -> Duration {
        Duration::from_millis(self.transport_timeout_ms)
    }

    pub const fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs)
    }

    pub const fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub const fn backoff_base(&self) -> Duration {
        Duration::from_millis(self.backoff_base_ms)
    }

    pub const fn backoff_cap(&self) -> Duration {
        Duration::from_millis(self.backoff_cap_ms)
    }

    /// Tombstone and compaction retention window in milliseconds
    pub fn retention_ms(&self) -> i64 {
        i64::from(self.tombstone_retention_days) * 24 * 60 * 60 * 1_000
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conflict::FieldPolicy;

    #[test]
    fn missing_fields_use_defaults() {
        let config = SyncConfig::from_json_str(r#"{ "batch_size": 10 }"#).unwrap();
        assert_eq!(config.batch_size, 10);
        assert_eq!(config.page_size, DEFAULT_PAGE_SIZE);
        assert_eq!(config.sync_interval(), Duration::from_secs(30));
        assert_eq!(config.debounce(), Duration::from_secs(2));
        assert_eq!(config.backoff_cap(), Duration::from_secs(300));
        assert_eq!(
            config.policies.policy_for("order").field("cash_amount"),
            &FieldPolicy::Monetary
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        let error = SyncConfig::from_json_str(r#"{ "batch_sise": 10 }"#).unwrap_err();
        assert!(error.to_string().contains("unknown field"));
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(SyncConfig::from_json_str(r#"{ "page_size": 0 }"#).is_err());
        assert!(
            SyncConfig::from_json_str(r#"{ "backoff_base_ms": 5000, "backoff_cap_ms": 1000 }"#)
                .is_err()
        );
    }

    #[test]
    fn builders_override_values() {
        let config = SyncConfig::default()
            .with_batch_size(5)
            .with_backoff(Duration::from_millis(100), Duration::from_secs(1))
            .with_debounce(Duration::from_millis(250));
        assert_eq!(config.batch_size, 5);
        assert_eq!(config.backoff_base_ms, 100);
        assert_eq!(config.backoff_cap_ms, 1_000);
        assert_eq!(config.debounce_ms, 250);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn policies_can_be_replaced_from_file() {
        let config = SyncConfig::from_json_str(
            r#"{ "policies": { "tab": { "fields": { "balance": { "policy": "monetary" } } } } }"#,
        )
        .unwrap();
        assert_eq!(
            config.policies.policy_for("tab").field("balance"),
            &FieldPolicy::Monetary
        );
        assert_eq!(
            config.policies.policy_for("order").field("cash_amount"),
            &FieldPolicy::LastWriterWins
        );
    }
}
