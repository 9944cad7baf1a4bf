//! Controller configuration
//!
//! Loaded from the YAML file mounted into the extension pod. Every field has
//! a default so a partial (or missing) file still yields a usable
//! configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default location of the mounted configuration file.
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ControllerConfig {
    /// Concurrent reconciles per kind
    pub concurrency: ConcurrencyConfig,

    /// Retry and backoff periods
    pub retry: RetryConfig,

    /// Upper bound of a single reconcile
    pub reconcile: ReconcileConfig,

    /// Health endpoint
    pub health: HealthConfig,

    /// Bastion defaults
    pub bastion: BastionConfig,

    /// DNS record defaults
    pub dns: DnsConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConcurrencyConfig {
    pub infrastructure: u16,
    pub worker: u16,
    pub bastion: u16,
    pub backup_bucket: u16,
    pub backup_entry: u16,
    pub dns_record: u16,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            infrastructure: 5,
            worker: 5,
            bastion: 5,
            backup_bucket: 5,
            backup_entry: 5,
            dns_record: 5,
        }
    }
}

/// Retry periods in seconds.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryConfig {
    /// Retry period of rate limits and retryable errors.
    pub retry_after_seconds: u64,
    /// Retry period of errors that need user action.
    pub long_retry_seconds: u64,
    /// First delay of the dependency backoff.
    pub backoff_base_seconds: u64,
    /// Cap of the dependency backoff.
    pub backoff_max_seconds: u64,
    /// Consecutive dependency failures before the reconcile fails.
    pub dependency_budget: u32,
    /// Retry period of unclassified errors.
    pub unclassified_seconds: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry_after_seconds: 30,
            long_retry_seconds: 300,
            backoff_base_seconds: 5,
            backoff_max_seconds: 300,
            dependency_budget: 10,
            unclassified_seconds: 30,
        }
    }
}

impl RetryConfig {
    #[must_use]
    pub fn retry_after(&self) -> Duration {
        Duration::from_secs(self.retry_after_seconds)
    }

    #[must_use]
    pub fn long_retry_period(&self) -> Duration {
        Duration::from_secs(self.long_retry_seconds)
    }

    #[must_use]
    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_seconds)
    }

    #[must_use]
    pub fn unclassified(&self) -> Duration {
        Duration::from_secs(self.unclassified_seconds)
    }

    /// Delay after the `attempt`-th consecutive dependency failure (1-based):
    /// the base doubled per attempt, capped at the maximum.
    #[must_use]
    pub fn dependency_backoff(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(31);
        let seconds = self
            .backoff_base_seconds
            .saturating_mul(1_u64 << exponent)
            .min(self.backoff_max_seconds);
        Duration::from_secs(seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconcileConfig {
    /// Deadline of one reconcile in seconds.
    pub timeout_seconds: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 1800,
        }
    }
}

impl ReconcileConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_seconds)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthConfig {
    pub port: u16,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self { port: 8080 }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BastionConfig {
    /// Machine type of bastion VMs when the cloud profile names none.
    pub machine_type: String,
    /// Admin user created on the bastion VM.
    pub admin_username: String,
    /// Requeue period while the bastion has no addresses.
    pub ready_retry_seconds: u64,
    /// OS disk size in GiB.
    pub disk_size_gb: i32,
}

impl Default for BastionConfig {
    fn default() -> Self {
        Self {
            machine_type: "Standard_B1s".to_string(),
            admin_username: "gardener".to_string(),
            ready_retry_seconds: 5,
            disk_size_gb: 32,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DnsConfig {
    pub default_ttl: i64,
}

impl Default for DnsConfig {
    fn default() -> Self {
        Self { default_ttl: 120 }
    }
}

impl ControllerConfig {
    /// Load configuration from a mounted YAML file.
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;
        Self::from_yaml(&config_str)
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml(text: &str) -> Result<Self, anyhow::Error> {
        serde_yaml::from_str(text).map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    /// Rejects values the controllers cannot work with.
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        let concurrency = &self.concurrency;
        for (kind, value) in [
            ("infrastructure", concurrency.infrastructure),
            ("worker", concurrency.worker),
            ("bastion", concurrency.bastion),
            ("backupBucket", concurrency.backup_bucket),
            ("backupEntry", concurrency.backup_entry),
            ("dnsRecord", concurrency.dns_record),
        ] {
            if value == 0 {
                return Err(anyhow::anyhow!("concurrency.{kind} must be at least 1"));
            }
        }

        let retry = &self.retry;
        if retry.retry_after_seconds == 0 || retry.backoff_base_seconds == 0 {
            return Err(anyhow::anyhow!(
                "retry.retryAfterSeconds and retry.backoffBaseSeconds must be positive"
            ));
        }
        if retry.backoff_max_seconds < retry.backoff_base_seconds {
            return Err(anyhow::anyhow!(
                "retry.backoffMaxSeconds must not be smaller than retry.backoffBaseSeconds"
            ));
        }
        if retry.dependency_budget == 0 {
            return Err(anyhow::anyhow!("retry.dependencyBudget must be at least 1"));
        }
        if self.reconcile.timeout_seconds == 0 {
            return Err(anyhow::anyhow!("reconcile.timeoutSeconds must be positive"));
        }
        if self.bastion.machine_type.is_empty() || self.bastion.admin_username.is_empty() {
            return Err(anyhow::anyhow!(
                "bastion.machineType and bastion.adminUsername must be set"
            ));
        }
        if self.dns.default_ttl <= 0 {
            return Err(anyhow::anyhow!("dns.defaultTtl must be positive"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = ControllerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.retry.retry_after(), Duration::from_secs(30));
        assert_eq!(config.health.port, 8080);
        assert_eq!(config.dns.default_ttl, 120);
    }

    #[test]
    fn partial_yaml_keeps_defaults() {
        let config = ControllerConfig::from_yaml(
            "retry:\n  retryAfterSeconds: 10\nconcurrency:\n  worker: 2\n",
        )
        .unwrap();
        assert_eq!(config.retry.retry_after_seconds, 10);
        assert_eq!(config.retry.long_retry_seconds, 300);
        assert_eq!(config.concurrency.worker, 2);
        assert_eq!(config.concurrency.infrastructure, 5);
    }

    #[test]
    fn zero_concurrency_is_rejected() {
        let mut config = ControllerConfig::default();
        config.concurrency.bastion = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn dependency_backoff_doubles_up_to_the_cap() {
        let retry = RetryConfig::default();
        let delays: Vec<u64> = (1..=8)
            .map(|attempt| retry.dependency_backoff(attempt).as_secs())
            .collect();
        assert_eq!(delays, vec![5, 10, 20, 40, 80, 160, 300, 300]);
    }

    #[test]
    fn missing_file_is_an_error() {
        assert!(ControllerConfig::from_mounted_file("/nonexistent/config.yaml").is_err());
    }
}
