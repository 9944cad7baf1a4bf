use std::time::Duration;

use super::CloudConfiguration;

/// Provider configuration of a backup bucket. An empty payload is valid.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BackupBucketConfig {
    pub immutability: Option<ImmutableConfig>,
    pub cloud_configuration: Option<CloudConfiguration>,
}

/// Time-based retention policy of the bucket container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImmutableConfig {
    pub retention_type: RetentionType,
    pub retention_period: Duration,
    /// A locked policy can only be extended, never removed.
    pub locked: bool,
}

/// Scope of an immutability policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetentionType {
    #[default]
    Bucket,
}
