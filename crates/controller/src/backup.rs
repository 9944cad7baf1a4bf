//! Backup buckets and entries.
//!
//! A bucket is a blob container in the storage account of the backup secret.
//! An entry is every blob below `<entry>/` in that container.

use azure_cloud::blob::delete_prefix;
use azure_cloud::resources::{
    BlobContainer, ImmutabilityPolicy, ImmutabilityPolicyProperties,
};
use azure_cloud::{ArmResource, ClientFactory, ResourceId};
use azure_config::api::BackupBucketConfig;
use tracing::{info, instrument, warn};

use crate::context::ReconcileContext;
use crate::error::{Error, Result};

/// Prefix of entries that were copied from a source backup.
const SOURCE_ENTRY_PREFIX: &str = "backup-source-";

const POLICY_NAME: &str = "default";
const SECONDS_PER_DAY: u64 = 24 * 60 * 60;

/// Inputs of one bucket operation.
#[derive(Debug, Clone, Copy)]
pub struct BucketRequest<'a> {
    pub bucket_name: &'a str,
    pub resource_group: &'a str,
    pub config: &'a BackupBucketConfig,
}

fn storage_account(factory: &ClientFactory) -> Result<&str> {
    factory
        .storage_account()
        .ok_or_else(|| Error::MissingResource("storage account in backup secret".to_string()))
}

/// ID of the container of `bucket`.
#[must_use]
pub fn container_id(
    subscription: &str,
    resource_group: &str,
    account: &str,
    bucket: &str,
) -> ResourceId {
    ResourceId::resource(
        subscription,
        resource_group,
        "Microsoft.Storage/storageAccounts",
        account,
    )
    .child("blobServices", "default")
    .child("containers", bucket)
}

/// Retention of the policy in whole days, at least one.
#[must_use]
pub fn retention_days(config: &BackupBucketConfig) -> Option<i32> {
    config.immutability.as_ref().map(|immutability| {
        let days = immutability.retention_period.as_secs() / SECONDS_PER_DAY;
        i32::try_from(days).unwrap_or(i32::MAX).max(1)
    })
}

/// Prefix of the blobs of an entry.
#[must_use]
pub fn entry_prefix(entry_name: &str) -> String {
    let name = entry_name
        .strip_prefix(SOURCE_ENTRY_PREFIX)
        .unwrap_or(entry_name);
    format!("{name}/")
}

/// Creates the bucket container and converges its immutability policy.
#[instrument(skip_all, fields(bucket = request.bucket_name))]
pub async fn reconcile_bucket(
    factory: &ClientFactory,
    ctx: &ReconcileContext,
    request: &BucketRequest<'_>,
) -> Result<()> {
    let account = storage_account(factory)?;
    let id = container_id(
        factory.subscription_id(),
        request.resource_group,
        account,
        request.bucket_name,
    );
    let containers = factory.blob_containers();
    if ctx.run(containers.get(&id)).await?.is_none() {
        ctx.run(containers.create_or_update(&id, &BlobContainer::default()))
            .await?;
        info!(container = %request.bucket_name, "Created backup container");
    }

    let policies = factory.immutability_policies();
    let policy_id = id.child("immutabilityPolicies", POLICY_NAME);
    let existing = ctx.run(policies.get(&policy_id)).await?;

    let (Some(days), Some(immutability)) =
        (retention_days(request.config), request.config.immutability.as_ref())
    else {
        if existing.is_some() {
            warn!(
                container = %request.bucket_name,
                "Immutability is no longer configured; the existing policy is left in place"
            );
        }
        return Ok(());
    };

    let current = existing.as_ref();
    let locked = current.is_some_and(|policy| {
        policy.properties.state.as_deref() == Some("Locked")
    });
    let current_days = current.map(|policy| policy.properties.immutability_period_since_creation_in_days);
    if locked {
        if current_days != Some(days) {
            warn!(
                current = ?current_days,
                wanted = days,
                "Immutability policy is locked and keeps its retention"
            );
        }
        return Ok(());
    }

    let policy = if current_days == Some(days) {
        existing
    } else {
        let desired = ImmutabilityPolicy {
            etag: None,
            properties: ImmutabilityPolicyProperties {
                immutability_period_since_creation_in_days: days,
                state: None,
                allow_protected_append_writes: Some(false),
            },
        };
        info!(days, "Setting immutability policy");
        Some(ctx.run(policies.create_or_update(&policy_id, &desired)).await?)
    };

    if immutability.locked {
        let etag = policy
            .as_ref()
            .and_then(|policy| policy.etag.as_deref())
            .unwrap_or("*");
        ctx.run(policies.action(&policy_id, "lock", &[("If-Match", etag)]))
            .await?;
        info!(kind = ImmutabilityPolicy::RESOURCE_TYPE, "Locked immutability policy");
    }
    Ok(())
}

/// Deletes the bucket container with all its blobs.
#[instrument(skip_all, fields(bucket = request.bucket_name))]
pub async fn delete_bucket(
    factory: &ClientFactory,
    ctx: &ReconcileContext,
    request: &BucketRequest<'_>,
) -> Result<()> {
    let account = storage_account(factory)?;
    let id = container_id(
        factory.subscription_id(),
        request.resource_group,
        account,
        request.bucket_name,
    );
    ctx.run(factory.blob_containers().delete(&id)).await
}

/// Deletes the blobs of an entry and returns how many there were.
#[instrument(skip(factory, ctx))]
pub async fn delete_entry(
    factory: &ClientFactory,
    ctx: &ReconcileContext,
    bucket_name: &str,
    entry_name: &str,
) -> Result<usize> {
    let account = storage_account(factory)?;
    let blobs = factory.blobs();
    let prefix = entry_prefix(entry_name);
    ctx.run(delete_prefix(blobs.as_ref(), account, bucket_name, &prefix))
        .await
}
