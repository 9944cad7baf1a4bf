//! Per-kind reconcile functions handed to the controllers.

use std::collections::BTreeMap;
use std::sync::Arc;

use azure_config::api::{
    BackupBucketConfig, ControlPlaneConfig, InfrastructureConfig, InfrastructureState,
    InfrastructureStatus, WorkerStatus,
};
use azure_config::scheme;
use kube::api::ListParams;
use kube::runtime::controller::Action;
use kube::runtime::finalizer::{finalizer, Event as FinalizerEvent};
use kube::{Api, ResourceExt};
use serde_json::{json, Value};
use tracing::{debug, info, instrument, warn};

use super::status::{operation_type, patch, patch_body, record};
use super::{
    cluster_view, decode_optional, decode_required, factory_for, finalizer_error, namespace_of,
    secret_data, DEFAULT_SECRET_NAMESPACE,
};
use crate::backup::{self, BucketRequest};
use crate::bastion::{self, BastionRequest};
use crate::context::Context;
use crate::crds::{
    BackupBucket, BackupEntry, Bastion, ControlPlane, DnsRecord, Infrastructure,
    LoadBalancerIngress, Worker, AZURE_DNS_TYPE, AZURE_TYPE, FINALIZER,
};
use crate::dnsrecord;
use crate::error::{determine_error, Error, Result};
use crate::infrastructure::{self, InfrastructureRequest};
use crate::validation::{
    into_result, validate_control_plane_config, validate_infrastructure_config,
    validate_infrastructure_config_update, validate_worker_pools, validate_worker_pools_update,
};
use crate::worker::{self, apply, WorkerRequest};

/// State key holding the last infrastructure configuration that converged.
const LAST_APPLIED_CONFIG_KEY: &str = "lastAppliedConfig";

/// Secret key naming the resource group of backup buckets.
const BACKUP_RESOURCE_GROUP_KEY: &str = "resourceGroup";

// ============================================================================
// Infrastructure
// ============================================================================

#[instrument(skip(infra, ctx), fields(name = %infra.name_any(), namespace = ?infra.namespace()))]
pub(super) async fn infrastructure(infra: Arc<Infrastructure>, ctx: Arc<Context>) -> Result<Action> {
    if infra.spec.extension_type != AZURE_TYPE {
        return Ok(Action::await_change());
    }
    let namespace = namespace_of(infra.as_ref())?;
    let api: Api<Infrastructure> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&api, FINALIZER, infra, |event| async {
        match event {
            FinalizerEvent::Apply(infra) => converge_infrastructure(&api, &infra, &ctx, false).await,
            FinalizerEvent::Cleanup(infra) => converge_infrastructure(&api, &infra, &ctx, true).await,
        }
    })
    .await
    .map_err(finalizer_error)
}

async fn converge_infrastructure(
    api: &Api<Infrastructure>,
    infra: &Infrastructure,
    ctx: &Context,
    deleting: bool,
) -> Result<Action> {
    let mut status = infra.status.clone().unwrap_or_default();
    let operation = operation_type(infra.status.as_ref(), deleting);
    let mut state: InfrastructureState =
        decode_optional(status.state.as_ref())?.unwrap_or_default();

    let outcome = infrastructure_pass(infra, ctx, &mut state, deleting).await;

    // The ledger is written back on every outcome so the next pass resumes.
    status.state = Some(scheme::encode(&state)?);
    if let Ok(Some(provider_status)) = &outcome {
        status.provider_status = Some(scheme::encode(provider_status)?);
    }
    record(&mut status, infra.metadata.generation, operation, &outcome);
    patch(api, &infra.name_any(), &patch_body(&status, &status)?).await?;

    outcome.map(|_| Action::await_change())
}

async fn infrastructure_pass(
    infra: &Infrastructure,
    ctx: &Context,
    state: &mut InfrastructureState,
    deleting: bool,
) -> Result<Option<InfrastructureStatus>> {
    let spec = &infra.spec;
    let namespace = namespace_of(infra)?;
    let cluster = cluster_view(&ctx.client, &namespace).await?;
    let profile = cluster.provider_cloud_profile()?;

    let config: InfrastructureConfig = if deleting {
        decode_optional(spec.provider_config.as_ref())?.unwrap_or_default()
    } else {
        let config = decode_required(spec.provider_config.as_ref(), "providerConfig")?;
        let mut errors = validate_infrastructure_config(&config);
        if let Some(previous) = state.data.get(LAST_APPLIED_CONFIG_KEY) {
            let previous: InfrastructureConfig =
                scheme::Decoder::lenient().decode(previous.as_bytes())?;
            errors.extend(validate_infrastructure_config_update(&previous, &config));
        }
        into_result(errors)?;
        config
    };
    let previous_status: Option<InfrastructureStatus> = decode_optional(
        infra
            .status
            .as_ref()
            .and_then(|status| status.provider_status.as_ref()),
    )
    .unwrap_or_else(|err| {
        debug!(error = %err, "Ignoring undecodable provider status");
        None
    });

    let secret = secret_data(&ctx.client, &spec.secret_ref, &namespace).await?;
    let factory = factory_for(&secret, profile.cloud_configuration.as_ref(), &spec.region)?;
    let request = InfrastructureRequest {
        technical_id: cluster.technical_id(&namespace),
        region: &spec.region,
        config: &config,
        cloud_profile: &profile,
        previous_status: previous_status.as_ref(),
        migrating_to_vmo: cluster.vmo_migration_requested(),
    };
    let rctx = ctx.reconcile_context();
    let retry = &ctx.config.retry;

    if deleting {
        infrastructure::delete(&factory, &rctx, &request, state, retry).await?;
        return Ok(None);
    }
    let observed = infrastructure::reconcile(&factory, &rctx, &request, state, retry).await?;
    if let Some(raw) = &spec.provider_config {
        state
            .data
            .insert(LAST_APPLIED_CONFIG_KEY.to_string(), raw.to_string());
    }
    Ok(Some(observed))
}

// ============================================================================
// Worker
// ============================================================================

#[instrument(skip(worker, ctx), fields(name = %worker.name_any(), namespace = ?worker.namespace()))]
pub(super) async fn worker(worker: Arc<Worker>, ctx: Arc<Context>) -> Result<Action> {
    if worker.spec.extension_type != AZURE_TYPE {
        return Ok(Action::await_change());
    }
    let namespace = namespace_of(worker.as_ref())?;
    let api: Api<Worker> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&api, FINALIZER, worker, |event| async {
        match event {
            FinalizerEvent::Apply(worker) => converge_worker(&api, &worker, &ctx, false).await,
            FinalizerEvent::Cleanup(worker) => converge_worker(&api, &worker, &ctx, true).await,
        }
    })
    .await
    .map_err(finalizer_error)
}

/// Zones of each pool, kept in the worker state to check later updates.
fn pool_zones(state: Option<&Value>) -> BTreeMap<String, Vec<String>> {
    state
        .and_then(|state| state.get("poolZones"))
        .and_then(|zones| serde_json::from_value(zones.clone()).ok())
        .unwrap_or_default()
}

async fn converge_worker(
    api: &Api<Worker>,
    worker: &Worker,
    ctx: &Context,
    deleting: bool,
) -> Result<Action> {
    let mut status = worker.status.clone().unwrap_or_default();
    let operation = operation_type(worker.status.as_ref(), deleting);
    let mut worker_status: WorkerStatus =
        decode_optional(status.provider_status.as_ref())?.unwrap_or_default();

    let outcome = if deleting {
        delete_worker(worker, ctx).await
    } else {
        worker_pass(worker, ctx, &mut worker_status, &pool_zones(status.state.as_ref())).await
    }
    .map_err(|err| determine_error(err, &[]));

    status.provider_status = Some(scheme::encode(&worker_status)?);
    if !deleting && outcome.is_ok() {
        let zones: BTreeMap<&str, &[String]> = worker
            .spec
            .pools
            .iter()
            .map(|pool| (pool.name.as_str(), pool.zones.as_slice()))
            .collect();
        status.state = Some(json!({ "poolZones": zones }));
    }
    record(&mut status, worker.metadata.generation, operation, &outcome);
    patch(api, &worker.name_any(), &patch_body(&status, &status)?).await?;

    outcome.map(|()| Action::await_change())
}

async fn worker_pass(
    worker: &Worker,
    ctx: &Context,
    worker_status: &mut WorkerStatus,
    previous_zones: &BTreeMap<String, Vec<String>>,
) -> Result<()> {
    let spec = &worker.spec;
    let name = worker.name_any();
    let namespace = namespace_of(worker)?;
    let infrastructure = worker::infrastructure_status(spec)?;

    let availability_sets = !infrastructure.zoned && !infrastructure.is_vmo_required();
    let mut errors = validate_worker_pools(&spec.pools, infrastructure.zoned, availability_sets);
    errors.extend(validate_worker_pools_update(previous_zones, &spec.pools));
    into_result(errors)?;

    let cluster = cluster_view(&ctx.client, &namespace).await?;
    let profile = cluster.provider_cloud_profile()?;
    let secret = secret_data(&ctx.client, &spec.secret_ref, &namespace).await?;
    let factory = factory_for(&secret, profile.cloud_configuration.as_ref(), &spec.region)?;
    let request = WorkerRequest {
        technical_id: cluster.technical_id(&namespace),
        region: &spec.region,
        spec,
        infrastructure: &infrastructure,
        cloud_profile: &profile,
        cluster: &cluster,
    };
    let rctx = ctx.reconcile_context();

    let plan = worker::reconcile(&factory, &rctx, &request, worker_status).await?;
    apply::apply(&ctx.client, &namespace, &name, &plan).await?;
    worker::post_reconcile(&factory, &rctx, &request, worker_status).await?;
    info!(deployments = plan.deployments.len(), "Worker reconciled");
    Ok(())
}

async fn delete_worker(worker: &Worker, ctx: &Context) -> Result<()> {
    let spec = &worker.spec;
    let namespace = namespace_of(worker)?;
    apply::delete(&ctx.client, &namespace, &worker.name_any()).await?;

    let infrastructure = match worker::infrastructure_status(spec) {
        Ok(infrastructure) => infrastructure,
        Err(Error::MissingResource(what)) => {
            warn!(%what, "No infrastructure status, skipping cloud cleanup");
            return Ok(());
        }
        Err(err) => return Err(err),
    };
    let cluster = cluster_view(&ctx.client, &namespace).await?;
    let profile = cluster.provider_cloud_profile()?;
    let secret = secret_data(&ctx.client, &spec.secret_ref, &namespace).await?;
    let factory = factory_for(&secret, profile.cloud_configuration.as_ref(), &spec.region)?;
    worker::delete(&factory, &ctx.reconcile_context(), &infrastructure.resource_group).await
}

// ============================================================================
// Bastion
// ============================================================================

#[instrument(skip(bastion, ctx), fields(name = %bastion.name_any(), namespace = ?bastion.namespace()))]
pub(super) async fn bastion(bastion: Arc<Bastion>, ctx: Arc<Context>) -> Result<Action> {
    if bastion.spec.extension_type != AZURE_TYPE {
        return Ok(Action::await_change());
    }
    let namespace = namespace_of(bastion.as_ref())?;
    let api: Api<Bastion> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&api, FINALIZER, bastion, |event| async {
        match event {
            FinalizerEvent::Apply(bastion) => converge_bastion(&api, &bastion, &ctx, false).await,
            FinalizerEvent::Cleanup(bastion) => converge_bastion(&api, &bastion, &ctx, true).await,
        }
    })
    .await
    .map_err(finalizer_error)
}

/// The Azure `Infrastructure` of the shoot in `namespace`.
async fn shoot_infrastructure(ctx: &Context, namespace: &str) -> Result<Infrastructure> {
    Api::<Infrastructure>::namespaced(ctx.client.clone(), namespace)
        .list(&ListParams::default())
        .await?
        .items
        .into_iter()
        .find(|infra| infra.spec.extension_type == AZURE_TYPE)
        .ok_or_else(|| Error::MissingResource(format!("infrastructure in {namespace}")))
}

async fn converge_bastion(
    api: &Api<Bastion>,
    bastion: &Bastion,
    ctx: &Context,
    deleting: bool,
) -> Result<Action> {
    let mut status = bastion.status.clone().unwrap_or_default();
    let operation = operation_type(bastion.status.as_ref().map(|status| &status.common), deleting);

    let outcome = bastion_pass(bastion, ctx, deleting)
        .await
        .map_err(|err| determine_error(err, &[]));
    if let Ok(Some(public_ip)) = &outcome {
        status.ingress = Some(LoadBalancerIngress {
            ip: Some(public_ip.clone()),
            hostname: None,
        });
    }
    record(&mut status.common, bastion.metadata.generation, operation, &outcome);
    patch(api, &bastion.name_any(), &patch_body(&status, &status.common)?).await?;

    outcome.map(|_| Action::await_change())
}

async fn bastion_pass(bastion: &Bastion, ctx: &Context, deleting: bool) -> Result<Option<String>> {
    let namespace = namespace_of(bastion)?;
    let infra = match shoot_infrastructure(ctx, &namespace).await {
        Ok(infra) => infra,
        Err(Error::MissingResource(what)) if deleting => {
            warn!(%what, "Infrastructure is gone, nothing to clean up");
            return Ok(None);
        }
        Err(err) => return Err(err),
    };
    let infrastructure: InfrastructureStatus = decode_optional(
        infra
            .status
            .as_ref()
            .and_then(|status| status.provider_status.as_ref()),
    )?
    .ok_or_else(|| Error::MissingResource(format!("status of infrastructure {}", infra.name_any())))?;

    let cluster = cluster_view(&ctx.client, &namespace).await?;
    let profile = cluster.provider_cloud_profile()?;
    let secret = secret_data(&ctx.client, &infra.spec.secret_ref, &namespace).await?;
    let factory = factory_for(&secret, profile.cloud_configuration.as_ref(), &infra.spec.region)?;
    let name = bastion.name_any();
    let request = BastionRequest {
        name: &name,
        cluster_name: cluster.technical_id(&namespace),
        region: &infra.spec.region,
        spec: &bastion.spec,
        infrastructure: &infrastructure,
        cloud_profile: &profile,
        cluster: &cluster,
        config: &ctx.config.bastion,
    };
    let rctx = ctx.reconcile_context();

    if deleting {
        bastion::delete(&factory, &rctx, &request).await?;
        return Ok(None);
    }
    let endpoints = bastion::reconcile(&factory, &rctx, &request).await?;
    info!(public_ip = %endpoints.public_ip, "Bastion ready");
    Ok(Some(endpoints.public_ip))
}

// ============================================================================
// Backups
// ============================================================================

#[instrument(skip(bucket, ctx), fields(name = %bucket.name_any()))]
pub(super) async fn backup_bucket(bucket: Arc<BackupBucket>, ctx: Arc<Context>) -> Result<Action> {
    if bucket.spec.extension_type != AZURE_TYPE {
        return Ok(Action::await_change());
    }
    let api: Api<BackupBucket> = Api::all(ctx.client.clone());
    finalizer(&api, FINALIZER, bucket, |event| async {
        match event {
            FinalizerEvent::Apply(bucket) => converge_bucket(&api, &bucket, &ctx, false).await,
            FinalizerEvent::Cleanup(bucket) => converge_bucket(&api, &bucket, &ctx, true).await,
        }
    })
    .await
    .map_err(finalizer_error)
}

async fn converge_bucket(
    api: &Api<BackupBucket>,
    bucket: &BackupBucket,
    ctx: &Context,
    deleting: bool,
) -> Result<Action> {
    let mut status = bucket.status.clone().unwrap_or_default();
    let operation = operation_type(bucket.status.as_ref(), deleting);

    let outcome = bucket_pass(bucket, ctx, deleting)
        .await
        .map_err(|err| determine_error(err, &[]));
    record(&mut status, bucket.metadata.generation, operation, &outcome);
    patch(api, &bucket.name_any(), &patch_body(&status, &status)?).await?;

    outcome.map(|()| Action::await_change())
}

async fn bucket_pass(bucket: &BackupBucket, ctx: &Context, deleting: bool) -> Result<()> {
    let spec = &bucket.spec;
    let name = bucket.name_any();
    let config: BackupBucketConfig =
        decode_optional(spec.provider_config.as_ref())?.unwrap_or_default();
    let secret = secret_data(&ctx.client, &spec.secret_ref, DEFAULT_SECRET_NAMESPACE).await?;
    let resource_group = secret
        .get(BACKUP_RESOURCE_GROUP_KEY)
        .and_then(|value| String::from_utf8(value.clone()).ok())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| name.clone());
    let factory = factory_for(&secret, config.cloud_configuration.as_ref(), &spec.region)?;
    let request = BucketRequest {
        bucket_name: &name,
        resource_group: &resource_group,
        config: &config,
    };
    let rctx = ctx.reconcile_context();
    if deleting {
        backup::delete_bucket(&factory, &rctx, &request).await
    } else {
        backup::reconcile_bucket(&factory, &rctx, &request).await
    }
}

#[instrument(skip(entry, ctx), fields(name = %entry.name_any()))]
pub(super) async fn backup_entry(entry: Arc<BackupEntry>, ctx: Arc<Context>) -> Result<Action> {
    if entry.spec.extension_type != AZURE_TYPE {
        return Ok(Action::await_change());
    }
    let api: Api<BackupEntry> = Api::all(ctx.client.clone());
    finalizer(&api, FINALIZER, entry, |event| async {
        match event {
            FinalizerEvent::Apply(entry) => converge_entry(&api, &entry, &ctx, false).await,
            FinalizerEvent::Cleanup(entry) => converge_entry(&api, &entry, &ctx, true).await,
        }
    })
    .await
    .map_err(finalizer_error)
}

async fn converge_entry(
    api: &Api<BackupEntry>,
    entry: &BackupEntry,
    ctx: &Context,
    deleting: bool,
) -> Result<Action> {
    let mut status = entry.status.clone().unwrap_or_default();
    let operation = operation_type(entry.status.as_ref(), deleting);

    // Entries need no cloud objects of their own; only deletion acts.
    let outcome = if deleting {
        entry_cleanup(entry, ctx).await.map_err(|err| determine_error(err, &[]))
    } else {
        Ok(())
    };
    record(&mut status, entry.metadata.generation, operation, &outcome);
    patch(api, &entry.name_any(), &patch_body(&status, &status)?).await?;

    outcome.map(|()| Action::await_change())
}

async fn entry_cleanup(entry: &BackupEntry, ctx: &Context) -> Result<()> {
    let spec = &entry.spec;
    let secret = secret_data(&ctx.client, &spec.secret_ref, DEFAULT_SECRET_NAMESPACE).await?;
    let config: BackupBucketConfig =
        decode_optional(spec.provider_config.as_ref())?.unwrap_or_default();
    let factory = factory_for(&secret, config.cloud_configuration.as_ref(), &spec.region)?;
    let deleted = backup::delete_entry(
        &factory,
        &ctx.reconcile_context(),
        &spec.bucket_name,
        &entry.name_any(),
    )
    .await?;
    info!(deleted, "Backup entry deleted");
    Ok(())
}

// ============================================================================
// DNS records
// ============================================================================

#[instrument(skip(dns, ctx), fields(name = %dns.name_any(), namespace = ?dns.namespace()))]
pub(super) async fn dns_record(dns: Arc<DnsRecord>, ctx: Arc<Context>) -> Result<Action> {
    if dns.spec.extension_type != AZURE_DNS_TYPE {
        return Ok(Action::await_change());
    }
    let namespace = namespace_of(dns.as_ref())?;
    let api: Api<DnsRecord> = Api::namespaced(ctx.client.clone(), &namespace);
    finalizer(&api, FINALIZER, dns, |event| async {
        match event {
            FinalizerEvent::Apply(dns) => converge_record(&api, &dns, &ctx, false).await,
            FinalizerEvent::Cleanup(dns) => converge_record(&api, &dns, &ctx, true).await,
        }
    })
    .await
    .map_err(finalizer_error)
}

async fn converge_record(
    api: &Api<DnsRecord>,
    dns_record: &DnsRecord,
    ctx: &Context,
    deleting: bool,
) -> Result<Action> {
    let mut status = dns_record.status.clone().unwrap_or_default();
    let operation = operation_type(dns_record.status.as_ref().map(|status| &status.common), deleting);

    let outcome = record_pass(dns_record, ctx, deleting)
        .await
        .map_err(|err| determine_error(err, &[]));
    if let Ok(Some(zone)) = &outcome {
        status.zone = Some(zone.clone());
    }
    record(&mut status.common, dns_record.metadata.generation, operation, &outcome);
    patch(api, &dns_record.name_any(), &patch_body(&status, &status.common)?).await?;

    outcome.map(|_| Action::await_change())
}

async fn record_pass(dns_record: &DnsRecord, ctx: &Context, deleting: bool) -> Result<Option<String>> {
    let spec = &dns_record.spec;
    let namespace = namespace_of(dns_record)?;
    let secret = secret_data(&ctx.client, &spec.secret_ref, &namespace).await?;
    let factory = factory_for(&secret, None, spec.region.as_deref().unwrap_or_default())?;
    let rctx = ctx.reconcile_context();
    if deleting {
        dnsrecord::delete(&factory, &rctx, spec).await?;
        return Ok(None);
    }
    let zone = dnsrecord::reconcile(&factory, &rctx, spec, ctx.config.dns.default_ttl).await?;
    Ok(Some(format!("{}/{}", zone.resource_group, zone.name)))
}

// ============================================================================
// Control plane
// ============================================================================

/// Control planes are only checked; their components are deployed elsewhere.
#[instrument(skip(control_plane, ctx), fields(name = %control_plane.name_any(), namespace = ?control_plane.namespace()))]
pub(super) async fn control_plane(
    control_plane: Arc<ControlPlane>,
    ctx: Arc<Context>,
) -> Result<Action> {
    if control_plane.spec.extension_type != AZURE_TYPE {
        return Ok(Action::await_change());
    }
    let namespace = namespace_of(control_plane.as_ref())?;
    let api: Api<ControlPlane> = Api::namespaced(ctx.client.clone(), &namespace);
    let mut status = control_plane.status.clone().unwrap_or_default();
    let operation = operation_type(control_plane.status.as_ref(), false);

    let outcome = decode_optional::<ControlPlaneConfig>(control_plane.spec.provider_config.as_ref())
        .and_then(|config| into_result(validate_control_plane_config(&config.unwrap_or_default())));
    record(&mut status, control_plane.metadata.generation, operation, &outcome);
    patch(&api, &control_plane.name_any(), &patch_body(&status, &status)?).await?;

    outcome.map(|()| Action::await_change())
}
