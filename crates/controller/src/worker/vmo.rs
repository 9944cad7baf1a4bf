//! VM orchestration groups of non-zoned pools.

use azure_cloud::resources::VirtualMachineScaleSet;
use azure_cloud::tags::{technical_id_tags, MACHINE_SET_TAG};
use azure_cloud::{ClientFactory, ResourceId};
use azure_config::api::{VmoDependency, WorkerStatus};
use azure_config::helper::find_domain_count_by_region;
use tracing::{debug, info};

use super::hash::short_hash;
use super::WorkerRequest;
use crate::context::ReconcileContext;
use crate::error::{Error, Result};

const ORCHESTRATION_MODE: &str = "Flexible";

/// Name of the VMO of a pool; it changes with the fault-domain count.
#[must_use]
pub fn vmo_name(technical_id: &str, pool: &str, fault_domains: i32) -> String {
    format!(
        "{technical_id}-{pool}-vmo-{}",
        short_hash(fault_domains.to_string().as_bytes())
    )
}

fn is_resource_group_missing(err: &Error) -> bool {
    match err {
        Error::Cloud(err) => err.code() == Some("ResourceGroupNotFound"),
        _ => false,
    }
}

fn pool_of(vmo: &VirtualMachineScaleSet) -> Option<&str> {
    vmo.tags.get(MACHINE_SET_TAG).map(String::as_str)
}

/// VMOs of the resource group created for machine sets. A missing resource
/// group has none.
async fn tagged_vmos(
    factory: &ClientFactory,
    ctx: &ReconcileContext,
    resource_group: &str,
) -> Result<Vec<VirtualMachineScaleSet>> {
    let group = factory.resource_group_id(resource_group);
    match ctx.run(factory.vmos().list(&group)).await {
        Ok(vmos) => Ok(vmos.into_iter().filter(|vmo| pool_of(vmo).is_some()).collect()),
        Err(err) if is_resource_group_missing(&err) => {
            debug!(resource_group, "Resource group is gone, no VMOs to look at");
            Ok(Vec::new())
        }
        Err(err) => Err(err),
    }
}

/// Ensures one VMO per pool with the region's fault-domain count and records
/// it in `status`. Does nothing unless the infrastructure requires VMOs.
pub async fn ensure(
    factory: &ClientFactory,
    ctx: &ReconcileContext,
    request: &WorkerRequest<'_>,
    status: &mut WorkerStatus,
) -> Result<()> {
    let infrastructure = request.infrastructure;
    if !infrastructure.is_vmo_required() {
        return Ok(());
    }
    let fault_domains =
        find_domain_count_by_region(&request.cloud_profile.count_fault_domains, request.region)?;
    let client = factory.vmos();

    for pool in &request.spec.pools {
        let name = vmo_name(request.technical_id, &pool.name, fault_domains);
        let id = factory.id_of::<VirtualMachineScaleSet>(&infrastructure.resource_group, &name);

        let existing = ctx.run(client.get(&id)).await?;
        let vmo = match existing {
            Some(vmo) if vmo.properties.platform_fault_domain_count == Some(fault_domains) => vmo,
            _ => {
                let mut tags = technical_id_tags(request.technical_id);
                tags.insert(MACHINE_SET_TAG.to_string(), pool.name.clone());
                let mut desired = VirtualMachineScaleSet {
                    location: request.region.to_string(),
                    tags,
                    ..Default::default()
                };
                desired.properties.orchestration_mode = Some(ORCHESTRATION_MODE.to_string());
                desired.properties.platform_fault_domain_count = Some(fault_domains);
                desired.properties.single_placement_group = Some(false);
                info!(pool = %pool.name, vmo = %name, "Creating VM orchestration group");
                ctx.run(client.create_or_update(&id, &desired)).await?
            }
        };

        let dependency = VmoDependency {
            pool_name: pool.name.clone(),
            id: vmo.id.unwrap_or_else(|| id.to_string()),
            name,
        };
        status
            .vmo_dependencies
            .retain(|existing| existing.pool_name != pool.name);
        status.vmo_dependencies.push(dependency);
    }
    status
        .vmo_dependencies
        .sort_by(|a, b| a.pool_name.cmp(&b.pool_name));
    Ok(())
}

/// Deletes tagged VMOs that are no longer referenced by `status` or whose
/// pool vanished, and forgets dependencies of vanished pools.
pub async fn cleanup(
    factory: &ClientFactory,
    ctx: &ReconcileContext,
    request: &WorkerRequest<'_>,
    status: &mut WorkerStatus,
) -> Result<()> {
    let pool_exists = |name: &str| request.spec.pools.iter().any(|pool| pool.name == name);
    status
        .vmo_dependencies
        .retain(|dependency| pool_exists(&dependency.pool_name));

    let client = factory.vmos();
    for vmo in tagged_vmos(factory, ctx, &request.infrastructure.resource_group).await? {
        let Some(id) = vmo.id.as_deref().map(ResourceId::parse) else {
            continue;
        };
        let referenced = status
            .vmo_dependencies
            .iter()
            .any(|dependency| ResourceId::parse(dependency.id.as_str()) == id);
        let pool_alive = pool_of(&vmo).is_some_and(pool_exists);
        if referenced && pool_alive {
            continue;
        }
        info!(vmo = %id.name(), "Deleting VM orchestration group no longer in use");
        ctx.run(client.delete(&id)).await?;
    }
    Ok(())
}

/// Deletes every tagged VMO of the resource group.
pub async fn delete_all(
    factory: &ClientFactory,
    ctx: &ReconcileContext,
    resource_group: &str,
) -> Result<()> {
    let client = factory.vmos();
    for vmo in tagged_vmos(factory, ctx, resource_group).await? {
        if let Some(id) = vmo.id.as_deref().map(ResourceId::parse) {
            ctx.run(client.delete(&id)).await?;
        }
    }
    Ok(())
}
