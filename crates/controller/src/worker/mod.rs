//! Worker materializer.
//!
//! Projects the pools of a `Worker` onto machine classes and machine
//! deployments for the machine controller, and keeps the VM orchestration
//! groups of non-zoned shoots in step with the pools.

pub mod apply;
pub mod hash;
pub mod machines;
pub mod vmo;
pub mod zones;

use azure_cloud::ClientFactory;
use azure_config::api::{CloudProfileConfig, InfrastructureStatus, WorkerStatus};
use azure_config::scheme::Decoder;
use tracing::{info, instrument};

pub use machines::MachinePlan;

use crate::context::ReconcileContext;
use crate::crds::{ClusterView, WorkerSpec};
use crate::error::{Error, Result};

/// Inputs of one worker reconcile.
#[derive(Debug, Clone, Copy)]
pub struct WorkerRequest<'a> {
    pub technical_id: &'a str,
    pub region: &'a str,
    pub spec: &'a WorkerSpec,
    pub infrastructure: &'a InfrastructureStatus,
    pub cloud_profile: &'a CloudProfileConfig,
    pub cluster: &'a ClusterView,
}

/// Infrastructure status embedded in a worker.
pub fn infrastructure_status(spec: &WorkerSpec) -> Result<InfrastructureStatus> {
    match &spec.infrastructure_provider_status {
        Some(raw) if !raw.is_null() => Ok(Decoder::lenient().decode_value(raw.clone())?),
        _ => Err(Error::MissingResource(
            "infrastructure provider status of worker".to_string(),
        )),
    }
}

/// Ensures the VMOs of the pools and computes the machine plan. Images and
/// VMO dependencies are recorded in `status`.
#[instrument(skip_all, fields(technical_id = request.technical_id))]
pub async fn reconcile(
    factory: &ClientFactory,
    ctx: &ReconcileContext,
    request: &WorkerRequest<'_>,
    status: &mut WorkerStatus,
) -> Result<MachinePlan> {
    vmo::ensure(factory, ctx, request, status).await?;
    let plan = machines::generate(request, status)?;
    info!(
        classes = plan.classes.len(),
        deployments = plan.deployments.len(),
        "Generated machine plan"
    );
    Ok(plan)
}

/// Cleanup after the machine objects were applied.
pub async fn post_reconcile(
    factory: &ClientFactory,
    ctx: &ReconcileContext,
    request: &WorkerRequest<'_>,
    status: &mut WorkerStatus,
) -> Result<()> {
    vmo::cleanup(factory, ctx, request, status).await
}

/// Cloud cleanup after the machines of a worker are gone.
#[instrument(skip(factory, ctx))]
pub async fn delete(
    factory: &ClientFactory,
    ctx: &ReconcileContext,
    resource_group: &str,
) -> Result<()> {
    vmo::delete_all(factory, ctx, resource_group).await
}
