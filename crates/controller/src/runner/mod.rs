//! Controllers of the extension resources.
//!
//! One `kube` controller runs per kind. Reconciles go through the shared
//! finalizer; each one ends with a single status merge patch.

mod reconcile;
mod status;

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;

use azure_cloud::{ClientFactory, Credentials};
use azure_config::api::CloudConfiguration;
use azure_config::scheme::{Decoder, Kind};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::controller::{self, Action, Controller};
use kube::runtime::{finalizer, watcher};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn, Instrument};

use crate::config::ControllerConfig;
use crate::context::Context;
use crate::crds::{
    BackupBucket, BackupEntry, Bastion, Cluster, ClusterView, ControlPlane, DnsRecord,
    Infrastructure, SecretReference, Worker,
};
use crate::error::{Error, Result};

/// Namespace of secrets referenced without one by cluster-scoped objects.
const DEFAULT_SECRET_NAMESPACE: &str = "garden";

/// Runs all controllers until `shutdown` is cancelled.
///
/// With a `namespace` the namespaced kinds are only watched there.
#[instrument(skip(client, config, shutdown))]
pub async fn run(
    client: Client,
    config: ControllerConfig,
    namespace: Option<String>,
    shutdown: CancellationToken,
) -> Result<()> {
    config
        .validate()
        .map_err(|err| Error::ConfigError(err.to_string()))?;
    let concurrency = config.concurrency.clone();
    let ctx = Arc::new(Context {
        client: client.clone(),
        config: Arc::new(config),
        shutdown: shutdown.clone(),
    });
    let namespace = namespace.as_deref();

    info!("Starting extension controllers");
    futures::join!(
        drive(
            "Infrastructure",
            namespaced::<Infrastructure>(&client, namespace),
            concurrency.infrastructure,
            reconcile::infrastructure,
            &ctx,
        ),
        drive(
            "Worker",
            namespaced::<Worker>(&client, namespace),
            concurrency.worker,
            reconcile::worker,
            &ctx,
        ),
        drive(
            "Bastion",
            namespaced::<Bastion>(&client, namespace),
            concurrency.bastion,
            reconcile::bastion,
            &ctx,
        ),
        drive(
            "BackupBucket",
            Api::<BackupBucket>::all(client.clone()),
            concurrency.backup_bucket,
            reconcile::backup_bucket,
            &ctx,
        ),
        drive(
            "BackupEntry",
            Api::<BackupEntry>::all(client.clone()),
            concurrency.backup_entry,
            reconcile::backup_entry,
            &ctx,
        ),
        drive(
            "DNSRecord",
            namespaced::<DnsRecord>(&client, namespace),
            concurrency.dns_record,
            reconcile::dns_record,
            &ctx,
        ),
        drive(
            "ControlPlane",
            namespaced::<ControlPlane>(&client, namespace),
            1,
            reconcile::control_plane,
            &ctx,
        ),
    );
    info!("Extension controllers stopped");
    Ok(())
}

fn namespaced<K>(client: &Client, namespace: Option<&str>) -> Api<K>
where
    K: Resource<Scope = k8s_openapi::NamespaceResourceScope, DynamicType = ()>,
{
    match namespace {
        Some(namespace) => Api::namespaced(client.clone(), namespace),
        None => Api::all(client.clone()),
    }
}

async fn drive<K, F, Fut>(
    kind: &'static str,
    api: Api<K>,
    concurrency: u16,
    reconciler: F,
    ctx: &Arc<Context>,
) where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    F: FnMut(Arc<K>, Arc<Context>) -> Fut,
    Fut: Future<Output = Result<Action>> + Send + 'static,
{
    info!(kind, concurrency, "Starting controller");
    Controller::new(api, watcher::Config::default().any_semantic())
        .with_config(controller::Config::default().concurrency(concurrency))
        .graceful_shutdown_on(ctx.shutdown.clone().cancelled_owned())
        .run(reconciler, error_policy::<K>, Arc::clone(ctx))
        .for_each(|result| {
            let span = tracing::info_span!("reconciliation_result", kind);
            async move {
                match result {
                    Ok((object, action)) => {
                        debug!(object = %object, ?action, "Reconciled");
                    }
                    Err(err) => {
                        warn!(error = %err, "Reconciliation failed");
                    }
                }
            }
            .instrument(span)
        })
        .await;
    info!(kind, "Controller stopped");
}

/// Requeues after the delay the error asks for.
fn error_policy<K: Resource>(object: Arc<K>, err: &Error, ctx: Arc<Context>) -> Action {
    let delay = err.retry_after(&ctx.config.retry);
    warn!(
        name = %object.name_any(),
        namespace = ?object.namespace(),
        error = %err,
        codes = ?err.codes(),
        delay_seconds = delay.as_secs(),
        "Reconcile failed"
    );
    Action::requeue(delay)
}

fn finalizer_error(err: finalizer::Error<Error>) -> Error {
    match err {
        finalizer::Error::ApplyFailed(err) | finalizer::Error::CleanupFailed(err) => err,
        finalizer::Error::AddFinalizer(err) | finalizer::Error::RemoveFinalizer(err) => {
            Error::KubeError(err)
        }
        finalizer::Error::UnnamedObject => Error::MissingObjectKey,
        finalizer::Error::InvalidFinalizer => {
            Error::ConfigError("Invalid finalizer name".to_string())
        }
    }
}

/// Namespace of a namespaced object.
fn namespace_of<K: Resource>(object: &K) -> Result<String> {
    object.namespace().ok_or(Error::MissingObjectKey)
}

/// Decodes a required provider payload strictly.
fn decode_required<T: Kind>(raw: Option<&Value>, what: &str) -> Result<T> {
    match raw {
        Some(value) if !value.is_null() => Ok(Decoder::strict().decode_value(value.clone())?),
        _ => Err(Error::Validation(format!("{what} is required"))),
    }
}

/// Decodes an optional provider payload, tolerating unknown fields.
fn decode_optional<T: Kind>(raw: Option<&Value>) -> Result<Option<T>> {
    match raw {
        Some(value) if !value.is_null() => Ok(Some(Decoder::lenient().decode_value(value.clone())?)),
        _ => Ok(None),
    }
}

/// Shoot view of the `Cluster` named after `namespace`.
async fn cluster_view(client: &Client, namespace: &str) -> Result<ClusterView> {
    let cluster = Api::<Cluster>::all(client.clone())
        .get_opt(namespace)
        .await?
        .ok_or_else(|| Error::MissingResource(format!("cluster {namespace}")))?;
    cluster.view()
}

async fn secret_data(
    client: &Client,
    reference: &SecretReference,
    default_namespace: &str,
) -> Result<BTreeMap<String, Vec<u8>>> {
    let namespace = reference.namespace.as_deref().unwrap_or(default_namespace);
    let secret = Api::<Secret>::namespaced(client.clone(), namespace)
        .get_opt(&reference.name)
        .await?
        .ok_or_else(|| Error::MissingResource(format!("secret {namespace}/{}", reference.name)))?;
    Ok(secret
        .data
        .unwrap_or_default()
        .into_iter()
        .map(|(key, value)| (key, value.0))
        .collect())
}

/// Client factory for the credentials in `data`.
fn factory_for(
    data: &BTreeMap<String, Vec<u8>>,
    configuration: Option<&CloudConfiguration>,
    region: &str,
) -> Result<ClientFactory> {
    let credentials = Credentials::from_secret_data(data)?;
    Ok(ClientFactory::for_region(credentials, configuration, region)?)
}
