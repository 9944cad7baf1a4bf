//! Machine objects in the seed.
//!
//! Classes and deployments are server-side applied and labelled with the
//! worker name; labelled objects missing from the plan are deleted.

use std::collections::BTreeSet;
use std::time::Duration;

use kube::api::{
    Api, ApiResource, DeleteParams, DynamicObject, GroupVersionKind, ListParams, Patch,
    PatchParams,
};
use kube::Client;
use serde_json::{json, Value};
use tracing::{debug, info};

use super::machines::{MachineClass, MachineDeployment, MachinePlan};
use crate::crds::{IntOrPercent, AUTO_IN_PLACE_UPDATE, MANUAL_IN_PLACE_UPDATE};
use crate::error::{Error, Result};

const MACHINE_GROUP: &str = "machine.sapcloud.io";
const MACHINE_VERSION: &str = "v1alpha1";
const FIELD_MANAGER: &str = "azure-extension";

/// Label naming the worker an object belongs to.
pub const WORKER_LABEL: &str = "worker.extensions.gardener.cloud/name";

const MIN_READY_SECONDS: i64 = 500;
const MACHINES_GONE_POLL: Duration = Duration::from_secs(10);

fn api_resource(kind: &str) -> ApiResource {
    ApiResource::from_gvk(&GroupVersionKind::gvk(MACHINE_GROUP, MACHINE_VERSION, kind))
}

fn api(client: &Client, namespace: &str, kind: &str) -> Api<DynamicObject> {
    Api::namespaced_with(client.clone(), namespace, &api_resource(kind))
}

fn selector(worker: &str) -> ListParams {
    ListParams::default().labels(&format!("{WORKER_LABEL}={worker}"))
}

fn int_or_percent(value: &IntOrPercent) -> Value {
    match value {
        IntOrPercent::Int(number) => json!(number),
        IntOrPercent::Percent(percent) => json!(percent),
    }
}

/// Manifest of a machine class.
pub fn class_manifest(class: &MachineClass, namespace: &str, worker: &str) -> Result<Value> {
    let mut manifest = serde_json::to_value(class)?;
    let Some(fields) = manifest.as_object_mut() else {
        return Err(Error::Validation(format!("machine class {} is not an object", class.name)));
    };
    fields.remove("name");
    fields.insert("apiVersion".into(), json!(format!("{MACHINE_GROUP}/{MACHINE_VERSION}")));
    fields.insert("kind".into(), json!("MachineClass"));
    fields.insert("provider".into(), json!("Azure"));
    fields.insert(
        "metadata".into(),
        json!({
            "name": class.name,
            "namespace": namespace,
            "labels": { WORKER_LABEL: worker },
        }),
    );
    for reference in ["credentialsSecretRef", "secretRef"] {
        if let Some(secret) = fields.get_mut(reference).and_then(Value::as_object_mut) {
            secret
                .entry("namespace")
                .or_insert_with(|| json!(namespace));
        }
    }
    Ok(manifest)
}

/// Manifest of a machine deployment with the given replica count.
#[must_use]
pub fn deployment_manifest(
    deployment: &MachineDeployment,
    namespace: &str,
    worker: &str,
    replicas: i32,
) -> Value {
    let surge = int_or_percent(&deployment.max_surge);
    let unavailable = int_or_percent(&deployment.max_unavailable);
    let strategy = match deployment.update_strategy.as_str() {
        AUTO_IN_PLACE_UPDATE | MANUAL_IN_PLACE_UPDATE => {
            let orchestration = if deployment.update_strategy == AUTO_IN_PLACE_UPDATE {
                "Auto"
            } else {
                "Manual"
            };
            json!({
                "type": "InPlaceUpdate",
                "inPlaceUpdate": {
                    "orchestrationType": orchestration,
                    "maxSurge": surge,
                    "maxUnavailable": unavailable,
                },
            })
        }
        _ => json!({
            "type": "RollingUpdate",
            "rollingUpdate": { "maxSurge": surge, "maxUnavailable": unavailable },
        }),
    };
    let taints: Vec<Value> = deployment
        .taints
        .iter()
        .map(|taint| json!({ "key": taint.key, "value": taint.value, "effect": taint.effect }))
        .collect();

    let mut labels = deployment.labels.clone();
    labels.insert(WORKER_LABEL.to_string(), worker.to_string());

    let mut manifest = json!({
        "apiVersion": format!("{MACHINE_GROUP}/{MACHINE_VERSION}"),
        "kind": "MachineDeployment",
        "metadata": {
            "name": deployment.name,
            "namespace": namespace,
            "labels": { WORKER_LABEL: worker, "worker.gardener.cloud/pool": deployment.pool_name },
        },
        "spec": {
            "replicas": replicas,
            "minReadySeconds": MIN_READY_SECONDS,
            "strategy": strategy,
            "selector": { "matchLabels": { "name": deployment.name } },
            "template": {
                "metadata": { "labels": { "name": deployment.name } },
                "spec": {
                    "class": { "kind": "MachineClass", "name": deployment.class_name },
                    "nodeTemplate": {
                        "metadata": { "labels": labels, "annotations": deployment.annotations },
                        "spec": { "taints": taints },
                    },
                },
            },
        },
    });
    if let Some(priority) = deployment.priority {
        manifest["metadata"]["annotations"] =
            json!({ "machinepriority.machine.sapcloud.io": priority.to_string() });
    }
    manifest
}

/// Replicas of a deployment: the current count clamped to the pool bounds,
/// or the minimum for new deployments.
#[must_use]
pub fn replicas(current: Option<i64>, deployment: &MachineDeployment) -> i32 {
    current
        .and_then(|count| i32::try_from(count).ok())
        .map_or(deployment.minimum, |count| {
            count.clamp(deployment.minimum, deployment.maximum.max(deployment.minimum))
        })
}

async fn names(api: &Api<DynamicObject>, worker: &str) -> Result<Vec<String>> {
    Ok(api
        .list(&selector(worker))
        .await?
        .items
        .into_iter()
        .filter_map(|object| object.metadata.name)
        .collect())
}

/// Classes referenced by machines in the namespace.
async fn classes_in_use(client: &Client, namespace: &str) -> Result<BTreeSet<String>> {
    let machines = api(client, namespace, "Machine").list(&ListParams::default()).await?;
    Ok(machines
        .items
        .iter()
        .filter_map(|machine| machine.data.pointer("/spec/class/name"))
        .filter_map(Value::as_str)
        .map(str::to_string)
        .collect())
}

/// Applies `plan` and removes machine objects of `worker` it no longer names.
pub async fn apply(client: &Client, namespace: &str, worker: &str, plan: &MachinePlan) -> Result<()> {
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let classes = api(client, namespace, "MachineClass");
    let deployments = api(client, namespace, "MachineDeployment");

    for class in &plan.classes {
        let manifest = class_manifest(class, namespace, worker)?;
        classes.patch(&class.name, &params, &Patch::Apply(&manifest)).await?;
        debug!(class = %class.name, "Applied machine class");
    }

    for deployment in &plan.deployments {
        let current = deployments
            .get_opt(&deployment.name)
            .await?
            .and_then(|existing| existing.data.pointer("/spec/replicas").and_then(Value::as_i64));
        let manifest = deployment_manifest(deployment, namespace, worker, replicas(current, deployment));
        deployments
            .patch(&deployment.name, &params, &Patch::Apply(&manifest))
            .await?;
        debug!(deployment = %deployment.name, "Applied machine deployment");
    }

    let wanted: BTreeSet<&str> = plan.deployments.iter().map(|d| d.name.as_str()).collect();
    for name in names(&deployments, worker).await? {
        if !wanted.contains(name.as_str()) {
            info!(deployment = %name, "Deleting stale machine deployment");
            deployments.delete(&name, &DeleteParams::default()).await?;
        }
    }

    let wanted: BTreeSet<&str> = plan.classes.iter().map(|c| c.name.as_str()).collect();
    let in_use = classes_in_use(client, namespace).await?;
    for name in names(&classes, worker).await? {
        if !wanted.contains(name.as_str()) && !in_use.contains(&name) {
            info!(class = %name, "Deleting stale machine class");
            classes.delete(&name, &DeleteParams::default()).await?;
        }
    }
    Ok(())
}

/// Deletes all machine objects of `worker`. Classes go once no machine uses
/// them; until then the caller is asked to come back.
pub async fn delete(client: &Client, namespace: &str, worker: &str) -> Result<()> {
    let deployments = api(client, namespace, "MachineDeployment");
    for name in names(&deployments, worker).await? {
        deployments.delete(&name, &DeleteParams::default()).await?;
    }

    let in_use = classes_in_use(client, namespace).await?;
    let classes = api(client, namespace, "MachineClass");
    let mut waiting = false;
    for name in names(&classes, worker).await? {
        if in_use.contains(&name) {
            waiting = true;
            continue;
        }
        classes.delete(&name, &DeleteParams::default()).await?;
    }
    if waiting {
        return Err(Error::requeue(
            MACHINES_GONE_POLL,
            "waiting for machines to be deleted",
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::crds::Taint;

    fn deployment(strategy: &str) -> MachineDeployment {
        MachineDeployment {
            name: "shoot--dev--a-cpu-z1".to_string(),
            pool_name: "cpu".to_string(),
            class_name: "shoot--dev--a-cpu-z1-3f2a1".to_string(),
            zone: Some("1".to_string()),
            minimum: 1,
            maximum: 3,
            max_surge: IntOrPercent::Int(1),
            max_unavailable: IntOrPercent::Percent("10%".to_string()),
            update_strategy: strategy.to_string(),
            priority: None,
            labels: BTreeMap::from([("team".to_string(), "infra".to_string())]),
            annotations: BTreeMap::new(),
            taints: vec![Taint {
                key: "dedicated".to_string(),
                value: Some("gpu".to_string()),
                effect: "NoSchedule".to_string(),
            }],
        }
    }

    #[test]
    fn rolling_update_is_the_default_strategy() {
        let manifest = deployment_manifest(&deployment("AutoRollingUpdate"), "shoot--dev--a", "worker", 2);
        assert_eq!(
            manifest["spec"]["strategy"],
            json!({"type": "RollingUpdate", "rollingUpdate": {"maxSurge": 1, "maxUnavailable": "10%"}})
        );
        assert_eq!(manifest["spec"]["replicas"], json!(2));
        assert_eq!(
            manifest["spec"]["template"]["spec"]["class"]["name"],
            json!("shoot--dev--a-cpu-z1-3f2a1")
        );
        assert_eq!(manifest["metadata"]["labels"][WORKER_LABEL], json!("worker"));
    }

    #[test]
    fn in_place_strategies_carry_their_orchestration() {
        let auto = deployment_manifest(&deployment(AUTO_IN_PLACE_UPDATE), "ns", "worker", 1);
        assert_eq!(auto["spec"]["strategy"]["type"], json!("InPlaceUpdate"));
        assert_eq!(auto["spec"]["strategy"]["inPlaceUpdate"]["orchestrationType"], json!("Auto"));

        let manual = deployment_manifest(&deployment(MANUAL_IN_PLACE_UPDATE), "ns", "worker", 1);
        assert_eq!(manual["spec"]["strategy"]["inPlaceUpdate"]["orchestrationType"], json!("Manual"));
    }

    #[test]
    fn replicas_stay_within_pool_bounds() {
        let deployment = deployment(AUTO_IN_PLACE_UPDATE);
        assert_eq!(replicas(None, &deployment), 1);
        assert_eq!(replicas(Some(2), &deployment), 2);
        assert_eq!(replicas(Some(9), &deployment), 3);
        assert_eq!(replicas(Some(0), &deployment), 1);
    }
}
