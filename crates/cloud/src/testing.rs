//! In-memory fakes of Resource Manager and the blob service.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::blob::BlobStore;
use crate::transport::ArmTransport;
use crate::{CloudError, Result};

/// A mutating call observed by [`FakeArm`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mutation {
    Put(String),
    Delete(String),
    Post(String),
}

impl Mutation {
    #[must_use]
    pub fn id(&self) -> &str {
        match self {
            Self::Put(id) | Self::Delete(id) | Self::Post(id) => id,
        }
    }
}

#[derive(Debug, Clone)]
struct Failure {
    method: &'static str,
    id_suffix: String,
    status: u16,
    code: String,
    message: String,
    remaining: Option<usize>,
}

#[derive(Default)]
struct State {
    objects: BTreeMap<String, Value>,
    mutations: Vec<Mutation>,
    failures: Vec<Failure>,
    counter: u32,
}

/// Resource Manager backed by a map keyed by lower-cased resource ID.
///
/// PUT stores the body with `id`, `name` and a `Succeeded` provisioning state
/// and fills the read-only fields the extension depends on (public IP
/// addresses, private NIC addresses, identity client IDs). DELETE removes the
/// object and everything below it.
#[derive(Default)]
pub struct FakeArm {
    state: Mutex<State>,
}

impl FakeArm {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Seeds an object without recording a mutation.
    pub fn insert(&self, id: &str, mut value: Value) {
        stamp(&mut value, id);
        self.lock().objects.insert(id.to_ascii_lowercase(), value);
    }

    /// Current object at `id`.
    #[must_use]
    pub fn object(&self, id: &str) -> Option<Value> {
        self.lock().objects.get(&id.to_ascii_lowercase()).cloned()
    }

    /// IDs of all stored objects, lower-cased and sorted.
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.lock().objects.keys().cloned().collect()
    }

    #[must_use]
    pub fn mutations(&self) -> Vec<Mutation> {
        self.lock().mutations.clone()
    }

    pub fn clear_mutations(&self) {
        self.lock().mutations.clear();
    }

    /// Makes `method` calls on IDs ending with `id_suffix` fail with an API
    /// error. `times` limits how often; `None` fails forever.
    pub fn fail_on(
        &self,
        method: &'static str,
        id_suffix: &str,
        status: u16,
        code: &str,
        message: &str,
        times: Option<usize>,
    ) {
        self.lock().failures.push(Failure {
            method,
            id_suffix: id_suffix.to_ascii_lowercase(),
            status,
            code: code.to_string(),
            message: message.to_string(),
            remaining: times,
        });
    }

    fn check_failure(state: &mut State, method: &str, id: &str) -> Result<()> {
        let id = id.to_ascii_lowercase();
        let Some(failure) = state.failures.iter_mut().find(|f| {
            f.method == method && id.ends_with(&f.id_suffix) && f.remaining != Some(0)
        }) else {
            return Ok(());
        };
        if let Some(remaining) = failure.remaining.as_mut() {
            *remaining -= 1;
        }
        Err(CloudError::Api {
            status: failure.status,
            code: Some(failure.code.clone()),
            message: failure.message.clone(),
        })
    }
}

fn stamp(value: &mut Value, id: &str) {
    if !value.is_object() {
        *value = json!({});
    }
    let name = id.rsplit('/').next().unwrap_or_default();
    value["id"] = json!(id);
    value["name"] = json!(name);
    if !value["properties"].is_object() {
        value["properties"] = json!({});
    }
    value["properties"]["provisioningState"] = json!("Succeeded");
}

fn fill_read_only(value: &mut Value, id: &str, counter: u32) {
    let lower = id.to_ascii_lowercase();
    let octet = counter % 250 + 4;
    if lower.contains("/microsoft.network/publicipaddresses/")
        && value["properties"]["ipAddress"].is_null()
    {
        value["properties"]["ipAddress"] = json!(format!("20.0.0.{octet}"));
    }
    if lower.contains("/microsoft.network/networkinterfaces/") {
        if let Some(configs) = value["properties"]["ipConfigurations"].as_array_mut() {
            for config in configs {
                if config["properties"]["privateIPAddress"].is_null() {
                    config["properties"]["privateIPAddress"] = json!(format!("10.250.0.{octet}"));
                }
            }
        }
    }
    if lower.contains("/microsoft.managedidentity/userassignedidentities/") {
        value["properties"]["clientId"] = json!(format!("client-{octet}"));
        value["properties"]["principalId"] = json!(format!("principal-{octet}"));
    }
}

fn is_direct_child(collection: &str, id: &str) -> bool {
    id.strip_prefix(collection)
        .and_then(|rest| rest.strip_prefix('/'))
        .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'))
}

#[async_trait]
impl ArmTransport for FakeArm {
    async fn get(&self, id: &str, _api_version: &str) -> Result<Option<Value>> {
        let mut state = self.lock();
        Self::check_failure(&mut state, "GET", id)?;
        Ok(state.objects.get(&id.to_ascii_lowercase()).cloned())
    }

    async fn put(&self, id: &str, _api_version: &str, mut body: Value) -> Result<Value> {
        let mut state = self.lock();
        Self::check_failure(&mut state, "PUT", id)?;
        state.mutations.push(Mutation::Put(id.to_string()));

        let key = id.to_ascii_lowercase();
        // Read-only fields survive updates, as they do in Azure.
        if let Some(previous) = state.objects.get(&key) {
            for pointer in ["/properties/ipAddress", "/properties/clientId", "/properties/principalId"] {
                if let Some(kept) = previous.pointer(pointer) {
                    if body.pointer(pointer).is_none_or(Value::is_null) {
                        let field = pointer.rsplit('/').next().unwrap_or_default();
                        if body["properties"].is_object() {
                            body["properties"][field] = kept.clone();
                        }
                    }
                }
            }
        }
        stamp(&mut body, id);
        state.counter += 1;
        let counter = state.counter;
        fill_read_only(&mut body, id, counter);
        state.objects.insert(key, body.clone());
        Ok(body)
    }

    async fn delete(&self, id: &str, _api_version: &str) -> Result<()> {
        let mut state = self.lock();
        Self::check_failure(&mut state, "DELETE", id)?;
        state.mutations.push(Mutation::Delete(id.to_string()));
        let key = id.to_ascii_lowercase();
        let nested = format!("{key}/");
        state
            .objects
            .retain(|stored, _| stored != &key && !stored.starts_with(&nested));
        Ok(())
    }

    async fn list(&self, path: &str, _api_version: &str) -> Result<Vec<Value>> {
        let mut state = self.lock();
        Self::check_failure(&mut state, "LIST", path)?;
        let collection = path.to_ascii_lowercase();
        let group = collection
            .split("/providers/")
            .next()
            .unwrap_or_default()
            .to_string();
        if collection.contains("/resourcegroups/") && !state.objects.contains_key(&group) {
            return Err(CloudError::Api {
                status: 404,
                code: Some("ResourceGroupNotFound".to_string()),
                message: format!("Resource group '{group}' could not be found."),
            });
        }
        Ok(state
            .objects
            .iter()
            .filter(|(id, _)| is_direct_child(&collection, id))
            .map(|(_, value)| value.clone())
            .collect())
    }

    async fn post(
        &self,
        id: &str,
        action: &str,
        _api_version: &str,
        _headers: &[(&str, &str)],
    ) -> Result<()> {
        let mut state = self.lock();
        Self::check_failure(&mut state, "POST", id)?;
        state.mutations.push(Mutation::Post(format!("{id}/{action}")));
        if action == "lock" {
            if let Some(object) = state.objects.get_mut(&id.to_ascii_lowercase()) {
                object["properties"]["state"] = json!("Locked");
            }
        }
        Ok(())
    }
}

/// Blob service backed by sorted name sets per container.
#[derive(Default)]
pub struct FakeBlobStore {
    containers: Mutex<BTreeMap<(String, String), BTreeSet<String>>>,
}

impl FakeBlobStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<(String, String), BTreeSet<String>>> {
        self.containers
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub fn insert(&self, account: &str, container: &str, name: &str) {
        self.lock()
            .entry((account.to_string(), container.to_string()))
            .or_default()
            .insert(name.to_string());
    }

    #[must_use]
    pub fn blobs(&self, account: &str, container: &str) -> Vec<String> {
        self.lock()
            .get(&(account.to_string(), container.to_string()))
            .map(|names| names.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn list_blobs(
        &self,
        account: &str,
        container: &str,
        prefix: &str,
    ) -> Result<Vec<String>> {
        Ok(self
            .blobs(account, container)
            .into_iter()
            .filter(|name| name.starts_with(prefix))
            .collect())
    }

    async fn delete_blob(&self, account: &str, container: &str, name: &str) -> Result<()> {
        if let Some(names) = self
            .lock()
            .get_mut(&(account.to_string(), container.to_string()))
        {
            names.remove(name);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GROUP: &str = "/subscriptions/s/resourceGroups/RG";

    #[tokio::test]
    async fn deleting_a_group_removes_its_contents() {
        let arm = FakeArm::new();
        arm.put(GROUP, "v", json!({"location": "westeurope"})).await.unwrap();
        let nsg = format!("{GROUP}/providers/Microsoft.Network/networkSecurityGroups/nsg");
        arm.put(&nsg, "v", json!({"location": "westeurope"})).await.unwrap();

        let listed = arm
            .list(&format!("{GROUP}/providers/Microsoft.Network/networkSecurityGroups"), "v")
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        arm.delete(GROUP, "v").await.unwrap();
        assert!(arm.ids().is_empty());
        assert_eq!(arm.mutations().len(), 3);
    }

    #[tokio::test]
    async fn listing_a_missing_group_reports_it() {
        let arm = FakeArm::new();
        let err = arm
            .list(&format!("{GROUP}/providers/Microsoft.Compute/virtualMachineScaleSets"), "v")
            .await
            .unwrap_err();
        assert_eq!(err.code(), Some("ResourceGroupNotFound"));
    }

    #[tokio::test]
    async fn injected_failures_are_limited() {
        let arm = FakeArm::new();
        arm.fail_on("PUT", "/rg", 429, "TooManyRequests", "slow down", Some(1));
        assert!(arm.put(GROUP, "v", json!({})).await.is_err());
        assert!(arm.put(GROUP, "v", json!({})).await.is_ok());
    }
}
