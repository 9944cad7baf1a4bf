//! Typed Resource Manager clients.

use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, info};

use crate::resources::ArmResource;
use crate::transport::ArmTransport;
use crate::Result;

/// Resource Manager ID of an object.
///
/// IDs compare case-insensitively, the same way Azure treats them.
#[derive(Debug, Clone, Eq)]
pub struct ResourceId(String);

impl ResourceId {
    /// ID of a resource group.
    #[must_use]
    pub fn resource_group(subscription: &str, group: &str) -> Self {
        Self(format!("/subscriptions/{subscription}/resourceGroups/{group}"))
    }

    /// ID of a top-level object inside a resource group.
    #[must_use]
    pub fn resource(subscription: &str, group: &str, resource_type: &str, name: &str) -> Self {
        Self(format!(
            "/subscriptions/{subscription}/resourceGroups/{group}/providers/{resource_type}/{name}"
        ))
    }

    /// ID of a child object, e.g. a subnet of a virtual network.
    #[must_use]
    pub fn child(&self, segment: &str, name: &str) -> Self {
        Self(format!("{}/{segment}/{name}", self.0))
    }

    /// Wraps an ID received from Azure.
    #[must_use]
    pub fn parse(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Last path segment.
    #[must_use]
    pub fn name(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or_default()
    }

    /// Resource group segment, if present.
    #[must_use]
    pub fn resource_group_name(&self) -> Option<&str> {
        let mut segments = self.0.split('/');
        segments
            .by_ref()
            .find(|segment| segment.eq_ignore_ascii_case("resourceGroups"))?;
        segments.next()
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl PartialEq for ResourceId {
    fn eq(&self, other: &Self) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for ResourceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// CRUD access to objects of one type.
pub struct ResourceClient<T> {
    transport: Arc<dyn ArmTransport>,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for ResourceClient<T> {
    fn clone(&self) -> Self {
        Self {
            transport: Arc::clone(&self.transport),
            _marker: PhantomData,
        }
    }
}

impl<T: ArmResource> ResourceClient<T> {
    #[must_use]
    pub fn new(transport: Arc<dyn ArmTransport>) -> Self {
        Self {
            transport,
            _marker: PhantomData,
        }
    }

    /// Reads an object; `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns error on API failures or undecodable bodies.
    pub async fn get(&self, id: &ResourceId) -> Result<Option<T>> {
        match self.transport.get(id.as_str(), T::API_VERSION).await? {
            Some(value) => Ok(Some(serde_json::from_value(value)?)),
            None => Ok(None),
        }
    }

    /// Creates or replaces an object and returns its provisioned state.
    ///
    /// # Errors
    ///
    /// Returns error on API failures, failed provisioning or timeouts.
    pub async fn create_or_update(&self, id: &ResourceId, resource: &T) -> Result<T> {
        info!(id = %id, kind = T::RESOURCE_TYPE, "Creating or updating");
        let body = serde_json::to_value(resource)?;
        let value = self.transport.put(id.as_str(), T::API_VERSION, body).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Deletes an object. Deleting a missing object succeeds.
    ///
    /// # Errors
    ///
    /// Returns error on API failures or timeouts.
    pub async fn delete(&self, id: &ResourceId) -> Result<()> {
        info!(id = %id, kind = T::RESOURCE_TYPE, "Deleting");
        self.transport.delete(id.as_str(), T::API_VERSION).await
    }

    /// Lists the objects of this type below `parent`.
    ///
    /// For top-level types `parent` is a resource group; for child types it
    /// is the owning object.
    ///
    /// # Errors
    ///
    /// Returns error on API failures or undecodable bodies.
    pub async fn list(&self, parent: &ResourceId) -> Result<Vec<T>> {
        let path = collection_path(parent, T::RESOURCE_TYPE);
        debug!(path = %path, "Listing");
        self.transport
            .list(&path, T::API_VERSION)
            .await?
            .into_iter()
            .map(|value: Value| serde_json::from_value(value).map_err(Into::into))
            .collect()
    }

    /// Invokes an action on an object.
    ///
    /// # Errors
    ///
    /// Returns error on API failures.
    pub async fn action(
        &self,
        id: &ResourceId,
        action: &str,
        headers: &[(&str, &str)],
    ) -> Result<()> {
        self.transport
            .post(id.as_str(), action, T::API_VERSION, headers)
            .await
    }
}

/// `Namespace/type` lists under `<group>/providers/Namespace/type`, while
/// `Namespace/type/child` lists under `<parent>/child`.
fn collection_path(parent: &ResourceId, resource_type: &str) -> String {
    let segments: Vec<&str> = resource_type.split('/').collect();
    if segments.len() > 2 {
        format!("{parent}/{}", segments[segments.len() - 1])
    } else {
        format!("{parent}/providers/{resource_type}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::{NetworkSecurityGroup, Subnet, VirtualNetwork};
    use crate::testing::FakeArm;
    use pretty_assertions::assert_eq;

    #[test]
    fn resource_ids() {
        let vnet = ResourceId::resource("sub", "rg", VirtualNetwork::RESOURCE_TYPE, "shoot--a--b");
        assert_eq!(
            vnet.as_str(),
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/virtualNetworks/shoot--a--b"
        );
        let subnet = vnet.child("subnets", "shoot--a--b-nodes");
        assert_eq!(subnet.name(), "shoot--a--b-nodes");
        assert_eq!(subnet.resource_group_name(), Some("rg"));
        assert_eq!(
            ResourceId::parse(subnet.as_str().to_uppercase()),
            subnet,
            "IDs compare case-insensitively"
        );
    }

    #[test]
    fn collection_paths() {
        let group = ResourceId::resource_group("sub", "rg");
        assert_eq!(
            collection_path(&group, NetworkSecurityGroup::RESOURCE_TYPE),
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/networkSecurityGroups"
        );
        let vnet = ResourceId::resource("sub", "rg", VirtualNetwork::RESOURCE_TYPE, "v");
        assert_eq!(
            collection_path(&vnet, Subnet::RESOURCE_TYPE),
            format!("{vnet}/subnets")
        );
    }

    #[tokio::test]
    async fn typed_round_trip_through_transport() {
        let arm = Arc::new(FakeArm::new());
        let client: ResourceClient<VirtualNetwork> = ResourceClient::new(arm.clone());
        let id = ResourceId::resource("sub", "rg", VirtualNetwork::RESOURCE_TYPE, "vnet");

        assert_eq!(client.get(&id).await.unwrap(), None);

        let mut vnet = VirtualNetwork {
            location: "westeurope".to_string(),
            ..Default::default()
        };
        vnet.properties.address_space.address_prefixes = vec!["10.250.0.0/16".to_string()];
        let created = client.create_or_update(&id, &vnet).await.unwrap();
        assert_eq!(created.id.as_deref(), Some(id.as_str()));

        let listed = client
            .list(&ResourceId::resource_group("sub", "rg"))
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        client.delete(&id).await.unwrap();
        assert_eq!(client.get(&id).await.unwrap(), None);
    }
}
