//! Client factory.
//!
//! One factory per reconcile: it binds credentials and a cloud instance to
//! typed clients that share a transport and a token cache.

use std::sync::Arc;

use azure_config::api::CloudConfiguration;

use crate::blob::{BlobClient, BlobStore};
use crate::clients::{ResourceClient, ResourceId};
use crate::credentials::Credentials;
use crate::endpoints::CloudEndpoints;
use crate::resources::{
    ArmResource, AvailabilitySet, BlobContainer, Disk, ImmutabilityPolicy, NatGateway,
    NetworkInterface, NetworkSecurityGroup, PublicIpAddress, RecordSet, ResourceGroup, RouteTable,
    Subnet, UserAssignedIdentity, VirtualMachine, VirtualMachineScaleSet, VirtualNetwork,
};
use crate::token::{AadTokenProvider, TokenSource};
use crate::transport::{ArmClient, ArmTransport};
use crate::Result;

/// Builds typed clients for one subscription.
#[derive(Clone)]
pub struct ClientFactory {
    subscription_id: String,
    storage_account: Option<String>,
    transport: Arc<dyn ArmTransport>,
    blobs: Arc<dyn BlobStore>,
}

impl ClientFactory {
    /// Creates a factory talking to the given cloud instance.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP clients cannot be created.
    pub fn new(credentials: Credentials, endpoints: CloudEndpoints) -> Result<Self> {
        let subscription_id = credentials.subscription_id.clone();
        let storage_account = credentials.storage_account.clone();
        let tokens: Arc<dyn TokenSource> =
            Arc::new(AadTokenProvider::new(endpoints.clone(), credentials)?);
        let transport = Arc::new(ArmClient::new(&endpoints, Arc::clone(&tokens))?);
        let blobs = Arc::new(BlobClient::new(endpoints, tokens)?);
        Ok(Self {
            subscription_id,
            storage_account,
            transport,
            blobs,
        })
    }

    /// Creates a factory for the cloud instance serving `region`.
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP clients cannot be created.
    pub fn for_region(
        credentials: Credentials,
        configuration: Option<&CloudConfiguration>,
        region: &str,
    ) -> Result<Self> {
        let endpoints = CloudEndpoints::from(CloudConfiguration::resolve(configuration, region));
        Self::new(credentials, endpoints)
    }

    /// Creates a factory over an existing transport and blob store.
    #[must_use]
    pub fn with_transport(
        subscription_id: impl Into<String>,
        transport: Arc<dyn ArmTransport>,
        blobs: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            subscription_id: subscription_id.into(),
            storage_account: None,
            transport,
            blobs,
        }
    }

    #[must_use]
    pub fn with_storage_account(mut self, account: impl Into<String>) -> Self {
        self.storage_account = Some(account.into());
        self
    }

    #[must_use]
    pub fn subscription_id(&self) -> &str {
        &self.subscription_id
    }

    /// Storage account of backup credentials.
    #[must_use]
    pub fn storage_account(&self) -> Option<&str> {
        self.storage_account.as_deref()
    }

    /// ID of a resource group in this subscription.
    #[must_use]
    pub fn resource_group_id(&self, group: &str) -> ResourceId {
        ResourceId::resource_group(&self.subscription_id, group)
    }

    /// ID of a top-level object of type `T` in this subscription.
    #[must_use]
    pub fn id_of<T: ArmResource>(&self, group: &str, name: &str) -> ResourceId {
        ResourceId::resource(&self.subscription_id, group, T::RESOURCE_TYPE, name)
    }

    /// Typed client for any resource type.
    #[must_use]
    pub fn client<T: ArmResource>(&self) -> ResourceClient<T> {
        ResourceClient::new(Arc::clone(&self.transport))
    }

    #[must_use]
    pub fn resource_groups(&self) -> ResourceClient<ResourceGroup> {
        self.client()
    }

    #[must_use]
    pub fn virtual_networks(&self) -> ResourceClient<VirtualNetwork> {
        self.client()
    }

    #[must_use]
    pub fn subnets(&self) -> ResourceClient<Subnet> {
        self.client()
    }

    #[must_use]
    pub fn security_groups(&self) -> ResourceClient<NetworkSecurityGroup> {
        self.client()
    }

    #[must_use]
    pub fn route_tables(&self) -> ResourceClient<RouteTable> {
        self.client()
    }

    #[must_use]
    pub fn nat_gateways(&self) -> ResourceClient<NatGateway> {
        self.client()
    }

    #[must_use]
    pub fn public_ips(&self) -> ResourceClient<PublicIpAddress> {
        self.client()
    }

    #[must_use]
    pub fn network_interfaces(&self) -> ResourceClient<NetworkInterface> {
        self.client()
    }

    #[must_use]
    pub fn availability_sets(&self) -> ResourceClient<AvailabilitySet> {
        self.client()
    }

    #[must_use]
    pub fn virtual_machines(&self) -> ResourceClient<VirtualMachine> {
        self.client()
    }

    #[must_use]
    pub fn disks(&self) -> ResourceClient<Disk> {
        self.client()
    }

    #[must_use]
    pub fn vmos(&self) -> ResourceClient<VirtualMachineScaleSet> {
        self.client()
    }

    #[must_use]
    pub fn identities(&self) -> ResourceClient<UserAssignedIdentity> {
        self.client()
    }

    #[must_use]
    pub fn blob_containers(&self) -> ResourceClient<BlobContainer> {
        self.client()
    }

    #[must_use]
    pub fn immutability_policies(&self) -> ResourceClient<ImmutabilityPolicy> {
        self.client()
    }

    #[must_use]
    pub fn record_sets(&self) -> ResourceClient<RecordSet> {
        self.client()
    }

    /// Blob data-plane client.
    #[must_use]
    pub fn blobs(&self) -> Arc<dyn BlobStore> {
        Arc::clone(&self.blobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeArm, FakeBlobStore};

    #[test]
    fn ids_are_scoped_to_the_subscription() {
        let factory = ClientFactory::with_transport(
            "sub",
            Arc::new(FakeArm::new()),
            Arc::new(FakeBlobStore::new()),
        );
        assert_eq!(
            factory.id_of::<NatGateway>("rg", "shoot-nat-gateway").as_str(),
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Network/natGateways/shoot-nat-gateway"
        );
        assert_eq!(
            factory.resource_group_id("rg").as_str(),
            "/subscriptions/sub/resourceGroups/rg"
        );
    }
}
