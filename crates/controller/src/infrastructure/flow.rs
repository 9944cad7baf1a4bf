//! Upsert and cleanup steps of the infrastructure reconciler.

use azure_cloud::resources::{
    AvailabilitySet as ArmAvailabilitySet, AvailabilitySetProperties, NatGateway,
    NatGatewayProperties, NetworkSecurityGroup, PublicIpAddress, PublicIpAddressProperties,
    ResourceGroup, RouteTable as ArmRouteTable, ServiceEndpoint, Sku, SubResource,
    Subnet as ArmSubnet, SubnetProperties, Tags, UserAssignedIdentity, VirtualNetwork,
};
use azure_cloud::tags::technical_id_tags;
use azure_cloud::{ArmResource, ClientFactory, ResourceId};
use azure_config::api::{
    AvailabilitySet, AzureResource, IdentityStatus, InfrastructureState, InfrastructureStatus,
    NetworkStatus, PublicIpReference, Purpose, RouteTable, SecurityGroup, Subnet, VnetStatus,
};
use azure_config::helper::find_domain_count_by_region;
use tracing::{debug, info, warn};

use super::desired::{
    self, contains_id, deletion_rank, DesiredNatGateway, DesiredPublicIp, DesiredSubnet, Names,
    ROUTE_TABLE_NAME,
};
use super::InfrastructureRequest;
use crate::context::ReconcileContext;
use crate::error::{Error, Result};

/// One pass over the desired graph.
pub(super) struct Flow<'a> {
    factory: &'a ClientFactory,
    ctx: &'a ReconcileContext,
    request: &'a InfrastructureRequest<'a>,
    state: &'a mut InfrastructureState,
    names: Names<'a>,
    tags: Tags,
    /// Owned objects that remain desired after this pass.
    desired: Vec<ResourceId>,
}

impl<'a> Flow<'a> {
    pub(super) fn new(
        factory: &'a ClientFactory,
        ctx: &'a ReconcileContext,
        request: &'a InfrastructureRequest<'a>,
        state: &'a mut InfrastructureState,
    ) -> Self {
        Self {
            factory,
            ctx,
            request,
            state,
            names: Names::new(request.technical_id),
            tags: technical_id_tags(request.technical_id),
            desired: Vec::new(),
        }
    }

    fn own<T: ArmResource>(&mut self, id: &ResourceId) {
        self.state.record(T::RESOURCE_TYPE, id.as_str());
        self.desired.push(id.clone());
    }

    pub(super) async fn reconcile(mut self) -> Result<InfrastructureStatus> {
        let config = self.request.config;
        let group = self.ensure_resource_group().await?;
        let (vnet_id, vnet) = self.ensure_vnet(&group).await?;
        let route_table = self.ensure_route_table(&group).await?;
        let security_group = self.ensure_security_group(&group).await?;
        let availability_set = self.ensure_availability_set(&group).await?;

        let subnets =
            desired::subnets(config, &self.names, self.request.previous_status)?;
        let mut nat_ips = Vec::new();
        for subnet in &subnets {
            let nat_id = match &subnet.nat_gateway {
                Some(nat) => {
                    let (id, ips) = self.ensure_nat_gateway(&group, nat).await?;
                    nat_ips.extend(ips);
                    Some(id)
                }
                None => None,
            };
            self.ensure_subnet(&vnet_id, subnet, &security_group, &route_table, nat_id.as_ref())
                .await?;
        }

        self.delete_stale().await?;
        let identity = self.identity().await?;

        let mut status_subnets: Vec<Subnet> = subnets
            .iter()
            .map(|subnet| Subnet {
                name: subnet.name.clone(),
                purpose: Purpose::Nodes,
                zone: subnet.zone.map(|zone| zone.to_string()),
                migrated: subnet.migrated,
            })
            .collect();
        status_subnets.sort_by(|a, b| (a.purpose, &a.zone).cmp(&(b.purpose, &b.zone)));

        Ok(InfrastructureStatus {
            resource_group: group,
            networks: NetworkStatus {
                vnet: VnetStatus {
                    name: vnet.name.clone(),
                    resource_group: Some(vnet.resource_group.clone()),
                },
                subnets: status_subnets,
                layout: desired::status_layout(config),
                nat_gateway_public_ips: nat_ips,
            },
            availability_sets: availability_set.into_iter().collect(),
            route_tables: vec![RouteTable {
                purpose: Purpose::Nodes,
                name: ROUTE_TABLE_NAME.to_string(),
            }],
            security_groups: vec![SecurityGroup {
                purpose: Purpose::Nodes,
                name: self.names.security_group(),
            }],
            identity,
            zoned: config.zoned,
            migrating_to_vmo: self.request.migrating_to_vmo,
        })
    }

    async fn ensure_resource_group(&mut self) -> Result<String> {
        let name = desired::resource_group(self.request.config, self.request.technical_id);
        let id = self.factory.resource_group_id(&name);
        let existing = self.ctx.run(self.factory.resource_groups().get(&id)).await?;

        if self.request.config.resource_group.is_some() {
            if existing.is_none() {
                return Err(Error::MissingResource(format!("resource group {name}")));
            }
            return Ok(name);
        }
        if existing.is_none() {
            let group = ResourceGroup {
                location: self.request.region.to_string(),
                tags: self.tags.clone(),
                ..Default::default()
            };
            self.ctx
                .run(self.factory.resource_groups().create_or_update(&id, &group))
                .await?;
        }
        self.own::<ResourceGroup>(&id);
        Ok(name)
    }

    async fn ensure_vnet(&mut self, group: &str) -> Result<(ResourceId, desired::VnetTarget)> {
        let target = desired::vnet_target(self.request.config, self.request.technical_id, group);
        let id = self
            .factory
            .id_of::<VirtualNetwork>(&target.resource_group, &target.name);
        let existing = self.ctx.run(self.factory.virtual_networks().get(&id)).await?;

        if target.external {
            if existing.is_none() {
                return Err(Error::MissingResource(format!(
                    "virtual network {}/{}",
                    target.resource_group, target.name
                )));
            }
            return Ok((id, target));
        }

        let cidr = desired::vnet_cidr(self.request.config)?;
        let ddos = self.request.config.networks.vnet.ddos_protection_plan_id.clone();
        let mut wanted = VirtualNetwork {
            location: self.request.region.to_string(),
            tags: self.tags.clone(),
            ..Default::default()
        };
        wanted.properties.address_space.address_prefixes = vec![cidr];
        wanted.properties.ddos_protection_plan = ddos.clone().map(SubResource::new);
        wanted.properties.enable_ddos_protection = ddos.map(|_| true);

        match existing {
            Some(current) if desired::vnet_matches(&current, &wanted) => {
                debug!(vnet = %id, "Virtual network up to date");
            }
            Some(mut current) => {
                // Subnets travel along with the existing object.
                current.properties.address_space = wanted.properties.address_space;
                current.properties.ddos_protection_plan = wanted.properties.ddos_protection_plan;
                current.properties.enable_ddos_protection =
                    wanted.properties.enable_ddos_protection;
                self.ctx
                    .run(self.factory.virtual_networks().create_or_update(&id, &current))
                    .await?;
            }
            None => {
                self.ctx
                    .run(self.factory.virtual_networks().create_or_update(&id, &wanted))
                    .await?;
            }
        }
        self.own::<VirtualNetwork>(&id);
        Ok((id, target))
    }

    async fn ensure_route_table(&mut self, group: &str) -> Result<ResourceId> {
        let id = self.factory.id_of::<ArmRouteTable>(group, ROUTE_TABLE_NAME);
        if self.ctx.run(self.factory.route_tables().get(&id)).await?.is_none() {
            let table = ArmRouteTable {
                location: self.request.region.to_string(),
                tags: self.tags.clone(),
                ..Default::default()
            };
            self.ctx
                .run(self.factory.route_tables().create_or_update(&id, &table))
                .await?;
        }
        self.own::<ArmRouteTable>(&id);
        Ok(id)
    }

    async fn ensure_security_group(&mut self, group: &str) -> Result<ResourceId> {
        let id = self
            .factory
            .id_of::<NetworkSecurityGroup>(group, &self.names.security_group());
        // Rules belong to the cloud controller manager and bastions.
        if self.ctx.run(self.factory.security_groups().get(&id)).await?.is_none() {
            let nsg = NetworkSecurityGroup {
                location: self.request.region.to_string(),
                tags: self.tags.clone(),
                ..Default::default()
            };
            self.ctx
                .run(self.factory.security_groups().create_or_update(&id, &nsg))
                .await?;
        }
        self.own::<NetworkSecurityGroup>(&id);
        Ok(id)
    }

    /// Availability sets are kept for non-zoned shoots that already have one;
    /// new shoots use VM orchestration groups.
    async fn ensure_availability_set(&mut self, group: &str) -> Result<Option<AvailabilitySet>> {
        let name = self.names.availability_set();
        let id = self.factory.id_of::<ArmAvailabilitySet>(group, &name);
        let had_one = self.state.contains(id.as_str())
            || self
                .request
                .previous_status
                .is_some_and(|status| !status.availability_sets.is_empty());
        if self.request.config.zoned || !had_one {
            return Ok(None);
        }

        let current = match self.ctx.run(self.factory.availability_sets().get(&id)).await? {
            Some(current) => current,
            None => {
                let profile = self.request.cloud_profile;
                let fault_domains =
                    find_domain_count_by_region(&profile.count_fault_domains, self.request.region)?;
                let update_domains = find_domain_count_by_region(
                    &profile.count_update_domains,
                    self.request.region,
                )?;
                let set = ArmAvailabilitySet {
                    location: self.request.region.to_string(),
                    tags: self.tags.clone(),
                    sku: Some(Sku::new("Aligned")),
                    properties: AvailabilitySetProperties {
                        platform_fault_domain_count: Some(fault_domains),
                        platform_update_domain_count: Some(update_domains),
                    },
                    ..Default::default()
                };
                self.ctx
                    .run(self.factory.availability_sets().create_or_update(&id, &set))
                    .await?
            }
        };
        self.own::<ArmAvailabilitySet>(&id);
        Ok(Some(AvailabilitySet {
            purpose: Purpose::Nodes,
            id: id.as_str().to_string(),
            name,
            count_fault_domains: current.properties.platform_fault_domain_count,
            count_update_domains: current.properties.platform_update_domain_count,
        }))
    }

    async fn ensure_public_ip(&mut self, group: &str, ip: &DesiredPublicIp) -> Result<ResourceId> {
        let id = self.factory.id_of::<PublicIpAddress>(group, &ip.name);
        let wanted = PublicIpAddress {
            location: self.request.region.to_string(),
            tags: self.tags.clone(),
            sku: Some(Sku::new("Standard")),
            zones: ip.zone.map(|zone| vec![zone.to_string()]).unwrap_or_default(),
            properties: PublicIpAddressProperties {
                public_ip_allocation_method: Some("Static".to_string()),
                public_ip_address_version: Some("IPv4".to_string()),
                ip_address: None,
            },
            ..Default::default()
        };
        let existing = self.ctx.run(self.factory.public_ips().get(&id)).await?;
        if !existing.is_some_and(|current| desired::public_ip_matches(&current, &wanted)) {
            self.ctx
                .run(self.factory.public_ips().create_or_update(&id, &wanted))
                .await?;
        }
        self.own::<PublicIpAddress>(&id);
        Ok(id)
    }

    async fn ensure_nat_gateway(
        &mut self,
        group: &str,
        nat: &DesiredNatGateway,
    ) -> Result<(ResourceId, Vec<PublicIpReference>)> {
        let mut ip_ids = Vec::new();
        let mut references = Vec::new();
        for user_ip in &nat.user_ips {
            ip_ids.push(
                self.factory
                    .id_of::<PublicIpAddress>(&user_ip.resource_group, &user_ip.name),
            );
            references.push(user_ip.clone());
        }
        if let Some(ip) = &nat.managed_ip {
            ip_ids.push(self.ensure_public_ip(group, ip).await?);
            references.push(PublicIpReference {
                name: ip.name.clone(),
                resource_group: group.to_string(),
                zone: ip.zone,
            });
        }

        let id = self.factory.id_of::<NatGateway>(group, &nat.name);
        let wanted = NatGateway {
            location: self.request.region.to_string(),
            tags: self.tags.clone(),
            sku: Some(Sku::new("Standard")),
            zones: nat.zone.map(|zone| vec![zone.to_string()]).unwrap_or_default(),
            properties: NatGatewayProperties {
                idle_timeout_in_minutes: nat.idle_timeout_minutes,
                public_ip_addresses: ip_ids
                    .iter()
                    .map(|ip| SubResource::new(ip.as_str()))
                    .collect(),
            },
            ..Default::default()
        };
        let existing = self.ctx.run(self.factory.nat_gateways().get(&id)).await?;
        if !existing.is_some_and(|current| desired::nat_gateway_matches(&current, &wanted)) {
            self.ctx
                .run(self.factory.nat_gateways().create_or_update(&id, &wanted))
                .await?;
        }
        self.own::<NatGateway>(&id);
        Ok((id, references))
    }

    async fn ensure_subnet(
        &mut self,
        vnet: &ResourceId,
        subnet: &DesiredSubnet,
        security_group: &ResourceId,
        route_table: &ResourceId,
        nat_gateway: Option<&ResourceId>,
    ) -> Result<()> {
        let id = vnet.child("subnets", &subnet.name);
        let wanted = SubnetProperties {
            address_prefix: Some(subnet.cidr.clone()),
            network_security_group: Some(SubResource::new(security_group.as_str())),
            route_table: Some(SubResource::new(route_table.as_str())),
            nat_gateway: nat_gateway.map(|nat| SubResource::new(nat.as_str())),
            service_endpoints: subnet
                .service_endpoints
                .iter()
                .map(|service| ServiceEndpoint {
                    service: service.clone(),
                })
                .collect(),
        };
        let existing = self.ctx.run(self.factory.subnets().get(&id)).await?;
        if !existing.is_some_and(|current| desired::subnet_matches(&current.properties, &wanted)) {
            let body = ArmSubnet {
                id: None,
                properties: wanted,
            };
            self.ctx
                .run(self.factory.subnets().create_or_update(&id, &body))
                .await?;
        }
        self.own::<ArmSubnet>(&id);
        Ok(())
    }

    async fn identity(&self) -> Result<Option<IdentityStatus>> {
        let Some(identity) = &self.request.config.identity else {
            return Ok(None);
        };
        let id = self
            .factory
            .id_of::<UserAssignedIdentity>(&identity.resource_group, &identity.name);
        let found = self
            .ctx
            .run(self.factory.identities().get(&id))
            .await?
            .ok_or_else(|| Error::MissingResource(format!("identity {}", identity.name)))?;
        Ok(Some(IdentityStatus {
            id: found.id.unwrap_or_else(|| id.as_str().to_string()),
            client_id: found.properties.client_id.unwrap_or_default(),
            acr_access: identity.acr_access,
        }))
    }

    /// Deletes ledger entries that are no longer desired.
    async fn delete_stale(&mut self) -> Result<()> {
        let mut stale: Vec<AzureResource> = self
            .state
            .managed_items
            .iter()
            .filter(|item| !contains_id(&self.desired, &item.id))
            .cloned()
            .collect();
        stale.sort_by_key(|item| deletion_rank(&item.kind));
        for item in stale {
            info!(id = %item.id, kind = %item.kind, "Deleting object no longer desired");
            delete_item(self.factory, self.ctx, &item).await?;
            self.state.forget(&item.id);
        }
        Ok(())
    }
}

/// Deletes every ledger entry from the leaves to the root.
pub(super) async fn delete_all(
    factory: &ClientFactory,
    ctx: &ReconcileContext,
    state: &mut InfrastructureState,
) -> Result<()> {
    let mut items = state.managed_items.clone();
    items.sort_by_key(|item| deletion_rank(&item.kind));
    for item in items {
        delete_item(factory, ctx, &item).await?;
        state.forget(&item.id);
    }
    Ok(())
}

pub(super) async fn delete_item(
    factory: &ClientFactory,
    ctx: &ReconcileContext,
    item: &AzureResource,
) -> Result<()> {
    let id = ResourceId::parse(item.id.as_str());
    match item.kind.as_str() {
        k if k == ArmSubnet::RESOURCE_TYPE => ctx.run(factory.subnets().delete(&id)).await,
        k if k == NatGateway::RESOURCE_TYPE => ctx.run(factory.nat_gateways().delete(&id)).await,
        k if k == PublicIpAddress::RESOURCE_TYPE => {
            ctx.run(factory.public_ips().delete(&id)).await
        }
        k if k == ArmRouteTable::RESOURCE_TYPE => ctx.run(factory.route_tables().delete(&id)).await,
        k if k == NetworkSecurityGroup::RESOURCE_TYPE => {
            ctx.run(factory.security_groups().delete(&id)).await
        }
        k if k == ArmAvailabilitySet::RESOURCE_TYPE => {
            ctx.run(factory.availability_sets().delete(&id)).await
        }
        k if k == VirtualNetwork::RESOURCE_TYPE => {
            ctx.run(factory.virtual_networks().delete(&id)).await
        }
        k if k == ResourceGroup::RESOURCE_TYPE => {
            ctx.run(factory.resource_groups().delete(&id)).await
        }
        other => {
            warn!(id = %item.id, kind = other, "Unknown ledger entry, dropping it");
            Ok(())
        }
    }
}
