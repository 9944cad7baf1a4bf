//! Desired network graph of a shoot and comparison with observed objects.

use azure_cloud::resources::{NatGateway, PublicIpAddress, SubnetProperties, VirtualNetwork};
use azure_cloud::ResourceId;
use azure_config::api::{
    InfrastructureConfig, InfrastructureStatus, NetworkLayout, PublicIpReference,
};

use crate::error::{Error, Result};

/// Route table shared by all worker subnets.
pub const ROUTE_TABLE_NAME: &str = "worker_route_table";

/// Names of the objects owned by one shoot.
#[derive(Debug, Clone)]
pub struct Names<'a> {
    pub technical_id: &'a str,
}

impl<'a> Names<'a> {
    #[must_use]
    pub fn new(technical_id: &'a str) -> Self {
        Self { technical_id }
    }

    #[must_use]
    pub fn security_group(&self) -> String {
        format!("{}-workers", self.technical_id)
    }

    #[must_use]
    pub fn availability_set(&self) -> String {
        format!("{}-avset-workers", self.technical_id)
    }

    #[must_use]
    pub fn nat_gateway(&self, zone: Option<i32>) -> String {
        match zone {
            Some(zone) => format!("{}-nat-gateway-z{zone}", self.technical_id),
            None => format!("{}-nat-gateway", self.technical_id),
        }
    }

    #[must_use]
    pub fn subnet(&self, zone: Option<i32>) -> String {
        match zone {
            Some(zone) => format!("{}-nodes-z{zone}", self.technical_id),
            None => format!("{}-nodes", self.technical_id),
        }
    }
}

#[must_use]
pub fn public_ip_name(nat_gateway: &str) -> String {
    format!("{nat_gateway}-ip")
}

/// Resource group holding the shoot's objects.
#[must_use]
pub fn resource_group(config: &InfrastructureConfig, technical_id: &str) -> String {
    config
        .resource_group
        .clone()
        .unwrap_or_else(|| technical_id.to_string())
}

/// Location of the virtual network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VnetTarget {
    pub name: String,
    pub resource_group: String,
    /// Owned by the user; read, never written.
    pub external: bool,
}

#[must_use]
pub fn vnet_target(
    config: &InfrastructureConfig,
    technical_id: &str,
    resource_group: &str,
) -> VnetTarget {
    let vnet = &config.networks.vnet;
    match &vnet.name {
        Some(name) => VnetTarget {
            name: name.clone(),
            resource_group: vnet
                .resource_group
                .clone()
                .unwrap_or_else(|| resource_group.to_string()),
            external: true,
        },
        None => VnetTarget {
            name: technical_id.to_string(),
            resource_group: resource_group.to_string(),
            external: false,
        },
    }
}

/// Address space of a created VNet.
pub fn vnet_cidr(config: &InfrastructureConfig) -> Result<String> {
    config
        .networks
        .vnet
        .cidr
        .clone()
        .or_else(|| config.networks.workers.clone())
        .ok_or_else(|| Error::Validation("networks.vnet.cidr must be set".to_string()))
}

/// A worker subnet with its NAT gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredSubnet {
    pub name: String,
    pub zone: Option<i32>,
    pub cidr: String,
    pub service_endpoints: Vec<String>,
    pub nat_gateway: Option<DesiredNatGateway>,
    /// Legacy subnet carried into the per-zone layout.
    pub migrated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredNatGateway {
    pub name: String,
    pub zone: Option<i32>,
    pub idle_timeout_minutes: Option<i32>,
    /// Addresses provided by the user.
    pub user_ips: Vec<PublicIpReference>,
    /// Address created for the gateway when the user provides none.
    pub managed_ip: Option<DesiredPublicIp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredPublicIp {
    pub name: String,
    pub zone: Option<i32>,
}

impl DesiredNatGateway {
    fn new(
        name: String,
        zone: Option<i32>,
        idle_timeout_minutes: Option<i32>,
        user_ips: &[PublicIpReference],
    ) -> Self {
        let managed_ip = user_ips.is_empty().then(|| DesiredPublicIp {
            name: public_ip_name(&name),
            zone,
        });
        Self {
            name,
            zone,
            idle_timeout_minutes,
            user_ips: user_ips.to_vec(),
            managed_ip,
        }
    }
}

/// Zone that keeps the legacy subnet, from the configuration or, once
/// recorded, from the previous status.
fn migrated_zone(
    config: &InfrastructureConfig,
    previous: Option<&InfrastructureStatus>,
) -> Option<i32> {
    if let Some(zone) = config.networks.migrated_zone() {
        return Some(zone.name);
    }
    previous?
        .networks
        .subnets
        .iter()
        .find(|subnet| subnet.migrated)
        .and_then(|subnet| subnet.zone.as_deref())
        .and_then(|zone| zone.parse().ok())
}

/// Worker subnets of the configured layout, sorted by zone.
pub fn subnets(
    config: &InfrastructureConfig,
    names: &Names<'_>,
    previous: Option<&InfrastructureStatus>,
) -> Result<Vec<DesiredSubnet>> {
    let networks = &config.networks;
    if networks.layout() == NetworkLayout::SingleSubnet {
        let cidr = networks.workers.clone().ok_or_else(|| {
            Error::Validation("either networks.workers or networks.zones must be set".to_string())
        })?;
        let nat_gateway = networks
            .nat_gateway
            .as_ref()
            .filter(|nat| nat.enabled)
            .map(|nat| {
                DesiredNatGateway::new(
                    names.nat_gateway(None),
                    nat.zone,
                    nat.idle_connection_timeout_minutes,
                    &nat.ip_addresses,
                )
            });
        return Ok(vec![DesiredSubnet {
            name: names.subnet(None),
            zone: None,
            cidr,
            service_endpoints: networks.service_endpoints.clone(),
            nat_gateway,
            migrated: false,
        }]);
    }

    let migrated = migrated_zone(config, previous);
    let mut subnets: Vec<DesiredSubnet> = networks
        .zones
        .iter()
        .map(|zone| {
            let is_migrated = migrated == Some(zone.name);
            let (subnet_name, nat_name) = if is_migrated {
                (names.subnet(None), names.nat_gateway(None))
            } else {
                (names.subnet(Some(zone.name)), names.nat_gateway(Some(zone.name)))
            };
            let nat_gateway = zone.nat_gateway.as_ref().filter(|nat| nat.enabled).map(|nat| {
                DesiredNatGateway::new(
                    nat_name,
                    Some(zone.name),
                    nat.idle_connection_timeout_minutes,
                    &nat.ip_addresses,
                )
            });
            DesiredSubnet {
                name: subnet_name,
                zone: Some(zone.name),
                cidr: zone.cidr.clone(),
                service_endpoints: zone.service_endpoints.clone(),
                nat_gateway,
                migrated: is_migrated,
            }
        })
        .collect();
    subnets.sort_by(|a, b| a.zone.cmp(&b.zone));
    Ok(subnets)
}

/// Status layout: both per-zone layouts report `MultipleSubnet`.
#[must_use]
pub fn status_layout(config: &InfrastructureConfig) -> NetworkLayout {
    match config.networks.layout() {
        NetworkLayout::SingleSubnet => NetworkLayout::SingleSubnet,
        NetworkLayout::MultipleSubnet | NetworkLayout::Migrated => NetworkLayout::MultipleSubnet,
    }
}

fn ids_equal(a: Option<&str>, b: Option<&str>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
        (None, None) => true,
        _ => false,
    }
}

fn same_set(a: &[String], b: &[String]) -> bool {
    let mut a: Vec<String> = a.iter().map(|v| v.to_ascii_lowercase()).collect();
    let mut b: Vec<String> = b.iter().map(|v| v.to_ascii_lowercase()).collect();
    a.sort();
    a.dedup();
    b.sort();
    b.dedup();
    a == b
}

/// Returns `true` when the observed VNet has the desired address space and
/// protection plan.
#[must_use]
pub fn vnet_matches(existing: &VirtualNetwork, desired: &VirtualNetwork) -> bool {
    same_set(
        &existing.properties.address_space.address_prefixes,
        &desired.properties.address_space.address_prefixes,
    ) && ids_equal(
        existing.properties.ddos_protection_plan.as_ref().map(|p| p.id.as_str()),
        desired.properties.ddos_protection_plan.as_ref().map(|p| p.id.as_str()),
    )
}

#[must_use]
pub fn public_ip_matches(existing: &PublicIpAddress, desired: &PublicIpAddress) -> bool {
    existing.sku == desired.sku
        && same_set(&existing.zones, &desired.zones)
        && existing.properties.public_ip_allocation_method
            == desired.properties.public_ip_allocation_method
}

#[must_use]
pub fn nat_gateway_matches(existing: &NatGateway, desired: &NatGateway) -> bool {
    let ip_ids = |nat: &NatGateway| -> Vec<String> {
        nat.properties
            .public_ip_addresses
            .iter()
            .map(|ip| ip.id.clone())
            .collect()
    };
    same_set(&existing.zones, &desired.zones)
        && existing.properties.idle_timeout_in_minutes == desired.properties.idle_timeout_in_minutes
        && same_set(&ip_ids(existing), &ip_ids(desired))
}

#[must_use]
pub fn subnet_matches(existing: &SubnetProperties, desired: &SubnetProperties) -> bool {
    let endpoints = |properties: &SubnetProperties| -> Vec<String> {
        properties
            .service_endpoints
            .iter()
            .map(|endpoint| endpoint.service.clone())
            .collect()
    };
    existing.address_prefix == desired.address_prefix
        && ids_equal(
            existing.network_security_group.as_ref().map(|r| r.id.as_str()),
            desired.network_security_group.as_ref().map(|r| r.id.as_str()),
        )
        && ids_equal(
            existing.route_table.as_ref().map(|r| r.id.as_str()),
            desired.route_table.as_ref().map(|r| r.id.as_str()),
        )
        && ids_equal(
            existing.nat_gateway.as_ref().map(|r| r.id.as_str()),
            desired.nat_gateway.as_ref().map(|r| r.id.as_str()),
        )
        && same_set(&endpoints(existing), &endpoints(desired))
}

/// Deletion rank of a ledger entry; lower ranks are deleted first.
#[must_use]
pub fn deletion_rank(kind: &str) -> u8 {
    use azure_cloud::resources::{
        AvailabilitySet, NetworkSecurityGroup, ResourceGroup, RouteTable, Subnet,
    };
    use azure_cloud::ArmResource;

    match kind {
        k if k == Subnet::RESOURCE_TYPE => 0,
        k if k == NatGateway::RESOURCE_TYPE => 1,
        k if k == PublicIpAddress::RESOURCE_TYPE => 2,
        k if k == RouteTable::RESOURCE_TYPE
            || k == NetworkSecurityGroup::RESOURCE_TYPE
            || k == AvailabilitySet::RESOURCE_TYPE =>
        {
            3
        }
        k if k == VirtualNetwork::RESOURCE_TYPE => 4,
        k if k == ResourceGroup::RESOURCE_TYPE => 5,
        _ => 3,
    }
}

/// `true` if `id` is one of `ids`.
#[must_use]
pub fn contains_id(ids: &[ResourceId], id: &str) -> bool {
    let id = ResourceId::parse(id);
    ids.iter().any(|candidate| *candidate == id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use azure_config::api::{
        NatGatewayConfig, NetworkConfig, Purpose, Subnet, ZoneConfig, ZonedNatGatewayConfig,
    };
    use pretty_assertions::assert_eq;

    fn zoned(workers: Option<&str>) -> InfrastructureConfig {
        InfrastructureConfig {
            zoned: true,
            networks: NetworkConfig {
                workers: workers.map(str::to_string),
                zones: vec![
                    ZoneConfig {
                        name: 2,
                        cidr: "10.250.1.0/24".to_string(),
                        nat_gateway: Some(ZonedNatGatewayConfig {
                            enabled: true,
                            ..Default::default()
                        }),
                        service_endpoints: vec![],
                    },
                    ZoneConfig {
                        name: 1,
                        cidr: "10.250.0.0/24".to_string(),
                        nat_gateway: None,
                        service_endpoints: vec!["Microsoft.Storage".to_string()],
                    },
                ],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn single_subnet_layout() {
        let config = InfrastructureConfig {
            networks: NetworkConfig {
                workers: Some("10.250.0.0/16".to_string()),
                nat_gateway: Some(NatGatewayConfig {
                    enabled: true,
                    zone: Some(1),
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };
        let subnets = subnets(&config, &Names::new("shoot--a--b"), None).unwrap();
        assert_eq!(subnets.len(), 1);
        assert_eq!(subnets[0].name, "shoot--a--b-nodes");
        let nat = subnets[0].nat_gateway.as_ref().unwrap();
        assert_eq!(nat.name, "shoot--a--b-nat-gateway");
        assert_eq!(
            nat.managed_ip,
            Some(DesiredPublicIp {
                name: "shoot--a--b-nat-gateway-ip".to_string(),
                zone: Some(1)
            })
        );
        assert_eq!(status_layout(&config), NetworkLayout::SingleSubnet);
    }

    #[test]
    fn zoned_subnets_are_sorted_and_named_by_zone() {
        let subnets = subnets(&zoned(None), &Names::new("t"), None).unwrap();
        let names: Vec<_> = subnets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["t-nodes-z1", "t-nodes-z2"]);
        assert!(subnets[0].nat_gateway.is_none());
        assert_eq!(
            subnets[1].nat_gateway.as_ref().map(|n| n.name.as_str()),
            Some("t-nat-gateway-z2")
        );
    }

    #[test]
    fn migrated_zone_keeps_legacy_names() {
        let subnets = subnets(&zoned(Some("10.250.1.0/24")), &Names::new("t"), None).unwrap();
        let migrated = subnets.iter().find(|s| s.migrated).unwrap();
        assert_eq!(migrated.zone, Some(2));
        assert_eq!(migrated.name, "t-nodes");
        assert_eq!(
            migrated.nat_gateway.as_ref().map(|n| n.name.as_str()),
            Some("t-nat-gateway")
        );
    }

    #[test]
    fn migrated_flag_sticks_after_workers_removal() {
        let previous = InfrastructureStatus {
            networks: azure_config::api::NetworkStatus {
                subnets: vec![Subnet {
                    name: "t-nodes".to_string(),
                    purpose: Purpose::Nodes,
                    zone: Some("2".to_string()),
                    migrated: true,
                }],
                ..Default::default()
            },
            ..Default::default()
        };
        let subnets = subnets(&zoned(None), &Names::new("t"), Some(&previous)).unwrap();
        assert!(subnets.iter().any(|s| s.migrated && s.name == "t-nodes"));
    }

    #[test]
    fn deletion_goes_from_leaves_to_root() {
        use azure_cloud::resources::{ResourceGroup, Subnet as ArmSubnet};
        use azure_cloud::ArmResource;
        assert!(deletion_rank(ArmSubnet::RESOURCE_TYPE) < deletion_rank(NatGateway::RESOURCE_TYPE));
        assert!(
            deletion_rank(NatGateway::RESOURCE_TYPE) < deletion_rank(PublicIpAddress::RESOURCE_TYPE)
        );
        assert!(
            deletion_rank(VirtualNetwork::RESOURCE_TYPE) < deletion_rank(ResourceGroup::RESOURCE_TYPE)
        );
    }
}
