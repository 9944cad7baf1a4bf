use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Purpose of a network object. Every subnet, security group, route table
/// and availability set carries exactly one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Purpose {
    Nodes,
    Internal,
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Nodes => write!(f, "nodes"),
            Self::Internal => write!(f, "internal"),
        }
    }
}

/// Shape of the worker network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum NetworkLayout {
    /// One `nodes` subnet for the whole cluster.
    #[default]
    SingleSubnet,
    /// One `nodes` subnet per zone.
    MultipleSubnet,
    /// A single-subnet cluster moving to one subnet per zone.
    Migrated,
}

impl std::fmt::Display for NetworkLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::SingleSubnet => write!(f, "SingleSubnet"),
            Self::MultipleSubnet => write!(f, "MultipleSubnet"),
            Self::Migrated => write!(f, "Migrated"),
        }
    }
}

/// Desired infrastructure of a shoot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfrastructureConfig {
    /// Name of an existing resource group to use. `None` creates one.
    pub resource_group: Option<String>,
    pub networks: NetworkConfig,
    pub identity: Option<IdentityConfig>,
    pub zoned: bool,
}

/// Desired network of a shoot.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkConfig {
    pub vnet: VnetConfig,
    /// Worker CIDR of the single-subnet layout.
    pub workers: Option<String>,
    pub nat_gateway: Option<NatGatewayConfig>,
    pub service_endpoints: Vec<String>,
    pub zones: Vec<ZoneConfig>,
}

impl NetworkConfig {
    /// Layout implied by the configured fields.
    #[must_use]
    pub fn layout(&self) -> NetworkLayout {
        if self.zones.is_empty() {
            NetworkLayout::SingleSubnet
        } else if self.workers.is_some() {
            NetworkLayout::Migrated
        } else {
            NetworkLayout::MultipleSubnet
        }
    }

    /// The zone that inherits the legacy subnet in the migrated layout.
    #[must_use]
    pub fn migrated_zone(&self) -> Option<&ZoneConfig> {
        let workers = self.workers.as_deref()?;
        self.zones.iter().find(|zone| zone.cidr == workers)
    }
}

/// Virtual network reference or creation parameters.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct VnetConfig {
    /// Name of an existing VNet. `None` creates one.
    pub name: Option<String>,
    pub resource_group: Option<String>,
    pub cidr: Option<String>,
    pub ddos_protection_plan_id: Option<String>,
}

impl VnetConfig {
    /// Returns `true` when the VNet is owned by the user.
    #[must_use]
    pub fn is_external(&self) -> bool {
        self.name.is_some()
    }
}

/// NAT gateway of the single-subnet layout.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NatGatewayConfig {
    pub enabled: bool,
    pub idle_connection_timeout_minutes: Option<i32>,
    pub zone: Option<i32>,
    pub ip_addresses: Vec<PublicIpReference>,
}

/// A user-provided public IP.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublicIpReference {
    pub name: String,
    pub resource_group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<i32>,
}

/// One zone of the multiple-subnet layout.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ZoneConfig {
    pub name: i32,
    pub cidr: String,
    pub nat_gateway: Option<ZonedNatGatewayConfig>,
    pub service_endpoints: Vec<String>,
}

/// NAT gateway of one zone.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ZonedNatGatewayConfig {
    pub enabled: bool,
    pub idle_connection_timeout_minutes: Option<i32>,
    pub ip_addresses: Vec<PublicIpReference>,
}

/// User-assigned managed identity to bind to the nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct IdentityConfig {
    pub name: String,
    pub resource_group: String,
    pub acr_access: bool,
}

/// Observed infrastructure, consumed by the worker and bastion reconcilers.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfrastructureStatus {
    pub resource_group: String,
    pub networks: NetworkStatus,
    pub availability_sets: Vec<AvailabilitySet>,
    pub route_tables: Vec<RouteTable>,
    pub security_groups: Vec<SecurityGroup>,
    pub identity: Option<IdentityStatus>,
    pub zoned: bool,
    pub migrating_to_vmo: bool,
}

impl InfrastructureStatus {
    /// Returns `true` when worker pools must be placed into VM orchestration
    /// groups: the shoot is not zoned and either no availability set exists
    /// or a migration away from availability sets was requested.
    #[must_use]
    pub fn is_vmo_required(&self) -> bool {
        !self.zoned && (self.availability_sets.is_empty() || self.migrating_to_vmo)
    }
}

/// Observed network.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkStatus {
    pub vnet: VnetStatus,
    pub subnets: Vec<Subnet>,
    pub layout: NetworkLayout,
    pub nat_gateway_public_ips: Vec<PublicIpReference>,
}

/// Observed VNet.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VnetStatus {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_group: Option<String>,
}

/// Observed subnet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subnet {
    pub name: String,
    pub purpose: Purpose,
    pub zone: Option<String>,
    /// Set on the subnet a single-subnet cluster carried into the
    /// multiple-subnet layout. Never cleared once set.
    pub migrated: bool,
}

/// Observed availability set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AvailabilitySet {
    pub purpose: Purpose,
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count_fault_domains: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count_update_domains: Option<i32>,
}

/// Observed route table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteTable {
    pub purpose: Purpose,
    pub name: String,
}

/// Observed network security group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityGroup {
    pub purpose: Purpose,
    pub name: String,
}

/// Observed managed identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityStatus {
    #[serde(rename = "id")]
    pub id: String,
    #[serde(rename = "clientID")]
    pub client_id: String,
    #[serde(rename = "acrAccess")]
    pub acr_access: bool,
}

/// Ledger of the infrastructure reconciler.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InfrastructureState {
    /// Free-form scratch data of reconciler subsystems.
    pub data: BTreeMap<String, String>,
    /// Every cloud object created by prior reconciles of this resource.
    pub managed_items: Vec<AzureResource>,
}

impl InfrastructureState {
    /// Records a created object. Resource IDs compare case-insensitively.
    pub fn record(&mut self, kind: impl Into<String>, id: impl Into<String>) {
        let id = id.into();
        if !self.contains(&id) {
            self.managed_items.push(AzureResource {
                kind: kind.into(),
                id,
            });
        }
    }

    /// Drops an object from the ledger.
    pub fn forget(&mut self, id: &str) {
        self.managed_items
            .retain(|item| !item.id.eq_ignore_ascii_case(id));
    }

    /// Returns `true` if the ledger contains the object.
    #[must_use]
    pub fn contains(&self, id: &str) -> bool {
        self.managed_items
            .iter()
            .any(|item| item.id.eq_ignore_ascii_case(id))
    }
}

/// A cloud object recorded in the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AzureResource {
    pub kind: String,
    pub id: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_follows_configured_fields() {
        let mut networks = NetworkConfig {
            workers: Some("10.250.0.0/16".to_string()),
            ..Default::default()
        };
        assert_eq!(networks.layout(), NetworkLayout::SingleSubnet);

        networks.zones.push(ZoneConfig {
            name: 1,
            cidr: "10.250.0.0/16".to_string(),
            ..Default::default()
        });
        assert_eq!(networks.layout(), NetworkLayout::Migrated);
        assert_eq!(networks.migrated_zone().map(|z| z.name), Some(1));

        networks.workers = None;
        assert_eq!(networks.layout(), NetworkLayout::MultipleSubnet);
        assert!(networks.migrated_zone().is_none());
    }

    #[test]
    fn ledger_deduplicates_case_insensitively() {
        let mut state = InfrastructureState::default();
        state.record("Microsoft.Resources/resourceGroups", "/subscriptions/s/resourceGroups/RG");
        state.record("Microsoft.Resources/resourceGroups", "/subscriptions/s/resourcegroups/rg");
        assert_eq!(state.managed_items.len(), 1);

        state.forget("/SUBSCRIPTIONS/S/RESOURCEGROUPS/RG");
        assert!(state.managed_items.is_empty());
    }

    #[test]
    fn vmo_required_only_without_zones_and_avsets() {
        let mut status = InfrastructureStatus::default();
        assert!(status.is_vmo_required());

        status.availability_sets.push(AvailabilitySet {
            purpose: Purpose::Nodes,
            id: "id".to_string(),
            name: "avset".to_string(),
            count_fault_domains: Some(2),
            count_update_domains: Some(5),
        });
        assert!(!status.is_vmo_required());

        status.migrating_to_vmo = true;
        assert!(status.is_vmo_required());

        status.zoned = true;
        assert!(!status.is_vmo_required());
    }
}
