//! Conversions between the serialized and the internal representation.

use std::time::Duration;

use crate::api;
use crate::{Error, Result};

use super::{
    BackupBucketConfig, CloudProfileConfig, DataVolume, IdentityConfig, Image,
    ImmutableConfig, InfrastructureConfig, InfrastructureState, InfrastructureStatus,
    MachineImage, MachineImageFlavor, MachineImageVersion, MachineImages, NatGatewayConfig,
    NetworkConfig, NetworkStatus, NodeTemplate, ResourceGroup, Subnet, Vnet, WorkerConfig,
    WorkerStatus, Zone, ZonedNatGatewayConfig, ZonedPublicIpReference,
};

impl Image {
    /// Resolves the single image location. More than one set field is an error.
    fn reference(&self, field: &str) -> Result<Option<api::ImageReference>> {
        let candidates = [
            self.urn.clone().map(api::ImageReference::Urn),
            self.id.clone().map(api::ImageReference::Id),
            self.community_gallery_image_id
                .clone()
                .map(api::ImageReference::CommunityGallery),
            self.shared_gallery_image_id
                .clone()
                .map(api::ImageReference::SharedGallery),
        ];
        let mut set = candidates.into_iter().flatten();
        let first = set.next();
        if set.next().is_some() {
            return Err(Error::conversion(
                field,
                "only one of urn, id, communityGalleryImageID or sharedGalleryImageID may be set",
            ));
        }
        Ok(first)
    }

    fn required_reference(&self, field: &str) -> Result<api::ImageReference> {
        self.reference(field)?.ok_or_else(|| {
            Error::conversion(
                field,
                "one of urn, id, communityGalleryImageID or sharedGalleryImageID must be set",
            )
        })
    }
}

impl From<&api::ImageReference> for Image {
    fn from(reference: &api::ImageReference) -> Self {
        let mut image = Self::default();
        match reference {
            api::ImageReference::Urn(v) => image.urn = Some(v.clone()),
            api::ImageReference::Id(v) => image.id = Some(v.clone()),
            api::ImageReference::CommunityGallery(v) => {
                image.community_gallery_image_id = Some(v.clone());
            }
            api::ImageReference::SharedGallery(v) => image.shared_gallery_image_id = Some(v.clone()),
        }
        image
    }
}

impl From<&api::ControlPlaneConfig> for api::ControlPlaneConfig {
    fn from(config: &api::ControlPlaneConfig) -> Self {
        config.clone()
    }
}

// Infrastructure

impl TryFrom<InfrastructureConfig> for api::InfrastructureConfig {
    type Error = Error;

    fn try_from(wire: InfrastructureConfig) -> Result<Self> {
        let networks = wire.networks;
        Ok(Self {
            resource_group: wire.resource_group.map(|rg| rg.name),
            networks: api::NetworkConfig {
                vnet: api::VnetConfig {
                    name: networks.vnet.name,
                    resource_group: networks.vnet.resource_group,
                    cidr: networks.vnet.cidr,
                    ddos_protection_plan_id: networks.vnet.ddos_protection_plan_id,
                },
                workers: networks.workers,
                nat_gateway: networks.nat_gateway.map(|nat| api::NatGatewayConfig {
                    enabled: nat.enabled,
                    idle_connection_timeout_minutes: nat.idle_connection_timeout_minutes,
                    zone: nat.zone,
                    ip_addresses: nat.ip_addresses,
                }),
                service_endpoints: networks.service_endpoints,
                zones: networks
                    .zones
                    .into_iter()
                    .map(|zone| api::ZoneConfig {
                        name: zone.name,
                        cidr: zone.cidr,
                        nat_gateway: zone.nat_gateway.map(|nat| api::ZonedNatGatewayConfig {
                            enabled: nat.enabled,
                            idle_connection_timeout_minutes: nat.idle_connection_timeout_minutes,
                            ip_addresses: nat
                                .ip_addresses
                                .into_iter()
                                .map(|ip| api::PublicIpReference {
                                    name: ip.name,
                                    resource_group: ip.resource_group,
                                    zone: Some(zone.name),
                                })
                                .collect(),
                        }),
                        service_endpoints: zone.service_endpoints,
                    })
                    .collect(),
            },
            identity: wire.identity.map(|identity| api::IdentityConfig {
                name: identity.name,
                resource_group: identity.resource_group,
                acr_access: identity.acr_access.unwrap_or_default(),
            }),
            zoned: wire.zoned,
        })
    }
}

impl From<&api::InfrastructureConfig> for InfrastructureConfig {
    fn from(config: &api::InfrastructureConfig) -> Self {
        let networks = &config.networks;
        Self {
            resource_group: config
                .resource_group
                .clone()
                .map(|name| ResourceGroup { name }),
            networks: NetworkConfig {
                vnet: Vnet {
                    name: networks.vnet.name.clone(),
                    resource_group: networks.vnet.resource_group.clone(),
                    cidr: networks.vnet.cidr.clone(),
                    ddos_protection_plan_id: networks.vnet.ddos_protection_plan_id.clone(),
                },
                workers: networks.workers.clone(),
                nat_gateway: networks.nat_gateway.as_ref().map(|nat| NatGatewayConfig {
                    enabled: nat.enabled,
                    idle_connection_timeout_minutes: nat.idle_connection_timeout_minutes,
                    zone: nat.zone,
                    ip_addresses: nat.ip_addresses.clone(),
                }),
                service_endpoints: networks.service_endpoints.clone(),
                zones: networks
                    .zones
                    .iter()
                    .map(|zone| Zone {
                        name: zone.name,
                        cidr: zone.cidr.clone(),
                        nat_gateway: zone.nat_gateway.as_ref().map(|nat| ZonedNatGatewayConfig {
                            enabled: nat.enabled,
                            idle_connection_timeout_minutes: nat.idle_connection_timeout_minutes,
                            ip_addresses: nat
                                .ip_addresses
                                .iter()
                                .map(|ip| ZonedPublicIpReference {
                                    name: ip.name.clone(),
                                    resource_group: ip.resource_group.clone(),
                                })
                                .collect(),
                        }),
                        service_endpoints: zone.service_endpoints.clone(),
                    })
                    .collect(),
            },
            identity: config.identity.as_ref().map(|identity| IdentityConfig {
                name: identity.name.clone(),
                resource_group: identity.resource_group.clone(),
                acr_access: identity.acr_access.then_some(true),
            }),
            zoned: config.zoned,
        }
    }
}

impl TryFrom<InfrastructureStatus> for api::InfrastructureStatus {
    type Error = Error;

    fn try_from(wire: InfrastructureStatus) -> Result<Self> {
        Ok(Self {
            resource_group: wire.resource_group.name,
            networks: api::NetworkStatus {
                vnet: wire.networks.vnet,
                subnets: wire
                    .networks
                    .subnets
                    .into_iter()
                    .map(|subnet| api::Subnet {
                        name: subnet.name,
                        purpose: subnet.purpose,
                        zone: subnet.zone,
                        migrated: subnet.migrated.unwrap_or_default(),
                    })
                    .collect(),
                layout: wire.networks.layout.unwrap_or_default(),
                nat_gateway_public_ips: wire.networks.nat_gateway_public_ips,
            },
            availability_sets: wire.availability_sets,
            route_tables: wire.route_tables,
            security_groups: wire.security_groups,
            identity: wire.identity,
            zoned: wire.zoned,
            migrating_to_vmo: wire.migrating_to_vmo.unwrap_or_default(),
        })
    }
}

impl From<&api::InfrastructureStatus> for InfrastructureStatus {
    fn from(status: &api::InfrastructureStatus) -> Self {
        Self {
            networks: NetworkStatus {
                vnet: status.networks.vnet.clone(),
                subnets: status
                    .networks
                    .subnets
                    .iter()
                    .map(|subnet| Subnet {
                        name: subnet.name.clone(),
                        purpose: subnet.purpose,
                        zone: subnet.zone.clone(),
                        migrated: subnet.migrated.then_some(true),
                    })
                    .collect(),
                layout: Some(status.networks.layout),
                nat_gateway_public_ips: status.networks.nat_gateway_public_ips.clone(),
            },
            resource_group: ResourceGroup {
                name: status.resource_group.clone(),
            },
            availability_sets: status.availability_sets.clone(),
            route_tables: status.route_tables.clone(),
            security_groups: status.security_groups.clone(),
            identity: status.identity.clone(),
            zoned: status.zoned,
            migrating_to_vmo: status.migrating_to_vmo.then_some(true),
        }
    }
}

impl TryFrom<InfrastructureState> for api::InfrastructureState {
    type Error = Error;

    fn try_from(wire: InfrastructureState) -> Result<Self> {
        Ok(Self {
            data: wire.data.unwrap_or_default(),
            managed_items: wire.managed_items.unwrap_or_default(),
        })
    }
}

impl From<&api::InfrastructureState> for InfrastructureState {
    fn from(state: &api::InfrastructureState) -> Self {
        Self {
            data: (!state.data.is_empty()).then(|| state.data.clone()),
            managed_items: (!state.managed_items.is_empty()).then(|| state.managed_items.clone()),
        }
    }
}

// Cloud profile

impl TryFrom<CloudProfileConfig> for api::CloudProfileConfig {
    type Error = Error;

    fn try_from(wire: CloudProfileConfig) -> Result<Self> {
        let machine_images = wire
            .machine_images
            .into_iter()
            .map(|image| {
                let versions = image
                    .versions
                    .into_iter()
                    .map(|version| convert_version(&image.name, version))
                    .collect::<Result<Vec<_>>>()?;
                Ok(api::MachineImages {
                    name: image.name,
                    versions,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            count_update_domains: wire.count_update_domains,
            count_fault_domains: wire.count_fault_domains,
            machine_images,
            machine_types: wire.machine_types,
            cloud_configuration: wire.cloud_configuration,
        })
    }
}

fn convert_version(image: &str, version: MachineImageVersion) -> Result<api::MachineImageVersion> {
    let field = format!("machineImages[{image}].versions[{}]", version.version);
    let mut flavors = Vec::with_capacity(version.capability_flavors.len() + 1);

    if let Some(reference) = version.image.reference(&field)? {
        flavors.push(api::ImageFlavor {
            reference,
            skip_marketplace_agreement: version.skip_marketplace_agreement.unwrap_or_default(),
            kind: api::FlavorKind::Legacy {
                architecture: version.architecture,
                accelerated_networking: version.accelerated_networking.unwrap_or_default(),
            },
        });
    }

    for (index, flavor) in version.capability_flavors.into_iter().enumerate() {
        let field = format!("{field}.capabilityFlavors[{index}]");
        flavors.push(api::ImageFlavor {
            reference: flavor.image.required_reference(&field)?,
            skip_marketplace_agreement: flavor.skip_marketplace_agreement.unwrap_or_default(),
            kind: api::FlavorKind::Capability(flavor.capabilities),
        });
    }

    Ok(api::MachineImageVersion {
        version: version.version,
        flavors,
    })
}

impl From<&api::CloudProfileConfig> for CloudProfileConfig {
    fn from(config: &api::CloudProfileConfig) -> Self {
        Self {
            count_update_domains: config.count_update_domains.clone(),
            count_fault_domains: config.count_fault_domains.clone(),
            machine_images: config
                .machine_images
                .iter()
                .map(|image| MachineImages {
                    name: image.name.clone(),
                    versions: image.versions.iter().flat_map(wire_versions).collect(),
                })
                .collect(),
            machine_types: config.machine_types.clone(),
            cloud_configuration: config.cloud_configuration.clone(),
        }
    }
}

/// Legacy flavors become one flat version entry each; capability flavors
/// are grouped under a single entry.
fn wire_versions(version: &api::MachineImageVersion) -> Vec<MachineImageVersion> {
    let mut entries = Vec::new();
    let mut capability_flavors = Vec::new();

    for flavor in &version.flavors {
        match &flavor.kind {
            api::FlavorKind::Legacy {
                architecture,
                accelerated_networking,
            } => entries.push(MachineImageVersion {
                version: version.version.clone(),
                image: Image::from(&flavor.reference),
                skip_marketplace_agreement: flavor.skip_marketplace_agreement.then_some(true),
                accelerated_networking: accelerated_networking.then_some(true),
                architecture: architecture.clone(),
                capability_flavors: Vec::new(),
            }),
            api::FlavorKind::Capability(capabilities) => {
                capability_flavors.push(MachineImageFlavor {
                    capabilities: capabilities.clone(),
                    image: Image::from(&flavor.reference),
                    skip_marketplace_agreement: flavor.skip_marketplace_agreement.then_some(true),
                });
            }
        }
    }

    if !capability_flavors.is_empty() {
        entries.push(MachineImageVersion {
            version: version.version.clone(),
            capability_flavors,
            ..Default::default()
        });
    }
    entries
}

// Worker

impl TryFrom<WorkerConfig> for api::WorkerConfig {
    type Error = Error;

    fn try_from(wire: WorkerConfig) -> Result<Self> {
        let data_volumes = wire
            .data_volumes
            .into_iter()
            .map(|volume| {
                let image_ref = match volume.image_ref {
                    Some(image) => Some(
                        image.required_reference(&format!("dataVolumes[{}].imageRef", volume.name))?,
                    ),
                    None => None,
                };
                Ok(api::DataVolume {
                    name: volume.name,
                    image_ref,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            node_template: wire.node_template.map(|template| api::NodeTemplate {
                capacity: template.capacity,
                virtual_capacity: template.virtual_capacity,
            }),
            diagnostics_profile: wire.diagnostics_profile,
            data_volumes,
            capacity_reservation: wire.capacity_reservation,
            os_disk: wire.os_disk,
        })
    }
}

impl From<&api::WorkerConfig> for WorkerConfig {
    fn from(config: &api::WorkerConfig) -> Self {
        Self {
            node_template: config.node_template.as_ref().map(|template| NodeTemplate {
                capacity: template.capacity.clone(),
                virtual_capacity: template.virtual_capacity.clone(),
            }),
            diagnostics_profile: config.diagnostics_profile.clone(),
            data_volumes: config
                .data_volumes
                .iter()
                .map(|volume| DataVolume {
                    name: volume.name.clone(),
                    image_ref: volume.image_ref.as_ref().map(Image::from),
                })
                .collect(),
            capacity_reservation: config.capacity_reservation.clone(),
            os_disk: config.os_disk.clone(),
        }
    }
}

impl TryFrom<WorkerStatus> for api::WorkerStatus {
    type Error = Error;

    fn try_from(wire: WorkerStatus) -> Result<Self> {
        let machine_images = wire
            .machine_images
            .into_iter()
            .map(|image| {
                let field = format!("machineImages[{}:{}]", image.name, image.version);
                Ok(api::MachineImage {
                    reference: image.image.required_reference(&field)?,
                    name: image.name,
                    version: image.version,
                    skip_marketplace_agreement: image.skip_marketplace_agreement.unwrap_or_default(),
                    accelerated_networking: image.accelerated_networking.unwrap_or_default(),
                    architecture: image.architecture,
                    capabilities: image.capabilities,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            machine_images,
            vmo_dependencies: wire.vmo_dependencies,
        })
    }
}

impl From<&api::WorkerStatus> for WorkerStatus {
    fn from(status: &api::WorkerStatus) -> Self {
        Self {
            machine_images: status
                .machine_images
                .iter()
                .map(|image| MachineImage {
                    name: image.name.clone(),
                    version: image.version.clone(),
                    image: Image::from(&image.reference),
                    skip_marketplace_agreement: image.skip_marketplace_agreement.then_some(true),
                    accelerated_networking: image.accelerated_networking.then_some(true),
                    architecture: image.architecture.clone(),
                    capabilities: image.capabilities.clone(),
                })
                .collect(),
            vmo_dependencies: status.vmo_dependencies.clone(),
        }
    }
}

// Backup

impl TryFrom<BackupBucketConfig> for api::BackupBucketConfig {
    type Error = Error;

    fn try_from(wire: BackupBucketConfig) -> Result<Self> {
        let immutability = match wire.immutability {
            Some(immutability) => {
                let retention_type = match immutability.retention_type.as_str() {
                    "bucket" => api::RetentionType::Bucket,
                    other => {
                        return Err(Error::conversion(
                            "immutability.retentionType",
                            format!("unsupported value {other:?}, must be \"bucket\""),
                        ))
                    }
                };
                let retention_period = parse_duration(&immutability.retention_period)
                    .map_err(|reason| Error::conversion("immutability.retentionPeriod", reason))?;
                Some(api::ImmutableConfig {
                    retention_type,
                    retention_period,
                    locked: immutability.locked,
                })
            }
            None => None,
        };

        Ok(Self {
            immutability,
            cloud_configuration: wire.cloud_configuration,
        })
    }
}

impl From<&api::BackupBucketConfig> for BackupBucketConfig {
    fn from(config: &api::BackupBucketConfig) -> Self {
        Self {
            immutability: config.immutability.as_ref().map(|immutability| ImmutableConfig {
                retention_type: "bucket".to_string(),
                retention_period: format_duration(immutability.retention_period),
                locked: immutability.locked,
            }),
            cloud_configuration: config.cloud_configuration.clone(),
        }
    }
}

/// Parses a duration in the `72h3m0.5s` notation.
///
/// # Errors
///
/// Returns a description of the problem when the text is not a valid,
/// non-negative duration.
pub fn parse_duration(text: &str) -> std::result::Result<Duration, String> {
    if text.is_empty() {
        return Err("empty duration".to_string());
    }
    if text == "0" {
        return Ok(Duration::ZERO);
    }
    if text.starts_with('-') {
        return Err(format!("negative duration {text:?}"));
    }

    let mut total = 0f64;
    let mut rest = text.strip_prefix('+').unwrap_or(text);
    while !rest.is_empty() {
        let number_len = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| format!("missing unit in duration {text:?}"))?;
        if number_len == 0 {
            return Err(format!("invalid duration {text:?}"));
        }
        let value: f64 = rest[..number_len]
            .parse()
            .map_err(|_| format!("invalid number in duration {text:?}"))?;
        rest = &rest[number_len..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit() || c == '.')
            .unwrap_or(rest.len());
        let seconds = match &rest[..unit_len] {
            "h" => 3600.0,
            "m" => 60.0,
            "s" => 1.0,
            "ms" => 1e-3,
            "us" | "µs" => 1e-6,
            "ns" => 1e-9,
            unit => return Err(format!("unknown unit {unit:?} in duration {text:?}")),
        };
        total += value * seconds;
        rest = &rest[unit_len..];
    }

    Ok(Duration::from_secs_f64(total))
}

/// Formats a duration the way [`parse_duration`] reads it, e.g. `24h0m0s`.
#[must_use]
pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    let (hours, minutes, seconds) = (secs / 3600, secs % 3600 / 60, secs % 60);
    let nanos = duration.subsec_nanos();
    let seconds = if nanos == 0 {
        format!("{seconds}")
    } else {
        let fraction = format!("{nanos:09}");
        format!("{seconds}.{}", fraction.trim_end_matches('0'))
    };
    if hours > 0 {
        format!("{hours}h{minutes}m{seconds}s")
    } else if minutes > 0 {
        format!("{minutes}m{seconds}s")
    } else {
        format!("{seconds}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn durations_parse_compound_units() {
        assert_eq!(parse_duration("24h"), Ok(Duration::from_secs(86_400)));
        assert_eq!(parse_duration("1h30m"), Ok(Duration::from_secs(5_400)));
        assert_eq!(parse_duration("1.5s"), Ok(Duration::from_millis(1_500)));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("-1h").is_err());
        assert!(parse_duration("3d").is_err());
    }

    #[test]
    fn durations_format_like_they_parse() {
        assert_eq!(format_duration(Duration::from_secs(86_400)), "24h0m0s");
        assert_eq!(format_duration(Duration::from_secs(90)), "1m30s");
        assert_eq!(format_duration(Duration::from_millis(1_500)), "1.5s");
    }

    #[test]
    fn two_image_locations_are_rejected() {
        let image = Image {
            urn: Some("a:b:c:d".to_string()),
            id: Some("/subscriptions/s/images/i".to_string()),
            ..Default::default()
        };
        let err = image.reference("img").unwrap_err();
        assert!(err.to_string().contains("only one of"));
    }

    #[test]
    fn zoned_nat_ips_inherit_the_zone() {
        let wire = InfrastructureConfig {
            networks: NetworkConfig {
                zones: vec![Zone {
                    name: 2,
                    cidr: "10.0.0.0/24".to_string(),
                    nat_gateway: Some(ZonedNatGatewayConfig {
                        enabled: true,
                        idle_connection_timeout_minutes: None,
                        ip_addresses: vec![ZonedPublicIpReference {
                            name: "ip".to_string(),
                            resource_group: "rg".to_string(),
                        }],
                    }),
                    service_endpoints: vec![],
                }],
                ..Default::default()
            },
            ..Default::default()
        };

        let config = api::InfrastructureConfig::try_from(wire.clone()).unwrap();
        let ip = &config.networks.zones[0]
            .nat_gateway
            .as_ref()
            .unwrap()
            .ip_addresses[0];
        assert_eq!(ip.zone, Some(2));
        assert_eq!(InfrastructureConfig::from(&config), wire);
    }

    #[test]
    fn legacy_and_capability_flavors_split_on_the_wire() {
        let wire = MachineImageVersion {
            version: "1.0.0".to_string(),
            image: Image {
                urn: Some("p:o:s:1.0.0".to_string()),
                ..Default::default()
            },
            architecture: Some("arm64".to_string()),
            capability_flavors: vec![MachineImageFlavor {
                capabilities: [("architecture".to_string(), vec!["amd64".to_string()])].into(),
                image: Image {
                    id: Some("/images/x".to_string()),
                    ..Default::default()
                },
                skip_marketplace_agreement: None,
            }],
            ..Default::default()
        };

        let version = convert_version("ubuntu", wire).unwrap();
        assert_eq!(version.flavors.len(), 2);
        assert_eq!(version.flavors[0].architecture(), "arm64");
        assert_eq!(version.flavors[1].architecture(), "amd64");

        let entries = wire_versions(&version);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].image.urn.as_deref(), Some("p:o:s:1.0.0"));
        assert_eq!(entries[1].capability_flavors.len(), 1);
    }
}
