//! Lookups over decoded provider configuration.

use crate::api::{
    AvailabilitySet, Capabilities, CapabilityDefinition, CloudProfileConfig, DomainCount,
    MachineImage, MachineType, Purpose, RouteTable, SecurityGroup, Subnet,
};
use crate::transform::legacy_capabilities;
use crate::{Error, Result, ARCHITECTURE_AMD64, CAPABILITY_ARCHITECTURE};

/// Finds the first subnet with `purpose`. With `zone` given, the subnet's
/// zone must match as well.
///
/// # Errors
///
/// Returns [`Error::NotFound`] when no subnet matches.
pub fn find_subnet_by_purpose_and_zone<'a>(
    subnets: &'a [Subnet],
    purpose: Purpose,
    zone: Option<&str>,
) -> Result<(usize, &'a Subnet)> {
    subnets
        .iter()
        .enumerate()
        .find(|(_, subnet)| {
            subnet.purpose == purpose && zone.is_none_or(|zone| subnet.zone.as_deref() == Some(zone))
        })
        .ok_or_else(|| match zone {
            Some(zone) => Error::NotFound(format!(
                "cannot find subnet with purpose {purpose:?} and zone {zone:?}"
            )),
            None => Error::NotFound(format!("cannot find subnet with purpose {purpose:?}")),
        })
}

/// Finds the first security group with `purpose`.
///
/// # Errors
///
/// Returns [`Error::NotFound`] when no security group matches.
pub fn find_security_group_by_purpose(
    groups: &[SecurityGroup],
    purpose: Purpose,
) -> Result<&SecurityGroup> {
    groups
        .iter()
        .find(|group| group.purpose == purpose)
        .ok_or_else(|| {
            Error::NotFound(format!("cannot find security group with purpose {purpose:?}"))
        })
}

/// Finds the first route table with `purpose`.
///
/// # Errors
///
/// Returns [`Error::NotFound`] when no route table matches.
pub fn find_route_table_by_purpose(tables: &[RouteTable], purpose: Purpose) -> Result<&RouteTable> {
    tables
        .iter()
        .find(|table| table.purpose == purpose)
        .ok_or_else(|| Error::NotFound(format!("cannot find route table with purpose {purpose:?}")))
}

/// Finds the first availability set with `purpose`.
///
/// # Errors
///
/// Returns [`Error::NotFound`] when no availability set matches.
pub fn find_availability_set_by_purpose(
    sets: &[AvailabilitySet],
    purpose: Purpose,
) -> Result<&AvailabilitySet> {
    sets.iter().find(|set| set.purpose == purpose).ok_or_else(|| {
        Error::NotFound(format!(
            "cannot find availability set with purpose {purpose:?}"
        ))
    })
}

/// Fault or update domain count configured for `region`.
///
/// # Errors
///
/// Returns [`Error::NotFound`] when the region has no entry.
pub fn find_domain_count_by_region(counts: &[DomainCount], region: &str) -> Result<i32> {
    counts
        .iter()
        .find(|count| count.region == region)
        .map(|count| count.count)
        .ok_or_else(|| Error::NotFound(format!("could not find a domain count for region {region}")))
}

/// Applies capability defaults: every definition missing from `capabilities`
/// takes the definition's full value list.
#[must_use]
pub fn default_capabilities(
    capabilities: &Capabilities,
    definitions: &[CapabilityDefinition],
) -> Capabilities {
    let mut defaulted = capabilities.clone();
    for definition in definitions {
        defaulted
            .entry(definition.name.clone())
            .or_insert_with(|| definition.values.clone());
    }
    defaulted
}

/// Returns `true` when a flavor offering `flavor` supports a machine
/// requiring `machine`. Both are defaulted first; every required value must
/// be offered.
#[must_use]
pub fn capabilities_compatible(
    machine: &Capabilities,
    flavor: &Capabilities,
    definitions: &[CapabilityDefinition],
) -> bool {
    let machine = default_capabilities(machine, definitions);
    let flavor = default_capabilities(flavor, definitions);
    definitions.iter().all(|definition| {
        let offered = flavor.get(&definition.name);
        machine
            .get(&definition.name)
            .into_iter()
            .flatten()
            .all(|value| offered.is_some_and(|offered| offered.contains(value)))
    })
}

/// Capabilities of a machine type.
///
/// Declared capabilities win. Without them, the legacy accelerated-networking
/// flag of the provider machine type is translated.
#[must_use]
pub fn machine_type_capabilities(
    declared: Option<&Capabilities>,
    provider: Option<&MachineType>,
) -> Capabilities {
    match declared {
        Some(declared) if !declared.is_empty() => declared.clone(),
        _ => {
            let accelerated = provider
                .and_then(|machine_type| machine_type.accelerated_networking)
                .unwrap_or_default();
            let mut capabilities = legacy_capabilities(None, accelerated);
            // The pool decides the architecture.
            capabilities.remove(CAPABILITY_ARCHITECTURE);
            capabilities
        }
    }
}

/// Replaces the architecture values of `capabilities` with the pool's
/// architecture (default `amd64`).
#[must_use]
pub fn with_architecture(capabilities: &Capabilities, architecture: Option<&str>) -> Capabilities {
    let mut capabilities = capabilities.clone();
    capabilities.insert(
        CAPABILITY_ARCHITECTURE.to_string(),
        vec![architecture.unwrap_or(ARCHITECTURE_AMD64).to_string()],
    );
    capabilities
}

/// Selects the image flavor for a pool from the cloud profile.
///
/// Without capability definitions the flavor must match the version and the
/// architecture (absent architecture is `amd64`). With definitions, every
/// compatible flavor is scored by how many capabilities it declares
/// explicitly; the best score wins and ties go to the earlier flavor.
///
/// # Errors
///
/// Returns [`Error::NotFound`] when no flavor qualifies.
pub fn find_image_in_cloud_profile(
    profile: &CloudProfileConfig,
    name: &str,
    version: &str,
    architecture: Option<&str>,
    machine_capabilities: &Capabilities,
    definitions: &[CapabilityDefinition],
) -> Result<MachineImage> {
    let architecture = architecture.unwrap_or(ARCHITECTURE_AMD64);
    let flavors = profile
        .machine_images
        .iter()
        .filter(|images| images.name == name)
        .flat_map(|images| &images.versions)
        .filter(|v| v.version == version)
        .flat_map(|v| &v.flavors);

    let selected = if definitions.is_empty() {
        flavors
            .into_iter()
            .find(|flavor| flavor.architecture() == architecture)
            .map(|flavor| (flavor, None))
    } else {
        let required = with_architecture(machine_capabilities, Some(architecture));
        let mut best = None;
        for flavor in flavors {
            let declared = match &flavor.kind {
                crate::api::FlavorKind::Capability(capabilities) => capabilities.clone(),
                crate::api::FlavorKind::Legacy {
                    architecture,
                    accelerated_networking,
                } => legacy_capabilities(architecture.as_deref(), *accelerated_networking),
            };
            if !capabilities_compatible(&required, &declared, definitions) {
                continue;
            }
            let score = declared.len();
            if best.as_ref().is_none_or(|(_, best_score, _)| score > *best_score) {
                best = Some((flavor, score, declared));
            }
        }
        best.map(|(flavor, _, declared)| (flavor, Some(declared)))
    };

    let (flavor, capabilities) = selected.ok_or_else(|| {
        Error::NotFound(format!(
            "could not find image {name:?} in version {version:?} for architecture {architecture:?} in cloud profile"
        ))
    })?;

    Ok(MachineImage {
        name: name.to_string(),
        version: version.to_string(),
        reference: flavor.reference.clone(),
        skip_marketplace_agreement: flavor.skip_marketplace_agreement,
        accelerated_networking: flavor.accelerated_networking(),
        architecture: Some(flavor.architecture().to_string()),
        capabilities,
    })
}

/// Looks up an image pinned in the worker status by a prior reconcile.
///
/// # Errors
///
/// Returns [`Error::NotFound`] when no pinned image matches.
pub fn find_image_in_worker_status<'a>(
    images: &'a [MachineImage],
    name: &str,
    version: &str,
    architecture: Option<&str>,
    machine_capabilities: &Capabilities,
    definitions: &[CapabilityDefinition],
) -> Result<&'a MachineImage> {
    let architecture = architecture.unwrap_or(ARCHITECTURE_AMD64);
    let required = with_architecture(machine_capabilities, Some(architecture));

    images
        .iter()
        .filter(|image| image.name == name && image.version == version)
        .find(|image| match (&image.capabilities, definitions.is_empty()) {
            (Some(capabilities), false) => {
                capabilities_compatible(&required, capabilities, definitions)
            }
            _ => image.architecture.as_deref().unwrap_or(ARCHITECTURE_AMD64) == architecture,
        })
        .ok_or_else(|| {
            Error::NotFound(format!(
                "could not find image {name:?} in version {version:?} for architecture {architecture:?} in worker status"
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::{FlavorKind, ImageFlavor, ImageReference, MachineImageVersion, MachineImages};
    use pretty_assertions::assert_eq;

    fn caps(entries: &[(&str, &[&str])]) -> Capabilities {
        entries
            .iter()
            .map(|(name, values)| {
                (
                    (*name).to_string(),
                    values.iter().map(|v| (*v).to_string()).collect(),
                )
            })
            .collect()
    }

    fn definitions() -> Vec<CapabilityDefinition> {
        vec![
            CapabilityDefinition {
                name: "architecture".to_string(),
                values: vec!["amd64".to_string(), "arm64".to_string()],
            },
            CapabilityDefinition {
                name: "network".to_string(),
                values: vec!["basic".to_string(), "accelerated".to_string()],
            },
        ]
    }

    fn flavor(urn: &str, capabilities: Capabilities) -> ImageFlavor {
        ImageFlavor {
            reference: ImageReference::Urn(urn.to_string()),
            skip_marketplace_agreement: false,
            kind: FlavorKind::Capability(capabilities),
        }
    }

    fn profile(flavors: Vec<ImageFlavor>) -> CloudProfileConfig {
        CloudProfileConfig {
            machine_images: vec![MachineImages {
                name: "ubuntu".to_string(),
                versions: vec![MachineImageVersion {
                    version: "22.04".to_string(),
                    flavors,
                }],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn domain_count_requires_region() {
        let counts = vec![DomainCount {
            region: "bar".to_string(),
            count: 1,
        }];
        assert!(find_domain_count_by_region(&counts, "foo")
            .unwrap_err()
            .is_not_found());
        assert_eq!(find_domain_count_by_region(&counts, "bar").unwrap(), 1);
    }

    #[test]
    fn subnet_lookup_honours_zone() {
        let subnets = vec![
            Subnet {
                name: "a".to_string(),
                purpose: Purpose::Nodes,
                zone: Some("1".to_string()),
                migrated: false,
            },
            Subnet {
                name: "b".to_string(),
                purpose: Purpose::Nodes,
                zone: Some("2".to_string()),
                migrated: false,
            },
        ];
        let (index, subnet) =
            find_subnet_by_purpose_and_zone(&subnets, Purpose::Nodes, Some("2")).unwrap();
        assert_eq!((index, subnet.name.as_str()), (1, "b"));

        let (index, _) = find_subnet_by_purpose_and_zone(&subnets, Purpose::Nodes, None).unwrap();
        assert_eq!(index, 0);

        assert!(find_subnet_by_purpose_and_zone(&subnets, Purpose::Internal, None).is_err());
        assert!(find_subnet_by_purpose_and_zone(&subnets, Purpose::Nodes, Some("3")).is_err());
    }

    #[test]
    fn basic_network_machine_never_selects_accelerated_only_flavor() {
        let profile = profile(vec![
            flavor("p:o:accel:1", caps(&[("network", &["accelerated"])])),
            flavor("p:o:basic:1", caps(&[("network", &["basic"])])),
        ]);
        let machine = caps(&[("network", &["basic"])]);

        let image = find_image_in_cloud_profile(
            &profile,
            "ubuntu",
            "22.04",
            None,
            &machine,
            &definitions(),
        )
        .unwrap();
        assert_eq!(image.reference, ImageReference::Urn("p:o:basic:1".to_string()));
    }

    #[test]
    fn most_specific_compatible_flavor_wins() {
        let profile = profile(vec![
            flavor("p:o:generic:1", Capabilities::new()),
            flavor(
                "p:o:specific:1",
                caps(&[("architecture", &["arm64"]), ("network", &["basic", "accelerated"])]),
            ),
            flavor("p:o:amd:1", caps(&[("architecture", &["amd64"])])),
        ]);
        let machine = caps(&[("network", &["basic", "accelerated"])]);
        let definitions = definitions();

        let amd = find_image_in_cloud_profile(&profile, "ubuntu", "22.04", None, &machine, &definitions)
            .unwrap();
        assert_eq!(amd.reference, ImageReference::Urn("p:o:amd:1".to_string()));

        let arm = find_image_in_cloud_profile(
            &profile,
            "ubuntu",
            "22.04",
            Some("arm64"),
            &machine,
            &definitions,
        )
        .unwrap();
        assert_eq!(arm.reference, ImageReference::Urn("p:o:specific:1".to_string()));
        assert!(arm.accelerated_networking);
    }

    #[test]
    fn legacy_lookup_matches_architecture() {
        let legacy = |urn: &str, architecture: Option<&str>| ImageFlavor {
            reference: ImageReference::Urn(urn.to_string()),
            skip_marketplace_agreement: false,
            kind: FlavorKind::Legacy {
                architecture: architecture.map(str::to_string),
                accelerated_networking: false,
            },
        };
        let profile = profile(vec![legacy("p:o:amd:1", None), legacy("p:o:arm:1", Some("arm64"))]);
        let none = Capabilities::new();

        let image = find_image_in_cloud_profile(&profile, "ubuntu", "22.04", None, &none, &[]).unwrap();
        assert_eq!(image.reference, ImageReference::Urn("p:o:amd:1".to_string()));
        assert!(image.capabilities.is_none());

        let image =
            find_image_in_cloud_profile(&profile, "ubuntu", "22.04", Some("arm64"), &none, &[])
                .unwrap();
        assert_eq!(image.reference, ImageReference::Urn("p:o:arm:1".to_string()));

        let err = find_image_in_cloud_profile(&profile, "ubuntu", "24.04", None, &none, &[])
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn pinned_image_is_found_in_worker_status() {
        let images = vec![MachineImage {
            name: "ubuntu".to_string(),
            version: "22.04".to_string(),
            reference: ImageReference::Id("/images/x".to_string()),
            skip_marketplace_agreement: false,
            accelerated_networking: false,
            architecture: Some("arm64".to_string()),
            capabilities: None,
        }];
        let none = Capabilities::new();
        assert!(find_image_in_worker_status(&images, "ubuntu", "22.04", Some("arm64"), &none, &[]).is_ok());
        assert!(find_image_in_worker_status(&images, "ubuntu", "22.04", None, &none, &[]).is_err());
    }

    #[test]
    fn legacy_machine_type_flag_translates_to_network_capability() {
        let machine_type = MachineType {
            name: "Standard_D4s_v5".to_string(),
            accelerated_networking: Some(true),
        };
        let capabilities = machine_type_capabilities(None, Some(&machine_type));
        assert_eq!(capabilities, caps(&[("network", &["basic", "accelerated"])]));
    }
}
