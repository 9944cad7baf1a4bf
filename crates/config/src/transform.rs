//! Translation of cloud profile images between the legacy format and the
//! capability format.
//!
//! Which one is canonical depends on whether the cloud profile declares
//! capability definitions. Both directions are idempotent.

use crate::api::{
    Capabilities, CapabilityDefinition, CloudProfileConfig, FlavorKind, ImageFlavor,
    MachineImageVersion, MachineImages,
};
use crate::{
    ARCHITECTURE_AMD64, CAPABILITY_ARCHITECTURE, CAPABILITY_NETWORK, NETWORK_ACCELERATED,
    NETWORK_BASIC,
};

/// Brings the images of `config` into the canonical format for `definitions`.
#[must_use]
pub fn canonicalize(
    config: &CloudProfileConfig,
    definitions: &[CapabilityDefinition],
) -> CloudProfileConfig {
    let machine_images = config
        .machine_images
        .iter()
        .map(|images| {
            if definitions.is_empty() {
                to_legacy(images)
            } else {
                to_capabilities(images)
            }
        })
        .collect();

    CloudProfileConfig {
        machine_images,
        ..config.clone()
    }
}

/// Expands every flavor into its own legacy version entry.
#[must_use]
pub fn to_legacy(images: &MachineImages) -> MachineImages {
    let versions = images
        .versions
        .iter()
        .flat_map(|version| {
            version.flavors.iter().map(|flavor| MachineImageVersion {
                version: version.version.clone(),
                flavors: vec![ImageFlavor {
                    reference: flavor.reference.clone(),
                    skip_marketplace_agreement: flavor.skip_marketplace_agreement,
                    kind: FlavorKind::Legacy {
                        architecture: legacy_architecture(flavor),
                        accelerated_networking: flavor.accelerated_networking(),
                    },
                }],
            })
        })
        .collect();

    MachineImages {
        name: images.name.clone(),
        versions,
    }
}

fn legacy_architecture(flavor: &ImageFlavor) -> Option<String> {
    match &flavor.kind {
        FlavorKind::Legacy { architecture, .. } => architecture.clone(),
        FlavorKind::Capability(_) => Some(flavor.architecture().to_string()),
    }
}

/// Lifts legacy flavors to capability flavors and merges entries that share
/// a version string.
#[must_use]
pub fn to_capabilities(images: &MachineImages) -> MachineImages {
    let mut versions: Vec<MachineImageVersion> = Vec::new();

    for version in &images.versions {
        let flavors = version.flavors.iter().map(|flavor| ImageFlavor {
            reference: flavor.reference.clone(),
            skip_marketplace_agreement: flavor.skip_marketplace_agreement,
            kind: FlavorKind::Capability(flavor_capabilities(flavor)),
        });

        match versions.iter_mut().find(|v| v.version == version.version) {
            Some(existing) => existing.flavors.extend(flavors),
            None => versions.push(MachineImageVersion {
                version: version.version.clone(),
                flavors: flavors.collect(),
            }),
        }
    }

    MachineImages {
        name: images.name.clone(),
        versions,
    }
}

fn flavor_capabilities(flavor: &ImageFlavor) -> Capabilities {
    match &flavor.kind {
        FlavorKind::Capability(capabilities) => capabilities.clone(),
        FlavorKind::Legacy {
            architecture,
            accelerated_networking,
        } => legacy_capabilities(architecture.as_deref(), *accelerated_networking),
    }
}

/// Capability map equivalent to the legacy architecture and
/// accelerated-networking fields.
#[must_use]
pub fn legacy_capabilities(
    architecture: Option<&str>,
    accelerated_networking: bool,
) -> Capabilities {
    let mut network = vec![NETWORK_BASIC.to_string()];
    if accelerated_networking {
        network.push(NETWORK_ACCELERATED.to_string());
    }
    Capabilities::from([
        (
            CAPABILITY_ARCHITECTURE.to_string(),
            vec![architecture.unwrap_or(ARCHITECTURE_AMD64).to_string()],
        ),
        (CAPABILITY_NETWORK.to_string(), network),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::ImageReference;
    use pretty_assertions::assert_eq;

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

    fn legacy_profile() -> CloudProfileConfig {
        let legacy = |urn: &str, architecture: Option<&str>, accelerated| ImageFlavor {
            reference: ImageReference::Urn(urn.to_string()),
            skip_marketplace_agreement: false,
            kind: FlavorKind::Legacy {
                architecture: architecture.map(str::to_string),
                accelerated_networking: accelerated,
            },
        };
        CloudProfileConfig {
            machine_images: vec![MachineImages {
                name: "gardenlinux".to_string(),
                versions: vec![
                    MachineImageVersion {
                        version: "1.0.0".to_string(),
                        flavors: vec![legacy("p:o:amd:1.0.0", None, true)],
                    },
                    MachineImageVersion {
                        version: "1.0.0".to_string(),
                        flavors: vec![legacy("p:o:arm:1.0.0", Some("arm64"), false)],
                    },
                ],
            }],
            ..Default::default()
        }
    }

    #[test]
    fn legacy_versions_are_lifted_and_merged() {
        let profile = canonicalize(&legacy_profile(), &definitions());
        let versions = &profile.machine_images[0].versions;
        assert_eq!(versions.len(), 1);
        assert_eq!(versions[0].flavors.len(), 2);

        let FlavorKind::Capability(first) = &versions[0].flavors[0].kind else {
            panic!("expected capability flavor");
        };
        assert_eq!(first["architecture"], vec!["amd64"]);
        assert_eq!(first["network"], vec!["basic", "accelerated"]);
        assert_eq!(versions[0].flavors[1].architecture(), "arm64");
        assert!(!versions[0].flavors[1].accelerated_networking());
    }

    #[test]
    fn capability_flavors_flatten_to_legacy_entries() {
        let lifted = canonicalize(&legacy_profile(), &definitions());
        let flattened = canonicalize(&lifted, &[]);
        let versions = &flattened.machine_images[0].versions;
        assert_eq!(versions.len(), 2);
        assert_eq!(
            versions[0].flavors[0].kind,
            FlavorKind::Legacy {
                architecture: Some("amd64".to_string()),
                accelerated_networking: true,
            }
        );
        assert_eq!(versions[1].flavors[0].architecture(), "arm64");
    }

    #[test]
    fn transform_is_idempotent() {
        let lifted = canonicalize(&legacy_profile(), &definitions());
        assert_eq!(canonicalize(&lifted, &definitions()), lifted);

        let legacy = canonicalize(&legacy_profile(), &[]);
        assert_eq!(canonicalize(&legacy, &[]), legacy);
    }
}
