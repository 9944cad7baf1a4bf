use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::ARCHITECTURE_AMD64;

/// Multi-valued attributes declared by machine types and images,
/// e.g. `architecture=[amd64]`, `network=[basic, accelerated]`.
pub type Capabilities = BTreeMap<String, Vec<String>>;

/// A capability declared by the cloud profile with its allowed values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapabilityDefinition {
    pub name: String,
    pub values: Vec<String>,
}

/// Provider section of the cloud profile.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CloudProfileConfig {
    pub count_update_domains: Vec<DomainCount>,
    pub count_fault_domains: Vec<DomainCount>,
    pub machine_images: Vec<MachineImages>,
    pub machine_types: Vec<MachineType>,
    pub cloud_configuration: Option<super::CloudConfiguration>,
}

/// Fault or update domain count of a region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainCount {
    pub region: String,
    pub count: i32,
}

/// All versions of a named machine image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineImages {
    pub name: String,
    pub versions: Vec<MachineImageVersion>,
}

/// One version of a machine image with its flavors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineImageVersion {
    pub version: String,
    pub flavors: Vec<ImageFlavor>,
}

/// A concrete bootable variant of an image version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageFlavor {
    pub reference: ImageReference,
    pub skip_marketplace_agreement: bool,
    pub kind: FlavorKind,
}

impl ImageFlavor {
    /// Architecture of the flavor, defaulting to `amd64`.
    #[must_use]
    pub fn architecture(&self) -> &str {
        match &self.kind {
            FlavorKind::Legacy { architecture, .. } => {
                architecture.as_deref().unwrap_or(ARCHITECTURE_AMD64)
            }
            FlavorKind::Capability(capabilities) => capabilities
                .get(crate::CAPABILITY_ARCHITECTURE)
                .and_then(|values| values.first())
                .map_or(ARCHITECTURE_AMD64, String::as_str),
        }
    }

    /// Returns `true` when the flavor supports accelerated networking.
    #[must_use]
    pub fn accelerated_networking(&self) -> bool {
        match &self.kind {
            FlavorKind::Legacy {
                accelerated_networking,
                ..
            } => *accelerated_networking,
            FlavorKind::Capability(capabilities) => capabilities
                .get(crate::CAPABILITY_NETWORK)
                .is_some_and(|values| values.iter().any(|v| v == crate::NETWORK_ACCELERATED)),
        }
    }
}

/// How a flavor describes what it supports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlavorKind {
    /// Scalar architecture and accelerated-networking flag.
    Legacy {
        architecture: Option<String>,
        accelerated_networking: bool,
    },
    /// Capability map.
    Capability(Capabilities),
}

/// Where the cloud finds the image. The forms are mutually exclusive.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ImageReference {
    /// Marketplace `publisher:offer:sku:version`.
    Urn(String),
    /// Resource ID of a managed image.
    Id(String),
    /// Community gallery image ID.
    CommunityGallery(String),
    /// Shared gallery image ID.
    SharedGallery(String),
}

impl std::fmt::Display for ImageReference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Urn(urn) => write!(f, "urn:{urn}"),
            Self::Id(id) => write!(f, "id:{id}"),
            Self::CommunityGallery(id) => write!(f, "communityGallery:{id}"),
            Self::SharedGallery(id) => write!(f, "sharedGallery:{id}"),
        }
    }
}

/// Provider-specific machine type attributes (legacy format).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineType {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accelerated_networking: Option<bool>,
}
