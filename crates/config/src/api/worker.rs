use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::{Deserialize, Serialize};

use super::{Capabilities, ImageReference};

/// Provider configuration of a worker pool.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WorkerConfig {
    pub node_template: Option<NodeTemplate>,
    pub diagnostics_profile: Option<DiagnosticsProfile>,
    pub data_volumes: Vec<DataVolume>,
    pub capacity_reservation: Option<CapacityReservation>,
    pub os_disk: Option<OsDisk>,
}

/// Capacity advertised for scale-from-zero.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeTemplate {
    pub capacity: BTreeMap<String, Quantity>,
    /// Informational extended resources. Never part of the pool hash.
    pub virtual_capacity: BTreeMap<String, Quantity>,
}

/// Boot diagnostics of the machines.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct DiagnosticsProfile {
    pub enabled: bool,
    #[serde(default, rename = "storageURI", skip_serializing_if = "Option::is_none")]
    pub storage_uri: Option<String>,
}

/// Image override of a data volume.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataVolume {
    pub name: String,
    pub image_ref: Option<ImageReference>,
}

/// Capacity reservation group the machines are placed into.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct CapacityReservation {
    #[serde(
        default,
        rename = "capacityReservationGroupID",
        skip_serializing_if = "Option::is_none"
    )]
    pub capacity_reservation_group_id: Option<String>,
}

/// OS disk settings.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct OsDisk {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub caching: Option<CachingType>,
}

/// Host caching mode of a managed disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum CachingType {
    #[default]
    None,
    ReadOnly,
    ReadWrite,
}

impl std::fmt::Display for CachingType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "None"),
            Self::ReadOnly => write!(f, "ReadOnly"),
            Self::ReadWrite => write!(f, "ReadWrite"),
        }
    }
}

/// Observed worker state.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkerStatus {
    /// Images used by the pools, pinned for later reconciles.
    pub machine_images: Vec<MachineImage>,
    pub vmo_dependencies: Vec<VmoDependency>,
}

impl WorkerStatus {
    /// Adds an image unless an equal entry exists.
    pub fn pin_image(&mut self, image: MachineImage) {
        if !self.machine_images.contains(&image) {
            self.machine_images.push(image);
        }
    }

    /// VMO dependency of a pool.
    #[must_use]
    pub fn vmo_dependency(&self, pool_name: &str) -> Option<&VmoDependency> {
        self.vmo_dependencies
            .iter()
            .find(|dependency| dependency.pool_name == pool_name)
    }
}

/// A resolved machine image as recorded in the worker status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineImage {
    pub name: String,
    pub version: String,
    pub reference: ImageReference,
    pub skip_marketplace_agreement: bool,
    pub accelerated_networking: bool,
    pub architecture: Option<String>,
    pub capabilities: Option<Capabilities>,
}

/// A VM orchestration group owned by a pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmoDependency {
    pub pool_name: String,
    pub id: String,
    pub name: String,
}
