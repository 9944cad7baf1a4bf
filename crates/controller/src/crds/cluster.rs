//! `Cluster` resource: snapshot of the shoot and its cloud profile.
//!
//! Only the fields the reconcilers read are typed; everything else is
//! ignored.

use std::collections::BTreeMap;

use azure_config::api::{
    Capabilities, CapabilityDefinition, CloudProfileConfig, MachineType as ProviderMachineType,
};
use azure_config::scheme::Decoder;
use azure_config::transform::canonicalize;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Shoot annotation requesting the move from availability sets to VMOs.
pub const VMO_MIGRATION_ANNOTATION: &str =
    "azure.provider.extensions.gardener.cloud/vmo-migration";

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "extensions.gardener.cloud", version = "v1alpha1", kind = "Cluster")]
#[serde(rename_all = "camelCase")]
pub struct ClusterSpec {
    #[serde(default)]
    pub cloud_profile: Value,
    #[serde(default)]
    pub seed: Value,
    #[serde(default)]
    pub shoot: Value,
}

/// Typed view of a [`Cluster`].
#[derive(Debug, Clone)]
pub struct ClusterView {
    pub shoot: Shoot,
    pub cloud_profile: CloudProfile,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Shoot {
    #[serde(default)]
    pub metadata: ShootMetadata,
    #[serde(default)]
    pub spec: ShootSpec,
    #[serde(default)]
    pub status: ShootStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShootMetadata {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    #[serde(default)]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShootSpec {
    #[serde(default)]
    pub kubernetes: ShootKubernetes,
    #[serde(default)]
    pub region: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ShootKubernetes {
    #[serde(default)]
    pub version: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ShootStatus {
    #[serde(default, rename = "technicalID")]
    pub technical_id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CloudProfile {
    #[serde(default)]
    pub spec: CloudProfileSpec,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CloudProfileSpec {
    #[serde(default)]
    pub provider_config: Option<Value>,
    #[serde(default)]
    pub machine_types: Vec<MachineTypeSpec>,
    #[serde(default)]
    pub machine_capabilities: Vec<CapabilityDefinition>,
    #[serde(default)]
    pub bastion: Option<BastionProfile>,
}

/// Machine type as offered by the cloud profile.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MachineTypeSpec {
    pub name: String,
    #[serde(default)]
    pub cpu: Quantity,
    #[serde(default)]
    pub gpu: Quantity,
    #[serde(default)]
    pub memory: Quantity,
    #[serde(default)]
    pub architecture: Option<String>,
    #[serde(default)]
    pub capabilities: Option<Capabilities>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BastionProfile {
    #[serde(default)]
    pub machine_image: Option<BastionImage>,
    #[serde(default)]
    pub machine_type: Option<BastionMachineType>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BastionImage {
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct BastionMachineType {
    pub name: String,
}

impl Cluster {
    /// Decodes the embedded shoot and cloud profile.
    pub fn view(&self) -> Result<ClusterView> {
        let shoot = if self.spec.shoot.is_null() {
            Shoot::default()
        } else {
            serde_json::from_value(self.spec.shoot.clone())?
        };
        let cloud_profile = if self.spec.cloud_profile.is_null() {
            CloudProfile::default()
        } else {
            serde_json::from_value(self.spec.cloud_profile.clone())?
        };
        Ok(ClusterView {
            shoot,
            cloud_profile,
        })
    }
}

impl ClusterView {
    /// Technical ID of the shoot; falls back to `namespace` for clusters
    /// that do not report one.
    #[must_use]
    pub fn technical_id<'a>(&'a self, namespace: &'a str) -> &'a str {
        if self.shoot.status.technical_id.is_empty() {
            namespace
        } else {
            &self.shoot.status.technical_id
        }
    }

    /// Provider section of the cloud profile in canonical form.
    pub fn provider_cloud_profile(&self) -> Result<CloudProfileConfig> {
        let config = match &self.cloud_profile.spec.provider_config {
            Some(raw) if !raw.is_null() => Decoder::lenient()
                .decode_value::<CloudProfileConfig>(raw.clone())
                .map_err(Error::Config)?,
            _ => CloudProfileConfig::default(),
        };
        Ok(canonicalize(&config, self.capability_definitions()))
    }

    #[must_use]
    pub fn capability_definitions(&self) -> &[CapabilityDefinition] {
        &self.cloud_profile.spec.machine_capabilities
    }

    #[must_use]
    pub fn machine_type(&self, name: &str) -> Option<&MachineTypeSpec> {
        self.cloud_profile
            .spec
            .machine_types
            .iter()
            .find(|machine_type| machine_type.name == name)
    }

    /// Returns `true` when the shoot asks to move to VM orchestration groups.
    #[must_use]
    pub fn vmo_migration_requested(&self) -> bool {
        self.shoot
            .metadata
            .annotations
            .get(VMO_MIGRATION_ANNOTATION)
            .is_some_and(|value| value == "true")
    }

    #[must_use]
    pub fn kubernetes_version(&self) -> &str {
        &self.shoot.spec.kubernetes.version
    }
}

/// Provider machine type entry with the given name.
#[must_use]
pub fn provider_machine_type<'a>(
    profile: &'a CloudProfileConfig,
    name: &str,
) -> Option<&'a ProviderMachineType> {
    profile
        .machine_types
        .iter()
        .find(|machine_type| machine_type.name == name)
}
