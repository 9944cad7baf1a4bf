//! Extension resources reconciled by this extension.
//!
//! Provider-specific payloads stay raw (`providerConfig`) and are decoded by
//! the reconcilers through the scheme.

use std::collections::BTreeMap;

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::common::{ExtensionStatus, SecretKeyReference, SecretReference};

/// Extension type handled by this extension.
pub const AZURE_TYPE: &str = "azure";

/// Extension type of DNS records in Azure DNS.
pub const AZURE_DNS_TYPE: &str = "azure-dns";

// ============================================================================
// Infrastructure
// ============================================================================

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "extensions.gardener.cloud", version = "v1alpha1", kind = "Infrastructure")]
#[kube(namespaced)]
#[kube(status = "ExtensionStatus")]
#[kube(printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#)]
#[kube(printcolumn = r#"{"name":"Region","type":"string","jsonPath":".spec.region"}"#)]
#[kube(printcolumn = r#"{"name":"Status","type":"string","jsonPath":".status.lastOperation.state"}"#)]
#[serde(rename_all = "camelCase")]
pub struct InfrastructureSpec {
    #[serde(rename = "type")]
    pub extension_type: String,
    pub region: String,
    pub secret_ref: SecretReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
}

// ============================================================================
// Worker
// ============================================================================

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "extensions.gardener.cloud", version = "v1alpha1", kind = "Worker")]
#[kube(namespaced)]
#[kube(status = "ExtensionStatus")]
#[kube(printcolumn = r#"{"name":"Type","type":"string","jsonPath":".spec.type"}"#)]
#[kube(printcolumn = r#"{"name":"Region","type":"string","jsonPath":".spec.region"}"#)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSpec {
    #[serde(rename = "type")]
    pub extension_type: String,
    pub region: String,
    pub secret_ref: SecretReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<Value>,
    /// Encoded `InfrastructureStatus` of the shoot.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_provider_status: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssh_public_key: Option<String>,
    #[serde(default)]
    pub pools: Vec<WorkerPool>,
}

/// A group of identically configured machines.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WorkerPool {
    pub name: String,
    pub machine_type: String,
    pub machine_image: MachineImageRef,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<Volume>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub data_volumes: Vec<DataVolume>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_data_secret_ref: Option<SecretKeyReference>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub zones: Vec<String>,
    pub minimum: i32,
    pub maximum: i32,
    #[serde(default = "IntOrPercent::one")]
    pub max_surge: IntOrPercent,
    #[serde(default = "IntOrPercent::zero")]
    pub max_unavailable: IntOrPercent,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_strategy: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub taints: Vec<Taint>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub architecture: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubernetes_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct MachineImageRef {
    pub name: String,
    pub version: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct Volume {
    /// Size as quantity, e.g. `50Gi`.
    pub size: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct DataVolume {
    pub name: String,
    pub size: String,
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub volume_type: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct Taint {
    pub key: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    pub effect: String,
}

/// Absolute number or percentage (`"25%"`).
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(untagged)]
pub enum IntOrPercent {
    Int(i32),
    Percent(String),
}

impl Default for IntOrPercent {
    fn default() -> Self {
        Self::Int(0)
    }
}

impl IntOrPercent {
    #[must_use]
    pub fn one() -> Self {
        Self::Int(1)
    }

    #[must_use]
    pub fn zero() -> Self {
        Self::Int(0)
    }
}

/// Update strategies of a worker pool.
pub const AUTO_ROLLING_UPDATE: &str = "AutoRollingUpdate";
pub const AUTO_IN_PLACE_UPDATE: &str = "AutoInPlaceUpdate";
pub const MANUAL_IN_PLACE_UPDATE: &str = "ManualInPlaceUpdate";

// ============================================================================
// Bastion
// ============================================================================

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "extensions.gardener.cloud", version = "v1alpha1", kind = "Bastion")]
#[kube(namespaced)]
#[kube(status = "BastionStatus")]
#[kube(printcolumn = r#"{"name":"IP","type":"string","jsonPath":".status.ingress.ip"}"#)]
#[serde(rename_all = "camelCase")]
pub struct BastionSpec {
    #[serde(rename = "type")]
    pub extension_type: String,
    /// Base64-encoded cloud-init payload.
    pub user_data: String,
    #[serde(default)]
    pub ingress: Vec<BastionIngressPolicy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BastionIngressPolicy {
    pub ip_block: IpBlock,
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq, JsonSchema)]
pub struct IpBlock {
    pub cidr: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct BastionStatus {
    #[serde(flatten)]
    pub common: ExtensionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingress: Option<LoadBalancerIngress>,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq, JsonSchema)]
pub struct LoadBalancerIngress {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

// ============================================================================
// Backups
// ============================================================================

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "extensions.gardener.cloud", version = "v1alpha1", kind = "BackupBucket")]
#[kube(status = "ExtensionStatus")]
#[serde(rename_all = "camelCase")]
pub struct BackupBucketSpec {
    #[serde(rename = "type")]
    pub extension_type: String,
    pub region: String,
    pub secret_ref: SecretReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<Value>,
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "extensions.gardener.cloud", version = "v1alpha1", kind = "BackupEntry")]
#[kube(status = "ExtensionStatus")]
#[serde(rename_all = "camelCase")]
pub struct BackupEntrySpec {
    #[serde(rename = "type")]
    pub extension_type: String,
    pub region: String,
    pub secret_ref: SecretReference,
    pub bucket_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<Value>,
}

// ============================================================================
// DNS records
// ============================================================================

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(
    group = "extensions.gardener.cloud",
    version = "v1alpha1",
    kind = "DNSRecord",
    root = "DnsRecord"
)]
#[kube(namespaced)]
#[kube(status = "DnsRecordStatus")]
#[kube(printcolumn = r#"{"name":"FQDN","type":"string","jsonPath":".spec.name"}"#)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecordSpec {
    #[serde(rename = "type")]
    pub extension_type: String,
    pub secret_ref: SecretReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    /// Hosted zone as `<resourceGroup>/<zone>`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
    /// Fully qualified record name.
    pub name: String,
    pub record_type: RecordType,
    pub values: Vec<String>,
    #[serde(default, rename = "ttl", skip_serializing_if = "Option::is_none")]
    pub ttl: Option<i64>,
}

#[derive(Deserialize, Serialize, Clone, Copy, Debug, PartialEq, Eq, JsonSchema)]
pub enum RecordType {
    A,
    #[serde(rename = "AAAA")]
    Aaaa,
    #[serde(rename = "CNAME")]
    Cname,
    #[serde(rename = "TXT")]
    Txt,
}

impl RecordType {
    /// Record set type segment of the ARM ID.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::A => "A",
            Self::Aaaa => "AAAA",
            Self::Cname => "CNAME",
            Self::Txt => "TXT",
        }
    }
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DnsRecordStatus {
    #[serde(flatten)]
    pub common: ExtensionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zone: Option<String>,
}

// ============================================================================
// Control plane
// ============================================================================

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema)]
#[kube(group = "extensions.gardener.cloud", version = "v1alpha1", kind = "ControlPlane")]
#[kube(namespaced)]
#[kube(status = "ExtensionStatus")]
#[serde(rename_all = "camelCase")]
pub struct ControlPlaneSpec {
    #[serde(rename = "type")]
    pub extension_type: String,
    pub region: String,
    pub secret_ref: SecretReference,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_config: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub infrastructure_provider_status: Option<Value>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn worker_pool_defaults() {
        let pool: WorkerPool = serde_json::from_value(json!({
            "name": "cpu",
            "machineType": "Standard_D4s_v5",
            "machineImage": {"name": "gardenlinux", "version": "1592.1.0"},
            "minimum": 1,
            "maximum": 3,
            "maxUnavailable": "25%"
        }))
        .unwrap();
        assert_eq!(pool.max_surge, IntOrPercent::Int(1));
        assert_eq!(pool.max_unavailable, IntOrPercent::Percent("25%".to_string()));
        assert!(pool.zones.is_empty());
    }

    #[test]
    fn dns_record_types_use_wire_names() {
        let spec: DnsRecordSpec = serde_json::from_value(json!({
            "type": "azure-dns",
            "secretRef": {"name": "dns"},
            "zone": "rg/example.com",
            "name": "api.example.com",
            "recordType": "AAAA",
            "values": ["2001:db8::1"]
        }))
        .unwrap();
        assert_eq!(spec.record_type, RecordType::Aaaa);
        assert_eq!(spec.record_type.as_str(), "AAAA");
    }
}
