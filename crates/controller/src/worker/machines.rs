//! Machine classes and deployments of the worker pools.

use std::collections::BTreeMap;

use azure_cloud::resources::Tags;
use azure_cloud::tags::{sanitize_tag, technical_id_tags};
use azure_config::api::{
    CachingType, ImageReference, MachineImage, NetworkLayout, Purpose, Subnet, WorkerConfig,
    WorkerStatus,
};
use azure_config::helper::{
    find_availability_set_by_purpose, find_image_in_cloud_profile, find_image_in_worker_status,
    find_subnet_by_purpose_and_zone, machine_type_capabilities,
};
use azure_config::scheme::Decoder;
use azure_config::{ARCHITECTURE_AMD64, CAPABILITY_NETWORK, NETWORK_ACCELERATED};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use serde::Serialize;
use tracing::debug;

use super::hash::{pool_hash, HashInputs};
use super::zones::{distribute_over_zones, distribute_positive};
use super::WorkerRequest;
use crate::crds::cluster::provider_machine_type;
use crate::crds::{IntOrPercent, SecretReference, Taint, WorkerPool, AUTO_ROLLING_UPDATE};
use crate::error::{Error, Result};

/// Machine types that run as confidential VMs.
const CONFIDENTIAL_PREFIXES: [&str; 2] = ["Standard_DC", "Standard_EC"];

const ADMIN_USERNAME: &str = "core";
const CORE_RESOURCES: [&str; 3] = ["cpu", "gpu", "memory"];

/// Everything the machine controller needs for one worker.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MachinePlan {
    pub classes: Vec<MachineClass>,
    pub deployments: Vec<MachineDeployment>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MachineClass {
    pub name: String,
    pub provider_spec: ProviderSpec,
    pub node_template: NodeTemplateSpec,
    pub credentials_secret_ref: SecretReference,
    /// Secret holding the user data of the machines.
    #[serde(rename = "secretRef", skip_serializing_if = "Option::is_none")]
    pub user_data_secret_ref: Option<SecretReference>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MachineDeployment {
    pub name: String,
    pub pool_name: String,
    pub class_name: String,
    pub zone: Option<String>,
    pub minimum: i32,
    pub maximum: i32,
    pub max_surge: IntOrPercent,
    pub max_unavailable: IntOrPercent,
    pub update_strategy: String,
    pub priority: Option<i32>,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub taints: Vec<Taint>,
}

/// Provider section of a machine class.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSpec {
    pub location: String,
    pub resource_group: String,
    pub tags: Tags,
    pub properties: VmProperties,
    pub subnet_info: SubnetInfo,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubnetInfo {
    pub vnet_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vnet_resource_group: Option<String>,
    pub subnet_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VmProperties {
    pub hardware_profile: HardwareProfile,
    pub storage_profile: StorageProfile,
    pub os_profile: OsProfile,
    pub network_profile: NetworkProfile,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zone: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub availability_set: Option<IdReference>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_set: Option<MachineSet>,
    #[serde(rename = "identityID", skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diagnostics_profile: Option<azure_config::api::DiagnosticsProfile>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capacity_reservation: Option<azure_config::api::CapacityReservation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_profile: Option<SecurityProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HardwareProfile {
    pub vm_size: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageProfile {
    pub image_reference: ImageRef,
    pub os_disk: OsDisk,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub data_disks: Vec<DataDisk>,
}

/// Image in the form understood by the machine controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImageRef {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub urn: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "communityGalleryImageID", skip_serializing_if = "Option::is_none")]
    pub community_gallery_image_id: Option<String>,
    #[serde(rename = "sharedGalleryImageID", skip_serializing_if = "Option::is_none")]
    pub shared_gallery_image_id: Option<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skip_marketplace_agreement: bool,
}

impl From<&ImageReference> for ImageRef {
    fn from(reference: &ImageReference) -> Self {
        let mut image = Self::default();
        match reference {
            ImageReference::Urn(urn) => image.urn = Some(urn.clone()),
            ImageReference::Id(id) => image.id = Some(id.clone()),
            ImageReference::CommunityGallery(id) => image.community_gallery_image_id = Some(id.clone()),
            ImageReference::SharedGallery(id) => image.shared_gallery_image_id = Some(id.clone()),
        }
        image
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OsDisk {
    pub caching: String,
    #[serde(rename = "diskSizeGB", skip_serializing_if = "Option::is_none")]
    pub disk_size_gb: Option<i32>,
    pub create_option: String,
    pub managed_disk: ManagedDisk,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ManagedDisk {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_account_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub security_profile: Option<DiskSecurityProfile>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiskSecurityProfile {
    pub security_encryption_type: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DataDisk {
    pub name: String,
    pub lun: i32,
    pub caching: String,
    #[serde(rename = "diskSizeGB")]
    pub disk_size_gb: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub storage_account_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_ref: Option<ImageRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OsProfile {
    pub admin_username: String,
    pub linux_configuration: LinuxConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinuxConfiguration {
    pub disable_password_authentication: bool,
    pub ssh: SshConfiguration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SshConfiguration {
    pub public_keys: SshPublicKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SshPublicKey {
    pub path: String,
    pub key_data: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkProfile {
    pub accelerated_networking: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdReference {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MachineSet {
    pub id: String,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecurityProfile {
    pub security_type: String,
    pub uefi_settings: UefiSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UefiSettings {
    pub secure_boot_enabled: bool,
    #[serde(rename = "vTpmEnabled")]
    pub v_tpm_enabled: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeTemplateSpec {
    pub capacity: BTreeMap<String, Quantity>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub virtual_capacity: BTreeMap<String, Quantity>,
    pub instance_type: String,
    pub region: String,
    pub zone: String,
    pub architecture: String,
}

/// Returns `true` for machine types that run as confidential VMs.
#[must_use]
pub fn is_confidential(machine_type: &str) -> bool {
    CONFIDENTIAL_PREFIXES
        .iter()
        .any(|prefix| machine_type.starts_with(prefix))
}

/// Parses a volume size such as `50Gi` into whole GiB.
pub fn parse_size_gib(size: &str) -> Result<i32> {
    let number = size
        .strip_suffix("Gi")
        .or_else(|| size.strip_suffix('G'))
        .unwrap_or(size);
    number
        .trim()
        .parse::<i32>()
        .map_err(|_| Error::Validation(format!("invalid volume size {size:?}")))
}

/// Decodes the provider configuration of a pool.
pub fn worker_config(pool: &WorkerPool) -> Result<WorkerConfig> {
    match &pool.provider_config {
        Some(raw) if !raw.is_null() => Ok(Decoder::strict().decode_value(raw.clone())?),
        _ => Ok(WorkerConfig::default()),
    }
}

/// Selects the image of a pool from the cloud profile, falling back to the
/// images pinned in the worker status.
fn select_image(
    request: &WorkerRequest<'_>,
    pool: &WorkerPool,
    status: &WorkerStatus,
) -> Result<MachineImage> {
    let definitions = request.cluster.capability_definitions();
    let declared = request
        .cluster
        .machine_type(&pool.machine_type)
        .and_then(|machine_type| machine_type.capabilities.as_ref());
    let capabilities = machine_type_capabilities(
        declared,
        provider_machine_type(request.cloud_profile, &pool.machine_type),
    );
    let architecture = pool.architecture.as_deref();
    let image = &pool.machine_image;

    match find_image_in_cloud_profile(
        request.cloud_profile,
        &image.name,
        &image.version,
        architecture,
        &capabilities,
        definitions,
    ) {
        Ok(found) => Ok(found),
        Err(err) => find_image_in_worker_status(
            &status.machine_images,
            &image.name,
            &image.version,
            architecture,
            &capabilities,
            definitions,
        )
        .cloned()
        .map_err(|_| Error::Config(err)),
    }
}

fn machine_type_accelerated(request: &WorkerRequest<'_>, pool: &WorkerPool) -> bool {
    let declared = request
        .cluster
        .machine_type(&pool.machine_type)
        .and_then(|machine_type| machine_type.capabilities.as_ref());
    machine_type_capabilities(
        declared,
        provider_machine_type(request.cloud_profile, &pool.machine_type),
    )
    .get(CAPABILITY_NETWORK)
    .is_some_and(|values| values.iter().any(|value| value == NETWORK_ACCELERATED))
}

fn node_capacity(
    request: &WorkerRequest<'_>,
    pool: &WorkerPool,
    config: &WorkerConfig,
) -> BTreeMap<String, Quantity> {
    let mut capacity = BTreeMap::new();
    if let Some(machine_type) = request.cluster.machine_type(&pool.machine_type) {
        capacity.insert("cpu".to_string(), machine_type.cpu.clone());
        capacity.insert("gpu".to_string(), machine_type.gpu.clone());
        capacity.insert("memory".to_string(), machine_type.memory.clone());
    }
    if let Some(template) = &config.node_template {
        for (resource, quantity) in &template.capacity {
            if CORE_RESOURCES.contains(&resource.as_str()) && capacity.contains_key(resource) {
                continue;
            }
            capacity.insert(resource.clone(), quantity.clone());
        }
    }
    capacity
}

fn data_disks(pool: &WorkerPool, config: &WorkerConfig) -> Result<Vec<DataDisk>> {
    let mut volumes: Vec<_> = pool.data_volumes.iter().collect();
    volumes.sort_by(|a, b| a.name.cmp(&b.name));
    volumes
        .into_iter()
        .enumerate()
        .map(|(lun, volume)| {
            let image_ref = config
                .data_volumes
                .iter()
                .find(|configured| configured.name == volume.name)
                .and_then(|configured| configured.image_ref.as_ref())
                .map(ImageRef::from);
            Ok(DataDisk {
                name: volume.name.clone(),
                lun: i32::try_from(lun)
                    .map_err(|_| Error::Validation("too many data volumes".to_string()))?,
                caching: CachingType::None.to_string(),
                disk_size_gb: parse_size_gib(&volume.size)?,
                storage_account_type: volume.volume_type.clone(),
                image_ref,
            })
        })
        .collect()
}

fn os_disk(pool: &WorkerPool, config: &WorkerConfig) -> Result<OsDisk> {
    let caching = config
        .os_disk
        .as_ref()
        .and_then(|disk| disk.caching)
        .unwrap_or_default();
    let security_profile = is_confidential(&pool.machine_type).then(|| DiskSecurityProfile {
        security_encryption_type: "VMGuestStateOnly".to_string(),
    });
    Ok(OsDisk {
        caching: caching.to_string(),
        disk_size_gb: pool
            .volume
            .as_ref()
            .map(|volume| parse_size_gib(&volume.size))
            .transpose()?,
        create_option: "FromImage".to_string(),
        managed_disk: ManagedDisk {
            storage_account_type: pool.volume.as_ref().and_then(|v| v.volume_type.clone()),
            security_profile,
        },
    })
}

fn tags(technical_id: &str, pool: &WorkerPool) -> Tags {
    let mut tags = technical_id_tags(technical_id);
    tags.insert(sanitize_tag(&format!("kubernetes.io-cluster-{technical_id}")), "1".to_string());
    tags.insert("kubernetes.io-role-node".to_string(), "1".to_string());
    for (key, value) in &pool.labels {
        tags.insert(sanitize_tag(key), sanitize_tag(value));
    }
    tags
}

/// Builds machine classes and deployments for all pools and pins the
/// selected images into `status`.
pub fn generate(request: &WorkerRequest<'_>, status: &mut WorkerStatus) -> Result<MachinePlan> {
    let infrastructure = request.infrastructure;
    let mut plan = MachinePlan::default();

    for pool in &request.spec.pools {
        let config = worker_config(pool)?;
        let image = select_image(request, pool, status)?;
        status.pin_image(image.clone());

        let vmo = if infrastructure.is_vmo_required() {
            Some(status.vmo_dependency(&pool.name).cloned().ok_or_else(|| {
                Error::MissingResource(format!("VM orchestration group of pool {}", pool.name))
            })?)
        } else {
            None
        };
        let availability_set = if infrastructure.zoned || vmo.is_some() {
            None
        } else {
            Some(find_availability_set_by_purpose(&infrastructure.availability_sets, Purpose::Nodes)?)
        };
        let accelerated = image.accelerated_networking
            && machine_type_accelerated(request, pool)
            && availability_set.is_none();
        let identity_id = infrastructure.identity.as_ref().map(|identity| identity.id.as_str());
        let kubernetes_version = pool
            .kubernetes_version
            .as_deref()
            .unwrap_or_else(|| request.cluster.kubernetes_version());
        let architecture = pool
            .architecture
            .clone()
            .unwrap_or_else(|| ARCHITECTURE_AMD64.to_string());
        let security_profile = is_confidential(&pool.machine_type).then(|| SecurityProfile {
            security_type: "ConfidentialVM".to_string(),
            uefi_settings: UefiSettings {
                secure_boot_enabled: true,
                v_tpm_enabled: true,
            },
        });
        let mut image_ref = ImageRef::from(&image.reference);
        image_ref.skip_marketplace_agreement = image.skip_marketplace_agreement;

        let zones: Vec<Option<&str>> = if infrastructure.zoned {
            pool.zones.iter().map(|zone| Some(zone.as_str())).collect()
        } else {
            vec![None]
        };
        for (index, zone) in zones.iter().copied().enumerate() {
            let subnet_zone = match infrastructure.networks.layout {
                NetworkLayout::SingleSubnet => None,
                NetworkLayout::MultipleSubnet | NetworkLayout::Migrated => zone,
            };
            let (_, subnet): (usize, &Subnet) = find_subnet_by_purpose_and_zone(
                &infrastructure.networks.subnets,
                Purpose::Nodes,
                subnet_zone,
            )?;

            let hash = pool_hash(&HashInputs {
                pool,
                worker_config: &config,
                identity_id,
                vmo_name: vmo.as_ref().map(|dependency| dependency.name.as_str()),
                subnet: Some(subnet),
                layout: infrastructure.networks.layout,
                kubernetes_version,
            });
            let deployment_name = match zone {
                Some(zone) => format!("{}-{}-z{zone}", request.technical_id, pool.name),
                None => format!("{}-{}", request.technical_id, pool.name),
            };
            let class_name = format!("{deployment_name}-{hash}");
            debug!(pool = %pool.name, class = %class_name, "Generated machine class");

            let zone_number = zone
                .map(|zone| {
                    zone.parse::<i32>()
                        .map_err(|_| Error::Validation(format!("invalid zone {zone:?}")))
                })
                .transpose()?;

            plan.classes.push(MachineClass {
                name: class_name.clone(),
                provider_spec: ProviderSpec {
                    location: request.region.to_string(),
                    resource_group: infrastructure.resource_group.clone(),
                    tags: tags(request.technical_id, pool),
                    properties: VmProperties {
                        hardware_profile: HardwareProfile {
                            vm_size: pool.machine_type.clone(),
                        },
                        storage_profile: StorageProfile {
                            image_reference: image_ref.clone(),
                            os_disk: os_disk(pool, &config)?,
                            data_disks: data_disks(pool, &config)?,
                        },
                        os_profile: OsProfile {
                            admin_username: ADMIN_USERNAME.to_string(),
                            linux_configuration: LinuxConfiguration {
                                disable_password_authentication: true,
                                ssh: SshConfiguration {
                                    public_keys: SshPublicKey {
                                        path: format!("/home/{ADMIN_USERNAME}/.ssh/authorized_keys"),
                                        key_data: request.spec.ssh_public_key.clone().unwrap_or_default(),
                                    },
                                },
                            },
                        },
                        network_profile: NetworkProfile {
                            accelerated_networking: accelerated,
                        },
                        zone: zone_number,
                        availability_set: availability_set.map(|set| IdReference { id: set.id.clone() }),
                        machine_set: vmo.as_ref().map(|dependency| MachineSet {
                            id: dependency.id.clone(),
                            kind: "vmo".to_string(),
                        }),
                        identity_id: identity_id.map(str::to_string),
                        diagnostics_profile: config.diagnostics_profile.clone(),
                        capacity_reservation: config.capacity_reservation.clone(),
                        security_profile: security_profile.clone(),
                    },
                    subnet_info: SubnetInfo {
                        vnet_name: infrastructure.networks.vnet.name.clone(),
                        vnet_resource_group: infrastructure.networks.vnet.resource_group.clone(),
                        subnet_name: subnet.name.clone(),
                    },
                },
                node_template: NodeTemplateSpec {
                    capacity: node_capacity(request, pool, &config),
                    virtual_capacity: config
                        .node_template
                        .as_ref()
                        .map(|template| template.virtual_capacity.clone())
                        .unwrap_or_default(),
                    instance_type: pool.machine_type.clone(),
                    region: request.region.to_string(),
                    zone: zone.map_or_else(|| "no-zone".to_string(), str::to_string),
                    architecture: architecture.clone(),
                },
                credentials_secret_ref: request.spec.secret_ref.clone(),
                user_data_secret_ref: pool.user_data_secret_ref.as_ref().map(|secret| {
                    SecretReference {
                        name: secret.name.clone(),
                        namespace: None,
                    }
                }),
            });

            let mut labels = pool.labels.clone();
            labels.insert("worker.gardener.cloud/pool".to_string(), pool.name.clone());
            plan.deployments.push(MachineDeployment {
                name: deployment_name,
                pool_name: pool.name.clone(),
                class_name,
                zone: zone.map(str::to_string),
                minimum: distribute_over_zones(index, pool.minimum, zones.len()),
                maximum: distribute_over_zones(index, pool.maximum, zones.len()),
                max_surge: distribute_positive(index, &pool.max_surge, zones.len()),
                max_unavailable: distribute_positive(index, &pool.max_unavailable, zones.len()),
                update_strategy: pool
                    .update_strategy
                    .clone()
                    .unwrap_or_else(|| AUTO_ROLLING_UPDATE.to_string()),
                priority: pool.priority,
                labels,
                annotations: pool.annotations.clone(),
                taints: pool.taints.clone(),
            });
        }
    }
    Ok(plan)
}
