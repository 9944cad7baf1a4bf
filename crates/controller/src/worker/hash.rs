//! Pool hashes.
//!
//! A pool hash names the machine class of a pool; every input that requires
//! new machines changes it. Two separately computed digests exist: the legacy
//! one, and the V2 one used from Kubernetes 1.34 on, which also covers the
//! worker configuration except its virtual capacity.
//!
//! Pools updated in place keep their machines across image updates, so the
//! image version is left out of their hashes.

use azure_config::api::{NetworkLayout, Subnet, WorkerConfig};
use sha2::{Digest, Sha256};

use crate::crds::{WorkerPool, AUTO_IN_PLACE_UPDATE, MANUAL_IN_PLACE_UPDATE};

/// First Kubernetes minor version using the V2 hash.
const V2_MINOR: u32 = 34;

/// Inputs of a pool hash beyond the pool itself.
#[derive(Debug, Clone, Copy)]
pub struct HashInputs<'a> {
    pub pool: &'a WorkerPool,
    pub worker_config: &'a WorkerConfig,
    pub identity_id: Option<&'a str>,
    pub vmo_name: Option<&'a str>,
    pub subnet: Option<&'a Subnet>,
    pub layout: NetworkLayout,
    /// Kubernetes version of the pool, or of the shoot if the pool has none.
    pub kubernetes_version: &'a str,
}

/// First five hex characters of the SHA-256 of `data`.
#[must_use]
pub fn short_hash(data: &[u8]) -> String {
    let digest = hex::encode(Sha256::digest(data));
    digest[..5].to_string()
}

fn updates_in_place(pool: &WorkerPool) -> bool {
    matches!(
        pool.update_strategy.as_deref(),
        Some(AUTO_IN_PLACE_UPDATE | MANUAL_IN_PLACE_UPDATE)
    )
}

fn legacy_data(inputs: &HashInputs<'_>) -> Vec<String> {
    let pool = inputs.pool;
    let mut data = vec![pool.machine_type.clone(), pool.machine_image.name.clone()];
    if !updates_in_place(pool) {
        data.push(pool.machine_image.version.clone());
    }
    if let Some(volume) = &pool.volume {
        data.push(volume.size.clone());
        data.extend(volume.volume_type.clone());
    }
    for volume in &pool.data_volumes {
        data.push(volume.name.clone());
        data.push(volume.size.clone());
        data.extend(volume.volume_type.clone());
    }
    data.extend(inputs.identity_id.map(str::to_string));
    data.extend(inputs.vmo_name.map(str::to_string));
    if let Some(subnet) = inputs.subnet {
        if inputs.layout == NetworkLayout::MultipleSubnet && !subnet.migrated {
            data.push(subnet.name.clone());
        }
    }
    data
}

/// Worker configuration fields that require new machines. Virtual capacity
/// is informational and never listed.
fn worker_config_data(config: &WorkerConfig) -> Vec<String> {
    let mut data = Vec::new();
    if let Some(template) = &config.node_template {
        // BTreeMap iteration keeps the capacity keys sorted.
        for (name, quantity) in &template.capacity {
            data.push(format!("capacity:{name}={}", quantity.0));
        }
    }
    if let Some(caching) = config.os_disk.as_ref().and_then(|disk| disk.caching) {
        data.push(format!("osDiskCaching:{caching}"));
    }
    for volume in &config.data_volumes {
        if let Some(image) = &volume.image_ref {
            data.push(format!("dataVolumeImage:{}={image}", volume.name));
        }
    }
    if let Some(diagnostics) = &config.diagnostics_profile {
        data.push(format!("diagnostics:{}", diagnostics.enabled));
        data.extend(
            diagnostics
                .storage_uri
                .as_ref()
                .map(|uri| format!("diagnosticsStorage:{uri}")),
        );
    }
    if let Some(group) = config
        .capacity_reservation
        .as_ref()
        .and_then(|reservation| reservation.capacity_reservation_group_id.as_ref())
    {
        data.push(format!("capacityReservationGroup:{group}"));
    }
    data
}

/// Legacy pool hash.
#[must_use]
pub fn legacy_hash(inputs: &HashInputs<'_>) -> String {
    short_hash(legacy_data(inputs).join("").as_bytes())
}

/// V2 pool hash.
#[must_use]
pub fn v2_hash(inputs: &HashInputs<'_>) -> String {
    let mut data = legacy_data(inputs);
    data.extend(worker_config_data(inputs.worker_config));
    short_hash(data.join("").as_bytes())
}

/// Hash of the pool under the scheme its Kubernetes version selects.
#[must_use]
pub fn pool_hash(inputs: &HashInputs<'_>) -> String {
    if uses_v2(inputs.kubernetes_version) {
        v2_hash(inputs)
    } else {
        legacy_hash(inputs)
    }
}

fn uses_v2(version: &str) -> bool {
    let mut parts = version.trim_start_matches('v').split('.');
    let major = parts.next().and_then(|p| p.parse::<u32>().ok());
    let minor = parts.next().and_then(|p| p.parse::<u32>().ok());
    match (major, minor) {
        (Some(major), _) if major > 1 => true,
        (Some(1), Some(minor)) => minor >= V2_MINOR,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use azure_config::api::{CachingType, CapacityReservation, NodeTemplate, OsDisk, Purpose};
    use k8s_openapi::apimachinery::pkg::api::resource::Quantity;

    use super::*;
    use crate::crds::MachineImageRef;

    fn pool(machine_type: &str) -> WorkerPool {
        WorkerPool {
            name: "cpu".to_string(),
            machine_type: machine_type.to_string(),
            machine_image: MachineImageRef {
                name: "gardenlinux".to_string(),
                version: "1592.1.0".to_string(),
            },
            minimum: 1,
            maximum: 2,
            ..Default::default()
        }
    }

    fn config(virtual_gpus: &str) -> WorkerConfig {
        WorkerConfig {
            node_template: Some(NodeTemplate {
                capacity: BTreeMap::from([("cpu".to_string(), Quantity("4".to_string()))]),
                virtual_capacity: BTreeMap::from([(
                    "subdomain.domain.com/virtual-gpu".to_string(),
                    Quantity(virtual_gpus.to_string()),
                )]),
            }),
            ..Default::default()
        }
    }

    fn inputs<'a>(pool: &'a WorkerPool, config: &'a WorkerConfig) -> HashInputs<'a> {
        HashInputs {
            pool,
            worker_config: config,
            identity_id: None,
            vmo_name: None,
            subnet: None,
            layout: NetworkLayout::SingleSubnet,
            kubernetes_version: "1.34.0",
        }
    }

    #[test]
    fn virtual_capacity_does_not_change_the_v2_hash() {
        let small = pool("Standard_D4s_v5");
        let (one, two) = (config("1"), config("8"));
        assert_eq!(
            v2_hash(&inputs(&small, &one)),
            v2_hash(&inputs(&small, &two))
        );

        let large = pool("Standard_D8s_v5");
        assert_ne!(
            v2_hash(&inputs(&small, &one)),
            v2_hash(&inputs(&large, &one))
        );
    }

    #[test]
    fn v2_hash_covers_the_worker_config() {
        let pool = pool("Standard_D4s_v5");
        let plain = WorkerConfig::default();
        let with_template = config("1");
        assert_eq!(
            legacy_hash(&inputs(&pool, &plain)),
            legacy_hash(&inputs(&pool, &with_template))
        );
        assert_ne!(
            v2_hash(&inputs(&pool, &plain)),
            v2_hash(&inputs(&pool, &with_template))
        );
    }

    #[test]
    fn virtual_capacity_alone_hashes_like_no_node_template() {
        let pool = pool("Standard_D4s_v5");
        let plain = WorkerConfig::default();
        let virtual_only = WorkerConfig {
            node_template: Some(NodeTemplate {
                capacity: BTreeMap::new(),
                virtual_capacity: BTreeMap::from([(
                    "subdomain.domain.com/virtual-gpu".to_string(),
                    Quantity("2".to_string()),
                )]),
            }),
            ..Default::default()
        };
        assert_eq!(
            v2_hash(&inputs(&pool, &plain)),
            v2_hash(&inputs(&pool, &virtual_only))
        );
    }

    #[test]
    fn v2_hash_covers_os_disk_caching_and_capacity_reservation() {
        let pool = pool("Standard_D4s_v5");
        let plain = WorkerConfig::default();
        let cached = WorkerConfig {
            os_disk: Some(OsDisk {
                caching: Some(CachingType::ReadOnly),
            }),
            ..Default::default()
        };
        let reserved = WorkerConfig {
            capacity_reservation: Some(CapacityReservation {
                capacity_reservation_group_id: Some("/subscriptions/s/crg".to_string()),
            }),
            ..Default::default()
        };
        let base = v2_hash(&inputs(&pool, &plain));
        assert_ne!(v2_hash(&inputs(&pool, &cached)), base);
        assert_ne!(v2_hash(&inputs(&pool, &reserved)), base);
        assert_ne!(
            v2_hash(&inputs(&pool, &cached)),
            v2_hash(&inputs(&pool, &reserved))
        );
    }

    #[test]
    fn image_updates_keep_the_hash_of_in_place_pools() {
        let config = WorkerConfig::default();
        let mut rolling = pool("Standard_D4s_v5");
        let mut bumped = rolling.clone();
        bumped.machine_image.version = "1592.2.0".to_string();
        assert_ne!(
            pool_hash(&inputs(&rolling, &config)),
            pool_hash(&inputs(&bumped, &config))
        );

        for strategy in [AUTO_IN_PLACE_UPDATE, MANUAL_IN_PLACE_UPDATE] {
            rolling.update_strategy = Some(strategy.to_string());
            bumped.update_strategy = Some(strategy.to_string());
            assert_eq!(
                pool_hash(&inputs(&rolling, &config)),
                pool_hash(&inputs(&bumped, &config))
            );
            let mut legacy = inputs(&rolling, &config);
            legacy.kubernetes_version = "1.33.0";
            let mut legacy_bumped = inputs(&bumped, &config);
            legacy_bumped.kubernetes_version = "1.33.0";
            assert_eq!(pool_hash(&legacy), pool_hash(&legacy_bumped));
        }
    }

    #[test]
    fn subnet_counts_only_for_unmigrated_zonal_subnets() {
        let pool = pool("Standard_D4s_v5");
        let config = WorkerConfig::default();
        let mut subnet = Subnet {
            name: "t-nodes-z1".to_string(),
            purpose: Purpose::Nodes,
            zone: Some("1".to_string()),
            migrated: false,
        };
        let base = legacy_hash(&inputs(&pool, &config));

        let mut with_subnet = inputs(&pool, &config);
        with_subnet.subnet = Some(&subnet);
        with_subnet.layout = NetworkLayout::MultipleSubnet;
        assert_ne!(legacy_hash(&with_subnet), base);

        subnet.migrated = true;
        let mut migrated = inputs(&pool, &config);
        migrated.subnet = Some(&subnet);
        migrated.layout = NetworkLayout::MultipleSubnet;
        assert_eq!(legacy_hash(&migrated), base);
    }

    #[test]
    fn hash_scheme_follows_the_kubernetes_version() {
        assert!(!uses_v2("1.33.4"));
        assert!(uses_v2("1.34.0"));
        assert!(uses_v2("v1.35.1"));
        assert!(!uses_v2(""));
        assert_eq!(short_hash(b"abc").len(), 5);
    }
}
