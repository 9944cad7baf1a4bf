//! Validation of provider configurations.
//!
//! Every check returns the full list of field errors so one pass reports
//! every problem of a resource.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::LazyLock;

use azure_config::api::{ControlPlaneConfig, InfrastructureConfig, PublicIpReference};
use ipnetwork::IpNetwork;
use regex::Regex;

use crate::crds::{WorkerPool, AUTO_IN_PLACE_UPDATE, MANUAL_IN_PLACE_UPDATE};
use crate::error::{Error, Result};
use crate::worker::machines::{parse_size_gib, worker_config};

const NAT_IDLE_TIMEOUT_MINUTES: std::ops::RangeInclusive<i32> = 4..=120;

#[allow(clippy::expect_used)]
static DNS_LABEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z0-9]([-a-z0-9]{0,61}[a-z0-9])?$").expect("DNS label pattern must compile")
});

#[allow(clippy::expect_used)]
static FEATURE_GATE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[A-Z][A-Za-z0-9]*$").expect("feature gate pattern must compile")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldErrorKind {
    Required,
    Invalid,
    Forbidden,
    Duplicate,
}

impl fmt::Display for FieldErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Required => write!(f, "Required value"),
            Self::Invalid => write!(f, "Invalid value"),
            Self::Forbidden => write!(f, "Forbidden"),
            Self::Duplicate => write!(f, "Duplicate value"),
        }
    }
}

/// One problem of one field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldError {
    pub field: String,
    pub kind: FieldErrorKind,
    pub detail: String,
}

impl fmt::Display for FieldError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}: {}", self.field, self.kind, self.detail)
    }
}

#[derive(Debug, Default)]
struct Errors(Vec<FieldError>);

impl Errors {
    fn push(&mut self, field: impl Into<String>, kind: FieldErrorKind, detail: impl Into<String>) {
        self.0.push(FieldError {
            field: field.into(),
            kind,
            detail: detail.into(),
        });
    }

    fn required(&mut self, field: impl Into<String>, detail: impl Into<String>) {
        self.push(field, FieldErrorKind::Required, detail);
    }

    fn invalid(&mut self, field: impl Into<String>, detail: impl Into<String>) {
        self.push(field, FieldErrorKind::Invalid, detail);
    }

    fn forbidden(&mut self, field: impl Into<String>, detail: impl Into<String>) {
        self.push(field, FieldErrorKind::Forbidden, detail);
    }

    fn immutable<T: PartialEq + fmt::Debug>(&mut self, field: &str, old: &T, new: &T) {
        if old != new {
            self.forbidden(field, format!("field is immutable ({old:?} -> {new:?})"));
        }
    }
}

/// Turns field errors into a single validation error.
pub fn into_result(errors: Vec<FieldError>) -> Result<()> {
    if errors.is_empty() {
        return Ok(());
    }
    let message = errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ");
    Err(Error::Validation(message))
}

fn parse_cidr(errors: &mut Errors, field: &str, cidr: &str) -> Option<IpNetwork> {
    match cidr.parse::<IpNetwork>() {
        Ok(network) => Some(network),
        Err(err) => {
            errors.invalid(field, format!("invalid CIDR {cidr:?}: {err}"));
            None
        }
    }
}

fn is_subset(outer: IpNetwork, inner: IpNetwork) -> bool {
    outer.is_ipv4() == inner.is_ipv4()
        && outer.prefix() <= inner.prefix()
        && outer.contains(inner.network())
}

fn overlaps(a: IpNetwork, b: IpNetwork) -> bool {
    a.is_ipv4() == b.is_ipv4() && (a.contains(b.network()) || b.contains(a.network()))
}

fn check_idle_timeout(errors: &mut Errors, field: &str, minutes: Option<i32>) {
    if let Some(minutes) = minutes {
        if !NAT_IDLE_TIMEOUT_MINUTES.contains(&minutes) {
            errors.invalid(
                field,
                format!(
                    "{minutes} is outside [{}, {}]",
                    NAT_IDLE_TIMEOUT_MINUTES.start(),
                    NAT_IDLE_TIMEOUT_MINUTES.end()
                ),
            );
        }
    }
}

fn check_ip_references(errors: &mut Errors, field: &str, ips: &[PublicIpReference]) {
    for (i, ip) in ips.iter().enumerate() {
        if ip.name.is_empty() {
            errors.required(format!("{field}[{i}].name"), "public IP name is required");
        }
        if ip.resource_group.is_empty() {
            errors.required(
                format!("{field}[{i}].resourceGroup"),
                "public IP resource group is required",
            );
        }
    }
}

/// Checks an infrastructure configuration on its own.
#[must_use]
pub fn validate_infrastructure_config(config: &InfrastructureConfig) -> Vec<FieldError> {
    let mut errors = Errors::default();
    let networks = &config.networks;
    let vnet = &networks.vnet;

    if config.resource_group.as_deref() == Some("") {
        errors.required("resourceGroup.name", "resource group name must not be empty");
    }

    if vnet.name.is_some() != vnet.resource_group.is_some() {
        errors.invalid(
            "networks.vnet",
            "name and resourceGroup must be set together",
        );
    }
    if vnet.name.is_some() && vnet.cidr.is_some() {
        errors.forbidden(
            "networks.vnet.cidr",
            "a CIDR must not be set for an existing virtual network",
        );
    }
    let vnet_cidr = vnet
        .cidr
        .as_deref()
        .and_then(|cidr| parse_cidr(&mut errors, "networks.vnet.cidr", cidr));

    let workers = networks
        .workers
        .as_deref()
        .and_then(|cidr| parse_cidr(&mut errors, "networks.workers", cidr));
    if let (Some(outer), Some(inner)) = (vnet_cidr, workers) {
        if !is_subset(outer, inner) {
            errors.invalid("networks.workers", "must be inside the virtual network CIDR");
        }
    }

    if networks.workers.is_none() && networks.zones.is_empty() {
        errors.required("networks.workers", "either workers or zones must be set");
    }
    if !networks.zones.is_empty() && !config.zoned {
        errors.forbidden("networks.zones", "zones can only be used by zoned clusters");
    }
    if let Some(workers) = networks.workers.as_deref() {
        if !networks.zones.is_empty() && networks.migrated_zone().is_none() {
            errors.invalid(
                "networks.workers",
                format!("{workers} must equal the CIDR of the migrated zone"),
            );
        }
    }

    let mut names = BTreeSet::new();
    let mut zone_cidrs: Vec<(usize, IpNetwork)> = Vec::new();
    for (i, zone) in networks.zones.iter().enumerate() {
        let field = format!("networks.zones[{i}]");
        if !names.insert(zone.name) {
            errors.push(
                format!("{field}.name"),
                FieldErrorKind::Duplicate,
                format!("zone {} is listed twice", zone.name),
            );
        }
        if zone.cidr.is_empty() {
            errors.required(format!("{field}.cidr"), "zone CIDR is required");
            continue;
        }
        let Some(cidr) = parse_cidr(&mut errors, &format!("{field}.cidr"), &zone.cidr) else {
            continue;
        };
        if let Some(outer) = vnet_cidr {
            if !is_subset(outer, cidr) {
                errors.invalid(format!("{field}.cidr"), "must be inside the virtual network CIDR");
            }
        }
        for (j, other) in &zone_cidrs {
            if overlaps(*other, cidr) {
                errors.invalid(
                    format!("{field}.cidr"),
                    format!("overlaps with networks.zones[{j}].cidr"),
                );
            }
        }
        zone_cidrs.push((i, cidr));

        if let Some(nat) = &zone.nat_gateway {
            check_idle_timeout(
                &mut errors,
                &format!("{field}.natGateway.idleConnectionTimeoutMinutes"),
                nat.idle_connection_timeout_minutes,
            );
            check_ip_references(&mut errors, &format!("{field}.natGateway.ipAddresses"), &nat.ip_addresses);
        }
    }

    if let Some(nat) = &networks.nat_gateway {
        if !networks.zones.is_empty() {
            errors.forbidden(
                "networks.natGateway",
                "zones configure their own NAT gateways",
            );
        }
        check_idle_timeout(
            &mut errors,
            "networks.natGateway.idleConnectionTimeoutMinutes",
            nat.idle_connection_timeout_minutes,
        );
        check_ip_references(&mut errors, "networks.natGateway.ipAddresses", &nat.ip_addresses);
        if !nat.ip_addresses.is_empty() {
            match nat.zone {
                None if config.zoned => errors.required(
                    "networks.natGateway.zone",
                    "user provided public IPs need a zone in zoned clusters",
                ),
                Some(zone) => {
                    for (i, ip) in nat.ip_addresses.iter().enumerate() {
                        if ip.zone.is_some_and(|ip_zone| ip_zone != zone) {
                            errors.invalid(
                                format!("networks.natGateway.ipAddresses[{i}].zone"),
                                format!("must match the NAT gateway zone {zone}"),
                            );
                        }
                    }
                }
                None => {}
            }
        }
    }

    if let Some(identity) = &config.identity {
        if identity.name.is_empty() {
            errors.required("identity.name", "identity name is required");
        }
        if identity.resource_group.is_empty() {
            errors.required("identity.resourceGroup", "identity resource group is required");
        }
    }
    errors.0
}

/// Checks a change of an infrastructure configuration.
#[must_use]
pub fn validate_infrastructure_config_update(
    old: &InfrastructureConfig,
    new: &InfrastructureConfig,
) -> Vec<FieldError> {
    let mut errors = Errors::default();
    errors.immutable("zoned", &old.zoned, &new.zoned);
    errors.immutable("resourceGroup", &old.resource_group, &new.resource_group);

    let (old_vnet, new_vnet) = (&old.networks.vnet, &new.networks.vnet);
    errors.immutable("networks.vnet.name", &old_vnet.name, &new_vnet.name);
    errors.immutable(
        "networks.vnet.resourceGroup",
        &old_vnet.resource_group,
        &new_vnet.resource_group,
    );
    errors.immutable("networks.vnet.cidr", &old_vnet.cidr, &new_vnet.cidr);

    for (i, zone) in new.networks.zones.iter().enumerate() {
        if let Some(previous) = old.networks.zones.iter().find(|old| old.name == zone.name) {
            errors.immutable(&format!("networks.zones[{i}].cidr"), &previous.cidr, &zone.cidr);
        }
    }

    if let (Some(workers), None) = (&old.networks.workers, &new.networks.workers) {
        let migrating = old.networks.zones.is_empty()
            && new.networks.zones.iter().any(|zone| &zone.cidr == workers);
        if !migrating {
            errors.forbidden(
                "networks.workers",
                "workers can only be removed while migrating to zones with the same CIDR",
            );
        }
    }
    errors.0
}

fn check_size(errors: &mut Errors, field: String, size: &str) {
    match parse_size_gib(size) {
        Ok(gib) if gib >= 1 => {}
        Ok(_) => errors.invalid(field, format!("size {size:?} must be at least 1Gi")),
        Err(err) => errors.invalid(field, err.to_string()),
    }
}

/// Checks the pools of a worker.
///
/// `availability_sets` is true when the infrastructure still places
/// non-zoned machines in an availability set.
#[must_use]
pub fn validate_worker_pools(
    pools: &[WorkerPool],
    zoned: bool,
    availability_sets: bool,
) -> Vec<FieldError> {
    let mut errors = Errors::default();
    let mut pool_names = BTreeSet::new();

    for (i, pool) in pools.iter().enumerate() {
        let field = format!("pools[{i}]");
        if !DNS_LABEL.is_match(&pool.name) {
            errors.invalid(format!("{field}.name"), format!("{:?} is not a DNS label", pool.name));
        }
        if !pool_names.insert(pool.name.as_str()) {
            errors.push(
                format!("{field}.name"),
                FieldErrorKind::Duplicate,
                format!("pool {} is listed twice", pool.name),
            );
        }
        if pool.minimum < 0 || pool.maximum < pool.minimum {
            errors.invalid(
                format!("{field}.maximum"),
                format!("need 0 <= minimum ({}) <= maximum ({})", pool.minimum, pool.maximum),
            );
        }

        if let Some(volume) = &pool.volume {
            check_size(&mut errors, format!("{field}.volume.size"), &volume.size);
        }
        let mut volume_names = BTreeSet::new();
        for (j, volume) in pool.data_volumes.iter().enumerate() {
            let volume_field = format!("{field}.dataVolumes[{j}]");
            if volume.name.is_empty() {
                errors.required(format!("{volume_field}.name"), "data volume name is required");
            } else if !volume_names.insert(volume.name.as_str()) {
                errors.push(
                    format!("{volume_field}.name"),
                    FieldErrorKind::Duplicate,
                    format!("data volume {} is listed twice", volume.name),
                );
            }
            check_size(&mut errors, format!("{volume_field}.size"), &volume.size);
        }

        if zoned && pool.zones.is_empty() {
            errors.required(format!("{field}.zones"), "zoned clusters need zones per pool");
        }
        if !zoned && !pool.zones.is_empty() {
            errors.forbidden(format!("{field}.zones"), "non-zoned clusters have no zones");
        }

        let in_place = matches!(
            pool.update_strategy.as_deref(),
            Some(AUTO_IN_PLACE_UPDATE | MANUAL_IN_PLACE_UPDATE)
        );
        if in_place && availability_sets {
            errors.forbidden(
                format!("{field}.updateStrategy"),
                "in-place updates are not supported with availability sets",
            );
        }

        match worker_config(pool) {
            Ok(config) => {
                for (j, volume) in config.data_volumes.iter().enumerate() {
                    if !volume_names.contains(volume.name.as_str()) {
                        errors.invalid(
                            format!("{field}.providerConfig.dataVolumes[{j}].name"),
                            format!("no data volume named {:?} in the pool", volume.name),
                        );
                    }
                }
            }
            Err(err) => errors.invalid(format!("{field}.providerConfig"), err.to_string()),
        }
    }
    errors.0
}

/// Checks pool changes against the zones each pool had before.
#[must_use]
pub fn validate_worker_pools_update(
    previous_zones: &BTreeMap<String, Vec<String>>,
    pools: &[WorkerPool],
) -> Vec<FieldError> {
    let mut errors = Errors::default();
    for (i, pool) in pools.iter().enumerate() {
        let Some(previous) = previous_zones.get(&pool.name) else {
            continue;
        };
        let removed: Vec<&String> = previous
            .iter()
            .filter(|zone| !pool.zones.contains(zone))
            .collect();
        if !removed.is_empty() {
            errors.forbidden(
                format!("pools[{i}].zones"),
                format!("zones can only be added, {removed:?} were removed"),
            );
        }
    }
    errors.0
}

/// Checks a control plane configuration.
#[must_use]
pub fn validate_control_plane_config(config: &ControlPlaneConfig) -> Vec<FieldError> {
    let mut errors = Errors::default();
    if let Some(ccm) = &config.cloud_controller_manager {
        for gate in ccm.feature_gates.keys() {
            if !FEATURE_GATE.is_match(gate) {
                errors.invalid(
                    format!("cloudControllerManager.featureGates.{gate}"),
                    "unknown feature gate format",
                );
            }
        }
    }
    errors.0
}

#[cfg(test)]
mod tests {
    use azure_config::api::{
        IdentityConfig, NatGatewayConfig, NetworkConfig, VnetConfig, ZoneConfig,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::crds::{DataVolume, Volume};

    fn fields(errors: &[FieldError]) -> Vec<&str> {
        errors.iter().map(|err| err.field.as_str()).collect()
    }

    fn zone(name: i32, cidr: &str) -> ZoneConfig {
        ZoneConfig {
            name,
            cidr: cidr.to_string(),
            ..Default::default()
        }
    }

    fn zoned_config() -> InfrastructureConfig {
        InfrastructureConfig {
            zoned: true,
            networks: NetworkConfig {
                vnet: VnetConfig {
                    cidr: Some("10.250.0.0/16".to_string()),
                    ..Default::default()
                },
                zones: vec![zone(1, "10.250.0.0/24"), zone(2, "10.250.1.0/24")],
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn valid_zoned_config() {
        assert_eq!(validate_infrastructure_config(&zoned_config()), Vec::new());
    }

    #[test]
    fn zone_cidrs_must_be_disjoint_and_inside_the_vnet() {
        let mut config = zoned_config();
        config.networks.zones.push(zone(3, "10.250.1.128/25"));
        config.networks.zones.push(zone(1, "10.251.0.0/24"));
        let errors = validate_infrastructure_config(&config);
        assert_eq!(
            fields(&errors),
            vec![
                "networks.zones[2].cidr",
                "networks.zones[3].name",
                "networks.zones[3].cidr"
            ]
        );
        assert_eq!(errors[1].kind, FieldErrorKind::Duplicate);
    }

    #[test]
    fn workers_or_zones_are_required() {
        let mut config = InfrastructureConfig::default();
        config.networks.vnet.cidr = Some("10.250.0.0/16".to_string());
        let errors = validate_infrastructure_config(&config);
        assert_eq!(fields(&errors), vec!["networks.workers"]);
        assert_eq!(errors[0].kind, FieldErrorKind::Required);

        config.networks.workers = Some("10.251.0.0/19".to_string());
        assert_eq!(fields(&validate_infrastructure_config(&config)), vec!["networks.workers"]);
    }

    #[test]
    fn existing_vnets_take_no_cidr() {
        let mut config = zoned_config();
        config.networks.vnet = VnetConfig {
            name: Some("vnet".to_string()),
            cidr: Some("10.250.0.0/16".to_string()),
            ..Default::default()
        };
        assert_eq!(
            fields(&validate_infrastructure_config(&config)),
            vec!["networks.vnet", "networks.vnet.cidr"]
        );
    }

    #[test]
    fn nat_gateway_rules() {
        let config = InfrastructureConfig {
            zoned: true,
            networks: NetworkConfig {
                workers: Some("10.250.0.0/19".to_string()),
                nat_gateway: Some(NatGatewayConfig {
                    enabled: true,
                    idle_connection_timeout_minutes: Some(121),
                    zone: None,
                    ip_addresses: vec![PublicIpReference {
                        name: "ip".to_string(),
                        resource_group: "rg".to_string(),
                        zone: None,
                    }],
                }),
                ..Default::default()
            },
            identity: Some(IdentityConfig::default()),
            ..Default::default()
        };
        assert_eq!(
            fields(&validate_infrastructure_config(&config)),
            vec![
                "networks.natGateway.idleConnectionTimeoutMinutes",
                "networks.natGateway.zone",
                "identity.name",
                "identity.resourceGroup"
            ]
        );
    }

    #[test]
    fn immutable_fields() {
        let old = zoned_config();
        let mut new = old.clone();
        new.zoned = false;
        new.networks.zones[0].cidr = "10.250.2.0/24".to_string();
        new.networks.zones.push(zone(3, "10.250.3.0/24"));
        assert_eq!(
            fields(&validate_infrastructure_config_update(&old, &new)),
            vec!["zoned", "networks.zones[0].cidr"]
        );
    }

    #[test]
    fn workers_removal_needs_a_matching_zone() {
        let old = InfrastructureConfig {
            zoned: true,
            networks: NetworkConfig {
                workers: Some("10.250.0.0/19".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let mut new = old.clone();
        new.networks.workers = None;
        new.networks.zones = vec![zone(1, "10.250.0.0/19")];
        assert_eq!(validate_infrastructure_config_update(&old, &new), Vec::new());

        new.networks.zones = vec![zone(1, "10.250.64.0/19")];
        assert_eq!(
            fields(&validate_infrastructure_config_update(&old, &new)),
            vec!["networks.workers"]
        );
    }

    fn pool(name: &str, zones: &[&str]) -> WorkerPool {
        WorkerPool {
            name: name.to_string(),
            machine_type: "Standard_D4s_v5".to_string(),
            minimum: 1,
            maximum: 2,
            zones: zones.iter().map(|zone| (*zone).to_string()).collect(),
            volume: Some(Volume {
                size: "50Gi".to_string(),
                volume_type: None,
            }),
            ..Default::default()
        }
    }

    #[test]
    fn worker_pool_rules() {
        let mut bad = pool("Bad_Name", &[]);
        bad.volume = Some(Volume {
            size: "0Gi".to_string(),
            volume_type: None,
        });
        bad.data_volumes = vec![
            DataVolume {
                name: "data".to_string(),
                size: "10Gi".to_string(),
                volume_type: None,
            },
            DataVolume {
                name: "data".to_string(),
                size: "10Gi".to_string(),
                volume_type: None,
            },
        ];
        bad.update_strategy = Some(AUTO_IN_PLACE_UPDATE.to_string());
        bad.provider_config = Some(json!({
            "apiVersion": "azure.provider.extensions.gardener.cloud/v1alpha1",
            "kind": "WorkerConfig",
            "dataVolumes": [{"name": "missing"}],
        }));

        let errors = validate_worker_pools(&[bad, pool("cpu", &["1"])], false, true);
        assert_eq!(
            fields(&errors),
            vec![
                "pools[0].name",
                "pools[0].volume.size",
                "pools[0].dataVolumes[1].name",
                "pools[0].updateStrategy",
                "pools[0].providerConfig.dataVolumes[0].name",
                "pools[1].zones",
            ]
        );
    }

    #[test]
    fn zoned_pools_need_zones() {
        let errors = validate_worker_pools(&[pool("cpu", &[])], true, false);
        assert_eq!(fields(&errors), vec!["pools[0].zones"]);
        assert_eq!(validate_worker_pools(&[pool("cpu", &["1", "2"])], true, false), Vec::new());
    }

    #[test]
    fn pool_zones_can_only_grow() {
        let previous = BTreeMap::from([("cpu".to_string(), vec!["1".to_string(), "2".to_string()])]);
        assert_eq!(
            validate_worker_pools_update(&previous, &[pool("cpu", &["1", "2", "3"])]),
            Vec::new()
        );
        assert_eq!(
            fields(&validate_worker_pools_update(&previous, &[pool("cpu", &["1"])])),
            vec!["pools[0].zones"]
        );
    }

    #[test]
    fn feature_gates() {
        let mut config = ControlPlaneConfig::default();
        let mut ccm = azure_config::api::CloudControllerManagerConfig::default();
        ccm.feature_gates.insert("SomeGate".to_string(), true);
        ccm.feature_gates.insert("not a gate".to_string(), false);
        config.cloud_controller_manager = Some(ccm);
        assert_eq!(
            fields(&validate_control_plane_config(&config)),
            vec!["cloudControllerManager.featureGates.not a gate"]
        );
    }

    #[test]
    fn field_errors_join_into_one_validation_error() {
        assert!(into_result(Vec::new()).is_ok());
        let err = into_result(validate_worker_pools(&[pool("cpu", &[])], true, false)).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Validation failed: pools[0].zones: Required value: zoned clusters need zones per pool"
        );
    }
}
