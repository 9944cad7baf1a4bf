//! Bastion reconciler.
//!
//! A bastion is a small VM with a public IP in the nodes subnet. SSH from the
//! requested CIDRs is opened on the worker security group; from the bastion
//! only SSH to the worker subnets is allowed.

pub mod options;
pub mod rules;

use std::time::Duration;

use azure_cloud::resources::{
    Disk, IpConfiguration, IpConfigurationProperties, LinuxConfiguration, ManagedDiskParameters,
    NetworkInterface, NetworkInterfaceReference, NetworkInterfaceReferenceProperties,
    NetworkSecurityGroup, OsDisk, OsProfile, PublicIpAddress, Sku, SshConfiguration,
    SshPublicKey, SubResource, VirtualMachine, VirtualNetwork,
};
use azure_cloud::tags::technical_id_tags;
use azure_cloud::{ClientFactory, ResourceId};
use azure_config::api::{CloudProfileConfig, InfrastructureStatus, Purpose};
use azure_config::helper::find_security_group_by_purpose;
use ssh_key::rand_core::OsRng;
use ssh_key::{Algorithm, PrivateKey};
use tracing::{debug, info, instrument};

use self::options::{bastion_image, ingress_cidrs, BastionNames};
use self::rules::{desired_rules, merge_rules, remove_rules, RuleTargets};
use crate::config::BastionConfig;
use crate::context::ReconcileContext;
use crate::crds::{BastionSpec, ClusterView};
use crate::error::{Error, Result};

/// Inputs of one bastion reconcile.
#[derive(Debug, Clone, Copy)]
pub struct BastionRequest<'a> {
    /// Name of the `Bastion` object.
    pub name: &'a str,
    /// Technical ID of the shoot.
    pub cluster_name: &'a str,
    pub region: &'a str,
    pub spec: &'a BastionSpec,
    pub infrastructure: &'a InfrastructureStatus,
    pub cloud_profile: &'a CloudProfileConfig,
    pub cluster: &'a ClusterView,
    pub config: &'a BastionConfig,
}

/// Addresses of a ready bastion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BastionEndpoints {
    pub public_ip: String,
    pub private_ip: String,
}

struct Ids {
    public_ip: ResourceId,
    nic: ResourceId,
    vm: ResourceId,
    disk: ResourceId,
    security_group: Option<ResourceId>,
    vnet: ResourceId,
}

impl Ids {
    fn new(factory: &ClientFactory, request: &BastionRequest<'_>, names: &BastionNames) -> Self {
        let infrastructure = request.infrastructure;
        let group = infrastructure.resource_group.as_str();
        let vnet_group = infrastructure
            .networks
            .vnet
            .resource_group
            .as_deref()
            .unwrap_or(group);
        let security_group =
            find_security_group_by_purpose(&infrastructure.security_groups, Purpose::Nodes)
                .ok()
                .map(|nsg| factory.id_of::<NetworkSecurityGroup>(group, &nsg.name));
        Self {
            public_ip: factory.id_of::<PublicIpAddress>(group, &names.public_ip()),
            nic: factory.id_of::<NetworkInterface>(group, &names.nic()),
            vm: factory.id_of::<VirtualMachine>(group, names.virtual_machine()),
            disk: factory.id_of::<Disk>(group, &names.disk()),
            security_group,
            vnet: factory.id_of::<VirtualNetwork>(vnet_group, &infrastructure.networks.vnet.name),
        }
    }
}

fn machine_type<'a>(request: &'a BastionRequest<'_>) -> &'a str {
    request
        .cluster
        .cloud_profile
        .spec
        .bastion
        .as_ref()
        .and_then(|bastion| bastion.machine_type.as_ref())
        .map_or(request.config.machine_type.as_str(), |machine_type| {
            machine_type.name.as_str()
        })
}

/// Public key of a fresh key pair. Access goes through the user data, so the
/// private half is dropped.
fn throwaway_public_key() -> Result<String> {
    let key = PrivateKey::random(&mut OsRng, Algorithm::Ed25519)?;
    Ok(key.public_key().to_openssh()?)
}

/// Creates the bastion and opens its rules.
///
/// Fails with a requeue while the bastion has no public or private address.
#[instrument(skip_all, fields(bastion = request.name, cluster = request.cluster_name))]
pub async fn reconcile(
    factory: &ClientFactory,
    ctx: &ReconcileContext,
    request: &BastionRequest<'_>,
) -> Result<BastionEndpoints> {
    let ingress = ingress_cidrs(request.spec)?;
    let names = BastionNames::new(request.cluster_name, request.name);
    let vm_size = machine_type(request);
    let image = bastion_image(request.cluster, request.cloud_profile, vm_size)?;
    let ids = Ids::new(factory, request, &names);
    let security_group_id = ids.security_group.clone().ok_or_else(|| {
        Error::MissingResource("security group of the nodes".to_string())
    })?;
    let nodes_subnets: Vec<&str> = request
        .infrastructure
        .networks
        .subnets
        .iter()
        .filter(|subnet| subnet.purpose == Purpose::Nodes)
        .map(|subnet| subnet.name.as_str())
        .collect();
    let Some(first_subnet) = nodes_subnets.first() else {
        return Err(Error::MissingResource("nodes subnet".to_string()));
    };
    let tags = technical_id_tags(request.cluster_name);

    let public_ips = factory.public_ips();
    let public_ip = match ctx.run(public_ips.get(&ids.public_ip)).await? {
        Some(existing) => existing,
        None => {
            let mut desired = PublicIpAddress {
                location: request.region.to_string(),
                tags: tags.clone(),
                sku: Some(Sku::new("Standard")),
                ..Default::default()
            };
            desired.properties.public_ip_allocation_method = Some("Static".to_string());
            desired.properties.public_ip_address_version = Some("IPv4".to_string());
            ctx.run(public_ips.create_or_update(&ids.public_ip, &desired)).await?
        }
    };

    let nics = factory.network_interfaces();
    let nic = match ctx.run(nics.get(&ids.nic)).await? {
        Some(existing) => existing,
        None => {
            let mut desired = NetworkInterface {
                location: request.region.to_string(),
                tags: tags.clone(),
                ..Default::default()
            };
            desired.properties.ip_configurations = vec![IpConfiguration {
                name: format!("{}-ip-config", names.base),
                properties: IpConfigurationProperties {
                    subnet: Some(SubResource::new(ids.vnet.child("subnets", first_subnet).as_str())),
                    public_ip_address: Some(SubResource::new(ids.public_ip.as_str())),
                    private_ip_allocation_method: Some("Dynamic".to_string()),
                    ..Default::default()
                },
            }];
            ctx.run(nics.create_or_update(&ids.nic, &desired)).await?
        }
    };

    let vms = factory.virtual_machines();
    if ctx.run(vms.get(&ids.vm)).await?.is_none() {
        let admin = request.config.admin_username.as_str();
        let mut desired = VirtualMachine {
            location: request.region.to_string(),
            tags: tags.clone(),
            ..Default::default()
        };
        let properties = &mut desired.properties;
        properties.hardware_profile.vm_size = vm_size.to_string();
        properties.storage_profile.image_reference = Some(image);
        properties.storage_profile.os_disk = OsDisk {
            name: Some(names.disk()),
            create_option: "FromImage".to_string(),
            disk_size_gb: Some(request.config.disk_size_gb),
            managed_disk: Some(ManagedDiskParameters {
                storage_account_type: Some("Standard_LRS".to_string()),
                ..Default::default()
            }),
            delete_option: None,
        };
        properties.os_profile = Some(OsProfile {
            computer_name: names.base.clone(),
            admin_username: admin.to_string(),
            custom_data: Some(request.spec.user_data.clone()),
            linux_configuration: Some(LinuxConfiguration {
                disable_password_authentication: true,
                ssh: Some(SshConfiguration {
                    public_keys: vec![SshPublicKey {
                        path: format!("/home/{admin}/.ssh/authorized_keys"),
                        key_data: throwaway_public_key()?,
                    }],
                }),
            }),
        });
        properties.network_profile.network_interfaces = vec![NetworkInterfaceReference {
            id: ids.nic.to_string(),
            properties: Some(NetworkInterfaceReferenceProperties {
                primary: Some(true),
                delete_option: None,
            }),
        }];
        info!(vm = %ids.vm.name(), size = vm_size, "Creating bastion VM");
        ctx.run(vms.create_or_update(&ids.vm, &desired)).await?;
    }

    let public_address = public_ip.properties.ip_address.clone();
    let configs = &nic.properties.ip_configurations;
    let private_ipv4 = configs
        .iter()
        .filter(|config| config.properties.private_ip_address_version.as_deref() != Some("IPv6"))
        .find_map(|config| config.properties.private_ip_address.clone());
    let private_ipv6 = configs
        .iter()
        .filter(|config| config.properties.private_ip_address_version.as_deref() == Some("IPv6"))
        .find_map(|config| config.properties.private_ip_address.clone());
    let (Some(public_ip), Some(private_ip)) = (public_address, private_ipv4) else {
        return Err(Error::requeue(
            Duration::from_secs(request.config.ready_retry_seconds),
            "bastion has no public or private address yet",
        ));
    };

    let subnets = factory.subnets();
    let mut worker_cidrs = Vec::with_capacity(nodes_subnets.len());
    for name in &nodes_subnets {
        let id = ids.vnet.child("subnets", name);
        let subnet = ctx
            .run(subnets.get(&id))
            .await?
            .ok_or_else(|| Error::MissingResource(format!("subnet {name}")))?;
        worker_cidrs.extend(subnet.properties.address_prefix);
    }

    let security_groups = factory.security_groups();
    let mut security_group = ctx
        .run(security_groups.get(&security_group_id))
        .await?
        .ok_or_else(|| Error::MissingResource(format!("security group {}", security_group_id.name())))?;
    let desired = desired_rules(
        &names,
        &RuleTargets {
            ingress: &ingress,
            private_ipv4: &private_ip,
            private_ipv6: private_ipv6.as_deref(),
            worker_cidrs: &worker_cidrs,
        },
    );
    if let Some(merged) = merge_rules(&security_group.properties.security_rules, &desired)? {
        security_group.properties.security_rules = merged;
        ctx.run(security_groups.create_or_update(&security_group_id, &security_group))
            .await?;
        info!(security_group = %security_group_id.name(), "Updated bastion rules");
    } else {
        debug!("Bastion rules are up to date");
    }

    Ok(BastionEndpoints {
        public_ip,
        private_ip,
    })
}

/// Removes the rules and objects of a bastion. Missing objects are skipped.
#[instrument(skip_all, fields(bastion = request.name, cluster = request.cluster_name))]
pub async fn delete(
    factory: &ClientFactory,
    ctx: &ReconcileContext,
    request: &BastionRequest<'_>,
) -> Result<()> {
    let names = BastionNames::new(request.cluster_name, request.name);
    let ids = Ids::new(factory, request, &names);

    if let Some(security_group_id) = &ids.security_group {
        let security_groups = factory.security_groups();
        if let Some(mut security_group) = ctx.run(security_groups.get(security_group_id)).await? {
            if let Some(left) = remove_rules(&security_group.properties.security_rules, &names.rules()) {
                security_group.properties.security_rules = left;
                ctx.run(security_groups.create_or_update(security_group_id, &security_group))
                    .await?;
            }
        }
    }

    ctx.run(factory.virtual_machines().delete(&ids.vm)).await?;
    ctx.run(factory.disks().delete(&ids.disk)).await?;
    ctx.run(factory.network_interfaces().delete(&ids.nic)).await?;
    ctx.run(factory.public_ips().delete(&ids.public_ip)).await?;
    info!("Bastion deleted");
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use azure_cloud::testing::{FakeArm, FakeBlobStore};
    use azure_config::api::{
        FlavorKind, ImageFlavor, ImageReference, MachineImageVersion, MachineImages,
        NetworkStatus, SecurityGroup, Subnet, VnetStatus,
    };
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::crds::{BastionIngressPolicy, Cluster, ClusterSpec, IpBlock};

    const SUB: &str = "sub";
    const TID: &str = "shoot--dev--a";
    const REGION: &str = "westeurope";

    fn group_id() -> String {
        format!("/subscriptions/{SUB}/resourceGroups/{TID}")
    }

    fn nsg_id() -> String {
        format!("{}/providers/Microsoft.Network/networkSecurityGroups/{TID}-workers", group_id())
    }

    fn seeded_arm() -> Arc<FakeArm> {
        let arm = Arc::new(FakeArm::new());
        arm.insert(&group_id(), json!({"location": REGION}));
        let vnet = format!("{}/providers/Microsoft.Network/virtualNetworks/{TID}", group_id());
        arm.insert(&vnet, json!({"location": REGION}));
        arm.insert(
            &format!("{vnet}/subnets/{TID}-nodes"),
            json!({"properties": {"addressPrefix": "10.250.0.0/19"}}),
        );
        arm.insert(
            &nsg_id(),
            json!({
                "location": REGION,
                "properties": {"securityRules": [{
                    "name": "allow-lb",
                    "properties": {
                        "protocol": "*", "sourcePortRange": "*", "destinationPortRange": "*",
                        "sourceAddressPrefix": "AzureLoadBalancer", "destinationAddressPrefix": "*",
                        "access": "Allow", "direction": "Inbound", "priority": 400
                    }
                }]}
            }),
        );
        arm
    }

    fn infrastructure() -> InfrastructureStatus {
        InfrastructureStatus {
            resource_group: TID.to_string(),
            networks: NetworkStatus {
                vnet: VnetStatus {
                    name: TID.to_string(),
                    resource_group: None,
                },
                subnets: vec![Subnet {
                    name: format!("{TID}-nodes"),
                    purpose: Purpose::Nodes,
                    zone: None,
                    migrated: false,
                }],
                ..Default::default()
            },
            security_groups: vec![SecurityGroup {
                purpose: Purpose::Nodes,
                name: format!("{TID}-workers"),
            }],
            ..Default::default()
        }
    }

    fn profile() -> CloudProfileConfig {
        CloudProfileConfig {
            machine_images: vec![MachineImages {
                name: "gardenlinux".to_string(),
                versions: ["1443.3.0", "1592.1.0"]
                    .into_iter()
                    .map(|version| MachineImageVersion {
                        version: version.to_string(),
                        flavors: vec![ImageFlavor {
                            reference: ImageReference::Urn(format!("sap:gardenlinux:greatest:{version}")),
                            skip_marketplace_agreement: false,
                            kind: FlavorKind::Legacy {
                                architecture: None,
                                accelerated_networking: false,
                            },
                        }],
                    })
                    .collect(),
            }],
            ..Default::default()
        }
    }

    fn cluster() -> ClusterView {
        Cluster::new(TID, ClusterSpec {
            cloud_profile: json!({}),
            seed: json!({}),
            shoot: json!({"status": {"technicalID": TID}}),
        })
        .view()
        .unwrap()
    }

    fn spec(cidrs: &[&str]) -> BastionSpec {
        BastionSpec {
            extension_type: "azure".to_string(),
            user_data: "I2Nsb3VkLWNvbmZpZw==".to_string(),
            ingress: cidrs
                .iter()
                .map(|cidr| BastionIngressPolicy {
                    ip_block: IpBlock {
                        cidr: (*cidr).to_string(),
                    },
                })
                .collect(),
            provider_config: None,
        }
    }

    fn factory(arm: &Arc<FakeArm>) -> ClientFactory {
        ClientFactory::with_transport(SUB, arm.clone(), Arc::new(FakeBlobStore::new()))
    }

    fn rules_of(arm: &FakeArm) -> Vec<(String, i64)> {
        arm.object(&nsg_id()).unwrap()["properties"]["securityRules"]
            .as_array()
            .unwrap()
            .iter()
            .map(|rule| {
                (
                    rule["name"].as_str().unwrap().to_string(),
                    rule["properties"]["priority"].as_i64().unwrap(),
                )
            })
            .collect()
    }

    #[tokio::test]
    async fn bastion_lifecycle() {
        let arm = seeded_arm();
        let factory = factory(&arm);
        let ctx = ReconcileContext::unbounded();
        let (infra, profile, cluster, config) =
            (infrastructure(), profile(), cluster(), BastionConfig::default());
        let spec = spec(&["213.69.151.253/24"]);
        let request = BastionRequest {
            name: "cli-xyz",
            cluster_name: TID,
            region: REGION,
            spec: &spec,
            infrastructure: &infra,
            cloud_profile: &profile,
            cluster: &cluster,
            config: &config,
        };
        let names = BastionNames::new(TID, "cli-xyz");

        let endpoints = reconcile(&factory, &ctx, &request).await.unwrap();
        assert!(endpoints.public_ip.starts_with("20.0.0."));
        assert!(endpoints.private_ip.starts_with("10.250.0."));

        let vm = arm
            .object(&format!("{}/providers/Microsoft.Compute/virtualMachines/{}", group_id(), names.base))
            .unwrap();
        assert_eq!(
            vm["properties"]["storageProfile"]["imageReference"]["version"],
            json!("1592.1.0")
        );
        assert_eq!(vm["properties"]["hardwareProfile"]["vmSize"], json!("Standard_B1s"));

        let rules = rules_of(&arm);
        assert_eq!(
            rules,
            vec![
                ("allow-lb".to_string(), 400),
                (names.rule_ingress_ipv4(), 401),
                (names.rule_egress_worker(), 402),
                (names.rule_deny_all(), 403),
            ]
        );
        let nsg = arm.object(&nsg_id()).unwrap();
        assert_eq!(
            nsg["properties"]["securityRules"][1]["properties"]["sourceAddressPrefix"],
            json!("213.69.151.0/24")
        );
        assert_eq!(
            nsg["properties"]["securityRules"][2]["properties"]["destinationAddressPrefix"],
            json!("10.250.0.0/19")
        );

        arm.clear_mutations();
        reconcile(&factory, &ctx, &request).await.unwrap();
        assert!(arm.mutations().is_empty());

        delete(&factory, &ctx, &request).await.unwrap();
        assert_eq!(rules_of(&arm), vec![("allow-lb".to_string(), 400)]);
        let leftovers: Vec<String> = arm
            .ids()
            .into_iter()
            .filter(|id| id.contains(&names.base.to_ascii_lowercase()))
            .collect();
        assert!(leftovers.is_empty(), "{leftovers:?}");

        delete(&factory, &ctx, &request).await.unwrap();
    }

    #[tokio::test]
    async fn invalid_cidr_fails_before_any_cloud_call() {
        let arm = seeded_arm();
        arm.fail_on("GET", "", 500, "InternalServerError", "no calls expected", None);
        let factory = factory(&arm);
        let (infra, profile, cluster, config) =
            (infrastructure(), profile(), cluster(), BastionConfig::default());
        let spec = spec(&["213.69.151.253/33"]);
        let request = BastionRequest {
            name: "cli-xyz",
            cluster_name: TID,
            region: REGION,
            spec: &spec,
            infrastructure: &infra,
            cloud_profile: &profile,
            cluster: &cluster,
            config: &config,
        };

        let err = reconcile(&factory, &ReconcileContext::unbounded(), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)), "{err}");
        assert!(arm.mutations().is_empty());
    }

    #[tokio::test]
    async fn missing_address_requeues() {
        let arm = seeded_arm();
        let names = BastionNames::new(TID, "cli-xyz");
        arm.insert(
            &format!(
                "{}/providers/Microsoft.Network/publicIPAddresses/{}",
                group_id(),
                names.public_ip()
            ),
            json!({"location": REGION, "properties": {}}),
        );
        let factory = factory(&arm);
        let (infra, profile, cluster, config) =
            (infrastructure(), profile(), cluster(), BastionConfig::default());
        let spec = spec(&["10.0.0.0/8"]);
        let request = BastionRequest {
            name: "cli-xyz",
            cluster_name: TID,
            region: REGION,
            spec: &spec,
            infrastructure: &infra,
            cloud_profile: &profile,
            cluster: &cluster,
            config: &config,
        };

        let err = reconcile(&factory, &ReconcileContext::unbounded(), &request)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Requeue { after, .. } if after == Duration::from_secs(5)));
    }
}
