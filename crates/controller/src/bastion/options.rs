//! Names, ingress CIDRs and image of a bastion.

use azure_cloud::resources::VmImageReference;
use azure_config::api::{CloudProfileConfig, ImageReference};
use azure_config::helper::{find_image_in_cloud_profile, machine_type_capabilities};
use azure_config::ARCHITECTURE_AMD64;
use ipnetwork::IpNetwork;

use crate::crds::cluster::provider_machine_type;
use crate::crds::{BastionSpec, ClusterView};
use crate::error::{Error, Result};
use crate::worker::hash::short_hash;

/// Bytes of `<cluster>-<bastion>` kept in the base name.
const MAX_PREFIX_LEN: usize = 33;

/// Base name of all objects of a bastion: `<cluster>-<bastion>` cut to 33
/// bytes, then `-bastion-` and a hash of the uncut name.
#[must_use]
pub fn generate_base_name(cluster_name: &str, bastion_name: &str) -> String {
    let full = format!("{cluster_name}-{bastion_name}");
    let mut end = full.len().min(MAX_PREFIX_LEN);
    while !full.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}-bastion-{}", &full[..end], short_hash(full.as_bytes()))
}

/// Ingress CIDRs split by family, in network form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngressCidrs {
    pub ipv4: Vec<String>,
    pub ipv6: Vec<String>,
}

/// Parses the ingress CIDRs of `spec` and clears their host bits.
pub fn ingress_cidrs(spec: &BastionSpec) -> Result<IngressCidrs> {
    let mut cidrs = IngressCidrs::default();
    for policy in &spec.ingress {
        let cidr = policy.ip_block.cidr.trim();
        let network: IpNetwork = cidr
            .parse()
            .map_err(|err| Error::Validation(format!("invalid ingress CIDR {cidr:?}: {err}")))?;
        let normalized = IpNetwork::new(network.network(), network.prefix())
            .map_err(|err| Error::Validation(format!("invalid ingress CIDR {cidr:?}: {err}")))?
            .to_string();
        let family = if network.is_ipv4() {
            &mut cidrs.ipv4
        } else {
            &mut cidrs.ipv6
        };
        if !family.contains(&normalized) {
            family.push(normalized);
        }
    }
    Ok(cidrs)
}

/// Object names of a bastion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BastionNames {
    pub base: String,
}

impl BastionNames {
    #[must_use]
    pub fn new(cluster_name: &str, bastion_name: &str) -> Self {
        Self {
            base: generate_base_name(cluster_name, bastion_name),
        }
    }

    #[must_use]
    pub fn virtual_machine(&self) -> &str {
        &self.base
    }

    #[must_use]
    pub fn nic(&self) -> String {
        format!("{}-nic", self.base)
    }

    #[must_use]
    pub fn disk(&self) -> String {
        format!("{}-disk", self.base)
    }

    #[must_use]
    pub fn public_ip(&self) -> String {
        format!("{}-public-ip", self.base)
    }

    #[must_use]
    pub fn rule_ingress_ipv4(&self) -> String {
        format!("{}-allow-ssh-ipv4", self.base)
    }

    #[must_use]
    pub fn rule_ingress_ipv6(&self) -> String {
        format!("{}-allow-ssh-ipv6", self.base)
    }

    #[must_use]
    pub fn rule_egress_worker(&self) -> String {
        format!("{}-egress-worker", self.base)
    }

    #[must_use]
    pub fn rule_deny_all(&self) -> String {
        format!("{}-deny-all", self.base)
    }

    #[must_use]
    pub fn rules(&self) -> [String; 4] {
        [
            self.rule_ingress_ipv4(),
            self.rule_ingress_ipv6(),
            self.rule_egress_worker(),
            self.rule_deny_all(),
        ]
    }
}

fn version_key(version: &str) -> Vec<u64> {
    version
        .split(['.', '-'])
        .map(|part| part.parse().unwrap_or(0))
        .collect()
}

/// Image of the bastion VM: the cloud profile's bastion image, or the first
/// image of the profile with an `amd64` flavor. Without a version the
/// highest one wins.
pub fn bastion_image(
    cluster: &ClusterView,
    profile: &CloudProfileConfig,
    machine_type: &str,
) -> Result<VmImageReference> {
    let declared = cluster
        .machine_type(machine_type)
        .and_then(|machine_type| machine_type.capabilities.as_ref());
    let capabilities =
        machine_type_capabilities(declared, provider_machine_type(profile, machine_type));
    let architecture = cluster
        .machine_type(machine_type)
        .and_then(|machine_type| machine_type.architecture.as_deref())
        .unwrap_or(ARCHITECTURE_AMD64);
    let definitions = cluster.capability_definitions();

    let wanted = cluster
        .cloud_profile
        .spec
        .bastion
        .as_ref()
        .and_then(|bastion| bastion.machine_image.as_ref());

    for images in &profile.machine_images {
        if wanted.is_some_and(|image| image.name != images.name) {
            continue;
        }
        let mut versions: Vec<&str> = images
            .versions
            .iter()
            .map(|version| version.version.as_str())
            .filter(|version| {
                wanted
                    .and_then(|image| image.version.as_deref())
                    .is_none_or(|wanted| wanted == *version)
            })
            .collect();
        versions.sort_by_key(|version| std::cmp::Reverse(version_key(version)));

        for version in versions {
            if let Ok(image) = find_image_in_cloud_profile(
                profile,
                &images.name,
                version,
                Some(architecture),
                &capabilities,
                definitions,
            ) {
                return vm_image_reference(&image.reference);
            }
        }
    }
    Err(Error::Validation(match wanted {
        Some(image) => format!("bastion image {:?} not found in cloud profile", image.name),
        None => format!("cloud profile has no {architecture} image for the bastion"),
    }))
}

/// Compute API form of an image reference.
pub fn vm_image_reference(reference: &ImageReference) -> Result<VmImageReference> {
    let mut image = VmImageReference::default();
    match reference {
        ImageReference::Urn(urn) => {
            let parts: Vec<&str> = urn.split(':').collect();
            let [publisher, offer, sku, version] = parts.as_slice() else {
                return Err(Error::Validation(format!("invalid image URN {urn:?}")));
            };
            image.publisher = Some((*publisher).to_string());
            image.offer = Some((*offer).to_string());
            image.sku = Some((*sku).to_string());
            image.version = Some((*version).to_string());
        }
        ImageReference::Id(id) => image.id = Some(id.clone()),
        ImageReference::CommunityGallery(id) => image.community_gallery_image_id = Some(id.clone()),
        ImageReference::SharedGallery(id) => image.shared_gallery_image_id = Some(id.clone()),
    }
    Ok(image)
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::crds::{BastionIngressPolicy, IpBlock};

    fn spec(cidrs: &[&str]) -> BastionSpec {
        BastionSpec {
            extension_type: "azure".to_string(),
            user_data: String::new(),
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

    #[test]
    fn base_name_of_short_names() {
        assert_eq!(
            generate_base_name("clusterName", "shortName"),
            "clusterName-shortName-bastion-79641"
        );
    }

    #[test]
    fn base_name_is_truncated() {
        let long = format!("LetsExceed63LenLimit{}", "0123456789".repeat(6));
        assert_eq!(
            generate_base_name("clusterName", &long),
            "clusterName-LetsExceed63LenLimit0-bastion-139c4"
        );
    }

    #[test]
    fn cidrs_are_normalized_and_split() {
        let cidrs = ingress_cidrs(&spec(&["213.69.151.253/24", "2001:db8::1/64", "213.69.151.0/24"]))
            .unwrap();
        assert_eq!(cidrs.ipv4, vec!["213.69.151.0/24".to_string()]);
        assert_eq!(cidrs.ipv6, vec!["2001:db8::/64".to_string()]);
    }

    #[test]
    fn invalid_cidr_is_rejected() {
        assert!(matches!(
            ingress_cidrs(&spec(&["300.1.1.1/24"])),
            Err(Error::Validation(_))
        ));
        assert!(ingress_cidrs(&spec(&["10.0.0.0/33"])).is_err());
    }

    #[test]
    fn urns_split_into_marketplace_fields() {
        let image = vm_image_reference(&ImageReference::Urn(
            "sap:gardenlinux:greatest:1592.1.0".to_string(),
        ))
        .unwrap();
        assert_eq!(image.publisher.as_deref(), Some("sap"));
        assert_eq!(image.version.as_deref(), Some("1592.1.0"));
        assert!(vm_image_reference(&ImageReference::Urn("sap:gardenlinux".to_string())).is_err());
    }

    #[test]
    fn versions_compare_numerically() {
        assert!(version_key("1592.10.0") > version_key("1592.9.0"));
    }
}
