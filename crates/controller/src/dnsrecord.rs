//! DNS record sets in Azure DNS zones.

use azure_cloud::resources::{
    AaaaRecord, ARecord, CnameRecord, RecordSet, RecordSetProperties, TxtRecord,
};
use azure_cloud::{ClientFactory, ResourceId};
use tracing::{debug, info, instrument};

use crate::context::ReconcileContext;
use crate::crds::{DnsRecordSpec, RecordType};
use crate::error::{Error, Result};

/// Name of the record set at the zone apex.
const APEX: &str = "@";

/// Longest string of a TXT record.
const TXT_CHUNK: usize = 255;

/// A hosted zone given as `<resourceGroup>/<zone>`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZoneRef {
    pub resource_group: String,
    pub name: String,
}

impl ZoneRef {
    pub fn parse(zone: &str) -> Result<Self> {
        match zone.split_once('/') {
            Some((group, name)) if !group.is_empty() && !name.is_empty() && !name.contains('/') => {
                Ok(Self {
                    resource_group: group.to_string(),
                    name: name.trim_end_matches('.').to_string(),
                })
            }
            _ => Err(Error::Validation(format!(
                "zone {zone:?} is not of the form <resourceGroup>/<zone>"
            ))),
        }
    }
}

/// Name of `fqdn` relative to `zone`; `@` for the apex.
pub fn relative_name(fqdn: &str, zone: &str) -> Result<String> {
    let fqdn = fqdn.trim_end_matches('.');
    if fqdn.eq_ignore_ascii_case(zone) {
        return Ok(APEX.to_string());
    }
    let split = fqdn.len().checked_sub(zone.len() + 1);
    match split {
        Some(at)
            if fqdn.is_char_boundary(at)
                && fqdn[at..].starts_with('.')
                && fqdn[at + 1..].eq_ignore_ascii_case(zone) =>
        {
            Ok(fqdn[..at].to_string())
        }
        _ => Err(Error::Validation(format!(
            "record {fqdn:?} is not inside zone {zone:?}"
        ))),
    }
}

/// ID of the record set of `spec` in `zone`.
pub fn record_set_id(subscription: &str, zone: &ZoneRef, spec: &DnsRecordSpec) -> Result<ResourceId> {
    let relative = relative_name(&spec.name, &zone.name)?;
    Ok(ResourceId::resource(
        subscription,
        &zone.resource_group,
        "Microsoft.Network/dnsZones",
        &zone.name,
    )
    .child(spec.record_type.as_str(), &relative))
}

fn txt_chunks(value: &str) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut rest = value;
    while rest.len() > TXT_CHUNK {
        let mut at = TXT_CHUNK;
        while !rest.is_char_boundary(at) {
            at -= 1;
        }
        chunks.push(rest[..at].to_string());
        rest = &rest[at..];
    }
    chunks.push(rest.to_string());
    chunks
}

/// Record set for `spec`, with `default_ttl` when the record sets no TTL.
pub fn desired_record_set(spec: &DnsRecordSpec, default_ttl: i64) -> Result<RecordSet> {
    if spec.values.is_empty() {
        return Err(Error::Validation(format!("record {} has no values", spec.name)));
    }
    let mut properties = RecordSetProperties {
        ttl: spec.ttl.unwrap_or(default_ttl),
        ..Default::default()
    };
    match spec.record_type {
        RecordType::A => {
            properties.a_records = spec
                .values
                .iter()
                .map(|value| ARecord {
                    ipv4_address: value.clone(),
                })
                .collect();
        }
        RecordType::Aaaa => {
            properties.aaaa_records = spec
                .values
                .iter()
                .map(|value| AaaaRecord {
                    ipv6_address: value.clone(),
                })
                .collect();
        }
        RecordType::Cname => {
            let [target] = spec.values.as_slice() else {
                return Err(Error::Validation(format!(
                    "CNAME record {} needs exactly one value",
                    spec.name
                )));
            };
            properties.cname_record = Some(CnameRecord {
                cname: target.clone(),
            });
        }
        RecordType::Txt => {
            properties.txt_records = spec
                .values
                .iter()
                .map(|value| TxtRecord {
                    value: txt_chunks(value),
                })
                .collect();
        }
    }
    Ok(RecordSet {
        id: None,
        properties,
    })
}

fn zone_of(spec: &DnsRecordSpec) -> Result<ZoneRef> {
    let zone = spec
        .zone
        .as_deref()
        .ok_or_else(|| Error::Validation(format!("record {} has no zone", spec.name)))?;
    ZoneRef::parse(zone)
}

/// Upserts the record set of `spec` and returns the zone it lives in.
#[instrument(skip_all, fields(record = %spec.name, kind = spec.record_type.as_str()))]
pub async fn reconcile(
    factory: &ClientFactory,
    ctx: &ReconcileContext,
    spec: &DnsRecordSpec,
    default_ttl: i64,
) -> Result<ZoneRef> {
    let zone = zone_of(spec)?;
    let id = record_set_id(factory.subscription_id(), &zone, spec)?;
    let desired = desired_record_set(spec, default_ttl)?;
    let client = factory.record_sets();

    let existing = ctx.run(client.get(&id)).await?;
    if existing.is_some_and(|current| current.properties == desired.properties) {
        debug!("Record set is up to date");
        return Ok(zone);
    }
    ctx.run(client.create_or_update(&id, &desired)).await?;
    info!(zone = %zone.name, "Updated record set");
    Ok(zone)
}

/// Deletes the record set of `spec`. A missing record set is not an error.
#[instrument(skip_all, fields(record = %spec.name, kind = spec.record_type.as_str()))]
pub async fn delete(factory: &ClientFactory, ctx: &ReconcileContext, spec: &DnsRecordSpec) -> Result<()> {
    let zone = zone_of(spec)?;
    let id = record_set_id(factory.subscription_id(), &zone, spec)?;
    ctx.run(factory.record_sets().delete(&id)).await
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use azure_cloud::testing::{FakeArm, FakeBlobStore};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::crds::SecretReference;

    fn spec(name: &str, record_type: RecordType, values: &[&str]) -> DnsRecordSpec {
        DnsRecordSpec {
            extension_type: "azure-dns".to_string(),
            secret_ref: SecretReference::default(),
            region: None,
            zone: Some("dns-rg/example.com".to_string()),
            name: name.to_string(),
            record_type,
            values: values.iter().map(|value| (*value).to_string()).collect(),
            ttl: None,
        }
    }

    #[test]
    fn relative_names() {
        assert_eq!(relative_name("api.shoot.example.com", "example.com").unwrap(), "api.shoot");
        assert_eq!(relative_name("example.com.", "example.com").unwrap(), "@");
        assert!(relative_name("api.example.org", "example.com").is_err());
        assert!(relative_name("notexample.com", "example.com").is_err());
    }

    #[test]
    fn zones_need_a_resource_group() {
        assert_eq!(
            ZoneRef::parse("dns-rg/example.com").unwrap(),
            ZoneRef {
                resource_group: "dns-rg".to_string(),
                name: "example.com".to_string()
            }
        );
        assert!(ZoneRef::parse("example.com").is_err());
        assert!(ZoneRef::parse("/example.com").is_err());
    }

    #[test]
    fn long_txt_values_are_chunked() {
        let value = "x".repeat(600);
        let record = desired_record_set(&spec("t.example.com", RecordType::Txt, &[&value]), 120).unwrap();
        let chunks = &record.properties.txt_records[0].value;
        assert_eq!(chunks.iter().map(String::len).collect::<Vec<_>>(), vec![255, 255, 90]);
    }

    #[test]
    fn cname_takes_one_value() {
        assert!(desired_record_set(&spec("c.example.com", RecordType::Cname, &["a", "b"]), 120).is_err());
        let record = desired_record_set(&spec("c.example.com", RecordType::Cname, &["lb.example.net"]), 60)
            .unwrap();
        assert_eq!(record.properties.ttl, 60);
        assert_eq!(record.properties.cname_record.unwrap().cname, "lb.example.net");
    }

    #[tokio::test]
    async fn upsert_and_delete() {
        let arm = Arc::new(FakeArm::new());
        let factory = ClientFactory::with_transport("sub", arm.clone(), Arc::new(FakeBlobStore::new()));
        let ctx = ReconcileContext::unbounded();
        let mut record = spec("api.shoot.example.com", RecordType::A, &["20.1.2.3"]);

        let zone = reconcile(&factory, &ctx, &record, 120).await.unwrap();
        assert_eq!(zone.resource_group, "dns-rg");
        let id = "/subscriptions/sub/resourceGroups/dns-rg/providers/Microsoft.Network/dnsZones/example.com/A/api.shoot";
        let stored = arm.object(id).unwrap();
        assert_eq!(stored["properties"]["TTL"], 120);
        assert_eq!(stored["properties"]["ARecords"][0]["ipv4Address"], "20.1.2.3");

        arm.clear_mutations();
        reconcile(&factory, &ctx, &record, 120).await.unwrap();
        assert!(arm.mutations().is_empty());

        record.values = vec!["20.1.2.4".to_string()];
        record.ttl = Some(300);
        reconcile(&factory, &ctx, &record, 120).await.unwrap();
        assert_eq!(arm.object(id).unwrap()["properties"]["TTL"], 300);

        delete(&factory, &ctx, &record).await.unwrap();
        assert!(arm.object(id).is_none());
        delete(&factory, &ctx, &record).await.unwrap();
    }
}
