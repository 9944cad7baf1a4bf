//! Security rules of a bastion on the worker security group.

use std::collections::BTreeSet;

use azure_cloud::resources::{SecurityRule, SecurityRuleProperties};

use super::options::{BastionNames, IngressCidrs};
use crate::error::{Error, Result};

const SSH_PORT: &str = "22";

const PRIORITY_INGRESS_IPV4: i32 = 400;
const PRIORITY_INGRESS_IPV6: i32 = 401;
const PRIORITY_EGRESS_WORKER: i32 = 402;
const PRIORITY_DENY_ALL: i32 = 403;

/// Highest priority a security rule may have.
pub const MAX_PRIORITY: i32 = 4096;

/// Addresses the rules are built from.
#[derive(Debug, Clone, Copy)]
pub struct RuleTargets<'a> {
    pub ingress: &'a IngressCidrs,
    pub private_ipv4: &'a str,
    pub private_ipv6: Option<&'a str>,
    pub worker_cidrs: &'a [String],
}

fn rule(name: String, properties: SecurityRuleProperties) -> SecurityRule {
    SecurityRule { name, properties }
}

fn ssh(direction: &str, priority: i32, description: &str) -> SecurityRuleProperties {
    SecurityRuleProperties {
        protocol: "Tcp".to_string(),
        source_port_range: "*".to_string(),
        destination_port_range: Some(SSH_PORT.to_string()),
        access: "Allow".to_string(),
        direction: direction.to_string(),
        priority,
        description: Some(description.to_string()),
        ..Default::default()
    }
}

fn prefixes(values: &[String]) -> (Option<String>, Vec<String>) {
    match values {
        [single] => (Some(single.clone()), Vec::new()),
        many => (None, many.to_vec()),
    }
}

/// Rules a bastion needs.
#[must_use]
pub fn desired_rules(names: &BastionNames, targets: &RuleTargets<'_>) -> Vec<SecurityRule> {
    let mut rules = Vec::with_capacity(4);

    if !targets.ingress.ipv4.is_empty() {
        let mut properties = ssh("Inbound", PRIORITY_INGRESS_IPV4, "SSH access to the bastion over IPv4");
        (properties.source_address_prefix, properties.source_address_prefixes) =
            prefixes(&targets.ingress.ipv4);
        properties.destination_address_prefix = Some(targets.private_ipv4.to_string());
        rules.push(rule(names.rule_ingress_ipv4(), properties));
    }

    let private_ipv6 = targets.private_ipv6.filter(|_| !targets.ingress.ipv6.is_empty());
    if let Some(private_ipv6) = private_ipv6 {
        let mut properties = ssh("Inbound", PRIORITY_INGRESS_IPV6, "SSH access to the bastion over IPv6");
        (properties.source_address_prefix, properties.source_address_prefixes) =
            prefixes(&targets.ingress.ipv6);
        properties.destination_address_prefix = Some(private_ipv6.to_string());
        rules.push(rule(names.rule_ingress_ipv6(), properties));
    }

    let mut egress = ssh("Outbound", PRIORITY_EGRESS_WORKER, "SSH from the bastion to the workers");
    egress.source_address_prefix = Some(targets.private_ipv4.to_string());
    (egress.destination_address_prefix, egress.destination_address_prefixes) =
        prefixes(targets.worker_cidrs);
    rules.push(rule(names.rule_egress_worker(), egress));

    rules.push(rule(
        names.rule_deny_all(),
        SecurityRuleProperties {
            protocol: "*".to_string(),
            source_port_range: "*".to_string(),
            destination_port_range: Some("*".to_string()),
            source_address_prefix: Some(targets.private_ipv4.to_string()),
            destination_address_prefix: Some("*".to_string()),
            access: "Deny".to_string(),
            direction: "Outbound".to_string(),
            priority: PRIORITY_DENY_ALL,
            description: Some("Deny all other traffic from the bastion".to_string()),
            ..Default::default()
        },
    ));
    rules
}

fn address_set(single: Option<&String>, many: &[String]) -> BTreeSet<String> {
    single.into_iter().chain(many).cloned().collect()
}

/// Same source and destination prefixes.
fn equivalent(existing: &SecurityRule, desired: &SecurityRule) -> bool {
    let (a, b) = (&existing.properties, &desired.properties);
    address_set(a.source_address_prefix.as_ref(), &a.source_address_prefixes)
        == address_set(b.source_address_prefix.as_ref(), &b.source_address_prefixes)
        && address_set(a.destination_address_prefix.as_ref(), &a.destination_address_prefixes)
            == address_set(b.destination_address_prefix.as_ref(), &b.destination_address_prefixes)
}

/// Merges `desired` into `existing`.
///
/// Returns `None` when every desired rule is already present with the same
/// prefixes. Otherwise rules are replaced by name and each desired rule gets
/// the first free priority at or above its own, probing against every
/// priority booked in `existing`. Fails when no priority up to
/// [`MAX_PRIORITY`] is free.
pub fn merge_rules(
    existing: &[SecurityRule],
    desired: &[SecurityRule],
) -> Result<Option<Vec<SecurityRule>>> {
    let up_to_date = desired.iter().all(|wanted| {
        existing
            .iter()
            .any(|rule| rule.name == wanted.name && equivalent(rule, wanted))
    });
    if up_to_date {
        return Ok(None);
    }

    let mut booked: BTreeSet<i32> = existing.iter().map(|rule| rule.properties.priority).collect();
    let mut merged: Vec<SecurityRule> = existing
        .iter()
        .filter(|rule| !desired.iter().any(|wanted| wanted.name == rule.name))
        .cloned()
        .collect();
    for wanted in desired {
        let mut rule = wanted.clone();
        while booked.contains(&rule.properties.priority) {
            rule.properties.priority += 1;
        }
        if rule.properties.priority > MAX_PRIORITY {
            return Err(Error::Validation(format!(
                "no free security rule priority for {} at or above {}",
                rule.name, wanted.properties.priority
            )));
        }
        booked.insert(rule.properties.priority);
        merged.push(rule);
    }
    Ok(Some(merged))
}

/// Removes the named rules. Returns `None` when none of them exists.
#[must_use]
pub fn remove_rules(existing: &[SecurityRule], names: &[String]) -> Option<Vec<SecurityRule>> {
    if !existing.iter().any(|rule| names.contains(&rule.name)) {
        return None;
    }
    Some(
        existing
            .iter()
            .filter(|rule| !names.contains(&rule.name))
            .cloned()
            .collect(),
    )
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    fn named(name: &str, priority: i32, source: &str) -> SecurityRule {
        SecurityRule {
            name: name.to_string(),
            properties: SecurityRuleProperties {
                protocol: "Tcp".to_string(),
                source_port_range: "*".to_string(),
                source_address_prefix: Some(source.to_string()),
                destination_address_prefix: Some("10.250.0.4".to_string()),
                access: "Allow".to_string(),
                direction: "Inbound".to_string(),
                priority,
                ..Default::default()
            },
        }
    }

    fn priorities(rules: &[SecurityRule]) -> Vec<(&str, i32)> {
        rules
            .iter()
            .map(|rule| (rule.name.as_str(), rule.properties.priority))
            .collect()
    }

    #[test]
    fn merge_skips_past_booked_priorities() {
        let existing = vec![
            named("default", 50, "*"),
            named("r1", 100, "1.1.1.1/32"),
            named("r2", 200, "1.1.1.1/32"),
        ];
        let desired = vec![named("r1", 100, "2.2.2.2/32"), named("r2", 200, "2.2.2.2/32")];

        let merged = merge_rules(&existing, &desired).unwrap().unwrap();
        assert_eq!(
            priorities(&merged),
            vec![("default", 50), ("r1", 101), ("r2", 201)]
        );
    }

    #[test]
    fn priorities_stop_at_the_maximum() {
        let existing = vec![
            named("top-4095", 4095, "*"),
            named("top-4096", MAX_PRIORITY, "*"),
        ];
        let err = merge_rules(&existing, &[named("r1", 4095, "2.2.2.2/32")]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));

        let merged = merge_rules(&existing[1..], &[named("r1", 4095, "2.2.2.2/32")])
            .unwrap()
            .unwrap();
        assert_eq!(
            priorities(&merged),
            vec![("top-4096", MAX_PRIORITY), ("r1", 4095)]
        );
    }

    #[test]
    fn valid_rules_need_no_update() {
        let existing = vec![named("default", 50, "*"), named("r1", 105, "1.1.1.1/32")];
        assert_eq!(merge_rules(&existing, &[named("r1", 100, "1.1.1.1/32")]).unwrap(), None);
    }

    #[test]
    fn merged_priorities_are_unique() {
        let names = BastionNames::new("shoot--dev--a", "bastion");
        let ingress = IngressCidrs {
            ipv4: vec!["213.69.151.0/24".to_string()],
            ipv6: vec!["2001:db8::/64".to_string()],
        };
        let workers = vec!["10.250.0.0/19".to_string(), "10.250.32.0/19".to_string()];
        let desired = desired_rules(
            &names,
            &RuleTargets {
                ingress: &ingress,
                private_ipv4: "10.250.0.4",
                private_ipv6: Some("fd00::4"),
                worker_cidrs: &workers,
            },
        );
        assert_eq!(desired.len(), 4);

        let existing = vec![
            named("other-400", 400, "*"),
            named("other-401", 401, "*"),
            named("other-403", 403, "*"),
        ];
        let merged = merge_rules(&existing, &desired).unwrap().unwrap();

        let unique: BTreeSet<i32> = merged.iter().map(|rule| rule.properties.priority).collect();
        assert_eq!(unique.len(), merged.len());
        for rule in &desired {
            assert!(merged.iter().any(|merged| merged.name == rule.name));
        }
        assert_eq!(merge_rules(&merged, &desired).unwrap(), None);
    }

    #[test]
    fn ipv6_rule_needs_both_sides() {
        let names = BastionNames::new("c", "b");
        let ingress = IngressCidrs {
            ipv4: vec!["1.2.3.0/24".to_string()],
            ipv6: vec!["2001:db8::/64".to_string()],
        };
        let rules = desired_rules(
            &names,
            &RuleTargets {
                ingress: &ingress,
                private_ipv4: "10.250.0.4",
                private_ipv6: None,
                worker_cidrs: &["10.250.0.0/16".to_string()],
            },
        );
        let found: Vec<&str> = rules.iter().map(|rule| rule.name.as_str()).collect();
        assert_eq!(
            found,
            vec![
                names.rule_ingress_ipv4().as_str(),
                names.rule_egress_worker().as_str(),
                names.rule_deny_all().as_str()
            ]
        );
    }

    #[test]
    fn removal_keeps_unrelated_rules() {
        let existing = vec![named("default", 50, "*"), named("r1", 100, "*")];
        let left = remove_rules(&existing, &["r1".to_string()]).unwrap();
        assert_eq!(priorities(&left), vec![("default", 50)]);
        assert_eq!(remove_rules(&left, &["r1".to_string()]), None);
    }
}
