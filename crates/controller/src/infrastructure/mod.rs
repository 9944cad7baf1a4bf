//! Infrastructure reconciler.
//!
//! Converges resource group, virtual network, route table, security group,
//! availability set, NAT gateways with their public IPs, and subnets of one
//! shoot. Every owned object is recorded in the [`InfrastructureState`]
//! ledger, which drives cleanup of objects that are no longer desired.

pub mod desired;
mod flow;

use azure_cloud::ClientFactory;
use azure_config::api::{
    CloudProfileConfig, InfrastructureConfig, InfrastructureState, InfrastructureStatus,
};
use tracing::{info, instrument, warn};

use crate::classify::ErrorKind;
use crate::config::RetryConfig;
use crate::context::ReconcileContext;
use crate::error::{determine_error, Error, Result};

/// Key in `InfrastructureState.data` counting consecutive dependency failures.
pub const DEPENDENCY_RETRIES_KEY: &str = "dependencyRetries";

/// Inputs of one infrastructure reconcile.
#[derive(Debug, Clone)]
pub struct InfrastructureRequest<'a> {
    pub technical_id: &'a str,
    pub region: &'a str,
    pub config: &'a InfrastructureConfig,
    pub cloud_profile: &'a CloudProfileConfig,
    pub previous_status: Option<&'a InfrastructureStatus>,
    /// The shoot asked to move from availability sets to VMOs.
    pub migrating_to_vmo: bool,
}

/// Brings the cloud in line with `request` and returns the observed status.
///
/// `state` is updated in place, also on failure, so the caller can persist
/// what was created so far.
#[instrument(skip_all, fields(technical_id = request.technical_id))]
pub async fn reconcile(
    factory: &ClientFactory,
    ctx: &ReconcileContext,
    request: &InfrastructureRequest<'_>,
    state: &mut InfrastructureState,
    retry: &RetryConfig,
) -> Result<InfrastructureStatus> {
    let result = flow::Flow::new(factory, ctx, request, state).reconcile().await;
    settle(result, state, retry)
}

/// Deletes every object recorded in `state`, and the shoot's resource group
/// unless it was provided by the user.
#[instrument(skip_all, fields(technical_id = request.technical_id))]
pub async fn delete(
    factory: &ClientFactory,
    ctx: &ReconcileContext,
    request: &InfrastructureRequest<'_>,
    state: &mut InfrastructureState,
    retry: &RetryConfig,
) -> Result<()> {
    let result = async {
        flow::delete_all(factory, ctx, state).await?;
        if request.config.resource_group.is_none() {
            let id = factory.resource_group_id(request.technical_id);
            ctx.run(factory.resource_groups().delete(&id)).await?;
        }
        info!("Infrastructure deleted");
        Ok::<(), Error>(())
    }
    .await;
    settle(result, state, retry)
}

/// Applies the dependency retry budget to the outcome of a pass.
fn settle<T>(result: Result<T>, state: &mut InfrastructureState, retry: &RetryConfig) -> Result<T> {
    let err = match result {
        Ok(value) => {
            state.data.remove(DEPENDENCY_RETRIES_KEY);
            return Ok(value);
        }
        Err(err) => determine_error(err, &[]),
    };
    if err.kind() != Some(ErrorKind::Dependencies) {
        return Err(err);
    }

    let attempts = state
        .data
        .get(DEPENDENCY_RETRIES_KEY)
        .and_then(|count| count.parse::<u32>().ok())
        .unwrap_or(0)
        + 1;
    if attempts > retry.dependency_budget {
        warn!(attempts, error = %err, "Dependency retry budget exhausted");
        state.data.remove(DEPENDENCY_RETRIES_KEY);
        return Err(Error::BudgetExhausted {
            attempts: attempts - 1,
            source: Box::new(err),
        });
    }
    state
        .data
        .insert(DEPENDENCY_RETRIES_KEY.to_string(), attempts.to_string());
    Err(Error::requeue(
        retry.dependency_backoff(attempts),
        err.to_string(),
    ))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use azure_cloud::testing::{FakeArm, FakeBlobStore, Mutation};
    use azure_config::api::{
        AzureResource, DomainCount, NatGatewayConfig, NetworkConfig, NetworkLayout, VnetConfig,
        ZoneConfig, ZonedNatGatewayConfig,
    };
    use pretty_assertions::assert_eq;

    use super::*;

    const SUB: &str = "sub";
    const TID: &str = "shoot--dev--a";

    fn factory(arm: &Arc<FakeArm>) -> ClientFactory {
        ClientFactory::with_transport(SUB, arm.clone(), Arc::new(FakeBlobStore::new()))
    }

    fn profile() -> CloudProfileConfig {
        CloudProfileConfig {
            count_fault_domains: vec![DomainCount {
                region: "westeurope".to_string(),
                count: 2,
            }],
            count_update_domains: vec![DomainCount {
                region: "westeurope".to_string(),
                count: 5,
            }],
            ..Default::default()
        }
    }

    fn zone(name: i32, cidr: &str, nat: bool) -> ZoneConfig {
        ZoneConfig {
            name,
            cidr: cidr.to_string(),
            nat_gateway: nat.then(|| ZonedNatGatewayConfig {
                enabled: true,
                ..Default::default()
            }),
            service_endpoints: vec![],
        }
    }

    fn zoned_config(zones: Vec<ZoneConfig>) -> InfrastructureConfig {
        InfrastructureConfig {
            zoned: true,
            networks: NetworkConfig {
                vnet: VnetConfig {
                    cidr: Some("10.250.0.0/16".to_string()),
                    ..Default::default()
                },
                zones,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn request<'a>(
        config: &'a InfrastructureConfig,
        profile: &'a CloudProfileConfig,
        previous: Option<&'a InfrastructureStatus>,
    ) -> InfrastructureRequest<'a> {
        InfrastructureRequest {
            technical_id: TID,
            region: "westeurope",
            config,
            cloud_profile: profile,
            previous_status: previous,
            migrating_to_vmo: false,
        }
    }

    #[tokio::test]
    async fn second_reconcile_of_zoned_network_changes_nothing() {
        let arm = Arc::new(FakeArm::new());
        let factory = factory(&arm);
        let ctx = ReconcileContext::unbounded();
        let config = zoned_config(vec![
            zone(1, "10.250.0.0/24", true),
            zone(2, "10.250.1.0/24", false),
        ]);
        let profile = profile();
        let mut state = InfrastructureState::default();
        let retry = RetryConfig::default();

        let status = reconcile(&factory, &ctx, &request(&config, &profile, None), &mut state, &retry)
            .await
            .unwrap();
        assert_eq!(status.networks.layout, NetworkLayout::MultipleSubnet);
        let subnet_names: Vec<_> = status.networks.subnets.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(subnet_names, vec![format!("{TID}-nodes-z1"), format!("{TID}-nodes-z2")]);
        assert!(status.availability_sets.is_empty());
        assert!(arm
            .object(&format!(
                "/subscriptions/{SUB}/resourceGroups/{TID}/providers/Microsoft.Network/publicIPAddresses/{TID}-nat-gateway-z1-ip"
            ))
            .is_some_and(|ip| ip["zones"] == serde_json::json!(["1"])));

        arm.clear_mutations();
        let again = reconcile(
            &factory,
            &ctx,
            &request(&config, &profile, Some(&status)),
            &mut state,
            &retry,
        )
        .await
        .unwrap();
        assert_eq!(arm.mutations(), Vec::<Mutation>::new());
        assert_eq!(again, status);
    }

    #[tokio::test]
    async fn create_update_delete_leaves_nothing_behind() {
        let arm = Arc::new(FakeArm::new());
        let factory = factory(&arm);
        let ctx = ReconcileContext::unbounded();
        let profile = profile();
        let retry = RetryConfig::default();
        let mut state = InfrastructureState::default();

        let config = zoned_config(vec![zone(1, "10.250.0.0/24", true)]);
        let status = reconcile(&factory, &ctx, &request(&config, &profile, None), &mut state, &retry)
            .await
            .unwrap();

        let updated = zoned_config(vec![
            zone(1, "10.250.0.0/24", true),
            zone(3, "10.250.2.0/24", true),
        ]);
        reconcile(
            &factory,
            &ctx,
            &request(&updated, &profile, Some(&status)),
            &mut state,
            &retry,
        )
        .await
        .unwrap();
        assert!(state
            .managed_items
            .iter()
            .any(|item| item.id.ends_with(&format!("{TID}-nat-gateway-z3"))));

        delete(&factory, &ctx, &request(&updated, &profile, None), &mut state, &retry)
            .await
            .unwrap();
        assert_eq!(state.managed_items, Vec::<AzureResource>::new());
        assert_eq!(arm.ids(), Vec::<String>::new());
    }

    #[tokio::test]
    async fn removed_zone_objects_are_deleted() {
        let arm = Arc::new(FakeArm::new());
        let factory = factory(&arm);
        let ctx = ReconcileContext::unbounded();
        let profile = profile();
        let retry = RetryConfig::default();
        let mut state = InfrastructureState::default();

        let two = zoned_config(vec![
            zone(1, "10.250.0.0/24", true),
            zone(2, "10.250.1.0/24", true),
        ]);
        let status = reconcile(&factory, &ctx, &request(&two, &profile, None), &mut state, &retry)
            .await
            .unwrap();

        arm.clear_mutations();
        let one = zoned_config(vec![zone(1, "10.250.0.0/24", true)]);
        reconcile(&factory, &ctx, &request(&one, &profile, Some(&status)), &mut state, &retry)
            .await
            .unwrap();

        let deleted: Vec<String> = arm
            .mutations()
            .into_iter()
            .filter_map(|m| match m {
                Mutation::Delete(id) => id.rsplit('/').next().map(str::to_string),
                _ => None,
            })
            .collect();
        assert_eq!(
            deleted,
            vec![
                format!("{TID}-nodes-z2"),
                format!("{TID}-nat-gateway-z2"),
                format!("{TID}-nat-gateway-z2-ip"),
            ]
        );
        assert!(!state.managed_items.iter().any(|item| item.id.contains("-z2")));
    }

    #[tokio::test]
    async fn user_provided_objects_are_neither_recorded_nor_deleted() {
        let arm = Arc::new(FakeArm::new());
        arm.insert(
            &format!("/subscriptions/{SUB}/resourceGroups/user-rg"),
            serde_json::json!({"location": "westeurope"}),
        );
        arm.insert(
            &format!("/subscriptions/{SUB}/resourceGroups/net-rg"),
            serde_json::json!({"location": "westeurope"}),
        );
        arm.insert(
            &format!(
                "/subscriptions/{SUB}/resourceGroups/net-rg/providers/Microsoft.Network/virtualNetworks/user-vnet"
            ),
            serde_json::json!({"location": "westeurope", "properties": {"addressSpace": {"addressPrefixes": ["10.0.0.0/8"]}}}),
        );
        let factory = factory(&arm);
        let ctx = ReconcileContext::unbounded();
        let profile = profile();
        let retry = RetryConfig::default();
        let mut state = InfrastructureState::default();
        let config = InfrastructureConfig {
            resource_group: Some("user-rg".to_string()),
            networks: NetworkConfig {
                vnet: VnetConfig {
                    name: Some("user-vnet".to_string()),
                    resource_group: Some("net-rg".to_string()),
                    ..Default::default()
                },
                workers: Some("10.250.0.0/16".to_string()),
                nat_gateway: Some(NatGatewayConfig {
                    enabled: true,
                    ..Default::default()
                }),
                ..Default::default()
            },
            ..Default::default()
        };

        let status = reconcile(&factory, &ctx, &request(&config, &profile, None), &mut state, &retry)
            .await
            .unwrap();
        assert_eq!(status.resource_group, "user-rg");
        assert_eq!(status.networks.vnet.resource_group.as_deref(), Some("net-rg"));
        assert!(state
            .managed_items
            .iter()
            .all(|item| !item.id.ends_with("/user-rg") && !item.id.ends_with("/user-vnet")));

        delete(&factory, &ctx, &request(&config, &profile, None), &mut state, &retry)
            .await
            .unwrap();
        let ids = arm.ids();
        assert!(ids.iter().any(|id| id.ends_with("/resourcegroups/user-rg")));
        assert!(ids.iter().any(|id| id.ends_with("/virtualnetworks/user-vnet")));
        assert!(!ids.iter().any(|id| id.contains("/subnets/")));
    }

    #[tokio::test]
    async fn existing_availability_set_is_kept_for_legacy_shoots() {
        let arm = Arc::new(FakeArm::new());
        let factory = factory(&arm);
        let ctx = ReconcileContext::unbounded();
        let profile = profile();
        let retry = RetryConfig::default();
        let avset_id = format!(
            "/subscriptions/{SUB}/resourceGroups/{TID}/providers/Microsoft.Compute/availabilitySets/{TID}-avset-workers"
        );
        let mut state = InfrastructureState::default();
        state.record("Microsoft.Compute/availabilitySets", avset_id.clone());
        let config = InfrastructureConfig {
            networks: NetworkConfig {
                workers: Some("10.250.0.0/16".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };

        let status = reconcile(&factory, &ctx, &request(&config, &profile, None), &mut state, &retry)
            .await
            .unwrap();
        assert_eq!(status.availability_sets.len(), 1);
        assert_eq!(status.availability_sets[0].count_fault_domains, Some(2));
        assert_eq!(status.availability_sets[0].count_update_domains, Some(5));
        assert!(!status.is_vmo_required());
        let avset = arm.object(&avset_id).unwrap();
        assert_eq!(avset["sku"]["name"], "Aligned");
    }

    #[tokio::test]
    async fn dependency_failures_back_off_until_the_budget_is_spent() {
        let arm = Arc::new(FakeArm::new());
        arm.fail_on(
            "PUT",
            "-nodes",
            409,
            "InUseSubnetCannotBeDeleted",
            "subnet is in use",
            None,
        );
        let factory = factory(&arm);
        let ctx = ReconcileContext::unbounded();
        let profile = profile();
        let retry = RetryConfig {
            dependency_budget: 2,
            ..Default::default()
        };
        let mut state = InfrastructureState::default();
        let config = InfrastructureConfig {
            networks: NetworkConfig {
                workers: Some("10.250.0.0/16".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let req = request(&config, &profile, None);

        let first = reconcile(&factory, &ctx, &req, &mut state, &retry).await.unwrap_err();
        assert_eq!(first.retry_after(&retry), Duration::from_secs(5));
        let second = reconcile(&factory, &ctx, &req, &mut state, &retry).await.unwrap_err();
        assert_eq!(second.retry_after(&retry), Duration::from_secs(10));
        assert_eq!(state.data.get(DEPENDENCY_RETRIES_KEY).map(String::as_str), Some("2"));

        let third = reconcile(&factory, &ctx, &req, &mut state, &retry).await.unwrap_err();
        assert!(matches!(third, Error::BudgetExhausted { attempts: 2, .. }));
        assert_eq!(third.kind(), Some(ErrorKind::Dependencies));
        assert!(!state.data.contains_key(DEPENDENCY_RETRIES_KEY));
        // Objects created before the failure stay recorded.
        assert!(state
            .managed_items
            .iter()
            .any(|item| item.kind == "Microsoft.Network/virtualNetworks"));
    }
}
