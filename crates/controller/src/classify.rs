//! Classification of cloud error messages.
//!
//! Azure reports most failures as free text. The matchers below map that
//! text onto a closed set of kinds that drive the retry policy.

use std::fmt;
use std::sync::LazyLock;

use regex::Regex;

/// Kind of a classified error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ErrorKind {
    Unauthenticated,
    Unauthorized,
    QuotaExceeded,
    RateLimit,
    Dependencies,
    RetryableDependencies,
    ResourcesDepleted,
    ConfigProblem,
    RetryableConfigProblem,
}

impl ErrorKind {
    /// Error code reported in resource status.
    #[must_use]
    pub fn code(self) -> &'static str {
        match self {
            Self::Unauthenticated => "ERR_INFRA_UNAUTHENTICATED",
            Self::Unauthorized => "ERR_INFRA_UNAUTHORIZED",
            Self::QuotaExceeded => "ERR_INFRA_QUOTA_EXCEEDED",
            Self::RateLimit => "ERR_INFRA_RATE_LIMITS_EXCEEDED",
            Self::Dependencies => "ERR_INFRA_DEPENDENCIES",
            Self::RetryableDependencies => "ERR_RETRYABLE_INFRA_DEPENDENCIES",
            Self::ResourcesDepleted => "ERR_INFRA_RESOURCES_DEPLETED",
            Self::ConfigProblem => "ERR_CONFIGURATION_PROBLEM",
            Self::RetryableConfigProblem => "ERR_RETRYABLE_CONFIGURATION_PROBLEM",
        }
    }

    /// Kinds that are retried after the short retry period.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::RetryableDependencies | Self::RetryableConfigProblem
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Unauthenticated => "unauthenticated",
            Self::Unauthorized => "unauthorized",
            Self::QuotaExceeded => "quota_exceeded",
            Self::RateLimit => "rate_limit",
            Self::Dependencies => "dependencies",
            Self::RetryableDependencies => "retryable_dependencies",
            Self::ResourcesDepleted => "resources_depleted",
            Self::ConfigProblem => "config_problem",
            Self::RetryableConfigProblem => "retryable_config_problem",
        };
        f.write_str(name)
    }
}

fn matcher(pattern: &str) -> Regex {
    #[allow(clippy::expect_used)]
    Regex::new(&format!("(?i)({pattern})")).expect("error classification pattern must compile")
}

static UNAUTHENTICATED: LazyLock<Regex> = LazyLock::new(|| {
    matcher(
        "InvalidAuthenticationTokenTenant|Authentication failed|Authentication error|AuthFailure|\
         invalid_client|AADSTS7000215|AADSTS700016|cannot fetch token|InvalidSubscriptionId|\
         ExpiredAuthenticationToken|invalid client secret",
    )
});

static UNAUTHORIZED: LazyLock<Regex> = LazyLock::new(|| {
    matcher(
        "Unauthorized|AuthorizationFailed|LinkedAuthorizationFailed|invalid_grant|\
         Authorization Profile was not found|no active subscriptions|not authorized|AccessDenied|\
         Error 403|does not have authorization|OperationNotAllowed",
    )
});

static RATE_LIMIT: LazyLock<Regex> = LazyLock::new(|| {
    matcher("RequestLimitExceeded|Throttling|Too many requests|TooManyRequests|SubscriptionRequestsThrottled")
});

static RETRYABLE_DEPENDENCIES: LazyLock<Regex> = LazyLock::new(|| {
    matcher("RetryableError|OperationPreempted|RetryableDependency|timed out after")
});

static RETRYABLE_CONFIG_PROBLEM: LazyLock<Regex> = LazyLock::new(|| {
    matcher(
        "is misconfigured and requires zero voluntary evictions|SDS: PodDisruptionBudget|\
         OSProvisioningTimedOut",
    )
});

static QUOTA_EXCEEDED: LazyLock<Regex> = LazyLock::new(|| {
    matcher(
        "Quotas|Quota.*exceeded|exceeded quota|Quota has been met|QUOTA_EXCEEDED|QuotaExceeded|\
         PublicIPCountLimitReached",
    )
});

/// `...LimitExceeded` counts as quota unless it is `RequestLimitExceeded`.
static LIMIT_EXCEEDED: LazyLock<Regex> = LazyLock::new(|| matcher(r"\w*LimitExceeded"));

static RESOURCES_DEPLETED: LazyLock<Regex> = LazyLock::new(|| {
    matcher(
        "not available in the current hardware cluster|InsufficientInstanceCapacity|\
         SkuNotAvailable|ZonalAllocationFailed|AllocationFailed|OverconstrainedAllocationRequest|\
         OverconstrainedZonalAllocationRequest|out of stock",
    )
});

static CONFIG_PROBLEM: LazyLock<Regex> = LazyLock::new(|| {
    matcher(
        "not supported in your requested Availability Zone|notFound|Invalid.*id|InvalidParameter|\
         InvalidPublicIpAddress|SubnetsNotInSameVnet|PrivateIPAddressNotInSubnet|\
         NetcfgInvalidSubnet|InvalidResourceReference|VMSizeNotSupported|\
         cannot boot Hypervisor Generation|OSProvisioningClientError|MarketplacePurchaseEligibilityFailed|\
         ResourcePurchaseValidationFailed|unknown field|KindMismatch|overlapping zones|\
         AzureBastionSubnet",
    )
});

static DEPENDENCIES: LazyLock<Regex> = LazyLock::new(|| {
    matcher(
        "PendingVerification|Access Not Configured|DependencyViolation|OptInRequired|DeleteConflict|\
         Conflict|inactive billing state|ReadOnlyDisabledSubscription|is already being used|\
         InUseSubnetCannotBeDeleted|VnetInUse|InUseRouteTableCannotBeDeleted|\
         InUseNetworkSecurityGroupCannotBeDeleted|PublicIPAddressCannotBeDeleted|\
         NatGatewayInUseBySubnet|CannotDeleteResource|AnotherOperationInProgress|\
         timeout while waiting for state to become|InvalidCidrBlock|already busy for|\
         insufficient margin|is not in a valid state|InternalServerError",
    )
});

fn quota_exceeded(message: &str) -> bool {
    QUOTA_EXCEEDED.is_match(message)
        || LIMIT_EXCEEDED
            .find_iter(message)
            .any(|m| !m.as_str().to_ascii_lowercase().ends_with("requestlimitexceeded"))
}

/// Returns the first matching kind in precedence order. Rate limits and the
/// retryable kinds are checked before their generic counterparts.
#[must_use]
pub fn classify(message: &str) -> Option<ErrorKind> {
    let matchers: [(ErrorKind, &dyn Fn(&str) -> bool); 9] = [
        (ErrorKind::Unauthenticated, &|m| UNAUTHENTICATED.is_match(m)),
        (ErrorKind::Unauthorized, &|m| UNAUTHORIZED.is_match(m)),
        (ErrorKind::RateLimit, &|m| RATE_LIMIT.is_match(m)),
        (ErrorKind::RetryableDependencies, &|m| RETRYABLE_DEPENDENCIES.is_match(m)),
        (ErrorKind::RetryableConfigProblem, &|m| RETRYABLE_CONFIG_PROBLEM.is_match(m)),
        (ErrorKind::QuotaExceeded, &quota_exceeded),
        (ErrorKind::ResourcesDepleted, &|m| RESOURCES_DEPLETED.is_match(m)),
        (ErrorKind::ConfigProblem, &|m| CONFIG_PROBLEM.is_match(m)),
        (ErrorKind::Dependencies, &|m| DEPENDENCIES.is_match(m)),
    ];
    matchers
        .iter()
        .find(|(_, matches)| matches(message))
        .map(|(kind, _)| *kind)
}

/// All kinds whose matcher fires, in precedence order.
#[must_use]
pub fn classify_all(message: &str) -> Vec<ErrorKind> {
    [
        ErrorKind::Unauthenticated,
        ErrorKind::Unauthorized,
        ErrorKind::RateLimit,
        ErrorKind::RetryableDependencies,
        ErrorKind::RetryableConfigProblem,
        ErrorKind::QuotaExceeded,
        ErrorKind::ResourcesDepleted,
        ErrorKind::ConfigProblem,
        ErrorKind::Dependencies,
    ]
    .into_iter()
    .filter(|kind| classify_one(*kind, message))
    .collect()
}

fn classify_one(kind: ErrorKind, message: &str) -> bool {
    match kind {
        ErrorKind::Unauthenticated => UNAUTHENTICATED.is_match(message),
        ErrorKind::Unauthorized => UNAUTHORIZED.is_match(message),
        ErrorKind::RateLimit => RATE_LIMIT.is_match(message),
        ErrorKind::RetryableDependencies => RETRYABLE_DEPENDENCIES.is_match(message),
        ErrorKind::RetryableConfigProblem => RETRYABLE_CONFIG_PROBLEM.is_match(message),
        ErrorKind::QuotaExceeded => quota_exceeded(message),
        ErrorKind::ResourcesDepleted => RESOURCES_DEPLETED.is_match(message),
        ErrorKind::ConfigProblem => CONFIG_PROBLEM.is_match(message),
        ErrorKind::Dependencies => DEPENDENCIES.is_match(message),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hypervisor_generation_mismatch_is_a_config_problem() {
        assert_eq!(
            classify(
                "The selected VM size 'Standard_D16as_v6' cannot boot Hypervisor Generation '1'."
            ),
            Some(ErrorKind::ConfigProblem)
        );
    }

    #[test]
    fn request_limits_are_rate_limits_not_quota() {
        assert_eq!(
            classify("RequestLimitExceeded: slow down"),
            Some(ErrorKind::RateLimit)
        );
        assert!(!quota_exceeded("RequestLimitExceeded"));
        assert!(quota_exceeded("VcpuLimitExceeded for family"));
        assert_eq!(
            classify("Operation could not be completed as it results in exceeding approved Total Regional Cores quota. QuotaExceeded"),
            Some(ErrorKind::QuotaExceeded)
        );
    }

    #[test]
    fn azure_messages() {
        let cases = [
            ("AADSTS7000215: Invalid client secret provided.", ErrorKind::Unauthenticated),
            (
                "API error: 403 AuthorizationFailed: The client does not have authorization",
                ErrorKind::Unauthorized,
            ),
            (
                "API error: 429 SubscriptionRequestsThrottled: retry later",
                ErrorKind::RateLimit,
            ),
            (
                "API error: 400 InUseSubnetCannotBeDeleted: Subnet nodes is in use",
                ErrorKind::Dependencies,
            ),
            (
                "API error: 409 ZonalAllocationFailed: Allocation failed",
                ErrorKind::ResourcesDepleted,
            ),
            (
                "Operation on /subscriptions/s/x timed out after 1800 seconds",
                ErrorKind::RetryableDependencies,
            ),
        ];
        for (message, kind) in cases {
            assert_eq!(classify(message), Some(kind), "{message}");
        }
    }

    #[test]
    fn operation_not_allowed_is_unauthorized() {
        assert_eq!(
            classify("OperationNotAllowed: The operation is not allowed on this subscription"),
            Some(ErrorKind::Unauthorized)
        );
    }

    #[test]
    fn internal_server_errors_are_dependencies() {
        assert_eq!(
            classify("API error: 500 InternalServerError: oops"),
            Some(ErrorKind::Dependencies)
        );
    }

    #[test]
    fn reserved_bastion_subnet_is_a_config_problem() {
        assert_eq!(
            classify("Subnet AzureBastionSubnet is reserved for Azure Bastion"),
            Some(ErrorKind::ConfigProblem)
        );
    }

    #[test]
    fn overlapping_zones_are_a_config_problem() {
        assert_eq!(
            classify("overlapping zones are not allowed"),
            Some(ErrorKind::ConfigProblem)
        );
    }

    #[test]
    fn unknown_messages_are_unclassified() {
        assert_eq!(classify("something odd happened"), None);
        assert!(classify_all("something odd happened").is_empty());
    }

    #[test]
    fn classify_all_reports_every_matching_kind() {
        let kinds = classify_all("Conflict: RetryableError");
        assert_eq!(
            kinds,
            vec![ErrorKind::RetryableDependencies, ErrorKind::Dependencies]
        );
        assert_eq!(classify("Conflict: RetryableError"), Some(kinds[0]));
    }
}
