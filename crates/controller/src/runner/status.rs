//! Status bookkeeping shared by the reconcilers.

use std::fmt::Debug;

use kube::api::{Patch, PatchParams};
use kube::{Api, Resource};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{json, Value};

use crate::crds::{ExtensionStatus, LastError, LastOperation, OperationType};
use crate::error::{Error, Result};

/// Operation a reconcile performs, given the current status.
pub(super) fn operation_type(status: Option<&ExtensionStatus>, deleting: bool) -> OperationType {
    if deleting {
        OperationType::Delete
    } else if status.and_then(|status| status.last_operation.as_ref()).is_none() {
        OperationType::Create
    } else {
        OperationType::Reconcile
    }
}

/// Records the outcome of an operation. Requeues are progress, not errors.
pub(super) fn record<T>(
    status: &mut ExtensionStatus,
    generation: Option<i64>,
    operation: OperationType,
    outcome: &Result<T>,
) {
    status.observed_generation = generation;
    match outcome {
        Ok(_) => {
            status.last_operation = Some(LastOperation::succeeded(
                operation,
                format!("{operation:?} succeeded"),
            ));
            status.last_error = None;
        }
        Err(Error::Requeue { reason, .. }) => {
            status.last_operation = Some(LastOperation::processing(operation, reason.clone()));
        }
        Err(err) => {
            status.last_operation = Some(LastOperation::errored(operation, err.to_string()));
            status.last_error = Some(LastError::from(err));
        }
    }
}

/// Merge patch body of `status`; a cleared error is sent as `null`.
pub(super) fn patch_body(status: &impl Serialize, common: &ExtensionStatus) -> Result<Value> {
    let mut value = serde_json::to_value(status)?;
    if common.last_error.is_none() {
        value["lastError"] = Value::Null;
    }
    Ok(json!({ "status": value }))
}

/// Writes `body` to the status subresource of `name`.
pub(super) async fn patch<K>(api: &Api<K>, name: &str, body: &Value) -> Result<()>
where
    K: Resource + Clone + DeserializeOwned + Debug,
{
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(body))
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::crds::OperationState;

    #[test]
    fn first_reconcile_is_a_create() {
        assert_eq!(operation_type(None, false), OperationType::Create);
        let status = ExtensionStatus {
            last_operation: Some(LastOperation::succeeded(OperationType::Create, "done")),
            ..Default::default()
        };
        assert_eq!(operation_type(Some(&status), false), OperationType::Reconcile);
        assert_eq!(operation_type(Some(&status), true), OperationType::Delete);
    }

    #[test]
    fn requeues_keep_the_last_error() {
        let mut status = ExtensionStatus::default();
        let failed: Result<()> = Err(Error::Validation("bad".to_string()));
        record(&mut status, Some(2), OperationType::Reconcile, &failed);
        assert!(status.last_error.is_some());

        let waiting: Result<()> = Err(Error::requeue(Duration::from_secs(5), "bastion not ready"));
        record(&mut status, Some(2), OperationType::Reconcile, &waiting);
        let operation = status.last_operation.clone().unwrap();
        assert_eq!(operation.state, OperationState::Processing);
        assert_eq!(operation.description, "bastion not ready");
        assert!(status.last_error.is_some());

        record(&mut status, Some(3), OperationType::Reconcile, &Ok(()));
        assert_eq!(status.observed_generation, Some(3));
        assert_eq!(patch_body(&status, &status).unwrap()["status"]["lastError"], Value::Null);
    }
}
