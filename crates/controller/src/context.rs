//! Per-reconcile context and the shared controller context.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use kube::Client;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::ControllerConfig;
use crate::error::{Error, Result};

/// State shared by all reconciles of one controller.
pub struct Context {
    pub client: Client,
    pub config: Arc<ControllerConfig>,
    /// Cancelled on shutdown; every reconcile derives its token from it.
    pub shutdown: CancellationToken,
}

impl Context {
    /// Context for a single reconcile bounded by the configured timeout.
    #[must_use]
    pub fn reconcile_context(&self) -> ReconcileContext {
        ReconcileContext::new(
            self.config.reconcile.timeout(),
            self.shutdown.child_token(),
        )
    }
}

/// Deadline and cancellation of one reconcile.
///
/// Every suspension point of a reconciler goes through [`ReconcileContext::run`]
/// or [`ReconcileContext::sleep`], so a reconcile stops at the next cloud call
/// once it is cancelled or out of time.
#[derive(Debug, Clone)]
pub struct ReconcileContext {
    deadline: Instant,
    cancel: CancellationToken,
}

impl ReconcileContext {
    #[must_use]
    pub fn new(timeout: Duration, cancel: CancellationToken) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            cancel,
        }
    }

    /// Context without a practical deadline, for tests and one-off tools.
    #[must_use]
    pub fn unbounded() -> Self {
        Self::new(Duration::from_secs(24 * 60 * 60), CancellationToken::new())
    }

    #[must_use]
    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Fails if the reconcile was cancelled or is past its deadline.
    pub fn check(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        if Instant::now() >= self.deadline {
            return Err(Error::DeadlineExceeded);
        }
        Ok(())
    }

    /// Runs a cloud call, aborting it on cancellation or deadline.
    pub async fn run<T, F>(&self, call: F) -> Result<T>
    where
        F: Future<Output = azure_cloud::Result<T>>,
    {
        self.check()?;
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep_until(self.deadline) => Err(Error::DeadlineExceeded),
            result = call => result.map_err(Error::Cloud),
        }
    }

    /// Waits for `duration`, returning early on cancellation or deadline.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.check()?;
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(Error::Cancelled),
            () = tokio::time::sleep_until(self.deadline) => Err(Error::DeadlineExceeded),
            () = tokio::time::sleep(duration) => Ok(()),
        }
    }
}
