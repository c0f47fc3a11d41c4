//! Reconciliation of XGBoostJob resources.
//!
//! This module contains the control loop that drives pods, services and pod
//! groups toward the replica specs of each job:
//!
//! - [`Expectations`]: pending creations/deletions per job and replica type
//! - [`Retries`]: retry history of job keys, counted toward `backoffLimit`
//! - [`JobController`]: per-key sync (pods, services, status, termination)
//! - [`Operator`]: `kube::runtime::Controller` over jobs and their pods and services
//!
//! # Usage
//!
//! ```ignore
//! use xgboost_operator::client::{KubeRecorder, KubeStore};
//! use xgboost_operator::controller::{ControllerConfig, ControllerContext, Operator};
//!
//! let ctx = ControllerContext::new(
//!     Arc::new(KubeStore::new(client.clone())),
//!     Arc::new(KubeRecorder::new(client.clone(), CONTROLLER_NAME)),
//!     ControllerConfig::default(),
//! );
//! Operator::new(client, ctx, None).run(2).await;
//! ```

mod expectations;
mod informer;
mod job;
pub mod labels;
mod pod;
mod policy;
mod retries;
mod runner;
mod service;
mod status;

pub use expectations::{
    Controllee, DEFAULT_EXPECTATIONS_TIMEOUT, ExpectationKey, Expectations, is_expired,
};
pub use labels::LabelScheme;
pub use policy::{JobPolicy, XGBoostPolicy, container_port};
pub use retries::Retries;
pub use runner::{Operator, error_policy, reconcile};
pub use status::{
    JOB_CREATED_REASON, JOB_FAILED_REASON, JOB_INVALID_SPEC_REASON, JOB_RESTARTING_REASON,
    JOB_RUNNING_REASON, JOB_SUCCEEDED_REASON, get_condition, has_condition, is_failed,
    is_succeeded, update_job_conditions,
};

use crate::client::{EventRecorder, ObjectStore};
use crate::crd::GANG_SCHEDULER_NAME;
use std::sync::Arc;
use std::time::Duration;

/// Runtime options of the job controller.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Request gang scheduling through pod groups.
    pub enable_gang_scheduling: bool,
    /// Scheduler that understands pod groups.
    pub gang_scheduler_name: String,
    /// Age after which unobserved expectations are treated as satisfied.
    pub expectations_timeout: Duration,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            enable_gang_scheduling: false,
            gang_scheduler_name: GANG_SCHEDULER_NAME.to_string(),
            expectations_timeout: DEFAULT_EXPECTATIONS_TIMEOUT,
        }
    }
}

/// Shared context for the job controller.
pub struct ControllerContext {
    /// Object store.
    pub store: Arc<dyn ObjectStore>,
    /// Event sink.
    pub recorder: Arc<dyn EventRecorder>,
    /// Job-kind policy.
    pub policy: Arc<dyn JobPolicy>,
    /// Runtime options.
    pub config: ControllerConfig,
    /// Retry history of job keys.
    pub retries: Retries,
}

impl ControllerContext {
    /// Create a context for XGBoostJobs.
    pub fn new(
        store: Arc<dyn ObjectStore>,
        recorder: Arc<dyn EventRecorder>,
        config: ControllerConfig,
    ) -> Self {
        Self {
            store,
            recorder,
            policy: Arc::new(XGBoostPolicy),
            config,
            retries: Retries::default(),
        }
    }
}

/// Result of one sync of a job key.
///
/// Only [`Done`](Self::Done) clears the retry history of a key, so pod
/// restarts and errors keep counting toward the backoff limit while the job
/// is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Requeue after the specified duration.
    Requeue(Duration),
    /// Requeue with exponential backoff and count the retry.
    Backoff,
    /// Wait for the next watch event on the job or its pods and services.
    Wait,
    /// Don't requeue and forget the retry history (job finished or gone).
    Done,
}

/// Controller for XGBoostJob resources.
///
/// Cloning is cheap; clones share the context and the expectations.
#[derive(Clone)]
pub struct JobController {
    ctx: Arc<ControllerContext>,
    expectations: Arc<Expectations>,
    labels: LabelScheme,
}

impl JobController {
    /// Create a job controller.
    pub fn new(ctx: Arc<ControllerContext>) -> Self {
        let expectations = Arc::new(Expectations::new(ctx.config.expectations_timeout));
        let labels = LabelScheme::new(ctx.policy.group_name());
        Self {
            ctx,
            expectations,
            labels,
        }
    }

    /// Expectation tracker.
    pub fn expectations(&self) -> &Expectations {
        &self.expectations
    }

    /// Retry history of job keys.
    pub fn retries(&self) -> &Retries {
        &self.ctx.retries
    }

    /// Label scheme of owned objects.
    pub fn labels(&self) -> &LabelScheme {
        &self.labels
    }
}
