//! Custom Resource Definitions for the XGBoostJob operator.
//!
//! This module defines the resources the operator manages or requests:
//!
//! - [`XGBoostJob`]: A distributed XGBoost training job
//! - [`PodGroup`]: A gang-scheduling group for the kube-batch scheduler

mod common;
mod defaults;
mod podgroup;
mod validation;
mod xgboostjob;

pub use common::{
    CleanPodPolicy, ConditionStatus, JobCondition, JobConditionType, JobStatus, ReplicaSpec,
    ReplicaStatus, RestartPolicy, RunPolicy, SchedulingPolicy,
};
pub use defaults::set_defaults;
pub use podgroup::{GANG_SCHEDULER_NAME, PodGroup, PodGroupSpec};
pub use validation::validate_spec;
pub use xgboostjob::{
    CONTROLLER_NAME, DEFAULT_CONTAINER_NAME, DEFAULT_PORT, DEFAULT_PORT_NAME, GROUP, KIND,
    PLURAL, REPLICA_TYPE_MASTER, REPLICA_TYPE_WORKER, VERSION, XGBoostJob, XGBoostJobSpec,
};
