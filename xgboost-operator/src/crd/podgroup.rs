//! PodGroup resource of the kube-batch gang scheduler.
//!
//! The operator only creates and deletes these objects; the scheduler owns
//! their status.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Scheduler name that understands [`PodGroup`] objects.
pub const GANG_SCHEDULER_NAME: &str = "kube-batch";

/// A group of pods that must be scheduled together.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "scheduling.incubator.k8s.io",
    version = "v1alpha1",
    kind = "PodGroup",
    plural = "podgroups",
    namespaced
)]
#[serde(rename_all = "camelCase")]
pub struct PodGroupSpec {
    /// Minimum number of pods that must be schedulable at once.
    pub min_member: i32,
}
