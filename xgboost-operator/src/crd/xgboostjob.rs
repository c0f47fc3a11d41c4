//! XGBoostJob Custom Resource Definition.
//!
//! Defines a distributed XGBoost training job made of a single master
//! replica and any number of worker replicas.

use super::common::{JobStatus, ReplicaSpec, RunPolicy};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API group of the XGBoostJob resource.
pub const GROUP: &str = "xgboostjob.kubeflow.org";
/// API version of the XGBoostJob resource.
pub const VERSION: &str = "v1";
/// Kind of the XGBoostJob resource.
pub const KIND: &str = "XGBoostJob";
/// Plural name of the XGBoostJob resource.
pub const PLURAL: &str = "xgboostjobs";

/// Name used as event source and controller identity.
pub const CONTROLLER_NAME: &str = "xgboostjob-operator";
/// Container that runs the training process.
pub const DEFAULT_CONTAINER_NAME: &str = "xgboostjob";
/// Name of the port used for rendezvous between replicas.
pub const DEFAULT_PORT_NAME: &str = "xgboostjob-port";
/// Rendezvous port used when the template declares none.
pub const DEFAULT_PORT: i32 = 9999;

/// Replica type of the single master replica.
pub const REPLICA_TYPE_MASTER: &str = "Master";
/// Replica type of the worker replicas.
pub const REPLICA_TYPE_WORKER: &str = "Worker";

/// XGBoostJob is the Schema for the xgboostjobs API.
///
/// The controller creates one pod and one headless service per replica,
/// wires the replicas together through environment variables and reports
/// progress in the status conditions.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "xgboostjob.kubeflow.org",
    version = "v1",
    kind = "XGBoostJob",
    plural = "xgboostjobs",
    shortname = "xgbjob",
    namespaced,
    status = "JobStatus",
    printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.conditions[-1:].type"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct XGBoostJobSpec {
    /// Runtime policies, inlined into the spec.
    #[serde(flatten)]
    pub run_policy: RunPolicy,

    /// Replica specs keyed by replica type (`Master`, `Worker`).
    #[serde(default)]
    pub xgb_replica_specs: BTreeMap<String, ReplicaSpec>,
}

impl XGBoostJob {
    /// The recorded status, or an empty one.
    pub fn job_status(&self) -> JobStatus {
        self.status.clone().unwrap_or_default()
    }

    /// Sum of the replica counts of every replica type.
    pub fn total_replicas(&self) -> i32 {
        self.spec
            .xgb_replica_specs
            .values()
            .map(ReplicaSpec::replica_count)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::CustomResourceExt;

    #[test]
    fn deserializes_inline_run_policy() {
        let job: XGBoostJob = serde_json::from_value(serde_json::json!({
            "apiVersion": "xgboostjob.kubeflow.org/v1",
            "kind": "XGBoostJob",
            "metadata": {"name": "iris", "namespace": "default"},
            "spec": {
                "backoffLimit": 3,
                "cleanPodPolicy": "All",
                "xgbReplicaSpecs": {
                    "Master": {"replicas": 1, "restartPolicy": "Never", "template": {}},
                    "Worker": {"replicas": 2, "restartPolicy": "ExitCode", "template": {}}
                }
            }
        }))
        .unwrap();

        assert_eq!(job.spec.run_policy.backoff_limit, Some(3));
        assert_eq!(
            job.spec.run_policy.clean_pod_policy,
            Some(crate::crd::CleanPodPolicy::All)
        );
        assert_eq!(job.total_replicas(), 3);
        assert!(job.status.is_none());
    }

    #[test]
    fn crd_identity() {
        let crd = XGBoostJob::crd();
        assert_eq!(crd.spec.group, GROUP);
        assert_eq!(crd.spec.names.kind, KIND);
        assert_eq!(crd.spec.names.plural, PLURAL);
        assert_eq!(crd.spec.versions[0].name, VERSION);
    }
}
