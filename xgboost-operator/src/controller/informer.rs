//! Watch event handlers.
//!
//! Handlers only touch the expectations and the retry history. Triggering
//! the owning job is left to the controller runtime.

use super::JobController;
use super::expectations::{Controllee, ExpectationKey};
use super::labels::{REPLICA_TYPE_LABEL, controller_of, job_key, key_for};
use crate::crd::XGBoostJob;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::{Resource, ResourceExt};

impl JobController {
    fn observe<K: Resource>(&self, object: &K, controllee: Controllee, created: bool) {
        let Some(owner) = controller_of(object.owner_references()) else {
            return;
        };
        let job_key = key_for(&object.namespace().unwrap_or_default(), &owner.name);

        let Some(replica_type) = object.labels().get(REPLICA_TYPE_LABEL) else {
            tracing::info!(
                name = %object.name_any(),
                "Object has no replica type label, it may not be created by this controller"
            );
            return;
        };

        let key = ExpectationKey::new(&job_key, replica_type, controllee);
        if created {
            self.expectations.creation_observed(&key);
        } else {
            self.expectations.deletion_observed(&key);
        }
    }

    /// A pod appeared.
    ///
    /// A pod already pending deletion, as seen after a controller restart,
    /// counts as a deletion.
    pub fn on_pod_added(&self, pod: &Pod) {
        if pod.metadata.deletion_timestamp.is_some() {
            self.on_pod_deleted(pod);
            return;
        }
        self.observe(pod, Controllee::Pods, true);
    }

    /// A pod disappeared.
    pub fn on_pod_deleted(&self, pod: &Pod) {
        self.observe(pod, Controllee::Pods, false);
    }

    /// A service appeared.
    pub fn on_service_added(&self, service: &Service) {
        self.observe(service, Controllee::Services, true);
    }

    /// A service disappeared.
    pub fn on_service_deleted(&self, service: &Service) {
        self.observe(service, Controllee::Services, false);
    }

    /// A job disappeared: nothing will sync it again.
    pub fn on_job_deleted(&self, job: &XGBoostJob) {
        let key = job_key(job);
        tracing::info!(job = %key, "XGBoostJob has been deleted");
        self.expectations.delete_job(&key);
        self.ctx.retries.forget(&key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{MemoryRecorder, MemoryStore};
    use crate::controller::labels::gen_owner_reference;
    use crate::controller::{ControllerConfig, ControllerContext};
    use crate::crd::XGBoostJobSpec;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
    use std::collections::BTreeMap;
    use std::sync::Arc;

    fn controller() -> JobController {
        let ctx = ControllerContext::new(
            Arc::new(MemoryStore::new()),
            Arc::new(MemoryRecorder::new()),
            ControllerConfig::default(),
        );
        JobController::new(Arc::new(ctx))
    }

    fn job() -> XGBoostJob {
        let mut job = XGBoostJob::new("iris", XGBoostJobSpec::default());
        job.metadata.namespace = Some("default".into());
        job.metadata.uid = Some("uid-1".into());
        job
    }

    fn owned_pod(replica_type: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("iris-worker-0".into()),
                namespace: Some("default".into()),
                labels: Some(BTreeMap::from([(
                    REPLICA_TYPE_LABEL.to_string(),
                    replica_type.to_string(),
                )])),
                owner_references: Some(vec![gen_owner_reference(&job()).unwrap()]),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn pod_add_observes_creation() {
        let controller = controller();
        let key = ExpectationKey::pods("default/iris", "Worker");
        controller.expectations().expect_creations(&key, 1);

        controller.on_pod_added(&owned_pod("worker"));
        assert!(controller.expectations().satisfied(&key));
    }

    #[test]
    fn terminating_pod_add_observes_deletion() {
        let controller = controller();
        let key = ExpectationKey::pods("default/iris", "worker");
        controller.expectations().expect_deletions(&key, 1);

        let mut pod = owned_pod("worker");
        pod.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        controller.on_pod_added(&pod);
        assert!(controller.expectations().satisfied(&key));
    }

    #[test]
    fn orphans_are_ignored() {
        let controller = controller();
        let key = ExpectationKey::pods("default/iris", "worker");
        controller.expectations().expect_creations(&key, 1);

        let mut pod = owned_pod("worker");
        pod.metadata.owner_references = None;
        controller.on_pod_added(&pod);
        assert!(!controller.expectations().satisfied(&key));
    }

    #[test]
    fn job_deletion_drops_its_history() {
        let controller = controller();
        controller
            .expectations()
            .expect_creations(&ExpectationKey::services("default/iris", "master"), 1);
        controller.retries().requeue("default/iris");

        controller.on_job_deleted(&job());
        assert!(controller.expectations().is_empty());
        assert_eq!(controller.retries().num_requeues("default/iris"), 0);
    }
}
