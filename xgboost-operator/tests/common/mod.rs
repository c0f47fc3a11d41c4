//! Common test utilities for integration tests.

#![allow(dead_code)]

use k8s_openapi::api::core::v1::{
    Container, ContainerState, ContainerStateTerminated, ContainerStatus, Pod, PodSpec,
    PodTemplateSpec, Service,
};
use kube::ResourceExt;
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use xgboost_operator::client::{MemoryRecorder, MemoryStore};
use xgboost_operator::controller::{ControllerConfig, ControllerContext, JobController};
use xgboost_operator::crd::{
    DEFAULT_CONTAINER_NAME, JobStatus, REPLICA_TYPE_MASTER, REPLICA_TYPE_WORKER, ReplicaSpec,
    RestartPolicy, XGBoostJob, XGBoostJobSpec,
};

pub const NAMESPACE: &str = "default";

/// Replica spec running the training container.
pub fn replica(replicas: i32, restart_policy: RestartPolicy) -> ReplicaSpec {
    ReplicaSpec {
        replicas: Some(replicas),
        template: PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: DEFAULT_CONTAINER_NAME.to_string(),
                    image: Some("docker.io/kubeflow/xgboost-dist-iris:1.0".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
        },
        restart_policy: Some(restart_policy),
    }
}

/// Job with one master and `workers` workers.
pub fn xgboost_job(name: &str, workers: i32, worker_policy: RestartPolicy) -> XGBoostJob {
    let mut spec = XGBoostJobSpec::default();
    spec.xgb_replica_specs.insert(
        REPLICA_TYPE_MASTER.to_string(),
        replica(1, RestartPolicy::Never),
    );
    if workers > 0 {
        spec.xgb_replica_specs
            .insert(REPLICA_TYPE_WORKER.to_string(), replica(workers, worker_policy));
    }
    let mut job = XGBoostJob::new(name, spec);
    job.metadata.namespace = Some(NAMESPACE.to_string());
    job
}

/// Controller wired to in-memory collaborators.
///
/// Watch events are not delivered on their own: [`Harness::observe`]
/// replays the store changes since the last call through the handlers.
pub struct Harness {
    pub store: Arc<MemoryStore>,
    pub recorder: Arc<MemoryRecorder>,
    pub controller: JobController,
    seen_pods: Mutex<BTreeMap<String, Pod>>,
    seen_services: Mutex<BTreeMap<String, Service>>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(ControllerConfig::default())
    }

    pub fn with_config(config: ControllerConfig) -> Self {
        let store = Arc::new(MemoryStore::new());
        let recorder = Arc::new(MemoryRecorder::new());
        let ctx = ControllerContext::new(store.clone(), recorder.clone(), config);
        Self {
            store,
            recorder,
            controller: JobController::new(Arc::new(ctx)),
            seen_pods: Mutex::new(BTreeMap::new()),
            seen_services: Mutex::new(BTreeMap::new()),
        }
    }

    /// Store a job and return its key.
    pub fn submit(&self, job: XGBoostJob) -> String {
        let key = format!("{}/{}", NAMESPACE, job.name_any());
        self.store.insert_job(job);
        key
    }

    pub fn job(&self, name: &str) -> XGBoostJob {
        self.store.job(NAMESPACE, name).expect("job exists")
    }

    pub fn status(&self, name: &str) -> JobStatus {
        self.job(name).status.unwrap_or_default()
    }

    pub fn pod_names(&self) -> Vec<String> {
        self.store.pods().iter().map(|p| p.name_any()).collect()
    }

    pub fn service_names(&self) -> Vec<String> {
        self.store.services().iter().map(|s| s.name_any()).collect()
    }

    pub fn pod(&self, name: &str) -> Pod {
        self.store
            .pods()
            .into_iter()
            .find(|p| p.name_any() == name)
            .expect("pod exists")
    }

    /// Deliver add/delete events for everything that changed in the store.
    pub fn observe(&self) {
        let pods: BTreeMap<String, Pod> = self
            .store
            .pods()
            .into_iter()
            .map(|p| (p.name_any(), p))
            .collect();
        let mut seen = self.seen_pods.lock();
        for (name, pod) in &pods {
            if !seen.contains_key(name) {
                self.controller.on_pod_added(pod);
            }
        }
        for (name, pod) in seen.iter() {
            if !pods.contains_key(name) {
                self.controller.on_pod_deleted(pod);
            }
        }
        *seen = pods;

        let services: BTreeMap<String, Service> = self
            .store
            .services()
            .into_iter()
            .map(|s| (s.name_any(), s))
            .collect();
        let mut seen = self.seen_services.lock();
        for (name, service) in &services {
            if !seen.contains_key(name) {
                self.controller.on_service_added(service);
            }
        }
        for (name, service) in seen.iter() {
            if !services.contains_key(name) {
                self.controller.on_service_deleted(service);
            }
        }
        *seen = services;
    }

    pub fn set_phase(&self, pod: &str, phase: &str) {
        self.store
            .set_pod_phase(NAMESPACE, pod, phase)
            .expect("pod exists");
    }

    /// Mark a pod failed with `exit_code` in the training container.
    pub fn fail_pod(&self, name: &str, exit_code: i32) {
        let mut pod = self.pod(name);
        let status = pod.status.get_or_insert_with(Default::default);
        status.phase = Some("Failed".to_string());
        status.container_statuses = Some(vec![ContainerStatus {
            name: DEFAULT_CONTAINER_NAME.to_string(),
            state: Some(ContainerState {
                terminated: Some(ContainerStateTerminated {
                    exit_code,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        }]);
        self.store.insert_pod(pod);
    }

    /// Environment variable of the training container of a pod.
    pub fn env(&self, pod: &str, name: &str) -> Option<String> {
        self.pod(pod)
            .spec?
            .containers
            .into_iter()
            .find(|c| c.name == DEFAULT_CONTAINER_NAME)?
            .env?
            .into_iter()
            .find(|v| v.name == name)?
            .value
    }
}
