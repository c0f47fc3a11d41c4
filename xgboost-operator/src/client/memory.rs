//! In-memory store and event recorder.
//!
//! Useful for:
//! - Unit and scenario tests of the reconcilers
//! - Dry runs without a cluster
//!
//! Objects keep their state until dropped. Failures can be injected per
//! operation to exercise error paths.

use super::{EventRecorder, EventType, ObjectStore, StoreFuture};
use crate::crd::{JobStatus, PodGroup, XGBoostJob};
use crate::error::{OperatorError, OperatorResult};
use k8s_openapi::api::core::v1::{Pod, PodStatus, Service};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use kube::ResourceExt;
use kube::core::ErrorResponse;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// Store operations that accept injected failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StoreOp {
    /// [`ObjectStore::get_job`].
    GetJob,
    /// [`ObjectStore::update_job_status`].
    UpdateJobStatus,
    /// [`ObjectStore::delete_job`].
    DeleteJob,
    /// [`ObjectStore::create_pod`].
    CreatePod,
    /// [`ObjectStore::delete_pod`].
    DeletePod,
    /// [`ObjectStore::create_service`].
    CreateService,
    /// [`ObjectStore::delete_service`].
    DeleteService,
    /// [`ObjectStore::create_pod_group`].
    CreatePodGroup,
    /// [`ObjectStore::delete_pod_group`].
    DeletePodGroup,
}

type ObjectKey = (String, String);

/// In-memory [`ObjectStore`].
#[derive(Default)]
pub struct MemoryStore {
    jobs: Mutex<BTreeMap<ObjectKey, XGBoostJob>>,
    pods: Mutex<BTreeMap<ObjectKey, Pod>>,
    services: Mutex<BTreeMap<ObjectKey, Service>>,
    pod_groups: Mutex<BTreeMap<ObjectKey, PodGroup>>,
    failures: Mutex<HashMap<StoreOp, VecDeque<OperatorError>>>,
    status_updates: AtomicU64,
    version: AtomicU64,
}

impl MemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call of `op` fail with `error`.
    pub fn fail_next(&self, op: StoreOp, error: OperatorError) {
        self.failures.lock().entry(op).or_default().push_back(error);
    }

    fn take_failure(&self, op: StoreOp) -> OperatorResult<()> {
        match self.failures.lock().get_mut(&op).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn stamp(&self, meta: &mut ObjectMeta) {
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        meta.resource_version = Some(version.to_string());
        if meta.uid.is_none() {
            meta.uid = Some(format!("uid-{}", version));
            meta.creation_timestamp = Some(Time(chrono::Utc::now()));
        }
    }

    /// Insert or replace a job.
    pub fn insert_job(&self, mut job: XGBoostJob) {
        self.stamp(&mut job.metadata);
        let key = (job.namespace().unwrap_or_default(), job.name_any());
        self.jobs.lock().insert(key, job);
    }

    /// Current copy of a job.
    pub fn job(&self, namespace: &str, name: &str) -> Option<XGBoostJob> {
        self.jobs
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    /// Insert or replace a pod.
    pub fn insert_pod(&self, mut pod: Pod) {
        self.stamp(&mut pod.metadata);
        let key = (pod.namespace().unwrap_or_default(), pod.name_any());
        self.pods.lock().insert(key, pod);
    }

    /// Remove a pod behind the controller's back, returning it.
    pub fn remove_pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.pods
            .lock()
            .remove(&(namespace.to_string(), name.to_string()))
    }

    /// Remove a job behind the controller's back, returning it.
    pub fn remove_job(&self, namespace: &str, name: &str) -> Option<XGBoostJob> {
        self.jobs
            .lock()
            .remove(&(namespace.to_string(), name.to_string()))
    }

    /// Every pod in the store.
    pub fn pods(&self) -> Vec<Pod> {
        self.pods.lock().values().cloned().collect()
    }

    /// Every service in the store.
    pub fn services(&self) -> Vec<Service> {
        self.services.lock().values().cloned().collect()
    }

    /// Every pod group in the store.
    pub fn pod_groups(&self) -> Vec<PodGroup> {
        self.pod_groups.lock().values().cloned().collect()
    }

    /// Set the phase of a pod, returning the updated pod.
    pub fn set_pod_phase(&self, namespace: &str, name: &str, phase: &str) -> Option<Pod> {
        let mut pods = self.pods.lock();
        let pod = pods.get_mut(&(namespace.to_string(), name.to_string()))?;
        pod.status.get_or_insert_with(PodStatus::default).phase = Some(phase.to_string());
        let version = self.version.fetch_add(1, Ordering::Relaxed) + 1;
        pod.metadata.resource_version = Some(version.to_string());
        Some(pod.clone())
    }

    /// Number of status writes accepted so far.
    pub fn status_updates(&self) -> u64 {
        self.status_updates.load(Ordering::Relaxed)
    }
}

fn matches_selector(labels: &BTreeMap<String, String>, selector: &BTreeMap<String, String>) -> bool {
    selector.iter().all(|(k, v)| labels.get(k) == Some(v))
}

fn already_exists(kind: &str, name: &str) -> OperatorError {
    OperatorError::KubeError(kube::Error::Api(ErrorResponse {
        status: "Failure".to_string(),
        message: format!("{} \"{}\" already exists", kind, name),
        reason: "AlreadyExists".to_string(),
        code: 409,
    }))
}

impl ObjectStore for MemoryStore {
    fn get_job(&self, namespace: &str, name: &str) -> StoreFuture<'_, Option<XGBoostJob>> {
        let result = self.take_failure(StoreOp::GetJob).map(|_| self.job(namespace, name));
        Box::pin(async move { result })
    }

    fn update_job_status(&self, job: &XGBoostJob, status: &JobStatus) -> StoreFuture<'_, ()> {
        let namespace = job.namespace().unwrap_or_default();
        let name = job.name_any();
        let status = status.clone();
        Box::pin(async move {
            self.take_failure(StoreOp::UpdateJobStatus)?;
            let mut jobs = self.jobs.lock();
            let stored = jobs
                .get_mut(&(namespace.clone(), name.clone()))
                .ok_or_else(|| OperatorError::not_found("XGBoostJob", &namespace, &name))?;
            stored.status = Some(status);
            self.stamp(&mut stored.metadata);
            self.status_updates.fetch_add(1, Ordering::Relaxed);
            Ok(())
        })
    }

    fn delete_job(&self, namespace: &str, name: &str) -> StoreFuture<'_, ()> {
        let key = (namespace.to_string(), name.to_string());
        Box::pin(async move {
            self.take_failure(StoreOp::DeleteJob)?;
            self.jobs
                .lock()
                .remove(&key)
                .map(|_| ())
                .ok_or_else(|| OperatorError::not_found("XGBoostJob", &key.0, &key.1))
        })
    }

    fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> StoreFuture<'_, Vec<Pod>> {
        let pods: Vec<Pod> = self
            .pods
            .lock()
            .iter()
            .filter(|((ns, _), pod)| ns == namespace && matches_selector(pod.labels(), selector))
            .map(|(_, pod)| pod.clone())
            .collect();
        Box::pin(async move { Ok(pods) })
    }

    fn create_pod(&self, namespace: &str, mut pod: Pod) -> StoreFuture<'_, Pod> {
        let namespace = namespace.to_string();
        Box::pin(async move {
            self.take_failure(StoreOp::CreatePod)?;
            let name = pod.name_any();
            let mut pods = self.pods.lock();
            let key = (namespace.clone(), name.clone());
            if pods.contains_key(&key) {
                return Err(already_exists("pods", &name));
            }
            pod.metadata.namespace = Some(namespace);
            if pod.status.is_none() {
                pod.status = Some(PodStatus {
                    phase: Some("Pending".to_string()),
                    ..Default::default()
                });
            }
            self.stamp(&mut pod.metadata);
            pods.insert(key, pod.clone());
            Ok(pod)
        })
    }

    fn delete_pod(&self, namespace: &str, name: &str) -> StoreFuture<'_, ()> {
        let key = (namespace.to_string(), name.to_string());
        Box::pin(async move {
            self.take_failure(StoreOp::DeletePod)?;
            self.pods
                .lock()
                .remove(&key)
                .map(|_| ())
                .ok_or_else(|| OperatorError::not_found("Pod", &key.0, &key.1))
        })
    }

    fn list_services(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> StoreFuture<'_, Vec<Service>> {
        let services: Vec<Service> = self
            .services
            .lock()
            .iter()
            .filter(|((ns, _), svc)| ns == namespace && matches_selector(svc.labels(), selector))
            .map(|(_, svc)| svc.clone())
            .collect();
        Box::pin(async move { Ok(services) })
    }

    fn create_service(&self, namespace: &str, mut service: Service) -> StoreFuture<'_, Service> {
        let namespace = namespace.to_string();
        Box::pin(async move {
            self.take_failure(StoreOp::CreateService)?;
            let name = service.name_any();
            let mut services = self.services.lock();
            let key = (namespace.clone(), name.clone());
            if services.contains_key(&key) {
                return Err(already_exists("services", &name));
            }
            service.metadata.namespace = Some(namespace);
            self.stamp(&mut service.metadata);
            services.insert(key, service.clone());
            Ok(service)
        })
    }

    fn delete_service(&self, namespace: &str, name: &str) -> StoreFuture<'_, ()> {
        let key = (namespace.to_string(), name.to_string());
        Box::pin(async move {
            self.take_failure(StoreOp::DeleteService)?;
            self.services
                .lock()
                .remove(&key)
                .map(|_| ())
                .ok_or_else(|| OperatorError::not_found("Service", &key.0, &key.1))
        })
    }

    fn get_pod_group(&self, namespace: &str, name: &str) -> StoreFuture<'_, Option<PodGroup>> {
        let group = self
            .pod_groups
            .lock()
            .get(&(namespace.to_string(), name.to_string()))
            .cloned();
        Box::pin(async move { Ok(group) })
    }

    fn create_pod_group(&self, namespace: &str, mut group: PodGroup) -> StoreFuture<'_, PodGroup> {
        let namespace = namespace.to_string();
        Box::pin(async move {
            self.take_failure(StoreOp::CreatePodGroup)?;
            let name = group.name_any();
            let mut groups = self.pod_groups.lock();
            let key = (namespace.clone(), name.clone());
            if groups.contains_key(&key) {
                return Err(already_exists("podgroups", &name));
            }
            group.metadata.namespace = Some(namespace);
            self.stamp(&mut group.metadata);
            groups.insert(key, group.clone());
            Ok(group)
        })
    }

    fn delete_pod_group(&self, namespace: &str, name: &str) -> StoreFuture<'_, ()> {
        let key = (namespace.to_string(), name.to_string());
        Box::pin(async move {
            self.take_failure(StoreOp::DeletePodGroup)?;
            self.pod_groups
                .lock()
                .remove(&key)
                .map(|_| ())
                .ok_or_else(|| OperatorError::not_found("PodGroup", &key.0, &key.1))
        })
    }
}

/// An event captured by [`MemoryRecorder`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// `namespace/name` of the job.
    pub job: String,
    /// Severity.
    pub event_type: EventType,
    /// Reason code.
    pub reason: String,
    /// Message.
    pub message: String,
}

/// [`EventRecorder`] that keeps every event in memory.
#[derive(Default)]
pub struct MemoryRecorder {
    events: Mutex<Vec<RecordedEvent>>,
}

impl MemoryRecorder {
    /// Create an empty recorder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event recorded so far.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Events with the given reason.
    pub fn with_reason(&self, reason: &str) -> Vec<RecordedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.reason == reason)
            .cloned()
            .collect()
    }
}

impl EventRecorder for MemoryRecorder {
    fn record(&self, job: &XGBoostJob, event_type: EventType, reason: &str, message: String) {
        self.events.lock().push(RecordedEvent {
            job: format!("{}/{}", job.namespace().unwrap_or_default(), job.name_any()),
            event_type,
            reason: reason.to_string(),
            message,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pod(name: &str, labels: &[(&str, &str)]) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect(),
                ),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn create_list_delete_pods() {
        let store = MemoryStore::new();
        store
            .create_pod("default", pod("a", &[("job-name", "iris")]))
            .await
            .unwrap();
        store
            .create_pod("default", pod("b", &[("job-name", "other")]))
            .await
            .unwrap();

        let selector = BTreeMap::from([("job-name".to_string(), "iris".to_string())]);
        let listed = store.list_pods("default", &selector).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].name_any(), "a");
        assert_eq!(
            listed[0].status.as_ref().unwrap().phase.as_deref(),
            Some("Pending")
        );

        store.delete_pod("default", "a").await.unwrap();
        let err = store.delete_pod("default", "a").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn duplicate_create_conflicts() {
        let store = MemoryStore::new();
        store.create_pod("default", pod("a", &[])).await.unwrap();
        let err = store.create_pod("default", pod("a", &[])).await.unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn injected_failures_fire_once() {
        let store = MemoryStore::new();
        store.fail_next(StoreOp::CreatePod, OperatorError::Timeout("slow".into()));

        let err = store.create_pod("default", pod("a", &[])).await.unwrap_err();
        assert!(err.is_timeout());
        assert!(store.create_pod("default", pod("a", &[])).await.is_ok());
    }
}
