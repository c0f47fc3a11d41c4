//! Store and event seams between the reconcilers and the cluster.
//!
//! The reconcilers never talk to the Kubernetes API directly. They go through
//! two traits:
//!
//! - [`ObjectStore`]: CRUD on jobs, pods, services and pod groups
//! - [`EventRecorder`]: fire-and-forget Kubernetes events on a job
//!
//! [`KubeStore`]/[`KubeRecorder`] back them with a live cluster,
//! [`MemoryStore`]/[`MemoryRecorder`] with process memory for tests and
//! local runs.

mod api;
mod memory;

pub use api::{KubeRecorder, KubeStore};
pub use memory::{MemoryRecorder, MemoryStore, RecordedEvent, StoreOp};

use crate::crd::{JobStatus, PodGroup, XGBoostJob};
use crate::error::OperatorResult;
use k8s_openapi::api::core::v1::{Pod, Service};
use std::collections::BTreeMap;
use std::future::Future;
use std::pin::Pin;

/// Type alias for async store futures.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = OperatorResult<T>> + Send + 'a>>;

/// Access to the objects the controller reads and mutates.
///
/// # Implementation Notes
///
/// - Deleting an absent object returns an error for which
///   [`is_not_found`](crate::OperatorError::is_not_found) holds.
/// - Creating an object whose create request timed out returns an error for
///   which [`is_timeout`](crate::OperatorError::is_timeout) holds.
/// - List calls select by exact label match within one namespace.
pub trait ObjectStore: Send + Sync {
    /// Fetch a job. `None` when the job does not exist.
    fn get_job(&self, namespace: &str, name: &str) -> StoreFuture<'_, Option<XGBoostJob>>;

    /// Replace the status subresource of a job.
    fn update_job_status(&self, job: &XGBoostJob, status: &JobStatus) -> StoreFuture<'_, ()>;

    /// Delete a job.
    fn delete_job(&self, namespace: &str, name: &str) -> StoreFuture<'_, ()>;

    /// List pods matching every label of `selector`.
    fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> StoreFuture<'_, Vec<Pod>>;

    /// Create a pod.
    fn create_pod(&self, namespace: &str, pod: Pod) -> StoreFuture<'_, Pod>;

    /// Delete a pod.
    fn delete_pod(&self, namespace: &str, name: &str) -> StoreFuture<'_, ()>;

    /// List services matching every label of `selector`.
    fn list_services(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> StoreFuture<'_, Vec<Service>>;

    /// Create a service.
    fn create_service(&self, namespace: &str, service: Service) -> StoreFuture<'_, Service>;

    /// Delete a service.
    fn delete_service(&self, namespace: &str, name: &str) -> StoreFuture<'_, ()>;

    /// Fetch a pod group. `None` when it does not exist.
    fn get_pod_group(&self, namespace: &str, name: &str) -> StoreFuture<'_, Option<PodGroup>>;

    /// Create a pod group.
    fn create_pod_group(&self, namespace: &str, group: PodGroup) -> StoreFuture<'_, PodGroup>;

    /// Delete a pod group.
    fn delete_pod_group(&self, namespace: &str, name: &str) -> StoreFuture<'_, ()>;
}

/// Severity of a recorded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    /// Informational.
    Normal,
    /// Something the user should look at.
    Warning,
}

/// Sink for Kubernetes events attached to a job.
///
/// Recording must not block the caller and must not fail.
pub trait EventRecorder: Send + Sync {
    /// Record an event on `job`.
    fn record(&self, job: &XGBoostJob, event_type: EventType, reason: &str, message: String);
}

/// Render a label map as a label selector string.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
