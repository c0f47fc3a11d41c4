//! Kubernetes API backed store and event recorder.

use super::{EventRecorder, EventType, ObjectStore, StoreFuture, label_selector};
use crate::crd::{JobStatus, PodGroup, XGBoostJob};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::{DeleteParams, ListParams, Patch, PatchParams, PostParams};
use kube::runtime::events::{Event, EventType as KubeEventType, Recorder, Reporter};
use kube::{Api, Client, Resource, ResourceExt};
use std::collections::BTreeMap;

/// [`ObjectStore`] talking to the Kubernetes API server.
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl KubeStore {
    /// Create a store on top of a connected client.
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api<K>(&self, namespace: &str) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), namespace)
    }
}

impl ObjectStore for KubeStore {
    fn get_job(&self, namespace: &str, name: &str) -> StoreFuture<'_, Option<XGBoostJob>> {
        let api: Api<XGBoostJob> = self.api(namespace);
        let name = name.to_string();
        Box::pin(async move { Ok(api.get_opt(&name).await?) })
    }

    fn update_job_status(&self, job: &XGBoostJob, status: &JobStatus) -> StoreFuture<'_, ()> {
        let api: Api<XGBoostJob> = self.api(&job.namespace().unwrap_or_default());
        let name = job.name_any();
        let patch = serde_json::json!({ "status": status });
        Box::pin(async move {
            api.patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
                .await?;
            Ok(())
        })
    }

    fn delete_job(&self, namespace: &str, name: &str) -> StoreFuture<'_, ()> {
        let api: Api<XGBoostJob> = self.api(namespace);
        let name = name.to_string();
        Box::pin(async move {
            api.delete(&name, &DeleteParams::background()).await?;
            Ok(())
        })
    }

    fn list_pods(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> StoreFuture<'_, Vec<Pod>> {
        let api: Api<Pod> = self.api(namespace);
        let params = ListParams::default().labels(&label_selector(selector));
        Box::pin(async move { Ok(api.list(&params).await?.items) })
    }

    fn create_pod(&self, namespace: &str, pod: Pod) -> StoreFuture<'_, Pod> {
        let api: Api<Pod> = self.api(namespace);
        Box::pin(async move { Ok(api.create(&PostParams::default(), &pod).await?) })
    }

    fn delete_pod(&self, namespace: &str, name: &str) -> StoreFuture<'_, ()> {
        let api: Api<Pod> = self.api(namespace);
        let name = name.to_string();
        Box::pin(async move {
            api.delete(&name, &DeleteParams::default()).await?;
            Ok(())
        })
    }

    fn list_services(
        &self,
        namespace: &str,
        selector: &BTreeMap<String, String>,
    ) -> StoreFuture<'_, Vec<Service>> {
        let api: Api<Service> = self.api(namespace);
        let params = ListParams::default().labels(&label_selector(selector));
        Box::pin(async move { Ok(api.list(&params).await?.items) })
    }

    fn create_service(&self, namespace: &str, service: Service) -> StoreFuture<'_, Service> {
        let api: Api<Service> = self.api(namespace);
        Box::pin(async move { Ok(api.create(&PostParams::default(), &service).await?) })
    }

    fn delete_service(&self, namespace: &str, name: &str) -> StoreFuture<'_, ()> {
        let api: Api<Service> = self.api(namespace);
        let name = name.to_string();
        Box::pin(async move {
            api.delete(&name, &DeleteParams::default()).await?;
            Ok(())
        })
    }

    fn get_pod_group(&self, namespace: &str, name: &str) -> StoreFuture<'_, Option<PodGroup>> {
        let api: Api<PodGroup> = self.api(namespace);
        let name = name.to_string();
        Box::pin(async move { Ok(api.get_opt(&name).await?) })
    }

    fn create_pod_group(&self, namespace: &str, group: PodGroup) -> StoreFuture<'_, PodGroup> {
        let api: Api<PodGroup> = self.api(namespace);
        Box::pin(async move { Ok(api.create(&PostParams::default(), &group).await?) })
    }

    fn delete_pod_group(&self, namespace: &str, name: &str) -> StoreFuture<'_, ()> {
        let api: Api<PodGroup> = self.api(namespace);
        let name = name.to_string();
        Box::pin(async move {
            api.delete(&name, &DeleteParams::default()).await?;
            Ok(())
        })
    }
}

/// [`EventRecorder`] publishing `events.k8s.io` events.
///
/// Each event is published from its own task so the reconcile loop never
/// waits on the API server.
#[derive(Clone)]
pub struct KubeRecorder {
    recorder: Recorder,
}

impl KubeRecorder {
    /// Create a recorder reporting as `controller`.
    pub fn new(client: Client, controller: &str) -> Self {
        let reporter = Reporter {
            controller: controller.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

impl EventRecorder for KubeRecorder {
    fn record(&self, job: &XGBoostJob, event_type: EventType, reason: &str, message: String) {
        let recorder = self.recorder.clone();
        let reference = job.object_ref(&());
        let event = Event {
            type_: match event_type {
                EventType::Normal => KubeEventType::Normal,
                EventType::Warning => KubeEventType::Warning,
            },
            reason: reason.to_string(),
            note: Some(message),
            action: "Reconcile".to_string(),
            secondary: None,
        };

        tokio::spawn(async move {
            if let Err(e) = recorder.publish(&event, &reference).await {
                tracing::warn!(
                    error = %e,
                    reason = %event.reason,
                    "Failed to publish event"
                );
            }
        });
    }
}
