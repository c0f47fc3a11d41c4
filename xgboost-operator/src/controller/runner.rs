//! Controller runtime wiring.
//!
//! A `kube::runtime::Controller` reconciles XGBoostJobs, at most `threadiness`
//! at a time and never one job twice at once. The pod and service watches
//! first update the expectations, then trigger the owning job.

use super::labels::job_key;
use super::{ControllerContext, JobController, ReconcileAction};
use crate::client::label_selector;
use crate::crd::XGBoostJob;
use crate::error::OperatorError;
use futures::{SinkExt, Stream, StreamExt};
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::runtime::controller::{Action, Config as RuntimeConfig};
use kube::runtime::reflector::{self, ObjectRef, Store};
use kube::runtime::watcher::{self, Event};
use kube::runtime::{Controller, WatchStreamExt};
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use std::collections::HashSet;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

impl JobController {
    /// Sync one key and turn the outcome into a controller [`Action`].
    ///
    /// Restarts and errors count a retry; a finished or missing job forgets
    /// its retries.
    pub async fn process_key(&self, key: &str) -> Action {
        match self.sync_job(key).await {
            Ok(ReconcileAction::Requeue(delay)) => {
                tracing::debug!(job = %key, delay_ms = delay.as_millis() as u64, "Requeue");
                Action::requeue(delay)
            }
            Ok(ReconcileAction::Backoff) => Action::requeue(self.ctx.retries.requeue(key)),
            Ok(ReconcileAction::Wait) => Action::await_change(),
            Ok(ReconcileAction::Done) => {
                self.ctx.retries.forget(key);
                Action::await_change()
            }
            Err(e) => {
                tracing::error!(job = %key, error = %e, "Error syncing XGBoostJob");
                Action::requeue(self.ctx.retries.requeue(key))
            }
        }
    }
}

/// Reconcile entry point handed to the controller runtime.
pub async fn reconcile(
    job: Arc<XGBoostJob>,
    controller: Arc<JobController>,
) -> Result<Action, OperatorError> {
    Ok(controller.process_key(&job_key(&job)).await)
}

/// Error policy handed to the controller runtime.
pub fn error_policy(
    job: Arc<XGBoostJob>,
    error: &OperatorError,
    controller: Arc<JobController>,
) -> Action {
    let key = job_key(&job);
    tracing::error!(job = %key, error = %error, "XGBoostJob reconciliation error");
    Action::requeue(controller.retries().requeue(&key))
}

/// Add or delete reported by [`ChangeDetector`].
enum Change<K> {
    Added(K),
    Deleted(K),
}

/// Tells adds from updates by looking watch events up in a reflector store
/// before the store applies them.
///
/// Objects missing from a relist are reported as deleted.
struct ChangeDetector<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Eq + std::hash::Hash,
{
    reader: Store<K>,
    relisted: Option<HashSet<ObjectRef<K>>>,
}

impl<K> ChangeDetector<K>
where
    K: Resource + Clone + 'static,
    K::DynamicType: Clone + Default + Eq + std::hash::Hash,
{
    fn new(reader: Store<K>) -> Self {
        Self {
            reader,
            relisted: None,
        }
    }

    fn changes(&mut self, event: &Event<K>) -> Vec<Change<K>> {
        match event {
            Event::Init => {
                self.relisted = Some(HashSet::new());
                Vec::new()
            }
            Event::InitApply(object) | Event::Apply(object) => {
                let object_ref = ObjectRef::from_obj(object);
                let known = self.reader.get(&object_ref).is_some();
                if let Some(relisted) = self.relisted.as_mut() {
                    relisted.insert(object_ref);
                }
                if known {
                    Vec::new()
                } else {
                    vec![Change::Added(object.clone())]
                }
            }
            Event::Delete(object) => vec![Change::Deleted(object.clone())],
            Event::InitDone => {
                let Some(relisted) = self.relisted.take() else {
                    return Vec::new();
                };
                self.reader
                    .state()
                    .into_iter()
                    .map(|object| K::clone(&object))
                    .filter(|object| !relisted.contains(&ObjectRef::from_obj(object)))
                    .map(Change::Deleted)
                    .collect()
            }
        }
    }
}

/// Watch `api`, feed adds and deletes to `handle` and yield every touched
/// object so the runtime can trigger its owner.
fn observed_stream<K, H>(
    kind: &'static str,
    api: Api<K>,
    config: watcher::Config,
    mut handle: H,
) -> impl Stream<Item = Result<K, watcher::Error>> + Send + 'static
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    H: FnMut(Change<K>) + Send + 'static,
{
    let (reader, writer) = reflector::store();
    let mut detector = ChangeDetector::new(reader);
    watcher::watcher(api, config)
        .default_backoff()
        .inspect(move |event| match event {
            Ok(event) => detector.changes(event).into_iter().for_each(&mut handle),
            Err(e) => tracing::warn!(kind, error = %e, "Watch error"),
        })
        .reflect(writer)
        .touched_objects()
}

/// Ticks every `period` until the receiver is dropped.
fn resync_ticks(period: Duration) -> impl Stream<Item = ()> + Send + Sync + 'static {
    let (mut tx, rx) = futures::channel::mpsc::channel(1);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            tracing::debug!("Resyncing XGBoostJobs");
            if tx.send(()).await.is_err() {
                break;
            }
        }
    });
    rx
}

/// The XGBoostJob operator: a controller runtime around a [`JobController`].
pub struct Operator {
    client: Client,
    controller: Arc<JobController>,
    namespace: Option<String>,
    resync_period: Option<Duration>,
}

impl Operator {
    /// Create an operator watching `namespace`, or every namespace.
    pub fn new(client: Client, ctx: ControllerContext, namespace: Option<String>) -> Self {
        Self {
            client,
            controller: Arc::new(JobController::new(Arc::new(ctx))),
            namespace,
            resync_period: None,
        }
    }

    /// Reconcile every known job at this interval.
    pub fn with_resync_period(mut self, period: Duration) -> Self {
        self.resync_period = (!period.is_zero()).then_some(period);
        self
    }

    /// The controller driven by this operator.
    pub fn controller(&self) -> &JobController {
        &self.controller
    }

    fn api<K>(&self) -> Api<K>
    where
        K: Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        <K as Resource>::DynamicType: Default,
    {
        match &self.namespace {
            Some(namespace) => Api::namespaced(self.client.clone(), namespace),
            None => Api::all(self.client.clone()),
        }
    }

    /// Run until Ctrl-C or SIGTERM, then let running reconciles finish.
    pub async fn run(self, threadiness: usize) {
        let concurrency = u16::try_from(threadiness.max(1)).unwrap_or(u16::MAX);
        tracing::info!(
            threadiness = concurrency,
            namespace = self.namespace.as_deref().unwrap_or("<all>"),
            "Starting XGBoostJob operator"
        );

        let (reader, writer) = reflector::store();
        let jobs = {
            let controller = Arc::clone(&self.controller);
            watcher::watcher(self.api::<XGBoostJob>(), watcher::Config::default())
                .default_backoff()
                .inspect(move |event| match event {
                    Ok(Event::Delete(job)) => controller.on_job_deleted(job),
                    Ok(_) => {}
                    Err(e) => tracing::warn!(kind = "xgboostjobs", error = %e, "Watch error"),
                })
                .reflect(writer)
                .applied_objects()
        };

        let owned = watcher::Config::default()
            .labels(&label_selector(&self.controller.labels().group_labels()));
        let pods = {
            let controller = Arc::clone(&self.controller);
            observed_stream("pods", self.api::<Pod>(), owned.clone(), move |change| {
                match change {
                    Change::Added(pod) => controller.on_pod_added(&pod),
                    Change::Deleted(pod) => controller.on_pod_deleted(&pod),
                }
            })
        };
        let services = {
            let controller = Arc::clone(&self.controller);
            observed_stream("services", self.api::<Service>(), owned, move |change| {
                match change {
                    Change::Added(svc) => controller.on_service_added(&svc),
                    Change::Deleted(svc) => controller.on_service_deleted(&svc),
                }
            })
        };

        let mut runtime = Controller::for_stream(jobs, reader)
            .owns_stream(pods)
            .owns_stream(services)
            .with_config(RuntimeConfig::default().concurrency(concurrency))
            .shutdown_on_signal();
        if let Some(period) = self.resync_period {
            runtime = runtime.reconcile_all_on(resync_ticks(period));
        }

        runtime
            .run(reconcile, error_policy, Arc::clone(&self.controller))
            .for_each(|result| async move {
                match result {
                    Ok((job, action)) => {
                        tracing::debug!(job = %job.name, ?action, "Reconciled XGBoostJob");
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "XGBoostJob controller stream error");
                    }
                }
            })
            .await;

        tracing::info!("XGBoostJob operator stopped");
    }
}
