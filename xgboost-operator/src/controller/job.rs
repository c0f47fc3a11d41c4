//! Per-key sync of an XGBoostJob.
//!
//! One sync:
//! 1. Loads and defaults the job, rejecting invalid specs
//! 2. Requeues the job while earlier creations/deletions are unobserved
//! 3. Ensures the gang-scheduling pod group
//! 4. Applies the backoff limit and the active deadline
//! 5. Cleans up terminated jobs, or diffs pods and services per replica type
//! 6. Persists the status when it changed

use super::expectations::ExpectationKey;
use super::labels::{REPLICA_TYPE_LABEL, gen_owner_reference, gen_pod_group_name, job_key, split_key};
use super::status::{
    JOB_CREATED_REASON, JOB_FAILED_REASON, JOB_INVALID_SPEC_REASON, has_condition, is_failed,
    is_succeeded, now, update_job_conditions,
};
use super::{JobController, ReconcileAction};
use crate::client::EventType;
use crate::crd::{
    CleanPodPolicy, JobConditionType, JobStatus, PodGroup, PodGroupSpec, ReplicaSpec,
    RestartPolicy, XGBoostJob, set_defaults, validate_spec,
};
use crate::error::{OperatorError, OperatorResult};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;
use std::time::Duration;

const JOB_TERMINATED_REASON: &str = "JobTerminated";
const SUCCESSFUL_DELETE_POD_GROUP_REASON: &str = "SuccessfulDeletePodGroup";
const FAILED_DELETE_POD_GROUP_REASON: &str = "FailedDeletePodGroup";
const SUCCESSFUL_DELETE_JOB_REASON: &str = "SuccessfulDeleteJob";
const FAILED_DELETE_JOB_REASON: &str = "FailedDeleteJob";

/// Outcome of the TTL check of a finished job.
enum Cleanup {
    /// The job stays.
    Kept,
    /// The job was deleted.
    Deleted,
    /// The job expires after the given duration.
    Due(Duration),
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

/// Pods that are neither finished nor being deleted.
fn is_active(pod: &Pod) -> bool {
    pod.metadata.deletion_timestamp.is_none()
        && !matches!(pod_phase(pod), Some("Succeeded") | Some("Failed"))
}

/// Whether container restarts of `OnFailure`/`Always` replicas reached `limit`.
///
/// Those restarts happen in place, so the pod phase never reports them.
fn past_backoff_limit(replicas: &BTreeMap<String, ReplicaSpec>, pods: &[Pod], limit: i32) -> bool {
    let restarts: i32 = replicas
        .iter()
        .filter(|(_, spec)| {
            matches!(
                spec.restart_policy(),
                RestartPolicy::OnFailure | RestartPolicy::Always
            )
        })
        .flat_map(|(replica_type, _)| {
            let replica_type = replica_type.to_lowercase();
            pods.iter().filter(move |pod| {
                pod.labels().get(REPLICA_TYPE_LABEL) == Some(&replica_type)
                    && pod_phase(pod) == Some("Running")
            })
        })
        .filter_map(|pod| pod.status.as_ref())
        .flat_map(|status| {
            status
                .init_container_statuses
                .iter()
                .flatten()
                .chain(status.container_statuses.iter().flatten())
        })
        .map(|c| c.restart_count)
        .sum();

    if limit == 0 {
        return restarts > 0;
    }
    restarts >= limit
}

/// Time left before the active deadline, `None` without a deadline.
fn active_deadline_remaining(job: &XGBoostJob, status: &JobStatus) -> Option<Duration> {
    let deadline = job.spec.run_policy.active_deadline_seconds?;
    let start = status.start_time.as_ref()?;
    let elapsed = (chrono::Utc::now() - start.0).num_seconds();
    Some(Duration::from_secs(deadline.saturating_sub(elapsed).max(0) as u64))
}

impl JobController {
    /// Sync the job stored under `key`.
    ///
    /// Errors ask the caller to count a retry and requeue with backoff.
    pub async fn sync_job(&self, key: &str) -> OperatorResult<ReconcileAction> {
        let started = std::time::Instant::now();
        let (namespace, name) = split_key(key)?;

        let Some(mut job) = self.ctx.store.get_job(namespace, name).await? else {
            tracing::info!(job = %key, "XGBoostJob has been deleted");
            self.expectations.delete_job(key);
            return Ok(ReconcileAction::Done);
        };

        set_defaults(&mut job.spec);
        if let Err(e) = validate_spec(&job.spec) {
            self.reject_invalid_job(&job, &e).await?;
            return Ok(ReconcileAction::Done);
        }

        if job.metadata.deletion_timestamp.is_some() {
            tracing::debug!(job = %key, "XGBoostJob is being deleted, skipping");
            return Ok(ReconcileAction::Done);
        }

        // Expired records count as satisfied, so the requeue guarantees a
        // pass even when the watch never reports the change.
        if let Some(wait) = self.pending_expectations(&job) {
            tracing::debug!(
                job = %key,
                wait_ms = wait.as_millis() as u64,
                "Expectations not satisfied yet, skipping"
            );
            return Ok(ReconcileAction::Requeue(wait));
        }

        // A finished job's group was deleted on termination and stays gone.
        let finished = {
            let status = job.job_status();
            is_succeeded(&status) || is_failed(&status)
        };
        if self.ctx.config.enable_gang_scheduling && !finished {
            if let Err(e) = self.sync_pod_group(&job).await {
                tracing::warn!(job = %key, error = %e, "Failed to sync PodGroup");
            }
        }

        let action = self.reconcile_jobs(&job).await;
        tracing::info!(
            job = %key,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Finished syncing XGBoostJob"
        );
        action
    }

    /// Whether every pod and service expectation of `job` is satisfied.
    pub fn satisfied_expectations(&self, job: &XGBoostJob) -> bool {
        self.pending_expectations(job).is_none()
    }

    /// Time until the first outstanding expectation of `job` expires.
    fn pending_expectations(&self, job: &XGBoostJob) -> Option<Duration> {
        let key = job_key(job);
        job.spec
            .xgb_replica_specs
            .keys()
            .flat_map(|replica_type| {
                [
                    ExpectationKey::pods(&key, replica_type),
                    ExpectationKey::services(&key, replica_type),
                ]
            })
            .filter_map(|key| self.expectations.pending(&key))
            .min()
    }

    /// Mark a job with an invalid spec as failed.
    ///
    /// Nothing is written when the job has already failed.
    async fn reject_invalid_job(
        &self,
        job: &XGBoostJob,
        error: &OperatorError,
    ) -> OperatorResult<()> {
        let mut status = job.job_status();
        if is_failed(&status) {
            return Ok(());
        }

        let message = format!("Failed to validate XGBoostJob {}: {}", job.name_any(), error);
        tracing::warn!(job = %job_key(job), error = %error, "Rejecting invalid XGBoostJob");
        self.ctx
            .recorder
            .record(job, EventType::Warning, JOB_INVALID_SPEC_REASON, message.clone());

        update_job_conditions(
            &mut status,
            JobConditionType::Failed,
            JOB_INVALID_SPEC_REASON,
            &message,
        );
        status.last_reconcile_time = Some(now());
        self.ctx.store.update_job_status(job, &status).await
    }

    /// Create the pod group of a gang-scheduled job unless it exists.
    async fn sync_pod_group(&self, job: &XGBoostJob) -> OperatorResult<()> {
        let namespace = job.namespace().unwrap_or_default();
        let name = gen_pod_group_name(&job.name_any());

        if self.ctx.store.get_pod_group(&namespace, &name).await?.is_some() {
            return Ok(());
        }

        let min_member = job
            .spec
            .run_policy
            .scheduling_policy
            .as_ref()
            .and_then(|p| p.min_available)
            .unwrap_or_else(|| job.total_replicas());

        let group = PodGroup {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                owner_references: Some(vec![gen_owner_reference(job)?]),
                ..Default::default()
            },
            spec: PodGroupSpec { min_member },
        };

        match self.ctx.store.create_pod_group(&namespace, group).await {
            Ok(_) => {
                tracing::info!(job = %job.name_any(), pod_group = %name, min_member, "Created PodGroup");
                Ok(())
            }
            Err(e) if e.is_conflict() => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn reconcile_jobs(&self, job: &XGBoostJob) -> OperatorResult<ReconcileAction> {
        let key = job_key(job);
        let name = job.name_any();
        let namespace = job.namespace().unwrap_or_default();
        let replicas = &job.spec.xgb_replica_specs;

        tracing::info!(job = %key, "Reconciling XGBoostJob");

        let selector = self.labels.job_labels(&name);
        let pods = self.ctx.store.list_pods(&namespace, &selector).await?;
        let services = self.ctx.store.list_services(&namespace, &selector).await?;

        let old_status = job.job_status();
        let mut status = old_status.clone();
        if status.start_time.is_none() {
            status.start_time = Some(now());
        }
        if !has_condition(&status, JobConditionType::Created) {
            let message = format!("XGBoostJob {} is created.", name);
            tracing::info!(job = %key, "{}", message);
            update_job_conditions(
                &mut status,
                JobConditionType::Created,
                JOB_CREATED_REASON,
                &message,
            );
        }

        let previous_retry = self.ctx.retries.num_requeues(&key);
        let active = pods.iter().filter(|p| is_active(p)).count() as i32;
        let failed = pods
            .iter()
            .filter(|p| pod_phase(p) == Some("Failed"))
            .count() as i32;
        let previous_failed: i32 = old_status.replica_statuses.values().map(|s| s.failed).sum();

        let mut failure_message = None;
        if let Some(limit) = job.spec.run_policy.backoff_limit {
            // A failure already in the status was seen by an earlier pass whose
            // status write may have failed; it is not counted again.
            let has_new_failure = failed > previous_failed;
            let exceeds_backoff_limit = has_new_failure
                && active != job.total_replicas()
                && i64::from(previous_retry) + 1 > i64::from(limit);

            if exceeds_backoff_limit || past_backoff_limit(replicas, &pods, limit) {
                failure_message = Some(format!(
                    "XGBoostJob {} has failed because it has reached the specified backoff limit",
                    name
                ));
            }
        }
        if failure_message.is_none()
            && active_deadline_remaining(job, &status).is_some_and(|d| d.is_zero())
        {
            failure_message = Some(format!(
                "XGBoostJob {} has failed because it was active longer than specified deadline",
                name
            ));
        }

        if is_succeeded(&status) || is_failed(&status) || failure_message.is_some() {
            return self
                .terminate_job(job, &pods, &old_status, status, failure_message)
                .await;
        }

        let mut restarts = 0;
        for (replica_type, spec) in replicas {
            restarts += self
                .reconcile_pods(job, &mut status, &pods, replica_type, spec, replicas)
                .await
                .inspect_err(|e| {
                    tracing::warn!(job = %key, replica_type = %replica_type, error = %e, "reconcile_pods failed");
                })?;
            self.reconcile_services(job, &services, replica_type, spec)
                .await
                .inspect_err(|e| {
                    tracing::warn!(job = %key, replica_type = %replica_type, error = %e, "reconcile_services failed");
                })?;
        }

        self.update_job_status(job, replicas, &mut status)?;
        self.persist_status(job, &old_status, status.clone()).await?;

        if restarts > 0 {
            return Ok(ReconcileAction::Backoff);
        }
        if is_succeeded(&status) || is_failed(&status) {
            return Ok(ReconcileAction::Wait);
        }
        Ok(active_deadline_remaining(job, &status)
            .map_or(ReconcileAction::Wait, ReconcileAction::Requeue))
    }

    /// Clean up a finished job and record why it finished.
    async fn terminate_job(
        &self,
        job: &XGBoostJob,
        pods: &[Pod],
        old_status: &JobStatus,
        mut status: JobStatus,
        failure_message: Option<String>,
    ) -> OperatorResult<ReconcileAction> {
        self.delete_pods_and_services(job, pods).await?;

        if self.ctx.config.enable_gang_scheduling {
            self.delete_pod_group(job).await?;
        }

        if let Some(message) = failure_message {
            tracing::info!(job = %job_key(job), "{}", message);
            self.ctx
                .recorder
                .record(job, EventType::Normal, JOB_FAILED_REASON, message.clone());
            status.completion_time.get_or_insert_with(now);
            update_job_conditions(&mut status, JobConditionType::Failed, JOB_FAILED_REASON, &message);
        }

        // Pods of a succeeded job may already be gone.
        if is_succeeded(&status) {
            for counters in status.replica_statuses.values_mut() {
                counters.succeeded += counters.active;
                counters.active = 0;
            }
        }

        match self.cleanup_job(job, &status).await? {
            Cleanup::Deleted => Ok(ReconcileAction::Done),
            Cleanup::Due(remaining) => {
                self.persist_status(job, old_status, status).await?;
                Ok(ReconcileAction::Requeue(remaining))
            }
            Cleanup::Kept => {
                self.persist_status(job, old_status, status).await?;
                Ok(ReconcileAction::Done)
            }
        }
    }

    /// Delete the pods selected by the clean pod policy, each with its service.
    async fn delete_pods_and_services(&self, job: &XGBoostJob, pods: &[Pod]) -> OperatorResult<()> {
        let policy = job.spec.run_policy.clean_pod_policy.unwrap_or_default();
        if policy == CleanPodPolicy::None {
            return Ok(());
        }

        let key = job_key(job);
        for pod in pods {
            if pod.metadata.deletion_timestamp.is_some() {
                continue;
            }
            if policy == CleanPodPolicy::Running
                && !matches!(pod_phase(pod), Some("Running") | Some("Pending"))
            {
                continue;
            }

            let replica_type = pod
                .labels()
                .get(REPLICA_TYPE_LABEL)
                .cloned()
                .unwrap_or_default();
            let name = pod.name_any();
            self.delete_pod(job, &ExpectationKey::pods(&key, &replica_type), &name)
                .await?;
            self.delete_service(job, &name).await?;
        }
        Ok(())
    }

    async fn delete_pod_group(&self, job: &XGBoostJob) -> OperatorResult<()> {
        let namespace = job.namespace().unwrap_or_default();
        let name = gen_pod_group_name(&job.name_any());

        if self.ctx.store.get_pod_group(&namespace, &name).await?.is_none() {
            return Ok(());
        }

        self.ctx.recorder.record(
            job,
            EventType::Normal,
            JOB_TERMINATED_REASON,
            "Job is terminated, deleting PodGroup".to_string(),
        );
        match self.ctx.store.delete_pod_group(&namespace, &name).await {
            Ok(()) => {
                self.ctx.recorder.record(
                    job,
                    EventType::Normal,
                    SUCCESSFUL_DELETE_POD_GROUP_REASON,
                    format!("Deleted PodGroup: {}", name),
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                self.ctx.recorder.record(
                    job,
                    EventType::Warning,
                    FAILED_DELETE_POD_GROUP_REASON,
                    format!("Error deleting: {}", e),
                );
                Err(e)
            }
        }
    }

    /// Delete a finished job once `ttlSecondsAfterFinished` has passed.
    async fn cleanup_job(&self, job: &XGBoostJob, status: &JobStatus) -> OperatorResult<Cleanup> {
        let Some(ttl) = job.spec.run_policy.ttl_seconds_after_finished else {
            return Ok(Cleanup::Kept);
        };
        let Some(completed) = status.completion_time.as_ref() else {
            return Ok(Cleanup::Kept);
        };

        let expires = completed.0 + chrono::Duration::seconds(i64::from(ttl));
        let remaining = expires - chrono::Utc::now();
        if remaining > chrono::Duration::zero() {
            return Ok(Cleanup::Due(remaining.to_std().unwrap_or_default()));
        }

        let namespace = job.namespace().unwrap_or_default();
        let name = job.name_any();
        match self.ctx.store.delete_job(&namespace, &name).await {
            Ok(()) => {
                tracing::info!(job = %job_key(job), ttl, "Deleted finished XGBoostJob");
                self.ctx.recorder.record(
                    job,
                    EventType::Normal,
                    SUCCESSFUL_DELETE_JOB_REASON,
                    format!("Deleted job: {}", name),
                );
                Ok(Cleanup::Deleted)
            }
            Err(e) if e.is_not_found() => Ok(Cleanup::Deleted),
            Err(e) => {
                self.ctx.recorder.record(
                    job,
                    EventType::Warning,
                    FAILED_DELETE_JOB_REASON,
                    format!("Error deleting: {}", e),
                );
                Err(e)
            }
        }
    }

    /// Write `status` back unless it equals `old_status`.
    async fn persist_status(
        &self,
        job: &XGBoostJob,
        old_status: &JobStatus,
        mut status: JobStatus,
    ) -> OperatorResult<()> {
        if &status == old_status {
            tracing::trace!(job = %job_key(job), "Status unchanged");
            return Ok(());
        }
        status.last_reconcile_time = Some(now());
        self.ctx.store.update_job_status(job, &status).await
    }
}
