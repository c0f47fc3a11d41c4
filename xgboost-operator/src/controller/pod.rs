//! Pod reconciliation for one replica type.

use super::JobController;
use super::expectations::ExpectationKey;
use super::labels::{
    JOB_ROLE_LABEL, filter_for_replica_type, gen_general_name, gen_owner_reference,
    gen_pod_group_name, job_key, slices,
};
use super::status::{initialize_replica_status, update_replica_status};
use crate::client::EventType;
use crate::crd::{JobStatus, ReplicaSpec, RestartPolicy, XGBoostJob};
use crate::error::OperatorResult;
use k8s_openapi::api::core::v1::{Pod, PodSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;
use std::collections::BTreeMap;

const EXITED_WITH_CODE_REASON: &str = "ExitedWithCode";
const SUCCESSFUL_CREATE_POD_REASON: &str = "SuccessfulCreatePod";
const FAILED_CREATE_POD_REASON: &str = "FailedCreatePod";
const SUCCESSFUL_DELETE_POD_REASON: &str = "SuccessfulDeletePod";
const FAILED_DELETE_POD_REASON: &str = "FailedDeletePod";
const POD_TEMPLATE_RESTART_POLICY_REASON: &str = "SettedPodTemplateRestartPolicy";
const POD_TEMPLATE_SCHEDULER_NAME_REASON: &str = "SettedPodTemplateSchedulerName";

/// Annotation telling kube-batch which pod group a pod belongs to.
pub const POD_GROUP_ANNOTATION: &str = "scheduling.k8s.io/group-name";

/// Exit codes from 128 up are signals and other transient failures.
pub fn is_retryable_exit_code(code: i32) -> bool {
    code >= 128
}

/// Exit code of `container_name` when it has terminated.
fn terminated_exit_code(pod: &Pod, container_name: &str) -> Option<i32> {
    pod.status
        .as_ref()?
        .container_statuses
        .as_ref()?
        .iter()
        .find(|s| s.name == container_name)?
        .state
        .as_ref()?
        .terminated
        .as_ref()
        .map(|t| t.exit_code)
}

fn pod_phase(pod: &Pod) -> Option<&str> {
    pod.status.as_ref()?.phase.as_deref()
}

impl JobController {
    /// Bring the pods of `replica_type` in line with its replica spec.
    ///
    /// Missing slots get a new pod. Under the `ExitCode` restart policy a
    /// pod that failed with a retryable exit code is deleted so the next
    /// pass recreates it. The replica counters in `status` are recomputed
    /// from scratch.
    ///
    /// Returns the number of pods deleted for recreation.
    pub async fn reconcile_pods(
        &self,
        job: &XGBoostJob,
        status: &mut JobStatus,
        pods: &[Pod],
        replica_type: &str,
        spec: &ReplicaSpec,
        replicas: &BTreeMap<String, ReplicaSpec>,
    ) -> OperatorResult<usize> {
        let job_key = job_key(job);
        let container_name = self.ctx.policy.default_container_name().to_string();
        let restart_policy = spec.restart_policy();
        let desired = spec.replica_count().max(0) as usize;

        let pods = filter_for_replica_type(pods, replica_type);
        let slots = slices(&pods, desired);

        initialize_replica_status(status, replica_type);

        let mut missing = Vec::new();
        let mut to_restart = Vec::new();
        for (index, slot) in slots.iter().enumerate() {
            let Some(pod) = slot.first() else {
                missing.push(index);
                continue;
            };
            if slot.len() > 1 {
                tracing::warn!(
                    job = %job_key,
                    replica_type = %replica_type,
                    index,
                    count = slot.len(),
                    "More than one pod found for a replica slot"
                );
            }

            let exit_code = terminated_exit_code(pod, &container_name);
            if let Some(code) = exit_code {
                tracing::info!(pod = %pod.name_any(), exit_code = code, "Pod exited");
                self.ctx.recorder.record(
                    job,
                    EventType::Normal,
                    EXITED_WITH_CODE_REASON,
                    format!(
                        "Pod: {}.{} exited with code {}",
                        pod.namespace().unwrap_or_default(),
                        pod.name_any(),
                        code
                    ),
                );
            }

            if restart_policy == RestartPolicy::ExitCode
                && pod_phase(pod) == Some("Failed")
                && exit_code.is_none_or(is_retryable_exit_code)
            {
                to_restart.push(pod.name_any());
            }
            update_replica_status(status, replica_type, pod);
        }

        if missing.is_empty() && to_restart.is_empty() {
            return Ok(0);
        }

        let key = ExpectationKey::pods(&job_key, replica_type);
        if !self.expectations.satisfied(&key) {
            tracing::debug!(
                key = %key,
                missing = missing.len(),
                restarts = to_restart.len(),
                "Waiting for earlier pod changes to be observed"
            );
            return Ok(0);
        }

        let mut pending_adds = missing.len() as i64;
        let mut pending_dels = to_restart.len() as i64;
        self.expectations
            .set_expectations(&key, pending_adds, pending_dels);

        let result = async {
            for name in &to_restart {
                tracing::info!(job = %job_key, pod = %name, "Restarting failed pod");
                self.delete_pod(job, &key, name).await?;
                pending_dels -= 1;
            }
            for &index in &missing {
                self.create_new_pod(job, &key, replica_type, index, spec, replicas)
                    .await?;
                pending_adds -= 1;
            }
            OperatorResult::Ok(())
        }
        .await;

        if let Err(e) = result {
            // Nothing will be observed for the requests never made.
            self.expectations
                .lower_expectations(&key, pending_adds, pending_dels);
            return Err(e);
        }
        Ok(to_restart.len())
    }

    async fn create_new_pod(
        &self,
        job: &XGBoostJob,
        key: &ExpectationKey,
        replica_type: &str,
        index: usize,
        spec: &ReplicaSpec,
        replicas: &BTreeMap<String, ReplicaSpec>,
    ) -> OperatorResult<()> {
        let job_name = job.name_any();
        let namespace = job.namespace().unwrap_or_default();
        let name = gen_general_name(&job_name, replica_type, index);

        let mut labels = self.labels.replica_labels(&job_name, replica_type, index);
        if self.ctx.policy.is_master_role(replicas, replica_type, index) {
            labels.insert(JOB_ROLE_LABEL.to_string(), "master".to_string());
        }

        let mut template = spec.template.clone();
        self.ctx
            .policy
            .set_cluster_spec(job, &mut template, &replica_type.to_lowercase(), index)?;

        let meta = template.metadata.unwrap_or_default();
        let mut pod_labels = meta.labels.unwrap_or_default();
        pod_labels.extend(labels);
        let mut annotations = meta.annotations.unwrap_or_default();

        let mut pod_spec = template.spec.unwrap_or_default();
        if pod_spec.restart_policy.is_some() {
            let msg = "Restart policy in pod template will be overwritten by restart policy in replica spec";
            tracing::warn!(job = %job_name, replica_type = %replica_type, "{}", msg);
            self.ctx.recorder.record(
                job,
                EventType::Warning,
                POD_TEMPLATE_RESTART_POLICY_REASON,
                msg.to_string(),
            );
        }
        pod_spec.restart_policy = Some(spec.restart_policy().pod_restart_policy().to_string());

        if self.ctx.config.enable_gang_scheduling {
            self.apply_gang_scheduler(job, &mut pod_spec, replicas);
            annotations.insert(
                POD_GROUP_ANNOTATION.to_string(),
                gen_pod_group_name(&job_name),
            );
        }

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(pod_labels),
                annotations: (!annotations.is_empty()).then_some(annotations),
                owner_references: Some(vec![gen_owner_reference(job)?]),
                ..Default::default()
            },
            spec: Some(pod_spec),
            status: None,
        };

        match self.ctx.store.create_pod(&namespace, pod).await {
            Ok(_) => {
                tracing::info!(job = %job_name, pod = %name, "Created pod");
                self.ctx.recorder.record(
                    job,
                    EventType::Normal,
                    SUCCESSFUL_CREATE_POD_REASON,
                    format!("Created pod: {}", name),
                );
                Ok(())
            }
            Err(e) if e.is_timeout() => {
                tracing::info!(
                    job = %job_name,
                    pod = %name,
                    "Pod creation timed out, waiting to observe it"
                );
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                tracing::info!(job = %job_name, pod = %name, "Pod already exists");
                self.expectations.creation_observed(key);
                Ok(())
            }
            Err(e) => {
                self.ctx.recorder.record(
                    job,
                    EventType::Warning,
                    FAILED_CREATE_POD_REASON,
                    format!("Error creating: {}", e),
                );
                Err(e)
            }
        }
    }

    /// Use the gang scheduler unless some replica asks for another scheduler.
    fn apply_gang_scheduler(
        &self,
        job: &XGBoostJob,
        pod_spec: &mut PodSpec,
        replicas: &BTreeMap<String, ReplicaSpec>,
    ) {
        let gang_scheduler = &self.ctx.config.gang_scheduler_name;
        let foreign = replicas.values().any(|r| {
            r.template
                .spec
                .as_ref()
                .and_then(|s| s.scheduler_name.as_deref())
                .is_some_and(|name| !name.is_empty() && name != gang_scheduler)
        });

        if foreign {
            let msg = "Another scheduler is specified when gang-scheduling is enabled and it will not be overwritten";
            tracing::warn!(job = %job.name_any(), "{}", msg);
            self.ctx.recorder.record(
                job,
                EventType::Warning,
                POD_TEMPLATE_SCHEDULER_NAME_REASON,
                msg.to_string(),
            );
        } else {
            pod_spec.scheduler_name = Some(gang_scheduler.clone());
        }
    }

    /// Delete a pod owned by `job`. An already deleted pod counts as observed.
    pub(crate) async fn delete_pod(
        &self,
        job: &XGBoostJob,
        key: &ExpectationKey,
        name: &str,
    ) -> OperatorResult<()> {
        let namespace = job.namespace().unwrap_or_default();
        match self.ctx.store.delete_pod(&namespace, name).await {
            Ok(()) => {
                tracing::info!(job = %job.name_any(), pod = %name, "Deleted pod");
                self.ctx.recorder.record(
                    job,
                    EventType::Normal,
                    SUCCESSFUL_DELETE_POD_REASON,
                    format!("Deleted pod: {}", name),
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                tracing::debug!(pod = %name, "Pod already deleted");
                self.expectations.deletion_observed(key);
                Ok(())
            }
            Err(e) => {
                self.ctx.recorder.record(
                    job,
                    EventType::Warning,
                    FAILED_DELETE_POD_REASON,
                    format!("Error deleting: {}", e),
                );
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        ContainerState, ContainerStateTerminated, ContainerStatus, PodStatus,
    };

    fn terminated_pod(container: &str, code: i32) -> Pod {
        Pod {
            status: Some(PodStatus {
                phase: Some("Failed".into()),
                container_statuses: Some(vec![ContainerStatus {
                    name: container.to_string(),
                    state: Some(ContainerState {
                        terminated: Some(ContainerStateTerminated {
                            exit_code: code,
                            ..Default::default()
                        }),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn retryable_codes() {
        assert!(!is_retryable_exit_code(0));
        assert!(!is_retryable_exit_code(1));
        assert!(!is_retryable_exit_code(127));
        assert!(is_retryable_exit_code(128));
        assert!(is_retryable_exit_code(137));
    }

    #[test]
    fn reads_exit_code_of_named_container() {
        let pod = terminated_pod("xgboostjob", 137);
        assert_eq!(terminated_exit_code(&pod, "xgboostjob"), Some(137));
        assert_eq!(terminated_exit_code(&pod, "sidecar"), None);
        assert_eq!(terminated_exit_code(&Pod::default(), "xgboostjob"), None);
    }
}
