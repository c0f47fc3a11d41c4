//! Job conditions and the aggregation of replica counters into them.

use super::JobController;
use crate::client::EventType;
use crate::crd::{
    ConditionStatus, JobCondition, JobConditionType, JobStatus, ReplicaSpec, ReplicaStatus,
    RestartPolicy, XGBoostJob,
};
use crate::error::{OperatorError, OperatorResult};
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::ResourceExt;
use std::collections::BTreeMap;

/// Reason of the condition added when a job is first seen.
pub const JOB_CREATED_REASON: &str = "XGBoostJobCreated";
/// Reason of the Running condition.
pub const JOB_RUNNING_REASON: &str = "XGBoostJobRunning";
/// Reason of the Succeeded condition.
pub const JOB_SUCCEEDED_REASON: &str = "XGBoostJobSucceeded";
/// Reason of the Failed condition.
pub const JOB_FAILED_REASON: &str = "XGBoostJobFailed";
/// Reason of the Restarting condition.
pub const JOB_RESTARTING_REASON: &str = "XGBoostJobRestarting";
/// Reason of the Failed condition of a job rejected at validation.
pub const JOB_INVALID_SPEC_REASON: &str = "InvalidXGBoostJobSpec";

pub(crate) fn now() -> Time {
    Time(chrono::Utc::now())
}

fn new_condition(type_: JobConditionType, reason: &str, message: &str) -> JobCondition {
    JobCondition {
        type_,
        status: ConditionStatus::True,
        reason: reason.to_string(),
        message: message.to_string(),
        last_update_time: Some(now()),
        last_transition_time: Some(now()),
    }
}

/// The condition of type `type_`, whatever its status.
pub fn get_condition(status: &JobStatus, type_: JobConditionType) -> Option<&JobCondition> {
    status.conditions.iter().find(|c| c.type_ == type_)
}

/// Whether a condition of type `type_` currently holds.
pub fn has_condition(status: &JobStatus, type_: JobConditionType) -> bool {
    status
        .conditions
        .iter()
        .any(|c| c.type_ == type_ && c.status == ConditionStatus::True)
}

/// Whether the job succeeded.
pub fn is_succeeded(status: &JobStatus) -> bool {
    has_condition(status, JobConditionType::Succeeded)
}

/// Whether the job failed.
pub fn is_failed(status: &JobStatus) -> bool {
    has_condition(status, JobConditionType::Failed)
}

/// Add or refresh a condition.
///
/// A failed job accepts no further conditions. Running and Restarting
/// replace each other, and a terminal condition flips Running to `False`.
pub fn update_job_conditions(
    status: &mut JobStatus,
    type_: JobConditionType,
    reason: &str,
    message: &str,
) {
    set_condition(status, new_condition(type_, reason, message));
}

fn set_condition(status: &mut JobStatus, mut condition: JobCondition) {
    if is_failed(status) {
        return;
    }

    if let Some(current) = get_condition(status, condition.type_) {
        if current.status == condition.status && current.reason == condition.reason {
            return;
        }
        if current.status == condition.status {
            condition.last_transition_time = current.last_transition_time.clone();
        }
    }

    let mut conditions = filter_out_condition(&status.conditions, condition.type_);
    conditions.push(condition);
    status.conditions = conditions;
}

fn filter_out_condition(conditions: &[JobCondition], type_: JobConditionType) -> Vec<JobCondition> {
    use JobConditionType::*;

    conditions
        .iter()
        .filter(|c| {
            !(c.type_ == type_
                || (type_ == Restarting && c.type_ == Running)
                || (type_ == Running && c.type_ == Restarting))
        })
        .cloned()
        .map(|mut c| {
            if matches!(type_, Failed | Succeeded) && c.type_ == Running {
                c.status = ConditionStatus::False;
            }
            c
        })
        .collect()
}

/// Reset the counters of a replica type before a recount.
pub(crate) fn initialize_replica_status(status: &mut JobStatus, replica_type: &str) {
    status
        .replica_statuses
        .insert(replica_type.to_string(), ReplicaStatus::default());
}

/// Fold the phase of one pod into the counters of its replica type.
pub(crate) fn update_replica_status(status: &mut JobStatus, replica_type: &str, pod: &Pod) {
    let counters = status
        .replica_statuses
        .entry(replica_type.to_string())
        .or_default();
    match pod.status.as_ref().and_then(|s| s.phase.as_deref()) {
        Some("Running") => counters.active += 1,
        Some("Succeeded") => counters.succeeded += 1,
        Some("Failed") => counters.failed += 1,
        _ => {}
    }
}

impl JobController {
    /// Derive job conditions from the replica counters of this pass.
    ///
    /// The master replica drives Running and Succeeded. Any failed replica
    /// turns the job into Restarting under the `ExitCode` policy and into
    /// Failed otherwise.
    pub fn update_job_status(
        &self,
        job: &XGBoostJob,
        replicas: &BTreeMap<String, ReplicaSpec>,
        status: &mut JobStatus,
    ) -> OperatorResult<()> {
        let name = job.name_any();

        for (replica_type, spec) in replicas {
            let desired = spec.replicas.ok_or_else(|| OperatorError::ReconcileError {
                kind: self.ctx.policy.kind(),
                name: name.clone(),
                cause: format!("replicas of {} are not defaulted", replica_type),
            })?;
            let counters = status
                .replica_statuses
                .get(replica_type)
                .copied()
                .unwrap_or_default();

            let expected = desired - counters.succeeded;
            let running = counters.active;
            let failed = counters.failed;

            tracing::info!(
                job = %name,
                replica_type = %replica_type,
                expected,
                running,
                failed,
                "Replica status"
            );

            if self.ctx.policy.is_master_role(replicas, replica_type, 0) {
                if running > 0 {
                    let msg = format!("XGBoostJob {} is running.", name);
                    update_job_conditions(status, JobConditionType::Running, JOB_RUNNING_REASON, &msg);
                }
                if expected == 0 {
                    let msg = format!("XGBoostJob {} is successfully completed.", name);
                    self.ctx
                        .recorder
                        .record(job, EventType::Normal, JOB_SUCCEEDED_REASON, msg.clone());
                    status.completion_time.get_or_insert_with(now);
                    update_job_conditions(
                        status,
                        JobConditionType::Succeeded,
                        JOB_SUCCEEDED_REASON,
                        &msg,
                    );
                }
            }

            if failed > 0 {
                if spec.restart_policy() == RestartPolicy::ExitCode {
                    let msg = format!(
                        "XGBoostJob {} is restarting because {} {} replica(s) failed.",
                        name, failed, replica_type
                    );
                    self.ctx
                        .recorder
                        .record(job, EventType::Warning, JOB_RESTARTING_REASON, msg.clone());
                    update_job_conditions(
                        status,
                        JobConditionType::Restarting,
                        JOB_RESTARTING_REASON,
                        &msg,
                    );
                } else {
                    let msg = format!(
                        "XGBoostJob {} is failed because {} {} replica(s) failed.",
                        name, failed, replica_type
                    );
                    // TODO: record as EventType::Warning, like the XGBoostJobRestarting
                    // event above, once existing event consumers accept the change.
                    self.ctx
                        .recorder
                        .record(job, EventType::Normal, JOB_FAILED_REASON, msg.clone());
                    status.completion_time.get_or_insert_with(now);
                    update_job_conditions(status, JobConditionType::Failed, JOB_FAILED_REASON, &msg);
                }
            }
        }

        Ok(())
    }
}
