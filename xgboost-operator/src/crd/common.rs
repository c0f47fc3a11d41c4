//! Replica, run-policy and status types shared by distributed training jobs.

use k8s_openapi::api::core::v1::PodTemplateSpec;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Restart policy for the pods of one replica type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum RestartPolicy {
    /// Always restart the container.
    Always,
    /// Restart the container when it fails.
    OnFailure,
    /// Never restart.
    #[default]
    Never,
    /// Recreate the pod when it fails with a retryable exit code.
    ///
    /// Pods are created with the platform policy `Never`; the controller
    /// performs the restart by deleting the failed pod.
    ExitCode,
}

impl RestartPolicy {
    /// The restart policy written into the pod spec.
    pub fn pod_restart_policy(self) -> &'static str {
        match self {
            RestartPolicy::Always => "Always",
            RestartPolicy::OnFailure => "OnFailure",
            RestartPolicy::Never | RestartPolicy::ExitCode => "Never",
        }
    }
}

/// Which pods are deleted once a job is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum CleanPodPolicy {
    /// Delete every pod.
    All,
    /// Delete pods that are still pending or running.
    #[default]
    Running,
    /// Keep every pod.
    None,
}

/// Desired state of one replica type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaSpec {
    /// Desired number of replicas. Defaults to 1.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Pod template for every replica of this type.
    #[serde(default)]
    pub template: PodTemplateSpec,

    /// Restart policy. Defaults to `Never`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub restart_policy: Option<RestartPolicy>,
}

impl ReplicaSpec {
    /// Replica count, treating an unset count as 1.
    pub fn replica_count(&self) -> i32 {
        self.replicas.unwrap_or(1)
    }

    /// Restart policy, treating an unset policy as `Never`.
    pub fn restart_policy(&self) -> RestartPolicy {
        self.restart_policy.unwrap_or_default()
    }
}

/// Gang scheduling options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SchedulingPolicy {
    /// Minimum number of pods scheduled together. Defaults to all replicas.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min_available: Option<i32>,
}

/// Runtime policies shared by every replica of a job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RunPolicy {
    /// Pods to delete once the job finishes. Defaults to `Running`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clean_pod_policy: Option<CleanPodPolicy>,

    /// Seconds to keep a finished job before deleting it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_finished: Option<i32>,

    /// Seconds the job may stay active before it is failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub active_deadline_seconds: Option<i64>,

    /// Number of retries before the job is failed.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backoff_limit: Option<i32>,

    /// Gang scheduling options.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scheduling_policy: Option<SchedulingPolicy>,
}

/// Per replica type pod counters, recomputed on every reconcile pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ReplicaStatus {
    /// Running pods.
    #[serde(default)]
    pub active: i32,
    /// Succeeded pods.
    #[serde(default)]
    pub succeeded: i32,
    /// Failed pods.
    #[serde(default)]
    pub failed: i32,
}

/// Job condition type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
pub enum JobConditionType {
    /// The job was accepted by the controller.
    Created,
    /// The master replica is running.
    Running,
    /// Failed replicas are being recreated.
    Restarting,
    /// The job completed successfully.
    Succeeded,
    /// The job failed. Terminal.
    Failed,
}

impl fmt::Display for JobConditionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobConditionType::Created => "Created",
            JobConditionType::Running => "Running",
            JobConditionType::Restarting => "Restarting",
            JobConditionType::Succeeded => "Succeeded",
            JobConditionType::Failed => "Failed",
        };
        f.write_str(s)
    }
}

/// Condition status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
pub enum ConditionStatus {
    /// The condition holds.
    #[default]
    True,
    /// The condition no longer holds.
    False,
    /// Unknown.
    Unknown,
}

/// One entry of the job condition history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobCondition {
    /// Condition type.
    #[serde(rename = "type")]
    pub type_: JobConditionType,
    /// Condition status.
    pub status: ConditionStatus,
    /// Machine readable reason.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub reason: String,
    /// Human readable message.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub message: String,
    /// Last time the condition was updated.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<Time>,
    /// Last time the condition changed status.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<Time>,
}

/// Observed state of a training job.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct JobStatus {
    /// Condition history, oldest first.
    #[serde(default)]
    pub conditions: Vec<JobCondition>,

    /// Counters per replica type.
    #[serde(default)]
    pub replica_statuses: BTreeMap<String, ReplicaStatus>,

    /// When the controller first reconciled the job.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_time: Option<Time>,

    /// When the job reached a terminal condition.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completion_time: Option<Time>,

    /// Last reconcile time.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_reconcile_time: Option<Time>,
}
