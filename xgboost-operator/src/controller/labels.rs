//! Names, labels, keys and owner references derived from job identity.

use crate::crd::XGBoostJob;
use crate::error::{OperatorError, OperatorResult};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// Label carrying the API group of the owning job kind.
pub const GROUP_NAME_LABEL: &str = "group-name";
/// Label carrying the (sanitized) job name.
pub const JOB_NAME_LABEL: &str = "job-name";
/// Label carrying the lowercase replica type.
pub const REPLICA_TYPE_LABEL: &str = "replica-type";
/// Label carrying the replica index.
pub const REPLICA_INDEX_LABEL: &str = "replica-index";
/// Label marking the master pod.
pub const JOB_ROLE_LABEL: &str = "job-role";

/// Immutable label scheme for the objects owned by one job kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelScheme {
    group_name: String,
}

impl LabelScheme {
    /// Create a scheme whose `group-name` label is `group_name`.
    pub fn new(group_name: impl Into<String>) -> Self {
        Self {
            group_name: group_name.into(),
        }
    }

    /// The `group-name` label value.
    pub fn group_name(&self) -> &str {
        &self.group_name
    }

    /// Selector matching every object managed by this controller.
    pub fn group_labels(&self) -> BTreeMap<String, String> {
        BTreeMap::from([(GROUP_NAME_LABEL.to_string(), self.group_name.clone())])
    }

    /// Labels shared by every object of one job.
    pub fn job_labels(&self, job_name: &str) -> BTreeMap<String, String> {
        let mut labels = self.group_labels();
        labels.insert(JOB_NAME_LABEL.to_string(), job_name.replace('/', "-"));
        labels
    }

    /// Labels of the pod and service in slot (`replica_type`, `index`).
    pub fn replica_labels(
        &self,
        job_name: &str,
        replica_type: &str,
        index: usize,
    ) -> BTreeMap<String, String> {
        let mut labels = self.job_labels(job_name);
        labels.insert(
            REPLICA_TYPE_LABEL.to_string(),
            replica_type.to_lowercase(),
        );
        labels.insert(REPLICA_INDEX_LABEL.to_string(), index.to_string());
        labels
    }
}

/// Name of the pod and service in slot (`replica_type`, `index`).
pub fn gen_general_name(job_name: &str, replica_type: &str, index: usize) -> String {
    format!("{}-{}-{}", job_name, replica_type.to_lowercase(), index).replace('/', "-")
}

/// Name of the gang-scheduling group of a job.
pub fn gen_pod_group_name(job_name: &str) -> String {
    job_name.to_string()
}

/// `namespace/name` key of a job.
pub fn job_key(job: &XGBoostJob) -> String {
    key_for(&job.namespace().unwrap_or_default(), &job.name_any())
}

/// `namespace/name` key.
pub fn key_for(namespace: &str, name: &str) -> String {
    format!("{}/{}", namespace, name)
}

/// Split a `namespace/name` key.
pub fn split_key(key: &str) -> OperatorResult<(&str, &str)> {
    match key.split_once('/') {
        Some((namespace, name))
            if !namespace.is_empty() && !name.is_empty() && !name.contains('/') =>
        {
            Ok((namespace, name))
        }
        _ => Err(OperatorError::InvalidConfig(format!(
            "invalid job key: {}",
            key
        ))),
    }
}

/// Owner reference making `job` the controller of an object.
pub fn gen_owner_reference(job: &XGBoostJob) -> OperatorResult<OwnerReference> {
    let uid = job.uid().ok_or_else(|| OperatorError::ReconcileError {
        kind: XGBoostJob::kind(&()).to_string(),
        name: job.name_any(),
        cause: "job has no uid".into(),
    })?;

    Ok(OwnerReference {
        api_version: XGBoostJob::api_version(&()).to_string(),
        kind: XGBoostJob::kind(&()).to_string(),
        name: job.name_any(),
        uid,
        controller: Some(true),
        block_owner_deletion: Some(true),
    })
}

/// The controlling owner reference of an object, if it is a job of our kind.
pub fn controller_of(owners: &[OwnerReference]) -> Option<&OwnerReference> {
    owners.iter().find(|o| {
        o.controller == Some(true)
            && o.kind == XGBoostJob::kind(&())
            && o.api_version == XGBoostJob::api_version(&())
    })
}

/// Objects labeled with the lowercase form of `replica_type`.
pub(crate) fn filter_for_replica_type<'a, K: Resource>(
    objects: &'a [K],
    replica_type: &str,
) -> Vec<&'a K> {
    let replica_type = replica_type.to_lowercase();
    objects
        .iter()
        .filter(|o| o.labels().get(REPLICA_TYPE_LABEL) == Some(&replica_type))
        .collect()
}

/// Bucket objects into `replicas` slots by their replica index label.
///
/// Objects with a missing, malformed or out of range index are dropped.
pub(crate) fn slices<'a, K: Resource>(objects: &[&'a K], replicas: usize) -> Vec<Vec<&'a K>> {
    let mut slots: Vec<Vec<&'a K>> = vec![Vec::new(); replicas];
    for &object in objects {
        let Some(raw) = object.labels().get(REPLICA_INDEX_LABEL) else {
            tracing::warn!(name = %object.name_any(), "Object has no replica index label");
            continue;
        };
        match raw.parse::<usize>() {
            Ok(index) if index < replicas => slots[index].push(object),
            Ok(index) => {
                tracing::warn!(
                    name = %object.name_any(),
                    index,
                    replicas,
                    "Replica index out of range"
                );
            }
            Err(e) => {
                tracing::warn!(
                    name = %object.name_any(),
                    index = %raw,
                    error = %e,
                    "Malformed replica index label"
                );
            }
        }
    }
    slots
}
