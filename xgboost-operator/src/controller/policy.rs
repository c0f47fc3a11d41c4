//! Job-kind specific behaviour plugged into the generic reconcilers.

use super::labels::gen_general_name;
use crate::crd::{
    CONTROLLER_NAME, DEFAULT_CONTAINER_NAME, DEFAULT_PORT_NAME, GROUP, REPLICA_TYPE_MASTER,
    ReplicaSpec, XGBoostJob,
};
use crate::error::{OperatorError, OperatorResult};
use k8s_openapi::api::core::v1::{EnvVar, PodTemplateSpec};
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// Capabilities a job kind provides to the reconcilers.
pub trait JobPolicy: Send + Sync {
    /// Controller name used as event source.
    fn controller_name(&self) -> &str;

    /// `group/version` of the job kind.
    fn api_version(&self) -> String;

    /// Kind of the job.
    fn kind(&self) -> String;

    /// Value of the `group-name` label on owned objects.
    fn group_name(&self) -> &str;

    /// Container that runs the training process.
    fn default_container_name(&self) -> &str;

    /// Port name used for rendezvous.
    fn default_port_name(&self) -> &str;

    /// Whether slot (`replica_type`, `index`) is the master of the job.
    fn is_master_role(
        &self,
        replicas: &BTreeMap<String, ReplicaSpec>,
        replica_type: &str,
        index: usize,
    ) -> bool;

    /// Inject cluster membership into the template of slot
    /// (`replica_type`, `index`).
    fn set_cluster_spec(
        &self,
        job: &XGBoostJob,
        template: &mut PodTemplateSpec,
        replica_type: &str,
        index: usize,
    ) -> OperatorResult<()>;
}

/// Policy of the XGBoostJob kind.
///
/// Every replica learns the master address, the master port, the world size
/// and its own rank through environment variables. The master has rank 0
/// and workers follow the master replicas.
#[derive(Debug, Clone, Copy, Default)]
pub struct XGBoostPolicy;

impl JobPolicy for XGBoostPolicy {
    fn controller_name(&self) -> &str {
        CONTROLLER_NAME
    }

    fn api_version(&self) -> String {
        XGBoostJob::api_version(&()).to_string()
    }

    fn kind(&self) -> String {
        XGBoostJob::kind(&()).to_string()
    }

    fn group_name(&self) -> &str {
        GROUP
    }

    fn default_container_name(&self) -> &str {
        DEFAULT_CONTAINER_NAME
    }

    fn default_port_name(&self) -> &str {
        DEFAULT_PORT_NAME
    }

    fn is_master_role(
        &self,
        _replicas: &BTreeMap<String, ReplicaSpec>,
        replica_type: &str,
        _index: usize,
    ) -> bool {
        replica_type.eq_ignore_ascii_case(REPLICA_TYPE_MASTER)
    }

    fn set_cluster_spec(
        &self,
        job: &XGBoostJob,
        template: &mut PodTemplateSpec,
        replica_type: &str,
        index: usize,
    ) -> OperatorResult<()> {
        let specs = &job.spec.xgb_replica_specs;
        let master = specs
            .get(REPLICA_TYPE_MASTER)
            .ok_or_else(|| OperatorError::ValidationError("Master replica spec is missing".into()))?;
        let master_port = container_port(master, DEFAULT_CONTAINER_NAME, DEFAULT_PORT_NAME)?;
        let master_addr = gen_general_name(&job.name_any(), REPLICA_TYPE_MASTER, 0);

        let rank = if replica_type.eq_ignore_ascii_case(REPLICA_TYPE_MASTER) {
            if index != 0 {
                return Err(OperatorError::ValidationError(format!(
                    "invalid master index {}, the master must have index 0",
                    index
                )));
            }
            0
        } else {
            master.replica_count().max(0) as usize + index
        };

        let env = [
            ("MASTER_PORT", master_port.to_string()),
            ("MASTER_ADDR", master_addr),
            ("WORLD_SIZE", job.total_replicas().to_string()),
            ("RANK", rank.to_string()),
            ("PYTHONUNBUFFERED", "0".to_string()),
        ];

        let Some(pod_spec) = template.spec.as_mut() else {
            return Ok(());
        };
        for container in &mut pod_spec.containers {
            let vars = container.env.get_or_insert_with(Vec::new);
            for (name, value) in &env {
                upsert_env(vars, name, value);
            }
        }
        Ok(())
    }
}

fn upsert_env(vars: &mut Vec<EnvVar>, name: &str, value: &str) {
    match vars.iter_mut().find(|v| v.name == name) {
        Some(var) => {
            var.value = Some(value.to_string());
            var.value_from = None;
        }
        None => vars.push(EnvVar {
            name: name.to_string(),
            value: Some(value.to_string()),
            value_from: None,
        }),
    }
}

/// Port named `port_name` on container `container_name` of a replica template.
pub fn container_port(
    spec: &ReplicaSpec,
    container_name: &str,
    port_name: &str,
) -> OperatorResult<i32> {
    spec.template
        .spec
        .iter()
        .flat_map(|s| s.containers.iter())
        .filter(|c| c.name == container_name)
        .flat_map(|c| c.ports.iter().flatten())
        .find(|p| p.name.as_deref() == Some(port_name))
        .map(|p| p.container_port)
        .ok_or_else(|| {
            OperatorError::InvalidConfig(format!(
                "failed to find the port {} on container {}",
                port_name, container_name
            ))
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::{REPLICA_TYPE_WORKER, XGBoostJobSpec, set_defaults};
    use k8s_openapi::api::core::v1::{Container, PodSpec};

    fn replica(replicas: i32) -> ReplicaSpec {
        ReplicaSpec {
            replicas: Some(replicas),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: DEFAULT_CONTAINER_NAME.to_string(),
                        image: Some("xgb:1".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            restart_policy: None,
        }
    }

    fn job(workers: i32) -> XGBoostJob {
        let mut spec = XGBoostJobSpec::default();
        spec.xgb_replica_specs
            .insert(REPLICA_TYPE_MASTER.into(), replica(1));
        spec.xgb_replica_specs
            .insert(REPLICA_TYPE_WORKER.into(), replica(workers));
        set_defaults(&mut spec);
        XGBoostJob::new("iris", spec)
    }

    fn env_of(template: &PodTemplateSpec, name: &str) -> Option<String> {
        template.spec.as_ref()?.containers[0]
            .env
            .as_ref()?
            .iter()
            .find(|v| v.name == name)?
            .value
            .clone()
    }

    #[test]
    fn master_role_is_case_insensitive() {
        let policy = XGBoostPolicy;
        let specs = BTreeMap::new();
        assert!(policy.is_master_role(&specs, "master", 0));
        assert!(policy.is_master_role(&specs, "Master", 0));
        assert!(!policy.is_master_role(&specs, "Worker", 0));
    }

    #[test]
    fn worker_rank_follows_master() {
        let job = job(3);
        let mut template = job.spec.xgb_replica_specs[REPLICA_TYPE_WORKER].template.clone();

        XGBoostPolicy
            .set_cluster_spec(&job, &mut template, "worker", 2)
            .unwrap();

        assert_eq!(env_of(&template, "RANK").as_deref(), Some("3"));
        assert_eq!(env_of(&template, "WORLD_SIZE").as_deref(), Some("4"));
        assert_eq!(env_of(&template, "MASTER_ADDR").as_deref(), Some("iris-master-0"));
        assert_eq!(env_of(&template, "MASTER_PORT").as_deref(), Some("9999"));
        assert_eq!(env_of(&template, "PYTHONUNBUFFERED").as_deref(), Some("0"));
    }

    #[test]
    fn master_rank_is_zero() {
        let job = job(2);
        let mut template = job.spec.xgb_replica_specs[REPLICA_TYPE_MASTER].template.clone();

        XGBoostPolicy
            .set_cluster_spec(&job, &mut template, "master", 0)
            .unwrap();
        assert_eq!(env_of(&template, "RANK").as_deref(), Some("0"));

        let err = XGBoostPolicy.set_cluster_spec(&job, &mut template, "master", 1);
        assert!(err.is_err());
    }

    #[test]
    fn env_is_not_duplicated() {
        let job = job(1);
        let mut template = job.spec.xgb_replica_specs[REPLICA_TYPE_WORKER].template.clone();
        XGBoostPolicy
            .set_cluster_spec(&job, &mut template, "worker", 0)
            .unwrap();
        XGBoostPolicy
            .set_cluster_spec(&job, &mut template, "worker", 0)
            .unwrap();

        let env = template.spec.as_ref().unwrap().containers[0]
            .env
            .as_ref()
            .unwrap();
        assert_eq!(env.len(), 5);
    }

    #[test]
    fn missing_port_is_an_error() {
        let spec = replica(1);
        assert!(container_port(&spec, DEFAULT_CONTAINER_NAME, DEFAULT_PORT_NAME).is_err());
    }
}
