//! Defaulting for XGBoostJob specs.
//!
//! Applied in memory before every sync; the defaulted spec is never written
//! back to the store.

use super::common::{CleanPodPolicy, ReplicaSpec, RestartPolicy};
use super::xgboostjob::{
    DEFAULT_CONTAINER_NAME, DEFAULT_PORT, DEFAULT_PORT_NAME, REPLICA_TYPE_MASTER,
    REPLICA_TYPE_WORKER, XGBoostJobSpec,
};
use k8s_openapi::api::core::v1::{ContainerPort, PodSpec};

/// Fill in every unspecified field of the spec.
pub fn set_defaults(spec: &mut XGBoostJobSpec) {
    if spec.run_policy.clean_pod_policy.is_none() {
        spec.run_policy.clean_pod_policy = Some(CleanPodPolicy::Running);
    }

    normalize_replica_type(spec, REPLICA_TYPE_WORKER);
    normalize_replica_type(spec, REPLICA_TYPE_MASTER);

    for replica in spec.xgb_replica_specs.values_mut() {
        set_default_replicas(replica);
        if let Some(pod_spec) = replica.template.spec.as_mut() {
            set_default_port(pod_spec);
        }
    }
}

fn set_default_replicas(replica: &mut ReplicaSpec) {
    if replica.replicas.is_none() {
        replica.replicas = Some(1);
    }
    if replica.restart_policy.is_none() {
        replica.restart_policy = Some(RestartPolicy::default());
    }
}

/// Rename a replica type key written in any casing to its canonical form.
fn normalize_replica_type(spec: &mut XGBoostJobSpec, canonical: &str) {
    let found = spec
        .xgb_replica_specs
        .keys()
        .find(|key| key.eq_ignore_ascii_case(canonical) && key.as_str() != canonical)
        .cloned();

    if let Some(key) = found {
        if let Some(replica) = spec.xgb_replica_specs.remove(&key) {
            spec.xgb_replica_specs.insert(canonical.to_string(), replica);
        }
    }
}

/// Add the rendezvous port to the training container when it has none.
fn set_default_port(pod_spec: &mut PodSpec) {
    let index = pod_spec
        .containers
        .iter()
        .position(|c| c.name == DEFAULT_CONTAINER_NAME)
        .unwrap_or(0);

    let Some(container) = pod_spec.containers.get_mut(index) else {
        return;
    };

    let ports = container.ports.get_or_insert_with(Vec::new);
    let has_port = ports
        .iter()
        .any(|p| p.name.as_deref() == Some(DEFAULT_PORT_NAME));
    if !has_port {
        ports.push(ContainerPort {
            name: Some(DEFAULT_PORT_NAME.to_string()),
            container_port: DEFAULT_PORT,
            ..Default::default()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, PodTemplateSpec};

    fn replica(replicas: Option<i32>) -> ReplicaSpec {
        ReplicaSpec {
            replicas,
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    containers: vec![Container {
                        name: DEFAULT_CONTAINER_NAME.to_string(),
                        image: Some("xgboost:latest".to_string()),
                        ..Default::default()
                    }],
                    ..Default::default()
                }),
            },
            restart_policy: None,
        }
    }

    #[test]
    fn fills_missing_fields() {
        let mut spec = XGBoostJobSpec::default();
        spec.xgb_replica_specs
            .insert("master".to_string(), replica(None));
        spec.xgb_replica_specs
            .insert("WORKER".to_string(), replica(Some(4)));

        set_defaults(&mut spec);

        assert_eq!(
            spec.run_policy.clean_pod_policy,
            Some(CleanPodPolicy::Running)
        );
        let master = &spec.xgb_replica_specs[REPLICA_TYPE_MASTER];
        assert_eq!(master.replicas, Some(1));
        assert_eq!(master.restart_policy, Some(RestartPolicy::Never));
        assert_eq!(spec.xgb_replica_specs[REPLICA_TYPE_WORKER].replicas, Some(4));
        assert!(!spec.xgb_replica_specs.contains_key("master"));
    }

    #[test]
    fn adds_default_port_once() {
        let mut spec = XGBoostJobSpec::default();
        spec.xgb_replica_specs
            .insert(REPLICA_TYPE_MASTER.to_string(), replica(Some(1)));

        set_defaults(&mut spec);
        set_defaults(&mut spec);

        let pod_spec = spec.xgb_replica_specs[REPLICA_TYPE_MASTER]
            .template
            .spec
            .as_ref()
            .unwrap();
        let ports = pod_spec.containers[0].ports.as_ref().unwrap();
        assert_eq!(ports.len(), 1);
        assert_eq!(ports[0].container_port, DEFAULT_PORT);
    }
}
