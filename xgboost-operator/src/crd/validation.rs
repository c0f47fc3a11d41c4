//! Structural validation of XGBoostJob specs.

use super::xgboostjob::{
    DEFAULT_CONTAINER_NAME, REPLICA_TYPE_MASTER, REPLICA_TYPE_WORKER, XGBoostJobSpec,
};
use crate::error::{OperatorError, OperatorResult};

const VALID_REPLICA_TYPES: [&str; 2] = [REPLICA_TYPE_MASTER, REPLICA_TYPE_WORKER];

/// Validate a defaulted job spec.
///
/// A valid spec has a single-replica `Master`, only `Master`/`Worker`
/// replica types, and a training container with an image in every template.
pub fn validate_spec(spec: &XGBoostJobSpec) -> OperatorResult<()> {
    if spec.xgb_replica_specs.is_empty() {
        return Err(OperatorError::ValidationError(
            "xgbReplicaSpecs must not be empty".into(),
        ));
    }

    let mut master_exists = false;
    for (replica_type, replica) in &spec.xgb_replica_specs {
        if !VALID_REPLICA_TYPES.contains(&replica_type.as_str()) {
            return Err(OperatorError::ValidationError(format!(
                "replica type is {} but must be one of {:?}",
                replica_type, VALID_REPLICA_TYPES
            )));
        }

        let containers = replica
            .template
            .spec
            .as_ref()
            .map(|s| s.containers.as_slice())
            .unwrap_or_default();
        if containers.is_empty() {
            return Err(OperatorError::ValidationError(format!(
                "{} template has no containers",
                replica_type
            )));
        }

        if let Some(container) = containers
            .iter()
            .find(|c| c.image.as_deref().is_none_or(str::is_empty))
        {
            return Err(OperatorError::ValidationError(format!(
                "image is undefined in container {} of {}",
                container.name, replica_type
            )));
        }

        if !containers.iter().any(|c| c.name == DEFAULT_CONTAINER_NAME) {
            return Err(OperatorError::ValidationError(format!(
                "there is no container named {} in {}",
                DEFAULT_CONTAINER_NAME, replica_type
            )));
        }

        if replica_type == REPLICA_TYPE_MASTER {
            master_exists = true;
            if replica.replicas.is_some_and(|n| n != 1) {
                return Err(OperatorError::ValidationError(
                    "there must be only 1 master replica".into(),
                ));
            }
        }
    }

    if !master_exists {
        return Err(OperatorError::ValidationError(
            "Master replica spec must be present".into(),
        ));
    }
    Ok(())
}
