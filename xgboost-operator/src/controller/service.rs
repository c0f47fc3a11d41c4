//! Headless service reconciliation for one replica type.

use super::JobController;
use super::expectations::ExpectationKey;
use super::labels::{
    filter_for_replica_type, gen_general_name, gen_owner_reference, job_key, slices,
};
use super::policy::container_port;
use crate::client::EventType;
use crate::crd::{ReplicaSpec, XGBoostJob};
use crate::error::OperatorResult;
use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::ResourceExt;

const SUCCESSFUL_CREATE_SERVICE_REASON: &str = "SuccessfulCreateService";
const FAILED_CREATE_SERVICE_REASON: &str = "FailedCreateService";
const SUCCESSFUL_DELETE_SERVICE_REASON: &str = "SuccessfulDeleteService";
const FAILED_DELETE_SERVICE_REASON: &str = "FailedDeleteService";

impl JobController {
    /// Create the missing services of `replica_type`.
    ///
    /// Every slot gets one headless service selecting exactly its pod, so
    /// replicas can reach each other at `{job}-{type}-{index}`.
    pub async fn reconcile_services(
        &self,
        job: &XGBoostJob,
        services: &[Service],
        replica_type: &str,
        spec: &ReplicaSpec,
    ) -> OperatorResult<()> {
        let job_key = job_key(job);
        let desired = spec.replica_count().max(0) as usize;

        let services = filter_for_replica_type(services, replica_type);
        let slots = slices(&services, desired);

        let missing: Vec<usize> = slots
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                if slot.len() > 1 {
                    tracing::warn!(
                        job = %job_key,
                        replica_type = %replica_type,
                        index,
                        count = slot.len(),
                        "More than one service found for a replica slot"
                    );
                }
                slot.is_empty().then_some(index)
            })
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        let key = ExpectationKey::services(&job_key, replica_type);
        if !self.expectations.satisfied(&key) {
            tracing::debug!(
                key = %key,
                missing = missing.len(),
                "Waiting for earlier service creations to be observed"
            );
            return Ok(());
        }

        let mut pending = missing.len() as i64;
        self.expectations.expect_creations(&key, pending);

        for index in missing {
            if let Err(e) = self
                .create_new_service(job, &key, replica_type, index, spec)
                .await
            {
                self.expectations.lower_expectations(&key, pending, 0);
                return Err(e);
            }
            pending -= 1;
        }
        Ok(())
    }

    async fn create_new_service(
        &self,
        job: &XGBoostJob,
        key: &ExpectationKey,
        replica_type: &str,
        index: usize,
        spec: &ReplicaSpec,
    ) -> OperatorResult<()> {
        let job_name = job.name_any();
        let namespace = job.namespace().unwrap_or_default();
        let name = gen_general_name(&job_name, replica_type, index);
        let labels = self.labels.replica_labels(&job_name, replica_type, index);

        let port = container_port(
            spec,
            self.ctx.policy.default_container_name(),
            self.ctx.policy.default_port_name(),
        )?;

        let service = Service {
            metadata: ObjectMeta {
                name: Some(name.clone()),
                namespace: Some(namespace.clone()),
                labels: Some(labels.clone()),
                owner_references: Some(vec![gen_owner_reference(job)?]),
                ..Default::default()
            },
            spec: Some(ServiceSpec {
                cluster_ip: Some("None".to_string()),
                selector: Some(labels),
                ports: Some(vec![ServicePort {
                    name: Some(self.ctx.policy.default_port_name().to_string()),
                    port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            status: None,
        };

        match self.ctx.store.create_service(&namespace, service).await {
            Ok(_) => {
                tracing::info!(job = %job_name, service = %name, "Created service");
                self.ctx.recorder.record(
                    job,
                    EventType::Normal,
                    SUCCESSFUL_CREATE_SERVICE_REASON,
                    format!("Created service: {}", name),
                );
                Ok(())
            }
            Err(e) if e.is_timeout() => {
                tracing::info!(
                    job = %job_name,
                    service = %name,
                    "Service creation timed out, waiting to observe it"
                );
                Ok(())
            }
            Err(e) if e.is_conflict() => {
                tracing::info!(job = %job_name, service = %name, "Service already exists");
                self.expectations.creation_observed(key);
                Ok(())
            }
            Err(e) => {
                self.ctx.recorder.record(
                    job,
                    EventType::Warning,
                    FAILED_CREATE_SERVICE_REASON,
                    format!("Error creating: {}", e),
                );
                Err(e)
            }
        }
    }

    /// Delete a service owned by `job`. An already deleted service is fine.
    pub(crate) async fn delete_service(&self, job: &XGBoostJob, name: &str) -> OperatorResult<()> {
        let namespace = job.namespace().unwrap_or_default();
        match self.ctx.store.delete_service(&namespace, name).await {
            Ok(()) => {
                tracing::info!(job = %job.name_any(), service = %name, "Deleted service");
                self.ctx.recorder.record(
                    job,
                    EventType::Normal,
                    SUCCESSFUL_DELETE_SERVICE_REASON,
                    format!("Deleted service: {}", name),
                );
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => {
                self.ctx.recorder.record(
                    job,
                    EventType::Warning,
                    FAILED_DELETE_SERVICE_REASON,
                    format!("Error deleting: {}", e),
                );
                Err(e)
            }
        }
    }
}
