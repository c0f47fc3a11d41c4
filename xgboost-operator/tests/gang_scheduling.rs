//! Gang scheduling through PodGroups.

mod common;

use common::{Harness, xgboost_job};
use kube::ResourceExt;
use xgboost_operator::controller::{ControllerConfig, is_succeeded};
use xgboost_operator::crd::{RestartPolicy, SchedulingPolicy};

fn gang_harness() -> Harness {
    Harness::with_config(ControllerConfig {
        enable_gang_scheduling: true,
        ..Default::default()
    })
}

#[tokio::test]
async fn pods_join_the_job_pod_group() {
    let h = gang_harness();
    let key = h.submit(xgboost_job("iris", 2, RestartPolicy::Never));
    h.controller.sync_job(&key).await.unwrap();

    let groups = h.store.pod_groups();
    assert_eq!(groups.len(), 1);
    assert_eq!(groups[0].name_any(), "iris");
    assert_eq!(groups[0].spec.min_member, 3);
    assert_eq!(groups[0].owner_references()[0].name, "iris");

    for name in h.pod_names() {
        let pod = h.pod(&name);
        assert_eq!(
            pod.spec.unwrap().scheduler_name.as_deref(),
            Some("kube-batch")
        );
        assert_eq!(
            pod.metadata.annotations.unwrap()["scheduling.k8s.io/group-name"],
            "iris"
        );
    }
}

#[tokio::test]
async fn min_available_overrides_group_size() {
    let h = gang_harness();
    let mut job = xgboost_job("iris", 4, RestartPolicy::Never);
    job.spec.run_policy.scheduling_policy = Some(SchedulingPolicy {
        min_available: Some(2),
    });
    let key = h.submit(job);
    h.controller.sync_job(&key).await.unwrap();

    assert_eq!(h.store.pod_groups()[0].spec.min_member, 2);
}

#[tokio::test]
async fn foreign_scheduler_is_kept() {
    let h = gang_harness();
    let mut job = xgboost_job("iris", 1, RestartPolicy::Never);
    let worker = job.spec.xgb_replica_specs.get_mut("Worker").unwrap();
    worker.template.spec.as_mut().unwrap().scheduler_name = Some("volcano".to_string());
    let key = h.submit(job);
    h.controller.sync_job(&key).await.unwrap();

    let worker = h.pod("iris-worker-0");
    assert_eq!(worker.spec.unwrap().scheduler_name.as_deref(), Some("volcano"));
    let master = h.pod("iris-master-0");
    assert_eq!(master.spec.unwrap().scheduler_name, None);
    assert_eq!(
        h.recorder.with_reason("SettedPodTemplateSchedulerName").len(),
        2
    );
}

#[tokio::test]
async fn finished_job_releases_its_pod_group() {
    let h = gang_harness();
    let key = h.submit(xgboost_job("iris", 1, RestartPolicy::Never));
    h.controller.sync_job(&key).await.unwrap();
    h.observe();

    h.set_phase("iris-master-0", "Succeeded");
    h.set_phase("iris-worker-0", "Running");
    h.controller.sync_job(&key).await.unwrap();
    assert!(is_succeeded(&h.status("iris")));

    h.controller.sync_job(&key).await.unwrap();
    assert!(h.store.pod_groups().is_empty());
    assert_eq!(h.recorder.with_reason("JobTerminated").len(), 1);
    assert_eq!(h.recorder.with_reason("SuccessfulDeletePodGroup").len(), 1);

    // Later passes leave the group deleted.
    h.controller.sync_job(&key).await.unwrap();
    assert!(h.store.pod_groups().is_empty());
    assert_eq!(h.recorder.with_reason("JobTerminated").len(), 1);
}

#[tokio::test]
async fn disabled_gang_scheduling_creates_no_group() {
    let h = Harness::new();
    let key = h.submit(xgboost_job("iris", 1, RestartPolicy::Never));
    h.controller.sync_job(&key).await.unwrap();

    assert!(h.store.pod_groups().is_empty());
    let pod = h.pod("iris-worker-0");
    assert!(pod.metadata.annotations.is_none());
    assert_eq!(pod.spec.unwrap().scheduler_name, None);
}
