//! Record assembly for the reverse path
//!
//! Builds the observed version of a record from a cached Kubernetes object.
//! Timestamps come from the time the object was observed, not the time of
//! the call, so replaying a cached object yields an identical record.

use crate::arn::ArnBuilder;
use crate::naming::{
    self, ANNOTATION_STARTED_BY, ANNOTATION_TASK_ARN, ANNOTATION_TASK_DEFINITION_ARN,
    LABEL_LAUNCH_TYPE, LABEL_SERVICE, LABEL_TASK_FAMILY, LABEL_TASK_ID, LABEL_TASK_REVISION,
    LABEL_TASK_SET, TASK_SET_ID_PREFIX,
};
use crate::status;
use crate::types::{
    HealthStatus, LaunchType, Service, ServiceStatus, StabilityStatus, Task, TaskSet,
    TaskSetStatus, TaskStatus,
};
use chrono::{DateTime, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

fn label<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.labels
        .as_ref()
        .and_then(|l| l.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

fn annotation<'a>(meta: &'a ObjectMeta, key: &str) -> Option<&'a str> {
    meta.annotations
        .as_ref()
        .and_then(|a| a.get(key))
        .map(String::as_str)
        .filter(|v| !v.is_empty())
}

fn launch_type(meta: &ObjectMeta) -> LaunchType {
    match label(meta, LABEL_LAUNCH_TYPE) {
        Some("FARGATE") => LaunchType::Fargate,
        Some("EXTERNAL") => LaunchType::External,
        _ => LaunchType::Ec2,
    }
}

/// Observed service state; `deployment` is `None` once it is gone
pub fn observed_service(
    existing: &Service,
    deployment: Option<&Deployment>,
    observed_at: DateTime<Utc>,
) -> Service {
    let mut next = existing.clone();
    match deployment {
        Some(d) => {
            let (running, pending) = status::observed_counts(d.status.as_ref());
            next.running_count = running;
            next.pending_count = pending;
            next.status = status::service_status(Some(d), existing.desired_count);
        }
        None => {
            next.running_count = 0;
            next.pending_count = 0;
            next.status = ServiceStatus::Inactive;
        }
    }
    next.updated_at = if existing.observed_differs(&next) {
        observed_at
    } else {
        existing.updated_at
    };
    next
}

/// Observed task set state; `deployment` is `None` once it is gone
pub fn observed_task_set(
    existing: &TaskSet,
    deployment: Option<&Deployment>,
    observed_at: DateTime<Utc>,
) -> TaskSet {
    let mut next = existing.clone();
    match deployment {
        Some(d) => {
            let (running, pending) = status::observed_counts(d.status.as_ref());
            next.running_count = running;
            next.pending_count = pending;
            next.stability_status = status::task_set_stability(d);
        }
        None => {
            next.running_count = 0;
            next.pending_count = 0;
            next.status = TaskSetStatus::Draining;
            next.stability_status = StabilityStatus::Stabilizing;
        }
    }
    if next.stability_status != existing.stability_status {
        next.stability_status_at = observed_at;
    }
    next.updated_at = if existing.observed_differs(&next) {
        observed_at
    } else {
        existing.updated_at
    };
    next
}

/// Where a pod belongs in ECS terms
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskIdentity {
    pub task_id: String,
    pub task_arn: String,
    pub cluster_arn: String,
    pub service_arn: Option<String>,
    pub task_set_arn: Option<String>,
    /// Whether the pod carried explicit task labels or annotations
    pub labelled: bool,
}

/// Resolve the task a pod represents
///
/// The task id comes from the `kecs.dev/task-id` label, then the RunTask pod
/// name, then the pod uid without dashes, then the pod name itself.
pub fn task_identity(pod: &Pod, cluster_name: &str, arns: &ArnBuilder) -> TaskIdentity {
    let meta = &pod.metadata;
    let pod_name = meta.name.as_deref().unwrap_or_default();

    let labelled_id = label(meta, LABEL_TASK_ID);
    let task_id = labelled_id
        .or_else(|| naming::extract_task_id(pod_name))
        .map(str::to_string)
        .or_else(|| meta.uid.as_ref().map(|uid| uid.replace('-', "")))
        .unwrap_or_else(|| pod_name.to_string());

    let annotated_arn = annotation(meta, ANNOTATION_TASK_ARN);
    let task_arn = annotated_arn
        .map(str::to_string)
        .unwrap_or_else(|| arns.task(cluster_name, &task_id));

    let service = label(meta, LABEL_SERVICE);
    let service_arn = service.map(|s| arns.service(cluster_name, s));
    let task_set_arn = match (service, label(meta, LABEL_TASK_SET)) {
        (Some(s), Some(digits)) => Some(arns.task_set(
            cluster_name,
            s,
            &format!("{}{}", TASK_SET_ID_PREFIX, digits),
        )),
        _ => None,
    };

    TaskIdentity {
        task_id,
        task_arn,
        cluster_arn: arns.cluster(cluster_name),
        service_arn,
        task_set_arn,
        labelled: labelled_id.is_some() || annotated_arn.is_some(),
    }
}

/// Skeleton record for a pod seen for the first time
pub fn new_task(
    identity: &TaskIdentity,
    pod: &Pod,
    arns: &ArnBuilder,
    observed_at: DateTime<Utc>,
) -> Task {
    let meta = &pod.metadata;
    let family = label(meta, LABEL_TASK_FAMILY);
    let task_definition_arn = annotation(meta, ANNOTATION_TASK_DEFINITION_ARN)
        .map(str::to_string)
        .or_else(|| {
            let revision = label(meta, LABEL_TASK_REVISION)?.parse().ok()?;
            Some(arns.task_definition(family?, revision))
        })
        .unwrap_or_default();

    let group = match (label(meta, LABEL_SERVICE), family) {
        (Some(service), _) => Some(format!("service:{}", service)),
        (None, Some(family)) => Some(format!("family:{}", family)),
        (None, None) => None,
    };

    Task {
        task_arn: identity.task_arn.clone(),
        task_id: identity.task_id.clone(),
        cluster_arn: identity.cluster_arn.clone(),
        task_definition_arn,
        service_arn: identity.service_arn.clone(),
        task_set_arn: identity.task_set_arn.clone(),
        started_by: annotation(meta, ANNOTATION_STARTED_BY).map(str::to_string),
        group,
        launch_type: launch_type(meta),
        last_status: TaskStatus::Provisioning,
        desired_status: TaskStatus::Running,
        health_status: HealthStatus::Unknown,
        cpu: None,
        memory: None,
        containers: vec![],
        overrides: vec![],
        attachment: None,
        pod_name: meta.name.clone().unwrap_or_default(),
        namespace: meta.namespace.clone().unwrap_or_default(),
        created_at: meta
            .creation_timestamp
            .as_ref()
            .map(|t| t.0)
            .unwrap_or(observed_at),
        started_at: None,
        stopping_at: None,
        stopped_at: None,
        stopped_reason: None,
        updated_at: observed_at,
        version: 0,
    }
}

/// Observed task state for a pod, or for its tombstone when `deleted`
pub fn observed_task(existing: &Task, pod: &Pod, deleted: bool, observed_at: DateTime<Utc>) -> Task {
    let mut next = existing.clone();

    // Stopped is terminal; late events for a live pod are ignored
    if existing.last_status.is_stopped() {
        return next;
    }

    if deleted {
        next.last_status = TaskStatus::Stopped;
        next.desired_status = TaskStatus::Stopped;
        next.health_status = HealthStatus::Unknown;
        next.containers = status::container_states(pod)
            .into_iter()
            .map(|mut c| {
                c.last_status = TaskStatus::Stopped;
                c
            })
            .collect();
        next.stopping_at = next.stopping_at.or(Some(observed_at));
        next.stopped_at = Some(observed_at);
        if next.stopped_reason.is_none() {
            next.stopped_reason = Some(status::POD_DELETED_REASON.to_string());
        }
    } else {
        let (desired, last) = status::task_status_from_pod(pod);
        next.last_status = last;
        if desired == TaskStatus::Stopped {
            next.desired_status = TaskStatus::Stopped;
        }
        next.health_status = status::task_health(pod);
        next.containers = status::container_states(pod);
        next.attachment = status::network_attachment(pod).or(next.attachment);

        if last == TaskStatus::Running && next.started_at.is_none() {
            next.started_at = Some(
                pod.status
                    .as_ref()
                    .and_then(|s| s.start_time.as_ref())
                    .map(|t| t.0)
                    .unwrap_or(observed_at),
            );
        }
        if let Some(deleting) = pod.metadata.deletion_timestamp.as_ref() {
            next.stopping_at = next.stopping_at.or(Some(deleting.0));
        }
        if last.is_stopped() {
            next.stopped_at = Some(observed_at);
            if next.stopped_reason.is_none() {
                next.stopped_reason = status::stopped_reason(pod);
            }
        }
    }

    if let Some(name) = &pod.metadata.name {
        next.pod_name = name.clone();
    }
    if let Some(namespace) = &pod.metadata.namespace {
        next.namespace = namespace.clone();
    }

    next.updated_at = if existing.observed_differs(&next) {
        observed_at
    } else {
        existing.updated_at
    };
    next
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::managed_labels;
    use crate::types::{DeploymentControllerType, SchedulingStrategy};
    use chrono::TimeZone;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::{
        Container, ContainerState, ContainerStateRunning, ContainerStatus, PodSpec, PodStatus,
    };
    use std::collections::BTreeMap;

    fn arns() -> ArnBuilder {
        ArnBuilder::new("aws", "us-east-1", "000000000000")
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    fn service(desired: u32) -> Service {
        Service {
            service_arn: arns().service("demo", "web"),
            service_name: "web".to_string(),
            cluster_arn: arns().cluster("demo"),
            task_definition_arn: arns().task_definition("web", 1),
            launch_type: LaunchType::Ec2,
            scheduling_strategy: SchedulingStrategy::Replica,
            deployment_controller: DeploymentControllerType::Ecs,
            desired_count: desired,
            running_count: 0,
            pending_count: 0,
            status: ServiceStatus::Provisioning,
            namespace: "demo-us-east-1".to_string(),
            object_name: "ecs-service-web".to_string(),
            tags: vec![],
            created_at: at(0),
            updated_at: at(0),
            version: 1,
        }
    }

    fn deployment(replicas: i32, ready: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("ecs-service-web".to_string()),
                namespace: Some("demo-us-east-1".to_string()),
                generation: Some(1),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(1),
                replicas: Some(replicas),
                ready_replicas: Some(ready),
                updated_replicas: Some(replicas),
                ..Default::default()
            }),
        }
    }

    fn service_pod(phase: &str, ready: bool) -> Pod {
        let mut labels = managed_labels("demo");
        labels.insert(LABEL_SERVICE.to_string(), "web".to_string());
        labels.insert(LABEL_TASK_FAMILY.to_string(), "web".to_string());
        labels.insert(LABEL_TASK_REVISION.to_string(), "1".to_string());
        Pod {
            metadata: ObjectMeta {
                name: Some("ecs-service-web-5d8f7c9b6-x2x4z".to_string()),
                namespace: Some("demo-us-east-1".to_string()),
                uid: Some("aaaa-bbbb-cccc".to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "web".to_string(),
                    image: Some("nginx".to_string()),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                pod_ip: Some("10.1.0.4".to_string()),
                container_statuses: Some(vec![ContainerStatus {
                    name: "web".to_string(),
                    ready,
                    state: Some(ContainerState {
                        running: Some(ContainerStateRunning::default()),
                        ..Default::default()
                    }),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_observed_service_counts_and_status() {
        let existing = service(2);
        let next = observed_service(&existing, Some(&deployment(2, 2)), at(10));
        assert_eq!(next.running_count, 2);
        assert_eq!(next.pending_count, 0);
        assert_eq!(next.status, ServiceStatus::Active);
        assert_eq!(next.desired_count, 2);
        assert_eq!(next.updated_at, at(10));
    }

    #[test]
    fn test_observed_service_replay_is_identical() {
        let existing = service(2);
        let first = observed_service(&existing, Some(&deployment(2, 1)), at(10));
        let mut stored = existing.clone();
        stored.absorb_observed(&first);

        let replay = observed_service(&stored, Some(&deployment(2, 1)), at(10));
        assert_eq!(replay, stored);

        // Same observation seen later keeps the earlier timestamp
        let later = observed_service(&stored, Some(&deployment(2, 1)), at(99));
        assert_eq!(later.updated_at, at(10));
    }

    #[test]
    fn test_observed_service_gone() {
        let mut existing = service(0);
        existing.status = ServiceStatus::Draining;
        existing.running_count = 1;
        let next = observed_service(&existing, None, at(5));
        assert_eq!(next.status, ServiceStatus::Inactive);
        assert_eq!(next.running_count, 0);
    }

    #[test]
    fn test_task_identity_for_service_pod() {
        let pod = service_pod("Running", true);
        let identity = task_identity(&pod, "demo", &arns());
        assert_eq!(identity.task_id, "aaaabbbbcccc");
        assert_eq!(
            identity.task_arn,
            "arn:aws:ecs:us-east-1:000000000000:task/demo/aaaabbbbcccc"
        );
        assert_eq!(identity.service_arn, Some(arns().service("demo", "web")));
        assert!(identity.task_set_arn.is_none());
        assert!(!identity.labelled);
    }

    #[test]
    fn test_task_identity_for_run_task_pod() {
        let mut pod = service_pod("Running", true);
        pod.metadata.name = Some("ecs-task-0123abcd".to_string());
        let mut labels = BTreeMap::new();
        labels.insert(LABEL_TASK_ID.to_string(), "0123abcd".to_string());
        pod.metadata.labels = Some(labels);

        let identity = task_identity(&pod, "demo", &arns());
        assert_eq!(identity.task_id, "0123abcd");
        assert!(identity.labelled);
        assert!(identity.service_arn.is_none());
    }

    #[test]
    fn test_new_and_observed_task() {
        let pod = service_pod("Running", true);
        let identity = task_identity(&pod, "demo", &arns());
        let skeleton = new_task(&identity, &pod, &arns(), at(1));
        assert_eq!(skeleton.task_definition_arn, arns().task_definition("web", 1));
        assert_eq!(skeleton.group.as_deref(), Some("service:web"));

        let next = observed_task(&skeleton, &pod, false, at(2));
        assert_eq!(next.last_status, TaskStatus::Running);
        assert_eq!(next.desired_status, TaskStatus::Running);
        assert_eq!(next.health_status, HealthStatus::Healthy);
        assert_eq!(next.started_at, Some(at(2)));
        assert_eq!(
            next.attachment.as_ref().unwrap().attachment_id,
            "eni-aaaa-bbbb-cccc"
        );
    }

    #[test]
    fn test_deleted_pod_stops_task() {
        let pod = service_pod("Running", true);
        let identity = task_identity(&pod, "demo", &arns());
        let mut existing = new_task(&identity, &pod, &arns(), at(1));
        existing.last_status = TaskStatus::Running;

        let next = observed_task(&existing, &pod, true, at(3));
        assert_eq!(next.last_status, TaskStatus::Stopped);
        assert_eq!(next.desired_status, TaskStatus::Stopped);
        assert_eq!(next.stopped_reason.as_deref(), Some("Pod deleted"));
        assert_eq!(next.stopped_at, Some(at(3)));
        assert!(next
            .containers
            .iter()
            .all(|c| c.last_status == TaskStatus::Stopped));

        // A stop reason set through StopTask is kept
        existing.stopped_reason = Some("Scaling down".to_string());
        let next = observed_task(&existing, &pod, true, at(3));
        assert_eq!(next.stopped_reason.as_deref(), Some("Scaling down"));
    }

    #[test]
    fn test_stopped_task_ignores_late_events() {
        let pod = service_pod("Running", true);
        let identity = task_identity(&pod, "demo", &arns());
        let mut existing = new_task(&identity, &pod, &arns(), at(1));
        existing.last_status = TaskStatus::Stopped;

        let next = observed_task(&existing, &pod, false, at(9));
        assert_eq!(next, existing);
    }
}
