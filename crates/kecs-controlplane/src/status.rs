//! Observed-state mapping
//!
//! Pure functions turning Deployment and Pod status into ECS counts and
//! lifecycle values. They never look at storage.

use crate::types::{
    ContainerState as EcsContainerState, HealthStatus, NetworkAttachment, ServiceStatus,
    StabilityStatus, TaskStatus,
};
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{ContainerStatus, Pod};

/// Condition reason set by the deployment controller while rolling out
const REASON_REPLICA_SET_UPDATED: &str = "ReplicaSetUpdated";

/// Reason recorded when a pod disappears without a terminal status
pub const POD_DELETED_REASON: &str = "Pod deleted";

/// Reason recorded when a container of a finished task exited
pub const CONTAINER_EXITED_REASON: &str = "Essential container in task exited";

fn non_negative(value: Option<i32>) -> u32 {
    value.unwrap_or(0).max(0) as u32
}

/// `(running, pending)` from a deployment status
///
/// Running counts ready replicas; pending is the rest of the created ones.
pub fn observed_counts(status: Option<&DeploymentStatus>) -> (u32, u32) {
    match status {
        Some(s) => {
            let replicas = non_negative(s.replicas);
            let ready = non_negative(s.ready_replicas);
            (ready, replicas.saturating_sub(ready))
        }
        None => (0, 0),
    }
}

fn desired_replicas(deployment: &Deployment) -> u32 {
    non_negative(deployment.spec.as_ref().and_then(|s| s.replicas).or(Some(1)))
}

/// Whether the deployment controller is still rolling out a change
pub fn rollout_in_progress(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };

    let generation_behind = matches!(
        (status.observed_generation, deployment.metadata.generation),
        (Some(observed), Some(generation)) if observed < generation
    );
    let replicas = non_negative(status.replicas);
    let updated = non_negative(status.updated_replicas);
    let old_replicas_present = replicas > updated;
    let partially_updated = updated > 0 && updated < desired_replicas(deployment);
    let replica_set_updating = status.conditions.as_ref().is_some_and(|conditions| {
        conditions.iter().any(|c| {
            c.type_ == "Progressing"
                && c.status == "True"
                && c.reason.as_deref() == Some(REASON_REPLICA_SET_UPDATED)
        })
    });

    generation_behind || old_replicas_present || partially_updated || replica_set_updating
}

/// Service status for the backing deployment (or its absence)
pub fn service_status(deployment: Option<&Deployment>, desired: u32) -> ServiceStatus {
    let Some(deployment) = deployment else {
        return ServiceStatus::Inactive;
    };
    if deployment.metadata.deletion_timestamp.is_some() {
        return ServiceStatus::Draining;
    }

    let (running, _) = observed_counts(deployment.status.as_ref());
    if desired == 0 && running > 0 {
        return ServiceStatus::Draining;
    }
    if running == desired {
        return ServiceStatus::Active;
    }
    if rollout_in_progress(deployment) {
        return ServiceStatus::Updating;
    }
    if running == 0 {
        return ServiceStatus::Provisioning;
    }
    ServiceStatus::Updating
}

/// Task set stability for its deployment
pub fn task_set_stability(deployment: &Deployment) -> StabilityStatus {
    let (running, _) = observed_counts(deployment.status.as_ref());
    if running == desired_replicas(deployment) && !rollout_in_progress(deployment) {
        StabilityStatus::SteadyState
    } else {
        StabilityStatus::Stabilizing
    }
}

fn container_statuses(pod: &Pod) -> &[ContainerStatus] {
    pod.status
        .as_ref()
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or_default()
}

fn is_running(status: &ContainerStatus) -> bool {
    status.state.as_ref().is_some_and(|s| s.running.is_some())
}

/// `(desired, last)` task status for a pod
pub fn task_status_from_pod(pod: &Pod) -> (TaskStatus, TaskStatus) {
    if pod.metadata.deletion_timestamp.is_some() {
        return (TaskStatus::Stopped, TaskStatus::Deprovisioning);
    }

    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Pending");
    let statuses = container_statuses(pod);

    match phase {
        "Pending" if statuses.is_empty() => (TaskStatus::Running, TaskStatus::Provisioning),
        "Pending" => (TaskStatus::Running, TaskStatus::Pending),
        "Running" => {
            let all_ready = !statuses.is_empty() && statuses.iter().all(|c| c.ready);
            if all_ready || statuses.iter().any(is_running) {
                (TaskStatus::Running, TaskStatus::Running)
            } else {
                (TaskStatus::Running, TaskStatus::Activating)
            }
        }
        _ => (TaskStatus::Stopped, TaskStatus::Stopped),
    }
}

/// Aggregate task health from container readiness
pub fn task_health(pod: &Pod) -> HealthStatus {
    let statuses = container_statuses(pod);
    if statuses.is_empty() {
        return HealthStatus::Unknown;
    }
    if statuses.iter().all(|c| c.ready) {
        return HealthStatus::Healthy;
    }
    if statuses.iter().any(|c| is_running(c) && !c.ready) {
        return HealthStatus::Unhealthy;
    }
    HealthStatus::Unknown
}

/// Per-container state, in pod spec order
pub fn container_states(pod: &Pod) -> Vec<EcsContainerState> {
    let statuses = container_statuses(pod);
    let spec_containers = pod
        .spec
        .as_ref()
        .map(|s| s.containers.as_slice())
        .unwrap_or_default();

    spec_containers
        .iter()
        .map(|container| {
            let status = statuses.iter().find(|s| s.name == container.name);
            let state = status.and_then(|s| s.state.as_ref());
            let terminated = state.and_then(|s| s.terminated.as_ref());
            let waiting = state.and_then(|s| s.waiting.as_ref());

            let last_status = match state {
                Some(s) if s.running.is_some() => TaskStatus::Running,
                Some(s) if s.terminated.is_some() => TaskStatus::Stopped,
                Some(_) => TaskStatus::Pending,
                None => TaskStatus::Provisioning,
            };
            let health_status = match status {
                Some(s) if s.ready => HealthStatus::Healthy,
                Some(s) if is_running(s) => HealthStatus::Unhealthy,
                _ => HealthStatus::Unknown,
            };

            EcsContainerState {
                name: container.name.clone(),
                image: container.image.clone(),
                last_status,
                exit_code: terminated.map(|t| t.exit_code),
                reason: terminated
                    .and_then(|t| t.reason.clone())
                    .or_else(|| waiting.and_then(|w| w.reason.clone())),
                health_status,
                runtime_id: status.and_then(|s| s.container_id.clone()),
            }
        })
        .collect()
}

/// Network attachment for a pod that has an IP
pub fn network_attachment(pod: &Pod) -> Option<NetworkAttachment> {
    let uid = pod.metadata.uid.as_deref()?;
    let ip = pod.status.as_ref().and_then(|s| s.pod_ip.clone());
    ip.as_ref()?;
    Some(NetworkAttachment {
        attachment_id: format!("eni-{}", uid),
        private_ipv4_address: ip,
    })
}

/// Why a finished pod stopped
pub fn stopped_reason(pod: &Pod) -> Option<String> {
    let status = pod.status.as_ref()?;
    match status.phase.as_deref() {
        Some("Succeeded") | Some("Failed") => {
            if let Some(message) = status.message.clone().or_else(|| status.reason.clone()) {
                return Some(message);
            }
            Some(CONTAINER_EXITED_REASON.to_string())
        }
        _ => None,
    }
}
