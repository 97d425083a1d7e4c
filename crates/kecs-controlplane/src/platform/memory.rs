//! In-memory platform for testing and development
//!
//! Behaves like a tiny API server: namespaced objects, server-assigned uid,
//! resourceVersion and generation, idempotent apply, and watch streams that
//! replay current state before live changes. Nothing runs the objects; tests
//! drive status through the `set_*` helpers.

use super::{ApplyOutcome, OrchestrationClient, WatchEvent, WatchStream};
use crate::error::{PlatformError, PlatformResult};
use crate::naming::{has_managed_label, LABEL_MANAGED_BY};
use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::{Deployment, DeploymentStatus};
use k8s_openapi::api::core::v1::{ContainerState, ContainerStateRunning, ContainerStatus, Pod, PodStatus};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, Time};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::broadcast;

const EVENT_CAPACITY: usize = 4096;

type ObjectKey = (String, String);

#[derive(Default)]
struct PlatformState {
    namespaces: BTreeMap<String, BTreeMap<String, String>>,
    deployments: BTreeMap<ObjectKey, Deployment>,
    pods: BTreeMap<ObjectKey, Pod>,
    resource_version: u64,
}

impl PlatformState {
    fn next_resource_version(&mut self) -> String {
        self.resource_version += 1;
        self.resource_version.to_string()
    }
}

/// In-process stand-in for a Kubernetes API server
pub struct MemoryPlatform {
    state: Mutex<PlatformState>,
    deployment_events: broadcast::Sender<WatchEvent<Deployment>>,
    pod_events: broadcast::Sender<WatchEvent<Pod>>,
    applies: AtomicU64,
}

impl Default for MemoryPlatform {
    fn default() -> Self {
        Self::new()
    }
}

fn key_of(meta: &ObjectMeta, kind: &str) -> PlatformResult<ObjectKey> {
    let name = meta
        .name
        .clone()
        .ok_or_else(|| PlatformError::InvalidObject(format!("{} missing metadata.name", kind)))?;
    let namespace = meta.namespace.clone().ok_or_else(|| {
        PlatformError::InvalidObject(format!("{} {} missing metadata.namespace", kind, name))
    })?;
    Ok((namespace, name))
}

fn check_owned(kind: &'static str, key: &ObjectKey, existing: &ObjectMeta) -> PlatformResult<()> {
    if has_managed_label(existing.labels.as_ref()) {
        return Ok(());
    }
    Err(PlatformError::Conflict {
        kind,
        namespace: key.0.clone(),
        name: key.1.clone(),
        reason: format!("object is not labelled {}", LABEL_MANAGED_BY),
    })
}

/// Merge the server-owned metadata of `existing` into a freshly applied object
fn carry_server_fields(applied: &mut ObjectMeta, existing: &ObjectMeta) {
    applied.uid = existing.uid.clone();
    applied.creation_timestamp = existing.creation_timestamp.clone();
    applied.generation = existing.generation;
    applied.deletion_timestamp = existing.deletion_timestamp.clone();
}

fn watch_from<K>(initial: Vec<K>, rx: broadcast::Receiver<WatchEvent<K>>) -> WatchStream<K>
where
    K: Clone + Send + Sync + 'static,
{
    let replay = futures::stream::iter(
        initial
            .into_iter()
            .map(|obj| Ok(WatchEvent::Applied(obj))),
    );
    let live = futures::stream::unfold(rx, |mut rx| async move {
        match rx.recv().await {
            Ok(event) => Some((Ok(event), rx)),
            Err(broadcast::error::RecvError::Lagged(skipped)) => Some((
                Err(PlatformError::Unavailable(format!(
                    "watch lagged, {} events skipped",
                    skipped
                ))),
                rx,
            )),
            Err(broadcast::error::RecvError::Closed) => None,
        }
    });
    replay.chain(live).boxed()
}

impl MemoryPlatform {
    pub fn new() -> Self {
        let (deployment_events, _) = broadcast::channel(EVENT_CAPACITY);
        let (pod_events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            state: Mutex::new(PlatformState::default()),
            deployment_events,
            pod_events,
            applies: AtomicU64::new(0),
        }
    }

    /// Applies that changed an object
    pub fn apply_count(&self) -> u64 {
        self.applies.load(Ordering::SeqCst)
    }

    pub fn namespace_exists(&self, name: &str) -> bool {
        self.state.lock().namespaces.contains_key(name)
    }

    pub fn deployment(&self, namespace: &str, name: &str) -> Option<Deployment> {
        self.state
            .lock()
            .deployments
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    pub fn pod(&self, namespace: &str, name: &str) -> Option<Pod> {
        self.state
            .lock()
            .pods
            .get(&(namespace.to_string(), name.to_string()))
            .cloned()
    }

    fn emit_deployment(&self, event: WatchEvent<Deployment>) {
        // No receivers is fine
        let _ = self.deployment_events.send(event);
    }

    fn emit_pod(&self, event: WatchEvent<Pod>) {
        let _ = self.pod_events.send(event);
    }

    /// Replace a deployment's status
    pub fn set_deployment_status(
        &self,
        namespace: &str,
        name: &str,
        status: DeploymentStatus,
    ) -> PlatformResult<()> {
        let mut state = self.state.lock();
        let rv = state.next_resource_version();
        let deployment = state
            .deployments
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| PlatformError::NotFound {
                kind: "Deployment",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        deployment.status = Some(status);
        deployment.metadata.resource_version = Some(rv);
        self.emit_deployment(WatchEvent::Applied(deployment.clone()));
        Ok(())
    }

    /// Report `ready` of the desired replicas as ready and rolled out
    pub fn set_deployment_ready(&self, namespace: &str, name: &str, ready: i32) -> PlatformResult<()> {
        let (generation, replicas) = {
            let state = self.state.lock();
            let deployment = state
                .deployments
                .get(&(namespace.to_string(), name.to_string()))
                .ok_or_else(|| PlatformError::NotFound {
                    kind: "Deployment",
                    namespace: namespace.to_string(),
                    name: name.to_string(),
                })?;
            (
                deployment.metadata.generation,
                deployment.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
            )
        };
        let ready = ready.min(replicas).max(0);
        self.set_deployment_status(
            namespace,
            name,
            DeploymentStatus {
                observed_generation: generation,
                replicas: Some(replicas),
                ready_replicas: Some(ready),
                available_replicas: Some(ready),
                updated_replicas: Some(replicas),
                ..Default::default()
            },
        )
    }

    /// Bring every replica of a deployment to ready
    pub fn converge_deployment(&self, namespace: &str, name: &str) -> PlatformResult<()> {
        self.set_deployment_ready(namespace, name, i32::MAX)
    }

    /// Start graceful deletion: the object stays, with a deletion timestamp
    pub fn mark_deployment_deleting(&self, namespace: &str, name: &str) -> PlatformResult<()> {
        let mut state = self.state.lock();
        let rv = state.next_resource_version();
        let deployment = state
            .deployments
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| PlatformError::NotFound {
                kind: "Deployment",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        deployment.metadata.deletion_timestamp = Some(Time(Utc::now()));
        deployment.metadata.resource_version = Some(rv);
        self.emit_deployment(WatchEvent::Applied(deployment.clone()));
        Ok(())
    }

    /// Insert a pod as a controller would (no ownership check)
    pub fn insert_pod(&self, mut pod: Pod) -> PlatformResult<()> {
        let key = key_of(&pod.metadata, "Pod")?;
        let mut state = self.state.lock();
        let rv = state.next_resource_version();
        pod.metadata.resource_version = Some(rv);
        if pod.metadata.uid.is_none() {
            pod.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
        }
        pod.metadata
            .creation_timestamp
            .get_or_insert_with(|| Time(Utc::now()));
        state.pods.insert(key, pod.clone());
        self.emit_pod(WatchEvent::Applied(pod));
        Ok(())
    }

    /// Replace a pod's status
    pub fn set_pod_status(&self, namespace: &str, name: &str, status: PodStatus) -> PlatformResult<()> {
        let mut state = self.state.lock();
        let rv = state.next_resource_version();
        let pod = state
            .pods
            .get_mut(&(namespace.to_string(), name.to_string()))
            .ok_or_else(|| PlatformError::NotFound {
                kind: "Pod",
                namespace: namespace.to_string(),
                name: name.to_string(),
            })?;
        pod.status = Some(status);
        pod.metadata.resource_version = Some(rv);
        self.emit_pod(WatchEvent::Applied(pod.clone()));
        Ok(())
    }

    /// Mark every container of a pod running and ready
    pub fn run_pod(&self, namespace: &str, name: &str, ip: &str) -> PlatformResult<()> {
        let containers: Vec<(String, Option<String>)> = self
            .pod(namespace, name)
            .and_then(|p| p.spec)
            .map(|spec| {
                spec.containers
                    .into_iter()
                    .map(|c| (c.name, c.image))
                    .collect()
            })
            .unwrap_or_default();
        let started = Time(Utc::now());
        let statuses = containers
            .into_iter()
            .map(|(container, image)| ContainerStatus {
                name: container.clone(),
                image: image.unwrap_or_default(),
                ready: true,
                started: Some(true),
                container_id: Some(format!("containerd://{}", container)),
                state: Some(ContainerState {
                    running: Some(ContainerStateRunning {
                        started_at: Some(started.clone()),
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            })
            .collect();
        self.set_pod_status(
            namespace,
            name,
            PodStatus {
                phase: Some("Running".to_string()),
                pod_ip: Some(ip.to_string()),
                start_time: Some(started),
                container_statuses: Some(statuses),
                ..Default::default()
            },
        )
    }
}

#[async_trait]
impl OrchestrationClient for MemoryPlatform {
    async fn ensure_namespace(&self, name: &str, labels: BTreeMap<String, String>) -> PlatformResult<()> {
        self.state
            .lock()
            .namespaces
            .entry(name.to_string())
            .or_insert(labels);
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> PlatformResult<()> {
        let mut state = self.state.lock();
        if state.namespaces.remove(name).is_none() {
            return Ok(());
        }

        let deployments: Vec<ObjectKey> = state
            .deployments
            .keys()
            .filter(|(ns, _)| ns == name)
            .cloned()
            .collect();
        for key in deployments {
            if let Some(d) = state.deployments.remove(&key) {
                self.emit_deployment(WatchEvent::Deleted(d));
            }
        }

        let pods: Vec<ObjectKey> = state
            .pods
            .keys()
            .filter(|(ns, _)| ns == name)
            .cloned()
            .collect();
        for key in pods {
            if let Some(p) = state.pods.remove(&key) {
                self.emit_pod(WatchEvent::Deleted(p));
            }
        }
        Ok(())
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> PlatformResult<Option<Deployment>> {
        Ok(self.deployment(namespace, name))
    }

    async fn list_deployments(&self, namespace: &str) -> PlatformResult<Vec<Deployment>> {
        Ok(self
            .state
            .lock()
            .deployments
            .iter()
            .filter(|((ns, _), d)| ns == namespace && has_managed_label(d.metadata.labels.as_ref()))
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> PlatformResult<ApplyOutcome> {
        let key = key_of(&deployment.metadata, "Deployment")?;
        let mut state = self.state.lock();
        if !state.namespaces.contains_key(&key.0) {
            return Err(PlatformError::NotFound {
                kind: "Namespace",
                namespace: String::new(),
                name: key.0,
            });
        }

        let mut applied = deployment.clone();
        let outcome = match state.deployments.get(&key) {
            Some(existing) => {
                check_owned("Deployment", &key, &existing.metadata)?;
                if existing.spec == applied.spec
                    && existing.metadata.labels == applied.metadata.labels
                    && existing.metadata.annotations == applied.metadata.annotations
                {
                    return Ok(ApplyOutcome::Unchanged);
                }
                let spec_changed = existing.spec != applied.spec;
                carry_server_fields(&mut applied.metadata, &existing.metadata);
                if spec_changed {
                    applied.metadata.generation = Some(existing.metadata.generation.unwrap_or(1) + 1);
                }
                applied.status = existing.status.clone();
                ApplyOutcome::Updated
            }
            None => {
                applied.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
                applied.metadata.creation_timestamp = Some(Time(Utc::now()));
                applied.metadata.generation = Some(1);
                applied.status = None;
                ApplyOutcome::Created
            }
        };

        applied.metadata.resource_version = Some(state.next_resource_version());
        state.deployments.insert(key, applied.clone());
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.emit_deployment(WatchEvent::Applied(applied));
        Ok(outcome)
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> PlatformResult<bool> {
        let removed = self
            .state
            .lock()
            .deployments
            .remove(&(namespace.to_string(), name.to_string()));
        match removed {
            Some(d) => {
                self.emit_deployment(WatchEvent::Deleted(d));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> PlatformResult<Option<Pod>> {
        Ok(self.pod(namespace, name))
    }

    async fn list_pods(&self, namespace: &str) -> PlatformResult<Vec<Pod>> {
        Ok(self
            .state
            .lock()
            .pods
            .iter()
            .filter(|((ns, _), p)| ns == namespace && has_managed_label(p.metadata.labels.as_ref()))
            .map(|(_, p)| p.clone())
            .collect())
    }

    async fn apply_pod(&self, pod: &Pod) -> PlatformResult<ApplyOutcome> {
        let key = key_of(&pod.metadata, "Pod")?;
        let mut state = self.state.lock();
        if !state.namespaces.contains_key(&key.0) {
            return Err(PlatformError::NotFound {
                kind: "Namespace",
                namespace: String::new(),
                name: key.0,
            });
        }

        let mut applied = pod.clone();
        let outcome = match state.pods.get(&key) {
            Some(existing) => {
                check_owned("Pod", &key, &existing.metadata)?;
                if existing.spec == applied.spec
                    && existing.metadata.labels == applied.metadata.labels
                    && existing.metadata.annotations == applied.metadata.annotations
                {
                    return Ok(ApplyOutcome::Unchanged);
                }
                if existing.spec != applied.spec {
                    return Err(PlatformError::Conflict {
                        kind: "Pod",
                        namespace: key.0,
                        name: key.1,
                        reason: "pod spec is immutable".to_string(),
                    });
                }
                carry_server_fields(&mut applied.metadata, &existing.metadata);
                applied.status = existing.status.clone();
                ApplyOutcome::Updated
            }
            None => {
                applied.metadata.uid = Some(uuid::Uuid::new_v4().to_string());
                applied.metadata.creation_timestamp = Some(Time(Utc::now()));
                applied.status = Some(PodStatus {
                    phase: Some("Pending".to_string()),
                    ..Default::default()
                });
                ApplyOutcome::Created
            }
        };

        applied.metadata.resource_version = Some(state.next_resource_version());
        state.pods.insert(key, applied.clone());
        self.applies.fetch_add(1, Ordering::SeqCst);
        self.emit_pod(WatchEvent::Applied(applied));
        Ok(outcome)
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> PlatformResult<bool> {
        let removed = self
            .state
            .lock()
            .pods
            .remove(&(namespace.to_string(), name.to_string()));
        match removed {
            Some(p) => {
                self.emit_pod(WatchEvent::Deleted(p));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    fn watch_deployments(&self) -> WatchStream<Deployment> {
        let state = self.state.lock();
        let rx = self.deployment_events.subscribe();
        let initial = state
            .deployments
            .values()
            .filter(|d| has_managed_label(d.metadata.labels.as_ref()))
            .cloned()
            .collect();
        watch_from(initial, rx)
    }

    fn watch_pods(&self) -> WatchStream<Pod> {
        let state = self.state.lock();
        let rx = self.pod_events.subscribe();
        let initial = state
            .pods
            .values()
            .filter(|p| has_managed_label(p.metadata.labels.as_ref()))
            .cloned()
            .collect();
        watch_from(initial, rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::naming::managed_labels;
    use k8s_openapi::api::apps::v1::DeploymentSpec;

    fn deployment(replicas: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("ecs-service-web".to_string()),
                namespace: Some("demo-us-east-1".to_string()),
                labels: Some(managed_labels("demo")),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_apply_is_idempotent() {
        let platform = MemoryPlatform::new();
        platform
            .ensure_namespace("demo-us-east-1", BTreeMap::new())
            .await
            .unwrap();

        assert_eq!(
            platform.apply_deployment(&deployment(2)).await.unwrap(),
            ApplyOutcome::Created
        );
        assert_eq!(
            platform.apply_deployment(&deployment(2)).await.unwrap(),
            ApplyOutcome::Unchanged
        );
        assert_eq!(platform.apply_count(), 1);

        assert_eq!(
            platform.apply_deployment(&deployment(3)).await.unwrap(),
            ApplyOutcome::Updated
        );
        let stored = platform.deployment("demo-us-east-1", "ecs-service-web").unwrap();
        assert_eq!(stored.metadata.generation, Some(2));
    }

    #[tokio::test]
    async fn test_apply_requires_namespace() {
        let platform = MemoryPlatform::new();
        let err = platform.apply_deployment(&deployment(1)).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_watch_replays_then_streams() {
        let platform = MemoryPlatform::new();
        platform
            .ensure_namespace("demo-us-east-1", BTreeMap::new())
            .await
            .unwrap();
        platform.apply_deployment(&deployment(1)).await.unwrap();

        let mut stream = platform.watch_deployments();
        let first = stream.next().await.unwrap().unwrap();
        assert!(matches!(first, WatchEvent::Applied(_)));

        platform
            .delete_deployment("demo-us-east-1", "ecs-service-web")
            .await
            .unwrap();
        match stream.next().await.unwrap().unwrap() {
            WatchEvent::Deleted(last) => {
                assert_eq!(last.metadata.name.as_deref(), Some("ecs-service-web"))
            }
            WatchEvent::Applied(_) => panic!("expected a delete"),
        }
    }

    #[tokio::test]
    async fn test_namespace_delete_cascades() {
        let platform = MemoryPlatform::new();
        platform
            .ensure_namespace("demo-us-east-1", BTreeMap::new())
            .await
            .unwrap();
        platform.apply_deployment(&deployment(1)).await.unwrap();
        let mut stream = platform.watch_deployments();
        let _ = stream.next().await;

        platform.delete_namespace("demo-us-east-1").await.unwrap();
        assert!(!platform.namespace_exists("demo-us-east-1"));
        assert!(matches!(
            stream.next().await.unwrap().unwrap(),
            WatchEvent::Deleted(_)
        ));
        assert!(platform
            .deployment("demo-us-east-1", "ecs-service-web")
            .is_none());
    }

    #[tokio::test]
    async fn test_set_deployment_ready() {
        let platform = MemoryPlatform::new();
        platform
            .ensure_namespace("demo-us-east-1", BTreeMap::new())
            .await
            .unwrap();
        platform.apply_deployment(&deployment(3)).await.unwrap();
        platform
            .set_deployment_ready("demo-us-east-1", "ecs-service-web", 2)
            .unwrap();

        let status = platform
            .deployment("demo-us-east-1", "ecs-service-web")
            .unwrap()
            .status
            .unwrap();
        assert_eq!(status.replicas, Some(3));
        assert_eq!(status.ready_replicas, Some(2));
        assert_eq!(status.observed_generation, Some(1));
    }
}
