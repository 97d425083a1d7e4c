//! Sync Controller
//!
//! The reverse path: watches managed Deployments and Pods and writes their
//! observed state back into ECS records through the [`BatchUpdater`].
//!
//! ```text
//! watch streams ─▶ bounded channel ─▶ dispatcher ─▶ WorkQueue ─▶ workers
//!                                       │                          │
//!                                 observation cache ◀──────────────┘
//! ```
//!
//! The dispatcher keeps the latest object per key in a cache and queues the
//! key; workers reconcile from the cache, so several events for one object
//! collapse into a single reconcile. Deleted objects stay in the cache as
//! tombstones so their records can still be resolved.

mod queue;
mod reconcile;

pub use queue::WorkQueue;
pub use reconcile::{new_task, observed_service, observed_task, observed_task_set, task_identity, TaskIdentity};

use crate::arn::ArnBuilder;
use crate::backoff::calculate_backoff;
use crate::batch::{BatchUpdater, RecordUpdate, UpdateKind};
use crate::config::{ControlPlaneConfig, SyncConfig};
use crate::error::Result;
use crate::naming::{self, ClusterInfo};
use crate::platform::{SharedPlatform, WatchEvent};
use crate::storage::{get_optional, list_all, ListFilter, RecordKey, SharedStorage};
use crate::types::{Cluster, ClusterStatus, Task};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

/// Metrics for the sync controller
#[derive(Clone)]
pub struct SyncMetrics {
    pub events: metrics::Counter,
    pub events_skipped: metrics::Counter,
    pub reconciliations: metrics::Counter,
    pub errors: metrics::Counter,
    pub retries: metrics::Counter,
    pub dropped: metrics::Counter,
    pub watch_errors: metrics::Counter,
    pub duration: metrics::Histogram,
}

impl SyncMetrics {
    pub fn new() -> Self {
        Self {
            events: metrics::counter!("kecs_sync_events_total"),
            events_skipped: metrics::counter!("kecs_sync_events_skipped_total"),
            reconciliations: metrics::counter!("kecs_sync_reconciliations_total"),
            errors: metrics::counter!("kecs_sync_reconciliation_errors_total"),
            retries: metrics::counter!("kecs_sync_retries_total"),
            dropped: metrics::counter!("kecs_sync_keys_dropped_total"),
            watch_errors: metrics::counter!("kecs_sync_watch_errors_total"),
            duration: metrics::histogram!("kecs_sync_reconciliation_duration_seconds"),
        }
    }
}

impl Default for SyncMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    Deployment,
    Pod,
}

/// Identity of a watched object
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ObjectKey {
    pub kind: ObjectKind,
    pub namespace: String,
    pub name: String,
}

impl ObjectKey {
    pub fn deployment(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: ObjectKind::Deployment,
            namespace: namespace.into(),
            name: name.into(),
        }
    }

    pub fn pod(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            kind: ObjectKind::Pod,
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} {}/{}", self.kind, self.namespace, self.name)
    }
}

/// A watch event from either stream
#[derive(Debug, Clone)]
pub enum ObservedEvent {
    Deployment(WatchEvent<Deployment>),
    Pod(WatchEvent<Pod>),
}

#[derive(Debug, Clone)]
enum ObservedObject {
    Deployment(Deployment),
    Pod(Pod),
}

impl ObservedObject {
    fn meta(&self) -> &ObjectMeta {
        match self {
            ObservedObject::Deployment(d) => &d.metadata,
            ObservedObject::Pod(p) => &p.metadata,
        }
    }
}

#[derive(Debug, Clone)]
struct CachedObject {
    object: ObservedObject,
    /// Last event was a delete
    deleted: bool,
    observed_at: DateTime<Utc>,
}

/// Result of reconciling one key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// An update was handed to the batch updater
    Enqueued(UpdateKind),
    /// Nothing to do (no record, or nothing cached)
    NoOp,
    /// Object could not be mapped to an ECS resource
    Skipped(String),
}

/// Whether a deployment update changes anything the reverse path reads
fn deployment_changed(old: &Deployment, new: &Deployment) -> bool {
    let replicas = |d: &Deployment| d.spec.as_ref().and_then(|s| s.replicas);
    old.metadata.generation != new.metadata.generation
        || old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
        || old.metadata.annotations != new.metadata.annotations
        || replicas(old) != replicas(new)
        || old.status != new.status
}

/// Whether a pod update changes anything the reverse path reads
fn pod_changed(old: &Pod, new: &Pod) -> bool {
    let phase = |p: &Pod| p.status.as_ref().and_then(|s| s.phase.clone());
    let ip = |p: &Pod| p.status.as_ref().and_then(|s| s.pod_ip.clone());
    let containers = |p: &Pod| p.status.as_ref().and_then(|s| s.container_statuses.clone());
    old.metadata.deletion_timestamp != new.metadata.deletion_timestamp
        || phase(old) != phase(new)
        || ip(old) != ip(new)
        || containers(old) != containers(new)
}

/// Reverse-path controller
pub struct SyncController {
    storage: SharedStorage,
    platform: SharedPlatform,
    batch: Arc<BatchUpdater>,
    config: SyncConfig,
    region: String,
    arns: ArnBuilder,
    cache: DashMap<ObjectKey, CachedObject>,
    queue: Arc<WorkQueue<ObjectKey>>,
    metrics: SyncMetrics,
}

impl SyncController {
    pub fn new(
        config: &ControlPlaneConfig,
        storage: SharedStorage,
        platform: SharedPlatform,
        batch: Arc<BatchUpdater>,
    ) -> Self {
        Self {
            storage,
            platform,
            batch,
            config: config.sync.clone(),
            region: config.region.clone(),
            arns: ArnBuilder::from_config(config),
            cache: DashMap::new(),
            queue: Arc::new(WorkQueue::new()),
            metrics: SyncMetrics::new(),
        }
    }

    pub fn queue(&self) -> &Arc<WorkQueue<ObjectKey>> {
        &self.queue
    }

    /// Run watchers, dispatcher and workers until cancelled
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!(
            workers = self.config.workers,
            queue_capacity = self.config.queue_capacity,
            "Starting sync controller"
        );

        let (tx, mut rx) = mpsc::channel::<ObservedEvent>(self.config.queue_capacity);
        let mut handles = Vec::new();

        // Deployment watcher
        {
            let mut stream = self.platform.watch_deployments();
            let tx = tx.clone();
            let cancel = cancel.clone();
            let metrics = self.metrics.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => {
                            if tx.send(ObservedEvent::Deployment(event)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            metrics.watch_errors.increment(1);
                            warn!(error = %e, "Deployment watch error");
                        }
                        None => break,
                    }
                }
                debug!("Deployment watcher stopped");
            }));
        }

        // Pod watcher
        {
            let mut stream = self.platform.watch_pods();
            let tx = tx.clone();
            let cancel = cancel.clone();
            let metrics = self.metrics.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => break,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => {
                            if tx.send(ObservedEvent::Pod(event)).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(e)) => {
                            metrics.watch_errors.increment(1);
                            warn!(error = %e, "Pod watch error");
                        }
                        None => break,
                    }
                }
                debug!("Pod watcher stopped");
            }));
        }
        drop(tx);

        // Dispatcher
        {
            let controller = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                loop {
                    let event = tokio::select! {
                        _ = cancel.cancelled() => break,
                        event = rx.recv() => event,
                    };
                    match event {
                        Some(event) => {
                            controller.observe(event);
                        }
                        None => break,
                    }
                }
                debug!("Dispatcher stopped");
            }));
        }

        // Workers
        for worker in 0..self.config.workers {
            let controller = self.clone();
            handles.push(tokio::spawn(async move {
                while let Some(key) = controller.queue.get().await {
                    controller.process(key).await;
                }
                debug!(worker, "Sync worker stopped");
            }));
        }

        // Periodic resync repairs anything the watches missed
        if let Some(interval) = self.config.resync_interval() {
            let controller = self.clone();
            let cancel = cancel.clone();
            handles.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // The watch streams replay current state on start
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    match controller.resync().await {
                        Ok(queued) => debug!(queued, "Resync complete"),
                        Err(e) => warn!(error = %e, "Resync failed"),
                    }
                }
                debug!("Resync stopped");
            }));
        }

        cancel.cancelled().await;
        self.queue.shutdown();

        for handle in handles {
            if let Err(e) = handle.await {
                error!(error = %e, "Sync task panicked");
            }
        }

        // Workers may have enqueued after the batch updater's own final drain
        self.batch.drain().await;

        info!("Sync controller stopped");
        Ok(())
    }

    /// List managed objects in every active cluster and feed them through
    /// [`Self::observe`]
    ///
    /// Cached objects that are no longer listed are confirmed gone with a
    /// direct read and then observed as deleted. Returns the number of keys
    /// queued.
    #[instrument(skip(self))]
    pub async fn resync(&self) -> Result<usize> {
        let filter = ListFilter::default().with_status(ClusterStatus::Active.as_str());
        let clusters = list_all::<Cluster, _>(self.storage.clusters(), &filter).await?;

        let mut queued = 0;
        for cluster in clusters {
            let namespace = cluster.namespace.as_str();
            let mut listed = HashSet::new();

            for deployment in self.platform.list_deployments(namespace).await? {
                if let Some(name) = deployment.metadata.name.clone() {
                    listed.insert(ObjectKey::deployment(namespace, name));
                }
                queued += self
                    .observe(ObservedEvent::Deployment(WatchEvent::Applied(deployment)))
                    .is_some() as usize;
            }
            for pod in self.platform.list_pods(namespace).await? {
                if let Some(name) = pod.metadata.name.clone() {
                    listed.insert(ObjectKey::pod(namespace, name));
                }
                queued += self
                    .observe(ObservedEvent::Pod(WatchEvent::Applied(pod)))
                    .is_some() as usize;
            }

            let missing: Vec<(ObjectKey, ObservedObject)> = self
                .cache
                .iter()
                .filter(|entry| {
                    let key = entry.key();
                    key.namespace == namespace && !entry.deleted && !listed.contains(key)
                })
                .map(|entry| (entry.key().clone(), entry.object.clone()))
                .collect();

            for (key, object) in missing {
                let event = match (key.kind, object) {
                    (ObjectKind::Deployment, ObservedObject::Deployment(last)) => {
                        if self.platform.get_deployment(namespace, &key.name).await?.is_some() {
                            continue;
                        }
                        ObservedEvent::Deployment(WatchEvent::Deleted(last))
                    }
                    (ObjectKind::Pod, ObservedObject::Pod(last)) => {
                        if self.platform.get_pod(namespace, &key.name).await?.is_some() {
                            continue;
                        }
                        ObservedEvent::Pod(WatchEvent::Deleted(last))
                    }
                    _ => continue,
                };
                info!(key = %key, "Resync found a delete the watch missed");
                queued += self.observe(event).is_some() as usize;
            }
        }

        Ok(queued)
    }

    /// Record an event in the cache and queue its key
    ///
    /// Returns the key if it was queued. Unmanaged objects and updates that
    /// change nothing the reverse path reads are dropped here.
    pub fn observe(&self, event: ObservedEvent) -> Option<ObjectKey> {
        self.metrics.events.increment(1);

        let (object, deleted) = match event {
            ObservedEvent::Deployment(WatchEvent::Applied(d)) => (ObservedObject::Deployment(d), false),
            ObservedEvent::Deployment(WatchEvent::Deleted(d)) => (ObservedObject::Deployment(d), true),
            ObservedEvent::Pod(WatchEvent::Applied(p)) => (ObservedObject::Pod(p), false),
            ObservedEvent::Pod(WatchEvent::Deleted(p)) => (ObservedObject::Pod(p), true),
        };

        let meta = object.meta();
        let (Some(namespace), Some(name)) = (meta.namespace.clone(), meta.name.clone()) else {
            self.metrics.events_skipped.increment(1);
            return None;
        };
        if !naming::has_managed_prefix(&name) && !naming::has_managed_label(meta.labels.as_ref()) {
            self.metrics.events_skipped.increment(1);
            return None;
        }

        let key = match &object {
            ObservedObject::Deployment(_) => ObjectKey::deployment(namespace, name),
            ObservedObject::Pod(_) => ObjectKey::pod(namespace, name),
        };

        if !deleted {
            if let Some(cached) = self.cache.get(&key) {
                let changed = cached.deleted
                    || match (&cached.object, &object) {
                        (ObservedObject::Deployment(old), ObservedObject::Deployment(new)) => {
                            deployment_changed(old, new)
                        }
                        (ObservedObject::Pod(old), ObservedObject::Pod(new)) => pod_changed(old, new),
                        _ => true,
                    };
                if !changed {
                    debug!(key = %key, "Skipping insignificant update");
                    self.metrics.events_skipped.increment(1);
                    return None;
                }
            }
        }

        self.cache.insert(
            key.clone(),
            CachedObject {
                object,
                deleted,
                observed_at: Utc::now(),
            },
        );
        self.queue.add(key.clone());
        Some(key)
    }

    async fn process(&self, key: ObjectKey) {
        let started = Instant::now();
        self.metrics.reconciliations.increment(1);
        let seen = self.cache.get(&key).map(|c| c.observed_at);

        match self.reconcile_key(&key).await {
            Ok(outcome) => {
                debug!(key = %key, ?outcome, "Reconciled");
                self.queue.forget(&key);
            }
            Err(e) if e.is_retryable() => {
                self.metrics.errors.increment(1);
                let attempt = self.queue.record_requeue(&key);
                if attempt <= self.config.max_retries {
                    let delay = calculate_backoff(
                        attempt - 1,
                        self.config.retry_initial(),
                        self.config.retry_max(),
                        self.config.retry_multiplier,
                    );
                    warn!(
                        key = %key,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Reconcile failed, will retry"
                    );
                    self.metrics.retries.increment(1);
                    self.queue.add_after(key.clone(), delay);
                } else {
                    error!(key = %key, attempts = attempt, error = %e, "Dropping key after repeated failures");
                    self.metrics.dropped.increment(1);
                    self.queue.forget(&key);
                    self.release_tombstone(&key, seen);
                }
            }
            Err(e) => {
                self.metrics.errors.increment(1);
                error!(key = %key, error = %e, "Reconcile failed permanently");
                self.queue.forget(&key);
                self.release_tombstone(&key, seen);
            }
        }

        self.queue.done(&key);
        self.metrics
            .duration
            .record(started.elapsed().as_secs_f64());
    }

    /// Reconcile one key from the observation cache
    #[instrument(skip(self), fields(key = %key))]
    pub async fn reconcile_key(&self, key: &ObjectKey) -> Result<ReconcileOutcome> {
        let Some(cached) = self.cache.get(key).map(|c| c.clone()) else {
            return Ok(ReconcileOutcome::NoOp);
        };

        let outcome = self.reconcile_cached(key, &cached).await?;

        // Tombstones are only needed until the delete is reconciled
        if cached.deleted {
            self.release_tombstone(key, Some(cached.observed_at));
        }

        Ok(outcome)
    }

    /// Drop a tombstone unless a newer event replaced it
    fn release_tombstone(&self, key: &ObjectKey, observed_at: Option<DateTime<Utc>>) {
        let Some(observed_at) = observed_at else {
            return;
        };
        self.cache
            .remove_if(key, |_, current| current.deleted && current.observed_at == observed_at);
    }

    async fn reconcile_cached(&self, key: &ObjectKey, cached: &CachedObject) -> Result<ReconcileOutcome> {
        let Some(cluster) = naming::extract_cluster_info(&key.namespace) else {
            return Ok(self.skip(key, "namespace does not name a cluster"));
        };
        if cluster.region != self.region {
            return Ok(self.skip(key, "namespace belongs to another region"));
        }

        let outcome = match &cached.object {
            ObservedObject::Deployment(deployment) => {
                if let Some(service_name) = naming::extract_service_name(&key.name) {
                    self.reconcile_service(&cluster, service_name, deployment, cached)
                        .await?
                } else if let Some((service_name, task_set_id)) =
                    naming::extract_task_set_object_name(&key.name)
                {
                    self.reconcile_task_set(&cluster, &service_name, &task_set_id, deployment, cached)
                        .await?
                } else {
                    self.skip(key, "deployment name has no managed prefix")
                }
            }
            ObservedObject::Pod(pod) => self.reconcile_task(&cluster, pod, cached).await?,
        };
        Ok(outcome)
    }

    fn skip(&self, key: &ObjectKey, reason: &str) -> ReconcileOutcome {
        warn!(key = %key, reason, "Skipping object that does not map to an ECS resource");
        self.metrics.events_skipped.increment(1);
        ReconcileOutcome::Skipped(reason.to_string())
    }

    async fn reconcile_service(
        &self,
        cluster: &ClusterInfo,
        service_name: &str,
        deployment: &Deployment,
        cached: &CachedObject,
    ) -> Result<ReconcileOutcome> {
        let service_arn = self.arns.service(&cluster.cluster_name, service_name);
        let Some(existing) =
            get_optional(self.storage.services(), &RecordKey::arn(&service_arn)).await?
        else {
            debug!(service_arn = %service_arn, "No service record for deployment");
            return Ok(ReconcileOutcome::NoOp);
        };

        let observed = (!cached.deleted).then_some(deployment);
        let next = observed_service(&existing, observed, cached.observed_at);
        self.batch.enqueue(RecordUpdate::Service(next));
        Ok(ReconcileOutcome::Enqueued(UpdateKind::Service))
    }

    async fn reconcile_task_set(
        &self,
        cluster: &ClusterInfo,
        service_name: &str,
        task_set_id: &str,
        deployment: &Deployment,
        cached: &CachedObject,
    ) -> Result<ReconcileOutcome> {
        let task_set_arn = self
            .arns
            .task_set(&cluster.cluster_name, service_name, task_set_id);
        let Some(existing) =
            get_optional(self.storage.task_sets(), &RecordKey::arn(&task_set_arn)).await?
        else {
            debug!(task_set_arn = %task_set_arn, "No task set record for deployment");
            return Ok(ReconcileOutcome::NoOp);
        };

        let observed = (!cached.deleted).then_some(deployment);
        let next = observed_task_set(&existing, observed, cached.observed_at);
        self.batch.enqueue(RecordUpdate::TaskSet(next));
        Ok(ReconcileOutcome::Enqueued(UpdateKind::TaskSet))
    }

    async fn reconcile_task(
        &self,
        cluster: &ClusterInfo,
        pod: &Pod,
        cached: &CachedObject,
    ) -> Result<ReconcileOutcome> {
        let identity = task_identity(pod, &cluster.cluster_name, &self.arns);
        let mut existing =
            get_optional(self.storage.tasks(), &RecordKey::arn(&identity.task_arn)).await?;

        if existing.is_none() && cached.deleted && !identity.labelled {
            existing = self.find_task_by_pod(&identity.cluster_arn, pod).await?;
        }

        let base = match existing {
            Some(task) => task,
            // Nothing to stop for a pod that was never recorded
            None if cached.deleted => return Ok(ReconcileOutcome::NoOp),
            None => new_task(&identity, pod, &self.arns, cached.observed_at),
        };

        let next = observed_task(&base, pod, cached.deleted, cached.observed_at);
        self.batch.enqueue(RecordUpdate::Task(next));
        Ok(ReconcileOutcome::Enqueued(UpdateKind::Task))
    }

    async fn find_task_by_pod(&self, cluster_arn: &str, pod: &Pod) -> Result<Option<Task>> {
        let Some(pod_name) = pod.metadata.name.as_deref() else {
            return Ok(None);
        };
        let filter = ListFilter::cluster(cluster_arn).with_pod_name(pod_name);
        let tasks = list_all::<Task, _>(self.storage.tasks(), &filter).await?;
        Ok(tasks.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BatchConfig;
    use crate::naming::managed_labels;
    use crate::platform::{MemoryPlatform, OrchestrationClient};
    use crate::storage::{MemoryStorage, RecordStore};
    use std::time::Duration;
    use k8s_openapi::api::apps::v1::{DeploymentSpec, DeploymentStatus};

    struct Fixture {
        storage: Arc<MemoryStorage>,
        platform: Arc<MemoryPlatform>,
        batch: Arc<BatchUpdater>,
        controller: Arc<SyncController>,
    }

    fn fixture(config: ControlPlaneConfig) -> Fixture {
        let storage = Arc::new(MemoryStorage::new());
        let platform = Arc::new(MemoryPlatform::new());
        let batch = Arc::new(BatchUpdater::new(storage.clone(), config.batch.clone()));
        let controller = Arc::new(SyncController::new(
            &config,
            storage.clone(),
            platform.clone(),
            batch.clone(),
        ));
        Fixture {
            storage,
            platform,
            batch,
            controller,
        }
    }

    fn controller() -> (Arc<MemoryStorage>, Arc<BatchUpdater>, SyncController) {
        let config = ControlPlaneConfig::default();
        let storage = Arc::new(MemoryStorage::new());
        let platform = Arc::new(MemoryPlatform::new());
        let batch = Arc::new(BatchUpdater::new(storage.clone(), config.batch.clone()));
        let controller = SyncController::new(&config, storage.clone(), platform, batch.clone());
        (storage, batch, controller)
    }

    fn task_pod(name: &str) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("demo-us-east-1".to_string()),
                labels: Some(managed_labels("demo")),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    async fn demo_cluster(fixture: &Fixture) {
        let arns = ArnBuilder::from_config(&ControlPlaneConfig::default());
        let now = Utc::now();
        fixture
            .storage
            .clusters
            .create(Cluster {
                cluster_arn: arns.cluster("demo"),
                cluster_name: "demo".to_string(),
                status: ClusterStatus::Active,
                region: "us-east-1".to_string(),
                account_id: "000000000000".to_string(),
                namespace: "demo-us-east-1".to_string(),
                settings: Vec::new(),
                tags: Vec::new(),
                created_at: now,
                updated_at: now,
                version: 0,
            })
            .await
            .unwrap();
        fixture
            .platform
            .ensure_namespace("demo-us-east-1", Default::default())
            .await
            .unwrap();
    }

    fn deployment(name: &str, namespace: &str, ready: i32) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(managed_labels("demo")),
                generation: Some(1),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(2),
                ..Default::default()
            }),
            status: Some(DeploymentStatus {
                observed_generation: Some(1),
                replicas: Some(2),
                ready_replicas: Some(ready),
                updated_replicas: Some(2),
                ..Default::default()
            }),
        }
    }

    #[test]
    fn test_observe_filters_unmanaged() {
        let (_, _, controller) = controller();
        let mut d = deployment("nginx", "default", 1);
        d.metadata.labels = None;
        assert!(controller
            .observe(ObservedEvent::Deployment(WatchEvent::Applied(d)))
            .is_none());
    }

    #[test]
    fn test_observe_skips_insignificant_updates() {
        let (_, _, controller) = controller();
        let d = deployment("ecs-service-web", "demo-us-east-1", 1);
        let key = controller
            .observe(ObservedEvent::Deployment(WatchEvent::Applied(d.clone())))
            .unwrap();
        assert_eq!(key, ObjectKey::deployment("demo-us-east-1", "ecs-service-web"));

        // Only the resourceVersion moved
        let mut same = d.clone();
        same.metadata.resource_version = Some("42".to_string());
        assert!(controller
            .observe(ObservedEvent::Deployment(WatchEvent::Applied(same)))
            .is_none());

        let changed = deployment("ecs-service-web", "demo-us-east-1", 2);
        assert!(controller
            .observe(ObservedEvent::Deployment(WatchEvent::Applied(changed)))
            .is_some());
        assert_eq!(controller.queue().len(), 1);
    }

    #[tokio::test]
    async fn test_unresolvable_namespace_is_skipped() {
        let (_, batch, controller) = controller();
        let d = deployment("ecs-service-web", "default", 1);
        let key = controller
            .observe(ObservedEvent::Deployment(WatchEvent::Applied(d)))
            .unwrap();
        let outcome = controller.reconcile_key(&key).await.unwrap();
        assert!(matches!(outcome, ReconcileOutcome::Skipped(_)));
        assert_eq!(batch.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_malformed_task_set_name_is_skipped() {
        let (_, _, controller) = controller();
        let d = deployment("ecs-taskset-web-notdigits", "demo-us-east-1", 1);
        let key = controller
            .observe(ObservedEvent::Deployment(WatchEvent::Applied(d)))
            .unwrap();
        assert!(matches!(
            controller.reconcile_key(&key).await.unwrap(),
            ReconcileOutcome::Skipped(_)
        ));
    }

    #[tokio::test]
    async fn test_missing_service_record_is_noop() {
        let (_, batch, controller) = controller();
        let d = deployment("ecs-service-web", "demo-us-east-1", 1);
        let key = controller
            .observe(ObservedEvent::Deployment(WatchEvent::Applied(d)))
            .unwrap();
        assert_eq!(
            controller.reconcile_key(&key).await.unwrap(),
            ReconcileOutcome::NoOp
        );
        assert_eq!(batch.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_tombstone_removed_after_reconcile() {
        let (_, _, controller) = controller();
        let d = deployment("ecs-service-web", "demo-us-east-1", 1);
        let key = controller
            .observe(ObservedEvent::Deployment(WatchEvent::Deleted(d)))
            .unwrap();
        controller.reconcile_key(&key).await.unwrap();
        assert!(controller.cache.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_deleted_object_in_foreign_namespace_releases_tombstone() {
        let (_, _, controller) = controller();
        let d = deployment("ecs-service-web", "default", 1);
        let key = controller
            .observe(ObservedEvent::Deployment(WatchEvent::Deleted(d)))
            .unwrap();
        assert!(matches!(
            controller.reconcile_key(&key).await.unwrap(),
            ReconcileOutcome::Skipped(_)
        ));
        assert!(controller.cache.get(&key).is_none());
    }

    #[tokio::test]
    async fn test_dropped_delete_releases_tombstone() {
        let config = ControlPlaneConfig::default()
            .with_sync(SyncConfig::default().with_max_retries(0));
        let f = fixture(config);
        let pod = task_pod("ecs-task-abc");
        let key = f
            .controller
            .observe(ObservedEvent::Pod(WatchEvent::Deleted(pod.clone())))
            .unwrap();
        let identity = task_identity(&pod, "demo", &f.controller.arns);
        f.storage.tasks.fail_reads_for(identity.task_arn, 1);

        let key = {
            let queued = f.controller.queue.get().await.unwrap();
            assert_eq!(queued, key);
            queued
        };
        f.controller.process(key.clone()).await;

        assert!(f.controller.cache.get(&key).is_none());
        assert!(f.controller.queue.is_empty());
        assert_eq!(f.batch.pending_len(), 0);
    }

    #[tokio::test]
    async fn test_stop_flushes_updates_enqueued_after_batch_cancel() {
        let config = ControlPlaneConfig::default().with_batch(BatchConfig {
            max_delay_ms: 3_600_000,
            ..BatchConfig::default()
        });
        let f = fixture(config);

        // The batch updater is already stopped; nothing flushes on its own
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(f.controller.clone().run(cancel.clone()));
        f.platform.insert_pod(task_pod("ecs-task-abc")).unwrap();

        for _ in 0..200 {
            if f.batch.pending_len() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(f.batch.pending_len(), 1);
        assert_eq!(f.storage.tasks.write_count(), 0);

        cancel.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(f.batch.pending_len(), 0);
        assert_eq!(f.storage.tasks.len(), 1);
    }

    #[tokio::test]
    async fn test_resync_finds_missed_objects_and_deletes() {
        let f = fixture(ControlPlaneConfig::default());
        demo_cluster(&f).await;

        // Seen once, then removed without a delete event reaching us
        let gone = task_pod("ecs-task-gone");
        let gone_key = f
            .controller
            .observe(ObservedEvent::Pod(WatchEvent::Applied(gone)))
            .unwrap();

        // Present on the platform but never observed
        f.platform
            .apply_deployment(&deployment("ecs-service-web", "demo-us-east-1", 1))
            .await
            .unwrap();

        assert_eq!(f.controller.resync().await.unwrap(), 2);
        assert!(f
            .controller
            .cache
            .get(&ObjectKey::deployment("demo-us-east-1", "ecs-service-web"))
            .is_some());
        assert!(f.controller.cache.get(&gone_key).is_some_and(|c| c.deleted));

        // Nothing changed since
        assert_eq!(f.controller.resync().await.unwrap(), 0);
    }
}
