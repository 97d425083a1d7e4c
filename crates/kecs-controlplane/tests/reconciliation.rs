//! End-to-end tests: orchestrator → platform → sync controller → storage
//!
//! Every test runs the forward path against an in-memory platform and checks
//! what the reverse path writes back.
//!
//! Run with: cargo test -p kecs-controlplane --test reconciliation -- --nocapture

use anyhow::{bail, Result};
use kecs_controlplane::orchestrator::DEFAULT_STOP_REASON;
use kecs_controlplane::prelude::*;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

/// A control plane wired to in-memory storage and platform
struct ControlPlane {
    orchestrator: Orchestrator,
    storage: Arc<MemoryStorage>,
    platform: Arc<MemoryPlatform>,
    sync: Arc<SyncController>,
    batch: Arc<BatchUpdater>,
    sync_cancel: CancellationToken,
    batch_cancel: CancellationToken,
    sync_handle: Option<JoinHandle<()>>,
    batch_handle: Option<JoinHandle<()>>,
}

impl ControlPlane {
    fn new() -> Self {
        let config = ControlPlaneConfig::default().with_batch(
            BatchConfig::default().with_max_delay(Duration::from_millis(10)),
        );
        let storage = Arc::new(MemoryStorage::new());
        let platform = Arc::new(MemoryPlatform::new());
        let batch = Arc::new(BatchUpdater::new(storage.clone(), config.batch.clone()));
        let sync = Arc::new(SyncController::new(
            &config,
            storage.clone(),
            platform.clone(),
            batch.clone(),
        ));
        let orchestrator = Orchestrator::new(config, storage.clone(), platform.clone(), batch.clone());

        Self {
            orchestrator,
            storage,
            platform,
            sync,
            batch,
            sync_cancel: CancellationToken::new(),
            batch_cancel: CancellationToken::new(),
            sync_handle: None,
            batch_handle: None,
        }
    }

    /// Start the reverse path in the background
    async fn start() -> Self {
        let mut plane = Self::new();

        let batch = plane.batch.clone();
        let cancel = plane.batch_cancel.clone();
        plane.batch_handle = Some(tokio::spawn(batch.run(cancel)));

        let sync = plane.sync.clone();
        let cancel = plane.sync_cancel.clone();
        plane.sync_handle = Some(tokio::spawn(async move {
            sync.run(cancel).await.expect("sync controller failed");
        }));

        // Let the watchers subscribe
        sleep(Duration::from_millis(50)).await;
        plane
    }

    /// Stop the sync controller first so its last updates reach storage
    async fn stop(self) {
        self.sync_cancel.cancel();
        if let Some(handle) = self.sync_handle {
            handle.await.expect("sync controller panicked");
        }
        self.batch_cancel.cancel();
        if let Some(handle) = self.batch_handle {
            handle.await.expect("batch updater panicked");
        }
    }

    async fn bootstrap(&self, service_count: u32) -> Result<(TaskDefinition, Service)> {
        self.orchestrator
            .create_cluster(CreateClusterRequest::named("demo"))
            .await?;
        let td = self
            .orchestrator
            .register_task_definition(nginx("web"))
            .await?;
        let service = self
            .orchestrator
            .create_service(CreateServiceRequest::new(
                "demo",
                "web",
                "web",
                service_count,
            ))
            .await?;
        Ok((td, service))
    }

    async fn service(&self, name: &str) -> Service {
        self.orchestrator
            .describe_services(Some("demo"), &[name.to_string()])
            .await
            .expect("describe services")
            .items
            .pop()
            .expect("service exists")
    }

    async fn task(&self, task_arn: &str) -> Task {
        self.orchestrator
            .describe_tasks(Some("demo"), &[task_arn.to_string()])
            .await
            .expect("describe tasks")
            .items
            .pop()
            .expect("task exists")
    }

    async fn task_set(&self, service: &str, id: &str) -> TaskSet {
        self.orchestrator
            .describe_task_sets(Some("demo"), service, &[id.to_string()])
            .await
            .expect("describe task sets")
            .items
            .pop()
            .expect("task set exists")
    }
}

fn nginx(family: &str) -> RegisterTaskDefinitionRequest {
    RegisterTaskDefinitionRequest {
        family: family.to_string(),
        container_definitions: vec![ContainerDefinition {
            name: "web".to_string(),
            image: "nginx:1.27".to_string(),
            memory: Some(256),
            port_mappings: vec![PortMapping {
                container_port: 80,
                ..Default::default()
            }],
            ..Default::default()
        }],
        cpu: Some("256".to_string()),
        memory: Some("512".to_string()),
        ..Default::default()
    }
}

/// Poll until `check` holds or five seconds pass
async fn wait_for<F, Fut>(what: &str, mut check: F) -> Result<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check().await {
            return Ok(());
        }
        sleep(Duration::from_millis(20)).await;
    }
    bail!("Timeout waiting for {}", what)
}

#[tokio::test]
async fn test_service_lifecycle_and_cluster_deletion() -> Result<()> {
    let cp = ControlPlane::start().await;
    let plane = &cp;
    let (_, service) = plane.bootstrap(2).await?;
    assert_eq!(service.status, ServiceStatus::Provisioning);
    assert!(plane
        .platform
        .deployment(&service.namespace, &service.object_name)
        .is_some());

    plane
        .platform
        .set_deployment_ready(&service.namespace, &service.object_name, 2)?;
    wait_for("service to become ACTIVE", move || async move {
        let s = plane.service("web").await;
        s.running_count == 2 && s.status == ServiceStatus::Active
    })
    .await?;

    match plane.orchestrator.delete_cluster("demo").await {
        Err(ControlPlaneError::ClusterContainsServices { service, .. }) => {
            assert_eq!(service, "web")
        }
        other => panic!("expected ClusterContainsServices, got {:?}", other),
    }

    let request = DeleteServiceRequest {
        cluster: Some("demo".to_string()),
        service: "web".to_string(),
        force: false,
    };
    assert!(matches!(
        plane.orchestrator.delete_service(request.clone()).await,
        Err(ControlPlaneError::InvalidParameter(_))
    ));

    let deleted = plane
        .orchestrator
        .delete_service(DeleteServiceRequest {
            force: true,
            ..request
        })
        .await?;
    assert_eq!(deleted.status, ServiceStatus::Draining);
    assert_eq!(deleted.desired_count, 0);

    wait_for("service to become INACTIVE", move || async move {
        let s = plane.service("web").await;
        s.status == ServiceStatus::Inactive && s.running_count == 0
    })
    .await?;

    let cluster = plane.orchestrator.delete_cluster("demo").await?;
    assert_eq!(cluster.status, ClusterStatus::Inactive);
    assert!(!plane.platform.namespace_exists(&cluster.namespace));

    cp.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_task_follows_its_pod() -> Result<()> {
    let cp = ControlPlane::start().await;
    let plane = &cp;
    plane
        .orchestrator
        .create_cluster(CreateClusterRequest::named("demo"))
        .await?;
    plane
        .orchestrator
        .register_task_definition(nginx("batch"))
        .await?;

    let task = plane
        .orchestrator
        .run_task(RunTaskRequest::new("demo", "batch", 1))
        .await?
        .pop()
        .expect("one task");
    assert_eq!(task.last_status, TaskStatus::Provisioning);
    assert_eq!(task.group.as_deref(), Some("family:batch"));

    plane
        .platform
        .run_pod(&task.namespace, &task.pod_name, "10.0.0.7")?;
    let task_arn = task.task_arn.as_str();
    wait_for("task to be RUNNING", move || async move {
        let t = plane.task(task_arn).await;
        t.last_status == TaskStatus::Running && t.started_at.is_some()
    })
    .await?;

    match plane.orchestrator.delete_cluster("demo").await {
        Err(ControlPlaneError::ClusterContainsTasks { task: id, .. }) => {
            assert_eq!(id, task.task_id)
        }
        other => panic!("expected ClusterContainsTasks, got {:?}", other),
    }

    let stopping = plane
        .orchestrator
        .stop_task(StopTaskRequest {
            cluster: Some("demo".to_string()),
            task: task.task_arn.clone(),
            reason: None,
        })
        .await?;
    // The forward path only records intent
    assert_eq!(stopping.desired_status, TaskStatus::Stopped);
    assert_eq!(stopping.last_status, TaskStatus::Running);
    assert!(plane.platform.pod(&task.namespace, &task.pod_name).is_none());

    wait_for("task to be STOPPED", move || async move {
        plane.task(task_arn).await.last_status == TaskStatus::Stopped
    })
    .await?;
    let stopped = plane.task(task_arn).await;
    assert_eq!(stopped.stopped_reason.as_deref(), Some(DEFAULT_STOP_REASON));
    assert!(stopped.stopped_at.is_some());

    let listed = plane
        .orchestrator
        .list_tasks(&ListTasksRequest {
            cluster: Some("demo".to_string()),
            status: Some(TaskStatus::Stopped),
            ..Default::default()
        })
        .await?;
    assert_eq!(listed.arns, vec![task.task_arn.clone()]);

    plane.orchestrator.delete_cluster("demo").await?;
    cp.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_pod_without_record_is_adopted() -> Result<()> {
    let cp = ControlPlane::start().await;
    let plane = &cp;
    let (_, service) = plane.bootstrap(1).await?;

    // A pod the Deployment controller would create for the service
    let deployment = plane
        .platform
        .deployment(&service.namespace, &service.object_name)
        .expect("service deployment");
    let template = deployment
        .spec
        .and_then(|s| s.template.metadata)
        .unwrap_or_default();
    let pod = k8s_openapi::api::core::v1::Pod {
        metadata: k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta {
            name: Some("ecs-service-web-7d9f8-abcde".to_string()),
            namespace: Some(service.namespace.clone()),
            labels: template.labels,
            annotations: template.annotations,
            uid: Some("0b5a6c1e-7f44-4c5e-9d87-3c1f2b9a4d11".to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    plane.platform.insert_pod(pod)?;

    wait_for("adopted task record", move || async move {
        let page = plane
            .orchestrator
            .list_tasks(&ListTasksRequest {
                cluster: Some("demo".to_string()),
                service_name: Some("web".to_string()),
                ..Default::default()
            })
            .await
            .expect("list tasks");
        page.arns.len() == 1
    })
    .await?;

    cp.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_task_sets_split_and_promote() -> Result<()> {
    let cp = ControlPlane::start().await;
    let plane = &cp;
    plane
        .orchestrator
        .create_cluster(CreateClusterRequest::named("demo"))
        .await?;
    plane
        .orchestrator
        .register_task_definition(nginx("web"))
        .await?;
    let service = plane
        .orchestrator
        .create_service(CreateServiceRequest::new("demo", "web", "web", 4).external())
        .await?;
    assert!(plane
        .platform
        .deployment(&service.namespace, &service.object_name)
        .is_none());

    let half = Scale {
        value: 50.0,
        unit: ScaleUnit::Percent,
    };
    let blue = plane
        .orchestrator
        .create_task_set(CreateTaskSetRequest {
            cluster: Some("demo".to_string()),
            service: "web".to_string(),
            task_definition: "web".to_string(),
            external_id: Some("blue".to_string()),
            launch_type: LaunchType::Ec2,
            scale: Some(half),
        })
        .await?;
    assert_eq!(blue.status, TaskSetStatus::Primary);
    assert_eq!(blue.computed_desired_count, 2);

    plane
        .platform
        .converge_deployment(&blue.namespace, &blue.object_name)?;
    let blue_id = blue.id.as_str();
    wait_for("blue task set to stabilize", move || async move {
        let ts = plane.task_set("web", blue_id).await;
        ts.running_count == 2 && ts.stability_status == StabilityStatus::SteadyState
    })
    .await?;

    let green = plane
        .orchestrator
        .create_task_set(CreateTaskSetRequest {
            cluster: Some("demo".to_string()),
            service: "web".to_string(),
            task_definition: "web".to_string(),
            external_id: Some("green".to_string()),
            launch_type: LaunchType::Ec2,
            scale: Some(half),
        })
        .await?;
    assert_eq!(green.status, TaskSetStatus::Active);

    let promoted = plane
        .orchestrator
        .update_service_primary_task_set(Some("demo"), "web", &green.id)
        .await?;
    assert_eq!(promoted.status, TaskSetStatus::Primary);
    assert_eq!(
        plane.task_set("web", blue_id).await.status,
        TaskSetStatus::Active
    );

    let mut request = DeleteTaskSetRequest {
        cluster: Some("demo".to_string()),
        service: "web".to_string(),
        task_set: green.id.clone(),
        force: false,
    };
    assert!(plane
        .orchestrator
        .delete_task_set(request.clone())
        .await
        .is_err());

    request.task_set = blue.id.clone();
    plane.orchestrator.delete_task_set(request).await?;
    wait_for("blue task set to drain", move || async move {
        let ts = plane.task_set("web", blue_id).await;
        ts.status == TaskSetStatus::Draining && ts.running_count == 0
    })
    .await?;
    assert!(plane
        .platform
        .deployment(&blue.namespace, &blue.object_name)
        .is_none());

    cp.stop().await;
    Ok(())
}

#[tokio::test]
async fn test_observed_writes_keep_desired_fields() -> Result<()> {
    // Reverse path driven by hand so the interleaving is fixed
    let cp = ControlPlane::new();
    let plane = &cp;
    let (_, service) = plane.bootstrap(2).await?;

    plane
        .platform
        .set_deployment_ready(&service.namespace, &service.object_name, 2)?;
    let observed = plane
        .platform
        .deployment(&service.namespace, &service.object_name)
        .expect("service deployment");
    let key = plane
        .sync
        .observe(ObservedEvent::Deployment(WatchEvent::Applied(observed)))
        .expect("event queued");
    assert_eq!(
        plane.sync.reconcile_key(&key).await?,
        ReconcileOutcome::Enqueued(UpdateKind::Service)
    );

    // A forward write lands between reconcile and flush
    plane
        .orchestrator
        .update_service(UpdateServiceRequest {
            cluster: Some("demo".to_string()),
            service: "web".to_string(),
            desired_count: Some(5),
            task_definition: None,
        })
        .await?;

    let report = plane.batch.flush().await;
    assert_eq!(report.written, 1);

    let stored = plane.service("web").await;
    assert_eq!(stored.desired_count, 5);
    assert_eq!(stored.running_count, 2);
    assert_eq!(stored.status, ServiceStatus::Active);
    Ok(())
}

#[tokio::test]
async fn test_event_storm_is_coalesced() -> Result<()> {
    let cp = ControlPlane::new();
    let plane = &cp;
    let (_, service) = plane.bootstrap(3).await?;

    for round in 0..30 {
        plane
            .platform
            .set_deployment_ready(&service.namespace, &service.object_name, round % 4)?;
        let observed = plane
            .platform
            .deployment(&service.namespace, &service.object_name)
            .expect("service deployment");
        plane
            .sync
            .observe(ObservedEvent::Deployment(WatchEvent::Applied(observed)));
    }
    plane
        .platform
        .set_deployment_ready(&service.namespace, &service.object_name, 3)?;
    let observed = plane
        .platform
        .deployment(&service.namespace, &service.object_name)
        .expect("service deployment");
    plane
        .sync
        .observe(ObservedEvent::Deployment(WatchEvent::Applied(observed)));

    // One key no matter how many events
    assert_eq!(plane.sync.queue().len(), 1);
    let key = plane.sync.queue().get().await.expect("queued key");
    plane.sync.reconcile_key(&key).await?;
    plane.sync.queue().done(&key);
    assert_eq!(plane.batch.pending_len(), 1);

    let writes = plane.storage.services.write_count();
    let report = plane.batch.flush().await;
    assert_eq!(report.written, 1);
    assert_eq!(plane.storage.services.write_count(), writes + 1);

    let stored = plane.service("web").await;
    assert_eq!(stored.running_count, 3);
    assert_eq!(stored.status, ServiceStatus::Active);

    // Replaying the same state writes nothing
    plane.sync.reconcile_key(&key).await?;
    let report = plane.batch.flush().await;
    assert_eq!(report.written, 0);
    assert_eq!(report.unchanged, 1);
    Ok(())
}

#[tokio::test]
async fn test_update_service_rolls_the_deployment() -> Result<()> {
    let cp = ControlPlane::start().await;
    let plane = &cp;
    let (_, service) = plane.bootstrap(2).await?;
    plane
        .platform
        .converge_deployment(&service.namespace, &service.object_name)?;
    wait_for("service to become ACTIVE", move || async move {
        plane.service("web").await.status == ServiceStatus::Active
    })
    .await?;

    let mut next = nginx("web");
    next.container_definitions[0].image = "nginx:1.28".to_string();
    let revision = plane.orchestrator.register_task_definition(next).await?;
    assert_eq!(revision.revision, 2);

    let updated = plane
        .orchestrator
        .update_service(UpdateServiceRequest {
            cluster: Some("demo".to_string()),
            service: "web".to_string(),
            desired_count: None,
            task_definition: Some("web:2".to_string()),
        })
        .await?;
    assert_eq!(updated.task_definition_arn, revision.task_definition_arn);

    let deployment = plane
        .platform
        .deployment(&service.namespace, &service.object_name)
        .expect("service deployment");
    let image = deployment
        .spec
        .and_then(|s| s.template.spec)
        .and_then(|p| p.containers.into_iter().next())
        .and_then(|c| c.image);
    assert_eq!(image.as_deref(), Some("nginx:1.28"));

    plane
        .platform
        .converge_deployment(&service.namespace, &service.object_name)?;
    wait_for("rollout to settle", move || async move {
        let s = plane.service("web").await;
        s.status == ServiceStatus::Active && s.running_count == 2
    })
    .await?;

    cp.stop().await;
    Ok(())
}
