//! Task handlers

use super::{
    log_warnings, record_key, validate_request, ArnPage, Described, Failure, Orchestrator,
    PageRequest,
};
use crate::arn::ResourceKind;
use crate::error::{ControlPlaneError, Result};
use crate::naming;
use crate::resources::ResourceBuilder;
use crate::storage::{get_optional, modify, ListFilter, RecordKey};
use crate::types::{
    Cluster, ContainerOverride, ContainerState, HealthStatus, LaunchType, Task, TaskDefinition,
    TaskStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{error, info, instrument};
use uuid::Uuid;
use validator::Validate;

/// Reason recorded when StopTask is called without one
pub const DEFAULT_STOP_REASON: &str = "Task stopped by user";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RunTaskRequest {
    pub cluster: Option<String>,
    pub task_definition: String,
    #[validate(range(min = 1, max = 10, message = "count must be between 1 and 10"))]
    pub count: u32,
    #[serde(default)]
    pub launch_type: LaunchType,
    #[validate(length(max = 128, message = "startedBy must be at most 128 characters"))]
    pub started_by: Option<String>,
    #[validate(length(max = 255, message = "group must be at most 255 characters"))]
    pub group: Option<String>,
    #[serde(default)]
    pub overrides: Vec<ContainerOverride>,
}

impl RunTaskRequest {
    pub fn new(cluster: impl Into<String>, task_definition: impl Into<String>, count: u32) -> Self {
        Self {
            cluster: Some(cluster.into()),
            task_definition: task_definition.into(),
            count,
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct StopTaskRequest {
    pub cluster: Option<String>,
    pub task: String,
    #[validate(length(max = 255, message = "reason must be at most 255 characters"))]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListTasksRequest {
    pub cluster: Option<String>,
    pub service_name: Option<String>,
    pub started_by: Option<String>,
    /// Matches the task's last status
    pub status: Option<TaskStatus>,
    #[serde(flatten)]
    pub page: PageRequest,
}

fn check_overrides(td: &TaskDefinition, overrides: &[ContainerOverride]) -> Result<()> {
    for ov in overrides {
        if !td.container_definitions.iter().any(|c| c.name == ov.name) {
            return Err(ControlPlaneError::InvalidParameter(format!(
                "override names unknown container '{}'",
                ov.name
            )));
        }
    }
    Ok(())
}

impl Orchestrator {
    async fn find_task(&self, cluster: &Cluster, task: &str) -> Result<Task> {
        let key = record_key(task, ResourceKind::Task, &cluster.cluster_arn)?;
        get_optional::<Task, _>(self.storage.tasks(), &key)
            .await?
            .filter(|t| t.cluster_arn == cluster.cluster_arn)
            .ok_or_else(|| ControlPlaneError::TaskNotFound(task.to_string()))
    }

    fn new_task_record(
        &self,
        cluster: &Cluster,
        td: &TaskDefinition,
        request: &RunTaskRequest,
    ) -> Task {
        let task_id = Uuid::new_v4().simple().to_string();
        let now = Utc::now();
        Task {
            task_arn: self.arns.task(&cluster.cluster_name, &task_id),
            pod_name: naming::derive_task_pod_name(&task_id),
            task_id,
            cluster_arn: cluster.cluster_arn.clone(),
            task_definition_arn: td.task_definition_arn.clone(),
            service_arn: None,
            task_set_arn: None,
            started_by: request.started_by.clone(),
            group: Some(
                request
                    .group
                    .clone()
                    .unwrap_or_else(|| format!("family:{}", td.family)),
            ),
            launch_type: request.launch_type,
            last_status: TaskStatus::Provisioning,
            desired_status: TaskStatus::Running,
            health_status: HealthStatus::Unknown,
            cpu: td.cpu.clone(),
            memory: td.memory.clone(),
            containers: td
                .container_definitions
                .iter()
                .map(|c| ContainerState {
                    name: c.name.clone(),
                    image: Some(c.image.clone()),
                    last_status: TaskStatus::Provisioning,
                    exit_code: None,
                    reason: None,
                    health_status: HealthStatus::Unknown,
                    runtime_id: None,
                })
                .collect(),
            overrides: request.overrides.clone(),
            attachment: None,
            namespace: cluster.namespace.clone(),
            created_at: now,
            started_at: None,
            stopping_at: None,
            stopped_at: None,
            stopped_reason: None,
            updated_at: now,
            version: 0,
        }
    }

    /// Start `count` ad-hoc tasks, one pod each
    ///
    /// Each record is written before its pod is applied. If the pod cannot
    /// be created the record is removed again and the error returned; tasks
    /// started before the failure keep running.
    #[instrument(skip(self, request), fields(task_definition = %request.task_definition, count = request.count))]
    pub async fn run_task(&self, request: RunTaskRequest) -> Result<Vec<Task>> {
        validate_request(&request)?;
        let cluster = self.active_cluster(request.cluster.as_deref()).await?;
        let td = self.active_task_definition(&request.task_definition).await?;
        check_overrides(&td, &request.overrides)?;
        let builder = ResourceBuilder::new(&td, &cluster.cluster_name, &cluster.namespace)?;

        let mut tasks = Vec::with_capacity(request.count as usize);
        for _ in 0..request.count {
            let task = self
                .storage
                .tasks()
                .create(self.new_task_record(&cluster, &td, &request))
                .await?;

            let (pod, warnings) = builder.build_task_pod(&task);
            log_warnings(&task.pod_name, &warnings);

            if let Err(e) = self.platform.apply_pod(&pod).await {
                error!(task_arn = %task.task_arn, error = %e, "Failed to create task pod");
                self.storage
                    .tasks()
                    .delete(&RecordKey::arn(&task.task_arn))
                    .await?;
                return Err(e.into());
            }

            info!(task_arn = %task.task_arn, pod = %task.pod_name, "Task started");
            tasks.push(task);
        }
        Ok(tasks)
    }

    /// Request a task to stop and delete its pod
    ///
    /// Only the desired status and reason are written here. The last status
    /// moves to STOPPED once the reverse path observes the pod delete.
    #[instrument(skip(self, request), fields(task = %request.task))]
    pub async fn stop_task(&self, request: StopTaskRequest) -> Result<Task> {
        validate_request(&request)?;
        let cluster = self.active_cluster(request.cluster.as_deref()).await?;
        let current = self.find_task(&cluster, &request.task).await?;
        if current.last_status.is_stopped() {
            return Ok(current);
        }

        let reason = request
            .reason
            .clone()
            .unwrap_or_else(|| DEFAULT_STOP_REASON.to_string());
        let now = Utc::now();
        let task = modify(
            self.storage.tasks(),
            &RecordKey::arn(&current.task_arn),
            |t: &mut Task| {
                t.desired_status = TaskStatus::Stopped;
                if t.stopped_reason.is_none() {
                    t.stopped_reason = Some(reason.clone());
                }
                t.updated_at = now;
            },
        )
        .await?;

        self.platform
            .delete_pod(&task.namespace, &task.pod_name)
            .await?;

        info!(task_arn = %task.task_arn, "Task stop requested");
        Ok(task)
    }

    pub async fn describe_tasks(&self, cluster: Option<&str>, tasks: &[String]) -> Result<Described<Task>> {
        let cluster = self.active_cluster(cluster).await?;
        let mut described = Described::default();
        for identifier in tasks {
            match self.find_task(&cluster, identifier).await {
                Ok(task) => described.items.push(task),
                Err(ControlPlaneError::TaskNotFound(_)) => {
                    let arn = if identifier.starts_with("arn:") {
                        identifier.clone()
                    } else {
                        self.arns.task(&cluster.cluster_name, identifier)
                    };
                    described.failures.push(Failure::missing(arn));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(described)
    }

    pub async fn list_tasks(&self, request: &ListTasksRequest) -> Result<ArnPage> {
        let cluster = self.active_cluster(request.cluster.as_deref()).await?;
        let mut filter = ListFilter::cluster(&cluster.cluster_arn);
        if let Some(service) = &request.service_name {
            filter = filter.with_service(self.find_service(&cluster, service).await?.service_arn);
        }
        if let Some(started_by) = &request.started_by {
            filter = filter.with_started_by(started_by);
        }
        if let Some(status) = request.status {
            filter = filter.with_status(status.as_str());
        }
        self.list_arns(self.storage.tasks(), &filter, &request.page)
            .await
    }
}
