//! Task set handlers
//!
//! Task sets split an EXTERNAL-controlled service across several
//! Deployments, each running `scale` percent of the service's desired
//! count. At most one task set per service is PRIMARY.

use super::{log_warnings, record_key, validate_request, Described, Failure, Orchestrator};
use crate::arn::ResourceKind;
use crate::batch::RecordUpdate;
use crate::error::{ControlPlaneError, Result};
use crate::naming;
use crate::platform::ApplyOutcome;
use crate::resources::ResourceBuilder;
use crate::storage::{get_optional, list_all, modify, ListFilter, RecordKey};
use crate::sync::observed_task_set;
use crate::types::{
    Cluster, DeploymentControllerType, LaunchType, Scale, Service, ServiceStatus,
    StabilityStatus, TaskSet, TaskSetStatus,
};
use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use validator::{Validate, ValidationError};

fn validate_scale(scale: &Scale) -> std::result::Result<(), ValidationError> {
    if !(0.0..=100.0).contains(&scale.value) {
        return Err(ValidationError::new("invalid_scale")
            .with_message("scale must be between 0 and 100 percent".into()));
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateTaskSetRequest {
    pub cluster: Option<String>,
    pub service: String,
    pub task_definition: String,
    pub external_id: Option<String>,
    #[serde(default)]
    pub launch_type: LaunchType,
    /// Defaults to 100 percent
    #[validate(custom(function = "validate_scale"))]
    pub scale: Option<Scale>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateTaskSetRequest {
    pub cluster: Option<String>,
    pub service: String,
    pub task_set: String,
    #[validate(custom(function = "validate_scale"))]
    pub scale: Scale,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteTaskSetRequest {
    pub cluster: Option<String>,
    pub service: String,
    pub task_set: String,
    /// Delete even the PRIMARY task set
    #[serde(default)]
    pub force: bool,
}

/// `ecs-svc/` followed by 19 digits
fn generate_task_set_id() -> String {
    let mut rng = rand::thread_rng();
    let mut id = String::from(naming::TASK_SET_ID_PREFIX);
    id.push(char::from(b'0' + rng.gen_range(1..=9u8)));
    for _ in 1..naming::TASK_SET_ID_DIGITS {
        id.push(char::from(b'0' + rng.gen_range(0..=9u8)));
    }
    id
}

impl Orchestrator {
    /// Cluster and service for a task set operation
    async fn external_service(&self, cluster: Option<&str>, service: &str) -> Result<(Cluster, Service)> {
        let cluster = self.active_cluster(cluster).await?;
        let service = self.find_service(&cluster, service).await?;
        if service.deployment_controller != DeploymentControllerType::External {
            return Err(ControlPlaneError::InvalidParameter(format!(
                "service {} does not use the EXTERNAL deployment controller",
                service.service_name
            )));
        }
        if matches!(service.status, ServiceStatus::Inactive | ServiceStatus::Draining) {
            return Err(ControlPlaneError::ServiceNotActive(service.service_name));
        }
        Ok((cluster, service))
    }

    async fn find_task_set(&self, service: &Service, task_set: &str) -> Result<TaskSet> {
        let key = record_key(task_set, ResourceKind::TaskSet, &service.service_arn)?;
        get_optional::<TaskSet, _>(self.storage.task_sets(), &key)
            .await?
            .filter(|ts| ts.service_arn == service.service_arn)
            .ok_or_else(|| ControlPlaneError::TaskSetNotFound(task_set.to_string()))
    }

    async fn service_task_sets(&self, service: &Service) -> Result<Vec<TaskSet>> {
        let filter = ListFilter::cluster(&service.cluster_arn).with_service(&service.service_arn);
        Ok(list_all::<TaskSet, _>(self.storage.task_sets(), &filter).await?)
    }

    pub(crate) async fn apply_task_set_deployment(
        &self,
        cluster: &Cluster,
        service: &Service,
        task_set: &TaskSet,
    ) -> Result<ApplyOutcome> {
        let td = self
            .describe_task_definition(&task_set.task_definition_arn)
            .await?;
        let builder = ResourceBuilder::new(&td, &cluster.cluster_name, &cluster.namespace)?;
        let (deployment, warnings) = builder.build_task_set_deployment(service, task_set);
        log_warnings(&task_set.object_name, &warnings);
        let outcome = self.platform.apply_deployment(&deployment).await?;
        debug!(object = %task_set.object_name, ?outcome, "Applied task set deployment");
        Ok(outcome)
    }

    /// Delete a task set's Deployment and mark it DRAINING
    pub(crate) async fn drain_task_set(&self, task_set: &TaskSet) -> Result<TaskSet> {
        let deleted = self
            .platform
            .delete_deployment(&task_set.namespace, &task_set.object_name)
            .await?;

        let now = Utc::now();
        let drained = modify(
            self.storage.task_sets(),
            &RecordKey::arn(&task_set.task_set_arn),
            |ts: &mut TaskSet| {
                ts.status = TaskSetStatus::Draining;
                ts.computed_desired_count = 0;
                ts.updated_at = now;
            },
        )
        .await?;

        if deleted {
            return Ok(drained);
        }
        // No delete will be observed for a Deployment that never existed
        let finished = observed_task_set(&drained, None, now);
        self.batch.enqueue(RecordUpdate::TaskSet(finished.clone()));
        Ok(finished)
    }

    /// Create a task set; the first one of a service becomes PRIMARY
    #[instrument(skip(self, request), fields(service = %request.service))]
    pub async fn create_task_set(&self, request: CreateTaskSetRequest) -> Result<TaskSet> {
        validate_request(&request)?;
        let (cluster, service) = self
            .external_service(request.cluster.as_deref(), &request.service)
            .await?;
        let td = self.active_task_definition(&request.task_definition).await?;

        let has_primary = self
            .service_task_sets(&service)
            .await?
            .iter()
            .any(|ts| ts.status == TaskSetStatus::Primary);

        let id = generate_task_set_id();
        let scale = request.scale.unwrap_or(Scale::percent(100.0));
        let now = Utc::now();
        let record = TaskSet {
            task_set_arn: self
                .arns
                .task_set(&cluster.cluster_name, &service.service_name, &id),
            object_name: naming::derive_task_set_object_name(&service.service_name, &id),
            id,
            service_arn: service.service_arn.clone(),
            cluster_arn: cluster.cluster_arn.clone(),
            external_id: request.external_id,
            task_definition_arn: td.task_definition_arn.clone(),
            launch_type: request.launch_type,
            scale,
            computed_desired_count: scale.replicas_for(service.desired_count),
            running_count: 0,
            pending_count: 0,
            status: if has_primary {
                TaskSetStatus::Active
            } else {
                TaskSetStatus::Primary
            },
            stability_status: StabilityStatus::Stabilizing,
            stability_status_at: now,
            namespace: cluster.namespace.clone(),
            created_at: now,
            updated_at: now,
            version: 0,
        };

        let task_set = self.storage.task_sets().create(record).await?;
        self.apply_task_set_deployment(&cluster, &service, &task_set)
            .await?;

        info!(
            task_set_arn = %task_set.task_set_arn,
            status = %task_set.status,
            desired = task_set.computed_desired_count,
            "Task set created"
        );
        Ok(task_set)
    }

    /// Change a task set's scale and re-apply its Deployment
    #[instrument(skip(self, request), fields(service = %request.service, task_set = %request.task_set))]
    pub async fn update_task_set(&self, request: UpdateTaskSetRequest) -> Result<TaskSet> {
        validate_request(&request)?;
        let (cluster, service) = self
            .external_service(request.cluster.as_deref(), &request.service)
            .await?;
        let current = self.find_task_set(&service, &request.task_set).await?;
        if current.status == TaskSetStatus::Draining {
            return Err(ControlPlaneError::InvalidParameter(format!(
                "task set {} is draining",
                current.id
            )));
        }

        let scale = request.scale;
        let computed = scale.replicas_for(service.desired_count);
        let now = Utc::now();
        let task_set = modify(
            self.storage.task_sets(),
            &RecordKey::arn(&current.task_set_arn),
            |ts: &mut TaskSet| {
                ts.scale = scale;
                ts.computed_desired_count = computed;
                ts.updated_at = now;
            },
        )
        .await?;

        self.apply_task_set_deployment(&cluster, &service, &task_set)
            .await?;
        Ok(task_set)
    }

    /// Promote a task set to PRIMARY, demoting the previous one to ACTIVE
    ///
    /// The service adopts the new primary's task definition.
    #[instrument(skip(self))]
    pub async fn update_service_primary_task_set(
        &self,
        cluster: Option<&str>,
        service: &str,
        task_set: &str,
    ) -> Result<TaskSet> {
        let (_, service) = self.external_service(cluster, service).await?;
        let target = self.find_task_set(&service, task_set).await?;
        match target.status {
            TaskSetStatus::Primary => return Ok(target),
            TaskSetStatus::Draining => {
                return Err(ControlPlaneError::InvalidParameter(format!(
                    "task set {} is draining",
                    target.id
                )))
            }
            TaskSetStatus::Active => {}
        }

        let now = Utc::now();
        // Demote first so there is never more than one PRIMARY
        for previous in self.service_task_sets(&service).await? {
            if previous.status == TaskSetStatus::Primary {
                modify(
                    self.storage.task_sets(),
                    &RecordKey::arn(&previous.task_set_arn),
                    |ts: &mut TaskSet| {
                        if ts.status == TaskSetStatus::Primary {
                            ts.status = TaskSetStatus::Active;
                            ts.updated_at = now;
                        }
                    },
                )
                .await?;
            }
        }

        let promoted = modify(
            self.storage.task_sets(),
            &RecordKey::arn(&target.task_set_arn),
            |ts: &mut TaskSet| {
                ts.status = TaskSetStatus::Primary;
                ts.updated_at = now;
            },
        )
        .await?;

        let td_arn = promoted.task_definition_arn.clone();
        modify(
            self.storage.services(),
            &RecordKey::arn(&service.service_arn),
            |s: &mut Service| {
                s.task_definition_arn = td_arn.clone();
                s.updated_at = now;
            },
        )
        .await?;

        info!(task_set_arn = %promoted.task_set_arn, "Task set promoted to primary");
        Ok(promoted)
    }

    /// Delete a task set; the PRIMARY one only with `force`
    #[instrument(skip(self, request), fields(service = %request.service, task_set = %request.task_set))]
    pub async fn delete_task_set(&self, request: DeleteTaskSetRequest) -> Result<TaskSet> {
        let (_, service) = self
            .external_service(request.cluster.as_deref(), &request.service)
            .await?;
        let task_set = self.find_task_set(&service, &request.task_set).await?;
        if task_set.status == TaskSetStatus::Primary && !request.force {
            return Err(ControlPlaneError::InvalidParameter(format!(
                "task set {} is the primary task set; use force to delete it",
                task_set.id
            )));
        }

        let drained = self.drain_task_set(&task_set).await?;
        info!(task_set_arn = %drained.task_set_arn, "Task set deleted");
        Ok(drained)
    }

    /// Describe task sets of a service; all of them when `task_sets` is empty
    pub async fn describe_task_sets(
        &self,
        cluster: Option<&str>,
        service: &str,
        task_sets: &[String],
    ) -> Result<Described<TaskSet>> {
        let cluster = self.active_cluster(cluster).await?;
        let service = self.find_service(&cluster, service).await?;

        if task_sets.is_empty() {
            return Ok(Described {
                items: self.service_task_sets(&service).await?,
                failures: Vec::new(),
            });
        }

        let mut described = Described::default();
        for identifier in task_sets {
            match self.find_task_set(&service, identifier).await {
                Ok(ts) => described.items.push(ts),
                Err(ControlPlaneError::TaskSetNotFound(_)) => {
                    described.failures.push(Failure::missing(identifier.clone()))
                }
                Err(e) => return Err(e),
            }
        }
        Ok(described)
    }
}
