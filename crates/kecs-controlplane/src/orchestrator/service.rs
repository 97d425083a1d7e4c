//! Service handlers

use super::{
    log_warnings, record_key, validate_request, ArnPage, Described, Failure, Orchestrator,
    PageRequest,
};
use crate::arn::ResourceKind;
use crate::batch::RecordUpdate;
use crate::error::{ControlPlaneError, Result};
use crate::naming;
use crate::platform::ApplyOutcome;
use crate::resources::ResourceBuilder;
use crate::storage::{get_optional, list_all, modify, ListFilter, RecordKey};
use crate::sync::observed_service;
use crate::types::{
    validate_tags, Cluster, DeploymentControllerType, LaunchType, SchedulingStrategy, Service,
    ServiceStatus, Tag, TaskDefinition, TaskSet, TaskSetStatus,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument};
use validator::Validate;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateServiceRequest {
    pub cluster: Option<String>,
    pub service_name: String,
    /// Required unless the deployment controller is EXTERNAL
    pub task_definition: Option<String>,
    #[serde(default)]
    #[validate(range(max = 10000, message = "desired count must be at most 10000"))]
    pub desired_count: u32,
    #[serde(default)]
    pub launch_type: LaunchType,
    pub scheduling_strategy: Option<SchedulingStrategy>,
    pub deployment_controller: Option<DeploymentControllerType>,
    #[serde(default)]
    #[validate(custom(function = "validate_tags"))]
    pub tags: Vec<Tag>,
}

impl CreateServiceRequest {
    pub fn new(
        cluster: impl Into<String>,
        service_name: impl Into<String>,
        task_definition: impl Into<String>,
        desired_count: u32,
    ) -> Self {
        Self {
            cluster: Some(cluster.into()),
            service_name: service_name.into(),
            task_definition: Some(task_definition.into()),
            desired_count,
            launch_type: LaunchType::default(),
            scheduling_strategy: None,
            deployment_controller: None,
            tags: Vec::new(),
        }
    }

    pub fn external(mut self) -> Self {
        self.deployment_controller = Some(DeploymentControllerType::External);
        self
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateServiceRequest {
    pub cluster: Option<String>,
    pub service: String,
    #[validate(range(max = 10000, message = "desired count must be at most 10000"))]
    pub desired_count: Option<u32>,
    pub task_definition: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteServiceRequest {
    pub cluster: Option<String>,
    pub service: String,
    /// Delete even when the desired count is above zero
    #[serde(default)]
    pub force: bool,
}

/// Whether an existing service was created from the same request
fn same_service_input(
    existing: &Service,
    task_definition_arn: &str,
    request: &CreateServiceRequest,
    strategy: SchedulingStrategy,
    controller: DeploymentControllerType,
) -> bool {
    existing.task_definition_arn == task_definition_arn
        && existing.desired_count == request.desired_count
        && existing.launch_type == request.launch_type
        && existing.scheduling_strategy == strategy
        && existing.deployment_controller == controller
}

impl Orchestrator {
    /// Fetch a service by name or ARN within a cluster
    pub(crate) async fn find_service(
        &self,
        cluster: &Cluster,
        service: &str,
    ) -> Result<Service> {
        let key = record_key(service, ResourceKind::Service, &cluster.cluster_arn)?;
        get_optional::<Service, _>(self.storage.services(), &key)
            .await?
            .filter(|s| s.cluster_arn == cluster.cluster_arn)
            .ok_or_else(|| ControlPlaneError::ServiceNotFound(service.to_string()))
    }

    /// Apply the Deployment backing an ECS-controlled service
    async fn apply_service_deployment(
        &self,
        cluster: &Cluster,
        service: &Service,
        td: &TaskDefinition,
    ) -> Result<ApplyOutcome> {
        let builder = ResourceBuilder::new(td, &cluster.cluster_name, &cluster.namespace)?;
        let (deployment, warnings) = builder.build_service_deployment(service);
        log_warnings(&service.object_name, &warnings);
        let outcome = self.platform.apply_deployment(&deployment).await?;
        debug!(object = %service.object_name, ?outcome, "Applied service deployment");
        Ok(outcome)
    }

    /// Create a service and its Deployment
    ///
    /// The record is written before the Deployment is applied so that the
    /// reverse path always finds it. Repeating an identical request
    /// re-applies the Deployment and returns the existing record.
    #[instrument(skip(self, request), fields(service = %request.service_name))]
    pub async fn create_service(&self, request: CreateServiceRequest) -> Result<Service> {
        validate_request(&request)?;
        naming::validate_service_name(&request.service_name)?;

        let strategy = request.scheduling_strategy.unwrap_or(SchedulingStrategy::Replica);
        if strategy == SchedulingStrategy::Daemon {
            return Err(ControlPlaneError::InvalidParameter(
                "the DAEMON scheduling strategy is not supported".to_string(),
            ));
        }
        let controller = request
            .deployment_controller
            .unwrap_or(DeploymentControllerType::Ecs);
        if controller == DeploymentControllerType::External {
            // Task set Deployment names append the id to the service name
            naming::validate_external_service_name(&request.service_name)?;
        }

        let cluster = self.active_cluster(request.cluster.as_deref()).await?;

        let td = match (&request.task_definition, controller) {
            (Some(identifier), _) => Some(self.active_task_definition(identifier).await?),
            (None, DeploymentControllerType::External) => None,
            (None, DeploymentControllerType::Ecs) => {
                return Err(ControlPlaneError::InvalidParameter(
                    "task definition is required".to_string(),
                ))
            }
        };
        let td_arn = td
            .as_ref()
            .map(|td| td.task_definition_arn.clone())
            .unwrap_or_default();

        let service_arn = self.arns.service(&cluster.cluster_name, &request.service_name);
        let key = RecordKey::arn(&service_arn);
        let existing = get_optional::<Service, _>(self.storage.services(), &key).await?;

        let service = match existing {
            Some(existing) if existing.status != ServiceStatus::Inactive => {
                if !same_service_input(&existing, &td_arn, &request, strategy, controller) {
                    return Err(ControlPlaneError::InvalidParameter(
                        "Creation of service was not idempotent.".to_string(),
                    ));
                }
                existing
            }
            existing => {
                let now = Utc::now();
                let record = Service {
                    service_arn: service_arn.clone(),
                    service_name: request.service_name.clone(),
                    cluster_arn: cluster.cluster_arn.clone(),
                    task_definition_arn: td_arn,
                    launch_type: request.launch_type,
                    scheduling_strategy: strategy,
                    deployment_controller: controller,
                    desired_count: request.desired_count,
                    running_count: 0,
                    pending_count: 0,
                    status: ServiceStatus::Provisioning,
                    namespace: cluster.namespace.clone(),
                    object_name: naming::derive_object_name(&request.service_name),
                    tags: request.tags.clone(),
                    created_at: now,
                    updated_at: now,
                    version: 0,
                };
                match existing {
                    // Recreating a deleted service reuses its key
                    Some(inactive) => {
                        self.storage
                            .services()
                            .update(Service {
                                version: inactive.version,
                                ..record
                            })
                            .await?
                    }
                    None => self.storage.services().create(record).await?,
                }
            }
        };

        if let Some(td) = &td {
            if controller == DeploymentControllerType::Ecs {
                self.apply_service_deployment(&cluster, &service, td).await?;
            }
        }

        info!(service_arn = %service.service_arn, desired = service.desired_count, "Service created");
        Ok(service)
    }

    /// Change the desired count and/or task definition
    ///
    /// Running and pending counts are left to the reverse path.
    #[instrument(skip(self, request), fields(service = %request.service))]
    pub async fn update_service(&self, request: UpdateServiceRequest) -> Result<Service> {
        validate_request(&request)?;
        let cluster = self.active_cluster(request.cluster.as_deref()).await?;
        let current = self.find_service(&cluster, &request.service).await?;
        if matches!(current.status, ServiceStatus::Inactive | ServiceStatus::Draining) {
            return Err(ControlPlaneError::ServiceNotActive(current.service_name));
        }

        let td = match &request.task_definition {
            Some(identifier) => Some(self.active_task_definition(identifier).await?),
            None => None,
        };

        let now = Utc::now();
        let desired = request.desired_count;
        let td_arn = td.as_ref().map(|td| td.task_definition_arn.clone());
        let service = modify(
            self.storage.services(),
            &RecordKey::arn(&current.service_arn),
            |s: &mut Service| {
                if let Some(desired) = desired {
                    s.desired_count = desired;
                }
                if let Some(arn) = &td_arn {
                    s.task_definition_arn = arn.clone();
                }
                s.updated_at = now;
            },
        )
        .await?;

        match service.deployment_controller {
            DeploymentControllerType::Ecs => {
                let td = match td {
                    Some(td) => td,
                    None => self.describe_task_definition(&service.task_definition_arn).await?,
                };
                self.apply_service_deployment(&cluster, &service, &td).await?;
            }
            DeploymentControllerType::External => {
                self.rescale_task_sets(&cluster, &service).await?;
            }
        }

        info!(service_arn = %service.service_arn, desired = service.desired_count, "Service updated");
        Ok(service)
    }

    /// Delete a service's Deployments and mark it DRAINING
    ///
    /// The reverse path finalizes the record as INACTIVE once it observes
    /// the Deployment delete. When no Deployment exists, no delete will be
    /// observed, so the INACTIVE state is handed to the batch updater here
    /// and returned.
    #[instrument(skip(self, request), fields(service = %request.service, force = request.force))]
    pub async fn delete_service(&self, request: DeleteServiceRequest) -> Result<Service> {
        let cluster = self.active_cluster(request.cluster.as_deref()).await?;
        let current = self.find_service(&cluster, &request.service).await?;
        if current.status == ServiceStatus::Inactive {
            return Err(ControlPlaneError::ServiceNotActive(current.service_name));
        }
        if current.desired_count > 0 && !request.force {
            return Err(ControlPlaneError::InvalidParameter(
                "The service cannot be stopped while it is scaled above 0.".to_string(),
            ));
        }

        let now = Utc::now();
        let service = modify(
            self.storage.services(),
            &RecordKey::arn(&current.service_arn),
            |s: &mut Service| {
                s.desired_count = 0;
                s.status = ServiceStatus::Draining;
                s.updated_at = now;
            },
        )
        .await?;

        let task_sets = list_all::<TaskSet, _>(
            self.storage.task_sets(),
            &ListFilter::cluster(&cluster.cluster_arn).with_service(&service.service_arn),
        )
        .await?;
        for task_set in &task_sets {
            self.drain_task_set(task_set).await?;
        }

        let deleted = match service.deployment_controller {
            DeploymentControllerType::Ecs => {
                self.platform
                    .delete_deployment(&service.namespace, &service.object_name)
                    .await?
            }
            DeploymentControllerType::External => false,
        };

        let service = if deleted {
            service
        } else {
            let finished = observed_service(&service, None, now);
            self.batch.enqueue(RecordUpdate::Service(finished.clone()));
            finished
        };

        info!(service_arn = %service.service_arn, status = %service.status, "Service deleted");
        Ok(service)
    }

    pub async fn describe_services(
        &self,
        cluster: Option<&str>,
        services: &[String],
    ) -> Result<Described<Service>> {
        let cluster = self.active_cluster(cluster).await?;
        let mut described = Described::default();
        for identifier in services {
            match self.find_service(&cluster, identifier).await {
                Ok(service) => described.items.push(service),
                Err(ControlPlaneError::ServiceNotFound(_)) => {
                    let arn = if identifier.starts_with("arn:") {
                        identifier.clone()
                    } else {
                        self.arns.service(&cluster.cluster_name, identifier)
                    };
                    described.failures.push(Failure::missing(arn));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(described)
    }

    pub async fn list_services(&self, cluster: Option<&str>, page: &PageRequest) -> Result<ArnPage> {
        let cluster = self.active_cluster(cluster).await?;
        self.list_arns(
            self.storage.services(),
            &ListFilter::cluster(&cluster.cluster_arn),
            page,
        )
        .await
    }

    /// Recompute task set desired counts after the service desired count changed
    async fn rescale_task_sets(&self, cluster: &Cluster, service: &Service) -> Result<()> {
        let task_sets = list_all::<TaskSet, _>(
            self.storage.task_sets(),
            &ListFilter::cluster(&cluster.cluster_arn).with_service(&service.service_arn),
        )
        .await?;

        for task_set in task_sets {
            if task_set.status == TaskSetStatus::Draining {
                continue;
            }
            let computed = task_set.scale.replicas_for(service.desired_count);
            let task_set = modify(
                self.storage.task_sets(),
                &RecordKey::arn(&task_set.task_set_arn),
                |ts: &mut TaskSet| {
                    ts.computed_desired_count = computed;
                },
            )
            .await?;
            self.apply_task_set_deployment(cluster, service, &task_set)
                .await?;
        }
        Ok(())
    }
}
