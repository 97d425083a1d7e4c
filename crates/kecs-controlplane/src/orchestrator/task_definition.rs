//! Task definition handlers

use super::{validate_request, ArnPage, Orchestrator, PageRequest};
use crate::arn::{Arn, ResourceKind};
use crate::error::{ControlPlaneError, Result, StorageError};
use crate::storage::{get_optional, list_all, modify, ListFilter, RecordKey, MAX_MODIFY_ATTEMPTS};
use crate::types::{
    validate_tags, ContainerDefinition, LaunchType, NetworkMode, Tag, TaskDefinition,
    TaskDefinitionStatus, Volume,
};
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;
use tracing::{info, instrument};
use validator::{Validate, ValidationError};

static FAMILY_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-zA-Z0-9_-]{1,255}$").unwrap());

fn validate_family(family: &str) -> std::result::Result<(), ValidationError> {
    if !FAMILY_REGEX.is_match(family) {
        return Err(ValidationError::new("invalid_family").with_message(
            "family must be 1-255 letters, digits, hyphens or underscores".into(),
        ));
    }
    Ok(())
}

fn validate_container_names(
    containers: &[ContainerDefinition],
) -> std::result::Result<(), ValidationError> {
    let mut seen = HashSet::new();
    for container in containers {
        if !seen.insert(container.name.as_str()) {
            return Err(ValidationError::new("duplicate_container")
                .with_message(format!("container name '{}' is used twice", container.name).into()));
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RegisterTaskDefinitionRequest {
    #[validate(custom(function = "validate_family"))]
    pub family: String,
    #[validate(
        length(min = 1, max = 10, message = "between 1 and 10 container definitions are required"),
        custom(function = "validate_container_names"),
        nested
    )]
    pub container_definitions: Vec<ContainerDefinition>,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    pub network_mode: Option<NetworkMode>,
    pub pid_mode: Option<String>,
    pub ipc_mode: Option<String>,
    pub task_role_arn: Option<String>,
    pub execution_role_arn: Option<String>,
    #[serde(default)]
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub requires_compatibilities: Vec<LaunchType>,
    #[serde(default)]
    #[validate(custom(function = "validate_tags"))]
    pub tags: Vec<Tag>,
}

impl Orchestrator {
    /// Register the next revision of a family
    #[instrument(skip(self, request), fields(family = %request.family))]
    pub async fn register_task_definition(
        &self,
        request: RegisterTaskDefinitionRequest,
    ) -> Result<TaskDefinition> {
        validate_request(&request)?;
        for volume in &request.volumes {
            if volume.name.is_empty() {
                return Err(ControlPlaneError::InvalidParameter(
                    "volume name is required".to_string(),
                ));
            }
        }

        let store = self.storage.task_definitions();
        let filter = ListFilter::default().with_family(&request.family);

        let mut attempt = 0;
        loop {
            attempt += 1;
            let latest = list_all::<TaskDefinition, _>(store, &filter)
                .await?
                .iter()
                .map(|td| td.revision)
                .max()
                .unwrap_or(0);
            let revision = latest + 1;

            let record = TaskDefinition {
                task_definition_arn: self.arns.task_definition(&request.family, revision),
                family: request.family.clone(),
                revision,
                container_definitions: request.container_definitions.clone(),
                cpu: request.cpu.clone(),
                memory: request.memory.clone(),
                network_mode: request.network_mode,
                pid_mode: request.pid_mode.clone(),
                ipc_mode: request.ipc_mode.clone(),
                task_role_arn: request.task_role_arn.clone(),
                execution_role_arn: request.execution_role_arn.clone(),
                volumes: request.volumes.clone(),
                requires_compatibilities: request.requires_compatibilities.clone(),
                status: TaskDefinitionStatus::Active,
                registered_at: Utc::now(),
                deregistered_at: None,
                tags: request.tags.clone(),
                version: 0,
            };

            match store.create(record).await {
                Ok(td) => {
                    info!(task_definition_arn = %td.task_definition_arn, "Task definition registered");
                    return Ok(td);
                }
                // Another registration took this revision
                Err(StorageError::Conflict { .. }) if attempt < MAX_MODIFY_ATTEMPTS => continue,
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Look up a task definition by `family`, `family:revision` or ARN
    ///
    /// A bare family resolves to its latest ACTIVE revision.
    pub async fn describe_task_definition(&self, identifier: &str) -> Result<TaskDefinition> {
        let not_found = || ControlPlaneError::TaskDefinitionNotFound(identifier.to_string());
        let store = self.storage.task_definitions();

        if identifier.is_empty() {
            return Err(ControlPlaneError::InvalidParameter(
                "task definition is required".to_string(),
            ));
        }

        let arn = if identifier.starts_with("arn:") {
            Arn::parse_as(identifier, ResourceKind::TaskDefinition)?;
            identifier.to_string()
        } else if let Some((family, revision)) = identifier.rsplit_once(':') {
            let revision = revision.parse::<u32>().map_err(|_| {
                ControlPlaneError::InvalidParameter(format!(
                    "invalid task definition revision in '{}'",
                    identifier
                ))
            })?;
            self.arns.task_definition(family, revision)
        } else {
            let filter = ListFilter::default()
                .with_family(identifier)
                .with_status(TaskDefinitionStatus::Active.as_str());
            return list_all::<TaskDefinition, _>(store, &filter)
                .await?
                .into_iter()
                .max_by_key(|td| td.revision)
                .ok_or_else(not_found);
        };

        get_optional::<TaskDefinition, _>(store, &RecordKey::arn(arn))
            .await?
            .ok_or_else(not_found)
    }

    /// Resolve a task definition that new work may use
    pub(crate) async fn active_task_definition(&self, identifier: &str) -> Result<TaskDefinition> {
        let td = self.describe_task_definition(identifier).await?;
        if td.status != TaskDefinitionStatus::Active {
            return Err(ControlPlaneError::InvalidParameter(format!(
                "task definition {} is inactive",
                td.task_definition_arn
            )));
        }
        Ok(td)
    }

    /// Mark a revision INACTIVE
    ///
    /// Running services and tasks keep using it; it can no longer be used for
    /// new ones.
    #[instrument(skip(self))]
    pub async fn deregister_task_definition(&self, identifier: &str) -> Result<TaskDefinition> {
        if !identifier.starts_with("arn:") && !identifier.contains(':') {
            return Err(ControlPlaneError::InvalidParameter(format!(
                "a revision is required to deregister '{}'",
                identifier
            )));
        }
        let td = self.describe_task_definition(identifier).await?;
        if td.status == TaskDefinitionStatus::Inactive {
            return Ok(td);
        }

        let now = Utc::now();
        let updated = modify(
            self.storage.task_definitions(),
            &RecordKey::arn(&td.task_definition_arn),
            |td: &mut TaskDefinition| {
                td.status = TaskDefinitionStatus::Inactive;
                td.deregistered_at = Some(now);
            },
        )
        .await?;

        info!(task_definition_arn = %updated.task_definition_arn, "Task definition deregistered");
        Ok(updated)
    }

    pub async fn list_task_definitions(
        &self,
        family: Option<&str>,
        status: Option<TaskDefinitionStatus>,
        page: &PageRequest,
    ) -> Result<ArnPage> {
        let mut filter = ListFilter::default();
        if let Some(family) = family {
            filter = filter.with_family(family);
        }
        if let Some(status) = status {
            filter = filter.with_status(status.as_str());
        }
        self.list_arns(self.storage.task_definitions(), &filter, page)
            .await
    }
}
