//! Orchestrator
//!
//! The forward path: one handler per ECS lifecycle operation. Handlers
//! validate the request, resolve names through [`crate::naming`], apply the
//! Kubernetes objects through the [`crate::platform::OrchestrationClient`]
//! and write the desired half of the record to storage.
//!
//! Handlers never write observed state (running and pending counts, task
//! `last_status`, health). That belongs to [`crate::sync::SyncController`].
//! When a handler knows no watch event will follow, it hands the observed
//! state to the [`BatchUpdater`] the same way the reverse path does.

mod cluster;
mod service;
mod task;
mod task_definition;
mod task_set;

pub use cluster::{CreateClusterRequest, UpdateClusterSettingsRequest};
pub use service::{CreateServiceRequest, DeleteServiceRequest, UpdateServiceRequest};
pub use task::{ListTasksRequest, RunTaskRequest, StopTaskRequest, DEFAULT_STOP_REASON};
pub use task_definition::RegisterTaskDefinitionRequest;
pub use task_set::{CreateTaskSetRequest, DeleteTaskSetRequest, UpdateTaskSetRequest};

use crate::arn::{Arn, ArnBuilder, ResourceKind};
use crate::batch::BatchUpdater;
use crate::config::ControlPlaneConfig;
use crate::error::{ControlPlaneError, Result};
use crate::platform::SharedPlatform;
use crate::resources::MappingWarning;
use crate::storage::{get_optional, ListFilter, Record, RecordKey, RecordStore, SharedStorage};
use crate::types::{Cluster, ClusterStatus};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use validator::Validate;

/// Cluster used when a request names none
pub const DEFAULT_CLUSTER: &str = "default";

/// Largest page a list call returns
pub const MAX_PAGE_SIZE: usize = 100;

/// Paging parameters of a list call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequest {
    pub next_token: Option<String>,
    pub max_results: Option<usize>,
}

impl PageRequest {
    pub fn first(max_results: usize) -> Self {
        Self {
            next_token: None,
            max_results: Some(max_results),
        }
    }

    pub fn after(mut self, token: impl Into<String>) -> Self {
        self.next_token = Some(token.into());
        self
    }

    fn page_size(&self) -> Result<usize> {
        match self.max_results {
            None => Ok(MAX_PAGE_SIZE),
            Some(n) if (1..=MAX_PAGE_SIZE).contains(&n) => Ok(n),
            Some(n) => Err(ControlPlaneError::InvalidParameter(format!(
                "maxResults must be between 1 and {}, got {}",
                MAX_PAGE_SIZE, n
            ))),
        }
    }
}

/// One page of ARNs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArnPage {
    pub arns: Vec<String>,
    pub next_token: Option<String>,
}

/// Identifier a describe call could not resolve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    pub arn: String,
    pub reason: String,
}

impl Failure {
    fn missing(arn: impl Into<String>) -> Self {
        Self {
            arn: arn.into(),
            reason: "MISSING".to_string(),
        }
    }
}

/// Result of a describe call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Described<T> {
    pub items: Vec<T>,
    pub failures: Vec<Failure>,
}

impl<T> Default for Described<T> {
    fn default() -> Self {
        Self {
            items: Vec::new(),
            failures: Vec::new(),
        }
    }
}

/// Run `validator` derives and map failures to `InvalidParameter`
pub(crate) fn validate_request<T: Validate>(request: &T) -> Result<()> {
    request
        .validate()
        .map_err(|e| ControlPlaneError::InvalidParameter(e.to_string()))
}

/// Storage key for a name-or-ARN identifier scoped below `parent_arn`
pub(crate) fn record_key(identifier: &str, kind: ResourceKind, parent_arn: &str) -> Result<RecordKey> {
    if identifier.is_empty() {
        return Err(ControlPlaneError::InvalidParameter(format!(
            "{} identifier is required",
            kind
        )));
    }
    if identifier.starts_with("arn:") {
        Arn::parse_as(identifier, kind)?;
        return Ok(RecordKey::arn(identifier));
    }
    Ok(RecordKey::scoped(parent_arn, identifier))
}

fn log_warnings(object: &str, warnings: &[MappingWarning]) {
    for warning in warnings {
        warn!(object, %warning, "Task definition field not mapped");
    }
}

/// Forward-path request handlers
pub struct Orchestrator {
    config: ControlPlaneConfig,
    arns: ArnBuilder,
    storage: SharedStorage,
    platform: SharedPlatform,
    /// Observed state the watches will never report goes through here
    batch: Arc<BatchUpdater>,
}

impl Orchestrator {
    pub fn new(
        config: ControlPlaneConfig,
        storage: SharedStorage,
        platform: SharedPlatform,
        batch: Arc<BatchUpdater>,
    ) -> Self {
        let arns = ArnBuilder::from_config(&config);
        Self {
            config,
            arns,
            storage,
            platform,
            batch,
        }
    }

    pub fn config(&self) -> &ControlPlaneConfig {
        &self.config
    }

    pub fn arns(&self) -> &ArnBuilder {
        &self.arns
    }

    /// ARN of a cluster given by name or ARN, defaulting to `default`
    fn cluster_arn(&self, identifier: Option<&str>) -> Result<String> {
        let identifier = identifier.unwrap_or(DEFAULT_CLUSTER);
        if identifier.starts_with("arn:") {
            Arn::parse_as(identifier, ResourceKind::Cluster)?;
            return Ok(identifier.to_string());
        }
        Ok(self.arns.cluster(identifier))
    }

    /// Fetch a cluster in any state
    async fn find_cluster(&self, identifier: Option<&str>) -> Result<Option<Cluster>> {
        let arn = self.cluster_arn(identifier)?;
        Ok(get_optional(self.storage.clusters(), &RecordKey::arn(arn)).await?)
    }

    /// Fetch a cluster that can accept new work
    async fn active_cluster(&self, identifier: Option<&str>) -> Result<Cluster> {
        let name = identifier.unwrap_or(DEFAULT_CLUSTER);
        match self.find_cluster(identifier).await? {
            Some(cluster) if cluster.status == ClusterStatus::Active => Ok(cluster),
            _ => Err(ControlPlaneError::ClusterNotFound(name.to_string())),
        }
    }

    /// List one page of records and return their ARNs
    async fn list_arns<R: Record>(
        &self,
        store: &dyn RecordStore<R>,
        filter: &ListFilter,
        page: &PageRequest,
    ) -> Result<ArnPage> {
        let page_size = page.page_size()?;
        let listed = store
            .list(filter, page_size, page.next_token.as_deref())
            .await?;
        Ok(ArnPage {
            arns: listed.items.iter().map(|r| r.arn().to_string()).collect(),
            next_token: listed.next_token,
        })
    }
}
