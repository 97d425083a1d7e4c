//! Cluster handlers

use super::{validate_request, ArnPage, Described, Failure, Orchestrator, PageRequest, DEFAULT_CLUSTER};
use crate::error::{ControlPlaneError, Result, StorageError};
use crate::naming;
use crate::storage::{list_all, modify, ListFilter, RecordKey};
use crate::types::{validate_tags, Cluster, ClusterSetting, ClusterStatus, Service, ServiceStatus, Tag, Task};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::mem::discriminant;
use tracing::{info, instrument};
use validator::Validate;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct CreateClusterRequest {
    /// Defaults to `default`
    pub cluster_name: Option<String>,
    #[serde(default)]
    pub settings: Vec<ClusterSetting>,
    #[serde(default)]
    #[validate(custom(function = "validate_tags"))]
    pub tags: Vec<Tag>,
}

impl CreateClusterRequest {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            cluster_name: Some(name.into()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct UpdateClusterSettingsRequest {
    pub cluster: String,
    #[validate(length(min = 1, message = "at least one setting is required"))]
    pub settings: Vec<ClusterSetting>,
}

/// Replace settings of the same kind, keep the rest
fn merge_settings(current: &mut Vec<ClusterSetting>, updates: &[ClusterSetting]) {
    for update in updates {
        current.retain(|s| discriminant(s) != discriminant(update));
        current.push(update.clone());
    }
}

impl Orchestrator {
    /// Create a cluster and its namespace
    ///
    /// Returns the existing cluster if it is already ACTIVE and reactivates
    /// an INACTIVE one.
    #[instrument(skip(self, request), fields(cluster = ?request.cluster_name))]
    pub async fn create_cluster(&self, request: CreateClusterRequest) -> Result<Cluster> {
        validate_request(&request)?;
        let name = request
            .cluster_name
            .clone()
            .unwrap_or_else(|| DEFAULT_CLUSTER.to_string());
        naming::validate_cluster_name(&name, &self.config.region)?;

        let arn = self.arns.cluster(&name);
        let namespace = naming::derive_namespace(&name, &self.config.region);
        let existing = self.find_cluster(Some(&name)).await?;

        if let Some(cluster) = &existing {
            if cluster.status == ClusterStatus::Active {
                self.platform
                    .ensure_namespace(&namespace, naming::managed_labels(&name))
                    .await?;
                return Ok(cluster.clone());
            }
        }

        self.platform
            .ensure_namespace(&namespace, naming::managed_labels(&name))
            .await?;

        let now = Utc::now();
        let cluster = match existing {
            Some(_) => {
                let settings = request.settings.clone();
                let tags = request.tags.clone();
                modify(self.storage.clusters(), &RecordKey::arn(&arn), move |c: &mut Cluster| {
                    c.status = ClusterStatus::Active;
                    c.settings = settings.clone();
                    c.tags = tags.clone();
                    c.updated_at = now;
                })
                .await?
            }
            None => {
                let record = Cluster {
                    cluster_arn: arn.clone(),
                    cluster_name: name.clone(),
                    status: ClusterStatus::Active,
                    region: self.config.region.clone(),
                    account_id: self.config.account_id.clone(),
                    namespace,
                    settings: request.settings,
                    tags: request.tags,
                    created_at: now,
                    updated_at: now,
                    version: 0,
                };
                match self.storage.clusters().create(record).await {
                    Ok(cluster) => cluster,
                    // Lost a race with a concurrent create
                    Err(StorageError::Conflict { .. }) => {
                        self.storage.clusters().get(&RecordKey::arn(&arn)).await?
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };

        info!(cluster_arn = %cluster.cluster_arn, "Cluster active");
        Ok(cluster)
    }

    #[instrument(skip(self, request), fields(cluster = %request.cluster))]
    pub async fn update_cluster_settings(
        &self,
        request: UpdateClusterSettingsRequest,
    ) -> Result<Cluster> {
        validate_request(&request)?;
        let cluster = self.active_cluster(Some(&request.cluster)).await?;

        let now = Utc::now();
        let updated = modify(
            self.storage.clusters(),
            &RecordKey::arn(&cluster.cluster_arn),
            |c: &mut Cluster| {
                merge_settings(&mut c.settings, &request.settings);
                c.updated_at = now;
            },
        )
        .await?;
        Ok(updated)
    }

    /// Delete a cluster once nothing runs in it
    ///
    /// Fails with `ClusterContainsServices` while any service is not INACTIVE
    /// or still reports running tasks, and with `ClusterContainsTasks` while
    /// any task has not stopped.
    #[instrument(skip(self))]
    pub async fn delete_cluster(&self, cluster: &str) -> Result<Cluster> {
        let Some(existing) = self.find_cluster(Some(cluster)).await? else {
            return Err(ControlPlaneError::ClusterNotFound(cluster.to_string()));
        };
        if existing.status == ClusterStatus::Inactive {
            return Ok(existing);
        }

        let filter = ListFilter::cluster(&existing.cluster_arn);
        let services = list_all::<Service, _>(self.storage.services(), &filter).await?;
        if let Some(blocking) = services
            .iter()
            .find(|s| s.status != ServiceStatus::Inactive || s.running_count > 0)
        {
            return Err(ControlPlaneError::ClusterContainsServices {
                service: blocking.service_name.clone(),
                status: blocking.status.to_string(),
            });
        }

        let tasks = list_all::<Task, _>(self.storage.tasks(), &filter).await?;
        if let Some(blocking) = tasks.iter().find(|t| !t.last_status.is_stopped()) {
            return Err(ControlPlaneError::ClusterContainsTasks {
                task: blocking.task_id.clone(),
                status: blocking.last_status.to_string(),
            });
        }

        self.platform.delete_namespace(&existing.namespace).await?;

        let now = Utc::now();
        let deleted = modify(
            self.storage.clusters(),
            &RecordKey::arn(&existing.cluster_arn),
            |c: &mut Cluster| {
                c.status = ClusterStatus::Inactive;
                c.updated_at = now;
            },
        )
        .await?;

        info!(cluster_arn = %deleted.cluster_arn, "Cluster deleted");
        Ok(deleted)
    }

    pub async fn describe_clusters(&self, clusters: &[String]) -> Result<Described<Cluster>> {
        let mut described = Described::default();
        let defaults = [DEFAULT_CLUSTER.to_string()];
        let identifiers = if clusters.is_empty() { &defaults[..] } else { clusters };

        for identifier in identifiers {
            match self.find_cluster(Some(identifier)).await? {
                Some(cluster) => described.items.push(cluster),
                None => described
                    .failures
                    .push(Failure::missing(self.cluster_arn(Some(identifier))?)),
            }
        }
        Ok(described)
    }

    pub async fn list_clusters(&self, page: &PageRequest) -> Result<ArnPage> {
        self.list_arns(self.storage.clusters(), &ListFilter::default(), page)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::super::testing::harness;
    use super::*;
    use crate::types::ContainerInsights;

    #[tokio::test]
    async fn test_create_cluster_is_idempotent() {
        let h = harness();
        let first = h
            .orchestrator
            .create_cluster(CreateClusterRequest::named("demo"))
            .await
            .unwrap();
        assert_eq!(first.status, ClusterStatus::Active);
        assert_eq!(first.namespace, "demo-us-east-1");
        assert!(h.platform.namespace_exists("demo-us-east-1"));

        let second = h
            .orchestrator
            .create_cluster(CreateClusterRequest::named("demo"))
            .await
            .unwrap();
        assert_eq!(first, second);
        assert_eq!(h.storage.clusters.write_count(), 1);
    }

    #[tokio::test]
    async fn test_create_cluster_defaults_name() {
        let h = harness();
        let cluster = h
            .orchestrator
            .create_cluster(CreateClusterRequest::default())
            .await
            .unwrap();
        assert_eq!(cluster.cluster_name, "default");
    }

    #[tokio::test]
    async fn test_invalid_cluster_name_has_no_side_effects() {
        let h = harness();
        let err = h
            .orchestrator
            .create_cluster(CreateClusterRequest::named("Bad_Name"))
            .await
            .unwrap_err();
        assert_eq!(err.exception_type(), "InvalidParameterException");
        assert_eq!(h.platform.apply_count(), 0);
        assert!(h.storage.clusters.is_empty());
    }

    #[tokio::test]
    async fn test_delete_then_recreate_reactivates() {
        let h = harness();
        h.orchestrator
            .create_cluster(CreateClusterRequest::named("demo"))
            .await
            .unwrap();
        let deleted = h.orchestrator.delete_cluster("demo").await.unwrap();
        assert_eq!(deleted.status, ClusterStatus::Inactive);
        assert!(!h.platform.namespace_exists("demo-us-east-1"));

        let again = h
            .orchestrator
            .create_cluster(CreateClusterRequest::named("demo"))
            .await
            .unwrap();
        assert_eq!(again.status, ClusterStatus::Active);
        assert!(h.platform.namespace_exists("demo-us-east-1"));
    }

    #[tokio::test]
    async fn test_update_settings_replaces_same_kind() {
        let h = harness();
        h.orchestrator
            .create_cluster(CreateClusterRequest {
                cluster_name: Some("demo".to_string()),
                settings: vec![ClusterSetting::ContainerInsights(ContainerInsights::Disabled)],
                tags: vec![],
            })
            .await
            .unwrap();

        let updated = h
            .orchestrator
            .update_cluster_settings(UpdateClusterSettingsRequest {
                cluster: "demo".to_string(),
                settings: vec![ClusterSetting::ContainerInsights(ContainerInsights::Enhanced)],
            })
            .await
            .unwrap();
        assert_eq!(
            updated.settings,
            vec![ClusterSetting::ContainerInsights(ContainerInsights::Enhanced)]
        );
    }

    #[tokio::test]
    async fn test_describe_reports_missing() {
        let h = harness();
        h.orchestrator
            .create_cluster(CreateClusterRequest::named("demo"))
            .await
            .unwrap();
        let described = h
            .orchestrator
            .describe_clusters(&["demo".to_string(), "ghost".to_string()])
            .await
            .unwrap();
        assert_eq!(described.items.len(), 1);
        assert_eq!(described.failures.len(), 1);
        assert!(described.failures[0].arn.ends_with("cluster/ghost"));
    }

    #[tokio::test]
    async fn test_list_clusters_paginates() {
        let h = harness();
        for name in ["a", "b", "c"] {
            h.orchestrator
                .create_cluster(CreateClusterRequest::named(name))
                .await
                .unwrap();
        }
        let first = h
            .orchestrator
            .list_clusters(&PageRequest::first(2))
            .await
            .unwrap();
        assert_eq!(first.arns.len(), 2);
        let token = first.next_token.clone().unwrap();
        let second = h
            .orchestrator
            .list_clusters(&PageRequest::first(2).after(token))
            .await
            .unwrap();
        assert_eq!(second.arns.len(), 1);
        assert!(second.next_token.is_none());
    }
}
