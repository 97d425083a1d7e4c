//! Record storage
//!
//! The durable store is an external collaborator. This module defines the
//! contract the control plane consumes:
//!
//! - [`RecordStore`]: keyed, versioned CRUD plus paginated listing for one
//!   record type
//! - [`Storage`]: one store per record type
//!
//! [`MemoryStorage`] implements it for development and testing.

mod memory;

pub use memory::{MemoryStorage, MemoryStore};

use crate::error::{StorageError, StorageResult};
use crate::types::{Cluster, Service, Task, TaskDefinition, TaskSet};
use async_trait::async_trait;
use std::sync::Arc;

/// Address of a record
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum RecordKey {
    /// Globally unique ARN
    Arn(String),
    /// Name unique within a parent (cluster ARN, or service ARN for task sets)
    Scoped { parent_arn: String, name: String },
}

impl RecordKey {
    pub fn arn(arn: impl Into<String>) -> Self {
        RecordKey::Arn(arn.into())
    }

    pub fn scoped(parent_arn: impl Into<String>, name: impl Into<String>) -> Self {
        RecordKey::Scoped {
            parent_arn: parent_arn.into(),
            name: name.into(),
        }
    }
}

impl std::fmt::Display for RecordKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RecordKey::Arn(arn) => f.write_str(arn),
            RecordKey::Scoped { parent_arn, name } => write!(f, "{}/{}", parent_arn, name),
        }
    }
}

/// Structured list filter; unset fields match everything
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    pub cluster_arn: Option<String>,
    pub service_arn: Option<String>,
    pub family: Option<String>,
    pub status: Option<String>,
    pub started_by: Option<String>,
    pub pod_name: Option<String>,
}

impl ListFilter {
    pub fn cluster(cluster_arn: impl Into<String>) -> Self {
        Self {
            cluster_arn: Some(cluster_arn.into()),
            ..Default::default()
        }
    }

    pub fn with_service(mut self, service_arn: impl Into<String>) -> Self {
        self.service_arn = Some(service_arn.into());
        self
    }

    pub fn with_family(mut self, family: impl Into<String>) -> Self {
        self.family = Some(family.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_started_by(mut self, started_by: impl Into<String>) -> Self {
        self.started_by = Some(started_by.into());
        self
    }

    pub fn with_pod_name(mut self, pod_name: impl Into<String>) -> Self {
        self.pod_name = Some(pod_name.into());
        self
    }
}

fn field_matches(wanted: &Option<String>, actual: Option<&str>) -> bool {
    match wanted {
        Some(w) => actual == Some(w.as_str()),
        None => true,
    }
}

/// One page of a listing
#[derive(Debug, Clone)]
pub struct Page<R> {
    pub items: Vec<R>,
    /// Token for the next page, `None` on the last page
    pub next_token: Option<String>,
}

/// A record that can live in a [`RecordStore`]
pub trait Record: Clone + Send + Sync + 'static {
    /// Kind name used in errors
    const KIND: &'static str;

    fn arn(&self) -> &str;

    /// Secondary `(parent ARN, name)` address, if the record has one
    fn scoped_key(&self) -> Option<(&str, &str)>;

    fn version(&self) -> u64;

    fn set_version(&mut self, version: u64);

    fn matches(&self, filter: &ListFilter) -> bool;
}

impl Record for Cluster {
    const KIND: &'static str = "Cluster";

    fn arn(&self) -> &str {
        &self.cluster_arn
    }

    fn scoped_key(&self) -> Option<(&str, &str)> {
        None
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn matches(&self, filter: &ListFilter) -> bool {
        field_matches(&filter.cluster_arn, Some(&self.cluster_arn))
            && field_matches(&filter.status, Some(self.status.as_str()))
    }
}

impl Record for Service {
    const KIND: &'static str = "Service";

    fn arn(&self) -> &str {
        &self.service_arn
    }

    fn scoped_key(&self) -> Option<(&str, &str)> {
        Some((&self.cluster_arn, &self.service_name))
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn matches(&self, filter: &ListFilter) -> bool {
        field_matches(&filter.cluster_arn, Some(&self.cluster_arn))
            && field_matches(&filter.service_arn, Some(&self.service_arn))
            && field_matches(&filter.status, Some(self.status.as_str()))
    }
}

impl Record for Task {
    const KIND: &'static str = "Task";

    fn arn(&self) -> &str {
        &self.task_arn
    }

    fn scoped_key(&self) -> Option<(&str, &str)> {
        Some((&self.cluster_arn, &self.task_id))
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn matches(&self, filter: &ListFilter) -> bool {
        field_matches(&filter.cluster_arn, Some(&self.cluster_arn))
            && field_matches(&filter.service_arn, self.service_arn.as_deref())
            && field_matches(&filter.status, Some(self.last_status.as_str()))
            && field_matches(&filter.started_by, self.started_by.as_deref())
            && field_matches(&filter.pod_name, Some(&self.pod_name))
    }
}

impl Record for TaskSet {
    const KIND: &'static str = "TaskSet";

    fn arn(&self) -> &str {
        &self.task_set_arn
    }

    fn scoped_key(&self) -> Option<(&str, &str)> {
        Some((&self.service_arn, &self.id))
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn matches(&self, filter: &ListFilter) -> bool {
        field_matches(&filter.cluster_arn, Some(&self.cluster_arn))
            && field_matches(&filter.service_arn, Some(&self.service_arn))
            && field_matches(&filter.status, Some(self.status.as_str()))
    }
}

impl Record for TaskDefinition {
    const KIND: &'static str = "TaskDefinition";

    fn arn(&self) -> &str {
        &self.task_definition_arn
    }

    fn scoped_key(&self) -> Option<(&str, &str)> {
        None
    }

    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }

    fn matches(&self, filter: &ListFilter) -> bool {
        field_matches(&filter.family, Some(&self.family))
            && field_matches(&filter.status, Some(self.status.as_str()))
    }
}

/// Storage backend trait for one record type
#[async_trait]
pub trait RecordStore<R: Record>: Send + Sync {
    /// Insert a new record; fails with `Conflict` if the key exists
    async fn create(&self, record: R) -> StorageResult<R>;

    /// Fetch a record; fails with `NotFound`
    async fn get(&self, key: &RecordKey) -> StorageResult<R>;

    /// Replace a record; fails with `NotFound` if absent and
    /// `VersionConflict` if `record.version()` is stale
    async fn update(&self, record: R) -> StorageResult<R>;

    /// Remove a record; fails with `NotFound` if absent
    async fn delete(&self, key: &RecordKey) -> StorageResult<()>;

    /// List records in key order, resuming after `page_token`
    async fn list(
        &self,
        filter: &ListFilter,
        page_size: usize,
        page_token: Option<&str>,
    ) -> StorageResult<Page<R>>;
}

/// All record stores used by the control plane
pub trait Storage: Send + Sync {
    fn clusters(&self) -> &dyn RecordStore<Cluster>;
    fn services(&self) -> &dyn RecordStore<Service>;
    fn tasks(&self) -> &dyn RecordStore<Task>;
    fn task_sets(&self) -> &dyn RecordStore<TaskSet>;
    fn task_definitions(&self) -> &dyn RecordStore<TaskDefinition>;
}

/// Shared storage handle
pub type SharedStorage = Arc<dyn Storage>;

/// Attempts for read-modify-write cycles that lose a version race
pub const MAX_MODIFY_ATTEMPTS: u32 = 5;

/// Read a record, apply `mutate`, and write it back
///
/// Retries when a concurrent writer bumps the version in between.
pub async fn modify<R, S, F>(store: &S, key: &RecordKey, mut mutate: F) -> StorageResult<R>
where
    R: Record,
    S: RecordStore<R> + ?Sized,
    F: FnMut(&mut R) + Send,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut record = store.get(key).await?;
        mutate(&mut record);
        match store.update(record).await {
            Err(StorageError::VersionConflict { .. }) if attempt < MAX_MODIFY_ATTEMPTS => {
                tracing::debug!(key = %key, attempt, "Version conflict, re-reading record");
            }
            result => return result,
        }
    }
}

/// Collect every page of a listing
pub async fn list_all<R, S>(store: &S, filter: &ListFilter) -> StorageResult<Vec<R>>
where
    R: Record,
    S: RecordStore<R> + ?Sized,
{
    const PAGE_SIZE: usize = 100;

    let mut items = Vec::new();
    let mut token: Option<String> = None;
    loop {
        let page = store.list(filter, PAGE_SIZE, token.as_deref()).await?;
        items.extend(page.items);
        match page.next_token {
            Some(next) => token = Some(next),
            None => return Ok(items),
        }
    }
}

/// Fetch a record, mapping `NotFound` to `None`
pub async fn get_optional<R, S>(store: &S, key: &RecordKey) -> StorageResult<Option<R>>
where
    R: Record,
    S: RecordStore<R> + ?Sized,
{
    match store.get(key).await {
        Ok(record) => Ok(Some(record)),
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
    }
}
