//! In-memory storage backend for testing and development

use super::{ListFilter, Page, Record, RecordKey, RecordStore, Storage};
use crate::error::{StorageError, StorageResult};
use crate::types::{Cluster, Service, Task, TaskDefinition, TaskSet};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory store for one record type
///
/// Records are ordered by ARN so that page tokens (the last ARN returned)
/// resume at the same place even when unrelated records are inserted.
pub struct MemoryStore<R: Record> {
    inner: RwLock<StoreInner<R>>,
    /// Successful create/update/delete calls
    writes: AtomicU64,
    /// Remaining injected write failures per ARN
    failures: DashMap<String, u32>,
    /// Remaining injected read failures per ARN
    read_failures: DashMap<String, u32>,
}

struct StoreInner<R> {
    by_arn: BTreeMap<String, R>,
    by_scope: HashMap<(String, String), String>,
}

impl<R: Record> MemoryStore<R> {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StoreInner {
                by_arn: BTreeMap::new(),
                by_scope: HashMap::new(),
            }),
            writes: AtomicU64::new(0),
            failures: DashMap::new(),
            read_failures: DashMap::new(),
        }
    }

    /// Number of successful writes so far
    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Make the next `times` writes for `arn` fail with `Unavailable`
    pub fn fail_writes_for(&self, arn: impl Into<String>, times: u32) {
        self.failures.insert(arn.into(), times);
    }

    /// Make the next `times` reads of `arn` fail with `Unavailable`
    pub fn fail_reads_for(&self, arn: impl Into<String>, times: u32) {
        self.read_failures.insert(arn.into(), times);
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_arn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_injected_failure(&self, arn: &str) -> StorageResult<()> {
        Self::take_failure(&self.failures, arn)
    }

    fn take_failure(failures: &DashMap<String, u32>, arn: &str) -> StorageResult<()> {
        if let Some(mut remaining) = failures.get_mut(arn) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(StorageError::Unavailable(format!(
                    "injected failure for {}",
                    arn
                )));
            }
        }
        Ok(())
    }

    fn resolve(inner: &StoreInner<R>, key: &RecordKey) -> Option<String> {
        match key {
            RecordKey::Arn(arn) => inner.by_arn.contains_key(arn).then(|| arn.clone()),
            RecordKey::Scoped { parent_arn, name } => inner
                .by_scope
                .get(&(parent_arn.clone(), name.clone()))
                .cloned(),
        }
    }

    fn not_found(key: impl ToString) -> StorageError {
        StorageError::NotFound {
            kind: R::KIND,
            key: key.to_string(),
        }
    }
}

impl<R: Record> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: Record> RecordStore<R> for MemoryStore<R> {
    async fn create(&self, mut record: R) -> StorageResult<R> {
        self.check_injected_failure(record.arn())?;

        let mut inner = self.inner.write();
        let arn = record.arn().to_string();
        let scope = record
            .scoped_key()
            .map(|(parent, name)| (parent.to_string(), name.to_string()));

        if inner.by_arn.contains_key(&arn)
            || scope.as_ref().is_some_and(|s| inner.by_scope.contains_key(s))
        {
            return Err(StorageError::Conflict {
                kind: R::KIND,
                key: arn,
            });
        }

        record.set_version(1);
        if let Some(scope) = scope {
            inner.by_scope.insert(scope, arn.clone());
        }
        inner.by_arn.insert(arn, record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    async fn get(&self, key: &RecordKey) -> StorageResult<R> {
        if let RecordKey::Arn(arn) = key {
            Self::take_failure(&self.read_failures, arn)?;
        }
        let inner = self.inner.read();
        Self::resolve(&inner, key)
            .and_then(|arn| inner.by_arn.get(&arn).cloned())
            .ok_or_else(|| Self::not_found(key))
    }

    async fn update(&self, mut record: R) -> StorageResult<R> {
        self.check_injected_failure(record.arn())?;

        let mut inner = self.inner.write();
        let arn = record.arn().to_string();
        let current = inner
            .by_arn
            .get(&arn)
            .ok_or_else(|| Self::not_found(&arn))?;

        if current.version() != record.version() {
            return Err(StorageError::VersionConflict {
                kind: R::KIND,
                key: arn,
                expected: record.version(),
                actual: current.version(),
            });
        }

        record.set_version(current.version() + 1);
        inner.by_arn.insert(arn, record.clone());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(record)
    }

    async fn delete(&self, key: &RecordKey) -> StorageResult<()> {
        let mut inner = self.inner.write();
        let arn = Self::resolve(&inner, key).ok_or_else(|| Self::not_found(key))?;
        if let Some(record) = inner.by_arn.remove(&arn) {
            if let Some((parent, name)) = record.scoped_key() {
                inner
                    .by_scope
                    .remove(&(parent.to_string(), name.to_string()));
            }
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list(
        &self,
        filter: &ListFilter,
        page_size: usize,
        page_token: Option<&str>,
    ) -> StorageResult<Page<R>> {
        let page_size = page_size.max(1);
        let inner = self.inner.read();
        let start = match page_token {
            Some(token) => Bound::Excluded(token.to_string()),
            None => Bound::Unbounded,
        };

        let mut matching = inner
            .by_arn
            .range((start, Bound::Unbounded))
            .map(|(_, record)| record)
            .filter(|record| record.matches(filter));

        let items: Vec<R> = matching.by_ref().take(page_size).cloned().collect();
        let next_token = if matching.next().is_some() {
            items.last().map(|r| r.arn().to_string())
        } else {
            None
        };

        Ok(Page { items, next_token })
    }
}

/// In-memory storage for all record types
#[derive(Default)]
pub struct MemoryStorage {
    pub clusters: MemoryStore<Cluster>,
    pub services: MemoryStore<Service>,
    pub tasks: MemoryStore<Task>,
    pub task_sets: MemoryStore<TaskSet>,
    pub task_definitions: MemoryStore<TaskDefinition>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for MemoryStorage {
    fn clusters(&self) -> &dyn RecordStore<Cluster> {
        &self.clusters
    }

    fn services(&self) -> &dyn RecordStore<Service> {
        &self.services
    }

    fn tasks(&self) -> &dyn RecordStore<Task> {
        &self.tasks
    }

    fn task_sets(&self) -> &dyn RecordStore<TaskSet> {
        &self.task_sets
    }

    fn task_definitions(&self) -> &dyn RecordStore<TaskDefinition> {
        &self.task_definitions
    }
}
