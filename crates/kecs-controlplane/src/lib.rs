//! # KECS Control Plane
//!
//! An ECS-compatible control plane that runs workloads on Kubernetes.
//!
//! Callers use the ECS resource model (clusters, services, tasks, task sets
//! and task definitions, addressed by ARN). The control plane maps each
//! resource onto Namespaces, Deployments and Pods and keeps the ECS records
//! in step with what Kubernetes actually runs.
//!
//! ## Architecture
//!
//! Two paths meet only in [`storage`]:
//!
//! 1. **Forward**: [`orchestrator::Orchestrator`] validates a lifecycle
//!    request, applies the Kubernetes objects and writes the desired half of
//!    the record.
//! 2. **Reverse**: [`sync::SyncController`] watches Deployments and Pods,
//!    recomputes the observed half (counts, statuses, health) and hands it to
//!    [`batch::BatchUpdater`], which coalesces writes so event storms turn
//!    into a bounded number of storage updates.
//!
//! ```text
//!   ECS request ─▶ Orchestrator ─▶ OrchestrationClient ─▶ Kubernetes
//!                       │                                     │ watch
//!                       ▼                                     ▼
//!                    Storage ◀── BatchUpdater ◀── SyncController
//! ```
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kecs_controlplane::prelude::*;
//! use std::sync::Arc;
//!
//! let config = ControlPlaneConfig::default();
//! let storage: SharedStorage = Arc::new(MemoryStorage::new());
//! let platform: SharedPlatform = Arc::new(KubePlatform::try_default().await?);
//!
//! let batch = Arc::new(BatchUpdater::new(storage.clone(), config.batch.clone()));
//!
//! let orchestrator = Orchestrator::new(config.clone(), storage.clone(), platform.clone(), batch);
//! orchestrator.create_cluster(CreateClusterRequest::named("demo")).await?;
//! ```
//!
//! ## Modules
//!
//! - [`naming`], [`arn`], [`resources`], [`status`] - pure mapping between
//!   ECS and Kubernetes
//! - [`orchestrator`] - forward path handlers
//! - [`sync`] - reverse path controller and work queue
//! - [`batch`] - coalescing storage writer
//! - [`platform`] - Kubernetes client trait with kube-rs and in-memory
//!   implementations
//! - [`storage`] - record store trait with an in-memory implementation
//! - [`error`] - error types
//!
//! ## Metrics
//!
//! - `kecs_sync_reconciliations_total` - keys reconciled by the reverse path
//! - `kecs_sync_reconciliation_errors_total` - failed reconciles
//! - `kecs_sync_reconciliation_duration_seconds` - reconcile latency
//! - `kecs_batch_flushes_total` - batch flushes
//! - `kecs_batch_records_written_total` - records written by the batch updater
//! - `kecs_batch_records_dropped_total` - updates dropped after repeated failures

pub mod arn;
pub mod backoff;
pub mod batch;
pub mod config;
pub mod error;
pub mod naming;
pub mod orchestrator;
pub mod platform;
pub mod resources;
pub mod status;
pub mod storage;
pub mod sync;
pub mod types;

pub mod prelude {
    //! Re-exports for convenient usage
    pub use crate::arn::{Arn, ArnBuilder, ResourceKind};
    pub use crate::batch::{BatchUpdater, FlushReport, RecordUpdate, UpdateKind};
    pub use crate::config::{BatchConfig, ControlPlaneConfig, SyncConfig};
    pub use crate::error::{ControlPlaneError, PlatformError, Result, StorageError};
    pub use crate::orchestrator::{
        ArnPage, CreateClusterRequest, CreateServiceRequest, CreateTaskSetRequest,
        DeleteServiceRequest, DeleteTaskSetRequest, Described, ListTasksRequest, Orchestrator,
        PageRequest, RegisterTaskDefinitionRequest, RunTaskRequest, StopTaskRequest,
        UpdateClusterSettingsRequest, UpdateServiceRequest, UpdateTaskSetRequest,
    };
    pub use crate::platform::{
        KubePlatform, MemoryPlatform, OrchestrationClient, SharedPlatform, WatchEvent,
    };
    pub use crate::resources::{MappingWarning, ResourceBuilder};
    pub use crate::storage::{MemoryStorage, SharedStorage, Storage};
    pub use crate::sync::{ObjectKey, ObservedEvent, ReconcileOutcome, SyncController};
    pub use crate::types::*;
}
