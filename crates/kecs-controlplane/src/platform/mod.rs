//! Orchestration platform client
//!
//! The control plane only needs a narrow slice of the Kubernetes API:
//! namespaces, Deployments and Pods, plus watch streams for the last two.
//! [`OrchestrationClient`] captures that slice so the forward and reverse
//! paths can run against a real cluster ([`KubePlatform`]) or an in-process
//! fake ([`MemoryPlatform`]).

mod kubernetes;
mod memory;

pub use kubernetes::KubePlatform;
pub use memory::MemoryPlatform;

use crate::error::PlatformResult;
use async_trait::async_trait;
use futures::stream::BoxStream;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use std::collections::BTreeMap;
use std::sync::Arc;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "kecs";

/// Result of an idempotent apply
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Created,
    Updated,
    /// Identical input; nothing changed on the server
    Unchanged,
}

/// Change notification from a watch stream
#[derive(Debug, Clone)]
pub enum WatchEvent<K> {
    /// Object added or modified
    Applied(K),
    /// Object removed; carries its last known state
    Deleted(K),
}

/// Stream of watch events
///
/// Delivery is at-least-once; consumers must tolerate replays.
pub type WatchStream<K> = BoxStream<'static, PlatformResult<WatchEvent<K>>>;

/// Operations the control plane performs against the orchestration platform
#[async_trait]
pub trait OrchestrationClient: Send + Sync {
    /// Create the namespace if it does not exist
    async fn ensure_namespace(
        &self,
        name: &str,
        labels: BTreeMap<String, String>,
    ) -> PlatformResult<()>;

    /// Delete a namespace and everything in it; absent namespaces are ignored
    async fn delete_namespace(&self, name: &str) -> PlatformResult<()>;

    /// Read a deployment; `None` if it does not exist
    async fn get_deployment(&self, namespace: &str, name: &str)
        -> PlatformResult<Option<Deployment>>;

    /// List managed deployments in a namespace
    async fn list_deployments(&self, namespace: &str) -> PlatformResult<Vec<Deployment>>;

    async fn apply_deployment(&self, deployment: &Deployment) -> PlatformResult<ApplyOutcome>;

    /// Delete a deployment; returns `false` if it did not exist
    async fn delete_deployment(&self, namespace: &str, name: &str) -> PlatformResult<bool>;

    /// Read a pod; `None` if it does not exist
    async fn get_pod(&self, namespace: &str, name: &str) -> PlatformResult<Option<Pod>>;

    /// List managed pods in a namespace
    async fn list_pods(&self, namespace: &str) -> PlatformResult<Vec<Pod>>;

    async fn apply_pod(&self, pod: &Pod) -> PlatformResult<ApplyOutcome>;

    /// Delete a pod; returns `false` if it did not exist
    async fn delete_pod(&self, namespace: &str, name: &str) -> PlatformResult<bool>;

    /// Watch managed deployments in all namespaces
    fn watch_deployments(&self) -> WatchStream<Deployment>;

    /// Watch managed pods in all namespaces
    fn watch_pods(&self) -> WatchStream<Pod>;
}

/// Shared platform handle
pub type SharedPlatform = Arc<dyn OrchestrationClient>;

/// `namespace/name` of an object, for logging
pub(crate) fn object_ref(meta: &k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta) -> String {
    format!(
        "{}/{}",
        meta.namespace.as_deref().unwrap_or_default(),
        meta.name.as_deref().unwrap_or_default()
    )
}
