//! Kubernetes-backed platform client
//!
//! Objects are written with server-side apply under the `kecs` field manager.
//! Before force-applying, the existing object (if any) must carry
//! `kecs.dev/managed-by=kecs`; objects owned by another controller are never
//! taken over.

use super::{object_ref, ApplyOutcome, OrchestrationClient, WatchEvent, WatchStream, FIELD_MANAGER};
use crate::error::{PlatformError, PlatformResult};
use crate::naming::{LABEL_MANAGED_BY, MANAGED_BY_VALUE};
use async_trait::async_trait;
use futures::StreamExt;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::NamespaceResourceScope;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::runtime::watcher::{self, Event};
use kube::runtime::WatchStreamExt;
use kube::{Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Debug;
use tracing::{debug, info, warn};

fn managed_selector() -> String {
    format!("{}={}", LABEL_MANAGED_BY, MANAGED_BY_VALUE)
}

/// Classify a kube error for one object
fn map_kube_error(kind: &'static str, namespace: &str, name: &str, err: kube::Error) -> PlatformError {
    match &err {
        kube::Error::Api(resp) if resp.code == 404 => PlatformError::NotFound {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        kube::Error::Api(resp) if resp.code == 409 => PlatformError::Conflict {
            kind,
            namespace: namespace.to_string(),
            name: name.to_string(),
            reason: resp.message.clone(),
        },
        _ => PlatformError::KubeError(err),
    }
}

/// Verify the control plane owns an object before force-applying over it
fn verify_ownership<K: Resource>(kind: &'static str, existing: &K) -> PlatformResult<()> {
    let meta = existing.meta();
    let managed_by = meta.labels.as_ref().and_then(|l| l.get(LABEL_MANAGED_BY));
    match managed_by {
        Some(manager) if manager == MANAGED_BY_VALUE => Ok(()),
        other => Err(PlatformError::Conflict {
            kind,
            namespace: meta.namespace.clone().unwrap_or_default(),
            name: meta.name.clone().unwrap_or_default(),
            reason: format!(
                "object is managed by '{}', refusing to force-apply",
                other.map(String::as_str).unwrap_or("<unmanaged>")
            ),
        }),
    }
}

fn required_meta<'a>(kind: &'static str, meta: &'a ObjectMeta) -> PlatformResult<(&'a str, &'a str)> {
    let name = meta
        .name
        .as_deref()
        .ok_or_else(|| PlatformError::InvalidObject(format!("{} missing metadata.name", kind)))?;
    let namespace = meta.namespace.as_deref().ok_or_else(|| {
        PlatformError::InvalidObject(format!("{} {} missing metadata.namespace", kind, name))
    })?;
    Ok((namespace, name))
}

/// Platform client talking to a Kubernetes API server
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
}

impl KubePlatform {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    /// Connect using the in-cluster or kubeconfig defaults
    pub async fn try_default() -> PlatformResult<Self> {
        let client = Client::try_default().await?;
        Ok(Self::new(client))
    }

    async fn get_namespaced<K>(&self, kind: &'static str, namespace: &str, name: &str) -> PlatformResult<Option<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        api.get_opt(name)
            .await
            .map_err(|e| map_kube_error(kind, namespace, name, e))
    }

    async fn list_namespaced<K>(&self, kind: &'static str, namespace: &str) -> PlatformResult<Vec<K>>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(&managed_selector());
        let list = api
            .list(&lp)
            .await
            .map_err(|e| map_kube_error(kind, namespace, "", e))?;
        Ok(list.items)
    }

    /// Server-side apply with an ownership check
    ///
    /// Unchanged input leaves `resourceVersion` untouched, which is how
    /// [`ApplyOutcome::Unchanged`] is detected.
    async fn apply_namespaced<K>(&self, kind: &'static str, obj: &K) -> PlatformResult<ApplyOutcome>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Serialize + Debug,
        K::DynamicType: Default,
    {
        let (namespace, name) = required_meta(kind, obj.meta())?;
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);

        debug!(kind, object = %object_ref(obj.meta()), "Applying object");

        let existing = api
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error(kind, namespace, name, e))?;
        if let Some(existing) = &existing {
            verify_ownership(kind, existing)?;
        }

        let patch_params = PatchParams::apply(FIELD_MANAGER).force();
        let applied = api
            .patch(name, &patch_params, &Patch::Apply(obj))
            .await
            .map_err(|e| map_kube_error(kind, namespace, name, e))?;

        Ok(match existing {
            None => ApplyOutcome::Created,
            Some(before) if before.resource_version() == applied.resource_version() => {
                ApplyOutcome::Unchanged
            }
            Some(_) => ApplyOutcome::Updated,
        })
    }

    async fn delete_namespaced<K>(&self, kind: &'static str, namespace: &str, name: &str) -> PlatformResult<bool>
    where
        K: Resource<Scope = NamespaceResourceScope> + Clone + DeserializeOwned + Debug,
        K::DynamicType: Default,
    {
        let api: Api<K> = Api::namespaced(self.client.clone(), namespace);
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                debug!(kind, namespace, name, "Deleted object");
                Ok(true)
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(false),
            Err(e) => Err(map_kube_error(kind, namespace, name, e)),
        }
    }

    fn watch<K>(&self) -> WatchStream<K>
    where
        K: Resource + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
        K::DynamicType: Default + Clone + Eq + std::hash::Hash,
    {
        let api: Api<K> = Api::all(self.client.clone());
        let config = watcher::Config::default().labels(&managed_selector());
        watcher::watcher(api, config)
            .default_backoff()
            .filter_map(|event| async move {
                match event {
                    Ok(Event::Apply(obj)) | Ok(Event::InitApply(obj)) => {
                        Some(Ok(WatchEvent::Applied(obj)))
                    }
                    Ok(Event::Delete(obj)) => Some(Ok(WatchEvent::Deleted(obj))),
                    Ok(Event::Init) | Ok(Event::InitDone) => None,
                    Err(e) => {
                        warn!(error = %e, "Watch stream error");
                        Some(Err(PlatformError::Unavailable(e.to_string())))
                    }
                }
            })
            .boxed()
    }
}

#[async_trait]
impl OrchestrationClient for KubePlatform {
    async fn ensure_namespace(&self, name: &str, labels: BTreeMap<String, String>) -> PlatformResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        if api
            .get_opt(name)
            .await
            .map_err(|e| map_kube_error("Namespace", "", name, e))?
            .is_some()
        {
            return Ok(());
        }

        let ns = Namespace {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                labels: Some(labels),
                ..Default::default()
            },
            ..Default::default()
        };
        let patch_params = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &patch_params, &Patch::Apply(&ns))
            .await
            .map_err(|e| map_kube_error("Namespace", "", name, e))?;

        info!(namespace = %name, "Created namespace");
        Ok(())
    }

    async fn delete_namespace(&self, name: &str) -> PlatformResult<()> {
        let api: Api<Namespace> = Api::all(self.client.clone());
        match api.delete(name, &DeleteParams::background()).await {
            Ok(_) => {
                info!(namespace = %name, "Deleting namespace");
                Ok(())
            }
            Err(kube::Error::Api(resp)) if resp.code == 404 => Ok(()),
            Err(e) => Err(map_kube_error("Namespace", "", name, e)),
        }
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> PlatformResult<Option<Deployment>> {
        self.get_namespaced("Deployment", namespace, name).await
    }

    async fn list_deployments(&self, namespace: &str) -> PlatformResult<Vec<Deployment>> {
        self.list_namespaced("Deployment", namespace).await
    }

    async fn apply_deployment(&self, deployment: &Deployment) -> PlatformResult<ApplyOutcome> {
        self.apply_namespaced("Deployment", deployment).await
    }

    async fn delete_deployment(&self, namespace: &str, name: &str) -> PlatformResult<bool> {
        self.delete_namespaced::<Deployment>("Deployment", namespace, name)
            .await
    }

    async fn get_pod(&self, namespace: &str, name: &str) -> PlatformResult<Option<Pod>> {
        self.get_namespaced("Pod", namespace, name).await
    }

    async fn list_pods(&self, namespace: &str) -> PlatformResult<Vec<Pod>> {
        self.list_namespaced("Pod", namespace).await
    }

    async fn apply_pod(&self, pod: &Pod) -> PlatformResult<ApplyOutcome> {
        self.apply_namespaced("Pod", pod).await
    }

    async fn delete_pod(&self, namespace: &str, name: &str) -> PlatformResult<bool> {
        self.delete_namespaced::<Pod>("Pod", namespace, name).await
    }

    fn watch_deployments(&self) -> WatchStream<Deployment> {
        self.watch()
    }

    fn watch_pods(&self) -> WatchStream<Pod> {
        self.watch()
    }
}
