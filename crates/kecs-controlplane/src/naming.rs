//! Namespace and object naming
//!
//! Every ECS resource maps to a deterministic Kubernetes location:
//!
//! | ECS resource | Kubernetes object                                  |
//! |--------------|----------------------------------------------------|
//! | Cluster      | Namespace `<cluster>-<region>`                     |
//! | Service      | Deployment `ecs-service-<service>`                 |
//! | Task set     | Deployment `ecs-taskset-<service>-<taskSetDigits>` |
//! | Task         | Pod `ecs-task-<taskId>` (or a pod of a Deployment) |
//!
//! Each `derive_*` function has an `extract_*` inverse, and the pair round-trips
//! for every name accepted by [`validate_dns_label`].

use crate::error::{ControlPlaneError, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::LazyLock;

/// Prefix of Deployments backing services
pub const SERVICE_OBJECT_PREFIX: &str = "ecs-service-";

/// Prefix of Deployments backing task sets
pub const TASK_SET_OBJECT_PREFIX: &str = "ecs-taskset-";

/// Prefix of pods created by RunTask
pub const TASK_POD_PREFIX: &str = "ecs-task-";

/// Task set ids look like `ecs-svc/1234567890123456789`
pub const TASK_SET_ID_PREFIX: &str = "ecs-svc/";

pub const LABEL_MANAGED_BY: &str = "kecs.dev/managed-by";
pub const MANAGED_BY_VALUE: &str = "kecs";
pub const LABEL_CLUSTER: &str = "kecs.dev/cluster";
pub const LABEL_SERVICE: &str = "kecs.dev/service";
pub const LABEL_TASK_SET: &str = "kecs.dev/task-set";
pub const LABEL_TASK_ID: &str = "kecs.dev/task-id";
pub const LABEL_TASK_FAMILY: &str = "kecs.dev/task-family";
pub const LABEL_TASK_REVISION: &str = "kecs.dev/task-revision";
pub const LABEL_LAUNCH_TYPE: &str = "kecs.dev/launch-type";

pub const ANNOTATION_SERVICE_ARN: &str = "kecs.dev/service-arn";
pub const ANNOTATION_TASK_ARN: &str = "kecs.dev/task-arn";
pub const ANNOTATION_TASK_SET_ARN: &str = "kecs.dev/task-set-arn";
pub const ANNOTATION_TASK_DEFINITION_ARN: &str = "kecs.dev/task-definition-arn";
pub const ANNOTATION_STARTED_BY: &str = "kecs.dev/started-by";

/// Kubernetes object names are DNS labels
pub const MAX_OBJECT_NAME_LEN: usize = 63;

/// Longest service name whose Deployment name still fits in a label value
pub const MAX_SERVICE_NAME_LEN: usize = MAX_OBJECT_NAME_LEN - SERVICE_OBJECT_PREFIX.len();

/// Digits in a task set id
pub const TASK_SET_ID_DIGITS: usize = 19;

/// Longest service name whose task set Deployment names still fit
pub const MAX_EXTERNAL_SERVICE_NAME_LEN: usize =
    MAX_OBJECT_NAME_LEN - TASK_SET_OBJECT_PREFIX.len() - 1 - TASK_SET_ID_DIGITS;

static DNS_LABEL_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9]([-a-z0-9]*[a-z0-9])?$").unwrap());

static REGION_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z]{2}(-gov|-iso[a-z]?)?-[a-z]+-[0-9]+$").unwrap());

static NAMESPACE_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<cluster>[a-z0-9](?:[-a-z0-9]*[a-z0-9])?)-(?P<region>[a-z]{2}(?:-gov|-iso[a-z]?)?-[a-z]+-[0-9]+)$")
        .unwrap()
});

/// Cluster and region recovered from a namespace
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterInfo {
    pub cluster_name: String,
    pub region: String,
}

/// Check whether a string is an AWS-style region (`us-east-1`, `us-gov-west-1`)
pub fn is_region(value: &str) -> bool {
    REGION_REGEX.is_match(value)
}

/// Namespace holding a cluster's workloads
pub fn derive_namespace(cluster_name: &str, region: &str) -> String {
    format!("{}-{}", cluster_name, region)
}

/// Inverse of [`derive_namespace`]
pub fn extract_cluster_info(namespace: &str) -> Option<ClusterInfo> {
    let caps = NAMESPACE_REGEX.captures(namespace)?;
    Some(ClusterInfo {
        cluster_name: caps["cluster"].to_string(),
        region: caps["region"].to_string(),
    })
}

/// Deployment name for a service
pub fn derive_object_name(service_name: &str) -> String {
    format!("{}{}", SERVICE_OBJECT_PREFIX, service_name)
}

/// Inverse of [`derive_object_name`]
pub fn extract_service_name(object_name: &str) -> Option<&str> {
    object_name
        .strip_prefix(SERVICE_OBJECT_PREFIX)
        .filter(|rest| !rest.is_empty())
}

/// Deployment name for a task set
///
/// Only the numeric part of the task set id is used since `/` is not allowed
/// in object names.
pub fn derive_task_set_object_name(service_name: &str, task_set_id: &str) -> String {
    let digits = task_set_id
        .strip_prefix(TASK_SET_ID_PREFIX)
        .unwrap_or(task_set_id);
    format!("{}{}-{}", TASK_SET_OBJECT_PREFIX, service_name, digits)
}

/// Inverse of [`derive_task_set_object_name`], returning `(service, task set id)`
pub fn extract_task_set_object_name(object_name: &str) -> Option<(String, String)> {
    let rest = object_name.strip_prefix(TASK_SET_OBJECT_PREFIX)?;
    let (service, digits) = rest.rsplit_once('-')?;
    if service.is_empty() || digits.is_empty() || !digits.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    Some((service.to_string(), format!("{}{}", TASK_SET_ID_PREFIX, digits)))
}

/// Pod name for an ad-hoc task
pub fn derive_task_pod_name(task_id: &str) -> String {
    format!("{}{}", TASK_POD_PREFIX, task_id)
}

/// Inverse of [`derive_task_pod_name`]
pub fn extract_task_id(pod_name: &str) -> Option<&str> {
    pod_name
        .strip_prefix(TASK_POD_PREFIX)
        .filter(|rest| !rest.is_empty())
}

/// Check whether an object name carries one of the managed prefixes
pub fn has_managed_prefix(name: &str) -> bool {
    name.starts_with(SERVICE_OBJECT_PREFIX)
        || name.starts_with(TASK_SET_OBJECT_PREFIX)
        || name.starts_with(TASK_POD_PREFIX)
}

/// Check whether labels mark an object as managed
pub fn has_managed_label(labels: Option<&BTreeMap<String, String>>) -> bool {
    labels
        .and_then(|l| l.get(LABEL_MANAGED_BY))
        .is_some_and(|v| v == MANAGED_BY_VALUE)
}

/// Labels shared by every managed object in a cluster
pub fn managed_labels(cluster_name: &str) -> BTreeMap<String, String> {
    let mut labels = BTreeMap::new();
    labels.insert(LABEL_MANAGED_BY.to_string(), MANAGED_BY_VALUE.to_string());
    labels.insert(LABEL_CLUSTER.to_string(), cluster_name.to_string());
    labels
}

/// Validate that a name can be used verbatim as part of an object name
pub fn validate_dns_label(kind: &str, value: &str, max_len: usize) -> Result<()> {
    if value.is_empty() {
        return Err(ControlPlaneError::InvalidParameter(format!(
            "{} name is required",
            kind
        )));
    }
    if value.len() > max_len {
        return Err(ControlPlaneError::InvalidParameter(format!(
            "{} name '{}' exceeds {} characters",
            kind, value, max_len
        )));
    }
    if !DNS_LABEL_REGEX.is_match(value) {
        return Err(ControlPlaneError::InvalidParameter(format!(
            "{} name '{}' must consist of lowercase letters, digits and hyphens",
            kind, value
        )));
    }
    Ok(())
}

/// Validate a cluster name for the configured region
pub fn validate_cluster_name(name: &str, region: &str) -> Result<()> {
    let max = MAX_OBJECT_NAME_LEN.saturating_sub(region.len() + 1);
    validate_dns_label("Cluster", name, max)
}

/// Validate a service name
pub fn validate_service_name(name: &str) -> Result<()> {
    validate_dns_label("Service", name, MAX_SERVICE_NAME_LEN)
}

/// Validate the name of a service that runs task sets
pub fn validate_external_service_name(name: &str) -> Result<()> {
    validate_dns_label("Service", name, MAX_EXTERNAL_SERVICE_NAME_LEN)
}
