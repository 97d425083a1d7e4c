//! ECS resource records
//!
//! This module provides the records persisted in [`crate::storage`]:
//! - [`Cluster`], [`Service`], [`Task`], [`TaskSet`], [`TaskDefinition`]
//! - [`ContainerDefinition`] and its nested definitions
//! - Lifecycle enums serialized with their ECS wire names
//!
//! Field ownership is split between the two writers. The forward path owns
//! desired state (`desired_count`, `desired_status`, task definition, scale)
//! and the reverse path owns observed state (`running_count`, `pending_count`,
//! `last_status`, health, stability). The `absorb_observed` methods copy only
//! the observed half.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use validator::{Validate, ValidationError};

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        pub enum $name:ident {
            $($(#[$vmeta:meta])* $variant:ident => $wire:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub enum $name {
            $($(#[$vmeta])* #[serde(rename = $wire)] $variant),+
        }

        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $wire),+
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

wire_enum! {
    /// Cluster lifecycle
    pub enum ClusterStatus {
        Active => "ACTIVE",
        Provisioning => "PROVISIONING",
        Deprovisioning => "DEPROVISIONING",
        Failed => "FAILED",
        Inactive => "INACTIVE",
    }
}

wire_enum! {
    /// Service lifecycle
    pub enum ServiceStatus {
        /// Replicas match the desired count
        Active => "ACTIVE",
        /// Scaling down to zero or being deleted
        Draining => "DRAINING",
        /// Backing object is gone
        Inactive => "INACTIVE",
        /// No replica ready yet
        Provisioning => "PROVISIONING",
        /// Rollout in progress
        Updating => "UPDATING",
    }
}

wire_enum! {
    /// Task lifecycle, in transition order
    pub enum TaskStatus {
        Provisioning => "PROVISIONING",
        Pending => "PENDING",
        Activating => "ACTIVATING",
        Running => "RUNNING",
        Deactivating => "DEACTIVATING",
        Stopping => "STOPPING",
        Deprovisioning => "DEPROVISIONING",
        Stopped => "STOPPED",
    }
}

wire_enum! {
    /// Task and container health
    pub enum HealthStatus {
        Healthy => "HEALTHY",
        Unhealthy => "UNHEALTHY",
        Unknown => "UNKNOWN",
    }
}

wire_enum! {
    /// Task set role within its service
    pub enum TaskSetStatus {
        Primary => "PRIMARY",
        Active => "ACTIVE",
        Draining => "DRAINING",
    }
}

wire_enum! {
    /// Task set convergence
    pub enum StabilityStatus {
        SteadyState => "STEADY_STATE",
        Stabilizing => "STABILIZING",
    }
}

wire_enum! {
    pub enum TaskDefinitionStatus {
        Active => "ACTIVE",
        Inactive => "INACTIVE",
    }
}

wire_enum! {
    pub enum LaunchType {
        Ec2 => "EC2",
        Fargate => "FARGATE",
        External => "EXTERNAL",
    }
}

wire_enum! {
    pub enum SchedulingStrategy {
        Replica => "REPLICA",
        Daemon => "DAEMON",
    }
}

wire_enum! {
    /// Who drives rollouts: the service itself, or task sets
    pub enum DeploymentControllerType {
        Ecs => "ECS",
        External => "EXTERNAL",
    }
}

wire_enum! {
    pub enum NetworkMode {
        Bridge => "bridge",
        Host => "host",
        Awsvpc => "awsvpc",
        None => "none",
    }
}

wire_enum! {
    pub enum ScaleUnit {
        Percent => "PERCENT",
    }
}

impl TaskStatus {
    /// Terminal state
    pub fn is_stopped(&self) -> bool {
        matches!(self, TaskStatus::Stopped)
    }
}

impl Default for LaunchType {
    fn default() -> Self {
        LaunchType::Ec2
    }
}

/// Container Insights mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerInsights {
    Enabled,
    Disabled,
    Enhanced,
}

/// Cluster setting, one variant per supported setting name
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name", content = "value")]
pub enum ClusterSetting {
    #[serde(rename = "containerInsights")]
    ContainerInsights(ContainerInsights),
}

/// Resource tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Validate)]
pub struct Tag {
    #[validate(length(min = 1, max = 128, message = "tag key must be 1-128 characters"))]
    pub key: String,
    #[validate(length(max = 256, message = "tag value must be at most 256 characters"))]
    pub value: String,
}

impl Tag {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Validate a tag list at the API boundary
pub fn validate_tags(tags: &[Tag]) -> Result<(), ValidationError> {
    if tags.len() > 50 {
        return Err(ValidationError::new("too_many_tags")
            .with_message("a resource can have at most 50 tags".into()));
    }
    for tag in tags {
        if tag.validate().is_err() {
            return Err(ValidationError::new("invalid_tag")
                .with_message(format!("tag '{}' is invalid", tag.key).into()));
        }
    }
    Ok(())
}

// ============================================================================
// Cluster
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Cluster {
    pub cluster_arn: String,
    pub cluster_name: String,
    pub status: ClusterStatus,
    pub region: String,
    pub account_id: String,
    /// Namespace holding the cluster's workloads
    pub namespace: String,
    #[serde(default)]
    pub settings: Vec<ClusterSetting>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

// ============================================================================
// Service
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    pub service_arn: String,
    pub service_name: String,
    pub cluster_arn: String,
    pub task_definition_arn: String,
    pub launch_type: LaunchType,
    pub scheduling_strategy: SchedulingStrategy,
    pub deployment_controller: DeploymentControllerType,
    /// Written by the forward path only
    pub desired_count: u32,
    /// Written by the reverse path only
    pub running_count: u32,
    /// Written by the reverse path only
    pub pending_count: u32,
    pub status: ServiceStatus,
    pub namespace: String,
    /// Deployment backing the service
    pub object_name: String,
    #[serde(default)]
    pub tags: Vec<Tag>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl Service {
    /// Copy the observed half of `observed` onto this record
    pub fn absorb_observed(&mut self, observed: &Service) {
        self.status = observed.status;
        self.running_count = observed.running_count;
        self.pending_count = observed.pending_count;
        self.updated_at = observed.updated_at;
    }

    /// Whether the observed half differs
    pub fn observed_differs(&self, other: &Service) -> bool {
        self.status != other.status
            || self.running_count != other.running_count
            || self.pending_count != other.pending_count
    }
}

// ============================================================================
// Task
// ============================================================================

/// Observed state of one container in a task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerState {
    pub name: String,
    pub image: Option<String>,
    pub last_status: TaskStatus,
    pub exit_code: Option<i32>,
    pub reason: Option<String>,
    pub health_status: HealthStatus,
    pub runtime_id: Option<String>,
}

/// Network interface attached to a task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkAttachment {
    pub attachment_id: String,
    pub private_ipv4_address: Option<String>,
}

/// Per-container overrides supplied to RunTask
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerOverride {
    pub name: String,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: Vec<KeyValuePair>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Task {
    pub task_arn: String,
    pub task_id: String,
    pub cluster_arn: String,
    pub task_definition_arn: String,
    pub service_arn: Option<String>,
    pub task_set_arn: Option<String>,
    pub started_by: Option<String>,
    pub group: Option<String>,
    pub launch_type: LaunchType,
    /// Written by the reverse path only
    pub last_status: TaskStatus,
    pub desired_status: TaskStatus,
    pub health_status: HealthStatus,
    pub cpu: Option<String>,
    pub memory: Option<String>,
    #[serde(default)]
    pub containers: Vec<ContainerState>,
    #[serde(default)]
    pub overrides: Vec<ContainerOverride>,
    pub attachment: Option<NetworkAttachment>,
    pub pod_name: String,
    pub namespace: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopping_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub stopped_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl Task {
    /// Copy the observed half of `observed` onto this record
    pub fn absorb_observed(&mut self, observed: &Task) {
        self.last_status = observed.last_status;
        self.health_status = observed.health_status;
        self.containers = observed.containers.clone();
        self.attachment = observed.attachment.clone();
        self.started_at = observed.started_at.or(self.started_at);
        self.stopping_at = observed.stopping_at.or(self.stopping_at);
        self.stopped_at = observed.stopped_at.or(self.stopped_at);
        self.pod_name = observed.pod_name.clone();
        self.namespace = observed.namespace.clone();
        if observed.last_status.is_stopped() {
            self.desired_status = TaskStatus::Stopped;
        }
        // A reason set by StopTask wins over the observed one
        if self.stopped_reason.is_none() {
            self.stopped_reason = observed.stopped_reason.clone();
        }
        self.updated_at = observed.updated_at;
    }

    /// Whether the observed half differs
    pub fn observed_differs(&self, other: &Task) -> bool {
        self.last_status != other.last_status
            || self.health_status != other.health_status
            || self.containers != other.containers
            || self.attachment != other.attachment
            || self.stopped_at != other.stopped_at
    }
}

// ============================================================================
// Task set
// ============================================================================

/// Share of the service's desired count a task set runs
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Scale {
    pub value: f64,
    pub unit: ScaleUnit,
}

impl Scale {
    pub fn percent(value: f64) -> Self {
        Self {
            value,
            unit: ScaleUnit::Percent,
        }
    }

    /// Replicas for a service desired count, rounded up
    pub fn replicas_for(&self, service_desired: u32) -> u32 {
        let value = self.value.clamp(0.0, 100.0);
        (service_desired as f64 * value / 100.0).ceil() as u32
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSet {
    pub id: String,
    pub task_set_arn: String,
    pub service_arn: String,
    pub cluster_arn: String,
    pub external_id: Option<String>,
    pub task_definition_arn: String,
    pub launch_type: LaunchType,
    pub scale: Scale,
    pub computed_desired_count: u32,
    /// Written by the reverse path only
    pub running_count: u32,
    /// Written by the reverse path only
    pub pending_count: u32,
    pub status: TaskSetStatus,
    pub stability_status: StabilityStatus,
    pub stability_status_at: DateTime<Utc>,
    pub namespace: String,
    pub object_name: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub version: u64,
}

impl TaskSet {
    /// Copy the observed half of `observed` onto this record
    pub fn absorb_observed(&mut self, observed: &TaskSet) {
        self.running_count = observed.running_count;
        self.pending_count = observed.pending_count;
        if self.stability_status != observed.stability_status {
            self.stability_status = observed.stability_status;
            self.stability_status_at = observed.stability_status_at;
        }
        if observed.status == TaskSetStatus::Draining {
            self.status = TaskSetStatus::Draining;
        }
        self.updated_at = observed.updated_at;
    }

    /// Whether the observed half differs
    pub fn observed_differs(&self, other: &TaskSet) -> bool {
        self.running_count != other.running_count
            || self.pending_count != other.pending_count
            || self.stability_status != other.stability_status
            || (other.status == TaskSetStatus::Draining && self.status != other.status)
    }
}

// ============================================================================
// Task definition
// ============================================================================

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct KeyValuePair {
    #[validate(length(min = 1, message = "environment variable name is required"))]
    pub name: String,
    #[serde(default)]
    pub value: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PortMapping {
    pub container_port: u16,
    pub host_port: Option<u16>,
    /// `tcp` (default), `udp` or `sctp`
    pub protocol: Option<String>,
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,
    /// Secrets Manager or SSM parameter ARN
    pub value_from: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MountPoint {
    pub source_volume: String,
    pub container_path: String,
    pub read_only: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheck {
    /// `["CMD-SHELL", "..."]` or `["CMD", "exe", "arg"]`
    pub command: Vec<String>,
    pub interval: Option<i32>,
    pub timeout: Option<i32>,
    pub retries: Option<i32>,
    pub start_period: Option<i32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostVolume {
    pub source_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Volume {
    pub name: String,
    pub host: Option<HostVolume>,
}

/// One container of a task definition
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct ContainerDefinition {
    #[validate(length(min = 1, max = 255, message = "container name must be 1-255 characters"))]
    pub name: String,
    #[validate(length(min = 1, max = 255, message = "container image must be 1-255 characters"))]
    pub image: String,
    /// CPU units (1024 per vCPU)
    pub cpu: Option<u32>,
    /// Hard memory limit in MiB
    pub memory: Option<u32>,
    /// Soft memory limit in MiB
    pub memory_reservation: Option<u32>,
    #[serde(default)]
    pub port_mappings: Vec<PortMapping>,
    pub essential: Option<bool>,
    #[serde(default)]
    pub entry_point: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    #[validate(nested)]
    pub environment: Vec<KeyValuePair>,
    #[serde(default)]
    pub secrets: Vec<SecretRef>,
    #[serde(default)]
    pub mount_points: Vec<MountPoint>,
    pub health_check: Option<HealthCheck>,
    pub user: Option<String>,
    pub working_directory: Option<String>,
    pub privileged: Option<bool>,
    pub readonly_root_filesystem: Option<bool>,
    #[serde(default)]
    pub docker_labels: BTreeMap<String, String>,
    /// Fields this control plane does not translate
    #[serde(flatten)]
    pub unsupported: BTreeMap<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDefinition {
    pub task_definition_arn: String,
    pub family: String,
    pub revision: u32,
    pub container_definitions: Vec<ContainerDefinition>,
    /// Task CPU, `"256"` or `"0.25 vCPU"`
    pub cpu: Option<String>,
    /// Task memory, `"512"` or `"1GB"`
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
    pub status: TaskDefinitionStatus,
    pub registered_at: DateTime<Utc>,
    pub deregistered_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub tags: Vec<Tag>,
    #[serde(default)]
    pub version: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names() {
        assert_eq!(
            serde_json::to_string(&StabilityStatus::SteadyState).unwrap(),
            "\"STEADY_STATE\""
        );
        assert_eq!(LaunchType::Fargate.to_string(), "FARGATE");
        let status: ServiceStatus = serde_json::from_str("\"DRAINING\"").unwrap();
        assert_eq!(status, ServiceStatus::Draining);
    }

    #[test]
    fn test_cluster_setting_is_tagged() {
        let setting: ClusterSetting =
            serde_json::from_str(r#"{"name":"containerInsights","value":"enabled"}"#).unwrap();
        assert_eq!(
            setting,
            ClusterSetting::ContainerInsights(ContainerInsights::Enabled)
        );
        assert!(serde_json::from_str::<ClusterSetting>(r#"{"name":"bogus","value":"x"}"#).is_err());
    }

    #[test]
    fn test_scale_rounds_up() {
        assert_eq!(Scale::percent(50.0).replicas_for(3), 2);
        assert_eq!(Scale::percent(100.0).replicas_for(3), 3);
        assert_eq!(Scale::percent(0.0).replicas_for(3), 0);
        assert_eq!(Scale::percent(150.0).replicas_for(2), 2);
    }

    #[test]
    fn test_container_definition_captures_unsupported_fields() {
        let def: ContainerDefinition = serde_json::from_str(
            r#"{"name":"web","image":"nginx","links":["db"],"portMappings":[{"containerPort":80}]}"#,
        )
        .unwrap();
        assert_eq!(def.port_mappings[0].container_port, 80);
        assert!(def.unsupported.contains_key("links"));
        assert!(def.validate().is_ok());
    }

    #[test]
    fn test_tag_validation() {
        assert!(validate_tags(&[Tag::new("team", "core")]).is_ok());
        assert!(validate_tags(&[Tag::new("", "x")]).is_err());
        let many: Vec<Tag> = (0..51).map(|i| Tag::new(format!("k{}", i), "v")).collect();
        assert!(validate_tags(&many).is_err());
    }
}
