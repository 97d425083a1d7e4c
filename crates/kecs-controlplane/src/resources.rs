//! Kubernetes Resource Builders
//!
//! This module generates Kubernetes manifests (Deployment, Pod) from ECS task
//! definitions. Container definition fields without a Kubernetes counterpart
//! are skipped and reported as [`MappingWarning`]s.

use crate::error::{ControlPlaneError, Result};
use crate::naming::{self, LABEL_LAUNCH_TYPE, LABEL_SERVICE, LABEL_TASK_FAMILY, LABEL_TASK_ID,
    LABEL_TASK_REVISION, LABEL_TASK_SET};
use crate::types::{
    ContainerDefinition, ContainerOverride, HealthCheck, NetworkMode, Service, Task,
    TaskDefinition, TaskSet,
};
use k8s_openapi::api::apps::v1::{
    Deployment, DeploymentSpec, DeploymentStrategy, RollingUpdateDeployment,
};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, EnvVar, EnvVarSource, ExecAction,
    HostPathVolumeSource, Pod, PodSpec, PodTemplateSpec, Probe, ResourceRequirements,
    SecretKeySelector, SecurityContext, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::BTreeMap;
use std::fmt;
use tracing::warn;

/// ECS health check defaults (seconds / attempts)
const DEFAULT_HEALTH_INTERVAL: i32 = 30;
const DEFAULT_HEALTH_TIMEOUT: i32 = 5;
const DEFAULT_HEALTH_RETRIES: i32 = 3;
const DEFAULT_HEALTH_START_PERIOD: i32 = 0;

/// Readiness should not wait as long as liveness grace
const MAX_READINESS_INITIAL_DELAY: i32 = 10;

/// CPU units per vCPU
const CPU_UNITS_PER_VCPU: u64 = 1024;

/// Key holding the secret payload in generated secret references
const SECRET_VALUE_KEY: &str = "value";

/// A container definition field that was not translated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MappingWarning {
    pub container: Option<String>,
    pub field: String,
    pub message: String,
}

impl MappingWarning {
    fn new(container: Option<&str>, field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            container: container.map(str::to_string),
            field: field.into(),
            message: message.into(),
        }
    }
}

impl fmt::Display for MappingWarning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.container {
            Some(c) => write!(f, "container {}: {}: {}", c, self.field, self.message),
            None => write!(f, "{}: {}", self.field, self.message),
        }
    }
}

/// Parse task-level CPU (`"256"`, `"0.25 vCPU"`) into CPU units
pub fn parse_task_cpu(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    let lower = trimmed.to_ascii_lowercase();
    if let Some(vcpu) = lower.strip_suffix("vcpu") {
        let vcpu: f64 = vcpu.trim().parse().ok()?;
        if vcpu <= 0.0 {
            return None;
        }
        return Some((vcpu * CPU_UNITS_PER_VCPU as f64).round() as u64);
    }
    trimmed.parse().ok().filter(|units| *units > 0)
}

/// Parse task-level memory (`"512"`, `"1GB"`, `"2 GB"`) into MiB
pub fn parse_task_memory(value: &str) -> Option<u64> {
    let trimmed = value.trim();
    let lower = trimmed.to_ascii_lowercase();
    if let Some(gb) = lower.strip_suffix("gb") {
        let gb: f64 = gb.trim().parse().ok()?;
        if gb <= 0.0 {
            return None;
        }
        return Some((gb * 1024.0).round() as u64);
    }
    trimmed.parse().ok().filter(|mib| *mib > 0)
}

/// CPU units to a millicore quantity
fn cpu_quantity(units: u64) -> Quantity {
    Quantity(format!("{}m", (units * 1000 / CPU_UNITS_PER_VCPU).max(1)))
}

fn memory_quantity(mib: u64) -> Quantity {
    Quantity(format!("{}Mi", mib))
}

/// Lowercase DNS-subdomain form of an arbitrary string
fn sanitize_name(value: &str, max_len: usize) -> String {
    let mapped: String = value
        .chars()
        .map(|c| {
            let c = c.to_ascii_lowercase();
            if c.is_ascii_alphanumeric() || c == '-' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .collect();
    let mut name: String = mapped
        .trim_matches(|c: char| !c.is_ascii_alphanumeric())
        .chars()
        .take(max_len)
        .collect();
    while name.ends_with(|c: char| !c.is_ascii_alphanumeric()) {
        name.pop();
    }
    name
}

/// Label values are at most 63 characters and must start and end alphanumeric
fn label_value(value: &str) -> String {
    let mut v: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '-'
            }
        })
        .take(63)
        .collect();
    while v.ends_with(|c: char| !c.is_ascii_alphanumeric()) {
        v.pop();
    }
    v.trim_start_matches(|c: char| !c.is_ascii_alphanumeric())
        .to_string()
}

/// Kubernetes secret name for a Secrets Manager or SSM parameter ARN
pub fn secret_name_for(value_from: &str) -> Option<String> {
    let mut parts = value_from.splitn(6, ':');
    let (arn, _partition, service, _region, _account) = (
        parts.next()?,
        parts.next()?,
        parts.next()?,
        parts.next()?,
        parts.next()?,
    );
    let resource = parts.next()?;
    if arn != "arn" {
        return None;
    }
    let name = match service {
        "secretsmanager" => {
            let secret = resource.strip_prefix("secret:")?;
            // Drop the JSON key / version suffix: name:json-key:version-stage:version-id
            let secret = secret.split(':').next()?;
            format!("sm-{}", sanitize_name(secret, 240))
        }
        "ssm" => {
            let parameter = resource.strip_prefix("parameter")?;
            format!("ssm-{}", sanitize_name(parameter, 240))
        }
        _ => return None,
    };
    (name.len() > 4).then_some(name)
}

/// Convert an ECS health check into a probe
fn health_check_probe(check: &HealthCheck, readiness: bool) -> Option<Probe> {
    let (kind, rest) = check.command.split_first()?;
    let command = match kind.as_str() {
        "CMD-SHELL" => vec!["sh".to_string(), "-c".to_string(), rest.join(" ")],
        "CMD" => rest.to_vec(),
        "NONE" => return None,
        _ => check.command.clone(),
    };
    if command.is_empty() {
        return None;
    }

    let start_period = check.start_period.unwrap_or(DEFAULT_HEALTH_START_PERIOD);
    Some(Probe {
        exec: Some(ExecAction {
            command: Some(command),
        }),
        period_seconds: Some(check.interval.unwrap_or(DEFAULT_HEALTH_INTERVAL)),
        timeout_seconds: Some(check.timeout.unwrap_or(DEFAULT_HEALTH_TIMEOUT)),
        failure_threshold: Some(check.retries.unwrap_or(DEFAULT_HEALTH_RETRIES)),
        initial_delay_seconds: Some(if readiness {
            start_period.min(MAX_READINESS_INITIAL_DELAY)
        } else {
            start_period
        }),
        success_threshold: Some(1),
        ..Default::default()
    })
}

/// Parse `uid[:gid]`
fn parse_user(user: &str) -> Option<(i64, Option<i64>)> {
    match user.split_once(':') {
        Some((uid, gid)) => Some((uid.parse().ok()?, Some(gid.parse().ok()?))),
        None => Some((user.parse().ok()?, None)),
    }
}

/// Per-container share of task-level resources
#[derive(Debug, Clone, Copy, Default)]
struct TaskShare {
    cpu_units: Option<u64>,
    memory_mib: Option<u64>,
}

/// Build the pod spec for a task definition
///
/// `overrides` replace the command and merge environment variables per
/// container name.
pub fn build_pod_spec(
    task_definition: &TaskDefinition,
    overrides: &[ContainerOverride],
) -> (PodSpec, Vec<MappingWarning>) {
    let mut warnings = Vec::new();
    let container_count = task_definition.container_definitions.len().max(1) as u64;

    let task_cpu = task_definition.cpu.as_deref().and_then(|raw| {
        let parsed = parse_task_cpu(raw);
        if parsed.is_none() {
            warnings.push(MappingWarning::new(None, "cpu", format!("unrecognized task cpu '{}'", raw)));
        }
        parsed
    });
    let task_memory = task_definition.memory.as_deref().and_then(|raw| {
        let parsed = parse_task_memory(raw);
        if parsed.is_none() {
            warnings.push(MappingWarning::new(
                None,
                "memory",
                format!("unrecognized task memory '{}'", raw),
            ));
        }
        parsed
    });
    let share = TaskShare {
        cpu_units: task_cpu.map(|c| c / container_count),
        memory_mib: task_memory.map(|m| m / container_count),
    };

    let volume_names: BTreeMap<&str, String> = task_definition
        .volumes
        .iter()
        .map(|v| (v.name.as_str(), sanitize_name(&v.name, 63)))
        .collect();

    let host_network = task_definition.network_mode == Some(NetworkMode::Host);

    let containers = task_definition
        .container_definitions
        .iter()
        .map(|def| {
            let container_override = overrides.iter().find(|o| o.name == def.name);
            build_container(
                def,
                container_override,
                share,
                host_network,
                &volume_names,
                &mut warnings,
            )
        })
        .collect();

    let volumes: Vec<Volume> = task_definition
        .volumes
        .iter()
        .map(|v| {
            let name = sanitize_name(&v.name, 63);
            match v.host.as_ref().and_then(|h| h.source_path.clone()) {
                Some(path) => Volume {
                    name,
                    host_path: Some(HostPathVolumeSource {
                        path,
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                None => Volume {
                    name,
                    empty_dir: Some(EmptyDirVolumeSource::default()),
                    ..Default::default()
                },
            }
        })
        .collect();

    if task_definition.task_role_arn.is_some() {
        warnings.push(MappingWarning::new(
            None,
            "taskRoleArn",
            "task roles are not mapped to service accounts",
        ));
    }

    let spec = PodSpec {
        containers,
        volumes: if volumes.is_empty() { None } else { Some(volumes) },
        host_network: host_network.then_some(true),
        host_pid: (task_definition.pid_mode.as_deref() == Some("host")).then_some(true),
        host_ipc: (task_definition.ipc_mode.as_deref() == Some("host")).then_some(true),
        ..Default::default()
    };

    for warning in &warnings {
        warn!(family = %task_definition.family, warning = %warning, "Container definition field not mapped");
    }

    (spec, warnings)
}

fn build_container(
    def: &ContainerDefinition,
    container_override: Option<&ContainerOverride>,
    share: TaskShare,
    host_network: bool,
    volume_names: &BTreeMap<&str, String>,
    warnings: &mut Vec<MappingWarning>,
) -> Container {
    let container = Some(def.name.as_str());

    // Environment: definition, then overrides by name, then secrets
    let mut env: Vec<EnvVar> = def
        .environment
        .iter()
        .map(|kv| EnvVar {
            name: kv.name.clone(),
            value: Some(kv.value.clone()),
            ..Default::default()
        })
        .collect();
    if let Some(o) = container_override {
        for kv in &o.environment {
            match env.iter_mut().find(|e| e.name == kv.name) {
                Some(existing) => existing.value = Some(kv.value.clone()),
                None => env.push(EnvVar {
                    name: kv.name.clone(),
                    value: Some(kv.value.clone()),
                    ..Default::default()
                }),
            }
        }
    }
    for secret in &def.secrets {
        match secret_name_for(&secret.value_from) {
            Some(secret_name) => env.push(EnvVar {
                name: secret.name.clone(),
                value_from: Some(EnvVarSource {
                    secret_key_ref: Some(SecretKeySelector {
                        name: secret_name,
                        key: SECRET_VALUE_KEY.to_string(),
                        ..Default::default()
                    }),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            None => warnings.push(MappingWarning::new(
                container,
                "secrets",
                format!("unsupported valueFrom '{}'", secret.value_from),
            )),
        }
    }

    let ports: Vec<ContainerPort> = def
        .port_mappings
        .iter()
        .map(|pm| {
            let protocol = match pm.protocol.as_deref().map(str::to_ascii_lowercase).as_deref() {
                None | Some("tcp") => "TCP",
                Some("udp") => "UDP",
                Some("sctp") => "SCTP",
                Some(other) => {
                    warnings.push(MappingWarning::new(
                        container,
                        "portMappings.protocol",
                        format!("unknown protocol '{}', using TCP", other),
                    ));
                    "TCP"
                }
            };
            let host_port = if host_network {
                Some(i32::from(pm.container_port))
            } else {
                pm.host_port.filter(|p| *p != 0).map(i32::from)
            };
            let name = pm.name.as_deref().and_then(|n| {
                let sanitized = sanitize_name(n, 15);
                if sanitized.is_empty() || !sanitized.chars().any(|c| c.is_ascii_alphabetic()) {
                    warnings.push(MappingWarning::new(
                        container,
                        "portMappings.name",
                        format!("'{}' is not a valid port name", n),
                    ));
                    None
                } else {
                    Some(sanitized)
                }
            });
            ContainerPort {
                container_port: i32::from(pm.container_port),
                host_port,
                protocol: Some(protocol.to_string()),
                name,
                ..Default::default()
            }
        })
        .collect();

    let mut requests = BTreeMap::new();
    let mut limits = BTreeMap::new();
    match def.cpu.filter(|c| *c > 0) {
        Some(units) => {
            requests.insert("cpu".to_string(), cpu_quantity(u64::from(units)));
        }
        None => {
            if let Some(units) = share.cpu_units.filter(|c| *c > 0) {
                requests.insert("cpu".to_string(), cpu_quantity(units));
                limits.insert("cpu".to_string(), cpu_quantity(units));
            }
        }
    }
    match (def.memory, def.memory_reservation) {
        (None, None) => {
            if let Some(mib) = share.memory_mib.filter(|m| *m > 0) {
                requests.insert("memory".to_string(), memory_quantity(mib));
                limits.insert("memory".to_string(), memory_quantity(mib));
            }
        }
        (hard, soft) => {
            if let Some(hard) = hard {
                limits.insert("memory".to_string(), memory_quantity(u64::from(hard)));
            }
            if let Some(soft) = soft.or(hard) {
                requests.insert("memory".to_string(), memory_quantity(u64::from(soft)));
            }
        }
    }
    let resources = if requests.is_empty() && limits.is_empty() {
        None
    } else {
        Some(ResourceRequirements {
            requests: (!requests.is_empty()).then_some(requests),
            limits: (!limits.is_empty()).then_some(limits),
            ..Default::default()
        })
    };

    let mut volume_mounts = Vec::new();
    for mp in &def.mount_points {
        match volume_names.get(mp.source_volume.as_str()) {
            Some(volume) => volume_mounts.push(VolumeMount {
                name: volume.clone(),
                mount_path: mp.container_path.clone(),
                read_only: mp.read_only,
                ..Default::default()
            }),
            None => warnings.push(MappingWarning::new(
                container,
                "mountPoints",
                format!("volume '{}' is not defined", mp.source_volume),
            )),
        }
    }

    let (run_as_user, run_as_group) = match def.user.as_deref() {
        Some(user) => match parse_user(user) {
            Some((uid, gid)) => (Some(uid), gid),
            None => {
                warnings.push(MappingWarning::new(
                    container,
                    "user",
                    format!("'{}' is not a numeric uid[:gid]", user),
                ));
                (None, None)
            }
        },
        None => (None, None),
    };
    let security_context = if def.privileged.is_some()
        || def.readonly_root_filesystem.is_some()
        || run_as_user.is_some()
    {
        Some(SecurityContext {
            privileged: def.privileged,
            read_only_root_filesystem: def.readonly_root_filesystem,
            run_as_user,
            run_as_group,
            ..Default::default()
        })
    } else {
        None
    };

    if !def.docker_labels.is_empty() {
        warnings.push(MappingWarning::new(
            container,
            "dockerLabels",
            "container labels have no pod equivalent",
        ));
    }
    for field in def.unsupported.keys() {
        warnings.push(MappingWarning::new(container, field.clone(), "field is not supported"));
    }

    let args = match container_override {
        Some(o) if !o.command.is_empty() => Some(o.command.clone()),
        _ if !def.command.is_empty() => Some(def.command.clone()),
        _ => None,
    };

    Container {
        name: def.name.clone(),
        image: Some(def.image.clone()),
        command: (!def.entry_point.is_empty()).then(|| def.entry_point.clone()),
        args,
        env: (!env.is_empty()).then_some(env),
        ports: (!ports.is_empty()).then_some(ports),
        resources,
        liveness_probe: def
            .health_check
            .as_ref()
            .and_then(|h| health_check_probe(h, false)),
        readiness_probe: def
            .health_check
            .as_ref()
            .and_then(|h| health_check_probe(h, true)),
        working_dir: def.working_directory.clone(),
        security_context,
        volume_mounts: (!volume_mounts.is_empty()).then_some(volume_mounts),
        ..Default::default()
    }
}

/// Builder for Kubernetes objects in one cluster namespace
pub struct ResourceBuilder<'a> {
    task_definition: &'a TaskDefinition,
    cluster_name: &'a str,
    namespace: &'a str,
}

impl<'a> ResourceBuilder<'a> {
    /// Create a new resource builder
    pub fn new(
        task_definition: &'a TaskDefinition,
        cluster_name: &'a str,
        namespace: &'a str,
    ) -> Result<Self> {
        if task_definition.container_definitions.is_empty() {
            return Err(ControlPlaneError::InvalidParameter(format!(
                "task definition {} has no container definitions",
                task_definition.task_definition_arn
            )));
        }
        Ok(Self {
            task_definition,
            cluster_name,
            namespace,
        })
    }

    /// Labels carried by every object built from this task definition
    fn base_labels(&self) -> BTreeMap<String, String> {
        let mut labels = naming::managed_labels(self.cluster_name);
        labels.insert(
            LABEL_TASK_FAMILY.to_string(),
            label_value(&self.task_definition.family),
        );
        labels.insert(
            LABEL_TASK_REVISION.to_string(),
            self.task_definition.revision.to_string(),
        );
        labels
    }

    fn deployment(
        &self,
        name: String,
        replicas: u32,
        selector: BTreeMap<String, String>,
        annotations: BTreeMap<String, String>,
    ) -> (Deployment, Vec<MappingWarning>) {
        let (pod_spec, warnings) = build_pod_spec(self.task_definition, &[]);

        let mut labels = self.base_labels();
        labels.extend(selector.clone());

        let deployment = Deployment {
            metadata: ObjectMeta {
                name: Some(name),
                namespace: Some(self.namespace.to_string()),
                labels: Some(labels.clone()),
                annotations: Some(annotations.clone()),
                ..Default::default()
            },
            spec: Some(DeploymentSpec {
                replicas: Some(replicas.min(i32::MAX as u32) as i32),
                selector: LabelSelector {
                    match_labels: Some(selector),
                    ..Default::default()
                },
                template: PodTemplateSpec {
                    metadata: Some(ObjectMeta {
                        labels: Some(labels),
                        annotations: Some(annotations),
                        ..Default::default()
                    }),
                    spec: Some(pod_spec),
                },
                strategy: Some(DeploymentStrategy {
                    type_: Some("RollingUpdate".to_string()),
                    rolling_update: Some(RollingUpdateDeployment {
                        max_surge: Some(IntOrString::String("25%".to_string())),
                        max_unavailable: Some(IntOrString::String("25%".to_string())),
                    }),
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        (deployment, warnings)
    }

    /// Build the Deployment backing a service
    pub fn build_service_deployment(&self, service: &Service) -> (Deployment, Vec<MappingWarning>) {
        let mut selector = naming::managed_labels(self.cluster_name);
        selector.insert(LABEL_SERVICE.to_string(), service.service_name.clone());
        selector.insert(
            LABEL_LAUNCH_TYPE.to_string(),
            service.launch_type.as_str().to_string(),
        );

        let mut annotations = BTreeMap::new();
        annotations.insert(
            naming::ANNOTATION_SERVICE_ARN.to_string(),
            service.service_arn.clone(),
        );
        annotations.insert(
            naming::ANNOTATION_TASK_DEFINITION_ARN.to_string(),
            self.task_definition.task_definition_arn.clone(),
        );

        self.deployment(
            service.object_name.clone(),
            service.desired_count,
            selector,
            annotations,
        )
    }

    /// Build the Deployment backing a task set
    pub fn build_task_set_deployment(
        &self,
        service: &Service,
        task_set: &TaskSet,
    ) -> (Deployment, Vec<MappingWarning>) {
        let digits = task_set
            .id
            .strip_prefix(naming::TASK_SET_ID_PREFIX)
            .unwrap_or(&task_set.id);

        let mut selector = naming::managed_labels(self.cluster_name);
        selector.insert(LABEL_SERVICE.to_string(), service.service_name.clone());
        selector.insert(LABEL_TASK_SET.to_string(), digits.to_string());
        selector.insert(
            LABEL_LAUNCH_TYPE.to_string(),
            task_set.launch_type.as_str().to_string(),
        );

        let mut annotations = BTreeMap::new();
        annotations.insert(
            naming::ANNOTATION_SERVICE_ARN.to_string(),
            service.service_arn.clone(),
        );
        annotations.insert(
            naming::ANNOTATION_TASK_SET_ARN.to_string(),
            task_set.task_set_arn.clone(),
        );
        annotations.insert(
            naming::ANNOTATION_TASK_DEFINITION_ARN.to_string(),
            self.task_definition.task_definition_arn.clone(),
        );

        self.deployment(
            task_set.object_name.clone(),
            task_set.computed_desired_count,
            selector,
            annotations,
        )
    }

    /// Build the pod for an ad-hoc task
    pub fn build_task_pod(&self, task: &Task) -> (Pod, Vec<MappingWarning>) {
        let (mut pod_spec, warnings) = build_pod_spec(self.task_definition, &task.overrides);
        pod_spec.restart_policy = Some("Never".to_string());

        let mut labels = self.base_labels();
        labels.insert(LABEL_TASK_ID.to_string(), task.task_id.clone());
        labels.insert(
            LABEL_LAUNCH_TYPE.to_string(),
            task.launch_type.as_str().to_string(),
        );

        let mut annotations = BTreeMap::new();
        annotations.insert(naming::ANNOTATION_TASK_ARN.to_string(), task.task_arn.clone());
        annotations.insert(
            naming::ANNOTATION_TASK_DEFINITION_ARN.to_string(),
            task.task_definition_arn.clone(),
        );
        if let Some(started_by) = &task.started_by {
            annotations.insert(naming::ANNOTATION_STARTED_BY.to_string(), started_by.clone());
        }

        let pod = Pod {
            metadata: ObjectMeta {
                name: Some(task.pod_name.clone()),
                namespace: Some(self.namespace.to_string()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            spec: Some(pod_spec),
            ..Default::default()
        };

        (pod, warnings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{
        HostVolume, KeyValuePair, LaunchType, MountPoint, PortMapping, SecretRef,
        TaskDefinitionStatus,
    };
    use chrono::Utc;

    fn create_test_task_definition() -> TaskDefinition {
        TaskDefinition {
            task_definition_arn: "arn:aws:ecs:us-east-1:000000000000:task-definition/web:1"
                .to_string(),
            family: "web".to_string(),
            revision: 1,
            container_definitions: vec![ContainerDefinition {
                name: "nginx".to_string(),
                image: "nginx:1.27".to_string(),
                cpu: Some(256),
                memory: Some(512),
                port_mappings: vec![PortMapping {
                    container_port: 80,
                    protocol: Some("tcp".to_string()),
                    ..Default::default()
                }],
                environment: vec![KeyValuePair {
                    name: "MODE".to_string(),
                    value: "prod".to_string(),
                }],
                entry_point: vec!["/docker-entrypoint.sh".to_string()],
                command: vec!["nginx".to_string(), "-g".to_string(), "daemon off;".to_string()],
                health_check: Some(HealthCheck {
                    command: vec!["CMD-SHELL".to_string(), "curl -f http://localhost/".to_string()],
                    interval: Some(15),
                    start_period: Some(60),
                    ..Default::default()
                }),
                ..Default::default()
            }],
            cpu: None,
            memory: None,
            network_mode: Some(NetworkMode::Bridge),
            pid_mode: None,
            ipc_mode: None,
            task_role_arn: None,
            execution_role_arn: None,
            volumes: vec![],
            requires_compatibilities: vec![LaunchType::Ec2],
            status: TaskDefinitionStatus::Active,
            registered_at: Utc::now(),
            deregistered_at: None,
            tags: vec![],
            version: 0,
        }
    }

    #[test]
    fn test_container_mapping() {
        let td = create_test_task_definition();
        let (spec, warnings) = build_pod_spec(&td, &[]);
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);

        let c = &spec.containers[0];
        assert_eq!(c.image.as_deref(), Some("nginx:1.27"));
        assert_eq!(c.command.as_ref().unwrap()[0], "/docker-entrypoint.sh");
        assert_eq!(c.args.as_ref().unwrap()[0], "nginx");

        let resources = c.resources.as_ref().unwrap();
        assert_eq!(resources.requests.as_ref().unwrap()["cpu"], Quantity("250m".into()));
        assert_eq!(resources.limits.as_ref().unwrap()["memory"], Quantity("512Mi".into()));

        let port = &c.ports.as_ref().unwrap()[0];
        assert_eq!(port.container_port, 80);
        assert_eq!(port.protocol.as_deref(), Some("TCP"));
        assert_eq!(port.host_port, None);
    }

    #[test]
    fn test_health_check_probes() {
        let td = create_test_task_definition();
        let (spec, _) = build_pod_spec(&td, &[]);
        let c = &spec.containers[0];

        let liveness = c.liveness_probe.as_ref().unwrap();
        let command = liveness.exec.as_ref().unwrap().command.as_ref().unwrap();
        assert_eq!(command, &vec!["sh", "-c", "curl -f http://localhost/"]);
        assert_eq!(liveness.period_seconds, Some(15));
        assert_eq!(liveness.timeout_seconds, Some(5));
        assert_eq!(liveness.failure_threshold, Some(3));
        assert_eq!(liveness.initial_delay_seconds, Some(60));

        let readiness = c.readiness_probe.as_ref().unwrap();
        assert_eq!(readiness.initial_delay_seconds, Some(10));
    }

    #[test]
    fn test_task_level_resources_are_shared() {
        let mut td = create_test_task_definition();
        td.cpu = Some("1 vCPU".to_string());
        td.memory = Some("2GB".to_string());
        let mut sidecar = td.container_definitions[0].clone();
        sidecar.name = "sidecar".to_string();
        sidecar.cpu = None;
        sidecar.memory = None;
        sidecar.health_check = None;
        td.container_definitions.push(sidecar);

        let (spec, _) = build_pod_spec(&td, &[]);
        let sidecar = &spec.containers[1];
        let resources = sidecar.resources.as_ref().unwrap();
        assert_eq!(resources.limits.as_ref().unwrap()["cpu"], Quantity("500m".into()));
        assert_eq!(resources.limits.as_ref().unwrap()["memory"], Quantity("1024Mi".into()));
    }

    #[test]
    fn test_unmapped_fields_are_warnings() {
        let mut td = create_test_task_definition();
        let def = &mut td.container_definitions[0];
        def.unsupported
            .insert("links".to_string(), serde_json::json!(["db"]));
        def.user = Some("nginx".to_string());
        def.secrets.push(SecretRef {
            name: "TOKEN".to_string(),
            value_from: "not-an-arn".to_string(),
        });
        def.mount_points.push(MountPoint {
            source_volume: "missing".to_string(),
            container_path: "/data".to_string(),
            read_only: None,
        });

        let (spec, warnings) = build_pod_spec(&td, &[]);
        let fields: Vec<&str> = warnings.iter().map(|w| w.field.as_str()).collect();
        assert!(fields.contains(&"links"));
        assert!(fields.contains(&"user"));
        assert!(fields.contains(&"secrets"));
        assert!(fields.contains(&"mountPoints"));
        assert_eq!(spec.containers.len(), 1);
    }

    #[test]
    fn test_secrets_and_volumes() {
        let mut td = create_test_task_definition();
        td.volumes.push(crate::types::Volume {
            name: "Logs_Dir".to_string(),
            host: Some(HostVolume {
                source_path: Some("/var/log".to_string()),
            }),
        });
        td.volumes.push(crate::types::Volume {
            name: "scratch".to_string(),
            host: None,
        });
        let def = &mut td.container_definitions[0];
        def.secrets.push(SecretRef {
            name: "DB_PASSWORD".to_string(),
            value_from: "arn:aws:secretsmanager:us-east-1:000000000000:secret:prod/db-AbCdEf"
                .to_string(),
        });
        def.mount_points.push(MountPoint {
            source_volume: "Logs_Dir".to_string(),
            container_path: "/logs".to_string(),
            read_only: Some(true),
        });

        let (spec, warnings) = build_pod_spec(&td, &[]);
        assert!(warnings.is_empty(), "unexpected warnings: {:?}", warnings);

        let env = spec.containers[0].env.as_ref().unwrap();
        let secret = env.iter().find(|e| e.name == "DB_PASSWORD").unwrap();
        let selector = secret
            .value_from
            .as_ref()
            .unwrap()
            .secret_key_ref
            .as_ref()
            .unwrap();
        assert_eq!(selector.name, "sm-prod-db-abcdef");
        assert_eq!(selector.key, "value");

        let volumes = spec.volumes.unwrap();
        assert_eq!(volumes[0].name, "logs-dir");
        assert!(volumes[0].host_path.is_some());
        assert!(volumes[1].empty_dir.is_some());
        let mount = &spec.containers[0].volume_mounts.as_ref().unwrap()[0];
        assert_eq!(mount.name, "logs-dir");
        assert_eq!(mount.read_only, Some(true));
    }

    #[test]
    fn test_overrides() {
        let td = create_test_task_definition();
        let overrides = vec![ContainerOverride {
            name: "nginx".to_string(),
            command: vec!["echo".to_string(), "hi".to_string()],
            environment: vec![KeyValuePair {
                name: "MODE".to_string(),
                value: "test".to_string(),
            }],
        }];
        let (spec, _) = build_pod_spec(&td, &overrides);
        let c = &spec.containers[0];
        assert_eq!(c.args.as_ref().unwrap(), &vec!["echo", "hi"]);
        let env = c.env.as_ref().unwrap();
        assert_eq!(env.len(), 1);
        assert_eq!(env[0].value.as_deref(), Some("test"));
    }

    #[test]
    fn test_host_network() {
        let mut td = create_test_task_definition();
        td.network_mode = Some(NetworkMode::Host);
        td.pid_mode = Some("host".to_string());
        let (spec, _) = build_pod_spec(&td, &[]);
        assert_eq!(spec.host_network, Some(true));
        assert_eq!(spec.host_pid, Some(true));
        assert_eq!(spec.host_ipc, None);
        let port = &spec.containers[0].ports.as_ref().unwrap()[0];
        assert_eq!(port.host_port, Some(80));
    }

    #[test]
    fn test_parse_task_resources() {
        assert_eq!(parse_task_cpu("256"), Some(256));
        assert_eq!(parse_task_cpu("0.25 vCPU"), Some(256));
        assert_eq!(parse_task_cpu("2 vcpu"), Some(2048));
        assert_eq!(parse_task_cpu("lots"), None);
        assert_eq!(parse_task_memory("512"), Some(512));
        assert_eq!(parse_task_memory("1GB"), Some(1024));
        assert_eq!(parse_task_memory("0.5 GB"), Some(512));
        assert_eq!(parse_task_memory("0"), None);
    }

    #[test]
    fn test_secret_names() {
        assert_eq!(
            secret_name_for("arn:aws:ssm:us-east-1:000000000000:parameter/app/DB_URL").as_deref(),
            Some("ssm-app-db-url")
        );
        assert_eq!(
            secret_name_for(
                "arn:aws:secretsmanager:us-east-1:000000000000:secret:api-key:password::"
            )
            .as_deref(),
            Some("sm-api-key")
        );
        assert_eq!(secret_name_for("arn:aws:s3:::bucket/key"), None);
    }

    #[test]
    fn test_resource_builder_requires_containers() {
        let mut td = create_test_task_definition();
        td.container_definitions.clear();
        assert!(ResourceBuilder::new(&td, "demo", "demo-us-east-1").is_err());
    }

    #[test]
    fn test_label_value_truncation() {
        let long = format!("{}_", "f".repeat(70));
        let value = label_value(&long);
        assert_eq!(value.len(), 63);
        assert!(value.chars().all(|c| c == 'f'));
    }
}
