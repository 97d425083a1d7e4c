//! ECS resource ARNs
//!
//! Format: `arn:<partition>:ecs:<region>:<account>:<type>/<cluster>/<name>`.
//! Cluster ARNs stop after the cluster segment and task definition ARNs use
//! `task-definition/<family>:<revision>` with no cluster.

use crate::error::{ControlPlaneError, Result};
use std::fmt;

const ARN_SERVICE: &str = "ecs";

/// Resource type segment of an ARN
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Cluster,
    Service,
    Task,
    TaskSet,
    TaskDefinition,
}

impl ResourceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::Cluster => "cluster",
            ResourceKind::Service => "service",
            ResourceKind::Task => "task",
            ResourceKind::TaskSet => "task-set",
            ResourceKind::TaskDefinition => "task-definition",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        match value {
            "cluster" => Some(ResourceKind::Cluster),
            "service" => Some(ResourceKind::Service),
            "task" => Some(ResourceKind::Task),
            "task-set" => Some(ResourceKind::TaskSet),
            "task-definition" => Some(ResourceKind::TaskDefinition),
            _ => None,
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed ARN
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Arn {
    pub partition: String,
    pub region: String,
    pub account_id: String,
    pub kind: ResourceKind,
    /// Owning cluster; `None` for task definitions
    pub cluster: Option<String>,
    /// Resource path below the cluster; `None` for clusters
    pub resource: Option<String>,
}

impl Arn {
    /// Build an ARN from its parts
    ///
    /// For [`ResourceKind::Cluster`] `cluster` is the cluster name and
    /// `resource` is ignored. For [`ResourceKind::TaskDefinition`] `cluster`
    /// is ignored and `resource` is `family:revision`.
    pub fn build(
        partition: &str,
        kind: ResourceKind,
        region: &str,
        account_id: &str,
        cluster: &str,
        resource: &str,
    ) -> Self {
        let (cluster, resource) = match kind {
            ResourceKind::Cluster => (Some(cluster.to_string()), None),
            ResourceKind::TaskDefinition => (None, Some(resource.to_string())),
            _ => (Some(cluster.to_string()), Some(resource.to_string())),
        };
        Self {
            partition: partition.to_string(),
            region: region.to_string(),
            account_id: account_id.to_string(),
            kind,
            cluster,
            resource,
        }
    }

    /// Parse an ARN string
    pub fn parse(value: &str) -> Result<Self> {
        let invalid = || ControlPlaneError::InvalidArnFormat(value.to_string());

        let mut parts = value.splitn(6, ':');
        let prefix = parts.next().ok_or_else(invalid)?;
        let partition = parts.next().ok_or_else(invalid)?;
        let service = parts.next().ok_or_else(invalid)?;
        let region = parts.next().ok_or_else(invalid)?;
        let account_id = parts.next().ok_or_else(invalid)?;
        let resource_path = parts.next().ok_or_else(invalid)?;

        if prefix != "arn"
            || partition.is_empty()
            || service != ARN_SERVICE
            || region.is_empty()
            || account_id.is_empty()
            || !account_id.chars().all(|c| c.is_ascii_digit())
        {
            return Err(invalid());
        }

        let (kind, path) = resource_path.split_once('/').ok_or_else(invalid)?;
        let kind = ResourceKind::parse(kind).ok_or_else(invalid)?;
        if path.is_empty() {
            return Err(invalid());
        }

        let (cluster, resource) = match kind {
            ResourceKind::Cluster => {
                if path.contains('/') {
                    return Err(invalid());
                }
                (Some(path.to_string()), None)
            }
            ResourceKind::TaskDefinition => {
                let (family, revision) = path.rsplit_once(':').ok_or_else(invalid)?;
                if family.is_empty() || revision.parse::<u32>().is_err() {
                    return Err(invalid());
                }
                (None, Some(path.to_string()))
            }
            _ => {
                let (cluster, name) = path.split_once('/').ok_or_else(invalid)?;
                if cluster.is_empty() || name.is_empty() {
                    return Err(invalid());
                }
                (Some(cluster.to_string()), Some(name.to_string()))
            }
        };

        Ok(Self {
            partition: partition.to_string(),
            region: region.to_string(),
            account_id: account_id.to_string(),
            kind,
            cluster,
            resource,
        })
    }

    /// Parse an ARN that must be of `kind`
    pub fn parse_as(value: &str, kind: ResourceKind) -> Result<Self> {
        let arn = Self::parse(value)?;
        if arn.kind != kind {
            return Err(ControlPlaneError::InvalidParameter(format!(
                "expected a {} ARN, got {}",
                kind, value
            )));
        }
        Ok(arn)
    }
}

impl fmt::Display for Arn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "arn:{}:{}:{}:{}:{}/",
            self.partition, ARN_SERVICE, self.region, self.account_id, self.kind
        )?;
        match (&self.cluster, &self.resource) {
            (Some(cluster), Some(resource)) => write!(f, "{}/{}", cluster, resource),
            (Some(cluster), None) => f.write_str(cluster),
            (None, Some(resource)) => f.write_str(resource),
            (None, None) => Ok(()),
        }
    }
}

/// Build an ARN string
pub fn build_arn(
    partition: &str,
    kind: ResourceKind,
    region: &str,
    account_id: &str,
    cluster: &str,
    resource: &str,
) -> String {
    Arn::build(partition, kind, region, account_id, cluster, resource).to_string()
}

/// ARN factory bound to one partition, region and account
#[derive(Debug, Clone)]
pub struct ArnBuilder {
    partition: String,
    region: String,
    account_id: String,
}

impl ArnBuilder {
    pub fn new(
        partition: impl Into<String>,
        region: impl Into<String>,
        account_id: impl Into<String>,
    ) -> Self {
        Self {
            partition: partition.into(),
            region: region.into(),
            account_id: account_id.into(),
        }
    }

    pub fn from_config(config: &crate::config::ControlPlaneConfig) -> Self {
        Self::new(&config.partition, &config.region, &config.account_id)
    }

    fn build(&self, kind: ResourceKind, cluster: &str, resource: &str) -> String {
        build_arn(
            &self.partition,
            kind,
            &self.region,
            &self.account_id,
            cluster,
            resource,
        )
    }

    pub fn cluster(&self, cluster: &str) -> String {
        self.build(ResourceKind::Cluster, cluster, "")
    }

    pub fn service(&self, cluster: &str, service: &str) -> String {
        self.build(ResourceKind::Service, cluster, service)
    }

    pub fn task(&self, cluster: &str, task_id: &str) -> String {
        self.build(ResourceKind::Task, cluster, task_id)
    }

    pub fn task_set(&self, cluster: &str, service: &str, task_set_id: &str) -> String {
        self.build(
            ResourceKind::TaskSet,
            cluster,
            &format!("{}/{}", service, task_set_id),
        )
    }

    pub fn task_definition(&self, family: &str, revision: u32) -> String {
        self.build(
            ResourceKind::TaskDefinition,
            "",
            &format!("{}:{}", family, revision),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn builder() -> ArnBuilder {
        ArnBuilder::new("aws", "us-east-1", "123456789012")
    }

    #[test]
    fn test_build_formats() {
        let b = builder();
        assert_eq!(
            b.cluster("demo"),
            "arn:aws:ecs:us-east-1:123456789012:cluster/demo"
        );
        assert_eq!(
            b.service("demo", "web"),
            "arn:aws:ecs:us-east-1:123456789012:service/demo/web"
        );
        assert_eq!(
            b.task("demo", "abc123"),
            "arn:aws:ecs:us-east-1:123456789012:task/demo/abc123"
        );
        assert_eq!(
            b.task_definition("nginx", 3),
            "arn:aws:ecs:us-east-1:123456789012:task-definition/nginx:3"
        );
        assert_eq!(
            b.task_set("demo", "web", "ecs-svc/1234567890123456789"),
            "arn:aws:ecs:us-east-1:123456789012:task-set/demo/web/ecs-svc/1234567890123456789"
        );
    }

    #[test]
    fn test_parse_round_trip() {
        let b = builder();
        for arn in [
            b.cluster("demo"),
            b.service("demo", "web"),
            b.task("demo", "abc123"),
            b.task_definition("nginx", 12),
            b.task_set("demo", "web", "ecs-svc/1234567890123456789"),
        ] {
            let parsed = Arn::parse(&arn).unwrap();
            assert_eq!(parsed.to_string(), arn);
            assert_eq!(parsed.region, "us-east-1");
            assert_eq!(parsed.account_id, "123456789012");
        }

        let parsed = Arn::parse(&b.service("demo", "web")).unwrap();
        assert_eq!(parsed.kind, ResourceKind::Service);
        assert_eq!(parsed.cluster.as_deref(), Some("demo"));
        assert_eq!(parsed.resource.as_deref(), Some("web"));

        let parsed = Arn::parse(&b.task_set("demo", "web", "ecs-svc/1")).unwrap();
        assert_eq!(parsed.resource.as_deref(), Some("web/ecs-svc/1"));
    }

    #[test]
    fn test_parse_invalid() {
        for bad in [
            "",
            "not-an-arn",
            "arn:aws:s3:us-east-1:123456789012:cluster/demo",
            "arn:aws:ecs:us-east-1:123456789012:cluster/",
            "arn:aws:ecs:us-east-1:123456789012:cluster/a/b",
            "arn:aws:ecs:us-east-1:123456789012:service/demo",
            "arn:aws:ecs:us-east-1:123456789012:widget/demo/x",
            "arn:aws:ecs:us-east-1:acct:cluster/demo",
            "arn:aws:ecs:us-east-1:123456789012:task-definition/nginx",
            "arn:aws:ecs:us-east-1:123456789012:task-definition/nginx:latest",
        ] {
            assert!(
                matches!(Arn::parse(bad), Err(ControlPlaneError::InvalidArnFormat(_))),
                "expected {} to be rejected",
                bad
            );
        }
    }

    #[test]
    fn test_parse_as_checks_kind() {
        let b = builder();
        let cluster = Arn::parse_as(&b.cluster("demo"), ResourceKind::Cluster).unwrap();
        assert_eq!(cluster.cluster.as_deref(), Some("demo"));
        assert!(Arn::parse_as(&b.service("demo", "web"), ResourceKind::Cluster).is_err());
        assert!(Arn::parse_as("demo", ResourceKind::Cluster).is_err());
    }
}
