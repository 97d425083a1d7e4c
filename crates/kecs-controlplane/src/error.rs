//! Error types for the KECS control plane
//!
//! Three layers, each with its own enum:
//!
//! - [`StorageError`] for the record store
//! - [`PlatformError`] for the Kubernetes client
//! - [`ControlPlaneError`] for lifecycle operations, mapped to ECS exception names

use thiserror::Error;

/// Errors returned by a [`crate::storage::RecordStore`]
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    /// No record under the requested key
    #[error("{kind} not found: {key}")]
    NotFound { kind: &'static str, key: String },

    /// A record already exists under the key
    #[error("{kind} already exists: {key}")]
    Conflict { kind: &'static str, key: String },

    /// The record changed since it was read
    #[error("{kind} {key} was modified concurrently (expected version {expected}, found {actual})")]
    VersionConflict {
        kind: &'static str,
        key: String,
        expected: u64,
        actual: u64,
    },

    /// Backend temporarily unavailable
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    /// Record could not be encoded or decoded
    #[error("storage serialization error: {0}")]
    Serialization(String),
}

impl StorageError {
    /// Transient failures that a later attempt may get past
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StorageError::Unavailable(_) | StorageError::VersionConflict { .. }
        )
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StorageError::NotFound { .. })
    }
}

/// Result type for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Errors returned by an [`crate::platform::OrchestrationClient`]
#[derive(Error, Debug)]
pub enum PlatformError {
    /// Kubernetes API error that could not be classified further
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// Object not found
    #[error("{kind} not found: {namespace}/{name}")]
    NotFound {
        kind: &'static str,
        namespace: String,
        name: String,
    },

    /// Object exists and is owned by someone else
    #[error("{kind} {namespace}/{name} conflict: {reason}")]
    Conflict {
        kind: &'static str,
        namespace: String,
        name: String,
        reason: String,
    },

    /// Object spec is missing required metadata
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// API server temporarily unavailable
    #[error("platform unavailable: {0}")]
    Unavailable(String),
}

impl PlatformError {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            PlatformError::KubeError(kube::Error::Api(resp)) => {
                resp.code >= 500 || resp.code == 429
            }
            PlatformError::KubeError(_) | PlatformError::Unavailable(_) => true,
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            PlatformError::NotFound { .. } => true,
            PlatformError::KubeError(kube::Error::Api(resp)) => resp.code == 404,
            _ => false,
        }
    }
}

/// Result type for platform operations
pub type PlatformResult<T> = std::result::Result<T, PlatformError>;

/// Errors surfaced by lifecycle operations
#[derive(Error, Debug)]
pub enum ControlPlaneError {
    // ==================== Validation Errors ====================
    /// Missing or malformed request parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    /// Identifier looked like an ARN but could not be parsed
    #[error("Invalid ARN format: {0}")]
    InvalidArnFormat(String),

    // ==================== Not Found Errors ====================
    #[error("Cluster not found: {0}")]
    ClusterNotFound(String),

    #[error("Service not found: {0}")]
    ServiceNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Task definition not found: {0}")]
    TaskDefinitionNotFound(String),

    #[error("Task set not found: {0}")]
    TaskSetNotFound(String),

    // ==================== Conflict Errors ====================
    /// Operation requires an ACTIVE service
    #[error("Service not active: {0}")]
    ServiceNotActive(String),

    /// Cluster deletion blocked by a service
    #[error("The cluster cannot be deleted while services are active: service {service} is {status}")]
    ClusterContainsServices { service: String, status: String },

    /// Cluster deletion blocked by a task
    #[error("The cluster cannot be deleted while tasks are active: task {task} is {status}")]
    ClusterContainsTasks { task: String, status: String },

    /// Resource is referenced by another resource
    #[error("Resource in use: {0}")]
    ResourceInUse(String),

    // ==================== Backend Errors ====================
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Platform error: {0}")]
    Platform(#[from] PlatformError),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for control plane operations
pub type Result<T> = std::result::Result<T, ControlPlaneError>;

impl ControlPlaneError {
    /// ECS exception type reported to API callers
    pub fn exception_type(&self) -> &'static str {
        match self {
            ControlPlaneError::InvalidParameter(_) | ControlPlaneError::InvalidArnFormat(_) => {
                "InvalidParameterException"
            }
            ControlPlaneError::ClusterNotFound(_) => "ClusterNotFoundException",
            ControlPlaneError::ServiceNotFound(_) => "ServiceNotFoundException",
            ControlPlaneError::TaskNotFound(_) | ControlPlaneError::TaskDefinitionNotFound(_) => {
                "ClientException"
            }
            ControlPlaneError::TaskSetNotFound(_) => "TaskSetNotFoundException",
            ControlPlaneError::ServiceNotActive(_) => "ServiceNotActiveException",
            ControlPlaneError::ClusterContainsServices { .. } => {
                "ClusterContainsServicesException"
            }
            ControlPlaneError::ClusterContainsTasks { .. } => "ClusterContainsTasksException",
            ControlPlaneError::ResourceInUse(_) => "ResourceInUseException",
            ControlPlaneError::Storage(_)
            | ControlPlaneError::Platform(_)
            | ControlPlaneError::Internal(_) => "ServerException",
        }
    }

    /// HTTP status code for the exception
    pub fn http_status(&self) -> u16 {
        match self {
            ControlPlaneError::Storage(_)
            | ControlPlaneError::Platform(_)
            | ControlPlaneError::Internal(_) => 500,
            _ => 400,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        match self {
            ControlPlaneError::Storage(e) => e.is_transient(),
            ControlPlaneError::Platform(e) => e.is_retryable(),
            _ => false,
        }
    }
}
