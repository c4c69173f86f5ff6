//! Transport boundary between the Kata provider and the Kubernetes API.
//!
//! The provider only sees typed exec frames. How stdout, stderr and the final
//! status are multiplexed on the wire stays inside the [`PodApi`]
//! implementation.

use async_trait::async_trait;
use bytes::Bytes;
use corral_runtime::{InputStream, ResourceType, RuntimeError};
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::api::networking::v1::NetworkPolicy;
use thiserror::Error;

/// Name of the workload container in every runtime pod.
pub const CONTAINER_NAME: &str = "agent";

#[derive(Debug, Clone, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("already exists: {0}")]
    Conflict(String),
    #[error("forbidden: {0}")]
    Forbidden(String),
    #[error("rejected by validation: {0}")]
    Invalid(String),
    #[error("API transport failure: {0}")]
    Transport(String),
}

impl ApiError {
    /// Admission rejections from a `ResourceQuota` arrive as 403s.
    pub fn is_quota(&self) -> bool {
        matches!(self, ApiError::Forbidden(m) if m.contains("exceeded quota"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ApiError::NotFound(_))
    }

    /// Which resource a quota rejection names, judged from the API message.
    fn quota_resource(&self) -> ResourceType {
        let message = self.to_string();
        if message.contains("memory") {
            ResourceType::Memory
        } else if message.contains("cpu") {
            ResourceType::Cpu
        } else {
            ResourceType::Agents
        }
    }

    /// Pod creation failures. Quota rejections and validation failures keep
    /// their own kinds; everything else is a retryable spawn error.
    pub fn into_spawn_error(self) -> RuntimeError {
        match self {
            e if e.is_quota() => RuntimeError::from(e),
            ApiError::Invalid(m) => RuntimeError::configuration(format!("pod rejected: {m}")),
            other => RuntimeError::spawn(other.to_string()),
        }
    }
}

impl From<ApiError> for RuntimeError {
    fn from(err: ApiError) -> Self {
        if err.is_quota() {
            return RuntimeError::resource_exhausted(err.quota_resource(), err.to_string());
        }
        match err {
            ApiError::Invalid(m) => RuntimeError::configuration(m),
            other => RuntimeError::execution(other.to_string(), None),
        }
    }
}

/// One demultiplexed item of an exec session. `Exit` comes last.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecFrame {
    Stdout(Bytes),
    Stderr(Bytes),
    Exit(i32),
}

pub type ExecStream = BoxStream<'static, Result<ExecFrame, ApiError>>;

/// Namespaced pod and network-policy operations the provider needs.
#[async_trait]
pub trait PodApi: Send + Sync {
    fn namespace(&self) -> &str;

    async fn create_pod(&self, pod: &Pod) -> Result<Pod, ApiError>;

    async fn get_pod(&self, name: &str) -> Result<Option<Pod>, ApiError>;

    /// Fails with `NotFound` when the pod does not exist.
    async fn delete_pod(&self, name: &str) -> Result<(), ApiError>;

    async fn list_pods(&self, label_selector: &str) -> Result<Vec<Pod>, ApiError>;

    /// Run `command` in the agent container. `stdin`, when given, is copied to
    /// the process and then closed.
    async fn exec(
        &self,
        pod: &str,
        command: Vec<String>,
        stdin: Option<InputStream>,
    ) -> Result<ExecStream, ApiError>;

    /// Create or update a network policy.
    async fn apply_network_policy(&self, policy: &NetworkPolicy) -> Result<(), ApiError>;

    async fn delete_network_policy(&self, name: &str) -> Result<(), ApiError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_runtime::ErrorCode;

    #[test]
    fn quota_rejections_are_resource_exhausted() {
        let err = ApiError::Forbidden(
            r#"pods "corral-kata-1-1" is forbidden: exceeded quota: agents, requested: requests.memory=4Gi"#
                .to_owned(),
        );
        assert!(err.is_quota());
        match err.into_spawn_error() {
            RuntimeError::ResourceExhausted { resource_type, .. } => {
                assert_eq!(resource_type, ResourceType::Memory);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn spawn_error_mapping() {
        let forbidden = ApiError::Forbidden("serviceaccount cannot create pods".to_owned());
        assert!(!forbidden.is_quota());
        assert_eq!(forbidden.into_spawn_error().code(), ErrorCode::SpawnError);
        assert_eq!(
            ApiError::Invalid("bad".to_owned()).into_spawn_error().code(),
            ErrorCode::ConfigurationError
        );
        assert_eq!(
            RuntimeError::from(ApiError::Transport("reset".to_owned())).code(),
            ErrorCode::ExecutionError
        );
    }
}
