use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Free-form diagnostics attached to a [`RuntimeError`]: command text, paths,
/// requested resources.
pub type ErrorContext = BTreeMap<String, String>;

/// Stable machine-readable code for each error kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    SpawnError,
    ExecutionError,
    ResourceExhausted,
    Timeout,
    NotFound,
    ConfigurationError,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::SpawnError => "SPAWN_ERROR",
            ErrorCode::ExecutionError => "EXECUTION_ERROR",
            ErrorCode::ResourceExhausted => "RESOURCE_EXHAUSTED",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::ConfigurationError => "CONFIGURATION_ERROR",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceType {
    Cpu,
    Memory,
    Disk,
    Agents,
    Network,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Cpu => write!(f, "cpu"),
            ResourceType::Memory => write!(f, "memory"),
            ResourceType::Disk => write!(f, "disk"),
            ResourceType::Agents => write!(f, "agents"),
            ResourceType::Network => write!(f, "network"),
        }
    }
}

/// What a [`RuntimeError::NotFound`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingResource {
    Runtime,
    Snapshot,
    File,
    Directory,
}

impl fmt::Display for MissingResource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MissingResource::Runtime => write!(f, "runtime"),
            MissingResource::Snapshot => write!(f, "snapshot"),
            MissingResource::File => write!(f, "file"),
            MissingResource::Directory => write!(f, "directory"),
        }
    }
}

/// The closed set of failures a runtime provider may raise.
///
/// Every public provider operation either succeeds or returns exactly one of
/// these variants. `is_retryable` is advisory; providers never retry on their
/// own.
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    #[error("spawn failed: {message}")]
    Spawn {
        message: String,
        runtime_id: Option<String>,
        context: ErrorContext,
    },
    #[error("execution failed: {message}")]
    Execution {
        message: String,
        exit_code: Option<i32>,
        runtime_id: Option<String>,
        context: ErrorContext,
    },
    #[error("{resource_type} exhausted: {message}")]
    ResourceExhausted {
        message: String,
        resource_type: ResourceType,
        runtime_id: Option<String>,
        context: ErrorContext,
    },
    #[error("{operation} timed out after {timeout_ms}ms")]
    Timeout {
        operation: String,
        timeout_ms: u64,
        runtime_id: Option<String>,
        context: ErrorContext,
    },
    #[error("{resource} not found: {id}")]
    NotFound {
        resource: MissingResource,
        id: String,
        runtime_id: Option<String>,
        context: ErrorContext,
    },
    #[error("invalid configuration: {message}")]
    Configuration {
        message: String,
        runtime_id: Option<String>,
        context: ErrorContext,
    },
}

impl RuntimeError {
    pub fn spawn(message: impl Into<String>) -> Self {
        RuntimeError::Spawn {
            message: message.into(),
            runtime_id: None,
            context: ErrorContext::new(),
        }
    }

    pub fn execution(message: impl Into<String>, exit_code: Option<i32>) -> Self {
        RuntimeError::Execution {
            message: message.into(),
            exit_code,
            runtime_id: None,
            context: ErrorContext::new(),
        }
    }

    pub fn resource_exhausted(resource_type: ResourceType, message: impl Into<String>) -> Self {
        RuntimeError::ResourceExhausted {
            message: message.into(),
            resource_type,
            runtime_id: None,
            context: ErrorContext::new(),
        }
    }

    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        RuntimeError::Timeout {
            operation: operation.into(),
            timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            runtime_id: None,
            context: ErrorContext::new(),
        }
    }

    pub fn not_found(resource: MissingResource, id: impl Into<String>) -> Self {
        RuntimeError::NotFound {
            resource,
            id: id.into(),
            runtime_id: None,
            context: ErrorContext::new(),
        }
    }

    pub fn runtime_not_found(runtime_id: &str) -> Self {
        Self::not_found(MissingResource::Runtime, runtime_id).with_runtime(runtime_id)
    }

    pub fn snapshot_not_found(snapshot_id: &str) -> Self {
        Self::not_found(MissingResource::Snapshot, snapshot_id)
    }

    /// Map a filesystem error on `path`. A missing path becomes `NotFound` of
    /// the given resource kind; anything else is an `Execution` failure.
    pub fn from_io(err: &std::io::Error, resource: MissingResource, path: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            Self::not_found(resource, path).with_context("path", path)
        } else {
            Self::execution(format!("{path}: {err}"), None).with_context("path", path)
        }
    }

    pub fn configuration(message: impl Into<String>) -> Self {
        RuntimeError::Configuration {
            message: message.into(),
            runtime_id: None,
            context: ErrorContext::new(),
        }
    }

    #[must_use]
    pub fn with_runtime(mut self, id: impl Into<String>) -> Self {
        *self.parts_mut().0 = Some(id.into());
        self
    }

    #[must_use]
    pub fn with_context(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.parts_mut().1.insert(key.into(), value.to_string());
        self
    }

    pub fn code(&self) -> ErrorCode {
        match self {
            RuntimeError::Spawn { .. } => ErrorCode::SpawnError,
            RuntimeError::Execution { .. } => ErrorCode::ExecutionError,
            RuntimeError::ResourceExhausted { .. } => ErrorCode::ResourceExhausted,
            RuntimeError::Timeout { .. } => ErrorCode::Timeout,
            RuntimeError::NotFound { .. } => ErrorCode::NotFound,
            RuntimeError::Configuration { .. } => ErrorCode::ConfigurationError,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RuntimeError::Spawn { .. }
                | RuntimeError::ResourceExhausted { .. }
                | RuntimeError::Timeout { .. }
        )
    }

    pub fn runtime_id(&self) -> Option<&str> {
        match self {
            RuntimeError::Spawn { runtime_id, .. }
            | RuntimeError::Execution { runtime_id, .. }
            | RuntimeError::ResourceExhausted { runtime_id, .. }
            | RuntimeError::Timeout { runtime_id, .. }
            | RuntimeError::NotFound { runtime_id, .. }
            | RuntimeError::Configuration { runtime_id, .. } => runtime_id.as_deref(),
        }
    }

    pub fn context(&self) -> &ErrorContext {
        match self {
            RuntimeError::Spawn { context, .. }
            | RuntimeError::Execution { context, .. }
            | RuntimeError::ResourceExhausted { context, .. }
            | RuntimeError::Timeout { context, .. }
            | RuntimeError::NotFound { context, .. }
            | RuntimeError::Configuration { context, .. } => context,
        }
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            RuntimeError::Execution { exit_code, .. } => *exit_code,
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, RuntimeError::NotFound { .. })
    }

    fn parts_mut(&mut self) -> (&mut Option<String>, &mut ErrorContext) {
        match self {
            RuntimeError::Spawn {
                runtime_id,
                context,
                ..
            }
            | RuntimeError::Execution {
                runtime_id,
                context,
                ..
            }
            | RuntimeError::ResourceExhausted {
                runtime_id,
                context,
                ..
            }
            | RuntimeError::Timeout {
                runtime_id,
                context,
                ..
            }
            | RuntimeError::NotFound {
                runtime_id,
                context,
                ..
            }
            | RuntimeError::Configuration {
                runtime_id,
                context,
                ..
            } => (runtime_id, context),
        }
    }
}
