//! Domain-specific error types for sandbox operations.
//!
//! Typed errors enable callers to match on specific failure modes
//! rather than parsing error message strings.

use std::time::Duration;

use super::SessionStatus;

/// Failure reported by a [`RuntimeClient`](crate::runtime::RuntimeClient) call.
///
/// The variant decides the retry class: only [`RuntimeError::Transient`] is
/// retried by the session's retry policy.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RuntimeError {
    /// Connection reset, daemon temporarily unavailable, request timeout.
    #[error("Container runtime temporarily unavailable: {message}")]
    Transient { message: String },

    /// The container backing the session no longer exists.
    #[error("Container {container} no longer exists")]
    ContainerGone { container: String },

    /// A path, exec or other object inside the container was not found.
    #[error("Not found: {message}")]
    NotFound { message: String },

    /// The runtime rejected the request as malformed.
    #[error("Invalid argument: {message}")]
    InvalidArgument { message: String },

    /// The runtime refused the request.
    #[error("Permission denied: {message}")]
    PermissionDenied { message: String },

    /// Any other non-transient runtime failure.
    #[error("Container runtime error: {message}")]
    Other { message: String },
}

impl RuntimeError {
    /// Creates a `Transient` error.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Transient {
            message: message.into(),
        }
    }

    /// Creates a `ContainerGone` error.
    pub fn container_gone(container: impl Into<String>) -> Self {
        Self::ContainerGone {
            container: container.into(),
        }
    }

    /// Creates a `NotFound` error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound {
            message: message.into(),
        }
    }

    /// Creates an `InvalidArgument` error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            message: message.into(),
        }
    }

    /// Creates a `PermissionDenied` error.
    pub fn permission_denied(message: impl Into<String>) -> Self {
        Self::PermissionDenied {
            message: message.into(),
        }
    }

    /// Creates an `Other` error.
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// Returns true if the call may succeed when retried.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Returns true if the session's container has disappeared.
    pub fn is_container_gone(&self) -> bool {
        matches!(self, Self::ContainerGone { .. })
    }

    /// Returns true if the target object was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors returned by the sandbox session API.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// A non-transient runtime failure, surfaced without retrying.
    #[error(transparent)]
    Runtime(#[from] RuntimeError),

    /// A transient runtime failure persisted through every retry.
    #[error("{operation} failed after {attempts} attempts: {last}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        last: RuntimeError,
    },

    /// The session is not RUNNING; no runtime call was made.
    #[error("Sandbox session is not running (status: {status})")]
    NotRunning { status: SessionStatus },

    /// A process, terminal or watch is not in a state that allows the operation.
    #[error("{resource} is {state}, operation not allowed")]
    InvalidState { resource: String, state: String },

    /// The operation's deadline expired.
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    /// The configuration was rejected.
    #[error("Invalid sandbox configuration: {message}")]
    InvalidConfig { message: String },

    /// The session hit a fatal error and is now FAILED.
    #[error("Sandbox session failed: {message}")]
    SessionFailed { message: String },

    /// Local I/O or archive handling failed.
    #[error("I/O error: {message}")]
    Io { message: String },
}

impl SandboxError {
    /// Creates a `RetriesExhausted` error.
    pub fn retries_exhausted(operation: impl Into<String>, attempts: u32, last: RuntimeError) -> Self {
        Self::RetriesExhausted {
            operation: operation.into(),
            attempts,
            last,
        }
    }

    /// Creates a `NotRunning` error.
    pub fn not_running(status: SessionStatus) -> Self {
        Self::NotRunning { status }
    }

    /// Creates an `InvalidState` error.
    pub fn invalid_state(resource: impl Into<String>, state: impl ToString) -> Self {
        Self::InvalidState {
            resource: resource.into(),
            state: state.to_string(),
        }
    }

    /// Creates a `Timeout` error.
    pub fn timeout(operation: impl Into<String>, timeout: Duration) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout,
        }
    }

    /// Creates an `InvalidConfig` error.
    pub fn invalid_config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Creates a `SessionFailed` error.
    pub fn session_failed(message: impl Into<String>) -> Self {
        Self::SessionFailed {
            message: message.into(),
        }
    }

    /// Creates an `Io` error.
    pub fn io(message: impl Into<String>) -> Self {
        Self::Io {
            message: message.into(),
        }
    }

    /// Returns true if this is a timeout error.
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// Returns true if the session or a handle was in the wrong state.
    pub fn is_precondition(&self) -> bool {
        matches!(self, Self::NotRunning { .. } | Self::InvalidState { .. })
    }

    /// Returns true if retries were exhausted on a transient failure.
    pub fn is_retries_exhausted(&self) -> bool {
        matches!(self, Self::RetriesExhausted { .. })
    }

    /// Returns true if the container disappeared underneath the session.
    pub fn is_container_gone(&self) -> bool {
        match self {
            Self::Runtime(e) | Self::RetriesExhausted { last: e, .. } => e.is_container_gone(),
            _ => false,
        }
    }

    /// Returns true if the target object inside the container was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Runtime(e) if e.is_not_found())
    }
}

impl From<std::io::Error> for SandboxError {
    fn from(err: std::io::Error) -> Self {
        Self::io(err.to_string())
    }
}
