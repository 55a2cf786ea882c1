//! Sandbox session lifecycle.
//!
//! A [`SandboxSession`] owns one container and the state machine around it.
//! Every runtime call made on its behalf goes through the session's retry
//! policy and status check.

mod error;
mod retry;
mod session;

use std::fmt;

use serde::Serialize;

pub use error::{RuntimeError, SandboxError};
pub use retry::RetryPolicy;
pub use session::SandboxSession;
pub(crate) use session::{session_ended, upgrade, CommandOutput, SessionInner};

/// Lifecycle state of a sandbox session.
///
/// CREATING and STOPPING are transient. RUNNING, STOPPED and FAILED are the
/// stable states callers observe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Creating,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl SessionStatus {
    /// Returns true once the session is on its way down or gone.
    pub fn is_shutdown(self) -> bool {
        matches!(self, Self::Stopping | Self::Stopped | Self::Failed)
    }

    /// Returns true for states a session can stay in indefinitely.
    pub fn is_stable(self) -> bool {
        matches!(self, Self::Running | Self::Stopped | Self::Failed)
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}
