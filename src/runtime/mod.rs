//! Container runtime interface consumed by sandbox sessions.
//!
//! A [`RuntimeClient`] is the only thing that talks to the container engine.
//! Sessions never call it directly from subsystems; every call goes through
//! the session's guarded wrapper so retries and status checks live in one
//! place. One client may be shared by many sessions concurrently.

pub mod docker;
pub mod mock;

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWrite;

use crate::config::SandboxConfig;
use crate::sandbox::RuntimeError;

pub use docker::DockerRuntime;
pub use mock::MockRuntime;

/// Result of a runtime call.
pub type RuntimeResult<T> = Result<T, RuntimeError>;

/// Opaque handle to a container, owned by exactly one session.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContainerRef(String);

impl ContainerRef {
    /// Wraps a runtime-specific container identifier or name.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The runtime-specific identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContainerRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Observed container state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    /// Whether the container's main process is running.
    pub running: bool,
    /// Published ports.
    pub ports: Vec<PortMapping>,
}

/// A declared container port and the host port it is published on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    /// Port inside the container.
    pub container_port: u16,
    /// Port on the host, if the runtime published one.
    pub host_port: Option<u16>,
}

/// Per-exec overrides.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    /// Extra environment variables layered over the container's.
    pub env: BTreeMap<String, String>,
    /// Working directory; the container default when `None`.
    pub cwd: Option<String>,
    /// Keep an input stream open.
    pub attach_stdin: bool,
    /// Allocate a pseudo-terminal.
    pub tty: bool,
}

impl ExecOptions {
    /// Environment as `KEY=value` pairs.
    pub fn env_pairs(&self) -> Vec<String> {
        self.env
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }
}

/// Runtime-side identity of a started exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecHandle {
    /// Runtime exec id, used for status and resize calls.
    pub exec_id: String,
    /// Token used by the runtime to locate the process when signalling it.
    pub kill_token: String,
}

/// A chunk of output from an exec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputChunk {
    /// Standard output.
    Stdout(Bytes),
    /// Standard error.
    Stderr(Bytes),
    /// Merged terminal output of a tty exec.
    Console(Bytes),
}

/// Bidirectional byte stream attached to an exec.
pub struct ExecStream {
    /// Identity of the exec.
    pub handle: ExecHandle,
    /// Output in the order the runtime produced it; ends when the exec exits.
    pub output: BoxStream<'static, RuntimeResult<OutputChunk>>,
    /// Input side; dropping or shutting it down sends EOF.
    pub input: Pin<Box<dyn AsyncWrite + Send>>,
}

impl fmt::Debug for ExecStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecStream")
            .field("handle", &self.handle)
            .finish_non_exhaustive()
    }
}

/// Status of an exec as reported by the runtime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecStatus {
    /// Whether the exec's process is still alive.
    pub running: bool,
    /// Exit code, once the process has exited.
    pub exit_code: Option<i64>,
}

/// Signal delivered to an exec's process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signal {
    /// Polite termination request (SIGTERM).
    Term,
    /// Forced termination (SIGKILL).
    Kill,
}

impl Signal {
    /// Signal name understood by `kill -s`.
    pub fn name(self) -> &'static str {
        match self {
            Self::Term => "TERM",
            Self::Kill => "KILL",
        }
    }
}

/// An entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirEntry {
    /// File name without its directory.
    pub name: String,
    /// Whether the entry is a directory.
    pub is_dir: bool,
}

/// Kind of filesystem change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    /// A path appeared.
    Created,
    /// A path's content changed.
    Modified,
    /// A path disappeared.
    Deleted,
}

impl fmt::Display for ChangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Modified => write!(f, "modified"),
            Self::Deleted => write!(f, "deleted"),
        }
    }
}

/// A filesystem change reported under a watched path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    /// Absolute path inside the container.
    pub path: String,
    /// What happened.
    pub kind: ChangeKind,
    /// When the runtime observed it.
    pub timestamp: DateTime<Utc>,
}

impl ChangeEvent {
    /// Creates an event stamped with the current time.
    pub fn now(path: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            path: path.into(),
            kind,
            timestamp: Utc::now(),
        }
    }
}

/// Stream of change events; ends when the subscription ends.
pub type ChangeStream = BoxStream<'static, RuntimeResult<ChangeEvent>>;

/// Thin interface to the container engine.
#[async_trait]
pub trait RuntimeClient: Send + Sync {
    /// Creates (but does not start) a container named `name`.
    async fn create_container(&self, name: &str, config: &SandboxConfig) -> RuntimeResult<ContainerRef>;

    /// Starts a created container.
    async fn start_container(&self, container: &ContainerRef) -> RuntimeResult<()>;

    /// Stops a running container, allowing `grace` before it is killed.
    async fn stop_container(&self, container: &ContainerRef, grace: Duration) -> RuntimeResult<()>;

    /// Removes a container and its anonymous volumes.
    async fn remove_container(&self, container: &ContainerRef) -> RuntimeResult<()>;

    /// Reports whether the container is running and which ports it publishes.
    async fn inspect_container(&self, container: &ContainerRef) -> RuntimeResult<ContainerInfo>;

    /// Runs `argv` inside the container and attaches to its streams.
    async fn exec(
        &self,
        container: &ContainerRef,
        argv: &[String],
        options: &ExecOptions,
    ) -> RuntimeResult<ExecStream>;

    /// Reports whether an exec is still running and its exit code.
    async fn exec_status(&self, handle: &ExecHandle) -> RuntimeResult<ExecStatus>;

    /// Delivers `signal` to an exec's process and its children.
    async fn kill_exec(&self, container: &ContainerRef, handle: &ExecHandle, signal: Signal) -> RuntimeResult<()>;

    /// Starts an interactive shell on a pseudo-terminal sized `cols`×`rows`.
    async fn open_tty(
        &self,
        container: &ContainerRef,
        cols: u16,
        rows: u16,
        options: &ExecOptions,
    ) -> RuntimeResult<ExecStream>;

    /// Resizes a pseudo-terminal without interrupting its stream.
    async fn resize_tty(&self, handle: &ExecHandle, cols: u16, rows: u16) -> RuntimeResult<()>;

    /// Reads a whole file.
    async fn read_file(&self, container: &ContainerRef, path: &str) -> RuntimeResult<Bytes>;

    /// Creates or replaces a file. The parent directory must exist.
    async fn write_file(&self, container: &ContainerRef, path: &str, content: Bytes) -> RuntimeResult<()>;

    /// Lists a directory, without `.` and `..`.
    async fn list_dir(&self, container: &ContainerRef, path: &str) -> RuntimeResult<Vec<DirEntry>>;

    /// Subscribes to changes under `path`; dropping the stream unsubscribes.
    async fn subscribe_changes(&self, container: &ContainerRef, path: &str) -> RuntimeResult<ChangeStream>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_change_event_serializes_lowercase_kind() {
        let event = ChangeEvent::now("/tmp/a.txt", ChangeKind::Modified);
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "modified");
        assert_eq!(json["path"], "/tmp/a.txt");
    }

    #[test]
    fn test_exec_options_env_pairs_are_sorted() {
        let mut options = ExecOptions::default();
        options.env.insert("B".into(), "2".into());
        options.env.insert("A".into(), "1".into());
        assert_eq!(options.env_pairs(), vec!["A=1", "B=2"]);
    }

    #[test]
    fn test_signal_names() {
        assert_eq!(Signal::Term.name(), "TERM");
        assert_eq!(Signal::Kill.name(), "KILL");
    }

    #[test]
    fn test_runtime_client_is_object_safe() {
        fn assert_send_sync<T: Send + Sync + ?Sized>() {}
        assert_send_sync::<dyn RuntimeClient>();
    }
}
