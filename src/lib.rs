//! Session layer for long-lived container sandboxes.
//!
//! A [`SandboxSession`] owns one container and multiplexes three subsystems
//! over it:
//!
//! - [`ProcessManager`] runs commands and buffers their output
//! - [`TerminalManager`] opens interactive PTY shells
//! - [`Filesystem`] reads, writes and watches files
//!
//! Every call into the container engine goes through a [`RuntimeClient`].
//! [`DockerRuntime`] talks to a local Docker daemon and [`MockRuntime`] keeps
//! everything in memory for tests.

pub mod config;
pub mod filesystem;
mod listeners;
pub mod logging;
pub mod process;
pub mod runtime;
pub mod sandbox;
pub mod terminal;

pub use config::SandboxConfig;
pub use filesystem::{Filesystem, Watch};
pub use listeners::ListenerId;
pub use process::{
    Process, ProcessEvent, ProcessManager, ProcessOutput, ProcessState, StartOptions, TimedChunk,
};
pub use runtime::{
    ChangeEvent, ChangeKind, DirEntry, DockerRuntime, MockRuntime, PortMapping, RuntimeClient,
};
pub use sandbox::{RetryPolicy, RuntimeError, SandboxError, SandboxSession, SessionStatus};
pub use terminal::{TerminalEvent, TerminalManager, TerminalOptions, TerminalSession, TerminalState};

/// Result type used throughout the crate.
pub type Result<T> = std::result::Result<T, SandboxError>;
