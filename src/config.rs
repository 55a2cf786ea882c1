use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::sandbox::SandboxError;

/// Immutable snapshot of everything a sandbox session is created with.
///
/// Unknown keys are rejected when deserializing, so a typo in a config file
/// surfaces as an error instead of silently falling back to a default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SandboxConfig {
    /// Container image reference
    #[serde(default = "default_image")]
    pub image: String,

    /// Dockerfile for an externally built image (not built by the session)
    #[serde(default)]
    pub dockerfile: Option<String>,

    /// Build context for `dockerfile`
    #[serde(default)]
    pub dockerfile_context: Option<String>,

    /// CPU limit in cores (e.g. 0.5, 2)
    #[serde(default = "default_cpu")]
    pub cpu: f64,

    /// Memory limit (e.g., "512m", "1g", or plain bytes)
    #[serde(default = "default_memory")]
    pub memory: String,

    /// Environment variables for every process in the container
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Mount point for a volume that outlives individual commands
    #[serde(default)]
    pub persistent_storage_path: Option<String>,

    /// Default working directory inside the container
    #[serde(default = "default_cwd")]
    pub cwd: String,

    /// Container ports to expose and publish on the host
    #[serde(default)]
    pub ports: Vec<u16>,

    /// Default deadline for a single runtime operation, in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,

    /// Retries after the first attempt on transient runtime errors
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Delay before the first retry, in milliseconds
    #[serde(default = "default_retry_delay")]
    pub retry_delay_ms: u64,

    /// Backoff growth factor between retries
    #[serde(default = "default_retry_multiplier")]
    pub retry_multiplier: f64,

    /// Upper bound for a single retry delay, in milliseconds
    #[serde(default = "default_retry_max_delay")]
    pub retry_max_delay_ms: u64,

    /// Per-stream cap for buffered process output, in bytes
    #[serde(default = "default_output_buffer")]
    pub output_buffer_bytes: usize,

    /// Finished processes kept for `get`/`list` before the oldest are dropped
    #[serde(default = "default_process_retention")]
    pub process_retention: usize,

    /// Background health check period in seconds (0 disables it)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval_secs: u64,

    /// Time a process gets to exit after SIGTERM before SIGKILL
    #[serde(default = "default_kill_grace")]
    pub kill_grace_secs: u64,

    /// Prefix for container names
    #[serde(default = "default_container_prefix")]
    pub container_prefix: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: default_image(),
            dockerfile: None,
            dockerfile_context: None,
            cpu: default_cpu(),
            memory: default_memory(),
            environment: BTreeMap::new(),
            persistent_storage_path: None,
            cwd: default_cwd(),
            ports: Vec::new(),
            timeout_secs: default_timeout(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay(),
            retry_multiplier: default_retry_multiplier(),
            retry_max_delay_ms: default_retry_max_delay(),
            output_buffer_bytes: default_output_buffer(),
            process_retention: default_process_retention(),
            health_check_interval_secs: default_health_check_interval(),
            kill_grace_secs: default_kill_grace(),
            container_prefix: default_container_prefix(),
        }
    }
}

// Default value functions
fn default_image() -> String {
    "alpine:latest".to_string()
}

fn default_cpu() -> f64 {
    1.0
}

fn default_memory() -> String {
    "1g".to_string()
}

fn default_cwd() -> String {
    "/home/user".to_string()
}

fn default_timeout() -> u64 {
    30
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay() -> u64 {
    500
}

fn default_retry_multiplier() -> f64 {
    2.0
}

fn default_retry_max_delay() -> u64 {
    30_000
}

fn default_output_buffer() -> usize {
    1024 * 1024
}

fn default_process_retention() -> usize {
    256
}

fn default_health_check_interval() -> u64 {
    5
}

fn default_kill_grace() -> u64 {
    5
}

fn default_container_prefix() -> String {
    "sandbox".to_string()
}

impl SandboxConfig {
    /// Creates a default configuration for the given image.
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            image: image.into(),
            ..Self::default()
        }
    }

    /// Checks the values the session relies on.
    pub fn validate(&self) -> Result<(), SandboxError> {
        if self.image.trim().is_empty() {
            return Err(SandboxError::invalid_config("image must not be empty"));
        }
        if !self.cpu.is_finite() || self.cpu <= 0.0 {
            return Err(SandboxError::invalid_config(format!(
                "cpu must be positive, got {}",
                self.cpu
            )));
        }
        self.memory_bytes()?;
        if !self.cwd.starts_with('/') {
            return Err(SandboxError::invalid_config(format!(
                "cwd must be an absolute path, got '{}'",
                self.cwd
            )));
        }
        if let Some(path) = &self.persistent_storage_path {
            if !path.starts_with('/') {
                return Err(SandboxError::invalid_config(format!(
                    "persistent_storage_path must be absolute, got '{path}'"
                )));
            }
        }
        if self.timeout_secs == 0 {
            return Err(SandboxError::invalid_config("timeout_secs must be greater than zero"));
        }
        if self.output_buffer_bytes == 0 {
            return Err(SandboxError::invalid_config(
                "output_buffer_bytes must be greater than zero",
            ));
        }
        if !self.retry_multiplier.is_finite() || self.retry_multiplier < 1.0 {
            return Err(SandboxError::invalid_config(format!(
                "retry_multiplier must be at least 1.0, got {}",
                self.retry_multiplier
            )));
        }
        if self.container_prefix.is_empty() {
            return Err(SandboxError::invalid_config("container_prefix must not be empty"));
        }
        Ok(())
    }

    /// Memory limit in bytes.
    pub fn memory_bytes(&self) -> Result<i64, SandboxError> {
        parse_memory_limit(&self.memory)
    }

    /// CPU limit in the runtime's billionths-of-a-core unit.
    #[allow(clippy::cast_possible_truncation)]
    pub fn nano_cpus(&self) -> i64 {
        (self.cpu * 1_000_000_000.0) as i64
    }

    /// Default deadline for one runtime operation.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Background health check period, or `None` when disabled.
    pub fn health_check_interval(&self) -> Option<Duration> {
        (self.health_check_interval_secs > 0)
            .then(|| Duration::from_secs(self.health_check_interval_secs))
    }

    /// Grace period between SIGTERM and SIGKILL.
    pub fn kill_grace(&self) -> Duration {
        Duration::from_secs(self.kill_grace_secs)
    }

    /// Environment as `KEY=value` pairs.
    pub fn env_pairs(&self) -> Vec<String> {
        self.environment
            .iter()
            .map(|(key, value)| format!("{key}={value}"))
            .collect()
    }
}

/// Parse memory limit string (e.g., "8g", "512m") to bytes
pub(crate) fn parse_memory_limit(limit: &str) -> Result<i64, SandboxError> {
    let limit = limit.trim().to_lowercase();
    let invalid = || SandboxError::invalid_config(format!("Invalid memory limit: '{limit}'"));

    let (digits, multiplier) = if let Some(num) = limit.strip_suffix('g') {
        (num, 1024 * 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('m') {
        (num, 1024 * 1024)
    } else if let Some(num) = limit.strip_suffix('k') {
        (num, 1024)
    } else {
        (limit.as_str(), 1)
    };

    let value: i64 = digits.parse().map_err(|_| invalid())?;
    if value <= 0 {
        return Err(invalid());
    }
    value.checked_mul(multiplier).ok_or_else(invalid)
}
