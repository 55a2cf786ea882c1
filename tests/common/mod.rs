#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use sandbox_session::{MockRuntime, SandboxConfig, SandboxSession};
use tokio::sync::mpsc;

/// Config with the health check off and short retry delays.
pub fn config() -> SandboxConfig {
    SandboxConfig {
        health_check_interval_secs: 0,
        retry_delay_ms: 10,
        ..SandboxConfig::default()
    }
}

pub async fn running_session(runtime: &MockRuntime) -> SandboxSession {
    running_session_with(runtime, config()).await
}

pub async fn running_session_with(runtime: &MockRuntime, config: SandboxConfig) -> SandboxSession {
    SandboxSession::create(Arc::new(runtime.clone()), config)
        .await
        .expect("session should open")
}

/// Waits briefly for the next item, `None` if nothing arrives.
pub async fn next<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> Option<T> {
    tokio::time::timeout(Duration::from_secs(1), rx.recv()).await.ok().flatten()
}
