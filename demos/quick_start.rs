//! Runs a few commands and an interactive shell in a fresh sandbox.
//!
//! Needs a local Docker daemon: `cargo run --example quick_start`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use sandbox_session::{logging, DockerRuntime, SandboxConfig, SandboxSession, StartOptions, TerminalEvent};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(std::env::var_os("VERBOSE").is_some());

    let runtime = Arc::new(DockerRuntime::connect().await.context("Docker is not reachable")?);
    let mut config = SandboxConfig::new("python:3.12-slim");
    config.environment.insert("PYTHONUNBUFFERED".into(), "1".into());
    config.cwd = "/workspace".into();

    let session = SandboxSession::create(runtime, config).await?;
    info!(session_id = %session.id(), "Sandbox ready");

    let output = session
        .processes()
        .run("python -c 'print(6 * 7)'", StartOptions::default())
        .await?;
    println!("python says: {}", output.stdout_str().trim());

    let slow = session
        .processes()
        .start("sleep 30", StartOptions::default().timeout(Duration::from_secs(2)))
        .await?;
    let output = slow.wait().await;
    println!("sleep ended as {}", output.state);

    let terminal = session.terminals().open(80, 24).await?;
    terminal.add_listener(|event| {
        if let TerminalEvent::Data(data) = event {
            print!("{}", String::from_utf8_lossy(data));
        }
    })?;
    terminal.send_data("ls -la /workspace\n").await?;
    tokio::time::sleep(Duration::from_millis(500)).await;
    terminal.close().await?;

    session.close().await?;
    Ok(())
}
