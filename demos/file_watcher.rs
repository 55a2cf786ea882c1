//! Watches a directory in the sandbox while a process writes into it.
//!
//! Needs a local Docker daemon: `cargo run --example file_watcher`.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use sandbox_session::{logging, DockerRuntime, SandboxConfig, SandboxSession, StartOptions};

#[tokio::main]
async fn main() -> Result<()> {
    logging::init(true);

    let runtime = Arc::new(DockerRuntime::connect().await?.with_poll_interval(Duration::from_millis(250)));
    let session = SandboxSession::create(runtime, SandboxConfig::new("alpine:latest")).await?;
    let fs = session.filesystem();

    fs.make_dir("/tmp/out").await?;
    let (watch, _) = fs
        .watch_with("/tmp/out", |event| println!("{:<8} {}", event.kind, event.path))
        .await?;

    fs.write("/tmp/out/hello.txt", "hello\n").await?;
    session
        .processes()
        .run(
            "for i in 1 2 3; do echo $i > /tmp/out/n$i.txt; sleep 0.3; done",
            StartOptions::default(),
        )
        .await?;
    tokio::time::sleep(Duration::from_secs(1)).await;

    for entry in fs.list("/tmp/out").await? {
        println!("{}{}", entry.name, if entry.is_dir { "/" } else { "" });
    }

    watch.stop();
    session.close().await?;
    Ok(())
}
