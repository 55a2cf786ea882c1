//! Docker implementation of [`RuntimeClient`] over `bollard`.

use std::collections::{BTreeMap, HashMap};
use std::io::Read;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config as ContainerConfig, CreateContainerOptions, DownloadFromContainerOptions,
    InspectContainerOptions, LogOutput, RemoveContainerOptions, StopContainerOptions,
    UploadToContainerOptions,
};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults};
use bollard::service::HostConfig;
use bollard::Docker;
use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::{
    ChangeEvent, ChangeKind, ChangeStream, ContainerInfo, ContainerRef, DirEntry, ExecHandle,
    ExecOptions, ExecStatus, ExecStream, OutputChunk, PortMapping, RuntimeClient, RuntimeResult,
    Signal,
};
use crate::config::SandboxConfig;
use crate::sandbox::RuntimeError;

/// Label attached to every container this runtime creates.
const MANAGED_LABEL: &str = "sandbox-session.managed";

/// Directory holding the pid files used to signal execs.
const PID_DIR: &str = "/run/.sandbox-exec";

/// Lists directories as `d  <path>` and files as `<md5>  <path>`.
const SNAPSHOT_SCRIPT: &str = r#"[ -d "$1" ] || exit 3
find "$1" -mindepth 1 -type d -exec printf 'd  %s\n' {} + 2>/dev/null
find "$1" -mindepth 1 -type f -exec md5sum {} + 2>/dev/null
true"#;

const SHELL_SCRIPT: &str = "if command -v bash >/dev/null 2>&1; then exec bash; else exec sh; fi";

/// Runs sandboxes as Docker containers.
#[derive(Clone)]
pub struct DockerRuntime {
    docker: Docker,
    poll_interval: Duration,
}

impl DockerRuntime {
    /// Connects to the local Docker daemon and checks it responds.
    pub async fn connect() -> RuntimeResult<Self> {
        let docker = Docker::connect_with_local_defaults().map_err(|e| {
            RuntimeError::transient(format!("Failed to connect to Docker. Is Docker running? {e}"))
        })?;

        docker
            .ping()
            .await
            .map_err(|e| RuntimeError::transient(format!("Cannot ping Docker daemon: {e}")))?;

        Ok(Self::from_client(docker))
    }

    /// Wraps an existing client.
    pub fn from_client(docker: Docker) -> Self {
        Self {
            docker,
            poll_interval: Duration::from_millis(500),
        }
    }

    /// Sets how often change subscriptions re-scan the watched tree.
    #[must_use]
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval.max(Duration::from_millis(10));
        self
    }

    fn build_container_config(config: &SandboxConfig) -> RuntimeResult<ContainerConfig<String>> {
        let memory = config
            .memory_bytes()
            .map_err(|e| RuntimeError::invalid_argument(e.to_string()))?;

        let exposed_ports: HashMap<String, HashMap<(), ()>> = config
            .ports
            .iter()
            .map(|port| (format!("{port}/tcp"), HashMap::new()))
            .collect();

        let volumes = config
            .persistent_storage_path
            .as_ref()
            .map(|path| HashMap::from([(path.clone(), HashMap::new())]));

        Ok(ContainerConfig {
            image: Some(config.image.clone()),
            working_dir: Some(config.cwd.clone()),
            env: Some(config.env_pairs()),
            // Keep the container alive; all work happens through exec
            cmd: Some(vec!["sleep".to_string(), "infinity".to_string()]),
            exposed_ports: (!exposed_ports.is_empty()).then_some(exposed_ports),
            volumes,
            labels: Some(HashMap::from([(MANAGED_LABEL.to_string(), "true".to_string())])),
            host_config: Some(HostConfig {
                memory: Some(memory),
                nano_cpus: Some(config.nano_cpus()),
                publish_all_ports: Some(!config.ports.is_empty()),
                security_opt: Some(vec!["no-new-privileges:true".to_string()]),
                ..Default::default()
            }),
            ..Default::default()
        })
    }

    async fn start_attached(
        &self,
        container: &ContainerRef,
        argv: Vec<String>,
        options: &ExecOptions,
    ) -> RuntimeResult<ExecStream> {
        let kill_token = uuid::Uuid::new_v4().simple().to_string();
        let cmd = wrap_with_pid_file(&kill_token, argv);

        let exec = self
            .docker
            .create_exec(
                container.as_str(),
                CreateExecOptions {
                    cmd: Some(cmd),
                    env: Some(options.env_pairs()),
                    working_dir: options.cwd.clone(),
                    attach_stdin: Some(options.attach_stdin),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    tty: Some(options.tty),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify(e, container))?;

        let started = self
            .docker
            .start_exec(
                &exec.id,
                Some(StartExecOptions {
                    tty: options.tty,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| classify(e, container))?;

        let StartExecResults::Attached { output, input } = started else {
            return Err(RuntimeError::other(format!(
                "Exec {} started detached",
                exec.id
            )));
        };

        let container_name = container.clone();
        let output = output
            .filter_map(move |item| {
                let chunk = match item {
                    Ok(LogOutput::StdOut { message }) => Some(Ok(OutputChunk::Stdout(message))),
                    Ok(LogOutput::StdErr { message }) => Some(Ok(OutputChunk::Stderr(message))),
                    Ok(LogOutput::Console { message }) => Some(Ok(OutputChunk::Console(message))),
                    Ok(LogOutput::StdIn { .. }) => None,
                    Err(e) => Some(Err(classify(e, &container_name))),
                };
                async move { chunk }
            })
            .boxed();

        Ok(ExecStream {
            handle: ExecHandle {
                exec_id: exec.id,
                kill_token,
            },
            output,
            input,
        })
    }

    /// Runs a short command to completion and returns `(exit_code, stdout, stderr)`.
    async fn run_to_completion(
        &self,
        container: &ContainerRef,
        argv: Vec<String>,
    ) -> RuntimeResult<(i64, String, String)> {
        let exec = self
            .docker
            .create_exec(
                container.as_str(),
                CreateExecOptions {
                    cmd: Some(argv),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| classify(e, container))?;

        let mut stdout = String::new();
        let mut stderr = String::new();

        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&exec.id, None)
            .await
            .map_err(|e| classify(e, container))?
        {
            while let Some(chunk) = output.next().await {
                match chunk.map_err(|e| classify(e, container))? {
                    LogOutput::StdOut { message } | LogOutput::Console { message } => {
                        stdout.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdErr { message } => {
                        stderr.push_str(&String::from_utf8_lossy(&message));
                    }
                    LogOutput::StdIn { .. } => {}
                }
            }
        }

        let status = self.settled_status(&exec.id, container).await?;
        Ok((status.exit_code.unwrap_or(-1), stdout, stderr))
    }

    /// Polls `inspect_exec` until the exec reports it is no longer running.
    ///
    /// The attach stream can close slightly before the daemon records the exit code.
    async fn settled_status(&self, exec_id: &str, container: &ContainerRef) -> RuntimeResult<ExecStatus> {
        let mut status = ExecStatus::default();
        for _ in 0..20 {
            let inspect = self
                .docker
                .inspect_exec(exec_id)
                .await
                .map_err(|e| classify(e, container))?;
            status = ExecStatus {
                running: inspect.running.unwrap_or(false),
                exit_code: inspect.exit_code,
            };
            if !status.running {
                break;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        Ok(status)
    }

    async fn snapshot(&self, container: &ContainerRef, path: &str) -> RuntimeResult<BTreeMap<String, String>> {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            SNAPSHOT_SCRIPT.to_string(),
            "sh".to_string(),
            path.to_string(),
        ];
        let (code, stdout, stderr) = self.run_to_completion(container, argv).await?;
        match code {
            0 => Ok(parse_snapshot(&stdout)),
            3 => Err(RuntimeError::not_found(format!("{path}: no such directory"))),
            _ => Err(RuntimeError::other(format!("Failed to scan {path}: {}", stderr.trim()))),
        }
    }
}

#[async_trait]
impl RuntimeClient for DockerRuntime {
    async fn create_container(&self, name: &str, config: &SandboxConfig) -> RuntimeResult<ContainerRef> {
        let container_config = Self::build_container_config(config)?;

        debug!("Creating container: {}", name);
        self.docker
            .create_container(
                Some(CreateContainerOptions {
                    name: name.to_string(),
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| classify(e, &ContainerRef::new(name)))?;

        Ok(ContainerRef::new(name))
    }

    async fn start_container(&self, container: &ContainerRef) -> RuntimeResult<()> {
        debug!("Starting container: {}", container);
        self.docker
            .start_container::<String>(container.as_str(), None)
            .await
            .map_err(|e| classify(e, container))
    }

    async fn stop_container(&self, container: &ContainerRef, grace: Duration) -> RuntimeResult<()> {
        debug!("Stopping container: {}", container);
        let t = i64::try_from(grace.as_secs()).unwrap_or(i64::MAX);
        match self
            .docker
            .stop_container(container.as_str(), Some(StopContainerOptions { t }))
            .await
        {
            Ok(()) => Ok(()),
            // 304: already stopped
            Err(BollardError::DockerResponseServerError {
                status_code: 304, ..
            }) => Ok(()),
            Err(e) => Err(classify(e, container)),
        }
    }

    async fn remove_container(&self, container: &ContainerRef) -> RuntimeResult<()> {
        debug!("Removing container: {}", container);
        self.docker
            .remove_container(
                container.as_str(),
                Some(RemoveContainerOptions {
                    force: true,
                    v: true,
                    ..Default::default()
                }),
            )
            .await
            .map_err(|e| classify(e, container))?;
        info!("Container {} removed", container);
        Ok(())
    }

    async fn inspect_container(&self, container: &ContainerRef) -> RuntimeResult<ContainerInfo> {
        let inspect = self
            .docker
            .inspect_container(container.as_str(), None::<InspectContainerOptions>)
            .await
            .map_err(|e| classify(e, container))?;

        let running = inspect
            .state
            .as_ref()
            .and_then(|state| state.running)
            .unwrap_or(false);

        let mut ports: Vec<PortMapping> = inspect
            .network_settings
            .and_then(|settings| settings.ports)
            .unwrap_or_default()
            .into_iter()
            .filter_map(|(key, bindings)| {
                let container_port = key.split('/').next()?.parse().ok()?;
                let host_port = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .find_map(|binding| binding.host_port?.parse().ok());
                Some(PortMapping {
                    container_port,
                    host_port,
                })
            })
            .collect();
        ports.sort_by_key(|mapping| mapping.container_port);

        Ok(ContainerInfo { running, ports })
    }

    async fn exec(
        &self,
        container: &ContainerRef,
        argv: &[String],
        options: &ExecOptions,
    ) -> RuntimeResult<ExecStream> {
        if argv.is_empty() {
            return Err(RuntimeError::invalid_argument("empty command"));
        }
        self.start_attached(container, argv.to_vec(), options).await
    }

    async fn exec_status(&self, handle: &ExecHandle) -> RuntimeResult<ExecStatus> {
        let inspect = self
            .docker
            .inspect_exec(&handle.exec_id)
            .await
            .map_err(|e| classify(e, &ContainerRef::new(&handle.exec_id)))?;
        Ok(ExecStatus {
            running: inspect.running.unwrap_or(false),
            exit_code: inspect.exit_code,
        })
    }

    async fn kill_exec(&self, container: &ContainerRef, handle: &ExecHandle, signal: Signal) -> RuntimeResult<()> {
        let pid_file = format!("{PID_DIR}/{}.pid", handle.kill_token);
        let sig = signal.name();
        let mut script = format!(
            "p=$(cat {pid_file} 2>/dev/null) || exit 0; pkill -{sig} -P \"$p\" 2>/dev/null; kill -s {sig} \"$p\" 2>/dev/null"
        );
        if signal == Signal::Kill {
            script.push_str(&format!("; rm -f {pid_file}"));
        }
        script.push_str("; true");

        debug!(exec_id = %handle.exec_id, signal = sig, "Signalling exec");
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), script];
        self.run_to_completion(container, argv).await.map(|_| ())
    }

    async fn open_tty(
        &self,
        container: &ContainerRef,
        cols: u16,
        rows: u16,
        options: &ExecOptions,
    ) -> RuntimeResult<ExecStream> {
        let mut options = options.clone();
        options.tty = true;
        options.attach_stdin = true;
        options
            .env
            .entry("TERM".to_string())
            .or_insert_with(|| "xterm".to_string());

        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), SHELL_SCRIPT.to_string()];
        let stream = self.start_attached(container, argv, &options).await?;
        self.resize_tty(&stream.handle, cols, rows).await?;
        Ok(stream)
    }

    async fn resize_tty(&self, handle: &ExecHandle, cols: u16, rows: u16) -> RuntimeResult<()> {
        self.docker
            .resize_exec(
                &handle.exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(|e| classify(e, &ContainerRef::new(&handle.exec_id)))
    }

    async fn read_file(&self, container: &ContainerRef, path: &str) -> RuntimeResult<Bytes> {
        let mut stream = self.docker.download_from_container(
            container.as_str(),
            Some(DownloadFromContainerOptions {
                path: path.to_string(),
            }),
        );

        let mut archive = BytesMut::new();
        while let Some(chunk) = stream.next().await {
            archive.extend_from_slice(&chunk.map_err(|e| classify(e, container))?);
        }

        extract_single_file(&archive, path)
    }

    async fn write_file(&self, container: &ContainerRef, path: &str, content: Bytes) -> RuntimeResult<()> {
        let (dir, name) = split_path(path)?;
        let archive = build_single_file_archive(name, &content)?;

        self.docker
            .upload_to_container(
                container.as_str(),
                Some(UploadToContainerOptions {
                    path: dir.to_string(),
                    ..Default::default()
                }),
                archive,
            )
            .await
            .map_err(|e| classify(e, container))
    }

    async fn list_dir(&self, container: &ContainerRef, path: &str) -> RuntimeResult<Vec<DirEntry>> {
        let argv = vec![
            "ls".to_string(),
            "-1Ap".to_string(),
            "--".to_string(),
            path.to_string(),
        ];
        let (code, stdout, stderr) = self.run_to_completion(container, argv).await?;
        if code != 0 {
            return Err(if stderr.contains("No such file") {
                RuntimeError::not_found(format!("{path}: no such directory"))
            } else {
                RuntimeError::other(format!("Failed to list {path}: {}", stderr.trim()))
            });
        }

        Ok(stdout
            .lines()
            .filter(|line| !line.is_empty())
            .map(|line| match line.strip_suffix('/') {
                Some(name) => DirEntry {
                    name: name.to_string(),
                    is_dir: true,
                },
                None => DirEntry {
                    name: line.to_string(),
                    is_dir: false,
                },
            })
            .collect())
    }

    async fn subscribe_changes(&self, container: &ContainerRef, path: &str) -> RuntimeResult<ChangeStream> {
        // Docker has no change feed for container filesystems, so diff snapshots
        let baseline = self.snapshot(container, path).await?;

        let (tx, mut rx) = mpsc::channel::<RuntimeResult<ChangeEvent>>(256);
        let runtime = self.clone();
        let container = container.clone();
        let path = path.to_string();

        tokio::spawn(async move {
            let mut previous = baseline;
            let mut ticker = tokio::time::interval(runtime.poll_interval);
            ticker.tick().await;

            loop {
                tokio::select! {
                    () = tx.closed() => break,
                    _ = ticker.tick() => {}
                }

                match runtime.snapshot(&container, &path).await {
                    Ok(current) => {
                        for event in diff_snapshots(&previous, &current) {
                            if tx.send(Ok(event)).await.is_err() {
                                return;
                            }
                        }
                        previous = current;
                    }
                    Err(e) if e.is_transient() => {
                        debug!(path = %path, "Snapshot failed, retrying next tick: {}", e);
                    }
                    Err(e) => {
                        warn!(path = %path, "Change polling stopped: {}", e);
                        let _ = tx.send(Err(e)).await;
                        break;
                    }
                }
            }
        });

        let stream = futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx));
        Ok(stream.boxed())
    }
}

/// Prefixes `argv` with a shell that records its pid so the exec can be signalled.
///
/// The command runs as a foreground child of that shell, which removes the
/// pid file on the way out and keeps the command's exit status.
fn wrap_with_pid_file(token: &str, argv: Vec<String>) -> Vec<String> {
    let pid_file = format!("{PID_DIR}/{token}.pid");
    let script = format!(
        "mkdir -p {PID_DIR} 2>/dev/null; echo $$ > {pid_file} 2>/dev/null; \
         trap 'rm -f {pid_file}' EXIT; trap 'exit 143' TERM; \"$@\"; exit $?"
    );
    let mut cmd = vec!["/bin/sh".to_string(), "-c".to_string(), script, "sh".to_string()];
    cmd.extend(argv);
    cmd
}

/// Maps a Docker API error onto the runtime error classes.
fn classify(err: BollardError, container: &ContainerRef) -> RuntimeError {
    match err {
        BollardError::DockerResponseServerError {
            status_code,
            message,
        } => match status_code {
            404 if message.contains("No such container") => RuntimeError::container_gone(container.as_str()),
            404 => RuntimeError::not_found(message),
            409 if message.contains("is not running") => RuntimeError::container_gone(container.as_str()),
            400 => RuntimeError::invalid_argument(message),
            401 | 403 => RuntimeError::permission_denied(message),
            502..=504 => RuntimeError::transient(message),
            _ => RuntimeError::other(format!("{status_code}: {message}")),
        },
        e @ (BollardError::RequestTimeoutError
        | BollardError::IOError { .. }
        | BollardError::HyperResponseError { .. }) => RuntimeError::transient(e.to_string()),
        e => RuntimeError::other(e.to_string()),
    }
}

fn split_path(path: &str) -> RuntimeResult<(&str, &str)> {
    match path.rsplit_once('/') {
        Some((_, "")) | None => Err(RuntimeError::invalid_argument(format!(
            "'{path}' is not an absolute file path"
        ))),
        Some(("", name)) => Ok(("/", name)),
        Some((dir, name)) => Ok((dir, name)),
    }
}

fn build_single_file_archive(name: &str, content: &[u8]) -> RuntimeResult<Bytes> {
    let mut header = tar::Header::new_gnu();
    header.set_size(content.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0));
    header.set_cksum();

    let mut tar_buf = Vec::new();
    {
        let mut tar = tar::Builder::new(&mut tar_buf);
        tar.append_data(&mut header, name, content)
            .map_err(|e| RuntimeError::other(format!("Failed to build archive: {e}")))?;
        tar.finish()
            .map_err(|e| RuntimeError::other(format!("Failed to finalize archive: {e}")))?;
    }
    Ok(Bytes::from(tar_buf))
}

fn extract_single_file(archive: &[u8], path: &str) -> RuntimeResult<Bytes> {
    let mut archive = tar::Archive::new(archive);
    let mut entries = archive
        .entries()
        .map_err(|e| RuntimeError::other(format!("Failed to read archive for {path}: {e}")))?;

    let mut entry = entries
        .next()
        .ok_or_else(|| RuntimeError::not_found(path.to_string()))?
        .map_err(|e| RuntimeError::other(format!("Failed to read archive for {path}: {e}")))?;

    if entry.header().entry_type().is_dir() {
        return Err(RuntimeError::invalid_argument(format!("{path} is a directory")));
    }

    let mut content = Vec::new();
    entry
        .read_to_end(&mut content)
        .map_err(|e| RuntimeError::other(format!("Failed to read {path}: {e}")))?;
    Ok(Bytes::from(content))
}

fn parse_snapshot(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| line.split_once("  "))
        .map(|(digest, path)| (path.to_string(), digest.to_string()))
        .collect()
}

fn diff_snapshots(previous: &BTreeMap<String, String>, current: &BTreeMap<String, String>) -> Vec<ChangeEvent> {
    let mut events = Vec::new();
    for (path, digest) in current {
        match previous.get(path) {
            None => events.push(ChangeEvent::now(path, ChangeKind::Created)),
            Some(old) if old != digest => events.push(ChangeEvent::now(path, ChangeKind::Modified)),
            Some(_) => {}
        }
    }
    for path in previous.keys().filter(|path| !current.contains_key(*path)) {
        events.push(ChangeEvent::now(path, ChangeKind::Deleted));
    }
    events
}
