use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use super::{RetryPolicy, SandboxError, SessionStatus};
use crate::config::SandboxConfig;
use crate::filesystem::Filesystem;
use crate::process::ProcessManager;
use crate::runtime::{
    ContainerRef, ExecHandle, ExecOptions, ExecStatus, ExecStream, OutputChunk, PortMapping,
    RuntimeClient, RuntimeResult, Signal,
};
use crate::terminal::TerminalManager;
use crate::Result;

/// How often a finished exec is re-inspected before its exit code is final.
const SETTLE_INTERVAL: Duration = Duration::from_millis(25);
const SETTLE_ATTEMPTS: u32 = 40;

/// Output of a command run to completion on behalf of the session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CommandOutput {
    pub(crate) exit_code: Option<i64>,
    pub(crate) stdout: Bytes,
    pub(crate) stderr: Bytes,
}

impl CommandOutput {
    pub(crate) fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// State shared between a session and the handles it gives out.
///
/// Subsystems hold it through a `Weak`; once the session is dropped every
/// handle reports the session as stopped.
pub(crate) struct SessionInner {
    id: String,
    config: SandboxConfig,
    runtime: Arc<dyn RuntimeClient>,
    retry: RetryPolicy,
    status: watch::Sender<SessionStatus>,
    // Set iff status is RUNNING or STOPPING; status changes happen under this lock.
    container: Mutex<Option<ContainerRef>>,
}

impl SessionInner {
    fn new(id: String, config: SandboxConfig, runtime: Arc<dyn RuntimeClient>) -> Self {
        let (status, _) = watch::channel(SessionStatus::Creating);
        Self {
            id,
            retry: RetryPolicy::from_config(&config),
            config,
            runtime,
            status,
            container: Mutex::new(None),
        }
    }

    pub(crate) fn id(&self) -> &str {
        &self.id
    }

    pub(crate) fn config(&self) -> &SandboxConfig {
        &self.config
    }

    pub(crate) fn status(&self) -> SessionStatus {
        *self.status.borrow()
    }

    pub(crate) fn subscribe(&self) -> watch::Receiver<SessionStatus> {
        self.status.subscribe()
    }

    fn lock_container(&self) -> MutexGuard<'_, Option<ContainerRef>> {
        self.container.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The container, if the session is RUNNING.
    fn running_container(&self) -> Result<ContainerRef> {
        let slot = self.lock_container();
        let status = self.status();
        match (&*slot, status) {
            (Some(container), SessionStatus::Running) => Ok(container.clone()),
            _ => Err(SandboxError::not_running(status)),
        }
    }

    /// Fails with a precondition error unless the session is RUNNING.
    pub(crate) fn ensure_running(&self) -> Result<()> {
        self.running_container().map(|_| ())
    }

    /// Moves from any of `from` to `to`, keeping the container slot in step.
    fn transition(&self, from: &[SessionStatus], to: SessionStatus, container: Option<ContainerRef>) -> bool {
        let mut slot = self.lock_container();
        let current = self.status();
        if !from.contains(&current) {
            return false;
        }
        match to {
            SessionStatus::Running => *slot = container,
            SessionStatus::Stopping => {}
            _ => *slot = None,
        }
        self.status.send_replace(to);
        debug!(session_id = %self.id, from = %current, to = %to, "Session status changed");
        true
    }

    /// Marks the session FAILED after an unrecoverable error.
    pub(crate) fn fail(&self, reason: &str) -> bool {
        let failed = self.transition(
            &[SessionStatus::Creating, SessionStatus::Running],
            SessionStatus::Failed,
            None,
        );
        if failed {
            error!(session_id = %self.id, "Sandbox session failed: {}", reason);
        }
        failed
    }

    /// Runs a runtime call against the session's container.
    ///
    /// Fails fast when the session is not RUNNING, retries transient errors,
    /// and bounds the whole call by the configured operation timeout.
    pub(crate) async fn call<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn RuntimeClient>, ContainerRef) -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        self.call_with_deadline(operation, None, call).await
    }

    /// Like [`call`](Self::call) with an explicit deadline.
    pub(crate) async fn call_with_deadline<T, F, Fut>(
        &self,
        operation: &'static str,
        deadline: Option<Duration>,
        call: F,
    ) -> Result<T>
    where
        F: Fn(Arc<dyn RuntimeClient>, ContainerRef) -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        let container = self.running_container()?;
        let deadline = deadline.unwrap_or_else(|| self.config.operation_timeout());
        let attempts = self
            .retry
            .run(operation, || call(Arc::clone(&self.runtime), container.clone()));

        let result = match tokio::time::timeout(deadline, attempts).await {
            Ok(result) => result,
            Err(_) => Err(SandboxError::timeout(operation, deadline)),
        };
        if let Err(err) = &result {
            if err.is_container_gone() {
                self.fail(&format!("container disappeared during {operation}"));
            }
        }
        result
    }

    /// Runtime call made while tearing down; only needs the container to exist.
    pub(crate) async fn teardown_call<T, F, Fut>(&self, operation: &'static str, call: F) -> Result<T>
    where
        F: Fn(Arc<dyn RuntimeClient>, ContainerRef) -> Fut,
        Fut: Future<Output = RuntimeResult<T>>,
    {
        let container = self
            .lock_container()
            .clone()
            .ok_or_else(|| SandboxError::not_running(self.status()))?;
        self.retry
            .run(operation, || call(Arc::clone(&self.runtime), container.clone()))
            .await
    }

    /// Runs `argv` to completion and collects its output.
    ///
    /// An exec still running at the deadline is killed.
    pub(crate) async fn run_command(
        &self,
        operation: &'static str,
        argv: &[String],
        deadline: Option<Duration>,
    ) -> Result<CommandOutput> {
        let options = ExecOptions::default();
        let options = &options;
        let stream = self
            .call_with_deadline(operation, deadline, |runtime, container| async move {
                runtime.exec(&container, argv, options).await
            })
            .await?;
        let handle = stream.handle.clone();
        let deadline = deadline.unwrap_or_else(|| self.config.operation_timeout());
        match tokio::time::timeout(deadline, self.collect(stream)).await {
            Ok(output) => output,
            Err(_) => {
                warn!(session_id = %self.id, operation, "Command timed out, killing it");
                let handle = &handle;
                let killed = self
                    .call("kill_exec", |runtime, container| async move {
                        runtime.kill_exec(&container, handle, Signal::Kill).await
                    })
                    .await;
                if let Err(err) = killed {
                    debug!(session_id = %self.id, "Failed to kill timed out command: {}", err);
                }
                Err(SandboxError::timeout(operation, deadline))
            }
        }
    }

    async fn collect(&self, stream: ExecStream) -> Result<CommandOutput> {
        let ExecStream {
            handle,
            mut output,
            input,
        } = stream;
        drop(input);

        let mut stdout = BytesMut::new();
        let mut stderr = BytesMut::new();
        while let Some(chunk) = output.next().await {
            match chunk? {
                OutputChunk::Stdout(data) | OutputChunk::Console(data) => stdout.extend_from_slice(&data),
                OutputChunk::Stderr(data) => stderr.extend_from_slice(&data),
            }
        }

        let status = self.settle(&handle).await?;
        Ok(CommandOutput {
            exit_code: status.exit_code,
            stdout: stdout.freeze(),
            stderr: stderr.freeze(),
        })
    }

    /// Exit status of an exec whose output stream has ended.
    ///
    /// The runtime may still report the exec as running for a moment after
    /// its streams close, so this re-inspects briefly.
    pub(crate) async fn settle(&self, handle: &ExecHandle) -> Result<ExecStatus> {
        let mut status = ExecStatus::default();
        for _ in 0..SETTLE_ATTEMPTS {
            status = self
                .retry
                .run("exec_status", || self.runtime.exec_status(handle))
                .await?;
            if !status.running {
                break;
            }
            tokio::time::sleep(SETTLE_INTERVAL).await;
        }
        Ok(status)
    }

    /// No-op exec proving the container accepts commands.
    async fn ready_check(&self, container: &ContainerRef) -> Result<()> {
        let argv = ["true".to_string()];
        let options = ExecOptions::default();
        let stream = self
            .retry
            .run("exec", || self.runtime.exec(container, &argv, &options))
            .await?;
        let output = self.collect(stream).await?;
        if output.success() {
            Ok(())
        } else {
            Err(SandboxError::session_failed(format!(
                "readiness check exited with {:?}",
                output.exit_code
            )))
        }
    }

    /// Retries the readiness check until it passes or the operation timeout expires.
    async fn wait_ready(&self, container: &ContainerRef) -> Result<()> {
        let deadline = self.config.operation_timeout();
        let pause = self.retry.base_delay.max(Duration::from_millis(50));
        let ready = async {
            loop {
                match self.ready_check(container).await {
                    Ok(()) => return Ok(()),
                    Err(err) if err.is_container_gone() => return Err(err),
                    Err(err) => {
                        debug!(session_id = %self.id, "Readiness check failed, retrying: {}", err);
                        tokio::time::sleep(pause).await;
                    }
                }
            }
        };
        tokio::time::timeout(deadline, ready)
            .await
            .map_err(|_| SandboxError::timeout("readiness check", deadline))?
    }

    /// Stops and removes the container. A container that is already gone counts as removed.
    async fn release(&self, container: &ContainerRef) -> Result<()> {
        let grace = self.config.kill_grace();
        match self
            .retry
            .run("stop_container", || self.runtime.stop_container(container, grace))
            .await
        {
            Ok(()) => {}
            Err(err) if err.is_container_gone() => {
                debug!(session_id = %self.id, "Container already gone");
                return Ok(());
            }
            Err(err) => warn!(session_id = %self.id, "Failed to stop container, removing anyway: {}", err),
        }

        match self
            .retry
            .run("remove_container", || self.runtime.remove_container(container))
            .await
        {
            Err(err) if !err.is_container_gone() => Err(err),
            _ => Ok(()),
        }
    }

    /// One health check tick. Returns false once checking should stop.
    async fn check_health(&self) -> bool {
        let Ok(container) = self.running_container() else {
            return false;
        };
        match self.runtime.inspect_container(&container).await {
            Ok(info) if info.running => true,
            Ok(_) => {
                self.fail("container stopped unexpectedly");
                false
            }
            Err(err) if err.is_container_gone() => {
                self.fail(&err.to_string());
                false
            }
            Err(err) => {
                warn!(session_id = %self.id, "Health check failed: {}", err);
                true
            }
        }
    }
}

/// Resolves when the session starts shutting down or is dropped.
pub(crate) async fn session_ended(status: &mut watch::Receiver<SessionStatus>) {
    let _ = status.wait_for(|status| status.is_shutdown()).await;
}

/// Upgrades a handle's session reference, treating a dropped session as stopped.
pub(crate) fn upgrade(session: &Weak<SessionInner>) -> Result<Arc<SessionInner>> {
    session
        .upgrade()
        .ok_or_else(|| SandboxError::not_running(SessionStatus::Stopped))
}

fn short_id() -> String {
    uuid::Uuid::new_v4()
        .to_string()
        .split('-')
        .next()
        .unwrap_or_default()
        .to_string()
}

/// A long-lived container plus the subsystems multiplexed over it.
///
/// ```no_run
/// # async fn demo() -> sandbox_session::Result<()> {
/// use std::sync::Arc;
/// use sandbox_session::{DockerRuntime, SandboxConfig, SandboxSession, StartOptions};
///
/// let runtime = Arc::new(DockerRuntime::connect().await?);
/// let session = SandboxSession::create(runtime, SandboxConfig::new("alpine:latest")).await?;
/// let output = session.processes().run("echo hello", StartOptions::default()).await?;
/// assert_eq!(output.stdout_str(), "hello\n");
/// session.close().await?;
/// # Ok(())
/// # }
/// ```
pub struct SandboxSession {
    inner: Arc<SessionInner>,
    processes: ProcessManager,
    terminals: TerminalManager,
    filesystem: Filesystem,
    health: Mutex<Option<JoinHandle<()>>>,
}

impl SandboxSession {
    /// Creates a session in CREATING without touching the runtime.
    pub fn new(runtime: Arc<dyn RuntimeClient>, config: SandboxConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self::with_id(runtime, config, short_id()))
    }

    fn with_id(runtime: Arc<dyn RuntimeClient>, config: SandboxConfig, id: String) -> Self {
        let inner = Arc::new(SessionInner::new(id, config, runtime));
        let weak = Arc::downgrade(&inner);
        Self {
            processes: ProcessManager::new(weak.clone()),
            terminals: TerminalManager::new(weak.clone()),
            filesystem: Filesystem::new(weak),
            inner,
            health: Mutex::new(None),
        }
    }

    /// Creates a session and brings its container up.
    pub async fn create(runtime: Arc<dyn RuntimeClient>, config: SandboxConfig) -> Result<Self> {
        let session = Self::new(runtime, config)?;
        session.open().await?;
        Ok(session)
    }

    /// Creates and starts the container, then waits until it accepts commands.
    ///
    /// On failure the session is FAILED and a half-created container is removed.
    pub async fn open(&self) -> Result<()> {
        let status = self.status();
        if status != SessionStatus::Creating {
            return Err(SandboxError::invalid_state(format!("session {}", self.id()), status));
        }

        let inner = &self.inner;
        let name = self.container_name();
        info!(
            session_id = %inner.id,
            image = %inner.config.image,
            container = %name,
            "Creating sandbox container"
        );

        let container = match inner
            .retry
            .run("create_container", || inner.runtime.create_container(&name, &inner.config))
            .await
        {
            Ok(container) => container,
            Err(err) => {
                inner.fail(&format!("could not create container: {err}"));
                return Err(err);
            }
        };

        let booted = async {
            inner
                .retry
                .run("start_container", || inner.runtime.start_container(&container))
                .await?;
            inner.wait_ready(&container).await
        }
        .await;

        if let Err(err) = booted {
            self.discard(&container).await;
            inner.fail(&format!("container did not start: {err}"));
            return Err(err);
        }

        if !inner.transition(&[SessionStatus::Creating], SessionStatus::Running, Some(container.clone())) {
            // Closed while starting
            self.discard(&container).await;
            return Err(SandboxError::not_running(self.status()));
        }

        info!(session_id = %inner.id, container = %container, "Sandbox session running");
        self.spawn_health_check();
        Ok(())
    }

    /// Reconnects to the container of an earlier session with the same id.
    ///
    /// A stopped container is started again. The returned session keeps `id`.
    pub async fn attach(
        runtime: Arc<dyn RuntimeClient>,
        id: impl Into<String>,
        config: SandboxConfig,
    ) -> Result<Self> {
        config.validate()?;
        let session = Self::with_id(runtime, config, id.into());
        let inner = &session.inner;
        let container = ContainerRef::new(session.container_name());
        info!(session_id = %inner.id, container = %container, "Attaching to sandbox container");

        let attached: Result<()> = async {
            let info = inner
                .retry
                .run("inspect_container", || inner.runtime.inspect_container(&container))
                .await?;
            if !info.running {
                inner
                    .retry
                    .run("start_container", || inner.runtime.start_container(&container))
                    .await?;
            }
            inner.wait_ready(&container).await
        }
        .await;

        if let Err(err) = attached {
            inner.fail(&format!("could not attach: {err}"));
            return Err(err);
        }

        inner.transition(&[SessionStatus::Creating], SessionStatus::Running, Some(container));
        session.spawn_health_check();
        Ok(session)
    }

    async fn discard(&self, container: &ContainerRef) {
        if let Err(err) = self.inner.runtime.remove_container(container).await {
            warn!(
                session_id = %self.inner.id,
                container = %container,
                "Failed to remove half-created container: {}",
                err
            );
        }
    }

    fn spawn_health_check(&self) {
        let Some(interval) = self.inner.config.health_check_interval() else {
            return;
        };
        let session = Arc::downgrade(&self.inner);
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = session.upgrade() else {
                    break;
                };
                if !inner.check_health().await {
                    break;
                }
            }
        });
        *self.health.lock().unwrap_or_else(PoisonError::into_inner) = Some(task);
    }

    fn stop_health_check(&self) {
        if let Some(task) = self.health.lock().unwrap_or_else(PoisonError::into_inner).take() {
            task.abort();
        }
    }

    /// Session identifier, stable for the session's lifetime.
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Name of the backing container.
    pub fn container_name(&self) -> String {
        format!("{}-{}", self.inner.config.container_prefix, self.inner.id)
    }

    /// Configuration the session was created with.
    pub fn config(&self) -> &SandboxConfig {
        &self.inner.config
    }

    /// Current lifecycle status.
    pub fn status(&self) -> SessionStatus {
        self.inner.status()
    }

    /// Receiver that observes every status change.
    pub fn subscribe_status(&self) -> watch::Receiver<SessionStatus> {
        self.inner.subscribe()
    }

    /// Waits until the status satisfies `predicate`.
    pub async fn wait_for_status(
        &self,
        mut predicate: impl FnMut(SessionStatus) -> bool,
        deadline: Duration,
    ) -> Result<SessionStatus> {
        let mut status = self.subscribe_status();
        let matched = tokio::time::timeout(deadline, status.wait_for(|status| predicate(*status)))
            .await
            .map_err(|_| SandboxError::timeout("wait_for_status", deadline))?;
        matched
            .map(|status| *status)
            .map_err(|_| SandboxError::session_failed("status channel closed"))
    }

    /// Declared ports and the host ports they are published on.
    pub async fn exposed_ports(&self) -> Result<Vec<PortMapping>> {
        let info = self
            .inner
            .call("inspect_container", |runtime, container| async move {
                runtime.inspect_container(&container).await
            })
            .await?;
        Ok(info.ports)
    }

    /// Runs commands in the container.
    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    /// Opens interactive terminals in the container.
    pub fn terminals(&self) -> &TerminalManager {
        &self.terminals
    }

    /// Reads, writes and watches files in the container.
    pub fn filesystem(&self) -> &Filesystem {
        &self.filesystem
    }

    /// Tears the session down and releases the container.
    ///
    /// Processes are killed, terminals closed and watches stopped before the
    /// container is stopped and removed. Closing a STOPPED session is a no-op.
    /// If removal fails the session ends FAILED and `SessionFailed` is returned.
    pub async fn close(&self) -> Result<()> {
        let inner = &self.inner;
        loop {
            let live = self.processes.live();
            if inner.transition(&[SessionStatus::Running], SessionStatus::Stopping, None) {
                return self.shutdown(live).await;
            }
            match inner.status() {
                SessionStatus::Stopped => return Ok(()),
                SessionStatus::Creating => {
                    if inner.transition(&[SessionStatus::Creating], SessionStatus::Stopped, None) {
                        info!(session_id = %inner.id, "Session closed before it was opened");
                        return Ok(());
                    }
                }
                SessionStatus::Failed => {
                    self.stop_health_check();
                    self.terminals.close_all().await;
                    self.filesystem.stop_watches();
                    self.processes.clear();
                    self.terminals.clear();
                    return Ok(());
                }
                SessionStatus::Stopping => {
                    let settled = self
                        .subscribe_status()
                        .wait_for(|status| *status != SessionStatus::Stopping)
                        .await
                        .map(|status| *status);
                    return match settled {
                        Ok(SessionStatus::Stopped) => Ok(()),
                        _ => Err(SandboxError::session_failed("concurrent close failed")),
                    };
                }
                SessionStatus::Running => {}
            }
        }
    }

    async fn shutdown(&self, live: Vec<crate::process::Process>) -> Result<()> {
        let inner = &self.inner;
        info!(session_id = %inner.id, "Closing sandbox session");

        self.stop_health_check();
        self.processes.kill_all(live).await;
        self.terminals.close_all().await;
        self.filesystem.stop_watches();
        self.processes.clear();
        self.terminals.clear();

        let container = inner.lock_container().clone();
        let released = match &container {
            Some(container) => inner.release(container).await,
            None => Ok(()),
        };

        match released {
            Ok(()) => {
                inner.transition(&[SessionStatus::Stopping], SessionStatus::Stopped, None);
                info!(session_id = %inner.id, "Sandbox session stopped");
                Ok(())
            }
            Err(err) => {
                inner.transition(&[SessionStatus::Stopping], SessionStatus::Failed, None);
                error!(session_id = %inner.id, "Failed to remove container: {}", err);
                Err(SandboxError::session_failed(format!(
                    "container {} could not be removed: {err}",
                    self.container_name()
                )))
            }
        }
    }
}

impl Drop for SandboxSession {
    fn drop(&mut self) {
        self.stop_health_check();
        if self.status() == SessionStatus::Running {
            warn!(
                session_id = %self.inner.id,
                container = %self.container_name(),
                "Sandbox session dropped while running; container left behind"
            );
        }
    }
}

impl std::fmt::Debug for SandboxSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxSession")
            .field("id", &self.inner.id)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}
