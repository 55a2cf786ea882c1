//! Commands executed inside a session's container.
//!
//! Each [`Process`] gets a session-scoped pid, bounded stdout/stderr logs and
//! an input stream. A background task drains the runtime's output stream
//! into the logs and records how the process ended.

mod buffer;

use std::collections::BTreeMap;
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use serde::Serialize;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::watch;
use tracing::{debug, info, warn};

pub use buffer::TimedChunk;
use buffer::OutputBuffer;

use crate::listeners::{Listener, ListenerId, ListenerRegistry};
use crate::runtime::{ExecHandle, ExecOptions, ExecStream, OutputChunk, RuntimeResult, Signal};
use crate::sandbox::{session_ended, upgrade, RuntimeError, SandboxError, SessionInner, SessionStatus};
use crate::Result;

/// Lifecycle of a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessState {
    /// Exec requested, output not yet flowing.
    Started,
    /// The runtime confirmed the process is running.
    Running,
    /// Ended on its own; the exit code is known.
    Exited,
    /// Ended by an explicit kill or session teardown.
    Killed,
    /// Killed because its timeout expired.
    TimedOut,
}

impl ProcessState {
    /// Returns true once the process can no longer change state.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Exited | Self::Killed | Self::TimedOut)
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Started => write!(f, "started"),
            Self::Running => write!(f, "running"),
            Self::Exited => write!(f, "exited"),
            Self::Killed => write!(f, "killed"),
            Self::TimedOut => write!(f, "timed_out"),
        }
    }
}

/// What a process output listener receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProcessEvent {
    /// A stdout chunk, before it is buffered.
    Stdout(Bytes),
    /// A stderr chunk, before it is buffered.
    Stderr(Bytes),
    /// The process reached a terminal state. Sent once, last.
    Exit {
        state: ProcessState,
        exit_code: Option<i64>,
    },
}

impl ProcessEvent {
    fn from_chunk(chunk: &OutputChunk) -> Self {
        match chunk {
            OutputChunk::Stdout(data) | OutputChunk::Console(data) => Self::Stdout(data.clone()),
            OutputChunk::Stderr(data) => Self::Stderr(data.clone()),
        }
    }
}

/// Options for [`ProcessManager::start`].
#[derive(Debug, Clone, PartialEq)]
pub struct StartOptions {
    /// Working directory; the session's `cwd` when `None`.
    pub cwd: Option<String>,
    /// Environment layered over the session's.
    pub env: BTreeMap<String, String>,
    /// Kill the process (state TIMED_OUT) if it runs longer than this.
    pub timeout: Option<Duration>,
    /// Run through `/bin/sh -c`. When false the command is split into argv.
    pub shell: bool,
    /// Deadline for starting the exec; the session's operation timeout when `None`.
    pub deadline: Option<Duration>,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            cwd: None,
            env: BTreeMap::new(),
            timeout: None,
            shell: true,
            deadline: None,
        }
    }
}

impl StartOptions {
    #[must_use]
    pub fn cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn without_shell(mut self) -> Self {
        self.shell = false;
        self
    }

    #[must_use]
    pub fn deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

/// Snapshot of a process's result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub pid: u64,
    pub state: ProcessState,
    /// Exit code; `None` unless `state` is [`ProcessState::Exited`].
    pub exit_code: Option<i64>,
    pub stdout: Bytes,
    pub stderr: Bytes,
    /// Bytes discarded from the front of stdout after the buffer filled.
    pub stdout_dropped: u64,
    /// Bytes discarded from the front of stderr after the buffer filled.
    pub stderr_dropped: u64,
}

impl ProcessOutput {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }

    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).into_owned()
    }

    /// Whether either stream lost its oldest bytes.
    pub fn is_truncated(&self) -> bool {
        self.stdout_dropped > 0 || self.stderr_dropped > 0
    }

    /// Whether the captured output may not be everything the process wrote.
    pub fn may_be_incomplete(&self) -> bool {
        self.is_truncated() || matches!(self.state, ProcessState::Killed | ProcessState::TimedOut)
    }

    /// Exited with code zero.
    pub fn success(&self) -> bool {
        self.state == ProcessState::Exited && self.exit_code == Some(0)
    }
}

struct Logs {
    stdout: OutputBuffer,
    stderr: OutputBuffer,
    exit_code: Option<i64>,
}

type Stdin = Pin<Box<dyn AsyncWrite + Send>>;

struct ProcessShared {
    pid: u64,
    command: String,
    session: Weak<SessionInner>,
    handle: ExecHandle,
    state: watch::Sender<ProcessState>,
    logs: Mutex<Logs>,
    listeners: Mutex<ListenerRegistry<ProcessEvent>>,
    // Writers queue on this lock, so bytes reach the stream in call order
    stdin: tokio::sync::Mutex<Option<Stdin>>,
    kill_requested: AtomicBool,
}

/// Handle to a process started by a [`ProcessManager`].
///
/// Cheap to clone; all clones observe the same process.
#[derive(Clone)]
pub struct Process {
    shared: Arc<ProcessShared>,
}

impl fmt::Debug for Process {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.shared.pid)
            .field("command", &self.shared.command)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Process {
    fn new(
        pid: u64,
        command: &str,
        session: Weak<SessionInner>,
        handle: ExecHandle,
        stdin: Stdin,
        buffer_cap: usize,
    ) -> Self {
        let (state, _) = watch::channel(ProcessState::Started);
        Self {
            shared: Arc::new(ProcessShared {
                pid,
                command: command.to_string(),
                session,
                handle,
                state,
                logs: Mutex::new(Logs {
                    stdout: OutputBuffer::new(buffer_cap),
                    stderr: OutputBuffer::new(buffer_cap),
                    exit_code: None,
                }),
                listeners: Mutex::new(ListenerRegistry::default()),
                stdin: tokio::sync::Mutex::new(Some(stdin)),
                kill_requested: AtomicBool::new(false),
            }),
        }
    }

    fn logs(&self) -> MutexGuard<'_, Logs> {
        self.shared.logs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn label(&self) -> String {
        format!("process {}", self.shared.pid)
    }

    /// Session-scoped process id.
    pub fn pid(&self) -> u64 {
        self.shared.pid
    }

    /// The command as given to [`ProcessManager::start`].
    pub fn command(&self) -> &str {
        &self.shared.command
    }

    pub fn state(&self) -> ProcessState {
        *self.shared.state.borrow()
    }

    /// Exit code, set only once the process has EXITED.
    pub fn exit_code(&self) -> Option<i64> {
        let exited = self.state() == ProcessState::Exited;
        self.logs().exit_code.filter(|_| exited)
    }

    /// Current output, complete or not.
    pub fn output(&self) -> ProcessOutput {
        let state = self.state();
        let logs = self.logs();
        ProcessOutput {
            pid: self.shared.pid,
            state,
            exit_code: logs.exit_code.filter(|_| state == ProcessState::Exited),
            stdout: logs.stdout.bytes(),
            stderr: logs.stderr.bytes(),
            stdout_dropped: logs.stdout.dropped(),
            stderr_dropped: logs.stderr.dropped(),
        }
    }

    /// Retained stdout chunks with their arrival times.
    pub fn stdout_chunks(&self) -> Vec<TimedChunk> {
        self.logs().stdout.chunks()
    }

    /// Retained stderr chunks with their arrival times.
    pub fn stderr_chunks(&self) -> Vec<TimedChunk> {
        self.logs().stderr.chunks()
    }

    /// Whether either output log has dropped bytes.
    pub fn is_truncated(&self) -> bool {
        let logs = self.logs();
        logs.stdout.is_truncated() || logs.stderr.is_truncated()
    }

    fn listeners(&self) -> MutexGuard<'_, ListenerRegistry<ProcessEvent>> {
        self.shared.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a callback for output chunks and the final exit event.
    ///
    /// Output that arrived before registration is only in the buffers; use
    /// [`ProcessManager::start_with`] to see everything.
    pub fn add_output_listener<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(&ProcessEvent) + Send + Sync + 'static,
    {
        let state = self.state();
        if state.is_terminal() {
            return Err(SandboxError::invalid_state(self.label(), state));
        }
        Ok(self.listeners().add(Arc::new(listener)))
    }

    /// Unregisters a callback. Returns false if it was not registered.
    pub fn remove_output_listener(&self, id: ListenerId) -> bool {
        self.listeners().remove(id)
    }

    fn emit(&self, event: &ProcessEvent) {
        let listeners = self.listeners().snapshot();
        for listener in listeners {
            listener(event);
        }
    }

    async fn terminated(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|state| state.is_terminal()).await;
    }

    /// Waits for the process to end.
    pub async fn wait(&self) -> ProcessOutput {
        self.terminated().await;
        self.output()
    }

    /// Waits at most `deadline`. On expiry the process is killed in the
    /// background and a timeout error is returned.
    pub async fn wait_timeout(&self, deadline: Duration) -> Result<ProcessOutput> {
        if tokio::time::timeout(deadline, self.terminated()).await.is_ok() {
            return Ok(self.output());
        }
        warn!(pid = self.shared.pid, "Wait timed out, killing process");
        let process = self.clone();
        tokio::spawn(async move {
            if let Err(err) = process.kill().await {
                warn!(pid = process.shared.pid, "Failed to kill process after wait timeout: {}", err);
            }
        });
        Err(SandboxError::timeout("wait", deadline))
    }

    fn accepting_input(&self) -> Result<()> {
        match self.state() {
            ProcessState::Started | ProcessState::Running => Ok(()),
            state => Err(SandboxError::invalid_state(self.label(), state)),
        }
    }

    /// Writes bytes to the process's stdin.
    ///
    /// Only valid while STARTED or RUNNING. Concurrent writers are delivered
    /// in the order they called.
    pub async fn send_stdin(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_stdin_with_deadline(data, None).await
    }

    /// Like [`send_stdin`](Self::send_stdin) with an explicit deadline.
    pub async fn send_stdin_with_deadline(&self, data: impl Into<Bytes>, deadline: Option<Duration>) -> Result<()> {
        let data = data.into();
        self.accepting_input()?;
        let session = upgrade(&self.shared.session)?;
        session.ensure_running()?;
        let deadline = deadline.unwrap_or_else(|| session.config().operation_timeout());

        let mut stdin = self.shared.stdin.lock().await;
        self.accepting_input()?;
        let writer = stdin
            .as_mut()
            .ok_or_else(|| SandboxError::invalid_state(self.label(), "closed for input"))?;

        let write = async {
            writer.write_all(&data).await?;
            writer.flush().await
        };
        tokio::time::timeout(deadline, write)
            .await
            .map_err(|_| SandboxError::timeout("send_stdin", deadline))??;
        Ok(())
    }

    /// Sends EOF on stdin. Closing twice is a no-op.
    pub async fn close_stdin(&self) -> Result<()> {
        let writer = self.shared.stdin.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(err) = writer.shutdown().await {
                debug!(pid = self.shared.pid, "Stdin shutdown failed: {}", err);
            }
        }
        Ok(())
    }

    /// Terminates the process: SIGTERM, then SIGKILL after the grace period.
    ///
    /// Killing a process that already ended is a no-op.
    pub async fn kill(&self) -> Result<()> {
        self.kill_with_deadline(None).await
    }

    /// Like [`kill`](Self::kill) with an explicit deadline for each signal call.
    pub async fn kill_with_deadline(&self, deadline: Option<Duration>) -> Result<()> {
        if self.state().is_terminal() {
            return Ok(());
        }
        let session = upgrade(&self.shared.session)?;
        self.shared.kill_requested.store(true, Ordering::SeqCst);
        info!(session_id = %session.id(), pid = self.shared.pid, "Killing process");

        if let Err(err) = self.signal(&session, Signal::Term, deadline).await {
            // Not signalled, so a later natural exit still counts as EXITED
            self.shared.kill_requested.store(false, Ordering::SeqCst);
            return Err(err);
        }
        let grace = session.config().kill_grace();
        if tokio::time::timeout(grace, self.terminated()).await.is_ok() {
            return Ok(());
        }

        warn!(pid = self.shared.pid, "Process ignored SIGTERM, sending SIGKILL");
        self.signal(&session, Signal::Kill, deadline).await?;
        tokio::time::timeout(grace, self.terminated())
            .await
            .map_err(|_| SandboxError::timeout("kill", grace))
    }

    async fn signal(&self, session: &SessionInner, signal: Signal, deadline: Option<Duration>) -> Result<()> {
        let handle = &self.shared.handle;
        session
            .call_with_deadline("kill_exec", deadline, |runtime, container| async move {
                runtime.kill_exec(&container, handle, signal).await
            })
            .await
    }

    fn mark_running(&self) {
        self.shared.state.send_if_modified(|state| {
            if *state == ProcessState::Started {
                *state = ProcessState::Running;
                true
            } else {
                false
            }
        });
    }

    fn append(&self, chunk: OutputChunk) {
        let mut logs = self.logs();
        match chunk {
            OutputChunk::Stdout(data) | OutputChunk::Console(data) => logs.stdout.push(data),
            OutputChunk::Stderr(data) => logs.stderr.push(data),
        }
    }

    fn finish(&self, state: ProcessState, exit_code: Option<i64>) {
        {
            let mut logs = self.logs();
            if state == ProcessState::Exited {
                logs.exit_code = exit_code;
            }
        }
        let finished = self.shared.state.send_if_modified(|current| {
            if current.is_terminal() {
                false
            } else {
                *current = state;
                true
            }
        });
        if !finished {
            return;
        }
        debug!(pid = self.shared.pid, state = %state, exit_code = ?exit_code, "Process finished");
        let exit_code = exit_code.filter(|_| state == ProcessState::Exited);
        self.emit(&ProcessEvent::Exit { state, exit_code });
        self.listeners().clear();
    }
}

enum DrainEnd {
    StreamClosed,
    TimedOut,
    SessionEnded,
}

/// Copies output into the process logs until the process ends.
async fn drain(
    process: Process,
    mut output: BoxStream<'static, RuntimeResult<OutputChunk>>,
    timeout: Option<Duration>,
    mut status: watch::Receiver<SessionStatus>,
) {
    process.mark_running();
    let pid = process.shared.pid;

    let expiry = async {
        match timeout {
            Some(timeout) => tokio::time::sleep(timeout).await,
            None => std::future::pending().await,
        }
    };
    tokio::pin!(expiry);

    let end = loop {
        tokio::select! {
            chunk = output.next() => match chunk {
                Some(Ok(chunk)) => {
                    process.emit(&ProcessEvent::from_chunk(&chunk));
                    process.append(chunk);
                }
                Some(Err(err)) => {
                    warn!(pid, "Process output stream failed: {}", err);
                    break DrainEnd::StreamClosed;
                }
                None => break DrainEnd::StreamClosed,
            },
            () = &mut expiry => break DrainEnd::TimedOut,
            () = session_ended(&mut status) => break DrainEnd::SessionEnded,
        }
    };
    drop(output);

    match end {
        DrainEnd::TimedOut => {
            warn!(pid, timeout = ?timeout, "Process timed out, killing");
            process.shared.kill_requested.store(true, Ordering::SeqCst);
            if let Ok(session) = upgrade(&process.shared.session) {
                if let Err(err) = process.signal(&session, Signal::Kill, None).await {
                    warn!(pid, "Failed to kill timed out process: {}", err);
                }
            }
            process.finish(ProcessState::TimedOut, None);
        }
        DrainEnd::SessionEnded => process.finish(ProcessState::Killed, None),
        DrainEnd::StreamClosed if process.shared.kill_requested.load(Ordering::SeqCst) => {
            process.finish(ProcessState::Killed, None);
        }
        DrainEnd::StreamClosed => {
            let status = match upgrade(&process.shared.session) {
                Ok(session) => session.settle(&process.shared.handle).await,
                Err(err) => Err(err),
            };
            match status {
                Ok(status) if status.exit_code.is_some() => {
                    process.finish(ProcessState::Exited, status.exit_code);
                }
                Ok(_) => {
                    warn!(pid, "Process ended without an exit status");
                    process.finish(ProcessState::Killed, None);
                }
                Err(err) => {
                    warn!(pid, "Could not read exit status: {}", err);
                    process.finish(ProcessState::Killed, None);
                }
            }
        }
    }

    process.shared.stdin.lock().await.take();
}

/// Builds the exec argv for a command line.
fn build_argv(command: &str, shell: bool) -> Result<Vec<String>> {
    if command.trim().is_empty() {
        return Err(RuntimeError::invalid_argument("empty command").into());
    }
    if shell {
        return Ok(vec!["/bin/sh".to_string(), "-c".to_string(), command.to_string()]);
    }
    shell_words::split(command).map_err(|e| {
        RuntimeError::invalid_argument(format!("cannot parse command '{command}': {e}")).into()
    })
}

/// Starts and tracks processes for one session.
#[derive(Clone)]
pub struct ProcessManager {
    session: Weak<SessionInner>,
    processes: Arc<Mutex<BTreeMap<u64, Process>>>,
    next_pid: Arc<AtomicU64>,
}

impl fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessManager")
            .field("processes", &self.table().len())
            .finish_non_exhaustive()
    }
}

impl ProcessManager {
    pub(crate) fn new(session: Weak<SessionInner>) -> Self {
        Self {
            session,
            processes: Arc::new(Mutex::new(BTreeMap::new())),
            next_pid: Arc::new(AtomicU64::new(1)),
        }
    }

    fn table(&self) -> MutexGuard<'_, BTreeMap<u64, Process>> {
        self.processes.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Starts `command` and returns as soon as the runtime accepted it.
    pub async fn start(&self, command: &str, options: StartOptions) -> Result<Process> {
        let (process, _) = self.spawn(command, options, None).await?;
        Ok(process)
    }

    /// Starts `command` with `listener` registered before any output is read.
    pub async fn start_with<F>(
        &self,
        command: &str,
        options: StartOptions,
        listener: F,
    ) -> Result<(Process, ListenerId)>
    where
        F: Fn(&ProcessEvent) + Send + Sync + 'static,
    {
        let (process, id) = self.spawn(command, options, Some(Arc::new(listener))).await?;
        let id = id.ok_or_else(|| SandboxError::invalid_state(process.label(), process.state()))?;
        Ok((process, id))
    }

    async fn spawn(
        &self,
        command: &str,
        options: StartOptions,
        initial: Option<Listener<ProcessEvent>>,
    ) -> Result<(Process, Option<ListenerId>)> {
        let session = upgrade(&self.session)?;
        session.ensure_running()?;
        let argv = build_argv(command, options.shell)?;
        let exec_options = ExecOptions {
            env: options.env.clone(),
            cwd: options.cwd.clone(),
            attach_stdin: true,
            tty: false,
        };

        let argv_ref = argv.as_slice();
        let exec_ref = &exec_options;
        let ExecStream {
            handle,
            output,
            input,
        } = session
            .call_with_deadline("exec", options.deadline, |runtime, container| async move {
                runtime.exec(&container, argv_ref, exec_ref).await
            })
            .await?;

        let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
        let process = Process::new(
            pid,
            command,
            self.session.clone(),
            handle,
            input,
            session.config().output_buffer_bytes,
        );
        let listener_id = initial.map(|listener| process.listeners().add(listener));
        {
            let mut table = self.table();
            prune_finished(&mut table, session.config().process_retention);
            table.insert(pid, process.clone());
        }
        info!(session_id = %session.id(), pid, command, "Started process");

        tokio::spawn(drain(process.clone(), output, options.timeout, session.subscribe()));
        Ok((process, listener_id))
    }

    /// Starts `command` and waits for it to end.
    pub async fn run(&self, command: &str, options: StartOptions) -> Result<ProcessOutput> {
        let process = self.start(command, options).await?;
        Ok(process.wait().await)
    }

    /// Looks up a process by pid.
    pub fn get(&self, pid: u64) -> Option<Process> {
        self.table().get(&pid).cloned()
    }

    /// All processes started by this session, ordered by pid.
    pub fn list(&self) -> Vec<Process> {
        self.table().values().cloned().collect()
    }

    /// Forgets a finished process and frees its buffers.
    ///
    /// Returns `None` for an unknown pid. A live process stays tracked and
    /// yields an invalid-state error.
    pub fn remove(&self, pid: u64) -> Result<Option<Process>> {
        let mut table = self.table();
        match table.get(&pid) {
            None => Ok(None),
            Some(process) if !process.state().is_terminal() => {
                Err(SandboxError::invalid_state(process.label(), process.state()))
            }
            Some(_) => Ok(table.remove(&pid)),
        }
    }

    /// Drops every handle during session teardown.
    pub(crate) fn clear(&self) {
        self.table().clear();
    }

    pub(crate) fn live(&self) -> Vec<Process> {
        self.table()
            .values()
            .filter(|process| !process.state().is_terminal())
            .cloned()
            .collect()
    }

    /// SIGKILLs `processes` during teardown. Failures are logged, not returned.
    pub(crate) async fn kill_all(&self, processes: Vec<Process>) {
        let Some(session) = self.session.upgrade() else {
            return;
        };
        let kills = processes.iter().map(|process| {
            let session = &session;
            async move {
                process.shared.kill_requested.store(true, Ordering::SeqCst);
                let handle = &process.shared.handle;
                let killed = session
                    .teardown_call("kill_exec", |runtime, container| async move {
                        runtime.kill_exec(&container, handle, Signal::Kill).await
                    })
                    .await;
                if let Err(err) = killed {
                    debug!(pid = process.shared.pid, "Teardown kill failed: {}", err);
                }
            }
        });
        futures_util::future::join_all(kills).await;
    }
}

/// Keeps at most `retain` finished processes, dropping the oldest pids first.
fn prune_finished(table: &mut BTreeMap<u64, Process>, retain: usize) {
    let finished: Vec<u64> = table
        .iter()
        .filter(|(_, process)| process.state().is_terminal())
        .map(|(pid, _)| *pid)
        .collect();
    let excess = finished.len().saturating_sub(retain);
    for pid in &finished[..excess] {
        table.remove(pid);
    }
}
