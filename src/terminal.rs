//! Interactive pseudo-terminals inside a session's container.
//!
//! Output is not buffered: each chunk is handed to the listeners registered
//! at the moment it arrives, so late listeners miss earlier output.

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
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::listeners::{ListenerId, ListenerRegistry};
use crate::runtime::{
    ContainerRef, ExecHandle, ExecOptions, ExecStream, OutputChunk, RuntimeClient, RuntimeResult, Signal,
};
use crate::sandbox::{session_ended, upgrade, RuntimeError, SandboxError, SessionInner, SessionStatus};
use crate::Result;

/// Lifecycle of a terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TerminalState {
    Open,
    Active,
    Closed,
}

impl fmt::Display for TerminalState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::Active => write!(f, "active"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

/// What a terminal listener receives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TerminalEvent {
    /// Output, in arrival order.
    Data(Bytes),
    /// The terminal went away without [`TerminalSession::close`]; sent once.
    Closed,
}

/// Options for [`TerminalManager::open_with`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TerminalOptions {
    /// Working directory; the session's `cwd` when `None`.
    pub cwd: Option<String>,
    /// Environment layered over the session's. `TERM` defaults to `xterm`.
    pub env: BTreeMap<String, String>,
    /// Deadline for opening; the session's operation timeout when `None`.
    pub deadline: Option<Duration>,
}

type Input = Pin<Box<dyn AsyncWrite + Send>>;
type TerminalTable = Mutex<BTreeMap<u64, TerminalSession>>;

struct TerminalShared {
    id: u64,
    session: Weak<SessionInner>,
    handle: ExecHandle,
    size: Mutex<(u16, u16)>,
    state: watch::Sender<TerminalState>,
    listeners: Mutex<ListenerRegistry<TerminalEvent>>,
    input: tokio::sync::Mutex<Option<Input>>,
    // Checked before every callback; once set nothing more is delivered
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
    // The owning manager's table; closed terminals leave it
    table: Weak<TerminalTable>,
}

/// Handle to an open terminal. Clones share the same terminal.
#[derive(Clone)]
pub struct TerminalSession {
    shared: Arc<TerminalShared>,
}

impl fmt::Debug for TerminalSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalSession")
            .field("id", &self.shared.id)
            .field("size", &self.size())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl TerminalSession {
    fn new(
        id: u64,
        session: Weak<SessionInner>,
        table: Weak<TerminalTable>,
        handle: ExecHandle,
        input: Input,
        cols: u16,
        rows: u16,
    ) -> Self {
        let (state, _) = watch::channel(TerminalState::Open);
        Self {
            shared: Arc::new(TerminalShared {
                id,
                session,
                handle,
                size: Mutex::new((cols, rows)),
                state,
                listeners: Mutex::new(ListenerRegistry::default()),
                input: tokio::sync::Mutex::new(Some(input)),
                closed: AtomicBool::new(false),
                reader: Mutex::new(None),
                table,
            }),
        }
    }

    fn label(&self) -> String {
        format!("terminal {}", self.shared.id)
    }

    fn forget(&self) {
        if let Some(table) = self.shared.table.upgrade() {
            lock(&table).remove(&self.shared.id);
        }
    }

    /// Session-scoped terminal id.
    pub fn id(&self) -> u64 {
        self.shared.id
    }

    /// Current `(cols, rows)`.
    pub fn size(&self) -> (u16, u16) {
        *lock(&self.shared.size)
    }

    pub fn state(&self) -> TerminalState {
        *self.shared.state.borrow()
    }

    /// Resolves once the terminal is CLOSED.
    pub async fn closed(&self) {
        let mut state = self.shared.state.subscribe();
        let _ = state.wait_for(|state| *state == TerminalState::Closed).await;
    }

    fn ensure_active(&self) -> Result<()> {
        match self.state() {
            TerminalState::Active => Ok(()),
            state => Err(SandboxError::invalid_state(self.label(), state)),
        }
    }

    /// Registers a callback for every output chunk from now on.
    pub fn add_listener<F>(&self, listener: F) -> Result<ListenerId>
    where
        F: Fn(&TerminalEvent) + Send + Sync + 'static,
    {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(SandboxError::invalid_state(self.label(), TerminalState::Closed));
        }
        Ok(lock(&self.shared.listeners).add(Arc::new(listener)))
    }

    /// Unregisters a callback. Returns false if it was not registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        lock(&self.shared.listeners).remove(id)
    }

    pub fn listener_count(&self) -> usize {
        lock(&self.shared.listeners).len()
    }

    /// Writes raw bytes to the terminal's input.
    pub async fn send_data(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_data_with_deadline(data, None).await
    }

    /// Like [`send_data`](Self::send_data) with an explicit deadline.
    pub async fn send_data_with_deadline(&self, data: impl Into<Bytes>, deadline: Option<Duration>) -> Result<()> {
        let data = data.into();
        self.ensure_active()?;
        let session = upgrade(&self.shared.session)?;
        session.ensure_running()?;
        let deadline = deadline.unwrap_or_else(|| session.config().operation_timeout());

        let mut input = self.shared.input.lock().await;
        self.ensure_active()?;
        let writer = input
            .as_mut()
            .ok_or_else(|| SandboxError::invalid_state(self.label(), TerminalState::Closed))?;
        let write = async {
            writer.write_all(&data).await?;
            writer.flush().await
        };
        tokio::time::timeout(deadline, write)
            .await
            .map_err(|_| SandboxError::timeout("send_data", deadline))??;
        Ok(())
    }

    /// Changes the terminal size without interrupting its output.
    pub async fn resize(&self, cols: u16, rows: u16) -> Result<()> {
        self.resize_with_deadline(cols, rows, None).await
    }

    /// Like [`resize`](Self::resize) with an explicit deadline.
    pub async fn resize_with_deadline(&self, cols: u16, rows: u16, deadline: Option<Duration>) -> Result<()> {
        if cols == 0 || rows == 0 {
            return Err(RuntimeError::invalid_argument(format!("invalid terminal size {cols}x{rows}")).into());
        }
        self.ensure_active()?;
        let session = upgrade(&self.shared.session)?;
        let handle = &self.shared.handle;
        session
            .call_with_deadline("resize_tty", deadline, |runtime, _| async move {
                runtime.resize_tty(handle, cols, rows).await
            })
            .await?;
        *lock(&self.shared.size) = (cols, rows);
        debug!(terminal_id = self.shared.id, cols, rows, "Terminal resized");
        Ok(())
    }

    /// Closes the terminal and drops every listener. Idempotent.
    ///
    /// No callback starts once this returns, even for output the runtime
    /// had already sent.
    pub async fn close(&self) -> Result<()> {
        self.close_with_deadline(None).await
    }

    /// Like [`close`](Self::close) with an explicit deadline for stopping the shell.
    pub async fn close_with_deadline(&self, deadline: Option<Duration>) -> Result<()> {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shared.state.send_replace(TerminalState::Closed);
        lock(&self.shared.listeners).clear();
        self.forget();
        if let Some(reader) = lock(&self.shared.reader).take() {
            reader.abort();
        }
        self.shared.input.lock().await.take();

        if let Ok(session) = upgrade(&self.shared.session) {
            if session.status() == SessionStatus::Running {
                if let Err(err) = self.kill_shell(&session, KillMode::Guarded(deadline)).await {
                    debug!(terminal_id = self.shared.id, "Failed to stop terminal shell: {}", err);
                }
            }
        }
        info!(terminal_id = self.shared.id, "Terminal closed");
        Ok(())
    }

    async fn kill_shell(&self, session: &SessionInner, mode: KillMode) -> Result<()> {
        let handle = &self.shared.handle;
        let kill = |runtime: Arc<dyn RuntimeClient>, container: ContainerRef| async move {
            runtime.kill_exec(&container, handle, Signal::Kill).await
        };
        match mode {
            KillMode::Guarded(deadline) => session.call_with_deadline("kill_exec", deadline, kill).await,
            KillMode::Teardown => session.teardown_call("kill_exec", kill).await,
        }
    }

    fn dispatch(&self, event: &TerminalEvent) {
        let listeners = lock(&self.shared.listeners).snapshot();
        for listener in listeners {
            if self.shared.closed.load(Ordering::SeqCst) {
                return;
            }
            listener(event);
        }
    }

    /// Marks the terminal CLOSED and sends the final `Closed` event.
    ///
    /// Returns false if it was already closed.
    fn close_with_notice(&self) -> bool {
        if self.shared.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shared.state.send_replace(TerminalState::Closed);
        self.forget();
        let listeners = {
            let mut registry = lock(&self.shared.listeners);
            let listeners = registry.snapshot();
            registry.clear();
            listeners
        };
        for listener in listeners {
            listener(&TerminalEvent::Closed);
        }
        true
    }
}

/// How a terminal's shell is stopped.
enum KillMode {
    /// Through the guarded call, while the session is RUNNING.
    Guarded(Option<Duration>),
    /// During session teardown.
    Teardown,
}

/// Fans terminal output out to listeners until the stream or session ends.
async fn read_output(
    terminal: TerminalSession,
    mut output: BoxStream<'static, RuntimeResult<OutputChunk>>,
    mut status: watch::Receiver<SessionStatus>,
) {
    let reason = loop {
        tokio::select! {
            chunk = output.next() => match chunk {
                Some(Ok(OutputChunk::Console(data) | OutputChunk::Stdout(data) | OutputChunk::Stderr(data))) => {
                    terminal.dispatch(&TerminalEvent::Data(data));
                }
                Some(Err(err)) => break format!("stream failed: {err}"),
                None => break "stream ended".to_string(),
            },
            () = session_ended(&mut status) => break "session ended".to_string(),
        }
    };
    drop(output);

    if terminal.close_with_notice() {
        warn!(terminal_id = terminal.shared.id, "Terminal closed unexpectedly: {}", reason);
    }
    terminal.shared.input.lock().await.take();
}

/// Opens and tracks terminals for one session.
#[derive(Clone)]
pub struct TerminalManager {
    session: Weak<SessionInner>,
    terminals: Arc<TerminalTable>,
    next_id: Arc<AtomicU64>,
}

impl fmt::Debug for TerminalManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TerminalManager")
            .field("terminals", &lock(&self.terminals).len())
            .finish_non_exhaustive()
    }
}

impl TerminalManager {
    pub(crate) fn new(session: Weak<SessionInner>) -> Self {
        Self {
            session,
            terminals: Arc::new(Mutex::new(BTreeMap::new())),
            next_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Opens a `cols`×`rows` terminal running the container's shell.
    pub async fn open(&self, cols: u16, rows: u16) -> Result<TerminalSession> {
        self.open_with(cols, rows, TerminalOptions::default()).await
    }

    /// Like [`open`](Self::open) with a working directory, environment or deadline.
    pub async fn open_with(&self, cols: u16, rows: u16, options: TerminalOptions) -> Result<TerminalSession> {
        if cols == 0 || rows == 0 {
            return Err(RuntimeError::invalid_argument(format!("invalid terminal size {cols}x{rows}")).into());
        }
        let session = upgrade(&self.session)?;
        session.ensure_running()?;

        let mut exec_options = ExecOptions {
            env: options.env,
            cwd: options.cwd,
            attach_stdin: true,
            tty: true,
        };
        exec_options
            .env
            .entry("TERM".to_string())
            .or_insert_with(|| "xterm".to_string());

        let exec_ref = &exec_options;
        let ExecStream {
            handle,
            output,
            input,
        } = session
            .call_with_deadline("open_tty", options.deadline, |runtime, container| async move {
                runtime.open_tty(&container, cols, rows, exec_ref).await
            })
            .await?;

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let terminal = TerminalSession::new(
            id,
            self.session.clone(),
            Arc::downgrade(&self.terminals),
            handle,
            input,
            cols,
            rows,
        );
        // The runtime returned a live stream
        terminal.shared.state.send_replace(TerminalState::Active);
        lock(&self.terminals).insert(id, terminal.clone());
        let reader = tokio::spawn(read_output(terminal.clone(), output, session.subscribe()));
        *lock(&terminal.shared.reader) = Some(reader);

        info!(session_id = %session.id(), terminal_id = id, cols, rows, "Opened terminal");
        Ok(terminal)
    }

    /// Looks up a terminal by id.
    pub fn get(&self, id: u64) -> Option<TerminalSession> {
        lock(&self.terminals).get(&id).cloned()
    }

    /// Terminals that are not yet closed.
    pub fn list(&self) -> Vec<TerminalSession> {
        lock(&self.terminals)
            .values()
            .filter(|terminal| terminal.state() != TerminalState::Closed)
            .cloned()
            .collect()
    }

    /// Drops every handle during session teardown.
    pub(crate) fn clear(&self) {
        lock(&self.terminals).clear();
    }

    /// Closes every terminal during session teardown.
    ///
    /// Listeners get the final `Closed` event.
    pub(crate) async fn close_all(&self) {
        let session = self.session.upgrade();
        for terminal in self.list() {
            if let Some(reader) = lock(&terminal.shared.reader).take() {
                reader.abort();
            }
            terminal.close_with_notice();
            terminal.shared.input.lock().await.take();
            if let Some(session) = &session {
                if let Err(err) = terminal.kill_shell(session, KillMode::Teardown).await {
                    debug!(terminal_id = terminal.shared.id, "Teardown kill failed: {}", err);
                }
            }
        }
    }
}
