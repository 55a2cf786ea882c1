//! Files inside a session's container.
//!
//! Relative paths resolve against the session's `cwd`. Every call goes
//! through the session's guarded runtime wrapper, bounded by the session's
//! operation timeout or by the handle's own deadline (see
//! [`Filesystem::with_deadline`]).

mod watcher;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use tracing::{debug, info};

pub use watcher::Watch;

use crate::listeners::{Listener, ListenerId};
use crate::runtime::{ChangeEvent, DirEntry};
use crate::sandbox::{upgrade, CommandOutput, RuntimeError, SandboxError, SessionInner};
use crate::Result;

/// File operations and change watches for one session.
#[derive(Clone)]
pub struct Filesystem {
    session: Weak<SessionInner>,
    watches: Arc<Mutex<Vec<Watch>>>,
    next_watch: Arc<AtomicU64>,
    deadline: Option<Duration>,
}

impl fmt::Debug for Filesystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Filesystem")
            .field("watches", &self.lock_watches().len())
            .field("deadline", &self.deadline)
            .finish_non_exhaustive()
    }
}

impl Filesystem {
    pub(crate) fn new(session: Weak<SessionInner>) -> Self {
        Self {
            session,
            watches: Arc::new(Mutex::new(Vec::new())),
            next_watch: Arc::new(AtomicU64::new(1)),
            deadline: None,
        }
    }

    /// A handle whose calls each use `deadline` instead of the session's
    /// operation timeout. Watches are shared with the original handle.
    #[must_use]
    pub fn with_deadline(&self, deadline: Duration) -> Self {
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    /// Deadline applied to each call, if this handle overrides the default.
    pub fn deadline(&self) -> Option<Duration> {
        self.deadline
    }

    fn lock_watches(&self) -> MutexGuard<'_, Vec<Watch>> {
        self.watches.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self) -> Result<(Arc<SessionInner>, ContainerPath)> {
        let session = upgrade(&self.session)?;
        session.ensure_running()?;
        let cwd = ContainerPath(session.config().cwd.clone());
        Ok((session, cwd))
    }

    /// Reads a whole file.
    pub async fn read(&self, path: &str) -> Result<Bytes> {
        let (session, cwd) = self.session()?;
        let path = cwd.resolve(path);
        let path_ref = path.as_str();
        session
            .call_with_deadline("read_file", self.deadline, |runtime, container| async move {
                runtime.read_file(&container, path_ref).await
            })
            .await
    }

    /// Reads a UTF-8 text file.
    pub async fn read_to_string(&self, path: &str) -> Result<String> {
        let content = self.read(path).await?;
        String::from_utf8(content.to_vec())
            .map_err(|e| SandboxError::io(format!("{path} is not valid UTF-8: {e}")))
    }

    /// Creates or replaces a file, creating missing parent directories.
    pub async fn write(&self, path: &str, content: impl Into<Bytes>) -> Result<()> {
        let (session, cwd) = self.session()?;
        let path = cwd.resolve(path);
        let content = content.into();

        match self.write_file(&session, &path, &content).await {
            Err(err) if err.is_not_found() => {
                debug!(path = %path, "Parent directory missing, creating it");
                self.make_dir(parent_dir(&path)).await?;
                self.write_file(&session, &path, &content).await
            }
            result => result,
        }
    }

    async fn write_file(&self, session: &SessionInner, path: &str, content: &Bytes) -> Result<()> {
        session
            .call_with_deadline("write_file", self.deadline, |runtime, container| {
                let content = content.clone();
                async move { runtime.write_file(&container, path, content).await }
            })
            .await
    }

    /// Lists a directory.
    pub async fn list(&self, path: &str) -> Result<Vec<DirEntry>> {
        let (session, cwd) = self.session()?;
        let path = cwd.resolve(path);
        let path_ref = path.as_str();
        session
            .call_with_deadline("list_dir", self.deadline, |runtime, container| async move {
                runtime.list_dir(&container, path_ref).await
            })
            .await
    }

    /// Creates a directory and any missing parents.
    pub async fn make_dir(&self, path: &str) -> Result<()> {
        let path = self.session()?.1.resolve(path);
        let output = self.run(&["mkdir", "-p", "--", path.as_str()]).await?;
        check(output, "mkdir", &path)
    }

    /// Removes a file or directory tree. Missing paths are not an error.
    pub async fn remove(&self, path: &str) -> Result<()> {
        let path = self.session()?.1.resolve(path);
        if path == "/" {
            return Err(RuntimeError::invalid_argument("refusing to remove /").into());
        }
        let output = self.run(&["rm", "-rf", "--", path.as_str()]).await?;
        check(output, "rm", &path)
    }

    /// Whether `path` exists.
    pub async fn exists(&self, path: &str) -> Result<bool> {
        self.test("-e", path).await
    }

    /// Whether `path` is a directory.
    pub async fn is_dir(&self, path: &str) -> Result<bool> {
        self.test("-d", path).await
    }

    /// Whether `path` is a regular file.
    pub async fn is_file(&self, path: &str) -> Result<bool> {
        self.test("-f", path).await
    }

    /// Size of a file in bytes.
    pub async fn size(&self, path: &str) -> Result<u64> {
        let path = self.session()?.1.resolve(path);
        let output = self.run(&["stat", "-c", "%s", "--", path.as_str()]).await?;
        if !output.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            if stderr.contains("No such file") {
                return Err(RuntimeError::not_found(format!("{path}: no such file")).into());
            }
            return Err(command_failed("stat", &path, &output));
        }
        parse_size(&output.stdout)
            .ok_or_else(|| RuntimeError::other(format!("stat {path} printed an invalid size")).into())
    }

    async fn test(&self, flag: &str, path: &str) -> Result<bool> {
        let path = self.session()?.1.resolve(path);
        let output = self.run(&["test", flag, path.as_str()]).await?;
        match output.exit_code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(command_failed("test", &path, &output)),
        }
    }

    async fn run(&self, argv: &[&str]) -> Result<CommandOutput> {
        let (session, _) = self.session()?;
        let argv: Vec<String> = argv.iter().map(|arg| (*arg).to_string()).collect();
        session.run_command("exec", &argv, self.deadline).await
    }

    /// Copies a local file into the container. A leading `~/` is expanded.
    pub async fn upload_file(&self, local: impl AsRef<Path>, remote: &str) -> Result<()> {
        let local = expand_home(local.as_ref())?;
        let content = tokio::fs::read(&local)
            .await
            .map_err(|e| SandboxError::io(format!("cannot read {}: {e}", local.display())))?;
        self.write(remote, content).await?;
        info!(local = %local.display(), remote, "Uploaded file");
        Ok(())
    }

    /// Copies a file out of the container, creating local parent directories.
    pub async fn download_file(&self, remote: &str, local: impl AsRef<Path>) -> Result<()> {
        let local = expand_home(local.as_ref())?;
        let content = self.read(remote).await?;
        if let Some(parent) = local.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&local, &content)
            .await
            .map_err(|e| SandboxError::io(format!("cannot write {}: {e}", local.display())))?;
        info!(remote, local = %local.display(), "Downloaded file");
        Ok(())
    }

    /// Starts watching `path` for changes.
    pub async fn watch(&self, path: &str) -> Result<Watch> {
        let (watch, _) = self.start_watch(path, None).await?;
        Ok(watch)
    }

    /// Starts watching `path` with `listener` registered before the first event.
    pub async fn watch_with<F>(&self, path: &str, listener: F) -> Result<(Watch, ListenerId)>
    where
        F: Fn(&ChangeEvent) + Send + Sync + 'static,
    {
        let (watch, id) = self.start_watch(path, Some(Arc::new(listener))).await?;
        let id = id.ok_or_else(|| SandboxError::invalid_state(format!("watch on {}", watch.path()), "stopped"))?;
        Ok((watch, id))
    }

    async fn start_watch(
        &self,
        path: &str,
        initial: Option<Listener<ChangeEvent>>,
    ) -> Result<(Watch, Option<ListenerId>)> {
        let (session, cwd) = self.session()?;
        let path = cwd.resolve(path);
        let path_ref = path.as_str();
        let changes = session
            .call_with_deadline("subscribe_changes", self.deadline, |runtime, container| async move {
                runtime.subscribe_changes(&container, path_ref).await
            })
            .await?;

        let id = self.next_watch.fetch_add(1, Ordering::SeqCst);
        let watch = Watch::new(id, path.clone());
        let listener_id = initial.map(|listener| watch.register(listener));
        let task = tokio::spawn(watcher::pump(watch.clone(), changes, session.subscribe()));
        watch.set_task(task);

        let mut watches = self.lock_watches();
        watches.retain(Watch::is_active);
        watches.push(watch.clone());
        info!(session_id = %session.id(), watch_id = id, path = %path, "Watching for changes");
        Ok((watch, listener_id))
    }

    /// Watches that are still delivering events.
    pub fn watches(&self) -> Vec<Watch> {
        self.lock_watches().iter().filter(|watch| watch.is_active()).cloned().collect()
    }

    pub(crate) fn stop_watches(&self) {
        let watches: Vec<Watch> = self.lock_watches().drain(..).collect();
        for watch in watches {
            watch.stop();
        }
    }
}

/// Absolute directory that relative paths are resolved against.
struct ContainerPath(String);

impl ContainerPath {
    fn resolve(&self, path: &str) -> String {
        resolve_path(&self.0, path)
    }
}

/// Joins `path` onto `cwd` unless it is absolute, then normalizes `.` and `..`.
pub(crate) fn resolve_path(cwd: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{cwd}/{path}")
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    format!("/{}", parts.join("/"))
}

fn parent_dir(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((parent, _)) => parent,
    }
}

/// Expands a leading `~/` to the local home directory.
fn expand_home(path: &Path) -> Result<PathBuf> {
    match path.strip_prefix("~") {
        Ok(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| SandboxError::io("could not determine home directory"))?;
            Ok(home.join(rest))
        }
        Err(_) => Ok(path.to_path_buf()),
    }
}

fn parse_size(stdout: &[u8]) -> Option<u64> {
    std::str::from_utf8(stdout).ok()?.trim().parse().ok()
}

fn command_failed(command: &str, path: &str, output: &CommandOutput) -> SandboxError {
    let stderr = String::from_utf8_lossy(&output.stderr);
    RuntimeError::other(format!(
        "{command} {path} exited with {:?}: {}",
        output.exit_code,
        stderr.trim()
    ))
    .into()
}

fn check(output: CommandOutput, command: &str, path: &str) -> Result<()> {
    if output.success() {
        Ok(())
    } else {
        Err(command_failed(command, path, &output))
    }
}
