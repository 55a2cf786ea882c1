//! In-memory runtime for testing without Docker.
//!
//! Execs are interpreted by a tiny command set (`echo`, `printf`, `sleep`,
//! `cat`, `exit`, `pwd`, `printenv`, `mkdir`, `rm`, `test`, `stat`, `true`,
//! `false`)
//! so sessions can be driven end to end. Failures can be injected per
//! operation and every call is counted.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::io::{AsyncReadExt, DuplexStream};
use tokio::sync::mpsc;

use super::{
    ChangeEvent, ChangeKind, ChangeStream, ContainerInfo, ContainerRef, DirEntry, ExecHandle,
    ExecOptions, ExecStatus, ExecStream, OutputChunk, PortMapping, RuntimeClient, RuntimeResult,
    Signal,
};
use crate::config::SandboxConfig;
use crate::sandbox::RuntimeError;

/// A scriptable in-memory [`RuntimeClient`].
#[derive(Debug, Clone, Default)]
pub struct MockRuntime {
    state: Arc<Mutex<MockState>>,
}

#[derive(Debug, Default)]
struct MockState {
    containers: HashMap<String, MockContainer>,
    execs: HashMap<String, MockExec>,
    subscribers: Vec<Subscriber>,
    failures: HashMap<&'static str, VecDeque<RuntimeError>>,
    calls: HashMap<&'static str, usize>,
    resizes: Vec<(u16, u16)>,
    next_exec: u64,
}

#[derive(Debug)]
struct MockContainer {
    running: bool,
    cwd: String,
    env: BTreeMap<String, String>,
    ports: Vec<u16>,
    files: BTreeMap<String, Bytes>,
    dirs: BTreeSet<String>,
}

#[derive(Debug)]
struct MockExec {
    container: String,
    running: bool,
    exit_code: Option<i64>,
    kill: mpsc::UnboundedSender<Signal>,
}

#[derive(Debug)]
struct Subscriber {
    container: String,
    path: String,
    tx: mpsc::UnboundedSender<RuntimeResult<ChangeEvent>>,
}

impl MockRuntime {
    /// Creates an empty runtime.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Makes the next call to `operation` fail with `error`.
    ///
    /// Calls queue up: injecting twice fails the next two calls.
    pub fn fail_next(&self, operation: &'static str, error: RuntimeError) {
        self.lock()
            .failures
            .entry(operation)
            .or_default()
            .push_back(error);
    }

    /// Number of calls made to `operation`.
    pub fn calls(&self, operation: &str) -> usize {
        self.lock().calls.get(operation).copied().unwrap_or(0)
    }

    /// Number of calls made to any operation.
    pub fn total_calls(&self) -> usize {
        self.lock().calls.values().sum()
    }

    /// Names of containers that currently exist.
    pub fn container_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().containers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Whether `name` exists and is running.
    pub fn is_running(&self, name: &str) -> bool {
        self.lock()
            .containers
            .get(name)
            .is_some_and(|container| container.running)
    }

    /// Content of a file inside a container.
    pub fn file(&self, container: &str, path: &str) -> Option<Bytes> {
        self.lock()
            .containers
            .get(container)
            .and_then(|c| c.files.get(path).cloned())
    }

    /// Number of execs still running.
    pub fn running_execs(&self) -> usize {
        self.lock().execs.values().filter(|exec| exec.running).count()
    }

    /// Terminal sizes requested so far, in order.
    pub fn resizes(&self) -> Vec<(u16, u16)> {
        self.lock().resizes.clone()
    }

    /// Simulates the container disappearing behind the session's back.
    pub fn remove_externally(&self, name: &str) {
        let mut state = self.lock();
        state.containers.remove(name);
        for exec in state.execs.values().filter(|exec| exec.container == name) {
            let _ = exec.kill.send(Signal::Kill);
        }
        state.subscribers.retain(|sub| sub.container != name);
    }

    /// Emits a change event as if the runtime had observed it.
    pub fn emit_change(&self, container: &str, event: ChangeEvent) {
        let mut state = self.lock();
        notify(&mut state, container, vec![event]);
    }

    fn enter(&self, operation: &'static str) -> RuntimeResult<()> {
        let mut state = self.lock();
        *state.calls.entry(operation).or_default() += 1;
        match state.failures.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn spawn_exec(
        &self,
        container: &ContainerRef,
        program: Program,
        options: &ExecOptions,
    ) -> RuntimeResult<ExecStream> {
        let (out_tx, mut out_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = mpsc::unbounded_channel();
        let (input, stdin) = tokio::io::duplex(64 * 1024);

        let exec_id = {
            let mut state = self.lock();
            let target = running_container(&state, container)?;
            let mut env = target.env.clone();
            env.extend(options.env.clone());
            let cwd = options.cwd.clone().unwrap_or_else(|| target.cwd.clone());

            state.next_exec += 1;
            let exec_id = format!("exec-{}", state.next_exec);
            state.execs.insert(
                exec_id.clone(),
                MockExec {
                    container: container.as_str().to_string(),
                    running: true,
                    exit_code: None,
                    kill: kill_tx,
                },
            );

            let ctx = ExecContext {
                runtime: self.clone(),
                container: container.as_str().to_string(),
                out: out_tx,
                stdin,
                kill: kill_rx,
                env,
                cwd,
                tty: options.tty,
            };
            let finished_id = exec_id.clone();
            let runtime = self.clone();
            tokio::spawn(async move {
                let mut ctx = ctx;
                let code = program.run(&mut ctx).await;
                // Record the exit before the output channel closes
                if let Some(exec) = runtime.lock().execs.get_mut(&finished_id) {
                    exec.running = false;
                    exec.exit_code = Some(code);
                }
                drop(ctx);
            });
            exec_id
        };

        Ok(ExecStream {
            handle: ExecHandle {
                kill_token: exec_id.clone(),
                exec_id,
            },
            output: futures_util::stream::poll_fn(move |cx| out_rx.poll_recv(cx)).boxed(),
            input: Box::pin(input),
        })
    }
}

fn running_container<'a>(state: &'a MockState, container: &ContainerRef) -> RuntimeResult<&'a MockContainer> {
    match state.containers.get(container.as_str()) {
        Some(c) if c.running => Ok(c),
        _ => Err(RuntimeError::container_gone(container.as_str())),
    }
}

fn running_container_mut<'a>(
    state: &'a mut MockState,
    container: &ContainerRef,
) -> RuntimeResult<&'a mut MockContainer> {
    match state.containers.get_mut(container.as_str()) {
        Some(c) if c.running => Ok(c),
        _ => Err(RuntimeError::container_gone(container.as_str())),
    }
}

fn is_under(path: &str, root: &str) -> bool {
    root == "/" || path == root || path.strip_prefix(root).is_some_and(|rest| rest.starts_with('/'))
}

fn parent(path: &str) -> &str {
    match path.rsplit_once('/') {
        Some(("", _)) | None => "/",
        Some((dir, _)) => dir,
    }
}

fn notify(state: &mut MockState, container: &str, events: Vec<ChangeEvent>) {
    state.subscribers.retain(|sub| {
        if sub.container != container {
            return true;
        }
        events
            .iter()
            .filter(|event| is_under(&event.path, &sub.path) && event.path != sub.path)
            .all(|event| sub.tx.send(Ok(event.clone())).is_ok())
    });
}

impl MockContainer {
    fn new(config: &SandboxConfig) -> Self {
        let mut container = Self {
            running: false,
            cwd: config.cwd.clone(),
            env: config.environment.clone(),
            ports: config.ports.clone(),
            files: BTreeMap::new(),
            dirs: BTreeSet::from(["/".to_string()]),
        };
        container.make_dirs("/tmp");
        container.make_dirs(&config.cwd);
        if let Some(path) = &config.persistent_storage_path {
            container.make_dirs(path);
        }
        container
    }

    /// Creates `path` and its ancestors, returning the newly created directories.
    fn make_dirs(&mut self, path: &str) -> Vec<String> {
        let mut created = Vec::new();
        let mut current = String::new();
        for part in path.split('/').filter(|part| !part.is_empty()) {
            current.push('/');
            current.push_str(part);
            if self.dirs.insert(current.clone()) {
                created.push(current.clone());
            }
        }
        created
    }

    fn remove_tree(&mut self, path: &str) -> Vec<String> {
        let mut removed: Vec<String> = self
            .files
            .keys()
            .chain(self.dirs.iter())
            .filter(|candidate| is_under(candidate, path) && candidate.as_str() != "/")
            .cloned()
            .collect();
        removed.sort();
        removed.dedup();
        for item in &removed {
            self.files.remove(item);
            self.dirs.remove(item);
        }
        removed
    }

    fn exists(&self, path: &str) -> bool {
        self.files.contains_key(path) || self.dirs.contains(path)
    }
}

/// What an exec runs.
enum Program {
    Words(Vec<String>),
    Shell,
}

impl Program {
    fn parse(argv: &[String]) -> RuntimeResult<Self> {
        let is_shell = argv
            .first()
            .is_some_and(|program| program == "sh" || program.ends_with("/sh"));
        if is_shell && argv.get(1).map(String::as_str) == Some("-c") {
            let script = argv
                .get(2)
                .ok_or_else(|| RuntimeError::invalid_argument("sh -c requires a script"))?;
            let words = shell_words::split(script)
                .map_err(|e| RuntimeError::invalid_argument(format!("cannot parse '{script}': {e}")))?;
            return Ok(Self::Words(words));
        }
        Ok(Self::Words(argv.to_vec()))
    }

    async fn run(self, ctx: &mut ExecContext) -> i64 {
        match self {
            Self::Words(words) => ctx.run_words(words).await,
            Self::Shell => ctx.run_shell().await,
        }
    }
}

struct ExecContext {
    runtime: MockRuntime,
    container: String,
    out: mpsc::UnboundedSender<RuntimeResult<OutputChunk>>,
    stdin: DuplexStream,
    kill: mpsc::UnboundedReceiver<Signal>,
    env: BTreeMap<String, String>,
    cwd: String,
    tty: bool,
}

fn signal_exit(signal: Option<Signal>) -> i64 {
    match signal {
        Some(Signal::Term) => 143,
        Some(Signal::Kill) | None => 137,
    }
}

impl ExecContext {
    fn stdout(&self, data: impl Into<Bytes>) {
        let data = data.into();
        let chunk = if self.tty {
            OutputChunk::Console(data)
        } else {
            OutputChunk::Stdout(data)
        };
        let _ = self.out.send(Ok(chunk));
    }

    fn stderr(&self, data: impl Into<Bytes>) {
        let data = data.into();
        let chunk = if self.tty {
            OutputChunk::Console(data)
        } else {
            OutputChunk::Stderr(data)
        };
        let _ = self.out.send(Ok(chunk));
    }

    fn resolve(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.trim_end_matches('/').to_string()
        } else {
            format!("{}/{}", self.cwd.trim_end_matches('/'), path)
        }
    }

    async fn run_words(&mut self, mut words: Vec<String>) -> i64 {
        let to_stderr = words.last().is_some_and(|word| word == ">&2");
        if to_stderr {
            words.pop();
        }
        let Some((program, args)) = words.split_first() else {
            return 0;
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();

        match program.as_str() {
            "true" => 0,
            "false" => 1,
            "echo" => {
                let (newline, args) = match args.split_first() {
                    Some((&"-n", rest)) => (false, rest),
                    _ => (true, args.as_slice()),
                };
                let mut text = args.join(" ");
                if newline {
                    text.push('\n');
                }
                if to_stderr {
                    self.stderr(text);
                } else {
                    self.stdout(text);
                }
                0
            }
            "printf" => {
                let text = args.first().map_or(String::new(), |fmt| fmt.replace("\\n", "\n"));
                self.stdout(text);
                0
            }
            "exit" => args.first().and_then(|code| code.parse().ok()).unwrap_or(0),
            "pwd" => {
                self.stdout(format!("{}\n", self.cwd));
                0
            }
            "printenv" => match args.first().and_then(|name| self.env.get(*name)) {
                Some(value) => {
                    self.stdout(format!("{value}\n"));
                    0
                }
                None => 1,
            },
            "sleep" => {
                let secs: f64 = args.first().and_then(|s| s.parse().ok()).unwrap_or(0.0);
                tokio::select! {
                    () = tokio::time::sleep(Duration::from_secs_f64(secs.max(0.0))) => 0,
                    signal = self.kill.recv() => signal_exit(signal),
                }
            }
            "cat" if args.is_empty() => self.pump_stdin(false).await,
            "cat" => self.cat_files(&args),
            "mkdir" => self.mkdir(&args),
            "rm" => self.rm(&args),
            "test" => self.test(&args),
            "stat" => self.stat(&args),
            other => {
                self.stderr(format!("sh: {other}: not found\n"));
                127
            }
        }
    }

    async fn run_shell(&mut self) -> i64 {
        self.pump_stdin(true).await
    }

    /// Echoes stdin back until EOF, a kill, or (in shell mode) an `exit` line.
    async fn pump_stdin(&mut self, shell: bool) -> i64 {
        let mut buf = vec![0u8; 4096];
        let mut line = Vec::new();
        loop {
            tokio::select! {
                read = self.stdin.read(&mut buf) => match read {
                    Ok(0) | Err(_) => return 0,
                    Ok(n) => {
                        self.stdout(Bytes::copy_from_slice(&buf[..n]));
                        if shell {
                            for &byte in &buf[..n] {
                                if byte == b'\n' {
                                    if String::from_utf8_lossy(&line).trim() == "exit" {
                                        return 0;
                                    }
                                    line.clear();
                                } else {
                                    line.push(byte);
                                }
                            }
                        }
                    }
                },
                signal = self.kill.recv() => return signal_exit(signal),
            }
        }
    }

    fn cat_files(&self, args: &[&str]) -> i64 {
        let mut code = 0;
        for arg in args {
            let path = self.resolve(arg);
            match self.runtime.file(&self.container, &path) {
                Some(content) => self.stdout(content),
                None => {
                    self.stderr(format!("cat: {arg}: No such file or directory\n"));
                    code = 1;
                }
            }
        }
        code
    }

    fn mkdir(&self, args: &[&str]) -> i64 {
        let parents = args.contains(&"-p");
        let mut state = self.runtime.lock();
        let mut events = Vec::new();
        let Some(container) = state.containers.get_mut(&self.container) else {
            return 1;
        };
        for arg in args.iter().filter(|arg| !arg.starts_with('-')) {
            let path = self.resolve(arg);
            if container.files.contains_key(&path) {
                return 1;
            }
            if !parents && !container.dirs.contains(parent(&path)) {
                return 1;
            }
            for dir in container.make_dirs(&path) {
                events.push(ChangeEvent::now(dir, ChangeKind::Created));
            }
        }
        notify(&mut state, &self.container, events);
        0
    }

    fn rm(&self, args: &[&str]) -> i64 {
        let force = args.iter().any(|arg| arg.starts_with('-') && arg.contains('f'));
        let mut state = self.runtime.lock();
        let mut events = Vec::new();
        let Some(container) = state.containers.get_mut(&self.container) else {
            return 1;
        };
        for arg in args.iter().filter(|arg| !arg.starts_with('-')) {
            let path = self.resolve(arg);
            if !container.exists(&path) && !force {
                return 1;
            }
            for removed in container.remove_tree(&path) {
                events.push(ChangeEvent::now(removed, ChangeKind::Deleted));
            }
        }
        notify(&mut state, &self.container, events);
        0
    }

    /// `stat -c %s PATH`; directories report 4096 like ext4.
    fn stat(&self, args: &[&str]) -> i64 {
        let Some(arg) = args.last() else {
            return 1;
        };
        let path = self.resolve(arg);
        let size = {
            let state = self.runtime.lock();
            let Some(container) = state.containers.get(&self.container) else {
                return 1;
            };
            if container.dirs.contains(&path) {
                Some(4096)
            } else {
                container.files.get(&path).map(|content| content.len())
            }
        };
        match size {
            Some(size) => {
                self.stdout(format!("{size}\n"));
                0
            }
            None => {
                self.stderr(format!("stat: cannot stat '{arg}': No such file or directory\n"));
                1
            }
        }
    }

    fn test(&self, args: &[&str]) -> i64 {
        let (flag, path) = match args {
            [flag, path] => (*flag, self.resolve(path)),
            _ => return 2,
        };
        let state = self.runtime.lock();
        let Some(container) = state.containers.get(&self.container) else {
            return 1;
        };
        let ok = match flag {
            "-e" => container.exists(&path),
            "-d" => container.dirs.contains(&path),
            "-f" => container.files.contains_key(&path),
            _ => return 2,
        };
        i64::from(!ok)
    }
}

#[async_trait]
impl RuntimeClient for MockRuntime {
    async fn create_container(&self, name: &str, config: &SandboxConfig) -> RuntimeResult<ContainerRef> {
        self.enter("create_container")?;
        let mut state = self.lock();
        if state.containers.contains_key(name) {
            return Err(RuntimeError::other(format!("Conflict: container name {name} is already in use")));
        }
        state.containers.insert(name.to_string(), MockContainer::new(config));
        Ok(ContainerRef::new(name))
    }

    async fn start_container(&self, container: &ContainerRef) -> RuntimeResult<()> {
        self.enter("start_container")?;
        let mut state = self.lock();
        let target = state
            .containers
            .get_mut(container.as_str())
            .ok_or_else(|| RuntimeError::container_gone(container.as_str()))?;
        target.running = true;
        Ok(())
    }

    async fn stop_container(&self, container: &ContainerRef, _grace: Duration) -> RuntimeResult<()> {
        self.enter("stop_container")?;
        let mut state = self.lock();
        let target = state
            .containers
            .get_mut(container.as_str())
            .ok_or_else(|| RuntimeError::container_gone(container.as_str()))?;
        target.running = false;
        for exec in state.execs.values().filter(|exec| exec.container == container.as_str()) {
            let _ = exec.kill.send(Signal::Kill);
        }
        Ok(())
    }

    async fn remove_container(&self, container: &ContainerRef) -> RuntimeResult<()> {
        self.enter("remove_container")?;
        let mut state = self.lock();
        state
            .containers
            .remove(container.as_str())
            .ok_or_else(|| RuntimeError::container_gone(container.as_str()))?;
        state.subscribers.retain(|sub| sub.container != container.as_str());
        Ok(())
    }

    async fn inspect_container(&self, container: &ContainerRef) -> RuntimeResult<ContainerInfo> {
        self.enter("inspect_container")?;
        let state = self.lock();
        let target = state
            .containers
            .get(container.as_str())
            .ok_or_else(|| RuntimeError::container_gone(container.as_str()))?;
        Ok(ContainerInfo {
            running: target.running,
            ports: target
                .ports
                .iter()
                .map(|&port| PortMapping {
                    container_port: port,
                    host_port: port.checked_add(30_000),
                })
                .collect(),
        })
    }

    async fn exec(
        &self,
        container: &ContainerRef,
        argv: &[String],
        options: &ExecOptions,
    ) -> RuntimeResult<ExecStream> {
        self.enter("exec")?;
        if argv.is_empty() {
            return Err(RuntimeError::invalid_argument("empty command"));
        }
        let program = Program::parse(argv)?;
        self.spawn_exec(container, program, options)
    }

    async fn exec_status(&self, handle: &ExecHandle) -> RuntimeResult<ExecStatus> {
        self.enter("exec_status")?;
        let state = self.lock();
        let exec = state
            .execs
            .get(&handle.exec_id)
            .ok_or_else(|| RuntimeError::not_found(format!("no such exec: {}", handle.exec_id)))?;
        Ok(ExecStatus {
            running: exec.running,
            exit_code: exec.exit_code,
        })
    }

    async fn kill_exec(&self, container: &ContainerRef, handle: &ExecHandle, signal: Signal) -> RuntimeResult<()> {
        self.enter("kill_exec")?;
        let state = self.lock();
        running_container(&state, container)?;
        if let Some(exec) = state.execs.get(&handle.exec_id) {
            if exec.running {
                let _ = exec.kill.send(signal);
            }
        }
        Ok(())
    }

    async fn open_tty(
        &self,
        container: &ContainerRef,
        cols: u16,
        rows: u16,
        options: &ExecOptions,
    ) -> RuntimeResult<ExecStream> {
        self.enter("open_tty")?;
        let mut options = options.clone();
        options.tty = true;
        options.attach_stdin = true;
        let stream = self.spawn_exec(container, Program::Shell, &options)?;
        self.lock().resizes.push((cols, rows));
        Ok(stream)
    }

    async fn resize_tty(&self, handle: &ExecHandle, cols: u16, rows: u16) -> RuntimeResult<()> {
        self.enter("resize_tty")?;
        let mut state = self.lock();
        if !state.execs.contains_key(&handle.exec_id) {
            return Err(RuntimeError::not_found(format!("no such exec: {}", handle.exec_id)));
        }
        state.resizes.push((cols, rows));
        Ok(())
    }

    async fn read_file(&self, container: &ContainerRef, path: &str) -> RuntimeResult<Bytes> {
        self.enter("read_file")?;
        let state = self.lock();
        let target = running_container(&state, container)?;
        if target.dirs.contains(path) {
            return Err(RuntimeError::invalid_argument(format!("{path} is a directory")));
        }
        target
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| RuntimeError::not_found(format!("{path}: no such file")))
    }

    async fn write_file(&self, container: &ContainerRef, path: &str, content: Bytes) -> RuntimeResult<()> {
        self.enter("write_file")?;
        let mut state = self.lock();
        let target = running_container_mut(&mut state, container)?;
        if !target.dirs.contains(parent(path)) {
            return Err(RuntimeError::not_found(format!("{}: no such directory", parent(path))));
        }
        if target.dirs.contains(path) {
            return Err(RuntimeError::invalid_argument(format!("{path} is a directory")));
        }
        let kind = if target.files.insert(path.to_string(), content).is_some() {
            ChangeKind::Modified
        } else {
            ChangeKind::Created
        };
        notify(&mut state, container.as_str(), vec![ChangeEvent::now(path, kind)]);
        Ok(())
    }

    async fn list_dir(&self, container: &ContainerRef, path: &str) -> RuntimeResult<Vec<DirEntry>> {
        self.enter("list_dir")?;
        let state = self.lock();
        let target = running_container(&state, container)?;
        if !target.dirs.contains(path) {
            return Err(RuntimeError::not_found(format!("{path}: no such directory")));
        }
        let direct_child = |candidate: &str| candidate != path && parent(candidate) == path;
        let mut entries: Vec<DirEntry> = target
            .dirs
            .iter()
            .filter(|dir| direct_child(dir))
            .map(|dir| DirEntry {
                name: dir.rsplit('/').next().unwrap_or_default().to_string(),
                is_dir: true,
            })
            .chain(target.files.keys().filter(|file| direct_child(file)).map(|file| DirEntry {
                name: file.rsplit('/').next().unwrap_or_default().to_string(),
                is_dir: false,
            }))
            .collect();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn subscribe_changes(&self, container: &ContainerRef, path: &str) -> RuntimeResult<ChangeStream> {
        self.enter("subscribe_changes")?;
        let mut state = self.lock();
        let target = running_container(&state, container)?;
        if !target.dirs.contains(path) {
            return Err(RuntimeError::not_found(format!("{path}: no such directory")));
        }
        let (tx, mut rx) = mpsc::unbounded_channel();
        state.subscribers.push(Subscriber {
            container: container.as_str().to_string(),
            path: path.to_string(),
            tx,
        });
        Ok(futures_util::stream::poll_fn(move |cx| rx.poll_recv(cx)).boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    async fn running(runtime: &MockRuntime) -> ContainerRef {
        let container = runtime
            .create_container("sandbox-test", &SandboxConfig::default())
            .await
            .unwrap();
        runtime.start_container(&container).await.unwrap();
        container
    }

    async fn collect_stdout(stream: ExecStream) -> String {
        let chunks: Vec<_> = stream.output.collect().await;
        chunks
            .into_iter()
            .filter_map(|chunk| match chunk {
                Ok(OutputChunk::Stdout(data)) => Some(String::from_utf8_lossy(&data).into_owned()),
                _ => None,
            })
            .collect()
    }

    fn shell(script: &str) -> Vec<String> {
        vec!["/bin/sh".into(), "-c".into(), script.into()]
    }

    #[tokio::test]
    async fn test_echo_and_exit_code() {
        let runtime = MockRuntime::new();
        let container = running(&runtime).await;

        let stream = runtime
            .exec(&container, &shell("echo hello"), &ExecOptions::default())
            .await
            .unwrap();
        let handle = stream.handle.clone();
        assert_eq!(collect_stdout(stream).await, "hello\n");

        let status = runtime.exec_status(&handle).await.unwrap();
        assert!(!status.running);
        assert_eq!(status.exit_code, Some(0));
    }

    #[tokio::test]
    async fn test_cat_echoes_stdin() {
        let runtime = MockRuntime::new();
        let container = running(&runtime).await;

        let mut stream = runtime
            .exec(&container, &shell("cat"), &ExecOptions::default())
            .await
            .unwrap();
        stream.input.write_all(b"abc").await.unwrap();
        stream.input.shutdown().await.unwrap();
        drop(stream.input);

        let chunks: Vec<_> = stream.output.collect().await;
        let echoed: Vec<u8> = chunks
            .into_iter()
            .filter_map(|chunk| match chunk {
                Ok(OutputChunk::Stdout(data)) => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect();
        assert_eq!(echoed, b"abc");
    }

    #[tokio::test]
    async fn test_injected_failures_are_consumed_in_order() {
        let runtime = MockRuntime::new();
        runtime.fail_next("create_container", RuntimeError::transient("reset"));

        let first = runtime
            .create_container("a", &SandboxConfig::default())
            .await;
        assert!(first.unwrap_err().is_transient());

        let second = runtime
            .create_container("a", &SandboxConfig::default())
            .await;
        assert!(second.is_ok());
        assert_eq!(runtime.calls("create_container"), 2);
    }

    #[tokio::test]
    async fn test_write_file_notifies_subscribers() {
        let runtime = MockRuntime::new();
        let container = running(&runtime).await;

        let mut changes = runtime.subscribe_changes(&container, "/tmp").await.unwrap();
        runtime
            .write_file(&container, "/tmp/a.txt", Bytes::from_static(b"x"))
            .await
            .unwrap();
        runtime
            .write_file(&container, "/tmp/a.txt", Bytes::from_static(b"y"))
            .await
            .unwrap();

        let first = changes.next().await.unwrap().unwrap();
        let second = changes.next().await.unwrap().unwrap();
        assert_eq!((first.path.as_str(), first.kind), ("/tmp/a.txt", ChangeKind::Created));
        assert_eq!((second.path.as_str(), second.kind), ("/tmp/a.txt", ChangeKind::Modified));
    }

    #[tokio::test]
    async fn test_removed_container_is_gone() {
        let runtime = MockRuntime::new();
        let container = running(&runtime).await;
        runtime.remove_externally(container.as_str());

        let err = runtime.inspect_container(&container).await.unwrap_err();
        assert!(err.is_container_gone());
        let err = runtime
            .exec(&container, &shell("true"), &ExecOptions::default())
            .await
            .unwrap_err();
        assert!(err.is_container_gone());
    }

    #[tokio::test]
    async fn test_list_dir_direct_children_only() {
        let runtime = MockRuntime::new();
        let container = running(&runtime).await;
        runtime
            .write_file(&container, "/tmp/b.txt", Bytes::from_static(b"1"))
            .await
            .unwrap();
        let stream = runtime
            .exec(&container, &shell("mkdir -p /tmp/sub/deeper"), &ExecOptions::default())
            .await
            .unwrap();
        collect_stdout(stream).await;

        let entries = runtime.list_dir(&container, "/tmp").await.unwrap();
        assert_eq!(
            entries,
            vec![
                DirEntry {
                    name: "b.txt".into(),
                    is_dir: false
                },
                DirEntry {
                    name: "sub".into(),
                    is_dir: true
                },
            ]
        );
    }
}
