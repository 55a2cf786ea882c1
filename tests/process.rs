mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{config, next, running_session, running_session_with};
use futures_util::future::join_all;
use sandbox_session::{
    MockRuntime, ProcessEvent, ProcessState, RuntimeError, SandboxConfig, SandboxError, StartOptions,
};
use tokio::sync::mpsc;

#[tokio::test(start_paused = true)]
async fn test_echo_hello() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;

    let output = session
        .processes()
        .run("echo hello", StartOptions::default())
        .await
        .unwrap();

    assert_eq!(output.state, ProcessState::Exited);
    assert_eq!(output.exit_code, Some(0));
    assert_eq!(output.stdout_str(), "hello\n");
    assert!(output.stderr.is_empty());
    assert!(output.success());
}

#[tokio::test(start_paused = true)]
async fn test_stderr_and_exit_code_are_kept_apart() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;

    let output = session
        .processes()
        .run("echo oops >&2", StartOptions::default())
        .await
        .unwrap();
    assert_eq!(output.stderr_str(), "oops\n");
    assert!(output.stdout.is_empty());

    let output = session
        .processes()
        .run("exit 3", StartOptions::default())
        .await
        .unwrap();
    assert_eq!(output.state, ProcessState::Exited);
    assert_eq!(output.exit_code, Some(3));
    assert!(!output.success());
}

#[tokio::test(start_paused = true)]
async fn test_timeout_marks_timed_out_and_later_kill_is_noop() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;

    let process = session
        .processes()
        .start("sleep 10", StartOptions::default().timeout(Duration::from_secs(1)))
        .await
        .unwrap();
    let output = process.wait().await;

    assert_eq!(output.state, ProcessState::TimedOut);
    assert_eq!(output.exit_code, None);
    assert_eq!(process.exit_code(), None);
    assert!(output.may_be_incomplete());

    let kills = runtime.calls("kill_exec");
    process.kill().await.unwrap();
    assert_eq!(process.state(), ProcessState::TimedOut);
    assert_eq!(runtime.calls("kill_exec"), kills);
}

#[tokio::test(start_paused = true)]
async fn test_kill_running_process() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let process = session
        .processes()
        .start("sleep 100", StartOptions::default())
        .await
        .unwrap();

    process.kill().await.unwrap();

    assert_eq!(process.state(), ProcessState::Killed);
    assert_eq!(process.exit_code(), None);
    assert_eq!(runtime.running_execs(), 0);
    let err = process.send_stdin("late").await.unwrap_err();
    assert!(err.is_precondition());
}

#[tokio::test(start_paused = true)]
async fn test_wait_timeout_kills_in_background() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let process = session
        .processes()
        .start("sleep 100", StartOptions::default())
        .await
        .unwrap();

    let err = process.wait_timeout(Duration::from_secs(1)).await.unwrap_err();
    assert!(err.is_timeout());

    let output = process.wait().await;
    assert_eq!(output.state, ProcessState::Killed);
}

#[tokio::test(start_paused = true)]
async fn test_stdin_is_delivered_in_order() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let process = session.processes().start("cat", StartOptions::default()).await.unwrap();

    process.send_stdin("first\n").await.unwrap();
    process.send_stdin("second\n").await.unwrap();
    process.close_stdin().await.unwrap();
    let output = process.wait().await;

    assert_eq!(output.stdout_str(), "first\nsecond\n");
    assert_eq!(output.exit_code, Some(0));
    assert!(!process.stdout_chunks().is_empty());
    // Closing again is harmless
    process.close_stdin().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn test_output_overflow_keeps_newest_bytes() {
    let runtime = MockRuntime::new();
    let config = SandboxConfig {
        output_buffer_bytes: 8,
        ..config()
    };
    let session = running_session_with(&runtime, config).await;

    let output = session
        .processes()
        .run("echo 0123456789abcdef", StartOptions::default())
        .await
        .unwrap();

    assert_eq!(output.stdout_str(), "9abcdef\n");
    assert_eq!(output.stdout_dropped, 9);
    assert!(output.is_truncated());
    assert_eq!(output.exit_code, Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_transient_exec_failures_are_retried() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let before = runtime.calls("exec");
    runtime.fail_next("exec", RuntimeError::transient("connection reset"));
    runtime.fail_next("exec", RuntimeError::transient("connection reset"));

    let output = session
        .processes()
        .run("echo retried", StartOptions::default())
        .await
        .unwrap();

    assert_eq!(output.stdout_str(), "retried\n");
    assert_eq!(runtime.calls("exec"), before + 3);
}

#[tokio::test(start_paused = true)]
async fn test_exec_retries_exhausted() {
    let runtime = MockRuntime::new();
    let config = SandboxConfig {
        max_retries: 1,
        ..config()
    };
    let session = running_session_with(&runtime, config).await;
    let before = runtime.calls("exec");
    runtime.fail_next("exec", RuntimeError::transient("busy"));
    runtime.fail_next("exec", RuntimeError::transient("busy"));

    let err = session
        .processes()
        .start("echo never", StartOptions::default())
        .await
        .unwrap_err();

    match err {
        SandboxError::RetriesExhausted { attempts, last, .. } => {
            assert_eq!(attempts, 2);
            assert!(last.is_transient());
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(runtime.calls("exec"), before + 2);
    assert!(session.processes().list().is_empty());
    assert_eq!(session.status(), sandbox_session::SessionStatus::Running);
}

#[tokio::test(start_paused = true)]
async fn test_without_shell_splits_arguments() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;

    let output = session
        .processes()
        .run("printf 'a b'", StartOptions::default().without_shell())
        .await
        .unwrap();
    assert_eq!(output.stdout_str(), "a b");

    let before = runtime.calls("exec");
    let err = session
        .processes()
        .start("echo 'unterminated", StartOptions::default().without_shell())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        SandboxError::Runtime(RuntimeError::InvalidArgument { .. })
    ));
    assert_eq!(runtime.calls("exec"), before);
}

#[tokio::test(start_paused = true)]
async fn test_cwd_and_env_overrides() {
    let runtime = MockRuntime::new();
    let mut config = config();
    config.environment.insert("GREETING".into(), "hi".into());
    let session = running_session_with(&runtime, config).await;

    let pwd = session.processes().run("pwd", StartOptions::default()).await.unwrap();
    assert_eq!(pwd.stdout_str(), "/home/user\n");

    let pwd = session
        .processes()
        .run("pwd", StartOptions::default().cwd("/tmp"))
        .await
        .unwrap();
    assert_eq!(pwd.stdout_str(), "/tmp\n");

    let env = session
        .processes()
        .run("printenv GREETING", StartOptions::default())
        .await
        .unwrap();
    assert_eq!(env.stdout_str(), "hi\n");

    let env = session
        .processes()
        .run("printenv GREETING", StartOptions::default().env("GREETING", "hello"))
        .await
        .unwrap();
    assert_eq!(env.stdout_str(), "hello\n");
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_processes_get_distinct_pids() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let processes = session.processes();

    let runs = (0..8).map(|i| async move {
        let command = format!("echo {i}");
        processes.run(&command, StartOptions::default()).await
    });
    let outputs = join_all(runs).await;

    let mut pids: Vec<u64> = outputs.iter().map(|output| output.as_ref().unwrap().pid).collect();
    pids.sort_unstable();
    pids.dedup();
    assert_eq!(pids.len(), 8);
    for output in outputs {
        let output = output.unwrap();
        let process = processes.get(output.pid).unwrap();
        assert_eq!(output.stdout_str(), format!("{}\n", &process.command()[5..]));
    }
    assert_eq!(processes.list().len(), 8);
}

#[tokio::test(start_paused = true)]
async fn test_kill_after_exit_keeps_exit_code() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let process = session.processes().start("exit 7", StartOptions::default()).await.unwrap();
    process.wait().await;

    let kills = runtime.calls("kill_exec");
    process.kill().await.unwrap();

    assert_eq!(process.state(), ProcessState::Exited);
    assert_eq!(process.exit_code(), Some(7));
    assert_eq!(runtime.calls("kill_exec"), kills);
}

#[tokio::test(start_paused = true)]
async fn test_failed_kill_still_records_natural_exit() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let process = session.processes().start("sleep 1", StartOptions::default()).await.unwrap();
    runtime.fail_next("kill_exec", RuntimeError::permission_denied("nope"));

    let err = process.kill().await.unwrap_err();
    assert!(matches!(
        err,
        SandboxError::Runtime(RuntimeError::PermissionDenied { .. })
    ));

    let output = process.wait().await;
    assert_eq!(output.state, ProcessState::Exited);
    assert_eq!(output.exit_code, Some(0));
}

#[tokio::test(start_paused = true)]
async fn test_kill_with_deadline() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let process = session.processes().start("sleep 100", StartOptions::default()).await.unwrap();

    process
        .send_stdin_with_deadline("ignored", Some(Duration::from_secs(2)))
        .await
        .unwrap();
    process.kill_with_deadline(Some(Duration::from_secs(2))).await.unwrap();

    assert_eq!(process.state(), ProcessState::Killed);
    assert_eq!(runtime.running_execs(), 0);
}

fn event_channel() -> (
    impl Fn(&ProcessEvent) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<ProcessEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (move |event: &ProcessEvent| drop(tx.send(event.clone())), rx)
}

#[tokio::test(start_paused = true)]
async fn test_output_listener_sees_chunks_then_exit() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let (listener, mut events) = event_channel();

    let (process, _) = session
        .processes()
        .start_with("cat", StartOptions::default(), listener)
        .await
        .unwrap();
    process.send_stdin("ping\n").await.unwrap();
    assert_eq!(
        next(&mut events).await,
        Some(ProcessEvent::Stdout(Bytes::from_static(b"ping\n")))
    );

    process.close_stdin().await.unwrap();
    process.wait().await;
    assert_eq!(
        next(&mut events).await,
        Some(ProcessEvent::Exit {
            state: ProcessState::Exited,
            exit_code: Some(0),
        })
    );
    assert_eq!(next(&mut events).await, None);
    assert!(process.add_output_listener(|_| {}).is_err());
}

#[tokio::test(start_paused = true)]
async fn test_removed_output_listener_is_silent() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let process = session.processes().start("cat", StartOptions::default()).await.unwrap();
    let (kept, mut kept_events) = event_channel();
    let (dropped, mut dropped_events) = event_channel();
    process.add_output_listener(kept).unwrap();
    let id = process.add_output_listener(dropped).unwrap();

    assert!(process.remove_output_listener(id));
    process.send_stdin("x").await.unwrap();

    assert_eq!(
        next(&mut kept_events).await,
        Some(ProcessEvent::Stdout(Bytes::from_static(b"x")))
    );
    assert_eq!(next(&mut dropped_events).await, None);
    process.kill().await.unwrap();
    assert_eq!(
        next(&mut kept_events).await,
        Some(ProcessEvent::Exit {
            state: ProcessState::Killed,
            exit_code: None,
        })
    );
}

#[tokio::test(start_paused = true)]
async fn test_finished_processes_can_be_removed() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let processes = session.processes();
    let done = processes.run("echo hi", StartOptions::default()).await.unwrap();
    let sleeper = processes.start("sleep 100", StartOptions::default()).await.unwrap();

    assert!(processes.remove(sleeper.pid()).unwrap_err().is_precondition());
    assert!(processes.remove(done.pid).unwrap().is_some());
    assert!(processes.remove(done.pid).unwrap().is_none());
    assert!(processes.get(done.pid).is_none());
    assert_eq!(processes.list().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_finished_processes_are_pruned_past_retention() {
    let runtime = MockRuntime::new();
    let config = SandboxConfig {
        process_retention: 3,
        ..config()
    };
    let session = running_session_with(&runtime, config).await;
    let processes = session.processes();

    let mut pids = Vec::new();
    for i in 0..50 {
        let output = processes.run(&format!("echo {i}"), StartOptions::default()).await.unwrap();
        pids.push(output.pid);
    }

    // The newest run is tracked too; pruning happens before each insert
    let tracked: Vec<u64> = processes.list().iter().map(|process| process.pid()).collect();
    assert_eq!(tracked, pids[pids.len() - 4..]);

    session.close().await.unwrap();
    assert!(processes.list().is_empty());
}
