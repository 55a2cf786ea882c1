mod common;

use std::time::Duration;

use bytes::Bytes;
use common::{next, running_session};
use sandbox_session::{MockRuntime, RuntimeError, TerminalEvent, TerminalOptions, TerminalState};
use tokio::sync::mpsc;

fn channel_listener() -> (
    impl Fn(&TerminalEvent) + Send + Sync + 'static,
    mpsc::UnboundedReceiver<TerminalEvent>,
) {
    let (tx, rx) = mpsc::unbounded_channel();
    (move |event: &TerminalEvent| drop(tx.send(event.clone())), rx)
}

#[tokio::test(start_paused = true)]
async fn test_terminal_echoes_input_and_goes_quiet_after_close() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let terminal = session.terminals().open(80, 24).await.unwrap();
    assert_eq!(terminal.state(), TerminalState::Active);
    assert_eq!(terminal.size(), (80, 24));

    let (listener, mut events) = channel_listener();
    terminal.add_listener(listener).unwrap();
    terminal.send_data("ls\n").await.unwrap();

    assert_eq!(
        next(&mut events).await,
        Some(TerminalEvent::Data(Bytes::from_static(b"ls\n")))
    );

    terminal.close().await.unwrap();
    assert_eq!(terminal.state(), TerminalState::Closed);
    assert_eq!(terminal.listener_count(), 0);
    assert_eq!(next(&mut events).await, None);

    assert!(terminal.send_data("pwd\n").await.unwrap_err().is_precondition());
    assert!(session.terminals().list().is_empty());
    // The shell is killed asynchronously
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(runtime.running_execs(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_every_listener_sees_every_chunk() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let terminal = session.terminals().open(80, 24).await.unwrap();

    let (first, mut first_rx) = channel_listener();
    let (second, mut second_rx) = channel_listener();
    terminal.add_listener(first).unwrap();
    let second_id = terminal.add_listener(second).unwrap();

    terminal.send_data("a\n").await.unwrap();
    let chunk = Some(TerminalEvent::Data(Bytes::from_static(b"a\n")));
    assert_eq!(next(&mut first_rx).await, chunk);
    assert_eq!(next(&mut second_rx).await, chunk);

    assert!(terminal.remove_listener(second_id));
    terminal.send_data("b\n").await.unwrap();
    assert_eq!(
        next(&mut first_rx).await,
        Some(TerminalEvent::Data(Bytes::from_static(b"b\n")))
    );
    assert_eq!(next(&mut second_rx).await, None);
}

#[tokio::test(start_paused = true)]
async fn test_resize_keeps_stream_order() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let terminal = session.terminals().open(80, 24).await.unwrap();
    let (listener, mut events) = channel_listener();
    terminal.add_listener(listener).unwrap();

    terminal.send_data("before\n").await.unwrap();
    terminal.resize(120, 40).await.unwrap();
    terminal.send_data("after\n").await.unwrap();

    assert_eq!(
        next(&mut events).await,
        Some(TerminalEvent::Data(Bytes::from_static(b"before\n")))
    );
    assert_eq!(
        next(&mut events).await,
        Some(TerminalEvent::Data(Bytes::from_static(b"after\n")))
    );
    assert_eq!(terminal.size(), (120, 40));
    assert_eq!(runtime.resizes(), vec![(80, 24), (120, 40)]);
    assert_eq!(terminal.state(), TerminalState::Active);
}

#[tokio::test(start_paused = true)]
async fn test_invalid_sizes_are_rejected() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;

    let err = session.terminals().open(0, 24).await.unwrap_err();
    assert!(matches!(
        err,
        sandbox_session::SandboxError::Runtime(RuntimeError::InvalidArgument { .. })
    ));
    assert_eq!(runtime.calls("open_tty"), 0);

    let terminal = session.terminals().open(80, 24).await.unwrap();
    assert!(terminal.resize(80, 0).await.is_err());
    assert_eq!(terminal.size(), (80, 24));
}

#[tokio::test(start_paused = true)]
async fn test_shell_exit_sends_single_closed_event() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let terminal = session.terminals().open(80, 24).await.unwrap();
    let (listener, mut events) = channel_listener();
    terminal.add_listener(listener).unwrap();

    terminal.send_data("exit\n").await.unwrap();

    assert_eq!(
        next(&mut events).await,
        Some(TerminalEvent::Data(Bytes::from_static(b"exit\n")))
    );
    assert_eq!(next(&mut events).await, Some(TerminalEvent::Closed));
    assert_eq!(next(&mut events).await, None);
    terminal.closed().await;
    assert_eq!(terminal.state(), TerminalState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_session_close_notifies_terminal_listeners() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let terminal = session
        .terminals()
        .open_with(100, 30, TerminalOptions {
            cwd: Some("/tmp".into()),
            ..TerminalOptions::default()
        })
        .await
        .unwrap();
    let (listener, mut events) = channel_listener();
    terminal.add_listener(listener).unwrap();

    session.close().await.unwrap();

    assert_eq!(next(&mut events).await, Some(TerminalEvent::Closed));
    assert_eq!(next(&mut events).await, None);
    assert_eq!(terminal.state(), TerminalState::Closed);
}

#[tokio::test(start_paused = true)]
async fn test_terminals_are_tracked_by_id() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let first = session.terminals().open(80, 24).await.unwrap();
    let second = session.terminals().open(80, 24).await.unwrap();

    assert_ne!(first.id(), second.id());
    assert_eq!(session.terminals().list().len(), 2);
    assert_eq!(session.terminals().get(second.id()).unwrap().id(), second.id());

    first.close().await.unwrap();
    let open: Vec<u64> = session.terminals().list().iter().map(|t| t.id()).collect();
    assert_eq!(open, vec![second.id()]);
    assert!(session.terminals().get(first.id()).is_none());
}

#[tokio::test(start_paused = true)]
async fn test_exited_shell_leaves_the_table() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let terminal = session.terminals().open(80, 24).await.unwrap();

    terminal.send_data("exit\n").await.unwrap();
    terminal.closed().await;

    assert!(session.terminals().get(terminal.id()).is_none());
    assert!(session.terminals().list().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_calls_with_explicit_deadlines() {
    let runtime = MockRuntime::new();
    let session = running_session(&runtime).await;
    let terminal = session.terminals().open(80, 24).await.unwrap();
    let deadline = Some(Duration::from_secs(2));

    terminal.send_data_with_deadline("ls\n", deadline).await.unwrap();
    terminal.resize_with_deadline(100, 30, deadline).await.unwrap();
    assert_eq!(terminal.size(), (100, 30));
    terminal.close_with_deadline(deadline).await.unwrap();

    assert_eq!(terminal.state(), TerminalState::Closed);
    assert_eq!(runtime.calls("kill_exec"), 1);
}
