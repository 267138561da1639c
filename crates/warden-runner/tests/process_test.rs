//! Real-process tests for the OS runner: spawning, output capture, env
//! overlay, graceful and forced stops, spawn failures, truncation.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use uuid::Uuid;

use warden_core::error::SpawnError;
use warden_core::models::{ExitStatus, LogStream};
use warden_core::runner::{RunnerEvent, RunnerFactory, RunnerSpec};
use warden_runner::OsRunnerFactory;

fn spec(argv: &[&str]) -> RunnerSpec {
    RunnerSpec {
        workload_id: Uuid::new_v4(),
        argv: argv.iter().map(|s| s.to_string()).collect(),
        cwd: None,
        env: BTreeMap::new(),
        max_line_bytes: 64 * 1024,
        sample_interval: Duration::from_secs(60),
    }
}

async fn collect_until_exit(
    rx: &mut mpsc::UnboundedReceiver<RunnerEvent>,
) -> (Vec<RunnerEvent>, ExitStatus) {
    let mut events = Vec::new();
    loop {
        let event = timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("runner events timed out")
            .expect("event channel closed");
        if let RunnerEvent::Exited { exit, .. } = &event {
            let exit = *exit;
            events.push(event);
            return (events, exit);
        }
        events.push(event);
    }
}

fn stdout_lines(events: &[RunnerEvent]) -> Vec<(String, bool)> {
    events
        .iter()
        .filter_map(|e| match e {
            RunnerEvent::Line {
                stream: LogStream::Stdout,
                line,
                truncated,
                ..
            } => Some((line.clone(), *truncated)),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn test_echo_emits_started_line_and_clean_exit() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = OsRunnerFactory
        .spawn(spec(&["/bin/sh", "-c", "echo hi; exit 0"]), tx)
        .await
        .expect("spawn");
    assert!(handle.pid() > 0);

    let (events, exit) = collect_until_exit(&mut rx).await;
    assert_eq!(exit, ExitStatus::Code(0));
    assert!(matches!(events[0], RunnerEvent::Started { .. }));
    assert_eq!(stdout_lines(&events), vec![("hi".to_string(), false)]);

    // Exactly one Started and one Exited per spawn.
    let started = events
        .iter()
        .filter(|e| matches!(e, RunnerEvent::Started { .. }))
        .count();
    let exited = events
        .iter()
        .filter(|e| matches!(e, RunnerEvent::Exited { .. }))
        .count();
    assert_eq!((started, exited), (1, 1));
}

#[tokio::test]
async fn test_nonzero_exit_code_is_reported() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    OsRunnerFactory
        .spawn(spec(&["/bin/sh", "-c", "exit 7"]), tx)
        .await
        .expect("spawn");
    let (_, exit) = collect_until_exit(&mut rx).await;
    assert_eq!(exit, ExitStatus::Code(7));
}

#[tokio::test]
async fn test_stderr_is_captured_separately() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    OsRunnerFactory
        .spawn(spec(&["/bin/sh", "-c", "echo out; echo err >&2"]), tx)
        .await
        .expect("spawn");
    let (events, exit) = collect_until_exit(&mut rx).await;
    assert_eq!(exit, ExitStatus::Code(0));
    assert!(events.iter().any(|e| matches!(
        e,
        RunnerEvent::Line { stream: LogStream::Stderr, line, .. } if line == "err"
    )));
    assert!(events.iter().any(|e| matches!(
        e,
        RunnerEvent::Line { stream: LogStream::Stdout, line, .. } if line == "out"
    )));
}

#[tokio::test]
async fn test_env_overlay_overrides_and_inherits() {
    // SAFETY: setting a unique var in a test process before spawning.
    unsafe { std::env::set_var("WARDEN_TEST_INHERITED", "from-parent") };
    let mut s = spec(&[
        "/bin/sh",
        "-c",
        "echo $WARDEN_TEST_INHERITED:$WARDEN_TEST_OVERLAY",
    ]);
    s.env
        .insert("WARDEN_TEST_OVERLAY".to_string(), "from-overlay".to_string());

    let (tx, mut rx) = mpsc::unbounded_channel();
    OsRunnerFactory.spawn(s, tx).await.expect("spawn");
    let (events, _) = collect_until_exit(&mut rx).await;
    assert_eq!(
        stdout_lines(&events),
        vec![("from-parent:from-overlay".to_string(), false)]
    );
}

#[tokio::test]
async fn test_cwd_is_applied() {
    let dir = tempfile::TempDir::new().expect("temp dir");
    let mut s = spec(&["/bin/sh", "-c", "pwd"]);
    s.cwd = Some(dir.path().to_path_buf());

    let (tx, mut rx) = mpsc::unbounded_channel();
    OsRunnerFactory.spawn(s, tx).await.expect("spawn");
    let (events, _) = collect_until_exit(&mut rx).await;
    let lines = stdout_lines(&events);
    assert_eq!(lines.len(), 1);
    // Compare canonicalized paths; /tmp is often a symlink.
    assert_eq!(
        PathBuf::from(&lines[0].0).canonicalize().unwrap(),
        dir.path().canonicalize().unwrap()
    );
}

#[tokio::test]
async fn test_spawn_errors_are_classified() {
    let (tx, _rx) = mpsc::unbounded_channel();
    let err = OsRunnerFactory
        .spawn(spec(&["/no/such/binary"]), tx)
        .await
        .expect_err("must fail");
    assert!(matches!(err, SpawnError::ExecutableNotFound(_)));

    let (tx, _rx) = mpsc::unbounded_channel();
    let mut s = spec(&["/bin/true"]);
    s.cwd = Some(PathBuf::from("/no/such/dir"));
    let err = OsRunnerFactory.spawn(s, tx).await.expect_err("must fail");
    assert!(matches!(err, SpawnError::InvalidWorkingDir(_)));
}

#[tokio::test]
async fn test_graceful_stop_terminates_the_process() {
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = OsRunnerFactory
        .spawn(spec(&["/bin/sleep", "30"]), tx)
        .await
        .expect("spawn");

    // Wait for Started, then stop with a short grace.
    match rx.recv().await {
        Some(RunnerEvent::Started { .. }) => {}
        other => panic!("expected Started, got {other:?}"),
    }
    handle.stop(Duration::from_secs(5));

    let (_, exit) = collect_until_exit(&mut rx).await;
    // sleep dies on SIGTERM.
    assert_eq!(exit, ExitStatus::Signal(15));
}

#[tokio::test]
async fn test_stop_escalates_to_kill_after_grace() {
    // A shell that traps and ignores SIGTERM only dies to SIGKILL.
    let (tx, mut rx) = mpsc::unbounded_channel();
    let handle = OsRunnerFactory
        .spawn(spec(&["/bin/sh", "-c", "trap '' TERM; sleep 30"]), tx)
        .await
        .expect("spawn");

    match rx.recv().await {
        Some(RunnerEvent::Started { .. }) => {}
        other => panic!("expected Started, got {other:?}"),
    }
    // Give the shell a moment to install the trap.
    tokio::time::sleep(Duration::from_millis(200)).await;
    handle.stop(Duration::from_millis(300));

    let (_, exit) = collect_until_exit(&mut rx).await;
    assert_eq!(exit, ExitStatus::Signal(9));
}

#[tokio::test]
async fn test_long_lines_are_capped_with_marker() {
    let mut s = spec(&["/bin/sh", "-c", "printf 'aaaaaaaaaaaaaaaaaaaa\\n'"]);
    s.max_line_bytes = 16;

    let (tx, mut rx) = mpsc::unbounded_channel();
    OsRunnerFactory.spawn(s, tx).await.expect("spawn");
    let (events, _) = collect_until_exit(&mut rx).await;
    assert_eq!(
        stdout_lines(&events),
        vec![("a".repeat(16), true), ("a".repeat(4), false)]
    );
}
