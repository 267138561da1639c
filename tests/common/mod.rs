//! Shared fixtures: a scripted runner factory so state-machine behavior is
//! deterministic, and event-stream helpers.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{broadcast, mpsc};

use warden_core::error::SpawnError;
use warden_core::events::{Event, EventKind};
use warden_core::models::{ExitStatus, LogStream, Phase};
use warden_core::runner::{ProcessHandle, RunnerEvent, RunnerFactory, RunnerSpec, SignalKind};

/// One scripted run for the fake factory.
#[derive(Debug, Clone)]
pub enum FakeRun {
    /// Start, emit the lines, then exit with `code` after `after`.
    Exit {
        code: i32,
        after: Duration,
        lines: Vec<(LogStream, String)>,
    },
    /// Fail before any process exists.
    SpawnFail,
    /// Run until stopped; exits with SIGTERM's signal code.
    RunUntilStopped,
}

impl FakeRun {
    pub fn quick_exit(code: i32) -> Self {
        FakeRun::Exit {
            code,
            after: Duration::from_millis(10),
            lines: Vec::new(),
        }
    }
}

/// Scripted [`RunnerFactory`]: pops one `FakeRun` per spawn, falling back
/// to the default when the script runs dry.
pub struct FakeRunnerFactory {
    script: Mutex<VecDeque<FakeRun>>,
    fallback: FakeRun,
    next_pid: AtomicU32,
    pub spawn_count: AtomicUsize,
}

impl FakeRunnerFactory {
    pub fn scripted(runs: Vec<FakeRun>, fallback: FakeRun) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(runs.into()),
            fallback,
            next_pid: AtomicU32::new(1000),
            spawn_count: AtomicUsize::new(0),
        })
    }

    pub fn always(run: FakeRun) -> Arc<Self> {
        Self::scripted(Vec::new(), run)
    }

    pub fn spawns(&self) -> usize {
        self.spawn_count.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RunnerFactory for FakeRunnerFactory {
    async fn spawn(
        &self,
        _spec: RunnerSpec,
        events: mpsc::UnboundedSender<RunnerEvent>,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        self.spawn_count.fetch_add(1, Ordering::SeqCst);
        let run = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        match run {
            FakeRun::SpawnFail => Err(SpawnError::ExecutableNotFound("fake".to_string())),
            FakeRun::Exit { code, after, lines } => {
                let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
                let (stop_tx, mut stop_rx) = mpsc::unbounded_channel::<()>();
                tokio::spawn(async move {
                    let _ = events.send(RunnerEvent::Started {
                        pid,
                        at: Utc::now(),
                    });
                    tokio::select! {
                        _ = tokio::time::sleep(after) => {
                            for (stream, line) in lines {
                                let _ = events.send(RunnerEvent::Line {
                                    stream,
                                    line,
                                    truncated: false,
                                    at: Utc::now(),
                                });
                            }
                            let _ = events.send(RunnerEvent::Exited {
                                exit: ExitStatus::Code(code),
                                at: Utc::now(),
                            });
                        }
                        Some(_) = stop_rx.recv() => {
                            let _ = events.send(RunnerEvent::Exited {
                                exit: ExitStatus::Signal(15),
                                at: Utc::now(),
                            });
                        }
                    }
                });
                Ok(Box::new(FakeHandle { pid, stop_tx }))
            }
            FakeRun::RunUntilStopped => {
                let pid = self.next_pid.fetch_add(1, Ordering::SeqCst);
                let (stop_tx, mut stop_rx) = mpsc::unbounded_channel::<()>();
                tokio::spawn(async move {
                    let _ = events.send(RunnerEvent::Started {
                        pid,
                        at: Utc::now(),
                    });
                    if stop_rx.recv().await.is_some() {
                        let _ = events.send(RunnerEvent::Exited {
                            exit: ExitStatus::Signal(15),
                            at: Utc::now(),
                        });
                    }
                });
                Ok(Box::new(FakeHandle { pid, stop_tx }))
            }
        }
    }
}

struct FakeHandle {
    pid: u32,
    stop_tx: mpsc::UnboundedSender<()>,
}

impl ProcessHandle for FakeHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn signal(&self, _kind: SignalKind) {}

    fn stop(&self, _grace: Duration) {
        let _ = self.stop_tx.send(());
    }
}

/// Collects events already delivered plus anything arriving within `wait`.
pub async fn drain_events(rx: &mut broadcast::Receiver<Event>, wait: Duration) -> Vec<Event> {
    let mut events = Vec::new();
    let deadline = tokio::time::Instant::now() + wait;
    loop {
        match tokio::time::timeout_at(deadline, rx.recv()).await {
            Ok(Ok(event)) => events.push(event),
            Ok(Err(broadcast::error::RecvError::Lagged(_))) => continue,
            _ => break,
        }
    }
    events
}

/// The phases a workload passed through, in order.
pub fn phase_path(events: &[Event], workload: uuid::Uuid) -> Vec<Phase> {
    events
        .iter()
        .filter(|e| e.workload == Some(workload))
        .filter_map(|e| match e.kind {
            EventKind::PhaseChanged { to, .. } => Some(to),
            _ => None,
        })
        .collect()
}

pub fn count_kind(events: &[Event], pred: impl Fn(&EventKind) -> bool) -> usize {
    events.iter().filter(|e| pred(&e.kind)).count()
}

/// Polls `describe` until the workload reaches `phase`.
pub async fn wait_for_phase<S: warden_core::Store + 'static>(
    coordinator: &warden_core::Coordinator<S>,
    id: uuid::Uuid,
    phase: Phase,
    within: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if let Ok(detail) = coordinator.describe(id).await {
            if detail.runtime.phase == phase {
                return true;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}
