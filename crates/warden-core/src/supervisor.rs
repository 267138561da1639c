//! Per-workload supervisor: a single actor task owning the workload's
//! runtime state and its live runner, driven by one serialized inbox of
//! control commands, runner events, and timer fires.
//!
//! State machine:
//!
//! ```text
//!   Idle  --start-->            Starting
//!   Starting --started-->       Running
//!   Starting --exited-->        Evaluating
//!   Running --exited-->         Evaluating
//!   Running --stop-->           Stopping
//!   Stopping --exited-->        Stopped
//!   Evaluating --retry-->       BackingOff
//!   Evaluating --done-->        Stopped | Failed
//!   BackingOff --timer-->       Starting
//!   BackingOff --stop-->        Stopped
//!   Stopped/Failed --start-->   Starting
//!   any --delete-->             Terminated
//! ```

use std::ops::ControlFlow;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::DaemonConfig;
use crate::error::ControlError;
use crate::events::{Bus, Event, EventKind};
use crate::models::{
    ExitStatus, LogRecord, LogStream, Phase, RestartPolicy, RuntimeState, Workload,
    WorkloadDetail,
};
use crate::policy::{self, RestartDecision};
use crate::runner::{ProcessHandle, RunnerEvent, RunnerFactory, RunnerSpec, DEFAULT_MAX_LINE_BYTES};
use crate::store::{Store, StoreGateway};
use crate::timer::{TimerFire, TimerId, TimerWheel};

/// A run shorter than this keeps the failure streak alive; one that
/// survives this long counts as a successful `Running` entry and resets
/// `consecutive_failures`.
pub const HEALTHY_UPTIME: Duration = Duration::from_secs(30);

/// Commands accepted by a supervisor.
pub enum Command {
    Start {
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    Stop {
        grace: Duration,
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    /// Atomic stop-then-start; no other command slots between the halves.
    Restart {
        delay: Option<Duration>,
        reply: oneshot::Sender<Result<(), ControlError>>,
    },
    /// A schedule fired. Dropped with `SkippedConcurrent` while active.
    Fire { schedule_id: Uuid },
    Describe {
        reply: oneshot::Sender<WorkloadDetail>,
    },
    UpdateWorkload(Box<Workload>),
    UpdatePolicy(Box<RestartPolicy>),
    /// Recovery found a pid from a prior daemon generation.
    MarkLost { pid: u32 },
    Delete {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable mailbox for a supervisor actor.
#[derive(Clone)]
pub struct SupervisorHandle {
    pub workload_id: Uuid,
    tx: mpsc::UnboundedSender<Command>,
}

impl SupervisorHandle {
    pub fn send(&self, command: Command) -> Result<(), ControlError> {
        self.tx
            .send(command)
            .map_err(|_| ControlError::Internal("supervisor terminated".to_string()))
    }
}

/// Shared dependencies handed to every supervisor.
pub struct SupervisorDeps<S> {
    pub factory: Arc<dyn RunnerFactory>,
    pub gateway: StoreGateway<S>,
    pub bus: Bus,
    pub timer: TimerWheel,
    pub config: DaemonConfig,
}

impl<S> Clone for SupervisorDeps<S> {
    fn clone(&self) -> Self {
        Self {
            factory: self.factory.clone(),
            gateway: self.gateway.clone(),
            bus: self.bus.clone(),
            timer: self.timer.clone(),
            config: self.config.clone(),
        }
    }
}

struct RestartPending {
    delay: Option<Duration>,
    reply: oneshot::Sender<Result<(), ControlError>>,
}

pub struct Supervisor;

impl Supervisor {
    /// Spawns the actor task. `initial_log_seq` is the highest sequence
    /// already persisted for this workload.
    pub fn spawn<S: Store + 'static>(
        workload: Workload,
        policy: RestartPolicy,
        deps: SupervisorDeps<S>,
        initial_log_seq: i64,
    ) -> SupervisorHandle {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (runner_tx, runner_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let handle = SupervisorHandle {
            workload_id: workload.id,
            tx: cmd_tx,
        };

        let actor = Actor {
            workload,
            policy,
            state: RuntimeState::default(),
            runner: None,
            deps,
            cmd_rx,
            runner_tx,
            runner_rx,
            timer_tx,
            timer_rx,
            log_seq: initial_log_seq,
            backoff_timer: None,
            backoff_token: 0,
            restart_pending: None,
            restart_settling: false,
            stop_waiters: Vec::new(),
        };
        tokio::spawn(actor.run());

        handle
    }
}

struct Actor<S> {
    workload: Workload,
    policy: RestartPolicy,
    state: RuntimeState,
    runner: Option<Box<dyn ProcessHandle>>,
    deps: SupervisorDeps<S>,

    cmd_rx: mpsc::UnboundedReceiver<Command>,
    runner_tx: mpsc::UnboundedSender<RunnerEvent>,
    runner_rx: mpsc::UnboundedReceiver<RunnerEvent>,
    timer_tx: mpsc::UnboundedSender<TimerFire>,
    timer_rx: mpsc::UnboundedReceiver<TimerFire>,

    log_seq: i64,
    backoff_timer: Option<TimerId>,
    backoff_token: u64,
    restart_pending: Option<RestartPending>,
    /// True between a restart's second half being issued and its spawn
    /// settling; stops landing in this window read as `AlreadyStopped`.
    restart_settling: bool,
    /// Stop callers coalesced onto the in-flight stop.
    stop_waiters: Vec<oneshot::Sender<Result<(), ControlError>>>,
}

impl<S: Store + 'static> Actor<S> {
    async fn run(mut self) {
        loop {
            tokio::select! {
                Some(command) = self.cmd_rx.recv() => {
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                Some(event) = self.runner_rx.recv() => self.handle_runner_event(event).await,
                Some(fire) = self.timer_rx.recv() => self.handle_timer(fire).await,
                else => break,
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Start { reply } => match self.state.phase {
                Phase::Idle | Phase::Stopped | Phase::Failed => {
                    // Accepted: the caller's start succeeds here; a spawn
                    // failure is reported through the event stream so
                    // policy-driven retries behave the same pre- and
                    // post-spawn.
                    let _ = reply.send(Ok(()));
                    self.begin_start(true).await;
                }
                Phase::Starting | Phase::Running | Phase::BackingOff => {
                    let _ = reply.send(Err(ControlError::AlreadyActive));
                }
                Phase::Stopping | Phase::Evaluating => {
                    let _ = reply.send(Err(ControlError::TransientState));
                }
                Phase::Terminated => {
                    let _ = reply.send(Err(ControlError::Internal(
                        "supervisor terminated".to_string(),
                    )));
                }
            },

            Command::Stop { grace, reply } => match self.state.phase {
                Phase::Starting if self.restart_settling => {
                    // The restart this stop raced has already completed its
                    // stop half; the caller observes the settled answer.
                    let _ = reply.send(Err(ControlError::AlreadyStopped));
                }
                Phase::Running | Phase::Starting => {
                    self.stop_waiters.push(reply);
                    self.set_phase(Phase::Stopping);
                    if let Some(runner) = &self.runner {
                        runner.stop(grace);
                    }
                }
                Phase::Stopping => {
                    // Coalesce onto (or absorb into) the stop in flight.
                    self.stop_waiters.push(reply);
                }
                Phase::BackingOff => {
                    self.cancel_backoff();
                    self.state.next_restart_at = None;
                    self.state.consecutive_failures = 0;
                    self.set_phase(Phase::Stopped);
                    let _ = reply.send(Ok(()));
                }
                Phase::Idle | Phase::Stopped | Phase::Failed => {
                    let _ = reply.send(Err(ControlError::AlreadyStopped));
                }
                Phase::Evaluating | Phase::Terminated => {
                    let _ = reply.send(Err(ControlError::TransientState));
                }
            },

            Command::Restart { delay, reply } => match self.state.phase {
                Phase::Running | Phase::Starting => {
                    self.restart_pending = Some(RestartPending { delay, reply });
                    self.set_phase(Phase::Stopping);
                    if let Some(runner) = &self.runner {
                        runner.stop(self.deps.config.default_stop_grace());
                    }
                }
                Phase::Stopping => {
                    if self.restart_pending.is_none() {
                        self.restart_pending = Some(RestartPending { delay, reply });
                    } else {
                        let _ = reply.send(Err(ControlError::TransientState));
                    }
                }
                Phase::BackingOff => {
                    self.cancel_backoff();
                    let _ = reply.send(Ok(()));
                    self.start_after(delay).await;
                }
                Phase::Idle | Phase::Stopped | Phase::Failed => {
                    let _ = reply.send(Ok(()));
                    self.start_after(delay).await;
                }
                Phase::Evaluating | Phase::Terminated => {
                    let _ = reply.send(Err(ControlError::TransientState));
                }
            },

            Command::Fire { schedule_id } => {
                if self.state.phase.is_active() {
                    self.system_log(format!("schedule {schedule_id} fired while busy; skipped"));
                    self.publish(EventKind::SkippedConcurrent { schedule_id });
                } else {
                    self.publish(EventKind::ScheduleFired { schedule_id });
                    self.begin_start(true).await;
                }
            }

            Command::Describe { reply } => {
                let _ = reply.send(WorkloadDetail {
                    workload: self.workload.clone(),
                    runtime: self.state.clone(),
                });
            }

            Command::UpdateWorkload(workload) => {
                // Applies to the next spawn; the current run keeps the argv
                // it was started with.
                self.workload = *workload;
            }

            Command::UpdatePolicy(policy) => {
                self.policy = *policy;
            }

            Command::MarkLost { pid } => {
                self.system_log(format!(
                    "pid {pid} from a prior daemon generation is lost; not re-adopted"
                ));
                self.publish(EventKind::LostOnRecovery { pid });
                if self.policy.restart_on_lost {
                    self.begin_start(false).await;
                }
            }

            Command::Delete { reply } => {
                if let Some(runner) = &self.runner {
                    runner.stop(Duration::ZERO);
                }
                self.cancel_backoff();
                self.set_phase(Phase::Terminated);
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    async fn handle_runner_event(&mut self, event: RunnerEvent) {
        match event {
            RunnerEvent::Started { pid, at } => {
                self.restart_settling = false;
                self.state.pid = Some(pid);
                self.state.started_at = Some(at);
                if self.state.phase == Phase::Starting {
                    self.system_log(format!("started with pid {pid}"));
                    self.publish(EventKind::Started { pid });
                    self.set_phase(Phase::Running);
                }
                // In Stopping the start raced a stop; the exit will follow.
            }

            RunnerEvent::Exited { exit, at } => {
                let uptime = self
                    .state
                    .started_at
                    .and_then(|started| (at - started).to_std().ok());
                self.runner = None;
                self.state.pid = None;
                self.state.started_at = None;
                self.state.last_exit = Some(exit);
                self.system_log(format!("exited: {exit}"));
                self.publish(EventKind::Exited { exit });

                match self.state.phase {
                    Phase::Stopping => {
                        // User-initiated: settle without consulting policy.
                        self.state.consecutive_failures = 0;
                        self.set_phase(Phase::Stopped);
                        for waiter in self.stop_waiters.drain(..) {
                            let _ = waiter.send(Ok(()));
                        }
                        if let Some(pending) = self.restart_pending.take() {
                            let _ = pending.reply.send(Ok(()));
                            if pending.delay.map_or(true, |d| d.is_zero()) {
                                self.restart_settling = true;
                            }
                            self.start_after(pending.delay).await;
                        }
                    }
                    Phase::Running | Phase::Starting => {
                        self.evaluate(exit, uptime).await;
                    }
                    _ => {
                        warn!(
                            workload = %self.workload.name,
                            phase = self.state.phase.as_str(),
                            "unexpected exit event"
                        );
                    }
                }
            }

            RunnerEvent::Line {
                stream,
                line,
                truncated,
                at,
            } => {
                self.log_seq += 1;
                self.deps.gateway.append_log(LogRecord {
                    workload_id: self.workload.id,
                    seq: self.log_seq,
                    at,
                    stream,
                    line,
                    truncated,
                });
            }

            RunnerEvent::Sample(sample) => {
                self.deps.gateway.append_metric(sample);
            }

            RunnerEvent::StreamError { stream, message } => {
                warn!(
                    workload = %self.workload.name,
                    stream = stream.as_str(),
                    "output stream error: {message}"
                );
                self.system_log(format!("{} stream error: {message}", stream.as_str()));
            }
        }
    }

    async fn handle_timer(&mut self, fire: TimerFire) {
        // Stale fires from cancelled or superseded backoffs are ignored.
        if self.state.phase == Phase::BackingOff && fire.token == self.backoff_token {
            self.backoff_timer = None;
            self.state.next_restart_at = None;
            self.begin_start(false).await;
        }
    }

    /// Enters `Starting` and spawns. A spawn failure is evaluated exactly
    /// like a crash, with the synthetic spawn-failure exit.
    async fn begin_start(&mut self, manual: bool) {
        if manual && self.state.phase == Phase::Failed {
            // Manual reset out of Failed clears the streak.
            self.state.consecutive_failures = 0;
        }
        self.state.next_restart_at = None;
        self.set_phase(Phase::Starting);

        let spec = RunnerSpec {
            workload_id: self.workload.id,
            argv: self.workload.argv.clone(),
            cwd: self.workload.cwd.as_ref().map(PathBuf::from),
            env: self.workload.env.clone(),
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
            sample_interval: self.deps.config.metric_sample_interval(),
        };

        match self.deps.factory.spawn(spec, self.runner_tx.clone()).await {
            Ok(handle) => {
                self.runner = Some(handle);
            }
            Err(e) => {
                self.restart_settling = false;
                self.system_log(format!("spawn failed: {e}"));
                self.evaluate(ExitStatus::SpawnFailed, None).await;
            }
        }
    }

    /// Restart's second half, optionally delayed through `BackingOff`.
    async fn start_after(&mut self, delay: Option<Duration>) {
        match delay {
            Some(delay) if !delay.is_zero() => {
                self.state.next_restart_at =
                    Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
                self.schedule_backoff(delay);
                self.set_phase(Phase::BackingOff);
            }
            _ => self.begin_start(false).await,
        }
    }

    /// Policy evaluation on `Evaluating`, for exits the user did not ask for.
    async fn evaluate(&mut self, exit: ExitStatus, uptime: Option<Duration>) {
        self.set_phase(Phase::Evaluating);

        // A run that stayed up long enough was a successful Running entry;
        // the streak restarts from zero.
        if uptime.is_some_and(|u| u >= HEALTHY_UPTIME) {
            self.state.consecutive_failures = 0;
        }

        match policy::evaluate(&self.policy, exit, self.state.consecutive_failures) {
            RestartDecision::Stop => {
                if exit.is_success() {
                    self.state.consecutive_failures = 0;
                }
                self.set_phase(Phase::Stopped);
            }
            RestartDecision::Exhausted => {
                self.system_log(format!(
                    "retries exhausted after {} consecutive failures",
                    self.state.consecutive_failures
                ));
                self.set_phase(Phase::Failed);
            }
            RestartDecision::Retry { delay } => {
                self.state.consecutive_failures += 1;
                let attempt = self.state.consecutive_failures;
                self.state.next_restart_at =
                    Some(Utc::now() + chrono::Duration::from_std(delay).unwrap_or_default());
                self.schedule_backoff(delay);
                self.publish(EventKind::BackoffScheduled { delay, attempt });
                self.system_log(format!(
                    "restarting in {delay:?} (attempt {attempt})"
                ));
                self.set_phase(Phase::BackingOff);
            }
        }
    }

    fn schedule_backoff(&mut self, delay: Duration) {
        self.backoff_token += 1;
        let id =
            self.deps
                .timer
                .schedule_after(delay, self.backoff_token, self.timer_tx.clone());
        self.backoff_timer = Some(id);
    }

    fn cancel_backoff(&mut self) {
        if let Some(id) = self.backoff_timer.take() {
            self.deps.timer.cancel(id);
        }
        // Invalidate any fire already in flight.
        self.backoff_token += 1;
    }

    fn set_phase(&mut self, to: Phase) {
        let from = self.state.phase;
        if from == to {
            return;
        }
        self.state.phase = to;
        info!(
            workload = %self.workload.name,
            "phase {} -> {}",
            from.as_str(),
            to.as_str()
        );
        self.publish(EventKind::PhaseChanged { from, to });
        self.deps
            .gateway
            .update_runtime(self.workload.id, to, self.state.pid);
    }

    fn publish(&self, kind: EventKind) {
        self.deps
            .bus
            .publish(Event::for_workload(self.workload.id, kind));
    }

    fn system_log(&mut self, line: String) {
        self.log_seq += 1;
        self.deps.gateway.append_log(LogRecord {
            workload_id: self.workload.id,
            seq: self.log_seq,
            at: Utc::now(),
            stream: LogStream::System,
            line,
            truncated: false,
        });
    }
}
