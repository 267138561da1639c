//! OS process runner: spawns one child per call in its own process group,
//! drains both output streams line by line, forwards signals to the group,
//! samples resource usage while alive, and guarantees exactly one `Started`
//! and one `Exited` event per successful spawn.
//!
//! The final `wait` is owned by the supervise task, not the handle, so the
//! child is always reaped even if the owning supervisor goes away.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::BufReader;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use warden_core::error::SpawnError;
use warden_core::models::{ExitStatus, LogStream};
use warden_core::runner::{
    ProcessHandle, RunnerEvent, RunnerFactory, RunnerSpec, SignalKind,
};

use crate::lines::LineReader;
use crate::sampler;

pub struct OsRunnerFactory;

#[async_trait]
impl RunnerFactory for OsRunnerFactory {
    async fn spawn(
        &self,
        spec: RunnerSpec,
        events: mpsc::UnboundedSender<RunnerEvent>,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError> {
        let (program, args) = spec
            .argv
            .split_first()
            .ok_or_else(|| SpawnError::Io("empty argv".to_string()))?;

        if let Some(cwd) = &spec.cwd {
            if !cwd.is_dir() {
                return Err(SpawnError::InvalidWorkingDir(cwd.clone()));
            }
        }

        let mut command = Command::new(program);
        command
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            // Own process group, so signals reach descendants too.
            .process_group(0);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }
        // Overlay semantics: the child inherits the parent environment with
        // per-key overrides, never a scrubbed one.
        for (key, value) in &spec.env {
            command.env(key, value);
        }

        let mut child = command
            .spawn()
            .map_err(|e| map_spawn_error(e, program))?;
        let pid = child
            .id()
            .ok_or_else(|| SpawnError::Io("child exited before pid was read".to_string()))?;

        let _ = events.send(RunnerEvent::Started {
            pid,
            at: Utc::now(),
        });

        let mut drainers = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            drainers.push(spawn_drainer(
                BufReader::new(stdout),
                LogStream::Stdout,
                spec.max_line_bytes,
                events.clone(),
            ));
        }
        if let Some(stderr) = child.stderr.take() {
            drainers.push(spawn_drainer(
                BufReader::new(stderr),
                LogStream::Stderr,
                spec.max_line_bytes,
                events.clone(),
            ));
        }

        let sampler_token = CancellationToken::new();
        tokio::spawn(sampler::sample_loop(
            spec.workload_id,
            pid,
            spec.sample_interval,
            events.clone(),
            sampler_token.clone(),
        ));

        let (ctl_tx, ctl_rx) = mpsc::unbounded_channel();
        tokio::spawn(supervise(child, pid, ctl_rx, drainers, sampler_token, events));

        Ok(Box::new(OsProcessHandle { pid, ctl: ctl_tx }))
    }
}

enum Ctl {
    Signal(SignalKind),
    Stop { grace: Duration },
}

struct OsProcessHandle {
    pid: u32,
    ctl: mpsc::UnboundedSender<Ctl>,
}

impl ProcessHandle for OsProcessHandle {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn signal(&self, kind: SignalKind) {
        let _ = self.ctl.send(Ctl::Signal(kind));
    }

    fn stop(&self, grace: Duration) {
        let _ = self.ctl.send(Ctl::Stop { grace });
    }
}

/// Owns the child until it exits: answers control messages, then reaps,
/// waits for the drainers, and emits the single `Exited` event.
async fn supervise(
    mut child: Child,
    pid: u32,
    mut ctl: mpsc::UnboundedReceiver<Ctl>,
    drainers: Vec<JoinHandle<()>>,
    sampler_token: CancellationToken,
    events: mpsc::UnboundedSender<RunnerEvent>,
) {
    let exit = loop {
        tokio::select! {
            status = child.wait() => break map_wait(status),
            msg = ctl.recv() => match msg {
                Some(Ctl::Signal(kind)) => send_group_signal(pid, map_signal(kind)),
                Some(Ctl::Stop { grace }) => {
                    send_group_signal(pid, Signal::SIGTERM);
                    match timeout(grace, child.wait()).await {
                        Ok(status) => break map_wait(status),
                        Err(_) => {
                            send_group_signal(pid, Signal::SIGKILL);
                            break map_wait(child.wait().await);
                        }
                    }
                }
                // Handle dropped; keep waiting so the child is reaped.
                None => break map_wait(child.wait().await),
            }
        }
    };

    sampler_token.cancel();
    for drainer in drainers {
        let _ = drainer.await;
    }
    let _ = events.send(RunnerEvent::Exited {
        exit,
        at: Utc::now(),
    });
}

fn spawn_drainer<R>(
    reader: R,
    stream: LogStream,
    max_line_bytes: usize,
    events: mpsc::UnboundedSender<RunnerEvent>,
) -> JoinHandle<()>
where
    R: tokio::io::AsyncBufRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = LineReader::new(reader, max_line_bytes);
        loop {
            match lines.next_line().await {
                Ok(Some((line, truncated))) => {
                    let _ = events.send(RunnerEvent::Line {
                        stream,
                        line,
                        truncated,
                        at: Utc::now(),
                    });
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = events.send(RunnerEvent::StreamError {
                        stream,
                        message: e.to_string(),
                    });
                    break;
                }
            }
        }
    })
}

fn send_group_signal(pid: u32, signal: Signal) {
    if let Err(e) = killpg(Pid::from_raw(pid as i32), signal) {
        // ESRCH just means the group is already gone.
        if e != nix::errno::Errno::ESRCH {
            warn!(pid, "failed to signal process group: {e}");
        }
    }
}

fn map_signal(kind: SignalKind) -> Signal {
    match kind {
        SignalKind::Term => Signal::SIGTERM,
        SignalKind::Kill => Signal::SIGKILL,
        SignalKind::Int => Signal::SIGINT,
        SignalKind::Hup => Signal::SIGHUP,
    }
}

fn map_wait(status: std::io::Result<std::process::ExitStatus>) -> ExitStatus {
    match status {
        Ok(status) => {
            if let Some(code) = status.code() {
                ExitStatus::Code(code)
            } else {
                use std::os::unix::process::ExitStatusExt;
                status
                    .signal()
                    .map(ExitStatus::Signal)
                    .unwrap_or(ExitStatus::Code(-1))
            }
        }
        Err(e) => {
            warn!("wait failed: {e}");
            ExitStatus::Code(-1)
        }
    }
}

fn map_spawn_error(e: std::io::Error, program: &str) -> SpawnError {
    match e.kind() {
        std::io::ErrorKind::NotFound => SpawnError::ExecutableNotFound(program.to_string()),
        std::io::ErrorKind::PermissionDenied => {
            SpawnError::PermissionDenied(program.to_string())
        }
        _ => SpawnError::Io(e.to_string()),
    }
}
