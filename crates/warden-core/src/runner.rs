//! Contract between a supervisor and the thing that runs one OS process.
//!
//! The concrete implementation lives in the runner crate; supervisors only
//! see a factory producing handles plus an event stream. Tests substitute a
//! scripted factory.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::SpawnError;
use crate::models::{ExitStatus, LogStream, MetricSample};

/// Default cap on a single captured output line.
pub const DEFAULT_MAX_LINE_BYTES: usize = 64 * 1024;

/// Everything needed to spawn one process for a workload.
#[derive(Debug, Clone)]
pub struct RunnerSpec {
    pub workload_id: Uuid,
    /// Program plus arguments; never empty.
    pub argv: Vec<String>,
    pub cwd: Option<PathBuf>,
    /// Overlay on top of the parent environment.
    pub env: BTreeMap<String, String>,
    pub max_line_bytes: usize,
    pub sample_interval: Duration,
}

/// Signals a supervisor may forward to the process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalKind {
    Term,
    Kill,
    Int,
    Hup,
}

/// Events produced for a single spawn.
///
/// A successful spawn yields exactly one `Started` and, eventually, exactly
/// one `Exited` (never both missing, never duplicated). Lines and samples
/// arrive in between.
#[derive(Debug, Clone)]
pub enum RunnerEvent {
    Started {
        pid: u32,
        at: DateTime<Utc>,
    },
    Exited {
        exit: ExitStatus,
        at: DateTime<Utc>,
    },
    Line {
        stream: LogStream,
        line: String,
        truncated: bool,
        at: DateTime<Utc>,
    },
    Sample(MetricSample),
    /// A pipe closed unexpectedly. Logged, not fatal: the exit still comes.
    StreamError {
        stream: LogStream,
        message: String,
    },
}

/// Control surface over one live OS process.
///
/// Both calls only dispatch; completion is observed through the event
/// stream (the `Exited` event). Dropping the handle never leaks the child:
/// the implementation ties the final wait to its own drain task.
pub trait ProcessHandle: Send + Sync {
    fn pid(&self) -> u32;

    /// Forwards a signal to the process group.
    fn signal(&self, kind: SignalKind);

    /// Graceful termination: TERM the group, wait up to `grace`, then KILL.
    fn stop(&self, grace: Duration);
}

/// Spawns processes. One factory serves every supervisor.
#[async_trait]
pub trait RunnerFactory: Send + Sync {
    async fn spawn(
        &self,
        spec: RunnerSpec,
        events: mpsc::UnboundedSender<RunnerEvent>,
    ) -> Result<Box<dyn ProcessHandle>, SpawnError>;
}
