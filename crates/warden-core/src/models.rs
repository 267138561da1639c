// Declared and runtime models for the supervisor core.
// Declared aggregates (Workload, RestartPolicy, Schedule) persist across
// daemon restarts; RuntimeState is volatile and rebuilt by recovery.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::duration::serde_duration;
use crate::error::ControlError;

/// Lifecycle phase of a workload, as driven by its supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Starting,
    Running,
    Stopping,
    Evaluating,
    BackingOff,
    Stopped,
    Failed,
    Terminated,
}

impl Phase {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "idle" => Some(Self::Idle),
            "starting" => Some(Self::Starting),
            "running" => Some(Self::Running),
            "stopping" => Some(Self::Stopping),
            "evaluating" => Some(Self::Evaluating),
            "backing_off" => Some(Self::BackingOff),
            "stopped" => Some(Self::Stopped),
            "failed" => Some(Self::Failed),
            "terminated" => Some(Self::Terminated),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
            Self::Evaluating => "evaluating",
            Self::BackingOff => "backing_off",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
            Self::Terminated => "terminated",
        }
    }

    /// A workload in an active phase owns (or is about to own) an OS process;
    /// schedule fires are skipped while active.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            Self::Starting | Self::Running | Self::Stopping | Self::BackingOff
        )
    }
}

/// How a run ended.
///
/// `SpawnFailed` is the synthetic outcome for a spawn that never produced an
/// OS process; it is distinct from every real exit code and from every
/// signal, so policy evaluation can treat it uniformly as a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ExitStatus {
    Code(i32),
    Signal(i32),
    SpawnFailed,
}

impl ExitStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, ExitStatus::Code(0))
    }
}

impl std::fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExitStatus::Code(c) => write!(f, "exit code {c}"),
            ExitStatus::Signal(s) => write!(f, "signal {s}"),
            ExitStatus::SpawnFailed => write!(f, "spawn failure"),
        }
    }
}

/// A declared command and its execution context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Workload {
    pub id: Uuid,
    pub name: String,
    /// Program plus ordered arguments; never empty.
    pub argv: Vec<String>,
    pub cwd: Option<String>,
    /// Environment overlay: per-key override of the parent environment.
    pub env: BTreeMap<String, String>,
    pub group: Option<String>,
    /// Name of the restart policy governing this workload.
    pub policy: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Workload {
    pub fn validate(&self) -> Result<(), ControlError> {
        if self.name.trim().is_empty() {
            return Err(ControlError::InvalidField {
                field: "name".to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        match self.argv.first() {
            None => Err(ControlError::InvalidArgv("argv must not be empty".to_string())),
            Some(program) if program.trim().is_empty() => Err(ControlError::InvalidArgv(
                "argv[0] must name a program".to_string(),
            )),
            Some(_) => Ok(()),
        }
    }
}

/// Live facet of a workload. Volatile; reset to `Idle` on daemon restart.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeState {
    pub phase: Phase,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub last_exit: Option<ExitStatus>,
    pub consecutive_failures: u32,
    pub next_restart_at: Option<DateTime<Utc>>,
}

impl Default for RuntimeState {
    fn default() -> Self {
        Self {
            phase: Phase::Idle,
            pid: None,
            started_at: None,
            last_exit: None,
            consecutive_failures: 0,
            next_restart_at: None,
        }
    }
}

/// Named, reusable restart policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestartPolicy {
    pub name: String,
    /// `None` means unbounded retries.
    pub max_retries: Option<u32>,
    #[serde(with = "serde_duration")]
    pub initial_delay: Duration,
    /// Backoff growth factor, finite and >= 1.0.
    pub multiplier: f64,
    #[serde(with = "serde_duration")]
    pub max_delay: Duration,
    /// Exit codes that trigger a restart; empty means "any non-zero".
    pub restart_on_exit_codes: BTreeSet<i32>,
    /// Whether a clean exit (code 0) is also a retry candidate.
    pub restart_on_success: bool,
    /// Whether a workload lost across a daemon restart is started again.
    pub restart_on_lost: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RestartPolicy {
    pub fn named(name: &str) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            max_retries: Some(3),
            initial_delay: Duration::from_secs(5),
            multiplier: 1.5,
            max_delay: Duration::from_secs(300),
            restart_on_exit_codes: BTreeSet::new(),
            restart_on_success: false,
            restart_on_lost: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn validate(&self) -> Result<(), ControlError> {
        if self.name.trim().is_empty() {
            return Err(ControlError::InvalidPolicy("name must not be empty".to_string()));
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ControlError::InvalidPolicy(format!(
                "multiplier must be finite and >= 1.0, got {}",
                self.multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(ControlError::InvalidPolicy(
                "initial_delay must not exceed max_delay".to_string(),
            ));
        }
        Ok(())
    }

    /// The policies seeded at `init`; these cannot be deleted.
    pub fn builtins() -> Vec<RestartPolicy> {
        let now = Utc::now();
        let base = |name: &str,
                    max_retries: Option<u32>,
                    initial: u64,
                    multiplier: f64,
                    max: u64| RestartPolicy {
            name: name.to_string(),
            max_retries,
            initial_delay: Duration::from_secs(initial),
            multiplier,
            max_delay: Duration::from_secs(max),
            restart_on_exit_codes: BTreeSet::new(),
            restart_on_success: false,
            restart_on_lost: false,
            created_at: now,
            updated_at: now,
        };
        vec![
            base("none", Some(0), 0, 1.0, 0),
            base("standard", Some(3), 5, 1.5, 300),
            base("aggressive", Some(10), 1, 2.0, 60),
            base("conservative", Some(5), 30, 1.2, 600),
        ]
    }

    pub fn is_builtin(name: &str) -> bool {
        matches!(name, "none" | "standard" | "aggressive" | "conservative")
    }
}

/// Schedule kinds supported by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleKind {
    Cron,
    Interval,
    Once,
}

impl ScheduleKind {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "cron" => Some(Self::Cron),
            "interval" => Some(Self::Interval),
            "once" => Some(Self::Once),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cron => "cron",
            Self::Interval => "interval",
            Self::Once => "once",
        }
    }
}

/// A time-based trigger attached to a workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schedule {
    pub id: Uuid,
    pub workload_id: Uuid,
    pub kind: ScheduleKind,
    /// Five-field cron string, wire duration, or RFC 3339 instant,
    /// depending on `kind`.
    pub expression: String,
    pub enabled: bool,
    pub last_fire: Option<DateTime<Utc>>,
    pub next_fire: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Which stream a log record came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogStream {
    Stdout,
    Stderr,
    /// Supervisor-generated lifecycle records.
    System,
}

impl LogStream {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "stdout" => Some(Self::Stdout),
            "stderr" => Some(Self::Stderr),
            "system" => Some(Self::System),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stdout => "stdout",
            Self::Stderr => "stderr",
            Self::System => "system",
        }
    }
}

/// Marker appended to the display form of a truncated log line.
pub const TRUNCATED_MARKER: &str = "[TRUNCATED]";

/// Append-only log record; `seq` is per-workload, strictly increasing and
/// contiguous except across explicit truncation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    pub workload_id: Uuid,
    pub seq: i64,
    pub at: DateTime<Utc>,
    pub stream: LogStream,
    pub line: String,
    pub truncated: bool,
}

impl LogRecord {
    /// The line as shown to humans, with the truncation marker when needed.
    pub fn display_line(&self) -> String {
        if self.truncated {
            format!("{} {}", self.line, TRUNCATED_MARKER)
        } else {
            self.line.clone()
        }
    }
}

/// Append-only resource sample taken while a workload runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSample {
    pub workload_id: Uuid,
    pub at: DateTime<Utc>,
    /// Fraction of one core (0.0..=N for N cores).
    pub cpu: f64,
    pub rss_bytes: u64,
    pub threads: u32,
}

/// One row of `list_workloads`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSummary {
    pub id: Uuid,
    pub name: String,
    pub phase: Phase,
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
}

/// Full `describe` answer: declared intent plus the live facet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadDetail {
    pub workload: Workload,
    pub runtime: RuntimeState,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_round_trips_and_activity() {
        for phase in [
            Phase::Idle,
            Phase::Starting,
            Phase::Running,
            Phase::Stopping,
            Phase::Evaluating,
            Phase::BackingOff,
            Phase::Stopped,
            Phase::Failed,
            Phase::Terminated,
        ] {
            assert_eq!(Phase::parse(phase.as_str()), Some(phase));
        }
        assert!(Phase::Running.is_active());
        assert!(Phase::BackingOff.is_active());
        assert!(!Phase::Stopped.is_active());
        assert!(!Phase::Failed.is_active());
    }

    #[test]
    fn test_exit_status_success_classification() {
        assert!(ExitStatus::Code(0).is_success());
        assert!(!ExitStatus::Code(1).is_success());
        assert!(!ExitStatus::Signal(15).is_success());
        assert!(!ExitStatus::SpawnFailed.is_success());
    }

    #[test]
    fn test_workload_validation() {
        let mut w = Workload {
            id: Uuid::new_v4(),
            name: "echo1".to_string(),
            argv: vec!["/bin/echo".to_string(), "hi".to_string()],
            cwd: None,
            env: BTreeMap::new(),
            group: None,
            policy: "none".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        assert!(w.validate().is_ok());

        w.argv.clear();
        assert!(matches!(w.validate(), Err(ControlError::InvalidArgv(_))));

        w.argv = vec!["  ".to_string()];
        assert!(matches!(w.validate(), Err(ControlError::InvalidArgv(_))));
    }

    #[test]
    fn test_policy_validation_bounds() {
        let mut p = RestartPolicy::named("p");
        assert!(p.validate().is_ok());

        p.multiplier = 0.5;
        assert!(p.validate().is_err());

        p.multiplier = f64::INFINITY;
        assert!(p.validate().is_err());

        p.multiplier = 2.0;
        p.initial_delay = Duration::from_secs(20);
        p.max_delay = Duration::from_secs(10);
        assert!(p.validate().is_err());
    }

    #[test]
    fn test_builtin_policies_are_seeded_and_guarded() {
        let builtins = RestartPolicy::builtins();
        assert_eq!(builtins.len(), 4);
        for p in &builtins {
            assert!(RestartPolicy::is_builtin(&p.name));
            p.validate().expect("builtins validate");
        }
        let none = builtins.iter().find(|p| p.name == "none").unwrap();
        assert_eq!(none.max_retries, Some(0));
        assert!(!RestartPolicy::is_builtin("mine"));
    }

    #[test]
    fn test_truncated_log_display_carries_marker() {
        let record = LogRecord {
            workload_id: Uuid::new_v4(),
            seq: 1,
            at: Utc::now(),
            stream: LogStream::Stdout,
            line: "partial".to_string(),
            truncated: true,
        };
        assert!(record.display_line().ends_with(TRUNCATED_MARKER));
    }
}
