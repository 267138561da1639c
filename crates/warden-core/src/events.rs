//! Runtime events emitted by supervisors, the scheduler, and the
//! persistence pipeline, fanned out to subscribers over a broadcast bus.
//!
//! Each event carries a globally unique, monotonically increasing sequence
//! number so consumers can order events that crossed async boundaries.
//! Subscribers read from bounded queues; a subscriber that falls behind is
//! lagged (its receiver reports how many events it missed) and the emitter
//! never blocks.

use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::models::{ExitStatus, Phase};

static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventKind {
    /// A supervisor moved between phases.
    PhaseChanged { from: Phase, to: Phase },
    /// A spawn produced a live OS process.
    Started { pid: u32 },
    /// The current run ended.
    Exited { exit: ExitStatus },
    /// A retry was scheduled after a failure.
    BackoffScheduled {
        #[serde(with = "crate::duration::serde_duration")]
        delay: Duration,
        attempt: u32,
    },
    /// A schedule fired and the workload was started.
    ScheduleFired { schedule_id: Uuid },
    /// A schedule fired while the workload was active; the fire was dropped.
    SkippedConcurrent { schedule_id: Uuid },
    /// A pid recorded by a prior daemon generation could not be re-adopted.
    LostOnRecovery { pid: u32 },
    /// In-memory log backpressure dropped the oldest records.
    LogDropped { count: u64 },
    /// The runtime-event outbox overflowed; liveness won over durability.
    PersistenceDropped { count: u64 },
    /// The store flush pipeline is behind (or has recovered).
    PersistenceLag { lagging: bool },
    /// Daemon shutdown was requested.
    ShutdownRequested,
}

/// A single runtime event with ordering metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    pub at: DateTime<Utc>,
    /// The workload this event concerns, when there is one.
    pub workload: Option<Uuid>,
    pub kind: EventKind,
}

impl Event {
    pub fn now(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: Utc::now(),
            workload: None,
            kind,
        }
    }

    pub fn for_workload(workload: Uuid, kind: EventKind) -> Self {
        Self {
            workload: Some(workload),
            ..Self::now(kind)
        }
    }
}

/// Broadcast channel for runtime events.
///
/// Publishing never blocks; slow subscribers observe a lag error on their
/// receiver with the number of missed events.
#[derive(Clone)]
pub struct Bus {
    tx: broadcast::Sender<Event>,
}

impl Bus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publishes an event to all subscribers. A bus without subscribers
    /// silently drops the event.
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }
}
