//! Time-based scheduler: a single task owning a priority queue of
//! `(next_fire, schedule_id)` and dispatching `Fire` commands to the owning
//! supervisors. Fires are never queued; a busy workload reports
//! `SkippedConcurrent` instead.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::sync::{mpsc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::cron::CronExpr;
use crate::duration::parse_duration;
use crate::models::{Schedule, ScheduleKind};
use crate::store::{Store, StoreGateway};
use crate::supervisor::{Command, SupervisorHandle};

/// Routing table from workload id to its supervisor mailbox.
/// Read-shared here; mutated only by the coordinator.
pub type Registry = Arc<RwLock<HashMap<Uuid, SupervisorHandle>>>;

/// The scheduler wakes at least this often to re-read the wall clock, so
/// clock jumps and newly due entries are noticed promptly.
const MAX_SLEEP: Duration = Duration::from_secs(1);

enum SchedulerCmd {
    /// Insert or replace a schedule (also used for enable).
    Put(Box<Schedule>),
    Disable(Uuid),
    Delete(Uuid),
    DeleteWorkload(Uuid),
}

/// Cloneable handle over the scheduler task.
#[derive(Clone)]
pub struct SchedulerHandle {
    tx: mpsc::UnboundedSender<SchedulerCmd>,
    drift_ms: Arc<AtomicU64>,
    shutdown: CancellationToken,
}

impl SchedulerHandle {
    /// Spawns the scheduler task seeded with the given schedules.
    pub fn spawn<S: Store + 'static>(
        registry: Registry,
        gateway: StoreGateway<S>,
        tz: Tz,
        seed: Vec<Schedule>,
    ) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let drift_ms = Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();

        let actor = SchedulerActor {
            rx,
            registry,
            gateway,
            tz,
            drift_ms: drift_ms.clone(),
            shutdown: shutdown.clone(),
            entries: HashMap::new(),
            queue: BinaryHeap::new(),
            generation: 0,
        };
        tokio::spawn(actor.run(seed));

        Self {
            tx,
            drift_ms,
            shutdown,
        }
    }

    pub fn put(&self, schedule: Schedule) {
        let _ = self.tx.send(SchedulerCmd::Put(Box::new(schedule)));
    }

    pub fn disable(&self, id: Uuid) {
        let _ = self.tx.send(SchedulerCmd::Disable(id));
    }

    pub fn delete(&self, id: Uuid) {
        let _ = self.tx.send(SchedulerCmd::Delete(id));
    }

    pub fn delete_workload(&self, workload_id: Uuid) {
        let _ = self.tx.send(SchedulerCmd::DeleteWorkload(workload_id));
    }

    /// Last observed fire drift, for the health snapshot.
    pub fn drift_ms(&self) -> u64 {
        self.drift_ms.load(AtomicOrdering::Relaxed)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }
}

struct Entry {
    schedule: Schedule,
    generation: u64,
}

struct SchedulerActor<S> {
    rx: mpsc::UnboundedReceiver<SchedulerCmd>,
    registry: Registry,
    gateway: StoreGateway<S>,
    tz: Tz,
    drift_ms: Arc<AtomicU64>,
    shutdown: CancellationToken,
    entries: HashMap<Uuid, Entry>,
    queue: BinaryHeap<Reverse<(DateTime<Utc>, u64, Uuid)>>,
    generation: u64,
}

impl<S: Store + 'static> SchedulerActor<S> {
    async fn run(mut self, seed: Vec<Schedule>) {
        info!("scheduler started with {} schedule(s)", seed.len());
        for schedule in seed {
            self.insert(schedule);
        }

        loop {
            self.fire_due().await;

            let sleep_for = self
                .peek_deadline()
                .map(|at| {
                    (at - Utc::now())
                        .to_std()
                        .unwrap_or(Duration::ZERO)
                        .min(MAX_SLEEP)
                })
                .unwrap_or(MAX_SLEEP);

            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                cmd = self.rx.recv() => match cmd {
                    Some(cmd) => self.handle(cmd),
                    None => break,
                },
                _ = tokio::time::sleep(sleep_for) => {}
            }
        }
    }

    fn handle(&mut self, cmd: SchedulerCmd) {
        match cmd {
            SchedulerCmd::Put(schedule) => self.insert(*schedule),
            SchedulerCmd::Disable(id) => {
                if let Some(entry) = self.entries.get_mut(&id) {
                    entry.schedule.enabled = false;
                    entry.schedule.next_fire = None;
                    entry.generation = bump(&mut self.generation);
                }
            }
            SchedulerCmd::Delete(id) => {
                self.entries.remove(&id);
            }
            SchedulerCmd::DeleteWorkload(workload_id) => {
                self.entries
                    .retain(|_, e| e.schedule.workload_id != workload_id);
            }
        }
    }

    fn insert(&mut self, schedule: Schedule) {
        let generation = bump(&mut self.generation);
        if schedule.enabled {
            if let Some(next) = schedule.next_fire {
                self.queue.push(Reverse((next, generation, schedule.id)));
            }
        }
        self.entries.insert(schedule.id, Entry { schedule, generation });
    }

    /// Next valid deadline, discarding entries superseded by later puts.
    fn peek_deadline(&mut self) -> Option<DateTime<Utc>> {
        while let Some(Reverse((at, generation, id))) = self.queue.peek().copied() {
            let valid = self
                .entries
                .get(&id)
                .is_some_and(|e| e.generation == generation && e.schedule.enabled);
            if valid {
                return Some(at);
            }
            self.queue.pop();
        }
        None
    }

    async fn fire_due(&mut self) {
        loop {
            let now = Utc::now();
            let due = match self.peek_deadline() {
                Some(at) if at <= now => self.queue.pop(),
                _ => break,
            };
            let Some(Reverse((scheduled_at, _, id))) = due else {
                break;
            };
            self.fire(id, scheduled_at, now).await;
        }
    }

    async fn fire(&mut self, id: Uuid, scheduled_at: DateTime<Utc>, now: DateTime<Utc>) {
        let Some(entry) = self.entries.get_mut(&id) else {
            return;
        };
        let schedule = &mut entry.schedule;

        let drift = (now - scheduled_at).num_milliseconds().max(0) as u64;
        self.drift_ms.store(drift, AtomicOrdering::Relaxed);

        if let Some(handle) = self.registry.read().await.get(&schedule.workload_id) {
            if handle.send(Command::Fire { schedule_id: id }).is_err() {
                warn!(schedule = %id, "fire dropped; supervisor gone");
            }
        } else {
            warn!(schedule = %id, "fire dropped; workload not registered");
        }

        schedule.last_fire = Some(now);
        schedule.next_fire = match schedule.kind {
            ScheduleKind::Once => {
                // One-shots disable themselves after firing.
                schedule.enabled = false;
                None
            }
            _ => match next_fire_after(schedule, self.tz, scheduled_at, now) {
                Ok(next) => next,
                Err(e) => {
                    error!(schedule = %id, "cannot compute next fire: {e}");
                    schedule.enabled = false;
                    None
                }
            },
        };

        if schedule.enabled {
            if let Some(next) = schedule.next_fire {
                entry.generation = bump(&mut self.generation);
                self.queue.push(Reverse((next, entry.generation, id)));
            }
        }

        let (last, next, enabled) = (
            entry.schedule.last_fire,
            entry.schedule.next_fire,
            entry.schedule.enabled,
        );
        if let Err(e) = self
            .gateway
            .update_schedule_fire_times(id, last, next, enabled)
            .await
        {
            // Fire times are advisory; losing one write never stops firing.
            warn!(schedule = %id, "failed to persist fire times: {e}");
        }
    }
}

fn bump(generation: &mut u64) -> u64 {
    *generation += 1;
    *generation
}

/// Initial next-fire for a schedule being put or enabled at `now`.
pub fn initial_next_fire(
    kind: ScheduleKind,
    expression: &str,
    tz: Tz,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, String> {
    match kind {
        ScheduleKind::Cron => {
            let expr = CronExpr::parse(expression)?;
            Ok(expr.next_after(now, tz))
        }
        ScheduleKind::Interval => {
            let interval = parse_duration(expression)?;
            if interval.is_zero() {
                return Err("interval must be positive".to_string());
            }
            Ok(Some(
                now + chrono::Duration::from_std(interval).map_err(|e| e.to_string())?,
            ))
        }
        ScheduleKind::Once => {
            let at = DateTime::parse_from_rfc3339(expression)
                .map_err(|e| format!("not an RFC 3339 instant: {e}"))?
                .with_timezone(&Utc);
            Ok(Some(at))
        }
    }
}

/// Next fire after one at `scheduled_at` was dispatched at `now`.
///
/// Intervals advance from the scheduled instant; when backlog or a clock
/// jump left that in the past, one fire has already happened and the next
/// anchors to `now` (no burst catch-up).
fn next_fire_after(
    schedule: &Schedule,
    tz: Tz,
    scheduled_at: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<Option<DateTime<Utc>>, String> {
    match schedule.kind {
        ScheduleKind::Cron => {
            let expr = CronExpr::parse(&schedule.expression)?;
            Ok(expr.next_after(now, tz))
        }
        ScheduleKind::Interval => {
            let interval = parse_duration(&schedule.expression)?;
            let step = chrono::Duration::from_std(interval).map_err(|e| e.to_string())?;
            let from_schedule = scheduled_at + step;
            Ok(Some(if from_schedule > now {
                from_schedule
            } else {
                now + step
            }))
        }
        ScheduleKind::Once => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn schedule(kind: ScheduleKind, expression: &str) -> Schedule {
        let now = Utc::now();
        Schedule {
            id: Uuid::new_v4(),
            workload_id: Uuid::new_v4(),
            kind,
            expression: expression.to_string(),
            enabled: true,
            last_fire: None,
            next_fire: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_initial_next_fire_interval_anchors_to_now() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        let next = initial_next_fire(ScheduleKind::Interval, "2s", Tz::UTC, now)
            .unwrap()
            .unwrap();
        assert_eq!(next, now + chrono::Duration::seconds(2));
    }

    #[test]
    fn test_initial_next_fire_rejects_bad_expressions() {
        let now = Utc::now();
        assert!(initial_next_fire(ScheduleKind::Interval, "soon", Tz::UTC, now).is_err());
        assert!(initial_next_fire(ScheduleKind::Interval, "0s", Tz::UTC, now).is_err());
        assert!(initial_next_fire(ScheduleKind::Cron, "* * *", Tz::UTC, now).is_err());
        assert!(initial_next_fire(ScheduleKind::Once, "tomorrow", Tz::UTC, now).is_err());
    }

    #[test]
    fn test_interval_advances_from_scheduled_instant() {
        let s = schedule(ScheduleKind::Interval, "10s");
        let scheduled = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        // Dispatched promptly: next is schedule-anchored.
        let now = scheduled + chrono::Duration::milliseconds(50);
        let next = next_fire_after(&s, Tz::UTC, scheduled, now).unwrap().unwrap();
        assert_eq!(next, scheduled + chrono::Duration::seconds(10));
    }

    #[test]
    fn test_interval_backlog_fires_once_and_reanchors() {
        let s = schedule(ScheduleKind::Interval, "10s");
        let scheduled = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        // The daemon was stalled for a minute: no burst, anchor to now.
        let now = scheduled + chrono::Duration::seconds(60);
        let next = next_fire_after(&s, Tz::UTC, scheduled, now).unwrap().unwrap();
        assert_eq!(next, now + chrono::Duration::seconds(10));
    }

    #[test]
    fn test_once_has_no_next() {
        let s = schedule(ScheduleKind::Once, "2030-01-01T00:00:00Z");
        let scheduled = Utc.with_ymd_and_hms(2030, 1, 1, 0, 0, 0).unwrap();
        let next = next_fire_after(&s, Tz::UTC, scheduled, scheduled).unwrap();
        assert!(next.is_none());
    }
}
