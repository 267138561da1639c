//! Durable store contract and the gateway that owns the writer handle.
//!
//! Declared-state mutations go through synchronously and fail the calling
//! command when the store is down. Log/metric appends and runtime-phase
//! updates are batched through a bounded in-memory pipeline: flushed every
//! `log_flush_interval_ms` or `log_flush_batch` rows, retried with
//! exponential backoff, surfaced as a `persistence_lag` health signal after
//! three consecutive flush failures. The pipeline never blocks a producer;
//! overflow drops the oldest records and reports how many.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::mpsc;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};
use uuid::Uuid;

use crate::config::DaemonConfig;
use crate::error::ControlError;
use crate::events::{Bus, Event, EventKind};
use crate::models::{
    LogRecord, LogStream, MetricSample, Phase, RestartPolicy, Schedule, Workload,
};

/// Log query filter for `query_logs`.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub since: Option<DateTime<Utc>>,
    pub until: Option<DateTime<Utc>>,
    pub stream: Option<LogStream>,
    /// Substring match on the payload.
    pub grep: Option<String>,
    /// Return only the last N matching records.
    pub tail: Option<u32>,
}

/// Cutoff selector for per-workload truncation.
#[derive(Debug, Clone, Copy)]
pub enum PurgeCutoff {
    Timestamp(DateTime<Utc>),
    Sequence(i64),
}

/// Transactional persistence of declared state and append-only
/// logs/metrics. Multi-row mutations are atomic; concurrent writers to the
/// same aggregate are serialized by the backend.
#[async_trait]
pub trait Store: Send + Sync {
    async fn run_migrations(&self) -> anyhow::Result<()>;

    // Workloads
    async fn upsert_workload(&self, workload: &Workload) -> anyhow::Result<()>;
    async fn update_workload_runtime(
        &self,
        id: Uuid,
        phase: Phase,
        pid: Option<u32>,
    ) -> anyhow::Result<()>;
    async fn delete_workload(&self, id: Uuid) -> anyhow::Result<()>;
    async fn load_workloads(&self) -> anyhow::Result<Vec<Workload>>;
    /// Last persisted phase/pid per workload, for recovery.
    async fn load_workload_runtime(&self)
        -> anyhow::Result<HashMap<Uuid, (Phase, Option<u32>)>>;

    // Policies
    async fn put_policy(&self, policy: &RestartPolicy) -> anyhow::Result<()>;
    async fn delete_policy(&self, name: &str) -> anyhow::Result<()>;
    async fn load_policies(&self) -> anyhow::Result<Vec<RestartPolicy>>;

    // Schedules
    async fn put_schedule(&self, schedule: &Schedule) -> anyhow::Result<()>;
    async fn delete_schedule(&self, id: Uuid) -> anyhow::Result<()>;
    async fn load_schedules(&self) -> anyhow::Result<Vec<Schedule>>;
    async fn update_schedule_fire_times(
        &self,
        id: Uuid,
        last_fire: Option<DateTime<Utc>>,
        next_fire: Option<DateTime<Utc>>,
        enabled: bool,
    ) -> anyhow::Result<()>;

    // Logs and metrics
    async fn append_logs(&self, batch: &[LogRecord]) -> anyhow::Result<()>;
    async fn append_metrics(&self, batch: &[MetricSample]) -> anyhow::Result<()>;
    async fn query_logs(
        &self,
        workload: Uuid,
        filter: &LogFilter,
    ) -> anyhow::Result<Vec<LogRecord>>;
    async fn query_metrics(
        &self,
        workload: Uuid,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<MetricSample>>;
    /// Highest assigned log sequence for a workload, or 0 when none.
    async fn max_log_seq(&self, workload: Uuid) -> anyhow::Result<i64>;

    // Retention
    async fn purge_workload_before(
        &self,
        workload: Uuid,
        cutoff: PurgeCutoff,
    ) -> anyhow::Result<u64>;
    async fn purge_all_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64>;
    /// Trims every workload's logs/metrics down to `max_records`.
    async fn trim_to_cap(&self, max_records: i64) -> anyhow::Result<u64>;
}

enum AppendMsg {
    Log(LogRecord),
    Metric(MetricSample),
    Runtime {
        workload: Uuid,
        phase: Phase,
        pid: Option<u32>,
    },
}

/// The single writer handle over a [`Store`].
pub struct StoreGateway<S> {
    store: Arc<S>,
    append_tx: mpsc::UnboundedSender<AppendMsg>,
    lag: Arc<AtomicBool>,
    shutdown: CancellationToken,
}

impl<S> Clone for StoreGateway<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            append_tx: self.append_tx.clone(),
            lag: self.lag.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S: Store + 'static> StoreGateway<S> {
    /// Creates the gateway and spawns its flusher and retention tasks.
    pub fn spawn(store: Arc<S>, config: &DaemonConfig, bus: Bus) -> Self {
        let (append_tx, append_rx) = mpsc::unbounded_channel();
        let lag = Arc::new(AtomicBool::new(false));
        let shutdown = CancellationToken::new();

        let flusher = Flusher {
            store: store.clone(),
            bus,
            rx: append_rx,
            flush_batch: config.log_flush_batch,
            flush_interval: config.log_flush_interval(),
            queue_max: config.log_queue_max,
            lag: lag.clone(),
            shutdown: shutdown.clone(),
            logs: HashMap::new(),
            metrics: VecDeque::new(),
            runtime: HashMap::new(),
            runtime_order: VecDeque::new(),
            pending_logs: 0,
        };
        tokio::spawn(flusher.run());

        let retention = Retention {
            store: store.clone(),
            max_age: config.retention_max_age,
            max_records: config.retention_max_records,
            shutdown: shutdown.clone(),
        };
        tokio::spawn(retention.run());

        Self {
            store,
            append_tx,
            lag,
            shutdown,
        }
    }

    /// Direct read access for queries and recovery loads.
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Whether the flush pipeline is currently behind.
    pub fn persistence_lag(&self) -> bool {
        self.lag.load(AtomicOrdering::Relaxed)
    }

    /// Flushes what remains and stops the background tasks.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    // Declared-state mutations: synchronous, store failures fail the caller.

    pub async fn upsert_workload(&self, workload: &Workload) -> Result<(), ControlError> {
        self.store
            .upsert_workload(workload)
            .await
            .map_err(ControlError::store)
    }

    pub async fn delete_workload(&self, id: Uuid) -> Result<(), ControlError> {
        self.store
            .delete_workload(id)
            .await
            .map_err(ControlError::store)
    }

    pub async fn put_policy(&self, policy: &RestartPolicy) -> Result<(), ControlError> {
        self.store
            .put_policy(policy)
            .await
            .map_err(ControlError::store)
    }

    pub async fn delete_policy(&self, name: &str) -> Result<(), ControlError> {
        self.store
            .delete_policy(name)
            .await
            .map_err(ControlError::store)
    }

    pub async fn put_schedule(&self, schedule: &Schedule) -> Result<(), ControlError> {
        self.store
            .put_schedule(schedule)
            .await
            .map_err(ControlError::store)
    }

    pub async fn delete_schedule(&self, id: Uuid) -> Result<(), ControlError> {
        self.store
            .delete_schedule(id)
            .await
            .map_err(ControlError::store)
    }

    pub async fn update_schedule_fire_times(
        &self,
        id: Uuid,
        last_fire: Option<DateTime<Utc>>,
        next_fire: Option<DateTime<Utc>>,
        enabled: bool,
    ) -> Result<(), ControlError> {
        self.store
            .update_schedule_fire_times(id, last_fire, next_fire, enabled)
            .await
            .map_err(ControlError::store)
    }

    // Runtime appends: enqueue-only, never block, never fail the caller.

    pub fn append_log(&self, record: LogRecord) {
        let _ = self.append_tx.send(AppendMsg::Log(record));
    }

    pub fn append_metric(&self, sample: MetricSample) {
        let _ = self.append_tx.send(AppendMsg::Metric(sample));
    }

    pub fn update_runtime(&self, workload: Uuid, phase: Phase, pid: Option<u32>) {
        let _ = self.append_tx.send(AppendMsg::Runtime {
            workload,
            phase,
            pid,
        });
    }
}

struct Flusher<S> {
    store: Arc<S>,
    bus: Bus,
    rx: mpsc::UnboundedReceiver<AppendMsg>,
    flush_batch: usize,
    flush_interval: Duration,
    queue_max: usize,
    lag: Arc<AtomicBool>,
    shutdown: CancellationToken,

    logs: HashMap<Uuid, VecDeque<LogRecord>>,
    metrics: VecDeque<MetricSample>,
    /// Latest pending runtime update per workload, bounded by
    /// `RUNTIME_OUTBOX_MAX`; `runtime_order` tracks insertion order so
    /// overflow evicts the oldest entry.
    runtime: HashMap<Uuid, (Phase, Option<u32>)>,
    runtime_order: VecDeque<Uuid>,
    pending_logs: usize,
}

const LAG_THRESHOLD: u32 = 3;
const RETRY_BASE: Duration = Duration::from_millis(200);
const RETRY_MAX: Duration = Duration::from_secs(5);
/// Bound on the runtime-update outbox. Overflow drops the oldest pending
/// update with a `persistence_dropped` event: liveness over durability.
const RUNTIME_OUTBOX_MAX: usize = 4096;

impl<S: Store> Flusher<S> {
    async fn run(mut self) {
        let mut failures = 0u32;
        let mut retry_at: Option<Instant> = None;

        let mut tick = interval(self.flush_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let retry_wait = async {
                match retry_at {
                    Some(at) => sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            let mut want_flush = false;
            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    // Take everything still queued with us, then try one
                    // last flush.
                    while let Ok(msg) = self.rx.try_recv() {
                        self.absorb(msg);
                    }
                    if let Err(e) = self.flush().await {
                        error!("final store flush failed: {e}");
                    }
                    break;
                }
                Some(msg) = self.rx.recv() => {
                    self.absorb(msg);
                    if self.pending_logs >= self.flush_batch && retry_at.is_none() {
                        want_flush = true;
                    }
                }
                _ = tick.tick(), if retry_at.is_none() => {
                    want_flush = self.pending_logs > 0
                        || !self.metrics.is_empty()
                        || !self.runtime.is_empty();
                }
                _ = retry_wait => want_flush = true,
            }

            if !want_flush {
                continue;
            }

            match self.flush().await {
                Ok(()) => {
                    if failures >= LAG_THRESHOLD {
                        self.lag.store(false, AtomicOrdering::Relaxed);
                        self.bus
                            .publish(Event::now(EventKind::PersistenceLag { lagging: false }));
                    }
                    failures = 0;
                    retry_at = None;
                }
                Err(e) => {
                    failures += 1;
                    let backoff = RETRY_BASE
                        .saturating_mul(1 << failures.min(8))
                        .min(RETRY_MAX);
                    retry_at = Some(Instant::now() + backoff);
                    warn!("store flush failed ({failures} in a row), retrying in {backoff:?}: {e}");
                    if failures == LAG_THRESHOLD {
                        self.lag.store(true, AtomicOrdering::Relaxed);
                        self.bus
                            .publish(Event::now(EventKind::PersistenceLag { lagging: true }));
                    }
                }
            }
        }
    }

    fn absorb(&mut self, msg: AppendMsg) {
        match msg {
            AppendMsg::Log(record) => {
                let workload = record.workload_id;
                let queue = self.logs.entry(workload).or_default();
                queue.push_back(record);
                self.pending_logs += 1;
                if queue.len() > self.queue_max {
                    let mut dropped = 0u64;
                    while queue.len() > self.queue_max {
                        queue.pop_front();
                        self.pending_logs -= 1;
                        dropped += 1;
                    }
                    warn!(workload = %workload, dropped, "log queue overflow");
                    self.bus.publish(Event::for_workload(
                        workload,
                        EventKind::LogDropped { count: dropped },
                    ));
                }
            }
            AppendMsg::Metric(sample) => {
                self.metrics.push_back(sample);
                if self.metrics.len() > self.queue_max {
                    self.metrics.pop_front();
                }
            }
            AppendMsg::Runtime {
                workload,
                phase,
                pid,
            } => {
                if self.runtime.insert(workload, (phase, pid)).is_none() {
                    self.runtime_order.push_back(workload);
                    if self.runtime_order.len() > RUNTIME_OUTBOX_MAX {
                        if let Some(evicted) = self.runtime_order.pop_front() {
                            self.runtime.remove(&evicted);
                            warn!(workload = %evicted, "runtime outbox overflow");
                            self.bus.publish(Event::for_workload(
                                evicted,
                                EventKind::PersistenceDropped { count: 1 },
                            ));
                        }
                    }
                }
            }
        }
    }

    async fn flush(&mut self) -> anyhow::Result<()> {
        // Write in bounded chunks; leave the buffers untouched until the
        // corresponding write has succeeded so a retry resends everything.
        for queue in self.logs.values_mut() {
            while !queue.is_empty() {
                let take = queue.len().min(self.flush_batch);
                let chunk: Vec<LogRecord> = queue.iter().take(take).cloned().collect();
                self.store.append_logs(&chunk).await?;
                queue.drain(..take);
                self.pending_logs -= take;
            }
        }
        self.logs.retain(|_, q| !q.is_empty());

        while !self.metrics.is_empty() {
            let take = self.metrics.len().min(self.flush_batch);
            let chunk: Vec<MetricSample> =
                self.metrics.iter().take(take).cloned().collect();
            self.store.append_metrics(&chunk).await?;
            self.metrics.drain(..take);
        }

        let updates: Vec<(Uuid, (Phase, Option<u32>))> =
            self.runtime.iter().map(|(k, v)| (*k, *v)).collect();
        let mut flush_err = None;
        for (workload, (phase, pid)) in updates {
            match self
                .store
                .update_workload_runtime(workload, phase, pid)
                .await
            {
                Ok(()) => {
                    self.runtime.remove(&workload);
                }
                Err(e) => {
                    flush_err = Some(e);
                    break;
                }
            }
        }
        self.runtime_order
            .retain(|id| self.runtime.contains_key(id));
        match flush_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

struct Retention<S> {
    store: Arc<S>,
    max_age: Duration,
    max_records: u64,
    shutdown: CancellationToken,
}

const RETENTION_SWEEP: Duration = Duration::from_secs(3600);

impl<S: Store> Retention<S> {
    async fn run(self) {
        let mut tick = interval(RETENTION_SWEEP);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick fires immediately; skip it so startup stays cheap.
        tick.tick().await;

        loop {
            tokio::select! {
                _ = self.shutdown.cancelled() => break,
                _ = tick.tick() => {}
            }

            let cutoff = Utc::now()
                - chrono::Duration::from_std(self.max_age)
                    .unwrap_or_else(|_| chrono::Duration::days(30));
            match self.store.purge_all_before(cutoff).await {
                Ok(purged) if purged > 0 => {
                    tracing::info!(purged, "retention purge by age");
                }
                Ok(_) => {}
                Err(e) => warn!("retention purge failed: {e}"),
            }
            match self.store.trim_to_cap(self.max_records as i64).await {
                Ok(trimmed) if trimmed > 0 => {
                    tracing::info!(trimmed, "retention trim to record cap");
                }
                Ok(_) => {}
                Err(e) => warn!("retention trim failed: {e}"),
            }
        }
    }
}
