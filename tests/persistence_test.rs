//! The persistence pipeline under a failing store: appends never block the
//! supervisors, flushes retry with backoff, and the `persistence_lag`
//! health signal raises after three consecutive failures and clears on the
//! next success.

mod common;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use common::{drain_events, wait_for_phase, FakeRun, FakeRunnerFactory};
use warden_core::coordinator::CreateWorkload;
use warden_core::events::EventKind;
use warden_core::models::{
    LogRecord, LogStream, MetricSample, Phase, RestartPolicy, Schedule, Workload,
};
use warden_core::store::{LogFilter, PurgeCutoff, Store};
use warden_core::{Coordinator, DaemonConfig};
use warden_state::MemoryStore;

/// Delegating store whose append path can be switched to fail.
struct FailingStore {
    inner: MemoryStore,
    fail_appends: AtomicBool,
}

impl FailingStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_appends: AtomicBool::new(false),
        }
    }

    fn set_failing(&self, failing: bool) {
        self.fail_appends.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> anyhow::Result<()> {
        if self.fail_appends.load(Ordering::SeqCst) {
            anyhow::bail!("injected store outage");
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FailingStore {
    async fn run_migrations(&self) -> anyhow::Result<()> {
        self.inner.run_migrations().await
    }
    async fn upsert_workload(&self, w: &Workload) -> anyhow::Result<()> {
        self.inner.upsert_workload(w).await
    }
    async fn update_workload_runtime(
        &self,
        id: Uuid,
        phase: Phase,
        pid: Option<u32>,
    ) -> anyhow::Result<()> {
        self.check()?;
        self.inner.update_workload_runtime(id, phase, pid).await
    }
    async fn delete_workload(&self, id: Uuid) -> anyhow::Result<()> {
        self.inner.delete_workload(id).await
    }
    async fn load_workloads(&self) -> anyhow::Result<Vec<Workload>> {
        self.inner.load_workloads().await
    }
    async fn load_workload_runtime(
        &self,
    ) -> anyhow::Result<HashMap<Uuid, (Phase, Option<u32>)>> {
        self.inner.load_workload_runtime().await
    }
    async fn put_policy(&self, p: &RestartPolicy) -> anyhow::Result<()> {
        self.inner.put_policy(p).await
    }
    async fn delete_policy(&self, name: &str) -> anyhow::Result<()> {
        self.inner.delete_policy(name).await
    }
    async fn load_policies(&self) -> anyhow::Result<Vec<RestartPolicy>> {
        self.inner.load_policies().await
    }
    async fn put_schedule(&self, s: &Schedule) -> anyhow::Result<()> {
        self.inner.put_schedule(s).await
    }
    async fn delete_schedule(&self, id: Uuid) -> anyhow::Result<()> {
        self.inner.delete_schedule(id).await
    }
    async fn load_schedules(&self) -> anyhow::Result<Vec<Schedule>> {
        self.inner.load_schedules().await
    }
    async fn update_schedule_fire_times(
        &self,
        id: Uuid,
        last_fire: Option<DateTime<Utc>>,
        next_fire: Option<DateTime<Utc>>,
        enabled: bool,
    ) -> anyhow::Result<()> {
        self.inner
            .update_schedule_fire_times(id, last_fire, next_fire, enabled)
            .await
    }
    async fn append_logs(&self, batch: &[LogRecord]) -> anyhow::Result<()> {
        self.check()?;
        self.inner.append_logs(batch).await
    }
    async fn append_metrics(&self, batch: &[MetricSample]) -> anyhow::Result<()> {
        self.check()?;
        self.inner.append_metrics(batch).await
    }
    async fn query_logs(
        &self,
        workload: Uuid,
        filter: &LogFilter,
    ) -> anyhow::Result<Vec<LogRecord>> {
        self.inner.query_logs(workload, filter).await
    }
    async fn query_metrics(
        &self,
        workload: Uuid,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<MetricSample>> {
        self.inner.query_metrics(workload, since, until).await
    }
    async fn max_log_seq(&self, workload: Uuid) -> anyhow::Result<i64> {
        self.inner.max_log_seq(workload).await
    }
    async fn purge_workload_before(
        &self,
        workload: Uuid,
        cutoff: PurgeCutoff,
    ) -> anyhow::Result<u64> {
        self.inner.purge_workload_before(workload, cutoff).await
    }
    async fn purge_all_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        self.inner.purge_all_before(cutoff).await
    }
    async fn trim_to_cap(&self, max_records: i64) -> anyhow::Result<u64> {
        self.inner.trim_to_cap(max_records).await
    }
}

#[tokio::test(start_paused = true)]
async fn test_runtime_outbox_overflow_drops_oldest_with_event() -> Result<()> {
    // With the store down, pending runtime updates accumulate in the
    // gateway's bounded outbox; once it is full the oldest entries are
    // dropped and reported, and the producers never block.
    let store = Arc::new(FailingStore::new());
    store.set_failing(true);

    let bus = warden_core::events::Bus::new(8192);
    let mut events = bus.subscribe();
    let gateway =
        warden_core::store::StoreGateway::spawn(store.clone(), &DaemonConfig::default(), bus);

    let total = 4500u32;
    for _ in 0..total {
        gateway.update_runtime(Uuid::new_v4(), Phase::Running, Some(1));
    }
    // Let the flusher absorb the queue (and fail its flush attempts).
    tokio::time::sleep(Duration::from_secs(2)).await;

    let events = drain_events(&mut events, Duration::from_millis(100)).await;
    let dropped = events
        .iter()
        .filter(|e| matches!(e.kind, EventKind::PersistenceDropped { .. }))
        .count();
    assert!(
        dropped > 0,
        "overflowing the runtime outbox must report persistence_dropped"
    );
    // Nothing left the outbox while the store was down, so exactly the
    // updates past the 4096-entry bound were evicted.
    assert_eq!(dropped, total as usize - 4096);

    gateway.shutdown();
    Ok(())
}

#[tokio::test(start_paused = true)]
async fn test_store_outage_raises_lag_and_recovery_clears_it() -> Result<()> {
    let store = Arc::new(FailingStore::new());
    let factory = FakeRunnerFactory::always(FakeRun::Exit {
        code: 0,
        after: Duration::from_millis(10),
        lines: vec![(LogStream::Stdout, "line".to_string())],
    });
    let coordinator = Coordinator::start(DaemonConfig::default(), store.clone(), factory)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;
    let mut events = coordinator.subscribe_events();

    let id = coordinator
        .create_workload(CreateWorkload {
            name: "chatty".to_string(),
            argv: vec!["/bin/true".to_string()],
            policy: Some("none".to_string()),
            ..CreateWorkload::default()
        })
        .await
        .unwrap();

    store.set_failing(true);
    coordinator.start(id).await.unwrap();
    assert!(wait_for_phase(&coordinator, id, Phase::Stopped, Duration::from_secs(5)).await);

    // Three failed flushes (with backoff) raise the health signal. The
    // state machine kept moving the whole time.
    let mut lagged = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if coordinator.health().await.persistence_lag {
            lagged = true;
            break;
        }
    }
    assert!(lagged, "persistence lag should raise during the outage");

    // Outage ends; the retried flush lands and the signal clears.
    store.set_failing(false);
    let mut cleared = false;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(500)).await;
        if !coordinator.health().await.persistence_lag {
            cleared = true;
            break;
        }
    }
    assert!(cleared, "persistence lag should clear after recovery");

    let events = drain_events(&mut events, Duration::from_millis(50)).await;
    assert!(events
        .iter()
        .any(|e| matches!(e.kind, EventKind::PersistenceLag { lagging: true })));
    assert!(events
        .iter()
        .any(|e| matches!(e.kind, EventKind::PersistenceLag { lagging: false })));

    // Nothing buffered during the outage was lost.
    let logs = coordinator.query_logs(id, LogFilter::default()).await.unwrap();
    assert!(logs
        .iter()
        .any(|r| r.stream == LogStream::Stdout && r.line == "line"));
    Ok(())
}
