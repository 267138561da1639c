//! In-memory store backend. Used by tests and by ephemeral daemons that do
//! not need declared state to survive a restart. Implements the same
//! transactional contract as the SQLite backend over a single mutex.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use warden_core::models::{
    LogRecord, MetricSample, Phase, RestartPolicy, Schedule, Workload,
};
use warden_core::store::{LogFilter, PurgeCutoff, Store};

#[derive(Default)]
struct Inner {
    workloads: HashMap<Uuid, Workload>,
    runtime: HashMap<Uuid, (Phase, Option<u32>)>,
    policies: HashMap<String, RestartPolicy>,
    schedules: HashMap<Uuid, Schedule>,
    logs: HashMap<Uuid, Vec<LogRecord>>,
    metrics: HashMap<Uuid, Vec<MetricSample>>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn run_migrations(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn upsert_workload(&self, workload: &Workload) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.workloads.insert(workload.id, workload.clone());
        Ok(())
    }

    async fn update_workload_runtime(
        &self,
        id: Uuid,
        phase: Phase,
        pid: Option<u32>,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if inner.workloads.contains_key(&id) {
            inner.runtime.insert(id, (phase, pid));
        }
        Ok(())
    }

    async fn delete_workload(&self, id: Uuid) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.workloads.remove(&id);
        inner.runtime.remove(&id);
        inner.schedules.retain(|_, s| s.workload_id != id);
        inner.logs.remove(&id);
        inner.metrics.remove(&id);
        Ok(())
    }

    async fn load_workloads(&self) -> anyhow::Result<Vec<Workload>> {
        let inner = self.inner.lock().await;
        let mut workloads: Vec<Workload> = inner.workloads.values().cloned().collect();
        workloads.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(workloads)
    }

    async fn load_workload_runtime(
        &self,
    ) -> anyhow::Result<HashMap<Uuid, (Phase, Option<u32>)>> {
        Ok(self.inner.lock().await.runtime.clone())
    }

    async fn put_policy(&self, policy: &RestartPolicy) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.policies.insert(policy.name.clone(), policy.clone());
        Ok(())
    }

    async fn delete_policy(&self, name: &str) -> anyhow::Result<()> {
        self.inner.lock().await.policies.remove(name);
        Ok(())
    }

    async fn load_policies(&self) -> anyhow::Result<Vec<RestartPolicy>> {
        let inner = self.inner.lock().await;
        let mut policies: Vec<RestartPolicy> = inner.policies.values().cloned().collect();
        policies.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(policies)
    }

    async fn put_schedule(&self, schedule: &Schedule) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        inner.schedules.insert(schedule.id, schedule.clone());
        Ok(())
    }

    async fn delete_schedule(&self, id: Uuid) -> anyhow::Result<()> {
        self.inner.lock().await.schedules.remove(&id);
        Ok(())
    }

    async fn load_schedules(&self) -> anyhow::Result<Vec<Schedule>> {
        let inner = self.inner.lock().await;
        let mut schedules: Vec<Schedule> = inner.schedules.values().cloned().collect();
        schedules.sort_by_key(|s| s.created_at);
        Ok(schedules)
    }

    async fn update_schedule_fire_times(
        &self,
        id: Uuid,
        last_fire: Option<DateTime<Utc>>,
        next_fire: Option<DateTime<Utc>>,
        enabled: bool,
    ) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(schedule) = inner.schedules.get_mut(&id) {
            schedule.last_fire = last_fire;
            schedule.next_fire = next_fire;
            schedule.enabled = enabled;
        }
        Ok(())
    }

    async fn append_logs(&self, batch: &[LogRecord]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        for record in batch {
            inner
                .logs
                .entry(record.workload_id)
                .or_default()
                .push(record.clone());
        }
        Ok(())
    }

    async fn append_metrics(&self, batch: &[MetricSample]) -> anyhow::Result<()> {
        let mut inner = self.inner.lock().await;
        for sample in batch {
            inner
                .metrics
                .entry(sample.workload_id)
                .or_default()
                .push(sample.clone());
        }
        Ok(())
    }

    async fn query_logs(
        &self,
        workload: Uuid,
        filter: &LogFilter,
    ) -> anyhow::Result<Vec<LogRecord>> {
        let inner = self.inner.lock().await;
        let mut records: Vec<LogRecord> = inner
            .logs
            .get(&workload)
            .map(|records| {
                records
                    .iter()
                    .filter(|r| {
                        filter.since.is_none_or(|since| r.at >= since)
                            && filter.until.is_none_or(|until| r.at <= until)
                            && filter.stream.is_none_or(|s| r.stream == s)
                            && filter
                                .grep
                                .as_ref()
                                .is_none_or(|grep| r.line.contains(grep.as_str()))
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by_key(|r| r.seq);
        if let Some(tail) = filter.tail {
            let keep = tail as usize;
            if records.len() > keep {
                records.drain(..records.len() - keep);
            }
        }
        Ok(records)
    }

    async fn query_metrics(
        &self,
        workload: Uuid,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<MetricSample>> {
        let inner = self.inner.lock().await;
        let mut samples: Vec<MetricSample> = inner
            .metrics
            .get(&workload)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|s| {
                        since.is_none_or(|at| s.at >= at) && until.is_none_or(|at| s.at <= at)
                    })
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        samples.sort_by_key(|s| s.at);
        Ok(samples)
    }

    async fn max_log_seq(&self, workload: Uuid) -> anyhow::Result<i64> {
        let inner = self.inner.lock().await;
        Ok(inner
            .logs
            .get(&workload)
            .and_then(|records| records.iter().map(|r| r.seq).max())
            .unwrap_or(0))
    }

    async fn purge_workload_before(
        &self,
        workload: Uuid,
        cutoff: PurgeCutoff,
    ) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut purged = 0u64;
        match cutoff {
            PurgeCutoff::Timestamp(at) => {
                if let Some(records) = inner.logs.get_mut(&workload) {
                    let before = records.len();
                    records.retain(|r| r.at >= at);
                    purged += (before - records.len()) as u64;
                }
                if let Some(samples) = inner.metrics.get_mut(&workload) {
                    let before = samples.len();
                    samples.retain(|s| s.at >= at);
                    purged += (before - samples.len()) as u64;
                }
            }
            PurgeCutoff::Sequence(seq) => {
                if let Some(records) = inner.logs.get_mut(&workload) {
                    let before = records.len();
                    records.retain(|r| r.seq > seq);
                    purged += (before - records.len()) as u64;
                }
            }
        }
        Ok(purged)
    }

    async fn purge_all_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut purged = 0u64;
        for records in inner.logs.values_mut() {
            let before = records.len();
            records.retain(|r| r.at >= cutoff);
            purged += (before - records.len()) as u64;
        }
        for samples in inner.metrics.values_mut() {
            let before = samples.len();
            samples.retain(|s| s.at >= cutoff);
            purged += (before - samples.len()) as u64;
        }
        Ok(purged)
    }

    async fn trim_to_cap(&self, max_records: i64) -> anyhow::Result<u64> {
        let mut inner = self.inner.lock().await;
        let cap = max_records.max(0) as usize;
        let mut trimmed = 0u64;
        for records in inner.logs.values_mut() {
            if records.len() > cap {
                trimmed += (records.len() - cap) as u64;
                records.drain(..records.len() - cap);
            }
        }
        for samples in inner.metrics.values_mut() {
            if samples.len() > cap {
                trimmed += (samples.len() - cap) as u64;
                samples.drain(..samples.len() - cap);
            }
        }
        Ok(trimmed)
    }
}
