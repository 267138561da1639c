//! SQLite store backend (sqlx, WAL journal, embedded migrations).

mod core;
mod declared;
mod records;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

pub use self::core::SqliteStore;

use warden_core::models::{LogRecord, MetricSample, Phase, RestartPolicy, Schedule, Workload};
use warden_core::store::{LogFilter, PurgeCutoff, Store};

#[async_trait]
impl Store for SqliteStore {
    async fn run_migrations(&self) -> anyhow::Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    async fn upsert_workload(&self, workload: &Workload) -> anyhow::Result<()> {
        self.upsert_workload_impl(workload).await
    }

    async fn update_workload_runtime(
        &self,
        id: Uuid,
        phase: Phase,
        pid: Option<u32>,
    ) -> anyhow::Result<()> {
        self.update_workload_runtime_impl(id, phase, pid).await
    }

    async fn delete_workload(&self, id: Uuid) -> anyhow::Result<()> {
        self.delete_workload_impl(id).await
    }

    async fn load_workloads(&self) -> anyhow::Result<Vec<Workload>> {
        self.load_workloads_impl().await
    }

    async fn load_workload_runtime(
        &self,
    ) -> anyhow::Result<HashMap<Uuid, (Phase, Option<u32>)>> {
        self.load_workload_runtime_impl().await
    }

    async fn put_policy(&self, policy: &RestartPolicy) -> anyhow::Result<()> {
        self.put_policy_impl(policy).await
    }

    async fn delete_policy(&self, name: &str) -> anyhow::Result<()> {
        self.delete_policy_impl(name).await
    }

    async fn load_policies(&self) -> anyhow::Result<Vec<RestartPolicy>> {
        self.load_policies_impl().await
    }

    async fn put_schedule(&self, schedule: &Schedule) -> anyhow::Result<()> {
        self.put_schedule_impl(schedule).await
    }

    async fn delete_schedule(&self, id: Uuid) -> anyhow::Result<()> {
        self.delete_schedule_impl(id).await
    }

    async fn load_schedules(&self) -> anyhow::Result<Vec<Schedule>> {
        self.load_schedules_impl().await
    }

    async fn update_schedule_fire_times(
        &self,
        id: Uuid,
        last_fire: Option<DateTime<Utc>>,
        next_fire: Option<DateTime<Utc>>,
        enabled: bool,
    ) -> anyhow::Result<()> {
        self.update_schedule_fire_times_impl(id, last_fire, next_fire, enabled)
            .await
    }

    async fn append_logs(&self, batch: &[LogRecord]) -> anyhow::Result<()> {
        self.append_logs_impl(batch).await
    }

    async fn append_metrics(&self, batch: &[MetricSample]) -> anyhow::Result<()> {
        self.append_metrics_impl(batch).await
    }

    async fn query_logs(
        &self,
        workload: Uuid,
        filter: &LogFilter,
    ) -> anyhow::Result<Vec<LogRecord>> {
        self.query_logs_impl(workload, filter).await
    }

    async fn query_metrics(
        &self,
        workload: Uuid,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> anyhow::Result<Vec<MetricSample>> {
        self.query_metrics_impl(workload, since, until).await
    }

    async fn max_log_seq(&self, workload: Uuid) -> anyhow::Result<i64> {
        self.max_log_seq_impl(workload).await
    }

    async fn purge_workload_before(
        &self,
        workload: Uuid,
        cutoff: PurgeCutoff,
    ) -> anyhow::Result<u64> {
        self.purge_workload_before_impl(workload, cutoff).await
    }

    async fn purge_all_before(&self, cutoff: DateTime<Utc>) -> anyhow::Result<u64> {
        self.purge_all_before_impl(cutoff).await
    }

    async fn trim_to_cap(&self, max_records: i64) -> anyhow::Result<u64> {
        self.trim_to_cap_impl(max_records).await
    }
}
