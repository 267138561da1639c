use std::collections::HashMap;

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use warden_core::models::{Phase, RestartPolicy, Schedule, Workload};

use super::core::{PolicyRow, ScheduleRow, SqliteStore, WorkloadRow};

impl SqliteStore {
    pub(super) async fn upsert_workload_impl(&self, workload: &Workload) -> Result<()> {
        let argv = serde_json::to_string(&workload.argv)?;
        let env = serde_json::to_string(&workload.env)?;
        sqlx::query(
            r#"INSERT INTO workloads (id, name, argv, cwd, env, group_name, policy, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name = excluded.name, argv = excluded.argv, cwd = excluded.cwd,
                env = excluded.env, group_name = excluded.group_name,
                policy = excluded.policy, updated_at = excluded.updated_at"#,
        )
        .bind(workload.id)
        .bind(&workload.name)
        .bind(&argv)
        .bind(&workload.cwd)
        .bind(&env)
        .bind(&workload.group)
        .bind(&workload.policy)
        .bind(workload.created_at)
        .bind(workload.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(super) async fn update_workload_runtime_impl(
        &self,
        id: Uuid,
        phase: Phase,
        pid: Option<u32>,
    ) -> Result<()> {
        sqlx::query("UPDATE workloads SET last_phase = ?, last_pid = ? WHERE id = ?")
            .bind(phase.as_str())
            .bind(pid.map(|p| p as i64))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(super) async fn delete_workload_impl(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("DELETE FROM logs WHERE workload_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM metrics WHERE workload_id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        // Schedules go with the workload via ON DELETE CASCADE.
        sqlx::query("DELETE FROM workloads WHERE id = ?")
            .bind(id)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn load_workloads_impl(&self) -> Result<Vec<Workload>> {
        let rows = sqlx::query_as::<_, WorkloadRow>(
            "SELECT id, name, argv, cwd, env, group_name, policy, created_at, updated_at
             FROM workloads ORDER BY name",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(Self::map_workload).collect()
    }

    pub(super) async fn load_workload_runtime_impl(
        &self,
    ) -> Result<HashMap<Uuid, (Phase, Option<u32>)>> {
        let rows = sqlx::query("SELECT id, last_phase, last_pid FROM workloads")
            .fetch_all(&self.pool)
            .await?;
        let mut runtime = HashMap::new();
        for row in rows {
            let id: Uuid = row.try_get("id")?;
            let phase: String = row.try_get("last_phase")?;
            let pid: Option<i64> = row.try_get("last_pid")?;
            runtime.insert(
                id,
                (Self::parse_phase(&phase), pid.map(|p| p as u32)),
            );
        }
        Ok(runtime)
    }

    pub(super) async fn put_policy_impl(&self, policy: &RestartPolicy) -> Result<()> {
        let codes = serde_json::to_string(&policy.restart_on_exit_codes)?;
        sqlx::query(
            r#"INSERT INTO policies (name, max_retries, initial_delay_ms, multiplier,
                max_delay_ms, restart_on_exit_codes, restart_on_success, restart_on_lost,
                created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                max_retries = excluded.max_retries,
                initial_delay_ms = excluded.initial_delay_ms,
                multiplier = excluded.multiplier,
                max_delay_ms = excluded.max_delay_ms,
                restart_on_exit_codes = excluded.restart_on_exit_codes,
                restart_on_success = excluded.restart_on_success,
                restart_on_lost = excluded.restart_on_lost,
                updated_at = excluded.updated_at"#,
        )
        .bind(&policy.name)
        .bind(policy.max_retries.map(|v| v as i64))
        .bind(policy.initial_delay.as_millis() as i64)
        .bind(policy.multiplier)
        .bind(policy.max_delay.as_millis() as i64)
        .bind(&codes)
        .bind(policy.restart_on_success)
        .bind(policy.restart_on_lost)
        .bind(policy.created_at)
        .bind(policy.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(super) async fn delete_policy_impl(&self, name: &str) -> Result<()> {
        sqlx::query("DELETE FROM policies WHERE name = ?")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(super) async fn load_policies_impl(&self) -> Result<Vec<RestartPolicy>> {
        let rows = sqlx::query_as::<_, PolicyRow>("SELECT * FROM policies ORDER BY name")
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(Self::map_policy).collect()
    }

    pub(super) async fn put_schedule_impl(&self, schedule: &Schedule) -> Result<()> {
        sqlx::query(
            r#"INSERT INTO schedules (id, workload_id, kind, expression, enabled,
                last_fire, next_fire, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                kind = excluded.kind, expression = excluded.expression,
                enabled = excluded.enabled, last_fire = excluded.last_fire,
                next_fire = excluded.next_fire, updated_at = excluded.updated_at"#,
        )
        .bind(schedule.id)
        .bind(schedule.workload_id)
        .bind(schedule.kind.as_str())
        .bind(&schedule.expression)
        .bind(schedule.enabled)
        .bind(schedule.last_fire)
        .bind(schedule.next_fire)
        .bind(schedule.created_at)
        .bind(schedule.updated_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub(super) async fn delete_schedule_impl(&self, id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM schedules WHERE id = ?")
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub(super) async fn load_schedules_impl(&self) -> Result<Vec<Schedule>> {
        let rows =
            sqlx::query_as::<_, ScheduleRow>("SELECT * FROM schedules ORDER BY created_at")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(Self::map_schedule).collect()
    }

    pub(super) async fn update_schedule_fire_times_impl(
        &self,
        id: Uuid,
        last_fire: Option<DateTime<Utc>>,
        next_fire: Option<DateTime<Utc>>,
        enabled: bool,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE schedules SET last_fire = ?, next_fire = ?, enabled = ? WHERE id = ?",
        )
        .bind(last_fire)
        .bind(next_fire)
        .bind(enabled)
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}
