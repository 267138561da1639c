use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use uuid::Uuid;

use warden_core::models::{
    LogRecord, LogStream, MetricSample, Phase, RestartPolicy, Schedule, ScheduleKind, Workload,
};

#[derive(sqlx::FromRow)]
pub(super) struct WorkloadRow {
    pub id: Uuid,
    pub name: String,
    pub argv: String,
    pub cwd: Option<String>,
    pub env: String,
    pub group_name: Option<String>,
    pub policy: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
pub(super) struct PolicyRow {
    pub name: String,
    pub max_retries: Option<i64>,
    pub initial_delay_ms: i64,
    pub multiplier: f64,
    pub max_delay_ms: i64,
    pub restart_on_exit_codes: String,
    pub restart_on_success: bool,
    pub restart_on_lost: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
pub(super) struct ScheduleRow {
    pub id: Uuid,
    pub workload_id: Uuid,
    pub kind: String,
    pub expression: String,
    pub enabled: bool,
    pub last_fire: Option<DateTime<Utc>>,
    pub next_fire: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(sqlx::FromRow)]
pub(super) struct LogRow {
    pub workload_id: Uuid,
    pub seq: i64,
    pub at: DateTime<Utc>,
    pub stream: String,
    pub line: String,
    pub truncated: bool,
}

#[derive(sqlx::FromRow)]
pub(super) struct MetricRow {
    pub workload_id: Uuid,
    pub at: DateTime<Utc>,
    pub cpu: f64,
    pub rss_bytes: i64,
    pub threads: i64,
}

pub struct SqliteStore {
    pub(super) pool: SqlitePool,
}

fn sqlite_file_path(database_url: &str) -> Option<PathBuf> {
    let raw = database_url
        .strip_prefix("sqlite://")
        .or_else(|| database_url.strip_prefix("sqlite:"))?;
    let path = raw.split('?').next().unwrap_or(raw);
    if path.is_empty() || path == ":memory:" || path.starts_with("file:") {
        return None;
    }
    Some(PathBuf::from(path))
}

impl SqliteStore {
    pub async fn new(database_url: &str) -> Result<Self> {
        if let Some(path) = sqlite_file_path(database_url) {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).with_context(|| {
                        format!("failed to create database directory {}", parent.display())
                    })?;
                }
            }
        }

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .min_connections(1)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        sqlx::query("PRAGMA foreign_keys = ON;").execute(&pool).await?;
        // WAL allows concurrent reads during writes.
        sqlx::query("PRAGMA journal_mode = WAL;").execute(&pool).await?;
        sqlx::query("PRAGMA synchronous = NORMAL;").execute(&pool).await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub(super) fn map_workload(row: WorkloadRow) -> Result<Workload> {
        let argv: Vec<String> = serde_json::from_str(&row.argv)?;
        let env: BTreeMap<String, String> = serde_json::from_str(&row.env)?;
        Ok(Workload {
            id: row.id,
            name: row.name,
            argv,
            cwd: row.cwd,
            env,
            group: row.group_name,
            policy: row.policy,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    pub(super) fn map_policy(row: PolicyRow) -> Result<RestartPolicy> {
        let codes: BTreeSet<i32> = serde_json::from_str(&row.restart_on_exit_codes)?;
        Ok(RestartPolicy {
            name: row.name,
            max_retries: row.max_retries.map(|v| v as u32),
            initial_delay: Duration::from_millis(row.initial_delay_ms.max(0) as u64),
            multiplier: row.multiplier,
            max_delay: Duration::from_millis(row.max_delay_ms.max(0) as u64),
            restart_on_exit_codes: codes,
            restart_on_success: row.restart_on_success,
            restart_on_lost: row.restart_on_lost,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    pub(super) fn map_schedule(row: ScheduleRow) -> Result<Schedule> {
        let kind = ScheduleKind::parse(&row.kind)
            .with_context(|| format!("unknown schedule kind '{}'", row.kind))?;
        Ok(Schedule {
            id: row.id,
            workload_id: row.workload_id,
            kind,
            expression: row.expression,
            enabled: row.enabled,
            last_fire: row.last_fire,
            next_fire: row.next_fire,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    pub(super) fn map_log(row: LogRow) -> Result<LogRecord> {
        let stream = LogStream::parse(&row.stream)
            .with_context(|| format!("unknown log stream '{}'", row.stream))?;
        Ok(LogRecord {
            workload_id: row.workload_id,
            seq: row.seq,
            at: row.at,
            stream,
            line: row.line,
            truncated: row.truncated,
        })
    }

    pub(super) fn map_metric(row: MetricRow) -> MetricSample {
        MetricSample {
            workload_id: row.workload_id,
            at: row.at,
            cpu: row.cpu,
            rss_bytes: row.rss_bytes.max(0) as u64,
            threads: row.threads.max(0) as u32,
        }
    }

    pub(super) fn parse_phase(raw: &str) -> Phase {
        Phase::parse(raw).unwrap_or(Phase::Idle)
    }
}

#[cfg(test)]
mod tests {
    use super::sqlite_file_path;
    use std::path::PathBuf;

    #[test]
    fn test_sqlite_file_path_extracts_file_paths() {
        assert_eq!(
            sqlite_file_path("sqlite://./.warden/warden.db?mode=rwc"),
            Some(PathBuf::from("./.warden/warden.db"))
        );
        assert_eq!(
            sqlite_file_path("sqlite:./local.db"),
            Some(PathBuf::from("./local.db"))
        );
    }

    #[test]
    fn test_sqlite_file_path_ignores_memory_urls() {
        assert_eq!(sqlite_file_path(":memory:"), None);
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
        assert_eq!(sqlite_file_path("sqlite://:memory:"), None);
    }
}
