use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::Row;
use uuid::Uuid;

use warden_core::models::{LogRecord, MetricSample};
use warden_core::store::{LogFilter, PurgeCutoff};

use super::core::{LogRow, MetricRow, SqliteStore};

impl SqliteStore {
    pub(super) async fn append_logs_impl(&self, batch: &[LogRecord]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for record in batch {
            sqlx::query(
                r#"INSERT OR IGNORE INTO logs (workload_id, seq, at, stream, line, truncated)
                VALUES (?, ?, ?, ?, ?, ?)"#,
            )
            .bind(record.workload_id)
            .bind(record.seq)
            .bind(record.at)
            .bind(record.stream.as_str())
            .bind(&record.line)
            .bind(record.truncated)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn append_metrics_impl(&self, batch: &[MetricSample]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let mut tx = self.pool.begin().await?;
        for sample in batch {
            sqlx::query(
                r#"INSERT OR REPLACE INTO metrics (workload_id, at, cpu, rss_bytes, threads)
                VALUES (?, ?, ?, ?, ?)"#,
            )
            .bind(sample.workload_id)
            .bind(sample.at)
            .bind(sample.cpu)
            .bind(sample.rss_bytes as i64)
            .bind(sample.threads as i64)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub(super) async fn query_logs_impl(
        &self,
        workload: Uuid,
        filter: &LogFilter,
    ) -> Result<Vec<LogRecord>> {
        let mut sql = String::from(
            "SELECT workload_id, seq, at, stream, line, truncated FROM logs WHERE workload_id = ?",
        );
        if filter.since.is_some() {
            sql.push_str(" AND at >= ?");
        }
        if filter.until.is_some() {
            sql.push_str(" AND at <= ?");
        }
        if filter.stream.is_some() {
            sql.push_str(" AND stream = ?");
        }
        if filter.grep.is_some() {
            sql.push_str(" AND line LIKE ?");
        }
        let sql = match filter.tail {
            Some(_) => format!("SELECT * FROM ({sql} ORDER BY seq DESC LIMIT ?) ORDER BY seq"),
            None => format!("{sql} ORDER BY seq"),
        };

        let mut query = sqlx::query_as::<_, LogRow>(&sql).bind(workload);
        if let Some(since) = filter.since {
            query = query.bind(since);
        }
        if let Some(until) = filter.until {
            query = query.bind(until);
        }
        if let Some(stream) = filter.stream {
            query = query.bind(stream.as_str());
        }
        if let Some(grep) = &filter.grep {
            query = query.bind(format!("%{grep}%"));
        }
        if let Some(tail) = filter.tail {
            query = query.bind(tail as i64);
        }

        let rows = query.fetch_all(&self.pool).await?;
        rows.into_iter().map(Self::map_log).collect()
    }

    pub(super) async fn query_metrics_impl(
        &self,
        workload: Uuid,
        since: Option<DateTime<Utc>>,
        until: Option<DateTime<Utc>>,
    ) -> Result<Vec<MetricSample>> {
        let mut sql = String::from(
            "SELECT workload_id, at, cpu, rss_bytes, threads FROM metrics WHERE workload_id = ?",
        );
        if since.is_some() {
            sql.push_str(" AND at >= ?");
        }
        if until.is_some() {
            sql.push_str(" AND at <= ?");
        }
        sql.push_str(" ORDER BY at");

        let mut query = sqlx::query_as::<_, MetricRow>(&sql).bind(workload);
        if let Some(since) = since {
            query = query.bind(since);
        }
        if let Some(until) = until {
            query = query.bind(until);
        }

        let rows = query.fetch_all(&self.pool).await?;
        Ok(rows.into_iter().map(Self::map_metric).collect())
    }

    pub(super) async fn max_log_seq_impl(&self, workload: Uuid) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS max_seq FROM logs WHERE workload_id = ?")
            .bind(workload)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("max_seq")?)
    }

    pub(super) async fn purge_workload_before_impl(
        &self,
        workload: Uuid,
        cutoff: PurgeCutoff,
    ) -> Result<u64> {
        let purged = match cutoff {
            PurgeCutoff::Timestamp(at) => {
                let logs = sqlx::query("DELETE FROM logs WHERE workload_id = ? AND at < ?")
                    .bind(workload)
                    .bind(at)
                    .execute(&self.pool)
                    .await?
                    .rows_affected();
                let metrics =
                    sqlx::query("DELETE FROM metrics WHERE workload_id = ? AND at < ?")
                        .bind(workload)
                        .bind(at)
                        .execute(&self.pool)
                        .await?
                        .rows_affected();
                logs + metrics
            }
            PurgeCutoff::Sequence(seq) => {
                sqlx::query("DELETE FROM logs WHERE workload_id = ? AND seq <= ?")
                    .bind(workload)
                    .bind(seq)
                    .execute(&self.pool)
                    .await?
                    .rows_affected()
            }
        };
        Ok(purged)
    }

    pub(super) async fn purge_all_before_impl(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let logs = sqlx::query("DELETE FROM logs WHERE at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        let metrics = sqlx::query("DELETE FROM metrics WHERE at < ?")
            .bind(cutoff)
            .execute(&self.pool)
            .await?
            .rows_affected();
        Ok(logs + metrics)
    }

    pub(super) async fn trim_to_cap_impl(&self, max_records: i64) -> Result<u64> {
        let logs = sqlx::query(
            r#"DELETE FROM logs AS l
            WHERE l.seq <= (SELECT MAX(seq) FROM logs WHERE workload_id = l.workload_id) - ?"#,
        )
        .bind(max_records)
        .execute(&self.pool)
        .await?
        .rows_affected();

        let metrics = sqlx::query(
            r#"DELETE FROM metrics WHERE rowid IN (
                SELECT rowid FROM (
                    SELECT rowid,
                           ROW_NUMBER() OVER (PARTITION BY workload_id ORDER BY at DESC) AS rn
                    FROM metrics
                ) WHERE rn > ?
            )"#,
        )
        .bind(max_records)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(logs + metrics)
    }
}
