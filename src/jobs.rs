//! Persisted job records.
//!
//! One row per pipeline run. The row stays `Initiating` from the moment the
//! job is accepted until the orchestrator writes its final outcome, so the
//! latest row answers "may a new job start?" without the gaps a stage-level
//! log has between stages.
//!
//! A process killed mid-run leaves its row `Initiating`. With a stale bound
//! set, a running row whose `updated_at` is older than the bound is failed
//! the next time readiness is asked for.

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::warn;
use uuid::Uuid;

use crate::error::StageResult;
use crate::ledger::{Outcome, Readiness};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobRecord {
    pub id: String,
    pub channel_id: String,
    pub guild_id: Option<String>,
    pub subject: String,
    pub variant: String,
    /// Stage currently running, or the last one attempted.
    pub stage: String,
    pub outcome: Outcome,
    pub detail: Option<String>,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub const ABANDONED_DETAIL: &str = "interrupted before completion";

#[derive(Clone)]
pub struct JobStore {
    pool: SqlitePool,
    stale_after: Option<Duration>,
}

impl JobStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            stale_after: None,
        }
    }

    /// Treat a running job with no progress for longer than `bound` as
    /// abandoned.
    pub fn with_stale_after(mut self, bound: Duration) -> Self {
        self.stale_after = Some(bound);
        self
    }

    pub async fn start(
        &self,
        channel_id: &str,
        guild_id: Option<&str>,
        subject: &str,
        variant: &str,
    ) -> StageResult<JobRecord> {
        let now = Utc::now();
        let record = JobRecord {
            id: Uuid::new_v4().to_string(),
            channel_id: channel_id.to_string(),
            guild_id: guild_id.map(str::to_string),
            subject: subject.to_string(),
            variant: variant.to_string(),
            stage: "Archive".to_string(),
            outcome: Outcome::Initiating,
            detail: None,
            started_at: now,
            updated_at: now,
        };

        sqlx::query(
            r#"
            INSERT INTO jobs (id, channel_id, guild_id, subject, variant, stage, outcome,
                              detail, started_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, NULL, ?, ?)
            "#,
        )
        .bind(&record.id)
        .bind(&record.channel_id)
        .bind(&record.guild_id)
        .bind(&record.subject)
        .bind(&record.variant)
        .bind(&record.stage)
        .bind(record.outcome.as_str())
        .bind(now.timestamp_millis())
        .bind(now.timestamp_millis())
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    pub async fn update_stage(&self, id: &str, stage: &str) -> StageResult<()> {
        sqlx::query("UPDATE jobs SET stage = ?, updated_at = ? WHERE id = ?")
            .bind(stage)
            .bind(Utc::now().timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_subject(&self, id: &str, subject: &str) -> StageResult<()> {
        sqlx::query("UPDATE jobs SET subject = ?, updated_at = ? WHERE id = ?")
            .bind(subject)
            .bind(Utc::now().timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn finish(&self, id: &str, outcome: Outcome, detail: Option<&str>) -> StageResult<()> {
        sqlx::query("UPDATE jobs SET outcome = ?, detail = ?, updated_at = ? WHERE id = ?")
            .bind(outcome.as_str())
            .bind(detail)
            .bind(Utc::now().timestamp_millis())
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn latest(&self) -> StageResult<Option<JobRecord>> {
        let row = sqlx::query(
            "SELECT * FROM jobs ORDER BY started_at DESC, rowid DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.as_ref().map(row_to_job))
    }

    pub async fn recent(&self, limit: i64) -> StageResult<Vec<JobRecord>> {
        let rows = sqlx::query(
            "SELECT * FROM jobs ORDER BY started_at DESC, rowid DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.iter().map(row_to_job).collect())
    }

    /// Busy while the latest job has not reached a terminal outcome, unless
    /// it has gone stale.
    pub async fn readiness(&self) -> StageResult<Readiness> {
        let job = match self.latest().await? {
            Some(job) if !job.outcome.is_terminal() => job,
            _ => return Ok(Readiness::Ready),
        };

        if let Some(bound) = self.stale_after {
            if Utc::now() - job.updated_at > bound {
                warn!(
                    job = %job.id,
                    stage = %job.stage,
                    updated_at = %job.updated_at,
                    "running job went stale, marking it failed"
                );
                self.finish(&job.id, Outcome::Failed, Some(ABANDONED_DETAIL))
                    .await?;
                return Ok(Readiness::Ready);
            }
        }
        Ok(Readiness::Busy)
    }

    /// Fail jobs left `Initiating` by a process that exited mid-run.
    pub async fn abandon_running(&self) -> StageResult<u64> {
        let res = sqlx::query(
            "UPDATE jobs SET outcome = ?, detail = ?, updated_at = ? WHERE outcome = ?",
        )
        .bind(Outcome::Failed.as_str())
        .bind(ABANDONED_DETAIL)
        .bind(Utc::now().timestamp_millis())
        .bind(Outcome::Initiating.as_str())
        .execute(&self.pool)
        .await?;
        if res.rows_affected() > 0 {
            warn!(jobs = res.rows_affected(), "marked interrupted jobs as failed");
        }
        Ok(res.rows_affected())
    }
}

fn millis_to_datetime(ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ms).single().unwrap_or_default()
}

fn row_to_job(row: &SqliteRow) -> JobRecord {
    let outcome: String = row.get("outcome");
    JobRecord {
        id: row.get("id"),
        channel_id: row.get("channel_id"),
        guild_id: row.get("guild_id"),
        subject: row.get("subject"),
        variant: row.get("variant"),
        stage: row.get("stage"),
        // unknown values count as still running
        outcome: Outcome::parse(&outcome).unwrap_or(Outcome::Initiating),
        detail: row.get("detail"),
        started_at: millis_to_datetime(row.get("started_at")),
        updated_at: millis_to_datetime(row.get("updated_at")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    async fn jobs() -> JobStore {
        JobStore::new(db::open_in_memory().await.unwrap())
    }

    #[tokio::test]
    async fn empty_store_is_ready() {
        let jobs = jobs().await;
        assert_eq!(jobs.readiness().await.unwrap(), Readiness::Ready);
        assert!(jobs.latest().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn running_job_stays_busy_across_stages() {
        let jobs = jobs().await;
        let job = jobs.start("42", Some("1"), "general", "remote").await.unwrap();
        assert_eq!(jobs.readiness().await.unwrap(), Readiness::Busy);

        jobs.update_stage(&job.id, "Upload").await.unwrap();
        assert_eq!(jobs.readiness().await.unwrap(), Readiness::Busy);
        assert_eq!(jobs.latest().await.unwrap().unwrap().stage, "Upload");

        jobs.finish(&job.id, Outcome::Complete, None).await.unwrap();
        assert_eq!(jobs.readiness().await.unwrap(), Readiness::Ready);
    }

    #[tokio::test]
    async fn failed_job_keeps_detail() {
        let jobs = jobs().await;
        let job = jobs.start("42", None, "general", "local").await.unwrap();
        jobs.finish(&job.id, Outcome::Failed, Some("export failed"))
            .await
            .unwrap();

        let latest = jobs.latest().await.unwrap().unwrap();
        assert_eq!(latest.outcome, Outcome::Failed);
        assert_eq!(latest.detail.as_deref(), Some("export failed"));
        assert_eq!(latest.guild_id, None);
        assert_eq!(jobs.recent(10).await.unwrap().len(), 1);
    }

    async fn backdate(jobs: &JobStore, id: &str, age: Duration) {
        sqlx::query("UPDATE jobs SET updated_at = ? WHERE id = ?")
            .bind((Utc::now() - age).timestamp_millis())
            .bind(id)
            .execute(&jobs.pool)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stale_running_job_is_failed_on_readiness() {
        let jobs = jobs().await.with_stale_after(Duration::minutes(20));
        let job = jobs.start("42", None, "general", "local").await.unwrap();
        assert_eq!(jobs.readiness().await.unwrap(), Readiness::Busy);

        backdate(&jobs, &job.id, Duration::minutes(21)).await;
        assert_eq!(jobs.readiness().await.unwrap(), Readiness::Ready);

        let latest = jobs.latest().await.unwrap().unwrap();
        assert_eq!(latest.outcome, Outcome::Failed);
        assert_eq!(latest.detail.as_deref(), Some(ABANDONED_DETAIL));
    }

    #[tokio::test]
    async fn old_running_job_without_bound_stays_busy() {
        let jobs = jobs().await;
        let job = jobs.start("42", None, "general", "local").await.unwrap();
        backdate(&jobs, &job.id, Duration::days(2)).await;
        assert_eq!(jobs.readiness().await.unwrap(), Readiness::Busy);
    }

    #[tokio::test]
    async fn abandoned_jobs_are_failed() {
        let jobs = jobs().await;
        jobs.start("42", None, "general", "remote").await.unwrap();
        assert_eq!(jobs.abandon_running().await.unwrap(), 1);
        assert_eq!(jobs.readiness().await.unwrap(), Readiness::Ready);
        assert_eq!(jobs.abandon_running().await.unwrap(), 0);
    }
}
