use crate::config::OutboxConfig;
use crate::errors::Result;
use crate::metrics;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sqlx::postgres::PgPool;
use sqlx::{FromRow, Postgres, Transaction};
use std::time::Duration;
use tracing::warn;
use uuid::Uuid;

pub const KIND_WEBHOOK_DELIVERY: &str = "webhook_delivery";

/// A claimed unit of work. `attempt` is the current attempt number,
/// starting at 1 on the first claim.
#[derive(Debug, Clone, FromRow)]
pub struct OutboxJob {
    pub id: i64,
    pub kind: String,
    pub event_id: i64,
    pub ledger_id: Uuid,
    pub state: String,
    pub attempt: i32,
    pub max_attempts: i32,
    pub run_at: DateTime<Utc>,
    pub attempted_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

/// Exponential backoff with jitter between retries.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay_ms: 2000,
            max_delay_ms: 300_000,
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the next run of a job that has failed `attempt` times.
    pub fn delay(&self, attempt: i32) -> Duration {
        let exponent = attempt.saturating_sub(1).max(0);
        let base_delay =
            self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);

        let capped_delay = base_delay.min(self.max_delay_ms as f64);

        // Jitter to prevent thundering herd
        let jitter_range = capped_delay * self.jitter_factor;
        let jitter = (rand::random::<f64>() - 0.5) * jitter_range * 2.0;
        let final_delay = (capped_delay + jitter).max(0.0);

        Duration::from_millis(final_delay as u64)
    }
}

/// Durable at-least-once work queue on the shared store. Jobs are enqueued
/// in the same database transaction as the event they announce, so either
/// both are durable or neither is.
pub struct OutboxQueue {
    pool: PgPool,
    backoff: BackoffPolicy,
    max_attempts: i32,
    lease_timeout: ChronoDuration,
}

impl OutboxQueue {
    pub fn new(pool: PgPool, cfg: &OutboxConfig) -> Self {
        Self {
            pool,
            backoff: BackoffPolicy {
                initial_delay_ms: cfg.initial_backoff_ms,
                max_delay_ms: cfg.max_backoff_ms,
                ..BackoffPolicy::default()
            },
            max_attempts: cfg.max_attempts,
            lease_timeout: ChronoDuration::seconds(cfg.lease_timeout_secs),
        }
    }

    /// Enqueues a job inside the caller's transaction.
    pub async fn enqueue_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        kind: &str,
        event_id: i64,
        ledger_id: Uuid,
    ) -> std::result::Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as(
            r#"
            INSERT INTO outbox_jobs (kind, event_id, ledger_id, state, max_attempts)
            VALUES ($1, $2, $3, 'available', $4)
            RETURNING id
            "#,
        )
        .bind(kind)
        .bind(event_id)
        .bind(ledger_id)
        .bind(self.max_attempts)
        .fetch_one(&mut **tx)
        .await?;

        metrics::OUTBOX_JOBS.with_label_values(&["enqueued"]).inc();
        Ok(row.0)
    }

    /// Claims up to `n` due jobs for exclusive execution. Claiming moves a
    /// job to `running` and bumps its attempt counter; `running` jobs whose
    /// lease expired are reclaimed the same way, which is what makes the
    /// queue at-least-once across worker crashes.
    pub async fn fetch(&self, n: i64) -> Result<Vec<OutboxJob>> {
        let lease_cutoff = Utc::now() - self.lease_timeout;

        let jobs = sqlx::query_as::<_, OutboxJob>(
            r#"
            UPDATE outbox_jobs
            SET state = 'running',
                attempt = attempt + 1,
                attempted_at = NOW()
            WHERE id IN (
                SELECT id
                FROM outbox_jobs
                WHERE (state IN ('available', 'retryable') AND run_at <= NOW())
                   OR (state = 'running' AND attempted_at < $1)
                ORDER BY run_at, id
                LIMIT $2
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, kind, event_id, ledger_id, state, attempt,
                      max_attempts, run_at, attempted_at, last_error
            "#,
        )
        .bind(lease_cutoff)
        .bind(n)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    pub async fn complete(&self, job: &OutboxJob) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_jobs
            SET state = 'completed', finalized_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        metrics::OUTBOX_JOBS.with_label_values(&["completed"]).inc();
        Ok(())
    }

    /// Schedules a failed job for another attempt, or discards it once its
    /// attempts are exhausted.
    pub async fn retry(&self, job: &OutboxJob, reason: &str) -> Result<()> {
        if job.attempt >= job.max_attempts {
            warn!(
                job_id = job.id,
                attempt = job.attempt,
                "job exhausted its attempts, discarding: {}",
                reason
            );
            return self.discard(job, reason).await;
        }

        let delay = self.backoff.delay(job.attempt);
        let run_at = Utc::now() + ChronoDuration::milliseconds(delay.as_millis() as i64);

        sqlx::query(
            r#"
            UPDATE outbox_jobs
            SET state = 'retryable', run_at = $1, last_error = $2
            WHERE id = $3
            "#,
        )
        .bind(run_at)
        .bind(reason)
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        metrics::OUTBOX_JOBS.with_label_values(&["retried"]).inc();
        Ok(())
    }

    pub async fn discard(&self, job: &OutboxJob, reason: &str) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE outbox_jobs
            SET state = 'discarded', finalized_at = NOW(), last_error = $1
            WHERE id = $2
            "#,
        )
        .bind(reason)
        .bind(job.id)
        .execute(&self.pool)
        .await?;

        metrics::OUTBOX_JOBS.with_label_values(&["discarded"]).inc();
        Ok(())
    }
}
