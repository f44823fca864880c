use crate::config::ProjectorConfig;
use crate::errors::{LedgerEngineError, Result};
use crate::metrics;
use crate::models::{Direction, EventRecord, TransactionPostedPayload};
use crate::validation::parse_amount;
use rust_decimal::Decimal;
use sqlx::postgres::PgPool;
use sqlx::{Postgres, Transaction};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};
use uuid::Uuid;

/// Single-consumer tailer of the event log. Each pass runs in one database
/// transaction: read the durable offset, apply a batch of events in
/// `(created_at, id)` order, advance the offset, commit. Any error aborts
/// the pass without advancing the offset and the next tick retries.
pub struct Projector {
    pool: PgPool,
    name: String,
    batch_size: i64,
    poll_interval: Duration,
}

impl Projector {
    pub fn new(pool: PgPool, cfg: &ProjectorConfig) -> Self {
        Projector {
            pool,
            name: cfg.name.clone(),
            batch_size: cfg.batch_size,
            poll_interval: Duration::from_millis(cfg.poll_interval_ms),
        }
    }

    /// Endless tail loop. Returns when the shutdown signal fires; an
    /// in-flight pass commits or rolls back normally first.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        info!("projector '{}' starting", self.name);

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("projector '{}' stopping", self.name);
                    return;
                }
                _ = ticker.tick() => {
                    match self.project_batch().await {
                        Ok(applied) => {
                            if applied > 0 {
                                metrics::PROJECTED_EVENTS.inc_by(applied);
                            }
                        }
                        Err(e) => {
                            metrics::PROJECTION_ERRORS.inc();
                            error!("projection error: {}", e);
                        }
                    }
                    if let Err(e) = self.update_lag_gauge().await {
                        error!("projector lag probe failed: {}", e);
                    }
                }
            }
        }
    }

    /// One pass. Returns the number of events applied.
    pub async fn project_batch(&self) -> Result<u64> {
        let mut tx = self.pool.begin().await?;

        let offset: i64 = sqlx::query_scalar(
            r#"
            SELECT last_processed_event_id
            FROM projector_offsets
            WHERE projector_name = $1
            "#,
        )
        .bind(&self.name)
        .fetch_optional(&mut *tx)
        .await?
        .unwrap_or(0);

        let events = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT id, ledger_id, aggregate_type, aggregate_id, event_type,
                   payload, occurred_at, created_at, idempotency_key
            FROM events
            WHERE event_type = 'TransactionPosted'
              AND id > $1
            ORDER BY created_at, id
            LIMIT $2
            "#,
        )
        .bind(offset)
        .bind(self.batch_size)
        .fetch_all(&mut *tx)
        .await?;

        if events.is_empty() {
            tx.commit().await?;
            return Ok(0);
        }

        for event in &events {
            self.apply_transaction_posted(&mut tx, event).await?;
        }

        let max_event_id = events.last().map(|e| e.id).unwrap_or(offset);

        sqlx::query(
            r#"
            INSERT INTO projector_offsets (projector_name, last_processed_event_id, updated_at)
            VALUES ($1, $2, NOW())
            ON CONFLICT (projector_name)
            DO UPDATE SET last_processed_event_id = EXCLUDED.last_processed_event_id,
                          updated_at = NOW()
            "#,
        )
        .bind(&self.name)
        .bind(max_event_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(events.len() as u64)
    }

    async fn apply_transaction_posted(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        event: &EventRecord,
    ) -> Result<()> {
        let payload: TransactionPostedPayload = serde_json::from_value(event.payload.clone())
            .map_err(|e| {
                LedgerEngineError::Internal(format!("bad payload on event {}: {}", event.id, e))
            })?;

        // The transaction total, denormalized onto the row.
        let mut total = Decimal::ZERO;
        for posting in &payload.postings {
            if posting.direction == "debit" {
                total += parse_amount(&posting.amount)?;
            }
        }

        // The insert is the per-event idempotency gate: a replay after a
        // crash between apply and offset advance hits the primary key and
        // skips the rest, so balances are never double-counted.
        let tag = sqlx::query(
            r#"
            INSERT INTO transactions (id, ledger_id, external_id, amount, currency, occurred_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id, ledger_id) DO NOTHING
            "#,
        )
        .bind(payload.transaction_id)
        .bind(event.ledger_id)
        .bind(&payload.external_id)
        .bind(total)
        .bind(&payload.currency)
        .bind(payload.occurred_at)
        .execute(&mut **tx)
        .await?;

        if tag.rows_affected() == 0 {
            return Ok(());
        }

        for posting in &payload.postings {
            let account_id: Option<Uuid> = sqlx::query_scalar(
                r#"
                SELECT id FROM accounts WHERE ledger_id = $1 AND code = $2
                "#,
            )
            .bind(event.ledger_id)
            .bind(&posting.account_code)
            .fetch_optional(&mut **tx)
            .await?;

            let account_id = account_id.ok_or_else(|| {
                LedgerEngineError::UnknownAccount(posting.account_code.clone())
            })?;

            let direction = Direction::parse(&posting.direction)
                .ok_or_else(|| LedgerEngineError::InvalidDirection(posting.direction.clone()))?;
            let amount = parse_amount(&posting.amount)?;

            sqlx::query(
                r#"
                INSERT INTO postings (id, ledger_id, transaction_id, account_id, amount, direction)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(event.ledger_id)
            .bind(payload.transaction_id)
            .bind(account_id)
            .bind(amount)
            .bind(direction)
            .execute(&mut **tx)
            .await?;

            // credit = +, debit = -; arithmetic happens in NUMERIC, never
            // in binary floats.
            sqlx::query(
                r#"
                UPDATE accounts SET balance = balance + $1 WHERE id = $2
                "#,
            )
            .bind(direction.signed(amount))
            .bind(account_id)
            .execute(&mut **tx)
            .await?;
        }

        Ok(())
    }

    /// Lag, `max(event_id) - offset`, is the primary health metric.
    async fn update_lag_gauge(&self) -> Result<()> {
        let row: (i64, i64) = sqlx::query_as(
            r#"
            SELECT
                COALESCE((SELECT MAX(id) FROM events WHERE event_type = 'TransactionPosted'), 0),
                COALESCE((SELECT last_processed_event_id
                          FROM projector_offsets
                          WHERE projector_name = $1), 0)
            "#,
        )
        .bind(&self.name)
        .fetch_one(&self.pool)
        .await?;

        metrics::PROJECTOR_LAG.set((row.0 - row.1).max(0));
        Ok(())
    }
}
