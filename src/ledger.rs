use crate::database::Database;
use crate::errors::{LedgerEngineError, Result};
use crate::metrics;
use crate::models::{PostTransactionCommand, TransactionPostedPayload};
use crate::outbox::{OutboxQueue, KIND_WEBHOOK_DELIVERY};
use crate::validation::validate_double_entry;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;
use uuid::Uuid;

/// The ledger command service. One operation: `post_transaction`, which
/// admits, validates and commits a transaction as a single event append
/// plus outbox enqueue inside one database transaction.
pub struct LedgerService {
    db: Arc<Database>,
    queue: Arc<OutboxQueue>,
}

impl LedgerService {
    pub fn new(db: Arc<Database>, queue: Arc<OutboxQueue>) -> Self {
        LedgerService { db, queue }
    }

    /// Returns the transaction id. Replays with the same idempotency key
    /// return the original id and are indistinguishable from a fresh
    /// accept.
    pub async fn post_transaction(&self, cmd: PostTransactionCommand) -> Result<Uuid> {
        let started = Instant::now();
        let result = self.post_transaction_inner(cmd).await;

        let outcome = match &result {
            Ok(_) => "accepted",
            Err(e) if e.is_transient() => "error",
            Err(_) => "rejected",
        };
        metrics::COMMAND_DURATION
            .with_label_values(&[outcome])
            .observe(started.elapsed().as_secs_f64());

        result
    }

    async fn post_transaction_inner(&self, cmd: PostTransactionCommand) -> Result<Uuid> {
        let mut tx = self.db.begin().await?;

        // Idempotency probe
        if !cmd.idempotency_key.is_empty() {
            if let Some(existing) = self
                .db
                .find_event_by_idempotency_key_tx(&mut tx, cmd.ledger_id, &cmd.idempotency_key)
                .await?
            {
                metrics::IDEMPOTENT_REPLAYS.inc();
                return Ok(existing);
            }
        }

        // Load and lock accounts in ascending code order
        let mut codes: Vec<String> = cmd
            .postings
            .iter()
            .map(|p| p.account_code.clone())
            .collect();
        codes.sort();
        codes.dedup();

        let accounts = self
            .db
            .load_and_lock_accounts(&mut tx, cmd.ledger_id, &codes)
            .await?;

        if accounts.len() != codes.len() {
            let missing = codes
                .iter()
                .find(|c| !accounts.contains_key(*c))
                .cloned()
                .unwrap_or_default();
            return Err(LedgerEngineError::UnknownAccount(missing));
        }

        // Validate double-entry
        validate_double_entry(&cmd.postings, &accounts)?;

        // Append event
        let transaction_id = Uuid::new_v4();
        let payload = serde_json::to_value(TransactionPostedPayload {
            transaction_id,
            external_id: cmd.external_id.clone(),
            currency: cmd.currency.clone(),
            occurred_at: cmd.occurred_at,
            postings: cmd.postings.clone(),
        })
        .map_err(|e| LedgerEngineError::Internal(e.to_string()))?;

        let idempotency_key = if cmd.idempotency_key.is_empty() {
            None
        } else {
            Some(cmd.idempotency_key.as_str())
        };

        let event_id = match self
            .db
            .append_event(
                &mut tx,
                cmd.ledger_id,
                "ledger",
                transaction_id,
                "TransactionPosted",
                &payload,
                cmd.occurred_at,
                idempotency_key,
            )
            .await
        {
            Ok(id) => id,
            Err(e) if is_idempotency_conflict(&e) => {
                // A concurrent submission with the same key won the race.
                // Roll back and answer with the winner's transaction id.
                drop(tx);
                if let Some(existing) = self
                    .db
                    .find_event_by_idempotency_key(cmd.ledger_id, &cmd.idempotency_key)
                    .await?
                {
                    metrics::IDEMPOTENT_REPLAYS.inc();
                    return Ok(existing);
                }
                return Err(e.into());
            }
            Err(e) => return Err(e.into()),
        };

        // Enqueue the delivery job on the same transaction handle
        self.queue
            .enqueue_tx(&mut tx, KIND_WEBHOOK_DELIVERY, event_id, cmd.ledger_id)
            .await
            .map_err(|e| LedgerEngineError::Queue(e.to_string()))?;

        tx.commit().await?;

        metrics::TRANSACTIONS_POSTED.inc();
        info!(
            "accepted transaction {} on ledger {} (event {})",
            transaction_id, cmd.ledger_id, event_id
        );

        Ok(transaction_id)
    }
}

fn is_idempotency_conflict(e: &sqlx::Error) -> bool {
    matches!(
        e,
        sqlx::Error::Database(db) if db.constraint() == Some("events_ledger_idempotency_key")
    )
}
