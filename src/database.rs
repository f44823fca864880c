use crate::errors::Result;
use crate::models::{
    Account, BalanceSummaryResponse, EventRecord, PostingDetail, TransactionRow, WebhookDeliveryResponse,
    WebhookEndpoint,
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::{Postgres, Row, Transaction};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

pub struct Database {
    pool: PgPool,
}

impl Database {
    pub async fn new(database_url: &str, max_connections: u32, min_connections: u32) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await?;

        Ok(Database { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    // --- command path (transaction-scoped) ---

    /// Idempotency probe: the aggregate id of an existing event with this
    /// key, if one was already committed.
    pub async fn find_event_by_idempotency_key_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ledger_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            r#"
            SELECT aggregate_id
            FROM events
            WHERE ledger_id = $1
              AND idempotency_key = $2
            "#,
        )
        .bind(ledger_id)
        .bind(idempotency_key)
        .fetch_optional(&mut **tx)
        .await?;

        Ok(row.map(|r| r.get("aggregate_id")))
    }

    /// Pool-scoped variant, used to resolve a concurrent-duplicate unique
    /// violation after the losing transaction has rolled back.
    pub async fn find_event_by_idempotency_key(
        &self,
        ledger_id: Uuid,
        idempotency_key: &str,
    ) -> Result<Option<Uuid>> {
        let row = sqlx::query(
            r#"
            SELECT aggregate_id
            FROM events
            WHERE ledger_id = $1
              AND idempotency_key = $2
            "#,
        )
        .bind(ledger_id)
        .bind(idempotency_key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("aggregate_id")))
    }

    /// Locks the referenced accounts in ascending code order. The caller
    /// passes codes already deduplicated and sorted; the sort is the global
    /// deadlock-avoidance discipline for overlapping account sets.
    pub async fn load_and_lock_accounts(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ledger_id: Uuid,
        codes: &[String],
    ) -> Result<HashMap<String, Account>> {
        let rows = sqlx::query_as::<_, Account>(
            r#"
            SELECT id, ledger_id, code, name, type, balance, created_at
            FROM accounts
            WHERE ledger_id = $1
              AND code = ANY($2)
            ORDER BY code
            FOR UPDATE
            "#,
        )
        .bind(ledger_id)
        .bind(codes)
        .fetch_all(&mut **tx)
        .await?;

        Ok(rows.into_iter().map(|a| (a.code.clone(), a)).collect())
    }

    /// Appends one event row, returning its id. Exposes the raw sqlx error
    /// so the command service can detect the idempotency unique violation
    /// raised by a concurrent duplicate.
    #[allow(clippy::too_many_arguments)]
    pub async fn append_event(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        ledger_id: Uuid,
        aggregate_type: &str,
        aggregate_id: Uuid,
        event_type: &str,
        payload: &serde_json::Value,
        occurred_at: DateTime<Utc>,
        idempotency_key: Option<&str>,
    ) -> std::result::Result<i64, sqlx::Error> {
        let row = sqlx::query(
            r#"
            INSERT INTO events (
                ledger_id, aggregate_type, aggregate_id, event_type,
                payload, occurred_at, idempotency_key
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id
            "#,
        )
        .bind(ledger_id)
        .bind(aggregate_type)
        .bind(aggregate_id)
        .bind(event_type)
        .bind(payload)
        .bind(occurred_at)
        .bind(idempotency_key)
        .fetch_one(&mut **tx)
        .await?;

        Ok(row.get("id"))
    }

    // --- principal resolution ---

    /// Resolves an API-key hash to `(api_key_id, ledger_id)`.
    pub async fn find_principal_by_key_hash(
        &self,
        key_hash: &str,
    ) -> Result<Option<(Uuid, Uuid)>> {
        let row = sqlx::query(
            r#"
            SELECT id, ledger_id
            FROM api_keys
            WHERE key_hash = $1
              AND is_active = TRUE
              AND revoked_at IS NULL
            "#,
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| (r.get("id"), r.get("ledger_id"))))
    }

    // --- accounts ---

    pub async fn create_account(
        &self,
        ledger_id: Uuid,
        code: &str,
        name: &str,
        account_type: &str,
    ) -> std::result::Result<Account, sqlx::Error> {
        sqlx::query_as::<_, Account>(
            r#"
            INSERT INTO accounts (ledger_id, code, name, type, balance)
            VALUES ($1, $2, $3, $4, 0)
            RETURNING id, ledger_id, code, name, type, balance, created_at
            "#,
        )
        .bind(ledger_id)
        .bind(code)
        .bind(name)
        .bind(account_type)
        .fetch_one(&self.pool)
        .await
    }

    pub async fn get_account(&self, ledger_id: Uuid, code: &str) -> Result<Option<Account>> {
        let account = sqlx::query_as::<_, Account>(
            r#"
            SELECT id, ledger_id, code, name, type, balance, created_at
            FROM accounts
            WHERE ledger_id = $1 AND code = $2
            "#,
        )
        .bind(ledger_id)
        .bind(code)
        .fetch_optional(&self.pool)
        .await?;

        Ok(account)
    }

    pub async fn list_accounts(&self, ledger_id: Uuid) -> Result<Vec<Account>> {
        let accounts = sqlx::query_as::<_, Account>(
            r#"
            SELECT id, ledger_id, code, name, type, balance, created_at
            FROM accounts
            WHERE ledger_id = $1
            ORDER BY code
            "#,
        )
        .bind(ledger_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(accounts)
    }

    pub async fn balance_summary(&self, ledger_id: Uuid) -> Result<BalanceSummaryResponse> {
        let rows = sqlx::query(
            r#"
            SELECT type, COALESCE(SUM(balance), 0) AS total
            FROM accounts
            WHERE ledger_id = $1
            GROUP BY type
            "#,
        )
        .bind(ledger_id)
        .fetch_all(&self.pool)
        .await?;

        let mut summary = BalanceSummaryResponse {
            total_assets: Decimal::ZERO,
            total_liabilities: Decimal::ZERO,
            total_equity: Decimal::ZERO,
            total_revenue: Decimal::ZERO,
            total_expenses: Decimal::ZERO,
            by_type: HashMap::new(),
        };

        for row in rows {
            let account_type: String = row.get("type");
            let total: Decimal = row.get("total");
            summary.by_type.insert(account_type.clone(), total);

            match account_type.as_str() {
                "asset" => summary.total_assets = total,
                "liability" => summary.total_liabilities = total,
                "equity" => summary.total_equity = total,
                "revenue" => summary.total_revenue = total,
                "expense" => summary.total_expenses = total,
                _ => {}
            }
        }

        Ok(summary)
    }

    // --- transactions (read model) ---

    pub async fn get_transaction(
        &self,
        ledger_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Option<TransactionRow>> {
        let txn = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT id, ledger_id, external_id, amount, currency, occurred_at, created_at
            FROM transactions
            WHERE ledger_id = $1 AND id = $2
            "#,
        )
        .bind(ledger_id)
        .bind(transaction_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(txn)
    }

    /// Newest-first page over `(created_at, id)`, fetching one extra row so
    /// the caller can tell whether more remain.
    pub async fn list_transactions(
        &self,
        ledger_id: Uuid,
        cursor: Option<(DateTime<Utc>, Uuid)>,
        start_time: Option<DateTime<Utc>>,
        end_time: Option<DateTime<Utc>>,
        limit: i64,
    ) -> Result<Vec<TransactionRow>> {
        let (cursor_ts, cursor_id) = match cursor {
            Some((ts, id)) => (Some(ts), Some(id)),
            None => (None, None),
        };

        let rows = sqlx::query_as::<_, TransactionRow>(
            r#"
            SELECT id, ledger_id, external_id, amount, currency, occurred_at, created_at
            FROM transactions
            WHERE ledger_id = $1
              AND ($2::timestamptz IS NULL OR (created_at, id) < ($2, $3))
              AND ($4::timestamptz IS NULL OR occurred_at >= $4)
              AND ($5::timestamptz IS NULL OR occurred_at <= $5)
            ORDER BY created_at DESC, id DESC
            LIMIT $6
            "#,
        )
        .bind(ledger_id)
        .bind(cursor_ts)
        .bind(cursor_id)
        .bind(start_time)
        .bind(end_time)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    pub async fn load_postings(
        &self,
        ledger_id: Uuid,
        transaction_id: Uuid,
    ) -> Result<Vec<PostingDetail>> {
        let rows = sqlx::query(
            r#"
            SELECT p.id, a.code, a.name, p.direction, p.amount
            FROM postings p
            JOIN accounts a ON a.id = p.account_id
            WHERE p.ledger_id = $1 AND p.transaction_id = $2
            ORDER BY p.created_at
            "#,
        )
        .bind(ledger_id)
        .bind(transaction_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(|r| PostingDetail {
                id: r.get("id"),
                account_code: r.get("code"),
                account_name: r.get("name"),
                direction: r.get("direction"),
                amount: r.get("amount"),
            })
            .collect())
    }

    // --- events (read side) ---

    pub async fn get_event(&self, ledger_id: Uuid, event_id: i64) -> Result<Option<EventRecord>> {
        let event = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT id, ledger_id, aggregate_type, aggregate_id, event_type,
                   payload, occurred_at, created_at, idempotency_key
            FROM events
            WHERE ledger_id = $1 AND id = $2
            "#,
        )
        .bind(ledger_id)
        .bind(event_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(event)
    }

    pub async fn list_events(
        &self,
        ledger_id: Uuid,
        cursor: Option<(DateTime<Utc>, i64)>,
        event_type: Option<&str>,
        aggregate_id: Option<Uuid>,
        limit: i64,
    ) -> Result<Vec<EventRecord>> {
        let (cursor_ts, cursor_id) = match cursor {
            Some((ts, id)) => (Some(ts), Some(id)),
            None => (None, None),
        };

        let rows = sqlx::query_as::<_, EventRecord>(
            r#"
            SELECT id, ledger_id, aggregate_type, aggregate_id, event_type,
                   payload, occurred_at, created_at, idempotency_key
            FROM events
            WHERE ledger_id = $1
              AND ($2::timestamptz IS NULL OR (created_at, id) < ($2, $3))
              AND ($4::text IS NULL OR event_type = $4)
              AND ($5::uuid IS NULL OR aggregate_id = $5)
            ORDER BY created_at DESC, id DESC
            LIMIT $6
            "#,
        )
        .bind(ledger_id)
        .bind(cursor_ts)
        .bind(cursor_id)
        .bind(event_type)
        .bind(aggregate_id)
        .bind(limit + 1)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    // --- webhook endpoints and deliveries ---

    pub async fn create_webhook_endpoint(
        &self,
        ledger_id: Uuid,
        url: &str,
        secret: &str,
    ) -> Result<Uuid> {
        let row = sqlx::query(
            r#"
            INSERT INTO webhook_endpoints (ledger_id, url, secret, is_active)
            VALUES ($1, $2, $3, TRUE)
            RETURNING id
            "#,
        )
        .bind(ledger_id)
        .bind(url)
        .bind(secret)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get("id"))
    }

    pub async fn list_webhook_endpoints(&self, ledger_id: Uuid) -> Result<Vec<WebhookEndpoint>> {
        let endpoints = sqlx::query_as::<_, WebhookEndpoint>(
            r#"
            SELECT id, ledger_id, url, secret, is_active, created_at
            FROM webhook_endpoints
            WHERE ledger_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(ledger_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(endpoints)
    }

    pub async fn active_webhook_endpoints(&self, ledger_id: Uuid) -> Result<Vec<WebhookEndpoint>> {
        let endpoints = sqlx::query_as::<_, WebhookEndpoint>(
            r#"
            SELECT id, ledger_id, url, secret, is_active, created_at
            FROM webhook_endpoints
            WHERE ledger_id = $1
              AND is_active = TRUE
            "#,
        )
        .bind(ledger_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(endpoints)
    }

    /// The webhook worker's event load. The outbox invariant guarantees the
    /// event exists; a miss is a non-retryable fault.
    pub async fn load_event_payload(
        &self,
        event_id: i64,
        ledger_id: Uuid,
    ) -> Result<Option<serde_json::Value>> {
        let row = sqlx::query(
            r#"
            SELECT payload
            FROM events
            WHERE id = $1 AND ledger_id = $2
            "#,
        )
        .bind(event_id)
        .bind(ledger_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.get("payload")))
    }

    /// Per-endpoint idempotency: has this event already been delivered to
    /// this endpoint successfully?
    pub async fn has_successful_delivery(&self, event_id: i64, endpoint_id: Uuid) -> Result<bool> {
        let exists: bool = sqlx::query_scalar(
            r#"
            SELECT EXISTS (
                SELECT 1
                FROM webhook_deliveries
                WHERE event_id = $1
                  AND webhook_endpoint_id = $2
                  AND status = 'success'
            )
            "#,
        )
        .bind(event_id)
        .bind(endpoint_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(exists)
    }

    pub async fn record_delivery(
        &self,
        event_id: i64,
        endpoint_id: Uuid,
        status: &str,
        attempt: i32,
        http_status: i32,
        error_message: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO webhook_deliveries (
                id, event_id, webhook_endpoint_id, status,
                attempt, last_attempt_at, http_status, error_message
            )
            VALUES ($1, $2, $3, $4, $5, NOW(), $6, NULLIF($7, ''))
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(event_id)
        .bind(endpoint_id)
        .bind(status)
        .bind(attempt)
        .bind(http_status)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn list_webhook_deliveries(
        &self,
        ledger_id: Uuid,
        limit: i64,
    ) -> Result<Vec<WebhookDeliveryResponse>> {
        let deliveries = sqlx::query_as::<_, WebhookDeliveryResponse>(
            r#"
            SELECT
                wd.id,
                wd.event_id,
                wd.webhook_endpoint_id,
                we.url AS endpoint_url,
                wd.status,
                wd.attempt,
                wd.last_attempt_at,
                wd.http_status,
                wd.error_message
            FROM webhook_deliveries wd
            JOIN webhook_endpoints we ON we.id = wd.webhook_endpoint_id
            WHERE we.ledger_id = $1
            ORDER BY wd.last_attempt_at DESC
            LIMIT $2
            "#,
        )
        .bind(ledger_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(deliveries)
    }
}
