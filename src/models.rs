use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Closed set of account types. The core only reads accounts; creation is
/// administrative.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    Asset,
    Liability,
    Equity,
    Revenue,
    Expense,
}

impl AccountType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "asset" => Some(AccountType::Asset),
            "liability" => Some(AccountType::Liability),
            "equity" => Some(AccountType::Equity),
            "revenue" => Some(AccountType::Revenue),
            "expense" => Some(AccountType::Expense),
            _ => None,
        }
    }
}

/// Posting leg direction. Credits add to a balance, debits subtract.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Debit,
    Credit,
}

impl Direction {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debit" => Some(Direction::Debit),
            "credit" => Some(Direction::Credit),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Debit => "debit",
            Direction::Credit => "credit",
        }
    }

    /// Signed contribution of an amount to an account balance.
    pub fn signed(&self, amount: Decimal) -> Decimal {
        match self {
            Direction::Credit => amount,
            Direction::Debit => -amount,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Account {
    pub id: Uuid,
    pub ledger_id: Uuid,
    pub code: String,
    pub name: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub account_type: AccountType,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
}

/// One row of the append-only event log.
#[derive(Debug, Clone, FromRow)]
pub struct EventRecord {
    pub id: i64,
    pub ledger_id: Uuid,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub idempotency_key: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TransactionRow {
    pub id: Uuid,
    pub ledger_id: Uuid,
    pub external_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub struct WebhookEndpoint {
    pub id: Uuid,
    pub ledger_id: Uuid,
    pub url: String,
    pub secret: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// A single posting leg as supplied by the caller. Stored verbatim in the
/// event payload; amounts stay decimal strings so the payload bytes are
/// canonical.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PostingInput {
    pub account_code: String,
    pub direction: String,
    pub amount: String,
}

#[derive(Debug, Clone)]
pub struct PostTransactionCommand {
    pub ledger_id: Uuid,
    pub external_id: String,
    pub idempotency_key: String,
    pub currency: String,
    pub occurred_at: DateTime<Utc>,
    pub postings: Vec<PostingInput>,
}

/// Payload of a `TransactionPosted` event, as written by the command
/// service and read back by the projector and webhook worker. The stored
/// JSON bytes are canonical: webhook signatures cover them exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionPostedPayload {
    pub transaction_id: Uuid,
    pub external_id: String,
    pub currency: String,
    #[serde(with = "rfc3339_nanos")]
    pub occurred_at: DateTime<Utc>,
    pub postings: Vec<PostingInput>,
}

/// RFC3339 with nanosecond precision in UTC, e.g.
/// `2024-01-01T12:00:00.000000000Z`.
pub mod rfc3339_nanos {
    use chrono::{DateTime, SecondsFormat, Utc};
    use serde::{self, Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&value.to_rfc3339_opts(SecondsFormat::Nanos, true))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw = String::deserialize(deserializer)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|dt| dt.with_timezone(&Utc))
            .map_err(serde::de::Error::custom)
    }
}

// --- wire: inbound ---

#[derive(Debug, Deserialize)]
pub struct PostTransactionRequest {
    #[serde(default)]
    pub idempotency_key: String,
    #[serde(default)]
    pub external_id: String,
    pub currency: String,
    pub occurred_at: DateTime<Utc>,
    pub postings: Vec<PostingInput>,
}

#[derive(Debug, Serialize)]
pub struct PostTransactionResponse {
    pub transaction_id: Uuid,
    pub status: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateAccountRequest {
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub account_type: String,
}

#[derive(Debug, Deserialize)]
pub struct CreateWebhookEndpointRequest {
    pub url: String,
}

// --- wire: outbound ---

#[derive(Debug, Serialize)]
pub struct AccountResponse {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    #[serde(rename = "type")]
    pub account_type: AccountType,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
}

impl From<Account> for AccountResponse {
    fn from(a: Account) -> Self {
        AccountResponse {
            id: a.id,
            code: a.code,
            name: a.name,
            account_type: a.account_type,
            balance: a.balance,
            created_at: a.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PostingDetail {
    pub id: Uuid,
    pub account_code: String,
    pub account_name: String,
    pub direction: Direction,
    pub amount: Decimal,
}

#[derive(Debug, Serialize)]
pub struct TransactionResponse {
    pub id: Uuid,
    pub external_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub postings: Vec<PostingDetail>,
}

#[derive(Debug, Serialize)]
pub struct EventResponse {
    pub id: i64,
    pub aggregate_type: String,
    pub aggregate_id: Uuid,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub occurred_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

impl From<EventRecord> for EventResponse {
    fn from(e: EventRecord) -> Self {
        EventResponse {
            id: e.id,
            aggregate_type: e.aggregate_type,
            aggregate_id: e.aggregate_id,
            event_type: e.event_type,
            payload: e.payload,
            occurred_at: e.occurred_at,
            created_at: e.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct BalanceSummaryResponse {
    pub total_assets: Decimal,
    pub total_liabilities: Decimal,
    pub total_equity: Decimal,
    pub total_revenue: Decimal,
    pub total_expenses: Decimal,
    pub by_type: std::collections::HashMap<String, Decimal>,
}

#[derive(Debug, Serialize)]
pub struct WebhookEndpointResponse {
    pub id: Uuid,
    pub url: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

/// The secret is returned exactly once, at creation time.
#[derive(Debug, Serialize)]
pub struct CreateWebhookEndpointResponse {
    pub id: Uuid,
    pub url: String,
    pub secret: String,
}

#[derive(Debug, Serialize, FromRow)]
pub struct WebhookDeliveryResponse {
    pub id: Uuid,
    pub event_id: i64,
    pub webhook_endpoint_id: Uuid,
    pub endpoint_url: String,
    pub status: String,
    pub attempt: i32,
    pub last_attempt_at: DateTime<Utc>,
    pub http_status: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PaginationResponse {
    pub has_more: bool,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub continuation_token: String,
    pub count: usize,
}
