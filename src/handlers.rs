use crate::auth::Principal;
use crate::database::Database;
use crate::errors::LedgerEngineError;
use crate::ledger::LedgerService;
use crate::metrics;
use crate::models::{
    AccountType, CreateAccountRequest, CreateWebhookEndpointRequest, CreateWebhookEndpointResponse,
    EventResponse, PaginationResponse, PostTransactionCommand, PostTransactionRequest,
    PostTransactionResponse, TransactionResponse, TransactionRow, WebhookEndpointResponse,
};
use crate::webhook::generate_webhook_secret;
use actix_web::{web, HttpResponse};
use base64::engine::general_purpose::URL_SAFE as BASE64_URL;
use base64::Engine;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

type HandlerResult = Result<HttpResponse, LedgerEngineError>;

// --- pagination ---

#[derive(Debug, Serialize, Deserialize)]
struct Cursor<T> {
    timestamp: DateTime<Utc>,
    id: T,
}

fn encode_cursor<T: Serialize>(cursor: &Cursor<T>) -> String {
    BASE64_URL.encode(serde_json::to_vec(cursor).unwrap_or_default())
}

fn decode_cursor<T: DeserializeOwned>(
    token: &Option<String>,
) -> Result<Option<Cursor<T>>, LedgerEngineError> {
    let token = match token.as_deref() {
        None | Some("") => return Ok(None),
        Some(t) => t,
    };

    let raw = BASE64_URL
        .decode(token)
        .map_err(|_| LedgerEngineError::InvalidCursor)?;
    let cursor = serde_json::from_slice(&raw).map_err(|_| LedgerEngineError::InvalidCursor)?;
    Ok(Some(cursor))
}

fn validate_limit(limit: Option<i64>) -> i64 {
    match limit {
        Some(l) if l > 1000 => 1000,
        Some(l) if l > 0 => l,
        _ => 100,
    }
}

// --- health and metrics ---

pub async fn health_check() -> HttpResponse {
    HttpResponse::Ok().json(json!({
        "status": "healthy",
        "service": "ledger-engine",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

pub async fn metrics_endpoint() -> HttpResponse {
    match metrics::metrics_handler() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => HttpResponse::InternalServerError().body(e.to_string()),
    }
}

// --- transactions ---

/// POST /v1/transactions
pub async fn post_transaction(
    principal: Principal,
    service: web::Data<Arc<LedgerService>>,
    request: web::Json<PostTransactionRequest>,
) -> HandlerResult {
    let req = request.into_inner();

    let cmd = PostTransactionCommand {
        ledger_id: principal.ledger_id,
        external_id: req.external_id,
        idempotency_key: req.idempotency_key,
        currency: req.currency,
        occurred_at: req.occurred_at,
        postings: req.postings,
    };

    let transaction_id = service.post_transaction(cmd).await?;

    Ok(HttpResponse::Ok().json(PostTransactionResponse {
        transaction_id,
        status: "accepted".to_string(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ListTransactionsQuery {
    pub limit: Option<i64>,
    pub continuation_token: Option<String>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
}

/// GET /v1/transactions
pub async fn list_transactions(
    principal: Principal,
    db: web::Data<Arc<Database>>,
    query: web::Query<ListTransactionsQuery>,
) -> HandlerResult {
    let limit = validate_limit(query.limit);
    let cursor: Option<Cursor<Uuid>> = decode_cursor(&query.continuation_token)?;

    let mut rows = db
        .list_transactions(
            principal.ledger_id,
            cursor.map(|c| (c.timestamp, c.id)),
            query.start_time,
            query.end_time,
            limit,
        )
        .await?;

    let has_more = rows.len() as i64 > limit;
    rows.truncate(limit as usize);

    let continuation_token = if has_more {
        rows.last()
            .map(|t| {
                encode_cursor(&Cursor {
                    timestamp: t.created_at,
                    id: t.id,
                })
            })
            .unwrap_or_default()
    } else {
        String::new()
    };

    let mut transactions = Vec::with_capacity(rows.len());
    for row in rows {
        transactions.push(to_transaction_response(&db, principal.ledger_id, row).await?);
    }

    let count = transactions.len();
    Ok(HttpResponse::Ok().json(json!({
        "transactions": transactions,
        "pagination": PaginationResponse { has_more, continuation_token, count },
    })))
}

/// GET /v1/transactions/{id}
pub async fn get_transaction(
    principal: Principal,
    db: web::Data<Arc<Database>>,
    transaction_id: web::Path<Uuid>,
) -> HandlerResult {
    let transaction_id = transaction_id.into_inner();

    let row = db
        .get_transaction(principal.ledger_id, transaction_id)
        .await?
        .ok_or(LedgerEngineError::TransactionNotFound(transaction_id))?;

    let response = to_transaction_response(&db, principal.ledger_id, row).await?;
    Ok(HttpResponse::Ok().json(response))
}

async fn to_transaction_response(
    db: &Database,
    ledger_id: Uuid,
    row: TransactionRow,
) -> Result<TransactionResponse, LedgerEngineError> {
    let postings = db.load_postings(ledger_id, row.id).await?;

    Ok(TransactionResponse {
        id: row.id,
        external_id: row.external_id,
        amount: row.amount,
        currency: row.currency,
        occurred_at: row.occurred_at,
        created_at: row.created_at,
        postings,
    })
}

// --- accounts ---

/// POST /v1/accounts (administrative)
pub async fn create_account(
    principal: Principal,
    db: web::Data<Arc<Database>>,
    request: web::Json<CreateAccountRequest>,
) -> HandlerResult {
    let req = request.into_inner();

    if AccountType::parse(&req.account_type).is_none() {
        return Err(LedgerEngineError::InvalidAccountType(req.account_type));
    }

    let account = db
        .create_account(principal.ledger_id, &req.code, &req.name, &req.account_type)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db_err)
                if db_err.constraint() == Some("accounts_ledger_id_code_key") =>
            {
                LedgerEngineError::DuplicateAccount(req.code.clone())
            }
            _ => LedgerEngineError::Database(e),
        })?;

    Ok(HttpResponse::Created().json(crate::models::AccountResponse::from(account)))
}

/// GET /v1/accounts
pub async fn list_accounts(
    principal: Principal,
    db: web::Data<Arc<Database>>,
) -> HandlerResult {
    let accounts = db.list_accounts(principal.ledger_id).await?;
    let accounts: Vec<crate::models::AccountResponse> =
        accounts.into_iter().map(Into::into).collect();
    Ok(HttpResponse::Ok().json(accounts))
}

/// GET /v1/accounts/{code}
pub async fn get_account(
    principal: Principal,
    db: web::Data<Arc<Database>>,
    code: web::Path<String>,
) -> HandlerResult {
    let code = code.into_inner();
    let account = db
        .get_account(principal.ledger_id, &code)
        .await?
        .ok_or(LedgerEngineError::AccountNotFound(code))?;

    Ok(HttpResponse::Ok().json(crate::models::AccountResponse::from(account)))
}

/// GET /v1/balance/summary
pub async fn balance_summary(
    principal: Principal,
    db: web::Data<Arc<Database>>,
) -> HandlerResult {
    let summary = db.balance_summary(principal.ledger_id).await?;
    Ok(HttpResponse::Ok().json(summary))
}

// --- events ---

#[derive(Debug, Deserialize)]
pub struct ListEventsQuery {
    pub limit: Option<i64>,
    pub continuation_token: Option<String>,
    pub event_type: Option<String>,
    pub aggregate_id: Option<Uuid>,
}

/// GET /v1/events
pub async fn list_events(
    principal: Principal,
    db: web::Data<Arc<Database>>,
    query: web::Query<ListEventsQuery>,
) -> HandlerResult {
    let limit = validate_limit(query.limit);
    let cursor: Option<Cursor<i64>> = decode_cursor(&query.continuation_token)?;

    let mut rows = db
        .list_events(
            principal.ledger_id,
            cursor.map(|c| (c.timestamp, c.id)),
            query.event_type.as_deref(),
            query.aggregate_id,
            limit,
        )
        .await?;

    let has_more = rows.len() as i64 > limit;
    rows.truncate(limit as usize);

    let continuation_token = if has_more {
        rows.last()
            .map(|e| {
                encode_cursor(&Cursor {
                    timestamp: e.created_at,
                    id: e.id,
                })
            })
            .unwrap_or_default()
    } else {
        String::new()
    };

    let events: Vec<EventResponse> = rows.into_iter().map(Into::into).collect();
    let count = events.len();

    Ok(HttpResponse::Ok().json(json!({
        "events": events,
        "pagination": PaginationResponse { has_more, continuation_token, count },
    })))
}

/// GET /v1/events/{id}
pub async fn get_event(
    principal: Principal,
    db: web::Data<Arc<Database>>,
    event_id: web::Path<i64>,
) -> HandlerResult {
    let event_id = event_id.into_inner();
    let event = db
        .get_event(principal.ledger_id, event_id)
        .await?
        .ok_or(LedgerEngineError::EventNotFound(event_id))?;

    Ok(HttpResponse::Ok().json(EventResponse::from(event)))
}

// --- webhook endpoints and deliveries ---

/// POST /v1/webhook-endpoints. The secret is generated server-side and
/// returned only in this response.
pub async fn create_webhook_endpoint(
    principal: Principal,
    db: web::Data<Arc<Database>>,
    request: web::Json<CreateWebhookEndpointRequest>,
) -> HandlerResult {
    let req = request.into_inner();
    let secret = generate_webhook_secret();

    let id = db
        .create_webhook_endpoint(principal.ledger_id, &req.url, &secret)
        .await?;

    Ok(HttpResponse::Created().json(CreateWebhookEndpointResponse {
        id,
        url: req.url,
        secret,
    }))
}

/// GET /v1/webhook-endpoints
pub async fn list_webhook_endpoints(
    principal: Principal,
    db: web::Data<Arc<Database>>,
) -> HandlerResult {
    let endpoints = db.list_webhook_endpoints(principal.ledger_id).await?;

    let endpoints: Vec<WebhookEndpointResponse> = endpoints
        .into_iter()
        .map(|e| WebhookEndpointResponse {
            id: e.id,
            url: e.url,
            is_active: e.is_active,
            created_at: e.created_at,
        })
        .collect();

    Ok(HttpResponse::Ok().json(endpoints))
}

#[derive(Debug, Deserialize)]
pub struct ListDeliveriesQuery {
    pub limit: Option<i64>,
}

/// GET /v1/webhook-deliveries
pub async fn list_webhook_deliveries(
    principal: Principal,
    db: web::Data<Arc<Database>>,
    query: web::Query<ListDeliveriesQuery>,
) -> HandlerResult {
    let limit = validate_limit(query.limit);
    let deliveries = db
        .list_webhook_deliveries(principal.ledger_id, limit)
        .await?;

    Ok(HttpResponse::Ok().json(deliveries))
}

/// Configure routes
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/v1")
            .route("/transactions", web::post().to(post_transaction))
            .route("/transactions", web::get().to(list_transactions))
            .route("/transactions/{id}", web::get().to(get_transaction))
            .route("/accounts", web::post().to(create_account))
            .route("/accounts", web::get().to(list_accounts))
            .route("/accounts/{code}", web::get().to(get_account))
            .route("/balance/summary", web::get().to(balance_summary))
            .route("/events", web::get().to(list_events))
            .route("/events/{id}", web::get().to(get_event))
            .route("/webhook-endpoints", web::post().to(create_webhook_endpoint))
            .route("/webhook-endpoints", web::get().to(list_webhook_endpoints))
            .route("/webhook-deliveries", web::get().to(list_webhook_deliveries)),
    );
}
