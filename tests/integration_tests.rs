// End-to-end tests against a real database.
// They are ignored by default; run with:
//   DATABASE_URL=postgres://... cargo test -- --ignored

use actix_web::{web, App, HttpResponse, HttpServer};
use chrono::{DateTime, Utc};
use ledger_engine::config::{OutboxConfig, ProjectorConfig, WebhookConfig};
use ledger_engine::database::Database;
use ledger_engine::errors::LedgerEngineError;
use ledger_engine::ledger::LedgerService;
use ledger_engine::models::{PostTransactionCommand, PostingInput};
use ledger_engine::outbox::OutboxQueue;
use ledger_engine::projector::Projector;
use ledger_engine::webhook::{compute_signature, WebhookWorker};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use uuid::Uuid;

fn outbox_config() -> OutboxConfig {
    OutboxConfig {
        fetch_batch_size: 20,
        poll_interval_ms: 100,
        max_attempts: 10,
        initial_backoff_ms: 10,
        max_backoff_ms: 100,
        lease_timeout_secs: 60,
    }
}

fn projector_config() -> ProjectorConfig {
    ProjectorConfig {
        name: format!("test-{}", Uuid::new_v4()),
        batch_size: 100,
        poll_interval_ms: 100,
    }
}

fn webhook_config() -> WebhookConfig {
    WebhookConfig {
        request_timeout_secs: 5,
        user_agent: "ledger-engine-webhook/test".to_string(),
    }
}

async fn connect() -> PgPool {
    let url = std::env::var("DATABASE_URL")
        .expect("DATABASE_URL must point at a test database for integration tests");

    let pool = PgPoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await
        .expect("failed to connect to test database");

    sqlx::migrate!("./migrations")
        .run(&pool)
        .await
        .expect("failed to run migrations");

    pool
}

struct TestContext {
    pool: PgPool,
    db: Arc<Database>,
    queue: Arc<OutboxQueue>,
    service: LedgerService,
    ledger_id: Uuid,
}

async fn setup() -> TestContext {
    let pool = connect().await;

    let ledger_id: Uuid = sqlx::query_scalar(
        "INSERT INTO ledgers (name, default_currency) VALUES ($1, 'USD') RETURNING id",
    )
    .bind(format!("test-ledger-{}", Uuid::new_v4()))
    .fetch_one(&pool)
    .await
    .expect("seed ledger");

    for (code, account_type) in [("cash", "asset"), ("revenue", "revenue")] {
        sqlx::query(
            "INSERT INTO accounts (ledger_id, code, name, type, balance) VALUES ($1, $2, $2, $3, 0)",
        )
        .bind(ledger_id)
        .bind(code)
        .bind(account_type)
        .execute(&pool)
        .await
        .expect("seed account");
    }

    let url = std::env::var("DATABASE_URL").unwrap();
    let db = Arc::new(Database::new(&url, 5, 1).await.expect("database"));
    let queue = Arc::new(OutboxQueue::new(pool.clone(), &outbox_config()));
    let service = LedgerService::new(db.clone(), queue.clone());

    TestContext {
        pool,
        db,
        queue,
        service,
        ledger_id,
    }
}

fn balanced_command(ledger_id: Uuid, idempotency_key: &str) -> PostTransactionCommand {
    let occurred_at: DateTime<Utc> = "2024-01-01T12:00:00Z".parse().unwrap();
    PostTransactionCommand {
        ledger_id,
        external_id: "order-123".to_string(),
        idempotency_key: idempotency_key.to_string(),
        currency: "USD".to_string(),
        occurred_at,
        postings: vec![
            PostingInput {
                account_code: "cash".to_string(),
                direction: "debit".to_string(),
                amount: "100.00".to_string(),
            },
            PostingInput {
                account_code: "revenue".to_string(),
                direction: "credit".to_string(),
                amount: "100.00".to_string(),
            },
        ],
    }
}

async fn event_count(pool: &PgPool, ledger_id: Uuid) -> i64 {
    sqlx::query_scalar("SELECT COUNT(*) FROM events WHERE ledger_id = $1")
        .bind(ledger_id)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn balance_of(pool: &PgPool, ledger_id: Uuid, code: &str) -> Decimal {
    sqlx::query_scalar("SELECT balance FROM accounts WHERE ledger_id = $1 AND code = $2")
        .bind(ledger_id)
        .bind(code)
        .fetch_one(pool)
        .await
        .unwrap()
}

async fn drain_projector(projector: &Projector) {
    loop {
        let applied = projector.project_batch().await.expect("projection pass");
        if applied == 0 {
            break;
        }
    }
}

#[tokio::test]
#[ignore]
async fn balanced_post_projects_balances() {
    let ctx = setup().await;

    let transaction_id = ctx
        .service
        .post_transaction(balanced_command(ctx.ledger_id, "k1"))
        .await
        .expect("balanced post accepted");

    assert_eq!(event_count(&ctx.pool, ctx.ledger_id).await, 1);

    let job_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM outbox_jobs WHERE ledger_id = $1 AND kind = 'webhook_delivery'",
    )
    .bind(ctx.ledger_id)
    .fetch_one(&ctx.pool)
    .await
    .unwrap();
    assert_eq!(job_count, 1);

    let projector = Projector::new(ctx.pool.clone(), &projector_config());
    drain_projector(&projector).await;

    assert_eq!(balance_of(&ctx.pool, ctx.ledger_id, "cash").await, dec!(-100));
    assert_eq!(
        balance_of(&ctx.pool, ctx.ledger_id, "revenue").await,
        dec!(100)
    );

    let txn_count: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM transactions WHERE ledger_id = $1")
            .bind(ctx.ledger_id)
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
    assert_eq!(txn_count, 1);

    let posting_count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM postings WHERE ledger_id = $1 AND transaction_id = $2",
    )
    .bind(ctx.ledger_id)
    .bind(transaction_id)
    .fetch_one(&ctx.pool)
    .await
    .unwrap();
    assert_eq!(posting_count, 2);

    // The denormalized transaction total is the sum of the debit legs.
    let amount: Decimal =
        sqlx::query_scalar("SELECT amount FROM transactions WHERE id = $1 AND ledger_id = $2")
            .bind(transaction_id)
            .bind(ctx.ledger_id)
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
    assert_eq!(amount, dec!(100));
}

#[tokio::test]
#[ignore]
async fn idempotent_replay_returns_same_transaction() {
    let ctx = setup().await;

    let first = ctx
        .service
        .post_transaction(balanced_command(ctx.ledger_id, "replay-key"))
        .await
        .unwrap();
    let second = ctx
        .service
        .post_transaction(balanced_command(ctx.ledger_id, "replay-key"))
        .await
        .unwrap();

    assert_eq!(first, second);
    assert_eq!(event_count(&ctx.pool, ctx.ledger_id).await, 1);

    let projector = Projector::new(ctx.pool.clone(), &projector_config());
    drain_projector(&projector).await;

    assert_eq!(balance_of(&ctx.pool, ctx.ledger_id, "cash").await, dec!(-100));
}

#[tokio::test]
#[ignore]
async fn projector_replay_is_idempotent() {
    let ctx = setup().await;

    ctx.service
        .post_transaction(balanced_command(ctx.ledger_id, "replay-twice"))
        .await
        .unwrap();

    let projector = Projector::new(ctx.pool.clone(), &projector_config());
    drain_projector(&projector).await;

    // Simulate a crash between apply and offset advance: rewind the offset
    // and replay. The transaction-row insert gate must prevent
    // double-counting.
    sqlx::query("UPDATE projector_offsets SET last_processed_event_id = 0")
        .execute(&ctx.pool)
        .await
        .unwrap();
    drain_projector(&projector).await;

    assert_eq!(balance_of(&ctx.pool, ctx.ledger_id, "cash").await, dec!(-100));
    assert_eq!(
        balance_of(&ctx.pool, ctx.ledger_id, "revenue").await,
        dec!(100)
    );
}

#[tokio::test]
#[ignore]
async fn unbalanced_post_rejected_without_writes() {
    let ctx = setup().await;

    let mut cmd = balanced_command(ctx.ledger_id, "unbalanced-key");
    cmd.postings[1].amount = "99.99".to_string();

    let err = ctx.service.post_transaction(cmd).await.unwrap_err();
    match err {
        LedgerEngineError::UnbalancedPostings { debits, credits } => {
            assert_eq!(debits, "100.00");
            assert_eq!(credits, "99.99");
        }
        other => panic!("expected UnbalancedPostings, got {other:?}"),
    }

    assert_eq!(event_count(&ctx.pool, ctx.ledger_id).await, 0);
    assert_eq!(balance_of(&ctx.pool, ctx.ledger_id, "cash").await, dec!(0));
}

#[tokio::test]
#[ignore]
async fn unknown_account_rejected() {
    let ctx = setup().await;

    let mut cmd = balanced_command(ctx.ledger_id, "unknown-key");
    cmd.postings[1].account_code = "nonexistent".to_string();

    let err = ctx.service.post_transaction(cmd).await.unwrap_err();
    assert!(matches!(err, LedgerEngineError::UnknownAccount(code) if code == "nonexistent"));

    assert_eq!(event_count(&ctx.pool, ctx.ledger_id).await, 0);
}

#[tokio::test]
#[ignore]
async fn concurrent_duplicate_submissions_dedup() {
    let ctx = setup().await;

    let (a, b) = tokio::join!(
        ctx.service
            .post_transaction(balanced_command(ctx.ledger_id, "race-key")),
        ctx.service
            .post_transaction(balanced_command(ctx.ledger_id, "race-key")),
    );

    let a = a.expect("first submission");
    let b = b.expect("second submission");

    assert_eq!(a, b);
    assert_eq!(event_count(&ctx.pool, ctx.ledger_id).await, 1);
}

#[derive(Clone)]
struct CapturedRequest {
    signature: String,
    body: Vec<u8>,
}

/// Receiver double for webhook tests: records each request and answers 500
/// until `failures_remaining` runs out, 200 after.
async fn spawn_receiver(
    failures_remaining: usize,
) -> (String, Arc<Mutex<Vec<CapturedRequest>>>) {
    let captured: Arc<Mutex<Vec<CapturedRequest>>> = Arc::new(Mutex::new(Vec::new()));
    let fail_counter = Arc::new(AtomicUsize::new(failures_remaining));

    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind receiver");
    let addr = listener.local_addr().unwrap();

    let captured_clone = captured.clone();
    let server = HttpServer::new(move || {
        let captured = captured_clone.clone();
        let fail_counter = fail_counter.clone();
        App::new().route(
            "/hook",
            web::post().to(move |req: actix_web::HttpRequest, body: web::Bytes| {
                let captured = captured.clone();
                let fail_counter = fail_counter.clone();
                async move {
                    let signature = req
                        .headers()
                        .get("X-Ledger-Signature")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();

                    captured.lock().unwrap().push(CapturedRequest {
                        signature,
                        body: body.to_vec(),
                    });

                    let should_fail = fail_counter
                        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                        .is_ok();

                    if should_fail {
                        HttpResponse::InternalServerError().finish()
                    } else {
                        HttpResponse::Ok().finish()
                    }
                }
            }),
        )
    })
    .workers(1)
    .listen(listener)
    .expect("listen")
    .run();

    tokio::spawn(server);

    (format!("http://{}/hook", addr), captured)
}

async fn make_jobs_due(pool: &PgPool, ledger_id: Uuid) {
    sqlx::query("UPDATE outbox_jobs SET run_at = NOW() WHERE ledger_id = $1")
        .bind(ledger_id)
        .execute(pool)
        .await
        .unwrap();
}

#[actix_web::test]
#[ignore]
async fn webhook_delivery_success_round_trip() {
    let ctx = setup().await;
    let (url, captured) = spawn_receiver(0).await;

    let secret = "whsec_roundtrip";
    let endpoint_id: Uuid = sqlx::query_scalar(
        "INSERT INTO webhook_endpoints (ledger_id, url, secret, is_active)
         VALUES ($1, $2, $3, TRUE) RETURNING id",
    )
    .bind(ctx.ledger_id)
    .bind(&url)
    .bind(secret)
    .fetch_one(&ctx.pool)
    .await
    .unwrap();

    ctx.service
        .post_transaction(balanced_command(ctx.ledger_id, "hook-key"))
        .await
        .unwrap();

    let worker = WebhookWorker::new(ctx.db.clone(), ctx.queue.clone(), &webhook_config(), 20, 100);
    assert_eq!(worker.process_available().await, 1);

    // Signature covers the delivered body exactly.
    let requests = captured.lock().unwrap().clone();
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].signature,
        compute_signature(secret.as_bytes(), &requests[0].body)
    );

    let event_payload: serde_json::Value =
        sqlx::query_scalar("SELECT payload FROM events WHERE ledger_id = $1")
            .bind(ctx.ledger_id)
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
    let delivered: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
    assert_eq!(delivered, event_payload);

    let statuses: Vec<String> = sqlx::query_scalar(
        "SELECT status FROM webhook_deliveries WHERE webhook_endpoint_id = $1",
    )
    .bind(endpoint_id)
    .fetch_all(&ctx.pool)
    .await
    .unwrap();
    assert_eq!(statuses, vec!["success"]);

    // No further attempts after success.
    assert_eq!(worker.process_available().await, 0);
    assert_eq!(captured.lock().unwrap().len(), 1);
}

#[actix_web::test]
#[ignore]
async fn webhook_retries_through_server_errors_until_success() {
    let ctx = setup().await;
    let (url, captured) = spawn_receiver(3).await;

    let endpoint_id: Uuid = sqlx::query_scalar(
        "INSERT INTO webhook_endpoints (ledger_id, url, secret, is_active)
         VALUES ($1, $2, 'whsec_retry', TRUE) RETURNING id",
    )
    .bind(ctx.ledger_id)
    .bind(&url)
    .fetch_one(&ctx.pool)
    .await
    .unwrap();

    ctx.service
        .post_transaction(balanced_command(ctx.ledger_id, "retry-key"))
        .await
        .unwrap();

    let worker = WebhookWorker::new(ctx.db.clone(), ctx.queue.clone(), &webhook_config(), 20, 100);

    // Three failing attempts, then one success. Backoff is collapsed by
    // forcing run_at forward between passes.
    for _ in 0..4 {
        make_jobs_due(&ctx.pool, ctx.ledger_id).await;
        worker.process_available().await;
    }

    let statuses: Vec<String> = sqlx::query_scalar(
        "SELECT status FROM webhook_deliveries
         WHERE webhook_endpoint_id = $1
         ORDER BY last_attempt_at, attempt",
    )
    .bind(endpoint_id)
    .fetch_all(&ctx.pool)
    .await
    .unwrap();
    assert_eq!(
        statuses,
        vec![
            "retryable_error",
            "retryable_error",
            "retryable_error",
            "success"
        ]
    );

    assert_eq!(captured.lock().unwrap().len(), 4);

    let job_state: String =
        sqlx::query_scalar("SELECT state FROM outbox_jobs WHERE ledger_id = $1")
            .bind(ctx.ledger_id)
            .fetch_one(&ctx.pool)
            .await
            .unwrap();
    assert_eq!(job_state, "completed");
}
