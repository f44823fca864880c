// Background worker: projector + webhook delivery, with a small HTTP
// surface for health and metrics.

use actix_web::{web, App, HttpServer};
use dotenv::dotenv;
use ledger_engine::{
    config::Config, database::Database, handlers, metrics, outbox::OutboxQueue,
    projector::Projector, webhook::WebhookWorker,
};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .json()
        .init();

    info!("Starting ledger-engine worker...");

    let config = Config::from_env().expect("Failed to load configuration");
    config.validate().expect("Invalid configuration");

    metrics::register_metrics(prometheus::default_registry())
        .expect("Failed to register metrics");

    let db = Arc::new(
        Database::new(
            &config.database.url,
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .expect("Failed to connect to database"),
    );

    info!("Database connected successfully");

    let queue = Arc::new(OutboxQueue::new(db.pool().clone(), &config.outbox));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let projector = Projector::new(db.pool().clone(), &config.projector);
    let projector_shutdown = shutdown_rx.clone();
    let projector_handle = tokio::spawn(async move {
        projector.run(projector_shutdown).await;
    });

    let webhook_worker = WebhookWorker::new(
        db.clone(),
        queue,
        &config.webhook,
        config.outbox.fetch_batch_size,
        config.outbox.poll_interval_ms,
    );
    let webhook_shutdown = shutdown_rx;
    let webhook_handle = tokio::spawn(async move {
        webhook_worker.run(webhook_shutdown).await;
    });

    info!("Worker processes started");

    // Health/metrics server; actix handles the interrupt signal and the
    // loops are stopped once it returns.
    let port = config.server.worker_port;
    HttpServer::new(|| {
        App::new()
            .route("/health", web::get().to(handlers::health_check))
            .route("/metrics", web::get().to(handlers::metrics_endpoint))
    })
    .workers(1)
    .bind(("0.0.0.0", port))?
    .run()
    .await?;

    info!("Shutting down workers...");
    let _ = shutdown_tx.send(true);
    let _ = projector_handle.await;
    let _ = webhook_handle.await;
    info!("Workers stopped");

    Ok(())
}
