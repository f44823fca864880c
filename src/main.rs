use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use dotenv::dotenv;
use ledger_engine::{
    auth::ApiKeyAuth, config::Config, database::Database, handlers, ledger::LedgerService,
    metrics, outbox::OutboxQueue,
};
use std::sync::Arc;
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

    info!("Starting ledger-engine API...");

    let config = Config::from_env().expect("Failed to load configuration");
    config.validate().expect("Invalid configuration");

    info!("Configuration loaded successfully");

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
    let service = Arc::new(LedgerService::new(db.clone(), queue));

    info!("Ledger service initialized successfully");

    let server_config = config.server.clone();
    let api_key_secret = config.auth.api_key_secret.clone();
    let service_data = web::Data::new(service);
    let db_data = web::Data::new(db.clone());

    info!(
        "Starting HTTP server on {}:{}",
        server_config.host, server_config.port
    );

    HttpServer::new(move || {
        App::new()
            .app_data(service_data.clone())
            .app_data(db_data.clone())
            .wrap(ApiKeyAuth::new(db.clone(), api_key_secret.as_bytes()))
            .wrap(
                Cors::default()
                    .allow_any_origin()
                    .allow_any_method()
                    .allow_any_header()
                    .max_age(3600),
            )
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .route("/health", web::get().to(handlers::health_check))
            .route("/metrics", web::get().to(handlers::metrics_endpoint))
            .configure(handlers::configure_routes)
    })
    .workers(server_config.workers)
    .shutdown_timeout(server_config.shutdown_timeout_secs)
    .bind((server_config.host, server_config.port))?
    .run()
    .await
}
