use config::{ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::env;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub auth: AuthConfig,
    pub projector: ProjectorConfig,
    pub outbox: OutboxConfig,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Port for the background worker's health/metrics surface.
    pub worker_port: u16,
    pub workers: usize,
    pub shutdown_timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct AuthConfig {
    pub api_key_secret: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ProjectorConfig {
    pub name: String,
    pub batch_size: i64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct OutboxConfig {
    pub fetch_batch_size: i64,
    pub poll_interval_ms: u64,
    pub max_attempts: i32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub lease_timeout_secs: i64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct WebhookConfig {
    pub request_timeout_secs: u64,
    pub user_agent: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let environment = env::var("ENVIRONMENT").unwrap_or_else(|_| "development".to_string());

        let mut builder = config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("server.worker_port", 8081)?
            .set_default("server.workers", 4)?
            .set_default("server.shutdown_timeout_secs", 10)?
            .set_default("database.max_connections", 10)?
            .set_default("database.min_connections", 2)?
            .set_default("auth.api_key_secret", "change-me-in-production")?
            .set_default("projector.name", "ledger")?
            .set_default("projector.batch_size", 100)?
            .set_default("projector.poll_interval_ms", 1000)?
            .set_default("outbox.fetch_batch_size", 20)?
            .set_default("outbox.poll_interval_ms", 500)?
            .set_default("outbox.max_attempts", 10)?
            .set_default("outbox.initial_backoff_ms", 2000)?
            .set_default("outbox.max_backoff_ms", 300_000)?
            .set_default("outbox.lease_timeout_secs", 60)?
            .set_default("webhook.request_timeout_secs", 10)?
            .set_default("webhook.user_agent", "ledger-engine-webhook/0.1")?;

        if let Ok(config_file) = env::var("CONFIG_FILE") {
            builder = builder.add_source(File::with_name(&config_file).required(false));
        } else {
            builder = builder
                .add_source(File::with_name(&format!("config/{}", environment)).required(false));
        }

        builder = builder.add_source(
            Environment::with_prefix("LEDGER_ENGINE")
                .separator("__")
                .list_separator(","),
        );

        // Common env vars used by deploy tooling
        if let Ok(db_url) = env::var("DATABASE_URL") {
            builder = builder.set_override("database.url", db_url)?;
        }
        if let Ok(port) = env::var("SERVER_PORT") {
            builder = builder.set_override("server.port", port)?;
        }
        if let Ok(secret) = env::var("API_KEY_SECRET") {
            builder = builder.set_override("auth.api_key_secret", secret)?;
        }

        builder.build()?.try_deserialize()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.server.port == 0 {
            return Err("Server port cannot be 0".to_string());
        }

        if self.database.url.is_empty() {
            return Err("Database URL is required".to_string());
        }

        if self.auth.api_key_secret.is_empty() {
            return Err("API key secret is required".to_string());
        }

        if self.projector.batch_size <= 0 {
            return Err("Projector batch size must be positive".to_string());
        }

        if self.outbox.max_attempts <= 0 {
            return Err("Outbox max attempts must be positive".to_string());
        }

        if self.outbox.initial_backoff_ms > self.outbox.max_backoff_ms {
            return Err("Outbox initial backoff cannot exceed max backoff".to_string());
        }

        Ok(())
    }
}
