use crate::config::WebhookConfig;
use crate::database::Database;
use crate::metrics;
use crate::models::WebhookEndpoint;
use crate::outbox::{OutboxJob, OutboxQueue};
use hmac::{Hmac, Mac};
use rand::rngs::OsRng;
use rand::RngCore;
use reqwest::Client;
use sha2::Sha256;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_HEADER: &str = "X-Ledger-Signature";

/// Hex-encoded HMAC-SHA-256 of the payload under the endpoint secret,
/// computed over the exact stored payload bytes so receivers can verify.
pub fn compute_signature(secret: &[u8], payload: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(payload);
    hex::encode(mac.finalize().into_bytes())
}

/// Endpoint secrets come from the OS CSPRNG.
pub fn generate_webhook_secret() -> String {
    let mut bytes = [0u8; 32];
    OsRng.fill_bytes(&mut bytes);
    format!("whsec_{}", hex::encode(bytes))
}

/// Terminal classification of one delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryStatus {
    Success,
    RetryableError,
    NonRetryableError,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Success => "success",
            DeliveryStatus::RetryableError => "retryable_error",
            DeliveryStatus::NonRetryableError => "non_retryable_error",
        }
    }
}

/// 2xx is success; 5xx is retryable; anything else 4xx-and-up is a bad
/// endpoint and is not retried (408/429 included, matching the inherited
/// policy).
pub fn classify_http_status(status: u16) -> DeliveryStatus {
    if (200..300).contains(&status) {
        DeliveryStatus::Success
    } else if status >= 500 {
        DeliveryStatus::RetryableError
    } else if status >= 400 {
        DeliveryStatus::NonRetryableError
    } else {
        // 1xx/3xx: the endpoint did not accept the event.
        DeliveryStatus::RetryableError
    }
}

enum JobError {
    Retryable(String),
    NonRetryable(String),
}

/// Consumes `webhook_delivery` outbox jobs and fans each event out to the
/// active endpoints of its ledger, with a per-endpoint success check so
/// retries never re-deliver.
pub struct WebhookWorker {
    db: Arc<Database>,
    queue: Arc<OutboxQueue>,
    client: Client,
    user_agent: String,
    fetch_batch_size: i64,
    poll_interval: Duration,
}

impl WebhookWorker {
    pub fn new(
        db: Arc<Database>,
        queue: Arc<OutboxQueue>,
        cfg: &WebhookConfig,
        fetch_batch_size: i64,
        poll_interval_ms: u64,
    ) -> Self {
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.request_timeout_secs))
            .build()
            .expect("reqwest client");

        WebhookWorker {
            db,
            queue,
            client,
            user_agent: cfg.user_agent.clone(),
            fetch_batch_size,
            poll_interval: Duration::from_millis(poll_interval_ms),
        }
    }

    /// Claim-and-deliver loop. Jobs in a batch are delivered concurrently;
    /// the loop returns when the shutdown signal fires, after the in-flight
    /// batch settles.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.poll_interval);
        info!("webhook worker starting");

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("webhook worker stopping");
                    return;
                }
                _ = ticker.tick() => {
                    self.process_available().await;
                }
            }
        }
    }

    /// Claims one batch of due jobs and delivers them concurrently.
    /// Returns the number of jobs handled.
    pub async fn process_available(&self) -> usize {
        let jobs = match self.queue.fetch(self.fetch_batch_size).await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!("outbox fetch failed: {}", e);
                return 0;
            }
        };

        futures_util::future::join_all(jobs.iter().map(|job| self.handle_job(job))).await;
        jobs.len()
    }

    async fn handle_job(&self, job: &OutboxJob) {
        let outcome = match self.work(job).await {
            Ok(()) => self.queue.complete(job).await,
            Err(JobError::Retryable(reason)) => self.queue.retry(job, &reason).await,
            Err(JobError::NonRetryable(reason)) => self.queue.discard(job, &reason).await,
        };

        if let Err(e) = outcome {
            error!("failed to finalize job {}: {}", job.id, e);
        }
    }

    async fn work(&self, job: &OutboxJob) -> Result<(), JobError> {
        // The outbox invariant guarantees the event exists; a miss means
        // the row was tampered with and retrying cannot help.
        let payload = self
            .db
            .load_event_payload(job.event_id, job.ledger_id)
            .await
            .map_err(|e| JobError::Retryable(e.to_string()))?
            .ok_or_else(|| {
                JobError::NonRetryable(format!(
                    "event not found (id={}, ledger={})",
                    job.event_id, job.ledger_id
                ))
            })?;

        let body = serde_json::to_vec(&payload)
            .map_err(|e| JobError::NonRetryable(format!("payload serialization: {}", e)))?;

        let endpoints = self
            .db
            .active_webhook_endpoints(job.ledger_id)
            .await
            .map_err(|e| JobError::Retryable(e.to_string()))?;

        if endpoints.is_empty() {
            return Ok(());
        }

        let mut retryable_failures = 0usize;

        for endpoint in &endpoints {
            // Per-endpoint idempotency: a success is sticky and never
            // re-attempted.
            match self
                .db
                .has_successful_delivery(job.event_id, endpoint.id)
                .await
            {
                Ok(true) => continue,
                Ok(false) => {}
                Err(e) => {
                    warn!(
                        "delivery idempotency check failed for endpoint {}: {}",
                        endpoint.id, e
                    );
                    retryable_failures += 1;
                    continue;
                }
            }

            let status = self
                .send_single_webhook(endpoint, job, &body)
                .await;

            if status == DeliveryStatus::RetryableError {
                retryable_failures += 1;
            }
        }

        if retryable_failures > 0 {
            return Err(JobError::Retryable(format!(
                "webhook delivery had {} retryable failures",
                retryable_failures
            )));
        }
        Ok(())
    }

    /// Sends one request and records the attempt. The delivery row must
    /// never mask the send result: a failed row write is logged and the
    /// attempt keeps its classification.
    async fn send_single_webhook(
        &self,
        endpoint: &WebhookEndpoint,
        job: &OutboxJob,
        body: &[u8],
    ) -> DeliveryStatus {
        let signature = compute_signature(endpoint.secret.as_bytes(), body);

        let url = match reqwest::Url::parse(&endpoint.url) {
            Ok(url) => url,
            Err(e) => {
                let status = DeliveryStatus::NonRetryableError;
                self.log_delivery(endpoint, job, status, 0, &format!("bad endpoint url: {}", e))
                    .await;
                return status;
            }
        };

        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .header("User-Agent", &self.user_agent)
            .header(SIGNATURE_HEADER, signature)
            .body(body.to_vec())
            .send()
            .await;

        let (status, http_status, error_message) = match response {
            Ok(resp) => {
                let code = resp.status().as_u16();
                let status = classify_http_status(code);
                let message = match status {
                    DeliveryStatus::Success => String::new(),
                    DeliveryStatus::RetryableError => format!("server error: {}", code),
                    DeliveryStatus::NonRetryableError => format!("client error: {}", code),
                };
                (status, i32::from(code), message)
            }
            Err(e) => {
                // Network, DNS and timeout failures are retryable.
                (DeliveryStatus::RetryableError, 0, e.to_string())
            }
        };

        self.log_delivery(endpoint, job, status, http_status, &error_message)
            .await;

        status
    }

    async fn log_delivery(
        &self,
        endpoint: &WebhookEndpoint,
        job: &OutboxJob,
        status: DeliveryStatus,
        http_status: i32,
        error_message: &str,
    ) {
        metrics::WEBHOOK_DELIVERIES
            .with_label_values(&[status.as_str()])
            .inc();

        if let Err(e) = self
            .db
            .record_delivery(
                job.event_id,
                endpoint.id,
                status.as_str(),
                job.attempt,
                http_status,
                error_message,
            )
            .await
        {
            warn!(
                "failed to record delivery row for event {} endpoint {}: {}",
                job.event_id, endpoint.id, e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_matches_known_vector() {
        // HMAC-SHA256("key", "The quick brown fox jumps over the lazy dog")
        let sig = compute_signature(
            b"key",
            b"The quick brown fox jumps over the lazy dog",
        );
        assert_eq!(
            sig,
            "f7bc83f430538424b13298e6aa6fb143ef4d59a14946175997479dbc2d1a3cd8"
        );
    }

    #[test]
    fn signature_changes_with_secret_and_body() {
        let body = br#"{"transaction_id":"abc"}"#;
        let a = compute_signature(b"s1", body);
        let b = compute_signature(b"s2", body);
        let c = compute_signature(b"s1", br#"{"transaction_id":"abd"}"#);
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn secrets_are_prefixed_and_unique() {
        let s1 = generate_webhook_secret();
        let s2 = generate_webhook_secret();
        assert!(s1.starts_with("whsec_"));
        assert_eq!(s1.len(), "whsec_".len() + 64);
        assert_ne!(s1, s2);
    }

    #[test]
    fn classification_follows_status_families() {
        assert_eq!(classify_http_status(200), DeliveryStatus::Success);
        assert_eq!(classify_http_status(204), DeliveryStatus::Success);
        assert_eq!(classify_http_status(500), DeliveryStatus::RetryableError);
        assert_eq!(classify_http_status(503), DeliveryStatus::RetryableError);
        assert_eq!(classify_http_status(400), DeliveryStatus::NonRetryableError);
        assert_eq!(classify_http_status(404), DeliveryStatus::NonRetryableError);
        // Inherited policy: timeout-ish 4xx codes are still terminal.
        assert_eq!(classify_http_status(408), DeliveryStatus::NonRetryableError);
        assert_eq!(classify_http_status(429), DeliveryStatus::NonRetryableError);
    }
}
