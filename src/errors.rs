use actix_web::{error::ResponseError, http::StatusCode, HttpResponse};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, LedgerEngineError>;

#[derive(Error, Debug)]
pub enum LedgerEngineError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Account not found: {0}")]
    UnknownAccount(String),

    #[error("Unbalanced postings: debits ({debits}) must equal credits ({credits})")]
    UnbalancedPostings { debits: String, credits: String },

    #[error("Transaction must have at least 2 postings")]
    TooFewPostings,

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Invalid direction: {0}")]
    InvalidDirection(String),

    #[error("Invalid account type: {0}")]
    InvalidAccountType(String),

    #[error("Transaction not found: {0}")]
    TransactionNotFound(uuid::Uuid),

    #[error("Event not found: {0}")]
    EventNotFound(i64),

    #[error("Account not found: {0}")]
    AccountNotFound(String),

    #[error("Invalid continuation token")]
    InvalidCursor,

    #[error("Duplicate account code: {0}")]
    DuplicateAccount(String),

    #[error("Queue error: {0}")]
    Queue(String),

    #[error("Unauthorized access")]
    Unauthorized,

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl ResponseError for LedgerEngineError {
    fn error_response(&self) -> HttpResponse {
        let status_code = self.status_code();
        let error_message = self.to_string();

        HttpResponse::build(status_code).json(json!({
            "error": {
                "code": status_code.as_u16(),
                "message": error_message,
                "type": self.error_type()
            }
        }))
    }

    fn status_code(&self) -> StatusCode {
        match self {
            LedgerEngineError::Database(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LedgerEngineError::Migration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LedgerEngineError::UnknownAccount(_) => StatusCode::BAD_REQUEST,
            LedgerEngineError::UnbalancedPostings { .. } => StatusCode::BAD_REQUEST,
            LedgerEngineError::TooFewPostings => StatusCode::BAD_REQUEST,
            LedgerEngineError::InvalidAmount(_) => StatusCode::BAD_REQUEST,
            LedgerEngineError::InvalidDirection(_) => StatusCode::BAD_REQUEST,
            LedgerEngineError::InvalidAccountType(_) => StatusCode::BAD_REQUEST,
            LedgerEngineError::TransactionNotFound(_) => StatusCode::NOT_FOUND,
            LedgerEngineError::EventNotFound(_) => StatusCode::NOT_FOUND,
            LedgerEngineError::AccountNotFound(_) => StatusCode::NOT_FOUND,
            LedgerEngineError::InvalidCursor => StatusCode::BAD_REQUEST,
            LedgerEngineError::DuplicateAccount(_) => StatusCode::CONFLICT,
            LedgerEngineError::Queue(_) => StatusCode::INTERNAL_SERVER_ERROR,
            LedgerEngineError::Unauthorized => StatusCode::UNAUTHORIZED,
            LedgerEngineError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl LedgerEngineError {
    fn error_type(&self) -> &str {
        match self {
            LedgerEngineError::Database(_) => "database_error",
            LedgerEngineError::Migration(_) => "database_error",
            LedgerEngineError::UnknownAccount(_) => "unknown_account",
            LedgerEngineError::UnbalancedPostings { .. } => "unbalanced_postings",
            LedgerEngineError::TooFewPostings => "too_few_postings",
            LedgerEngineError::InvalidAmount(_) => "invalid_amount",
            LedgerEngineError::InvalidDirection(_) => "invalid_direction",
            LedgerEngineError::InvalidAccountType(_) => "invalid_account_type",
            LedgerEngineError::TransactionNotFound(_) => "not_found",
            LedgerEngineError::EventNotFound(_) => "not_found",
            LedgerEngineError::AccountNotFound(_) => "not_found",
            LedgerEngineError::InvalidCursor => "invalid_cursor",
            LedgerEngineError::DuplicateAccount(_) => "duplicate_account",
            LedgerEngineError::Queue(_) => "queue_error",
            LedgerEngineError::Unauthorized => "unauthorized",
            LedgerEngineError::Internal(_) => "internal_error",
        }
    }

    /// True for faults where a caller retry with the same idempotency key
    /// is safe and may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            LedgerEngineError::Database(_) | LedgerEngineError::Queue(_)
        )
    }
}
