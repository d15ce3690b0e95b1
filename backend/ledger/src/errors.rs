//! Application-wide error types.

use thiserror::Error;

use crate::models::PaymentStatus;

#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Campaign not found: {0}")]
    CampaignNotFound(String),

    #[error("Event not found: {0}")]
    EventNotFound(String),

    #[error("Payment transaction not found: {0}")]
    TransactionNotFound(String),

    #[error("User profile not found: {0}")]
    UserProfileNotFound(String),

    #[error("Insufficient funds: balance {balance}, requested {requested}")]
    InsufficientFunds { balance: i64, requested: i64 },

    #[error("User {user_id} is already registered for event {event_id}")]
    AlreadyRegistered { event_id: String, user_id: String },

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Invalid amount: {0}")]
    InvalidAmount(i64),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: PaymentStatus, to: PaymentStatus },

    /// A record read in the current attempt changed before commit.
    /// Consumed by the transaction runner, never returned to callers.
    #[error("Stale read on {0}")]
    StaleRead(String),

    #[error("Transaction conflict after {attempts} attempts")]
    TransactionConflict { attempts: u32 },
}

impl LedgerError {
    /// Whether the current optimistic attempt should be discarded and re-run.
    pub fn is_conflict(&self) -> bool {
        match self {
            Self::StaleRead(_) => true,
            Self::Database(sqlx::Error::Database(db)) => {
                if db.is_unique_violation() {
                    return true;
                }
                let code = db.code().and_then(|c| c.parse::<i32>().ok());
                code.is_some_and(is_busy_or_locked)
            }
            _ => false,
        }
    }

    /// A duplicate primary or unique key, and nothing else.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::Database(sqlx::Error::Database(db)) if db.is_unique_violation())
    }
}

/// SQLITE_BUSY or SQLITE_LOCKED, including extended codes such as
/// SQLITE_BUSY_SNAPSHOT (517).
fn is_busy_or_locked(code: i32) -> bool {
    matches!(code & 0xff, 5 | 6)
}

pub type Result<T> = std::result::Result<T, LedgerError>;
