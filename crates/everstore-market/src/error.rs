use everstore_ledger::LedgerError;
use everstore_types::{StorageAmount, UsdAmount};
use thiserror::Error;

/// Market error types
#[derive(Error, Debug, Clone)]
pub enum MarketError {
    /// Bad input, rejected before any mutation
    #[error("validation failed: {0}")]
    Validation(String),

    /// The account's spendable credits cannot cover the operation
    #[error("insufficient storage credits: required {required}, available {available}")]
    InsufficientCredits {
        required: StorageAmount,
        available: StorageAmount,
    },

    /// The listing no longer has enough unsold inventory
    #[error("listing no longer available: requested {requested}, remaining {remaining}")]
    InsufficientListingInventory {
        requested: StorageAmount,
        remaining: StorageAmount,
    },

    /// Buyer and seller are the same account
    #[error("cannot purchase your own listing")]
    SelfTradeNotAllowed,

    /// Re-confirming a record that already settled
    #[error("already completed: {0}")]
    AlreadyCompleted(String),

    /// Paid amount deviates from the quote beyond the tolerance
    #[error("price mismatch: quoted {quoted}, paid {paid}")]
    PriceMismatch { quoted: UsdAmount, paid: UsdAmount },

    /// One or both payment legs have no confirmed event yet
    #[error("payment not confirmed: {0}")]
    PaymentNotConfirmed(String),

    /// The pending settlement outlived its confirmation window
    #[error("settlement expired: {0}")]
    SettlementExpired(String),

    /// Too many operations from one account inside the window
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// Referenced record does not exist
    #[error("not found: {0}")]
    NotFound(String),

    /// Pricing oracle or payment provider unreachable, timed out, or
    /// returned an unusable value
    #[error("external service unavailable: {0}")]
    ExternalServiceUnavailable(String),

    /// A best-effort rollback itself failed; manual reconciliation needed
    #[error("compensation failed: {0}")]
    CompensationFailed(String),

    /// Typed pass-through of a ledger rejection
    #[error("ledger error: {0}")]
    Ledger(String),

    /// Persistence plumbing failure
    #[error("store error: {0}")]
    Store(String),
}

impl From<LedgerError> for MarketError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientCredits {
                required,
                available,
            } => MarketError::InsufficientCredits {
                required,
                available,
            },
            other => MarketError::Ledger(other.to_string()),
        }
    }
}

/// Result type for market operations
pub type Result<T> = std::result::Result<T, MarketError>;
