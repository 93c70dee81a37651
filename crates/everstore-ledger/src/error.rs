use everstore_types::StorageAmount;
use thiserror::Error;

/// Ledger error types
#[derive(Error, Debug, Clone)]
pub enum LedgerError {
    /// The account's available balance cannot cover the requested amount
    #[error("insufficient storage credits: required {required}, available {available}")]
    InsufficientCredits {
        required: StorageAmount,
        available: StorageAmount,
    },

    /// Releasing or settling more than is currently reserved
    #[error("amount exceeds outstanding reservation: reserved {reserved}, requested {requested}")]
    ExcessRelease {
        reserved: StorageAmount,
        requested: StorageAmount,
    },

    /// Balance arithmetic overflow
    #[error("balance overflow for {account}")]
    Overflow { account: String },

    /// Conditional update lost too many races in a row
    #[error("balance contention for {account}: retries exhausted")]
    Contention { account: String },

    /// Storage-layer failure
    #[error("ledger storage error: {0}")]
    Storage(String),
}

/// Result type for ledger operations
pub type Result<T> = std::result::Result<T, LedgerError>;
