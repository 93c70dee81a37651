//! # Everstore Credit Ledger
//!
//! Owns the authoritative storage-credit balance per (user, wallet) pair and
//! the append-only transaction journal. All balance changes in the system go
//! through [`CreditLedger`]; no other component writes balance fields.
//!
//! Balances are serialized per account with compare-and-swap against the
//! backing [`LedgerStore`], so concurrent requests touching the same account
//! cannot interleave a read-modify-write.

pub mod balance;
pub mod error;
pub mod journal;
pub mod store;

pub use balance::{CreditBalance, CreditLedger};
pub use error::{LedgerError, Result};
pub use journal::{JournalEntry, JournalKind, TransactionJournal, UsageStats};
pub use store::{LedgerStore, MemoryLedgerStore};
