use crate::error::{LedgerError, Result};
use crate::store::LedgerStore;
use chrono::{DateTime, Duration, Utc};
use everstore_types::{AccountKey, StorageAmount, UsdAmount};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// What kind of balance-affecting event an entry records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JournalKind {
    Purchase,
    Sale,
    ListingCreated,
    ListingCancelled,
    Usage,
}

/// Immutable audit record. Amounts are signed: megabytes are negative for
/// debits and sales out of the account, cost is negative when money is paid
/// out to the account holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalEntry {
    pub account: AccountKey,
    pub kind: JournalKind,
    pub amount_mb: i64,
    pub cost_micro_usd: i64,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl JournalEntry {
    pub fn new(account: AccountKey, kind: JournalKind, amount_mb: i64, cost_micro_usd: i64) -> Self {
        Self {
            account,
            kind,
            amount_mb,
            cost_micro_usd,
            metadata: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    pub fn with_metadata(mut self, metadata: serde_json::Value) -> Self {
        self.metadata = metadata;
        self
    }
}

/// Read-side aggregation over the last N days of usage entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageStats {
    pub upload_count: u64,
    pub bytes_uploaded: u64,
    pub spend: UsdAmount,
    /// Linear projection of how long the available balance lasts at the
    /// observed usage rate. `None` with fewer than one usage entry in the
    /// window.
    pub estimated_days_left: Option<f64>,
}

/// Append-only log of every ledger-affecting event. Write-once; read by
/// auditing and the usage projection.
pub struct TransactionJournal {
    store: Arc<dyn LedgerStore>,
}

impl TransactionJournal {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Pure insert; fails only on storage-layer unavailability.
    pub async fn append(&self, entry: JournalEntry) -> Result<()> {
        self.store
            .append_entry(entry)
            .await
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    pub async fn entries_for(&self, account: &AccountKey) -> Result<Vec<JournalEntry>> {
        self.store
            .entries_for(account)
            .await
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    pub async fn all_entries(&self) -> Result<Vec<JournalEntry>> {
        self.store
            .all_entries()
            .await
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    /// Usage statistics over the trailing window, plus a linear
    /// days-remaining estimate against the given available balance.
    pub async fn project(
        &self,
        account: &AccountKey,
        since_days: i64,
        available: StorageAmount,
    ) -> Result<UsageStats> {
        let cutoff = Utc::now() - Duration::days(since_days);
        let entries = self.entries_for(account).await?;

        let usage: Vec<&JournalEntry> = entries
            .iter()
            .filter(|e| e.kind == JournalKind::Usage && e.timestamp >= cutoff)
            .collect();

        let upload_count = usage.len() as u64;
        let mb_used: u64 = usage.iter().map(|e| e.amount_mb.unsigned_abs()).sum();
        let bytes_uploaded = mb_used * 1024 * 1024;
        let spend_micro: u64 = usage
            .iter()
            .map(|e| e.cost_micro_usd.unsigned_abs())
            .sum();

        let estimated_days_left = if upload_count == 0 || mb_used == 0 {
            None
        } else {
            let mb_per_day = mb_used as f64 / since_days.max(1) as f64;
            Some(available.to_mb() / mb_per_day)
        };

        let stats = UsageStats {
            upload_count,
            bytes_uploaded,
            spend: UsdAmount::from_micro(spend_micro),
            estimated_days_left,
        };

        info!(
            account = %account,
            window_days = since_days,
            uploads = stats.upload_count,
            "📊 Usage projected"
        );
        Ok(stats)
    }
}
