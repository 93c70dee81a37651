use crate::balance::CreditBalance;
use crate::journal::JournalEntry;
use anyhow::Result;
use async_trait::async_trait;
use everstore_types::AccountKey;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

/// Persistence seam for balances and the journal. Implementations must
/// provide single-row compare-and-swap on balances; everything else is
/// plain reads and appends.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Balance for an account; absent rows read as all-zero.
    async fn balance(&self, account: &AccountKey) -> Result<CreditBalance>;

    /// Store `next` iff the current row still equals `expected`.
    /// Returns `false` when another writer got there first.
    async fn compare_and_put_balance(
        &self,
        account: &AccountKey,
        expected: &CreditBalance,
        next: &CreditBalance,
    ) -> Result<bool>;

    async fn accounts(&self) -> Result<Vec<AccountKey>>;

    /// Append one immutable journal entry.
    async fn append_entry(&self, entry: JournalEntry) -> Result<()>;

    async fn entries_for(&self, account: &AccountKey) -> Result<Vec<JournalEntry>>;

    async fn all_entries(&self) -> Result<Vec<JournalEntry>>;
}

/// In-memory store for tests, development, and single-process deployments.
pub struct MemoryLedgerStore {
    balances: Arc<RwLock<HashMap<AccountKey, CreditBalance>>>,
    entries: Arc<RwLock<Vec<JournalEntry>>>,
}

impl Default for MemoryLedgerStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryLedgerStore {
    pub fn new() -> Self {
        Self {
            balances: Arc::new(RwLock::new(HashMap::new())),
            entries: Arc::new(RwLock::new(Vec::new())),
        }
    }
}

#[async_trait]
impl LedgerStore for MemoryLedgerStore {
    async fn balance(&self, account: &AccountKey) -> Result<CreditBalance> {
        let balances = self.balances.read().await;
        Ok(balances.get(account).copied().unwrap_or_default())
    }

    async fn compare_and_put_balance(
        &self,
        account: &AccountKey,
        expected: &CreditBalance,
        next: &CreditBalance,
    ) -> Result<bool> {
        let mut balances = self.balances.write().await;
        let current = balances.get(account).copied().unwrap_or_default();
        if current != *expected {
            debug!(
                account = %account,
                storage_type = "memory",
                "Balance swap lost a race"
            );
            return Ok(false);
        }
        balances.insert(account.clone(), *next);
        Ok(true)
    }

    async fn accounts(&self) -> Result<Vec<AccountKey>> {
        let balances = self.balances.read().await;
        Ok(balances.keys().cloned().collect())
    }

    async fn append_entry(&self, entry: JournalEntry) -> Result<()> {
        let mut entries = self.entries.write().await;
        entries.push(entry);
        Ok(())
    }

    async fn entries_for(&self, account: &AccountKey) -> Result<Vec<JournalEntry>> {
        let entries = self.entries.read().await;
        Ok(entries
            .iter()
            .filter(|e| e.account == *account)
            .cloned()
            .collect())
    }

    async fn all_entries(&self) -> Result<Vec<JournalEntry>> {
        let entries = self.entries.read().await;
        Ok(entries.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use everstore_types::{StorageAmount, UserId, WalletAddress};

    fn account() -> AccountKey {
        AccountKey::new(UserId::new("user"), WalletAddress::new("wallet"))
    }

    #[tokio::test]
    async fn absent_account_reads_zero() {
        let store = MemoryLedgerStore::new();
        let b = store.balance(&account()).await.unwrap();
        assert_eq!(b, CreditBalance::default());
    }

    #[tokio::test]
    async fn compare_and_put_detects_conflicts() {
        let store = MemoryLedgerStore::new();
        let acct = account();

        let zero = CreditBalance::default();
        let next = CreditBalance {
            total: StorageAmount::from_mb(100.0),
            used: StorageAmount::ZERO,
            available: StorageAmount::from_mb(100.0),
        };

        assert!(store
            .compare_and_put_balance(&acct, &zero, &next)
            .await
            .unwrap());
        // Stale expectation loses.
        assert!(!store
            .compare_and_put_balance(&acct, &zero, &next)
            .await
            .unwrap());
        assert_eq!(store.balance(&acct).await.unwrap(), next);
    }
}
