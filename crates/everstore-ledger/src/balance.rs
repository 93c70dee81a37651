use crate::error::{LedgerError, Result};
use crate::store::LedgerStore;
use everstore_types::{AccountKey, StorageAmount};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// How many times a conditional balance update is retried before giving up.
const CAS_RETRIES: usize = 32;

/// One account's credit balance, in kilobyte base units.
///
/// `available = total - used` holds whenever no listing reservation is
/// outstanding; `reserve` opens an excursion (available dips below
/// `total - used`) that `release` closes by returning the credits and
/// `settle` closes by dropping `total` when the credits leave for good.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreditBalance {
    pub total: StorageAmount,
    pub used: StorageAmount,
    pub available: StorageAmount,
}

impl CreditBalance {
    /// Credits currently held back by active listings.
    pub fn reserved(&self) -> StorageAmount {
        self.total
            .saturating_sub(self.used)
            .saturating_sub(self.available)
    }
}

/// Sole writer of credit balances. Every operation is scoped to one
/// (user, wallet) pair and applied with compare-and-swap against the store,
/// so concurrent mutations of the same account serialize.
pub struct CreditLedger {
    store: Arc<dyn LedgerStore>,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn LedgerStore>) -> Self {
        Self { store }
    }

    /// Current balance; accounts that have never been touched read as zero.
    pub async fn balance(&self, account: &AccountKey) -> Result<CreditBalance> {
        self.store
            .balance(account)
            .await
            .map_err(|e| LedgerError::Storage(e.to_string()))
    }

    /// Credit newly purchased or received storage.
    pub async fn deposit(&self, account: &AccountKey, amount: StorageAmount) -> Result<CreditBalance> {
        if amount.is_zero() {
            return self.balance(account).await;
        }

        let (before, after) = self
            .mutate(account, |current| {
                let total = current
                    .total
                    .checked_add(amount)
                    .ok_or_else(|| LedgerError::Overflow {
                        account: account.to_string(),
                    })?;
                let available =
                    current
                        .available
                        .checked_add(amount)
                        .ok_or_else(|| LedgerError::Overflow {
                            account: account.to_string(),
                        })?;
                Ok(CreditBalance {
                    total,
                    used: current.used,
                    available,
                })
            })
            .await?;

        info!(
            account = %account,
            amount_mb = amount.to_mb(),
            available_before = before.available.to_mb(),
            available_after = after.available.to_mb(),
            "💰 Credits deposited"
        );
        Ok(after)
    }

    /// Hold credits back for an active listing. The held amount leaves the
    /// spendable pool immediately, before any buyer appears.
    pub async fn reserve(&self, account: &AccountKey, amount: StorageAmount) -> Result<CreditBalance> {
        if amount.is_zero() {
            return self.balance(account).await;
        }

        let (before, after) = self
            .mutate(account, |current| {
                let available = current.available.checked_sub(amount).ok_or(
                    LedgerError::InsufficientCredits {
                        required: amount,
                        available: current.available,
                    },
                )?;
                Ok(CreditBalance {
                    total: current.total,
                    used: current.used,
                    available,
                })
            })
            .await?;

        info!(
            account = %account,
            amount_mb = amount.to_mb(),
            available_before = before.available.to_mb(),
            available_after = after.available.to_mb(),
            "🔒 Credits reserved"
        );
        Ok(after)
    }

    /// Return previously reserved credits to the spendable pool (listing
    /// cancelled, or compensation after a failed multi-step workflow).
    pub async fn release(&self, account: &AccountKey, amount: StorageAmount) -> Result<CreditBalance> {
        if amount.is_zero() {
            return self.balance(account).await;
        }

        let (before, after) = self
            .mutate(account, |current| {
                let reserved = current.reserved();
                if reserved < amount {
                    return Err(LedgerError::ExcessRelease {
                        reserved,
                        requested: amount,
                    });
                }
                let available =
                    current
                        .available
                        .checked_add(amount)
                        .ok_or_else(|| LedgerError::Overflow {
                            account: account.to_string(),
                        })?;
                Ok(CreditBalance {
                    total: current.total,
                    used: current.used,
                    available,
                })
            })
            .await?;

        info!(
            account = %account,
            amount_mb = amount.to_mb(),
            available_before = before.available.to_mb(),
            available_after = after.available.to_mb(),
            "🔓 Credits released"
        );
        Ok(after)
    }

    /// Spend credits against an upload.
    pub async fn consume(&self, account: &AccountKey, amount: StorageAmount) -> Result<CreditBalance> {
        if amount.is_zero() {
            return self.balance(account).await;
        }

        let (before, after) = self
            .mutate(account, |current| {
                let available = current.available.checked_sub(amount).ok_or(
                    LedgerError::InsufficientCredits {
                        required: amount,
                        available: current.available,
                    },
                )?;
                let used = current
                    .used
                    .checked_add(amount)
                    .ok_or_else(|| LedgerError::Overflow {
                        account: account.to_string(),
                    })?;
                Ok(CreditBalance {
                    total: current.total,
                    used,
                    available,
                })
            })
            .await?;

        info!(
            account = %account,
            amount_mb = amount.to_mb(),
            available_before = before.available.to_mb(),
            available_after = after.available.to_mb(),
            used_after = after.used.to_mb(),
            "💸 Credits consumed"
        );
        Ok(after)
    }

    /// Finalize a reservation whose credits leave the account for good
    /// (a listing sold to a buyer): the sold amount drops out of `total`.
    pub async fn settle(&self, account: &AccountKey, amount: StorageAmount) -> Result<CreditBalance> {
        if amount.is_zero() {
            return self.balance(account).await;
        }

        let (before, after) = self
            .mutate(account, |current| {
                let reserved = current.reserved();
                if reserved < amount {
                    return Err(LedgerError::ExcessRelease {
                        reserved,
                        requested: amount,
                    });
                }
                let total = current.total.checked_sub(amount).ok_or(
                    LedgerError::InsufficientCredits {
                        required: amount,
                        available: current.total,
                    },
                )?;
                Ok(CreditBalance {
                    total,
                    used: current.used,
                    available: current.available,
                })
            })
            .await?;

        info!(
            account = %account,
            amount_mb = amount.to_mb(),
            total_before = before.total.to_mb(),
            total_after = after.total.to_mb(),
            "📤 Reserved credits settled"
        );
        Ok(after)
    }

    /// Compensating reversal of a `deposit` that a later workflow step
    /// invalidated. Fails like `reserve` if the credits were already spent.
    pub async fn withdraw(&self, account: &AccountKey, amount: StorageAmount) -> Result<CreditBalance> {
        if amount.is_zero() {
            return self.balance(account).await;
        }

        let (before, after) = self
            .mutate(account, |current| {
                let available = current.available.checked_sub(amount).ok_or(
                    LedgerError::InsufficientCredits {
                        required: amount,
                        available: current.available,
                    },
                )?;
                let total = current.total.checked_sub(amount).ok_or(
                    LedgerError::InsufficientCredits {
                        required: amount,
                        available: current.total,
                    },
                )?;
                Ok(CreditBalance {
                    total,
                    used: current.used,
                    available,
                })
            })
            .await?;

        info!(
            account = %account,
            amount_mb = amount.to_mb(),
            available_before = before.available.to_mb(),
            available_after = after.available.to_mb(),
            "↩️ Deposit withdrawn"
        );
        Ok(after)
    }

    /// Read-modify-write with compare-and-swap. The store creates the row
    /// lazily: an absent account reads as all-zero and the first successful
    /// swap persists it.
    async fn mutate<F>(&self, account: &AccountKey, f: F) -> Result<(CreditBalance, CreditBalance)>
    where
        F: Fn(CreditBalance) -> Result<CreditBalance>,
    {
        for _ in 0..CAS_RETRIES {
            let current = self.balance(account).await?;
            let next = f(current)?;
            let swapped = self
                .store
                .compare_and_put_balance(account, &current, &next)
                .await
                .map_err(|e| LedgerError::Storage(e.to_string()))?;
            if swapped {
                return Ok((current, next));
            }
        }
        Err(LedgerError::Contention {
            account: account.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryLedgerStore;
    use everstore_types::{UserId, WalletAddress};

    fn account(user: &str) -> AccountKey {
        AccountKey::new(UserId::new(user), WalletAddress::new(format!("{user}-wallet")))
    }

    fn ledger() -> CreditLedger {
        CreditLedger::new(Arc::new(MemoryLedgerStore::new()))
    }

    fn mb(v: f64) -> StorageAmount {
        StorageAmount::from_mb(v)
    }

    #[tokio::test]
    async fn conservation_over_closed_sequences() {
        let ledger = ledger();
        let acct = account("alice");

        ledger.deposit(&acct, mb(1024.0)).await.unwrap();
        ledger.reserve(&acct, mb(256.0)).await.unwrap();
        ledger.release(&acct, mb(256.0)).await.unwrap();
        ledger.consume(&acct, mb(100.0)).await.unwrap();
        let b = ledger.balance(&acct).await.unwrap();

        assert_eq!(b.total, mb(1024.0));
        assert_eq!(b.used, mb(100.0));
        assert_eq!(b.available, b.total.checked_sub(b.used).unwrap());
        assert_eq!(b.reserved(), StorageAmount::ZERO);
    }

    #[tokio::test]
    async fn reserve_opens_an_excursion_settle_closes_it() {
        let ledger = ledger();
        let acct = account("bob");

        ledger.deposit(&acct, mb(1000.0)).await.unwrap();
        let b = ledger.reserve(&acct, mb(400.0)).await.unwrap();
        assert_eq!(b.available, mb(600.0));
        assert_eq!(b.reserved(), mb(400.0));

        let b = ledger.settle(&acct, mb(400.0)).await.unwrap();
        assert_eq!(b.total, mb(600.0));
        assert_eq!(b.available, mb(600.0));
        assert_eq!(b.reserved(), StorageAmount::ZERO);
    }

    #[tokio::test]
    async fn insufficient_credits_leaves_balance_unchanged() {
        let ledger = ledger();
        let acct = account("carol");

        ledger.deposit(&acct, mb(50.0)).await.unwrap();
        let err = ledger.reserve(&acct, mb(100.0)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientCredits { .. }));

        let err = ledger.consume(&acct, mb(100.0)).await.unwrap_err();
        assert!(matches!(err, LedgerError::InsufficientCredits { .. }));

        let b = ledger.balance(&acct).await.unwrap();
        assert_eq!(b.total, mb(50.0));
        assert_eq!(b.available, mb(50.0));
        assert_eq!(b.used, StorageAmount::ZERO);
    }

    #[tokio::test]
    async fn release_beyond_reservation_is_rejected() {
        let ledger = ledger();
        let acct = account("dave");

        ledger.deposit(&acct, mb(100.0)).await.unwrap();
        ledger.reserve(&acct, mb(30.0)).await.unwrap();

        let err = ledger.release(&acct, mb(60.0)).await.unwrap_err();
        assert!(matches!(err, LedgerError::ExcessRelease { .. }));
    }

    #[tokio::test]
    async fn lazy_account_creation() {
        let ledger = ledger();
        let acct = account("eve");

        let b = ledger.balance(&acct).await.unwrap();
        assert_eq!(b, CreditBalance::default());

        let b = ledger.deposit(&acct, mb(10.0)).await.unwrap();
        assert_eq!(b.total, mb(10.0));
    }

    #[tokio::test]
    async fn concurrent_deposits_serialize() {
        let ledger = Arc::new(ledger());
        let acct = account("frank");

        let mut handles = Vec::new();
        for _ in 0..10 {
            let ledger = ledger.clone();
            let acct = acct.clone();
            handles.push(tokio::spawn(async move {
                ledger.deposit(&acct, mb(10.0)).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        let b = ledger.balance(&acct).await.unwrap();
        assert_eq!(b.total, mb(100.0));
        assert_eq!(b.available, mb(100.0));
    }
}
