use crate::error::{MarketError, Result};
use crate::payment::{Charge, ChargeRequest, PaymentProvider};
use crate::store::MarketStore;
use crate::types::{
    listing_total, Listing, ListingId, ListingStatus, Settlement, SettlementId, SettlementStatus,
};
use chrono::{Duration, Utc};
use everstore_ledger::{CreditLedger, JournalEntry, JournalKind, TransactionJournal};
use everstore_types::{AccountKey, StorageAmount};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

/// How many times the versioned listing update is retried before giving up.
const FILL_RETRIES: usize = 8;

/// Configuration for the two-phase settlement engine
#[derive(Debug, Clone)]
pub struct SettlementConfig {
    /// Share of each sale retained by the operator.
    pub platform_fee_percent: f64,
    /// A fill that leaves no more than this much behind completes the
    /// listing.
    pub completion_epsilon_gb: f64,
    /// How long a Phase-A settlement may wait for confirmation before the
    /// expiry sweep retires it.
    pub pending_ttl_minutes: i64,
}

impl Default for SettlementConfig {
    fn default() -> Self {
        Self {
            platform_fee_percent: 10.0,
            completion_epsilon_gb: 0.001,
            pending_ttl_minutes: 60,
        }
    }
}

/// Phase-A result: the pending settlement plus both hosted charges the
/// buyer must pay.
#[derive(Debug, Clone)]
pub struct InitiatedSettlement {
    pub settlement: Settlement,
    pub fee_charge: Charge,
    pub seller_charge: Charge,
}

/// Two-phase settlement of listing purchases.
///
/// Phase A quotes the fill and creates two independent charges (platform
/// fee and seller payment) without touching the ledger or the listing.
/// Phase B verifies both charges against the provider's full status
/// timeline and only then moves credits. Payment confirmation is external
/// and asynchronous, so Phase B is built to be polled: an unconfirmed
/// charge fails the call without side effects.
pub struct SettlementEngine {
    config: SettlementConfig,
    store: Arc<dyn MarketStore>,
    ledger: Arc<CreditLedger>,
    journal: Arc<TransactionJournal>,
    payments: Arc<dyn PaymentProvider>,
}

impl SettlementEngine {
    pub fn new(
        config: SettlementConfig,
        store: Arc<dyn MarketStore>,
        ledger: Arc<CreditLedger>,
        journal: Arc<TransactionJournal>,
        payments: Arc<dyn PaymentProvider>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            journal,
            payments,
        }
    }

    /// Phase A: validate the fill, create both payment charges and persist
    /// a pending settlement. No credits move here.
    pub async fn purchase(
        &self,
        listing_id: &ListingId,
        buyer: &AccountKey,
        amount_gb: f64,
    ) -> Result<InitiatedSettlement> {
        if !amount_gb.is_finite() || amount_gb <= 0.0 {
            return Err(MarketError::Validation(format!(
                "purchase amount must be positive, got {amount_gb} GB"
            )));
        }

        let listing = self
            .store
            .listing(listing_id)
            .await
            .map_err(|e| MarketError::Store(e.to_string()))?
            .ok_or_else(|| MarketError::NotFound(format!("listing {listing_id}")))?;

        if listing.status != ListingStatus::Active {
            return Err(MarketError::InsufficientListingInventory {
                requested: StorageAmount::from_gb(amount_gb),
                remaining: StorageAmount::ZERO,
            });
        }
        if listing.seller == *buyer {
            return Err(MarketError::SelfTradeNotAllowed);
        }

        let amount = StorageAmount::from_gb(amount_gb);
        if amount > listing.remaining {
            return Err(MarketError::InsufficientListingInventory {
                requested: amount,
                remaining: listing.remaining,
            });
        }

        let total = listing_total(listing.price_per_gb, amount);
        let platform_fee = total.percent(self.config.platform_fee_percent);
        let seller_payment = total
            .checked_sub(platform_fee)
            .ok_or_else(|| MarketError::Validation("fee exceeds sale total".to_string()))?;

        let fee_charge = self
            .payments
            .create_charge(&ChargeRequest {
                amount: platform_fee,
                currency: "USD".to_string(),
                description: format!("Marketplace fee for {amount_gb} GB of storage credits"),
                metadata: json!({
                    "listing_id": listing_id.to_hex(),
                    "role": "platform-fee",
                }),
            })
            .await?;
        let seller_charge = self
            .payments
            .create_charge(&ChargeRequest {
                amount: seller_payment,
                currency: "USD".to_string(),
                description: format!("Seller payment for {amount_gb} GB of storage credits"),
                metadata: json!({
                    "listing_id": listing_id.to_hex(),
                    "role": "seller-payment",
                    "payout_address": listing.payout_address.to_string(),
                }),
            })
            .await?;

        let settlement = Settlement::new(
            *listing_id,
            buyer.clone(),
            listing.seller.clone(),
            amount,
            total,
            platform_fee,
            seller_payment,
            fee_charge.charge_id.clone(),
            seller_charge.charge_id.clone(),
        );
        self.store
            .insert_settlement(&settlement)
            .await
            .map_err(|e| MarketError::Store(e.to_string()))?;

        info!(
            settlement_id = %settlement.id,
            listing_id = %listing_id,
            buyer = %buyer,
            amount_gb = amount_gb,
            total = total.to_usd(),
            platform_fee = platform_fee.to_usd(),
            seller_payment = seller_payment.to_usd(),
            "🤝 Listing purchase initiated"
        );
        Ok(InitiatedSettlement {
            settlement,
            fee_charge,
            seller_charge,
        })
    }

    /// Phase B: verify both payment legs and finalize the credit transfer.
    ///
    /// Requires a confirmed event anywhere in each charge's timeline; the
    /// latest status alone is not trusted. The status flip to `Confirmed`
    /// is a conditional update and doubles as the idempotency guard, so the
    /// same settlement can never deposit twice.
    pub async fn confirm(&self, settlement_id: &SettlementId) -> Result<Settlement> {
        let settlement = self
            .store
            .settlement(settlement_id)
            .await
            .map_err(|e| MarketError::Store(e.to_string()))?
            .ok_or_else(|| MarketError::NotFound(format!("settlement {settlement_id}")))?;

        match settlement.status {
            SettlementStatus::Confirmed => {
                return Err(MarketError::AlreadyCompleted(format!(
                    "settlement {settlement_id}"
                )))
            }
            SettlementStatus::Expired => {
                return Err(MarketError::SettlementExpired(format!(
                    "settlement {settlement_id}"
                )))
            }
            SettlementStatus::PendingConfirmation => {}
        }

        let deadline = settlement.created_at + Duration::minutes(self.config.pending_ttl_minutes);
        if Utc::now() > deadline {
            // The sweep may simply not have run yet.
            self.flip_status(&settlement, SettlementStatus::Expired).await.ok();
            return Err(MarketError::SettlementExpired(format!(
                "settlement {settlement_id} passed its {}-minute confirmation window",
                self.config.pending_ttl_minutes
            )));
        }

        let fee_status = self.payments.charge_status(&settlement.fee_charge_id).await?;
        if !fee_status.has_confirmed_event() {
            return Err(MarketError::PaymentNotConfirmed(format!(
                "platform-fee charge {} has no confirmed event",
                settlement.fee_charge_id
            )));
        }
        let seller_status = self
            .payments
            .charge_status(&settlement.seller_charge_id)
            .await?;
        if !seller_status.has_confirmed_event() {
            return Err(MarketError::PaymentNotConfirmed(format!(
                "seller-payment charge {} has no confirmed event",
                settlement.seller_charge_id
            )));
        }

        // Claim the settlement. A concurrent confirm loses here.
        let confirmed = match self.flip_status(&settlement, SettlementStatus::Confirmed).await {
            Ok(confirmed) => confirmed,
            Err(_) => {
                return Err(MarketError::AlreadyCompleted(format!(
                    "settlement {settlement_id}"
                )))
            }
        };

        // Take the inventory off the listing first: the versioned update is
        // the serialization point that decides overlapping fills, and losing
        // it needs no credit compensation.
        let filled = match self.apply_fill(&settlement).await {
            Ok(filled) => filled,
            Err(e) => {
                self.unclaim(&confirmed, "listing fill failed").await?;
                return Err(e);
            }
        };

        if let Err(deposit_err) = self.ledger.deposit(&settlement.buyer, settlement.amount).await {
            self.restore_inventory(&settlement, "buyer deposit failed").await?;
            self.unclaim(&confirmed, "buyer deposit failed").await?;
            return Err(deposit_err.into());
        }

        if let Err(settle_err) = self.ledger.settle(&settlement.seller, settlement.amount).await {
            // Reverse the buyer deposit, then put everything else back.
            if let Err(withdraw_err) = self
                .ledger
                .withdraw(&settlement.buyer, settlement.amount)
                .await
            {
                error!(
                    settlement_id = %settlement_id,
                    error = %withdraw_err,
                    "Seller settle failed and the buyer withdrawal also failed"
                );
                return Err(MarketError::CompensationFailed(format!(
                    "seller settle failed ({settle_err}) and the buyer withdrawal failed ({withdraw_err})"
                )));
            }
            let entry = JournalEntry::new(
                settlement.buyer.clone(),
                JournalKind::Sale,
                -(settlement.amount.to_mb().round() as i64),
                0,
            )
            .with_metadata(json!({
                "settlement_id": settlement_id.to_hex(),
                "compensation": "seller settle failed",
            }));
            if let Err(e) = self.journal.append(entry).await {
                // This withdrawal is visible nowhere else; losing its record
                // demands manual reconciliation.
                error!(
                    settlement_id = %settlement_id,
                    error = %e,
                    "Failed to journal compensating withdrawal"
                );
            }
            self.restore_inventory(&settlement, "seller settle failed").await?;
            self.unclaim(&confirmed, "seller settle failed").await?;
            return Err(settle_err.into());
        }

        self.journal_sale(&settlement, &filled).await;

        info!(
            settlement_id = %settlement_id,
            listing_id = %settlement.listing_id,
            buyer = %settlement.buyer,
            seller = %settlement.seller,
            amount_gb = settlement.amount.to_gb(),
            listing_status = ?filled.status,
            "✅ Listing purchase settled"
        );
        Ok(confirmed)
    }

    /// Retire pending settlements that outlived the confirmation window.
    /// Phase A moved no credits, so expiry needs no compensation.
    pub async fn expire_pending(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::minutes(self.config.pending_ttl_minutes);
        let pending = self
            .store
            .pending_settlements()
            .await
            .map_err(|e| MarketError::Store(e.to_string()))?;

        let mut expired = 0;
        for settlement in pending {
            if settlement.created_at < cutoff
                && self
                    .flip_status(&settlement, SettlementStatus::Expired)
                    .await
                    .is_ok()
            {
                expired += 1;
            }
        }

        if expired > 0 {
            info!(count = expired, "⏰ Expired stale settlements");
        }
        Ok(expired)
    }

    /// Conditional status transition; fails when the stored row moved on.
    async fn flip_status(
        &self,
        settlement: &Settlement,
        status: SettlementStatus,
    ) -> Result<Settlement> {
        let mut updated = settlement.clone();
        updated.status = status;
        updated.version += 1;
        let swapped = self
            .store
            .put_settlement_if_version(&updated, settlement.version)
            .await
            .map_err(|e| MarketError::Store(e.to_string()))?;
        if !swapped {
            return Err(MarketError::Store(format!(
                "settlement {} changed concurrently",
                settlement.id
            )));
        }
        Ok(updated)
    }

    /// Return a claimed settlement to `PendingConfirmation` after a later
    /// step failed, so a retry (or the expiry sweep) can deal with it.
    async fn unclaim(&self, confirmed: &Settlement, reason: &str) -> Result<()> {
        match self
            .flip_status(confirmed, SettlementStatus::PendingConfirmation)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                error!(
                    settlement_id = %confirmed.id,
                    reason = reason,
                    error = %e,
                    "Failed to return settlement to pending"
                );
                Err(MarketError::CompensationFailed(format!(
                    "{reason} and the settlement {} is stuck confirmed",
                    confirmed.id
                )))
            }
        }
    }

    /// Decrement the listing's inventory, completing it when the remainder
    /// falls inside the epsilon. Retries the versioned update; a loser that
    /// finds too little inventory fails with
    /// `InsufficientListingInventory`.
    async fn apply_fill(&self, settlement: &Settlement) -> Result<Listing> {
        let epsilon = StorageAmount::from_gb(self.config.completion_epsilon_gb);

        for _ in 0..FILL_RETRIES {
            let listing = self
                .store
                .listing(&settlement.listing_id)
                .await
                .map_err(|e| MarketError::Store(e.to_string()))?
                .ok_or_else(|| {
                    MarketError::NotFound(format!("listing {}", settlement.listing_id))
                })?;

            if listing.status != ListingStatus::Active || listing.remaining < settlement.amount {
                return Err(MarketError::InsufficientListingInventory {
                    requested: settlement.amount,
                    remaining: if listing.status == ListingStatus::Active {
                        listing.remaining
                    } else {
                        StorageAmount::ZERO
                    },
                });
            }

            let left = listing.remaining.saturating_sub(settlement.amount);
            let mut updated = listing.clone();
            updated.version += 1;
            if left <= epsilon {
                updated.status = ListingStatus::Completed;
                updated.remaining = StorageAmount::ZERO;
                updated.total_price = everstore_types::UsdAmount::ZERO;
            } else {
                updated.remaining = left;
                updated.total_price = listing_total(listing.price_per_gb, left);
            }

            let swapped = self
                .store
                .put_listing_if_version(&updated, listing.version)
                .await
                .map_err(|e| MarketError::Store(e.to_string()))?;
            if swapped {
                return Ok(updated);
            }
        }

        Err(MarketError::Store(format!(
            "listing {} contention: retries exhausted",
            settlement.listing_id
        )))
    }

    /// Put inventory back on the listing after a failed ledger step.
    async fn restore_inventory(&self, settlement: &Settlement, reason: &str) -> Result<()> {
        for _ in 0..FILL_RETRIES {
            let listing = match self
                .store
                .listing(&settlement.listing_id)
                .await
                .map_err(|e| MarketError::Store(e.to_string()))?
            {
                Some(listing) => listing,
                None => break,
            };

            let restored_amount = listing.remaining.saturating_add(settlement.amount);
            let mut restored = listing.clone();
            restored.status = ListingStatus::Active;
            restored.remaining = restored_amount;
            restored.total_price = listing_total(listing.price_per_gb, restored_amount);
            restored.version += 1;

            let swapped = self
                .store
                .put_listing_if_version(&restored, listing.version)
                .await
                .map_err(|e| MarketError::Store(e.to_string()))?;
            if swapped {
                return Ok(());
            }
        }

        error!(
            settlement_id = %settlement.id,
            listing_id = %settlement.listing_id,
            reason = reason,
            "Failed to restore listing inventory"
        );
        Err(MarketError::CompensationFailed(format!(
            "{reason} and the listing {} inventory could not be restored",
            settlement.listing_id
        )))
    }

    /// Journal both sides of the sale. The balances already moved, so a
    /// miss here is an audit gap, not a lost credit.
    async fn journal_sale(&self, settlement: &Settlement, listing: &Listing) {
        let mb = settlement.amount.to_mb().round() as i64;

        let buyer_entry = JournalEntry::new(
            settlement.buyer.clone(),
            JournalKind::Sale,
            mb,
            settlement.total_price.to_micro() as i64,
        )
        .with_metadata(json!({
            "settlement_id": settlement.id.to_hex(),
            "listing_id": settlement.listing_id.to_hex(),
            "fee_charge_id": settlement.fee_charge_id,
            "seller_charge_id": settlement.seller_charge_id,
            "seller": settlement.seller.to_string(),
        }));
        if let Err(e) = self.journal.append(buyer_entry).await {
            warn!(settlement_id = %settlement.id, error = %e, "Failed to journal buyer side of sale");
        }

        let seller_entry = JournalEntry::new(
            settlement.seller.clone(),
            JournalKind::Sale,
            -mb,
            -(settlement.seller_payment.to_micro() as i64),
        )
        .with_metadata(json!({
            "settlement_id": settlement.id.to_hex(),
            "listing_id": settlement.listing_id.to_hex(),
            "fee_charge_id": settlement.fee_charge_id,
            "seller_charge_id": settlement.seller_charge_id,
            "buyer": settlement.buyer.to_string(),
            "listing_status": listing.status,
        }));
        if let Err(e) = self.journal.append(seller_entry).await {
            warn!(settlement_id = %settlement.id, error = %e, "Failed to journal seller side of sale");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::listing::{ListingConfig, ListingManager};
    use crate::payment::MockPaymentProvider;
    use crate::store::MemoryMarketStore;
    use everstore_ledger::MemoryLedgerStore;
    use everstore_types::{UsdAmount, UserId, WalletAddress};

    struct Harness {
        engine: SettlementEngine,
        listings: ListingManager,
        ledger: Arc<CreditLedger>,
        payments: Arc<MockPaymentProvider>,
    }

    fn harness() -> Harness {
        harness_with(SettlementConfig::default())
    }

    fn harness_with(config: SettlementConfig) -> Harness {
        let ledger_store = Arc::new(MemoryLedgerStore::new());
        let ledger = Arc::new(CreditLedger::new(ledger_store.clone()));
        let journal = Arc::new(TransactionJournal::new(ledger_store));
        let market_store = Arc::new(MemoryMarketStore::new());
        let payments = Arc::new(MockPaymentProvider::new());
        Harness {
            engine: SettlementEngine::new(
                config,
                market_store.clone(),
                ledger.clone(),
                journal.clone(),
                payments.clone(),
            ),
            listings: ListingManager::new(
                ListingConfig::default(),
                market_store,
                ledger.clone(),
                journal,
            ),
            ledger,
            payments,
        }
    }

    fn seller() -> AccountKey {
        AccountKey::new(UserId::new("seller"), WalletAddress::new("ar-seller"))
    }

    fn buyer() -> AccountKey {
        AccountKey::new(UserId::new("buyer"), WalletAddress::new("ar-buyer"))
    }

    async fn listed(h: &Harness, gb: f64, usd_per_gb: f64) -> Listing {
        h.ledger
            .deposit(&seller(), StorageAmount::from_gb(gb))
            .await
            .unwrap();
        h.listings
            .create_listing(
                &seller(),
                WalletAddress::new("payout"),
                gb,
                UsdAmount::from_usd(usd_per_gb),
            )
            .await
            .unwrap()
    }

    async fn pay_both(h: &Harness, initiated: &InitiatedSettlement) {
        h.payments
            .confirm_charge(&initiated.fee_charge.charge_id)
            .await;
        h.payments
            .confirm_charge(&initiated.seller_charge.charge_id)
            .await;
    }

    #[tokio::test]
    async fn full_fill_completes_the_listing() {
        let h = harness();
        let listing = listed(&h, 1.0, 2.0).await;

        let initiated = h.engine.purchase(&listing.id, &buyer(), 1.0).await.unwrap();
        assert_eq!(initiated.settlement.platform_fee, UsdAmount::from_usd(0.20));
        assert_eq!(
            initiated.settlement.seller_payment,
            UsdAmount::from_usd(1.80)
        );

        // Phase A moved nothing.
        assert_eq!(
            h.ledger.balance(&buyer()).await.unwrap().total,
            StorageAmount::ZERO
        );

        pay_both(&h, &initiated).await;
        h.engine.confirm(&initiated.settlement.id).await.unwrap();

        let buyer_balance = h.ledger.balance(&buyer()).await.unwrap();
        assert_eq!(buyer_balance.total, StorageAmount::from_gb(1.0));
        assert_eq!(buyer_balance.available, StorageAmount::from_gb(1.0));

        let seller_balance = h.ledger.balance(&seller()).await.unwrap();
        assert_eq!(seller_balance.total, StorageAmount::ZERO);
        assert_eq!(seller_balance.reserved(), StorageAmount::ZERO);

        let listing = h.listings.listing(&listing.id).await.unwrap();
        assert_eq!(listing.status, ListingStatus::Completed);
        assert_eq!(listing.remaining, StorageAmount::ZERO);
    }

    #[tokio::test]
    async fn partial_fill_shrinks_inventory_and_recomputes_price() {
        let h = harness();
        let listing = listed(&h, 10.0, 2.0).await;

        let initiated = h.engine.purchase(&listing.id, &buyer(), 4.0).await.unwrap();
        pay_both(&h, &initiated).await;
        h.engine.confirm(&initiated.settlement.id).await.unwrap();

        let listing = h.listings.listing(&listing.id).await.unwrap();
        assert_eq!(listing.status, ListingStatus::Active);
        assert_eq!(listing.remaining, StorageAmount::from_gb(6.0));
        assert_eq!(listing.total_price, UsdAmount::from_usd(12.0));
        assert_eq!(listing.price_per_gb, UsdAmount::from_usd(2.0));
    }

    #[tokio::test]
    async fn near_full_fill_within_epsilon_completes() {
        let h = harness();
        let listing = listed(&h, 10.0, 2.0).await;

        let initiated = h
            .engine
            .purchase(&listing.id, &buyer(), 9.9995)
            .await
            .unwrap();
        pay_both(&h, &initiated).await;
        h.engine.confirm(&initiated.settlement.id).await.unwrap();

        let listing = h.listings.listing(&listing.id).await.unwrap();
        assert_eq!(listing.status, ListingStatus::Completed);
        assert_eq!(listing.remaining, StorageAmount::ZERO);
    }

    #[tokio::test]
    async fn confirm_is_idempotent() {
        let h = harness();
        let listing = listed(&h, 1.0, 2.0).await;

        let initiated = h.engine.purchase(&listing.id, &buyer(), 1.0).await.unwrap();
        pay_both(&h, &initiated).await;
        h.engine.confirm(&initiated.settlement.id).await.unwrap();

        let err = h
            .engine
            .confirm(&initiated.settlement.id)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::AlreadyCompleted(_)));
        assert_eq!(
            h.ledger.balance(&buyer()).await.unwrap().total,
            StorageAmount::from_gb(1.0)
        );
    }

    #[tokio::test]
    async fn self_trade_is_rejected() {
        let h = harness();
        let listing = listed(&h, 1.0, 2.0).await;

        let err = h
            .engine
            .purchase(&listing.id, &seller(), 0.5)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::SelfTradeNotAllowed));
    }

    #[tokio::test]
    async fn one_unconfirmed_leg_blocks_settlement() {
        let h = harness();
        let listing = listed(&h, 1.0, 2.0).await;

        let initiated = h.engine.purchase(&listing.id, &buyer(), 1.0).await.unwrap();
        // Only the platform-fee leg is paid.
        h.payments
            .confirm_charge(&initiated.fee_charge.charge_id)
            .await;

        let err = h
            .engine
            .confirm(&initiated.settlement.id)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::PaymentNotConfirmed(_)));
        assert_eq!(
            h.ledger.balance(&buyer()).await.unwrap().total,
            StorageAmount::ZERO
        );

        // Once the second leg confirms, the same call succeeds.
        h.payments
            .confirm_charge(&initiated.seller_charge.charge_id)
            .await;
        h.engine.confirm(&initiated.settlement.id).await.unwrap();
    }

    #[tokio::test]
    async fn transient_confirmation_in_timeline_counts() {
        let h = harness();
        let listing = listed(&h, 1.0, 2.0).await;

        let initiated = h.engine.purchase(&listing.id, &buyer(), 1.0).await.unwrap();
        pay_both(&h, &initiated).await;
        // Provider later reports trailing pending states on both charges.
        h.payments
            .push_event(
                &initiated.fee_charge.charge_id,
                crate::payment::ChargeEventStatus::Pending,
            )
            .await;
        h.payments
            .push_event(
                &initiated.seller_charge.charge_id,
                crate::payment::ChargeEventStatus::Pending,
            )
            .await;

        h.engine.confirm(&initiated.settlement.id).await.unwrap();
    }

    #[tokio::test]
    async fn overbuying_is_rejected_in_phase_a() {
        let h = harness();
        let listing = listed(&h, 2.0, 2.0).await;

        let err = h
            .engine
            .purchase(&listing.id, &buyer(), 3.0)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            MarketError::InsufficientListingInventory { .. }
        ));
    }

    #[tokio::test]
    async fn overlapping_fills_cannot_oversell() {
        let h = harness();
        let listing = listed(&h, 10.0, 2.0).await;

        let first = h.engine.purchase(&listing.id, &buyer(), 6.0).await.unwrap();
        let other_buyer = AccountKey::new(UserId::new("other"), WalletAddress::new("ar-other"));
        let second = h
            .engine
            .purchase(&listing.id, &other_buyer, 7.0)
            .await
            .unwrap();

        pay_both(&h, &first).await;
        pay_both(&h, &second).await;

        let a = h.engine.confirm(&first.settlement.id).await;
        let b = h.engine.confirm(&second.settlement.id).await;

        // Exactly one of the overlapping fills wins.
        assert!(a.is_ok() != b.is_ok());
        let loser = if a.is_ok() { b } else { a };
        assert!(matches!(
            loser.unwrap_err(),
            MarketError::InsufficientListingInventory { .. }
        ));

        let listing = h.listings.listing(&listing.id).await.unwrap();
        let sold = StorageAmount::from_gb(10.0)
            .checked_sub(listing.remaining)
            .unwrap();
        assert!(sold == StorageAmount::from_gb(6.0) || sold == StorageAmount::from_gb(7.0));
    }

    #[tokio::test]
    async fn stale_settlements_expire_and_cannot_confirm() {
        let h = harness_with(SettlementConfig {
            pending_ttl_minutes: 0,
            ..SettlementConfig::default()
        });
        let listing = listed(&h, 1.0, 2.0).await;

        let initiated = h.engine.purchase(&listing.id, &buyer(), 1.0).await.unwrap();
        pay_both(&h, &initiated).await;

        // TTL of zero: the settlement is stale immediately.
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let expired = h.engine.expire_pending().await.unwrap();
        assert_eq!(expired, 1);

        let err = h
            .engine
            .confirm(&initiated.settlement.id)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::SettlementExpired(_)));
        assert_eq!(
            h.ledger.balance(&buyer()).await.unwrap().total,
            StorageAmount::ZERO
        );
    }
}
