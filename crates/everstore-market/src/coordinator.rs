use crate::error::Result;
use crate::limits::{RateLimiter, RateLimiterConfig};
use crate::listing::{ListingConfig, ListingManager};
use crate::payment::{Charge, PaymentProvider};
use crate::pricing::{PriceQuote, PricingOracle};
use crate::purchase::{PurchaseConfig, PurchaseManager, StorageSelector};
use crate::settlement::{InitiatedSettlement, SettlementConfig, SettlementEngine};
use crate::store::MarketStore;
use crate::types::{Listing, ListingId, PaymentRail, PurchaseId, Settlement, SettlementId, StoragePurchase};
use everstore_ledger::{
    CreditBalance, CreditLedger, JournalEntry, JournalKind, LedgerStore, TransactionJournal,
    UsageStats,
};
use everstore_types::{AccountKey, StorageAmount, UsdAmount, WalletAddress};
use std::sync::Arc;
use tracing::{info, warn};

/// Configuration for the whole market
#[derive(Debug, Clone, Default)]
pub struct MarketConfig {
    pub purchase: PurchaseConfig,
    pub listing: ListingConfig,
    pub settlement: SettlementConfig,
    pub limits: RateLimiterConfig,
}

/// Aggregate counters for dashboards and the node's status log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MarketStats {
    pub active_listings: usize,
    pub pending_settlements: usize,
    pub accounts: usize,
}

/// One account's balance plus its trailing usage statistics.
#[derive(Debug, Clone)]
pub struct AccountSummary {
    pub account: AccountKey,
    pub balance: CreditBalance,
    pub usage: UsageStats,
}

/// Central entry point composing the ledger, journal, pricing oracle,
/// payment provider and the purchase/listing/settlement managers into the
/// typed operations the API gateway calls.
pub struct CreditMarket {
    ledger: Arc<CreditLedger>,
    journal: Arc<TransactionJournal>,
    ledger_store: Arc<dyn LedgerStore>,
    market_store: Arc<dyn MarketStore>,
    purchases: PurchaseManager,
    listings: ListingManager,
    settlements: SettlementEngine,
    limiter: Arc<RateLimiter>,
}

impl CreditMarket {
    pub fn new(
        config: MarketConfig,
        ledger_store: Arc<dyn LedgerStore>,
        market_store: Arc<dyn MarketStore>,
        oracle: Arc<PricingOracle>,
        payments: Arc<dyn PaymentProvider>,
        limiter: Arc<RateLimiter>,
    ) -> Self {
        let ledger = Arc::new(CreditLedger::new(ledger_store.clone()));
        let journal = Arc::new(TransactionJournal::new(ledger_store.clone()));

        let purchases = PurchaseManager::new(
            config.purchase,
            market_store.clone(),
            ledger.clone(),
            journal.clone(),
            oracle,
            payments.clone(),
        );
        let listings = ListingManager::new(
            config.listing,
            market_store.clone(),
            ledger.clone(),
            journal.clone(),
        );
        let settlements = SettlementEngine::new(
            config.settlement,
            market_store.clone(),
            ledger.clone(),
            journal.clone(),
            payments,
        );

        Self {
            ledger,
            journal,
            ledger_store,
            market_store,
            purchases,
            listings,
            settlements,
            limiter,
        }
    }

    /// Side-effect-free price quote.
    pub async fn quote(&self, selector: &StorageSelector) -> Result<(f64, PriceQuote)> {
        self.purchases.quote(selector).await
    }

    pub async fn initiate_purchase(
        &self,
        account: &AccountKey,
        selector: &StorageSelector,
        rail: PaymentRail,
    ) -> Result<(StoragePurchase, Charge)> {
        self.limiter.check(account, "initiate_purchase").await?;
        self.purchases.initiate(account, selector, rail).await
    }

    pub async fn confirm_purchase(&self, purchase_id: &PurchaseId) -> Result<StoragePurchase> {
        self.purchases.confirm(purchase_id).await
    }

    pub async fn create_listing(
        &self,
        seller: &AccountKey,
        payout_address: WalletAddress,
        amount_gb: f64,
        price_per_gb: UsdAmount,
    ) -> Result<Listing> {
        self.limiter.check(seller, "create_listing").await?;
        self.listings
            .create_listing(seller, payout_address, amount_gb, price_per_gb)
            .await
    }

    pub async fn cancel_listing(
        &self,
        listing_id: &ListingId,
        caller: &AccountKey,
    ) -> Result<Listing> {
        self.listings.cancel_listing(listing_id, caller).await
    }

    pub async fn active_listings(&self) -> Result<Vec<Listing>> {
        self.listings.active_listings().await
    }

    pub async fn record_listing_view(&self, listing_id: &ListingId) -> Result<()> {
        self.listings.record_view(listing_id).await
    }

    /// Phase A of a listing purchase.
    pub async fn purchase_listing(
        &self,
        listing_id: &ListingId,
        buyer: &AccountKey,
        amount_gb: f64,
    ) -> Result<InitiatedSettlement> {
        self.limiter.check(buyer, "purchase_listing").await?;
        self.settlements.purchase(listing_id, buyer, amount_gb).await
    }

    /// Phase B of a listing purchase; safe to poll until both charges
    /// confirm.
    pub async fn confirm_listing_purchase(
        &self,
        settlement_id: &SettlementId,
    ) -> Result<Settlement> {
        self.settlements.confirm(settlement_id).await
    }

    /// Spend credits against an upload and journal the usage.
    pub async fn record_usage(
        &self,
        account: &AccountKey,
        mb: f64,
        metadata: serde_json::Value,
    ) -> Result<CreditBalance> {
        let amount = StorageAmount::from_mb(mb);
        let balance = self.ledger.consume(account, amount).await?;

        let entry = JournalEntry::new(
            account.clone(),
            JournalKind::Usage,
            -(amount.to_mb().round() as i64),
            0,
        )
        .with_metadata(metadata);
        if let Err(e) = self.journal.append(entry).await {
            warn!(account = %account, error = %e, "Failed to journal usage");
        }

        Ok(balance)
    }

    pub async fn account_summary(
        &self,
        account: &AccountKey,
        since_days: i64,
    ) -> Result<AccountSummary> {
        let balance = self.ledger.balance(account).await?;
        let usage = self
            .journal
            .project(account, since_days, balance.available)
            .await?;
        Ok(AccountSummary {
            account: account.clone(),
            balance,
            usage,
        })
    }

    /// Retire Phase-A settlements that outlived their confirmation window.
    pub async fn expire_pending_settlements(&self) -> Result<usize> {
        self.settlements.expire_pending().await
    }

    pub async fn market_stats(&self) -> Result<MarketStats> {
        let active_listings = self.listings.active_listings().await?.len();
        let pending_settlements = self
            .market_store
            .pending_settlements()
            .await
            .map_err(|e| crate::error::MarketError::Store(e.to_string()))?
            .len();
        let accounts = self
            .ledger_store
            .accounts()
            .await
            .map_err(|e| crate::error::MarketError::Store(e.to_string()))?
            .len();

        let stats = MarketStats {
            active_listings,
            pending_settlements,
            accounts,
        };
        info!(
            active_listings = stats.active_listings,
            pending_settlements = stats.pending_settlements,
            accounts = stats.accounts,
            "📊 Market stats"
        );
        Ok(stats)
    }

    pub fn ledger(&self) -> &Arc<CreditLedger> {
        &self.ledger
    }

    pub fn journal(&self) -> &Arc<TransactionJournal> {
        &self.journal
    }
}
