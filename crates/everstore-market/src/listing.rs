use crate::error::{MarketError, Result};
use crate::pricing::MIN_TOTAL_PRICE;
use crate::store::MarketStore;
use crate::types::{listing_total, Listing, ListingId, ListingStatus};
use everstore_ledger::{CreditLedger, JournalEntry, JournalKind, TransactionJournal};
use everstore_types::{AccountKey, StorageAmount, UsdAmount, WalletAddress};
use serde_json::json;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Configuration for listing creation
#[derive(Debug, Clone)]
pub struct ListingConfig {
    /// Smallest total asking price a listing may carry.
    pub min_total_price: UsdAmount,
}

impl Default for ListingConfig {
    fn default() -> Self {
        Self {
            min_total_price: MIN_TOTAL_PRICE,
        }
    }
}

/// Manages the listing lifecycle: `Active -> {Completed | Cancelled}`.
///
/// Creating a listing reserves the listed credits out of the seller's
/// spendable pool immediately; cancellation returns them. Fills are applied
/// by the settlement engine.
pub struct ListingManager {
    config: ListingConfig,
    store: Arc<dyn MarketStore>,
    ledger: Arc<CreditLedger>,
    journal: Arc<TransactionJournal>,
}

impl ListingManager {
    pub fn new(
        config: ListingConfig,
        store: Arc<dyn MarketStore>,
        ledger: Arc<CreditLedger>,
        journal: Arc<TransactionJournal>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            journal,
        }
    }

    /// Put surplus credits up for sale. The listed amount is reserved
    /// before the listing row exists; if persisting the row fails the
    /// reservation is compensated by an immediate release.
    pub async fn create_listing(
        &self,
        seller: &AccountKey,
        payout_address: WalletAddress,
        amount_gb: f64,
        price_per_gb: UsdAmount,
    ) -> Result<Listing> {
        if !amount_gb.is_finite() || amount_gb <= 0.0 {
            return Err(MarketError::Validation(format!(
                "listing amount must be positive, got {amount_gb} GB"
            )));
        }
        if price_per_gb.is_zero() {
            return Err(MarketError::Validation(
                "price per GB must be positive".to_string(),
            ));
        }
        if payout_address.is_empty() {
            return Err(MarketError::Validation(
                "payout address must not be empty".to_string(),
            ));
        }
        let amount = StorageAmount::from_gb(amount_gb);
        let total = listing_total(price_per_gb, amount);
        if total < self.config.min_total_price {
            return Err(MarketError::Validation(format!(
                "total price {} is below the minimum of {}",
                total, self.config.min_total_price
            )));
        }

        self.ledger.reserve(seller, amount).await?;

        let listing = Listing::new(seller.clone(), payout_address, amount, price_per_gb);
        if let Err(store_err) = self.store.insert_listing(&listing).await {
            // Compensate: hand the reserved credits back before surfacing.
            match self.ledger.release(seller, amount).await {
                Ok(_) => {
                    let entry = JournalEntry::new(
                        seller.clone(),
                        JournalKind::ListingCancelled,
                        amount.to_mb().round() as i64,
                        0,
                    )
                    .with_metadata(json!({
                        "listing_id": listing.id.to_hex(),
                        "compensation": "listing persist failed",
                    }));
                    if let Err(e) = self.journal.append(entry).await {
                        error!(
                            listing_id = %listing.id,
                            error = %e,
                            "Failed to journal listing-creation compensation"
                        );
                    }
                }
                Err(release_err) => {
                    error!(
                        listing_id = %listing.id,
                        seller = %seller,
                        error = %release_err,
                        "Releasing reserved credits after a failed listing insert also failed"
                    );
                    return Err(MarketError::CompensationFailed(format!(
                        "listing insert failed ({store_err}) and the release failed ({release_err})"
                    )));
                }
            }
            return Err(MarketError::Store(store_err.to_string()));
        }

        let entry = JournalEntry::new(
            seller.clone(),
            JournalKind::ListingCreated,
            -(amount.to_mb().round() as i64),
            0,
        )
        .with_metadata(json!({
            "listing_id": listing.id.to_hex(),
            "price_per_gb": price_per_gb.to_usd(),
            "total_price": total.to_usd(),
        }));
        if let Err(e) = self.journal.append(entry).await {
            warn!(listing_id = %listing.id, error = %e, "Failed to journal listing creation");
        }

        info!(
            listing_id = %listing.id,
            seller = %seller,
            amount_gb = amount_gb,
            price_per_gb = price_per_gb.to_usd(),
            total_price = total.to_usd(),
            "🏷️ Listing created"
        );
        Ok(listing)
    }

    /// Seller-initiated cancellation of an active listing. The unsold
    /// remainder returns to the seller's spendable pool.
    pub async fn cancel_listing(&self, listing_id: &ListingId, caller: &AccountKey) -> Result<Listing> {
        let listing = self
            .store
            .listing(listing_id)
            .await
            .map_err(|e| MarketError::Store(e.to_string()))?
            .ok_or_else(|| MarketError::NotFound(format!("listing {listing_id}")))?;

        if listing.seller != *caller {
            return Err(MarketError::Validation(
                "only the listing owner may cancel it".to_string(),
            ));
        }
        if listing.status != ListingStatus::Active {
            return Err(MarketError::Validation(format!(
                "listing {listing_id} is not active"
            )));
        }

        let remaining = listing.remaining;
        let mut cancelled = listing.clone();
        cancelled.status = ListingStatus::Cancelled;
        cancelled.version += 1;
        let flipped = self
            .store
            .put_listing_if_version(&cancelled, listing.version)
            .await
            .map_err(|e| MarketError::Store(e.to_string()))?;
        if !flipped {
            // A concurrent fill or cancel got there first.
            return Err(MarketError::Validation(format!(
                "listing {listing_id} changed concurrently, retry the cancel"
            )));
        }

        if let Err(release_err) = self.ledger.release(&listing.seller, remaining).await {
            // Roll the status flip back so the listing stays sellable.
            let mut restored = cancelled.clone();
            restored.status = ListingStatus::Active;
            restored.version += 1;
            let rolled_back = self
                .store
                .put_listing_if_version(&restored, cancelled.version)
                .await
                .unwrap_or(false);
            if !rolled_back {
                error!(
                    listing_id = %listing_id,
                    seller = %listing.seller,
                    error = %release_err,
                    "Release failed and the status rollback also failed"
                );
                return Err(MarketError::CompensationFailed(format!(
                    "release failed ({release_err}) and the listing is stuck cancelled"
                )));
            }
            return Err(release_err.into());
        }

        let entry = JournalEntry::new(
            listing.seller.clone(),
            JournalKind::ListingCancelled,
            remaining.to_mb().round() as i64,
            0,
        )
        .with_metadata(json!({
            "listing_id": listing_id.to_hex(),
            "returned_gb": remaining.to_gb(),
        }));
        if let Err(e) = self.journal.append(entry).await {
            warn!(listing_id = %listing_id, error = %e, "Failed to journal listing cancellation");
        }

        info!(
            listing_id = %listing_id,
            seller = %listing.seller,
            returned_gb = remaining.to_gb(),
            "🚫 Listing cancelled"
        );
        Ok(cancelled)
    }

    pub async fn listing(&self, listing_id: &ListingId) -> Result<Listing> {
        self.store
            .listing(listing_id)
            .await
            .map_err(|e| MarketError::Store(e.to_string()))?
            .ok_or_else(|| MarketError::NotFound(format!("listing {listing_id}")))
    }

    pub async fn active_listings(&self) -> Result<Vec<Listing>> {
        self.store
            .active_listings()
            .await
            .map_err(|e| MarketError::Store(e.to_string()))
    }

    /// Impression counter; informational only.
    pub async fn record_view(&self, listing_id: &ListingId) -> Result<()> {
        self.store
            .bump_views(listing_id)
            .await
            .map_err(|e| MarketError::Store(e.to_string()))
    }
}
