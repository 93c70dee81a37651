use crate::types::{
    Listing, ListingId, ListingStatus, PurchaseId, Settlement, SettlementId, SettlementStatus,
    StoragePurchase,
};
use anyhow::{bail, Result};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Persistence seam for listings, settlements and purchases.
///
/// The `put_*_if_version` operations are single-row conditional updates:
/// they succeed only when the stored row still carries `expected_version`,
/// which is how mutations of one listing or settlement serialize across
/// concurrent requests.
#[async_trait]
pub trait MarketStore: Send + Sync {
    async fn insert_listing(&self, listing: &Listing) -> Result<()>;
    async fn listing(&self, id: &ListingId) -> Result<Option<Listing>>;
    async fn put_listing_if_version(&self, listing: &Listing, expected_version: u64)
        -> Result<bool>;
    async fn active_listings(&self) -> Result<Vec<Listing>>;
    /// Impression counter bump; deliberately outside the versioned protocol.
    async fn bump_views(&self, id: &ListingId) -> Result<()>;

    async fn insert_settlement(&self, settlement: &Settlement) -> Result<()>;
    async fn settlement(&self, id: &SettlementId) -> Result<Option<Settlement>>;
    async fn put_settlement_if_version(
        &self,
        settlement: &Settlement,
        expected_version: u64,
    ) -> Result<bool>;
    async fn pending_settlements(&self) -> Result<Vec<Settlement>>;

    async fn insert_purchase(&self, purchase: &StoragePurchase) -> Result<()>;
    async fn purchase(&self, id: &PurchaseId) -> Result<Option<StoragePurchase>>;
    async fn put_purchase_if_version(
        &self,
        purchase: &StoragePurchase,
        expected_version: u64,
    ) -> Result<bool>;
}

/// In-memory store for tests, development, and single-process deployments.
pub struct MemoryMarketStore {
    listings: Arc<RwLock<HashMap<ListingId, Listing>>>,
    settlements: Arc<RwLock<HashMap<SettlementId, Settlement>>>,
    purchases: Arc<RwLock<HashMap<PurchaseId, StoragePurchase>>>,
}

impl Default for MemoryMarketStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryMarketStore {
    pub fn new() -> Self {
        Self {
            listings: Arc::new(RwLock::new(HashMap::new())),
            settlements: Arc::new(RwLock::new(HashMap::new())),
            purchases: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl MarketStore for MemoryMarketStore {
    async fn insert_listing(&self, listing: &Listing) -> Result<()> {
        let mut listings = self.listings.write().await;
        if listings.contains_key(&listing.id) {
            bail!("listing already exists: {}", listing.id);
        }
        listings.insert(listing.id, listing.clone());
        Ok(())
    }

    async fn listing(&self, id: &ListingId) -> Result<Option<Listing>> {
        let listings = self.listings.read().await;
        Ok(listings.get(id).cloned())
    }

    async fn put_listing_if_version(
        &self,
        listing: &Listing,
        expected_version: u64,
    ) -> Result<bool> {
        let mut listings = self.listings.write().await;
        match listings.get(&listing.id) {
            Some(current) if current.version == expected_version => {
                listings.insert(listing.id, listing.clone());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => bail!("listing not found: {}", listing.id),
        }
    }

    async fn active_listings(&self) -> Result<Vec<Listing>> {
        let listings = self.listings.read().await;
        let mut active: Vec<Listing> = listings
            .values()
            .filter(|l| l.status == ListingStatus::Active)
            .cloned()
            .collect();
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(active)
    }

    async fn bump_views(&self, id: &ListingId) -> Result<()> {
        let mut listings = self.listings.write().await;
        if let Some(listing) = listings.get_mut(id) {
            listing.views += 1;
        }
        Ok(())
    }

    async fn insert_settlement(&self, settlement: &Settlement) -> Result<()> {
        let mut settlements = self.settlements.write().await;
        if settlements.contains_key(&settlement.id) {
            bail!("settlement already exists: {}", settlement.id);
        }
        settlements.insert(settlement.id, settlement.clone());
        Ok(())
    }

    async fn settlement(&self, id: &SettlementId) -> Result<Option<Settlement>> {
        let settlements = self.settlements.read().await;
        Ok(settlements.get(id).cloned())
    }

    async fn put_settlement_if_version(
        &self,
        settlement: &Settlement,
        expected_version: u64,
    ) -> Result<bool> {
        let mut settlements = self.settlements.write().await;
        match settlements.get(&settlement.id) {
            Some(current) if current.version == expected_version => {
                settlements.insert(settlement.id, settlement.clone());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => bail!("settlement not found: {}", settlement.id),
        }
    }

    async fn pending_settlements(&self) -> Result<Vec<Settlement>> {
        let settlements = self.settlements.read().await;
        Ok(settlements
            .values()
            .filter(|s| s.status == SettlementStatus::PendingConfirmation)
            .cloned()
            .collect())
    }

    async fn insert_purchase(&self, purchase: &StoragePurchase) -> Result<()> {
        let mut purchases = self.purchases.write().await;
        if purchases.contains_key(&purchase.id) {
            bail!("purchase already exists: {}", purchase.id);
        }
        purchases.insert(purchase.id, purchase.clone());
        Ok(())
    }

    async fn purchase(&self, id: &PurchaseId) -> Result<Option<StoragePurchase>> {
        let purchases = self.purchases.read().await;
        Ok(purchases.get(id).cloned())
    }

    async fn put_purchase_if_version(
        &self,
        purchase: &StoragePurchase,
        expected_version: u64,
    ) -> Result<bool> {
        let mut purchases = self.purchases.write().await;
        match purchases.get(&purchase.id) {
            Some(current) if current.version == expected_version => {
                purchases.insert(purchase.id, purchase.clone());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => bail!("purchase not found: {}", purchase.id),
        }
    }
}
