use chrono::{DateTime, Utc};
use everstore_types::{AccountKey, RecordId, StorageAmount, UsdAmount, WalletAddress};
use serde::{Deserialize, Serialize};

pub type ListingId = RecordId;
pub type SettlementId = RecordId;
pub type PurchaseId = RecordId;

/// Asking price for a quantity at a per-gigabyte rate.
pub fn listing_total(price_per_gb: UsdAmount, amount: StorageAmount) -> UsdAmount {
    UsdAmount::from_usd(price_per_gb.to_usd() * amount.to_gb())
}

/// Listing lifecycle: `Active -> {Completed | Cancelled}`, both terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ListingStatus {
    Active,
    Completed,
    Cancelled,
}

/// Surplus credits a seller has put up for sale. While `Active` the listed
/// amount is already reserved out of the seller's spendable pool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Listing {
    pub id: ListingId,
    pub seller: AccountKey,
    pub payout_address: WalletAddress,
    /// Unsold inventory. Shrinks on partial fills; the per-GB price never
    /// changes after creation.
    pub remaining: StorageAmount,
    pub price_per_gb: UsdAmount,
    /// Asking price for the remaining inventory, recomputed on every fill.
    pub total_price: UsdAmount,
    pub status: ListingStatus,
    /// Informational impression counter, not consistency-protected.
    pub views: u64,
    /// Backs conditional updates at the store layer.
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl Listing {
    pub fn new(
        seller: AccountKey,
        payout_address: WalletAddress,
        amount: StorageAmount,
        price_per_gb: UsdAmount,
    ) -> Self {
        let created_at = Utc::now();
        let id = RecordId::derive(&[
            b"listing",
            seller.to_string().as_bytes(),
            &amount.to_kb().to_le_bytes(),
            &price_per_gb.to_micro().to_le_bytes(),
            &created_at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes(),
        ]);
        Self {
            id,
            seller,
            payout_address,
            remaining: amount,
            total_price: listing_total(price_per_gb, amount),
            price_per_gb,
            status: ListingStatus::Active,
            views: 0,
            version: 0,
            created_at,
        }
    }
}

/// Settlement lifecycle. `PendingConfirmation` settlements either confirm
/// (both payment legs verified) or expire after the configured TTL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SettlementStatus {
    PendingConfirmation,
    Confirmed,
    Expired,
}

/// One buyer's purchase against a listing: the fee split and the two
/// independent payment legs. Becomes a permanent record once both charges
/// are confirmed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settlement {
    pub id: SettlementId,
    pub listing_id: ListingId,
    pub buyer: AccountKey,
    pub seller: AccountKey,
    pub amount: StorageAmount,
    pub total_price: UsdAmount,
    pub platform_fee: UsdAmount,
    pub seller_payment: UsdAmount,
    /// Charge payable to the platform.
    pub fee_charge_id: String,
    /// Charge payable to the seller's payout address.
    pub seller_charge_id: String,
    pub status: SettlementStatus,
    pub version: u64,
    pub created_at: DateTime<Utc>,
}

impl Settlement {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        listing_id: ListingId,
        buyer: AccountKey,
        seller: AccountKey,
        amount: StorageAmount,
        total_price: UsdAmount,
        platform_fee: UsdAmount,
        seller_payment: UsdAmount,
        fee_charge_id: String,
        seller_charge_id: String,
    ) -> Self {
        // The id binds the listing, the buyer and both charge references,
        // so re-submitting the same charge pair addresses the same record.
        let id = RecordId::derive(&[
            b"settlement",
            listing_id.as_bytes(),
            buyer.to_string().as_bytes(),
            fee_charge_id.as_bytes(),
            seller_charge_id.as_bytes(),
        ]);
        Self {
            id,
            listing_id,
            buyer,
            seller,
            amount,
            total_price,
            platform_fee,
            seller_payment,
            fee_charge_id,
            seller_charge_id,
            status: SettlementStatus::PendingConfirmation,
            version: 0,
            created_at: Utc::now(),
        }
    }
}

/// Which payment rail the buyer chose for a direct purchase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PaymentRail {
    Stablecoin,
    HostedCheckout,
}

/// The two feed reads a quote was computed from, kept with the purchase
/// record for auditing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub token_price_usd: f64,
    pub storage_cost_tokens: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PurchaseStatus {
    Pending,
    Completed,
    Failed,
}

/// One attempt to convert payment into credits. Immutable once `Completed`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoragePurchase {
    pub id: PurchaseId,
    pub account: AccountKey,
    pub requested: StorageAmount,
    pub quoted_price: UsdAmount,
    pub price_snapshot: PriceSnapshot,
    pub rail: PaymentRail,
    /// External payment reference.
    pub charge_id: String,
    pub status: PurchaseStatus,
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl StoragePurchase {
    pub fn new(
        account: AccountKey,
        requested: StorageAmount,
        quoted_price: UsdAmount,
        price_snapshot: PriceSnapshot,
        rail: PaymentRail,
        charge_id: String,
    ) -> Self {
        let created_at = Utc::now();
        let id = RecordId::derive(&[
            b"purchase",
            account.to_string().as_bytes(),
            charge_id.as_bytes(),
            &created_at.timestamp_nanos_opt().unwrap_or_default().to_le_bytes(),
        ]);
        Self {
            id,
            account,
            requested,
            quoted_price,
            price_snapshot,
            rail,
            charge_id,
            status: PurchaseStatus::Pending,
            version: 0,
            created_at,
            completed_at: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use everstore_types::{UserId, WalletAddress};

    fn seller() -> AccountKey {
        AccountKey::new(UserId::new("seller"), WalletAddress::new("ar-seller"))
    }

    #[test]
    fn listing_total_recomputes_from_remaining() {
        let price = UsdAmount::from_usd(2.0);
        assert_eq!(
            listing_total(price, StorageAmount::from_gb(6.0)),
            UsdAmount::from_usd(12.0)
        );
        assert_eq!(
            listing_total(price, StorageAmount::ZERO),
            UsdAmount::ZERO
        );
    }

    #[test]
    fn new_listing_starts_active_with_full_inventory() {
        let listing = Listing::new(
            seller(),
            WalletAddress::new("payout"),
            StorageAmount::from_gb(10.0),
            UsdAmount::from_usd(2.0),
        );
        assert_eq!(listing.status, ListingStatus::Active);
        assert_eq!(listing.remaining, StorageAmount::from_gb(10.0));
        assert_eq!(listing.total_price, UsdAmount::from_usd(20.0));
        assert_eq!(listing.version, 0);
    }

    #[test]
    fn settlement_id_binds_charge_references() {
        let listing_id = RecordId::derive(&[b"l"]);
        let buyer = AccountKey::new(UserId::new("buyer"), WalletAddress::new("ar-buyer"));
        let make = |fee: &str, pay: &str| {
            Settlement::new(
                listing_id,
                buyer.clone(),
                seller(),
                StorageAmount::from_gb(1.0),
                UsdAmount::from_usd(2.0),
                UsdAmount::from_usd(0.2),
                UsdAmount::from_usd(1.8),
                fee.to_string(),
                pay.to_string(),
            )
        };
        assert_eq!(make("fee-1", "pay-1").id, make("fee-1", "pay-1").id);
        assert_ne!(make("fee-1", "pay-1").id, make("fee-2", "pay-1").id);
    }
}
