//! # Everstore Market
//!
//! The transaction engine behind Everstore's storage-credit product: users
//! buy permanent-storage credits with a stablecoin, spend them on uploads,
//! and trade surplus credits peer-to-peer.
//!
//! ## Architecture
//!
//! - **Pricing oracle adapter**: derives a per-megabyte cost in the stable
//!   unit from the network fee feed and the token price feed; stateless and
//!   fail-loud.
//! - **Purchase workflow**: `quote -> initiate (pending) -> confirm`, with
//!   payment re-validation against the charge provider before the ledger
//!   deposit.
//! - **Listing & settlement engine**: sell listings reserve the seller's
//!   credits up front; purchases settle in two phases, with both payment
//!   legs independently confirmed before any credits move.
//! - **Coordinator**: composes the managers over the credit ledger and the
//!   transaction journal and exposes the typed operations the API gateway
//!   calls.
//!
//! Multi-step workflows are not atomic across steps; each step commits
//! independently and failures after a successful step trigger explicit,
//! journaled compensations (see `DESIGN.md` at the repository root).

pub mod coordinator;
pub mod error;
pub mod limits;
pub mod listing;
pub mod payment;
pub mod pricing;
pub mod purchase;
pub mod settlement;
pub mod store;
pub mod types;

pub use coordinator::{AccountSummary, CreditMarket, MarketConfig, MarketStats};
pub use error::{MarketError, Result};
pub use limits::{RateLimiter, RateLimiterConfig};
pub use listing::{ListingConfig, ListingManager};
pub use payment::{
    Charge, ChargeEvent, ChargeEventStatus, ChargeRequest, ChargeStatus, HttpPaymentProvider,
    MockPaymentProvider, PaymentProvider, PaymentProviderConfig,
};
pub use pricing::{
    FeedConfig, FixedStorageCostFeed, FixedTokenPriceFeed, HttpStorageCostFeed,
    HttpTokenPriceFeed, PriceQuote, PricingOracle, StorageCostFeed, TokenPriceFeed,
    MIN_TOTAL_PRICE,
};
pub use purchase::{PurchaseConfig, PurchaseManager, StoragePackage, StorageSelector};
pub use settlement::{InitiatedSettlement, SettlementConfig, SettlementEngine};
pub use store::{MarketStore, MemoryMarketStore};
pub use types::{
    Listing, ListingId, ListingStatus, PaymentRail, PriceSnapshot, PurchaseId, PurchaseStatus,
    Settlement, SettlementId, SettlementStatus, StoragePurchase,
};
