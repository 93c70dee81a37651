//! End-to-end flows through the credit market: buy credits with an external
//! payment, trade them peer-to-peer, and verify the ledger, listing and
//! journal stay consistent throughout.

use everstore_ledger::{JournalKind, MemoryLedgerStore};
use everstore_market::{
    CreditMarket, FixedStorageCostFeed, FixedTokenPriceFeed, MarketConfig, MarketError,
    MemoryMarketStore, MockPaymentProvider, PaymentRail, PricingOracle, RateLimiter,
    RateLimiterConfig, StorageSelector,
};
use everstore_types::{AccountKey, StorageAmount, UsdAmount, UserId, WalletAddress};
use serde_json::json;
use std::sync::Arc;

fn account(user: &str) -> AccountKey {
    AccountKey::new(UserId::new(user), WalletAddress::new(format!("ar-{user}")))
}

fn market() -> (Arc<CreditMarket>, Arc<MockPaymentProvider>) {
    let payments = Arc::new(MockPaymentProvider::new());
    // 0.5 token/GB at 8 USD/token with the default 10% margin: 4.40 USD/GB.
    let oracle = Arc::new(PricingOracle::new(
        Arc::new(FixedStorageCostFeed { tokens_per_gb: 0.5 }),
        Arc::new(FixedTokenPriceFeed { usd_per_token: 8.0 }),
    ));
    let market = CreditMarket::new(
        MarketConfig::default(),
        Arc::new(MemoryLedgerStore::new()),
        Arc::new(MemoryMarketStore::new()),
        oracle,
        payments.clone(),
        Arc::new(RateLimiter::new(RateLimiterConfig::default())),
    );
    (Arc::new(market), payments)
}

/// Buy 1 GB through the purchase workflow and confirm the charge.
async fn buy_one_gb(
    market: &CreditMarket,
    payments: &MockPaymentProvider,
    account: &AccountKey,
) {
    let (purchase, charge) = market
        .initiate_purchase(
            account,
            &StorageSelector::Megabytes(1024.0),
            PaymentRail::Stablecoin,
        )
        .await
        .unwrap();
    payments.confirm_charge(&charge.charge_id).await;
    market.confirm_purchase(&purchase.id).await.unwrap();
}

#[tokio::test]
async fn full_marketplace_round_trip() {
    let (market, payments) = market();
    let alice = account("alice");
    let bob = account("bob");

    // Alice buys 1 GB of credits.
    buy_one_gb(&market, &payments, &alice).await;
    let balance = market.ledger().balance(&alice).await.unwrap();
    assert_eq!(balance.total, StorageAmount::from_gb(1.0));
    assert_eq!(balance.available, StorageAmount::from_gb(1.0));

    // Alice lists the gigabyte at 2 USD/GB; it leaves her spendable pool.
    let listing = market
        .create_listing(
            &alice,
            WalletAddress::new("alice-payout"),
            1.0,
            UsdAmount::from_usd(2.0),
        )
        .await
        .unwrap();
    assert_eq!(listing.total_price, UsdAmount::from_usd(2.0));
    let balance = market.ledger().balance(&alice).await.unwrap();
    assert_eq!(balance.available, StorageAmount::ZERO);
    assert_eq!(balance.reserved(), StorageAmount::from_gb(1.0));

    // Bob starts a purchase: a 0.20 platform fee and a 1.80 seller payment.
    let initiated = market
        .purchase_listing(&listing.id, &bob, 1.0)
        .await
        .unwrap();
    assert_eq!(initiated.settlement.total_price, UsdAmount::from_usd(2.0));
    assert_eq!(initiated.settlement.platform_fee, UsdAmount::from_usd(0.20));
    assert_eq!(
        initiated.settlement.seller_payment,
        UsdAmount::from_usd(1.80)
    );

    // Both legs confirm; the settlement finalizes.
    payments
        .confirm_charge(&initiated.fee_charge.charge_id)
        .await;
    payments
        .confirm_charge(&initiated.seller_charge.charge_id)
        .await;
    market
        .confirm_listing_purchase(&initiated.settlement.id)
        .await
        .unwrap();

    let bob_balance = market.ledger().balance(&bob).await.unwrap();
    assert_eq!(bob_balance.total, StorageAmount::from_gb(1.0));
    assert_eq!(bob_balance.available, StorageAmount::from_gb(1.0));

    let alice_balance = market.ledger().balance(&alice).await.unwrap();
    assert_eq!(alice_balance.total, StorageAmount::ZERO);
    assert_eq!(alice_balance.reserved(), StorageAmount::ZERO);

    let listings = market.active_listings().await.unwrap();
    assert!(listings.is_empty());

    // Whole flow on the books: purchase, listing-created, and both sides of
    // the sale.
    let entries = market.journal().all_entries().await.unwrap();
    assert_eq!(entries.len(), 4);
    let kind_count = |kind: JournalKind| entries.iter().filter(|e| e.kind == kind).count();
    assert_eq!(kind_count(JournalKind::Purchase), 1);
    assert_eq!(kind_count(JournalKind::ListingCreated), 1);
    assert_eq!(kind_count(JournalKind::Sale), 2);

    let seller_side = entries
        .iter()
        .find(|e| e.kind == JournalKind::Sale && e.account == alice)
        .unwrap();
    assert_eq!(seller_side.amount_mb, -1024);
    assert_eq!(seller_side.cost_micro_usd, -1_800_000);
    let buyer_side = entries
        .iter()
        .find(|e| e.kind == JournalKind::Sale && e.account == bob)
        .unwrap();
    assert_eq!(buyer_side.amount_mb, 1024);
    assert_eq!(
        buyer_side.metadata["fee_charge_id"],
        json!(initiated.settlement.fee_charge_id)
    );
    assert_eq!(
        buyer_side.metadata["seller_charge_id"],
        json!(initiated.settlement.seller_charge_id)
    );
}

#[tokio::test]
async fn listing_inventory_is_conserved_across_partial_fills() {
    let (market, payments) = market();
    let seller = account("seller");
    let original = 10.0;

    market
        .ledger()
        .deposit(&seller, StorageAmount::from_gb(original))
        .await
        .unwrap();
    let listing = market
        .create_listing(
            &seller,
            WalletAddress::new("payout"),
            original,
            UsdAmount::from_usd(2.0),
        )
        .await
        .unwrap();

    let mut sold = StorageAmount::ZERO;
    for (i, gb) in [4.0, 3.0, 3.0].iter().enumerate() {
        let buyer = account(&format!("buyer-{i}"));
        let initiated = market
            .purchase_listing(&listing.id, &buyer, *gb)
            .await
            .unwrap();
        payments
            .confirm_charge(&initiated.fee_charge.charge_id)
            .await;
        payments
            .confirm_charge(&initiated.seller_charge.charge_id)
            .await;
        market
            .confirm_listing_purchase(&initiated.settlement.id)
            .await
            .unwrap();
        sold = sold.saturating_add(StorageAmount::from_gb(*gb));

        let stored = market
            .active_listings()
            .await
            .unwrap()
            .into_iter()
            .find(|l| l.id == listing.id);
        let remaining = stored.map(|l| l.remaining).unwrap_or(StorageAmount::ZERO);
        assert_eq!(
            sold.saturating_add(remaining),
            StorageAmount::from_gb(original)
        );
    }

    // Fully sold: the listing completed and the seller holds nothing.
    assert!(market.active_listings().await.unwrap().is_empty());
    let seller_balance = market.ledger().balance(&seller).await.unwrap();
    assert_eq!(seller_balance.total, StorageAmount::ZERO);
    assert_eq!(seller_balance.reserved(), StorageAmount::ZERO);
}

#[tokio::test]
async fn concurrent_overlapping_fills_leave_no_negative_inventory() {
    let (market, payments) = market();
    let seller = account("seller");
    market
        .ledger()
        .deposit(&seller, StorageAmount::from_gb(10.0))
        .await
        .unwrap();
    let listing = market
        .create_listing(
            &seller,
            WalletAddress::new("payout"),
            10.0,
            UsdAmount::from_usd(2.0),
        )
        .await
        .unwrap();

    let mut initiated = Vec::new();
    for (i, gb) in [6.0, 7.0].iter().enumerate() {
        let buyer = account(&format!("racer-{i}"));
        let settlement = market
            .purchase_listing(&listing.id, &buyer, *gb)
            .await
            .unwrap();
        payments
            .confirm_charge(&settlement.fee_charge.charge_id)
            .await;
        payments
            .confirm_charge(&settlement.seller_charge.charge_id)
            .await;
        initiated.push(settlement);
    }

    let mut handles = Vec::new();
    for settlement in &initiated {
        let market = market.clone();
        let id = settlement.settlement.id;
        handles.push(tokio::spawn(async move {
            market.confirm_listing_purchase(&id).await
        }));
    }
    let mut outcomes = Vec::new();
    for handle in handles {
        outcomes.push(handle.await.unwrap());
    }

    let winners = outcomes.iter().filter(|o| o.is_ok()).count();
    assert_eq!(winners, 1);
    let loser = outcomes.into_iter().find(|o| o.is_err()).unwrap();
    assert!(matches!(
        loser.unwrap_err(),
        MarketError::InsufficientListingInventory { .. }
    ));

    // The surviving inventory matches exactly one of the two fills.
    let remaining = market.active_listings().await.unwrap()[0].remaining;
    assert!(
        remaining == StorageAmount::from_gb(4.0) || remaining == StorageAmount::from_gb(3.0),
        "unexpected remaining inventory: {remaining}"
    );
}

#[tokio::test]
async fn usage_flows_into_the_account_summary() {
    let (market, payments) = market();
    let alice = account("alice");

    buy_one_gb(&market, &payments, &alice).await;
    market
        .record_usage(&alice, 256.0, json!({"upload": "photos.tar"}))
        .await
        .unwrap();
    market
        .record_usage(&alice, 256.0, json!({"upload": "music.tar"}))
        .await
        .unwrap();

    let summary = market.account_summary(&alice, 30).await.unwrap();
    assert_eq!(summary.balance.used, StorageAmount::from_mb(512.0));
    assert_eq!(summary.balance.available, StorageAmount::from_mb(512.0));
    assert_eq!(summary.usage.upload_count, 2);
    assert_eq!(summary.usage.bytes_uploaded, 512 * 1024 * 1024);
    // 512 MB over 30 days, 512 MB left: roughly 30 days of headroom.
    let days = summary.usage.estimated_days_left.unwrap();
    assert!((days - 30.0).abs() < 1e-9);
}

#[tokio::test]
async fn rate_limiter_caps_mutating_operations() {
    let payments = Arc::new(MockPaymentProvider::new());
    let oracle = Arc::new(PricingOracle::new(
        Arc::new(FixedStorageCostFeed { tokens_per_gb: 0.5 }),
        Arc::new(FixedTokenPriceFeed { usd_per_token: 8.0 }),
    ));
    let market = CreditMarket::new(
        MarketConfig::default(),
        Arc::new(MemoryLedgerStore::new()),
        Arc::new(MemoryMarketStore::new()),
        oracle,
        payments,
        Arc::new(RateLimiter::new(RateLimiterConfig {
            max_operations: 2,
            window_secs: 60,
        })),
    );
    let alice = account("alice");

    for _ in 0..2 {
        market
            .initiate_purchase(
                &alice,
                &StorageSelector::Megabytes(1024.0),
                PaymentRail::Stablecoin,
            )
            .await
            .unwrap();
    }
    let err = market
        .initiate_purchase(
            &alice,
            &StorageSelector::Megabytes(1024.0),
            PaymentRail::Stablecoin,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, MarketError::RateLimited(_)));
}
