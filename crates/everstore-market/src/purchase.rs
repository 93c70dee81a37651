use crate::error::{MarketError, Result};
use crate::payment::{Charge, ChargeRequest, PaymentProvider};
use crate::pricing::{PriceQuote, PricingOracle};
use crate::store::MarketStore;
use crate::types::{PaymentRail, PurchaseId, PurchaseStatus, StoragePurchase};
use everstore_ledger::{CreditLedger, JournalEntry, JournalKind, TransactionJournal};
use everstore_types::{AccountKey, StorageAmount, UsdAmount};
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// A named storage bundle users can buy without picking a raw size.
#[derive(Debug, Clone)]
pub struct StoragePackage {
    pub id: String,
    pub mb: f64,
}

/// How the caller names the storage they want priced.
#[derive(Debug, Clone)]
pub enum StorageSelector {
    /// One of the configured packages.
    Package(String),
    /// Explicit size.
    Megabytes(f64),
    /// Target spend, back-solved to a size at current rates.
    Spend(UsdAmount),
}

/// Configuration for the purchase workflow
#[derive(Debug, Clone)]
pub struct PurchaseConfig {
    pub profit_margin_percent: f64,
    pub discount_percent: f64,
    /// Absolute tolerance when reconciling the paid amount against the
    /// quote.
    pub price_tolerance: UsdAmount,
    pub packages: Vec<StoragePackage>,
}

impl Default for PurchaseConfig {
    fn default() -> Self {
        Self {
            profit_margin_percent: 10.0,
            discount_percent: 0.0,
            price_tolerance: UsdAmount::from_usd(0.01),
            packages: vec![
                StoragePackage {
                    id: "starter-1gb".to_string(),
                    mb: 1024.0,
                },
                StoragePackage {
                    id: "creator-5gb".to_string(),
                    mb: 5.0 * 1024.0,
                },
                StoragePackage {
                    id: "studio-20gb".to_string(),
                    mb: 20.0 * 1024.0,
                },
                StoragePackage {
                    id: "archive-100gb".to_string(),
                    mb: 100.0 * 1024.0,
                },
            ],
        }
    }
}

/// Turns an intended storage amount plus an external payment into a
/// completed ledger deposit: `quote -> initiate (pending) -> confirm`.
///
/// `confirm` is safe to poll: an unconfirmed charge leaves the purchase
/// `Pending` and mutates nothing, so the caller can retry until the
/// provider reports a confirmed event.
pub struct PurchaseManager {
    config: PurchaseConfig,
    store: Arc<dyn MarketStore>,
    ledger: Arc<CreditLedger>,
    journal: Arc<TransactionJournal>,
    oracle: Arc<PricingOracle>,
    payments: Arc<dyn PaymentProvider>,
}

impl PurchaseManager {
    pub fn new(
        config: PurchaseConfig,
        store: Arc<dyn MarketStore>,
        ledger: Arc<CreditLedger>,
        journal: Arc<TransactionJournal>,
        oracle: Arc<PricingOracle>,
        payments: Arc<dyn PaymentProvider>,
    ) -> Self {
        Self {
            config,
            store,
            ledger,
            journal,
            oracle,
            payments,
        }
    }

    /// Price a selector without any writes (dry run).
    pub async fn quote(&self, selector: &StorageSelector) -> Result<(f64, PriceQuote)> {
        let mb = self.resolve_megabytes(selector).await?;
        let quote = self
            .oracle
            .price_for(
                mb,
                self.config.profit_margin_percent,
                self.config.discount_percent,
            )
            .await?;
        Ok((mb, quote))
    }

    /// Create the external charge and persist a `Pending` purchase with the
    /// quoted price and feed snapshot. The ledger is untouched.
    pub async fn initiate(
        &self,
        account: &AccountKey,
        selector: &StorageSelector,
        rail: PaymentRail,
    ) -> Result<(StoragePurchase, Charge)> {
        let (mb, quote) = self.quote(selector).await?;

        let charge = self
            .payments
            .create_charge(&ChargeRequest {
                amount: quote.final_price,
                currency: "USD".to_string(),
                description: format!("{mb:.0} MB permanent storage credits"),
                metadata: json!({
                    "account": account.to_string(),
                    "mb": mb,
                }),
            })
            .await?;

        let purchase = StoragePurchase::new(
            account.clone(),
            StorageAmount::from_mb(mb),
            quote.final_price,
            quote.snapshot,
            rail,
            charge.charge_id.clone(),
        );
        self.store
            .insert_purchase(&purchase)
            .await
            .map_err(|e| MarketError::Store(e.to_string()))?;

        info!(
            purchase_id = %purchase.id,
            account = %account,
            mb = mb,
            price = quote.final_price.to_usd(),
            rail = ?rail,
            "🛒 Storage purchase initiated"
        );
        Ok((purchase, charge))
    }

    /// Re-validate the payment and, on success, deposit the credits.
    pub async fn confirm(&self, purchase_id: &PurchaseId) -> Result<StoragePurchase> {
        let purchase = self
            .store
            .purchase(purchase_id)
            .await
            .map_err(|e| MarketError::Store(e.to_string()))?
            .ok_or_else(|| MarketError::NotFound(format!("purchase {purchase_id}")))?;

        match purchase.status {
            PurchaseStatus::Completed => {
                return Err(MarketError::AlreadyCompleted(format!(
                    "purchase {purchase_id}"
                )))
            }
            PurchaseStatus::Failed => {
                return Err(MarketError::Validation(format!(
                    "purchase {purchase_id} already failed"
                )))
            }
            PurchaseStatus::Pending => {}
        }

        let status = self.payments.charge_status(&purchase.charge_id).await?;

        if !status.has_confirmed_event() {
            if status.current == crate::payment::ChargeEventStatus::Failed {
                // The charge terminally failed; the purchase follows.
                self.mark_failed(&purchase, "charge failed").await?;
            }
            // Otherwise leave the purchase pending so the caller can poll
            // confirm again once the provider reports a confirmed event.
            return Err(MarketError::PaymentNotConfirmed(format!(
                "charge {} has no confirmed event",
                purchase.charge_id
            )));
        }

        let deviation = status.amount.abs_diff(purchase.quoted_price);
        if deviation > self.config.price_tolerance {
            self.mark_failed(&purchase, "price mismatch").await?;
            return Err(MarketError::PriceMismatch {
                quoted: purchase.quoted_price,
                paid: status.amount,
            });
        }

        // Claim the purchase before moving credits so a concurrent confirm
        // cannot double-deposit.
        let mut completed = purchase.clone();
        completed.status = PurchaseStatus::Completed;
        completed.completed_at = Some(chrono::Utc::now());
        completed.version += 1;
        let claimed = self
            .store
            .put_purchase_if_version(&completed, purchase.version)
            .await
            .map_err(|e| MarketError::Store(e.to_string()))?;
        if !claimed {
            return Err(MarketError::AlreadyCompleted(format!(
                "purchase {purchase_id}"
            )));
        }

        if let Err(e) = self.ledger.deposit(&purchase.account, purchase.requested).await {
            // Roll the claim back so a later confirm can retry the deposit.
            let mut reverted = completed.clone();
            reverted.status = PurchaseStatus::Pending;
            reverted.completed_at = None;
            reverted.version += 1;
            let rolled_back = self
                .store
                .put_purchase_if_version(&reverted, completed.version)
                .await
                .unwrap_or(false);
            if !rolled_back {
                return Err(MarketError::CompensationFailed(format!(
                    "deposit failed for purchase {purchase_id} and the pending rollback lost: {e}"
                )));
            }
            return Err(e.into());
        }

        let entry = JournalEntry::new(
            purchase.account.clone(),
            JournalKind::Purchase,
            purchase.requested.to_mb().round() as i64,
            purchase.quoted_price.to_micro() as i64,
        )
        .with_metadata(json!({
            "purchase_id": purchase.id.to_hex(),
            "charge_id": purchase.charge_id,
            "token_price_usd": purchase.price_snapshot.token_price_usd,
        }));
        if let Err(e) = self.journal.append(entry).await {
            // The deposit is already reflected in the balance row; the
            // journal miss is an audit gap, not a lost credit.
            warn!(
                purchase_id = %purchase.id,
                error = %e,
                "Failed to journal completed purchase"
            );
        }

        info!(
            purchase_id = %purchase.id,
            account = %purchase.account,
            mb = purchase.requested.to_mb(),
            "✅ Storage purchase completed"
        );
        Ok(completed)
    }

    async fn mark_failed(&self, purchase: &StoragePurchase, reason: &str) -> Result<()> {
        let mut failed = purchase.clone();
        failed.status = PurchaseStatus::Failed;
        failed.version += 1;
        let stored = self
            .store
            .put_purchase_if_version(&failed, purchase.version)
            .await
            .map_err(|e| MarketError::Store(e.to_string()))?;
        if !stored {
            return Err(MarketError::Store(format!(
                "purchase {} changed while failing it",
                purchase.id
            )));
        }
        warn!(
            purchase_id = %purchase.id,
            reason = reason,
            "❌ Storage purchase failed"
        );
        Ok(())
    }

    async fn resolve_megabytes(&self, selector: &StorageSelector) -> Result<f64> {
        match selector {
            StorageSelector::Package(id) => self
                .config
                .packages
                .iter()
                .find(|p| p.id == *id)
                .map(|p| p.mb)
                .ok_or_else(|| MarketError::Validation(format!("unknown storage package: {id}"))),
            StorageSelector::Megabytes(mb) => {
                if !mb.is_finite() || *mb <= 0.0 {
                    return Err(MarketError::Validation(format!(
                        "storage amount must be positive, got {mb} MB"
                    )));
                }
                Ok(*mb)
            }
            StorageSelector::Spend(usd) => {
                self.oracle
                    .mb_for_spend(
                        *usd,
                        self.config.profit_margin_percent,
                        self.config.discount_percent,
                    )
                    .await
            }
        }
    }
}
