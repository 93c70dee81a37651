use crate::error::{MarketError, Result};
use crate::types::PriceSnapshot;
use async_trait::async_trait;
use everstore_types::UsdAmount;
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Floor applied wherever a price feeds into a listing or purchase the
/// user will pay.
pub const MIN_TOTAL_PRICE: UsdAmount = UsdAmount::from_micro(500_000);

/// Read-only feed for the permanent-storage network's fee rate.
#[async_trait]
pub trait StorageCostFeed: Send + Sync {
    /// Native-token cost of storing `bytes` permanently.
    async fn cost_to_store(&self, bytes: u64) -> Result<f64>;
}

/// Read-only feed for the native-token-to-stable-unit rate.
#[async_trait]
pub trait TokenPriceFeed: Send + Sync {
    async fn token_price_usd(&self) -> Result<f64>;
}

/// Configuration shared by the HTTP feed adapters.
#[derive(Debug, Clone)]
pub struct FeedConfig {
    pub url: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Retry attempts for failed requests (read-only lookups only)
    pub max_retries: usize,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            url: "https://gateway.everstore.network".to_string(),
            timeout_secs: 10,
            max_retries: 3,
        }
    }
}

fn build_client(timeout_secs: u64) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .expect("Failed to create HTTP client")
}

/// Retry a read-only fetch with linear backoff; map exhaustion to
/// `ExternalServiceUnavailable`. Mutating calls never go through here.
async fn fetch_with_retries<F, Fut>(source: &str, max_retries: usize, fetch: F) -> Result<f64>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = std::result::Result<f64, reqwest::Error>>,
{
    let mut last_error = String::new();
    for attempt in 0..max_retries.max(1) {
        match fetch().await {
            Ok(value) => return Ok(value),
            Err(e) => {
                debug!(
                    source = source,
                    attempt = attempt + 1,
                    max = max_retries,
                    error = %e,
                    "Feed fetch failed"
                );
                last_error = e.to_string();
            }
        }
        if attempt + 1 < max_retries {
            tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
        }
    }
    Err(MarketError::ExternalServiceUnavailable(format!(
        "{source}: {last_error}"
    )))
}

/// Fetches the network storage-fee rate from a gateway endpoint that
/// returns the native-token price for a byte count as a plain number.
pub struct HttpStorageCostFeed {
    config: FeedConfig,
    client: reqwest::Client,
}

impl HttpStorageCostFeed {
    pub fn new(config: FeedConfig) -> Self {
        let client = build_client(config.timeout_secs);
        Self { config, client }
    }
}

#[async_trait]
impl StorageCostFeed for HttpStorageCostFeed {
    async fn cost_to_store(&self, bytes: u64) -> Result<f64> {
        let url = format!("{}/price/{}", self.config.url.trim_end_matches('/'), bytes);
        let client = self.client.clone();
        fetch_with_retries("storage-cost-feed", self.config.max_retries, move || {
            let client = client.clone();
            let url = url.clone();
            async move {
                let body = client
                    .get(&url)
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?;
                // Non-numeric bodies surface as NaN and fail validation in
                // the oracle rather than silently pricing at zero.
                Ok(body.trim().parse::<f64>().unwrap_or(f64::NAN))
            }
        })
        .await
    }
}

#[derive(Debug, Deserialize)]
struct TokenPriceResponse {
    usd: f64,
}

/// Fetches the token-to-stable-unit rate from a JSON price endpoint.
pub struct HttpTokenPriceFeed {
    config: FeedConfig,
    client: reqwest::Client,
}

impl HttpTokenPriceFeed {
    pub fn new(config: FeedConfig) -> Self {
        let client = build_client(config.timeout_secs);
        Self { config, client }
    }
}

#[async_trait]
impl TokenPriceFeed for HttpTokenPriceFeed {
    async fn token_price_usd(&self) -> Result<f64> {
        let url = self.config.url.clone();
        let client = self.client.clone();
        fetch_with_retries("token-price-feed", self.config.max_retries, move || {
            let client = client.clone();
            let url = url.clone();
            async move {
                let response: TokenPriceResponse = client
                    .get(&url)
                    .send()
                    .await?
                    .error_for_status()?
                    .json()
                    .await?;
                Ok(response.usd)
            }
        })
        .await
    }
}

/// Fixed-rate feed for tests, development and offline quoting.
pub struct FixedStorageCostFeed {
    pub tokens_per_gb: f64,
}

#[async_trait]
impl StorageCostFeed for FixedStorageCostFeed {
    async fn cost_to_store(&self, bytes: u64) -> Result<f64> {
        Ok(self.tokens_per_gb * bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Fixed-rate feed for tests, development and offline quoting.
pub struct FixedTokenPriceFeed {
    pub usd_per_token: f64,
}

#[async_trait]
impl TokenPriceFeed for FixedTokenPriceFeed {
    async fn token_price_usd(&self) -> Result<f64> {
        Ok(self.usd_per_token)
    }
}

/// A priced storage quote.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceQuote {
    /// Raw network cost at the current feed rates, before margin/discount.
    pub base_cost: UsdAmount,
    /// What the user pays, floored at [`MIN_TOTAL_PRICE`].
    pub final_price: UsdAmount,
    pub per_gb_price: UsdAmount,
    pub snapshot: PriceSnapshot,
}

/// Stateless adapter over the two external feeds.
///
/// Fails loudly when either feed is unreachable or returns a non-positive
/// or non-finite value; there is no cached or hardcoded fallback price
/// anywhere in the system.
pub struct PricingOracle {
    cost_feed: Arc<dyn StorageCostFeed>,
    price_feed: Arc<dyn TokenPriceFeed>,
}

impl PricingOracle {
    pub fn new(cost_feed: Arc<dyn StorageCostFeed>, price_feed: Arc<dyn TokenPriceFeed>) -> Self {
        Self {
            cost_feed,
            price_feed,
        }
    }

    /// Price `mb` megabytes of storage with the given margin and discount.
    pub async fn price_for(
        &self,
        mb: f64,
        margin_percent: f64,
        discount_percent: f64,
    ) -> Result<PriceQuote> {
        let (base_usd, final_usd, snapshot) =
            self.raw_price(mb, margin_percent, discount_percent).await?;

        let final_price = UsdAmount::from_usd(final_usd).max(MIN_TOTAL_PRICE);
        let quote = PriceQuote {
            base_cost: UsdAmount::from_usd(base_usd),
            final_price,
            per_gb_price: UsdAmount::from_usd(final_price.to_usd() / (mb / 1024.0)),
            snapshot,
        };

        info!(
            mb = mb,
            base_cost = quote.base_cost.to_usd(),
            final_price = quote.final_price.to_usd(),
            token_price = snapshot.token_price_usd,
            "💱 Storage priced"
        );
        Ok(quote)
    }

    /// Back-solve a target spend to megabytes at the current rates. The
    /// spend itself must clear the minimum price floor.
    pub async fn mb_for_spend(
        &self,
        spend: UsdAmount,
        margin_percent: f64,
        discount_percent: f64,
    ) -> Result<f64> {
        if spend < MIN_TOTAL_PRICE {
            return Err(MarketError::Validation(format!(
                "spend {} is below the minimum of {}",
                spend, MIN_TOTAL_PRICE
            )));
        }
        // Unfloored unit rate for one gigabyte.
        let (_, per_gb_usd, _) = self
            .raw_price(1024.0, margin_percent, discount_percent)
            .await?;
        Ok(spend.to_usd() / per_gb_usd * 1024.0)
    }

    async fn raw_price(
        &self,
        mb: f64,
        margin_percent: f64,
        discount_percent: f64,
    ) -> Result<(f64, f64, PriceSnapshot)> {
        if !mb.is_finite() || mb <= 0.0 {
            return Err(MarketError::Validation(format!(
                "storage amount must be positive, got {mb} MB"
            )));
        }

        let bytes = (mb * 1024.0 * 1024.0) as u64;
        let tokens = self.cost_feed.cost_to_store(bytes).await?;
        validate_rate("storage-cost-feed", tokens)?;
        let rate = self.price_feed.token_price_usd().await?;
        validate_rate("token-price-feed", rate)?;

        let base = tokens * rate;
        let final_usd = base * (1.0 + margin_percent / 100.0) * (1.0 - discount_percent / 100.0);
        Ok((
            base,
            final_usd,
            PriceSnapshot {
                token_price_usd: rate,
                storage_cost_tokens: tokens,
            },
        ))
    }
}

fn validate_rate(source: &str, value: f64) -> Result<()> {
    if !value.is_finite() || value <= 0.0 {
        return Err(MarketError::ExternalServiceUnavailable(format!(
            "{source} returned an unusable rate: {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn oracle(tokens_per_gb: f64, usd_per_token: f64) -> PricingOracle {
        PricingOracle::new(
            Arc::new(FixedStorageCostFeed { tokens_per_gb }),
            Arc::new(FixedTokenPriceFeed { usd_per_token }),
        )
    }

    #[tokio::test]
    async fn margin_and_discount_shape_the_final_price() {
        // 0.5 token/GB at 8 USD/token: 1 GB base cost is 4 USD.
        let oracle = oracle(0.5, 8.0);
        let quote = oracle.price_for(1024.0, 10.0, 0.0).await.unwrap();
        assert_eq!(quote.base_cost, UsdAmount::from_usd(4.0));
        assert_eq!(quote.final_price, UsdAmount::from_usd(4.4));
        assert_eq!(quote.per_gb_price, UsdAmount::from_usd(4.4));

        let discounted = oracle.price_for(1024.0, 10.0, 50.0).await.unwrap();
        assert_eq!(discounted.final_price, UsdAmount::from_usd(2.2));
    }

    #[tokio::test]
    async fn tiny_purchases_hit_the_price_floor() {
        let oracle = oracle(0.5, 8.0);
        // 10 MB would cost ~0.043 USD; the floor lifts it to 0.50.
        let quote = oracle.price_for(10.0, 10.0, 0.0).await.unwrap();
        assert_eq!(quote.final_price, MIN_TOTAL_PRICE);
    }

    #[tokio::test]
    async fn bad_feed_values_fail_loudly() {
        let zero_cost = oracle(0.0, 8.0);
        let err = zero_cost.price_for(1024.0, 10.0, 0.0).await.unwrap_err();
        assert!(matches!(err, MarketError::ExternalServiceUnavailable(_)));

        let negative_rate = oracle(0.5, -1.0);
        let err = negative_rate.price_for(1024.0, 10.0, 0.0).await.unwrap_err();
        assert!(matches!(err, MarketError::ExternalServiceUnavailable(_)));
    }

    #[tokio::test]
    async fn spend_back_solves_to_megabytes() {
        let oracle = oracle(0.5, 8.0);
        // 4.40 USD/GB after margin: 8.80 USD buys exactly 2 GB.
        let mb = oracle
            .mb_for_spend(UsdAmount::from_usd(8.8), 10.0, 0.0)
            .await
            .unwrap();
        assert!((mb - 2048.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn below_floor_spend_is_rejected() {
        let oracle = oracle(0.5, 8.0);
        let err = oracle
            .mb_for_spend(UsdAmount::from_usd(0.10), 10.0, 0.0)
            .await
            .unwrap_err();
        assert!(matches!(err, MarketError::Validation(_)));
    }

    #[tokio::test]
    async fn zero_amount_is_rejected_before_any_fetch() {
        let oracle = oracle(0.5, 8.0);
        let err = oracle.price_for(0.0, 10.0, 0.0).await.unwrap_err();
        assert!(matches!(err, MarketError::Validation(_)));
    }
}
