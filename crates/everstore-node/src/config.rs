use anyhow::{Context, Result};
use everstore_market::{
    FeedConfig, ListingConfig, MarketConfig, PaymentProviderConfig, PurchaseConfig,
    RateLimiterConfig, SettlementConfig,
};
use everstore_types::UsdAmount;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Complete node configuration, loaded from a TOML file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub node: NodeSettings,
    pub pricing: PricingSettings,
    pub payments: PaymentSettings,
    pub market: MarketSettings,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSettings {
    pub name: String,
    /// Seconds between settlement-expiry sweeps.
    pub sweep_interval_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingSettings {
    pub storage_feed_url: String,
    pub token_feed_url: String,
    pub timeout_secs: u64,
    pub max_retries: usize,
    pub profit_margin_percent: f64,
    pub discount_percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSettings {
    pub api_url: String,
    pub api_key: String,
    pub timeout_secs: u64,
    pub max_retries: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketSettings {
    pub platform_fee_percent: f64,
    pub min_listing_price_usd: f64,
    pub completion_epsilon_gb: f64,
    pub settlement_ttl_minutes: i64,
    pub rate_limit_operations: usize,
    pub rate_limit_window_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: String,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            node: NodeSettings {
                name: "everstore-node".to_string(),
                sweep_interval_secs: 300,
            },
            pricing: PricingSettings {
                storage_feed_url: "https://gateway.everstore.network".to_string(),
                token_feed_url: "https://price.everstore.network/token".to_string(),
                timeout_secs: 10,
                max_retries: 3,
                profit_margin_percent: 10.0,
                discount_percent: 0.0,
            },
            payments: PaymentSettings {
                api_url: "https://api.commerce.example.com".to_string(),
                api_key: String::new(),
                timeout_secs: 15,
                max_retries: 3,
            },
            market: MarketSettings {
                platform_fee_percent: 10.0,
                min_listing_price_usd: 0.5,
                completion_epsilon_gb: 0.001,
                settlement_ttl_minutes: 60,
                rate_limit_operations: 30,
                rate_limit_window_secs: 60,
            },
            logging: LoggingSettings {
                level: "info".to_string(),
            },
        }
    }
}

impl NodeConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;
        std::fs::write(path, contents)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    pub fn market_config(&self) -> MarketConfig {
        MarketConfig {
            purchase: PurchaseConfig {
                profit_margin_percent: self.pricing.profit_margin_percent,
                discount_percent: self.pricing.discount_percent,
                ..PurchaseConfig::default()
            },
            listing: ListingConfig {
                min_total_price: UsdAmount::from_usd(self.market.min_listing_price_usd),
            },
            settlement: SettlementConfig {
                platform_fee_percent: self.market.platform_fee_percent,
                completion_epsilon_gb: self.market.completion_epsilon_gb,
                pending_ttl_minutes: self.market.settlement_ttl_minutes,
            },
            limits: RateLimiterConfig {
                max_operations: self.market.rate_limit_operations,
                window_secs: self.market.rate_limit_window_secs,
            },
        }
    }

    pub fn storage_feed_config(&self) -> FeedConfig {
        FeedConfig {
            url: self.pricing.storage_feed_url.clone(),
            timeout_secs: self.pricing.timeout_secs,
            max_retries: self.pricing.max_retries,
        }
    }

    pub fn token_feed_config(&self) -> FeedConfig {
        FeedConfig {
            url: self.pricing.token_feed_url.clone(),
            timeout_secs: self.pricing.timeout_secs,
            max_retries: self.pricing.max_retries,
        }
    }

    pub fn payment_provider_config(&self) -> PaymentProviderConfig {
        PaymentProviderConfig {
            api_url: self.payments.api_url.clone(),
            api_key: self.payments.api_key.clone(),
            timeout_secs: self.payments.timeout_secs,
            max_retries: self.payments.max_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_toml() {
        let config = NodeConfig::default();
        let serialized = toml::to_string_pretty(&config).unwrap();
        let parsed: NodeConfig = toml::from_str(&serialized).unwrap();
        assert_eq!(parsed.node.name, config.node.name);
        assert_eq!(
            parsed.market.settlement_ttl_minutes,
            config.market.settlement_ttl_minutes
        );
    }

    #[test]
    fn market_config_mirrors_settings() {
        let mut config = NodeConfig::default();
        config.market.platform_fee_percent = 12.5;
        config.market.min_listing_price_usd = 1.0;

        let market = config.market_config();
        assert_eq!(market.settlement.platform_fee_percent, 12.5);
        assert_eq!(market.listing.min_total_price, UsdAmount::from_usd(1.0));
    }
}
