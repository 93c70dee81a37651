use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use everstore_ledger::MemoryLedgerStore;
use everstore_market::{
    CreditMarket, HttpPaymentProvider, HttpStorageCostFeed, HttpTokenPriceFeed, PricingOracle,
    RateLimiter,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

mod config;
mod logging;

use config::NodeConfig;

#[derive(Parser)]
#[command(name = "everstore")]
#[command(about = "Everstore - storage credit ledger & marketplace engine", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE", default_value = "everstore.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the credit-market service
    Start,

    /// Write a default configuration file
    Init {
        /// Output path for the configuration
        #[arg(short, long, default_value = "everstore.toml")]
        output: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Init { output } => {
            let config = NodeConfig::default();
            config.save(&output)?;
            println!("Wrote default configuration to {}", output.display());
            Ok(())
        }
        Commands::Start => {
            let config = if cli.config.exists() {
                NodeConfig::load(&cli.config)?
            } else {
                NodeConfig::default()
            };
            logging::init_logging(&config.logging.level).context("Failed to set up logging")?;
            run(config).await
        }
    }
}

async fn run(config: NodeConfig) -> Result<()> {
    info!(name = %config.node.name, "🚀 Starting Everstore node");

    let oracle = Arc::new(PricingOracle::new(
        Arc::new(HttpStorageCostFeed::new(config.storage_feed_config())),
        Arc::new(HttpTokenPriceFeed::new(config.token_feed_config())),
    ));
    let payments = Arc::new(HttpPaymentProvider::new(config.payment_provider_config()));
    let limiter = Arc::new(RateLimiter::new(config.market_config().limits));

    let market = Arc::new(CreditMarket::new(
        config.market_config(),
        Arc::new(MemoryLedgerStore::new()),
        Arc::new(everstore_market::MemoryMarketStore::new()),
        oracle,
        payments,
        limiter,
    ));

    let sweep = spawn_expiry_sweep(market.clone(), config.node.sweep_interval_secs);

    info!("✅ Credit market ready");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for shutdown signal")?;
    info!("🛑 Shutting down");
    sweep.abort();

    Ok(())
}

/// Periodically retire Phase-A settlements whose confirmation never
/// arrived, and log the market's headline counters.
fn spawn_expiry_sweep(
    market: Arc<CreditMarket>,
    interval_secs: u64,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            interval.tick().await;

            match market.expire_pending_settlements().await {
                Ok(expired) if expired > 0 => {
                    info!(expired, "Settlement expiry sweep completed");
                }
                Ok(_) => {}
                Err(e) => warn!(error = %e, "Settlement expiry sweep failed"),
            }

            if let Err(e) = market.market_stats().await {
                warn!(error = %e, "Failed to collect market stats");
            }
        }
    })
}
