use crate::error::{MarketError, Result};
use chrono::{DateTime, Duration, Utc};
use everstore_types::AccountKey;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::warn;

/// Configuration for the per-account rate limiter
#[derive(Debug, Clone)]
pub struct RateLimiterConfig {
    /// Operations allowed per account and operation name inside the window.
    pub max_operations: usize,
    pub window_secs: i64,
}

impl Default for RateLimiterConfig {
    fn default() -> Self {
        Self {
            max_operations: 30,
            window_secs: 60,
        }
    }
}

/// Sliding-window rate limiter for mutating market operations.
///
/// Constructed once at process start and injected into the coordinator;
/// tests instantiate their own isolated instances.
pub struct RateLimiter {
    config: RateLimiterConfig,
    windows: Arc<RwLock<HashMap<(AccountKey, &'static str), Vec<DateTime<Utc>>>>>,
}

impl RateLimiter {
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            windows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Record one attempt; rejects when the account exceeded its budget for
    /// this operation inside the window.
    pub async fn check(&self, account: &AccountKey, operation: &'static str) -> Result<()> {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(self.config.window_secs);

        let mut windows = self.windows.write().await;
        let attempts = windows
            .entry((account.clone(), operation))
            .or_insert_with(Vec::new);
        attempts.retain(|t| *t > cutoff);

        if attempts.len() >= self.config.max_operations {
            warn!(
                account = %account,
                operation = operation,
                attempts = attempts.len(),
                window_secs = self.config.window_secs,
                "⚠️ Rate limit hit"
            );
            return Err(MarketError::RateLimited(format!(
                "{operation}: more than {} attempts within {}s",
                self.config.max_operations, self.config.window_secs
            )));
        }

        attempts.push(now);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use everstore_types::{UserId, WalletAddress};

    fn account(user: &str) -> AccountKey {
        AccountKey::new(UserId::new(user), WalletAddress::new("w"))
    }

    #[tokio::test]
    async fn budget_is_per_account_and_operation() {
        let limiter = RateLimiter::new(RateLimiterConfig {
            max_operations: 2,
            window_secs: 60,
        });
        let alice = account("alice");
        let bob = account("bob");

        limiter.check(&alice, "create_listing").await.unwrap();
        limiter.check(&alice, "create_listing").await.unwrap();
        let err = limiter.check(&alice, "create_listing").await.unwrap_err();
        assert!(matches!(err, MarketError::RateLimited(_)));

        // Other operations and other accounts are unaffected.
        limiter.check(&alice, "purchase_listing").await.unwrap();
        limiter.check(&bob, "create_listing").await.unwrap();
    }
}
