use crate::error::{MarketError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use everstore_types::UsdAmount;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Request for one hosted payment charge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeRequest {
    pub amount: UsdAmount,
    pub currency: String,
    pub description: String,
    pub metadata: serde_json::Value,
}

/// A created charge: the external reference plus where the payer goes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Charge {
    pub charge_id: String,
    pub hosted_payment_url: String,
}

/// Provider-reported charge state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChargeEventStatus {
    Created,
    Pending,
    Confirmed,
    Delayed,
    Resolved,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeEvent {
    pub status: ChargeEventStatus,
    pub timestamp: DateTime<Utc>,
}

/// Full status timeline of a charge. Providers can report a later
/// non-terminal status after a transient confirmed event, so consumers must
/// scan the whole timeline rather than trusting `current`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChargeStatus {
    pub charge_id: String,
    /// Amount the provider actually charged.
    pub amount: UsdAmount,
    pub timeline: Vec<ChargeEvent>,
    pub current: ChargeEventStatus,
}

impl ChargeStatus {
    /// A confirmed event anywhere in the timeline counts as paid.
    pub fn has_confirmed_event(&self) -> bool {
        self.timeline
            .iter()
            .any(|e| e.status == ChargeEventStatus::Confirmed)
    }
}

/// External payment-charge provider.
///
/// `create_charge` is a mutating call and is never retried here (the
/// provider offers no idempotency key); `charge_status` is read-only and
/// may be retried by implementations.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<Charge>;
    async fn charge_status(&self, charge_id: &str) -> Result<ChargeStatus>;
}

/// Configuration for the hosted-charge HTTP provider.
#[derive(Debug, Clone)]
pub struct PaymentProviderConfig {
    pub api_url: String,
    pub api_key: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Retry attempts for status lookups
    pub max_retries: usize,
}

impl Default for PaymentProviderConfig {
    fn default() -> Self {
        Self {
            api_url: "https://api.commerce.example.com".to_string(),
            api_key: String::new(),
            timeout_secs: 15,
            max_retries: 3,
        }
    }
}

#[derive(Debug, Serialize)]
struct WireChargeBody<'a> {
    name: &'a str,
    description: &'a str,
    pricing_type: &'static str,
    local_price: WirePrice,
    metadata: &'a serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
struct WirePrice {
    amount: String,
    currency: String,
}

#[derive(Debug, Deserialize)]
struct WireEnvelope {
    data: WireCharge,
}

#[derive(Debug, Deserialize)]
struct WireCharge {
    id: String,
    hosted_url: String,
    #[serde(default)]
    timeline: Vec<WireEvent>,
    #[serde(default)]
    pricing: Option<WirePricing>,
}

#[derive(Debug, Deserialize)]
struct WireEvent {
    status: String,
    time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct WirePricing {
    local: WirePrice,
}

fn status_from_wire(status: &str) -> ChargeEventStatus {
    match status.to_ascii_uppercase().as_str() {
        "NEW" | "CREATED" => ChargeEventStatus::Created,
        "PENDING" => ChargeEventStatus::Pending,
        "COMPLETED" | "CONFIRMED" => ChargeEventStatus::Confirmed,
        "DELAYED" | "UNDERPAID" => ChargeEventStatus::Delayed,
        "RESOLVED" => ChargeEventStatus::Resolved,
        "EXPIRED" | "CANCELED" | "FAILED" => ChargeEventStatus::Failed,
        other => {
            warn!(status = other, "Unknown charge status from provider");
            ChargeEventStatus::Pending
        }
    }
}

/// Hosted-charge provider over HTTP.
pub struct HttpPaymentProvider {
    config: PaymentProviderConfig,
    client: reqwest::Client,
}

impl HttpPaymentProvider {
    pub fn new(config: PaymentProviderConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .expect("Failed to create HTTP client");
        Self { config, client }
    }

    fn charges_url(&self) -> String {
        format!("{}/charges", self.config.api_url.trim_end_matches('/'))
    }

    fn parse_status(&self, charge: WireCharge) -> ChargeStatus {
        let timeline: Vec<ChargeEvent> = charge
            .timeline
            .iter()
            .map(|e| ChargeEvent {
                status: status_from_wire(&e.status),
                timestamp: e.time,
            })
            .collect();
        let current = timeline
            .last()
            .map(|e| e.status)
            .unwrap_or(ChargeEventStatus::Created);
        let amount = charge
            .pricing
            .as_ref()
            .and_then(|p| p.local.amount.parse::<f64>().ok())
            .map(UsdAmount::from_usd)
            .unwrap_or(UsdAmount::ZERO);
        ChargeStatus {
            charge_id: charge.id,
            amount,
            timeline,
            current,
        }
    }
}

#[async_trait]
impl PaymentProvider for HttpPaymentProvider {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<Charge> {
        let body = WireChargeBody {
            name: "Everstore storage credits",
            description: &request.description,
            pricing_type: "fixed_price",
            local_price: WirePrice {
                amount: format!("{:.6}", request.amount.to_usd()),
                currency: request.currency.clone(),
            },
            metadata: &request.metadata,
        };

        // Single attempt: duplicating a mutating call could double-charge.
        let envelope: WireEnvelope = self
            .client
            .post(self.charges_url())
            .header("X-CC-Api-Key", &self.config.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|e| MarketError::ExternalServiceUnavailable(format!("create charge: {e}")))?
            .error_for_status()
            .map_err(|e| MarketError::ExternalServiceUnavailable(format!("create charge: {e}")))?
            .json()
            .await
            .map_err(|e| MarketError::ExternalServiceUnavailable(format!("create charge: {e}")))?;

        info!(
            charge_id = %envelope.data.id,
            amount = request.amount.to_usd(),
            "🧾 Payment charge created"
        );
        Ok(Charge {
            charge_id: envelope.data.id,
            hosted_payment_url: envelope.data.hosted_url,
        })
    }

    async fn charge_status(&self, charge_id: &str) -> Result<ChargeStatus> {
        let url = format!("{}/{}", self.charges_url(), charge_id);
        let mut last_error = String::new();

        for attempt in 0..self.config.max_retries.max(1) {
            let response = self
                .client
                .get(&url)
                .header("X-CC-Api-Key", &self.config.api_key)
                .send()
                .await
                .and_then(|r| r.error_for_status());

            match response {
                Ok(response) => match response.json::<WireEnvelope>().await {
                    Ok(envelope) => return Ok(self.parse_status(envelope.data)),
                    Err(e) => last_error = e.to_string(),
                },
                Err(e) => last_error = e.to_string(),
            }

            debug!(
                charge_id = charge_id,
                attempt = attempt + 1,
                max = self.config.max_retries,
                error = %last_error,
                "Charge status lookup failed"
            );
            if attempt + 1 < self.config.max_retries {
                tokio::time::sleep(Duration::from_millis(100 * (attempt as u64 + 1))).await;
            }
        }

        Err(MarketError::ExternalServiceUnavailable(format!(
            "charge status {charge_id}: {last_error}"
        )))
    }
}

/// Scriptable in-memory provider for tests and local development.
pub struct MockPaymentProvider {
    charges: Arc<RwLock<HashMap<String, ChargeStatus>>>,
    counter: AtomicU64,
}

impl Default for MockPaymentProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPaymentProvider {
    pub fn new() -> Self {
        Self {
            charges: Arc::new(RwLock::new(HashMap::new())),
            counter: AtomicU64::new(0),
        }
    }

    /// Mark a charge as paid: appends a confirmed event to its timeline.
    pub async fn confirm_charge(&self, charge_id: &str) {
        self.push_event(charge_id, ChargeEventStatus::Confirmed).await;
    }

    /// Append an arbitrary event, e.g. a trailing `Pending` after a
    /// transient confirmation.
    pub async fn push_event(&self, charge_id: &str, status: ChargeEventStatus) {
        let mut charges = self.charges.write().await;
        if let Some(charge) = charges.get_mut(charge_id) {
            charge.timeline.push(ChargeEvent {
                status,
                timestamp: Utc::now(),
            });
            charge.current = status;
        }
    }

    /// Override the amount the provider reports as paid.
    pub async fn set_paid_amount(&self, charge_id: &str, amount: UsdAmount) {
        let mut charges = self.charges.write().await;
        if let Some(charge) = charges.get_mut(charge_id) {
            charge.amount = amount;
        }
    }
}

#[async_trait]
impl PaymentProvider for MockPaymentProvider {
    async fn create_charge(&self, request: &ChargeRequest) -> Result<Charge> {
        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let charge_id = format!("mock-charge-{n}");
        let status = ChargeStatus {
            charge_id: charge_id.clone(),
            amount: request.amount,
            timeline: vec![ChargeEvent {
                status: ChargeEventStatus::Created,
                timestamp: Utc::now(),
            }],
            current: ChargeEventStatus::Created,
        };
        self.charges.write().await.insert(charge_id.clone(), status);
        Ok(Charge {
            hosted_payment_url: format!("https://pay.example.com/{charge_id}"),
            charge_id,
        })
    }

    async fn charge_status(&self, charge_id: &str) -> Result<ChargeStatus> {
        let charges = self.charges.read().await;
        charges
            .get(charge_id)
            .cloned()
            .ok_or_else(|| MarketError::NotFound(format!("charge {charge_id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn request(amount: f64) -> ChargeRequest {
        ChargeRequest {
            amount: UsdAmount::from_usd(amount),
            currency: "USD".to_string(),
            description: "test charge".to_string(),
            metadata: json!({}),
        }
    }

    #[tokio::test]
    async fn confirmation_survives_later_non_terminal_events() {
        let provider = MockPaymentProvider::new();
        let charge = provider.create_charge(&request(2.0)).await.unwrap();

        provider.confirm_charge(&charge.charge_id).await;
        // Provider later reports a transient pending state.
        provider
            .push_event(&charge.charge_id, ChargeEventStatus::Pending)
            .await;

        let status = provider.charge_status(&charge.charge_id).await.unwrap();
        assert_eq!(status.current, ChargeEventStatus::Pending);
        assert!(status.has_confirmed_event());
    }

    #[tokio::test]
    async fn unconfirmed_charge_has_no_confirmed_event() {
        let provider = MockPaymentProvider::new();
        let charge = provider.create_charge(&request(2.0)).await.unwrap();
        let status = provider.charge_status(&charge.charge_id).await.unwrap();
        assert!(!status.has_confirmed_event());
    }

    #[test]
    fn wire_statuses_map_to_the_taxonomy() {
        assert_eq!(status_from_wire("COMPLETED"), ChargeEventStatus::Confirmed);
        assert_eq!(status_from_wire("new"), ChargeEventStatus::Created);
        assert_eq!(status_from_wire("EXPIRED"), ChargeEventStatus::Failed);
    }
}
