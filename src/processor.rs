use anyhow::{Context, anyhow};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, instrument};

/// Currency used when none is configured.
pub const DEFAULT_CURRENCY: &str = "usd";

/// A payout from the platform balance to a provider's account.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferRequest {
    /// Amount in minor currency units, always positive.
    pub amount: i64,
    /// ISO currency code, lower case.
    pub currency: String,
    /// Processor account that receives the funds.
    pub destination: String,
    /// Stable key grouping every transfer for one booking.
    ///
    /// Processors that deduplicate on it make retries safe.
    pub group_key: String,
    /// Free-form details stored alongside the transfer.
    pub metadata: Value,
}

/// The payment processor capability the release scheduler depends on.
pub trait PaymentProcessor: Send + Sync + 'static {
    /// Create a transfer and return the processor's identifier for it.
    ///
    /// An error means the transfer must be treated as not having happened.
    fn create_transfer(
        &self,
        request: &TransferRequest,
    ) -> impl Future<Output = anyhow::Result<String>> + Send;
}

/// Processor reached over HTTP with a bearer key.
///
/// Posts the [`TransferRequest`] as JSON to `{base_url}/transfers` and sends
/// the group key as the `Idempotency-Key` header.
#[derive(Debug, Clone)]
pub struct HttpPaymentProcessor {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Deserialize)]
struct TransferResponse {
    id: String,
}

impl HttpPaymentProcessor {
    /// Build a processor client whose requests give up after `timeout`.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
        })
    }
}

impl PaymentProcessor for HttpPaymentProcessor {
    #[instrument(name = "processor.create_transfer", skip_all, fields(group_key = %request.group_key))]
    async fn create_transfer(&self, request: &TransferRequest) -> anyhow::Result<String> {
        let url = format!("{}/transfers", self.base_url);

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", &request.group_key)
            .json(request)
            .send()
            .await
            .with_context(|| format!("Failed to reach payment processor at {url}"))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Payment processor rejected transfer ({status}): {body}"));
        }

        let transfer: TransferResponse = response
            .json()
            .await
            .context("Failed to parse transfer response")?;

        debug!(transfer.id = %transfer.id, "Transfer created");
        Ok(transfer.id)
    }
}
