use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::config::GatewayConfig;
use crate::entities::order;
use crate::errors::ServiceError;

/// Payment gateway contract consumed by the orchestrators. The gateway owns
/// its own ledger; this crate only creates checkout sessions, issues refunds,
/// and consumes webhook notifications.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Opens a hosted checkout session for a pending order and returns the
    /// session id the webhook will later reference.
    async fn create_checkout_session(&self, order: &order::Model)
        -> Result<String, ServiceError>;

    /// Issues a (possibly partial) refund against a captured transaction.
    /// Returns the gateway's refund id.
    async fn refund(&self, transaction_id: &str, amount: Decimal)
        -> Result<String, ServiceError>;
}

/// Webhook payload delivered by the gateway. Delivery is at-least-once and
/// may arrive out of order; handlers must be idempotent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookEvent {
    pub event: String,
    pub session_id: Option<String>,
    pub transaction_id: String,
    pub amount_paid: Decimal,
}

#[derive(Serialize)]
struct SessionRequest<'a> {
    reference: &'a str,
    amount: Decimal,
    currency: &'a str,
}

#[derive(Deserialize)]
struct SessionResponse {
    session_id: String,
}

#[derive(Serialize)]
struct RefundRequestBody<'a> {
    transaction_id: &'a str,
    amount: Decimal,
}

#[derive(Deserialize)]
struct RefundResponse {
    refund_id: String,
}

/// HTTP implementation of the gateway contract.
///
/// Transport failures (connect/timeout/5xx) are retried a bounded number of
/// times with exponential backoff and surface as `GatewayUnavailable`;
/// gateway business rejections (4xx) are terminal and surface as
/// `GatewayRejected` without retrying.
pub struct HttpGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ServiceError::InternalError(format!("gateway client: {e}")))?;
        Ok(Self { client, config })
    }

    async fn post_with_retry<B: Serialize, R: for<'de> Deserialize<'de>>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<R, ServiceError> {
        let url = format!("{}/{}", self.config.base_url.trim_end_matches('/'), path);
        let mut attempt = 0u32;
        let mut backoff = Duration::from_millis(self.config.retry_backoff_ms);

        loop {
            let result = self
                .client
                .post(&url)
                .bearer_auth(&self.config.api_key)
                .json(body)
                .send()
                .await;

            match result {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.json::<R>().await.map_err(|e| {
                            ServiceError::GatewayUnavailable(format!(
                                "malformed gateway response: {e}"
                            ))
                        });
                    }
                    let detail = response.text().await.unwrap_or_default();
                    if status.is_client_error() {
                        // The gateway evaluated the request and said no.
                        return Err(ServiceError::GatewayRejected(format!(
                            "{status}: {detail}"
                        )));
                    }
                    if attempt >= self.config.retry_limit {
                        return Err(ServiceError::GatewayUnavailable(format!(
                            "{status}: {detail}"
                        )));
                    }
                    warn!(%url, %status, attempt, "Gateway returned server error, retrying");
                }
                Err(e) => {
                    if attempt >= self.config.retry_limit {
                        return Err(ServiceError::GatewayUnavailable(e.to_string()));
                    }
                    warn!(%url, error = %e, attempt, "Gateway transport failure, retrying");
                }
            }

            attempt += 1;
            tokio::time::sleep(backoff).await;
            backoff *= 2;
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpGateway {
    #[instrument(skip(self, order), fields(order_id = %order.id))]
    async fn create_checkout_session(
        &self,
        order: &order::Model,
    ) -> Result<String, ServiceError> {
        let request = SessionRequest {
            reference: &order.order_number,
            amount: order.total_amount,
            currency: "USD",
        };
        let response: SessionResponse =
            self.post_with_retry("checkout/sessions", &request).await?;
        Ok(response.session_id)
    }

    #[instrument(skip(self))]
    async fn refund(
        &self,
        transaction_id: &str,
        amount: Decimal,
    ) -> Result<String, ServiceError> {
        let request = RefundRequestBody {
            transaction_id,
            amount,
        };
        let response: RefundResponse = self.post_with_retry("refunds", &request).await?;
        Ok(response.refund_id)
    }
}
