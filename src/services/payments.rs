use crate::errors::ServiceError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use strum::{Display, EnumString};
use tracing::{info, instrument, warn};

pub const DEFAULT_GATEWAY_URL: &str = "https://api.stripe.com";

/// Gateway-side state of a payment authorization.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum AuthorizationStatus {
    RequiresPaymentMethod,
    RequiresConfirmation,
    RequiresAction,
    Processing,
    RequiresCapture,
    Canceled,
    Succeeded,
    #[serde(other)]
    Unknown,
}

/// A held authorization (PaymentIntent).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentAuthorization {
    pub id: String,
    pub status: AuthorizationStatus,
    /// Authorized amount in minor units.
    pub amount: i64,
    pub currency: String,
    #[serde(default)]
    pub amount_received: i64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRequest {
    pub payment_intent_id: String,
    /// Minor units; never more than the authorized amount.
    pub amount: i64,
    pub idempotency_key: String,
}

#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn retrieve_authorization(
        &self,
        payment_intent_id: &str,
    ) -> Result<PaymentAuthorization, ServiceError>;

    /// Captures `request.amount` of the authorization. Retries with the same
    /// idempotency key are deduplicated by the gateway.
    async fn capture(&self, request: &CaptureRequest) -> Result<PaymentAuthorization, ServiceError>;
}

/// Gateway configuration
#[derive(Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub secret_key: String,
    pub timeout: Duration,
}

impl std::fmt::Debug for GatewayConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayConfig")
            .field("base_url", &self.base_url)
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// PaymentIntent API client (Stripe wire format).
#[derive(Clone, Debug)]
pub struct HttpPaymentGateway {
    config: GatewayConfig,
    client: reqwest::Client,
}

impl HttpPaymentGateway {
    pub fn new(config: GatewayConfig) -> Result<Self, ServiceError> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| ServiceError::InternalError(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }

    async fn parse(
        response: reqwest::Response,
        payment_intent_id: &str,
    ) -> Result<PaymentAuthorization, ServiceError> {
        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ServiceError::NotFound(format!(
                "Payment intent {} not found",
                payment_intent_id
            )));
        }
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(payment_intent_id = %payment_intent_id, status = %status, "Payment gateway error: {}", error_text);
            return Err(if status.is_server_error() {
                ServiceError::ExternalServiceError(format!("Payment gateway returned {}", status))
            } else {
                ServiceError::PaymentFailed(format!("Gateway rejected request: {}", error_text))
            });
        }

        response.json().await.map_err(|e| {
            ServiceError::ExternalServiceError(format!("Failed to parse gateway response: {}", e))
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    #[instrument(skip(self))]
    async fn retrieve_authorization(
        &self,
        payment_intent_id: &str,
    ) -> Result<PaymentAuthorization, ServiceError> {
        let response = self
            .client
            .get(self.url(&format!("/v1/payment_intents/{}", payment_intent_id)))
            .basic_auth(&self.config.secret_key, Some(""))
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("Payment gateway error: {}", e)))?;

        Self::parse(response, payment_intent_id).await
    }

    #[instrument(skip(self, request), fields(payment_intent_id = %request.payment_intent_id, amount = request.amount))]
    async fn capture(&self, request: &CaptureRequest) -> Result<PaymentAuthorization, ServiceError> {
        let amount = request.amount.to_string();
        let response = self
            .client
            .post(self.url(&format!(
                "/v1/payment_intents/{}/capture",
                request.payment_intent_id
            )))
            .basic_auth(&self.config.secret_key, Some(""))
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&[("amount_to_capture", amount.as_str())])
            .send()
            .await
            .map_err(|e| ServiceError::ExternalServiceError(format!("Payment gateway error: {}", e)))?;

        let captured = Self::parse(response, &request.payment_intent_id).await?;
        info!(
            payment_intent_id = %captured.id,
            status = %captured.status,
            "Payment intent captured"
        );
        Ok(captured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_statuses_deserialize() {
        let auth: PaymentAuthorization = serde_json::from_str(
            r#"{"id":"pi_1","status":"something_new","amount":100,"currency":"usd"}"#,
        )
        .unwrap();
        assert_eq!(auth.status, AuthorizationStatus::Unknown);
        assert_eq!(auth.amount_received, 0);
    }

    #[test]
    fn debug_output_hides_secret_key() {
        let config = GatewayConfig {
            base_url: DEFAULT_GATEWAY_URL.into(),
            secret_key: "sk_test_secret".into(),
            timeout: Duration::from_secs(5),
        };
        assert!(!format!("{:?}", config).contains("sk_test_secret"));
    }
}
