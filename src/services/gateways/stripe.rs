use super::{
    constant_time_eq, to_minor_units, GatewayEvent, GatewayEventKind, PaymentGateway,
    PaymentIntent, PaymentProvider, RefundResult,
};
use crate::errors::ServiceError;
use async_trait::async_trait;
use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::Value;
use sha2::Sha256;
use std::time::Duration;
use tracing::{error, instrument, warn};
use uuid::Uuid;

type HmacSha256 = Hmac<Sha256>;

/// Stripe PaymentIntent flow: intents are created server-side, confirmed
/// by the client with the `client_secret`, and settled via webhook or
/// the confirm endpoint polling the intent state.
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
    api_base: String,
    secret_key: String,
    webhook_secret: Option<String>,
    webhook_tolerance_secs: u64,
}

impl StripeGateway {
    pub fn new(
        api_base: String,
        secret_key: String,
        webhook_secret: Option<String>,
        webhook_tolerance_secs: u64,
        timeout_secs: u64,
    ) -> Result<Self, ServiceError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| {
                ServiceError::InternalError(format!("Failed to build HTTP client: {}", e))
            })?;
        Ok(Self {
            client,
            api_base,
            secret_key,
            webhook_secret,
            webhook_tolerance_secs,
        })
    }

    async fn post_form(
        &self,
        path: &str,
        form: &[(String, String)],
    ) -> Result<Value, ServiceError> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.secret_key)
            .form(form)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, path, "Stripe request failed");
                ServiceError::PaymentFailed(format!("Stripe request failed: {}", e))
            })?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| {
            ServiceError::PaymentFailed(format!("Invalid Stripe response: {}", e))
        })?;

        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown error");
            error!(%status, message, path, "Stripe API returned an error");
            return Err(ServiceError::PaymentFailed(format!(
                "Stripe error: {}",
                message
            )));
        }
        Ok(body)
    }

    async fn get(&self, path: &str) -> Result<Value, ServiceError> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.secret_key)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, path, "Stripe request failed");
                ServiceError::PaymentFailed(format!("Stripe request failed: {}", e))
            })?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| {
            ServiceError::PaymentFailed(format!("Invalid Stripe response: {}", e))
        })?;

        if !status.is_success() {
            let message = body["error"]["message"].as_str().unwrap_or("unknown error");
            return Err(ServiceError::PaymentFailed(format!(
                "Stripe error: {}",
                message
            )));
        }
        Ok(body)
    }

    fn intent_from_json(&self, body: Value) -> PaymentIntent {
        PaymentIntent {
            provider: PaymentProvider::Stripe,
            reference: body["id"].as_str().unwrap_or_default().to_string(),
            client_secret: body["client_secret"].as_str().map(str::to_string),
            approval_url: None,
            status: body["status"].as_str().unwrap_or_default().to_string(),
            raw: body,
        }
    }
}

#[async_trait]
impl PaymentGateway for StripeGateway {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Stripe
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        order_id: Uuid,
        order_number: &str,
    ) -> Result<PaymentIntent, ServiceError> {
        let minor = to_minor_units(amount, currency)?;
        let form = vec![
            ("amount".to_string(), minor.to_string()),
            ("currency".to_string(), currency.to_lowercase()),
            (
                "metadata[order_id]".to_string(),
                order_id.to_string(),
            ),
            (
                "metadata[order_number]".to_string(),
                order_number.to_string(),
            ),
            (
                "automatic_payment_methods[enabled]".to_string(),
                "true".to_string(),
            ),
        ];
        let body = self.post_form("/payment_intents", &form).await?;
        Ok(self.intent_from_json(body))
    }

    async fn retrieve_intent(&self, reference: &str) -> Result<PaymentIntent, ServiceError> {
        let body = self.get(&format!("/payment_intents/{}", reference)).await?;
        Ok(self.intent_from_json(body))
    }

    async fn capture(&self, reference: &str) -> Result<super::CaptureResult, ServiceError> {
        let body = self
            .post_form(&format!("/payment_intents/{}/capture", reference), &[])
            .await?;
        let status = body["status"].as_str().unwrap_or_default().to_string();
        Ok(super::CaptureResult {
            reference: reference.to_string(),
            capture_id: None,
            succeeded: status == "succeeded",
            status,
            raw: body,
        })
    }

    /// Verifies the `Stripe-Signature` header: HMAC-SHA256 over
    /// `"{t}.{payload}"`, compared in constant time, with the timestamp
    /// bounded by the configured tolerance.
    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> Result<(), ServiceError> {
        let secret = self
            .webhook_secret
            .as_deref()
            .ok_or_else(|| {
                error!("Stripe webhook secret is not configured");
                ServiceError::InternalError("Stripe webhook secret not configured".to_string())
            })?;

        let header = headers
            .get("Stripe-Signature")
            .and_then(|h| h.to_str().ok())
            .ok_or(ServiceError::WebhookSignatureInvalid)?;

        let mut timestamp = "";
        let mut v1 = "";
        for part in header.split(',') {
            let mut it = part.trim().splitn(2, '=');
            match (it.next(), it.next()) {
                (Some("t"), Some(val)) => timestamp = val,
                (Some("v1"), Some(val)) => v1 = val,
                _ => {}
            }
        }
        if timestamp.is_empty() || v1.is_empty() {
            return Err(ServiceError::WebhookSignatureInvalid);
        }

        let ts: i64 = timestamp
            .parse()
            .map_err(|_| ServiceError::WebhookSignatureInvalid)?;
        let now = chrono::Utc::now().timestamp();
        if (now - ts).unsigned_abs() > self.webhook_tolerance_secs {
            warn!("Stripe webhook timestamp outside tolerance");
            return Err(ServiceError::WebhookSignatureInvalid);
        }

        let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
            .map_err(|_| ServiceError::WebhookSignatureInvalid)?;
        mac.update(timestamp.as_bytes());
        mac.update(b".");
        mac.update(payload);
        let expected = hex::encode(mac.finalize().into_bytes());

        if constant_time_eq(&expected, v1) {
            Ok(())
        } else {
            warn!("Stripe webhook signature mismatch");
            Err(ServiceError::WebhookSignatureInvalid)
        }
    }

    fn parse_webhook_event(&self, payload: &Value) -> Option<GatewayEvent> {
        let event_type = payload["type"].as_str()?;
        let object = &payload["data"]["object"];

        let (reference, kind) = match event_type {
            "payment_intent.succeeded" => (object["id"].as_str()?, GatewayEventKind::Succeeded),
            "payment_intent.payment_failed" => {
                (object["id"].as_str()?, GatewayEventKind::Failed)
            }
            // Refund events reference the charge; the intent id lives on
            // the charge object.
            "charge.refunded" => (
                object["payment_intent"].as_str()?,
                GatewayEventKind::Refunded,
            ),
            _ => return None,
        };

        Some(GatewayEvent {
            reference: reference.to_string(),
            kind,
            raw: payload.clone(),
        })
    }

    #[instrument(skip(self))]
    async fn refund(
        &self,
        capture_reference: &str,
        amount: Option<Decimal>,
        currency: &str,
    ) -> Result<RefundResult, ServiceError> {
        let mut form = vec![(
            "payment_intent".to_string(),
            capture_reference.to_string(),
        )];
        if let Some(amount) = amount {
            form.push(("amount".to_string(), to_minor_units(amount, currency)?.to_string()));
        }
        let body = self.post_form("/refunds", &form).await?;
        let status = body["status"].as_str().unwrap_or_default().to_string();
        Ok(RefundResult {
            refund_id: body["id"].as_str().unwrap_or_default().to_string(),
            succeeded: status == "succeeded" || status == "pending",
            status,
            raw: body,
        })
    }
}
