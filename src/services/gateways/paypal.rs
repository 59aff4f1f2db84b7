use super::{
    to_decimal_string, CaptureResult, GatewayEvent, GatewayEventKind, PaymentGateway,
    PaymentIntent, PaymentProvider, RefundResult,
};
use crate::errors::ServiceError;
use async_trait::async_trait;
use axum::http::HeaderMap;
use reqwest::Client;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{error, instrument, warn};
use uuid::Uuid;

/// PayPal v2 Checkout flow: an order is created server-side, approved by
/// the buyer at the approval URL, then captured. Webhook authenticity is
/// checked through PayPal's verify-webhook-signature API rather than a
/// local HMAC.
#[derive(Clone)]
pub struct PaypalGateway {
    client: Client,
    api_base: String,
    client_id: String,
    client_secret: String,
    webhook_id: Option<String>,
}

impl PaypalGateway {
    pub fn new(
        api_base: String,
        client_id: String,
        client_secret: String,
        webhook_id: Option<String>,
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
            client_id,
            client_secret,
            webhook_id,
        })
    }

    /// Client-credentials token. Requested per call; PayPal tokens are
    /// cacheable but the flow stays correct without it.
    async fn access_token(&self) -> Result<String, ServiceError> {
        let url = format!("{}/v1/oauth2/token", self.api_base);
        let response = self
            .client
            .post(&url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&[("grant_type", "client_credentials")])
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, "PayPal token request failed");
                ServiceError::PaymentFailed(format!("PayPal token request failed: {}", e))
            })?;

        let status = response.status();
        let body: Value = response.json().await.map_err(|e| {
            ServiceError::PaymentFailed(format!("Invalid PayPal token response: {}", e))
        })?;
        if !status.is_success() {
            error!(%status, "PayPal token endpoint returned an error");
            return Err(ServiceError::PaymentFailed(
                "PayPal authentication failed".to_string(),
            ));
        }

        body["access_token"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| {
                ServiceError::PaymentFailed("PayPal token response missing access_token".into())
            })
    }

    async fn post_json(&self, path: &str, payload: Value) -> Result<Value, ServiceError> {
        let token = self.access_token().await?;
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                error!(error = %e, path, "PayPal request failed");
                ServiceError::PaymentFailed(format!("PayPal request failed: {}", e))
            })?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body["message"].as_str().unwrap_or("unknown error");
            error!(%status, message, path, "PayPal API returned an error");
            return Err(ServiceError::PaymentFailed(format!(
                "PayPal error: {}",
                message
            )));
        }
        Ok(body)
    }

    async fn get_json(&self, path: &str) -> Result<Value, ServiceError> {
        let token = self.access_token().await?;
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .client
            .get(&url)
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| {
                ServiceError::PaymentFailed(format!("PayPal request failed: {}", e))
            })?;

        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            let message = body["message"].as_str().unwrap_or("unknown error");
            return Err(ServiceError::PaymentFailed(format!(
                "PayPal error: {}",
                message
            )));
        }
        Ok(body)
    }

    fn approval_url(body: &Value) -> Option<String> {
        body["links"]
            .as_array()?
            .iter()
            .find(|link| link["rel"].as_str() == Some("approve"))
            .and_then(|link| link["href"].as_str())
            .map(str::to_string)
    }
}

#[async_trait]
impl PaymentGateway for PaypalGateway {
    fn provider(&self) -> PaymentProvider {
        PaymentProvider::Paypal
    }

    #[instrument(skip(self), fields(order_id = %order_id))]
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        order_id: Uuid,
        order_number: &str,
    ) -> Result<PaymentIntent, ServiceError> {
        let payload = json!({
            "intent": "CAPTURE",
            "purchase_units": [{
                "reference_id": order_number,
                "custom_id": order_id.to_string(),
                "amount": {
                    "currency_code": currency.to_uppercase(),
                    "value": to_decimal_string(amount, currency),
                }
            }]
        });
        let body = self.post_json("/v2/checkout/orders", payload).await?;

        Ok(PaymentIntent {
            provider: PaymentProvider::Paypal,
            reference: body["id"].as_str().unwrap_or_default().to_string(),
            client_secret: None,
            approval_url: Self::approval_url(&body),
            status: body["status"].as_str().unwrap_or_default().to_string(),
            raw: body,
        })
    }

    async fn retrieve_intent(&self, reference: &str) -> Result<PaymentIntent, ServiceError> {
        let body = self
            .get_json(&format!("/v2/checkout/orders/{}", reference))
            .await?;
        Ok(PaymentIntent {
            provider: PaymentProvider::Paypal,
            reference: reference.to_string(),
            client_secret: None,
            approval_url: Self::approval_url(&body),
            status: body["status"].as_str().unwrap_or_default().to_string(),
            raw: body,
        })
    }

    #[instrument(skip(self))]
    async fn capture(&self, reference: &str) -> Result<CaptureResult, ServiceError> {
        let body = self
            .post_json(
                &format!("/v2/checkout/orders/{}/capture", reference),
                json!({}),
            )
            .await?;
        let status = body["status"].as_str().unwrap_or_default().to_string();
        let capture_id = body["purchase_units"][0]["payments"]["captures"][0]["id"]
            .as_str()
            .map(str::to_string);

        Ok(CaptureResult {
            reference: reference.to_string(),
            capture_id,
            succeeded: status == "COMPLETED",
            status,
            raw: body,
        })
    }

    /// Delegates authenticity to PayPal's verify-webhook-signature API,
    /// passing through the paypal-* transmission headers.
    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> Result<(), ServiceError> {
        let webhook_id = self.webhook_id.as_deref().ok_or_else(|| {
            error!("PayPal webhook id is not configured");
            ServiceError::InternalError("PayPal webhook id not configured".to_string())
        })?;

        let header = |name: &str| -> Result<&str, ServiceError> {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .ok_or(ServiceError::WebhookSignatureInvalid)
        };

        let event: Value = serde_json::from_slice(payload)
            .map_err(|_| ServiceError::WebhookSignatureInvalid)?;

        let verification = json!({
            "auth_algo": header("paypal-auth-algo")?,
            "cert_url": header("paypal-cert-url")?,
            "transmission_id": header("paypal-transmission-id")?,
            "transmission_sig": header("paypal-transmission-sig")?,
            "transmission_time": header("paypal-transmission-time")?,
            "webhook_id": webhook_id,
            "webhook_event": event,
        });

        let body = self
            .post_json("/v1/notifications/verify-webhook-signature", verification)
            .await?;

        match body["verification_status"].as_str() {
            Some("SUCCESS") => Ok(()),
            _ => {
                warn!("PayPal webhook signature verification failed");
                Err(ServiceError::WebhookSignatureInvalid)
            }
        }
    }

    fn parse_webhook_event(&self, payload: &Value) -> Option<GatewayEvent> {
        let event_type = payload["event_type"].as_str()?;
        let resource = &payload["resource"];

        // Capture events carry the checkout order id in the related ids;
        // order-level events carry it as the resource id.
        let order_reference = resource["supplementary_data"]["related_ids"]["order_id"]
            .as_str()
            .or_else(|| resource["id"].as_str())?;

        let kind = match event_type {
            "PAYMENT.CAPTURE.COMPLETED" | "CHECKOUT.ORDER.COMPLETED" => {
                GatewayEventKind::Succeeded
            }
            "PAYMENT.CAPTURE.DENIED" => GatewayEventKind::Failed,
            "PAYMENT.CAPTURE.REFUNDED" => GatewayEventKind::Refunded,
            _ => return None,
        };

        Some(GatewayEvent {
            reference: order_reference.to_string(),
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
        let payload = match amount {
            Some(amount) => json!({
                "amount": {
                    "value": to_decimal_string(amount, currency),
                    "currency_code": currency.to_uppercase(),
                }
            }),
            None => json!({}),
        };
        let body = self
            .post_json(
                &format!("/v2/payments/captures/{}/refund", capture_reference),
                payload,
            )
            .await?;
        let status = body["status"].as_str().unwrap_or_default().to_string();

        Ok(RefundResult {
            refund_id: body["id"].as_str().unwrap_or_default().to_string(),
            succeeded: status == "COMPLETED" || status == "PENDING",
            status,
            raw: body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gateway() -> PaypalGateway {
        PaypalGateway::new(
            "https://api.paypal.test".to_string(),
            "client".to_string(),
            "secret".to_string(),
            Some("WH-123".to_string()),
            5,
        )
        .unwrap()
    }

    #[test]
    fn parses_capture_completed_with_related_order_id() {
        let gw = gateway();
        let payload = json!({
            "event_type": "PAYMENT.CAPTURE.COMPLETED",
            "resource": {
                "id": "CAP-1",
                "supplementary_data": {"related_ids": {"order_id": "ORDER-9"}}
            }
        });
        let event = gw.parse_webhook_event(&payload).unwrap();
        assert_eq!(event.reference, "ORDER-9");
        assert_eq!(event.kind, GatewayEventKind::Succeeded);
    }

    #[test]
    fn parses_refund_event() {
        let gw = gateway();
        let payload = json!({
            "event_type": "PAYMENT.CAPTURE.REFUNDED",
            "resource": {
                "id": "REF-1",
                "supplementary_data": {"related_ids": {"order_id": "ORDER-2"}}
            }
        });
        let event = gw.parse_webhook_event(&payload).unwrap();
        assert_eq!(event.reference, "ORDER-2");
        assert_eq!(event.kind, GatewayEventKind::Refunded);
    }

    #[test]
    fn ignores_unrelated_events() {
        let gw = gateway();
        let payload = json!({
            "event_type": "BILLING.PLAN.CREATED",
            "resource": {"id": "P-1"}
        });
        assert!(gw.parse_webhook_event(&payload).is_none());
    }

    #[test]
    fn approval_url_is_extracted() {
        let body = json!({
            "id": "ORDER-5",
            "links": [
                {"rel": "self", "href": "https://api.paypal.test/v2/checkout/orders/ORDER-5"},
                {"rel": "approve", "href": "https://paypal.test/checkoutnow?token=ORDER-5"}
            ]
        });
        assert_eq!(
            PaypalGateway::approval_url(&body).unwrap(),
            "https://paypal.test/checkoutnow?token=ORDER-5"
        );
    }
}
