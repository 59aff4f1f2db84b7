use crate::errors::ServiceError;
use async_trait::async_trait;
use axum::http::HeaderMap;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};
use utoipa::ToSchema;
use uuid::Uuid;

pub mod paypal;
pub mod stripe;

pub use paypal::PaypalGateway;
pub use stripe::StripeGateway;

/// Currencies whose minor unit equals the major unit; amounts are sent
/// to providers without the x100 scaling.
const ZERO_DECIMAL_CURRENCIES: &[&str] = &["jpy", "krw", "vnd", "xaf", "xof", "clp", "pyg", "rwf"];

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString, ToSchema,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentProvider {
    Stripe,
    Paypal,
}

/// Provider-side payment intent, created before the buyer confirms.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntent {
    pub provider: PaymentProvider,
    /// Provider reference stored on the order (intent id / order id)
    pub reference: String,
    /// Stripe confirm-flow secret handed to the client
    pub client_secret: Option<String>,
    /// PayPal buyer approval URL
    pub approval_url: Option<String>,
    pub status: String,
    #[serde(skip)]
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct CaptureResult {
    pub reference: String,
    /// Capture id refunds are issued against (PayPal)
    pub capture_id: Option<String>,
    pub succeeded: bool,
    pub status: String,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone)]
pub struct RefundResult {
    pub refund_id: String,
    pub succeeded: bool,
    pub status: String,
    pub raw: serde_json::Value,
}

/// Normalized webhook event extracted from a verified provider payload.
#[derive(Debug, Clone)]
pub struct GatewayEvent {
    /// Provider reference matching an order's `payment_id`
    pub reference: String,
    pub kind: GatewayEventKind,
    pub raw: serde_json::Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayEventKind {
    Succeeded,
    Failed,
    Refunded,
}

/// Seam between the order/payment flow and the concrete providers. One
/// implementation per provider; callers pick by `PaymentProvider` tag.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn provider(&self) -> PaymentProvider;

    /// Creates a provider-side intent for the given amount.
    async fn create_intent(
        &self,
        amount: Decimal,
        currency: &str,
        order_id: Uuid,
        order_number: &str,
    ) -> Result<PaymentIntent, ServiceError>;

    /// Fetches the current provider-side state of an intent.
    async fn retrieve_intent(&self, reference: &str) -> Result<PaymentIntent, ServiceError>;

    /// Captures an approved intent.
    async fn capture(&self, reference: &str) -> Result<CaptureResult, ServiceError>;

    /// Verifies a webhook delivery's authenticity. Failure maps to a
    /// 400 response; the payload must not be processed.
    async fn verify_webhook(
        &self,
        payload: &[u8],
        headers: &HeaderMap,
    ) -> Result<(), ServiceError>;

    /// Extracts the normalized event from a verified payload. `None`
    /// for event types this flow does not react to.
    fn parse_webhook_event(&self, payload: &serde_json::Value) -> Option<GatewayEvent>;

    /// Refunds a captured payment, fully when `amount` is `None`.
    async fn refund(
        &self,
        capture_reference: &str,
        amount: Option<Decimal>,
        currency: &str,
    ) -> Result<RefundResult, ServiceError>;
}

pub fn is_zero_decimal_currency(currency: &str) -> bool {
    ZERO_DECIMAL_CURRENCIES.contains(&currency.to_ascii_lowercase().as_str())
}

/// Converts a decimal amount to the provider's minor-unit integer.
pub fn to_minor_units(amount: Decimal, currency: &str) -> Result<i64, ServiceError> {
    let scaled = if is_zero_decimal_currency(currency) {
        amount
    } else {
        amount * Decimal::from(100)
    };
    let rounded = scaled.round();
    if rounded != scaled {
        return Err(ServiceError::InvalidInput(format!(
            "Amount {} has sub-minor-unit precision for currency {}",
            amount, currency
        )));
    }
    rounded.to_i64().ok_or_else(|| {
        ServiceError::InvalidInput(format!("Amount {} out of range", amount))
    })
}

/// Formats a decimal amount the way PayPal expects: two decimal places,
/// or whole units for zero-decimal currencies.
pub fn to_decimal_string(amount: Decimal, currency: &str) -> String {
    if is_zero_decimal_currency(currency) {
        format!("{}", amount.round())
    } else {
        format!("{:.2}", amount)
    }
}

pub(crate) fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut res = 0u8;
    for (x, y) in a.as_bytes().iter().zip(b.as_bytes()) {
        res |= x ^ y;
    }
    res == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    use rstest::rstest;

    #[rstest]
    #[case(dec!(149.99), "USD", 14999)]
    #[case(dec!(10), "eur", 1000)]
    #[case(dec!(500), "JPY", 500)]
    #[case(dec!(1200), "krw", 1200)]
    fn minor_units_follow_the_currency_exponent(
        #[case] amount: Decimal,
        #[case] currency: &str,
        #[case] expected: i64,
    ) {
        assert_eq!(to_minor_units(amount, currency).unwrap(), expected);
    }

    #[test]
    fn sub_minor_unit_precision_is_rejected() {
        assert!(to_minor_units(dec!(10.999), "USD").is_err());
        assert!(to_minor_units(dec!(500.5), "JPY").is_err());
    }

    #[test]
    fn decimal_string_formatting() {
        assert_eq!(to_decimal_string(dec!(149.9), "USD"), "149.90");
        assert_eq!(to_decimal_string(dec!(500), "JPY"), "500");
    }

    #[test]
    fn constant_time_eq_behaviour() {
        assert!(constant_time_eq("abc123", "abc123"));
        assert!(!constant_time_eq("abc123", "abc124"));
        assert!(!constant_time_eq("abc", "abc123"));
    }
}
