use axum::{
    extract::{Path, State},
    http::HeaderMap,
    response::Json,
    routing::post,
    Router,
};
use serde::Serialize;
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::errors::ServiceError;
use crate::services::gateways::{GatewayEventKind, PaymentGateway, PaymentProvider};
use crate::services::reconciliation::{OrderLookup, PaymentEventKind, ReconcileOutcome};
use crate::{ApiResponse, AppState};

#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
    /// Whether the event changed local payment state
    pub applied: bool,
}

fn map_event_kind(kind: GatewayEventKind) -> PaymentEventKind {
    match kind {
        GatewayEventKind::Succeeded => PaymentEventKind::Succeeded,
        GatewayEventKind::Failed => PaymentEventKind::Failed,
        GatewayEventKind::Refunded => PaymentEventKind::Refunded,
    }
}

/// Provider webhook receiver. The signature is checked over the raw
/// bytes before the payload is parsed; deliveries for unknown orders or
/// event types are acknowledged without being applied so the provider
/// does not keep retrying them.
#[utoipa::path(
    post,
    path = "/api/v1/payments/{provider}/webhook",
    summary = "Receive a provider webhook",
    params(("provider" = String, Path, description = "Payment provider (stripe or paypal)")),
    request_body(content = String, content_type = "application/json"),
    responses(
        (status = 200, description = "Event acknowledged", body = ApiResponse<WebhookAck>),
        (status = 400, description = "Signature verification failed or payload malformed", body = crate::errors::ErrorResponse),
    )
)]
pub async fn receive_webhook(
    State(state): State<AppState>,
    Path(provider): Path<PaymentProvider>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<ApiResponse<WebhookAck>>, ServiceError> {
    let gateway = state.services.gateway(provider);
    gateway.verify_webhook(body.as_bytes(), &headers).await?;

    let payload: serde_json::Value = serde_json::from_str(&body)
        .map_err(|e| ServiceError::InvalidInput(format!("Malformed webhook payload: {}", e)))?;

    let Some(event) = gateway.parse_webhook_event(&payload) else {
        info!(provider = %provider, "Ignoring unhandled webhook event type");
        return Ok(Json(ApiResponse::success(WebhookAck {
            received: true,
            applied: false,
        })));
    };

    let result = state
        .services
        .reconciliation
        .apply(
            OrderLookup::ByReference(event.reference.clone()),
            map_event_kind(event.kind),
            Some(event.raw),
            true,
        )
        .await;

    let applied = match result {
        Ok(outcome) => outcome == ReconcileOutcome::Applied,
        // Unknown reference: acknowledge so the provider stops retrying
        // a delivery we can never match.
        Err(ServiceError::NotFound(message)) => {
            warn!(provider = %provider, reference = %event.reference, %message,
                "Webhook references an unknown order");
            false
        }
        Err(err) => return Err(err),
    };

    Ok(Json(ApiResponse::success(WebhookAck {
        received: true,
        applied,
    })))
}

pub fn webhook_routes() -> Router<AppState> {
    Router::new().route("/payments/:provider/webhook", post(receive_webhook))
}
