use axum::{
    extract::{Path, State},
    response::Json,
    routing::post,
    Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::entities::order::PaymentStatus;
use crate::errors::ServiceError;
use crate::services::gateways::{PaymentGateway, PaymentProvider};
use crate::services::reconciliation::{OrderLookup, PaymentEventKind, ReconcileOutcome};
use crate::{ApiResponse, AppState};

#[derive(Debug, Deserialize, ToSchema)]
pub struct CreateIntentRequest {
    pub order_id: Uuid,
    /// Amount the client expects to be charged; must equal the order
    /// total exactly.
    pub amount: Decimal,
    /// Optional cross-check against the order currency.
    pub currency: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct IntentResponse {
    pub provider: PaymentProvider,
    pub reference: String,
    pub client_secret: Option<String>,
    pub approval_url: Option<String>,
    pub status: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ConfirmStripeRequest {
    pub payment_intent_id: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct CapturePaypalRequest {
    /// PayPal order id returned from intent creation
    pub reference: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PaymentOutcomeResponse {
    pub reference: String,
    pub status: String,
    pub applied: bool,
}

#[utoipa::path(
    post,
    path = "/api/v1/payments/{provider}/intent",
    summary = "Create payment intent",
    description = "Creates a provider-side payment intent for a pending order and records the pending ledger row",
    params(("provider" = String, Path, description = "Payment provider (stripe or paypal)")),
    request_body = CreateIntentRequest,
    responses(
        (status = 200, description = "Intent created", body = ApiResponse<IntentResponse>),
        (status = 400, description = "Amount mismatch or order not payable", body = crate::errors::ErrorResponse),
        (status = 402, description = "Provider rejected the intent", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn create_intent(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
    Path(provider): Path<PaymentProvider>,
    Json(request): Json<CreateIntentRequest>,
) -> Result<Json<ApiResponse<IntentResponse>>, ServiceError> {
    let order = state
        .services
        .orders
        .get_order_model(request.order_id)
        .await?;
    auth_user.require_self_or_admin(order.user_id)?;

    if order.payment_status() != PaymentStatus::Pending {
        return Err(ServiceError::InvalidOperation(format!(
            "Order {} is not awaiting payment",
            order.id
        )));
    }
    if request.amount != order.total_amount {
        return Err(ServiceError::InvalidInput(format!(
            "Amount {} does not match the order total {}",
            request.amount, order.total_amount
        )));
    }
    if let Some(currency) = &request.currency {
        if !currency.eq_ignore_ascii_case(&order.currency) {
            return Err(ServiceError::InvalidInput(format!(
                "Currency {} does not match the order currency {}",
                currency, order.currency
            )));
        }
    }

    let gateway = state.services.gateway(provider);
    let intent = gateway
        .create_intent(order.total_amount, &order.currency, order.id, &order.order_number)
        .await?;

    state
        .services
        .orders
        .set_payment_reference(order.id, &intent.reference, &provider.to_string())
        .await?;
    state
        .services
        .transactions
        .record_pending_payment(&order, &intent.reference, &provider.to_string())
        .await?;

    info!(order_id = %order.id, provider = %provider, reference = %intent.reference, "Payment intent created");

    Ok(Json(ApiResponse::success(IntentResponse {
        provider: intent.provider,
        reference: intent.reference,
        client_secret: intent.client_secret,
        approval_url: intent.approval_url,
        status: intent.status,
    })))
}

#[utoipa::path(
    post,
    path = "/api/v1/payments/stripe/confirm",
    summary = "Confirm a Stripe payment",
    description = "Re-reads the intent from Stripe and reconciles the order's payment state from its status",
    request_body = ConfirmStripeRequest,
    responses(
        (status = 200, description = "Intent state reconciled", body = ApiResponse<PaymentOutcomeResponse>),
        (status = 404, description = "No order matches the intent", body = crate::errors::ErrorResponse),
        (status = 502, description = "Stripe unreachable", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn confirm_stripe(
    State(state): State<AppState>,
    _auth_user: AuthenticatedUser,
    Json(request): Json<ConfirmStripeRequest>,
) -> Result<Json<ApiResponse<PaymentOutcomeResponse>>, ServiceError> {
    let intent = state
        .services
        .stripe
        .retrieve_intent(&request.payment_intent_id)
        .await?;

    let kind = match intent.status.as_str() {
        "succeeded" => Some(PaymentEventKind::Succeeded),
        "requires_payment_method" | "canceled" => Some(PaymentEventKind::Failed),
        _ => None,
    };

    let applied = match kind {
        Some(kind) => {
            let outcome = state
                .services
                .reconciliation
                .apply(
                    OrderLookup::ByReference(intent.reference.clone()),
                    kind,
                    Some(intent.raw.clone()),
                    true,
                )
                .await?;
            outcome == ReconcileOutcome::Applied
        }
        None => false,
    };

    Ok(Json(ApiResponse::success(PaymentOutcomeResponse {
        reference: intent.reference,
        status: intent.status,
        applied,
    })))
}

#[utoipa::path(
    post,
    path = "/api/v1/payments/paypal/capture",
    summary = "Capture an approved PayPal order",
    description = "Captures the buyer-approved PayPal order, stores the capture reference for refunds, and reconciles payment state",
    request_body = CapturePaypalRequest,
    responses(
        (status = 200, description = "Capture processed", body = ApiResponse<PaymentOutcomeResponse>),
        (status = 402, description = "PayPal declined the capture", body = crate::errors::ErrorResponse),
        (status = 502, description = "PayPal unreachable", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn capture_paypal(
    State(state): State<AppState>,
    _auth_user: AuthenticatedUser,
    Json(request): Json<CapturePaypalRequest>,
) -> Result<Json<ApiResponse<PaymentOutcomeResponse>>, ServiceError> {
    let capture = state.services.paypal.capture(&request.reference).await?;

    if let Some(capture_id) = &capture.capture_id {
        state
            .services
            .transactions
            .record_capture_reference(&capture.reference, capture_id)
            .await?;
    }

    let kind = if capture.succeeded {
        PaymentEventKind::Succeeded
    } else {
        PaymentEventKind::Failed
    };
    let outcome = state
        .services
        .reconciliation
        .apply(
            OrderLookup::ByReference(capture.reference.clone()),
            kind,
            Some(capture.raw.clone()),
            true,
        )
        .await?;

    Ok(Json(ApiResponse::success(PaymentOutcomeResponse {
        reference: capture.reference,
        status: capture.status,
        applied: outcome == ReconcileOutcome::Applied,
    })))
}

pub fn payment_routes() -> Router<AppState> {
    Router::new()
        .route("/payments/stripe/confirm", post(confirm_stripe))
        .route("/payments/paypal/capture", post(capture_paypal))
        .route("/payments/:provider/intent", post(create_intent))
}
