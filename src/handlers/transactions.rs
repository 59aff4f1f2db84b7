use std::str::FromStr;

use axum::{
    extract::{Path, Query, State},
    response::Json,
    routing::{get, post},
    Router,
};
use rust_decimal::Decimal;
use serde::Deserialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::entities::transaction::{TransactionStatus, TransactionType};
use crate::errors::ServiceError;
use crate::services::gateways::PaymentProvider;
use crate::services::transactions::{
    RefundRequest, TransactionFilter, TransactionResponse, TransactionSummary,
};
use crate::{ApiResponse, AppState, PaginatedResponse};

#[derive(Debug, Deserialize)]
pub struct TransactionListQuery {
    #[serde(default = "crate::default_page")]
    pub page: u64,
    pub limit: Option<u64>,
    pub order_id: Option<Uuid>,
    pub status: Option<String>,
    pub transaction_type: Option<String>,
    pub payment_method: Option<String>,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RefundBody {
    /// Refund amount; omitted refunds the full remaining amount
    pub amount: Option<Decimal>,
    pub reason: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/transactions",
    summary = "List transactions",
    description = "Paginated ledger listing with optional filters (admin only)",
    params(
        ("page" = Option<u64>, Query, description = "Page number (default: 1)"),
        ("limit" = Option<u64>, Query, description = "Items per page (default: 20)"),
        ("order_id" = Option<Uuid>, Query, description = "Filter by order"),
        ("status" = Option<String>, Query, description = "Filter by status"),
        ("transaction_type" = Option<String>, Query, description = "Filter by type"),
        ("payment_method" = Option<String>, Query, description = "Filter by payment method"),
    ),
    responses(
        (status = 200, description = "Transactions retrieved", body = ApiResponse<PaginatedResponse<TransactionResponse>>),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn list_transactions(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
    Query(query): Query<TransactionListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<TransactionResponse>>>, ServiceError> {
    auth_user.require_admin()?;

    let filter = TransactionFilter {
        order_id: query.order_id,
        status: query
            .status
            .as_deref()
            .map(|raw| {
                TransactionStatus::from_str(&raw.to_ascii_lowercase()).map_err(|_| {
                    ServiceError::InvalidStatus(format!("Unknown transaction status: {}", raw))
                })
            })
            .transpose()?,
        transaction_type: query
            .transaction_type
            .as_deref()
            .map(|raw| {
                TransactionType::from_str(&raw.to_ascii_lowercase()).map_err(|_| {
                    ServiceError::InvalidStatus(format!("Unknown transaction type: {}", raw))
                })
            })
            .transpose()?,
        payment_method: query.payment_method,
    };
    let (page, limit) = crate::clamp_paging(
        query.page,
        query.limit,
        state.config.api_default_page_size,
        state.config.api_max_page_size,
    );
    let (rows, total) = state
        .services
        .transactions
        .list_transactions(filter, page, limit)
        .await?;

    Ok(Json(ApiResponse::success(PaginatedResponse::new(
        rows, total, page, limit,
    ))))
}

#[utoipa::path(
    get,
    path = "/api/v1/transactions/summary",
    summary = "Ledger summary",
    description = "Totals over completed payments and refunds (admin only)",
    responses(
        (status = 200, description = "Summary computed", body = ApiResponse<TransactionSummary>),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn transaction_summary(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
) -> Result<Json<ApiResponse<TransactionSummary>>, ServiceError> {
    auth_user.require_admin()?;
    let summary = state.services.transactions.summary().await?;
    Ok(Json(ApiResponse::success(summary)))
}

#[utoipa::path(
    get,
    path = "/api/v1/transactions/{id}",
    summary = "Get transaction",
    params(("id" = Uuid, Path, description = "Transaction ID")),
    responses(
        (status = 200, description = "Transaction retrieved", body = ApiResponse<TransactionResponse>),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Transaction not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn get_transaction(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<TransactionResponse>>, ServiceError> {
    let row = state.services.transactions.get_transaction(id).await?;
    let order = state.services.orders.get_order_model(row.order_id).await?;
    auth_user.require_self_or_admin(order.user_id)?;
    Ok(Json(ApiResponse::success(row)))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}/transactions",
    summary = "List an order's transactions",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Transactions retrieved", body = ApiResponse<Vec<TransactionResponse>>),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn list_order_transactions(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<TransactionResponse>>>, ServiceError> {
    let order = state.services.orders.get_order_model(id).await?;
    auth_user.require_self_or_admin(order.user_id)?;
    let rows = state.services.transactions.list_for_order(id).await?;
    Ok(Json(ApiResponse::success(rows)))
}

#[utoipa::path(
    post,
    path = "/api/v1/transactions/{id}/refund",
    summary = "Refund a payment",
    description = "Issues a provider refund against a completed payment transaction; the refund can never exceed the remaining refundable amount (admin only)",
    params(("id" = Uuid, Path, description = "Payment transaction ID")),
    request_body = RefundBody,
    responses(
        (status = 200, description = "Refund completed", body = ApiResponse<TransactionResponse>),
        (status = 400, description = "Refund exceeds the available amount", body = crate::errors::ErrorResponse),
        (status = 402, description = "Provider rejected the refund", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Transaction not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn refund_transaction(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(body): Json<RefundBody>,
) -> Result<Json<ApiResponse<TransactionResponse>>, ServiceError> {
    auth_user.require_admin()?;

    let parent = state.services.transactions.get_transaction_model(id).await?;
    let provider = PaymentProvider::from_str(&parent.payment_method).map_err(|_| {
        ServiceError::InvalidOperation(format!(
            "Transaction {} was not settled through a refundable provider",
            id
        ))
    })?;
    let gateway = state.services.gateway(provider);

    let refund = state
        .services
        .transactions
        .process_refund(
            RefundRequest {
                transaction_id: id,
                amount: body.amount,
                reason: body.reason,
            },
            gateway.as_ref(),
        )
        .await?;
    Ok(Json(ApiResponse::success(refund)))
}

#[utoipa::path(
    delete,
    path = "/api/v1/transactions/{id}",
    summary = "Delete a transaction",
    description = "Always refused; the ledger is append-only",
    params(("id" = Uuid, Path, description = "Transaction ID")),
    responses(
        (status = 403, description = "Ledger rows cannot be deleted", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn delete_transaction(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<()>>, ServiceError> {
    auth_user.require_admin()?;
    state.services.transactions.delete_transaction(id)?;
    Ok(Json(ApiResponse::success(())))
}

pub fn transaction_routes() -> Router<AppState> {
    Router::new()
        .route("/transactions", get(list_transactions))
        .route("/transactions/summary", get(transaction_summary))
        .route(
            "/transactions/:id",
            get(get_transaction).delete(delete_transaction),
        )
        .route("/transactions/:id/refund", post(refund_transaction))
        .route("/orders/:id/transactions", get(list_order_transactions))
}
