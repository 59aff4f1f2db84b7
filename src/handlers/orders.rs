use std::str::FromStr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::auth::AuthenticatedUser;
use crate::entities::order::{OrderStatus, PaymentStatus};
use crate::errors::ServiceError;
use crate::services::orders::{
    CreateOrderRequest, OrderListFilter, OrderResponse, UpdateOrderStatusRequest,
};
use crate::{ApiResponse, AppState, ListQuery, PaginatedResponse};

/// Checkout result; `is_existing` marks a duplicate submission that was
/// matched to a recent identical order instead of placed again.
#[derive(Debug, Serialize, ToSchema)]
pub struct CheckoutResponse {
    pub order: OrderResponse,
    pub is_existing: bool,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdatePaymentStatusRequest {
    pub payment_status: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct UpdateTrackingRequest {
    pub tracking_number: String,
}

#[derive(Debug, Deserialize)]
pub struct OrderListQuery {
    #[serde(default = "crate::default_page")]
    pub page: u64,
    pub limit: Option<u64>,
    pub status: Option<String>,
    pub payment_status: Option<String>,
    pub user_id: Option<Uuid>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

fn parse_order_status(raw: &str) -> Result<OrderStatus, ServiceError> {
    OrderStatus::from_str(&raw.to_ascii_lowercase())
        .map_err(|_| ServiceError::InvalidStatus(format!("Unknown order status: {}", raw)))
}

fn parse_payment_status(raw: &str) -> Result<PaymentStatus, ServiceError> {
    PaymentStatus::from_str(&raw.to_ascii_lowercase())
        .map_err(|_| ServiceError::InvalidStatus(format!("Unknown payment status: {}", raw)))
}

#[utoipa::path(
    post,
    path = "/api/v1/orders",
    summary = "Place an order",
    description = "Reserves stock and creates an order; an identical recent submission returns the existing order instead",
    request_body = CreateOrderRequest,
    responses(
        (status = 201, description = "Order created", body = ApiResponse<CheckoutResponse>),
        (status = 200, description = "Duplicate submission matched to an existing order", body = ApiResponse<CheckoutResponse>),
        (status = 400, description = "Insufficient stock or inactive product", body = crate::errors::ErrorResponse),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
        (status = 422, description = "Validation error", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn create_order(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
    Json(request): Json<CreateOrderRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    let outcome = state
        .services
        .orders
        .create_order(auth_user.id, request)
        .await?;

    let status = if outcome.is_existing {
        StatusCode::OK
    } else {
        StatusCode::CREATED
    };
    let body = CheckoutResponse {
        order: outcome.order,
        is_existing: outcome.is_existing,
    };
    Ok((status, Json(ApiResponse::success(body))))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders",
    summary = "List orders",
    description = "Paginated order listing with optional filters (admin only)",
    params(
        ("page" = Option<u64>, Query, description = "Page number (default: 1)"),
        ("limit" = Option<u64>, Query, description = "Items per page (default: 20)"),
        ("status" = Option<String>, Query, description = "Filter by order status"),
        ("payment_status" = Option<String>, Query, description = "Filter by payment status"),
        ("user_id" = Option<Uuid>, Query, description = "Filter by user"),
        ("created_after" = Option<String>, Query, description = "Only orders created at or after this RFC 3339 timestamp"),
        ("created_before" = Option<String>, Query, description = "Only orders created at or before this RFC 3339 timestamp"),
    ),
    responses(
        (status = 200, description = "Orders retrieved", body = ApiResponse<PaginatedResponse<OrderResponse>>),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn list_orders(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
    Query(query): Query<OrderListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<OrderResponse>>>, ServiceError> {
    auth_user.require_admin()?;

    let filter = OrderListFilter {
        user_id: query.user_id,
        status: query.status.as_deref().map(parse_order_status).transpose()?,
        payment_status: query
            .payment_status
            .as_deref()
            .map(parse_payment_status)
            .transpose()?,
        created_after: query.created_after,
        created_before: query.created_before,
    };
    let (page, limit) = crate::clamp_paging(
        query.page,
        query.limit,
        state.config.api_default_page_size,
        state.config.api_max_page_size,
    );
    let (orders, total) = state.services.orders.list_orders(filter, page, limit).await?;

    Ok(Json(ApiResponse::success(PaginatedResponse::new(
        orders, total, page, limit,
    ))))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/me",
    summary = "List my orders",
    params(
        ("page" = Option<u64>, Query, description = "Page number (default: 1)"),
        ("limit" = Option<u64>, Query, description = "Items per page (default: 20)"),
    ),
    responses(
        (status = 200, description = "Orders retrieved", body = ApiResponse<PaginatedResponse<OrderResponse>>),
        (status = 401, description = "Unauthorized", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn list_my_orders(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
    Query(query): Query<ListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<OrderResponse>>>, ServiceError> {
    let filter = OrderListFilter {
        user_id: Some(auth_user.id),
        ..Default::default()
    };
    let (page, limit) = crate::clamp_paging(
        query.page,
        query.limit,
        state.config.api_default_page_size,
        state.config.api_max_page_size,
    );
    let (orders, total) = state.services.orders.list_orders(filter, page, limit).await?;

    Ok(Json(ApiResponse::success(PaginatedResponse::new(
        orders, total, page, limit,
    ))))
}

#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    summary = "Get order",
    params(("id" = Uuid, Path, description = "Order ID")),
    responses(
        (status = 200, description = "Order retrieved", body = ApiResponse<OrderResponse>),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn get_order(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    let order = state.services.orders.get_order(id).await?;
    auth_user.require_self_or_admin(order.user_id)?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}/status",
    summary = "Update order status",
    description = "Moves the order along the fulfillment lifecycle; cancelling releases reserved stock (admin only)",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = UpdateOrderStatusRequest,
    responses(
        (status = 200, description = "Status updated", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Invalid transition", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn update_order_status(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateOrderStatusRequest>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    auth_user.require_admin()?;
    let new_status = parse_order_status(&request.status)?;
    let order = state
        .services
        .orders
        .update_order_status(id, new_status)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}/payment-status",
    summary = "Override payment status",
    description = "Manual payment-state override driving the same reconciliation machine as provider webhooks (admin only)",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = UpdatePaymentStatusRequest,
    responses(
        (status = 200, description = "Payment status reconciled", body = ApiResponse<OrderResponse>),
        (status = 400, description = "Invalid target status", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn update_payment_status(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdatePaymentStatusRequest>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    auth_user.require_admin()?;
    let target = parse_payment_status(&request.payment_status)?;
    state
        .services
        .reconciliation
        .apply_admin_override(id, target)
        .await?;
    let order = state.services.orders.get_order(id).await?;
    Ok(Json(ApiResponse::success(order)))
}

#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}/tracking",
    summary = "Set tracking number",
    params(("id" = Uuid, Path, description = "Order ID")),
    request_body = UpdateTrackingRequest,
    responses(
        (status = 200, description = "Tracking number set", body = ApiResponse<OrderResponse>),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn set_tracking(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
    Path(id): Path<Uuid>,
    Json(request): Json<UpdateTrackingRequest>,
) -> Result<Json<ApiResponse<OrderResponse>>, ServiceError> {
    auth_user.require_admin()?;
    let order = state
        .services
        .orders
        .set_tracking_number(id, request.tracking_number)
        .await?;
    Ok(Json(ApiResponse::success(order)))
}

pub fn order_routes() -> Router<AppState> {
    Router::new()
        .route("/orders", post(create_order).get(list_orders))
        .route("/orders/me", get(list_my_orders))
        .route("/orders/:id", get(get_order))
        .route("/orders/:id/status", put(update_order_status))
        .route("/orders/:id/payment-status", put(update_payment_status))
        .route("/orders/:id/tracking", put(set_tracking))
}
