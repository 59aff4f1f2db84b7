use std::str::FromStr;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use sea_orm::TransactionTrait;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

use crate::auth::AuthenticatedUser;
use crate::entities::inventory_movement::{self, MovementReference};
use crate::errors::ServiceError;
use crate::services::stock::{self, log::MovementFilter};
use crate::{ApiResponse, AppState, PaginatedResponse};

#[derive(Debug, Serialize, ToSchema)]
pub struct MovementResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub quantity: i32,
    pub reference_type: String,
    pub reference_id: Option<Uuid>,
    pub notes: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

impl From<inventory_movement::Model> for MovementResponse {
    fn from(model: inventory_movement::Model) -> Self {
        Self {
            id: model.id,
            product_id: model.product_id,
            quantity: model.quantity,
            reference_type: model.reference_type,
            reference_id: model.reference_id,
            notes: model.notes,
            created_by: model.created_by,
            created_at: model.created_at,
        }
    }
}

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CreateAdjustmentRequest {
    pub product_id: Uuid,
    /// Signed stock delta; negative removes stock, never below zero
    pub quantity: i32,
    #[validate(length(max = 500))]
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct StockLevelResponse {
    pub product_id: Uuid,
    pub remaining: i32,
    pub low_stock: bool,
}

#[derive(Debug, Deserialize)]
pub struct MovementListQuery {
    #[serde(default = "crate::default_page")]
    pub page: u64,
    pub limit: Option<u64>,
    pub product_id: Option<Uuid>,
    pub reference_type: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/v1/inventory/movements",
    summary = "List inventory movements",
    description = "Paginated stock movement log (admin only)",
    params(
        ("page" = Option<u64>, Query, description = "Page number (default: 1)"),
        ("limit" = Option<u64>, Query, description = "Items per page (default: 20)"),
        ("product_id" = Option<Uuid>, Query, description = "Filter by product"),
        ("reference_type" = Option<String>, Query, description = "Filter by movement reference type"),
    ),
    responses(
        (status = 200, description = "Movements retrieved", body = ApiResponse<PaginatedResponse<MovementResponse>>),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn list_movements(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
    Query(query): Query<MovementListQuery>,
) -> Result<Json<ApiResponse<PaginatedResponse<MovementResponse>>>, ServiceError> {
    auth_user.require_admin()?;

    let filter = MovementFilter {
        product_id: query.product_id,
        reference_type: query
            .reference_type
            .as_deref()
            .map(|raw| {
                MovementReference::from_str(&raw.to_ascii_lowercase()).map_err(|_| {
                    ServiceError::InvalidInput(format!("Unknown movement reference type: {}", raw))
                })
            })
            .transpose()?,
    };
    let (page, limit) = crate::clamp_paging(
        query.page,
        query.limit,
        state.config.api_default_page_size,
        state.config.api_max_page_size,
    );
    let (movements, total) = state.services.movements.list(filter, page, limit).await?;

    Ok(Json(ApiResponse::success(PaginatedResponse::new(
        movements.into_iter().map(MovementResponse::from).collect(),
        total,
        page,
        limit,
    ))))
}

#[utoipa::path(
    get,
    path = "/api/v1/inventory/movements/{id}",
    summary = "Get inventory movement",
    params(("id" = Uuid, Path, description = "Movement ID")),
    responses(
        (status = 200, description = "Movement retrieved", body = ApiResponse<MovementResponse>),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Movement not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn get_movement(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<MovementResponse>>, ServiceError> {
    auth_user.require_admin()?;
    let movement = state.services.movements.get(id).await?;
    Ok(Json(ApiResponse::success(movement.into())))
}

#[utoipa::path(
    post,
    path = "/api/v1/inventory/movements",
    summary = "Record a manual stock adjustment",
    description = "Applies a signed delta to a product's stock and writes the movement row (admin only)",
    request_body = CreateAdjustmentRequest,
    responses(
        (status = 201, description = "Adjustment recorded", body = ApiResponse<StockLevelResponse>),
        (status = 400, description = "Adjustment would drive stock below zero", body = crate::errors::ErrorResponse),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
        (status = 404, description = "Product not found", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn create_adjustment(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
    Json(request): Json<CreateAdjustmentRequest>,
) -> Result<impl IntoResponse, ServiceError> {
    auth_user.require_admin()?;
    request
        .validate()
        .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

    let txn = state.db.begin().await.map_err(ServiceError::DatabaseError)?;
    let level = stock::adjust(
        &txn,
        request.product_id,
        request.quantity,
        MovementReference::Adjustment,
        request.notes,
        auth_user.id,
    )
    .await?;
    txn.commit().await.map_err(ServiceError::DatabaseError)?;

    let body = StockLevelResponse {
        product_id: level.product_id,
        remaining: level.remaining,
        low_stock: level.low_stock,
    };
    Ok((StatusCode::CREATED, Json(ApiResponse::success(body))))
}

#[utoipa::path(
    get,
    path = "/api/v1/inventory/products/{id}/history",
    summary = "Product movement history",
    description = "Full movement history for one product, oldest first (admin only)",
    params(("id" = Uuid, Path, description = "Product ID")),
    responses(
        (status = 200, description = "History retrieved", body = ApiResponse<Vec<MovementResponse>>),
        (status = 403, description = "Forbidden", body = crate::errors::ErrorResponse),
    ),
    security(("Bearer" = []))
)]
pub async fn product_history(
    State(state): State<AppState>,
    auth_user: AuthenticatedUser,
    Path(id): Path<Uuid>,
) -> Result<Json<ApiResponse<Vec<MovementResponse>>>, ServiceError> {
    auth_user.require_admin()?;
    let movements = state.services.movements.product_history(id).await?;
    Ok(Json(ApiResponse::success(
        movements.into_iter().map(MovementResponse::from).collect(),
    )))
}

pub fn inventory_routes() -> Router<AppState> {
    Router::new()
        .route(
            "/inventory/movements",
            get(list_movements).post(create_adjustment),
        )
        .route("/inventory/movements/:id", get(get_movement))
        .route("/inventory/products/:id/history", get(product_history))
}
