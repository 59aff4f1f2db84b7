//! Storefront API Library
//!
//! Order placement with transactional stock reservation, payment
//! gateway integration, and payment-state reconciliation.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod auth;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod handlers;
pub mod openapi;
pub mod request_id;
pub mod services;

use std::sync::Arc;

use axum::{extract::State, response::Json, routing::get, Router};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::config::AppConfig;
use crate::db::DbPool;
use crate::events::EventSender;
use crate::services::gateways::{PaymentGateway, PaymentProvider, PaypalGateway, StripeGateway};
use crate::services::orders::OrderService;
use crate::services::reconciliation::ReconciliationService;
use crate::services::stock::log::MovementLog;
use crate::services::transactions::TransactionService;

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DbPool>,
    pub config: Arc<AppConfig>,
    pub event_sender: Arc<EventSender>,
    pub services: AppServices,
}

#[derive(Clone)]
pub struct AppServices {
    pub orders: OrderService,
    pub transactions: TransactionService,
    pub reconciliation: ReconciliationService,
    pub movements: MovementLog,
    pub stripe: Arc<StripeGateway>,
    pub paypal: Arc<PaypalGateway>,
}

impl AppServices {
    /// Picks the gateway implementation for a provider tag.
    pub fn gateway(&self, provider: PaymentProvider) -> Arc<dyn PaymentGateway> {
        match provider {
            PaymentProvider::Stripe => self.stripe.clone(),
            PaymentProvider::Paypal => self.paypal.clone(),
        }
    }
}

impl AppState {
    pub fn new(
        db: Arc<DbPool>,
        config: Arc<AppConfig>,
        event_sender: Arc<EventSender>,
    ) -> Result<Self, errors::ServiceError> {
        let reconciliation =
            ReconciliationService::new(db.clone(), Some(event_sender.clone()));
        let orders = OrderService::new(
            db.clone(),
            Some(event_sender.clone()),
            config.default_currency.clone(),
            rust_decimal::Decimal::try_from(config.order_total_tolerance)
                .unwrap_or(rust_decimal::Decimal::ONE),
            config.idempotency_window_secs,
        );
        let transactions = TransactionService::new(
            db.clone(),
            Some(event_sender.clone()),
            reconciliation.clone(),
        );
        let movements = MovementLog::new(db.clone());
        let stripe = Arc::new(StripeGateway::new(
            config.stripe_api_base.clone(),
            config.stripe_secret_key.clone().unwrap_or_default(),
            config.stripe_webhook_secret.clone(),
            config.payment_webhook_tolerance_secs,
            config.gateway_timeout_secs,
        )?);
        let paypal = Arc::new(PaypalGateway::new(
            config.paypal_api_base.clone(),
            config.paypal_client_id.clone().unwrap_or_default(),
            config.paypal_client_secret.clone().unwrap_or_default(),
            config.paypal_webhook_id.clone(),
            config.gateway_timeout_secs,
        )?);

        Ok(Self {
            db,
            config,
            event_sender,
            services: AppServices {
                orders,
                transactions,
                reconciliation,
                movements,
                stripe,
                paypal,
            },
        })
    }
}

// Common query parameters for list endpoints
#[derive(Debug, Deserialize, ToSchema)]
pub struct ListQuery {
    #[serde(default = "default_page")]
    pub page: u64,
    /// Defaults to the configured api_default_page_size.
    pub limit: Option<u64>,
}

pub(crate) fn default_page() -> u64 {
    1
}

/// Floors the page at 1, fills a missing limit from the configured
/// default, and caps it at the configured maximum.
pub(crate) fn clamp_paging(
    page: u64,
    limit: Option<u64>,
    default_limit: u64,
    max_limit: u64,
) -> (u64, u64) {
    let limit = limit.unwrap_or(default_limit);
    (page.max(1), limit.clamp(1, max_limit))
}

// Common response wrappers
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    pub message: Option<String>,
    pub errors: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<ResponseMeta>,
}

#[derive(Serialize, ToSchema)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::request_id::current_request_id()
                .map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Serialize, ToSchema)]
pub struct PaginatedResponse<T> {
    pub items: Vec<T>,
    pub total: u64,
    pub page: u64,
    pub limit: u64,
    pub total_pages: u64,
}

impl<T> PaginatedResponse<T> {
    pub fn new(items: Vec<T>, total: u64, page: u64, limit: u64) -> Self {
        Self {
            items,
            total,
            page,
            limit,
            total_pages: total.div_ceil(limit.max(1)),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }

    pub fn error(message: String) -> Self {
        Self {
            success: false,
            data: None,
            message: Some(message),
            errors: None,
            meta: Some(ResponseMeta::capture()),
        }
    }
}

/// Standard API result type for JSON responses
pub type ApiResult<T> = Result<Json<ApiResponse<T>>, errors::ServiceError>;

pub fn api_v1_routes() -> Router<AppState> {
    Router::new()
        .merge(handlers::orders::order_routes())
        .merge(handlers::payments::payment_routes())
        .merge(handlers::webhooks::webhook_routes())
        .merge(handlers::transactions::transaction_routes())
        .merge(handlers::inventory::inventory_routes())
}

async fn api_status() -> ApiResult<Value> {
    let status_data = json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "service": "storefront-api",
        "timestamp": Utc::now().to_rfc3339(),
    });
    Ok(Json(ApiResponse::success(status_data)))
}

async fn health_check(State(state): State<AppState>) -> ApiResult<Value> {
    let db_status = match db::check_connection(&state.db).await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };

    let health_data = json!({
        "status": db_status,
        "checks": {
            "database": db_status,
        },
        "timestamp": Utc::now().to_rfc3339(),
    });
    Ok(Json(ApiResponse::success(health_data)))
}

pub fn health_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(api_status))
}

#[cfg(test)]
mod response_tests {
    use super::*;
    use chrono::DateTime;

    #[tokio::test]
    async fn success_response_includes_request_metadata() {
        let response = crate::request_id::scope_request_id(
            crate::request_id::RequestId::new("meta-123"),
            async { ApiResponse::success("ok") },
        )
        .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-123"));
        DateTime::parse_from_rfc3339(&meta.timestamp).expect("timestamp should parse");
    }

    #[tokio::test]
    async fn error_response_includes_request_metadata() {
        let response = crate::request_id::scope_request_id(
            crate::request_id::RequestId::new("meta-err"),
            async { ApiResponse::<()>::error("oops".into()) },
        )
        .await;

        let meta = response.meta.expect("metadata expected");
        assert_eq!(meta.request_id.as_deref(), Some("meta-err"));
        assert!(!meta.timestamp.is_empty());
    }

    #[test]
    fn paging_is_clamped() {
        assert_eq!(clamp_paging(0, Some(0), 20, 100), (1, 1));
        assert_eq!(clamp_paging(3, Some(500), 20, 100), (3, 100));
        assert_eq!(clamp_paging(1, None, 20, 100), (1, 20));
    }

    #[test]
    fn paginated_response_computes_total_pages() {
        let page: PaginatedResponse<u8> = PaginatedResponse::new(vec![], 41, 1, 20);
        assert_eq!(page.total_pages, 3);
    }
}
