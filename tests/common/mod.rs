use std::sync::Arc;

use axum::{
    body::{self, Body},
    http::{Method, Request, StatusCode},
    response::Response,
    Router,
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ConnectOptions, ConnectionTrait, Database, Schema, Set};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use storefront_api::{
    auth,
    config::AppConfig,
    entities::{inventory_movement, order, order_item, product, transaction},
    events,
    AppState,
};

/// Test harness running the full router over an in-memory SQLite
/// database. One connection is kept so the in-memory database survives
/// for the lifetime of the harness.
pub struct TestApp {
    pub router: Router,
    pub state: AppState,
    _event_task: tokio::task::JoinHandle<()>,
}

pub fn test_config() -> AppConfig {
    AppConfig {
        database_url: "sqlite::memory:".to_string(),
        jwt_secret: "test_secret_key_for_testing_purposes_only_32chars".to_string(),
        host: "127.0.0.1".to_string(),
        port: 18_080,
        environment: "test".to_string(),
        log_level: "warn".to_string(),
        log_json: false,
        cors_allowed_origins: None,
        db_max_connections: 1,
        db_min_connections: 1,
        db_connect_timeout_secs: 5,
        db_idle_timeout_secs: 300,
        default_currency: "usd".to_string(),
        order_total_tolerance: 1.0,
        idempotency_window_secs: 900,
        stripe_api_base: "http://127.0.0.1:1".to_string(),
        stripe_secret_key: Some("sk_test_dummy".to_string()),
        stripe_webhook_secret: Some("whsec_test_secret".to_string()),
        paypal_api_base: "http://127.0.0.1:1".to_string(),
        paypal_client_id: Some("paypal-client".to_string()),
        paypal_client_secret: Some("paypal-secret".to_string()),
        paypal_webhook_id: None,
        payment_webhook_tolerance_secs: 300,
        gateway_timeout_secs: 2,
        event_channel_capacity: 64,
        api_default_page_size: 20,
        api_max_page_size: 100,
    }
}

impl TestApp {
    pub async fn new() -> Self {
        let cfg = test_config();

        let mut options = ConnectOptions::new(cfg.database_url.clone());
        options.max_connections(1).min_connections(1);
        let pool = Database::connect(options)
            .await
            .expect("failed to open in-memory database");

        let backend = pool.get_database_backend();
        let schema = Schema::new(backend);
        pool.execute(backend.build(&schema.create_table_from_entity(product::Entity)))
            .await
            .expect("create products table");
        pool.execute(backend.build(&schema.create_table_from_entity(order::Entity)))
            .await
            .expect("create orders table");
        pool.execute(backend.build(&schema.create_table_from_entity(order_item::Entity)))
            .await
            .expect("create order_items table");
        pool.execute(backend.build(&schema.create_table_from_entity(transaction::Entity)))
            .await
            .expect("create transactions table");
        pool.execute(backend.build(
            &schema.create_table_from_entity(inventory_movement::Entity),
        ))
        .await
        .expect("create inventory_movements table");

        let (event_sender, event_rx) = events::event_channel(cfg.event_channel_capacity);
        let event_task = tokio::spawn(events::process_events(event_rx));

        let state = AppState::new(Arc::new(pool), Arc::new(cfg), Arc::new(event_sender))
            .expect("failed to build app state");

        let router = Router::new()
            .merge(storefront_api::health_routes())
            .nest("/api/v1", storefront_api::api_v1_routes())
            .with_state(state.clone());

        Self {
            router,
            state,
            _event_task: event_task,
        }
    }

    pub fn token_for(&self, user_id: Uuid, roles: &[&str]) -> String {
        auth::issue_token(&self.state.config.jwt_secret, user_id, roles, 3600)
            .expect("token signing")
    }

    pub async fn request(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Response {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .expect("request"),
            None => builder.body(Body::empty()).expect("request"),
        };
        self.router
            .clone()
            .oneshot(request)
            .await
            .expect("router response")
    }

    /// Seeds a purchasable product and returns its model.
    pub async fn seed_product(&self, name: &str, price: Decimal, quantity: i32) -> product::Model {
        let active = product::ActiveModel {
            id: Set(Uuid::new_v4()),
            name: Set(name.to_string()),
            sku: Set(format!("SKU-{}", Uuid::new_v4().simple())),
            description: Set(None),
            price: Set(price),
            discount_price: Set(None),
            currency: Set("usd".to_string()),
            quantity: Set(quantity),
            low_stock_threshold: Set(5),
            status: Set(product::ProductStatus::Active.to_string()),
            created_at: Set(Utc::now()),
            updated_at: Set(None),
        };
        active
            .insert(&*self.state.db)
            .await
            .expect("seed product")
    }

    pub async fn product_quantity(&self, product_id: Uuid) -> i32 {
        use sea_orm::EntityTrait;
        product::Entity::find_by_id(product_id)
            .one(&*self.state.db)
            .await
            .expect("load product")
            .expect("product exists")
            .quantity
    }
}

pub async fn response_json(response: Response) -> Value {
    let bytes = body::to_bytes(response.into_body(), usize::MAX)
        .await
        .expect("response body bytes");
    serde_json::from_slice(&bytes).expect("json response")
}

pub async fn assert_status_json(response: Response, expected: StatusCode) -> Value {
    let status = response.status();
    let json = response_json(response).await;
    assert_eq!(status, expected, "unexpected status, body: {}", json);
    json
}

/// Order payload for checkout tests; totals follow
/// `items + shipping + tax - discount`.
pub fn order_payload(items: &[(Uuid, i32)], total: &str) -> Value {
    let items: Vec<Value> = items
        .iter()
        .map(|(product_id, quantity)| {
            serde_json::json!({ "product_id": product_id, "quantity": quantity })
        })
        .collect();
    serde_json::json!({
        "items": items,
        "shipping_address": {
            "address": "1 Test Lane",
            "city": "Testville",
            "postal_code": "00100",
            "country": "US"
        },
        "billing_address": {
            "address": "1 Test Lane",
            "city": "Testville",
            "postal_code": "00100",
            "country": "US"
        },
        "shipping_fee": "10.00",
        "tax_amount": "5.00",
        "total_amount": total,
        "payment_method": "card"
    })
}
