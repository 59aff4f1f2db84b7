//! Order status lifecycle: legal transitions, rejected jumps, and the
//! stock release on cancellation.

mod common;

use axum::http::{Method, StatusCode};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

use common::{assert_status_json, order_payload, TestApp};

struct Placed {
    order_id: String,
    product_id: Uuid,
    admin_token: String,
}

async fn place_order(app: &TestApp, quantity: i32, total: &str) -> Placed {
    let product = app.seed_product("Desk Lamp", dec!(50.00), 10).await;
    let token = app.token_for(Uuid::new_v4(), &[]);

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(&token),
            Some(order_payload(&[(product.id, quantity)], total)),
        )
        .await;
    let json = assert_status_json(response, StatusCode::CREATED).await;
    Placed {
        order_id: json["data"]["order"]["id"].as_str().unwrap().to_string(),
        product_id: product.id,
        admin_token: app.token_for(Uuid::new_v4(), &["admin"]),
    }
}

async fn set_status(app: &TestApp, placed: &Placed, status: &str) -> StatusCode {
    app.request(
        Method::PUT,
        &format!("/api/v1/orders/{}/status", placed.order_id),
        Some(&placed.admin_token),
        Some(json!({ "status": status })),
    )
    .await
    .status()
}

#[tokio::test]
async fn orders_move_through_the_fulfillment_lifecycle() {
    let app = TestApp::new().await;
    let placed = place_order(&app, 2, "115.00").await;

    assert_eq!(set_status(&app, &placed, "processing").await, StatusCode::OK);
    assert_eq!(set_status(&app, &placed, "shipped").await, StatusCode::OK);
    assert_eq!(set_status(&app, &placed, "delivered").await, StatusCode::OK);

    // Delivered is terminal.
    assert_eq!(
        set_status(&app, &placed, "cancelled").await,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn illegal_jumps_are_rejected() {
    let app = TestApp::new().await;
    let placed = place_order(&app, 1, "65.00").await;

    assert_eq!(
        set_status(&app, &placed, "delivered").await,
        StatusCode::BAD_REQUEST
    );
    assert_eq!(
        set_status(&app, &placed, "warehoused").await,
        StatusCode::BAD_REQUEST
    );
}

#[tokio::test]
async fn cancellation_releases_stock_exactly_once() {
    let app = TestApp::new().await;
    let placed = place_order(&app, 3, "165.00").await;
    assert_eq!(app.product_quantity(placed.product_id).await, 7);

    assert_eq!(set_status(&app, &placed, "cancelled").await, StatusCode::OK);
    assert_eq!(app.product_quantity(placed.product_id).await, 10);

    // Repeating the cancel is a no-op, not a second release.
    assert_eq!(set_status(&app, &placed, "cancelled").await, StatusCode::OK);
    assert_eq!(app.product_quantity(placed.product_id).await, 10);
}

#[tokio::test]
async fn status_updates_require_admin() {
    let app = TestApp::new().await;
    let placed = place_order(&app, 1, "65.00").await;
    let buyer_token = app.token_for(Uuid::new_v4(), &[]);

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/orders/{}/status", placed.order_id),
            Some(&buyer_token),
            Some(json!({ "status": "processing" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn owner_sees_own_order_but_not_others() {
    let app = TestApp::new().await;
    let product = app.seed_product("Desk Lamp", dec!(50.00), 10).await;
    let owner = Uuid::new_v4();
    let owner_token = app.token_for(owner, &[]);

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(&owner_token),
            Some(order_payload(&[(product.id, 1)], "65.00")),
        )
        .await;
    let json = assert_status_json(response, StatusCode::CREATED).await;
    let order_id = json["data"]["order"]["id"].as_str().unwrap().to_string();

    let own = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", order_id),
            Some(&owner_token),
            None,
        )
        .await;
    assert_eq!(own.status(), StatusCode::OK);

    let stranger_token = app.token_for(Uuid::new_v4(), &[]);
    let foreign = app
        .request(
            Method::GET,
            &format!("/api/v1/orders/{}", order_id),
            Some(&stranger_token),
            None,
        )
        .await;
    assert_eq!(foreign.status(), StatusCode::FORBIDDEN);
}
