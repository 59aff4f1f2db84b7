//! Payment webhook flow: signature verification, reconciliation, and
//! duplicate-delivery idempotency.

mod common;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
};
use hmac::{Hmac, Mac};
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use serde_json::json;
use sha2::Sha256;
use tower::ServiceExt;
use uuid::Uuid;

use common::{assert_status_json, order_payload, response_json, TestApp};
use storefront_api::entities::{order, transaction};

const WEBHOOK_SECRET: &str = "whsec_test_secret";

fn stripe_signature(payload: &str) -> String {
    let ts = chrono::Utc::now().timestamp();
    let mut mac =
        Hmac::<Sha256>::new_from_slice(WEBHOOK_SECRET.as_bytes()).expect("hmac key");
    mac.update(ts.to_string().as_bytes());
    mac.update(b".");
    mac.update(payload.as_bytes());
    format!("t={},v1={}", ts, hex::encode(mac.finalize().into_bytes()))
}

async fn deliver_webhook(app: &TestApp, payload: &str, signature: Option<&str>) -> (StatusCode, serde_json::Value) {
    let mut builder = Request::builder()
        .method(Method::POST)
        .uri("/api/v1/payments/stripe/webhook")
        .header("content-type", "application/json");
    if let Some(signature) = signature {
        builder = builder.header("Stripe-Signature", signature);
    }
    let response = app
        .router
        .clone()
        .oneshot(builder.body(Body::from(payload.to_string())).expect("request"))
        .await
        .expect("router response");
    let status = response.status();
    (status, response_json(response).await)
}

/// Places an order and wires it to a fake Stripe intent the way the
/// intent endpoint would.
async fn placed_order_with_intent(app: &TestApp, reference: &str) -> Uuid {
    let product = app.seed_product("Desk Lamp", dec!(50.00), 10).await;
    let token = app.token_for(Uuid::new_v4(), &[]);
    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(&token),
            Some(order_payload(&[(product.id, 2)], "115.00")),
        )
        .await;
    let json = assert_status_json(response, StatusCode::CREATED).await;
    let order_id: Uuid = json["data"]["order"]["id"]
        .as_str()
        .unwrap()
        .parse()
        .unwrap();

    let model = app
        .state
        .services
        .orders
        .set_payment_reference(order_id, reference, "stripe")
        .await
        .expect("stamp payment reference");
    app.state
        .services
        .transactions
        .record_pending_payment(&model, reference, "stripe")
        .await
        .expect("pending ledger row");
    order_id
}

async fn order_state(app: &TestApp, order_id: Uuid) -> (String, String) {
    let model = order::Entity::find_by_id(order_id)
        .one(&*app.state.db)
        .await
        .expect("load order")
        .expect("order exists");
    (model.status, model.payment_status)
}

#[tokio::test]
async fn unsigned_webhook_is_rejected() {
    let app = TestApp::new().await;
    let payload = json!({"type": "payment_intent.succeeded"}).to_string();

    let (status, _) = deliver_webhook(&app, &payload, None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = deliver_webhook(&app, &payload, Some("t=1,v1=deadbeef")).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn succeeded_webhook_marks_order_paid_and_settles_ledger() {
    let app = TestApp::new().await;
    let order_id = placed_order_with_intent(&app, "pi_success_1").await;

    let payload = json!({
        "type": "payment_intent.succeeded",
        "data": { "object": { "id": "pi_success_1" } }
    })
    .to_string();
    let (status, body) = deliver_webhook(&app, &payload, Some(&stripe_signature(&payload))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["applied"], true);

    let (order_status, payment_status) = order_state(&app, order_id).await;
    assert_eq!(payment_status, "paid");
    assert_eq!(order_status, "processing");

    let completed = transaction::Entity::find()
        .filter(transaction::Column::OrderId.eq(order_id))
        .filter(transaction::Column::Status.eq("completed"))
        .all(&*app.state.db)
        .await
        .expect("load transactions");
    assert_eq!(completed.len(), 1);
    assert_eq!(completed[0].transaction_type, "payment");
}

#[tokio::test]
async fn duplicate_webhook_delivery_is_a_no_op() {
    let app = TestApp::new().await;
    let order_id = placed_order_with_intent(&app, "pi_duplicate").await;

    let payload = json!({
        "type": "payment_intent.succeeded",
        "data": { "object": { "id": "pi_duplicate" } }
    })
    .to_string();

    let (_, first) = deliver_webhook(&app, &payload, Some(&stripe_signature(&payload))).await;
    assert_eq!(first["data"]["applied"], true);

    let (status, second) = deliver_webhook(&app, &payload, Some(&stripe_signature(&payload))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(second["data"]["applied"], false);

    let completed = transaction::Entity::find()
        .filter(transaction::Column::OrderId.eq(order_id))
        .filter(transaction::Column::Status.eq("completed"))
        .all(&*app.state.db)
        .await
        .expect("load transactions");
    assert_eq!(completed.len(), 1);
}

#[tokio::test]
async fn failure_webhook_never_downgrades_a_paid_order() {
    let app = TestApp::new().await;
    let order_id = placed_order_with_intent(&app, "pi_paid_then_failed").await;

    let success = json!({
        "type": "payment_intent.succeeded",
        "data": { "object": { "id": "pi_paid_then_failed" } }
    })
    .to_string();
    deliver_webhook(&app, &success, Some(&stripe_signature(&success))).await;

    let failure = json!({
        "type": "payment_intent.payment_failed",
        "data": { "object": { "id": "pi_paid_then_failed" } }
    })
    .to_string();
    let (status, body) = deliver_webhook(&app, &failure, Some(&stripe_signature(&failure))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["applied"], false);
    let (_, payment_status) = order_state(&app, order_id).await;
    assert_eq!(payment_status, "paid");
}

#[tokio::test]
async fn webhook_for_unknown_reference_is_acknowledged() {
    let app = TestApp::new().await;

    let payload = json!({
        "type": "payment_intent.succeeded",
        "data": { "object": { "id": "pi_never_seen" } }
    })
    .to_string();
    let (status, body) = deliver_webhook(&app, &payload, Some(&stripe_signature(&payload))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["received"], true);
    assert_eq!(body["data"]["applied"], false);
}

#[tokio::test]
async fn intent_amount_must_match_the_order_total() {
    let app = TestApp::new().await;
    let product = app.seed_product("Desk Lamp", dec!(50.00), 10).await;
    let user = Uuid::new_v4();
    let token = app.token_for(user, &[]);

    let response = app
        .request(
            Method::POST,
            "/api/v1/orders",
            Some(&token),
            Some(order_payload(&[(product.id, 1)], "65.00")),
        )
        .await;
    let json = assert_status_json(response, StatusCode::CREATED).await;
    let order_id = json["data"]["order"]["id"].as_str().unwrap();

    let response = app
        .request(
            Method::POST,
            "/api/v1/payments/stripe/intent",
            Some(&token),
            Some(json!({ "order_id": order_id, "amount": "64.00" })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn admin_override_drives_the_same_reconciliation() {
    let app = TestApp::new().await;
    let order_id = placed_order_with_intent(&app, "pi_manual").await;
    let admin_token = app.token_for(Uuid::new_v4(), &["admin"]);

    let response = app
        .request(
            Method::PUT,
            &format!("/api/v1/orders/{}/payment-status", order_id),
            Some(&admin_token),
            Some(json!({ "payment_status": "paid" })),
        )
        .await;
    let json = assert_status_json(response, StatusCode::OK).await;
    assert_eq!(json["data"]["payment_status"], "paid");
    assert_eq!(json["data"]["status"], "processing");
}
