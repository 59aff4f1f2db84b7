//! Refund ledger rules: the refundable amount caps at the parent
//! payment, partials accumulate, and ledger rows are never deleted.

mod common;

use axum::http::{Method, StatusCode};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

use common::{assert_status_json, order_payload, TestApp};
use storefront_api::entities::order;
use storefront_api::errors::ServiceError;
use storefront_api::services::gateways::{
    CaptureResult, GatewayEvent, PaymentGateway, PaymentIntent, PaymentProvider, RefundResult,
};
use storefront_api::services::reconciliation::{OrderLookup, PaymentEventKind};
use storefront_api::services::transactions::RefundRequest;

mockall::mock! {
    pub Gateway {}

    #[async_trait::async_trait]
    impl PaymentGateway for Gateway {
        fn provider(&self) -> PaymentProvider;
        async fn create_intent(
            &self,
            amount: Decimal,
            currency: &str,
            order_id: Uuid,
            order_number: &str,
        ) -> Result<PaymentIntent, ServiceError>;
        async fn retrieve_intent(&self, reference: &str) -> Result<PaymentIntent, ServiceError>;
        async fn capture(&self, reference: &str) -> Result<CaptureResult, ServiceError>;
        async fn verify_webhook(
            &self,
            payload: &[u8],
            headers: &axum::http::HeaderMap,
        ) -> Result<(), ServiceError>;
        fn parse_webhook_event(&self, payload: &serde_json::Value) -> Option<GatewayEvent>;
        async fn refund(
            &self,
            capture_reference: &str,
            amount: Option<Decimal>,
            currency: &str,
        ) -> Result<RefundResult, ServiceError>;
    }
}

fn approving_gateway() -> MockGateway {
    let mut gateway = MockGateway::new();
    gateway.expect_refund().returning(|_, _, _| {
        Ok(RefundResult {
            refund_id: format!("re_{}", Uuid::new_v4().simple()),
            succeeded: true,
            status: "succeeded".to_string(),
            raw: json!({}),
        })
    });
    gateway
}

/// Places an order, stamps a payment reference, and settles it so a
/// completed payment row exists. Returns (order_id, payment_row_id).
async fn settled_payment(app: &TestApp, reference: &str) -> (Uuid, Uuid) {
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
        .expect("payment reference");
    app.state
        .services
        .transactions
        .record_pending_payment(&model, reference, "stripe")
        .await
        .expect("pending payment row");
    app.state
        .services
        .reconciliation
        .apply(
            OrderLookup::ById(order_id),
            PaymentEventKind::Succeeded,
            None,
            false,
        )
        .await
        .expect("settle payment");

    let rows = app
        .state
        .services
        .transactions
        .list_for_order(order_id)
        .await
        .expect("ledger rows");
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].status, "completed");
    (order_id, rows[0].id)
}

async fn payment_status(app: &TestApp, order_id: Uuid) -> String {
    use sea_orm::EntityTrait;
    order::Entity::find_by_id(order_id)
        .one(&*app.state.db)
        .await
        .expect("load order")
        .expect("order exists")
        .payment_status
}

#[tokio::test]
async fn partial_refunds_accumulate_until_the_payment_is_drawn_down() {
    let app = TestApp::new().await;
    let (order_id, payment_id) = settled_payment(&app, "pi_partial").await;
    let gateway = approving_gateway();
    let transactions = &app.state.services.transactions;

    let first = transactions
        .process_refund(
            RefundRequest {
                transaction_id: payment_id,
                amount: Some(dec!(30.00)),
                reason: Some("damaged item".to_string()),
            },
            &gateway,
        )
        .await
        .expect("partial refund");
    assert_eq!(first.transaction_type, "partial_refund");
    assert_eq!(first.status, "completed");
    assert_eq!(first.amount, dec!(30.00));

    let parent = transactions
        .get_transaction(payment_id)
        .await
        .expect("parent");
    assert_eq!(parent.status, "partially_refunded");
    // A partial draw-down leaves the order paid.
    assert_eq!(payment_status(&app, order_id).await, "paid");

    // Omitting the amount refunds the remaining 85.00.
    let second = transactions
        .process_refund(
            RefundRequest {
                transaction_id: payment_id,
                amount: None,
                reason: None,
            },
            &gateway,
        )
        .await
        .expect("closing refund");
    assert_eq!(second.amount, dec!(85.00));

    let parent = transactions
        .get_transaction(payment_id)
        .await
        .expect("parent");
    assert_eq!(parent.status, "refunded");
    assert_eq!(payment_status(&app, order_id).await, "refunded");
}

#[tokio::test]
async fn refunds_cannot_exceed_the_remaining_amount() {
    let app = TestApp::new().await;
    let (_, payment_id) = settled_payment(&app, "pi_capped").await;
    let gateway = approving_gateway();
    let transactions = &app.state.services.transactions;

    transactions
        .process_refund(
            RefundRequest {
                transaction_id: payment_id,
                amount: Some(dec!(30.00)),
                reason: None,
            },
            &gateway,
        )
        .await
        .expect("partial refund");

    let err = transactions
        .process_refund(
            RefundRequest {
                transaction_id: payment_id,
                amount: Some(dec!(100.00)),
                reason: None,
            },
            &gateway,
        )
        .await
        .expect_err("over-refund must fail");

    match err {
        ServiceError::RefundExceedsAvailable { available } => {
            assert_eq!(available, dec!(85.00));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn concurrent_refunds_cannot_overdraw_the_parent() {
    let app = TestApp::new().await;
    let (order_id, payment_id) = settled_payment(&app, "pi_raced").await;
    let gateway = std::sync::Arc::new(approving_gateway());

    // Both refunds individually fit inside the 115.00 payment; together
    // they would overdraw it.
    let mut handles = Vec::new();
    for _ in 0..2 {
        let transactions = app.state.services.transactions.clone();
        let gateway = gateway.clone();
        handles.push(tokio::spawn(async move {
            transactions
                .process_refund(
                    RefundRequest {
                        transaction_id: payment_id,
                        amount: Some(dec!(100.00)),
                        reason: None,
                    },
                    gateway.as_ref(),
                )
                .await
        }));
    }

    let mut successes = 0;
    for handle in handles {
        if handle.await.expect("refund task").is_ok() {
            successes += 1;
        }
    }
    assert_eq!(successes, 1);

    let rows = app
        .state
        .services
        .transactions
        .list_for_order(order_id)
        .await
        .expect("ledger rows");
    let refunded: Decimal = rows
        .iter()
        .filter(|r| r.id != payment_id && r.status == "completed")
        .map(|r| r.amount)
        .sum();
    assert!(refunded <= dec!(115.00), "refunded {refunded} exceeds the payment");
}

#[tokio::test]
async fn provider_rejection_leaves_a_failed_ledger_row() {
    let app = TestApp::new().await;
    let (_, payment_id) = settled_payment(&app, "pi_rejected").await;
    let mut gateway = MockGateway::new();
    gateway
        .expect_refund()
        .returning(|_, _, _| Err(ServiceError::PaymentFailed("declined".to_string())));

    let result = app
        .state
        .services
        .transactions
        .process_refund(
            RefundRequest {
                transaction_id: payment_id,
                amount: Some(dec!(10.00)),
                reason: None,
            },
            &gateway,
        )
        .await;
    assert_matches::assert_matches!(result, Err(ServiceError::PaymentFailed(_)));

    let rows = app
        .state
        .services
        .transactions
        .list_for_order(
            app.state
                .services
                .transactions
                .get_transaction(payment_id)
                .await
                .expect("parent")
                .order_id,
        )
        .await
        .expect("ledger rows");
    let failed: Vec<_> = rows.iter().filter(|r| r.status == "failed").collect();
    assert_eq!(failed.len(), 1);
    // The parent payment is untouched and still refundable.
    assert_eq!(
        rows.iter()
            .find(|r| r.id == payment_id)
            .expect("parent row")
            .status,
        "completed"
    );
}

#[tokio::test]
async fn ledger_rows_can_never_be_deleted() {
    let app = TestApp::new().await;
    let (_, payment_id) = settled_payment(&app, "pi_immutable").await;
    let admin_token = app.token_for(Uuid::new_v4(), &["admin"]);

    let response = app
        .request(
            Method::DELETE,
            &format!("/api/v1/transactions/{}", payment_id),
            Some(&admin_token),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    // The row is still there.
    let row = app
        .state
        .services
        .transactions
        .get_transaction(payment_id)
        .await
        .expect("row survives");
    assert_eq!(row.status, "completed");
}
