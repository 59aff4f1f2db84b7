//! Concurrent checkout: several buyers racing for the last unit must
//! produce exactly one successful reservation.

mod common;

use rust_decimal_macros::dec;
use uuid::Uuid;

use common::TestApp;
use storefront_api::errors::ServiceError;
use storefront_api::services::orders::{
    AddressRequest, CreateOrderRequest, OrderItemRequest,
};

fn checkout_request(product_id: Uuid) -> CreateOrderRequest {
    CreateOrderRequest {
        items: vec![OrderItemRequest {
            product_id,
            quantity: 1,
        }],
        shipping_address: AddressRequest {
            address: "1 Test Lane".to_string(),
            city: "Testville".to_string(),
            postal_code: "00100".to_string(),
            country: "US".to_string(),
        },
        billing_address: AddressRequest {
            address: "1 Test Lane".to_string(),
            city: "Testville".to_string(),
            postal_code: "00100".to_string(),
            country: "US".to_string(),
        },
        shipping_fee: dec!(0),
        tax_amount: dec!(0),
        discount_amount: None,
        total_amount: dec!(50.00),
        payment_method: "card".to_string(),
        currency: None,
        notes: None,
    }
}

#[tokio::test]
async fn only_one_buyer_gets_the_last_unit() {
    let app = TestApp::new().await;
    let product = app.seed_product("Limited Print", dec!(50.00), 1).await;

    // Distinct users so the duplicate-submission guard stays out of
    // the picture.
    let attempts = (0..5).map(|_| {
        let orders = app.state.services.orders.clone();
        let product_id = product.id;
        tokio::spawn(async move {
            orders
                .create_order(Uuid::new_v4(), checkout_request(product_id))
                .await
        })
    });

    let mut successes = 0;
    let mut stock_failures = 0;
    for handle in attempts {
        match handle.await.expect("task completes") {
            Ok(outcome) => {
                assert!(!outcome.is_existing);
                successes += 1;
            }
            Err(ServiceError::InsufficientStock { available, .. }) => {
                assert_eq!(available, 0);
                stock_failures += 1;
            }
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    assert_eq!(successes, 1);
    assert_eq!(stock_failures, 4);
    assert_eq!(app.product_quantity(product.id).await, 0);
}

#[tokio::test]
async fn second_unit_sells_after_restock() {
    let app = TestApp::new().await;
    let product = app.seed_product("Limited Print", dec!(50.00), 1).await;
    let orders = &app.state.services.orders;

    orders
        .create_order(Uuid::new_v4(), checkout_request(product.id))
        .await
        .expect("first buyer succeeds");
    let sold_out = orders
        .create_order(Uuid::new_v4(), checkout_request(product.id))
        .await;
    assert_matches::assert_matches!(sold_out, Err(ServiceError::InsufficientStock { .. }));

    // Restock one unit and sell it.
    {
        use sea_orm::TransactionTrait;
        use storefront_api::entities::inventory_movement::MovementReference;
        use storefront_api::services::stock;

        let txn = app.state.db.begin().await.expect("txn");
        stock::adjust(
            &txn,
            product.id,
            1,
            MovementReference::Manual,
            None,
            Uuid::new_v4(),
        )
        .await
        .expect("restock");
        txn.commit().await.expect("commit");
    }

    orders
        .create_order(Uuid::new_v4(), checkout_request(product.id))
        .await
        .expect("restocked unit sells");
    assert_eq!(app.product_quantity(product.id).await, 0);
}
