use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "0.1.0",
        description = r#"
# Storefront Order & Payments API

Order placement with transactional stock reservation, Stripe/PayPal
payment integration, and payment-state reconciliation.

## Authentication

Endpoints require a JWT bearer token:

```
Authorization: Bearer <your-jwt-token>
```

## Pagination

List endpoints accept `page` and `limit` query parameters
(default: page 1, 20 items per page).
        "#
    ),
    servers(
        (url = "http://localhost:8080", description = "Local development")
    ),
    tags(
        (name = "Orders", description = "Order placement and lifecycle endpoints"),
        (name = "Payments", description = "Payment intent, confirmation, and webhook endpoints"),
        (name = "Transactions", description = "Financial ledger and refund endpoints"),
        (name = "Inventory", description = "Stock movement audit endpoints")
    ),
    paths(
        // Orders
        crate::handlers::orders::create_order,
        crate::handlers::orders::list_orders,
        crate::handlers::orders::list_my_orders,
        crate::handlers::orders::get_order,
        crate::handlers::orders::update_order_status,
        crate::handlers::orders::update_payment_status,
        crate::handlers::orders::set_tracking,

        // Payments
        crate::handlers::payments::create_intent,
        crate::handlers::payments::confirm_stripe,
        crate::handlers::payments::capture_paypal,
        crate::handlers::webhooks::receive_webhook,

        // Transactions
        crate::handlers::transactions::list_transactions,
        crate::handlers::transactions::transaction_summary,
        crate::handlers::transactions::get_transaction,
        crate::handlers::transactions::list_order_transactions,
        crate::handlers::transactions::refund_transaction,
        crate::handlers::transactions::delete_transaction,

        // Inventory
        crate::handlers::inventory::list_movements,
        crate::handlers::inventory::get_movement,
        crate::handlers::inventory::create_adjustment,
        crate::handlers::inventory::product_history,
    ),
    components(
        schemas(
            // Common types
            crate::ApiResponse<serde_json::Value>,
            crate::PaginatedResponse<serde_json::Value>,
            crate::ListQuery,

            // Order types
            crate::services::orders::CreateOrderRequest,
            crate::services::orders::OrderItemRequest,
            crate::services::orders::AddressRequest,
            crate::services::orders::UpdateOrderStatusRequest,
            crate::services::orders::OrderResponse,
            crate::services::orders::OrderItemResponse,
            crate::handlers::orders::CheckoutResponse,
            crate::handlers::orders::UpdatePaymentStatusRequest,
            crate::handlers::orders::UpdateTrackingRequest,

            // Payment types
            crate::services::gateways::PaymentProvider,
            crate::handlers::payments::CreateIntentRequest,
            crate::handlers::payments::IntentResponse,
            crate::handlers::payments::ConfirmStripeRequest,
            crate::handlers::payments::CapturePaypalRequest,
            crate::handlers::payments::PaymentOutcomeResponse,
            crate::handlers::webhooks::WebhookAck,

            // Transaction types
            crate::services::transactions::TransactionResponse,
            crate::services::transactions::TransactionSummary,
            crate::handlers::transactions::RefundBody,

            // Inventory types
            crate::handlers::inventory::MovementResponse,
            crate::handlers::inventory::CreateAdjustmentRequest,
            crate::handlers::inventory::StockLevelResponse,

            // Error types
            crate::errors::ErrorResponse
        )
    )
)]
pub struct ApiDocV1;

pub fn swagger_ui() -> SwaggerUi {
    SwaggerUi::new("/swagger-ui")
        .url("/api-docs/openapi.json", ApiDocV1::openapi())
        .config(utoipa_swagger_ui::Config::from("/api-docs/openapi.json").try_it_out_enabled(true))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn openapi_document_generates() {
        let openapi = ApiDocV1::openapi();
        let json = serde_json::to_string_pretty(&openapi).unwrap();
        assert!(json.contains("Storefront API"));
        assert!(json.contains("/api/v1/orders"));
        assert!(json.contains("/api/v1/payments/{provider}/webhook"));
    }
}
