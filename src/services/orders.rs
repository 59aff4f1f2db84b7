use crate::{
    db::DbPool,
    entities::inventory_movement::MovementReference,
    entities::order::{self, ActiveModel as OrderActiveModel, OrderStatus, PaymentStatus},
    entities::order_item,
    entities::product,
    errors::ServiceError,
    events::{Event, EventSender},
    services::stock::{self, StockLevel},
};
use chrono::{DateTime, Duration, Utc};
use rand::distributions::Alphanumeric;
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct AddressRequest {
    #[validate(length(min = 1, max = 255))]
    pub address: String,
    #[validate(length(min = 1, max = 100))]
    pub city: String,
    #[validate(length(min = 1, max = 20))]
    pub postal_code: String,
    #[validate(length(min = 2, max = 100))]
    pub country: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Validate, ToSchema)]
pub struct OrderItemRequest {
    pub product_id: Uuid,
    #[validate(range(min = 1, message = "Quantity must be at least 1"))]
    pub quantity: i32,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, message = "Order must contain at least one item"))]
    pub items: Vec<OrderItemRequest>,

    #[validate]
    pub shipping_address: AddressRequest,
    #[validate]
    pub billing_address: AddressRequest,

    pub shipping_fee: Decimal,
    pub tax_amount: Decimal,
    #[serde(default)]
    pub discount_amount: Option<Decimal>,

    /// Client-computed grand total, checked against the server's figure
    pub total_amount: Decimal,

    #[validate(length(min = 1, max = 50))]
    pub payment_method: String,
    #[serde(default)]
    pub currency: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct UpdateOrderStatusRequest {
    pub status: String,
    pub notes: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderItemResponse {
    pub id: Uuid,
    pub product_id: Uuid,
    pub product_name: String,
    pub quantity: i32,
    pub price: Decimal,
    pub total: Decimal,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct OrderResponse {
    pub id: Uuid,
    pub order_number: String,
    pub user_id: Uuid,
    pub status: String,
    pub payment_status: String,
    pub total_amount: Decimal,
    pub shipping_fee: Decimal,
    pub tax_amount: Decimal,
    pub discount_amount: Decimal,
    pub currency: String,
    pub payment_method: String,
    pub payment_id: Option<String>,
    pub shipping_address: String,
    pub shipping_city: String,
    pub shipping_postal_code: String,
    pub shipping_country: String,
    pub tracking_number: Option<String>,
    pub notes: Option<String>,
    pub items: Vec<OrderItemResponse>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// The checkout result distinguishes a freshly placed order from a
/// duplicate submission matched by the idempotency guard.
#[derive(Debug)]
pub struct CheckoutOutcome {
    pub order: OrderResponse,
    pub is_existing: bool,
}

#[derive(Debug, Default, Clone)]
pub struct OrderListFilter {
    pub user_id: Option<Uuid>,
    pub status: Option<OrderStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
}

/// Service for placing and managing orders
#[derive(Clone)]
pub struct OrderService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
    default_currency: String,
    /// Tolerance before a client-declared total is flagged as divergent
    total_tolerance: Decimal,
    /// Window in which matching pending orders are treated as duplicates
    idempotency_window: Duration,
}

impl OrderService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
        default_currency: String,
        total_tolerance: Decimal,
        idempotency_window_secs: u64,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            default_currency,
            total_tolerance,
            idempotency_window: Duration::seconds(idempotency_window_secs as i64),
        }
    }

    /// Places an order for the given user: reserves stock, snapshots
    /// prices and addresses, and writes the order atomically. A matching
    /// recent pending order short-circuits to the existing row.
    #[instrument(skip(self, request), fields(user_id = %user_id))]
    pub async fn create_order(
        &self,
        user_id: Uuid,
        request: CreateOrderRequest,
    ) -> Result<CheckoutOutcome, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        if request.shipping_fee < Decimal::ZERO
            || request.tax_amount < Decimal::ZERO
            || request.discount_amount.unwrap_or(Decimal::ZERO) < Decimal::ZERO
        {
            return Err(ServiceError::ValidationError(
                "Monetary fields cannot be negative".to_string(),
            ));
        }
        if request.items.iter().any(|i| i.quantity < 1) {
            return Err(ServiceError::ValidationError(
                "Item quantity must be at least 1".to_string(),
            ));
        }

        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(|e| {
            error!(error = %e, "Failed to start transaction for order creation");
            ServiceError::DatabaseError(e)
        })?;

        if let Some(existing) = self.find_duplicate_order(&txn, user_id, &request).await? {
            let refreshed = touch_duplicate(&txn, &existing, &request.payment_method).await?;
            let items = load_items(&txn, refreshed.id).await?;
            txn.commit().await.map_err(ServiceError::DatabaseError)?;

            info!(order_id = %refreshed.id, "Duplicate checkout matched existing pending order");
            return Ok(CheckoutOutcome {
                order: model_to_response(refreshed, items),
                is_existing: true,
            });
        }

        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let mut item_models = Vec::with_capacity(request.items.len());
        let mut stock_levels: Vec<StockLevel> = Vec::new();
        let mut items_total = Decimal::ZERO;

        for item in &request.items {
            let product = product::Entity::find_by_id(item.product_id)
                .one(&txn)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Product {} not found", item.product_id))
                })?;

            // Out-of-stock products fall through to the reservation,
            // which reports the shortfall precisely.
            if product.status() == product::ProductStatus::Inactive {
                return Err(ServiceError::InvalidOperation(format!(
                    "Product '{}' is not available for purchase",
                    product.name
                )));
            }

            let level = stock::reserve(&txn, product.id, item.quantity, order_id).await?;
            stock_levels.push(level);

            let unit_price = product.current_price();
            let line_total = unit_price * Decimal::from(item.quantity);
            items_total += line_total;

            item_models.push(order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(product.id),
                product_name: Set(product.name),
                quantity: Set(item.quantity),
                price: Set(unit_price),
                total: Set(line_total),
                created_at: Set(now),
            });
        }

        let discount = request.discount_amount.unwrap_or(Decimal::ZERO);
        let computed_total = items_total + request.shipping_fee + request.tax_amount - discount;
        if computed_total < Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Discount exceeds the order total".to_string(),
            ));
        }
        let divergence = (computed_total - request.total_amount).abs();
        if divergence > self.total_tolerance {
            warn!(
                order_id = %order_id,
                client_total = %request.total_amount,
                computed_total = %computed_total,
                "Client-declared order total diverges from computed total"
            );
        }

        let order_active_model = OrderActiveModel {
            id: Set(order_id),
            order_number: Set(generate_order_number()),
            user_id: Set(user_id),
            status: Set(OrderStatus::Pending.to_string()),
            payment_status: Set(PaymentStatus::Pending.to_string()),
            total_amount: Set(computed_total),
            shipping_fee: Set(request.shipping_fee),
            tax_amount: Set(request.tax_amount),
            discount_amount: Set(discount),
            currency: Set(request
                .currency
                .unwrap_or_else(|| self.default_currency.clone())),
            payment_method: Set(request.payment_method),
            payment_id: Set(None),
            shipping_address: Set(request.shipping_address.address),
            shipping_city: Set(request.shipping_address.city),
            shipping_postal_code: Set(request.shipping_address.postal_code),
            shipping_country: Set(request.shipping_address.country),
            billing_address: Set(request.billing_address.address),
            billing_city: Set(request.billing_address.city),
            billing_postal_code: Set(request.billing_address.postal_code),
            billing_country: Set(request.billing_address.country),
            notes: Set(request.notes),
            tracking_number: Set(None),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            version: Set(1),
        };

        let order_model = order_active_model.insert(&txn).await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to create order");
            ServiceError::DatabaseError(e)
        })?;

        let mut items = Vec::with_capacity(item_models.len());
        for item in item_models {
            items.push(item.insert(&txn).await.map_err(|e| {
                error!(error = %e, order_id = %order_id, "Failed to create order item");
                ServiceError::DatabaseError(e)
            })?);
        }

        txn.commit().await.map_err(|e| {
            error!(error = %e, order_id = %order_id, "Failed to commit order creation");
            ServiceError::DatabaseError(e)
        })?;

        info!(order_id = %order_id, user_id = %user_id, "Order created successfully");

        self.emit(Event::OrderCreated(order_id)).await;
        for level in stock_levels {
            if level.low_stock {
                self.emit(Event::LowStock {
                    product_id: level.product_id,
                    remaining: level.remaining,
                })
                .await;
            }
        }

        Ok(CheckoutOutcome {
            order: model_to_response(order_model, items),
            is_existing: false,
        })
    }

    /// Looks for a recent pending order from the same user that matches
    /// this request: same item multiset, same shipping address line and
    /// postal code, and a total within the tolerance. Two simultaneous
    /// identical requests can still both miss; the guard reduces
    /// duplicates, it does not serialize them.
    async fn find_duplicate_order<C: ConnectionTrait>(
        &self,
        conn: &C,
        user_id: Uuid,
        request: &CreateOrderRequest,
    ) -> Result<Option<order::Model>, ServiceError> {
        let window_start = Utc::now() - self.idempotency_window;
        let candidates = order::Entity::find()
            .filter(order::Column::UserId.eq(user_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending.to_string()))
            .filter(order::Column::PaymentStatus.eq(PaymentStatus::Pending.to_string()))
            .filter(order::Column::CreatedAt.gte(window_start))
            .order_by_desc(order::Column::CreatedAt)
            .all(conn)
            .await?;

        let requested = item_multiset(
            request
                .items
                .iter()
                .map(|i| (i.product_id, i.quantity)),
        );

        for candidate in candidates {
            if candidate.shipping_address != request.shipping_address.address
                || candidate.shipping_postal_code != request.shipping_address.postal_code
            {
                continue;
            }
            if (candidate.total_amount - request.total_amount).abs() > self.total_tolerance {
                continue;
            }

            let existing_items = load_items(conn, candidate.id).await?;
            let existing = item_multiset(
                existing_items.iter().map(|i| (i.product_id, i.quantity)),
            );
            if existing == requested {
                return Ok(Some(candidate));
            }
        }

        Ok(None)
    }

    #[instrument(skip(self))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderResponse, ServiceError> {
        let db = &*self.db_pool;
        let order_model = order::Entity::find_by_id(order_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let items = load_items(db, order_id).await?;
        Ok(model_to_response(order_model, items))
    }

    /// Raw model lookup used by services that need the current state
    /// without the item join.
    pub async fn get_order_model(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        order::Entity::find_by_id(order_id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
    }

    #[instrument(skip(self))]
    pub async fn list_orders(
        &self,
        filter: OrderListFilter,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<OrderResponse>, u64), ServiceError> {
        if page == 0 || limit == 0 {
            return Err(ServiceError::InvalidInput(
                "Page and limit must be greater than 0".to_string(),
            ));
        }

        let mut query = order::Entity::find().order_by_desc(order::Column::CreatedAt);
        if let Some(user_id) = filter.user_id {
            query = query.filter(order::Column::UserId.eq(user_id));
        }
        if let Some(status) = filter.status {
            query = query.filter(order::Column::Status.eq(status.to_string()));
        }
        if let Some(payment_status) = filter.payment_status {
            query = query.filter(order::Column::PaymentStatus.eq(payment_status.to_string()));
        }
        if let Some(after) = filter.created_after {
            query = query.filter(order::Column::CreatedAt.gte(after));
        }
        if let Some(before) = filter.created_before {
            query = query.filter(order::Column::CreatedAt.lte(before));
        }

        let paginator = query.paginate(&*self.db_pool, limit);
        let total = paginator.num_items().await?;
        let orders = paginator.fetch_page(page - 1).await?;

        let mut responses = Vec::with_capacity(orders.len());
        for order_model in orders {
            let items = load_items(&*self.db_pool, order_model.id).await?;
            responses.push(model_to_response(order_model, items));
        }
        Ok((responses, total))
    }

    /// Updates the fulfillment status. Cancellation returns each item's
    /// reserved units to stock inside the same transaction; repeating a
    /// cancel (or any same-status update) is a no-op.
    #[instrument(skip(self))]
    pub async fn update_order_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
    ) -> Result<OrderResponse, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;

        let order_model = order::Entity::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let current = order_model.status();

        if current == new_status {
            let items = load_items(&txn, order_id).await?;
            txn.commit().await.map_err(ServiceError::DatabaseError)?;
            return Ok(model_to_response(order_model, items));
        }

        if current.is_terminal() {
            return Err(ServiceError::InvalidStatus(format!(
                "Order is {} and can no longer change status",
                current
            )));
        }
        if !current.can_transition_to(new_status) {
            return Err(ServiceError::InvalidStatus(format!(
                "Cannot transition order from {} to {}",
                current, new_status
            )));
        }

        let items = load_items(&txn, order_id).await?;
        let mut released: Vec<(Uuid, i32)> = Vec::new();
        if new_status == OrderStatus::Cancelled {
            for item in &items {
                stock::release(
                    &txn,
                    item.product_id,
                    item.quantity,
                    MovementReference::Return,
                    Some(order_id),
                )
                .await?;
                released.push((item.product_id, item.quantity));
            }
        }

        let old_status = order_model.status.clone();
        let version = order_model.version;
        let mut active: OrderActiveModel = order_model.into();
        active.status = Set(new_status.to_string());
        active.version = Set(version + 1);
        let updated = super::update_order_guarded(&txn, order_id, active, version)
            .await
            .map_err(|e| {
                error!(error = %e, order_id = %order_id, "Failed to update order status");
                e
            })?;

        txn.commit().await.map_err(ServiceError::DatabaseError)?;

        info!(order_id = %order_id, from = %old_status, to = %new_status, "Order status updated");
        self.emit(Event::OrderStatusChanged {
            order_id,
            old_status: old_status.clone(),
            new_status: new_status.to_string(),
        })
        .await;
        if new_status == OrderStatus::Cancelled {
            self.emit(Event::OrderCancelled(order_id)).await;
            for (product_id, quantity) in released {
                self.emit(Event::StockReleased {
                    product_id,
                    quantity,
                    order_id,
                })
                .await;
            }
        }

        let items = load_items(&*self.db_pool, order_id).await?;
        Ok(model_to_response(updated, items))
    }

    /// Sets the carrier tracking number on a shipped (or shipping) order.
    #[instrument(skip(self))]
    pub async fn set_tracking_number(
        &self,
        order_id: Uuid,
        tracking_number: String,
    ) -> Result<OrderResponse, ServiceError> {
        if tracking_number.trim().is_empty() {
            return Err(ServiceError::ValidationError(
                "Tracking number cannot be empty".to_string(),
            ));
        }

        let db = &*self.db_pool;
        let order_model = order::Entity::find_by_id(order_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        if order_model.status() == OrderStatus::Cancelled {
            return Err(ServiceError::InvalidOperation(
                "Cannot set a tracking number on a cancelled order".to_string(),
            ));
        }

        let version = order_model.version;
        let mut active: OrderActiveModel = order_model.into();
        active.tracking_number = Set(Some(tracking_number));
        active.version = Set(version + 1);
        let updated = super::update_order_guarded(db, order_id, active, version).await?;

        let items = load_items(db, order_id).await?;
        Ok(model_to_response(updated, items))
    }

    /// Stamps the provider reference onto an order when a payment
    /// intent is created, so later webhooks can find it.
    #[instrument(skip(self))]
    pub async fn set_payment_reference(
        &self,
        order_id: Uuid,
        payment_id: &str,
        payment_method: &str,
    ) -> Result<order::Model, ServiceError> {
        let db = &*self.db_pool;
        let order_model = order::Entity::find_by_id(order_id)
            .one(db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;

        let version = order_model.version;
        let mut active: OrderActiveModel = order_model.into();
        active.payment_id = Set(Some(payment_id.to_string()));
        active.payment_method = Set(payment_method.to_string());
        active.updated_at = Set(Some(Utc::now()));
        active.version = Set(version + 1);
        super::update_order_guarded(db, order_id, active, version).await
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "Failed to send domain event");
            }
        }
    }
}

/// Generates an order number of the form ORD-YYYYMMDD-XXXXXXXX.
fn generate_order_number() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(|c| (c as char).to_ascii_uppercase())
        .collect();
    format!("ORD-{}-{}", Utc::now().format("%Y%m%d"), suffix)
}

/// Order-independent item comparison key: product id with aggregated
/// quantity, sorted.
fn item_multiset<I: Iterator<Item = (Uuid, i32)>>(items: I) -> Vec<(Uuid, i32)> {
    let mut aggregated: std::collections::BTreeMap<Uuid, i32> = std::collections::BTreeMap::new();
    for (product_id, quantity) in items {
        *aggregated.entry(product_id).or_insert(0) += quantity;
    }
    aggregated.into_iter().collect()
}

async fn touch_duplicate<C: ConnectionTrait>(
    conn: &C,
    existing: &order::Model,
    payment_method: &str,
) -> Result<order::Model, ServiceError> {
    let mut active: OrderActiveModel = existing.clone().into();
    active.payment_method = Set(payment_method.to_string());
    active.version = Set(existing.version + 1);
    super::update_order_guarded(conn, existing.id, active, existing.version).await
}

async fn load_items<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
) -> Result<Vec<order_item::Model>, ServiceError> {
    Ok(order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .all(conn)
        .await?)
}

pub(crate) fn model_to_response(
    order_model: order::Model,
    items: Vec<order_item::Model>,
) -> OrderResponse {
    OrderResponse {
        id: order_model.id,
        order_number: order_model.order_number,
        user_id: order_model.user_id,
        status: order_model.status,
        payment_status: order_model.payment_status,
        total_amount: order_model.total_amount,
        shipping_fee: order_model.shipping_fee,
        tax_amount: order_model.tax_amount,
        discount_amount: order_model.discount_amount,
        currency: order_model.currency,
        payment_method: order_model.payment_method,
        payment_id: order_model.payment_id,
        shipping_address: order_model.shipping_address,
        shipping_city: order_model.shipping_city,
        shipping_postal_code: order_model.shipping_postal_code,
        shipping_country: order_model.shipping_country,
        tracking_number: order_model.tracking_number,
        notes: order_model.notes,
        items: items
            .into_iter()
            .map(|i| OrderItemResponse {
                id: i.id,
                product_id: i.product_id,
                product_name: i.product_name,
                quantity: i.quantity,
                price: i.price,
                total: i.total,
            })
            .collect(),
        created_at: order_model.created_at,
        updated_at: order_model.updated_at,
    }
}
