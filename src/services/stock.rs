use crate::entities::inventory_movement::{self, MovementReference};
use crate::entities::product::{self, ProductStatus};
use crate::errors::ServiceError;
use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Outcome of a reservation, reported back so callers can emit events
/// after their transaction commits.
#[derive(Debug, Clone, Copy)]
pub struct StockLevel {
    pub product_id: Uuid,
    pub remaining: i32,
    pub low_stock: bool,
}

/// Atomically reserves `quantity` units of a product on the caller's
/// connection, which is expected to be an open transaction so the
/// reservation commits or rolls back together with the order rows.
///
/// The decrement is a single conditional UPDATE guarded by the current
/// quantity; under concurrent checkouts of the last unit exactly one
/// caller's update matches.
#[instrument(skip(conn))]
pub async fn reserve<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    quantity: i32,
    order_id: Uuid,
) -> Result<StockLevel, ServiceError> {
    debug_assert!(quantity > 0);

    let result = product::Entity::update_many()
        .col_expr(
            product::Column::Quantity,
            Expr::col(product::Column::Quantity).sub(quantity),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Some(Utc::now())))
        .filter(product::Column::Id.eq(product_id))
        .filter(product::Column::Quantity.gte(quantity))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        let current = product::Entity::find_by_id(product_id)
            .one(conn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Product {} not found", product_id))
            })?;
        warn!(
            %product_id,
            requested = quantity,
            available = current.quantity,
            "Stock reservation failed"
        );
        return Err(ServiceError::InsufficientStock {
            product_id,
            name: current.name,
            requested: quantity,
            available: current.quantity,
        });
    }

    record_movement(
        conn,
        product_id,
        -quantity,
        MovementReference::Order,
        Some(order_id),
        None,
        None,
    )
    .await?;

    let product = require_product(conn, product_id).await?;
    if product.quantity == 0 && product.status() != ProductStatus::OutOfStock {
        set_status(conn, product_id, ProductStatus::OutOfStock).await?;
    }

    debug!(%product_id, remaining = product.quantity, "Reserved stock");
    Ok(StockLevel {
        product_id,
        remaining: product.quantity,
        low_stock: product.is_low_stock(),
    })
}

/// Returns previously reserved units to stock, recording the paired
/// movement. Runs on the caller's transaction; idempotence is the
/// caller's responsibility (guarded by the order status transition).
#[instrument(skip(conn))]
pub async fn release<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    quantity: i32,
    reference: MovementReference,
    order_id: Option<Uuid>,
) -> Result<StockLevel, ServiceError> {
    debug_assert!(quantity > 0);

    let previous = require_product(conn, product_id).await?;

    product::Entity::update_many()
        .col_expr(
            product::Column::Quantity,
            Expr::col(product::Column::Quantity).add(quantity),
        )
        .col_expr(product::Column::UpdatedAt, Expr::value(Some(Utc::now())))
        .filter(product::Column::Id.eq(product_id))
        .exec(conn)
        .await?;

    record_movement(conn, product_id, quantity, reference, order_id, None, None).await?;

    if previous.quantity == 0 && previous.status() == ProductStatus::OutOfStock {
        set_status(conn, product_id, ProductStatus::Active).await?;
    }

    let product = require_product(conn, product_id).await?;
    debug!(%product_id, remaining = product.quantity, "Released stock");
    Ok(StockLevel {
        product_id,
        remaining: product.quantity,
        low_stock: product.is_low_stock(),
    })
}

/// Records a manual stock adjustment made by an administrator. Negative
/// deltas are guarded so stock never goes below zero.
#[instrument(skip(conn))]
pub async fn adjust<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    delta: i32,
    reference: MovementReference,
    notes: Option<String>,
    created_by: Uuid,
) -> Result<StockLevel, ServiceError> {
    if delta == 0 {
        return Err(ServiceError::InvalidInput(
            "Adjustment quantity cannot be zero".to_string(),
        ));
    }

    let previous = require_product(conn, product_id).await?;

    if delta < 0 {
        let result = product::Entity::update_many()
            .col_expr(
                product::Column::Quantity,
                Expr::col(product::Column::Quantity).add(delta),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(product::Column::Id.eq(product_id))
            .filter(product::Column::Quantity.gte(-delta))
            .exec(conn)
            .await?;
        if result.rows_affected == 0 {
            return Err(ServiceError::InvalidOperation(format!(
                "Adjustment would drive product {} stock below zero (available {})",
                product_id, previous.quantity
            )));
        }
    } else {
        product::Entity::update_many()
            .col_expr(
                product::Column::Quantity,
                Expr::col(product::Column::Quantity).add(delta),
            )
            .col_expr(product::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .filter(product::Column::Id.eq(product_id))
            .exec(conn)
            .await?;
    }

    record_movement(
        conn,
        product_id,
        delta,
        reference,
        None,
        notes,
        Some(created_by),
    )
    .await?;

    let product = require_product(conn, product_id).await?;
    if product.quantity == 0 && product.status() != ProductStatus::OutOfStock {
        set_status(conn, product_id, ProductStatus::OutOfStock).await?;
    } else if previous.quantity == 0
        && product.quantity > 0
        && previous.status() == ProductStatus::OutOfStock
    {
        set_status(conn, product_id, ProductStatus::Active).await?;
    }

    Ok(StockLevel {
        product_id,
        remaining: product.quantity,
        low_stock: product.is_low_stock(),
    })
}

/// Appends a row to the movement log.
async fn record_movement<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    quantity: i32,
    reference: MovementReference,
    reference_id: Option<Uuid>,
    notes: Option<String>,
    created_by: Option<Uuid>,
) -> Result<inventory_movement::Model, ServiceError> {
    let movement = inventory_movement::ActiveModel {
        id: Set(Uuid::new_v4()),
        product_id: Set(product_id),
        quantity: Set(quantity),
        reference_type: Set(reference.to_string()),
        reference_id: Set(reference_id),
        notes: Set(notes),
        created_by: Set(created_by),
        created_at: Set(Utc::now()),
    };
    Ok(movement.insert(conn).await?)
}

async fn require_product<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
) -> Result<product::Model, ServiceError> {
    product::Entity::find_by_id(product_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Product {} not found", product_id)))
}

async fn set_status<C: ConnectionTrait>(
    conn: &C,
    product_id: Uuid,
    status: ProductStatus,
) -> Result<(), ServiceError> {
    product::Entity::update_many()
        .col_expr(product::Column::Status, Expr::value(status.to_string()))
        .filter(product::Column::Id.eq(product_id))
        .exec(conn)
        .await?;
    Ok(())
}

/// Read-side queries over the movement log, backing the admin
/// inventory endpoints.
pub mod log {
    use super::*;
    use crate::db::DbPool;
    use std::sync::Arc;

    #[derive(Debug, Clone)]
    pub struct MovementLog {
        db: Arc<DbPool>,
    }

    #[derive(Debug, Clone, Default)]
    pub struct MovementFilter {
        pub product_id: Option<Uuid>,
        pub reference_type: Option<MovementReference>,
    }

    impl MovementLog {
        pub fn new(db: Arc<DbPool>) -> Self {
            Self { db }
        }

        pub async fn get(
            &self,
            id: Uuid,
        ) -> Result<inventory_movement::Model, ServiceError> {
            inventory_movement::Entity::find_by_id(id)
                .one(&*self.db)
                .await?
                .ok_or_else(|| {
                    ServiceError::NotFound(format!("Inventory movement {} not found", id))
                })
        }

        pub async fn list(
            &self,
            filter: MovementFilter,
            page: u64,
            limit: u64,
        ) -> Result<(Vec<inventory_movement::Model>, u64), ServiceError> {
            if page == 0 || limit == 0 {
                return Err(ServiceError::InvalidInput(
                    "Page and limit must be greater than 0".to_string(),
                ));
            }

            let mut query = inventory_movement::Entity::find()
                .order_by_desc(inventory_movement::Column::CreatedAt);
            if let Some(product_id) = filter.product_id {
                query = query.filter(inventory_movement::Column::ProductId.eq(product_id));
            }
            if let Some(reference) = filter.reference_type {
                query = query
                    .filter(inventory_movement::Column::ReferenceType.eq(reference.to_string()));
            }

            let paginator = query.paginate(&*self.db, limit);
            let total = paginator.num_items().await?;
            let movements = paginator.fetch_page(page - 1).await?;
            Ok((movements, total))
        }

        /// Full movement history for one product, oldest first, with the
        /// running sum the audit endpoints display.
        pub async fn product_history(
            &self,
            product_id: Uuid,
        ) -> Result<Vec<inventory_movement::Model>, ServiceError> {
            Ok(inventory_movement::Entity::find()
                .filter(inventory_movement::Column::ProductId.eq(product_id))
                .order_by_asc(inventory_movement::Column::CreatedAt)
                .all(&*self.db)
                .await?)
        }
    }
}
