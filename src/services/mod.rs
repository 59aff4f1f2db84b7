pub mod gateways;
pub mod orders;
pub mod reconciliation;
pub mod stock;
pub mod transactions;

use sea_orm::{ColumnTrait, ConnectionTrait, DbErr, EntityTrait, QueryFilter};
use uuid::Uuid;

use crate::entities::order;
use crate::errors::ServiceError;

/// Order update guarded by the optimistic version column. The caller
/// stamps `version + 1` on the active model; if another writer advanced
/// the row since it was read, the filter matches nothing and the update
/// surfaces as ConcurrentModification instead of silently clobbering.
pub(crate) async fn update_order_guarded<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    active: order::ActiveModel,
    read_version: i32,
) -> Result<order::Model, ServiceError> {
    order::Entity::update(active)
        .filter(order::Column::Version.eq(read_version))
        .exec(conn)
        .await
        .map_err(|err| match err {
            DbErr::RecordNotUpdated => ServiceError::ConcurrentModification(order_id),
            other => ServiceError::DatabaseError(other),
        })
}
