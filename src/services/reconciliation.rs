use crate::{
    db::DbPool,
    entities::order::{self, ActiveModel as OrderActiveModel, OrderStatus, PaymentStatus},
    entities::transaction::{self, TransactionStatus, TransactionType},
    errors::ServiceError,
    events::{Event, EventSender},
};
use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde_json::Value;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// How the reconciliation engine finds the order a payment event is
/// about: directly, or through the provider reference stamped on it
/// when the intent was created.
#[derive(Debug, Clone)]
pub enum OrderLookup {
    ById(Uuid),
    ByReference(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentEventKind {
    Succeeded,
    Failed,
    Refunded,
}

/// Whether the event application changed anything. Duplicate deliveries
/// resolve to `AlreadyApplied` and are answered with a 2xx.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    Applied,
    AlreadyApplied,
}

/// Applies provider payment outcomes to orders and their ledger rows.
/// Every channel that learns a payment's fate, the confirm endpoints,
/// webhooks, and the admin override, funnels through here so the state
/// machine lives in one place.
#[derive(Clone)]
pub struct ReconciliationService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
}

impl ReconciliationService {
    pub fn new(db_pool: Arc<DbPool>, event_sender: Option<Arc<EventSender>>) -> Self {
        Self {
            db_pool,
            event_sender,
        }
    }

    /// Applies a payment event. For refunds originating outside the
    /// local refund endpoint (`record_refund_row`), a completed refund
    /// transaction is written against the original payment.
    #[instrument(skip(self, raw))]
    pub async fn apply(
        &self,
        lookup: OrderLookup,
        kind: PaymentEventKind,
        raw: Option<Value>,
        record_refund_row: bool,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let db = &*self.db_pool;
        let txn = db.begin().await.map_err(ServiceError::DatabaseError)?;

        let order_model = match &lookup {
            OrderLookup::ById(id) => order::Entity::find_by_id(*id).one(&txn).await?,
            OrderLookup::ByReference(reference) => {
                order::Entity::find()
                    .filter(order::Column::PaymentId.eq(reference.clone()))
                    .one(&txn)
                    .await?
            }
        }
        .ok_or_else(|| match &lookup {
            OrderLookup::ById(id) => ServiceError::NotFound(format!("Order {} not found", id)),
            OrderLookup::ByReference(reference) => ServiceError::NotFound(format!(
                "No order with payment reference {}",
                reference
            )),
        })?;

        let order_id = order_model.id;
        let payment_id = order_model.payment_id.clone();
        let total_amount = order_model.total_amount;
        let current = order_model.payment_status();

        let outcome = match kind {
            PaymentEventKind::Succeeded => {
                if current == PaymentStatus::Paid {
                    ReconcileOutcome::AlreadyApplied
                } else {
                    self.mark_paid(&txn, order_model, raw.as_ref()).await?;
                    ReconcileOutcome::Applied
                }
            }
            PaymentEventKind::Failed => {
                // A success already recorded wins over a late failure.
                if current == PaymentStatus::Failed || current == PaymentStatus::Paid {
                    ReconcileOutcome::AlreadyApplied
                } else {
                    self.mark_failed(&txn, order_model, raw.as_ref()).await?;
                    ReconcileOutcome::Applied
                }
            }
            PaymentEventKind::Refunded => {
                if current == PaymentStatus::Refunded {
                    ReconcileOutcome::AlreadyApplied
                } else if current != PaymentStatus::Paid {
                    return Err(ServiceError::InvalidOperation(format!(
                        "Cannot refund order {} with payment status {}",
                        order_id, order_model.payment_status
                    )));
                } else {
                    self.mark_refunded(&txn, order_model, raw.as_ref(), record_refund_row)
                        .await?;
                    ReconcileOutcome::Applied
                }
            }
        };

        txn.commit().await.map_err(ServiceError::DatabaseError)?;

        if outcome == ReconcileOutcome::Applied {
            match kind {
                PaymentEventKind::Succeeded => {
                    info!(%order_id, "Payment reconciled as succeeded");
                    self.emit(Event::PaymentSucceeded {
                        order_id,
                        payment_id: payment_id.unwrap_or_default(),
                    })
                    .await;
                }
                PaymentEventKind::Failed => {
                    self.emit(Event::PaymentFailed {
                        order_id,
                        payment_id: payment_id.unwrap_or_default(),
                    })
                    .await;
                }
                PaymentEventKind::Refunded => {
                    self.emit(Event::PaymentRefunded {
                        order_id,
                        amount: total_amount,
                    })
                    .await;
                }
            }
        } else {
            info!(%order_id, ?kind, "Duplicate payment event ignored");
        }

        Ok(outcome)
    }

    /// Manual override used by the admin payment-status endpoint. The
    /// target status maps onto the same event machine the providers
    /// drive.
    pub async fn apply_admin_override(
        &self,
        order_id: Uuid,
        target: PaymentStatus,
    ) -> Result<ReconcileOutcome, ServiceError> {
        let kind = match target {
            PaymentStatus::Paid => PaymentEventKind::Succeeded,
            PaymentStatus::Failed => PaymentEventKind::Failed,
            PaymentStatus::Refunded => PaymentEventKind::Refunded,
            PaymentStatus::Pending => {
                return Err(ServiceError::InvalidStatus(
                    "Cannot reset payment status to pending".to_string(),
                ))
            }
        };
        self.apply(OrderLookup::ById(order_id), kind, None, true)
            .await
    }

    async fn mark_paid<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_model: order::Model,
        raw: Option<&Value>,
    ) -> Result<(), ServiceError> {
        let order_id = order_model.id;
        let payment_id = order_model.payment_id.clone();
        let status = order_model.status();
        let version = order_model.version;

        let mut active: OrderActiveModel = order_model.into();
        active.payment_status = Set(PaymentStatus::Paid.to_string());
        if status == OrderStatus::Pending {
            active.status = Set(OrderStatus::Processing.to_string());
        }
        active.version = Set(version + 1);
        super::update_order_guarded(conn, order_id, active, version).await?;

        self.settle_payment_row(conn, order_id, payment_id, TransactionStatus::Completed, raw)
            .await
    }

    async fn mark_failed<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_model: order::Model,
        raw: Option<&Value>,
    ) -> Result<(), ServiceError> {
        let order_id = order_model.id;
        let payment_id = order_model.payment_id.clone();
        let version = order_model.version;

        let mut active: OrderActiveModel = order_model.into();
        active.payment_status = Set(PaymentStatus::Failed.to_string());
        active.version = Set(version + 1);
        super::update_order_guarded(conn, order_id, active, version).await?;

        self.settle_payment_row(conn, order_id, payment_id, TransactionStatus::Failed, raw)
            .await
    }

    async fn mark_refunded<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_model: order::Model,
        raw: Option<&Value>,
        record_refund_row: bool,
    ) -> Result<(), ServiceError> {
        let order_id = order_model.id;
        let order_number = order_model.order_number.clone();
        let currency = order_model.currency.clone();
        let payment_method = order_model.payment_method.clone();
        let version = order_model.version;

        let mut active: OrderActiveModel = order_model.into();
        active.payment_status = Set(PaymentStatus::Refunded.to_string());
        active.version = Set(version + 1);
        super::update_order_guarded(conn, order_id, active, version).await?;

        if record_refund_row {
            // Externally-originated refund: write the ledger row the
            // local refund endpoint would otherwise have created.
            let parent = transaction::Entity::find()
                .filter(transaction::Column::OrderId.eq(order_id))
                .filter(
                    transaction::Column::TransactionType
                        .eq(TransactionType::Payment.to_string()),
                )
                .filter(transaction::Column::Status.eq(TransactionStatus::Completed.to_string()))
                .one(conn)
                .await?;

            if let Some(parent) = parent {
                // In-flight local refunds count against the balance so
                // this row cannot overdraw the payment alongside them.
                let refunded: Decimal = transaction::Entity::find()
                    .filter(transaction::Column::ParentTransactionId.eq(parent.id))
                    .filter(transaction::Column::Status.is_in([
                        TransactionStatus::Pending.to_string(),
                        TransactionStatus::Completed.to_string(),
                    ]))
                    .all(conn)
                    .await?
                    .iter()
                    .map(|t| t.amount)
                    .sum();
                let remaining = parent.amount - refunded;

                if remaining > Decimal::ZERO {
                    let claim = transaction::Entity::update_many()
                        .col_expr(
                            transaction::Column::UpdatedAt,
                            Expr::value(Some(Utc::now())),
                        )
                        .filter(transaction::Column::Id.eq(parent.id))
                        .filter(transaction::Column::UpdatedAt.eq(parent.updated_at))
                        .exec(conn)
                        .await?;
                    if claim.rows_affected == 0 {
                        return Err(ServiceError::ConcurrentModification(parent.id));
                    }

                    let refund_row = transaction::ActiveModel {
                        id: Set(Uuid::new_v4()),
                        order_id: Set(order_id),
                        amount: Set(remaining),
                        currency: Set(currency),
                        payment_method: Set(payment_method),
                        payment_id: Set(parent.payment_id.clone()),
                        capture_id: Set(None),
                        status: Set(TransactionStatus::Completed.to_string()),
                        transaction_type: Set(TransactionType::Refund.to_string()),
                        reference_number: Set(order_number),
                        parent_transaction_id: Set(Some(parent.id)),
                        notes: Set(Some("Refund reported by payment provider".to_string())),
                        payment_response: Set(raw.map(|v| v.to_string())),
                        created_at: Set(Utc::now()),
                        updated_at: Set(Some(Utc::now())),
                    };
                    refund_row.insert(conn).await?;

                    let mut parent_active: transaction::ActiveModel = parent.into();
                    parent_active.status = Set(TransactionStatus::Refunded.to_string());
                    parent_active.update(conn).await?;
                }
            } else {
                warn!(%order_id, "Refund event for an order with no completed payment row");
            }
        }

        Ok(())
    }

    /// Advances the pending payment transaction matching this order (and
    /// provider reference, when known) to its settled status.
    async fn settle_payment_row<C: ConnectionTrait>(
        &self,
        conn: &C,
        order_id: Uuid,
        payment_id: Option<String>,
        status: TransactionStatus,
        raw: Option<&Value>,
    ) -> Result<(), ServiceError> {
        let mut query = transaction::Entity::find()
            .filter(transaction::Column::OrderId.eq(order_id))
            .filter(
                transaction::Column::TransactionType.eq(TransactionType::Payment.to_string()),
            )
            .filter(transaction::Column::Status.eq(TransactionStatus::Pending.to_string()));
        if let Some(reference) = &payment_id {
            query = query.filter(transaction::Column::PaymentId.eq(reference.clone()));
        }

        if let Some(row) = query.one(conn).await? {
            let mut active: transaction::ActiveModel = row.into();
            active.status = Set(status.to_string());
            if let Some(raw) = raw {
                active.payment_response = Set(Some(raw.to_string()));
            }
            active.update(conn).await?;
        }
        Ok(())
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "Failed to send domain event");
            }
        }
    }
}
