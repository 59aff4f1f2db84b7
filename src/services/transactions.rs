use crate::{
    db::DbPool,
    entities::order,
    entities::transaction::{self, TransactionStatus, TransactionType},
    errors::ServiceError,
    events::{Event, EventSender},
    services::gateways::PaymentGateway,
    services::reconciliation::{OrderLookup, PaymentEventKind, ReconciliationService},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use utoipa::ToSchema;
use uuid::Uuid;
use validator::Validate;

#[derive(Debug, Serialize, Deserialize, Validate, ToSchema)]
pub struct RefundRequest {
    /// Completed payment transaction the refund draws from
    pub transaction_id: Uuid,
    /// Refund amount; omitted means the full remaining amount
    pub amount: Option<Decimal>,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TransactionResponse {
    pub id: Uuid,
    pub order_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: String,
    pub payment_id: Option<String>,
    pub status: String,
    pub transaction_type: String,
    pub reference_number: String,
    pub parent_transaction_id: Option<Uuid>,
    pub notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct TransactionSummary {
    pub total_payments: Decimal,
    pub total_refunds: Decimal,
    pub net_revenue: Decimal,
    pub completed_payment_count: u64,
    pub completed_refund_count: u64,
}

#[derive(Debug, Default, Clone)]
pub struct TransactionFilter {
    pub order_id: Option<Uuid>,
    pub status: Option<TransactionStatus>,
    pub transaction_type: Option<TransactionType>,
    pub payment_method: Option<String>,
}

/// Append-only financial ledger. Rows advance through their status
/// lifecycle but are never deleted, and refunds can never draw more
/// than the payment they are linked to.
#[derive(Clone)]
pub struct TransactionService {
    db_pool: Arc<DbPool>,
    event_sender: Option<Arc<EventSender>>,
    reconciliation: ReconciliationService,
}

impl TransactionService {
    pub fn new(
        db_pool: Arc<DbPool>,
        event_sender: Option<Arc<EventSender>>,
        reconciliation: ReconciliationService,
    ) -> Self {
        Self {
            db_pool,
            event_sender,
            reconciliation,
        }
    }

    /// Records the pending payment row when an intent is created.
    #[instrument(skip(self))]
    pub async fn record_pending_payment(
        &self,
        order_model: &order::Model,
        payment_id: &str,
        payment_method: &str,
    ) -> Result<transaction::Model, ServiceError> {
        let row = transaction::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_model.id),
            amount: Set(order_model.total_amount),
            currency: Set(order_model.currency.clone()),
            payment_method: Set(payment_method.to_string()),
            payment_id: Set(Some(payment_id.to_string())),
            capture_id: Set(None),
            status: Set(TransactionStatus::Pending.to_string()),
            transaction_type: Set(TransactionType::Payment.to_string()),
            reference_number: Set(order_model.order_number.clone()),
            parent_transaction_id: Set(None),
            notes: Set(None),
            payment_response: Set(None),
            created_at: Set(Utc::now()),
            updated_at: Set(Some(Utc::now())),
        };
        Ok(row.insert(&*self.db_pool).await?)
    }

    /// Stores the provider capture reference once a capture settles.
    pub async fn record_capture_reference(
        &self,
        payment_id: &str,
        capture_id: &str,
    ) -> Result<(), ServiceError> {
        if let Some(row) = transaction::Entity::find()
            .filter(transaction::Column::PaymentId.eq(payment_id))
            .filter(
                transaction::Column::TransactionType.eq(TransactionType::Payment.to_string()),
            )
            .one(&*self.db_pool)
            .await?
        {
            let mut active: transaction::ActiveModel = row.into();
            active.capture_id = Set(Some(capture_id.to_string()));
            active.update(&*self.db_pool).await?;
        }
        Ok(())
    }

    pub async fn get_transaction(
        &self,
        id: Uuid,
    ) -> Result<TransactionResponse, ServiceError> {
        let row = transaction::Entity::find_by_id(id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Transaction {} not found", id)))?;
        Ok(model_to_response(row))
    }

    pub async fn get_transaction_model(
        &self,
        id: Uuid,
    ) -> Result<transaction::Model, ServiceError> {
        transaction::Entity::find_by_id(id)
            .one(&*self.db_pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Transaction {} not found", id)))
    }

    #[instrument(skip(self))]
    pub async fn list_transactions(
        &self,
        filter: TransactionFilter,
        page: u64,
        limit: u64,
    ) -> Result<(Vec<TransactionResponse>, u64), ServiceError> {
        if page == 0 || limit == 0 {
            return Err(ServiceError::InvalidInput(
                "Page and limit must be greater than 0".to_string(),
            ));
        }

        let mut query =
            transaction::Entity::find().order_by_desc(transaction::Column::CreatedAt);
        if let Some(order_id) = filter.order_id {
            query = query.filter(transaction::Column::OrderId.eq(order_id));
        }
        if let Some(status) = filter.status {
            query = query.filter(transaction::Column::Status.eq(status.to_string()));
        }
        if let Some(transaction_type) = filter.transaction_type {
            query = query
                .filter(transaction::Column::TransactionType.eq(transaction_type.to_string()));
        }
        if let Some(method) = filter.payment_method {
            query = query.filter(transaction::Column::PaymentMethod.eq(method));
        }

        let paginator = query.paginate(&*self.db_pool, limit);
        let total = paginator.num_items().await?;
        let rows = paginator.fetch_page(page - 1).await?;
        Ok((rows.into_iter().map(model_to_response).collect(), total))
    }

    pub async fn list_for_order(
        &self,
        order_id: Uuid,
    ) -> Result<Vec<TransactionResponse>, ServiceError> {
        let rows = transaction::Entity::find()
            .filter(transaction::Column::OrderId.eq(order_id))
            .order_by_asc(transaction::Column::CreatedAt)
            .all(&*self.db_pool)
            .await?;
        Ok(rows.into_iter().map(model_to_response).collect())
    }

    /// Ledger totals over completed rows.
    pub async fn summary(&self) -> Result<TransactionSummary, ServiceError> {
        let completed = transaction::Entity::find()
            .filter(transaction::Column::Status.eq(TransactionStatus::Completed.to_string()))
            .all(&*self.db_pool)
            .await?;

        let mut total_payments = Decimal::ZERO;
        let mut total_refunds = Decimal::ZERO;
        let mut payment_count = 0;
        let mut refund_count = 0;
        for row in &completed {
            if row.is_refund() {
                total_refunds += row.amount;
                refund_count += 1;
            } else {
                total_payments += row.amount;
                payment_count += 1;
            }
        }

        Ok(TransactionSummary {
            total_payments,
            total_refunds,
            net_revenue: total_payments - total_refunds,
            completed_payment_count: payment_count,
            completed_refund_count: refund_count,
        })
    }

    /// Transactions are an audit log; deletion is rejected regardless of
    /// role.
    pub fn delete_transaction(&self, _id: Uuid) -> Result<(), ServiceError> {
        Err(ServiceError::Forbidden(
            "Transactions are immutable and cannot be deleted".to_string(),
        ))
    }

    /// Issues a refund against a completed payment. The amount is capped
    /// by what the parent has left after earlier completed refunds and
    /// refunds still in flight; the provider call happens between the
    /// pending-row insert and its settlement so a crash leaves an
    /// auditable pending row rather than an untracked provider refund.
    ///
    /// The cap check and the pending insert commit together, guarded by
    /// a conditional bump of the parent row. A racing refund loses the
    /// bump, fails with ConcurrentModification, and on retry sees this
    /// refund's pending row counted against the balance.
    #[instrument(skip(self, gateway), fields(transaction_id = %request.transaction_id))]
    pub async fn process_refund(
        &self,
        request: RefundRequest,
        gateway: &dyn PaymentGateway,
    ) -> Result<TransactionResponse, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

        let txn = self.db_pool.begin().await?;

        let parent = transaction::Entity::find_by_id(request.transaction_id)
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!(
                    "Transaction {} not found",
                    request.transaction_id
                ))
            })?;
        if parent.transaction_type() != TransactionType::Payment {
            return Err(ServiceError::InvalidOperation(
                "Refunds can only be issued against payment transactions".to_string(),
            ));
        }
        if parent.status() != TransactionStatus::Completed
            && parent.status() != TransactionStatus::PartiallyRefunded
        {
            return Err(ServiceError::InvalidOperation(
                "Refunds require a completed payment transaction".to_string(),
            ));
        }

        let children = transaction::Entity::find()
            .filter(transaction::Column::ParentTransactionId.eq(parent.id))
            .filter(transaction::Column::Status.is_in([
                TransactionStatus::Pending.to_string(),
                TransactionStatus::Completed.to_string(),
            ]))
            .all(&txn)
            .await?;
        let settled: Decimal = children
            .iter()
            .filter(|t| t.status() == TransactionStatus::Completed)
            .map(|t| t.amount)
            .sum();
        let reserved: Decimal = children
            .iter()
            .filter(|t| t.status() == TransactionStatus::Pending)
            .map(|t| t.amount)
            .sum();
        let available = parent.amount - settled - reserved;

        let amount = request.amount.unwrap_or(available);
        if amount <= Decimal::ZERO {
            return Err(ServiceError::ValidationError(
                "Refund amount must be positive".to_string(),
            ));
        }
        if amount > available {
            return Err(ServiceError::RefundExceedsAvailable { available });
        }

        let claim = transaction::Entity::update_many()
            .col_expr(
                transaction::Column::UpdatedAt,
                Expr::value(Some(Utc::now())),
            )
            .filter(transaction::Column::Id.eq(parent.id))
            .filter(transaction::Column::UpdatedAt.eq(parent.updated_at))
            .exec(&txn)
            .await?;
        if claim.rows_affected == 0 {
            warn!(parent_id = %parent.id, "Refund lost the race for the parent payment");
            return Err(ServiceError::ConcurrentModification(parent.id));
        }

        let is_partial = amount < parent.amount;
        let refund_type = if is_partial {
            TransactionType::PartialRefund
        } else {
            TransactionType::Refund
        };

        let pending = transaction::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(parent.order_id),
            amount: Set(amount),
            currency: Set(parent.currency.clone()),
            payment_method: Set(parent.payment_method.clone()),
            payment_id: Set(None),
            capture_id: Set(None),
            status: Set(TransactionStatus::Pending.to_string()),
            transaction_type: Set(refund_type.to_string()),
            reference_number: Set(parent.reference_number.clone()),
            parent_transaction_id: Set(Some(parent.id)),
            notes: Set(request.reason.clone()),
            payment_response: Set(None),
            created_at: Set(Utc::now()),
            updated_at: Set(Some(Utc::now())),
        };
        // Resolved before commit so an unrefundable parent leaves no
        // pending row behind.
        let capture_reference = parent
            .capture_id
            .clone()
            .or_else(|| parent.payment_id.clone())
            .ok_or_else(|| {
                ServiceError::InvalidOperation(
                    "Parent transaction has no provider reference to refund against".to_string(),
                )
            })?;

        let pending = pending.insert(&txn).await?;
        txn.commit().await?;

        let result = gateway
            .refund(&capture_reference, Some(amount), &parent.currency)
            .await;

        match result {
            Ok(refund) if refund.succeeded => {
                let mut active: transaction::ActiveModel = pending.clone().into();
                active.status = Set(TransactionStatus::Completed.to_string());
                active.payment_id = Set(Some(refund.refund_id.clone()));
                active.payment_response = Set(Some(refund.raw.to_string()));
                let completed = active.update(&*self.db_pool).await?;

                let now_refunded = settled + amount;
                let parent_status = if now_refunded >= parent.amount {
                    TransactionStatus::Refunded
                } else {
                    TransactionStatus::PartiallyRefunded
                };
                let fully_refunded = parent_status == TransactionStatus::Refunded;
                let mut parent_active: transaction::ActiveModel = parent.clone().into();
                parent_active.status = Set(parent_status.to_string());
                parent_active.update(&*self.db_pool).await?;

                // The order flips to refunded only once the payment is
                // fully drawn down; the refund row itself is already
                // written, so the engine must not add another.
                if fully_refunded {
                    self.reconciliation
                        .apply(
                            OrderLookup::ById(parent.order_id),
                            PaymentEventKind::Refunded,
                            None,
                            false,
                        )
                        .await?;
                }

                info!(
                    refund_id = %completed.id,
                    order_id = %parent.order_id,
                    %amount,
                    "Refund completed"
                );
                self.emit(Event::PaymentRefunded {
                    order_id: parent.order_id,
                    amount,
                })
                .await;

                Ok(model_to_response(completed))
            }
            Ok(refund) => {
                let mut active: transaction::ActiveModel = pending.into();
                active.status = Set(TransactionStatus::Failed.to_string());
                active.payment_response = Set(Some(refund.raw.to_string()));
                active.update(&*self.db_pool).await?;
                error!(status = %refund.status, "Provider rejected the refund");
                Err(ServiceError::PaymentFailed(format!(
                    "Refund rejected by provider: {}",
                    refund.status
                )))
            }
            Err(e) => {
                let mut active: transaction::ActiveModel = pending.into();
                active.status = Set(TransactionStatus::Failed.to_string());
                active.update(&*self.db_pool).await?;
                error!(error = %e, "Refund provider call failed");
                Err(e)
            }
        }
    }

    async fn emit(&self, event: Event) {
        if let Some(sender) = &self.event_sender {
            if let Err(e) = sender.send(event).await {
                warn!(error = %e, "Failed to send domain event");
            }
        }
    }
}

fn model_to_response(row: transaction::Model) -> TransactionResponse {
    TransactionResponse {
        id: row.id,
        order_id: row.order_id,
        amount: row.amount,
        currency: row.currency,
        payment_method: row.payment_method,
        payment_id: row.payment_id,
        status: row.status,
        transaction_type: row.transaction_type,
        reference_number: row.reference_number,
        parent_transaction_id: row.parent_transaction_id,
        notes: row.notes,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}
