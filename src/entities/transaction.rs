use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::ActiveValue::Set;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{Display, EnumString};
use uuid::Uuid;

/// Financial ledger row. Append-only: rows are inserted and their status
/// advances, but they are never deleted.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "transactions")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_id: Uuid,
    pub amount: Decimal,
    pub currency: String,
    pub payment_method: String,
    /// Provider-side reference (intent id / provider order id)
    pub payment_id: Option<String>,
    /// Provider capture id, when the provider distinguishes it from the
    /// intent reference; refunds are issued against this
    pub capture_id: Option<String>,
    pub status: String,
    pub transaction_type: String,
    /// Human-facing reference, mirrors the order number
    pub reference_number: String,
    /// Refund rows point at the payment they draw from
    pub parent_transaction_id: Option<Uuid>,
    pub notes: Option<String>,
    /// Raw provider payload captured for audit, serialized JSON
    pub payment_response: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
    Refunded,
    PartiallyRefunded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    Payment,
    Refund,
    PartialRefund,
}

impl Model {
    pub fn status(&self) -> TransactionStatus {
        TransactionStatus::from_str(&self.status).unwrap_or(TransactionStatus::Pending)
    }

    pub fn transaction_type(&self) -> TransactionType {
        TransactionType::from_str(&self.transaction_type).unwrap_or(TransactionType::Payment)
    }

    pub fn is_refund(&self) -> bool {
        matches!(
            self.transaction_type(),
            TransactionType::Refund | TransactionType::PartialRefund
        )
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

#[async_trait::async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;
        if insert {
            active_model.created_at = Set(Utc::now());
        }
        active_model.updated_at = Set(Some(Utc::now()));

        let model: Model = active_model.clone().try_into().map_err(|_| {
            DbErr::Custom("Failed to convert ActiveModel to Model for validation".to_string())
        })?;
        if model.amount <= Decimal::ZERO {
            return Err(DbErr::Custom("Transaction amount must be positive".to_string()));
        }

        Ok(active_model)
    }
}
