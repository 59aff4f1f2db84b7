use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, ActiveValue::Set, ConnectionTrait};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum::{Display, EnumString};
use uuid::Uuid;
use validator::Validate;

/// Product entity
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize, Validate)]
#[sea_orm(table_name = "products")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,

    #[validate(length(
        min = 1,
        max = 255,
        message = "Product name must be between 1 and 255 characters"
    ))]
    pub name: String,

    #[validate(length(
        min = 1,
        max = 100,
        message = "SKU must be between 1 and 100 characters"
    ))]
    pub sku: String,

    #[validate(length(max = 2000, message = "Description cannot exceed 2000 characters"))]
    pub description: Option<String>,

    /// Base price per unit
    pub price: Decimal,

    /// Discounted price, when a promotion applies. Must stay below `price`.
    pub discount_price: Option<Decimal>,

    #[validate(length(min = 3, max = 3, message = "Currency must be a 3-letter code"))]
    pub currency: String,

    /// On-hand stock. Never negative.
    pub quantity: i32,

    /// Threshold below which a low-stock event fires
    pub low_stock_threshold: i32,

    pub status: String,

    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Product availability status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum ProductStatus {
    Active,
    Inactive,
    OutOfStock,
}

impl Model {
    /// Effective unit price taking any active discount into account
    pub fn current_price(&self) -> Decimal {
        self.discount_price.unwrap_or(self.price)
    }

    pub fn status(&self) -> ProductStatus {
        ProductStatus::from_str(&self.status).unwrap_or(ProductStatus::Inactive)
    }

    pub fn is_low_stock(&self) -> bool {
        self.quantity > 0 && self.quantity <= self.low_stock_threshold
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(has_many = "super::inventory_movement::Entity")]
    InventoryMovements,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::inventory_movement::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::InventoryMovements.def()
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
            if let ActiveValue::NotSet = active_model.status {
                active_model.status = Set(ProductStatus::Active.to_string());
            }
            active_model.created_at = Set(Utc::now());
        }

        active_model.updated_at = Set(Some(Utc::now()));

        let model: Model = active_model.clone().try_into().map_err(|_| {
            DbErr::Custom("Failed to convert ActiveModel to Model for validation".to_string())
        })?;

        if let Err(err) = model.validate() {
            return Err(DbErr::Custom(format!("Validation error: {}", err)));
        }
        if model.quantity < 0 {
            return Err(DbErr::Custom("Product quantity cannot be negative".to_string()));
        }
        if let Some(discount) = model.discount_price {
            if discount >= model.price {
                return Err(DbErr::Custom(
                    "Discount price must be below the base price".to_string(),
                ));
            }
        }

        Ok(active_model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn sample() -> Model {
        Model {
            id: Uuid::new_v4(),
            name: "Widget".to_string(),
            sku: "WID-001".to_string(),
            description: None,
            price: dec!(25.00),
            discount_price: None,
            currency: "USD".to_string(),
            quantity: 10,
            low_stock_threshold: 3,
            status: ProductStatus::Active.to_string(),
            created_at: Utc::now(),
            updated_at: None,
        }
    }

    #[test]
    fn current_price_prefers_discount() {
        let mut product = sample();
        assert_eq!(product.current_price(), dec!(25.00));
        product.discount_price = Some(dec!(19.99));
        assert_eq!(product.current_price(), dec!(19.99));
    }

    #[test]
    fn low_stock_only_when_positive() {
        let mut product = sample();
        product.quantity = 3;
        assert!(product.is_low_stock());
        product.quantity = 0;
        assert!(!product.is_low_stock());
    }

    #[test]
    fn status_round_trips() {
        assert_eq!(ProductStatus::OutOfStock.to_string(), "out_of_stock");
        assert_eq!(
            ProductStatus::from_str("out_of_stock").unwrap(),
            ProductStatus::OutOfStock
        );
    }
}
