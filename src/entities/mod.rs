pub mod inventory_movement;
pub mod order;
pub mod order_item;
pub mod product;
pub mod transaction;
