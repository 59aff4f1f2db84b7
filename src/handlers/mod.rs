pub mod inventory;
pub mod orders;
pub mod payments;
pub mod transactions;
pub mod webhooks;
