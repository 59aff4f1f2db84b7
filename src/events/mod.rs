use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{info, warn};
use uuid::Uuid;

/// Domain events emitted after state changes commit. Delivery is
/// fire-and-forget; the business transaction never depends on it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: String,
        new_status: String,
    },
    OrderCancelled(Uuid),

    PaymentSucceeded {
        order_id: Uuid,
        payment_id: String,
    },
    PaymentFailed {
        order_id: Uuid,
        payment_id: String,
    },
    PaymentRefunded {
        order_id: Uuid,
        amount: Decimal,
    },

    StockReleased {
        product_id: Uuid,
        quantity: i32,
        order_id: Uuid,
    },
    LowStock {
        product_id: Uuid,
        remaining: i32,
    },
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Sends an event asynchronously
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {}", e))
    }
}

/// Creates the event channel with the given capacity.
pub fn event_channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Event processing loop. Runs until all senders are dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        match &event {
            Event::LowStock {
                product_id,
                remaining,
            } => {
                warn!(%product_id, remaining, "Product stock below threshold");
            }
            Event::PaymentFailed {
                order_id,
                payment_id,
            } => {
                warn!(%order_id, %payment_id, "Payment failed for order");
            }
            other => {
                info!(event = ?other, "Domain event");
            }
        }
    }

    info!("Event processing loop stopped");
}
