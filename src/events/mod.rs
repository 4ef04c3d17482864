use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::entities::{OrderStatus, PaymentStatus};

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
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

    /// Publishes without letting delivery failure affect the caller.
    pub async fn send_or_log(&self, event: Event) {
        let name = event.name();
        if let Err(e) = self.send(event).await {
            warn!(event = name, error = %e, "dropping domain event");
        }
    }
}

/// Domain events published after the owning unit of work commits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Event {
    CartItemAdded {
        cart_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    },
    CartItemUpdated {
        cart_id: Uuid,
        item_id: Uuid,
        quantity: i32,
    },
    CartItemRemoved {
        cart_id: Uuid,
        item_id: Uuid,
    },
    CartCleared(Uuid),

    OrderCreated {
        order_id: Uuid,
        order_number: String,
        user_id: Uuid,
        total: Decimal,
        created_at: DateTime<Utc>,
    },
    StockDecremented {
        product_id: Uuid,
        quantity: i32,
        order_id: Uuid,
    },
    StockRestored {
        product_id: Uuid,
        quantity: i32,
        order_id: Uuid,
    },
    OrderCancelled(Uuid),
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    PaymentStatusChanged {
        order_id: Uuid,
        old_status: PaymentStatus,
        new_status: PaymentStatus,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::CartItemAdded { .. } => "cart_item_added",
            Event::CartItemUpdated { .. } => "cart_item_updated",
            Event::CartItemRemoved { .. } => "cart_item_removed",
            Event::CartCleared(_) => "cart_cleared",
            Event::OrderCreated { .. } => "order_created",
            Event::StockDecremented { .. } => "stock_decremented",
            Event::StockRestored { .. } => "stock_restored",
            Event::OrderCancelled(_) => "order_cancelled",
            Event::OrderStatusChanged { .. } => "order_status_changed",
            Event::PaymentStatusChanged { .. } => "payment_status_changed",
        }
    }
}

/// Drains the channel and logs each event until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>) {
    info!("Starting event processing loop");
    while let Some(event) = rx.recv().await {
        counter!("paymall_events_total", 1, "event" => event.name());
        match &event {
            Event::OrderCreated {
                order_id,
                order_number,
                total,
                ..
            } => info!(%order_id, %order_number, %total, "order created"),
            Event::OrderCancelled(order_id) => info!(%order_id, "order cancelled"),
            Event::StockDecremented {
                product_id,
                quantity,
                order_id,
            } => info!(%product_id, quantity, %order_id, "stock decremented"),
            Event::StockRestored {
                product_id,
                quantity,
                order_id,
            } => info!(%product_id, quantity, %order_id, "stock restored"),
            other => debug!(event = other.name(), payload = ?other, "domain event"),
        }
    }
    info!("Event processing loop stopped");
}
