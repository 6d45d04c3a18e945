use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::warn;
use uuid::Uuid;

use crate::entities::order::OrderStatus;

/// Domain events published after state changes commit. Events are advisory
/// (notifications, projections); correctness never depends on a consumer
/// seeing them.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated(Uuid),
    OrderPaid {
        order_id: Uuid,
        transaction_id: String,
    },
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
    },
    OrderCancelled(Uuid),
    StockDebited {
        product_id: Uuid,
        quantity: i32,
        remaining: i32,
    },
    StockReplenished {
        product_id: Uuid,
        quantity: i32,
        remaining: i32,
    },
    CouponRedeemed {
        customer_id: Uuid,
        code: String,
        order_id: Uuid,
    },
    RefundRequested {
        order_id: Uuid,
        request_id: Uuid,
        requested_amount: Decimal,
    },
    RefundApproved {
        order_id: Uuid,
        request_id: Uuid,
        refunded_amount: Decimal,
    },
    RefundRejected {
        order_id: Uuid,
        request_id: Uuid,
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

    /// Creates a sender/receiver pair with a bounded channel.
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self::new(tx), rx)
    }

    /// Sends an event, surfacing channel failure to the caller.
    pub async fn send(&self, event: Event) -> Result<(), String> {
        self.sender
            .send(event)
            .await
            .map_err(|e| format!("Failed to send event: {e}"))
    }

    /// Sends an event and logs instead of failing when no consumer is
    /// listening. Used on paths where the state change has already committed.
    pub async fn send_or_log(&self, event: Event) {
        if let Err(e) = self.send(event.clone()).await {
            warn!(?event, error = %e, "Event dropped, no active consumer");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_delivers_to_receiver() {
        let (sender, mut rx) = EventSender::channel(4);
        let order_id = Uuid::new_v4();
        sender.send(Event::OrderCreated(order_id)).await.unwrap();

        match rx.recv().await {
            Some(Event::OrderCreated(id)) => assert_eq!(id, order_id),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn send_or_log_swallows_closed_channel() {
        let (sender, rx) = EventSender::channel(1);
        drop(rx);
        // Must not panic or error.
        sender.send_or_log(Event::OrderCancelled(Uuid::new_v4())).await;
    }
}
