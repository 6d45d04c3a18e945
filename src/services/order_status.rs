use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait,
};
use tracing::{info, instrument};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::entities::order::{self, Entity as Order, OrderStatus};
use crate::entities::order_history::Actor;
use crate::entities::order_item::{self, Entity as OrderItem};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::services::history;
use crate::services::stock::StockLedger;

/// Admin-driven order status updates (ship, deliver, cancel), governed by
/// the same transition table as every other mutation. Refund-branch statuses
/// are owned by the refund orchestrator and rejected here.
#[derive(Clone)]
pub struct OrderStatusService {
    db: Arc<DatabaseConnection>,
    stock: StockLedger,
    events: Arc<EventSender>,
}

impl OrderStatusService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        events: Arc<EventSender>,
    ) -> Self {
        Self {
            db,
            stock: StockLedger::new(config.stock_retry_limit),
            events,
        }
    }

    #[instrument(skip(self), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        tracking_number: Option<String>,
        admin_id: Uuid,
    ) -> Result<order::Model, ServiceError> {
        if matches!(
            new_status,
            OrderStatus::RefundRequested | OrderStatus::Refunded | OrderStatus::PartiallyRefunded
        ) {
            return Err(ServiceError::InvalidOperation(
                "Refund statuses are managed through the refund workflow".to_string(),
            ));
        }
        if new_status == OrderStatus::Shipped && tracking_number.is_none() {
            return Err(ServiceError::ValidationError(
                "A tracking number is required to mark an order shipped".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let order_row = Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(order_id.to_string()))?;

        let previous = order_row.status;
        if !previous.can_transition_to(new_status) {
            return Err(ServiceError::InvalidStateTransition {
                from: previous,
                to: new_status,
            });
        }

        // Cancellation returns every un-refunded unit to stock.
        let mut replenished = Vec::new();
        if new_status == OrderStatus::Cancelled {
            let items = OrderItem::find()
                .filter(order_item::Column::OrderId.eq(order_id))
                .all(&txn)
                .await?;
            for item in items {
                let back = item.refundable_quantity();
                if back > 0 {
                    let remaining = self.stock.replenish(&txn, item.product_id, back).await?;
                    replenished.push((item.product_id, back, remaining));
                }
            }
        }

        // Conditional on the status and version read above so two admins
        // racing on the same order cannot both apply; the loser gets a
        // retryable conflict instead of silently re-applying.
        let now = Utc::now();
        let mut update = Order::update_many()
            .col_expr(order::Column::Status, Expr::value(new_status))
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(now)))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            );
        if let Some(tracking) = tracking_number {
            update = update.col_expr(order::Column::TrackingNumber, Expr::value(Some(tracking)));
        }
        if new_status == OrderStatus::Delivered {
            update = update.col_expr(order::Column::DeliveredAt, Expr::value(Some(now)));
        }
        let result = update
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(previous))
            .filter(order::Column::Version.eq(order_row.version))
            .exec(&txn)
            .await?;
        if result.rows_affected != 1 {
            return Err(ServiceError::ConcurrentModification(order_id));
        }
        let updated = Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(order_id.to_string()))?;

        history::record(
            &txn,
            order_id,
            Some(previous),
            new_status,
            format!("Status changed to {new_status}"),
            &Actor::Admin(admin_id),
        )
        .await?;

        txn.commit().await?;

        info!(%order_id, %previous, %new_status, "Order status updated");
        self.events
            .send_or_log(Event::OrderStatusChanged {
                order_id,
                old_status: previous,
                new_status,
            })
            .await;
        if new_status == OrderStatus::Cancelled {
            self.events.send_or_log(Event::OrderCancelled(order_id)).await;
            for (product_id, quantity, remaining) in replenished {
                self.events
                    .send_or_log(Event::StockReplenished {
                        product_id,
                        quantity,
                        remaining,
                    })
                    .await;
            }
        }

        Ok(updated)
    }
}
