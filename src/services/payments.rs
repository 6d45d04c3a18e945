use std::sync::Arc;

use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, TransactionTrait,
};
use tracing::{info, instrument, warn};

use crate::entities::order::{self, Entity as Order, OrderStatus};
use crate::entities::order_history::Actor;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateway::WebhookEvent;
use crate::services::history;

/// Result of applying a payment webhook.
#[derive(Debug)]
pub enum PaymentOutcome {
    /// First successful application: the order moved Pending -> Paid.
    Confirmed(order::Model),
    /// Replay of an already-applied webhook; nothing changed.
    AlreadyProcessed(order::Model),
}

/// Applies gateway payment webhooks to orders.
///
/// Delivery is at-least-once, so the handler is idempotent: replays of a
/// webhook for an order that is already `Paid` (or later) are acknowledged
/// without re-appending history or re-firing events. The state-machine check
/// rejects a second Pending -> Paid once the first has committed, which is
/// the only guard needed — no extra locking.
#[derive(Clone)]
pub struct PaymentService {
    db: Arc<DatabaseConnection>,
    events: Arc<EventSender>,
}

impl PaymentService {
    pub fn new(db: Arc<DatabaseConnection>, events: Arc<EventSender>) -> Self {
        Self { db, events }
    }

    #[instrument(skip(self, webhook), fields(transaction_id = %webhook.transaction_id))]
    pub async fn confirm_payment(
        &self,
        webhook: WebhookEvent,
    ) -> Result<PaymentOutcome, ServiceError> {
        let txn = self.db.begin().await?;

        // Orders are keyed by the gateway session stored at checkout; fall
        // back to the transaction id for replays that arrive after we have
        // recorded it.
        let mut query = Order::find();
        query = match &webhook.session_id {
            Some(session_id) => {
                query.filter(order::Column::GatewaySessionId.eq(session_id.clone()))
            }
            None => query
                .filter(order::Column::GatewayTransactionId.eq(webhook.transaction_id.clone())),
        };
        let order_row = query.one(&txn).await?.ok_or_else(|| {
            // Surfaced to the webhook adapter, which acknowledges permanently
            // unmatched events instead of letting the gateway retry forever.
            ServiceError::OrderNotFound(format!(
                "no order for gateway reference {}",
                webhook
                    .session_id
                    .as_deref()
                    .unwrap_or(&webhook.transaction_id)
            ))
        })?;

        if order_row.status.is_post_payment() {
            info!(order_id = %order_row.id, status = %order_row.status, "Duplicate payment webhook ignored");
            return Ok(PaymentOutcome::AlreadyProcessed(order_row));
        }

        let previous = order_row.status;
        if !previous.can_transition_to(OrderStatus::Paid) {
            return Err(ServiceError::InvalidStateTransition {
                from: previous,
                to: OrderStatus::Paid,
            });
        }

        // Amount mismatches are recorded for manual reconciliation, not
        // rejected.
        let warning = if webhook.amount_paid != order_row.total_amount {
            warn!(
                order_id = %order_row.id,
                expected = %order_row.total_amount,
                paid = %webhook.amount_paid,
                "Paid amount does not match order total"
            );
            Some(format!(
                "gateway reported {} paid, order total is {}",
                webhook.amount_paid, order_row.total_amount
            ))
        } else {
            None
        };

        // The status and version predicates make this the single gate for
        // the Pending -> Paid transition. Two deliveries racing past the
        // post-payment check above both reach this UPDATE, but only one
        // affects a row; the loser is a replay.
        let order_id = order_row.id;
        let result = Order::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Paid))
            .col_expr(
                order::Column::GatewayTransactionId,
                Expr::value(Some(webhook.transaction_id.clone())),
            )
            .col_expr(order::Column::PaymentWarning, Expr::value(warning))
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .filter(order::Column::Version.eq(order_row.version))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            txn.rollback().await?;
            let current = Order::find_by_id(order_id)
                .one(&*self.db)
                .await?
                .ok_or_else(|| ServiceError::OrderNotFound(order_id.to_string()))?;
            info!(%order_id, status = %current.status, "Duplicate payment webhook ignored");
            return Ok(PaymentOutcome::AlreadyProcessed(current));
        }
        let updated = Order::find_by_id(order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(order_id.to_string()))?;

        history::record(
            &txn,
            order_id,
            Some(previous),
            OrderStatus::Paid,
            format!("Payment confirmed, transaction {}", webhook.transaction_id),
            &Actor::Gateway,
        )
        .await?;

        txn.commit().await?;

        info!(%order_id, transaction_id = %webhook.transaction_id, "Payment confirmed");
        self.events
            .send_or_log(Event::OrderPaid {
                order_id,
                transaction_id: webhook.transaction_id,
            })
            .await;

        Ok(PaymentOutcome::Confirmed(updated))
    }
}
