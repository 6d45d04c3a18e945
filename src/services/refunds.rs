use std::collections::HashMap;
use std::sync::Arc;

use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
    TransactionTrait,
};
use serde::Deserialize;
use tracing::{error, info, instrument};
use uuid::Uuid;
use validator::Validate;

use crate::config::AppConfig;
use crate::entities::order::{self, Entity as Order, OrderStatus, RefundType};
use crate::entities::order_history::Actor;
use crate::entities::order_item::{self, Entity as OrderItem};
use crate::entities::refund_request::{self, Entity as RefundRequest, RefundRequestStatus};
use crate::entities::refund_request_item::{self, Entity as RefundRequestItem};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateway::PaymentGateway;
use crate::services::history;
use crate::services::stock::StockLedger;

#[derive(Debug, Clone, Deserialize)]
pub struct RefundItemInput {
    pub order_item_id: Uuid,
    pub quantity: i32,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RefundInput {
    pub order_id: Uuid,
    pub customer_id: Uuid,
    pub refund_type: RefundType,
    /// Required for partial refunds; ignored for total ones.
    #[serde(default)]
    pub items: Vec<RefundItemInput>,
    pub reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ResolveInput {
    pub refund_request_id: Uuid,
    pub admin_id: Uuid,
    pub approve: bool,
    /// Rejection reason, surfaced to the customer.
    pub reason: Option<String>,
    /// Per-item quantities the admin actually approves. Defaults to the
    /// requested quantities; may be lower, never higher.
    pub approved_quantities: Option<Vec<RefundItemInput>>,
}

/// Refund orchestration: customer-initiated requests, admin resolution,
/// gateway refund issuance, and restocking.
///
/// The gateway is always called before local state changes persist. A
/// gateway failure therefore leaves order, items, and stock untouched —
/// only an audit entry records the attempt.
#[derive(Clone)]
pub struct RefundService {
    db: Arc<DatabaseConnection>,
    config: Arc<AppConfig>,
    stock: StockLedger,
    gateway: Arc<dyn PaymentGateway>,
    events: Arc<EventSender>,
}

impl RefundService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        gateway: Arc<dyn PaymentGateway>,
        events: Arc<EventSender>,
    ) -> Self {
        let stock = StockLedger::new(config.stock_retry_limit);
        Self {
            db,
            config,
            stock,
            gateway,
            events,
        }
    }

    /// Files a refund request and moves the order to `RefundRequested`,
    /// pending admin resolution. No money moves and no stock changes here.
    #[instrument(skip(self, input), fields(order_id = %input.order_id))]
    pub async fn request_refund(
        &self,
        input: RefundInput,
    ) -> Result<refund_request::Model, ServiceError> {
        input.validate()?;
        if input.refund_type == RefundType::None {
            return Err(ServiceError::ValidationError(
                "Refund type must be total or partial".to_string(),
            ));
        }

        let txn = self.db.begin().await?;

        let order_row = Order::find_by_id(input.order_id)
            .one(&txn)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(input.order_id.to_string()))?;
        if order_row.customer_id != input.customer_id {
            return Err(ServiceError::OrderNotFound(input.order_id.to_string()));
        }

        let prior = order_row.status;
        if !prior.can_transition_to(OrderStatus::RefundRequested) {
            return Err(ServiceError::InvalidStateTransition {
                from: prior,
                to: OrderStatus::RefundRequested,
            });
        }
        self.check_return_window(&order_row)?;

        let items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_row.id))
            .all(&txn)
            .await?;

        // Resolve what is being asked for, per item.
        let requested: Vec<(order_item::Model, i32)> = match input.refund_type {
            RefundType::Total => items
                .iter()
                .filter(|i| i.refundable_quantity() > 0)
                .map(|i| (i.clone(), i.refundable_quantity()))
                .collect(),
            RefundType::Partial => {
                let by_id: HashMap<Uuid, &order_item::Model> =
                    items.iter().map(|i| (i.id, i)).collect();
                let mut seen: HashMap<Uuid, ()> = HashMap::new();
                let mut resolved = Vec::with_capacity(input.items.len());
                for req in &input.items {
                    if seen.insert(req.order_item_id, ()).is_some() {
                        return Err(ServiceError::ValidationError(format!(
                            "Duplicate refund line for item {}",
                            req.order_item_id
                        )));
                    }
                    let item = by_id.get(&req.order_item_id).ok_or_else(|| {
                        ServiceError::NotFound(format!("Order item {}", req.order_item_id))
                    })?;
                    if req.quantity <= 0 {
                        return Err(ServiceError::ValidationError(
                            "Refund quantity must be positive".to_string(),
                        ));
                    }
                    if req.quantity > item.refundable_quantity() {
                        return Err(ServiceError::RefundExceedsAvailable(format!(
                            "item {}: requested {}, refundable {}",
                            item.id,
                            req.quantity,
                            item.refundable_quantity()
                        )));
                    }
                    resolved.push(((*item).clone(), req.quantity));
                }
                resolved
            }
            RefundType::None => unreachable!("rejected above"),
        };
        if requested.is_empty() {
            return Err(ServiceError::RefundExceedsAvailable(
                "nothing left to refund on this order".to_string(),
            ));
        }

        let requested_amount = match input.refund_type {
            // A full refund returns everything still outstanding, shipping
            // included.
            RefundType::Total => order_row.total_amount - order_row.refunded_amount,
            // Partial refunds are item-priced; the coupon discount is not
            // re-prorated.
            _ => requested
                .iter()
                .map(|(item, qty)| item.unit_price * Decimal::from(*qty))
                .sum(),
        };
        if requested_amount <= Decimal::ZERO {
            return Err(ServiceError::RefundExceedsAvailable(
                "nothing left to refund on this order".to_string(),
            ));
        }

        let now = Utc::now();
        let request_id = Uuid::new_v4();
        let request = refund_request::ActiveModel {
            id: Set(request_id),
            order_id: Set(order_row.id),
            customer_id: Set(input.customer_id),
            refund_type: Set(input.refund_type),
            status: Set(RefundRequestStatus::Pending),
            prior_status: Set(prior),
            requested_amount: Set(requested_amount),
            approved_amount: Set(None),
            reason: Set(input.reason.clone()),
            created_at: Set(now),
            resolved_at: Set(None),
        };
        let request = request.insert(&txn).await?;

        for (item, qty) in &requested {
            let row = refund_request_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                refund_request_id: Set(request_id),
                order_item_id: Set(item.id),
                quantity_requested: Set(*qty),
                quantity_restocked: Set(0),
                created_at: Set(now),
            };
            row.insert(&txn).await?;
        }

        // Conditional on the status and version read above: a concurrent
        // writer (second request, admin update) makes this a no-op instead of
        // a lost update.
        let order_id = order_row.id;
        let updated = Order::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::RefundRequested))
            .col_expr(order::Column::RefundType, Expr::value(input.refund_type))
            .col_expr(
                order::Column::RefundRequestedAmount,
                Expr::value(requested_amount),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(now)))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(prior))
            .filter(order::Column::Version.eq(order_row.version))
            .exec(&txn)
            .await?;
        if updated.rows_affected != 1 {
            return Err(ServiceError::ConcurrentModification(order_id));
        }

        history::record(
            &txn,
            order_id,
            Some(prior),
            OrderStatus::RefundRequested,
            format!(
                "Refund requested ({:?}) for {}",
                input.refund_type, requested_amount
            ),
            &Actor::Customer(input.customer_id),
        )
        .await?;

        txn.commit().await?;

        info!(%order_id, %request_id, %requested_amount, "Refund requested");
        self.events
            .send_or_log(Event::RefundRequested {
                order_id,
                request_id,
                requested_amount,
            })
            .await;

        Ok(request)
    }

    /// Resolves a pending refund request.
    ///
    /// Approval calls the gateway first and persists nothing if the gateway
    /// fails; the approved (not the requested) quantities are restocked.
    /// Rejection returns the order to its prior post-payment status with the
    /// reason stored for the customer — no gateway call, no restock.
    #[instrument(skip(self, input), fields(request_id = %input.refund_request_id))]
    pub async fn resolve_refund(&self, input: ResolveInput) -> Result<(), ServiceError> {
        let request = RefundRequest::find_by_id(input.refund_request_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| {
                ServiceError::NotFound(format!("Refund request {}", input.refund_request_id))
            })?;
        if request.status != RefundRequestStatus::Pending {
            return Err(ServiceError::InvalidOperation(
                "Refund request already resolved or in progress".to_string(),
            ));
        }

        let order_row = Order::find_by_id(request.order_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::OrderNotFound(request.order_id.to_string()))?;

        if input.approve {
            self.approve(request, order_row, input).await
        } else {
            self.reject(request, order_row, input).await
        }
    }

    async fn reject(
        &self,
        request: refund_request::Model,
        order_row: order::Model,
        input: ResolveInput,
    ) -> Result<(), ServiceError> {
        let prior = request.prior_status;
        if !order_row.status.can_transition_to(prior) {
            return Err(ServiceError::InvalidStateTransition {
                from: order_row.status,
                to: prior,
            });
        }

        let reason = input
            .reason
            .ok_or_else(|| ServiceError::ValidationError("Rejection reason is required".into()))?;

        let txn = self.db.begin().await?;
        let now = Utc::now();
        let order_id = order_row.id;
        let from = order_row.status;

        let updated = Order::update_many()
            .col_expr(order::Column::Status, Expr::value(prior))
            .col_expr(
                order::Column::RejectionReason,
                Expr::value(Some(reason.clone())),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(now)))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(order_row.status))
            .filter(order::Column::Version.eq(order_row.version))
            .exec(&txn)
            .await?;
        if updated.rows_affected != 1 {
            return Err(ServiceError::ConcurrentModification(order_id));
        }

        // Conditional on Pending so a racing approval that already claimed
        // the request turns this rejection into an error, not a second
        // resolution.
        let request_id = request.id;
        let resolved = RefundRequest::update_many()
            .col_expr(
                refund_request::Column::Status,
                Expr::value(RefundRequestStatus::Rejected),
            )
            .col_expr(
                refund_request::Column::Reason,
                Expr::value(Some(reason.clone())),
            )
            .col_expr(refund_request::Column::ResolvedAt, Expr::value(Some(now)))
            .filter(refund_request::Column::Id.eq(request_id))
            .filter(refund_request::Column::Status.eq(RefundRequestStatus::Pending))
            .exec(&txn)
            .await?;
        if resolved.rows_affected != 1 {
            return Err(ServiceError::InvalidOperation(
                "Refund request already resolved or in progress".to_string(),
            ));
        }

        history::record(
            &txn,
            order_id,
            Some(from),
            prior,
            format!("Refund rejected: {reason}"),
            &Actor::Admin(input.admin_id),
        )
        .await?;

        txn.commit().await?;

        info!(%order_id, %request_id, "Refund request rejected");
        self.events
            .send_or_log(Event::RefundRejected {
                order_id,
                request_id,
            })
            .await;
        Ok(())
    }

    async fn approve(
        &self,
        request: refund_request::Model,
        order_row: order::Model,
        input: ResolveInput,
    ) -> Result<(), ServiceError> {
        if order_row.status != OrderStatus::RefundRequested {
            return Err(ServiceError::InvalidStateTransition {
                from: order_row.status,
                to: OrderStatus::Refunded,
            });
        }

        let transaction_id = order_row.gateway_transaction_id.clone().ok_or_else(|| {
            ServiceError::InvalidOperation("Order has no captured payment to refund".to_string())
        })?;

        let request_items = RefundRequestItem::find()
            .filter(refund_request_item::Column::RefundRequestId.eq(request.id))
            .all(&*self.db)
            .await?;
        let order_items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_row.id))
            .all(&*self.db)
            .await?;
        let items_by_id: HashMap<Uuid, &order_item::Model> =
            order_items.iter().map(|i| (i.id, i)).collect();

        // Admin may approve less than was requested, never more.
        let approved_overrides: HashMap<Uuid, i32> = input
            .approved_quantities
            .unwrap_or_default()
            .into_iter()
            .map(|i| (i.order_item_id, i.quantity))
            .collect();

        // Any item approved below its requested quantity, including down to
        // zero, means the request is not fully approved — a zeroed line must
        // push the amount onto the item-priced branch, never the order total.
        let mut fully_approved = true;
        let mut approvals: Vec<(order_item::Model, refund_request_item::Model, i32)> = Vec::new();
        for req_item in request_items {
            let qty = approved_overrides
                .get(&req_item.order_item_id)
                .copied()
                .unwrap_or(req_item.quantity_requested);
            if qty < 0 || qty > req_item.quantity_requested {
                return Err(ServiceError::RefundExceedsAvailable(format!(
                    "item {}: approved {} exceeds requested {}",
                    req_item.order_item_id, qty, req_item.quantity_requested
                )));
            }
            if qty < req_item.quantity_requested {
                fully_approved = false;
            }
            if qty == 0 {
                continue;
            }
            let item = items_by_id.get(&req_item.order_item_id).ok_or_else(|| {
                ServiceError::NotFound(format!("Order item {}", req_item.order_item_id))
            })?;
            if qty > item.refundable_quantity() {
                return Err(ServiceError::RefundExceedsAvailable(format!(
                    "item {}: approved {}, refundable {}",
                    item.id,
                    qty,
                    item.refundable_quantity()
                )));
            }
            approvals.push(((*item).clone(), req_item, qty));
        }
        if approvals.is_empty() {
            return Err(ServiceError::ValidationError(
                "Approval must cover at least one unit".to_string(),
            ));
        }

        // A fully-approved total refund returns the outstanding order total
        // (shipping included); anything less is item-priced.
        let amount = if request.refund_type == RefundType::Total && fully_approved {
            order_row.total_amount - order_row.refunded_amount
        } else {
            approvals
                .iter()
                .map(|(item, _, qty)| item.unit_price * Decimal::from(*qty))
                .sum()
        };

        // Claim the request before touching the gateway. The conditional
        // update is the guard against two resolvers racing past the Pending
        // check and charging the gateway twice for one request.
        let claimed = RefundRequest::update_many()
            .col_expr(
                refund_request::Column::Status,
                Expr::value(RefundRequestStatus::Processing),
            )
            .filter(refund_request::Column::Id.eq(request.id))
            .filter(refund_request::Column::Status.eq(RefundRequestStatus::Pending))
            .exec(&*self.db)
            .await?;
        if claimed.rows_affected != 1 {
            return Err(ServiceError::InvalidOperation(
                "Refund request already resolved or in progress".to_string(),
            ));
        }

        // Gateway next. If this fails the claim is released and no other
        // local state has changed; the attempt is still recorded so support
        // staff sees it.
        let refund_id = match self.gateway.refund(&transaction_id, amount).await {
            Ok(id) => id,
            Err(e) => {
                RefundRequest::update_many()
                    .col_expr(
                        refund_request::Column::Status,
                        Expr::value(RefundRequestStatus::Pending),
                    )
                    .filter(refund_request::Column::Id.eq(request.id))
                    .filter(
                        refund_request::Column::Status.eq(RefundRequestStatus::Processing),
                    )
                    .exec(&*self.db)
                    .await?;
                error!(
                    order_id = %order_row.id,
                    gateway_transaction_id = %transaction_id,
                    %amount,
                    error = %e,
                    "Gateway refund failed; no state was changed"
                );
                history::record_note(
                    &*self.db,
                    order_row.id,
                    order_row.status,
                    format!("Refund attempt of {amount} failed: {e}"),
                    &Actor::Admin(input.admin_id),
                )
                .await?;
                return Err(e);
            }
        };

        // Gateway confirmed — persist everything in one transaction. If this
        // commit fails the error log below carries the ids needed for manual
        // reconciliation.
        let result = self
            .persist_approval(&request, &order_row, &approvals, amount, input.admin_id)
            .await;
        if let Err(e) = &result {
            error!(
                order_id = %order_row.id,
                gateway_refund_id = %refund_id,
                gateway_transaction_id = %transaction_id,
                %amount,
                error = %e,
                "Gateway refund succeeded but local persist failed; manual reconciliation required"
            );
            return result.map(|_| ());
        }

        let new_status = result?;
        info!(order_id = %order_row.id, request_id = %request.id, %amount, %refund_id, status = %new_status, "Refund approved");
        self.events
            .send_or_log(Event::RefundApproved {
                order_id: order_row.id,
                request_id: request.id,
                refunded_amount: amount,
            })
            .await;
        Ok(())
    }

    async fn persist_approval(
        &self,
        request: &refund_request::Model,
        order_row: &order::Model,
        approvals: &[(order_item::Model, refund_request_item::Model, i32)],
        amount: Decimal,
        admin_id: Uuid,
    ) -> Result<OrderStatus, ServiceError> {
        let txn = self.db.begin().await?;
        let now = Utc::now();

        for (item, req_item, qty) in approvals {
            // Conditional bump keeps refund_quantity <= quantity even if a
            // concurrent approval slipped in between our read and this write.
            let updated = OrderItem::update_many()
                .col_expr(
                    order_item::Column::RefundQuantity,
                    sea_orm::sea_query::Expr::col(order_item::Column::RefundQuantity).add(*qty),
                )
                .filter(order_item::Column::Id.eq(item.id))
                .filter(order_item::Column::RefundQuantity.lte(item.quantity - qty))
                .exec(&txn)
                .await?;
            if updated.rows_affected != 1 {
                return Err(ServiceError::RefundExceedsAvailable(format!(
                    "item {}: refund quantity changed concurrently",
                    item.id
                )));
            }

            self.stock.replenish(&txn, item.product_id, *qty).await?;

            let mut active: refund_request_item::ActiveModel = req_item.clone().into();
            active.quantity_restocked = Set(*qty);
            active.update(&txn).await?;
        }

        // Any unit anywhere on the order still un-refunded leaves it
        // partially refunded.
        let approved_by_item: HashMap<Uuid, i32> = approvals
            .iter()
            .map(|(item, _, qty)| (item.id, *qty))
            .collect();
        let all_items = OrderItem::find()
            .filter(order_item::Column::OrderId.eq(order_row.id))
            .all(&txn)
            .await?;
        let fully_refunded = all_items.iter().all(|i| {
            let bumped = approved_by_item.get(&i.id).copied().unwrap_or(0);
            i.refund_quantity + bumped >= i.quantity
        });
        let new_status = if fully_refunded {
            OrderStatus::Refunded
        } else {
            OrderStatus::PartiallyRefunded
        };
        if !order_row.status.can_transition_to(new_status) {
            return Err(ServiceError::InvalidStateTransition {
                from: order_row.status,
                to: new_status,
            });
        }

        let mut update = Order::update_many()
            .col_expr(order::Column::Status, Expr::value(new_status))
            .col_expr(
                order::Column::RefundedAmount,
                Expr::value(order_row.refunded_amount + amount),
            )
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(now)))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            );
        // The customer ships units back under this code; the first approval
        // on the order establishes it.
        if order_row.reverse_logistics_code.is_none() {
            update = update.col_expr(
                order::Column::ReverseLogisticsCode,
                Expr::value(Some(format!(
                    "RL-{}",
                    request.id.simple().to_string()[..8].to_uppercase()
                ))),
            );
        }
        let updated = update
            .filter(order::Column::Id.eq(order_row.id))
            .filter(order::Column::Status.eq(order_row.status))
            .filter(order::Column::Version.eq(order_row.version))
            .exec(&txn)
            .await?;
        if updated.rows_affected != 1 {
            return Err(ServiceError::ConcurrentModification(order_row.id));
        }

        let resolved = RefundRequest::update_many()
            .col_expr(
                refund_request::Column::Status,
                Expr::value(RefundRequestStatus::Approved),
            )
            .col_expr(
                refund_request::Column::ApprovedAmount,
                Expr::value(Some(amount)),
            )
            .col_expr(refund_request::Column::ResolvedAt, Expr::value(Some(now)))
            .filter(refund_request::Column::Id.eq(request.id))
            .filter(refund_request::Column::Status.eq(RefundRequestStatus::Processing))
            .exec(&txn)
            .await?;
        if resolved.rows_affected != 1 {
            return Err(ServiceError::ConcurrentModification(request.id));
        }

        history::record(
            &txn,
            order_row.id,
            Some(order_row.status),
            new_status,
            format!("Refund of {amount} approved and issued"),
            &Actor::Admin(admin_id),
        )
        .await?;

        txn.commit().await?;
        Ok(new_status)
    }

    /// Delivered orders are refundable within the configured window of the
    /// delivery timestamp; orders with no recorded delivery date stay
    /// eligible.
    fn check_return_window(&self, order_row: &order::Model) -> Result<(), ServiceError> {
        if order_row.status != OrderStatus::Delivered {
            return Ok(());
        }
        match order_row.delivered_at {
            None => Ok(()),
            Some(delivered) => {
                let deadline = delivered + Duration::days(self.config.return_window_days);
                if Utc::now() <= deadline {
                    Ok(())
                } else {
                    Err(ServiceError::InvalidOperation(format!(
                        "Return window closed on {}",
                        deadline.format("%Y-%m-%d")
                    )))
                }
            }
        }
    }
}
