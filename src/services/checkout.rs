use std::sync::Arc;

use chrono::Utc;
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
use crate::entities::cart::{self, Entity as Cart};
use crate::entities::cart_item::{self, Entity as CartItem};
use crate::entities::coupon_usage;
use crate::entities::order::{self, Entity as Order, OrderStatus, RefundType};
use crate::entities::order_history::Actor;
use crate::entities::order_item;
use crate::entities::product::Entity as Product;
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::gateway::PaymentGateway;
use crate::services::coupons::CouponValidator;
use crate::services::history;
use crate::services::stock::StockLedger;
use crate::shipping::{Parcel, ShippingRates};

#[derive(Debug, Deserialize, Validate)]
pub struct CheckoutInput {
    pub customer_id: Uuid,
    #[validate(length(min = 1, message = "Shipping address is required"))]
    pub shipping_address: String,
    #[validate(length(min = 3, message = "Destination postal code is required"))]
    pub destination_zip: String,
    /// Carrier chosen from the quoted options.
    #[validate(length(min = 1, message = "Shipping method is required"))]
    pub shipping_method: String,
    /// Price the caller saw when choosing the method. Re-validated against a
    /// fresh quote, never trusted blindly.
    pub shipping_cost_quote: Decimal,
    pub coupon_code: Option<String>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
}

/// Checkout orchestrator: converts the customer's cart into a pending order
/// in one atomic step.
///
/// Everything — stock debits, coupon usage, order + item snapshot, cart
/// clear, initial history row — happens inside a single transaction. A
/// failure at any step rolls the whole thing back: no stock debited, no
/// coupon marked used, no order persisted. The gateway session is opened
/// only after the commit; if that fails the order is cancelled and
/// restocked rather than left pending without a way to pay.
#[derive(Clone)]
pub struct CheckoutService {
    db: Arc<DatabaseConnection>,
    config: Arc<AppConfig>,
    stock: StockLedger,
    coupons: CouponValidator,
    rates: Arc<dyn ShippingRates>,
    gateway: Arc<dyn PaymentGateway>,
    events: Arc<EventSender>,
}

impl CheckoutService {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        rates: Arc<dyn ShippingRates>,
        gateway: Arc<dyn PaymentGateway>,
        events: Arc<EventSender>,
    ) -> Self {
        let stock = StockLedger::new(config.stock_retry_limit);
        Self {
            db,
            config,
            stock,
            coupons: CouponValidator,
            rates,
            gateway,
            events,
        }
    }

    #[instrument(skip(self, input), fields(customer_id = %input.customer_id))]
    pub async fn checkout(&self, input: CheckoutInput) -> Result<order::Model, ServiceError> {
        input.validate()?;

        let txn = self.db.begin().await?;

        // Step 1: load the cart with items and current product prices/stock.
        let cart_model = Cart::find()
            .filter(cart::Column::CustomerId.eq(input.customer_id))
            .one(&txn)
            .await?
            .ok_or_else(|| {
                ServiceError::InvalidOperation("Cart is empty".to_string())
            })?;

        let lines = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart_model.id))
            .find_also_related(Product)
            .all(&txn)
            .await?;
        if lines.is_empty() {
            return Err(ServiceError::InvalidOperation("Cart is empty".to_string()));
        }

        // Step 2: debit stock per line. The first InsufficientStock aborts
        // the transaction, so earlier debits never persist.
        let mut snapshot = Vec::with_capacity(lines.len());
        let mut parcels = Vec::with_capacity(lines.len());
        let mut debits = Vec::with_capacity(lines.len());
        let mut sub_total = Decimal::ZERO;
        for (item, product) in &lines {
            let product = product.as_ref().ok_or_else(|| {
                ServiceError::InternalError(format!(
                    "Cart references missing product {}",
                    item.product_id
                ))
            })?;

            let remaining = self.stock.debit(&txn, product.id, item.quantity).await?;
            debits.push((product.id, item.quantity, remaining));

            sub_total += product.unit_price * Decimal::from(item.quantity);
            parcels.push(Parcel {
                weight_grams: product.weight_grams,
                quantity: item.quantity,
            });
            snapshot.push((product.id, product.name.clone(), product.unit_price, item.quantity));
        }

        // Step 3: coupon validation and discount.
        let coupon = match &input.coupon_code {
            Some(code) => Some(self.coupons.validate(&txn, code, input.customer_id).await?),
            None => None,
        };
        let discount = coupon
            .as_ref()
            .map(|c| CouponValidator::discount_for(c, sub_total))
            .unwrap_or(Decimal::ZERO);

        // Re-validate the caller-supplied shipping quote against a fresh one.
        let options = self
            .rates
            .quote(&self.config.origin_zip, &input.destination_zip, &parcels);
        let chosen = options
            .iter()
            .find(|o| o.carrier == input.shipping_method)
            .ok_or_else(|| {
                ServiceError::ValidationError(format!(
                    "Unknown shipping method: {}",
                    input.shipping_method
                ))
            })?;
        if chosen.price != input.shipping_cost_quote {
            return Err(ServiceError::ValidationError(format!(
                "Shipping quote changed: expected {}, got {}",
                chosen.price, input.shipping_cost_quote
            )));
        }

        // Step 4: totals. discount <= sub_total because percentages cap at 100.
        let total_amount = sub_total - discount + chosen.price;

        // Step 5: create the order with an immutable line-item snapshot.
        let order_id = Uuid::new_v4();
        let now = Utc::now();
        let order_model = order::ActiveModel {
            id: Set(order_id),
            order_number: Set(format!(
                "ORD-{}",
                order_id.simple().to_string()[..8].to_uppercase()
            )),
            customer_id: Set(input.customer_id),
            status: Set(OrderStatus::Pending),
            sub_total: Set(sub_total),
            discount: Set(discount),
            shipping_cost: Set(chosen.price),
            total_amount: Set(total_amount),
            coupon_code: Set(coupon.as_ref().map(|c| c.code.clone())),
            shipping_address: Set(input.shipping_address.clone()),
            shipping_method: Set(input.shipping_method.clone()),
            tracking_number: Set(None),
            reverse_logistics_code: Set(None),
            refund_type: Set(RefundType::None),
            refund_requested_amount: Set(Decimal::ZERO),
            refunded_amount: Set(Decimal::ZERO),
            rejection_reason: Set(None),
            gateway_session_id: Set(None),
            gateway_transaction_id: Set(None),
            payment_warning: Set(None),
            delivered_at: Set(None),
            client_ip: Set(input.client_ip.clone()),
            user_agent: Set(input.user_agent.clone()),
            created_at: Set(now),
            updated_at: Set(Some(now)),
            version: Set(1),
        };
        let mut order_row = order_model.insert(&txn).await?;

        for (product_id, name, unit_price, quantity) in snapshot {
            let item = order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                product_id: Set(product_id),
                name: Set(name),
                unit_price: Set(unit_price),
                quantity: Set(quantity),
                refund_quantity: Set(0),
                created_at: Set(now),
            };
            item.insert(&txn).await?;
        }

        // Step 6: record coupon usage in the same transaction. The composite
        // primary key turns a concurrent reuse into a constraint violation.
        if let Some(coupon) = &coupon {
            let usage = coupon_usage::ActiveModel {
                customer_id: Set(input.customer_id),
                coupon_code: Set(coupon.code.clone()),
                order_id: Set(order_id),
                created_at: Set(now),
            };
            usage.insert(&txn).await.map_err(|e| {
                if matches!(
                    e.sql_err(),
                    Some(sea_orm::SqlErr::UniqueConstraintViolation(_))
                ) {
                    ServiceError::CouponAlreadyUsed(coupon.code.clone())
                } else {
                    ServiceError::DatabaseError(e)
                }
            })?;
        }

        // Step 7: clear the cart.
        super::carts::CartService::clear(&txn, cart_model.id).await?;

        // Step 8: initial history row, same transaction as the order.
        history::record(
            &txn,
            order_id,
            None,
            OrderStatus::Pending,
            "Order placed",
            &Actor::Customer(input.customer_id),
        )
        .await?;

        txn.commit().await?;

        // The gateway session is opened after the commit so a slow gateway
        // never holds the checkout transaction open. An order without a
        // session cannot be paid, so a gateway failure here is compensated
        // by cancelling the order and returning its stock.
        let session_id = match self.gateway.create_checkout_session(&order_row).await {
            Ok(session_id) => session_id,
            Err(e) => {
                error!(%order_id, error = %e, "Gateway session failed, cancelling order");
                if let Err(cancel_err) = self.cancel_unpayable(order_id, &debits).await {
                    error!(
                        %order_id,
                        error = %cancel_err,
                        "Failed to cancel unpayable order, manual reconciliation needed"
                    );
                }
                return Err(e);
            }
        };
        let mut active: order::ActiveModel = order_row.into();
        active.gateway_session_id = Set(Some(session_id));
        order_row = active.update(&*self.db).await?;

        info!(%order_id, customer_id = %input.customer_id, %total_amount, "Checkout completed");

        self.events.send_or_log(Event::OrderCreated(order_id)).await;
        for (product_id, quantity, remaining) in debits {
            self.events
                .send_or_log(Event::StockDebited {
                    product_id,
                    quantity,
                    remaining,
                })
                .await;
        }
        if let Some(coupon) = &coupon {
            self.events
                .send_or_log(Event::CouponRedeemed {
                    customer_id: input.customer_id,
                    code: coupon.code.clone(),
                    order_id,
                })
                .await;
        }

        Ok(order_row)
    }

    /// Compensating action for a failed session creation: restock every
    /// debited line and move the freshly committed order to Cancelled.
    async fn cancel_unpayable(
        &self,
        order_id: Uuid,
        debits: &[(Uuid, i32, i32)],
    ) -> Result<(), ServiceError> {
        let txn = self.db.begin().await?;

        for (product_id, quantity, _) in debits {
            self.stock.replenish(&txn, *product_id, *quantity).await?;
        }

        let result = Order::update_many()
            .col_expr(order::Column::Status, Expr::value(OrderStatus::Cancelled))
            .col_expr(order::Column::UpdatedAt, Expr::value(Some(Utc::now())))
            .col_expr(
                order::Column::Version,
                Expr::col(order::Column::Version).add(1),
            )
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::Status.eq(OrderStatus::Pending))
            .exec(&txn)
            .await?;
        if result.rows_affected != 1 {
            return Err(ServiceError::ConcurrentModification(order_id));
        }

        history::record(
            &txn,
            order_id,
            Some(OrderStatus::Pending),
            OrderStatus::Cancelled,
            "Order cancelled: payment session could not be created",
            &Actor::System,
        )
        .await?;

        txn.commit().await?;
        Ok(())
    }
}
