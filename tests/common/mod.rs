#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rust_decimal::Decimal;
use sea_orm::{ActiveModelTrait, ColumnTrait, EntityTrait, QueryFilter, Set};
use uuid::Uuid;

use storefront_core::{
    config::AppConfig,
    db,
    entities::{coupon, order, order_history, product},
    errors::ServiceError,
    events::EventSender,
    gateway::{PaymentGateway, WebhookEvent},
    services::payments::PaymentOutcome,
    shipping::TableRates,
    AppState,
};

/// In-memory gateway double that records every call and can be switched
/// into a failure mode.
#[derive(Default)]
pub struct FakeGateway {
    pub sessions: Mutex<Vec<Uuid>>,
    pub refunds: Mutex<Vec<(String, Decimal)>>,
    pub fail_sessions: AtomicBool,
    pub fail_refunds: AtomicBool,
    pub refund_delay_ms: AtomicU64,
}

impl FakeGateway {
    pub fn refund_calls(&self) -> Vec<(String, Decimal)> {
        self.refunds.lock().unwrap().clone()
    }

    pub fn set_fail_sessions(&self, fail: bool) {
        self.fail_sessions.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_refunds(&self, fail: bool) {
        self.fail_refunds.store(fail, Ordering::SeqCst);
    }

    /// Makes every `refund` call linger, widening the window in which a
    /// second caller can race the first.
    pub fn set_refund_delay_ms(&self, millis: u64) {
        self.refund_delay_ms.store(millis, Ordering::SeqCst);
    }
}

#[async_trait]
impl PaymentGateway for FakeGateway {
    async fn create_checkout_session(
        &self,
        order: &order::Model,
    ) -> Result<String, ServiceError> {
        if self.fail_sessions.load(Ordering::SeqCst) {
            return Err(ServiceError::GatewayUnavailable(
                "simulated gateway outage".to_string(),
            ));
        }
        self.sessions.lock().unwrap().push(order.id);
        Ok(format!("cs_{}", order.id.simple()))
    }

    async fn refund(
        &self,
        transaction_id: &str,
        amount: Decimal,
    ) -> Result<String, ServiceError> {
        let delay = self.refund_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(StdDuration::from_millis(delay)).await;
        }
        if self.fail_refunds.load(Ordering::SeqCst) {
            return Err(ServiceError::GatewayUnavailable(
                "simulated gateway outage".to_string(),
            ));
        }
        let mut refunds = self.refunds.lock().unwrap();
        refunds.push((transaction_id.to_string(), amount));
        Ok(format!("re_{}", refunds.len()))
    }
}

/// Test harness: fresh in-memory SQLite database per test, schema created
/// from the entity definitions, recording gateway double, table shipping
/// rates.
pub struct TestApp {
    pub state: AppState,
    pub gateway: Arc<FakeGateway>,
    _event_rx: tokio::sync::mpsc::Receiver<storefront_core::events::Event>,
}

impl TestApp {
    pub async fn new() -> Self {
        let config = Arc::new(AppConfig::for_tests("sqlite::memory:"));
        let pool = db::connect(&config)
            .await
            .expect("failed to create test database");

        let gateway = Arc::new(FakeGateway::default());
        let (events, event_rx) = EventSender::channel(64);

        let state = AppState::new(
            Arc::new(pool),
            config,
            Arc::new(TableRates),
            gateway.clone(),
            Arc::new(events),
        );

        Self {
            state,
            gateway,
            _event_rx: event_rx,
        }
    }

    pub async fn seed_product(&self, name: &str, price: Decimal, stock: i32) -> product::Model {
        let id = Uuid::new_v4();
        let now = Utc::now();
        product::ActiveModel {
            id: Set(id),
            name: Set(name.to_string()),
            sku: Set(format!("SKU-{}", id.simple().to_string()[..8].to_uppercase())),
            unit_price: Set(price),
            weight_grams: Set(500),
            stock_quantity: Set(stock),
            is_active: Set(true),
            created_at: Set(now),
            updated_at: Set(now),
            version: Set(1),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed product")
    }

    pub async fn seed_coupon(&self, code: &str, percent: i32) -> coupon::Model {
        coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_uppercase()),
            discount_percent: Set(percent),
            expires_at: Set(Utc::now() + Duration::days(30)),
            is_active: Set(true),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed coupon")
    }

    pub async fn seed_expired_coupon(&self, code: &str, percent: i32) -> coupon::Model {
        coupon::ActiveModel {
            id: Set(Uuid::new_v4()),
            code: Set(code.to_uppercase()),
            discount_percent: Set(percent),
            expires_at: Set(Utc::now() - Duration::days(1)),
            is_active: Set(true),
            created_at: Set(Utc::now()),
        }
        .insert(&*self.state.db)
        .await
        .expect("seed coupon")
    }

    pub async fn product(&self, id: Uuid) -> product::Model {
        product::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("query product")
            .expect("product exists")
    }

    pub async fn order(&self, id: Uuid) -> order::Model {
        order::Entity::find_by_id(id)
            .one(&*self.state.db)
            .await
            .expect("query order")
            .expect("order exists")
    }

    pub async fn history(&self, order_id: Uuid) -> Vec<order_history::Model> {
        order_history::Entity::find()
            .filter(order_history::Column::OrderId.eq(order_id))
            .all(&*self.state.db)
            .await
            .expect("query history")
    }

    /// Standard-carrier checkout input; the quote matches `TableRates` for
    /// light parcels.
    pub fn checkout_input(
        &self,
        customer_id: Uuid,
        coupon_code: Option<&str>,
    ) -> storefront_core::services::checkout::CheckoutInput {
        storefront_core::services::checkout::CheckoutInput {
            customer_id,
            shipping_address: "1 Market St, San Francisco, CA".to_string(),
            destination_zip: "10001".to_string(),
            shipping_method: "standard".to_string(),
            shipping_cost_quote: rust_decimal_macros::dec!(10.00),
            coupon_code: coupon_code.map(str::to_string),
            client_ip: Some("203.0.113.7".to_string()),
            user_agent: Some("integration-test".to_string()),
        }
    }

    /// Runs a checkout and confirms payment through the webhook path,
    /// returning the paid order.
    pub async fn paid_order(
        &self,
        customer_id: Uuid,
        items: &[(&product::Model, i32)],
    ) -> order::Model {
        for (product, qty) in items {
            self.state
                .carts
                .add_item(customer_id, product.id, *qty)
                .await
                .expect("add to cart");
        }
        let order = self
            .state
            .checkout
            .checkout(self.checkout_input(customer_id, None))
            .await
            .expect("checkout");

        let outcome = self
            .state
            .payments
            .confirm_payment(WebhookEvent {
                event: "payment.succeeded".to_string(),
                session_id: order.gateway_session_id.clone(),
                transaction_id: format!("tx_{}", order.id.simple()),
                amount_paid: order.total_amount,
            })
            .await
            .expect("confirm payment");

        match outcome {
            PaymentOutcome::Confirmed(order) => order,
            PaymentOutcome::AlreadyProcessed(_) => panic!("fresh order cannot be a replay"),
        }
    }
}
