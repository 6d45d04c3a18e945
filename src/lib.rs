//! Order lifecycle and financial-consistency engine for a multi-vendor
//! storefront.
//!
//! This crate owns the hard part of the store: converting a cart into an
//! order while locking stock, validating coupons, and computing totals in
//! one atomic step, then advancing that order through payment confirmation,
//! shipment, and full or partial refunds without ever double-debiting stock,
//! double-refunding money, or letting a coupon be reused. HTTP routing,
//! authentication, templating, and CMS concerns live in adapter crates that
//! call into the services here.

use std::sync::Arc;

use sea_orm::DatabaseConnection;

pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod gateway;
pub mod services;
pub mod shipping;

use config::AppConfig;
use events::EventSender;
use gateway::PaymentGateway;
use services::{
    carts::CartService, checkout::CheckoutService, order_status::OrderStatusService,
    payments::PaymentService, refunds::RefundService,
};
use shipping::ShippingRates;

/// Service container handed to adapters. All services share the connection
/// pool, the immutable configuration, and the event channel.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: Arc<AppConfig>,
    pub carts: CartService,
    pub checkout: CheckoutService,
    pub payments: PaymentService,
    pub refunds: RefundService,
    pub order_status: OrderStatusService,
}

impl AppState {
    pub fn new(
        db: Arc<DatabaseConnection>,
        config: Arc<AppConfig>,
        rates: Arc<dyn ShippingRates>,
        gateway: Arc<dyn PaymentGateway>,
        events: Arc<EventSender>,
    ) -> Self {
        Self {
            carts: CartService::new(db.clone()),
            checkout: CheckoutService::new(
                db.clone(),
                config.clone(),
                rates,
                gateway.clone(),
                events.clone(),
            ),
            payments: PaymentService::new(db.clone(), events.clone()),
            refunds: RefundService::new(db.clone(), config.clone(), gateway, events.clone()),
            order_status: OrderStatusService::new(db.clone(), config.clone(), events),
            db,
            config,
        }
    }
}

/// Initializes the tracing subscriber from the configured log level,
/// honoring `RUST_LOG` when set.
pub fn init_tracing(config: &AppConfig) {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.clone()));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
