use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order aggregate root. Line items are an immutable snapshot taken at
/// checkout time; later product edits never alter historical orders.
/// Rows are never deleted — an order is a financial record.
#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub order_number: String,
    pub customer_id: Uuid,
    pub status: OrderStatus,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub sub_total: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub discount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub shipping_cost: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub total_amount: Decimal,
    pub coupon_code: Option<String>,
    #[sea_orm(column_type = "Text")]
    pub shipping_address: String,
    pub shipping_method: String,
    pub tracking_number: Option<String>,
    pub reverse_logistics_code: Option<String>,
    pub refund_type: RefundType,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub refund_requested_amount: Decimal,
    #[sea_orm(column_type = "Decimal(Some((16, 4)))")]
    pub refunded_amount: Decimal,
    pub rejection_reason: Option<String>,
    pub gateway_session_id: Option<String>,
    pub gateway_transaction_id: Option<String>,
    pub payment_warning: Option<String>,
    pub delivered_at: Option<DateTime<Utc>>,
    pub client_ip: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub version: i32,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItems,
    #[sea_orm(has_many = "super::order_history::Entity")]
    History,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItems.def()
    }
}

impl Related<super::order_history::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::History.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

/// Order status state machine.
///
/// Main line: Pending -> Paid -> Shipped -> Delivered.
/// Side branches: Pending/Paid/Shipped -> Cancelled;
/// Paid/Shipped/Delivered/PartiallyRefunded -> RefundRequested ->
/// Refunded | PartiallyRefunded | back to the prior post-payment status
/// when the refund request is rejected.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(24))")]
pub enum OrderStatus {
    #[sea_orm(string_value = "pending")]
    Pending,
    #[sea_orm(string_value = "paid")]
    Paid,
    #[sea_orm(string_value = "shipped")]
    Shipped,
    #[sea_orm(string_value = "delivered")]
    Delivered,
    #[sea_orm(string_value = "cancelled")]
    Cancelled,
    #[sea_orm(string_value = "refund_requested")]
    RefundRequested,
    #[sea_orm(string_value = "refunded")]
    Refunded,
    #[sea_orm(string_value = "partially_refunded")]
    PartiallyRefunded,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Paid => "paid",
            OrderStatus::Shipped => "shipped",
            OrderStatus::Delivered => "delivered",
            OrderStatus::Cancelled => "cancelled",
            OrderStatus::RefundRequested => "refund_requested",
            OrderStatus::Refunded => "refunded",
            OrderStatus::PartiallyRefunded => "partially_refunded",
        }
    }

    /// Whether the order has been paid for at some point in its life.
    /// RefundRequested and PartiallyRefunded are post-payment by construction.
    pub fn is_post_payment(&self) -> bool {
        matches!(
            self,
            OrderStatus::Paid
                | OrderStatus::Shipped
                | OrderStatus::Delivered
                | OrderStatus::RefundRequested
                | OrderStatus::PartiallyRefunded
                | OrderStatus::Refunded
        )
    }

    /// Terminal states admit no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Cancelled | OrderStatus::Refunded)
    }

    /// The transition table. Everything not listed here is rejected with
    /// `InvalidStateTransition` before any mutation happens.
    pub fn can_transition_to(&self, next: OrderStatus) -> bool {
        use OrderStatus::*;
        match (*self, next) {
            (Pending, Paid) => true,
            (Paid, Shipped) => true,
            (Shipped, Delivered) => true,

            (Pending, Cancelled) | (Paid, Cancelled) | (Shipped, Cancelled) => true,

            (Paid, RefundRequested)
            | (Shipped, RefundRequested)
            | (Delivered, RefundRequested)
            | (PartiallyRefunded, RefundRequested) => true,

            (RefundRequested, Refunded) | (RefundRequested, PartiallyRefunded) => true,
            // Rejection resolves the request back to the prior post-payment status.
            (RefundRequested, Paid)
            | (RefundRequested, Shipped)
            | (RefundRequested, Delivered) => true,

            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Refund disposition recorded on the order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumIter, DeriveActiveEnum,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(12))")]
pub enum RefundType {
    #[sea_orm(string_value = "none")]
    None,
    #[sea_orm(string_value = "total")]
    Total,
    #[sea_orm(string_value = "partial")]
    Partial,
}
