use chrono::Utc;
use sea_orm::{ActiveModelTrait, ConnectionTrait, Set};
use uuid::Uuid;

use crate::entities::order::OrderStatus;
use crate::entities::order_history::{self, Actor};
use crate::errors::ServiceError;

/// Appends one audit row. Callers pass their open transaction so the history
/// row and the order mutation commit or roll back together — never write one
/// without the other.
pub async fn record<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    previous_status: Option<OrderStatus>,
    new_status: OrderStatus,
    message: impl Into<String>,
    actor: &Actor,
) -> Result<order_history::Model, ServiceError> {
    let row = order_history::ActiveModel {
        id: Set(Uuid::new_v4()),
        order_id: Set(order_id),
        previous_status: Set(previous_status),
        new_status: Set(new_status),
        message: Set(message.into()),
        actor: Set(actor.to_string()),
        created_at: Set(Utc::now()),
    };
    Ok(row.insert(conn).await?)
}

/// Audit-only entry for events that change no status, e.g. a failed refund
/// attempt that support staff must be able to see.
pub async fn record_note<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    status: OrderStatus,
    message: impl Into<String>,
    actor: &Actor,
) -> Result<order_history::Model, ServiceError> {
    record(conn, order_id, Some(status), status, message, actor).await
}
