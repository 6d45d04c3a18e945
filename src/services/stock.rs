use chrono::Utc;
use sea_orm::sea_query::Expr;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::entities::product::{self, Entity as Product};
use crate::errors::ServiceError;

/// Atomic debit/replenish of per-product unit counts.
///
/// Both operations are a single conditional UPDATE guarded by the product's
/// optimistic version token, so concurrent writers never lose an update and
/// `stock_quantity >= 0` holds at all times. A pessimistic row lock is
/// deliberately not used here: the checkout path holds its transaction open
/// for coupon and order writes, and locking a popular product for that
/// duration would serialize unrelated checkouts.
///
/// The ledger only mutates the product row; rollback of partial multi-line
/// debits is the calling transaction's responsibility.
#[derive(Clone)]
pub struct StockLedger {
    retry_limit: u32,
}

impl StockLedger {
    pub fn new(retry_limit: u32) -> Self {
        Self { retry_limit }
    }

    /// Decrements stock for a product, failing with `InsufficientStock` when
    /// fewer than `quantity` units remain. Returns the new quantity.
    ///
    /// On a version conflict the debit is re-read and retried up to the
    /// configured bound, then surfaced as `ConcurrentModification` so the
    /// caller can retry the whole request against fresh stock levels.
    #[instrument(skip(self, conn))]
    pub async fn debit<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<i32, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Debit quantity must be positive".to_string(),
            ));
        }

        for attempt in 0..=self.retry_limit {
            let current = Product::find_by_id(product_id)
                .one(conn)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Product {product_id}")))?;

            if current.stock_quantity < quantity {
                return Err(ServiceError::InsufficientStock {
                    product_id,
                    requested: quantity,
                    available: current.stock_quantity,
                });
            }

            // "Decrement if stock_quantity >= quantity" in one statement; the
            // version predicate detects interleaved writers.
            let result = Product::update_many()
                .col_expr(
                    product::Column::StockQuantity,
                    Expr::col(product::Column::StockQuantity).sub(quantity),
                )
                .col_expr(
                    product::Column::Version,
                    Expr::col(product::Column::Version).add(1),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(product::Column::Id.eq(product_id))
                .filter(product::Column::Version.eq(current.version))
                .filter(product::Column::StockQuantity.gte(quantity))
                .exec(conn)
                .await?;

            if result.rows_affected == 1 {
                let remaining = current.stock_quantity - quantity;
                debug!(%product_id, quantity, remaining, "Stock debited");
                return Ok(remaining);
            }

            warn!(%product_id, attempt, "Stock debit version conflict, retrying");
        }

        Err(ServiceError::ConcurrentModification(product_id))
    }

    /// Increments stock for a product, used on refund and cancellation.
    /// Never fails for business reasons. Returns the new quantity.
    #[instrument(skip(self, conn))]
    pub async fn replenish<C: ConnectionTrait>(
        &self,
        conn: &C,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<i32, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Replenish quantity must be positive".to_string(),
            ));
        }

        for attempt in 0..=self.retry_limit {
            let current = Product::find_by_id(product_id)
                .one(conn)
                .await?
                .ok_or_else(|| ServiceError::NotFound(format!("Product {product_id}")))?;

            let result = Product::update_many()
                .col_expr(
                    product::Column::StockQuantity,
                    Expr::col(product::Column::StockQuantity).add(quantity),
                )
                .col_expr(
                    product::Column::Version,
                    Expr::col(product::Column::Version).add(1),
                )
                .col_expr(product::Column::UpdatedAt, Expr::value(Utc::now()))
                .filter(product::Column::Id.eq(product_id))
                .filter(product::Column::Version.eq(current.version))
                .exec(conn)
                .await?;

            if result.rows_affected == 1 {
                let remaining = current.stock_quantity + quantity;
                debug!(%product_id, quantity, remaining, "Stock replenished");
                return Ok(remaining);
            }

            warn!(%product_id, attempt, "Stock replenish version conflict, retrying");
        }

        Err(ServiceError::ConcurrentModification(product_id))
    }
}
