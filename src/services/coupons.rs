use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter};
use tracing::{debug, instrument};
use uuid::Uuid;

use crate::entities::coupon::{self, Entity as Coupon};
use crate::entities::coupon_usage::{self, Entity as CouponUsage};
use crate::errors::ServiceError;

/// Validates coupon codes against the validity window and per-customer
/// one-time usage.
///
/// The usage pre-check here gives the customer a friendly error; the real
/// reuse guarantee is the (customer_id, coupon_code) primary key on the
/// usage table, which turns a race between two concurrent checkouts into a
/// constraint violation that checkout maps back to `CouponAlreadyUsed`.
#[derive(Clone)]
pub struct CouponValidator;

impl CouponValidator {
    /// Looks a code up case-insensitively and returns the coupon if it is
    /// active, unexpired, and unused by this customer.
    #[instrument(skip(self, conn))]
    pub async fn validate<C: ConnectionTrait>(
        &self,
        conn: &C,
        code: &str,
        customer_id: Uuid,
    ) -> Result<coupon::Model, ServiceError> {
        let normalized = code.trim().to_uppercase();

        let coupon = Coupon::find()
            .filter(coupon::Column::Code.eq(normalized.clone()))
            .one(conn)
            .await?
            .ok_or_else(|| ServiceError::CouponNotFound(normalized.clone()))?;

        if !coupon.is_valid_at(Utc::now()) {
            return Err(ServiceError::CouponExpired(normalized));
        }

        let used = CouponUsage::find()
            .filter(coupon_usage::Column::CustomerId.eq(customer_id))
            .filter(coupon_usage::Column::CouponCode.eq(normalized.clone()))
            .one(conn)
            .await?
            .is_some();
        if used {
            return Err(ServiceError::CouponAlreadyUsed(normalized));
        }

        debug!(code = %coupon.code, percent = coupon.discount_percent, "Coupon validated");
        Ok(coupon)
    }

    /// Discount on a subtotal: `subtotal x percent / 100`. The percentage is
    /// clamped to 0..=100 so a bad coupon row can never push a total negative.
    pub fn discount_for(coupon: &coupon::Model, sub_total: Decimal) -> Decimal {
        sub_total * Decimal::from(coupon.discount_percent.clamp(0, 100)) / Decimal::from(100)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn coupon(percent: i32) -> coupon::Model {
        coupon::Model {
            id: Uuid::new_v4(),
            code: "SAVE10".to_string(),
            discount_percent: percent,
            expires_at: Utc::now() + chrono::Duration::days(1),
            is_active: true,
            created_at: Utc::now(),
        }
    }

    #[rstest::rstest]
    #[case(10, dec!(50.00), dec!(5.00))]
    #[case(100, dec!(19.99), dec!(19.99))]
    #[case(15, dec!(100.00), dec!(15.00))]
    #[case(50, dec!(0.00), dec!(0.00))]
    fn discount_is_percentage_of_subtotal(
        #[case] percent: i32,
        #[case] sub_total: Decimal,
        #[case] expected: Decimal,
    ) {
        assert_eq!(CouponValidator::discount_for(&coupon(percent), sub_total), expected);
    }

    #[test]
    fn validity_window() {
        let mut c = coupon(10);
        assert!(c.is_valid_at(Utc::now()));

        c.is_active = false;
        assert!(!c.is_valid_at(Utc::now()));

        c.is_active = true;
        c.expires_at = Utc::now() - chrono::Duration::seconds(1);
        assert!(!c.is_valid_at(Utc::now()));
    }
}
