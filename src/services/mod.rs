pub mod carts;
pub mod checkout;
pub mod coupons;
pub mod history;
pub mod order_status;
pub mod payments;
pub mod refunds;
pub mod stock;
