pub mod cart;
pub mod cart_item;
pub mod coupon;
pub mod coupon_usage;
pub mod order;
pub mod order_history;
pub mod order_item;
pub mod product;
pub mod refund_request;
pub mod refund_request_item;

pub use cart::Entity as Cart;
pub use cart_item::Entity as CartItem;
pub use coupon::Entity as Coupon;
pub use coupon_usage::Entity as CouponUsage;
pub use order::Entity as Order;
pub use order_history::Entity as OrderHistory;
pub use order_item::Entity as OrderItem;
pub use product::Entity as Product;
pub use refund_request::Entity as RefundRequest;
pub use refund_request_item::Entity as RefundRequestItem;
