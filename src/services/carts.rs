use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, ModelTrait,
    QueryFilter, Set,
};
use serde::Serialize;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::entities::cart::{self, Entity as Cart};
use crate::entities::cart_item::{self, Entity as CartItem};
use crate::entities::product::{self, Entity as Product};
use crate::errors::ServiceError;

/// Priced view of one cart line, joined against the live product.
#[derive(Debug, Clone, Serialize)]
pub struct CartLine {
    pub product_id: Uuid,
    pub name: String,
    pub unit_price: Decimal,
    pub quantity: i32,
    pub line_total: Decimal,
}

#[derive(Debug, Clone, Serialize)]
pub struct CartView {
    pub cart_id: Uuid,
    pub lines: Vec<CartLine>,
    pub sub_total: Decimal,
}

/// Cart management: one cart per customer, created on first add, cleared by
/// checkout. A product appears at most once per cart; repeated adds
/// accumulate the quantity on the existing line.
#[derive(Clone)]
pub struct CartService {
    db: Arc<DatabaseConnection>,
}

impl CartService {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    /// Adds units of a product to the customer's cart, creating the cart on
    /// first use. Inactive products cannot be added.
    #[instrument(skip(self))]
    pub async fn add_item(
        &self,
        customer_id: Uuid,
        product_id: Uuid,
        quantity: i32,
    ) -> Result<CartView, ServiceError> {
        if quantity <= 0 {
            return Err(ServiceError::ValidationError(
                "Quantity must be positive".to_string(),
            ));
        }

        let product = Product::find_by_id(product_id)
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Product {product_id}")))?;
        if !product.is_active {
            return Err(ServiceError::InvalidOperation(format!(
                "Product {} is not available",
                product.name
            )));
        }

        let cart = self.find_or_create_cart(customer_id).await?;

        match CartItem::find_by_id((cart.id, product_id))
            .one(&*self.db)
            .await?
        {
            Some(existing) => {
                let new_quantity = existing.quantity + quantity;
                let mut item: cart_item::ActiveModel = existing.into();
                item.quantity = Set(new_quantity);
                item.updated_at = Set(Utc::now());
                item.update(&*self.db).await?;
            }
            None => {
                let item = cart_item::ActiveModel {
                    cart_id: Set(cart.id),
                    product_id: Set(product_id),
                    quantity: Set(quantity),
                    created_at: Set(Utc::now()),
                    updated_at: Set(Utc::now()),
                };
                item.insert(&*self.db).await?;
            }
        }

        info!(%customer_id, %product_id, quantity, "Cart item added");
        self.get_cart(customer_id).await
    }

    /// Removes a product line from the customer's cart.
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        customer_id: Uuid,
        product_id: Uuid,
    ) -> Result<CartView, ServiceError> {
        let cart = self
            .cart_for(customer_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart for customer {customer_id}")))?;

        let item = CartItem::find_by_id((cart.id, product_id))
            .one(&*self.db)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart item {product_id}")))?;
        item.delete(&*self.db).await?;

        self.get_cart(customer_id).await
    }

    /// Priced snapshot of the customer's cart, joined against current
    /// product names and prices.
    #[instrument(skip(self))]
    pub async fn get_cart(&self, customer_id: Uuid) -> Result<CartView, ServiceError> {
        let cart = self
            .cart_for(customer_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Cart for customer {customer_id}")))?;

        let rows = CartItem::find()
            .filter(cart_item::Column::CartId.eq(cart.id))
            .find_also_related(Product)
            .all(&*self.db)
            .await?;

        let mut lines = Vec::with_capacity(rows.len());
        let mut sub_total = Decimal::ZERO;
        for (item, product) in rows {
            let product = product.ok_or_else(|| {
                ServiceError::InternalError(format!("Cart references missing product {}", item.product_id))
            })?;
            let line_total = product.unit_price * Decimal::from(item.quantity);
            sub_total += line_total;
            lines.push(CartLine {
                product_id: product.id,
                name: product.name,
                unit_price: product.unit_price,
                quantity: item.quantity,
                line_total,
            });
        }

        Ok(CartView {
            cart_id: cart.id,
            lines,
            sub_total,
        })
    }

    pub async fn cart_for(&self, customer_id: Uuid) -> Result<Option<cart::Model>, ServiceError> {
        Ok(Cart::find()
            .filter(cart::Column::CustomerId.eq(customer_id))
            .one(&*self.db)
            .await?)
    }

    async fn find_or_create_cart(&self, customer_id: Uuid) -> Result<cart::Model, ServiceError> {
        if let Some(cart) = self.cart_for(customer_id).await? {
            return Ok(cart);
        }

        let cart = cart::ActiveModel {
            id: Set(Uuid::new_v4()),
            customer_id: Set(customer_id),
            created_at: Set(Utc::now()),
            updated_at: Set(Utc::now()),
        };
        Ok(cart.insert(&*self.db).await?)
    }

    /// Deletes the cart and its items inside the caller's transaction.
    /// Checkout calls this so the clear commits atomically with the order.
    pub(crate) async fn clear<C: ConnectionTrait>(
        conn: &C,
        cart_id: Uuid,
    ) -> Result<(), ServiceError> {
        CartItem::delete_many()
            .filter(cart_item::Column::CartId.eq(cart_id))
            .exec(conn)
            .await?;
        Cart::delete_by_id(cart_id).exec(conn).await?;
        Ok(())
    }
}
