//! Refund orchestration: request/resolve, restocking, gateway-first ordering.

mod common;

use assert_matches::assert_matches;
use common::TestApp;
use rust_decimal_macros::dec;
use sea_orm::{ColumnTrait, EntityTrait, QueryFilter};
use storefront_core::entities::order::{OrderStatus, RefundType};
use storefront_core::entities::{order_item, refund_request};
use storefront_core::entities::refund_request::RefundRequestStatus;
use storefront_core::errors::ServiceError;
use storefront_core::services::refunds::{RefundInput, RefundItemInput, ResolveInput};
use uuid::Uuid;

fn total_refund(order_id: Uuid, customer_id: Uuid) -> RefundInput {
    RefundInput {
        order_id,
        customer_id,
        refund_type: RefundType::Total,
        items: vec![],
        reason: Some("changed my mind".to_string()),
    }
}

fn approve(request_id: Uuid) -> ResolveInput {
    ResolveInput {
        refund_request_id: request_id,
        admin_id: Uuid::new_v4(),
        approve: true,
        reason: None,
        approved_quantities: None,
    }
}

async fn order_items(app: &TestApp, order_id: Uuid) -> Vec<order_item::Model> {
    order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order_id))
        .all(&*app.state.db)
        .await
        .unwrap()
}

#[tokio::test]
async fn total_refund_restocks_and_refunds_order_total() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_product("Monitor", dec!(200.00), 5).await;
    let order = app.paid_order(customer, &[(&product, 2)]).await;
    assert_eq!(app.product(product.id).await.stock_quantity, 3);

    let request = app
        .state
        .refunds
        .request_refund(total_refund(order.id, customer))
        .await
        .unwrap();
    assert_eq!(request.status, RefundRequestStatus::Pending);
    assert_eq!(request.requested_amount, order.total_amount);
    assert_eq!(
        app.order(order.id).await.status,
        OrderStatus::RefundRequested
    );
    // Requesting alone moves no money and no stock.
    assert_eq!(app.product(product.id).await.stock_quantity, 3);
    assert!(app.gateway.refund_calls().is_empty());

    app.state.refunds.resolve_refund(approve(request.id)).await.unwrap();

    let refunded = app.order(order.id).await;
    assert_eq!(refunded.status, OrderStatus::Refunded);
    assert_eq!(refunded.refunded_amount, order.total_amount);
    assert!(refunded
        .reverse_logistics_code
        .as_deref()
        .is_some_and(|code| code.starts_with("RL-")));
    assert_eq!(app.product(product.id).await.stock_quantity, 5);

    let calls = app.gateway.refund_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, order.total_amount);

    let items = order_items(&app, order.id).await;
    assert_eq!(items[0].refund_quantity, items[0].quantity);
}

#[tokio::test]
async fn partial_refund_of_one_unit() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product_a = app.seed_product("Keyboard", dec!(60.00), 10).await;
    let product_b = app.seed_product("Mouse", dec!(25.00), 10).await;
    let order = app
        .paid_order(customer, &[(&product_a, 3), (&product_b, 2)])
        .await;
    let stock_after_checkout = app.product(product_a.id).await.stock_quantity;

    let items = order_items(&app, order.id).await;
    let item_a = items.iter().find(|i| i.product_id == product_a.id).unwrap();

    let request = app
        .state
        .refunds
        .request_refund(RefundInput {
            order_id: order.id,
            customer_id: customer,
            refund_type: RefundType::Partial,
            items: vec![RefundItemInput {
                order_item_id: item_a.id,
                quantity: 1,
            }],
            reason: None,
        })
        .await
        .unwrap();
    assert_eq!(request.requested_amount, dec!(60.00));

    app.state.refunds.resolve_refund(approve(request.id)).await.unwrap();

    let order_after = app.order(order.id).await;
    assert_eq!(order_after.status, OrderStatus::PartiallyRefunded);
    assert_eq!(order_after.refunded_amount, dec!(60.00));

    let items = order_items(&app, order.id).await;
    let item_a = items.iter().find(|i| i.product_id == product_a.id).unwrap();
    assert_eq!(item_a.refund_quantity, 1);
    assert_eq!(
        app.product(product_a.id).await.stock_quantity,
        stock_after_checkout + 1
    );
    // The untouched line is unaffected.
    assert_eq!(app.product(product_b.id).await.stock_quantity, 8);
}

#[tokio::test]
async fn partial_refunds_never_exceed_purchased_quantity() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_product("Cable", dec!(10.00), 10).await;
    let order = app.paid_order(customer, &[(&product, 2)]).await;
    let item_id = order_items(&app, order.id).await[0].id;

    // Refund both units one at a time.
    for _ in 0..2 {
        let request = app
            .state
            .refunds
            .request_refund(RefundInput {
                order_id: order.id,
                customer_id: customer,
                refund_type: RefundType::Partial,
                items: vec![RefundItemInput {
                    order_item_id: item_id,
                    quantity: 1,
                }],
                reason: None,
            })
            .await
            .unwrap();
        app.state.refunds.resolve_refund(approve(request.id)).await.unwrap();
    }

    let item = &order_items(&app, order.id).await[0];
    assert_eq!(item.refund_quantity, item.quantity);
    assert_eq!(app.order(order.id).await.status, OrderStatus::Refunded);

    // Nothing left: a third request is rejected before touching anything.
    let err = app
        .state
        .refunds
        .request_refund(RefundInput {
            order_id: order.id,
            customer_id: customer,
            refund_type: RefundType::Partial,
            items: vec![RefundItemInput {
                order_item_id: item_id,
                quantity: 1,
            }],
            reason: None,
        })
        .await
        .unwrap_err();
    // A fully refunded order is terminal.
    assert_matches!(err, ServiceError::InvalidStateTransition { .. });
}

#[tokio::test]
async fn over_quantity_partial_request_is_rejected() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_product("Stand", dec!(35.00), 10).await;
    let order = app.paid_order(customer, &[(&product, 2)]).await;
    let item_id = order_items(&app, order.id).await[0].id;

    let err = app
        .state
        .refunds
        .request_refund(RefundInput {
            order_id: order.id,
            customer_id: customer,
            refund_type: RefundType::Partial,
            items: vec![RefundItemInput {
                order_item_id: item_id,
                quantity: 3,
            }],
            reason: None,
        })
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::RefundExceedsAvailable(_));
    assert_eq!(app.order(order.id).await.status, OrderStatus::Paid);
}

#[tokio::test]
async fn rejection_restores_prior_status_and_stores_reason() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_product("Speaker", dec!(80.00), 5).await;
    let order = app.paid_order(customer, &[(&product, 1)]).await;

    let request = app
        .state
        .refunds
        .request_refund(total_refund(order.id, customer))
        .await
        .unwrap();

    app.state
        .refunds
        .resolve_refund(ResolveInput {
            refund_request_id: request.id,
            admin_id: Uuid::new_v4(),
            approve: false,
            reason: Some("outside policy".to_string()),
            approved_quantities: None,
        })
        .await
        .unwrap();

    let order_after = app.order(order.id).await;
    assert_eq!(order_after.status, OrderStatus::Paid);
    assert_eq!(order_after.rejection_reason.as_deref(), Some("outside policy"));
    assert_eq!(order_after.refunded_amount, dec!(0.00));

    // No gateway call, no restock.
    assert!(app.gateway.refund_calls().is_empty());
    assert_eq!(app.product(product.id).await.stock_quantity, 4);

    let request_after = refund_request::Entity::find_by_id(request.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request_after.status, RefundRequestStatus::Rejected);
    assert!(request_after.resolved_at.is_some());

    // The resolved request cannot be resolved twice.
    let err = app
        .state
        .refunds
        .resolve_refund(approve(request.id))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidOperation(_));
}

#[tokio::test]
async fn gateway_failure_leaves_state_untouched_but_audited() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_product("Webcam", dec!(45.00), 5).await;
    let order = app.paid_order(customer, &[(&product, 1)]).await;

    let request = app
        .state
        .refunds
        .request_refund(total_refund(order.id, customer))
        .await
        .unwrap();

    app.gateway.set_fail_refunds(true);
    let err = app
        .state
        .refunds
        .resolve_refund(approve(request.id))
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::GatewayUnavailable(_));

    // Nothing moved: status, stock, amounts, request all unchanged.
    let order_after = app.order(order.id).await;
    assert_eq!(order_after.status, OrderStatus::RefundRequested);
    assert_eq!(order_after.refunded_amount, dec!(0.00));
    assert_eq!(app.product(product.id).await.stock_quantity, 4);
    let request_after = refund_request::Entity::find_by_id(request.id)
        .one(&*app.state.db)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(request_after.status, RefundRequestStatus::Pending);

    // But the attempt is visible to support staff.
    let history = app.history(order.id).await;
    assert!(history
        .iter()
        .any(|h| h.message.contains("Refund attempt") && h.message.contains("failed")));

    // Once the gateway recovers the same request can be approved.
    app.gateway.set_fail_refunds(false);
    app.state.refunds.resolve_refund(approve(request.id)).await.unwrap();
    assert_eq!(app.order(order.id).await.status, OrderStatus::Refunded);
}

#[tokio::test]
async fn concurrent_approvals_charge_the_gateway_once() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_product("Headset", dec!(120.00), 5).await;
    let order = app.paid_order(customer, &[(&product, 1)]).await;

    let request = app
        .state
        .refunds
        .request_refund(total_refund(order.id, customer))
        .await
        .unwrap();

    // Hold the first approval inside the gateway call long enough for the
    // second to arrive while it is still in flight.
    app.gateway.set_refund_delay_ms(100);

    let refunds_a = app.state.refunds.clone();
    let refunds_b = app.state.refunds.clone();
    let id = request.id;
    let first = tokio::spawn(async move { refunds_a.resolve_refund(approve(id)).await });
    let second = tokio::spawn(async move { refunds_b.resolve_refund(approve(id)).await });
    let results = [first.await.unwrap(), second.await.unwrap()];

    // Exactly one resolver wins; the other is turned away before the
    // gateway is charged a second time.
    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    let err = results.into_iter().find_map(Result::err).unwrap();
    assert_matches!(err, ServiceError::InvalidOperation(_));

    assert_eq!(app.gateway.refund_calls().len(), 1);
    let order_after = app.order(order.id).await;
    assert_eq!(order_after.status, OrderStatus::Refunded);
    assert_eq!(order_after.refunded_amount, order.total_amount);
}

#[tokio::test]
async fn declining_one_line_of_a_total_refund_prices_by_item() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let keyboard = app.seed_product("Keyboard", dec!(60.00), 10).await;
    let mouse = app.seed_product("Mouse", dec!(25.00), 10).await;
    let order = app
        .paid_order(customer, &[(&keyboard, 1), (&mouse, 1)])
        .await;
    assert_eq!(order.total_amount, dec!(95.00));

    let items = order_items(&app, order.id).await;
    let mouse_line = items.iter().find(|i| i.product_id == mouse.id).unwrap();

    let request = app
        .state
        .refunds
        .request_refund(total_refund(order.id, customer))
        .await
        .unwrap();
    assert_eq!(request.requested_amount, dec!(95.00));

    // The admin declines the mouse line outright. The refund is priced from
    // the surviving items, not the outstanding order total.
    app.state
        .refunds
        .resolve_refund(ResolveInput {
            refund_request_id: request.id,
            admin_id: Uuid::new_v4(),
            approve: true,
            reason: None,
            approved_quantities: Some(vec![RefundItemInput {
                order_item_id: mouse_line.id,
                quantity: 0,
            }]),
        })
        .await
        .unwrap();

    let calls = app.gateway.refund_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, dec!(60.00));

    let order_after = app.order(order.id).await;
    assert_eq!(order_after.status, OrderStatus::PartiallyRefunded);
    assert_eq!(order_after.refunded_amount, dec!(60.00));

    let items = order_items(&app, order.id).await;
    let mouse_line = items.iter().find(|i| i.product_id == mouse.id).unwrap();
    assert_eq!(mouse_line.refund_quantity, 0);
    assert_eq!(app.product(mouse.id).await.stock_quantity, 9);

    // The declined line stays refundable later, at its own price.
    let follow_up = app
        .state
        .refunds
        .request_refund(RefundInput {
            order_id: order.id,
            customer_id: customer,
            refund_type: RefundType::Partial,
            items: vec![RefundItemInput {
                order_item_id: mouse_line.id,
                quantity: 1,
            }],
            reason: None,
        })
        .await
        .unwrap();
    assert_eq!(follow_up.requested_amount, dec!(25.00));
}

#[tokio::test]
async fn refund_requires_a_paid_order() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_product("Charger", dec!(20.00), 5).await;

    app.state
        .carts
        .add_item(customer, product.id, 1)
        .await
        .unwrap();
    let order = app
        .state
        .checkout
        .checkout(app.checkout_input(customer, None))
        .await
        .unwrap();

    let err = app
        .state
        .refunds
        .request_refund(total_refund(order.id, customer))
        .await
        .unwrap_err();
    assert_matches!(
        err,
        ServiceError::InvalidStateTransition {
            from: OrderStatus::Pending,
            to: OrderStatus::RefundRequested,
        }
    );
}

#[tokio::test]
async fn admin_can_approve_less_than_requested() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let product = app.seed_product("Dock", dec!(90.00), 10).await;
    let order = app.paid_order(customer, &[(&product, 3)]).await;
    let item_id = order_items(&app, order.id).await[0].id;

    let request = app
        .state
        .refunds
        .request_refund(RefundInput {
            order_id: order.id,
            customer_id: customer,
            refund_type: RefundType::Partial,
            items: vec![RefundItemInput {
                order_item_id: item_id,
                quantity: 3,
            }],
            reason: None,
        })
        .await
        .unwrap();

    app.state
        .refunds
        .resolve_refund(ResolveInput {
            refund_request_id: request.id,
            admin_id: Uuid::new_v4(),
            approve: true,
            reason: None,
            approved_quantities: Some(vec![RefundItemInput {
                order_item_id: item_id,
                quantity: 2,
            }]),
        })
        .await
        .unwrap();

    // Approved, not requested, quantities drive money and stock.
    let order_after = app.order(order.id).await;
    assert_eq!(order_after.status, OrderStatus::PartiallyRefunded);
    assert_eq!(order_after.refunded_amount, dec!(180.00));
    assert_eq!(order_items(&app, order.id).await[0].refund_quantity, 2);
    assert_eq!(app.product(product.id).await.stock_quantity, 9);
}
