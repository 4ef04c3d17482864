mod common;

use assert_matches::assert_matches;
use common::{card, paid_with, TestApp};
use paymall_api::{
    entities::{OrderStatus, PaymentStatus},
    errors::ServiceError,
    services::OrderWithItems,
};
use rust_decimal_macros::dec;
use uuid::Uuid;

async fn place_order(app: &TestApp, user: Uuid, quantity: i32) -> (OrderWithItems, Uuid) {
    let mall = app.seed_mall("Phoenix").await;
    let rice = app.seed_product(mall.id, "Basmati Rice", dec!(100), 10).await;
    app.cart().add_item(user, rice.id, quantity).await.unwrap();
    let placed = app.checkout().checkout(user, card()).await.unwrap();
    (placed, rice.id)
}

#[tokio::test]
async fn pending_order_can_be_cancelled_once() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let (placed, rice) = place_order(&app, user, 2).await;

    let cancelled = app.orders().cancel(placed.order.id, user).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.payment_status, PaymentStatus::Pending);

    assert_matches!(
        app.orders().cancel(placed.order.id, user).await,
        Err(ServiceError::InvalidTransition(_))
    );
    // No restock unless configured.
    assert_eq!(app.stock_of(rice).await, 8);
}

#[tokio::test]
async fn cancelling_a_paid_order_marks_it_refunded() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let mall = app.seed_mall("Phoenix").await;
    let rice = app.seed_product(mall.id, "Basmati Rice", dec!(100), 10).await;
    app.cart().add_item(user, rice.id, 1).await.unwrap();
    let placed = app
        .checkout()
        .checkout(user, paid_with("cash"))
        .await
        .unwrap();

    let cancelled = app.orders().cancel(placed.order.id, user).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.payment_status, PaymentStatus::Refunded);
}

#[tokio::test]
async fn cancel_restocks_when_configured() {
    let app = TestApp::with_config(|cfg| cfg.restock_on_cancel = true).await;
    let user = Uuid::new_v4();
    let (placed, rice) = place_order(&app, user, 3).await;
    assert_eq!(app.stock_of(rice).await, 7);

    app.orders().cancel(placed.order.id, user).await.unwrap();
    assert_eq!(app.stock_of(rice).await, 10);
}

#[tokio::test]
async fn orders_past_pending_cannot_be_cancelled() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let (placed, _) = place_order(&app, user, 1).await;

    let processing = app
        .orders()
        .update_fulfillment_status(placed.order.id, OrderStatus::Processing)
        .await
        .unwrap();
    assert_eq!(processing.status, OrderStatus::Processing);

    assert_matches!(
        app.orders().cancel(placed.order.id, user).await,
        Err(ServiceError::InvalidTransition(_))
    );
}

#[tokio::test]
async fn fulfillment_only_moves_forward() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let (placed, _) = place_order(&app, user, 1).await;
    let id = placed.order.id;

    assert_matches!(
        app.orders()
            .update_fulfillment_status(id, OrderStatus::Completed)
            .await,
        Err(ServiceError::InvalidTransition(_))
    );

    app.orders()
        .update_fulfillment_status(id, OrderStatus::Processing)
        .await
        .unwrap();
    let done = app
        .orders()
        .update_fulfillment_status(id, OrderStatus::Completed)
        .await
        .unwrap();
    assert_eq!(done.status, OrderStatus::Completed);

    assert_matches!(
        app.orders()
            .update_fulfillment_status(id, OrderStatus::Processing)
            .await,
        Err(ServiceError::InvalidTransition(_))
    );
    assert_matches!(
        app.orders()
            .update_fulfillment_status(Uuid::new_v4(), OrderStatus::Processing)
            .await,
        Err(ServiceError::NotFound(_))
    );
}

#[tokio::test]
async fn payment_status_follows_its_transition_table() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let (placed, _) = place_order(&app, user, 1).await;
    let id = placed.order.id;

    let failed = app
        .orders()
        .update_payment_status(id, PaymentStatus::Failed)
        .await
        .unwrap();
    assert_eq!(failed.payment_status, PaymentStatus::Failed);

    let paid = app
        .orders()
        .update_payment_status(id, PaymentStatus::Paid)
        .await
        .unwrap();
    assert_eq!(paid.payment_status, PaymentStatus::Paid);

    assert_matches!(
        app.orders()
            .update_payment_status(id, PaymentStatus::Pending)
            .await,
        Err(ServiceError::InvalidTransition(_))
    );
}

#[tokio::test]
async fn orders_are_private_to_their_owner() {
    let app = TestApp::new().await;
    let owner = Uuid::new_v4();
    let stranger = Uuid::new_v4();
    let (placed, _) = place_order(&app, owner, 1).await;

    assert_matches!(
        app.orders().get_order(placed.order.id, stranger).await,
        Err(ServiceError::NotFound(_))
    );
    assert_matches!(
        app.orders().cancel(placed.order.id, stranger).await,
        Err(ServiceError::NotFound(_))
    );
    assert_matches!(
        app.orders().invoice(placed.order.id, stranger).await,
        Err(ServiceError::NotFound(_))
    );

    let (orders, total) = app.orders().list_orders(stranger, 1, 20).await.unwrap();
    assert!(orders.is_empty());
    assert_eq!(total, 0);
}

#[tokio::test]
async fn listing_is_newest_first_and_paginated() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let mall = app.seed_mall("Phoenix").await;
    let rice = app.seed_product(mall.id, "Basmati Rice", dec!(100), 10).await;

    let mut placed = Vec::new();
    for _ in 0..3 {
        app.cart().add_item(user, rice.id, 1).await.unwrap();
        placed.push(app.checkout().checkout(user, card()).await.unwrap().order.id);
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }

    let (first_page, total) = app.orders().list_orders(user, 1, 2).await.unwrap();
    assert_eq!(total, 3);
    assert_eq!(first_page.len(), 2);
    assert_eq!(first_page[0].id, placed[2]);
    assert_eq!(first_page[1].id, placed[1]);

    let (second_page, _) = app.orders().list_orders(user, 2, 2).await.unwrap();
    assert_eq!(second_page.len(), 1);
    assert_eq!(second_page[0].id, placed[0]);
}

#[tokio::test]
async fn invoice_mirrors_the_order_snapshot() {
    let app = TestApp::new().await;
    let user = Uuid::new_v4();
    let (placed, _) = place_order(&app, user, 2).await;

    let invoice = app.orders().invoice(placed.order.id, user).await.unwrap();
    assert_eq!(invoice.title, "PayMall Invoice");
    assert_eq!(invoice.order_number, placed.order.order_number);
    assert_eq!(invoice.lines.len(), 1);
    assert_eq!(invoice.lines[0].quantity, 2);
    assert_eq!(invoice.lines[0].description, "Basmati Rice");
    assert_eq!(invoice.lines[0].amount, dec!(200));
    assert_eq!(invoice.subtotal, dec!(200));
    assert_eq!(invoice.tax, dec!(36));
    assert_eq!(invoice.discount, dec!(20));
    assert_eq!(invoice.total, dec!(216));
}

#[tokio::test]
async fn cancel_with_restock_and_checkout_interleave_on_a_pooled_database() {
    let app = TestApp::with_config(|cfg| {
        cfg.db_max_connections = 4;
        cfg.restock_on_cancel = true;
    })
    .await;
    let mall = app.seed_mall("Phoenix").await;
    let ticket = app.seed_product(mall.id, "Concert Ticket", dec!(1500), 5).await;
    let alice = Uuid::new_v4();
    let bob = Uuid::new_v4();

    app.cart().add_item(alice, ticket.id, 3).await.unwrap();
    let placed = app.checkout().checkout(alice, card()).await.unwrap();
    app.cart().add_item(bob, ticket.id, 2).await.unwrap();

    let (cancelled, bought) = tokio::join!(
        app.orders().cancel(placed.order.id, alice),
        app.checkout().checkout(bob, card())
    );

    assert_eq!(cancelled.unwrap().status, OrderStatus::Cancelled);
    assert_eq!(bought.unwrap().items[0].quantity, 2);
    assert_eq!(app.stock_of(ticket.id).await, 3);
}
