//! Saga coordination through the bus: compensation on cancel, hold on
//! reservation failure, expiry handling, duplicate-delivery idempotence,
//! and re-quote recomputation.

mod common;

use cardforge_api::entities::{InventoryStatus, OrderStatus, PaymentStatus, ReservationStatus};
use cardforge_api::events::Event;
use cardforge_api::message_queue::MessageQueue;
use cardforge_api::services::orders::{CreateOrderLine, CreateOrderRequest};
use uuid::Uuid;

fn request_for(item_id: Uuid, quantity: i32, unit_price_cents: i64) -> CreateOrderRequest {
    CreateOrderRequest {
        customer_id: Uuid::new_v4(),
        shipping_address: "7 Market Square, Ravnica".to_string(),
        billing_address: "7 Market Square, Ravnica".to_string(),
        lines: vec![CreateOrderLine {
            item_id,
            quantity,
            unit_price_cents,
            condition: None,
            discount_cents: 0,
        }],
    }
}

#[tokio::test]
async fn reservation_failure_parks_the_order_on_hold() {
    let ctx = common::setup_with_consumers().await;
    let capture = common::capture_bus(&ctx).await;
    let item = common::seed_item(&ctx, "Mox Sapphire", 1, 700_000).await;

    let order = ctx
        .orders
        .create_order(request_for(item.id, 2, 700_000))
        .await
        .unwrap();

    let after = ctx.orders.get_order(order.id).await.unwrap();
    assert_eq!(after.status, OrderStatus::OnHold);
    assert_eq!(after.inventory_status, InventoryStatus::Failed);
    assert!(after
        .notes
        .iter()
        .any(|n| n.text.contains("requested 2") && n.text.contains("available 1")));

    // Item untouched, no reservation row, one failure event.
    let untouched = common::fetch_item(&ctx, item.id).await;
    assert_eq!(untouched.available_quantity, 1);
    assert_eq!(untouched.reserved_quantity, 0);
    assert!(ctx
        .engine
        .get_reservation_by_order(order.id)
        .await
        .unwrap()
        .is_none());
    assert_eq!(capture.count_of("inventory.reservation.failed"), 1);
}

#[tokio::test]
async fn cancel_before_shipment_releases_the_hold() {
    let ctx = common::setup_with_consumers().await;
    let item = common::seed_item(&ctx, "Library of Alexandria", 4, 120_000).await;

    let order = ctx
        .orders
        .create_order(request_for(item.id, 3, 120_000))
        .await
        .unwrap();
    assert_eq!(common::fetch_item(&ctx, item.id).await.reserved_quantity, 3);

    // Order sits in Processing with the hold still active.
    ctx.orders
        .update_status(order.id, OrderStatus::Processing, None, "admin")
        .await
        .unwrap();

    ctx.orders
        .cancel_order(order.id, "customer request", "customer")
        .await
        .expect("cancel");

    let cancelled = ctx.orders.get_order(order.id).await.unwrap();
    assert_eq!(cancelled.status, OrderStatus::Cancelled);
    assert_eq!(cancelled.inventory_status, InventoryStatus::Released);
    assert_eq!(
        cancelled.cancellation_reason.as_deref(),
        Some("customer request")
    );
    assert!(cancelled.cancellation_date.is_some());

    let (reservation, _) = ctx
        .engine
        .get_reservation_by_order(order.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        reservation.status_parsed(),
        Some(ReservationStatus::Released)
    );

    let returned = common::fetch_item(&ctx, item.id).await;
    assert_eq!(returned.reserved_quantity, 0);
    assert_eq!(returned.available_quantity, 4);
}

#[tokio::test]
async fn duplicate_payment_message_applies_once() {
    let ctx = common::setup_with_consumers().await;
    let item = common::seed_item(&ctx, "Chaos Orb", 5, 40_000).await;

    let order = ctx
        .orders
        .create_order(request_for(item.id, 1, 40_000))
        .await
        .unwrap();

    let envelope = common::publish(
        &ctx,
        Event::PaymentProcessed {
            order_id: order.id,
            success: true,
            method: "credit_card".to_string(),
            transaction_reference: Some("tx-dup".to_string()),
            failure_reason: None,
        },
    )
    .await;

    let first = ctx.orders.get_order(order.id).await.unwrap();

    // Redeliver the exact same message id.
    ctx.queue.publish(&envelope).await.unwrap();

    let second = ctx.orders.get_order(order.id).await.unwrap();
    assert_eq!(second.status, first.status);
    assert_eq!(second.version, first.version);
    assert_eq!(second.history.len(), first.history.len());
    assert_eq!(
        second
            .history
            .iter()
            .filter(|h| h.status == OrderStatus::Processing)
            .count(),
        1
    );
    assert_eq!(second.payment_transaction_ref.as_deref(), Some("tx-dup"));
}

#[tokio::test]
async fn expired_reservation_moves_order_on_hold() {
    let ctx = common::setup_with_consumers().await;
    let item = common::seed_item(&ctx, "Juzam Djinn", 2, 80_000).await;

    let order = ctx
        .orders
        .create_order(request_for(item.id, 1, 80_000))
        .await
        .unwrap();
    let reserved = ctx.orders.get_order(order.id).await.unwrap();
    let expires_at = reserved.reservation_expires_at.expect("hold in place");

    let sweep = ctx.engine.sweep_expired(expires_at).await.unwrap();
    assert_eq!(sweep.expired_count, 1);

    let after = ctx.orders.get_order(order.id).await.unwrap();
    assert_eq!(after.status, OrderStatus::OnHold);
    assert_eq!(after.inventory_status, InventoryStatus::Released);
    assert!(after.reservation_expires_at.is_none());

    assert_eq!(common::fetch_item(&ctx, item.id).await.reserved_quantity, 0);
}

#[tokio::test]
async fn payment_failure_records_reason_without_moving_the_order() {
    let ctx = common::setup_with_consumers().await;
    let item = common::seed_item(&ctx, "Ifh-Biff Efreet", 3, 9_000).await;

    let order = ctx
        .orders
        .create_order(request_for(item.id, 1, 9_000))
        .await
        .unwrap();

    common::publish(
        &ctx,
        Event::PaymentProcessed {
            order_id: order.id,
            success: false,
            method: "credit_card".to_string(),
            transaction_reference: None,
            failure_reason: Some("card declined".to_string()),
        },
    )
    .await;

    let after = ctx.orders.get_order(order.id).await.unwrap();
    assert_eq!(after.status, OrderStatus::Pending);
    assert_eq!(after.payment_status, PaymentStatus::Failed);
    assert!(after.notes.iter().any(|n| n.text.contains("card declined")));
}

#[tokio::test]
async fn shipping_requote_recomputes_instead_of_accumulating() {
    let ctx = common::setup_with_consumers().await;
    let item = common::seed_item(&ctx, "Wheel of Fortune", 5, 10_000).await;

    let order = ctx
        .orders
        .create_order(request_for(item.id, 1, 10_000))
        .await
        .unwrap();
    let base_total = order.subtotal_cents + order.tax_cents;

    common::publish(
        &ctx,
        Event::ShippingRateCalculated {
            order_id: order.id,
            shipping_cost_cents: 700,
            shipping_method: "ground".to_string(),
            estimated_delivery_date: None,
            tracking_number: None,
            carrier: None,
        },
    )
    .await;
    let first_quote = ctx.orders.get_order(order.id).await.unwrap();
    assert_eq!(first_quote.total_cents, base_total + 700);
    // No tracking number: still pending.
    assert_eq!(first_quote.status, OrderStatus::Pending);

    common::publish(
        &ctx,
        Event::ShippingRateCalculated {
            order_id: order.id,
            shipping_cost_cents: 300,
            shipping_method: "ground".to_string(),
            estimated_delivery_date: None,
            tracking_number: None,
            carrier: None,
        },
    )
    .await;
    let second_quote = ctx.orders.get_order(order.id).await.unwrap();
    assert_eq!(second_quote.total_cents, base_total + 300);
    assert_eq!(second_quote.shipping_cents, 300);
}

#[tokio::test]
async fn on_hold_remediation_returns_to_processing() {
    let ctx = common::setup_with_consumers().await;
    let item = common::seed_item(&ctx, "Ali from Cairo", 1, 55_000).await;

    // Oversell to land on hold.
    let order = ctx
        .orders
        .create_order(request_for(item.id, 2, 55_000))
        .await
        .unwrap();
    assert_eq!(
        ctx.orders.get_order(order.id).await.unwrap().status,
        OrderStatus::OnHold
    );

    ctx.orders
        .update_status(
            order.id,
            OrderStatus::Processing,
            Some("stock replenished".to_string()),
            "support",
        )
        .await
        .expect("remediation");

    let after = ctx.orders.get_order(order.id).await.unwrap();
    assert_eq!(after.status, OrderStatus::Processing);
}
