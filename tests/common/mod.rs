//! Shared integration-test harness: in-memory SQLite stores, the in-memory
//! topic bus, and the full consumer wiring. The in-memory bus dispatches
//! synchronously, so every event chain has fully settled by the time a
//! `publish` call returns.

#![allow(dead_code)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use uuid::Uuid;

use cardforge_api::db::{self, DbPool};
use cardforge_api::entities::item;
use cardforge_api::entities::ItemKind;
use cardforge_api::events::{Event, EventEnvelope};
use cardforge_api::message_queue::{
    InMemoryQueue, MessageHandler, MessageQueue, MessageQueueError,
};
use cardforge_api::services::{
    register_consumers, ItemService, OrderOrchestrator, OrderService, ReservationEngine,
    ReservationWorker,
};

pub const TEST_TAX_RATE_BPS: u32 = 825;
pub const TEST_LOW_STOCK_THRESHOLD: i32 = 10;

pub struct TestContext {
    pub item_store: Arc<DbPool>,
    pub order_store: Arc<DbPool>,
    pub queue: Arc<InMemoryQueue>,
    pub orders: OrderService,
    pub engine: ReservationEngine,
    pub items: ItemService,
}

/// Stores and services only; no consumers registered. Use this to drive
/// the engine or the order service in isolation.
pub async fn setup() -> TestContext {
    let item_store = Arc::new(
        db::establish_connection("sqlite::memory:")
            .await
            .expect("item store"),
    );
    db::ensure_item_store_schema(&item_store)
        .await
        .expect("item store schema");

    let order_store = Arc::new(
        db::establish_connection("sqlite::memory:")
            .await
            .expect("order store"),
    );
    db::ensure_order_store_schema(&order_store)
        .await
        .expect("order store schema");

    let queue = Arc::new(InMemoryQueue::new(Duration::from_secs(3600)));

    let orders = OrderService::new(order_store.clone(), queue.clone(), TEST_TAX_RATE_BPS);
    let engine = ReservationEngine::new(
        item_store.clone(),
        queue.clone(),
        Duration::from_secs(15 * 60),
        TEST_LOW_STOCK_THRESHOLD,
    );
    let items = ItemService::new(item_store.clone(), queue.clone(), TEST_LOW_STOCK_THRESHOLD);

    TestContext {
        item_store,
        order_store,
        queue,
        orders,
        engine,
        items,
    }
}

/// Full wiring: orchestrator and reservation worker subscribed, so order
/// events drive reservations and collaborator events drive orders.
pub async fn setup_with_consumers() -> TestContext {
    let ctx = setup().await;

    let orchestrator = Arc::new(OrderOrchestrator::new(ctx.orders.clone()));
    let worker = Arc::new(ReservationWorker::new(
        ctx.engine.clone(),
        ctx.orders.clone(),
        ctx.queue.clone(),
    ));
    register_consumers(ctx.queue.as_ref(), orchestrator, worker)
        .await
        .expect("consumer registration");

    ctx
}

/// Records every envelope crossing the bus.
pub struct CapturingHandler {
    events: Mutex<Vec<EventEnvelope>>,
}

#[async_trait]
impl MessageHandler for CapturingHandler {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), MessageQueueError> {
        self.events.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

impl CapturingHandler {
    pub fn all(&self) -> Vec<EventEnvelope> {
        self.events.lock().unwrap().clone()
    }

    pub fn count_of(&self, routing_key: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|e| e.routing_key() == routing_key)
            .count()
    }

    pub fn last_of(&self, routing_key: &str) -> Option<EventEnvelope> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|e| e.routing_key() == routing_key)
            .cloned()
    }
}

pub async fn capture_bus(ctx: &TestContext) -> Arc<CapturingHandler> {
    let handler = Arc::new(CapturingHandler {
        events: Mutex::new(Vec::new()),
    });
    ctx.queue
        .subscribe("#", "test-capture", handler.clone())
        .await
        .expect("capture subscription");
    handler
}

/// Inserts a catalog item directly into the item store.
pub async fn seed_item(
    ctx: &TestContext,
    name: &str,
    available: i32,
    price_cents: i64,
) -> item::Model {
    let now = Utc::now();
    item::ActiveModel {
        id: Set(Uuid::new_v4()),
        seller_id: Set(Uuid::new_v4()),
        name: Set(name.to_string()),
        set_code: Set("TST".to_string()),
        collector_number: Set("001".to_string()),
        rarity: Set("rare".to_string()),
        condition: Set("near_mint".to_string()),
        language: Set("en".to_string()),
        foil: Set(false),
        kind: Set(ItemKind::TradingCard.as_str().to_string()),
        details: Set(serde_json::json!({"kind": "trading_card"})),
        price_cents: Set(price_cents),
        available_quantity: Set(available),
        reserved_quantity: Set(0),
        image_url: Set(None),
        created_at: Set(now),
        last_updated: Set(now),
    }
    .insert(&*ctx.item_store)
    .await
    .expect("seed item")
}

pub async fn fetch_item(ctx: &TestContext, item_id: Uuid) -> item::Model {
    item::Entity::find_by_id(item_id)
        .one(&*ctx.item_store)
        .await
        .expect("item query")
        .expect("item exists")
}

pub async fn publish(ctx: &TestContext, event: Event) -> EventEnvelope {
    let envelope = EventEnvelope::new(event);
    ctx.queue.publish(&envelope).await.expect("publish");
    envelope
}
