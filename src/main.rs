use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing::info;

use cardforge_api::config;
use cardforge_api::db;
use cardforge_api::message_queue::rabbitmq::RabbitMqQueue;
use cardforge_api::message_queue::{InMemoryQueue, MessageQueue};
use cardforge_api::services::{
    register_consumers, OrderOrchestrator, OrderService, ReservationEngine, ReservationWorker,
};
use cardforge_api::sweeper;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = config::load_config().context("configuration")?;
    config::init_tracing(&config.log_level, config.log_json);

    info!("Cardforge API starting...");

    let item_store = Arc::new(
        db::establish_connection_with_config(&db::DbConfig {
            url: config.item_store_url.clone(),
            acquire_timeout: config.store_timeout(),
            ..Default::default()
        })
        .await
        .context("item store connection")?,
    );
    let order_store = Arc::new(
        db::establish_connection_with_config(&db::DbConfig {
            url: config.order_store_url.clone(),
            acquire_timeout: config.store_timeout(),
            ..Default::default()
        })
        .await
        .context("order store connection")?,
    );

    db::ensure_item_store_schema(&item_store)
        .await
        .context("item store schema")?;
    db::ensure_order_store_schema(&order_store)
        .await
        .context("order store schema")?;

    let queue: Arc<dyn MessageQueue> = match config.message_queue_backend.as_str() {
        "in-memory" => {
            info!("Using in-memory message queue backend");
            Arc::new(InMemoryQueue::new(config.dedup_window()))
        }
        _ => Arc::new(
            RabbitMqQueue::connect(
                &config.broker(),
                config.publish_timeout(),
                config.dedup_window(),
            )
            .await
            .context("broker connection")?,
        ),
    };

    let orders = OrderService::new(
        order_store.clone(),
        queue.clone(),
        config.tax_rate_basis_points,
    );
    let engine = ReservationEngine::new(
        item_store.clone(),
        queue.clone(),
        config.reservation_default_ttl(),
        config.low_stock_threshold,
    );
    let orchestrator = Arc::new(OrderOrchestrator::new(orders.clone()));
    let worker = Arc::new(ReservationWorker::new(
        engine.clone(),
        orders.clone(),
        queue.clone(),
    ));
    register_consumers(queue.as_ref(), orchestrator, worker)
        .await
        .context("consumer registration")?;

    let sweep_handle = sweeper::spawn(engine, config.sweep_interval());
    info!(
        sweep_interval_secs = config.sweep_interval().as_secs(),
        "Reservation sweeper running"
    );

    tokio::signal::ctrl_c().await.context("signal handler")?;
    info!("Shutdown signal received");

    sweep_handle.abort();
    tokio::time::sleep(Duration::from_millis(100)).await;

    Ok(())
}
