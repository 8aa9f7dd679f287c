//! Topic-routed publish/subscribe over a durable broker.
//!
//! Two backends implement the same contract: [`rabbitmq::RabbitMqQueue`]
//! for production and [`InMemoryQueue`] for tests and single-process
//! deployments. Handlers must be idempotent; each subscription owns a
//! deduplication window keyed by `(message_id, order_id)` and duplicates
//! are short-circuited with an ack.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, warn};

use crate::events::{DedupStore, EventEnvelope};

pub mod rabbitmq;

#[derive(Debug, Error)]
pub enum MessageQueueError {
    #[error("RabbitMQ error: {0}")]
    Lapin(#[from] lapin::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("deserialization error: {0}")]
    Deserialization(String),
    #[error("publish not confirmed within {0:?}")]
    PublishTimeout(Duration),
    #[error("broker rejected publish: {0}")]
    Rejected(String),
    #[error("handler error: {0}")]
    Handler(String),
}

/// A subscribed consumer. Returning `Err` nacks the delivery and the broker
/// redelivers; returning `Ok` acks it.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), MessageQueueError>;
}

#[async_trait]
pub trait MessageQueue: Send + Sync {
    /// Publishes one event. Synchronous with respect to broker
    /// acknowledgement; an error means the event must not be considered
    /// delivered.
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), MessageQueueError>;

    /// Registers a handler for all routing keys matching `pattern`
    /// (AMQP topic wildcards: `*` one segment, `#` zero or more).
    /// `consumer_name` identifies the subscription's queue.
    async fn subscribe(
        &self,
        pattern: &str,
        consumer_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), MessageQueueError>;
}

/// AMQP topic match: `*` binds exactly one dot-separated segment, `#` binds
/// zero or more.
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let key: Vec<&str> = routing_key.split('.').collect();
    seg_match(&pattern, &key)
}

fn seg_match(pattern: &[&str], key: &[&str]) -> bool {
    match pattern.first() {
        None => key.is_empty(),
        Some(&"#") => {
            if seg_match(&pattern[1..], key) {
                return true;
            }
            !key.is_empty() && seg_match(pattern, &key[1..])
        }
        Some(&"*") => !key.is_empty() && seg_match(&pattern[1..], &key[1..]),
        Some(seg) => !key.is_empty() && key[0] == *seg && seg_match(&pattern[1..], &key[1..]),
    }
}

struct Subscription {
    pattern: String,
    name: String,
    handler: Arc<dyn MessageHandler>,
    dedup: DedupStore,
    // Serializes dispatch within one subscription, mirroring a single AMQP
    // consumer on one queue.
    dispatch_lock: tokio::sync::Mutex<()>,
}

/// In-process topic bus. Publish dispatches serially to every matching
/// subscription, retrying failed handlers up to the redelivery budget.
pub struct InMemoryQueue {
    subscriptions: RwLock<Vec<Arc<Subscription>>>,
    dedup_window: Duration,
    max_redeliveries: u32,
}

impl InMemoryQueue {
    pub fn new(dedup_window: Duration) -> Self {
        Self {
            subscriptions: RwLock::new(Vec::new()),
            dedup_window,
            max_redeliveries: 3,
        }
    }

    pub fn with_max_redeliveries(mut self, max_redeliveries: u32) -> Self {
        self.max_redeliveries = max_redeliveries;
        self
    }
}

#[async_trait]
impl MessageQueue for InMemoryQueue {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), MessageQueueError> {
        // Round-trip through JSON so both backends exercise the same wire
        // representation.
        let payload = serde_json::to_vec(envelope)?;
        let delivered: EventEnvelope = serde_json::from_slice(&payload)
            .map_err(|e| MessageQueueError::Deserialization(e.to_string()))?;

        let routing_key = delivered.routing_key();
        let matching: Vec<Arc<Subscription>> = {
            let subs = self.subscriptions.read().await;
            subs.iter()
                .filter(|s| topic_matches(&s.pattern, routing_key))
                .cloned()
                .collect()
        };

        for sub in matching {
            let _serial = sub.dispatch_lock.lock().await;

            if sub
                .dedup
                .is_duplicate(delivered.event_id, delivered.order_id, Utc::now())
            {
                debug!(
                    consumer = %sub.name,
                    message_id = %delivered.event_id,
                    routing_key = routing_key,
                    "Duplicate delivery short-circuited"
                );
                continue;
            }

            let mut attempts = 0;
            loop {
                attempts += 1;
                match sub.handler.handle(&delivered).await {
                    Ok(()) => {
                        sub.dedup
                            .record(delivered.event_id, delivered.order_id, Utc::now());
                        break;
                    }
                    Err(e) if attempts <= self.max_redeliveries => {
                        warn!(
                            consumer = %sub.name,
                            message_id = %delivered.event_id,
                            attempt = attempts,
                            error = %e,
                            "Handler failed, redelivering"
                        );
                    }
                    Err(e) => {
                        error!(
                            consumer = %sub.name,
                            message_id = %delivered.event_id,
                            routing_key = routing_key,
                            error = %e,
                            "Handler failed after redelivery budget, dropping message"
                        );
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    async fn subscribe(
        &self,
        pattern: &str,
        consumer_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<(), MessageQueueError> {
        let mut subs = self.subscriptions.write().await;
        subs.push(Arc::new(Subscription {
            pattern: pattern.to_string(),
            name: consumer_name.to_string(),
            handler,
            dedup: DedupStore::new(self.dedup_window),
            dispatch_lock: tokio::sync::Mutex::new(()),
        }));
        debug!(pattern = pattern, consumer = consumer_name, "Subscribed");
        Ok(())
    }
}
