//! Event-coordination layer.
//!
//! Two consumers drive the saga. [`OrderOrchestrator`] folds collaborator
//! outcomes (payment, reservation, shipping) into the order state machine.
//! [`ReservationWorker`] turns order lifecycle events into reservation
//! engine commands: created → hold, cancelled → release, delivered →
//! confirm. Both are idempotent; the bus adapter's dedup window plus
//! state-based no-ops make duplicate deliveries harmless.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::entities::{InventoryStatus, ReservationStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventEnvelope, OrderLine};
use crate::message_queue::{MessageHandler, MessageQueue, MessageQueueError};
use crate::services::orders::OrderService;
use crate::services::reservations::{ReservationEngine, ReserveLine, ReserveOutcome};

/// Consumes collaborator events and advances orders.
pub struct OrderOrchestrator {
    orders: OrderService,
}

impl OrderOrchestrator {
    pub fn new(orders: OrderService) -> Self {
        Self { orders }
    }
}

#[async_trait]
impl MessageHandler for OrderOrchestrator {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), MessageQueueError> {
        let result = match &envelope.event {
            Event::PaymentProcessed {
                order_id,
                success,
                method,
                transaction_reference,
                failure_reason,
            } => {
                self.orders
                    .apply_payment_processed(
                        *order_id,
                        *success,
                        method,
                        transaction_reference.as_deref(),
                        failure_reason.as_deref(),
                    )
                    .await
            }
            Event::InventoryReserved {
                order_id,
                expires_at,
                ..
            } => {
                self.orders
                    .apply_inventory_reserved(*order_id, *expires_at)
                    .await
            }
            Event::InventoryReservationFailed {
                order_id,
                reason,
                unavailable,
            } => {
                self.orders
                    .apply_reservation_failed(*order_id, reason, unavailable)
                    .await
            }
            Event::ShippingRateCalculated {
                order_id,
                shipping_cost_cents,
                shipping_method,
                estimated_delivery_date,
                tracking_number,
                carrier,
            } => {
                self.orders
                    .apply_shipping_rate(
                        *order_id,
                        *shipping_cost_cents,
                        shipping_method,
                        *estimated_delivery_date,
                        tracking_number.as_deref(),
                        carrier.as_deref(),
                    )
                    .await
            }
            Event::ReservationExpired { order_id, .. } => {
                self.orders.apply_reservation_expired(*order_id).await
            }
            // Quantity telemetry and our own emissions need no action here.
            _ => Ok(()),
        };

        settle("orchestrator", envelope, result)
    }
}

/// Consumes order lifecycle events and drives the reservation engine.
pub struct ReservationWorker {
    engine: ReservationEngine,
    orders: OrderService,
    queue: Arc<dyn MessageQueue>,
}

impl ReservationWorker {
    pub fn new(
        engine: ReservationEngine,
        orders: OrderService,
        queue: Arc<dyn MessageQueue>,
    ) -> Self {
        Self {
            engine,
            orders,
            queue,
        }
    }

    async fn on_order_created(
        &self,
        order_id: Uuid,
        customer_id: Uuid,
        lines: &[OrderLine],
    ) -> Result<(), ServiceError> {
        let reserve_lines: Vec<ReserveLine> = lines
            .iter()
            .map(|l| ReserveLine {
                item_id: l.item_id,
                quantity: l.quantity,
            })
            .collect();

        match self
            .engine
            .reserve(order_id, customer_id, &reserve_lines, None)
            .await
        {
            Ok(ReserveOutcome::Reserved { .. }) | Ok(ReserveOutcome::Unavailable(_)) => Ok(()),
            // A hold already exists: the outcome event may have been lost
            // before this redelivery, so announce the existing hold again.
            Err(ServiceError::Conflict(_)) => self.reemit_existing_hold(order_id).await,
            Err(e) => Err(e),
        }
    }

    async fn reemit_existing_hold(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let Some((reservation, lines)) = self.engine.get_reservation_by_order(order_id).await?
        else {
            return Ok(());
        };
        if reservation.status_parsed() != Some(ReservationStatus::Active) {
            return Ok(());
        }

        info!(order_id = %order_id, reservation_id = %reservation.id, "Re-announcing existing hold");
        self.queue
            .publish(&EventEnvelope::new(Event::InventoryReserved {
                order_id,
                reservation_id: reservation.id,
                expires_at: reservation.expires_at,
                lines: lines
                    .iter()
                    .map(|l| OrderLine {
                        item_id: l.item_id,
                        quantity: l.quantity,
                        unit_price_cents: l.unit_price_cents,
                    })
                    .collect(),
            }))
            .await
            .map_err(|e| ServiceError::QueueError(e.to_string()))
    }

    async fn on_order_cancelled(&self, order_id: Uuid) -> Result<(), ServiceError> {
        match self.engine.release(order_id).await {
            Ok(()) => {
                self.orders
                    .set_inventory_status(order_id, InventoryStatus::Released)
                    .await
            }
            // No hold was ever placed for this order.
            Err(ServiceError::NotFound(_)) => Ok(()),
            Err(ServiceError::Conflict(msg)) => {
                warn!(order_id = %order_id, "Release skipped: {}", msg);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn on_order_delivered(&self, order_id: Uuid) -> Result<(), ServiceError> {
        match self.engine.confirm(order_id).await {
            Ok(()) => {
                self.orders
                    .set_inventory_status(order_id, InventoryStatus::Confirmed)
                    .await
            }
            Err(ServiceError::NotFound(_)) => {
                warn!(order_id = %order_id, "Delivered order has no reservation to confirm");
                Ok(())
            }
            Err(ServiceError::Conflict(msg)) => {
                error!(order_id = %order_id, "Confirm skipped: {}", msg);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl MessageHandler for ReservationWorker {
    async fn handle(&self, envelope: &EventEnvelope) -> Result<(), MessageQueueError> {
        let result = match &envelope.event {
            Event::OrderCreated {
                order_id,
                customer_id,
                lines,
            } => self.on_order_created(*order_id, *customer_id, lines).await,
            Event::OrderCancelled { order_id, .. } => self.on_order_cancelled(*order_id).await,
            Event::OrderDelivered { order_id } => self.on_order_delivered(*order_id).await,
            _ => Ok(()),
        };

        settle("reservation-worker", envelope, result)
    }
}

/// Maps a handler outcome onto ack/nack semantics: transient failures and
/// lost races nack for redelivery, permanent failures are logged and acked
/// so the poison message does not loop.
fn settle(
    consumer: &str,
    envelope: &EventEnvelope,
    result: Result<(), ServiceError>,
) -> Result<(), MessageQueueError> {
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.is_transient() || matches!(e, ServiceError::Conflict(_)) => {
            Err(MessageQueueError::Handler(e.to_string()))
        }
        Err(e) => {
            error!(
                consumer = consumer,
                message_id = %envelope.event_id,
                routing_key = envelope.routing_key(),
                error_kind = e.kind(),
                error = %e,
                "Permanent handler failure, message dropped"
            );
            Ok(())
        }
    }
}

/// Binds both consumers to their routing-key patterns.
pub async fn register_consumers(
    queue: &dyn MessageQueue,
    orchestrator: Arc<OrderOrchestrator>,
    worker: Arc<ReservationWorker>,
) -> Result<(), MessageQueueError> {
    queue
        .subscribe(
            "payment.processed",
            "orchestrator.payment",
            orchestrator.clone(),
        )
        .await?;
    queue
        .subscribe("inventory.#", "orchestrator.inventory", orchestrator.clone())
        .await?;
    queue
        .subscribe(
            "shipping.rate.calculated",
            "orchestrator.shipping",
            orchestrator.clone(),
        )
        .await?;
    queue
        .subscribe(
            "order.reservation.expired",
            "orchestrator.expiry",
            orchestrator,
        )
        .await?;

    queue
        .subscribe("order.created", "reservation-worker.created", worker.clone())
        .await?;
    queue
        .subscribe(
            "order.cancelled",
            "reservation-worker.cancelled",
            worker.clone(),
        )
        .await?;
    queue
        .subscribe("order.delivered", "reservation-worker.delivered", worker)
        .await?;

    Ok(())
}
