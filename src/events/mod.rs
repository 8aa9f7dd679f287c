//! Typed event catalog for the order/inventory saga.
//!
//! Every message on the bus is an [`EventEnvelope`]: a unique id, the
//! affected order (when there is one), a UTC timestamp, and one event
//! payload. Field names are fixed at first publication and never renamed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::entities::OrderStatus;

pub mod dedup;

pub use dedup::DedupStore;

/// One order line as carried on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OrderLine {
    pub item_id: Uuid,
    pub quantity: i32,
    pub unit_price_cents: i64,
}

/// Per-line shortfall reported by a failed reservation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnavailableItem {
    pub item_id: Uuid,
    pub item_name: String,
    pub requested: i32,
    pub available: i32,
}

/// Logical events exchanged between the orchestrator, the reservation
/// engine, and the external collaborators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "eventType")]
pub enum Event {
    #[serde(rename_all = "camelCase")]
    OrderCreated {
        order_id: Uuid,
        customer_id: Uuid,
        lines: Vec<OrderLine>,
    },

    #[serde(rename_all = "camelCase")]
    OrderStatusChanged {
        order_id: Uuid,
        old_status: OrderStatus,
        new_status: OrderStatus,
        actor: String,
    },

    #[serde(rename_all = "camelCase")]
    OrderCancelled { order_id: Uuid, reason: String },

    #[serde(rename_all = "camelCase")]
    OrderShipped {
        order_id: Uuid,
        tracking_number: String,
        carrier: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    OrderDelivered { order_id: Uuid },

    #[serde(rename_all = "camelCase")]
    ReservationExpired {
        order_id: Uuid,
        reservation_id: Uuid,
        expired_at: DateTime<Utc>,
    },

    #[serde(rename_all = "camelCase")]
    InventoryReserved {
        order_id: Uuid,
        reservation_id: Uuid,
        expires_at: DateTime<Utc>,
        lines: Vec<OrderLine>,
    },

    #[serde(rename_all = "camelCase")]
    InventoryReservationFailed {
        order_id: Uuid,
        reason: String,
        unavailable: Vec<UnavailableItem>,
    },

    #[serde(rename_all = "camelCase")]
    InventoryQuantityChanged {
        item_id: Uuid,
        old_available: i32,
        new_available: i32,
        reason: String,
    },

    #[serde(rename_all = "camelCase")]
    InventoryQuantityLow {
        item_id: Uuid,
        available: i32,
        threshold: i32,
    },

    #[serde(rename_all = "camelCase")]
    PaymentProcessed {
        order_id: Uuid,
        success: bool,
        method: String,
        transaction_reference: Option<String>,
        failure_reason: Option<String>,
    },

    #[serde(rename_all = "camelCase")]
    ShippingRateCalculated {
        order_id: Uuid,
        shipping_cost_cents: i64,
        shipping_method: String,
        estimated_delivery_date: Option<DateTime<Utc>>,
        tracking_number: Option<String>,
        carrier: Option<String>,
    },
}

impl Event {
    /// Logical event type name, carried in the `EventType` message header.
    pub fn event_type(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "OrderCreated",
            Event::OrderStatusChanged { .. } => "OrderStatusChanged",
            Event::OrderCancelled { .. } => "OrderCancelled",
            Event::OrderShipped { .. } => "OrderShipped",
            Event::OrderDelivered { .. } => "OrderDelivered",
            Event::ReservationExpired { .. } => "ReservationExpired",
            Event::InventoryReserved { .. } => "InventoryReserved",
            Event::InventoryReservationFailed { .. } => "InventoryReservationFailed",
            Event::InventoryQuantityChanged { .. } => "InventoryQuantityChanged",
            Event::InventoryQuantityLow { .. } => "InventoryQuantityLow",
            Event::PaymentProcessed { .. } => "PaymentProcessed",
            Event::ShippingRateCalculated { .. } => "ShippingRateCalculated",
        }
    }

    /// Dotted topic routing key for the broker.
    pub fn routing_key(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order.created",
            Event::OrderStatusChanged { .. } => "order.status.changed",
            Event::OrderCancelled { .. } => "order.cancelled",
            Event::OrderShipped { .. } => "order.shipped",
            Event::OrderDelivered { .. } => "order.delivered",
            Event::ReservationExpired { .. } => "order.reservation.expired",
            Event::InventoryReserved { .. } => "inventory.reserved",
            Event::InventoryReservationFailed { .. } => "inventory.reservation.failed",
            Event::InventoryQuantityChanged { .. } => "inventory.quantity.changed",
            Event::InventoryQuantityLow { .. } => "inventory.quantity.low",
            Event::PaymentProcessed { .. } => "payment.processed",
            Event::ShippingRateCalculated { .. } => "shipping.rate.calculated",
        }
    }

    /// The order this event concerns, when it concerns one.
    pub fn order_id(&self) -> Option<Uuid> {
        match self {
            Event::OrderCreated { order_id, .. }
            | Event::OrderStatusChanged { order_id, .. }
            | Event::OrderCancelled { order_id, .. }
            | Event::OrderShipped { order_id, .. }
            | Event::OrderDelivered { order_id, .. }
            | Event::ReservationExpired { order_id, .. }
            | Event::InventoryReserved { order_id, .. }
            | Event::InventoryReservationFailed { order_id, .. }
            | Event::PaymentProcessed { order_id, .. }
            | Event::ShippingRateCalculated { order_id, .. } => Some(*order_id),
            Event::InventoryQuantityChanged { .. } | Event::InventoryQuantityLow { .. } => None,
        }
    }
}

/// Wire envelope wrapped around every published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub event_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub order_id: Option<Uuid>,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl EventEnvelope {
    pub fn new(event: Event) -> Self {
        Self {
            event_id: Uuid::new_v4(),
            order_id: event.order_id(),
            timestamp: Utc::now(),
            event,
        }
    }

    pub fn routing_key(&self) -> &'static str {
        self.event.routing_key()
    }

    pub fn event_type(&self) -> &'static str {
        self.event.event_type()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_carries_order_id_and_flattened_payload() {
        let order_id = Uuid::new_v4();
        let envelope = EventEnvelope::new(Event::OrderCancelled {
            order_id,
            reason: "customer request".into(),
        });

        assert_eq!(envelope.order_id, Some(order_id));
        assert_eq!(envelope.routing_key(), "order.cancelled");

        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["eventType"], "OrderCancelled");
        assert_eq!(json["orderId"], order_id.to_string());
        assert_eq!(json["reason"], "customer request");
        assert!(json["eventId"].is_string());
        assert!(json["timestamp"].is_string());
    }

    #[test]
    fn envelope_round_trips() {
        let envelope = EventEnvelope::new(Event::InventoryReservationFailed {
            order_id: Uuid::new_v4(),
            reason: "insufficient stock".into(),
            unavailable: vec![UnavailableItem {
                item_id: Uuid::new_v4(),
                item_name: "Black Lotus".into(),
                requested: 2,
                available: 1,
            }],
        });

        let json = serde_json::to_string(&envelope).unwrap();
        let back: EventEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn quantity_events_carry_no_order_id() {
        let envelope = EventEnvelope::new(Event::InventoryQuantityLow {
            item_id: Uuid::new_v4(),
            available: 3,
            threshold: 10,
        });
        assert_eq!(envelope.order_id, None);

        let json = serde_json::to_value(&envelope).unwrap();
        assert!(json.get("orderId").is_none());
    }

    #[test]
    fn routing_keys_match_catalog() {
        let order_id = Uuid::new_v4();
        let cases = vec![
            (
                Event::OrderCreated {
                    order_id,
                    customer_id: Uuid::new_v4(),
                    lines: vec![],
                },
                "order.created",
            ),
            (
                Event::PaymentProcessed {
                    order_id,
                    success: true,
                    method: "card".into(),
                    transaction_reference: Some("tx-1".into()),
                    failure_reason: None,
                },
                "payment.processed",
            ),
            (
                Event::ReservationExpired {
                    order_id,
                    reservation_id: Uuid::new_v4(),
                    expired_at: Utc::now(),
                },
                "order.reservation.expired",
            ),
        ];
        for (event, key) in cases {
            assert_eq!(event.routing_key(), key);
        }
    }
}
