use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Order lifecycle states. The transition graph below is the single source
/// of truth; every status write goes through `can_transition_to`.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Processing,
    OnHold,
    ReadyForShipment,
    Shipped,
    Delivered,
    Cancelled,
}

impl OrderStatus {
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Delivered | OrderStatus::Cancelled)
    }

    /// Allowed transitions. Anything not listed is invalid, including
    /// self-transitions.
    pub fn can_transition_to(self, next: OrderStatus) -> bool {
        use OrderStatus::*;

        match (self, next) {
            // From pending: payment+reservation advance, reservation failure
            // holds, explicit cancel
            (Pending, Processing) => true,
            (Pending, OnHold) => true,
            (Pending, Cancelled) => true,

            // From processing
            (Processing, ReadyForShipment) => true,
            (Processing, Shipped) => true,
            (Processing, OnHold) => true,
            (Processing, Cancelled) => true,

            // From ready_for_shipment
            (ReadyForShipment, Shipped) => true,
            (ReadyForShipment, OnHold) => true,
            (ReadyForShipment, Cancelled) => true,

            // From on_hold: remediation or cancel
            (OnHold, Processing) => true,
            (OnHold, Cancelled) => true,

            // From shipped
            (Shipped, Delivered) => true,

            _ => false,
        }
    }
}

/// Payment outcome as reported by the external processor. `Refunded` is a
/// payment-status-only change on an already-terminal order.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl PaymentStatus {
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

/// Where the order stands with the reservation engine.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum InventoryStatus {
    Pending,
    Reserved,
    Confirmed,
    Released,
    Failed,
}

impl InventoryStatus {
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

/// Append-only free-text note on an order, stored in the `notes` JSON
/// column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderNote {
    pub text: String,
    pub author: String,
    pub added_at: DateTime<Utc>,
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "orders")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(indexed)]
    pub customer_id: Uuid,
    #[sea_orm(indexed)]
    pub status: String,
    pub payment_status: String,
    pub inventory_status: String,
    pub subtotal_cents: i64,
    pub tax_cents: i64,
    pub shipping_cents: i64,
    pub total_cents: i64,
    pub shipping_carrier: Option<String>,
    pub shipping_method: Option<String>,
    pub tracking_number: Option<String>,
    pub estimated_delivery_date: Option<DateTime<Utc>>,
    pub packing_date: Option<DateTime<Utc>>,
    pub shipping_date: Option<DateTime<Utc>>,
    pub delivery_date: Option<DateTime<Utc>>,
    pub cancellation_date: Option<DateTime<Utc>>,
    pub cancellation_reason: Option<String>,
    pub payment_method: Option<String>,
    pub payment_transaction_ref: Option<String>,
    pub reservation_expires_at: Option<DateTime<Utc>>,
    pub shipping_address: String,
    pub billing_address: String,
    pub notes: Json,
    #[sea_orm(indexed)]
    pub order_date: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub version: i32,
}

impl Model {
    pub fn status_parsed(&self) -> Option<OrderStatus> {
        OrderStatus::parse(&self.status)
    }

    pub fn payment_status_parsed(&self) -> Option<PaymentStatus> {
        PaymentStatus::parse(&self.payment_status)
    }

    pub fn inventory_status_parsed(&self) -> Option<InventoryStatus> {
        InventoryStatus::parse(&self.inventory_status)
    }

    pub fn notes_parsed(&self) -> Vec<OrderNote> {
        serde_json::from_value(self.notes.clone()).unwrap_or_default()
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::order_item::Entity")]
    OrderItem,
    #[sea_orm(has_many = "super::order_status_history::Entity")]
    StatusHistory,
}

impl Related<super::order_item::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::OrderItem.def()
    }
}

impl Related<super::order_status_history::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::StatusHistory.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn initial_state_reaches_every_other_state() {
        // Every status is reachable from pending via some walk.
        for target in OrderStatus::iter() {
            if target == OrderStatus::Pending {
                continue;
            }
            assert!(
                reachable(OrderStatus::Pending, target),
                "{:?} unreachable from pending",
                target
            );
        }
    }

    fn reachable(from: OrderStatus, to: OrderStatus) -> bool {
        let mut seen = vec![from];
        let mut frontier = vec![from];
        while let Some(state) = frontier.pop() {
            for next in OrderStatus::iter() {
                if state.can_transition_to(next) && !seen.contains(&next) {
                    if next == to {
                        return true;
                    }
                    seen.push(next);
                    frontier.push(next);
                }
            }
        }
        false
    }

    #[test]
    fn terminal_states_have_no_exits() {
        for terminal in [OrderStatus::Delivered, OrderStatus::Cancelled] {
            for next in OrderStatus::iter() {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[test]
    fn self_transitions_are_invalid() {
        for status in OrderStatus::iter() {
            assert!(!status.can_transition_to(status));
        }
    }

    #[test]
    fn delivered_cannot_regress_to_processing() {
        assert!(!OrderStatus::Delivered.can_transition_to(OrderStatus::Processing));
    }

    #[test]
    fn shipped_only_delivers() {
        for next in OrderStatus::iter() {
            assert_eq!(
                OrderStatus::Shipped.can_transition_to(next),
                next == OrderStatus::Delivered
            );
        }
    }

    #[test]
    fn string_forms_round_trip() {
        assert_eq!(OrderStatus::ReadyForShipment.as_str(), "ready_for_shipment");
        assert_eq!(
            OrderStatus::parse("ready_for_shipment"),
            Some(OrderStatus::ReadyForShipment)
        );
        assert_eq!(OrderStatus::parse("READY"), None);
        assert_eq!(PaymentStatus::parse("paid"), Some(PaymentStatus::Paid));
        assert_eq!(
            InventoryStatus::parse("reserved"),
            Some(InventoryStatus::Reserved)
        );
    }
}
