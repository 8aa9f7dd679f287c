//! Order lifecycle service.
//!
//! Owns the order state machine. Synchronous commands (create, cancel,
//! status update) and asynchronous collaborator events both funnel through
//! one compare-and-set update path: the writer that loses the version race
//! re-reads once and re-decides, so per-order history stays a totally
//! ordered walk on the transition table.

use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set, TransactionTrait, Value,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::entities::order::{self, Entity as OrderEntity};
use crate::entities::order_item::{self, Entity as OrderItemEntity};
use crate::entities::order_status_history::{self, Entity as HistoryEntity};
use crate::entities::{InventoryStatus, OrderNote, OrderStatus, PaymentStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventEnvelope, OrderLine, UnavailableItem};
use crate::message_queue::MessageQueue;
use crate::money;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderRequest {
    pub customer_id: Uuid,
    #[validate(length(min = 1, message = "Shipping address is required"))]
    pub shipping_address: String,
    #[validate(length(min = 1, message = "Billing address is required"))]
    pub billing_address: String,
    #[validate(length(min = 1, message = "Order must contain at least one line"))]
    pub lines: Vec<CreateOrderLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderLine {
    pub item_id: Uuid,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub condition: Option<String>,
    #[serde(default)]
    pub discount_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderItemResponse {
    pub item_id: Uuid,
    pub quantity: i32,
    pub unit_price_cents: i64,
    pub condition: String,
    pub discount_cents: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusHistoryEntry {
    pub status: OrderStatus,
    pub changed_at: DateTime<Utc>,
    pub changed_by: String,
    pub comment: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderResponse {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub inventory_status: InventoryStatus,
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
    pub notes: Vec<OrderNote>,
    pub order_date: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub version: i32,
    pub items: Vec<OrderItemResponse>,
    pub history: Vec<StatusHistoryEntry>,
}

/// Listing row; item lines and history are fetched per order via
/// `get_order`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderSummary {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub status: OrderStatus,
    pub payment_status: PaymentStatus,
    pub inventory_status: InventoryStatus,
    pub total_cents: i64,
    pub order_date: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderListPage {
    pub orders: Vec<OrderSummary>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
}

/// A decided update: column writes plus zero or more walk steps on the
/// transition table. The final step becomes the order's status; every step
/// appends a history entry.
struct PlannedUpdate {
    sets: Vec<(order::Column, Value)>,
    transitions: Vec<(OrderStatus, Option<String>)>,
}

struct ApplyOutcome {
    order: order::Model,
    previous_status: OrderStatus,
    transitions: Vec<OrderStatus>,
}

#[derive(Clone)]
pub struct OrderService {
    db: Arc<DbPool>,
    queue: Arc<dyn MessageQueue>,
    tax_rate_basis_points: u32,
}

impl OrderService {
    pub fn new(db: Arc<DbPool>, queue: Arc<dyn MessageQueue>, tax_rate_basis_points: u32) -> Self {
        Self {
            db,
            queue,
            tax_rate_basis_points,
        }
    }

    /// Validates and persists a new order in `Pending`, then announces it.
    #[instrument(skip(self, request), fields(customer_id = %request.customer_id, line_count = request.lines.len()))]
    pub async fn create_order(
        &self,
        request: CreateOrderRequest,
    ) -> Result<OrderResponse, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;

        let mut seen_items = HashSet::new();
        for line in &request.lines {
            if line.quantity < 1 {
                return Err(ServiceError::ValidationError(format!(
                    "quantity for item {} must be at least 1",
                    line.item_id
                )));
            }
            if line.unit_price_cents < 0 {
                return Err(ServiceError::ValidationError(format!(
                    "unit price for item {} must not be negative",
                    line.item_id
                )));
            }
            if line.discount_cents < 0 {
                return Err(ServiceError::ValidationError(format!(
                    "discount for item {} must not be negative",
                    line.item_id
                )));
            }
            if !seen_items.insert(line.item_id) {
                return Err(ServiceError::ValidationError(format!(
                    "duplicate item {} in order lines",
                    line.item_id
                )));
            }
        }

        let subtotal = money::subtotal(
            request
                .lines
                .iter()
                .map(|l| (l.quantity, l.unit_price_cents)),
        )?;
        let tax = money::tax_for(subtotal, self.tax_rate_basis_points)?;
        let total = money::order_total(subtotal, tax, 0)?;

        let order_id = Uuid::new_v4();
        let now = Utc::now();

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        order::ActiveModel {
            id: Set(order_id),
            customer_id: Set(request.customer_id),
            status: Set(OrderStatus::Pending.as_str().to_string()),
            payment_status: Set(PaymentStatus::Pending.as_str().to_string()),
            inventory_status: Set(InventoryStatus::Pending.as_str().to_string()),
            subtotal_cents: Set(subtotal),
            tax_cents: Set(tax),
            shipping_cents: Set(0),
            total_cents: Set(total),
            shipping_carrier: Set(None),
            shipping_method: Set(None),
            tracking_number: Set(None),
            estimated_delivery_date: Set(None),
            packing_date: Set(None),
            shipping_date: Set(None),
            delivery_date: Set(None),
            cancellation_date: Set(None),
            cancellation_reason: Set(None),
            payment_method: Set(None),
            payment_transaction_ref: Set(None),
            reservation_expires_at: Set(None),
            shipping_address: Set(request.shipping_address.clone()),
            billing_address: Set(request.billing_address.clone()),
            notes: Set(serde_json::json!([])),
            order_date: Set(now),
            last_updated: Set(now),
            version: Set(1),
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;

        for line in &request.lines {
            order_item::ActiveModel {
                id: Set(Uuid::new_v4()),
                order_id: Set(order_id),
                item_id: Set(line.item_id),
                quantity: Set(line.quantity),
                unit_price_cents: Set(line.unit_price_cents),
                condition: Set(line.condition.clone().unwrap_or_default()),
                discount_cents: Set(line.discount_cents),
                created_at: Set(now),
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;
        }

        order_status_history::ActiveModel {
            id: Set(Uuid::new_v4()),
            order_id: Set(order_id),
            status: Set(OrderStatus::Pending.as_str().to_string()),
            changed_at: Set(now),
            changed_by: Set("system".to_string()),
            comment: Set(Some("Order created".to_string())),
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order_id = %order_id, subtotal_cents = subtotal, total_cents = total, "Order created");

        self.publish(Event::OrderCreated {
            order_id,
            customer_id: request.customer_id,
            lines: request
                .lines
                .iter()
                .map(|l| OrderLine {
                    item_id: l.item_id,
                    quantity: l.quantity,
                    unit_price_cents: l.unit_price_cents,
                })
                .collect(),
        })
        .await?;

        self.get_order(order_id).await
    }

    /// Returns the order with its lines and full status history.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn get_order(&self, order_id: Uuid) -> Result<OrderResponse, ServiceError> {
        let model = self.get_model(order_id).await?;

        let items = OrderItemEntity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .order_by_asc(order_item::Column::CreatedAt)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let history = HistoryEntity::find()
            .filter(order_status_history::Column::OrderId.eq(order_id))
            .order_by_asc(order_status_history::Column::ChangedAt)
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        response_from(model, items, history)
    }

    /// Orders for a customer, newest first.
    #[instrument(skip(self))]
    pub async fn list_orders_for_customer(
        &self,
        customer_id: Uuid,
        page: u64,
        page_size: u64,
    ) -> Result<OrderListPage, ServiceError> {
        if page == 0 {
            return Err(ServiceError::ValidationError(
                "page number must be at least 1".to_string(),
            ));
        }
        if page_size == 0 || page_size > 100 {
            return Err(ServiceError::ValidationError(
                "page size must be between 1 and 100".to_string(),
            ));
        }

        let paginator = OrderEntity::find()
            .filter(order::Column::CustomerId.eq(customer_id))
            .order_by_desc(order::Column::OrderDate)
            .paginate(&*self.db, page_size);

        let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
        let models = paginator
            .fetch_page(page - 1)
            .await
            .map_err(ServiceError::db_error)?;

        let mut orders = Vec::with_capacity(models.len());
        for model in models {
            orders.push(OrderSummary {
                id: model.id,
                customer_id: model.customer_id,
                status: parse_status(&model)?,
                payment_status: parse_payment_status(&model)?,
                inventory_status: parse_inventory_status(&model)?,
                total_cents: model.total_cents,
                order_date: model.order_date,
            });
        }

        Ok(OrderListPage {
            orders,
            total,
            page,
            page_size,
        })
    }

    /// Applies one explicit status transition, validating it against the
    /// table and appending history.
    #[instrument(skip(self, comment), fields(order_id = %order_id, new_status = %new_status))]
    pub async fn update_status(
        &self,
        order_id: Uuid,
        new_status: OrderStatus,
        comment: Option<String>,
        actor: &str,
    ) -> Result<OrderResponse, ServiceError> {
        let outcome = self
            .apply_update(order_id, actor, |_, _| {
                Ok(Some(PlannedUpdate {
                    sets: vec![],
                    transitions: vec![(new_status, comment.clone())],
                }))
            })
            .await?;

        self.emit_transition_events(&outcome, actor).await?;
        self.get_order(order_id).await
    }

    /// Cancels the order unless it has already shipped. Emits
    /// `order.cancelled`, which the reservation engine consumes to release
    /// any outstanding hold.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn cancel_order(
        &self,
        order_id: Uuid,
        reason: &str,
        actor: &str,
    ) -> Result<OrderResponse, ServiceError> {
        let reason_owned = reason.to_string();
        let outcome = self
            .apply_update(order_id, actor, |_, current| {
                if matches!(current, OrderStatus::Shipped | OrderStatus::Delivered) {
                    return Err(ServiceError::ValidationError(format!(
                        "order in status '{}' can no longer be cancelled",
                        current.as_str()
                    )));
                }
                Ok(Some(PlannedUpdate {
                    sets: vec![(
                        order::Column::CancellationReason,
                        Some(reason_owned.clone()).into(),
                    )],
                    transitions: vec![(
                        OrderStatus::Cancelled,
                        Some(format!("Cancelled: {}", reason_owned)),
                    )],
                }))
            })
            .await?;

        self.emit_transition_events(&outcome, actor).await?;
        self.publish(Event::OrderCancelled {
            order_id,
            reason: reason.to_string(),
        })
        .await?;

        self.get_order(order_id).await
    }

    /// Appends a free-text note; notes are append-only.
    #[instrument(skip(self, text), fields(order_id = %order_id))]
    pub async fn append_note(
        &self,
        order_id: Uuid,
        author: &str,
        text: &str,
    ) -> Result<(), ServiceError> {
        let actor = author.to_string();
        let author = author.to_string();
        let text = text.to_string();
        self.apply_update(order_id, &actor, |order, _| {
            let mut notes = order.notes_parsed();
            notes.push(OrderNote {
                text: text.clone(),
                author: author.clone(),
                added_at: Utc::now(),
            });
            Ok(Some(PlannedUpdate {
                sets: vec![(order::Column::Notes, serde_json::to_value(&notes)?.into())],
                transitions: vec![],
            }))
        })
        .await?;
        Ok(())
    }

    /// payment.processed handler body. On success records the payment and
    /// advances Pending orders to Processing (and straight on to
    /// ReadyForShipment when the hold already landed). On failure records
    /// the failure reason as a note and leaves the status untouched.
    #[instrument(skip(self, transaction_reference, failure_reason), fields(order_id = %order_id, success = success))]
    pub async fn apply_payment_processed(
        &self,
        order_id: Uuid,
        success: bool,
        method: &str,
        transaction_reference: Option<&str>,
        failure_reason: Option<&str>,
    ) -> Result<(), ServiceError> {
        const ACTOR: &str = "payment-processor";
        let method = method.to_string();
        let tx_ref = transaction_reference.map(str::to_string);
        let reason = failure_reason.map(str::to_string);

        let outcome = self
            .apply_update(order_id, ACTOR, |order, current| {
                if success {
                    let inventory = parse_inventory_status(order)?;
                    let mut transitions = Vec::new();
                    match current {
                        OrderStatus::Pending => {
                            transitions
                                .push((OrderStatus::Processing, Some("Payment received".into())));
                            if inventory == InventoryStatus::Reserved {
                                transitions.push((
                                    OrderStatus::ReadyForShipment,
                                    Some("Payment received and inventory reserved".into()),
                                ));
                            }
                        }
                        OrderStatus::Processing if inventory == InventoryStatus::Reserved => {
                            transitions.push((
                                OrderStatus::ReadyForShipment,
                                Some("Payment received and inventory reserved".into()),
                            ));
                        }
                        _ => {}
                    }

                    let already_paid = parse_payment_status(order)? == PaymentStatus::Paid;
                    if already_paid && transitions.is_empty() {
                        return Ok(None);
                    }

                    Ok(Some(PlannedUpdate {
                        sets: vec![
                            (
                                order::Column::PaymentStatus,
                                PaymentStatus::Paid.as_str().into(),
                            ),
                            (order::Column::PaymentMethod, Some(method.clone()).into()),
                            (order::Column::PaymentTransactionRef, tx_ref.clone().into()),
                        ],
                        transitions,
                    }))
                } else {
                    if parse_payment_status(order)? == PaymentStatus::Failed {
                        return Ok(None);
                    }
                    let mut notes = order.notes_parsed();
                    notes.push(OrderNote {
                        text: format!(
                            "Payment failed: {}",
                            reason.clone().unwrap_or_else(|| "unknown reason".into())
                        ),
                        author: ACTOR.to_string(),
                        added_at: Utc::now(),
                    });
                    Ok(Some(PlannedUpdate {
                        sets: vec![
                            (
                                order::Column::PaymentStatus,
                                PaymentStatus::Failed.as_str().into(),
                            ),
                            (order::Column::Notes, serde_json::to_value(&notes)?.into()),
                        ],
                        transitions: vec![],
                    }))
                }
            })
            .await?;

        self.emit_transition_events(&outcome, ACTOR).await?;
        Ok(())
    }

    /// inventory.reserved handler body.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn apply_inventory_reserved(
        &self,
        order_id: Uuid,
        expires_at: DateTime<Utc>,
    ) -> Result<(), ServiceError> {
        const ACTOR: &str = "reservation-engine";

        let outcome = self
            .apply_update(order_id, ACTOR, |order, current| {
                let mut transitions = Vec::new();
                if current == OrderStatus::Processing
                    && parse_payment_status(order)? == PaymentStatus::Paid
                {
                    transitions.push((
                        OrderStatus::ReadyForShipment,
                        Some("Inventory reserved".into()),
                    ));
                }

                let already_reserved =
                    parse_inventory_status(order)? == InventoryStatus::Reserved
                        && order.reservation_expires_at == Some(expires_at);
                if already_reserved && transitions.is_empty() {
                    return Ok(None);
                }

                Ok(Some(PlannedUpdate {
                    sets: vec![
                        (
                            order::Column::InventoryStatus,
                            InventoryStatus::Reserved.as_str().into(),
                        ),
                        (
                            order::Column::ReservationExpiresAt,
                            Some(expires_at).into(),
                        ),
                    ],
                    transitions,
                }))
            })
            .await?;

        self.emit_transition_events(&outcome, ACTOR).await?;
        Ok(())
    }

    /// inventory.reservation.failed handler body: marks the shortfall and
    /// parks the order on hold.
    #[instrument(skip(self, unavailable), fields(order_id = %order_id))]
    pub async fn apply_reservation_failed(
        &self,
        order_id: Uuid,
        reason: &str,
        unavailable: &[UnavailableItem],
    ) -> Result<(), ServiceError> {
        const ACTOR: &str = "reservation-engine";
        let reason = reason.to_string();
        let unavailable = unavailable.to_vec();

        let outcome = self
            .apply_update(order_id, ACTOR, |order, current| {
                let already_failed = parse_inventory_status(order)? == InventoryStatus::Failed;
                let can_hold = matches!(
                    current,
                    OrderStatus::Pending | OrderStatus::Processing | OrderStatus::ReadyForShipment
                );
                if already_failed && !can_hold {
                    return Ok(None);
                }

                let shortfall = unavailable
                    .iter()
                    .map(|u| {
                        format!(
                            "{} ({}): requested {}, available {}",
                            u.item_name, u.item_id, u.requested, u.available
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("; ");
                let mut notes = order.notes_parsed();
                notes.push(OrderNote {
                    text: format!("Inventory reservation failed ({}): {}", reason, shortfall),
                    author: ACTOR.to_string(),
                    added_at: Utc::now(),
                });

                let transitions = if can_hold {
                    vec![(
                        OrderStatus::OnHold,
                        Some("Inventory reservation failed".into()),
                    )]
                } else {
                    vec![]
                };

                Ok(Some(PlannedUpdate {
                    sets: vec![
                        (
                            order::Column::InventoryStatus,
                            InventoryStatus::Failed.as_str().into(),
                        ),
                        (order::Column::Notes, serde_json::to_value(&notes)?.into()),
                    ],
                    transitions,
                }))
            })
            .await?;

        self.emit_transition_events(&outcome, ACTOR).await?;
        Ok(())
    }

    /// shipping.rate.calculated handler body. The total is recomputed from
    /// parts on every quote; a re-quote never accumulates.
    #[instrument(skip(self), fields(order_id = %order_id, shipping_cost_cents = shipping_cost_cents))]
    pub async fn apply_shipping_rate(
        &self,
        order_id: Uuid,
        shipping_cost_cents: i64,
        shipping_method: &str,
        estimated_delivery_date: Option<DateTime<Utc>>,
        tracking_number: Option<&str>,
        carrier: Option<&str>,
    ) -> Result<(), ServiceError> {
        const ACTOR: &str = "shipping-calculator";
        if shipping_cost_cents < 0 {
            return Err(ServiceError::ValidationError(
                "shipping cost must not be negative".to_string(),
            ));
        }
        let method = shipping_method.to_string();
        let tracking = tracking_number.map(str::to_string);
        let carrier_owned = carrier.map(str::to_string);

        let outcome = self
            .apply_update(order_id, ACTOR, |order, current| {
                let total =
                    money::order_total(order.subtotal_cents, order.tax_cents, shipping_cost_cents)?;

                let mut sets = vec![
                    (order::Column::ShippingCents, shipping_cost_cents.into()),
                    (order::Column::TotalCents, total.into()),
                    (order::Column::ShippingMethod, Some(method.clone()).into()),
                    (
                        order::Column::EstimatedDeliveryDate,
                        estimated_delivery_date.into(),
                    ),
                ];
                if let Some(carrier) = &carrier_owned {
                    sets.push((
                        order::Column::ShippingCarrier,
                        Some(carrier.clone()).into(),
                    ));
                }

                let mut transitions = Vec::new();
                if let Some(tracking) = &tracking {
                    sets.push((
                        order::Column::TrackingNumber,
                        Some(tracking.clone()).into(),
                    ));
                    if matches!(
                        current,
                        OrderStatus::ReadyForShipment | OrderStatus::Processing
                    ) {
                        transitions
                            .push((OrderStatus::Shipped, Some("Tracking number assigned".into())));
                    }
                }

                let unchanged = order.shipping_cents == shipping_cost_cents
                    && order.total_cents == total
                    && order.shipping_method.as_deref() == Some(method.as_str())
                    && order.tracking_number == tracking
                    && transitions.is_empty();
                if unchanged {
                    return Ok(None);
                }

                Ok(Some(PlannedUpdate { sets, transitions }))
            })
            .await?;

        self.emit_transition_events(&outcome, ACTOR).await?;

        if outcome.transitions.contains(&OrderStatus::Shipped) {
            self.publish(Event::OrderShipped {
                order_id,
                tracking_number: tracking_number.unwrap_or_default().to_string(),
                carrier: carrier.map(str::to_string),
            })
            .await?;
        }
        Ok(())
    }

    /// order.reservation.expired handler body: the hold is gone, so the
    /// order goes on hold pending remediation.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn apply_reservation_expired(&self, order_id: Uuid) -> Result<(), ServiceError> {
        const ACTOR: &str = "reservation-engine";

        let outcome = self
            .apply_update(order_id, ACTOR, |order, current| {
                let already_released =
                    parse_inventory_status(order)? == InventoryStatus::Released;
                let can_hold = matches!(
                    current,
                    OrderStatus::Pending | OrderStatus::Processing | OrderStatus::ReadyForShipment
                );
                if already_released && !can_hold {
                    return Ok(None);
                }

                let transitions = if can_hold {
                    vec![(OrderStatus::OnHold, Some("Reservation expired".into()))]
                } else {
                    vec![]
                };

                Ok(Some(PlannedUpdate {
                    sets: vec![
                        (
                            order::Column::InventoryStatus,
                            InventoryStatus::Released.as_str().into(),
                        ),
                        (
                            order::Column::ReservationExpiresAt,
                            Option::<DateTime<Utc>>::None.into(),
                        ),
                    ],
                    transitions,
                }))
            })
            .await?;

        self.emit_transition_events(&outcome, ACTOR).await?;
        Ok(())
    }

    /// Marks a terminal order refunded. This is a payment-status-only
    /// change; the order's lifecycle status does not move.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn mark_refunded(
        &self,
        order_id: Uuid,
        reason: &str,
        actor: &str,
    ) -> Result<OrderResponse, ServiceError> {
        let reason = reason.to_string();
        let author = actor.to_string();
        self.apply_update(order_id, actor, |order, current| {
            if !current.is_terminal() {
                return Err(ServiceError::ValidationError(format!(
                    "order in status '{}' cannot be refunded",
                    current.as_str()
                )));
            }
            if parse_payment_status(order)? == PaymentStatus::Refunded {
                return Ok(None);
            }
            if parse_payment_status(order)? != PaymentStatus::Paid {
                return Err(ServiceError::ValidationError(
                    "only a paid order can be refunded".to_string(),
                ));
            }

            let mut notes = order.notes_parsed();
            notes.push(OrderNote {
                text: format!("Refunded: {}", reason),
                author: author.clone(),
                added_at: Utc::now(),
            });
            Ok(Some(PlannedUpdate {
                sets: vec![
                    (
                        order::Column::PaymentStatus,
                        PaymentStatus::Refunded.as_str().into(),
                    ),
                    (order::Column::Notes, serde_json::to_value(&notes)?.into()),
                ],
                transitions: vec![],
            }))
        })
        .await?;

        self.get_order(order_id).await
    }

    /// Marks the inventory side of the order as finally confirmed or
    /// released, without touching the status walk.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn set_inventory_status(
        &self,
        order_id: Uuid,
        inventory_status: InventoryStatus,
    ) -> Result<(), ServiceError> {
        self.apply_update(order_id, "reservation-engine", |order, _| {
            if parse_inventory_status(order)? == inventory_status {
                return Ok(None);
            }
            Ok(Some(PlannedUpdate {
                sets: vec![(
                    order::Column::InventoryStatus,
                    inventory_status.as_str().into(),
                )],
                transitions: vec![],
            }))
        })
        .await?;
        Ok(())
    }

    async fn get_model(&self, order_id: Uuid) -> Result<order::Model, ServiceError> {
        OrderEntity::find_by_id(order_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("order {}", order_id)))
    }

    /// The CAS core. Reads the order, lets `decide` plan column writes and
    /// transition steps, validates the steps against the table, and applies
    /// everything behind a version check. A losing writer re-reads once and
    /// re-decides before giving up with a conflict.
    async fn apply_update<F>(
        &self,
        order_id: Uuid,
        actor: &str,
        decide: F,
    ) -> Result<ApplyOutcome, ServiceError>
    where
        F: Fn(&order::Model, OrderStatus) -> Result<Option<PlannedUpdate>, ServiceError>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;

            let model = self.get_model(order_id).await?;
            let current = parse_status(&model)?;

            let planned = match decide(&model, current)? {
                Some(planned) => planned,
                None => {
                    return Ok(ApplyOutcome {
                        order: model,
                        previous_status: current,
                        transitions: vec![],
                    });
                }
            };

            let mut walk_from = current;
            for (to, _) in &planned.transitions {
                if !walk_from.can_transition_to(*to) {
                    return Err(ServiceError::InvalidTransition {
                        from: walk_from.as_str().to_string(),
                        to: to.as_str().to_string(),
                    });
                }
                walk_from = *to;
            }

            let now = Utc::now();
            let mut sets = planned.sets;
            if let Some((final_status, _)) = planned.transitions.last() {
                sets.push((order::Column::Status, final_status.as_str().into()));
                for (to, _) in &planned.transitions {
                    match to {
                        OrderStatus::ReadyForShipment => {
                            sets.push((order::Column::PackingDate, Some(now).into()));
                        }
                        OrderStatus::Shipped => {
                            sets.push((order::Column::ShippingDate, Some(now).into()));
                        }
                        OrderStatus::Delivered => {
                            sets.push((order::Column::DeliveryDate, Some(now).into()));
                        }
                        OrderStatus::Cancelled => {
                            sets.push((order::Column::CancellationDate, Some(now).into()));
                        }
                        _ => {}
                    }
                }
            }

            let txn = self.db.begin().await.map_err(ServiceError::db_error)?;
            let updated = exec_cas(&txn, model.id, model.version, now, sets).await?;
            if !updated {
                txn.rollback().await.map_err(ServiceError::db_error)?;
                if attempt < 2 {
                    warn!(order_id = %order_id, "Lost order version race, re-reading");
                    continue;
                }
                return Err(ServiceError::Conflict(format!(
                    "concurrent update on order {}",
                    order_id
                )));
            }

            for (to, comment) in &planned.transitions {
                order_status_history::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    order_id: Set(order_id),
                    status: Set(to.as_str().to_string()),
                    changed_at: Set(now),
                    changed_by: Set(actor.to_string()),
                    comment: Set(comment.clone()),
                }
                .insert(&txn)
                .await
                .map_err(ServiceError::db_error)?;
            }

            txn.commit().await.map_err(ServiceError::db_error)?;

            let fresh = self.get_model(order_id).await?;
            return Ok(ApplyOutcome {
                order: fresh,
                previous_status: current,
                transitions: planned.transitions.iter().map(|(to, _)| *to).collect(),
            });
        }
    }

    /// Emits `order.status.changed` per walk step, plus the dedicated
    /// `order.delivered` signal the reservation engine confirms against.
    async fn emit_transition_events(
        &self,
        outcome: &ApplyOutcome,
        actor: &str,
    ) -> Result<(), ServiceError> {
        let mut from = outcome.previous_status;
        for to in &outcome.transitions {
            self.publish(Event::OrderStatusChanged {
                order_id: outcome.order.id,
                old_status: from,
                new_status: *to,
                actor: actor.to_string(),
            })
            .await?;
            if *to == OrderStatus::Delivered {
                self.publish(Event::OrderDelivered {
                    order_id: outcome.order.id,
                })
                .await?;
            }
            from = *to;
        }
        Ok(())
    }

    async fn publish(&self, event: Event) -> Result<(), ServiceError> {
        self.queue
            .publish(&EventEnvelope::new(event))
            .await
            .map_err(|e| ServiceError::QueueError(e.to_string()))
    }
}

async fn exec_cas<C: ConnectionTrait>(
    conn: &C,
    order_id: Uuid,
    expected_version: i32,
    now: DateTime<Utc>,
    sets: Vec<(order::Column, Value)>,
) -> Result<bool, ServiceError> {
    let mut update = OrderEntity::update_many()
        .col_expr(order::Column::LastUpdated, Expr::value(now))
        .col_expr(order::Column::Version, Expr::value(expected_version + 1));
    for (column, value) in sets {
        update = update.col_expr(column, Expr::value(value));
    }

    let result = update
        .filter(order::Column::Id.eq(order_id))
        .filter(order::Column::Version.eq(expected_version))
        .exec(conn)
        .await
        .map_err(ServiceError::db_error)?;

    Ok(result.rows_affected == 1)
}

fn parse_status(model: &order::Model) -> Result<OrderStatus, ServiceError> {
    model.status_parsed().ok_or_else(|| {
        ServiceError::InvariantViolation(format!(
            "order {} has unknown status '{}'",
            model.id, model.status
        ))
    })
}

fn parse_payment_status(model: &order::Model) -> Result<PaymentStatus, ServiceError> {
    model.payment_status_parsed().ok_or_else(|| {
        ServiceError::InvariantViolation(format!(
            "order {} has unknown payment status '{}'",
            model.id, model.payment_status
        ))
    })
}

fn parse_inventory_status(model: &order::Model) -> Result<InventoryStatus, ServiceError> {
    model.inventory_status_parsed().ok_or_else(|| {
        ServiceError::InvariantViolation(format!(
            "order {} has unknown inventory status '{}'",
            model.id, model.inventory_status
        ))
    })
}

fn response_from(
    model: order::Model,
    items: Vec<order_item::Model>,
    history: Vec<order_status_history::Model>,
) -> Result<OrderResponse, ServiceError> {
    let status = parse_status(&model)?;
    let payment_status = parse_payment_status(&model)?;
    let inventory_status = parse_inventory_status(&model)?;

    let mut history_entries = Vec::with_capacity(history.len());
    for entry in history {
        let status = OrderStatus::parse(&entry.status).ok_or_else(|| {
            ServiceError::InvariantViolation(format!(
                "history entry {} has unknown status '{}'",
                entry.id, entry.status
            ))
        })?;
        history_entries.push(StatusHistoryEntry {
            status,
            changed_at: entry.changed_at,
            changed_by: entry.changed_by,
            comment: entry.comment,
        });
    }

    Ok(OrderResponse {
        id: model.id,
        customer_id: model.customer_id,
        status,
        payment_status,
        inventory_status,
        subtotal_cents: model.subtotal_cents,
        tax_cents: model.tax_cents,
        shipping_cents: model.shipping_cents,
        total_cents: model.total_cents,
        shipping_carrier: model.shipping_carrier,
        shipping_method: model.shipping_method,
        tracking_number: model.tracking_number,
        estimated_delivery_date: model.estimated_delivery_date,
        packing_date: model.packing_date,
        shipping_date: model.shipping_date,
        delivery_date: model.delivery_date,
        cancellation_date: model.cancellation_date,
        cancellation_reason: model.cancellation_reason,
        payment_method: model.payment_method,
        payment_transaction_ref: model.payment_transaction_ref,
        reservation_expires_at: model.reservation_expires_at,
        shipping_address: model.shipping_address,
        billing_address: model.billing_address,
        notes: serde_json::from_value(model.notes).unwrap_or_default(),
        order_date: model.order_date,
        last_updated: model.last_updated,
        version: model.version,
        items: items
            .into_iter()
            .map(|item| OrderItemResponse {
                item_id: item.item_id,
                quantity: item.quantity,
                unit_price_cents: item.unit_price_cents,
                condition: item.condition,
                discount_cents: item.discount_cents,
            })
            .collect(),
        history: history_entries,
    })
}
