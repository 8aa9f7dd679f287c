//! Inventory reservation engine.
//!
//! Translates inventory intents into atomic updates of items and
//! reservations: `reserve` places a time-bounded hold, `confirm` consumes
//! the held stock, `release` returns it, and `sweep_expired` reclaims holds
//! past their TTL. Every mutation runs inside a single store transaction;
//! either every line of a reservation commits or none does.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseTransaction, EntityTrait, QueryFilter, QueryOrder, Set,
    TransactionTrait,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::db::DbPool;
use crate::entities::reservation::{self, Entity as ReservationEntity};
use crate::entities::reservation_line::{self, Entity as ReservationLineEntity};
use crate::entities::{item, ReservationStatus};
use crate::errors::ServiceError;
use crate::events::{Event, EventEnvelope, OrderLine, UnavailableItem};
use crate::message_queue::MessageQueue;

/// One requested hold line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReserveLine {
    pub item_id: Uuid,
    pub quantity: i32,
}

/// Result of a `reserve` call. Shortfall is an outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReserveOutcome {
    Reserved {
        reservation_id: Uuid,
        expires_at: DateTime<Utc>,
    },
    Unavailable(Vec<UnavailableItem>),
}

/// Result of one sweep pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SweepOutcome {
    pub expired_count: u64,
    pub swept_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct ReservationEngine {
    db: Arc<DbPool>,
    queue: Arc<dyn MessageQueue>,
    default_ttl: Duration,
    low_stock_threshold: i32,
}

impl ReservationEngine {
    pub fn new(
        db: Arc<DbPool>,
        queue: Arc<dyn MessageQueue>,
        default_ttl: Duration,
        low_stock_threshold: i32,
    ) -> Self {
        Self {
            db,
            queue,
            default_ttl,
            low_stock_threshold,
        }
    }

    /// Places a hold for `order_id`. Within one transaction each line's
    /// item is checked against its free quantity; if every line fits, the
    /// holds commit together, otherwise nothing commits and the full
    /// shortfall list is returned.
    #[instrument(skip(self, lines), fields(order_id = %order_id, line_count = lines.len()))]
    pub async fn reserve(
        &self,
        order_id: Uuid,
        user_id: Uuid,
        lines: &[ReserveLine],
        ttl: Option<Duration>,
    ) -> Result<ReserveOutcome, ServiceError> {
        validate_lines(lines)?;

        let now = Utc::now();
        let ttl = ttl.unwrap_or(self.default_ttl);
        let expires_at = now
            + chrono::Duration::from_std(ttl).map_err(|_| {
                ServiceError::ValidationError("reservation TTL out of range".to_string())
            })?;

        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        if let Some(existing) = latest_reservation(&txn, order_id).await? {
            if matches!(
                existing.status_parsed(),
                Some(ReservationStatus::Active) | Some(ReservationStatus::Confirmed)
            ) {
                txn.rollback().await.map_err(ServiceError::db_error)?;
                return Err(ServiceError::Conflict(format!(
                    "reservation already exists for order {}",
                    order_id
                )));
            }
        }

        let mut unavailable: Vec<UnavailableItem> = Vec::new();
        let mut held: Vec<(item::Model, i32)> = Vec::new();

        for line in lines {
            let item = item::Entity::find_by_id(line.item_id)
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| ServiceError::NotFound(format!("item {}", line.item_id)))?;

            let free = item.free_quantity();
            if free < line.quantity {
                unavailable.push(UnavailableItem {
                    item_id: item.id,
                    item_name: item.name.clone(),
                    requested: line.quantity,
                    available: free,
                });
                continue;
            }

            let mut active: item::ActiveModel = item.clone().into();
            active.reserved_quantity = Set(item.reserved_quantity + line.quantity);
            active.last_updated = Set(now);
            active.update(&txn).await.map_err(ServiceError::db_error)?;

            held.push((item, line.quantity));
        }

        if !unavailable.is_empty() {
            txn.rollback().await.map_err(ServiceError::db_error)?;
            warn!(
                order_id = %order_id,
                unavailable_count = unavailable.len(),
                "Reservation failed, stock unavailable"
            );
            self.publish(Event::InventoryReservationFailed {
                order_id,
                reason: "insufficient stock".to_string(),
                unavailable: unavailable.clone(),
            })
            .await?;
            return Ok(ReserveOutcome::Unavailable(unavailable));
        }

        let reservation_id = Uuid::new_v4();
        reservation::ActiveModel {
            id: Set(reservation_id),
            order_id: Set(order_id),
            user_id: Set(user_id),
            status: Set(ReservationStatus::Active.as_str().to_string()),
            created_at: Set(now),
            expires_at: Set(expires_at),
            confirmed_at: Set(None),
            released_at: Set(None),
        }
        .insert(&txn)
        .await
        .map_err(ServiceError::db_error)?;

        let mut event_lines = Vec::with_capacity(held.len());
        for (item, quantity) in &held {
            reservation_line::ActiveModel {
                id: Set(Uuid::new_v4()),
                reservation_id: Set(reservation_id),
                item_id: Set(item.id),
                quantity: Set(*quantity),
                unit_price_cents: Set(item.price_cents),
                item_name: Set(item.name.clone()),
            }
            .insert(&txn)
            .await
            .map_err(ServiceError::db_error)?;

            event_lines.push(OrderLine {
                item_id: item.id,
                quantity: *quantity,
                unit_price_cents: item.price_cents,
            });
        }

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(
            order_id = %order_id,
            reservation_id = %reservation_id,
            expires_at = %expires_at,
            "Reservation placed"
        );

        self.publish(Event::InventoryReserved {
            order_id,
            reservation_id,
            expires_at,
            lines: event_lines,
        })
        .await?;

        Ok(ReserveOutcome::Reserved {
            reservation_id,
            expires_at,
        })
    }

    /// Consumes the held stock: both `available` and `reserved` drop by the
    /// held quantity and the reservation becomes Confirmed. Confirming an
    /// already-Confirmed reservation is a no-op.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn confirm(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let now = Utc::now();
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let reservation = latest_reservation(&txn, order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("reservation for order {}", order_id)))?;

        match reservation.status_parsed() {
            Some(ReservationStatus::Confirmed) => {
                txn.rollback().await.map_err(ServiceError::db_error)?;
                return Ok(());
            }
            Some(ReservationStatus::Released) | Some(ReservationStatus::Expired) => {
                txn.rollback().await.map_err(ServiceError::db_error)?;
                return Err(ServiceError::Conflict(format!(
                    "reservation for order {} is {}, cannot confirm",
                    order_id, reservation.status
                )));
            }
            Some(ReservationStatus::Active) => {}
            None => {
                return Err(ServiceError::InvariantViolation(format!(
                    "reservation {} has unknown status '{}'",
                    reservation.id, reservation.status
                )));
            }
        }

        let lines = reservation_lines(&txn, reservation.id).await?;
        let mut quantity_changes = Vec::with_capacity(lines.len());

        for line in &lines {
            let item = item::Entity::find_by_id(line.item_id)
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?
                .ok_or_else(|| {
                    ServiceError::InvariantViolation(format!(
                        "reservation {} references missing item {}",
                        reservation.id, line.item_id
                    ))
                })?;

            let new_available = item.available_quantity - line.quantity;
            let new_reserved = item.reserved_quantity - line.quantity;
            if new_available < 0 || new_reserved < 0 {
                return Err(ServiceError::InvariantViolation(format!(
                    "confirming reservation {} would drive item {} negative",
                    reservation.id, item.id
                )));
            }

            let old_available = item.available_quantity;
            let mut active: item::ActiveModel = item.clone().into();
            active.available_quantity = Set(new_available);
            active.reserved_quantity = Set(new_reserved);
            active.last_updated = Set(now);
            active.update(&txn).await.map_err(ServiceError::db_error)?;

            quantity_changes.push((item.id, old_available, new_available, new_reserved));
        }

        let mut active: reservation::ActiveModel = reservation.clone().into();
        active.status = Set(ReservationStatus::Confirmed.as_str().to_string());
        active.confirmed_at = Set(Some(now));
        active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order_id = %order_id, reservation_id = %reservation.id, "Reservation confirmed");

        for (item_id, old_available, new_available, new_reserved) in quantity_changes {
            self.publish(Event::InventoryQuantityChanged {
                item_id,
                old_available,
                new_available,
                reason: "reservation_confirmed".to_string(),
            })
            .await?;
            self.maybe_emit_low_stock(item_id, new_available, new_reserved)
                .await?;
        }

        Ok(())
    }

    /// Returns the held quantity to free stock. Releasing a reservation
    /// that is already Released or Expired is a no-op success.
    #[instrument(skip(self), fields(order_id = %order_id))]
    pub async fn release(&self, order_id: Uuid) -> Result<(), ServiceError> {
        let now = Utc::now();
        let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

        let reservation = latest_reservation(&txn, order_id)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("reservation for order {}", order_id)))?;

        match reservation.status_parsed() {
            Some(ReservationStatus::Released) | Some(ReservationStatus::Expired) => {
                txn.rollback().await.map_err(ServiceError::db_error)?;
                return Ok(());
            }
            Some(ReservationStatus::Confirmed) => {
                txn.rollback().await.map_err(ServiceError::db_error)?;
                return Err(ServiceError::Conflict(format!(
                    "reservation for order {} is confirmed, cannot release",
                    order_id
                )));
            }
            Some(ReservationStatus::Active) => {}
            None => {
                return Err(ServiceError::InvariantViolation(format!(
                    "reservation {} has unknown status '{}'",
                    reservation.id, reservation.status
                )));
            }
        }

        release_lines(&txn, &reservation, now).await?;

        let mut active: reservation::ActiveModel = reservation.clone().into();
        active.status = Set(ReservationStatus::Released.as_str().to_string());
        active.released_at = Set(Some(now));
        active.update(&txn).await.map_err(ServiceError::db_error)?;

        txn.commit().await.map_err(ServiceError::db_error)?;

        info!(order_id = %order_id, reservation_id = %reservation.id, "Reservation released");
        Ok(())
    }

    /// Reclaims every Active reservation whose TTL has passed, one
    /// expiration event per reservation. A hold expiring at exactly `now`
    /// is reclaimed.
    #[instrument(skip(self))]
    pub async fn sweep_expired(&self, now: DateTime<Utc>) -> Result<SweepOutcome, ServiceError> {
        let candidates = ReservationEntity::find()
            .filter(reservation::Column::Status.eq(ReservationStatus::Active.as_str()))
            .filter(reservation::Column::ExpiresAt.lte(now))
            .all(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        let mut expired_count = 0u64;

        for candidate in candidates {
            let txn = self.db.begin().await.map_err(ServiceError::db_error)?;

            // Re-read inside the transaction; a concurrent confirm or
            // release may have won.
            let reservation = match ReservationEntity::find_by_id(candidate.id)
                .one(&txn)
                .await
                .map_err(ServiceError::db_error)?
            {
                Some(r) if r.status_parsed() == Some(ReservationStatus::Active) => r,
                _ => {
                    txn.rollback().await.map_err(ServiceError::db_error)?;
                    continue;
                }
            };

            release_lines(&txn, &reservation, now).await?;

            let mut active: reservation::ActiveModel = reservation.clone().into();
            active.status = Set(ReservationStatus::Expired.as_str().to_string());
            active.released_at = Set(Some(now));
            active.update(&txn).await.map_err(ServiceError::db_error)?;

            txn.commit().await.map_err(ServiceError::db_error)?;

            expired_count += 1;
            info!(
                reservation_id = %reservation.id,
                order_id = %reservation.order_id,
                "Reservation expired"
            );

            self.publish(Event::ReservationExpired {
                order_id: reservation.order_id,
                reservation_id: reservation.id,
                expired_at: now,
            })
            .await?;
        }

        Ok(SweepOutcome {
            expired_count,
            swept_at: now,
        })
    }

    /// The most recent reservation for an order in any state, with lines.
    pub async fn get_reservation_by_order(
        &self,
        order_id: Uuid,
    ) -> Result<Option<(reservation::Model, Vec<reservation_line::Model>)>, ServiceError> {
        let reservation = ReservationEntity::find()
            .filter(reservation::Column::OrderId.eq(order_id))
            .order_by_desc(reservation::Column::CreatedAt)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        match reservation {
            Some(reservation) => {
                let lines = ReservationLineEntity::find()
                    .filter(reservation_line::Column::ReservationId.eq(reservation.id))
                    .all(&*self.db)
                    .await
                    .map_err(ServiceError::db_error)?;
                Ok(Some((reservation, lines)))
            }
            None => Ok(None),
        }
    }

    async fn maybe_emit_low_stock(
        &self,
        item_id: Uuid,
        available: i32,
        reserved: i32,
    ) -> Result<(), ServiceError> {
        if available - reserved < self.low_stock_threshold {
            self.publish(Event::InventoryQuantityLow {
                item_id,
                available,
                threshold: self.low_stock_threshold,
            })
            .await?;
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

fn validate_lines(lines: &[ReserveLine]) -> Result<(), ServiceError> {
    if lines.is_empty() {
        return Err(ServiceError::ValidationError(
            "reservation requires at least one line".to_string(),
        ));
    }
    for line in lines {
        if line.quantity < 1 {
            return Err(ServiceError::ValidationError(format!(
                "quantity for item {} must be at least 1",
                line.item_id
            )));
        }
    }
    let mut ids: Vec<Uuid> = lines.iter().map(|l| l.item_id).collect();
    ids.sort_unstable();
    ids.dedup();
    if ids.len() != lines.len() {
        return Err(ServiceError::ValidationError(
            "duplicate item in reservation lines".to_string(),
        ));
    }
    Ok(())
}

async fn latest_reservation(
    txn: &DatabaseTransaction,
    order_id: Uuid,
) -> Result<Option<reservation::Model>, ServiceError> {
    ReservationEntity::find()
        .filter(reservation::Column::OrderId.eq(order_id))
        .order_by_desc(reservation::Column::CreatedAt)
        .one(txn)
        .await
        .map_err(ServiceError::db_error)
}

async fn reservation_lines(
    txn: &DatabaseTransaction,
    reservation_id: Uuid,
) -> Result<Vec<reservation_line::Model>, ServiceError> {
    ReservationLineEntity::find()
        .filter(reservation_line::Column::ReservationId.eq(reservation_id))
        .all(txn)
        .await
        .map_err(ServiceError::db_error)
}

/// Returns each held line's quantity to the item's free pool.
async fn release_lines(
    txn: &DatabaseTransaction,
    reservation: &reservation::Model,
    now: DateTime<Utc>,
) -> Result<(), ServiceError> {
    let lines = reservation_lines(txn, reservation.id).await?;

    for line in &lines {
        let item = item::Entity::find_by_id(line.item_id)
            .one(txn)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| {
                ServiceError::InvariantViolation(format!(
                    "reservation {} references missing item {}",
                    reservation.id, line.item_id
                ))
            })?;

        let new_reserved = item.reserved_quantity - line.quantity;
        if new_reserved < 0 {
            return Err(ServiceError::InvariantViolation(format!(
                "releasing reservation {} would drive item {} reserved negative",
                reservation.id, item.id
            )));
        }

        let mut active: item::ActiveModel = item.into();
        active.reserved_quantity = Set(new_reserved);
        active.last_updated = Set(now);
        active.update(txn).await.map_err(ServiceError::db_error)?;
    }

    Ok(())
}
