//! Catalog admin path over the item store.
//!
//! The only other permitted mutator of item quantities is the reservation
//! engine; this service covers seller-owned descriptive fields plus
//! `available_quantity` adjustments when no Active reservation references
//! the item.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, EntityTrait, PaginatorTrait, QueryFilter, QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use tracing::{info, instrument, warn};
use uuid::Uuid;
use validator::Validate;

use crate::db::DbPool;
use crate::entities::item::{self, Entity as ItemEntity, ItemDetails};
use crate::entities::reservation::{self, Entity as ReservationEntity};
use crate::entities::reservation_line::{self, Entity as ReservationLineEntity};
use crate::entities::ReservationStatus;
use crate::errors::ServiceError;
use crate::events::{Event, EventEnvelope};
use crate::message_queue::MessageQueue;
use crate::money;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct UpsertItemRequest {
    /// Present when replacing an existing listing.
    pub id: Option<Uuid>,
    #[validate(length(min = 1, max = 200, message = "Item name is required"))]
    pub name: String,
    #[validate(length(min = 1, max = 16, message = "Set code is required"))]
    pub set_code: String,
    #[validate(length(min = 1, max = 16, message = "Collector number is required"))]
    pub collector_number: String,
    #[validate(length(min = 1, message = "Rarity is required"))]
    pub rarity: String,
    #[validate(length(min = 1, message = "Condition is required"))]
    pub condition: String,
    #[validate(length(min = 2, max = 8, message = "Language code is required"))]
    pub language: String,
    pub foil: bool,
    pub details: ItemDetails,
    /// Decimal dollars as entered by the seller; stored as integer cents.
    pub price: Decimal,
    pub available_quantity: i32,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ItemPatch {
    pub name: Option<String>,
    pub condition: Option<String>,
    pub price: Option<Decimal>,
    pub available_quantity: Option<i32>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ItemListPage {
    pub items: Vec<item::Model>,
    pub total: u64,
    pub page: u64,
    pub page_size: u64,
}

#[derive(Clone)]
pub struct ItemService {
    db: Arc<DbPool>,
    queue: Arc<dyn MessageQueue>,
    low_stock_threshold: i32,
}

impl ItemService {
    pub fn new(db: Arc<DbPool>, queue: Arc<dyn MessageQueue>, low_stock_threshold: i32) -> Self {
        Self {
            db,
            queue,
            low_stock_threshold,
        }
    }

    #[instrument(skip(self), fields(item_id = %item_id))]
    pub async fn get_item(&self, item_id: Uuid) -> Result<item::Model, ServiceError> {
        ItemEntity::find_by_id(item_id)
            .one(&*self.db)
            .await
            .map_err(ServiceError::db_error)?
            .ok_or_else(|| ServiceError::NotFound(format!("item {}", item_id)))
    }

    /// Creates or replaces a listing. New items always start with
    /// `reserved_quantity = 0`; replacing never touches the reserved count.
    #[instrument(skip(self, request), fields(seller_id = %seller_id))]
    pub async fn upsert_item(
        &self,
        seller_id: Uuid,
        request: UpsertItemRequest,
    ) -> Result<item::Model, ServiceError> {
        request
            .validate()
            .map_err(|e| ServiceError::ValidationError(e.to_string()))?;
        if request.available_quantity < 0 {
            return Err(ServiceError::ValidationError(
                "available quantity must not be negative".to_string(),
            ));
        }
        let price_cents = money::decimal_to_cents(request.price)?;
        let details = serde_json::to_value(&request.details)?;
        let now = Utc::now();

        if let Some(id) = request.id {
            let existing = self.get_item(id).await?;
            if existing.seller_id != seller_id {
                return Err(ServiceError::Conflict(format!(
                    "item {} belongs to another seller",
                    id
                )));
            }
            if existing.available_quantity != request.available_quantity {
                self.ensure_no_active_reservation(id).await?;
            }

            let old_available = existing.available_quantity;
            let mut active: item::ActiveModel = existing.into();
            active.name = Set(request.name);
            active.set_code = Set(request.set_code);
            active.collector_number = Set(request.collector_number);
            active.rarity = Set(request.rarity);
            active.condition = Set(request.condition);
            active.language = Set(request.language);
            active.foil = Set(request.foil);
            active.kind = Set(request.details.kind().as_str().to_string());
            active.details = Set(details);
            active.price_cents = Set(price_cents);
            active.available_quantity = Set(request.available_quantity);
            active.image_url = Set(request.image_url);
            active.last_updated = Set(now);

            let updated = active.update(&*self.db).await.map_err(ServiceError::db_error)?;
            self.emit_quantity_events(&updated, old_available, "listing_replaced")
                .await?;
            info!(item_id = %updated.id, "Item listing replaced");
            return Ok(updated);
        }

        let model = item::ActiveModel {
            id: Set(Uuid::new_v4()),
            seller_id: Set(seller_id),
            name: Set(request.name),
            set_code: Set(request.set_code),
            collector_number: Set(request.collector_number),
            rarity: Set(request.rarity),
            condition: Set(request.condition),
            language: Set(request.language),
            foil: Set(request.foil),
            kind: Set(request.details.kind().as_str().to_string()),
            details: Set(details),
            price_cents: Set(price_cents),
            available_quantity: Set(request.available_quantity),
            reserved_quantity: Set(0),
            image_url: Set(request.image_url),
            created_at: Set(now),
            last_updated: Set(now),
        }
        .insert(&*self.db)
        .await
        .map_err(ServiceError::db_error)?;

        info!(item_id = %model.id, "Item listed");
        Ok(model)
    }

    /// Partial update for seller-owned fields. Quantity changes are only
    /// permitted while no Active reservation references the item.
    #[instrument(skip(self, patch), fields(item_id = %item_id, seller_id = %seller_id))]
    pub async fn update_item_fields(
        &self,
        item_id: Uuid,
        seller_id: Uuid,
        patch: ItemPatch,
    ) -> Result<item::Model, ServiceError> {
        let existing = self.get_item(item_id).await?;
        if existing.seller_id != seller_id {
            return Err(ServiceError::Conflict(format!(
                "item {} belongs to another seller",
                item_id
            )));
        }

        if let Some(new_available) = patch.available_quantity {
            if new_available < 0 {
                return Err(ServiceError::ValidationError(
                    "available quantity must not be negative".to_string(),
                ));
            }
            if new_available != existing.available_quantity {
                self.ensure_no_active_reservation(item_id).await?;
            }
        }

        let old_available = existing.available_quantity;
        let mut active: item::ActiveModel = existing.into();
        if let Some(name) = patch.name {
            if name.is_empty() {
                return Err(ServiceError::ValidationError(
                    "item name must not be empty".to_string(),
                ));
            }
            active.name = Set(name);
        }
        if let Some(condition) = patch.condition {
            active.condition = Set(condition);
        }
        if let Some(price) = patch.price {
            active.price_cents = Set(money::decimal_to_cents(price)?);
        }
        if let Some(available) = patch.available_quantity {
            active.available_quantity = Set(available);
        }
        if let Some(image_url) = patch.image_url {
            active.image_url = Set(Some(image_url));
        }
        active.last_updated = Set(Utc::now());

        let updated = active.update(&*self.db).await.map_err(ServiceError::db_error)?;
        self.emit_quantity_events(&updated, old_available, "admin_adjustment")
            .await?;
        Ok(updated)
    }

    /// Removes a listing. Fails while any Active reservation still holds
    /// part of it.
    #[instrument(skip(self), fields(item_id = %item_id, seller_id = %seller_id))]
    pub async fn delete_item(&self, item_id: Uuid, seller_id: Uuid) -> Result<(), ServiceError> {
        let existing = self.get_item(item_id).await?;
        if existing.seller_id != seller_id {
            return Err(ServiceError::Conflict(format!(
                "item {} belongs to another seller",
                item_id
            )));
        }
        self.ensure_no_active_reservation(item_id).await?;

        ItemEntity::delete_by_id(item_id)
            .exec(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        info!(item_id = %item_id, "Item deleted");
        Ok(())
    }

    #[instrument(skip(self))]
    pub async fn list_items_for_seller(
        &self,
        seller_id: Uuid,
        page: u64,
        page_size: u64,
    ) -> Result<ItemListPage, ServiceError> {
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

        let paginator = ItemEntity::find()
            .filter(item::Column::SellerId.eq(seller_id))
            .order_by_desc(item::Column::CreatedAt)
            .paginate(&*self.db, page_size);

        let total = paginator.num_items().await.map_err(ServiceError::db_error)?;
        let items = paginator
            .fetch_page(page - 1)
            .await
            .map_err(ServiceError::db_error)?;

        Ok(ItemListPage {
            items,
            total,
            page,
            page_size,
        })
    }

    async fn ensure_no_active_reservation(&self, item_id: Uuid) -> Result<(), ServiceError> {
        let active_holds = ReservationLineEntity::find()
            .filter(reservation_line::Column::ItemId.eq(item_id))
            .inner_join(ReservationEntity)
            .filter(reservation::Column::Status.eq(ReservationStatus::Active.as_str()))
            .count(&*self.db)
            .await
            .map_err(ServiceError::db_error)?;

        if active_holds > 0 {
            warn!(item_id = %item_id, holds = active_holds, "Item has active reservations");
            return Err(ServiceError::Conflict(format!(
                "item {} is referenced by an active reservation",
                item_id
            )));
        }
        Ok(())
    }

    async fn emit_quantity_events(
        &self,
        item: &item::Model,
        old_available: i32,
        reason: &str,
    ) -> Result<(), ServiceError> {
        if item.available_quantity != old_available {
            self.publish(Event::InventoryQuantityChanged {
                item_id: item.id,
                old_available,
                new_available: item.available_quantity,
                reason: reason.to_string(),
            })
            .await?;
        }
        if item.free_quantity() < self.low_stock_threshold {
            self.publish(Event::InventoryQuantityLow {
                item_id: item.id,
                available: item.available_quantity,
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
