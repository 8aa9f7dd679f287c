use chrono::{DateTime, Utc};
use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discriminates the two catalog item shapes.
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
pub enum ItemKind {
    TradingCard,
    SealedProduct,
}

impl ItemKind {
    pub fn as_str(self) -> &'static str {
        self.into()
    }

    pub fn parse(s: &str) -> Option<Self> {
        s.parse().ok()
    }
}

/// Type-specific payload stored in the `details` JSON column. The common
/// display attributes live as plain columns on the row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ItemDetails {
    TradingCard {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        artist: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        frame: Option<String>,
    },
    SealedProduct {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        contents: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        pack_count: Option<i32>,
    },
}

impl ItemDetails {
    pub fn kind(&self) -> ItemKind {
        match self {
            ItemDetails::TradingCard { .. } => ItemKind::TradingCard,
            ItemDetails::SealedProduct { .. } => ItemKind::SealedProduct,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "items")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    #[sea_orm(indexed)]
    pub seller_id: Uuid,
    pub name: String,
    #[sea_orm(indexed)]
    pub set_code: String,
    pub collector_number: String,
    pub rarity: String,
    pub condition: String,
    pub language: String,
    pub foil: bool,
    pub kind: String,
    pub details: Json,
    pub price_cents: i64,
    pub available_quantity: i32,
    pub reserved_quantity: i32,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
}

impl Model {
    /// Quantity a new reservation may still consume.
    pub fn free_quantity(&self) -> i32 {
        self.available_quantity - self.reserved_quantity
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
