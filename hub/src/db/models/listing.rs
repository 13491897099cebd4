use diesel::prelude::*;
use super::enums::{ListingKind, ListingStatus};
use crate::schema::listings;
use chrono::{DateTime, Utc};
use field_count::FieldCount;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = listings)]
pub struct Listing {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub land_id: Uuid,
    pub kind: ListingKind,
    pub base_price: i64,
    pub buy_now_price: Option<i64>,
    pub reserve_price: i64,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: ListingStatus,
    pub auto_extend_window_secs: i32,
    pub bid_increment: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listing {
    pub fn is_active(&self) -> bool {
        self.status == ListingStatus::Active
    }

    pub fn has_buy_now(&self) -> bool {
        matches!(self.kind, ListingKind::AuctionWithBuynow) && self.buy_now_price.is_some()
    }
}

#[derive(Clone, Debug, Insertable, FieldCount)]
#[diesel(table_name = listings)]
pub struct NewListing {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub land_id: Uuid,
    pub kind: ListingKind,
    pub base_price: i64,
    pub buy_now_price: Option<i64>,
    pub reserve_price: i64,
    pub starts_at: DateTime<Utc>,
    pub ends_at: DateTime<Utc>,
    pub status: ListingStatus,
    pub auto_extend_window_secs: i32,
    pub bid_increment: i64,
}
