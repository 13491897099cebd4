use diesel::prelude::*;
use crate::schema::bids;
use chrono::{DateTime, Utc};
use field_count::FieldCount;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = bids)]
pub struct Bid {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub bidder_id: Uuid,
    pub amount: i64,
    pub refunded: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Insertable, FieldCount)]
#[diesel(table_name = bids)]
pub struct NewBid {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub bidder_id: Uuid,
    pub amount: i64,
}
