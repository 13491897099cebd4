use diesel::prelude::*;
use super::enums::{BiomeTag, TransactionSource, TransactionType};
use crate::schema::transactions;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use field_count::FieldCount;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = transactions)]
pub struct Transaction {
    pub id: Uuid,
    pub source: TransactionSource,
    pub tx_type: TransactionType,
    pub buyer_id: Option<Uuid>,
    pub seller_id: Option<Uuid>,
    pub land_id: Option<Uuid>,
    pub listing_id: Option<Uuid>,
    pub gross_amount: i64,
    pub platform_fee: i64,
    pub net_amount: i64,
    pub biome: Option<BiomeTag>,
    pub shares: Option<BigDecimal>,
    pub price_per_share: Option<i64>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Insertable, FieldCount)]
#[diesel(table_name = transactions)]
pub struct NewTransaction {
    pub id: Uuid,
    pub source: TransactionSource,
    pub tx_type: TransactionType,
    pub buyer_id: Option<Uuid>,
    pub seller_id: Option<Uuid>,
    pub land_id: Option<Uuid>,
    pub listing_id: Option<Uuid>,
    pub gross_amount: i64,
    pub platform_fee: i64,
    pub net_amount: i64,
    pub biome: Option<BiomeTag>,
    pub shares: Option<BigDecimal>,
    pub price_per_share: Option<i64>,
}
