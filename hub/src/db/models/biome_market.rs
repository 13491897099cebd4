use diesel::prelude::*;
use super::enums::BiomeTag;
use crate::schema::biome_markets;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = biome_markets, primary_key(biome))]
pub struct BiomeMarket {
    pub biome: BiomeTag,
    pub total_shares: BigDecimal,
    pub price_per_share: i64,
    pub market_cash_pool: i64,
    pub attention_accumulator: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Insertable)]
#[diesel(table_name = biome_markets)]
pub struct NewBiomeMarket {
    pub biome: BiomeTag,
    pub total_shares: BigDecimal,
    pub price_per_share: i64,
    pub market_cash_pool: i64,
}

/// The envelope broadcast on the market update channel (§4.2 step 8) and sent
/// to WebSocket subscribers as a `biome_market_update` frame.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BiomeMarketUpdate {
    pub biome: BiomeTag,
    pub price: i64,
    pub total_shares: BigDecimal,
    pub market_cash_pool: i64,
    pub timestamp: DateTime<Utc>,
}

impl From<&BiomeMarket> for BiomeMarketUpdate {
    fn from(m: &BiomeMarket) -> Self {
        Self {
            biome: m.biome,
            price: m.price_per_share,
            total_shares: m.total_shares.clone(),
            market_cash_pool: m.market_cash_pool,
            timestamp: Utc::now(),
        }
    }
}
