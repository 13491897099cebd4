use diesel::prelude::*;
use super::enums::BiomeTag;
use crate::schema::biome_holdings;
use bigdecimal::BigDecimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = biome_holdings, primary_key(user_id, biome))]
pub struct BiomeHolding {
    pub user_id: Uuid,
    pub biome: BiomeTag,
    pub shares: BigDecimal,
    pub cost_basis: i64,
}

#[derive(Clone, Debug, Insertable)]
#[diesel(table_name = biome_holdings)]
pub struct NewBiomeHolding {
    pub user_id: Uuid,
    pub biome: BiomeTag,
    pub shares: BigDecimal,
    pub cost_basis: i64,
}
