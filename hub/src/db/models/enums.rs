//! Database-backed enums shared across models. Each maps to a Postgres enum
//! type declared in `schema::sql_types` and a migration in `migrations/`.

use diesel_derive_enum::DbEnum;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum, Display, EnumString,
)]
#[ExistingTypePath = "crate::schema::sql_types::UserRole"]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum UserRole {
    User,
    Moderator,
    Admin,
}

impl UserRole {
    pub fn can_moderate(&self) -> bool {
        matches!(self, UserRole::Moderator | UserRole::Admin)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum, Display, EnumString,
)]
#[ExistingTypePath = "crate::schema::sql_types::BiomeTag"]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum BiomeTag {
    Ocean,
    Beach,
    Plains,
    Forest,
    Desert,
    Mountain,
    Snow,
}

impl BiomeTag {
    /// All seven biomes, used to seed `biome_markets` and to iterate a
    /// redistribution cycle over every row.
    pub const ALL: [BiomeTag; 7] = [
        BiomeTag::Ocean,
        BiomeTag::Beach,
        BiomeTag::Plains,
        BiomeTag::Forest,
        BiomeTag::Desert,
        BiomeTag::Mountain,
        BiomeTag::Snow,
    ];
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[ExistingTypePath = "crate::schema::sql_types::ListingKind"]
#[serde(rename_all = "snake_case")]
pub enum ListingKind {
    FixedPrice,
    Auction,
    AuctionWithBuynow,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[ExistingTypePath = "crate::schema::sql_types::ListingStatus"]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    Sold,
    Cancelled,
    Expired,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum, Display, EnumString,
)]
#[ExistingTypePath = "crate::schema::sql_types::TransactionSource"]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum TransactionSource {
    Marketplace,
    Biome,
    Wallet,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, DbEnum)]
#[ExistingTypePath = "crate::schema::sql_types::TransactionType"]
#[serde(rename_all = "snake_case")]
pub enum TransactionType {
    AuctionSale,
    BuyNow,
    FixedPriceSale,
    Transfer,
    Topup,
    BiomeBuy,
    BiomeSell,
}
