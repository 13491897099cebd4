use diesel::prelude::*;
use super::enums::BiomeTag;
use crate::schema::lands;
use chrono::{DateTime, Utc};
use field_count::FieldCount;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = lands)]
pub struct Land {
    pub id: Uuid,
    pub owner_id: Option<Uuid>,
    pub x: i32,
    pub y: i32,
    pub biome: BiomeTag,
    pub fencing_enabled: bool,
    pub fencing_passcode: Option<String>,
    pub width: i32,
    pub height: i32,
    pub created_at: DateTime<Utc>,
}

impl Land {
    /// The proximity room / chat session id derived from this land's
    /// coordinates, e.g. `land_19_1`.
    pub fn room_id(&self) -> String {
        room_id_for(self.x, self.y)
    }
}

pub fn room_id_for(x: i32, y: i32) -> String {
    format!("land_{x}_{y}")
}

#[derive(Clone, Debug, Insertable, FieldCount)]
#[diesel(table_name = lands)]
pub struct NewLand {
    pub id: Uuid,
    pub owner_id: Option<Uuid>,
    pub x: i32,
    pub y: i32,
    pub biome: BiomeTag,
    pub fencing_enabled: bool,
    pub fencing_passcode: Option<String>,
    pub width: i32,
    pub height: i32,
}
