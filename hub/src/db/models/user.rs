use diesel::prelude::*;
use super::enums::UserRole;
use crate::schema::users;
use chrono::{DateTime, Utc};
use field_count::FieldCount;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = users)]
pub struct User {
    pub id: Uuid,
    pub display_name: String,
    pub role: UserRole,
    pub balance: i64,
    pub suspended: bool,
    pub banned: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn is_active(&self) -> bool {
        !self.suspended && !self.banned && self.deleted_at.is_none()
    }
}

#[derive(Clone, Debug, Insertable, FieldCount)]
#[diesel(table_name = users)]
pub struct NewUser {
    pub id: Uuid,
    pub display_name: String,
    pub role: UserRole,
    pub balance: i64,
}
