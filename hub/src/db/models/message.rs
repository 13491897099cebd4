use diesel::prelude::*;
use crate::schema::messages;
use chrono::{DateTime, Utc};
use field_count::FieldCount;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = messages)]
pub struct Message {
    pub id: Uuid,
    pub session_id: String,
    pub sender_id: Uuid,
    pub content: Vec<u8>,
    pub encrypted: bool,
    pub is_leave_message: bool,
    pub read_by_owner: bool,
    pub read_at: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn is_tombstoned(&self) -> bool {
        self.deleted_at.is_some()
    }
}

#[derive(Clone, Debug, Insertable, FieldCount)]
#[diesel(table_name = messages)]
pub struct NewMessage {
    pub id: Uuid,
    pub session_id: String,
    pub sender_id: Uuid,
    pub content: Vec<u8>,
    pub encrypted: bool,
    pub is_leave_message: bool,
}
