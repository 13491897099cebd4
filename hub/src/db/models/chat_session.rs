use diesel::prelude::*;
use crate::schema::chat_sessions;
use chrono::{DateTime, Utc};
use field_count::FieldCount;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = chat_sessions, primary_key(id))]
pub struct ChatSession {
    pub id: String,
    pub land_id: Option<Uuid>,
    pub name: String,
    pub is_public: bool,
    pub message_count: i64,
    pub last_message_at: Option<DateTime<Utc>>,
    pub retention_ttl_secs: Option<i32>,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ChatSession {
    pub fn is_land_proximity(&self) -> bool {
        self.land_id.is_some()
    }
}

#[derive(Clone, Debug, Insertable, FieldCount)]
#[diesel(table_name = chat_sessions)]
pub struct NewChatSession {
    pub id: String,
    pub land_id: Option<Uuid>,
    pub name: String,
    pub is_public: bool,
    pub retention_ttl_secs: Option<i32>,
}
