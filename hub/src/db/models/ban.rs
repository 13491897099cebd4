use diesel::prelude::*;
use crate::schema::bans;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, Queryable, Identifiable, Serialize, Deserialize)]
#[diesel(table_name = bans, primary_key(user_id))]
pub struct Ban {
    pub user_id: Uuid,
    pub reason: String,
    pub banned_by: Uuid,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug, Insertable)]
#[diesel(table_name = bans)]
pub struct NewBan {
    pub user_id: Uuid,
    pub reason: String,
    pub banned_by: Uuid,
}
