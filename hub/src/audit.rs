//! A single `record(...)` helper shared by C3/C4/C8/C10 for the audit_log
//! table: every moderation action, ban, and fund movement goes through here
//! instead of each module hand-rolling an insert.

use crate::db::models::NewAuditLogEntry;
use crate::db::ArcDbPool;
use crate::error::{AppError, AppResult};
use diesel_async::RunQueryDsl;
use serde_json::Value;
use uuid::Uuid;

pub async fn record(
    db: &ArcDbPool,
    actor_id: Option<Uuid>,
    action: &str,
    subject_type: &str,
    subject_id: Option<String>,
    detail: Value,
    ip: Option<String>,
) -> AppResult<()> {
    use crate::schema::audit_log;

    let entry = NewAuditLogEntry {
        id: Uuid::new_v4(),
        actor_id,
        action: action.to_string(),
        subject_type: subject_type.to_string(),
        subject_id,
        detail,
        ip,
    };
    let mut conn = db.get().await.map_err(AppError::internal)?;
    diesel::insert_into(audit_log::table)
        .values(&entry)
        .execute(&mut conn)
        .await?;
    Ok(())
}
