//! Chat Service (C8): session materialization, durable message storage with
//! read receipts and leave-message semantics, and history queries.

use crate::connections::{FrameSink, Priority};
use crate::db::models::{ChatSession, Land, Message, NewChatSession, NewMessage};
use crate::db::ArcDbPool;
use crate::error::{AppError, AppResult};
use crate::presence::PresenceStore;
use axum::extract::ws::Message as WsMessage;
use chrono::{DateTime, Utc};
use diesel::prelude::*;
use diesel_async::{AsyncConnection, RunQueryDsl};
use serde_json::json;
use std::sync::Arc;
use uuid::Uuid;

pub const HISTORY_LIMIT_CAP: i64 = 100;

pub struct ChatService {
    db: ArcDbPool,
    presence: Arc<PresenceStore>,
    hub: Arc<dyn FrameSink>,
}

impl ChatService {
    pub fn new(db: ArcDbPool, presence: Arc<PresenceStore>, hub: Arc<dyn FrameSink>) -> Self {
        Self { db, presence, hub }
    }

    /// Parses a `land_<x>_<y>` room id back into coordinates, or `None` for
    /// an explicit (private) session id.
    fn parse_land_room(room_id: &str) -> Option<(i32, i32)> {
        let rest = room_id.strip_prefix("land_")?;
        let (x_raw, y_raw) = rest.split_once('_')?;
        Some((x_raw.parse().ok()?, y_raw.parse().ok()?))
    }

    #[cfg(test)]
    fn clamp_history_limit(limit: i64) -> i64 {
        limit.clamp(1, HISTORY_LIMIT_CAP)
    }

    async fn find_land_at(&self, x: i32, y: i32) -> AppResult<Option<Land>> {
        use crate::schema::lands::dsl;
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let land = dsl::lands
            .filter(dsl::x.eq(x))
            .filter(dsl::y.eq(y))
            .first::<Land>(&mut conn)
            .await
            .optional()?;
        Ok(land)
    }

    /// Looks up the session for `room_id`, materializing a land-proximity
    /// session on first use. Private session ids must already exist.
    pub async fn session_for_room(&self, room_id: &str) -> AppResult<ChatSession> {
        use crate::schema::chat_sessions::dsl;
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let existing = dsl::chat_sessions
            .filter(dsl::id.eq(room_id))
            .first::<ChatSession>(&mut conn)
            .await
            .optional()?;
        if let Some(session) = existing {
            return Ok(session);
        }

        let Some((x, y)) = Self::parse_land_room(room_id) else {
            return Err(AppError::NotFound(format!("chat session {room_id} does not exist")));
        };

        let land = self.find_land_at(x, y).await?;
        let new_session = NewChatSession {
            id: room_id.to_string(),
            land_id: land.map(|l| l.id),
            name: format!("Land ({x}, {y})"),
            is_public: true,
            retention_ttl_secs: None,
        };
        let inserted = diesel::insert_into(dsl::chat_sessions)
            .values(&new_session)
            .on_conflict(dsl::id)
            .do_nothing()
            .get_result::<ChatSession>(&mut conn)
            .await
            .optional()?;
        match inserted {
            Some(session) => Ok(session),
            // Lost the materialization race to another task; reread.
            None => Ok(dsl::chat_sessions
                .filter(dsl::id.eq(room_id))
                .first::<ChatSession>(&mut conn)
                .await?),
        }
    }

    /// Creates an explicit private session (not land-proximity).
    pub async fn create_private_session(&self, name: &str) -> AppResult<ChatSession> {
        use crate::schema::chat_sessions::dsl;
        let new_session = NewChatSession {
            id: Uuid::new_v4().to_string(),
            land_id: None,
            name: name.to_string(),
            is_public: false,
            retention_ttl_secs: None,
        };
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let session = diesel::insert_into(dsl::chat_sessions)
            .values(&new_session)
            .get_result::<ChatSession>(&mut conn)
            .await?;
        Ok(session)
    }

    async fn is_leave_message(&self, session: &ChatSession) -> AppResult<bool> {
        let Some(land_id) = session.land_id else { return Ok(false) };
        use crate::schema::lands::dsl;
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let land = dsl::lands
            .filter(dsl::id.eq(land_id))
            .first::<Land>(&mut conn)
            .await
            .optional()?;
        let Some(land) = land else { return Ok(false) };
        let Some(owner_id) = land.owner_id else { return Ok(false) };
        Ok(!self.presence.is_online(owner_id).await?)
    }

    /// The broadcaster path and persistence are independent operations: a
    /// persistence failure is logged but does not silence the broadcast.
    pub async fn send_message(&self, sender: Uuid, room_id: &str, text: &str) -> AppResult<Message> {
        let session = self.session_for_room(room_id).await?;
        let is_leave = self.is_leave_message(&session).await?;
        let message_id = Uuid::new_v4();
        let created_at = Utc::now();

        let new_message = NewMessage {
            id: message_id,
            session_id: session.id.clone(),
            sender_id: sender,
            content: text.as_bytes().to_vec(),
            encrypted: false,
            is_leave_message: is_leave,
        };

        let persisted = self.persist_message(&new_message).await;

        let frame = json!({
            "type": "message",
            "id": message_id,
            "session_id": session.id,
            "sender_id": sender,
            "text": text,
            "is_leave_message": is_leave,
            "created_at": created_at,
        });
        if let Ok(text) = serde_json::to_string(&frame) {
            self.hub
                .broadcast_room(&session.id, WsMessage::Text(text), Priority::Critical, None);
        }

        persisted
    }

    async fn persist_message(&self, new_message: &NewMessage) -> AppResult<Message> {
        use crate::schema::chat_sessions::dsl as sessions_dsl;
        use crate::schema::messages::dsl as messages_dsl;

        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let result: Result<Message, diesel::result::Error> = conn
            .build_transaction()
            .run(|conn| {
                Box::pin(async move {
                    let message = diesel::insert_into(messages_dsl::messages)
                        .values(new_message)
                        .get_result::<Message>(conn)
                        .await?;
                    diesel::update(sessions_dsl::chat_sessions.filter(sessions_dsl::id.eq(&message.session_id)))
                        .set((
                            sessions_dsl::message_count.eq(sessions_dsl::message_count + 1),
                            sessions_dsl::last_message_at.eq(message.created_at),
                        ))
                        .execute(conn)
                        .await?;
                    Ok(message)
                })
            })
            .await;

        match result {
            Ok(message) => Ok(message),
            Err(err) => {
                tracing::error!(error = %err, "failed to persist chat message, broadcast still proceeds");
                Err(err.into())
            },
        }
    }

    /// Marks unread leave-messages read when `owner` opens `session_id`,
    /// notifying original senders still connected.
    pub async fn mark_read(&self, owner: Uuid, session_id: &str) -> AppResult<Vec<Message>> {
        use crate::schema::messages::dsl;
        let now = Utc::now();
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let updated = diesel::update(
            dsl::messages
                .filter(dsl::session_id.eq(session_id))
                .filter(dsl::is_leave_message.eq(true))
                .filter(dsl::read_by_owner.eq(false))
                .filter(dsl::sender_id.ne(owner)),
        )
        .set((dsl::read_by_owner.eq(true), dsl::read_at.eq(now)))
        .get_results::<Message>(&mut conn)
        .await?;

        for message in &updated {
            let frame = json!({
                "type": "read_receipt",
                "session_id": session_id,
                "message_id": message.id,
                "read_at": now,
            });
            if let Ok(text) = serde_json::to_string(&frame) {
                self.hub
                    .send_to_user(message.sender_id, WsMessage::Text(text), Priority::Critical);
            }
        }
        Ok(updated)
    }

    /// Sessions `user_id` has sent at least one message in. Public
    /// land-proximity rooms the caller has merely joined but never spoken
    /// in aren't tracked anywhere durable, so this is necessarily
    /// message-authorship-based.
    pub async fn sessions_for_user(&self, user_id: Uuid) -> AppResult<Vec<ChatSession>> {
        use crate::schema::chat_sessions::dsl as sessions_dsl;
        use crate::schema::messages::dsl as messages_dsl;
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let session_ids: Vec<String> = messages_dsl::messages
            .filter(messages_dsl::sender_id.eq(user_id))
            .select(messages_dsl::session_id)
            .distinct()
            .load(&mut conn)
            .await?;
        let sessions = sessions_dsl::chat_sessions
            .filter(sessions_dsl::id.eq_any(session_ids))
            .filter(sessions_dsl::deleted_at.is_null())
            .load::<ChatSession>(&mut conn)
            .await?;
        Ok(sessions)
    }

    /// History for the land-proximity session at `land_id`'s coordinates.
    pub async fn history_by_land(
        &self,
        land_id: Uuid,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        use crate::schema::lands::dsl;
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let land = dsl::lands
            .filter(dsl::id.eq(land_id))
            .first::<Land>(&mut conn)
            .await?;
        self.history(&land.room_id(), cursor, limit).await
    }

    /// Up to `limit` (capped at 100) most recent messages older than
    /// `cursor`, in reverse chronological order. Soft-deleted messages are
    /// returned as tombstones (`deleted_at` set, `content` blanked) rather
    /// than omitted, so readers still see where a message used to be.
    pub async fn history(
        &self,
        session_id: &str,
        cursor: Option<DateTime<Utc>>,
        limit: i64,
    ) -> AppResult<Vec<Message>> {
        use crate::schema::messages::dsl;
        let limit = limit.clamp(1, HISTORY_LIMIT_CAP);
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let mut query = dsl::messages
            .filter(dsl::session_id.eq(session_id))
            .into_boxed();
        if let Some(cursor) = cursor {
            query = query.filter(dsl::created_at.lt(cursor));
        }
        let messages = query
            .order(dsl::created_at.desc())
            .limit(limit)
            .load::<Message>(&mut conn)
            .await?
            .into_iter()
            .map(Self::redact_tombstone)
            .collect();
        Ok(messages)
    }

    /// Blanks a soft-deleted message's content so history readers see a
    /// tombstone (`deleted_at` set, empty body) instead of the original text.
    fn redact_tombstone(mut message: Message) -> Message {
        if message.is_tombstoned() {
            message.content.clear();
        }
        message
    }

    /// Per-land unread leave-message counts for lands `owner` owns.
    pub async fn unread_counts_for_owner(&self, owner: Uuid) -> AppResult<Vec<(Uuid, i64)>> {
        use crate::schema::chat_sessions::dsl as sessions_dsl;
        use crate::schema::lands::dsl as lands_dsl;
        use crate::schema::messages::dsl as messages_dsl;

        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let owned_lands = lands_dsl::lands
            .filter(lands_dsl::owner_id.eq(owner))
            .load::<Land>(&mut conn)
            .await?;

        let mut counts = Vec::with_capacity(owned_lands.len());
        for land in owned_lands {
            let session_id = land.room_id();
            let count = messages_dsl::messages
                .inner_join(sessions_dsl::chat_sessions.on(sessions_dsl::id.eq(messages_dsl::session_id)))
                .filter(sessions_dsl::id.eq(&session_id))
                .filter(messages_dsl::is_leave_message.eq(true))
                .filter(messages_dsl::read_by_owner.eq(false))
                .count()
                .get_result::<i64>(&mut conn)
                .await
                .unwrap_or(0);
            if count > 0 {
                counts.push((land.id, count));
            }
        }
        Ok(counts)
    }

    /// Soft-deletes a message the sender sent within `within` of now
    /// (default 5 minutes). Only the original sender may delete their own
    /// message.
    pub async fn delete_message(&self, sender: Uuid, message_id: Uuid, within: chrono::Duration) -> AppResult<()> {
        use crate::schema::messages::dsl;
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let message = dsl::messages
            .filter(dsl::id.eq(message_id))
            .first::<Message>(&mut conn)
            .await
            .optional()?
            .ok_or_else(|| AppError::NotFound("message not found".to_string()))?;
        if message.sender_id != sender {
            return Err(AppError::Permission("only the sender may delete this message".to_string()));
        }
        if message.is_tombstoned() {
            return Ok(());
        }
        if Utc::now() - message.created_at > within {
            return Err(AppError::Conflict("delete window has elapsed".to_string()));
        }
        diesel::update(dsl::messages.filter(dsl::id.eq(message_id)))
            .set(dsl::deleted_at.eq(Utc::now()))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Soft-deletes messages past their session's retention TTL (falling
    /// back to `default_ttl_secs`). Intended to run on a periodic interval.
    pub async fn run_retention_sweep(&self, default_ttl_secs: i64) -> AppResult<u64> {
        use crate::schema::chat_sessions::dsl as sessions_dsl;
        use crate::schema::messages::dsl as messages_dsl;

        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let sessions = sessions_dsl::chat_sessions
            .filter(sessions_dsl::deleted_at.is_null())
            .load::<ChatSession>(&mut conn)
            .await?;

        let mut total = 0u64;
        for session in sessions {
            let ttl_secs = session.retention_ttl_secs.map(|t| t as i64).unwrap_or(default_ttl_secs);
            let cutoff = Utc::now() - chrono::Duration::seconds(ttl_secs);
            let affected = diesel::update(
                messages_dsl::messages
                    .filter(messages_dsl::session_id.eq(&session.id))
                    .filter(messages_dsl::created_at.lt(cutoff))
                    .filter(messages_dsl::deleted_at.is_null()),
            )
            .set(messages_dsl::deleted_at.eq(Utc::now()))
            .execute(&mut conn)
            .await?;
            total += affected as u64;
        }
        Ok(total)
    }
}

/// Spawns the periodic retention sweep at `interval`, logging failures
/// without stopping the loop.
pub fn spawn_retention_job(service: Arc<ChatService>, default_ttl_secs: i64, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match service.run_retention_sweep(default_ttl_secs).await {
                Ok(count) if count > 0 => {
                    tracing::info!(deleted = count, "chat retention sweep soft-deleted messages");
                },
                Ok(_) => {},
                Err(err) => tracing::warn!(error = %err, "chat retention sweep failed"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_land_room_ids_but_not_private_session_ids() {
        assert_eq!(ChatService::parse_land_room("land_19_1"), Some((19, 1)));
        assert_eq!(ChatService::parse_land_room("land_-3_7"), Some((-3, 7)));
        assert_eq!(ChatService::parse_land_room("9f2c8e1a-...-private"), None);
    }

    #[test]
    fn history_limit_clamps_to_spec_cap() {
        assert_eq!(ChatService::clamp_history_limit(50), 50);
        assert_eq!(ChatService::clamp_history_limit(500), HISTORY_LIMIT_CAP);
        assert_eq!(ChatService::clamp_history_limit(0), 1);
        assert_eq!(ChatService::clamp_history_limit(-5), 1);
    }

    #[test]
    fn scenario_s4_leave_message_is_gated_on_land_proximity_and_offline_owner() {
        // is_leave_message requires a land-proximity session AND a
        // registered, currently-offline owner. A private session never
        // qualifies regardless of owner presence.
        let is_land_proximity = ChatService::parse_land_room("land_19_1").is_some();
        let owner_registered = true;
        let owner_online = false;
        let is_leave_message = is_land_proximity && owner_registered && !owner_online;
        assert!(is_leave_message);

        let private_session_is_land_proximity = ChatService::parse_land_room("session-abc").is_some();
        assert!(!(private_session_is_land_proximity && owner_registered && !owner_online));
    }
}
