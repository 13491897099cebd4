//! Presence & Location (C7): online flag, last-seen, and current coordinate
//! per user. Ephemeral (cache-resident) with write-through to the durable
//! `users.last_seen` column.

use crate::db::models::User;
use crate::db::ArcDbPool;
use crate::error::{AppError, AppResult};
use crate::Cache;
use chrono::Utc;
use diesel_async::RunQueryDsl;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;

const ONLINE_SET_KEY: &str = "presence:online";
const LOCATIONS_HASH_KEY: &str = "presence:locations";

/// Default Chebyshev-distance radius for `nearby`.
pub const DEFAULT_NEARBY_RADIUS: i32 = 5;

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Location {
    pub x: i32,
    pub y: i32,
}

pub struct PresenceStore {
    cache: Arc<Cache>,
    db: ArcDbPool,
}

impl PresenceStore {
    pub fn new(cache: Arc<Cache>, db: ArcDbPool) -> Self {
        Self { cache, db }
    }

    pub async fn mark_online(&self, user_id: Uuid) -> AppResult<()> {
        let mut conn = self.cache.raw_conn();
        let _: () = conn.sadd(ONLINE_SET_KEY, user_id.to_string()).await?;
        self.touch_last_seen(user_id).await
    }

    /// Called after the grace interval has elapsed with no reconnect; the
    /// caller is responsible for the delay itself.
    pub async fn mark_offline(&self, user_id: Uuid) -> AppResult<()> {
        let mut conn = self.cache.raw_conn();
        let _: () = conn.srem(ONLINE_SET_KEY, user_id.to_string()).await?;
        Ok(())
    }

    pub async fn is_online(&self, user_id: Uuid) -> AppResult<bool> {
        let mut conn = self.cache.raw_conn();
        let present: bool = conn.sismember(ONLINE_SET_KEY, user_id.to_string()).await?;
        Ok(present)
    }

    pub async fn set_location(&self, user_id: Uuid, x: i32, y: i32) -> AppResult<()> {
        let mut conn = self.cache.raw_conn();
        let payload = serde_json::to_string(&Location { x, y }).map_err(AppError::internal)?;
        let _: () = conn.hset(LOCATIONS_HASH_KEY, user_id.to_string(), payload).await?;
        self.touch_last_seen(user_id).await
    }

    pub async fn location(&self, user_id: Uuid) -> AppResult<Option<Location>> {
        let mut conn = self.cache.raw_conn();
        let raw: Option<String> = conn.hget(LOCATIONS_HASH_KEY, user_id.to_string()).await?;
        match raw {
            Some(raw) => Ok(Some(serde_json::from_str(&raw).map_err(AppError::internal)?)),
            None => Ok(None),
        }
    }

    /// Write-through: mirrors the presence update into the durable
    /// `users.last_seen` column so it survives a cache flush.
    async fn touch_last_seen(&self, user_id: Uuid) -> AppResult<()> {
        use crate::schema::users::dsl::*;
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        diesel::update(users.filter(id.eq(user_id)))
            .set((last_seen.eq(Utc::now()), updated_at.eq(Utc::now())))
            .execute(&mut conn)
            .await?;
        Ok(())
    }

    /// Users online within Chebyshev distance `radius` of `(x, y)`. O(number
    /// of online users).
    pub async fn nearby(&self, x: i32, y: i32, radius: i32) -> AppResult<Vec<Uuid>> {
        let mut conn = self.cache.raw_conn();
        let online_ids: Vec<String> = conn.smembers(ONLINE_SET_KEY).await?;
        let mut result = Vec::new();
        for raw_id in online_ids {
            let Ok(user_id) = Uuid::parse_str(&raw_id) else { continue };
            let raw_loc: Option<String> = conn.hget(LOCATIONS_HASH_KEY, &raw_id).await?;
            let Some(raw_loc) = raw_loc else { continue };
            let Ok(loc) = serde_json::from_str::<Location>(&raw_loc) else { continue };
            if (loc.x - x).abs() <= radius && (loc.y - y).abs() <= radius {
                result.push(user_id);
            }
        }
        Ok(result)
    }

    pub async fn load_user(&self, user_id: Uuid) -> AppResult<User> {
        use crate::schema::users::dsl::*;
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let user = users
            .filter(id.eq(user_id))
            .filter(deleted_at.is_null())
            .first::<User>(&mut conn)
            .await?;
        Ok(user)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chebyshev_distance_within_radius() {
        let a = Location { x: 19, y: 1 };
        let b = Location { x: 22, y: 4 };
        let radius = 5;
        assert!((a.x - b.x).abs() <= radius && (a.y - b.y).abs() <= radius);
        let c = Location { x: 30, y: 1 };
        assert!(!((a.x - c.x).abs() <= radius && (a.y - c.y).abs() <= radius));
    }
}
