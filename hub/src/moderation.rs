//! Moderation surface over the `User.suspension_state` / `User.ban set`
//! fields: suspend/unsuspend/ban, each gated on the caller already holding
//! `moderator` or `admin` role. A full admin CRUD/dashboard is out of scope;
//! this only covers the data-layer operations those tools would call into.

use crate::audit;
use crate::db::models::{Ban, NewBan, User, UserRole};
use crate::db::ArcDbPool;
use crate::error::{AppError, AppResult};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;
use serde_json::json;
use uuid::Uuid;

pub struct ModerationService {
    db: ArcDbPool,
}

impl ModerationService {
    pub fn new(db: ArcDbPool) -> Self {
        Self { db }
    }

    fn require_moderator(role: UserRole) -> AppResult<()> {
        if !role.can_moderate() {
            return Err(AppError::Permission("moderator or admin role required".to_string()));
        }
        Ok(())
    }

    pub async fn suspend_user(&self, actor_id: Uuid, actor_role: UserRole, target: Uuid) -> AppResult<User> {
        Self::require_moderator(actor_role)?;
        use crate::schema::users::dsl;
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let user = diesel::update(dsl::users.filter(dsl::id.eq(target)))
            .set((dsl::suspended.eq(true), dsl::updated_at.eq(chrono::Utc::now())))
            .get_result::<User>(&mut conn)
            .await?;
        audit::record(
            &self.db,
            Some(actor_id),
            "user.suspend",
            "user",
            Some(target.to_string()),
            json!({}),
            None,
        )
        .await?;
        Ok(user)
    }

    pub async fn unsuspend_user(&self, actor_id: Uuid, actor_role: UserRole, target: Uuid) -> AppResult<User> {
        Self::require_moderator(actor_role)?;
        use crate::schema::users::dsl;
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let user = diesel::update(dsl::users.filter(dsl::id.eq(target)))
            .set((dsl::suspended.eq(false), dsl::updated_at.eq(chrono::Utc::now())))
            .get_result::<User>(&mut conn)
            .await?;
        audit::record(
            &self.db,
            Some(actor_id),
            "user.unsuspend",
            "user",
            Some(target.to_string()),
            json!({}),
            None,
        )
        .await?;
        Ok(user)
    }

    pub async fn ban_user(
        &self,
        actor_id: Uuid,
        actor_role: UserRole,
        target: Uuid,
        reason: &str,
    ) -> AppResult<Ban> {
        Self::require_moderator(actor_role)?;
        use crate::schema::bans::dsl as bans_dsl;
        use crate::schema::users::dsl as users_dsl;
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        diesel::update(users_dsl::users.filter(users_dsl::id.eq(target)))
            .set((users_dsl::banned.eq(true), users_dsl::updated_at.eq(chrono::Utc::now())))
            .execute(&mut conn)
            .await?;
        let ban = diesel::insert_into(bans_dsl::bans)
            .values(&NewBan {
                user_id: target,
                reason: reason.to_string(),
                banned_by: actor_id,
            })
            .on_conflict(bans_dsl::user_id)
            .do_update()
            .set((bans_dsl::reason.eq(reason), bans_dsl::banned_by.eq(actor_id)))
            .get_result::<Ban>(&mut conn)
            .await?;
        audit::record(
            &self.db,
            Some(actor_id),
            "user.ban",
            "user",
            Some(target.to_string()),
            json!({"reason": reason}),
            None,
        )
        .await?;
        Ok(ban)
    }
}
