//! Persistence Store (C1): connection pooling and the row-locking helpers the
//! transaction engine (C3) builds on. Table/model definitions live in
//! `crate::schema` and `db::models`.

pub mod models;

use diesel_async::async_connection_wrapper::AsyncConnectionWrapper;
use diesel_async::pooled_connection::bb8::Pool;
use diesel_async::pooled_connection::AsyncDieselConnectionManager;
use diesel_async::AsyncPgConnection;
use diesel_migrations::{embed_migrations, EmbeddedMigrations, MigrationHarness};
use std::sync::Arc;
use std::time::Duration;

pub type DbConnection = AsyncPgConnection;
pub type DbPool = Pool<DbConnection>;
pub type ArcDbPool = Arc<DbPool>;

pub const MIGRATIONS: EmbeddedMigrations = embed_migrations!("migrations");

/// Builds the pooled Postgres connection manager. `max_size` should scale
/// with expected concurrent connections; the transaction engine holds a
/// connection only for the duration of a single locked mutation.
pub async fn new_pool(database_url: &str, max_size: u32) -> anyhow::Result<ArcDbPool> {
    let manager = AsyncDieselConnectionManager::<DbConnection>::new(database_url);
    let pool = Pool::builder()
        .max_size(max_size)
        .connection_timeout(Duration::from_secs(30))
        .build(manager)
        .await?;
    Ok(Arc::new(pool))
}

/// Runs pending migrations to completion before the pool is handed out to
/// the rest of the service. A failure here is treated as "storage
/// unreachable at startup" by the caller. `diesel_migrations`'s
/// `MigrationHarness` is synchronous, so it runs against a blocking wrapper
/// connection on a dedicated thread.
pub async fn run_pending_migrations(database_url: &str) -> anyhow::Result<()> {
    use diesel::Connection;

    let database_url = database_url.to_string();
    tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
        let mut conn = AsyncConnectionWrapper::<DbConnection>::establish(&database_url)?;
        conn.run_pending_migrations(MIGRATIONS)
            .map_err(|err| anyhow::anyhow!("failed to run migrations: {err}"))?;
        Ok(())
    })
    .await??;
    Ok(())
}

/// The per-transaction row-lock acquisition deadline: transaction engine
/// operations fail with a conflict error rather than block indefinitely on a
/// contended row.
pub const LOCK_ACQUIRE_TIMEOUT: &str = "5s";

/// Sets the Postgres `lock_timeout` for the remainder of the current
/// transaction so a `SELECT ... FOR UPDATE` that can't acquire its lock in
/// time raises `lock_not_available` (SQLSTATE 55P03) instead of blocking
/// forever. Must be called as the first statement inside a transaction.
pub async fn set_lock_timeout(conn: &mut DbConnection) -> diesel::result::QueryResult<()> {
    use diesel_async::RunQueryDsl;
    diesel::sql_query(format!("SET LOCAL lock_timeout = '{LOCK_ACQUIRE_TIMEOUT}'"))
        .execute(conn)
        .await?;
    Ok(())
}

/// True if `err` is a Postgres lock-acquisition timeout, the DB-level signal
/// the transaction engine turns into `AppError::Conflict`.
pub fn is_lock_timeout(err: &diesel::result::Error) -> bool {
    if let diesel::result::Error::DatabaseError(_, info) = err {
        return info.code().map(|c| c.as_ref() == "55P03").unwrap_or(false);
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_timeout_literal_is_a_valid_duration_suffix() {
        assert!(LOCK_ACQUIRE_TIMEOUT.ends_with('s'));
    }
}
