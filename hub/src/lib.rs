//! Virtual-world realtime hub: connection/room/presence fan-out, a unified
//! marketplace + biome-market transaction engine, and the live chat/media
//! signaling built on top of it (C1-C10).
//!
//! `config::Config` is the `server_framework::RunnableConfig` entry point;
//! [`run_service`] wires every component together and serves the API surface
//! (C10) until the process is killed.

pub mod api;
pub mod audit;
pub mod auth;
pub mod cache;
pub mod config;
pub mod connections;
pub mod chat;
pub mod db;
pub mod error;
pub mod market;
pub mod media;
pub mod moderation;
pub mod presence;
pub mod rooms;
pub mod schema;
pub mod transactions;

pub use cache::Cache;

use crate::api::AppState;
use crate::auth::SharedSecretVerifier;
use crate::config::Config;
use crate::connections::ConnectionHub;
use crate::db::ArcDbPool;
use crate::error::StorageUnreachable;
use crate::presence::PresenceStore;
use crate::rooms::RoomManager;
use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;

/// Brings up every component (C1-C9), builds the router (C10), and serves it
/// on `config.listen_addr` until the process is killed. Any failure to reach
/// Postgres or the cache is wrapped in [`StorageUnreachable`] so `main` can
/// tell a startup storage outage (exit code 2) apart from every other
/// failure.
pub async fn run_service(config: Config) -> anyhow::Result<()> {
    let config = Arc::new(config);

    db::run_pending_migrations(&config.database_url)
        .await
        .map_err(|err| StorageUnreachable(format!("migrations: {err}")))?;

    let db_pool: ArcDbPool = db::new_pool(&config.database_url, config.db_pool_size)
        .await
        .map_err(|err| StorageUnreachable(format!("database: {err}")))?;

    let cache = cache::Cache::connect(&config.cache_url)
        .await
        .map_err(|err| StorageUnreachable(format!("cache: {err}")))?;

    let rooms = Arc::new(RoomManager::new());
    let presence = Arc::new(PresenceStore::new(cache.clone(), db_pool.clone()));
    let hub = ConnectionHub::new(
        rooms.clone(),
        presence.clone(),
        config.outbound_queue_depth,
        Duration::from_secs(config.heartbeat_secs),
        Duration::from_secs(config.presence_offline_grace_secs),
    );

    let chat = Arc::new(chat::ChatService::new(
        db_pool.clone(),
        presence.clone(),
        hub.clone(),
    ));
    let media = media::MediaSignaling::new(
        hub.clone(),
        rooms.clone(),
        Duration::from_secs(config.call_ringing_timeout_secs),
    );
    let txn = Arc::new(transactions::TransactionEngine::new(db_pool.clone(), config.clone()));
    let market = market::MarketEngine::new(db_pool.clone(), cache.clone(), config.clone());
    let moderation = Arc::new(moderation::ModerationService::new(db_pool.clone()));
    let verifier: Arc<dyn auth::TokenVerifier> = Arc::new(SharedSecretVerifier::new(config.bearer_secret.clone()));

    market.clone().spawn_loop(Duration::from_millis(config.redistribution_cadence_ms));
    chat::spawn_retention_job(chat.clone(), config.chat_retention_secs, Duration::from_secs(60 * 60));
    transactions::spawn_auction_sweep(txn.clone(), Duration::from_secs(1));
    spawn_market_update_fanout(hub.clone(), cache.clone());

    let state = Arc::new(AppState {
        db: db_pool,
        cache,
        hub,
        rooms,
        presence,
        chat,
        media,
        txn,
        market,
        moderation,
        verifier,
    });

    let router = api::build_router(state);
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    tracing::info!(listen_addr = %config.listen_addr, "serving");
    axum::serve(listener, router).await.context("server error")?;
    Ok(())
}

/// Relays every `BiomeMarketUpdate` the market engine (C4) publishes to
/// every currently-connected WebSocket client as a `biome_market_update`
/// frame. Every hub
/// process subscribes independently via `Cache::subscribe_market_updates`,
/// which is itself fed by either a local publish or the Redis pub/sub bridge
/// (`cache::Cache::spawn_market_subscriber`), so this reaches connections on
/// every node regardless of which node's market engine computed the update.
fn spawn_market_update_fanout(hub: Arc<ConnectionHub>, cache: Arc<Cache>) {
    let mut updates = cache.subscribe_market_updates();
    tokio::spawn(async move {
        loop {
            match updates.recv().await {
                Ok(update) => {
                    let frame = serde_json::json!({
                        "type": "biome_market_update",
                        "biome": update.biome,
                        "price": update.price,
                        "total_shares": update.total_shares,
                        "market_cash_pool": update.market_cash_pool,
                        "timestamp": update.timestamp,
                    });
                    if let Ok(text) = serde_json::to_string(&frame) {
                        hub.broadcast_all(
                            axum::extract::ws::Message::Text(text),
                            connections::Priority::NonCritical,
                        );
                    }
                },
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "market update fanout lagged, dropped frames");
                },
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
    });
}
