//! Cache/Pub-Sub (C2): short-TTL key-value cache, the presence store's
//! ephemeral backing, a rate-limiter token bucket, and the cross-process
//! broadcast channel the market engine (C4) publishes price updates on.
//!
//! Refresh-token issuance belongs to an external auth collaborator and is
//! out of scope here; this module only implements the namespaces this core
//! actually owns.

use crate::db::models::BiomeMarketUpdate;
use crate::error::AppResult;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use tokio::sync::broadcast;

const MARKET_UPDATE_CHANNEL: &str = "biome_market_updates";

pub struct Cache {
    client: redis::Client,
    conn: ConnectionManager,
    market_tx: broadcast::Sender<BiomeMarketUpdate>,
}

impl Cache {
    pub async fn connect(url: &str) -> AppResult<Arc<Self>> {
        let client = redis::Client::open(url).map_err(crate::error::AppError::internal)?;
        let conn = client
            .get_tokio_connection_manager()
            .await
            .map_err(crate::error::AppError::internal)?;
        let (market_tx, _rx) = broadcast::channel(1024);
        let cache = Arc::new(Self {
            client,
            conn,
            market_tx,
        });
        cache.clone().spawn_market_subscriber();
        Ok(cache)
    }

    fn conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Exposes a cloned connection handle for callers (presence, rate
    /// limiting) that need Redis commands this wrapper doesn't expose
    /// directly.
    pub fn raw_conn(&self) -> ConnectionManager {
        self.conn.clone()
    }

    pub async fn set_ex(&self, key: &str, value: &str, ttl_secs: u64) -> AppResult<()> {
        let mut conn = self.conn();
        conn.set_ex(key, value, ttl_secs as usize).await?;
        Ok(())
    }

    pub async fn get(&self, key: &str) -> AppResult<Option<String>> {
        let mut conn = self.conn();
        let value: Option<String> = conn.get(key).await?;
        Ok(value)
    }

    pub async fn del(&self, key: &str) -> AppResult<()> {
        let mut conn = self.conn();
        let _: () = conn.del(key).await?;
        Ok(())
    }

    /// Publishes to Redis, fanning out to every hub process subscribed to
    /// `MARKET_UPDATE_CHANNEL` including this one: `spawn_market_subscriber`
    /// bridges that channel back into `market_tx`, so this is the only path
    /// an update takes into the local broadcast channel. Publishing directly
    /// to `market_tx` here too would double-deliver every update on this
    /// process, since Redis still echoes it back through the subscriber.
    pub async fn publish_market_update(&self, update: &BiomeMarketUpdate) -> AppResult<()> {
        let payload = serde_json::to_string(update).map_err(crate::error::AppError::internal)?;
        let mut conn = self.conn();
        let _: () = conn.publish(MARKET_UPDATE_CHANNEL, payload).await?;
        Ok(())
    }

    pub fn subscribe_market_updates(&self) -> broadcast::Receiver<BiomeMarketUpdate> {
        self.market_tx.subscribe()
    }

    /// Bridges the Redis pub/sub channel into the local broadcast channel, so
    /// updates published by *other* hub processes still reach this
    /// process's connections. Runs for the lifetime of the process.
    fn spawn_market_subscriber(self: Arc<Self>) {
        tokio::spawn(async move {
            loop {
                match self.client.get_async_pubsub().await {
                    Ok(mut pubsub) => {
                        if let Err(err) = pubsub.subscribe(MARKET_UPDATE_CHANNEL).await {
                            tracing::warn!(error = %err, "failed to subscribe to market update channel, retrying");
                            tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                            continue;
                        }
                        let mut stream = pubsub.on_message();
                        while let Some(msg) = futures_util::StreamExt::next(&mut stream).await {
                            let payload: String = match msg.get_payload() {
                                Ok(p) => p,
                                Err(err) => {
                                    tracing::warn!(error = %err, "bad market update payload");
                                    continue;
                                },
                            };
                            match serde_json::from_str::<BiomeMarketUpdate>(&payload) {
                                Ok(update) => {
                                    let _ = self.market_tx.send(update);
                                },
                                Err(err) => {
                                    tracing::warn!(error = %err, "failed to deserialize market update");
                                },
                            }
                        }
                    },
                    Err(err) => {
                        tracing::warn!(error = %err, "failed to open pubsub connection, retrying");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    },
                }
            }
        });
    }

    /// A fixed-window rate limiter: `true` if the caller is still under
    /// `limit` actions within the current `window_secs` window for `key`.
    pub async fn rate_limit_check(&self, key: &str, limit: u32, window_secs: u64) -> AppResult<bool> {
        let mut conn = self.conn();
        let count: i64 = conn.incr(key, 1).await?;
        if count == 1 {
            let _: () = conn.expire(key, window_secs as i64).await?;
        }
        Ok((count as u32) <= limit)
    }
}
