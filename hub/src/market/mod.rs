//! Market Engine (C4): the attention ledger and the 500 ms redistribution
//! loop that reallocates biome cash pools by accumulated attention, updates
//! prices under a volatility clamp, and broadcasts the result.

use crate::config::Config;
use crate::db::models::{BiomeMarket, BiomeMarketUpdate, BiomeTag};
use crate::db::{ArcDbPool, DbConnection};
use crate::error::{AppError, AppResult};
use crate::Cache;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Memory-resident per-biome attention accumulator. Writes from
/// `track_attention` land here; the redistribution loop swaps the whole
/// array out atomically at each cycle boundary and flushes the consumed
/// value to `biome_markets.attention_accumulator` for durability before
/// resetting it to zero, so each redistribution cycle sees a fresh snapshot
/// and durably records what it consumed.
struct AttentionLedger {
    weights: Mutex<[f64; BiomeTag::ALL.len()]>,
}

impl AttentionLedger {
    fn new() -> Self {
        Self {
            weights: Mutex::new([0.0; BiomeTag::ALL.len()]),
        }
    }

    fn index_of(biome: BiomeTag) -> usize {
        BiomeTag::ALL.iter().position(|b| *b == biome).expect("BiomeTag::ALL is exhaustive")
    }

    fn add(&self, biome: BiomeTag, weight: f64) {
        let mut weights = self.weights.lock();
        weights[Self::index_of(biome)] += weight;
    }

    /// Atomically reads and zeroes every counter, returning the values
    /// consumed by this cycle.
    fn swap_and_reset(&self) -> [f64; BiomeTag::ALL.len()] {
        let mut weights = self.weights.lock();
        let snapshot = *weights;
        *weights = [0.0; BiomeTag::ALL.len()];
        snapshot
    }
}

pub struct MarketEngine {
    db: ArcDbPool,
    cache: Arc<Cache>,
    config: Arc<Config>,
    ledger: AttentionLedger,
}

impl MarketEngine {
    pub fn new(db: ArcDbPool, cache: Arc<Cache>, config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            db,
            cache,
            config,
            ledger: AttentionLedger::new(),
        })
    }

    /// Accumulates `weight` into `biome`'s in-memory counter. The call
    /// itself performs a single deterministic increment and nothing else
    /// (no read-modify-write across unrelated state), so retrying a dropped
    /// request never corrupts other ledger entries or double-applies side
    /// effects beyond the one counter it targets.
    pub fn track_attention(&self, user_id: Uuid, biome: BiomeTag, weight: f64) -> AppResult<()> {
        if !weight.is_finite() || weight < 0.0 {
            return Err(AppError::Validation("attention weight must be a non-negative finite number".to_string()));
        }
        tracing::trace!(user_id = %user_id, biome = %biome, weight, "tracked attention");
        self.ledger.add(biome, weight);
        Ok(())
    }

    /// Runs forever, firing one redistribution cycle per `cadence`. Some
    /// drift is tolerated; no artificial jitter is added beyond whatever
    /// `tokio::time::interval` itself drifts by.
    pub fn spawn_loop(self: Arc<Self>, cadence: Duration) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(cadence);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(err) = self.run_cycle().await {
                    tracing::warn!(error = %err, "redistribution cycle failed");
                }
            }
        })
    }

    /// One full redistribution cycle, run inside a single database
    /// transaction that locks every biome row in
    /// ascending tag order, the same lock regime C3's buy/sell operations
    /// use, so a cycle never observes a buy/sell mid-mutation.
    pub async fn run_cycle(&self) -> AppResult<()> {
        let attention = self.ledger.swap_and_reset();
        let redistribution_fraction = self.config.redistribution_fraction();
        let clamp_fraction = self.config.price_clamp_fraction();

        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let updates = conn
            .transaction(|conn| {
                async move {
                    crate::db::set_lock_timeout(conn).await?;
                    let mut rows = Vec::with_capacity(BiomeTag::ALL.len());
                    for biome in BiomeTag::ALL {
                        rows.push(Self::lock_market(conn, biome).await?);
                    }

                    let total_attention: f64 = attention.iter().sum();
                    let total_withdrawal: i64 = if total_attention > 0.0 {
                        rows.iter()
                            .map(|row| (row.market_cash_pool as f64 * redistribution_fraction).round() as i64)
                            .sum()
                    } else {
                        0
                    };

                    let mut updates = Vec::with_capacity(rows.len());
                    for row in &rows {
                        let idx = AttentionLedger::index_of(row.biome);
                        let consumed_attention = attention[idx];

                        let new_pool = if total_attention > 0.0 {
                            let withdrawal = (row.market_cash_pool as f64 * redistribution_fraction).round() as i64;
                            let deposit =
                                (total_withdrawal as f64 * consumed_attention / total_attention).round() as i64;
                            (row.market_cash_pool - withdrawal + deposit).max(0)
                        } else {
                            row.market_cash_pool
                        };

                        use bigdecimal::ToPrimitive;
                        let total_shares_f64 = row.total_shares.to_f64().unwrap_or(0.0);
                        let raw_price = if total_shares_f64 > 0.0 {
                            ((new_pool as f64 / total_shares_f64).round() as i64).max(1)
                        } else {
                            row.price_per_share
                        };
                        let (clamped_price, was_clamped) =
                            clamp_price(row.price_per_share, raw_price, clamp_fraction);
                        if was_clamped {
                            tracing::info!(
                                biome = %row.biome,
                                old_price = row.price_per_share,
                                raw_price,
                                clamped_price,
                                "redistribution cycle clamped price move"
                            );
                        }

                        Self::persist_market(conn, row.biome, new_pool, clamped_price, consumed_attention).await?;

                        updates.push(BiomeMarketUpdate {
                            biome: row.biome,
                            price: clamped_price,
                            total_shares: row.total_shares.clone(),
                            market_cash_pool: new_pool,
                            timestamp: chrono::Utc::now(),
                        });
                    }

                    Ok::<_, AppError>(updates)
                }
                .scope_boxed()
            })
            .await?;

        for update in &updates {
            if let Err(err) = self.cache.publish_market_update(update).await {
                tracing::warn!(error = %err, biome = %update.biome, "failed to publish biome market update");
            }
        }
        tracing::debug!(biomes = updates.len(), "redistribution cycle complete");
        Ok(())
    }

    /// All seven biome rows, for `/biome-market/markets`.
    pub async fn list_markets(&self) -> AppResult<Vec<BiomeMarket>> {
        use crate::schema::biome_markets::dsl;
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        Ok(dsl::biome_markets.load::<BiomeMarket>(&mut conn).await?)
    }

    pub async fn get_market(&self, biome: BiomeTag) -> AppResult<BiomeMarket> {
        use crate::schema::biome_markets::dsl;
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        Ok(dsl::biome_markets
            .filter(dsl::biome.eq(biome))
            .first::<BiomeMarket>(&mut conn)
            .await?)
    }

    /// The caller's non-zero biome holdings, for `/biome-market/portfolio`.
    pub async fn portfolio(&self, user_id: Uuid) -> AppResult<Vec<crate::db::models::BiomeHolding>> {
        use crate::schema::biome_holdings::dsl;
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        Ok(dsl::biome_holdings
            .filter(dsl::user_id.eq(user_id))
            .load::<crate::db::models::BiomeHolding>(&mut conn)
            .await?)
    }

    async fn lock_market(conn: &mut DbConnection, biome: BiomeTag) -> AppResult<BiomeMarket> {
        use crate::schema::biome_markets::dsl;
        Ok(dsl::biome_markets
            .filter(dsl::biome.eq(biome))
            .for_update()
            .first::<BiomeMarket>(conn)
            .await?)
    }

    async fn persist_market(
        conn: &mut DbConnection,
        biome: BiomeTag,
        new_pool: i64,
        new_price: i64,
        consumed_attention: f64,
    ) -> AppResult<()> {
        use crate::schema::biome_markets::dsl;
        diesel::update(dsl::biome_markets.filter(dsl::biome.eq(biome)))
            .set((
                dsl::market_cash_pool.eq(new_pool),
                dsl::price_per_share.eq(new_price),
                dsl::attention_accumulator.eq(consumed_attention),
                dsl::updated_at.eq(chrono::Utc::now()),
            ))
            .execute(conn)
            .await?;
        Ok(())
    }
}

/// Clamps `new_price` to within `clamp_fraction` of `old_price`. Returns the
/// price to use and whether it was clamped.
fn clamp_price(old_price: i64, new_price: i64, clamp_fraction: f64) -> (i64, bool) {
    if old_price <= 0 {
        return (new_price.max(1), false);
    }
    let move_fraction = (new_price - old_price).abs() as f64 / old_price as f64;
    if move_fraction <= clamp_fraction {
        return (new_price, false);
    }
    let max_delta = (old_price as f64 * clamp_fraction).floor() as i64;
    let clamped = if new_price > old_price {
        old_price + max_delta
    } else {
        old_price - max_delta
    };
    (clamped.max(1), true)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attention_ledger_accumulates_and_resets() {
        let ledger = AttentionLedger::new();
        ledger.add(BiomeTag::Forest, 40.0);
        ledger.add(BiomeTag::Forest, 60.0);
        ledger.add(BiomeTag::Ocean, 5.0);

        let snapshot = ledger.swap_and_reset();
        assert_eq!(snapshot[AttentionLedger::index_of(BiomeTag::Forest)], 100.0);
        assert_eq!(snapshot[AttentionLedger::index_of(BiomeTag::Ocean)], 5.0);

        let after_reset = ledger.swap_and_reset();
        assert!(after_reset.iter().all(|w| *w == 0.0));
    }

    #[test]
    fn price_move_within_clamp_passes_through() {
        // Exactly 5% is allowed; the clamp only rejects moves past it.
        let (price, clamped) = clamp_price(100, 105, 0.05);
        assert_eq!(price, 105);
        assert!(!clamped);
    }

    #[test]
    fn price_move_over_clamp_is_restricted() {
        let (price, clamped) = clamp_price(100, 106, 0.05);
        assert_eq!(price, 105);
        assert!(clamped);
    }

    #[test]
    fn price_drop_is_clamped_symmetrically() {
        let (price, clamped) = clamp_price(100, 50, 0.05);
        assert_eq!(price, 95);
        assert!(clamped);
    }

    #[test]
    fn scenario_s3_forest_redistribution_with_clamp() {
        // All seven biomes start at pool=1_000_000, price=100. Forest gets
        // all 100 units of attention this cycle.
        let redistribution_fraction = 0.25;
        let pool = 1_000_000i64;
        let withdrawal = (pool as f64 * redistribution_fraction).round() as i64;
        assert_eq!(withdrawal, 250_000);
        let total_withdrawal = withdrawal * 7;
        assert_eq!(total_withdrawal, 1_750_000);

        let forest_new_pool = pool - withdrawal + total_withdrawal; // all attention to forest
        assert_eq!(forest_new_pool, 1_000_000 - 250_000 + 1_750_000);

        let other_new_pool = pool - withdrawal; // no attention, no deposit
        assert_eq!(other_new_pool, 750_000);

        let total_shares = 10_000.0;
        let forest_raw_price = (forest_new_pool as f64 / total_shares).round() as i64;
        let (forest_price, forest_clamped) = clamp_price(100, forest_raw_price, 0.05);
        assert!(forest_clamped);
        assert_eq!(forest_price, 105);

        let other_raw_price = (other_new_pool as f64 / total_shares).round() as i64;
        let (other_price, other_clamped) = clamp_price(100, other_raw_price, 0.05);
        assert!(other_clamped);
        assert_eq!(other_price, 95);
    }
}
