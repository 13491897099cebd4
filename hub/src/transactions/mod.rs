//! Transaction Engine (C3): the only writer of user balances, biome market
//! cash pools, and share quantities. Every operation runs inside a single
//! database transaction under pessimistic row locks acquired in a
//! deterministic order (entity kind, then ascending id) to avoid deadlocking
//! against concurrent operations touching the same rows.

use crate::config::Config;
use crate::db::models::{
    Bid, BiomeHolding, BiomeMarket, Land, Listing, ListingKind, ListingStatus, NewBid,
    NewBiomeHolding, NewListing, NewTransaction, Transaction, TransactionSource, TransactionType,
    User,
};
use crate::db::{ArcDbPool, DbConnection};
use crate::error::{AppError, AppResult};
use bigdecimal::{BigDecimal, ToPrimitive};
use chrono::{Duration as ChronoDuration, Utc};
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};
use std::sync::Arc;
use uuid::Uuid;

pub struct TransactionEngine {
    db: ArcDbPool,
    config: Arc<Config>,
}

/// Result of settling an auction past its end time: either a qualifying bid
/// won and the land changed hands, or the auction expired with no bid
/// meeting the reserve. Both are successful completions of the sweep, not
/// errors.
#[derive(Debug)]
pub enum AuctionOutcome {
    Sold(Transaction),
    Expired,
}

impl TransactionEngine {
    pub fn new(db: ArcDbPool, config: Arc<Config>) -> Self {
        Self { db, config }
    }

    async fn lock_user(conn: &mut DbConnection, id: Uuid) -> AppResult<User> {
        use crate::schema::users::dsl;
        Ok(dsl::users
            .filter(dsl::id.eq(id))
            .for_update()
            .first::<User>(conn)
            .await?)
    }

    async fn lock_land(conn: &mut DbConnection, id: Uuid) -> AppResult<Land> {
        use crate::schema::lands::dsl;
        Ok(dsl::lands
            .filter(dsl::id.eq(id))
            .for_update()
            .first::<Land>(conn)
            .await?)
    }

    async fn lock_listing(conn: &mut DbConnection, id: Uuid) -> AppResult<Listing> {
        use crate::schema::listings::dsl;
        Ok(dsl::listings
            .filter(dsl::id.eq(id))
            .for_update()
            .first::<Listing>(conn)
            .await?)
    }

    async fn lock_biome_market(conn: &mut DbConnection, biome: crate::db::models::BiomeTag) -> AppResult<BiomeMarket> {
        use crate::schema::biome_markets::dsl;
        Ok(dsl::biome_markets
            .filter(dsl::biome.eq(biome))
            .for_update()
            .first::<BiomeMarket>(conn)
            .await?)
    }

    async fn lock_holding_or_default(
        conn: &mut DbConnection,
        user_id: Uuid,
        biome: crate::db::models::BiomeTag,
    ) -> AppResult<BiomeHolding> {
        use crate::schema::biome_holdings::dsl;
        let existing = dsl::biome_holdings
            .filter(dsl::user_id.eq(user_id))
            .filter(dsl::biome.eq(biome))
            .for_update()
            .first::<BiomeHolding>(conn)
            .await
            .optional()?;
        Ok(existing.unwrap_or(BiomeHolding {
            user_id,
            biome,
            shares: BigDecimal::from(0),
            cost_basis: 0,
        }))
    }

    fn bps_of(amount: i64, bps: u32) -> i64 {
        (amount as i128 * bps as i128 / 10_000) as i64
    }

    async fn adjust_balance(conn: &mut DbConnection, user_id: Uuid, delta: i64) -> AppResult<User> {
        use crate::schema::users::dsl;
        let user = dsl::users
            .filter(dsl::id.eq(user_id))
            .for_update()
            .first::<User>(conn)
            .await?;
        let new_balance = user.balance + delta;
        if new_balance < 0 {
            return Err(AppError::InsufficientFunds(format!(
                "user {user_id} balance would go negative"
            )));
        }
        diesel::update(dsl::users.filter(dsl::id.eq(user_id)))
            .set((dsl::balance.eq(new_balance), dsl::updated_at.eq(Utc::now())))
            .execute(conn)
            .await?;
        Ok(User { balance: new_balance, ..user })
    }

    async fn record_transaction(conn: &mut DbConnection, new_tx: NewTransaction) -> AppResult<Transaction> {
        use crate::schema::transactions::dsl;
        Ok(diesel::insert_into(dsl::transactions)
            .values(&new_tx)
            .get_result::<Transaction>(conn)
            .await?)
    }

    /// Marketplace fee fraction as basis points, read once per call so a
    /// config reload doesn't change the fee mid-transaction.
    fn marketplace_fee_bps(&self) -> u32 {
        self.config.marketplace_fee_bps
    }

    fn biome_fee_bps(&self) -> u32 {
        self.config.biome_fee_bps
    }

    /// Basis points guarding a single biome trade from moving more than
    /// `safeguard_fraction_bps` (default 10%) of a biome's cash pool in one
    /// shot.
    fn max_single_tx_bps(&self) -> i64 {
        self.config.safeguard_fraction_bps as i64
    }

    pub async fn create_fixed_price_sale(&self, buyer_id: Uuid, listing_id: Uuid) -> AppResult<Transaction> {
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let fee_bps = self.marketplace_fee_bps();
        conn.transaction(|conn| {
                async move {
                    crate::db::set_lock_timeout(conn).await?;
                    let listing = Self::lock_listing(conn, listing_id).await?;
                    if !listing.is_active() {
                        return Err(AppError::Conflict("listing is not active".to_string()));
                    }
                    if listing.kind != ListingKind::FixedPrice {
                        return Err(AppError::Validation("listing is not a fixed-price sale".to_string()));
                    }
                    if buyer_id == listing.seller_id {
                        return Err(AppError::Validation("buyer cannot be the seller".to_string()));
                    }

                    let mut ids = [buyer_id, listing.seller_id];
                    ids.sort();
                    for id in ids {
                        Self::lock_user(conn, id).await?;
                    }
                    let land = Self::lock_land(conn, listing.land_id).await?;

                    let price = listing.base_price;
                    let fee = Self::bps_of(price, fee_bps);
                    let net_to_seller = price - fee;

                    Self::adjust_balance(conn, buyer_id, -price).await?;
                    Self::adjust_balance(conn, listing.seller_id, net_to_seller).await?;

                    use crate::schema::lands::dsl as lands_dsl;
                    diesel::update(lands_dsl::lands.filter(lands_dsl::id.eq(land.id)))
                        .set(lands_dsl::owner_id.eq(buyer_id))
                        .execute(conn)
                        .await?;

                    use crate::schema::listings::dsl as listings_dsl;
                    diesel::update(listings_dsl::listings.filter(listings_dsl::id.eq(listing.id)))
                        .set((listings_dsl::status.eq(ListingStatus::Sold), listings_dsl::updated_at.eq(Utc::now())))
                        .execute(conn)
                        .await?;

                    let tx = Self::record_transaction(
                        conn,
                        NewTransaction {
                            id: Uuid::new_v4(),
                            source: TransactionSource::Marketplace,
                            tx_type: TransactionType::FixedPriceSale,
                            buyer_id: Some(buyer_id),
                            seller_id: Some(listing.seller_id),
                            land_id: Some(land.id),
                            listing_id: Some(listing.id),
                            gross_amount: price,
                            platform_fee: fee,
                            net_amount: net_to_seller,
                            biome: None,
                            shares: None,
                            price_per_share: None,
                        },
                    )
                    .await?;

                    Ok(tx)
                }
                .scope_boxed()
            })
            .await
    }

    /// Places a bid, executing the buy-now path inline if the bid clears the
    /// buy-now threshold on an `auction_with_buynow` listing.
    pub async fn place_bid(&self, listing_id: Uuid, bidder_id: Uuid, amount: i64) -> AppResult<Bid> {
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let auto_extend_secs = self.config.auto_extend_window_secs;
        conn.transaction(|conn| {
                async move {
                    crate::db::set_lock_timeout(conn).await?;
                    let listing = Self::lock_listing(conn, listing_id).await?;
                    if !listing.is_active() || listing.ends_at <= Utc::now() {
                        return Err(AppError::Conflict("listing is not open for bidding".to_string()));
                    }
                    if bidder_id == listing.seller_id {
                        return Err(AppError::Validation("seller cannot bid on their own listing".to_string()));
                    }

                    use crate::schema::bids::dsl as bids_dsl;
                    let current_top = bids_dsl::bids
                        .filter(bids_dsl::listing_id.eq(listing_id))
                        .filter(bids_dsl::refunded.eq(false))
                        .order(bids_dsl::amount.desc())
                        .first::<Bid>(conn)
                        .await
                        .optional()?;

                    let floor = current_top
                        .as_ref()
                        .map(|b| b.amount + listing.bid_increment)
                        .unwrap_or(listing.reserve_price)
                        .max(listing.reserve_price);
                    if amount < floor {
                        return Err(AppError::Validation(format!(
                            "bid must be at least {floor}"
                        )));
                    }

                    let mut lock_ids = vec![bidder_id];
                    if let Some(top) = &current_top {
                        lock_ids.push(top.bidder_id);
                    }
                    lock_ids.sort();
                    lock_ids.dedup();
                    for id in &lock_ids {
                        Self::lock_user(conn, *id).await?;
                    }

                    Self::adjust_balance(conn, bidder_id, -amount).await?;
                    if let Some(top) = &current_top {
                        Self::adjust_balance(conn, top.bidder_id, top.amount).await?;
                        diesel::update(bids_dsl::bids.filter(bids_dsl::id.eq(top.id)))
                            .set(bids_dsl::refunded.eq(true))
                            .execute(conn)
                            .await?;
                    }

                    let bid = diesel::insert_into(bids_dsl::bids)
                        .values(&NewBid {
                            id: Uuid::new_v4(),
                            listing_id,
                            bidder_id,
                            amount,
                        })
                        .get_result::<Bid>(conn)
                        .await?;

                    if listing.ends_at - Utc::now() < ChronoDuration::seconds(auto_extend_secs) {
                        use crate::schema::listings::dsl as listings_dsl;
                        diesel::update(listings_dsl::listings.filter(listings_dsl::id.eq(listing_id)))
                            .set(listings_dsl::ends_at.eq(listing.ends_at + ChronoDuration::seconds(auto_extend_secs)))
                            .execute(conn)
                            .await?;
                    }

                    if listing.has_buy_now() && amount >= listing.buy_now_price.unwrap_or(i64::MAX) {
                        tracing::info!(listing_id = %listing_id, "bid cleared buy-now threshold");
                    }

                    Ok(bid)
                }
                .scope_boxed()
            })
            .await
    }

    /// Dispatches "buy immediately" to whichever concrete operation applies
    /// to this listing's kind: a fixed-price sale or an auction's buy-now
    /// price.
    pub async fn purchase_now(&self, listing_id: Uuid, buyer_id: Uuid) -> AppResult<Transaction> {
        use crate::schema::listings::dsl;
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let listing = dsl::listings
            .filter(dsl::id.eq(listing_id))
            .first::<Listing>(&mut conn)
            .await?;
        match listing.kind {
            ListingKind::FixedPrice => self.create_fixed_price_sale(buyer_id, listing_id).await,
            ListingKind::Auction | ListingKind::AuctionWithBuynow => self.buy_now(listing_id, buyer_id).await,
        }
    }

    pub async fn buy_now(&self, listing_id: Uuid, buyer_id: Uuid) -> AppResult<Transaction> {
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let fee_bps = self.marketplace_fee_bps();
        conn.transaction(|conn| {
                async move {
                    crate::db::set_lock_timeout(conn).await?;
                    let listing = Self::lock_listing(conn, listing_id).await?;
                    if !listing.is_active() {
                        return Err(AppError::Conflict("listing is not active".to_string()));
                    }
                    let Some(buy_now_price) = listing.buy_now_price else {
                        return Err(AppError::Validation("listing has no buy-now price".to_string()));
                    };
                    if buyer_id == listing.seller_id {
                        return Err(AppError::Validation("buyer cannot be the seller".to_string()));
                    }

                    let mut ids = [buyer_id, listing.seller_id];
                    ids.sort();
                    for id in ids {
                        Self::lock_user(conn, id).await?;
                    }
                    let land = Self::lock_land(conn, listing.land_id).await?;

                    use crate::schema::bids::dsl as bids_dsl;
                    let open_bids = bids_dsl::bids
                        .filter(bids_dsl::listing_id.eq(listing_id))
                        .filter(bids_dsl::refunded.eq(false))
                        .load::<Bid>(conn)
                        .await?;
                    for bid in &open_bids {
                        Self::adjust_balance(conn, bid.bidder_id, bid.amount).await?;
                        diesel::update(bids_dsl::bids.filter(bids_dsl::id.eq(bid.id)))
                            .set(bids_dsl::refunded.eq(true))
                            .execute(conn)
                            .await?;
                    }

                    let fee = Self::bps_of(buy_now_price, fee_bps);
                    let net_to_seller = buy_now_price - fee;
                    Self::adjust_balance(conn, buyer_id, -buy_now_price).await?;
                    Self::adjust_balance(conn, listing.seller_id, net_to_seller).await?;

                    use crate::schema::lands::dsl as lands_dsl;
                    diesel::update(lands_dsl::lands.filter(lands_dsl::id.eq(land.id)))
                        .set(lands_dsl::owner_id.eq(buyer_id))
                        .execute(conn)
                        .await?;

                    use crate::schema::listings::dsl as listings_dsl;
                    diesel::update(listings_dsl::listings.filter(listings_dsl::id.eq(listing.id)))
                        .set((listings_dsl::status.eq(ListingStatus::Sold), listings_dsl::updated_at.eq(Utc::now())))
                        .execute(conn)
                        .await?;

                    Self::record_transaction(
                        conn,
                        NewTransaction {
                            id: Uuid::new_v4(),
                            source: TransactionSource::Marketplace,
                            tx_type: TransactionType::BuyNow,
                            buyer_id: Some(buyer_id),
                            seller_id: Some(listing.seller_id),
                            land_id: Some(land.id),
                            listing_id: Some(listing.id),
                            gross_amount: buy_now_price,
                            platform_fee: fee,
                            net_amount: net_to_seller,
                            biome: None,
                            shares: None,
                            price_per_share: None,
                        },
                    )
                    .await
                }
                .scope_boxed()
            })
            .await
    }

    pub async fn complete_auction(&self, listing_id: Uuid) -> AppResult<AuctionOutcome> {
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let fee_bps = self.marketplace_fee_bps();
        conn.transaction(|conn| {
                async move {
                    crate::db::set_lock_timeout(conn).await?;
                    let listing = Self::lock_listing(conn, listing_id).await?;
                    if !listing.is_active() {
                        return Err(AppError::Conflict("listing is not active".to_string()));
                    }
                    if listing.ends_at > Utc::now() {
                        return Err(AppError::Conflict("auction has not ended yet".to_string()));
                    }

                    use crate::schema::bids::dsl as bids_dsl;
                    let mut bids = bids_dsl::bids
                        .filter(bids_dsl::listing_id.eq(listing_id))
                        .filter(bids_dsl::refunded.eq(false))
                        .order(bids_dsl::amount.desc())
                        .load::<Bid>(conn)
                        .await?;

                    let winner = if bids.first().map(|b| b.amount >= listing.reserve_price).unwrap_or(false) {
                        Some(bids.remove(0))
                    } else {
                        None
                    };

                    let mut lock_ids: Vec<Uuid> = bids.iter().map(|b| b.bidder_id).collect();
                    if let Some(w) = &winner {
                        lock_ids.push(w.bidder_id);
                    }
                    lock_ids.push(listing.seller_id);
                    lock_ids.sort();
                    lock_ids.dedup();
                    for id in &lock_ids {
                        Self::lock_user(conn, *id).await?;
                    }
                    let land = Self::lock_land(conn, listing.land_id).await?;

                    for bid in &bids {
                        Self::adjust_balance(conn, bid.bidder_id, bid.amount).await?;
                        diesel::update(bids_dsl::bids.filter(bids_dsl::id.eq(bid.id)))
                            .set(bids_dsl::refunded.eq(true))
                            .execute(conn)
                            .await?;
                    }

                    use crate::schema::listings::dsl as listings_dsl;
                    let Some(winner) = winner else {
                        // Expiry with no qualifying bid is a terminal outcome, not a
                        // failure: the refunds above and this status change must commit
                        // together, so this returns `Ok`, not `Err` (an `Err` here would
                        // roll back the refunds this same sweep just issued).
                        diesel::update(listings_dsl::listings.filter(listings_dsl::id.eq(listing.id)))
                            .set((listings_dsl::status.eq(ListingStatus::Expired), listings_dsl::updated_at.eq(Utc::now())))
                            .execute(conn)
                            .await?;
                        return Ok(AuctionOutcome::Expired);
                    };

                    let fee = Self::bps_of(winner.amount, fee_bps);
                    let net_to_seller = winner.amount - fee;
                    Self::adjust_balance(conn, listing.seller_id, net_to_seller).await?;
                    diesel::update(bids_dsl::bids.filter(bids_dsl::id.eq(winner.id)))
                        .set(bids_dsl::refunded.eq(true))
                        .execute(conn)
                        .await?;

                    use crate::schema::lands::dsl as lands_dsl;
                    diesel::update(lands_dsl::lands.filter(lands_dsl::id.eq(land.id)))
                        .set(lands_dsl::owner_id.eq(winner.bidder_id))
                        .execute(conn)
                        .await?;

                    diesel::update(listings_dsl::listings.filter(listings_dsl::id.eq(listing.id)))
                        .set((listings_dsl::status.eq(ListingStatus::Sold), listings_dsl::updated_at.eq(Utc::now())))
                        .execute(conn)
                        .await?;

                    let tx = Self::record_transaction(
                        conn,
                        NewTransaction {
                            id: Uuid::new_v4(),
                            source: TransactionSource::Marketplace,
                            tx_type: TransactionType::AuctionSale,
                            buyer_id: Some(winner.bidder_id),
                            seller_id: Some(listing.seller_id),
                            land_id: Some(land.id),
                            listing_id: Some(listing.id),
                            gross_amount: winner.amount,
                            platform_fee: fee,
                            net_amount: net_to_seller,
                            biome: None,
                            shares: None,
                            price_per_share: None,
                        },
                    )
                    .await?;
                    Ok(AuctionOutcome::Sold(tx))
                }
                .scope_boxed()
            })
            .await
    }

    pub async fn biome_buy(&self, user_id: Uuid, biome: crate::db::models::BiomeTag, amount: i64) -> AppResult<Transaction> {
        if amount <= 0 {
            return Err(AppError::Validation("amount must be positive".to_string()));
        }
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let fee_bps = self.biome_fee_bps();
        let max_single_tx_bps = self.max_single_tx_bps();
        conn.transaction(|conn| {
                async move {
                    crate::db::set_lock_timeout(conn).await?;
                    let mut ids = [user_id];
                    ids.sort();
                    for id in ids {
                        Self::lock_user(conn, id).await?;
                    }
                    let market = Self::lock_biome_market(conn, biome).await?;

                    if amount.saturating_mul(10_000) > market.market_cash_pool.saturating_mul(max_single_tx_bps) {
                        return Err(AppError::Safeguard(
                            "trade exceeds 10% of biome cash pool, rejected".to_string(),
                        ));
                    }

                    let price = market.price_per_share.max(1);
                    let shares = BigDecimal::from(amount) / BigDecimal::from(price);
                    let fee = Self::bps_of(amount, fee_bps);
                    let deposited = amount - fee;

                    Self::adjust_balance(conn, user_id, -amount).await?;

                    use crate::schema::biome_markets::dsl as markets_dsl;
                    diesel::update(markets_dsl::biome_markets.filter(markets_dsl::biome.eq(biome)))
                        .set((
                            markets_dsl::market_cash_pool.eq(market.market_cash_pool + deposited),
                            markets_dsl::total_shares.eq(market.total_shares.clone() + shares.clone()),
                            markets_dsl::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;

                    let holding = Self::lock_holding_or_default(conn, user_id, biome).await?;
                    use crate::schema::biome_holdings::dsl as holdings_dsl;
                    diesel::insert_into(holdings_dsl::biome_holdings)
                        .values(&NewBiomeHolding {
                            user_id,
                            biome,
                            shares: shares.clone(),
                            cost_basis: amount,
                        })
                        .on_conflict((holdings_dsl::user_id, holdings_dsl::biome))
                        .do_update()
                        .set((
                            holdings_dsl::shares.eq(holding.shares + shares.clone()),
                            holdings_dsl::cost_basis.eq(holding.cost_basis + amount),
                        ))
                        .execute(conn)
                        .await?;

                    Self::record_transaction(
                        conn,
                        NewTransaction {
                            id: Uuid::new_v4(),
                            source: TransactionSource::Biome,
                            tx_type: TransactionType::BiomeBuy,
                            buyer_id: Some(user_id),
                            seller_id: None,
                            land_id: None,
                            listing_id: None,
                            gross_amount: amount,
                            platform_fee: fee,
                            net_amount: deposited,
                            biome: Some(biome),
                            shares: Some(shares),
                            price_per_share: Some(price),
                        },
                    )
                    .await
                }
                .scope_boxed()
            })
            .await
    }

    /// Active listings, most recently created first.
    pub async fn list_active_listings(&self, limit: i64) -> AppResult<Vec<Listing>> {
        use crate::schema::listings::dsl;
        let limit = limit.clamp(1, 200);
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let listings = dsl::listings
            .filter(dsl::status.eq(ListingStatus::Active))
            .order(dsl::created_at.desc())
            .limit(limit)
            .load::<Listing>(&mut conn)
            .await?;
        Ok(listings)
    }

    /// Unified transaction history, optionally filtered by source
    /// (`marketplace`/`biome`/`wallet`), most recent first.
    pub async fn audit_trail(&self, source: Option<TransactionSource>, limit: i64) -> AppResult<Vec<Transaction>> {
        use crate::schema::transactions::dsl;
        let limit = limit.clamp(1, 200);
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let mut query = dsl::transactions.into_boxed();
        if let Some(source) = source {
            query = query.filter(dsl::source.eq(source));
        }
        let transactions = query
            .order(dsl::created_at.desc())
            .limit(limit)
            .load::<Transaction>(&mut conn)
            .await?;
        Ok(transactions)
    }

    /// Creates a listing for a land the caller owns. Touches no balance or
    /// share quantity, but still runs under the land lock so a concurrent
    /// sale of the same land can't race a listing creation.
    pub async fn create_listing(
        &self,
        seller_id: Uuid,
        land_id: Uuid,
        kind: ListingKind,
        base_price: i64,
        buy_now_price: Option<i64>,
        reserve_price: i64,
        duration_secs: i64,
    ) -> AppResult<Listing> {
        if base_price <= 0 || reserve_price < 0 {
            return Err(AppError::Validation("prices must be positive".to_string()));
        }
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let auto_extend_secs = self.config.auto_extend_window_secs as i32;
        let bid_increment = self.config.default_bid_increment;
        conn.transaction(|conn| {
                async move {
                    crate::db::set_lock_timeout(conn).await?;
                    let land = Self::lock_land(conn, land_id).await?;
                    if land.owner_id != Some(seller_id) {
                        return Err(AppError::Permission("caller does not own this land".to_string()));
                    }

                    use crate::schema::listings::dsl;
                    let now = Utc::now();
                    let listing = diesel::insert_into(dsl::listings)
                        .values(&NewListing {
                            id: Uuid::new_v4(),
                            seller_id,
                            land_id,
                            kind,
                            base_price,
                            buy_now_price,
                            reserve_price,
                            starts_at: now,
                            ends_at: now + ChronoDuration::seconds(duration_secs),
                            status: ListingStatus::Active,
                            auto_extend_window_secs: auto_extend_secs,
                            bid_increment,
                        })
                        .get_result::<Listing>(conn)
                        .await?;
                    Ok(listing)
                }
                .scope_boxed()
            })
            .await
    }

    /// Cancels a listing and refunds any open bids. Only the seller may
    /// cancel, and only while the listing is still active.
    pub async fn cancel_listing(&self, seller_id: Uuid, listing_id: Uuid) -> AppResult<Listing> {
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        conn.transaction(|conn| {
                async move {
                    crate::db::set_lock_timeout(conn).await?;
                    let listing = Self::lock_listing(conn, listing_id).await?;
                    if listing.seller_id != seller_id {
                        return Err(AppError::Permission("only the seller may cancel this listing".to_string()));
                    }
                    if !listing.is_active() {
                        return Err(AppError::Conflict("listing is not active".to_string()));
                    }

                    use crate::schema::bids::dsl as bids_dsl;
                    let open_bids = bids_dsl::bids
                        .filter(bids_dsl::listing_id.eq(listing_id))
                        .filter(bids_dsl::refunded.eq(false))
                        .load::<Bid>(conn)
                        .await?;
                    for bid in &open_bids {
                        Self::adjust_balance(conn, bid.bidder_id, bid.amount).await?;
                        diesel::update(bids_dsl::bids.filter(bids_dsl::id.eq(bid.id)))
                            .set(bids_dsl::refunded.eq(true))
                            .execute(conn)
                            .await?;
                    }

                    use crate::schema::listings::dsl as listings_dsl;
                    let cancelled = diesel::update(listings_dsl::listings.filter(listings_dsl::id.eq(listing_id)))
                        .set((listings_dsl::status.eq(ListingStatus::Cancelled), listings_dsl::updated_at.eq(Utc::now())))
                        .get_result::<Listing>(conn)
                        .await?;
                    Ok(cancelled)
                }
                .scope_boxed()
            })
            .await
    }

    pub async fn biome_sell(
        &self,
        user_id: Uuid,
        biome: crate::db::models::BiomeTag,
        shares: BigDecimal,
    ) -> AppResult<Transaction> {
        if shares <= BigDecimal::from(0) {
            return Err(AppError::Validation("shares must be positive".to_string()));
        }
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let fee_bps = self.biome_fee_bps();
        conn.transaction(|conn| {
                async move {
                    crate::db::set_lock_timeout(conn).await?;
                    let mut ids = [user_id];
                    ids.sort();
                    for id in ids {
                        Self::lock_user(conn, id).await?;
                    }
                    let holding = Self::lock_holding_or_default(conn, user_id, biome).await?;
                    if holding.shares < shares {
                        return Err(AppError::Validation("insufficient biome shares".to_string()));
                    }
                    let market = Self::lock_biome_market(conn, biome).await?;

                    let price = market.price_per_share.max(1);
                    let gross = (shares.clone() * BigDecimal::from(price))
                        .round(0)
                        .to_i64()
                        .ok_or_else(|| AppError::internal(anyhow::anyhow!("gross amount overflow")))?;
                    let fee = Self::bps_of(gross, fee_bps);
                    let net = gross - fee;

                    if gross > market.market_cash_pool {
                        return Err(AppError::Conflict("biome cash pool cannot cover this sale".to_string()));
                    }

                    // Reduce cost basis by the sold fraction of the holding, not a flat
                    // per-share amount, so partial sells keep an accurate remaining basis.
                    let sold_fraction = shares.clone() / holding.shares.clone();
                    let cost_basis_sold = (BigDecimal::from(holding.cost_basis) * sold_fraction)
                        .round(0)
                        .to_i64()
                        .unwrap_or(0)
                        .min(holding.cost_basis);

                    use crate::schema::biome_holdings::dsl as holdings_dsl;
                    diesel::update(
                        holdings_dsl::biome_holdings
                            .filter(holdings_dsl::user_id.eq(user_id))
                            .filter(holdings_dsl::biome.eq(biome)),
                    )
                    .set((
                        holdings_dsl::shares.eq(holding.shares - shares.clone()),
                        holdings_dsl::cost_basis.eq(holding.cost_basis - cost_basis_sold),
                    ))
                    .execute(conn)
                    .await?;

                    use crate::schema::biome_markets::dsl as markets_dsl;
                    diesel::update(markets_dsl::biome_markets.filter(markets_dsl::biome.eq(biome)))
                        .set((
                            markets_dsl::market_cash_pool.eq(market.market_cash_pool - gross),
                            markets_dsl::total_shares.eq(market.total_shares.clone() - shares.clone()),
                            markets_dsl::updated_at.eq(Utc::now()),
                        ))
                        .execute(conn)
                        .await?;

                    Self::adjust_balance(conn, user_id, net).await?;

                    Self::record_transaction(
                        conn,
                        NewTransaction {
                            id: Uuid::new_v4(),
                            source: TransactionSource::Biome,
                            tx_type: TransactionType::BiomeSell,
                            buyer_id: None,
                            seller_id: Some(user_id),
                            land_id: None,
                            listing_id: None,
                            gross_amount: gross,
                            platform_fee: fee,
                            net_amount: net,
                            biome: Some(biome),
                            shares: Some(shares),
                            price_per_share: Some(price),
                        },
                    )
                    .await
                }
                .scope_boxed()
            })
            .await
    }

    /// Ids of active listings whose `ends_at` has passed and are still
    /// active, candidates for `complete_auction`.
    async fn due_for_completion(&self) -> AppResult<Vec<Uuid>> {
        use crate::schema::listings::dsl;
        let mut conn = self.db.get().await.map_err(AppError::internal)?;
        let ids = dsl::listings
            .filter(dsl::status.eq(ListingStatus::Active))
            .filter(dsl::ends_at.le(Utc::now()))
            .select(dsl::id)
            .load::<Uuid>(&mut conn)
            .await?;
        Ok(ids)
    }
}

/// Periodically sweeps for active listings past their `ends_at` and settles
/// them, since nothing else in this system observes wall-clock time on a
/// listing's behalf. Runs for the lifetime of the process.
pub fn spawn_auction_sweep(engine: Arc<TransactionEngine>, interval: std::time::Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let due = match engine.due_for_completion().await {
                Ok(ids) => ids,
                Err(err) => {
                    tracing::warn!(error = %err, "auction sweep: failed to list due listings");
                    continue;
                },
            };
            for listing_id in due {
                match engine.complete_auction(listing_id).await {
                    Ok(AuctionOutcome::Sold(tx)) => {
                        tracing::info!(listing_id = %listing_id, transaction_id = %tx.id, "auction settled");
                    },
                    Ok(AuctionOutcome::Expired) => {
                        tracing::info!(listing_id = %listing_id, "auction expired with no qualifying bid");
                    },
                    Err(err) => {
                        tracing::warn!(listing_id = %listing_id, error = %err, "auction sweep: failed to complete auction");
                    },
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fee_math_matches_s1_fixed_price_sale() {
        // A lists at 1000, B buys. Fee 5% -> A nets 950.
        let fee = TransactionEngine::bps_of(1_000, 500);
        assert_eq!(fee, 50);
        assert_eq!(1_000 - fee, 950);
    }

    #[test]
    fn fee_math_matches_s2_auction_outbid_refund() {
        // X bids 500 at T+10 (balance 1000 -> 500 reserved).
        // Y bids 600 at T+55, X's 500 is refunded in full, seller nets
        // 600 - 5% = 570, Y balance 2000 - 600 = 1400.
        let reserve = 500i64;
        let increment = 50i64;
        let x_bid = 500i64;
        assert_eq!(x_bid, reserve.max(reserve)); // first bid must clear the reserve floor
        let y_bid = 600i64;
        assert!(y_bid >= x_bid + increment);

        let fee = TransactionEngine::bps_of(y_bid, 500);
        assert_eq!(fee, 30);
        assert_eq!(y_bid - fee, 570);

        let x_balance_after_outbid = 1_000i64; // reservation fully refunded
        assert_eq!(x_balance_after_outbid, 1_000);
        let y_balance_after_win = 2_000i64 - y_bid;
        assert_eq!(y_balance_after_win, 1_400);
    }

    #[test]
    fn bid_floor_boundary_accepts_exact_increment_rejects_below() {
        let previous_top = 500i64;
        let increment = 50i64;
        let reserve = 500i64;
        let floor = (previous_top + increment).max(reserve);
        assert_eq!(floor, 550);
        assert!(550 >= floor); // exactly previous_top + increment: accepted
        assert!(!(549 >= floor)); // one unit below: rejected
    }

    #[test]
    fn biome_safeguard_boundary_accepts_exactly_ten_percent() {
        let max_single_tx_bps = 1000i64; // default safeguard_fraction_bps
        let pool = 1_000_000i64;
        let at_boundary = pool / 10;
        assert!(!(at_boundary.saturating_mul(10_000) > pool.saturating_mul(max_single_tx_bps)));
        let over_boundary = at_boundary + 1;
        assert!(over_boundary.saturating_mul(10_000) > pool.saturating_mul(max_single_tx_bps));
    }

    #[test]
    fn biome_safeguard_boundary_holds_for_non_divisor_fractions() {
        // 750 bps (7.5%) does not divide 10_000 evenly; the comparison must
        // not truncate the threshold away from the configured fraction.
        let max_single_tx_bps = 750i64;
        let pool = 1_000_000i64;
        let at_boundary = 75_000i64; // exactly 7.5% of the pool
        assert!(!(at_boundary.saturating_mul(10_000) > pool.saturating_mul(max_single_tx_bps)));
        let over_boundary = at_boundary + 1;
        assert!(over_boundary.saturating_mul(10_000) > pool.saturating_mul(max_single_tx_bps));
    }

    #[test]
    fn biome_fee_math_matches_two_percent() {
        let fee = TransactionEngine::bps_of(10_000, 200);
        assert_eq!(fee, 200);
    }
}
