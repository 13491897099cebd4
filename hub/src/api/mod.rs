//! API Surface (C10): REST and WebSocket entry points, thin wrappers that
//! validate input shape, resolve the caller identity, and call into
//! C3/C4/C6/C7/C8/C9. Holds no business logic of its own.

pub mod frames;
pub mod ws;

use crate::auth::{AuthenticatedUser, TokenVerifier};
use crate::cache::Cache;
use crate::chat::ChatService;
use crate::connections::ConnectionHub;
use crate::db::ArcDbPool;
use crate::db::models::{BiomeTag, ListingKind, TransactionSource};
use crate::error::{AppError, AppResult};
use crate::market::MarketEngine;
use crate::media::MediaSignaling;
use crate::moderation::ModerationService;
use crate::presence::PresenceStore;
use crate::rooms::RoomManager;
use crate::transactions::TransactionEngine;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{FromRequestParts, Path, Query, State};
use axum::http::request::Parts;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

pub struct AppState {
    pub db: ArcDbPool,
    pub cache: Arc<Cache>,
    pub hub: Arc<ConnectionHub>,
    pub rooms: Arc<RoomManager>,
    pub presence: Arc<PresenceStore>,
    pub chat: Arc<ChatService>,
    pub media: Arc<MediaSignaling>,
    pub txn: Arc<TransactionEngine>,
    pub market: Arc<MarketEngine>,
    pub moderation: Arc<ModerationService>,
    pub verifier: Arc<dyn TokenVerifier>,
}

/// Resolves the bearer token carried by the `Authorization: Bearer <token>`
/// header into an `AuthenticatedUser`. Every REST handler below that isn't
/// itself the `/auth/*` collaborator takes this as an extractor.
pub struct AuthUser(pub AuthenticatedUser);

#[async_trait::async_trait]
impl FromRequestParts<Arc<AppState>> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &Arc<AppState>) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AppError::Auth("missing Authorization header".to_string()))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or_else(|| AppError::Auth("Authorization header must be a bearer token".to_string()))?;
        let user = state.verifier.verify(token)?;
        Ok(AuthUser(user))
    }
}

#[derive(Deserialize)]
struct TokenQuery {
    token: String,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ws/connect", get(ws_connect_handler))
        .route("/webrtc/signal", get(ws_signal_handler))
        .route("/chat/sessions", get(list_chat_sessions))
        .route(
            "/chat/sessions/:id/messages",
            get(chat_session_history).post(chat_session_send),
        )
        .route("/chat/sessions/:id/mark-read", post(chat_mark_read))
        .route("/chat/land/:id/messages", get(chat_land_history))
        .route("/chat/unread-messages", get(chat_unread_messages))
        .route("/marketplace/listings", get(list_listings).post(create_listing))
        .route("/marketplace/listings/:id", delete(cancel_listing))
        .route("/marketplace/listings/:id/bids", post(place_bid))
        .route("/marketplace/listings/:id/buy-now", post(buy_now))
        .route("/marketplace/transactions/audit-trail", get(audit_trail))
        .route("/biome-market/markets", get(list_biome_markets))
        .route("/biome-market/markets/:biome", get(get_biome_market))
        .route("/biome-market/buy", post(biome_buy))
        .route("/biome-market/sell", post(biome_sell))
        .route("/biome-market/portfolio", get(biome_portfolio))
        .route("/biome-market/track-attention", post(track_attention))
        .route("/admin/users/:id/suspend", post(suspend_user))
        .route("/admin/users/:id/unsuspend", post(unsuspend_user))
        .route("/admin/users/:id/ban", post(ban_user))
        .with_state(state)
}

// -- WebSocket upgrades -----------------------------------------------------

async fn ws_connect_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let user = match state.verifier.verify(&query.token) {
        Ok(user) => user,
        Err(_) => return StatusCode::UNAUTHORIZED.into_response(),
    };
    let dispatcher = Arc::new(ws::HubDispatcher { state: state.clone() });
    ws.on_upgrade(move |socket| async move {
        crate::connections::handle_socket(state.hub.clone(), dispatcher, socket, user.user_id).await
    })
}

async fn ws_signal_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TokenQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let user = match state.verifier.verify(&query.token) {
        Ok(user) => user,
        Err(_) => return StatusCode::UNAUTHORIZED.into_response(),
    };
    let dispatcher = Arc::new(ws::SignalingDispatcher { state: state.clone() });
    ws.on_upgrade(move |socket| async move {
        crate::connections::handle_socket(state.hub.clone(), dispatcher, socket, user.user_id).await
    })
}

// -- Chat (C8) ---------------------------------------------------------------

async fn list_chat_sessions(State(state): State<Arc<AppState>>, AuthUser(user): AuthUser) -> AppResult<Response> {
    let sessions = state.chat.sessions_for_user(user.user_id).await?;
    Ok(Json(sessions).into_response())
}

#[derive(Deserialize)]
struct HistoryQuery {
    cursor: Option<DateTime<Utc>>,
    #[serde(default = "default_history_limit")]
    limit: i64,
}

fn default_history_limit() -> i64 {
    50
}

async fn chat_session_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<HistoryQuery>,
    _user: AuthUser,
) -> AppResult<Response> {
    let messages = state.chat.history(&id, q.cursor, q.limit).await?;
    Ok(Json(messages).into_response())
}

#[derive(Deserialize)]
struct SendMessageBody {
    text: String,
}

async fn chat_session_send(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    AuthUser(user): AuthUser,
    Json(body): Json<SendMessageBody>,
) -> AppResult<Response> {
    let rate_key = format!("ratelimit:send_message:{}", user.user_id);
    if !state.cache.rate_limit_check(&rate_key, 20, 10).await? {
        return Err(AppError::RateLimited { retry_after_secs: 10 });
    }
    let message = state.chat.send_message(user.user_id, &id, &body.text).await?;
    Ok(Json(message).into_response())
}

async fn chat_mark_read(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    AuthUser(user): AuthUser,
) -> AppResult<Response> {
    let updated = state.chat.mark_read(user.user_id, &id).await?;
    Ok(Json(updated).into_response())
}

async fn chat_land_history(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    Query(q): Query<HistoryQuery>,
    _user: AuthUser,
) -> AppResult<Response> {
    let messages = state.chat.history_by_land(id, q.cursor, q.limit).await?;
    Ok(Json(messages).into_response())
}

async fn chat_unread_messages(State(state): State<Arc<AppState>>, AuthUser(user): AuthUser) -> AppResult<Response> {
    let counts = state.chat.unread_counts_for_owner(user.user_id).await?;
    let body: Vec<serde_json::Value> = counts
        .into_iter()
        .map(|(land_id, count)| serde_json::json!({"land_id": land_id, "unread": count}))
        .collect();
    Ok(Json(body).into_response())
}

// -- Marketplace (C3) ---------------------------------------------------------

#[derive(Deserialize)]
struct ListListingsQuery {
    #[serde(default = "default_listings_limit")]
    limit: i64,
}

fn default_listings_limit() -> i64 {
    50
}

async fn list_listings(
    State(state): State<Arc<AppState>>,
    Query(q): Query<ListListingsQuery>,
    _user: AuthUser,
) -> AppResult<Response> {
    let listings = state.txn.list_active_listings(q.limit).await?;
    Ok(Json(listings).into_response())
}

#[derive(Deserialize)]
struct CreateListingBody {
    land_id: Uuid,
    kind: String,
    base_price: i64,
    buy_now_price: Option<i64>,
    reserve_price: i64,
    duration_secs: i64,
}

async fn create_listing(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(body): Json<CreateListingBody>,
) -> AppResult<Response> {
    let kind = match body.kind.as_str() {
        "fixed_price" => ListingKind::FixedPrice,
        "auction" => ListingKind::Auction,
        "auction_with_buynow" => ListingKind::AuctionWithBuynow,
        other => return Err(AppError::Validation(format!("unknown listing kind '{other}'"))),
    };
    let listing = state
        .txn
        .create_listing(
            user.user_id,
            body.land_id,
            kind,
            body.base_price,
            body.buy_now_price,
            body.reserve_price,
            body.duration_secs,
        )
        .await?;
    Ok(Json(listing).into_response())
}

async fn cancel_listing(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    AuthUser(user): AuthUser,
) -> AppResult<Response> {
    let listing = state.txn.cancel_listing(user.user_id, id).await?;
    Ok(Json(listing).into_response())
}

#[derive(Deserialize)]
struct BidBody {
    amount: i64,
}

async fn place_bid(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    AuthUser(user): AuthUser,
    Json(body): Json<BidBody>,
) -> AppResult<Response> {
    let bid = state.txn.place_bid(id, user.user_id, body.amount).await?;
    Ok(Json(bid).into_response())
}

async fn buy_now(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    AuthUser(user): AuthUser,
) -> AppResult<Response> {
    let tx = state.txn.purchase_now(id, user.user_id).await?;
    Ok(Json(tx).into_response())
}

#[derive(Deserialize)]
struct AuditTrailQuery {
    source: Option<String>,
    #[serde(default = "default_audit_limit")]
    limit: i64,
}

fn default_audit_limit() -> i64 {
    50
}

async fn audit_trail(
    State(state): State<Arc<AppState>>,
    Query(q): Query<AuditTrailQuery>,
    _user: AuthUser,
) -> AppResult<Response> {
    let source = q
        .source
        .map(|s| TransactionSource::from_str(&s).map_err(|_| AppError::Validation(format!("unknown source '{s}'"))))
        .transpose()?;
    let transactions = state.txn.audit_trail(source, q.limit).await?;
    Ok(Json(transactions).into_response())
}

// -- Biome market (C4) --------------------------------------------------------

async fn list_biome_markets(State(state): State<Arc<AppState>>, _user: AuthUser) -> AppResult<Response> {
    let markets = state.market.list_markets().await?;
    Ok(Json(markets).into_response())
}

async fn get_biome_market(
    State(state): State<Arc<AppState>>,
    Path(biome): Path<String>,
    _user: AuthUser,
) -> AppResult<Response> {
    let biome = parse_biome(&biome)?;
    let market = state.market.get_market(biome).await?;
    Ok(Json(market).into_response())
}

#[derive(Deserialize)]
struct BiomeAmountBody {
    biome: String,
    amount: i64,
}

async fn biome_buy(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(body): Json<BiomeAmountBody>,
) -> AppResult<Response> {
    let biome = parse_biome(&body.biome)?;
    let tx = state.txn.biome_buy(user.user_id, biome, body.amount).await?;
    Ok(Json(tx).into_response())
}

#[derive(Deserialize)]
struct BiomeSharesBody {
    biome: String,
    shares: BigDecimal,
}

async fn biome_sell(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(body): Json<BiomeSharesBody>,
) -> AppResult<Response> {
    let biome = parse_biome(&body.biome)?;
    let tx = state.txn.biome_sell(user.user_id, biome, body.shares).await?;
    Ok(Json(tx).into_response())
}

async fn biome_portfolio(State(state): State<Arc<AppState>>, AuthUser(user): AuthUser) -> AppResult<Response> {
    let holdings = state.market.portfolio(user.user_id).await?;
    Ok(Json(holdings).into_response())
}

#[derive(Deserialize)]
struct TrackAttentionBody {
    biome: String,
    weight: f64,
}

async fn track_attention(
    State(state): State<Arc<AppState>>,
    AuthUser(user): AuthUser,
    Json(body): Json<TrackAttentionBody>,
) -> AppResult<Response> {
    let biome = parse_biome(&body.biome)?;
    state.market.track_attention(user.user_id, biome, body.weight)?;
    Ok(StatusCode::ACCEPTED.into_response())
}

fn parse_biome(raw: &str) -> AppResult<BiomeTag> {
    BiomeTag::from_str(raw).map_err(|_| AppError::Validation(format!("unknown biome '{raw}'")))
}

// -- Moderation (data-layer only) ----------------------------------------

async fn suspend_user(
    State(state): State<Arc<AppState>>,
    Path(target): Path<Uuid>,
    AuthUser(actor): AuthUser,
) -> AppResult<Response> {
    let user = state.moderation.suspend_user(actor.user_id, actor.role, target).await?;
    Ok(Json(user).into_response())
}

async fn unsuspend_user(
    State(state): State<Arc<AppState>>,
    Path(target): Path<Uuid>,
    AuthUser(actor): AuthUser,
) -> AppResult<Response> {
    let user = state.moderation.unsuspend_user(actor.user_id, actor.role, target).await?;
    Ok(Json(user).into_response())
}

#[derive(Deserialize)]
struct BanBody {
    reason: String,
}

async fn ban_user(
    State(state): State<Arc<AppState>>,
    Path(target): Path<Uuid>,
    AuthUser(actor): AuthUser,
    Json(body): Json<BanBody>,
) -> AppResult<Response> {
    let ban = state.moderation.ban_user(actor.user_id, actor.role, target, &body.reason).await?;
    Ok(Json(ban).into_response())
}
