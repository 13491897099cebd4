// Hand-maintained instead of `diesel print-schema`-generated, since this
// workspace has no live database to introspect against; kept in sync with
// `migrations/` by hand.

pub mod sql_types {
    #[derive(diesel::sql_types::SqlType)]
    #[diesel(postgres_type(name = "user_role"))]
    pub struct UserRole;

    #[derive(diesel::sql_types::SqlType)]
    #[diesel(postgres_type(name = "biome_tag"))]
    pub struct BiomeTag;

    #[derive(diesel::sql_types::SqlType)]
    #[diesel(postgres_type(name = "listing_kind"))]
    pub struct ListingKind;

    #[derive(diesel::sql_types::SqlType)]
    #[diesel(postgres_type(name = "listing_status"))]
    pub struct ListingStatus;

    #[derive(diesel::sql_types::SqlType)]
    #[diesel(postgres_type(name = "transaction_source"))]
    pub struct TransactionSource;

    #[derive(diesel::sql_types::SqlType)]
    #[diesel(postgres_type(name = "transaction_type"))]
    pub struct TransactionType;
}

diesel::table! {
    use diesel::sql_types::*;
    use super::sql_types::UserRole;

    users (id) {
        id -> Uuid,
        display_name -> Text,
        role -> UserRole,
        balance -> BigInt,
        suspended -> Bool,
        banned -> Bool,
        last_seen -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
        deleted_at -> Nullable<Timestamptz>,
    }
}

diesel::table! {
    use diesel::sql_types::*;
    use super::sql_types::BiomeTag;

    lands (id) {
        id -> Uuid,
        owner_id -> Nullable<Uuid>,
        x -> Integer,
        y -> Integer,
        biome -> BiomeTag,
        fencing_enabled -> Bool,
        fencing_passcode -> Nullable<Text>,
        width -> Integer,
        height -> Integer,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;
    use super::sql_types::{ListingKind, ListingStatus};

    listings (id) {
        id -> Uuid,
        seller_id -> Uuid,
        land_id -> Uuid,
        kind -> ListingKind,
        base_price -> BigInt,
        buy_now_price -> Nullable<BigInt>,
        reserve_price -> BigInt,
        starts_at -> Timestamptz,
        ends_at -> Timestamptz,
        status -> ListingStatus,
        auto_extend_window_secs -> Integer,
        bid_increment -> BigInt,
        created_at -> Timestamptz,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    bids (id) {
        id -> Uuid,
        listing_id -> Uuid,
        bidder_id -> Uuid,
        amount -> BigInt,
        refunded -> Bool,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    chat_sessions (id) {
        id -> Text,
        land_id -> Nullable<Uuid>,
        name -> Text,
        is_public -> Bool,
        message_count -> BigInt,
        last_message_at -> Nullable<Timestamptz>,
        retention_ttl_secs -> Nullable<Integer>,
        deleted_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    messages (id) {
        id -> Uuid,
        session_id -> Text,
        sender_id -> Uuid,
        content -> Binary,
        encrypted -> Bool,
        is_leave_message -> Bool,
        read_by_owner -> Bool,
        read_at -> Nullable<Timestamptz>,
        deleted_at -> Nullable<Timestamptz>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;
    use super::sql_types::{TransactionSource, TransactionType, BiomeTag};

    transactions (id) {
        id -> Uuid,
        source -> TransactionSource,
        tx_type -> TransactionType,
        buyer_id -> Nullable<Uuid>,
        seller_id -> Nullable<Uuid>,
        land_id -> Nullable<Uuid>,
        listing_id -> Nullable<Uuid>,
        gross_amount -> BigInt,
        platform_fee -> BigInt,
        net_amount -> BigInt,
        biome -> Nullable<BiomeTag>,
        shares -> Nullable<Numeric>,
        price_per_share -> Nullable<BigInt>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;
    use super::sql_types::BiomeTag;

    biome_markets (biome) {
        biome -> BiomeTag,
        total_shares -> Numeric,
        price_per_share -> BigInt,
        market_cash_pool -> BigInt,
        attention_accumulator -> Double,
        updated_at -> Timestamptz,
    }
}

diesel::table! {
    use diesel::sql_types::*;
    use super::sql_types::BiomeTag;

    biome_holdings (user_id, biome) {
        user_id -> Uuid,
        biome -> BiomeTag,
        shares -> Numeric,
        cost_basis -> BigInt,
    }
}

diesel::table! {
    audit_log (id) {
        id -> Uuid,
        actor_id -> Nullable<Uuid>,
        action -> Text,
        subject_type -> Text,
        subject_id -> Nullable<Text>,
        detail -> Jsonb,
        ip -> Nullable<Text>,
        created_at -> Timestamptz,
    }
}

diesel::table! {
    bans (user_id) {
        user_id -> Uuid,
        reason -> Text,
        banned_by -> Uuid,
        created_at -> Timestamptz,
    }
}

diesel::joinable!(lands -> users (owner_id));
diesel::joinable!(listings -> lands (land_id));
diesel::joinable!(bids -> listings (listing_id));
diesel::joinable!(messages -> chat_sessions (session_id));

diesel::allow_tables_to_appear_in_same_query!(
    users,
    lands,
    listings,
    bids,
    chat_sessions,
    messages,
    transactions,
    biome_markets,
    biome_holdings,
    audit_log,
    bans,
);
