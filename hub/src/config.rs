//! The recognized configuration surface, loaded from YAML with `${VAR}`
//! environment expansion. Unknown keys are rejected rather than silently
//! ignored, so a typo'd key fails fast at startup instead of quietly
//! falling back to a default.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use server_framework::RunnableConfig;

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// REST + WebSocket listen address, e.g. `0.0.0.0:8080`.
    pub listen_addr: String,

    /// Postgres DSN (C1).
    pub database_url: String,

    /// Redis DSN (C2: cache, presence, pub/sub).
    pub cache_url: String,

    /// Shared secret used to verify the bearer token minted by the external
    /// auth collaborator. An HMAC verifier endpoint URL may be substituted in
    /// deployments that run a standalone token-verifier service.
    pub bearer_secret: String,

    #[serde(default = "default_marketplace_fee_bps")]
    pub marketplace_fee_bps: u32,

    #[serde(default = "default_biome_fee_bps")]
    pub biome_fee_bps: u32,

    #[serde(default = "default_redistribution_cadence_ms")]
    pub redistribution_cadence_ms: u64,

    #[serde(default = "default_price_clamp_bps")]
    pub price_clamp_bps: u32,

    #[serde(default = "default_redistribution_fraction_bps")]
    pub redistribution_fraction_bps: u32,

    #[serde(default = "default_safeguard_fraction_bps")]
    pub safeguard_fraction_bps: u32,

    #[serde(default = "default_chat_retention_secs")]
    pub chat_retention_secs: i64,

    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,

    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,

    #[serde(default = "default_auto_extend_window_secs")]
    pub auto_extend_window_secs: i64,

    #[serde(default = "default_bid_increment")]
    pub default_bid_increment: i64,

    #[serde(default = "default_presence_grace_secs")]
    pub presence_offline_grace_secs: u64,

    #[serde(default = "default_ringing_timeout_secs")]
    pub call_ringing_timeout_secs: u64,

    #[serde(default = "default_db_pool_size")]
    pub db_pool_size: u32,
}

fn default_marketplace_fee_bps() -> u32 {
    500 // 5.00%
}
fn default_biome_fee_bps() -> u32 {
    200 // 2.00%
}
fn default_redistribution_cadence_ms() -> u64 {
    500
}
fn default_price_clamp_bps() -> u32 {
    500 // 5.00%
}
fn default_redistribution_fraction_bps() -> u32 {
    2500 // 25.00%
}
fn default_safeguard_fraction_bps() -> u32 {
    1000 // 10.00%
}
fn default_chat_retention_secs() -> i64 {
    60 * 60 * 24 * 90 // 90 days
}
fn default_outbound_queue_depth() -> usize {
    256
}
fn default_heartbeat_secs() -> u64 {
    60
}
fn default_auto_extend_window_secs() -> i64 {
    10
}
fn default_bid_increment() -> i64 {
    50
}
fn default_presence_grace_secs() -> u64 {
    5
}
fn default_ringing_timeout_secs() -> u64 {
    60
}
fn default_db_pool_size() -> u32 {
    num_cpus::get() as u32 * 2
}

impl Config {
    pub fn marketplace_fee_fraction(&self) -> f64 {
        self.marketplace_fee_bps as f64 / 10_000.0
    }

    pub fn biome_fee_fraction(&self) -> f64 {
        self.biome_fee_bps as f64 / 10_000.0
    }

    pub fn price_clamp_fraction(&self) -> f64 {
        self.price_clamp_bps as f64 / 10_000.0
    }

    pub fn redistribution_fraction(&self) -> f64 {
        self.redistribution_fraction_bps as f64 / 10_000.0
    }

    pub fn safeguard_fraction(&self) -> f64 {
        self.safeguard_fraction_bps as f64 / 10_000.0
    }
}

#[async_trait]
impl RunnableConfig for Config {
    async fn run(&self) -> anyhow::Result<()> {
        crate::run_service(self.clone()).await
    }

    fn get_server_name(&self) -> String {
        "virtual-world-hub".to_string()
    }
}
