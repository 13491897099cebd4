//! Generic run-time harness shared by every binary in this workspace.
//!
//! A binary defines a config struct, implements [`RunnableConfig`] for it, and
//! calls [`run_server`]. This crate takes care of the parts that are the same
//! for every binary: reading a YAML config file, installing a panic hook that
//! logs a backtrace, initializing structured logging, and serving `/metrics`
//! and `/healthz` on a side port while the real work runs.

use anyhow::Context;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Implemented by every binary's top-level config type.
#[async_trait]
pub trait RunnableConfig: Send + Sync + DeserializeOwned + Serialize + 'static {
    /// Run the binary to completion (in practice: forever, until it is killed
    /// or an unrecoverable error surfaces).
    async fn run(&self) -> anyhow::Result<()>;

    /// Used in tracing spans and the `/healthz` body.
    fn get_server_name(&self) -> String;
}

/// Wraps a binary-specific config with the fields every binary needs:
/// where to serve metrics/health, and the log level.
#[derive(Debug, Deserialize, Serialize)]
pub struct GenericConfig<T: RunnableConfig> {
    /// Port the `/metrics` and `/healthz` endpoints are served on.
    #[serde(default = "default_health_check_port")]
    pub health_check_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(flatten)]
    pub server_config: T,
}

fn default_health_check_port() -> u16 {
    8081
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Loads a `GenericConfig<T>` from a YAML file, rejecting unknown top-level
/// keys so a typo in the config never silently becomes a no-op.
pub fn load_config<T: RunnableConfig>(path: &PathBuf) -> anyhow::Result<GenericConfig<T>> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    let expanded = expand_env_vars(&raw);
    let config: GenericConfig<T> = serde_yaml::from_str(&expanded)
        .with_context(|| format!("failed to parse config file at {}", path.display()))?;
    Ok(config)
}

/// Minimal `${VAR}` substitution so deployments can keep secrets out of the
/// checked-in config file.
fn expand_env_vars(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("${") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        match after.find('}') {
            Some(end) => {
                let var_name = &after[..end];
                let value = std::env::var(var_name).unwrap_or_default();
                out.push_str(&value);
                rest = &after[end + 1..];
            },
            None => {
                out.push_str("${");
                rest = after;
                break;
            },
        }
    }
    out.push_str(rest);
    out
}

/// Installs a panic hook that logs via `tracing` with a captured backtrace,
/// instead of the default stderr dump, so panics show up in structured logs.
pub fn install_panic_hook() {
    std::panic::set_hook(Box::new(|info| {
        let backtrace = backtrace::Backtrace::new();
        tracing::error!(panic = %info, backtrace = ?backtrace, "panic");
    }));
}

/// Initializes the global `tracing` subscriber: JSON output, level driven by
/// `RUST_LOG` if set, otherwise by `log_level`.
pub fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_level.to_string()));
    let _ = tracing_subscriber::fmt()
        .json()
        .with_env_filter(filter)
        .with_target(true)
        .try_init();
}

/// Loads the config at `config_path`, brings up logging and the metrics/health
/// server, then runs `T::run` to completion. This is the single entry point
/// every binary's `main` should call.
pub async fn run_server<T: RunnableConfig>(config_path: PathBuf) -> anyhow::Result<()> {
    install_panic_hook();

    let config = load_config::<T>(&config_path)?;
    init_tracing(&config.log_level);

    let server_name = config.server_config.get_server_name();
    tracing::info!(server_name = %server_name, health_check_port = config.health_check_port, "starting");

    let health_port = config.health_check_port;
    let health_name = server_name.clone();
    tokio::spawn(async move {
        serve_health_and_metrics(health_port, health_name).await;
    });

    config.server_config.run().await
}

/// Serves `/metrics` (Prometheus text exposition) and `/healthz` on
/// `127.0.0.1:<port>` using `warp`, independent of whatever web framework the
/// binary's own `run()` uses for its primary traffic.
async fn serve_health_and_metrics(port: u16, server_name: String) {
    use prometheus::{Encoder, TextEncoder};
    use warp::Filter;

    let server_name = Arc::new(server_name);
    let metrics_route = warp::path("metrics").map(move || {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = Vec::new();
        if let Err(err) = encoder.encode(&metric_families, &mut buffer) {
            tracing::error!(error = %err, "failed to encode metrics");
        }
        warp::http::Response::builder()
            .header("Content-Type", encoder.format_type())
            .body(buffer)
    });

    let name_for_health = server_name.clone();
    let health_route = warp::path("healthz").map(move || format!("ok: {}", name_for_health));

    let routes = metrics_route.or(health_route);
    warp::serve(routes).run(([127, 0, 0, 1], port)).await;
}
