#[cfg(unix)]
#[global_allocator]
static ALLOC: jemallocator::Jemalloc = jemallocator::Jemalloc;

use clap::Parser;
use std::path::PathBuf;

/// Realtime communication hub, attention-driven market engine, and unified
/// transaction engine for the virtual-world platform.
#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    /// Path to the YAML config file (see `hub::config::Config` for the
    /// recognized keys; unknown keys are rejected).
    #[clap(long, value_parser, default_value = "config.yaml")]
    config_path: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    match server_framework::run_server::<hub::config::Config>(args.config_path).await {
        Ok(()) => std::process::exit(0),
        Err(err) => {
            if hub::error::is_storage_unreachable(&err) {
                eprintln!("storage unreachable at startup: {err:#}");
                std::process::exit(2);
            }
            eprintln!("fatal error: {err:#}");
            std::process::exit(1);
        },
    }
}
