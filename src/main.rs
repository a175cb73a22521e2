// =============================================================================
// Nucleon Matrix Federation Server - Main Entry Point
// =============================================================================
//
// Project: Nucleon - High Performance Matrix Federation Server
// Author: Nucleon Development Team
// Date: 2025-09-02
// Version: 0.3.0-alpha
// License: Apache 2.0 / MIT
//
// Description:
//   Process bootstrap: CLI parsing, configuration loading, tracing
//   setup and the federation HTTP listener with graceful shutdown.
//
// =============================================================================

use std::net::SocketAddr;

use axum::{extract::DefaultBodyLimit, routing::get, Router};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use tokio::net::TcpListener;
use tokio::signal;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};
use tracing_subscriber::{prelude::*, EnvFilter};

use nucleon::api::server_server;
use nucleon::{init_services, metrics, services, Config, Services};

mod clap;

#[cfg(all(not(target_env = "msvc"), feature = "jemalloc"))]
use tikv_jemallocator::Jemalloc;

#[cfg(all(not(target_env = "msvc"), feature = "jemalloc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[tokio::main]
async fn main() {
    let args = clap::parse();

    let config_path = if let Some(config_path) = args.config {
        config_path.to_string_lossy().to_string()
    } else if let Ok(env_config) = std::env::var("NUCLEON_CONFIG") {
        env_config
    } else {
        eprintln!("No configuration file specified!");
        eprintln!("Use --config <path> or set the NUCLEON_CONFIG environment variable");
        eprintln!("Example: ./nucleon --config nucleon.toml start");
        std::process::exit(1);
    };

    let raw_config = Figment::new()
        .merge(Toml::file(&config_path))
        .merge(Env::prefixed("NUCLEON_").global());

    let mut config = match raw_config.extract::<Config>() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("It looks like your config is invalid. The following error occurred: {e}");
            std::process::exit(1);
        }
    };

    if args.verbose {
        config.log = "debug".to_owned();
    }
    config.warn_deprecated();

    match args.command {
        clap::Commands::Start { address, port } => {
            if let Some(address) = address {
                match address.parse() {
                    Ok(addr) => config.address = addr,
                    Err(e) => {
                        eprintln!("Invalid address {address:?}: {e}");
                        std::process::exit(1);
                    }
                }
            }
            if let Some(port) = port {
                config.port = port;
            }
            start_server(config).await;
        }

        clap::Commands::CheckConfig => {
            println!("Configuration OK for {}", config.server_name);
        }
    }
}

/// Start the federation server
async fn start_server(config: Config) {
    let registry = tracing_subscriber::Registry::default();
    let fmt_layer = tracing_subscriber::fmt::Layer::new();
    let filter_layer = match EnvFilter::try_new(&config.log) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("It looks like your log config is invalid. The following error occurred while parsing it: {e}");
            EnvFilter::try_new("warn").expect("fallback filter is valid")
        }
    };
    tracing::subscriber::set_global_default(registry.with(filter_layer).with(fmt_layer))
        .expect("tracing subscriber installed once");

    info!("🚀 Starting Nucleon Matrix Federation Server");

    match Services::build(config) {
        Ok(built) => init_services(built),
        Err(e) => {
            error!("❌ Service initialization failed: {e}");
            std::process::exit(1);
        }
    }

    match run_server().await {
        Ok(()) => info!("✅ Server shutdown completed successfully"),
        Err(e) => {
            error!("❌ Server crashed: {e}");
            std::process::exit(1);
        }
    }
}

async fn run_server() -> nucleon::Result<()> {
    let config = &services().globals.config;
    let addr = SocketAddr::from((config.address, config.port));

    let mut app = server_server::federation_router();
    if config.enable_metrics {
        app = app.route("/metrics", get(metrics::metrics_handler));
    }
    let app: Router = app
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .layer(DefaultBodyLimit::max(
            services().globals.max_request_size() as usize
        ));

    info!("📡 Federation listener on {addr}");
    let listener = TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        error!("Failed to listen for shutdown signal: {e}");
        return;
    }
    info!("🛑 Shutdown signal received");
}
