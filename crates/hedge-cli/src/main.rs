//! Operational CLI (spec.md §6 "Operational CLI"). Grounded on the
//! teacher's `cli::main` clap-subcommand/`tracing_subscriber::fmt` shape,
//! generalized from the Hyperliquid bot registry to this engine's
//! discovery supervisor, signal API, and dashboard relay drain.

mod discovery;
mod wiring;

use std::sync::Arc;

use clap::Parser;
use hedge_core::config_loader::ConfigLoader;

#[derive(Parser)]
#[command(name = "hedge")]
#[command(about = "Binary prediction-market hedging and market-making engine", long_about = None)]
struct Cli {
    /// Config file path, layered under env vars named in spec.md §6.
    #[arg(short, long, default_value = "config/Config.toml")]
    config: String,

    /// Port for the embedded signal API (spec.md §6 `--port N`).
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let mut config = ConfigLoader::load(&cli.config)?;
    if let Some(port) = cli.port {
        config.server.port = port;
    }

    let dashboard_rx = hedge_core::dashboard::init_global_relay();
    tokio::spawn(drain_dashboard_relay(dashboard_rx, config.dashboard_url.clone()));

    let wiring = wiring::build(config).await?;
    let addr = format!("{}:{}", wiring.config.server.host, wiring.config.server.port);
    let api_key = wiring.config.server.api_key.clone();
    let store = wiring.store.clone();

    let (supervisor, market_rx, user_rx) = discovery::Supervisor::new(wiring).await?;
    let supervisor = Arc::new(supervisor);
    let router = supervisor.router();

    let (price_tx, price_rx) = tokio::sync::mpsc::channel(1000);

    let bridge_supervisor = supervisor.clone();
    tokio::spawn(async move { bridge_supervisor.run_market_data_bridge(market_rx, price_tx).await });

    let discovery_supervisor = supervisor.clone();
    let coins = vec!["btc".to_string(), "eth".to_string(), "sol".to_string(), "xrp".to_string()];
    tokio::spawn(async move { discovery_supervisor.run_discovery(coins).await });

    let price_router = router.clone();
    tokio::spawn(async move { price_router.run_price_stream(price_rx).await });

    let user_router = router.clone();
    tokio::spawn(async move { user_router.run_user_stream(user_rx).await });

    let server = hedge_web_api::ApiServer::new(std::sync::Arc::new(store), api_key);
    tracing::info!(addr, "starting hedging engine");
    server.serve(&addr).await?;

    Ok(())
}

/// Drains the dashboard relay's receiver half so `publish_global` never
/// logs "no active receiver" (spec.md §5 "singleton Dashboard Relay event
/// sink"). HTTP delivery to an external dashboard is out of scope (spec.md
/// §1); when `DASHBOARD_URL` is set, each event is logged at debug level
/// instead of forwarded.
async fn drain_dashboard_relay(rx: Option<tokio::sync::mpsc::Receiver<hedge_core::events::DashboardEvent>>, dashboard_url: Option<String>) {
    let Some(mut rx) = rx else { return };
    while let Some(event) = rx.recv().await {
        if dashboard_url.is_some() {
            tracing::debug!(?event, "dashboard event");
        }
    }
}
