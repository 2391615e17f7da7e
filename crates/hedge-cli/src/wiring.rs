//! Component assembly for the `run` command (spec.md §6 "Operational CLI").
//! Grounded on the teacher's `cli::main::run_trading_system`, generalized
//! from a single bot-registry/web-api pair to the full dependency graph
//! this engine's actors need: gateway, store, exchange clients, collateral
//! executor selection, position manager, and the strategy router.

use std::sync::Arc;

use hedge_collateral::{CollateralOps, EoaExecutor, PolygonRpc, SafeDirectExecutor, SafeRelayerExecutor, TxExecutor, Wallet};
use hedge_core::config::{AppConfig, AuthMode};
use hedge_exchange::clob_client::{ApiCredentials, ClobClient};
use hedge_gateway::RateLimitedGateway;
use hedge_positions::PositionManager;
use hedge_store::Store;
use hedge_strategy::OrderSigner;

/// Everything a [`crate::discovery::Supervisor`] needs to build and
/// register a [`hedge_strategy::MarketLoop`] per discovered market.
pub struct Wiring {
    pub config: AppConfig,
    pub gateway: Arc<RateLimitedGateway>,
    pub store: Store,
    pub clob: Arc<ClobClient>,
    pub collateral: Arc<CollateralOps>,
    pub positions: Arc<PositionManager>,
    pub signer: Arc<OrderSigner>,
    pub wallet_address: [u8; 20],
}

/// Builds the gateway, store, exchange clients, collateral executor, signer
/// and position manager from `config` and the environment (spec.md §6 reads
/// `AUTH_MODE`, `USE_DIRECT_EXECUTION`, `POLYMARKET_PRIVATE_KEY`,
/// `POLYMARKET_FUNDER`).
///
/// # Errors
/// Returns an error if the store cannot be opened, the wallet's private key
/// is missing or malformed, or (in `PROXY-direct` mode) the Safe's on-chain
/// nonce cannot be read.
pub async fn build(config: AppConfig) -> anyhow::Result<Wiring> {
    let gateway = Arc::new(RateLimitedGateway::new());
    for (category, limit) in &config.gateway.categories {
        gateway.configure_category(
            category,
            hedge_gateway::CategoryLimit {
                max_requests_per_window: limit.max_requests_per_window,
                window_ms: limit.window_ms,
                min_interval_ms: limit.min_interval_ms,
                max_retries: limit.max_retries,
                base_backoff_ms: limit.base_backoff_ms,
            },
        );
    }

    let store = Store::open(&config.store.db_path).await?;

    let wallet = Wallet::from_env(hedge_collateral::POLYGON_CHAIN_ID, config.wallet.funder.as_deref())?;
    let wallet_address = wallet.funder_address();
    let rpc = PolygonRpc::new(config.exchange.rpc_url.clone());

    let executor: Arc<dyn TxExecutor> = match config.wallet.auth_mode {
        AuthMode::Eoa => Arc::new(EoaExecutor::new(rpc.clone(), wallet)),
        AuthMode::Proxy if config.wallet.use_direct_execution => {
            let starting_nonce = read_safe_nonce(&rpc, &wallet_address).await.unwrap_or(0);
            Arc::new(SafeDirectExecutor::new(rpc.clone(), wallet, starting_nonce))
        }
        AuthMode::Proxy => {
            let relayer_url = std::env::var("RELAYER_URL").unwrap_or_default();
            let relayer_api_key = std::env::var("RELAYER_API_KEY").unwrap_or_default();
            let starting_nonce = read_safe_nonce(&rpc, &wallet_address).await.unwrap_or(0);
            Arc::new(SafeRelayerExecutor::new(relayer_url, relayer_api_key, wallet, starting_nonce))
        }
    };

    let collateral = Arc::new(CollateralOps::new(gateway.clone(), store.clone(), executor, rpc));
    collateral.ensure_approvals().await?;

    let api_creds = ApiCredentials {
        api_key: std::env::var("CLOB_API_KEY").unwrap_or_default(),
        secret: std::env::var("CLOB_API_SECRET").unwrap_or_default(),
        passphrase: std::env::var("CLOB_API_PASSPHRASE").unwrap_or_default(),
    };
    let clob = Arc::new(
        ClobClient::new(api_creds, hedge_collateral::wallet::eip55_checksum(&wallet_address), gateway.clone())
            .with_base_url(config.exchange.clob_host.clone()),
    );

    let positions = Arc::new(PositionManager::load_snapshot(config.store.positions_snapshot_path.clone()));
    positions.spawn_periodic_snapshot(std::time::Duration::from_secs(config.store.snapshot_interval_secs));

    let signer = Arc::new(OrderSigner::from_env(wallet_address, hedge_collateral::POLYGON_CHAIN_ID)?);

    Ok(Wiring { config, gateway, store, clob, collateral, positions, signer, wallet_address })
}

/// Reads a Gnosis Safe's on-chain `nonce()` getter (selector `0xaffed0e0`,
/// no args) so `SafeDirectExecutor`/`SafeRelayerExecutor` start from the
/// venue's actual value instead of assuming zero.
async fn read_safe_nonce(rpc: &PolygonRpc, safe_address: &[u8; 20]) -> anyhow::Result<u64> {
    const SAFE_NONCE_SELECTOR: [u8; 4] = [0xaf, 0xfe, 0xd0, 0xe0];
    let address = hedge_collateral::wallet::eip55_checksum(safe_address);
    let result = rpc.eth_call(&address, &SAFE_NONCE_SELECTOR).await?;
    let mut buf = [0u8; 8];
    let len = result.len();
    if len >= 8 {
        buf.copy_from_slice(&result[len - 8..len]);
    } else {
        buf[8 - len..].copy_from_slice(&result);
    }
    Ok(u64::from_be_bytes(buf))
}
