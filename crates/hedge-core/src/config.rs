//! Layered application configuration (spec.md §6 "Operational CLI"),
//! following the struct-of-structs `serde` pattern used by the teacher's
//! `core::config::AppConfig`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub exchange: ExchangeConfig,
    pub gateway: GatewayConfig,
    pub pricing: PricingConfig,
    pub wallet: WalletConfig,
    #[serde(default)]
    pub dashboard_url: Option<String>,
    #[serde(default)]
    pub testbuy: bool,
    #[serde(default = "default_pair_cost_target")]
    pub pair_cost_target: rust_decimal::Decimal,
}

fn default_pair_cost_target() -> rust_decimal::Decimal {
    rust_decimal_macros::dec!(0.98)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// `x-api-key` value required on `POST /api/signal` (spec.md §6). `None`
    /// disables auth.
    pub api_key: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Single database file path (spec.md §6 "Persisted state layout").
    pub db_path: String,
    pub positions_snapshot_path: String,
    pub snapshot_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            db_path: "./data/trading.db".to_string(),
            positions_snapshot_path: "./sss_positions.json".to_string(),
            snapshot_interval_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeConfig {
    pub clob_host: String,
    pub market_data_ws_url: String,
    pub user_channel_ws_url: String,
    pub rpc_url: String,
    pub wss_rpc_url: String,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            clob_host: "https://clob.polymarket.com".to_string(),
            market_data_ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/market".to_string(),
            user_channel_ws_url: "wss://ws-subscriptions-clob.polymarket.com/ws/user".to_string(),
            rpc_url: "https://polygon-rpc.com".to_string(),
            wss_rpc_url: "wss://polygon-rpc.com".to_string(),
        }
    }
}

/// Per-category rate limits (spec.md §4.1 defaults table: 80% of
/// venue-advertised limits).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CategoryLimit {
    pub max_requests_per_window: u32,
    pub window_ms: u64,
    pub min_interval_ms: u64,
    pub max_retries: u32,
    pub base_backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    pub enabled: bool,
    pub categories: HashMap<String, CategoryLimit>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        let mut categories = HashMap::new();
        categories.insert(
            "clob-general".to_string(),
            CategoryLimit {
                max_requests_per_window: 7200,
                window_ms: 10_000,
                min_interval_ms: 2,
                max_retries: 5,
                base_backoff_ms: 250,
            },
        );
        categories.insert(
            "clob-market-data".to_string(),
            CategoryLimit {
                max_requests_per_window: 1200,
                window_ms: 10_000,
                min_interval_ms: 9,
                max_retries: 5,
                base_backoff_ms: 250,
            },
        );
        categories.insert(
            "gamma".to_string(),
            CategoryLimit {
                max_requests_per_window: 240,
                window_ms: 10_000,
                min_interval_ms: 42,
                max_retries: 5,
                base_backoff_ms: 250,
            },
        );
        categories.insert(
            "data-api".to_string(),
            CategoryLimit {
                max_requests_per_window: 120,
                window_ms: 10_000,
                min_interval_ms: 84,
                max_retries: 5,
                base_backoff_ms: 250,
            },
        );
        Self {
            enabled: true,
            categories,
        }
    }
}

/// Per-category sport/category sell thresholds (spec.md §4.6), falling back
/// to `default_sell_threshold` when a category has no override.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    pub default_sell_threshold: rust_decimal::Decimal,
    pub sell_thresholds: HashMap<String, rust_decimal::Decimal>,
    /// Disabled (`None`) by default (spec.md §4.6 "Stop-loss trigger").
    pub stop_loss_threshold: Option<rust_decimal::Decimal>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            default_sell_threshold: rust_decimal_macros::dec!(0.25),
            sell_thresholds: HashMap::new(),
            stop_loss_threshold: None,
        }
    }
}

/// spec.md §6 auth mode selection for collateral operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuthMode {
    Eoa,
    Proxy,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WalletConfig {
    pub auth_mode: AuthMode,
    pub use_direct_execution: bool,
    pub pay_own_gas: bool,
    pub funder: Option<String>,
}

impl Default for WalletConfig {
    fn default() -> Self {
        Self {
            auth_mode: AuthMode::Proxy,
            use_direct_execution: false,
            pay_own_gas: false,
            funder: None,
        }
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            store: StoreConfig::default(),
            exchange: ExchangeConfig::default(),
            gateway: GatewayConfig::default(),
            pricing: PricingConfig::default(),
            wallet: WalletConfig::default(),
            dashboard_url: None,
            testbuy: false,
            pair_cost_target: default_pair_cost_target(),
        }
    }
}

impl PricingConfig {
    #[must_use]
    pub fn threshold_for(&self, category: &str) -> rust_decimal::Decimal {
        self.sell_thresholds
            .get(category)
            .copied()
            .unwrap_or(self.default_sell_threshold)
    }
}
