//! Exchange connectivity: Market-Data WS (§4.3), User-Channel WS (§4.4),
//! Balance Monitor (§4.5), and the CLOB/Gamma HTTP clients that back the
//! Order Executor (§4.7) and Collateral Operations (§4.10).

pub mod balance_monitor;
pub mod book;
pub mod clob_client;
pub mod gamma;
pub mod market_ws;
pub mod reconnect;
pub mod user_ws;

pub use balance_monitor::{BalanceEvent, BalanceMonitor, BalanceSource};
pub use book::{L2OrderBook, Side};
pub use clob_client::{ApiCredentials, ClobClient, ClobClientError, OrderRequest, OrderResponse};
pub use gamma::{GammaClient, GammaError};
pub use market_ws::{MarketDataEvent, MarketDataWs, MarketDataWsConfig};
pub use reconnect::ReconnectPolicy;
pub use user_ws::{UserChannelConfig, UserChannelCreds, UserChannelEvent, UserChannelWs};
