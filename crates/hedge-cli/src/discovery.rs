//! Crypto-15min market discovery and per-market wiring (spec.md §3
//! "Market": "metadata as discovered by the (out-of-scope) discovery
//! poller"). Polls Gamma for each tracked coin's current 15-minute window,
//! spawns a [`hedge_strategy::MarketLoop`] for every newly discovered
//! market, and bridges the single process-wide Market-Data WS book/trade
//! stream through [`hedge_pricing::PriceMonitor`] into the
//! [`hedge_strategy::Router`]. Sports markets are out of this poller's
//! scope (spec.md §3) and are registered directly via
//! [`Supervisor::register_sports_market`] instead.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hedge_core::market::{MarketDescriptor, OutcomeSide};
use hedge_exchange::gamma::GammaClient;
use hedge_exchange::market_ws::{MarketDataEvent, MarketDataWs, MarketDataWsConfig};
use hedge_exchange::user_ws::{UserChannelCreds, UserChannelConfig, UserChannelWs};
use hedge_pricing::PriceMonitor;
use hedge_strategy::{MarketLoop, Router};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::wiring::Wiring;

const DISCOVERY_INTERVAL: Duration = Duration::from_secs(30);

/// Tracks which market/side a given CLOB token id belongs to, so the
/// single multiplexed Market-Data WS stream can be demuxed into
/// [`hedge_pricing::PriceMonitor`] calls.
struct TokenIndex {
    by_token: RwLock<HashMap<String, (String, OutcomeSide)>>,
}

impl TokenIndex {
    fn new() -> Self {
        Self { by_token: RwLock::new(HashMap::new()) }
    }

    fn register(&self, descriptor: &MarketDescriptor) {
        let mut guard = self.by_token.write();
        guard.insert(descriptor.up_token_id.clone(), (descriptor.market_slug.clone(), OutcomeSide::Up));
        guard.insert(descriptor.down_token_id.clone(), (descriptor.market_slug.clone(), OutcomeSide::Down));
    }

    fn lookup(&self, token_id: &str) -> Option<(String, OutcomeSide)> {
        self.by_token.read().get(token_id).cloned()
    }
}

pub struct Supervisor {
    wiring: Wiring,
    router: Arc<Router>,
    price_monitor: Arc<PriceMonitor>,
    token_index: Arc<TokenIndex>,
    known_conditions: RwLock<std::collections::HashSet<String>>,
    market_ws: Arc<MarketDataWs>,
    user_ws: UserChannelWs,
}

impl Supervisor {
    pub async fn new(wiring: Wiring) -> anyhow::Result<(Self, mpsc::Receiver<MarketDataEvent>, mpsc::Receiver<hedge_exchange::user_ws::UserChannelEvent>)> {
        let (market_ws, market_rx) = MarketDataWs::connect(Vec::new(), MarketDataWsConfig { url: wiring.config.exchange.market_data_ws_url.clone(), ..MarketDataWsConfig::default() }).await?;

        let creds = UserChannelCreds {
            api_key: std::env::var("CLOB_API_KEY").unwrap_or_default(),
            secret: std::env::var("CLOB_API_SECRET").unwrap_or_default(),
            passphrase: std::env::var("CLOB_API_PASSPHRASE").unwrap_or_default(),
        };
        let (user_ws, user_rx) = UserChannelWs::connect(
            creds,
            Vec::new(),
            UserChannelConfig { url: wiring.config.exchange.user_channel_ws_url.clone(), ..UserChannelConfig::default() },
        )
        .await?;

        let thresholds = {
            let pricing = wiring.config.pricing.clone();
            Arc::new(move |category: &str| pricing.threshold_for(category))
        };
        let price_monitor = Arc::new(PriceMonitor::new(thresholds, wiring.config.pricing.stop_loss_threshold));

        let supervisor = Self {
            wiring,
            router: Arc::new(Router::new()),
            price_monitor,
            token_index: Arc::new(TokenIndex::new()),
            known_conditions: RwLock::new(std::collections::HashSet::new()),
            market_ws: Arc::new(market_ws),
            user_ws,
        };
        Ok((supervisor, market_rx, user_rx))
    }

    #[must_use]
    pub fn router(&self) -> Arc<Router> {
        self.router.clone()
    }

    /// Runs the Gamma discovery poll loop for `coin_prefixes` (e.g.
    /// `["btc", "eth", "sol", "xrp"]`) indefinitely.
    pub async fn run_discovery(&self, coin_prefixes: Vec<String>) {
        let gamma = GammaClient::new(self.wiring.gateway.clone());
        let mut ticker = tokio::time::interval(DISCOVERY_INTERVAL);
        loop {
            ticker.tick().await;
            for coin in &coin_prefixes {
                match gamma.get_current_15min_market(coin).await {
                    Ok(Some(descriptor)) => self.on_market_discovered(descriptor).await,
                    Ok(None) => {}
                    Err(e) => warn!(coin, error = %e, "gamma discovery poll failed"),
                }
            }
        }
    }

    async fn on_market_discovered(&self, descriptor: MarketDescriptor) {
        if !self.known_conditions.write().insert(descriptor.condition_id.clone()) {
            return;
        }
        self.spawn_market_loop(descriptor, self.wiring.config.pair_cost_target, self.wiring.config.pair_cost_target).await;
    }

    /// Registers a market outside the crypto-15min discovery poll, e.g. a
    /// sports market supplied by an operational command (spec.md §3:
    /// discovery for non-crypto categories is out of scope for this
    /// engine, but the wiring to run one is not).
    pub async fn register_sports_market(&self, descriptor: MarketDescriptor, split_amount: Decimal) {
        if !self.known_conditions.write().insert(descriptor.condition_id.clone()) {
            return;
        }
        self.spawn_market_loop(descriptor, self.wiring.config.pair_cost_target, split_amount).await;
    }

    async fn spawn_market_loop(&self, descriptor: MarketDescriptor, pair_cost_target: Decimal, split_amount: Decimal) {
        info!(market_slug = %descriptor.market_slug, condition_id = %descriptor.condition_id, "market discovered");
        self.token_index.register(&descriptor);
        self.price_monitor.register_market(&descriptor.market_slug);
        self.market_ws.add_tokens(vec![descriptor.up_token_id.clone(), descriptor.down_token_id.clone()]).await;
        self.user_ws.subscribe(descriptor.condition_id.clone()).await;

        let (market_loop, handle) = MarketLoop::new(
            descriptor,
            self.wiring.clob.clone(),
            self.market_ws.clone(),
            self.wiring.collateral.clone(),
            self.wiring.positions.clone(),
            self.wiring.signer.clone(),
            self.wiring.store.clone(),
            pair_cost_target,
            split_amount,
        );
        self.router.register(handle);
        tokio::spawn(market_loop.run());
    }

    /// Consumes the Market-Data WS's book/trade stream, feeding
    /// [`hedge_pricing::PriceMonitor`] and forwarding its derived events to
    /// `price_tx` for [`hedge_strategy::Router::run_price_stream`].
    pub async fn run_market_data_bridge(&self, mut market_rx: mpsc::Receiver<MarketDataEvent>, price_tx: mpsc::Sender<hedge_pricing::PriceEvent>) {
        while let Some(event) = market_rx.recv().await {
            match event {
                MarketDataEvent::Book(update) => {
                    let Some((market_slug, side)) = self.token_index.lookup(&update.token_id) else { continue };
                    let best_bid = update.bids.last().map(|(p, _)| *p);
                    let best_ask = update.asks.last().map(|(p, _)| *p);
                    let token_id_for_side = update.token_id.clone();
                    self.price_monitor
                        .on_book_update(&market_slug, side, best_bid, best_ask, Some(self.wiring.clob.as_ref()), Some(&token_id_for_side), &price_tx)
                        .await;
                }
                MarketDataEvent::Trade(_) => {}
                MarketDataEvent::Connected => info!("market-data ws connected"),
                MarketDataEvent::Disconnected { reason } => warn!(reason, "market-data ws disconnected"),
            }
        }
    }
}
