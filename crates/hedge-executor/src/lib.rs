//! Order Executor (spec.md §4.7): the unified entry point for order
//! placement. Grounded on the teacher's
//! `arbitrage::{execution::PolymarketExecutor, live_executor::LiveExecutor}`
//! pair, generalized from a single arbitrage-leg submission to the
//! liquidity-gated precise-buy / chunked-flip-buy / resting-lock-order
//! trio spec.md §4.7 names, and rewired onto `hedge-exchange::ClobClient`
//! plus the Market-Data WS book cache instead of the teacher's
//! `polymarket-client-sdk` wrapper.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hedge_core::events::{OrderSide, TimeInForce};
use hedge_exchange::clob_client::{ClobClient, OrderRequest};
use hedge_exchange::MarketDataWs;
use parking_lot::Mutex;
use rust_decimal::Decimal;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{info, warn};

const PENDING_FILL_TIMEOUT: Duration = Duration::from_secs(5);
/// spec.md §6: status `"delayed"` assumes a fixed 3-second inherent venue
/// delay and requires a 4-second post-wait before the follow-up order read.
/// Open Question (spec.md §9): this fixed window may be insufficient for
/// some market classes; no override knob is named so it isn't made
/// configurable here.
const DELAYED_ORDER_POST_WAIT: Duration = Duration::from_secs(4);
const FLIP_MAX_LOOPS: u32 = 10;
const FLIP_INTER_CHUNK_PAUSE: Duration = Duration::from_millis(500);
const FLIP_CHUNK_LIQUIDITY_WAIT: Duration = Duration::from_secs(15);
const LIQUIDITY_POLL_INTERVAL: Duration = Duration::from_millis(500);

fn liquidity_gate_ratio() -> Decimal {
    Decimal::new(15, 1) // 1.5
}

fn flip_chunk_size() -> Decimal {
    Decimal::new(20, 0)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderExecStatus {
    Filled,
    Partial,
    Failed,
    NoLiquidity,
    Killed,
}

#[derive(Debug, Clone)]
pub struct PreciseBuyParams {
    pub token_id: String,
    pub side: OrderSide,
    pub shares: Decimal,
    pub max_price: Decimal,
    pub signature: String,
    pub salt: String,
}

#[derive(Debug, Clone)]
pub struct PreciseBuyResult {
    pub success: bool,
    pub filled_shares: Decimal,
    pub filled_price: Decimal,
    pub avg_price: Decimal,
    pub total_cost: Decimal,
    pub order_id: Option<String>,
    pub status: OrderExecStatus,
}

impl PreciseBuyResult {
    fn no_liquidity() -> Self {
        Self {
            success: false,
            filled_shares: Decimal::ZERO,
            filled_price: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            total_cost: Decimal::ZERO,
            order_id: None,
            status: OrderExecStatus::NoLiquidity,
        }
    }

    fn failed() -> Self {
        Self {
            success: false,
            filled_shares: Decimal::ZERO,
            filled_price: Decimal::ZERO,
            avg_price: Decimal::ZERO,
            total_cost: Decimal::ZERO,
            order_id: None,
            status: OrderExecStatus::Failed,
        }
    }
}

#[derive(Debug, Clone)]
pub struct LockOrderResult {
    pub order_id: String,
    pub immediately_filled: Decimal,
    pub fill_price: Option<Decimal>,
    pub resting: bool,
}

/// A realized fill, delivered by the strategy loop from the User-Channel WS
/// (spec.md §4.4) into `notify_fill` to resolve a pending-fill promise.
#[derive(Debug, Clone)]
pub struct RealizedFill {
    pub order_id: String,
    pub filled_shares: Decimal,
    pub filled_price: Decimal,
}

pub type OnOrderFilled = Arc<dyn Fn(&str, Decimal, Decimal, OrderSide) + Send + Sync>;

pub struct OrderExecutor {
    clob: Arc<ClobClient>,
    market_ws: Arc<MarketDataWs>,
    pending: Mutex<HashMap<String, oneshot::Sender<RealizedFill>>>,
    on_order_filled: Option<OnOrderFilled>,
}

impl OrderExecutor {
    #[must_use]
    pub fn new(clob: Arc<ClobClient>, market_ws: Arc<MarketDataWs>, on_order_filled: Option<OnOrderFilled>) -> Self {
        Self { clob, market_ws, pending: Mutex::new(HashMap::new()), on_order_filled }
    }

    /// Called by the strategy loop when a `OrderFill` arrives on the
    /// User-Channel WS (spec.md §4.7 step 3 "await WS confirmation").
    pub fn notify_fill(&self, fill: RealizedFill) {
        if let Some(tx) = self.pending.lock().remove(&fill.order_id) {
            let _ = tx.send(fill);
        }
    }

    fn register_pending(&self, order_id: String) -> oneshot::Receiver<RealizedFill> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(order_id, tx);
        rx
    }

    fn cancel_pending(&self, order_id: &str) {
        self.pending.lock().remove(order_id);
    }

    /// `precise_buy` (spec.md §4.7). Liquidity-gated IOC(FAK) buy with a
    /// synchronous-fill fast path and a WS-confirmation fallback.
    pub async fn precise_buy(&self, params: PreciseBuyParams) -> PreciseBuyResult {
        if params.shares <= Decimal::ZERO {
            return PreciseBuyResult::no_liquidity();
        }
        let max_price = hedge_exchange::book::ceil_to_cent(params.max_price);
        let available = self.market_ws.available_qty_at_or_below(&params.token_id, max_price);
        if available / params.shares < liquidity_gate_ratio() {
            return PreciseBuyResult::no_liquidity();
        }

        let order = OrderRequest {
            token_id: params.token_id.clone(),
            side: params.side,
            price: max_price,
            size: params.shares,
            time_in_force: TimeInForce::Fak,
            signature: params.signature.clone(),
            salt: params.salt.clone(),
        };

        let response = match self.clob.submit_order(&order).await {
            Ok(r) => r,
            Err(e) => {
                warn!(token_id = %params.token_id, error = %e, "precise_buy submit failed");
                return PreciseBuyResult::failed();
            }
        };

        let order_id = response.order_id.clone().unwrap_or_default();

        // spec.md §6: a "delayed" status means the venue itself hasn't
        // settled the match yet (no fill amounts to trust in this response).
        // Wait out the assumed venue delay, then re-read the order directly
        // instead of racing the WS-confirmation path against it.
        if response.status.as_deref() == Some("delayed") {
            return self.resolve_delayed_order(order_id, &params).await;
        }

        // Step 3: if the synchronous response already carries fill amounts,
        // trust it directly — fill events over WS may race ahead of the
        // HTTP response and cause an order-id mismatch false timeout.
        if let (Some(taking), Some(making)) = (&response.taking_amount, &response.making_amount) {
            if let (Ok(filled_shares), Ok(total_cost)) = (taking.parse::<Decimal>(), making.parse::<Decimal>()) {
                if filled_shares > Decimal::ZERO {
                    let avg_price = total_cost / filled_shares;
                    self.invoke_callback(&order_id, filled_shares, avg_price, params.side);
                    let status = if filled_shares >= params.shares { OrderExecStatus::Filled } else { OrderExecStatus::Partial };
                    return PreciseBuyResult {
                        success: true,
                        filled_shares,
                        filled_price: avg_price,
                        avg_price,
                        total_cost,
                        order_id: Some(order_id),
                        status,
                    };
                }
            }
        }

        if !response.success || order_id.is_empty() {
            return PreciseBuyResult::failed();
        }

        let rx = self.register_pending(order_id.clone());
        match tokio::time::timeout(PENDING_FILL_TIMEOUT, rx).await {
            Ok(Ok(fill)) => {
                self.invoke_callback(&fill.order_id, fill.filled_shares, fill.filled_price, params.side);
                let status = if fill.filled_shares >= params.shares { OrderExecStatus::Filled } else { OrderExecStatus::Partial };
                PreciseBuyResult {
                    success: fill.filled_shares > Decimal::ZERO,
                    filled_shares: fill.filled_shares,
                    filled_price: fill.filled_price,
                    avg_price: fill.filled_price,
                    total_cost: fill.filled_shares * fill.filled_price,
                    order_id: Some(fill.order_id),
                    status,
                }
            }
            Ok(Err(_)) => {
                // sender dropped without a fill: treat as killed (FAK that matched nothing).
                PreciseBuyResult { order_id: Some(order_id), status: OrderExecStatus::Killed, ..PreciseBuyResult::no_liquidity() }
            }
            Err(_) => {
                self.cancel_pending(&order_id);
                warn!(order_id, "precise_buy WS confirmation timed out after 5s");
                PreciseBuyResult { order_id: Some(order_id), status: OrderExecStatus::Killed, ..PreciseBuyResult::no_liquidity() }
            }
        }
    }

    /// spec.md §6/§9: post-waits `DELAYED_ORDER_POST_WAIT` then issues the
    /// "follow-up order read" against the venue to pick up the fill the
    /// original response couldn't report yet.
    async fn resolve_delayed_order(&self, order_id: String, params: &PreciseBuyParams) -> PreciseBuyResult {
        tokio::time::sleep(DELAYED_ORDER_POST_WAIT).await;
        match self.clob.get_order_status(&order_id).await {
            Ok(followup) => {
                if let (Some(taking), Some(making)) = (&followup.taking_amount, &followup.making_amount) {
                    if let (Ok(filled_shares), Ok(total_cost)) = (taking.parse::<Decimal>(), making.parse::<Decimal>()) {
                        if filled_shares > Decimal::ZERO {
                            let avg_price = total_cost / filled_shares;
                            self.invoke_callback(&order_id, filled_shares, avg_price, params.side);
                            let status = if filled_shares >= params.shares { OrderExecStatus::Filled } else { OrderExecStatus::Partial };
                            return PreciseBuyResult {
                                success: true,
                                filled_shares,
                                filled_price: avg_price,
                                avg_price,
                                total_cost,
                                order_id: Some(order_id),
                                status,
                            };
                        }
                    }
                }
                warn!(order_id, "delayed order's follow-up read reported no fill after post-wait");
                PreciseBuyResult { order_id: Some(order_id), status: OrderExecStatus::Killed, ..PreciseBuyResult::no_liquidity() }
            }
            Err(e) => {
                warn!(order_id, error = %e, "delayed order's follow-up read failed");
                PreciseBuyResult { order_id: Some(order_id), status: OrderExecStatus::Failed, ..PreciseBuyResult::no_liquidity() }
            }
        }
    }

    fn invoke_callback(&self, order_id: &str, shares: Decimal, price: Decimal, side: OrderSide) {
        if let Some(cb) = &self.on_order_filled {
            cb(order_id, shares, price, side);
        }
    }

    /// `precise_flip_buy` (spec.md §4.7): delegates to `precise_buy` when
    /// depth is already sufficient, otherwise chunks into ≤20-share FOK
    /// sub-orders.
    pub async fn precise_flip_buy(&self, params: PreciseBuyParams) -> Vec<PreciseBuyResult> {
        let max_price = hedge_exchange::book::ceil_to_cent(params.max_price);
        let available = self.market_ws.available_qty_at_or_below(&params.token_id, max_price);
        if params.shares <= Decimal::ZERO {
            return vec![PreciseBuyResult::no_liquidity()];
        }
        if available / params.shares >= liquidity_gate_ratio() {
            return vec![self.precise_buy(params).await];
        }

        let mut remaining = params.shares;
        let mut results = Vec::new();
        for _ in 0..FLIP_MAX_LOOPS {
            if remaining <= Decimal::ZERO {
                break;
            }
            let chunk_size = remaining.min(flip_chunk_size());
            self.wait_for_liquidity(&params.token_id, chunk_size, max_price, FLIP_CHUNK_LIQUIDITY_WAIT).await;

            let chunk_params = PreciseBuyParams {
                token_id: params.token_id.clone(),
                side: params.side,
                shares: chunk_size,
                max_price,
                signature: params.signature.clone(),
                salt: params.salt.clone(),
            };
            let result = self.precise_buy(chunk_params).await;
            remaining -= result.filled_shares;
            results.push(result);
            if remaining > Decimal::ZERO {
                tokio::time::sleep(FLIP_INTER_CHUNK_PAUSE).await;
            }
        }
        results
    }

    /// `place_lock_order` (spec.md §4.7): a non-blocking GTC resting order.
    pub async fn place_lock_order(&self, params: PreciseBuyParams) -> Result<LockOrderResult, String> {
        let order = OrderRequest {
            token_id: params.token_id,
            side: params.side,
            price: params.max_price,
            size: params.shares,
            time_in_force: TimeInForce::Gtc,
            signature: params.signature,
            salt: params.salt,
        };
        let response = self.clob.submit_order(&order).await.map_err(|e| e.to_string())?;
        let order_id = response.order_id.unwrap_or_default();
        let immediately_filled = response
            .taking_amount
            .as_deref()
            .and_then(|s| s.parse::<Decimal>().ok())
            .unwrap_or(Decimal::ZERO);
        let fill_price = response.making_amount.as_deref().and_then(|s| s.parse::<Decimal>().ok()).map(|cost| {
            if immediately_filled > Decimal::ZERO { cost / immediately_filled } else { Decimal::ZERO }
        });
        info!(order_id, %immediately_filled, "lock order placed");
        Ok(LockOrderResult { resting: immediately_filled < params.shares, order_id, immediately_filled, fill_price })
    }

    /// `cancel_orders(condition_id, token_id?)` (spec.md §4.7): a
    /// zero-count result is not an error — it signals the order had
    /// already filled.
    pub async fn cancel_orders(&self, condition_id: &str, token_id: Option<&str>) -> Result<usize, String> {
        self.clob.cancel_orders(condition_id, token_id).await.map_err(|e| e.to_string())
    }

    /// `check_liquidity` (spec.md §4.7): synchronous depth check.
    #[must_use]
    pub fn check_liquidity(&self, token_id: &str, required: Decimal, max_price: Decimal) -> bool {
        self.market_ws.available_qty_at_or_below(token_id, max_price) >= required
    }

    /// `wait_for_liquidity` (spec.md §4.7): polls every 500ms up to
    /// `timeout`. Returns `true` if sufficient depth appeared in time.
    pub async fn wait_for_liquidity(&self, token_id: &str, required: Decimal, max_price: Decimal, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.check_liquidity(token_id, required, max_price) {
                return true;
            }
            if Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(LIQUIDITY_POLL_INTERVAL).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hedge_exchange::clob_client::{ApiCredentials, ClobClient};
    use hedge_exchange::MarketDataWsConfig;
    use hedge_gateway::RateLimitedGateway;
    use rust_decimal_macros::dec;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn executor_with(server_uri: String) -> (OrderExecutor, Arc<MarketDataWs>) {
        let gateway = Arc::new(RateLimitedGateway::disabled());
        let creds = ApiCredentials { api_key: "k".into(), secret: "c2VjcmV0Ynl0ZXM".into(), passphrase: "p".into() };
        let clob = Arc::new(ClobClient::new(creds, "0xabc".to_string(), gateway).with_base_url(server_uri));
        let (market_ws, _rx) = MarketDataWs::connect(vec!["tok-up".to_string()], MarketDataWsConfig::default()).await.unwrap();
        let market_ws = Arc::new(market_ws);
        (OrderExecutor::new(clob, market_ws.clone(), None), market_ws)
    }

    #[tokio::test]
    async fn precise_buy_rejects_when_liquidity_below_1_5x() {
        let server = MockServer::start().await;
        let (executor, market_ws) = executor_with(server.uri()).await;
        market_ws.add_tokens(vec!["tok-up".to_string()]).await;
        // No book seeded: available == 0, so available/shares < 1.5 always.
        let result = executor
            .precise_buy(PreciseBuyParams {
                token_id: "tok-up".to_string(),
                side: OrderSide::Buy,
                shares: dec!(10),
                max_price: dec!(0.5),
                signature: "sig".to_string(),
                salt: "1".to_string(),
            })
            .await;
        assert_eq!(result.status, OrderExecStatus::NoLiquidity);
    }

    #[tokio::test]
    async fn precise_buy_rejects_zero_shares_without_hitting_the_venue() {
        let server = MockServer::start().await;
        // No mock is registered for POST /order: if the zero-share guard
        // were missing, this request would fail the mock server's
        // unexpected-request assertion instead of returning NoLiquidity.
        let (executor, market_ws) = executor_with(server.uri()).await;
        market_ws.add_tokens(vec!["tok-up".to_string()]).await;

        let result = executor
            .precise_buy(PreciseBuyParams {
                token_id: "tok-up".to_string(),
                side: OrderSide::Buy,
                shares: dec!(0),
                max_price: dec!(0.5),
                signature: "sig".to_string(),
                salt: "1".to_string(),
            })
            .await;
        assert_eq!(result.status, OrderExecStatus::NoLiquidity);
    }

    #[tokio::test]
    async fn wait_for_liquidity_times_out_without_depth() {
        let server = MockServer::start().await;
        let (executor, market_ws) = executor_with(server.uri()).await;
        market_ws.add_tokens(vec!["tok-up".to_string()]).await;
        let found = executor.wait_for_liquidity("tok-up", dec!(10), dec!(0.5), Duration::from_millis(50)).await;
        assert!(!found);
    }

    #[tokio::test]
    async fn cancel_orders_zero_count_is_ok_not_error() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .and(path("/orders"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"canceled": []})))
            .mount(&server)
            .await;
        let (executor, _market_ws) = executor_with(server.uri()).await;
        let count = executor.cancel_orders("0xcond", Some("tok-up")).await.unwrap();
        assert_eq!(count, 0);
    }
}
