//! `MarketLoop` (spec.md §4.11, §5): one actor per tracked market. Every
//! price tick, order fill, and lifecycle event for that market serializes
//! through this actor's mailbox, so `CycleTracker`/`SportsPosition` state
//! never needs its own locking. Grounded on the teacher's
//! `bot-orchestrator::{BotActor, BotHandle}` pair: the `Command`
//! enum/`run` match-loop/`oneshot` status query shape is carried over
//! directly, generalized from bot lifecycle commands (`Start`/`Stop`/
//! `Pause`) to market events (`Price`/`User`/`OrderFilled`).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::Utc;
use hedge_collateral::{CollateralOps, NegRiskRedeemShares};
use hedge_core::dashboard::publish_global;
use hedge_core::events::{DashboardEvent, LogSeverity, OrderSide};
use hedge_core::market::{MarketCategory, MarketDescriptor, OutcomeSide};
use hedge_core::position::{ArbitragePosition, OutcomeSlot, Position};
use hedge_cycle::CycleTracker;
use hedge_exchange::clob_client::ClobClient;
use hedge_exchange::user_ws::UserChannelEvent;
use hedge_exchange::MarketDataWs;
use hedge_executor::{OrderExecutor, PreciseBuyParams, PreciseBuyResult};
use hedge_positions::{Outcome, PositionManager};
use hedge_pricing::PriceEvent;
use hedge_store::Store;
use rust_decimal::Decimal;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

use crate::signer::{BuildOrderParams, OrderSigner};

const MAILBOX_CAPACITY: usize = 256;
const FEE_RATE_BPS: u16 = 0;

/// Commands accepted by a [`MarketLoop`]'s mailbox.
pub enum Command {
    Price(PriceEvent),
    User(UserChannelEvent),
    /// Delivered by the loop's own `OrderExecutor` when a resting lock
    /// order (placed GTC, not awaited synchronously) eventually fills
    /// (spec.md §4.8 "Lock order lifecycle").
    OrderFilled { order_id: String, shares: Decimal, price: Decimal, side: OrderSide },
    /// Delivered by [`MarketLoop::spawn_buy`]'s background task once a
    /// `precise_buy` call resolves. Routing this back through the mailbox
    /// (instead of awaiting the buy inline) is what keeps `run()` free to
    /// drain `Command::User` fill events while a buy's WS-confirmation
    /// wait is still in flight (spec.md §9 "both orderings must be
    /// tolerated").
    BuyCompleted(BuyIntent, PreciseBuyResult),
    GetStatus(oneshot::Sender<MarketLoopStatus>),
    Shutdown,
}

/// What a backgrounded `precise_buy` call was for, so its eventual
/// [`Command::BuyCompleted`] knows which state transition to fold the
/// result into.
pub enum BuyIntent {
    Accumulation(OutcomeSide),
    Sell(OutcomeSide),
}

#[derive(Debug, Clone)]
pub struct MarketLoopStatus {
    pub market_slug: String,
    pub is_hedged: bool,
    pub is_locked_or_settled: bool,
}

#[derive(Clone)]
pub struct MarketLoopHandle {
    market_slug: String,
    condition_id: String,
    tx: mpsc::Sender<Command>,
}

impl MarketLoopHandle {
    #[must_use]
    pub fn market_slug(&self) -> &str {
        &self.market_slug
    }

    #[must_use]
    pub fn condition_id(&self) -> &str {
        &self.condition_id
    }

    pub async fn send_price(&self, event: PriceEvent) -> Result<(), mpsc::error::SendError<Command>> {
        self.tx.send(Command::Price(event)).await
    }

    pub async fn send_user(&self, event: UserChannelEvent) -> Result<(), mpsc::error::SendError<Command>> {
        self.tx.send(Command::User(event)).await
    }

    pub async fn get_status(&self) -> anyhow::Result<MarketLoopStatus> {
        let (tx, rx) = oneshot::channel();
        self.tx.send(Command::GetStatus(tx)).await?;
        Ok(rx.await?)
    }

    pub async fn shutdown(&self) -> Result<(), mpsc::error::SendError<Command>> {
        self.tx.send(Command::Shutdown).await
    }
}

/// Discriminates the two settlement styles spec.md §3/§4.8/§4.9 name:
/// accumulate-then-lock (`crypto-15min` markets) versus split-hold-sell
/// (sports markets, via the shared [`PositionManager`]).
pub enum StrategyState {
    Hedged(CycleTracker),
    Sports,
}

/// One market's strategy actor (spec.md §4.11). Owns its own
/// [`OrderExecutor`] so the lock order's eventual async fill can be folded
/// back into this actor's serialized mailbox instead of racing with price
/// ticks on shared state (spec.md §9 "Cycles and mutual references").
pub struct MarketLoop {
    descriptor: MarketDescriptor,
    rx: mpsc::Receiver<Command>,
    self_tx: mpsc::Sender<Command>,
    clob: Arc<ClobClient>,
    collateral: Arc<CollateralOps>,
    positions: Arc<PositionManager>,
    signer: Arc<OrderSigner>,
    executor: Arc<OrderExecutor>,
    store: Store,
    state: StrategyState,
    split_amount: Decimal,
    nonce: AtomicU64,
    /// Row id for this market's `arbitrage_positions` entry (spec.md §4.2),
    /// set once at split time; `None` for `Sports` markets.
    arbitrage_position_id: Option<uuid::Uuid>,
    /// Row ids for this market's two `positions` entries (spec.md §4.2),
    /// set once at split time; `None` for `Hedged` markets.
    outcome1_position_id: Option<uuid::Uuid>,
    outcome2_position_id: Option<uuid::Uuid>,
}

impl MarketLoop {
    /// Builds the actor and its handle; does not perform any I/O. Callers
    /// spawn [`MarketLoop::run`] and register the returned handle with the
    /// [`crate::Router`].
    #[must_use]
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        descriptor: MarketDescriptor,
        clob: Arc<ClobClient>,
        market_ws: Arc<MarketDataWs>,
        collateral: Arc<CollateralOps>,
        positions: Arc<PositionManager>,
        signer: Arc<OrderSigner>,
        store: Store,
        pair_cost_target: Decimal,
        split_amount: Decimal,
    ) -> (Self, MarketLoopHandle) {
        let (tx, rx) = mpsc::channel(MAILBOX_CAPACITY);
        let callback_tx = tx.clone();
        let on_filled = Arc::new(move |order_id: &str, shares: Decimal, price: Decimal, side: OrderSide| {
            let cmd = Command::OrderFilled { order_id: order_id.to_string(), shares, price, side };
            if callback_tx.try_send(cmd).is_err() {
                warn!(order_id, "market loop mailbox full or closed, dropping resting-order fill notification");
            }
        });
        let executor = Arc::new(OrderExecutor::new(clob.clone(), market_ws, Some(on_filled)));
        let is_hedged = descriptor.category.0 == MarketCategory::crypto_15min().0;
        let state = if is_hedged { StrategyState::Hedged(CycleTracker::new(pair_cost_target)) } else { StrategyState::Sports };
        let handle = MarketLoopHandle { market_slug: descriptor.market_slug.clone(), condition_id: descriptor.condition_id.clone(), tx: tx.clone() };
        let seed_nonce = SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs()).unwrap_or(0);
        let loop_ = Self {
            descriptor,
            rx,
            self_tx: tx,
            clob,
            collateral,
            positions,
            signer,
            executor,
            store,
            state,
            split_amount,
            nonce: AtomicU64::new(seed_nonce),
            arbitrage_position_id: None,
            outcome1_position_id: None,
            outcome2_position_id: None,
        };
        (loop_, handle)
    }

    /// Runs `precise_buy` on its own task and folds the eventual result back
    /// into this actor's mailbox as [`Command::BuyCompleted`] (spec.md §9).
    /// This is what keeps `run()`'s match loop from blocking on the
    /// pending-fill oneshot inside `precise_buy`: the actor stays free to
    /// process `Command::User` fill events, which is what resolves that
    /// oneshot before it times out.
    fn spawn_buy(&self, intent: BuyIntent, params: PreciseBuyParams) {
        let executor = self.executor.clone();
        let self_tx = self.self_tx.clone();
        tokio::spawn(async move {
            let result = executor.precise_buy(params).await;
            if self_tx.send(Command::BuyCompleted(intent, result)).await.is_err() {
                warn!("market loop mailbox closed before buy result could be delivered");
            }
        });
    }

    fn next_nonce(&self) -> u64 {
        self.nonce.fetch_add(1, Ordering::Relaxed)
    }

    fn log(&self, severity: LogSeverity, message: impl Into<String>) {
        publish_global(DashboardEvent::LogMessage { severity, message: message.into() });
    }

    /// Runs the actor to completion. The first step is spec.md §4.11's
    /// "New market discovered" handler, run once before the mailbox loop
    /// starts; every later event is read off `self.rx`.
    pub async fn run(mut self) {
        self.on_market_discovered().await;

        while let Some(cmd) = self.rx.recv().await {
            match cmd {
                Command::Price(event) => self.handle_price_event(event).await,
                Command::User(event) => self.handle_user_event(event).await,
                Command::OrderFilled { order_id, shares, price, side } => self.handle_order_filled(&order_id, shares, price, side).await,
                Command::BuyCompleted(intent, result) => self.handle_buy_completed(intent, result).await,
                Command::GetStatus(tx) => {
                    let status = MarketLoopStatus {
                        market_slug: self.descriptor.market_slug.clone(),
                        is_hedged: matches!(self.state, StrategyState::Hedged(_)),
                        is_locked_or_settled: match &self.state {
                            StrategyState::Hedged(tracker) => tracker.is_locked(),
                            StrategyState::Sports => self.positions.get(&self.descriptor.market_slug).is_none(),
                        },
                    };
                    let _ = tx.send(status);
                }
                Command::Shutdown => {
                    info!(market_slug = %self.descriptor.market_slug, "market loop shutting down");
                    break;
                }
            }
        }
    }

    /// spec.md §4.11 "New market discovered": every market requests `SPLIT`
    /// on discovery, sports and hedged alike — the two strategies diverge
    /// only in what they do with the resulting balanced inventory
    /// afterwards (sports holds and sells the loser; hedged seeds the
    /// `CycleTracker` and keeps accumulating the cheaper side).
    async fn on_market_discovered(&mut self) {
        if matches!(self.state, StrategyState::Hedged(_)) {
            self.split_for_hedged().await;
            return;
        }
        self.split_for_sports().await;
    }

    /// Seeds a fresh `ArbitragePosition` from the split's balanced
    /// inventory (spec.md §3 "Arbitrage Position"). A split mints one UP
    /// and one DOWN token per unit of collateral, i.e. an equal 50/50
    /// nominal cost per pair, so the seed accumulation records both legs
    /// at `0.5` — `CycleTracker::needs_lock` only fires once later
    /// accumulation skews the two sides apart.
    async fn split_for_hedged(&mut self) {
        match self.collateral.split(&self.descriptor.condition_id, self.split_amount, self.descriptor.neg_risk).await {
            Ok(result) if result.success => {
                let arb = ArbitragePosition::new(
                    self.descriptor.market_slug.clone(),
                    self.descriptor.condition_id.clone(),
                    self.descriptor.up_token_id.clone(),
                    self.descriptor.down_token_id.clone(),
                );
                if let Err(e) = self.store.insert_arbitrage_position(&arb).await {
                    warn!(market_slug = %self.descriptor.market_slug, error = %e, "failed to persist arbitrage position");
                }
                self.arbitrage_position_id = Some(arb.id);
                let seed_price = Decimal::new(5, 1);
                if let StrategyState::Hedged(tracker) = &mut self.state {
                    tracker.record_accumulation(OutcomeSide::Up, seed_price, self.split_amount);
                    tracker.record_accumulation(OutcomeSide::Down, seed_price, self.split_amount);
                }
                self.log(LogSeverity::Info, format!("{}: split complete, hedged cycle seeded with balanced inventory", self.descriptor.market_slug));
            }
            Ok(result) => warn!(market_slug = %self.descriptor.market_slug, error = ?result.error, "split transaction failed"),
            Err(e) => warn!(market_slug = %self.descriptor.market_slug, error = %e, "split request failed"),
        }
    }

    async fn split_for_sports(&mut self) {
        let outcome1 = OutcomeSlot::new(self.descriptor.up_token_id.clone(), self.descriptor.up_label.clone());
        let outcome2 = OutcomeSlot::new(self.descriptor.down_token_id.clone(), self.descriptor.down_label.clone());
        if let Err(e) = self.positions.add_position(
            self.descriptor.market_slug.clone(),
            self.descriptor.condition_id.clone(),
            self.descriptor.category.clone(),
            outcome1,
            outcome2,
        ) {
            warn!(market_slug = %self.descriptor.market_slug, error = %e, "could not register position, skipping split");
            return;
        }

        match self.collateral.split(&self.descriptor.condition_id, self.split_amount, self.descriptor.neg_risk).await {
            Ok(result) if result.success => {
                if let Err(e) = self.positions.mark_split_complete(
                    &self.descriptor.market_slug,
                    self.split_amount,
                    self.split_amount,
                    self.split_amount,
                ) {
                    warn!(market_slug = %self.descriptor.market_slug, error = %e, "split succeeded but position update failed");
                }

                // A split mints `split_amount` shares of each outcome for a
                // combined $1-per-pair nominal cost, i.e. `0.5` per leg —
                // the same assumption `split_for_hedged` seeds its cycle
                // tracker with.
                let split_leg_price = Decimal::new(5, 1);
                let outcome1_pos = Position::open(
                    self.descriptor.market_slug.clone(),
                    self.descriptor.condition_id.clone(),
                    self.descriptor.up_token_id.clone(),
                    split_leg_price,
                    self.split_amount,
                    self.descriptor.end_time,
                );
                let outcome2_pos = Position::open(
                    self.descriptor.market_slug.clone(),
                    self.descriptor.condition_id.clone(),
                    self.descriptor.down_token_id.clone(),
                    split_leg_price,
                    self.split_amount,
                    self.descriptor.end_time,
                );
                if let Err(e) = self.store.insert_position(&outcome1_pos).await {
                    warn!(market_slug = %self.descriptor.market_slug, error = %e, "failed to persist outcome1 position");
                }
                if let Err(e) = self.store.insert_position(&outcome2_pos).await {
                    warn!(market_slug = %self.descriptor.market_slug, error = %e, "failed to persist outcome2 position");
                }
                self.outcome1_position_id = Some(outcome1_pos.id);
                self.outcome2_position_id = Some(outcome2_pos.id);

                self.log(LogSeverity::Info, format!("{}: split complete, holding both outcomes", self.descriptor.market_slug));
            }
            Ok(result) => {
                warn!(market_slug = %self.descriptor.market_slug, error = ?result.error, "split transaction failed");
            }
            Err(e) => {
                warn!(market_slug = %self.descriptor.market_slug, error = %e, "split request failed");
            }
        }
    }

    async fn handle_price_event(&mut self, event: PriceEvent) {
        match event {
            PriceEvent::Price(update) => {
                if let Some(ask) = update.best_ask {
                    let store = self.store.clone();
                    let token_id = self.descriptor.token_id(update.side).to_string();
                    tokio::spawn(async move {
                        if let Err(e) = store.insert_price_tick(&token_id, ask).await {
                            warn!(error = %e, "failed to log price tick");
                        }
                    });
                }
                if matches!(self.state, StrategyState::Hedged(_)) {
                    self.maybe_accumulate(update.side, update.best_ask).await;
                }
            }
            PriceEvent::Sell(trigger) => self.handle_sell_trigger(trigger.losing_side, trigger.losing_bid).await,
            PriceEvent::StopLoss(trigger) => self.handle_stop_loss(trigger.up_bid, trigger.down_bid).await,
            PriceEvent::GameEnded(ended) => self.handle_game_ended(ended.winner, ended.winner_price).await,
            PriceEvent::WinnerDrop(log) => {
                info!(market_slug = %self.descriptor.market_slug, side = ?log.side, drop_pct = %log.drop_pct, "winner price drop logged");
            }
        }
    }

    /// spec.md §4.8 "Accumulation": buys `venue_min_shares(ask)` of `side`
    /// whenever the cycle's price ceiling still allows it, then evaluates
    /// whether the resulting imbalance needs a lock order.
    async fn maybe_accumulate(&mut self, side: OutcomeSide, best_ask: Option<Decimal>) {
        let Some(ask) = best_ask else { return };
        if ask <= Decimal::ZERO {
            return;
        }
        let can_accumulate = match &self.state {
            StrategyState::Hedged(tracker) => tracker.can_accumulate(ask),
            StrategyState::Sports => return,
        };
        if !can_accumulate {
            return;
        }

        let shares = hedge_cycle::venue_min_shares(ask);
        let token_id = self.descriptor.token_id(side).to_string();
        let params = match self.build_buy_params(&token_id, OrderSide::Buy, ask, shares).await {
            Ok(params) => params,
            Err(e) => {
                warn!(market_slug = %self.descriptor.market_slug, error = %e, "failed to sign accumulation order");
                return;
            }
        };
        self.spawn_buy(BuyIntent::Accumulation(side), params);
    }

    /// Dispatches a [`Command::BuyCompleted`] delivery to the handler for
    /// whichever state transition the original `spawn_buy` call was for.
    async fn handle_buy_completed(&mut self, intent: BuyIntent, result: PreciseBuyResult) {
        match intent {
            BuyIntent::Accumulation(side) => {
                if result.success {
                    self.fold_accumulation(side, result.filled_price, result.filled_shares).await;
                }
            }
            BuyIntent::Sell(losing_side) => self.fold_sell_result(losing_side, result).await,
        }
    }

    /// Folds a filled accumulation buy into the cycle tracker and, if the
    /// resulting imbalance needs hedging, places the lock order (spec.md
    /// §4.8 "Lock order lifecycle").
    async fn fold_accumulation(&mut self, side: OutcomeSide, price: Decimal, shares: Decimal) {
        let lock_params = {
            let StrategyState::Hedged(tracker) = &mut self.state else { return };
            tracker.record_accumulation(side, price, shares);
            publish_global(DashboardEvent::PositionUpdate {
                market_slug: self.descriptor.market_slug.clone(),
                state: format!("accumulated {side:?} {shares}@{price}"),
            });
            if tracker.needs_lock() { tracker.get_lock_params() } else { None }
        };
        if let Some(id) = self.arbitrage_position_id {
            let side_str = if side == OutcomeSide::Up { "up" } else { "down" };
            if let Err(e) = self.store.insert_arbitrage_trade(id, side_str, price, shares).await {
                warn!(market_slug = %self.descriptor.market_slug, error = %e, "failed to log arbitrage trade");
            }
        }
        let Some(lock_params) = lock_params else { return };

        let token_id = self.descriptor.token_id(lock_params.side).to_string();
        let params = match self.build_buy_params(&token_id, OrderSide::Buy, lock_params.price, lock_params.size).await {
            Ok(params) => params,
            Err(e) => {
                warn!(market_slug = %self.descriptor.market_slug, error = %e, "failed to sign lock order");
                return;
            }
        };
        match self.executor.place_lock_order(params).await {
            Ok(lock_result) => {
                if let StrategyState::Hedged(tracker) = &mut self.state {
                    tracker.set_lock_target(lock_params.side, lock_params.size, lock_params.price);
                }
                publish_global(DashboardEvent::OrderPlaced { market_slug: self.descriptor.market_slug.clone(), order_id: lock_result.order_id.clone() });
                if lock_result.immediately_filled > Decimal::ZERO {
                    let fill_price = lock_result.fill_price.unwrap_or(lock_params.price);
                    self.fold_lock_fill(lock_params.side, fill_price, lock_result.immediately_filled).await;
                }
            }
            Err(e) => {
                warn!(market_slug = %self.descriptor.market_slug, error = %e, "lock order placement failed");
                if let StrategyState::Hedged(tracker) = &mut self.state {
                    tracker.clear_lock_target();
                }
            }
        }
    }

    /// Folds a (possibly partial) lock-order fill, whether observed
    /// synchronously from `place_lock_order`'s response or later via
    /// [`Command::OrderFilled`].
    async fn fold_lock_fill(&mut self, side: OutcomeSide, price: Decimal, shares: Decimal) {
        let (pair_cost, hedged_qty, just_locked, just_profit_locked) = {
            let StrategyState::Hedged(tracker) = &mut self.state else { return };
            tracker.record_accumulation(side, price, shares);
            let remaining = tracker.lock_target().map(|t| (t.shares - shares).max(Decimal::ZERO));
            let Some(remaining) = remaining else { return };
            tracker.update_lock_target(remaining);
            // Only finalize the lock once the resting order's target size has
            // been fully matched; a partial fill leaves `awaiting_lock` set so
            // the narrowed remainder can still be retried (spec.md §4.8).
            if remaining <= Decimal::ZERO {
                tracker.handle_lock_complete();
            }
            (tracker.get_pair_cost(), tracker.up_qty().min(tracker.down_qty()), tracker.is_locked(), tracker.is_profit_locked())
        };

        if let Some(id) = self.arbitrage_position_id {
            let side_str = if side == OutcomeSide::Up { "up" } else { "down" };
            if let Err(e) = self.store.insert_arbitrage_trade(id, side_str, price, shares).await {
                warn!(market_slug = %self.descriptor.market_slug, error = %e, "failed to log arbitrage trade");
            }
        }

        if just_locked {
            info!(market_slug = %self.descriptor.market_slug, %pair_cost, "cycle locked");
            publish_global(DashboardEvent::PositionUpdate {
                market_slug: self.descriptor.market_slug.clone(),
                state: format!("locked at pair_cost={pair_cost}"),
            });
        }

        // spec.md §3 "Arbitrage Position": `profit_locked` is the invariant
        // `min(up, down) > up_cost + down_cost` — strictly stronger than
        // merely balanced, so it's checked independently of `is_locked()`.
        if just_profit_locked {
            if let Some(id) = self.arbitrage_position_id {
                let guaranteed_profit = hedged_qty - pair_cost * hedged_qty;
                if let Err(e) = self.store.mark_arbitrage_profit_locked(id, pair_cost, hedged_qty, guaranteed_profit).await {
                    warn!(market_slug = %self.descriptor.market_slug, error = %e, "failed to persist profit-locked arbitrage position");
                }
                publish_global(DashboardEvent::PositionUpdate {
                    market_slug: self.descriptor.market_slug.clone(),
                    state: format!("profit locked, guaranteed_profit={guaranteed_profit}"),
                });
            }
        }
    }

    /// spec.md §4.6/§4.11 "Sell trigger": liquidates the losing side at the
    /// market. For sports markets this is a direct IOC sell; hedged
    /// markets don't carry unsold single-side inventory by design (every
    /// accumulated leg is already balanced or awaiting a lock), so the
    /// trigger is informational there.
    async fn handle_sell_trigger(&mut self, losing_side: OutcomeSide, losing_bid: Decimal) {
        if matches!(self.state, StrategyState::Hedged(_)) {
            return;
        }
        let Some(position) = self.positions.get(&self.descriptor.market_slug) else { return };
        let slot = match losing_side {
            OutcomeSide::Up => &position.outcome1,
            OutcomeSide::Down => &position.outcome2,
        };
        if slot.sold || slot.shares <= Decimal::ZERO {
            return;
        }

        let token_id = self.descriptor.token_id(losing_side).to_string();
        let params = match self.build_buy_params(&token_id, OrderSide::Sell, losing_bid, slot.shares).await {
            Ok(params) => params,
            Err(e) => {
                warn!(market_slug = %self.descriptor.market_slug, error = %e, "failed to sign sell order");
                return;
            }
        };
        self.spawn_buy(BuyIntent::Sell(losing_side), params);
    }

    /// Folds a [`Command::BuyCompleted`] delivery for a losing-side IOC
    /// sell: updates the Position Manager's in-memory state and the
    /// Store's durable `positions`/`trade_log` rows (spec.md §4.2, §4.11).
    async fn fold_sell_result(&mut self, losing_side: OutcomeSide, result: PreciseBuyResult) {
        if !result.success {
            warn!(market_slug = %self.descriptor.market_slug, ?losing_side, "sell trigger fired but order did not fill");
            return;
        }
        let outcome = match losing_side {
            OutcomeSide::Up => Outcome::One,
            OutcomeSide::Down => Outcome::Two,
        };
        if let Err(e) = self.positions.record_sale(&self.descriptor.market_slug, outcome, result.filled_price, result.filled_shares) {
            warn!(market_slug = %self.descriptor.market_slug, error = %e, "sale fill but position update failed");
        }

        let position_id = match losing_side {
            OutcomeSide::Up => self.outcome1_position_id,
            OutcomeSide::Down => self.outcome2_position_id,
        };
        if let Some(id) = position_id {
            let entry_price = Decimal::new(5, 1);
            let pnl = (result.filled_price - entry_price) * result.filled_shares;
            if let Err(e) = self.store.update_position_exit(id, result.filled_price, Utc::now(), "sell_trigger", pnl).await {
                warn!(market_slug = %self.descriptor.market_slug, error = %e, "failed to persist sell exit");
            }
        }
        let side_str = if losing_side == OutcomeSide::Up { "up" } else { "down" };
        if let Err(e) = self.store.insert_trade_log(&self.descriptor.market_slug, result.order_id.as_deref(), side_str, result.filled_price, result.filled_shares).await {
            warn!(market_slug = %self.descriptor.market_slug, error = %e, "failed to log sell trade");
        }

        self.log(LogSeverity::Info, format!("{}: sold {losing_side:?} at {}", self.descriptor.market_slug, result.filled_price));
    }

    /// spec.md §4.6 "Stop-loss trigger": both sides dropped below the
    /// configured floor; treated as an emergency exit (`fully_sold`)
    /// rather than waiting for game end.
    async fn handle_stop_loss(&mut self, up_bid: Decimal, down_bid: Decimal) {
        if matches!(self.state, StrategyState::Hedged(_)) {
            return;
        }
        warn!(market_slug = %self.descriptor.market_slug, %up_bid, %down_bid, "stop-loss: liquidating both sides");
        self.handle_sell_trigger(OutcomeSide::Up, up_bid).await;
        self.handle_sell_trigger(OutcomeSide::Down, down_bid).await;
        if let Err(e) = self.positions.mark_fully_sold(&self.descriptor.market_slug) {
            warn!(market_slug = %self.descriptor.market_slug, error = %e, "stop-loss exit but position transition failed");
        }
    }

    /// spec.md §4.9 state diagram's `game_end` transition: merges and
    /// redeems whatever inventory remains, then settles the position.
    async fn handle_game_ended(&mut self, winner: OutcomeSide, _winner_price: Decimal) {
        if matches!(self.state, StrategyState::Hedged(_)) {
            self.settle_hedged_cycle(winner).await;
            return;
        }

        let Some(position) = self.positions.get(&self.descriptor.market_slug) else { return };
        let both_unsold = !position.outcome1.sold && !position.outcome2.sold;

        // Both legs still held: merging the matched pair back to collateral
        // recovers exactly the original split cost, which is strictly
        // better than redeeming (that would pay out the winning leg alone
        // and leave the losing leg worthless) when the sell trigger never
        // fired before the game ended.
        if both_unsold {
            match self.collateral.merge(&self.descriptor.condition_id, self.split_amount, self.descriptor.neg_risk).await {
                Ok(result) if result.success => {
                    if let Err(e) = self.positions.settle(&self.descriptor.market_slug, self.split_amount) {
                        warn!(market_slug = %self.descriptor.market_slug, error = %e, "merge succeeded but settlement update failed");
                    } else {
                        publish_global(DashboardEvent::PositionUpdate { market_slug: self.descriptor.market_slug.clone(), state: "settled via merge".to_string() });
                        self.mark_sports_positions_settled().await;
                    }
                }
                Ok(result) => warn!(market_slug = %self.descriptor.market_slug, error = ?result.error, "merge transaction failed"),
                Err(e) => warn!(market_slug = %self.descriptor.market_slug, error = %e, "merge request failed"),
            }
            return;
        }

        if let Err(e) = self.positions.mark_pending_settlement(&self.descriptor.market_slug) {
            warn!(market_slug = %self.descriptor.market_slug, error = %e, "position transition to pending_settlement failed");
        }

        let winning_slot = match winner { OutcomeSide::Up => &position.outcome1, OutcomeSide::Down => &position.outcome2 };
        let unsold_winning_shares = if winning_slot.sold { Decimal::ZERO } else { winning_slot.shares };
        let outcome_index = match winner { OutcomeSide::Up => 0, OutcomeSide::Down => 1 };
        match self.collateral.redeem(&self.descriptor.condition_id, outcome_index, self.descriptor.neg_risk, None).await {
            Ok(result) if result.success => {
                if let Err(e) = self.positions.settle(&self.descriptor.market_slug, unsold_winning_shares) {
                    warn!(market_slug = %self.descriptor.market_slug, error = %e, "redeem succeeded but settlement update failed");
                } else {
                    publish_global(DashboardEvent::PositionUpdate { market_slug: self.descriptor.market_slug.clone(), state: "settled via redeem".to_string() });
                    self.mark_sports_positions_settled().await;
                }
            }
            Ok(result) => warn!(market_slug = %self.descriptor.market_slug, error = ?result.error, rate_limited = result.rate_limited, "redeem failed"),
            Err(e) => warn!(market_slug = %self.descriptor.market_slug, error = %e, "redeem request failed"),
        }
    }

    /// Marks both outcome legs' Store rows redeemed/pnl-synced once
    /// `PositionManager::settle` has fixed `realized_pnl` in memory
    /// (spec.md §6 `markPositionRedeemed`, idempotent).
    async fn mark_sports_positions_settled(&self) {
        for id in [self.outcome1_position_id, self.outcome2_position_id].into_iter().flatten() {
            if let Err(e) = self.store.mark_position_redeemed(id).await {
                warn!(market_slug = %self.descriptor.market_slug, error = %e, "failed to mark position redeemed");
            }
            if let Err(e) = self.store.mark_position_pnl_synced(id).await {
                warn!(market_slug = %self.descriptor.market_slug, error = %e, "failed to mark position pnl synced");
            }
        }
    }

    /// spec.md §4.9's `game_end` transition, generalized to the hedged
    /// cycle: merges the matched pair back to collateral, redeems any
    /// leftover on the winning side, then starts a fresh cycle so the next
    /// 15-minute window's accumulation begins from zero (spec.md §4.8
    /// "Cycle Tracker"'s repeated-cycle design, `CycleTracker::start_new_cycle`).
    async fn settle_hedged_cycle(&mut self, winner: OutcomeSide) {
        let (matched, up_leftover, down_leftover) = {
            let StrategyState::Hedged(tracker) = &self.state else { return };
            let matched = tracker.up_qty().min(tracker.down_qty());
            (matched, (tracker.up_qty() - matched).max(Decimal::ZERO), (tracker.down_qty() - matched).max(Decimal::ZERO))
        };

        if matched > Decimal::ZERO {
            match self.collateral.merge(&self.descriptor.condition_id, matched, self.descriptor.neg_risk).await {
                Ok(result) if result.success => {
                    publish_global(DashboardEvent::PositionUpdate { market_slug: self.descriptor.market_slug.clone(), state: format!("merged matched pair, qty={matched}") });
                }
                Ok(result) => warn!(market_slug = %self.descriptor.market_slug, error = ?result.error, "hedged cycle merge failed"),
                Err(e) => warn!(market_slug = %self.descriptor.market_slug, error = %e, "hedged cycle merge request failed"),
            }
        }

        let leftover = match winner { OutcomeSide::Up => up_leftover, OutcomeSide::Down => down_leftover };
        if leftover > Decimal::ZERO {
            let outcome_index = match winner { OutcomeSide::Up => 0, OutcomeSide::Down => 1 };
            let shares = self.descriptor.neg_risk.then(|| match winner {
                OutcomeSide::Up => NegRiskRedeemShares { yes_shares: leftover, no_shares: Decimal::ZERO },
                OutcomeSide::Down => NegRiskRedeemShares { yes_shares: Decimal::ZERO, no_shares: leftover },
            });
            match self.collateral.redeem(&self.descriptor.condition_id, outcome_index, self.descriptor.neg_risk, shares).await {
                Ok(result) if result.success => {
                    publish_global(DashboardEvent::PositionUpdate { market_slug: self.descriptor.market_slug.clone(), state: format!("redeemed leftover winning leg, qty={leftover}") });
                }
                Ok(result) => warn!(market_slug = %self.descriptor.market_slug, error = ?result.error, rate_limited = result.rate_limited, "hedged cycle redeem failed"),
                Err(e) => warn!(market_slug = %self.descriptor.market_slug, error = %e, "hedged cycle redeem request failed"),
            }
        }

        if let StrategyState::Hedged(tracker) = &mut self.state {
            info!(market_slug = %self.descriptor.market_slug, cycle = tracker.cycle_number(), "hedged cycle settled, starting new cycle");
            tracker.start_new_cycle();
        }
    }

    /// Folds a resting lock order's async fill notification (spec.md §9
    /// "executor holds an on-fill function set at construction time").
    async fn handle_order_filled(&mut self, order_id: &str, shares: Decimal, price: Decimal, side: OrderSide) {
        let outcome_side = match side {
            OrderSide::Buy => {
                let StrategyState::Hedged(tracker) = &self.state else { return };
                tracker.lock_target().map(|t| t.side)
            }
            OrderSide::Sell => None,
        };
        let Some(outcome_side) = outcome_side else {
            info!(order_id, %shares, %price, "order fill observed with no matching lock target, ignoring");
            return;
        };
        self.fold_lock_fill(outcome_side, price, shares).await;
    }

    /// spec.md §4.11 "User-channel reconnect": reconciles this market's
    /// open orders against the venue snapshot to catch fills that
    /// happened during the gap.
    async fn handle_user_event(&mut self, event: UserChannelEvent) {
        match event {
            UserChannelEvent::Fill(fill) => {
                let side_str = match fill.side { OrderSide::Buy => "buy", OrderSide::Sell => "sell" };
                if let Err(e) = self.store.insert_user_fill(&fill.order_id, &fill.asset_id, fill.price, fill.size, side_str).await {
                    warn!(market_slug = %self.descriptor.market_slug, error = %e, "failed to log user-channel fill");
                }
                self.executor.notify_fill(hedge_executor::RealizedFill { order_id: fill.order_id.clone(), filled_shares: fill.size, filled_price: fill.price });
            }
            UserChannelEvent::Update(_) => {}
            UserChannelEvent::Connected => {}
            UserChannelEvent::Reconnected => self.reconcile_open_orders().await,
            UserChannelEvent::Disconnected { reason } => {
                warn!(market_slug = %self.descriptor.market_slug, reason, "user channel disconnected");
            }
        }
    }

    async fn reconcile_open_orders(&mut self) {
        match self.clob.get_open_orders(&self.descriptor.condition_id).await {
            Ok(orders) => {
                for order in orders {
                    let matched: Decimal = order.size_matched.parse().unwrap_or(Decimal::ZERO);
                    if matched > Decimal::ZERO {
                        info!(market_slug = %self.descriptor.market_slug, order_id = %order.id, %matched, "reconciled resting order with partial match after reconnect");
                    }
                }
            }
            Err(e) => warn!(market_slug = %self.descriptor.market_slug, error = %e, "open-order reconciliation failed"),
        }
    }

    async fn build_buy_params(&self, token_id: &str, side: OrderSide, price: Decimal, size: Decimal) -> Result<PreciseBuyParams, crate::signer::SignerError> {
        let nonce = self.next_nonce();
        let signed = self.signer.sign_order(&BuildOrderParams {
            token_id: token_id.to_string(),
            side,
            price,
            size,
            nonce,
            fee_rate_bps: FEE_RATE_BPS,
            neg_risk: self.descriptor.neg_risk,
        })?;
        Ok(PreciseBuyParams { token_id: token_id.to_string(), side, shares: size, max_price: price, signature: signed.signature, salt: signed.salt })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_reports_strategy_kind() {
        // `MarketLoopStatus` is a plain struct; this only exercises field
        // wiring since constructing a full `MarketLoop` needs live network
        // dependencies covered instead by the integration-style tests in
        // `hedge-executor`/`hedge-cycle`.
        let status = MarketLoopStatus { market_slug: "btc-updown".to_string(), is_hedged: true, is_locked_or_settled: false };
        assert!(status.is_hedged);
        assert!(!status.is_locked_or_settled);
    }
}
