//! Price Monitor (spec.md §4.6). Caches per-market, per-side best bid/ask,
//! consumes `BookUpdate`/`Trade` from the Market-Data WS, and derives
//! `PriceUpdate`, `SellTrigger`, `GameEnded`, `StopLossTrigger`, and
//! `WinnerPriceLog` events. Grounded on the teacher's
//! `arbitrage::{types, orderbook, detector}` trio, generalized from
//! cross-market arbitrage detection to the single-market trigger-latch
//! design spec.md §4.6 describes.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use hedge_core::events::{GameEnded, PriceUpdate, SellTrigger, StopLossTrigger, WinnerPriceLog};
use hedge_core::market::{BidAsk, OutcomeSide};
use hedge_exchange::clob_client::{ClobClient, ClobClientError};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use tokio::sync::mpsc;
use tracing::{info, warn};

const STALE_PRICE_AFTER: Duration = Duration::from_secs(60);

fn game_end_threshold() -> Decimal {
    Decimal::new(99, 2)
}

fn mismatch_threshold() -> Decimal {
    Decimal::new(5, 2)
}

fn winner_drop_pct() -> Decimal {
    Decimal::new(10, 0)
}

#[derive(Debug, Clone)]
pub enum PriceEvent {
    Price(PriceUpdate),
    Sell(SellTrigger),
    GameEnded(GameEnded),
    StopLoss(StopLossTrigger),
    WinnerDrop(WinnerPriceLog),
}

#[derive(Debug, Clone, Default)]
struct MarketPriceState {
    up: BidAsk,
    down: BidAsk,
    sell_trigger_fired: [bool; 2],
    ended: bool,
    stop_loss_fired: bool,
    last_update_ms: Option<i64>,
    /// Set once the losing side has been sold, per spec.md §4.6
    /// "Winner-drop log"; tracks the winner's entry price and which drop
    /// thresholds have already been logged.
    winner_watch: Option<WinnerWatch>,
}

#[derive(Debug, Clone)]
struct WinnerWatch {
    side: OutcomeSide,
    entry_price: Decimal,
    crossed: HashSet<Decimal>,
}

pub struct PriceMonitor {
    states: RwLock<HashMap<String, MarketPriceState>>,
    thresholds: Arc<dyn Fn(&str) -> Decimal + Send + Sync>,
    stop_loss_threshold: Option<Decimal>,
    fresh_probe_counter: std::sync::atomic::AtomicU64,
}

impl PriceMonitor {
    #[must_use]
    pub fn new(thresholds: Arc<dyn Fn(&str) -> Decimal + Send + Sync>, stop_loss_threshold: Option<Decimal>) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            thresholds,
            stop_loss_threshold,
            fresh_probe_counter: std::sync::atomic::AtomicU64::new(0),
        }
    }

    pub fn register_market(&self, market_slug: &str) {
        self.states.write().entry(market_slug.to_string()).or_default();
    }

    /// Applies a book update for one side of `market_slug` and emits every
    /// event spec.md §4.6 derives from the resulting state transition.
    pub async fn on_book_update(
        &self,
        market_slug: &str,
        side: OutcomeSide,
        best_bid: Option<Decimal>,
        best_ask: Option<Decimal>,
        clob: Option<&ClobClient>,
        token_id_for_side: Option<&str>,
        tx: &mpsc::Sender<PriceEvent>,
    ) {
        let now_ms = Utc::now().timestamp_millis();
        let previously_ended = {
            let mut guard = self.states.write();
            let state = guard.entry(market_slug.to_string()).or_default();
            match side {
                OutcomeSide::Up => state.up = BidAsk { best_bid, best_ask },
                OutcomeSide::Down => state.down = BidAsk { best_bid, best_ask },
            }
            state.last_update_ms = Some(now_ms);
            state.ended
        };

        let _ = tx
            .send(PriceEvent::Price(PriceUpdate { market_slug: market_slug.to_string(), side, best_bid, best_ask, ts: Utc::now() }))
            .await;

        self.check_sell_trigger(market_slug, side, best_bid, tx).await;
        self.check_stop_loss(market_slug, tx).await;

        if !previously_ended {
            if let Some(bid) = best_bid {
                if bid >= game_end_threshold() {
                    self.check_game_end(market_slug, side, clob, token_id_for_side, tx).await;
                }
            }
        }

        self.check_winner_drop(market_slug, side, best_bid, tx).await;
    }

    async fn check_sell_trigger(&self, market_slug: &str, side: OutcomeSide, best_bid: Option<Decimal>, tx: &mpsc::Sender<PriceEvent>) {
        let Some(bid) = best_bid else { return };
        if bid <= Decimal::ZERO {
            return;
        }
        let threshold = (self.thresholds)(market_slug);
        if bid >= threshold {
            return;
        }

        let should_fire = {
            let mut guard = self.states.write();
            let state = guard.entry(market_slug.to_string()).or_default();
            let idx = side_index(side);
            if state.sell_trigger_fired[idx] {
                false
            } else {
                state.sell_trigger_fired[idx] = true;
                true
            }
        };
        if !should_fire {
            return;
        }

        let winning_bid = {
            let guard = self.states.read();
            guard.get(market_slug).and_then(|s| match side.opposite() {
                OutcomeSide::Up => s.up.best_bid,
                OutcomeSide::Down => s.down.best_bid,
            })
        };

        let event = SellTrigger {
            market_slug: market_slug.to_string(),
            losing_side: side,
            losing_bid: bid,
            winning_side: side.opposite(),
            winning_bid,
            ts: Utc::now(),
        };
        info!(market_slug, ?side, bid = %bid, "sell trigger fired");
        let _ = tx.send(PriceEvent::Sell(event)).await;
    }

    async fn check_stop_loss(&self, market_slug: &str, tx: &mpsc::Sender<PriceEvent>) {
        let Some(threshold) = self.stop_loss_threshold else { return };
        let should_fire = {
            let mut guard = self.states.write();
            let state = guard.entry(market_slug.to_string()).or_default();
            if state.stop_loss_fired {
                return;
            }
            let both_below = matches!((state.up.best_bid, state.down.best_bid), (Some(u), Some(d)) if u < threshold && d < threshold);
            if both_below {
                state.stop_loss_fired = true;
            }
            both_below.then(|| (state.up.best_bid.unwrap(), state.down.best_bid.unwrap()))
        };
        if let Some((up_bid, down_bid)) = should_fire {
            warn!(market_slug, %up_bid, %down_bid, "stop-loss trigger fired");
            let _ = tx
                .send(PriceEvent::StopLoss(StopLossTrigger { market_slug: market_slug.to_string(), up_bid, down_bid, ts: Utc::now() }))
                .await;
        }
    }

    async fn check_game_end(
        &self,
        market_slug: &str,
        side: OutcomeSide,
        clob: Option<&ClobClient>,
        token_id: Option<&str>,
        tx: &mpsc::Sender<PriceEvent>,
    ) {
        let Some(clob) = clob else { return };
        let Some(token_id) = token_id else { return };

        let fresh_bid = match clob.fetch_order_book(token_id).await {
            Ok(book) => book.bids.first().and_then(|b| b.price.parse::<Decimal>().ok()),
            Err(e) => {
                warn!(market_slug, error = %e, "fresh game-end probe failed");
                None
            }
        };
        let Some(fresh_bid) = fresh_bid else { return };
        if fresh_bid < game_end_threshold() {
            warn!(market_slug, %fresh_bid, "fresh probe disagrees with stale game-end bid, suppressing GameEnded");
            return;
        }

        let already_ended = {
            let mut guard = self.states.write();
            let state = guard.entry(market_slug.to_string()).or_default();
            if state.ended {
                true
            } else {
                state.ended = true;
                false
            }
        };
        if already_ended {
            return;
        }

        let loser_bid = {
            let guard = self.states.read();
            guard.get(market_slug).and_then(|s| match side.opposite() {
                OutcomeSide::Up => s.down.best_bid,
                OutcomeSide::Down => s.up.best_bid,
            })
        }
        .unwrap_or(Decimal::ZERO);

        info!(market_slug, ?side, %fresh_bid, "game end confirmed by fresh probe");
        let _ = tx
            .send(PriceEvent::GameEnded(GameEnded {
                market_slug: market_slug.to_string(),
                winner: side,
                loser: side.opposite(),
                winner_price: fresh_bid,
                loser_price: loser_bid,
                ts: Utc::now(),
            }))
            .await;
    }

    /// Begins winner-drop tracking once the loser side has been sold
    /// (spec.md §4.6 "Winner-drop log").
    pub fn start_winner_watch(&self, market_slug: &str, winner_side: OutcomeSide, entry_price: Decimal) {
        let mut guard = self.states.write();
        let state = guard.entry(market_slug.to_string()).or_default();
        state.winner_watch = Some(WinnerWatch { side: winner_side, entry_price, crossed: HashSet::new() });
    }

    async fn check_winner_drop(&self, market_slug: &str, side: OutcomeSide, best_bid: Option<Decimal>, tx: &mpsc::Sender<PriceEvent>) {
        let Some(bid) = best_bid else { return };
        let thresholds = [Decimal::new(50, 2), Decimal::new(40, 2), Decimal::new(30, 2)];

        let to_emit = {
            let mut guard = self.states.write();
            let Some(state) = guard.get_mut(market_slug) else { return };
            let Some(watch) = state.winner_watch.as_mut() else { return };
            if watch.side != side {
                return;
            }
            let drop_pct = if watch.entry_price > Decimal::ZERO {
                (watch.entry_price - bid) / watch.entry_price * Decimal::ONE_HUNDRED
            } else {
                Decimal::ZERO
            };
            let crossed_now = thresholds.into_iter().find(|t| bid < *t && !watch.crossed.contains(t));
            if let Some(t) = crossed_now {
                watch.crossed.insert(t);
            }
            let significant_drop = drop_pct > winner_drop_pct();
            if crossed_now.is_none() && !significant_drop {
                None
            } else {
                Some((watch.entry_price, drop_pct, crossed_now))
            }
        };

        if let Some((entry_price, drop_pct, crossed_threshold)) = to_emit {
            let _ = tx
                .send(PriceEvent::WinnerDrop(WinnerPriceLog {
                    market_slug: market_slug.to_string(),
                    side,
                    entry_price,
                    current_price: bid,
                    drop_pct,
                    crossed_threshold,
                    ts: Utc::now(),
                }))
                .await;
        }
    }

    /// `fetch_fresh_price` (spec.md §4.6 "Fresh-price probe (general)"):
    /// internally rate-limited to 10 calls/s by the caller-shared
    /// `RateLimitedGateway` category inside `ClobClient`; this method adds
    /// the cache-mismatch comparison and counter spec.md requires on top.
    pub async fn fetch_fresh_price(
        &self,
        clob: &ClobClient,
        market_slug: &str,
        side: OutcomeSide,
        token_id: &str,
        overwrite_cache: bool,
    ) -> Result<Option<Decimal>, ClobClientError> {
        self.fresh_probe_counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        let book = clob.fetch_order_book(token_id).await?;
        let fresh_bid = book.bids.first().and_then(|b| b.price.parse::<Decimal>().ok());

        if let Some(fresh) = fresh_bid {
            let cached = {
                let guard = self.states.read();
                guard.get(market_slug).and_then(|s| match side {
                    OutcomeSide::Up => s.up.best_bid,
                    OutcomeSide::Down => s.down.best_bid,
                })
            };
            if let Some(cached) = cached {
                if (fresh - cached).abs() >= mismatch_threshold() {
                    warn!(market_slug, ?side, %cached, %fresh, "fresh price mismatch vs cache");
                }
            }
            if overwrite_cache {
                let mut guard = self.states.write();
                let state = guard.entry(market_slug.to_string()).or_default();
                match side {
                    OutcomeSide::Up => state.up.best_bid = Some(fresh),
                    OutcomeSide::Down => state.down.best_bid = Some(fresh),
                }
            }
        }
        Ok(fresh_bid)
    }

    #[must_use]
    pub fn fresh_probe_count(&self) -> u64 {
        self.fresh_probe_counter.load(std::sync::atomic::Ordering::Relaxed)
    }

    #[must_use]
    pub fn is_stale(&self, market_slug: &str) -> bool {
        let guard = self.states.read();
        guard
            .get(market_slug)
            .and_then(|s| s.last_update_ms)
            .map(|ms| {
                let age_ms = Utc::now().timestamp_millis() - ms;
                age_ms > STALE_PRICE_AFTER.as_millis() as i64
            })
            .unwrap_or(true)
    }
}

fn side_index(side: OutcomeSide) -> usize {
    match side {
        OutcomeSide::Up => 0,
        OutcomeSide::Down => 1,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn monitor(default_threshold: Decimal) -> PriceMonitor {
        PriceMonitor::new(Arc::new(move |_| default_threshold), None)
    }

    #[tokio::test]
    async fn sell_trigger_fires_once_per_side() {
        let monitor = monitor(dec!(0.25));
        let (tx, mut rx) = mpsc::channel(16);

        monitor.on_book_update("m1", OutcomeSide::Up, Some(dec!(0.20)), Some(dec!(0.22)), None, None, &tx).await;
        let mut saw_sell = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PriceEvent::Sell(_)) {
                saw_sell = true;
            }
        }
        assert!(saw_sell);

        // Second update below threshold must not refire.
        monitor.on_book_update("m1", OutcomeSide::Up, Some(dec!(0.18)), Some(dec!(0.20)), None, None, &tx).await;
        let mut refired = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PriceEvent::Sell(_)) {
                refired = true;
            }
        }
        assert!(!refired);
    }

    #[tokio::test]
    async fn sell_trigger_does_not_fire_at_or_above_threshold() {
        let monitor = monitor(dec!(0.25));
        let (tx, mut rx) = mpsc::channel(16);
        monitor.on_book_update("m1", OutcomeSide::Up, Some(dec!(0.30)), Some(dec!(0.32)), None, None, &tx).await;
        let mut saw_sell = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PriceEvent::Sell(_)) {
                saw_sell = true;
            }
        }
        assert!(!saw_sell);
    }

    #[tokio::test]
    async fn stop_loss_requires_both_sides_below_threshold() {
        let m = PriceMonitor::new(Arc::new(|_| dec!(0.01)), Some(dec!(0.10)));
        let (tx, mut rx) = mpsc::channel(16);
        m.on_book_update("m1", OutcomeSide::Up, Some(dec!(0.05)), Some(dec!(0.06)), None, None, &tx).await;
        assert!(!rx.try_recv().map(|e| matches!(e, PriceEvent::StopLoss(_))).unwrap_or(false));

        m.on_book_update("m1", OutcomeSide::Down, Some(dec!(0.05)), Some(dec!(0.06)), None, None, &tx).await;
        let mut saw_stop_loss = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PriceEvent::StopLoss(_)) {
                saw_stop_loss = true;
            }
        }
        assert!(saw_stop_loss);
    }

    #[tokio::test]
    async fn winner_drop_logs_on_threshold_crossing() {
        let m = monitor(dec!(0.01));
        let (tx, mut rx) = mpsc::channel(16);
        m.start_winner_watch("m1", OutcomeSide::Up, dec!(0.90));

        m.on_book_update("m1", OutcomeSide::Up, Some(dec!(0.45)), Some(dec!(0.47)), None, None, &tx).await;

        let mut saw_drop = false;
        while let Ok(event) = rx.try_recv() {
            if matches!(event, PriceEvent::WinnerDrop(_)) {
                saw_drop = true;
            }
        }
        assert!(saw_drop);
    }

    #[test]
    fn is_stale_true_for_unregistered_market() {
        let m = monitor(dec!(0.25));
        assert!(m.is_stale("unknown"));
    }
}
