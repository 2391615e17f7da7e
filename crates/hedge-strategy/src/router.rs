//! Router (spec.md §4.11, §9 "Event emission"): demuxes the process-wide
//! `PriceEvent` stream from [`hedge_pricing::PriceMonitor`] and the
//! `UserChannelEvent` stream from the User-Channel WS onto the
//! per-market [`MarketLoopHandle`] mailboxes. Grounded on the teacher's
//! `bot-orchestrator::registry::BotRegistry`, generalized from a
//! bot-id-keyed handle map to a dual key (market slug for price events,
//! condition id for user-channel events) with a connection-event
//! broadcast fan-out the teacher's registry never needed.

use std::collections::HashMap;

use hedge_exchange::user_ws::UserChannelEvent;
use hedge_pricing::PriceEvent;
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::warn;

use crate::market_loop::MarketLoopHandle;

/// Extracts the market slug a [`PriceEvent`] belongs to, for routing.
/// Defined here rather than on `hedge_pricing::PriceEvent` directly since
/// that type lives in another crate (orphan rules require the trait to be
/// local).
pub trait PriceEventMarket {
    fn market_slug(&self) -> &str;
}

impl PriceEventMarket for PriceEvent {
    fn market_slug(&self) -> &str {
        match self {
            PriceEvent::Price(e) => &e.market_slug,
            PriceEvent::Sell(e) => &e.market_slug,
            PriceEvent::GameEnded(e) => &e.market_slug,
            PriceEvent::StopLoss(e) => &e.market_slug,
            PriceEvent::WinnerDrop(e) => &e.market_slug,
        }
    }
}

/// The shared routing table plus the two demux loops (spec.md §5
/// "single logical event queue per market").
#[derive(Default)]
pub struct Router {
    by_market_slug: RwLock<HashMap<String, MarketLoopHandle>>,
    by_condition_id: RwLock<HashMap<String, String>>,
}

impl Router {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a newly-constructed market loop's handle so both demux
    /// loops can find it.
    pub fn register(&self, handle: MarketLoopHandle) {
        let market_slug = handle.market_slug().to_string();
        let condition_id = handle.condition_id().to_string();
        self.by_condition_id.write().insert(condition_id, market_slug.clone());
        self.by_market_slug.write().insert(market_slug, handle);
    }

    pub fn unregister(&self, market_slug: &str) {
        if let Some(handle) = self.by_market_slug.write().remove(market_slug) {
            self.by_condition_id.write().remove(handle.condition_id());
        }
    }

    #[must_use]
    pub fn registered_count(&self) -> usize {
        self.by_market_slug.read().len()
    }

    fn handle_for_market(&self, market_slug: &str) -> Option<MarketLoopHandle> {
        self.by_market_slug.read().get(market_slug).cloned()
    }

    fn handle_for_condition(&self, condition_id: &str) -> Option<MarketLoopHandle> {
        let market_slug = self.by_condition_id.read().get(condition_id).cloned()?;
        self.handle_for_market(&market_slug)
    }

    fn all_handles(&self) -> Vec<MarketLoopHandle> {
        self.by_market_slug.read().values().cloned().collect()
    }

    /// Consumes the Price-Monitor's multiplexed event stream, forwarding
    /// each event to its market's mailbox.
    pub async fn run_price_stream(&self, mut rx: mpsc::Receiver<PriceEvent>) {
        while let Some(event) = rx.recv().await {
            let market_slug = event.market_slug().to_string();
            match self.handle_for_market(&market_slug) {
                Some(handle) => {
                    if handle.send_price(event).await.is_err() {
                        warn!(market_slug, "market loop mailbox closed, dropping price event");
                    }
                }
                None => warn!(market_slug, "price event for unregistered market, dropping"),
            }
        }
    }

    /// Consumes the User-Channel WS's multiplexed event stream.
    /// `Fill`/`Update` route by the wire event's `market` (condition id)
    /// field; `Connected`/`Reconnected`/`Disconnected` are process-wide
    /// signals broadcast to every registered market (spec.md §4.11
    /// "User-channel reconnect").
    pub async fn run_user_stream(&self, mut rx: mpsc::Receiver<UserChannelEvent>) {
        while let Some(event) = rx.recv().await {
            match &event {
                UserChannelEvent::Fill(fill) => {
                    let market = fill.market.clone();
                    self.route_to_condition(&market, event).await
                }
                UserChannelEvent::Update(update) => {
                    let market = update.market.clone();
                    self.route_to_condition(&market, event).await
                }
                UserChannelEvent::Connected | UserChannelEvent::Reconnected | UserChannelEvent::Disconnected { .. } => {
                    self.broadcast(event).await;
                }
            }
        }
    }

    async fn route_to_condition(&self, condition_id: &str, event: UserChannelEvent) {
        match self.handle_for_condition(condition_id) {
            Some(handle) => {
                if handle.send_user(event).await.is_err() {
                    warn!(condition_id, "market loop mailbox closed, dropping user-channel event");
                }
            }
            None => warn!(condition_id, "user-channel event for unregistered market, dropping"),
        }
    }

    async fn broadcast(&self, event: UserChannelEvent) {
        for handle in self.all_handles() {
            let _ = handle.send_user(event.clone()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use hedge_core::events::{OrderSide, PriceUpdate};
    use hedge_core::market::OutcomeSide;
    use rust_decimal_macros::dec;

    #[test]
    fn price_event_market_slug_extracts_every_variant() {
        let update = PriceEvent::Price(PriceUpdate {
            market_slug: "m1".to_string(),
            side: OutcomeSide::Up,
            best_bid: Some(dec!(0.5)),
            best_ask: Some(dec!(0.51)),
            ts: Utc::now(),
        });
        assert_eq!(update.market_slug(), "m1");
    }

    #[tokio::test]
    async fn unregistered_market_price_event_is_dropped_without_panicking() {
        let router = Router::new();
        let (tx, rx) = mpsc::channel(4);
        let update = PriceEvent::Price(PriceUpdate {
            market_slug: "unknown".to_string(),
            side: OutcomeSide::Up,
            best_bid: None,
            best_ask: None,
            ts: Utc::now(),
        });
        tx.send(update).await.unwrap();
        drop(tx);
        router.run_price_stream(rx).await;
        assert_eq!(router.registered_count(), 0);
    }

    #[test]
    fn order_side_is_copy_for_callback_use() {
        // Sanity check for the `OnOrderFilled` callback signature this
        // router's sibling module relies on.
        let side = OrderSide::Buy;
        let copy = side;
        assert_eq!(side, copy);
    }
}
