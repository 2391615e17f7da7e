//! Event records emitted between components (spec.md §9 "Event emission":
//! typed channels / subscriber lists, each event a plain record copied to
//! each subscriber, never a shared mutable object).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::market::OutcomeSide;

/// Order side as understood by the executor and the venue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

/// Order time-in-force modes (spec.md GLOSSARY).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    Gtc,
    Fak,
    Fok,
    Ioc,
}

/// §4.3 Market-Data WS output: full per-side book levels.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BookUpdate {
    pub token_id: String,
    /// Ascending price order; best bid is the last element.
    pub bids: Vec<(Decimal, Decimal)>,
    /// Descending price order; best ask is the last element.
    pub asks: Vec<(Decimal, Decimal)>,
    pub ts: DateTime<Utc>,
}

/// Inferred taker side of a trade tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InferredSide {
    Buy,
    Sell,
}

/// §4.3 Market-Data WS output: a single trade print.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeTick {
    pub token_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub inferred_side: InferredSide,
    pub best_bid_after: Option<Decimal>,
    pub best_ask_after: Option<Decimal>,
    pub ts: DateTime<Utc>,
}

/// §4.4 User-Channel WS: lifecycle status of an order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderLifecycle {
    Placement,
    Update,
    Cancellation,
}

/// §4.4 User-Channel WS output: one per filled maker (or taker) order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderFill {
    pub order_id: String,
    pub price: Decimal,
    pub size: Decimal,
    pub status: String,
    pub market: String,
    pub asset_id: String,
    pub side: OrderSide,
    pub ts: DateTime<Utc>,
}

/// §4.4 User-Channel WS output: order lifecycle transition.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderUpdate {
    pub order_id: String,
    pub kind: OrderLifecycle,
    pub size_matched: Decimal,
    pub original_size: Decimal,
    pub price: Decimal,
    pub market: String,
    pub asset_id: String,
    pub side: OrderSide,
}

/// §4.5 Balance Monitor: any change in the on-chain settlement-token balance.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub enum BalanceDirection {
    In,
    Out,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BalanceChange {
    pub prev: Decimal,
    pub new: Decimal,
    pub delta: Decimal,
    pub direction: BalanceDirection,
}

/// §4.5: emitted only when `delta > 0`; the signal the Position Manager uses
/// to detect unexpected incoming funds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BalanceIncrease {
    pub prev: Decimal,
    pub new: Decimal,
    pub delta: Decimal,
}

/// §4.6 Price Monitor outputs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceUpdate {
    pub market_slug: String,
    pub side: OutcomeSide,
    pub best_bid: Option<Decimal>,
    pub best_ask: Option<Decimal>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SellTrigger {
    pub market_slug: String,
    pub losing_side: OutcomeSide,
    pub losing_bid: Decimal,
    pub winning_side: OutcomeSide,
    pub winning_bid: Option<Decimal>,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameEnded {
    pub market_slug: String,
    pub winner: OutcomeSide,
    pub loser: OutcomeSide,
    pub winner_price: Decimal,
    pub loser_price: Decimal,
    pub ts: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StopLossTrigger {
    pub market_slug: String,
    pub up_bid: Decimal,
    pub down_bid: Decimal,
    pub ts: DateTime<Utc>,
}

/// §4.6 "Winner-drop log" — informational only, never actioned (§9 design
/// note "Stop-loss semantics").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WinnerPriceLog {
    pub market_slug: String,
    pub side: OutcomeSide,
    pub entry_price: Decimal,
    pub current_price: Decimal,
    pub drop_pct: Decimal,
    pub crossed_threshold: Option<Decimal>,
    pub ts: DateTime<Utc>,
}

/// Dashboard relay event kinds (spec.md §1, §7): a fire-and-forget sink the
/// web dashboard consumes. Mirrored 1:1 from the spec's named event kinds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DashboardEvent {
    OrderPlaced {
        market_slug: String,
        order_id: String,
    },
    OrderFilled {
        market_slug: String,
        order_id: String,
        filled_shares: Decimal,
        filled_price: Decimal,
    },
    OrderCancelled {
        market_slug: String,
        order_id: String,
    },
    PositionUpdate {
        market_slug: String,
        state: String,
    },
    MarketSwitch {
        market_slug: String,
    },
    PriceUpdate {
        market_slug: String,
        side: OutcomeSide,
        price: Decimal,
    },
    LogMessage {
        severity: LogSeverity,
        message: String,
    },
}

/// §7 "structured logs with severity".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogSeverity {
    Info,
    Warn,
    Error,
}
