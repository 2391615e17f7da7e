//! Market descriptor (spec.md §3 "Market").

use serde::{Deserialize, Serialize};

/// Identifies the two outcome sides of a binary market.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OutcomeSide {
    /// The "UP"/"YES" outcome.
    Up,
    /// The "DOWN"/"NO" outcome.
    Down,
}

impl OutcomeSide {
    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Up => Self::Down,
            Self::Down => Self::Up,
        }
    }
}

/// The sport/category a market is in; used to select sell thresholds from
/// config (spec.md §4.6).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MarketCategory(pub String);

impl MarketCategory {
    #[must_use]
    pub fn crypto_15min() -> Self {
        Self("crypto-15min".to_string())
    }
}

/// A best bid/ask pair for one outcome side.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct BidAsk {
    pub best_bid: Option<rust_decimal::Decimal>,
    pub best_ask: Option<rust_decimal::Decimal>,
}

/// Market metadata as discovered by the (out-of-scope) discovery poller and
/// handed to the strategy loop (spec.md §3 "Market").
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDescriptor {
    /// Human-readable slug, e.g. `"btc-updown-0800et"`.
    pub market_slug: String,
    /// Exchange-level condition identifier.
    pub condition_id: String,
    /// Token id for the UP/YES outcome.
    pub up_token_id: String,
    /// Token id for the DOWN/NO outcome.
    pub down_token_id: String,
    pub question: String,
    pub up_label: String,
    pub down_label: String,
    #[serde(default)]
    pub up_book: BidAsk,
    #[serde(default)]
    pub down_book: BidAsk,
    pub end_time: chrono::DateTime<chrono::Utc>,
    pub category: MarketCategory,
    /// Selects the NegRisk vs. standard CTF collateral-operation family
    /// (spec.md §3, §4.10).
    pub neg_risk: bool,
}

impl MarketDescriptor {
    #[must_use]
    pub fn token_id(&self, side: OutcomeSide) -> &str {
        match side {
            OutcomeSide::Up => &self.up_token_id,
            OutcomeSide::Down => &self.down_token_id,
        }
    }

    #[must_use]
    pub fn label(&self, side: OutcomeSide) -> &str {
        match side {
            OutcomeSide::Up => &self.up_label,
            OutcomeSide::Down => &self.down_label,
        }
    }
}
