//! Position data model (spec.md §3).

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// `Position` — binary-market single-side position (spec.md §3).
///
/// Invariant: `exit_time.is_some() ⇒ pnl.is_some()` (enforced by
/// [`Position::close`], the only way to set `exit_time`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub id: uuid::Uuid,
    pub market_slug: String,
    pub condition_id: String,
    pub token_id: String,
    pub entry_price: Decimal,
    pub shares: Decimal,
    pub entry_time: DateTime<Utc>,
    pub market_end_time: DateTime<Utc>,
    pub exit_price: Option<Decimal>,
    pub exit_time: Option<DateTime<Utc>>,
    pub exit_reason: Option<String>,
    pub pnl: Option<Decimal>,
    pub pnl_synced: bool,
    pub redeemed: bool,
}

impl Position {
    #[must_use]
    pub fn open(
        market_slug: String,
        condition_id: String,
        token_id: String,
        entry_price: Decimal,
        shares: Decimal,
        market_end_time: DateTime<Utc>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            market_slug,
            condition_id,
            token_id,
            entry_price,
            shares,
            entry_time: Utc::now(),
            market_end_time,
            exit_price: None,
            exit_time: None,
            exit_reason: None,
            pnl: None,
            pnl_synced: false,
            redeemed: false,
        }
    }

    /// Sets exit fields and computes `pnl` atomically so the
    /// `exit_time ≠ NULL ⇒ pnl ≠ NULL` invariant can never be violated by a
    /// caller setting one without the other.
    pub fn close(&mut self, exit_price: Decimal, exit_reason: impl Into<String>) {
        let pnl = (exit_price - self.entry_price) * self.shares;
        self.exit_price = Some(exit_price);
        self.exit_time = Some(Utc::now());
        self.exit_reason = Some(exit_reason.into());
        self.pnl = Some(pnl);
    }

    #[must_use]
    pub const fn is_closed(&self) -> bool {
        self.exit_time.is_some()
    }
}

/// `ArbitragePosition` — paired-market hedged position (spec.md §3).
///
/// Invariant when `profit_locked`: `min(qty_up, qty_down) ≥ cost_up + cost_down`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArbitragePosition {
    pub id: uuid::Uuid,
    pub market_slug: String,
    pub condition_id: String,
    pub up_token_id: String,
    pub down_token_id: String,
    pub qty_up: Decimal,
    pub qty_down: Decimal,
    pub cost_up: Decimal,
    pub cost_down: Decimal,
    pub pair_cost: Option<Decimal>,
    pub hedged_qty: Option<Decimal>,
    pub guaranteed_profit: Option<Decimal>,
    pub profit_locked: bool,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    pub settlement_pnl: Option<Decimal>,
    pub up_redeemed: bool,
    pub down_redeemed: bool,
}

impl ArbitragePosition {
    #[must_use]
    pub fn new(market_slug: String, condition_id: String, up_token_id: String, down_token_id: String) -> Self {
        Self {
            id: uuid::Uuid::new_v4(),
            market_slug,
            condition_id,
            up_token_id,
            down_token_id,
            qty_up: Decimal::ZERO,
            qty_down: Decimal::ZERO,
            cost_up: Decimal::ZERO,
            cost_down: Decimal::ZERO,
            pair_cost: None,
            hedged_qty: None,
            guaranteed_profit: None,
            profit_locked: false,
            created_at: Utc::now(),
            settled_at: None,
            settlement_pnl: None,
            up_redeemed: false,
            down_redeemed: false,
        }
    }

    /// Checks the §3 profit-locked invariant holds for the current
    /// quantities/costs; used by tests and by the cycle tracker before it
    /// flips `profit_locked`.
    #[must_use]
    pub fn satisfies_lock_invariant(&self) -> bool {
        let hedged = self.qty_up.min(self.qty_down);
        hedged >= self.cost_up + self.cost_down
    }
}

/// A single outcome slot within a [`SportsPosition`] (spec.md §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutcomeSlot {
    pub token_id: String,
    pub label: String,
    pub shares: Decimal,
    pub sold: bool,
    pub sold_at: Option<DateTime<Utc>>,
    pub sold_price: Decimal,
    pub sold_shares: Decimal,
    pub sold_revenue: Decimal,
}

impl OutcomeSlot {
    #[must_use]
    pub fn new(token_id: String, label: String) -> Self {
        Self {
            token_id,
            label,
            shares: Decimal::ZERO,
            sold: false,
            sold_at: None,
            sold_price: Decimal::ZERO,
            sold_shares: Decimal::ZERO,
            sold_revenue: Decimal::ZERO,
        }
    }
}

/// `SportsPosition` — multi-side holding state machine (spec.md §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SportsPositionState {
    PendingSplit,
    Holding,
    PartialSold,
    PendingSettlement,
    Settled,
    /// Emergency exit: both sides sold before settlement.
    FullySold,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SportsPosition {
    pub market_slug: String,
    pub condition_id: String,
    pub state: SportsPositionState,
    pub state_changed_at: DateTime<Utc>,
    pub outcome1: OutcomeSlot,
    pub outcome2: OutcomeSlot,
    pub split_cost: Decimal,
    pub settlement_revenue: Decimal,
    pub realized_pnl: Option<Decimal>,
}

impl SportsPosition {
    #[must_use]
    pub fn new(market_slug: String, condition_id: String, outcome1: OutcomeSlot, outcome2: OutcomeSlot) -> Self {
        Self {
            market_slug,
            condition_id,
            state: SportsPositionState::PendingSplit,
            state_changed_at: Utc::now(),
            outcome1,
            outcome2,
            split_cost: Decimal::ZERO,
            settlement_revenue: Decimal::ZERO,
            realized_pnl: None,
        }
    }

    pub fn transition(&mut self, next: SportsPositionState) {
        self.state = next;
        self.state_changed_at = Utc::now();
    }

    /// `unrealized_pnl` (spec.md §4.9): unsold shares marked at `current_side_price`
    /// plus revenue already banked from sold shares, less the original split cost.
    #[must_use]
    pub fn unrealized_pnl(&self, current_outcome1_price: Decimal, current_outcome2_price: Decimal) -> Decimal {
        let unsold_value = if self.outcome1.sold {
            Decimal::ZERO
        } else {
            self.outcome1.shares * current_outcome1_price
        } + if self.outcome2.sold {
            Decimal::ZERO
        } else {
            self.outcome2.shares * current_outcome2_price
        };
        let sold_revenue = self.outcome1.sold_revenue + self.outcome2.sold_revenue;
        unsold_value + sold_revenue - self.split_cost
    }

    /// Fixes `realized_pnl` at settlement (spec.md §4.9).
    pub fn settle(&mut self, settlement_revenue: Decimal) {
        self.settlement_revenue = settlement_revenue;
        let sold_revenue = self.outcome1.sold_revenue + self.outcome2.sold_revenue;
        self.realized_pnl = Some(sold_revenue + settlement_revenue - self.split_cost);
        self.transition(SportsPositionState::Settled);
    }
}

/// Aggregate P&L summary partitioned by sport/category (spec.md §4.9).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PnLSummary {
    pub by_category: std::collections::HashMap<String, CategoryPnL>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CategoryPnL {
    pub wins: u32,
    pub losses: u32,
    pub realized_pnl: Decimal,
}

impl CategoryPnL {
    #[must_use]
    pub fn win_rate(&self) -> Decimal {
        let total = self.wins + self.losses;
        if total == 0 {
            Decimal::ZERO
        } else {
            Decimal::from(self.wins) / Decimal::from(total)
        }
    }
}
