//! L2 order book maintenance (spec.md §4.3 invariants), grounded on the
//! teacher's `arbitrage::types::L2OrderBook`.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::cmp::Reverse;
use std::collections::BTreeMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Side {
    Buy,
    Sell,
}

/// Bids are kept in a `BTreeMap<Reverse<Decimal>, Decimal>` so the best bid
/// (highest price) iterates first; asks are kept ascending so the best ask
/// (lowest price) iterates first (spec.md §4.3 "Invariants").
#[derive(Debug, Clone)]
pub struct L2OrderBook {
    pub token_id: String,
    bids: BTreeMap<Reverse<Decimal>, Decimal>,
    asks: BTreeMap<Decimal, Decimal>,
    pub last_update_ms: Option<i64>,
}

impl L2OrderBook {
    #[must_use]
    pub fn new(token_id: String) -> Self {
        Self {
            token_id,
            bids: BTreeMap::new(),
            asks: BTreeMap::new(),
            last_update_ms: None,
        }
    }

    #[must_use]
    pub fn best_bid(&self) -> Option<Decimal> {
        self.bids.keys().next().map(|r| r.0)
    }

    #[must_use]
    pub fn best_ask(&self) -> Option<Decimal> {
        self.asks.keys().next().copied()
    }

    /// spec.md §8 invariant 6: `best_bid < best_ask` whenever both sides are
    /// non-empty. Violations are logged by the caller that observed a
    /// crossed book rather than enforced here (a crossed book is a venue
    /// data anomaly, not something this type can refuse to represent).
    #[must_use]
    pub fn is_crossed(&self) -> bool {
        matches!((self.best_bid(), self.best_ask()), (Some(b), Some(a)) if b >= a)
    }

    pub fn apply_snapshot(&mut self, bids: &[(Decimal, Decimal)], asks: &[(Decimal, Decimal)], ts_ms: i64) {
        self.bids.clear();
        self.asks.clear();
        for &(price, size) in bids {
            if size > Decimal::ZERO {
                self.bids.insert(Reverse(price), size);
            }
        }
        for &(price, size) in asks {
            if size > Decimal::ZERO {
                self.asks.insert(price, size);
            }
        }
        self.last_update_ms = Some(ts_ms);
    }

    /// Applies a single price-level delta atomically: the whole book
    /// mutation completes before the caller can observe any derived state
    /// (spec.md §4.3 "Every incoming message ... is applied atomically
    /// before any derived event is emitted" — enforced by giving callers no
    /// way to read `self` mid-mutation since this takes `&mut self`).
    pub fn apply_delta(&mut self, side: Side, price: Decimal, size: Decimal, ts_ms: i64) {
        match side {
            Side::Buy => {
                if size <= Decimal::ZERO {
                    self.bids.remove(&Reverse(price));
                } else {
                    self.bids.insert(Reverse(price), size);
                }
            }
            Side::Sell => {
                if size <= Decimal::ZERO {
                    self.asks.remove(&price);
                } else {
                    self.asks.insert(price, size);
                }
            }
        }
        self.last_update_ms = Some(ts_ms);
    }

    pub fn bid_levels(&self) -> impl Iterator<Item = (Decimal, Decimal)> + '_ {
        self.bids.iter().map(|(p, s)| (p.0, *s))
    }

    pub fn ask_levels(&self) -> impl Iterator<Item = (Decimal, Decimal)> + '_ {
        self.asks.iter().map(|(p, s)| (*p, *s))
    }

    /// `available_qty_at_or_below` (spec.md §4.3 "Liquidity queries"): rounds
    /// `max_price` up to the next cent before summing ask size at or below
    /// it.
    #[must_use]
    pub fn available_qty_at_or_below(&self, max_price: Decimal) -> Decimal {
        let rounded = ceil_to_cent(max_price);
        self.asks
            .range(..=rounded)
            .map(|(_, size)| *size)
            .fold(Decimal::ZERO, |acc, s| acc + s)
    }
}

/// Rounds `price` up to the next whole cent (spec.md §4.3, §4.7).
#[must_use]
pub fn ceil_to_cent(price: Decimal) -> Decimal {
    let cents = (price * Decimal::ONE_HUNDRED).ceil();
    cents / Decimal::ONE_HUNDRED
}

/// Walks the book to simulate filling `target_size` of `side`, used by the
/// executor's liquidity gating (spec.md §4.7). Returns `None` if the book
/// has no relevant liquidity at all.
#[derive(Debug, Clone, Copy)]
pub struct FillSimulation {
    pub filled: Decimal,
    pub total_cost: Decimal,
    pub worst_price: Decimal,
    pub sufficient_depth: bool,
}

#[must_use]
pub fn simulate_fill(book: &L2OrderBook, side: Side, target_size: Decimal) -> Option<FillSimulation> {
    if target_size <= Decimal::ZERO {
        return None;
    }
    let levels: Vec<(Decimal, Decimal)> = match side {
        Side::Buy => book.ask_levels().collect(),
        Side::Sell => book.bid_levels().collect(),
    };
    if levels.is_empty() {
        return None;
    }
    let mut filled = Decimal::ZERO;
    let mut total_cost = Decimal::ZERO;
    let mut worst_price = Decimal::ZERO;
    for (price, size) in levels {
        if filled >= target_size {
            break;
        }
        let take = size.min(target_size - filled);
        total_cost += take * price;
        filled += take;
        worst_price = price;
    }
    Some(FillSimulation {
        filled,
        total_cost,
        worst_price,
        sufficient_depth: filled >= target_size,
    })
}

#[must_use]
pub fn decimal_to_f64(d: Decimal) -> f64 {
    d.to_f64().unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn book_maintains_best_bid_ask_ordering() {
        let mut book = L2OrderBook::new("tok".into());
        book.apply_snapshot(&[(dec!(0.45), dec!(10)), (dec!(0.48), dec!(5))], &[(dec!(0.52), dec!(20)), (dec!(0.55), dec!(7))], 1);
        assert_eq!(book.best_bid(), Some(dec!(0.48)));
        assert_eq!(book.best_ask(), Some(dec!(0.52)));
        assert!(!book.is_crossed());
    }

    #[test]
    fn applying_snapshot_twice_is_idempotent() {
        let mut book = L2OrderBook::new("tok".into());
        let bids = [(dec!(0.48), dec!(10))];
        let asks = [(dec!(0.52), dec!(20))];
        book.apply_snapshot(&bids, &asks, 1);
        let (b1, a1) = (book.best_bid(), book.best_ask());
        book.apply_snapshot(&bids, &asks, 2);
        assert_eq!((b1, a1), (book.best_bid(), book.best_ask()));
    }

    #[test]
    fn available_qty_at_or_below_rounds_up_to_cent() {
        let mut book = L2OrderBook::new("tok".into());
        book.apply_snapshot(&[], &[(dec!(0.50), dec!(30)), (dec!(0.505), dec!(15)), (dec!(0.60), dec!(5))], 1);
        // 0.503 ceils to 0.51, so the 0.505 level (which rounds to itself,
        // 0.505 <= 0.51) should be included; 0.60 should not.
        let qty = book.available_qty_at_or_below(dec!(0.503));
        assert_eq!(qty, dec!(45));
    }

    #[test]
    fn available_qty_is_zero_when_all_asks_above() {
        let mut book = L2OrderBook::new("tok".into());
        book.apply_snapshot(&[], &[(dec!(0.90), dec!(30))], 1);
        assert_eq!(book.available_qty_at_or_below(dec!(0.50)), Decimal::ZERO);
    }
}
