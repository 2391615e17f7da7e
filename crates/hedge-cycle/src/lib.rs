//! Cycle Tracker (spec.md §4.8): one logical accumulation-then-lock sequence
//! within a single market holding. Grounded on the teacher's
//! `arbitrage::types::ArbitragePosition` (YES/NO leg balancing, pair cost,
//! imbalance) generalized from a single opportunistic fill pair into the
//! repeated accumulate/lock/settle cycle spec.md §4.8 names, with the
//! `initial_accum_price` ceiling and FAK-retry lock lifecycle the teacher's
//! one-shot arbitrage fill never needed.

use chrono::{DateTime, Utc};
use hedge_core::market::OutcomeSide;
use rust_decimal::Decimal;

/// `max(5 shares, ceil($1 / price))` (spec.md §8 "Boundary behaviors").
#[must_use]
pub fn venue_min_shares(price: Decimal) -> Decimal {
    let five = Decimal::new(5, 0);
    if price <= Decimal::ZERO {
        return five;
    }
    let from_price = (Decimal::ONE / price).ceil();
    five.max(from_price)
}

#[derive(Debug, Clone)]
pub struct AccumulationRecord {
    pub side: OutcomeSide,
    pub price: Decimal,
    pub shares: Decimal,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct LockTarget {
    pub side: OutcomeSide,
    pub shares: Decimal,
    pub price: Decimal,
    pub filled: Decimal,
}

#[derive(Debug, Clone, Copy)]
pub struct LockParams {
    pub side: OutcomeSide,
    pub size: Decimal,
    pub price: Decimal,
}

#[derive(Debug, Clone, Default)]
struct SideState {
    qty: Decimal,
    cost: Decimal,
}

impl SideState {
    fn avg_price(&self) -> Decimal {
        if self.qty == Decimal::ZERO {
            Decimal::ZERO
        } else {
            self.cost / self.qty
        }
    }
}

/// Accumulate-then-lock state for one market holding. `pair_cost_target` is
/// the strategy's configured ceiling for `up_cost + down_cost` per pair
/// (e.g. `0.98` to leave a 2-cent margin against the $1 settlement payout).
pub struct CycleTracker {
    cycle_number: u64,
    up: SideState,
    down: SideState,
    history: Vec<AccumulationRecord>,
    initial_accum_price: Option<Decimal>,
    initial_accum_side: Option<OutcomeSide>,
    active_accum_side: Option<OutcomeSide>,
    is_locked: bool,
    awaiting_lock: bool,
    lock_target: Option<LockTarget>,
    pair_cost_target: Decimal,
}

impl CycleTracker {
    #[must_use]
    pub fn new(pair_cost_target: Decimal) -> Self {
        Self {
            cycle_number: 1,
            up: SideState::default(),
            down: SideState::default(),
            history: Vec::new(),
            initial_accum_price: None,
            initial_accum_side: None,
            active_accum_side: None,
            is_locked: false,
            awaiting_lock: false,
            lock_target: None,
            pair_cost_target,
        }
    }

    #[must_use]
    pub fn cycle_number(&self) -> u64 {
        self.cycle_number
    }

    fn side_mut(&mut self, side: OutcomeSide) -> &mut SideState {
        match side {
            OutcomeSide::Up => &mut self.up,
            OutcomeSide::Down => &mut self.down,
        }
    }

    fn side(&self, side: OutcomeSide) -> &SideState {
        match side {
            OutcomeSide::Up => &self.up,
            OutcomeSide::Down => &self.down,
        }
    }

    #[must_use]
    pub fn up_qty(&self) -> Decimal {
        self.up.qty
    }

    #[must_use]
    pub fn down_qty(&self) -> Decimal {
        self.down.qty
    }

    #[must_use]
    pub fn up_cost(&self) -> Decimal {
        self.up.cost
    }

    #[must_use]
    pub fn down_cost(&self) -> Decimal {
        self.down.cost
    }

    #[must_use]
    pub fn initial_accum_price(&self) -> Option<Decimal> {
        self.initial_accum_price
    }

    #[must_use]
    pub fn history(&self) -> &[AccumulationRecord] {
        &self.history
    }

    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.is_locked
    }

    /// `record_accumulation(side, price, shares)` (spec.md §4.8). The first
    /// call in a cycle fixes `initial_accum_price`/`initial_accum_side` as a
    /// permanent ceiling for the rest of the cycle.
    pub fn record_accumulation(&mut self, side: OutcomeSide, price: Decimal, shares: Decimal) {
        if self.initial_accum_price.is_none() {
            self.initial_accum_price = Some(price);
            self.initial_accum_side = Some(side);
        }
        self.active_accum_side = Some(side);
        let entry = self.side_mut(side);
        entry.qty += shares;
        entry.cost += price * shares;
        self.history.push(AccumulationRecord { side, price, shares, at: Utc::now() });
    }

    /// `can_accumulate(current_price)` (spec.md §4.8): `true` until the
    /// ceiling set by the first accumulation in the cycle is exceeded.
    #[must_use]
    pub fn can_accumulate(&self, current_price: Decimal) -> bool {
        self.initial_accum_price.map_or(true, |ceiling| current_price <= ceiling)
    }

    fn is_imbalanced(&self) -> bool {
        let Some(active) = self.active_accum_side else { return false };
        self.side(active).qty > self.side(active.opposite()).qty
    }

    /// `needs_lock()` (spec.md §4.8).
    #[must_use]
    pub fn needs_lock(&self) -> bool {
        self.is_imbalanced() && !self.is_locked && !self.awaiting_lock
    }

    /// `get_lock_params()` (spec.md §4.8). Returns `None` if the cycle is
    /// already balanced or has no accumulation yet.
    #[must_use]
    pub fn get_lock_params(&self) -> Option<LockParams> {
        let active = self.active_accum_side?;
        let opposite = active.opposite();
        let active_state = self.side(active);
        let opposite_state = self.side(opposite);
        let gap = active_state.qty - opposite_state.qty;
        if gap <= Decimal::ZERO {
            return None;
        }
        let price = (self.pair_cost_target - active_state.avg_price()).max(Decimal::new(1, 2));
        let size = gap.max(venue_min_shares(price));
        Some(LockParams { side: opposite, size, price })
    }

    /// `set_lock_target(side, shares, price)` (spec.md §4.8).
    pub fn set_lock_target(&mut self, side: OutcomeSide, shares: Decimal, price: Decimal) {
        self.lock_target = Some(LockTarget { side, shares, price, filled: Decimal::ZERO });
        self.awaiting_lock = true;
    }

    /// `update_lock_target(remaining)` (spec.md §4.8): records a partial
    /// fill and narrows the target to the unfilled remainder for a retry.
    pub fn update_lock_target(&mut self, remaining: Decimal) {
        if let Some(target) = &mut self.lock_target {
            let filled_now = target.shares - remaining;
            target.filled += filled_now.max(Decimal::ZERO);
            target.shares = remaining;
        }
    }

    /// `clear_lock_target()` (spec.md §4.8): abandons the in-flight lock
    /// attempt without marking the cycle locked.
    pub fn clear_lock_target(&mut self) {
        self.lock_target = None;
        self.awaiting_lock = false;
    }

    /// `handle_lock_complete()` (spec.md §4.8): called once the lock order's
    /// fills have been folded into the position via `record_accumulation`.
    /// Marks the cycle locked if the sides are now balanced.
    pub fn handle_lock_complete(&mut self) {
        self.lock_target = None;
        self.awaiting_lock = false;
        self.is_locked = !self.is_imbalanced();
    }

    #[must_use]
    pub fn lock_target(&self) -> Option<&LockTarget> {
        self.lock_target.as_ref()
    }

    /// `is_profit_locked()` (spec.md §4.8): `min(up, down) > up_cost + down_cost`.
    #[must_use]
    pub fn is_profit_locked(&self) -> bool {
        self.up.qty.min(self.down.qty) > self.up.cost + self.down.cost
    }

    /// `get_pair_cost()` (spec.md §4.8).
    #[must_use]
    pub fn get_pair_cost(&self) -> Decimal {
        let min_qty = self.up.qty.min(self.down.qty);
        if min_qty == Decimal::ZERO {
            return Decimal::ZERO;
        }
        (self.up.cost + self.down.cost) / min_qty
    }

    /// `start_new_cycle()` (spec.md §4.8): increments the cycle number and
    /// zeroes all per-cycle state.
    pub fn start_new_cycle(&mut self) {
        self.cycle_number += 1;
        self.up = SideState::default();
        self.down = SideState::default();
        self.history.clear();
        self.initial_accum_price = None;
        self.initial_accum_side = None;
        self.active_accum_side = None;
        self.is_locked = false;
        self.awaiting_lock = false;
        self.lock_target = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn tracker() -> CycleTracker {
        CycleTracker::new(dec!(0.98))
    }

    #[test]
    fn first_accumulation_sets_ceiling_and_totals() {
        let mut c = tracker();
        c.record_accumulation(OutcomeSide::Up, dec!(0.42), dec!(10));
        assert_eq!(c.up_qty(), dec!(10));
        assert_eq!(c.up_cost(), dec!(4.20));
        assert_eq!(c.initial_accum_price(), Some(dec!(0.42)));
    }

    #[test]
    fn can_accumulate_respects_ceiling() {
        let mut c = tracker();
        c.record_accumulation(OutcomeSide::Up, dec!(0.42), dec!(10));
        assert!(!c.can_accumulate(dec!(0.43)));
        assert!(c.can_accumulate(dec!(0.41)));
        assert!(c.can_accumulate(dec!(0.42)));
    }

    #[test]
    fn repeated_accumulation_doubles_quantities_but_not_ceiling() {
        let mut c = tracker();
        c.record_accumulation(OutcomeSide::Up, dec!(0.42), dec!(10));
        c.record_accumulation(OutcomeSide::Up, dec!(0.42), dec!(10));
        assert_eq!(c.up_qty(), dec!(20));
        assert_eq!(c.up_cost(), dec!(8.40));
        assert_eq!(c.initial_accum_price(), Some(dec!(0.42)));
    }

    #[test]
    fn get_lock_params_matches_scenario_4() {
        let mut c = tracker();
        c.record_accumulation(OutcomeSide::Up, dec!(0.42), dec!(10));
        let params = c.get_lock_params().unwrap();
        assert_eq!(params.side, OutcomeSide::Down);
        assert_eq!(params.size, dec!(10));
        assert_eq!(params.price, dec!(0.56));
    }

    #[test]
    fn is_profit_locked_matches_scenario_5() {
        let mut c = tracker();
        c.record_accumulation(OutcomeSide::Up, dec!(0.42), dec!(10));
        c.record_accumulation(OutcomeSide::Down, dec!(0.56), dec!(10));
        assert!(c.is_profit_locked());
        assert_eq!(c.get_pair_cost(), dec!(0.98));
    }

    #[test]
    fn needs_lock_false_once_balanced() {
        let mut c = tracker();
        c.record_accumulation(OutcomeSide::Up, dec!(0.42), dec!(10));
        assert!(c.needs_lock());
        c.set_lock_target(OutcomeSide::Down, dec!(10), dec!(0.56));
        assert!(!c.needs_lock(), "awaiting_lock suppresses re-triggering");
        c.record_accumulation(OutcomeSide::Down, dec!(0.56), dec!(10));
        c.handle_lock_complete();
        assert!(!c.needs_lock());
        assert!(c.is_locked());
    }

    #[test]
    fn partial_lock_fill_narrows_target_for_retry() {
        let mut c = tracker();
        c.record_accumulation(OutcomeSide::Up, dec!(0.42), dec!(10));
        c.set_lock_target(OutcomeSide::Down, dec!(10), dec!(0.56));
        c.record_accumulation(OutcomeSide::Down, dec!(0.56), dec!(6));
        c.update_lock_target(dec!(4));
        let target = c.lock_target().unwrap();
        assert_eq!(target.shares, dec!(4));
        assert_eq!(target.filled, dec!(6));
    }

    #[test]
    fn start_new_cycle_zeroes_state_and_bumps_number() {
        let mut c = tracker();
        c.record_accumulation(OutcomeSide::Up, dec!(0.42), dec!(10));
        c.record_accumulation(OutcomeSide::Down, dec!(0.56), dec!(10));
        c.start_new_cycle();
        assert_eq!(c.cycle_number(), 2);
        assert_eq!(c.up_qty(), Decimal::ZERO);
        assert_eq!(c.initial_accum_price(), None);
        assert!(!c.is_locked());
    }

    #[test]
    fn venue_min_shares_applies_floor_and_dollar_rule() {
        assert_eq!(venue_min_shares(dec!(0.50)), dec!(5));
        assert_eq!(venue_min_shares(dec!(0.10)), dec!(10));
    }
}
