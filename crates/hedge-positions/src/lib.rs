//! Position Manager (spec.md §4.9): the multi-market position map, its
//! 50-position cap, the `SportsPosition` state machine transitions, P&L
//! aggregation, and periodic JSON snapshotting. Grounded on the teacher's
//! `arbitrage::position_persistence::PositionPersistence` for the
//! save/load/rehydrate shape, generalized from a single-window tracker keyed
//! by `window_start_ms` to a `market_slug`-keyed map with a concurrency cap,
//! and on `arbitrage::settlement::SettlementHandler` for the win/loss P&L
//! aggregation style.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hedge_core::market::MarketCategory;
use hedge_core::position::{CategoryPnL, OutcomeSlot, PnLSummary, SportsPosition, SportsPositionState};
use parking_lot::RwLock;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, error, info, warn};

pub const MAX_OPEN_POSITIONS: usize = 50;
pub const DEFAULT_SNAPSHOT_PATH: &str = "./sss_positions.json";
pub const DEFAULT_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(30);
const SNAPSHOT_VERSION: u32 = 1;

#[derive(Debug, Error)]
pub enum PositionManagerError {
    #[error("position cap reached: {0} open positions")]
    CapReached(usize),
    #[error("unknown market: {0}")]
    UnknownMarket(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// A tracked position plus the category metadata the P&L summary partitions
/// by, since `hedge_core::position::SportsPosition` itself carries none.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrackedPosition {
    pub category: MarketCategory,
    pub position: SportsPosition,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    saved_at: DateTime<Utc>,
    positions: HashMap<String, TrackedPosition>,
}

pub struct PositionManager {
    positions: RwLock<HashMap<String, TrackedPosition>>,
    snapshot_path: PathBuf,
}

impl PositionManager {
    #[must_use]
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        Self { positions: RwLock::new(HashMap::new()), snapshot_path: snapshot_path.into() }
    }

    fn open_count(positions: &HashMap<String, TrackedPosition>) -> usize {
        positions.values().filter(|p| p.position.state != SportsPositionState::Settled).count()
    }

    /// Inserts a new `pending_split` position for `market_slug`, enforcing
    /// the 50-concurrent-open-position cap (spec.md §4.9).
    pub fn add_position(
        &self,
        market_slug: String,
        condition_id: String,
        category: MarketCategory,
        outcome1: OutcomeSlot,
        outcome2: OutcomeSlot,
    ) -> Result<(), PositionManagerError> {
        let mut guard = self.positions.write();
        if Self::open_count(&guard) >= MAX_OPEN_POSITIONS {
            return Err(PositionManagerError::CapReached(MAX_OPEN_POSITIONS));
        }
        let position = SportsPosition::new(market_slug.clone(), condition_id, outcome1, outcome2);
        guard.insert(market_slug, TrackedPosition { category, position });
        Ok(())
    }

    #[must_use]
    pub fn get(&self, market_slug: &str) -> Option<SportsPosition> {
        self.positions.read().get(market_slug).map(|t| t.position.clone())
    }

    fn with_position<F, R>(&self, market_slug: &str, f: F) -> Result<R, PositionManagerError>
    where
        F: FnOnce(&mut SportsPosition) -> R,
    {
        let mut guard = self.positions.write();
        let tracked = guard.get_mut(market_slug).ok_or_else(|| PositionManagerError::UnknownMarket(market_slug.to_string()))?;
        Ok(f(&mut tracked.position))
    }

    /// `split_ok` transition (spec.md §4.9 diagram): records the shares each
    /// outcome slot received from the SPLIT and its USDC cost.
    pub fn mark_split_complete(
        &self,
        market_slug: &str,
        split_cost: Decimal,
        outcome1_shares: Decimal,
        outcome2_shares: Decimal,
    ) -> Result<(), PositionManagerError> {
        self.with_position(market_slug, |p| {
            p.split_cost = split_cost;
            p.outcome1.shares = outcome1_shares;
            p.outcome2.shares = outcome2_shares;
            p.transition(SportsPositionState::Holding);
        })
    }

    /// `sell_one` transition: records a sale of one outcome slot and moves
    /// the position to `partial_sold`.
    pub fn record_sale(
        &self,
        market_slug: &str,
        side: Outcome,
        price: Decimal,
        shares: Decimal,
    ) -> Result<(), PositionManagerError> {
        self.with_position(market_slug, |p| {
            let slot = match side {
                Outcome::One => &mut p.outcome1,
                Outcome::Two => &mut p.outcome2,
            };
            slot.sold = true;
            slot.sold_at = Some(Utc::now());
            slot.sold_price = price;
            slot.sold_shares = shares;
            slot.sold_revenue = price * shares;
            if p.state == SportsPositionState::Holding {
                p.transition(SportsPositionState::PartialSold);
            }
        })
    }

    /// `game_end` transition when neither side was sold: the strategy issues
    /// a MERGE and the position goes straight to `pending_settlement`.
    pub fn mark_pending_settlement(&self, market_slug: &str) -> Result<(), PositionManagerError> {
        self.with_position(market_slug, |p| p.transition(SportsPositionState::PendingSettlement))
    }

    /// Emergency exit: both sides sold before settlement (spec.md §4.9
    /// diagram's `fully_sold` branch).
    pub fn mark_fully_sold(&self, market_slug: &str) -> Result<(), PositionManagerError> {
        self.with_position(market_slug, |p| p.transition(SportsPositionState::FullySold))
    }

    /// `redeem_ok` transition: fixes `realized_pnl` (spec.md §4.9).
    pub fn settle(&self, market_slug: &str, settlement_revenue: Decimal) -> Result<(), PositionManagerError> {
        self.with_position(market_slug, |p| p.settle(settlement_revenue))
    }

    #[must_use]
    pub fn unrealized_pnl(&self, market_slug: &str, price1: Decimal, price2: Decimal) -> Option<Decimal> {
        self.positions.read().get(market_slug).map(|t| t.position.unrealized_pnl(price1, price2))
    }

    /// Aggregate `PnLSummary` over settled positions, partitioned by
    /// category (spec.md §4.9).
    #[must_use]
    pub fn pnl_summary(&self) -> PnLSummary {
        let guard = self.positions.read();
        let mut by_category: HashMap<String, CategoryPnL> = HashMap::new();
        for tracked in guard.values() {
            if tracked.position.state != SportsPositionState::Settled {
                continue;
            }
            let Some(pnl) = tracked.position.realized_pnl else { continue };
            let entry = by_category.entry(tracked.category.0.clone()).or_default();
            entry.realized_pnl += pnl;
            if pnl >= Decimal::ZERO {
                entry.wins += 1;
            } else {
                entry.losses += 1;
            }
        }
        PnLSummary { by_category }
    }

    #[must_use]
    pub fn open_positions_count(&self) -> usize {
        Self::open_count(&self.positions.read())
    }

    /// Serializes the full position map to the configured snapshot path,
    /// version-stamped and pretty-printed (spec.md §6 "Persisted state
    /// layout"), creating parent directories as needed.
    pub fn save_snapshot(&self) -> Result<(), PositionManagerError> {
        if let Some(parent) = self.snapshot_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            saved_at: Utc::now(),
            positions: self.positions.read().clone(),
        };
        let file = std::fs::File::create(&self.snapshot_path)?;
        let writer = std::io::BufWriter::new(file);
        serde_json::to_writer_pretty(writer, &snapshot)?;
        debug!(path = %self.snapshot_path.display(), count = snapshot.positions.len(), "saved position snapshot");
        Ok(())
    }

    /// Rehydrates the position map from disk on startup. A missing or
    /// corrupt file yields an empty map rather than failing startup.
    pub fn load_snapshot(snapshot_path: impl Into<PathBuf>) -> Self {
        let snapshot_path = snapshot_path.into();
        if !snapshot_path.exists() {
            info!(path = %snapshot_path.display(), "no position snapshot found, starting fresh");
            return Self::new(snapshot_path);
        }
        match Self::load_internal(&snapshot_path) {
            Ok(positions) => {
                info!(path = %snapshot_path.display(), count = positions.len(), "rehydrated positions from snapshot");
                Self { positions: RwLock::new(positions), snapshot_path }
            }
            Err(e) => {
                warn!(path = %snapshot_path.display(), error = %e, "failed to load position snapshot, starting fresh");
                Self::new(snapshot_path)
            }
        }
    }

    fn load_internal(path: &Path) -> Result<HashMap<String, TrackedPosition>, PositionManagerError> {
        let file = std::fs::File::open(path)?;
        let reader = std::io::BufReader::new(file);
        let snapshot: Snapshot = serde_json::from_reader(reader)?;
        Ok(snapshot.positions)
    }

    /// Spawns the 30s-interval periodic snapshot task (spec.md §4.9). The
    /// returned handle should be awaited/aborted at shutdown; callers should
    /// also call [`PositionManager::save_snapshot`] directly once more on
    /// shutdown since the interval task may be mid-sleep.
    pub fn spawn_periodic_snapshot(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if let Err(e) = manager.save_snapshot() {
                    error!(error = %e, "periodic position snapshot failed");
                }
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    One,
    Two,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn slots() -> (OutcomeSlot, OutcomeSlot) {
        (
            OutcomeSlot::new("tok-1".to_string(), "Home".to_string()),
            OutcomeSlot::new("tok-2".to_string(), "Away".to_string()),
        )
    }

    #[test]
    fn add_position_enforces_cap() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PositionManager::new(dir.path().join("positions.json"));
        for i in 0..MAX_OPEN_POSITIONS {
            let (o1, o2) = slots();
            manager
                .add_position(format!("market-{i}"), "0xcond".to_string(), MarketCategory("nba".to_string()), o1, o2)
                .unwrap();
        }
        let (o1, o2) = slots();
        let result = manager.add_position("market-overflow".to_string(), "0xcond".to_string(), MarketCategory("nba".to_string()), o1, o2);
        assert!(matches!(result, Err(PositionManagerError::CapReached(50))));
    }

    #[test]
    fn settled_positions_do_not_count_against_the_cap() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PositionManager::new(dir.path().join("positions.json"));
        let (o1, o2) = slots();
        manager.add_position("market-1".to_string(), "0xcond".to_string(), MarketCategory("nba".to_string()), o1, o2).unwrap();
        manager.settle("market-1", dec!(1.0)).unwrap();
        assert_eq!(manager.open_positions_count(), 0);
    }

    #[test]
    fn sale_transitions_to_partial_sold_and_computes_revenue() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PositionManager::new(dir.path().join("positions.json"));
        let (o1, o2) = slots();
        manager.add_position("market-1".to_string(), "0xcond".to_string(), MarketCategory("nba".to_string()), o1, o2).unwrap();
        manager.mark_split_complete("market-1", dec!(10), dec!(50), dec!(50)).unwrap();
        manager.record_sale("market-1", Outcome::One, dec!(0.1), dec!(5)).unwrap();
        let position = manager.get("market-1").unwrap();
        assert_eq!(position.state, SportsPositionState::PartialSold);
        assert_eq!(position.outcome1.sold_revenue, dec!(0.5));
    }

    #[test]
    fn settle_fixes_realized_pnl_and_feeds_summary() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PositionManager::new(dir.path().join("positions.json"));
        let (o1, o2) = slots();
        manager.add_position("market-1".to_string(), "0xcond".to_string(), MarketCategory("nba".to_string()), o1, o2).unwrap();
        manager.mark_split_complete("market-1", dec!(10), dec!(50), dec!(50)).unwrap();
        manager.record_sale("market-1", Outcome::One, dec!(0.1), dec!(5)).unwrap();
        manager.settle("market-1", dec!(5)).unwrap();

        let summary = manager.pnl_summary();
        let nba = summary.by_category.get("nba").unwrap();
        assert_eq!(nba.wins, 1);
        assert_eq!(nba.realized_pnl, dec!(-4.5));
    }

    #[test]
    fn save_and_load_snapshot_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("positions.json");
        let manager = PositionManager::new(&path);
        let (o1, o2) = slots();
        manager.add_position("market-1".to_string(), "0xcond".to_string(), MarketCategory("nba".to_string()), o1, o2).unwrap();
        manager.save_snapshot().unwrap();

        let reloaded = PositionManager::load_snapshot(&path);
        assert_eq!(reloaded.open_positions_count(), 1);
        assert!(reloaded.get("market-1").is_some());
    }

    #[test]
    fn load_snapshot_from_missing_file_starts_empty() {
        let dir = tempfile::tempdir().unwrap();
        let manager = PositionManager::load_snapshot(dir.path().join("does-not-exist.json"));
        assert_eq!(manager.open_positions_count(), 0);
    }
}
