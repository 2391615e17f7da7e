//! Persistent Store (spec.md §4.2): a single-writer embedded database with
//! write-ahead logging. Grounded on the teacher's `data::database` and
//! `data::repositories` modules, adapted from the teacher's Postgres/sqlx
//! stack to SQLite/sqlx (WAL mode) to match spec.md §6 "Persisted state
//! layout" (`./data/trading.db`, a single file) — the only dependency swap
//! this crate makes relative to the teacher, noted in DESIGN.md.

mod schema;

use std::str::FromStr;

use chrono::{DateTime, Utc};
use hedge_core::position::{ArbitragePosition, Position};
use rust_decimal::Decimal;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("malformed decimal column: {0}")]
    Decimal(String),
    #[error("not found")]
    NotFound,
}

type Result<T> = std::result::Result<T, StoreError>;

fn dec_to_sql(d: Decimal) -> String {
    d.to_string()
}

fn dec_from_sql(s: &str) -> Result<Decimal> {
    Decimal::from_str(s).map_err(|_| StoreError::Decimal(s.to_string()))
}

fn opt_dec_to_sql(d: Option<Decimal>) -> Option<String> {
    d.map(dec_to_sql)
}

fn opt_dec_from_sql(s: Option<String>) -> Result<Option<Decimal>> {
    s.map(|s| dec_from_sql(&s)).transpose()
}

/// The Persistent Store (spec.md §4.2). Cloning is cheap — the underlying
/// `SqlitePool` is reference-counted and sqlx serializes writers against the
/// single-writer WAL connection internally.
#[derive(Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Opens (creating if absent) the database file at `path` and runs the
    /// self-migration sequence (spec.md §4.2).
    pub async fn open(path: &str) -> Result<Self> {
        if let Some(parent) = std::path::Path::new(path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| StoreError::Database(sqlx::Error::Io(e)))?;
            }
        }
        let url = format!("sqlite://{path}?mode=rwc");
        let pool = SqlitePoolOptions::new().max_connections(1).connect(&url).await?;
        schema::init(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory store for tests.
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new().max_connections(1).connect("sqlite::memory:").await?;
        schema::init(&pool).await?;
        Ok(Self { pool })
    }

    // -- positions -----------------------------------------------------

    pub async fn insert_position(&self, position: &Position) -> Result<()> {
        sqlx::query(
            "INSERT INTO positions
             (id, market_slug, condition_id, token_id, entry_price, shares, entry_time,
              market_end_time, exit_price, exit_time, exit_reason, pnl, pnl_synced, redeemed)
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(position.id.to_string())
        .bind(&position.market_slug)
        .bind(&position.condition_id)
        .bind(&position.token_id)
        .bind(dec_to_sql(position.entry_price))
        .bind(dec_to_sql(position.shares))
        .bind(position.entry_time.to_rfc3339())
        .bind(position.market_end_time.to_rfc3339())
        .bind(opt_dec_to_sql(position.exit_price))
        .bind(position.exit_time.map(|t| t.to_rfc3339()))
        .bind(&position.exit_reason)
        .bind(opt_dec_to_sql(position.pnl))
        .bind(i64::from(position.pnl_synced))
        .bind(i64::from(position.redeemed))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `updatePositionExit` (spec.md §4.2): the only way exit fields are
    /// written, keeping the `exit_time ≠ NULL ⇒ pnl ≠ NULL` invariant intact
    /// in the persisted row as well as in memory.
    pub async fn update_position_exit(
        &self,
        id: uuid::Uuid,
        exit_price: Decimal,
        exit_time: DateTime<Utc>,
        exit_reason: &str,
        pnl: Decimal,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE positions SET exit_price=?, exit_time=?, exit_reason=?, pnl=? WHERE id=?",
        )
        .bind(dec_to_sql(exit_price))
        .bind(exit_time.to_rfc3339())
        .bind(exit_reason)
        .bind(dec_to_sql(pnl))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Idempotent: repeated calls are harmless (spec.md §8 round-trip laws).
    pub async fn mark_position_redeemed(&self, id: uuid::Uuid) -> Result<()> {
        sqlx::query("UPDATE positions SET redeemed = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn mark_position_pnl_synced(&self, id: uuid::Uuid) -> Result<()> {
        sqlx::query("UPDATE positions SET pnl_synced = 1 WHERE id = ?")
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn get_position(&self, id: uuid::Uuid) -> Result<Position> {
        let row = sqlx::query("SELECT * FROM positions WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?
            .ok_or(StoreError::NotFound)?;
        row_to_position(&row)
    }

    pub async fn positions_for_market(&self, market_slug: &str) -> Result<Vec<Position>> {
        let rows = sqlx::query("SELECT * FROM positions WHERE market_slug = ? ORDER BY entry_time")
            .bind(market_slug)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(row_to_position).collect()
    }

    // -- arbitrage positions --------------------------------------------

    pub async fn insert_arbitrage_position(&self, position: &ArbitragePosition) -> Result<()> {
        sqlx::query(
            "INSERT INTO arbitrage_positions
             (id, market_slug, condition_id, up_token_id, down_token_id, qty_up, qty_down,
              cost_up, cost_down, pair_cost, hedged_qty, guaranteed_profit, profit_locked,
              created_at, settled_at, settlement_pnl, up_redeemed, down_redeemed)
             VALUES (?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?,?)",
        )
        .bind(position.id.to_string())
        .bind(&position.market_slug)
        .bind(&position.condition_id)
        .bind(&position.up_token_id)
        .bind(&position.down_token_id)
        .bind(dec_to_sql(position.qty_up))
        .bind(dec_to_sql(position.qty_down))
        .bind(dec_to_sql(position.cost_up))
        .bind(dec_to_sql(position.cost_down))
        .bind(opt_dec_to_sql(position.pair_cost))
        .bind(opt_dec_to_sql(position.hedged_qty))
        .bind(opt_dec_to_sql(position.guaranteed_profit))
        .bind(i64::from(position.profit_locked))
        .bind(position.created_at.to_rfc3339())
        .bind(position.settled_at.map(|t| t.to_rfc3339()))
        .bind(opt_dec_to_sql(position.settlement_pnl))
        .bind(i64::from(position.up_redeemed))
        .bind(i64::from(position.down_redeemed))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// `markArbitrageProfitLocked` (spec.md §4.2).
    pub async fn mark_arbitrage_profit_locked(
        &self,
        id: uuid::Uuid,
        pair_cost: Decimal,
        hedged_qty: Decimal,
        guaranteed_profit: Decimal,
    ) -> Result<()> {
        sqlx::query(
            "UPDATE arbitrage_positions
             SET profit_locked = 1, pair_cost = ?, hedged_qty = ?, guaranteed_profit = ?
             WHERE id = ?",
        )
        .bind(dec_to_sql(pair_cost))
        .bind(dec_to_sql(hedged_qty))
        .bind(dec_to_sql(guaranteed_profit))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Per-fill ledger entry for the Order Executor (spec.md §4.2
    /// `trade_log`). Fire-and-forget from the caller's perspective — a
    /// failed write never blocks or unwinds the order-placement path.
    pub async fn insert_trade_log(&self, market_slug: &str, order_id: Option<&str>, side: &str, price: Decimal, shares: Decimal) -> Result<()> {
        sqlx::query("INSERT INTO trade_log (market_slug, order_id, side, price, shares, ts) VALUES (?,?,?,?,?,?)")
            .bind(market_slug)
            .bind(order_id)
            .bind(side)
            .bind(dec_to_sql(price))
            .bind(dec_to_sql(shares))
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// User-Channel WS fill ledger (spec.md §4.2 `user_fills`), independent
    /// of `trade_log` so a WS-observed fill is recorded even when it never
    /// runs through the Order Executor's own HTTP response path.
    pub async fn insert_user_fill(&self, order_id: &str, asset_id: &str, price: Decimal, size: Decimal, side: &str) -> Result<()> {
        sqlx::query("INSERT INTO user_fills (order_id, asset_id, price, size, side, ts) VALUES (?,?,?,?,?,?)")
            .bind(order_id)
            .bind(asset_id)
            .bind(dec_to_sql(price))
            .bind(dec_to_sql(size))
            .bind(side)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Price Monitor tick ledger (spec.md §4.2 `price_history`).
    pub async fn insert_price_tick(&self, token_id: &str, price: Decimal) -> Result<()> {
        sqlx::query("INSERT INTO price_history (token_id, price, ts) VALUES (?,?,?)")
            .bind(token_id)
            .bind(dec_to_sql(price))
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Per-fill ledger entry for a hedged cycle's accumulation/lock fills
    /// (spec.md §4.2 `arbitrage_trades`), keyed to the owning
    /// `arbitrage_positions` row.
    pub async fn insert_arbitrage_trade(&self, arbitrage_position_id: uuid::Uuid, side: &str, price: Decimal, shares: Decimal) -> Result<()> {
        sqlx::query("INSERT INTO arbitrage_trades (id, arbitrage_position_id, side, price, shares, ts) VALUES (?,?,?,?,?,?)")
            .bind(uuid::Uuid::new_v4().to_string())
            .bind(arbitrage_position_id.to_string())
            .bind(side)
            .bind(dec_to_sql(price))
            .bind(dec_to_sql(shares))
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- capital baseline -------------------------------------------------

    pub async fn capital_baseline(&self) -> Result<(Decimal, DateTime<Utc>, i64)> {
        let row = sqlx::query("SELECT baseline, last_updated, recovery_attempts FROM capital_baseline WHERE id = 1")
            .fetch_one(&self.pool)
            .await?;
        let baseline: String = row.try_get("baseline")?;
        let last_updated: String = row.try_get("last_updated")?;
        let recovery_attempts: i64 = row.try_get("recovery_attempts")?;
        Ok((
            dec_from_sql(&baseline)?,
            DateTime::parse_from_rfc3339(&last_updated)
                .map_err(|e| StoreError::Decimal(e.to_string()))?
                .with_timezone(&Utc),
            recovery_attempts,
        ))
    }

    /// Mutated only by the baseline-sync job after a position's
    /// `pnl_synced` is flipped (spec.md §3 "Capital Baseline").
    pub async fn update_capital_baseline(&self, baseline: Decimal) -> Result<()> {
        sqlx::query("UPDATE capital_baseline SET baseline = ?, last_updated = ? WHERE id = 1")
            .bind(dec_to_sql(baseline))
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- signal state ------------------------------------------------------

    /// `insertSignal(ts, state)` (spec.md §4.2 special contract): computes
    /// `market_start = floor((ts_ms) / (15*60*1000)) * 15*60*1000` and
    /// upserts on `market_start` (replacing any prior signal for that
    /// window — spec.md §8 scenario 9).
    pub async fn insert_signal(&self, ts_secs: i64, state: &str) -> Result<i64> {
        let market_start = market_start_ms(ts_secs);
        sqlx::query(
            "INSERT INTO signal_state (market_start, timestamp, state, received_at)
             VALUES (?, ?, ?, ?)
             ON CONFLICT(market_start) DO UPDATE SET
                timestamp = excluded.timestamp,
                state = excluded.state,
                received_at = excluded.received_at",
        )
        .bind(market_start)
        .bind(ts_secs)
        .bind(state)
        .bind(Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(market_start)
    }

    pub async fn get_signal_for_market(&self, market_start: i64) -> Result<Option<SignalRow>> {
        let row = sqlx::query("SELECT * FROM signal_state WHERE market_start = ?")
            .bind(market_start)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_signal).transpose()
    }

    pub async fn latest_signal(&self) -> Result<Option<SignalRow>> {
        let row = sqlx::query("SELECT * FROM signal_state ORDER BY market_start DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(row_to_signal).transpose()
    }

    // -- redemption tracking ------------------------------------------------

    pub const MAX_REDEMPTION_ATTEMPTS: i64 = 2;

    /// `recordRedemptionAttempt` (spec.md §4.2, §4.10): hard cap of 2
    /// attempts per condition (spec.md §8 invariant 5).
    pub async fn record_redemption_attempt(
        &self,
        condition_id: &str,
        tx_hash: Option<&str>,
        success: bool,
    ) -> Result<i64> {
        sqlx::query(
            "INSERT INTO redemption_tracking (condition_id, attempt_count, last_attempt_at, last_tx_hash, last_success)
             VALUES (?, 1, ?, ?, ?)
             ON CONFLICT(condition_id) DO UPDATE SET
                attempt_count = attempt_count + 1,
                last_attempt_at = excluded.last_attempt_at,
                last_tx_hash = excluded.last_tx_hash,
                last_success = excluded.last_success",
        )
        .bind(condition_id)
        .bind(Utc::now().to_rfc3339())
        .bind(tx_hash)
        .bind(i64::from(success))
        .execute(&self.pool)
        .await?;
        let row = sqlx::query("SELECT attempt_count FROM redemption_tracking WHERE condition_id = ?")
            .bind(condition_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("attempt_count")?)
    }

    pub async fn redemption_attempts(&self, condition_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT attempt_count FROM redemption_tracking WHERE condition_id = ?")
            .bind(condition_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.try_get("attempt_count")).transpose()?.unwrap_or(0))
    }
}

/// `market_start = floor(ts_ms / 15min_ms) * 15min_ms` (spec.md §4.2).
#[must_use]
pub fn market_start_ms(ts_secs: i64) -> i64 {
    const WINDOW_MS: i64 = 15 * 60 * 1000;
    let ts_ms = ts_secs * 1000;
    (ts_ms / WINDOW_MS) * WINDOW_MS
}

#[derive(Debug, Clone)]
pub struct SignalRow {
    pub market_start: i64,
    pub timestamp: i64,
    pub state: String,
    pub received_at: DateTime<Utc>,
}

fn row_to_signal(row: &sqlx::sqlite::SqliteRow) -> Result<SignalRow> {
    let received_at: String = row.try_get("received_at")?;
    Ok(SignalRow {
        market_start: row.try_get("market_start")?,
        timestamp: row.try_get("timestamp")?,
        state: row.try_get("state")?,
        received_at: DateTime::parse_from_rfc3339(&received_at)
            .map_err(|e| StoreError::Decimal(e.to_string()))?
            .with_timezone(&Utc),
    })
}

fn row_to_position(row: &sqlx::sqlite::SqliteRow) -> Result<Position> {
    let id: String = row.try_get("id")?;
    let entry_time: String = row.try_get("entry_time")?;
    let market_end_time: String = row.try_get("market_end_time")?;
    let exit_time: Option<String> = row.try_get("exit_time")?;
    let pnl_synced: i64 = row.try_get("pnl_synced")?;
    let redeemed: i64 = row.try_get("redeemed")?;
    Ok(Position {
        id: uuid::Uuid::parse_str(&id).map_err(|e| StoreError::Decimal(e.to_string()))?,
        market_slug: row.try_get("market_slug")?,
        condition_id: row.try_get("condition_id")?,
        token_id: row.try_get("token_id")?,
        entry_price: dec_from_sql(&row.try_get::<String, _>("entry_price")?)?,
        shares: dec_from_sql(&row.try_get::<String, _>("shares")?)?,
        entry_time: DateTime::parse_from_rfc3339(&entry_time)
            .map_err(|e| StoreError::Decimal(e.to_string()))?
            .with_timezone(&Utc),
        market_end_time: DateTime::parse_from_rfc3339(&market_end_time)
            .map_err(|e| StoreError::Decimal(e.to_string()))?
            .with_timezone(&Utc),
        exit_price: opt_dec_from_sql(row.try_get("exit_price")?)?,
        exit_time: exit_time
            .map(|s| DateTime::parse_from_rfc3339(&s).map(|d| d.with_timezone(&Utc)))
            .transpose()
            .map_err(|e| StoreError::Decimal(e.to_string()))?,
        exit_reason: row.try_get("exit_reason")?,
        pnl: opt_dec_from_sql(row.try_get("pnl")?)?,
        pnl_synced: pnl_synced != 0,
        redeemed: redeemed != 0,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[tokio::test]
    async fn insert_signal_then_get_returns_the_row() {
        let store = Store::open_in_memory().await.unwrap();
        let market_start = store.insert_signal(1_700_000_100, "T1ENTRY").await.unwrap();
        let row = store.get_signal_for_market(market_start).await.unwrap().unwrap();
        assert_eq!(row.state, "T1ENTRY");
    }

    #[tokio::test]
    async fn second_insert_in_same_window_replaces_first() {
        let store = Store::open_in_memory().await.unwrap();
        let a = store.insert_signal(1_700_000_100, "T1ENTRY").await.unwrap();
        let b = store.insert_signal(1_700_000_150, "T2ENTRY").await.unwrap();
        assert_eq!(a, b);
        let row = store.get_signal_for_market(a).await.unwrap().unwrap();
        assert_eq!(row.state, "T2ENTRY");
    }

    #[tokio::test]
    async fn mark_position_redeemed_is_idempotent() {
        let store = Store::open_in_memory().await.unwrap();
        let pos = Position::open(
            "btc-updown".into(),
            "cond-1".into(),
            "tok-up".into(),
            dec!(0.42),
            dec!(10),
            Utc::now(),
        );
        store.insert_position(&pos).await.unwrap();
        store.mark_position_redeemed(pos.id).await.unwrap();
        store.mark_position_redeemed(pos.id).await.unwrap();
        let fetched = store.get_position(pos.id).await.unwrap();
        assert!(fetched.redeemed);
    }

    #[tokio::test]
    async fn redemption_attempts_are_capped_at_two() {
        let store = Store::open_in_memory().await.unwrap();
        let cond = "cond-xyz";
        let first = store.record_redemption_attempt(cond, None, false).await.unwrap();
        let second = store.record_redemption_attempt(cond, None, false).await.unwrap();
        assert_eq!(first, 1);
        assert_eq!(second, 2);
        assert_eq!(store.redemption_attempts(cond).await.unwrap(), Store::MAX_REDEMPTION_ATTEMPTS);
    }

    #[tokio::test]
    async fn update_position_exit_sets_pnl_with_exit_time() {
        let store = Store::open_in_memory().await.unwrap();
        let pos = Position::open(
            "btc-updown".into(),
            "cond-1".into(),
            "tok-up".into(),
            dec!(0.42),
            dec!(10),
            Utc::now(),
        );
        store.insert_position(&pos).await.unwrap();
        store
            .update_position_exit(pos.id, dec!(0.55), Utc::now(), "sell_trigger", dec!(1.3))
            .await
            .unwrap();
        let fetched = store.get_position(pos.id).await.unwrap();
        assert!(fetched.exit_time.is_some());
        assert_eq!(fetched.pnl, Some(dec!(1.3)));
    }
}
