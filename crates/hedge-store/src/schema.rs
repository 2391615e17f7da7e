//! Schema definition and self-migration (spec.md §4.2).
//!
//! On startup, missing columns are added idempotently via a probe-then-
//! `ALTER TABLE` sequence, grounded on the teacher's connection-bootstrap
//! pattern in `data::database::DatabaseClient::new` but generalized from a
//! single `CREATE TABLE` to the add-column-if-missing loop spec.md §4.2
//! requires (`pnl_synced`, `recovery_attempts`, per-side redemption flags).

use sqlx::{Row, SqlitePool};

const CREATE_TABLES: &str = r"
CREATE TABLE IF NOT EXISTS positions (
    id TEXT PRIMARY KEY,
    market_slug TEXT NOT NULL,
    condition_id TEXT NOT NULL,
    token_id TEXT NOT NULL,
    entry_price TEXT NOT NULL,
    shares TEXT NOT NULL,
    entry_time TEXT NOT NULL,
    market_end_time TEXT NOT NULL,
    exit_price TEXT,
    exit_time TEXT,
    exit_reason TEXT,
    pnl TEXT,
    pnl_synced INTEGER NOT NULL DEFAULT 0,
    redeemed INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_positions_market_slug ON positions(market_slug);
CREATE INDEX IF NOT EXISTS idx_positions_condition_id ON positions(condition_id);

CREATE TABLE IF NOT EXISTS arbitrage_positions (
    id TEXT PRIMARY KEY,
    market_slug TEXT NOT NULL,
    condition_id TEXT NOT NULL,
    up_token_id TEXT NOT NULL,
    down_token_id TEXT NOT NULL,
    qty_up TEXT NOT NULL,
    qty_down TEXT NOT NULL,
    cost_up TEXT NOT NULL,
    cost_down TEXT NOT NULL,
    pair_cost TEXT,
    hedged_qty TEXT,
    guaranteed_profit TEXT,
    profit_locked INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    settled_at TEXT,
    settlement_pnl TEXT,
    up_redeemed INTEGER NOT NULL DEFAULT 0,
    down_redeemed INTEGER NOT NULL DEFAULT 0
);
CREATE INDEX IF NOT EXISTS idx_arb_positions_condition_id ON arbitrage_positions(condition_id);

CREATE TABLE IF NOT EXISTS arbitrage_trades (
    id TEXT PRIMARY KEY,
    arbitrage_position_id TEXT NOT NULL,
    side TEXT NOT NULL,
    price TEXT NOT NULL,
    shares TEXT NOT NULL,
    ts TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_arb_trades_position ON arbitrage_trades(arbitrage_position_id);

CREATE TABLE IF NOT EXISTS trade_log (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    market_slug TEXT NOT NULL,
    order_id TEXT,
    side TEXT NOT NULL,
    price TEXT NOT NULL,
    shares TEXT NOT NULL,
    ts TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS capital_baseline (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    baseline TEXT NOT NULL,
    last_updated TEXT NOT NULL,
    recovery_attempts INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS signal_state (
    market_start INTEGER PRIMARY KEY,
    timestamp INTEGER NOT NULL,
    state TEXT NOT NULL,
    received_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS redemption_tracking (
    condition_id TEXT PRIMARY KEY,
    attempt_count INTEGER NOT NULL DEFAULT 0,
    last_attempt_at TEXT,
    last_tx_hash TEXT,
    last_success INTEGER NOT NULL DEFAULT 0
);

CREATE TABLE IF NOT EXISTS price_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    token_id TEXT NOT NULL,
    price TEXT NOT NULL,
    ts TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_price_history_token ON price_history(token_id);

CREATE TABLE IF NOT EXISTS user_fills (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    order_id TEXT NOT NULL,
    asset_id TEXT NOT NULL,
    price TEXT NOT NULL,
    size TEXT NOT NULL,
    side TEXT NOT NULL,
    ts TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_user_fills_order ON user_fills(order_id);

CREATE TABLE IF NOT EXISTS simulation_runs (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    started_at TEXT NOT NULL,
    finished_at TEXT
);

CREATE TABLE IF NOT EXISTS simulation_trades (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id TEXT NOT NULL,
    market_slug TEXT NOT NULL,
    side TEXT NOT NULL,
    price TEXT NOT NULL,
    shares TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_simulation_trades_run ON simulation_trades(run_id);
";

/// One `(table, column, add_column_sql)` probe. Adding a column that already
/// exists is a no-op thanks to the `pragma_table_info` check below, which is
/// what makes this idempotent across restarts against an older database
/// file (spec.md §4.2: "missing columns ... are added idempotently").
const MIGRATIONS: &[(&str, &str, &str)] = &[
    ("positions", "pnl_synced", "ALTER TABLE positions ADD COLUMN pnl_synced INTEGER NOT NULL DEFAULT 0"),
    ("positions", "redeemed", "ALTER TABLE positions ADD COLUMN redeemed INTEGER NOT NULL DEFAULT 0"),
    (
        "capital_baseline",
        "recovery_attempts",
        "ALTER TABLE capital_baseline ADD COLUMN recovery_attempts INTEGER NOT NULL DEFAULT 0",
    ),
    (
        "arbitrage_positions",
        "up_redeemed",
        "ALTER TABLE arbitrage_positions ADD COLUMN up_redeemed INTEGER NOT NULL DEFAULT 0",
    ),
    (
        "arbitrage_positions",
        "down_redeemed",
        "ALTER TABLE arbitrage_positions ADD COLUMN down_redeemed INTEGER NOT NULL DEFAULT 0",
    ),
];

pub(crate) async fn init(pool: &SqlitePool) -> Result<(), sqlx::Error> {
    sqlx::query("PRAGMA journal_mode = WAL;").execute(pool).await?;
    sqlx::query("PRAGMA foreign_keys = ON;").execute(pool).await?;

    for statement in CREATE_TABLES.split(';') {
        let statement = statement.trim();
        if statement.is_empty() {
            continue;
        }
        sqlx::query(statement).execute(pool).await?;
    }

    for (table, column, add_sql) in MIGRATIONS {
        if !has_column(pool, table, column).await? {
            sqlx::query(add_sql).execute(pool).await?;
        }
    }

    // capital_baseline is a single row, id=1; seed it once.
    sqlx::query(
        "INSERT INTO capital_baseline (id, baseline, last_updated, recovery_attempts)
         VALUES (1, '0', datetime('now'), 0)
         ON CONFLICT(id) DO NOTHING",
    )
    .execute(pool)
    .await?;

    Ok(())
}

async fn has_column(pool: &SqlitePool, table: &str, column: &str) -> Result<bool, sqlx::Error> {
    let rows = sqlx::query(&format!("PRAGMA table_info({table})")).fetch_all(pool).await?;
    Ok(rows.iter().any(|row| {
        row.try_get::<String, _>("name").map(|name| name == column).unwrap_or(false)
    }))
}
