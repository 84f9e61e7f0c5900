// =============================================================================
// Database schema
// =============================================================================

use rusqlite::Connection;

/// Create every table and index if missing. Idempotent; runs at boot on the
/// active endpoint.
pub fn init_schema(conn: &Connection) -> rusqlite::Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS users (
            id TEXT PRIMARY KEY,
            username TEXT NOT NULL UNIQUE COLLATE NOCASE,
            password_hash TEXT NOT NULL,
            cash REAL NOT NULL,
            starting_cash REAL NOT NULL,
            role TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS orders (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            order_type TEXT NOT NULL,
            side TEXT NOT NULL,
            qty REAL NOT NULL,
            filled_qty REAL NOT NULL DEFAULT 0,
            limit_price REAL,
            stop_price REAL,
            trail_pct REAL,
            trail_high REAL,
            oco_group_id TEXT,
            status TEXT NOT NULL,
            reject_reason TEXT,
            created_at TEXT NOT NULL,
            cancelled_at TEXT,
            filled_at TEXT
        );
        CREATE INDEX IF NOT EXISTS idx_orders_open
            ON orders(status, symbol);
        CREATE INDEX IF NOT EXISTS idx_orders_user
            ON orders(user_id, created_at);

        CREATE TABLE IF NOT EXISTS positions (
            user_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            qty REAL NOT NULL,
            avg_cost REAL NOT NULL,
            cost_basis REAL NOT NULL,
            PRIMARY KEY (user_id, symbol)
        );

        CREATE TABLE IF NOT EXISTS trades (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            order_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            qty REAL NOT NULL,
            fill_price REAL NOT NULL,
            gross_notional REAL NOT NULL,
            commission REAL NOT NULL,
            slippage_cost REAL NOT NULL,
            borrow_cost REAL NOT NULL,
            realized_pnl REAL NOT NULL,
            regime TEXT NOT NULL,
            executed_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_trades_user
            ON trades(user_id, executed_at);

        CREATE TABLE IF NOT EXISTS candles (
            symbol TEXT NOT NULL,
            interval TEXT NOT NULL,
            open_time INTEGER NOT NULL,
            open REAL NOT NULL,
            high REAL NOT NULL,
            low REAL NOT NULL,
            close REAL NOT NULL,
            volume REAL NOT NULL,
            PRIMARY KEY (symbol, interval, open_time)
        );

        CREATE TABLE IF NOT EXISTS news_events (
            id TEXT PRIMARY KEY,
            ticker TEXT NOT NULL,
            kind TEXT NOT NULL,
            severity TEXT NOT NULL,
            headline TEXT NOT NULL,
            body TEXT NOT NULL,
            price_impact REAL NOT NULL,
            fired_at INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_news_fired
            ON news_events(fired_at DESC);

        CREATE TABLE IF NOT EXISTS funds (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            strategy_type TEXT NOT NULL,
            owner_id TEXT NOT NULL,
            description TEXT NOT NULL DEFAULT '',
            min_investment REAL NOT NULL DEFAULT 0,
            management_fee_rate REAL NOT NULL DEFAULT 0,
            performance_fee_rate REAL NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS fund_members (
            fund_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            role TEXT NOT NULL,
            joined_at TEXT NOT NULL,
            PRIMARY KEY (fund_id, user_id)
        );

        CREATE TABLE IF NOT EXISTS capital_transactions (
            id TEXT PRIMARY KEY,
            fund_id TEXT NOT NULL,
            user_id TEXT NOT NULL,
            amount REAL NOT NULL,
            kind TEXT NOT NULL,
            units_delta REAL NOT NULL,
            nav_per_unit REAL NOT NULL,
            nav_before REAL NOT NULL,
            nav_after REAL NOT NULL,
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_capital_fund
            ON capital_transactions(fund_id, created_at);

        CREATE TABLE IF NOT EXISTS nav_snapshots (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            fund_id TEXT NOT NULL,
            snapshot_at TEXT NOT NULL,
            nav REAL NOT NULL,
            nav_per_unit REAL NOT NULL,
            total_units REAL NOT NULL,
            capital REAL NOT NULL,
            pnl REAL NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_nav_fund
            ON nav_snapshots(fund_id, id DESC);

        CREATE TABLE IF NOT EXISTS strategies (
            id TEXT PRIMARY KEY,
            fund_id TEXT NOT NULL,
            name TEXT NOT NULL,
            strategy_type TEXT NOT NULL,
            config TEXT NOT NULL,
            is_active INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_strategies_fund
            ON strategies(fund_id);

        CREATE TABLE IF NOT EXISTS custom_strategies (
            id TEXT PRIMARY KEY,
            fund_id TEXT NOT NULL,
            source TEXT NOT NULL,
            parameters TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS strategy_trades (
            id TEXT PRIMARY KEY,
            strategy_id TEXT NOT NULL,
            fund_id TEXT NOT NULL,
            symbol TEXT NOT NULL,
            side TEXT NOT NULL,
            qty REAL NOT NULL,
            price REAL NOT NULL,
            notional REAL NOT NULL,
            commission REAL NOT NULL,
            slippage_cost REAL NOT NULL,
            realized_pnl REAL NOT NULL,
            reason TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_strategy_trades_strategy
            ON strategy_trades(strategy_id, created_at);
        CREATE INDEX IF NOT EXISTS idx_strategy_trades_fund
            ON strategy_trades(fund_id, created_at);

        CREATE TABLE IF NOT EXISTS backtests (
            id TEXT PRIMARY KEY,
            strategy_id TEXT NOT NULL,
            fund_id TEXT NOT NULL,
            config_hash TEXT NOT NULL,
            metrics TEXT NOT NULL,
            thresholds TEXT NOT NULL,
            passed INTEGER NOT NULL,
            notes TEXT NOT NULL DEFAULT '',
            ran_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_backtests_strategy
            ON backtests(strategy_id, ran_at DESC);

        CREATE TABLE IF NOT EXISTS risk_settings (
            fund_id TEXT PRIMARY KEY,
            max_position_pct REAL NOT NULL,
            max_strategy_allocation_pct REAL NOT NULL,
            max_daily_drawdown_pct REAL NOT NULL,
            is_enabled INTEGER NOT NULL DEFAULT 1
        );

        CREATE TABLE IF NOT EXISTS risk_breaches (
            id TEXT PRIMARY KEY,
            fund_id TEXT NOT NULL,
            strategy_id TEXT NOT NULL,
            rule TEXT NOT NULL,
            severity TEXT NOT NULL,
            message TEXT NOT NULL,
            context TEXT NOT NULL DEFAULT '{}',
            attempted_order TEXT NOT NULL DEFAULT '{}',
            created_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_breaches_fund
            ON risk_breaches(fund_id, created_at DESC);
        ",
    )
}
