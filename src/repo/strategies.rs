// =============================================================================
// Repository: strategies, strategy trades, backtests, risk
// =============================================================================
//
// Strategy configs, backtest metrics and risk contexts are stored as JSON
// text; the typed shapes live with the strategy and backtest modules, and
// this layer round-trips `serde_json::Value` untouched.
// =============================================================================

use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::Value;

use crate::types::Side;

use super::{RepoResult, Repository};

// =============================================================================
// Row models
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct StrategyRow {
    pub id: String,
    pub fund_id: String,
    pub name: String,
    pub strategy_type: String,
    pub config: Value,
    pub is_active: bool,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CustomStrategyRow {
    pub id: String,
    pub fund_id: String,
    pub source: String,
    pub parameters: Value,
    pub created_at: String,
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct StrategyTradeRow {
    pub id: String,
    pub strategy_id: String,
    pub fund_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub price: f64,
    pub notional: f64,
    pub commission: f64,
    pub slippage_cost: f64,
    pub realized_pnl: f64,
    pub reason: String,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct BacktestRow {
    pub id: String,
    pub strategy_id: String,
    pub fund_id: String,
    pub config_hash: String,
    pub metrics: Value,
    pub thresholds: Value,
    pub passed: bool,
    pub notes: String,
    pub ran_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskSettings {
    pub fund_id: String,
    pub max_position_pct: f64,
    pub max_strategy_allocation_pct: f64,
    pub max_daily_drawdown_pct: f64,
    pub is_enabled: bool,
}

impl RiskSettings {
    /// Permissive defaults applied before a fund configures anything.
    pub fn default_for(fund_id: &str) -> Self {
        Self {
            fund_id: fund_id.to_string(),
            max_position_pct: 25.0,
            max_strategy_allocation_pct: 50.0,
            max_daily_drawdown_pct: 10.0,
            is_enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RiskBreach {
    pub id: String,
    pub fund_id: String,
    pub strategy_id: String,
    pub rule: String,
    pub severity: String,
    pub message: String,
    pub context: Value,
    pub attempted_order: Value,
    pub created_at: String,
}

// =============================================================================
// Row mappers
// =============================================================================

fn json_col(row: &rusqlite::Row<'_>, idx: usize) -> rusqlite::Result<Value> {
    let raw: String = row.get(idx)?;
    Ok(serde_json::from_str(&raw).unwrap_or(Value::Null))
}

fn map_strategy(row: &rusqlite::Row<'_>) -> rusqlite::Result<StrategyRow> {
    Ok(StrategyRow {
        id: row.get(0)?,
        fund_id: row.get(1)?,
        name: row.get(2)?,
        strategy_type: row.get(3)?,
        config: json_col(row, 4)?,
        is_active: row.get::<_, i64>(5)? != 0,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
    })
}

const STRATEGY_COLS: &str = "id, fund_id, name, strategy_type, config, is_active, created_at, updated_at";

fn map_custom(row: &rusqlite::Row<'_>) -> rusqlite::Result<CustomStrategyRow> {
    Ok(CustomStrategyRow {
        id: row.get(0)?,
        fund_id: row.get(1)?,
        source: row.get(2)?,
        parameters: json_col(row, 3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
    })
}

fn map_strategy_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<StrategyTradeRow> {
    Ok(StrategyTradeRow {
        id: row.get(0)?,
        strategy_id: row.get(1)?,
        fund_id: row.get(2)?,
        symbol: row.get(3)?,
        side: row
            .get::<_, String>(4)?
            .parse()
            .unwrap_or(Side::Buy),
        qty: row.get(5)?,
        price: row.get(6)?,
        notional: row.get(7)?,
        commission: row.get(8)?,
        slippage_cost: row.get(9)?,
        realized_pnl: row.get(10)?,
        reason: row.get(11)?,
        created_at: row.get(12)?,
    })
}

const STRATEGY_TRADE_COLS: &str = "id, strategy_id, fund_id, symbol, side, qty, price, notional, \
     commission, slippage_cost, realized_pnl, reason, created_at";

fn map_backtest(row: &rusqlite::Row<'_>) -> rusqlite::Result<BacktestRow> {
    Ok(BacktestRow {
        id: row.get(0)?,
        strategy_id: row.get(1)?,
        fund_id: row.get(2)?,
        config_hash: row.get(3)?,
        metrics: json_col(row, 4)?,
        thresholds: json_col(row, 5)?,
        passed: row.get::<_, i64>(6)? != 0,
        notes: row.get(7)?,
        ran_at: row.get(8)?,
    })
}

const BACKTEST_COLS: &str =
    "id, strategy_id, fund_id, config_hash, metrics, thresholds, passed, notes, ran_at";

fn map_breach(row: &rusqlite::Row<'_>) -> rusqlite::Result<RiskBreach> {
    Ok(RiskBreach {
        id: row.get(0)?,
        fund_id: row.get(1)?,
        strategy_id: row.get(2)?,
        rule: row.get(3)?,
        severity: row.get(4)?,
        message: row.get(5)?,
        context: json_col(row, 6)?,
        attempted_order: json_col(row, 7)?,
        created_at: row.get(8)?,
    })
}

// =============================================================================
// Strategies
// =============================================================================

impl Repository {
    pub fn insert_strategy(&self, s: &StrategyRow) -> RepoResult<()> {
        self.with_conn("insert_strategy", |c| {
            c.execute(
                "INSERT INTO strategies (id, fund_id, name, strategy_type, config, is_active, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    s.id,
                    s.fund_id,
                    s.name,
                    s.strategy_type,
                    s.config.to_string(),
                    s.is_active as i64,
                    s.created_at,
                    s.updated_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn update_strategy(&self, s: &StrategyRow) -> RepoResult<()> {
        self.with_conn("update_strategy", |c| {
            c.execute(
                "UPDATE strategies SET name = ?2, config = ?3, updated_at = ?4 WHERE id = ?1",
                params![s.id, s.name, s.config.to_string(), s.updated_at],
            )?;
            Ok(())
        })
    }

    pub fn set_strategy_active(&self, id: &str, active: bool, updated_at: &str) -> RepoResult<bool> {
        self.with_conn("set_strategy_active", |c| {
            let n = c.execute(
                "UPDATE strategies SET is_active = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, active as i64, updated_at],
            )?;
            Ok(n > 0)
        })
    }

    pub fn delete_strategy(&self, id: &str) -> RepoResult<bool> {
        self.with_conn("delete_strategy", |c| {
            let n = c.execute("DELETE FROM strategies WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
    }

    pub fn get_strategy(&self, id: &str) -> RepoResult<Option<StrategyRow>> {
        self.with_conn("get_strategy", |c| {
            c.query_row(
                &format!("SELECT {STRATEGY_COLS} FROM strategies WHERE id = ?1"),
                params![id],
                map_strategy,
            )
            .optional()
        })
    }

    pub fn get_strategies_by_fund(&self, fund_id: &str) -> RepoResult<Vec<StrategyRow>> {
        self.with_conn("get_strategies_by_fund", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {STRATEGY_COLS} FROM strategies WHERE fund_id = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![fund_id], map_strategy)?;
            rows.collect()
        })
    }

    /// Every active strategy across all funds; the runner's work list.
    pub fn get_active_strategies(&self) -> RepoResult<Vec<StrategyRow>> {
        self.with_conn("get_active_strategies", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {STRATEGY_COLS} FROM strategies WHERE is_active = 1 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map([], map_strategy)?;
            rows.collect()
        })
    }
}

// =============================================================================
// Custom strategies
// =============================================================================

impl Repository {
    pub fn insert_custom_strategy(&self, s: &CustomStrategyRow) -> RepoResult<()> {
        self.with_conn("insert_custom_strategy", |c| {
            c.execute(
                "INSERT INTO custom_strategies (id, fund_id, source, parameters, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    s.id,
                    s.fund_id,
                    s.source,
                    s.parameters.to_string(),
                    s.created_at,
                    s.updated_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn update_custom_strategy(&self, s: &CustomStrategyRow) -> RepoResult<()> {
        self.with_conn("update_custom_strategy", |c| {
            c.execute(
                "UPDATE custom_strategies SET source = ?2, parameters = ?3, updated_at = ?4 WHERE id = ?1",
                params![s.id, s.source, s.parameters.to_string(), s.updated_at],
            )?;
            Ok(())
        })
    }

    pub fn delete_custom_strategy(&self, id: &str) -> RepoResult<bool> {
        self.with_conn("delete_custom_strategy", |c| {
            let n = c.execute("DELETE FROM custom_strategies WHERE id = ?1", params![id])?;
            Ok(n > 0)
        })
    }

    pub fn get_custom_strategy(&self, id: &str) -> RepoResult<Option<CustomStrategyRow>> {
        self.with_conn("get_custom_strategy", |c| {
            c.query_row(
                "SELECT id, fund_id, source, parameters, created_at, updated_at
                 FROM custom_strategies WHERE id = ?1",
                params![id],
                map_custom,
            )
            .optional()
        })
    }

    pub fn get_custom_strategies_by_fund(&self, fund_id: &str) -> RepoResult<Vec<CustomStrategyRow>> {
        self.with_conn("get_custom_strategies_by_fund", |c| {
            let mut stmt = c.prepare(
                "SELECT id, fund_id, source, parameters, created_at, updated_at
                 FROM custom_strategies WHERE fund_id = ?1 ORDER BY created_at",
            )?;
            let rows = stmt.query_map(params![fund_id], map_custom)?;
            rows.collect()
        })
    }
}

// =============================================================================
// Strategy trades
// =============================================================================

impl Repository {
    pub fn insert_strategy_trade(&self, t: &StrategyTradeRow) -> RepoResult<()> {
        self.with_conn("insert_strategy_trade", |c| {
            c.execute(
                "INSERT INTO strategy_trades (id, strategy_id, fund_id, symbol, side, qty, price,
                     notional, commission, slippage_cost, realized_pnl, reason, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)",
                params![
                    t.id,
                    t.strategy_id,
                    t.fund_id,
                    t.symbol,
                    t.side.to_string(),
                    t.qty,
                    t.price,
                    t.notional,
                    t.commission,
                    t.slippage_cost,
                    t.realized_pnl,
                    t.reason,
                    t.created_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_strategy_trades(&self, strategy_id: &str, limit: usize) -> RepoResult<Vec<StrategyTradeRow>> {
        self.with_conn("get_strategy_trades", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {STRATEGY_TRADE_COLS} FROM strategy_trades WHERE strategy_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![strategy_id, limit as i64], map_strategy_trade)?;
            rows.collect()
        })
    }

    /// Oldest-first full history; the runner's hydration replay input.
    pub fn get_strategy_trades_chronological(&self) -> RepoResult<Vec<StrategyTradeRow>> {
        self.with_conn("get_strategy_trades_chronological", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {STRATEGY_TRADE_COLS} FROM strategy_trades ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt.query_map([], map_strategy_trade)?;
            rows.collect()
        })
    }

    pub fn get_strategy_trades_by_fund(&self, fund_id: &str) -> RepoResult<Vec<StrategyTradeRow>> {
        self.with_conn("get_strategy_trades_by_fund", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {STRATEGY_TRADE_COLS} FROM strategy_trades WHERE fund_id = ?1
                 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt.query_map(params![fund_id], map_strategy_trade)?;
            rows.collect()
        })
    }
}

// =============================================================================
// Backtests
// =============================================================================

impl Repository {
    pub fn insert_backtest(&self, b: &BacktestRow) -> RepoResult<()> {
        self.with_conn("insert_backtest", |c| {
            c.execute(
                "INSERT INTO backtests (id, strategy_id, fund_id, config_hash, metrics,
                     thresholds, passed, notes, ran_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    b.id,
                    b.strategy_id,
                    b.fund_id,
                    b.config_hash,
                    b.metrics.to_string(),
                    b.thresholds.to_string(),
                    b.passed as i64,
                    b.notes,
                    b.ran_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_latest_backtest(&self, strategy_id: &str) -> RepoResult<Option<BacktestRow>> {
        self.with_conn("get_latest_backtest", |c| {
            c.query_row(
                &format!(
                    "SELECT {BACKTEST_COLS} FROM backtests WHERE strategy_id = ?1
                     ORDER BY ran_at DESC, rowid DESC LIMIT 1"
                ),
                params![strategy_id],
                map_backtest,
            )
            .optional()
        })
    }

    pub fn get_backtests(&self, strategy_id: &str, limit: usize) -> RepoResult<Vec<BacktestRow>> {
        self.with_conn("get_backtests", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {BACKTEST_COLS} FROM backtests WHERE strategy_id = ?1
                 ORDER BY ran_at DESC, rowid DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![strategy_id, limit as i64], map_backtest)?;
            rows.collect()
        })
    }
}

// =============================================================================
// Risk
// =============================================================================

impl Repository {
    pub fn upsert_risk_settings(&self, s: &RiskSettings) -> RepoResult<()> {
        self.with_conn("upsert_risk_settings", |c| {
            c.execute(
                "INSERT INTO risk_settings (fund_id, max_position_pct, max_strategy_allocation_pct,
                     max_daily_drawdown_pct, is_enabled)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(fund_id) DO UPDATE SET
                     max_position_pct = excluded.max_position_pct,
                     max_strategy_allocation_pct = excluded.max_strategy_allocation_pct,
                     max_daily_drawdown_pct = excluded.max_daily_drawdown_pct,
                     is_enabled = excluded.is_enabled",
                params![
                    s.fund_id,
                    s.max_position_pct,
                    s.max_strategy_allocation_pct,
                    s.max_daily_drawdown_pct,
                    s.is_enabled as i64,
                ],
            )?;
            Ok(())
        })
    }

    /// Configured settings, or permissive defaults when the fund never set any.
    pub fn get_risk_settings(&self, fund_id: &str) -> RepoResult<RiskSettings> {
        self.with_conn("get_risk_settings", |c| {
            c.query_row(
                "SELECT fund_id, max_position_pct, max_strategy_allocation_pct,
                        max_daily_drawdown_pct, is_enabled
                 FROM risk_settings WHERE fund_id = ?1",
                params![fund_id],
                |row| {
                    Ok(RiskSettings {
                        fund_id: row.get(0)?,
                        max_position_pct: row.get(1)?,
                        max_strategy_allocation_pct: row.get(2)?,
                        max_daily_drawdown_pct: row.get(3)?,
                        is_enabled: row.get::<_, i64>(4)? != 0,
                    })
                },
            )
            .optional()
            .map(|found| found.unwrap_or_else(|| RiskSettings::default_for(fund_id)))
        })
    }

    pub fn insert_risk_breach(&self, b: &RiskBreach) -> RepoResult<()> {
        self.with_conn("insert_risk_breach", |c| {
            c.execute(
                "INSERT INTO risk_breaches (id, fund_id, strategy_id, rule, severity, message,
                     context, attempted_order, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    b.id,
                    b.fund_id,
                    b.strategy_id,
                    b.rule,
                    b.severity,
                    b.message,
                    b.context.to_string(),
                    b.attempted_order.to_string(),
                    b.created_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_risk_breaches(&self, fund_id: &str, limit: usize) -> RepoResult<Vec<RiskBreach>> {
        self.with_conn("get_risk_breaches", |c| {
            let mut stmt = c.prepare(
                "SELECT id, fund_id, strategy_id, rule, severity, message, context,
                        attempted_order, created_at
                 FROM risk_breaches WHERE fund_id = ?1
                 ORDER BY created_at DESC, rowid DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![fund_id, limit as i64], map_breach)?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::test_repo;
    use serde_json::json;

    fn strategy(id: &str, active: bool) -> StrategyRow {
        StrategyRow {
            id: id.into(),
            fund_id: "f1".into(),
            name: "mr-merx".into(),
            strategy_type: "mean_reversion".into(),
            config: json!({"ticker": "MERX", "period": 20, "numStd": 2.0}),
            is_active: active,
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn strategy_crud_roundtrips_config_json() {
        let (repo, _d) = test_repo();
        repo.insert_strategy(&strategy("s1", false)).unwrap();
        let back = repo.get_strategy("s1").unwrap().unwrap();
        assert_eq!(back.config["period"], 20);
        assert!(!back.is_active);

        repo.set_strategy_active("s1", true, "2026-01-02T00:00:00Z").unwrap();
        assert_eq!(repo.get_active_strategies().unwrap().len(), 1);

        assert!(repo.delete_strategy("s1").unwrap());
        assert!(repo.get_strategy("s1").unwrap().is_none());
    }

    #[test]
    fn latest_backtest_wins_by_recency() {
        let (repo, _d) = test_repo();
        for (i, passed) in [(1, false), (2, true)] {
            repo.insert_backtest(&BacktestRow {
                id: format!("b{i}"),
                strategy_id: "s1".into(),
                fund_id: "f1".into(),
                config_hash: format!("hash{i}"),
                metrics: json!({"net_return": 0.05}),
                thresholds: json!({"min_trades": 3}),
                passed,
                notes: String::new(),
                ran_at: format!("2026-01-0{i}T00:00:00Z"),
            })
            .unwrap();
        }
        let latest = repo.get_latest_backtest("s1").unwrap().unwrap();
        assert_eq!(latest.id, "b2");
        assert!(latest.passed);
        assert_eq!(repo.get_backtests("s1", 10).unwrap().len(), 2);
    }

    #[test]
    fn risk_settings_default_until_configured() {
        let (repo, _d) = test_repo();
        let defaults = repo.get_risk_settings("f9").unwrap();
        assert!(defaults.is_enabled);
        assert_eq!(defaults.max_position_pct, 25.0);

        repo.upsert_risk_settings(&RiskSettings {
            fund_id: "f9".into(),
            max_position_pct: 10.0,
            max_strategy_allocation_pct: 30.0,
            max_daily_drawdown_pct: 5.0,
            is_enabled: false,
        })
        .unwrap();
        let configured = repo.get_risk_settings("f9").unwrap();
        assert_eq!(configured.max_position_pct, 10.0);
        assert!(!configured.is_enabled);
    }

    #[test]
    fn strategy_trades_replay_in_order() {
        let (repo, _d) = test_repo();
        for i in 0..3 {
            repo.insert_strategy_trade(&StrategyTradeRow {
                id: format!("t{i}"),
                strategy_id: "s1".into(),
                fund_id: "f1".into(),
                symbol: "MERX".into(),
                side: Side::Buy,
                qty: 1.0,
                price: 100.0 + i as f64,
                notional: 100.0,
                commission: 1.0,
                slippage_cost: 0.5,
                realized_pnl: 0.0,
                reason: "entry".into(),
                created_at: format!("2026-01-01T00:00:0{i}Z"),
            })
            .unwrap();
        }
        let replay = repo.get_strategy_trades_chronological().unwrap();
        assert_eq!(replay.len(), 3);
        assert_eq!(replay[0].price, 100.0);
        assert_eq!(replay[2].price, 102.0);
    }
}
