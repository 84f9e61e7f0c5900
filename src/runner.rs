// =============================================================================
// Strategy runner
// =============================================================================
//
// Periodic executor for every active strategy. Each pass: load the active
// set, run each typed handler over recent candles, turn non-hold signals
// into sized strategy trades, and keep the in-memory books (position,
// realized P&L, trade count) current.
//
// Strategy trades live in their own fund-internal ledger; they never touch
// user cash or user positions. Risk guards run against the projected
// post-trade exposure and write a risk breach instead of trading when a rule
// fails. All in-memory state is rebuilt at startup by replaying the strategy
// trade ledger chronologically.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::{RegimeConfig, RuntimeConfig};
use crate::exec_model;
use crate::instruments::InstrumentProfile;
use crate::market::regime::multipliers_for;
use crate::market::MarketEngine;
use crate::repo::{Repository, RiskBreach, StrategyRow, StrategyTradeRow};
use crate::strategies::{
    self, config_hash, HandlerState, Signal, SignalAction, StrategyKind,
};
use crate::types::Side;

const MAX_ACTIVITY_ENTRIES: usize = 200;
const CANDLE_LOOKBACK: usize = 120;

/// Per-strategy in-memory book, rebuilt by replay at startup.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StrategyBook {
    pub fund_id: String,
    pub symbol: String,
    /// Signed quantity; positive long.
    pub qty: f64,
    pub avg_cost: f64,
    pub realized_pnl: f64,
    pub trade_count: u64,
    #[serde(skip)]
    pub handler_state: HandlerState,
}

/// One line in the runner's activity ring buffer.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEntry {
    pub at: String,
    pub fund_id: String,
    pub strategy_id: String,
    pub strategy_name: String,
    /// executed | blocked | hold | error
    pub outcome: String,
    pub ticker: String,
    pub reason: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qty: Option<f64>,
}

/// Peak/trough equity tracking for the daily-drawdown guard, per fund,
/// reset on UTC day roll.
#[derive(Debug, Clone, Copy)]
struct DailyEquity {
    day: i64,
    peak: f64,
    trough: f64,
}

pub struct StrategyRunner {
    repo: Arc<Repository>,
    engine: Arc<MarketEngine>,
    instruments: HashMap<String, InstrumentProfile>,
    regime_cfg: RegimeConfig,
    sandbox_budget: Duration,
    books: RwLock<HashMap<String, StrategyBook>>,
    activity: RwLock<Vec<ActivityEntry>>,
    daily: RwLock<HashMap<String, DailyEquity>>,
}

impl StrategyRunner {
    pub fn new(
        repo: Arc<Repository>,
        engine: Arc<MarketEngine>,
        instruments: HashMap<String, InstrumentProfile>,
        cfg: &RuntimeConfig,
    ) -> Self {
        Self {
            repo,
            engine,
            instruments,
            regime_cfg: cfg.regime.clone(),
            sandbox_budget: Duration::from_millis(cfg.sandbox_budget_ms),
            books: RwLock::new(HashMap::new()),
            activity: RwLock::new(Vec::new()),
            daily: RwLock::new(HashMap::new()),
        }
    }

    // =========================================================================
    // Warm-up
    // =========================================================================

    /// Rebuild every in-memory book by replaying the strategy trade ledger
    /// in chronological order.
    pub fn hydrate(&self) -> anyhow::Result<()> {
        let trades = self.repo.get_strategy_trades_chronological()?;
        let mut books: HashMap<String, StrategyBook> = HashMap::new();
        for trade in &trades {
            let book = books.entry(trade.strategy_id.clone()).or_insert_with(|| {
                StrategyBook {
                    fund_id: trade.fund_id.clone(),
                    symbol: trade.symbol.clone(),
                    ..StrategyBook::default()
                }
            });
            let realized = apply_to_book(book, trade.side, trade.qty, trade.price);
            book.realized_pnl += realized - trade.commission - trade.slippage_cost;
            book.trade_count += 1;
        }
        let replayed = trades.len();
        let strategies = books.len();
        *self.books.write() = books;
        info!(trades = replayed, strategies, "strategy books hydrated");
        Ok(())
    }

    // =========================================================================
    // One scheduled pass
    // =========================================================================

    /// Run every active strategy once. Errors inside a single strategy are
    /// logged and recorded; they never abort the pass.
    pub fn run_pass(&self) {
        let active = match self.repo.get_active_strategies() {
            Ok(rows) => rows,
            Err(e) => {
                warn!(error = %e, "runner skipping pass, strategies unavailable");
                return;
            }
        };
        debug!(count = active.len(), "runner pass");

        for row in &active {
            if let Err(e) = self.run_strategy(row) {
                error!(strategy_id = %row.id, error = %e, "strategy execution failed");
                self.push_activity(ActivityEntry {
                    at: Utc::now().to_rfc3339(),
                    fund_id: row.fund_id.clone(),
                    strategy_id: row.id.clone(),
                    strategy_name: row.name.clone(),
                    outcome: "error".into(),
                    ticker: String::new(),
                    reason: e.to_string(),
                    qty: None,
                });
            }
        }
    }

    fn run_strategy(&self, row: &StrategyRow) -> anyhow::Result<()> {
        let kind = StrategyKind::parse(&row.strategy_type, &row.config)?;
        let ticker = kind.primary_ticker().to_string();
        if ticker.is_empty() {
            anyhow::bail!("strategy has no ticker configured");
        }

        let closes: Vec<f64> = self
            .engine
            .recent_candles(&ticker, "1m", CANDLE_LOOKBACK)
            .iter()
            .map(|c| c.close)
            .collect();
        let price = self
            .engine
            .quote(&ticker)
            .map(|t| t.price)
            .unwrap_or_default();
        if price <= 0.0 {
            anyhow::bail!("no price for {ticker}");
        }

        // Ensure a book exists before the handler borrows its state.
        {
            let mut books = self.books.write();
            books.entry(row.id.clone()).or_insert_with(|| StrategyBook {
                fund_id: row.fund_id.clone(),
                symbol: ticker.clone(),
                ..StrategyBook::default()
            });
        }

        let Some(signal) = self.dispatch(row, &kind, price, &closes)? else {
            // Blocked inside the sandbox; already recorded.
            return Ok(());
        };

        match signal.action {
            SignalAction::Hold => {
                self.push_activity(ActivityEntry {
                    at: Utc::now().to_rfc3339(),
                    fund_id: row.fund_id.clone(),
                    strategy_id: row.id.clone(),
                    strategy_name: row.name.clone(),
                    outcome: "hold".into(),
                    ticker,
                    reason: signal.reason,
                    qty: None,
                });
                Ok(())
            }
            SignalAction::Buy | SignalAction::Sell => {
                self.execute_signal(row, &kind, &signal, price)
            }
        }
    }

    /// Route to the variant's handler, lending it its persistent state.
    /// `None` means the signal was blocked (and recorded) in the sandbox.
    fn dispatch(
        &self,
        row: &StrategyRow,
        kind: &StrategyKind,
        price: f64,
        closes: &[f64],
    ) -> anyhow::Result<Option<Signal>> {
        let mut books = self.books.write();
        let book = books
            .get_mut(&row.id)
            .ok_or_else(|| anyhow::anyhow!("book missing for strategy {}", row.id))?;

        let signal = match kind {
            StrategyKind::MeanReversion(cfg) => strategies::mean_reversion::execute(cfg, closes),
            StrategyKind::Momentum(cfg) => {
                strategies::momentum::execute(cfg, closes, &mut book.handler_state.last_momentum)
            }
            StrategyKind::Grid(cfg) => {
                strategies::grid::execute(cfg, price, &mut book.handler_state.grid)
            }
            StrategyKind::Pairs(cfg) => {
                let closes_b: Vec<f64> = self
                    .engine
                    .recent_candles(&cfg.ticker_b, "1m", CANDLE_LOOKBACK)
                    .iter()
                    .map(|c| c.close)
                    .collect();
                let state = book.handler_state.pairs.get_or_insert_with(Default::default);
                strategies::pairs::execute(cfg, closes, &closes_b, state)
            }
            StrategyKind::Custom(cfg) => {
                let source_row = self
                    .repo
                    .get_custom_strategy(&cfg.custom_strategy_id)?
                    .ok_or_else(|| {
                        anyhow::anyhow!("custom strategy {} not found", cfg.custom_strategy_id)
                    })?;
                match strategies::custom::execute(
                    &source_row.source,
                    price,
                    closes,
                    &cfg.parameters,
                    &mut book.handler_state.custom,
                    self.sandbox_budget,
                ) {
                    Ok(outcome) => {
                        for line in &outcome.logs {
                            debug!(strategy_id = %row.id, line, "sandbox log");
                        }
                        Signal {
                            action: outcome.action,
                            ticker: kind.primary_ticker().to_string(),
                            reason: "custom script".to_string(),
                            data: json!({"logs": outcome.logs}),
                        }
                    }
                    // Sandbox failures block the signal; they never kill the
                    // runner.
                    Err(e) => {
                        drop(books);
                        self.push_activity(ActivityEntry {
                            at: Utc::now().to_rfc3339(),
                            fund_id: row.fund_id.clone(),
                            strategy_id: row.id.clone(),
                            strategy_name: row.name.clone(),
                            outcome: "blocked".into(),
                            ticker: kind.primary_ticker().to_string(),
                            reason: format!("sandbox: {e}"),
                            qty: None,
                        });
                        return Ok(None);
                    }
                }
            }
        };
        Ok(Some(signal))
    }

    // =========================================================================
    // Signal -> sized, guarded trade
    // =========================================================================

    fn execute_signal(
        &self,
        row: &StrategyRow,
        kind: &StrategyKind,
        signal: &Signal,
        price: f64,
    ) -> anyhow::Result<()> {
        let side = match signal.action {
            SignalAction::Buy => Side::Buy,
            SignalAction::Sell => Side::Sell,
            SignalAction::Hold => return Ok(()),
        };

        let fund_capital = self.repo.get_capital_summary(&row.fund_id)?.net_capital;
        let fund_equity = fund_capital + self.fund_pnl_inner(&row.fund_id);

        let sizing = kind.sizing();
        let target_notional = sizing
            .fixed_notional_usd
            .unwrap_or(fund_equity * sizing.allocation_pct / 100.0);
        let qty = (target_notional / price).floor().max(1.0);

        // Risk guards against the projected post-trade state.
        if let Some(breach) = self.check_risk(row, &signal.ticker, side, qty, price)? {
            let reason = breach.message.clone();
            self.repo.insert_risk_breach(&breach)?;
            self.push_activity(ActivityEntry {
                at: Utc::now().to_rfc3339(),
                fund_id: row.fund_id.clone(),
                strategy_id: row.id.clone(),
                strategy_name: row.name.clone(),
                outcome: "blocked".into(),
                ticker: signal.ticker.clone(),
                reason,
                qty: Some(qty),
            });
            return Ok(());
        }

        // Cost treatment mirrors live fills.
        let profile = self
            .instruments
            .get(&signal.ticker)
            .ok_or_else(|| anyhow::anyhow!("unknown instrument {}", signal.ticker))?;
        let mults = multipliers_for(&self.regime_cfg, self.engine.regime());
        let vol = self.engine.volatility(&signal.ticker);
        let est = exec_model::estimate(profile, side, qty, price, price, vol, mults, 0.0, 0);

        let realized = {
            let mut books = self.books.write();
            let book = books
                .get_mut(&row.id)
                .ok_or_else(|| anyhow::anyhow!("book missing for strategy {}", row.id))?;
            let realized = apply_to_book(book, side, qty, est.fill_price);
            book.realized_pnl += realized - est.commission - est.slippage_cost;
            book.trade_count += 1;
            realized
        };

        self.repo.insert_strategy_trade(&StrategyTradeRow {
            id: Uuid::new_v4().to_string(),
            strategy_id: row.id.clone(),
            fund_id: row.fund_id.clone(),
            symbol: signal.ticker.clone(),
            side,
            qty,
            price: est.fill_price,
            notional: qty * est.fill_price,
            commission: est.commission,
            slippage_cost: est.slippage_cost,
            realized_pnl: realized,
            reason: signal.reason.clone(),
            created_at: Utc::now().to_rfc3339(),
        })?;

        info!(
            strategy_id = %row.id,
            ticker = %signal.ticker,
            side = %side,
            qty,
            price = est.fill_price,
            "strategy trade booked"
        );
        self.push_activity(ActivityEntry {
            at: Utc::now().to_rfc3339(),
            fund_id: row.fund_id.clone(),
            strategy_id: row.id.clone(),
            strategy_name: row.name.clone(),
            outcome: "executed".into(),
            ticker: signal.ticker.clone(),
            reason: signal.reason.clone(),
            qty: Some(qty),
        });
        Ok(())
    }

    /// Evaluate the fund's risk rules against the projected post-trade
    /// state. Returns the breach to record when a rule fails.
    fn check_risk(
        &self,
        row: &StrategyRow,
        ticker: &str,
        side: Side,
        qty: f64,
        price: f64,
    ) -> anyhow::Result<Option<RiskBreach>> {
        let settings = self.repo.get_risk_settings(&row.fund_id)?;
        if !settings.is_enabled {
            return Ok(None);
        }

        let fund_capital = self.repo.get_capital_summary(&row.fund_id)?.net_capital;
        let signed_delta = side.direction() * qty;

        let attempted = json!({
            "ticker": ticker, "side": side, "qty": qty, "price": price,
        });
        let breach = |rule: &str, message: String, context: Value| {
            Some(RiskBreach {
                id: Uuid::new_v4().to_string(),
                fund_id: row.fund_id.clone(),
                strategy_id: row.id.clone(),
                rule: rule.to_string(),
                severity: "warning".to_string(),
                message,
                context,
                attempted_order: attempted.clone(),
                created_at: Utc::now().to_rfc3339(),
            })
        };

        let books = self.books.read();

        // Projected exposure to this symbol across the whole fund.
        let symbol_qty: f64 = books
            .values()
            .filter(|b| b.fund_id == row.fund_id && b.symbol == ticker)
            .map(|b| b.qty)
            .sum();
        let projected_symbol = (symbol_qty + signed_delta).abs() * price;
        let symbol_cap = settings.max_position_pct / 100.0 * fund_capital;
        if projected_symbol > symbol_cap {
            return Ok(breach(
                "max_position_pct",
                format!(
                    "projected {ticker} exposure {projected_symbol:.2} exceeds cap {symbol_cap:.2}"
                ),
                json!({"projected": projected_symbol, "cap": symbol_cap}),
            ));
        }

        // Projected exposure of this one strategy.
        let strategy_qty = books.get(&row.id).map(|b| b.qty).unwrap_or(0.0);
        let projected_strategy = (strategy_qty + signed_delta).abs() * price;
        let strategy_cap = settings.max_strategy_allocation_pct / 100.0 * fund_capital;
        if projected_strategy > strategy_cap {
            return Ok(breach(
                "max_strategy_allocation_pct",
                format!(
                    "projected strategy exposure {projected_strategy:.2} exceeds cap {strategy_cap:.2}"
                ),
                json!({"projected": projected_strategy, "cap": strategy_cap}),
            ));
        }
        drop(books);

        // Intra-day drawdown on fund equity, peak-to-trough within the UTC
        // day.
        let equity = fund_capital + self.fund_pnl_inner(&row.fund_id);
        let today = Utc::now().date_naive().num_days_from_ce() as i64;
        let mut daily = self.daily.write();
        let entry = daily
            .entry(row.fund_id.clone())
            .and_modify(|d| {
                if d.day != today {
                    *d = DailyEquity { day: today, peak: equity, trough: equity };
                } else {
                    d.peak = d.peak.max(equity);
                    d.trough = d.trough.min(equity);
                }
            })
            .or_insert(DailyEquity { day: today, peak: equity, trough: equity });
        let drawdown_pct = if entry.peak > 0.0 {
            (entry.peak - equity) / entry.peak * 100.0
        } else {
            0.0
        };
        if drawdown_pct > settings.max_daily_drawdown_pct {
            return Ok(breach(
                "max_daily_drawdown_pct",
                format!(
                    "daily drawdown {drawdown_pct:.2}% exceeds cap {:.2}%",
                    settings.max_daily_drawdown_pct
                ),
                json!({"drawdown_pct": drawdown_pct, "peak": entry.peak, "equity": equity}),
            ));
        }

        Ok(None)
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Realized plus marked-to-market P&L across a fund's strategies.
    pub fn fund_pnl(&self, fund_id: &str) -> f64 {
        self.fund_pnl_inner(fund_id)
    }

    fn fund_pnl_inner(&self, fund_id: &str) -> f64 {
        let books = self.books.read();
        books
            .values()
            .filter(|b| b.fund_id == fund_id)
            .map(|b| {
                let mark = self
                    .engine
                    .quote(&b.symbol)
                    .map(|t| t.price)
                    .unwrap_or(b.avg_cost);
                b.realized_pnl + b.qty * (mark - b.avg_cost)
            })
            .sum()
    }

    pub fn book(&self, strategy_id: &str) -> Option<StrategyBook> {
        self.books.read().get(strategy_id).cloned()
    }

    /// Everything a fund dashboard needs: per-strategy books plus the recent
    /// activity for that fund.
    pub fn dashboard_data(&self, fund_id: &str, strategies: &[StrategyRow]) -> Value {
        let books = self.books.read();
        let per_strategy: Vec<Value> = strategies
            .iter()
            .map(|s| {
                let book = books.get(&s.id);
                json!({
                    "strategy_id": s.id,
                    "name": s.name,
                    "type": s.strategy_type,
                    "is_active": s.is_active,
                    "position_qty": book.map(|b| b.qty).unwrap_or(0.0),
                    "avg_cost": book.map(|b| b.avg_cost).unwrap_or(0.0),
                    "realized_pnl": book.map(|b| b.realized_pnl).unwrap_or(0.0),
                    "trade_count": book.map(|b| b.trade_count).unwrap_or(0),
                })
            })
            .collect();
        drop(books);

        let activity: Vec<ActivityEntry> = self
            .activity
            .read()
            .iter()
            .filter(|a| a.fund_id == fund_id)
            .cloned()
            .collect();

        json!({
            "fund_id": fund_id,
            "pnl": self.fund_pnl_inner(fund_id),
            "strategies": per_strategy,
            "activity": activity,
        })
    }

    fn push_activity(&self, entry: ActivityEntry) {
        let mut log = self.activity.write();
        log.push(entry);
        while log.len() > MAX_ACTIVITY_ENTRIES {
            log.remove(0);
        }
    }
}

impl crate::funds::FundPnl for StrategyRunner {
    fn fund_pnl(&self, fund_id: &str) -> f64 {
        self.fund_pnl_inner(fund_id)
    }

    fn fund_daily_drawdown_pct(&self, fund_id: &str) -> f64 {
        let equity_now = {
            let capital = self
                .repo
                .get_capital_summary(fund_id)
                .map(|s| s.net_capital)
                .unwrap_or(0.0);
            capital + self.fund_pnl_inner(fund_id)
        };
        let daily = self.daily.read();
        match daily.get(fund_id) {
            Some(d) if d.peak > 0.0 => ((d.peak - equity_now) / d.peak * 100.0).max(0.0),
            _ => 0.0,
        }
    }
}

// =============================================================================
// Deploy gate
// =============================================================================

/// A typed strategy may start only with a passing backtest pinned to its
/// current config hash. Custom strategies are exempt.
pub fn deploy_gate(repo: &Repository, row: &StrategyRow) -> anyhow::Result<Result<(), String>> {
    let kind = StrategyKind::parse(&row.strategy_type, &row.config)?;
    if kind.is_custom() {
        return Ok(Ok(()));
    }

    let current_hash = config_hash(&row.config);
    let verdict = match repo.get_latest_backtest(&row.id)? {
        None => Err("no backtest on record; run a backtest before starting".to_string()),
        Some(bt) if !bt.passed => {
            Err("latest backtest failed its thresholds; fix the config and rerun".to_string())
        }
        Some(bt) if bt.config_hash != current_hash => Err(
            "config changed since the last passing backtest; rerun the backtest".to_string(),
        ),
        Some(_) => Ok(()),
    };
    Ok(verdict)
}

/// Shared position arithmetic for strategy books (the fund-internal mirror
/// of the user-ledger fill math).
fn apply_to_book(book: &mut StrategyBook, side: Side, qty: f64, price: f64) -> f64 {
    let signed = side.direction() * qty;
    let held = book.qty;
    let new_qty = held + signed;

    let realized;
    if held == 0.0 || held.signum() == signed.signum() {
        book.avg_cost = (held.abs() * book.avg_cost + qty * price) / (held.abs() + qty);
        realized = 0.0;
    } else {
        let close_qty = qty.min(held.abs());
        realized = (price - book.avg_cost) * close_qty * held.signum();
        if new_qty == 0.0 {
            book.avg_cost = 0.0;
        } else if new_qty.signum() != held.signum() {
            book.avg_cost = price;
        }
    }
    book.qty = new_qty;
    realized
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::{universe, universe_map};
    use crate::repo::{test_repo, CustomStrategyRow, RiskSettings};
    use crate::repo::funds::{tx_insert_capital_tx, CapitalTx};
    use crate::types::CapitalTxKind;

    fn setup() -> (Arc<Repository>, Arc<MarketEngine>, StrategyRunner, tempfile::TempDir) {
        let (repo, dir) = test_repo();
        let repo = Arc::new(repo);
        let cfg = RuntimeConfig::default();
        let engine = Arc::new(MarketEngine::new(
            universe(),
            cfg.regime.clone(),
            23_400,
            Some(5),
        ));
        // A few passes so quotes and 1m candles exist.
        for _ in 0..3 {
            engine.tick_pass();
        }
        let runner = StrategyRunner::new(repo.clone(), engine.clone(), universe_map(), &cfg);
        (repo, engine, runner, dir)
    }

    fn custom_always(repo: &Repository, verb: &str) -> StrategyRow {
        repo.insert_custom_strategy(&CustomStrategyRow {
            id: "cs1".into(),
            fund_id: "f1".into(),
            source: format!("\"{verb}\""),
            parameters: json!({}),
            created_at: Utc::now().to_rfc3339(),
            updated_at: Utc::now().to_rfc3339(),
        })
        .unwrap();
        let row = StrategyRow {
            id: "s1".into(),
            fund_id: "f1".into(),
            name: "always".into(),
            strategy_type: "custom".into(),
            config: json!({
                "customStrategyId": "cs1",
                "ticker": "MERX",
                "fixedNotionalUsd": 10_000.0,
            }),
            is_active: true,
            created_at: Utc::now().to_rfc3339(),
            updated_at: Utc::now().to_rfc3339(),
        };
        repo.insert_strategy(&row).unwrap();
        row
    }

    fn seed_capital(repo: &Repository, fund_id: &str, amount: f64) {
        repo.run_in_transaction("seed", |tx| {
            tx_insert_capital_tx(
                tx,
                &CapitalTx {
                    id: Uuid::new_v4().to_string(),
                    fund_id: fund_id.into(),
                    user_id: "u1".into(),
                    amount,
                    kind: CapitalTxKind::Deposit,
                    units_delta: amount,
                    nav_per_unit: 1.0,
                    nav_before: 0.0,
                    nav_after: amount,
                    created_at: Utc::now().to_rfc3339(),
                },
            )
        })
        .unwrap();
    }

    #[test]
    fn custom_buy_signal_books_a_strategy_trade() {
        let (repo, _engine, runner, _d) = setup();
        custom_always(&repo, "buy");
        seed_capital(&repo, "f1", 1_000_000.0);

        runner.run_pass();

        let trades = repo.get_strategy_trades("s1", 10).unwrap();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].side, Side::Buy);
        assert!(trades[0].qty >= 1.0);

        let book = runner.book("s1").unwrap();
        assert_eq!(book.trade_count, 1);
        assert!(book.qty > 0.0);
        // Costs already netted into the book.
        assert!(book.realized_pnl < 0.0);
    }

    #[test]
    fn risk_guard_blocks_and_records_a_breach() {
        let (repo, _engine, runner, _d) = setup();
        custom_always(&repo, "buy");
        // No capital: every exposure cap is zero.
        repo.upsert_risk_settings(&RiskSettings {
            fund_id: "f1".into(),
            max_position_pct: 25.0,
            max_strategy_allocation_pct: 50.0,
            max_daily_drawdown_pct: 10.0,
            is_enabled: true,
        })
        .unwrap();

        runner.run_pass();

        assert!(repo.get_strategy_trades("s1", 10).unwrap().is_empty());
        let breaches = repo.get_risk_breaches("f1", 10).unwrap();
        assert_eq!(breaches.len(), 1);
        assert_eq!(breaches[0].rule, "max_position_pct");

        let dash = runner.dashboard_data("f1", &repo.get_strategies_by_fund("f1").unwrap());
        let activity = dash["activity"].as_array().unwrap();
        assert!(activity.iter().any(|a| a["outcome"] == "blocked"));
    }

    #[test]
    fn disabled_risk_settings_let_trades_through() {
        let (repo, _engine, runner, _d) = setup();
        custom_always(&repo, "buy");
        repo.upsert_risk_settings(&RiskSettings {
            fund_id: "f1".into(),
            max_position_pct: 0.0,
            max_strategy_allocation_pct: 0.0,
            max_daily_drawdown_pct: 0.0,
            is_enabled: false,
        })
        .unwrap();

        runner.run_pass();
        assert_eq!(repo.get_strategy_trades("s1", 10).unwrap().len(), 1);
    }

    #[test]
    fn sandbox_error_surfaces_as_blocked_not_a_crash() {
        let (repo, _engine, runner, _d) = setup();
        repo.insert_custom_strategy(&CustomStrategyRow {
            id: "cs1".into(),
            fund_id: "f1".into(),
            source: "1 / 0".into(),
            parameters: json!({}),
            created_at: Utc::now().to_rfc3339(),
            updated_at: Utc::now().to_rfc3339(),
        })
        .unwrap();
        repo.insert_strategy(&StrategyRow {
            id: "s1".into(),
            fund_id: "f1".into(),
            name: "broken".into(),
            strategy_type: "custom".into(),
            config: json!({"customStrategyId": "cs1", "ticker": "MERX"}),
            is_active: true,
            created_at: Utc::now().to_rfc3339(),
            updated_at: Utc::now().to_rfc3339(),
        })
        .unwrap();

        runner.run_pass();

        assert!(repo.get_strategy_trades("s1", 10).unwrap().is_empty());
        let dash = runner.dashboard_data("f1", &repo.get_strategies_by_fund("f1").unwrap());
        let activity = dash["activity"].as_array().unwrap();
        assert!(activity
            .iter()
            .any(|a| a["outcome"] == "blocked" && a["reason"].as_str().unwrap().contains("sandbox")));
    }

    #[test]
    fn hydration_replays_the_ledger() {
        let (repo, _engine, runner, _d) = setup();
        for (id, side, qty, price) in [
            ("t1", Side::Buy, 10.0, 100.0),
            ("t2", Side::Buy, 10.0, 110.0),
            ("t3", Side::Sell, 20.0, 120.0),
        ] {
            repo.insert_strategy_trade(&StrategyTradeRow {
                id: id.into(),
                strategy_id: "s1".into(),
                fund_id: "f1".into(),
                symbol: "MERX".into(),
                side,
                qty,
                price,
                notional: qty * price,
                commission: 0.0,
                slippage_cost: 0.0,
                realized_pnl: 0.0,
                reason: String::new(),
                created_at: format!("2026-01-01T00:00:0{}Z", id.as_bytes()[1] - b'0'),
            })
            .unwrap();
        }

        runner.hydrate().unwrap();
        let book = runner.book("s1").unwrap();
        assert_eq!(book.qty, 0.0);
        assert_eq!(book.trade_count, 3);
        // Avg entry 105, exit 120 on 20 shares.
        assert!((book.realized_pnl - 300.0).abs() < 1e-9);
    }

    #[test]
    fn deploy_gate_requires_passing_pinned_backtest() {
        let (repo, _engine, _runner, _d) = setup();
        let row = StrategyRow {
            id: "s1".into(),
            fund_id: "f1".into(),
            name: "mr".into(),
            strategy_type: "mean_reversion".into(),
            config: json!({"ticker": "MERX", "period": 20}),
            is_active: false,
            created_at: Utc::now().to_rfc3339(),
            updated_at: Utc::now().to_rfc3339(),
        };
        repo.insert_strategy(&row).unwrap();

        // No backtest yet.
        assert!(deploy_gate(&repo, &row).unwrap().is_err());

        // Failed backtest.
        repo.insert_backtest(&crate::repo::BacktestRow {
            id: "b1".into(),
            strategy_id: "s1".into(),
            fund_id: "f1".into(),
            config_hash: config_hash(&row.config),
            metrics: json!({}),
            thresholds: json!({}),
            passed: false,
            notes: String::new(),
            ran_at: "2026-01-01T00:00:00Z".into(),
        })
        .unwrap();
        assert!(deploy_gate(&repo, &row).unwrap().is_err());

        // Passing backtest with the current hash.
        repo.insert_backtest(&crate::repo::BacktestRow {
            id: "b2".into(),
            strategy_id: "s1".into(),
            fund_id: "f1".into(),
            config_hash: config_hash(&row.config),
            metrics: json!({}),
            thresholds: json!({}),
            passed: true,
            notes: String::new(),
            ran_at: "2026-01-02T00:00:00Z".into(),
        })
        .unwrap();
        assert!(deploy_gate(&repo, &row).unwrap().is_ok());

        // Config drift invalidates the pin.
        let mut drifted = row.clone();
        drifted.config = json!({"ticker": "MERX", "period": 25});
        let err = deploy_gate(&repo, &drifted).unwrap().unwrap_err();
        assert!(err.contains("config changed"));

        // Custom strategies bypass the gate entirely.
        let custom = StrategyRow {
            strategy_type: "custom".into(),
            config: json!({"customStrategyId": "cs", "ticker": "MERX"}),
            ..row
        };
        assert!(deploy_gate(&repo, &custom).unwrap().is_ok());
    }

    #[test]
    fn book_math_mirrors_user_ledger_rules() {
        let mut book = StrategyBook::default();
        assert_eq!(apply_to_book(&mut book, Side::Buy, 10.0, 100.0), 0.0);
        assert_eq!(apply_to_book(&mut book, Side::Buy, 10.0, 110.0), 0.0);
        assert!((book.avg_cost - 105.0).abs() < 1e-9);

        let realized = apply_to_book(&mut book, Side::Sell, 20.0, 120.0);
        assert!((realized - 300.0).abs() < 1e-9);
        assert_eq!(book.qty, 0.0);
        assert_eq!(book.avg_cost, 0.0);
    }
}
