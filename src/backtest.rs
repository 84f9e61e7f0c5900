// =============================================================================
// Backtester
// =============================================================================
//
// Replays a strategy over its recent candle history using the SAME handlers
// the live runner executes, bar by bar, filling at close-of-bar through the
// execution-cost model. The output metrics are scored against per-type
// thresholds and persisted with the config hash they were produced under;
// the deploy gate consults that pin.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::config::RegimeMultipliers;
use crate::exec_model;
use crate::instruments::InstrumentProfile;
use crate::market::Candle;
use crate::strategies::{self, HandlerState, SignalAction, StrategyKind};
use crate::types::Side;

/// Paper capital every backtest starts from.
pub const VIRTUAL_CAPITAL: f64 = 100_000.0;
/// Bar-count bounds a replay is clamped to.
pub const MIN_BARS: usize = 100;
pub const MAX_BARS: usize = 2_000;

// =============================================================================
// Metrics & thresholds
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metrics {
    pub trade_count: u64,
    /// Net P&L over virtual capital.
    pub net_return: f64,
    /// Worst peak-to-trough equity loss, as a positive percentage.
    pub max_drawdown_pct: f64,
    pub win_rate: f64,
    pub avg_win: f64,
    pub avg_loss: f64,
    /// Mean bar P&L over its stdev, annualised-ish by sqrt(bars).
    pub sharpe_like: f64,
    pub bars: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thresholds {
    pub min_trades: u64,
    pub min_net_return: f64,
    pub max_drawdown_pct: f64,
    pub min_win_rate: f64,
}

impl Thresholds {
    /// Per-type defaults; override any field per call.
    pub fn default_for(type_label: &str) -> Self {
        match type_label {
            // Grids churn often and tolerate lower per-trade edges.
            "grid" => Self {
                min_trades: 5,
                min_net_return: -0.01,
                max_drawdown_pct: 25.0,
                min_win_rate: 0.30,
            },
            "momentum" => Self {
                min_trades: 3,
                min_net_return: 0.0,
                max_drawdown_pct: 20.0,
                min_win_rate: 0.35,
            },
            "pairs" => Self {
                min_trades: 2,
                min_net_return: 0.0,
                max_drawdown_pct: 15.0,
                min_win_rate: 0.40,
            },
            _ => Self {
                min_trades: 3,
                min_net_return: 0.0,
                max_drawdown_pct: 20.0,
                min_win_rate: 0.40,
            },
        }
    }

    /// Score metrics; returns pass/fail plus human-readable notes.
    pub fn evaluate(&self, m: &Metrics) -> (bool, String) {
        let mut failures = Vec::new();
        if m.trade_count < self.min_trades {
            failures.push(format!(
                "trades {} under minimum {}",
                m.trade_count, self.min_trades
            ));
        }
        if m.net_return < self.min_net_return {
            failures.push(format!(
                "net return {:.4} under minimum {:.4}",
                m.net_return, self.min_net_return
            ));
        }
        if m.max_drawdown_pct > self.max_drawdown_pct {
            failures.push(format!(
                "max drawdown {:.2}% over limit {:.2}%",
                m.max_drawdown_pct, self.max_drawdown_pct
            ));
        }
        if m.trade_count >= self.min_trades && m.win_rate < self.min_win_rate {
            failures.push(format!(
                "win rate {:.2} under minimum {:.2}",
                m.win_rate, self.min_win_rate
            ));
        }
        if failures.is_empty() {
            (true, "all thresholds met".to_string())
        } else {
            (false, failures.join("; "))
        }
    }
}

/// Everything the boundary persists after one replay.
#[derive(Debug, Clone, Serialize)]
pub struct BacktestOutcome {
    pub metrics: Metrics,
    pub thresholds: Thresholds,
    pub passed: bool,
    pub notes: String,
}

// =============================================================================
// Replay
// =============================================================================

/// Inputs the replay needs beyond the candles themselves.
pub struct ReplayInputs<'a> {
    pub kind: &'a StrategyKind,
    pub profile: &'a InstrumentProfile,
    /// Candles of the primary (traded) symbol, oldest first.
    pub candles: &'a [Candle],
    /// Candles of the second leg for pairs strategies.
    pub candles_secondary: &'a [Candle],
    /// Source text when the strategy is custom.
    pub custom_source: Option<&'a str>,
    pub regime: RegimeMultipliers,
    pub sandbox_budget: std::time::Duration,
}

pub fn run(inputs: &ReplayInputs<'_>, thresholds: Thresholds) -> anyhow::Result<BacktestOutcome> {
    let total = inputs.candles.len().min(MAX_BARS);
    let candles = &inputs.candles[inputs.candles.len() - total..];

    let mut state = HandlerState::default();
    let mut qty = 0.0f64;
    let mut avg_cost = 0.0f64;
    let mut realized = 0.0f64;
    let mut trade_count = 0u64;
    let mut wins: Vec<f64> = Vec::new();
    let mut losses: Vec<f64> = Vec::new();
    let mut equity_curve: Vec<f64> = Vec::with_capacity(total);

    let closes_all: Vec<f64> = candles.iter().map(|c| c.close).collect();
    let closes_b_all: Vec<f64> = inputs.candles_secondary.iter().map(|c| c.close).collect();

    for i in 0..total {
        let price = closes_all[i];
        let visible = &closes_all[..=i];

        let action = match inputs.kind {
            StrategyKind::MeanReversion(cfg) => {
                strategies::mean_reversion::execute(cfg, visible).action
            }
            StrategyKind::Momentum(cfg) => {
                strategies::momentum::execute(cfg, visible, &mut state.last_momentum).action
            }
            StrategyKind::Grid(cfg) => strategies::grid::execute(cfg, price, &mut state.grid).action,
            StrategyKind::Pairs(cfg) => {
                let upto_b = closes_b_all.len().min(i + 1);
                let pairs_state = state.pairs.get_or_insert_with(Default::default);
                strategies::pairs::execute(cfg, visible, &closes_b_all[..upto_b], pairs_state).action
            }
            StrategyKind::Custom(cfg) => {
                let Some(source) = inputs.custom_source else {
                    anyhow::bail!("custom strategy replay needs its source");
                };
                match strategies::custom::execute(
                    source,
                    price,
                    visible,
                    &cfg.parameters,
                    &mut state.custom,
                    inputs.sandbox_budget,
                ) {
                    Ok(outcome) => outcome.action,
                    // A broken script earns a failed backtest, not an abort.
                    Err(_) => SignalAction::Hold,
                }
            }
        };

        if action != SignalAction::Hold {
            let side = if action == SignalAction::Buy {
                Side::Buy
            } else {
                Side::Sell
            };
            let sizing = inputs.kind.sizing();
            let notional = sizing
                .fixed_notional_usd
                .unwrap_or(VIRTUAL_CAPITAL * sizing.allocation_pct / 100.0);
            let fill_qty = (notional / price).floor().max(1.0);

            // Close-of-bar fill through the live cost model.
            let est = exec_model::estimate(
                inputs.profile,
                side,
                fill_qty,
                price,
                price,
                0.0,
                inputs.regime,
                0.0,
                0,
            );

            let signed = side.direction() * fill_qty;
            let leg_realized;
            if qty == 0.0 || qty.signum() == signed.signum() {
                avg_cost = (qty.abs() * avg_cost + fill_qty * est.fill_price)
                    / (qty.abs() + fill_qty);
                leg_realized = 0.0;
            } else {
                let close_qty = fill_qty.min(qty.abs());
                leg_realized = (est.fill_price - avg_cost) * close_qty * qty.signum();
                let new_qty = qty + signed;
                if new_qty == 0.0 {
                    avg_cost = 0.0;
                } else if new_qty.signum() != qty.signum() {
                    avg_cost = est.fill_price;
                }
            }
            qty += signed;

            let leg_net = leg_realized - est.commission - est.slippage_cost;
            realized += leg_net;
            trade_count += 1;
            if leg_realized != 0.0 {
                if leg_net >= 0.0 {
                    wins.push(leg_net);
                } else {
                    losses.push(leg_net);
                }
            }
        }

        let unrealized = qty * (price - avg_cost);
        equity_curve.push(VIRTUAL_CAPITAL + realized + unrealized);
    }

    let metrics = summarize(&equity_curve, trade_count, &wins, &losses, total);
    let (passed, notes) = thresholds.evaluate(&metrics);
    Ok(BacktestOutcome {
        metrics,
        thresholds,
        passed,
        notes,
    })
}

fn summarize(
    equity_curve: &[f64],
    trade_count: u64,
    wins: &[f64],
    losses: &[f64],
    bars: usize,
) -> Metrics {
    // Close out at the final mark for the headline return.
    let final_equity = equity_curve.last().copied().unwrap_or(VIRTUAL_CAPITAL);
    let net_return = (final_equity - VIRTUAL_CAPITAL) / VIRTUAL_CAPITAL;

    let mut peak = f64::MIN;
    let mut max_dd = 0.0f64;
    for &e in equity_curve {
        peak = peak.max(e);
        if peak > 0.0 {
            max_dd = max_dd.max((peak - e) / peak * 100.0);
        }
    }

    let closed = wins.len() + losses.len();
    let win_rate = if closed > 0 {
        wins.len() as f64 / closed as f64
    } else {
        0.0
    };
    let avg_win = if wins.is_empty() {
        0.0
    } else {
        wins.iter().sum::<f64>() / wins.len() as f64
    };
    let avg_loss = if losses.is_empty() {
        0.0
    } else {
        losses.iter().sum::<f64>() / losses.len() as f64
    };

    // Sharpe-like: mean bar-over-bar P&L over its stdev, scaled by sqrt(n).
    let sharpe_like = if equity_curve.len() > 2 {
        let diffs: Vec<f64> = equity_curve.windows(2).map(|w| w[1] - w[0]).collect();
        let mean = diffs.iter().sum::<f64>() / diffs.len() as f64;
        let var = diffs.iter().map(|d| (d - mean).powi(2)).sum::<f64>() / diffs.len() as f64;
        let sd = var.sqrt();
        if sd > 0.0 {
            mean / sd * (diffs.len() as f64).sqrt()
        } else {
            0.0
        }
    } else {
        0.0
    };

    Metrics {
        trade_count,
        net_return,
        max_drawdown_pct: max_dd,
        win_rate,
        avg_win,
        avg_loss,
        sharpe_like,
        bars,
    }
}

/// Threshold overrides accepted by the backtest endpoint.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ThresholdOverrides {
    pub min_trades: Option<u64>,
    pub min_net_return: Option<f64>,
    pub max_drawdown_pct: Option<f64>,
    pub min_win_rate: Option<f64>,
}

impl ThresholdOverrides {
    pub fn apply_to(&self, mut base: Thresholds) -> Thresholds {
        if let Some(v) = self.min_trades {
            base.min_trades = v;
        }
        if let Some(v) = self.min_net_return {
            base.min_net_return = v;
        }
        if let Some(v) = self.max_drawdown_pct {
            base.max_drawdown_pct = v;
        }
        if let Some(v) = self.min_win_rate {
            base.min_win_rate = v;
        }
        base
    }
}

/// JSON shapes persisted on the backtest row.
pub fn metrics_json(m: &Metrics) -> serde_json::Value {
    json!(m)
}

pub fn thresholds_json(t: &Thresholds) -> serde_json::Value {
    json!(t)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RegimeConfig;
    use crate::instruments::universe;
    use crate::strategies::{GridConfig, MeanReversionConfig, Sizing};
    use std::time::Duration;

    fn profile() -> InstrumentProfile {
        universe().into_iter().find(|p| p.symbol == "MERX").unwrap()
    }

    fn normal() -> RegimeMultipliers {
        RegimeConfig::default().normal
    }

    fn candle(i: usize, close: f64) -> Candle {
        Candle {
            symbol: "MERX".into(),
            interval: "1m".into(),
            open_time: (i as i64) * 60_000,
            open: close,
            high: close + 0.5,
            low: close - 0.5,
            close,
            volume: 1_000.0,
        }
    }

    /// Oscillating series that mean-reversion and grids both trade.
    fn oscillating(n: usize) -> Vec<Candle> {
        (0..n)
            .map(|i| {
                let phase = (i as f64 / 10.0).sin();
                candle(i, 100.0 + 4.0 * phase)
            })
            .collect()
    }

    #[test]
    fn grid_strategy_trades_the_oscillation() {
        let kind = StrategyKind::Grid(GridConfig {
            ticker: "MERX".into(),
            spacing_pct: 1.0,
            levels_per_side: 3,
            recenter_threshold_pct: 10.0,
            sizing: Sizing {
                fixed_notional_usd: Some(1_000.0),
                allocation_pct: 10.0,
            },
        });
        let candles = oscillating(300);
        let outcome = run(
            &ReplayInputs {
                kind: &kind,
                profile: &profile(),
                candles: &candles,
                candles_secondary: &[],
                custom_source: None,
                regime: normal(),
                sandbox_budget: Duration::from_millis(250),
            },
            Thresholds::default_for("grid"),
        )
        .unwrap();

        assert!(outcome.metrics.trade_count >= 2);
        assert_eq!(outcome.metrics.bars, 300);
        assert!(outcome.metrics.max_drawdown_pct >= 0.0);
    }

    #[test]
    fn flat_series_produces_no_trades_and_fails_minimums() {
        let kind = StrategyKind::MeanReversion(MeanReversionConfig {
            ticker: "MERX".into(),
            period: 20,
            num_std: 2.0,
            sizing: Sizing::default(),
        });
        let candles: Vec<Candle> = (0..200).map(|i| candle(i, 100.0)).collect();
        let outcome = run(
            &ReplayInputs {
                kind: &kind,
                profile: &profile(),
                candles: &candles,
                candles_secondary: &[],
                custom_source: None,
                regime: normal(),
                sandbox_budget: Duration::from_millis(250),
            },
            Thresholds::default_for("mean_reversion"),
        )
        .unwrap();

        assert_eq!(outcome.metrics.trade_count, 0);
        assert!(!outcome.passed);
        assert!(outcome.notes.contains("trades"));
    }

    #[test]
    fn replay_is_clamped_to_max_bars() {
        let kind = StrategyKind::MeanReversion(MeanReversionConfig {
            ticker: "MERX".into(),
            period: 20,
            num_std: 2.0,
            sizing: Sizing::default(),
        });
        let candles = oscillating(MAX_BARS + 500);
        let outcome = run(
            &ReplayInputs {
                kind: &kind,
                profile: &profile(),
                candles: &candles,
                candles_secondary: &[],
                custom_source: None,
                regime: normal(),
                sandbox_budget: Duration::from_millis(250),
            },
            Thresholds::default_for("mean_reversion"),
        )
        .unwrap();
        assert_eq!(outcome.metrics.bars, MAX_BARS);
    }

    #[test]
    fn threshold_overrides_take_effect() {
        let base = Thresholds::default_for("mean_reversion");
        let overrides = ThresholdOverrides {
            min_trades: Some(0),
            min_net_return: Some(-1.0),
            max_drawdown_pct: Some(100.0),
            min_win_rate: Some(0.0),
        };
        let relaxed = overrides.apply_to(base);
        assert_eq!(relaxed.min_trades, 0);

        // With fully relaxed thresholds even a do-nothing run passes.
        let m = Metrics {
            trade_count: 0,
            net_return: -0.5,
            max_drawdown_pct: 50.0,
            win_rate: 0.0,
            avg_win: 0.0,
            avg_loss: 0.0,
            sharpe_like: 0.0,
            bars: 100,
        };
        assert!(relaxed.evaluate(&m).0);
    }

    #[test]
    fn losing_costs_show_up_as_negative_return() {
        // A grid over a pure downtrend keeps buying into losses.
        let kind = StrategyKind::Grid(GridConfig {
            ticker: "MERX".into(),
            spacing_pct: 0.5,
            levels_per_side: 5,
            recenter_threshold_pct: 4.0,
            sizing: Sizing {
                fixed_notional_usd: Some(5_000.0),
                allocation_pct: 10.0,
            },
        });
        let candles: Vec<Candle> = (0..300)
            .map(|i| candle(i, 100.0 - i as f64 * 0.05))
            .collect();
        let outcome = run(
            &ReplayInputs {
                kind: &kind,
                profile: &profile(),
                candles: &candles,
                candles_secondary: &[],
                custom_source: None,
                regime: normal(),
                sandbox_budget: Duration::from_millis(250),
            },
            Thresholds::default_for("grid"),
        )
        .unwrap();
        assert!(outcome.metrics.net_return < 0.0);
        assert!(outcome.metrics.max_drawdown_pct > 0.0);
    }
}
