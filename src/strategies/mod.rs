// =============================================================================
// Typed strategies
// =============================================================================
//
// One tagged union over every strategy the platform runs, with one handler
// per variant. Handlers are pure over the candle history and their own
// per-(fund, symbol) state; the runner owns scheduling, sizing and risk.
//
// A strategy's config hash is a SHA-256 over its canonicalised (key-sorted)
// JSON config. Backtest results pin the hash they were produced under, and
// the deploy gate refuses a start when the live config no longer matches.
// =============================================================================

pub mod custom;
pub mod grid;
pub mod mean_reversion;
pub mod momentum;
pub mod pairs;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

pub use grid::GridState;
pub use pairs::PairsState;

/// What a handler wants done this pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

/// Handler output. `data` carries handler-specific diagnostics for the
/// activity log.
#[derive(Debug, Clone, Serialize)]
pub struct Signal {
    pub action: SignalAction,
    pub ticker: String,
    pub reason: String,
    pub data: Value,
}

impl Signal {
    pub fn hold(ticker: &str, reason: impl Into<String>) -> Self {
        Self {
            action: SignalAction::Hold,
            ticker: ticker.to_string(),
            reason: reason.into(),
            data: Value::Null,
        }
    }
}

// =============================================================================
// Sizing shared by every config
// =============================================================================

fn default_allocation_pct() -> f64 {
    10.0
}

/// How a non-hold signal is turned into a quantity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sizing {
    /// Absolute dollar size per trade; takes precedence when present.
    #[serde(
        rename = "fixedNotionalUsd",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub fixed_notional_usd: Option<f64>,
    /// Percentage of fund equity per trade, used when no fixed notional.
    #[serde(rename = "allocationPct", default = "default_allocation_pct")]
    pub allocation_pct: f64,
}

impl Default for Sizing {
    fn default() -> Self {
        Self {
            fixed_notional_usd: None,
            allocation_pct: default_allocation_pct(),
        }
    }
}

// =============================================================================
// Per-type configs
// =============================================================================

fn default_period() -> usize {
    20
}

fn default_num_std() -> f64 {
    2.0
}

fn default_lookback() -> usize {
    14
}

fn default_grid_levels() -> usize {
    3
}

fn default_grid_spacing_pct() -> f64 {
    1.0
}

fn default_recenter_threshold_pct() -> f64 {
    5.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeanReversionConfig {
    pub ticker: String,
    #[serde(default = "default_period")]
    pub period: usize,
    #[serde(default = "default_num_std")]
    pub num_std: f64,
    #[serde(flatten)]
    pub sizing: Sizing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentumConfig {
    pub ticker: String,
    #[serde(default = "default_lookback")]
    pub lookback: usize,
    #[serde(flatten)]
    pub sizing: Sizing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridConfig {
    pub ticker: String,
    #[serde(default = "default_grid_spacing_pct")]
    pub spacing_pct: f64,
    #[serde(default = "default_grid_levels")]
    pub levels_per_side: usize,
    #[serde(default = "default_recenter_threshold_pct")]
    pub recenter_threshold_pct: f64,
    #[serde(flatten)]
    pub sizing: Sizing,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PairsConfig {
    pub ticker_a: String,
    pub ticker_b: String,
    #[serde(default = "default_period")]
    pub lookback: usize,
    #[serde(default = "default_num_std")]
    pub num_std: f64,
    #[serde(flatten)]
    pub sizing: Sizing,
}

/// Typed row carried by strategies of type `custom`: the id of the source
/// row plus the parameter values bound into the sandbox.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CustomConfig {
    #[serde(rename = "customStrategyId")]
    pub custom_strategy_id: String,
    #[serde(default)]
    pub parameters: Value,
    #[serde(default)]
    pub ticker: Option<String>,
    #[serde(flatten)]
    pub sizing: Sizing,
}

// =============================================================================
// The tagged union
// =============================================================================

#[derive(Debug, Clone)]
pub enum StrategyKind {
    MeanReversion(MeanReversionConfig),
    Momentum(MomentumConfig),
    Grid(GridConfig),
    Pairs(PairsConfig),
    Custom(CustomConfig),
}

impl StrategyKind {
    /// Parse the persisted (type label, config JSON) pair.
    pub fn parse(type_label: &str, config: &Value) -> anyhow::Result<Self> {
        let kind = match type_label {
            "mean_reversion" => Self::MeanReversion(serde_json::from_value(config.clone())?),
            "momentum" => Self::Momentum(serde_json::from_value(config.clone())?),
            "grid" => Self::Grid(serde_json::from_value(config.clone())?),
            "pairs" => Self::Pairs(serde_json::from_value(config.clone())?),
            "custom" => Self::Custom(serde_json::from_value(config.clone())?),
            other => anyhow::bail!("unknown strategy type: {other}"),
        };
        Ok(kind)
    }

    pub fn type_label(&self) -> &'static str {
        match self {
            Self::MeanReversion(_) => "mean_reversion",
            Self::Momentum(_) => "momentum",
            Self::Grid(_) => "grid",
            Self::Pairs(_) => "pairs",
            Self::Custom(_) => "custom",
        }
    }

    /// The symbol the strategy trades (pairs trade leg A).
    pub fn primary_ticker(&self) -> &str {
        match self {
            Self::MeanReversion(c) => &c.ticker,
            Self::Momentum(c) => &c.ticker,
            Self::Grid(c) => &c.ticker,
            Self::Pairs(c) => &c.ticker_a,
            Self::Custom(c) => c.ticker.as_deref().unwrap_or(""),
        }
    }

    pub fn sizing(&self) -> &Sizing {
        match self {
            Self::MeanReversion(c) => &c.sizing,
            Self::Momentum(c) => &c.sizing,
            Self::Grid(c) => &c.sizing,
            Self::Pairs(c) => &c.sizing,
            Self::Custom(c) => &c.sizing,
        }
    }

    /// Custom strategies skip the backtest deploy gate.
    pub fn is_custom(&self) -> bool {
        matches!(self, Self::Custom(_))
    }
}

// =============================================================================
// Mutable per-strategy state the runner owns between passes
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HandlerState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub grid: Option<GridState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pairs: Option<PairsState>,
    /// Previous momentum reading, for zero-crossover detection.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_momentum: Option<f64>,
    /// Key/value store exposed to the custom sandbox as `state`.
    #[serde(default, skip_serializing_if = "std::collections::HashMap::is_empty")]
    pub custom: std::collections::HashMap<String, f64>,
}

// =============================================================================
// Config hashing
// =============================================================================

/// Deterministic digest over the canonical (recursively key-sorted, compact)
/// JSON form of a config.
pub fn config_hash(config: &Value) -> String {
    let canonical = canonicalize(config);
    let mut hasher = Sha256::new();
    hasher.update(canonical.as_bytes());
    hex::encode(hasher.finalize())
}

fn canonicalize(v: &Value) -> String {
    match v {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let inner: Vec<String> = keys
                .into_iter()
                .map(|k| {
                    format!(
                        "{}:{}",
                        serde_json::to_string(k).unwrap_or_default(),
                        canonicalize(&map[k])
                    )
                })
                .collect();
            format!("{{{}}}", inner.join(","))
        }
        Value::Array(items) => {
            let inner: Vec<String> = items.iter().map(canonicalize).collect();
            format!("[{}]", inner.join(","))
        }
        other => other.to_string(),
    }
}

// =============================================================================
// Shared math
// =============================================================================

/// Simple moving average over the last `period` values; `None` when the
/// window is not yet full.
pub fn sma(values: &[f64], period: usize) -> Option<f64> {
    if period == 0 || values.len() < period {
        return None;
    }
    Some(values[values.len() - period..].iter().sum::<f64>() / period as f64)
}

/// Population standard deviation over the last `period` values.
pub fn stdev(values: &[f64], period: usize) -> Option<f64> {
    let mean = sma(values, period)?;
    let window = &values[values.len() - period..];
    let var = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / period as f64;
    Some(var.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn config_hash_ignores_key_order() {
        let a = json!({"ticker": "MERX", "period": 20, "numStd": 2.0});
        let b = json!({"numStd": 2.0, "period": 20, "ticker": "MERX"});
        assert_eq!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn config_hash_changes_with_values() {
        let a = json!({"ticker": "MERX", "period": 20});
        let b = json!({"ticker": "MERX", "period": 21});
        assert_ne!(config_hash(&a), config_hash(&b));
    }

    #[test]
    fn parse_dispatches_on_type_label() {
        let cfg = json!({"ticker": "MERX", "period": 10});
        let kind = StrategyKind::parse("mean_reversion", &cfg).unwrap();
        assert_eq!(kind.type_label(), "mean_reversion");
        assert_eq!(kind.primary_ticker(), "MERX");

        assert!(StrategyKind::parse("martingale", &cfg).is_err());
    }

    #[test]
    fn sizing_defaults_apply() {
        let cfg: MeanReversionConfig = serde_json::from_value(json!({"ticker": "MERX"})).unwrap();
        assert_eq!(cfg.period, 20);
        assert_eq!(cfg.sizing.allocation_pct, 10.0);
        assert!(cfg.sizing.fixed_notional_usd.is_none());
    }

    #[test]
    fn sma_and_stdev_windows() {
        let vals = [1.0, 2.0, 3.0, 4.0, 5.0];
        assert_eq!(sma(&vals, 5), Some(3.0));
        assert_eq!(sma(&vals, 2), Some(4.5));
        assert_eq!(sma(&vals, 6), None);
        let sd = stdev(&vals, 5).unwrap();
        assert!((sd - 2.0f64.sqrt()).abs() < 1e-9);
    }
}
