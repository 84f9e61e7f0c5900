// =============================================================================
// Runtime Configuration
// =============================================================================
//
// Central configuration hub for the Meridian platform. Every tunable lives
// here so subsystems never read the environment themselves. All fields carry
// serde defaults so a partial config never fails to load; `from_env` applies
// the recognised environment overrides on top of the defaults.
// =============================================================================

use serde::{Deserialize, Serialize};
use tracing::warn;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_port() -> u16 {
    8080
}

fn default_jwt_secret() -> String {
    "meridian-dev-secret".to_string()
}

fn default_min_order_notional() -> f64 {
    1.0
}

fn default_tick_interval_ms() -> u64 {
    1_000
}

fn default_ticks_per_day() -> u64 {
    23_400 // one 6.5h trading day at 1s cadence
}

fn default_orderbook_every_n_passes() -> u64 {
    2
}

fn default_heartbeat_interval_secs() -> u64 {
    15
}

fn default_outbound_queue_depth() -> usize {
    256
}

fn default_news_min_interval_secs() -> u64 {
    45
}

fn default_news_max_interval_secs() -> u64 {
    180
}

fn default_strategy_interval_secs() -> u64 {
    30
}

fn default_nav_recompute_secs() -> u64 {
    60
}

fn default_sandbox_budget_ms() -> u64 {
    250
}

fn default_market_shock_damping() -> f64 {
    0.6
}

fn default_maintenance_margin_pct() -> f64 {
    25.0
}

fn default_db_mode() -> String {
    "direct".to_string()
}

fn default_db_direct_path() -> String {
    "meridian.db".to_string()
}

fn default_db_pooler_path() -> String {
    // Both endpoints route to the same logical database by default; the
    // pooler path exists so deployments can map a second mount/route.
    "meridian.db".to_string()
}

fn default_true() -> bool {
    true
}

fn default_db_connect_timeout_ms() -> u64 {
    5_000
}

fn default_db_retry_max_attempts() -> u32 {
    4
}

fn default_db_retry_base_ms() -> u64 {
    100
}

fn default_db_retry_max_ms() -> u64 {
    2_000
}

fn default_db_probe_cooldown_secs() -> u64 {
    30
}

// =============================================================================
// Regime configuration
// =============================================================================

/// Multipliers a market regime applies on top of instrument baselines.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct RegimeMultipliers {
    pub liquidity: f64,
    pub vol: f64,
    pub borrow: f64,
}

/// Transition behaviour and multipliers for the regime state machine.
///
/// The transition matrix is not pinned by the product requirements, so every
/// probability and dwell is exposed here. `p_*` values are per-tick
/// probabilities of leaving the named state for the named target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeConfig {
    pub normal: RegimeMultipliers,
    pub high_volatility: RegimeMultipliers,
    pub tight_liquidity: RegimeMultipliers,
    pub event_shock: RegimeMultipliers,

    /// Minimum ticks a regime persists before any transition roll.
    pub min_dwell_ticks: u64,
    /// Ticks an event-shock regime lasts before decaying back to normal.
    pub event_shock_dwell_ticks: u64,

    pub p_normal_to_high_vol: f64,
    pub p_normal_to_tight_liq: f64,
    pub p_high_vol_to_normal: f64,
    pub p_high_vol_to_tight_liq: f64,
    pub p_tight_liq_to_normal: f64,
    pub p_tight_liq_to_high_vol: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        Self {
            normal: RegimeMultipliers {
                liquidity: 1.0,
                vol: 1.0,
                borrow: 1.0,
            },
            high_volatility: RegimeMultipliers {
                liquidity: 1.4,
                vol: 2.2,
                borrow: 1.3,
            },
            tight_liquidity: RegimeMultipliers {
                liquidity: 2.0,
                vol: 1.3,
                borrow: 1.6,
            },
            event_shock: RegimeMultipliers {
                liquidity: 2.8,
                vol: 3.0,
                borrow: 2.0,
            },
            min_dwell_ticks: 120,
            event_shock_dwell_ticks: 90,
            p_normal_to_high_vol: 0.004,
            p_normal_to_tight_liq: 0.002,
            p_high_vol_to_normal: 0.010,
            p_high_vol_to_tight_liq: 0.003,
            p_tight_liq_to_normal: 0.012,
            p_tight_liq_to_high_vol: 0.004,
        }
    }
}

// =============================================================================
// Database configuration
// =============================================================================

/// Connection policy for the repository's primary/fallback endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbConfig {
    /// Preferred endpoint: "direct" or "pooler".
    #[serde(default = "default_db_mode")]
    pub connect_mode: String,

    #[serde(default = "default_db_direct_path")]
    pub direct_path: String,

    #[serde(default = "default_db_pooler_path")]
    pub pooler_path: String,

    /// Whether connectivity failures may switch the active endpoint.
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,

    #[serde(default = "default_db_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_db_retry_max_attempts")]
    pub retry_max_attempts: u32,

    #[serde(default = "default_db_retry_base_ms")]
    pub retry_base_ms: u64,

    #[serde(default = "default_db_retry_max_ms")]
    pub retry_max_ms: u64,

    /// Cooldown before probing the primary endpoint again after a failover.
    #[serde(default = "default_db_probe_cooldown_secs")]
    pub probe_cooldown_secs: u64,

    /// Recognised for parity with TLS deployments; SQLite targets ignore it.
    #[serde(default = "default_true")]
    pub ssl_reject_unauthorized: bool,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            connect_mode: default_db_mode(),
            direct_path: default_db_direct_path(),
            pooler_path: default_db_pooler_path(),
            fallback_enabled: true,
            connect_timeout_ms: default_db_connect_timeout_ms(),
            retry_max_attempts: default_db_retry_max_attempts(),
            retry_base_ms: default_db_retry_base_ms(),
            retry_max_ms: default_db_retry_max_ms(),
            probe_cooldown_secs: default_db_probe_cooldown_secs(),
            ssl_reject_unauthorized: true,
        }
    }
}

// =============================================================================
// RuntimeConfig
// =============================================================================

/// Top-level runtime configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // --- Server ---------------------------------------------------------------
    #[serde(default = "default_port")]
    pub port: u16,

    /// Secret consumed by the auth collaborator for token minting/verifying.
    #[serde(default = "default_jwt_secret")]
    pub jwt_secret: String,

    // --- Trading --------------------------------------------------------------
    /// Orders below this notional are rejected at placement time.
    #[serde(default = "default_min_order_notional")]
    pub min_order_notional: f64,

    /// Equity floor, as a percentage of gross short exposure, below which the
    /// matcher force-covers shorts.
    #[serde(default = "default_maintenance_margin_pct")]
    pub maintenance_margin_pct: f64,

    // --- Engine cadences --------------------------------------------------------
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    #[serde(default = "default_ticks_per_day")]
    pub ticks_per_day: u64,

    /// Order-book snapshots are pushed every Nth tick pass.
    #[serde(default = "default_orderbook_every_n_passes")]
    pub orderbook_every_n_passes: u64,

    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,

    /// Bound on each hub session's outbound queue; overflow disconnects.
    #[serde(default = "default_outbound_queue_depth")]
    pub outbound_queue_depth: usize,

    #[serde(default = "default_news_min_interval_secs")]
    pub news_min_interval_secs: u64,

    #[serde(default = "default_news_max_interval_secs")]
    pub news_max_interval_secs: u64,

    #[serde(default = "default_strategy_interval_secs")]
    pub strategy_interval_secs: u64,

    #[serde(default = "default_nav_recompute_secs")]
    pub nav_recompute_secs: u64,

    /// Hard wall-clock budget for one custom-strategy evaluation.
    #[serde(default = "default_sandbox_budget_ms")]
    pub sandbox_budget_ms: u64,

    /// Scale applied to market-wide news impacts before per-instrument
    /// shock betas weight them.
    #[serde(default = "default_market_shock_damping")]
    pub market_shock_damping: f64,

    /// When true, candle/news persistence pauses while the repository is
    /// unhealthy instead of queueing unboundedly.
    #[serde(default = "default_true")]
    pub pause_background_on_db_down: bool,

    // --- Subsystems -------------------------------------------------------------
    #[serde(default)]
    pub db: DbConfig,

    #[serde(default)]
    pub regime: RegimeConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        // Round-trips through serde so the default helpers stay the single
        // source of truth.
        serde_json::from_str("{}").expect("empty config must deserialize")
    }
}

impl RuntimeConfig {
    /// Build a config from defaults plus recognised environment overrides.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();

        read_env("PORT", &mut cfg.port);
        if let Ok(v) = std::env::var("JWT_SECRET") {
            if !v.is_empty() {
                cfg.jwt_secret = v;
            }
        }
        read_env("MIN_ORDER_NOTIONAL", &mut cfg.min_order_notional);
        read_env("MERIDIAN_MAINTENANCE_MARGIN_PCT", &mut cfg.maintenance_margin_pct);
        read_env("MERIDIAN_TICK_INTERVAL_MS", &mut cfg.tick_interval_ms);
        read_env("MERIDIAN_TICKS_PER_DAY", &mut cfg.ticks_per_day);
        read_env("MERIDIAN_ORDERBOOK_EVERY_N", &mut cfg.orderbook_every_n_passes);
        read_env("MERIDIAN_HEARTBEAT_SECS", &mut cfg.heartbeat_interval_secs);
        read_env("MERIDIAN_OUTBOUND_QUEUE_DEPTH", &mut cfg.outbound_queue_depth);
        read_env("MERIDIAN_NEWS_MIN_SECS", &mut cfg.news_min_interval_secs);
        read_env("MERIDIAN_NEWS_MAX_SECS", &mut cfg.news_max_interval_secs);
        read_env("MERIDIAN_STRATEGY_INTERVAL_SECS", &mut cfg.strategy_interval_secs);
        read_env("MERIDIAN_NAV_RECOMPUTE_SECS", &mut cfg.nav_recompute_secs);
        read_env("MERIDIAN_SANDBOX_BUDGET_MS", &mut cfg.sandbox_budget_ms);
        read_bool_env("PAUSE_BACKGROUND_ON_DB_DOWN", &mut cfg.pause_background_on_db_down);

        if let Ok(v) = std::env::var("DB_CONNECT_MODE") {
            match v.as_str() {
                "direct" | "pooler" => cfg.db.connect_mode = v,
                other => warn!(mode = %other, "unrecognised DB_CONNECT_MODE, keeping default"),
            }
        }
        if let Ok(v) = std::env::var("DB_DIRECT_PATH") {
            cfg.db.direct_path = v;
        }
        if let Ok(v) = std::env::var("DB_POOLER_PATH") {
            cfg.db.pooler_path = v;
        }
        read_bool_env("DB_FALLBACK_ENABLED", &mut cfg.db.fallback_enabled);
        read_env("DB_CONNECT_TIMEOUT_MS", &mut cfg.db.connect_timeout_ms);
        read_env("DB_RETRY_MAX_ATTEMPTS", &mut cfg.db.retry_max_attempts);
        read_env("DB_RETRY_BASE_MS", &mut cfg.db.retry_base_ms);
        read_env("DB_RETRY_MAX_MS", &mut cfg.db.retry_max_ms);
        read_env("DB_PROBE_COOLDOWN_SECS", &mut cfg.db.probe_cooldown_secs);
        read_bool_env("DB_SSL_REJECT_UNAUTHORIZED", &mut cfg.db.ssl_reject_unauthorized);

        cfg
    }
}

fn read_env<T: std::str::FromStr>(name: &str, slot: &mut T) {
    if let Ok(raw) = std::env::var(name) {
        match raw.parse::<T>() {
            Ok(v) => *slot = v,
            Err(_) => warn!(var = name, value = %raw, "failed to parse env override, keeping default"),
        }
    }
}

fn read_bool_env(name: &str, slot: &mut bool) {
    if let Ok(raw) = std::env::var(name) {
        match raw.to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => *slot = true,
            "0" | "false" | "no" | "off" => *slot = false,
            other => warn!(var = name, value = %other, "failed to parse boolean env override"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = RuntimeConfig::default();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.tick_interval_ms, 1_000);
        assert_eq!(cfg.db.connect_mode, "direct");
        assert!(cfg.db.fallback_enabled);
        assert!(cfg.regime.event_shock.vol > cfg.regime.normal.vol);
    }

    #[test]
    fn partial_json_deserializes_with_defaults() {
        let cfg: RuntimeConfig = serde_json::from_str(r#"{"port": 9000}"#).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.strategy_interval_secs, 30);
    }
}
