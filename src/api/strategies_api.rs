// =============================================================================
// REST API: strategies, backtests, custom strategies
// =============================================================================

use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::backtest::{self, ReplayInputs, ThresholdOverrides, Thresholds};
use crate::market::regime::multipliers_for;
use crate::repo::{BacktestRow, CustomStrategyRow, StrategyRow};
use crate::runner::deploy_gate;
use crate::strategies::{config_hash, custom, StrategyKind};
use crate::types::FundRole;

use super::auth::AuthUser;
use super::error::{ApiError, ApiResult};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route(
            "/api/funds/:id/strategies",
            post(create_strategy).get(list_strategies),
        )
        .route("/api/funds/:id/dashboard", get(fund_dashboard))
        .route(
            "/api/strategies/:id",
            get(get_strategy).put(update_strategy).delete(delete_strategy),
        )
        .route("/api/strategies/:id/start", post(start_strategy))
        .route("/api/strategies/:id/stop", post(stop_strategy))
        .route("/api/strategies/:id/backtest", post(run_backtest))
        .route("/api/strategies/:id/backtests", get(list_backtests))
        .route("/api/strategies/:id/trades", get(strategy_trades))
        .route(
            "/api/custom-strategies",
            post(create_custom).get(list_custom),
        )
        .route(
            "/api/custom-strategies/:id",
            get(get_custom).put(update_custom).delete(delete_custom),
        )
        .route("/api/custom-strategies/:id/test", post(test_custom))
}

// =============================================================================
// Access helpers
// =============================================================================

/// Owners and analysts manage strategies; clients only observe.
fn require_manager(state: &AppState, fund_id: &str, user_id: &str) -> ApiResult<()> {
    let member = state
        .repo
        .get_member(fund_id, user_id)?
        .ok_or_else(|| ApiError::forbidden("not a member of this fund"))?;
    if member.role == FundRole::Client {
        return Err(ApiError::forbidden("fund owner or analyst required"));
    }
    Ok(())
}

fn require_member(state: &AppState, fund_id: &str, user_id: &str) -> ApiResult<()> {
    state
        .repo
        .get_member(fund_id, user_id)?
        .ok_or_else(|| ApiError::forbidden("not a member of this fund"))?;
    Ok(())
}

fn load_strategy(state: &AppState, id: &str) -> ApiResult<StrategyRow> {
    state
        .repo
        .get_strategy(id)?
        .ok_or_else(|| ApiError::not_found("strategy not found"))
}

// =============================================================================
// Strategy CRUD
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct StrategyReq {
    name: String,
    #[serde(rename = "type")]
    strategy_type: String,
    config: Value,
}

async fn create_strategy(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(fund_id): Path<String>,
    Json(req): Json<StrategyReq>,
) -> ApiResult<Json<Value>> {
    require_manager(&state, &fund_id, &principal.user_id)?;
    if state.repo.get_fund(&fund_id)?.is_none() {
        return Err(ApiError::not_found("fund not found"));
    }
    // Shape-check the config against its type up front.
    let kind = StrategyKind::parse(&req.strategy_type, &req.config)
        .map_err(|e| ApiError::invalid(e.to_string()))?;
    validate_tickers(&state, &kind)?;

    let now = Utc::now().to_rfc3339();
    let row = StrategyRow {
        id: Uuid::new_v4().to_string(),
        fund_id,
        name: req.name.trim().to_string(),
        strategy_type: req.strategy_type,
        config: req.config,
        is_active: false,
        created_at: now.clone(),
        updated_at: now,
    };
    if row.name.is_empty() || row.name.len() > 80 {
        return Err(ApiError::invalid("strategy name must be 1-80 characters"));
    }
    state.repo.insert_strategy(&row)?;
    info!(strategy_id = %row.id, fund_id = %row.fund_id, "strategy created");
    Ok(Json(json!({"strategy": row, "configHash": config_hash(&row.config)})))
}

fn validate_tickers(state: &AppState, kind: &StrategyKind) -> ApiResult<()> {
    let mut tickers = vec![kind.primary_ticker().to_string()];
    if let StrategyKind::Pairs(cfg) = kind {
        tickers.push(cfg.ticker_b.clone());
    }
    for t in tickers {
        if t.is_empty() || !state.instruments.contains_key(&t) {
            return Err(ApiError::invalid(format!("unknown ticker {t:?} in config")));
        }
    }
    Ok(())
}

async fn list_strategies(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(fund_id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_member(&state, &fund_id, &principal.user_id)?;
    let rows = state.repo.get_strategies_by_fund(&fund_id)?;
    Ok(Json(json!({"strategies": rows})))
}

async fn fund_dashboard(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(fund_id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_member(&state, &fund_id, &principal.user_id)?;
    let rows = state.repo.get_strategies_by_fund(&fund_id)?;
    Ok(Json(state.runner.dashboard_data(&fund_id, &rows)))
}

async fn get_strategy(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let row = load_strategy(&state, &id)?;
    require_member(&state, &row.fund_id, &principal.user_id)?;
    Ok(Json(json!({
        "strategy": row,
        "configHash": config_hash(&row.config),
        "book": state.runner.book(&id),
    })))
}

#[derive(Deserialize)]
struct StrategyUpdateReq {
    name: Option<String>,
    config: Option<Value>,
}

async fn update_strategy(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<StrategyUpdateReq>,
) -> ApiResult<Json<Value>> {
    let mut row = load_strategy(&state, &id)?;
    require_manager(&state, &row.fund_id, &principal.user_id)?;
    if row.is_active {
        return Err(ApiError::invalid("stop the strategy before editing it"));
    }

    if let Some(name) = req.name {
        let name = name.trim().to_string();
        if name.is_empty() || name.len() > 80 {
            return Err(ApiError::invalid("strategy name must be 1-80 characters"));
        }
        row.name = name;
    }
    if let Some(config) = req.config {
        let kind = StrategyKind::parse(&row.strategy_type, &config)
            .map_err(|e| ApiError::invalid(e.to_string()))?;
        validate_tickers(&state, &kind)?;
        row.config = config;
    }
    row.updated_at = Utc::now().to_rfc3339();
    state.repo.update_strategy(&row)?;
    Ok(Json(json!({"strategy": row, "configHash": config_hash(&row.config)})))
}

async fn delete_strategy(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let row = load_strategy(&state, &id)?;
    require_manager(&state, &row.fund_id, &principal.user_id)?;
    if row.is_active {
        return Err(ApiError::invalid("stop the strategy before deleting it"));
    }
    state.repo.delete_strategy(&id)?;
    Ok(Json(json!({"deleted": true})))
}

// =============================================================================
// Start / stop
// =============================================================================

async fn start_strategy(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let row = load_strategy(&state, &id)?;
    require_manager(&state, &row.fund_id, &principal.user_id)?;

    // The deploy gate: a passing backtest pinned to the current config.
    if let Err(reason) = deploy_gate(&state.repo, &row)? {
        return Err(ApiError::invalid(reason));
    }

    state
        .repo
        .set_strategy_active(&id, true, &Utc::now().to_rfc3339())?;
    info!(strategy_id = %id, "strategy started");
    Ok(Json(json!({"started": true})))
}

async fn stop_strategy(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let row = load_strategy(&state, &id)?;
    require_manager(&state, &row.fund_id, &principal.user_id)?;
    state
        .repo
        .set_strategy_active(&id, false, &Utc::now().to_rfc3339())?;
    info!(strategy_id = %id, "strategy stopped");
    Ok(Json(json!({"stopped": true})))
}

// =============================================================================
// Backtests
// =============================================================================

#[derive(Deserialize, Default)]
struct BacktestReq {
    limit: Option<usize>,
    #[serde(default)]
    thresholds: ThresholdOverrides,
}

async fn run_backtest(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<BacktestReq>>,
) -> ApiResult<Json<Value>> {
    let row = load_strategy(&state, &id)?;
    require_manager(&state, &row.fund_id, &principal.user_id)?;

    let req = body.map(|Json(b)| b).unwrap_or_default();
    let kind = StrategyKind::parse(&row.strategy_type, &row.config)
        .map_err(|e| ApiError::invalid(e.to_string()))?;
    let ticker = kind.primary_ticker().to_string();
    let profile = state
        .instruments
        .get(&ticker)
        .ok_or_else(|| ApiError::invalid(format!("unknown ticker {ticker}")))?;

    let limit = req
        .limit
        .unwrap_or(500)
        .clamp(backtest::MIN_BARS, backtest::MAX_BARS);
    let mut candles = state.repo.get_candles(&ticker, "1m", limit)?;
    if candles.len() < backtest::MIN_BARS {
        candles = state.engine.recent_candles(&ticker, "1m", limit);
    }
    if candles.len() < backtest::MIN_BARS {
        return Err(ApiError::invalid(format!(
            "not enough candle history to backtest ({} bars, need {})",
            candles.len(),
            backtest::MIN_BARS
        )));
    }
    let candles_secondary = match &kind {
        StrategyKind::Pairs(cfg) => {
            let mut rows = state.repo.get_candles(&cfg.ticker_b, "1m", limit)?;
            if rows.len() < backtest::MIN_BARS {
                rows = state.engine.recent_candles(&cfg.ticker_b, "1m", limit);
            }
            rows
        }
        _ => Vec::new(),
    };
    let custom_source = match &kind {
        StrategyKind::Custom(cfg) => Some(
            state
                .repo
                .get_custom_strategy(&cfg.custom_strategy_id)?
                .ok_or_else(|| ApiError::not_found("custom strategy source not found"))?
                .source,
        ),
        _ => None,
    };

    let thresholds = req
        .thresholds
        .apply_to(Thresholds::default_for(&row.strategy_type));
    let outcome = backtest::run(
        &ReplayInputs {
            kind: &kind,
            profile,
            candles: &candles,
            candles_secondary: &candles_secondary,
            custom_source: custom_source.as_deref(),
            regime: multipliers_for(&state.config.regime, state.engine.regime()),
            sandbox_budget: Duration::from_millis(state.config.sandbox_budget_ms),
        },
        thresholds,
    )?;

    let record = BacktestRow {
        id: Uuid::new_v4().to_string(),
        strategy_id: row.id.clone(),
        fund_id: row.fund_id.clone(),
        config_hash: config_hash(&row.config),
        metrics: backtest::metrics_json(&outcome.metrics),
        thresholds: backtest::thresholds_json(&outcome.thresholds),
        passed: outcome.passed,
        notes: outcome.notes.clone(),
        ran_at: Utc::now().to_rfc3339(),
    };
    state.repo.insert_backtest(&record)?;
    info!(
        strategy_id = %row.id,
        passed = outcome.passed,
        trades = outcome.metrics.trade_count,
        "backtest complete"
    );
    Ok(Json(json!({"backtest": record})))
}

async fn list_backtests(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let row = load_strategy(&state, &id)?;
    require_member(&state, &row.fund_id, &principal.user_id)?;
    Ok(Json(json!({"backtests": state.repo.get_backtests(&id, 20)?})))
}

#[derive(Deserialize)]
struct TradesQuery {
    limit: Option<usize>,
}

async fn strategy_trades(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Query(q): Query<TradesQuery>,
) -> ApiResult<Json<Value>> {
    let row = load_strategy(&state, &id)?;
    require_member(&state, &row.fund_id, &principal.user_id)?;
    let limit = q.limit.unwrap_or(100).clamp(1, 500);
    Ok(Json(json!({"trades": state.repo.get_strategy_trades(&id, limit)?})))
}

// =============================================================================
// Custom strategies
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomReq {
    fund_id: String,
    source: String,
    #[serde(default)]
    parameters: Value,
}

async fn create_custom(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<CustomReq>,
) -> ApiResult<Json<Value>> {
    require_manager(&state, &req.fund_id, &principal.user_id)?;
    if req.source.trim().is_empty() || req.source.len() > 20_000 {
        return Err(ApiError::invalid("source must be non-empty and under 20k characters"));
    }
    let now = Utc::now().to_rfc3339();
    let row = CustomStrategyRow {
        id: Uuid::new_v4().to_string(),
        fund_id: req.fund_id,
        source: req.source,
        parameters: if req.parameters.is_null() {
            json!({})
        } else {
            req.parameters
        },
        created_at: now.clone(),
        updated_at: now,
    };
    state.repo.insert_custom_strategy(&row)?;
    Ok(Json(json!({"customStrategy": row})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CustomListQuery {
    fund_id: String,
}

async fn list_custom(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Query(q): Query<CustomListQuery>,
) -> ApiResult<Json<Value>> {
    require_member(&state, &q.fund_id, &principal.user_id)?;
    Ok(Json(json!({
        "customStrategies": state.repo.get_custom_strategies_by_fund(&q.fund_id)?,
    })))
}

fn load_custom(state: &AppState, id: &str) -> ApiResult<CustomStrategyRow> {
    state
        .repo
        .get_custom_strategy(id)?
        .ok_or_else(|| ApiError::not_found("custom strategy not found"))
}

async fn get_custom(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let row = load_custom(&state, &id)?;
    require_member(&state, &row.fund_id, &principal.user_id)?;
    Ok(Json(json!({"customStrategy": row})))
}

#[derive(Deserialize)]
struct CustomUpdateReq {
    source: Option<String>,
    parameters: Option<Value>,
}

async fn update_custom(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CustomUpdateReq>,
) -> ApiResult<Json<Value>> {
    let mut row = load_custom(&state, &id)?;
    require_manager(&state, &row.fund_id, &principal.user_id)?;
    if let Some(source) = req.source {
        if source.trim().is_empty() || source.len() > 20_000 {
            return Err(ApiError::invalid("source must be non-empty and under 20k characters"));
        }
        row.source = source;
    }
    if let Some(parameters) = req.parameters {
        row.parameters = parameters;
    }
    row.updated_at = Utc::now().to_rfc3339();
    state.repo.update_custom_strategy(&row)?;
    Ok(Json(json!({"customStrategy": row})))
}

async fn delete_custom(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let row = load_custom(&state, &id)?;
    require_manager(&state, &row.fund_id, &principal.user_id)?;
    state.repo.delete_custom_strategy(&id)?;
    Ok(Json(json!({"deleted": true})))
}

#[derive(Deserialize)]
struct CustomTestReq {
    ticker: Option<String>,
    #[serde(default)]
    parameters: Option<Value>,
}

/// Dry-run a custom script against live candles; nothing is persisted.
async fn test_custom(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    body: Option<Json<CustomTestReq>>,
) -> ApiResult<Json<Value>> {
    let row = load_custom(&state, &id)?;
    require_member(&state, &row.fund_id, &principal.user_id)?;

    let req = body.map(|Json(b)| b).unwrap_or(CustomTestReq {
        ticker: None,
        parameters: None,
    });
    let ticker = req.ticker.unwrap_or_else(|| "MERX".to_string());
    let price = state
        .engine
        .quote(&ticker)
        .map(|t| t.price)
        .ok_or_else(|| ApiError::invalid(format!("unknown ticker {ticker}")))?;
    let closes: Vec<f64> = state
        .engine
        .recent_candles(&ticker, "1m", 120)
        .iter()
        .map(|c| c.close)
        .collect();
    let parameters = req.parameters.unwrap_or_else(|| row.parameters.clone());

    let mut scratch_state = std::collections::HashMap::new();
    let result = custom::execute(
        &row.source,
        price,
        &closes,
        &parameters,
        &mut scratch_state,
        Duration::from_millis(state.config.sandbox_budget_ms),
    );

    match result {
        Ok(outcome) => Ok(Json(json!({
            "ok": true,
            "signal": outcome.action,
            "logs": outcome.logs,
            "state": scratch_state,
        }))),
        Err(e) => Ok(Json(json!({"ok": false, "error": e.to_string()}))),
    }
}
