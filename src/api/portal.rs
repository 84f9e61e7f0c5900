// =============================================================================
// REST API: client portal
// =============================================================================
//
// Read-only investor views, all derived from the units/NAV history and the
// runner's dashboard accessor. Every endpoint takes `?fund_id=` and requires
// membership in that fund (clients included).
// =============================================================================

use std::sync::Arc;

use axum::extract::{Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::app_state::AppState;

use super::auth::AuthUser;
use super::error::{ApiError, ApiResult};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/client-portal/allocation", get(allocation))
        .route("/api/client-portal/performance", get(performance))
        .route("/api/client-portal/transactions", get(transactions))
        .route("/api/client-portal/statements", get(statements))
        .route("/api/client-portal/fund-summary", get(fund_summary))
        .route("/api/client-portal/strategies", get(strategies))
}

#[derive(Deserialize)]
struct PortalQuery {
    fund_id: String,
}

fn require_member(state: &AppState, fund_id: &str, user_id: &str) -> ApiResult<()> {
    state
        .repo
        .get_member(fund_id, user_id)?
        .ok_or_else(|| ApiError::forbidden("not a member of this fund"))?;
    Ok(())
}

async fn allocation(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Query(q): Query<PortalQuery>,
) -> ApiResult<Json<Value>> {
    require_member(&state, &q.fund_id, &principal.user_id)?;
    let nav = state.ledger.nav_view(&q.fund_id)?;
    let holdings = state.repo.get_investor_holdings(&q.fund_id)?;
    let mine = holdings.iter().find(|h| h.user_id == principal.user_id);

    let units = mine.map(|h| h.units).unwrap_or(0.0);
    Ok(Json(json!({
        "fund_id": q.fund_id,
        "units": units,
        "net_contributed": mine.map(|h| h.net_capital).unwrap_or(0.0),
        "value": units * nav.nav_per_unit,
        "share_pct": if nav.total_units > 0.0 {
            units / nav.total_units * 100.0
        } else {
            0.0
        },
        "nav_per_unit": nav.nav_per_unit,
    })))
}

async fn performance(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Query(q): Query<PortalQuery>,
) -> ApiResult<Json<Value>> {
    require_member(&state, &q.fund_id, &principal.user_id)?;
    let nav = state.ledger.nav_view(&q.fund_id)?;
    let mut history = state.repo.get_recent_nav(&q.fund_id, 200)?;
    history.reverse(); // oldest first for charting

    let series: Vec<Value> = history
        .iter()
        .map(|s| {
            json!({
                "at": s.snapshot_at,
                "nav": s.nav,
                "nav_per_unit": s.nav_per_unit,
            })
        })
        .collect();

    let inception_return_pct = history
        .first()
        .filter(|s| s.nav_per_unit > 0.0)
        .map(|s| (nav.nav_per_unit / s.nav_per_unit - 1.0) * 100.0)
        .unwrap_or(0.0);

    Ok(Json(json!({
        "fund_id": q.fund_id,
        "current": nav,
        "series": series,
        "inception_return_pct": inception_return_pct,
    })))
}

async fn transactions(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Query(q): Query<PortalQuery>,
) -> ApiResult<Json<Value>> {
    require_member(&state, &q.fund_id, &principal.user_id)?;
    let txs = state
        .repo
        .get_capital_txs_by_user(&q.fund_id, &principal.user_id)?;
    Ok(Json(json!({"transactions": txs})))
}

async fn statements(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Query(q): Query<PortalQuery>,
) -> ApiResult<Json<Value>> {
    require_member(&state, &q.fund_id, &principal.user_id)?;
    let stmts = state.ledger.statements(&q.fund_id, &principal.user_id)?;
    Ok(Json(json!({"statements": stmts})))
}

async fn fund_summary(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Query(q): Query<PortalQuery>,
) -> ApiResult<Json<Value>> {
    require_member(&state, &q.fund_id, &principal.user_id)?;
    let fund = state
        .repo
        .get_fund(&q.fund_id)?
        .ok_or_else(|| ApiError::not_found("fund not found"))?;
    let nav = state.ledger.nav_view(&q.fund_id)?;
    let members = state.repo.get_members(&q.fund_id)?;
    let strategies = state.repo.get_strategies_by_fund(&q.fund_id)?;

    Ok(Json(json!({
        "fund": fund,
        "nav": nav,
        "member_count": members.len(),
        "strategy_count": strategies.len(),
        "active_strategy_count": strategies.iter().filter(|s| s.is_active).count(),
    })))
}

/// Client-safe strategy listing: names and performance, no configs.
async fn strategies(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Query(q): Query<PortalQuery>,
) -> ApiResult<Json<Value>> {
    require_member(&state, &q.fund_id, &principal.user_id)?;
    let rows = state.repo.get_strategies_by_fund(&q.fund_id)?;
    let listed: Vec<Value> = rows
        .iter()
        .map(|s| {
            let book = state.runner.book(&s.id);
            json!({
                "name": s.name,
                "type": s.strategy_type,
                "is_active": s.is_active,
                "realized_pnl": book.as_ref().map(|b| b.realized_pnl).unwrap_or(0.0),
                "trade_count": book.as_ref().map(|b| b.trade_count).unwrap_or(0),
            })
        })
        .collect();
    Ok(Json(json!({"strategies": listed})))
}
