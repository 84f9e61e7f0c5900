// =============================================================================
// REST API: funds, membership, capital, NAV, risk
// =============================================================================

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::info;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::repo::funds::{Fund, FundMember};
use crate::repo::RiskSettings;
use crate::types::{CapitalTxKind, FundRole};

use super::auth::AuthUser;
use super::error::{ApiError, ApiResult};

pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/funds", post(create_fund).get(list_funds))
        .route(
            "/api/funds/:id",
            get(get_fund).put(update_fund).delete(delete_fund),
        )
        .route(
            "/api/funds/:id/members",
            post(add_member).get(list_members),
        )
        .route(
            "/api/funds/:id/members/:user_id",
            axum::routing::put(update_member).delete(remove_member),
        )
        .route(
            "/api/funds/:id/capital",
            post(capital_event).get(list_capital),
        )
        .route("/api/funds/:id/nav", get(fund_nav))
        .route("/api/funds/:id/investors", get(investors))
        .route("/api/funds/:id/reconciliation", get(reconciliation))
        .route("/api/funds/:id/risk", get(get_risk).put(put_risk))
        .route("/api/funds/:id/risk/breaches", get(risk_breaches))
}

// =============================================================================
// Access helpers
// =============================================================================

fn require_member(state: &AppState, fund_id: &str, user_id: &str) -> ApiResult<FundMember> {
    state
        .repo
        .get_member(fund_id, user_id)?
        .ok_or_else(|| ApiError::forbidden("not a member of this fund"))
}

fn require_owner(state: &AppState, fund_id: &str, user_id: &str) -> ApiResult<FundMember> {
    let member = require_member(state, fund_id, user_id)?;
    if member.role != FundRole::Owner {
        return Err(ApiError::forbidden("fund owner required"));
    }
    Ok(member)
}

fn load_fund(state: &AppState, fund_id: &str) -> ApiResult<Fund> {
    state
        .repo
        .get_fund(fund_id)?
        .ok_or_else(|| ApiError::not_found("fund not found"))
}

// =============================================================================
// Funds
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FundReq {
    name: String,
    strategy_type: Option<String>,
    description: Option<String>,
    min_investment: Option<f64>,
    management_fee_rate: Option<f64>,
    performance_fee_rate: Option<f64>,
}

async fn create_fund(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<FundReq>,
) -> ApiResult<Json<Value>> {
    let name = req.name.trim();
    if name.is_empty() || name.len() > 80 {
        return Err(ApiError::invalid("fund name must be 1-80 characters"));
    }
    let fund = Fund {
        id: Uuid::new_v4().to_string(),
        name: name.to_string(),
        strategy_type: req.strategy_type.unwrap_or_else(|| "multi".into()),
        owner_id: principal.user_id.clone(),
        description: req.description.unwrap_or_default(),
        min_investment: req.min_investment.unwrap_or(0.0).max(0.0),
        management_fee_rate: req.management_fee_rate.unwrap_or(0.0).clamp(0.0, 0.1),
        performance_fee_rate: req.performance_fee_rate.unwrap_or(0.0).clamp(0.0, 0.5),
        created_at: Utc::now().to_rfc3339(),
    };
    state.repo.insert_fund(&fund)?;
    state.repo.insert_member(&FundMember {
        fund_id: fund.id.clone(),
        user_id: principal.user_id.clone(),
        role: FundRole::Owner,
        joined_at: fund.created_at.clone(),
    })?;
    info!(fund_id = %fund.id, owner = %principal.username, "fund created");
    Ok(Json(json!({"fund": fund})))
}

async fn list_funds(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Value>> {
    let mine = state.repo.get_user_funds(&principal.user_id)?;
    let all = state.repo.list_funds()?;
    Ok(Json(json!({"funds": all, "memberOf": mine})))
}

async fn get_fund(
    AuthUser(_principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let fund = load_fund(&state, &id)?;
    Ok(Json(json!({"fund": fund})))
}

async fn update_fund(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<FundReq>,
) -> ApiResult<Json<Value>> {
    require_owner(&state, &id, &principal.user_id)?;
    let mut fund = load_fund(&state, &id)?;
    let name = req.name.trim();
    if name.is_empty() || name.len() > 80 {
        return Err(ApiError::invalid("fund name must be 1-80 characters"));
    }
    fund.name = name.to_string();
    if let Some(v) = req.strategy_type {
        fund.strategy_type = v;
    }
    if let Some(v) = req.description {
        fund.description = v;
    }
    if let Some(v) = req.min_investment {
        fund.min_investment = v.max(0.0);
    }
    if let Some(v) = req.management_fee_rate {
        fund.management_fee_rate = v.clamp(0.0, 0.1);
    }
    if let Some(v) = req.performance_fee_rate {
        fund.performance_fee_rate = v.clamp(0.0, 0.5);
    }
    state.repo.update_fund(&fund)?;
    Ok(Json(json!({"fund": fund})))
}

async fn delete_fund(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_owner(&state, &id, &principal.user_id)?;
    let summary = state.repo.get_capital_summary(&id)?;
    if summary.total_units.abs() > 1e-9 {
        return Err(ApiError::invalid(
            "fund still has outstanding units; investors must withdraw first",
        ));
    }
    state.repo.delete_fund(&id)?;
    Ok(Json(json!({"deleted": true})))
}

// =============================================================================
// Members
// =============================================================================

#[derive(Deserialize)]
struct AddMemberReq {
    username: String,
    role: String,
}

async fn add_member(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<AddMemberReq>,
) -> ApiResult<Json<Value>> {
    require_owner(&state, &id, &principal.user_id)?;
    load_fund(&state, &id)?;

    let role = FundRole::parse(&req.role)
        .ok_or_else(|| ApiError::invalid("role must be analyst or client"))?;
    // Exactly one owner per fund.
    if role == FundRole::Owner {
        return Err(ApiError::invalid("a fund has exactly one owner"));
    }
    let user = state
        .repo
        .get_user_by_username(&req.username)?
        .ok_or_else(|| ApiError::not_found("no such user"))?;
    if state.repo.get_member(&id, &user.id)?.is_some() {
        return Err(ApiError::invalid("already a member"));
    }

    let member = FundMember {
        fund_id: id.clone(),
        user_id: user.id,
        role,
        joined_at: Utc::now().to_rfc3339(),
    };
    state.repo.insert_member(&member)?;
    Ok(Json(json!({"member": member})))
}

async fn list_members(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_member(&state, &id, &principal.user_id)?;
    Ok(Json(json!({"members": state.repo.get_members(&id)?})))
}

#[derive(Deserialize)]
struct UpdateMemberReq {
    role: String,
}

async fn update_member(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path((id, user_id)): Path<(String, String)>,
    Json(req): Json<UpdateMemberReq>,
) -> ApiResult<Json<Value>> {
    require_owner(&state, &id, &principal.user_id)?;
    let role = FundRole::parse(&req.role)
        .ok_or_else(|| ApiError::invalid("role must be analyst or client"))?;
    if role == FundRole::Owner {
        return Err(ApiError::invalid("a fund has exactly one owner"));
    }
    let target = state
        .repo
        .get_member(&id, &user_id)?
        .ok_or_else(|| ApiError::not_found("no such member"))?;
    if target.role == FundRole::Owner {
        return Err(ApiError::invalid("the owner's role cannot change"));
    }
    state.repo.update_member_role(&id, &user_id, role)?;
    Ok(Json(json!({"updated": true})))
}

async fn remove_member(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path((id, user_id)): Path<(String, String)>,
) -> ApiResult<Json<Value>> {
    require_owner(&state, &id, &principal.user_id)?;
    let target = state
        .repo
        .get_member(&id, &user_id)?
        .ok_or_else(|| ApiError::not_found("no such member"))?;
    if target.role == FundRole::Owner {
        return Err(ApiError::invalid("the owner cannot be removed"));
    }
    state.repo.delete_member(&id, &user_id)?;
    Ok(Json(json!({"removed": true})))
}

// =============================================================================
// Capital
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CapitalReq {
    #[serde(rename = "type")]
    kind: CapitalTxKind,
    amount: f64,
}

async fn capital_event(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<CapitalReq>,
) -> ApiResult<Json<Value>> {
    require_member(&state, &id, &principal.user_id)?;
    let tx = match req.kind {
        CapitalTxKind::Deposit => state.ledger.deposit(&id, &principal.user_id, req.amount)?,
        CapitalTxKind::Withdrawal => state.ledger.withdraw(&id, &principal.user_id, req.amount)?,
    };
    let nav = state.ledger.nav_view(&id)?;
    Ok(Json(json!({"transaction": tx, "nav": nav})))
}

async fn list_capital(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_member(&state, &id, &principal.user_id)?;
    Ok(Json(json!({"transactions": state.repo.get_capital_txs(&id, 200)?})))
}

// =============================================================================
// NAV / investors / reconciliation
// =============================================================================

async fn fund_nav(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_member(&state, &id, &principal.user_id)?;
    load_fund(&state, &id)?;
    let nav = state.ledger.nav_view(&id)?;
    let history = state.repo.get_recent_nav(&id, 100)?;
    Ok(Json(json!({"nav": nav, "history": history})))
}

async fn investors(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_member(&state, &id, &principal.user_id)?;
    let nav = state.ledger.nav_view(&id)?;
    let holdings = state.repo.get_investor_holdings(&id)?;
    let rows: Vec<Value> = holdings
        .iter()
        .map(|h| {
            json!({
                "user_id": h.user_id,
                "units": h.units,
                "net_capital": h.net_capital,
                "value": h.units * nav.nav_per_unit,
                "share_pct": if nav.total_units > 0.0 {
                    h.units / nav.total_units * 100.0
                } else {
                    0.0
                },
            })
        })
        .collect();
    Ok(Json(json!({"investors": rows, "nav": nav})))
}

async fn reconciliation(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_member(&state, &id, &principal.user_id)?;
    load_fund(&state, &id)?;
    Ok(Json(json!(state.ledger.reconcile(&id)?)))
}

// =============================================================================
// Risk
// =============================================================================

async fn get_risk(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_member(&state, &id, &principal.user_id)?;
    Ok(Json(json!({"risk": state.repo.get_risk_settings(&id)?})))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RiskReq {
    max_position_pct: f64,
    max_strategy_allocation_pct: f64,
    max_daily_drawdown_pct: f64,
    is_enabled: bool,
}

async fn put_risk(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    Json(req): Json<RiskReq>,
) -> ApiResult<Json<Value>> {
    require_owner(&state, &id, &principal.user_id)?;
    for (name, v) in [
        ("maxPositionPct", req.max_position_pct),
        ("maxStrategyAllocationPct", req.max_strategy_allocation_pct),
        ("maxDailyDrawdownPct", req.max_daily_drawdown_pct),
    ] {
        if !v.is_finite() || v < 0.0 || v > 100.0 {
            return Err(ApiError::invalid(format!("{name} must be within 0-100")));
        }
    }
    let settings = RiskSettings {
        fund_id: id.clone(),
        max_position_pct: req.max_position_pct,
        max_strategy_allocation_pct: req.max_strategy_allocation_pct,
        max_daily_drawdown_pct: req.max_daily_drawdown_pct,
        is_enabled: req.is_enabled,
    };
    state.repo.upsert_risk_settings(&settings)?;
    Ok(Json(json!({"risk": settings})))
}

async fn risk_breaches(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    require_member(&state, &id, &principal.user_id)?;
    Ok(Json(json!({"breaches": state.repo.get_risk_breaches(&id, 100)?})))
}
