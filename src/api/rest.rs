// =============================================================================
// REST API: auth, market data, trading
// =============================================================================
//
// Router construction plus the market/trading handlers. Fund, strategy and
// client-portal surfaces live in their own modules and are merged here.
// CORS is permissive for development.
// =============================================================================

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};
use tracing::info;
use uuid::Uuid;

use crate::app_state::AppState;
use crate::exec_model;
use crate::market::orderbook::{self, OpenLimit};
use crate::market::regime::multipliers_for;
use crate::repo::OrderRow;
use crate::types::{OrderStatus, OrderType, Side};

use super::auth::AuthUser;
use super::error::{ApiError, ApiResult};
use super::{funds_api, portal, strategies_api, ws};

/// Horizon the place-order borrow estimate is quoted over.
const QUOTE_BORROW_HORIZON_MS: u64 = 86_400_000;

/// Build the full application router.
pub fn router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        // ── Public ──────────────────────────────────────────────────
        .route("/api/health", get(health))
        .route("/api/auth/register", post(register))
        .route("/api/auth/login", post(login))
        // ── Market data ─────────────────────────────────────────────
        .route("/api/auth/me", get(me))
        .route("/api/tickers", get(tickers))
        .route("/api/candles/:symbol", get(candles))
        .route("/api/orderbook/:symbol", get(orderbook_snapshot))
        .route("/api/news", get(news))
        // ── Trading ─────────────────────────────────────────────────
        .route("/api/orders", post(place_order).get(open_orders))
        .route("/api/orders/:id", delete(cancel_order))
        .route("/api/positions", get(positions))
        .route("/api/trades", get(trades))
        .route("/api/portfolio/stats", get(portfolio_stats))
        .route("/api/leaderboard", get(leaderboard))
        // ── Funds / strategies / portal ─────────────────────────────
        .merge(funds_api::routes())
        .merge(strategies_api::routes())
        .merge(portal::routes())
        // ── Push channel ────────────────────────────────────────────
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .with_state(state)
}

// =============================================================================
// Health & auth
// =============================================================================

async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    let repo = state.repo.health();
    Json(json!({
        "status": if repo.connected { "ok" } else { "degraded" },
        "uptime_secs": state.uptime_secs(),
        "tick_count": state.engine.tick_count(),
        "regime": state.engine.regime(),
        "sessions": state.hub.session_count(),
        "repository": repo,
    }))
}

#[derive(Deserialize)]
struct CredentialsReq {
    username: String,
    password: String,
}

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CredentialsReq>,
) -> ApiResult<Json<Value>> {
    let (user, token) = state.auth.register(&req.username, &req.password)?;
    Ok(Json(json!({"token": token, "user": user})))
}

async fn login(
    State(state): State<Arc<AppState>>,
    Json(req): Json<CredentialsReq>,
) -> ApiResult<Json<Value>> {
    let (user, token) = state.auth.login(&req.username, &req.password)?;
    Ok(Json(json!({"token": token, "user": user})))
}

async fn me(AuthUser(principal): AuthUser, State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let user = state
        .repo
        .get_user(&principal.user_id)?
        .ok_or_else(|| ApiError::not_found("user no longer exists"))?;
    Ok(Json(json!({"user": user})))
}

// =============================================================================
// Market data
// =============================================================================

async fn tickers(State(state): State<Arc<AppState>>) -> Json<Value> {
    let quotes = state.engine.all_quotes();
    let enriched: Vec<Value> = quotes
        .iter()
        .map(|q| {
            let profile = state.instruments.get(&q.ticker);
            json!({
                "quote": q,
                "name": profile.map(|p| p.name.clone()).unwrap_or_default(),
                "assetClass": profile.map(|p| p.asset_class),
            })
        })
        .collect();
    Json(json!({"tickers": enriched}))
}

#[derive(Deserialize)]
struct CandleQuery {
    interval: Option<String>,
    limit: Option<usize>,
}

async fn candles(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
    Query(q): Query<CandleQuery>,
) -> ApiResult<Json<Value>> {
    if !state.instruments.contains_key(&symbol) {
        return Err(ApiError::not_found(format!("unknown symbol {symbol}")));
    }
    let interval = q.interval.unwrap_or_else(|| "1m".to_string());
    if crate::market::candles::interval_ms(&interval).is_none() {
        return Err(ApiError::invalid(format!("unknown interval {interval}")));
    }
    let limit = q.limit.unwrap_or(100).clamp(1, 1_000);

    // Persisted history first; the in-memory ring covers a fresh boot.
    let mut rows = state.repo.get_candles(&symbol, &interval, limit)?;
    if rows.is_empty() {
        rows = state.engine.recent_candles(&symbol, &interval, limit);
    }
    let current = state.engine.current_candle(&symbol, &interval);
    Ok(Json(json!({"candles": rows, "current": current})))
}

async fn orderbook_snapshot(
    State(state): State<Arc<AppState>>,
    Path(symbol): Path<String>,
) -> ApiResult<Json<Value>> {
    let profile = state
        .instruments
        .get(&symbol)
        .ok_or_else(|| ApiError::not_found(format!("unknown symbol {symbol}")))?;
    let quote = state
        .engine
        .quote(&symbol)
        .ok_or_else(|| ApiError::not_found(format!("no quote for {symbol}")))?;

    let open_limits: Vec<OpenLimit> = state
        .repo
        .get_open_orders_by_ticker(&symbol)?
        .iter()
        .filter_map(|o| {
            o.limit_price.map(|price| OpenLimit {
                side: o.side,
                price,
                remaining_qty: o.remaining_qty(),
            })
        })
        .collect();

    let book = orderbook::build_book(
        profile,
        quote.price,
        quote.volatility,
        &open_limits,
        &mut rand::thread_rng(),
    );
    Ok(Json(json!(book)))
}

#[derive(Deserialize)]
struct NewsQuery {
    limit: Option<usize>,
    ticker: Option<String>,
}

async fn news(
    State(state): State<Arc<AppState>>,
    Query(q): Query<NewsQuery>,
) -> ApiResult<Json<Value>> {
    let limit = q.limit.unwrap_or(25).clamp(1, 200);
    let events = match q.ticker {
        Some(ticker) => state.repo.get_news_by_ticker(&ticker, limit)?,
        None => state.repo.get_recent_news(limit)?,
    };
    Ok(Json(json!({"news": events})))
}

// =============================================================================
// Trading
// =============================================================================

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct PlaceOrderReq {
    ticker: String,
    #[serde(rename = "type")]
    order_type: OrderType,
    side: Side,
    qty: f64,
    limit_price: Option<f64>,
    stop_price: Option<f64>,
    trail_pct: Option<f64>,
    oco_id: Option<String>,
}

async fn place_order(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Json(req): Json<PlaceOrderReq>,
) -> ApiResult<Json<Value>> {
    let profile = state
        .instruments
        .get(&req.ticker)
        .ok_or_else(|| ApiError::invalid(format!("unknown ticker {}", req.ticker)))?;
    if !req.qty.is_finite() || req.qty < 1.0 || req.qty.fract() != 0.0 {
        return Err(ApiError::invalid("qty must be a positive whole number"));
    }

    // Type-specific shape checks.
    let positive = |v: Option<f64>| v.filter(|x| x.is_finite() && *x > 0.0);
    match req.order_type {
        OrderType::Limit if positive(req.limit_price).is_none() => {
            return Err(ApiError::invalid("limit orders need a positive limitPrice"));
        }
        OrderType::StopLimit
            if positive(req.limit_price).is_none() || positive(req.stop_price).is_none() =>
        {
            return Err(ApiError::invalid(
                "stop-limit orders need positive limitPrice and stopPrice",
            ));
        }
        OrderType::Stop | OrderType::StopLoss | OrderType::TakeProfit
            if positive(req.stop_price).is_none() =>
        {
            return Err(ApiError::invalid("stop orders need a positive stopPrice"));
        }
        OrderType::TrailingStop
            if !req
                .trail_pct
                .map(|t| t.is_finite() && t > 0.0 && t < 1.0)
                .unwrap_or(false) =>
        {
            return Err(ApiError::invalid("trailing stops need trailPct in (0, 1)"));
        }
        _ => {}
    }

    let quote = state
        .engine
        .quote(&req.ticker)
        .ok_or_else(|| ApiError::not_found(format!("no quote for {}", req.ticker)))?;
    let ref_price = match (req.order_type, req.side) {
        (OrderType::Limit | OrderType::StopLimit, _) => {
            req.limit_price.unwrap_or(quote.price)
        }
        (_, Side::Buy) => quote.ask,
        (_, Side::Sell) => quote.bid,
    };

    if req.qty * ref_price < state.config.min_order_notional {
        return Err(ApiError::invalid(format!(
            "order notional below minimum {}",
            state.config.min_order_notional
        )));
    }

    // Pre-trade estimate quoted back to the caller.
    let position = state.repo.get_position(&principal.user_id, &req.ticker)?;
    let held = position.map(|p| p.qty).unwrap_or(0.0);
    let opens_short = match req.side {
        Side::Buy => 0.0,
        Side::Sell => (req.qty - held.max(0.0)).max(0.0),
    };
    let mults = multipliers_for(&state.config.regime, state.engine.regime());
    let estimate = exec_model::estimate(
        profile,
        req.side,
        req.qty,
        ref_price,
        quote.price,
        quote.volatility,
        mults,
        opens_short,
        if opens_short > 0.0 { QUOTE_BORROW_HORIZON_MS } else { 0 },
    );

    // Market buys must be coverable now; resting orders re-check at fill.
    if req.order_type == OrderType::Market && req.side == Side::Buy {
        let user = state
            .repo
            .get_user(&principal.user_id)?
            .ok_or_else(|| ApiError::not_found("user no longer exists"))?;
        let needed = req.qty * estimate.fill_price + estimate.commission;
        if user.cash < needed {
            return Err(ApiError::invalid(format!(
                "insufficient cash: need {needed:.2}, have {:.2}",
                user.cash
            )));
        }
    }

    let order = OrderRow {
        id: Uuid::new_v4().to_string(),
        user_id: principal.user_id.clone(),
        symbol: req.ticker.clone(),
        order_type: req.order_type,
        side: req.side,
        qty: req.qty,
        filled_qty: 0.0,
        limit_price: req.limit_price,
        stop_price: req.stop_price,
        trail_pct: req.trail_pct,
        trail_high: None,
        oco_group_id: req.oco_id.clone(),
        status: OrderStatus::Open,
        reject_reason: None,
        created_at: Utc::now().to_rfc3339(),
        cancelled_at: None,
        filled_at: None,
    };
    state.repo.insert_order(&order)?;
    info!(
        order_id = %order.id,
        user = %principal.username,
        ticker = %order.symbol,
        side = %order.side,
        order_type = %order.order_type,
        qty = order.qty,
        "order accepted"
    );

    Ok(Json(json!({"order": order, "estimate": estimate})))
}

async fn open_orders(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Value>> {
    let orders = state.repo.get_open_orders_by_user(&principal.user_id)?;
    Ok(Json(json!({"orders": orders})))
}

async fn cancel_order(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let order = state
        .repo
        .get_order(&id)?
        .ok_or_else(|| ApiError::not_found("order not found"))?;
    if order.user_id != principal.user_id {
        return Err(ApiError::forbidden("not your order"));
    }
    // Idempotent: cancelling a terminal order is a successful no-op.
    state.repo.cancel_order(&id, &Utc::now().to_rfc3339())?;
    let refreshed = state.repo.get_order(&id)?;
    Ok(Json(json!({"order": refreshed})))
}

async fn positions(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Value>> {
    let positions = state.repo.get_positions(&principal.user_id)?;
    let marked: Vec<Value> = positions
        .iter()
        .map(|p| {
            let mark = state.engine.quote(&p.symbol).map(|t| t.price).unwrap_or(p.avg_cost);
            json!({
                "symbol": p.symbol,
                "qty": p.qty,
                "avg_cost": p.avg_cost,
                "cost_basis": p.cost_basis,
                "mark": mark,
                "market_value": p.qty * mark,
                "unrealized_pnl": p.qty * (mark - p.avg_cost),
            })
        })
        .collect();
    Ok(Json(json!({"positions": marked})))
}

#[derive(Deserialize)]
struct TradesQuery {
    limit: Option<usize>,
}

async fn trades(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
    Query(q): Query<TradesQuery>,
) -> ApiResult<Json<Value>> {
    let limit = q.limit.unwrap_or(50).clamp(1, 500);
    let trades = state.repo.get_trades_by_user(&principal.user_id, limit)?;
    Ok(Json(json!({"trades": trades})))
}

async fn portfolio_stats(
    AuthUser(principal): AuthUser,
    State(state): State<Arc<AppState>>,
) -> ApiResult<Json<Value>> {
    let user = state
        .repo
        .get_user(&principal.user_id)?
        .ok_or_else(|| ApiError::not_found("user no longer exists"))?;
    let positions = state.repo.get_positions(&user.id)?;
    let open_orders = state.repo.get_open_orders_by_user(&user.id)?;
    let trades = state.repo.get_trades_by_user(&user.id, 500)?;

    let mut market_value = 0.0;
    let mut unrealized = 0.0;
    for p in &positions {
        let mark = state.engine.quote(&p.symbol).map(|t| t.price).unwrap_or(p.avg_cost);
        market_value += p.qty * mark;
        unrealized += p.qty * (mark - p.avg_cost);
    }
    let realized: f64 = trades.iter().map(|t| t.realized_pnl).sum();
    let costs: f64 = trades
        .iter()
        .map(|t| t.commission + t.slippage_cost + t.borrow_cost)
        .sum();
    let equity = user.cash + market_value;

    Ok(Json(json!({
        "cash": user.cash,
        "equity": equity,
        "market_value": market_value,
        "unrealized_pnl": unrealized,
        "realized_pnl": realized,
        "total_costs": costs,
        "return_pct": if user.starting_cash > 0.0 {
            (equity - user.starting_cash) / user.starting_cash * 100.0
        } else {
            0.0
        },
        "open_order_count": open_orders.len(),
        "position_count": positions.len(),
    })))
}

async fn leaderboard(State(state): State<Arc<AppState>>) -> ApiResult<Json<Value>> {
    let users = state.repo.list_users()?;
    let mut rows: Vec<Value> = Vec::with_capacity(users.len());
    for user in &users {
        let positions = state.repo.get_positions(&user.id)?;
        let market_value: f64 = positions
            .iter()
            .map(|p| {
                let mark = state.engine.quote(&p.symbol).map(|t| t.price).unwrap_or(p.avg_cost);
                p.qty * mark
            })
            .sum();
        let equity = user.cash + market_value;
        rows.push(json!({
            "username": user.username,
            "equity": equity,
            "return_pct": if user.starting_cash > 0.0 {
                (equity - user.starting_cash) / user.starting_cash * 100.0
            } else {
                0.0
            },
        }));
    }
    rows.sort_by(|a, b| {
        b["equity"]
            .as_f64()
            .unwrap_or(0.0)
            .total_cmp(&a["equity"].as_f64().unwrap_or(0.0))
    });
    rows.truncate(50);
    Ok(Json(json!({"leaderboard": rows})))
}
