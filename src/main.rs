// =============================================================================
// Meridian - simulated capital-markets exchange and fund platform
// =============================================================================
//
// Boot order: environment and logging, configuration, the service graph
// (repository, engine, bus, hub, matcher, runner, ledger), the named
// periodic tasks, then the HTTP/WebSocket server. Shutdown is cooperative on
// Ctrl+C.
//
// Periodic tasks and their periods (all configurable):
//   tick loop            every tick_interval_ms   engine pass -> bus
//   bus bridge           event-driven             bus -> hub fan-out
//   matcher              event-driven             bus ticks -> order scans
//   candle writer        event-driven             closed candles -> repository
//   orderbook broadcast  every Nth tick period    synthetic books -> hub
//   news loop            random 45-180 s          shocks + news events
//   strategy runner      every 30 s               active strategy passes
//   NAV recompute        every 60 s               per-fund snapshots
//   heartbeat            every 15 s               stale session reaping
//   repository probe     every probe cooldown     failover recovery
// =============================================================================

mod api;
mod app_state;
mod backtest;
mod bus;
mod config;
mod exec_model;
mod funds;
mod hub;
mod instruments;
mod market;
mod matcher;
mod repo;
mod runner;
mod strategies;
mod types;

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::config::RuntimeConfig;
use crate::market::news::NewsGenerator;
use crate::types::NewsSeverity;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Meridian exchange starting up");

    let config = RuntimeConfig::from_env();
    info!(
        port = config.port,
        tick_interval_ms = config.tick_interval_ms,
        db_mode = %config.db.connect_mode,
        "configuration loaded"
    );

    let state = AppState::build(config)?;

    // Warm-up: replay the strategy trade ledger into the runner's books.
    if let Err(e) = state.runner.hydrate() {
        warn!(error = %e, "strategy hydration failed; books start empty");
    }

    spawn_background_tasks(state.clone());

    // ── HTTP / WebSocket server ──────────────────────────────────────────
    let app = api::router(state.clone());
    let bind_addr = format!("0.0.0.0:{}", state.config.port);
    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    info!(addr = %bind_addr, "server listening");

    tokio::select! {
        result = axum::serve(listener, app) => {
            if let Err(e) = result {
                error!(error = %e, "server failed");
            }
        }
        _ = tokio::signal::ctrl_c() => {
            warn!("shutdown signal received, stopping");
        }
    }

    info!("Meridian shut down complete");
    Ok(())
}

/// Launch every long-lived task. Each owns one concern and one period.
fn spawn_background_tasks(state: Arc<AppState>) {
    let (candle_tx, candle_rx) = mpsc::channel::<market::Candle>(1_024);

    // ── Tick loop: engine pass, candle forwarding, bus publish ──────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_millis(state.config.tick_interval_ms));
            loop {
                interval.tick().await;
                let (batch, closed) = state.engine.tick_pass();
                for candle in closed {
                    // The writer owns persistence; a full queue drops the
                    // candle rather than stalling tick generation.
                    if candle_tx.try_send(candle).is_err() {
                        warn!("candle writer queue full, dropping closed candle");
                    }
                }
                state.bus.publish_ticks(Arc::new(batch));
            }
        });
    }

    // ── Candle writer: persistence with repository backpressure ─────────
    {
        let state = state.clone();
        let mut rx = candle_rx;
        tokio::spawn(async move {
            while let Some(candle) = rx.recv().await {
                if state.config.pause_background_on_db_down && !state.repo.is_healthy() {
                    debug!("repository unhealthy, skipping candle persist");
                    continue;
                }
                if let Err(e) = state.repo.upsert_candle(&candle) {
                    warn!(error = %e, symbol = %candle.symbol, "candle persist failed");
                }
            }
        });
    }

    // ── Bus bridge: fan events out to the hub ───────────────────────────
    {
        let state = state.clone();
        let mut ticks = state.bus.subscribe_ticks();
        let mut fills = state.bus.subscribe_fills();
        let mut news = state.bus.subscribe_news();
        let mut margin = state.bus.subscribe_margin_calls();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    batch = ticks.recv() => {
                        if let Ok(batch) = batch {
                            state.hub.on_tick_batch(&batch);
                        }
                    }
                    fill = fills.recv() => {
                        if let Ok(fill) = fill {
                            state.hub.on_fill(&fill);
                        }
                    }
                    event = news.recv() => {
                        if let Ok(event) = event {
                            state.hub.on_news(&event);
                        }
                    }
                    call = margin.recv() => {
                        if let Ok(call) = call {
                            state.hub.on_margin_call(&call);
                        }
                    }
                }
            }
        });
    }

    // ── Matcher: order scans per tick batch ─────────────────────────────
    {
        let state = state.clone();
        let mut ticks = state.bus.subscribe_ticks();
        tokio::spawn(async move {
            loop {
                match ticks.recv().await {
                    Ok(batch) => state.matcher.on_tick_batch(&batch),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "matcher lagged behind tick batches");
                    }
                    Err(_) => break,
                }
            }
        });
    }

    // ── Order-book broadcast: reduced cadence ───────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let period = state.config.tick_interval_ms * state.config.orderbook_every_n_passes;
            let mut interval = tokio::time::interval(Duration::from_millis(period.max(1)));
            loop {
                interval.tick().await;
                if state.hub.session_count() == 0 {
                    continue;
                }
                for symbol in state.instruments.keys() {
                    let Some(quote) = state.engine.quote(symbol) else {
                        continue;
                    };
                    let Some(profile) = state.instruments.get(symbol) else {
                        continue;
                    };
                    let open_limits: Vec<market::orderbook::OpenLimit> = state
                        .repo
                        .get_open_orders_by_ticker(symbol)
                        .unwrap_or_default()
                        .iter()
                        .filter_map(|o| {
                            o.limit_price.map(|price| market::orderbook::OpenLimit {
                                side: o.side,
                                price,
                                remaining_qty: o.remaining_qty(),
                            })
                        })
                        .collect();
                    let book = market::orderbook::build_book(
                        profile,
                        quote.price,
                        quote.volatility,
                        &open_limits,
                        &mut rand::thread_rng(),
                    );
                    state.hub.on_orderbook(&book);
                }
            }
        });
    }

    // ── News loop: templated events and shocks ──────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut generator = NewsGenerator::new(None);
            let symbols: Vec<String> = state.instruments.keys().cloned().collect();
            loop {
                let delay = generator.next_delay_secs(
                    state.config.news_min_interval_secs,
                    state.config.news_max_interval_secs,
                );
                tokio::time::sleep(Duration::from_secs(delay)).await;

                let event = generator.generate(&symbols);
                let impact_fraction = event.price_impact / 100.0;
                if event.is_market_wide() {
                    state
                        .engine
                        .apply_market_shock(impact_fraction, state.config.market_shock_damping);
                } else {
                    state.engine.apply_shock(&event.ticker, impact_fraction);
                }
                if event.severity == NewsSeverity::High {
                    state.engine.force_event_shock();
                }

                info!(
                    ticker = %event.ticker,
                    kind = %event.kind,
                    severity = %event.severity,
                    impact = event.price_impact,
                    "news event fired"
                );

                if !state.config.pause_background_on_db_down || state.repo.is_healthy() {
                    if let Err(e) = state.repo.insert_news(&event) {
                        warn!(error = %e, "news persist failed");
                    }
                }
                state.bus.publish_news(event);
            }
        });
    }

    // ── Strategy runner ─────────────────────────────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(state.config.strategy_interval_secs));
            loop {
                interval.tick().await;
                if state.config.pause_background_on_db_down && !state.repo.is_healthy() {
                    debug!("repository unhealthy, skipping strategy pass");
                    continue;
                }
                state.runner.run_pass();
            }
        });
    }

    // ── NAV recompute ───────────────────────────────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval =
                tokio::time::interval(Duration::from_secs(state.config.nav_recompute_secs));
            loop {
                interval.tick().await;
                if !state.repo.is_healthy() {
                    continue;
                }
                let funds = match state.repo.list_funds() {
                    Ok(funds) => funds,
                    Err(e) => {
                        warn!(error = %e, "NAV recompute skipped, funds unavailable");
                        continue;
                    }
                };
                for fund in funds {
                    if let Err(e) = state.ledger.write_snapshot(&fund.id) {
                        warn!(fund_id = %fund.id, error = %e, "NAV snapshot failed");
                    }
                }
            }
        });
    }

    // ── Heartbeat ───────────────────────────────────────────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let secs = state.config.heartbeat_interval_secs;
            let mut interval = tokio::time::interval(Duration::from_secs(secs.max(1)));
            loop {
                interval.tick().await;
                state.hub.heartbeat_pass(secs);
            }
        });
    }

    // ── Repository probe: recover the primary endpoint ──────────────────
    {
        let state = state.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(
                state.config.db.probe_cooldown_secs.max(1),
            ));
            loop {
                interval.tick().await;
                state.repo.probe_primary();
            }
        });
    }

    info!("background tasks launched");
}
