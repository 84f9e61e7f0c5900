// =============================================================================
// Central application state
// =============================================================================
//
// Explicit wiring for every long-lived service. Nothing attaches to process
// globals: `AppState::build` constructs the object graph once, boundary
// handlers receive it via axum state, and tests spin up fresh instances.
//
// Coupling between the engine, matcher and hub goes through the event bus
// only; none of the three holds a pointer to another.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use crate::api::auth::AuthService;
use crate::bus::EventBus;
use crate::config::RuntimeConfig;
use crate::funds::{FundLedger, FundPnl};
use crate::hub::{Hub, TokenVerifier};
use crate::instruments::{universe, universe_map, InstrumentProfile};
use crate::market::MarketEngine;
use crate::matcher::Matcher;
use crate::repo::Repository;
use crate::runner::StrategyRunner;

pub struct AppState {
    pub config: RuntimeConfig,
    pub instruments: HashMap<String, InstrumentProfile>,
    pub repo: Arc<Repository>,
    pub engine: Arc<MarketEngine>,
    pub bus: Arc<EventBus>,
    pub auth: Arc<AuthService>,
    pub hub: Arc<Hub>,
    pub matcher: Arc<Matcher>,
    pub runner: Arc<StrategyRunner>,
    pub ledger: Arc<FundLedger>,
    pub started_at: Instant,
}

impl AppState {
    /// Construct the full service graph. The repository opens (and migrates)
    /// first; everything else is in-memory wiring.
    pub fn build(config: RuntimeConfig) -> anyhow::Result<Arc<Self>> {
        let repo = Arc::new(Repository::open(config.db.clone())?);
        let instruments = universe_map();

        let engine = Arc::new(MarketEngine::new(
            universe(),
            config.regime.clone(),
            config.ticks_per_day,
            None,
        ));
        let bus = Arc::new(EventBus::new(256));
        let auth = Arc::new(AuthService::new(repo.clone(), config.jwt_secret.clone()));
        let hub = Arc::new(Hub::new(
            auth.clone() as Arc<dyn TokenVerifier>,
            repo.clone(),
            config.outbound_queue_depth,
        ));
        let matcher = Arc::new(Matcher::new(
            repo.clone(),
            bus.clone(),
            instruments.clone(),
            &config,
            None,
        ));
        let runner = Arc::new(StrategyRunner::new(
            repo.clone(),
            engine.clone(),
            instruments.clone(),
            &config,
        ));
        let ledger = Arc::new(FundLedger::new(
            repo.clone(),
            runner.clone() as Arc<dyn FundPnl>,
        ));

        Ok(Arc::new(Self {
            config,
            instruments,
            repo,
            engine,
            bus,
            auth,
            hub,
            matcher,
            runner,
            ledger,
            started_at: Instant::now(),
        }))
    }

    pub fn uptime_secs(&self) -> u64 {
        self.started_at.elapsed().as_secs()
    }
}
