// =============================================================================
// Market-data engine
// =============================================================================
//
// Generates the synthetic market. One tick pass advances every instrument by
// a single random-walk step under the current regime, accrues volume, rolls
// the day aggregates, folds prices into the candle aggregator, and returns
// the batch of ticks plus any candles that closed.
//
// Tick generation is entirely in-memory and synchronous under the engine
// lock; the engine never performs I/O and never calls the hub or matcher.
// Consumers subscribe through the event bus, and closed candles are handed
// to the caller for background persistence.
// =============================================================================

use std::collections::HashMap;

use chrono::Utc;
use parking_lot::RwLock;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::Serialize;
use tracing::debug;

use crate::config::{RegimeConfig, RegimeMultipliers};
use crate::instruments::InstrumentProfile;
use crate::market::candles::{Candle, CandleAggregator};
use crate::market::regime::{MarketRegime, RegimeMachine};

/// EWMA smoothing for running volatility (RiskMetrics-style decay).
const VOL_EWMA_LAMBDA: f64 = 0.94;
/// Ticks a news shock keeps spreads widened.
const SHOCK_SPREAD_COOLDOWN_TICKS: u64 = 60;
/// Spread multiplier at the moment a shock lands; decays linearly over the
/// cooldown window.
const SHOCK_SPREAD_MULT: f64 = 2.5;

/// One point-in-time quote for one instrument. Field names follow the push
/// protocol's tick payload.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Tick {
    pub ticker: String,
    pub price: f64,
    pub bid: f64,
    pub ask: f64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub prev_close: f64,
    pub volume: f64,
    pub change_pct: f64,
    pub regime: MarketRegime,
    pub volatility: f64,
    pub timestamp: i64,
}

struct SymbolState {
    profile: InstrumentProfile,
    mid: f64,
    day_open: f64,
    day_high: f64,
    day_low: f64,
    prev_close: f64,
    volume_today: f64,
    /// Running per-day return volatility (EWMA of scaled tick returns).
    ewma_vol: f64,
    /// Ticks of shock-widened spread remaining.
    shock_ticks_left: u64,
}

impl SymbolState {
    fn new(profile: InstrumentProfile) -> Self {
        let px = profile.starting_price;
        Self {
            profile,
            mid: px,
            day_open: px,
            day_high: px,
            day_low: px,
            prev_close: px,
            volume_today: 0.0,
            ewma_vol: 0.0,
            shock_ticks_left: 0,
        }
    }

    fn spread_bps(&self, regime: RegimeMultipliers) -> f64 {
        let event_mult = if self.shock_ticks_left > 0 {
            let frac = self.shock_ticks_left as f64 / SHOCK_SPREAD_COOLDOWN_TICKS as f64;
            1.0 + (SHOCK_SPREAD_MULT - 1.0) * frac
        } else {
            1.0
        };
        self.profile.base_spread_bps * regime.liquidity * event_mult
    }

    fn to_tick(&self, regime: MarketRegime, mults: RegimeMultipliers, ts: i64) -> Tick {
        let spread = self.mid * self.spread_bps(mults) / 10_000.0;
        let change_pct = if self.prev_close > 0.0 {
            (self.mid - self.prev_close) / self.prev_close * 100.0
        } else {
            0.0
        };
        Tick {
            ticker: self.profile.symbol.clone(),
            price: self.mid,
            bid: self.mid - spread / 2.0,
            ask: self.mid + spread / 2.0,
            open: self.day_open,
            high: self.day_high,
            low: self.day_low,
            prev_close: self.prev_close,
            volume: self.volume_today,
            change_pct,
            regime,
            volatility: self.ewma_vol,
            timestamp: ts,
        }
    }
}

struct EngineInner {
    symbols: HashMap<String, SymbolState>,
    order: Vec<String>,
    regime: RegimeMachine,
    rng: ChaCha8Rng,
    candles: CandleAggregator,
    tick_count: u64,
}

/// The simulated market. Wrap in `Arc` and share.
pub struct MarketEngine {
    inner: RwLock<EngineInner>,
    ticks_per_day: u64,
}

impl MarketEngine {
    pub fn new(
        profiles: Vec<InstrumentProfile>,
        regime_cfg: RegimeConfig,
        ticks_per_day: u64,
        seed: Option<u64>,
    ) -> Self {
        let order: Vec<String> = profiles.iter().map(|p| p.symbol.clone()).collect();
        let symbols = profiles
            .into_iter()
            .map(|p| (p.symbol.clone(), SymbolState::new(p)))
            .collect();
        let rng = match seed {
            Some(s) => ChaCha8Rng::seed_from_u64(s),
            None => ChaCha8Rng::from_entropy(),
        };
        Self {
            inner: RwLock::new(EngineInner {
                symbols,
                order,
                regime: RegimeMachine::new(regime_cfg),
                rng,
                candles: CandleAggregator::new(2_000),
                tick_count: 0,
            }),
            ticks_per_day: ticks_per_day.max(1),
        }
    }

    /// Advance the whole market by one tick. Returns the tick batch and any
    /// candles that closed on this pass.
    pub fn tick_pass(&self) -> (Vec<Tick>, Vec<Candle>) {
        let ts = Utc::now().timestamp_millis();
        let mut inner = self.inner.write();
        inner.tick_count += 1;

        // Day rollover: snapshot closes, reset aggregates.
        if inner.tick_count % self.ticks_per_day == 1 && inner.tick_count > 1 {
            for st in inner.symbols.values_mut() {
                st.prev_close = st.mid;
                st.day_open = st.mid;
                st.day_high = st.mid;
                st.day_low = st.mid;
                st.volume_today = 0.0;
            }
            debug!(tick = inner.tick_count, "trading day rolled");
        }

        {
            let EngineInner { regime, rng, .. } = &mut *inner;
            regime.on_tick(rng);
        }
        let regime = inner.regime.current();
        let mults = inner.regime.multipliers();

        let ticks_per_day = self.ticks_per_day as f64;
        let mut batch = Vec::with_capacity(inner.order.len());
        let mut closed = Vec::new();

        let order = inner.order.clone();
        for symbol in &order {
            let EngineInner {
                symbols,
                rng,
                candles,
                ..
            } = &mut *inner;
            let Some(st) = symbols.get_mut(symbol) else {
                continue;
            };

            // Per-tick sigma scaled from the per-day volatility target.
            let sigma = st.profile.volatility_target * mults.vol / ticks_per_day.sqrt();
            let ret = match Normal::new(0.0, sigma) {
                Ok(dist) => dist.sample(rng),
                Err(_) => 0.0,
            };
            st.mid = (st.mid * (1.0 + ret)).max(st.profile.price_tick());

            st.day_high = st.day_high.max(st.mid);
            st.day_low = st.day_low.min(st.mid);

            // Running volatility: EWMA of day-scaled absolute returns.
            let instantaneous = ret.abs() * ticks_per_day.sqrt();
            st.ewma_vol = VOL_EWMA_LAMBDA * st.ewma_vol + (1.0 - VOL_EWMA_LAMBDA) * instantaneous;

            // Stochastic volume accrual proportional to ADV per tick.
            let adv_shares = st.profile.adv_usd / st.mid;
            let draw: f64 = rng.gen_range(0.5..1.5);
            let vol_delta = adv_shares / ticks_per_day * draw;
            st.volume_today += vol_delta;

            if st.shock_ticks_left > 0 {
                st.shock_ticks_left -= 1;
            }

            closed.extend(candles.update(symbol, st.mid, vol_delta, ts));
            batch.push(st.to_tick(regime, mults, ts));
        }

        (batch, closed)
    }

    /// Jump one instrument's mid by `impact_fraction`, widen its spread for a
    /// cooldown window and inject volatility.
    pub fn apply_shock(&self, symbol: &str, impact_fraction: f64) {
        let mut inner = self.inner.write();
        if let Some(st) = inner.symbols.get_mut(symbol) {
            st.mid = (st.mid * (1.0 + impact_fraction)).max(st.profile.price_tick());
            st.day_high = st.day_high.max(st.mid);
            st.day_low = st.day_low.min(st.mid);
            st.shock_ticks_left = SHOCK_SPREAD_COOLDOWN_TICKS;
            st.ewma_vol = st.ewma_vol.max(impact_fraction.abs() * 2.0);
            debug!(symbol, impact_fraction, mid = st.mid, "news shock applied");
        }
    }

    /// Market-wide shock: each instrument takes the headline impact scaled by
    /// its shock beta and a damping factor; safe havens (negative beta) move
    /// against the headline.
    pub fn apply_market_shock(&self, impact_fraction: f64, damping: f64) {
        let symbols: Vec<(String, f64)> = {
            let inner = self.inner.read();
            inner
                .symbols
                .values()
                .map(|st| (st.profile.symbol.clone(), st.profile.shock_beta))
                .collect()
        };
        for (symbol, beta) in symbols {
            self.apply_shock(&symbol, impact_fraction * beta * damping);
        }
    }

    /// Force the regime machine into its event-shock state.
    pub fn force_event_shock(&self) {
        self.inner.write().regime.force_event_shock();
    }

    // ── Snapshot accessors ──────────────────────────────────────────────

    pub fn regime(&self) -> MarketRegime {
        self.inner.read().regime.current()
    }

    pub fn regime_multipliers(&self) -> RegimeMultipliers {
        self.inner.read().regime.multipliers()
    }

    /// Point-in-time quote for one symbol.
    pub fn quote(&self, symbol: &str) -> Option<Tick> {
        let inner = self.inner.read();
        let regime = inner.regime.current();
        let mults = inner.regime.multipliers();
        inner
            .symbols
            .get(symbol)
            .map(|st| st.to_tick(regime, mults, Utc::now().timestamp_millis()))
    }

    /// Quotes for the whole universe, in boot order.
    pub fn all_quotes(&self) -> Vec<Tick> {
        let inner = self.inner.read();
        let regime = inner.regime.current();
        let mults = inner.regime.multipliers();
        let ts = Utc::now().timestamp_millis();
        inner
            .order
            .iter()
            .filter_map(|s| inner.symbols.get(s))
            .map(|st| st.to_tick(regime, mults, ts))
            .collect()
    }

    pub fn volatility(&self, symbol: &str) -> f64 {
        self.inner
            .read()
            .symbols
            .get(symbol)
            .map(|s| s.ewma_vol)
            .unwrap_or(0.0)
    }

    pub fn tick_count(&self) -> u64 {
        self.inner.read().tick_count
    }

    /// Recent closed candles from the in-memory aggregator, oldest first.
    pub fn recent_candles(&self, symbol: &str, interval: &str, count: usize) -> Vec<Candle> {
        self.inner.read().candles.recent_closed(symbol, interval, count)
    }

    /// The in-flight candle for a series.
    pub fn current_candle(&self, symbol: &str, interval: &str) -> Option<Candle> {
        self.inner.read().candles.current(symbol, interval)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::universe;

    fn engine(seed: u64) -> MarketEngine {
        MarketEngine::new(universe(), RegimeConfig::default(), 23_400, Some(seed))
    }

    #[test]
    fn tick_pass_emits_one_tick_per_instrument() {
        let eng = engine(7);
        let (batch, _) = eng.tick_pass();
        assert_eq!(batch.len(), universe().len());
        for t in &batch {
            assert!(t.bid < t.ask, "{}: bid {} !< ask {}", t.ticker, t.bid, t.ask);
            assert!(t.price > 0.0);
        }
    }

    #[test]
    fn day_aggregates_bracket_price() {
        let eng = engine(11);
        for _ in 0..200 {
            eng.tick_pass();
        }
        let q = eng.quote("MERX").unwrap();
        assert!(q.low <= q.price && q.price <= q.high);
        assert!(q.volume > 0.0);
    }

    #[test]
    fn shock_moves_mid_and_widens_spread() {
        let eng = engine(13);
        eng.tick_pass();
        let before = eng.quote("MERX").unwrap();
        eng.apply_shock("MERX", 0.10);
        let after = eng.quote("MERX").unwrap();
        assert!(after.price > before.price * 1.09);
        let spread_before = before.ask - before.bid;
        let spread_after = after.ask - after.bid;
        // Spread widened beyond what the 10% price jump alone explains.
        assert!(spread_after / after.price > spread_before / before.price * 1.5);
    }

    #[test]
    fn market_shock_respects_safe_haven_beta() {
        let eng = engine(17);
        eng.tick_pass();
        let gold_before = eng.quote("GLDR").unwrap().price;
        let merx_before = eng.quote("MERX").unwrap().price;
        eng.apply_market_shock(-0.05, 1.0);
        // Beta 1.0 instrument falls; negative-beta safe haven rises.
        assert!(eng.quote("MERX").unwrap().price < merx_before);
        assert!(eng.quote("GLDR").unwrap().price > gold_before);
    }

    #[test]
    fn volatility_rises_after_shock() {
        let eng = engine(19);
        eng.tick_pass();
        let before = eng.volatility("VLTR");
        eng.apply_shock("VLTR", 0.2);
        assert!(eng.volatility("VLTR") > before);
    }

    #[test]
    fn candles_accumulate_in_memory() {
        let eng = engine(23);
        for _ in 0..5 {
            eng.tick_pass();
        }
        assert!(eng.current_candle("MERX", "1m").is_some());
    }
}
