// =============================================================================
// Momentum handler
// =============================================================================
//
// n-bar rate of change with zero-crossover entries: momentum crossing up
// through zero buys, crossing down sells. The previous reading lives in the
// runner's handler state so crossovers survive between passes.
// =============================================================================

use serde_json::json;

use super::{MomentumConfig, Signal, SignalAction};

pub fn execute(cfg: &MomentumConfig, closes: &[f64], last_momentum: &mut Option<f64>) -> Signal {
    if closes.len() < cfg.lookback + 1 {
        return Signal::hold(
            &cfg.ticker,
            format!("warming up: {} of {} bars", closes.len(), cfg.lookback + 1),
        );
    }

    let now = closes[closes.len() - 1];
    let then = closes[closes.len() - 1 - cfg.lookback];
    if then == 0.0 {
        return Signal::hold(&cfg.ticker, "degenerate history");
    }
    let momentum = (now - then) / then;
    let prev = last_momentum.replace(momentum);

    let data = json!({"momentum": momentum, "previous": prev});
    match prev {
        Some(p) if p <= 0.0 && momentum > 0.0 => Signal {
            action: SignalAction::Buy,
            ticker: cfg.ticker.clone(),
            reason: format!("momentum crossed up through zero ({p:.5} -> {momentum:.5})"),
            data,
        },
        Some(p) if p >= 0.0 && momentum < 0.0 => Signal {
            action: SignalAction::Sell,
            ticker: cfg.ticker.clone(),
            reason: format!("momentum crossed down through zero ({p:.5} -> {momentum:.5})"),
            data,
        },
        Some(_) => Signal {
            action: SignalAction::Hold,
            ticker: cfg.ticker.clone(),
            reason: "no crossover".to_string(),
            data,
        },
        // First reading: nothing to cross against yet.
        None => Signal {
            action: SignalAction::Hold,
            ticker: cfg.ticker.clone(),
            reason: "first momentum reading".to_string(),
            data,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::Sizing;

    fn cfg() -> MomentumConfig {
        MomentumConfig {
            ticker: "MERX".into(),
            lookback: 3,
            sizing: Sizing::default(),
        }
    }

    #[test]
    fn first_reading_never_trades() {
        let mut state = None;
        let sig = execute(&cfg(), &[100.0, 99.0, 98.0, 101.0], &mut state);
        assert_eq!(sig.action, SignalAction::Hold);
        assert!(state.is_some());
    }

    #[test]
    fn buy_on_upward_zero_cross() {
        let mut state = Some(-0.01);
        // momentum = (103 - 100) / 100 > 0
        let sig = execute(&cfg(), &[100.0, 101.0, 99.0, 103.0], &mut state);
        assert_eq!(sig.action, SignalAction::Buy);
        assert!(state.unwrap() > 0.0);
    }

    #[test]
    fn sell_on_downward_zero_cross() {
        let mut state = Some(0.02);
        let sig = execute(&cfg(), &[100.0, 101.0, 102.0, 97.0], &mut state);
        assert_eq!(sig.action, SignalAction::Sell);
    }

    #[test]
    fn no_signal_without_crossover() {
        let mut state = Some(0.01);
        let sig = execute(&cfg(), &[100.0, 101.0, 102.0, 103.0], &mut state);
        assert_eq!(sig.action, SignalAction::Hold);
    }
}
