// =============================================================================
// Grid handler
// =============================================================================
//
// Ladders buy levels under a center price and sell levels above it, each
// `spacing_pct` apart. A level fires once and stays inactive until the grid
// recenters; the whole grid recenters when price drifts more than the
// recenter threshold away from the center.
// =============================================================================

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{GridConfig, Signal, SignalAction};

/// Persistent grid footing for one (fund, symbol).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GridState {
    pub center: f64,
    /// Level indexes (1-based) already triggered on the buy side.
    pub active_buy_levels: Vec<usize>,
    pub active_sell_levels: Vec<usize>,
}

impl GridState {
    fn centered_at(center: f64) -> Self {
        Self {
            center,
            active_buy_levels: Vec::new(),
            active_sell_levels: Vec::new(),
        }
    }
}

pub fn execute(cfg: &GridConfig, price: f64, state: &mut Option<GridState>) -> Signal {
    if price <= 0.0 {
        return Signal::hold(&cfg.ticker, "no price");
    }

    let grid = match state {
        Some(g) => g,
        None => {
            *state = Some(GridState::centered_at(price));
            return Signal::hold(&cfg.ticker, format!("grid centered at {price:.4}"));
        }
    };

    // Recenter when price has escaped the grid's neighbourhood.
    let drift_pct = ((price - grid.center) / grid.center).abs() * 100.0;
    if drift_pct >= cfg.recenter_threshold_pct {
        *grid = GridState::centered_at(price);
        return Signal::hold(
            &cfg.ticker,
            format!("grid recentered at {price:.4} after {drift_pct:.2}% drift"),
        );
    }

    let spacing = grid.center * cfg.spacing_pct / 100.0;

    // Deepest untriggered level that price has reached, buy side first.
    for k in 1..=cfg.levels_per_side {
        let level_price = grid.center - k as f64 * spacing;
        if price <= level_price && !grid.active_buy_levels.contains(&k) {
            grid.active_buy_levels.push(k);
            return Signal {
                action: SignalAction::Buy,
                ticker: cfg.ticker.clone(),
                reason: format!("buy level {k} hit at {price:.4} (level {level_price:.4})"),
                data: json!({"level": k, "center": grid.center, "level_price": level_price}),
            };
        }
    }
    for k in 1..=cfg.levels_per_side {
        let level_price = grid.center + k as f64 * spacing;
        if price >= level_price && !grid.active_sell_levels.contains(&k) {
            grid.active_sell_levels.push(k);
            return Signal {
                action: SignalAction::Sell,
                ticker: cfg.ticker.clone(),
                reason: format!("sell level {k} hit at {price:.4} (level {level_price:.4})"),
                data: json!({"level": k, "center": grid.center, "level_price": level_price}),
            };
        }
    }

    Signal::hold(&cfg.ticker, "no grid level reached")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::Sizing;

    fn cfg() -> GridConfig {
        GridConfig {
            ticker: "MERX".into(),
            spacing_pct: 1.0,
            levels_per_side: 3,
            recenter_threshold_pct: 5.0,
            sizing: Sizing::default(),
        }
    }

    #[test]
    fn first_call_centers_the_grid() {
        let mut state = None;
        let sig = execute(&cfg(), 100.0, &mut state);
        assert_eq!(sig.action, SignalAction::Hold);
        assert_eq!(state.as_ref().unwrap().center, 100.0);
    }

    #[test]
    fn buy_level_fires_once() {
        let mut state = Some(GridState::centered_at(100.0));
        // Level 1 sits at 99.0.
        let sig = execute(&cfg(), 98.9, &mut state);
        assert_eq!(sig.action, SignalAction::Buy);

        // Same price again: level already active, nothing fires.
        let sig = execute(&cfg(), 98.9, &mut state);
        assert_eq!(sig.action, SignalAction::Hold);
    }

    #[test]
    fn deeper_moves_fire_deeper_levels() {
        let mut state = Some(GridState::centered_at(100.0));
        assert_eq!(execute(&cfg(), 98.9, &mut state).action, SignalAction::Buy); // level 1
        assert_eq!(execute(&cfg(), 97.9, &mut state).action, SignalAction::Buy); // level 2
        let st = state.as_ref().unwrap();
        assert_eq!(st.active_buy_levels, vec![1, 2]);
    }

    #[test]
    fn sell_side_mirrors() {
        let mut state = Some(GridState::centered_at(100.0));
        let sig = execute(&cfg(), 101.1, &mut state);
        assert_eq!(sig.action, SignalAction::Sell);
        assert_eq!(state.as_ref().unwrap().active_sell_levels, vec![1]);
    }

    #[test]
    fn drift_past_threshold_recenters_and_rearms() {
        let mut state = Some(GridState::centered_at(100.0));
        execute(&cfg(), 98.9, &mut state); // arm level 1

        // 6% below center: recenter.
        let sig = execute(&cfg(), 94.0, &mut state);
        assert_eq!(sig.action, SignalAction::Hold);
        let st = state.as_ref().unwrap();
        assert_eq!(st.center, 94.0);
        assert!(st.active_buy_levels.is_empty());

        // Levels are armed again off the new center.
        let sig = execute(&cfg(), 93.0, &mut state);
        assert_eq!(sig.action, SignalAction::Buy);
    }
}
