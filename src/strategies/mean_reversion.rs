// =============================================================================
// Mean-reversion handler
// =============================================================================
//
// Bollinger-style bands: SMA(period) +/- num_std * stdev. Price under the
// lower band signals a buy, over the upper band a sell, anything between
// holds.
// =============================================================================

use serde_json::json;

use super::{sma, stdev, MeanReversionConfig, Signal, SignalAction};

pub fn execute(cfg: &MeanReversionConfig, closes: &[f64]) -> Signal {
    let Some(price) = closes.last().copied() else {
        return Signal::hold(&cfg.ticker, "no price history");
    };
    let (Some(mean), Some(sd)) = (sma(closes, cfg.period), stdev(closes, cfg.period)) else {
        return Signal::hold(
            &cfg.ticker,
            format!("warming up: {} of {} bars", closes.len(), cfg.period),
        );
    };

    let lower = mean - cfg.num_std * sd;
    let upper = mean + cfg.num_std * sd;
    let data = json!({"price": price, "sma": mean, "lower": lower, "upper": upper});

    if price < lower {
        Signal {
            action: SignalAction::Buy,
            ticker: cfg.ticker.clone(),
            reason: format!("price {price:.4} under lower band {lower:.4}"),
            data,
        }
    } else if price > upper {
        Signal {
            action: SignalAction::Sell,
            ticker: cfg.ticker.clone(),
            reason: format!("price {price:.4} over upper band {upper:.4}"),
            data,
        }
    } else {
        Signal {
            action: SignalAction::Hold,
            ticker: cfg.ticker.clone(),
            reason: "inside bands".to_string(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::strategies::Sizing;

    fn cfg() -> MeanReversionConfig {
        MeanReversionConfig {
            ticker: "MERX".into(),
            period: 5,
            num_std: 2.0,
            sizing: Sizing::default(),
        }
    }

    #[test]
    fn holds_while_warming_up() {
        let sig = execute(&cfg(), &[100.0, 101.0]);
        assert_eq!(sig.action, SignalAction::Hold);
    }

    #[test]
    fn buys_under_the_lower_band() {
        // Stable around 100, then a sharp drop.
        let closes = [100.0, 100.5, 99.5, 100.0, 90.0];
        let sig = execute(&cfg(), &closes);
        assert_eq!(sig.action, SignalAction::Buy);
    }

    #[test]
    fn sells_over_the_upper_band() {
        let closes = [100.0, 100.5, 99.5, 100.0, 110.0];
        let sig = execute(&cfg(), &closes);
        assert_eq!(sig.action, SignalAction::Sell);
    }

    #[test]
    fn holds_inside_the_bands() {
        let closes = [100.0, 100.5, 99.5, 100.2, 100.1];
        let sig = execute(&cfg(), &closes);
        assert_eq!(sig.action, SignalAction::Hold);
    }
}
