// =============================================================================
// Order-book snapshotter
// =============================================================================
//
// Synthesises ten levels of depth per side around the current mid from the
// instrument profile and running volatility, then folds the user's open limit
// orders into the nearest synthetic level (or inserts them as tagged levels).
// The matcher reuses the same synthesis to decide how much of a limit order
// the simulated book can absorb at its level.
// =============================================================================

use chrono::Utc;
use rand::Rng;
use serde::Serialize;

use crate::instruments::InstrumentProfile;
use crate::types::Side;

const LEVELS_PER_SIDE: usize = 10;

/// One price level. `user` marks levels created or augmented by resting user
/// limit orders.
#[derive(Debug, Clone, Serialize)]
pub struct BookLevel {
    pub price: f64,
    pub qty: f64,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub user: bool,
}

/// Snapshot pushed over the hub and returned by the book endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct BookSnapshot {
    pub ticker: String,
    /// Descending by price.
    pub bids: Vec<BookLevel>,
    /// Ascending by price.
    pub asks: Vec<BookLevel>,
    pub spread: f64,
    pub mid: f64,
    pub timestamp: i64,
}

/// A resting user limit to overlay onto the synthetic book.
#[derive(Debug, Clone)]
pub struct OpenLimit {
    pub side: Side,
    pub price: f64,
    pub remaining_qty: f64,
}

/// Build the synthetic book for one symbol.
pub fn build_book<R: Rng>(
    profile: &InstrumentProfile,
    mid: f64,
    vol: f64,
    open_limits: &[OpenLimit],
    rng: &mut R,
) -> BookSnapshot {
    let step = (mid * vol * 0.015).max(profile.price_tick());

    let mut bids = Vec::with_capacity(LEVELS_PER_SIDE + open_limits.len());
    let mut asks = Vec::with_capacity(LEVELS_PER_SIDE + open_limits.len());

    for i in 1..=LEVELS_PER_SIDE {
        let base_qty = (800 - 50 * i) as f64;
        let bid_qty = (base_qty * rng.gen_range(0.5..1.5)).floor();
        let ask_qty = (base_qty * rng.gen_range(0.5..1.5)).floor();
        bids.push(BookLevel {
            price: mid - i as f64 * step,
            qty: bid_qty.max(1.0),
            user: false,
        });
        asks.push(BookLevel {
            price: mid + i as f64 * step,
            qty: ask_qty.max(1.0),
            user: false,
        });
    }

    for limit in open_limits {
        if limit.remaining_qty <= 0.0 {
            continue;
        }
        let side_levels = match limit.side {
            Side::Buy => &mut bids,
            Side::Sell => &mut asks,
        };
        fold_limit(side_levels, limit, step);
    }

    bids.sort_by(|a, b| b.price.total_cmp(&a.price));
    asks.sort_by(|a, b| a.price.total_cmp(&b.price));
    bids.truncate(LEVELS_PER_SIDE);
    asks.truncate(LEVELS_PER_SIDE);

    let best_bid = bids.first().map(|l| l.price).unwrap_or(mid);
    let best_ask = asks.first().map(|l| l.price).unwrap_or(mid);

    BookSnapshot {
        ticker: profile.symbol.clone(),
        bids,
        asks,
        spread: best_ask - best_bid,
        mid,
        timestamp: Utc::now().timestamp_millis(),
    }
}

/// Merge one user limit into the closest level within half a step, or insert
/// it as a fresh tagged level.
fn fold_limit(levels: &mut Vec<BookLevel>, limit: &OpenLimit, step: f64) {
    let closest = levels
        .iter_mut()
        .min_by(|a, b| {
            (a.price - limit.price)
                .abs()
                .total_cmp(&(b.price - limit.price).abs())
        })
        .filter(|l| (l.price - limit.price).abs() <= 0.5 * step);

    match closest {
        Some(level) => {
            level.qty += limit.remaining_qty;
            level.user = true;
        }
        None => levels.push(BookLevel {
            price: limit.price,
            qty: limit.remaining_qty,
            user: true,
        }),
    }
}

/// Simulated depth available at the level nearest `price` on `side`.
/// Used by the matcher's partial-fill policy for limit orders.
pub fn depth_near(book: &BookSnapshot, side: Side, price: f64) -> f64 {
    let levels = match side {
        // A resting buy limit trades against the ask side and vice versa.
        Side::Buy => &book.asks,
        Side::Sell => &book.bids,
    };
    levels
        .iter()
        .min_by(|a, b| {
            (a.price - price)
                .abs()
                .total_cmp(&(b.price - price).abs())
        })
        .map(|l| l.qty)
        .unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::universe;
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    fn profile() -> InstrumentProfile {
        universe().into_iter().find(|p| p.symbol == "MERX").unwrap()
    }

    #[test]
    fn ten_levels_sorted_each_side() {
        let mut rng = ChaCha8Rng::seed_from_u64(1);
        let book = build_book(&profile(), 100.0, 0.02, &[], &mut rng);
        assert_eq!(book.bids.len(), 10);
        assert_eq!(book.asks.len(), 10);
        for w in book.bids.windows(2) {
            assert!(w[0].price > w[1].price);
        }
        for w in book.asks.windows(2) {
            assert!(w[0].price < w[1].price);
        }
        assert!(book.spread > 0.0);
    }

    #[test]
    fn step_floor_is_price_tick() {
        let mut rng = ChaCha8Rng::seed_from_u64(2);
        // Zero volatility collapses the step to the price tick.
        let book = build_book(&profile(), 100.0, 0.0, &[], &mut rng);
        let gap = book.asks[1].price - book.asks[0].price;
        assert!((gap - 0.01).abs() < 1e-9);
    }

    #[test]
    fn user_limit_merges_into_nearby_level() {
        let mut rng = ChaCha8Rng::seed_from_u64(3);
        let mid = 100.0;
        let vol = 0.02;
        let step = mid * vol * 0.015;
        let limit = OpenLimit {
            side: Side::Buy,
            price: mid - step, // exactly level 1
            remaining_qty: 500.0,
        };
        let plain = build_book(&profile(), mid, vol, &[], &mut ChaCha8Rng::seed_from_u64(3));
        let with_user = build_book(&profile(), mid, vol, &[limit], &mut rng);
        assert!(with_user.bids[0].user);
        assert!(with_user.bids[0].qty >= plain.bids[0].qty + 500.0 - 1.0);
    }

    #[test]
    fn distant_user_limit_becomes_tagged_level() {
        let mut rng = ChaCha8Rng::seed_from_u64(4);
        let limit = OpenLimit {
            side: Side::Sell,
            price: 103.5, // far outside the synthetic grid spacing
            remaining_qty: 42.0,
        };
        let book = build_book(&profile(), 100.0, 0.02, &[limit], &mut rng);
        let found = book
            .asks
            .iter()
            .find(|l| (l.price - 103.5).abs() < 1e-9)
            .expect("user level present");
        assert!(found.user);
        assert_eq!(found.qty, 42.0);
    }

    #[test]
    fn depth_near_reads_opposite_side() {
        let mut rng = ChaCha8Rng::seed_from_u64(5);
        let book = build_book(&profile(), 100.0, 0.02, &[], &mut rng);
        let d = depth_near(&book, Side::Buy, book.asks[0].price);
        assert_eq!(d, book.asks[0].qty);
    }
}
