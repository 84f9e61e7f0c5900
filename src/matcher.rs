// =============================================================================
// Order matcher
// =============================================================================
//
// Subscribes to tick batches and walks the open order book against them.
// Each fill is its own repository transaction (cash move, position upsert,
// trade insert, order update, OCO sibling cancellation) followed by a fill
// event on the bus, so a cancelled tick pass never leaves half a fill behind.
//
// Trigger semantics per order type:
//   market        fill now at ask (buy) / bid (sell)
//   limit         fill when mid crosses the limit favourably, at the better
//                 of mid and the limit; partial per simulated depth
//   stop / stop-loss
//                 convert to market once mid crosses the stop
//   take-profit   convert to market once mid crosses the target favourably
//   stop-limit    once the stop triggers, rest as a plain limit
//   trailing-stop track the high-water (low-water for covers) and convert to
//                 market on the configured giveback
//
// The margin sweep runs after order matching on every pass: any user whose
// equity has fallen under the maintenance floor against gross short exposure
// gets force-covered at the ask, one margin_call event per user per pass.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::bus::{EventBus, FillEvent, MarginCallEvent};
use crate::config::{RegimeConfig, RuntimeConfig};
use crate::exec_model;
use crate::instruments::InstrumentProfile;
use crate::market::orderbook;
use crate::market::regime::multipliers_for;
use crate::market::Tick;
use crate::repo::{trading, OrderRow, PositionRow, Repository, TradeRow};
use crate::types::{OrderStatus, OrderType, Side};

pub struct Matcher {
    repo: Arc<Repository>,
    bus: Arc<EventBus>,
    instruments: HashMap<String, InstrumentProfile>,
    regime_cfg: RegimeConfig,
    maintenance_margin_pct: f64,
    /// A pass abandons remaining orders past this point; every fill already
    /// booked committed in its own transaction.
    pass_budget: std::time::Duration,
    rng: Mutex<ChaCha8Rng>,
}

/// What a trigger evaluation decided for one order on one tick.
enum Action {
    None,
    /// Fill `qty` at `ref_price`.
    Fill { qty: f64, ref_price: f64 },
    /// Stop-limit armed; it rests as a limit from the next pass.
    ArmStopLimit,
}

impl Matcher {
    pub fn new(
        repo: Arc<Repository>,
        bus: Arc<EventBus>,
        instruments: HashMap<String, InstrumentProfile>,
        cfg: &RuntimeConfig,
        seed: Option<u64>,
    ) -> Self {
        Self {
            repo,
            bus,
            instruments,
            regime_cfg: cfg.regime.clone(),
            maintenance_margin_pct: cfg.maintenance_margin_pct,
            pass_budget: std::time::Duration::from_millis((cfg.tick_interval_ms * 4 / 5).max(50)),
            rng: Mutex::new(match seed {
                Some(s) => ChaCha8Rng::seed_from_u64(s),
                None => ChaCha8Rng::from_entropy(),
            }),
        }
    }

    /// One full matching pass over a tick batch. Never panics; per-order
    /// failures are logged and skipped.
    pub fn on_tick_batch(&self, ticks: &[Tick]) {
        let by_symbol: HashMap<&str, &Tick> =
            ticks.iter().map(|t| (t.ticker.as_str(), t)).collect();

        let open_orders = match self.repo.get_open_orders() {
            Ok(orders) => orders,
            Err(e) => {
                warn!(error = %e, "matcher skipping pass, open orders unavailable");
                return;
            }
        };

        let pass_start = std::time::Instant::now();
        for order in open_orders {
            if pass_start.elapsed() > self.pass_budget {
                warn!(
                    budget_ms = self.pass_budget.as_millis() as u64,
                    "tick pass budget exhausted, deferring remaining orders"
                );
                break;
            }
            let Some(tick) = by_symbol.get(order.symbol.as_str()) else {
                continue;
            };
            if let Err(e) = self.process_order(&order, tick) {
                error!(order_id = %order.id, error = %e, "order processing failed");
            }
        }

        if let Err(e) = self.margin_sweep(&by_symbol) {
            error!(error = %e, "margin sweep failed");
        }
    }

    fn process_order(&self, order: &OrderRow, tick: &Tick) -> anyhow::Result<()> {
        match self.evaluate(order, tick)? {
            Action::None => Ok(()),
            Action::ArmStopLimit => {
                self.repo.clear_order_stop(&order.id)?;
                debug!(order_id = %order.id, "stop-limit armed");
                Ok(())
            }
            Action::Fill { qty, ref_price } => self.execute_fill(order, qty, ref_price, tick),
        }
    }

    /// Decide whether this tick triggers the order, and for how much.
    fn evaluate(&self, order: &OrderRow, tick: &Tick) -> anyhow::Result<Action> {
        let mid = tick.price;
        let remaining = order.remaining_qty();
        if remaining <= 0.0 {
            return Ok(Action::None);
        }

        let market_ref = match order.side {
            Side::Buy => tick.ask,
            Side::Sell => tick.bid,
        };

        let action = match order.order_type {
            OrderType::Market => Action::Fill {
                qty: remaining,
                ref_price: market_ref,
            },

            OrderType::Limit => self.evaluate_limit(order, tick, remaining),

            OrderType::Stop | OrderType::StopLoss => {
                let Some(stop) = order.stop_price else {
                    return Ok(Action::None);
                };
                let triggered = match order.side {
                    Side::Buy => mid >= stop,
                    Side::Sell => mid <= stop,
                };
                if triggered {
                    Action::Fill {
                        qty: remaining,
                        ref_price: market_ref,
                    }
                } else {
                    Action::None
                }
            }

            OrderType::TakeProfit => {
                let Some(target) = order.stop_price else {
                    return Ok(Action::None);
                };
                // Favourable cross: a sell target takes profit above, a buy
                // target covers below.
                let triggered = match order.side {
                    Side::Buy => mid <= target,
                    Side::Sell => mid >= target,
                };
                if triggered {
                    Action::Fill {
                        qty: remaining,
                        ref_price: market_ref,
                    }
                } else {
                    Action::None
                }
            }

            OrderType::StopLimit => {
                match order.stop_price {
                    Some(stop) => {
                        let triggered = match order.side {
                            Side::Buy => mid >= stop,
                            Side::Sell => mid <= stop,
                        };
                        if triggered {
                            Action::ArmStopLimit
                        } else {
                            Action::None
                        }
                    }
                    // Already armed: behaves as a plain limit.
                    None => self.evaluate_limit(order, tick, remaining),
                }
            }

            OrderType::TrailingStop => self.evaluate_trailing(order, tick, remaining, market_ref)?,
        };

        Ok(action)
    }

    fn evaluate_limit(&self, order: &OrderRow, tick: &Tick, remaining: f64) -> Action {
        let Some(limit) = order.limit_price else {
            return Action::None;
        };
        let mid = tick.price;
        let crossed = match order.side {
            Side::Buy => mid <= limit,
            Side::Sell => mid >= limit,
        };
        if !crossed {
            return Action::None;
        }
        let ref_price = match order.side {
            Side::Buy => mid.min(limit),
            Side::Sell => mid.max(limit),
        };

        // Book-aware partial policy: the level nearest the limit bounds how
        // much can trade this pass.
        let Some(profile) = self.instruments.get(&order.symbol) else {
            return Action::None;
        };
        let book = {
            let mut rng = self.rng.lock();
            orderbook::build_book(profile, mid, tick.volatility, &[], &mut *rng)
        };
        let depth = orderbook::depth_near(&book, order.side, limit);
        let qty = remaining.min(depth.max(0.0));
        if qty < 1.0 {
            return Action::None;
        }
        Action::Fill { qty, ref_price }
    }

    fn evaluate_trailing(
        &self,
        order: &OrderRow,
        tick: &Tick,
        remaining: f64,
        market_ref: f64,
    ) -> anyhow::Result<Action> {
        let Some(trail_pct) = order.trail_pct else {
            return Ok(Action::None);
        };
        let mid = tick.price;

        match order.side {
            // Long exit: ratchet the high-water up, trigger on the giveback.
            Side::Sell => {
                let high = order.trail_high.unwrap_or(mid).max(mid);
                if Some(high) != order.trail_high {
                    self.repo.update_order_trail_high(&order.id, high)?;
                }
                if mid <= high * (1.0 - trail_pct) {
                    return Ok(Action::Fill {
                        qty: remaining,
                        ref_price: market_ref,
                    });
                }
            }
            // Short cover: mirror with a low-water mark.
            Side::Buy => {
                let low = order.trail_high.unwrap_or(mid).min(mid);
                if Some(low) != order.trail_high {
                    self.repo.update_order_trail_high(&order.id, low)?;
                }
                if mid >= low * (1.0 + trail_pct) {
                    return Ok(Action::Fill {
                        qty: remaining,
                        ref_price: market_ref,
                    });
                }
            }
        }
        Ok(Action::None)
    }

    // =========================================================================
    // Fill execution
    // =========================================================================

    /// Book one fill atomically, then publish the fill event.
    fn execute_fill(
        &self,
        order: &OrderRow,
        fill_qty: f64,
        ref_price: f64,
        tick: &Tick,
    ) -> anyhow::Result<()> {
        let profile = self
            .instruments
            .get(&order.symbol)
            .ok_or_else(|| anyhow::anyhow!("unknown instrument {}", order.symbol))?;
        let mults = multipliers_for(&self.regime_cfg, tick.regime);

        // Short exposure this fill opens, from the current position.
        let position = self.repo.get_position(&order.user_id, &order.symbol)?;
        let held_qty = position.as_ref().map(|p| p.qty).unwrap_or(0.0);
        let opens_short_qty = match order.side {
            Side::Buy => 0.0,
            Side::Sell => (fill_qty - held_qty.max(0.0)).max(0.0),
        };

        // Borrow accrues for the time the order was working.
        let elapsed_ms = order_age_ms(order, tick.timestamp);

        let est = exec_model::estimate(
            profile,
            order.side,
            fill_qty,
            ref_price,
            tick.price,
            tick.volatility,
            mults,
            opens_short_qty,
            elapsed_ms,
        );

        let now = Utc::now().to_rfc3339();
        let executed_at_ms = Utc::now().timestamp_millis();
        let trade_id = Uuid::new_v4().to_string();
        let order_id = order.id.clone();
        let user_id = order.user_id.clone();
        let symbol = order.symbol.clone();
        let side = order.side;
        let regime_tag = tick.regime.to_string();

        let result = self.repo.run_in_transaction("book_fill", |tx| {
            let Some(user) = trading::tx_get_user_for_update(tx, &user_id)? else {
                trading::tx_mark_order_rejected(tx, &order_id, "user_missing")?;
                return Ok(None);
            };

            // Cash check at commit time catches the place-vs-fill race.
            // Sell proceeds net against the costs they fund.
            let cash_needed = match side {
                Side::Buy => fill_qty * est.fill_price + est.commission,
                Side::Sell => {
                    (est.commission + est.borrow_accrual - fill_qty * est.fill_price).max(0.0)
                }
            };
            if user.cash + 1e-9 < cash_needed {
                trading::tx_mark_order_rejected(tx, &order_id, "insufficient_cash")?;
                info!(order_id = %order_id, "order rejected at fill time, insufficient cash");
                return Ok(None);
            }

            // Position math: weighted-average on adds, proportional realised
            // P&L on closes, re-anchored cost when flipping direction.
            let existing = trading::tx_get_position(tx, &user_id, &symbol)?;
            let (new_pos, realized_pnl) =
                apply_fill_to_position(existing.as_ref(), &user_id, &symbol, side, fill_qty, est.fill_price);
            trading::tx_upsert_position(tx, &new_pos)?;

            let cash_delta = match side {
                Side::Buy => -(fill_qty * est.fill_price) - est.commission - est.borrow_accrual,
                Side::Sell => fill_qty * est.fill_price - est.commission - est.borrow_accrual,
            };
            trading::tx_adjust_user_cash(tx, &user_id, cash_delta)?;

            trading::tx_insert_trade(
                tx,
                &TradeRow {
                    id: trade_id.clone(),
                    user_id: user_id.clone(),
                    order_id: order_id.clone(),
                    symbol: symbol.clone(),
                    side,
                    qty: fill_qty,
                    fill_price: est.fill_price,
                    gross_notional: fill_qty * est.fill_price,
                    commission: est.commission,
                    slippage_cost: est.slippage_cost,
                    borrow_cost: est.borrow_accrual,
                    realized_pnl,
                    regime: regime_tag.clone(),
                    executed_at: now.clone(),
                },
            )?;

            let new_filled = order.filled_qty + fill_qty;
            let status = if new_filled + 1e-9 >= order.qty {
                OrderStatus::Filled
            } else {
                OrderStatus::Partial
            };
            trading::tx_update_order_fill(
                tx,
                &order_id,
                new_filled,
                status,
                (status == OrderStatus::Filled).then_some(now.as_str()),
            )?;

            // First execution in an OCO group retires the siblings.
            if let Some(group) = &order.oco_group_id {
                trading::tx_cancel_oco_siblings(tx, group, &order_id, &now)?;
            }

            Ok(Some(realized_pnl))
        })?;

        let Some(realized_pnl) = result else {
            return Ok(());
        };

        info!(
            order_id = %order.id,
            symbol = %order.symbol,
            side = %order.side,
            qty = fill_qty,
            price = est.fill_price,
            realized_pnl,
            "fill booked"
        );

        // Published strictly after the commit above.
        self.bus.publish_fill(FillEvent {
            user_id: order.user_id.clone(),
            order_id: order.id.clone(),
            ticker: order.symbol.clone(),
            side: order.side,
            qty: fill_qty,
            price: est.fill_price,
            commission: est.commission,
            slippage_bps: est.slippage_bps,
            borrow_cost: est.borrow_accrual,
            pnl: realized_pnl,
            executed_at: executed_at_ms,
        });

        Ok(())
    }

    // =========================================================================
    // Forced liquidation
    // =========================================================================

    /// Cover the shorts of any user whose equity fell under the maintenance
    /// floor. One margin_call per user per pass.
    fn margin_sweep(&self, marks: &HashMap<&str, &Tick>) -> anyhow::Result<()> {
        let shorts = self.repo.get_short_positions()?;
        if shorts.is_empty() {
            return Ok(());
        }

        let mut seen: HashSet<String> = HashSet::new();
        for short in &shorts {
            if !seen.insert(short.user_id.clone()) {
                continue;
            }
            let Some(user) = self.repo.get_user(&short.user_id)? else {
                continue;
            };

            let positions = self.repo.get_positions(&user.id)?;
            let mut mark_to_market = 0.0;
            let mut gross_short_notional = 0.0;
            for pos in &positions {
                let Some(tick) = marks.get(pos.symbol.as_str()) else {
                    continue;
                };
                mark_to_market += pos.qty * tick.price;
                if pos.qty < 0.0 {
                    gross_short_notional += pos.qty.abs() * tick.price;
                }
            }

            let equity = user.cash + mark_to_market;
            let floor = gross_short_notional * self.maintenance_margin_pct / 100.0;
            if gross_short_notional <= 0.0 || equity >= floor {
                continue;
            }

            warn!(
                user_id = %user.id,
                equity,
                floor,
                gross_short_notional,
                "maintenance margin breached, force-covering shorts"
            );

            for pos in positions.iter().filter(|p| p.qty < 0.0) {
                let Some(tick) = marks.get(pos.symbol.as_str()) else {
                    continue;
                };
                let cover_qty = pos.qty.abs();
                let unrealized = (pos.avg_cost - tick.price) * cover_qty;

                self.bus.publish_margin_call(MarginCallEvent {
                    user_id: user.id.clone(),
                    ticker: pos.symbol.clone(),
                    qty: cover_qty,
                    price: tick.price,
                    pnl: unrealized,
                });

                // Synthetic buy-to-cover market order, then an ordinary fill.
                let cover = OrderRow {
                    id: Uuid::new_v4().to_string(),
                    user_id: user.id.clone(),
                    symbol: pos.symbol.clone(),
                    order_type: OrderType::Market,
                    side: Side::Buy,
                    qty: cover_qty,
                    filled_qty: 0.0,
                    limit_price: None,
                    stop_price: None,
                    trail_pct: None,
                    trail_high: None,
                    oco_group_id: None,
                    status: OrderStatus::Open,
                    reject_reason: None,
                    created_at: Utc::now().to_rfc3339(),
                    cancelled_at: None,
                    filled_at: None,
                };
                self.repo.insert_order(&cover)?;
                if let Err(e) = self.execute_cover(&cover, tick) {
                    error!(user_id = %user.id, symbol = %pos.symbol, error = %e, "forced cover failed");
                }
            }
        }
        Ok(())
    }

    /// A forced cover must go through even when cash is short; the ordinary
    /// fill path would reject it.
    fn execute_cover(&self, order: &OrderRow, tick: &Tick) -> anyhow::Result<()> {
        let profile = self
            .instruments
            .get(&order.symbol)
            .ok_or_else(|| anyhow::anyhow!("unknown instrument {}", order.symbol))?;
        let mults = multipliers_for(&self.regime_cfg, tick.regime);
        let est = exec_model::estimate(
            profile,
            Side::Buy,
            order.qty,
            tick.ask,
            tick.price,
            tick.volatility,
            mults,
            0.0,
            0,
        );

        let now = Utc::now().to_rfc3339();
        let executed_at_ms = Utc::now().timestamp_millis();
        let trade_id = Uuid::new_v4().to_string();
        let regime_tag = tick.regime.to_string();

        let realized_pnl = self.repo.run_in_transaction("forced_cover", |tx| {
            let existing = trading::tx_get_position(tx, &order.user_id, &order.symbol)?;
            let (new_pos, realized) = apply_fill_to_position(
                existing.as_ref(),
                &order.user_id,
                &order.symbol,
                Side::Buy,
                order.qty,
                est.fill_price,
            );
            trading::tx_upsert_position(tx, &new_pos)?;
            trading::tx_adjust_user_cash(
                tx,
                &order.user_id,
                -(order.qty * est.fill_price) - est.commission,
            )?;
            trading::tx_insert_trade(
                tx,
                &TradeRow {
                    id: trade_id.clone(),
                    user_id: order.user_id.clone(),
                    order_id: order.id.clone(),
                    symbol: order.symbol.clone(),
                    side: Side::Buy,
                    qty: order.qty,
                    fill_price: est.fill_price,
                    gross_notional: order.qty * est.fill_price,
                    commission: est.commission,
                    slippage_cost: est.slippage_cost,
                    borrow_cost: 0.0,
                    realized_pnl: realized,
                    regime: regime_tag.clone(),
                    executed_at: now.clone(),
                },
            )?;
            trading::tx_update_order_fill(tx, &order.id, order.qty, OrderStatus::Filled, Some(&now))?;
            Ok(realized)
        })?;

        self.bus.publish_fill(FillEvent {
            user_id: order.user_id.clone(),
            order_id: order.id.clone(),
            ticker: order.symbol.clone(),
            side: Side::Buy,
            qty: order.qty,
            price: est.fill_price,
            commission: est.commission,
            slippage_bps: est.slippage_bps,
            borrow_cost: 0.0,
            pnl: realized_pnl,
            executed_at: executed_at_ms,
        });
        Ok(())
    }
}

/// Position arithmetic shared by ordinary fills and forced covers.
///
/// Same-direction adds blend the average cost by quantity; opposite-direction
/// fills realise P&L proportionally to the closed quantity, and a fill that
/// crosses through zero re-anchors the average at the fill price.
fn apply_fill_to_position(
    existing: Option<&PositionRow>,
    user_id: &str,
    symbol: &str,
    side: Side,
    fill_qty: f64,
    fill_price: f64,
) -> (PositionRow, f64) {
    let held = existing.map(|p| p.qty).unwrap_or(0.0);
    let avg = existing.map(|p| p.avg_cost).unwrap_or(0.0);
    let signed_fill = side.direction() * fill_qty;
    let new_qty = held + signed_fill;

    let (new_avg, realized) = if held == 0.0 || held.signum() == signed_fill.signum() {
        // Opening or adding: weighted average, nothing realised.
        let blended = (held.abs() * avg + fill_qty * fill_price) / (held.abs() + fill_qty);
        (blended, 0.0)
    } else {
        let close_qty = fill_qty.min(held.abs());
        let realized = (fill_price - avg) * close_qty * held.signum();
        if new_qty == 0.0 {
            (0.0, realized)
        } else if new_qty.signum() == held.signum() {
            // Partially closed: cost basis of the remainder is unchanged.
            (avg, realized)
        } else {
            // Flipped through zero: the new direction opens at the fill.
            (fill_price, realized)
        }
    };

    (
        PositionRow {
            user_id: user_id.to_string(),
            symbol: symbol.to_string(),
            qty: new_qty,
            avg_cost: new_avg,
            cost_basis: new_qty * new_avg,
        },
        realized,
    )
}

fn order_age_ms(order: &OrderRow, now_ms: i64) -> u64 {
    chrono::DateTime::parse_from_rfc3339(&order.created_at)
        .map(|dt| (now_ms - dt.timestamp_millis()).max(0) as u64)
        .unwrap_or(0)
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::instruments::universe_map;
    use crate::market::regime::MarketRegime;
    use crate::repo::test_repo;
    use crate::types::UserRole;

    fn runtime_cfg() -> RuntimeConfig {
        RuntimeConfig::default()
    }

    fn make_matcher(repo: Arc<Repository>, bus: Arc<EventBus>) -> Matcher {
        Matcher::new(repo, bus, universe_map(), &runtime_cfg(), Some(99))
    }

    fn seed_user(repo: &Repository, id: &str, cash: f64) {
        repo.insert_user(&crate::repo::User {
            id: id.into(),
            username: format!("user-{id}"),
            password_hash: "x".into(),
            cash,
            starting_cash: cash,
            role: UserRole::Trader,
            created_at: Utc::now().to_rfc3339(),
        })
        .unwrap();
    }

    fn flat_tick(symbol: &str, mid: f64) -> Tick {
        Tick {
            ticker: symbol.into(),
            price: mid,
            bid: mid,
            ask: mid,
            open: mid,
            high: mid,
            low: mid,
            prev_close: mid,
            volume: 0.0,
            change_pct: 0.0,
            regime: MarketRegime::Normal,
            volatility: 0.0,
            timestamp: Utc::now().timestamp_millis(),
        }
    }

    fn market_order(id: &str, user: &str, symbol: &str, side: Side, qty: f64) -> OrderRow {
        OrderRow {
            id: id.into(),
            user_id: user.into(),
            symbol: symbol.into(),
            order_type: OrderType::Market,
            side,
            qty,
            filled_qty: 0.0,
            limit_price: None,
            stop_price: None,
            trail_pct: None,
            trail_high: None,
            oco_group_id: None,
            status: OrderStatus::Open,
            reject_reason: None,
            created_at: Utc::now().to_rfc3339(),
            cancelled_at: None,
            filled_at: None,
        }
    }

    #[tokio::test]
    async fn market_buy_books_fill_cash_and_position() {
        let (repo, _d) = test_repo();
        let repo = Arc::new(repo);
        let bus = Arc::new(EventBus::new(16));
        let mut fills = bus.subscribe_fills();
        let matcher = make_matcher(repo.clone(), bus.clone());

        seed_user(&repo, "u1", 100_000.0);
        repo.insert_order(&market_order("o1", "u1", "MERX", Side::Buy, 100.0)).unwrap();

        matcher.on_tick_batch(&[flat_tick("MERX", 100.0)]);

        // Scenario: mid=bid=ask=100, vol=0, normal regime. Fill lands at
        // ref * (1 + base_spread_bps/1e4).
        let profile = universe_map().remove("MERX").unwrap();
        let expected_fill = 100.0 * (1.0 + profile.base_spread_bps / 10_000.0);

        let order = repo.get_order("o1").unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        assert_eq!(order.filled_qty, 100.0);

        let pos = repo.get_position("u1", "MERX").unwrap().unwrap();
        assert_eq!(pos.qty, 100.0);
        assert!((pos.avg_cost - expected_fill).abs() < 1e-9);

        let trades = repo.get_trades_by_user("u1", 10).unwrap();
        assert_eq!(trades.len(), 1);
        let commission = trades[0].commission;
        let expected_commission =
            (100.0 * expected_fill * profile.commission_bps / 10_000.0).max(profile.commission_min);
        assert!((commission - expected_commission).abs() < 1e-9);

        let user = repo.get_user("u1").unwrap().unwrap();
        let expected_cash = 100_000.0 - 100.0 * expected_fill - commission;
        assert!((user.cash - expected_cash).abs() < 1e-6);

        let fill = fills.try_recv().expect("fill event published");
        assert_eq!(fill.order_id, "o1");
        assert!((fill.price - expected_fill).abs() < 1e-9);
    }

    #[tokio::test]
    async fn limit_buy_waits_for_cross_then_fills_at_better_price() {
        let (repo, _d) = test_repo();
        let repo = Arc::new(repo);
        let bus = Arc::new(EventBus::new(16));
        let matcher = make_matcher(repo.clone(), bus);

        seed_user(&repo, "u1", 50_000.0);
        let mut o = market_order("o1", "u1", "MERX", Side::Buy, 10.0);
        o.order_type = OrderType::Limit;
        o.limit_price = Some(99.0);
        repo.insert_order(&o).unwrap();

        // Mid above the limit: nothing happens.
        matcher.on_tick_batch(&[flat_tick("MERX", 100.0)]);
        assert_eq!(
            repo.get_order("o1").unwrap().unwrap().status,
            OrderStatus::Open
        );

        // Mid drops through: fills at min(mid, limit) = 98.5 reference.
        matcher.on_tick_batch(&[flat_tick("MERX", 98.5)]);
        let order = repo.get_order("o1").unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Filled);
        let trades = repo.get_trades_by_user("u1", 10).unwrap();
        // Fill price carries the impact markup off the 98.5 reference.
        assert!(trades[0].fill_price < 99.0);
        assert!(trades[0].fill_price >= 98.5);
    }

    #[tokio::test]
    async fn insufficient_cash_rejects_at_fill_time() {
        let (repo, _d) = test_repo();
        let repo = Arc::new(repo);
        let bus = Arc::new(EventBus::new(16));
        let matcher = make_matcher(repo.clone(), bus);

        seed_user(&repo, "u1", 50.0);
        repo.insert_order(&market_order("o1", "u1", "MERX", Side::Buy, 100.0)).unwrap();
        matcher.on_tick_batch(&[flat_tick("MERX", 100.0)]);

        let order = repo.get_order("o1").unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Rejected);
        assert_eq!(order.reject_reason.as_deref(), Some("insufficient_cash"));
        // Cash untouched.
        assert_eq!(repo.get_user("u1").unwrap().unwrap().cash, 50.0);
    }

    #[tokio::test]
    async fn position_closure_zeroes_out_and_realizes_pnl() {
        let (repo, _d) = test_repo();
        let repo = Arc::new(repo);
        let bus = Arc::new(EventBus::new(16));
        let matcher = make_matcher(repo.clone(), bus);

        seed_user(&repo, "u1", 1_000_000.0);
        repo.insert_order(&market_order("b", "u1", "MERX", Side::Buy, 100.0)).unwrap();
        matcher.on_tick_batch(&[flat_tick("MERX", 100.0)]);
        let entry = repo.get_position("u1", "MERX").unwrap().unwrap().avg_cost;

        repo.insert_order(&market_order("s", "u1", "MERX", Side::Sell, 100.0)).unwrap();
        matcher.on_tick_batch(&[flat_tick("MERX", 110.0)]);

        // Net signed quantity is zero: the row is gone.
        assert!(repo.get_position("u1", "MERX").unwrap().is_none());

        let trades = repo.get_trades_by_user("u1", 10).unwrap();
        let close = trades.iter().find(|t| t.side == Side::Sell).unwrap();
        let expected = (close.fill_price - entry) * 100.0;
        assert!((close.realized_pnl - expected).abs() < 1e-6);
        assert!(close.realized_pnl > 0.0);
    }

    #[tokio::test]
    async fn trailing_stop_ratchets_then_triggers() {
        let (repo, _d) = test_repo();
        let repo = Arc::new(repo);
        let bus = Arc::new(EventBus::new(16));
        let matcher = make_matcher(repo.clone(), bus);

        seed_user(&repo, "u1", 1_000_000.0);
        // Holds 10 long; exits via 5% trailing stop.
        repo.run_in_transaction("seed_pos", |tx| {
            trading::tx_upsert_position(
                tx,
                &PositionRow {
                    user_id: "u1".into(),
                    symbol: "MERX".into(),
                    qty: 10.0,
                    avg_cost: 100.0,
                    cost_basis: 1_000.0,
                },
            )
        })
        .unwrap();
        let mut o = market_order("t", "u1", "MERX", Side::Sell, 10.0);
        o.order_type = OrderType::TrailingStop;
        o.trail_pct = Some(0.05);
        repo.insert_order(&o).unwrap();

        // Rising market ratchets the high-water to 120.
        matcher.on_tick_batch(&[flat_tick("MERX", 110.0)]);
        matcher.on_tick_batch(&[flat_tick("MERX", 120.0)]);
        assert_eq!(
            repo.get_order("t").unwrap().unwrap().status,
            OrderStatus::Open
        );
        assert_eq!(repo.get_order("t").unwrap().unwrap().trail_high, Some(120.0));

        // 4% pullback: no trigger. 6% pullback: triggers.
        matcher.on_tick_batch(&[flat_tick("MERX", 115.5)]);
        assert_eq!(
            repo.get_order("t").unwrap().unwrap().status,
            OrderStatus::Open
        );
        matcher.on_tick_batch(&[flat_tick("MERX", 112.0)]);
        assert_eq!(
            repo.get_order("t").unwrap().unwrap().status,
            OrderStatus::Filled
        );
    }

    #[tokio::test]
    async fn oco_sibling_cancelled_on_fill() {
        let (repo, _d) = test_repo();
        let repo = Arc::new(repo);
        let bus = Arc::new(EventBus::new(16));
        let matcher = make_matcher(repo.clone(), bus);

        seed_user(&repo, "u1", 1_000_000.0);
        repo.run_in_transaction("seed_pos", |tx| {
            trading::tx_upsert_position(
                tx,
                &PositionRow {
                    user_id: "u1".into(),
                    symbol: "MERX".into(),
                    qty: 10.0,
                    avg_cost: 100.0,
                    cost_basis: 1_000.0,
                },
            )
        })
        .unwrap();

        // Take-profit at 110 and stop-loss at 90, one cancels the other.
        let mut tp = market_order("tp", "u1", "MERX", Side::Sell, 10.0);
        tp.order_type = OrderType::TakeProfit;
        tp.stop_price = Some(110.0);
        tp.oco_group_id = Some("g".into());
        let mut sl = market_order("sl", "u1", "MERX", Side::Sell, 10.0);
        sl.order_type = OrderType::StopLoss;
        sl.stop_price = Some(90.0);
        sl.oco_group_id = Some("g".into());
        repo.insert_order(&tp).unwrap();
        repo.insert_order(&sl).unwrap();

        matcher.on_tick_batch(&[flat_tick("MERX", 111.0)]);

        assert_eq!(repo.get_order("tp").unwrap().unwrap().status, OrderStatus::Filled);
        assert_eq!(repo.get_order("sl").unwrap().unwrap().status, OrderStatus::Cancelled);
    }

    #[tokio::test]
    async fn margin_call_force_covers_underwater_short() {
        let (repo, _d) = test_repo();
        let repo = Arc::new(repo);
        let bus = Arc::new(EventBus::new(16));
        let mut margin_rx = bus.subscribe_margin_calls();
        let mut fills_rx = bus.subscribe_fills();
        let matcher = make_matcher(repo.clone(), bus.clone());

        // Short 50 @ 100 with 1,000 cash; price gaps to 130.
        seed_user(&repo, "u1", 1_000.0);
        repo.run_in_transaction("seed_pos", |tx| {
            trading::tx_upsert_position(
                tx,
                &PositionRow {
                    user_id: "u1".into(),
                    symbol: "MERX".into(),
                    qty: -50.0,
                    avg_cost: 100.0,
                    cost_basis: -5_000.0,
                },
            )
        })
        .unwrap();

        matcher.on_tick_batch(&[flat_tick("MERX", 130.0)]);

        let call = margin_rx.try_recv().expect("margin_call published");
        assert_eq!(call.ticker, "MERX");
        assert_eq!(call.qty, 50.0);
        assert!(call.pnl < 0.0);

        let fill = fills_rx.try_recv().expect("covering fill published");
        assert_eq!(fill.side, Side::Buy);
        assert!(fill.pnl < 0.0);

        // Position fully covered.
        assert!(repo.get_position("u1", "MERX").unwrap().is_none());

        // Second pass with no shorts left: no further margin calls.
        matcher.on_tick_batch(&[flat_tick("MERX", 130.0)]);
        assert!(margin_rx.try_recv().is_err());
    }

    #[test]
    fn position_math_weighted_average_and_flip() {
        // Add to long: blended average.
        let long = PositionRow {
            user_id: "u".into(),
            symbol: "S".into(),
            qty: 10.0,
            avg_cost: 100.0,
            cost_basis: 1_000.0,
        };
        let (p, r) = apply_fill_to_position(Some(&long), "u", "S", Side::Buy, 10.0, 110.0);
        assert_eq!(p.qty, 20.0);
        assert!((p.avg_cost - 105.0).abs() < 1e-9);
        assert_eq!(r, 0.0);

        // Sell through zero: realise on the closed leg, re-anchor the rest.
        let (p, r) = apply_fill_to_position(Some(&long), "u", "S", Side::Sell, 15.0, 120.0);
        assert_eq!(p.qty, -5.0);
        assert_eq!(p.avg_cost, 120.0);
        assert!((r - 200.0).abs() < 1e-9); // (120-100) * 10 closed

        // Short cover at a loss.
        let short = PositionRow {
            user_id: "u".into(),
            symbol: "S".into(),
            qty: -50.0,
            avg_cost: 100.0,
            cost_basis: -5_000.0,
        };
        let (p, r) = apply_fill_to_position(Some(&short), "u", "S", Side::Buy, 50.0, 130.0);
        assert_eq!(p.qty, 0.0);
        assert!((r - -1_500.0).abs() < 1e-9);
    }
}
