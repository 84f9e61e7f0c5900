// =============================================================================
// Repository: users, orders, positions, trades
// =============================================================================
//
// Single-shot reads/writes go through `Repository` methods (full retry
// policy). The `tx_*` free functions compose inside `run_in_transaction` so a
// fill can move cash, upsert the position, record the trade and update the
// order atomically.
// =============================================================================

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::types::{OrderStatus, OrderType, Side, UserRole};

use super::{RepoResult, Repository};

// =============================================================================
// Row models
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct User {
    pub id: String,
    pub username: String,
    #[serde(skip_serializing)]
    pub password_hash: String,
    pub cash: f64,
    pub starting_cash: f64,
    pub role: UserRole,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct OrderRow {
    pub id: String,
    pub user_id: String,
    pub symbol: String,
    pub order_type: OrderType,
    pub side: Side,
    pub qty: f64,
    pub filled_qty: f64,
    pub limit_price: Option<f64>,
    pub stop_price: Option<f64>,
    pub trail_pct: Option<f64>,
    pub trail_high: Option<f64>,
    pub oco_group_id: Option<String>,
    pub status: OrderStatus,
    pub reject_reason: Option<String>,
    pub created_at: String,
    pub cancelled_at: Option<String>,
    pub filled_at: Option<String>,
}

impl OrderRow {
    pub fn remaining_qty(&self) -> f64 {
        (self.qty - self.filled_qty).max(0.0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct PositionRow {
    pub user_id: String,
    pub symbol: String,
    /// Signed: positive long, negative short. A zero row never persists.
    pub qty: f64,
    pub avg_cost: f64,
    pub cost_basis: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct TradeRow {
    pub id: String,
    pub user_id: String,
    pub order_id: String,
    pub symbol: String,
    pub side: Side,
    pub qty: f64,
    pub fill_price: f64,
    pub gross_notional: f64,
    pub commission: f64,
    pub slippage_cost: f64,
    pub borrow_cost: f64,
    pub realized_pnl: f64,
    pub regime: String,
    pub executed_at: String,
}

// =============================================================================
// Row mappers
// =============================================================================

fn map_user(row: &rusqlite::Row<'_>) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get(0)?,
        username: row.get(1)?,
        password_hash: row.get(2)?,
        cash: row.get(3)?,
        starting_cash: row.get(4)?,
        role: UserRole::parse(&row.get::<_, String>(5)?),
        created_at: row.get(6)?,
    })
}

const USER_COLS: &str = "id, username, password_hash, cash, starting_cash, role, created_at";

fn map_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderRow> {
    let parse_err = |what: &str| {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            format!("bad {what} in orders row").into(),
        )
    };
    Ok(OrderRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        symbol: row.get(2)?,
        order_type: row
            .get::<_, String>(3)?
            .parse()
            .map_err(|_| parse_err("order_type"))?,
        side: row.get::<_, String>(4)?.parse().map_err(|_| parse_err("side"))?,
        qty: row.get(5)?,
        filled_qty: row.get(6)?,
        limit_price: row.get(7)?,
        stop_price: row.get(8)?,
        trail_pct: row.get(9)?,
        trail_high: row.get(10)?,
        oco_group_id: row.get(11)?,
        status: row
            .get::<_, String>(12)?
            .parse()
            .map_err(|_| parse_err("status"))?,
        reject_reason: row.get(13)?,
        created_at: row.get(14)?,
        cancelled_at: row.get(15)?,
        filled_at: row.get(16)?,
    })
}

const ORDER_COLS: &str = "id, user_id, symbol, order_type, side, qty, filled_qty, limit_price, \
     stop_price, trail_pct, trail_high, oco_group_id, status, reject_reason, created_at, \
     cancelled_at, filled_at";

fn map_position(row: &rusqlite::Row<'_>) -> rusqlite::Result<PositionRow> {
    Ok(PositionRow {
        user_id: row.get(0)?,
        symbol: row.get(1)?,
        qty: row.get(2)?,
        avg_cost: row.get(3)?,
        cost_basis: row.get(4)?,
    })
}

fn map_trade(row: &rusqlite::Row<'_>) -> rusqlite::Result<TradeRow> {
    let parse_err = || {
        rusqlite::Error::FromSqlConversionFailure(
            0,
            rusqlite::types::Type::Text,
            "bad side in trades row".into(),
        )
    };
    Ok(TradeRow {
        id: row.get(0)?,
        user_id: row.get(1)?,
        order_id: row.get(2)?,
        symbol: row.get(3)?,
        side: row.get::<_, String>(4)?.parse().map_err(|_| parse_err())?,
        qty: row.get(5)?,
        fill_price: row.get(6)?,
        gross_notional: row.get(7)?,
        commission: row.get(8)?,
        slippage_cost: row.get(9)?,
        borrow_cost: row.get(10)?,
        realized_pnl: row.get(11)?,
        regime: row.get(12)?,
        executed_at: row.get(13)?,
    })
}

const TRADE_COLS: &str = "id, user_id, order_id, symbol, side, qty, fill_price, gross_notional, \
     commission, slippage_cost, borrow_cost, realized_pnl, regime, executed_at";

// =============================================================================
// Users
// =============================================================================

impl Repository {
    pub fn insert_user(&self, user: &User) -> RepoResult<()> {
        self.with_conn("insert_user", |c| {
            c.execute(
                "INSERT INTO users (id, username, password_hash, cash, starting_cash, role, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    user.id,
                    user.username,
                    user.password_hash,
                    user.cash,
                    user.starting_cash,
                    user.role.to_string(),
                    user.created_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: &str) -> RepoResult<Option<User>> {
        self.with_conn("get_user", |c| {
            c.query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
                params![id],
                map_user,
            )
            .optional()
        })
    }

    pub fn get_user_by_username(&self, username: &str) -> RepoResult<Option<User>> {
        self.with_conn("get_user_by_username", |c| {
            c.query_row(
                &format!("SELECT {USER_COLS} FROM users WHERE username = ?1 COLLATE NOCASE"),
                params![username],
                map_user,
            )
            .optional()
        })
    }

    pub fn list_users(&self) -> RepoResult<Vec<User>> {
        self.with_conn("list_users", |c| {
            let mut stmt = c.prepare(&format!("SELECT {USER_COLS} FROM users"))?;
            let rows = stmt.query_map([], map_user)?;
            rows.collect()
        })
    }
}

/// Read a user inside a write transaction. The IMMEDIATE transaction already
/// holds the database write lock, so this is the row-lock-equivalent read.
pub fn tx_get_user_for_update(conn: &Connection, id: &str) -> rusqlite::Result<Option<User>> {
    conn.query_row(
        &format!("SELECT {USER_COLS} FROM users WHERE id = ?1"),
        params![id],
        map_user,
    )
    .optional()
}

/// Apply a signed cash delta; returns the new balance.
pub fn tx_adjust_user_cash(conn: &Connection, id: &str, delta: f64) -> rusqlite::Result<f64> {
    conn.execute(
        "UPDATE users SET cash = cash + ?2 WHERE id = ?1",
        params![id, delta],
    )?;
    conn.query_row("SELECT cash FROM users WHERE id = ?1", params![id], |r| {
        r.get(0)
    })
}

// =============================================================================
// Orders
// =============================================================================

impl Repository {
    pub fn insert_order(&self, order: &OrderRow) -> RepoResult<()> {
        self.with_conn("insert_order", |c| {
            c.execute(
                "INSERT INTO orders (id, user_id, symbol, order_type, side, qty, filled_qty,
                     limit_price, stop_price, trail_pct, trail_high, oco_group_id, status,
                     reject_reason, created_at, cancelled_at, filled_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17)",
                params![
                    order.id,
                    order.user_id,
                    order.symbol,
                    order.order_type.to_string(),
                    order.side.to_string(),
                    order.qty,
                    order.filled_qty,
                    order.limit_price,
                    order.stop_price,
                    order.trail_pct,
                    order.trail_high,
                    order.oco_group_id,
                    order.status.to_string(),
                    order.reject_reason,
                    order.created_at,
                    order.cancelled_at,
                    order.filled_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_order(&self, id: &str) -> RepoResult<Option<OrderRow>> {
        self.with_conn("get_order", |c| {
            c.query_row(
                &format!("SELECT {ORDER_COLS} FROM orders WHERE id = ?1"),
                params![id],
                map_order,
            )
            .optional()
        })
    }

    /// All working (open or partially filled) orders.
    pub fn get_open_orders(&self) -> RepoResult<Vec<OrderRow>> {
        self.with_conn("get_open_orders", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {ORDER_COLS} FROM orders WHERE status IN ('open','partial') ORDER BY created_at"
            ))?;
            let rows = stmt.query_map([], map_order)?;
            rows.collect()
        })
    }

    pub fn get_open_orders_by_ticker(&self, symbol: &str) -> RepoResult<Vec<OrderRow>> {
        self.with_conn("get_open_orders_by_ticker", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {ORDER_COLS} FROM orders WHERE status IN ('open','partial') AND symbol = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![symbol], map_order)?;
            rows.collect()
        })
    }

    pub fn get_open_orders_by_user(&self, user_id: &str) -> RepoResult<Vec<OrderRow>> {
        self.with_conn("get_open_orders_by_user", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {ORDER_COLS} FROM orders WHERE status IN ('open','partial') AND user_id = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt.query_map(params![user_id], map_order)?;
            rows.collect()
        })
    }

    /// Idempotent cancel: only working orders transition; cancelling a
    /// terminal order changes nothing and reports success.
    pub fn cancel_order(&self, id: &str, cancelled_at: &str) -> RepoResult<bool> {
        self.with_conn("cancel_order", |c| {
            let changed = c.execute(
                "UPDATE orders SET status = 'cancelled', cancelled_at = ?2
                 WHERE id = ?1 AND status IN ('open','partial')",
                params![id, cancelled_at],
            )?;
            Ok(changed > 0)
        })
    }

    /// Persist trailing-stop high-water tracking between tick passes.
    pub fn update_order_trail_high(&self, id: &str, trail_high: f64) -> RepoResult<()> {
        self.with_conn("update_order_trail_high", |c| {
            c.execute(
                "UPDATE orders SET trail_high = ?2 WHERE id = ?1",
                params![id, trail_high],
            )?;
            Ok(())
        })
    }

    /// A triggered stop-limit sheds its stop price and rests as a plain
    /// limit from the next pass on.
    pub fn clear_order_stop(&self, id: &str) -> RepoResult<()> {
        self.with_conn("clear_order_stop", |c| {
            c.execute(
                "UPDATE orders SET stop_price = NULL WHERE id = ?1",
                params![id],
            )?;
            Ok(())
        })
    }
}

pub fn tx_update_order_fill(
    conn: &Connection,
    id: &str,
    filled_qty: f64,
    status: OrderStatus,
    filled_at: Option<&str>,
) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE orders SET filled_qty = ?2, status = ?3, filled_at = COALESCE(?4, filled_at)
         WHERE id = ?1",
        params![id, filled_qty, status.to_string(), filled_at],
    )?;
    Ok(())
}

pub fn tx_mark_order_rejected(conn: &Connection, id: &str, reason: &str) -> rusqlite::Result<()> {
    conn.execute(
        "UPDATE orders SET status = 'rejected', reject_reason = ?2
         WHERE id = ?1 AND status IN ('open','partial')",
        params![id, reason],
    )?;
    Ok(())
}

/// Cancel every working sibling in an OCO group except the filled order.
pub fn tx_cancel_oco_siblings(
    conn: &Connection,
    group_id: &str,
    except_order_id: &str,
    cancelled_at: &str,
) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE orders SET status = 'cancelled', cancelled_at = ?3
         WHERE oco_group_id = ?1 AND id != ?2 AND status IN ('open','partial')",
        params![group_id, except_order_id, cancelled_at],
    )
}

// =============================================================================
// Positions
// =============================================================================

impl Repository {
    pub fn get_positions(&self, user_id: &str) -> RepoResult<Vec<PositionRow>> {
        self.with_conn("get_positions", |c| {
            let mut stmt = c.prepare(
                "SELECT user_id, symbol, qty, avg_cost, cost_basis FROM positions WHERE user_id = ?1",
            )?;
            let rows = stmt.query_map(params![user_id], map_position)?;
            rows.collect()
        })
    }

    pub fn get_position(&self, user_id: &str, symbol: &str) -> RepoResult<Option<PositionRow>> {
        self.with_conn("get_position", |c| {
            tx_get_position(c, user_id, symbol)
        })
    }

    /// Every position with short (negative) quantity; drives the margin sweep.
    pub fn get_short_positions(&self) -> RepoResult<Vec<PositionRow>> {
        self.with_conn("get_short_positions", |c| {
            let mut stmt = c.prepare(
                "SELECT user_id, symbol, qty, avg_cost, cost_basis FROM positions WHERE qty < 0",
            )?;
            let rows = stmt.query_map([], map_position)?;
            rows.collect()
        })
    }
}

pub fn tx_get_position(
    conn: &Connection,
    user_id: &str,
    symbol: &str,
) -> rusqlite::Result<Option<PositionRow>> {
    conn.query_row(
        "SELECT user_id, symbol, qty, avg_cost, cost_basis FROM positions
         WHERE user_id = ?1 AND symbol = ?2",
        params![user_id, symbol],
        map_position,
    )
    .optional()
}

/// Write a position row; a zero quantity deletes it instead.
pub fn tx_upsert_position(conn: &Connection, pos: &PositionRow) -> rusqlite::Result<()> {
    if pos.qty.abs() < 1e-9 {
        conn.execute(
            "DELETE FROM positions WHERE user_id = ?1 AND symbol = ?2",
            params![pos.user_id, pos.symbol],
        )?;
        return Ok(());
    }
    conn.execute(
        "INSERT INTO positions (user_id, symbol, qty, avg_cost, cost_basis)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(user_id, symbol)
         DO UPDATE SET qty = excluded.qty, avg_cost = excluded.avg_cost,
                       cost_basis = excluded.cost_basis",
        params![pos.user_id, pos.symbol, pos.qty, pos.avg_cost, pos.cost_basis],
    )?;
    Ok(())
}

// =============================================================================
// Trades
// =============================================================================

impl Repository {
    pub fn get_trades_by_user(&self, user_id: &str, limit: usize) -> RepoResult<Vec<TradeRow>> {
        self.with_conn("get_trades_by_user", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {TRADE_COLS} FROM trades WHERE user_id = ?1
                 ORDER BY executed_at DESC, rowid DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![user_id, limit as i64], map_trade)?;
            rows.collect()
        })
    }

    pub fn get_all_trades(&self, limit: usize) -> RepoResult<Vec<TradeRow>> {
        self.with_conn("get_all_trades", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {TRADE_COLS} FROM trades ORDER BY executed_at DESC, rowid DESC LIMIT ?1"
            ))?;
            let rows = stmt.query_map(params![limit as i64], map_trade)?;
            rows.collect()
        })
    }
}

pub fn tx_insert_trade(conn: &Connection, trade: &TradeRow) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO trades (id, user_id, order_id, symbol, side, qty, fill_price,
             gross_notional, commission, slippage_cost, borrow_cost, realized_pnl,
             regime, executed_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)",
        params![
            trade.id,
            trade.user_id,
            trade.order_id,
            trade.symbol,
            trade.side.to_string(),
            trade.qty,
            trade.fill_price,
            trade.gross_notional,
            trade.commission,
            trade.slippage_cost,
            trade.borrow_cost,
            trade.realized_pnl,
            trade.regime,
            trade.executed_at,
        ],
    )?;
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::test_repo;
    use chrono::Utc;

    fn user(id: &str, name: &str, cash: f64) -> User {
        User {
            id: id.into(),
            username: name.into(),
            password_hash: "hash".into(),
            cash,
            starting_cash: cash,
            role: UserRole::Trader,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    fn order(id: &str, user_id: &str, status: OrderStatus) -> OrderRow {
        OrderRow {
            id: id.into(),
            user_id: user_id.into(),
            symbol: "MERX".into(),
            order_type: OrderType::Limit,
            side: Side::Buy,
            qty: 100.0,
            filled_qty: 0.0,
            limit_price: Some(99.0),
            stop_price: None,
            trail_pct: None,
            trail_high: None,
            oco_group_id: None,
            status,
            reject_reason: None,
            created_at: Utc::now().to_rfc3339(),
            cancelled_at: None,
            filled_at: None,
        }
    }

    #[test]
    fn user_roundtrip_and_case_insensitive_lookup() {
        let (repo, _d) = test_repo();
        repo.insert_user(&user("u1", "Alice", 100_000.0)).unwrap();
        let found = repo.get_user_by_username("alice").unwrap().unwrap();
        assert_eq!(found.id, "u1");
        assert_eq!(found.cash, 100_000.0);

        // Duplicate usernames (any case) are rejected.
        assert!(repo.insert_user(&user("u2", "ALICE", 1.0)).is_err());
    }

    #[test]
    fn order_roundtrip_preserves_enums() {
        let (repo, _d) = test_repo();
        let mut o = order("o1", "u1", OrderStatus::Open);
        o.order_type = OrderType::TrailingStop;
        o.trail_pct = Some(0.05);
        repo.insert_order(&o).unwrap();
        let back = repo.get_order("o1").unwrap().unwrap();
        assert_eq!(back.order_type, OrderType::TrailingStop);
        assert_eq!(back.side, Side::Buy);
        assert_eq!(back.trail_pct, Some(0.05));
    }

    #[test]
    fn cancel_is_idempotent() {
        let (repo, _d) = test_repo();
        repo.insert_order(&order("o1", "u1", OrderStatus::Open)).unwrap();
        let now = Utc::now().to_rfc3339();
        assert!(repo.cancel_order("o1", &now).unwrap());
        // Second cancel is a successful no-op.
        assert!(!repo.cancel_order("o1", &now).unwrap());
        let o = repo.get_order("o1").unwrap().unwrap();
        assert_eq!(o.status, OrderStatus::Cancelled);
    }

    #[test]
    fn open_order_queries_filter_terminal_states() {
        let (repo, _d) = test_repo();
        repo.insert_order(&order("o1", "u1", OrderStatus::Open)).unwrap();
        repo.insert_order(&order("o2", "u1", OrderStatus::Filled)).unwrap();
        repo.insert_order(&order("o3", "u2", OrderStatus::Partial)).unwrap();

        assert_eq!(repo.get_open_orders().unwrap().len(), 2);
        assert_eq!(repo.get_open_orders_by_user("u1").unwrap().len(), 1);
        assert_eq!(repo.get_open_orders_by_ticker("MERX").unwrap().len(), 2);
    }

    #[test]
    fn oco_cancel_spares_the_filled_order() {
        let (repo, _d) = test_repo();
        let mut a = order("a", "u1", OrderStatus::Open);
        a.oco_group_id = Some("g1".into());
        let mut b = order("b", "u1", OrderStatus::Open);
        b.oco_group_id = Some("g1".into());
        repo.insert_order(&a).unwrap();
        repo.insert_order(&b).unwrap();

        repo.run_in_transaction("oco", |tx| {
            tx_cancel_oco_siblings(tx, "g1", "a", "2026-01-01T00:00:00Z")
        })
        .unwrap();

        assert_eq!(repo.get_order("a").unwrap().unwrap().status, OrderStatus::Open);
        assert_eq!(repo.get_order("b").unwrap().unwrap().status, OrderStatus::Cancelled);
    }

    #[test]
    fn zero_position_is_deleted() {
        let (repo, _d) = test_repo();
        let pos = PositionRow {
            user_id: "u1".into(),
            symbol: "MERX".into(),
            qty: 100.0,
            avg_cost: 50.0,
            cost_basis: 5_000.0,
        };
        repo.run_in_transaction("open", |tx| tx_upsert_position(tx, &pos)).unwrap();
        assert!(repo.get_position("u1", "MERX").unwrap().is_some());

        let flat = PositionRow { qty: 0.0, ..pos.clone() };
        repo.run_in_transaction("flat", |tx| tx_upsert_position(tx, &flat)).unwrap();
        assert!(repo.get_position("u1", "MERX").unwrap().is_none());
    }

    #[test]
    fn cash_adjustment_returns_new_balance() {
        let (repo, _d) = test_repo();
        repo.insert_user(&user("u1", "bob", 1_000.0)).unwrap();
        let new_cash = repo
            .run_in_transaction("cash", |tx| tx_adjust_user_cash(tx, "u1", -250.0))
            .unwrap();
        assert_eq!(new_cash, 750.0);
    }

    #[test]
    fn short_positions_scan() {
        let (repo, _d) = test_repo();
        for (sym, qty) in [("MERX", 10.0), ("GLDR", -5.0)] {
            let pos = PositionRow {
                user_id: "u1".into(),
                symbol: sym.into(),
                qty,
                avg_cost: 10.0,
                cost_basis: qty * 10.0,
            };
            repo.run_in_transaction("p", |tx| tx_upsert_position(tx, &pos)).unwrap();
        }
        let shorts = repo.get_short_positions().unwrap();
        assert_eq!(shorts.len(), 1);
        assert_eq!(shorts[0].symbol, "GLDR");
    }
}
