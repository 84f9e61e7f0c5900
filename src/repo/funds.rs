// =============================================================================
// Repository: funds, members, capital ledger, NAV snapshots
// =============================================================================
//
// The capital ledger is append-only; fund aggregates (net capital, total
// units) are always derived by summing it, never stored denormalised, so the
// reconciliation checks have an independent source of truth.
// =============================================================================

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

use crate::types::{CapitalTxKind, FundRole};

use super::{RepoResult, Repository};

// =============================================================================
// Row models
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct Fund {
    pub id: String,
    pub name: String,
    pub strategy_type: String,
    pub owner_id: String,
    pub description: String,
    pub min_investment: f64,
    pub management_fee_rate: f64,
    pub performance_fee_rate: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FundMember {
    pub fund_id: String,
    pub user_id: String,
    pub role: FundRole,
    pub joined_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CapitalTx {
    pub id: String,
    pub fund_id: String,
    pub user_id: String,
    pub amount: f64,
    pub kind: CapitalTxKind,
    pub units_delta: f64,
    pub nav_per_unit: f64,
    pub nav_before: f64,
    pub nav_after: f64,
    pub created_at: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct NavSnapshot {
    pub fund_id: String,
    pub snapshot_at: String,
    pub nav: f64,
    pub nav_per_unit: f64,
    pub total_units: f64,
    pub capital: f64,
    pub pnl: f64,
}

/// Fund-level aggregates derived from the capital ledger.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct CapitalSummary {
    pub net_capital: f64,
    pub total_units: f64,
}

/// Per-investor aggregates derived from the capital ledger.
#[derive(Debug, Clone, Serialize)]
pub struct InvestorHolding {
    pub user_id: String,
    pub units: f64,
    pub net_capital: f64,
}

// =============================================================================
// Row mappers
// =============================================================================

fn map_fund(row: &rusqlite::Row<'_>) -> rusqlite::Result<Fund> {
    Ok(Fund {
        id: row.get(0)?,
        name: row.get(1)?,
        strategy_type: row.get(2)?,
        owner_id: row.get(3)?,
        description: row.get(4)?,
        min_investment: row.get(5)?,
        management_fee_rate: row.get(6)?,
        performance_fee_rate: row.get(7)?,
        created_at: row.get(8)?,
    })
}

const FUND_COLS: &str = "id, name, strategy_type, owner_id, description, min_investment, \
     management_fee_rate, performance_fee_rate, created_at";

fn map_member(row: &rusqlite::Row<'_>) -> rusqlite::Result<FundMember> {
    Ok(FundMember {
        fund_id: row.get(0)?,
        user_id: row.get(1)?,
        role: FundRole::parse(&row.get::<_, String>(2)?).unwrap_or(FundRole::Client),
        joined_at: row.get(3)?,
    })
}

fn map_capital_tx(row: &rusqlite::Row<'_>) -> rusqlite::Result<CapitalTx> {
    Ok(CapitalTx {
        id: row.get(0)?,
        fund_id: row.get(1)?,
        user_id: row.get(2)?,
        amount: row.get(3)?,
        kind: row
            .get::<_, String>(4)?
            .parse::<CapitalTxKind>()
            .unwrap_or(CapitalTxKind::Deposit),
        units_delta: row.get(5)?,
        nav_per_unit: row.get(6)?,
        nav_before: row.get(7)?,
        nav_after: row.get(8)?,
        created_at: row.get(9)?,
    })
}

const CAPITAL_COLS: &str =
    "id, fund_id, user_id, amount, kind, units_delta, nav_per_unit, nav_before, nav_after, created_at";

fn map_nav(row: &rusqlite::Row<'_>) -> rusqlite::Result<NavSnapshot> {
    Ok(NavSnapshot {
        fund_id: row.get(0)?,
        snapshot_at: row.get(1)?,
        nav: row.get(2)?,
        nav_per_unit: row.get(3)?,
        total_units: row.get(4)?,
        capital: row.get(5)?,
        pnl: row.get(6)?,
    })
}

// =============================================================================
// Funds
// =============================================================================

impl Repository {
    pub fn insert_fund(&self, fund: &Fund) -> RepoResult<()> {
        self.with_conn("insert_fund", |c| {
            c.execute(
                "INSERT INTO funds (id, name, strategy_type, owner_id, description,
                     min_investment, management_fee_rate, performance_fee_rate, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    fund.id,
                    fund.name,
                    fund.strategy_type,
                    fund.owner_id,
                    fund.description,
                    fund.min_investment,
                    fund.management_fee_rate,
                    fund.performance_fee_rate,
                    fund.created_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn update_fund(&self, fund: &Fund) -> RepoResult<()> {
        self.with_conn("update_fund", |c| {
            c.execute(
                "UPDATE funds SET name = ?2, strategy_type = ?3, description = ?4,
                     min_investment = ?5, management_fee_rate = ?6, performance_fee_rate = ?7
                 WHERE id = ?1",
                params![
                    fund.id,
                    fund.name,
                    fund.strategy_type,
                    fund.description,
                    fund.min_investment,
                    fund.management_fee_rate,
                    fund.performance_fee_rate,
                ],
            )?;
            Ok(())
        })
    }

    pub fn delete_fund(&self, id: &str) -> RepoResult<bool> {
        self.with_conn("delete_fund", |c| {
            let n = c.execute("DELETE FROM funds WHERE id = ?1", params![id])?;
            c.execute("DELETE FROM fund_members WHERE fund_id = ?1", params![id])?;
            Ok(n > 0)
        })
    }

    pub fn get_fund(&self, id: &str) -> RepoResult<Option<Fund>> {
        self.with_conn("get_fund", |c| {
            c.query_row(
                &format!("SELECT {FUND_COLS} FROM funds WHERE id = ?1"),
                params![id],
                map_fund,
            )
            .optional()
        })
    }

    pub fn list_funds(&self) -> RepoResult<Vec<Fund>> {
        self.with_conn("list_funds", |c| {
            let mut stmt = c.prepare(&format!("SELECT {FUND_COLS} FROM funds ORDER BY created_at"))?;
            let rows = stmt.query_map([], map_fund)?;
            rows.collect()
        })
    }

    /// Funds the user belongs to (any role).
    pub fn get_user_funds(&self, user_id: &str) -> RepoResult<Vec<Fund>> {
        self.with_conn("get_user_funds", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {FUND_COLS} FROM funds f
                 JOIN fund_members m ON m.fund_id = f.id
                 WHERE m.user_id = ?1 ORDER BY f.created_at"
            ))?;
            let rows = stmt.query_map(params![user_id], map_fund)?;
            rows.collect()
        })
    }
}

// =============================================================================
// Members
// =============================================================================

impl Repository {
    pub fn insert_member(&self, member: &FundMember) -> RepoResult<()> {
        self.with_conn("insert_member", |c| {
            c.execute(
                "INSERT INTO fund_members (fund_id, user_id, role, joined_at)
                 VALUES (?1, ?2, ?3, ?4)",
                params![
                    member.fund_id,
                    member.user_id,
                    member.role.to_string(),
                    member.joined_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_members(&self, fund_id: &str) -> RepoResult<Vec<FundMember>> {
        self.with_conn("get_members", |c| {
            let mut stmt = c.prepare(
                "SELECT fund_id, user_id, role, joined_at FROM fund_members
                 WHERE fund_id = ?1 ORDER BY joined_at",
            )?;
            let rows = stmt.query_map(params![fund_id], map_member)?;
            rows.collect()
        })
    }

    pub fn get_member(&self, fund_id: &str, user_id: &str) -> RepoResult<Option<FundMember>> {
        self.with_conn("get_member", |c| {
            c.query_row(
                "SELECT fund_id, user_id, role, joined_at FROM fund_members
                 WHERE fund_id = ?1 AND user_id = ?2",
                params![fund_id, user_id],
                map_member,
            )
            .optional()
        })
    }

    pub fn update_member_role(&self, fund_id: &str, user_id: &str, role: FundRole) -> RepoResult<bool> {
        self.with_conn("update_member_role", |c| {
            let n = c.execute(
                "UPDATE fund_members SET role = ?3 WHERE fund_id = ?1 AND user_id = ?2",
                params![fund_id, user_id, role.to_string()],
            )?;
            Ok(n > 0)
        })
    }

    pub fn delete_member(&self, fund_id: &str, user_id: &str) -> RepoResult<bool> {
        self.with_conn("delete_member", |c| {
            let n = c.execute(
                "DELETE FROM fund_members WHERE fund_id = ?1 AND user_id = ?2",
                params![fund_id, user_id],
            )?;
            Ok(n > 0)
        })
    }
}

// =============================================================================
// Capital ledger
// =============================================================================

impl Repository {
    pub fn get_capital_txs(&self, fund_id: &str, limit: usize) -> RepoResult<Vec<CapitalTx>> {
        self.with_conn("get_capital_txs", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {CAPITAL_COLS} FROM capital_transactions
                 WHERE fund_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
            ))?;
            let rows = stmt.query_map(params![fund_id, limit as i64], map_capital_tx)?;
            rows.collect()
        })
    }

    pub fn get_capital_txs_by_user(&self, fund_id: &str, user_id: &str) -> RepoResult<Vec<CapitalTx>> {
        self.with_conn("get_capital_txs_by_user", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {CAPITAL_COLS} FROM capital_transactions
                 WHERE fund_id = ?1 AND user_id = ?2 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt.query_map(params![fund_id, user_id], map_capital_tx)?;
            rows.collect()
        })
    }

    /// Ledger-wide chronological read used by statements and reconciliation.
    pub fn get_capital_txs_chronological(&self, fund_id: &str) -> RepoResult<Vec<CapitalTx>> {
        self.with_conn("get_capital_txs_chronological", |c| {
            let mut stmt = c.prepare(&format!(
                "SELECT {CAPITAL_COLS} FROM capital_transactions
                 WHERE fund_id = ?1 ORDER BY created_at ASC, rowid ASC"
            ))?;
            let rows = stmt.query_map(params![fund_id], map_capital_tx)?;
            rows.collect()
        })
    }

    pub fn get_capital_summary(&self, fund_id: &str) -> RepoResult<CapitalSummary> {
        self.with_conn("get_capital_summary", |c| tx_capital_summary(c, fund_id))
    }

    pub fn get_net_capital(&self, fund_id: &str) -> RepoResult<f64> {
        Ok(self.get_capital_summary(fund_id)?.net_capital)
    }

    pub fn get_investor_holdings(&self, fund_id: &str) -> RepoResult<Vec<InvestorHolding>> {
        self.with_conn("get_investor_holdings", |c| {
            let mut stmt = c.prepare(
                "SELECT user_id,
                        SUM(units_delta) AS units,
                        SUM(CASE WHEN kind = 'deposit' THEN amount ELSE -amount END) AS net_capital
                 FROM capital_transactions WHERE fund_id = ?1
                 GROUP BY user_id HAVING ABS(units) > 1e-9
                 ORDER BY units DESC",
            )?;
            let rows = stmt.query_map(params![fund_id], |row| {
                Ok(InvestorHolding {
                    user_id: row.get(0)?,
                    units: row.get(1)?,
                    net_capital: row.get(2)?,
                })
            })?;
            rows.collect()
        })
    }
}

pub fn tx_insert_capital_tx(conn: &Connection, tx_row: &CapitalTx) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO capital_transactions (id, fund_id, user_id, amount, kind, units_delta,
             nav_per_unit, nav_before, nav_after, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
        params![
            tx_row.id,
            tx_row.fund_id,
            tx_row.user_id,
            tx_row.amount,
            tx_row.kind.to_string(),
            tx_row.units_delta,
            tx_row.nav_per_unit,
            tx_row.nav_before,
            tx_row.nav_after,
            tx_row.created_at,
        ],
    )?;
    Ok(())
}

/// Fund aggregates summed straight off the ledger.
pub fn tx_capital_summary(conn: &Connection, fund_id: &str) -> rusqlite::Result<CapitalSummary> {
    conn.query_row(
        "SELECT COALESCE(SUM(CASE WHEN kind = 'deposit' THEN amount ELSE -amount END), 0),
                COALESCE(SUM(units_delta), 0)
         FROM capital_transactions WHERE fund_id = ?1",
        params![fund_id],
        |row| {
            Ok(CapitalSummary {
                net_capital: row.get(0)?,
                total_units: row.get(1)?,
            })
        },
    )
}

/// One investor's current units in a fund.
pub fn tx_user_units(conn: &Connection, fund_id: &str, user_id: &str) -> rusqlite::Result<f64> {
    conn.query_row(
        "SELECT COALESCE(SUM(units_delta), 0) FROM capital_transactions
         WHERE fund_id = ?1 AND user_id = ?2",
        params![fund_id, user_id],
        |row| row.get(0),
    )
}

// =============================================================================
// NAV snapshots
// =============================================================================

impl Repository {
    pub fn insert_nav_snapshot(&self, snap: &NavSnapshot) -> RepoResult<()> {
        self.with_conn("insert_nav_snapshot", |c| tx_insert_nav_snapshot(c, snap))
    }

    /// Most recent snapshots first.
    pub fn get_recent_nav(&self, fund_id: &str, limit: usize) -> RepoResult<Vec<NavSnapshot>> {
        self.with_conn("get_recent_nav", |c| {
            let mut stmt = c.prepare(
                "SELECT fund_id, snapshot_at, nav, nav_per_unit, total_units, capital, pnl
                 FROM nav_snapshots WHERE fund_id = ?1 ORDER BY id DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![fund_id, limit as i64], map_nav)?;
            rows.collect()
        })
    }
}

pub fn tx_insert_nav_snapshot(conn: &Connection, snap: &NavSnapshot) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO nav_snapshots (fund_id, snapshot_at, nav, nav_per_unit, total_units, capital, pnl)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            snap.fund_id,
            snap.snapshot_at,
            snap.nav,
            snap.nav_per_unit,
            snap.total_units,
            snap.capital,
            snap.pnl,
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::test_repo;
    use chrono::Utc;

    fn fund(id: &str) -> Fund {
        Fund {
            id: id.into(),
            name: "Alpha One".into(),
            strategy_type: "multi".into(),
            owner_id: "u1".into(),
            description: String::new(),
            min_investment: 100.0,
            management_fee_rate: 0.02,
            performance_fee_rate: 0.20,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    fn capital(id: &str, fund_id: &str, user: &str, kind: CapitalTxKind, amount: f64, units: f64) -> CapitalTx {
        CapitalTx {
            id: id.into(),
            fund_id: fund_id.into(),
            user_id: user.into(),
            amount,
            kind,
            units_delta: units,
            nav_per_unit: 1.0,
            nav_before: 0.0,
            nav_after: 0.0,
            created_at: Utc::now().to_rfc3339(),
        }
    }

    #[test]
    fn fund_crud_and_membership() {
        let (repo, _d) = test_repo();
        repo.insert_fund(&fund("f1")).unwrap();
        repo.insert_member(&FundMember {
            fund_id: "f1".into(),
            user_id: "u1".into(),
            role: FundRole::Owner,
            joined_at: Utc::now().to_rfc3339(),
        })
        .unwrap();
        repo.insert_member(&FundMember {
            fund_id: "f1".into(),
            user_id: "u2".into(),
            role: FundRole::Client,
            joined_at: Utc::now().to_rfc3339(),
        })
        .unwrap();

        assert_eq!(repo.get_members("f1").unwrap().len(), 2);
        assert_eq!(repo.get_user_funds("u2").unwrap().len(), 1);
        assert!(repo.update_member_role("f1", "u2", FundRole::Analyst).unwrap());
        assert_eq!(
            repo.get_member("f1", "u2").unwrap().unwrap().role,
            FundRole::Analyst
        );
        assert!(repo.delete_member("f1", "u2").unwrap());
        assert!(repo.get_member("f1", "u2").unwrap().is_none());
    }

    #[test]
    fn capital_aggregates_sum_the_ledger() {
        let (repo, _d) = test_repo();
        repo.run_in_transaction("seed", |tx| {
            tx_insert_capital_tx(tx, &capital("c1", "f1", "u1", CapitalTxKind::Deposit, 1_000.0, 1_000.0))?;
            tx_insert_capital_tx(tx, &capital("c2", "f1", "u2", CapitalTxKind::Deposit, 500.0, 500.0))?;
            tx_insert_capital_tx(tx, &capital("c3", "f1", "u2", CapitalTxKind::Withdrawal, 200.0, -200.0))?;
            Ok(())
        })
        .unwrap();

        let summary = repo.get_capital_summary("f1").unwrap();
        assert_eq!(summary.net_capital, 1_300.0);
        assert_eq!(summary.total_units, 1_300.0);

        let holders = repo.get_investor_holdings("f1").unwrap();
        assert_eq!(holders.len(), 2);
        assert_eq!(holders[0].units, 1_000.0);
        assert_eq!(holders[1].units, 300.0);

        let units = repo
            .with_conn("u", |c| tx_user_units(c, "f1", "u2"))
            .unwrap();
        assert_eq!(units, 300.0);
    }

    #[test]
    fn nav_snapshots_come_back_newest_first() {
        let (repo, _d) = test_repo();
        for i in 0..3 {
            repo.insert_nav_snapshot(&NavSnapshot {
                fund_id: "f1".into(),
                snapshot_at: format!("2026-01-0{}T00:00:00Z", i + 1),
                nav: 1_000.0 + i as f64,
                nav_per_unit: 1.0,
                total_units: 1_000.0,
                capital: 1_000.0,
                pnl: i as f64,
            })
            .unwrap();
        }
        let snaps = repo.get_recent_nav("f1", 2).unwrap();
        assert_eq!(snaps.len(), 2);
        assert_eq!(snaps[0].nav, 1_002.0);
    }
}
