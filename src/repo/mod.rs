// =============================================================================
// Repository
// =============================================================================
//
// Narrow persistence facade over SQLite. Every caller goes through the typed
// methods in the domain submodules; nothing else in the crate touches SQL.
//
// Connection policy:
//   - Two configured endpoints, "direct" (primary) and "pooler" (fallback).
//   - Transient errors (busy, locked, cannot-open, I/O) are classified as
//     connectivity and retried with exponential backoff up to a bounded
//     attempt count; anything else is a logical error and surfaces at once.
//   - A connectivity failure with fallback enabled flips the active endpoint
//     to the pooler; a background probe returns to the primary after a
//     cooldown.
//   - Health is observable: mode, connected, last error code, last failure.
//
// Write-heavy cash/capital moves run inside `run_in_transaction`, which opens
// an IMMEDIATE transaction (SQLite's equivalent of taking the write lock up
// front, standing in for SELECT ... FOR UPDATE row locks).
// =============================================================================

pub mod funds;
pub mod market;
pub mod schema;
pub mod strategies;
pub mod trading;

pub use funds::{CapitalSummary, CapitalTx, Fund, FundMember, InvestorHolding, NavSnapshot};
pub use strategies::{BacktestRow, CustomStrategyRow, RiskBreach, RiskSettings, StrategyRow, StrategyTradeRow};
pub use trading::{OrderRow, PositionRow, TradeRow, User};

use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use rusqlite::{Connection, ErrorCode, OpenFlags, TransactionBehavior};
use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::DbConfig;

// =============================================================================
// Errors
// =============================================================================

/// Repository error taxonomy the boundary maps onto status codes.
#[derive(Debug)]
pub enum RepoError {
    /// Connectivity-class failure that survived the retry budget.
    Unavailable { code: String },
    /// Constraint violations, bad rows, serialization problems.
    Logical(String),
}

impl std::fmt::Display for RepoError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable { code } => write!(f, "storage unavailable ({code})"),
            Self::Logical(msg) => write!(f, "storage error: {msg}"),
        }
    }
}

impl std::error::Error for RepoError {}

pub type RepoResult<T> = Result<T, RepoError>;

/// Whether a rusqlite error is a connectivity problem worth retrying.
fn is_connectivity(err: &rusqlite::Error) -> Option<String> {
    match err {
        rusqlite::Error::SqliteFailure(e, _) => match e.code {
            ErrorCode::DatabaseBusy => Some("busy".into()),
            ErrorCode::DatabaseLocked => Some("locked".into()),
            ErrorCode::CannotOpen => Some("cannot_open".into()),
            ErrorCode::SystemIoFailure => Some("io".into()),
            ErrorCode::DiskFull => Some("disk_full".into()),
            ErrorCode::PermissionDenied => Some("permission".into()),
            ErrorCode::NotADatabase => Some("not_a_database".into()),
            _ => None,
        },
        _ => None,
    }
}

// =============================================================================
// Endpoints & health
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endpoint {
    Direct,
    Pooler,
}

impl Endpoint {
    fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Pooler => "pooler",
        }
    }
}

/// Observable repository health, served by the health endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct RepoHealth {
    pub mode: String,
    pub connected: bool,
    pub last_error_code: Option<String>,
    pub last_failure_at: Option<i64>,
}

#[derive(Debug)]
struct ActiveState {
    endpoint: Endpoint,
    failed_over_at: Option<Instant>,
}

// =============================================================================
// Repository
// =============================================================================

#[derive(Debug)]
pub struct Repository {
    cfg: DbConfig,
    active: Mutex<ActiveState>,
    health: RwLock<RepoHealth>,
}

impl Repository {
    /// Open the repository and initialise the schema on the preferred
    /// endpoint.
    pub fn open(cfg: DbConfig) -> RepoResult<Self> {
        let preferred = if cfg.connect_mode == "pooler" {
            Endpoint::Pooler
        } else {
            Endpoint::Direct
        };
        let repo = Self {
            active: Mutex::new(ActiveState {
                endpoint: preferred,
                failed_over_at: None,
            }),
            health: RwLock::new(RepoHealth {
                mode: preferred.as_str().to_string(),
                connected: false,
                last_error_code: None,
                last_failure_at: None,
            }),
            cfg,
        };
        repo.with_conn("init_schema", |conn| schema::init_schema(conn))?;
        info!(mode = repo.health().mode, "repository ready");
        Ok(repo)
    }

    pub fn health(&self) -> RepoHealth {
        self.health.read().clone()
    }

    /// Quick check used by background producers to self-throttle.
    pub fn is_healthy(&self) -> bool {
        self.health.read().connected
    }

    fn path_for(&self, endpoint: Endpoint) -> &str {
        match endpoint {
            Endpoint::Direct => &self.cfg.direct_path,
            Endpoint::Pooler => &self.cfg.pooler_path,
        }
    }

    fn open_endpoint(&self, endpoint: Endpoint) -> rusqlite::Result<Connection> {
        let conn = Connection::open_with_flags(
            self.path_for(endpoint),
            OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE,
        )?;
        conn.busy_timeout(Duration::from_millis(self.cfg.connect_timeout_ms))?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        Ok(conn)
    }

    fn mark_ok(&self, endpoint: Endpoint) {
        let mut h = self.health.write();
        h.mode = endpoint.as_str().to_string();
        h.connected = true;
    }

    fn mark_failed(&self, endpoint: Endpoint, code: &str) {
        let mut h = self.health.write();
        h.mode = endpoint.as_str().to_string();
        h.connected = false;
        h.last_error_code = Some(code.to_string());
        h.last_failure_at = Some(chrono::Utc::now().timestamp_millis());
    }

    /// Consider switching to the fallback endpoint after a connectivity
    /// failure. Returns the endpoint to use for the next attempt.
    fn maybe_failover(&self, failed: Endpoint) -> Endpoint {
        if !self.cfg.fallback_enabled || failed == Endpoint::Pooler {
            return failed;
        }
        let mut active = self.active.lock();
        if active.endpoint == Endpoint::Direct {
            active.endpoint = Endpoint::Pooler;
            active.failed_over_at = Some(Instant::now());
            warn!("repository failing over direct -> pooler");
        }
        active.endpoint
    }

    /// Probe the primary endpoint; switch back when it answers and the
    /// cooldown has elapsed. Driven by a periodic background task.
    pub fn probe_primary(&self) {
        let due = {
            let active = self.active.lock();
            active.endpoint == Endpoint::Pooler
                && active
                    .failed_over_at
                    .map(|t| t.elapsed() >= Duration::from_secs(self.cfg.probe_cooldown_secs))
                    .unwrap_or(true)
        };
        if !due {
            return;
        }
        match self
            .open_endpoint(Endpoint::Direct)
            .and_then(|c| c.query_row("SELECT 1", [], |r| r.get::<_, i64>(0)))
        {
            Ok(_) => {
                let mut active = self.active.lock();
                active.endpoint = Endpoint::Direct;
                active.failed_over_at = None;
                drop(active);
                self.mark_ok(Endpoint::Direct);
                info!("repository recovered primary endpoint");
            }
            Err(e) => {
                warn!(error = %e, "primary endpoint probe failed, staying on pooler");
            }
        }
    }

    /// Run `f` against the active endpoint with the full retry/failover
    /// policy.
    pub fn with_conn<T>(
        &self,
        label: &str,
        f: impl Fn(&Connection) -> rusqlite::Result<T>,
    ) -> RepoResult<T> {
        self.execute_policy(label, |endpoint| {
            let conn = self.open_endpoint(endpoint)?;
            f(&conn)
        })
    }

    /// Run `f` inside an IMMEDIATE transaction (write lock up front). The
    /// closure may be re-run on a retried attempt, so it must not hold state
    /// across calls.
    pub fn run_in_transaction<T>(
        &self,
        label: &str,
        f: impl Fn(&rusqlite::Transaction<'_>) -> rusqlite::Result<T>,
    ) -> RepoResult<T> {
        self.execute_policy(label, |endpoint| {
            let mut conn = self.open_endpoint(endpoint)?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let out = f(&tx)?;
            tx.commit()?;
            Ok(out)
        })
    }

    fn execute_policy<T>(
        &self,
        label: &str,
        attempt_on: impl Fn(Endpoint) -> rusqlite::Result<T>,
    ) -> RepoResult<T> {
        let mut delay = Duration::from_millis(self.cfg.retry_base_ms);
        let max_delay = Duration::from_millis(self.cfg.retry_max_ms);
        let attempts = self.cfg.retry_max_attempts.max(1);
        let mut last_code = String::from("unknown");

        for attempt in 1..=attempts {
            let endpoint = self.active.lock().endpoint;
            let result = attempt_on(endpoint);
            match result {
                Ok(v) => {
                    self.mark_ok(endpoint);
                    return Ok(v);
                }
                Err(e) => match is_connectivity(&e) {
                    Some(code) => {
                        warn!(
                            op = label,
                            attempt,
                            endpoint = endpoint.as_str(),
                            code = %code,
                            "repository connectivity error"
                        );
                        last_code = code.clone();
                        self.mark_failed(endpoint, &code);
                        self.maybe_failover(endpoint);
                        if attempt < attempts {
                            std::thread::sleep(delay);
                            delay = (delay * 2).min(max_delay);
                        }
                    }
                    None => {
                        return Err(RepoError::Logical(format!("{label}: {e}")));
                    }
                },
            }
        }

        error!(op = label, code = %last_code, "repository exhausted retry budget");
        Err(RepoError::Unavailable { code: last_code })
    }
}

#[cfg(test)]
pub(crate) fn test_repo() -> (Repository, tempfile::TempDir) {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("test.db").to_string_lossy().to_string();
    let cfg = DbConfig {
        direct_path: path.clone(),
        pooler_path: path,
        retry_max_attempts: 2,
        retry_base_ms: 1,
        retry_max_ms: 2,
        ..DbConfig::default()
    };
    (Repository::open(cfg).expect("open repo"), dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opens_and_reports_healthy() {
        let (repo, _dir) = test_repo();
        let h = repo.health();
        assert!(h.connected);
        assert_eq!(h.mode, "direct");
        assert!(h.last_error_code.is_none());
    }

    #[test]
    fn unreachable_endpoint_surfaces_unavailable() {
        let cfg = DbConfig {
            direct_path: "/nonexistent-dir/na/meridian.db".into(),
            pooler_path: "/nonexistent-dir/na/meridian.db".into(),
            retry_max_attempts: 2,
            retry_base_ms: 1,
            retry_max_ms: 2,
            ..DbConfig::default()
        };
        match Repository::open(cfg) {
            Err(RepoError::Unavailable { code }) => assert_eq!(code, "cannot_open"),
            other => panic!("expected Unavailable, got {other:?}"),
        }
    }

    #[test]
    fn failover_switches_to_pooler_when_direct_dies() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("pooler.db").to_string_lossy().to_string();
        let cfg = DbConfig {
            direct_path: "/nonexistent-dir/na/direct.db".into(),
            pooler_path: good,
            fallback_enabled: true,
            retry_max_attempts: 3,
            retry_base_ms: 1,
            retry_max_ms: 2,
            ..DbConfig::default()
        };
        let repo = Repository::open(cfg).expect("fallback should succeed");
        assert_eq!(repo.health().mode, "pooler");
        assert!(repo.health().connected);
    }

    #[test]
    fn transaction_commits_atomically() {
        let (repo, _dir) = test_repo();
        repo.run_in_transaction("two_writes", |tx| {
            tx.execute(
                "INSERT INTO news_events (id, ticker, kind, severity, headline, body, price_impact, fired_at)
                 VALUES ('a', 'MERX', 'test', 'low', 'h', 'b', 0.0, 1)",
                [],
            )?;
            tx.execute(
                "INSERT INTO news_events (id, ticker, kind, severity, headline, body, price_impact, fired_at)
                 VALUES ('b', 'MERX', 'test', 'low', 'h', 'b', 0.0, 2)",
                [],
            )?;
            Ok(())
        })
        .unwrap();

        let count: i64 = repo
            .with_conn("count", |c| {
                c.query_row("SELECT COUNT(*) FROM news_events", [], |r| r.get(0))
            })
            .unwrap();
        assert_eq!(count, 2);
    }

    #[test]
    fn transaction_rolls_back_on_error() {
        let (repo, _dir) = test_repo();
        let res = repo.run_in_transaction("fails_midway", |tx| {
            tx.execute(
                "INSERT INTO news_events (id, ticker, kind, severity, headline, body, price_impact, fired_at)
                 VALUES ('x', 'MERX', 'test', 'low', 'h', 'b', 0.0, 1)",
                [],
            )?;
            // Duplicate primary key triggers a logical failure.
            tx.execute(
                "INSERT INTO news_events (id, ticker, kind, severity, headline, body, price_impact, fired_at)
                 VALUES ('x', 'MERX', 'test', 'low', 'h', 'b', 0.0, 1)",
                [],
            )?;
            Ok(())
        });
        assert!(matches!(res, Err(RepoError::Logical(_))));

        let count: i64 = repo
            .with_conn("count", |c| {
                c.query_row("SELECT COUNT(*) FROM news_events", [], |r| r.get(0))
            })
            .unwrap();
        assert_eq!(count, 0);
    }
}
