// =============================================================================
// Repository: candles and news events
// =============================================================================

use rusqlite::params;

use crate::market::candles::Candle;
use crate::market::news::NewsEvent;
use crate::types::NewsSeverity;

use super::{RepoResult, Repository};

fn map_candle(row: &rusqlite::Row<'_>) -> rusqlite::Result<Candle> {
    Ok(Candle {
        symbol: row.get(0)?,
        interval: row.get(1)?,
        open_time: row.get(2)?,
        open: row.get(3)?,
        high: row.get(4)?,
        low: row.get(5)?,
        close: row.get(6)?,
        volume: row.get(7)?,
    })
}

fn map_news(row: &rusqlite::Row<'_>) -> rusqlite::Result<NewsEvent> {
    Ok(NewsEvent {
        id: row.get(0)?,
        ticker: row.get(1)?,
        kind: row.get(2)?,
        severity: row
            .get::<_, String>(3)?
            .parse::<NewsSeverity>()
            .unwrap_or(NewsSeverity::Low),
        headline: row.get(4)?,
        body: row.get(5)?,
        price_impact: row.get(6)?,
        fired_at: row.get(7)?,
    })
}

impl Repository {
    /// Persist a closed candle. Replays after a writer retry are idempotent.
    pub fn upsert_candle(&self, candle: &Candle) -> RepoResult<()> {
        self.with_conn("upsert_candle", |c| {
            c.execute(
                "INSERT INTO candles (symbol, interval, open_time, open, high, low, close, volume)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(symbol, interval, open_time)
                 DO UPDATE SET open = excluded.open, high = excluded.high,
                               low = excluded.low, close = excluded.close,
                               volume = excluded.volume",
                params![
                    candle.symbol,
                    candle.interval,
                    candle.open_time,
                    candle.open,
                    candle.high,
                    candle.low,
                    candle.close,
                    candle.volume,
                ],
            )?;
            Ok(())
        })
    }

    /// The most recent `limit` closed candles for a series, oldest first.
    pub fn get_candles(&self, symbol: &str, interval: &str, limit: usize) -> RepoResult<Vec<Candle>> {
        self.with_conn("get_candles", |c| {
            let mut stmt = c.prepare(
                "SELECT symbol, interval, open_time, open, high, low, close, volume
                 FROM (SELECT * FROM candles WHERE symbol = ?1 AND interval = ?2
                       ORDER BY open_time DESC LIMIT ?3)
                 ORDER BY open_time ASC",
            )?;
            let rows = stmt.query_map(params![symbol, interval, limit as i64], map_candle)?;
            rows.collect()
        })
    }

    pub fn insert_news(&self, event: &NewsEvent) -> RepoResult<()> {
        self.with_conn("insert_news", |c| {
            c.execute(
                "INSERT INTO news_events (id, ticker, kind, severity, headline, body, price_impact, fired_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    event.id,
                    event.ticker,
                    event.kind,
                    event.severity.to_string(),
                    event.headline,
                    event.body,
                    event.price_impact,
                    event.fired_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn get_recent_news(&self, limit: usize) -> RepoResult<Vec<NewsEvent>> {
        self.with_conn("get_recent_news", |c| {
            let mut stmt = c.prepare(
                "SELECT id, ticker, kind, severity, headline, body, price_impact, fired_at
                 FROM news_events ORDER BY fired_at DESC, rowid DESC LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit as i64], map_news)?;
            rows.collect()
        })
    }

    pub fn get_news_by_ticker(&self, ticker: &str, limit: usize) -> RepoResult<Vec<NewsEvent>> {
        self.with_conn("get_news_by_ticker", |c| {
            let mut stmt = c.prepare(
                "SELECT id, ticker, kind, severity, headline, body, price_impact, fired_at
                 FROM news_events WHERE ticker = ?1
                 ORDER BY fired_at DESC, rowid DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![ticker, limit as i64], map_news)?;
            rows.collect()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repo::test_repo;

    fn candle(open_time: i64, close: f64) -> Candle {
        Candle {
            symbol: "MERX".into(),
            interval: "1m".into(),
            open_time,
            open: close - 0.5,
            high: close + 1.0,
            low: close - 1.0,
            close,
            volume: 1_000.0,
        }
    }

    #[test]
    fn candle_upsert_is_idempotent() {
        let (repo, _d) = test_repo();
        repo.upsert_candle(&candle(60_000, 100.0)).unwrap();
        repo.upsert_candle(&candle(60_000, 101.0)).unwrap(); // writer retry
        let rows = repo.get_candles("MERX", "1m", 10).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].close, 101.0);
    }

    #[test]
    fn candles_come_back_oldest_first_limited() {
        let (repo, _d) = test_repo();
        for i in 0..5 {
            repo.upsert_candle(&candle(i * 60_000, 100.0 + i as f64)).unwrap();
        }
        let rows = repo.get_candles("MERX", "1m", 3).unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[0].close, 102.0);
        assert_eq!(rows[2].close, 104.0);
    }

    #[test]
    fn news_roundtrip_and_ticker_filter() {
        let (repo, _d) = test_repo();
        let ev = NewsEvent {
            id: "n1".into(),
            ticker: "MERX".into(),
            kind: "earnings_beat".into(),
            severity: NewsSeverity::High,
            headline: "h".into(),
            body: "b".into(),
            price_impact: 4.2,
            fired_at: 1,
        };
        repo.insert_news(&ev).unwrap();
        let all = repo.get_recent_news(10).unwrap();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].severity, NewsSeverity::High);
        assert!(repo.get_news_by_ticker("GLDR", 10).unwrap().is_empty());
        assert_eq!(repo.get_news_by_ticker("MERX", 10).unwrap().len(), 1);
    }
}
