//! Shared fixtures for the in-module tests.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Mutex;
use std::time::Duration;

use chrono::NaiveDate;
use sqlx::sqlite::{SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool};
use sqlx::Connection;
use tempfile::TempDir;

use crate::db::{Schema, SchemaManager, StoreConfig};
use crate::error::{AppError, Result};
use crate::fetcher::{FetchOptions, MarketDataProvider};
use crate::types::{Adjustment, DailyBar, Instrument};

pub fn date(s: &str) -> NaiveDate {
    NaiveDate::parse_from_str(s, "%Y-%m-%d").unwrap()
}

pub fn bar(code: &str, day: &str, open: f64) -> DailyBar {
    DailyBar {
        date: date(day),
        code: code.to_string(),
        name: String::new(),
        open: Some(open),
        close: Some(open + 0.1),
        high: Some(open + 0.2),
        low: Some(open - 0.1),
        volume: Some(1_000.0),
        turnover_amount: Some(open * 1_000.0),
        amplitude: Some(3.0),
        pct_change: Some(1.0),
        change: Some(0.1),
        turnover_rate: None,
    }
}

pub fn fetch_opts(today: NaiveDate) -> FetchOptions {
    FetchOptions {
        adjust: Adjustment::Forward,
        timeout: Duration::from_secs(5),
        today,
    }
}

/// A store config under a fresh temp dir. The file itself is not created.
pub fn temp_store() -> (TempDir, StoreConfig) {
    let dir = tempfile::tempdir().unwrap();
    let config = StoreConfig::new(dir.path().join("test.db"), Schema::daily_bars("stock").unwrap());
    (dir, config)
}

/// A valid, empty store and its pool.
pub async fn open_store() -> (TempDir, SqlitePool) {
    let (dir, config) = temp_store();
    let manager = SchemaManager::new(config);
    manager.init(false).await.unwrap();
    let pool = manager.connect().await.unwrap();
    (dir, pool)
}

async fn raw_connection(path: &Path) -> SqliteConnection {
    let opts = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Delete);
    SqliteConnection::connect_with(&opts).await.unwrap()
}

/// Run a statement against `path` outside the schema manager.
pub async fn raw_exec(path: &Path, sql: &str) {
    let mut conn = raw_connection(path).await;
    sqlx::query(sql).execute(&mut conn).await.unwrap();
    conn.close().await.unwrap();
}

pub async fn raw_count(path: &Path, sql: &str) -> i64 {
    let mut conn = raw_connection(path).await;
    let count: i64 = sqlx::query_scalar(sql).fetch_one(&mut conn).await.unwrap();
    conn.close().await.unwrap();
    count
}

/// In-memory provider that records every history request.
#[derive(Default)]
pub struct StubProvider {
    universe: Vec<Instrument>,
    bars: Vec<DailyBar>,
    failing: HashSet<String>,
    slow: HashSet<String>,
    requests: Mutex<Vec<(String, NaiveDate, NaiveDate)>>,
}

impl StubProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_universe(mut self, universe: Vec<Instrument>) -> Self {
        self.universe = universe;
        self
    }

    pub fn with_bars(mut self, bars: Vec<DailyBar>) -> Self {
        self.bars.extend(bars);
        self
    }

    pub fn failing(mut self, code: &str) -> Self {
        self.failing.insert(code.to_string());
        self
    }

    /// Requests for `code` never complete within a test timeout.
    pub fn slow(mut self, code: &str) -> Self {
        self.slow.insert(code.to_string());
        self
    }

    pub fn requests(&self) -> Vec<(String, NaiveDate, NaiveDate)> {
        self.requests.lock().unwrap().clone()
    }
}

impl MarketDataProvider for StubProvider {
    fn name(&self) -> &str {
        "stub"
    }

    async fn list_instruments(&self) -> Result<Vec<Instrument>> {
        Ok(self.universe.clone())
    }

    async fn fetch_daily_history(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
        _adjust: Adjustment,
    ) -> Result<Vec<DailyBar>> {
        self.requests
            .lock()
            .unwrap()
            .push((code.to_string(), start, end));

        if self.slow.contains(code) {
            tokio::time::sleep(Duration::from_secs(30)).await;
        }
        if self.failing.contains(code) {
            return Err(AppError::Fetch {
                code: code.to_string(),
                reason: "stub failure".to_string(),
            });
        }

        Ok(self
            .bars
            .iter()
            .filter(|b| b.code == code && b.date >= start && b.date <= end)
            .cloned()
            .collect())
    }
}
