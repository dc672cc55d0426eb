use chrono::{Days, NaiveDate};
use sqlx::sqlite::SqlitePool;
use tracing::{debug, info, warn};

use crate::db::models::{format_store_date, parse_store_date, DailyBarRow};
use crate::db::schema::{quote_ident, DAILY_BAR_COLUMNS};
use crate::error::{AppError, Result};
use crate::fetcher::{fetch_bounded, FetchOptions, MarketDataProvider};
use crate::types::DailyBar;

/// Outcome of one `write` batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub inserted: u64,
    /// Rows whose `(date, code)` was already stored.
    pub ignored: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapOutcome {
    AlreadyPopulated { rows: i64 },
    /// No name could be resolved for the code; nothing was fetched.
    Unresolved,
    Loaded(WriteReport),
}

/// Read/write access to one instrument's rows.
pub struct InstrumentStore {
    pool: SqlitePool,
    table: String,
    code: String,
}

impl InstrumentStore {
    pub fn new(pool: SqlitePool, table: impl Into<String>, code: impl Into<String>) -> Self {
        Self { pool, table: table.into(), code: code.into() }
    }

    /// Rows for this code within the inclusive bounds, newest first.
    pub async fn read(
        &self,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
    ) -> Result<Vec<DailyBar>> {
        let columns = DAILY_BAR_COLUMNS
            .iter()
            .map(|(name, _)| quote_ident(name))
            .collect::<Vec<_>>()
            .join(", ");
        let mut sql = format!(
            "SELECT {columns} FROM {} WHERE \"code\" = ?",
            quote_ident(&self.table)
        );
        let start = start.map(format_store_date);
        let end = end.map(format_store_date);
        if start.is_some() {
            sql.push_str(" AND \"date\" >= ?");
        }
        if end.is_some() {
            sql.push_str(" AND \"date\" <= ?");
        }
        sql.push_str(" ORDER BY \"date\" DESC");

        let mut query = sqlx::query_as::<_, DailyBarRow>(&sql).bind(&self.code);
        if let Some(s) = &start {
            query = query.bind(s);
        }
        if let Some(e) = &end {
            query = query.bind(e);
        }

        let rows = query.fetch_all(&self.pool).await?;
        let bars = rows
            .into_iter()
            .map(DailyBar::try_from)
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(bars)
    }

    pub async fn row_count(&self) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE \"code\" = ?",
            quote_ident(&self.table)
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(&self.code)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Highest stored date for this code.
    pub async fn latest_date(&self) -> Result<Option<NaiveDate>> {
        let sql = format!(
            "SELECT MAX(\"date\") FROM {} WHERE \"code\" = ?",
            quote_ident(&self.table)
        );
        let max: Option<String> = sqlx::query_scalar(&sql)
            .bind(&self.code)
            .fetch_one(&self.pool)
            .await?;
        Ok(max.as_deref().map(parse_store_date).transpose()?)
    }

    /// Stamp `name` on every row and append the batch in one transaction.
    ///
    /// Rows already present by `(date, code)` are skipped (`INSERT OR IGNORE`)
    /// and counted in `ignored`; any other failure rolls back the whole batch.
    pub async fn write(&self, name: &str, rows: Vec<DailyBar>) -> Result<WriteReport> {
        if let Some(stray) = rows.iter().find(|r| r.code != self.code) {
            return Err(AppError::Write {
                code: self.code.clone(),
                reason: format!("batch contains a row for {}", stray.code),
            });
        }

        let columns: Vec<String> = DAILY_BAR_COLUMNS.iter().map(|(n, _)| quote_ident(n)).collect();
        let placeholders = vec!["?"; columns.len()].join(", ");
        let sql = format!(
            "INSERT OR IGNORE INTO {} ({}) VALUES ({placeholders})",
            quote_ident(&self.table),
            columns.join(", ")
        );

        let total = rows.len() as u64;
        let mut inserted = 0u64;
        let mut tx = self.pool.begin().await?;
        for mut bar in rows {
            bar.name = name.to_string();
            let result = sqlx::query(&sql)
                .bind(format_store_date(bar.date))
                .bind(&bar.code)
                .bind(&bar.name)
                .bind(bar.open)
                .bind(bar.close)
                .bind(bar.high)
                .bind(bar.low)
                .bind(bar.volume)
                .bind(bar.turnover_amount)
                .bind(bar.amplitude)
                .bind(bar.pct_change)
                .bind(bar.change)
                .bind(bar.turnover_rate)
                .execute(&mut *tx)
                .await?;
            inserted += result.rows_affected();
        }
        tx.commit().await?;

        let report = WriteReport { inserted, ignored: total - inserted };
        debug!(
            code = %self.code,
            inserted = report.inserted,
            ignored = report.ignored,
            "Batch committed"
        );
        Ok(report)
    }

    /// Fetch and append `start..=end`.
    ///
    /// `start` defaults to the day after the stored watermark and `end` to
    /// `opts.today`. Without stored rows an explicit `start` is required.
    pub async fn update<P: MarketDataProvider>(
        &self,
        provider: &P,
        name: &str,
        start: Option<NaiveDate>,
        end: Option<NaiveDate>,
        opts: &FetchOptions,
    ) -> Result<WriteReport> {
        let start = match start {
            Some(s) => s,
            None => {
                let latest = self
                    .latest_date()
                    .await?
                    .ok_or_else(|| AppError::NoWatermark { code: self.code.clone() })?;
                next_day(latest)
            }
        };
        let end = end.unwrap_or(opts.today);

        if start > end {
            debug!(code = %self.code, %start, %end, "Already up to date");
            return Ok(WriteReport::default());
        }

        let bars = fetch_bounded(provider, &self.code, start, end, opts).await?;
        self.write(name, bars).await
    }

    /// Load `epoch..=today` for a code with no stored rows.
    pub async fn bootstrap_if_empty<P, F>(
        &self,
        provider: &P,
        lookup: F,
        epoch: NaiveDate,
        opts: &FetchOptions,
    ) -> Result<BootstrapOutcome>
    where
        P: MarketDataProvider,
        F: FnOnce(&str) -> Option<String>,
    {
        let rows = self.row_count().await?;
        if rows > 0 {
            return Ok(BootstrapOutcome::AlreadyPopulated { rows });
        }

        let Some(name) = lookup(&self.code) else {
            warn!(code = %self.code, "No name for code, skipping bootstrap");
            return Ok(BootstrapOutcome::Unresolved);
        };

        let bars = fetch_bounded(provider, &self.code, epoch, opts.today, opts).await?;
        let report = self.write(&name, bars).await?;
        info!(
            code = %self.code,
            name = %name,
            inserted = report.inserted,
            from = %epoch,
            "Bootstrapped history"
        );
        Ok(BootstrapOutcome::Loaded(report))
    }
}

pub fn next_day(date: NaiveDate) -> NaiveDate {
    date.checked_add_days(Days::new(1)).unwrap_or(date)
}
