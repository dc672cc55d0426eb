use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{Days, NaiveDate};
use sqlx::sqlite::SqlitePool;
use tracing::{info, warn};

use crate::db::instrument_store::next_day;
use crate::db::models::parse_store_date;
use crate::db::schema::quote_ident;
use crate::db::{BootstrapOutcome, InstrumentStore, WriteReport};
use crate::error::{FailureKind, Result};
use crate::fetcher::{fetch_bounded, FetchOptions, MarketDataProvider};
use crate::types::{lookup_name, Instrument};

/// Date range for a window pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncWindow {
    Fixed { start: NaiveDate, end: NaiveDate },
    /// Yesterday through today.
    Incremental,
}

impl SyncWindow {
    pub fn resolve(&self, today: NaiveDate) -> (NaiveDate, NaiveDate) {
        match *self {
            SyncWindow::Fixed { start, end } => (start, end),
            SyncWindow::Incremental => {
                let yesterday = today.checked_sub_days(Days::new(1)).unwrap_or(today);
                (yesterday, today)
            }
        }
    }
}

/// What to do with instruments whose watermark trails the global one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaggingPolicy {
    LogOnly,
    /// Update each lagging instrument from its own watermark.
    Refresh,
}

impl LaggingPolicy {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "log" | "log_only" => Some(LaggingPolicy::LogOnly),
            "refresh" => Some(LaggingPolicy::Refresh),
            _ => None,
        }
    }
}

impl std::fmt::Display for LaggingPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            LaggingPolicy::LogOnly => "log",
            LaggingPolicy::Refresh => "refresh",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone)]
pub struct InstrumentFailure {
    pub code: String,
    pub kind: FailureKind,
    pub message: String,
}

/// Tally of one or more passes over the universe.
#[derive(Debug, Default)]
pub struct SyncSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    /// Instruments the pass had nothing to do for.
    pub skipped: usize,
    pub rows_inserted: u64,
    pub rows_ignored: u64,
    pub failures: Vec<InstrumentFailure>,
}

impl SyncSummary {
    pub fn all_succeeded(&self) -> bool {
        self.failed == 0
    }

    pub fn merge(&mut self, other: SyncSummary) {
        self.total += other.total;
        self.succeeded += other.succeeded;
        self.failed += other.failed;
        self.skipped += other.skipped;
        self.rows_inserted += other.rows_inserted;
        self.rows_ignored += other.rows_ignored;
        self.failures.extend(other.failures);
    }

    fn record_success(&mut self, report: WriteReport) {
        self.total += 1;
        self.succeeded += 1;
        self.rows_inserted += report.inserted;
        self.rows_ignored += report.ignored;
    }

    fn record_skip(&mut self) {
        self.total += 1;
        self.skipped += 1;
    }

    fn record_failure(&mut self, code: &str, kind: FailureKind, message: String) {
        self.total += 1;
        self.failed += 1;
        self.failures.push(InstrumentFailure { code: code.to_string(), kind, message });
    }
}

/// Per-code maximum stored date, plus the maximum across all codes.
#[derive(Debug, Clone, Default)]
pub struct WatermarkReport {
    pub per_code: BTreeMap<String, NaiveDate>,
    pub global_max: Option<NaiveDate>,
}

impl WatermarkReport {
    pub fn latest_for(&self, code: &str) -> Option<NaiveDate> {
        self.per_code.get(code).copied()
    }

    /// Codes whose watermark is behind the global maximum.
    pub fn lagging(&self) -> Vec<(&str, NaiveDate)> {
        let Some(global) = self.global_max else {
            return Vec::new();
        };
        self.per_code
            .iter()
            .filter(|(_, d)| **d < global)
            .map(|(c, d)| (c.as_str(), *d))
            .collect()
    }

    /// Default start of the next incremental run: global maximum + 1 day.
    pub fn next_start(&self) -> Option<NaiveDate> {
        self.global_max.map(next_day)
    }
}

/// Walks an instrument universe one instrument at a time.
///
/// Each instrument's outcome is a `Result`; a failure is recorded in the
/// summary and the loop moves on.
pub struct SyncDriver<P> {
    pool: SqlitePool,
    table: String,
    provider: P,
    opts: FetchOptions,
    request_interval: Duration,
}

impl<P: MarketDataProvider> SyncDriver<P> {
    pub fn new(pool: SqlitePool, table: impl Into<String>, provider: P, opts: FetchOptions) -> Self {
        Self {
            pool,
            table: table.into(),
            provider,
            opts,
            request_interval: Duration::ZERO,
        }
    }

    pub fn with_request_interval(mut self, interval: Duration) -> Self {
        self.request_interval = interval;
        self
    }

    #[cfg(test)]
    pub fn provider(&self) -> &P {
        &self.provider
    }

    fn store_for(&self, code: &str) -> InstrumentStore {
        InstrumentStore::new(self.pool.clone(), self.table.clone(), code)
    }

    async fn pace(&self, index: usize) {
        if index > 0 && !self.request_interval.is_zero() {
            tokio::time::sleep(self.request_interval).await;
        }
    }

    async fn sync_one(
        &self,
        instrument: &Instrument,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<WriteReport> {
        let bars = fetch_bounded(&self.provider, &instrument.code, start, end, &self.opts).await?;
        self.store_for(&instrument.code)
            .write(&instrument.name, bars)
            .await
    }

    /// Fetch `window` for every instrument in listing order and append it.
    pub async fn run(&self, universe: &[Instrument], window: SyncWindow) -> SyncSummary {
        let (start, end) = window.resolve(self.opts.today);
        let total = universe.len();
        info!(instruments = total, %start, %end, adjust = %self.opts.adjust, "Sync pass starting");

        let mut summary = SyncSummary::default();
        for (i, instrument) in universe.iter().enumerate() {
            self.pace(i).await;
            match self.sync_one(instrument, start, end).await {
                Ok(report) => {
                    info!(
                        code = %instrument.code,
                        inserted = report.inserted,
                        ignored = report.ignored,
                        "[{}/{total}] {} written",
                        i + 1,
                        instrument.code,
                    );
                    summary.record_success(report);
                }
                Err(e) => {
                    warn!(
                        code = %instrument.code,
                        kind = %e.kind(),
                        "[{}/{total}] {} failed: {e}",
                        i + 1,
                        instrument.code,
                    );
                    summary.record_failure(&instrument.code, e.kind(), e.to_string());
                }
            }
        }
        summary
    }

    /// Load full history from `epoch` for every listed instrument with no stored rows.
    pub async fn bootstrap_missing(&self, universe: &[Instrument], epoch: NaiveDate) -> SyncSummary {
        // One grouped query up front; only codes missing from it are checked row by row.
        let populated = match self.compute_watermarks().await {
            Ok(report) => report,
            Err(e) => {
                warn!("Watermark query failed, checking each code: {e}");
                WatermarkReport::default()
            }
        };

        let mut summary = SyncSummary::default();
        let mut fetched = 0usize;
        for instrument in universe {
            if populated.latest_for(&instrument.code).is_some() {
                summary.record_skip();
                continue;
            }
            self.pace(fetched).await;
            let store = self.store_for(&instrument.code);
            let lookup = |code: &str| lookup_name(universe, code).map(str::to_string);
            match store
                .bootstrap_if_empty(&self.provider, lookup, epoch, &self.opts)
                .await
            {
                Ok(BootstrapOutcome::Loaded(report)) => {
                    fetched += 1;
                    summary.record_success(report);
                }
                Ok(BootstrapOutcome::AlreadyPopulated { .. }) | Ok(BootstrapOutcome::Unresolved) => {
                    summary.record_skip()
                }
                Err(e) => {
                    fetched += 1;
                    warn!(code = %instrument.code, kind = %e.kind(), "Bootstrap failed: {e}");
                    summary.record_failure(&instrument.code, e.kind(), e.to_string());
                }
            }
        }
        if fetched > 0 {
            info!(new_listings = fetched, "Bootstrap pass complete");
        }
        summary
    }

    pub async fn compute_watermarks(&self) -> Result<WatermarkReport> {
        let sql = format!(
            "SELECT \"code\", MAX(\"date\") FROM {} GROUP BY \"code\" ORDER BY \"code\"",
            quote_ident(&self.table)
        );
        let rows: Vec<(String, String)> = sqlx::query_as(&sql).fetch_all(&self.pool).await?;

        let mut report = WatermarkReport::default();
        for (code, latest) in rows {
            let latest = parse_store_date(&latest)?;
            report.global_max = Some(report.global_max.map_or(latest, |g| g.max(latest)));
            report.per_code.insert(code, latest);
        }
        Ok(report)
    }

    /// Apply `policy` to every instrument that trails the global watermark.
    ///
    /// `Refresh` fetches each lagging code from its own watermark + 1 up to
    /// the global watermark taken in `report`, so the gap is closed before any
    /// window pass moves the whole store forward.
    pub async fn reconcile_lagging(
        &self,
        universe: &[Instrument],
        report: &WatermarkReport,
        policy: LaggingPolicy,
    ) -> SyncSummary {
        let mut summary = SyncSummary::default();
        let lagging = report.lagging();
        if lagging.is_empty() {
            return summary;
        }

        let global = report.global_max;
        for (code, latest) in &lagging {
            warn!(
                code = %code,
                latest = %latest,
                global = ?global,
                policy = %policy,
                "Instrument behind the rest of the store"
            );
        }
        if policy == LaggingPolicy::LogOnly {
            return summary;
        }

        for (i, (code, latest)) in lagging.iter().enumerate() {
            let Some(name) = lookup_name(universe, code) else {
                info!(code = %code, "Lagging code no longer listed, leaving as is");
                summary.record_skip();
                continue;
            };
            self.pace(i).await;
            let store = self.store_for(code);
            let start = Some(next_day(*latest));
            match store.update(&self.provider, name, start, global, &self.opts).await {
                Ok(report) => {
                    info!(code = %code, inserted = report.inserted, "Lagging instrument refreshed");
                    summary.record_success(report);
                }
                Err(e) => {
                    warn!(code = %code, kind = %e.kind(), "Lagging refresh failed: {e}");
                    summary.record_failure(code, e.kind(), e.to_string());
                }
            }
        }
        summary
    }
}
