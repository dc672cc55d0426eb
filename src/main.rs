mod config;
mod db;
mod error;
mod fetcher;
mod sync;
mod types;

#[cfg(test)]
mod test_support;

use std::time::Duration;

use chrono::NaiveDate;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::config::{Config, SyncMode};
use crate::db::{Schema, SchemaManager, StoreConfig};
use crate::error::Result;
use crate::fetcher::{EastMoneyProvider, FetchOptions, MarketDataProvider};
use crate::sync::{SyncDriver, SyncSummary, SyncWindow, WatermarkReport};
use crate::types::Instrument;

#[tokio::main]
async fn main() {
    let today = chrono::Local::now().date_naive();
    let cfg = match Config::from_env(today) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Config error: {e}");
            std::process::exit(1);
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(&cfg.log_level))
        .init();

    if let Err(e) = run(cfg, today).await {
        error!("Fatal error: {e}");
        std::process::exit(1);
    }
}

async fn run(cfg: Config, today: NaiveDate) -> Result<()> {
    // --- Store setup ---
    let schema = Schema::daily_bars(&cfg.table_name)?;
    let manager = SchemaManager::new(StoreConfig::new(&cfg.db_path, schema));
    let outcome = manager.init(cfg.allow_destructive_reset).await?;
    let pool = manager.connect().await?;
    info!(path = %cfg.db_path, table = %cfg.table_name, init = %outcome, "Store ready");

    // --- Universe ---
    let provider = EastMoneyProvider::new(&cfg)?;
    let universe = provider.list_instruments().await?;
    if universe.is_empty() {
        warn!("Provider returned an empty universe, nothing to sync");
        pool.close().await;
        return Ok(());
    }

    let opts = FetchOptions {
        adjust: cfg.adjust,
        timeout: Duration::from_secs(cfg.fetch_timeout_secs),
        today,
    };
    let driver = SyncDriver::new(pool.clone(), &cfg.table_name, provider, opts)
        .with_request_interval(Duration::from_millis(cfg.request_interval_ms));

    let summary = sync_all(&driver, &cfg, &universe, today).await?;

    info!(
        total = summary.total,
        succeeded = summary.succeeded,
        failed = summary.failed,
        skipped = summary.skipped,
        inserted = summary.rows_inserted,
        ignored = summary.rows_ignored,
        "Sync complete: {} ok, {} failed, {} skipped, {} rows written",
        summary.succeeded,
        summary.failed,
        summary.skipped,
        summary.rows_inserted,
    );
    if !summary.all_succeeded() {
        for failure in &summary.failures {
            warn!(code = %failure.code, kind = %failure.kind, "{}", failure.message);
        }
    }

    pool.close().await;
    Ok(())
}

/// Every pass after the universe is known: lagging codes catch up to the
/// global watermark, new listings load their history, then the window pass
/// carries the previously stored codes forward.
async fn sync_all<P: MarketDataProvider>(
    driver: &SyncDriver<P>,
    cfg: &Config,
    universe: &[Instrument],
    today: NaiveDate,
) -> Result<SyncSummary> {
    // --- Watermark ---
    let watermarks = driver.compute_watermarks().await?;
    match watermarks.global_max {
        Some(latest) => info!(
            latest = %latest,
            instruments = watermarks.per_code.len(),
            lagging = watermarks.lagging().len(),
            "Store watermark"
        ),
        None => info!("Store is empty"),
    }

    let mut summary = SyncSummary::default();

    // --- Lagging instruments ---
    summary.merge(
        driver
            .reconcile_lagging(universe, &watermarks, cfg.lagging_policy)
            .await,
    );

    // --- New listings ---
    if cfg.bootstrap_new_listings {
        summary.merge(driver.bootstrap_missing(universe, cfg.epoch_start).await);
    }

    // --- Window pass ---
    let pending = window_universe(cfg, &watermarks, universe);
    match choose_window(cfg, &watermarks, today) {
        Some(window) if !pending.is_empty() => summary.merge(driver.run(&pending, window).await),
        Some(_) => info!("Every listed code was just bootstrapped, skipping window pass"),
        None => info!("Store already holds data through {today}, skipping window pass"),
    }

    Ok(summary)
}

/// Codes the window pass fetches. With bootstrap enabled, codes that had no
/// stored rows were loaded through today by the bootstrap pass and are left
/// out, unless an explicit range was asked for.
fn window_universe(cfg: &Config, watermarks: &WatermarkReport, universe: &[Instrument]) -> Vec<Instrument> {
    let explicit = cfg.sync_start.is_some() || cfg.sync_end.is_some();
    if !cfg.bootstrap_new_listings || explicit {
        return universe.to_vec();
    }
    universe
        .iter()
        .filter(|i| watermarks.latest_for(&i.code).is_some())
        .cloned()
        .collect()
}

/// Window for the main pass, or `None` when the store is already current.
fn choose_window(
    cfg: &Config,
    watermarks: &WatermarkReport,
    today: NaiveDate,
) -> Option<SyncWindow> {
    if cfg.sync_start.is_some() || cfg.sync_end.is_some() {
        let start = cfg
            .sync_start
            .or_else(|| watermarks.next_start())
            .unwrap_or(cfg.epoch_start);
        let end = cfg.sync_end.unwrap_or(today);
        return Some(SyncWindow::Fixed { start, end });
    }
    if cfg.sync_mode == SyncMode::Daily {
        return Some(SyncWindow::Incremental);
    }
    match watermarks.next_start() {
        Some(start) if start > today => None,
        Some(start) => Some(SyncWindow::Fixed { start, end: today }),
        None => Some(SyncWindow::Fixed { start: cfg.epoch_start, end: today }),
    }
}
