use chrono::{Months, NaiveDate};

use crate::error::{AppError, Result};
use crate::sync::LaggingPolicy;
use crate::types::Adjustment;

pub const KLINE_URL: &str = "https://push2his.eastmoney.com/api/qt/stock/kline/get";
pub const LIST_URL: &str = "https://82.push2.eastmoney.com/api/qt/clist/get";

/// Public token the EastMoney web front-end sends with kline requests.
pub const EASTMONEY_UT: &str = "7eea3edcaed734bea9cbfc24409ed989";

/// Shenzhen main, ChiNext, Shanghai main, STAR, Beijing.
pub const A_SHARE_LIST_FILTER: &str = "m:0+t:6,m:0+t:80,m:1+t:2,m:1+t:23,m:0+t:81+s:2048";

/// Listing page size; the endpoint caps pages at 100 entries.
pub const LIST_PAGE_SIZE: usize = 100;

/// Fields per kline line: date plus ten numeric columns.
pub const KLINE_FIELD_COUNT: usize = 11;

/// Per-request HTTP timeout (seconds).
pub const HTTP_TIMEOUT_SECS: u64 = 30;

/// SQLite busy timeout (seconds).
pub const STORE_BUSY_TIMEOUT_SECS: u64 = 5;

/// Stored and returned-by-provider date format.
pub const STORE_DATE_FORMAT: &str = "%Y-%m-%d";

/// Provider request date format.
pub const PROVIDER_DATE_FORMAT: &str = "%Y%m%d";

/// Default history depth when EPOCH_START is unset.
pub const DEFAULT_HISTORY_MONTHS: u32 = 60;

/// How the window pass picks its date range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// From the global watermark + 1 day through today.
    Watermark,
    /// Yesterday through today.
    Daily,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub log_level: String,
    pub db_path: String,
    pub table_name: String,
    pub kline_url: String,
    pub list_url: String,
    /// First date loaded for an instrument with no stored rows (EPOCH_START)
    pub epoch_start: NaiveDate,
    pub adjust: Adjustment,
    /// Upper bound on a single provider call (FETCH_TIMEOUT_SECS)
    pub fetch_timeout_secs: u64,
    /// Pause between instruments (REQUEST_INTERVAL_MS)
    pub request_interval_ms: u64,
    /// Drop and recreate a non-conformant store (ALLOW_DESTRUCTIVE_RESET)
    pub allow_destructive_reset: bool,
    pub lagging_policy: LaggingPolicy,
    /// Load full history for listed codes with no stored rows (BOOTSTRAP_NEW_LISTINGS)
    pub bootstrap_new_listings: bool,
    pub sync_mode: SyncMode,
    /// Fixed window override (SYNC_START / SYNC_END), `YYYY-MM-DD` or `YYYYMMDD`
    pub sync_start: Option<NaiveDate>,
    pub sync_end: Option<NaiveDate>,
}

impl Config {
    pub fn from_env(today: NaiveDate) -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok(), today)
    }

    pub fn from_lookup<F>(var: F, today: NaiveDate) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let epoch_start = match var("EPOCH_START") {
            Some(s) => parse_config_date("EPOCH_START", &s)?,
            None => today
                .checked_sub_months(Months::new(DEFAULT_HISTORY_MONTHS))
                .unwrap_or(today),
        };

        let adjust = match var("ADJUST") {
            Some(s) => Adjustment::parse(&s)
                .ok_or_else(|| AppError::Config(format!("ADJUST must be qfq, hfq or none, got '{s}'")))?,
            None => Adjustment::Forward,
        };

        let lagging_policy = match var("LAGGING_POLICY") {
            Some(s) => LaggingPolicy::parse(&s).ok_or_else(|| {
                AppError::Config(format!("LAGGING_POLICY must be log or refresh, got '{s}'"))
            })?,
            None => LaggingPolicy::LogOnly,
        };

        let sync_mode = match var("SYNC_MODE").as_deref().map(str::trim) {
            None | Some("") | Some("watermark") => SyncMode::Watermark,
            Some("daily") => SyncMode::Daily,
            Some(other) => {
                return Err(AppError::Config(format!(
                    "SYNC_MODE must be watermark or daily, got '{other}'"
                )))
            }
        };

        let sync_start = var("SYNC_START")
            .map(|s| parse_config_date("SYNC_START", &s))
            .transpose()?;
        let sync_end = var("SYNC_END")
            .map(|s| parse_config_date("SYNC_END", &s))
            .transpose()?;
        if let (Some(s), Some(e)) = (sync_start, sync_end) {
            if s > e {
                return Err(AppError::Config(format!("SYNC_START {s} is after SYNC_END {e}")));
            }
        }

        Ok(Self {
            log_level: var("LOG_LEVEL").unwrap_or_else(|| "info".to_string()),
            db_path: var("DB_PATH").unwrap_or_else(|| "AShare.db".to_string()),
            table_name: var("TABLE_NAME").unwrap_or_else(|| "stock".to_string()),
            kline_url: var("KLINE_URL").unwrap_or_else(|| KLINE_URL.to_string()),
            list_url: var("LIST_URL").unwrap_or_else(|| LIST_URL.to_string()),
            epoch_start,
            adjust,
            fetch_timeout_secs: var("FETCH_TIMEOUT_SECS")
                .unwrap_or_else(|| "30".to_string())
                .parse::<u64>()
                .map_err(|_| AppError::Config("FETCH_TIMEOUT_SECS must be a whole number of seconds".to_string()))?,
            request_interval_ms: var("REQUEST_INTERVAL_MS")
                .unwrap_or_else(|| "0".to_string())
                .parse::<u64>()
                .map_err(|_| AppError::Config("REQUEST_INTERVAL_MS must be a whole number".to_string()))?,
            allow_destructive_reset: parse_flag("ALLOW_DESTRUCTIVE_RESET", var("ALLOW_DESTRUCTIVE_RESET"), false)?,
            lagging_policy,
            bootstrap_new_listings: parse_flag("BOOTSTRAP_NEW_LISTINGS", var("BOOTSTRAP_NEW_LISTINGS"), true)?,
            sync_mode,
            sync_start,
            sync_end,
        })
    }
}

fn parse_config_date(key: &str, raw: &str) -> Result<NaiveDate> {
    let raw = raw.trim();
    NaiveDate::parse_from_str(raw, STORE_DATE_FORMAT)
        .or_else(|_| NaiveDate::parse_from_str(raw, PROVIDER_DATE_FORMAT))
        .map_err(|_| AppError::Config(format!("{key} must be YYYY-MM-DD or YYYYMMDD, got '{raw}'")))
}

fn parse_flag(key: &str, raw: Option<String>, default: bool) -> Result<bool> {
    let Some(raw) = raw else {
        return Ok(default);
    };
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(AppError::Config(format!("{key} must be true or false, got '{raw}'"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config_with(pairs: &[(&str, &str)], today: NaiveDate) -> Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| vars.get(k).cloned(), today)
    }

    fn d(y: i32, m: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, day).unwrap()
    }

    #[test]
    fn defaults_without_env() {
        let cfg = config_with(&[], d(2024, 6, 3)).unwrap();
        assert_eq!(cfg.db_path, "AShare.db");
        assert_eq!(cfg.table_name, "stock");
        assert_eq!(cfg.epoch_start, d(2019, 6, 3));
        assert_eq!(cfg.adjust, Adjustment::Forward);
        assert_eq!(cfg.lagging_policy, LaggingPolicy::LogOnly);
        assert_eq!(cfg.sync_mode, SyncMode::Watermark);
        assert!(!cfg.allow_destructive_reset);
        assert!(cfg.bootstrap_new_listings);
        assert_eq!(cfg.fetch_timeout_secs, 30);
    }

    #[test]
    fn accepts_both_date_formats() {
        let cfg = config_with(
            &[("EPOCH_START", "2020-01-01"), ("SYNC_START", "20240102"), ("SYNC_END", "2024-01-05")],
            d(2024, 6, 3),
        )
        .unwrap();
        assert_eq!(cfg.epoch_start, d(2020, 1, 1));
        assert_eq!(cfg.sync_start, Some(d(2024, 1, 2)));
        assert_eq!(cfg.sync_end, Some(d(2024, 1, 5)));
    }

    #[test]
    fn rejects_inverted_window_and_bad_values() {
        assert!(config_with(&[("SYNC_START", "2024-02-01"), ("SYNC_END", "2024-01-01")], d(2024, 6, 3)).is_err());
        assert!(config_with(&[("EPOCH_START", "01/01/2020")], d(2024, 6, 3)).is_err());
        assert!(config_with(&[("LAGGING_POLICY", "panic")], d(2024, 6, 3)).is_err());
        assert!(config_with(&[("ALLOW_DESTRUCTIVE_RESET", "maybe")], d(2024, 6, 3)).is_err());
        assert!(config_with(&[("FETCH_TIMEOUT_SECS", "soon")], d(2024, 6, 3)).is_err());
    }

    #[test]
    fn parses_policies_and_flags() {
        let cfg = config_with(
            &[
                ("LAGGING_POLICY", "refresh"),
                ("ALLOW_DESTRUCTIVE_RESET", "true"),
                ("BOOTSTRAP_NEW_LISTINGS", "0"),
                ("SYNC_MODE", "daily"),
                ("ADJUST", "hfq"),
            ],
            d(2024, 6, 3),
        )
        .unwrap();
        assert_eq!(cfg.lagging_policy, LaggingPolicy::Refresh);
        assert!(cfg.allow_destructive_reset);
        assert!(!cfg.bootstrap_new_listings);
        assert_eq!(cfg.sync_mode, SyncMode::Daily);
        assert_eq!(cfg.adjust, Adjustment::Backward);
    }
}
