use std::time::Duration;

use chrono::NaiveDate;
use serde::Deserialize;
use tracing::{debug, info};

use crate::config::{
    Config, A_SHARE_LIST_FILTER, EASTMONEY_UT, HTTP_TIMEOUT_SECS, KLINE_FIELD_COUNT,
    LIST_PAGE_SIZE, PROVIDER_DATE_FORMAT, STORE_DATE_FORMAT,
};
use crate::error::{AppError, Result};
use crate::types::{Adjustment, DailyBar, Instrument};

/// External source of the instrument universe and daily history.
///
/// Implementations return bars with `name` left empty; the store stamps it.
#[allow(async_fn_in_trait)]
pub trait MarketDataProvider {
    fn name(&self) -> &str;

    async fn list_instruments(&self) -> Result<Vec<Instrument>>;

    /// Daily bars for `code` over `start..=end`, ascending by date.
    async fn fetch_daily_history(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
        adjust: Adjustment,
    ) -> Result<Vec<DailyBar>>;
}

/// Per-run fetch parameters shared by the store and the driver.
#[derive(Debug, Clone, Copy)]
pub struct FetchOptions {
    pub adjust: Adjustment,
    pub timeout: Duration,
    /// Default upper bound of every fetch window.
    pub today: NaiveDate,
}

/// Provider call bounded by `opts.timeout`. An elapsed call is `AppError::Timeout`.
pub async fn fetch_bounded<P: MarketDataProvider>(
    provider: &P,
    code: &str,
    start: NaiveDate,
    end: NaiveDate,
    opts: &FetchOptions,
) -> Result<Vec<DailyBar>> {
    debug!(code = %code, %start, %end, provider = provider.name(), "Fetching daily history");
    match tokio::time::timeout(
        opts.timeout,
        provider.fetch_daily_history(code, start, end, opts.adjust),
    )
    .await
    {
        Ok(result) => result,
        Err(_) => Err(AppError::Timeout {
            code: code.to_string(),
            secs: opts.timeout.as_secs(),
        }),
    }
}

// ---------------------------------------------------------------------------
// EastMoney HTTP provider
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct KlineResponse {
    data: Option<KlineData>,
}

#[derive(Debug, Deserialize)]
struct KlineData {
    #[serde(default)]
    klines: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    data: Option<ListData>,
}

#[derive(Debug, Deserialize)]
struct ListData {
    #[serde(default)]
    total: usize,
    #[serde(default)]
    diff: Vec<ListEntry>,
}

#[derive(Debug, Deserialize)]
struct ListEntry {
    f12: String,
    f14: String,
}

pub struct EastMoneyProvider {
    client: reqwest::Client,
    kline_url: String,
    list_url: String,
}

impl EastMoneyProvider {
    pub fn new(cfg: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()?;
        Ok(Self {
            client,
            kline_url: cfg.kline_url.clone(),
            list_url: cfg.list_url.clone(),
        })
    }
}

impl MarketDataProvider for EastMoneyProvider {
    fn name(&self) -> &str {
        "eastmoney"
    }

    /// Pages through the A-share listing until `data.total` entries are collected.
    async fn list_instruments(&self) -> Result<Vec<Instrument>> {
        let mut instruments = Vec::new();
        let mut page = 1usize;

        loop {
            let pn = page.to_string();
            let pz = LIST_PAGE_SIZE.to_string();
            let body = self
                .client
                .get(&self.list_url)
                .query(&[
                    ("pn", pn.as_str()),
                    ("pz", pz.as_str()),
                    ("po", "0"),
                    ("np", "1"),
                    ("fltt", "2"),
                    ("invt", "2"),
                    ("fid", "f12"),
                    ("fs", A_SHARE_LIST_FILTER),
                    ("fields", "f12,f14"),
                ])
                .send()
                .await?
                .error_for_status()?
                .bytes()
                .await?;
            let resp: ListResponse = serde_json::from_slice(&body)?;

            let Some((total, batch)) = parse_listing(resp) else {
                break;
            };
            if batch.is_empty() {
                break;
            }
            instruments.extend(batch);
            if instruments.len() >= total {
                break;
            }
            page += 1;
        }

        info!(count = instruments.len(), "Instrument universe listed");
        Ok(instruments)
    }

    async fn fetch_daily_history(
        &self,
        code: &str,
        start: NaiveDate,
        end: NaiveDate,
        adjust: Adjustment,
    ) -> Result<Vec<DailyBar>> {
        let secid = secid(code);
        let beg = request_date(start);
        let end = request_date(end);
        let body = self
            .client
            .get(&self.kline_url)
            .query(&[
                ("fields1", "f1,f2,f3,f4,f5,f6"),
                ("fields2", "f51,f52,f53,f54,f55,f56,f57,f58,f59,f60,f61"),
                ("ut", EASTMONEY_UT),
                ("klt", "101"),
                ("fqt", fqt(adjust)),
                ("secid", secid.as_str()),
                ("beg", beg.as_str()),
                ("end", end.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .bytes()
            .await?;
        let resp: KlineResponse = serde_json::from_slice(&body)?;

        parse_klines(code, resp)
    }
}

/// `YYYYMMDD`, the request-side date format.
pub fn request_date(date: NaiveDate) -> String {
    date.format(PROVIDER_DATE_FORMAT).to_string()
}

/// `{market}.{code}`: 1 for Shanghai (`6xxxxx`), 0 otherwise.
pub fn secid(code: &str) -> String {
    let market = if code.starts_with('6') { 1 } else { 0 };
    format!("{market}.{code}")
}

fn fqt(adjust: Adjustment) -> &'static str {
    match adjust {
        Adjustment::Forward => "1",
        Adjustment::Backward => "2",
        Adjustment::None => "0",
    }
}

fn parse_listing(resp: ListResponse) -> Option<(usize, Vec<Instrument>)> {
    let data = resp.data?;
    let batch = data
        .diff
        .into_iter()
        .map(|e| Instrument::new(e.f12, e.f14))
        .collect();
    Some((data.total, batch))
}

fn parse_klines(code: &str, resp: KlineResponse) -> Result<Vec<DailyBar>> {
    let Some(data) = resp.data else {
        return Ok(Vec::new());
    };
    data.klines.iter().map(|line| parse_kline(code, line)).collect()
}

/// Map one `date,open,close,high,low,volume,amount,amplitude,pct,change,turnover`
/// line into a bar. The returned date is `YYYY-MM-DD`.
pub fn parse_kline(code: &str, line: &str) -> Result<DailyBar> {
    let fields: Vec<&str> = line.split(',').map(str::trim).collect();
    if fields.len() < KLINE_FIELD_COUNT {
        return Err(AppError::Fetch {
            code: code.to_string(),
            reason: format!(
                "kline has {} fields, expected {KLINE_FIELD_COUNT}: {line}",
                fields.len()
            ),
        });
    }

    let date = NaiveDate::parse_from_str(fields[0], STORE_DATE_FORMAT).map_err(|e| {
        AppError::Fetch {
            code: code.to_string(),
            reason: format!("bad kline date '{}': {e}", fields[0]),
        }
    })?;

    let num = |idx: usize, label: &str| parse_number(code, label, fields[idx]);

    Ok(DailyBar {
        date,
        code: code.to_string(),
        name: String::new(),
        open: num(1, "open")?,
        close: num(2, "close")?,
        high: num(3, "high")?,
        low: num(4, "low")?,
        volume: num(5, "volume")?,
        turnover_amount: num(6, "turnover_amount")?,
        amplitude: num(7, "amplitude")?,
        pct_change: num(8, "pct_change")?,
        change: num(9, "change")?,
        turnover_rate: num(10, "turnover_rate")?,
    })
}

fn parse_number(code: &str, label: &str, raw: &str) -> Result<Option<f64>> {
    if raw.is_empty() || raw == "-" {
        return Ok(None);
    }
    raw.parse::<f64>().map(Some).map_err(|_| AppError::Fetch {
        code: code.to_string(),
        reason: format!("non-numeric {label} '{raw}'"),
    })
}
