use chrono::NaiveDate;

use crate::config::STORE_DATE_FORMAT;
use crate::types::DailyBar;

/// Row type for the daily bar table. Dates are stored as `YYYY-MM-DD` text.
#[derive(Debug, sqlx::FromRow)]
pub struct DailyBarRow {
    pub date: String,
    pub code: String,
    pub name: Option<String>,
    pub open: Option<f64>,
    pub close: Option<f64>,
    pub high: Option<f64>,
    pub low: Option<f64>,
    pub volume: Option<f64>,
    pub turnover_amount: Option<f64>,
    pub amplitude: Option<f64>,
    pub pct_change: Option<f64>,
    pub change: Option<f64>,
    pub turnover_rate: Option<f64>,
}

impl TryFrom<DailyBarRow> for DailyBar {
    type Error = sqlx::Error;

    fn try_from(row: DailyBarRow) -> Result<Self, Self::Error> {
        let date = parse_store_date(&row.date)?;
        Ok(DailyBar {
            date,
            code: row.code,
            name: row.name.unwrap_or_default(),
            open: row.open,
            close: row.close,
            high: row.high,
            low: row.low,
            volume: row.volume,
            turnover_amount: row.turnover_amount,
            amplitude: row.amplitude,
            pct_change: row.pct_change,
            change: row.change,
            turnover_rate: row.turnover_rate,
        })
    }
}

pub fn format_store_date(date: NaiveDate) -> String {
    date.format(STORE_DATE_FORMAT).to_string()
}

pub fn parse_store_date(s: &str) -> Result<NaiveDate, sqlx::Error> {
    NaiveDate::parse_from_str(s, STORE_DATE_FORMAT).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}
