use chrono::NaiveDate;

// ---------------------------------------------------------------------------
// Instrument
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instrument {
    pub code: String,
    pub name: String,
}

impl Instrument {
    pub fn new(code: impl Into<String>, name: impl Into<String>) -> Self {
        Self { code: code.into(), name: name.into() }
    }
}

/// Resolve a display name for `code` from a listing, first match wins.
pub fn lookup_name<'a>(universe: &'a [Instrument], code: &str) -> Option<&'a str> {
    universe
        .iter()
        .find(|i| i.code == code)
        .map(|i| i.name.as_str())
}

// ---------------------------------------------------------------------------
// DailyBar
// ---------------------------------------------------------------------------

/// One trading day for one instrument. `(date, code)` is the store's primary key.
#[derive(Debug, Clone, PartialEq)]
pub struct DailyBar {
    pub date: NaiveDate,
    pub code: String,
    pub name: String,
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

// ---------------------------------------------------------------------------
// Adjustment
// ---------------------------------------------------------------------------

/// Price adjustment convention requested from the provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Adjustment {
    /// 前复权 (qfq)
    #[default]
    Forward,
    /// 后复权 (hfq)
    Backward,
    None,
}

impl Adjustment {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "qfq" | "forward" => Some(Adjustment::Forward),
            "hfq" | "backward" => Some(Adjustment::Backward),
            "" | "none" => Some(Adjustment::None),
            _ => None,
        }
    }
}

impl std::fmt::Display for Adjustment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Adjustment::Forward => "qfq",
            Adjustment::Backward => "hfq",
            Adjustment::None => "none",
        };
        write!(f, "{s}")
    }
}
