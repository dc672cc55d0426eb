use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("HTTP request error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid schema: {0}")]
    InvalidSchema(String),

    #[error("Table '{table}' does not match the configured schema (set ALLOW_DESTRUCTIVE_RESET=true to drop and recreate)")]
    SchemaMismatch { table: String },

    #[error("Fetch error for {code}: {reason}")]
    Fetch { code: String, reason: String },

    #[error("Fetch for {code} timed out after {secs}s")]
    Timeout { code: String, secs: u64 },

    #[error("Write error for {code}: {reason}")]
    Write { code: String, reason: String },

    #[error("No stored rows for {code}; an explicit start date is required")]
    NoWatermark { code: String },
}

pub type Result<T> = std::result::Result<T, AppError>;

/// Per-instrument failure category, as recorded by the sync driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    Fetch,
    Timeout,
    Write,
    Store,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            FailureKind::Fetch => "fetch",
            FailureKind::Timeout => "timeout",
            FailureKind::Write => "write",
            FailureKind::Store => "store",
        };
        write!(f, "{s}")
    }
}

impl AppError {
    pub fn kind(&self) -> FailureKind {
        match self {
            AppError::Http(_) | AppError::Json(_) | AppError::Fetch { .. } => FailureKind::Fetch,
            AppError::Timeout { .. } => FailureKind::Timeout,
            AppError::Database(_) | AppError::Write { .. } | AppError::NoWatermark { .. } => {
                FailureKind::Write
            }
            AppError::Io(_)
            | AppError::Config(_)
            | AppError::InvalidSchema(_)
            | AppError::SchemaMismatch { .. } => FailureKind::Store,
        }
    }
}
