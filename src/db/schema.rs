use std::collections::HashSet;
use std::path::{Path, PathBuf};

use crate::error::{AppError, Result};

/// Declared SQLite column type. Only the two affinities the store uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnType {
    Text,
    Real,
}

impl ColumnType {
    pub fn as_sql(&self) -> &'static str {
        match self {
            ColumnType::Text => "TEXT",
            ColumnType::Real => "REAL",
        }
    }

    /// Case-insensitive match against a declared type from `PRAGMA table_info`.
    pub fn matches(&self, declared: &str) -> bool {
        declared.trim().eq_ignore_ascii_case(self.as_sql())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Column {
    pub name: String,
    pub ty: ColumnType,
}

/// Column layout of the daily bar table, in DDL order.
pub const DAILY_BAR_COLUMNS: [(&str, ColumnType); 13] = [
    ("date", ColumnType::Text),
    ("code", ColumnType::Text),
    ("name", ColumnType::Text),
    ("open", ColumnType::Real),
    ("close", ColumnType::Real),
    ("high", ColumnType::Real),
    ("low", ColumnType::Real),
    ("volume", ColumnType::Real),
    ("turnover_amount", ColumnType::Real),
    ("amplitude", ColumnType::Real),
    ("pct_change", ColumnType::Real),
    ("change", ColumnType::Real),
    ("turnover_rate", ColumnType::Real),
];

pub const DAILY_BAR_KEY: [&str; 2] = ["date", "code"];

/// Expected shape of the single table in the store.
///
/// Immutable once built; a non-conformant live table is replaced wholesale,
/// never altered.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    table: String,
    columns: Vec<Column>,
    primary_key: Vec<String>,
}

impl Schema {
    pub fn new(
        table: impl Into<String>,
        columns: Vec<Column>,
        primary_key: Vec<String>,
    ) -> Result<Self> {
        let table = table.into();
        if table.trim().is_empty() {
            return Err(AppError::InvalidSchema("table name is empty".to_string()));
        }
        if columns.is_empty() {
            return Err(AppError::InvalidSchema(format!("table '{table}' has no columns")));
        }
        let mut seen = HashSet::new();
        for c in &columns {
            if !seen.insert(c.name.as_str()) {
                return Err(AppError::InvalidSchema(format!("duplicate column '{}'", c.name)));
            }
        }
        if primary_key.is_empty() {
            return Err(AppError::InvalidSchema(format!("table '{table}' has no primary key")));
        }
        for k in &primary_key {
            if !seen.contains(k.as_str()) {
                return Err(AppError::InvalidSchema(format!(
                    "primary key column '{k}' is not a declared column"
                )));
            }
        }
        Ok(Self { table, columns, primary_key })
    }

    /// The standard daily bar table keyed on `(date, code)`.
    pub fn daily_bars(table: impl Into<String>) -> Result<Self> {
        let columns = DAILY_BAR_COLUMNS
            .iter()
            .map(|(name, ty)| Column { name: name.to_string(), ty: *ty })
            .collect();
        let key = DAILY_BAR_KEY.iter().map(|k| k.to_string()).collect();
        Self::new(table, columns, key)
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn columns(&self) -> &[Column] {
        &self.columns
    }

    pub fn primary_key(&self) -> &[String] {
        &self.primary_key
    }

    pub fn is_key(&self, column: &str) -> bool {
        self.primary_key.iter().any(|k| k == column)
    }

    /// Column names sorted, for order-insensitive comparison with the live table.
    pub fn sorted_column_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.columns.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        names
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }

    /// `CREATE TABLE IF NOT EXISTS` with every key column declared NOT NULL.
    pub fn create_table_sql(&self) -> String {
        let mut defs: Vec<String> = self
            .columns
            .iter()
            .map(|c| {
                let not_null = if self.is_key(&c.name) { " NOT NULL" } else { "" };
                format!("{} {}{}", quote_ident(&c.name), c.ty.as_sql(), not_null)
            })
            .collect();
        let key = self
            .primary_key
            .iter()
            .map(|k| quote_ident(k))
            .collect::<Vec<_>>()
            .join(", ");
        defs.push(format!("PRIMARY KEY ({key})"));
        format!(
            "CREATE TABLE IF NOT EXISTS {} (\n    {}\n)",
            quote_ident(&self.table),
            defs.join(",\n    ")
        )
    }
}

/// Where the store lives and what it must look like.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub path: PathBuf,
    pub schema: Schema,
}

impl StoreConfig {
    pub fn new(path: impl Into<PathBuf>, schema: Schema) -> Self {
        Self { path: path.into(), schema }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Double-quote an SQL identifier.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}
