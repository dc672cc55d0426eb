use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;

use sqlx::sqlite::{
    SqliteConnectOptions, SqliteConnection, SqliteJournalMode, SqlitePool, SqlitePoolOptions,
    SqliteRow,
};
use sqlx::{Connection, Row};
use tracing::{debug, info, warn};

use crate::config::STORE_BUSY_TIMEOUT_SECS;
use crate::db::schema::{quote_ident, StoreConfig};
use crate::error::{AppError, Result};

/// SQLITE_NOTADB: the file exists but has no SQLite header.
const SQLITE_NOTADB: &str = "26";

fn is_not_a_database(e: &sqlx::Error) -> bool {
    match e {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(SQLITE_NOTADB),
        _ => false,
    }
}

/// What `init` had to do to leave the store valid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Created,
    AlreadyValid,
    Reset,
}

impl std::fmt::Display for InitOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            InitOutcome::Created => "created",
            InitOutcome::AlreadyValid => "already_valid",
            InitOutcome::Reset => "reset",
        };
        write!(f, "{s}")
    }
}

/// Owns the physical store file and the shape of its table.
///
/// Every operation opens its own short-lived connection so that
/// `delete_store` never races an open handle.
pub struct SchemaManager {
    config: StoreConfig,
}

impl SchemaManager {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }

    /// True iff the store file is present and non-empty.
    pub fn exists(&self) -> bool {
        std::fs::metadata(self.config.path())
            .map(|m| m.is_file() && m.len() > 0)
            .unwrap_or(false)
    }

    fn connect_options(&self) -> SqliteConnectOptions {
        SqliteConnectOptions::new()
            .filename(self.config.path())
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Delete)
            .busy_timeout(Duration::from_secs(STORE_BUSY_TIMEOUT_SECS))
    }

    async fn open_connection(&self) -> Result<SqliteConnection> {
        Ok(SqliteConnection::connect_with(&self.connect_options()).await?)
    }

    /// Create the store and its table. Does not check an existing table.
    pub async fn create_empty(&self) -> Result<()> {
        let mut conn = self.open_connection().await?;
        let schema = &self.config.schema;
        let ddl = schema.create_table_sql();
        debug!(table = %schema.table(), key = ?schema.primary_key(), "{ddl}");
        sqlx::query(&ddl).execute(&mut conn).await?;
        conn.close().await?;
        info!(
            path = %self.config.path().display(),
            table = %schema.table(),
            columns = schema.columns().len(),
            "Store table ready"
        );
        Ok(())
    }

    /// Compare the live table against the configured schema by name set and
    /// declared type (case-insensitive).
    pub async fn validate_schema(&self) -> Result<bool> {
        if !self.exists() {
            return Ok(false);
        }

        let schema = &self.config.schema;
        let rows = match self.table_info().await {
            Ok(rows) => rows,
            Err(AppError::Database(e)) if is_not_a_database(&e) => {
                warn!(path = %self.config.path().display(), "Store file is not a SQLite database");
                return Ok(false);
            }
            Err(e) => return Err(e),
        };

        if rows.is_empty() {
            debug!(table = %schema.table(), "Table missing");
            return Ok(false);
        }

        let mut live: Vec<(String, String)> = Vec::with_capacity(rows.len());
        for row in &rows {
            let name: String = row.try_get("name")?;
            let declared: String = row.try_get("type")?;
            live.push((name, declared));
        }
        live.sort_by(|a, b| a.0.cmp(&b.0));

        let live_names: Vec<&str> = live.iter().map(|(n, _)| n.as_str()).collect();
        let expected = schema.sorted_column_names();
        if live_names != expected {
            warn!(
                table = %schema.table(),
                live = ?live_names,
                expected = ?expected,
                "Column set differs from configured schema"
            );
            return Ok(false);
        }

        for (name, declared) in &live {
            let Some(column) = schema.column(name) else {
                return Ok(false);
            };
            if !column.ty.matches(declared) {
                warn!(
                    table = %schema.table(),
                    column = %name,
                    declared = %declared,
                    expected = column.ty.as_sql(),
                    "Column type differs from configured schema"
                );
                return Ok(false);
            }
        }

        Ok(true)
    }

    async fn table_info(&self) -> Result<Vec<SqliteRow>> {
        let mut conn = self.open_connection().await?;
        let sql = format!("PRAGMA table_info({})", quote_ident(self.config.schema.table()));
        let rows = sqlx::query(&sql).fetch_all(&mut conn).await?;
        conn.close().await?;
        Ok(rows)
    }

    /// Remove the store file and any SQLite sidecar files. Irreversible.
    pub fn delete_store(&self) -> Result<()> {
        let path = self.config.path();
        let mut targets = vec![path.to_path_buf()];
        for suffix in ["-wal", "-shm", "-journal"] {
            let mut p: OsString = path.as_os_str().to_owned();
            p.push(suffix);
            targets.push(PathBuf::from(p));
        }
        for target in targets {
            match std::fs::remove_file(&target) {
                Ok(()) => debug!(path = %target.display(), "Removed"),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        warn!(path = %path.display(), "Store deleted");
        Ok(())
    }

    /// Leave the store in the valid state.
    ///
    /// A non-conformant table is only dropped when `allow_destructive_reset`
    /// is set; otherwise `SchemaMismatch` is returned and nothing is touched.
    pub async fn init(&self, allow_destructive_reset: bool) -> Result<InitOutcome> {
        if !self.exists() {
            self.create_empty().await?;
            return Ok(InitOutcome::Created);
        }

        if self.validate_schema().await? {
            info!(table = %self.config.schema.table(), "Store schema valid");
            return Ok(InitOutcome::AlreadyValid);
        }

        if !allow_destructive_reset {
            return Err(AppError::SchemaMismatch {
                table: self.config.schema.table().to_string(),
            });
        }

        warn!(
            path = %self.config.path().display(),
            table = %self.config.schema.table(),
            "Schema mismatch: dropping store and recreating, stored history is discarded"
        );
        self.delete_store()?;
        self.create_empty().await?;
        Ok(InitOutcome::Reset)
    }

    /// Open the single-writer pool used for the rest of the run.
    pub async fn connect(&self) -> Result<SqlitePool> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(self.connect_options())
            .await?;
        Ok(pool)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::schema::{Column, ColumnType, Schema};
    use crate::test_support::{raw_count, raw_exec, temp_store};

    #[tokio::test]
    async fn missing_and_zero_size_files_do_not_exist() {
        let (_dir, config) = temp_store();
        let manager = SchemaManager::new(config.clone());
        assert!(!manager.exists());

        std::fs::write(config.path(), b"").unwrap();
        assert!(!manager.exists());
        assert!(!manager.validate_schema().await.unwrap());
    }

    #[tokio::test]
    async fn create_then_validate_default_schema() {
        let (_dir, config) = temp_store();
        let manager = SchemaManager::new(config);
        manager.create_empty().await.unwrap();
        assert!(manager.exists());
        assert!(manager.validate_schema().await.unwrap());

        // create is idempotent
        manager.create_empty().await.unwrap();
        assert!(manager.validate_schema().await.unwrap());
    }

    #[tokio::test]
    async fn create_then_validate_custom_schema() {
        let dir = tempfile::tempdir().unwrap();
        let schema = Schema::new(
            "quotes",
            vec![
                Column { name: "ts".into(), ty: ColumnType::Text },
                Column { name: "px".into(), ty: ColumnType::Real },
                Column { name: "venue".into(), ty: ColumnType::Text },
            ],
            vec!["venue".into(), "ts".into()],
        )
        .unwrap();
        let manager = SchemaManager::new(StoreConfig::new(dir.path().join("q.db"), schema));
        manager.create_empty().await.unwrap();
        assert!(manager.validate_schema().await.unwrap());
    }

    #[tokio::test]
    async fn missing_table_is_invalid() {
        let (_dir, config) = temp_store();
        raw_exec(config.path(), "CREATE TABLE other (x TEXT)").await;
        let manager = SchemaManager::new(config);
        assert!(manager.exists());
        assert!(!manager.validate_schema().await.unwrap());
    }

    #[tokio::test]
    async fn missing_column_is_invalid() {
        let (_dir, config) = temp_store();
        raw_exec(
            config.path(),
            "CREATE TABLE stock (date TEXT NOT NULL, code TEXT NOT NULL, name TEXT, \
             open REAL, close REAL, high REAL, low REAL, volume REAL, turnover_amount REAL, \
             amplitude REAL, pct_change REAL, change REAL, PRIMARY KEY (date, code))",
        )
        .await;
        let manager = SchemaManager::new(config);
        assert!(!manager.validate_schema().await.unwrap());
    }

    #[tokio::test]
    async fn type_mismatch_is_invalid() {
        let (_dir, config) = temp_store();
        raw_exec(
            config.path(),
            "CREATE TABLE stock (date TEXT NOT NULL, code TEXT NOT NULL, name TEXT, \
             open REAL, close REAL, high REAL, low REAL, volume INTEGER, turnover_amount REAL, \
             amplitude REAL, pct_change REAL, change REAL, turnover_rate REAL, \
             PRIMARY KEY (date, code))",
        )
        .await;
        let manager = SchemaManager::new(config);
        assert!(!manager.validate_schema().await.unwrap());
    }

    #[tokio::test]
    async fn lowercase_types_still_validate() {
        let (_dir, config) = temp_store();
        raw_exec(
            config.path(),
            "CREATE TABLE stock (turnover_rate real, date text NOT NULL, code text NOT NULL, \
             name text, open real, close real, high real, low real, volume real, \
             turnover_amount real, amplitude real, pct_change real, change real, \
             PRIMARY KEY (date, code))",
        )
        .await;
        let manager = SchemaManager::new(config);
        assert!(manager.validate_schema().await.unwrap());
    }

    #[tokio::test]
    async fn foreign_file_is_invalid_and_reset_replaces_it() {
        let (_dir, config) = temp_store();
        std::fs::write(config.path(), "plain text, not a database\n".repeat(64)).unwrap();
        let manager = SchemaManager::new(config);
        assert!(manager.exists());
        assert!(!manager.validate_schema().await.unwrap());

        let err = manager.init(false).await.unwrap_err();
        assert!(matches!(err, AppError::SchemaMismatch { .. }));
        assert_eq!(manager.init(true).await.unwrap(), InitOutcome::Reset);
        assert!(manager.validate_schema().await.unwrap());
    }

    #[tokio::test]
    async fn init_on_absent_store_creates_it() {
        let (_dir, config) = temp_store();
        let manager = SchemaManager::new(config);
        assert_eq!(manager.init(false).await.unwrap(), InitOutcome::Created);
        assert!(manager.validate_schema().await.unwrap());
        assert_eq!(manager.init(false).await.unwrap(), InitOutcome::AlreadyValid);
    }

    #[tokio::test]
    async fn init_with_reset_discards_invalid_table() {
        let (_dir, config) = temp_store();
        raw_exec(config.path(), "CREATE TABLE stock (date TEXT, code TEXT)").await;
        raw_exec(config.path(), "INSERT INTO stock VALUES ('2024-01-02', '000001')").await;

        let manager = SchemaManager::new(config);
        assert_eq!(manager.init(true).await.unwrap(), InitOutcome::Reset);
        assert!(manager.validate_schema().await.unwrap());

        let pool = manager.connect().await.unwrap();
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM stock")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 0);
        pool.close().await;
    }

    #[tokio::test]
    async fn init_without_reset_refuses_invalid_table() {
        let (_dir, config) = temp_store();
        raw_exec(config.path(), "CREATE TABLE stock (date TEXT, code TEXT)").await;
        raw_exec(config.path(), "INSERT INTO stock VALUES ('2024-01-02', '000001')").await;

        let manager = SchemaManager::new(config.clone());
        let err = manager.init(false).await.unwrap_err();
        assert!(matches!(err, AppError::SchemaMismatch { ref table } if table == "stock"));
        assert_eq!(raw_count(config.path(), "SELECT COUNT(*) FROM stock").await, 1);
    }

    #[tokio::test]
    async fn delete_store_is_idempotent() {
        let (_dir, config) = temp_store();
        let manager = SchemaManager::new(config);
        manager.create_empty().await.unwrap();
        manager.delete_store().unwrap();
        assert!(!manager.exists());
        manager.delete_store().unwrap();
    }
}
