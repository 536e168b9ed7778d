//! Database module for ShootSchedule sync
//!
//! Provides SQLite storage for the preference replicas kept on this device.
//! Two independent key/value tables exist: `settings` (primary slot) and
//! `settings_backup` (backup slot). Values are stored as JSON text.

use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;

// Connection pooling
use r2d2::{Pool, PooledConnection};
use r2d2_sqlite::SqliteConnectionManager;

/// Current schema version, tracked through `PRAGMA user_version`
const SCHEMA_VERSION: i32 = 1;

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS settings (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL,
        updated_at TEXT
    );

    CREATE TABLE IF NOT EXISTS settings_backup (
        key TEXT PRIMARY KEY NOT NULL,
        value TEXT NOT NULL,
        updated_at TEXT
    );
"#;

/// Database error types
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("Connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

pub type DbResult<T> = Result<T, DbError>;

/// Storage slot for a key/value pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Slot {
    Primary,
    Backup,
}

impl Slot {
    fn table(&self) -> &'static str {
        match self {
            Slot::Primary => "settings",
            Slot::Backup => "settings_backup",
        }
    }
}

/// Database manager for thread-safe SQLite access
#[derive(Clone)]
pub struct Database {
    pool: Arc<Pool<SqliteConnectionManager>>,
}

impl Database {
    /// Create a new database connection pool backed by a file
    pub fn new(db_path: PathBuf) -> DbResult<Self> {
        let manager = SqliteConnectionManager::file(&db_path);

        let pool = Pool::builder()
            .max_size(4)
            .min_idle(Some(1))
            .connection_timeout(std::time::Duration::from_secs(10))
            .test_on_check_out(false)
            .build(manager)?;

        let conn = pool.get()?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
        "#,
        )?;
        Self::run_migrations(&conn)?;
        drop(conn);

        log::debug!("Opened settings database at {:?}", db_path);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    /// Create an in-memory database (for testing)
    ///
    /// Every pooled SQLite `:memory:` connection is its own database, so the
    /// pool is capped at a single connection to share the schema.
    pub fn in_memory() -> DbResult<Self> {
        let manager = SqliteConnectionManager::memory();

        let pool = Pool::builder().max_size(1).build(manager)?;

        let conn = pool.get()?;
        Self::run_migrations(&conn)?;
        drop(conn);

        Ok(Self {
            pool: Arc::new(pool),
        })
    }

    fn get_conn(&self) -> DbResult<PooledConnection<SqliteConnectionManager>> {
        Ok(self.pool.get()?)
    }

    fn run_migrations(conn: &Connection) -> DbResult<()> {
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        if version < SCHEMA_VERSION {
            conn.execute_batch(SCHEMA)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", SCHEMA_VERSION))?;
            log::info!("Settings schema initialized at v{}", SCHEMA_VERSION);
        }

        Ok(())
    }

    // =========================================================================
    // SETTINGS
    // =========================================================================

    /// Get the raw JSON text stored under `key`
    pub fn get_raw_setting(&self, slot: Slot, key: &str) -> DbResult<Option<String>> {
        let conn = self.get_conn()?;
        let value = conn
            .query_row(
                &format!("SELECT value FROM {} WHERE key = ?1", slot.table()),
                [key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    /// Store raw text under `key`, replacing any previous value
    pub fn set_raw_setting(&self, slot: Slot, key: &str, value: &str) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {} (key, value, updated_at) VALUES (?1, ?2, ?3)",
                slot.table()
            ),
            params![key, value, chrono::Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Get a setting value
    ///
    /// A stored value that does not decode as `T` is an error; callers that
    /// treat unreadable data as absence map it themselves.
    pub fn get_setting<T: serde::de::DeserializeOwned>(
        &self,
        slot: Slot,
        key: &str,
    ) -> DbResult<Option<T>> {
        match self.get_raw_setting(slot, key)? {
            Some(json) => {
                let value: T = serde_json::from_str(&json)
                    .map_err(|e| DbError::Serialization(e.to_string()))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    /// Set a setting value
    pub fn set_setting<T: Serialize>(&self, slot: Slot, key: &str, value: &T) -> DbResult<()> {
        let json =
            serde_json::to_string(value).map_err(|e| DbError::Serialization(e.to_string()))?;
        self.set_raw_setting(slot, key, &json)
    }

    /// Delete a setting, returning whether a row was removed
    pub fn delete_setting(&self, slot: Slot, key: &str) -> DbResult<bool> {
        let conn = self.get_conn()?;
        let removed = conn.execute(
            &format!("DELETE FROM {} WHERE key = ?1", slot.table()),
            [key],
        )?;
        Ok(removed > 0)
    }

    /// Remove every key from a slot
    pub fn clear_slot(&self, slot: Slot) -> DbResult<()> {
        let conn = self.get_conn()?;
        conn.execute(&format!("DELETE FROM {}", slot.table()), [])?;
        Ok(())
    }
}
