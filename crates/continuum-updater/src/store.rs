//! SQLite-backed durable state.
//!
//! Two tables are used by the pipeline:
//!
//! - `package_cache`: one installation record per (package type, supplier,
//!   name). Only [`InstallationStore::mark_installed`] sets `installed`.
//! - `tree_updates`: the transparency log, keyed by Merkle root. It is
//!   written by external tooling and only read here.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::UpdateError;
use crate::package::{PackageIdentity, PackageKind};
use crate::transparency::{LogEntry, LogPayload, TransparencyLog};

/// Current schema version for migrations.
const SCHEMA_VERSION: i32 = 1;

/// Installation state of one unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallationRecord {
    pub identity: PackageIdentity,
    pub installed: bool,
    pub current_version: Option<String>,
}

/// Durable installation state.
#[async_trait]
pub trait InstallationStore: Send + Sync {
    /// Fetch the record for `identity`, if any.
    async fn record(
        &self,
        identity: &PackageIdentity,
    ) -> Result<Option<InstallationRecord>, UpdateError>;

    /// Atomically mark `identity` installed at `version`.
    ///
    /// Calling this twice with the same arguments leaves exactly one row.
    ///
    /// # Errors
    ///
    /// Returns `UpdateError::CommitFailed` if the transaction does not commit.
    async fn mark_installed(
        &self,
        identity: &PackageIdentity,
        version: &str,
    ) -> Result<(), UpdateError>;

    /// Make sure an inventory row exists for a unit found on disk.
    /// Existing rows are left untouched.
    async fn register(
        &self,
        identity: &PackageIdentity,
        version: Option<&str>,
    ) -> Result<(), UpdateError>;
}

/// SQLite store for installation records and the transparency log.
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and run migrations.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, UpdateError> {
        if let Some(parent) = path.as_ref().parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path).map_err(|e| {
            UpdateError::StorageError(format!("failed to open database: {}", e))
        })?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")
            .map_err(|e| UpdateError::StorageError(format!("failed to set pragmas: {}", e)))?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    pub fn new_in_memory() -> Result<Self, UpdateError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            UpdateError::StorageError(format!("failed to open in-memory database: {}", e))
        })?;

        Self::run_migrations(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), UpdateError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            )",
            [],
        )?;

        let current_version: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

        if current_version < 1 {
            Self::migrate_v1(conn)?;
        }

        debug!("Database schema at version {}", SCHEMA_VERSION);
        Ok(())
    }

    /// Migration to schema version 1 - initial schema.
    fn migrate_v1(conn: &Connection) -> Result<(), UpdateError> {
        conn.execute_batch(
            r#"
            -- Installation state
            CREATE TABLE IF NOT EXISTS package_cache (
                package_type TEXT NOT NULL,
                supplier TEXT NOT NULL,
                name TEXT NOT NULL,
                installed INTEGER NOT NULL DEFAULT 0,
                current_version TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (package_type, supplier, name)
            );

            -- Transparency log
            CREATE TABLE IF NOT EXISTS tree_updates (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                merkle_root TEXT NOT NULL,
                data TEXT NOT NULL,
                created TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_tree_updates_root ON tree_updates(merkle_root);

            INSERT INTO schema_version (version) VALUES (1);
            "#,
        )?;
        Ok(())
    }

    /// Append a transparency log entry.
    ///
    /// The pipeline never calls this; it exists for the external log writer
    /// and for fixtures.
    pub async fn append_tree_update(
        &self,
        merkle_root: &str,
        payload: &LogPayload,
    ) -> Result<(), UpdateError> {
        let data = serde_json::to_string(payload)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tree_updates (merkle_root, data, created) VALUES (?1, ?2, ?3)",
            params![merkle_root, data, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// All installation records, ordered by type, supplier, and name.
    pub async fn list_records(&self) -> Result<Vec<InstallationRecord>, UpdateError> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT package_type, supplier, name, installed, current_version
             FROM package_cache ORDER BY package_type, supplier, name",
        )?;
        let rows = stmt.query_map([], row_to_raw)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(raw_to_record(row?)?);
        }
        Ok(records)
    }
}

type RawRecord = (String, String, String, bool, Option<String>);

fn row_to_raw(row: &rusqlite::Row) -> rusqlite::Result<RawRecord> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?))
}

fn raw_to_record(raw: RawRecord) -> Result<InstallationRecord, UpdateError> {
    let (kind, supplier, name, installed, current_version) = raw;
    let kind: PackageKind = kind
        .parse()
        .map_err(|_| UpdateError::StorageError(format!("unknown package type in store: {}", kind)))?;
    Ok(InstallationRecord {
        identity: PackageIdentity::new(kind, supplier, name),
        installed,
        current_version,
    })
}

#[async_trait]
impl InstallationStore for SqliteStore {
    async fn record(
        &self,
        identity: &PackageIdentity,
    ) -> Result<Option<InstallationRecord>, UpdateError> {
        let conn = self.conn.lock().await;
        let raw = conn
            .query_row(
                "SELECT package_type, supplier, name, installed, current_version
                 FROM package_cache
                 WHERE package_type = ?1 AND supplier = ?2 AND name = ?3",
                params![identity.kind.as_str(), identity.supplier, identity.name],
                row_to_raw,
            )
            .optional()?;
        raw.map(raw_to_record).transpose()
    }

    async fn mark_installed(
        &self,
        identity: &PackageIdentity,
        version: &str,
    ) -> Result<(), UpdateError> {
        let commit_failed = |e: rusqlite::Error| UpdateError::CommitFailed(e.to_string());

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction().map_err(commit_failed)?;
        tx.execute(
            "INSERT INTO package_cache
                (package_type, supplier, name, installed, current_version, updated_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)
             ON CONFLICT (package_type, supplier, name) DO UPDATE SET
                installed = 1,
                current_version = excluded.current_version,
                updated_at = excluded.updated_at",
            params![
                identity.kind.as_str(),
                identity.supplier,
                identity.name,
                version,
                Utc::now().to_rfc3339()
            ],
        )
        .map_err(commit_failed)?;
        tx.commit().map_err(commit_failed)?;

        debug!(package = %identity, version, "Marked package installed");
        Ok(())
    }

    async fn register(
        &self,
        identity: &PackageIdentity,
        version: Option<&str>,
    ) -> Result<(), UpdateError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO package_cache
                (package_type, supplier, name, installed, current_version, updated_at)
             VALUES (?1, ?2, ?3, 0, ?4, ?5)
             ON CONFLICT (package_type, supplier, name) DO NOTHING",
            params![
                identity.kind.as_str(),
                identity.supplier,
                identity.name,
                version,
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }
}

#[async_trait]
impl TransparencyLog for SqliteStore {
    async fn lookup(&self, merkle_root: &str) -> Result<Option<LogEntry>, UpdateError> {
        let conn = self.conn.lock().await;
        let row: Option<(String, String)> = conn
            .query_row(
                "SELECT data, created FROM tree_updates
                 WHERE merkle_root = ?1 ORDER BY id DESC LIMIT 1",
                params![merkle_root],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let Some((data, created)) = row else {
            return Ok(None);
        };

        let payload: LogPayload = serde_json::from_str(&data).map_err(|e| {
            UpdateError::StorageError(format!("malformed transparency log payload: {}", e))
        })?;
        let recorded_at = DateTime::parse_from_rfc3339(&created)
            .map_err(|e| UpdateError::StorageError(format!("malformed log timestamp: {}", e)))?
            .with_timezone(&Utc);

        Ok(Some(LogEntry {
            merkle_root: merkle_root.to_string(),
            payload,
            recorded_at,
        }))
    }
}
