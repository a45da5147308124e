//! Durable function registry backed by SQLite.
//!
//! Connections are opened per operation so a transient open failure in one
//! poll cycle never poisons the next; the compile driver and the syncer share
//! this access pattern.

use std::path::{Path, PathBuf};

use rusqlite::Connection;
use thiserror::Error;

/// Table the serving plane reads and the compile driver writes.
pub const TABLE: &str = "functions";

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("registry open failed: {0}")]
    Open(#[source] rusqlite::Error),
    #[error("registry query failed: {0}")]
    Query(#[source] rusqlite::Error),
}

/// One synced row: route key, descriptor JSON, and the store-assigned
/// unix-second update stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryRow {
    pub key: String,
    pub value: String,
    pub updated: i64,
}

#[derive(Debug, Clone)]
pub struct Registry {
    path: PathBuf,
}

impl Registry {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<Connection, RegistryError> {
        Connection::open(&self.path).map_err(RegistryError::Open)
    }

    /// Create the `functions` table if this is a fresh database.
    pub fn ensure_schema(&self) -> Result<(), RegistryError> {
        let conn = self.open()?;
        conn.execute(
            &format!("CREATE TABLE IF NOT EXISTS {TABLE} (k TEXT PRIMARY KEY, v TEXT, updated INTEGER)"),
            [],
        )
        .map_err(RegistryError::Query)?;
        Ok(())
    }

    /// Full scan, for syncer initialization.
    pub fn scan(&self) -> Result<Vec<RegistryRow>, RegistryError> {
        self.select(&format!("SELECT k, v, updated FROM {TABLE}"), [])
    }

    /// Rows written after `high_water`, the syncer's incremental query.
    pub fn changed_since(&self, high_water: i64) -> Result<Vec<RegistryRow>, RegistryError> {
        self.select(
            &format!("SELECT k, v, updated FROM {TABLE} WHERE updated > ?1"),
            [high_water],
        )
    }

    fn select(
        &self,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<RegistryRow>, RegistryError> {
        let conn = self.open()?;
        let mut stmt = conn.prepare(sql).map_err(RegistryError::Query)?;
        let rows = stmt
            .query_map(params, |row| {
                Ok(RegistryRow {
                    key: row.get(0)?,
                    value: row.get(1)?,
                    updated: row.get(2)?,
                })
            })
            .map_err(RegistryError::Query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(RegistryError::Query)?;
        Ok(rows)
    }

    /// Insert or replace a row, stamping `updated` with the store's clock.
    pub fn upsert(&self, key: &str, value: &str) -> Result<(), RegistryError> {
        let conn = self.open()?;
        conn.execute(
            &format!(
                "INSERT OR REPLACE INTO {TABLE} (k, v, updated) VALUES (?1, ?2, strftime('%s','now'))"
            ),
            [key, value],
        )
        .map_err(RegistryError::Query)?;
        Ok(())
    }

    /// Insert or replace a row with an explicit stamp. Test seam; the serving
    /// path always stamps with the store clock.
    pub fn upsert_at(&self, key: &str, value: &str, updated: i64) -> Result<(), RegistryError> {
        let conn = self.open()?;
        conn.execute(
            &format!("INSERT OR REPLACE INTO {TABLE} (k, v, updated) VALUES (?1, ?2, ?3)"),
            rusqlite::params![key, value, updated],
        )
        .map_err(RegistryError::Query)?;
        Ok(())
    }
}
