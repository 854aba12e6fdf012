//! Embedded key-value database of one application

use rusqlite::{Connection, OptionalExtension, TransactionBehavior};
use std::path::{Path, PathBuf};

use crate::error::StoreError;

const BUSY_TIMEOUT_MS: u32 = 5000;

const SCHEMA: &str = "CREATE TABLE IF NOT EXISTS kv (
    key   TEXT PRIMARY KEY NOT NULL,
    value BLOB NOT NULL
)";

/// Open handle on an application's database
pub struct AppDb {
    conn: Connection,
    path: PathBuf,
}

impl AppDb {
    /// Open the database, creating the file and its directories if needed
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        Self::open_inner(path)
    }

    /// Open the database only if it already exists
    pub fn open_existing(path: &Path) -> Result<Option<Self>, StoreError> {
        if !path.exists() {
            return Ok(None);
        }
        Self::open_inner(path).map(Some)
    }

    fn open_inner(path: &Path) -> Result<Self, StoreError> {
        let open_err = |source| StoreError::Open {
            path: path.to_path_buf(),
            source,
        };
        let conn = Connection::open(path).map_err(open_err)?;
        // A second daemon instance may hold the write lock briefly
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL; PRAGMA busy_timeout={};",
            BUSY_TIMEOUT_MS
        ))
        .map_err(open_err)?;
        conn.execute_batch(SCHEMA).map_err(open_err)?;

        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the current state without a write lock
    pub fn read<T>(
        &self,
        f: impl FnOnce(&Kv<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        f(&Kv { conn: &self.conn })
    }

    /// Run `f` inside an immediate transaction, committing on success
    ///
    /// The write lock is taken up front so a read-modify-write cannot
    /// interleave with another process doing the same.
    pub fn write<T>(
        &mut self,
        f: impl FnOnce(&Kv<'_>) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&Kv { conn: &*tx })?;
        tx.commit()?;
        Ok(out)
    }

    /// Number of unused pages in the database file
    pub fn free_pages(&self) -> Result<u32, StoreError> {
        let count: i64 = self
            .conn
            .query_row("PRAGMA freelist_count", [], |row| row.get(0))?;
        Ok(count.max(0) as u32)
    }

    /// Rewrite the database file, dropping free pages
    pub fn compact(&self) -> Result<(), StoreError> {
        self.conn.execute_batch("VACUUM")?;
        Ok(())
    }

    /// Compact when more than `threshold` pages are free; returns whether it did
    pub fn compact_if_needed(&self, threshold: u32) -> Result<bool, StoreError> {
        let free = self.free_pages()?;
        if free <= threshold {
            return Ok(false);
        }
        tracing::debug!(path = ?self.path, free_pages = free, "Compacting profile database");
        self.compact()?;
        Ok(true)
    }
}

/// Key-value operations over a connection or an open transaction
pub struct Kv<'a> {
    conn: &'a Connection,
}

impl Kv<'_> {
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, StoreError> {
        let value = self
            .conn
            .query_row("SELECT value FROM kv WHERE key = ?1", [key], |row| {
                row.get::<_, Vec<u8>>(0)
            })
            .optional()?;
        Ok(value)
    }

    pub fn put(&self, key: &str, value: &[u8]) -> Result<(), StoreError> {
        self.conn.execute(
            "INSERT INTO kv (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            rusqlite::params![key, value],
        )?;
        Ok(())
    }

    /// Delete a key; returns whether it existed
    pub fn delete(&self, key: &str) -> Result<bool, StoreError> {
        let n = self.conn.execute("DELETE FROM kv WHERE key = ?1", [key])?;
        Ok(n > 0)
    }

    /// All keys in ascending order
    pub fn keys(&self) -> Result<Vec<String>, StoreError> {
        let mut stmt = self.conn.prepare("SELECT key FROM kv ORDER BY key")?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}
