//! SQLite backend for the connection pool
//!
//! One database file per database name (`<dir>/<db_name>.sqlite3`) and one
//! table per store name, each table a plain `key -> value` map.

use super::pool::{validate_name, Connector, Database};
use crate::error::StorageError;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Opens `<dir>/<db_name>.sqlite3`
#[derive(Debug, Clone)]
pub struct SqliteConnector {
    dir: PathBuf,
}

impl SqliteConnector {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, db_name: &str) -> PathBuf {
        self.dir.join(format!("{db_name}.sqlite3"))
    }
}

impl Connector for SqliteConnector {
    fn open(&self, db_name: &str) -> Result<Arc<dyn Database>, StorageError> {
        validate_name(db_name)?;
        std::fs::create_dir_all(&self.dir)?;

        let started_at = Instant::now();
        let path = self.path_for(db_name);
        let conn = Connection::open(&path).map_err(|err| {
            tracing::error!(db = db_name, path = %path.display(), error = %err, "sqlite open failed");
            err
        })?;
        conn.busy_timeout(Duration::from_secs(5))?;

        tracing::info!(
            db = db_name,
            duration_ms = started_at.elapsed().as_millis() as u64,
            "sqlite database opened"
        );
        Ok(Arc::new(SqliteDatabase {
            conn: Mutex::new(conn),
        }))
    }
}

struct SqliteDatabase {
    conn: Mutex<Connection>,
}

impl SqliteDatabase {
    fn ensure_table(conn: &Connection, store: &str) -> Result<(), StorageError> {
        validate_name(store)?;
        conn.execute_batch(&format!(
            "CREATE TABLE IF NOT EXISTS \"{store}\" (key TEXT PRIMARY KEY NOT NULL, value TEXT NOT NULL);"
        ))?;
        Ok(())
    }
}

impl Database for SqliteDatabase {
    fn get(&self, store: &str, key: &str) -> Result<Option<String>, StorageError> {
        let conn = self.conn.lock();
        Self::ensure_table(&conn, store)?;
        let value = conn
            .query_row(
                &format!("SELECT value FROM \"{store}\" WHERE key = ?1"),
                params![key],
                |row| row.get::<_, String>(0),
            )
            .optional()?;
        Ok(value)
    }

    fn put(&self, store: &str, key: &str, value: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        Self::ensure_table(&conn, store)?;
        conn.execute(
            &format!(
                "INSERT INTO \"{store}\" (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value"
            ),
            params![key, value],
        )?;
        Ok(())
    }

    fn delete(&self, store: &str, key: &str) -> Result<(), StorageError> {
        let conn = self.conn.lock();
        Self::ensure_table(&conn, store)?;
        conn.execute(
            &format!("DELETE FROM \"{store}\" WHERE key = ?1"),
            params![key],
        )?;
        Ok(())
    }

    fn keys(&self, store: &str) -> Result<Vec<String>, StorageError> {
        let conn = self.conn.lock();
        Self::ensure_table(&conn, store)?;
        let mut stmt = conn.prepare(&format!("SELECT key FROM \"{store}\" ORDER BY key"))?;
        let keys = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(keys)
    }
}
