//! Main store implementation.

use std::io::Write;
use std::path::Path;

use rusqlite::Connection;
use serde::Serialize;
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tracing::{debug, info};

use pulse_types::StoredHeartRate;

use crate::error::{Error, Result};
use crate::schema;

/// SQLite-based store for heart-rate readings.
pub struct Store {
    conn: Connection,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store")
            .field("path", &self.conn.path())
            .finish()
    }
}

/// One row of a CSV export.
#[derive(Serialize)]
struct CsvRow {
    value: u16,
    timestamp_ms: i64,
    captured_at: String,
}

impl Store {
    /// Open or create a database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
            && !parent.exists()
        {
            std::fs::create_dir_all(parent).map_err(|e| Error::CreateDirectory {
                path: parent.to_path_buf(),
                source: e,
            })?;
        }

        info!("Opening database at {}", path.display());
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;",
        )?;

        schema::initialize(&conn)?;

        Ok(Self { conn })
    }

    /// Open the default database location.
    pub fn open_default() -> Result<Self> {
        Self::open(crate::default_db_path())
    }

    /// Open an in-memory database (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::initialize(&conn)?;
        Ok(Self { conn })
    }

    /// Store one reading and return its row id.
    pub fn insert(&self, value: u16, timestamp_ms: i64) -> Result<i64> {
        self.conn.execute(
            "INSERT INTO heart_rate (value, timestamp_ms) VALUES (?1, ?2)",
            rusqlite::params![value, timestamp_ms],
        )?;
        let id = self.conn.last_insert_rowid();
        debug!(id, value, timestamp_ms, "Stored heart rate");
        Ok(id)
    }

    /// Remove every reading and return how many were removed.
    pub fn delete_all(&self) -> Result<usize> {
        let removed = self.conn.execute("DELETE FROM heart_rate", [])?;
        info!("Cleared {} heart-rate readings", removed);
        Ok(removed)
    }

    /// All readings ordered by timestamp, then insertion order.
    pub fn get_all(&self) -> Result<Vec<StoredHeartRate>> {
        let mut stmt = self
            .conn
            .prepare("SELECT value, timestamp_ms FROM heart_rate ORDER BY timestamp_ms, id")?;

        let readings = stmt
            .query_map([], |row| {
                Ok(StoredHeartRate {
                    value: row.get(0)?,
                    timestamp_millis: row.get(1)?,
                })
            })?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(readings)
    }

    /// Number of stored readings.
    pub fn count(&self) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM heart_rate", [], |row| row.get(0))?;
        Ok(count.max(0) as u64)
    }

    /// Write every reading as CSV (`value,timestamp_ms,captured_at`) and
    /// return the number of rows written.
    pub fn export_csv<W: Write>(&self, writer: W) -> Result<usize> {
        let readings = self.get_all()?;
        let mut csv = csv::Writer::from_writer(writer);
        for reading in &readings {
            let captured_at = OffsetDateTime::from_unix_timestamp_nanos(
                i128::from(reading.timestamp_millis) * 1_000_000,
            )
            .ok()
            .and_then(|t| t.format(&Rfc3339).ok())
            .unwrap_or_default();
            csv.serialize(CsvRow {
                value: reading.value,
                timestamp_ms: reading.timestamp_millis,
                captured_at,
            })?;
        }
        csv.flush()?;
        Ok(readings.len())
    }
}
