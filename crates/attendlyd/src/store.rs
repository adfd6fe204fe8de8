//! SQLite persistence for enrolled identities and attendance records.

use attendly_core::sink::DateRange;
use attendly_core::{
    AttendanceRecord, AttendanceStatus, Embedding, EventSink, Identity, SinkError,
};
use chrono::{NaiveDate, NaiveTime};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.f";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("database error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("corrupt encoding for {identity_id}: {reason}")]
    CorruptEncoding { identity_id: String, reason: String },
    #[error("store lock poisoned")]
    Poisoned,
}

impl From<StoreError> for SinkError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::Sqlite(rusqlite::Error::SqliteFailure(e, _))
                if matches!(
                    e.code,
                    rusqlite::ErrorCode::DatabaseBusy | rusqlite::ErrorCode::DatabaseLocked
                ) =>
            {
                SinkError::Unavailable(err.to_string())
            }
            _ => SinkError::Storage(err.to_string()),
        }
    }
}

/// Shared handle to the attendance database. Clones use the same connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open (or create) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;
             PRAGMA synchronous=NORMAL;
             PRAGMA foreign_keys=ON;",
        )?;
        let store = Self::from_connection(conn)?;
        tracing::info!(path = %path.display(), "database opened");
        Ok(store)
    }

    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        Self::from_connection(conn)
    }

    fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        let store = Self { conn: Arc::new(Mutex::new(conn)) };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        self.conn()?.execute_batch(
            "CREATE TABLE IF NOT EXISTS identities (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                created_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS face_encodings (
                identity_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                encoding BLOB NOT NULL,
                PRIMARY KEY (identity_id, position)
            );
            CREATE TABLE IF NOT EXISTS attendance (
                identity_id TEXT NOT NULL,
                date TEXT NOT NULL,
                time_in TEXT NOT NULL,
                time_out TEXT,
                status TEXT NOT NULL,
                UNIQUE (identity_id, date)
            );
            CREATE INDEX IF NOT EXISTS idx_attendance_date ON attendance(date);",
        )?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    /// Persist a newly enrolled identity with its reference embeddings.
    pub fn save_identity(&self, identity: &Identity) -> Result<(), StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO identities (id, name, created_at) VALUES (?1, ?2, ?3)",
            params![identity.id, identity.name, chrono::Utc::now().to_rfc3339()],
        )?;
        for (position, embedding) in identity.references.iter().enumerate() {
            tx.execute(
                "INSERT INTO face_encodings (identity_id, position, encoding) VALUES (?1, ?2, ?3)",
                params![identity.id, position as i64, encode_embedding(embedding)],
            )?;
        }
        tx.commit()?;
        tracing::debug!(identity = %identity.id, references = identity.references.len(), "identity saved");
        Ok(())
    }

    /// Delete an identity and its encodings. Attendance history is kept.
    /// Returns false if no such identity was stored.
    pub fn delete_identity(&self, identity_id: &str) -> Result<bool, StoreError> {
        let conn = self.conn()?;
        let deleted = conn.execute("DELETE FROM identities WHERE id = ?1", params![identity_id])?;
        Ok(deleted > 0)
    }

    /// Every stored identity, oldest enrollment first.
    pub fn load_identities(&self) -> Result<Vec<Identity>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name FROM identities ORDER BY created_at, id")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))?
            .collect::<Result<Vec<_>, _>>()?;

        let mut enc_stmt =
            conn.prepare("SELECT encoding FROM face_encodings WHERE identity_id = ?1 ORDER BY position")?;
        let mut identities = Vec::with_capacity(rows.len());
        for (id, name) in rows {
            let blobs = enc_stmt
                .query_map(params![id], |row| row.get::<_, Vec<u8>>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            let references = blobs
                .iter()
                .map(|blob| decode_embedding(&id, blob))
                .collect::<Result<Vec<_>, _>>()?;
            identities.push(Identity { id, name, references });
        }
        Ok(identities)
    }

    /// The stored record for one identity on one date, if any.
    #[cfg(test)]
    pub fn attendance_on(&self, identity_id: &str, date: NaiveDate) -> Result<Option<AttendanceRecord>, StoreError> {
        use rusqlite::OptionalExtension;
        let conn = self.conn()?;
        let record = conn
            .query_row(
                "SELECT identity_id, date, time_in, time_out, status FROM attendance
                 WHERE identity_id = ?1 AND date = ?2",
                params![identity_id, date.format(DATE_FORMAT).to_string()],
                row_to_record,
            )
            .optional()?;
        Ok(record)
    }
}

impl EventSink for Store {
    fn record(&mut self, record: &AttendanceRecord) -> Result<(), SinkError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO attendance (identity_id, date, time_in, time_out, status)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(identity_id, date) DO UPDATE SET time_out = excluded.time_out",
            params![
                record.identity_id,
                record.date.format(DATE_FORMAT).to_string(),
                record.time_in.format(TIME_FORMAT).to_string(),
                record.time_out.map(|t| t.format(TIME_FORMAT).to_string()),
                record.status.as_str(),
            ],
        )
        .map_err(StoreError::from)?;
        Ok(())
    }

    fn update_time_out(
        &mut self,
        identity_id: &str,
        date: NaiveDate,
        time_out: Option<NaiveTime>,
    ) -> Result<(), SinkError> {
        let conn = self.conn()?;
        let updated = conn
            .execute(
                "UPDATE attendance SET time_out = ?3 WHERE identity_id = ?1 AND date = ?2",
                params![
                    identity_id,
                    date.format(DATE_FORMAT).to_string(),
                    time_out.map(|t| t.format(TIME_FORMAT).to_string()),
                ],
            )
            .map_err(StoreError::from)?;
        if updated == 0 {
            tracing::debug!(identity = identity_id, %date, "time_out update for unknown record");
        }
        Ok(())
    }

    fn query(&mut self, range: DateRange, identity_id: Option<&str>) -> Result<Vec<AttendanceRecord>, SinkError> {
        let conn = self.conn()?;
        let run = || -> Result<Vec<AttendanceRecord>, rusqlite::Error> {
            let mut stmt = conn.prepare(
                "SELECT identity_id, date, time_in, time_out, status FROM attendance
                 WHERE date BETWEEN ?1 AND ?2 AND (?3 IS NULL OR identity_id = ?3)
                 ORDER BY date, time_in, identity_id",
            )?;
            let rows = stmt.query_map(
                params![
                    range.from.format(DATE_FORMAT).to_string(),
                    range.to.format(DATE_FORMAT).to_string(),
                    identity_id,
                ],
                row_to_record,
            )?;
            rows.collect()
        };
        Ok(run().map_err(StoreError::from)?)
    }
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttendanceRecord> {
    let date: String = row.get(1)?;
    let time_in: String = row.get(2)?;
    let time_out: Option<String> = row.get(3)?;
    let status: String = row.get(4)?;
    Ok(AttendanceRecord {
        identity_id: row.get(0)?,
        date: NaiveDate::parse_from_str(&date, DATE_FORMAT).map_err(|e| conversion_error(1, e))?,
        time_in: NaiveTime::parse_from_str(&time_in, TIME_FORMAT).map_err(|e| conversion_error(2, e))?,
        time_out: time_out
            .map(|t| NaiveTime::parse_from_str(&t, TIME_FORMAT))
            .transpose()
            .map_err(|e| conversion_error(3, e))?,
        status: status
            .parse::<AttendanceStatus>()
            .map_err(|e| conversion_error(4, e))?,
    })
}

fn conversion_error(
    column: usize,
    err: impl Into<Box<dyn std::error::Error + Send + Sync>>,
) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(column, rusqlite::types::Type::Text, err.into())
}

/// Little-endian f32 bytes.
fn encode_embedding(embedding: &Embedding) -> Vec<u8> {
    embedding.values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(identity_id: &str, blob: &[u8]) -> Result<Embedding, StoreError> {
    if blob.is_empty() || blob.len() % 4 != 0 {
        return Err(StoreError::CorruptEncoding {
            identity_id: identity_id.to_string(),
            reason: format!("blob length {} is not a positive multiple of 4", blob.len()),
        });
    }
    let values = blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect();
    Ok(Embedding::new(values))
}
