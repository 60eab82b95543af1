use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use super::{strip_nul, CorrelationId, FinishedRecord, NewRecord, RecordStore, StoreError};
use crate::protocol::ParamValue;

const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS queries (
        id          INTEGER PRIMARY KEY AUTOINCREMENT,
        ip          TEXT NOT NULL,
        port        INTEGER NOT NULL,
        protocol    TEXT NOT NULL,
        querytext   TEXT NOT NULL,
        queryresult TEXT,
        errortext   TEXT,
        timestart   TEXT NOT NULL,
        timefinish  TEXT,
        duration_ms INTEGER
    );
    CREATE TABLE IF NOT EXISTS params (
        id       INTEGER PRIMARY KEY AUTOINCREMENT,
        queryid  INTEGER NOT NULL REFERENCES queries(id),
        position INTEGER NOT NULL,
        value    TEXT
    );
    CREATE INDEX IF NOT EXISTS params_queryid ON params(queryid);
";

/// SQLite-backed record store.
pub struct SqliteStore {
    conn: Connection,
}

/// A row of the `queries` table, as read back.
#[derive(Debug, Clone, PartialEq)]
pub struct StoredQuery {
    pub id: CorrelationId,
    pub ip: String,
    pub port: u16,
    pub protocol: String,
    pub query_text: String,
    pub result_text: Option<String>,
    pub error_text: Option<String>,
    pub time_start: DateTime<Utc>,
    pub time_finish: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

impl SqliteStore {
    /// Open (or create) the database at `path`; `:memory:` gives a private in-memory database.
    pub fn open(path: &str) -> Result<Self, StoreError> {
        let conn = if path == ":memory:" {
            Connection::open_in_memory()
        } else {
            Connection::open(path)
        }?;

        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;
        tracing::debug!("record store ready at {}", path);
        Ok(Self { conn })
    }

    /// All recorded queries in creation order.
    pub fn queries(&self) -> Result<Vec<StoredQuery>, StoreError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, ip, port, protocol, querytext, queryresult, errortext,
                    timestart, timefinish, duration_ms
             FROM queries ORDER BY id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(StoredQuery {
                id: row.get(0)?,
                ip: row.get(1)?,
                port: row.get(2)?,
                protocol: row.get(3)?,
                query_text: row.get(4)?,
                result_text: row.get(5)?,
                error_text: row.get(6)?,
                time_start: row.get(7)?,
                time_finish: row.get(8)?,
                duration_ms: row.get(9)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Parameters stored for a query, in position order. NULL parameters come back as `None`.
    pub fn parameters(&self, id: CorrelationId) -> Result<Vec<Option<String>>, StoreError> {
        let mut stmt = self
            .conn
            .prepare("SELECT value FROM params WHERE queryid = ?1 ORDER BY position")?;
        let rows = stmt.query_map([id], |row| row.get::<_, Option<String>>(0))?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    fn exists(&self, id: CorrelationId) -> Result<bool, StoreError> {
        let found = self
            .conn
            .query_row("SELECT 1 FROM queries WHERE id = ?1", [id], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }
}

impl RecordStore for SqliteStore {
    fn create_record(&mut self, record: &NewRecord) -> Result<CorrelationId, StoreError> {
        self.conn.execute(
            "INSERT INTO queries (ip, port, protocol, querytext, timestart) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                record.endpoint.ip().to_string(),
                record.endpoint.port(),
                record.protocol.as_str(),
                strip_nul(&record.query_text).into_owned(),
                record.time_start,
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn store_parameters(&mut self, id: CorrelationId, params: &[ParamValue]) -> Result<(), StoreError> {
        if !self.exists(id)? {
            return Err(StoreError::UnknownRecord(id));
        }
        let tx = self.conn.transaction()?;
        {
            let mut stmt = tx.prepare("INSERT INTO params (queryid, position, value) VALUES (?1, ?2, ?3)")?;
            for (position, param) in params.iter().enumerate() {
                let value = param.to_text().map(|text| strip_nul(&text).into_owned());
                stmt.execute(params![id, position as i64, value])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn finish_record(&mut self, id: CorrelationId, outcome: &FinishedRecord) -> Result<(), StoreError> {
        let updated = self.conn.execute(
            "UPDATE queries SET queryresult = ?1, errortext = ?2, timefinish = ?3, duration_ms = ?4 WHERE id = ?5",
            params![
                strip_nul(&outcome.result_text).into_owned(),
                strip_nul(&outcome.error_text).into_owned(),
                outcome.time_finish,
                outcome.duration_ms,
                id,
            ],
        )?;
        if updated == 0 {
            return Err(StoreError::UnknownRecord(id));
        }
        Ok(())
    }
}
