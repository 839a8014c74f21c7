//! Local mailbox index and transaction log
//!
//! SQLite holds the mailbox header, one record per committed mail and an
//! append-only log of committed transactions. Writers serialise through the
//! sync lock ([`MailIndex::sync_begin`]); readers never take it.

mod sync;
mod transaction;

use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use rusqlite::types::Type;
use rusqlite::{Connection, OptionalExtension, Row, params};
use rusqlite_migration::{M, Migrations};

use crate::error::IndexError;
use crate::models::{MailFlags, MailRecord, MailboxGuid, MailboxHeader};

pub use sync::IndexSync;
pub use transaction::{CommitResult, IndexTransaction};

/// Database migrations
fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        r#"
        -- Single-row mailbox header
        CREATE TABLE mailbox_header (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            uid_validity INTEGER NOT NULL,
            next_uid INTEGER NOT NULL,
            highest_modseq INTEGER NOT NULL,
            guid BLOB NOT NULL,
            rebuild_count INTEGER NOT NULL
        );

        INSERT INTO mailbox_header
            (id, uid_validity, next_uid, highest_modseq, guid, rebuild_count)
        VALUES (1, 0, 1, 0, zeroblob(16), 0);

        CREATE TABLE mail_records (
            uid INTEGER PRIMARY KEY,
            flags INTEGER NOT NULL,
            keywords TEXT NOT NULL DEFAULT '[]',
            modseq INTEGER NOT NULL,
            oid TEXT,
            size INTEGER NOT NULL,
            received_at TEXT
        );

        CREATE INDEX idx_mail_records_oid ON mail_records(oid);

        -- One row per committed transaction
        CREATE TABLE transaction_log (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            uid_first INTEGER NOT NULL,
            uid_last INTEGER NOT NULL,
            highest_modseq INTEGER NOT NULL,
            committed_at TEXT NOT NULL
        );
        "#,
    )])
}

/// One committed transaction in the log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub seq: i64,
    pub uid_first: u32,
    pub uid_last: u32,
    pub highest_modseq: u64,
    pub committed_at: DateTime<Utc>,
}

struct IndexInner {
    conn: Mutex<Connection>,
    sync_locked: Mutex<bool>,
    sync_released: Condvar,
}

/// Handle to a mailbox index; clones share the database and the sync lock
#[derive(Clone)]
pub struct MailIndex {
    inner: Arc<IndexInner>,
}

fn read_header(conn: &Connection) -> Result<MailboxHeader, IndexError> {
    let (uid_validity, next_uid, highest_modseq, guid, rebuild_count): (u32, u32, i64, Vec<u8>, u32) =
        conn.query_row(
            "SELECT uid_validity, next_uid, highest_modseq, guid, rebuild_count
             FROM mailbox_header WHERE id = 1",
            [],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?)),
        )?;
    let guid = MailboxGuid::from_slice(&guid)
        .ok_or_else(|| IndexError::CorruptHeader(format!("guid is {} bytes", guid.len())))?;

    Ok(MailboxHeader {
        uid_validity,
        next_uid,
        highest_modseq: highest_modseq as u64,
        guid,
        rebuild_count,
    })
}

fn write_header(conn: &Connection, header: &MailboxHeader) -> Result<(), IndexError> {
    conn.execute(
        "UPDATE mailbox_header
         SET uid_validity = ?, next_uid = ?, highest_modseq = ?, guid = ?, rebuild_count = ?
         WHERE id = 1",
        params![
            header.uid_validity,
            header.next_uid,
            header.highest_modseq as i64,
            header.guid.as_bytes().as_slice(),
            header.rebuild_count
        ],
    )?;
    Ok(())
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|t| t.with_timezone(&Utc))
}

fn record_from_row(row: &Row<'_>) -> rusqlite::Result<MailRecord> {
    let keywords: String = row.get(2)?;
    Ok(MailRecord {
        uid: row.get(0)?,
        flags: MailFlags::from_bits_truncate(row.get(1)?),
        keywords: serde_json::from_str(&keywords)
            .map_err(|err| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, Box::new(err)))?,
        modseq: row.get::<_, i64>(3)? as u64,
        oid: row.get(4)?,
        size: row.get::<_, i64>(5)? as u64,
        received: parse_time(row.get(6)?),
    })
}

impl MailIndex {
    /// Open or create the index database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self, IndexError> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        debug!("opened index {}", path.as_ref().display());
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, IndexError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(mut conn: Connection) -> Result<Self, IndexError> {
        migrations().to_latest(&mut conn)?;
        Ok(Self {
            inner: Arc::new(IndexInner {
                conn: Mutex::new(conn),
                sync_locked: Mutex::new(false),
                sync_released: Condvar::new(),
            }),
        })
    }

    pub(crate) fn conn(&self) -> MutexGuard<'_, Connection> {
        self.inner.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn header(&self) -> Result<MailboxHeader, IndexError> {
        read_header(&self.conn())
    }

    /// Overwrite the header. Callers changing `next_uid` must hold the
    /// sync lock.
    pub fn update_header(&self, header: &MailboxHeader) -> Result<(), IndexError> {
        write_header(&self.conn(), header)
    }

    /// Fill in a missing GUID and UID validity, as on first open
    pub fn ensure_header(&self) -> Result<MailboxHeader, IndexError> {
        let conn = self.conn();
        let mut header = read_header(&conn)?;
        let mut changed = false;

        if header.guid.is_empty() {
            header.guid = MailboxGuid::generate();
            changed = true;
        }
        if header.uid_validity == 0 {
            header.uid_validity = Utc::now().timestamp().max(1) as u32;
            changed = true;
        }
        if changed {
            write_header(&conn, &header)?;
            info!(
                "initialised mailbox header: guid {}, uid_validity {}",
                header.guid, header.uid_validity
            );
        }
        Ok(header)
    }

    /// Record that the mailbox had to be rebuilt
    pub fn mark_corrupted(&self) -> Result<u32, IndexError> {
        let conn = self.conn();
        let mut header = read_header(&conn)?;
        header.rebuild_count += 1;
        write_header(&conn, &header)?;
        warn!("mailbox marked corrupted, rebuild count {}", header.rebuild_count);
        Ok(header.rebuild_count)
    }

    pub fn message_count(&self) -> Result<u32, IndexError> {
        Ok(self
            .conn()
            .query_row("SELECT COUNT(*) FROM mail_records", [], |row| row.get(0))?)
    }

    /// All records in UID order
    pub fn records(&self) -> Result<Vec<MailRecord>, IndexError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT uid, flags, keywords, modseq, oid, size, received_at
             FROM mail_records ORDER BY uid",
        )?;
        let records = stmt
            .query_map([], record_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(records)
    }

    pub fn record(&self, uid: u32) -> Result<Option<MailRecord>, IndexError> {
        Ok(self
            .conn()
            .query_row(
                "SELECT uid, flags, keywords, modseq, oid, size, received_at
                 FROM mail_records WHERE uid = ?",
                [uid],
                record_from_row,
            )
            .optional()?)
    }

    /// Committed transactions, oldest first
    pub fn log_entries(&self) -> Result<Vec<LogEntry>, IndexError> {
        let conn = self.conn();
        let mut stmt = conn.prepare(
            "SELECT seq, uid_first, uid_last, highest_modseq, committed_at
             FROM transaction_log ORDER BY seq",
        )?;
        let entries = stmt
            .query_map([], |row| {
                Ok(LogEntry {
                    seq: row.get(0)?,
                    uid_first: row.get(1)?,
                    uid_last: row.get(2)?,
                    highest_modseq: row.get::<_, i64>(3)? as u64,
                    committed_at: parse_time(row.get(4)?).unwrap_or_default(),
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(entries)
    }

    pub fn transaction_begin(&self) -> IndexTransaction {
        IndexTransaction::new(self.clone())
    }

    /// Take the sync lock, blocking while another writer holds it
    pub fn sync_begin(&self) -> Result<IndexSync, IndexError> {
        {
            let mut locked = self
                .inner
                .sync_locked
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            while *locked {
                locked = self
                    .inner
                    .sync_released
                    .wait(locked)
                    .unwrap_or_else(PoisonError::into_inner);
            }
            *locked = true;
        }

        match self.header() {
            Ok(header) => Ok(IndexSync::new(self.clone(), header)),
            Err(err) => {
                self.release_sync();
                Err(err)
            }
        }
    }

    /// Whether a writer currently holds the sync lock
    pub fn is_sync_locked(&self) -> bool {
        *self
            .inner
            .sync_locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn release_sync(&self) {
        let mut locked = self
            .inner
            .sync_locked
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *locked = false;
        self.inner.sync_released.notify_one();
    }
}
