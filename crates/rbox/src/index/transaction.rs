use chrono::{DateTime, Utc};
use log::{debug, info};
use rusqlite::params;

use super::{IndexSync, MailIndex, read_header, write_header};
use crate::error::IndexError;
use crate::models::MailFlags;

/// Durable outcome of an index commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitResult {
    /// First UID assigned; equals `next_uid` when nothing was appended
    pub uid_first: u32,
    pub uid_last: u32,
    pub count: u32,
    /// Header `next_uid` after the commit
    pub next_uid: u32,
    pub highest_modseq: u64,
    /// Transaction log row, absent for empty commits
    pub log_seq: Option<i64>,
}

#[derive(Debug, Clone)]
struct PendingAppend {
    seq: u32,
    flags: MailFlags,
    keywords: Vec<String>,
    min_modseq: u64,
    uid: Option<u32>,
    oid: Option<String>,
    size: u64,
    received: Option<DateTime<Utc>>,
}

/// Appends staged against an index, invisible until committed
pub struct IndexTransaction {
    index: MailIndex,
    appends: Vec<PendingAppend>,
    next_seq: u32,
}

impl IndexTransaction {
    pub(super) fn new(index: MailIndex) -> Self {
        Self {
            index,
            appends: Vec::new(),
            next_seq: 1,
        }
    }

    /// Stage a new record and return its local sequence number
    pub fn append(&mut self, flags: MailFlags, keywords: &[String], min_modseq: u64) -> u32 {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.appends.push(PendingAppend {
            seq,
            flags,
            keywords: keywords.to_vec(),
            min_modseq,
            uid: None,
            oid: None,
            size: 0,
            received: None,
        });
        seq
    }

    /// Drop a staged record
    pub fn cancel_append(&mut self, seq: u32) -> bool {
        let before = self.appends.len();
        self.appends.retain(|a| a.seq != seq);
        self.appends.len() != before
    }

    /// Fill in what is known once the mail data is on disk
    pub fn set_saved(
        &mut self,
        seq: u32,
        oid: Option<String>,
        size: u64,
        received: Option<DateTime<Utc>>,
    ) {
        if let Some(append) = self.appends.iter_mut().find(|a| a.seq == seq) {
            append.oid = oid;
            append.size = size;
            append.received = received;
        }
    }

    pub fn append_count(&self) -> usize {
        self.appends.len()
    }

    /// Assign contiguous UIDs from `next_uid` in sequence order; returns
    /// the assigned range
    pub fn append_finish_uids(&mut self, next_uid: u32) -> Option<(u32, u32)> {
        self.appends.sort_by_key(|a| a.seq);
        for (i, append) in self.appends.iter_mut().enumerate() {
            append.uid = Some(next_uid + i as u32);
        }
        let count = self.appends.len() as u32;
        (count > 0).then(|| (next_uid, next_uid + count - 1))
    }

    pub fn uid_of(&self, seq: u32) -> Option<u32> {
        self.appends
            .iter()
            .find(|a| a.seq == seq)
            .and_then(|a| a.uid)
    }

    /// Write the staged records, the header and a log entry in one SQLite
    /// transaction. `sync` must be the epoch the UIDs were assigned in.
    pub fn commit(self, sync: &mut IndexSync) -> Result<CommitResult, IndexError> {
        let mut conn = self.index.conn();
        let tx = conn.transaction()?;
        let mut header = read_header(&tx)?;
        if header.next_uid != sync.next_uid() {
            return Err(IndexError::Conflict {
                expected: sync.next_uid(),
                found: header.next_uid,
            });
        }

        let uid_first = header.next_uid;
        let mut expected_uid = uid_first;
        let commit_modseq = header.highest_modseq + 1;
        let mut highest_modseq = header.highest_modseq;

        for append in &self.appends {
            if append.uid != Some(expected_uid) {
                return Err(IndexError::UidsNotAssigned);
            }
            let modseq = commit_modseq.max(append.min_modseq);
            highest_modseq = highest_modseq.max(modseq);
            let keywords = serde_json::to_string(&append.keywords)?;
            tx.execute(
                "INSERT INTO mail_records (uid, flags, keywords, modseq, oid, size, received_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
                params![
                    expected_uid,
                    append.flags.bits(),
                    keywords,
                    modseq as i64,
                    append.oid,
                    append.size as i64,
                    append.received.map(|t| t.to_rfc3339())
                ],
            )?;
            expected_uid += 1;
        }

        let count = self.appends.len() as u32;
        let log_seq = if count > 0 {
            header.next_uid = expected_uid;
            header.highest_modseq = highest_modseq;
            write_header(&tx, &header)?;
            tx.execute(
                "INSERT INTO transaction_log (uid_first, uid_last, highest_modseq, committed_at)
                 VALUES (?, ?, ?, ?)",
                params![
                    uid_first,
                    expected_uid - 1,
                    highest_modseq as i64,
                    Utc::now().to_rfc3339()
                ],
            )?;
            Some(tx.last_insert_rowid())
        } else {
            None
        };
        tx.commit()?;

        let result = CommitResult {
            uid_first,
            uid_last: expected_uid.saturating_sub(1),
            count,
            next_uid: header.next_uid,
            highest_modseq: header.highest_modseq,
            log_seq,
        };
        if count > 0 {
            info!(
                "index commit: uids {}..={} modseq {}",
                result.uid_first, result.uid_last, result.highest_modseq
            );
        } else {
            debug!("index commit with no appends");
        }
        sync.set_commit_result(result.clone());
        Ok(result)
    }

    /// Discard staged records
    pub fn rollback(self) {
        debug!("index transaction rolled back ({} append(s))", self.appends.len());
    }
}
