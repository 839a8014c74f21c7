//! One mail-append transaction
//!
//! Each mail is drained into an exclusively created staging file named
//! `<temp prefix>.<n>` and recorded as a pending index append. Commit runs
//! in three steps:
//!
//! 1. [`commit_pre`](SaveTransaction::commit_pre) waits for remote
//!    publishes, takes the index sync lock, assigns UIDs in sequence order
//!    and renames every staging file to `u.<uid>`.
//! 2. [`commit_index`](SaveTransaction::commit_index) makes the records
//!    durable in the index.
//! 3. [`commit_post`](SaveTransaction::commit_post) ends the sync epoch.
//!
//! Any failure on the way rolls the whole transaction back: staged and
//! promoted files are removed, the index appends are dropped and published
//! objects are deleted.

use std::collections::BTreeMap;
use std::fs::{self, File, FileTimes, OpenOptions};
use std::io::{BufWriter, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use uuid::Uuid;

use super::Mailbox;
use super::crlf::CrlfNormalizer;
use crate::cluster::ObjectGateway;
use crate::error::{IndexError, SaveError};
use crate::index::{CommitResult, IndexSync, IndexTransaction};
use crate::models::{MailFlags, MailSaveData, SavedMail};

const READ_CHUNK: usize = 8192;

/// Lifecycle of a [`SaveTransaction`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SaveState {
    /// Nothing saved yet
    Open,
    /// A mail is being drained
    Saving,
    /// At least one mail finished, none in progress
    Flushed,
    /// UIDs assigned and files promoted, sync lock held
    Committing,
    Committed,
    RolledBack,
}

impl SaveState {
    fn name(self) -> &'static str {
        match self {
            SaveState::Open => "open",
            SaveState::Saving => "saving",
            SaveState::Flushed => "flushed",
            SaveState::Committing => "committing",
            SaveState::Committed => "committed",
            SaveState::RolledBack => "rolled back",
        }
    }
}

/// The mail currently being drained
struct CurrentSave<'a> {
    seq: u32,
    path: PathBuf,
    file: BufWriter<File>,
    input: Box<dyn Read + 'a>,
    crlf: CrlfNormalizer,
    size: u64,
    received: Option<DateTime<Utc>>,
    eof: bool,
    failed: Option<SaveError>,
}

impl CurrentSave<'_> {
    fn fail(&mut self, err: SaveError) -> SaveError {
        self.failed = Some(err.clone());
        err
    }

    /// Move what the input has available into the staging file
    fn drain(&mut self) -> Result<(), SaveError> {
        if let Some(err) = &self.failed {
            return Err(err.clone());
        }

        let mut buf = [0u8; READ_CHUNK];
        let mut out = Vec::with_capacity(READ_CHUNK * 2);
        while !self.eof {
            let n = match self.input.read(&mut buf) {
                Ok(0) => {
                    self.eof = true;
                    break;
                }
                Ok(n) => n,
                Err(err) if err.kind() == ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == ErrorKind::WouldBlock => break,
                Err(err) => {
                    let err = SaveError::io("read", &self.path, err);
                    return Err(self.fail(err));
                }
            };
            out.clear();
            self.crlf.push(&buf[..n], &mut out);
            if let Err(err) = self.file.write_all(&out) {
                let err = SaveError::io("write", &self.path, err);
                return Err(self.fail(err));
            }
            self.size += out.len() as u64;
        }
        Ok(())
    }

    /// Flush, fix the mtime and fsync; returns the receive time
    fn finish_file(&mut self, fsync: bool) -> Result<DateTime<Utc>, SaveError> {
        self.file
            .flush()
            .map_err(|err| SaveError::io("write", &self.path, err))?;
        let file = self.file.get_ref();

        let received = match self.received {
            Some(received) => {
                let times = FileTimes::new().set_modified(SystemTime::from(received));
                file.set_times(times)
                    .map_err(|err| SaveError::io("utime", &self.path, err))?;
                received
            }
            None => {
                let modified = file
                    .metadata()
                    .and_then(|meta| meta.modified())
                    .map_err(|err| SaveError::io("stat", &self.path, err))?;
                DateTime::<Utc>::from(modified)
            }
        };

        if fsync {
            file.sync_all()
                .map_err(|err| SaveError::io("fsync", &self.path, err))?;
        }
        Ok(received)
    }
}

/// A finished mail waiting for commit
struct StagedMail {
    seq: u32,
    temp_path: PathBuf,
    final_path: Option<PathBuf>,
    uid: Option<u32>,
    oid: Option<String>,
    size: u64,
}

/// Persist the renames inside `dir`
#[cfg(unix)]
fn sync_dir(dir: &Path) -> Result<(), SaveError> {
    File::open(dir)
        .and_then(|handle| handle.sync_all())
        .map_err(|err| SaveError::io("fsync", dir, err))
}

#[cfg(not(unix))]
fn sync_dir(_dir: &Path) -> Result<(), SaveError> {
    Ok(())
}

fn remove_file_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("removed {}", path.display()),
        Err(err) if err.kind() == ErrorKind::NotFound => {}
        Err(err) => warn!("unlink({}) failed: {err}", path.display()),
    }
}

fn open_staging_file(path: &Path) -> Result<File, SaveError> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o660);
    }
    options.open(path).map_err(|err| {
        if err.kind() == ErrorKind::AlreadyExists {
            SaveError::AlreadyExists {
                path: path.to_path_buf(),
            }
        } else {
            SaveError::io("open", path, err)
        }
    })
}

/// Write a finished mail to the cluster; the write completes in the
/// background and is waited for in `commit_pre`
fn publish(
    gateway: &mut ObjectGateway,
    mailbox: &str,
    path: &Path,
    size: u64,
    received: DateTime<Utc>,
) -> Result<String, SaveError> {
    let data = fs::read(path).map_err(|err| SaveError::io("read", path, err))?;
    let oid = Uuid::new_v4().simple().to_string();
    let xattrs = BTreeMap::from([
        ("guid".to_string(), oid.clone().into_bytes()),
        ("mailbox".to_string(), mailbox.as_bytes().to_vec()),
        (
            "received".to_string(),
            received.timestamp().to_string().into_bytes(),
        ),
        ("size".to_string(), size.to_string().into_bytes()),
    ]);
    gateway.begin_async_write_with_xattrs(&oid, &data, &xattrs);
    Ok(oid)
}

/// Appends a batch of mails to a [`Mailbox`] as one unit
///
/// Either every mail of the batch becomes visible under a contiguous UID
/// range, or none does. Dropping an uncommitted transaction rolls it back.
pub struct SaveTransaction<'a> {
    mailbox: &'a Mailbox,
    temp_prefix: String,
    next_temp: u32,
    index_tx: Option<IndexTransaction>,
    gateway: Option<ObjectGateway>,
    current: Option<CurrentSave<'a>>,
    staged: Vec<StagedMail>,
    sync: Option<IndexSync>,
    index_result: Option<CommitResult>,
    /// The last mail begun was cancelled and nothing was begun since
    cancelled: bool,
    state: SaveState,
}

impl<'a> SaveTransaction<'a> {
    pub(super) fn new(mailbox: &'a Mailbox) -> Self {
        let temp_prefix = mailbox.temp_names().next_name();
        debug!("save transaction {temp_prefix} started on {}", mailbox.name());
        Self {
            mailbox,
            temp_prefix,
            next_temp: 0,
            index_tx: Some(mailbox.index().transaction_begin()),
            gateway: mailbox
                .remote()
                .map(|remote| ObjectGateway::new(remote.handle.clone(), remote.max_write_size)),
            current: None,
            staged: Vec::new(),
            sync: None,
            index_result: None,
            cancelled: false,
            state: SaveState::Open,
        }
    }

    pub fn state(&self) -> SaveState {
        self.state
    }

    /// Mails finished so far
    pub fn mail_count(&self) -> usize {
        self.staged.len()
    }

    /// Prefix shared by this transaction's staging files
    pub fn temp_prefix(&self) -> &str {
        &self.temp_prefix
    }

    fn ensure_state(&self, action: &'static str, allowed: &[SaveState]) -> Result<(), SaveError> {
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(SaveError::InvalidState {
                state: self.state.name(),
                action,
            })
        }
    }

    fn idle_state(&self) -> SaveState {
        if self.staged.is_empty() {
            SaveState::Open
        } else {
            SaveState::Flushed
        }
    }

    /// Start saving a mail read from `input`
    pub fn save_begin(&mut self, input: impl Read + 'a, data: MailSaveData) -> Result<(), SaveError> {
        self.ensure_state("begin a save", &[SaveState::Open, SaveState::Flushed])?;
        let Some(index_tx) = self.index_tx.as_mut() else {
            return Err(SaveError::InvalidState {
                state: self.state.name(),
                action: "begin a save",
            });
        };

        let path = self
            .mailbox
            .path()
            .join(format!("{}.{}", self.temp_prefix, self.next_temp));
        self.next_temp += 1;
        let file = open_staging_file(&path)?;
        self.cancelled = false;

        let flags = data.flags.difference(MailFlags::RECENT);
        let seq = index_tx.append(flags, &data.keywords, data.min_modseq);
        debug!("saving mail seq {seq} to {}", path.display());

        self.current = Some(CurrentSave {
            seq,
            path,
            file: BufWriter::new(file),
            input: Box::new(input),
            crlf: CrlfNormalizer::default(),
            size: 0,
            received: data.received_date,
            eof: false,
            failed: None,
        });
        self.state = SaveState::Saving;
        Ok(())
    }

    /// Drain what the input has available.
    ///
    /// Stops early when the input reports `WouldBlock`. After a failure
    /// every call returns the same error.
    pub fn save_continue(&mut self) -> Result<(), SaveError> {
        let idle = self.idle_error();
        self.current.as_mut().ok_or(idle)?.drain()
    }

    /// Error for a per-mail call made while no mail is being saved
    fn idle_error(&self) -> SaveError {
        if self.cancelled {
            SaveError::Cancelled
        } else {
            SaveError::NotStarted
        }
    }

    /// Finish the current mail: drain the rest of the input, flush, set
    /// the mtime and fsync unless disabled. On failure the staging file is
    /// removed and the mail dropped from the transaction.
    pub fn save_finish(&mut self) -> Result<(), SaveError> {
        let Some(mut current) = self.current.take() else {
            return Err(self.idle_error());
        };
        let fsync = self.mailbox.fsync_mode().syncs_each_mail();
        let outcome = current
            .drain()
            .and_then(|()| current.finish_file(fsync));

        let CurrentSave {
            seq,
            path,
            file,
            size,
            ..
        } = current;
        drop(file);

        let outcome = match (outcome, self.gateway.as_mut()) {
            (Ok(received), Some(gateway)) => {
                publish(gateway, self.mailbox.name(), &path, size, received)
                    .map(|oid| (received, Some(oid)))
            }
            (Ok(received), None) => Ok((received, None)),
            (Err(err), _) => Err(err),
        };

        let (received, oid) = match outcome {
            Ok(saved) => saved,
            Err(err) => {
                warn!("saving mail seq {seq} failed: {err}");
                remove_file_quietly(&path);
                if let Some(index_tx) = self.index_tx.as_mut() {
                    index_tx.cancel_append(seq);
                }
                self.state = self.idle_state();
                return Err(err);
            }
        };

        if let Some(index_tx) = self.index_tx.as_mut() {
            index_tx.set_saved(seq, oid.clone(), size, Some(received));
        }
        debug!("finished mail seq {seq}: {size} bytes");
        self.staged.push(StagedMail {
            seq,
            temp_path: path,
            final_path: None,
            uid: None,
            oid,
            size,
        });
        self.state = SaveState::Flushed;
        Ok(())
    }

    /// Abandon the mail being saved, if any. Until the next
    /// [`save_begin`](Self::save_begin), per-mail calls report
    /// [`SaveError::Cancelled`].
    pub fn save_cancel(&mut self) {
        let Some(current) = self.current.take() else {
            return;
        };
        self.cancelled = true;
        let CurrentSave { seq, path, file, .. } = current;
        drop(file);
        remove_file_quietly(&path);
        if let Some(index_tx) = self.index_tx.as_mut() {
            index_tx.cancel_append(seq);
        }
        info!("save of mail seq {seq} cancelled");
        self.state = self.idle_state();
    }

    /// Flush every staged file to disk in one pass
    fn sync_staged(&self) -> Result<(), SaveError> {
        for staged in &self.staged {
            File::open(&staged.temp_path)
                .and_then(|file| file.sync_all())
                .map_err(|err| SaveError::io("fsync", &staged.temp_path, err))?;
        }
        debug!("synced {} staged mail(s)", self.staged.len());
        Ok(())
    }

    /// Rename staged files to their final names in sequence order
    fn promote_staged(&mut self) -> Result<(), SaveError> {
        let Some(index_tx) = self.index_tx.as_ref() else {
            return Err(IndexError::UidsNotAssigned.into());
        };
        for staged in &mut self.staged {
            let uid = index_tx
                .uid_of(staged.seq)
                .ok_or(IndexError::UidsNotAssigned)?;
            let final_path = self.mailbox.mail_path(uid);
            if let Err(source) = fs::rename(&staged.temp_path, &final_path) {
                return Err(SaveError::Rename {
                    from: staged.temp_path.clone(),
                    to: final_path,
                    source: Arc::new(source),
                });
            }
            staged.uid = Some(uid);
            staged.final_path = Some(final_path);
        }
        Ok(())
    }

    /// Assign UIDs and promote the staged files.
    ///
    /// Remote publishes are waited for before the sync lock is taken. On
    /// any failure the transaction is rolled back before the error is
    /// returned.
    pub fn commit_pre(&mut self) -> Result<(), SaveError> {
        self.ensure_state("commit", &[SaveState::Open, SaveState::Flushed])?;
        self.state = SaveState::Committing;

        if let Some(gateway) = self.gateway.as_mut()
            && let Err(err) = gateway.wait_all()
        {
            self.rollback_inner();
            return Err(SaveError::Publish(err));
        }

        let fsync_mode = self.mailbox.fsync_mode();
        if fsync_mode.syncs_at_commit()
            && let Err(err) = self.sync_staged()
        {
            self.rollback_inner();
            return Err(err);
        }

        let sync = match self.mailbox.index().sync_begin() {
            Ok(sync) => sync,
            Err(err) => {
                self.rollback_inner();
                return Err(err.into());
            }
        };
        let next_uid = sync.next_uid();
        self.sync = Some(sync);
        self.staged.sort_by_key(|staged| staged.seq);
        if let Some(index_tx) = self.index_tx.as_mut() {
            index_tx.append_finish_uids(next_uid);
        }

        let promoted = self.promote_staged().and_then(|()| {
            if fsync_mode.syncs_directory() {
                sync_dir(self.mailbox.path())
            } else {
                Ok(())
            }
        });
        if let Err(err) = promoted {
            warn!("commit of {} failed: {err}", self.temp_prefix);
            self.rollback_inner();
            return Err(err);
        }
        debug!(
            "promoted {} mail(s) from uid {next_uid}",
            self.staged.len()
        );
        Ok(())
    }

    /// Make the appends durable in the index
    pub fn commit_index(&mut self) -> Result<CommitResult, SaveError> {
        let committed = match (self.index_tx.take(), self.sync.as_mut()) {
            (Some(index_tx), Some(sync)) if self.state == SaveState::Committing => {
                index_tx.commit(sync)
            }
            (index_tx, _) => {
                self.index_tx = index_tx;
                return Err(SaveError::InvalidState {
                    state: self.state.name(),
                    action: "commit the index",
                });
            }
        };

        match committed {
            Ok(result) => {
                self.index_result = Some(result.clone());
                Ok(result)
            }
            Err(err) => {
                warn!("index commit of {} failed: {err}", self.temp_prefix);
                self.rollback_inner();
                Err(err.into())
            }
        }
    }

    /// End the sync epoch after a durable index commit and report the
    /// mails that became visible
    pub fn commit_post(mut self, result: &CommitResult) -> Result<Vec<SavedMail>, SaveError> {
        if self.index_result.is_none() {
            return Err(SaveError::InvalidState {
                state: self.state.name(),
                action: "finish the commit",
            });
        }
        self.finish_committed(result.clone());

        let saved: Vec<SavedMail> = self
            .staged
            .drain(..)
            .filter_map(|staged| {
                Some(SavedMail {
                    uid: staged.uid?,
                    path: staged.final_path?,
                    oid: staged.oid,
                    size: staged.size,
                })
            })
            .collect();
        info!(
            "saved {} mail(s) to {} (uids {}..={})",
            saved.len(),
            self.mailbox.name(),
            result.uid_first,
            result.uid_last
        );
        Ok(saved)
    }

    /// Run all three commit steps
    pub fn commit(mut self) -> Result<Vec<SavedMail>, SaveError> {
        self.commit_pre()?;
        let result = self.commit_index()?;
        self.commit_post(&result)
    }

    /// Discard everything staged by this transaction
    pub fn rollback(mut self) {
        self.rollback_inner();
    }

    fn finish_committed(&mut self, result: CommitResult) {
        self.index_result = None;
        if let Some(mut sync) = self.sync.take() {
            sync.set_commit_result(result);
            sync.finish(true);
        }
        self.state = SaveState::Committed;
    }

    fn rollback_inner(&mut self) {
        if matches!(self.state, SaveState::Committed | SaveState::RolledBack) {
            return;
        }
        if let Some(result) = self.index_result.take() {
            // The index already holds the mails; only the epoch is open.
            self.finish_committed(result);
            return;
        }

        self.save_cancel();
        if let Some(sync) = self.sync.take() {
            sync.finish(false);
        }

        let discarded = self.staged.len();
        let mut oids = Vec::new();
        for staged in self.staged.drain(..) {
            remove_file_quietly(
                staged
                    .final_path
                    .as_deref()
                    .unwrap_or(staged.temp_path.as_path()),
            );
            oids.extend(staged.oid);
        }
        if let Some(index_tx) = self.index_tx.take() {
            index_tx.rollback();
        }

        if let Some(gateway) = self.gateway.as_mut() {
            // Issued writes cannot be stopped; let them land, then delete.
            if let Err(err) = gateway.wait_all() {
                debug!("ignoring publish failure during rollback: {err}");
            }
            for oid in &oids {
                if let Err(err) = gateway.delete_object(oid) {
                    warn!("failed to delete published mail {oid}: {err}");
                }
            }
        }

        self.state = SaveState::RolledBack;
        info!(
            "save transaction {} rolled back, {discarded} mail(s) discarded",
            self.temp_prefix
        );
    }
}

impl Drop for SaveTransaction<'_> {
    fn drop(&mut self) {
        self.rollback_inner();
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::io;
    use std::sync::Arc;

    use chrono::TimeZone;
    use tempfile::{TempDir, tempdir};

    use super::*;
    use crate::cluster::{ClusterSession, MemoryCluster, Namespace, status};
    use crate::config::FsyncMode;

    fn mailbox(dir: &TempDir) -> Mailbox {
        Mailbox::open(dir.path(), "INBOX", FsyncMode::Never).unwrap()
    }

    fn save(tx: &mut SaveTransaction<'_>, body: &'static [u8], data: MailSaveData) {
        tx.save_begin(body, data).unwrap();
        tx.save_continue().unwrap();
        tx.save_finish().unwrap();
    }

    /// Names in the mailbox directory that are mail or staging files
    fn mail_files(dir: &TempDir) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(dir.path())
            .unwrap()
            .map(|entry| entry.unwrap().file_name().into_string().unwrap())
            .filter(|name| name.starts_with("u.") || name.starts_with("temp."))
            .collect();
        names.sort();
        names
    }

    /// Yields the queued chunks; `None` reports `WouldBlock` once
    struct StepReader(VecDeque<Option<&'static [u8]>>);

    impl Read for StepReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.0.pop_front() {
                Some(Some(chunk)) => {
                    buf[..chunk.len()].copy_from_slice(chunk);
                    Ok(chunk.len())
                }
                Some(None) => Err(io::Error::from(ErrorKind::WouldBlock)),
                None => Ok(0),
            }
        }
    }

    struct BrokenReader;

    impl Read for BrokenReader {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::Error::other("connection reset"))
        }
    }

    #[test]
    fn test_three_mails_get_contiguous_uids() {
        let dir = tempdir().unwrap();
        let mailbox = mailbox(&dir);
        let mut tx = mailbox.transaction_begin();
        save(&mut tx, b"one\n", MailSaveData::default());
        save(&mut tx, b"two\n", MailSaveData::default());
        save(&mut tx, b"three\n", MailSaveData::default());
        assert_eq!(tx.mail_count(), 3);

        let saved = tx.commit().unwrap();
        let uids: Vec<u32> = saved.iter().map(|m| m.uid).collect();
        assert_eq!(uids, vec![1, 2, 3]);
        assert_eq!(mail_files(&dir), vec!["u.1", "u.2", "u.3"]);
        assert_eq!(mailbox.read_mail(2).unwrap(), b"two\r\n".to_vec());
        assert_eq!(mailbox.header().unwrap().next_uid, 4);
        assert!(!mailbox.index().is_sync_locked());
    }

    #[test]
    fn test_second_transaction_continues_uids() {
        let dir = tempdir().unwrap();
        let mailbox = mailbox(&dir);
        let mut tx = mailbox.transaction_begin();
        save(&mut tx, b"a", MailSaveData::default());
        tx.commit().unwrap();

        let mut tx = mailbox.transaction_begin();
        save(&mut tx, b"b", MailSaveData::default());
        let saved = tx.commit().unwrap();
        assert_eq!(saved[0].uid, 2);
        assert_eq!(mailbox.index().log_entries().unwrap().len(), 2);
    }

    #[test]
    fn test_rename_failure_publishes_nothing() {
        let dir = tempdir().unwrap();
        let mailbox = mailbox(&dir);
        // A directory where the second mail's final file would go.
        fs::create_dir(mailbox.mail_path(2)).unwrap();

        let mut tx = mailbox.transaction_begin();
        save(&mut tx, b"one", MailSaveData::default());
        save(&mut tx, b"two", MailSaveData::default());
        save(&mut tx, b"three", MailSaveData::default());

        let err = tx.commit().unwrap_err();
        assert!(matches!(err, SaveError::Rename { .. }));
        assert!(!mailbox.mail_path(1).exists());
        assert!(!mailbox.mail_path(3).exists());
        assert!(mailbox.mail_path(2).is_dir());
        assert_eq!(mail_files(&dir), vec!["u.2"]);
        assert_eq!(mailbox.index().message_count().unwrap(), 0);
        assert_eq!(mailbox.header().unwrap().next_uid, 1);
        assert!(!mailbox.index().is_sync_locked());
    }

    #[test]
    fn test_flags_and_received_date() {
        let dir = tempdir().unwrap();
        let mailbox = mailbox(&dir);
        let received = Utc.with_ymd_and_hms(2020, 1, 2, 3, 4, 5).unwrap();

        let mut tx = mailbox.transaction_begin();
        save(
            &mut tx,
            b"body",
            MailSaveData {
                flags: MailFlags::SEEN | MailFlags::RECENT,
                keywords: vec!["$Forwarded".to_string()],
                min_modseq: 0,
                received_date: Some(received),
            },
        );
        let saved = tx.commit().unwrap();

        let record = mailbox.index().record(saved[0].uid).unwrap().unwrap();
        assert_eq!(record.flags, MailFlags::SEEN);
        assert_eq!(record.keywords, vec!["$Forwarded".to_string()]);
        assert_eq!(record.received, Some(received));
        assert_eq!(record.size, 4);

        let mtime = fs::metadata(&saved[0].path).unwrap().modified().unwrap();
        assert_eq!(DateTime::<Utc>::from(mtime), received);
    }

    #[test]
    fn test_continue_stops_on_would_block() {
        let dir = tempdir().unwrap();
        let mailbox = mailbox(&dir);
        let mut tx = mailbox.transaction_begin();
        let input = StepReader(VecDeque::from([Some(&b"head\n"[..]), None, Some(&b"tail\n"[..])]));

        tx.save_begin(input, MailSaveData::default()).unwrap();
        tx.save_continue().unwrap();
        tx.save_continue().unwrap();
        tx.save_finish().unwrap();
        let saved = tx.commit().unwrap();

        assert_eq!(saved[0].size, 12);
        assert_eq!(mailbox.read_mail(1).unwrap(), b"head\r\ntail\r\n".to_vec());
    }

    #[test]
    fn test_read_failure_is_sticky() {
        let dir = tempdir().unwrap();
        let mailbox = mailbox(&dir);
        let mut tx = mailbox.transaction_begin();

        tx.save_begin(BrokenReader, MailSaveData::default()).unwrap();
        let first = tx.save_continue().unwrap_err();
        let second = tx.save_continue().unwrap_err();
        assert_eq!(first.to_string(), second.to_string());
        assert!(matches!(first, SaveError::Io { op: "read", .. }));

        assert!(tx.save_finish().is_err());
        assert_eq!(tx.state(), SaveState::Open);
        assert!(mail_files(&dir).is_empty());

        assert!(tx.commit().unwrap().is_empty());
        assert_eq!(mailbox.index().message_count().unwrap(), 0);
    }

    #[test]
    fn test_cancel_drops_current_mail() {
        let dir = tempdir().unwrap();
        let mailbox = mailbox(&dir);
        let mut tx = mailbox.transaction_begin();
        save(&mut tx, b"kept", MailSaveData::default());

        tx.save_begin(&b"dropped"[..], MailSaveData::default()).unwrap();
        tx.save_continue().unwrap();
        tx.save_cancel();
        assert_eq!(tx.state(), SaveState::Flushed);

        let saved = tx.commit().unwrap();
        assert_eq!(saved.len(), 1);
        assert_eq!(mailbox.read_mail(1).unwrap(), b"kept".to_vec());
        assert_eq!(mail_files(&dir), vec!["u.1"]);
    }

    #[test]
    fn test_calls_after_cancel_report_cancelled() {
        let dir = tempdir().unwrap();
        let mailbox = mailbox(&dir);
        let mut tx = mailbox.transaction_begin();

        tx.save_begin(&b"dropped"[..], MailSaveData::default()).unwrap();
        tx.save_cancel();
        assert!(matches!(tx.save_continue(), Err(SaveError::Cancelled)));
        assert!(matches!(tx.save_finish(), Err(SaveError::Cancelled)));
        assert_eq!(tx.state(), SaveState::Open);

        save(&mut tx, b"next", MailSaveData::default());
        assert!(matches!(tx.save_finish(), Err(SaveError::NotStarted)));
        assert_eq!(tx.commit().unwrap()[0].uid, 1);
    }

    #[test]
    fn test_fsync_modes_commit() {
        for mode in [FsyncMode::Always, FsyncMode::Optimized, FsyncMode::Never] {
            let dir = tempdir().unwrap();
            let mailbox = Mailbox::open(dir.path(), "INBOX", mode).unwrap();
            let mut tx = mailbox.transaction_begin();
            save(&mut tx, b"one", MailSaveData::default());
            save(&mut tx, b"two", MailSaveData::default());

            let saved = tx.commit().unwrap();
            assert_eq!(saved.len(), 2, "{mode:?}");
            assert_eq!(mail_files(&dir), vec!["u.1", "u.2"]);
            assert_eq!(mailbox.read_mail(2).unwrap(), b"two".to_vec());
        }
    }

    #[test]
    fn test_invalid_calls() {
        let dir = tempdir().unwrap();
        let mailbox = mailbox(&dir);
        let mut tx = mailbox.transaction_begin();
        assert!(matches!(tx.save_continue(), Err(SaveError::NotStarted)));
        assert!(matches!(tx.save_finish(), Err(SaveError::NotStarted)));
        assert!(matches!(
            tx.commit_index(),
            Err(SaveError::InvalidState { .. })
        ));

        tx.save_begin(&b"x"[..], MailSaveData::default()).unwrap();
        assert!(matches!(
            tx.save_begin(&b"y"[..], MailSaveData::default()),
            Err(SaveError::InvalidState {
                state: "saving",
                ..
            })
        ));
        assert!(matches!(
            tx.commit_pre(),
            Err(SaveError::InvalidState { .. })
        ));
    }

    #[test]
    fn test_rollback_and_drop_discard_staged_files() {
        let dir = tempdir().unwrap();
        let mailbox = mailbox(&dir);

        let mut tx = mailbox.transaction_begin();
        save(&mut tx, b"a", MailSaveData::default());
        save(&mut tx, b"b", MailSaveData::default());
        assert_eq!(mail_files(&dir).len(), 2);
        tx.rollback();
        assert!(mail_files(&dir).is_empty());

        {
            let mut tx = mailbox.transaction_begin();
            save(&mut tx, b"c", MailSaveData::default());
            tx.save_begin(&b"d"[..], MailSaveData::default()).unwrap();
        }
        assert!(mail_files(&dir).is_empty());
        assert_eq!(mailbox.index().message_count().unwrap(), 0);
    }

    #[test]
    fn test_stepwise_commit() {
        let dir = tempdir().unwrap();
        let mailbox = mailbox(&dir);
        let mut tx = mailbox.transaction_begin();
        save(&mut tx, b"a", MailSaveData::default());

        tx.commit_pre().unwrap();
        assert_eq!(tx.state(), SaveState::Committing);
        assert!(mailbox.index().is_sync_locked());
        assert!(mailbox.mail_path(1).exists());

        let result = tx.commit_index().unwrap();
        assert_eq!((result.uid_first, result.uid_last), (1, 1));
        let saved = tx.commit_post(&result).unwrap();
        assert_eq!(saved[0].path, mailbox.mail_path(1));
        assert!(!mailbox.index().is_sync_locked());
    }

    #[test]
    fn test_drop_after_index_commit_keeps_mails() {
        let dir = tempdir().unwrap();
        let mailbox = mailbox(&dir);
        {
            let mut tx = mailbox.transaction_begin();
            save(&mut tx, b"a", MailSaveData::default());
            tx.commit_pre().unwrap();
            tx.commit_index().unwrap();
        }
        assert!(mailbox.mail_path(1).exists());
        assert_eq!(mailbox.index().message_count().unwrap(), 1);
        assert!(!mailbox.index().is_sync_locked());
    }

    fn remote_mailbox(dir: &TempDir, cluster: &MemoryCluster) -> (ClusterSession, Mailbox) {
        let mut session =
            ClusterSession::init("client.admin", "ceph", 0, Arc::new(cluster.clone())).unwrap();
        session.connect().unwrap();
        let handle = session
            .open_namespace("mail_storage", Namespace::for_user("alice"))
            .unwrap();
        let gateway = ObjectGateway::new(handle, 1024);
        let mailbox = mailbox(dir).with_remote(&gateway);
        (session, mailbox)
    }

    #[test]
    fn test_remote_publish() {
        let dir = tempdir().unwrap();
        let cluster = MemoryCluster::with_pools(&["mail_storage"]);
        let (session, mailbox) = remote_mailbox(&dir, &cluster);

        let mut tx = mailbox.transaction_begin();
        save(&mut tx, b"hello\n", MailSaveData::default());
        let saved = tx.commit().unwrap();
        let oid = saved[0].oid.clone().unwrap();

        let handle = session
            .open_namespace("mail_storage", Namespace::for_user("alice"))
            .unwrap();
        let gateway = ObjectGateway::new(handle, 1024);
        assert_eq!(gateway.read_object(&oid).unwrap(), b"hello\r\n".to_vec());
        let xattrs = gateway.get_xattrs(&oid).unwrap();
        assert_eq!(xattrs.get("mailbox"), Some(&b"INBOX".to_vec()));
        assert_eq!(xattrs.get("size"), Some(&b"7".to_vec()));
        assert_eq!(
            mailbox.index().record(1).unwrap().unwrap().oid,
            Some(oid)
        );
    }

    #[test]
    fn test_remote_failure_rolls_back() {
        let dir = tempdir().unwrap();
        let cluster = MemoryCluster::with_pools(&["mail_storage"]);
        let (session, mailbox) = remote_mailbox(&dir, &cluster);
        cluster.fail_data_write_after(1, status::EIO);

        let mut tx = mailbox.transaction_begin();
        save(&mut tx, b"one", MailSaveData::default());
        save(&mut tx, b"two", MailSaveData::default());
        let err = tx.commit().unwrap_err();
        match err {
            SaveError::Publish(err) => assert_eq!(err.status(), status::EIO),
            other => panic!("unexpected error: {other:?}"),
        }

        let handle = session
            .open_namespace("mail_storage", Namespace::for_user("alice"))
            .unwrap();
        let gateway = ObjectGateway::new(handle, 1024);
        assert!(gateway.list_objects().unwrap().is_empty());
        assert!(mail_files(&dir).is_empty());
        assert_eq!(mailbox.header().unwrap().next_uid, 1);
    }
}
