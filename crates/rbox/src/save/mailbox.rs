//! Local mailbox directory: staged and final mail files plus the index

use std::fs;
use std::path::{Path, PathBuf};

use log::info;

use super::SaveTransaction;
use super::tempname::TempNameGenerator;
use crate::cluster::{NamespaceHandle, ObjectGateway};
use crate::config::{FsyncMode, StorageSettings};
use crate::error::SaveError;
use crate::index::MailIndex;
use crate::models::MailboxHeader;

/// Index database filename inside a mailbox directory
pub const INDEX_FILE: &str = "rbox.index.db";

/// Where finished mails are published on the cluster
#[derive(Clone)]
pub(crate) struct RemoteTarget {
    pub(crate) handle: NamespaceHandle,
    pub(crate) max_write_size: usize,
}

/// A mailbox directory with its index
///
/// Committed mails live in `u.<uid>` files. With a remote target every
/// saved mail is also written to the cluster as an object.
pub struct Mailbox {
    name: String,
    path: PathBuf,
    index: MailIndex,
    fsync_mode: FsyncMode,
    remote: Option<RemoteTarget>,
    temp_names: TempNameGenerator,
}

impl Mailbox {
    /// Open or create the mailbox at `path`
    pub fn open(path: impl AsRef<Path>, name: &str, fsync_mode: FsyncMode) -> Result<Self, SaveError> {
        let path = path.as_ref().to_path_buf();
        fs::create_dir_all(&path).map_err(|err| SaveError::io("mkdir", &path, err))?;
        let index = MailIndex::open(path.join(INDEX_FILE))?;
        let header = index.ensure_header()?;
        info!(
            "opened mailbox {name} at {} (next_uid {})",
            path.display(),
            header.next_uid
        );

        Ok(Self {
            name: name.to_string(),
            path,
            index,
            fsync_mode,
            remote: None,
            temp_names: TempNameGenerator::new(),
        })
    }

    /// Open the mailbox with the configured fsync mode
    pub fn from_settings(
        path: impl AsRef<Path>,
        name: &str,
        settings: &StorageSettings,
    ) -> Result<Self, SaveError> {
        Self::open(path, name, settings.fsync_mode)
    }

    /// Publish saved mails through the gateway's namespace
    pub fn with_remote(mut self, gateway: &ObjectGateway) -> Self {
        self.remote = Some(RemoteTarget {
            handle: gateway.handle().clone(),
            max_write_size: gateway.max_write_size(),
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn index(&self) -> &MailIndex {
        &self.index
    }

    pub fn fsync_mode(&self) -> FsyncMode {
        self.fsync_mode
    }

    pub fn has_remote(&self) -> bool {
        self.remote.is_some()
    }

    pub(crate) fn remote(&self) -> Option<&RemoteTarget> {
        self.remote.as_ref()
    }

    pub(crate) fn temp_names(&self) -> &TempNameGenerator {
        &self.temp_names
    }

    pub fn header(&self) -> Result<MailboxHeader, SaveError> {
        Ok(self.index.header()?)
    }

    /// Final path of the mail with `uid`
    pub fn mail_path(&self, uid: u32) -> PathBuf {
        self.path.join(format!("u.{uid}"))
    }

    pub fn read_mail(&self, uid: u32) -> Result<Vec<u8>, SaveError> {
        let path = self.mail_path(uid);
        fs::read(&path).map_err(|err| SaveError::io("read", path, err))
    }

    pub fn transaction_begin(&self) -> SaveTransaction<'_> {
        SaveTransaction::new(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_open_initialises_header() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::open(dir.path().join("INBOX"), "INBOX", FsyncMode::Never).unwrap();
        let header = mailbox.header().unwrap();
        assert_eq!(header.next_uid, 1);
        assert!(!header.guid.is_empty());
        assert!(dir.path().join("INBOX").join(INDEX_FILE).exists());
        assert!(!mailbox.has_remote());
    }

    #[test]
    fn test_reopen_keeps_guid() {
        let dir = tempdir().unwrap();
        let first = Mailbox::open(dir.path(), "INBOX", FsyncMode::Never)
            .unwrap()
            .header()
            .unwrap();
        let second = Mailbox::open(dir.path(), "INBOX", FsyncMode::Never)
            .unwrap()
            .header()
            .unwrap();
        assert_eq!(first.guid, second.guid);
    }

    #[test]
    fn test_mail_path() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::open(dir.path(), "INBOX", FsyncMode::Never).unwrap();
        assert_eq!(mailbox.mail_path(7), dir.path().join("u.7"));
        assert!(matches!(mailbox.read_mail(7), Err(SaveError::Io { op: "read", .. })));
    }
}
