//! Status codes handed back to the host mail server
//!
//! The host only sees an integer code and an optional message. Dictionary
//! results use the three-valued convention below; everything else reports
//! `0` on success and, on failure, the store's negated errno when the store
//! produced the error or `-1` otherwise, with the error's message.
//!
//! The host drives three kinds of component, wrapped in [`StoreComponent`].

use std::fmt;

use log::debug;

use crate::cluster::ObjectGateway;
use crate::dict::{CommitOutcome, RadosDictionary};
use crate::error::{ConfigError, ConnectError, DictError, IndexError, ObjectError, SaveError};
use crate::save::SaveTransaction;

pub const DICT_COMMIT_RET_OK: i32 = 1;
pub const DICT_COMMIT_RET_NOTFOUND: i32 = 0;
pub const DICT_COMMIT_RET_FAILED: i32 = -1;

pub const DICT_LOOKUP_FOUND: i32 = 1;
pub const DICT_LOOKUP_NOTFOUND: i32 = 0;
pub const DICT_LOOKUP_FAILED: i32 = -1;

/// Generic success and failure codes
pub const HOST_OK: i32 = 0;
pub const HOST_FAILED: i32 = -1;

/// Code plus optional human-readable message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostStatus {
    pub code: i32,
    pub message: Option<String>,
}

impl HostStatus {
    pub fn new(code: i32) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn failed(err: &dyn fmt::Display) -> Self {
        Self {
            code: HOST_FAILED,
            message: Some(err.to_string()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code >= 0
    }
}

/// Store status behind an error, when the store produced one
pub trait StoreStatus {
    fn store_status(&self) -> Option<i32>;
}

impl StoreStatus for ConnectError {
    fn store_status(&self) -> Option<i32> {
        self.status()
    }
}

impl StoreStatus for ConfigError {
    fn store_status(&self) -> Option<i32> {
        None
    }
}

impl StoreStatus for ObjectError {
    fn store_status(&self) -> Option<i32> {
        Some(self.status())
    }
}

impl StoreStatus for DictError {
    fn store_status(&self) -> Option<i32> {
        match self {
            DictError::Failed { status, .. } => Some(*status),
            DictError::Connect(err) => err.status(),
            DictError::UnsupportedFlag(_) | DictError::Config(_) => None,
        }
    }
}

impl StoreStatus for IndexError {
    fn store_status(&self) -> Option<i32> {
        None
    }
}

impl StoreStatus for SaveError {
    fn store_status(&self) -> Option<i32> {
        match self {
            SaveError::Publish(err) => Some(err.status()),
            _ => None,
        }
    }
}

pub fn lookup_status(result: &Result<Option<String>, DictError>) -> HostStatus {
    match result {
        Ok(Some(_)) => HostStatus::new(DICT_LOOKUP_FOUND),
        Ok(None) => HostStatus::new(DICT_LOOKUP_NOTFOUND),
        Err(err) => HostStatus {
            code: DICT_LOOKUP_FAILED,
            message: Some(err.to_string()),
        },
    }
}

pub fn commit_status(result: &Result<CommitOutcome, DictError>) -> HostStatus {
    match result {
        Ok(CommitOutcome::Ok) => HostStatus::new(DICT_COMMIT_RET_OK),
        Ok(CommitOutcome::NotFound) => HostStatus::new(DICT_COMMIT_RET_NOTFOUND),
        Err(err) => HostStatus {
            code: DICT_COMMIT_RET_FAILED,
            message: Some(err.to_string()),
        },
    }
}

/// `0`, or the failure code for the error with its message
pub fn status_of<T, E: StoreStatus + fmt::Display>(result: &Result<T, E>) -> HostStatus {
    match result {
        Ok(_) => HostStatus::new(HOST_OK),
        Err(err) => HostStatus {
            code: err.store_status().unwrap_or(HOST_FAILED),
            message: Some(err.to_string()),
        },
    }
}

/// A component the host holds between calls
///
/// Each variant keeps its own operations; the wrapper only adds what the
/// host does uniformly to all of them: draining async work and release.
pub enum StoreComponent<'a> {
    Dictionary(RadosDictionary),
    ObjectStore(ObjectGateway),
    SaveTransaction(SaveTransaction<'a>),
}

impl<'a> StoreComponent<'a> {
    pub fn kind(&self) -> &'static str {
        match self {
            StoreComponent::Dictionary(_) => "dictionary",
            StoreComponent::ObjectStore(_) => "object store",
            StoreComponent::SaveTransaction(_) => "save transaction",
        }
    }

    pub fn as_dictionary(&self) -> Option<&RadosDictionary> {
        match self {
            StoreComponent::Dictionary(dict) => Some(dict),
            _ => None,
        }
    }

    pub fn as_object_store(&mut self) -> Option<&mut ObjectGateway> {
        match self {
            StoreComponent::ObjectStore(gateway) => Some(gateway),
            _ => None,
        }
    }

    pub fn as_save_transaction(&mut self) -> Option<&mut SaveTransaction<'a>> {
        match self {
            StoreComponent::SaveTransaction(tx) => Some(tx),
            _ => None,
        }
    }

    /// Block until async requests issued through the component resolve
    pub fn wait(&mut self) -> HostStatus {
        match self {
            StoreComponent::Dictionary(dict) => {
                dict.wait_for_completions();
                HostStatus::new(HOST_OK)
            }
            StoreComponent::ObjectStore(gateway) => status_of(&gateway.wait_all()),
            StoreComponent::SaveTransaction(_) => HostStatus::new(HOST_OK),
        }
    }

    /// Tear the component down. An uncommitted save transaction is rolled
    /// back.
    pub fn release(self) -> HostStatus {
        debug!("releasing {}", self.kind());
        match self {
            StoreComponent::Dictionary(dict) => status_of(&dict.deinit()),
            StoreComponent::ObjectStore(mut gateway) => status_of(&gateway.wait_all()),
            StoreComponent::SaveTransaction(tx) => {
                tx.rollback();
                HostStatus::new(HOST_OK)
            }
        }
    }
}

impl From<RadosDictionary> for StoreComponent<'_> {
    fn from(dict: RadosDictionary) -> Self {
        StoreComponent::Dictionary(dict)
    }
}

impl From<ObjectGateway> for StoreComponent<'_> {
    fn from(gateway: ObjectGateway) -> Self {
        StoreComponent::ObjectStore(gateway)
    }
}

impl<'a> From<SaveTransaction<'a>> for StoreComponent<'a> {
    fn from(tx: SaveTransaction<'a>) -> Self {
        StoreComponent::SaveTransaction(tx)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tempfile::tempdir;

    use super::*;
    use crate::cluster::{ClusterSession, MemoryCluster, Namespace, status};
    use crate::config::FsyncMode;
    use crate::models::MailSaveData;
    use crate::save::Mailbox;

    #[test]
    fn test_lookup_codes() {
        assert_eq!(lookup_status(&Ok(Some("v".into()))).code, 1);
        assert_eq!(lookup_status(&Ok(None)).code, 0);

        let failed = lookup_status(&Err(DictError::Failed {
            oid: "metadata/alice".into(),
            status: status::EIO,
        }));
        assert_eq!(failed.code, -1);
        assert!(failed.message.unwrap().contains("metadata/alice"));
    }

    #[test]
    fn test_commit_codes() {
        assert_eq!(commit_status(&Ok(CommitOutcome::Ok)).code, DICT_COMMIT_RET_OK);
        assert_eq!(
            commit_status(&Ok(CommitOutcome::NotFound)).code,
            DICT_COMMIT_RET_NOTFOUND
        );
        let failed = commit_status(&Err(DictError::UnsupportedFlag("RECURSE")));
        assert_eq!(failed.code, DICT_COMMIT_RET_FAILED);
        assert!(!failed.is_ok());
    }

    #[test]
    fn test_store_status() {
        let err = DictError::Connect(ConnectError::Connect {
            status: status::ETIMEDOUT,
        });
        assert_eq!(err.store_status(), Some(status::ETIMEDOUT));
        assert_eq!(DictError::UnsupportedFlag("RECURSE").store_status(), None);

        let err = SaveError::Publish(ObjectError::from_status("aio_write", "m1", status::EIO));
        assert_eq!(err.store_status(), Some(status::EIO));
        assert_eq!(SaveError::Cancelled.store_status(), None);
    }

    #[test]
    fn test_status_of() {
        let ok: Result<(), SaveError> = Ok(());
        assert_eq!(status_of(&ok), HostStatus::new(HOST_OK));

        let err: Result<(), SaveError> = Err(SaveError::NotStarted);
        let host = status_of(&err);
        assert_eq!(host.code, HOST_FAILED);
        assert_eq!(host.message.as_deref(), Some("no mail is being saved"));

        let err: Result<(), ObjectError> =
            Err(ObjectError::from_status("read", "m1", status::ENOENT));
        let host = status_of(&err);
        assert_eq!(host.code, status::ENOENT);
        assert!(!host.is_ok());
    }

    fn connected(cluster: &MemoryCluster) -> ClusterSession {
        let mut session =
            ClusterSession::init("client.admin", "ceph", 0, Arc::new(cluster.clone())).unwrap();
        session.connect().unwrap();
        session
    }

    #[test]
    fn test_dictionary_component() {
        let cluster = MemoryCluster::with_pools(&["librmb"]);
        let dict = RadosDictionary::open(connected(&cluster), "librmb", "metadata", "alice").unwrap();
        let mut component = StoreComponent::from(dict);
        assert_eq!(component.kind(), "dictionary");
        assert!(component.as_object_store().is_none());

        let Some(dict) = component.as_dictionary() else {
            panic!("not a dictionary");
        };
        let mut tx = dict.transaction_begin();
        tx.set("priv/k", "v");
        assert_eq!(commit_status(&tx.commit()).code, DICT_COMMIT_RET_OK);
        assert_eq!(lookup_status(&dict.lookup("priv/k")).code, DICT_LOOKUP_FOUND);

        assert!(component.wait().is_ok());
        assert_eq!(component.release(), HostStatus::new(HOST_OK));
    }

    #[test]
    fn test_object_store_component_reports_errno() {
        let cluster = MemoryCluster::with_pools(&["mail"]);
        let session = connected(&cluster);
        let handle = session.open_namespace("mail", Namespace::shared()).unwrap();
        let mut component = StoreComponent::from(ObjectGateway::new(handle, 16));
        cluster.fail_data_write_after(0, status::EIO);

        let Some(gateway) = component.as_object_store() else {
            panic!("not an object store");
        };
        gateway.begin_async_write("m1", b"data");
        let host = component.wait();
        assert_eq!(host.code, status::EIO);
        assert!(host.message.is_some());
        assert_eq!(component.release(), HostStatus::new(HOST_OK));
    }

    #[test]
    fn test_save_transaction_component_rolls_back_on_release() {
        let dir = tempdir().unwrap();
        let mailbox = Mailbox::open(dir.path(), "INBOX", FsyncMode::Never).unwrap();
        let mut component = StoreComponent::from(mailbox.transaction_begin());
        assert_eq!(component.kind(), "save transaction");

        let Some(tx) = component.as_save_transaction() else {
            panic!("not a save transaction");
        };
        let begun = tx.save_begin(&b"body"[..], MailSaveData::default());
        assert_eq!(status_of(&begun), HostStatus::new(HOST_OK));
        assert_eq!(status_of(&tx.save_finish()), HostStatus::new(HOST_OK));

        assert!(component.wait().is_ok());
        assert!(component.release().is_ok());
        assert_eq!(mailbox.index().message_count().unwrap(), 0);
    }
}
