//! rbox - Mail storage on a replicated object store
//!
//! This crate provides the storage engine a mail server uses to keep its
//! message bodies and key/value metadata on a distributed object store:
//! - Cluster sessions, namespaces and per-namespace object I/O
//! - A transactional key/value dictionary on per-user map-objects
//! - The mail save pipeline: local staging, UID assignment and atomic
//!   publication into the mailbox index
//! - Status mapping for the host mail server's call surfaces
//!
//! The store protocol sits behind the [`RadosBackend`] trait. Two backends
//! ship with the crate: [`MemoryCluster`] and the durable [`SqliteCluster`].

pub mod cluster;
pub mod config;
pub mod dict;
pub mod error;
pub mod host;
pub mod index;
pub mod models;
pub mod save;

pub use cluster::{
    ClusterDriver, ClusterSession, MemoryCluster, Namespace, NamespaceHandle, ObjectGateway,
    RadosBackend, SqliteCluster,
};
pub use config::{FsyncMode, StorageSettings};
pub use dict::{
    CommitOutcome, DictIterator, DictSettings, DictTransaction, DictUri, IterateFlags,
    RadosDictionary,
};
pub use error::{ConfigError, ConnectError, DictError, IndexError, ObjectError, SaveError};
pub use host::{HostStatus, StoreComponent};
pub use index::{CommitResult, MailIndex};
pub use models::{MailFlags, MailSaveData, MailboxHeader, SavedMail};
pub use save::{Mailbox, SaveState, SaveTransaction};
