//! Error taxonomy for the storage engine
//!
//! One enum per layer. Store-originated errors keep the store's numeric
//! status (negated errno) so callers and the host glue can report it
//! verbatim.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::cluster::status::{self, strerror};

/// Cluster handle, connect and pool-open failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    #[error("Couldn't create the cluster handle! {} ({status})", strerror(*status))]
    Init { status: i32 },
    #[error("Cannot connect to cluster: {} ({status})", strerror(*status))]
    Connect { status: i32 },
    #[error("Cannot open pool {pool}: {} ({status})", strerror(*status))]
    PoolOpen { pool: String, status: i32 },
    #[error("Cannot create pool {pool}: {} ({status})", strerror(*status))]
    PoolCreate { pool: String, status: i32 },
    #[error("cluster session is not connected")]
    NotConnected,
    #[error("cluster session used after shutdown")]
    UseAfterShutdown,
}

impl ConnectError {
    /// Store status behind this error, if the store produced one
    pub fn status(&self) -> Option<i32> {
        match self {
            ConnectError::Init { status }
            | ConnectError::Connect { status }
            | ConnectError::PoolOpen { status, .. }
            | ConnectError::PoolCreate { status, .. } => Some(*status),
            ConnectError::NotConnected => Some(status::ENOTCONN),
            ConnectError::UseAfterShutdown => Some(status::ESHUTDOWN),
        }
    }
}

/// Bad config file, argument list, URI token or settings value
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    #[error("Cannot read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("{}:{line}: malformed config line", path.display())]
    Parse { path: PathBuf, line: usize },
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
    #[error("Unknown parameter: {0}")]
    UnknownParameter(String),
    #[error("Invalid value for {key}: {value}")]
    InvalidValue { key: String, value: String },
    #[error("cluster session used after shutdown")]
    UseAfterShutdown,
}

/// Object-level failures from the gateway
#[derive(Debug, Clone, thiserror::Error)]
pub enum ObjectError {
    #[error("object {oid} not found")]
    NotFound { oid: String },
    #[error("partial write of {oid}: {written} of {total} bytes landed: {} ({status})", strerror(*status))]
    PartialWrite {
        oid: String,
        written: u64,
        total: u64,
        status: i32,
    },
    #[error("{op}({oid}) failed: {} ({status})", strerror(*status))]
    Io {
        op: &'static str,
        oid: String,
        status: i32,
    },
}

impl ObjectError {
    /// Classify a store status for an operation on `oid`.
    ///
    /// `ENOENT` becomes [`ObjectError::NotFound`]; anything else is
    /// [`ObjectError::Io`].
    pub fn from_status(op: &'static str, oid: &str, status: i32) -> Self {
        if status == status::ENOENT {
            ObjectError::NotFound {
                oid: oid.to_string(),
            }
        } else {
            ObjectError::Io {
                op,
                oid: oid.to_string(),
                status,
            }
        }
    }

    /// Store status behind this error
    pub fn status(&self) -> i32 {
        match self {
            ObjectError::NotFound { .. } => status::ENOENT,
            ObjectError::PartialWrite { status, .. } | ObjectError::Io { status, .. } => *status,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ObjectError::NotFound { .. })
    }
}

/// Dictionary-level failures
///
/// A missing key is not an error: lookups return `None` and commits report
/// [`CommitOutcome::NotFound`](crate::dict::CommitOutcome::NotFound).
#[derive(Debug, Clone, thiserror::Error)]
pub enum DictError {
    #[error("dictionary request on {oid} failed: {} ({status})", strerror(*status))]
    Failed { oid: String, status: i32 },
    #[error("iterate flag {0} is not supported")]
    UnsupportedFlag(&'static str),
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Connect(#[from] ConnectError),
}

/// Local mail index failures
#[derive(Debug, Clone, thiserror::Error)]
pub enum IndexError {
    #[error("index database error: {0}")]
    Database(#[source] Arc<rusqlite::Error>),
    #[error("index migration failed: {0}")]
    Migration(String),
    #[error("index changed during sync: next_uid was {expected}, now {found}")]
    Conflict { expected: u32, found: u32 },
    #[error("invalid mailbox header: {0}")]
    CorruptHeader(String),
    #[error("UIDs were not assigned before commit")]
    UidsNotAssigned,
    #[error("invalid keyword list: {0}")]
    Keywords(#[source] Arc<serde_json::Error>),
}

impl From<rusqlite::Error> for IndexError {
    fn from(err: rusqlite::Error) -> Self {
        IndexError::Database(Arc::new(err))
    }
}

impl From<serde_json::Error> for IndexError {
    fn from(err: serde_json::Error) -> Self {
        IndexError::Keywords(Arc::new(err))
    }
}

impl From<rusqlite_migration::Error> for IndexError {
    fn from(err: rusqlite_migration::Error) -> Self {
        IndexError::Migration(err.to_string())
    }
}

/// Local staging, rename and publish failures in a save transaction
#[derive(Debug, Clone, thiserror::Error)]
pub enum SaveError {
    #[error("open({}) failed: file already exists", path.display())]
    AlreadyExists { path: PathBuf },
    #[error("{op}({}) failed: {source}", path.display())]
    Io {
        op: &'static str,
        path: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("rename({}, {}) failed: {source}", from.display(), to.display())]
    Rename {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: Arc<io::Error>,
    },
    #[error("save was cancelled")]
    Cancelled,
    #[error("publishing mail object failed: {0}")]
    Publish(#[source] ObjectError),
    #[error(transparent)]
    Index(#[from] IndexError),
    #[error("no mail is being saved")]
    NotStarted,
    #[error("save transaction is {state}, cannot {action}")]
    InvalidState {
        state: &'static str,
        action: &'static str,
    },
}

impl SaveError {
    pub(crate) fn io(op: &'static str, path: impl Into<PathBuf>, source: io::Error) -> Self {
        SaveError::Io {
            op,
            path: path.into(),
            source: Arc::new(source),
        }
    }
}
