//! Object store access: sessions, namespaces and object I/O

mod backend;
mod completion;
mod conf;
mod gateway;
mod memory;
mod namespace;
mod object;
mod op;
mod session;
mod sqlite;
pub mod status;

pub use backend::{ClusterDriver, ClusterIdentity, RadosBackend};
pub use completion::{Completion, OnComplete};
pub use conf::{ClusterConf, DEFAULT_MAX_WRITE_SIZE_MB, OPT_MAX_WRITE_SIZE};
pub use gateway::{CompletionId, ObjectGateway};
pub use memory::{ClusterStats, MemoryCluster};
pub use namespace::{Namespace, NamespaceHandle, escape_username, unescape_username};
pub use op::{
    ObjectRef, ObjectStat, OpReply, RMB_ATOMIC_INC, RMB_CLASS, WriteOp, WriteOperation,
    apply_increment, decode_atomic_inc, encode_atomic_inc,
};
pub use session::ClusterSession;
pub use sqlite::SqliteCluster;
