//! Object store protocol seam
//!
//! [`RadosBackend`] is the store's native request surface as seen by one
//! connected client: object I/O, extended attributes, map-object fields and
//! server-side class methods, all addressed by [`ObjectRef`]. A
//! [`ClusterDriver`] produces a connected backend for a cluster identity;
//! [`ClusterSession`](super::ClusterSession) is the only caller.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use super::completion::OnComplete;
use super::conf::ClusterConf;
use super::op::{ObjectRef, ObjectStat, OpReply, WriteOperation};

/// Who connects to which cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterIdentity {
    /// Cluster name, e.g. `ceph`
    pub cluster_name: String,
    /// Authenticating entity in `type.id` form, e.g. `client.admin`
    pub cluster_user: String,
    pub flags: u64,
}

/// Produces connected backends; implemented once per store flavour
pub trait ClusterDriver: Send + Sync {
    /// Perform the connect handshake. Errors are store statuses.
    fn connect(
        &self,
        identity: &ClusterIdentity,
        conf: &ClusterConf,
    ) -> Result<Arc<dyn RadosBackend>, i32>;
}

/// One connected client of the object store
///
/// Synchronous methods block the calling thread for the round trip.
/// `aio_*` methods return once the request is issued and invoke the
/// continuation later, possibly from another thread.
pub trait RadosBackend: Send + Sync {
    fn pool_exists(&self, pool: &str) -> Result<bool, i32>;

    fn create_pool(&self, pool: &str) -> Result<(), i32>;

    /// Whole payload of an object
    fn read(&self, obj: &ObjectRef) -> Result<Vec<u8>, i32>;

    fn stat(&self, obj: &ObjectRef) -> Result<ObjectStat, i32>;

    fn get_xattrs(&self, obj: &ObjectRef) -> Result<BTreeMap<String, Vec<u8>>, i32>;

    fn remove(&self, obj: &ObjectRef) -> Result<(), i32>;

    /// Object ids in one (pool, namespace), sorted
    fn list_objects(&self, pool: &str, namespace: &str) -> Result<Vec<String>, i32>;

    /// Map-object fields restricted to `keys`; absent keys are omitted
    fn omap_get_vals_by_keys(
        &self,
        obj: &ObjectRef,
        keys: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Vec<u8>>, i32>;

    /// Apply a compound write. `Err` means the request as a whole was
    /// rejected and no op ran.
    fn operate(&self, obj: &ObjectRef, op: &WriteOperation) -> Result<OpReply, i32>;

    fn aio_operate(&self, obj: ObjectRef, op: WriteOperation, on_complete: OnComplete<OpReply>);

    fn aio_omap_get_vals_by_keys(
        &self,
        obj: ObjectRef,
        keys: BTreeSet<String>,
        on_complete: OnComplete<BTreeMap<String, Vec<u8>>>,
    );

    /// Tear down this client; later requests fail with `ESHUTDOWN`
    fn shutdown(&self);
}
