//! Object I/O inside one namespace
//!
//! [`ObjectGateway`] turns logical object operations into store requests.
//! Payloads larger than the store's maximum single-write size are split into
//! extents written at increasing offsets. Asynchronous writes are tracked
//! as completions owned by the gateway until they are waited on or removed.
//!
//! The gateway never retries; statuses from the store surface verbatim.

use std::collections::BTreeMap;

use anyhow::Result;
use log::{debug, warn};

use super::completion::Completion;
use super::namespace::{Namespace, NamespaceHandle};
use super::op::{ObjectStat, OpReply, WriteOperation};
use super::session::ClusterSession;
use super::status;
use crate::config::StorageSettings;
use crate::error::ObjectError;

/// Identifies one asynchronous write issued through a gateway
pub type CompletionId = u64;

struct PendingWrite {
    id: CompletionId,
    oid: String,
    completion: Completion<OpReply>,
}

/// Per-namespace object I/O
pub struct ObjectGateway {
    handle: NamespaceHandle,
    max_write_size: usize,
    pending: Vec<PendingWrite>,
    next_id: CompletionId,
}

impl ObjectGateway {
    /// A gateway writing at most `max_write_size` bytes per op
    pub fn new(handle: NamespaceHandle, max_write_size: usize) -> Self {
        Self {
            handle,
            max_write_size: max_write_size.max(1),
            pending: Vec::new(),
            next_id: 1,
        }
    }

    /// Open `pool`/`namespace` on a connected session, sized by the
    /// session's `osd_max_write_size`
    pub fn from_session(session: &ClusterSession, pool: &str, namespace: Namespace) -> Result<Self> {
        let max_write_size = session.conf().max_write_size_bytes()?;
        let handle = session.open_namespace(pool, namespace)?;
        Ok(Self::new(handle, max_write_size))
    }

    /// Open `namespace` in the configured mail pool
    pub fn from_settings(
        session: &ClusterSession,
        settings: &StorageSettings,
        namespace: Namespace,
    ) -> Result<Self> {
        Self::from_session(session, &settings.pool, namespace)
    }

    pub fn handle(&self) -> &NamespaceHandle {
        &self.handle
    }

    pub fn max_write_size(&self) -> usize {
        self.max_write_size
    }

    /// Number of issued async writes not yet waited on
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Run one compound op; the first failing op's status wins
    fn submit(&self, oid: &str, op: &WriteOperation) -> Result<(), i32> {
        let reply = self.handle.backend().operate(&self.handle.object(oid), op)?;
        match reply.first_error() {
            Some((_, status)) => Err(status),
            None => Ok(()),
        }
    }

    /// Write ops covering `data` in extents of at most `max_write_size`
    fn chunked_ops(&self, data: &[u8]) -> Vec<WriteOperation> {
        if data.len() <= self.max_write_size {
            return vec![WriteOperation::new().write_full(data.to_vec())];
        }
        data.chunks(self.max_write_size)
            .enumerate()
            .map(|(i, chunk)| {
                if i == 0 {
                    WriteOperation::new().write_full(chunk.to_vec())
                } else {
                    let offset = (i * self.max_write_size) as u64;
                    WriteOperation::new().write(offset, chunk.to_vec())
                }
            })
            .collect()
    }

    pub fn read_object(&self, oid: &str) -> Result<Vec<u8>, ObjectError> {
        self.handle
            .backend()
            .read(&self.handle.object(oid))
            .map_err(|status| ObjectError::from_status("read", oid, status))
    }

    /// Replace the object's payload.
    ///
    /// Oversized payloads go out as one request per extent. If a later
    /// extent fails the object is left partially written and the error is
    /// [`ObjectError::PartialWrite`]; the caller must overwrite or delete
    /// it.
    pub fn write_object(&self, oid: &str, data: &[u8]) -> Result<(), ObjectError> {
        let ops = self.chunked_ops(data);
        let total = data.len() as u64;
        let chunks = ops.len();
        let mut written = 0u64;

        for (i, op) in ops.iter().enumerate() {
            if let Err(status) = self.submit(oid, op) {
                if i == 0 {
                    return Err(ObjectError::from_status("write", oid, status));
                }
                warn!("write of {oid} failed after {written} of {total} bytes");
                return Err(ObjectError::PartialWrite {
                    oid: oid.to_string(),
                    written,
                    total,
                    status,
                });
            }
            written += op.ops().iter().map(|o| o.data_len()).sum::<u64>();
        }

        debug!("wrote {oid}: {total} bytes in {chunks} chunk(s)");
        Ok(())
    }

    pub fn set_xattr(&self, oid: &str, name: &str, value: &[u8]) -> Result<(), ObjectError> {
        let op = WriteOperation::new().set_xattr(name, value.to_vec());
        self.submit(oid, &op)
            .map_err(|status| ObjectError::from_status("setxattr", oid, status))
    }

    pub fn get_xattrs(&self, oid: &str) -> Result<BTreeMap<String, Vec<u8>>, ObjectError> {
        self.handle
            .backend()
            .get_xattrs(&self.handle.object(oid))
            .map_err(|status| ObjectError::from_status("getxattrs", oid, status))
    }

    pub fn stat_object(&self, oid: &str) -> Result<ObjectStat, ObjectError> {
        self.handle
            .backend()
            .stat(&self.handle.object(oid))
            .map_err(|status| ObjectError::from_status("stat", oid, status))
    }

    /// Remove the object; a missing object counts as removed
    pub fn delete_object(&self, oid: &str) -> Result<(), ObjectError> {
        match self.handle.backend().remove(&self.handle.object(oid)) {
            Ok(()) => Ok(()),
            Err(status::ENOENT) => {
                debug!("delete of missing object {oid}");
                Ok(())
            }
            Err(status) => Err(ObjectError::from_status("remove", oid, status)),
        }
    }

    /// Object ids in this namespace, sorted
    pub fn list_objects(&self) -> Result<Vec<String>, ObjectError> {
        self.handle
            .backend()
            .list_objects(self.handle.pool(), self.handle.namespace().as_str())
            .map_err(|status| ObjectError::from_status("list", self.handle.pool(), status))
    }

    /// Objects whose xattr `name` equals `value`
    pub fn find_objects(&self, name: &str, value: &[u8]) -> Result<Vec<String>, ObjectError> {
        let mut found = Vec::new();
        for oid in self.list_objects()? {
            match self.get_xattrs(&oid) {
                Ok(xattrs) if xattrs.get(name).is_some_and(|v| v == value) => found.push(oid),
                Ok(_) => {}
                // removed between listing and lookup
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(found)
    }

    /// Issue a full-object write without waiting for it
    pub fn begin_async_write(&mut self, oid: &str, data: &[u8]) -> CompletionId {
        self.begin_async_write_with_xattrs(oid, data, &BTreeMap::new())
    }

    /// Issue a full-object write plus xattrs as one request.
    ///
    /// Oversized payloads become several extent ops inside the request.
    pub fn begin_async_write_with_xattrs(
        &mut self,
        oid: &str,
        data: &[u8],
        xattrs: &BTreeMap<String, Vec<u8>>,
    ) -> CompletionId {
        let mut op = WriteOperation::new();
        for chunk_op in self.chunked_ops(data) {
            for write_op in chunk_op.ops() {
                op.push(write_op.clone());
            }
        }
        for (name, value) in xattrs {
            op = op.set_xattr(name.as_str(), value.clone());
        }

        let id = self.next_id;
        self.next_id += 1;
        let (on_complete, completion) = Completion::new();
        self.handle
            .backend()
            .aio_operate(self.handle.object(oid), op, on_complete);
        debug!("issued async write {id} for {oid} ({} bytes)", data.len());

        self.pending.push(PendingWrite {
            id,
            oid: oid.to_string(),
            completion,
        });
        id
    }

    /// Whether the write has been acknowledged; unknown ids report `true`
    pub fn is_complete(&mut self, id: CompletionId) -> bool {
        self.pending
            .iter_mut()
            .find(|p| p.id == id)
            .is_none_or(|p| p.completion.is_complete())
    }

    fn resolve(pending: PendingWrite) -> Result<(), ObjectError> {
        let PendingWrite {
            id,
            oid,
            completion,
        } = pending;
        let status = match completion.wait() {
            Ok(reply) => reply.first_error().map(|(_, status)| status),
            Err(status) => Some(status),
        };
        match status {
            None => {
                debug!("async write {id} for {oid} acknowledged");
                Ok(())
            }
            Some(status) => Err(ObjectError::from_status("aio_write", &oid, status)),
        }
    }

    /// Block until the given write resolves. Unknown ids succeed.
    pub fn wait(&mut self, id: CompletionId) -> Result<(), ObjectError> {
        match self.pending.iter().position(|p| p.id == id) {
            Some(pos) => Self::resolve(self.pending.remove(pos)),
            None => Ok(()),
        }
    }

    /// Block until every outstanding write resolves; reports the first
    /// failure after all have been drained
    pub fn wait_all(&mut self) -> Result<(), ObjectError> {
        let mut first_err = None;
        for pending in std::mem::take(&mut self.pending) {
            if let Err(err) = Self::resolve(pending) {
                warn!("{err}");
                first_err.get_or_insert(err);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    /// Stop tracking a write. The write itself still runs to completion.
    pub fn remove_completion(&mut self, id: CompletionId) -> bool {
        let before = self.pending.len();
        self.pending.retain(|p| p.id != id);
        self.pending.len() != before
    }
}

impl Drop for ObjectGateway {
    fn drop(&mut self) {
        if !self.pending.is_empty() {
            debug!("draining {} async write(s)", self.pending.len());
            if let Err(err) = self.wait_all() {
                warn!("gateway dropped with a failed async write: {err}");
            }
        }
    }
}
