//! Object state and write-op semantics shared by the shipped backends

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use log::debug;

use super::op::{self, ObjectStat, RMB_ATOMIC_INC, RMB_CLASS, WriteOp};
use super::status;

/// Everything the store keeps for one object
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct StoredObject {
    pub data: Vec<u8>,
    pub xattrs: BTreeMap<String, Vec<u8>>,
    pub omap: BTreeMap<String, Vec<u8>>,
    pub mtime: DateTime<Utc>,
}

impl StoredObject {
    fn empty(now: DateTime<Utc>) -> Self {
        Self {
            data: Vec::new(),
            xattrs: BTreeMap::new(),
            omap: BTreeMap::new(),
            mtime: now,
        }
    }

    pub fn stat(&self) -> ObjectStat {
        ObjectStat {
            size: self.data.len() as u64,
            mtime: self.mtime,
        }
    }
}

/// Apply one op to an object slot, creating the object when the op allows.
///
/// Returns the op's status. Ops that need an existing object report
/// `ENOENT` against an empty slot.
pub(crate) fn apply_write_op(
    slot: &mut Option<StoredObject>,
    op: &WriteOp,
    now: DateTime<Utc>,
) -> i32 {
    if slot.is_none() {
        if !op.creates_object() {
            return status::ENOENT;
        }
        *slot = Some(StoredObject::empty(now));
    }
    let Some(obj) = slot.as_mut() else {
        return status::ENOENT;
    };

    match op {
        WriteOp::WriteFull(data) => {
            obj.data = data.clone();
            obj.mtime = now;
        }
        WriteOp::Write { offset, data } => {
            let Ok(start) = usize::try_from(*offset) else {
                return status::EFBIG;
            };
            let Some(end) = start.checked_add(data.len()) else {
                return status::EINVAL;
            };
            if obj.data.len() < end {
                obj.data.resize(end, 0);
            }
            obj.data[start..end].copy_from_slice(data);
            obj.mtime = now;
        }
        WriteOp::SetXattr { name, value } => {
            obj.xattrs.insert(name.clone(), value.clone());
        }
        WriteOp::OmapSet(fields) => {
            obj.omap
                .extend(fields.iter().map(|(k, v)| (k.clone(), v.clone())));
        }
        WriteOp::OmapRmKeys(keys) => {
            for key in keys {
                obj.omap.remove(key);
            }
        }
        WriteOp::Exec {
            class,
            method,
            input,
        } => return exec_class_method(obj, class, method, input),
    }
    0
}

fn exec_class_method(obj: &mut StoredObject, class: &str, method: &str, input: &[u8]) -> i32 {
    if class != RMB_CLASS || method != RMB_ATOMIC_INC {
        return status::EOPNOTSUPP;
    }

    let (key, delta) = match op::decode_atomic_inc(input) {
        Ok(parsed) => parsed,
        Err(status) => return status,
    };
    let Some(current) = obj.omap.get(&key) else {
        debug!("atomic_inc: key {key} missing");
        return status::ENOENT;
    };
    match op::apply_increment(current, delta) {
        Ok(next) => {
            obj.omap.insert(key, next);
            0
        }
        Err(status) => status,
    }
}
