//! Object addressing and compound write operations
//!
//! A [`WriteOperation`] is an ordered batch of [`WriteOp`]s sent to one
//! object in a single request. The store applies the ops in order and
//! reports one status per op in the [`OpReply`]; a failing op does not
//! undo the ops before it.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};

use super::status;

/// Object class providing server-side helpers for mail storage
pub const RMB_CLASS: &str = "rmb";
/// `rmb` method that adds a signed delta to a numeric map-object value
pub const RMB_ATOMIC_INC: &str = "atomic_inc";

/// Fully qualified address of one object: (pool, namespace, oid)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectRef {
    pub pool: String,
    pub namespace: String,
    pub oid: String,
}

impl ObjectRef {
    pub fn new(
        pool: impl Into<String>,
        namespace: impl Into<String>,
        oid: impl Into<String>,
    ) -> Self {
        Self {
            pool: pool.into(),
            namespace: namespace.into(),
            oid: oid.into(),
        }
    }
}

/// Size and modification time of a stored object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectStat {
    pub size: u64,
    pub mtime: DateTime<Utc>,
}

/// One mutation inside a compound write request
#[derive(Debug, Clone, PartialEq)]
pub enum WriteOp {
    /// Replace the whole payload (truncates)
    WriteFull(Vec<u8>),
    /// Write an extent at `offset`, extending the object as needed
    Write { offset: u64, data: Vec<u8> },
    /// Set one extended attribute
    SetXattr { name: String, value: Vec<u8> },
    /// Set map-object fields
    OmapSet(BTreeMap<String, Vec<u8>>),
    /// Remove map-object fields
    OmapRmKeys(Vec<String>),
    /// Run an object-class method on the server
    Exec {
        class: String,
        method: String,
        input: Vec<u8>,
    },
}

impl WriteOp {
    /// Whether applying this op may create a missing object
    pub fn creates_object(&self) -> bool {
        matches!(
            self,
            WriteOp::WriteFull(_)
                | WriteOp::Write { .. }
                | WriteOp::SetXattr { .. }
                | WriteOp::OmapSet(_)
        )
    }

    /// Payload bytes carried by a data write, zero for everything else
    pub fn data_len(&self) -> u64 {
        match self {
            WriteOp::WriteFull(data) | WriteOp::Write { data, .. } => data.len() as u64,
            _ => 0,
        }
    }

    pub fn is_data_write(&self) -> bool {
        matches!(self, WriteOp::WriteFull(_) | WriteOp::Write { .. })
    }
}

/// Ordered batch of ops applied to one object in one request
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteOperation {
    ops: Vec<WriteOp>,
}

impl WriteOperation {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_full(mut self, data: Vec<u8>) -> Self {
        self.ops.push(WriteOp::WriteFull(data));
        self
    }

    pub fn write(mut self, offset: u64, data: Vec<u8>) -> Self {
        self.ops.push(WriteOp::Write { offset, data });
        self
    }

    pub fn set_xattr(mut self, name: impl Into<String>, value: Vec<u8>) -> Self {
        self.ops.push(WriteOp::SetXattr {
            name: name.into(),
            value,
        });
        self
    }

    pub fn push(&mut self, op: WriteOp) {
        self.ops.push(op);
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}

/// Per-op results of a compound write, in op order
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpReply {
    pub statuses: Vec<i32>,
}

impl OpReply {
    /// Index and status of the first failing op
    pub fn first_error(&self) -> Option<(usize, i32)> {
        self.statuses
            .iter()
            .enumerate()
            .find(|(_, s)| **s != 0)
            .map(|(i, s)| (i, *s))
    }
}

/// Encode the input of `rmb.atomic_inc`: `"<key>;<delta>\0"`
pub fn encode_atomic_inc(key: &str, delta: i64) -> Vec<u8> {
    let mut input = format!("{key};{delta}").into_bytes();
    input.push(0);
    input
}

/// Decode the input of `rmb.atomic_inc` into (key, delta)
///
/// The key may itself contain `;`, so the delta is taken after the last one.
pub fn decode_atomic_inc(input: &[u8]) -> Result<(String, i64), i32> {
    let input = input.strip_suffix(&[0]).unwrap_or(input);
    let text = std::str::from_utf8(input).map_err(|_| status::EINVAL)?;
    let (key, delta) = text.rsplit_once(';').ok_or(status::EINVAL)?;
    let delta = delta.parse::<i64>().map_err(|_| status::EINVAL)?;
    Ok((key.to_string(), delta))
}

/// Apply an increment to a stored numeric value.
///
/// Stored values use the dictionary's trailing-NUL convention; the result
/// is written back the same way.
pub fn apply_increment(current: &[u8], delta: i64) -> Result<Vec<u8>, i32> {
    let current = current.strip_suffix(&[0]).unwrap_or(current);
    let text = std::str::from_utf8(current).map_err(|_| status::EINVAL)?;
    let value = if text.trim().is_empty() {
        0
    } else {
        text.trim().parse::<i64>().map_err(|_| status::EINVAL)?
    };
    let next = value.checked_add(delta).ok_or(status::ERANGE)?;
    let mut out = next.to_string().into_bytes();
    out.push(0);
    Ok(out)
}
