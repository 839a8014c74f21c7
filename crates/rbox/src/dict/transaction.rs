//! Batched dictionary mutations
//!
//! Mutations accumulate in memory and go out on commit as one compound
//! write per map-object touched. The store applies the ops of a request in
//! order and reports a status per op, so an increment of a missing key
//! fails on its own while the rest of the batch lands.

use std::collections::BTreeMap;
use std::mem;
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, info, warn};

use super::{CommitOutcome, InFlightGuard, RadosDictionary, Target, encode_value};
use crate::cluster::{ObjectRef, OpReply, RMB_ATOMIC_INC, RMB_CLASS, WriteOp, WriteOperation};
use crate::cluster::{encode_atomic_inc, status};
use crate::error::DictError;

/// Continuation for [`DictTransaction::commit_async`]
pub type CommitCallback = Box<dyn FnOnce(Result<CommitOutcome, DictError>) + Send + 'static>;

#[derive(Debug, Clone, PartialEq)]
enum Mutation {
    Set { key: String, value: String },
    Unset { key: String },
    AtomicInc { key: String, delta: i64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MutationKind {
    Set,
    Unset,
    AtomicInc,
}

impl Mutation {
    fn key(&self) -> &str {
        match self {
            Mutation::Set { key, .. } | Mutation::Unset { key } | Mutation::AtomicInc { key, .. } => {
                key
            }
        }
    }

    fn kind(&self) -> MutationKind {
        match self {
            Mutation::Set { .. } => MutationKind::Set,
            Mutation::Unset { .. } => MutationKind::Unset,
            Mutation::AtomicInc { .. } => MutationKind::AtomicInc,
        }
    }

    fn to_op(&self) -> WriteOp {
        match self {
            Mutation::Set { key, value } => {
                WriteOp::OmapSet(BTreeMap::from([(key.clone(), encode_value(value))]))
            }
            Mutation::Unset { key } => WriteOp::OmapRmKeys(vec![key.clone()]),
            // Server-side, so concurrent increments from different clients
            // cannot race.
            Mutation::AtomicInc { key, delta } => WriteOp::Exec {
                class: RMB_CLASS.to_string(),
                method: RMB_ATOMIC_INC.to_string(),
                input: encode_atomic_inc(key, *delta),
            },
        }
    }
}

/// One compound request against one map-object
struct Batch {
    target: Target,
    obj: ObjectRef,
    kinds: Vec<MutationKind>,
    op: WriteOperation,
}

/// Classify the per-op statuses of one batch
fn classify(
    oid: &str,
    kinds: &[MutationKind],
    result: Result<OpReply, i32>,
) -> Result<CommitOutcome, DictError> {
    let failed = |status| DictError::Failed {
        oid: oid.to_string(),
        status,
    };
    let reply = result.map_err(failed)?;

    let mut outcome = CommitOutcome::Ok;
    for (kind, code) in kinds.iter().zip(&reply.statuses) {
        match (kind, *code) {
            (_, 0) => {}
            (MutationKind::AtomicInc, status::ENOENT) => outcome = CommitOutcome::NotFound,
            // removing from a map-object that does not exist yet
            (MutationKind::Unset, status::ENOENT) => {}
            (_, code) => return Err(failed(code)),
        }
    }
    Ok(outcome)
}

fn merge(
    acc: Result<CommitOutcome, DictError>,
    next: Result<CommitOutcome, DictError>,
) -> Result<CommitOutcome, DictError> {
    match (acc, next) {
        (Err(err), _) | (Ok(_), Err(err)) => Err(err),
        (Ok(a), Ok(b)) => Ok(a.merge(b)),
    }
}

/// Pending batch of set/unset/increment mutations
///
/// Nothing is visible to readers until [`commit`](Self::commit). Dropping
/// the transaction discards it.
pub struct DictTransaction<'a> {
    dict: &'a RadosDictionary,
    mutations: Vec<Mutation>,
}

impl<'a> DictTransaction<'a> {
    pub(super) fn new(dict: &'a RadosDictionary) -> Self {
        Self {
            dict,
            mutations: Vec::new(),
        }
    }

    pub fn set(&mut self, key: &str, value: &str) {
        debug!("set({key})");
        self.mutations.push(Mutation::Set {
            key: key.to_string(),
            value: value.to_string(),
        });
    }

    pub fn unset(&mut self, key: &str) {
        debug!("unset({key})");
        self.mutations.push(Mutation::Unset {
            key: key.to_string(),
        });
    }

    /// Add `delta` to a numeric value on the server. The key must exist.
    pub fn atomic_inc(&mut self, key: &str, delta: i64) {
        debug!("atomic_inc({key}, {delta})");
        self.mutations.push(Mutation::AtomicInc {
            key: key.to_string(),
            delta,
        });
    }

    pub fn len(&self) -> usize {
        self.mutations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mutations.is_empty()
    }

    /// Group mutations per map-object, keeping their order
    fn batches(&self) -> Vec<Batch> {
        let mut grouped: BTreeMap<Target, (Vec<MutationKind>, WriteOperation)> = BTreeMap::new();
        for mutation in &self.mutations {
            let (kinds, op) = grouped.entry(Target::for_key(mutation.key())).or_default();
            kinds.push(mutation.kind());
            op.push(mutation.to_op());
        }

        grouped
            .into_iter()
            .map(|(target, (kinds, op))| Batch {
                target,
                obj: self.dict.map_object(target).1,
                kinds,
                op,
            })
            .collect()
    }

    /// Apply the batch and block until the store has answered
    pub fn commit(self) -> Result<CommitOutcome, DictError> {
        if self.is_empty() {
            debug!("commit of empty transaction");
            return Ok(CommitOutcome::Ok);
        }

        let mut result = Ok(CommitOutcome::Ok);
        for batch in self.batches() {
            let (handle, _) = self.dict.map_object(batch.target);
            let reply = handle.backend().operate(&batch.obj, &batch.op);
            result = merge(result, classify(&batch.obj.oid, &batch.kinds, reply));
            if result.is_err() {
                // later map-objects are left untouched
                break;
            }
        }

        match &result {
            Ok(outcome) => info!("committed {} mutation(s): {outcome:?}", self.len()),
            Err(err) => warn!("commit of {} mutation(s) failed: {err}", self.len()),
        }
        result
    }

    /// Issue the batch and return at once.
    ///
    /// `callback` runs exactly once, on the store's delivery thread, with
    /// the same classification [`commit`](Self::commit) would report. An
    /// empty batch calls it before returning.
    pub fn commit_async(self, callback: CommitCallback) {
        if self.is_empty() {
            callback(Ok(CommitOutcome::Ok));
            return;
        }

        let batches = self.batches();
        let joiner = Arc::new(Mutex::new(Joiner {
            remaining: batches.len(),
            result: Ok(CommitOutcome::Ok),
            callback: Some(callback),
            _guard: self.dict.inflight().begin(),
        }));
        debug!(
            "issuing async commit of {} mutation(s) in {} request(s)",
            self.len(),
            batches.len()
        );

        for Batch {
            target,
            obj,
            kinds,
            op,
        } in batches
        {
            let (handle, _) = self.dict.map_object(target);
            let joiner = Arc::clone(&joiner);
            let oid = obj.oid.clone();
            handle.backend().aio_operate(
                obj,
                op,
                Box::new(move |reply| {
                    let outcome = classify(&oid, &kinds, reply);
                    Joiner::deliver(&joiner, outcome);
                }),
            );
        }
    }

    /// Discard the batch without contacting the store
    pub fn rollback(self) {
        debug!("rollback of {} mutation(s)", self.len());
    }
}

/// Collects the replies of an async commit and fires the callback once
struct Joiner {
    remaining: usize,
    result: Result<CommitOutcome, DictError>,
    callback: Option<CommitCallback>,
    _guard: InFlightGuard,
}

impl Joiner {
    fn deliver(joiner: &Mutex<Joiner>, outcome: Result<CommitOutcome, DictError>) {
        let ready = {
            let mut state = joiner.lock().unwrap_or_else(PoisonError::into_inner);
            let acc = mem::replace(&mut state.result, Ok(CommitOutcome::Ok));
            state.result = merge(acc, outcome);
            state.remaining = state.remaining.saturating_sub(1);
            if state.remaining == 0 {
                state
                    .callback
                    .take()
                    .map(|cb| (cb, mem::replace(&mut state.result, Ok(CommitOutcome::Ok))))
            } else {
                None
            }
        };
        if let Some((callback, result)) = ready {
            callback(result);
        }
    }
}
