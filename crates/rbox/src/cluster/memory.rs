//! In-memory object store
//!
//! Emulates a cluster inside the process: pools, namespaces, objects with
//! extended attributes and map-object fields, and the `rmb` object class.
//! Used for tests and single-process deployments. Async requests complete
//! on a rayon worker, standing in for the transport's delivery thread.
//!
//! Fault injection hooks let tests refuse connects and fail a chosen data
//! write.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use chrono::Utc;
use log::{debug, info};

use super::backend::{ClusterDriver, ClusterIdentity, RadosBackend};
use super::completion::OnComplete;
use super::conf::ClusterConf;
use super::object::{StoredObject, apply_write_op};
use super::op::{ObjectRef, ObjectStat, OpReply, WriteOperation};
use super::status;

type ObjectKey = (String, String);

#[derive(Default)]
struct Faults {
    refuse_connect: Option<i32>,
    /// (successful data writes still allowed, status of the failing one)
    data_write_failure: Option<(u64, i32)>,
}

#[derive(Default)]
struct MemoryInner {
    /// pool -> (namespace, oid) -> object
    pools: RwLock<HashMap<String, HashMap<ObjectKey, StoredObject>>>,
    faults: Mutex<Faults>,
    requests: AtomicU64,
    data_writes: AtomicU64,
    connects: AtomicU64,
}

/// Request counters, for tests and diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClusterStats {
    /// Requests of any kind served
    pub requests: u64,
    /// Data-write ops (full or extent) attempted
    pub data_writes: u64,
    pub connects: u64,
}

/// An in-process cluster; clones share the same state
#[derive(Clone, Default)]
pub struct MemoryCluster {
    inner: Arc<MemoryInner>,
}

impl MemoryCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// A cluster with the given pools already created
    pub fn with_pools(pools: &[&str]) -> Self {
        let cluster = Self::new();
        {
            let mut map = cluster.write_pools();
            for pool in pools {
                map.entry(pool.to_string()).or_default();
            }
        }
        cluster
    }

    /// Make every following connect fail with `status`
    pub fn refuse_connect(&self, status: i32) {
        self.faults().refuse_connect = Some(status);
    }

    /// Let `successes` more data writes through, then fail the next one
    /// with `status`. The fault fires once.
    pub fn fail_data_write_after(&self, successes: u64, status: i32) {
        self.faults().data_write_failure = Some((successes, status));
    }

    pub fn stats(&self) -> ClusterStats {
        ClusterStats {
            requests: self.inner.requests.load(Ordering::SeqCst),
            data_writes: self.inner.data_writes.load(Ordering::SeqCst),
            connects: self.inner.connects.load(Ordering::SeqCst),
        }
    }

    fn faults(&self) -> std::sync::MutexGuard<'_, Faults> {
        self.inner
            .faults
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_pools(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<String, HashMap<ObjectKey, StoredObject>>> {
        self.inner
            .pools
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_pools(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<String, HashMap<ObjectKey, StoredObject>>> {
        self.inner
            .pools
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Consume the data-write fault if it is due
    fn take_data_write_fault(&self) -> Option<i32> {
        let mut faults = self.faults();
        match faults.data_write_failure {
            Some((0, status)) => {
                faults.data_write_failure = None;
                Some(status)
            }
            Some((n, status)) => {
                faults.data_write_failure = Some((n - 1, status));
                None
            }
            None => None,
        }
    }

    fn with_object<T>(
        &self,
        obj: &ObjectRef,
        f: impl FnOnce(&StoredObject) -> T,
    ) -> Result<T, i32> {
        self.inner.requests.fetch_add(1, Ordering::SeqCst);
        let pools = self.read_pools();
        let pool = pools.get(&obj.pool).ok_or(status::ENOENT)?;
        let stored = pool
            .get(&(obj.namespace.clone(), obj.oid.clone()))
            .ok_or(status::ENOENT)?;
        Ok(f(stored))
    }

    fn operate(&self, obj: &ObjectRef, op: &WriteOperation) -> Result<OpReply, i32> {
        self.inner.requests.fetch_add(1, Ordering::SeqCst);
        let mut pools = self.write_pools();
        let pool = pools.get_mut(&obj.pool).ok_or(status::ENOENT)?;
        let key = (obj.namespace.clone(), obj.oid.clone());

        let mut slot = pool.remove(&key);
        let now = Utc::now();
        let mut statuses = Vec::with_capacity(op.len());
        for write_op in op.ops() {
            if write_op.is_data_write() {
                self.inner.data_writes.fetch_add(1, Ordering::SeqCst);
                if let Some(status) = self.take_data_write_fault() {
                    debug!("injected failure {status} for {}", obj.oid);
                    statuses.push(status);
                    continue;
                }
            }
            statuses.push(apply_write_op(&mut slot, write_op, now));
        }
        if let Some(stored) = slot {
            pool.insert(key, stored);
        }

        Ok(OpReply { statuses })
    }
}

impl ClusterDriver for MemoryCluster {
    fn connect(
        &self,
        identity: &ClusterIdentity,
        _conf: &ClusterConf,
    ) -> Result<Arc<dyn RadosBackend>, i32> {
        if let Some(status) = self.faults().refuse_connect {
            return Err(status);
        }
        self.inner.connects.fetch_add(1, Ordering::SeqCst);
        info!(
            "memory cluster {}: {} connected",
            identity.cluster_name, identity.cluster_user
        );
        Ok(Arc::new(MemoryConnection {
            cluster: self.clone(),
            open: Arc::new(AtomicBool::new(true)),
        }))
    }
}

/// One client connection to a [`MemoryCluster`]
#[derive(Clone)]
struct MemoryConnection {
    cluster: MemoryCluster,
    open: Arc<AtomicBool>,
}

impl MemoryConnection {
    fn ensure_open(&self) -> Result<(), i32> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(status::ESHUTDOWN)
        }
    }
}

impl RadosBackend for MemoryConnection {
    fn pool_exists(&self, pool: &str) -> Result<bool, i32> {
        self.ensure_open()?;
        Ok(self.cluster.read_pools().contains_key(pool))
    }

    fn create_pool(&self, pool: &str) -> Result<(), i32> {
        self.ensure_open()?;
        let mut pools = self.cluster.write_pools();
        if pools.contains_key(pool) {
            return Err(status::EEXIST);
        }
        pools.insert(pool.to_string(), HashMap::new());
        Ok(())
    }

    fn read(&self, obj: &ObjectRef) -> Result<Vec<u8>, i32> {
        self.ensure_open()?;
        self.cluster.with_object(obj, |o| o.data.clone())
    }

    fn stat(&self, obj: &ObjectRef) -> Result<ObjectStat, i32> {
        self.ensure_open()?;
        self.cluster.with_object(obj, StoredObject::stat)
    }

    fn get_xattrs(&self, obj: &ObjectRef) -> Result<BTreeMap<String, Vec<u8>>, i32> {
        self.ensure_open()?;
        self.cluster.with_object(obj, |o| o.xattrs.clone())
    }

    fn remove(&self, obj: &ObjectRef) -> Result<(), i32> {
        self.ensure_open()?;
        self.cluster.inner.requests.fetch_add(1, Ordering::SeqCst);
        let mut pools = self.cluster.write_pools();
        let pool = pools.get_mut(&obj.pool).ok_or(status::ENOENT)?;
        pool.remove(&(obj.namespace.clone(), obj.oid.clone()))
            .map(|_| ())
            .ok_or(status::ENOENT)
    }

    fn list_objects(&self, pool: &str, namespace: &str) -> Result<Vec<String>, i32> {
        self.ensure_open()?;
        let pools = self.cluster.read_pools();
        let objects = pools.get(pool).ok_or(status::ENOENT)?;
        let mut oids: Vec<String> = objects
            .keys()
            .filter(|(ns, _)| ns == namespace)
            .map(|(_, oid)| oid.clone())
            .collect();
        oids.sort();
        Ok(oids)
    }

    fn omap_get_vals_by_keys(
        &self,
        obj: &ObjectRef,
        keys: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Vec<u8>>, i32> {
        self.ensure_open()?;
        self.cluster.with_object(obj, |o| {
            keys.iter()
                .filter_map(|k| o.omap.get(k).map(|v| (k.clone(), v.clone())))
                .collect()
        })
    }

    fn operate(&self, obj: &ObjectRef, op: &WriteOperation) -> Result<OpReply, i32> {
        self.ensure_open()?;
        self.cluster.operate(obj, op)
    }

    fn aio_operate(&self, obj: ObjectRef, op: WriteOperation, on_complete: OnComplete<OpReply>) {
        let conn = self.clone();
        rayon::spawn(move || on_complete(conn.operate(&obj, &op)));
    }

    fn aio_omap_get_vals_by_keys(
        &self,
        obj: ObjectRef,
        keys: BTreeSet<String>,
        on_complete: OnComplete<BTreeMap<String, Vec<u8>>>,
    ) {
        let conn = self.clone();
        rayon::spawn(move || on_complete(conn.omap_get_vals_by_keys(&obj, &keys)));
    }

    fn shutdown(&self) {
        self.open.store(false, Ordering::SeqCst);
    }
}
