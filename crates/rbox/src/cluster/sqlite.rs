//! SQLite-backed object store
//!
//! A durable single-node stand-in for the cluster. Each compound write runs
//! inside one SQLite transaction: the object is loaded, the ops are applied
//! with the same semantics as [`MemoryCluster`](super::MemoryCluster), and
//! the result is written back.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use log::{info, warn};
use rusqlite::{Connection, OptionalExtension, params};
use rusqlite_migration::{M, Migrations};

use super::backend::{ClusterDriver, ClusterIdentity, RadosBackend};
use super::completion::OnComplete;
use super::conf::ClusterConf;
use super::object::{StoredObject, apply_write_op};
use super::op::{ObjectRef, ObjectStat, OpReply, WriteOperation};
use super::status;

fn migrations() -> Migrations<'static> {
    Migrations::new(vec![M::up(
        r#"
        CREATE TABLE pools (
            name TEXT PRIMARY KEY
        );

        CREATE TABLE objects (
            pool TEXT NOT NULL,
            namespace TEXT NOT NULL,
            oid TEXT NOT NULL,
            data BLOB NOT NULL,
            mtime TEXT NOT NULL,
            PRIMARY KEY (pool, namespace, oid)
        );

        CREATE TABLE xattrs (
            pool TEXT NOT NULL,
            namespace TEXT NOT NULL,
            oid TEXT NOT NULL,
            name TEXT NOT NULL,
            value BLOB NOT NULL,
            PRIMARY KEY (pool, namespace, oid, name)
        );

        -- Map-object fields
        CREATE TABLE omap (
            pool TEXT NOT NULL,
            namespace TEXT NOT NULL,
            oid TEXT NOT NULL,
            key TEXT NOT NULL,
            value BLOB NOT NULL,
            PRIMARY KEY (pool, namespace, oid, key)
        );
        "#,
    )])
}

/// Store failures inside SQLite surface as `EIO`
fn db_status(err: rusqlite::Error) -> i32 {
    warn!("object store database error: {err}");
    status::EIO
}

struct SqliteInner {
    conn: Mutex<Connection>,
}

/// A cluster persisted in one SQLite database; clones share the connection
#[derive(Clone)]
pub struct SqliteCluster {
    inner: Arc<SqliteInner>,
}

impl SqliteCluster {
    /// Open or create the store at `db_path`
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref())
            .with_context(|| format!("Failed to open object store at {:?}", db_path.as_ref()))?;
        conn.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Self::with_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(mut conn: Connection) -> Result<Self> {
        migrations()
            .to_latest(&mut conn)
            .context("Failed to run object store migrations")?;
        Ok(Self {
            inner: Arc::new(SqliteInner {
                conn: Mutex::new(conn),
            }),
        })
    }

    /// Create `pool` if it does not exist yet
    pub fn ensure_pool(&self, pool: &str) -> Result<()> {
        self.conn()
            .execute("INSERT OR IGNORE INTO pools (name) VALUES (?)", [pool])?;
        Ok(())
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.inner.conn.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn pool_exists(conn: &Connection, pool: &str) -> rusqlite::Result<bool> {
    conn.query_row("SELECT 1 FROM pools WHERE name = ?", [pool], |_| Ok(()))
        .optional()
        .map(|row| row.is_some())
}

fn load_map(conn: &Connection, sql: &str, obj: &ObjectRef) -> rusqlite::Result<BTreeMap<String, Vec<u8>>> {
    let mut stmt = conn.prepare(sql)?;
    stmt.query_map(params![obj.pool, obj.namespace, obj.oid], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, Vec<u8>>(1)?))
    })?
    .collect()
}

fn load_object(conn: &Connection, obj: &ObjectRef) -> rusqlite::Result<Option<StoredObject>> {
    let row: Option<(Vec<u8>, String)> = conn
        .query_row(
            "SELECT data, mtime FROM objects WHERE pool = ? AND namespace = ? AND oid = ?",
            params![obj.pool, obj.namespace, obj.oid],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?;
    let Some((data, mtime)) = row else {
        return Ok(None);
    };

    let mtime = DateTime::parse_from_rfc3339(&mtime)
        .map(|t| t.with_timezone(&Utc))
        .unwrap_or_else(|_| Utc::now());
    let xattrs = load_map(
        conn,
        "SELECT name, value FROM xattrs WHERE pool = ? AND namespace = ? AND oid = ?",
        obj,
    )?;
    let omap = load_map(
        conn,
        "SELECT key, value FROM omap WHERE pool = ? AND namespace = ? AND oid = ?",
        obj,
    )?;

    Ok(Some(StoredObject {
        data,
        xattrs,
        omap,
        mtime,
    }))
}

fn delete_object(conn: &Connection, obj: &ObjectRef) -> rusqlite::Result<usize> {
    let key = params![obj.pool, obj.namespace, obj.oid];
    conn.execute(
        "DELETE FROM xattrs WHERE pool = ? AND namespace = ? AND oid = ?",
        key,
    )?;
    conn.execute(
        "DELETE FROM omap WHERE pool = ? AND namespace = ? AND oid = ?",
        key,
    )?;
    conn.execute(
        "DELETE FROM objects WHERE pool = ? AND namespace = ? AND oid = ?",
        key,
    )
}

fn store_object(conn: &Connection, obj: &ObjectRef, stored: &StoredObject) -> rusqlite::Result<()> {
    delete_object(conn, obj)?;
    conn.execute(
        "INSERT INTO objects (pool, namespace, oid, data, mtime) VALUES (?, ?, ?, ?, ?)",
        params![
            obj.pool,
            obj.namespace,
            obj.oid,
            stored.data,
            stored.mtime.to_rfc3339()
        ],
    )?;

    let mut xattr_stmt = conn.prepare(
        "INSERT INTO xattrs (pool, namespace, oid, name, value) VALUES (?, ?, ?, ?, ?)",
    )?;
    for (name, value) in &stored.xattrs {
        xattr_stmt.execute(params![obj.pool, obj.namespace, obj.oid, name, value])?;
    }

    let mut omap_stmt = conn.prepare(
        "INSERT INTO omap (pool, namespace, oid, key, value) VALUES (?, ?, ?, ?, ?)",
    )?;
    for (key, value) in &stored.omap {
        omap_stmt.execute(params![obj.pool, obj.namespace, obj.oid, key, value])?;
    }
    Ok(())
}

impl ClusterDriver for SqliteCluster {
    fn connect(
        &self,
        identity: &ClusterIdentity,
        _conf: &ClusterConf,
    ) -> Result<Arc<dyn RadosBackend>, i32> {
        info!(
            "sqlite cluster {}: {} connected",
            identity.cluster_name, identity.cluster_user
        );
        Ok(Arc::new(SqliteConnection {
            cluster: self.clone(),
            open: Arc::new(AtomicBool::new(true)),
        }))
    }
}

#[derive(Clone)]
struct SqliteConnection {
    cluster: SqliteCluster,
    open: Arc<AtomicBool>,
}

impl SqliteConnection {
    /// Run `f` on the connection once the client is known to be open and
    /// the object's pool exists
    fn with_pool<T>(
        &self,
        pool: &str,
        f: impl FnOnce(&mut Connection) -> rusqlite::Result<Result<T, i32>>,
    ) -> Result<T, i32> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(status::ESHUTDOWN);
        }
        let mut conn = self.cluster.conn();
        if !pool_exists(&conn, pool).map_err(db_status)? {
            return Err(status::ENOENT);
        }
        f(&mut *conn).map_err(db_status)?
    }

    fn with_object<T>(
        &self,
        obj: &ObjectRef,
        f: impl FnOnce(StoredObject) -> T,
    ) -> Result<T, i32> {
        self.with_pool(&obj.pool, |conn| {
            Ok(load_object(conn, obj)?.map(f).ok_or(status::ENOENT))
        })
    }
}

impl RadosBackend for SqliteConnection {
    fn pool_exists(&self, pool: &str) -> Result<bool, i32> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(status::ESHUTDOWN);
        }
        pool_exists(&self.cluster.conn(), pool).map_err(db_status)
    }

    fn create_pool(&self, pool: &str) -> Result<(), i32> {
        if self.pool_exists(pool)? {
            return Err(status::EEXIST);
        }
        self.cluster
            .conn()
            .execute("INSERT INTO pools (name) VALUES (?)", [pool])
            .map(|_| ())
            .map_err(db_status)
    }

    fn read(&self, obj: &ObjectRef) -> Result<Vec<u8>, i32> {
        self.with_object(obj, |o| o.data)
    }

    fn stat(&self, obj: &ObjectRef) -> Result<ObjectStat, i32> {
        self.with_object(obj, |o| o.stat())
    }

    fn get_xattrs(&self, obj: &ObjectRef) -> Result<BTreeMap<String, Vec<u8>>, i32> {
        self.with_object(obj, |o| o.xattrs)
    }

    fn remove(&self, obj: &ObjectRef) -> Result<(), i32> {
        self.with_pool(&obj.pool, |conn| {
            let tx = conn.transaction()?;
            let removed = delete_object(&tx, obj)?;
            tx.commit()?;
            Ok(if removed == 0 { Err(status::ENOENT) } else { Ok(()) })
        })
    }

    fn list_objects(&self, pool: &str, namespace: &str) -> Result<Vec<String>, i32> {
        self.with_pool(pool, |conn| {
            let mut stmt = conn
                .prepare("SELECT oid FROM objects WHERE pool = ? AND namespace = ? ORDER BY oid")?;
            let oids = stmt
                .query_map(params![pool, namespace], |row| row.get(0))?
                .collect::<rusqlite::Result<Vec<String>>>()?;
            Ok(Ok(oids))
        })
    }

    fn omap_get_vals_by_keys(
        &self,
        obj: &ObjectRef,
        keys: &BTreeSet<String>,
    ) -> Result<BTreeMap<String, Vec<u8>>, i32> {
        self.with_object(obj, |o| {
            o.omap
                .into_iter()
                .filter(|(k, _)| keys.contains(k))
                .collect()
        })
    }

    fn operate(&self, obj: &ObjectRef, op: &WriteOperation) -> Result<OpReply, i32> {
        self.with_pool(&obj.pool, |conn| {
            let tx = conn.transaction()?;
            let mut slot = load_object(&tx, obj)?;
            let now = Utc::now();
            let statuses = op
                .ops()
                .iter()
                .map(|write_op| apply_write_op(&mut slot, write_op, now))
                .collect();
            if let Some(stored) = &slot {
                store_object(&tx, obj, stored)?;
            }
            tx.commit()?;
            Ok(Ok(OpReply { statuses }))
        })
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
