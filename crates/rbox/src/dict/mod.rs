//! Key/value dictionary on map-objects
//!
//! Each user has a private map-object inside the user's namespace; keys
//! under `shared/` live in a shared map-object in the pool's default
//! namespace instead. Values are stored with a trailing NUL so an empty
//! value and an absent key stay distinguishable.
//!
//! ```text
//! priv/quota/messages  ->  <pool>/<escaped user>/<oid>/<escaped user>
//! shared/expire/alice  ->  <pool>//<oid>/shared
//! ```

mod iterate;
mod transaction;
mod uri;

use std::collections::BTreeSet;
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use anyhow::Context;
use log::{debug, info, warn};

use crate::cluster::{
    ClusterDriver, ClusterSession, Namespace, NamespaceHandle, ObjectRef, escape_username, status,
};
use crate::config::StorageSettings;
use crate::error::{ConfigError, DictError};

pub use iterate::{DictIterator, IterateFlags};
pub use transaction::{CommitCallback, DictTransaction};
pub use uri::DictUri;

/// Prefix of keys kept in the shared map-object
pub const DICT_PATH_SHARED: &str = "shared/";
/// Conventional prefix of private keys
pub const DICT_PATH_PRIVATE: &str = "priv/";

/// Continuation for [`RadosDictionary::lookup_async`]
pub type LookupCallback = Box<dyn FnOnce(Result<Option<String>, DictError>) + Send + 'static>;

/// Result of a commit that reached the store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    /// Every mutation applied
    Ok,
    /// An atomic increment targeted a missing key; other mutations applied
    NotFound,
}

impl CommitOutcome {
    fn merge(self, other: CommitOutcome) -> CommitOutcome {
        if self == CommitOutcome::NotFound || other == CommitOutcome::NotFound {
            CommitOutcome::NotFound
        } else {
            CommitOutcome::Ok
        }
    }
}

/// Per-user dictionary settings supplied by the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictSettings {
    pub username: String,
}

/// Which map-object a key lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum Target {
    Private,
    Shared,
}

impl Target {
    pub(crate) fn for_key(key: &str) -> Self {
        if key.starts_with(DICT_PATH_SHARED) {
            Target::Shared
        } else {
            Target::Private
        }
    }
}

pub(crate) fn encode_value(value: &str) -> Vec<u8> {
    let mut raw = Vec::with_capacity(value.len() + 1);
    raw.extend_from_slice(value.as_bytes());
    raw.push(0);
    raw
}

pub(crate) fn decode_value(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(&[0]).unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

/// Counts async requests whose continuation has not run yet
#[derive(Default)]
pub(crate) struct InFlight {
    count: Mutex<usize>,
    idle: Condvar,
}

/// Held by an async request until its continuation has run
pub(crate) struct InFlightGuard(Arc<InFlight>);

impl InFlight {
    pub(crate) fn begin(self: &Arc<Self>) -> InFlightGuard {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner) += 1;
        InFlightGuard(Arc::clone(self))
    }

    fn pending(&self) -> usize {
        *self.count.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn wait_idle(&self) {
        let mut count = self.count.lock().unwrap_or_else(PoisonError::into_inner);
        while *count > 0 {
            count = self
                .idle
                .wait(count)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut count = self.0.count.lock().unwrap_or_else(PoisonError::into_inner);
        *count = count.saturating_sub(1);
        if *count == 0 {
            self.0.idle.notify_all();
        }
    }
}

/// Dictionary bound to one user's private map-object and the shared one
pub struct RadosDictionary {
    session: ClusterSession,
    private: NamespaceHandle,
    shared: NamespaceHandle,
    private_oid: String,
    shared_oid: String,
    username: String,
    inflight: Arc<InFlight>,
}

impl RadosDictionary {
    /// Initialise from a host URI: identity, config file, connect, pool.
    ///
    /// Every failure releases what was set up so far; a pool that cannot
    /// be opened shuts the fresh session down.
    pub fn init(
        uri: &str,
        settings: &DictSettings,
        driver: Arc<dyn ClusterDriver>,
    ) -> Result<Self, DictError> {
        debug!("dict init(uri={uri})");
        let uri = DictUri::parse(uri)?;

        let mut session = ClusterSession::init(&uri.cluster_user, &uri.cluster_name, 0, driver)?;
        if let Some(config) = &uri.config {
            session.load_config(config)?;
        }
        session.connect()?;

        Self::open(session, &uri.pool, &uri.oid, &settings.username)
    }

    /// Connect as `settings` describe and open the dictionary in
    /// `dict_pool` under the `dict_oid` base name
    pub fn from_settings(
        settings: &StorageSettings,
        username: &str,
        driver: Arc<dyn ClusterDriver>,
    ) -> anyhow::Result<Self> {
        let session = ClusterSession::from_settings(settings, driver)?;
        Self::open(session, &settings.dict_pool, &settings.dict_oid, username)
            .with_context(|| format!("Failed to open dictionary in pool {}", settings.dict_pool))
    }

    /// Bind a connected session to `pool`, using `oid` as the map-object
    /// base name
    pub fn open(
        mut session: ClusterSession,
        pool: &str,
        oid: &str,
        username: &str,
    ) -> Result<Self, DictError> {
        if username.is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "username".to_string(),
                value: String::new(),
            }
            .into());
        }

        let private = match session.open_namespace(pool, Namespace::for_user(username)) {
            Ok(handle) => handle,
            Err(err) => {
                if let Err(shutdown_err) = session.shutdown() {
                    warn!("shutdown after failed pool open: {shutdown_err}");
                }
                return Err(err.into());
            }
        };
        let shared = private.with_namespace(Namespace::shared());
        let escaped = escape_username(username);
        info!("dictionary {oid} opened in pool {pool} for {username}");

        Ok(Self {
            session,
            private,
            shared,
            private_oid: format!("{oid}/{escaped}"),
            shared_oid: format!("{oid}/shared"),
            username: username.to_string(),
            inflight: Arc::new(InFlight::default()),
        })
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn session(&self) -> &ClusterSession {
        &self.session
    }

    /// Address of the map-object holding keys for `target`
    pub(crate) fn map_object(&self, target: Target) -> (&NamespaceHandle, ObjectRef) {
        match target {
            Target::Private => (&self.private, self.private.object(&self.private_oid)),
            Target::Shared => (&self.shared, self.shared.object(&self.shared_oid)),
        }
    }

    pub(crate) fn inflight(&self) -> &Arc<InFlight> {
        &self.inflight
    }

    /// Look up one key with a single by-keys read
    pub fn lookup(&self, key: &str) -> Result<Option<String>, DictError> {
        let (handle, obj) = self.map_object(Target::for_key(key));
        let keys = BTreeSet::from([key.to_string()]);
        let result = handle.backend().omap_get_vals_by_keys(&obj, &keys);
        let value = lookup_result(key, &obj.oid, result)?;
        debug!("lookup({key}) -> {}", if value.is_some() { "hit" } else { "miss" });
        Ok(value)
    }

    /// Issue a lookup; `callback` runs later on the store's delivery thread
    pub fn lookup_async(&self, key: &str, callback: LookupCallback) {
        let (handle, obj) = self.map_object(Target::for_key(key));
        let guard = self.inflight.begin();
        let key = key.to_string();
        let oid = obj.oid.clone();
        handle.backend().aio_omap_get_vals_by_keys(
            obj,
            BTreeSet::from([key.clone()]),
            Box::new(move |result| {
                callback(lookup_result(&key, &oid, result));
                drop(guard);
            }),
        );
    }

    pub fn transaction_begin(&self) -> DictTransaction<'_> {
        DictTransaction::new(self)
    }

    /// Number of async lookups and commits still in flight
    pub fn pending_requests(&self) -> usize {
        self.inflight.pending()
    }

    /// Block until every async lookup and commit has delivered its result
    pub fn wait_for_completions(&self) {
        self.inflight.wait_idle();
    }

    /// Drain async requests and shut the session down
    pub fn deinit(mut self) -> Result<(), DictError> {
        debug!("dict deinit");
        self.wait_for_completions();
        self.session.shutdown()?;
        Ok(())
    }
}

impl Drop for RadosDictionary {
    fn drop(&mut self) {
        self.wait_for_completions();
    }
}

fn lookup_result(
    key: &str,
    oid: &str,
    result: Result<std::collections::BTreeMap<String, Vec<u8>>, i32>,
) -> Result<Option<String>, DictError> {
    match result {
        Ok(values) => Ok(values.get(key).map(|raw| decode_value(raw))),
        Err(status::ENOENT) => Ok(None),
        Err(status) => Err(DictError::Failed {
            oid: oid.to_string(),
            status,
        }),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;

    use super::*;
    use crate::cluster::MemoryCluster;
    use crate::error::ConnectError;

    pub(crate) fn open_dict(cluster: &MemoryCluster, username: &str) -> RadosDictionary {
        RadosDictionary::init(
            "oid=metadata:config=:pool=librmb",
            &DictSettings {
                username: username.to_string(),
            },
            Arc::new(cluster.clone()),
        )
        .unwrap()
    }

    #[test]
    fn test_value_terminator() {
        assert_eq!(encode_value(""), vec![0]);
        assert_eq!(decode_value(&[0]), "");
        assert_eq!(decode_value(b"abc\0"), "abc");
        // only one terminator is stripped
        assert_eq!(decode_value(b"abc\0\0"), "abc\0");
    }

    #[test]
    fn test_key_routing() {
        assert_eq!(Target::for_key("shared/expire/alice"), Target::Shared);
        assert_eq!(Target::for_key("priv/quota"), Target::Private);
        assert_eq!(Target::for_key("sharedx"), Target::Private);
    }

    #[test]
    fn test_lookup_on_empty_store() {
        let cluster = MemoryCluster::with_pools(&["librmb"]);
        let dict = open_dict(&cluster, "alice");
        assert_eq!(dict.lookup("priv/nothing").unwrap(), None);
        assert_eq!(dict.lookup("shared/nothing").unwrap(), None);
    }

    #[test]
    fn test_map_object_names() {
        let cluster = MemoryCluster::with_pools(&["librmb"]);
        let dict = open_dict(&cluster, "team/alice");

        let (_, private) = dict.map_object(Target::Private);
        assert_eq!(private.namespace, "team\\-alice");
        assert_eq!(private.oid, "metadata/team\\-alice");

        let (_, shared) = dict.map_object(Target::Shared);
        assert_eq!(shared.namespace, "");
        assert_eq!(shared.oid, "metadata/shared");
    }

    #[test]
    fn test_init_missing_pool_fails() {
        let cluster = MemoryCluster::new();
        let err = RadosDictionary::init(
            "config=:pool=absent",
            &DictSettings {
                username: "alice".to_string(),
            },
            Arc::new(cluster),
        )
        .err()
        .unwrap();
        assert!(matches!(
            err,
            DictError::Connect(ConnectError::PoolOpen { .. })
        ));
    }

    #[test]
    fn test_init_unknown_parameter() {
        let cluster = MemoryCluster::with_pools(&["librmb"]);
        let err = RadosDictionary::init(
            "config=:bogus=1",
            &DictSettings {
                username: "alice".to_string(),
            },
            Arc::new(cluster),
        )
        .err()
        .unwrap();
        assert_eq!(err.to_string(), "Unknown parameter: bogus=1");
    }

    #[test]
    fn test_init_connect_refused() {
        let cluster = MemoryCluster::with_pools(&["librmb"]);
        cluster.refuse_connect(status::ETIMEDOUT);
        let err = RadosDictionary::init(
            "config=",
            &DictSettings {
                username: "alice".to_string(),
            },
            Arc::new(cluster),
        )
        .err()
        .unwrap();
        assert!(err.to_string().starts_with("Cannot connect to cluster"));
    }

    #[test]
    fn test_empty_username_rejected() {
        let cluster = MemoryCluster::with_pools(&["librmb"]);
        let result = RadosDictionary::init(
            "config=",
            &DictSettings {
                username: String::new(),
            },
            Arc::new(cluster),
        );
        assert!(matches!(result, Err(DictError::Config(_))));
    }

    #[test]
    fn test_lookup_async_delivers_result() {
        let cluster = MemoryCluster::with_pools(&["librmb"]);
        let dict = open_dict(&cluster, "alice");

        let mut tx = dict.transaction_begin();
        tx.set("priv/k", "v");
        tx.commit().unwrap();

        let (sender, receiver) = mpsc::channel();
        dict.lookup_async(
            "priv/k",
            Box::new(move |result| {
                sender.send(result).unwrap();
            }),
        );
        dict.wait_for_completions();
        assert_eq!(dict.pending_requests(), 0);
        assert_eq!(receiver.recv().unwrap().unwrap(), Some("v".to_string()));
    }

    #[test]
    fn test_deinit_shuts_session_down() {
        let cluster = MemoryCluster::with_pools(&["librmb"]);
        let dict = open_dict(&cluster, "alice");
        let handle = dict.private.clone();
        dict.deinit().unwrap();
        assert_eq!(handle.backend().pool_exists("librmb"), Err(status::ESHUTDOWN));
    }
}
