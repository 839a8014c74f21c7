//! Cluster session lifecycle
//!
//! A [`ClusterSession`] owns the identity, the merged configuration and,
//! once connected, the store client. It is the only way to obtain a
//! [`NamespaceHandle`]. Sessions are `Configured` until `connect` succeeds,
//! then `Connected`, and finally `Shutdown`; handles are only issued while
//! connected.

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use log::{debug, info, warn};

use super::backend::{ClusterDriver, ClusterIdentity, RadosBackend};
use super::conf::{ClusterConf, OPT_MAX_WRITE_SIZE};
use super::namespace::{Namespace, NamespaceHandle};
use super::status;
use crate::config::StorageSettings;
use crate::error::{ConfigError, ConnectError};

enum SessionState {
    Configured,
    Connected(Arc<dyn RadosBackend>),
    Shutdown,
}

impl SessionState {
    fn name(&self) -> &'static str {
        match self {
            SessionState::Configured => "configured",
            SessionState::Connected(_) => "connected",
            SessionState::Shutdown => "shutdown",
        }
    }
}

/// One live connection to the object store per storage instance
pub struct ClusterSession {
    identity: ClusterIdentity,
    conf: ClusterConf,
    driver: Arc<dyn ClusterDriver>,
    state: SessionState,
}

/// `type.id`, both parts non-empty
fn valid_entity(user: &str) -> bool {
    matches!(user.split_once('.'), Some((kind, id)) if !kind.is_empty() && !id.is_empty())
}

impl ClusterSession {
    /// Establish the cluster identity. Nothing is allocated on failure.
    pub fn init(
        cluster_user: &str,
        cluster_name: &str,
        flags: u64,
        driver: Arc<dyn ClusterDriver>,
    ) -> Result<Self, ConnectError> {
        if cluster_name.is_empty() || !valid_entity(cluster_user) {
            return Err(ConnectError::Init {
                status: status::EINVAL,
            });
        }
        debug!("cluster session for {cluster_user}@{cluster_name} created");

        Ok(Self {
            identity: ClusterIdentity {
                cluster_name: cluster_name.to_string(),
                cluster_user: cluster_user.to_string(),
                flags,
            },
            conf: ClusterConf::new(),
            driver,
            state: SessionState::Configured,
        })
    }

    /// Build and connect a session from storage settings.
    ///
    /// The cluster config file is read when it exists; a missing file
    /// leaves the defaults in place.
    pub fn from_settings(settings: &StorageSettings, driver: Arc<dyn ClusterDriver>) -> Result<Self> {
        let mut session = Self::init(&settings.cluster_user, &settings.cluster_name, 0, driver)?;

        if settings.config_path.exists() {
            session
                .load_config(&settings.config_path)
                .with_context(|| format!("Failed to load {:?}", settings.config_path))?;
        } else {
            debug!("cluster config {:?} not found, using defaults", settings.config_path);
        }
        if let Some(mb) = settings.max_write_size_mb {
            session.conf.set(OPT_MAX_WRITE_SIZE, mb.to_string());
        }

        session.connect()?;
        Ok(session)
    }

    pub fn identity(&self) -> &ClusterIdentity {
        &self.identity
    }

    pub fn is_connected(&self) -> bool {
        matches!(self.state, SessionState::Connected(_))
    }

    fn ensure_not_shutdown(&self) -> Result<(), ConfigError> {
        match self.state {
            SessionState::Shutdown => Err(ConfigError::UseAfterShutdown),
            _ => Ok(()),
        }
    }

    /// Merge a cluster config file
    pub fn load_config(&mut self, path: &Path) -> Result<(), ConfigError> {
        self.ensure_not_shutdown()?;
        self.conf.read_file(path, &self.identity.cluster_user)?;
        debug!("loaded cluster config {}", path.display());
        Ok(())
    }

    /// Merge `--key=value` style arguments
    pub fn apply_args<S: AsRef<str>>(&mut self, args: &[S]) -> Result<(), ConfigError> {
        self.ensure_not_shutdown()?;
        self.conf.parse_args(args)
    }

    /// Current value of a cluster option
    pub fn config_option(&self, key: &str) -> Result<Option<String>, ConfigError> {
        self.ensure_not_shutdown()?;
        Ok(self.conf.get(key).map(str::to_string))
    }

    pub fn conf(&self) -> &ClusterConf {
        &self.conf
    }

    /// Perform the connect handshake. Never retried here.
    pub fn connect(&mut self) -> Result<(), ConnectError> {
        match self.state {
            SessionState::Shutdown => return Err(ConnectError::UseAfterShutdown),
            SessionState::Connected(_) => {
                debug!("cluster session already connected");
                return Ok(());
            }
            SessionState::Configured => {}
        }

        let backend = self
            .driver
            .connect(&self.identity, &self.conf)
            .map_err(|status| ConnectError::Connect { status })?;
        info!(
            "connected to cluster {} as {}",
            self.identity.cluster_name, self.identity.cluster_user
        );
        self.state = SessionState::Connected(backend);
        Ok(())
    }

    fn backend(&self) -> Result<&Arc<dyn RadosBackend>, ConnectError> {
        match &self.state {
            SessionState::Connected(backend) => Ok(backend),
            SessionState::Configured => Err(ConnectError::NotConnected),
            SessionState::Shutdown => Err(ConnectError::UseAfterShutdown),
        }
    }

    /// Bind to `pool` and `namespace`. A failure leaves the session usable.
    pub fn open_namespace(
        &self,
        pool: &str,
        namespace: Namespace,
    ) -> Result<NamespaceHandle, ConnectError> {
        let backend = self.backend()?;
        match backend.pool_exists(pool) {
            Ok(true) => {}
            Ok(false) => {
                return Err(ConnectError::PoolOpen {
                    pool: pool.to_string(),
                    status: status::ENOENT,
                });
            }
            Err(status) => {
                return Err(ConnectError::PoolOpen {
                    pool: pool.to_string(),
                    status,
                });
            }
        }
        debug!("opened pool {pool} namespace '{namespace}'");
        Ok(NamespaceHandle::new(
            Arc::clone(backend),
            pool.to_string(),
            namespace,
        ))
    }

    pub fn create_pool(&self, pool: &str) -> Result<(), ConnectError> {
        self.backend()?
            .create_pool(pool)
            .map_err(|status| ConnectError::PoolCreate {
                pool: pool.to_string(),
                status,
            })?;
        info!("created pool {pool}");
        Ok(())
    }

    /// Release the session. Handles issued earlier stop working.
    pub fn shutdown(&mut self) -> Result<(), ConnectError> {
        let state = std::mem::replace(&mut self.state, SessionState::Shutdown);
        match state {
            SessionState::Shutdown => return Err(ConnectError::UseAfterShutdown),
            SessionState::Connected(backend) => backend.shutdown(),
            SessionState::Configured => {}
        }
        info!("cluster session {} shut down", self.identity.cluster_name);
        Ok(())
    }
}

impl Drop for ClusterSession {
    fn drop(&mut self) {
        if !matches!(self.state, SessionState::Shutdown) {
            debug!("dropping {} cluster session", self.state.name());
            if let Err(err) = self.shutdown() {
                warn!("cluster session shutdown failed: {err}");
            }
        }
    }
}
