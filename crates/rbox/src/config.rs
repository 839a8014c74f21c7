//! Storage instance settings
//!
//! Loaded from (in order of priority):
//! 1. An explicit JSON file
//! 2. `~/.config/rbox/storage.json`
//! 3. Environment variables over built-in defaults

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Settings filename in the rbox config directory
pub const SETTINGS_FILE: &str = "storage.json";

/// When staged mail files are fsynced
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FsyncMode {
    /// Each mail as soon as it is finished
    Always,
    /// All staged mails together at commit, before any is renamed
    #[default]
    Optimized,
    /// Never; a crash may lose recently saved mail
    Never,
}

impl FsyncMode {
    /// Whether `save_finish` fsyncs the mail it just wrote
    pub fn syncs_each_mail(self) -> bool {
        matches!(self, FsyncMode::Always)
    }

    /// Whether commit fsyncs every staged mail in one pass
    pub fn syncs_at_commit(self) -> bool {
        matches!(self, FsyncMode::Optimized)
    }

    /// Whether the mailbox directory is fsynced after the renames
    pub fn syncs_directory(self) -> bool {
        !matches!(self, FsyncMode::Never)
    }
}

fn default_cluster_name() -> String {
    "ceph".to_string()
}

fn default_cluster_user() -> String {
    "client.admin".to_string()
}

fn default_config_path() -> PathBuf {
    PathBuf::from("/etc/ceph/ceph.conf")
}

fn default_pool() -> String {
    "mail_storage".to_string()
}

fn default_dict_pool() -> String {
    "librmb".to_string()
}

fn default_dict_oid() -> String {
    "metadata".to_string()
}

/// Settings of one storage instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_cluster_name")]
    pub cluster_name: String,
    #[serde(default = "default_cluster_user")]
    pub cluster_user: String,
    /// Cluster config file; skipped when it does not exist
    #[serde(default = "default_config_path")]
    pub config_path: PathBuf,
    /// Pool holding mail objects
    #[serde(default = "default_pool")]
    pub pool: String,
    /// Pool holding dictionary map-objects
    #[serde(default = "default_dict_pool")]
    pub dict_pool: String,
    /// Base name of the dictionary map-objects
    #[serde(default = "default_dict_oid")]
    pub dict_oid: String,
    /// Overrides the cluster's `osd_max_write_size` (MiB)
    #[serde(default)]
    pub max_write_size_mb: Option<u64>,
    #[serde(default)]
    pub fsync_mode: FsyncMode,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            cluster_name: default_cluster_name(),
            cluster_user: default_cluster_user(),
            config_path: default_config_path(),
            pool: default_pool(),
            dict_pool: default_dict_pool(),
            dict_oid: default_dict_oid(),
            max_write_size_mb: None,
            fsync_mode: FsyncMode::default(),
        }
    }
}

impl StorageSettings {
    /// Load settings using the priority order in the module docs
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        let settings = if let Some(path) = explicit {
            Self::from_file(path)?
        } else if let Some(settings) = ::config::load_json_optional::<Self>(SETTINGS_FILE)? {
            settings
        } else {
            Self::from_env()
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        ::config::load_json_file(path)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).context("Failed to parse storage settings JSON")
    }

    /// Defaults overridden by `RBOX_*` environment variables
    pub fn from_env() -> Self {
        Self::from_vars(|name| std::env::var(name).ok())
    }

    fn from_vars(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();
        if let Some(name) = var("RBOX_CLUSTER_NAME") {
            settings.cluster_name = name;
        }
        if let Some(user) = var("RBOX_CLUSTER_USER") {
            settings.cluster_user = user;
        }
        if let Some(pool) = var("RBOX_POOL") {
            settings.pool = pool;
        }
        if let Some(path) = var("RBOX_CONFIG") {
            settings.config_path = PathBuf::from(path);
        }
        settings
    }

    /// Save to `~/.config/rbox/storage.json`
    pub fn save(&self) -> Result<()> {
        ::config::save_json(SETTINGS_FILE, self)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cluster_name.is_empty() {
            bail!("cluster_name must not be empty");
        }
        if !self.cluster_user.contains('.') {
            bail!(
                "cluster_user must have the form type.id, got {:?}",
                self.cluster_user
            );
        }
        if self.pool.is_empty() || self.dict_pool.is_empty() || self.dict_oid.is_empty() {
            bail!("pool, dict_pool and dict_oid must not be empty");
        }
        if let Some(mb) = self.max_write_size_mb {
            let fits = mb
                .checked_mul(1024 * 1024)
                .is_some_and(|bytes| usize::try_from(bytes).is_ok());
            if mb == 0 || !fits {
                bail!("max_write_size_mb must be positive and fit in memory, got {mb}");
            }
        }
        Ok(())
    }
}
