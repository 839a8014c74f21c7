use std::path::PathBuf;

use crate::error::ConfigError;

/// Parsed dictionary URI: colon-separated `key=value` tokens
///
/// Recognised keys are `oid`, `config`, `pool`, `cluster_name` and
/// `cluster_user`. An empty `config=` skips reading a config file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DictUri {
    pub oid: String,
    pub config: Option<PathBuf>,
    pub pool: String,
    pub cluster_name: String,
    pub cluster_user: String,
}

impl Default for DictUri {
    fn default() -> Self {
        Self {
            oid: "metadata".to_string(),
            config: Some(PathBuf::from("/etc/ceph/ceph.conf")),
            pool: "librmb".to_string(),
            cluster_name: "ceph".to_string(),
            cluster_user: "client.admin".to_string(),
        }
    }
}

impl DictUri {
    pub fn parse(uri: &str) -> Result<Self, ConfigError> {
        let mut parsed = Self::default();

        for token in uri.split(':').filter(|t| !t.is_empty()) {
            let Some((key, value)) = token.split_once('=') else {
                return Err(ConfigError::UnknownParameter(token.to_string()));
            };
            match key {
                "oid" => parsed.oid = value.to_string(),
                "config" => {
                    parsed.config = (!value.is_empty()).then(|| PathBuf::from(value));
                }
                "pool" => parsed.pool = value.to_string(),
                "cluster_name" => parsed.cluster_name = value.to_string(),
                "cluster_user" => parsed.cluster_user = value.to_string(),
                _ => return Err(ConfigError::UnknownParameter(token.to_string())),
            }
        }

        for (key, value) in [
            ("oid", &parsed.oid),
            ("pool", &parsed.pool),
            ("cluster_name", &parsed.cluster_name),
            ("cluster_user", &parsed.cluster_user),
        ] {
            if value.is_empty() {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    value: String::new(),
                });
            }
        }

        Ok(parsed)
    }
}
