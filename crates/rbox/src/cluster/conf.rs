//! Cluster configuration: INI-style config files and `--key=value` args
//!
//! Keys are normalised so `osd max write size`, `osd-max-write-size` and
//! `osd_max_write_size` name the same option.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use crate::error::ConfigError;

/// Largest single write the store accepts, in MiB
pub const OPT_MAX_WRITE_SIZE: &str = "osd_max_write_size";
/// Default for [`OPT_MAX_WRITE_SIZE`]
pub const DEFAULT_MAX_WRITE_SIZE_MB: u64 = 90;

/// Merged cluster configuration options
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterConf {
    values: BTreeMap<String, String>,
}

fn normalize_key(key: &str) -> String {
    key.trim()
        .split(|c: char| c.is_whitespace() || c == '-' || c == '_')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join("_")
        .to_ascii_lowercase()
}

fn strip_value(raw: &str) -> &str {
    let raw = raw.trim();
    if let Some(quoted) = raw.strip_prefix('"').and_then(|r| r.strip_suffix('"')) {
        return quoted;
    }
    match raw.find(['#', ';']) {
        Some(pos) => raw[..pos].trim_end(),
        None => raw,
    }
}

impl ClusterConf {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(&normalize_key(key)).map(String::as_str)
    }

    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.values.insert(normalize_key(key), value.into());
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Merge options from a config file.
    ///
    /// Options outside any section, and in the `[global]`, `[client]` and
    /// `[<entity>]` sections, apply; other sections are skipped.
    pub fn read_file(&mut self, path: &Path, entity: &str) -> Result<(), ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            source: Arc::new(e),
        })?;
        self.merge_str(&content, entity)
            .map_err(|line| ConfigError::Parse {
                path: path.to_path_buf(),
                line,
            })
    }

    /// Merge config file text; on error returns the 1-based line number
    fn merge_str(&mut self, content: &str, entity: &str) -> Result<(), usize> {
        let mut applies = true;

        for (idx, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(section) = line.strip_prefix('[') {
                let section = section.strip_suffix(']').ok_or(idx + 1)?.trim();
                applies = section == "global" || section == "client" || section == entity;
                continue;
            }

            let (key, value) = line.split_once('=').ok_or(idx + 1)?;
            let key = normalize_key(key);
            if key.is_empty() {
                return Err(idx + 1);
            }
            if applies {
                self.values.insert(key, strip_value(value).to_string());
            }
        }

        Ok(())
    }

    /// Merge `--key=value` and `--key value` arguments
    pub fn parse_args<S: AsRef<str>>(&mut self, args: &[S]) -> Result<(), ConfigError> {
        let mut iter = args.iter().map(AsRef::as_ref);

        while let Some(arg) = iter.next() {
            let option = arg
                .strip_prefix("--")
                .filter(|o| !o.is_empty())
                .ok_or_else(|| ConfigError::InvalidArgument(arg.to_string()))?;

            let (key, value) = match option.split_once('=') {
                Some((key, value)) => (key, value.to_string()),
                None => {
                    let value = iter
                        .next()
                        .filter(|v| !v.starts_with("--"))
                        .ok_or_else(|| {
                            ConfigError::InvalidArgument(format!("{arg} requires a value"))
                        })?;
                    (option, value.to_string())
                }
            };
            self.set(key, value);
        }

        Ok(())
    }

    /// Maximum single-write size in bytes
    pub fn max_write_size_bytes(&self) -> Result<usize, ConfigError> {
        let Some(raw) = self.get(OPT_MAX_WRITE_SIZE) else {
            return Ok((DEFAULT_MAX_WRITE_SIZE_MB * 1024 * 1024) as usize);
        };
        raw.parse::<u64>()
            .ok()
            .filter(|mb| *mb > 0)
            .and_then(|mb| mb.checked_mul(1024 * 1024))
            .and_then(|bytes| usize::try_from(bytes).ok())
            .ok_or_else(|| ConfigError::InvalidValue {
                key: OPT_MAX_WRITE_SIZE.to_string(),
                value: raw.to_string(),
            })
    }
}
