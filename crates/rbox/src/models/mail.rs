//! Mail records in the index and per-save options

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::MailFlags;

/// Options for one mail being saved
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MailSaveData {
    pub flags: MailFlags,
    pub keywords: Vec<String>,
    /// Lower bound for the modseq the mail gets
    pub min_modseq: u64,
    /// Explicit receive time; the file's mtime is set to it
    pub received_date: Option<DateTime<Utc>>,
}

/// One committed mail in the index
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailRecord {
    pub uid: u32,
    pub flags: MailFlags,
    pub keywords: Vec<String>,
    pub modseq: u64,
    /// Object id of the published copy, when the mailbox publishes remotely
    pub oid: Option<String>,
    pub size: u64,
    pub received: Option<DateTime<Utc>>,
}

/// A mail made visible by a committed save transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SavedMail {
    pub uid: u32,
    pub path: PathBuf,
    pub oid: Option<String>,
    pub size: u64,
}
