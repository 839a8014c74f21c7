//! Mailbox identity and index header

use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// 16-byte globally unique mailbox id; all zeroes means "not assigned"
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MailboxGuid([u8; 16]);

impl MailboxGuid {
    pub fn generate() -> Self {
        Self(Uuid::new_v4().into_bytes())
    }

    /// `None` unless `bytes` is exactly 16 bytes long
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 16]>::try_from(bytes).ok().map(Self)
    }

    pub fn as_bytes(&self) -> &[u8; 16] {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == [0; 16]
    }
}

impl fmt::Display for MailboxGuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", Uuid::from_bytes(self.0).simple())
    }
}

/// Fixed-size header kept in the mailbox index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MailboxHeader {
    pub uid_validity: u32,
    /// Lowest UID not yet assigned
    pub next_uid: u32,
    pub highest_modseq: u64,
    pub guid: MailboxGuid,
    /// Bumped every time the mailbox is found corrupted and rebuilt
    pub rebuild_count: u32,
}

impl Default for MailboxHeader {
    fn default() -> Self {
        Self {
            uid_validity: 0,
            next_uid: 1,
            highest_modseq: 0,
            guid: MailboxGuid::default(),
            rebuild_count: 0,
        }
    }
}
