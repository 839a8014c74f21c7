//! Domain models for mailboxes and saved mail

mod flags;
mod mail;
mod mailbox;

pub use flags::MailFlags;
pub use mail::{MailRecord, MailSaveData, SavedMail};
pub use mailbox::{MailboxGuid, MailboxHeader};
