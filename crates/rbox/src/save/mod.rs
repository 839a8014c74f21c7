//! Mail save pipeline
//!
//! Mails are staged into temporary files inside the mailbox directory and
//! become visible only when their [`SaveTransaction`] commits.

mod crlf;
mod mailbox;
mod tempname;
mod transaction;

pub use mailbox::{INDEX_FILE, Mailbox};
pub use tempname::TempNameGenerator;
pub use transaction::{SaveState, SaveTransaction};
