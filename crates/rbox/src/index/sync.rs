use log::{debug, warn};

use super::{CommitResult, MailIndex};
use crate::models::MailboxHeader;

/// Exclusive write epoch on a mailbox index
///
/// Holds the index's sync lock from [`MailIndex::sync_begin`] until
/// [`finish`](Self::finish) or drop. Dropping an unfinished sync finishes it
/// as aborted.
pub struct IndexSync {
    index: MailIndex,
    header: MailboxHeader,
    commit_result: Option<CommitResult>,
    finished: bool,
}

impl IndexSync {
    pub(super) fn new(index: MailIndex, header: MailboxHeader) -> Self {
        debug!("index sync started at next_uid {}", header.next_uid);
        Self {
            index,
            header,
            commit_result: None,
            finished: false,
        }
    }

    /// Header as read when the lock was taken
    pub fn header(&self) -> &MailboxHeader {
        &self.header
    }

    /// UID watermark: the first UID this epoch may assign
    pub fn next_uid(&self) -> u32 {
        self.header.next_uid
    }

    pub fn uid_validity(&self) -> u32 {
        self.header.uid_validity
    }

    /// Remember the durable result of the index commit made in this epoch
    pub fn set_commit_result(&mut self, result: CommitResult) {
        self.header.next_uid = result.next_uid;
        self.header.highest_modseq = result.highest_modseq;
        self.commit_result = Some(result);
    }

    pub fn commit_result(&self) -> Option<&CommitResult> {
        self.commit_result.as_ref()
    }

    /// End the epoch and release the lock
    pub fn finish(mut self, success: bool) {
        self.release(success);
    }

    fn release(&mut self, success: bool) {
        if self.finished {
            return;
        }
        self.finished = true;
        if success {
            debug!("index sync finished at next_uid {}", self.header.next_uid);
        } else {
            warn!("index sync aborted");
        }
        self.index.release_sync();
    }
}

impl Drop for IndexSync {
    fn drop(&mut self) {
        self.release(false);
    }
}
