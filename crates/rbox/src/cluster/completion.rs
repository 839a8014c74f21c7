//! Completions for asynchronous store requests
//!
//! An async request takes an [`OnComplete`] continuation. The store calls
//! it exactly once, from whatever thread delivers the reply; it must not
//! assume it runs on the issuing thread. [`Completion::new`] builds a
//! continuation that feeds a channel, giving the issuer a handle it can
//! poll or block on.

use std::sync::mpsc::{self, Receiver, TryRecvError};

use super::status;

/// Continuation invoked once with the store's reply or failure status
pub type OnComplete<T> = Box<dyn FnOnce(Result<T, i32>) + Send + 'static>;

/// Handle to an in-flight store request
///
/// Dropping the handle abandons the wait, not the request: an issued write
/// still runs to completion on the store.
pub struct Completion<T> {
    rx: Receiver<Result<T, i32>>,
    result: Option<Result<T, i32>>,
}

impl<T: Send + 'static> Completion<T> {
    /// Create a continuation/handle pair
    pub fn new() -> (OnComplete<T>, Self) {
        let (tx, rx) = mpsc::sync_channel(1);
        let on_complete: OnComplete<T> = Box::new(move |result| {
            // The handle may already be gone; the result is then discarded.
            let _ = tx.send(result);
        });
        (on_complete, Self { rx, result: None })
    }

    /// Check for the reply without blocking
    pub fn is_complete(&mut self) -> bool {
        if self.result.is_none() {
            match self.rx.try_recv() {
                Ok(result) => self.result = Some(result),
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => self.result = Some(Err(status::ECANCELED)),
            }
        }
        self.result.is_some()
    }

    /// Block the calling thread until the store acknowledges the request.
    ///
    /// A continuation dropped without being called resolves as
    /// `ECANCELED`.
    pub fn wait(mut self) -> Result<T, i32> {
        if let Some(result) = self.result.take() {
            return result;
        }
        self.rx.recv().unwrap_or(Err(status::ECANCELED))
    }
}
