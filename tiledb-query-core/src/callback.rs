//! Completion callback (§4.7, `Query::async_process`).

use crate::status::Status;

/// Notified once when an asynchronously-submitted query reaches a
/// terminal or resumable status. Mirrors the teacher's
/// `set_callback`/`submit_async` pairing: the callback fires from
/// whatever thread `StorageManager::submit_async` ran the work on, so
/// implementations must be `Send`.
pub trait QueryCallback: Send {
    fn on_done(&self, status: Status);
}

impl<F: Fn(Status) + Send> QueryCallback for F {
    fn on_done(&self, status: Status) {
        self(status)
    }
}
