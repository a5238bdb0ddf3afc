//! Update delivery queue: converged document text, session → presentation.
//!
//! The queue is bounded. When the presentation layer stops draining it the
//! dispatch task blocks on the next push, which in turn stops inbound message
//! processing instead of buffering without limit.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex};

pub(crate) type UpdateSender = mpsc::Sender<String>;

/// Read-only handle to the update queue.
///
/// Every clone shares the same underlying queue, so an update is seen by
/// exactly one reader. `recv` returns `None` once the session has terminated
/// and all buffered updates have been drained.
#[derive(Clone)]
pub struct UpdateStream {
    rx: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl UpdateStream {
    /// Next converged document snapshot.
    pub async fn recv(&self) -> Option<String> {
        self.rx.lock().await.recv().await
    }

    /// Whether two handles refer to the same queue.
    pub fn same_queue(&self, other: &UpdateStream) -> bool {
        Arc::ptr_eq(&self.rx, &other.rx)
    }
}

impl std::fmt::Debug for UpdateStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateStream").finish_non_exhaustive()
    }
}

/// Create a queue holding at most `capacity` undelivered updates.
pub(crate) fn channel(capacity: usize) -> (UpdateSender, UpdateStream) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    let stream = UpdateStream {
        rx: Arc::new(Mutex::new(rx)),
    };
    (tx, stream)
}
