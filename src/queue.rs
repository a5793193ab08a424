use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;
use tracing::warn;

use crate::profile::ProfileBatch;

/// Batches buffered between the scheduler and the uploader.
pub(crate) const UPLOAD_QUEUE_CAPACITY: usize = 5;

/// Bounded FIFO of profile batches with drop-oldest eviction.
///
/// `push` never blocks: when the queue is full the oldest pending batch is
/// evicted to make room, so a stalled uploader can never back up into the
/// scheduler. The scheduler closes the queue exactly once on exit; `recv`
/// drains whatever is left and then returns `None`.
pub(crate) struct UploadQueue {
    state: Mutex<State>,
    notify: Notify,
    capacity: usize,
}

struct State {
    batches: VecDeque<ProfileBatch>,
    closed: bool,
}

impl UploadQueue {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            state: Mutex::new(State {
                batches: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Enqueues a batch, evicting the oldest entries if the queue is full.
    pub(crate) fn push(&self, batch: ProfileBatch) {
        {
            let mut state = self.state.lock().expect("upload queue mutex poisoned");
            if state.closed {
                return;
            }

            while state.batches.len() >= self.capacity {
                state.batches.pop_front();
                warn!("Upload queue is full. Evicting oldest profile batch to make room.");
            }

            state.batches.push_back(batch);
        }

        self.notify.notify_one();
    }

    /// Receives the oldest batch, waiting until one is available or the
    /// queue has been closed and drained.
    pub(crate) async fn recv(&self) -> Option<ProfileBatch> {
        loop {
            // Register for a wakeup before checking, so a push between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();

            {
                let mut state = self.state.lock().expect("upload queue mutex poisoned");
                if let Some(batch) = state.batches.pop_front() {
                    return Some(batch);
                }
                if state.closed {
                    return None;
                }
            }

            notified.await;
        }
    }

    /// Marks the queue closed and wakes any pending receiver.
    pub(crate) fn close(&self) {
        self.state
            .lock()
            .expect("upload queue mutex poisoned")
            .closed = true;
        self.notify.notify_waiters();
    }
}
