use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::error::FmtpError;

/// A delay queue of product indexes, ordered by scheduled wake time.
///
/// `push` is non-blocking and never fails; a deadline earlier than the current
/// head supersedes the consumer's pending wait. Equal deadlines are popped in
/// insertion order. `pop` blocks until the earliest entry is due; after
/// `disable()` every current and future `pop` fails with
/// [`FmtpError::Disabled`].
///
/// The queue is written for a single consumer (the retention timer task); the
/// wake-up signal carries one stored permit.
pub struct ProductIndexDelayQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

struct Inner {
    heap: BinaryHeap<QueueEntry>,
    next_insertion: u64,
    disabled: bool,
}

struct QueueEntry {
    deadline: Instant,
    insertion: u64,
    prod_index: u32,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.insertion == other.insertion
    }
}
impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for QueueEntry {
    // inverted so the max-heap surfaces the earliest deadline; ties break by
    // insertion order
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.insertion.cmp(&self.insertion))
    }
}

impl Default for ProductIndexDelayQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl ProductIndexDelayQueue {
    pub fn new() -> ProductIndexDelayQueue {
        ProductIndexDelayQueue {
            inner: Mutex::new(Inner {
                heap: BinaryHeap::new(),
                next_insertion: 0,
                disabled: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Schedules `prod_index` to become due after `delay`.
    pub fn push(&self, prod_index: u32, delay: Duration) {
        let deadline = Instant::now() + delay;
        {
            let mut inner = self.inner.lock().expect("delay queue lock poisoned");
            let insertion = inner.next_insertion;
            inner.next_insertion += 1;
            inner.heap.push(QueueEntry {
                deadline,
                insertion,
                prod_index,
            });
            trace!("product #{prod_index} due in {delay:?}");
        }
        self.notify.notify_one();
    }

    /// Unblocks the consumer permanently.
    pub fn disable(&self) {
        self.inner.lock().expect("delay queue lock poisoned").disabled = true;
        debug!("product-index delay queue disabled");
        self.notify.notify_one();
    }

    /// Waits until the earliest entry is due, removes it and returns its
    /// product index.
    pub async fn pop(&self) -> Result<u32, FmtpError> {
        loop {
            let wait_until = {
                let mut inner = self.inner.lock().expect("delay queue lock poisoned");
                if inner.disabled {
                    return Err(FmtpError::Disabled);
                }
                let head_deadline = inner.heap.peek().map(|head| head.deadline);
                match head_deadline {
                    Some(deadline) if deadline <= Instant::now() => {
                        if let Some(due) = inner.heap.pop() {
                            trace!("product #{} is due", due.prod_index);
                            return Ok(due.prod_index);
                        }
                        None
                    }
                    other => other,
                }
            };

            match wait_until {
                // a later push may introduce an earlier head, so wake on
                // either the deadline or the signal and re-read
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = self.notify.notified() => {}
                    }
                }
                None => self.notify.notified().await,
            }
        }
    }
}
