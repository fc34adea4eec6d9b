//! A bounded single-producer, multi-consumer queue of [`WorkItem`]s.
//!
//! The queue is created with [`channel`], which returns the [`Producer`] and the consumer side
//! [`WorkQueue`]. The consumer side can be cloned and shared among any number of workers. Every
//! item is delivered to exactly one of them, whichever polls next.
//!
//! Dropping the producer closes the queue. Consumers keep draining whatever is still buffered, and
//! once the buffer is empty [`WorkQueue::recv`] returns `None` instead of waiting.

use std::fmt;
use std::sync::Arc;

use tokio::sync::{Mutex, mpsc};

/// Identifier of a single unit of work.
///
/// Items are derived from a 1-based sequence number and rendered as decimal strings, which also
/// serve as the object path in the remote repository.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkItem(String);

impl WorkItem {
    /// Creates the work item for the given sequence number.
    pub fn from_sequence(sequence: u64) -> Self {
        Self(sequence.to_string())
    }

    /// The object path this item refers to.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Returned by [`Producer::send`] once all consumers are gone.
#[derive(Debug, thiserror::Error)]
#[error("work queue has no consumers left")]
pub struct QueueClosed(pub WorkItem);

/// Creates a queue buffering at most `capacity` items.
///
/// A capacity of `0` is raised to `1`.
pub fn channel(capacity: usize) -> (Producer, WorkQueue) {
    let capacity = capacity.max(1);
    let (sender, receiver) = mpsc::channel(capacity);

    let producer = Producer { sender };
    let queue = WorkQueue {
        receiver: Arc::new(Mutex::new(receiver)),
        capacity,
    };

    (producer, queue)
}

/// The sending half of the queue.
#[derive(Debug)]
pub struct Producer {
    sender: mpsc::Sender<WorkItem>,
}

impl Producer {
    /// Enqueues an item, waiting while the buffer is full.
    pub async fn send(&self, item: WorkItem) -> Result<(), QueueClosed> {
        self.sender
            .send(item)
            .await
            .map_err(|mpsc::error::SendError(item)| QueueClosed(item))
    }

    /// Closes the queue. Buffered items can still be received.
    pub fn close(self) {
        drop(self)
    }
}

/// The receiving half of the queue, shared by all workers.
#[derive(Clone, Debug)]
pub struct WorkQueue {
    receiver: Arc<Mutex<mpsc::Receiver<WorkItem>>>,
    capacity: usize,
}

impl WorkQueue {
    /// Receives the next item, or `None` once the queue is closed and drained.
    ///
    /// This is cancel safe: if the returned future is dropped before completion, no item is lost.
    pub async fn recv(&self) -> Option<WorkItem> {
        self.receiver.lock().await.recv().await
    }

    /// The maximum number of buffered items.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}
