//! Ordered mailbox of pending inbound messages for one session.
//!
//! Producers append with [`MessageQueue::put`]; a single pump drains it with
//! [`MessageQueue::get`]. `canceltiles` handling needs to drop queued work
//! without disturbing the rest, which is what [`MessageQueue::remove_if`] is for.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;

/// One slot in the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEntry {
    /// A message for the session handler.
    Payload(String),
    /// End of stream. The pump stops after receiving it.
    Eof,
}

/// Thread-safe FIFO with blocking pop and filtered removal.
///
/// All operations take the same internal lock, so `remove_if` sees a
/// consistent backlog and never races a concurrent `put`.
#[derive(Debug, Default)]
pub struct MessageQueue {
    entries: Mutex<VecDeque<QueueEntry>>,
    available: Notify,
}

impl MessageQueue {
    /// Create an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message and wake one waiting consumer.
    pub fn put(&self, message: impl Into<String>) {
        self.push(QueueEntry::Payload(message.into()));
    }

    /// Append the end-of-stream sentinel.
    pub fn put_eof(&self) {
        self.push(QueueEntry::Eof);
    }

    /// Drop the backlog and append the sentinel in one step.
    ///
    /// Used at teardown; safe to call whether or not a pump is running.
    pub fn close(&self) {
        {
            let mut entries = self.lock();
            entries.clear();
            entries.push_back(QueueEntry::Eof);
        }
        self.available.notify_one();
    }

    /// Remove and return the head, waiting until an entry is available.
    pub async fn get(&self) -> QueueEntry {
        loop {
            // notify_one leaves a permit when nobody is waiting, so a put
            // landing between the check and the await still wakes us.
            let notified = self.available.notified();
            if let Some(entry) = self.lock().pop_front() {
                return entry;
            }
            notified.await;
        }
    }

    /// Remove and return the head without waiting.
    pub fn try_get(&self) -> Option<QueueEntry> {
        self.lock().pop_front()
    }

    /// Delete every pending payload matching `predicate`.
    ///
    /// Survivors keep their relative order. The sentinel is never removed.
    /// Returns the number of removed entries.
    pub fn remove_if<F>(&self, mut predicate: F) -> usize
    where
        F: FnMut(&str) -> bool,
    {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|entry| match entry {
            QueueEntry::Payload(message) => !predicate(message),
            QueueEntry::Eof => true,
        });
        before - entries.len()
    }

    /// Remove everything without waking consumers.
    pub fn clear(&self) {
        self.lock().clear();
    }

    /// Number of pending entries.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Copy of the pending payloads, head first.
    pub fn snapshot(&self) -> Vec<String> {
        self.lock()
            .iter()
            .filter_map(|entry| match entry {
                QueueEntry::Payload(message) => Some(message.clone()),
                QueueEntry::Eof => None,
            })
            .collect()
    }

    fn push(&self, entry: QueueEntry) {
        self.lock().push_back(entry);
        self.available.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<QueueEntry>> {
        // A panicking holder cannot leave the deque half-modified.
        self.entries
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
