//! Responses held back while the connection is down.
//!
//! At most one response is kept per response topic, i.e. per request. When
//! the buffer is full the oldest entry is dropped.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tracing::warn;

pub struct PendingResponses {
    capacity: usize,
    entries: Mutex<VecDeque<(String, Vec<u8>)>>,
}

impl PendingResponses {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Hold a response for later. A newer response for the same topic replaces the old one.
    pub fn insert(&self, topic: String, payload: Vec<u8>) {
        if self.capacity == 0 {
            warn!(topic = %topic, "Dropping response, pending buffer disabled");
            return;
        }

        let mut entries = self.entries.lock();
        if let Some(slot) = entries.iter_mut().find(|(t, _)| *t == topic) {
            slot.1 = payload;
            return;
        }
        if entries.len() >= self.capacity {
            if let Some((dropped, _)) = entries.pop_front() {
                warn!(topic = %dropped, "Pending response buffer full, dropping oldest");
            }
        }
        entries.push_back((topic, payload));
    }

    /// Re-queue a response that failed to flush, ahead of newer ones.
    pub fn requeue_front(&self, topic: String, payload: Vec<u8>) {
        let mut entries = self.entries.lock();
        if entries.iter().any(|(t, _)| *t == topic) {
            return;
        }
        if entries.len() >= self.capacity {
            return;
        }
        entries.push_front((topic, payload));
    }

    /// Take every held response, oldest first.
    pub fn take_all(&self) -> Vec<(String, Vec<u8>)> {
        self.entries.lock().drain(..).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}
