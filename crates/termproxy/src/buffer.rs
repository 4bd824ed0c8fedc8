use std::mem;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Byte accumulator shared between many producers and one draining consumer.
///
/// Producers hold the lock only while appending. The consumer takes the whole
/// contents in one step, so bytes appended before a drain are in that drain
/// and bytes appended afterwards are left for the next one.
#[derive(Default)]
pub struct SharedBuffer {
    bytes: Mutex<Vec<u8>>,
    ready: Notify,
}

impl SharedBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.bytes.lock().extend_from_slice(data);
        self.ready.notify_one();
    }

    /// Take everything accumulated so far, leaving the buffer empty.
    pub fn drain(&self) -> Vec<u8> {
        mem::take(&mut *self.bytes.lock())
    }

    pub fn len(&self) -> usize {
        self.bytes.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once an append has happened since the last wake-up.
    ///
    /// A wake-up stored while nobody was waiting is not lost, so
    /// drain-then-wait never sleeps through an append.
    pub async fn ready(&self) {
        self.ready.notified().await;
    }
}
