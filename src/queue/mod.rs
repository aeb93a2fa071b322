//! In-process FIFO of pending emails.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::types::EmailBox;

/// Unbounded FIFO of emails awaiting delivery.
///
/// Clones are handles to the same queue.
#[derive(Clone, Default)]
pub struct MailQueue {
    inner: Arc<Mutex<VecDeque<EmailBox>>>,
}

impl fmt::Debug for MailQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MailQueue").field("len", &self.len()).finish()
    }
}

impl MailQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, VecDeque<EmailBox>> {
        // A panic while holding the lock cannot leave the deque half-updated.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends an email.
    pub fn enqueue(&self, email: EmailBox) {
        self.lock().push_back(email);
    }

    /// Removes the oldest email, if any.
    pub fn try_dequeue(&self) -> Option<EmailBox> {
        self.lock().pop_front()
    }

    /// Number of pending emails.
    pub fn count(&self) -> usize {
        self.len()
    }

    /// Number of pending emails.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns true if nothing is pending.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
