use std::sync::Arc;

use crate::message::{LockId, Message, MessageId, StoredMessage};
use crate::Result;

/// Predicate a cursor applies to each candidate message.
///
/// An `Err` means the message could not be evaluated. Cursors log it and skip
/// the candidate.
pub trait MessageFilter: Send + Sync {
    fn filter_matches(&self, message: &StoredMessage) -> Result<bool>;
}

impl<F> MessageFilter for F
where
    F: Fn(&StoredMessage) -> Result<bool> + Send + Sync,
{
    fn filter_matches(&self, message: &StoredMessage) -> Result<bool> {
        self(message)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl MessageFilter for AcceptAll {
    fn filter_matches(&self, _message: &StoredMessage) -> Result<bool> {
        Ok(true)
    }
}

/// A message locked on behalf of one consumer key.
#[derive(Debug, Clone)]
pub struct LockedMessage {
    message: Arc<StoredMessage>,
    lock: LockId,
    unlock_count: u32,
}

impl LockedMessage {
    pub fn new(message: Arc<StoredMessage>, lock: LockId) -> Self {
        Self {
            message,
            lock,
            unlock_count: 0,
        }
    }

    pub fn with_unlock_count(mut self, unlock_count: u32) -> Self {
        self.unlock_count = unlock_count;
        self
    }

    /// How many times the message was unlocked before this lock was taken.
    pub fn unlock_count(&self) -> u32 {
        self.unlock_count
    }

    pub fn is_redelivered(&self) -> bool {
        self.unlock_count > 0
    }

    pub fn id(&self) -> MessageId {
        self.message.id()
    }

    pub fn lock_id(&self) -> LockId {
        self.lock
    }

    pub fn message(&self) -> &Arc<StoredMessage> {
        &self.message
    }
}

/// Filtered view over a store that locks matches as it hands them out.
pub trait LockableCursor: Send + Sync {
    fn lock_id(&self) -> LockId;

    /// Locks and returns the oldest available message passing both the cursor
    /// filter and `accept`. Never blocks; `Ok(None)` means nothing lockable now.
    fn next_locked_where(
        &self,
        accept: &dyn Fn(&StoredMessage) -> bool,
    ) -> Result<Option<LockedMessage>>;

    fn next_locked(&self) -> Result<Option<LockedMessage>> {
        self.next_locked_where(&|_| true)
    }
}

pub trait MessageStore: Send + Sync {
    fn put(&self, message: Message) -> Result<Arc<StoredMessage>>;

    fn new_cursor(
        &self,
        filter: Arc<dyn MessageFilter>,
        lock: LockId,
    ) -> Result<Box<dyn LockableCursor>>;

    fn allocate_lock_id(&self) -> LockId;

    /// Locks one specific message if it is still available.
    fn try_lock(&self, id: MessageId, lock: LockId) -> Result<Option<LockedMessage>>;

    /// Makes a locked message available again.
    fn unlock(&self, id: MessageId, lock: LockId) -> Result<()>;

    /// Deletes a locked message.
    fn remove(&self, id: MessageId, lock: LockId) -> Result<()>;

    fn available(&self) -> usize;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
