// In-memory lockable item stream backing a single destination.
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::cursor::{LockableCursor, LockedMessage, MessageFilter, MessageStore};
use crate::message::{LockId, Message, MessageId, StoredMessage};
use crate::{Result, StorageError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryState {
    Available,
    Locked(LockId),
}

#[derive(Debug)]
struct Entry {
    message: Arc<StoredMessage>,
    state: EntryState,
    unlock_count: u32,
}

#[derive(Debug, Default)]
struct StreamState {
    // Ordered by id so cursors see messages in arrival order.
    entries: BTreeMap<MessageId, Entry>,
    next_id: u64,
    available: usize,
    // Set once the stream is closed for failure; every later call errors.
    failure: Option<String>,
}

impl StreamState {
    fn check_open(&self) -> Result<()> {
        match &self.failure {
            Some(reason) => Err(StorageError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn lock_entry(&mut self, id: MessageId, lock: LockId) -> Option<LockedMessage> {
        let entry = self.entries.get_mut(&id)?;
        if entry.state != EntryState::Available {
            return None;
        }
        entry.state = EntryState::Locked(lock);
        self.available -= 1;
        Some(
            LockedMessage::new(Arc::clone(&entry.message), lock)
                .with_unlock_count(entry.unlock_count),
        )
    }
}

#[derive(Debug, Default)]
struct Shared {
    state: Mutex<StreamState>,
    next_lock: AtomicU64,
}

/// In-memory [`MessageStore`]. Clones share the same underlying stream.
///
/// ```
/// use bytes::Bytes;
/// use felix_storage::{AcceptAll, ItemStream, Message, MessageStore};
/// use std::sync::Arc;
///
/// let stream = ItemStream::new();
/// stream.put(Message::new(Bytes::from_static(b"a"))).expect("put");
/// let lock = stream.allocate_lock_id();
/// let cursor = stream.new_cursor(Arc::new(AcceptAll), lock).expect("cursor");
/// let locked = cursor.next_locked().expect("next").expect("message");
/// stream.remove(locked.id(), lock).expect("remove");
/// assert!(stream.is_empty());
/// ```
#[derive(Debug, Clone, Default)]
pub struct ItemStream {
    shared: Arc<Shared>,
}

impl ItemStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Closes the stream for failure. Cursor creation and reads error from now on.
    pub fn fail(&self, reason: impl Into<String>) {
        let reason = reason.into();
        tracing::warn!(reason = %reason, "item stream closed for failure");
        self.shared.state.lock().failure = Some(reason);
    }

    pub fn is_failed(&self) -> bool {
        self.shared.state.lock().failure.is_some()
    }

    pub fn is_locked(&self, id: MessageId) -> bool {
        self.shared
            .state
            .lock()
            .entries
            .get(&id)
            .is_some_and(|entry| matches!(entry.state, EntryState::Locked(_)))
    }
}

impl MessageStore for ItemStream {
    fn put(&self, message: Message) -> Result<Arc<StoredMessage>> {
        let mut state = self.shared.state.lock();
        state.check_open()?;
        let id = MessageId(state.next_id);
        state.next_id += 1;
        let stored = Arc::new(StoredMessage::new(id, message));
        state.entries.insert(
            id,
            Entry {
                message: Arc::clone(&stored),
                state: EntryState::Available,
                unlock_count: 0,
            },
        );
        state.available += 1;
        Ok(stored)
    }

    fn new_cursor(
        &self,
        filter: Arc<dyn MessageFilter>,
        lock: LockId,
    ) -> Result<Box<dyn LockableCursor>> {
        self.shared.state.lock().check_open()?;
        Ok(Box::new(ItemStreamCursor {
            shared: Arc::clone(&self.shared),
            filter,
            lock,
        }))
    }

    fn allocate_lock_id(&self) -> LockId {
        LockId(self.shared.next_lock.fetch_add(1, Ordering::Relaxed))
    }

    fn try_lock(&self, id: MessageId, lock: LockId) -> Result<Option<LockedMessage>> {
        let mut state = self.shared.state.lock();
        state.check_open()?;
        Ok(state.lock_entry(id, lock))
    }

    fn unlock(&self, id: MessageId, lock: LockId) -> Result<()> {
        let mut state = self.shared.state.lock();
        let entry = state
            .entries
            .get_mut(&id)
            .ok_or(StorageError::NotFound(id))?;
        if entry.state != EntryState::Locked(lock) {
            return Err(StorageError::NotLocked(id));
        }
        entry.state = EntryState::Available;
        entry.unlock_count = entry.unlock_count.saturating_add(1);
        state.available += 1;
        Ok(())
    }

    fn remove(&self, id: MessageId, lock: LockId) -> Result<()> {
        let mut state = self.shared.state.lock();
        match state.entries.get(&id) {
            None => return Err(StorageError::NotFound(id)),
            Some(entry) if entry.state != EntryState::Locked(lock) => {
                return Err(StorageError::NotLocked(id));
            }
            Some(_) => {}
        }
        state.entries.remove(&id);
        Ok(())
    }

    fn available(&self) -> usize {
        self.shared.state.lock().available
    }

    fn len(&self) -> usize {
        self.shared.state.lock().entries.len()
    }
}

struct ItemStreamCursor {
    shared: Arc<Shared>,
    filter: Arc<dyn MessageFilter>,
    lock: LockId,
}

impl LockableCursor for ItemStreamCursor {
    fn lock_id(&self) -> LockId {
        self.lock
    }

    fn next_locked_where(
        &self,
        accept: &dyn Fn(&StoredMessage) -> bool,
    ) -> Result<Option<LockedMessage>> {
        let mut state = self.shared.state.lock();
        state.check_open()?;
        if state.available == 0 {
            return Ok(None);
        }
        let mut found = None;
        for (id, entry) in state.entries.iter() {
            if entry.state != EntryState::Available {
                continue;
            }
            match self.filter.filter_matches(&entry.message) {
                Ok(true) if accept(&entry.message) => {
                    found = Some(*id);
                    break;
                }
                Ok(_) => {}
                Err(err) => {
                    // Unevaluable candidates are skipped rather than failing the cursor.
                    tracing::warn!(message_id = %id, error = %err, "filter evaluation failed");
                    metrics::counter!("felix_dispatch_store_filter_errors_total").increment(1);
                }
            }
        }
        Ok(found.and_then(|id| state.lock_entry(id, self.lock)))
    }
}
