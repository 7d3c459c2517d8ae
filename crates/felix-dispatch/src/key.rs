// Consumer keys: one consumer's subscription on a destination and its cursors.
use parking_lot::Mutex;
use rand::Rng;
use smallvec::SmallVec;
use std::fmt;
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use felix_common::DispatchConfig;
use felix_common::ids::ConnectionId;
use felix_storage::{
    LockId, LockableCursor, LockedMessage, MessageFilter, MessageStore, StoredMessage,
};

use crate::classification::{ClassTable, Classifications, UNCLASSIFIED};
use crate::consumer_set::{AdmissionPermit, ConsumerSet};
use crate::destination::Destination;
use crate::key_group::ConsumerKeyGroup;
use crate::selector::{ConsumerFilter, Discriminator, Selector};
use crate::{DispatchError, Result};

/// Outcome of offering a freshly stored message to a ready consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Offer {
    /// Locked and queued for delivery.
    Accepted,
    /// The consumer cannot take messages right now.
    Refused,
    /// Someone else locked the message first.
    Taken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DetachReason {
    ApplicationClose,
    DestinationDeleted,
    StoreFailure,
    Unreachable,
    IdleTimeout,
}

/// The consumer side of a key: whatever the dispatcher hands messages to.
pub trait ConsumerPointHandle: Send + Sync {
    fn offer(&self, message: &Arc<StoredMessage>) -> Offer;

    /// Hint that the key may have new messages to hand out.
    fn messages_available(&self) {}

    /// The key was detached underneath the consumer.
    fn notify_closed(&self, reason: DetachReason);
}

/// Result of a key-level admission check.
#[derive(Debug)]
pub enum Admission {
    /// The key is not in a consumer set.
    Unbounded,
    Permit(AdmissionPermit),
    Refused,
}

impl Admission {
    pub fn is_refused(&self) -> bool {
        matches!(self, Admission::Refused)
    }

    pub fn commit(self) {
        if let Admission::Permit(permit) = self {
            permit.commit();
        }
    }

    pub fn rollback(self) {
        if let Admission::Permit(permit) = self {
            permit.rollback();
        }
    }
}

/// Capability shared by local, grouped and remote keys. A grouped key
/// resolves through its group, so each delivery lands on exactly one
/// concrete key.
pub trait ConsumableKey: Send + Sync {
    fn connection_id(&self) -> ConnectionId;

    fn consumer_set(&self) -> Option<Arc<ConsumerSet>>;

    fn bind_point(&self, point: Weak<dyn ConsumerPointHandle>);

    /// Publishes the key as ready. Returns false if it stays not-ready.
    fn ready(&self) -> bool;

    fn not_ready(&self);

    fn is_ready(&self) -> bool;

    /// The owning consumer started or stopped.
    fn started(&self, _started: bool) {}

    fn prepare_add_active_message(&self) -> Admission {
        match self.consumer_set() {
            None => Admission::Unbounded,
            Some(set) => match set.prepare_add_active_message() {
                Some(permit) => Admission::Permit(permit),
                None => Admission::Refused,
            },
        }
    }

    /// Locks the next deliverable message. `Err` means the key can no longer
    /// serve and its consumer must be torn down.
    fn get_next_message(&self) -> Result<Option<LockedMessage>>;

    /// Locks one specific message offered by the dispatcher.
    fn try_lock(&self, message: &Arc<StoredMessage>) -> Result<Option<LockedMessage>>;

    /// Deletes (`consumed`) or unlocks a message this key locked.
    fn release(&self, message: &LockedMessage, consumed: bool) -> Result<()>;

    /// A synchronous receive is about to wait for `timeout` (None is forever).
    fn waiting(&self, _timeout: Option<Duration>, _refill: bool) {}

    fn detach(&self, reason: DetachReason);
}

/// How a consumer attaches to a destination.
#[derive(Clone)]
pub struct ConsumerOptions {
    pub connection: ConnectionId,
    pub selector: Option<Selector>,
    pub discriminator: Option<Discriminator>,
    pub no_local: bool,
    pub consumer_set: Option<Arc<ConsumerSet>>,
    pub group: Option<Arc<ConsumerKeyGroup>>,
    /// Local active-message limit; 0 is unbounded.
    pub max_active: usize,
    pub active_msg_block_interval: Option<Duration>,
}

impl ConsumerOptions {
    pub fn new(connection: ConnectionId) -> Self {
        Self {
            connection,
            selector: None,
            discriminator: None,
            no_local: false,
            consumer_set: None,
            group: None,
            max_active: 0,
            active_msg_block_interval: None,
        }
    }

    pub fn with_config(mut self, config: &DispatchConfig) -> Self {
        self.active_msg_block_interval = config.active_msg_block_interval();
        self
    }

    pub fn with_selector(mut self, selector: Selector) -> Self {
        self.selector = Some(selector);
        self
    }

    pub fn with_discriminator(mut self, discriminator: Discriminator) -> Self {
        self.discriminator = Some(discriminator);
        self
    }

    pub fn no_local(mut self) -> Self {
        self.no_local = true;
        self
    }

    pub fn in_set(mut self, set: Arc<ConsumerSet>) -> Self {
        self.consumer_set = Some(set);
        self
    }

    pub fn in_group(mut self, group: Arc<ConsumerKeyGroup>) -> Self {
        self.group = Some(group);
        self
    }

    pub fn max_active(mut self, max_active: usize) -> Self {
        self.max_active = max_active;
        self
    }

    pub fn block_interval(mut self, interval: Duration) -> Self {
        self.active_msg_block_interval = Some(interval);
        self
    }

    pub(crate) fn filter(&self) -> Result<ConsumerFilter> {
        ConsumerFilter::new(
            self.selector.clone(),
            self.discriminator.clone(),
            self.no_local.then_some(self.connection),
        )
    }
}

impl fmt::Debug for ConsumerOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerOptions")
            .field("connection", &self.connection)
            .field("selector", &self.selector)
            .field("discriminator", &self.discriminator)
            .field("no_local", &self.no_local)
            .field("max_active", &self.max_active)
            .finish_non_exhaustive()
    }
}

// Restricts a key filter to the messages one cursor index is responsible for.
struct ClassFilter {
    inner: Arc<dyn MessageFilter>,
    table: Arc<ClassTable>,
    index: usize,
}

impl MessageFilter for ClassFilter {
    fn filter_matches(&self, message: &StoredMessage) -> felix_storage::Result<bool> {
        if self.table.index_of(message.classification()) != self.index {
            return Ok(false);
        }
        self.inner.filter_matches(message)
    }
}

/// One cursor per classification index, rebuilt lazily when the class set changes.
pub(crate) struct CursorSet {
    filter: Arc<dyn MessageFilter>,
    lock: LockId,
    version: Option<u64>,
    cursors: Vec<Box<dyn LockableCursor>>,
}

impl CursorSet {
    pub(crate) fn new(filter: Arc<dyn MessageFilter>, lock: LockId) -> Self {
        Self {
            filter,
            lock,
            version: None,
            cursors: Vec::new(),
        }
    }

    fn rebuild(&mut self, store: &dyn MessageStore, table: &ClassTable) -> Result<()> {
        let shared = Arc::new(table.clone());
        let mut cursors = Vec::with_capacity(table.cursor_count());
        for index in 0..table.cursor_count() {
            let filter = Arc::new(ClassFilter {
                inner: Arc::clone(&self.filter),
                table: Arc::clone(&shared),
                index,
            });
            cursors.push(store.new_cursor(filter, self.lock)?);
        }
        self.cursors = cursors;
        self.version = Some(table.version());
        Ok(())
    }

    /// Polls for the next message. Caller holds the classification read lock
    /// for `table`.
    pub(crate) fn next_locked<R: Rng + ?Sized>(
        &mut self,
        store: &dyn MessageStore,
        table: &ClassTable,
        accept: &dyn Fn(&StoredMessage) -> bool,
        rng: &mut R,
    ) -> Result<Option<LockedMessage>> {
        if self.version != Some(table.version()) {
            self.rebuild(store, table)?;
        }
        if !table.is_classified() {
            return Ok(self.poll(UNCLASSIFIED, accept));
        }
        let mut untried: SmallVec<[usize; 8]> = (1..table.cursor_count()).collect();
        loop {
            let index = table.weighted_pick(&untried, rng);
            if index == UNCLASSIFIED {
                break;
            }
            if let Some(message) = self.poll(index, accept) {
                return Ok(Some(message));
            }
            untried.retain(|candidate| *candidate != index);
        }
        if let Some(message) = self.poll(UNCLASSIFIED, accept) {
            return Ok(Some(message));
        }
        // Zero-weight classes are only drained once everything else is empty.
        Ok(untried.iter().find_map(|index| self.poll(*index, accept)))
    }

    fn poll(&self, index: usize, accept: &dyn Fn(&StoredMessage) -> bool) -> Option<LockedMessage> {
        let cursor = self.cursors.get(index)?;
        match cursor.next_locked_where(accept) {
            Ok(found) => found,
            Err(err) => {
                tracing::warn!(cursor = index, error = %err, "cursor read failed");
                None
            }
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct KeyState {
    pub(crate) ready: bool,
    pub(crate) detached: bool,
}

/// A local consumer's subscription on a destination.
pub struct ConsumerKey {
    id: u64,
    destination: Weak<Destination>,
    store: Arc<dyn MessageStore>,
    connection: ConnectionId,
    filter: Arc<ConsumerFilter>,
    consumer_set: Option<Arc<ConsumerSet>>,
    group: Option<Arc<ConsumerKeyGroup>>,
    classifications: Arc<Classifications>,
    lock_id: LockId,
    point: OnceLock<Weak<dyn ConsumerPointHandle>>,
    cursors: Mutex<CursorSet>,
    pub(crate) state: Mutex<KeyState>,
    self_ref: Weak<ConsumerKey>,
}

impl ConsumerKey {
    pub(crate) fn new(
        id: u64,
        destination: Weak<Destination>,
        store: Arc<dyn MessageStore>,
        options: &ConsumerOptions,
        filter: ConsumerFilter,
    ) -> Arc<Self> {
        let filter = Arc::new(filter);
        let lock_id = match &options.group {
            Some(group) => group.lock_id(),
            None => store.allocate_lock_id(),
        };
        let classifications = options
            .consumer_set
            .as_ref()
            .map(|set| Arc::clone(set.classifications()))
            .unwrap_or_default();
        let cursor_filter: Arc<dyn MessageFilter> = filter.clone();
        Arc::new_cyclic(|self_ref| Self {
            id,
            destination,
            store,
            connection: options.connection,
            filter,
            consumer_set: options.consumer_set.clone(),
            group: options.group.clone(),
            classifications,
            lock_id,
            point: OnceLock::new(),
            cursors: Mutex::new(CursorSet::new(cursor_filter, lock_id)),
            state: Mutex::new(KeyState::default()),
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn lock_id(&self) -> LockId {
        self.lock_id
    }

    pub fn is_specific(&self) -> bool {
        self.filter.is_specific()
    }

    pub fn filter(&self) -> &ConsumerFilter {
        &self.filter
    }

    pub fn group(&self) -> Option<&Arc<ConsumerKeyGroup>> {
        self.group.as_ref()
    }

    pub fn is_detached(&self) -> bool {
        self.state.lock().detached
    }

    pub(crate) fn point(&self) -> Option<Arc<dyn ConsumerPointHandle>> {
        self.point.get().and_then(Weak::upgrade)
    }

    pub(crate) fn matches(&self, message: &StoredMessage) -> bool {
        self.filter.matches_lenient(message)
    }

    // Called by the destination when it drops the key wholesale.
    pub(crate) fn mark_detached(&self) {
        let mut state = self.state.lock();
        state.detached = true;
        state.ready = false;
    }
}

impl ConsumableKey for ConsumerKey {
    fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    fn consumer_set(&self) -> Option<Arc<ConsumerSet>> {
        self.consumer_set.clone()
    }

    fn bind_point(&self, point: Weak<dyn ConsumerPointHandle>) {
        if self.point.set(point).is_err() {
            tracing::warn!(key = self.id, "consumer key already bound to a consumer");
        }
    }

    fn ready(&self) -> bool {
        if let Some(set) = &self.consumer_set
            && set.is_consumer_set_suspended()
        {
            tracing::debug!(
                key = self.id,
                set = set.label(),
                "consumer set suspended; key stays not ready",
            );
            return false;
        }
        let (Some(destination), Some(me)) = (self.destination.upgrade(), self.self_ref.upgrade())
        else {
            return false;
        };
        match &self.group {
            Some(group) => destination.ready_group_member(group, &me),
            None => destination.ready_key(&me),
        }
    }

    fn not_ready(&self) {
        let (Some(destination), Some(me)) = (self.destination.upgrade(), self.self_ref.upgrade())
        else {
            self.state.lock().ready = false;
            return;
        };
        match &self.group {
            Some(group) => destination.not_ready_group_member(group, &me),
            None => destination.not_ready_key(&me),
        }
    }

    fn is_ready(&self) -> bool {
        self.state.lock().ready
    }

    fn started(&self, started: bool) {
        if let (Some(group), Some(destination)) = (&self.group, self.destination.upgrade()) {
            destination.group_member_started(group, self.id, started);
        }
    }

    fn get_next_message(&self) -> Result<Option<LockedMessage>> {
        if self.state.lock().detached {
            return Err(DispatchError::Closed);
        }
        if let Some(group) = &self.group {
            return group.next_message_for(self, &*self.store);
        }
        let table = self.classifications.read();
        let mut cursors = self.cursors.lock();
        cursors.next_locked(&*self.store, &table, &|_| true, &mut rand::thread_rng())
    }

    fn try_lock(&self, message: &Arc<StoredMessage>) -> Result<Option<LockedMessage>> {
        Ok(self.store.try_lock(message.id(), self.lock_id)?)
    }

    fn release(&self, message: &LockedMessage, consumed: bool) -> Result<()> {
        if consumed {
            self.store.remove(message.id(), message.lock_id())?;
            return Ok(());
        }
        self.store.unlock(message.id(), message.lock_id())?;
        if let Some(destination) = self.destination.upgrade() {
            destination.dispatch(message.message());
        }
        Ok(())
    }

    fn detach(&self, reason: DetachReason) {
        {
            let mut state = self.state.lock();
            if state.detached {
                return;
            }
            state.detached = true;
        }
        if let (Some(destination), Some(me)) = (self.destination.upgrade(), self.self_ref.upgrade())
        {
            destination.remove_key(&me);
        }
        self.state.lock().ready = false;
        tracing::info!(key = self.id, reason = ?reason, "consumer key detached");
    }
}

impl fmt::Debug for ConsumerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerKey")
            .field("id", &self.id)
            .field("connection", &self.connection)
            .field("specific", &self.filter.is_specific())
            .field("grouped", &self.group.is_some())
            .finish_non_exhaustive()
    }
}
