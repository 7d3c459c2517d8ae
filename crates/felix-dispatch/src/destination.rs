// Destination dispatcher: the ready-list and the push side of delivery.
use parking_lot::Mutex;
use slab::Slab;
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use felix_common::ids::{ConnectionId, DestinationId};
use felix_storage::{Message, MessageStore, StoredMessage};

use crate::consumer_set::ConsumerSet;
use crate::key::{ConsumerKey, ConsumerOptions, DetachReason, Offer};
use crate::key_group::{ConsumerKeyGroup, GroupChange};
use crate::{DispatchError, Result};

#[derive(Debug, Clone, Copy, Default)]
pub struct DestinationOptions {
    /// Only one consumer may be attached at a time.
    pub receive_exclusive: bool,
}

enum ReadyTarget {
    Key(Arc<ConsumerKey>),
    Group(Arc<ConsumerKeyGroup>),
}

struct ReadyEntry {
    version: u64,
    target: ReadyTarget,
}

#[derive(Default)]
struct ReadyList {
    // General keys take anything, so first come first served.
    general: VecDeque<ReadyEntry>,
    // Selective keys and groups, scanned from a rotating start.
    specific: Vec<ReadyEntry>,
    last_version: u64,
    seed: usize,
}

impl ReadyList {
    fn next_version(&mut self) -> u64 {
        self.last_version += 1;
        self.last_version
    }

    fn remove_key(&mut self, key_id: u64) {
        let is_key =
            |entry: &ReadyEntry| matches!(&entry.target, ReadyTarget::Key(key) if key.id() == key_id);
        self.general.retain(|entry| !is_key(entry));
        self.specific.retain(|entry| !is_key(entry));
    }

    fn remove_group(&mut self, group_id: u64) {
        self.specific.retain(
            |entry| !matches!(&entry.target, ReadyTarget::Group(group) if group.id() == group_id),
        );
    }

    fn apply_group_change(&mut self, group: &Arc<ConsumerKeyGroup>, change: GroupChange) {
        match change {
            GroupChange::Publish => {
                let version = self.next_version();
                self.specific.push(ReadyEntry {
                    version,
                    target: ReadyTarget::Group(Arc::clone(group)),
                });
                tracing::debug!(group = group.id(), version, "key group ready");
            }
            GroupChange::Withdraw => {
                self.remove_group(group.id());
                tracing::debug!(group = group.id(), "key group not ready");
            }
            GroupChange::Unchanged => {}
        }
    }

    /// Picks one key, ready at or before `snapshot`, to offer `message` to, and
    /// marks it not ready.
    fn choose(&mut self, message: &StoredMessage, snapshot: u64) -> Option<Arc<ConsumerKey>> {
        if self
            .general
            .front()
            .is_some_and(|entry| entry.version <= snapshot)
            && let Some(ReadyEntry {
                target: ReadyTarget::Key(key),
                ..
            }) = self.general.pop_front()
        {
            key.state.lock().ready = false;
            return Some(key);
        }

        let len = self.specific.len();
        if len == 0 {
            return None;
        }
        let start = self.seed % len;
        self.seed = self.seed.wrapping_add(1);
        for offset in 0..len {
            let index = (start + offset) % len;
            let entry = &self.specific[index];
            if entry.version > snapshot {
                continue;
            }
            match &entry.target {
                ReadyTarget::Key(key) => {
                    if key.matches(message) {
                        let key = Arc::clone(key);
                        self.specific.remove(index);
                        key.state.lock().ready = false;
                        return Some(key);
                    }
                }
                ReadyTarget::Group(group) => {
                    let group = Arc::clone(group);
                    if let Some((member, change)) = group.take_ready_member_for(message) {
                        self.apply_group_change(&group, change);
                        return Some(member);
                    }
                }
            }
        }
        None
    }

    fn len(&self) -> usize {
        self.general.len() + self.specific.len()
    }

    fn clear(&mut self) {
        self.general.clear();
        self.specific.clear();
    }
}

/// A queue point: a message store plus the consumers attached to it.
///
/// ```
/// use bytes::Bytes;
/// use felix_dispatch::{Destination, DestinationOptions};
/// use felix_storage::{ItemStream, Message, MessageStore};
/// use std::sync::Arc;
///
/// let store = Arc::new(ItemStream::new());
/// let queue = Destination::new("orders", store.clone(), DestinationOptions::default());
/// queue.put(Message::new(Bytes::from_static(b"hello"))).expect("put");
/// // Nobody is ready, so the message waits in the store.
/// assert_eq!(store.available(), 1);
/// ```
pub struct Destination {
    id: DestinationId,
    name: String,
    store: Arc<dyn MessageStore>,
    options: DestinationOptions,
    ready: Mutex<ReadyList>,
    // Attached keys indexed by key id.
    consumers: Mutex<Slab<Arc<ConsumerKey>>>,
    next_group_id: AtomicU64,
    deleted: AtomicBool,
    self_ref: Weak<Destination>,
}

impl Destination {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn MessageStore>,
        options: DestinationOptions,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            id: DestinationId::new(),
            name: name.into(),
            store,
            options,
            ready: Mutex::new(ReadyList::default()),
            consumers: Mutex::new(Slab::new()),
            next_group_id: AtomicU64::new(0),
            deleted: AtomicBool::new(false),
            self_ref: self_ref.clone(),
        })
    }

    pub fn id(&self) -> DestinationId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn MessageStore> {
        &self.store
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::Acquire)
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.lock().len()
    }

    pub fn ready_count(&self) -> usize {
        self.ready.lock().len()
    }

    fn check_live(&self) -> Result<()> {
        if self.is_deleted() {
            return Err(DispatchError::DestinationDeleted(self.name.clone()));
        }
        Ok(())
    }

    /// Creates an ordering context for consumers of `connection`. Members
    /// must join with the same `consumer_set`.
    pub fn create_group(
        &self,
        connection: ConnectionId,
        consumer_set: Option<Arc<ConsumerSet>>,
    ) -> Arc<ConsumerKeyGroup> {
        let id = self.next_group_id.fetch_add(1, Ordering::Relaxed);
        ConsumerKeyGroup::new(id, connection, consumer_set, &*self.store)
    }

    /// Validates `options` and registers a new key. The caller binds a
    /// consumer point to it.
    pub fn attach(&self, options: &ConsumerOptions) -> Result<Arc<ConsumerKey>> {
        self.check_live()?;
        let filter = options.filter()?;
        if let Some(group) = &options.group
            && group.connection_id() != options.connection
        {
            return Err(DispatchError::Usage(format!(
                "key group {} belongs to connection {}, not {}",
                group.id(),
                group.connection_id(),
                options.connection
            )));
        }
        if let Some(group) = &options.group
            && !group.accepts_set(options.consumer_set.as_ref())
        {
            return Err(DispatchError::Usage(format!(
                "key group {} members must share the group's consumer set",
                group.id()
            )));
        }

        let key = {
            let mut consumers = self.consumers.lock();
            if self.options.receive_exclusive && !consumers.is_empty() {
                return Err(DispatchError::Usage(format!(
                    "destination {} is receive-exclusive and already has a consumer",
                    self.name
                )));
            }
            let entry = consumers.vacant_entry();
            let key = ConsumerKey::new(
                entry.key() as u64,
                self.self_ref.clone(),
                Arc::clone(&self.store),
                options,
                filter,
            );
            entry.insert(Arc::clone(&key));
            key
        };
        if let Some(group) = &options.group {
            let mut list = self.ready.lock();
            let change = group.add_member(Arc::clone(&key));
            list.apply_group_change(group, change);
        }
        tracing::debug!(destination = %self.name, key = key.id(), "consumer attached");
        Ok(key)
    }

    /// Stores `message`, then offers it to a ready consumer.
    pub fn put(&self, message: Message) -> Result<Arc<StoredMessage>> {
        self.check_live()?;
        let stored = self.store.put(message)?;
        self.dispatch(&stored);
        Ok(stored)
    }

    /// Offers a stored, unlocked message to consumers that were ready when the
    /// call started. Returns true if one accepted it.
    pub(crate) fn dispatch(&self, message: &Arc<StoredMessage>) -> bool {
        if self.is_deleted() {
            return false;
        }
        // Keys readying after this point poll the store themselves.
        let snapshot = self.ready.lock().last_version;
        loop {
            let Some(key) = self.ready.lock().choose(message, snapshot) else {
                return false;
            };
            let Some(point) = key.point() else {
                continue;
            };
            match point.offer(message) {
                Offer::Accepted => {
                    tracing::debug!(
                        destination = %self.name,
                        key = key.id(),
                        message_id = %message.id(),
                        "message offered",
                    );
                    return true;
                }
                Offer::Taken => return false,
                Offer::Refused => continue,
            }
        }
    }

    pub(crate) fn ready_key(&self, key: &Arc<ConsumerKey>) -> bool {
        if self.is_deleted() {
            return false;
        }
        let mut list = self.ready.lock();
        let mut state = key.state.lock();
        if state.detached {
            return false;
        }
        if state.ready {
            return true;
        }
        state.ready = true;
        let version = list.next_version();
        let entry = ReadyEntry {
            version,
            target: ReadyTarget::Key(Arc::clone(key)),
        };
        if key.is_specific() {
            list.specific.push(entry);
        } else {
            list.general.push_back(entry);
        }
        tracing::debug!(key = key.id(), version, "consumer key ready");
        true
    }

    pub(crate) fn not_ready_key(&self, key: &Arc<ConsumerKey>) {
        let mut list = self.ready.lock();
        let mut state = key.state.lock();
        if !state.ready {
            return;
        }
        state.ready = false;
        list.remove_key(key.id());
        tracing::debug!(key = key.id(), "consumer key not ready");
    }

    pub(crate) fn ready_group_member(
        &self,
        group: &Arc<ConsumerKeyGroup>,
        key: &Arc<ConsumerKey>,
    ) -> bool {
        if self.is_deleted() {
            return false;
        }
        let mut list = self.ready.lock();
        if key.state.lock().detached {
            return false;
        }
        let change = group.set_member_ready(key.id(), key.is_specific(), true);
        list.apply_group_change(group, change);
        key.state.lock().ready = true;
        true
    }

    pub(crate) fn not_ready_group_member(
        &self,
        group: &Arc<ConsumerKeyGroup>,
        key: &Arc<ConsumerKey>,
    ) {
        let mut list = self.ready.lock();
        let change = group.set_member_ready(key.id(), key.is_specific(), false);
        list.apply_group_change(group, change);
        key.state.lock().ready = false;
    }

    pub(crate) fn group_member_started(
        &self,
        group: &Arc<ConsumerKeyGroup>,
        key_id: u64,
        started: bool,
    ) {
        let mut list = self.ready.lock();
        let change = group.set_member_started(key_id, started);
        list.apply_group_change(group, change);
    }

    pub(crate) fn remove_key(&self, key: &Arc<ConsumerKey>) {
        {
            let mut list = self.ready.lock();
            list.remove_key(key.id());
            if let Some(group) = key.group() {
                let change = group.remove_member(key.id());
                list.apply_group_change(group, change);
            }
        }
        let mut consumers = self.consumers.lock();
        let slot = key.id() as usize;
        if consumers
            .get(slot)
            .is_some_and(|existing| Arc::ptr_eq(existing, key))
        {
            consumers.remove(slot);
        }
    }

    /// Deletes the destination, detaching every consumer.
    pub fn delete(&self) {
        if self.deleted.swap(true, Ordering::AcqRel) {
            return;
        }
        let keys: Vec<Arc<ConsumerKey>> = self.consumers.lock().drain().collect();
        {
            let mut list = self.ready.lock();
            list.clear();
            for key in &keys {
                if let Some(group) = key.group() {
                    group.remove_member(key.id());
                }
            }
        }
        tracing::info!(destination = %self.name, consumers = keys.len(), "destination deleted");
        for key in keys {
            key.mark_detached();
            if let Some(point) = key.point() {
                point.notify_closed(DetachReason::DestinationDeleted);
            }
        }
    }
}

impl fmt::Debug for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Destination")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("receive_exclusive", &self.options.receive_exclusive)
            .field("deleted", &self.is_deleted())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::key::{ConsumableKey, ConsumerPointHandle};
    use crate::selector::Selector;
    use bytes::Bytes;
    use felix_storage::{ItemStream, LockedMessage};

    // Accepts every offer, remembering what it locked.
    struct Taker {
        key: Arc<ConsumerKey>,
        taken: Mutex<Vec<LockedMessage>>,
        refuse: AtomicBool,
        closed: Mutex<Vec<DetachReason>>,
    }

    impl Taker {
        fn attach(destination: &Arc<Destination>, options: ConsumerOptions) -> Arc<Self> {
            let key = destination.attach(&options).expect("attach");
            let taker = Arc::new(Self {
                key: Arc::clone(&key),
                taken: Mutex::new(Vec::new()),
                refuse: AtomicBool::new(false),
                closed: Mutex::new(Vec::new()),
            });
            let handle: Arc<dyn ConsumerPointHandle> = taker.clone();
            key.bind_point(Arc::downgrade(&handle));
            taker
        }

        fn taken_ids(&self) -> Vec<u64> {
            self.taken.lock().iter().map(|m| m.id().0).collect()
        }
    }

    impl ConsumerPointHandle for Taker {
        fn offer(&self, message: &Arc<StoredMessage>) -> Offer {
            if self.refuse.load(Ordering::SeqCst) {
                return Offer::Refused;
            }
            match self.key.try_lock(message).expect("lock") {
                Some(locked) => {
                    self.taken.lock().push(locked);
                    Offer::Accepted
                }
                None => Offer::Taken,
            }
        }

        fn notify_closed(&self, reason: DetachReason) {
            self.closed.lock().push(reason);
        }
    }

    fn queue() -> (Arc<Destination>, Arc<ItemStream>) {
        let store = Arc::new(ItemStream::new());
        let destination = Destination::new("q", store.clone(), DestinationOptions::default());
        (destination, store)
    }

    fn msg() -> Message {
        Message::new(Bytes::from_static(b"m"))
    }

    #[test]
    fn general_consumers_are_served_first_come_first_served() {
        let (destination, _store) = queue();
        let conn = ConnectionId::new();
        let first = Taker::attach(&destination, ConsumerOptions::new(conn));
        let second = Taker::attach(&destination, ConsumerOptions::new(conn));
        assert!(second.key.ready());
        assert!(first.key.ready());

        destination.put(msg()).expect("put");
        assert_eq!(second.taken_ids(), vec![0]);
        assert!(first.taken_ids().is_empty());
        assert!(!second.key.is_ready());
        assert!(first.key.is_ready());
    }

    #[test]
    fn specific_consumers_only_get_matching_messages() {
        let (destination, store) = queue();
        let conn = ConnectionId::new();
        let eu = Taker::attach(
            &destination,
            ConsumerOptions::new(conn).with_selector(Selector::equals("region", "eu")),
        );
        eu.key.ready();

        destination
            .put(msg().with_property("region", "us"))
            .expect("put");
        assert!(eu.taken_ids().is_empty());
        assert!(eu.key.is_ready());
        destination
            .put(msg().with_property("region", "eu"))
            .expect("put");
        assert_eq!(eu.taken_ids(), vec![1]);
        assert_eq!(store.available(), 1);
    }

    #[test]
    fn refused_offer_moves_on_to_the_next_consumer() {
        let (destination, _store) = queue();
        let conn = ConnectionId::new();
        let busy = Taker::attach(&destination, ConsumerOptions::new(conn));
        let idle = Taker::attach(&destination, ConsumerOptions::new(conn));
        busy.refuse.store(true, Ordering::SeqCst);
        busy.key.ready();
        idle.key.ready();
        destination.put(msg()).expect("put");
        assert!(busy.taken_ids().is_empty());
        assert_eq!(idle.taken_ids(), vec![0]);
    }

    #[test]
    fn specific_scan_rotates_between_matching_consumers() {
        let (destination, _store) = queue();
        let conn = ConnectionId::new();
        let takers: Vec<_> = (0..2)
            .map(|_| {
                Taker::attach(
                    &destination,
                    ConsumerOptions::new(conn).with_selector(Selector::exists("k")),
                )
            })
            .collect();
        for round in 0..4 {
            for taker in &takers {
                taker.key.ready();
            }
            destination
                .put(msg().with_property("k", round.to_string()))
                .expect("put");
        }
        assert_eq!(takers[0].taken_ids().len(), 2);
        assert_eq!(takers[1].taken_ids().len(), 2);
    }

    #[test]
    fn no_local_consumer_skips_its_own_messages() {
        let (destination, store) = queue();
        let own = ConnectionId::new();
        let taker = Taker::attach(&destination, ConsumerOptions::new(own).no_local());
        taker.key.ready();
        destination.put(msg().from_connection(own)).expect("put");
        assert!(taker.taken_ids().is_empty());
        destination
            .put(msg().from_connection(ConnectionId::new()))
            .expect("put");
        assert_eq!(taker.taken_ids(), vec![1]);
        assert_eq!(store.available(), 1);
    }

    #[test]
    fn receive_exclusive_rejects_second_consumer() {
        let store = Arc::new(ItemStream::new());
        let destination = Destination::new(
            "excl",
            store,
            DestinationOptions {
                receive_exclusive: true,
            },
        );
        let conn = ConnectionId::new();
        let _first = destination.attach(&ConsumerOptions::new(conn)).expect("first");
        let err = destination
            .attach(&ConsumerOptions::new(conn))
            .expect_err("second");
        assert!(matches!(err, DispatchError::Usage(_)));
    }

    #[test]
    fn bad_selector_is_rejected_at_attach() {
        let (destination, _store) = queue();
        let err = destination
            .attach(&ConsumerOptions::new(ConnectionId::new()).with_selector(Selector::Or(vec![])))
            .expect_err("invalid");
        assert!(matches!(err, DispatchError::InvalidSelector(_)));
        assert_eq!(destination.consumer_count(), 0);
    }

    #[test]
    fn group_members_must_share_the_connection() {
        let (destination, _store) = queue();
        let group = destination.create_group(ConnectionId::new(), None);
        let err = destination
            .attach(&ConsumerOptions::new(ConnectionId::new()).in_group(group))
            .expect_err("mismatch");
        assert!(matches!(err, DispatchError::Usage(_)));
    }

    #[test]
    fn group_is_ready_only_when_every_member_started() {
        let (destination, _store) = queue();
        let conn = ConnectionId::new();
        let group = destination.create_group(conn, None);
        let a = Taker::attach(&destination, ConsumerOptions::new(conn).in_group(group.clone()));
        let b = Taker::attach(&destination, ConsumerOptions::new(conn).in_group(group.clone()));

        a.key.started(true);
        a.key.ready();
        assert!(!group.is_group_ready());
        destination.put(msg()).expect("put");
        assert!(a.taken_ids().is_empty());

        b.key.started(true);
        assert!(group.is_group_ready());
        destination.put(msg()).expect("put");
        assert_eq!(a.taken_ids(), vec![1]);
        assert!(b.taken_ids().is_empty());
        assert!(!group.is_group_ready());
    }

    #[test]
    fn group_routes_specific_matches_to_the_exact_member() {
        let (destination, _store) = queue();
        let conn = ConnectionId::new();
        let group = destination.create_group(conn, None);
        let red = Taker::attach(
            &destination,
            ConsumerOptions::new(conn)
                .in_group(group.clone())
                .with_selector(Selector::equals("colour", "red")),
        );
        let blue = Taker::attach(
            &destination,
            ConsumerOptions::new(conn)
                .in_group(group.clone())
                .with_selector(Selector::equals("colour", "blue")),
        );
        for taker in [&red, &blue] {
            taker.key.started(true);
            taker.key.ready();
        }
        let message = msg().with_property("colour", "blue");
        destination.put(message.clone()).expect("put");
        assert_eq!(blue.taken_ids(), vec![0]);
        assert!(red.taken_ids().is_empty());

        let candidate = StoredMessage::new(felix_storage::MessageId(9), message);
        let resolved = group.get_matching_member(&candidate).expect("member");
        assert_eq!(resolved.id(), blue.key.id());
    }

    #[test]
    fn grouped_keys_pull_through_the_shared_cursor() {
        let (destination, store) = queue();
        let conn = ConnectionId::new();
        let group = destination.create_group(conn, None);
        let red = destination
            .attach(
                &ConsumerOptions::new(conn)
                    .in_group(group.clone())
                    .with_selector(Selector::equals("colour", "red")),
            )
            .expect("attach");
        destination
            .put(msg().with_property("colour", "blue"))
            .expect("put");
        let wanted = destination
            .put(msg().with_property("colour", "red"))
            .expect("put");
        let locked = red.get_next_message().expect("poll").expect("message");
        assert_eq!(locked.id(), wanted.id());
        assert_eq!(locked.lock_id(), group.lock_id());
        red.release(&locked, true).expect("consume");
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn grouped_keys_follow_the_consumer_set_classification() {
        let (destination, _store) = queue();
        let conn = ConnectionId::new();
        let set = ConsumerSet::new("classified");
        set.classifications().set_weights([("gold", 1)]);
        destination.put(msg()).expect("put");
        let gold = destination
            .put(msg().with_classification("gold"))
            .expect("put");

        let group = destination.create_group(conn, Some(set.clone()));
        let key = destination
            .attach(
                &ConsumerOptions::new(conn)
                    .in_group(group.clone())
                    .in_set(set.clone()),
            )
            .expect("attach");
        let first = key.get_next_message().expect("poll").expect("message");
        assert_eq!(first.id(), gold.id());
        let second = key.get_next_message().expect("poll").expect("message");
        assert_eq!(second.id().0, 0);
    }

    #[test]
    fn group_members_must_share_the_consumer_set() {
        let (destination, _store) = queue();
        let conn = ConnectionId::new();
        let set = ConsumerSet::new("s");
        let group = destination.create_group(conn, Some(set.clone()));
        let err = destination
            .attach(&ConsumerOptions::new(conn).in_group(group.clone()))
            .expect_err("no set");
        assert!(matches!(err, DispatchError::Usage(_)));
        let err = destination
            .attach(
                &ConsumerOptions::new(conn)
                    .in_group(group.clone())
                    .in_set(ConsumerSet::new("other")),
            )
            .expect_err("other set");
        assert!(matches!(err, DispatchError::Usage(_)));
        destination
            .attach(&ConsumerOptions::new(conn).in_group(group).in_set(set))
            .expect("same set");
    }

    #[test]
    fn delete_detaches_and_notifies_every_consumer_once() {
        let (destination, _store) = queue();
        let conn = ConnectionId::new();
        let takers: Vec<_> = (0..3)
            .map(|_| Taker::attach(&destination, ConsumerOptions::new(conn)))
            .collect();
        takers[0].key.ready();
        destination.delete();
        destination.delete();
        for taker in &takers {
            assert_eq!(*taker.closed.lock(), vec![DetachReason::DestinationDeleted]);
            assert!(taker.key.is_detached());
            assert!(!taker.key.ready());
        }
        assert_eq!(destination.ready_count(), 0);
        assert!(matches!(
            destination.put(msg()),
            Err(DispatchError::DestinationDeleted(_))
        ));
        assert!(destination.attach(&ConsumerOptions::new(conn)).is_err());
    }

    #[test]
    fn detach_removes_key_from_ready_list_and_registry() {
        let (destination, _store) = queue();
        let taker = Taker::attach(&destination, ConsumerOptions::new(ConnectionId::new()));
        taker.key.ready();
        assert_eq!(destination.ready_count(), 1);
        taker.key.detach(DetachReason::ApplicationClose);
        assert_eq!(destination.ready_count(), 0);
        assert_eq!(destination.consumer_count(), 0);
        assert!(matches!(
            taker.key.get_next_message(),
            Err(DispatchError::Closed)
        ));
    }

    #[test]
    fn unlocked_message_is_offered_again() {
        let (destination, _store) = queue();
        let conn = ConnectionId::new();
        let first = Taker::attach(&destination, ConsumerOptions::new(conn));
        let second = Taker::attach(&destination, ConsumerOptions::new(conn));
        first.key.ready();
        destination.put(msg()).expect("put");
        let locked = first.taken.lock().pop().expect("locked");
        second.key.ready();
        first.key.release(&locked, false).expect("unlock");
        assert_eq!(second.taken_ids(), vec![0]);
    }
}
