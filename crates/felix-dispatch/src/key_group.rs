// Ordering contexts: keys sharing one cursor set with single-member delivery.
use arc_swap::ArcSwap;
use hashbrown::HashSet;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

use felix_common::ids::ConnectionId;
use felix_storage::{LockId, LockedMessage, MessageFilter, MessageStore, StoredMessage};

use crate::Result;
use crate::classification::Classifications;
use crate::consumer_set::ConsumerSet;
use crate::key::{ConsumerKey, CursorSet};

/// Ready-list consequence of a membership or readiness change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GroupChange {
    Publish,
    Withdraw,
    Unchanged,
}

#[derive(Debug, Default)]
struct GroupState {
    members: Vec<Arc<ConsumerKey>>,
    started: HashSet<u64>,
    // Ready member ids, oldest first.
    ready_general: Vec<u64>,
    ready_specific: Vec<u64>,
    on_ready_list: bool,
}

impl GroupState {
    fn is_ready(&self) -> bool {
        !self.members.is_empty()
            && self.started.len() == self.members.len()
            && (!self.ready_general.is_empty() || !self.ready_specific.is_empty())
    }

    fn evaluate(&mut self) -> GroupChange {
        match (self.is_ready(), self.on_ready_list) {
            (true, false) => {
                self.on_ready_list = true;
                GroupChange::Publish
            }
            (false, true) => {
                self.on_ready_list = false;
                GroupChange::Withdraw
            }
            _ => GroupChange::Unchanged,
        }
    }

    fn forget_ready(&mut self, key_id: u64) {
        self.ready_general.retain(|id| *id != key_id);
        self.ready_specific.retain(|id| *id != key_id);
    }
}

// Cursor filter: a message belongs to the group if any member could take it.
struct GroupFilter {
    members: Arc<ArcSwap<Vec<Arc<ConsumerKey>>>>,
}

impl MessageFilter for GroupFilter {
    fn filter_matches(&self, message: &StoredMessage) -> felix_storage::Result<bool> {
        for member in self.members.load().iter() {
            if member.filter().matches(message)? {
                return Ok(true);
            }
        }
        Ok(false)
    }
}

/// Keys that share one cursor set so that a message is only ever delivered to
/// a single member. Every member must belong to the same connection and the
/// same consumer set, whose classification weights the shared cursors follow.
pub struct ConsumerKeyGroup {
    id: u64,
    connection: ConnectionId,
    consumer_set: Option<Arc<ConsumerSet>>,
    lock_id: LockId,
    // Lock-free member view for cursor filtering inside the store.
    members_snapshot: Arc<ArcSwap<Vec<Arc<ConsumerKey>>>>,
    state: Mutex<GroupState>,
    classifications: Arc<Classifications>,
    cursors: Mutex<CursorSet>,
}

impl ConsumerKeyGroup {
    pub(crate) fn new(
        id: u64,
        connection: ConnectionId,
        consumer_set: Option<Arc<ConsumerSet>>,
        store: &dyn MessageStore,
    ) -> Arc<Self> {
        let lock_id = store.allocate_lock_id();
        let classifications = consumer_set
            .as_ref()
            .map(|set| Arc::clone(set.classifications()))
            .unwrap_or_default();
        let members_snapshot = Arc::new(ArcSwap::from_pointee(Vec::new()));
        let filter: Arc<dyn MessageFilter> = Arc::new(GroupFilter {
            members: Arc::clone(&members_snapshot),
        });
        Arc::new(Self {
            id,
            connection,
            consumer_set,
            lock_id,
            members_snapshot,
            state: Mutex::new(GroupState::default()),
            classifications,
            cursors: Mutex::new(CursorSet::new(filter, lock_id)),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub fn lock_id(&self) -> LockId {
        self.lock_id
    }

    pub fn consumer_set(&self) -> Option<&Arc<ConsumerSet>> {
        self.consumer_set.as_ref()
    }

    /// True when a member in `set` may join: both sides name the same set, or
    /// neither names one.
    pub(crate) fn accepts_set(&self, set: Option<&Arc<ConsumerSet>>) -> bool {
        match (&self.consumer_set, set) {
            (None, None) => true,
            (Some(own), Some(other)) => Arc::ptr_eq(own, other),
            _ => false,
        }
    }

    pub fn member_count(&self) -> usize {
        self.members_snapshot.load().len()
    }

    pub fn is_group_ready(&self) -> bool {
        self.state.lock().is_ready()
    }

    /// The member a message resolves to: any general member first, otherwise
    /// the first specific member whose filter matches.
    pub fn get_matching_member(&self, message: &StoredMessage) -> Option<Arc<ConsumerKey>> {
        let members = self.members_snapshot.load();
        members
            .iter()
            .find(|member| !member.is_specific())
            .or_else(|| members.iter().find(|member| member.matches(message)))
            .cloned()
    }

    fn has_general_member(&self) -> bool {
        self.members_snapshot
            .load()
            .iter()
            .any(|member| !member.is_specific())
    }

    fn rebuild_snapshot(&self, state: &GroupState) {
        self.members_snapshot.store(Arc::new(state.members.clone()));
    }

    pub(crate) fn add_member(&self, key: Arc<ConsumerKey>) -> GroupChange {
        let mut state = self.state.lock();
        state.members.push(key);
        self.rebuild_snapshot(&state);
        // A new, not yet started member makes the group not ready.
        state.evaluate()
    }

    pub(crate) fn remove_member(&self, key_id: u64) -> GroupChange {
        let mut state = self.state.lock();
        state.members.retain(|member| member.id() != key_id);
        state.started.remove(&key_id);
        state.forget_ready(key_id);
        self.rebuild_snapshot(&state);
        state.evaluate()
    }

    pub(crate) fn set_member_started(&self, key_id: u64, started: bool) -> GroupChange {
        let mut state = self.state.lock();
        if started {
            state.started.insert(key_id);
        } else {
            state.started.remove(&key_id);
            state.forget_ready(key_id);
        }
        state.evaluate()
    }

    pub(crate) fn set_member_ready(&self, key_id: u64, specific: bool, ready: bool) -> GroupChange {
        let mut state = self.state.lock();
        state.forget_ready(key_id);
        if ready {
            if specific {
                state.ready_specific.push(key_id);
            } else {
                state.ready_general.push(key_id);
            }
        }
        state.evaluate()
    }

    /// Picks the ready member that takes `message` and marks it not ready.
    pub(crate) fn take_ready_member_for(
        &self,
        message: &StoredMessage,
    ) -> Option<(Arc<ConsumerKey>, GroupChange)> {
        let mut state = self.state.lock();
        if !state.is_ready() {
            return None;
        }
        let any_may_claim = state.members.iter().any(|member| !member.is_specific());
        let chosen = if any_may_claim {
            state
                .ready_general
                .first()
                .or_else(|| state.ready_specific.first())
                .copied()
        } else {
            state.ready_specific.iter().copied().find(|id| {
                state
                    .members
                    .iter()
                    .any(|member| member.id() == *id && member.matches(message))
            })
        }?;
        let member = state
            .members
            .iter()
            .find(|member| member.id() == chosen)
            .cloned()?;
        state.forget_ready(chosen);
        member.state.lock().ready = false;
        let change = state.evaluate();
        Some((member, change))
    }

    /// Locks the next message `key` may take from the shared cursors.
    pub(crate) fn next_message_for(
        &self,
        key: &ConsumerKey,
        store: &dyn MessageStore,
    ) -> Result<Option<LockedMessage>> {
        let any_may_claim = self.has_general_member();
        let accept = |message: &StoredMessage| any_may_claim || key.matches(message);
        let table = self.classifications.read();
        let mut cursors = self.cursors.lock();
        cursors.next_locked(store, &table, &accept, &mut rand::thread_rng())
    }
}

impl fmt::Debug for ConsumerKeyGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConsumerKeyGroup")
            .field("id", &self.id)
            .field("connection", &self.connection)
            .field("members", &self.member_count())
            .finish_non_exhaustive()
    }
}
