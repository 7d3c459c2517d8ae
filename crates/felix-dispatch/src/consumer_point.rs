// Local consumer points: asynchronous delivery to a listener, or synchronous
// receive, with per-consumer and consumer-set active-message limits.
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;

use felix_storage::{LockedMessage, MessageId, StoredMessage};

use crate::alarm::{AlarmHandle, AlarmService};
use crate::consumer_set::ConsumerSetMember;
use crate::destination::Destination;
use crate::key::{ConsumableKey, ConsumerOptions, ConsumerPointHandle, DetachReason, Offer};
use crate::{DispatchError, Result};

/// Reasons a consumer point is not taking messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct SuspendFlags(u8);

impl SuspendFlags {
    pub const STOPPED: Self = Self(0b001);
    /// The consumer set is at its limit.
    pub const SET_ACTIVE_MSGS: Self = Self(0b010);
    /// This consumer is at its own limit.
    pub const ACTIVE_MSGS: Self = Self(0b100);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Self) {
        self.0 &= !other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// Receives messages delivered to a consumer point. Calls for one point never
/// overlap.
pub trait MessageListener: Send + Sync {
    fn on_message(&self, message: LockedMessage);

    /// The consumer was closed underneath the application.
    fn on_detached(&self, _reason: DetachReason) {}
}

type ActiveMap = HashMap<MessageId, LockedMessage, ahash::RandomState>;

#[derive(Default)]
struct PointState {
    flags: SuspendFlags,
    closed: bool,
    delivering: bool,
    // Set when delivery was requested while another thread was delivering.
    rerun: bool,
    // Locked by an offer, not yet handed to the listener.
    pending: VecDeque<LockedMessage>,
    // Every message locked by this point and not yet consumed or unlocked.
    active: ActiveMap,
    // Zero is unbounded.
    max_active: usize,
    block_alarm: Option<AlarmHandle>,
    block_generation: u64,
    block_reported: bool,
}

impl PointState {
    fn below_limit(&self) -> bool {
        self.max_active == 0 || self.active.len() < self.max_active
    }
}

/// A consumer on this node attached to a destination through a key.
pub struct LocalConsumerPoint {
    key: Arc<dyn ConsumableKey>,
    listener: Option<Arc<dyn MessageListener>>,
    alarms: AlarmService,
    block_interval: Option<Duration>,
    state: Mutex<PointState>,
    // Wakes synchronous receivers when something may have become receivable.
    arrived: Notify,
    self_ref: Weak<LocalConsumerPoint>,
    member_ref: Weak<dyn ConsumerSetMember>,
}

impl LocalConsumerPoint {
    /// Attaches a new, stopped consumer to `destination`. Without a listener
    /// the consumer is driven by [`LocalConsumerPoint::receive_no_wait`].
    pub fn attach(
        destination: &Destination,
        options: &ConsumerOptions,
        listener: Option<Arc<dyn MessageListener>>,
        alarms: AlarmService,
    ) -> Result<Arc<Self>> {
        let key = destination.attach(options)?;
        Ok(Self::with_key(
            key,
            options.max_active,
            options.active_msg_block_interval,
            listener,
            alarms,
        ))
    }

    /// Wraps an already attached key. `max_active == 0` is unbounded.
    pub fn with_key(
        key: Arc<dyn ConsumableKey>,
        max_active: usize,
        block_interval: Option<Duration>,
        listener: Option<Arc<dyn MessageListener>>,
        alarms: AlarmService,
    ) -> Arc<Self> {
        let point = Arc::new_cyclic(|self_ref: &Weak<LocalConsumerPoint>| {
            let member_ref: Weak<dyn ConsumerSetMember> = self_ref.clone();
            Self {
                key,
                listener,
                alarms,
                block_interval,
                state: Mutex::new(PointState {
                    flags: SuspendFlags::STOPPED,
                    max_active,
                    ..PointState::default()
                }),
                arrived: Notify::new(),
                self_ref: self_ref.clone(),
                member_ref,
            }
        });
        let handle: Weak<dyn ConsumerPointHandle> = point.self_ref.clone();
        point.key.bind_point(handle);
        if let Some(set) = point.key.consumer_set() {
            set.add_member(point.member_ref.clone());
        }
        point
    }

    pub fn key(&self) -> &Arc<dyn ConsumableKey> {
        &self.key
    }

    pub fn suspend_flags(&self) -> SuspendFlags {
        self.state.lock().flags
    }

    pub fn active_count(&self) -> usize {
        self.state.lock().active.len()
    }

    pub fn max_active(&self) -> usize {
        self.state.lock().max_active
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// True once the consumer has been blocked on its own limit for longer
    /// than the block interval, until the limit clears.
    pub fn active_limit_alarm_raised(&self) -> bool {
        self.state.lock().block_reported
    }

    pub fn start(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.flags.remove(SuspendFlags::STOPPED);
        }
        self.key.started(true);
        self.run_delivery();
    }

    pub fn stop(&self) {
        self.state.lock().flags.insert(SuspendFlags::STOPPED);
        self.key.not_ready();
        self.key.started(false);
    }

    /// Locks the next available message for a listener-less consumer.
    pub fn receive_no_wait(&self) -> Result<Option<LockedMessage>> {
        if self.listener.is_some() {
            return Err(DispatchError::Usage(
                "synchronous receive on a consumer with a message listener".to_string(),
            ));
        }
        let mut state = self.state.lock();
        if state.closed {
            return Err(DispatchError::Closed);
        }
        if let Some(message) = state.pending.pop_front() {
            return Ok(Some(message));
        }
        if !state.flags.is_empty() {
            return Ok(None);
        }
        match self.lock_next(&mut state) {
            Err(err) => {
                state.closed = true;
                drop(state);
                self.tear_down(&err);
                Err(err)
            }
            found => found,
        }
    }

    /// Waits up to `timeout` (None waits forever) for a message on a
    /// listener-less consumer. `Ok(None)` means the timeout passed.
    pub async fn receive(&self, timeout: Option<Duration>) -> Result<Option<LockedMessage>> {
        if let Some(message) = self.receive_no_wait()? {
            return Ok(Some(message));
        }
        let deadline = timeout.map(|timeout| tokio::time::Instant::now() + timeout);
        self.key.waiting(timeout, false);
        let received = loop {
            let mut notified = std::pin::pin!(self.arrived.notified());
            notified.as_mut().enable();
            self.key.ready();
            if let Some(message) = self.receive_no_wait()? {
                break Some(message);
            }
            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        break None;
                    }
                }
                None => notified.await,
            }
        };
        self.key.not_ready();
        Ok(received)
    }

    /// Deletes a delivered message.
    pub fn consume(&self, message: &LockedMessage) -> Result<()> {
        self.finish(message, true)
    }

    /// Gives a delivered message back for redelivery.
    pub fn unlock(&self, message: &LockedMessage) -> Result<()> {
        self.finish(message, false)
    }

    /// Unlocks every message this consumer holds, delivered or not, and
    /// starts delivering again. Returns the first unlock failure.
    pub fn unlock_all(&self) -> Result<()> {
        let held: Vec<LockedMessage> = {
            let mut state = self.state.lock();
            if state.closed {
                return Err(DispatchError::Closed);
            }
            state.pending.clear();
            state.active.drain().map(|(_, message)| message).collect()
        };
        if held.is_empty() {
            return Ok(());
        }
        let mut first_error = None;
        for message in &held {
            if let Err(err) = self.key.release(message, false) {
                tracing::warn!(message_id = %message.id(), error = %err, "unlock failed");
                first_error.get_or_insert(err);
            }
        }
        tracing::debug!(released = held.len(), "consumer unlocked everything it held");
        self.remove_active_messages(held.len())?;
        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Changes this consumer's own active message limit. Zero is unbounded.
    /// Raising the limit past what is held resumes delivery at once.
    pub fn set_max_active(&self, max_active: usize) {
        let unblocked = {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.max_active = max_active;
            if state.below_limit() {
                self.clear_active_limit(&mut state)
            } else {
                self.enter_active_limit(&mut state);
                false
            }
        };
        if unblocked {
            self.run_delivery();
        }
    }

    /// Closes the consumer, unlocking everything it still holds.
    pub fn close(&self) {
        if self.begin_close() {
            self.finish_close(DetachReason::ApplicationClose, true);
        }
    }

    fn finish(&self, message: &LockedMessage, consumed: bool) -> Result<()> {
        if self.state.lock().active.remove(&message.id()).is_none() {
            return Err(DispatchError::Usage(format!(
                "message {} is not locked by this consumer",
                message.id()
            )));
        }
        let released = self.key.release(message, consumed);
        self.remove_active_messages(1)?;
        released
    }

    fn remove_active_messages(&self, count: usize) -> Result<()> {
        if let Some(set) = self.key.consumer_set() {
            set.remove_active_messages(count)?;
        }
        let unblocked = {
            let mut state = self.state.lock();
            state.below_limit() && self.clear_active_limit(&mut state)
        };
        if unblocked {
            self.run_delivery();
        }
        Ok(())
    }

    // Returns true if the consumer was blocked on its own limit.
    fn clear_active_limit(&self, state: &mut PointState) -> bool {
        if !state.flags.contains(SuspendFlags::ACTIVE_MSGS) {
            return false;
        }
        state.flags.remove(SuspendFlags::ACTIVE_MSGS);
        state.block_generation += 1;
        if let Some(alarm) = state.block_alarm.take() {
            alarm.cancel();
        }
        if std::mem::take(&mut state.block_reported) {
            tracing::info!(
                active = state.active.len(),
                max_active = state.max_active,
                "consumer no longer blocked on its active message limit"
            );
        }
        true
    }

    // Caller holds the point lock: admission and the lock on the message are
    // decided together.
    fn lock_next(&self, state: &mut PointState) -> Result<Option<LockedMessage>> {
        let admission = self.key.prepare_add_active_message();
        if admission.is_refused() {
            state.flags.insert(SuspendFlags::SET_ACTIVE_MSGS);
            return Ok(None);
        }
        match self.key.get_next_message() {
            Ok(Some(message)) => {
                admission.commit();
                self.record_active(state, &message);
                Ok(Some(message))
            }
            Ok(None) => {
                admission.rollback();
                Ok(None)
            }
            Err(err) => {
                admission.rollback();
                Err(err)
            }
        }
    }

    fn record_active(&self, state: &mut PointState, message: &LockedMessage) {
        state.active.insert(message.id(), message.clone());
        if !state.below_limit() {
            self.enter_active_limit(state);
        }
    }

    fn enter_active_limit(&self, state: &mut PointState) {
        if state.flags.contains(SuspendFlags::ACTIVE_MSGS) {
            return;
        }
        state.flags.insert(SuspendFlags::ACTIVE_MSGS);
        tracing::debug!(
            max_active = state.max_active,
            "consumer reached its active message limit"
        );
        if let Some(interval) = self.block_interval {
            state.block_generation += 1;
            let generation = state.block_generation;
            let point = self.self_ref.clone();
            state.block_alarm = Some(self.alarms.schedule(interval, move || {
                if let Some(point) = point.upgrade() {
                    point.block_alarm_fired(generation);
                }
            }));
        }
    }

    fn block_alarm_fired(&self, generation: u64) {
        let mut state = self.state.lock();
        if state.closed
            || state.block_generation != generation
            || !state.flags.contains(SuspendFlags::ACTIVE_MSGS)
        {
            return;
        }
        state.block_alarm = None;
        state.block_reported = true;
        metrics::counter!("felix_dispatch_active_limit_alarm_total").increment(1);
        tracing::warn!(
            active = state.active.len(),
            max_active = state.max_active,
            "consumer blocked on its active message limit"
        );
    }

    /// Delivers until there is nothing left to hand to the listener. Only one
    /// thread delivers at a time; others leave a rerun request.
    fn run_delivery(&self) {
        let Some(listener) = &self.listener else {
            self.arrived.notify_waiters();
            return;
        };
        {
            let mut state = self.state.lock();
            if state.delivering {
                state.rerun = true;
                return;
            }
            state.delivering = true;
        }
        while let Some(message) = self.next_delivery() {
            metrics::counter!("felix_dispatch_delivered_total").increment(1);
            listener.on_message(message);
        }
    }

    // Returns None after clearing `delivering`.
    fn next_delivery(&self) -> Option<LockedMessage> {
        let mut readied = false;
        loop {
            let mut state = self.state.lock();
            if let Some(message) = state.pending.pop_front() {
                drop(state);
                if readied {
                    self.key.not_ready();
                }
                return Some(message);
            }
            if state.closed || !state.flags.is_empty() {
                state.delivering = false;
                state.rerun = false;
                return None;
            }
            match self.lock_next(&mut state) {
                Ok(Some(message)) => {
                    drop(state);
                    if readied {
                        self.key.not_ready();
                    }
                    return Some(message);
                }
                Ok(None) if !state.flags.is_empty() => {
                    state.delivering = false;
                    state.rerun = false;
                    return None;
                }
                Ok(None) => {
                    if readied && !std::mem::take(&mut state.rerun) {
                        state.delivering = false;
                        return None;
                    }
                    state.rerun = false;
                    drop(state);
                    // Going ready races with puts, so poll once more afterwards.
                    readied = self.key.ready();
                    if !readied {
                        let mut state = self.state.lock();
                        if !std::mem::take(&mut state.rerun) {
                            state.delivering = false;
                            return None;
                        }
                    }
                }
                Err(err) => {
                    state.closed = true;
                    state.delivering = false;
                    drop(state);
                    self.tear_down(&err);
                    return None;
                }
            }
        }
    }

    // The key can no longer serve. Close off the caller's stack.
    fn tear_down(&self, error: &DispatchError) {
        tracing::warn!(error = %error, "consumer key failed; closing consumer");
        let Some(point) = self.self_ref.upgrade() else {
            return;
        };
        self.alarms
            .spawn(move || point.finish_close(DetachReason::StoreFailure, true));
    }

    fn begin_close(&self) -> bool {
        let mut state = self.state.lock();
        !std::mem::replace(&mut state.closed, true)
    }

    fn finish_close(&self, reason: DetachReason, detach_key: bool) {
        let held: Vec<LockedMessage> = {
            let mut state = self.state.lock();
            state.pending.clear();
            state.block_generation += 1;
            if let Some(alarm) = state.block_alarm.take() {
                alarm.cancel();
            }
            state.active.drain().map(|(_, message)| message).collect()
        };
        if detach_key {
            self.key.not_ready();
            self.key.detach(reason);
        }
        let set = self.key.consumer_set();
        if let Some(set) = &set {
            set.remove_member(&self.member_ref);
        }
        for message in &held {
            if let Err(err) = self.key.release(message, false) {
                tracing::warn!(message_id = %message.id(), error = %err, "unlock on close failed");
            }
        }
        if let Some(set) = &set
            && !held.is_empty()
            && let Err(err) = set.remove_active_messages(held.len())
        {
            tracing::error!(
                error = %err,
                released = held.len(),
                "consumer set active count out of step on close"
            );
        }
        tracing::debug!(reason = ?reason, released = held.len(), "consumer point closed");
        self.arrived.notify_waiters();
        if reason != DetachReason::ApplicationClose
            && let Some(listener) = &self.listener
        {
            listener.on_detached(reason);
        }
    }
}

impl ConsumerPointHandle for LocalConsumerPoint {
    fn offer(&self, message: &Arc<StoredMessage>) -> Offer {
        let outcome = {
            let mut state = self.state.lock();
            if state.closed || !state.flags.is_empty() {
                return Offer::Refused;
            }
            let admission = self.key.prepare_add_active_message();
            if admission.is_refused() {
                state.flags.insert(SuspendFlags::SET_ACTIVE_MSGS);
                return Offer::Refused;
            }
            match self.key.try_lock(message) {
                Ok(Some(locked)) => {
                    admission.commit();
                    self.record_active(&mut state, &locked);
                    state.pending.push_back(locked);
                    Offer::Accepted
                }
                Ok(None) => {
                    admission.rollback();
                    Offer::Taken
                }
                Err(err) => {
                    admission.rollback();
                    tracing::warn!(
                        message_id = %message.id(),
                        error = %err,
                        "lock on offered message failed",
                    );
                    return Offer::Refused;
                }
            }
        };
        // Either deliver the accepted message or go ready again.
        self.run_delivery();
        outcome
    }

    fn messages_available(&self) {
        self.run_delivery();
    }

    fn notify_closed(&self, reason: DetachReason) {
        if self.begin_close() {
            self.finish_close(reason, false);
        }
    }
}

impl ConsumerSetMember for LocalConsumerPoint {
    fn consumer_set_resumed(&self) {
        self.state.lock().flags.remove(SuspendFlags::SET_ACTIVE_MSGS);
        self.run_delivery();
    }
}

impl fmt::Debug for LocalConsumerPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("LocalConsumerPoint")
            .field("flags", &state.flags)
            .field("closed", &state.closed)
            .field("active", &state.active.len())
            .field("max_active", &state.max_active)
            .field("listener", &self.listener.is_some())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consumer_set::ConsumerSet;
    use crate::destination::DestinationOptions;
    use bytes::Bytes;
    use felix_common::ids::ConnectionId;
    use felix_storage::{ItemStream, Message, MessageStore};

    #[derive(Default)]
    struct Recorder {
        messages: Mutex<Vec<LockedMessage>>,
        detached: Mutex<Vec<DetachReason>>,
    }

    impl Recorder {
        fn ids(&self) -> Vec<u64> {
            self.messages.lock().iter().map(|m| m.id().0).collect()
        }

        fn take(&self, index: usize) -> LockedMessage {
            self.messages.lock()[index].clone()
        }
    }

    impl MessageListener for Recorder {
        fn on_message(&self, message: LockedMessage) {
            self.messages.lock().push(message);
        }

        fn on_detached(&self, reason: DetachReason) {
            self.detached.lock().push(reason);
        }
    }

    fn queue() -> (Arc<Destination>, Arc<ItemStream>) {
        let store = Arc::new(ItemStream::new());
        let destination = Destination::new("q", store.clone(), DestinationOptions::default());
        (destination, store)
    }

    fn msg() -> Message {
        Message::new(Bytes::from_static(b"payload"))
    }

    fn listening(
        destination: &Arc<Destination>,
        options: ConsumerOptions,
    ) -> (Arc<LocalConsumerPoint>, Arc<Recorder>) {
        let recorder = Arc::new(Recorder::default());
        let point = LocalConsumerPoint::attach(
            destination,
            &options,
            Some(recorder.clone() as Arc<dyn MessageListener>),
            AlarmService::current().expect("runtime"),
        )
        .expect("attach");
        (point, recorder)
    }

    #[test]
    fn suspend_flags_combine() {
        let mut flags = SuspendFlags::default();
        assert!(flags.is_empty());
        flags.insert(SuspendFlags::STOPPED);
        flags.insert(SuspendFlags::ACTIVE_MSGS);
        assert!(flags.contains(SuspendFlags::ACTIVE_MSGS));
        flags.remove(SuspendFlags::STOPPED);
        assert!(!flags.contains(SuspendFlags::STOPPED));
        assert!(!flags.is_empty());
    }

    #[tokio::test]
    async fn started_listener_receives_backlog_then_pushed_messages() {
        let (destination, store) = queue();
        destination.put(msg()).expect("put");
        let (point, recorder) = listening(&destination, ConsumerOptions::new(ConnectionId::new()));
        assert!(recorder.ids().is_empty());

        point.start();
        assert_eq!(recorder.ids(), vec![0]);
        assert!(point.key().is_ready());

        destination.put(msg()).expect("put");
        assert_eq!(recorder.ids(), vec![0, 1]);
        point.consume(&recorder.take(0)).expect("consume");
        point.consume(&recorder.take(1)).expect("consume");
        assert_eq!(point.active_count(), 0);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn stopped_consumer_is_not_offered_messages() {
        let (destination, store) = queue();
        let (point, recorder) = listening(&destination, ConsumerOptions::new(ConnectionId::new()));
        point.start();
        point.stop();
        assert!(!point.key().is_ready());
        destination.put(msg()).expect("put");
        assert!(recorder.ids().is_empty());
        assert_eq!(store.available(), 1);
        point.start();
        assert_eq!(recorder.ids(), vec![0]);
    }

    #[tokio::test(start_paused = true)]
    async fn local_limit_blocks_and_raises_alarm_until_cleared() {
        let (destination, store) = queue();
        let options = ConsumerOptions::new(ConnectionId::new())
            .max_active(2)
            .block_interval(Duration::from_millis(100));
        let (point, recorder) = listening(&destination, options);
        point.start();
        for _ in 0..3 {
            destination.put(msg()).expect("put");
        }
        assert_eq!(recorder.ids(), vec![0, 1]);
        assert!(point.suspend_flags().contains(SuspendFlags::ACTIVE_MSGS));
        assert_eq!(store.available(), 1);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!point.active_limit_alarm_raised());
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(point.active_limit_alarm_raised());

        point.consume(&recorder.take(0)).expect("consume");
        assert_eq!(recorder.ids(), vec![0, 1, 2]);
        // Back at the limit with a fresh, unreported block.
        assert!(point.suspend_flags().contains(SuspendFlags::ACTIVE_MSGS));
        assert!(!point.active_limit_alarm_raised());
    }

    #[tokio::test(start_paused = true)]
    async fn block_alarm_is_cancelled_when_limit_clears_early() {
        let (destination, _store) = queue();
        let options = ConsumerOptions::new(ConnectionId::new())
            .max_active(1)
            .block_interval(Duration::from_millis(100));
        let (point, recorder) = listening(&destination, options);
        point.start();
        destination.put(msg()).expect("put");
        tokio::time::sleep(Duration::from_millis(40)).await;
        point.consume(&recorder.take(0)).expect("consume");
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!point.active_limit_alarm_raised());
        assert!(point.suspend_flags().is_empty());
    }

    #[tokio::test]
    async fn consumer_set_limit_suspends_members_and_resumes_them() {
        let (destination, _store) = queue();
        let set = ConsumerSet::with_limit("pair", 2);
        let conn = ConnectionId::new();
        let (a, seen_a) = listening(&destination, ConsumerOptions::new(conn).in_set(set.clone()));
        let (b, seen_b) = listening(&destination, ConsumerOptions::new(conn).in_set(set.clone()));
        assert_eq!(set.member_count(), 2);
        a.start();
        b.start();
        for _ in 0..3 {
            destination.put(msg()).expect("put");
        }
        assert_eq!(seen_a.ids().len() + seen_b.ids().len(), 2);
        assert!(set.is_consumer_set_suspended());
        assert_eq!(set.current_active(), 2);
        let parked = [&a, &b]
            .iter()
            .filter(|point| point.suspend_flags().contains(SuspendFlags::SET_ACTIVE_MSGS))
            .count();
        assert!(parked >= 1);

        let (holder, seen) = if seen_a.ids().is_empty() { (&b, &seen_b) } else { (&a, &seen_a) };
        holder.consume(&seen.take(0)).expect("consume");
        assert_eq!(seen_a.ids().len() + seen_b.ids().len(), 3);
        assert_eq!(set.current_active(), 2);
        assert!(set.is_consumer_set_suspended());
    }

    #[tokio::test(start_paused = true)]
    async fn cursor_failure_closes_consumer_asynchronously() {
        let (destination, store) = queue();
        let (point, recorder) = listening(&destination, ConsumerOptions::new(ConnectionId::new()));
        store.fail("disk gone");
        point.start();
        assert!(point.is_closed());
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(*recorder.detached.lock(), vec![DetachReason::StoreFailure]);
        assert_eq!(destination.consumer_count(), 0);
    }

    #[tokio::test]
    async fn consume_twice_is_a_usage_error() {
        let (destination, _store) = queue();
        let (point, recorder) = listening(&destination, ConsumerOptions::new(ConnectionId::new()));
        point.start();
        destination.put(msg()).expect("put");
        let message = recorder.take(0);
        point.consume(&message).expect("consume");
        assert!(matches!(point.consume(&message), Err(DispatchError::Usage(_))));
    }

    #[tokio::test]
    async fn unlocked_message_is_redelivered() {
        let (destination, _store) = queue();
        let (point, recorder) = listening(&destination, ConsumerOptions::new(ConnectionId::new()));
        point.start();
        destination.put(msg()).expect("put");
        point.unlock(&recorder.take(0)).expect("unlock");
        assert_eq!(recorder.ids(), vec![0, 0]);
        assert_eq!(point.active_count(), 1);
    }

    #[tokio::test]
    async fn unlock_all_redelivers_everything_held() {
        let (destination, store) = queue();
        let (point, recorder) = listening(&destination, ConsumerOptions::new(ConnectionId::new()));
        point.start();
        destination.put(msg()).expect("put");
        destination.put(msg()).expect("put");
        assert_eq!(recorder.ids(), vec![0, 1]);
        assert!(!recorder.take(0).is_redelivered());

        point.unlock_all().expect("unlock all");
        assert_eq!(recorder.ids(), vec![0, 1, 0, 1]);
        assert_eq!(point.active_count(), 2);
        assert_eq!(recorder.take(2).unlock_count(), 1);
        assert!(recorder.take(3).is_redelivered());
        assert_eq!(store.available(), 0);

        point.close();
        assert!(matches!(point.unlock_all(), Err(DispatchError::Closed)));
    }

    #[tokio::test]
    async fn raising_max_active_resumes_delivery() {
        let (destination, _store) = queue();
        let options = ConsumerOptions::new(ConnectionId::new()).max_active(1);
        let (point, recorder) = listening(&destination, options);
        point.start();
        for _ in 0..3 {
            destination.put(msg()).expect("put");
        }
        assert_eq!(recorder.ids(), vec![0]);
        assert!(point.suspend_flags().contains(SuspendFlags::ACTIVE_MSGS));

        point.set_max_active(3);
        assert_eq!(recorder.ids(), vec![0, 1, 2]);
        assert!(point.suspend_flags().contains(SuspendFlags::ACTIVE_MSGS));

        point.set_max_active(0);
        assert_eq!(point.max_active(), 0);
        assert!(point.suspend_flags().is_empty());
        destination.put(msg()).expect("put");
        assert_eq!(recorder.ids(), vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn lowering_max_active_blocks_until_enough_are_consumed() {
        let (destination, store) = queue();
        let (point, recorder) = listening(&destination, ConsumerOptions::new(ConnectionId::new()));
        point.start();
        destination.put(msg()).expect("put");
        destination.put(msg()).expect("put");
        point.set_max_active(1);
        assert!(point.suspend_flags().contains(SuspendFlags::ACTIVE_MSGS));

        destination.put(msg()).expect("put");
        assert_eq!(recorder.ids(), vec![0, 1]);
        assert_eq!(store.available(), 1);
        point.consume(&recorder.take(0)).expect("consume");
        assert!(point.suspend_flags().contains(SuspendFlags::ACTIVE_MSGS));
        assert_eq!(recorder.ids(), vec![0, 1]);
        point.consume(&recorder.take(1)).expect("consume");
        assert_eq!(recorder.ids(), vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn close_finishes_when_the_set_count_is_out_of_step() {
        let (destination, _store) = queue();
        let set = ConsumerSet::with_limit("s", 10);
        let conn = ConnectionId::new();
        let (first, _seen_first) =
            listening(&destination, ConsumerOptions::new(conn).in_set(set.clone()));
        first.start();
        destination.put(msg()).expect("put");
        set.remove_active_messages(1).expect("remove");
        assert_eq!(set.current_active(), 0);
        let (second, seen_second) = listening(&destination, ConsumerOptions::new(conn));
        second.start();

        first.close();
        assert!(first.is_closed());
        assert_eq!(set.member_count(), 0);
        assert_eq!(set.current_active(), 0);
        assert_eq!(seen_second.ids(), vec![0]);
    }

    #[tokio::test]
    async fn close_hands_held_messages_to_other_consumers() {
        let (destination, _store) = queue();
        let conn = ConnectionId::new();
        let (first, seen_first) = listening(&destination, ConsumerOptions::new(conn));
        first.start();
        destination.put(msg()).expect("put");
        let (second, seen_second) = listening(&destination, ConsumerOptions::new(conn));
        second.start();

        first.close();
        first.close();
        assert!(first.is_closed());
        assert_eq!(seen_first.ids(), vec![0]);
        assert!(seen_first.detached.lock().is_empty());
        assert_eq!(seen_second.ids(), vec![0]);
        assert_eq!(destination.consumer_count(), 1);
        assert_eq!(second.active_count(), 1);
    }

    #[tokio::test]
    async fn destination_delete_notifies_listener_once() {
        let (destination, _store) = queue();
        let set = ConsumerSet::with_limit("s", 10);
        let (point, recorder) = listening(
            &destination,
            ConsumerOptions::new(ConnectionId::new()).in_set(set.clone()),
        );
        point.start();
        destination.put(msg()).expect("put");
        assert_eq!(set.current_active(), 1);
        destination.delete();
        assert!(point.is_closed());
        assert_eq!(*recorder.detached.lock(), vec![DetachReason::DestinationDeleted]);
        assert_eq!(set.current_active(), 0);
        assert_eq!(set.member_count(), 0);
        point.notify_closed(DetachReason::DestinationDeleted);
        assert_eq!(recorder.detached.lock().len(), 1);
    }

    #[tokio::test]
    async fn receive_no_wait_polls_for_listenerless_consumers() {
        let (destination, _store) = queue();
        let point = LocalConsumerPoint::attach(
            &destination,
            &ConsumerOptions::new(ConnectionId::new()).max_active(1),
            None,
            AlarmService::current().expect("runtime"),
        )
        .expect("attach");
        destination.put(msg()).expect("put");
        destination.put(msg()).expect("put");
        // Stopped consumers get nothing.
        assert!(point.receive_no_wait().expect("receive").is_none());
        point.start();
        let first = point.receive_no_wait().expect("receive").expect("message");
        assert_eq!(first.id().0, 0);
        assert!(point.receive_no_wait().expect("receive").is_none());
        point.consume(&first).expect("consume");
        let second = point.receive_no_wait().expect("receive").expect("message");
        assert_eq!(second.id().0, 1);
        point.close();
        assert!(matches!(point.receive_no_wait(), Err(DispatchError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn receive_waits_for_a_put_or_the_timeout() {
        let (destination, store) = queue();
        let point = LocalConsumerPoint::attach(
            &destination,
            &ConsumerOptions::new(ConnectionId::new()),
            None,
            AlarmService::current().expect("runtime"),
        )
        .expect("attach");
        point.start();

        let started = tokio::time::Instant::now();
        let nothing = point
            .receive(Some(Duration::from_millis(100)))
            .await
            .expect("receive");
        assert!(nothing.is_none());
        assert_eq!(started.elapsed(), Duration::from_millis(100));
        assert!(!point.key().is_ready());

        let producer = Arc::clone(&destination);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            producer.put(msg()).expect("put");
        });
        let message = point
            .receive(Some(Duration::from_secs(5)))
            .await
            .expect("receive")
            .expect("message");
        assert_eq!(started.elapsed(), Duration::from_millis(130));
        assert!(store.is_locked(message.id()));
        assert_eq!(point.active_count(), 1);
        assert!(!point.key().is_ready());
    }

    #[tokio::test(start_paused = true)]
    async fn close_wakes_a_waiting_receive() {
        let (destination, _store) = queue();
        let point = LocalConsumerPoint::attach(
            &destination,
            &ConsumerOptions::new(ConnectionId::new()),
            None,
            AlarmService::current().expect("runtime"),
        )
        .expect("attach");
        point.start();
        let closer = Arc::clone(&point);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            closer.close();
        });
        assert!(matches!(point.receive(None).await, Err(DispatchError::Closed)));
    }
}
