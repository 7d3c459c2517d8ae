// Serving-side consumer point for one remote consumer.
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;

use felix_dispatch::{
    AlarmHandle, AlarmService, ConsumableKey, ConsumerKey, ConsumerPointHandle, DetachReason,
    Offer,
};
use felix_storage::{LockedMessage, StoredMessage};

use crate::correlation::TickTable;
use crate::tick::{RequestTick, Tick};
use crate::transport::RequesterId;
use crate::{AnycastError, Result};

/// Owner of remote consumer points. Never called with a point lock held.
pub trait RemotePointParent: Send + Sync {
    /// `message` is locked by `key` and stays locked until the parent
    /// releases it through that key.
    fn request_satisfied(
        &self,
        requester: RequesterId,
        tick: Tick,
        message: LockedMessage,
        key: &Arc<ConsumerKey>,
    );

    fn request_expired(&self, requester: RequesterId, tick: Tick);

    fn point_closed(&self, requester: RequesterId, reason: DetachReason);
}

// Work gathered under the point lock and carried out after it is released.
#[derive(Default)]
struct Outcomes {
    satisfied: Vec<(Tick, LockedMessage)>,
    expired: Vec<Tick>,
    // Locked for a tick that lost its race; handed back to the queue.
    unlock: Vec<LockedMessage>,
    closed: Option<DetachReason>,
}

#[derive(Default)]
struct PointState {
    requests: TickTable<Arc<RequestTick>>,
    expiry: HashMap<Tick, AlarmHandle, ahash::RandomState>,
    // Armed iff no request is outstanding.
    idle_alarm: Option<AlarmHandle>,
    idle_generation: u64,
    closed: bool,
}

/// Outstanding get requests of one remote consumer, served strictly in
/// arrival order from a key on the local destination.
///
/// The point is `accepting` until it closes, which happens on explicit close,
/// after `idle_timeout` with no outstanding request, or when its key fails.
/// Nothing leaves the closed state.
pub struct RemoteConsumerPoint {
    requester: RequesterId,
    key: Arc<ConsumerKey>,
    parent: Weak<dyn RemotePointParent>,
    alarms: AlarmService,
    idle_timeout: Duration,
    state: Mutex<PointState>,
    self_ref: Weak<RemoteConsumerPoint>,
}

impl RemoteConsumerPoint {
    /// Binds a new point to `key` and arms its idle alarm.
    pub fn new(
        requester: RequesterId,
        key: Arc<ConsumerKey>,
        parent: Weak<dyn RemotePointParent>,
        alarms: AlarmService,
        idle_timeout: Duration,
    ) -> Arc<Self> {
        let point = Arc::new_cyclic(|self_ref| Self {
            requester,
            key,
            parent,
            alarms,
            idle_timeout,
            state: Mutex::new(PointState::default()),
            self_ref: self_ref.clone(),
        });
        let handle: Weak<dyn ConsumerPointHandle> = point.self_ref.clone();
        point.key.bind_point(handle);
        point.arm_idle(&mut point.state.lock());
        point
    }

    pub fn requester(&self) -> RequesterId {
        self.requester
    }

    pub fn key(&self) -> &Arc<ConsumerKey> {
        &self.key
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn outstanding(&self) -> usize {
        self.state.lock().requests.len()
    }

    pub fn is_idle_alarm_armed(&self) -> bool {
        self.state.lock().idle_alarm.is_some()
    }

    /// Registers a get request. `Some(ZERO)` is a poll: if no message can be
    /// locked right away the tick expires before this returns.
    pub fn new_request(&self, tick: Tick, timeout: Option<Duration>) -> Result<()> {
        let mut outcomes = Outcomes::default();
        {
            let mut state = self.state.lock();
            if state.closed {
                return Err(AnycastError::Closed);
            }
            self.disarm_idle(&mut state);
            let request = Arc::new(RequestTick::new(tick, timeout));
            if !state.requests.insert(tick, Arc::clone(&request)) {
                tracing::warn!(
                    requester = %self.requester,
                    %tick,
                    "duplicate request tick ignored",
                );
                self.settle(&mut state, &mut outcomes);
                drop(state);
                self.complete(outcomes);
                return Ok(());
            }
            if let Some(delay) = timeout
                && !delay.is_zero()
            {
                let point = self.self_ref.clone();
                let alarm = self.alarms.schedule(delay, move || {
                    if let Some(point) = point.upgrade() {
                        point.expire(tick);
                    }
                });
                state.expiry.insert(tick, alarm);
            }
            self.settle(&mut state, &mut outcomes);
            if timeout == Some(Duration::ZERO) && state.requests.contains(tick) {
                self.resolve_expired(&mut state, tick, &mut outcomes);
                self.settle(&mut state, &mut outcomes);
            }
        }
        self.complete(outcomes);
        Ok(())
    }

    /// Cancels a pending tick, reporting it expired. Returns false if the tick
    /// had already been resolved.
    pub fn cancel(&self, tick: Tick) -> bool {
        let mut outcomes = Outcomes::default();
        let cancelled = {
            let mut state = self.state.lock();
            let cancelled = self.resolve_expired(&mut state, tick, &mut outcomes);
            if cancelled {
                self.settle(&mut state, &mut outcomes);
            }
            cancelled
        };
        self.complete(outcomes);
        cancelled
    }

    fn expire(&self, tick: Tick) {
        let mut outcomes = Outcomes::default();
        {
            let mut state = self.state.lock();
            state.expiry.remove(&tick);
            if self.resolve_expired(&mut state, tick, &mut outcomes) {
                tracing::debug!(requester = %self.requester, %tick, "request expired");
                self.settle(&mut state, &mut outcomes);
            }
        }
        self.complete(outcomes);
    }

    /// Closes the point, expiring every pending tick and detaching its key.
    pub fn close(&self, reason: DetachReason) {
        let mut outcomes = Outcomes::default();
        {
            let mut state = self.state.lock();
            self.shut(&mut state, reason, &mut outcomes);
        }
        self.complete(outcomes);
    }

    // The single pending-to-expired path shared by cancel, expiry and close.
    fn resolve_expired(&self, state: &mut PointState, tick: Tick, outcomes: &mut Outcomes) -> bool {
        let Some(request) = state.requests.remove(tick) else {
            return false;
        };
        if let Some(alarm) = state.expiry.remove(&tick) {
            alarm.cancel();
        }
        if request.try_expire() {
            outcomes.expired.push(tick);
            true
        } else {
            false
        }
    }

    /// Publishes readiness to match the request list, draining what can be
    /// served right away.
    fn settle(&self, state: &mut PointState, outcomes: &mut Outcomes) {
        if state.closed {
            return;
        }
        if !state.requests.is_empty() {
            // Ready first: a put racing with the drain is then offered to us.
            self.key.ready();
            self.drain(state, outcomes);
        }
        if state.requests.is_empty() && !state.closed {
            self.key.not_ready();
            self.arm_idle(state);
        }
    }

    // Bounded: every iteration resolves one tick or stops.
    fn drain(&self, state: &mut PointState, outcomes: &mut Outcomes) {
        loop {
            let Some((tick, request)) = state
                .requests
                .front()
                .map(|(tick, request)| (tick, Arc::clone(request)))
            else {
                return;
            };
            match self.key.get_next_message() {
                Ok(Some(message)) => {
                    self.resolve_satisfied(state, tick, &request, message, outcomes)
                }
                Ok(None) => return,
                Err(err) => {
                    tracing::warn!(
                        requester = %self.requester,
                        error = %err,
                        "remote consumer key failed",
                    );
                    self.shut(state, DetachReason::StoreFailure, outcomes);
                    return;
                }
            }
        }
    }

    fn resolve_satisfied(
        &self,
        state: &mut PointState,
        tick: Tick,
        request: &RequestTick,
        message: LockedMessage,
        outcomes: &mut Outcomes,
    ) {
        state.requests.remove(tick);
        if let Some(alarm) = state.expiry.remove(&tick) {
            alarm.cancel();
        }
        if request.try_satisfy() {
            outcomes.satisfied.push((tick, message));
        } else {
            outcomes.unlock.push(message);
        }
    }

    fn shut(&self, state: &mut PointState, reason: DetachReason, outcomes: &mut Outcomes) {
        if state.closed {
            return;
        }
        for (tick, request) in state.requests.drain() {
            if request.try_expire() {
                outcomes.expired.push(tick);
            }
        }
        for (_, alarm) in state.expiry.drain() {
            alarm.cancel();
        }
        self.disarm_idle(state);
        state.closed = true;
        outcomes.closed = Some(reason);
    }

    fn arm_idle(&self, state: &mut PointState) {
        if state.closed || state.idle_alarm.is_some() {
            return;
        }
        state.idle_generation += 1;
        let generation = state.idle_generation;
        let point = self.self_ref.clone();
        state.idle_alarm = Some(self.alarms.schedule(self.idle_timeout, move || {
            if let Some(point) = point.upgrade() {
                point.idle_fired(generation);
            }
        }));
    }

    fn disarm_idle(&self, state: &mut PointState) {
        if let Some(alarm) = state.idle_alarm.take() {
            alarm.cancel();
        }
        state.idle_generation += 1;
    }

    fn idle_fired(&self, generation: u64) {
        let mut outcomes = Outcomes::default();
        {
            let mut state = self.state.lock();
            if state.closed || state.idle_generation != generation || !state.requests.is_empty() {
                return;
            }
            state.idle_alarm = None;
            self.shut(&mut state, DetachReason::IdleTimeout, &mut outcomes);
        }
        metrics::counter!("felix_remote_point_idle_close_total").increment(1);
        tracing::info!(
            requester = %self.requester,
            "remote consumer point closed after idle timeout",
        );
        self.complete(outcomes);
    }

    // Runs with no point lock held.
    fn complete(&self, outcomes: Outcomes) {
        if let Some(reason) = outcomes.closed {
            self.key.not_ready();
            self.key.detach(reason);
        }
        for message in &outcomes.unlock {
            if let Err(err) = self.key.release(message, false) {
                tracing::warn!(
                    message_id = %message.id(),
                    error = %err,
                    "unlock of unclaimed message failed",
                );
            }
        }
        let parent = self.parent.upgrade();
        for (tick, message) in outcomes.satisfied {
            metrics::counter!("felix_remote_tick_satisfied_total").increment(1);
            tracing::debug!(
                requester = %self.requester,
                %tick,
                message_id = %message.id(),
                "request satisfied",
            );
            match &parent {
                Some(parent) => parent.request_satisfied(self.requester, tick, message, &self.key),
                None => {
                    if let Err(err) = self.key.release(&message, false) {
                        tracing::warn!(error = %err, "unlock after parent loss failed");
                    }
                }
            }
        }
        for tick in outcomes.expired {
            metrics::counter!("felix_remote_tick_expired_total").increment(1);
            if let Some(parent) = &parent {
                parent.request_expired(self.requester, tick);
            }
        }
        if let (Some(reason), Some(parent)) = (outcomes.closed, &parent) {
            parent.point_closed(self.requester, reason);
        }
    }
}

impl ConsumerPointHandle for RemoteConsumerPoint {
    fn offer(&self, message: &Arc<StoredMessage>) -> Offer {
        let mut outcomes = Outcomes::default();
        let offer = {
            let mut state = self.state.lock();
            if state.closed {
                return Offer::Refused;
            }
            let Some((tick, request)) = state
                .requests
                .front()
                .map(|(tick, request)| (tick, Arc::clone(request)))
            else {
                return Offer::Refused;
            };
            let offer = match self.key.try_lock(message) {
                Ok(Some(locked)) => {
                    self.resolve_satisfied(&mut state, tick, &request, locked, &mut outcomes);
                    Offer::Accepted
                }
                Ok(None) => Offer::Taken,
                Err(err) => {
                    tracing::warn!(
                        requester = %self.requester,
                        error = %err,
                        "lock on offered message failed",
                    );
                    Offer::Refused
                }
            };
            // The dispatcher withdrew the key; publish it again if still wanted.
            self.settle(&mut state, &mut outcomes);
            offer
        };
        self.complete(outcomes);
        offer
    }

    fn messages_available(&self) {
        let mut outcomes = Outcomes::default();
        self.settle(&mut self.state.lock(), &mut outcomes);
        self.complete(outcomes);
    }

    fn notify_closed(&self, reason: DetachReason) {
        let mut outcomes = Outcomes::default();
        self.shut(&mut self.state.lock(), reason, &mut outcomes);
        self.complete(outcomes);
    }
}

impl fmt::Debug for RemoteConsumerPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("RemoteConsumerPoint")
            .field("requester", &self.requester)
            .field("outstanding", &state.requests.len())
            .field("closed", &state.closed)
            .finish_non_exhaustive()
    }
}
